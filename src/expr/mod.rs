//! Predicate parsing for rule conditions
//!
//! A predicate is a closed boolean expression over rule variables:
//! - Comparisons (`=`, `!=`, `<`, `<=`, `>`, `>=`), `BETWEEN`, `IN (...)`
//! - Arithmetic (`+`, `-`, `*`, `/`, `%`) and unary `-`/`+`
//! - Boolean connectives `AND`, `OR`, `NOT`
//! - The function whitelist `abs`, `min`, `max`
//!
//! Rule authors write conditions in a loose native syntax (`&`, `|`, `!`,
//! `==`, double-quoted strings). That syntax is normalized first, then the
//! text is parsed with sqlparser as the projection of `SELECT <predicate>`
//! and lowered into [`Expr`]. Anything outside the grammar is rejected here,
//! at rule-authoring time, so evaluation never sees unknown constructs.
//!
//! References:
//! - sqlparser-rs: <https://docs.rs/sqlparser>

mod eval;

pub use eval::Bindings;

use crate::value::Value;
use crate::{Error, Result};
use sqlparser::ast::{
    self, BinaryOperator, FunctionArg, FunctionArgExpr, FunctionArguments, SelectItem, SetExpr,
    Statement, UnaryOperator,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::fmt;

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation
    Neg,
    /// Arithmetic identity
    Plus,
    /// Logical negation
    Not,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `=`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// Logical conjunction
    And,
    /// Logical disjunction
    Or,
}

/// Whitelisted functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// Absolute value (one argument)
    Abs,
    /// Minimum of one or more arguments
    Min,
    /// Maximum of one or more arguments
    Max,
}

/// Closed expression AST evaluated by a tree-walking interpreter
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant
    Literal(Value),
    /// Rule variable, resolved through the bindings
    Variable(String),
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        expr: Box<Expr>,
    },
    /// Binary operation
    Binary {
        /// Left operand
        left: Box<Expr>,
        /// Operator
        op: BinaryOp,
        /// Right operand
        right: Box<Expr>,
    },
    /// Whitelisted function call
    Call {
        /// Function
        func: Function,
        /// Arguments
        args: Vec<Expr>,
    },
    /// `expr [NOT] BETWEEN low AND high`
    Between {
        /// Tested value
        expr: Box<Expr>,
        /// Lower bound (inclusive)
        low: Box<Expr>,
        /// Upper bound (inclusive)
        high: Box<Expr>,
        /// `NOT BETWEEN`
        negated: bool,
    },
    /// `expr [NOT] IN (a, b, ...)`
    InList {
        /// Tested value
        expr: Box<Expr>,
        /// Candidates
        list: Vec<Expr>,
        /// `NOT IN`
        negated: bool,
    },
}

impl Expr {
    fn collect_variables<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Self::Literal(_) => {}
            Self::Variable(name) => {
                out.insert(name);
            }
            Self::Unary { expr, .. } => expr.collect_variables(out),
            Self::Binary { left, right, .. } => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
            Self::Call { args, .. } => args.iter().for_each(|a| a.collect_variables(out)),
            Self::Between {
                expr, low, high, ..
            } => {
                expr.collect_variables(out);
                low.collect_variables(out);
                high.collect_variables(out);
            }
            Self::InList { expr, list, .. } => {
                expr.collect_variables(out);
                list.iter().for_each(|a| a.collect_variables(out));
            }
        }
    }
}

/// A parsed, validated predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    source: String,
    expr: Expr,
    variables: Vec<String>,
}

impl Predicate {
    /// Parse a predicate written in rule syntax.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseError`] if the text is empty, is not a single
    /// expression, or uses a construct outside the predicate grammar.
    ///
    /// # Example
    /// ```
    /// use rubric_engine::expr::Predicate;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let p = Predicate::parse("cadd > 20 & abs(z) >= 2")?;
    /// assert_eq!(p.variables(), ["cadd", "z"]);
    /// # Ok(())
    /// # }
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let source = text.trim();
        if source.is_empty() {
            return Err(Error::ParseError("empty predicate".to_string()));
        }

        let normalized = normalize(source)?;
        let sql = format!("SELECT {normalized}");
        let statements = Parser::parse_sql(&GenericDialect {}, &sql)
            .map_err(|e| Error::ParseError(format!("`{source}`: {e}")))?;

        if statements.len() != 1 {
            return Err(Error::ParseError(format!(
                "`{source}`: expected a single expression"
            )));
        }
        let Statement::Query(query) = &statements[0] else {
            return Err(Error::ParseError(format!(
                "`{source}`: expected an expression"
            )));
        };
        if query.order_by.is_some() || query.limit.is_some() || query.with.is_some() {
            return Err(Error::ParseError(format!(
                "`{source}`: unexpected query clause"
            )));
        }
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(Error::ParseError(format!(
                "`{source}`: expected an expression"
            )));
        };
        if !select.from.is_empty() || select.selection.is_some() || select.projection.len() != 1
        {
            return Err(Error::ParseError(format!(
                "`{source}`: expected a single expression"
            )));
        }
        let SelectItem::UnnamedExpr(sql_expr) = &select.projection[0] else {
            return Err(Error::ParseError(format!(
                "`{source}`: aliases and wildcards are not allowed"
            )));
        };

        let expr = lower(sql_expr)?;
        let mut vars = BTreeSet::new();
        expr.collect_variables(&mut vars);
        let variables = vars.into_iter().map(str::to_string).collect();

        Ok(Self {
            source: source.to_string(),
            expr,
            variables,
        })
    }

    /// Original predicate text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Lowered expression tree.
    #[must_use]
    pub const fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Variables referenced by the predicate, sorted and de-duplicated.
    #[must_use]
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Constant value for `TRUE`/`FALSE` predicates.
    #[must_use]
    pub const fn constant(&self) -> Option<bool> {
        match self.expr {
            Expr::Literal(Value::Bool(b)) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Rewrite native rule syntax into the SQL expression dialect.
///
/// Quoted text is copied through untouched (double-quoted strings become
/// single-quoted literals).
fn normalize(text: &str) -> Result<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\'' => {
                let end = closing_quote(&chars, i, '\'').ok_or_else(|| {
                    Error::ParseError(format!("`{text}`: unterminated string literal"))
                })?;
                out.extend(&chars[i..=end]);
                i = end + 1;
            }
            '"' => {
                let end = closing_quote(&chars, i, '"').ok_or_else(|| {
                    Error::ParseError(format!("`{text}`: unterminated string literal"))
                })?;
                out.push('\'');
                for &ch in &chars[i + 1..end] {
                    if ch == '\'' {
                        out.push('\'');
                    }
                    out.push(ch);
                }
                out.push('\'');
                i = end + 1;
            }
            '&' => {
                out.push_str(" AND ");
                i += if next == Some('&') { 2 } else { 1 };
            }
            '|' => {
                out.push_str(" OR ");
                i += if next == Some('|') { 2 } else { 1 };
            }
            '=' if next == Some('=') => {
                out.push_str(" = ");
                i += 2;
            }
            '!' if next == Some('=') => {
                out.push_str(" != ");
                i += 2;
            }
            '!' => {
                out.push_str(" NOT ");
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(out)
}

fn closing_quote(chars: &[char], open: usize, quote: char) -> Option<usize> {
    let mut j = open + 1;
    while j < chars.len() {
        if chars[j] == quote {
            if quote == '\'' && chars.get(j + 1) == Some(&'\'') {
                j += 2;
                continue;
            }
            return Some(j);
        }
        j += 1;
    }
    None
}

fn lower(expr: &ast::Expr) -> Result<Expr> {
    match expr {
        ast::Expr::Nested(inner) => lower(inner),
        ast::Expr::Identifier(ident) => Ok(Expr::Variable(ident.value.clone())),
        ast::Expr::CompoundIdentifier(parts) => Ok(Expr::Variable(
            parts
                .iter()
                .map(|p| p.value.as_str())
                .collect::<Vec<_>>()
                .join("."),
        )),
        ast::Expr::Value(value) => lower_literal(value),
        ast::Expr::UnaryOp { op, expr } => {
            let op = match op {
                UnaryOperator::Minus => UnaryOp::Neg,
                UnaryOperator::Plus => UnaryOp::Plus,
                UnaryOperator::Not => UnaryOp::Not,
                other => return Err(unsupported(&format!("operator {other}"))),
            };
            Ok(Expr::Unary {
                op,
                expr: Box::new(lower(expr)?),
            })
        }
        ast::Expr::BinaryOp { left, op, right } => {
            let op = match op {
                BinaryOperator::Plus => BinaryOp::Add,
                BinaryOperator::Minus => BinaryOp::Sub,
                BinaryOperator::Multiply => BinaryOp::Mul,
                BinaryOperator::Divide => BinaryOp::Div,
                BinaryOperator::Modulo => BinaryOp::Mod,
                BinaryOperator::Eq => BinaryOp::Eq,
                BinaryOperator::NotEq => BinaryOp::NotEq,
                BinaryOperator::Lt => BinaryOp::Lt,
                BinaryOperator::LtEq => BinaryOp::LtEq,
                BinaryOperator::Gt => BinaryOp::Gt,
                BinaryOperator::GtEq => BinaryOp::GtEq,
                BinaryOperator::And => BinaryOp::And,
                BinaryOperator::Or => BinaryOp::Or,
                other => return Err(unsupported(&format!("operator {other}"))),
            };
            Ok(Expr::Binary {
                left: Box::new(lower(left)?),
                op,
                right: Box::new(lower(right)?),
            })
        }
        ast::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(Expr::Between {
            expr: Box::new(lower(expr)?),
            low: Box::new(lower(low)?),
            high: Box::new(lower(high)?),
            negated: *negated,
        }),
        ast::Expr::InList {
            expr,
            list,
            negated,
        } => Ok(Expr::InList {
            expr: Box::new(lower(expr)?),
            list: list.iter().map(lower).collect::<Result<_>>()?,
            negated: *negated,
        }),
        ast::Expr::Function(func) => lower_call(func),
        other => Err(unsupported(&other.to_string())),
    }
}

fn lower_literal(value: &ast::Value) -> Result<Expr> {
    let literal = match value {
        ast::Value::Number(n, _) => {
            let parsed: f64 = n
                .parse()
                .map_err(|_| Error::ParseError(format!("invalid number literal `{n}`")))?;
            Value::Number(parsed)
        }
        ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
            Value::Text(s.clone())
        }
        ast::Value::Boolean(b) => Value::Bool(*b),
        ast::Value::Null => Value::Null,
        other => return Err(unsupported(&format!("literal {other}"))),
    };
    Ok(Expr::Literal(literal))
}

fn lower_call(func: &ast::Function) -> Result<Expr> {
    let name = func.name.to_string().to_lowercase();
    let function = match name.as_str() {
        "abs" => Function::Abs,
        "min" => Function::Min,
        "max" => Function::Max,
        _ => return Err(unsupported(&format!("function {name}"))),
    };

    let FunctionArguments::List(list) = &func.args else {
        return Err(unsupported(&format!("call syntax for {name}")));
    };
    if func.filter.is_some() || func.over.is_some() || !list.clauses.is_empty() {
        return Err(unsupported(&format!("call syntax for {name}")));
    }

    let args = list
        .args
        .iter()
        .map(|arg| match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => lower(e),
            other => Err(unsupported(&format!("argument {other}"))),
        })
        .collect::<Result<Vec<_>>>()?;

    let arity_ok = match function {
        Function::Abs => args.len() == 1,
        Function::Min | Function::Max => !args.is_empty(),
    };
    if !arity_ok {
        return Err(Error::ParseError(format!(
            "wrong number of arguments for {name}: {}",
            args.len()
        )));
    }

    Ok(Expr::Call {
        func: function,
        args,
    })
}

fn unsupported(what: &str) -> Error {
    Error::ParseError(format!("unsupported construct: {what}"))
}
