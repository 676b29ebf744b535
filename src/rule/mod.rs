//! Rules: ordered guarded clauses yielding one score per record
//!
//! ```
//! use rubric_engine::rule::Rule;
//! use rubric_engine::value::Value;
//! use std::collections::HashMap;
//!
//! # fn main() -> rubric_engine::Result<()> {
//! let rule = Rule::builder("r1", "cadd")
//!     .condition("x > 0.5 ~ 6")
//!     .condition("x > 0.1 ~ 2")
//!     .condition("TRUE ~ 0")
//!     .map("x", "variants.cadd")
//!     .build()?;
//!
//! let record = HashMap::from([("cadd".to_string(), Value::Number(0.7))]);
//! assert_eq!(rule.score(&record), Some(6.0));
//! # Ok(())
//! # }
//! ```

mod condition;
mod mapping;

pub use condition::{parse_conditions, ClauseSummary, Condition, CLAUSE_DELIMITER};
pub use mapping::{resolve_column, ColumnMapping};

use crate::dataset::Record;
use crate::value::Value;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Score when no clause matches
pub const DEFAULT_SCORE: f64 = 0.0;

/// Condition text as authored: one string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionText {
    /// Newline-separated clauses
    Text(String),
    /// One or more clauses per entry
    List(Vec<String>),
}

impl ConditionText {
    fn entries(&self) -> &[String] {
        match self {
            Self::Text(s) => std::slice::from_ref(s),
            Self::List(v) => v,
        }
    }
}

const fn default_weight() -> f64 {
    1.0
}

const fn default_active() -> bool {
    true
}

/// Serializable rule definition as stored by the rule catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Rule identifier
    pub id: String,
    /// Display name (also the score column label)
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Ordered condition clauses
    pub conditions: ConditionText,
    /// Variable → column mapping
    #[serde(default)]
    pub column_mapping: BTreeMap<String, String>,
    /// Default weight inside a rubric
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Inactive rules are skipped by rubrics
    #[serde(default = "default_active")]
    pub active: bool,
}

/// Immutable, validated rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    id: String,
    name: String,
    description: Option<String>,
    conditions: Vec<Condition>,
    mapping: ColumnMapping,
    weight: f64,
    active: bool,
}

impl Rule {
    /// Create a builder.
    #[must_use]
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> RuleBuilder {
        RuleBuilder::new(id, name)
    }

    /// Rule identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Parsed clauses in evaluation order.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Column mapping.
    #[must_use]
    pub const fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    /// Default rubric weight.
    #[must_use]
    pub const fn weight(&self) -> f64 {
        self.weight
    }

    /// Whether the rule is active.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Dataset columns this rule reads.
    #[must_use]
    pub fn required_columns(&self) -> Vec<&str> {
        self.mapping.columns()
    }

    /// Predicate variables that have no column mapping; they never bind.
    #[must_use]
    pub fn unmapped_variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = self
            .conditions
            .iter()
            .flat_map(|c| c.predicate().variables())
            .map(String::as_str)
            .filter(|v| self.mapping.column_for(v).is_none())
            .collect();
        vars.sort_unstable();
        vars.dedup();
        vars
    }

    /// Score one record: the score of the first matching clause, or
    /// [`DEFAULT_SCORE`] if none match. `None` means a clause matched whose
    /// score is the null sentinel.
    #[must_use]
    pub fn score<R: Record + ?Sized>(&self, record: &R) -> Option<f64> {
        let bindings = self.mapping.bind(record);
        self.conditions
            .iter()
            .find(|c| c.predicate().evaluate(&bindings))
            .map_or(Some(DEFAULT_SCORE), Condition::score)
    }

    /// Score one record and report how every clause evaluated.
    #[must_use]
    pub fn explain<R: Record + ?Sized>(&self, record: &R) -> RuleTrace {
        let bindings = self.mapping.bind(record);
        let clauses: Vec<ClauseTrace> = self
            .conditions
            .iter()
            .map(|c| ClauseTrace {
                clause: c.into(),
                matched: c.predicate().evaluate(&bindings),
            })
            .collect();
        let matched_clause = clauses.iter().position(|c| c.matched);
        let score = matched_clause.map_or(Some(DEFAULT_SCORE), |i| clauses[i].clause.score);

        RuleTrace {
            rule_id: self.id.clone(),
            rule_name: self.name.clone(),
            bindings: bindings.into_iter().collect(),
            clauses,
            matched_clause,
            score,
        }
    }

    /// Definition form of this rule.
    #[must_use]
    pub fn to_definition(&self) -> RuleDefinition {
        RuleDefinition {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            conditions: ConditionText::List(
                self.conditions
                    .iter()
                    .map(|c| {
                        let score = c
                            .score()
                            .map_or_else(|| "NA_real_".to_string(), |s| s.to_string());
                        format!("{} {CLAUSE_DELIMITER} {score}", c.predicate().source())
                    })
                    .collect(),
            ),
            column_mapping: self.mapping.to_map(),
            weight: self.weight,
            active: self.active,
        }
    }
}

impl TryFrom<RuleDefinition> for Rule {
    type Error = crate::Error;

    fn try_from(def: RuleDefinition) -> Result<Self> {
        let mut builder = Self::builder(def.id, def.name)
            .weight(def.weight)
            .active(def.active);
        builder.description = def.description;
        builder.conditions = def.conditions.entries().to_vec();
        builder.mapping = def.column_mapping.into_iter().collect();
        builder.build()
    }
}

/// Builder for [`Rule`]. Clauses are parsed by [`RuleBuilder::build`].
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    id: String,
    name: String,
    description: Option<String>,
    conditions: Vec<String>,
    mapping: Vec<(String, String)>,
    weight: f64,
    active: bool,
}

impl RuleBuilder {
    /// Create a builder with required fields.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            conditions: Vec::new(),
            mapping: Vec::new(),
            weight: default_weight(),
            active: true,
        }
    }

    /// Append a clause (or several, newline-separated).
    #[must_use]
    pub fn condition(mut self, clause: impl Into<String>) -> Self {
        self.conditions.push(clause.into());
        self
    }

    /// Map a variable to a (possibly qualified) column.
    #[must_use]
    pub fn map(mut self, variable: impl Into<String>, column: impl Into<String>) -> Self {
        self.mapping.push((variable.into(), column.into()));
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Set the default rubric weight.
    #[must_use]
    pub const fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Set the active flag.
    #[must_use]
    pub const fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Parse clauses and build the rule.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ConditionSyntax`] for malformed clauses and
    /// [`crate::Error::InvalidInput`] for an empty id or a non-finite weight.
    pub fn build(self) -> Result<Rule> {
        if self.id.trim().is_empty() {
            return Err(crate::Error::InvalidInput("rule id is empty".to_string()));
        }
        if !self.weight.is_finite() {
            return Err(crate::Error::InvalidInput(format!(
                "rule {} has non-finite weight",
                self.id
            )));
        }

        let conditions = parse_conditions(&self.conditions)?;
        let rule = Rule {
            id: self.id,
            name: self.name,
            description: self.description,
            conditions,
            mapping: ColumnMapping::new(self.mapping),
            weight: self.weight,
            active: self.active,
        };

        let unmapped = rule.unmapped_variables();
        if !unmapped.is_empty() {
            tracing::warn!(
                rule = %rule.id,
                variables = ?unmapped,
                "predicate variables without column mapping"
            );
        }
        Ok(rule)
    }
}

/// Evaluation outcome of one clause
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClauseTrace {
    /// Clause as parsed
    #[serde(flatten)]
    pub clause: ClauseSummary,
    /// Whether the predicate was true
    pub matched: bool,
}

/// Full trace of scoring one record with one rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleTrace {
    /// Rule identifier
    pub rule_id: String,
    /// Rule name
    pub rule_name: String,
    /// Variable bindings for the record
    pub bindings: BTreeMap<String, Value>,
    /// Every clause in order
    pub clauses: Vec<ClauseTrace>,
    /// Index of the first matching clause
    pub matched_clause: Option<usize>,
    /// Resulting score
    pub score: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn example_rule() -> Rule {
        Rule::builder("r1", "example")
            .condition("x > 0.5 ~ 6")
            .condition("x > 0.1 ~ 2")
            .condition("TRUE ~ 0")
            .map("x", "x")
            .build()
            .unwrap()
    }

    fn record(x: Value) -> HashMap<String, Value> {
        HashMap::from([("x".to_string(), x)])
    }

    #[test]
    fn test_first_match_wins() {
        let rule = example_rule();
        assert_eq!(rule.score(&record(Value::Number(0.7))), Some(6.0));
        assert_eq!(rule.score(&record(Value::Number(0.3))), Some(2.0));
    }

    #[test]
    fn test_null_falls_through_to_catch_all() {
        let rule = example_rule();
        assert_eq!(rule.score(&record(Value::Null)), Some(0.0));
        assert_eq!(rule.score(&HashMap::<String, Value>::new()), Some(0.0));
    }

    #[test]
    fn test_no_match_defaults_to_zero() {
        let rule = Rule::builder("r2", "no catch-all")
            .condition("x > 10 ~ 5")
            .map("x", "x")
            .build()
            .unwrap();
        assert_eq!(rule.score(&record(Value::Number(1.0))), Some(0.0));
    }

    #[test]
    fn test_null_sentinel_score() {
        let rule = Rule::builder("r3", "sentinel")
            .condition("x > 0 ~ NA_real_")
            .condition("TRUE ~ 1")
            .map("x", "x")
            .build()
            .unwrap();
        assert_eq!(rule.score(&record(Value::Number(1.0))), None);
        assert_eq!(rule.score(&record(Value::Number(-1.0))), Some(1.0));
    }

    #[test]
    fn test_malformed_rule_rejected() {
        let err = Rule::builder("bad", "bad")
            .condition("x > 1")
            .build()
            .unwrap_err();
        assert!(matches!(err, crate::Error::ConditionSyntax { .. }));
        assert!(Rule::builder("", "x").condition("TRUE ~ 0").build().is_err());
        assert!(Rule::builder("w", "x")
            .condition("TRUE ~ 0")
            .weight(f64::NAN)
            .build()
            .is_err());
    }

    #[test]
    fn test_explain_reports_every_clause() {
        let trace = example_rule().explain(&record(Value::Number(0.3)));
        assert_eq!(trace.matched_clause, Some(1));
        assert_eq!(trace.score, Some(2.0));
        let matched: Vec<bool> = trace.clauses.iter().map(|c| c.matched).collect();
        assert_eq!(matched, vec![false, true, true]);
        assert_eq!(trace.bindings.get("x"), Some(&Value::Number(0.3)));
    }

    #[test]
    fn test_definition_roundtrip() {
        let json = r#"{
            "id": "r9",
            "name": "cadd_high",
            "conditions": "cadd > 20 ~ 3\nTRUE ~ 0",
            "column_mapping": {"cadd": "variants.cadd_phred"}
        }"#;
        let def: RuleDefinition = serde_json::from_str(json).unwrap();
        let rule = Rule::try_from(def).unwrap();
        assert_eq!(rule.conditions().len(), 2);
        assert!((rule.weight() - 1.0).abs() < f64::EPSILON);
        assert!(rule.is_active());
        assert_eq!(rule.required_columns(), vec!["cadd_phred"]);

        let again = Rule::try_from(rule.to_definition()).unwrap();
        assert_eq!(again, rule);
    }

    #[test]
    fn test_unmapped_variables() {
        let rule = Rule::builder("r", "r")
            .condition("a > 1 & b > 2 ~ 1")
            .map("a", "col_a")
            .build()
            .unwrap();
        assert_eq!(rule.unmapped_variables(), vec!["b"]);
    }
}
