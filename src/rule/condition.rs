//! Condition clause parsing
//!
//! A rule's condition text is an ordered list of `<predicate> ~ <score>`
//! clauses, evaluated top to bottom; the first true predicate wins.

use crate::expr::Predicate;
use crate::{Error, Result};
use serde::Serialize;

/// Separator between predicate and score in a clause
pub const CLAUSE_DELIMITER: char = '~';

/// Score literals meaning "no score"
const NULL_SENTINELS: [&str; 5] = ["na_real_", "na", "nan", "null", "none"];

/// One parsed `(predicate, score)` clause
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    predicate: Predicate,
    score: Option<f64>,
}

impl Condition {
    /// Parse a single clause.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConditionSyntax`] if the delimiter is missing, either
    /// side is empty, the score literal is not a number or null sentinel, or
    /// the predicate does not parse.
    pub fn parse(clause: &str) -> Result<Self> {
        let clause = clause.trim();
        let Some((lhs, rhs)) = clause.split_once(CLAUSE_DELIMITER) else {
            return Err(Error::condition(
                clause,
                format!("missing `{CLAUSE_DELIMITER}` between predicate and score"),
            ));
        };

        let lhs = lhs.trim();
        if lhs.is_empty() {
            return Err(Error::condition(clause, "empty predicate"));
        }

        let score = parse_score(rhs.trim()).ok_or_else(|| {
            Error::condition(clause, format!("invalid score literal `{}`", rhs.trim()))
        })?;

        let predicate =
            Predicate::parse(lhs).map_err(|e| Error::condition(clause, e.to_string()))?;

        Ok(Self { predicate, score })
    }

    /// Predicate of the clause.
    #[must_use]
    pub const fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Score yielded when the predicate matches (`None` = no score).
    #[must_use]
    pub const fn score(&self) -> Option<f64> {
        self.score
    }
}

/// Parse an ordered list of condition entries.
///
/// Each entry may hold several newline-separated clauses; blank lines are
/// skipped.
///
/// # Errors
///
/// Returns error for the first malformed clause, or if no clause is present.
pub fn parse_conditions<S: AsRef<str>>(entries: &[S]) -> Result<Vec<Condition>> {
    let conditions = entries
        .iter()
        .flat_map(|e| e.as_ref().lines())
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(Condition::parse)
        .collect::<Result<Vec<_>>>()?;

    if conditions.is_empty() {
        return Err(Error::condition("", "rule has no condition clauses"));
    }
    Ok(conditions)
}

fn parse_score(text: &str) -> Option<Option<f64>> {
    if text.is_empty() {
        return None;
    }
    let lower = text.to_ascii_lowercase();
    if NULL_SENTINELS.contains(&lower.as_str()) {
        return Some(None);
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite()).map(Some)
}

/// Serializable summary of a clause, used in traces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClauseSummary {
    /// Predicate text
    pub predicate: String,
    /// Score literal (`None` = no score)
    pub score: Option<f64>,
}

impl From<&Condition> for ClauseSummary {
    fn from(c: &Condition) -> Self {
        Self {
            predicate: c.predicate.source().to_string(),
            score: c.score,
        }
    }
}
