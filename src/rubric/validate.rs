//! Rubric/dataset compatibility checks
//!
//! A rule is compatible when every column its mapping needs exists in the
//! dataset. A rubric passes when at least one active rule is compatible.

use super::Rubric;
use crate::rule::Rule;
use serde::Serialize;
use std::collections::BTreeSet;

/// Overall verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompatibilityStatus {
    /// At least one rule can run against the dataset
    Pass,
    /// No rule can run against the dataset
    Failure,
    /// Nothing to validate
    Empty,
}

/// Per-rule compatibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleCompatibility {
    /// Rule identifier
    pub rule_id: String,
    /// Rule name
    pub rule_name: String,
    /// Columns the rule reads
    pub required_columns: Vec<String>,
    /// Required columns present in the dataset
    pub available_columns: Vec<String>,
    /// Required columns absent from the dataset
    pub missing_columns: Vec<String>,
    /// Whether nothing is missing
    pub compatible: bool,
}

/// Compatibility report for a rubric (or a set of rules)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompatibilityReport {
    /// Verdict
    pub status: CompatibilityStatus,
    /// Rules checked
    pub total_rules: usize,
    /// Rules with every column present
    pub compatible_rules: usize,
    /// `compatible_rules / total_rules × 100`, one decimal
    pub compatibility_percentage: f64,
    /// Union of missing columns
    pub missing_columns: BTreeSet<String>,
    /// Per-rule detail
    pub rules: Vec<RuleCompatibility>,
    /// Human-readable summary
    pub message: String,
}

impl CompatibilityReport {
    /// Whether the rubric can be run.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status == CompatibilityStatus::Pass
    }
}

/// Check a rubric's active rules against dataset columns.
#[must_use]
pub fn check_compatibility<S: AsRef<str>>(rubric: &Rubric, columns: &[S]) -> CompatibilityReport {
    check_rules(rubric.active_rules().map(|l| l.rule().as_ref()), columns)
}

/// Check arbitrary rules against dataset columns.
#[must_use]
pub fn check_rules<'a, I, S>(rules: I, columns: &[S]) -> CompatibilityReport
where
    I: IntoIterator<Item = &'a Rule>,
    S: AsRef<str>,
{
    let available: BTreeSet<&str> = columns.iter().map(AsRef::as_ref).collect();
    let rules: Vec<RuleCompatibility> = rules
        .into_iter()
        .map(|rule| {
            let required = rule.required_columns();
            let (present, absent): (Vec<&str>, Vec<&str>) =
                required.iter().partition(|c| available.contains(*c));
            RuleCompatibility {
                rule_id: rule.id().to_string(),
                rule_name: rule.name().to_string(),
                required_columns: required.iter().map(ToString::to_string).collect(),
                available_columns: present.iter().map(ToString::to_string).collect(),
                compatible: absent.is_empty(),
                missing_columns: absent.iter().map(ToString::to_string).collect(),
            }
        })
        .collect();

    let total_rules = rules.len();
    if total_rules == 0 {
        return CompatibilityReport {
            status: CompatibilityStatus::Empty,
            total_rules,
            compatible_rules: 0,
            compatibility_percentage: 0.0,
            missing_columns: BTreeSet::new(),
            rules,
            message: "No rules to validate".to_string(),
        };
    }

    let compatible_rules = rules.iter().filter(|r| r.compatible).count();
    #[allow(clippy::cast_precision_loss)]
    let percentage = compatible_rules as f64 / total_rules as f64 * 100.0;
    let missing_columns = rules
        .iter()
        .flat_map(|r| r.missing_columns.iter().cloned())
        .collect();

    let status = if compatible_rules >= 1 {
        CompatibilityStatus::Pass
    } else {
        CompatibilityStatus::Failure
    };
    let message = match compatible_rules {
        0 => "No rules are compatible with dataset columns".to_string(),
        1 if total_rules > 1 => "Only 1 rule is compatible with dataset columns".to_string(),
        n if percentage > 80.0 => {
            format!("Excellent compatibility: {n}/{total_rules} rules are compatible")
        }
        n if percentage > 60.0 => {
            format!("Good compatibility: {n}/{total_rules} rules are compatible")
        }
        n => format!("Limited compatibility: {n}/{total_rules} rules are compatible"),
    };

    CompatibilityReport {
        status,
        total_rules,
        compatible_rules,
        compatibility_percentage: (percentage * 10.0).round() / 10.0,
        missing_columns,
        rules,
        message,
    }
}
