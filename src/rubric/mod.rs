//! Rubrics: weighted, ordered bundles of rules
//!
//! A rubric's score for a record is Σ(score × weight) over its active rules
//! in `order_index` order ([`AggregationMode::Weighted`]), or the plain sum
//! of rule scores ([`AggregationMode::Unweighted`]). Null rule scores
//! contribute 0 in both modes.

mod validate;

pub use validate::{
    check_compatibility, check_rules, CompatibilityReport, CompatibilityStatus, RuleCompatibility,
};

use crate::dataset::Record;
use crate::rule::{Rule, RuleTrace};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;
use std::sync::Arc;

/// How rule scores combine into a rubric total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    /// Σ(score × weight)
    #[default]
    Weighted,
    /// Σ(score), weights ignored
    Unweighted,
}

impl std::fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Weighted => write!(f, "weighted"),
            Self::Unweighted => write!(f, "unweighted"),
        }
    }
}

/// Source of rule definitions, looked up by id.
pub trait RuleCatalog {
    /// Rule with this id, if known.
    fn rule(&self, id: &str) -> Option<Arc<Rule>>;
}

impl<S: BuildHasher> RuleCatalog for HashMap<String, Arc<Rule>, S> {
    fn rule(&self, id: &str) -> Option<Arc<Rule>> {
        self.get(id).cloned()
    }
}

impl RuleCatalog for BTreeMap<String, Arc<Rule>> {
    fn rule(&self, id: &str) -> Option<Arc<Rule>> {
        self.get(id).cloned()
    }
}

impl RuleCatalog for [Arc<Rule>] {
    fn rule(&self, id: &str) -> Option<Arc<Rule>> {
        self.iter().find(|r| r.id() == id).cloned()
    }
}

/// Association of a rule with a rubric
#[derive(Debug, Clone, PartialEq)]
pub struct RubricRule {
    rule: Arc<Rule>,
    weight: f64,
    order_index: i64,
    active: bool,
}

impl RubricRule {
    /// Link a rule with a weight and position.
    #[must_use]
    pub fn new(rule: Arc<Rule>, weight: f64, order_index: i64) -> Self {
        Self {
            rule,
            weight,
            order_index,
            active: true,
        }
    }

    /// Set the link's active flag.
    #[must_use]
    pub const fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Linked rule.
    #[must_use]
    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    /// Link weight.
    #[must_use]
    pub const fn weight(&self) -> f64 {
        self.weight
    }

    /// Execution/column position.
    #[must_use]
    pub const fn order_index(&self) -> i64 {
        self.order_index
    }

    /// Whether both the link and the rule are active.
    #[must_use]
    pub fn is_effective(&self) -> bool {
        self.active && self.rule.is_active()
    }

    /// Link active flag, independent of the rule's own flag.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Weight applied under `mode`.
    #[must_use]
    pub const fn effective_weight(&self, mode: AggregationMode) -> f64 {
        match mode {
            AggregationMode::Weighted => self.weight,
            AggregationMode::Unweighted => 1.0,
        }
    }
}

/// One rule's contribution to a rubric score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberScore {
    /// Rule identifier
    pub rule_id: String,
    /// Rule name
    pub rule_name: String,
    /// Raw rule score
    pub score: Option<f64>,
    /// Weight applied under the aggregation mode
    pub weight: f64,
    /// `score × weight`, `None` when the score is null
    pub weighted_score: Option<f64>,
}

/// Rubric score with its per-rule breakdown
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RubricScore {
    /// Aggregate total
    pub total: f64,
    /// Active rules in execution order
    pub members: Vec<MemberScore>,
}

/// Weighted, ordered collection of rules
#[derive(Debug, Clone, PartialEq)]
pub struct Rubric {
    id: String,
    name: String,
    description: Option<String>,
    links: Vec<RubricRule>,
}

impl Rubric {
    /// Create a builder.
    #[must_use]
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> RubricBuilder {
        RubricBuilder::new(id, name)
    }

    /// Resolve a definition against a rule catalogue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if a referenced rule id is unknown or a
    /// weight is not finite.
    pub fn from_definition<C: RuleCatalog + ?Sized>(
        def: &RubricDefinition,
        catalog: &C,
    ) -> Result<Self> {
        let mut builder = Self::builder(def.id.clone(), def.name.clone());
        builder.description.clone_from(&def.description);
        for (position, link) in def.rules.iter().enumerate() {
            let rule = catalog.rule(&link.rule_id).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "rubric {} references unknown rule {}",
                    def.id, link.rule_id
                ))
            })?;
            let weight = link.weight.unwrap_or_else(|| rule.weight());
            #[allow(clippy::cast_possible_wrap)]
            let order = link.order_index.unwrap_or(position as i64);
            builder = builder.link(RubricRule::new(rule, weight, order).with_active(link.active));
        }
        builder.build()
    }

    /// Rubric identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Rubric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// All links, sorted by `order_index`.
    #[must_use]
    pub fn links(&self) -> &[RubricRule] {
        &self.links
    }

    /// Links whose rule and link are both active, in execution order.
    pub fn active_rules(&self) -> impl Iterator<Item = &RubricRule> {
        self.links.iter().filter(|l| l.is_effective())
    }

    /// Number of active rules.
    #[must_use]
    pub fn active_rule_count(&self) -> usize {
        self.active_rules().count()
    }

    /// Score one record.
    #[must_use]
    pub fn score<R: Record + ?Sized>(&self, record: &R, mode: AggregationMode) -> f64 {
        self.active_rules()
            .map(|link| {
                link.rule()
                    .score(record)
                    .filter(|s| !s.is_nan())
                    .map_or(0.0, |s| s * link.effective_weight(mode))
            })
            .sum()
    }

    /// Score one record, keeping each rule's contribution.
    #[must_use]
    pub fn score_detailed<R: Record + ?Sized>(
        &self,
        record: &R,
        mode: AggregationMode,
    ) -> RubricScore {
        let members: Vec<MemberScore> = self
            .active_rules()
            .map(|link| {
                let score = link.rule().score(record).filter(|s| !s.is_nan());
                let weight = link.effective_weight(mode);
                MemberScore {
                    rule_id: link.rule().id().to_string(),
                    rule_name: link.rule().name().to_string(),
                    score,
                    weight,
                    weighted_score: score.map(|s| s * weight),
                }
            })
            .collect();
        let total = members.iter().filter_map(|m| m.weighted_score).sum();
        RubricScore { total, members }
    }

    /// Score one record with full clause traces.
    #[must_use]
    pub fn explain<R: Record + ?Sized>(&self, record: &R, mode: AggregationMode) -> RubricTrace {
        let rules: Vec<RubricRuleTrace> = self
            .active_rules()
            .map(|link| {
                let trace = link.rule().explain(record);
                let weight = link.effective_weight(mode);
                let weighted_score = trace.score.filter(|s| !s.is_nan()).map(|s| s * weight);
                RubricRuleTrace {
                    weight,
                    weighted_score,
                    rule: trace,
                }
            })
            .collect();
        let total = rules.iter().filter_map(|r| r.weighted_score).sum();

        RubricTrace {
            rubric_id: self.id.clone(),
            rubric_name: self.name.clone(),
            mode,
            rules,
            total,
        }
    }
}

/// Builder for [`Rubric`]
#[derive(Debug, Clone)]
pub struct RubricBuilder {
    id: String,
    name: String,
    description: Option<String>,
    links: Vec<RubricRule>,
}

impl RubricBuilder {
    /// Create a builder with required fields.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            links: Vec::new(),
        }
    }

    /// Link a rule.
    #[must_use]
    pub fn rule(self, rule: impl Into<Arc<Rule>>, weight: f64, order_index: i64) -> Self {
        self.link(RubricRule::new(rule.into(), weight, order_index))
    }

    /// Add a prepared link.
    #[must_use]
    pub fn link(mut self, link: RubricRule) -> Self {
        self.links.push(link);
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Build the rubric; links are stably sorted by `order_index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty id or a non-finite weight.
    pub fn build(mut self) -> Result<Rubric> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidInput("rubric id is empty".to_string()));
        }
        if let Some(bad) = self.links.iter().find(|l| !l.weight.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "rubric {} has non-finite weight for rule {}",
                self.id,
                bad.rule.id()
            )));
        }
        self.links.sort_by_key(RubricRule::order_index);

        Ok(Rubric {
            id: self.id,
            name: self.name,
            description: self.description,
            links: self.links,
        })
    }
}

const fn default_active() -> bool {
    true
}

/// Serializable rubric → rule link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricRuleDefinition {
    /// Referenced rule id
    pub rule_id: String,
    /// Link weight; defaults to the rule's own weight
    #[serde(default)]
    pub weight: Option<f64>,
    /// Position; defaults to the link's index in the list
    #[serde(default)]
    pub order_index: Option<i64>,
    /// Link active flag
    #[serde(default = "default_active")]
    pub active: bool,
}

/// Serializable rubric definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricDefinition {
    /// Rubric identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Rule links
    #[serde(default)]
    pub rules: Vec<RubricRuleDefinition>,
}

/// One rule's trace within a rubric trace
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RubricRuleTrace {
    /// Rule trace
    pub rule: RuleTrace,
    /// Weight applied
    pub weight: f64,
    /// Contribution to the total
    pub weighted_score: Option<f64>,
}

/// Full trace of scoring one record with a rubric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RubricTrace {
    /// Rubric identifier
    pub rubric_id: String,
    /// Rubric name
    pub rubric_name: String,
    /// Aggregation mode used
    pub mode: AggregationMode,
    /// Active rules in execution order
    pub rules: Vec<RubricRuleTrace>,
    /// Aggregate total
    pub total: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn constant_rule(id: &str, score: &str) -> Arc<Rule> {
        Arc::new(
            Rule::builder(id, id.to_uppercase())
                .condition(format!("TRUE ~ {score}"))
                .build()
                .unwrap(),
        )
    }

    fn empty_record() -> HashMap<String, Value> {
        HashMap::new()
    }

    #[test]
    fn test_weighted_total_skips_null() {
        let rubric = Rubric::builder("rb", "rubric")
            .rule(constant_rule("a", "3"), 2.0, 0)
            .rule(constant_rule("b", "NA_real_"), 1.0, 1)
            .build()
            .unwrap();
        assert!((rubric.score(&empty_record(), AggregationMode::Weighted) - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_unweighted_ignores_weights() {
        let rubric = Rubric::builder("rb", "rubric")
            .rule(constant_rule("a", "3"), 2.0, 0)
            .rule(constant_rule("b", "4"), 10.0, 1)
            .build()
            .unwrap();
        let record = empty_record();
        assert!((rubric.score(&record, AggregationMode::Unweighted) - 7.0).abs() < 1e-12);
        assert!((rubric.score(&record, AggregationMode::Weighted) - 46.0).abs() < 1e-12);
    }

    #[test]
    fn test_inactive_links_and_rules_skipped() {
        let inactive_rule = Arc::new(
            Rule::builder("c", "C")
                .condition("TRUE ~ 100")
                .active(false)
                .build()
                .unwrap(),
        );
        let rubric = Rubric::builder("rb", "rubric")
            .rule(constant_rule("a", "1"), 1.0, 0)
            .link(RubricRule::new(constant_rule("b", "50"), 1.0, 1).with_active(false))
            .rule(inactive_rule, 1.0, 2)
            .build()
            .unwrap();
        assert_eq!(rubric.active_rule_count(), 1);
        assert!((rubric.score(&empty_record(), AggregationMode::Weighted) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_order_index_sorting_is_stable() {
        let rubric = Rubric::builder("rb", "rubric")
            .rule(constant_rule("z", "1"), 1.0, 5)
            .rule(constant_rule("a", "1"), 1.0, 1)
            .rule(constant_rule("m", "1"), 1.0, 5)
            .build()
            .unwrap();
        let ids: Vec<_> = rubric.active_rules().map(|l| l.rule().id()).collect();
        assert_eq!(ids, vec!["a", "z", "m"]);
    }

    #[test]
    fn test_score_detailed_matches_score() {
        let rubric = Rubric::builder("rb", "rubric")
            .rule(constant_rule("a", "3"), 2.0, 0)
            .rule(constant_rule("b", "NA"), 1.0, 1)
            .build()
            .unwrap();
        let detail = rubric.score_detailed(&empty_record(), AggregationMode::Weighted);
        assert!((detail.total - 6.0).abs() < 1e-12);
        assert_eq!(detail.members[1].score, None);
        assert_eq!(detail.members[1].weighted_score, None);
        assert_eq!(detail.members[0].weighted_score, Some(6.0));
    }

    #[test]
    fn test_explain_total() {
        let rubric = Rubric::builder("rb", "rubric")
            .rule(constant_rule("a", "3"), 2.0, 0)
            .build()
            .unwrap();
        let trace = rubric.explain(&empty_record(), AggregationMode::Unweighted);
        assert!((trace.total - 3.0).abs() < 1e-12);
        assert!((trace.rules[0].weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_from_definition() {
        let catalog: HashMap<String, Arc<Rule>> = [constant_rule("a", "2"), constant_rule("b", "5")]
            .into_iter()
            .map(|r| (r.id().to_string(), r))
            .collect();
        let def: RubricDefinition = serde_json::from_str(
            r#"{"id": "rb", "name": "R", "rules": [
                {"rule_id": "b", "weight": 0.5, "order_index": 2},
                {"rule_id": "a", "order_index": 1}
            ]}"#,
        )
        .unwrap();
        let rubric = Rubric::from_definition(&def, &catalog).unwrap();
        let ids: Vec<_> = rubric.links().iter().map(|l| l.rule().id()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!((rubric.score(&empty_record(), AggregationMode::Weighted) - 4.5).abs() < 1e-12);

        let missing = RubricDefinition {
            rules: vec![RubricRuleDefinition {
                rule_id: "nope".to_string(),
                weight: None,
                order_index: None,
                active: true,
            }],
            ..def
        };
        assert!(Rubric::from_definition(&missing, &catalog).is_err());
    }
}
