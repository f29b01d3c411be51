//! Detection rules.
//!
//! Each rule scans one tree for a particular kind of gap and emits
//! [`PredictionCandidate`]s with its own confidence. Rules are read-only, never see
//! each other's output and are registered in a [`RuleRegistry`]; the scan orchestrator
//! runs every registered rule without knowing which ones exist.

mod age_family;
mod missing_union;
mod patronymic_name;
mod sibling_parent_gap;
mod spouse_child_gap;

pub use age_family::AgeFamilyRule;
pub use missing_union::MissingUnionRule;
pub use patronymic_name::{lineage_chain, PatronymicNameRule};
pub use sibling_parent_gap::SiblingParentGapRule;
pub use spouse_child_gap::SpouseChildGapRule;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::RuleConfig;
use crate::error::{GraphResult, PredictionError};
use crate::graph::{GenealogyGraph, ParentChildEdge, Person, Union};
use crate::storage::{PredictedType, PredictionKey};

/// Result type for rule detection.
pub type RuleResult<T> = Result<T, PredictionError>;

/// A proposed relationship produced by a rule. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionCandidate {
    /// Originating rule.
    pub rule_id: String,
    /// Proposed relationship kind.
    pub predicted_type: PredictedType,
    /// Proposed parent, or first partner.
    pub source_person_id: String,
    /// Proposed child, or second partner.
    pub target_person_id: String,
    /// Confidence in [0, 100].
    pub confidence: f64,
    /// Human-readable justification.
    pub explanation: String,
}

impl PredictionCandidate {
    /// Create a candidate.
    pub fn new(
        rule_id: impl Into<String>,
        predicted_type: PredictedType,
        source_person_id: impl Into<String>,
        target_person_id: impl Into<String>,
        confidence: f64,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            predicted_type,
            source_person_id: source_person_id.into(),
            target_person_id: target_person_id.into(),
            confidence,
            explanation: explanation.into(),
        }
    }

    /// Parent → child candidate.
    pub fn parent_child(
        rule_id: &str,
        parent_id: &str,
        child_id: &str,
        confidence: f64,
        explanation: impl Into<String>,
    ) -> Self {
        Self::new(
            rule_id,
            PredictedType::ParentChild,
            parent_id,
            child_id,
            confidence,
            explanation,
        )
    }

    /// Union candidate with the partners in canonical (lexicographic) order, so every
    /// rule flagging the same couple produces the same key.
    pub fn union(
        rule_id: &str,
        partner_a: &str,
        partner_b: &str,
        confidence: f64,
        explanation: impl Into<String>,
    ) -> Self {
        let (source, target) = if partner_a <= partner_b {
            (partner_a, partner_b)
        } else {
            (partner_b, partner_a)
        };
        Self::new(
            rule_id,
            PredictedType::Union,
            source,
            target,
            confidence,
            explanation,
        )
    }

    /// Grouping key.
    pub fn key(&self) -> PredictionKey {
        PredictionKey {
            source_person_id: self.source_person_id.clone(),
            target_person_id: self.target_person_id.clone(),
            predicted_type: self.predicted_type,
        }
    }
}

/// A gap-detection heuristic.
#[async_trait]
pub trait DetectionRule: Send + Sync {
    /// Stable rule identifier, recorded on every prediction it produces.
    fn id(&self) -> &'static str;

    /// Scan a tree. Returns an empty list when there is no evidence; errors are
    /// reserved for infrastructure failures.
    async fn detect(&self, tree_id: &str) -> RuleResult<Vec<PredictionCandidate>>;
}

/// What one rule contributed to a scan.
///
/// A failed rule carries [`PredictionError::RuleExecution`].
#[derive(Debug)]
pub struct RuleOutcome {
    pub rule_id: String,
    pub result: RuleResult<Vec<PredictionCandidate>>,
}

impl RuleOutcome {
    pub fn succeeded(rule_id: impl Into<String>, candidates: Vec<PredictionCandidate>) -> Self {
        Self {
            rule_id: rule_id.into(),
            result: Ok(candidates),
        }
    }

    pub fn failed(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        let rule_id = rule_id.into();
        Self {
            result: Err(PredictionError::RuleExecution {
                rule_id: rule_id.clone(),
                message: message.into(),
            }),
            rule_id,
        }
    }

    /// Candidates on success, nothing on failure.
    pub fn into_candidates(self) -> Vec<PredictionCandidate> {
        self.result.unwrap_or_default()
    }

    pub fn is_failure(&self) -> bool {
        self.result.is_err()
    }
}

/// Ordered set of detection rules.
///
/// Registration order is preserved and is the order in which outcomes reach the
/// aggregator.
#[derive(Default)]
pub struct RuleRegistry {
    rules: Vec<Arc<dyn DetectionRule>>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the five built-in rules.
    pub fn with_default_rules(graph: Arc<dyn GenealogyGraph>, config: &RuleConfig) -> Self {
        let mut registry = Self::new();

        let rules: [Arc<dyn DetectionRule>; 5] = [
            Arc::new(SpouseChildGapRule::new(graph.clone())),
            Arc::new(MissingUnionRule::new(graph.clone())),
            Arc::new(SiblingParentGapRule::new(graph.clone())),
            Arc::new(PatronymicNameRule::new(graph.clone())),
            Arc::new(AgeFamilyRule::new(graph, config.clone())),
        ];

        for rule in rules {
            let id = rule.id();
            if let Err(e) = registry.register(rule) {
                error!(
                    rule = id,
                    error = %e,
                    "Failed to register builtin rule - this indicates a programming error"
                );
            }
        }

        registry
    }

    /// Register a rule.
    ///
    /// # Errors
    /// Returns error if a rule with the same ID already exists.
    pub fn register(&mut self, rule: Arc<dyn DetectionRule>) -> Result<(), String> {
        if rule.id().is_empty() {
            return Err("Rule ID is required".to_string());
        }
        if self.rules.iter().any(|r| r.id() == rule.id()) {
            return Err(format!("Rule '{}' already exists", rule.id()));
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Registered rules in registration order.
    pub fn rules(&self) -> &[Arc<dyn DetectionRule>] {
        &self.rules
    }

    /// Registered rule ids in registration order.
    pub fn ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    pub fn count(&self) -> usize {
        self.rules.len()
    }
}

// ============================================================================
// Tree snapshot shared by the built-in rules
// ============================================================================

static NO_IDS: BTreeSet<String> = BTreeSet::new();

/// Indexed, read-only view of one tree.
///
/// Ordered maps keep rule output deterministic across scans of an unchanged tree.
#[derive(Debug, Default)]
pub struct TreeSnapshot {
    pub persons: BTreeMap<String, Person>,
    parents_of: BTreeMap<String, BTreeSet<String>>,
    children_of: BTreeMap<String, BTreeSet<String>>,
    partners_of: BTreeMap<String, BTreeSet<String>>,
    pub unions: Vec<Union>,
}

impl TreeSnapshot {
    /// Read persons, edges and unions of a tree.
    pub async fn load(graph: &dyn GenealogyGraph, tree_id: &str) -> GraphResult<Self> {
        let persons = graph.persons(tree_id).await?;
        let edges = graph.parent_child_edges(tree_id).await?;
        let unions = graph.unions(tree_id).await?;
        Ok(Self::from_parts(persons, edges, unions))
    }

    /// Build the indexes from raw graph records.
    pub fn from_parts(persons: Vec<Person>, edges: Vec<ParentChildEdge>, unions: Vec<Union>) -> Self {
        let mut snapshot = Self {
            persons: persons.into_iter().map(|p| (p.id.clone(), p)).collect(),
            ..Default::default()
        };

        for edge in edges {
            snapshot
                .parents_of
                .entry(edge.child_id.clone())
                .or_default()
                .insert(edge.parent_id.clone());
            snapshot
                .children_of
                .entry(edge.parent_id)
                .or_default()
                .insert(edge.child_id);
        }

        for union in &unions {
            for a in &union.partner_ids {
                for b in &union.partner_ids {
                    if a != b {
                        snapshot
                            .partners_of
                            .entry(a.clone())
                            .or_default()
                            .insert(b.clone());
                    }
                }
            }
        }
        snapshot.unions = unions;

        snapshot
    }

    pub fn parents(&self, person_id: &str) -> &BTreeSet<String> {
        self.parents_of.get(person_id).unwrap_or(&NO_IDS)
    }

    pub fn children(&self, person_id: &str) -> &BTreeSet<String> {
        self.children_of.get(person_id).unwrap_or(&NO_IDS)
    }

    /// Children that have at least one recorded parent, with their parents.
    pub fn parent_sets(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.parents_of.iter()
    }

    pub fn has_edge(&self, parent_id: &str, child_id: &str) -> bool {
        self.children(parent_id).contains(child_id)
    }

    /// Either person is a recorded parent of the other.
    pub fn linked(&self, a: &str, b: &str) -> bool {
        self.has_edge(a, b) || self.has_edge(b, a)
    }

    pub fn share_union(&self, a: &str, b: &str) -> bool {
        self.partners_of
            .get(a)
            .map_or(false, |partners| partners.contains(b))
    }

    pub fn in_any_union(&self, person_id: &str) -> bool {
        self.unions
            .iter()
            .any(|u| u.partner_ids.iter().any(|p| p == person_id))
    }

    /// Persons sharing at least one recorded parent.
    pub fn are_siblings(&self, a: &str, b: &str) -> bool {
        let parents_b = self.parents(b);
        self.parents(a).iter().any(|p| parents_b.contains(p))
    }

    /// Person name for explanations, falling back to the id.
    pub fn name_of<'a>(&'a self, person_id: &'a str) -> &'a str {
        self.persons
            .get(person_id)
            .map(|p| p.name.as_str())
            .unwrap_or(person_id)
    }
}
