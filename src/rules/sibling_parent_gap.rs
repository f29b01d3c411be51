use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{DetectionRule, PredictionCandidate, RuleResult, TreeSnapshot};
use crate::graph::GenealogyGraph;

const RULE_ID: &str = "sibling_parent_gap";
const SINGLE_SIBLING_CONFIDENCE: f64 = 70.0;
const MULTI_SIBLING_CONFIDENCE: f64 = 80.0;

/// A person with one recorded parent whose siblings all agree on the same second
/// parent.
pub struct SiblingParentGapRule {
    graph: Arc<dyn GenealogyGraph>,
}

impl SiblingParentGapRule {
    pub fn new(graph: Arc<dyn GenealogyGraph>) -> Self {
        Self { graph }
    }

    fn scan(snapshot: &TreeSnapshot) -> Vec<PredictionCandidate> {
        let mut candidates = Vec::new();

        for (person, parents) in snapshot.parent_sets() {
            if parents.len() != 1 {
                continue;
            }
            let Some(known) = parents.iter().next() else {
                continue;
            };

            // second parent -> siblings recording it
            let mut second_parents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
            for sibling in snapshot.children(known) {
                if sibling == person {
                    continue;
                }
                for other in snapshot.parents(sibling) {
                    if other != known {
                        second_parents
                            .entry(other.as_str())
                            .or_default()
                            .push(sibling.as_str());
                    }
                }
            }

            if second_parents.len() != 1 {
                continue;
            }
            let Some((proposed, siblings)) = second_parents.into_iter().next() else {
                continue;
            };
            if proposed == person || snapshot.has_edge(proposed, person) {
                continue;
            }

            let confidence = if siblings.len() >= 2 {
                MULTI_SIBLING_CONFIDENCE
            } else {
                SINGLE_SIBLING_CONFIDENCE
            };
            let names: Vec<&str> = siblings.iter().map(|s| snapshot.name_of(s)).collect();

            candidates.push(PredictionCandidate::parent_child(
                RULE_ID,
                proposed,
                person,
                confidence,
                format!(
                    "Siblings {} share parent {} with {} and record {} as second parent",
                    names.join(", "),
                    snapshot.name_of(known),
                    snapshot.name_of(person),
                    snapshot.name_of(proposed)
                ),
            ));
        }

        candidates
    }
}

#[async_trait]
impl DetectionRule for SiblingParentGapRule {
    fn id(&self) -> &'static str {
        RULE_ID
    }

    async fn detect(&self, tree_id: &str) -> RuleResult<Vec<PredictionCandidate>> {
        let snapshot = TreeSnapshot::load(self.graph.as_ref(), tree_id).await?;
        let candidates = Self::scan(&snapshot);
        debug!(rule = RULE_ID, tree_id = %tree_id, count = candidates.len(), "Rule finished");
        Ok(candidates)
    }
}
