use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{DetectionRule, PredictionCandidate, RuleResult, TreeSnapshot};
use crate::graph::GenealogyGraph;

const RULE_ID: &str = "spouse_child_gap";
const CONFIDENCE: f64 = 90.0;

/// A child linked to only one partner of a union is probably the other partner's
/// child too.
pub struct SpouseChildGapRule {
    graph: Arc<dyn GenealogyGraph>,
}

impl SpouseChildGapRule {
    pub fn new(graph: Arc<dyn GenealogyGraph>) -> Self {
        Self { graph }
    }

    fn scan(snapshot: &TreeSnapshot) -> Vec<PredictionCandidate> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for union in &snapshot.unions {
            for recorded in &union.partner_ids {
                for missing in &union.partner_ids {
                    if missing == recorded {
                        continue;
                    }

                    for child in snapshot.children(recorded) {
                        if child == missing
                            || snapshot.has_edge(missing, child)
                            || snapshot.parents(child).len() >= 2
                        {
                            continue;
                        }
                        if !seen.insert((missing.clone(), child.clone())) {
                            continue;
                        }

                        candidates.push(PredictionCandidate::parent_child(
                            RULE_ID,
                            missing,
                            child,
                            CONFIDENCE,
                            format!(
                                "{} is in a union with {}, a recorded parent of {}",
                                snapshot.name_of(missing),
                                snapshot.name_of(recorded),
                                snapshot.name_of(child)
                            ),
                        ));
                    }
                }
            }
        }

        candidates
    }
}

#[async_trait]
impl DetectionRule for SpouseChildGapRule {
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
