use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{DetectionRule, PredictionCandidate, RuleResult, TreeSnapshot};
use crate::graph::GenealogyGraph;

const RULE_ID: &str = "missing_union";
const BASE_CONFIDENCE: f64 = 60.0;
const PER_EXTRA_CHILD: f64 = 10.0;
const MAX_CONFIDENCE: f64 = 85.0;

/// Two recorded parents of the same child with no union between them.
pub struct MissingUnionRule {
    graph: Arc<dyn GenealogyGraph>,
}

impl MissingUnionRule {
    pub fn new(graph: Arc<dyn GenealogyGraph>) -> Self {
        Self { graph }
    }

    fn scan(snapshot: &TreeSnapshot) -> Vec<PredictionCandidate> {
        // (a, b) with a < b -> shared children
        let mut shared: BTreeMap<(&str, &str), Vec<&str>> = BTreeMap::new();

        for (child, parents) in snapshot.parent_sets() {
            let parents: Vec<&String> = parents.iter().collect();
            for (i, a) in parents.iter().enumerate() {
                for b in &parents[i + 1..] {
                    shared
                        .entry((a.as_str(), b.as_str()))
                        .or_default()
                        .push(child.as_str());
                }
            }
        }

        shared
            .into_iter()
            .filter(|((a, b), _)| !snapshot.share_union(a, b))
            .map(|((a, b), children)| {
                let extra = children.len().saturating_sub(1) as f64;
                let confidence = (BASE_CONFIDENCE + PER_EXTRA_CHILD * extra).min(MAX_CONFIDENCE);
                let names: Vec<&str> = children.iter().map(|c| snapshot.name_of(c)).collect();

                PredictionCandidate::union(
                    RULE_ID,
                    a,
                    b,
                    confidence,
                    format!(
                        "{} and {} are both recorded parents of {} but share no union",
                        snapshot.name_of(a),
                        snapshot.name_of(b),
                        names.join(", ")
                    ),
                )
            })
            .collect()
    }
}

#[async_trait]
impl DetectionRule for MissingUnionRule {
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
