use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{DetectionRule, PredictionCandidate, RuleResult, TreeSnapshot};
use crate::graph::GenealogyGraph;

const RULE_ID: &str = "patronymic_name";
const CHAIN_MATCH_CONFIDENCE: f64 = 80.0;
const SINGLE_NAME_MATCH_CONFIDENCE: f64 = 75.0;
const GIVEN_NAME_MATCH_CONFIDENCE: f64 = 55.0;

/// Word sequences that separate generations in a lineage name.
///
/// `", son of"` and `"son of"` tokenise identically since commas are dropped.
const CONNECTORS: &[&[&str]] = &[
    &["son", "of"],
    &["daughter", "of"],
    &["child", "of"],
    &["ben"],
    &["bat"],
    &["bin"],
    &["bint"],
    &["ibn"],
    &["ap"],
    &["verch"],
];

/// Split a name into its lineage chain, normalised to lowercase.
///
/// `"Dafydd ap Gruffudd ap Llywelyn"` becomes `["dafydd", "gruffudd", "llywelyn"]`.
/// A name without connectors yields a single-element chain; an empty name yields an
/// empty chain.
pub fn lineage_chain(name: &str) -> Vec<String> {
    let tokens: Vec<String> = name
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();

    let mut chain = Vec::new();
    let mut segment: Vec<&str> = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        let connector = CONNECTORS.iter().find(|connector| {
            tokens.len() >= i + connector.len()
                && connector
                    .iter()
                    .zip(&tokens[i..])
                    .all(|(expected, token)| *expected == token.as_str())
        });

        match connector {
            Some(connector) if !segment.is_empty() => {
                chain.push(segment.join(" "));
                segment.clear();
                i += connector.len();
            }
            _ => {
                segment.push(tokens[i].as_str());
                i += 1;
            }
        }
    }

    if !segment.is_empty() {
        chain.push(segment.join(" "));
    }

    chain
}

/// Lineage names ("A, son of B, son of C") that spell out another person's name.
pub struct PatronymicNameRule {
    graph: Arc<dyn GenealogyGraph>,
}

impl PatronymicNameRule {
    pub fn new(graph: Arc<dyn GenealogyGraph>) -> Self {
        Self { graph }
    }

    fn scan(snapshot: &TreeSnapshot) -> Vec<PredictionCandidate> {
        let chains: Vec<(&str, Vec<String>)> = snapshot
            .persons
            .values()
            .map(|p| (p.id.as_str(), lineage_chain(&p.name)))
            .filter(|(_, chain)| !chain.is_empty())
            .collect();

        let mut by_chain: HashMap<&[String], Vec<&str>> = HashMap::new();
        for (id, chain) in &chains {
            by_chain.entry(chain.as_slice()).or_default().push(*id);
        }

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for (child, chain) in &chains {
            if chain.len() < 2 {
                continue;
            }
            let tail = &chain[1..];

            let exact: Vec<&str> = by_chain
                .get(tail)
                .map(|ids| ids.iter().copied().filter(|id| id != child).collect())
                .unwrap_or_default();

            let (parent, confidence) = match exact.as_slice() {
                [parent] if tail.len() == 1 => (*parent, SINGLE_NAME_MATCH_CONFIDENCE),
                [parent] => (*parent, CHAIN_MATCH_CONFIDENCE),
                [] if tail.len() > 1 => {
                    let given: Vec<&str> = by_chain
                        .get(&tail[..1])
                        .map(|ids| ids.iter().copied().filter(|id| id != child).collect())
                        .unwrap_or_default();
                    match given.as_slice() {
                        [parent] => (*parent, GIVEN_NAME_MATCH_CONFIDENCE),
                        _ => continue,
                    }
                }
                _ => continue,
            };

            if snapshot.has_edge(parent, child) || born_after(snapshot, parent, child) {
                continue;
            }
            if !seen.insert((parent, *child)) {
                continue;
            }

            candidates.push(PredictionCandidate::parent_child(
                RULE_ID,
                parent,
                child,
                confidence,
                format!(
                    "Name \"{}\" names \"{}\" as the preceding generation",
                    snapshot.name_of(child),
                    snapshot.name_of(parent)
                ),
            ));
        }

        candidates
    }
}

/// The proposed parent's birth date is later than the child's.
fn born_after(snapshot: &TreeSnapshot, parent: &str, child: &str) -> bool {
    let parent_born = snapshot.persons.get(parent).and_then(|p| p.birth_date);
    let child_born = snapshot.persons.get(child).and_then(|p| p.birth_date);
    matches!((parent_born, child_born), (Some(p), Some(c)) if p > c)
}

#[async_trait]
impl DetectionRule for PatronymicNameRule {
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
