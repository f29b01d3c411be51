use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use tracing::debug;

use super::{DetectionRule, PredictionCandidate, RuleResult, TreeSnapshot};
use crate::config::RuleConfig;
use crate::graph::{GenealogyGraph, Person};

const RULE_ID: &str = "age_family";
const PARENT_CONFIDENCE: f64 = 35.0;
const STRONG_CLUSTER_BONUS: f64 = 10.0;
const UNION_CONFIDENCE: f64 = 40.0;
/// More plausible parents than this in one cluster is too weak a signal.
const MAX_PARENT_MATCHES: usize = 2;

/// Whole years from `earlier` to `later`; negative when `later` precedes `earlier`.
fn years_between(earlier: NaiveDate, later: NaiveDate) -> i64 {
    let mut years = i64::from(later.year() - earlier.year());
    if (later.month(), later.day()) < (earlier.month(), earlier.day()) {
        years -= 1;
    }
    years
}

fn family_key(person: &Person) -> Option<String> {
    person
        .family_name
        .as_deref()
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
}

fn tag_keys(person: &Person) -> BTreeSet<String> {
    person
        .tags
        .iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Birth-date gaps combined with family-name and tag clusters.
///
/// Proposes a parent for an unparented person when one or two cluster mates are of
/// plausible parental age, and a union for same-generation cluster mates who have no
/// union at all.
pub struct AgeFamilyRule {
    graph: Arc<dyn GenealogyGraph>,
    config: RuleConfig,
}

impl AgeFamilyRule {
    pub fn new(graph: Arc<dyn GenealogyGraph>, config: RuleConfig) -> Self {
        Self { graph, config }
    }

    fn scan(&self, snapshot: &TreeSnapshot) -> Vec<PredictionCandidate> {
        let mut by_family: BTreeMap<String, Vec<&Person>> = BTreeMap::new();
        let mut by_tag: BTreeMap<String, Vec<&Person>> = BTreeMap::new();

        for person in snapshot.persons.values() {
            if let Some(family) = family_key(person) {
                by_family.entry(family).or_default().push(person);
            }
            for tag in tag_keys(person) {
                by_tag.entry(tag).or_default().push(person);
            }
        }

        let mut candidates = self.parent_candidates(snapshot, &by_family, &by_tag);
        candidates.extend(self.union_candidates(snapshot, &by_tag));
        candidates
    }

    fn parent_candidates(
        &self,
        snapshot: &TreeSnapshot,
        by_family: &BTreeMap<String, Vec<&Person>>,
        by_tag: &BTreeMap<String, Vec<&Person>>,
    ) -> Vec<PredictionCandidate> {
        let mut candidates = Vec::new();

        for person in snapshot.persons.values() {
            let Some(born) = person.birth_date else {
                continue;
            };
            if !snapshot.parents(&person.id).is_empty() {
                continue;
            }

            let family = family_key(person);
            let tags = tag_keys(person);

            let mut mates: BTreeMap<&str, &Person> = BTreeMap::new();
            if let Some(members) = family.as_ref().and_then(|f| by_family.get(f)) {
                mates.extend(members.iter().map(|m| (m.id.as_str(), *m)));
            }
            for tag in &tags {
                if let Some(members) = by_tag.get(tag) {
                    mates.extend(members.iter().map(|m| (m.id.as_str(), *m)));
                }
            }

            let plausible: Vec<&Person> = mates
                .into_values()
                .filter(|mate| mate.id != person.id)
                .filter(|mate| !snapshot.linked(&mate.id, &person.id))
                .filter(|mate| !snapshot.share_union(&mate.id, &person.id))
                .filter(|mate| {
                    mate.birth_date.map_or(false, |mate_born| {
                        let gap = years_between(mate_born, born);
                        gap >= self.config.min_parent_age_gap_years
                            && gap <= self.config.max_parent_age_gap_years
                    })
                })
                .collect();

            if plausible.is_empty() || plausible.len() > MAX_PARENT_MATCHES {
                continue;
            }

            for mate in plausible {
                let same_family = family.is_some() && family_key(mate) == family;
                let shared_tag = !tag_keys(mate).is_disjoint(&tags);
                let confidence = if same_family && shared_tag {
                    PARENT_CONFIDENCE + STRONG_CLUSTER_BONUS
                } else {
                    PARENT_CONFIDENCE
                };

                candidates.push(PredictionCandidate::parent_child(
                    RULE_ID,
                    &mate.id,
                    &person.id,
                    confidence,
                    format!(
                        "{} is {} years older than {} and shares their family cluster",
                        mate.name,
                        mate.birth_date
                            .map(|d| years_between(d, born))
                            .unwrap_or_default(),
                        person.name
                    ),
                ));
            }
        }

        candidates
    }

    fn union_candidates(
        &self,
        snapshot: &TreeSnapshot,
        by_tag: &BTreeMap<String, Vec<&Person>>,
    ) -> Vec<PredictionCandidate> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for (tag, members) in by_tag {
            for (i, a) in members.iter().enumerate() {
                for b in &members[i + 1..] {
                    let (Some(born_a), Some(born_b)) = (a.birth_date, b.birth_date) else {
                        continue;
                    };
                    let (earlier, later) = if born_a <= born_b {
                        (born_a, born_b)
                    } else {
                        (born_b, born_a)
                    };
                    if years_between(earlier, later) > self.config.max_partner_age_gap_years {
                        continue;
                    }
                    if snapshot.in_any_union(&a.id)
                        || snapshot.in_any_union(&b.id)
                        || snapshot.are_siblings(&a.id, &b.id)
                        || snapshot.linked(&a.id, &b.id)
                    {
                        continue;
                    }

                    let candidate = PredictionCandidate::union(
                        RULE_ID,
                        &a.id,
                        &b.id,
                        UNION_CONFIDENCE,
                        format!(
                            "{} and {} share cluster \"{}\" and were born within {} years of each other",
                            a.name, b.name, tag, self.config.max_partner_age_gap_years
                        ),
                    );
                    if seen.insert(candidate.key()) {
                        candidates.push(candidate);
                    }
                }
            }
        }

        candidates
    }
}

#[async_trait]
impl DetectionRule for AgeFamilyRule {
    fn id(&self) -> &'static str {
        RULE_ID
    }

    async fn detect(&self, tree_id: &str) -> RuleResult<Vec<PredictionCandidate>> {
        let snapshot = TreeSnapshot::load(self.graph.as_ref(), tree_id).await?;
        let candidates = self.scan(&snapshot);
        debug!(rule = RULE_ID, tree_id = %tree_id, count = candidates.len(), "Rule finished");
        Ok(candidates)
    }
}
