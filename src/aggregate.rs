//! Confidence aggregation across detection rules.
//!
//! Candidates proposing the same directed relationship are merged into one,
//! treating each rule as an independent evidence source (Noisy-OR).

use std::collections::HashMap;

use crate::rules::PredictionCandidate;
use crate::storage::PredictionKey;

/// Aggregated confidence never claims certainty.
pub const MAX_AGGREGATED_CONFIDENCE: f64 = 99.0;

/// Noisy-OR of confidences given in percent: `1 - Π(1 - p_i)`, in percent.
pub fn noisy_or(confidences: &[f64]) -> f64 {
    if confidences.is_empty() {
        return 0.0;
    }
    let product: f64 = confidences
        .iter()
        .map(|&c| 1.0 - (c / 100.0).clamp(0.0, 1.0))
        .product();
    (1.0 - product) * 100.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Merge all candidates of one scan.
///
/// Groups by `(source, target, type)`. Single-member groups pass through unchanged.
/// Multi-member groups keep the highest-confidence member (first one on ties) as
/// primary, combine confidences with [`noisy_or`] capped at
/// [`MAX_AGGREGATED_CONFIDENCE`] and rounded to two decimals, and cite the other
/// rules in the explanation. Output is sorted by confidence, highest first.
pub fn aggregate(candidates: Vec<PredictionCandidate>) -> Vec<PredictionCandidate> {
    let mut index: HashMap<PredictionKey, usize> = HashMap::new();
    let mut groups: Vec<Vec<PredictionCandidate>> = Vec::new();

    for candidate in candidates {
        let key = candidate.key();
        match index.get(&key) {
            Some(&slot) => groups[slot].push(candidate),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![candidate]);
            }
        }
    }

    let mut merged: Vec<PredictionCandidate> = groups.into_iter().filter_map(merge_group).collect();

    merged.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.key().cmp(&b.key()))
    });
    merged
}

fn merge_group(mut group: Vec<PredictionCandidate>) -> Option<PredictionCandidate> {
    if group.len() <= 1 {
        return group.pop();
    }

    // One vote per rule: a rule repeating itself is not independent evidence
    let mut per_rule: Vec<PredictionCandidate> = Vec::with_capacity(group.len());
    for candidate in group {
        match per_rule.iter().position(|c| c.rule_id == candidate.rule_id) {
            Some(i) if per_rule[i].confidence < candidate.confidence => per_rule[i] = candidate,
            Some(_) => {}
            None => per_rule.push(candidate),
        }
    }

    let mut primary_idx = 0;
    for (i, candidate) in per_rule.iter().enumerate() {
        if candidate.confidence > per_rule[primary_idx].confidence {
            primary_idx = i;
        }
    }

    if per_rule.len() == 1 {
        return per_rule.pop();
    }

    let confidences: Vec<f64> = per_rule.iter().map(|c| c.confidence).collect();
    let others: Vec<String> = per_rule
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != primary_idx)
        .map(|(_, c)| c.rule_id.clone())
        .collect();

    let mut primary = per_rule.swap_remove(primary_idx);
    let strongest = primary.confidence.min(MAX_AGGREGATED_CONFIDENCE);
    primary.confidence = round2(noisy_or(&confidences).min(MAX_AGGREGATED_CONFIDENCE)).max(strongest);
    primary.explanation = format!(
        "{} (also matched by: {})",
        primary.explanation,
        others.join(", ")
    );

    Some(primary)
}
