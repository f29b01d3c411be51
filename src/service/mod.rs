//! Prediction service: scan orchestration and the review lifecycle.
//!
//! A scan runs every registered rule, merges their candidates, replaces the tree's
//! unresolved predictions and skips keys a reviewer already decided. Accepting a
//! prediction writes the proposed edge or union to the canonical graph; dismissing it
//! records the reviewer's decision. All mutations of one tree are serialized.

#[cfg(test)]
#[path = "service_tests.rs"]
mod service_tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::aggregate;
use crate::auth::{AuthorizationGate, Caller};
use crate::config::ScanConfig;
use crate::error::{PredictionError, PredictionResult};
use crate::graph::GenealogyGraph;
use crate::rules::{RuleOutcome, RuleRegistry};
use crate::storage::{
    ConfidenceLevel, PredictedRelationship, PredictionFilter, PredictionStatus, PredictionStore,
};

/// Result of one scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub batch_id: String,
    /// Predictions created by this scan.
    pub total: usize,
    pub high_count: usize,
    pub medium_count: usize,
    pub low_count: usize,
    /// Created predictions, highest confidence first.
    pub predictions: Vec<PredictedRelationship>,
    /// Rules that failed and contributed nothing.
    pub failed_rules: Vec<String>,
}

/// One page of stored predictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionPage {
    pub items: Vec<PredictedRelationship>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

/// Caller-facing outcome of accept and dismiss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    /// `ok` or a [`PredictionError::code`].
    pub code: String,
    pub message: String,
    /// The resolved prediction on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<PredictedRelationship>,
}

impl ActionResult {
    fn from_result(
        prediction_id: &str,
        action: &str,
        result: PredictionResult<PredictedRelationship>,
    ) -> Self {
        match result {
            Ok(prediction) => Self {
                success: true,
                code: "ok".to_string(),
                message: format!("Prediction {} {}", prediction_id, action),
                prediction: Some(prediction),
            },
            Err(e) if e.is_recoverable() => Self {
                success: false,
                code: e.code().to_string(),
                message: e.to_string(),
                prediction: None,
            },
            Err(e) => {
                error!(
                    prediction_id = %prediction_id,
                    action = action,
                    error = %e,
                    "Prediction action failed unexpectedly"
                );
                Self {
                    success: false,
                    code: e.code().to_string(),
                    message: "An internal error occurred while processing the prediction"
                        .to_string(),
                    prediction: None,
                }
            }
        }
    }
}

/// Outcome of bulk acceptance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkAcceptSummary {
    /// Predictions applied to the graph.
    pub accepted: usize,
    /// Predictions that could not be applied and stay `New`.
    pub failed: usize,
    /// Predictions at or above the threshold.
    pub considered: usize,
}

/// Orchestrates scans and the review lifecycle.
#[derive(Clone)]
pub struct PredictionService {
    store: Arc<dyn PredictionStore>,
    graph: Arc<dyn GenealogyGraph>,
    gate: Arc<dyn AuthorizationGate>,
    rules: Arc<RuleRegistry>,
    config: ScanConfig,
    tree_locks: Arc<TreeLocks>,
}

impl PredictionService {
    pub fn new(
        store: Arc<dyn PredictionStore>,
        graph: Arc<dyn GenealogyGraph>,
        gate: Arc<dyn AuthorizationGate>,
        rules: RuleRegistry,
        config: ScanConfig,
    ) -> Self {
        Self {
            store,
            graph,
            gate,
            rules: Arc::new(rules),
            config,
            tree_locks: Arc::default(),
        }
    }

    /// Registered rules.
    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    /// Scan configuration in effect.
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    // ========================================================================
    // Scanning
    // ========================================================================

    /// Run every rule against a tree and replace its unresolved predictions.
    pub async fn scan_tree(&self, tree_id: &str, caller: &Caller) -> PredictionResult<ScanSummary> {
        let start = Instant::now();
        self.authorize(caller, tree_id).await?;

        if !self.graph.tree_exists(tree_id).await? {
            return Err(PredictionError::NotFound {
                message: format!("tree {}", tree_id),
            });
        }

        let _guard = self.tree_lock(tree_id).await;
        let batch_id = Uuid::new_v4().to_string();
        info!(tree_id = %tree_id, batch_id = %batch_id, rules = self.rules.count(), "Scan started");

        let outcomes = self.run_rules(tree_id).await;
        let mut failed_rules = Vec::new();
        let mut candidates = Vec::new();
        for outcome in outcomes {
            if let Err(e) = &outcome.result {
                warn!(
                    tree_id = %tree_id,
                    rule = %outcome.rule_id,
                    error = %e,
                    "Detection rule failed, continuing without it"
                );
                failed_rules.push(outcome.rule_id.clone());
            }
            candidates.extend(outcome.into_candidates());
        }

        let raw_count = candidates.len();
        let aggregated = aggregate(candidates);

        let resolved = self.store.resolved_keys(tree_id).await?;
        let fresh: Vec<PredictedRelationship> = aggregated
            .iter()
            .filter(|candidate| {
                let decided = resolved.contains(&candidate.key());
                if decided {
                    debug!(
                        tree_id = %tree_id,
                        source = %candidate.source_person_id,
                        target = %candidate.target_person_id,
                        predicted_type = %candidate.predicted_type,
                        "Skipping candidate already decided by a reviewer"
                    );
                }
                !decided
            })
            .map(|candidate| PredictedRelationship::from_candidate(tree_id, &batch_id, candidate))
            .collect();

        // Old unresolved rows and the new batch swap in one transaction
        let predictions = self.store.replace_unresolved(tree_id, fresh).await?;

        let count_level = |level: ConfidenceLevel| {
            predictions
                .iter()
                .filter(|p| p.confidence_level == level)
                .count()
        };
        let summary = ScanSummary {
            batch_id,
            total: predictions.len(),
            high_count: count_level(ConfidenceLevel::High),
            medium_count: count_level(ConfidenceLevel::Medium),
            low_count: count_level(ConfidenceLevel::Low),
            failed_rules,
            predictions,
        };

        info!(
            tree_id = %tree_id,
            batch_id = %summary.batch_id,
            candidates = raw_count,
            created = summary.total,
            high = summary.high_count,
            medium = summary.medium_count,
            low = summary.low_count,
            failed_rules = summary.failed_rules.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Scan completed"
        );

        Ok(summary)
    }

    /// Run all rules with bounded concurrency. Outcomes keep registration order.
    async fn run_rules(&self, tree_id: &str) -> Vec<RuleOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_rules.max(1)));

        let handles: Vec<_> = self
            .rules
            .rules()
            .iter()
            .map(|rule| {
                let rule_id = rule.id().to_string();
                let rule = Arc::clone(rule);
                let semaphore = Arc::clone(&semaphore);
                let tree_id = tree_id.to_string();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    rule.detect(&tree_id).await
                });
                (rule_id, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (rule_id, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(candidates)) => RuleOutcome::succeeded(rule_id, candidates),
                Ok(Err(PredictionError::RuleExecution { message, .. })) => {
                    RuleOutcome::failed(rule_id, message)
                }
                Ok(Err(e)) => RuleOutcome::failed(rule_id, e.to_string()),
                Err(e) => RuleOutcome::failed(rule_id, format!("rule task did not complete: {}", e)),
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Filtered, paginated predictions of a tree, highest confidence first.
    pub async fn get_predictions(
        &self,
        tree_id: &str,
        filter: &PredictionFilter,
        caller: &Caller,
    ) -> PredictionResult<PredictionPage> {
        self.authorize(caller, tree_id).await?;

        let page = filter.page.unwrap_or(1).max(1);
        let page_size = filter
            .page_size
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size.max(1));
        let offset = (page - 1).saturating_mul(page_size);

        let (items, total) = self
            .store
            .query_predictions(tree_id, filter, page_size, offset)
            .await?;

        Ok(PredictionPage {
            items,
            total,
            page,
            page_size,
            total_pages: total.div_ceil(u64::from(page_size)),
        })
    }

    // ========================================================================
    // Review lifecycle
    // ========================================================================

    /// Apply a prediction to the canonical graph.
    pub async fn accept_prediction(&self, prediction_id: &str, caller: &Caller) -> ActionResult {
        let result = self.try_accept(prediction_id, caller).await;
        ActionResult::from_result(prediction_id, "accepted", result)
    }

    /// Reject a prediction so future scans do not propose it again.
    pub async fn dismiss_prediction(
        &self,
        prediction_id: &str,
        reason: Option<String>,
        caller: &Caller,
    ) -> ActionResult {
        let result = self.try_dismiss(prediction_id, reason, caller).await;
        ActionResult::from_result(prediction_id, "dismissed", result)
    }

    /// Accept every unresolved prediction at or above `min_confidence`, highest first.
    ///
    /// Best effort: a failing prediction is logged, left `New`, and the rest continue.
    pub async fn accept_all_high_confidence(
        &self,
        tree_id: &str,
        min_confidence: Option<f64>,
        caller: &Caller,
    ) -> PredictionResult<BulkAcceptSummary> {
        self.authorize(caller, tree_id).await?;
        let threshold = min_confidence.unwrap_or(self.config.bulk_accept_min_confidence);

        let _guard = self.tree_lock(tree_id).await;
        let selected = self.store.unresolved_at_or_above(tree_id, threshold).await?;

        let mut summary = BulkAcceptSummary {
            considered: selected.len(),
            ..Default::default()
        };

        for prediction in selected {
            let prediction_id = prediction.id.clone();
            match self.apply(prediction, caller).await {
                Ok(_) => summary.accepted += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        tree_id = %tree_id,
                        prediction_id = %prediction_id,
                        code = e.code(),
                        error = %e,
                        "Bulk accept skipped prediction"
                    );
                }
            }
        }

        info!(
            tree_id = %tree_id,
            threshold,
            accepted = summary.accepted,
            failed = summary.failed,
            considered = summary.considered,
            "Bulk accept completed"
        );
        Ok(summary)
    }

    async fn try_accept(
        &self,
        prediction_id: &str,
        caller: &Caller,
    ) -> PredictionResult<PredictedRelationship> {
        let prediction = self.load(prediction_id).await?;
        self.authorize(caller, &prediction.tree_id).await?;

        let _guard = self.tree_lock(&prediction.tree_id).await;
        // A rescan may have replaced it while waiting for the lock
        let prediction = self.load(prediction_id).await?;
        ensure_new(&prediction)?;

        self.apply(prediction, caller).await
    }

    /// Write the proposed relationship and mark the prediction `Applied`.
    /// Expects the tree lock to be held.
    async fn apply(
        &self,
        prediction: PredictedRelationship,
        caller: &Caller,
    ) -> PredictionResult<PredictedRelationship> {
        let tree_id = prediction.tree_id.clone();
        for person_id in [&prediction.source_person_id, &prediction.target_person_id] {
            if !self.graph.person_exists(&tree_id, person_id).await? {
                return Err(PredictionError::NotFound {
                    message: format!("person {} no longer exists", person_id),
                });
            }
        }

        let applied = self
            .store
            .apply_prediction(&prediction, &caller.user_id)
            .await?
            .ok_or_else(|| PredictionError::InvalidState {
                message: format!("prediction {} is no longer New", prediction.id),
            })?;

        info!(
            tree_id = %tree_id,
            prediction_id = %applied.id,
            entity_type = ?applied.applied_entity_type,
            entity_id = ?applied.applied_entity_id,
            user_id = %caller.user_id,
            "Prediction applied"
        );
        Ok(applied)
    }

    async fn try_dismiss(
        &self,
        prediction_id: &str,
        reason: Option<String>,
        caller: &Caller,
    ) -> PredictionResult<PredictedRelationship> {
        let prediction = self.load(prediction_id).await?;
        self.authorize(caller, &prediction.tree_id).await?;

        let _guard = self.tree_lock(&prediction.tree_id).await;
        let mut prediction = self.load(prediction_id).await?;
        ensure_new(&prediction)?;

        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        prediction.mark_dismissed(&caller.user_id, reason);

        if !self.store.resolve_prediction(&prediction).await? {
            return Err(PredictionError::InvalidState {
                message: format!("prediction {} is no longer New", prediction.id),
            });
        }

        info!(
            tree_id = %prediction.tree_id,
            prediction_id = %prediction.id,
            user_id = %caller.user_id,
            "Prediction dismissed"
        );
        Ok(prediction)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn authorize(&self, caller: &Caller, tree_id: &str) -> PredictionResult<()> {
        if self.gate.has_admin(caller, tree_id).await {
            Ok(())
        } else {
            warn!(user_id = %caller.user_id, tree_id = %tree_id, "Admin capability required");
            Err(PredictionError::Forbidden {
                message: format!(
                    "user {} lacks admin capability for tree {}",
                    caller.user_id, tree_id
                ),
            })
        }
    }

    async fn load(&self, prediction_id: &str) -> PredictionResult<PredictedRelationship> {
        self.store
            .get_prediction(prediction_id)
            .await?
            .ok_or_else(|| PredictionError::NotFound {
                message: format!("prediction {}", prediction_id),
            })
    }

    /// Serializes scans and resolutions of one tree.
    async fn tree_lock(&self, tree_id: &str) -> TreeGuard {
        let lock = self.tree_locks.checkout(tree_id);
        let guard = lock.lock_owned().await;
        TreeGuard {
            tree_id: tree_id.to_string(),
            locks: Arc::clone(&self.tree_locks),
            guard: Some(guard),
        }
    }
}

/// One async mutex per tree, kept only while someone holds or awaits it.
#[derive(Default)]
struct TreeLocks {
    locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TreeLocks {
    fn checkout(&self, tree_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(tree_id.to_string()).or_default())
    }

    /// Drop the tree's entry when the map holds the only reference.
    fn release(&self, tree_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(tree_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(tree_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct TreeGuard {
    tree_id: String,
    locks: Arc<TreeLocks>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TreeGuard {
    fn drop(&mut self) {
        // Unlock first so the strong count reflects only waiters
        self.guard.take();
        self.locks.release(&self.tree_id);
    }
}

fn ensure_new(prediction: &PredictedRelationship) -> PredictionResult<()> {
    if prediction.status == PredictionStatus::New {
        Ok(())
    } else {
        Err(PredictionError::InvalidState {
            message: format!(
                "prediction {} is {}, only New predictions can be resolved",
                prediction.id, prediction.status
            ),
        })
    }
}
