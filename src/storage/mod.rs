//! Storage layer for relationship predictions.
//!
//! Predictions produced by a scan are stored as `New` records and are disposable:
//! the next scan of the same tree replaces them. Resolved records (`Applied`,
//! `Dismissed`) are durable and block the same key from being predicted again.

mod sqlite;


pub use sqlite::SqliteStorage;
pub(crate) use sqlite::is_unique_violation;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::rules::PredictionCandidate;

/// Confidence at or above which a prediction is `High`.
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 85.0;
/// Confidence at or above which a prediction is `Medium`.
pub const MEDIUM_CONFIDENCE_THRESHOLD: f64 = 60.0;

/// Kind of relationship a prediction proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictedType {
    /// Source is the proposed parent of target.
    ParentChild,
    /// Source and target are proposed partners.
    Union,
}

impl PredictedType {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictedType::ParentChild => "parent_child",
            PredictedType::Union => "union",
        }
    }
}

impl std::fmt::Display for PredictedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PredictedType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "parent_child" => Ok(PredictedType::ParentChild),
            "union" => Ok(PredictedType::Union),
            _ => Err(format!("Unknown predicted type: {}", s)),
        }
    }
}

/// Review status of a prediction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredictionStatus {
    /// Awaiting review; replaced by the next scan.
    #[default]
    New,
    /// Accepted and written to the graph.
    Applied,
    /// Rejected by a reviewer.
    Dismissed,
}

impl PredictionStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::New => "New",
            PredictionStatus::Applied => "Applied",
            PredictionStatus::Dismissed => "Dismissed",
        }
    }

    /// Whether a reviewer has decided this prediction.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, PredictionStatus::New)
    }
}

impl std::fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PredictionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "new" => Ok(PredictionStatus::New),
            "applied" => Ok(PredictionStatus::Applied),
            "dismissed" => Ok(PredictionStatus::Dismissed),
            _ => Err(format!("Unknown prediction status: {}", s)),
        }
    }
}

/// Coarse confidence bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    /// Confidence ≥ 85.
    High,
    /// Confidence ≥ 60.
    Medium,
    /// Confidence < 60.
    Low,
}

impl ConfidenceLevel {
    /// Bucket a confidence in [0, 100]. Lower bounds are inclusive.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= HIGH_CONFIDENCE_THRESHOLD {
            ConfidenceLevel::High
        } else if confidence >= MEDIUM_CONFIDENCE_THRESHOLD {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::High => "High",
            ConfidenceLevel::Medium => "Medium",
            ConfidenceLevel::Low => "Low",
        }
    }
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConfidenceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(ConfidenceLevel::High),
            "medium" => Ok(ConfidenceLevel::Medium),
            "low" => Ok(ConfidenceLevel::Low),
            _ => Err(format!("Unknown confidence level: {}", s)),
        }
    }
}

/// Graph entity created when a prediction is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppliedEntityType {
    /// A parent-child edge.
    ParentChild,
    /// A union with its memberships.
    Union,
}

impl AppliedEntityType {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AppliedEntityType::ParentChild => "ParentChild",
            AppliedEntityType::Union => "Union",
        }
    }
}

impl std::fmt::Display for AppliedEntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AppliedEntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ParentChild" => Ok(AppliedEntityType::ParentChild),
            "Union" => Ok(AppliedEntityType::Union),
            _ => Err(format!("Unknown applied entity type: {}", s)),
        }
    }
}

/// Identity of a proposed relationship within a tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PredictionKey {
    /// Proposed parent or first partner.
    pub source_person_id: String,
    /// Proposed child or second partner.
    pub target_person_id: String,
    /// Relationship kind.
    pub predicted_type: PredictedType,
}

/// A persisted relationship prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedRelationship {
    /// Unique prediction identifier.
    pub id: String,
    /// Tree the prediction belongs to.
    pub tree_id: String,
    /// Rule that produced the prediction (primary rule when aggregated).
    pub rule_id: String,
    /// Proposed relationship kind.
    pub predicted_type: PredictedType,
    /// Proposed parent or first partner.
    pub source_person_id: String,
    /// Proposed child or second partner.
    pub target_person_id: String,
    /// Confidence in [0, 100].
    pub confidence: f64,
    /// Bucket derived from `confidence`.
    pub confidence_level: ConfidenceLevel,
    /// Human-readable justification.
    pub explanation: String,
    /// Review status.
    pub status: PredictionStatus,
    /// When the prediction was created.
    pub created_at: DateTime<Utc>,
    /// Scan that produced the prediction.
    pub scan_batch_id: String,
    /// Reviewer who resolved it.
    pub resolved_by_user_id: Option<String>,
    /// When it was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Reviewer's reason, set only when dismissed.
    pub dismiss_reason: Option<String>,
    /// Created graph entity type, set only when applied.
    pub applied_entity_type: Option<AppliedEntityType>,
    /// Created graph entity id, set only when applied.
    pub applied_entity_id: Option<String>,
}

impl PredictedRelationship {
    /// Create a `New` prediction from an aggregated candidate.
    pub fn from_candidate(
        tree_id: impl Into<String>,
        scan_batch_id: impl Into<String>,
        candidate: &PredictionCandidate,
    ) -> Self {
        let confidence = candidate.confidence.clamp(0.0, 100.0);
        Self {
            id: Uuid::new_v4().to_string(),
            tree_id: tree_id.into(),
            rule_id: candidate.rule_id.clone(),
            predicted_type: candidate.predicted_type,
            source_person_id: candidate.source_person_id.clone(),
            target_person_id: candidate.target_person_id.clone(),
            confidence,
            confidence_level: ConfidenceLevel::from_confidence(confidence),
            explanation: candidate.explanation.clone(),
            status: PredictionStatus::New,
            created_at: Utc::now(),
            scan_batch_id: scan_batch_id.into(),
            resolved_by_user_id: None,
            resolved_at: None,
            dismiss_reason: None,
            applied_entity_type: None,
            applied_entity_id: None,
        }
    }

    /// Key used for uniqueness and resolved-pair suppression.
    pub fn key(&self) -> PredictionKey {
        PredictionKey {
            source_person_id: self.source_person_id.clone(),
            target_person_id: self.target_person_id.clone(),
            predicted_type: self.predicted_type,
        }
    }

    /// Transition to `Applied`, recording the created graph entity.
    pub fn mark_applied(
        &mut self,
        user_id: impl Into<String>,
        entity_type: AppliedEntityType,
        entity_id: impl Into<String>,
    ) {
        self.status = PredictionStatus::Applied;
        self.resolved_by_user_id = Some(user_id.into());
        self.resolved_at = Some(Utc::now());
        self.applied_entity_type = Some(entity_type);
        self.applied_entity_id = Some(entity_id.into());
    }

    /// Transition to `Dismissed`.
    pub fn mark_dismissed(&mut self, user_id: impl Into<String>, reason: Option<String>) {
        self.status = PredictionStatus::Dismissed;
        self.resolved_by_user_id = Some(user_id.into());
        self.resolved_at = Some(Utc::now());
        self.dismiss_reason = reason;
    }
}

/// Optional filters and paging for listing predictions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionFilter {
    /// Only predictions with this status.
    pub status: Option<PredictionStatus>,
    /// Only predictions in this bucket.
    pub confidence_level: Option<ConfidenceLevel>,
    /// Only predictions whose primary rule is this id.
    pub rule_id: Option<String>,
    /// Only predictions of this kind.
    pub predicted_type: Option<PredictedType>,
    /// 1-based page number (default 1).
    pub page: Option<u32>,
    /// Page size (default from configuration).
    pub page_size: Option<u32>,
}

/// Persistence operations for predictions.
#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Insert a prediction.
    ///
    /// Fails with `StorageError::Conflict` when an unresolved prediction with the
    /// same key already exists.
    async fn insert_prediction(&self, prediction: &PredictedRelationship) -> StorageResult<()>;

    /// Get a prediction by ID.
    async fn get_prediction(&self, id: &str) -> StorageResult<Option<PredictedRelationship>>;

    /// Replace every unresolved prediction of a tree with a new batch, in one
    /// transaction.
    ///
    /// Rows that collide with a unique key are skipped. Returns the rows actually
    /// stored, in input order.
    async fn replace_unresolved(
        &self,
        tree_id: &str,
        predictions: Vec<PredictedRelationship>,
    ) -> StorageResult<Vec<PredictedRelationship>>;

    /// Keys of all resolved predictions in a tree.
    async fn resolved_keys(&self, tree_id: &str) -> StorageResult<HashSet<PredictionKey>>;

    /// Filtered page of predictions, highest confidence first, plus the total match count.
    async fn query_predictions(
        &self,
        tree_id: &str,
        filter: &PredictionFilter,
        limit: u32,
        offset: u32,
    ) -> StorageResult<(Vec<PredictedRelationship>, u64)>;

    /// Unresolved predictions with `confidence >= min_confidence`, highest first.
    async fn unresolved_at_or_above(
        &self,
        tree_id: &str,
        min_confidence: f64,
    ) -> StorageResult<Vec<PredictedRelationship>>;

    /// Persist a terminal transition.
    ///
    /// Only applies while the stored record is still `New`; returns `false` when the
    /// record was already resolved.
    async fn resolve_prediction(&self, prediction: &PredictedRelationship) -> StorageResult<bool>;

    /// Write the relationship a prediction proposes to the graph and mark the
    /// prediction `Applied`, in one transaction.
    ///
    /// Parent-child predictions become biological edges; union predictions become
    /// unions of the default kind. Returns `None`, with nothing written, when the
    /// stored record is no longer `New`.
    async fn apply_prediction(
        &self,
        prediction: &PredictedRelationship,
        user_id: &str,
    ) -> StorageResult<Option<PredictedRelationship>>;
}
