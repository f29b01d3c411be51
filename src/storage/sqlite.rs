use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions,
};
use sqlx::QueryBuilder;
use tracing::{debug, info, warn};

use super::{
    AppliedEntityType, ConfidenceLevel, PredictedRelationship, PredictedType, PredictionFilter,
    PredictionKey, PredictionStatus, PredictionStore,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::graph::{write_parent_child, write_union, ParentChildKind, UnionKind};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const PREDICTION_COLUMNS: &str = "id, tree_id, rule_id, predicted_type, source_person_id, \
    target_person_id, confidence, confidence_level, explanation, status, created_at, \
    scan_batch_id, resolved_by_user_id, resolved_at, dismiss_reason, applied_entity_type, \
    applied_entity_id";

/// Whether a SQLx error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory database, mainly for tests.
    ///
    /// Uses a single long-lived connection so every query sees the same database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool, shared with the graph repository
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Insert one prediction row. With `skip_conflicts`, a row colliding with a unique
/// key is dropped and 0 is returned.
async fn insert_row(
    conn: &mut SqliteConnection,
    prediction: &PredictedRelationship,
    skip_conflicts: bool,
) -> Result<u64, sqlx::Error> {
    let sql = format!(
        r#"
        INSERT INTO predicted_relationships ({})
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        {}
        "#,
        PREDICTION_COLUMNS,
        if skip_conflicts { "ON CONFLICT DO NOTHING" } else { "" }
    );

    let result = sqlx::query(&sql)
        .bind(&prediction.id)
        .bind(&prediction.tree_id)
        .bind(&prediction.rule_id)
        .bind(prediction.predicted_type.as_str())
        .bind(&prediction.source_person_id)
        .bind(&prediction.target_person_id)
        .bind(prediction.confidence)
        .bind(prediction.confidence_level.as_str())
        .bind(&prediction.explanation)
        .bind(prediction.status.as_str())
        .bind(prediction.created_at.to_rfc3339())
        .bind(&prediction.scan_batch_id)
        .bind(&prediction.resolved_by_user_id)
        .bind(prediction.resolved_at.map(|t| t.to_rfc3339()))
        .bind(&prediction.dismiss_reason)
        .bind(prediction.applied_entity_type.map(|t| t.as_str()))
        .bind(&prediction.applied_entity_id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}

/// Compare-and-set from `New` to the record's terminal state. Returns rows changed.
async fn update_resolution(
    conn: &mut SqliteConnection,
    prediction: &PredictedRelationship,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE predicted_relationships
        SET status = ?, resolved_by_user_id = ?, resolved_at = ?, dismiss_reason = ?,
            applied_entity_type = ?, applied_entity_id = ?
        WHERE id = ? AND status = 'New'
        "#,
    )
    .bind(prediction.status.as_str())
    .bind(&prediction.resolved_by_user_id)
    .bind(prediction.resolved_at.map(|t| t.to_rfc3339()))
    .bind(&prediction.dismiss_reason)
    .bind(prediction.applied_entity_type.map(|t| t.as_str()))
    .bind(&prediction.applied_entity_id)
    .bind(&prediction.id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

fn push_filters<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    tree_id: &str,
    filter: &PredictionFilter,
) {
    builder.push(" WHERE tree_id = ");
    builder.push_bind(tree_id.to_string());

    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status.as_str());
    }
    if let Some(level) = filter.confidence_level {
        builder.push(" AND confidence_level = ");
        builder.push_bind(level.as_str());
    }
    if let Some(rule_id) = &filter.rule_id {
        builder.push(" AND rule_id = ");
        builder.push_bind(rule_id.clone());
    }
    if let Some(predicted_type) = filter.predicted_type {
        builder.push(" AND predicted_type = ");
        builder.push_bind(predicted_type.as_str());
    }
}

#[async_trait]
impl PredictionStore for SqliteStorage {
    async fn insert_prediction(&self, prediction: &PredictedRelationship) -> StorageResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_row(&mut *conn, prediction, false)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StorageError::Conflict {
                        message: format!(
                            "unresolved {} prediction {} -> {} already exists",
                            prediction.predicted_type,
                            prediction.source_person_id,
                            prediction.target_person_id
                        ),
                    }
                } else {
                    StorageError::Sqlx(e)
                }
            })?;

        Ok(())
    }

    async fn get_prediction(&self, id: &str) -> StorageResult<Option<PredictedRelationship>> {
        let row: Option<PredictionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM predicted_relationships WHERE id = ?",
            PREDICTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PredictedRelationship::try_from).transpose()
    }

    async fn replace_unresolved(
        &self,
        tree_id: &str,
        predictions: Vec<PredictedRelationship>,
    ) -> StorageResult<Vec<PredictedRelationship>> {
        let mut tx = self.pool.begin().await?;

        let removed =
            sqlx::query("DELETE FROM predicted_relationships WHERE tree_id = ? AND status = ?")
                .bind(tree_id)
                .bind(PredictionStatus::New.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();

        let mut stored = Vec::with_capacity(predictions.len());
        for prediction in predictions {
            if insert_row(&mut *tx, &prediction, true).await? == 1 {
                stored.push(prediction);
            } else {
                warn!(
                    tree_id = %tree_id,
                    source = %prediction.source_person_id,
                    target = %prediction.target_person_id,
                    predicted_type = %prediction.predicted_type,
                    "Prediction insert conflicted, skipping"
                );
            }
        }

        tx.commit().await?;

        debug!(
            tree_id = %tree_id,
            removed,
            inserted = stored.len(),
            "Unresolved predictions replaced"
        );
        Ok(stored)
    }

    async fn resolved_keys(&self, tree_id: &str) -> StorageResult<HashSet<PredictionKey>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT source_person_id, target_person_id, predicted_type
            FROM predicted_relationships
            WHERE tree_id = ? AND status != 'New'
            "#,
        )
        .bind(tree_id)
        .fetch_all(&self.pool)
        .await?;

        let mut keys = HashSet::with_capacity(rows.len());
        for (source, target, predicted_type) in rows {
            let predicted_type = predicted_type
                .parse()
                .map_err(|message| StorageError::Query { message })?;
            keys.insert(PredictionKey {
                source_person_id: source,
                target_person_id: target,
                predicted_type,
            });
        }
        Ok(keys)
    }

    async fn query_predictions(
        &self,
        tree_id: &str,
        filter: &PredictionFilter,
        limit: u32,
        offset: u32,
    ) -> StorageResult<(Vec<PredictedRelationship>, u64)> {
        let mut count_query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM predicted_relationships");
        push_filters(&mut count_query, tree_id, filter);
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut items_query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM predicted_relationships",
            PREDICTION_COLUMNS
        ));
        push_filters(&mut items_query, tree_id, filter);
        items_query.push(" ORDER BY confidence DESC, created_at ASC, id ASC LIMIT ");
        items_query.push_bind(i64::from(limit));
        items_query.push(" OFFSET ");
        items_query.push_bind(i64::from(offset));

        let rows: Vec<PredictionRow> = items_query
            .build_query_as()
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(PredictedRelationship::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok((items, total.max(0) as u64))
    }

    async fn unresolved_at_or_above(
        &self,
        tree_id: &str,
        min_confidence: f64,
    ) -> StorageResult<Vec<PredictedRelationship>> {
        let rows: Vec<PredictionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM predicted_relationships
            WHERE tree_id = ? AND status = 'New' AND confidence >= ?
            ORDER BY confidence DESC, created_at ASC, id ASC
            "#,
            PREDICTION_COLUMNS
        ))
        .bind(tree_id)
        .bind(min_confidence)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PredictedRelationship::try_from).collect()
    }

    async fn resolve_prediction(&self, prediction: &PredictedRelationship) -> StorageResult<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(update_resolution(&mut *conn, prediction).await? == 1)
    }

    async fn apply_prediction(
        &self,
        prediction: &PredictedRelationship,
        user_id: &str,
    ) -> StorageResult<Option<PredictedRelationship>> {
        let mut tx = self.pool.begin().await?;

        let (entity_type, entity_id) = match prediction.predicted_type {
            PredictedType::ParentChild => {
                let edge = write_parent_child(
                    &mut *tx,
                    &prediction.tree_id,
                    &prediction.source_person_id,
                    &prediction.target_person_id,
                    ParentChildKind::Biological,
                )
                .await?;
                (AppliedEntityType::ParentChild, edge.id)
            }
            PredictedType::Union => {
                let union = write_union(
                    &mut *tx,
                    &prediction.tree_id,
                    &prediction.source_person_id,
                    &prediction.target_person_id,
                    UnionKind::default(),
                )
                .await?;
                (AppliedEntityType::Union, union.id)
            }
        };

        let mut applied = prediction.clone();
        applied.mark_applied(user_id, entity_type, entity_id);

        if update_resolution(&mut *tx, &applied).await? == 0 {
            tx.rollback().await?;
            debug!(prediction_id = %prediction.id, "Prediction no longer New, graph write rolled back");
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(applied))
    }
}

// Internal row type for SQLx mapping
#[derive(sqlx::FromRow)]
struct PredictionRow {
    id: String,
    tree_id: String,
    rule_id: String,
    predicted_type: String,
    source_person_id: String,
    target_person_id: String,
    confidence: f64,
    confidence_level: String,
    explanation: String,
    status: String,
    created_at: String,
    scan_batch_id: String,
    resolved_by_user_id: Option<String>,
    resolved_at: Option<String>,
    dismiss_reason: Option<String>,
    applied_entity_type: Option<String>,
    applied_entity_id: Option<String>,
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn corrupt(column: &str, message: String) -> StorageError {
    StorageError::Query {
        message: format!("invalid {} in stored prediction: {}", column, message),
    }
}

impl TryFrom<PredictionRow> for PredictedRelationship {
    type Error = StorageError;

    fn try_from(row: PredictionRow) -> StorageResult<Self> {
        let predicted_type: PredictedType = row
            .predicted_type
            .parse()
            .map_err(|e| corrupt("predicted_type", e))?;
        let status: PredictionStatus = row.status.parse().map_err(|e| corrupt("status", e))?;
        let applied_entity_type = row
            .applied_entity_type
            .as_deref()
            .map(str::parse::<AppliedEntityType>)
            .transpose()
            .map_err(|e| corrupt("applied_entity_type", e))?;

        Ok(Self {
            predicted_type,
            status,
            applied_entity_type,
            confidence_level: row
                .confidence_level
                .parse()
                .unwrap_or_else(|_| ConfidenceLevel::from_confidence(row.confidence)),
            created_at: parse_timestamp(&row.created_at).unwrap_or_else(Utc::now),
            resolved_at: row.resolved_at.as_deref().and_then(parse_timestamp),
            id: row.id,
            tree_id: row.tree_id,
            rule_id: row.rule_id,
            source_person_id: row.source_person_id,
            target_person_id: row.target_person_id,
            confidence: row.confidence,
            explanation: row.explanation,
            scan_batch_id: row.scan_batch_id,
            resolved_by_user_id: row.resolved_by_user_id,
            dismiss_reason: row.dismiss_reason,
            applied_entity_id: row.applied_entity_id,
        })
    }
}
