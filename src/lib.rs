//! # Genealogy Predictions
//!
//! Finds probable gaps in a family tree and proposes the missing parent-child
//! links and unions. Proposals are reviewed by a tree administrator who accepts
//! them into the tree or dismisses them for good.
//!
//! ## Features
//!
//! - **Detection rules**: independent heuristics that each propose candidate relationships
//! - **Aggregation**: candidates agreeing on the same relationship are merged into one
//!   prediction with a combined confidence
//! - **Review lifecycle**: `New` predictions are accepted (written to the graph) or
//!   dismissed; resolved pairs are never proposed again
//! - **Bulk acceptance** of everything above a confidence threshold
//!
//! ## Architecture
//!
//! ```text
//! MCP Client → MCP Server (stdio) → PredictionService ─┬→ RuleRegistry → detection rules
//!                                                      ├→ aggregate
//!                                                      └→ SQLite (graph + predictions)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use genealogy_predictions::{AppState, Config, McpServer};
//! use genealogy_predictions::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let state = Arc::new(AppState::new(config, storage));
//!     McpServer::new(state).run().await?;
//!     Ok(())
//! }
//! ```

/// Merging of rule candidates into predictions.
pub mod aggregate;
/// Admin-capability checks.
pub mod auth;
/// Configuration loaded from the environment.
pub mod config;
/// Error types and result aliases.
pub mod error;
/// Canonical genealogy graph access.
pub mod graph;
/// Detection rules and their registry.
pub mod rules;
/// MCP server implementation and request handling.
pub mod server;
/// Scan orchestration and the review lifecycle.
pub mod service;
/// SQLite storage for predictions.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{AppState, McpServer, SharedState};
pub use service::PredictionService;
