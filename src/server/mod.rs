//! Server module for MCP protocol handling.
//!
//! This module provides:
//! - MCP server implementation over stdio
//! - Tool call handlers and routing
//! - Shared application state management

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::sync::Arc;

use crate::auth::{AdminAllowList, AuthorizationGate};
use crate::config::Config;
use crate::graph::{GenealogyGraph, SqliteGraph};
use crate::rules::RuleRegistry;
use crate::service::PredictionService;
use crate::storage::SqliteStorage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// SQLite prediction store.
    pub storage: SqliteStorage,
    /// Canonical graph on the same pool.
    pub graph: SqliteGraph,
    /// Scan orchestration and review lifecycle.
    pub service: PredictionService,
}

impl AppState {
    /// Create new application state with the built-in rules and the configured
    /// admin allow-list.
    pub fn new(config: Config, storage: SqliteStorage) -> Self {
        let gate: Arc<dyn AuthorizationGate> = Arc::new(AdminAllowList::new(&config.auth));
        Self::with_gate(config, storage, gate)
    }

    /// Create application state with a custom authorization gate.
    pub fn with_gate(
        config: Config,
        storage: SqliteStorage,
        gate: Arc<dyn AuthorizationGate>,
    ) -> Self {
        let graph = SqliteGraph::new(storage.pool().clone());
        let shared_graph: Arc<dyn GenealogyGraph> = Arc::new(graph.clone());
        let rules = RuleRegistry::with_default_rules(shared_graph.clone(), &config.rules);

        tracing::info!(
            rules = ?rules.ids(),
            max_concurrent_rules = config.scan.max_concurrent_rules,
            admin_allow_all = config.auth.allow_all,
            admins = config.auth.admin_user_ids.len(),
            "AppState initializing"
        );

        let service = PredictionService::new(
            Arc::new(storage.clone()),
            shared_graph,
            gate,
            rules,
            config.scan.clone(),
        );

        Self {
            config,
            storage,
            graph,
            service,
        }
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
