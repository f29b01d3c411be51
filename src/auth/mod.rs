//! Authorization gate.
//!
//! The prediction service only needs one answer from the platform: does this caller
//! hold administrative capability for this tree.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;

/// Identity of whoever invokes a prediction operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Boolean admin-capability check.
#[async_trait]
pub trait AuthorizationGate: Send + Sync {
    /// Whether `caller` may administer predictions of `tree_id`.
    async fn has_admin(&self, caller: &Caller, tree_id: &str) -> bool;
}

/// Gate backed by the configured admin allow-list.
#[derive(Debug, Clone, Default)]
pub struct AdminAllowList {
    admins: HashSet<String>,
    allow_all: bool,
}

impl AdminAllowList {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            admins: config.admin_user_ids.iter().cloned().collect(),
            allow_all: config.allow_all,
        }
    }

    /// Gate that admits every caller.
    pub fn allow_all() -> Self {
        Self {
            admins: HashSet::new(),
            allow_all: true,
        }
    }
}

#[async_trait]
impl AuthorizationGate for AdminAllowList {
    async fn has_admin(&self, caller: &Caller, _tree_id: &str) -> bool {
        self.allow_all || self.admins.contains(&caller.user_id)
    }
}
