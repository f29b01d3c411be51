//! Canonical genealogy graph access.
//!
//! The graph (persons, parent-child edges, unions) is owned by the wider platform.
//! Detection rules read it through [`GenealogyGraph`] and accepted predictions are
//! written back through the same trait. [`SqliteGraph`] is the bundled
//! implementation sharing the prediction database pool.

mod sqlite;

pub use sqlite::SqliteGraph;
pub(crate) use sqlite::{write_parent_child, write_union};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GraphResult;

/// A genealogy tree (dataset).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    /// Unique tree identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// When the tree was created.
    pub created_at: DateTime<Utc>,
}

/// A person recorded in a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    /// Unique person identifier.
    pub id: String,
    /// Owning tree.
    pub tree_id: String,
    /// Full name as recorded, possibly a patronymic chain.
    pub name: String,
    /// Family name or surname, when recorded separately.
    pub family_name: Option<String>,
    /// Birth date, when known.
    pub birth_date: Option<NaiveDate>,
    /// Free-form clustering tags (household, village, family branch).
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Person {
    /// Create a person with a generated id.
    pub fn new(tree_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tree_id: tree_id.into(),
            name: name.into(),
            family_name: None,
            birth_date: None,
            tags: Vec::new(),
        }
    }

    /// Set the family name.
    pub fn with_family_name(mut self, family_name: impl Into<String>) -> Self {
        self.family_name = Some(family_name.into());
        self
    }

    /// Set the birth date.
    pub fn with_birth_date(mut self, birth_date: NaiveDate) -> Self {
        self.birth_date = Some(birth_date);
        self
    }

    /// Add a clustering tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Kind of parent-child relationship.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentChildKind {
    /// Biological parentage.
    #[default]
    Biological,
    /// Legal adoption.
    Adopted,
    /// Step-parent.
    Step,
    /// Foster care.
    Foster,
}

impl std::fmt::Display for ParentChildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParentChildKind::Biological => write!(f, "biological"),
            ParentChildKind::Adopted => write!(f, "adopted"),
            ParentChildKind::Step => write!(f, "step"),
            ParentChildKind::Foster => write!(f, "foster"),
        }
    }
}

impl std::str::FromStr for ParentChildKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "biological" => Ok(ParentChildKind::Biological),
            "adopted" => Ok(ParentChildKind::Adopted),
            "step" => Ok(ParentChildKind::Step),
            "foster" => Ok(ParentChildKind::Foster),
            _ => Err(format!("Unknown parent-child kind: {}", s)),
        }
    }
}

/// Directed parent → child edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentChildEdge {
    /// Unique edge identifier.
    pub id: String,
    /// Owning tree.
    pub tree_id: String,
    /// Parent person.
    pub parent_id: String,
    /// Child person.
    pub child_id: String,
    /// Relationship kind.
    pub kind: ParentChildKind,
}

/// Kind of union.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnionKind {
    /// Recorded marriage.
    #[default]
    Marriage,
    /// Any other partnership.
    Partnership,
}

impl std::fmt::Display for UnionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnionKind::Marriage => write!(f, "marriage"),
            UnionKind::Partnership => write!(f, "partnership"),
        }
    }
}

impl std::str::FromStr for UnionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "marriage" => Ok(UnionKind::Marriage),
            "partnership" => Ok(UnionKind::Partnership),
            _ => Err(format!("Unknown union kind: {}", s)),
        }
    }
}

/// A union with its partner memberships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Union {
    /// Unique union identifier.
    pub id: String,
    /// Owning tree.
    pub tree_id: String,
    /// Union kind.
    pub kind: UnionKind,
    /// Member person ids (two or more).
    pub partner_ids: Vec<String>,
}

/// Read/write access to the canonical genealogy graph.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenealogyGraph: Send + Sync {
    /// Whether the tree exists.
    async fn tree_exists(&self, tree_id: &str) -> GraphResult<bool>;
    /// Whether the person exists in the given tree.
    async fn person_exists(&self, tree_id: &str, person_id: &str) -> GraphResult<bool>;
    /// All persons of a tree, with tags.
    async fn persons(&self, tree_id: &str) -> GraphResult<Vec<Person>>;
    /// All parent-child edges of a tree.
    async fn parent_child_edges(&self, tree_id: &str) -> GraphResult<Vec<ParentChildEdge>>;
    /// All unions of a tree, with partner ids.
    async fn unions(&self, tree_id: &str) -> GraphResult<Vec<Union>>;

    /// Insert a parent-child edge.
    ///
    /// Fails with `GraphError::Conflict` when the edge already exists.
    async fn insert_parent_child(
        &self,
        tree_id: &str,
        parent_id: &str,
        child_id: &str,
        kind: ParentChildKind,
    ) -> GraphResult<ParentChildEdge>;

    /// Insert a union and one membership row per partner.
    ///
    /// Fails with `GraphError::Conflict` when both persons already share a union.
    async fn insert_union(
        &self,
        tree_id: &str,
        partner_a: &str,
        partner_b: &str,
        kind: UnionKind,
    ) -> GraphResult<Union>;
}
