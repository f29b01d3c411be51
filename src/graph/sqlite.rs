use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{GenealogyGraph, ParentChildEdge, ParentChildKind, Person, Tree, Union, UnionKind};
use crate::error::{GraphError, GraphResult};
use crate::storage::is_unique_violation;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite-backed canonical graph.
///
/// Shares the connection pool of [`crate::storage::SqliteStorage`]; the graph tables
/// are created by the same embedded migrations.
#[derive(Clone)]
pub struct SqliteGraph {
    pool: SqlitePool,
}

impl SqliteGraph {
    /// Create a graph repository from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new tree.
    pub async fn create_tree(&self, name: &str) -> GraphResult<Tree> {
        let tree = Tree {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query("INSERT INTO trees (id, name, created_at) VALUES (?, ?, ?)")
            .bind(&tree.id)
            .bind(&tree.name)
            .bind(tree.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

        debug!(tree_id = %tree.id, "Tree created");
        Ok(tree)
    }

    /// Insert a person together with their tags.
    pub async fn insert_person(&self, person: &Person) -> GraphResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO persons (id, tree_id, name, family_name, birth_date, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&person.id)
        .bind(&person.tree_id)
        .bind(&person.name)
        .bind(&person.family_name)
        .bind(person.birth_date.map(|d| d.format(DATE_FORMAT).to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                GraphError::Conflict {
                    message: format!("person {} already exists", person.id),
                }
            } else {
                GraphError::Sqlx(e)
            }
        })?;

        for tag in &person.tags {
            sqlx::query("INSERT OR IGNORE INTO person_tags (person_id, tag) VALUES (?, ?)")
                .bind(&person.id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl GenealogyGraph for SqliteGraph {
    async fn tree_exists(&self, tree_id: &str) -> GraphResult<bool> {
        let row = sqlx::query("SELECT 1 FROM trees WHERE id = ?")
            .bind(tree_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn person_exists(&self, tree_id: &str, person_id: &str) -> GraphResult<bool> {
        let row = sqlx::query("SELECT 1 FROM persons WHERE id = ? AND tree_id = ?")
            .bind(person_id)
            .bind(tree_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn persons(&self, tree_id: &str) -> GraphResult<Vec<Person>> {
        let rows: Vec<PersonRow> = sqlx::query_as(
            r#"
            SELECT id, tree_id, name, family_name, birth_date
            FROM persons
            WHERE tree_id = ?
            ORDER BY id
            "#,
        )
        .bind(tree_id)
        .fetch_all(&self.pool)
        .await?;

        let tag_rows = sqlx::query(
            r#"
            SELECT t.person_id, t.tag
            FROM person_tags t
            JOIN persons p ON p.id = t.person_id
            WHERE p.tree_id = ?
            ORDER BY t.tag
            "#,
        )
        .bind(tree_id)
        .fetch_all(&self.pool)
        .await?;

        let mut tags: HashMap<String, Vec<String>> = HashMap::new();
        for row in tag_rows {
            tags.entry(row.get("person_id"))
                .or_default()
                .push(row.get("tag"));
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let person_tags = tags.remove(&row.id).unwrap_or_default();
                row.into_person(person_tags)
            })
            .collect())
    }

    async fn parent_child_edges(&self, tree_id: &str) -> GraphResult<Vec<ParentChildEdge>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(
            r#"
            SELECT id, tree_id, parent_id, child_id, kind
            FROM parent_child_relationships
            WHERE tree_id = ?
            ORDER BY id
            "#,
        )
        .bind(tree_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn unions(&self, tree_id: &str) -> GraphResult<Vec<Union>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.tree_id, u.kind, m.person_id
            FROM unions u
            LEFT JOIN union_members m ON m.union_id = u.id
            WHERE u.tree_id = ?
            ORDER BY u.id, m.person_id
            "#,
        )
        .bind(tree_id)
        .fetch_all(&self.pool)
        .await?;

        let mut unions: Vec<Union> = Vec::new();
        for row in rows {
            let id: String = row.get("id");
            let member: Option<String> = row.get("person_id");

            if unions.last().map(|u| u.id != id).unwrap_or(true) {
                let kind: String = row.get("kind");
                unions.push(Union {
                    id,
                    tree_id: row.get("tree_id"),
                    kind: kind.parse().unwrap_or_default(),
                    partner_ids: Vec::new(),
                });
            }
            if let (Some(member), Some(current)) = (member, unions.last_mut()) {
                current.partner_ids.push(member);
            }
        }

        Ok(unions)
    }

    async fn insert_parent_child(
        &self,
        tree_id: &str,
        parent_id: &str,
        child_id: &str,
        kind: ParentChildKind,
    ) -> GraphResult<ParentChildEdge> {
        let mut tx = self.pool.begin().await?;
        let edge = write_parent_child(&mut *tx, tree_id, parent_id, child_id, kind).await?;
        tx.commit().await?;
        Ok(edge)
    }

    async fn insert_union(
        &self,
        tree_id: &str,
        partner_a: &str,
        partner_b: &str,
        kind: UnionKind,
    ) -> GraphResult<Union> {
        let mut tx = self.pool.begin().await?;
        let union = write_union(&mut *tx, tree_id, partner_a, partner_b, kind).await?;
        tx.commit().await?;
        Ok(union)
    }
}

// ============================================================================
// Connection-level writes
//
// Shared by the repository and by the prediction store, which applies an accepted
// prediction and records the outcome in one transaction.
// ============================================================================

async fn ensure_tree(conn: &mut SqliteConnection, tree_id: &str) -> GraphResult<()> {
    let row = sqlx::query("SELECT 1 FROM trees WHERE id = ?")
        .bind(tree_id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(_) => Ok(()),
        None => Err(GraphError::TreeNotFound {
            tree_id: tree_id.to_string(),
        }),
    }
}

async fn ensure_person(conn: &mut SqliteConnection, tree_id: &str, person_id: &str) -> GraphResult<()> {
    let row = sqlx::query("SELECT 1 FROM persons WHERE id = ? AND tree_id = ?")
        .bind(person_id)
        .bind(tree_id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(_) => Ok(()),
        None => Err(GraphError::PersonNotFound {
            person_id: person_id.to_string(),
        }),
    }
}

/// Insert a parent-child edge on an open connection.
pub(crate) async fn write_parent_child(
    conn: &mut SqliteConnection,
    tree_id: &str,
    parent_id: &str,
    child_id: &str,
    kind: ParentChildKind,
) -> GraphResult<ParentChildEdge> {
    if parent_id == child_id {
        return Err(GraphError::Conflict {
            message: format!("person {} cannot be their own parent", parent_id),
        });
    }
    ensure_tree(conn, tree_id).await?;
    ensure_person(conn, tree_id, parent_id).await?;
    ensure_person(conn, tree_id, child_id).await?;

    let edge = ParentChildEdge {
        id: Uuid::new_v4().to_string(),
        tree_id: tree_id.to_string(),
        parent_id: parent_id.to_string(),
        child_id: child_id.to_string(),
        kind,
    };

    sqlx::query(
        r#"
        INSERT INTO parent_child_relationships (id, tree_id, parent_id, child_id, kind, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&edge.id)
    .bind(&edge.tree_id)
    .bind(&edge.parent_id)
    .bind(&edge.child_id)
    .bind(edge.kind.to_string())
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            GraphError::Conflict {
                message: format!("parent-child edge {} -> {}", parent_id, child_id),
            }
        } else {
            GraphError::Sqlx(e)
        }
    })?;

    debug!(edge_id = %edge.id, parent = %parent_id, child = %child_id, "Parent-child edge created");
    Ok(edge)
}

/// Insert a union and its two memberships on an open connection.
///
/// Refuses a second union between the same partners in either order.
pub(crate) async fn write_union(
    conn: &mut SqliteConnection,
    tree_id: &str,
    partner_a: &str,
    partner_b: &str,
    kind: UnionKind,
) -> GraphResult<Union> {
    if partner_a == partner_b {
        return Err(GraphError::Conflict {
            message: format!("person {} cannot form a union with themselves", partner_a),
        });
    }
    ensure_tree(conn, tree_id).await?;
    ensure_person(conn, tree_id, partner_a).await?;
    ensure_person(conn, tree_id, partner_b).await?;

    let existing = sqlx::query(
        r#"
        SELECT a.union_id
        FROM union_members a
        JOIN union_members b ON b.union_id = a.union_id
        WHERE a.person_id = ? AND b.person_id = ?
        LIMIT 1
        "#,
    )
    .bind(partner_a)
    .bind(partner_b)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = existing {
        let union_id: String = row.get("union_id");
        warn!(union_id = %union_id, "Union between partners already exists");
        return Err(GraphError::Conflict {
            message: format!("union {} already links {} and {}", union_id, partner_a, partner_b),
        });
    }

    let union = Union {
        id: Uuid::new_v4().to_string(),
        tree_id: tree_id.to_string(),
        kind,
        partner_ids: vec![partner_a.to_string(), partner_b.to_string()],
    };

    sqlx::query("INSERT INTO unions (id, tree_id, kind, created_at) VALUES (?, ?, ?, ?)")
        .bind(&union.id)
        .bind(&union.tree_id)
        .bind(union.kind.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;

    for partner in &union.partner_ids {
        sqlx::query("INSERT INTO union_members (union_id, person_id) VALUES (?, ?)")
            .bind(&union.id)
            .bind(partner)
            .execute(&mut *conn)
            .await?;
    }

    debug!(union_id = %union.id, "Union created");
    Ok(union)
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct PersonRow {
    id: String,
    tree_id: String,
    name: String,
    family_name: Option<String>,
    birth_date: Option<String>,
}

impl PersonRow {
    fn into_person(self, tags: Vec<String>) -> Person {
        Person {
            birth_date: self
                .birth_date
                .as_deref()
                .and_then(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok()),
            id: self.id,
            tree_id: self.tree_id,
            name: self.name,
            family_name: self.family_name,
            tags,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EdgeRow {
    id: String,
    tree_id: String,
    parent_id: String,
    child_id: String,
    kind: String,
}

impl From<EdgeRow> for ParentChildEdge {
    fn from(row: EdgeRow) -> Self {
        Self {
            kind: row.kind.parse().unwrap_or_default(),
            id: row.id,
            tree_id: row.tree_id,
            parent_id: row.parent_id,
            child_id: row.child_id,
        }
    }
}
