//! Read-only query contracts over external collaborator data.
//!
//! Profile CRUD, contact/block management and group CRUD are owned by other
//! services; this core only consults their tables to resolve usernames,
//! compute fan-out targets and authorize sends/reads. Nothing in this module
//! ever writes.

use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

use crate::db::Database;

/// Directory lookup errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("User not found: {0}")]
    UserNotFound(i64),

    #[error("Group not found: {0}")]
    GroupNotFound(i64),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Read-only view over users, contacts, blocks and group membership
#[derive(Clone)]
pub struct Directory {
    db: Arc<Database>,
}

impl Directory {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Resolve a user id to its username
    #[instrument(skip(self))]
    pub async fn username_of(&self, user_id: i64) -> Result<String, DirectoryError> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT username FROM users WHERE id = ?",
                libsql::params![user_id],
            )
            .await
            .map_err(|e| DirectoryError::DatabaseError(format!("Failed to query user: {}", e)))?;

        match rows
            .next()
            .await
            .map_err(|e| DirectoryError::DatabaseError(format!("Failed to read user row: {}", e)))?
        {
            Some(row) => row
                .get(0)
                .map_err(|e| DirectoryError::DatabaseError(format!("Failed to get username: {}", e))),
            None => Err(DirectoryError::UserNotFound(user_id)),
        }
    }

    /// Contact ids of a user. The owning service writes the relation
    /// symmetrically, so one direction is the full list.
    #[instrument(skip(self))]
    pub async fn contacts_of(&self, user_id: i64) -> Result<Vec<i64>, DirectoryError> {
        self.query_ids(
            "SELECT contact_id FROM contacts WHERE user_id = ?",
            user_id,
        )
        .await
    }

    /// Whether `blocker` has blocked `blocked`
    #[instrument(skip(self))]
    pub async fn is_blocked(&self, blocker: i64, blocked: i64) -> Result<bool, DirectoryError> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT 1 FROM blocks WHERE user_id = ? AND blocked_user_id = ?",
                libsql::params![blocker, blocked],
            )
            .await
            .map_err(|e| DirectoryError::DatabaseError(format!("Failed to query blocks: {}", e)))?;

        let row = rows.next().await.map_err(|e| {
            DirectoryError::DatabaseError(format!("Failed to read block row: {}", e))
        })?;
        Ok(row.is_some())
    }

    /// Member ids of a group
    #[instrument(skip(self))]
    pub async fn group_members(&self, group_id: i64) -> Result<Vec<i64>, DirectoryError> {
        self.query_ids(
            "SELECT user_id FROM group_members WHERE group_id = ? ORDER BY user_id",
            group_id,
        )
        .await
    }

    /// Whether a user belongs to a group
    #[instrument(skip(self))]
    pub async fn is_group_member(&self, group_id: i64, user_id: i64) -> Result<bool, DirectoryError> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ?",
                libsql::params![group_id, user_id],
            )
            .await
            .map_err(|e| {
                DirectoryError::DatabaseError(format!("Failed to query membership: {}", e))
            })?;

        let row = rows.next().await.map_err(|e| {
            DirectoryError::DatabaseError(format!("Failed to read membership row: {}", e))
        })?;
        Ok(row.is_some())
    }

    /// Group ids a user belongs to
    #[instrument(skip(self))]
    pub async fn groups_of(&self, user_id: i64) -> Result<Vec<i64>, DirectoryError> {
        self.query_ids(
            "SELECT group_id FROM group_members WHERE user_id = ? ORDER BY group_id",
            user_id,
        )
        .await
    }

    /// Resolve a group id to its name
    #[instrument(skip(self))]
    pub async fn group_name(&self, group_id: i64) -> Result<String, DirectoryError> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT name FROM groups WHERE id = ?",
                libsql::params![group_id],
            )
            .await
            .map_err(|e| DirectoryError::DatabaseError(format!("Failed to query group: {}", e)))?;

        match rows.next().await.map_err(|e| {
            DirectoryError::DatabaseError(format!("Failed to read group row: {}", e))
        })? {
            Some(row) => row.get(0).map_err(|e| {
                DirectoryError::DatabaseError(format!("Failed to get group name: {}", e))
            }),
            None => Err(DirectoryError::GroupNotFound(group_id)),
        }
    }

    async fn query_ids(&self, sql: &str, param: i64) -> Result<Vec<i64>, DirectoryError> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut rows = conn
            .query(sql, libsql::params![param])
            .await
            .map_err(|e| DirectoryError::DatabaseError(format!("Failed to query ids: {}", e)))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DirectoryError::DatabaseError(format!("Failed to read id row: {}", e)))?
        {
            let id: i64 = row
                .get(0)
                .map_err(|e| DirectoryError::DatabaseError(format!("Failed to get id: {}", e)))?;
            ids.push(id);
        }
        Ok(ids)
    }
}
