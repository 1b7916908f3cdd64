//! Database migration system for Rookery Server
//!
//! This module provides:
//! - Compile-time embedded SQL migrations
//! - Version tracking via a migrations table
//! - Automatic migration on database initialization
//!
//! # Migration Naming Convention
//!
//! Migration constants are named `VNNNN_DESCRIPTION`
//! where NNNN is a zero-padded version number (e.g., 0001, 0002).

use super::Database;
use super::DatabaseError;
use tracing::{debug, info, instrument};

/// Represents a single database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number (must be unique and incrementing)
    pub version: i64,
    /// Description of what this migration does
    pub description: String,
    /// SQL to execute for the migration
    pub sql: &'static str,
}

/// Chat database migrations (users, contacts, blocks, groups, messages)
pub mod chat {
    use super::Migration;

    /// Initial schema.
    ///
    /// `users`, `contacts`, `blocks`, `groups` and `group_members` belong to
    /// external collaborators (profile/contact/group services); this core
    /// only ever reads them. `messages` and `message_recipients` are owned
    /// by this core.
    pub const V0001_INITIAL_SCHEMA: &str = r#"
-- Users (external source of truth; consumed read-only)
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);

-- Contact list (external; consumed read-only)
CREATE TABLE IF NOT EXISTS contacts (
    user_id INTEGER NOT NULL,
    contact_id INTEGER NOT NULL,
    PRIMARY KEY (user_id, contact_id),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (contact_id) REFERENCES users(id) ON DELETE CASCADE
);

-- Block list (external; consumed read-only)
CREATE TABLE IF NOT EXISTS blocks (
    user_id INTEGER NOT NULL,              -- the user who blocked
    blocked_user_id INTEGER NOT NULL,      -- the user being blocked
    PRIMARY KEY (user_id, blocked_user_id),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (blocked_user_id) REFERENCES users(id) ON DELETE CASCADE
);

-- Groups (external; consumed read-only)
CREATE TABLE IF NOT EXISTS groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Group membership (external; consumed read-only)
CREATE TABLE IF NOT EXISTS group_members (
    group_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_group_members_user_id ON group_members(user_id);

-- Messages (owned by this core)
-- A message targets exactly one of a private receiver or a group.
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,                    -- Message ID (UUID v7, time-sortable)
    sender_id INTEGER NOT NULL,
    receiver_id INTEGER,                    -- set for private messages
    group_id INTEGER,                       -- set for group messages
    content TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'DELIVERED', -- private-only: DELIVERED | READ
    created_at TEXT NOT NULL,
    CHECK ((receiver_id IS NULL) <> (group_id IS NULL)),
    FOREIGN KEY (sender_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_private_pair
    ON messages(sender_id, receiver_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_group_id ON messages(group_id, created_at);

-- Per-recipient delivery state for group fan-out (owned by this core)
-- One row per non-sender group member, created atomically with the message.
CREATE TABLE IF NOT EXISTS message_recipients (
    message_id TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'DELIVERED', -- DELIVERED | READ
    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_message_recipients_user
    ON message_recipients(user_id, status);
"#;

    /// Get all chat migrations in order
    pub fn all() -> Vec<Migration> {
        vec![Migration {
            version: 1,
            description: "Initial chat schema".to_string(),
            sql: V0001_INITIAL_SCHEMA,
        }]
    }
}

/// Runs migrations against a database, tracking applied versions
pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl MigrationRunner {
    /// Create a new migration runner with the given migrations
    pub fn new(migrations: Vec<Migration>) -> Self {
        let mut sorted = migrations;
        sorted.sort_by_key(|m| m.version);
        Self { migrations: sorted }
    }

    /// Create a runner for the chat database migrations
    pub fn chat() -> Self {
        Self::new(chat::all())
    }

    /// Run all pending migrations on the database
    ///
    /// Returns the versions that were applied in this run.
    #[instrument(skip_all, fields(db_name = %db.name()))]
    pub async fn run(&self, db: &Database) -> Result<Vec<i64>, DatabaseError> {
        let conn = db.connection();
        let conn = conn.lock().await;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to create migrations table: {}", e))
        })?;

        let mut applied: Vec<i64> = Vec::new();
        let mut rows = conn
            .query("SELECT version FROM _migrations ORDER BY version", ())
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to query migrations: {}", e))
            })?;

        while let Some(row) = rows.next().await.map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to read migration row: {}", e))
        })? {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to get version: {}", e))
            })?;
            applied.push(version);
        }

        let mut newly_applied = Vec::new();
        for migration in &self.migrations {
            if applied.contains(&migration.version) {
                debug!("Migration {} already applied, skipping", migration.version);
                continue;
            }

            info!(
                version = migration.version,
                description = %migration.description,
                "Applying migration"
            );

            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Migration {} failed: {}",
                    migration.version, e
                ))
            })?;

            conn.execute(
                "INSERT INTO _migrations (version, description) VALUES (?, ?)",
                libsql::params![migration.version, migration.description.clone()],
            )
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Failed to record migration {}: {}",
                    migration.version, e
                ))
            })?;

            newly_applied.push(migration.version);
        }

        Ok(newly_applied)
    }

    /// Get the current schema version of the database
    pub async fn current_version(&self, db: &Database) -> Result<Option<i64>, DatabaseError> {
        let conn = db.connection();
        let conn = conn.lock().await;

        let mut rows = conn
            .query("SELECT MAX(version) FROM _migrations", ())
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to query version: {}", e))
            })?;

        match rows.next().await.map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to read version row: {}", e))
        })? {
            Some(row) => {
                let version: Option<i64> = row.get(0).ok();
                Ok(version)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migration_runner_chat() {
        let db = Database::in_memory("test-migrations").await.unwrap();
        let runner = MigrationRunner::chat();

        let applied = runner.run(&db).await.unwrap();
        assert!(!applied.is_empty());

        // Running again should apply nothing
        let applied_again = runner.run(&db).await.unwrap();
        assert!(applied_again.is_empty());

        let version = runner.current_version(&db).await.unwrap();
        assert_eq!(version, Some(1));
    }

    #[tokio::test]
    async fn test_schema_tables_exist() {
        let db = Database::in_memory("test-schema").await.unwrap();
        MigrationRunner::chat().run(&db).await.unwrap();

        let conn = db.connection();
        let conn = conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
                (),
            )
            .await
            .unwrap();

        let mut tables = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let name: String = row.get(0).unwrap();
            tables.push(name);
        }

        for expected in [
            "users",
            "contacts",
            "blocks",
            "groups",
            "group_members",
            "messages",
            "message_recipients",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {}", expected);
        }
    }

    #[tokio::test]
    async fn test_exactly_one_target_enforced() {
        let db = Database::in_memory("test-target-check").await.unwrap();
        MigrationRunner::chat().run(&db).await.unwrap();
        db.execute("INSERT INTO users (username) VALUES ('alice')")
            .await
            .unwrap();

        // Neither target set: rejected by the CHECK constraint
        let result = db
            .execute(
                "INSERT INTO messages (id, sender_id, content, created_at) \
                 VALUES ('m1', 1, 'hi', '2026-01-01T00:00:00Z')",
            )
            .await;
        assert!(result.is_err());

        // Both targets set: also rejected
        let result = db
            .execute(
                "INSERT INTO messages (id, sender_id, receiver_id, group_id, content, created_at) \
                 VALUES ('m2', 1, 2, 3, 'hi', '2026-01-01T00:00:00Z')",
            )
            .await;
        assert!(result.is_err());
    }
}
