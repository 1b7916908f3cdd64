//! Database module for Rookery Server
//!
//! This module provides a libSQL database layer with:
//! - In-memory and local file-based databases
//! - Automatic schema migrations
//! - Health check capabilities
//!
//! # Architecture
//!
//! A `Database` owns a single persistent connection shared behind a mutex.
//! libSQL in-memory databases are per-connection, so all callers must go
//! through the same connection for state to be visible across calls; the
//! same path is used for file-based databases to keep the code uniform.

mod migrations;

use libsql::Connection;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

pub use migrations::{Migration, MigrationRunner};

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(#[from] libsql::Error),
}

/// Wrapper around a libsql database and its shared connection
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    name: String,
}

impl Database {
    /// Create a new in-memory database
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            name: name.to_string(),
        })
    }

    /// Create or open a local file-based database
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        debug!("Opening local database '{}' at: {:?}", name, path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                ))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;
        let conn = db.connect()?;

        info!("Opened database '{}' at {:?}", name, path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            name: name.to_string(),
        })
    }

    /// Get the shared connection handle
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Get the database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the database is healthy by executing a simple query
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn health_check(&self) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        match conn.query("SELECT 1", ()).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Execute a simple statement (for tests and seeding)
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn execute(&self, sql: &str) -> Result<u64, DatabaseError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(sql, ()).await?;
        Ok(rows)
    }
}
