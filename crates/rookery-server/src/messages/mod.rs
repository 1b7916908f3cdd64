//! Messages module for Rookery Server
//!
//! This module provides:
//! - Message domain types (`Message`, `MessageTarget`, `DeliveryStatus`)
//! - The message store (transactional commit phase, history, status rows)
//! - The chat service: send pipeline (commit then publish) and the
//!   DELIVERED -> READ status state machine
//!
//! # Architecture
//!
//! A send is split in two phases with a durability boundary between them.
//! The commit phase validates authorization and persists the message row
//! plus, for group sends, one `message_recipients` row per non-sender
//! member in a single transaction. The publish phase then pushes the
//! persisted message onto the fan-out pipeline; a publish failure is logged
//! and never fails the send, because the durable fact already exists.

mod repository;
mod service;
mod types;

pub use repository::MessageStore;
pub use service::ChatService;
pub use types::{
    DeliveryStatus, Message, MessageCreate, MessageInfo, MessageTarget, MessageWire,
    RecipientStatus, MAX_CONTENT_LENGTH,
};

use thiserror::Error;

use crate::directory::DirectoryError;

/// Message-specific errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Message must target exactly one of a receiver or a group")]
    InvalidTarget,

    #[error("Invalid message content: {0}")]
    InvalidContent(String),

    #[error("Content too long: max {max} characters, got {actual}")]
    ContentTooLong { max: usize, actual: usize },

    #[error("Sender is not a member of group {0}")]
    NotGroupMember(i64),

    #[error("Sender has been blocked by the receiver")]
    Blocked,

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Caller is not a recipient of this message")]
    Forbidden,

    #[error("User not found: {0}")]
    UserNotFound(i64),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<crate::db::DatabaseError> for MessageError {
    fn from(err: crate::db::DatabaseError) -> Self {
        MessageError::DatabaseError(err.to_string())
    }
}

impl From<DirectoryError> for MessageError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::UserNotFound(id) => MessageError::UserNotFound(id),
            DirectoryError::GroupNotFound(id) => MessageError::NotGroupMember(id),
            DirectoryError::DatabaseError(e) => MessageError::DatabaseError(e),
        }
    }
}

impl From<libsql::Error> for MessageError {
    fn from(err: libsql::Error) -> Self {
        MessageError::DatabaseError(err.to_string())
    }
}
