//! Message domain types for Rookery Server
//!
//! This module defines the core message types used throughout the delivery
//! core:
//! - `Message`: the persisted message entity
//! - `MessageTarget`: tagged private-vs-group target
//! - `DeliveryStatus`: the forward-only DELIVERED -> READ state
//! - `MessageCreate`: DTO for the send commit phase
//! - `MessageWire`: the JSON wire shape shared by REST and the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MessageError;

/// Maximum content length for messages (4000 characters)
pub const MAX_CONTENT_LENGTH: usize = 4000;

/// Per-recipient delivery state.
///
/// Transitions are forward-only: DELIVERED may advance to READ, and READ is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Database/wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Read => "READ",
        }
    }

    /// Parse the database representation
    pub fn parse(s: &str) -> Result<Self, MessageError> {
        match s {
            "DELIVERED" => Ok(DeliveryStatus::Delivered),
            "READ" => Ok(DeliveryStatus::Read),
            other => Err(MessageError::DatabaseError(format!(
                "Unknown delivery status: {}",
                other
            ))),
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition
    pub fn can_advance_to(&self, next: DeliveryStatus) -> bool {
        matches!(
            (self, next),
            (DeliveryStatus::Delivered, DeliveryStatus::Read)
        )
    }
}

/// The target of a message: exactly one of a private receiver or a group.
///
/// Replaces the nullable receiver-xor-group pair with a tagged variant so
/// the "exactly one target" invariant is carried by the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    Private(i64),
    Group(i64),
}

impl MessageTarget {
    /// Build a target from the optional wire fields, rejecting anything but
    /// exactly one of them.
    pub fn from_parts(
        receiver_id: Option<i64>,
        group_id: Option<i64>,
    ) -> Result<Self, MessageError> {
        match (receiver_id, group_id) {
            (Some(r), None) => Ok(MessageTarget::Private(r)),
            (None, Some(g)) => Ok(MessageTarget::Group(g)),
            _ => Err(MessageError::InvalidTarget),
        }
    }

    pub fn receiver_id(&self) -> Option<i64> {
        match self {
            MessageTarget::Private(id) => Some(*id),
            MessageTarget::Group(_) => None,
        }
    }

    pub fn group_id(&self) -> Option<i64> {
        match self {
            MessageTarget::Private(_) => None,
            MessageTarget::Group(id) => Some(*id),
        }
    }
}

/// A persisted chat message.
///
/// Immutable once written, except for `status` (private messages only).
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Unique message identifier (UUID v7, time-sortable)
    pub id: String,
    pub sender_id: i64,
    pub target: MessageTarget,
    pub content: String,
    /// Delivery state. For group messages this stays DELIVERED on the row
    /// itself; per-recipient state lives in `message_recipients`.
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Wire representation shared by REST responses and pipeline payloads
    pub fn to_wire(&self) -> MessageWire {
        MessageWire {
            id: self.id.clone(),
            sender_id: self.sender_id,
            receiver_id: self.target.receiver_id(),
            group_id: self.target.group_id(),
            content: self.content.clone(),
            timestamp: self.created_at,
            status: self.status,
        }
    }
}

/// JSON shape of a message on the `messages` topic and in REST responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageWire {
    pub id: String,
    pub sender_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
}

/// DTO for creating a new message (commit phase input)
#[derive(Debug, Clone)]
pub struct MessageCreate {
    pub sender_id: i64,
    pub target: MessageTarget,
    pub content: String,
}

impl MessageCreate {
    pub fn new(sender_id: i64, target: MessageTarget, content: String) -> Self {
        Self {
            sender_id,
            target,
            content,
        }
    }

    /// Validate content before persistence
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.content.trim().is_empty() {
            return Err(MessageError::InvalidContent(
                "Content cannot be empty".to_string(),
            ));
        }
        if self.content.len() > MAX_CONTENT_LENGTH {
            return Err(MessageError::ContentTooLong {
                max: MAX_CONTENT_LENGTH,
                actual: self.content.len(),
            });
        }
        Ok(())
    }
}

/// Who has read and who is still pending on a group message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    pub read_by: Vec<String>,
    pub delivered_to: Vec<String>,
}

/// One per-recipient status row of a group message
#[derive(Debug, Clone, PartialEq)]
pub struct RecipientStatus {
    pub user_id: i64,
    pub status: DeliveryStatus,
}
