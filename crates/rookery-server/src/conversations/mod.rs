//! Conversation aggregator for Rookery Server
//!
//! Read-side view that merges 1:1 and group last-message/unread state into
//! one sorted list. Private entries come from the caller's contacts, group
//! entries from the caller's memberships; both are included even before any
//! message exists, sorted after all message-bearing conversations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

use crate::directory::Directory;
use crate::messages::{DeliveryStatus, MessageError, MessageStore};

/// Conversation kind discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversationKind {
    Private,
    Group,
}

/// One row of the merged conversation list
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Contact user id for private chats, group id for group chats
    pub id: i64,
    /// Contact username or group name
    pub name: String,
    pub kind: ConversationKind,
    pub last_message: Option<String>,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub last_message_sender_id: Option<i64>,
    /// For groups this is the aggregate: READ only once every non-sender
    /// recipient has read the last message
    pub last_message_status: Option<DeliveryStatus>,
    pub unread_count: i64,
}

/// Builds the merged, sorted conversation view for a user
#[derive(Clone)]
pub struct ConversationAggregator {
    store: Arc<MessageStore>,
    directory: Directory,
}

impl ConversationAggregator {
    pub fn new(store: Arc<MessageStore>, directory: Directory) -> Self {
        Self { store, directory }
    }

    /// All conversations of a user, newest last-message first; conversations
    /// without any message sort last rather than being excluded.
    #[instrument(skip(self))]
    pub async fn conversations(
        &self,
        user_id: i64,
    ) -> Result<Vec<ConversationSummary>, MessageError> {
        let mut summaries = Vec::new();

        for contact_id in self.directory.contacts_of(user_id).await? {
            summaries.push(self.private_summary(user_id, contact_id).await?);
        }
        for group_id in self.directory.groups_of(user_id).await? {
            summaries.push(self.group_summary(user_id, group_id).await?);
        }

        // Descending by last-message time, message-less conversations last
        summaries.sort_by(|a, b| {
            match (b.last_message_timestamp, a.last_message_timestamp) {
                (Some(tb), Some(ta)) => tb.cmp(&ta),
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (None, None) => a.name.cmp(&b.name),
            }
        });

        Ok(summaries)
    }

    async fn private_summary(
        &self,
        user_id: i64,
        contact_id: i64,
    ) -> Result<ConversationSummary, MessageError> {
        let name = self.directory.username_of(contact_id).await?;
        let last = self.store.last_private_message(user_id, contact_id).await?;
        let unread = self.store.unread_from_contact(user_id, contact_id).await?;

        Ok(ConversationSummary {
            id: contact_id,
            name,
            kind: ConversationKind::Private,
            last_message: last.as_ref().map(|m| m.content.clone()),
            last_message_timestamp: last.as_ref().map(|m| m.created_at),
            last_message_sender_id: last.as_ref().map(|m| m.sender_id),
            last_message_status: last.as_ref().map(|m| m.status),
            unread_count: unread,
        })
    }

    async fn group_summary(
        &self,
        user_id: i64,
        group_id: i64,
    ) -> Result<ConversationSummary, MessageError> {
        let name = self.directory.group_name(group_id).await?;
        let last = self.store.last_group_message(group_id).await?;
        let unread = self.store.unread_in_group(user_id, group_id).await?;

        let status = match &last {
            Some(message) => Some(self.store.group_aggregate_status(&message.id).await?),
            None => None,
        };

        Ok(ConversationSummary {
            id: group_id,
            name,
            kind: ConversationKind::Group,
            last_message: last.as_ref().map(|m| m.content.clone()),
            last_message_timestamp: last.as_ref().map(|m| m.created_at),
            last_message_sender_id: last.as_ref().map(|m| m.sender_id),
            last_message_status: status,
            unread_count: unread,
        })
    }
}
