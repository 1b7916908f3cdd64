//! Chat service: the send pipeline and the status state machine.
//!
//! This is where the two-phase send lives. The commit phase validates
//! authorization against the directory and persists through the message
//! store; the publish phase pushes the committed fact onto the fan-out
//! pipeline and is allowed to fail without failing the request.
//!
//! `mark_read` implements the DELIVERED -> READ state machine for both
//! private and group messages; a read receipt is emitted at most once per
//! message, on the genuine transition of a private message.

use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::repository::MessageStore;
use super::types::{Message, MessageCreate, MessageInfo, MessageTarget};
use super::{DeliveryStatus, MessageError};
use crate::directory::Directory;
use crate::pipeline::{Pipeline, PipelineEvent, ReadReceiptEvent};

/// Business operations over messages
#[derive(Clone)]
pub struct ChatService {
    store: Arc<MessageStore>,
    directory: Directory,
    pipeline: Pipeline,
}

impl ChatService {
    pub fn new(store: Arc<MessageStore>, directory: Directory, pipeline: Pipeline) -> Self {
        Self {
            store,
            directory,
            pipeline,
        }
    }

    /// Send a message: validate, commit, publish.
    ///
    /// Group sends require membership; private sends require that the
    /// receiver exists and has not blocked the sender. Recipient status rows
    /// are computed from membership at send time and never resized later.
    #[instrument(skip(self, content), fields(sender = sender_id))]
    pub async fn send_message(
        &self,
        sender_id: i64,
        target: MessageTarget,
        content: String,
    ) -> Result<Message, MessageError> {
        let recipients = match target {
            MessageTarget::Group(group_id) => {
                let members = self.directory.group_members(group_id).await?;
                if !members.contains(&sender_id) {
                    return Err(MessageError::NotGroupMember(group_id));
                }
                members.into_iter().filter(|m| *m != sender_id).collect()
            }
            MessageTarget::Private(receiver_id) => {
                // Existence check; also surfaces UserNotFound before any write
                self.directory.username_of(receiver_id).await?;
                if self.directory.is_blocked(receiver_id, sender_id).await? {
                    return Err(MessageError::Blocked);
                }
                Vec::new()
            }
        };

        // Commit phase: message + recipient rows, one transaction
        let message = self
            .store
            .create(MessageCreate::new(sender_id, target, content), &recipients)
            .await?;

        // Publish phase: fire-and-forget, never fails the send
        self.pipeline
            .publish(PipelineEvent::Message(message.to_wire()));

        Ok(message)
    }

    /// Advance a message to READ for `user_id`.
    ///
    /// State machine rules:
    /// - the sender calling this is a no-op, not an error
    /// - private: only the receiver may transition; repeat calls are no-ops
    /// - group: only holders of a recipient status row may transition
    /// - a receipt is emitted only on a genuine private DELIVERED -> READ
    #[instrument(skip(self))]
    pub async fn mark_read(&self, user_id: i64, message_id: &str) -> Result<(), MessageError> {
        let message = self
            .store
            .get_by_id(message_id)
            .await?
            .ok_or_else(|| MessageError::NotFound(message_id.to_string()))?;

        if message.sender_id == user_id {
            debug!("Sender read of own message, ignoring");
            return Ok(());
        }

        match message.target {
            MessageTarget::Private(receiver_id) => {
                if receiver_id != user_id {
                    return Err(MessageError::Forbidden);
                }
                if !message.status.can_advance_to(DeliveryStatus::Read) {
                    debug!("Message already read, ignoring");
                    return Ok(());
                }
                let transitioned = self.store.mark_private_read(message_id, user_id).await?;
                if transitioned {
                    self.emit_read_receipt(&message, user_id).await;
                }
            }
            MessageTarget::Group(_) => {
                if !self.store.has_recipient_row(message_id, user_id).await? {
                    return Err(MessageError::Forbidden);
                }
                self.store.mark_recipient_read(message_id, user_id).await?;
            }
        }

        Ok(())
    }

    /// Who has read / who is still pending on a group message
    #[instrument(skip(self))]
    pub async fn message_info(&self, message_id: &str) -> Result<MessageInfo, MessageError> {
        self.store
            .get_by_id(message_id)
            .await?
            .ok_or_else(|| MessageError::NotFound(message_id.to_string()))?;

        let statuses = self.store.recipient_statuses(message_id).await?;
        let mut read_by = Vec::new();
        let mut delivered_to = Vec::new();
        for entry in statuses {
            let username = self.directory.username_of(entry.user_id).await?;
            match entry.status {
                DeliveryStatus::Read => read_by.push(username),
                DeliveryStatus::Delivered => delivered_to.push(username),
            }
        }

        Ok(MessageInfo {
            read_by,
            delivered_to,
        })
    }

    /// Private history between the caller and another user, newest first
    #[instrument(skip(self))]
    pub async fn private_history(
        &self,
        caller: i64,
        other: i64,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<Message>, MessageError> {
        self.store.private_history(caller, other, page, per_page).await
    }

    /// Group history, newest first. Reads are authorized by membership.
    #[instrument(skip(self))]
    pub async fn group_history(
        &self,
        caller: i64,
        group_id: i64,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<Message>, MessageError> {
        if !self.directory.is_group_member(group_id, caller).await? {
            return Err(MessageError::NotGroupMember(group_id));
        }
        self.store.group_history(group_id, page, per_page).await
    }

    /// Resolve usernames and publish the receipt back toward the sender.
    ///
    /// The transition has already been committed; a directory or pipeline
    /// hiccup here degrades to a skipped notification, never an error.
    async fn emit_read_receipt(&self, message: &Message, reader_id: i64) {
        let sender = match self.directory.username_of(message.sender_id).await {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "Skipping read receipt, sender lookup failed");
                return;
            }
        };
        let receiver = match self.directory.username_of(reader_id).await {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "Skipping read receipt, receiver lookup failed");
                return;
            }
        };

        self.pipeline
            .publish(PipelineEvent::ReadReceipt(ReadReceiptEvent {
                message_id: message.id.clone(),
                sender_username: sender,
                receiver_username: receiver,
            }));
    }
}
