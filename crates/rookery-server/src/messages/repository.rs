//! Message store for Rookery Server
//!
//! Owns the `messages` and `message_recipients` tables. The commit phase of
//! a send goes through [`MessageStore::create`], which persists the message
//! row and all per-recipient status rows in one transaction; everything else
//! here is reads and the conditional forward-only status updates.

use super::types::{
    DeliveryStatus, Message, MessageCreate, MessageTarget, RecipientStatus,
};
use super::MessageError;
use crate::db::Database;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Repository for message persistence and status rows
#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Database>,
}

impl MessageStore {
    /// Create a new message store
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// The underlying database handle (seeding and diagnostics)
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Persist a message and, for group sends, its per-recipient status rows.
    ///
    /// `recipients` must be the group members minus the sender, computed by
    /// the caller at send time; it is ignored for private targets. All rows
    /// are written in a single transaction so a partial fan-out can never be
    /// observed.
    #[instrument(skip(self, create), fields(sender = create.sender_id))]
    pub async fn create(
        &self,
        create: MessageCreate,
        recipients: &[i64],
    ) -> Result<Message, MessageError> {
        create.validate()?;

        // UUID v7 for time-sortable ids
        let id = Uuid::now_v7().to_string();
        let created_at = Utc::now();

        let conn = self.db.connection();
        let conn = conn.lock().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| MessageError::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        tx.execute(
            r#"
            INSERT INTO messages (id, sender_id, receiver_id, group_id, content, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            libsql::params![
                id.clone(),
                create.sender_id,
                create.target.receiver_id(),
                create.target.group_id(),
                create.content.clone(),
                DeliveryStatus::Delivered.as_str(),
                created_at.to_rfc3339()
            ],
        )
        .await
        .map_err(|e| MessageError::DatabaseError(format!("Failed to insert message: {}", e)))?;

        if matches!(create.target, MessageTarget::Group(_)) {
            for user_id in recipients {
                tx.execute(
                    r#"
                    INSERT INTO message_recipients (message_id, user_id, status)
                    VALUES (?, ?, ?)
                    "#,
                    libsql::params![id.clone(), *user_id, DeliveryStatus::Delivered.as_str()],
                )
                .await
                .map_err(|e| {
                    MessageError::DatabaseError(format!("Failed to insert recipient row: {}", e))
                })?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| MessageError::DatabaseError(format!("Failed to commit send: {}", e)))?;

        debug!(message_id = %id, "Committed message");

        Ok(Message {
            id,
            sender_id: create.sender_id,
            target: create.target,
            content: create.content,
            status: DeliveryStatus::Delivered,
            created_at,
        })
    }

    /// Get a message by ID
    #[instrument(skip(self))]
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Message>, MessageError> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut rows = conn
            .query(
                r#"
                SELECT id, sender_id, receiver_id, group_id, content, status, created_at
                FROM messages
                WHERE id = ?
                "#,
                libsql::params![id],
            )
            .await
            .map_err(|e| MessageError::DatabaseError(format!("Failed to query message: {}", e)))?;

        match rows.next().await.map_err(|e| {
            MessageError::DatabaseError(format!("Failed to read message row: {}", e))
        })? {
            Some(row) => Ok(Some(row_to_message(&row)?)),
            None => Ok(None),
        }
    }

    /// Private chat history between two users, newest first
    #[instrument(skip(self))]
    pub async fn private_history(
        &self,
        user_a: i64,
        user_b: i64,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<Message>, MessageError> {
        self.query_messages(
            r#"
            SELECT id, sender_id, receiver_id, group_id, content, status, created_at
            FROM messages
            WHERE (sender_id = ?1 AND receiver_id = ?2)
               OR (sender_id = ?2 AND receiver_id = ?1)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3 OFFSET ?4
            "#,
            libsql::params![
                user_a,
                user_b,
                per_page as i64,
                page_offset(page, per_page)
            ],
        )
        .await
    }

    /// Group chat history, newest first
    #[instrument(skip(self))]
    pub async fn group_history(
        &self,
        group_id: i64,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<Message>, MessageError> {
        self.query_messages(
            r#"
            SELECT id, sender_id, receiver_id, group_id, content, status, created_at
            FROM messages
            WHERE group_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
            libsql::params![group_id, per_page as i64, page_offset(page, per_page)],
        )
        .await
    }

    /// Conditionally advance a private message to READ.
    ///
    /// The WHERE clause enforces the state machine: only the receiver, only
    /// from DELIVERED. Returns whether a genuine transition happened, so the
    /// caller can decide on receipt emission. Repeat calls affect no rows.
    #[instrument(skip(self))]
    pub async fn mark_private_read(
        &self,
        message_id: &str,
        user_id: i64,
    ) -> Result<bool, MessageError> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let affected = conn
            .execute(
                r#"
                UPDATE messages SET status = 'READ'
                WHERE id = ? AND receiver_id = ? AND status = 'DELIVERED'
                "#,
                libsql::params![message_id, user_id],
            )
            .await
            .map_err(|e| {
                MessageError::DatabaseError(format!("Failed to mark message read: {}", e))
            })?;
        Ok(affected > 0)
    }

    /// Conditionally advance a group recipient row to READ.
    ///
    /// Same forward-only contract as [`mark_private_read`]: returns `true`
    /// only on a genuine DELIVERED -> READ transition.
    #[instrument(skip(self))]
    pub async fn mark_recipient_read(
        &self,
        message_id: &str,
        user_id: i64,
    ) -> Result<bool, MessageError> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let affected = conn
            .execute(
                r#"
                UPDATE message_recipients SET status = 'READ'
                WHERE message_id = ? AND user_id = ? AND status = 'DELIVERED'
                "#,
                libsql::params![message_id, user_id],
            )
            .await
            .map_err(|e| {
                MessageError::DatabaseError(format!("Failed to mark recipient read: {}", e))
            })?;
        Ok(affected > 0)
    }

    /// Whether a recipient status row exists for `(message_id, user_id)`
    #[instrument(skip(self))]
    pub async fn has_recipient_row(
        &self,
        message_id: &str,
        user_id: i64,
    ) -> Result<bool, MessageError> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT 1 FROM message_recipients WHERE message_id = ? AND user_id = ?",
                libsql::params![message_id, user_id],
            )
            .await
            .map_err(|e| {
                MessageError::DatabaseError(format!("Failed to query recipient row: {}", e))
            })?;
        let row = rows.next().await.map_err(|e| {
            MessageError::DatabaseError(format!("Failed to read recipient row: {}", e))
        })?;
        Ok(row.is_some())
    }

    /// All per-recipient status rows of a message, ordered by user id
    #[instrument(skip(self))]
    pub async fn recipient_statuses(
        &self,
        message_id: &str,
    ) -> Result<Vec<RecipientStatus>, MessageError> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut rows = conn
            .query(
                r#"
                SELECT user_id, status FROM message_recipients
                WHERE message_id = ?
                ORDER BY user_id
                "#,
                libsql::params![message_id],
            )
            .await
            .map_err(|e| {
                MessageError::DatabaseError(format!("Failed to query recipient statuses: {}", e))
            })?;

        let mut statuses = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| {
            MessageError::DatabaseError(format!("Failed to read status row: {}", e))
        })? {
            let user_id: i64 = row.get(0).map_err(|e| {
                MessageError::DatabaseError(format!("Failed to get user_id: {}", e))
            })?;
            let status: String = row.get(1).map_err(|e| {
                MessageError::DatabaseError(format!("Failed to get status: {}", e))
            })?;
            statuses.push(RecipientStatus {
                user_id,
                status: DeliveryStatus::parse(&status)?,
            });
        }
        Ok(statuses)
    }

    /// Count of messages from `contact_id` to `user_id` still DELIVERED
    #[instrument(skip(self))]
    pub async fn unread_from_contact(
        &self,
        user_id: i64,
        contact_id: i64,
    ) -> Result<i64, MessageError> {
        self.query_count(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE sender_id = ? AND receiver_id = ? AND status = 'DELIVERED'
            "#,
            libsql::params![contact_id, user_id],
        )
        .await
    }

    /// Count of `user_id`'s own group recipient rows still DELIVERED
    #[instrument(skip(self))]
    pub async fn unread_in_group(
        &self,
        user_id: i64,
        group_id: i64,
    ) -> Result<i64, MessageError> {
        self.query_count(
            r#"
            SELECT COUNT(*) FROM message_recipients mr
            JOIN messages m ON m.id = mr.message_id
            WHERE mr.user_id = ? AND m.group_id = ? AND mr.status = 'DELIVERED'
            "#,
            libsql::params![user_id, group_id],
        )
        .await
    }

    /// The most recent private message between two users, if any
    #[instrument(skip(self))]
    pub async fn last_private_message(
        &self,
        user_a: i64,
        user_b: i64,
    ) -> Result<Option<Message>, MessageError> {
        Ok(self
            .query_messages(
                r#"
                SELECT id, sender_id, receiver_id, group_id, content, status, created_at
                FROM messages
                WHERE (sender_id = ?1 AND receiver_id = ?2)
                   OR (sender_id = ?2 AND receiver_id = ?1)
                ORDER BY created_at DESC, id DESC
                LIMIT 1
                "#,
                libsql::params![user_a, user_b],
            )
            .await?
            .into_iter()
            .next())
    }

    /// The most recent message in a group, if any
    #[instrument(skip(self))]
    pub async fn last_group_message(
        &self,
        group_id: i64,
    ) -> Result<Option<Message>, MessageError> {
        Ok(self
            .query_messages(
                r#"
                SELECT id, sender_id, receiver_id, group_id, content, status, created_at
                FROM messages
                WHERE group_id = ?
                ORDER BY created_at DESC, id DESC
                LIMIT 1
                "#,
                libsql::params![group_id],
            )
            .await?
            .into_iter()
            .next())
    }

    /// Aggregate status of a group message: READ only when every non-sender
    /// recipient row is READ, else DELIVERED. A message with no recipient
    /// rows (sender was the only member at send time) reports DELIVERED.
    #[instrument(skip(self))]
    pub async fn group_aggregate_status(
        &self,
        message_id: &str,
    ) -> Result<DeliveryStatus, MessageError> {
        let statuses = self.recipient_statuses(message_id).await?;
        if !statuses.is_empty()
            && statuses.iter().all(|s| s.status == DeliveryStatus::Read)
        {
            Ok(DeliveryStatus::Read)
        } else {
            Ok(DeliveryStatus::Delivered)
        }
    }

    async fn query_messages(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Message>, MessageError> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut rows = conn
            .query(sql, params)
            .await
            .map_err(|e| MessageError::DatabaseError(format!("Failed to query messages: {}", e)))?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| {
            MessageError::DatabaseError(format!("Failed to read message row: {}", e))
        })? {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    async fn query_count(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<i64, MessageError> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut rows = conn
            .query(sql, params)
            .await
            .map_err(|e| MessageError::DatabaseError(format!("Failed to query count: {}", e)))?;

        match rows.next().await.map_err(|e| {
            MessageError::DatabaseError(format!("Failed to read count row: {}", e))
        })? {
            Some(row) => row
                .get(0)
                .map_err(|e| MessageError::DatabaseError(format!("Failed to get count: {}", e))),
            None => Ok(0),
        }
    }
}

/// Row offset for a page. `page` comes straight from the query string, so
/// the multiplication must not overflow; anything past i64::MAX is an empty
/// page anyway.
fn page_offset(page: usize, per_page: usize) -> i64 {
    page.saturating_mul(per_page)
        .try_into()
        .unwrap_or(i64::MAX)
}

/// Convert a database row to a Message
fn row_to_message(row: &libsql::Row) -> Result<Message, MessageError> {
    let id: String = row
        .get(0)
        .map_err(|e| MessageError::DatabaseError(format!("Failed to get message id: {}", e)))?;
    let sender_id: i64 = row
        .get(1)
        .map_err(|e| MessageError::DatabaseError(format!("Failed to get sender_id: {}", e)))?;
    let receiver_id: Option<i64> = row.get(2).ok();
    let group_id: Option<i64> = row.get(3).ok();
    let content: String = row
        .get(4)
        .map_err(|e| MessageError::DatabaseError(format!("Failed to get content: {}", e)))?;
    let status: String = row
        .get(5)
        .map_err(|e| MessageError::DatabaseError(format!("Failed to get status: {}", e)))?;
    let created_at_str: String = row
        .get(6)
        .map_err(|e| MessageError::DatabaseError(format!("Failed to get created_at: {}", e)))?;

    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MessageError::DatabaseError(format!("Failed to parse created_at: {}", e)))?;

    Ok(Message {
        id,
        sender_id,
        target: MessageTarget::from_parts(receiver_id, group_id)?,
        content,
        status: DeliveryStatus::parse(&status)?,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MigrationRunner;

    async fn create_test_store() -> MessageStore {
        let db = Database::in_memory("test-messages").await.unwrap();
        let db = Arc::new(db);
        MigrationRunner::chat().run(&db).await.unwrap();
        db.execute("INSERT INTO users (username) VALUES ('alice'), ('bob'), ('carol')")
            .await
            .unwrap();
        db.execute("INSERT INTO groups (name) VALUES ('penguins')")
            .await
            .unwrap();
        db.execute("INSERT INTO group_members (group_id, user_id) VALUES (1, 1), (1, 2), (1, 3)")
            .await
            .unwrap();
        MessageStore::new(db)
    }

    #[tokio::test]
    async fn test_private_create_and_get() {
        let store = create_test_store().await;

        let create = MessageCreate::new(1, MessageTarget::Private(2), "hi".to_string());
        let message = store.create(create, &[]).await.unwrap();
        assert_eq!(message.status, DeliveryStatus::Delivered);

        let retrieved = store.get_by_id(&message.id).await.unwrap().unwrap();
        assert_eq!(retrieved, message);
    }

    #[tokio::test]
    async fn test_group_fanout_rows_equal_members_minus_sender() {
        let store = create_test_store().await;

        let create = MessageCreate::new(1, MessageTarget::Group(1), "hello all".to_string());
        let message = store.create(create, &[2, 3]).await.unwrap();

        let statuses = store.recipient_statuses(&message.id).await.unwrap();
        assert_eq!(
            statuses,
            vec![
                RecipientStatus {
                    user_id: 2,
                    status: DeliveryStatus::Delivered
                },
                RecipientStatus {
                    user_id: 3,
                    status: DeliveryStatus::Delivered
                },
            ]
        );
        assert!(!store.has_recipient_row(&message.id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_recipient_rows_never_resized() {
        let store = create_test_store().await;
        let message = store
            .create(
                MessageCreate::new(1, MessageTarget::Group(1), "before".to_string()),
                &[2, 3],
            )
            .await
            .unwrap();

        // Membership changes after send must not affect existing rows
        store
            .db
            .execute("DELETE FROM group_members WHERE group_id = 1 AND user_id = 3")
            .await
            .unwrap();

        let statuses = store.recipient_statuses(&message.id).await.unwrap();
        assert_eq!(statuses.len(), 2);
    }

    #[tokio::test]
    async fn test_mark_private_read_idempotent() {
        let store = create_test_store().await;
        let message = store
            .create(
                MessageCreate::new(1, MessageTarget::Private(2), "hi".to_string()),
                &[],
            )
            .await
            .unwrap();

        // First call transitions, second is a no-op
        assert!(store.mark_private_read(&message.id, 2).await.unwrap());
        assert!(!store.mark_private_read(&message.id, 2).await.unwrap());

        let updated = store.get_by_id(&message.id).await.unwrap().unwrap();
        assert_eq!(updated.status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn test_mark_private_read_wrong_user_is_noop() {
        let store = create_test_store().await;
        let message = store
            .create(
                MessageCreate::new(1, MessageTarget::Private(2), "hi".to_string()),
                &[],
            )
            .await
            .unwrap();

        // Sender (or anyone but the receiver) cannot transition the row
        assert!(!store.mark_private_read(&message.id, 1).await.unwrap());
        assert!(!store.mark_private_read(&message.id, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_group_aggregate_status() {
        let store = create_test_store().await;
        let message = store
            .create(
                MessageCreate::new(1, MessageTarget::Group(1), "hello".to_string()),
                &[2, 3],
            )
            .await
            .unwrap();

        assert_eq!(
            store.group_aggregate_status(&message.id).await.unwrap(),
            DeliveryStatus::Delivered
        );

        assert!(store.mark_recipient_read(&message.id, 2).await.unwrap());
        assert_eq!(
            store.group_aggregate_status(&message.id).await.unwrap(),
            DeliveryStatus::Delivered
        );

        assert!(store.mark_recipient_read(&message.id, 3).await.unwrap());
        assert_eq!(
            store.group_aggregate_status(&message.id).await.unwrap(),
            DeliveryStatus::Read
        );

        // Repeat read is a no-op
        assert!(!store.mark_recipient_read(&message.id, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_history_descending_and_paged() {
        let store = create_test_store().await;
        for i in 0..5 {
            store
                .create(
                    MessageCreate::new(1, MessageTarget::Private(2), format!("msg {}", i)),
                    &[],
                )
                .await
                .unwrap();
        }

        let page0 = store.private_history(1, 2, 0, 3).await.unwrap();
        assert_eq!(page0.len(), 3);
        assert_eq!(page0[0].content, "msg 4");
        assert!(page0[0].created_at >= page0[1].created_at);

        let page1 = store.private_history(1, 2, 1, 3).await.unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[1].content, "msg 0");
    }

    #[tokio::test]
    async fn test_history_huge_page_is_empty_not_panic() {
        let store = create_test_store().await;
        store
            .create(
                MessageCreate::new(1, MessageTarget::Private(2), "hi".to_string()),
                &[],
            )
            .await
            .unwrap();

        let page = store.private_history(1, 2, usize::MAX, 50).await.unwrap();
        assert!(page.is_empty());
        let page = store.group_history(1, usize::MAX, 50).await.unwrap();
        assert!(page.is_empty());
        assert_eq!(page_offset(usize::MAX, 50), i64::MAX);
    }

    #[tokio::test]
    async fn test_unread_counts() {
        let store = create_test_store().await;

        for _ in 0..3 {
            store
                .create(
                    MessageCreate::new(1, MessageTarget::Private(2), "ping".to_string()),
                    &[],
                )
                .await
                .unwrap();
        }
        // Message in the other direction must not count
        store
            .create(
                MessageCreate::new(2, MessageTarget::Private(1), "pong".to_string()),
                &[],
            )
            .await
            .unwrap();

        assert_eq!(store.unread_from_contact(2, 1).await.unwrap(), 3);
        assert_eq!(store.unread_from_contact(1, 2).await.unwrap(), 1);

        let group_msg = store
            .create(
                MessageCreate::new(1, MessageTarget::Group(1), "hello".to_string()),
                &[2, 3],
            )
            .await
            .unwrap();
        assert_eq!(store.unread_in_group(2, 1).await.unwrap(), 1);
        store.mark_recipient_read(&group_msg.id, 2).await.unwrap();
        assert_eq!(store.unread_in_group(2, 1).await.unwrap(), 0);
        assert_eq!(store.unread_in_group(3, 1).await.unwrap(), 1);
    }
}
