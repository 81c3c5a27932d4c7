use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use anesth_roster_core::types::NotificationKind;

use crate::{is_foreign_key_violation, to_rfc3339};

/// A notification row delivered to one user.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub read: i64,
    pub created_at: DateTime<Utc>,
}

/// Parameters required to create a notification.
pub struct NewNotification<'a> {
    pub recipient_id: &'a str,
    pub kind: NotificationKind,
    pub title: &'a str,
    pub body: &'a str,
    pub link: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Errors raised while reading or mutating notifications.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification not found")]
    NotFound,
    #[error("recipient does not exist")]
    MissingRecipient,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `notifications` table.
#[derive(Clone)]
pub struct NotificationRepository {
    pool: SqlitePool,
}

impl NotificationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a notification and returns the stored row.
    pub async fn insert(
        &self,
        notification: NewNotification<'_>,
    ) -> Result<Notification, NotificationError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO notifications \
             (id, recipient_id, kind, title, body, link, read, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(notification.recipient_id)
        .bind(notification.kind.as_str())
        .bind(notification.title)
        .bind(notification.body)
        .bind(notification.link)
        .bind(to_rfc3339(notification.created_at))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                NotificationError::MissingRecipient
            } else {
                NotificationError::Database(err)
            }
        })?;

        self.fetch(&id).await
    }

    /// Fetches one notification by id.
    pub async fn fetch(&self, id: &str) -> Result<Notification, NotificationError> {
        sqlx::query_as::<_, Notification>("SELECT * FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(NotificationError::NotFound)
    }

    /// Lists a user's notifications, newest first.
    pub async fn list_for_user(
        &self,
        recipient_id: &str,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>, NotificationError> {
        let sql = if unread_only {
            "SELECT * FROM notifications WHERE recipient_id = ? AND read = 0 \
             ORDER BY created_at DESC LIMIT ?"
        } else {
            "SELECT * FROM notifications WHERE recipient_id = ? \
             ORDER BY created_at DESC LIMIT ?"
        };
        Ok(sqlx::query_as::<_, Notification>(sql)
            .bind(recipient_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Marks one notification as read, scoped to its recipient.
    pub async fn mark_read(
        &self,
        id: &str,
        recipient_id: &str,
    ) -> Result<(), NotificationError> {
        let result =
            sqlx::query("UPDATE notifications SET read = 1 WHERE id = ? AND recipient_id = ?")
                .bind(id)
                .bind(recipient_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(NotificationError::NotFound);
        }
        Ok(())
    }

    /// Marks every unread notification of a user as read, returning the count.
    pub async fn mark_all_read(&self, recipient_id: &str) -> Result<u64, NotificationError> {
        let result =
            sqlx::query("UPDATE notifications SET read = 1 WHERE recipient_id = ? AND read = 0")
                .bind(recipient_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Deletes a batch of read notifications older than the threshold.
    pub async fn delete_read_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM notifications WHERE id IN ( \
                 SELECT id FROM notifications WHERE read = 1 AND created_at < ? LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// An audit trail row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: String,
    pub actor_id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub detail_json: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters required to append an audit entry.
pub struct NewAuditEntry<'a> {
    pub actor_id: &'a str,
    pub action: &'a str,
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Errors raised while appending audit entries.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to serialize audit detail: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `audit_log` table.
#[derive(Clone)]
pub struct AuditLogRepository {
    pool: SqlitePool,
}

impl AuditLogRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends one audit entry.
    pub async fn append(&self, entry: NewAuditEntry<'_>) -> Result<(), AuditError> {
        sqlx::query(
            "INSERT INTO audit_log \
             (id, actor_id, action, entity_type, entity_id, detail_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(entry.actor_id)
        .bind(entry.action)
        .bind(entry.entity_type)
        .bind(entry.entity_id)
        .bind(serde_json::to_string(&entry.detail)?)
        .bind(to_rfc3339(entry.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Lists recent entries for one entity.
    pub async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(sqlx::query_as::<_, AuditEntry>(
            "SELECT * FROM audit_log WHERE entity_type = ? AND entity_id = ? \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Deletes a batch of entries older than the threshold.
    pub async fn delete_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM audit_log WHERE id IN ( \
                 SELECT id FROM audit_log WHERE created_at < ? LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
