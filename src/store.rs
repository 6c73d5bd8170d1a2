//! The durable queue as seen by the daemon.

use crate::error::StoreResult;
use crate::models::{NewInboxMessage, OutboxMessage, Recipient, Submission};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait Store: Send + Sync {
    /// Outbox messages with at least one recipient not yet sent, oldest first.
    async fn pending_messages(&self) -> StoreResult<Vec<OutboxMessage>>;

    async fn unsent_recipients(&self, message_id: i64) -> StoreResult<Vec<Recipient>>;

    /// Stamps `sent_at` unless it is already set.
    async fn mark_sent(&self, recipient_id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    /// Sent, unreported recipients whose number is `number`, either directly or
    /// once `local_prefix` is prepended to the stored number.
    async fn report_candidates(
        &self,
        number: &str,
        local_prefix: Option<&str>,
    ) -> StoreResult<Vec<Recipient>>;

    /// Stamps `reported_at` on a sent recipient that has no report yet.
    async fn mark_reported(&self, recipient_id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    /// Resolves a sender number to a source id. `None` when there is no mapping
    /// or no lookup is configured.
    async fn source_id_for(&self, number: &str) -> StoreResult<Option<i64>>;

    async fn insert_inbox(&self, message: &NewInboxMessage) -> StoreResult<i64>;

    /// Inserts the outbox row and all recipient rows atomically.
    async fn insert_submission(&self, submission: &Submission) -> StoreResult<i64>;

    /// Removes every outbox message that is complete. Returns how many went.
    async fn delete_completed(&self) -> StoreResult<u64>;
}
