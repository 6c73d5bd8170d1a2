use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A queued outbound message. Rows are never updated after insert.
#[derive(Debug, Clone, FromRow)]
pub struct OutboxMessage {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub report: bool,
    pub delete_when_done: bool,
    pub body: String,
}

impl OutboxMessage {
    /// Whether the message may be removed from the outbox, given all of its recipients.
    /// `PgStore::delete_completed` applies the same rule in SQL.
    #[cfg(test)]
    pub fn is_complete(&self, recipients: &[Recipient]) -> bool {
        self.delete_when_done
            && recipients
                .iter()
                .all(|r| r.sent_at.is_some() && (!self.report || r.reported_at.is_some()))
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Recipient {
    pub id: i64,
    pub message_id: i64,
    pub number: String,
    pub destination_id: i64,
    pub sent_at: Option<DateTime<Utc>>,
    pub reported_at: Option<DateTime<Utc>>,
}

/// Inbox row before it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInboxMessage {
    pub received_at: DateTime<Utc>,
    pub number: String,
    pub source_id: i64,
    pub body: String,
    pub note: String,
}

/// One `number[=dstId]` entry of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecipient {
    pub number: String,
    pub destination_id: i64,
}

/// A validated submission from an inbound listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub source: String,
    pub recipients: Vec<NewRecipient>,
    pub report: bool,
    pub delete_when_done: bool,
    pub body: String,
}
