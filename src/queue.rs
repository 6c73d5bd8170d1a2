//! Postgres implementation of [`Store`].

use crate::error::StoreResult;
use crate::models::{NewInboxMessage, OutboxMessage, Recipient, Submission};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query_as, PgPool, Row};
use tracing::instrument;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    num_to_id_sql: Option<String>,
}

impl PgStore {
    pub fn new(pool: PgPool, num_to_id_sql: Option<String>) -> Self {
        Self {
            pool,
            num_to_id_sql,
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn pending_messages(&self) -> StoreResult<Vec<OutboxMessage>> {
        let messages = query_as::<_, OutboxMessage>(
            r#"
            SELECT o.id, o.created_at, o.source, o.report, o.delete_when_done, o.body
            FROM smsd_outbox o
            WHERE EXISTS (
                SELECT 1 FROM smsd_recipients r
                WHERE r.message_id = o.id AND r.sent_at IS NULL
            )
            ORDER BY o.created_at, o.id
            "#,
        )
            .fetch_all(&self.pool)
            .await?;

        Ok(messages)
    }

    async fn unsent_recipients(&self, message_id: i64) -> StoreResult<Vec<Recipient>> {
        let recipients = query_as::<_, Recipient>(
            r#"
            SELECT id, message_id, number, destination_id, sent_at, reported_at
            FROM smsd_recipients
            WHERE message_id = $1 AND sent_at IS NULL
            ORDER BY id
            "#,
        )
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(recipients)
    }

    async fn mark_sent(&self, recipient_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE smsd_recipients
            SET sent_at = $1
            WHERE id = $2 AND sent_at IS NULL
            "#,
        )
            .bind(at)
            .bind(recipient_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn report_candidates(
        &self,
        number: &str,
        local_prefix: Option<&str>,
    ) -> StoreResult<Vec<Recipient>> {
        let recipients = query_as::<_, Recipient>(
            r#"
            SELECT id, message_id, number, destination_id, sent_at, reported_at
            FROM smsd_recipients
            WHERE reported_at IS NULL
                AND sent_at IS NOT NULL
                AND (number = $1 OR ($2::TEXT IS NOT NULL AND $2::TEXT || number = $1))
            "#,
        )
            .bind(number)
            .bind(local_prefix)
            .fetch_all(&self.pool)
            .await?;

        Ok(recipients)
    }

    async fn mark_reported(&self, recipient_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE smsd_recipients
            SET reported_at = $1
            WHERE id = $2 AND reported_at IS NULL AND sent_at IS NOT NULL
            "#,
        )
            .bind(at)
            .bind(recipient_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn source_id_for(&self, number: &str) -> StoreResult<Option<i64>> {
        let Some(sql) = self.num_to_id_sql.as_deref() else {
            return Ok(None);
        };
        let row = sqlx::query(sql).bind(number).fetch_optional(&self.pool).await?;
        let Some(row) = row else {
            return Ok(None);
        };
        // The lookup is user supplied, so accept either integer width.
        let id = match row.try_get::<Option<i64>, _>(0) {
            Ok(id) => id,
            Err(_) => row.try_get::<Option<i32>, _>(0)?.map(i64::from),
        };
        Ok(id)
    }

    async fn insert_inbox(&self, message: &NewInboxMessage) -> StoreResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO smsd_inbox (received_at, number, source_id, body, note)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
            .bind(message.received_at)
            .bind(&message.number)
            .bind(message.source_id)
            .bind(&message.body)
            .bind(&message.note)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("id")?)
    }

    async fn insert_submission(&self, submission: &Submission) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO smsd_outbox (created_at, source, report, delete_when_done, body)
            VALUES (NOW(), $1, $2, $3, $4)
            RETURNING id
            "#,
        )
            .bind(&submission.source)
            .bind(submission.report)
            .bind(submission.delete_when_done)
            .bind(&submission.body)
            .fetch_one(&mut *tx)
            .await?;
        let message_id: i64 = row.try_get("id")?;

        for recipient in &submission.recipients {
            sqlx::query(
                r#"
                INSERT INTO smsd_recipients (message_id, number, destination_id)
                VALUES ($1, $2, $3)
                "#,
            )
                .bind(message_id)
                .bind(&recipient.number)
                .bind(recipient.destination_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(message_id)
    }

    async fn delete_completed(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM smsd_outbox o
            WHERE o.delete_when_done
                AND NOT EXISTS (
                    SELECT 1 FROM smsd_recipients r
                    WHERE r.message_id = o.id
                        AND (r.sent_at IS NULL OR (o.report AND r.reported_at IS NULL))
                )
            "#,
        )
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::SCHEMA;
    use crate::models::NewRecipient;
    use chrono::Duration;
    use sqlx::Executor;

    fn submission(report: bool, numbers: &[&str]) -> Submission {
        Submission {
            source: "app1".into(),
            recipients: numbers
                .iter()
                .map(|n| NewRecipient {
                    number: n.to_string(),
                    destination_id: 0,
                })
                .collect(),
            report,
            delete_when_done: true,
            body: "Hello".into(),
        }
    }

    /// These tests need a running Postgres database (DATABASE_URL).
    #[sqlx::test(migrations = false)]
    #[ignore = "requires Postgres"]
    async fn test_submission_round_trip(pool: PgPool) {
        pool.execute(SCHEMA).await.expect("Failed to create schema");
        let store = PgStore::new(pool, None);

        let id = store.insert_submission(&submission(false, &["600111222", "600333444"])).await.unwrap();

        let pending = store.pending_messages().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);

        let recipients = store.unsent_recipients(id).await.unwrap();
        assert_eq!(recipients.len(), 2);

        for r in &recipients {
            store.mark_sent(r.id, Utc::now()).await.unwrap();
        }
        assert!(store.pending_messages().await.unwrap().is_empty());
        assert_eq!(store.delete_completed().await.unwrap(), 1);
    }

    #[sqlx::test(migrations = false)]
    #[ignore = "requires Postgres"]
    async fn test_reported_messages_wait_for_reports(pool: PgPool) {
        pool.execute(SCHEMA).await.expect("Failed to create schema");
        let store = PgStore::new(pool, None);

        let id = store.insert_submission(&submission(true, &["600111222"])).await.unwrap();
        let recipient = store.unsent_recipients(id).await.unwrap().remove(0);
        let sent = Utc::now();
        store.mark_sent(recipient.id, sent).await.unwrap();
        assert_eq!(store.delete_completed().await.unwrap(), 0);

        let candidates = store.report_candidates("+48600111222", Some("+48")).await.unwrap();
        assert_eq!(candidates.len(), 1);
        store.mark_reported(candidates[0].id, sent + Duration::seconds(5)).await.unwrap();

        assert!(store.report_candidates("600111222", None).await.unwrap().is_empty());
        assert_eq!(store.delete_completed().await.unwrap(), 1);
    }

    #[sqlx::test(migrations = false)]
    #[ignore = "requires Postgres"]
    async fn test_unsent_recipients_are_never_reported(pool: PgPool) {
        pool.execute(SCHEMA).await.expect("Failed to create schema");
        let store = PgStore::new(pool, None);

        let id = store.insert_submission(&submission(true, &["600111222"])).await.unwrap();
        let recipient = store.unsent_recipients(id).await.unwrap().remove(0);
        store.mark_reported(recipient.id, Utc::now()).await.unwrap();

        let recipient = store.unsent_recipients(id).await.unwrap().remove(0);
        assert_eq!(recipient.reported_at, None);
    }

    #[sqlx::test(migrations = false)]
    #[ignore = "requires Postgres"]
    async fn test_source_lookup(pool: PgPool) {
        pool.execute(SCHEMA).await.expect("Failed to create schema");
        pool.execute("CREATE TABLE phones (id INT NOT NULL, number TEXT NOT NULL); INSERT INTO phones VALUES (42, '+48600111222')")
            .await
            .unwrap();
        let store = PgStore::new(pool, Some("SELECT id FROM phones WHERE number = $1".into()));

        assert_eq!(store.source_id_for("+48600111222").await.unwrap(), Some(42));
        assert_eq!(store.source_id_for("+48600999999").await.unwrap(), None);
    }
}
