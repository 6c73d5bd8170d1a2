use crate::error::StoreResult;
use crate::models::{OutboxMessage, Recipient};
use crate::store::Store;
use crate::transport::Transport;
use crate::utils::check_number;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn, Span};

/// Sends the outbox to every recipient not yet sent.
///
/// Returns `Ok(true)` when the device failed; the pass stops at the first such failure.
#[instrument(skip_all, fields(messages_found = 0))]
pub async fn send_pending(store: &dyn Store, transport: &mut dyn Transport) -> StoreResult<bool> {
    let messages = store.pending_messages().await?;
    if messages.is_empty() {
        debug!("No messages to send.");
        return Ok(false);
    }
    Span::current().record("messages_found", messages.len());

    for msg in &messages {
        let recipients = store.unsent_recipients(msg.id).await?;
        for recipient in &recipients {
            if !send_one(store, transport, msg, recipient).await? {
                return Ok(true);
            }
        }
    }

    info!("Outbox pass complete.");
    Ok(false)
}

/// Returns `Ok(false)` on a device error.
async fn send_one(
    store: &dyn Store,
    transport: &mut dyn Transport,
    msg: &OutboxMessage,
    recipient: &Recipient,
) -> StoreResult<bool> {
    let number = recipient.number.as_str();
    if !check_number(number) {
        warn!(message_id = msg.id, recipient_id = recipient.id, %number, "Bad phone number, skipping.");
        return Ok(true);
    }

    match transport.send(number, &msg.body, msg.report).await {
        Ok(()) => {}
        Err(e) if e.is_encoding() => {
            warn!(message_id = msg.id, %number, "Can't encode message: {}", e);
            return Ok(true);
        }
        Err(e) => {
            error!(message_id = msg.id, %number, "Can't send message: {}", e);
            return Ok(false);
        }
    }

    if let Err(e) = store.mark_sent(recipient.id, Utc::now()).await {
        error!(
            message_id = msg.id,
            recipient_id = recipient.id,
            "Can't mark recipient as sent: {}. The message WILL be re-sent.",
            e
        );
        return Err(e);
    }
    info!(
        message_id = msg.id,
        recipient_id = recipient.id,
        destination_id = recipient.destination_id,
        source = %msg.source,
        queued_at = %msg.created_at,
        %number,
        report = msg.report,
        "Message sent."
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, ScriptedTransport};

    #[tokio::test]
    async fn sends_to_every_unsent_recipient() {
        let store = MemoryStore::new();
        let (id, recipients) = store.add_message(true, false, &["600111222", "+48600333444"]);
        let mut transport = ScriptedTransport::new();

        let failed = send_pending(&*store, &mut transport).await.unwrap();

        assert!(!failed);
        let sent = transport.script().sent.clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, body, report)| body == &format!("message {id}") && *report));
        let state = store.state();
        assert!(recipients.iter().all(|r| state.recipient(*r).sent_at.is_some()));
    }

    #[tokio::test]
    async fn skips_bad_numbers_without_failing() {
        let store = MemoryStore::new();
        let (_, recipients) = store.add_message(false, false, &["600-111", "600333444"]);
        let mut transport = ScriptedTransport::new();

        let failed = send_pending(&*store, &mut transport).await.unwrap();

        assert!(!failed);
        assert_eq!(transport.script().sent.len(), 1);
        let state = store.state();
        assert!(state.recipient(recipients[0]).sent_at.is_none());
        assert!(state.recipient(recipients[1]).sent_at.is_some());
    }

    #[tokio::test]
    async fn encoding_errors_are_skipped() {
        let store = MemoryStore::new();
        let (_, recipients) = store.add_message(false, false, &["600111222", "600333444"]);
        let mut transport = ScriptedTransport::new();
        transport.script().unencodable_numbers.insert("600111222".into());

        let failed = send_pending(&*store, &mut transport).await.unwrap();

        assert!(!failed);
        let state = store.state();
        assert!(state.recipient(recipients[0]).sent_at.is_none());
        assert!(state.recipient(recipients[1]).sent_at.is_some());
    }

    #[tokio::test]
    async fn device_error_stops_the_pass() {
        let store = MemoryStore::new();
        let (_, first) = store.add_message(false, false, &["600111222", "600333444"]);
        let (_, second) = store.add_message(false, false, &["600555666"]);
        let mut transport = ScriptedTransport::new();
        transport.script().failing_numbers.insert("600111222".into());

        let failed = send_pending(&*store, &mut transport).await.unwrap();

        assert!(failed);
        assert!(transport.script().sent.is_empty());
        let state = store.state();
        assert!(state.recipient(first[0]).sent_at.is_none());
        assert!(state.recipient(first[1]).sent_at.is_none());
        assert!(state.recipient(second[0]).sent_at.is_none());
    }

    #[tokio::test]
    async fn already_sent_recipients_are_not_resent() {
        let store = MemoryStore::new();
        let (_, recipients) = store.add_message(false, false, &["600111222", "600333444"]);
        store.set_sent(recipients[0], Utc::now());
        let mut transport = ScriptedTransport::new();

        send_pending(&*store, &mut transport).await.unwrap();

        let sent = transport.script().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "600333444");
    }

    #[tokio::test]
    async fn store_outage_is_reported() {
        let store = MemoryStore::new();
        store.add_message(false, false, &["600111222"]);
        store.state().unavailable = true;
        let mut transport = ScriptedTransport::new();

        let err = send_pending(&*store, &mut transport).await.unwrap_err();
        assert!(err.is_transient());
        assert!(transport.script().sent.is_empty());
    }
}
