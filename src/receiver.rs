use crate::error::StoreResult;
use crate::filter::{FilterExchange, FilterPipeline};
use crate::models::{NewInboxMessage, Recipient};
use crate::store::Store;
use crate::transport::{ReceivedSms, Transport};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn, Span};

/// Body of a delivery report that confirms delivery.
const DELIVERED: &str = "delivered";

/// Drains the device: delivery reports are matched to recipients, everything
/// else goes through the filter into the inbox.
///
/// Returns `Ok(true)` when the device failed.
#[instrument(skip_all, fields(received = 0))]
pub async fn receive_pending(
    store: &dyn Store,
    transport: &mut dyn Transport,
    mut filter: Option<&mut FilterPipeline>,
    local_prefix: Option<&str>,
) -> StoreResult<bool> {
    let mut received = 0;
    loop {
        let sms = match transport.next_message().await {
            Ok(Some(sms)) => sms,
            Ok(None) => break,
            Err(e) => {
                error!("Can't get message from device: {}", e);
                return Ok(true);
            }
        };
        received += 1;
        Span::current().record("received", received);

        if sms.report {
            record_report(store, &sms, local_prefix).await?;
        } else {
            store_content(store, filter.as_deref_mut(), sms).await?;
        }
    }
    Ok(false)
}

fn is_delivered(body: &str) -> bool {
    body.trim().to_lowercase() == DELIVERED
}

/// Picks the recipient a delivery report belongs to: same number, directly or
/// with `local_prefix` prepended, and sent closest to `carrier_time`.
pub fn best_report_match<'a>(
    candidates: &'a [Recipient],
    number: &str,
    local_prefix: Option<&str>,
    carrier_time: DateTime<Utc>,
) -> Option<&'a Recipient> {
    candidates
        .iter()
        .filter(|r| r.reported_at.is_none())
        .filter(|r| {
            r.number == number
                || local_prefix
                    .is_some_and(|p| number.strip_prefix(p) == Some(r.number.as_str()))
        })
        .filter_map(|r| r.sent_at.map(|sent| (r, (carrier_time - sent).abs())))
        .min_by_key(|(_, delta)| *delta)
        .map(|(r, _)| r)
}

async fn record_report(
    store: &dyn Store,
    sms: &ReceivedSms,
    local_prefix: Option<&str>,
) -> StoreResult<()> {
    if !is_delivered(&sms.body) {
        debug!(number = %sms.number, body = %sms.body.trim(), "Ignoring report.");
        return Ok(());
    }

    let candidates = store.report_candidates(&sms.number, local_prefix).await?;
    match best_report_match(&candidates, &sms.number, local_prefix, sms.smsc_time) {
        Some(recipient) => {
            if let Err(e) = store.mark_reported(recipient.id, sms.smsc_time).await {
                error!(number = %sms.number, "Can't mark recipient as reported: {}", e);
                return Err(e);
            }
            info!(
                number = %sms.number,
                message_id = recipient.message_id,
                recipient_id = recipient.id,
                "Delivery reported."
            );
        }
        None => info!(number = %sms.number, "No recipient waiting for this report."),
    }
    Ok(())
}

async fn store_content(
    store: &dyn Store,
    filter: Option<&mut FilterPipeline>,
    sms: ReceivedSms,
) -> StoreResult<()> {
    let source_id = match store.source_id_for(&sms.number).await {
        Ok(id) => id.unwrap_or(0),
        Err(e) => {
            error!(number = %sms.number, "Can't get source id: {}", e);
            return Err(e);
        }
    };

    let mut msg = FilterExchange {
        time: sms.time,
        number: sms.number,
        source_id,
        body: sms.body,
        note: String::new(),
    };
    if let Some(filter) = filter {
        match filter.filter(&mut msg).await {
            Ok(true) => {}
            Ok(false) => {
                info!(number = %msg.number, "Message dropped by filter.");
                return Ok(());
            }
            Err(e) => warn!(number = %msg.number, "Filter error, accepting message unchanged: {}", e),
        }
    }

    let row = NewInboxMessage {
        received_at: msg.time,
        number: msg.number,
        source_id: msg.source_id,
        body: msg.body,
        note: msg.note,
    };
    match store.insert_inbox(&row).await {
        Ok(id) => {
            info!(inbox_id = id, number = %row.number, source_id = row.source_id, "Message received.");
            Ok(())
        }
        Err(e) => {
            error!(number = %row.number, "Can't insert message into inbox: {}", e);
            Err(e)
        }
    }
}
