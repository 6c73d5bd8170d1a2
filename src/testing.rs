//! In-memory stand-ins for the database and the device.

use crate::error::{StoreError, StoreResult, TransportError};
use crate::models::{NewInboxMessage, OutboxMessage, Recipient, Submission};
use crate::store::Store;
use crate::transport::{ReceivedSms, Transport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryState {
    pub outbox: Vec<OutboxMessage>,
    pub recipients: Vec<Recipient>,
    pub inbox: Vec<NewInboxMessage>,
    pub source_ids: HashMap<String, i64>,
    /// Every call fails as if the database were unreachable.
    pub unavailable: bool,
    /// Every call fails with a non-connectivity error.
    pub broken: bool,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn recipient(&self, id: i64) -> &Recipient {
        self.recipients.iter().find(|r| r.id == id).expect("no such recipient")
    }

    pub fn recipients_of(&self, message_id: i64) -> Vec<Recipient> {
        self.recipients
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    /// Queues a message and returns its id and its recipient ids.
    pub fn add_message(&self, report: bool, delete_when_done: bool, numbers: &[&str]) -> (i64, Vec<i64>) {
        let mut state = self.state();
        let id = state.next_id();
        state.outbox.push(OutboxMessage {
            id,
            created_at: Utc::now(),
            source: "test".into(),
            report,
            delete_when_done,
            body: format!("message {id}"),
        });
        let mut ids = Vec::new();
        for number in numbers {
            let rid = state.next_id();
            state.recipients.push(Recipient {
                id: rid,
                message_id: id,
                number: number.to_string(),
                destination_id: 0,
                sent_at: None,
                reported_at: None,
            });
            ids.push(rid);
        }
        (id, ids)
    }

    pub fn set_sent(&self, recipient_id: i64, at: DateTime<Utc>) {
        let mut state = self.state();
        let r = state
            .recipients
            .iter_mut()
            .find(|r| r.id == recipient_id)
            .expect("no such recipient");
        r.sent_at = Some(at);
    }

    fn check(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        let state = self.state();
        if state.unavailable {
            return Err(StoreError::from(sqlx::Error::PoolTimedOut));
        }
        if state.broken {
            return Err(StoreError::from(sqlx::Error::Protocol("broken".into())));
        }
        Ok(state)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn pending_messages(&self) -> StoreResult<Vec<OutboxMessage>> {
        let state = self.check()?;
        Ok(state
            .outbox
            .iter()
            .filter(|m| {
                state
                    .recipients
                    .iter()
                    .any(|r| r.message_id == m.id && r.sent_at.is_none())
            })
            .cloned()
            .collect())
    }

    async fn unsent_recipients(&self, message_id: i64) -> StoreResult<Vec<Recipient>> {
        let state = self.check()?;
        Ok(state
            .recipients
            .iter()
            .filter(|r| r.message_id == message_id && r.sent_at.is_none())
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, recipient_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.check()?;
        if let Some(r) = state
            .recipients
            .iter_mut()
            .find(|r| r.id == recipient_id && r.sent_at.is_none())
        {
            r.sent_at = Some(at);
        }
        Ok(())
    }

    async fn report_candidates(
        &self,
        number: &str,
        local_prefix: Option<&str>,
    ) -> StoreResult<Vec<Recipient>> {
        let state = self.check()?;
        Ok(state
            .recipients
            .iter()
            .filter(|r| r.reported_at.is_none() && r.sent_at.is_some())
            .filter(|r| {
                r.number == number
                    || local_prefix.is_some_and(|p| format!("{p}{}", r.number) == number)
            })
            .cloned()
            .collect())
    }

    async fn mark_reported(&self, recipient_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.check()?;
        if let Some(r) = state.recipients.iter_mut().find(|r| {
            r.id == recipient_id && r.reported_at.is_none() && r.sent_at.is_some()
        }) {
            r.reported_at = Some(at);
        }
        Ok(())
    }

    async fn source_id_for(&self, number: &str) -> StoreResult<Option<i64>> {
        let state = self.check()?;
        Ok(state.source_ids.get(number).copied())
    }

    async fn insert_inbox(&self, message: &NewInboxMessage) -> StoreResult<i64> {
        let mut state = self.check()?;
        state.inbox.push(message.clone());
        Ok(state.inbox.len() as i64)
    }

    async fn insert_submission(&self, submission: &Submission) -> StoreResult<i64> {
        let mut state = self.check()?;
        let id = state.next_id();
        state.outbox.push(OutboxMessage {
            id,
            created_at: Utc::now(),
            source: submission.source.clone(),
            report: submission.report,
            delete_when_done: submission.delete_when_done,
            body: submission.body.clone(),
        });
        for recipient in &submission.recipients {
            let rid = state.next_id();
            state.recipients.push(Recipient {
                id: rid,
                message_id: id,
                number: recipient.number.clone(),
                destination_id: recipient.destination_id,
                sent_at: None,
                reported_at: None,
            });
        }
        Ok(id)
    }

    async fn delete_completed(&self) -> StoreResult<u64> {
        let mut state = self.check()?;
        let done: HashSet<i64> = state
            .outbox
            .iter()
            .filter(|m| m.is_complete(&state.recipients_of(m.id)))
            .map(|m| m.id)
            .collect();
        state.outbox.retain(|m| !done.contains(&m.id));
        state.recipients.retain(|r| !done.contains(&r.message_id));
        Ok(done.len() as u64)
    }
}

#[derive(Debug, Default)]
pub struct Script {
    /// Connect attempts that fail before one succeeds.
    pub connect_failures: u32,
    pub connects: u32,
    pub disconnects: u32,
    pub connected: bool,
    /// Sends to these numbers fail with a device error.
    pub failing_numbers: HashSet<String>,
    /// Sends to these numbers fail with an encoding error.
    pub unencodable_numbers: HashSet<String>,
    /// (number, body, report) for every successful send.
    pub sent: Vec<(String, String, bool)>,
    pub inbound: VecDeque<ReceivedSms>,
    /// Once `inbound` is drained, fail instead of reporting an empty device.
    pub fail_receive: bool,
}

/// A device whose behaviour is set up by the test. Clones share the script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn push_inbound(&self, sms: ReceivedSms) {
        self.script().inbound.push_back(sms);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut script = self.script();
        if script.connect_failures > 0 {
            script.connect_failures -= 1;
            return Err(TransportError::device("connect", "no answer from modem"));
        }
        script.connects += 1;
        script.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut script = self.script();
        script.disconnects += 1;
        script.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.script().connected
    }

    async fn send(&mut self, number: &str, body: &str, report: bool) -> Result<(), TransportError> {
        let mut script = self.script();
        if script.failing_numbers.contains(number) {
            return Err(TransportError::device("send", "timeout"));
        }
        if script.unencodable_numbers.contains(number) {
            return Err(TransportError::Encode("can't encode".into()));
        }
        script.sent.push((number.to_string(), body.to_string(), report));
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<ReceivedSms>, TransportError> {
        let mut script = self.script();
        match script.inbound.pop_front() {
            Some(sms) => Ok(Some(sms)),
            None if script.fail_receive => Err(TransportError::device("receive", "timeout")),
            None => Ok(None),
        }
    }
}

pub fn content(number: &str, body: &str) -> ReceivedSms {
    let now = Utc::now();
    ReceivedSms {
        time: now,
        smsc_time: now,
        number: number.to_string(),
        report: false,
        body: body.to_string(),
    }
}

pub fn delivery_report(number: &str, smsc_time: DateTime<Utc>) -> ReceivedSms {
    ReceivedSms {
        time: smsc_time,
        smsc_time,
        number: number.to_string(),
        report: true,
        body: " Delivered ".to_string(),
    }
}
