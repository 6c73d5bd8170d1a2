//! Spool directory transport.
//!
//! The modem driver runs as a separate process and exchanges messages with the
//! daemon through two directories under the spool root:
//!
//! * `outgoing/`: one JSON file per message to send, written by the daemon.
//! * `incoming/`: one JSON file per received message or delivery report,
//!   written by the driver and deleted by the daemon once read.
//!
//! Files are written under a `.tmp` name and renamed, so readers only ever see
//! complete `.json` files.

use crate::error::TransportError;
use crate::transport::{assemble_body, split_parts, Part, ReceivedSms, Transport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct OutgoingRecord {
    pub number: String,
    pub report: bool,
    pub queued_at: DateTime<Utc>,
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IncomingRecord {
    pub number: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub smsc_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub report: bool,
    pub parts: Vec<Part>,
}

impl From<IncomingRecord> for ReceivedSms {
    fn from(record: IncomingRecord) -> Self {
        ReceivedSms {
            time: record.time,
            smsc_time: record.smsc_time.unwrap_or(record.time),
            number: record.number,
            report: record.report,
            body: assemble_body(&record.parts),
        }
    }
}

pub struct SpoolTransport {
    root: PathBuf,
    connected: bool,
}

impl SpoolTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            connected: false,
        }
    }

    fn outgoing(&self) -> PathBuf {
        self.root.join("outgoing")
    }

    fn incoming(&self) -> PathBuf {
        self.root.join("incoming")
    }

    fn check_connected(&self, op: &'static str) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::device(op, "not connected"))
        }
    }

    /// Oldest complete file waiting in `incoming/`.
    async fn first_incoming(&self) -> Result<Option<PathBuf>, TransportError> {
        let mut entries = fs::read_dir(self.incoming())
            .await
            .map_err(|e| TransportError::io("read_dir", e))?;
        let mut first: Option<PathBuf> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TransportError::io("read_dir", e))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if first.as_ref().is_none_or(|f| path < *f) {
                first = Some(path);
            }
        }
        Ok(first)
    }
}

async fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await
}

#[async_trait]
impl Transport for SpoolTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let meta = fs::metadata(&self.root)
            .await
            .map_err(|e| TransportError::io("connect", e))?;
        if !meta.is_dir() {
            return Err(TransportError::device(
                "connect",
                format!("{} is not a directory", self.root.display()),
            ));
        }
        for dir in [self.outgoing(), self.incoming()] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| TransportError::io("connect", e))?;
        }
        self.connected = true;
        debug!(root = %self.root.display(), "Spool connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&mut self, number: &str, body: &str, report: bool) -> Result<(), TransportError> {
        self.check_connected("send")?;
        let record = OutgoingRecord {
            number: number.to_string(),
            report,
            queued_at: Utc::now(),
            parts: split_parts(body)?,
        };
        let json = serde_json::to_vec(&record)
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        let name = format!(
            "{}-{}.json",
            record.queued_at.format("%Y%m%d%H%M%S%6f"),
            Uuid::new_v4()
        );
        write_atomically(&self.outgoing().join(name), &json)
            .await
            .map_err(|e| TransportError::io("send", e))
    }

    async fn next_message(&mut self) -> Result<Option<ReceivedSms>, TransportError> {
        self.check_connected("receive")?;
        while let Some(path) = self.first_incoming().await? {
            let raw = fs::read(&path)
                .await
                .map_err(|e| TransportError::io("receive", e))?;
            match serde_json::from_slice::<IncomingRecord>(&raw) {
                Ok(record) => {
                    fs::remove_file(&path)
                        .await
                        .map_err(|e| TransportError::io("delete", e))?;
                    return Ok(Some(record.into()));
                }
                Err(e) => {
                    warn!(path = %path.display(), "Unreadable spool file, moving aside: {}", e);
                    fs::rename(&path, path.with_extension("bad"))
                        .await
                        .map_err(|e| TransportError::io("delete", e))?;
                }
            }
        }
        Ok(None)
    }
}
