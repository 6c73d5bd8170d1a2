//! The device transport: whatever actually talks to the modem.

use crate::error::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on parts in one concatenated message.
pub const MAX_PARTS: usize = 255;

/// A message taken off the device.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedSms {
    /// Device time.
    pub time: DateTime<Utc>,
    /// Carrier (SMSC) timestamp.
    pub smsc_time: DateTime<Utc>,
    pub number: String,
    /// True for delivery reports.
    pub report: bool,
    pub body: String,
}

/// Not safe for concurrent use; the scheduler owns the only handle.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Sends `body` to `number`, split into as many parts as needed.
    async fn send(&mut self, number: &str, body: &str, report: bool) -> Result<(), TransportError>;

    /// Takes the next message off the device. `None` means nothing is waiting.
    async fn next_message(&mut self) -> Result<Option<ReceivedSms>, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coding {
    /// GSM default alphabet.
    Default,
    /// UCS-2.
    Unicode,
    #[serde(rename = "8bit")]
    EightBit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub coding: Coding,
    pub text: String,
}

/// Splits a body into message parts.
///
/// Pure ASCII goes out in the default alphabet, anything else as UCS-2.
pub fn split_parts(body: &str) -> Result<Vec<Part>, TransportError> {
    let coding = if body.is_ascii() {
        Coding::Default
    } else {
        Coding::Unicode
    };
    // (single part, per concatenated part), in 7-bit characters or UTF-16 units.
    let (single, multi) = match coding {
        Coding::Default => (160, 153),
        _ => (70, 67),
    };
    let units = |c: char| if coding == Coding::Default { 1 } else { c.len_utf16() };

    let total: usize = body.chars().map(units).sum();
    if total <= single {
        return Ok(vec![Part {
            coding,
            text: body.to_string(),
        }]);
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut used = 0;
    for c in body.chars() {
        let n = units(c);
        if used + n > multi {
            parts.push(Part {
                coding,
                text: std::mem::take(&mut current),
            });
            used = 0;
        }
        current.push(c);
        used += n;
    }
    if !current.is_empty() {
        parts.push(Part {
            coding,
            text: current,
        });
    }

    if parts.len() > MAX_PARTS {
        return Err(TransportError::Encode(format!(
            "message needs {} parts, at most {MAX_PARTS} allowed",
            parts.len()
        )));
    }
    Ok(parts)
}

/// Joins received parts into one body. 8-bit parts carry no text and are skipped.
pub fn assemble_body(parts: &[Part]) -> String {
    parts
        .iter()
        .filter(|p| p.coding != Coding::EightBit)
        .map(|p| p.text.as_str())
        .collect()
}
