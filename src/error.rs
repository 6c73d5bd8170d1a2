//! Error types shared across the daemon.

use thiserror::Error;

/// Durable store failure, split by whether retrying next cycle can help.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be reached. The current cycle is abandoned.
    #[error("database unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    /// Anything else. Continuing could duplicate or lose state.
    #[error("database error: {0}")]
    Fatal(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err),
            sqlx::Error::Database(ref db_err)
                if db_err.code().is_some_and(|code| is_connectivity_code(&code)) =>
            {
                StoreError::Unavailable(err)
            }
            other => StoreError::Fatal(other),
        }
    }
}

/// SQLSTATEs the server reports when it drops or refuses the session:
/// connection exceptions (class 08), shutdown and recovery (57P01-57P03),
/// and too many connections (53300).
fn is_connectivity_code(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03" | "53300")
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Device transport failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The device did not do what was asked.
    #[error("[{op}] {detail}")]
    Device { op: &'static str, detail: String },

    /// I/O towards the device failed.
    #[error("[{op}] {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The content cannot be represented for this recipient. Retrying will not help.
    #[error("[encode] {0}")]
    Encode(String),
}

impl TransportError {
    pub fn device(op: &'static str, detail: impl Into<String>) -> Self {
        TransportError::Device {
            op,
            detail: detail.into(),
        }
    }

    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        TransportError::Io { op, source }
    }

    pub fn is_encoding(&self) -> bool {
        matches!(self, TransportError::Encode(_))
    }
}

/// Filter subprocess failure. Callers accept the message unchanged.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("can't start filter `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("can't write to filter `{command}`: {source}")]
    Write {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("can't read from filter `{command}`: {source}")]
    Read {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("filter `{command}` closed its output; stderr: {stderr}")]
    Exited { command: String, stderr: String },

    #[error("filter `{command}` did not answer within {waited:?}")]
    Timeout { command: String, waited: std::time::Duration },

    #[error("filter `{command}` sent a malformed response: {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("filter `{command}` answered with neither an object nor null: {response}")]
    Unexpected { command: String, response: String },

    #[error("can't encode filter request: {0}")]
    Encode(#[from] serde_json::Error),
}
