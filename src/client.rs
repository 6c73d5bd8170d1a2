//! Client side of the submission protocol.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("can't talk to server: {0}")]
    Io(#[from] io::Error),

    #[error("server refused message: {0}")]
    Refused(String),
}

/// Submits messages to a running gateway.
#[derive(Debug, Clone)]
pub struct SubmitClient {
    /// Source tag the server must know.
    pub source: String,
    /// `host:port` or a unix socket path.
    pub server: String,
    pub delete: bool,
    pub report: bool,
}

impl SubmitClient {
    pub fn new(source: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            server: server.into(),
            delete: false,
            report: false,
        }
    }

    /// Queues `text` for every entry of `recipients` (`number` or `number=dstId`).
    /// Does nothing when there are no recipients.
    pub async fn send(&self, text: &str, recipients: &[String]) -> Result<(), ClientError> {
        if recipients.is_empty() {
            return Ok(());
        }
        let request = self.request(text, recipients);

        if self.server.contains(':') {
            let stream = TcpStream::connect(&self.server).await?;
            return exchange(stream, &request).await;
        }
        send_unix(&self.server, &request).await
    }

    fn request(&self, text: &str, recipients: &[String]) -> String {
        let mut request = format!("{}\n{}\n", self.source, recipients.join(" "));
        if self.delete {
            request.push_str("delete\n");
        }
        if self.report {
            request.push_str("report\n");
        }
        request.push('\n');
        request.push_str(text.trim());
        request.push_str("\n.\n");
        request
    }
}

#[cfg(unix)]
async fn send_unix(path: &str, request: &str) -> Result<(), ClientError> {
    let stream = UnixStream::connect(path).await?;
    exchange(stream, request).await
}

#[cfg(not(unix))]
async fn send_unix(_path: &str, _request: &str) -> Result<(), ClientError> {
    Err(ClientError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix sockets are not supported on this platform",
    )))
}

async fn exchange<S>(stream: S, request: &str) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (rd, mut wr) = tokio::io::split(stream);
    wr.write_all(request.as_bytes()).await?;
    wr.flush().await?;

    let mut reply = String::new();
    BufReader::new(rd).read_line(&mut reply).await?;
    let reply = reply.trim();
    if reply == "OK" {
        Ok(())
    } else {
        Err(ClientError::Refused(reply.to_string()))
    }
}
