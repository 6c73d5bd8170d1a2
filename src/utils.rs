use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest line accepted on the submission protocol, terminator excluded.
pub const MAX_LINE: usize = 1024;

/// Digits with an optional leading `+`.
pub fn check_number(num: &str) -> bool {
    let digits = num.strip_prefix('+').unwrap_or(num);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug)]
pub enum LineError {
    Io(io::Error),
    TooLong,
    Eof,
}

impl From<io::Error> for LineError {
    fn from(err: io::Error) -> Self {
        LineError::Io(err)
    }
}

/// Reads one LF or CRLF terminated line without its terminator.
///
/// A final line without a terminator is returned as is; `Eof` means nothing was left.
pub async fn read_line<R>(reader: &mut R) -> Result<String, LineError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE as u64 + 2)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Err(LineError::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if n > MAX_LINE {
        return Err(LineError::TooLong);
    }
    if buf.len() > MAX_LINE {
        return Err(LineError::TooLong);
    }
    String::from_utf8(buf)
        .map_err(|e| LineError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}
