use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::record::RecordId;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub const RETRIEVE_PREFIX: &str = "retrieve:";
pub const BLOCK_NOT_FOUND: &str = "Block not found";
pub const RETRIEVE_FAILED: &str = "Error retrieving block";

/// What a peer asked for with one inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Retrieve(RecordId),
    Publish(String),
}

impl Request {
    /// Classifies a line. Surrounding whitespace is stripped first; a blank
    /// line yields `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, ProtocolError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        match trimmed.strip_prefix(RETRIEVE_PREFIX) {
            Some(raw) => raw
                .parse::<RecordId>()
                .map(|id| Some(Request::Retrieve(id)))
                .map_err(|source| ProtocolError::InvalidRecordId {
                    raw: raw.to_string(),
                    source,
                }),
            None => Ok(Some(Request::Publish(trimmed.to_string()))),
        }
    }

    pub fn retrieve_line(id: RecordId) -> String {
        format!("{RETRIEVE_PREFIX}{id}")
    }
}

/// Reads one `\n`-terminated line with the terminator removed.
/// Returns `Ok(None)` at end of stream. Invalid UTF-8 is replaced with
/// U+FFFD rather than failing the read.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let bytes = reader.read_until(b'\n', &mut buf).await?;
    if bytes == 0 {
        return Ok(None);
    }

    let line = String::from_utf8_lossy(&buf);
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Append the delimiter and flush so peers see each line promptly.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
