//! Line framing shared by the streaming HTTP adapters.

use crate::error::ProviderError;
use futures_util::{Stream, TryStreamExt};

/// Accumulates raw bytes and hands out complete lines. Bytes are decoded
/// only once a whole line is buffered, so a character split across network
/// chunks survives intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete line without its terminator, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw[..pos]);
        Some(line.trim_end_matches('\r').to_string())
    }

    /// Whatever is left once the body ends.
    pub fn take_rest(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest.into_owned())
        }
    }
}

/// Payload of one stream line, or `None` for blank and comment lines.
pub fn line_payload(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None => line,
    };
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

/// `[DONE]` in any case, with or without the `data:` label.
pub fn is_done_sentinel(line: &str) -> bool {
    line_payload(line).is_some_and(|p| p.trim().eq_ignore_ascii_case("[done]"))
}

/// Pass successful responses through; turn anything else into `Status`.
pub async fn checked(res: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(ProviderError::Status { status: status.as_u16(), body })
}

/// Payload strings of a line-framed response body, ending at the sentinel
/// or when the body ends.
pub fn payloads(
    response: reqwest::Response,
) -> impl Stream<Item = Result<String, ProviderError>> + Send {
    async_stream::try_stream! {
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();
        'read: while let Some(bytes) = body.try_next().await? {
            lines.push(&bytes);
            while let Some(line) = lines.next_line() {
                if is_done_sentinel(&line) {
                    break 'read;
                }
                if let Some(payload) = line_payload(&line) {
                    yield payload.to_string();
                }
            }
        }
        if let Some(rest) = lines.take_rest() {
            if !is_done_sentinel(&rest) {
                if let Some(payload) = line_payload(&rest) {
                    yield payload.to_string();
                }
            }
        }
    }
}
