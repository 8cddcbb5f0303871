//! Message header parsing, editing and re-serialization
//!
//! Headers are parsed with `mailparse`. Untouched fields keep their original
//! bytes (including folding) and the body is carried through verbatim, so a
//! re-serialized message differs from the source only where it was edited.
//! Values written by the pipeline are RFC 2047 encoded when not plain ASCII.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::errors::{AppError, AppResult};

/// Longest chunk of UTF-8 carried by one encoded word
const ENCODED_WORD_CHUNK: usize = 45;

/// One header field
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderField {
    /// Field name as written
    name: String,
    /// Decoded, unfolded value
    value: String,
    /// Value bytes as they go on the wire
    raw: Vec<u8>,
}

/// Parsed message whose header block can be edited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    headers: Vec<HeaderField>,
    body: Vec<u8>,
}

impl MailMessage {
    /// Parse an RFC822 message
    ///
    /// # Errors
    ///
    /// - `Message` if `mailparse` cannot parse the header block
    pub fn parse(raw: &[u8]) -> AppResult<Self> {
        let (headers, body_offset) = mailparse::parse_headers(raw)
            .map_err(|e| AppError::Message(format!("failed to parse message headers: {e}")))?;
        let headers = headers
            .iter()
            .map(|h| HeaderField {
                name: h.get_key(),
                value: unfold(&h.get_value()),
                raw: h.get_value_raw().to_vec(),
            })
            .collect();
        let body = raw.get(body_offset..).unwrap_or_default().to_vec();
        Ok(Self { headers, body })
    }

    /// First value of a header (case-insensitive), decoded
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn subject(&self) -> Option<&str> {
        self.header("Subject")
    }

    /// Replace a header, keeping the position of its first occurrence
    ///
    /// Further occurrences are removed. Appends when the header is absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let field = HeaderField {
            name: name.to_owned(),
            value: value.to_owned(),
            raw: encode_header_value(value),
        };
        match self
            .headers
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(name))
        {
            Some(idx) => {
                self.headers[idx] = field;
                let mut seen = 0usize;
                self.headers.retain(|h| {
                    if h.name.eq_ignore_ascii_case(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.headers.push(field),
        }
    }

    /// Remove every occurrence of a header; returns whether any was present
    pub fn remove_header(&mut self, name: &str) -> bool {
        let before = self.headers.len();
        self.headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
        before != self.headers.len()
    }

    /// Serialize header block and body back to RFC822 bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 64 * self.headers.len());
        for h in &self.headers {
            out.extend_from_slice(h.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(&h.raw);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Encode a header value for the wire
///
/// Printable ASCII passes through; anything else becomes a sequence of
/// `=?UTF-8?B?...?=` words separated by folding whitespace.
pub fn encode_header_value(value: &str) -> Vec<u8> {
    if value.chars().all(|ch| ch.is_ascii() && !ch.is_ascii_control()) {
        return value.as_bytes().to_vec();
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for ch in value.chars() {
        if chunk.len() + ch.len_utf8() > ENCODED_WORD_CHUNK {
            words.push(format!("=?UTF-8?B?{}?=", STANDARD.encode(chunk.as_bytes())));
            chunk.clear();
        }
        chunk.push(ch);
    }
    if !chunk.is_empty() {
        words.push(format!("=?UTF-8?B?{}?=", STANDARD.encode(chunk.as_bytes())));
    }
    words.join("\r\n ").into_bytes()
}

/// Collapse folding line breaks (and the whitespace after them) to one space
fn unfold(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\r' || ch == '\n' {
            while chars.peek().is_some_and(|c| matches!(c, '\r' | '\n' | ' ' | '\t')) {
                chars.next();
            }
            if !out.ends_with(' ') {
                out.push(' ');
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Truncate string to maximum characters (Unicode-aware)
///
/// Preserves complete characters, never splitting multi-byte sequences.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
