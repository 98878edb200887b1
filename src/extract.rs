//! Turns a fetched message into the short text used for a notification.

use crate::client::{ClientError, MailClient};
use crate::message::{Address, BodyPart, MessageRecord, Part, PartPath};
use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use charset::Charset;
use quoted_printable::ParseMode;

pub const INVALID_SENDER: &str = "invalid sender";
pub const INVALID_SUBJECT: &str = "invalid subject";
pub const UNPARSEABLE_BODY: &str = "could not parse body";
pub const NO_TEXT_PART: &str = "(no text content)";
pub const UNTITLED: &str = "Untitled";
pub const UNKNOWN_SENDER: &str = "unknown";
pub const ELLIPSIS: &str = "...";

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Decoded, truncated view of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub subject: String,
    /// Display name when known, `<address>` otherwise.
    pub from: String,
    pub name: String,
    pub address: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy)]
pub struct TextExtractor {
    subject_length: usize,
    body_length: usize,
    fallback: Charset,
}

impl TextExtractor {
    pub fn new(subject_length: usize, body_length: usize, fallback: Charset) -> Self {
        Self {
            subject_length,
            body_length,
            fallback,
        }
    }

    /// Builds the summary of `record`, fetching only its first text part.
    ///
    /// Only errors that leave the connection unusable are returned; anything
    /// wrong with the message itself turns into a placeholder.
    pub async fn extract<C: MailClient>(
        &self,
        client: &mut C,
        record: &MessageRecord,
    ) -> Result<Summary, ClientError> {
        let uid = record.uid;
        let subject = match &record.subject {
            Some(raw) => match decode_header(raw) {
                Ok(subject) if !subject.trim().is_empty() => {
                    truncate(subject.trim(), self.subject_length)
                }
                Ok(_) => UNTITLED.to_string(),
                Err(e) => {
                    tracing::warn!(uid, error = %e, "could not decode subject");
                    INVALID_SUBJECT.to_string()
                }
            },
            None => UNTITLED.to_string(),
        };
        let (from, name, address) = sender(record.from.first());

        let body = match self.body(client, record).await {
            Ok(body) => body,
            Err(e) if !e.is_fatal() => {
                tracing::warn!(uid, error = %e, "could not fetch body");
                UNPARSEABLE_BODY.to_string()
            }
            Err(e) => return Err(e),
        };

        Ok(Summary {
            subject,
            from,
            name,
            address,
            body,
        })
    }

    async fn body<C: MailClient>(
        &self,
        client: &mut C,
        record: &MessageRecord,
    ) -> Result<String, ClientError> {
        let uid = record.uid;
        let Some(structure) = &record.structure else {
            tracing::error!(uid, "server sent no usable body structure");
            return Ok(UNPARSEABLE_BODY.to_string());
        };
        let Some((path, part)) = find_text_part(structure) else {
            tracing::warn!(uid, "message has no text part");
            return Ok(NO_TEXT_PART.to_string());
        };
        tracing::debug!(uid, part = %path, "fetching text part");

        let raw = client.fetch_part(uid, &path).await?;
        let decoded = match decode_transfer(&raw, part.encoding.as_deref()) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(uid, error = %e, "could not decode body");
                return Ok(UNPARSEABLE_BODY.to_string());
            }
        };
        let text = self.transcode(&decoded, part);
        Ok(truncate(&tidy(&text), self.body_length))
    }

    fn transcode(&self, bytes: &[u8], part: &Part) -> String {
        match part.charset() {
            Some(label) => match Charset::for_label(label.trim().as_bytes()) {
                Some(charset) => charset.decode_without_bom_handling(bytes).0.into_owned(),
                None => {
                    tracing::debug!(charset = label, "unknown charset, decoding as UTF-8");
                    String::from_utf8_lossy(bytes).into_owned()
                }
            },
            None => match std::str::from_utf8(bytes) {
                Ok(text) => text.to_string(),
                Err(_) => self
                    .fallback
                    .decode_without_bom_handling(bytes)
                    .0
                    .into_owned(),
            },
        }
    }
}

/// Depth-first search for the first textual leaf and its part path.
pub fn find_text_part(root: &BodyPart) -> Option<(PartPath, &Part)> {
    let mut stack: Vec<(Vec<u32>, &BodyPart)> = vec![(Vec::new(), root)];
    while let Some((path, node)) = stack.pop() {
        match node {
            BodyPart::Leaf(part) => {
                if part.is_text() {
                    // A single-part message body is addressed as part 1.
                    let path = if path.is_empty() { vec![1] } else { path };
                    return Some((PartPath::new(path), part));
                }
            }
            BodyPart::Multipart(children) => {
                for (index, child) in children.iter().enumerate().rev() {
                    let mut child_path = path.clone();
                    child_path.push(index as u32 + 1);
                    stack.push((child_path, child));
                }
            }
        }
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("quoted-printable: {0}")]
    QuotedPrintable(#[from] quoted_printable::QuotedPrintableError),
}

/// Undoes a Content-Transfer-Encoding. Unknown encodings pass through.
pub fn decode_transfer(raw: &[u8], encoding: Option<&str>) -> Result<Vec<u8>, DecodeError> {
    match encoding.map(str::to_ascii_lowercase).as_deref() {
        Some("base64") => {
            let compact: Vec<u8> = raw
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            Ok(LENIENT_BASE64.decode(compact)?)
        }
        // Robust mode keeps malformed escapes as they are.
        Some("quoted-printable") => Ok(quoted_printable::decode(raw, ParseMode::Robust)?),
        _ => Ok(raw.to_vec()),
    }
}

/// Strips leading whitespace from every line and drops empty lines.
pub fn tidy(text: &str) -> String {
    text.lines()
        .map(str::trim_start)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keeps the first `max` characters, marking the cut with an ellipsis.
pub fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}{ELLIPSIS}", &text[..cut]),
        None => text.to_string(),
    }
}

/// Decodes a raw header value, including RFC 2047 encoded words split
/// across folded lines.
pub fn decode_header(raw: &[u8]) -> Result<String, mailparse::MailParseError> {
    let mut line = b"Subject: ".to_vec();
    line.extend(raw.iter().copied().filter(|&b| b != b'\r' && b != b'\n'));
    let (header, _) = mailparse::parse_header(&line)?;
    Ok(header
        .get_value_utf8()
        .unwrap_or_else(|_| header.get_value()))
}

/// Returns `(from, name, address)` for the first sender.
fn sender(address: Option<&Address>) -> (String, String, String) {
    let Some(address) = address else {
        return (UNKNOWN_SENDER.to_string(), String::new(), String::new());
    };
    let mailbox = address
        .mailbox
        .as_deref()
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    let host = address
        .host
        .as_deref()
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    let addr = format!("{mailbox}@{host}");

    let name = match address.name.as_deref().map(decode_header) {
        Some(Ok(name)) => name.trim().to_string(),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "could not decode sender name");
            return (INVALID_SENDER.to_string(), INVALID_SENDER.to_string(), addr);
        }
        None => String::new(),
    };
    let from = if name.is_empty() {
        format!("<{addr}>")
    } else {
        name.clone()
    };
    (from, name, addr)
}
