//! Protocol-neutral view of a fetched message.

use std::fmt;

/// Message identifier assigned by the server (an IMAP UID).
pub type Uid = u32;

/// Structural description of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyPart {
    Leaf(Part),
    Multipart(Vec<BodyPart>),
}

/// A single non-container body part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Lowercased media type, e.g. `text`.
    pub media_type: String,
    /// Lowercased subtype, e.g. `plain`.
    pub subtype: String,
    /// Content-Type parameters with lowercased names.
    pub params: Vec<(String, String)>,
    /// Content-Transfer-Encoding, when declared.
    pub encoding: Option<String>,
}

impl Part {
    pub fn new(media_type: &str, subtype: &str) -> Self {
        Self {
            media_type: media_type.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
            params: Vec::new(),
            encoding: None,
        }
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn with_encoding(mut self, encoding: &str) -> Self {
        self.encoding = Some(encoding.to_string());
        self
    }

    pub fn is_text(&self) -> bool {
        self.media_type == "text"
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn charset(&self) -> Option<&str> {
        self.param("charset")
    }
}

/// Positional path of a part inside the body, e.g. `1.2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartPath(Vec<u32>);

impl PartPath {
    pub fn new(segments: Vec<u32>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[u32] {
        &self.0
    }
}

impl fmt::Display for PartPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
            first = false;
        }
        Ok(())
    }
}

/// Envelope address, still in its raw (possibly RFC 2047 encoded) form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    pub name: Option<Vec<u8>>,
    pub mailbox: Option<Vec<u8>>,
    pub host: Option<Vec<u8>>,
}

/// Envelope and structure of one message, as returned by a summary fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub uid: Uid,
    pub subject: Option<Vec<u8>>,
    pub from: Vec<Address>,
    /// `None` when the server's structural description could not be understood.
    pub structure: Option<BodyPart>,
}

/// What a NOOP probe of the selected mailbox reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    /// New message count, when the server announced one.
    pub exists: Option<u32>,
    /// Flags changed or messages were expunged.
    pub changed: bool,
}

impl MailboxStatus {
    pub fn needs_check(&self) -> bool {
        self.exists.is_some() || self.changed
    }
}
