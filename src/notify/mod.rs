//! Notification formatting and delivery.

use crate::config::{AccountConfig, PushConfig};
use crate::extract::Summary;
use async_trait::async_trait;
use std::sync::Arc;

mod ntfy;
mod prowl;

pub use self::ntfy::NtfyTransport;
pub use self::prowl::{escape_form_value, ProwlTransport};

/// Status code that marks a delivered notification.
pub const SUCCESS_CODE: &str = "200";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ntfy request failed: {0}")]
    Ntfy(String),

    #[error("push service answered {0}")]
    Rejected(String),

    #[error("invalid URL {0}")]
    InvalidUrl(String),
}

/// One notification as handed to a push service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    /// Source label of the account.
    pub application: String,
    /// The rendered one-line template.
    pub event: String,
    /// Body excerpt.
    pub description: String,
    pub priority: i8,
}

/// Delivers a [`PushEvent`] and reports the service's status code.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn post(&self, event: &PushEvent) -> Result<String, NotifyError>;
}

pub fn transport_from_config(push: &PushConfig) -> Result<Arc<dyn PushTransport>, NotifyError> {
    Ok(match push {
        PushConfig::Prowl {
            api_key,
            endpoint,
            proxy,
        } => Arc::new(ProwlTransport::new(api_key, endpoint, proxy.as_ref())?),
        PushConfig::Ntfy {
            url,
            topic,
            click_url,
        } => Arc::new(NtfyTransport::new(url, topic, click_url.as_deref())?),
    })
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown field {{{0}}}")]
    UnknownField(String),

    #[error("unclosed '{{'")]
    Unclosed,

    #[error("unmatched '}}'")]
    Unmatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Subject,
    From,
    Name,
    Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// Event line template with `{subject}`, `{from}`, `{name}` and `{address}`.
/// `{{` and `}}` stand for literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template(Vec<Segment>);

impl Template {
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => return Err(TemplateError::Unclosed),
                        }
                    }
                    let field = match name.trim() {
                        "subject" => Field::Subject,
                        "from" => Field::From,
                        "name" => Field::Name,
                        "address" => Field::Address,
                        _ => return Err(TemplateError::UnknownField(name)),
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(field));
                }
                '}' => return Err(TemplateError::Unmatched),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self(segments))
    }

    /// Parses `text`, falling back to the default template when it is invalid.
    pub fn parse_or_default(text: &str, account: &str) -> Self {
        Self::parse(text).unwrap_or_else(|e| {
            tracing::warn!(account, template = text, error = %e, "invalid template, using default");
            Self::default()
        })
    }

    pub fn render(&self, summary: &Summary) -> String {
        let mut out = String::new();
        for segment in &self.0 {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(Field::Subject) => out.push_str(&summary.subject),
                Segment::Field(Field::From) => out.push_str(&summary.from),
                Segment::Field(Field::Name) => out.push_str(&summary.name),
                Segment::Field(Field::Address) => out.push_str(&summary.address),
            }
        }
        out
    }
}

impl Default for Template {
    fn default() -> Self {
        Self(vec![
            Segment::Field(Field::Subject),
            Segment::Literal(" from: ".to_string()),
            Segment::Field(Field::From),
        ])
    }
}

/// Per-account notifier.
pub struct Notifier {
    application: String,
    priority: i8,
    template: Template,
    transport: Arc<dyn PushTransport>,
}

impl Notifier {
    pub fn new(account: &AccountConfig, transport: Arc<dyn PushTransport>) -> Self {
        let application = account.label();
        let template = Template::parse_or_default(&account.template, &application);
        Self {
            application,
            priority: account.priority,
            template,
            transport,
        }
    }

    pub fn event(&self, summary: &Summary) -> PushEvent {
        PushEvent {
            application: self.application.clone(),
            event: self.template.render(summary),
            description: summary.body.clone(),
            priority: self.priority,
        }
    }

    pub async fn notify(&self, summary: &Summary) -> Result<(), NotifyError> {
        let event = self.event(summary);
        tracing::debug!(event = %event.event, description = %event.description, "sending notification");
        let code = self.transport.post(&event).await?;
        tracing::debug!(code = %code, "push service response");
        if code == SUCCESS_CODE {
            Ok(())
        } else {
            Err(NotifyError::Rejected(code))
        }
    }
}
