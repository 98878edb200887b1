use super::{NotifyError, PushEvent, PushTransport, SUCCESS_CODE};
use async_trait::async_trait;
use ntfy::{Dispatcher, Payload, Priority, Url};

/// Publishes events to an ntfy topic.
pub struct NtfyTransport {
    dispatcher: Dispatcher,
    topic: String,
    click: Option<Url>,
}

impl NtfyTransport {
    pub fn new(url: &str, topic: &str, click_url: Option<&str>) -> Result<Self, NotifyError> {
        let dispatcher = Dispatcher::builder(url)
            .build()
            .map_err(|e| NotifyError::Ntfy(e.to_string()))?;
        let click = click_url
            .map(|click| Url::parse(click).map_err(|_| NotifyError::InvalidUrl(click.to_string())))
            .transpose()?;
        Ok(Self {
            dispatcher,
            topic: topic.to_string(),
            click,
        })
    }
}

fn priority(level: i8) -> Priority {
    match level {
        i8::MIN..=-2 => Priority::Min,
        -1 => Priority::Low,
        0 => Priority::Default,
        1 => Priority::High,
        _ => Priority::Max,
    }
}

#[async_trait]
impl PushTransport for NtfyTransport {
    async fn post(&self, event: &PushEvent) -> Result<String, NotifyError> {
        let mut payload = Payload::new(&self.topic)
            .title(&event.application)
            .message(format!("{}\n{}", event.event, event.description))
            .priority(priority(event.priority));
        if let Some(click) = &self.click {
            payload = payload.click(click.clone());
        }
        self.dispatcher
            .send(&payload)
            .await
            .map_err(|e| NotifyError::Ntfy(e.to_string()))?;
        Ok(SUCCESS_CODE.to_string())
    }
}
