use super::{NotifyError, PushEvent, PushTransport};
use crate::config::ProxyConfig;
use async_trait::async_trait;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Posts events as an `application/x-www-form-urlencoded` form.
pub struct ProwlTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl ProwlTransport {
    pub fn new(
        api_key: &str,
        endpoint: &str,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Self, NotifyError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(proxy) = proxy {
            let mut http_proxy = reqwest::Proxy::all(&proxy.url)?;
            if let Some(user) = &proxy.user {
                http_proxy = http_proxy.basic_auth(user, proxy.password.as_deref().unwrap_or(""));
            }
            builder = builder.proxy(http_proxy);
        }
        Ok(Self {
            client: builder.build()?,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn form(&self, event: &PushEvent) -> String {
        let priority = event.priority.to_string();
        [
            ("apikey", self.api_key.as_str()),
            ("application", event.application.as_str()),
            ("event", event.event.as_str()),
            ("description", event.description.as_str()),
            ("priority", priority.as_str()),
        ]
        .iter()
        .map(|(key, value)| format!("{key}={}", escape_form_value(value)))
        .collect::<Vec<_>>()
        .join("&")
    }
}

#[async_trait]
impl PushTransport for ProwlTransport {
    async fn post(&self, event: &PushEvent) -> Result<String, NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(self.form(event))
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        Ok(response_code(&text).unwrap_or_else(|| status.as_u16().to_string()))
    }
}

/// Percent-escapes a form value: space becomes `+`, and every byte outside
/// `[A-Za-z0-9_.-]` becomes `%XX`.
pub fn escape_form_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b' ' => out.push('+'),
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'-' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Pulls the `code="..."` attribute out of the service's XML answer.
fn response_code(body: &str) -> Option<String> {
    let start = body.find("code=\"")? + "code=\"".len();
    let len = body[start..].find('"')?;
    Some(body[start..start + len].to_string())
}
