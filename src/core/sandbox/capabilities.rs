use base64::Engine;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use crate::core::config::ServiceEndpoints;
use crate::core::error::ServiceError;
use crate::core::vault::Credentials;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ERROR_BODY: usize = 512;

/// The outward-facing operations a sandbox unit may perform.
///
/// One instance is built per invocation from the owner's resolved credentials;
/// each method fails with [`ServiceError`] rather than panicking or no-oping.
pub struct Capabilities {
    client: Client,
    credentials: Credentials,
    endpoints: ServiceEndpoints,
}

impl Capabilities {
    pub fn new(client: Client, credentials: Credentials, endpoints: ServiceEndpoints) -> Self {
        Self {
            client,
            credentials,
            endpoints,
        }
    }

    pub fn build_client(endpoints: &ServiceEndpoints) -> reqwest::Result<Client> {
        Client::builder()
            .user_agent(concat!("flowforge/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(endpoints.request_timeout_secs))
            .build()
    }

    fn credential(&self, service: &str) -> Result<&Value, ServiceError> {
        self.credentials
            .get(service)
            .ok_or_else(|| ServiceError::NotConfigured {
                service: service.to_string(),
            })
    }

    fn field(&self, service: &str, field: &str) -> Result<String, ServiceError> {
        self.credential(service)?
            .get(field)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ServiceError::MissingField {
                service: service.to_string(),
                field: field.to_string(),
            })
    }

    /// Gmail when a Google credential exists, Brevo otherwise.
    pub async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<Value, ServiceError> {
        if to.trim().is_empty() {
            return Err(ServiceError::InvalidArgument("recipient is empty".to_string()));
        }

        if self.credentials.get("google").is_some() {
            let token = self.field("google", "access_token")?;
            let message = format!("To: {}\r\nSubject: {}\r\n\r\n{}", to, subject, body);
            let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(message);
            let request = self
                .client
                .post(format!(
                    "{}/gmail/v1/users/me/messages/send",
                    self.endpoints.gmail_url
                ))
                .bearer_auth(token)
                .json(&json!({ "raw": raw }));
            return self.dispatch("google", request).await.map(|(_, v)| v);
        }

        if self.credentials.get("brevo").is_some() {
            let api_key = self.field("brevo", "api_key")?;
            let request = self
                .client
                .post(format!("{}/v3/smtp/email", self.endpoints.brevo_url))
                .header("api-key", api_key)
                .json(&json!({
                    "sender": { "email": self.endpoints.brevo_sender, "name": "FlowForge Agent" },
                    "to": [{ "email": to }],
                    "subject": subject,
                    "htmlContent": body,
                }));
            return self.dispatch("brevo", request).await.map(|(_, v)| v);
        }

        Err(ServiceError::NotConfigured {
            service: "email".to_string(),
        })
    }

    /// `discord:<label>` goes to the Discord webhook; `slack:<channel>` or a bare
    /// channel name goes to Slack.
    pub async fn send_message(&self, channel: &str, text: &str) -> Result<Value, ServiceError> {
        if let Some(label) = channel.strip_prefix("discord:") {
            let webhook = self.field("discord", "webhook_url")?;
            let request = self.client.post(webhook).json(&json!({ "content": text }));
            self.dispatch("discord", request).await?;
            return Ok(json!({ "ok": true, "channel": label }));
        }

        let channel = channel.strip_prefix("slack:").unwrap_or(channel);
        if channel.is_empty() {
            return Err(ServiceError::InvalidArgument("channel is empty".to_string()));
        }
        let token = self.field("slack", "token")?;
        let request = self
            .client
            .post(format!("{}/api/chat.postMessage", self.endpoints.slack_url))
            .bearer_auth(token)
            .json(&json!({ "channel": channel, "text": text }));
        let (_, reply) = self.dispatch("slack", request).await?;

        // Slack reports most failures as HTTP 200 with ok=false.
        if reply.get("ok").and_then(Value::as_bool) == Some(false) {
            let message = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(ServiceError::Rejected {
                service: "slack".to_string(),
                message,
            });
        }
        Ok(reply)
    }

    /// Returns the model's text answer as a JSON string.
    pub async fn analyze_with_model(&self, prompt: &str, data: &Value) -> Result<Value, ServiceError> {
        let api_key = self.field("claude", "api_key")?;
        let content = if data.is_null() {
            prompt.to_string()
        } else {
            format!("{}\n\nData: {}", prompt, data)
        };
        let request = self
            .client
            .post(format!("{}/v1/messages", self.endpoints.anthropic_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": self.endpoints.anthropic_model,
                "max_tokens": 1000,
                "messages": [{ "role": "user", "content": content }],
            }));
        let (_, reply) = self.dispatch("claude", request).await?;

        let text = reply
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| blocks.iter().find_map(|b| b.get("text").and_then(Value::as_str)))
            .ok_or_else(|| ServiceError::Request {
                service: "claude".to_string(),
                message: "response did not contain a text block".to_string(),
            })?;
        Ok(Value::String(text.to_string()))
    }

    /// `values` is either one row (`[a, b]`) or a list of rows (`[[a, b], [c, d]]`).
    pub async fn append_rows(&self, sheet_id: &str, range: &str, values: &Value) -> Result<Value, ServiceError> {
        let Some(items) = values.as_array() else {
            return Err(ServiceError::InvalidArgument(
                "values must be a JSON array".to_string(),
            ));
        };
        let rows = if items.iter().all(Value::is_array) && !items.is_empty() {
            values.clone()
        } else {
            Value::Array(vec![values.clone()])
        };

        let token = self.field("google", "access_token")?;
        let request = self
            .client
            .post(format!(
                "{}/v4/spreadsheets/{}/values/{}:append?valueInputOption=RAW",
                self.endpoints.sheets_url,
                urlencoding::encode(sheet_id),
                urlencoding::encode(range)
            ))
            .bearer_auth(token)
            .json(&json!({ "values": rows }));
        self.dispatch("google", request).await.map(|(_, v)| v)
    }

    pub async fn create_issue(&self, owner: &str, repo: &str, title: &str, body: &str) -> Result<Value, ServiceError> {
        if owner.is_empty() || repo.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "owner and repo are required".to_string(),
            ));
        }
        let token = self.field("github", "token")?;
        let request = self
            .client
            .post(format!(
                "{}/repos/{}/{}/issues",
                self.endpoints.github_url,
                urlencoding::encode(owner),
                urlencoding::encode(repo)
            ))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({ "title": title, "body": body }));
        self.dispatch("github", request).await.map(|(_, v)| v)
    }

    /// Generic request. `options` may carry `method`, `headers` (string map) and
    /// `body` (string sent verbatim, anything else sent as JSON).
    pub async fn http_request(&self, url: &str, options: &Value) -> Result<Value, ServiceError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| ServiceError::InvalidArgument(format!("invalid url '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ServiceError::InvalidArgument(format!(
                "unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }

        let method = options
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ServiceError::InvalidArgument(format!("invalid method '{}'", method)))?;

        let mut request = self.client.request(method, parsed);
        if let Some(headers) = options.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }
        match options.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(other) => request = request.json(other),
        }

        let (status, body) = self.dispatch("http", request).await?;
        Ok(json!({ "status": status, "body": body }))
    }

    /// Send a request and decode the reply body (JSON when possible, text otherwise).
    async fn dispatch(&self, service: &str, request: RequestBuilder) -> Result<(u16, Value), ServiceError> {
        let response = request.send().await.map_err(|e| ServiceError::Request {
            service: service.to_string(),
            message: e.to_string(),
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|e| ServiceError::Request {
            service: service.to_string(),
            message: e.to_string(),
        })?;
        debug!("{} replied with HTTP {} ({} bytes)", service, status.as_u16(), text.len());

        if !status.is_success() {
            let mut body = text;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(ServiceError::Status {
                service: service.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status.as_u16(), value))
    }
}
