//! Generic HTTP JSON delivery adapter.
//!
//! Covers providers with a bearer-authenticated JSON send endpoint. The
//! request shape is a lowest-common-denominator document; provider-exact
//! payloads are out of scope for the pipeline, which only depends on the
//! adapter contract.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::{
    adapter::{BatchOutcome, EspAdapter, SendOutcome},
    error::EspError,
    message::OutboundMessage,
};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// An [`EspAdapter`] speaking JSON over HTTPS.
#[derive(Debug)]
pub struct HttpEspAdapter {
    esp_type: String,
    endpoint: String,
    api_key: String,
    max_batch_size: usize,
    max_payload_bytes: usize,
    client: reqwest::Client,
}

impl HttpEspAdapter {
    /// Build an adapter for one sending profile.
    ///
    /// # Errors
    ///
    /// Returns [`EspError::InvalidConfiguration`] when the endpoint is not
    /// an HTTP(S) URL or the HTTP client cannot be constructed.
    pub fn new(
        esp_type: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        max_batch_size: usize,
        max_payload_bytes: usize,
    ) -> Result<Self, EspError> {
        let endpoint = endpoint.into();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(EspError::InvalidConfiguration(format!(
                "endpoint is not an HTTP URL: {endpoint}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| EspError::InvalidConfiguration(e.to_string()))?;

        Ok(Self {
            esp_type: esp_type.into(),
            endpoint,
            api_key: api_key.into(),
            max_batch_size: max_batch_size.max(1),
            max_payload_bytes,
            client,
        })
    }

    fn message_payload(message: &OutboundMessage) -> serde_json::Value {
        let mut content = Vec::new();
        if let Some(text) = &message.text {
            content.push(json!({"type": "text/plain", "value": text}));
        }
        if let Some(html) = &message.html {
            content.push(json!({"type": "text/html", "value": html}));
        }

        let headers: serde_json::Map<String, serde_json::Value> = message
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
            .collect();

        json!({
            "from": {"email": message.from_email, "name": message.from_name},
            "reply_to": message.reply_to,
            "to": [{"email": message.to.as_str(), "name": message.to_name}],
            "subject": message.subject,
            "content": content,
            "headers": headers,
        })
    }

    /// Pull a message id out of the provider's response document or
    /// headers; fall back to a locally minted id so `sent` rows always
    /// carry one.
    fn extract_message_id(headers: &reqwest::header::HeaderMap, body: &serde_json::Value) -> String {
        if let Some(id) = body
            .get("id")
            .or_else(|| body.get("message_id"))
            .and_then(serde_json::Value::as_str)
        {
            return id.to_string();
        }
        if let Some(id) = headers
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
        {
            return id.to_string();
        }
        ulid::Ulid::new().to_string()
    }

    async fn post(&self, payload: &serde_json::Value) -> SendOutcome {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return SendOutcome::failure(format!("transport error: {e}")),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);

        if status.is_success() {
            SendOutcome::ok(Self::extract_message_id(&headers, &body))
        } else {
            let detail = body
                .get("error")
                .or_else(|| body.get("errors"))
                .map_or_else(String::new, ToString::to_string);
            SendOutcome::failure(format!("HTTP {status}: {detail}"))
        }
    }
}

#[async_trait]
impl EspAdapter for HttpEspAdapter {
    fn esp_type(&self) -> &str {
        &self.esp_type
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        debug!(esp = %self.esp_type, to = %message.to, "sending message");
        self.post(&Self::message_payload(message)).await
    }

    async fn send_batch(&self, messages: &[OutboundMessage]) -> BatchOutcome {
        if messages.len() <= 1 || self.max_batch_size <= 1 {
            let mut results = Vec::with_capacity(messages.len());
            for message in messages {
                results.push(self.send(message).await);
            }
            return BatchOutcome {
                batch_id: None,
                results,
            };
        }

        let payload = json!({
            "messages": messages.iter().map(Self::message_payload).collect::<Vec<_>>(),
        });

        // One request for the whole batch: the provider either accepts the
        // document or rejects it wholesale, so the outcome fans out to
        // every message identically.
        let outcome = self.post(&payload).await;
        let batch_id = outcome.provider_message_id.clone();
        let results = messages
            .iter()
            .enumerate()
            .map(|(index, _)| {
                if outcome.success {
                    SendOutcome::ok(format!(
                        "{}-{index}",
                        batch_id.as_deref().unwrap_or("batch")
                    ))
                } else {
                    outcome.clone()
                }
            })
            .collect();

        BatchOutcome { batch_id, results }
    }
}

#[cfg(test)]
mod tests {
    use cadence_common::{
        EmailAddress,
        ids::{CampaignId, QueueRowId, SubscriberId},
    };

    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage {
            to: EmailAddress::parse("user@example.com").unwrap(),
            to_name: Some("User".to_string()),
            from_email: "news@acme.example".to_string(),
            from_name: "Acme".to_string(),
            reply_to: None,
            subject: "Hello".to_string(),
            html: Some("<p>Hi</p>".to_string()),
            text: Some("Hi".to_string()),
            headers: vec![("X-Job".to_string(), "c-1".to_string())],
            campaign_id: CampaignId::generate(),
            queue_row_id: QueueRowId::generate(),
            subscriber_id: SubscriberId::generate(),
        }
    }

    #[test]
    fn rejects_non_http_endpoints() {
        assert!(HttpEspAdapter::new("smtpish", "ftp://host", "key", 1, 1024).is_err());
        assert!(HttpEspAdapter::new("ok", "https://api.example/send", "key", 1, 1024).is_ok());
    }

    #[test]
    fn payload_carries_both_parts_and_headers() {
        let payload = HttpEspAdapter::message_payload(&message());
        assert_eq!(payload["to"][0]["email"], "user@example.com");
        assert_eq!(payload["content"][0]["type"], "text/plain");
        assert_eq!(payload["content"][1]["type"], "text/html");
        assert_eq!(payload["headers"]["X-Job"], "c-1");
    }

    #[test]
    fn message_id_prefers_body_over_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-message-id", "from-header".parse().unwrap());

        let body = serde_json::json!({"id": "from-body"});
        assert_eq!(
            HttpEspAdapter::extract_message_id(&headers, &body),
            "from-body"
        );

        let empty = serde_json::Value::Null;
        assert_eq!(
            HttpEspAdapter::extract_message_id(&headers, &empty),
            "from-header"
        );
    }

    #[tokio::test]
    async fn transport_failure_is_an_outcome_not_an_error() {
        // Nothing listens on this port; the send must come back as a
        // failed outcome rather than propagating.
        let adapter =
            HttpEspAdapter::new("test", "http://127.0.0.1:1/send", "key", 1, 1024).unwrap();
        let outcome = adapter.send(&message()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("transport error"));
    }
}
