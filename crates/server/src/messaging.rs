use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use frontdesk_core::config::MessagingConfig;
use frontdesk_core::ports::{
    DeliveryReceipt, EmailMessage, MessagingError, MessagingProvider, SmsMessage, WebhookRequest,
};
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Frontdesk-Signature";

#[derive(Debug, Deserialize)]
struct RelayAccepted {
    #[serde(default)]
    message_id: Option<String>,
}

/// Sends email and SMS through an HTTP relay and webhooks directly to their
/// target. Without a relay, email and SMS are only logged.
pub struct RelayMessagingProvider {
    client: Client,
    relay_url: Option<String>,
    api_key: Option<SecretString>,
    signing_secret: Option<SecretString>,
}

impl RelayMessagingProvider {
    pub fn from_config(config: &MessagingConfig) -> Result<Self, MessagingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|error| MessagingError::Transport(format!("http client: {error}")))?;

        Ok(Self {
            client,
            relay_url: config.relay_url.as_ref().map(|url| url.trim_end_matches('/').to_string()),
            api_key: config.api_key.clone(),
            signing_secret: config.webhook_signing_secret.clone(),
        })
    }

    pub fn is_log_only(&self) -> bool {
        self.relay_url.is_none()
    }

    async fn relay(
        &self,
        channel: &'static str,
        to: &str,
        payload: serde_json::Value,
    ) -> Result<DeliveryReceipt, MessagingError> {
        let Some(relay_url) = &self.relay_url else {
            info!(
                event_name = "messaging.delivery.logged",
                correlation_id = "messaging",
                channel,
                to,
                "no relay configured; message logged only"
            );
            return Ok(receipt(channel, None));
        };

        let mut request = self.client.post(format!("{relay_url}/{channel}")).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }
        let accepted = send(request, channel).await?;
        info!(
            event_name = "messaging.delivery.accepted",
            correlation_id = "messaging",
            channel,
            message_id = %accepted.message_id,
            "message accepted by relay"
        );
        Ok(accepted)
    }
}

#[async_trait]
impl MessagingProvider for RelayMessagingProvider {
    async fn send_email(&self, message: &EmailMessage) -> Result<DeliveryReceipt, MessagingError> {
        let payload = serde_json::to_value(message)
            .map_err(|error| MessagingError::Rejected(error.to_string()))?;
        self.relay("email", &message.to, payload).await
    }

    async fn send_sms(&self, message: &SmsMessage) -> Result<DeliveryReceipt, MessagingError> {
        let payload = serde_json::to_value(message)
            .map_err(|error| MessagingError::Rejected(error.to_string()))?;
        self.relay("sms", &message.to, payload).await
    }

    async fn send_webhook(
        &self,
        request: &WebhookRequest,
    ) -> Result<DeliveryReceipt, MessagingError> {
        let body = serde_json::to_vec(&request.payload)
            .map_err(|error| MessagingError::Rejected(error.to_string()))?;

        let mut outbound = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.signing_secret {
            outbound = outbound.header(SIGNATURE_HEADER, sign(secret.expose_secret(), &body)?);
        }
        send(outbound.body(body), "webhook").await
    }
}

async fn send(request: RequestBuilder, channel: &'static str) -> Result<DeliveryReceipt, MessagingError> {
    let response = request.send().await.map_err(|error| {
        warn!(
            event_name = "messaging.delivery.failed",
            correlation_id = "messaging",
            channel,
            error = %error,
            "outbound message request failed"
        );
        MessagingError::Transport(error.to_string())
    })?;

    let status = response.status();
    if status.is_client_error() {
        return Err(MessagingError::Rejected(format!("{channel} endpoint returned {status}")));
    }
    if !status.is_success() {
        return Err(MessagingError::Transport(format!("{channel} endpoint returned {status}")));
    }

    // Relays may answer with an empty body; the id is then generated locally.
    let message_id = if status == StatusCode::NO_CONTENT {
        None
    } else {
        response.json::<RelayAccepted>().await.ok().and_then(|accepted| accepted.message_id)
    };
    Ok(receipt(channel, message_id))
}

fn receipt(channel: &str, message_id: Option<String>) -> DeliveryReceipt {
    DeliveryReceipt {
        channel: channel.to_string(),
        message_id: message_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        accepted_at: Utc::now(),
    }
}

/// `sha256=<hex>` over the exact request body.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, MessagingError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|error| MessagingError::NotConfigured(format!("signing secret: {error}")))?;
    mac.update(body);
    Ok(format!("sha256={}", encode_hex(mac.finalize().into_bytes().as_slice())))
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{body::Bytes, extract::State, http::HeaderMap, routing::post, Json, Router};
    use frontdesk_core::config::MessagingConfig;
    use frontdesk_core::ports::{MessagingProvider, SmsMessage, WebhookRequest};
    use secrecy::SecretString;
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::{sign, RelayMessagingProvider, SIGNATURE_HEADER};

    type Seen = Arc<Mutex<Vec<(Option<String>, Bytes)>>>;

    async fn receiver() -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route(
                "/hook",
                post(|State(seen): State<Seen>, headers: HeaderMap, body: Bytes| async move {
                    let signature = headers
                        .get(SIGNATURE_HEADER)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    seen.lock().await.push((signature, body));
                    Json(json!({ "message_id": "hook-1" }))
                }),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{address}"), seen)
    }

    fn config(signing_secret: Option<&str>) -> MessagingConfig {
        MessagingConfig {
            relay_url: None,
            api_key: None,
            webhook_signing_secret: signing_secret.map(|secret| SecretString::from(secret.to_string())),
            timeout_secs: 5,
        }
    }

    #[test]
    fn signature_is_stable_hex() {
        let signature = sign("topsecret", b"{}").expect("sign");

        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);
        assert_eq!(signature, sign("topsecret", b"{}").expect("sign again"));
        assert_ne!(signature, sign("other", b"{}").expect("sign other"));
    }

    #[tokio::test]
    async fn sms_without_relay_is_logged_and_accepted() {
        let provider = RelayMessagingProvider::from_config(&config(None)).expect("provider");
        assert!(provider.is_log_only());

        let receipt = provider
            .send_sms(&SmsMessage { to: "+15551234567".to_string(), body: "hi".to_string() })
            .await
            .expect("receipt");

        assert_eq!(receipt.channel, "sms");
        assert!(!receipt.message_id.is_empty());
    }

    #[tokio::test]
    async fn webhooks_carry_a_signature_over_the_body() {
        let (base, seen) = receiver().await;
        let provider =
            RelayMessagingProvider::from_config(&config(Some("topsecret"))).expect("provider");

        let receipt = provider
            .send_webhook(&WebhookRequest {
                url: format!("{base}/hook"),
                payload: json!({ "event": "lead.captured" }),
            })
            .await
            .expect("delivered");

        assert_eq!(receipt.message_id, "hook-1");
        let seen = seen.lock().await;
        let (signature, body) = &seen[0];
        assert_eq!(signature.as_deref(), Some(sign("topsecret", body).expect("sign").as_str()));
    }

    #[tokio::test]
    async fn missing_endpoints_are_rejected() {
        let (base, _) = receiver().await;
        let provider = RelayMessagingProvider::from_config(&config(None)).expect("provider");

        let result = provider
            .send_webhook(&WebhookRequest { url: format!("{base}/nope"), payload: json!({}) })
            .await;

        assert!(matches!(result, Err(frontdesk_core::ports::MessagingError::Rejected(_))));
    }
}
