use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::debug;

use reservo_core::config::WhatsappConfig;
use reservo_core::message::{InboundMessage, UserId};

use crate::adapter::{DeliveryError, PlatformAdapter};

/// WhatsApp Cloud API sender (`POST {base_url}/{phone_number_id}/messages`).
///
/// One shared instance serves every platform id aliased to WhatsApp-style
/// delivery (whatsapp, whatsapp-business, messenger).
pub struct WhatsappAdapter {
    http: reqwest::Client,
    base_url: String,
    phone_number_id: String,
    access_token: SecretString,
}

impl WhatsappAdapter {
    pub fn from_config(config: &WhatsappConfig) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| DeliveryError::Send(error.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            phone_number_id: config.phone_number_id.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn payload(&self, user_id: &UserId, text: &str, original: &InboundMessage) -> Value {
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "to": user_id.as_str(),
            "type": "text",
            "text": { "body": text },
        });

        // Thread the reply onto the inbound message when the webhook payload
        // carried a message id.
        if let Some(message_id) = original.raw.get("id").and_then(Value::as_str) {
            payload["context"] = json!({ "message_id": message_id });
        }

        payload
    }
}

#[async_trait]
impl PlatformAdapter for WhatsappAdapter {
    async fn send_message(
        &self,
        user_id: &UserId,
        text: &str,
        original: &InboundMessage,
    ) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(format!("{}/{}/messages", self.base_url, self.phone_number_id))
            .bearer_auth(self.access_token.expose_secret())
            .json(&self.payload(user_id, text, original))
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Send(error.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Send(format!("status {status}: {body}")));
        }

        debug!(
            event_name = "platform.whatsapp.sent",
            to_suffix = %reservo_core::telemetry::anonymize_user_id(user_id.as_str()),
            "outbound message delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use serde_json::json;

    use reservo_core::config::WhatsappConfig;
    use reservo_core::message::{InboundMessage, UserId};

    use super::WhatsappAdapter;

    fn adapter() -> WhatsappAdapter {
        WhatsappAdapter::from_config(&WhatsappConfig {
            access_token: SecretString::from("EAAG-test".to_owned()),
            phone_number_id: "1055501234".to_owned(),
            base_url: "https://graph.facebook.com/v19.0".to_owned(),
            timeout_secs: 10,
        })
        .expect("adapter builds")
    }

    #[test]
    fn reply_threads_onto_the_inbound_message_id() {
        let adapter = adapter();
        let original = InboundMessage {
            from: UserId("34600111222".to_owned()),
            text: "hola".to_owned(),
            raw: json!({"id": "wamid.ABC123"}),
        };

        let payload = adapter.payload(&original.from, "buenas", &original);

        assert_eq!(payload["to"], "34600111222");
        assert_eq!(payload["text"]["body"], "buenas");
        assert_eq!(payload["context"]["message_id"], "wamid.ABC123");
    }

    #[test]
    fn reply_without_inbound_id_omits_threading_context() {
        let adapter = adapter();
        let original = InboundMessage {
            from: UserId("34600111222".to_owned()),
            text: "hola".to_owned(),
            raw: json!({}),
        };

        let payload = adapter.payload(&original.from, "buenas", &original);

        assert!(payload.get("context").is_none());
    }
}
