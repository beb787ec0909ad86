use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Opaque per-platform user identifier (phone number, page-scoped id, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed set of supported delivery channels.
///
/// Several wire-level identifiers alias to one variant (and typically to one
/// shared adapter instance); anything outside this set is unroutable and is
/// rejected at intake by `FromStr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformId {
    Whatsapp,
    WhatsappBusiness,
    Messenger,
    Web,
}

impl PlatformId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::WhatsappBusiness => "whatsapp-business",
            Self::Messenger => "messenger",
            Self::Web => "web",
        }
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown platform identifier: {0}")]
pub struct UnknownPlatform(pub String);

impl FromStr for PlatformId {
    type Err = UnknownPlatform;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Ok(Self::Whatsapp),
            "whatsapp-business" | "whatsapp_business" => Ok(Self::WhatsappBusiness),
            "messenger" | "facebook" => Ok(Self::Messenger),
            "web" => Ok(Self::Web),
            other => Err(UnknownPlatform(other.to_owned())),
        }
    }
}

/// One inbound chat message as handed over by the platform webhook layer.
///
/// `raw` carries the platform-specific payload untouched; adapters read it
/// back for reply threading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub from: UserId,
    pub text: String,
    #[serde(default)]
    pub raw: Value,
}

/// One unit of work for the orchestrator. Immutable once dequeued and
/// consumed exactly once; the platform arrives as the raw wire identifier and
/// is parsed at intake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub platform: String,
    pub message: InboundMessage,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::PlatformId;

    #[test]
    fn known_platform_identifiers_parse_including_aliases() {
        assert_eq!("whatsapp".parse(), Ok(PlatformId::Whatsapp));
        assert_eq!("WhatsApp".parse(), Ok(PlatformId::Whatsapp));
        assert_eq!("whatsapp_business".parse(), Ok(PlatformId::WhatsappBusiness));
        assert_eq!("whatsapp-business".parse(), Ok(PlatformId::WhatsappBusiness));
        assert_eq!("facebook".parse(), Ok(PlatformId::Messenger));
        assert_eq!("messenger".parse(), Ok(PlatformId::Messenger));
        assert_eq!("web".parse(), Ok(PlatformId::Web));
    }

    #[test]
    fn unknown_platform_identifier_is_rejected() {
        let error = "telegram".parse::<PlatformId>().err().expect("telegram is not supported");
        assert_eq!(error.0, "telegram");
    }
}
