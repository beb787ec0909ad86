use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use reservo_core::message::{InboundMessage, PlatformId, UserId};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("message delivery failed: {0}")]
    Send(String),
    #[error("message delivery timed out")]
    Timeout,
}

/// Capability to deliver one text reply on one channel. Implementations are
/// stateless and shared; they should be safe to retry without double-sending
/// at the wire level.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Delivers `text` to `user_id`, with the original inbound message
    /// available for platform-specific reply threading.
    async fn send_message(
        &self,
        user_id: &UserId,
        text: &str,
        original: &InboundMessage,
    ) -> Result<(), DeliveryError>;
}

/// Explicit mapping from platform identifiers to shared adapter instances.
/// An unresolved platform is the caller's unroutable case; the registry
/// never invents a fallback.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<PlatformId, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the adapter for one platform id. Registering the same
    /// instance under several ids is the supported aliasing mechanism.
    pub fn register(&mut self, platform: PlatformId, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(platform, adapter);
    }

    pub fn resolve(&self, platform: PlatformId) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
