use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use reservo_agent::generation::{GenerationEngine, GenerationError, GenerationRequest};
use reservo_core::message::{PlatformId, QueueItem};
use reservo_core::session::{Session, SessionKey, SessionStore, SessionStoreError, Turn};
use reservo_core::telemetry::{TelemetryRecord, TelemetrySink};
use reservo_platform::adapter::{AdapterRegistry, DeliveryError, PlatformAdapter};

/// Fixed best-effort fallback sent when processing fails after the delivery
/// channel was resolved.
pub const APOLOGY_MESSAGE: &str = "Lo siento, ha ocurrido un error al procesar tu mensaje. \
Por favor, inténtalo de nuevo en unos minutos.";

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Session(#[from] SessionStoreError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Per-key mutual exclusion for the session read-modify-write. Without it,
/// two concurrent messages from the same user race on load → mutate → save
/// and one user turn is silently lost.
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, key: &SessionKey) -> OwnedMutexGuard<()> {
        let entry = self
            .locks
            .lock()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        entry.lock_owned().await
    }

    /// Removes the entry once no guard or waiter holds it, so the map tracks
    /// conversations in flight instead of every user ever seen. Waiters keep
    /// their own clone of the entry, so the count check cannot drop a lock
    /// someone is queued on.
    async fn release(&self, key: &SessionKey) {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(key) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(key);
            }
        }
    }
}

/// Root of the processing pipeline: consumes one queue item, runs the
/// session → generation → persistence → delivery → telemetry sequence, and
/// falls back to a fixed apology before re-raising on failure.
pub struct Orchestrator {
    registry: AdapterRegistry,
    sessions: Arc<dyn SessionStore>,
    engine: GenerationEngine,
    telemetry: Arc<dyn TelemetrySink>,
    session_locks: SessionLocks,
}

impl Orchestrator {
    pub fn new(
        registry: AdapterRegistry,
        sessions: Arc<dyn SessionStore>,
        engine: GenerationEngine,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self { registry, sessions, engine, telemetry, session_locks: SessionLocks::default() }
    }

    /// Processes one queue item. An unroutable platform is a logged no-op
    /// (there is no authorized channel to respond through); any later
    /// failure triggers the apology fallback and is then returned so the
    /// queue infrastructure can apply its retry/dead-letter policy.
    pub async fn process(&self, item: QueueItem) -> Result<(), ProcessError> {
        let started = Instant::now();

        let platform = match item.platform.parse::<PlatformId>() {
            Ok(platform) => platform,
            Err(unknown) => {
                warn!(
                    event_name = "orchestrator.unroutable_platform",
                    platform = %item.platform,
                    "{unknown}; dropping message"
                );
                return Ok(());
            }
        };
        let Some(adapter) = self.registry.resolve(platform) else {
            warn!(
                event_name = "orchestrator.unroutable_platform",
                platform = platform.as_str(),
                "no delivery adapter registered; dropping message"
            );
            return Ok(());
        };

        match self.respond(platform, &adapter, &item, started).await {
            Ok(()) => Ok(()),
            Err(process_error) => {
                error!(
                    event_name = "orchestrator.message_failed",
                    platform = platform.as_str(),
                    error = %process_error,
                    "message processing failed; sending fallback"
                );
                if let Err(fallback_error) =
                    adapter.send_message(&item.message.from, APOLOGY_MESSAGE, &item.message).await
                {
                    // The fallback failure must not mask the original error.
                    warn!(
                        event_name = "orchestrator.fallback_delivery_failed",
                        platform = platform.as_str(),
                        error = %fallback_error,
                        "apology delivery failed"
                    );
                }
                Err(process_error)
            }
        }
    }

    async fn respond(
        &self,
        platform: PlatformId,
        adapter: &Arc<dyn PlatformAdapter>,
        item: &QueueItem,
        started: Instant,
    ) -> Result<(), ProcessError> {
        let key = SessionKey { platform, user_id: item.message.from.clone() };
        let guard = self.session_locks.acquire(&key).await;
        let result = self.exchange(platform, adapter, item, started, &key).await;
        drop(guard);
        self.session_locks.release(&key).await;
        result
    }

    async fn exchange(
        &self,
        platform: PlatformId,
        adapter: &Arc<dyn PlatformAdapter>,
        item: &QueueItem,
        started: Instant,
        key: &SessionKey,
    ) -> Result<(), ProcessError> {
        let mut session =
            self.sessions.get(key).await?.unwrap_or_else(|| Session::new(Utc::now()));

        // push_turn re-applies the history window after each append, so the
        // window is current both at generation and at persistence time.
        session.push_turn(Turn::user(&item.message.text));

        let outcome = self
            .engine
            .generate(GenerationRequest {
                platform,
                user_text: &item.message.text,
                history: &session.history,
            })
            .await?;

        session.push_turn(Turn::assistant(&outcome.reply_text));
        session.message_count += 1;
        session.last_message_at = Utc::now();

        // Persist before delivery: a failed send must not lose the exchange.
        self.sessions.put(key, &session).await?;

        adapter.send_message(&item.message.from, &outcome.reply_text, &item.message).await?;

        let record = TelemetryRecord::new(
            platform,
            &item.message.from,
            &item.message.text,
            &outcome.reply_text,
            started.elapsed().as_millis() as u64,
            outcome.token_count,
        );
        if let Err(telemetry_error) = self.telemetry.record(&record).await {
            warn!(
                event_name = "orchestrator.telemetry_failed",
                platform = platform.as_str(),
                error = %telemetry_error,
                "telemetry write failed; message already processed"
            );
        }

        info!(
            event_name = "orchestrator.message_processed",
            platform = platform.as_str(),
            user_suffix = %record.user_suffix,
            response_time_ms = record.response_time_ms,
            token_count = outcome.token_count,
            tool_call_count = outcome.tool_call_count,
            policy_degraded = outcome.degraded_policy,
            "reply delivered"
        );
        Ok(())
    }
}
