//! Core domain for the reservo conversation engine.
//!
//! This crate owns everything the rest of the workspace agrees on:
//!
//! - The inbound message model (`message`): queue items, inbound messages,
//!   user ids, and the closed set of platform identifiers.
//! - The conversation session model (`session`): turns, the bounded history
//!   window, and the `SessionStore` collaborator seam.
//! - The action-authorization policy engine (`policy`): declarative rules with
//!   tagged condition operators, deterministic selection, and the
//!   fail-open-capable `PolicyGate` seam.
//! - The telemetry contract (`telemetry`): anonymized per-message records and
//!   the `TelemetrySink` seam.
//! - Layered configuration (`config`).
//!
//! Side-effecting collaborators (chat model, scheduling API, outbound
//! delivery, sqlite persistence) live in the sibling crates and depend on the
//! traits defined here.

pub mod config;
pub mod message;
pub mod policy;
pub mod session;
pub mod telemetry;

pub use message::{InboundMessage, PlatformId, QueueItem, UnknownPlatform, UserId};
pub use policy::{
    ActionRequest, Condition, Effect, Policy, PolicyDecision, PolicyEngine, PolicyGate,
    PolicyGateError, PolicyLoadError, PolicyRule, Predicate, TargetPattern,
};
pub use session::{
    InMemorySessionStore, Role, Session, SessionKey, SessionStore, SessionStoreError, Turn,
    HISTORY_WINDOW,
};
pub use telemetry::{
    anonymize_user_id, NoopTelemetrySink, TelemetryError, TelemetryRecord, TelemetrySink,
    TracingTelemetrySink,
};
