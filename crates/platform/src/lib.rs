//! Outbound delivery adapters.
//!
//! One `PlatformAdapter` implementation per distinct outbound channel; the
//! `AdapterRegistry` maps the closed `PlatformId` enumeration to shared
//! adapter instances, with several identifiers explicitly aliased to one
//! instance where channels share a wire API.

pub mod adapter;
pub mod whatsapp;

pub use adapter::{AdapterRegistry, DeliveryError, PlatformAdapter};
pub use whatsapp::WhatsappAdapter;
