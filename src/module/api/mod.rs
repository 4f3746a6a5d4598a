//! Protocol layer for modules
//!
//! Client contract handed to modules and the in-process hub implementing it.

pub mod client;
pub mod hub;

pub use client::{ProtocolClient, ProtocolClientFactory};
pub use hub::{AuditEntry, HubClient, ProtocolHub};
