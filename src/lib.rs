//! # Spiral Bridge
//!
//! Spiral Bridge bidirectionally synchronizes the agent fleet's task graph,
//! held in a Redis-resident conscious state, with an external collaborative
//! planner operated by humans. Agents only ever touch Redis; this service is
//! the sole bridge that makes their changes visible to humans and vice versa.
//!
//! ## Architecture
//!
//! The system consists of:
//! - **Upload Pipeline**: detects agent-side mutations and pushes them to the planner
//! - **Download Pipeline**: ingests planner webhooks (with a polling fallback) and writes back into Redis
//! - **Adapter**: pure translation between the nested agent shape and the flat planner shape
//! - **Token Service**: dual delegated/application credentials, refreshed ahead of expiry
//! - **Subscription Manager**: change-notification subscription lifecycle per resource family
//! - **Webhook Receiver**: validation handshakes and notification ingestion
//! - **Health/Housekeeper**: liveness snapshots and slow-invariant repair
//!
//! ## Usage
//!
//! The system runs as a standalone service next to Redis; the webhook
//! receiver is exposed publicly through whatever ingress fronts it.

/// Agent-shape ⇄ planner-shape translation
pub mod adapter;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// Planner HTTP client and metadata cache
pub mod graph;
/// Health snapshots and housekeeping
pub mod health;
/// Core data models
pub mod models;
/// Redis stores, queues, and pub/sub
pub mod redis;
/// Subscription lifecycle management
pub mod subscriptions;
/// Component lifecycle
pub mod supervisor;
/// Upload and download pipelines
pub mod sync;
/// Dual-credential token service
pub mod token;
/// Webhook receiver
pub mod webhook;

#[cfg(test)]
mod tests;

pub use error::{BridgeError, Result};
