//! Scrivener ingestion pipeline components.
//!
//! This crate provides the concurrent, rate-limited engine that indexes a
//! chat platform's messages into a durable document store.
//!
//! # Modules
//!
//! - [`ratelimit`] - per-bucket request serialization and global cooldowns
//! - [`rest`] - shared HTTP client routing every request through the coordinator
//! - [`store`] - idempotent document-store adapter (messages, users, backfill state)
//! - [`backfill`] - channel claim/release workers walking message history
//! - [`gateway`] - the live WebSocket session and its reconnect supervisor
//! - [`config`] - environment-driven configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐      ┌─────────────────┐
//! │ Gateway Session │      │ Backfill Workers│
//! │     (live)      │      │  (historical)   │
//! └────────┬────────┘      └────────┬────────┘
//!          │                        │
//!          │                 ┌──────▼──────┐
//!          │                 │ Rate-Limit  │
//!          │                 │ Coordinator │
//!          │                 └──────┬──────┘
//!          │ MESSAGE_CREATE         │ message pages
//!          └──────────┬─────────────┘
//!                     ▼
//!          ┌──────────────────────┐
//!          │      Normalizer      │
//!          └──────────┬───────────┘
//!                     ▼
//!          ┌──────────────────────┐
//!          │    Store Adapter     │  unique index on message_id
//!          └──────────────────────┘
//! ```
//!
//! Both paths converge on the same store; the unique index on the message
//! identifier is the single deduplication point.

pub mod backfill;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;
pub mod rest;
pub mod store;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use backfill::{run_backfill_worker, BackfillSettings, PageOutcome};
pub use config::Config;
pub use gateway::{run_gateway, GatewaySettings};
pub use ratelimit::RateLimiter;
pub use rest::{ApiResponse, Channel, Guild, RestClient};
pub use store::{ingest_payload, BackfillClaim, IngestResult, MemoryStore, MongoStore, Store};
