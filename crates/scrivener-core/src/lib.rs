//! Shared domain model and plumbing for the Scrivener message indexer.
//!
//! This crate holds everything both the ingestion daemon and any future
//! read-path tooling need to agree on:
//!
//! - [`message`] - the message record, user projection, and the normalizer
//!   that turns raw upstream payloads into records
//! - [`metrics`] - Prometheus recorder bootstrap and the `/metrics` endpoint
//! - [`time`] - epoch-millisecond wall-clock helpers

pub mod message;
pub mod metrics;
pub mod time;

pub use message::{normalize, AuthorIdentity, MessageRecord, NormalizedMessage, Source};
pub use time::now_ms;
