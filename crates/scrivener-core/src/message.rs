//! Message records and the payload normalizer.
//!
//! Both ingestion paths (the live gateway stream and the historical
//! backfill) produce the same [`MessageRecord`] via [`normalize`]. The
//! normalizer is deliberately tolerant: upstream payloads evolve, and a
//! missing or oddly-typed field must never drop a message that still has
//! an identifier. The full payload is always carried through verbatim in
//! `raw` so nothing the upstream sent is lost.
//!
//! The only hard requirement is the message id itself - it is the
//! deduplication key, so a payload without a string `id` is rejected.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::now_ms;

/// Which ingestion path observed a message first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Delivered by the gateway stream.
    Live,
    /// Fetched by a historical backfill worker.
    Backfill,
}

/// A single ingested message, as stored in the `messages` collection.
///
/// Records are append-only: the unique index on `message_id` makes the
/// second writer a no-op, whichever path it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Upstream message id; globally unique, the dedup key.
    pub message_id: String,
    pub channel_id: Option<String>,
    /// Absent for direct-message contexts.
    pub guild_id: Option<String>,
    pub author_id: Option<String>,
    /// Upstream ISO-8601 timestamp, retained verbatim.
    pub timestamp: Option<String>,
    /// Parsed epoch-millisecond form of `timestamp`; 0 if parsing failed.
    pub timestamp_ms: i64,
    pub source: Source,
    /// The upstream payload, unmodified.
    pub raw: Value,
    /// Local wall clock at insertion, epoch milliseconds.
    pub ingested_at: i64,
}

/// Author identity extracted alongside a message, used to maintain the
/// `users` projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorIdentity {
    pub user_id: String,
    pub username: Option<String>,
    pub global_name: Option<String>,
}

/// A normalized message plus the author identity observed with it.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub record: MessageRecord,
    pub author: Option<AuthorIdentity>,
}

/// Normalize a raw upstream message payload into a [`MessageRecord`].
///
/// Returns `None` when the payload has no string `id`; every other field
/// is read tolerantly (absent or wrongly-typed values become null).
pub fn normalize(payload: &Value, source: Source) -> Option<NormalizedMessage> {
    let message_id = payload.get("id")?.as_str()?.to_string();

    let timestamp = str_field(payload, "timestamp");
    let timestamp_ms = timestamp
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0);

    let author = payload.get("author").and_then(|a| {
        let user_id = a.get("id")?.as_str()?.to_string();
        Some(AuthorIdentity {
            user_id,
            username: str_field(a, "username"),
            global_name: str_field(a, "global_name"),
        })
    });

    let record = MessageRecord {
        message_id,
        channel_id: str_field(payload, "channel_id"),
        guild_id: str_field(payload, "guild_id"),
        author_id: author.as_ref().map(|a| a.user_id.clone()),
        timestamp,
        timestamp_ms,
        source,
        raw: payload.clone(),
        ingested_at: now_ms(),
    };

    Some(NormalizedMessage { record, author })
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
