//! Document-store adapter.
//!
//! The store is the single convergence point for both ingestion paths:
//! the unique index on `messages.message_id` makes the second writer of
//! any message a silent no-op, whichever path got there first. Backfill
//! progress lives in `channel_backfill` (one record per channel, claimed
//! atomically by workers), and `users` holds the latest observed identity
//! per author.
//!
//! [`Store`] is the seam: the daemon runs against [`MongoStore`], tests
//! run the same scheduler and ingestion code against [`MemoryStore`].

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use scrivener_core::{normalize, now_ms, MessageRecord, Source};

use crate::Result;

/// Per-channel backfill state, as stored in `channel_backfill`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBackfill {
    pub channel_id: String,
    pub guild_id: String,
    /// Exclusive upper bound for the next page; None until the first page.
    pub cursor_before: Option<String>,
    /// Terminal flag: once true the channel is never re-scanned.
    pub done: bool,
    /// Soft lease: set while a worker is actively processing.
    pub claimed: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub error_count: i64,
}

/// A claimed channel handed to a backfill worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillClaim {
    pub channel_id: String,
    pub guild_id: String,
    pub cursor_before: Option<String>,
}

/// Operations both ingestion paths need from the document store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create the index set if absent. Idempotent.
    async fn ensure_indexes(&self) -> Result<()>;

    /// Insert a message record. Returns `true` if newly inserted, `false`
    /// when the unique index dropped it as a duplicate. Other write errors
    /// propagate.
    async fn insert_message(&self, record: &MessageRecord) -> Result<bool>;

    /// Best-effort upsert of the latest observed identity for a user.
    /// Errors are logged and swallowed.
    async fn upsert_user(
        &self,
        user_id: &str,
        username: Option<&str>,
        global_name: Option<&str>,
        last_seen_ms: i64,
    );

    /// Seed backfill state for a channel. Returns `true` if newly seeded,
    /// `false` when the channel was already known.
    async fn seed_backfill(&self, channel_id: &str, guild_id: &str) -> Result<bool>;

    /// Atomically claim one unfinished, unclaimed channel (oldest
    /// `updated_at` first). Returns the post-claim image, or `None` when
    /// no candidate exists.
    async fn claim_next_channel(&self) -> Result<Option<BackfillClaim>>;

    /// Release a claim, recording the new cursor, terminal flag, and any
    /// error increment.
    async fn update_channel_state(
        &self,
        channel_id: &str,
        cursor_before: Option<&str>,
        done: bool,
        error_delta: i64,
    ) -> Result<()>;

    /// Release claims whose `updated_at` is older than `older_than_ms`.
    /// Recovers channels orphaned by a crashed worker. Returns the number
    /// of claims released.
    async fn recover_stale_claims(&self, older_than_ms: i64) -> Result<u64>;
}

/// Result of offering one raw payload to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestResult {
    /// Newly inserted.
    Inserted,
    /// Dropped by the unique index; some path got there first.
    Duplicate,
    /// Rejected by the normalizer (no usable message id).
    Skipped,
}

/// Normalize a raw payload and write it through the store: the message
/// record (idempotently) plus the author's user projection. This is the
/// single ingestion path shared by the gateway stream and backfill.
pub async fn ingest_payload(
    store: &dyn Store,
    payload: &serde_json::Value,
    source: Source,
) -> Result<IngestResult> {
    let Some(normalized) = normalize(payload, source) else {
        return Ok(IngestResult::Skipped);
    };

    let inserted = store.insert_message(&normalized.record).await?;

    // The projection is refreshed on every attempt, duplicates included;
    // last_seen_ms carries the message timestamp, not the ingest time.
    if let Some(author) = &normalized.author {
        metrics::counter!("users_projected_total").increment(1);
        store
            .upsert_user(
                &author.user_id,
                author.username.as_deref(),
                author.global_name.as_deref(),
                normalized.record.timestamp_ms,
            )
            .await;
    }

    Ok(if inserted {
        IngestResult::Inserted
    } else {
        IngestResult::Duplicate
    })
}

// =============================================================================
// MongoDB implementation
// =============================================================================

/// MongoDB-backed store.
pub struct MongoStore {
    messages: Collection<MessageRecord>,
    users: Collection<Document>,
    backfill: Collection<ChannelBackfill>,
}

impl MongoStore {
    /// Connect to the store and bind the three collections.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(db_name);
        tracing::info!(db = %db_name, "store connected");

        Ok(Self {
            messages: db.collection("messages"),
            users: db.collection("users"),
            backfill: db.collection("channel_backfill"),
        })
    }
}

/// Whether an error is the duplicate-key signal from a unique index.
fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref we)) if we.code == 11000
    )
}

fn unique_index(keys: Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).build())
        .build()
}

fn index(keys: Document) -> IndexModel {
    IndexModel::builder().keys(keys).build()
}

#[async_trait]
impl Store for MongoStore {
    async fn ensure_indexes(&self) -> Result<()> {
        self.messages
            .create_index(unique_index(doc! { "message_id": 1 }))
            .await?;
        self.messages
            .create_index(index(doc! { "channel_id": 1, "timestamp_ms": -1 }))
            .await?;
        self.messages
            .create_index(index(doc! { "author_id": 1, "timestamp_ms": -1 }))
            .await?;

        self.backfill
            .create_index(unique_index(doc! { "channel_id": 1 }))
            .await?;
        self.backfill
            .create_index(index(doc! { "done": 1, "updated_at": 1 }))
            .await?;

        self.users
            .create_index(unique_index(doc! { "user_id": 1 }))
            .await?;
        self.users
            .create_index(index(doc! { "last_seen_ms": -1 }))
            .await?;

        tracing::info!("store indexes ensured");
        Ok(())
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<bool> {
        match self.messages.insert_one(record).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_user(
        &self,
        user_id: &str,
        username: Option<&str>,
        global_name: Option<&str>,
        last_seen_ms: i64,
    ) {
        let update = doc! {
            "$set": {
                "user_id": user_id,
                "username": username.map(Bson::from).unwrap_or(Bson::Null),
                "global_name": global_name.map(Bson::from).unwrap_or(Bson::Null),
                "last_seen_ms": last_seen_ms,
                "updated_at": now_ms(),
            }
        };
        let result = self
            .users
            .update_one(doc! { "user_id": user_id }, update)
            .upsert(true)
            .await;
        if let Err(e) = result {
            tracing::warn!(user_id = %user_id, "user projection upsert failed: {}", e);
        }
    }

    async fn seed_backfill(&self, channel_id: &str, guild_id: &str) -> Result<bool> {
        let now = now_ms();
        let state = ChannelBackfill {
            channel_id: channel_id.to_string(),
            guild_id: guild_id.to_string(),
            cursor_before: None,
            done: false,
            claimed: false,
            created_at: now,
            updated_at: now,
            error_count: 0,
        };
        match self.backfill.insert_one(&state).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_next_channel(&self) -> Result<Option<BackfillClaim>> {
        let claimed = self
            .backfill
            .find_one_and_update(
                doc! { "done": false, "claimed": { "$ne": true } },
                doc! { "$set": { "claimed": true, "updated_at": now_ms() } },
            )
            .sort(doc! { "updated_at": 1 })
            .return_document(ReturnDocument::After)
            .await?;

        Ok(claimed.map(|state| BackfillClaim {
            channel_id: state.channel_id,
            guild_id: state.guild_id,
            cursor_before: state.cursor_before,
        }))
    }

    async fn update_channel_state(
        &self,
        channel_id: &str,
        cursor_before: Option<&str>,
        done: bool,
        error_delta: i64,
    ) -> Result<()> {
        let mut update = doc! {
            "$set": {
                "cursor_before": cursor_before.map(Bson::from).unwrap_or(Bson::Null),
                "done": done,
                "claimed": false,
                "updated_at": now_ms(),
            }
        };
        if error_delta > 0 {
            update.insert("$inc", doc! { "error_count": error_delta });
        }
        self.backfill
            .update_one(doc! { "channel_id": channel_id }, update)
            .await?;
        Ok(())
    }

    async fn recover_stale_claims(&self, older_than_ms: i64) -> Result<u64> {
        let result = self
            .backfill
            .update_many(
                doc! { "claimed": true, "updated_at": { "$lt": older_than_ms } },
                doc! { "$set": { "claimed": false, "updated_at": now_ms() } },
            )
            .await?;
        if result.modified_count > 0 {
            tracing::warn!(
                recovered = result.modified_count,
                "released stale backfill claims"
            );
        }
        Ok(result.modified_count)
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Debug, Clone)]
struct UserEntry {
    username: Option<String>,
    global_name: Option<String>,
    last_seen_ms: i64,
    updated_at: i64,
}

#[derive(Default)]
struct MemoryInner {
    messages: HashMap<String, MessageRecord>,
    users: HashMap<String, UserEntry>,
    backfill: HashMap<String, ChannelBackfill>,
    /// Monotonic tick standing in for `updated_at` ordering; wall-clock
    /// granularity is too coarse to order claims deterministically.
    tick: i64,
}

/// In-memory store with the same observable semantics as [`MongoStore`].
/// Used by the test suite and handy for local dry runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: parking_lot::Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(&self, message_id: &str) -> Option<MessageRecord> {
        self.inner.lock().messages.get(message_id).cloned()
    }

    pub fn message_count(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn channel_state(&self, channel_id: &str) -> Option<ChannelBackfill> {
        self.inner.lock().backfill.get(channel_id).cloned()
    }

    pub fn claimed_count(&self) -> usize {
        self.inner.lock().backfill.values().filter(|c| c.claimed).count()
    }

    pub fn user_last_seen_ms(&self, user_id: &str) -> Option<i64> {
        self.inner.lock().users.get(user_id).map(|u| u.last_seen_ms)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ensure_indexes(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.messages.contains_key(&record.message_id) {
            return Ok(false);
        }
        inner
            .messages
            .insert(record.message_id.clone(), record.clone());
        Ok(true)
    }

    async fn upsert_user(
        &self,
        user_id: &str,
        username: Option<&str>,
        global_name: Option<&str>,
        last_seen_ms: i64,
    ) {
        let mut inner = self.inner.lock();
        inner.users.insert(
            user_id.to_string(),
            UserEntry {
                username: username.map(str::to_string),
                global_name: global_name.map(str::to_string),
                last_seen_ms,
                updated_at: now_ms(),
            },
        );
    }

    async fn seed_backfill(&self, channel_id: &str, guild_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.backfill.contains_key(channel_id) {
            return Ok(false);
        }
        inner.tick += 1;
        let tick = inner.tick;
        inner.backfill.insert(
            channel_id.to_string(),
            ChannelBackfill {
                channel_id: channel_id.to_string(),
                guild_id: guild_id.to_string(),
                cursor_before: None,
                done: false,
                claimed: false,
                created_at: tick,
                updated_at: tick,
                error_count: 0,
            },
        );
        Ok(true)
    }

    async fn claim_next_channel(&self) -> Result<Option<BackfillClaim>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        let candidate = inner
            .backfill
            .values()
            .filter(|c| !c.done && !c.claimed)
            .min_by_key(|c| (c.updated_at, c.channel_id.clone()))
            .map(|c| c.channel_id.clone());

        let Some(channel_id) = candidate else {
            return Ok(None);
        };
        let state = inner
            .backfill
            .get_mut(&channel_id)
            .expect("candidate exists");
        state.claimed = true;
        state.updated_at = tick;

        Ok(Some(BackfillClaim {
            channel_id: state.channel_id.clone(),
            guild_id: state.guild_id.clone(),
            cursor_before: state.cursor_before.clone(),
        }))
    }

    async fn update_channel_state(
        &self,
        channel_id: &str,
        cursor_before: Option<&str>,
        done: bool,
        error_delta: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(state) = inner.backfill.get_mut(channel_id) {
            state.cursor_before = cursor_before.map(str::to_string);
            state.done = done;
            state.claimed = false;
            state.updated_at = tick;
            if error_delta > 0 {
                state.error_count += error_delta;
            }
        }
        Ok(())
    }

    async fn recover_stale_claims(&self, older_than_ms: i64) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let mut recovered = 0;
        for state in inner.backfill.values_mut() {
            if state.claimed && state.updated_at < older_than_ms {
                state.claimed = false;
                state.updated_at = tick;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
