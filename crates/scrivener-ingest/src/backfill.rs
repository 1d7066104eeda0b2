//! Backfill workers: historical message retrieval, one channel at a time.
//!
//! Each worker repeatedly claims one channel's backfill state, fetches one
//! page of history through the rate-limit coordinator, and releases the
//! claim with an advanced cursor. Pages come back newest-first, so the last
//! element of a page is the oldest message and becomes the exclusive
//! `before` bound for the next page. An empty page is the only terminal
//! signal.
//!
//! A 429 is expected feedback, not an error: the claim is released with
//! the cursor unchanged and the worker sleeps out the retry interval the
//! response reported. Anything else non-2xx (or a 2xx body that is not a
//! message array) increments the channel's error count and leaves the
//! cursor untouched so the page is retried later.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::Value;

use scrivener_core::Source;

use crate::config::Config;
use crate::rest::RestClient;
use crate::store::{ingest_payload, IngestResult, Store};
use crate::Result;

/// Tunables for the backfill workers.
#[derive(Debug, Clone)]
pub struct BackfillSettings {
    /// Messages per page, already clamped to [1, 100].
    pub page_size: u32,
    /// Inter-page sleep when no header-driven delay applies.
    pub request_delay: Duration,
    /// Sleep between claim attempts when no channel is available.
    pub idle_delay: Duration,
}

impl BackfillSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_size: config.backfill_page_size,
            request_delay: Duration::from_millis(config.backfill_request_delay_ms),
            idle_delay: Duration::from_secs(2),
        }
    }
}

/// What one fetched page means for the owning channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// 429: release unchanged, count an error, sleep out `retry_ms`.
    RateLimited { retry_ms: i64 },
    /// Non-2xx, or a 2xx body that is not a message array.
    Failed { status: u16 },
    /// Empty page: the channel is fully backfilled.
    Complete,
    /// A page of messages and the id of its oldest element.
    Page {
        messages: Vec<Value>,
        next_cursor: String,
    },
}

/// Classify a page response. Pure; the worker loop applies the outcome.
pub fn classify_page(status: u16, body: &[u8], retry_after_ms: i64) -> PageOutcome {
    if status == 429 {
        return PageOutcome::RateLimited {
            retry_ms: retry_after_ms,
        };
    }
    if !(200..300).contains(&status) {
        return PageOutcome::Failed { status };
    }

    let messages: Vec<Value> = match serde_json::from_slice(body) {
        Ok(m) => m,
        Err(_) => return PageOutcome::Failed { status },
    };

    if messages.is_empty() {
        return PageOutcome::Complete;
    }

    // Newest-first order: the last element is the oldest of the page. A
    // page whose tail has no usable id cannot produce a cursor, so it is
    // retried like any other malformed response.
    let next_cursor = match messages.last().and_then(|m| m.get("id")).and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => return PageOutcome::Failed { status },
    };

    PageOutcome::Page {
        messages,
        next_cursor,
    }
}

/// Run one backfill worker until the shutdown flag flips.
pub async fn run_backfill_worker(
    worker_id: usize,
    store: Arc<dyn Store>,
    rest: Arc<RestClient>,
    settings: BackfillSettings,
    running: Arc<AtomicBool>,
) -> Result<()> {
    tracing::info!(worker = worker_id, "backfill worker started");

    while running.load(Ordering::SeqCst) {
        if let Err(e) = run_iteration(store.as_ref(), rest.as_ref(), &settings).await {
            // Store failures land here; log and back off rather than die.
            tracing::error!(worker = worker_id, "backfill iteration failed: {}", e);
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    tracing::info!(worker = worker_id, "backfill worker stopped");
    Ok(())
}

async fn run_iteration(
    store: &dyn Store,
    rest: &RestClient,
    settings: &BackfillSettings,
) -> Result<()> {
    let Some(claim) = store.claim_next_channel().await? else {
        tokio::time::sleep(settings.idle_delay).await;
        return Ok(());
    };

    let channel_id = claim.channel_id.as_str();
    let cursor = claim.cursor_before.as_deref();

    let response = match rest
        .message_page(channel_id, settings.page_size, cursor)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(channel = %channel_id, "message page fetch failed: {}", e);
            counter!("backfill_errors_total").increment(1);
            store.update_channel_state(channel_id, cursor, false, 1).await?;
            tokio::time::sleep(settings.request_delay).await;
            return Ok(());
        }
    };

    let exhausted_delay = response.exhausted_delay_ms();

    match classify_page(response.status, &response.body, response.retry_after_ms()) {
        PageOutcome::RateLimited { retry_ms } => {
            tracing::debug!(channel = %channel_id, retry_ms, "rate limited, backing off");
            store.update_channel_state(channel_id, cursor, false, 1).await?;
            tokio::time::sleep(Duration::from_millis(retry_ms.max(0) as u64)).await;
        }
        PageOutcome::Failed { status } => {
            tracing::warn!(channel = %channel_id, status, "page fetch failed upstream");
            counter!("backfill_errors_total").increment(1);
            store.update_channel_state(channel_id, cursor, false, 1).await?;
            tokio::time::sleep(settings.request_delay).await;
        }
        PageOutcome::Complete => {
            tracing::info!(channel = %channel_id, "channel fully backfilled");
            counter!("backfill_channels_done_total").increment(1);
            store.update_channel_state(channel_id, cursor, true, 0).await?;
            post_page_sleep(exhausted_delay, settings).await;
        }
        PageOutcome::Page {
            messages,
            next_cursor,
        } => {
            counter!("backfill_pages_total").increment(1);
            for payload in &messages {
                match ingest_payload(store, payload, Source::Backfill).await? {
                    IngestResult::Inserted => {
                        counter!("backfill_messages_inserted_total").increment(1)
                    }
                    IngestResult::Duplicate => {
                        counter!("backfill_messages_duplicate_total").increment(1)
                    }
                    IngestResult::Skipped => {}
                }
            }
            tracing::debug!(
                channel = %channel_id,
                page = messages.len(),
                cursor = %next_cursor,
                "page ingested"
            );
            store
                .update_channel_state(channel_id, Some(&next_cursor), false, 0)
                .await?;
            post_page_sleep(exhausted_delay, settings).await;
        }
    }

    Ok(())
}

/// Post-iteration pacing: honor an exhausted bucket's reset-after when the
/// response reported one, otherwise the configured inter-page delay.
async fn post_page_sleep(exhausted_delay_ms: Option<i64>, settings: &BackfillSettings) {
    match exhausted_delay_ms {
        Some(ms) if ms > 0 => tokio::time::sleep(Duration::from_millis(ms as u64)).await,
        _ => tokio::time::sleep(settings.request_delay).await,
    }
}
