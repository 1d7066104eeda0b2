//! Shared helpers for the integration tests.
#![allow(dead_code)] // not every test binary uses every helper

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scrivener_ingest::{run_backfill_worker, BackfillSettings, MemoryStore, RestClient, Store};
use tokio::time::Instant;

/// REST client pointed at a mock server, with the usual bot auth header.
pub fn test_rest_client(base_url: &str) -> RestClient {
    RestClient::new("test-token", base_url).unwrap()
}

/// Worker settings with short delays so scenarios finish quickly.
pub fn fast_settings() -> BackfillSettings {
    BackfillSettings {
        page_size: 100,
        request_delay: Duration::from_millis(10),
        idle_delay: Duration::from_millis(50),
    }
}

/// Run `workers` backfill workers until the channel reaches `done=true`
/// (or the timeout passes), then stop them. Returns whether the channel
/// finished.
pub async fn run_workers_until_done(
    workers: usize,
    store: &Arc<MemoryStore>,
    rest: &Arc<RestClient>,
    settings: BackfillSettings,
    channel_id: &str,
    timeout: Duration,
) -> bool {
    let running = Arc::new(AtomicBool::new(true));
    let mut handles = Vec::new();
    for worker_id in 0..workers {
        handles.push(tokio::spawn(run_backfill_worker(
            worker_id,
            Arc::clone(store) as Arc<dyn Store>,
            Arc::clone(rest),
            settings.clone(),
            Arc::clone(&running),
        )));
    }

    let deadline = Instant::now() + timeout;
    let mut done = false;
    while Instant::now() < deadline {
        if store
            .channel_state(channel_id)
            .map(|c| c.done)
            .unwrap_or(false)
        {
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    running.store(false, Ordering::SeqCst);
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    done
}
