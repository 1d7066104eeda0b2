//! Rate-limit coordinator for the upstream REST API.
//!
//! The upstream partitions its quota into *buckets* and reveals the
//! partition only through response headers. Until the first response for an
//! endpoint shape arrives, all calls sharing a route key (the endpoint
//! template with path parameters elided, e.g.
//! `"GET:/channels/:channelId/messages"`) share a provisional bucket keyed
//! by the route itself. The first `X-RateLimit-Bucket` sighting re-keys that
//! bucket object under the server's bucket id, and every later acquisition
//! resolves through the alias to the canonical bucket.
//!
//! # Concurrency
//!
//! Each bucket carries a capacity-1 async gate: strictly one request per
//! bucket is in flight, and the response is observed before the gate is
//! released. The bucket map is guarded by a `parking_lot` mutex that is
//! never held across an await; cooldown deadlines are atomic
//! epoch-millisecond values updated with `fetch_max`, so the global wait is
//! a plain polling sleep with no lock at all.
//!
//! The coordinator never retries. A 429 updates cooldown state and is
//! returned to the caller, which owns the retry decision.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use scrivener_core::now_ms;

/// Minimum cooldown applied after any rate-limit signal.
const MIN_RETRY_MS: i64 = 250;

/// Cooldown assumed for a 429 that carries no retry interval at all.
const DEFAULT_RETRY_MS: i64 = 1000;

/// One rate-limit partition: a capacity-1 gate plus its cooldown deadline.
pub struct Bucket {
    gate: Arc<tokio::sync::Mutex<()>>,
    next_allowed_ms: AtomicI64,
}

impl Bucket {
    fn new() -> Self {
        Self {
            gate: Arc::new(tokio::sync::Mutex::new(())),
            next_allowed_ms: AtomicI64::new(0),
        }
    }

    /// The epoch-ms deadline before which this bucket must not send.
    pub fn next_allowed_ms(&self) -> i64 {
        self.next_allowed_ms.load(Ordering::SeqCst)
    }
}

/// Exclusive right to send one request on a bucket.
///
/// Dropping the permit releases the gate. The response must be observed
/// (via [`RateLimiter::observe`]) while the permit is still held.
pub struct RoutePermit {
    bucket: Arc<Bucket>,
    _gate: tokio::sync::OwnedMutexGuard<()>,
}

struct Table {
    /// Learned `route_key -> bucket_id` aliases.
    route_to_bucket: HashMap<String, String>,
    /// Buckets keyed by server bucket id, or by route key while provisional.
    buckets: HashMap<String, Arc<Bucket>>,
}

/// Serializes HTTP requests per upstream bucket and enforces cooldowns.
pub struct RateLimiter {
    table: Mutex<Table>,
    global_next_allowed_ms: AtomicI64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                route_to_bucket: HashMap::new(),
                buckets: HashMap::new(),
            }),
            global_next_allowed_ms: AtomicI64::new(0),
        }
    }

    /// Acquire the right to send one request on `route_key`.
    ///
    /// Waits out the global cooldown, resolves the route to its bucket,
    /// takes the bucket's gate, then waits out the bucket's own cooldown.
    pub async fn acquire(&self, route_key: &str) -> RoutePermit {
        wait_until(&self.global_next_allowed_ms).await;

        let bucket = self.bucket_for(route_key);
        let gate = Arc::clone(&bucket.gate).lock_owned().await;

        wait_until(&bucket.next_allowed_ms).await;

        RoutePermit {
            bucket,
            _gate: gate,
        }
    }

    /// Observe a response while its permit is still held.
    ///
    /// Returns the cooldown applied to the bucket, if any, so the caller
    /// can schedule its own retry sleep.
    pub fn observe(&self, route_key: &str, permit: &RoutePermit, obs: &Observation) -> Option<i64> {
        self.observe_at(route_key, permit, obs, now_ms())
    }

    fn observe_at(
        &self,
        route_key: &str,
        permit: &RoutePermit,
        obs: &Observation,
        now: i64,
    ) -> Option<i64> {
        // Canonicalize: the first sighting of a bucket id re-keys the held
        // (route-keyed) bucket object; later acquisitions resolve the alias.
        // When the id was already canonicalized through another route,
        // cooldowns must land on that canonical object, not the held
        // provisional one.
        let bucket = match &obs.bucket {
            Some(bucket_id) => {
                let mut table = self.table.lock();
                table
                    .route_to_bucket
                    .insert(route_key.to_string(), bucket_id.clone());
                if !table.buckets.contains_key(bucket_id) {
                    table
                        .buckets
                        .insert(bucket_id.clone(), Arc::clone(&permit.bucket));
                }
                if bucket_id != route_key {
                    table.buckets.remove(route_key);
                }
                gauge!("ratelimit_buckets").set(table.buckets.len() as f64);
                Arc::clone(&table.buckets[bucket_id])
            }
            None => Arc::clone(&permit.bucket),
        };

        if obs.status == 429 {
            let retry_ms = obs.retry_after_ms();
            counter!("ratelimit_429_total").increment(1);
            if obs.body_global {
                counter!("ratelimit_global_cooldowns_total").increment(1);
                self.global_next_allowed_ms
                    .fetch_max(now + retry_ms, Ordering::SeqCst);
            }
            bucket
                .next_allowed_ms
                .fetch_max(now + retry_ms, Ordering::SeqCst);
            return Some(retry_ms);
        }

        if obs.remaining.is_some_and(|r| r <= 0) {
            if let Some(reset_after_ms) = obs.reset_after_ms {
                let cooldown = reset_after_ms.max(MIN_RETRY_MS);
                bucket
                    .next_allowed_ms
                    .fetch_max(now + cooldown, Ordering::SeqCst);
                if obs.global_header {
                    self.global_next_allowed_ms
                        .fetch_max(now + cooldown, Ordering::SeqCst);
                }
                return Some(cooldown);
            }
        }

        None
    }

    /// Resolve `route_key` to its bucket, creating a provisional
    /// route-keyed bucket when nothing is known yet.
    fn bucket_for(&self, route_key: &str) -> Arc<Bucket> {
        let mut table = self.table.lock();
        let key = table
            .route_to_bucket
            .get(route_key)
            .cloned()
            .unwrap_or_else(|| route_key.to_string());
        if let Some(bucket) = table.buckets.get(&key) {
            return Arc::clone(bucket);
        }
        let bucket = Arc::new(Bucket::new());
        table.buckets.insert(key, Arc::clone(&bucket));
        gauge!("ratelimit_buckets").set(table.buckets.len() as f64);
        bucket
    }

    /// The epoch-ms deadline of the process-wide cooldown.
    pub fn global_next_allowed_ms(&self) -> i64 {
        self.global_next_allowed_ms.load(Ordering::SeqCst)
    }
}

/// Sleep until the atomic epoch-ms deadline has passed.
///
/// Re-checks after each sleep: the deadline may have been pushed out by a
/// concurrent observation.
async fn wait_until(deadline: &AtomicI64) {
    loop {
        let wait = deadline.load(Ordering::SeqCst) - now_ms();
        if wait <= 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(wait as u64)).await;
    }
}

/// Rate-limit-relevant facts extracted from one response.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub status: u16,
    /// `X-RateLimit-Bucket`.
    pub bucket: Option<String>,
    /// `Retry-After` delta, milliseconds.
    pub retry_after_header_ms: Option<i64>,
    /// `X-RateLimit-Remaining`.
    pub remaining: Option<i64>,
    /// `X-RateLimit-Reset-After`, milliseconds (rounded up).
    pub reset_after_ms: Option<i64>,
    /// `X-RateLimit-Global` header present.
    pub global_header: bool,
    /// `retry_after` field of a 429 JSON body, milliseconds.
    pub body_retry_after_ms: Option<i64>,
    /// `global: true` field of a 429 JSON body.
    pub body_global: bool,
}

impl Observation {
    /// Extract the observation from response parts.
    ///
    /// The body is only consulted on 429, where it may carry `retry_after`
    /// seconds and the `global` flag.
    pub fn from_response(status: u16, headers: &HeaderMap, body: &[u8]) -> Self {
        let retry_after_header_ms = header_str(headers, "Retry-After")
            .and_then(|v| v.parse::<f64>().ok())
            .map(seconds_to_ms);

        let remaining =
            header_str(headers, "X-RateLimit-Remaining").and_then(|v| v.parse::<i64>().ok());

        let reset_after_ms = header_str(headers, "X-RateLimit-Reset-After")
            .and_then(|v| v.parse::<f64>().ok())
            .map(seconds_to_ms);

        let bucket = header_str(headers, "X-RateLimit-Bucket").map(str::to_string);
        let global_header = headers.contains_key("X-RateLimit-Global");

        let (body_retry_after_ms, body_global) = if status == 429 {
            match serde_json::from_slice::<serde_json::Value>(body) {
                Ok(v) => (
                    v.get("retry_after").and_then(|r| r.as_f64()).map(seconds_to_ms),
                    v.get("global").and_then(|g| g.as_bool()).unwrap_or(false),
                ),
                Err(_) => (None, false),
            }
        } else {
            (None, false)
        };

        Self {
            status,
            bucket,
            retry_after_header_ms,
            remaining,
            reset_after_ms,
            global_header,
            body_retry_after_ms,
            body_global,
        }
    }

    /// Retry interval for a 429: header delta, else body `retry_after`,
    /// else 1000 ms; never below 250 ms.
    pub fn retry_after_ms(&self) -> i64 {
        self.retry_after_header_ms
            .or(self.body_retry_after_ms)
            .unwrap_or(DEFAULT_RETRY_MS)
            .max(MIN_RETRY_MS)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn seconds_to_ms(seconds: f64) -> i64 {
    (seconds * 1000.0).ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                k.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn retry_interval_prefers_header_over_body() {
        let obs = Observation {
            status: 429,
            retry_after_header_ms: Some(3000),
            body_retry_after_ms: Some(1500),
            ..Default::default()
        };
        assert_eq!(obs.retry_after_ms(), 3000);
    }

    #[test]
    fn retry_interval_falls_back_to_body_then_default() {
        let obs = Observation {
            status: 429,
            body_retry_after_ms: Some(1500),
            ..Default::default()
        };
        assert_eq!(obs.retry_after_ms(), 1500);

        let obs = Observation {
            status: 429,
            ..Default::default()
        };
        assert_eq!(obs.retry_after_ms(), 1000);
    }

    #[test]
    fn retry_interval_is_floored() {
        let obs = Observation {
            status: 429,
            body_retry_after_ms: Some(10),
            ..Default::default()
        };
        assert_eq!(obs.retry_after_ms(), 250);
    }

    #[test]
    fn observation_parses_429_body() {
        let obs = Observation::from_response(
            429,
            &headers(&[("X-RateLimit-Bucket", "abcd")]),
            br#"{"message":"You are being rate limited.","retry_after":1.5,"global":true}"#,
        );
        assert_eq!(obs.bucket.as_deref(), Some("abcd"));
        assert_eq!(obs.body_retry_after_ms, Some(1500));
        assert!(obs.body_global);
        assert_eq!(obs.retry_after_ms(), 1500);
    }

    #[test]
    fn observation_rounds_reset_after_up() {
        let obs = Observation::from_response(
            200,
            &headers(&[
                ("X-RateLimit-Remaining", "0"),
                ("X-RateLimit-Reset-After", "0.4231"),
            ]),
            b"[]",
        );
        assert_eq!(obs.remaining, Some(0));
        assert_eq!(obs.reset_after_ms, Some(424));
    }

    #[tokio::test]
    async fn provisional_bucket_is_rekeyed_to_canonical_id() {
        let limiter = RateLimiter::new();
        let route = "GET:/channels/:channelId/messages";

        let permit = limiter.acquire(route).await;
        let provisional = Arc::clone(&permit.bucket);

        let obs = Observation {
            status: 200,
            bucket: Some("srv-bucket-1".to_string()),
            ..Default::default()
        };
        limiter.observe_at(route, &permit, &obs, 1_000);
        drop(permit);

        // The same object now serves the canonical bucket id.
        let permit = limiter.acquire(route).await;
        assert!(Arc::ptr_eq(&provisional, &permit.bucket));

        {
            let table = limiter.table.lock();
            assert_eq!(
                table.route_to_bucket.get(route).map(String::as_str),
                Some("srv-bucket-1")
            );
            assert!(table.buckets.contains_key("srv-bucket-1"));
            assert!(!table.buckets.contains_key(route));
        }
    }

    #[tokio::test]
    async fn routes_sharing_a_bucket_id_converge() {
        let limiter = RateLimiter::new();

        let permit_a = limiter.acquire("GET:/guilds/:guildId/channels").await;
        let obs = Observation {
            status: 200,
            bucket: Some("shared".to_string()),
            ..Default::default()
        };
        limiter.observe_at("GET:/guilds/:guildId/channels", &permit_a, &obs, 0);
        let canonical = Arc::clone(&permit_a.bucket);
        drop(permit_a);

        let permit_b = limiter.acquire("GET:/users/@me/guilds").await;
        limiter.observe_at("GET:/users/@me/guilds", &permit_b, &obs, 0);
        drop(permit_b);

        let resolved = limiter.bucket_for("GET:/users/@me/guilds");
        assert!(Arc::ptr_eq(&canonical, &resolved));
    }

    #[tokio::test]
    async fn cooldown_lands_on_the_canonical_bucket() {
        let limiter = RateLimiter::new();

        // Route A canonicalizes the shared bucket first.
        let permit_a = limiter.acquire("GET:/users/@me/guilds").await;
        let obs_ok = Observation {
            status: 200,
            bucket: Some("shared".to_string()),
            ..Default::default()
        };
        limiter.observe_at("GET:/users/@me/guilds", &permit_a, &obs_ok, 0);
        let canonical = Arc::clone(&permit_a.bucket);
        drop(permit_a);

        // Route B still holds a provisional object when its 429 names the
        // same bucket id; the cooldown must land on the canonical object.
        let permit_b = limiter.acquire("GET:/guilds/:guildId/channels").await;
        assert!(!Arc::ptr_eq(&canonical, &permit_b.bucket));
        let obs_429 = Observation {
            status: 429,
            bucket: Some("shared".to_string()),
            body_retry_after_ms: Some(1000),
            ..Default::default()
        };
        limiter.observe_at("GET:/guilds/:guildId/channels", &permit_b, &obs_429, 4_000);
        drop(permit_b);

        assert_eq!(canonical.next_allowed_ms(), 5_000);
    }

    #[tokio::test]
    async fn rate_limited_bucket_gets_cooldown() {
        let limiter = RateLimiter::new();
        let route = "GET:/channels/:channelId/messages";
        let permit = limiter.acquire(route).await;

        let obs = Observation {
            status: 429,
            body_retry_after_ms: Some(1500),
            ..Default::default()
        };
        let applied = limiter.observe_at(route, &permit, &obs, 10_000);

        assert_eq!(applied, Some(1500));
        assert_eq!(permit.bucket.next_allowed_ms(), 11_500);
        // Not a global limit.
        assert_eq!(limiter.global_next_allowed_ms(), 0);
    }

    #[tokio::test]
    async fn global_429_raises_the_global_deadline() {
        let limiter = RateLimiter::new();
        let route = "GET:/users/@me/guilds";
        let permit = limiter.acquire(route).await;

        let obs = Observation {
            status: 429,
            body_retry_after_ms: Some(2000),
            body_global: true,
            ..Default::default()
        };
        limiter.observe_at(route, &permit, &obs, 5_000);

        assert_eq!(limiter.global_next_allowed_ms(), 7_000);
        assert_eq!(permit.bucket.next_allowed_ms(), 7_000);
    }

    #[tokio::test]
    async fn cooldowns_never_move_backwards() {
        let limiter = RateLimiter::new();
        let route = "GET:/channels/:channelId/messages";
        let permit = limiter.acquire(route).await;

        let long = Observation {
            status: 429,
            body_retry_after_ms: Some(5000),
            ..Default::default()
        };
        limiter.observe_at(route, &permit, &long, 1_000);

        let short = Observation {
            status: 429,
            body_retry_after_ms: Some(300),
            ..Default::default()
        };
        limiter.observe_at(route, &permit, &short, 1_000);

        assert_eq!(permit.bucket.next_allowed_ms(), 6_000);
    }

    #[tokio::test]
    async fn exhausted_bucket_cooldown_from_reset_after() {
        let limiter = RateLimiter::new();
        let route = "GET:/guilds/:guildId/channels";
        let permit = limiter.acquire(route).await;

        let obs = Observation {
            status: 200,
            remaining: Some(0),
            reset_after_ms: Some(120),
            ..Default::default()
        };
        let applied = limiter.observe_at(route, &permit, &obs, 2_000);

        // 120 ms is below the floor.
        assert_eq!(applied, Some(250));
        assert_eq!(permit.bucket.next_allowed_ms(), 2_250);
    }

    #[tokio::test]
    async fn successful_response_with_remaining_leaves_bucket_open() {
        let limiter = RateLimiter::new();
        let route = "GET:/channels/:channelId/messages";
        let permit = limiter.acquire(route).await;

        let obs = Observation {
            status: 200,
            remaining: Some(3),
            reset_after_ms: Some(900),
            ..Default::default()
        };
        assert_eq!(limiter.observe_at(route, &permit, &obs, 2_000), None);
        assert_eq!(permit.bucket.next_allowed_ms(), 0);
    }

    #[tokio::test]
    async fn gate_serializes_requests_per_bucket() {
        use std::sync::atomic::AtomicUsize;

        let limiter = Arc::new(RateLimiter::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let permit = limiter.acquire("GET:/channels/:channelId/messages").await;
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
