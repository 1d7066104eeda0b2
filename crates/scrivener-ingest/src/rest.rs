//! REST client for the upstream HTTP API.
//!
//! One `reqwest` client is shared by every component; all requests funnel
//! through the [`RateLimiter`] so the per-bucket serialization and cooldown
//! rules hold process-wide. Responses come back fully buffered as
//! [`ApiResponse`] - status, body, and the rate-limit observation - so
//! callers can make their own retry decisions (the coordinator never
//! retries on its own).

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::ratelimit::{Observation, RateLimiter};
use crate::{Error, Result};

/// Route key for the message-page endpoint shape.
pub const MESSAGES_ROUTE: &str = "GET:/channels/:channelId/messages";

/// Route key for the guild-channels endpoint shape.
pub const CHANNELS_ROUTE: &str = "GET:/guilds/:guildId/channels";

/// Route key for the own-guilds listing.
pub const GUILDS_ROUTE: &str = "GET:/users/@me/guilds";

/// Upstream guild-list page size; a shorter page terminates pagination.
const GUILD_PAGE_LIMIT: usize = 200;

/// Text channel type.
const CHANNEL_TYPE_TEXT: i64 = 0;
/// Announcement channel type.
const CHANNEL_TYPE_ANNOUNCEMENT: i64 = 5;

/// A guild as returned by the own-guilds listing.
#[derive(Debug, Clone, Deserialize)]
pub struct Guild {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A channel as returned by the guild-channels listing.
#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: i64,
    #[serde(default)]
    pub name: Option<String>,
}

impl Channel {
    /// Whether this channel carries an indexable message history
    /// (text or announcement).
    pub fn is_indexable(&self) -> bool {
        matches!(self.kind, CHANNEL_TYPE_TEXT | CHANNEL_TYPE_ANNOUNCEMENT)
    }
}

/// A fully-buffered upstream response.
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
    observation: Observation,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// Retry interval reported by a 429 (header delta, else body
    /// `retry_after`, else the 1000 ms default; floored at 250 ms).
    pub fn retry_after_ms(&self) -> i64 {
        self.observation.retry_after_ms()
    }

    /// Reset-after delay to honor when the bucket reports itself
    /// exhausted (`X-RateLimit-Remaining <= 0`).
    pub fn exhausted_delay_ms(&self) -> Option<i64> {
        if self.observation.remaining.is_some_and(|r| r <= 0) {
            self.observation.reset_after_ms
        } else {
            None
        }
    }
}

/// Shared HTTP client with authorization and rate-limit coordination.
pub struct RestClient {
    http: reqwest::Client,
    base: String,
    limiter: RateLimiter,
}

impl RestClient {
    /// Build the shared client with the bot authorization header and a
    /// bounded per-request timeout (a stalled response must not hold a
    /// bucket gate forever).
    pub fn new(token: &str, api_base: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bot {}", token))
            .map_err(|e| Error::Config(format!("token is not a valid header value: {e}")))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(
                "DiscordBot (https://github.com/scrivener-archive/scrivener, 0.1.0)",
            ),
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base: api_base.trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(),
        })
    }

    /// Issue one GET through the rate-limit coordinator.
    ///
    /// The body is read and the response observed while the bucket gate is
    /// still held; the gate is released before returning. 429s are returned
    /// to the caller, not retried.
    pub async fn get(&self, path_and_query: &str, route_key: &str) -> Result<ApiResponse> {
        let permit = self.limiter.acquire(route_key).await;

        let url = format!("{}{}", self.base, path_and_query);
        let response = self.http.get(&url).send().await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        let observation = Observation::from_response(status, &headers, &body);
        self.limiter.observe(route_key, &permit, &observation);
        drop(permit);

        Ok(ApiResponse {
            status,
            body,
            observation,
        })
    }

    /// List every guild the bot can see, following `after` pagination
    /// until a short or empty page.
    pub async fn list_guilds(&self) -> Result<Vec<Guild>> {
        let mut guilds: Vec<Guild> = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let path = match &after {
                Some(id) => format!("/users/@me/guilds?limit={}&after={}", GUILD_PAGE_LIMIT, id),
                None => format!("/users/@me/guilds?limit={}", GUILD_PAGE_LIMIT),
            };
            let response = self.get(&path, GUILDS_ROUTE).await?;
            if !response.is_success() {
                return Err(Error::Api {
                    status: response.status,
                    what: "guild listing".to_string(),
                });
            }

            let page: Vec<Guild> = response.json()?;
            let page_len = page.len();
            after = page.last().map(|g| g.id.clone());
            guilds.extend(page);

            if page_len < GUILD_PAGE_LIMIT {
                return Ok(guilds);
            }
        }
    }

    /// List a guild's channels. Entries that do not match the expected
    /// shape are ignored rather than failing the listing.
    pub async fn list_channels(&self, guild_id: &str) -> Result<Vec<Channel>> {
        let path = format!("/guilds/{}/channels", guild_id);
        let response = self.get(&path, CHANNELS_ROUTE).await?;
        if !response.is_success() {
            return Err(Error::Api {
                status: response.status,
                what: format!("channel listing for guild {}", guild_id),
            });
        }

        let raw: Vec<Value> = response.json()?;
        Ok(raw
            .into_iter()
            .filter_map(|v| serde_json::from_value::<Channel>(v).ok())
            .collect())
    }

    /// Fetch one page of a channel's message history, newest first,
    /// optionally bounded above by an exclusive `before` id.
    pub async fn message_page(
        &self,
        channel_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<ApiResponse> {
        let path = match before {
            Some(cursor) => format!(
                "/channels/{}/messages?limit={}&before={}",
                channel_id, limit, cursor
            ),
            None => format!("/channels/{}/messages?limit={}", channel_id, limit),
        };
        self.get(&path, MESSAGES_ROUTE).await
    }
}
