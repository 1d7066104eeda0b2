//! Daemon configuration loaded from environment variables.

use crate::{Error, Result};

/// Ingestion daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bot token; sent as `Authorization: Bot {token}`.
    pub token: String,

    /// REST base URL, e.g. "https://discord.com/api/v10".
    pub api_base: String,

    /// Gateway WebSocket endpoint.
    pub gateway_url: String,

    /// Guilds to index. Empty means discover via the API.
    pub guild_ids: Vec<String>,

    /// Gateway intents bitmask.
    pub intents: u64,

    /// Document store connection URI.
    pub mongodb_uri: String,

    /// Document store database name.
    pub mongodb_db: String,

    /// Messages per backfill page, clamped to [1, 100].
    pub backfill_page_size: u32,

    /// Number of concurrent backfill workers.
    pub backfill_workers: usize,

    /// Inter-page sleep when no header-driven delay applies.
    pub backfill_request_delay_ms: u64,

    /// Prometheus `/metrics` port; 0 disables the endpoint.
    pub metrics_port: u16,

    /// Claims older than this are released by the stale-claim sweep.
    pub stale_claim_minutes: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `DISCORD_BOT_TOKEN` is required; everything else has a default.
    /// An unparseable numeric variable is a fatal configuration error -
    /// the process must abort before any connection is opened.
    ///
    /// Optional env vars:
    /// - `DISCORD_API_BASE`: REST base URL (default: "https://discord.com/api/v10")
    /// - `DISCORD_GATEWAY_URL`: WebSocket endpoint (default: "wss://gateway.discord.gg/?v=10&encoding=json")
    /// - `DISCORD_GUILD_IDS`: CSV of guild ids; empty means discover via API
    /// - `DISCORD_INTENTS`: intents bitmask (default: 4609)
    /// - `MONGODB_URI`: store URI (default: "mongodb://localhost:27017")
    /// - `MONGODB_DB`: store database (default: "discord_index")
    /// - `INDEXER_BACKFILL_PAGE_SIZE`: page size, clamped to [1,100] (default: 100)
    /// - `INDEXER_BACKFILL_WORKERS`: worker count (default: 2)
    /// - `INDEXER_BACKFILL_REQUEST_DELAY_MS`: inter-page sleep (default: 500)
    /// - `INDEXER_METRICS_PORT`: metrics port, 0 disables (default: 9090)
    /// - `INDEXER_STALE_CLAIM_MINUTES`: stale-claim threshold (default: 10)
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("DISCORD_BOT_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Config("DISCORD_BOT_TOKEN is required".to_string()))?;

        let api_base = std::env::var("DISCORD_API_BASE")
            .unwrap_or_else(|_| "https://discord.com/api/v10".to_string())
            .trim_end_matches('/')
            .to_string();

        let gateway_url = std::env::var("DISCORD_GATEWAY_URL")
            .unwrap_or_else(|_| "wss://gateway.discord.gg/?v=10&encoding=json".to_string());

        let guild_ids: Vec<String> = std::env::var("DISCORD_GUILD_IDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let intents = parse_env("DISCORD_INTENTS", 4609u64)?;

        let mongodb_uri = std::env::var("MONGODB_URI")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());

        let mongodb_db =
            std::env::var("MONGODB_DB").unwrap_or_else(|_| "discord_index".to_string());

        let backfill_page_size = parse_env("INDEXER_BACKFILL_PAGE_SIZE", 100u32)?.clamp(1, 100);
        let backfill_workers = parse_env("INDEXER_BACKFILL_WORKERS", 2usize)?;
        let backfill_request_delay_ms = parse_env("INDEXER_BACKFILL_REQUEST_DELAY_MS", 500u64)?;
        let metrics_port = parse_env("INDEXER_METRICS_PORT", 9090u16)?;
        let stale_claim_minutes = parse_env("INDEXER_STALE_CLAIM_MINUTES", 10u64)?;

        tracing::info!(
            api_base = %api_base,
            gateway_url = %gateway_url,
            mongodb_db = %mongodb_db,
            configured_guilds = guild_ids.len(),
            backfill_page_size,
            backfill_workers,
            backfill_request_delay_ms,
            "indexer configuration loaded"
        );

        Ok(Self {
            token,
            api_base,
            gateway_url,
            guild_ids,
            intents,
            mongodb_uri,
            mongodb_db,
            backfill_page_size,
            backfill_workers,
            backfill_request_delay_ms,
            metrics_port,
            stale_claim_minutes,
        })
    }
}

/// Parse a numeric env var, falling back to `default` when unset.
///
/// A present-but-unparseable value is a configuration error, not a default.
fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} is not a valid number: {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}
