use eyre::{eyre, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(clap::Parser, Debug)]
#[command(name = "herald-alertd", version, about = "Uthgard Herald alerting pipeline")]
pub struct Args {
    /// Upstream warmap page URL.
    #[arg(long, env = "HERALD_WARMAP_URL")]
    pub warmap_url: String,

    /// UA event/banner freshness window, in minutes.
    #[arg(long, env = "ATTACK_WINDOW_MIN", default_value_t = 7)]
    pub attack_window_min: u64,

    /// Capture event freshness window, in minutes.
    #[arg(long, env = "CAPTURE_WINDOW_MIN", default_value_t = 12)]
    pub capture_window_min: u64,

    /// Tracked-player active-session TTL, in minutes.
    #[arg(long, env = "ACTIVITY_SESSION_MIN", default_value_t = 30)]
    pub activity_session_min: u64,

    /// RP delta that bypasses the session cooldown.
    #[arg(long, env = "ACTIVITY_BIG_DELTA", default_value_t = 500)]
    pub activity_big_delta: u64,

    /// Heartbeat re-notify window for tracked players, in minutes.
    #[arg(long, env = "ACTIVITY_REPING_MIN", default_value_t = 10)]
    pub activity_reping_min: u64,

    /// When set, delivery failures roll back dedupe/baseline side effects
    /// (retry-safe but may duplicate on false negatives). Default is
    /// freshness-first: state advances even on delivery failure.
    #[arg(long, env = "STRICT_DELIVERY")]
    pub strict_delivery: bool,

    /// Webhook endpoints for the under-attack channel, in fallback order.
    #[arg(long = "ua-webhook", env = "UA_WEBHOOKS", value_delimiter = ',')]
    pub ua_webhooks: Vec<String>,

    /// Webhook endpoints for the capture channel, in fallback order.
    #[arg(long = "capture-webhook", env = "CAPTURE_WEBHOOKS", value_delimiter = ',')]
    pub capture_webhooks: Vec<String>,

    /// Webhook endpoint for the players channel.
    #[arg(long = "players-webhook", env = "PLAYERS_WEBHOOKS", value_delimiter = ',')]
    pub players_webhooks: Vec<String>,

    /// JSON array of `{id, name, realm, url}` tracked-player profiles.
    #[arg(long, env = "TRACKED_PLAYERS", default_value = "[]")]
    pub tracked_players: String,

    /// Polling interval between ticks, in seconds.
    #[arg(long, default_value_t = 60)]
    pub poll_seconds: u64,

    /// Where to store KV state when no managed KV service is configured.
    #[arg(long, default_value = "state/kv.json")]
    pub state_file: PathBuf,

    /// Run a single tick and exit.
    #[arg(long)]
    pub once: bool,

    /// Admin action to run instead of the normal tick loop.
    #[arg(long)]
    pub admin: Option<String>,

    /// `--admin clear-cap` / `reset-ua` target keep slug.
    #[arg(long)]
    pub keep: Option<String>,

    /// `--admin clear-cap` target realm.
    #[arg(long)]
    pub realm: Option<String>,

    /// `--admin clear-cap` previous-owner realm.
    #[arg(long)]
    pub prev: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub warmap_url: String,
    pub attack_window: Duration,
    pub capture_window: Duration,
    pub activity_session: Duration,
    pub activity_big_delta: u64,
    pub activity_reping: Duration,
    pub strict_delivery_default: bool,
    pub ua_webhooks: Vec<String>,
    pub capture_webhooks: Vec<String>,
    pub players_webhooks: Vec<String>,
    pub tracked_players: Vec<TrackedPlayer>,
    pub poll_interval: Duration,
    pub state_file: PathBuf,
    pub once: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackedPlayer {
    pub id: String,
    pub name: String,
    pub realm: String,
    pub url: String,
}

impl EngineConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.warmap_url.trim().is_empty() {
            return Err(eyre!("HERALD_WARMAP_URL must not be empty"));
        }
        if args.ua_webhooks.is_empty() {
            return Err(eyre!("at least one UA webhook endpoint is required"));
        }
        if args.ua_webhooks.len() > 3 {
            tracing::warn!(count = args.ua_webhooks.len(), "more than 3 UA webhooks configured");
        }
        if args.capture_webhooks.is_empty() {
            return Err(eyre!("at least one capture webhook endpoint is required"));
        }
        if args.capture_webhooks.len() > 2 {
            tracing::warn!(count = args.capture_webhooks.len(), "more than 2 capture webhooks configured");
        }
        if args.players_webhooks.is_empty() {
            return Err(eyre!("at least one players webhook endpoint is required"));
        }
        if args.players_webhooks.len() > 1 {
            tracing::warn!(count = args.players_webhooks.len(), "more than 1 players webhook configured");
        }

        let tracked_players: Vec<TrackedPlayer> = serde_json::from_str(&args.tracked_players)
            .map_err(|e| eyre!("malformed TRACKED_PLAYERS json: {e}"))?;

        Ok(Self {
            warmap_url: args.warmap_url.clone(),
            attack_window: Duration::from_secs(args.attack_window_min.max(1) * 60),
            capture_window: Duration::from_secs(args.capture_window_min.max(1) * 60),
            activity_session: Duration::from_secs(args.activity_session_min.max(1) * 60),
            activity_big_delta: args.activity_big_delta,
            activity_reping: Duration::from_secs(args.activity_reping_min.max(1) * 60),
            strict_delivery_default: args.strict_delivery,
            ua_webhooks: args.ua_webhooks.clone(),
            capture_webhooks: args.capture_webhooks.clone(),
            players_webhooks: args.players_webhooks.clone(),
            tracked_players,
            poll_interval: Duration::from_secs(args.poll_seconds.max(1)),
            state_file: args.state_file.clone(),
            once: args.once,
        })
    }
}
