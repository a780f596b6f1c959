use crate::config::EngineConfig;
use crate::diff::{capture, players, ua, CaptureStats, PlayerStats, UaStats};
use crate::keys;
use crate::kv::KvStore;
use crate::model::Snapshot;
use crate::parser::{parse_snapshot, ParseOptions};
use crate::webhook::WebhookClient;
use chrono::Utc;
use eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Default)]
pub struct TickSummary {
    pub hash_changed: bool,
    pub ua: UaStats,
    pub capture: CaptureStats,
    /// Always default: the player scan is spawned as a background
    /// continuation and may still be running (or not yet started) by the
    /// time this summary is returned.
    pub players: PlayerStats,
}

pub async fn run_tick(
    http: &reqwest::Client,
    kv: Arc<dyn KvStore>,
    webhook: &WebhookClient,
    config: &EngineConfig,
) -> Result<TickSummary> {
    let prev_hash = kv
        .get(&keys::warmap())
        .await?
        .and_then(|raw| serde_json::from_str::<Snapshot>(&raw).ok())
        .map(|s| s.canonical_hash());

    let html = fetch_warmap(http, &config.warmap_url).await?;

    let opts = ParseOptions {
        base_url: base_url_of(&config.warmap_url),
        attack_window: config.attack_window,
        now: Utc::now(),
    };
    let snapshot = parse_snapshot(&html, &opts);
    let hash = snapshot.canonical_hash();
    let hash_changed = prev_hash.as_deref() != Some(hash.as_str());

    if hash_changed {
        let json = serde_json::to_string(&snapshot)?;
        kv.put(&keys::warmap(), &json, None).await?;
    }

    let siege_window = config.attack_window * 4;
    let ua_stats = ua::process(kv.as_ref(), webhook, &config.ua_webhooks, &snapshot, siege_window).await?;

    let strict = strict_delivery(kv.as_ref(), config.strict_delivery_default).await?;
    let capture_stats = capture::process(
        kv.as_ref(),
        webhook,
        &config.capture_webhooks,
        &snapshot,
        config.capture_window,
        strict,
    )
    .await?;

    if !config.tracked_players.is_empty() {
        spawn_player_scan(http.clone(), kv.clone(), webhook.clone(), config);
    }

    info!(
        hash_changed,
        ua_rising = ua_stats.rising_edges,
        ua_fallback = ua_stats.fallback_fires,
        cap_ownership = capture_stats.ownership_path_fires,
        cap_event = capture_stats.event_path_fires,
        "tick complete"
    );

    Ok(TickSummary {
        hash_changed,
        ua: ua_stats,
        capture: capture_stats,
        players: PlayerStats::default(),
    })
}

/// Runs the tracked-player scan on its own task so a slow profile fetch
/// never holds up the next tick. Outlives the tick that spawned it; results
/// only ever reach the logs, never a caller.
fn spawn_player_scan(http: reqwest::Client, kv: Arc<dyn KvStore>, webhook: WebhookClient, config: &EngineConfig) {
    let endpoints = config.players_webhooks.clone();
    let players = config.tracked_players.clone();
    let session_ttl = config.activity_session;
    let big_delta = config.activity_big_delta;
    let reping = config.activity_reping;

    tokio::spawn(async move {
        match players::process(&http, kv.as_ref(), &webhook, &endpoints, &players, session_ttl, big_delta, reping)
            .await
        {
            Ok(stats) => info!(
                checked = stats.checked,
                notified = stats.notified,
                rollovers = stats.rollovers,
                "tracked-player scan complete"
            ),
            Err(err) => warn!(error = %err, "tracked-player check failed"),
        }
    });
}

async fn fetch_warmap(http: &reqwest::Client, url: &str) -> Result<String> {
    let sep = if url.contains('?') { '&' } else { '?' };
    let cache_bust = Utc::now().timestamp() / 30;
    let busted = format!("{url}{sep}_={cache_bust}");
    let resp = http
        .get(&busted)
        .timeout(FETCH_TIMEOUT)
        .header("user-agent", "UthgardHeraldBot/1.0")
        .header("cache-control", "no-cache")
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(eyre::eyre!("upstream warmap fetch returned {}", resp.status()));
    }
    Ok(resp.text().await?)
}

fn base_url_of(url: &str) -> String {
    match url.find("://") {
        Some(scheme_end) => match url[scheme_end + 3..].find('/') {
            Some(path_start) => url[..scheme_end + 3 + path_start].to_string(),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

async fn strict_delivery(kv: &dyn KvStore, default: bool) -> Result<bool> {
    Ok(match kv.get(&keys::flags_strict_delivery()).await? {
        Some(v) => v == "1",
        None => default,
    })
}
