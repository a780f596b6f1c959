use crate::config::EngineConfig;
use crate::diff::{capture, players, ua};
use crate::keys;
use crate::kv::KvStore;
use crate::metrics;
use crate::model::{Event, EventKind, Keep, KeepKind, Realm, Snapshot};
use crate::webhook::WebhookClient;
use chrono::Utc;
use eyre::{eyre, Result};
use serde_json::{json, Value};
use std::fmt;
use tracing::info;

pub struct AdminArgs<'a> {
    pub action: &'a str,
    pub keep: Option<&'a str>,
    pub realm: Option<&'a str>,
    pub prev: Option<&'a str>,
}

/// Category an admin failure falls into, so the CLI can map it to a
/// distinct process exit code instead of always exiting 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminErrorKind {
    /// Missing or malformed `--keep`/`--realm`/action name.
    BadRequest,
    /// The underlying HTTP call (profile fetch or webhook post) failed.
    Upstream,
    /// Anything else (KV I/O, serialization, etc).
    Internal,
}

#[derive(Debug)]
pub struct AdminError {
    pub kind: AdminErrorKind,
    inner: eyre::Error,
}

impl AdminError {
    fn bad_request(msg: impl fmt::Display) -> Self {
        Self { kind: AdminErrorKind::BadRequest, inner: eyre!("{msg}") }
    }
}

impl fmt::Display for AdminError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for AdminError {}

impl From<eyre::Error> for AdminError {
    fn from(inner: eyre::Error) -> Self {
        let kind = if inner.downcast_ref::<reqwest::Error>().is_some() {
            AdminErrorKind::Upstream
        } else {
            AdminErrorKind::Internal
        };
        Self { kind, inner }
    }
}

/// Dispatches one admin action and returns the `result` half of the
/// `{ok, result}` envelope the CLI prints to stdout. A returned `Err`
/// becomes `{ok: false, error}`, with the exit code set from its kind,
/// never a panic: these are operator-facing, scripted from cron.
pub async fn run(
    args: AdminArgs<'_>,
    http: &reqwest::Client,
    kv: &dyn KvStore,
    webhook: &WebhookClient,
    config: &EngineConfig,
) -> std::result::Result<Value, AdminError> {
    match args.action {
        "health" => health(kv).await.map_err(AdminError::from),
        "dump" => dump(kv, args.keep.unwrap_or("")).await.map_err(AdminError::from),
        "clear-cooldowns" => clear_cooldowns(kv).await.map_err(AdminError::from),
        "clear-metrics" => clear_metrics(kv).await.map_err(AdminError::from),
        "reset-all-ua" => reset_all_ua(kv).await.map_err(AdminError::from),
        "reset-ua" => reset_ua(kv, require(args.keep, "keep")?).await.map_err(AdminError::from),
        "clear-cap" => clear_cap(kv, require(args.keep, "keep")?, require(args.realm, "realm")?, args.prev)
            .await
            .map_err(AdminError::from),
        "strict-on" => set_strict(kv, true).await.map_err(AdminError::from),
        "strict-off" => set_strict(kv, false).await.map_err(AdminError::from),
        "simulate-ua" => simulate_ua(kv, webhook, config, require(args.keep, "keep")?)
            .await
            .map_err(AdminError::from),
        "simulate-capture" => simulate_capture(
            kv,
            webhook,
            config,
            require(args.keep, "keep")?,
            require(args.realm, "realm")?,
            args.prev,
        )
        .await
        .map_err(AdminError::from),
        "simulate-player" => simulate_player(http, kv, webhook, config).await.map_err(AdminError::from),
        other => Err(AdminError::bad_request(format!("unknown admin action: {other}"))),
    }
}

fn require<'a>(value: Option<&'a str>, name: &str) -> std::result::Result<&'a str, AdminError> {
    value.ok_or_else(|| AdminError::bad_request(format!("--admin requires --{name}")))
}

async fn health(kv: &dyn KvStore) -> Result<Value> {
    let warmap_present = kv.exists(&keys::warmap()).await?;
    let own_count = kv.list_prefix("own:", 1000).await?.len();
    let ua_active = kv.list_prefix("ua:state:", 1000).await?.len();
    let metric_snapshot = metrics::snapshot(kv).await?;

    let mut cooldowns = Vec::new();
    for key in kv.list_prefix("discord:cooldown:", 1000).await? {
        if let Some(until) = kv.get(&key).await? {
            cooldowns.push(json!({
                "endpoint": key.trim_start_matches("discord:cooldown:"),
                "until": until,
            }));
        }
    }
    let global_cooldown_until = kv.get(&keys::discord_global_cooldown_until()).await?;

    let snapshot_age_seconds = match kv.get(&keys::warmap()).await? {
        Some(raw) => serde_json::from_str::<Snapshot>(&raw)
            .ok()
            .map(|s| (Utc::now() - s.updated_at).num_seconds()),
        None => None,
    };

    info!(warmap_present, own_count, ua_active, metrics = ?metric_snapshot, "health snapshot");
    Ok(json!({
        "warmapPresent": warmap_present,
        "ownCount": own_count,
        "uaActive": ua_active,
        "metrics": metric_snapshot.into_iter().collect::<std::collections::BTreeMap<_, _>>(),
        "cooldowns": cooldowns,
        "globalCooldownUntil": global_cooldown_until,
        "snapshotAgeSeconds": snapshot_age_seconds,
    }))
}

/// Dumps every live key/value pair under `prefix`, promoted from an ad hoc
/// debugging query to a real action so operators never need direct file
/// access.
async fn dump(kv: &dyn KvStore, prefix: &str) -> Result<Value> {
    let keys = kv.list_prefix(prefix, 10_000).await?;
    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(value) = kv.get(&key).await? {
            entries.push(json!({"key": key, "value": value}));
        }
    }
    info!(prefix, count = entries.len(), "dumped kv subset");
    Ok(json!({ "prefix": prefix, "entries": entries }))
}

async fn clear_cooldowns(kv: &dyn KvStore) -> Result<Value> {
    let mut cleared = 0;
    for prefix in ["discord:cooldown:", "discord:penalty:"] {
        for key in kv.list_prefix(prefix, 1000).await? {
            kv.delete(&key).await?;
            cleared += 1;
        }
    }
    kv.delete(&keys::discord_global_cooldown_until()).await?;
    info!(cleared, "cleared webhook cooldowns and penalties");
    Ok(json!({ "cleared": cleared }))
}

async fn clear_metrics(kv: &dyn KvStore) -> Result<Value> {
    let cleared = metrics::clear(kv).await?;
    info!(cleared, "cleared metrics counters");
    Ok(json!({ "cleared": cleared }))
}

async fn reset_all_ua(kv: &dyn KvStore) -> Result<Value> {
    let mut cleared = 0;
    for prefix in [
        "ua:state:",
        "alert:ua:start:",
        "ua:suppress:",
        "ua:claim:",
        "alert:under:",
        "alert:ua:nobanner:",
    ] {
        for key in kv.list_prefix(prefix, 10_000).await? {
            kv.delete(&key).await?;
            cleared += 1;
        }
    }
    info!(cleared, "reset all under-attack state");
    Ok(json!({ "cleared": cleared }))
}

async fn reset_ua(kv: &dyn KvStore, keep_id: &str) -> Result<Value> {
    kv.delete(&keys::ua_state(keep_id)).await?;
    kv.delete(&keys::alert_ua_start(keep_id)).await?;
    kv.delete(&keys::ua_suppress(keep_id)).await?;
    kv.delete(&keys::alert_ua_nobanner(keep_id)).await?;
    info!(keep = keep_id, "reset under-attack state");
    Ok(json!({ "keep": keep_id }))
}

async fn clear_cap(kv: &dyn KvStore, keep_id: &str, realm: &str, prev: Option<&str>) -> Result<Value> {
    kv.delete(&keys::cap_once_owner(keep_id, realm)).await?;
    kv.delete(&keys::cap_seen(keep_id, realm)).await?;
    for key in kv.list_prefix(&format!("cap:any:{keep_id}:{realm}:"), 10_000).await? {
        kv.delete(&key).await?;
    }
    for key in kv.list_prefix(&format!("cap:claim:{keep_id}:{realm}:"), 10_000).await? {
        kv.delete(&key).await?;
    }
    if let Some(prev) = prev {
        kv.delete(&keys::cap_once_transition(keep_id, prev, realm)).await?;
    }
    info!(keep = keep_id, realm, prev, "cleared capture gates");
    Ok(json!({ "keep": keep_id, "realm": realm, "prev": prev }))
}

async fn set_strict(kv: &dyn KvStore, enabled: bool) -> Result<Value> {
    kv.put(&keys::flags_strict_delivery(), if enabled { "1" } else { "0" }, None).await?;
    info!(enabled, "set strict delivery flag");
    Ok(json!({ "strictDelivery": enabled }))
}

fn synthetic_keep(id: &str, owner: Realm, under_attack: bool) -> Keep {
    Keep {
        id: id.to_string(),
        name: id.replace('-', " "),
        kind: KeepKind::Keep,
        owner,
        level: Some(5),
        claimed_by: None,
        emblem_url: None,
        header_under_attack: under_attack,
        under_attack,
        last_event: None,
    }
}

async fn simulate_ua(kv: &dyn KvStore, webhook: &WebhookClient, config: &EngineConfig, keep_id: &str) -> Result<Value> {
    let snapshot = Snapshot {
        updated_at: Utc::now(),
        keeps: vec![synthetic_keep(keep_id, Realm::Albion, true)],
        events: vec![],
        df_owner: Realm::Midgard,
    };
    let stats = ua::process(kv, webhook, &config.ua_webhooks, &snapshot, config.attack_window * 4).await?;
    info!(?stats, "simulated UA rising edge");
    Ok(json!({
        "risingEdges": stats.rising_edges,
        "fallbackFires": stats.fallback_fires,
        "delivered": stats.delivered,
    }))
}

async fn simulate_capture(
    kv: &dyn KvStore,
    webhook: &WebhookClient,
    config: &EngineConfig,
    keep_id: &str,
    realm: &str,
    prev: Option<&str>,
) -> Result<Value> {
    let new_owner = parse_realm(realm)?;
    let prev_owner = match prev {
        Some(p) => parse_realm(p)?,
        None => match new_owner {
            Realm::Albion => Realm::Midgard,
            _ => Realm::Albion,
        },
    };
    kv.put(&keys::own(keep_id), prev_owner.as_str(), None).await?;

    let event = Event {
        at: Utc::now(),
        kind: EventKind::Captured,
        keep_id: keep_id.to_string(),
        keep_name: keep_id.replace('-', " "),
        new_owner: Some(new_owner),
        leader: Some("Admin Simulation".to_string()),
        raw: "simulated capture".to_string(),
    };
    let snapshot = Snapshot {
        updated_at: Utc::now(),
        keeps: vec![synthetic_keep(keep_id, new_owner, false)],
        events: vec![event],
        df_owner: Realm::Midgard,
    };
    let stats = capture::process(kv, webhook, &config.capture_webhooks, &snapshot, config.capture_window, false).await?;
    info!(?stats, "simulated capture");
    Ok(json!({
        "ownershipPathFires": stats.ownership_path_fires,
        "eventPathFires": stats.event_path_fires,
    }))
}

async fn simulate_player(http: &reqwest::Client, kv: &dyn KvStore, webhook: &WebhookClient, config: &EngineConfig) -> Result<Value> {
    if config.tracked_players.is_empty() {
        return Err(eyre!("no tracked players configured to simulate"));
    }
    let stats = players::process(
        http,
        kv,
        webhook,
        &config.players_webhooks,
        &config.tracked_players,
        config.activity_session,
        config.activity_big_delta,
        config.activity_reping,
    )
    .await?;
    info!(?stats, "simulated tracked-player check");
    Ok(json!({
        "checked": stats.checked,
        "notified": stats.notified,
        "rollovers": stats.rollovers,
    }))
}

fn parse_realm(s: &str) -> Result<Realm> {
    match s.to_ascii_lowercase().as_str() {
        "albion" => Ok(Realm::Albion),
        "midgard" => Ok(Realm::Midgard),
        "hibernia" => Ok(Realm::Hibernia),
        other => Err(eyre!("unknown realm: {other}")),
    }
}
