use crate::keys;
use crate::kv::KvStore;
use crate::model::{EventKind, Keep, Snapshot};
use crate::webhook::{Channel, Embed, Footer, WebhookClient};
use chrono::{Duration as ChronoDuration, Utc};
use eyre::Result;
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureStats {
    pub ownership_path_fires: usize,
    pub event_path_fires: usize,
}

struct Pending {
    keep_id: String,
    new_owner: String,
    prev_owner: String,
    event_minute: String,
    advance_baseline: bool,
}

pub async fn process(
    kv: &dyn KvStore,
    webhook: &WebhookClient,
    endpoints: &[String],
    snapshot: &Snapshot,
    capture_window: Duration,
    strict_delivery: bool,
) -> Result<CaptureStats> {
    let mut stats = CaptureStats::default();
    let window = ChronoDuration::from_std(capture_window).unwrap_or(ChronoDuration::minutes(12));

    let (ownership_embeds, ownership_pending) = ownership_rising_edge(kv, snapshot, window).await?;
    stats.ownership_path_fires = ownership_pending.len();
    deliver_and_stamp(kv, webhook, endpoints, ownership_embeds, ownership_pending, strict_delivery).await?;

    let (event_embeds, event_pending) = recent_capture_events(kv, snapshot, window).await?;
    stats.event_path_fires = event_pending.len();
    deliver_and_stamp(kv, webhook, endpoints, event_embeds, event_pending, strict_delivery).await?;

    Ok(stats)
}

async fn ownership_rising_edge(
    kv: &dyn KvStore,
    snapshot: &Snapshot,
    window: ChronoDuration,
) -> Result<(Vec<Embed>, Vec<Pending>)> {
    let mut embeds = Vec::new();
    let mut pending = Vec::new();

    for keep in &snapshot.keeps {
        let own_key = keys::own(&keep.id);
        let new_owner = keep.owner.as_str();

        let Some(baseline) = kv.get(&own_key).await? else {
            kv.put(&own_key, new_owner, None).await?;
            continue;
        };
        if baseline == new_owner {
            continue;
        }

        let corroboration = snapshot
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Captured && e.keep_id == keep.id)
            .filter(|e| snapshot.updated_at - e.at <= window)
            .max_by_key(|e| e.at);

        let Some(event) = corroboration else {
            // Flip not trustworthy enough to notify on; still advance.
            kv.put(&own_key, new_owner, None).await?;
            continue;
        };

        if gates_already_set(kv, &keep.id, &baseline, new_owner, event.at).await? {
            kv.put(&own_key, new_owner, None).await?;
            continue;
        }

        let minute = keys::minute_stamp(event.at);
        if !kv.claim(&keys::cap_claim(&keep.id, new_owner, &minute), keys::CAP_CLAIM_TTL).await? {
            kv.put(&own_key, new_owner, None).await?;
            continue;
        }

        embeds.push(build_embed(keep, new_owner, event.leader.as_deref(), event.at));
        pending.push(Pending {
            keep_id: keep.id.clone(),
            new_owner: new_owner.to_string(),
            prev_owner: baseline,
            event_minute: minute,
            advance_baseline: true,
        });
    }

    Ok((embeds, pending))
}

async fn recent_capture_events(
    kv: &dyn KvStore,
    snapshot: &Snapshot,
    window: ChronoDuration,
) -> Result<(Vec<Embed>, Vec<Pending>)> {
    let mut embeds = Vec::new();
    let mut pending = Vec::new();

    for event in &snapshot.events {
        if event.kind != EventKind::Captured {
            continue;
        }
        if snapshot.updated_at - event.at > window {
            continue;
        }
        let Some(keep) = snapshot.keep(&event.keep_id) else {
            continue;
        };
        let Some(new_owner) = event.new_owner else {
            continue;
        };
        let new_owner = new_owner.as_str();
        // The ownership path owns the baseline; this path only reads it to
        // build the same gate keys, never writes it.
        let prev = kv.get(&keys::own(&keep.id)).await?.unwrap_or_else(|| "unknown".to_string());

        if gates_already_set(kv, &keep.id, &prev, new_owner, event.at).await? {
            continue;
        }

        let minute = keys::minute_stamp(event.at);
        if !kv.claim(&keys::cap_claim(&keep.id, new_owner, &minute), keys::CAP_CLAIM_TTL).await? {
            continue;
        }

        embeds.push(build_embed(keep, new_owner, event.leader.as_deref(), event.at));
        pending.push(Pending {
            keep_id: keep.id.clone(),
            new_owner: new_owner.to_string(),
            prev_owner: prev,
            event_minute: minute,
            advance_baseline: false,
        });
    }

    Ok((embeds, pending))
}

async fn gates_already_set(
    kv: &dyn KvStore,
    keep_id: &str,
    prev: &str,
    new_owner: &str,
    event_at: chrono::DateTime<Utc>,
) -> Result<bool> {
    let minute = keys::minute_stamp(event_at);
    let gates = [
        keys::cap_once_transition(keep_id, prev, new_owner),
        keys::cap_once_owner(keep_id, new_owner),
        keys::cap_any(keep_id, new_owner, &minute),
        keys::cap_seen(keep_id, new_owner),
    ];
    for gate in &gates {
        if kv.exists(gate).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn deliver_and_stamp(
    kv: &dyn KvStore,
    webhook: &WebhookClient,
    endpoints: &[String],
    embeds: Vec<Embed>,
    pending: Vec<Pending>,
    strict_delivery: bool,
) -> Result<()> {
    if embeds.is_empty() {
        return Ok(());
    }

    let delivered = webhook.deliver(Channel::Capture, endpoints, "Herald Alerts", &embeds).await?;

    if !delivered && strict_delivery {
        // Freshness-first is off: leave dedupe/baseline untouched so the
        // next tick retries.
        return Ok(());
    }

    for p in pending {
        kv.put(&keys::cap_seen(&p.keep_id, &p.new_owner), "1", Some(keys::CAP_ONCE_TTL)).await?;
        kv.put(&keys::cap_any(&p.keep_id, &p.new_owner, &p.event_minute), "1", Some(keys::CAP_ANY_TTL))
            .await?;
        kv.put(&keys::cap_once_owner(&p.keep_id, &p.new_owner), "1", Some(keys::CAP_ONCE_TTL)).await?;
        kv.put(
            &keys::cap_once_transition(&p.keep_id, &p.prev_owner, &p.new_owner),
            "1",
            Some(keys::CAP_ONCE_TTL),
        )
        .await?;
        if p.advance_baseline {
            kv.put(&keys::own(&p.keep_id), &p.new_owner, None).await?;
        }
        kv.delete(&keys::alert_ua_start(&p.keep_id)).await?;
        kv.delete(&keys::ua_state(&p.keep_id)).await?;
        kv.put(&keys::ua_suppress(&p.keep_id), "1", Some(keys::UA_SUPPRESS_TTL)).await?;
    }

    Ok(())
}

fn build_embed(keep: &Keep, new_owner: &str, leader: Option<&str>, at: chrono::DateTime<Utc>) -> Embed {
    let title = match leader {
        Some(l) => format!("🏰 {} was captured by {} — led by {}", keep.name, new_owner, l),
        None => format!("🏰 {} was captured by {}", keep.name, new_owner),
    };
    Embed {
        title,
        color: keep.owner.color(),
        timestamp: Some(at),
        footer: Some(Footer {
            text: "Uthgard Herald".to_string(),
        }),
        fields: vec![],
        thumbnail: None,
        description: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::model::{Event, KeepKind, Realm};
    use std::sync::Arc;

    fn keep(id: &str, owner: Realm) -> Keep {
        Keep {
            id: id.to_string(),
            name: id.to_string(),
            kind: KeepKind::Keep,
            owner,
            level: None,
            claimed_by: None,
            emblem_url: None,
            header_under_attack: false,
            under_attack: false,
            last_event: None,
        }
    }

    fn captured_event(keep_id: &str, new_owner: Realm, at: chrono::DateTime<Utc>) -> Event {
        Event {
            at,
            kind: EventKind::Captured,
            keep_id: keep_id.to_string(),
            keep_name: keep_id.to_string(),
            new_owner: Some(new_owner),
            leader: Some("Bobdole".to_string()),
            raw: String::new(),
        }
    }

    #[tokio::test]
    async fn first_sighting_seeds_baseline_without_alert() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let webhook = WebhookClient::new(kv.clone()).unwrap();
        let now = Utc::now();
        let snap = Snapshot {
            updated_at: now,
            keeps: vec![keep("caer-benowyc", Realm::Midgard)],
            events: vec![],
            df_owner: Realm::Midgard,
        };

        let stats = process(
            kv.as_ref(),
            &webhook,
            &["https://example.invalid/hook".to_string()],
            &snap,
            Duration::from_secs(12 * 60),
            false,
        )
        .await
        .unwrap();

        assert_eq!(stats.ownership_path_fires, 0);
        assert_eq!(kv.get(&keys::own("caer-benowyc")).await.unwrap(), Some("Midgard".to_string()));
    }

    #[tokio::test]
    async fn corroborated_flip_fires_and_stamps_gates() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        kv.put(&keys::own("caer-benowyc"), "Albion", None).await.unwrap();
        let webhook = WebhookClient::new(kv.clone()).unwrap();
        let now = Utc::now();
        let snap = Snapshot {
            updated_at: now,
            keeps: vec![keep("caer-benowyc", Realm::Midgard)],
            events: vec![captured_event("caer-benowyc", Realm::Midgard, now - ChronoDuration::minutes(2))],
            df_owner: Realm::Midgard,
        };

        let stats = process(
            kv.as_ref(),
            &webhook,
            &[format!("{}/webhook", server.uri())],
            &snap,
            Duration::from_secs(12 * 60),
            false,
        )
        .await
        .unwrap();

        assert_eq!(stats.ownership_path_fires, 1);
        assert_eq!(kv.get(&keys::own("caer-benowyc")).await.unwrap(), Some("Midgard".to_string()));
        assert!(kv.exists(&keys::cap_seen("caer-benowyc", "Midgard")).await.unwrap());
        assert!(kv.exists(&keys::ua_suppress("caer-benowyc")).await.unwrap());
    }

    #[tokio::test]
    async fn uncorroborated_flip_advances_silently() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        kv.put(&keys::own("caer-benowyc"), "Albion", None).await.unwrap();
        let webhook = WebhookClient::new(kv.clone()).unwrap();
        let snap = Snapshot {
            updated_at: Utc::now(),
            keeps: vec![keep("caer-benowyc", Realm::Midgard)],
            events: vec![],
            df_owner: Realm::Midgard,
        };

        let stats = process(
            kv.as_ref(),
            &webhook,
            &["https://example.invalid/hook".to_string()],
            &snap,
            Duration::from_secs(12 * 60),
            false,
        )
        .await
        .unwrap();

        assert_eq!(stats.ownership_path_fires, 0);
        assert_eq!(kv.get(&keys::own("caer-benowyc")).await.unwrap(), Some("Midgard".to_string()));
    }
}
