use crate::keys;
use crate::kv::KvStore;
use crate::model::{EventKind, Snapshot};
use crate::webhook::{Channel, Embed, Footer, Thumbnail, WebhookClient};
use chrono::Utc;
use eyre::Result;
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
pub struct UaStats {
    pub rising_edges: usize,
    pub fallback_fires: usize,
    pub delivered: bool,
}

struct Pending {
    state_key: String,
    start_key: String,
    under_key: String,
    nobanner_key: Option<String>,
}

pub async fn process(
    kv: &dyn KvStore,
    webhook: &WebhookClient,
    endpoints: &[String],
    snapshot: &Snapshot,
    siege_window: Duration,
) -> Result<UaStats> {
    let mut stats = UaStats::default();
    let mut embeds = Vec::new();
    let mut pending = Vec::new();

    for keep in &snapshot.keeps {
        let suppress_key = keys::ua_suppress(&keep.id);
        let state_key = keys::ua_state(&keep.id);
        let start_key = keys::alert_ua_start(&keep.id);

        let suppressed = kv.exists(&suppress_key).await?;
        let raw_state = kv.get(&state_key).await?;
        let was_on = raw_state.as_deref().map(|v| v != "0").unwrap_or(false);

        if suppressed {
            if was_on {
                kv.put(&state_key, "0", None).await?;
                kv.delete(&start_key).await?;
            }
            continue;
        }

        if !keep.header_under_attack {
            if was_on {
                kv.put(&state_key, "0", None).await?;
                kv.delete(&start_key).await?;
            }
            continue;
        }

        if was_on {
            // On -> On: refresh state and session TTLs, never re-notify.
            kv.put(&state_key, &Utc::now().to_rfc3339(), Some(siege_window)).await?;
            kv.put(&start_key, "1", Some(siege_window)).await?;
            continue;
        }

        // Off -> On rising edge.
        let minute = keys::minute_stamp(snapshot.updated_at);
        let claim_key = keys::ua_claim(&keep.id, &minute);
        if !kv.claim(&claim_key, keys::UA_CLAIM_TTL).await? {
            continue;
        }
        let under_key = keys::alert_under(&keep.id, &minute);
        if kv.exists(&start_key).await? || kv.exists(&under_key).await? {
            continue;
        }

        embeds.push(build_embed(keep));
        stats.rising_edges += 1;
        pending.push(Pending {
            state_key,
            start_key,
            under_key,
            nobanner_key: None,
        });
    }

    for event in &snapshot.events {
        if event.kind != EventKind::UnderAttack {
            continue;
        }
        let Some(keep) = snapshot.keep(&event.keep_id) else {
            continue;
        };
        if keep.header_under_attack {
            continue; // already handled by the primary banner path
        }
        if kv.exists(&keys::ua_suppress(&keep.id)).await? {
            continue;
        }
        let nobanner_key = keys::alert_ua_nobanner(&keep.id);
        if kv.exists(&nobanner_key).await? {
            continue;
        }

        let minute = keys::minute_stamp(event.at);
        let claim_key = keys::ua_claim(&keep.id, &minute);
        if !kv.claim(&claim_key, keys::UA_CLAIM_TTL).await? {
            continue;
        }
        let start_key = keys::alert_ua_start(&keep.id);
        let under_key = keys::alert_under(&keep.id, &minute);
        if kv.exists(&start_key).await? || kv.exists(&under_key).await? {
            continue;
        }

        embeds.push(build_embed(keep));
        stats.fallback_fires += 1;
        pending.push(Pending {
            state_key: keys::ua_state(&keep.id),
            start_key,
            under_key,
            nobanner_key: Some(nobanner_key),
        });
    }

    if embeds.is_empty() {
        return Ok(stats);
    }

    stats.delivered = webhook.deliver(Channel::Ua, endpoints, "Herald Alerts", &embeds).await?;

    if stats.delivered {
        for p in pending {
            kv.put(&p.start_key, "1", Some(siege_window)).await?;
            kv.put(&p.under_key, "1", Some(siege_window)).await?;
            kv.put(&p.state_key, &Utc::now().to_rfc3339(), Some(siege_window)).await?;
            if let Some(nb) = p.nobanner_key {
                kv.put(&nb, "1", Some(siege_window)).await?;
            }
        }
    }

    Ok(stats)
}

fn build_embed(keep: &crate::model::Keep) -> Embed {
    let mut fields = Vec::new();
    fields.push(crate::webhook::Field {
        name: "Owner".to_string(),
        value: keep.owner.to_string(),
        inline: true,
    });
    if let Some(level) = keep.level {
        fields.push(crate::webhook::Field {
            name: "Level".to_string(),
            value: level.to_string(),
            inline: true,
        });
    }
    if let Some(claimed_by) = &keep.claimed_by {
        fields.push(crate::webhook::Field {
            name: "Claimed by".to_string(),
            value: claimed_by.clone(),
            inline: true,
        });
    }

    Embed {
        title: format!("⚔️ {} is under attack!", keep.name),
        color: keep.owner.color(),
        timestamp: Some(Utc::now()),
        footer: Some(Footer {
            text: "Uthgard Herald".to_string(),
        }),
        fields,
        thumbnail: keep.emblem_url.clone().map(|url| Thumbnail { url }),
        description: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::model::{Keep, KeepKind, Realm};
    use std::sync::Arc;

    fn keep(id: &str, under_attack: bool) -> Keep {
        Keep {
            id: id.to_string(),
            name: id.to_string(),
            kind: KeepKind::Keep,
            owner: Realm::Albion,
            level: Some(5),
            claimed_by: None,
            emblem_url: None,
            header_under_attack: under_attack,
            under_attack,
            last_event: None,
        }
    }

    fn snapshot(keeps: Vec<Keep>) -> Snapshot {
        Snapshot {
            updated_at: Utc::now(),
            keeps,
            events: vec![],
            df_owner: Realm::Midgard,
        }
    }

    #[tokio::test]
    async fn rising_edge_delivers_and_stamps_state() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let webhook = WebhookClient::new(kv.clone()).unwrap();
        let snap = snapshot(vec![keep("caer-benowyc", true)]);

        let stats = process(
            kv.as_ref(),
            &webhook,
            &[format!("{}/webhook", server.uri())],
            &snap,
            Duration::from_secs(7 * 60 * 4),
        )
        .await
        .unwrap();

        assert_eq!(stats.rising_edges, 1);
        assert!(stats.delivered);
        assert!(kv.exists(&keys::ua_state("caer-benowyc")).await.unwrap());
        assert!(kv.exists(&keys::alert_ua_start("caer-benowyc")).await.unwrap());
    }

    #[tokio::test]
    async fn suppressed_keep_never_notifies() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        kv.put(&keys::ua_suppress("caer-benowyc"), "1", None).await.unwrap();
        let webhook = WebhookClient::new(kv.clone()).unwrap();
        let snap = snapshot(vec![keep("caer-benowyc", true)]);

        let stats = process(
            kv.as_ref(),
            &webhook,
            &["https://example.invalid/hook".to_string()],
            &snap,
            Duration::from_secs(7 * 60 * 4),
        )
        .await
        .unwrap();

        assert_eq!(stats.rising_edges, 0);
    }

    #[tokio::test]
    async fn still_flaming_does_not_renotify() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        kv.put(&keys::ua_state("caer-benowyc"), &Utc::now().to_rfc3339(), Some(Duration::from_secs(7 * 60 * 4)))
            .await
            .unwrap();
        let webhook = WebhookClient::new(kv.clone()).unwrap();
        let snap = snapshot(vec![keep("caer-benowyc", true)]);

        let stats = process(
            kv.as_ref(),
            &webhook,
            &["https://example.invalid/hook".to_string()],
            &snap,
            Duration::from_secs(7 * 60 * 4),
        )
        .await
        .unwrap();

        assert_eq!(stats.rising_edges, 0);
        assert_eq!(stats.fallback_fires, 0);
    }
}
