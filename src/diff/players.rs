use crate::config::TrackedPlayer;
use crate::keys;
use crate::kv::KvStore;
use crate::webhook::{Channel, Embed, WebhookClient};
use chrono::{DateTime, Utc};
use eyre::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::warn;

const FETCH_GAP: Duration = Duration::from_millis(300);

static DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

#[derive(Debug, Default, Clone, Copy)]
pub struct PlayerStats {
    pub checked: usize,
    pub notified: usize,
    pub rollovers: usize,
}

pub async fn process(
    http: &reqwest::Client,
    kv: &dyn KvStore,
    webhook: &WebhookClient,
    endpoints: &[String],
    players: &[TrackedPlayer],
    session_ttl: Duration,
    big_delta: u64,
    reping: Duration,
) -> Result<PlayerStats> {
    let mut stats = PlayerStats::default();

    for (i, player) in players.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(FETCH_GAP).await;
        }

        let html = match http.get(&player.url).send().await {
            Ok(resp) => match resp.text().await {
                Ok(body) => body,
                Err(err) => {
                    warn!(player = %player.id, error = %err, "failed to read player profile body");
                    continue;
                }
            },
            Err(err) => {
                warn!(player = %player.id, error = %err, "failed to fetch player profile");
                continue;
            }
        };

        let Some(rp) = parse_realm_points(&html) else {
            warn!(player = %player.id, "no realm points row found on profile page");
            continue;
        };
        stats.checked += 1;

        if let Some((notified, rolled_over)) =
            apply_state_machine(kv, webhook, endpoints, player, rp, session_ttl, big_delta, reping).await?
        {
            if notified {
                stats.notified += 1;
            }
            if rolled_over {
                stats.rollovers += 1;
            }
        }
    }

    Ok(stats)
}

pub(crate) async fn apply_state_machine(
    kv: &dyn KvStore,
    webhook: &WebhookClient,
    endpoints: &[String],
    player: &TrackedPlayer,
    rp: u64,
    session_ttl: Duration,
    big_delta: u64,
    reping: Duration,
) -> Result<Option<(bool, bool)>> {
    let rp_key = keys::rp(&player.id);
    let active_key = keys::rp_active(&player.id);
    let last_key = keys::rp_last(&player.id);

    let Some(baseline_raw) = kv.get(&rp_key).await? else {
        kv.put(&rp_key, &rp.to_string(), None).await?;
        return Ok(None);
    };
    let baseline: u64 = baseline_raw.parse().unwrap_or(0);

    if rp < baseline {
        kv.put(&rp_key, &rp.to_string(), None).await?;
        kv.delete(&active_key).await?;
        kv.delete(&last_key).await?;
        return Ok(Some((false, true)));
    }

    if rp == baseline {
        return Ok(Some((false, false)));
    }

    let delta = rp - baseline;
    let active = kv.exists(&active_key).await?;
    let last_ping = kv.get(&last_key).await?.and_then(|v| DateTime::parse_from_rfc3339(&v).ok());
    let past_reping = match last_ping {
        Some(last) => Utc::now() - last.with_timezone(&Utc) > chrono::Duration::from_std(reping).unwrap_or_default(),
        None => true,
    };

    let should_notify = !active || delta >= big_delta || past_reping;
    let mut notified = false;

    if should_notify {
        let embed = build_embed(player, delta, rp);
        let ok = webhook.deliver(Channel::Players, endpoints, "Herald Alerts", &[embed]).await?;
        if ok {
            kv.put(&active_key, "1", Some(session_ttl)).await?;
            kv.put(&last_key, &Utc::now().to_rfc3339(), Some(keys::RP_LAST_TTL)).await?;
            notified = true;
        }
    }

    kv.put(&rp_key, &rp.to_string(), None).await?;
    Ok(Some((notified, false)))
}

fn build_embed(player: &TrackedPlayer, delta: u64, total: u64) -> Embed {
    Embed {
        title: format!("🟢 {} is active", player.name),
        color: 0x2ECC71,
        timestamp: Some(Utc::now()),
        footer: None,
        fields: vec![],
        thumbnail: None,
        description: Some(format!("+{delta} RPs gained (total {total})")),
    }
}

/// Scans every table row for a left cell that normalizes to "realmpoints"
/// and reads the digits out of the row's last cell. `None` covers both a
/// missing row and a non-numeric value, both treated as "no RP found"
/// rather than an error.
pub(crate) fn parse_realm_points(html: &str) -> Option<u64> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse("tr").unwrap();
    let cell_sel = Selector::parse("td, th").unwrap();

    for row in doc.select(&row_sel) {
        let cells: Vec<_> = row.select(&cell_sel).collect();
        if cells.len() < 2 {
            continue;
        }
        let label: String = cells[0]
            .text()
            .collect::<String>()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        if label != "realmpoints" {
            continue;
        }
        let value_text: String = cells[cells.len() - 1].text().collect();
        let digits: String = DIGITS_RE.find_iter(&value_text).map(|m| m.as_str()).collect();
        if digits.is_empty() {
            return None;
        }
        return digits.parse::<u64>().ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use std::sync::Arc;

    #[test]
    fn parses_realm_points_row() {
        let html = "<table><tr><td>Realm Points</td><td>1,234,567</td></tr></table>";
        assert_eq!(parse_realm_points(html), Some(1_234_567));
    }

    #[test]
    fn missing_row_yields_none() {
        let html = "<table><tr><td>Kills</td><td>12</td></tr></table>";
        assert_eq!(parse_realm_points(html), None);
    }

    fn player() -> TrackedPlayer {
        TrackedPlayer {
            id: "p1".to_string(),
            name: "Bobdole".to_string(),
            realm: "Midgard".to_string(),
            url: "https://example.invalid/p1".to_string(),
        }
    }

    #[tokio::test]
    async fn first_sighting_seeds_baseline() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let webhook = WebhookClient::new(kv.clone()).unwrap();
        let p = player();

        let outcome = apply_state_machine(
            kv.as_ref(),
            &webhook,
            &["https://example.invalid/hook".to_string()],
            &p,
            1000,
            Duration::from_secs(1800),
            500,
            Duration::from_secs(600),
        )
        .await
        .unwrap();

        assert_eq!(outcome, None);
        assert_eq!(kv.get(&keys::rp("p1")).await.unwrap(), Some("1000".to_string()));
    }

    #[tokio::test]
    async fn rollover_resets_baseline_and_session() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        kv.put(&keys::rp("p1"), "5000", None).await.unwrap();
        kv.put(&keys::rp_active("p1"), "1", Some(Duration::from_secs(1800))).await.unwrap();
        let webhook = WebhookClient::new(kv.clone()).unwrap();
        let p = player();

        let (notified, rolled_over) = apply_state_machine(
            kv.as_ref(),
            &webhook,
            &["https://example.invalid/hook".to_string()],
            &p,
            100,
            Duration::from_secs(1800),
            500,
            Duration::from_secs(600),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(!notified);
        assert!(rolled_over);
        assert_eq!(kv.get(&keys::rp("p1")).await.unwrap(), Some("100".to_string()));
        assert!(!kv.exists(&keys::rp_active("p1")).await.unwrap());
    }
}
