use crate::diff::{capture, ua};
use crate::keys;
use crate::kv::{KvStore, MemoryKvStore};
use crate::model::{Event, EventKind, Keep, KeepKind, Realm, Snapshot};
use crate::webhook::WebhookClient;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

fn keep(id: &str, owner: Realm, under_attack: bool) -> Keep {
    Keep {
        id: id.to_string(),
        name: "Caer Benowyc".to_string(),
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

fn captured_event(keep_id: &str, new_owner: Realm, at: chrono::DateTime<Utc>) -> Event {
    Event {
        at,
        kind: EventKind::Captured,
        keep_id: keep_id.to_string(),
        keep_name: "Caer Benowyc".to_string(),
        new_owner: Some(new_owner),
        leader: None,
        raw: String::new(),
    }
}

#[tokio::test]
async fn scenario_1_cold_start_capture_seeds_baseline_without_alert() {
    let kv: std::sync::Arc<dyn KvStore> = std::sync::Arc::new(MemoryKvStore::new());
    let webhook = WebhookClient::new(kv.clone()).unwrap();
    let now = Utc::now();
    let snap = Snapshot {
        updated_at: now,
        keeps: vec![keep("caer-benowyc", Realm::Midgard, false)],
        events: vec![captured_event("caer-benowyc", Realm::Midgard, now - ChronoDuration::minutes(2))],
        df_owner: Realm::Midgard,
    };

    let stats = capture::process(
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
async fn scenario_2_true_capture_delivers_and_sets_suppressor() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let kv: std::sync::Arc<dyn KvStore> = std::sync::Arc::new(MemoryKvStore::new());
    kv.put(&keys::own("caer-benowyc"), "Albion", None).await.unwrap();
    let webhook = WebhookClient::new(kv.clone()).unwrap();
    let now = Utc::now();
    let snap = Snapshot {
        updated_at: now,
        keeps: vec![keep("caer-benowyc", Realm::Midgard, false)],
        events: vec![captured_event("caer-benowyc", Realm::Midgard, now - ChronoDuration::minutes(2))],
        df_owner: Realm::Midgard,
    };

    let stats = capture::process(
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
    assert!(kv.exists(&keys::ua_suppress("caer-benowyc")).await.unwrap());
    assert!(kv.exists(&keys::cap_once_owner("caer-benowyc", "Midgard")).await.unwrap());
}

#[tokio::test]
async fn scenario_3_flap_suppression_after_capture_blocks_ua_alert() {
    let kv: std::sync::Arc<dyn KvStore> = std::sync::Arc::new(MemoryKvStore::new());
    kv.put(&keys::ua_suppress("caer-benowyc"), "1", Some(Duration::from_secs(120))).await.unwrap();
    kv.put(&keys::ua_state("caer-benowyc"), &Utc::now().to_rfc3339(), Some(Duration::from_secs(7 * 60 * 4)))
        .await
        .unwrap();
    let webhook = WebhookClient::new(kv.clone()).unwrap();
    let snap = Snapshot {
        updated_at: Utc::now(),
        keeps: vec![keep("caer-benowyc", Realm::Midgard, true)],
        events: vec![],
        df_owner: Realm::Midgard,
    };

    let stats = ua::process(
        kv.as_ref(),
        &webhook,
        &["https://example.invalid/hook".to_string()],
        &snap,
        Duration::from_secs(7 * 60 * 4),
    )
    .await
    .unwrap();

    assert_eq!(stats.rising_edges, 0);
    assert_eq!(kv.get(&keys::ua_state("caer-benowyc")).await.unwrap(), Some("0".to_string()));
}

#[tokio::test]
async fn scenario_5_player_ping_notifies_when_session_inactive() {
    use crate::config::TrackedPlayer;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let kv: std::sync::Arc<dyn KvStore> = std::sync::Arc::new(MemoryKvStore::new());
    kv.put(&keys::rp("saz"), "10000", None).await.unwrap();
    let webhook = WebhookClient::new(kv.clone()).unwrap();

    // Scraper fixture matching the profile page's realm points row shape.
    let profile_html = "<table><tr><td>Realm Points</td><td>10450</td></tr></table>";

    let player = TrackedPlayer {
        id: "saz".to_string(),
        name: "Saz".to_string(),
        realm: "Midgard".to_string(),
        url: "https://example.invalid/saz".to_string(),
    };

    // Drive the same parsing function the fetch loop uses, then the shared
    // state machine, without a real network call for the profile fetch.
    let rp = crate::diff::players::parse_realm_points(profile_html).unwrap();
    assert_eq!(rp, 10450);

    let outcome = crate::diff::players::apply_state_machine(
        kv.as_ref(),
        &webhook,
        &[format!("{}/webhook", server.uri())],
        &player,
        rp,
        Duration::from_secs(30 * 60),
        500,
        Duration::from_secs(10 * 60),
    )
    .await
    .unwrap();

    assert_eq!(outcome, Some((true, false)));
    assert_eq!(kv.get(&keys::rp("saz")).await.unwrap(), Some("10450".to_string()));
    assert!(kv.exists(&keys::rp_active("saz")).await.unwrap());
}

#[tokio::test]
async fn scenario_6_player_rollover_resets_session() {
    use crate::config::TrackedPlayer;

    let kv: std::sync::Arc<dyn KvStore> = std::sync::Arc::new(MemoryKvStore::new());
    kv.put(&keys::rp("saz"), "10450", None).await.unwrap();
    kv.put(&keys::rp_active("saz"), "1", Some(Duration::from_secs(1800))).await.unwrap();
    let webhook = WebhookClient::new(kv.clone()).unwrap();

    let player = TrackedPlayer {
        id: "saz".to_string(),
        name: "Saz".to_string(),
        realm: "Midgard".to_string(),
        url: "https://example.invalid/saz".to_string(),
    };

    let outcome = crate::diff::players::apply_state_machine(
        kv.as_ref(),
        &webhook,
        &["https://example.invalid/hook".to_string()],
        &player,
        0,
        Duration::from_secs(30 * 60),
        500,
        Duration::from_secs(10 * 60),
    )
    .await
    .unwrap();

    assert_eq!(outcome, Some((false, true)));
    assert_eq!(kv.get(&keys::rp("saz")).await.unwrap(), Some("0".to_string()));
    assert!(!kv.exists(&keys::rp_active("saz")).await.unwrap());
}
