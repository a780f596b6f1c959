use crate::keys;
use crate::kv::KvStore;
use chrono::{DateTime, Utc};
use eyre::Result;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const BASE_INTERVAL_MS: u64 = 2000;
const GLOBAL_PACING_MS: u64 = 6000;
const JITTER_MS_RANGE: std::ops::Range<u64> = 200..700;
const BATCH_SIZE: usize = 10;
const BATCH_GAP: Duration = Duration::from_millis(2500);
const NETWORK_ERROR_COOLDOWN: Duration = Duration::from_secs(5);
const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Ua,
    Capture,
    Players,
}

impl Channel {
    fn as_str(&self) -> &'static str {
        match self {
            Channel::Ua => "ua",
            Channel::Capture => "capture",
            Channel::Players => "players",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    pub title: String,
    pub color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<Footer>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Thumbnail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Footer {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Field {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Thumbnail {
    pub url: String,
}

#[derive(Serialize)]
struct Payload<'a> {
    username: &'a str,
    embeds: &'a [Embed],
}

#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    kv: Arc<dyn KvStore>,
}

impl WebhookClient {
    pub fn new(kv: Arc<dyn KvStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, kv })
    }

    /// Delivers `embeds` on `channel` through `endpoints`, batched into
    /// groups of ≤10, waiting ~2.5s between batches. Returns whether every
    /// batch was delivered.
    pub async fn deliver(
        &self,
        channel: Channel,
        endpoints: &[String],
        username: &str,
        embeds: &[Embed],
    ) -> Result<bool> {
        if embeds.is_empty() {
            return Ok(true);
        }

        let gate = keys::discord_gate(channel.as_str());
        if !self.kv.claim(&gate, keys::DISCORD_GATE_TTL).await? {
            debug!(channel = channel.as_str(), "channel gate busy, skipping delivery attempt");
            return Ok(false);
        }

        let mut all_ok = true;
        let chunks: Vec<&[Embed]> = embeds.chunks(BATCH_SIZE).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let ok = self.send_chunk(endpoints, username, chunk).await?;
            all_ok &= ok;
            if i + 1 < chunks.len() {
                tokio::time::sleep(BATCH_GAP).await;
            }
        }

        self.kv.delete(&gate).await?;
        Ok(all_ok)
    }

    /// Tries `endpoints` in order for one chunk until one succeeds, all are
    /// cooled down, or the global cooldown aborts the attempt entirely.
    async fn send_chunk(&self, endpoints: &[String], username: &str, chunk: &[Embed]) -> Result<bool> {
        if self.global_cooldown_active().await? {
            warn!("global webhook cooldown active, aborting delivery attempt");
            return Ok(false);
        }

        let body = Payload { username, embeds: chunk };

        for endpoint in endpoints {
            let hash = path_hash(endpoint);

            if self.cooldown_active(&keys::discord_cooldown(&hash)).await? {
                debug!(endpoint = %hash, "endpoint cooldown active, skipping");
                crate::metrics::incr(self.kv.as_ref(), "discord_skip").await?;
                continue;
            }

            self.wait_for_global_pacing().await?;
            self.wait_for_endpoint_pacing(&hash).await?;

            let resp = match self.http.post(endpoint).json(&body).send().await {
                Ok(r) => r,
                Err(err) => {
                    warn!(endpoint = %hash, error = %err, "webhook network error");
                    self.set_cooldown(&hash, NETWORK_ERROR_COOLDOWN).await?;
                    self.bump_penalty(&hash).await?;
                    crate::metrics::incr(self.kv.as_ref(), "discord_network_error").await?;
                    continue;
                }
            };

            let status = resp.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.handle_rate_limited(&hash, resp).await?;
                continue;
            }
            if status.is_server_error() {
                let retry_after = header_seconds(&resp, "retry-after").unwrap_or(5);
                warn!(endpoint = %hash, %status, "webhook server error");
                self.set_cooldown(&hash, Duration::from_secs(retry_after)).await?;
                self.bump_penalty(&hash).await?;
                crate::metrics::incr(self.kv.as_ref(), "discord_server_error").await?;
                continue;
            }
            if !status.is_success() {
                let body_prefix: String = resp.text().await.unwrap_or_default().chars().take(200).collect();
                warn!(endpoint = %hash, %status, body = %body_prefix, "webhook non-OK response");
                continue;
            }

            self.handle_success(&hash, &resp).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn global_cooldown_active(&self) -> Result<bool> {
        self.cooldown_active(&keys::discord_global_cooldown_until()).await
    }

    async fn cooldown_active(&self, key: &str) -> Result<bool> {
        match self.kv.get(key).await? {
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(until) => Ok(until.with_timezone(&Utc) > Utc::now()),
                Err(_) => Ok(false),
            },
            None => Ok(false),
        }
    }

    async fn set_cooldown(&self, key: &str, ttl: Duration) -> Result<()> {
        let until = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        self.kv.put(key, &until.to_rfc3339(), Some(ttl)).await
    }

    async fn wait_for_global_pacing(&self) -> Result<()> {
        if let Some(last_ms) = self.read_ms(&keys::discord_global_last()).await? {
            let elapsed = Utc::now().timestamp_millis() - last_ms;
            if elapsed < GLOBAL_PACING_MS as i64 {
                tokio::time::sleep(Duration::from_millis((GLOBAL_PACING_MS as i64 - elapsed) as u64)).await;
            }
        }
        Ok(())
    }

    async fn wait_for_endpoint_pacing(&self, hash: &str) -> Result<()> {
        let penalty = self.read_penalty(hash).await?;
        let interval = (BASE_INTERVAL_MS as f64 * (1.0 + 0.5 * penalty as f64)) as u64;
        let jitter = rand::thread_rng().gen_range(JITTER_MS_RANGE);
        tokio::time::sleep(Duration::from_millis(interval + jitter)).await;
        Ok(())
    }

    async fn read_penalty(&self, hash: &str) -> Result<u32> {
        Ok(self
            .kv
            .get(&keys::discord_penalty(hash))
            .await?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
            .min(4))
    }

    async fn bump_penalty(&self, hash: &str) -> Result<()> {
        let next = (self.read_penalty(hash).await? + 1).min(4);
        self.kv
            .put(&keys::discord_penalty(hash), &next.to_string(), Some(keys::DISCORD_PENALTY_TTL))
            .await
    }

    async fn clear_penalty(&self, hash: &str) -> Result<()> {
        self.kv.delete(&keys::discord_penalty(hash)).await
    }

    async fn read_ms(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.kv.get(key).await?.and_then(|v| v.parse::<i64>().ok()))
    }

    async fn handle_rate_limited(&self, hash: &str, resp: reqwest::Response) -> Result<()> {
        let retry_after = header_seconds(&resp, "retry-after")
            .or_else(|| header_seconds(&resp, "x-ratelimit-reset-after"));
        let is_global = resp
            .headers()
            .get("x-ratelimit-global")
            .map(|v| v == "true")
            .unwrap_or(false);

        let body_retry_after = resp
            .json::<RateLimitBody>()
            .await
            .ok()
            .and_then(|b| b.retry_after.map(|s| (s.ceil() as u64, b.global.unwrap_or(false))));

        let (secs, global) = match (retry_after, body_retry_after) {
            (Some(s), Some((_, g))) => (s, is_global || g),
            (Some(s), None) => (s, is_global),
            (None, Some((s, g))) => (s, is_global || g),
            (None, None) => (DEFAULT_RATE_LIMIT_COOLDOWN.as_secs(), is_global),
        };

        warn!(endpoint = %hash, secs, global, "webhook rate limited");
        self.set_cooldown(&keys::discord_cooldown(hash), Duration::from_secs(secs)).await?;
        if global {
            self.set_cooldown(&keys::discord_global_cooldown_until(), Duration::from_secs(secs)).await?;
        }
        crate::metrics::incr(self.kv.as_ref(), "discord_ratelimit").await?;
        self.bump_penalty(hash).await
    }

    async fn handle_success(&self, hash: &str, resp: &reqwest::Response) -> Result<()> {
        let remaining = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        if let Some(r) = remaining {
            if r <= 1 {
                if let Some(reset_after) = header_seconds(resp, "x-ratelimit-reset-after") {
                    self.set_cooldown(&keys::discord_cooldown(hash), Duration::from_secs(reset_after)).await?;
                }
            }
        }

        let now_ms = Utc::now().timestamp_millis().to_string();
        self.kv.put(&keys::discord_last(hash), &now_ms, Some(keys::DISCORD_LAST_TTL)).await?;
        self.kv.put(&keys::discord_global_last(), &now_ms, Some(keys::DISCORD_LAST_TTL)).await?;
        crate::metrics::incr(self.kv.as_ref(), "discord_success").await?;
        self.clear_penalty(hash).await
    }
}

#[derive(serde::Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
    global: Option<bool>,
}

fn header_seconds(resp: &reqwest::Response, name: &str) -> Option<u64> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v.ceil() as u64)
}

/// Short, stable, non-reversible identifier for an endpoint URL, so webhook
/// secrets never end up embedded in KV key names.
pub fn path_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_hash_is_stable_and_url_free() {
        let a = path_hash("https://discord.com/api/webhooks/1/secret-token");
        let b = path_hash("https://discord.com/api/webhooks/1/secret-token");
        assert_eq!(a, b);
        assert!(!a.contains("secret-token"));
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn embed_serializes_without_empty_optional_fields() {
        let embed = Embed {
            title: "test".to_string(),
            color: 0xFF0000,
            timestamp: None,
            footer: None,
            fields: vec![],
            thumbnail: None,
            description: None,
        };
        let json = serde_json::to_string(&embed).unwrap();
        assert!(!json.contains("footer"));
        assert!(!json.contains("fields"));
        assert!(!json.contains("thumbnail"));
    }

    #[tokio::test]
    async fn deliver_is_noop_on_empty_embeds() {
        let kv: Arc<dyn KvStore> = Arc::new(crate::kv::MemoryKvStore::new());
        let client = WebhookClient::new(kv).unwrap();
        let ok = client
            .deliver(Channel::Ua, &["https://example.invalid/hook".to_string()], "herald", &[])
            .await
            .unwrap();
        assert!(ok);
    }

    fn test_embed() -> Embed {
        Embed {
            title: "test".to_string(),
            color: 0,
            timestamp: None,
            footer: None,
            fields: vec![],
            thumbnail: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn deliver_succeeds_against_a_healthy_endpoint() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let kv: Arc<dyn KvStore> = Arc::new(crate::kv::MemoryKvStore::new());
        let client = WebhookClient::new(kv.clone()).unwrap();
        let ok = client
            .deliver(Channel::Capture, &[format!("{}/webhook", server.uri())], "herald", &[test_embed()])
            .await
            .unwrap();

        assert!(ok);
        assert!(kv.get(&keys::discord_global_last()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rate_limited_first_endpoint_falls_through_to_second() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&bad)
            .await;

        let good = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&good)
            .await;

        let kv: Arc<dyn KvStore> = Arc::new(crate::kv::MemoryKvStore::new());
        let client = WebhookClient::new(kv.clone()).unwrap();
        let endpoints = vec![format!("{}/webhook", bad.uri()), format!("{}/webhook", good.uri())];
        let ok = client.deliver(Channel::Ua, &endpoints, "herald", &[test_embed()]).await.unwrap();

        assert!(ok);
        let hash = path_hash(&endpoints[0]);
        assert_eq!(client.read_penalty(&hash).await.unwrap(), 1);
        assert!(client.cooldown_active(&keys::discord_cooldown(&hash)).await.unwrap());
    }
}
