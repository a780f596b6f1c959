use crate::kv::KvStore;
use eyre::Result;

fn key(name: &str) -> String {
    format!("metrics:{name}")
}

pub async fn incr(kv: &dyn KvStore, name: &str) -> Result<()> {
    let key = key(name);
    let current: u64 = kv.get(&key).await?.and_then(|v| v.parse().ok()).unwrap_or(0);
    kv.put(&key, &(current + 1).to_string(), None).await
}

pub async fn snapshot(kv: &dyn KvStore) -> Result<Vec<(String, u64)>> {
    let mut out = Vec::new();
    for key in kv.list_prefix("metrics:", 1000).await? {
        let value = kv.get(&key).await?.and_then(|v| v.parse().ok()).unwrap_or(0);
        out.push((key.trim_start_matches("metrics:").to_string(), value));
    }
    Ok(out)
}

pub async fn clear(kv: &dyn KvStore) -> Result<usize> {
    let keys = kv.list_prefix("metrics:", 1000).await?;
    for key in &keys {
        kv.delete(key).await?;
    }
    Ok(keys.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[tokio::test]
    async fn increments_and_clears() {
        let kv = MemoryKvStore::new();
        incr(&kv, "discord_ratelimit").await.unwrap();
        incr(&kv, "discord_ratelimit").await.unwrap();
        let snap = snapshot(&kv).await.unwrap();
        assert_eq!(snap, vec![("discord_ratelimit".to_string(), 2)]);
        assert_eq!(clear(&kv).await.unwrap(), 1);
        assert!(snapshot(&kv).await.unwrap().is_empty());
    }
}
