mod admin;
mod config;
mod diff;
#[cfg(test)]
mod integration_tests;
mod keys;
mod kv;
mod metrics;
mod model;
mod parser;
mod tick;
mod webhook;

use admin::{AdminArgs, AdminErrorKind};
use clap::Parser;
use config::{Args, EngineConfig};
use eyre::{eyre, Result};
use fs2::FileExt;
use kv::{FileKvStore, KvStore};
use std::fs::OpenOptions;
use std::sync::Arc;
use webhook::WebhookClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_args(&args)?;

    if let Some(parent) = config.state_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create state directory {}: {e}", parent.display()))?;
        }
    }

    // Single-instance guard alongside the state file: two instances sharing
    // one FileKvStore would both rewrite it and silently drop each other's
    // writes.
    let lock_path = config.state_file.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|e| eyre!("herald-alertd already running or lock unavailable ({}): {e}", lock_path.display()))?;
    let _lock_guard = lock_file;

    let kv: Arc<dyn KvStore> = Arc::new(FileKvStore::load_or_init(&config.state_file)?);
    let webhook = WebhookClient::new(kv.clone())?;
    let http = reqwest::Client::builder().timeout(std::time::Duration::from_secs(15)).build()?;

    if let Some(action) = &args.admin {
        let outcome = admin::run(
            AdminArgs {
                action,
                keep: args.keep.as_deref(),
                realm: args.realm.as_deref(),
                prev: args.prev.as_deref(),
            },
            &http,
            kv.as_ref(),
            &webhook,
            &config,
        )
        .await;

        match outcome {
            Ok(result) => {
                println!("{}", serde_json::json!({"ok": true, "result": result}));
                return Ok(());
            }
            Err(err) => {
                println!("{}", serde_json::json!({"ok": false, "error": err.to_string()}));
                // Mirrors a 4xx/502 split: a single exit code byte can't carry an
                // HTTP status, so bad-request and upstream failures get distinct
                // small codes instead, everything else falls back to 1.
                let code = match err.kind {
                    AdminErrorKind::BadRequest => 4,
                    AdminErrorKind::Upstream => 52,
                    AdminErrorKind::Internal => 1,
                };
                std::process::exit(code);
            }
        }
    }

    tracing::info!(
        warmap_url = %config.warmap_url,
        poll_seconds = config.poll_interval.as_secs(),
        ua_webhooks = config.ua_webhooks.len(),
        capture_webhooks = config.capture_webhooks.len(),
        tracked_players = config.tracked_players.len(),
        once = config.once,
        "herald-alertd starting"
    );

    loop {
        match tick::run_tick(&http, kv.clone(), &webhook, &config).await {
            Ok(summary) => tracing::debug!(?summary, "tick returned"),
            Err(err) => tracing::error!(error = %err, "tick failed"),
        }

        if config.once {
            break;
        }

        tokio::time::sleep(config.poll_interval).await;
    }

    Ok(())
}
