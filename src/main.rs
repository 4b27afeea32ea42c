use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use meter_agent::agent::Agent;
use meter_agent::channels::{WsChannel, WsChannelConfig};
use meter_agent::config::AgentConfig;
use meter_agent::identity::WorkerIdentity;
use meter_agent::logic::{LogicStore, ManifestCompiler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = AgentConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: invalid configuration: {}", e);
        std::process::exit(1);
    });

    // Keeps the file writer flushing until exit
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let identity = WorkerIdentity::load_or_create(&config.identity_path)
        .await
        .with_context(|| {
            format!(
                "failed to load worker identity from {}",
                config.identity_path.display()
            )
        })?;

    eprintln!("⚡ Meter Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Machine: {}", identity.machine_id());
    eprintln!("   Coordinator: {}", config.coordinator_url);
    eprintln!("   Logic: {}", config.logic_path.display());
    eprintln!(
        "   Tasks: max {} parallel, timeout {}\n",
        config.max_parallel_tasks,
        config
            .task_timeout
            .map(|t| format!("{}s", t.as_secs()))
            .unwrap_or_else(|| "none".to_string())
    );

    // ── Logic module ─────────────────────────────────────────────────────
    let store = Arc::new(LogicStore::new(
        config.logic_path.clone(),
        Arc::new(ManifestCompiler::new()),
    ));
    match store.load().await {
        Ok(module) if module.is_ready() => {}
        Ok(_) => tracing::warn!("Logic module on disk is incomplete; waiting for an update"),
        Err(e) => tracing::warn!(error = %e, "No usable logic module yet; waiting for an update"),
    }

    // ── Channel ──────────────────────────────────────────────────────────
    let channel = Arc::new(WsChannel::new(
        WsChannelConfig {
            url: config.coordinator_url.clone(),
            reconnect_min: config.reconnect_min,
            reconnect_max: config.reconnect_max,
        },
        identity,
    ));

    // ── Agent ────────────────────────────────────────────────────────────
    let agent = Agent::new(config, channel, store);
    agent.run().await?;

    Ok(())
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "meter-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
