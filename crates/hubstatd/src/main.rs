//! hubstatd — leaf-hub status aggregation daemon.
//!
//! `hubstatd send <envelope.json> [hub]` instead fragments one bundle with
//! the configured producer settings and sends it to the configured address.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use hubstat_core::config::HubstatConfig;
use hubstat_core::wire::hub_hash;
use hubstat_core::{BundleEnvelope, TransportMessage};
use hubstat_services::{
    sweep_loop, Committer, ConflationManager, FileSink, Fragmenter, MessageAssembler, OffsetStore,
    PipelineStats, Receiver, RetryPolicy, Transport, WorkerPool,
};

mod bundles;
mod udp;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = HubstatConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = HubstatConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        HubstatConfig::default()
    });

    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some("send") {
        let file = args
            .next()
            .context("usage: hubstatd send <envelope.json> [hub]")?;
        let destination = args.next().unwrap_or_default();
        return send_file(&config, &file, &destination).await;
    }

    tracing::info!(
        hub = %config.transport.hub_name,
        topic = %config.transport.topic,
        "hubstatd starting"
    );

    // Conflation
    let stats = PipelineStats::new();
    let sink = Arc::new(FileSink::new(&config.storage.sink_path));
    tracing::info!(path = %config.storage.sink_path.display(), "bundle sink");
    let manager = {
        let mut m = ConflationManager::new(stats.clone());
        bundles::register_all(&mut m, sink).context("invalid bundle registrations")?;
        Arc::new(m)
    };

    let assembler = Arc::new(MessageAssembler::new(
        config.assembler.ttl(),
        config.assembler.dedup_capacity,
        stats.clone(),
    ));

    // Transport
    let offsets = OffsetStore::open(&config.transport.offsets_path)?;
    let transport: Arc<dyn Transport> = Arc::new(
        udp::UdpTransport::bind(
            &config.transport.bind_addr,
            config.transport.topic.clone(),
            offsets,
        )
        .await?,
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    // The committer stops only after the workers have drained.
    let (commit_stop_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let workers = WorkerPool::new(
        manager.clone(),
        RetryPolicy::from(&config.conflation),
        config.conflation.worker_count(),
    )
    .spawn(&shutdown_tx);

    let receiver_task = tokio::spawn(
        Receiver::new(
            transport.clone(),
            assembler.clone(),
            manager.clone(),
            hub_hash(&config.transport.hub_name),
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let committer_task = tokio::spawn(
        Committer::new(
            manager.clone(),
            assembler.clone(),
            transport.clone(),
            config.conflation.commit_interval(),
            commit_stop_tx.subscribe(),
        )
        .run(),
    );

    let sweeper_task = tokio::spawn(sweep_loop(
        assembler.clone(),
        config.assembler.sweep_interval(),
        shutdown_tx.subscribe(),
    ));

    let stats_printer = {
        let stats = stats.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                stats.log();
                tracing::info!(
                    sources = manager.unit_count(),
                    ready = manager.queue().len(),
                    "conflation snapshot"
                );
            }
        })
    };

    if config.api.enabled {
        let state = hubstat_api::ApiState::new(manager.clone(), assembler.clone());
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = hubstat_api::serve(state, port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = receiver_task       => tracing::error!("receiver exited: {:?}", r),
        r = sweeper_task        => tracing::error!("sweeper exited: {:?}", r),
        r = stats_printer       => tracing::error!("stats printer exited: {:?}", r),
    }
    let _ = shutdown_tx.send(());

    // Let in-flight handlers finish, then take the final commit.
    for worker in workers {
        let _ = worker.await;
    }
    let _ = commit_stop_tx.send(());
    match committer_task.await {
        Ok(Err(e)) => tracing::error!(error = %e, "committer failed"),
        Err(e) => tracing::error!(error = %e, "committer task failed"),
        Ok(Ok(())) => {}
    }
    stats.log();

    Ok(())
}

async fn send_file(config: &HubstatConfig, file: &str, destination: &str) -> Result<()> {
    let body = std::fs::read(file).with_context(|| format!("failed to read {file}"))?;
    let envelope: BundleEnvelope =
        serde_json::from_slice(&body).with_context(|| format!("failed to parse {file}"))?;
    let message = TransportMessage::from_envelope(&envelope, destination)?;
    let fragmenter = Fragmenter::from(&config.transport);
    let sent = udp::send_message(&config.transport.bind_addr, &message, &fragmenter).await?;
    tracing::info!(
        source = %envelope.source,
        bundle_type = %envelope.bundle_type,
        version = %envelope.version,
        fragments = sent,
        encoding = ?fragmenter.encoding,
        "bundle sent"
    );
    Ok(())
}
