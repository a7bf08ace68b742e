use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use jellyporter_config::Config;
use jellyporter_core::SyncEngine;
use jellyporter_events::WebhookServer;
use jellyporter_jellyfin::{JellyfinClient, MediaServer};
use jellyporter_store::Store;

use crate::metrics;

const ONE_SHOT_DEADLINE: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

pub async fn run(once: bool, config_flag: Option<PathBuf>) -> Result<()> {
    let config_path = jellyporter_config::config_path(config_flag);
    info!("Using config file {}", config_path.display());

    let cfg = Config::load(&config_path).wrap_err("failed to load config")?;
    cfg.validate().wrap_err("configuration invalid")?;

    let handle = metrics::install_recorder().map_err(|e| eyre!("{}", e))?;
    metrics::record_startup();

    let store = Arc::new(
        Store::connect(&cfg.database.path)
            .await
            .wrap_err("could not create sqlite db")?,
    );

    let mut servers: HashMap<String, Arc<dyn MediaServer>> = HashMap::new();
    for (name, client_cfg) in &cfg.clients {
        let api_key = client_cfg
            .api_key()
            .wrap_err_with(|| format!("could not gather apikey for server {name}"))?;
        let client = JellyfinClient::new(&client_cfg.url, api_key, client_cfg.user.clone())
            .map_err(|e| eyre!("could not build client for server {name}: {e}"))?;
        servers.insert(name.clone(), Arc::new(client));
    }

    let engine = Arc::new(
        SyncEngine::new(servers, store, &cfg)
            .map_err(|e| eyre!("could not build sync engine: {e}"))?,
    );

    if once {
        run_once(&engine, &cfg, &handle).await
    } else {
        run_daemon(engine, cfg, handle).await
    }
}

async fn run_once(engine: &SyncEngine, cfg: &Config, handle: &PrometheusHandle) -> Result<()> {
    let shutdown = CancellationToken::new();
    let outcome = tokio::time::timeout(ONE_SHOT_DEADLINE, engine.sync_once(&shutdown)).await;

    // A failed metrics dump is logged only; the exit code reflects the cycle.
    if let Some(dir) = &cfg.metrics_path {
        if let Err(err) = metrics::write_metrics(dir, handle) {
            error!(error = %err, "could not write metrics");
        }
    }

    match outcome {
        Ok(result) => result.map_err(|e| eyre!("{}", e)),
        Err(_) => Err(eyre!("sync did not finish within {:?}", ONE_SHOT_DEADLINE)),
    }
}

async fn run_daemon(engine: Arc<SyncEngine>, cfg: Config, handle: PrometheusHandle) -> Result<()> {
    let shutdown = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel(1);

    let mut tasks = JoinSet::new();

    if let Some(webhook_cfg) = cfg.events.as_ref().and_then(|events| events.webhook.clone()) {
        let webhook = build_webhook(&webhook_cfg).map_err(|e| eyre!("{}", e))?;
        let events_tx = events_tx.clone();
        let token = shutdown.clone();
        tasks.spawn(async move {
            if let Err(err) = webhook.listen(events_tx, token).await {
                error!(error = %err, "error listening on event source");
            }
        });
    }

    {
        let addr = cfg.metrics_addr.clone();
        let handle = handle.clone();
        let token = shutdown.clone();
        tasks.spawn(async move {
            if let Err(err) = metrics::serve(addr, handle, token).await {
                error!(error = %err, "could not start metrics server");
            }
        });
    }

    {
        let engine = engine.clone();
        let token = shutdown.clone();
        tasks.spawn(engine.run(events_rx, token));
    }

    wait_for_signal().await?;
    info!("Received signal to quit");
    shutdown.cancel();
    drop(events_tx);

    info!(
        "Waiting {:?} for components to shut down gracefully",
        SHUTDOWN_GRACE_PERIOD
    );
    let drained = tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    match drained {
        Ok(()) => info!("All components shut down gracefully within the timeout"),
        Err(_) => {
            error!("Killing process forcefully");
            tasks.abort_all();
        }
    }

    Ok(())
}

fn build_webhook(
    cfg: &jellyporter_config::WebhookConfig,
) -> std::result::Result<WebhookServer, jellyporter_events::WebhookError> {
    let mut webhook = WebhookServer::new(&cfg.addr)?;

    if let Some(path) = &cfg.path {
        webhook = webhook.with_path(path)?;
    }

    if let (Some(cert), Some(key)) = (&cfg.tls_cert_file, &cfg.tls_key_file) {
        webhook = webhook.with_tls(cert.clone(), key.clone())?;
    }

    Ok(webhook)
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).wrap_err("could not install signal handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).wrap_err("could not install signal handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).wrap_err("could not install signal handler")?;
    let mut quit = signal(SignalKind::quit()).wrap_err("could not install signal handler")?;

    tokio::select! {
        _ = hangup.recv() => {}
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .wrap_err("could not listen for ctrl-c")?;
    Ok(())
}
