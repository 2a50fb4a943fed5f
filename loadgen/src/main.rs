use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use towerload_loadgen::client::{CognitoIdentity, ReqwestTransport, Transport};
use towerload_loadgen::{Config, Metrics, Runner, screen};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the Prometheus recorder, serving it when a listen address is set
fn setup_prometheus_metrics(config: &Config) -> anyhow::Result<()> {
    let builder = PrometheusBuilder::new();
    match config.metrics_listen {
        Some(addr) => {
            builder
                .with_http_listener(addr)
                .install()
                .context("Failed to install Prometheus exporter")?;
            info!("Prometheus metrics on http://{}/metrics", addr);
        }
        None => {
            builder
                .install_recorder()
                .context("Failed to install Prometheus recorder")?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from the scenario file and environment
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_directive().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate().context("Invalid configuration")?;
    screen::validate(&config).context("Invalid screen tables")?;
    info!(
        "Loaded configuration: baseUrl={}, task={}, vusMax={}, playAsync={}",
        config.base_url, config.task_index, config.vus_max, config.play_async
    );
    if let Some(ref test_id) = config.test_id {
        info!("Test id: {}", test_id);
    }
    if !config.forced_actions.is_empty() {
        warn!("Forced action sequence active: {:?}", config.forced_actions);
    }

    setup_prometheus_metrics(&config)?;

    let transport: Arc<dyn Transport> = Arc::new(
        ReqwestTransport::new(config.request_timeout, concat!("towerload/", env!("CARGO_PKG_VERSION")))
            .context("Failed to build HTTP client")?,
    );
    let identity = Arc::new(CognitoIdentity::new(transport.clone(), &config.auth));
    let metrics = Arc::new(Metrics::new());

    let runner = Runner::new(config, transport, identity, metrics).context("Failed to plan the run")?;

    // Ctrl-C ends the run the same way the deadline does
    let cancel = runner.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping all VUs");
            cancel.cancel();
        }
    });

    match runner.run().await {
        Ok(summary) => {
            info!(
                "Run complete: {} finished, {} aborted",
                summary.finished, summary.aborted
            );
            Ok(())
        }
        Err(e) => {
            error!("Run failed: {}", e);
            Err(e).context("Load test failed")
        }
    }
}
