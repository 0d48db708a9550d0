use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::signal::unix::{SignalKind, signal};

use prediction_state::{
    cli::config_path_from_args,
    config::Config,
    logging::init_tracing,
    predictions::{PredictionSnapshot, PredictionStore},
    service::{HttpPredictionService, PredictionServicePort},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path_from_args()?;
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let logging = init_tracing(&config.logging)?;

    let vendor_id = config
        .watch
        .vendor_id
        .clone()
        .filter(|vendor_id| !vendor_id.trim().is_empty())
        .ok_or_else(|| anyhow!("watch.vendor_id must be set"))?;

    let service: Arc<dyn PredictionServicePort> = Arc::new(
        HttpPredictionService::new(&config.service)
            .context("failed to construct prediction service client")?,
    );
    let store = PredictionStore::for_vendor(service, config.store.clone(), vendor_id.as_str())
        .await
        .with_context(|| format!("failed to open prediction scope for vendor {vendor_id}"))?;

    let mut state_rx = store.watch_state();
    let reporter = tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let snapshot = state_rx.borrow_and_update().clone();
            report(&snapshot);
        }
    });

    if !config.watch.item_ids.is_empty() {
        store.fetch_batch(config.watch.item_ids.iter().cloned()).await?;
    }

    let mut sigint =
        signal(SignalKind::interrupt()).context("unable to listen for SIGINT (Ctrl+C)")?;
    let mut sigterm = signal(SignalKind::terminate()).context("unable to listen for SIGTERM")?;
    let signal_name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    tracing::info!(
        target: "predictions",
        signal = signal_name,
        run_id = logging.run_id(),
        "shutdown_requested"
    );
    store.dispose();
    drop(store);
    reporter.abort();
    Ok(())
}

fn report(snapshot: &PredictionSnapshot) {
    tracing::info!(
        target: "predictions",
        vendor_id = snapshot.vendor_id.as_deref().unwrap_or("-"),
        status = ?snapshot.status,
        prediction_count = snapshot.predictions.len(),
        last_error = snapshot.last_error.as_deref().unwrap_or("-"),
        disposed = snapshot.disposed,
        "prediction_state_changed"
    );
    for (item_id, entry) in snapshot.predictions.iter() {
        tracing::debug!(
            target: "predictions",
            item_id = %item_id,
            prediction = %entry.value(),
            "prediction_entry"
        );
    }
}
