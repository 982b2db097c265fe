//! Diagnostic Adapter Engine - Main Entry Point
//!
//! Usage: `diag-engine [config.toml]`

use anyhow::Context;
use diag_engine::{
    init_logging, ConnectionManager, ConnectionState, EngineConfig, SimulatedTransportFactory,
    SystemTransportFactory, TransportFactory,
};
use obd_protocol::mock::MockAdapter;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = EngineConfig::load(path.as_deref()).context("loading configuration")?;
    init_logging(config.log_format);

    info!("=== Diagnostic Adapter Engine v{} ===", env!("CARGO_PKG_VERSION"));

    if config.adapter.simulated {
        let adapter = MockAdapter::new().live().with_latency(Duration::from_millis(30));
        run(ConnectionManager::new(SimulatedTransportFactory::new(adapter), config)).await
    } else {
        run(ConnectionManager::new(SystemTransportFactory, config)).await
    }
}

async fn run<F: TransportFactory>(manager: ConnectionManager<F>) -> anyhow::Result<()> {
    let protocol_state = manager
        .connect_configured()
        .await
        .context("connecting to adapter")?;
    println!("{}", serde_json::to_string_pretty(&protocol_state)?);

    match manager.read_dtcs().await {
        Ok(dtcs) => println!("{}", serde_json::to_string_pretty(&dtcs)?),
        Err(e) => warn!("Reading trouble codes failed: {}", e),
    }

    let config = manager.config();
    let session = manager
        .start_monitoring(config.monitor_pids.clone(), config.monitor_interval_ms)
        .await?;
    let mut samples = session.subscribe();
    let mut states = manager.state_changes();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                let state = *states.borrow_and_update();
                if changed.is_err() || state == ConnectionState::Failed {
                    warn!(?state, "Adapter connection lost");
                    break;
                }
            }
            sample = samples.recv() => match sample {
                Ok(sample) => println!("{}", serde_json::to_string(&sample)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Output fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down");
    manager.stop_monitoring();
    manager.disconnect().await?;
    Ok(())
}
