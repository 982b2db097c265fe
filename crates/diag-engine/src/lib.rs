//! Diagnostic Adapter Engine
//!
//! Connects to an ELM327-compatible adapter over Bluetooth, WiFi or USB,
//! brings it up, discovers the vehicle's ECUs and serves ad-hoc commands,
//! trouble codes and periodic parameter monitoring.

pub mod config;
mod manager;
pub mod transport;

pub use config::{AdapterConfig, EngineConfig, LogFormat};
pub use manager::{Connection, ConnectionManager, ConnectionState};
pub use transport::{
    ConnectionParams, SimulatedTransportFactory, SystemTransportFactory, TransportFactory,
    TransportKind,
};

pub use obd_protocol::{
    ChannelError, CommandReply, ConnectionError, DtcRecord, ParameterSample, ProtocolState,
};
pub use obd_scheduler::{MonitorError, SessionHandle};

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize logging; `RUST_LOG` overrides the default `info` filter
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    match format {
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.finish()),
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
    }
    .expect("Failed to set tracing subscriber");
}
