//! Transport selection and byte-stream factories

use obd_protocol::mock::{MockAdapter, MockHandle};
use obd_protocol::{BoxedStream, ConnectionError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tracing::info;

/// Physical link to the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    #[serde(rename = "bluetooth")]
    Bluetooth,
    #[serde(rename = "wifi")]
    WiFi,
    #[serde(rename = "usb")]
    Usb,
}

/// Where and how to reach the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Serial device path (USB, Bluetooth RFCOMM) or `host:port` (WiFi)
    pub address: String,
    /// Serial speed; ignored for WiFi
    pub baud_rate: u32,
}

/// Future returned by [`TransportFactory::open`]
pub type OpenFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxedStream, ConnectionError>> + Send + 'a>>;

/// Opens the byte-stream for a transport kind
pub trait TransportFactory: Send + Sync {
    fn open<'a>(&'a self, kind: TransportKind, params: &'a ConnectionParams) -> OpenFuture<'a>;
}

/// Real adapters: serial ports for USB and Bluetooth, TCP for WiFi
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTransportFactory;

impl TransportFactory for SystemTransportFactory {
    fn open<'a>(&'a self, kind: TransportKind, params: &'a ConnectionParams) -> OpenFuture<'a> {
        Box::pin(async move {
            info!(?kind, address = %params.address, "Opening adapter transport");
            match kind {
                TransportKind::Usb | TransportKind::Bluetooth => open_serial(params),
                TransportKind::WiFi => open_tcp(params).await,
            }
        })
    }
}

fn open_serial(params: &ConnectionParams) -> Result<BoxedStream, ConnectionError> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(params.address.as_str(), params.baud_rate)
        .open_native_async()
        .map_err(|e| ConnectionError::Transport(format!("{}: {}", params.address, e)))?;
    Ok(Box::new(port))
}

async fn open_tcp(params: &ConnectionParams) -> Result<BoxedStream, ConnectionError> {
    let stream = tokio::net::TcpStream::connect(params.address.as_str())
        .await
        .map_err(|e| ConnectionError::Transport(format!("{}: {}", params.address, e)))?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

/// In-process simulated adapter, whatever the transport kind
pub struct SimulatedTransportFactory {
    adapter: MockAdapter,
    handles: Mutex<Vec<MockHandle>>,
}

impl SimulatedTransportFactory {
    pub fn new(adapter: MockAdapter) -> Self {
        Self {
            adapter,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Observer for the most recently opened simulated adapter
    pub fn last_handle(&self) -> Option<MockHandle> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .cloned()
    }
}

impl TransportFactory for SimulatedTransportFactory {
    fn open<'a>(&'a self, kind: TransportKind, params: &'a ConnectionParams) -> OpenFuture<'a> {
        Box::pin(async move {
            info!(?kind, address = %params.address, "Opening simulated adapter");
            let (stream, handle) = self.adapter.clone().spawn();
            self.handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(handle);
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serial_open_failure_is_transport_error() {
        let params = ConnectionParams {
            address: "/dev/does-not-exist-obd".to_string(),
            baud_rate: 38400,
        };
        let result = SystemTransportFactory.open(TransportKind::Usb, &params).await;
        assert!(matches!(result, Err(ConnectionError::Transport(_))));
    }

    #[tokio::test]
    async fn test_simulated_factory_records_handles() {
        let factory = SimulatedTransportFactory::new(MockAdapter::new());
        assert!(factory.last_handle().is_none());

        let params = ConnectionParams {
            address: "sim".to_string(),
            baud_rate: 0,
        };
        factory.open(TransportKind::WiFi, &params).await.unwrap();
        assert!(factory.last_handle().unwrap().commands().is_empty());
    }

    #[test]
    fn test_kind_names() {
        let kind: TransportKind = serde_json::from_str("\"wifi\"").unwrap();
        assert_eq!(kind, TransportKind::WiFi);
    }
}
