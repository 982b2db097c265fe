//! Connection lifecycle
//!
//! [`ConnectionManager`] owns the single adapter connection of an engine
//! instance: it opens the transport, runs bring-up and discovery, hands out
//! ad-hoc commands and the monitoring scheduler, and tears everything down
//! again on disconnect.

use crate::config::EngineConfig;
use crate::transport::{ConnectionParams, TransportFactory, TransportKind};
use obd_protocol::{
    ChannelError, CommandChannel, CommandReply, ConnectionError, DtcRecord, EcuDiscovery,
    ObdClient, ProtocolInitializer, ProtocolState,
};
use obd_scheduler::{MonitorError, MonitoringScheduler, SessionHandle};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Lifecycle state of the adapter connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Configuring,
    Discovering,
    Ready,
    Disconnecting,
    Failed,
}

/// Snapshot of the current connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub adapter_id: String,
    pub transport: TransportKind,
    pub address: String,
    pub state: ConnectionState,
}

/// Components that exist only while a connection is up
struct Link {
    channel: Arc<CommandChannel>,
    client: ObdClient,
    scheduler: MonitoringScheduler,
    protocol_state: ProtocolState,
    watcher: JoinHandle<()>,
}

struct Target {
    adapter_id: String,
    transport: TransportKind,
    address: String,
}

/// Adapter connection engine
pub struct ConnectionManager<F> {
    factory: F,
    config: EngineConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    lifecycle: tokio::sync::Mutex<()>,
    target: Mutex<Option<Target>>,
    link: Mutex<Option<Arc<Link>>>,
}

impl<F: TransportFactory> ConnectionManager<F> {
    pub fn new(factory: F, config: EngineConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            factory,
            config,
            state: Arc::new(state),
            lifecycle: tokio::sync::Mutex::new(()),
            target: Mutex::new(None),
            link: Mutex::new(None),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Connection state {:?} -> {:?}", previous, next);
        }
    }

    /// Snapshot of the connection, if one exists
    pub fn connection(&self) -> Option<Connection> {
        lock(&self.target).as_ref().map(|target| Connection {
            adapter_id: target.adapter_id.clone(),
            transport: target.transport,
            address: target.address.clone(),
            state: self.state(),
        })
    }

    /// Discovery result of the ready connection
    pub fn protocol_state(&self) -> Option<ProtocolState> {
        lock(&self.link).as_ref().map(|link| link.protocol_state.clone())
    }

    fn ready_link(&self) -> Option<Arc<Link>> {
        if self.state() != ConnectionState::Ready {
            return None;
        }
        lock(&self.link).clone()
    }

    /// Connect to the adapter named in the configuration
    pub async fn connect_configured(&self) -> Result<ProtocolState, ConnectionError> {
        let adapter = &self.config.adapter;
        let params = self.config.connection_params();
        self.connect(&adapter.id, adapter.transport, params, None).await
    }

    /// Open the transport, configure the adapter and discover ECUs
    ///
    /// `budget_ms` bounds the whole operation and defaults to the configured
    /// `connect_timeout_ms`. On failure the transport is closed and the state
    /// is `Failed`; a new `connect` may be attempted right away.
    pub async fn connect(
        &self,
        adapter_id: &str,
        transport: TransportKind,
        params: ConnectionParams,
        budget_ms: Option<u64>,
    ) -> Result<ProtocolState, ConnectionError> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ConnectionState::Disconnected => {}
            ConnectionState::Failed => self.teardown().await,
            _ => return Err(ConnectionError::AlreadyConnected),
        }

        *lock(&self.target) = Some(Target {
            adapter_id: adapter_id.to_string(),
            transport,
            address: params.address.clone(),
        });
        self.set_state(ConnectionState::Connecting);

        let budget_ms = budget_ms.unwrap_or(self.config.connect_timeout_ms);
        let outcome = tokio::time::timeout(
            Duration::from_millis(budget_ms),
            self.establish(transport, &params),
        )
        .await
        .unwrap_or(Err(ConnectionError::Timeout(budget_ms)));

        match outcome {
            Ok(link) => {
                let protocol_state = link.protocol_state.clone();
                *lock(&self.link) = Some(Arc::new(link));
                self.set_state(ConnectionState::Ready);
                info!(
                    adapter = adapter_id,
                    protocol = %protocol_state.protocol_name,
                    ecus = protocol_state.ecu_count,
                    "Adapter ready"
                );
                Ok(protocol_state)
            }
            Err(e) => {
                warn!(adapter = adapter_id, error = %e, "Connection attempt failed");
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        transport: TransportKind,
        params: &ConnectionParams,
    ) -> Result<Link, ConnectionError> {
        let stream = self.factory.open(transport, params).await?;
        let channel = Arc::new(CommandChannel::new(stream, self.config.command_timeout_ms));

        self.set_state(ConnectionState::Configuring);
        let discovered = async {
            let protocol = ProtocolInitializer::new(&channel, self.config.init_config())
                .run()
                .await?;
            self.set_state(ConnectionState::Discovering);
            EcuDiscovery::new(&channel, self.config.discovery_config())
                .run(protocol)
                .await
        }
        .await;

        let protocol_state = match discovered {
            Ok(protocol_state) => protocol_state,
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    warn!("Error closing transport after failed connect: {}", close_err);
                }
                return Err(e);
            }
        };

        let client = ObdClient::new(channel.clone()).with_supported(protocol_state.supported_pids.clone());
        let scheduler = MonitoringScheduler::new(client.clone(), self.config.scheduler_config());
        let watcher = tokio::spawn(watch_hangup(channel.clone(), self.state.clone()));

        Ok(Link {
            channel,
            client,
            scheduler,
            protocol_state,
            watcher,
        })
    }

    /// Stop monitoring, cancel any pending command and close the transport
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ConnectionState::Ready => {}
            ConnectionState::Failed => {
                self.teardown().await;
                return Ok(());
            }
            _ => return Err(ConnectionError::NotConnected),
        }

        self.set_state(ConnectionState::Disconnecting);
        let link = lock(&self.link).take();
        let result = match link {
            Some(link) => close_link(&link).await,
            None => Ok(()),
        };
        *lock(&self.target) = None;
        self.set_state(ConnectionState::Disconnected);
        result
    }

    /// Discard whatever a failed connection left behind
    async fn teardown(&self) {
        let link = lock(&self.link).take();
        if let Some(link) = link {
            if let Err(e) = close_link(&link).await {
                warn!("Error closing failed connection: {}", e);
            }
        }
        *lock(&self.target) = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Send an ad-hoc command; known parameter requests come back decoded
    pub async fn send_command(
        &self,
        command: &str,
        timeout_ms: Option<u64>,
    ) -> Result<CommandReply, ChannelError> {
        let link = self.ready_link().ok_or(ChannelError::Closed)?;
        let timeout_ms = timeout_ms.unwrap_or(self.config.command_timeout_ms);
        link.client.send_command(command, timeout_ms).await
    }

    /// Read stored and pending trouble codes
    pub async fn read_dtcs(&self) -> Result<Vec<DtcRecord>, ChannelError> {
        let link = self.ready_link().ok_or(ChannelError::Closed)?;
        link.client.read_dtcs().await
    }

    /// Clear trouble codes
    pub async fn clear_dtcs(&self) -> Result<(), ChannelError> {
        let link = self.ready_link().ok_or(ChannelError::Closed)?;
        link.client.clear_dtcs().await
    }

    /// Start the monitoring session for this connection
    pub async fn start_monitoring(
        &self,
        pids: Vec<String>,
        interval_ms: u64,
    ) -> Result<SessionHandle, MonitorError> {
        let link = self.ready_link().ok_or(MonitorError::NotConnected)?;
        link.scheduler.start(pids, interval_ms).await
    }

    /// Stop the monitoring session, if any
    pub fn stop_monitoring(&self) {
        if let Some(link) = lock(&self.link).as_ref() {
            link.scheduler.stop();
        }
    }
}

/// Monitoring stops before the pending command is cancelled and the stream closes
async fn close_link(link: &Link) -> Result<(), ConnectionError> {
    link.scheduler.stop();
    link.channel.cancel();
    link.scheduler.shutdown().await;
    link.watcher.abort();
    link.channel
        .close()
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))
}

/// Mark a ready connection failed when the adapter hangs up
async fn watch_hangup(channel: Arc<CommandChannel>, state: Arc<watch::Sender<ConnectionState>>) {
    channel.closed().await;
    let _ = state.send_if_modified(|current| {
        if *current == ConnectionState::Ready {
            warn!("Adapter transport closed unexpectedly");
            *current = ConnectionState::Failed;
            true
        } else {
            false
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedTransportFactory;
    use obd_protocol::mock::MockAdapter;

    fn manager(adapter: MockAdapter) -> ConnectionManager<SimulatedTransportFactory> {
        let config = EngineConfig {
            command_timeout_ms: 200,
            reset_timeout_ms: 200,
            ..Default::default()
        };
        ConnectionManager::new(SimulatedTransportFactory::new(adapter), config)
    }

    fn params() -> ConnectionParams {
        ConnectionParams {
            address: "sim".to_string(),
            baud_rate: 38400,
        }
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let manager = manager(MockAdapter::new());
        let mut states = manager.state_changes();

        let protocol_state = manager
            .connect("test", TransportKind::Usb, params(), None)
            .await
            .unwrap();
        assert_eq!(protocol_state.ecu_count, 2);
        assert_eq!(manager.state(), ConnectionState::Ready);
        assert_eq!(manager.connection().unwrap().adapter_id, "test");
        assert_eq!(*states.borrow_and_update(), ConnectionState::Ready);

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.connection().is_none());
        assert!(manager.protocol_state().is_none());
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let manager = manager(MockAdapter::new());
        manager.connect("test", TransportKind::Usb, params(), None).await.unwrap();
        assert!(matches!(
            manager.connect("test", TransportKind::Usb, params(), None).await,
            Err(ConnectionError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let manager = manager(MockAdapter::new());
        assert!(matches!(
            manager.disconnect().await,
            Err(ConnectionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_failed_connect_allows_retry() {
        let manager = manager(MockAdapter::new().respond("ATH0", "ERROR"));
        let err = manager
            .connect("test", TransportKind::Bluetooth, params(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::InitializationFailed { step: "headers-off", .. }
        ));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(manager.protocol_state().is_none());

        // Same scripted failure, but the engine accepts the retry
        assert!(manager.connect("test", TransportKind::Bluetooth, params(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let manager = manager(MockAdapter::new());
        assert_eq!(manager.read_dtcs().await.unwrap_err(), ChannelError::Closed);
        assert_eq!(
            manager.start_monitoring(vec!["010C".to_string()], 1000).await.unwrap_err(),
            MonitorError::NotConnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_budget() {
        let mut manager = manager(MockAdapter::new().with_latency(Duration::from_millis(150)));
        manager.config.connect_timeout_ms = 400;
        assert!(matches!(
            manager.connect("test", TransportKind::Usb, params(), None).await,
            Err(ConnectionError::Timeout(400))
        ));
        assert_eq!(manager.state(), ConnectionState::Failed);

        // A per-call budget overrides the configured one
        assert!(matches!(
            manager.connect("test", TransportKind::Usb, params(), Some(250)).await,
            Err(ConnectionError::Timeout(250))
        ));
        manager
            .connect("test", TransportKind::Usb, params(), Some(60_000))
            .await
            .unwrap();
        assert_eq!(manager.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_hang_up_fails_connection() {
        let manager = manager(MockAdapter::new());
        manager.connect("test", TransportKind::Usb, params(), None).await.unwrap();
        let session = manager
            .start_monitoring(vec!["010C".to_string()], 1000)
            .await
            .unwrap();
        session.subscribe().recv().await.unwrap();

        manager.factory().last_handle().unwrap().hang_up();
        let mut states = manager.state_changes();
        states
            .wait_for(|state| *state == ConnectionState::Failed)
            .await
            .unwrap();

        // The next cycle finds the channel closed and ends the session
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!session.is_active());
        assert_eq!(
            manager.send_command("010C", None).await.unwrap_err(),
            ChannelError::Closed
        );

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.connection().is_none());
    }
}
