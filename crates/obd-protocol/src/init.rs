//! Adapter bring-up: fixed configuration sequence and protocol detection

use crate::channel::{CommandChannel, DEFAULT_TIMEOUT_MS};
use crate::error::{ChannelError, ConnectionError};
use crate::protocol::ObdProtocol;
use tracing::{debug, info};

/// One configuration command of the bring-up sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitStep {
    pub name: &'static str,
    pub command: &'static str,
}

/// Configuration commands, issued in this order
pub const INIT_SEQUENCE: [InitStep; 5] = [
    InitStep { name: "reset", command: "ATZ" },
    InitStep { name: "echo-off", command: "ATE0" },
    InitStep { name: "linefeed-off", command: "ATL0" },
    InitStep { name: "spaces-off", command: "ATS0" },
    InitStep { name: "headers-off", command: "ATH0" },
];

/// Protocol detection step, issued after the configuration commands
pub const PROTOCOL_DETECT: InitStep = InitStep {
    name: "protocol-detect",
    command: "ATDPN",
};

/// Timeouts used during bring-up
#[derive(Debug, Clone, Copy)]
pub struct InitConfig {
    /// Timeout for every step except the reset
    pub command_timeout_ms: u64,
    /// Timeout for the reset, which reboots the adapter
    pub reset_timeout_ms: u64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_TIMEOUT_MS,
            reset_timeout_ms: 5000,
        }
    }
}

/// Runs the configuration sequence over a command channel
pub struct ProtocolInitializer<'a> {
    channel: &'a CommandChannel,
    config: InitConfig,
}

impl<'a> ProtocolInitializer<'a> {
    pub fn new(channel: &'a CommandChannel, config: InitConfig) -> Self {
        Self { channel, config }
    }

    /// Configure the adapter and return the protocol it detected
    pub async fn run(&self) -> Result<ObdProtocol, ConnectionError> {
        info!("Initializing OBD adapter");

        for step in INIT_SEQUENCE {
            let timeout_ms = if step.command == "ATZ" {
                self.config.reset_timeout_ms
            } else {
                self.config.command_timeout_ms
            };
            let response = self.step(step, timeout_ms).await?;
            debug!(step = step.name, %response, "Configuration step done");
        }

        let response = self
            .step(PROTOCOL_DETECT, self.config.command_timeout_ms)
            .await?;
        let protocol = ObdProtocol::from_protocol_number(&response).ok_or_else(|| {
            ConnectionError::InitializationFailed {
                step: PROTOCOL_DETECT.name,
                source: ChannelError::InvalidResponse(response.clone()),
            }
        })?;

        info!("Adapter reports protocol {}", protocol.name());
        Ok(protocol)
    }

    async fn step(&self, step: InitStep, timeout_ms: u64) -> Result<String, ConnectionError> {
        self.channel
            .send(step.command, timeout_ms)
            .await
            .map_err(|source| ConnectionError::InitializationFailed {
                step: step.name,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;

    #[tokio::test]
    async fn test_runs_sequence_in_order() {
        let (stream, handle) = MockAdapter::new().spawn();
        let channel = CommandChannel::new(Box::new(stream), 500);

        let protocol = ProtocolInitializer::new(&channel, InitConfig::default())
            .run()
            .await
            .unwrap();

        assert_eq!(protocol, ObdProtocol::Iso15765_4Can11bit500);
        assert_eq!(
            handle.commands(),
            vec!["ATZ", "ATE0", "ATL0", "ATS0", "ATH0", "ATDPN"]
        );
    }

    #[tokio::test]
    async fn test_error_response_aborts() {
        let (stream, handle) = MockAdapter::new().respond("ATL0", "?").spawn();
        let channel = CommandChannel::new(Box::new(stream), 500);

        let err = ProtocolInitializer::new(&channel, InitConfig::default())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConnectionError::InitializationFailed {
                step: "linefeed-off",
                source: ChannelError::AdapterError(_)
            }
        ));
        assert_eq!(handle.commands(), vec!["ATZ", "ATE0", "ATL0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts() {
        let (stream, _handle) = MockAdapter::new().silent("ATZ").spawn();
        let channel = CommandChannel::new(Box::new(stream), 500);
        let config = InitConfig {
            command_timeout_ms: 100,
            reset_timeout_ms: 300,
        };

        let err = ProtocolInitializer::new(&channel, config).run().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::InitializationFailed {
                step: "reset",
                source: ChannelError::Timeout(300)
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_protocol_number() {
        let (stream, _handle) = MockAdapter::new().respond("ATDPN", "Z9").spawn();
        let channel = CommandChannel::new(Box::new(stream), 500);

        let err = ProtocolInitializer::new(&channel, InitConfig::default())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::InitializationFailed {
                step: "protocol-detect",
                source: ChannelError::InvalidResponse(_)
            }
        ));
    }
}
