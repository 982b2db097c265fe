//! ECU presence probing and supported-parameter discovery

use crate::channel::{CommandChannel, DEFAULT_TIMEOUT_MS};
use crate::error::{ChannelError, ConnectionError, DecodeError};
use crate::mode;
use crate::protocol::ObdProtocol;
use crate::response::{parse_hex_line, strip_echo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Upper bound on logical ECU addresses probed
pub const MAX_ECUS: usize = 8;

/// Physical request header of the first logical ECU (0x7E0..=0x7E7)
pub const PHYSICAL_HEADER_BASE: u16 = 0x7E0;

/// Functional (broadcast) request header
pub const FUNCTIONAL_HEADER: u16 = 0x7DF;

/// Mode 01 PID 00: supported PIDs 01-20
pub const SUPPORTED_PIDS_REQUEST: &str = "0100";

/// Request codes (e.g. "010C") the vehicle reported as supported
pub type SupportedPidSet = BTreeSet<String>;

/// Result of discovery, attached to a ready connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolState {
    pub protocol: ObdProtocol,
    pub protocol_name: String,
    pub ecu_count: usize,
    pub supported_pids: SupportedPidSet,
}

/// Discovery settings
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryConfig {
    /// Logical ECU addresses to probe, at most [`MAX_ECUS`]
    pub max_ecus: usize,
    pub command_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_ecus: MAX_ECUS,
            command_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Probes ECUs and builds the supported-parameter set
pub struct EcuDiscovery<'a> {
    channel: &'a CommandChannel,
    config: DiscoveryConfig,
}

impl<'a> EcuDiscovery<'a> {
    pub fn new(channel: &'a CommandChannel, config: DiscoveryConfig) -> Self {
        Self { channel, config }
    }

    /// Probe the ECUs and query the supported-parameter bitmap
    pub async fn run(&self, protocol: ObdProtocol) -> Result<ProtocolState, ConnectionError> {
        let ecu_count = self.probe_ecus().await?;

        self.send(&format!("ATSH{FUNCTIONAL_HEADER:03X}"))
            .await
            .map_err(ConnectionError::Discovery)?;

        let response = self
            .send(SUPPORTED_PIDS_REQUEST)
            .await
            .map_err(ConnectionError::Discovery)?;
        let supported_pids = parse_supported_bitmap(&response)
            .map_err(|e| ConnectionError::Discovery(e.into()))?;

        info!(
            ecu_count,
            supported = supported_pids.len(),
            "ECU discovery complete"
        );

        Ok(ProtocolState {
            protocol,
            protocol_name: protocol.name().to_string(),
            ecu_count,
            supported_pids,
        })
    }

    /// Count the logical ECUs that answer a physically addressed request
    async fn probe_ecus(&self) -> Result<usize, ConnectionError> {
        let mut count = 0;

        for index in 0..self.config.max_ecus.min(MAX_ECUS) {
            let header = PHYSICAL_HEADER_BASE + index as u16;
            match self.probe(header).await {
                Ok(()) => {
                    debug!("ECU {:03X} responded", header);
                    count += 1;
                }
                Err(ChannelError::AdapterError(_) | ChannelError::Timeout(_)) => {
                    debug!("No ECU at {:03X}", header);
                }
                Err(e) => return Err(ConnectionError::Discovery(e)),
            }
        }

        Ok(count)
    }

    async fn probe(&self, header: u16) -> Result<(), ChannelError> {
        self.send(&format!("ATSH{header:03X}")).await?;
        self.send(SUPPORTED_PIDS_REQUEST).await.map(|_| ())
    }

    async fn send(&self, command: &str) -> Result<String, ChannelError> {
        self.channel
            .send(command, self.config.command_timeout_ms)
            .await
    }
}

/// Parse a mode 01 PID 00 response into the set of supported request codes
///
/// Bit `b` (MSB first) of data byte `i` marks PID `i * 8 + b + 1`. Lines from
/// several ECUs are merged.
pub fn parse_supported_bitmap(response: &str) -> Result<SupportedPidSet, DecodeError> {
    let mut supported = SupportedPidSet::new();
    let mut answered = false;

    for line in response.lines() {
        let row = match parse_hex_line(line) {
            Ok(row) => row,
            Err(_) => {
                warn!(%line, "Ignoring unparseable bitmap line");
                continue;
            }
        };
        let Some(bitmap) = strip_echo(&row, mode::CURRENT_DATA, &[0x00]) else {
            continue;
        };
        if bitmap.len() < 4 {
            continue;
        }
        answered = true;

        for (i, byte) in bitmap[..4].iter().enumerate() {
            for b in 0..8 {
                if byte & (0x80 >> b) != 0 {
                    supported.insert(format!("01{:02X}", i * 8 + b + 1));
                }
            }
        }
    }

    if answered {
        Ok(supported)
    } else {
        Err(DecodeError::MalformedResponse(response.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;

    #[test]
    fn test_bitmap_bits_map_to_pids() {
        // 0x80 -> PID 01, 0x01 in the last byte -> PID 20
        let set = parse_supported_bitmap("41 00 80 00 00 01").unwrap();
        assert_eq!(set, SupportedPidSet::from(["0101".to_string(), "0120".to_string()]));
    }

    #[test]
    fn test_bitmap_example_response() {
        let set = parse_supported_bitmap("4100BE1FA813").unwrap();
        let expected = [
            "0101", "0103", "0104", "0105", "0106", "0107", "010C", "010D", "010E", "010F",
            "0110", "0111", "0113", "0115", "011C", "011F", "0120",
        ];
        assert_eq!(set.len(), expected.len());
        assert!(expected.iter().all(|pid| set.contains(*pid)));
    }

    #[test]
    fn test_bitmap_merges_ecus_and_rejects_garbage() {
        let set = parse_supported_bitmap("41 00 80 00 00 00\n41 00 40 00 00 00").unwrap();
        assert_eq!(set.len(), 2);
        assert!(parse_supported_bitmap("OK").is_err());
        assert!(parse_supported_bitmap("41 0C 1A F8").is_err());
    }

    #[tokio::test]
    async fn test_discovery_counts_present_ecus() {
        let (stream, handle) = MockAdapter::new()
            .with_ecus(&[0x7E0, 0x7E2, 0x7E5])
            .spawn();
        let channel = CommandChannel::new(Box::new(stream), 500);

        let state = EcuDiscovery::new(&channel, DiscoveryConfig::default())
            .run(ObdProtocol::Iso15765_4Can11bit500)
            .await
            .unwrap();

        assert_eq!(state.ecu_count, 3);
        assert!(state.supported_pids.contains("010C"));
        let commands = handle.commands();
        assert_eq!(commands.len(), MAX_ECUS * 2 + 2);
        assert_eq!(commands[commands.len() - 2], "ATSH7DF");
        assert_eq!(commands[commands.len() - 1], "0100");
    }

    #[tokio::test]
    async fn test_probe_limit_respected() {
        let (stream, handle) = MockAdapter::new().spawn();
        let channel = CommandChannel::new(Box::new(stream), 500);
        let config = DiscoveryConfig {
            max_ecus: 2,
            ..Default::default()
        };

        let state = EcuDiscovery::new(&channel, config)
            .run(ObdProtocol::Auto)
            .await
            .unwrap();
        assert_eq!(state.ecu_count, 2);
        assert_eq!(handle.commands().len(), 2 * 2 + 2);
    }

    #[tokio::test]
    async fn test_bitmap_failure_is_discovery_error() {
        let (stream, _handle) = MockAdapter::new()
            .with_ecus(&[])
            .respond("0100", "NO DATA")
            .spawn();
        let channel = CommandChannel::new(Box::new(stream), 500);

        let err = EcuDiscovery::new(&channel, DiscoveryConfig::default())
            .run(ObdProtocol::Auto)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Discovery(ChannelError::AdapterError(_))
        ));
    }
}
