//! OBD-II Client for ELM327 Adapters
//!
//! Ad-hoc requests on top of a [`CommandChannel`]: parameter queries,
//! trouble-code reads and clears, and raw commands.

use crate::channel::CommandChannel;
use crate::discovery::SupportedPidSet;
use crate::dtc::{self, DtcRecord, DtcStatus};
use crate::error::{ChannelError, DecodeError};
use crate::mode;
use crate::pid::{self, ParameterSample};
use crate::response::{parse_hex_lines, split_request_code, strip_echo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Highest PID covered by the supported-parameter bitmap
const BITMAP_RANGE_END: u8 = 0x20;

/// Reply to an ad-hoc command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CommandReply {
    /// A known parameter request, decoded
    Decoded(ParameterSample),
    /// Anything else, as cleaned response text
    Raw { text: String },
}

/// OBD-II client for communicating with ELM327-compatible adapters
#[derive(Clone)]
pub struct ObdClient {
    channel: Arc<CommandChannel>,
    supported: Option<SupportedPidSet>,
}

impl ObdClient {
    /// Create a client on an open command channel
    pub fn new(channel: Arc<CommandChannel>) -> Self {
        Self {
            channel,
            supported: None,
        }
    }

    /// Restrict parameter queries to the PIDs discovery reported
    pub fn with_supported(mut self, supported: SupportedPidSet) -> Self {
        self.supported = Some(supported);
        self
    }

    /// The underlying command channel
    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    /// Default per-command timeout
    pub fn default_timeout_ms(&self) -> u64 {
        self.channel.default_timeout_ms()
    }

    /// Send an arbitrary command; known parameter requests come back decoded
    pub async fn send_command(
        &self,
        command: &str,
        timeout_ms: u64,
    ) -> Result<CommandReply, ChannelError> {
        let command = command.trim();
        if let Some((mode::CURRENT_DATA, _)) = split_request_code(command) {
            if pid::lookup(command).is_some() {
                return self
                    .query_pid(command, timeout_ms, 0)
                    .await
                    .map(CommandReply::Decoded);
            }
        }

        let text = self.channel.send(command, timeout_ms).await?;
        Ok(CommandReply::Raw { text })
    }

    /// Query a parameter and decode its value
    pub async fn query_pid(
        &self,
        code: &str,
        timeout_ms: u64,
        cycle: u64,
    ) -> Result<ParameterSample, ChannelError> {
        let definition =
            pid::lookup(code).ok_or_else(|| DecodeError::UnknownParameter(code.to_string()))?;
        let (request_mode, pid_byte) = split_request_code(definition.code)
            .ok_or_else(|| DecodeError::UnknownParameter(code.to_string()))?;

        if !self.is_supported(definition.code, pid_byte) {
            debug!("PID {} not supported by vehicle", definition.code);
            return Err(DecodeError::UnknownParameter(definition.code.to_string()).into());
        }

        let response = self.channel.send(definition.code, timeout_ms).await?;
        let rows = parse_hex_lines(&response)?;
        let data = rows
            .iter()
            .find_map(|row| strip_echo(row, request_mode, &[pid_byte]))
            .ok_or_else(|| ChannelError::InvalidResponse(response.clone()))?;

        Ok(ParameterSample::decode(definition.code, data, cycle)?)
    }

    /// PIDs above the bitmap range cannot be ruled out, so they pass
    fn is_supported(&self, code: &str, pid_byte: u8) -> bool {
        match &self.supported {
            Some(set) if (1..=BITMAP_RANGE_END).contains(&pid_byte) => set.contains(code),
            _ => true,
        }
    }

    /// Read stored (mode 03) and pending (mode 07) trouble codes
    ///
    /// Adapters or vehicles without mode 07 support only yield stored codes.
    pub async fn read_dtcs(&self) -> Result<Vec<DtcRecord>, ChannelError> {
        let mut records = self.read_stored_dtcs().await?;
        match self.read_dtc_mode(mode::PENDING_DTC, DtcStatus::Pending).await {
            Ok(pending) => records.extend(pending),
            Err(ChannelError::AdapterError(reason)) => {
                debug!(%reason, "Pending trouble codes unavailable");
            }
            Err(e) => return Err(e),
        }
        info!("Read {} trouble code(s)", records.len());
        Ok(records)
    }

    /// Read stored (mode 03) trouble codes
    pub async fn read_stored_dtcs(&self) -> Result<Vec<DtcRecord>, ChannelError> {
        self.read_dtc_mode(mode::READ_DTC, DtcStatus::Stored).await
    }

    async fn read_dtc_mode(
        &self,
        request_mode: u8,
        status: DtcStatus,
    ) -> Result<Vec<DtcRecord>, ChannelError> {
        let response = self
            .channel
            .send(&format!("{request_mode:02X}"), self.default_timeout_ms())
            .await?;

        let mut records = Vec::new();
        for row in parse_hex_lines(&response)? {
            match strip_echo(&row, request_mode, &[]) {
                Some(payload) => records.extend(dtc::decode_all(payload, status)),
                None => warn!("Unexpected trouble code row: {:02X?}", row),
            }
        }
        Ok(records)
    }

    /// Clear trouble codes (mode 04)
    pub async fn clear_dtcs(&self) -> Result<(), ChannelError> {
        let response = self
            .channel
            .send(&format!("{:02X}", mode::CLEAR_DTC), self.default_timeout_ms())
            .await?;
        info!(%response, "Trouble codes cleared");
        Ok(())
    }
}
