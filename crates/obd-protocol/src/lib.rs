//! OBD-II Protocol Implementation
//!
//! This crate turns a half-duplex byte-stream to an ELM327-compatible
//! adapter into a request/response protocol: a single-slot command channel,
//! the adapter configuration sequence, ECU discovery, and decoding of
//! parameter and trouble-code payloads.

mod channel;
mod client;
mod discovery;
pub mod dtc;
mod error;
mod init;
pub mod mock;
pub mod pid;
mod protocol;
pub mod response;

pub use channel::{AdapterStream, BoxedStream, CommandChannel, PendingCommand, DEFAULT_TIMEOUT_MS};
pub use client::{CommandReply, ObdClient};
pub use discovery::{
    parse_supported_bitmap, DiscoveryConfig, EcuDiscovery, ProtocolState, SupportedPidSet, MAX_ECUS,
};
pub use dtc::{DtcRecord, DtcStatus, Severity};
pub use error::{ChannelError, ConnectionError, DecodeError};
pub use init::{InitConfig, InitStep, ProtocolInitializer, INIT_SEQUENCE, PROTOCOL_DETECT};
pub use pid::{ParameterSample, PidDefinition};
pub use protocol::ObdProtocol;

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
}
