//! OBD-II PID Definitions and Response Parsing
//!
//! Static registry of mode 01 Parameter IDs keyed by their 4-hex-character
//! request code (mode + PID), with the decoding formula for each.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};

/// Definition of a single decodable parameter
#[derive(Debug, Clone, Copy)]
pub struct PidDefinition {
    /// Request code, mode + PID (e.g. "010C")
    pub code: &'static str,
    /// Human-readable name
    pub name: &'static str,
    /// Engineering unit of the decoded value
    pub unit: &'static str,
    /// Number of data bytes the formula consumes
    pub expected_bytes: usize,
    formula: fn(&[u8]) -> f64,
}

impl PidDefinition {
    const fn new(
        code: &'static str,
        name: &'static str,
        unit: &'static str,
        expected_bytes: usize,
        formula: fn(&[u8]) -> f64,
    ) -> Self {
        Self {
            code,
            name,
            unit,
            expected_bytes,
            formula,
        }
    }

    /// Decode the data bytes (mode/PID echo already stripped)
    pub fn decode(&self, bytes: &[u8]) -> Result<f64, DecodeError> {
        if bytes.len() < self.expected_bytes {
            return Err(DecodeError::InsufficientData {
                pid: self.code.to_string(),
                expected: self.expected_bytes,
                actual: bytes.len(),
            });
        }
        Ok((self.formula)(bytes))
    }
}

fn word(b: &[u8]) -> f64 {
    (b[0] as f64 * 256.0) + b[1] as f64
}

fn percent(b: &[u8]) -> f64 {
    b[0] as f64 * 100.0 / 255.0
}

fn temperature(b: &[u8]) -> f64 {
    b[0] as f64 - 40.0
}

fn fuel_trim(b: &[u8]) -> f64 {
    (b[0] as f64 - 128.0) * 100.0 / 128.0
}

fn single(b: &[u8]) -> f64 {
    b[0] as f64
}

/// All parameters this engine knows how to decode
pub static PID_TABLE: &[PidDefinition] = &[
    PidDefinition::new("0104", "Calculated engine load", "%", 1, percent),
    PidDefinition::new("0105", "Engine coolant temperature", "°C", 1, temperature),
    PidDefinition::new("0106", "Short term fuel trim (bank 1)", "%", 1, fuel_trim),
    PidDefinition::new("0107", "Long term fuel trim (bank 1)", "%", 1, fuel_trim),
    PidDefinition::new("010A", "Fuel pressure", "kPa", 1, |b| b[0] as f64 * 3.0),
    PidDefinition::new("010B", "Intake manifold absolute pressure", "kPa", 1, single),
    PidDefinition::new("010C", "Engine speed", "rpm", 2, |b| word(b) / 4.0),
    PidDefinition::new("010D", "Vehicle speed", "km/h", 1, single),
    PidDefinition::new("010E", "Timing advance", "°", 1, |b| b[0] as f64 / 2.0 - 64.0),
    PidDefinition::new("010F", "Intake air temperature", "°C", 1, temperature),
    PidDefinition::new("0110", "Mass air flow rate", "g/s", 2, |b| word(b) / 100.0),
    PidDefinition::new("0111", "Throttle position", "%", 1, percent),
    // Second byte is the short term trim of the same sensor
    PidDefinition::new("0114", "Oxygen sensor voltage (bank 1, sensor 1)", "V", 2, |b| {
        b[0] as f64 / 200.0
    }),
    PidDefinition::new("011F", "Run time since engine start", "s", 2, word),
    PidDefinition::new("0121", "Distance traveled with MIL on", "km", 2, word),
    PidDefinition::new("012F", "Fuel tank level", "%", 1, percent),
    PidDefinition::new("0131", "Distance traveled since codes cleared", "km", 2, word),
    PidDefinition::new("0133", "Absolute barometric pressure", "kPa", 1, single),
    PidDefinition::new("0142", "Control module voltage", "V", 2, |b| word(b) / 1000.0),
    PidDefinition::new("0146", "Ambient air temperature", "°C", 1, temperature),
    PidDefinition::new("015C", "Engine oil temperature", "°C", 1, temperature),
];

/// Look up a parameter by its request code (case-insensitive)
pub fn lookup(code: &str) -> Option<&'static PidDefinition> {
    PID_TABLE
        .iter()
        .find(|def| def.code.eq_ignore_ascii_case(code.trim()))
}

/// Decode raw data bytes for the given request code
pub fn decode(code: &str, raw_bytes: &[u8]) -> Result<f64, DecodeError> {
    lookup(code)
        .ok_or_else(|| DecodeError::UnknownParameter(code.to_string()))?
        .decode(raw_bytes)
}

/// A decoded parameter value, as published to monitoring subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSample {
    /// Request code of the parameter (e.g. "010C")
    pub pid: String,
    /// Human-readable name
    pub name: String,
    /// Decoded value
    pub value: f64,
    /// Engineering unit
    pub unit: String,
    /// Timestamp when the response was received (Unix ms)
    pub timestamp_ms: u64,
    /// Poll cycle that produced the sample (0 for ad-hoc queries)
    pub cycle: u64,
}

impl ParameterSample {
    /// Decode data bytes into a sample stamped with the current time
    pub fn decode(code: &str, raw_bytes: &[u8], cycle: u64) -> Result<Self, DecodeError> {
        let def = lookup(code).ok_or_else(|| DecodeError::UnknownParameter(code.to_string()))?;
        Ok(Self {
            pid: def.code.to_string(),
            name: def.name.to_string(),
            value: def.decode(raw_bytes)?,
            unit: def.unit.to_string(),
            timestamp_ms: now_ms(),
            cycle,
        })
    }
}

/// Current wall-clock time in Unix milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
