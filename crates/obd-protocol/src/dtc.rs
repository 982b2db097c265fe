//! Diagnostic Trouble Code decoding
//!
//! Converts 2-byte DTC records into their 5-character form and attaches a
//! description and severity from a static lookup.

use serde::{Deserialize, Serialize};

/// First character, selected by bits 7..6 of the first byte
const CATEGORY_CHARS: [char; 4] = ['P', 'C', 'B', 'U'];

/// Second character, selected by bits 5..4 of the first byte
const SUBCATEGORY_CHARS: [char; 4] = ['0', '1', '2', '3'];

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Where the adapter reported the code from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcStatus {
    /// Confirmed code (mode 03)
    Stored,
    /// Not yet confirmed (mode 07)
    Pending,
    /// Currently failing
    Active,
}

/// Fault severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

/// A decoded trouble code with lookup metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcRecord {
    pub code: String,
    pub status: DtcStatus,
    pub description: String,
    pub severity: Severity,
}

impl DtcRecord {
    /// Build a record for a code, filling description and severity from the lookup table
    pub fn new(code: String, status: DtcStatus) -> Self {
        let (description, severity) = describe(&code);
        Self {
            code,
            status,
            description: description.to_string(),
            severity,
        }
    }
}

/// Decode a 2-byte record into its 5-character code
pub fn decode(byte1: u8, byte2: u8) -> String {
    let mut code = String::with_capacity(5);
    code.push(CATEGORY_CHARS[((byte1 >> 6) & 0x3) as usize]);
    code.push(SUBCATEGORY_CHARS[((byte1 >> 4) & 0x3) as usize]);
    for nibble in [byte1 & 0xF, (byte2 >> 4) & 0xF, byte2 & 0xF] {
        code.push(HEX_DIGITS[nibble as usize] as char);
    }
    code
}

/// Decode a count-prefixed list of 2-byte records
///
/// The first byte is the record count; records beyond the bytes actually
/// present are ignored.
pub fn decode_all(bytes: &[u8], status: DtcStatus) -> Vec<DtcRecord> {
    let Some((&count, records)) = bytes.split_first() else {
        return Vec::new();
    };

    records
        .chunks_exact(2)
        .take(count as usize)
        .map(|pair| DtcRecord::new(decode(pair[0], pair[1]), status))
        .collect()
}

static DTC_DESCRIPTIONS: &[(&str, &str, Severity)] = &[
    ("P0100", "Mass or volume air flow circuit malfunction", Severity::Medium),
    ("P0101", "Mass air flow circuit range/performance", Severity::Medium),
    ("P0115", "Engine coolant temperature circuit malfunction", Severity::Medium),
    ("P0117", "Engine coolant temperature circuit low input", Severity::Medium),
    ("P0118", "Engine coolant temperature circuit high input", Severity::Medium),
    ("P0121", "Throttle position sensor range/performance", Severity::Medium),
    ("P0128", "Coolant thermostat below regulating temperature", Severity::Low),
    ("P0130", "O2 sensor circuit malfunction (bank 1, sensor 1)", Severity::Low),
    ("P0171", "System too lean (bank 1)", Severity::Medium),
    ("P0172", "System too rich (bank 1)", Severity::Medium),
    ("P0217", "Engine overheat condition", Severity::Critical),
    ("P0300", "Random/multiple cylinder misfire detected", Severity::High),
    ("P0301", "Cylinder 1 misfire detected", Severity::High),
    ("P0302", "Cylinder 2 misfire detected", Severity::High),
    ("P0303", "Cylinder 3 misfire detected", Severity::High),
    ("P0304", "Cylinder 4 misfire detected", Severity::High),
    ("P0335", "Crankshaft position sensor circuit malfunction", Severity::High),
    ("P0420", "Catalyst system efficiency below threshold (bank 1)", Severity::Medium),
    ("P0442", "Evaporative emission system small leak detected", Severity::Low),
    ("P0455", "Evaporative emission system large leak detected", Severity::Low),
    ("P0500", "Vehicle speed sensor malfunction", Severity::Medium),
    ("P0520", "Engine oil pressure sensor circuit malfunction", Severity::High),
    ("P0562", "System voltage low", Severity::Medium),
    ("P0700", "Transmission control system malfunction", Severity::High),
    ("C0035", "Left front wheel speed sensor circuit", Severity::High),
    ("B0001", "Driver frontal stage 1 deployment control", Severity::Critical),
    ("U0100", "Lost communication with ECM/PCM", Severity::Critical),
];

/// Description and severity for a code; unknown codes get a generic entry
pub fn describe(code: &str) -> (&'static str, Severity) {
    DTC_DESCRIPTIONS
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, description, severity)| (*description, *severity))
        .unwrap_or(("Unknown trouble code", Severity::Unknown))
}
