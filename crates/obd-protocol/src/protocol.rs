//! OBD-II Protocol Definitions

use serde::{Deserialize, Serialize};

/// Supported OBD-II protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
    /// SAE J1939 CAN (29 bit ID, 250 kbaud)
    SaeJ1939,
    /// User-defined CAN protocol 1
    UserCan1,
    /// User-defined CAN protocol 2
    UserCan2,
}

impl ObdProtocol {
    /// Map the protocol number reported by `ATDPN` to a protocol
    ///
    /// A leading `A` on a two-character answer means the protocol was found
    /// by automatic search and is not part of the number.
    pub fn from_protocol_number(response: &str) -> Option<Self> {
        let number = response.trim();
        let digit = match number.len() {
            2 if number.starts_with(['A', 'a']) => &number[1..],
            1 => number,
            _ => return None,
        };

        let protocol = match digit.to_ascii_uppercase().as_str() {
            "0" => ObdProtocol::Auto,
            "1" => ObdProtocol::J1850Pwm,
            "2" => ObdProtocol::J1850Vpw,
            "3" => ObdProtocol::Iso9141_2,
            "4" => ObdProtocol::Iso14230_4Kwp,
            "5" => ObdProtocol::Iso14230_4KwpFast,
            "6" => ObdProtocol::Iso15765_4Can11bit500,
            "7" => ObdProtocol::Iso15765_4Can29bit500,
            "8" => ObdProtocol::Iso15765_4Can11bit250,
            "9" => ObdProtocol::Iso15765_4Can29bit250,
            "A" => ObdProtocol::SaeJ1939,
            "B" => ObdProtocol::UserCan1,
            "C" => ObdProtocol::UserCan2,
            _ => return None,
        };
        Some(protocol)
    }

    /// Display name of the protocol
    pub fn name(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "Automatic",
            ObdProtocol::J1850Pwm => "SAE J1850 PWM",
            ObdProtocol::J1850Vpw => "SAE J1850 VPW",
            ObdProtocol::Iso9141_2 => "ISO 9141-2",
            ObdProtocol::Iso14230_4Kwp => "ISO 14230-4 KWP (5 baud init)",
            ObdProtocol::Iso14230_4KwpFast => "ISO 14230-4 KWP (fast init)",
            ObdProtocol::Iso15765_4Can11bit500 => "ISO 15765-4 CAN (11 bit ID, 500 kbaud)",
            ObdProtocol::Iso15765_4Can29bit500 => "ISO 15765-4 CAN (29 bit ID, 500 kbaud)",
            ObdProtocol::Iso15765_4Can11bit250 => "ISO 15765-4 CAN (11 bit ID, 250 kbaud)",
            ObdProtocol::Iso15765_4Can29bit250 => "ISO 15765-4 CAN (29 bit ID, 250 kbaud)",
            ObdProtocol::SaeJ1939 => "SAE J1939 CAN (29 bit ID, 250 kbaud)",
            ObdProtocol::UserCan1 => "USER1 CAN",
            ObdProtocol::UserCan2 => "USER2 CAN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_detected_number() {
        assert_eq!(
            ObdProtocol::from_protocol_number("A6"),
            Some(ObdProtocol::Iso15765_4Can11bit500)
        );
        assert_eq!(ObdProtocol::from_protocol_number("3"), Some(ObdProtocol::Iso9141_2));
    }

    #[test]
    fn test_single_a_is_j1939() {
        assert_eq!(ObdProtocol::from_protocol_number("A"), Some(ObdProtocol::SaeJ1939));
    }

    #[test]
    fn test_unrecognised_number() {
        assert_eq!(ObdProtocol::from_protocol_number("Z"), None);
        assert_eq!(ObdProtocol::from_protocol_number("A61"), None);
        assert_eq!(ObdProtocol::from_protocol_number(""), None);
    }

    #[test]
    fn test_names() {
        assert_eq!(ObdProtocol::Auto.name(), "Automatic");
        assert_eq!(ObdProtocol::SaeJ1939.name(), "SAE J1939 CAN (29 bit ID, 250 kbaud)");
    }
}
