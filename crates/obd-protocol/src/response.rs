//! Adapter response framing and payload parsing

use crate::error::DecodeError;

/// Prompt byte the adapter prints when it is ready for the next command
pub const PROMPT: u8 = b'>';

/// Command terminator
pub const TERMINATOR: &str = "\r";

/// Response fragments that mark a failed command
const ERROR_MARKERS: &[&str] = &["NO DATA", "ERROR", "UNABLE TO CONNECT", "STOPPED", "?"];

/// Turn a raw frame (everything before the prompt) into clean response text
///
/// Drops the echoed command, blank lines and `SEARCHING...` progress lines.
/// Remaining lines are joined with `\n`.
pub fn clean_frame(raw: &[u8], command: &str) -> String {
    let text = String::from_utf8_lossy(raw);
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.eq_ignore_ascii_case(command.trim()))
        .filter(|line| !line.starts_with("SEARCHING"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Returns the first error marker contained in the response, if any
pub fn error_marker(response: &str) -> Option<&'static str> {
    let upper = response.to_ascii_uppercase();
    ERROR_MARKERS
        .iter()
        .find(|marker| upper.contains(*marker))
        .copied()
}

/// Parse one response line of hex bytes, with or without separating spaces
pub fn parse_hex_line(line: &str) -> Result<Vec<u8>, DecodeError> {
    let digits: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(DecodeError::MalformedResponse(line.to_string()));
    }

    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| DecodeError::MalformedResponse(line.to_string()))
        })
        .collect()
}

/// Parse every line of a response into byte rows
pub fn parse_hex_lines(response: &str) -> Result<Vec<Vec<u8>>, DecodeError> {
    response.lines().map(parse_hex_line).collect()
}

/// Strip the positive-response echo (`mode + 0x40`, then `echo` bytes) from a row
///
/// Returns `None` when the row does not answer the given request.
pub fn strip_echo<'a>(row: &'a [u8], mode: u8, echo: &[u8]) -> Option<&'a [u8]> {
    let (&first, rest) = row.split_first()?;
    if first != mode.wrapping_add(0x40) {
        return None;
    }
    rest.strip_prefix(echo)
}

/// Split a 4-hex-character request code into mode and PID bytes
pub fn split_request_code(code: &str) -> Option<(u8, u8)> {
    let code = code.trim();
    if code.len() != 4 || !code.is_ascii() {
        return None;
    }
    let mode = u8::from_str_radix(&code[0..2], 16).ok()?;
    let pid = u8::from_str_radix(&code[2..4], 16).ok()?;
    Some((mode, pid))
}
