//! Simulated ELM327-compatible adapter
//!
//! Speaks the adapter side of the protocol over an in-memory duplex stream so
//! the engine can be exercised without hardware. Replies can be scripted per
//! command, including silence to provoke timeouts.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tracing::debug;

const BANNER: &str = "ELM327 v1.5";
const FUNCTIONAL_HEADER: &str = "7DF";

/// Per-connection adapter settings, as toggled by AT commands
#[derive(Debug, Clone)]
struct AdapterState {
    echo_enabled: bool,
    linefeeds_enabled: bool,
    spaces_enabled: bool,
    headers_enabled: bool,
    header: String,
}

impl Default for AdapterState {
    fn default() -> Self {
        Self {
            echo_enabled: true,
            linefeeds_enabled: true,
            spaces_enabled: true,
            headers_enabled: false,
            header: FUNCTIONAL_HEADER.to_string(),
        }
    }
}

impl AdapterState {
    fn line_ending(&self) -> &'static str {
        if self.linefeeds_enabled {
            "\r\n"
        } else {
            "\r"
        }
    }

    /// Insert spaces between hex byte pairs when spaces are enabled
    fn format_line(&self, line: &str) -> String {
        let is_hex = !line.is_empty() && line.chars().all(|c| c.is_ascii_hexdigit());
        if !self.spaces_enabled || !is_hex {
            return line.to_string();
        }
        line.as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Scripted adapter, configured builder-style and then spawned
#[derive(Debug, Clone)]
pub struct MockAdapter {
    state: AdapterState,
    present_ecus: Vec<u16>,
    pid_values: HashMap<String, String>,
    scripts: HashMap<String, VecDeque<Option<String>>>,
    latency: Duration,
    live: bool,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Adapter with two responding ECUs and a handful of live parameters
    pub fn new() -> Self {
        let pid_values = [
            ("0104", "410480"),
            ("0105", "41055A"),
            ("010C", "410C1AF8"),
            ("010D", "410D37"),
            ("010F", "410F41"),
            ("0111", "41113F"),
            ("0142", "41423A98"),
        ]
        .into_iter()
        .map(|(pid, reply)| (pid.to_string(), reply.to_string()))
        .collect();

        Self {
            state: AdapterState::default(),
            present_ecus: vec![0x7E0, 0x7E1],
            pid_values,
            scripts: HashMap::new(),
            latency: Duration::ZERO,
            live: false,
        }
    }

    /// Always answer `command` with `reply` (lines separated by `\n`)
    pub fn respond(mut self, command: &str, reply: &str) -> Self {
        self.scripts.insert(
            command.to_ascii_uppercase(),
            VecDeque::from([Some(reply.to_string())]),
        );
        self
    }

    /// Answer successive `command`s from `replies`; `None` stays silent.
    /// The last entry repeats once the others are used up.
    pub fn respond_sequence(mut self, command: &str, replies: &[Option<&str>]) -> Self {
        self.scripts.insert(
            command.to_ascii_uppercase(),
            replies.iter().map(|r| r.map(str::to_string)).collect(),
        );
        self
    }

    /// Never answer `command`
    pub fn silent(self, command: &str) -> Self {
        self.respond_sequence(command, &[None])
    }

    /// Physical request headers (0x7E0..=0x7E7) that answer presence probes
    pub fn with_ecus(mut self, headers: &[u16]) -> Self {
        self.present_ecus = headers.to_vec();
        self
    }

    /// Delay before every reply
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Vary engine speed, vehicle speed and coolant temperature between requests
    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    /// Start the adapter task and return the engine's end of the stream
    pub fn spawn(self) -> (DuplexStream, MockHandle) {
        let (engine_end, adapter_end) = duplex(4096);
        let log = Arc::new(Mutex::new(Vec::new()));
        let hangup = Arc::new(Notify::new());
        let handle = MockHandle {
            log: log.clone(),
            hangup: hangup.clone(),
        };
        tokio::spawn(self.serve(adapter_end, log, hangup));
        (engine_end, handle)
    }

    async fn serve(
        mut self,
        mut stream: DuplexStream,
        log: Arc<Mutex<Vec<String>>>,
        hangup: Arc<Notify>,
    ) {
        let mut pending = Vec::new();
        let mut chunk = [0u8; 128];
        let mut requests: u64 = 0;

        loop {
            let read = tokio::select! {
                read = stream.read(&mut chunk) => read,
                _ = hangup.notified() => {
                    debug!("Simulated adapter hanging up");
                    break;
                }
            };
            let n = match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            pending.extend_from_slice(&chunk[..n]);

            while let Some(pos) = pending.iter().position(|&b| b == b'\r') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let command = String::from_utf8_lossy(&raw[..pos]).trim().to_string();
                if command.is_empty() {
                    continue;
                }
                log.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(command.clone());
                requests += 1;

                let echo = self.state.echo_enabled;
                let Some(reply) = self.reply_to(&command, requests) else {
                    debug!(%command, "Simulated adapter staying silent");
                    continue;
                };

                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }

                let le = self.state.line_ending();
                let mut out = String::new();
                if echo {
                    out.push_str(&command);
                    out.push('\r');
                }
                for line in reply.lines() {
                    out.push_str(&self.state.format_line(line));
                    out.push_str(le);
                }
                out.push_str(le);
                out.push('>');

                if stream.write_all(out.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }

    fn reply_to(&mut self, command: &str, request: u64) -> Option<String> {
        let upper = command.to_ascii_uppercase();

        if let Some(script) = self.scripts.get_mut(&upper) {
            return if script.len() > 1 {
                script.pop_front().flatten()
            } else {
                script.front().cloned().flatten()
            };
        }

        if let Some(at) = upper.strip_prefix("AT") {
            return Some(self.at_command(at.trim()));
        }

        Some(self.obd_request(&upper, request))
    }

    fn at_command(&mut self, at: &str) -> String {
        let flag = |value: &str| value == "1";
        match at {
            "Z" => {
                self.state = AdapterState::default();
                return BANNER.to_string();
            }
            "I" => return BANNER.to_string(),
            "DPN" => return "A6".to_string(),
            "DP" => return "AUTO, ISO 15765-4 (CAN 11/500)".to_string(),
            _ => {}
        }

        if at.len() == 2 {
            let (setting, value) = at.split_at(1);
            if value == "0" || value == "1" {
                match setting {
                    "E" => self.state.echo_enabled = flag(value),
                    "L" => self.state.linefeeds_enabled = flag(value),
                    "S" => self.state.spaces_enabled = flag(value),
                    "H" => self.state.headers_enabled = flag(value),
                    _ => return "?".to_string(),
                }
                return "OK".to_string();
            }
        }

        if let Some(header) = at.strip_prefix("SH") {
            self.state.header = header.trim().to_string();
            return "OK".to_string();
        }
        if ["SP", "ST", "AT"].iter().any(|prefix| at.starts_with(prefix)) {
            return "OK".to_string();
        }
        "?".to_string()
    }

    fn obd_request(&self, request: &str, counter: u64) -> String {
        if !request.chars().all(|c| c.is_ascii_hexdigit()) || request.len() % 2 != 0 {
            return "?".to_string();
        }

        if self.state.header != FUNCTIONAL_HEADER {
            let addressed = u16::from_str_radix(&self.state.header, 16).ok();
            if !addressed.is_some_and(|h| self.present_ecus.contains(&h)) {
                return "NO DATA".to_string();
            }
        }

        match request {
            "0100" => self.supported_bitmap(),
            "03" => "430203000171".to_string(),
            "07" => "47010420".to_string(),
            "04" => "44".to_string(),
            pid if self.live => self
                .live_value(pid, counter)
                .or_else(|| self.pid_values.get(pid).cloned())
                .unwrap_or_else(|| "NO DATA".to_string()),
            pid => self
                .pid_values
                .get(pid)
                .cloned()
                .unwrap_or_else(|| "NO DATA".to_string()),
        }
    }

    /// Mode 01 PID 00 answer advertising exactly the configured PIDs
    fn supported_bitmap(&self) -> String {
        let mut bitmap = [0u8; 4];
        for pid in self.pid_values.keys() {
            if let Ok(number) = u8::from_str_radix(&pid[2..], 16) {
                if (1..=0x20).contains(&number) {
                    let bit = (number - 1) as usize;
                    bitmap[bit / 8] |= 0x80 >> (bit % 8);
                }
            }
        }
        format!(
            "4100{:02X}{:02X}{:02X}{:02X}",
            bitmap[0], bitmap[1], bitmap[2], bitmap[3]
        )
    }

    fn live_value(&self, pid: &str, counter: u64) -> Option<String> {
        let mut hasher = DefaultHasher::new();
        counter.hash(&mut hasher);
        pid.hash(&mut hasher);
        let hash = hasher.finish();

        match pid {
            // 800-3500 rpm
            "010C" => {
                let encoded = (800 + (hash % 2700) as u16) * 4;
                Some(format!("410C{:04X}", encoded))
            }
            // 0-120 km/h
            "010D" => Some(format!("410D{:02X}", hash % 120)),
            // 70-105°C
            "0105" => Some(format!("4105{:02X}", 110 + hash % 35)),
            _ => None,
        }
    }
}

/// Observer for a spawned [`MockAdapter`]
#[derive(Debug, Clone)]
pub struct MockHandle {
    log: Arc<Mutex<Vec<String>>>,
    hangup: Arc<Notify>,
}

impl MockHandle {
    /// Every command received so far, in arrival order
    pub fn commands(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drop the adapter's end of the stream, as if the link went away
    pub fn hang_up(&self) {
        self.hangup.notify_one();
    }
}
