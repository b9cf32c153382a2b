use serde::{Deserialize, Serialize};

use crate::types::MAX_CHANNELS;

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASS_LEN: usize = 64;
pub const MAX_WIFI_FORM_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub max_hold_ms: u64,
    pub min_hold_ms: u64,
    pub kick_delay_ms: u64,
    pub kick_level: u8,
    pub hold_level: u8,
    pub link_timeout_ms: u64,
    pub reconcile_interval_ms: u64,
    pub lock_timeout_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_hold_ms: 3_000,
            min_hold_ms: 250,
            kick_delay_ms: 50,
            kick_level: 255,
            // Current valves gate on/off, so hold equals kick.
            hold_level: 255,
            link_timeout_ms: 2_000,
            reconcile_interval_ms: 200,
            lock_timeout_ms: 50,
        }
    }
}

impl SafetyConfig {
    pub fn sanitize(&mut self) {
        self.max_hold_ms = self.max_hold_ms.clamp(500, 10_000);
        self.min_hold_ms = self.min_hold_ms.clamp(50, self.max_hold_ms / 2);
        self.kick_delay_ms = self.kick_delay_ms.clamp(1, self.min_hold_ms);
        self.kick_level = self.kick_level.max(1);
        self.hold_level = self.hold_level.clamp(1, self.kick_level);
        self.link_timeout_ms = self.link_timeout_ms.clamp(500, 10_000);
        self.reconcile_interval_ms = self.reconcile_interval_ms.clamp(50, 1_000);
        self.lock_timeout_ms = self.lock_timeout_ms.clamp(5, 200);
    }

    pub fn clamp_hold_ms(&self, held_ms: u64) -> u64 {
        held_ms.clamp(self.min_hold_ms, self.max_hold_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub pass: String,
}

impl WifiCredentials {
    /// Parses an `application/x-www-form-urlencoded` body with `ssid` and `pass`.
    ///
    /// Returns `None` when the body is oversized or the SSID is missing.
    /// Overlong values are truncated to what the radio accepts.
    pub fn from_form(body: &str) -> Option<Self> {
        if body.is_empty() || body.len() > MAX_WIFI_FORM_BYTES {
            return None;
        }

        let mut ssid = None;
        let mut pass = String::new();
        for pair in body.split('&') {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            match name {
                "ssid" => ssid = Some(truncate(url_decode(value), MAX_SSID_LEN)),
                "pass" => pass = truncate(url_decode(value), MAX_PASS_LEN),
                _ => {}
            }
        }

        let ssid = ssid.filter(|ssid| !ssid.trim().is_empty())?;
        Some(Self { ssid, pass })
    }
}

fn truncate(mut value: String, max_len: usize) -> String {
    if value.len() > max_len {
        let mut end = max_len;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value.truncate(end);
    }
    value
}

fn url_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                out.push(b' ');
                index += 1;
            }
            b'%' if index + 2 < bytes.len() => {
                let decoded = match (hex_value(bytes[index + 1]), hex_value(bytes[index + 2])) {
                    (Some(high), Some(low)) => Some(high << 4 | low),
                    _ => None,
                };
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        index += 3;
                    }
                    None => {
                        out.push(b'%');
                        index += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                index += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub ap_ssid: String,
    pub ap_pass: String,
    pub ap_max_connections: u16,
    pub hostname: String,
    #[serde(default)]
    pub station: Option<WifiCredentials>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "Poofer-AP".to_string(),
            ap_pass: "FlameoHotMan".to_string(),
            ap_max_connections: 4,
            hostname: "poofer".to_string(),
            station: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedConfig {
    pub gpio: i32,
    pub status_index: usize,
    pub solenoid_index: usize,
    pub firing_index: usize,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            gpio: 4,
            status_index: 0,
            solenoid_index: 1,
            firing_index: 2,
        }
    }
}

impl LedConfig {
    pub fn pixel_count(&self) -> usize {
        self.status_index
            .max(self.solenoid_index)
            .max(self.firing_index)
            + 1
    }

    pub fn sanitize(&mut self) {
        if self.gpio < 0 {
            self.gpio = 4;
        }
        if self.pixel_count() > 8 {
            *self = Self {
                gpio: self.gpio,
                ..Self::default()
            };
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub safety: SafetyConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub led: LedConfig,
    pub channel_count: u8,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            safety: SafetyConfig::default(),
            network: NetworkConfig::default(),
            led: LedConfig::default(),
            channel_count: MAX_CHANNELS as u8,
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.safety.sanitize();
        self.led.sanitize();
        self.channel_count = self.channel_count.clamp(1, MAX_CHANNELS as u8);
        if self.network.ap_ssid.trim().is_empty() {
            self.network.ap_ssid = NetworkConfig::default().ap_ssid;
        }
    }
}
