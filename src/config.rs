//! # station.conf handling
//!
//! `station.conf` is a JSON document with a single top-level `station_conf`
//! object. Keys this core understands are typed fields on [`StationConfig`];
//! anything else is preserved in `extra` and can be looked up with
//! [`StationConfig::get_duration`] / [`StationConfig::get_size`] for the
//! `h|m|s|ms` and `KB|MB` suffix grammars operators use elsewhere in the
//! config file.
//!
//! Precedence, lowest to highest: built-in [`Default`] → environment
//! variables → JSON file → CLI flags. [`StationConfig::load`] applies them
//! in that order so each later layer wins.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Pulse-per-second source used to align GPS time to radio ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PpsSource {
    Gps,
    Fuzzy,
    Testpin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    pub routerid: Option<u64>,
    pub euiprefix: Option<u64>,

    pub log_file: Option<String>,
    pub log_size: Option<String>,
    pub log_rotate: Option<u32>,
    pub log_level: Option<String>,

    pub gps: Option<String>,
    pub pps: Option<PpsSource>,
    pub radio_init: Option<String>,
    pub device: Option<String>,

    pub web_port: Option<u16>,
    pub web_dir: Option<String>,

    #[serde(default)]
    pub nocca: bool,
    #[serde(default)]
    pub nodc: bool,
    #[serde(default)]
    pub nodwell: bool,
    #[serde(default)]
    pub device_mode: bool,

    /// Unknown `station_conf.*` keys, forwarded as-is.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for StationConfig {
    fn default() -> Self {
        StationConfig {
            routerid: None,
            euiprefix: None,
            log_file: None,
            log_size: None,
            log_rotate: None,
            log_level: Some("info".to_string()),
            gps: None,
            pps: None,
            radio_init: None,
            device: None,
            web_port: None,
            web_dir: None,
            nocca: false,
            nodc: false,
            nodwell: false,
            device_mode: false,
            extra: HashMap::new(),
        }
    }
}

/// CLI-supplied overrides; `None` fields leave the lower layers untouched.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub log_level: Option<String>,
    pub radio_init: Option<String>,
    pub device: Option<String>,
}

impl StationConfig {
    /// Loads configuration in precedence order: defaults, then environment
    /// variables, then the JSON file at `path` (if it exists), then `cli`.
    pub fn load(path: &Path, cli: &CliOverrides) -> Result<Self, EngineError> {
        let mut cfg = StationConfig::default();
        cfg.apply_env();

        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let doc: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| EngineError::Config(format!("invalid station.conf: {e}")))?;
            let station_conf = doc
                .get("station_conf")
                .cloned()
                .unwrap_or(serde_json::Value::Object(Default::default()));
            let from_file: StationConfig = serde_json::from_value(station_conf)
                .map_err(|e| EngineError::Config(format!("invalid station_conf: {e}")))?;
            cfg.merge(from_file);
        }

        cfg.apply_cli(cli);
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("STATION_LOGLEVEL") {
            self.log_level = Some(v);
        }
        if let Ok(v) = std::env::var("STATION_LOGFILE") {
            self.log_file = Some(v);
        }
        if let Ok(v) = std::env::var("STATION_EUIPREFIX") {
            if let Ok(eui) = parse_eui(&v) {
                self.euiprefix = Some(eui);
            }
        }
        if let Ok(v) = std::env::var("STATION_RADIOINIT") {
            self.radio_init = Some(v);
        }
    }

    fn merge(&mut self, other: StationConfig) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(routerid);
        take!(euiprefix);
        take!(log_file);
        take!(log_size);
        take!(log_rotate);
        take!(log_level);
        take!(gps);
        take!(pps);
        take!(radio_init);
        take!(device);
        take!(web_port);
        take!(web_dir);
        self.nocca = other.nocca || self.nocca;
        self.nodc = other.nodc || self.nodc;
        self.nodwell = other.nodwell || self.nodwell;
        self.device_mode = other.device_mode || self.device_mode;
        self.extra.extend(other.extra);
    }

    fn apply_cli(&mut self, cli: &CliOverrides) {
        if cli.log_level.is_some() {
            self.log_level = cli.log_level.clone();
        }
        if cli.radio_init.is_some() {
            self.radio_init = cli.radio_init.clone();
        }
        if cli.device.is_some() {
            self.device = cli.device.clone();
        }
    }

    /// Looks up an unknown key as a duration with an `h|m|s|ms` suffix.
    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        self.extra.get(key).and_then(|v| v.as_str()).and_then(parse_duration)
    }

    /// Looks up an unknown key as a byte size with a `KB|MB` suffix.
    pub fn get_size(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(|v| v.as_str()).and_then(parse_size)
    }
}

fn parse_eui(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.trim_start_matches("0x").replace(':', "").replace('-', "");
    u64::from_str_radix(&s, 16)
}

/// Parses `"500ms"`, `"30s"`, `"5m"`, `"1h"` into a [`Duration`].
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(n) = s.strip_suffix("ms") {
        return n.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(n) = s.strip_suffix('h') {
        return n.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600));
    }
    if let Some(n) = s.strip_suffix('m') {
        return n.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(n) = s.strip_suffix('s') {
        return n.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    s.parse::<u64>().ok().map(Duration::from_millis)
}

/// Parses `"16KB"`, `"4MB"` into a byte count.
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(n) = s.strip_suffix("KB") {
        return n.trim().parse::<u64>().ok().map(|kb| kb * 1024);
    }
    if let Some(n) = s.strip_suffix("MB") {
        return n.trim().parse::<u64>().ok().map(|mb| mb * 1024 * 1024);
    }
    s.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_suffixes() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn parses_size_suffixes() {
        assert_eq!(parse_size("16KB"), Some(16 * 1024));
        assert_eq!(parse_size("4MB"), Some(4 * 1024 * 1024));
    }

    #[test]
    fn env_overrides_defaults_and_cli_overrides_env() {
        std::env::set_var("STATION_LOGLEVEL", "debug");
        let mut cfg = StationConfig::default();
        cfg.apply_env();
        assert_eq!(cfg.log_level.as_deref(), Some("debug"));

        let cli = CliOverrides {
            log_level: Some("trace".to_string()),
            ..Default::default()
        };
        cfg.apply_cli(&cli);
        assert_eq!(cfg.log_level.as_deref(), Some("trace"));
        std::env::remove_var("STATION_LOGLEVEL");
    }

    #[test]
    fn eui_prefix_parses_colon_separated_hex() {
        assert_eq!(parse_eui("AA:BB:CC:DD:00:11:22:33").unwrap(), 0xAABBCCDD00112233);
    }
}
