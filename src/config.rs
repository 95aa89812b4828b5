//! INI configuration: the global server config and each set's on-disk
//! `config.ini`, both parsed with `rust-ini`.

use std::path::Path;

use ini::Ini;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hll::{self, MAX_PRECISION, MIN_PRECISION};

const SECTION: &str = "hlld";

/// Server-wide configuration, parsed from the `[hlld]` section of the file
/// passed via `-f`.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    /// TCP port to accept client connections on. Default `4553`.
    pub tcp_port: u16,
    /// UDP port, reserved for future use and never bound. Default `4554`.
    pub udp_port: u16,
    /// Address to bind. Default `0.0.0.0`.
    pub bind_address: String,
    /// Root directory under which `hlld.<name>` set folders live.
    pub data_dir: String,
    /// `DEBUG|INFO|WARN|ERROR|CRITICAL`, mapped onto `log::LevelFilter`.
    pub log_level: String,
    /// Number of connection-handling worker threads. Must be `>= 1`.
    pub workers: usize,
    /// Seconds between flush sweeps; `0` disables the sweep.
    pub flush_interval: u64,
    /// Seconds between cold sweeps; `0` disables the sweep.
    pub cold_interval: u64,
    /// Default storage mode for newly created sets with no per-set override.
    pub in_memory: bool,
    /// Selects shared vs. privately-mapped file backing for file-backed sets.
    pub use_mmap: bool,
    /// Default target error rate; mutually resolved against `default_precision`.
    pub default_eps: f64,
    /// Default precision; mutually resolved against `default_eps`.
    pub default_precision: u8,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            tcp_port: 4553,
            udp_port: 4554,
            bind_address: "0.0.0.0".to_string(),
            data_dir: "/tmp/hlld".to_string(),
            log_level: "INFO".to_string(),
            workers: 1,
            flush_interval: 60,
            cold_interval: 60,
            in_memory: false,
            use_mmap: true,
            default_eps: hll::error_for_precision(12),
            default_precision: 12,
        }
    }
}

impl GlobalConfig {
    /// Parses a global config file, applying defaults for absent keys and
    /// resolving `default_eps`/`default_precision` against each other.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut cfg = GlobalConfig::default();
        let Some(section) = ini.section(Some(SECTION)) else {
            return Ok(cfg);
        };

        if let Some(v) = section.get("tcp_port") {
            cfg.tcp_port = parse_value("tcp_port", v)?;
        }
        if let Some(v) = section.get("udp_port") {
            cfg.udp_port = parse_value("udp_port", v)?;
        }
        if let Some(v) = section.get("bind_address") {
            cfg.bind_address = v.to_string();
        }
        if let Some(v) = section.get("data_dir") {
            cfg.data_dir = v.to_string();
        }
        if let Some(v) = section.get("log_level") {
            cfg.log_level = v.to_string();
        }
        if let Some(v) = section.get("workers") {
            cfg.workers = parse_value("workers", v)?;
        }
        if let Some(v) = section.get("flush_interval") {
            cfg.flush_interval = parse_value("flush_interval", v)?;
        }
        if let Some(v) = section.get("cold_interval") {
            cfg.cold_interval = parse_value("cold_interval", v)?;
        }
        if let Some(v) = section.get("in_memory") {
            cfg.in_memory = parse_bool("in_memory", v)?;
        }
        if let Some(v) = section.get("use_mmap") {
            cfg.use_mmap = parse_bool("use_mmap", v)?;
        }

        let given_precision = section
            .get("default_precision")
            .map(|v| parse_value::<u8>("default_precision", v))
            .transpose()?;
        let given_eps = section
            .get("default_eps")
            .map(|v| parse_value::<f64>("default_eps", v))
            .transpose()?;

        // default_eps and default_precision are mutually implied: eps is
        // first mapped to the smallest p meeting the bound, then eps is
        // recomputed as the true bound of that p.
        let precision = if let Some(p) = given_precision {
            p
        } else if let Some(eps) = given_eps {
            hll::precision_for_error(eps).ok_or_else(|| ConfigError::InvalidValue {
                key: "default_eps",
                reason: format!("no precision in [{MIN_PRECISION},{MAX_PRECISION}] meets eps={eps}"),
            })?
        } else {
            cfg.default_precision
        };
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(ConfigError::InvalidValue {
                key: "default_precision",
                reason: format!("must be in [{MIN_PRECISION},{MAX_PRECISION}]"),
            });
        }
        cfg.default_precision = precision;
        cfg.default_eps = hll::error_for_precision(precision);

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "workers",
                reason: "must be >= 1".to_string(),
            });
        }
        if !matches!(
            self.log_level.to_ascii_uppercase().as_str(),
            "DEBUG" | "INFO" | "WARN" | "ERROR" | "CRITICAL"
        ) {
            return Err(ConfigError::InvalidValue {
                key: "log_level",
                reason: "must be one of DEBUG|INFO|WARN|ERROR|CRITICAL".to_string(),
            });
        }
        Ok(())
    }

    /// Maps `log_level` onto a `log::LevelFilter`. `CRITICAL` has no
    /// dedicated `log` crate level and collapses onto `Error`.
    pub fn log_level_filter(&self) -> log::LevelFilter {
        match self.log_level.to_ascii_uppercase().as_str() {
            "DEBUG" => log::LevelFilter::Debug,
            "INFO" => log::LevelFilter::Info,
            "WARN" => log::LevelFilter::Warn,
            "ERROR" | "CRITICAL" => log::LevelFilter::Error,
            _ => log::LevelFilter::Info,
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            reason: format!("`{raw}` is not a valid value"),
        })
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key,
            reason: format!("`{other}` is not 0 or 1"),
        }),
    }
}

/// Per-set `config.ini`, persisted alongside `registers.mmap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SketchConfig {
    /// Last computed cardinality estimate.
    pub size: f64,
    /// Target relative error for this set.
    pub default_eps: f64,
    /// Effective precision for this set.
    pub default_precision: u8,
    /// Whether this set is in-memory only (never paged to disk).
    pub in_memory: bool,
}

impl SketchConfig {
    /// Reads `config.ini` from `dir`, if present.
    pub fn load(dir: &Path) -> Result<Option<Self>, ConfigError> {
        let path = dir.join("config.ini");
        if !path.exists() {
            return Ok(None);
        }
        let ini = Ini::load_from_file(&path).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let Some(section) = ini.section(Some(SECTION)) else {
            return Ok(None);
        };
        Ok(Some(SketchConfig {
            size: section
                .get("size")
                .map(|v| parse_value("size", v))
                .transpose()?
                .unwrap_or(0.0),
            default_eps: section
                .get("default_eps")
                .map(|v| parse_value("default_eps", v))
                .transpose()?
                .unwrap_or(0.0),
            default_precision: section
                .get("default_precision")
                .map(|v| parse_value("default_precision", v))
                .transpose()?
                .unwrap_or(MIN_PRECISION),
            in_memory: section
                .get("in_memory")
                .map(|v| parse_bool("in_memory", v))
                .transpose()?
                .unwrap_or(false),
        }))
    }

    /// Writes `config.ini` into `dir`, creating or overwriting it.
    pub fn save(&self, dir: &Path) -> Result<(), ConfigError> {
        let mut ini = Ini::new();
        ini.with_section(Some(SECTION))
            .set("size", self.size.to_string())
            .set("default_eps", self.default_eps.to_string())
            .set("default_precision", self.default_precision.to_string())
            .set("in_memory", if self.in_memory { "1" } else { "0" });
        ini.write_to_file(dir.join("config.ini"))
            .map_err(ConfigError::Io)
    }
}
