//! `ParsedConfig`: the struct the core consumes, plus a minimal
//! `toml`-backed reader sufficient to drive the daemon binary and its
//! tests. Per spec §1 the textual configuration parser proper (a
//! `chrony.conf`-like grammar) is an external collaborator and out of
//! scope; this is the adapter surface it would feed (SPEC_FULL §11/§13).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use ntp_proto::{EngineConfig, IpSubnet, NtpDuration, ReferenceConfig, SelectOption, SelectionConfig};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid subnet {0:?} in access rule")]
    InvalidSubnet(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Server,
    Peer,
}

impl Default for SourceMode {
    fn default() -> Self {
        SourceMode::Server
    }
}

/// One `server`/`peer` directive (spec §6 "Environment & CLI": "a
/// daemon executable reading a configuration file").
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDirective {
    pub address: String,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub iburst: bool,
    #[serde(default)]
    pub presend: bool,
    #[serde(default)]
    pub auto_offline: bool,
    #[serde(default)]
    pub prefer: bool,
    #[serde(default)]
    pub noselect: bool,
    #[serde(default = "default_minpoll")]
    pub minpoll: i8,
    #[serde(default = "default_maxpoll")]
    pub maxpoll: i8,
    #[serde(default = "default_maxdelay")]
    pub maxdelay: f64,
    /// Index into the top-level `[keys]` table (symmetric-key MAC, spec
    /// §6 "Authentication options").
    pub key: Option<u32>,
}

impl SourceDirective {
    pub fn select_option(&self) -> SelectOption {
        if self.noselect {
            SelectOption::NoSelect
        } else if self.prefer {
            SelectOption::Prefer
        } else {
            SelectOption::Normal
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let initial_poll_exponent = EngineConfig::default()
            .initial_poll_exponent
            .clamp(self.minpoll, self.maxpoll);
        EngineConfig {
            min_poll_exponent: self.minpoll,
            max_poll_exponent: self.maxpoll,
            initial_poll_exponent,
            max_delay: NtpDuration::from_seconds(self.maxdelay),
            iburst: self.iburst,
            presend: self.presend,
            auto_offline: self.auto_offline,
            ..EngineConfig::default()
        }
    }
}

fn default_minpoll() -> i8 {
    EngineConfig::default().min_poll_exponent
}

fn default_maxpoll() -> i8 {
    EngineConfig::default().max_poll_exponent
}

fn default_maxdelay() -> f64 {
    EngineConfig::default().max_delay.to_seconds()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessRule {
    /// `"10.0.0.0/8"`-style CIDR text, parsed through `IpSubnet`.
    pub subnet: String,
    pub action: AccessAction,
}

impl AccessRule {
    pub fn parse_subnet(&self) -> Result<IpSubnet, ConfigError> {
        let (addr, prefix) = self
            .subnet
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidSubnet(self.subnet.clone()))?;
        let addr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidSubnet(self.subnet.clone()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| ConfigError::InvalidSubnet(self.subnet.clone()))?;
        Ok(IpSubnet::new(addr, prefix))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MakeStep {
    pub threshold_seconds: f64,
    pub limit: u32,
}

impl Default for MakeStep {
    fn default() -> Self {
        let defaults = ReferenceConfig::default();
        Self {
            threshold_seconds: defaults.make_step_threshold.to_seconds(),
            limit: defaults.make_step_limit,
        }
    }
}

fn default_maxsources() -> usize {
    32
}

fn default_max_clock_error_ppm() -> f64 {
    1.0
}

fn default_port() -> u16 {
    123
}

fn default_local_stratum() -> Option<u8> {
    None
}

fn default_correction_time_ratio() -> Option<f64> {
    None
}

fn default_makestep() -> MakeStep {
    MakeStep::default()
}

/// The whole of what the daemon needs from a config file. Everything
/// else a `chrony.conf` would carry (logging targets, `rtcfile`, user
/// drop privileges, Autokey) is either ambient (handled by `tracing`
/// CLI flags) or explicitly out of scope (spec Non-goals).
#[derive(Debug, Clone, Deserialize)]
pub struct ParsedConfig {
    #[serde(default)]
    pub source: Vec<SourceDirective>,
    pub driftfile: Option<PathBuf>,
    pub dumpdir: Option<PathBuf>,
    #[serde(default = "default_maxsources")]
    pub maxsources: usize,
    #[serde(default)]
    pub ntp_access: Vec<AccessRule>,
    #[serde(default)]
    pub cmd_access: Vec<AccessRule>,
    #[serde(default = "default_local_stratum")]
    pub local_stratum: Option<u8>,
    #[serde(default = "default_correction_time_ratio")]
    pub correction_time_ratio: Option<f64>,
    #[serde(default = "default_makestep")]
    pub makestep: MakeStep,
    #[serde(default = "default_max_clock_error_ppm")]
    pub max_clock_error_ppm: f64,
    pub bindaddress: Option<SocketAddr>,
    #[serde(default = "default_port")]
    pub port: u16,
    pub cmdsocket: Option<PathBuf>,
}

impl Default for ParsedConfig {
    fn default() -> Self {
        Self {
            source: Vec::new(),
            driftfile: None,
            dumpdir: None,
            maxsources: default_maxsources(),
            ntp_access: Vec::new(),
            cmd_access: Vec::new(),
            local_stratum: default_local_stratum(),
            correction_time_ratio: default_correction_time_ratio(),
            makestep: default_makestep(),
            max_clock_error_ppm: default_max_clock_error_ppm(),
            bindaddress: None,
            port: default_port(),
            cmdsocket: None,
        }
    }
}

impl ParsedConfig {
    /// Parses a config file. Per spec §7: "Configuration errors
    /// detected during start-up are fatal and terminate start-up" — the
    /// caller maps `ConfigError` to `exitcode::CONFIG`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn reference_config(&self) -> ReferenceConfig {
        ReferenceConfig {
            make_step_threshold: NtpDuration::from_seconds(self.makestep.threshold_seconds),
            make_step_limit: self.makestep.limit,
            max_clock_error_ppm: self.max_clock_error_ppm,
            local_stratum: self.local_stratum.unwrap_or(ReferenceConfig::default().local_stratum),
            correction_time_ratio: self
                .correction_time_ratio
                .unwrap_or(ReferenceConfig::default().correction_time_ratio),
        }
    }

    pub fn selection_config(&self) -> SelectionConfig {
        SelectionConfig {
            max_clock_error_ppm: self.max_clock_error_ppm,
            ..SelectionConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let parsed: ParsedConfig = toml::from_str("").unwrap();
        assert!(parsed.source.is_empty());
        assert_eq!(parsed.maxsources, default_maxsources());
        assert_eq!(parsed.port, 123);
    }

    #[test]
    fn source_directives_parse_with_options() {
        let text = r#"
            [[source]]
            address = "time.example.org"
            mode = "server"
            iburst = true
            prefer = true
            minpoll = 5
            maxpoll = 9

            [[source]]
            address = "peer.example.org"
            mode = "peer"
            noselect = true
        "#;
        let parsed: ParsedConfig = toml::from_str(text).unwrap();
        assert_eq!(parsed.source.len(), 2);
        assert_eq!(parsed.source[0].mode, SourceMode::Server);
        assert!(parsed.source[0].iburst);
        assert_eq!(parsed.source[0].select_option(), SelectOption::Prefer);
        assert_eq!(parsed.source[1].mode, SourceMode::Peer);
        assert_eq!(parsed.source[1].select_option(), SelectOption::NoSelect);
    }

    #[test]
    fn access_rule_parses_subnet() {
        let rule = AccessRule {
            subnet: "10.0.0.0/8".to_string(),
            action: AccessAction::Allow,
        };
        let subnet = rule.parse_subnet().unwrap();
        assert!(subnet.contains("10.1.2.3".parse().unwrap()));
        assert!(!subnet.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn invalid_subnet_is_rejected() {
        let rule = AccessRule {
            subnet: "not-a-subnet".to_string(),
            action: AccessAction::Deny,
        };
        assert!(rule.parse_subnet().is_err());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let result = ParsedConfig::load(Path::new("/nonexistent/path/to/chronyd.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
