//! Configuration file parsing for routewarden
//!
//! Parses `routewarden.toml` (or `.json`) using serde and validates it before
//! anything is handed to the supervisor.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::LogFormat;
use crate::notify::EventKind;
use crate::sickbay::ProbeMethod;
use crate::warden::RespawnPolicy;

const COMMUNITY_PATTERN: &str =
    r"^(\d+:\d+(:\d+)?|no-export|no-advertise|no-export-subconfed|internet|local-as)$";

/// Load and validate configuration from a file
pub fn load(path: &Path) -> Result<RoutewardenConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config = parse(path, &content)?;
    config.validate()?;
    Ok(config)
}

/// Parse file content according to the file extension
pub fn parse(path: &Path, content: &str) -> Result<RoutewardenConfig> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(toml::from_str(content)?),
        Some("json") => Ok(serde_json::from_str(content)?),
        _ => Err(Error::UnsupportedConfigFormat(path.to_path_buf())),
    }
}

/// Modification time of the config file, used for live reload polling
pub fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutewardenConfig {
    /// Supervisor settings
    #[serde(default)]
    pub routewarden: GlobalConfig,

    /// Where route commands are written
    #[serde(default)]
    pub control: ControlConfig,

    /// Log level and format
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Webhook notification targets
    #[serde(default)]
    pub notifications: Vec<NotificationConfig>,

    /// Health check definitions
    #[serde(default)]
    pub checks: Vec<CheckDef>,
}

impl RoutewardenConfig {
    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let communities = Regex::new(COMMUNITY_PATTERN)
            .map_err(|e| Error::ConfigValidation(e.to_string()))?;
        let mut errors = Vec::new();

        let respawn = &self.routewarden.respawn;
        if !(0.0..=1.0).contains(&respawn.jitter) {
            errors.push(format!("respawn jitter {} must be between 0.0 and 1.0", respawn.jitter));
        }
        if respawn.max_crashes == 0 {
            errors.push("respawn max_crashes must be at least 1".to_string());
        }
        if self.routewarden.monitoring_interval == 0 {
            errors.push("monitoring_interval must be greater than 0".to_string());
        }

        for target in &self.notifications {
            if target.url.trim().is_empty() {
                errors.push("notification url must not be empty".to_string());
            }
        }

        let mut names = HashSet::new();
        for check in &self.checks {
            if check.name.trim().is_empty() {
                errors.push("check name must not be empty".to_string());
            } else if !names.insert(check.name.as_str()) {
                errors.push(format!("duplicate check name: {}", check.name));
            }
            errors.extend(
                check
                    .validate(&communities)
                    .into_iter()
                    .map(|e| format!("check '{}': {}", check.name, e)),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigValidation(errors.join("; ")))
        }
    }

    /// Get a check definition by name
    pub fn get_check(&self, name: &str) -> Option<&CheckDef> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Supervisor settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Seconds between liveness sweeps (and config mtime polls)
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval: u64,

    /// Reload automatically when the config file changes
    #[serde(default)]
    pub live_reload: bool,

    /// Seconds a stopping worker gets before it is aborted
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period: u64,

    /// Crash recovery policy
    #[serde(default)]
    pub respawn: RespawnPolicy,
}

fn default_monitoring_interval() -> u64 {
    5
}

fn default_stop_grace_period() -> u64 {
    5
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: default_monitoring_interval(),
            live_reload: false,
            stop_grace_period: default_stop_grace_period(),
            respawn: RespawnPolicy::default(),
        }
    }
}

impl GlobalConfig {
    pub fn monitoring_duration(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval)
    }

    pub fn grace_duration(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period)
    }
}

/// Control channel settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControlConfig {
    /// Named pipe or file to append commands to; stdout when unset
    pub path: Option<PathBuf>,
}

/// Logging settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Webhook notification target
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Endpoint receiving JSON POSTs
    pub url: String,

    /// Event filter; empty means every event
    #[serde(default)]
    pub events: Vec<EventKind>,

    /// Request timeout in seconds
    #[serde(default = "default_notification_timeout")]
    pub timeout: u64,
}

fn default_notification_timeout() -> u64 {
    5
}

/// Next hop of announced routes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum NextHop {
    /// Let the BGP speaker use its own address
    #[default]
    Local,
    Address(IpAddr),
}

impl TryFrom<String> for NextHop {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if value.eq_ignore_ascii_case("self") {
            return Ok(NextHop::Local);
        }
        value
            .parse()
            .map(NextHop::Address)
            .map_err(|_| format!("invalid next-hop '{}' (expected \"self\" or an IP address)", value))
    }
}

impl From<NextHop> for String {
    fn from(value: NextHop) -> Self {
        value.to_string()
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextHop::Local => write!(f, "self"),
            NextHop::Address(ip) => write!(f, "{}", ip),
        }
    }
}

/// ADD-PATH identifier, written either as a number or a dotted quad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PathId {
    Number(u32),
    Address(Ipv4Addr),
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathId::Number(n) => write!(f, "{}", n),
            PathId::Address(ip) => write!(f, "{}", ip),
        }
    }
}

/// Health check definition from the config file
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CheckDef {
    /// Unique check name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Seconds between probe starts
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Per-probe timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Consecutive successes before announcing
    #[serde(default = "default_threshold")]
    pub rise: u32,

    /// Consecutive failures before withdrawing
    #[serde(default = "default_threshold")]
    pub fall: u32,

    /// Prefixes announced while healthy
    pub prefixes: Vec<IpNet>,

    #[serde(default)]
    pub nexthop: NextHop,

    #[serde(default)]
    pub path_id: Option<PathId>,

    #[serde(default)]
    pub as_path: Vec<u32>,

    #[serde(default)]
    pub communities: Vec<String>,

    /// MED
    #[serde(default)]
    pub metric: Option<u32>,

    #[serde(default)]
    pub local_preference: Option<u32>,

    /// Restrict announcements to these neighbors
    #[serde(default)]
    pub neighbors: Vec<IpAddr>,

    /// Drain file: while it exists the check is forced down
    #[serde(default)]
    pub disable: Option<PathBuf>,

    /// Probe method and its arguments
    pub probe: ProbeMethod,
}

fn default_interval() -> u64 {
    15
}

fn default_timeout() -> u64 {
    10
}

fn default_threshold() -> u32 {
    1
}

impl CheckDef {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    fn validate(&self, communities: &Regex) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.contains('"') || self.name.contains('\'') {
            errors.push("name must not contain quotes".to_string());
        }
        if self.interval == 0 {
            errors.push("interval must be greater than 0".to_string());
        }
        if self.timeout == 0 {
            errors.push("timeout must be greater than 0".to_string());
        }
        if self.rise == 0 {
            errors.push("rise must be at least 1".to_string());
        }
        if self.fall == 0 {
            errors.push("fall must be at least 1".to_string());
        }
        if self.prefixes.is_empty() {
            errors.push("at least one prefix is required".to_string());
        }
        if let NextHop::Address(ip) = self.nexthop {
            for prefix in &self.prefixes {
                if prefix.addr().is_ipv4() != ip.is_ipv4() {
                    errors.push(format!(
                        "next-hop {} does not match the address family of {}",
                        ip, prefix
                    ));
                }
            }
        }
        for asn in &self.as_path {
            if *asn == 0 || *asn == u32::MAX {
                errors.push(format!("AS number {} is out of range", asn));
            }
        }
        for community in &self.communities {
            if !communities.is_match(community) {
                errors.push(format!("invalid community '{}'", community));
            }
        }
        errors.extend(self.probe.validate());

        errors
    }
}
