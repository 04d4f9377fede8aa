//! Probe capability shared by every health check method
//!
//! A probe runs one health check and reports success with a short detail
//! string, or a [`ProbeError`]. The runner owns timeouts and converts errors
//! into failed outcomes, so probe implementations never decide health state.

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sickbay::methods::{
    dns::{DnsArgs, DnsProbe},
    file::{FileArgs, FileProbe},
    http::{HttpArgs, HttpProbe},
    icmp::{IcmpArgs, IcmpProbe},
    ntp::{NtpArgs, NtpProbe},
    shell::{ShellArgs, ShellProbe},
    tcp::{TcpArgs, TcpProbe},
};

/// Errors a probe can report. All of them count as a failed health check.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection to {target} failed: {source}")]
    Connect { target: String, source: io::Error },

    #[error("could not resolve '{host}': {message}")]
    Resolve { host: String, message: String },

    #[error("response mismatch: {0}")]
    Mismatch(String),

    #[error("unexpected status code {0}")]
    Status(u16),

    #[error("command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("probe task ended abnormally: {0}")]
    Aborted(String),

    #[error("invalid response pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Result classification of one probe run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// The service answered as expected
    Passed,
    /// The probe failed, timed out or errored
    Failed,
    /// The check is drained by its disable file; the probe was not run
    Disabled,
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStatus::Passed => write!(f, "ok"),
            ProbeStatus::Failed => write!(f, "fail"),
            ProbeStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// Outcome of a single probe execution
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Classification used by the hysteresis counters
    pub status: ProbeStatus,
    /// Human-readable detail (success message or error text)
    pub detail: String,
    /// Wall time the probe took
    pub duration: Duration,
    /// When the probe finished
    pub timestamp: SystemTime,
}

impl ProbeOutcome {
    fn new(status: ProbeStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            duration: Duration::ZERO,
            timestamp: SystemTime::now(),
        }
    }

    pub fn passed(detail: impl Into<String>) -> Self {
        Self::new(ProbeStatus::Passed, detail)
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self::new(ProbeStatus::Failed, detail)
    }

    pub fn disabled(detail: impl Into<String>) -> Self {
        Self::new(ProbeStatus::Disabled, detail)
    }

    /// Attach the measured probe duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ProbeStatus::Passed
    }

    /// One-line summary for logs and the CLI
    pub fn summary(&self) -> String {
        format!(
            "{} ({}ms) - {}",
            self.status,
            self.duration.as_millis(),
            self.detail.lines().next().unwrap_or("")
        )
    }
}

/// A health check method that can be executed repeatedly
#[async_trait]
pub trait Probe: Send + Sync {
    /// Run the check once. `Ok` carries a detail message for diagnostics.
    async fn probe(&self) -> Result<String, ProbeError>;
}

/// Closed set of supported probe methods, tagged by `method` in config
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ProbeMethod {
    /// TCP connect
    Tcp(TcpArgs),
    /// HTTP(S) request with optional status and body matching
    Http(HttpArgs),
    /// Name resolution with optional expected answers
    Dns(DnsArgs),
    /// ICMP echo via the system ping binary
    Icmp(IcmpArgs),
    /// SNTP query
    Ntp(NtpArgs),
    /// File presence or absence
    File(FileArgs),
    /// Shell command exit status
    Shell(ShellArgs),
}

impl ProbeMethod {
    /// Method name as written in config
    pub fn name(&self) -> &'static str {
        match self {
            ProbeMethod::Tcp(_) => "tcp",
            ProbeMethod::Http(_) => "http",
            ProbeMethod::Dns(_) => "dns",
            ProbeMethod::Icmp(_) => "icmp",
            ProbeMethod::Ntp(_) => "ntp",
            ProbeMethod::File(_) => "file",
            ProbeMethod::Shell(_) => "shell",
        }
    }

    /// Method-specific semantic validation; returns every problem found
    pub fn validate(&self) -> Vec<String> {
        match self {
            ProbeMethod::Tcp(args) => args.validate(),
            ProbeMethod::Http(args) => args.validate(),
            ProbeMethod::Dns(args) => args.validate(),
            ProbeMethod::Icmp(args) => args.validate(),
            ProbeMethod::Ntp(args) => args.validate(),
            ProbeMethod::File(args) => args.validate(),
            ProbeMethod::Shell(args) => args.validate(),
        }
    }

    /// Build an executable probe. `timeout` bounds blocking work that the
    /// runner cannot abort from the outside.
    pub fn build(&self, timeout: Duration) -> Result<Arc<dyn Probe>, ProbeError> {
        let probe: Arc<dyn Probe> = match self {
            ProbeMethod::Tcp(args) => Arc::new(TcpProbe::new(args.clone())),
            ProbeMethod::Http(args) => Arc::new(HttpProbe::new(args.clone(), timeout)?),
            ProbeMethod::Dns(args) => Arc::new(DnsProbe::new(args.clone(), timeout)?),
            ProbeMethod::Icmp(args) => Arc::new(IcmpProbe::new(args.clone())),
            ProbeMethod::Ntp(args) => Arc::new(NtpProbe::new(args.clone())),
            ProbeMethod::File(args) => Arc::new(FileProbe::new(args.clone())),
            ProbeMethod::Shell(args) => Arc::new(ShellProbe::new(args.clone())),
        };
        Ok(probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_method_deserialize_tagged() {
        let toml = r#"
method = "tcp"
host = "127.0.0.1"
port = 8080
"#;
        let method: ProbeMethod = toml::from_str(toml).unwrap();
        assert_eq!(method.name(), "tcp");
        match method {
            ProbeMethod::Tcp(args) => {
                assert_eq!(args.host, "127.0.0.1");
                assert_eq!(args.port, 8080);
            }
            other => panic!("unexpected method {:?}", other),
        }
    }

    #[test]
    fn test_probe_method_unknown_rejected() {
        let toml = r#"
method = "carrier-pigeon"
host = "example"
"#;
        assert!(toml::from_str::<ProbeMethod>(toml).is_err());
    }

    #[test]
    fn test_outcome_summary_uses_first_line() {
        let outcome = ProbeOutcome::failed("connection refused\nmore detail")
            .with_duration(Duration::from_millis(12));
        assert!(!outcome.is_success());
        assert_eq!(outcome.summary(), "fail (12ms) - connection refused");
    }

    #[test]
    fn test_build_rejects_bad_http_pattern() {
        let toml = r#"
method = "http"
url = "http://127.0.0.1/health"
response = "("
"#;
        let method: ProbeMethod = toml::from_str(toml).unwrap();
        assert!(matches!(
            method.build(Duration::from_secs(1)),
            Err(ProbeError::InvalidPattern(_))
        ));
    }
}
