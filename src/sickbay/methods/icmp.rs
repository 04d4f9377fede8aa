//! ICMP echo probe using the system ping binary

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::AddressFamily;
use crate::sickbay::probe::{Probe, ProbeError};

/// Arguments for `method = "icmp"`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IcmpArgs {
    /// Hostname or IP address to ping
    pub host: String,
    /// Echo requests to send
    #[serde(default = "default_count")]
    pub count: u32,
    /// Lost replies tolerated before the check fails
    #[serde(default)]
    pub max_loss: u32,
    /// Highest round trip allowed, in milliseconds
    #[serde(default)]
    pub max_latency: Option<f64>,
    /// Highest round-trip deviation allowed, in milliseconds
    #[serde(default)]
    pub max_jitter: Option<f64>,
    #[serde(default)]
    pub address_family: Option<AddressFamily>,
}

fn default_count() -> u32 {
    1
}

impl IcmpArgs {
    pub fn validate(&self) -> Vec<String> {
        let mut errors: Vec<String> = super::validate_host("icmp", &self.host).into_iter().collect();
        errors.extend(super::validate_family("icmp", &self.host, self.address_family));
        if self.count == 0 {
            errors.push("icmp probe count must be at least 1".to_string());
        }
        if self.count > 0 && self.max_loss >= self.count {
            errors.push(format!(
                "icmp max_loss {} must be less than count {}",
                self.max_loss, self.count
            ));
        }
        if self.max_latency.is_some_and(|ms| ms <= 0.0) {
            errors.push("icmp max_latency must be positive".to_string());
        }
        if self.max_jitter.is_some() && self.count < 2 {
            errors.push("icmp max_jitter needs a count of at least 2".to_string());
        }
        errors
    }

    /// Arguments passed to ping
    fn command_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(6);
        match self.address_family {
            Some(AddressFamily::Ipv4) => args.push("-4".to_string()),
            Some(AddressFamily::Ipv6) => args.push("-6".to_string()),
            None => {}
        }
        args.extend([
            "-n".to_string(),
            "-q".to_string(),
            "-c".to_string(),
            self.count.to_string(),
            self.host.clone(),
        ]);
        args
    }

    /// Compare parsed ping statistics with the configured limits
    fn judge(&self, stats: &PingStats) -> Result<String, ProbeError> {
        let lost = stats.transmitted.saturating_sub(stats.received);
        if stats.received == 0 || lost > self.max_loss {
            return Err(ProbeError::Mismatch(format!(
                "{} of {} echo requests to {} lost (max {})",
                lost, stats.transmitted, self.host, self.max_loss
            )));
        }
        if let (Some(limit), Some(rtt)) = (self.max_latency, stats.rtt_max) {
            if rtt > limit {
                return Err(ProbeError::Mismatch(format!(
                    "latency to {} is {:.3}ms (max {}ms)",
                    self.host, rtt, limit
                )));
            }
        }
        if let (Some(limit), Some(jitter)) = (self.max_jitter, stats.rtt_dev) {
            if jitter > limit {
                return Err(ProbeError::Mismatch(format!(
                    "jitter to {} is {:.3}ms (max {}ms)",
                    self.host, jitter, limit
                )));
            }
        }
        Ok(format!(
            "{} of {} echo requests to {} answered",
            stats.received, stats.transmitted, self.host
        ))
    }
}

/// Summary statistics printed by ping
#[derive(Debug, Clone, PartialEq)]
struct PingStats {
    transmitted: u32,
    received: u32,
    rtt_max: Option<f64>,
    rtt_dev: Option<f64>,
}

/// Parse the quiet-mode summary of iputils or BSD ping
fn parse_stats(output: &str) -> Option<PingStats> {
    let counts = output.lines().find(|l| l.contains("packets transmitted"))?;
    let mut fields = counts.split(',');
    let transmitted = leading_number(fields.next()?)?;
    let received = leading_number(fields.next()?)?;

    // "rtt min/avg/max/mdev = 0.045/0.052/0.060/0.006 ms"
    let rtt: Vec<f64> = output
        .lines()
        .find(|l| l.contains("min/avg/max"))
        .and_then(|l| l.split('=').nth(1))
        .map(|values| {
            values
                .trim()
                .trim_end_matches("ms")
                .trim()
                .split('/')
                .filter_map(|v| v.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default();

    Some(PingStats {
        transmitted,
        received,
        rtt_max: rtt.get(2).copied(),
        rtt_dev: rtt.get(3).copied(),
    })
}

fn leading_number(field: &str) -> Option<u32> {
    field.split_whitespace().next()?.parse().ok()
}

pub struct IcmpProbe {
    args: IcmpArgs,
}

impl IcmpProbe {
    pub fn new(args: IcmpArgs) -> Self {
        Self { args }
    }
}

#[async_trait]
impl Probe for IcmpProbe {
    async fn probe(&self) -> Result<String, ProbeError> {
        let output = Command::new("ping")
            .args(self.args.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::Command {
                command: "ping".to_string(),
                message: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_stats(&stdout) {
            Some(stats) => self.args.judge(&stats),
            None if output.status.success() => Ok(format!("{} answered", self.args.host)),
            None => Err(ProbeError::Command {
                command: format!("ping {}", self.args.host),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPUTILS: &str = "\
PING 192.0.2.1 (192.0.2.1) 56(84) bytes of data.

--- 192.0.2.1 ping statistics ---
4 packets transmitted, 3 received, 25% packet loss, time 3004ms
rtt min/avg/max/mdev = 0.045/0.052/12.500/2.006 ms
";

    const BSD_LOST: &str = "\
PING 192.0.2.1 (192.0.2.1): 56 data bytes

--- 192.0.2.1 ping statistics ---
2 packets transmitted, 0 packets received, 100.0% packet loss
";

    fn icmp(count: u32) -> IcmpArgs {
        IcmpArgs {
            host: "192.0.2.1".into(),
            count,
            max_loss: 0,
            max_latency: None,
            max_jitter: None,
            address_family: None,
        }
    }

    #[test]
    fn test_icmp_defaults_and_args() {
        let args: IcmpArgs = toml::from_str(r#"host = "192.0.2.1""#).unwrap();
        assert_eq!(args.count, 1);
        assert_eq!(args.command_args(), vec!["-n", "-q", "-c", "1", "192.0.2.1"]);
        assert!(args.validate().is_empty());

        let v6 = IcmpArgs {
            host: "2001:db8::1".into(),
            address_family: Some(AddressFamily::Ipv6),
            ..icmp(2)
        };
        assert_eq!(v6.command_args()[0], "-6");
    }

    #[test]
    fn test_icmp_validation() {
        assert_eq!(icmp(0).validate().len(), 1);

        let args = IcmpArgs {
            max_loss: 2,
            max_jitter: Some(5.0),
            ..icmp(1)
        };
        assert_eq!(args.validate().len(), 2);
    }

    #[test]
    fn test_parse_stats_iputils_and_bsd() {
        let stats = parse_stats(IPUTILS).unwrap();
        assert_eq!(stats.transmitted, 4);
        assert_eq!(stats.received, 3);
        assert_eq!(stats.rtt_max, Some(12.5));
        assert_eq!(stats.rtt_dev, Some(2.006));

        let stats = parse_stats(BSD_LOST).unwrap();
        assert_eq!(stats.received, 0);
        assert_eq!(stats.rtt_max, None);

        assert!(parse_stats("ping: unknown host").is_none());
    }

    #[test]
    fn test_judge_applies_limits() {
        let stats = parse_stats(IPUTILS).unwrap();

        assert!(icmp(4).judge(&stats).is_err());
        let tolerant = IcmpArgs { max_loss: 1, ..icmp(4) };
        assert!(tolerant.judge(&stats).is_ok());

        let slow = IcmpArgs {
            max_latency: Some(10.0),
            ..tolerant.clone()
        };
        assert!(matches!(slow.judge(&stats), Err(ProbeError::Mismatch(m)) if m.contains("latency")));

        let jittery = IcmpArgs {
            max_jitter: Some(1.0),
            ..tolerant
        };
        assert!(matches!(jittery.judge(&stats), Err(ProbeError::Mismatch(m)) if m.contains("jitter")));

        let all_lost = parse_stats(BSD_LOST).unwrap();
        assert!(IcmpArgs { max_loss: 1, ..icmp(2) }.judge(&all_lost).is_err());
    }
}
