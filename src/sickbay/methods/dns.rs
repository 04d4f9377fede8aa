//! DNS server probe
//!
//! Sends one query straight to the configured nameserver (not the system
//! resolver) and optionally matches the answers against a pattern.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use hickory_proto::xfer::Protocol;
use hickory_resolver::Resolver;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AddressFamily;
use crate::sickbay::probe::{Probe, ProbeError};

/// Record type to query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    A,
    Aaaa,
    Any,
    Cname,
    Mx,
    Ns,
    Ptr,
    #[default]
    Soa,
    Srv,
    Txt,
}

impl QueryType {
    fn record_type(&self) -> RecordType {
        match self {
            QueryType::A => RecordType::A,
            QueryType::Aaaa => RecordType::AAAA,
            QueryType::Any => RecordType::ANY,
            QueryType::Cname => RecordType::CNAME,
            QueryType::Mx => RecordType::MX,
            QueryType::Ns => RecordType::NS,
            QueryType::Ptr => RecordType::PTR,
            QueryType::Soa => RecordType::SOA,
            QueryType::Srv => RecordType::SRV,
            QueryType::Txt => RecordType::TXT,
        }
    }
}

fn default_port() -> u16 {
    53
}

fn default_require_resolve() -> bool {
    true
}

/// Arguments for `method = "dns"`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DnsArgs {
    /// Nameserver to query (hostname or IP address)
    pub host: String,
    /// Name to look up
    pub query: String,
    #[serde(default)]
    pub query_type: QueryType,
    /// Regex that at least one answer must match
    #[serde(default)]
    pub response: Option<String>,
    /// Query over TCP instead of UDP
    #[serde(default)]
    pub tcp: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    /// NXDOMAIN or an empty answer counts as a failure
    #[serde(default = "default_require_resolve")]
    pub require_resolve: bool,
    #[serde(default)]
    pub address_family: Option<AddressFamily>,
    /// Every address of the nameserver must answer
    #[serde(default)]
    pub all_valid: bool,
}

impl DnsArgs {
    pub fn validate(&self) -> Vec<String> {
        let mut errors: Vec<String> = super::validate_host("dns", &self.host).into_iter().collect();
        errors.extend(super::validate_family("dns", &self.host, self.address_family));
        if self.query.trim().is_empty() {
            errors.push("dns probe requires a non-empty query".to_string());
        }
        if self.port == 0 {
            errors.push("dns probe port must be between 1 and 65535".to_string());
        }
        if self.response.is_some() && !self.require_resolve {
            errors.push("dns probe with a response pattern must set require_resolve".to_string());
        }
        errors
    }
}

pub struct DnsProbe {
    args: DnsArgs,
    response: Option<Regex>,
    timeout: Duration,
}

impl DnsProbe {
    pub fn new(args: DnsArgs, timeout: Duration) -> Result<Self, ProbeError> {
        let response = args.response.as_deref().map(Regex::new).transpose()?;
        Ok(Self {
            args,
            response,
            timeout,
        })
    }

    fn resolver(&self, server: SocketAddr) -> Resolver<TokioConnectionProvider> {
        let protocol = if self.args.tcp { Protocol::Tcp } else { Protocol::Udp };
        let config =
            ResolverConfig::from_parts(None, vec![], vec![NameServerConfig::new(server, protocol)]);

        let mut opts = ResolverOpts::default();
        opts.timeout = self.timeout;
        opts.attempts = 1;

        Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build()
    }

    async fn query(&self, server: SocketAddr) -> Result<String, ProbeError> {
        let label = format!(
            "{:?} {} @{}",
            self.args.query_type, self.args.query, server
        );
        debug!(query = %label, "Sending DNS query");

        let lookup = match self
            .resolver(server)
            .lookup(self.args.query.as_str(), self.args.query_type.record_type())
            .await
        {
            Ok(lookup) => lookup,
            Err(e) if e.is_no_records_found() => {
                if self.args.require_resolve {
                    return Err(ProbeError::Resolve {
                        host: label,
                        message: e.to_string(),
                    });
                }
                return Ok(format!("{} answered without records", label));
            }
            Err(e) => {
                return Err(ProbeError::Resolve {
                    host: label,
                    message: e.to_string(),
                });
            }
        };

        let answers: Vec<String> = lookup
            .iter()
            .map(|rdata| rdata.to_string().trim_end_matches('.').to_string())
            .collect();

        if answers.is_empty() && self.args.require_resolve {
            return Err(ProbeError::Resolve {
                host: label,
                message: "empty answer".to_string(),
            });
        }

        match &self.response {
            None => Ok(format!("{} answered {}", label, answers.join(", "))),
            Some(pattern) => answers
                .iter()
                .find(|answer| pattern.is_match(answer))
                .map(|answer| format!("{} answered {}", label, answer))
                .ok_or_else(|| {
                    ProbeError::Mismatch(format!(
                        "{} answers [{}] do not match {}",
                        label,
                        answers.join(", "),
                        pattern
                    ))
                }),
        }
    }
}

#[async_trait]
impl Probe for DnsProbe {
    async fn probe(&self) -> Result<String, ProbeError> {
        let servers =
            super::resolve_targets(&self.args.host, self.args.port, self.args.address_family).await?;
        super::check_targets(&servers, self.args.all_valid, |server| self.query(server)).await
    }
}
