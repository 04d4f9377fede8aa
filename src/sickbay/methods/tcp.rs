//! TCP connect probe

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use super::AddressFamily;
use crate::sickbay::probe::{Probe, ProbeError};

/// Arguments for `method = "tcp"`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TcpArgs {
    /// Hostname or IP address
    pub host: String,
    /// TCP port that must accept connections
    pub port: u16,
    /// Only connect to addresses of this family
    #[serde(default)]
    pub address_family: Option<AddressFamily>,
    /// Every resolved address must accept connections
    #[serde(default)]
    pub all_valid: bool,
}

impl TcpArgs {
    pub fn validate(&self) -> Vec<String> {
        let mut errors: Vec<String> = super::validate_host("tcp", &self.host).into_iter().collect();
        errors.extend(super::validate_family("tcp", &self.host, self.address_family));
        if self.port == 0 {
            errors.push("tcp probe port must be between 1 and 65535".to_string());
        }
        errors
    }
}

pub struct TcpProbe {
    args: TcpArgs,
}

impl TcpProbe {
    pub fn new(args: TcpArgs) -> Self {
        Self { args }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self) -> Result<String, ProbeError> {
        let targets =
            super::resolve_targets(&self.args.host, self.args.port, self.args.address_family).await?;

        super::check_targets(&targets, self.args.all_valid, connect).await
    }
}

async fn connect(target: SocketAddr) -> Result<String, ProbeError> {
    let stream = TcpStream::connect(target)
        .await
        .map_err(|e| ProbeError::Connect {
            target: target.to_string(),
            source: e,
        })?;
    let peer = stream.peer_addr()?;
    Ok(format!("TCP connection to {} succeeded", peer))
}
