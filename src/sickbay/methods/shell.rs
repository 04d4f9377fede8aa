//! Shell command probe (exit 0 = healthy)

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::sickbay::probe::{Probe, ProbeError};

/// Arguments for `method = "shell"`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ShellArgs {
    /// Command line passed to `sh -c`
    pub command: String,
    /// Extra environment variables for the command
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl ShellArgs {
    pub fn validate(&self) -> Vec<String> {
        if self.command.trim().is_empty() {
            vec!["shell probe requires a command".to_string()]
        } else {
            Vec::new()
        }
    }
}

pub struct ShellProbe {
    args: ShellArgs,
}

impl ShellProbe {
    pub fn new(args: ShellArgs) -> Self {
        Self { args }
    }
}

fn first_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

#[async_trait]
impl Probe for ShellProbe {
    async fn probe(&self) -> Result<String, ProbeError> {
        // kill_on_drop reaps the child when the runner aborts a hung probe
        let output = Command::new("sh")
            .args(["-c", &self.args.command])
            .envs(&self.args.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::Command {
                command: self.args.command.clone(),
                message: e.to_string(),
            })?;

        if output.status.success() {
            let stdout = first_line(&output.stdout);
            if stdout.is_empty() {
                Ok("Shell command executed successfully".to_string())
            } else {
                Ok(stdout)
            }
        } else {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(ProbeError::Command {
                command: self.args.command.clone(),
                message: format!("exit status {}: {}", code, first_line(&output.stderr)),
            })
        }
    }
}
