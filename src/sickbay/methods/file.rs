//! File presence probe

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::sickbay::probe::{Probe, ProbeError};

/// Arguments for `method = "file"`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FileArgs {
    /// Path to test
    pub path: PathBuf,
    /// Whether the path must exist (true) or must be absent (false)
    #[serde(default = "default_exists")]
    pub exists: bool,
}

fn default_exists() -> bool {
    true
}

impl FileArgs {
    pub fn validate(&self) -> Vec<String> {
        if self.path.as_os_str().is_empty() {
            vec!["file probe requires a path".to_string()]
        } else {
            Vec::new()
        }
    }
}

pub struct FileProbe {
    args: FileArgs,
}

impl FileProbe {
    pub fn new(args: FileArgs) -> Self {
        Self { args }
    }
}

#[async_trait]
impl Probe for FileProbe {
    async fn probe(&self) -> Result<String, ProbeError> {
        let present = tokio::fs::try_exists(&self.args.path).await?;
        let path = self.args.path.display();
        match (present, self.args.exists) {
            (true, true) => Ok(format!("File {} exists", path)),
            (false, false) => Ok(format!("File {} does not exist", path)),
            (true, false) => Err(ProbeError::Mismatch(format!(
                "file {} exists but must not",
                path
            ))),
            (false, true) => Err(ProbeError::Mismatch(format!(
                "file {} does not exist",
                path
            ))),
        }
    }
}
