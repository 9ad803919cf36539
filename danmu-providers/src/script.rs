//! Request signing through an external script runtime
//!
//! The signature algorithms are shipped as JavaScript by the platforms and
//! change often, so they are run out of process: the runtime is invoked as
//! `{runtime} {script} {request-json}` and the trimmed stdout is the token.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use danmu_core::config::SignerConfig;
use danmu_core::{Error, RequestSigner, SignRequest};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct ScriptSigner {
    runtime: String,
    script: PathBuf,
    timeout: Duration,
}

impl ScriptSigner {
    pub fn new(runtime: impl Into<String>, script: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runtime: runtime.into(),
            script: script.into(),
            timeout,
        }
    }

    pub fn from_config(config: &SignerConfig) -> Result<Self, ProviderError> {
        let script = config
            .script_path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .ok_or_else(|| ProviderError::InvalidConfig("signer.script_path is not set".to_string()))?;
        Ok(Self::new(
            config.runtime.clone(),
            script,
            Duration::from_secs(config.timeout_seconds),
        ))
    }

    pub async fn sign(&self, request: &SignRequest) -> Result<String, ProviderError> {
        let payload = serde_json::to_string(request)?;

        let mut command = Command::new(&self.runtime);
        command
            .arg(&self.script)
            .arg(payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout.as_secs()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                runtime = %self.runtime,
                script = %self.script.display(),
                code = ?output.status.code(),
                "signature script failed"
            );
            return Err(ProviderError::Script {
                code: output.status.code(),
                stderr,
            });
        }

        let token = String::from_utf8(output.stdout)
            .map_err(|e| ProviderError::Parse(format!("signature is not UTF-8: {e}")))?
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(ProviderError::Parse("signature script printed nothing".to_string()));
        }
        debug!(len = token.len(), "signature produced");
        Ok(token)
    }
}

#[async_trait]
impl RequestSigner for ScriptSigner {
    async fn sign_request(&self, request: &SignRequest) -> danmu_core::Result<String> {
        self.sign(request)
            .await
            .map_err(|e| Error::Signature(e.to_string()))
    }
}
