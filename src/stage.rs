//! Runs the external deploy tool against a synced working copy and binds the
//! resulting deployment to its alias.

use crate::errors::StageError;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

const REDACTED: &str = "***";

#[derive(Clone)]
pub struct StagingRunner {
    deploy_bin: PathBuf,
    token: String,
    env_flags: Vec<String>,
}

impl std::fmt::Debug for StagingRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingRunner")
            .field("deploy_bin", &self.deploy_bin)
            .field("env_flags", &self.env_flags.len())
            .finish()
    }
}

impl StagingRunner {
    /// `envs` is the optional JSON object of deploy-time variables.
    pub fn new(deploy_bin: impl Into<PathBuf>, token: &str, envs: Option<&str>) -> Self {
        StagingRunner {
            deploy_bin: deploy_bin.into(),
            token: token.to_string(),
            env_flags: deploy_env_flags(envs),
        }
    }

    /// Deploy `working_dir` and point `alias` at the result. Returns the live alias.
    pub async fn stage(&self, working_dir: &Path, alias: &str) -> Result<String, StageError> {
        let url = self.deploy(working_dir).await?;

        info!(url = %url, alias, "Setting alias");
        let output = Command::new(&self.deploy_bin)
            .args(["alias", "set", url.as_str(), alias, "--token", self.token.as_str()])
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .output()
            .await?;

        if let Some(message) = self.stderr_message(&String::from_utf8_lossy(&output.stderr)) {
            return Err(StageError::AliasFailed(message));
        }
        if !output.status.success() {
            return Err(StageError::AliasFailed(format!(
                "deploy tool exited with {}",
                output.status
            )));
        }

        info!(alias, "Alias ready");
        Ok(alias.to_string())
    }

    /// Run the deploy and capture the first non-empty stdout line as its URL.
    async fn deploy(&self, working_dir: &Path) -> Result<String, StageError> {
        info!(dir = %working_dir.display(), "Starting deployment");
        let mut child = Command::new(&self.deploy_bin)
            .args(&self.env_flags)
            .arg("--token")
            .arg(&self.token)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(StageError::DeploymentFailed(
                "deploy tool output is not available".into(),
            ));
        };

        let (url, errors) = tokio::join!(first_non_empty_line(stdout), read_all(stderr));
        let (url, errors) = (url?, errors?);
        let status = child.wait().await?;

        if let Some(message) = self.stderr_message(&errors) {
            return Err(StageError::DeploymentFailed(message));
        }
        let Some(url) = url else {
            return Err(StageError::DeploymentFailed(
                "deploy tool produced no deployment URL".into(),
            ));
        };
        if !status.success() {
            return Err(StageError::DeploymentFailed(format!(
                "deploy tool exited with {}",
                status
            )));
        }

        Ok(url)
    }

    /// Any stderr output at all counts as failure, blank lines included.
    fn stderr_message(&self, stderr: &str) -> Option<String> {
        if stderr.is_empty() {
            return None;
        }
        let trimmed = stderr.trim();
        if trimmed.is_empty() {
            Some("deploy tool wrote blank output to stderr".to_string())
        } else {
            Some(self.scrub(trimmed))
        }
    }

    fn scrub(&self, text: &str) -> String {
        if self.token.is_empty() {
            text.to_string()
        } else {
            text.replace(&self.token, REDACTED)
        }
    }
}

/// Reads the stream to the end, keeping only the first line with content.
async fn first_non_empty_line<R>(reader: R) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut first = None;
    while let Some(line) = lines.next_line().await? {
        if first.is_none() && !line.trim().is_empty() {
            first = Some(line.trim().to_string());
        }
    }
    Ok(first)
}

async fn read_all<R>(mut reader: R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Turn a JSON object into `-e KEY=VALUE` arguments.
///
/// Malformed JSON, or anything other than an object, yields no flags. Keys
/// outside `[A-Za-z0-9_]` are skipped, as are null, array and object values.
pub fn deploy_env_flags(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    let vars: Map<String, Value> = match serde_json::from_str(raw) {
        Ok(vars) => vars,
        Err(e) => {
            warn!("Ignoring ENVS, not a JSON object: {}", e);
            return Vec::new();
        }
    };

    let mut flags = Vec::new();
    for (key, value) in vars {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            warn!(key = %key, "Skipping invalid environment variable name");
            continue;
        }
        let value = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        flags.push("-e".to_string());
        flags.push(format!("{}={}", key, value));
    }
    flags
}
