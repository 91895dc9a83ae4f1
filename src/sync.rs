//! Working copy management.
//!
//! One directory per source repository, cloned shallowly the first time and
//! then reused: every sync points the remote at the current credentialed URL,
//! fetches the ref and checks out the exact commit.

use crate::errors::{NormalizeError, SyncError};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

const REDACTED: &str = "***";

/// A fetch URL carrying provider credentials in its userinfo.
///
/// `Debug` and `Display` never show the credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct CloneUrl {
    url: Url,
}

impl CloneUrl {
    pub fn with_credentials(
        raw: &str,
        username: &str,
        password: Option<&str>,
    ) -> Result<Self, NormalizeError> {
        let mut url = Url::parse(raw).map_err(|source| NormalizeError::Url {
            url: raw.to_string(),
            source,
        })?;
        url.set_username(username)
            .and_then(|_| url.set_password(password))
            .map_err(|_| NormalizeError::Credentials(raw.to_string()))?;
        Ok(CloneUrl { url })
    }

    /// The URL with credentials, for handing to git only.
    pub fn expose(&self) -> &str {
        self.url.as_str()
    }

    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        if !url.username().is_empty() {
            let _ = url.set_username(REDACTED);
        }
        if url.password().is_some() {
            let _ = url.set_password(Some(REDACTED));
        }
        url.to_string()
    }

    /// Remove the credentials from text produced by a tool that saw this URL.
    pub fn scrub(&self, text: &str) -> String {
        let mut out = text.replace(self.expose(), &self.redacted());
        for secret in [Some(self.url.username()), self.url.password()]
            .into_iter()
            .flatten()
            .filter(|s| s.len() >= 4)
        {
            out = out.replace(secret, REDACTED);
        }
        out
    }
}

impl fmt::Debug for CloneUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CloneUrl({})", self.redacted())
    }
}

impl fmt::Display for CloneUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Owns every working copy under `root`.
#[derive(Debug, Clone)]
pub struct RepositorySyncer {
    git_bin: PathBuf,
    root: PathBuf,
}

impl RepositorySyncer {
    pub fn new(git_bin: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        RepositorySyncer {
            git_bin: git_bin.into(),
            root: root.into(),
        }
    }

    /// Directory bound to `repo_name` (e.g. `acme/widgets`). Only normal path
    /// components are kept so a name can never escape the root.
    pub fn working_dir(&self, repo_name: &str) -> PathBuf {
        let mut dir = self.root.clone();
        for component in Path::new(repo_name).components() {
            if let Component::Normal(part) = component {
                dir.push(part);
            }
        }
        dir
    }

    /// Bring `working_dir` to exactly `commit`.
    pub async fn sync(
        &self,
        clone_url: &CloneUrl,
        remote: &str,
        working_dir: &Path,
        git_ref: &str,
        commit: &str,
    ) -> Result<(), SyncError> {
        let exists = tokio::fs::try_exists(working_dir).await.unwrap_or(false);

        if !exists {
            info!(dir = %working_dir.display(), "Cloning repository");
            if let Some(parent) = working_dir.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| SyncError::Prepare {
                        path: parent.display().to_string(),
                        source,
                    })?;
            }
            let branch = format!("--branch={}", git_ref);
            self.git(
                "clone",
                None,
                clone_url,
                [
                    OsStr::new("clone"),
                    OsStr::new("--depth=1"),
                    OsStr::new(&branch),
                    OsStr::new(clone_url.expose()),
                    working_dir.as_os_str(),
                ],
            )
            .await?;
        } else {
            debug!(dir = %working_dir.display(), "Reusing working copy");
        }

        // Credentials may have changed since the remote was recorded.
        let set_url = self
            .git(
                "remote set-url",
                Some(working_dir),
                clone_url,
                ["remote", "set-url", remote, clone_url.expose()],
            )
            .await;
        if set_url.is_err() {
            debug!(remote, "Remote missing, adding it");
            self.git(
                "remote add",
                Some(working_dir),
                clone_url,
                ["remote", "add", remote, clone_url.expose()],
            )
            .await?;
        }

        info!(remote, git_ref, "Fetching");
        self.git(
            "fetch",
            Some(working_dir),
            clone_url,
            ["fetch", remote, git_ref],
        )
        .await?;

        info!(git_ref, commit, "Checking out");
        self.git("checkout", Some(working_dir), clone_url, ["checkout", commit])
            .await?;

        Ok(())
    }

    async fn git<I, S>(
        &self,
        command: &'static str,
        cwd: Option<&Path>,
        clone_url: &CloneUrl,
        args: I,
    ) -> Result<(), SyncError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.git_bin);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|source| SyncError::Spawn { command, source })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(SyncError::Failed {
                command,
                status: output.status.to_string(),
                stderr: clone_url.scrub(stderr.trim()),
            })
        }
    }
}
