use crate::errors::ConfigError;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_DEPLOY_DIR: &str = "/tmp/.stage-ci";

/// API token and webhook secret for one provider.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub token: String,
    pub secret: String,
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("token", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Where GitHub progress is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GithubStatusMode {
    /// Deployments API: one transient deployment per job, statuses attached to it.
    #[default]
    Deployment,
    /// Commit statuses on the pull request head.
    Commit,
}

/// Process-wide settings, read once at startup and shared read-only.
#[derive(Clone)]
pub struct Config {
    pub github: Option<ProviderCredentials>,
    pub gitlab: Option<ProviderCredentials>,
    pub deploy_token: String,
    pub deploy_bin: PathBuf,
    pub git_bin: PathBuf,
    pub deploy_dir: PathBuf,
    pub alias_domain: String,
    pub deploy_envs: Option<String>,
    pub queue_capacity: usize,
    pub github_status_mode: GithubStatusMode,
    pub address: IpAddr,
    pub port: u16,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("github", &self.github)
            .field("gitlab", &self.gitlab)
            .field("deploy_token", &"<redacted>")
            .field("deploy_bin", &self.deploy_bin)
            .field("git_bin", &self.git_bin)
            .field("deploy_dir", &self.deploy_dir)
            .field("alias_domain", &self.alias_domain)
            .field("deploy_envs", &self.deploy_envs.as_ref().map(|_| "<set>"))
            .field("queue_capacity", &self.queue_capacity)
            .field("github_status_mode", &self.github_status_mode)
            .field("address", &self.address)
            .field("port", &self.port)
            .finish()
    }
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let github = credentials(&get, "GITHUB_TOKEN", "GITHUB_WEBHOOK_SECRET")?;
        let gitlab = credentials(&get, "GITLAB_TOKEN", "GITLAB_WEBHOOK_SECRET")?;
        if github.is_none() && gitlab.is_none() {
            return Err(ConfigError::NoProvider);
        }

        let deploy_token = get("DEPLOY_TOKEN").ok_or(ConfigError::Missing("DEPLOY_TOKEN"))?;

        let queue_capacity = match get("STAGE_CI_MAX_QUEUE") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "STAGE_CI_MAX_QUEUE",
                        value: raw,
                    });
                }
            },
            None => DEFAULT_QUEUE_CAPACITY,
        };

        let github_status_mode = match get("GITHUB_STATUS_MODE").as_deref() {
            None | Some("deployment") => GithubStatusMode::Deployment,
            Some("commit") => GithubStatusMode::Commit,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "GITHUB_STATUS_MODE",
                    value: other.to_string(),
                });
            }
        };

        let port = match get("PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                value: raw.clone(),
            })?,
            None => DEFAULT_PORT,
        };

        let address = match get("ADDRESS") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "ADDRESS",
                value: raw.clone(),
            })?,
            None => IpAddr::from([0, 0, 0, 0]),
        };

        Ok(Config {
            github,
            gitlab,
            deploy_token,
            deploy_bin: get("DEPLOY_BIN").unwrap_or_else(|| "now".into()).into(),
            git_bin: get("GIT_BIN").unwrap_or_else(|| "git".into()).into(),
            deploy_dir: get("DEPLOY_DIR")
                .unwrap_or_else(|| DEFAULT_DEPLOY_DIR.into())
                .into(),
            alias_domain: get("ALIAS_DOMAIN")
                .map(|d| d.trim().trim_matches('.').to_ascii_lowercase())
                .unwrap_or_else(|| "now.sh".into()),
            deploy_envs: get("ENVS"),
            queue_capacity,
            github_status_mode,
            address,
            port,
        })
    }
}

fn credentials<G>(
    get: &G,
    token_key: &'static str,
    secret_key: &'static str,
) -> Result<Option<ProviderCredentials>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match (get(token_key), get(secret_key)) {
        (Some(token), Some(secret)) => Ok(Some(ProviderCredentials { token, secret })),
        (None, None) => Ok(None),
        (Some(_), None) => Err(ConfigError::Incomplete {
            present: token_key,
            missing: secret_key,
        }),
        (None, Some(_)) => Err(ConfigError::Incomplete {
            present: secret_key,
            missing: token_key,
        }),
    }
}
