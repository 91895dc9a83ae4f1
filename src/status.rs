//! Commit/deployment status reporting back to the provider.

use crate::errors::ReportError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::info;

/// Label identifying this service as the author of a status.
pub const STATUS_CONTEXT: &str = "ci/stage-ci";

const GITHUB_ACCEPT: &str = "application/vnd.github.ant-man-preview+json, application/json";
const GITHUB_ENVIRONMENT: &str = "PR staging";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployState {
    Pending,
    Success,
    Error,
}

impl DeployState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployState::Pending => "pending",
            DeployState::Success => "success",
            DeployState::Error => "error",
        }
    }

    /// GitLab has no `error` state for commit statuses.
    pub fn gitlab_state(&self) -> &'static str {
        match self {
            DeployState::Error => "failed",
            other => other.as_str(),
        }
    }
}

/// Posts lifecycle updates for one deploy request. Implementations close over
/// the provider endpoint and credentials.
#[rocket::async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(
        &self,
        state: DeployState,
        description: &str,
        target_url: &str,
    ) -> Result<(), ReportError>;
}

/// GitHub Deployments API. The deployment is created lazily on the first report.
pub struct GithubDeploymentReporter {
    http: reqwest::Client,
    token: String,
    deployments_url: String,
    commit: String,
    deployment_id: Mutex<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct CreatedDeployment {
    id: u64,
}

impl GithubDeploymentReporter {
    pub fn new(http: reqwest::Client, token: &str, deployments_url: &str, commit: &str) -> Self {
        GithubDeploymentReporter {
            http,
            token: token.to_string(),
            deployments_url: deployments_url.trim_end_matches('/').to_string(),
            commit: commit.to_string(),
            deployment_id: Mutex::new(None),
        }
    }

    async fn deployment_id(&self) -> Result<u64, ReportError> {
        let mut guard = self.deployment_id.lock().await;
        if let Some(id) = *guard {
            return Ok(id);
        }

        let response = self
            .http
            .post(&self.deployments_url)
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", GITHUB_ACCEPT)
            .json(&github_deployment_body(&self.commit))
            .send()
            .await?;
        let created: CreatedDeployment = ensure_success(response).await?.json().await?;

        *guard = Some(created.id);
        Ok(created.id)
    }
}

#[rocket::async_trait]
impl StatusReporter for GithubDeploymentReporter {
    async fn report(
        &self,
        state: DeployState,
        description: &str,
        target_url: &str,
    ) -> Result<(), ReportError> {
        info!(state = state.as_str(), "Setting GitHub deployment status");
        let id = self.deployment_id().await?;

        let response = self
            .http
            .post(format!("{}/{}/statuses", self.deployments_url, id))
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", GITHUB_ACCEPT)
            .json(&github_deployment_status_body(state, description, target_url))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

/// GitHub commit statuses on the pull request head.
pub struct GithubCommitStatusReporter {
    http: reqwest::Client,
    token: String,
    statuses_url: String,
}

impl GithubCommitStatusReporter {
    pub fn new(http: reqwest::Client, token: &str, statuses_url: &str) -> Self {
        GithubCommitStatusReporter {
            http,
            token: token.to_string(),
            statuses_url: statuses_url.to_string(),
        }
    }
}

#[rocket::async_trait]
impl StatusReporter for GithubCommitStatusReporter {
    async fn report(
        &self,
        state: DeployState,
        description: &str,
        target_url: &str,
    ) -> Result<(), ReportError> {
        info!(state = state.as_str(), "Setting GitHub commit status");
        let response = self
            .http
            .post(&self.statuses_url)
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", GITHUB_ACCEPT)
            .json(&commit_status_body(state.as_str(), description, target_url))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

/// GitLab commit statuses.
pub struct GitlabStatusReporter {
    http: reqwest::Client,
    token: String,
    statuses_url: String,
}

impl GitlabStatusReporter {
    pub fn new(http: reqwest::Client, token: &str, statuses_url: &str) -> Self {
        GitlabStatusReporter {
            http,
            token: token.to_string(),
            statuses_url: statuses_url.to_string(),
        }
    }
}

#[rocket::async_trait]
impl StatusReporter for GitlabStatusReporter {
    async fn report(
        &self,
        state: DeployState,
        description: &str,
        target_url: &str,
    ) -> Result<(), ReportError> {
        info!(state = state.gitlab_state(), "Setting GitLab status");
        let response = self
            .http
            .post(&self.statuses_url)
            .header("PRIVATE-TOKEN", &self.token)
            .json(&commit_status_body(
                state.gitlab_state(),
                description,
                target_url,
            ))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

fn github_deployment_body(commit: &str) -> Value {
    json!({
        "ref": commit,
        "auto_merge": false,
        "required_contexts": [],
        "transient_environment": true,
        "environment": GITHUB_ENVIRONMENT,
    })
}

fn github_deployment_status_body(state: DeployState, description: &str, target_url: &str) -> Value {
    json!({
        "state": state.as_str(),
        "description": description,
        "environment_url": target_url,
        "target_url": target_url,
        "auto_inactive": false,
    })
}

fn commit_status_body(state: &str, description: &str, target_url: &str) -> Value {
    json!({
        "state": state,
        "description": description,
        "target_url": target_url,
        "context": STATUS_CONTEXT,
    })
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ReportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ReportError::Rejected { status, body })
}
