use crate::queue::QueueState;
use serde::{Deserialize, Serialize};

/// Just enough of a GitHub payload to decide whether it is actionable.
#[derive(Debug, Deserialize)]
pub struct GithubActionProbe {
    pub action: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GithubPullRequestEvent {
    pub repository: GithubRepository,
    pub pull_request: GithubPullRequest,
}

#[derive(Debug, Deserialize)]
pub struct GithubRepository {
    pub name: String,
    pub full_name: String,
    pub deployments_url: String,
}

#[derive(Debug, Deserialize)]
pub struct GithubPullRequest {
    pub head: GithubHead,
    pub statuses_url: String,
}

#[derive(Debug, Deserialize)]
pub struct GithubHead {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub sha: String,
    /// `null` when the fork the pull request came from has been deleted.
    pub repo: Option<GithubHeadRepository>,
}

#[derive(Debug, Deserialize)]
pub struct GithubHeadRepository {
    pub full_name: String,
    pub clone_url: String,
}

/// Just enough of a GitLab payload to decide whether it is actionable.
#[derive(Debug, Deserialize)]
pub struct GitlabKindProbe {
    pub object_kind: Option<String>,
    pub object_attributes: Option<GitlabStateProbe>,
}

#[derive(Debug, Deserialize)]
pub struct GitlabStateProbe {
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GitlabMergeRequestEvent {
    pub object_attributes: GitlabMergeRequest,
}

#[derive(Debug, Deserialize)]
pub struct GitlabMergeRequest {
    pub source_branch: String,
    pub last_commit: GitlabCommit,
    pub source: GitlabProject,
    pub target: GitlabProject,
    pub target_project_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct GitlabCommit {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct GitlabProject {
    pub name: String,
    pub path_with_namespace: String,
    pub http_url: String,
    pub web_url: String,
}

/// Body of every non-2xx response: `{"error": {"type", "name", "message"}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: &str, name: &str, message: impl Into<String>) -> Self {
        ApiError {
            error: ErrorDetail {
                kind: kind.to_string(),
                name: name.to_string(),
                message: message.into(),
            },
        }
    }
}

/// Response of `GET /`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub version: &'static str,
    pub queue_state: QueueState,
}
