//! Provider dispatch and event normalization.
//!
//! A webhook is routed to GitHub or GitLab by which event header it carries,
//! then verified and turned into a provider-agnostic [`DeployRequest`].

use crate::alias::{alias_url, sanitize};
use crate::config::{Config, GithubStatusMode, ProviderCredentials};
use crate::errors::{NormalizeError, ReportError};
use crate::status::{
    DeployState, GithubCommitStatusReporter, GithubDeploymentReporter, GitlabStatusReporter,
    StatusReporter,
};
use crate::sync::CloneUrl;
use crate::types::{
    GithubActionProbe, GithubPullRequestEvent, GitlabKindProbe, GitlabMergeRequestEvent,
};
use crate::verify::{Verdict, verify_signature, verify_token};
use std::fmt;
use std::sync::Arc;
use url::Url;

pub const GITHUB_EVENT_HEADER: &str = "X-GitHub-Event";
pub const GITHUB_SIGNATURE_HEADER: &str = "X-Hub-Signature";
pub const GITHUB_SIGNATURE_256_HEADER: &str = "X-Hub-Signature-256";
pub const GITHUB_DELIVERY_HEADER: &str = "X-GitHub-Delivery";
pub const GITLAB_EVENT_HEADER: &str = "X-Gitlab-Event";
pub const GITLAB_TOKEN_HEADER: &str = "X-Gitlab-Token";

const GITHUB_ACTIONS: [&str; 2] = ["opened", "synchronize"];
const GITLAB_STATES: [&str; 2] = ["opened", "reopened"];
const DEFAULT_REMOTE: &str = "origin";
const GITLAB_CLONE_USER: &str = "gitlab-ci-token";

/// The provider-identifying headers of an inbound webhook.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    pub github_event: Option<String>,
    pub hub_signature: Option<String>,
    pub hub_signature_256: Option<String>,
    pub github_delivery: Option<String>,
    pub gitlab_event: Option<String>,
    pub gitlab_token: Option<String>,
}

/// One unit of deployment work.
///
/// Everything but the status capability is fixed at construction; in
/// particular `commit` is never re-resolved from `git_ref`.
pub struct DeployRequest {
    source_repo_name: String,
    git_ref: String,
    commit: String,
    clone_url: CloneUrl,
    remote: String,
    alias: String,
    reporter: Arc<dyn StatusReporter>,
}

impl DeployRequest {
    pub fn source_repo_name(&self) -> &str {
        &self.source_repo_name
    }

    pub fn git_ref(&self) -> &str {
        &self.git_ref
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn clone_url(&self) -> &CloneUrl {
        &self.clone_url
    }

    /// Git remote to fetch from. Differs from `origin` for pull requests from forks.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub async fn report_status(
        &self,
        state: DeployState,
        description: &str,
        target_url: &str,
    ) -> Result<(), ReportError> {
        self.reporter.report(state, description, target_url).await
    }

    #[cfg(test)]
    pub fn for_test(
        repo: &str,
        git_ref: &str,
        commit: &str,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        let name = repo.rsplit('/').next().unwrap_or(repo);
        DeployRequest {
            source_repo_name: repo.to_string(),
            git_ref: git_ref.to_string(),
            commit: commit.to_string(),
            clone_url: CloneUrl::with_credentials(
                &format!("https://github.com/{}.git", repo),
                "token",
                None,
            )
            .unwrap(),
            remote: DEFAULT_REMOTE.to_string(),
            alias: alias_url(name, git_ref, "now.sh"),
            reporter,
        }
    }
}

impl fmt::Debug for DeployRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployRequest")
            .field("source_repo_name", &self.source_repo_name)
            .field("git_ref", &self.git_ref)
            .field("commit", &self.commit)
            .field("clone_url", &self.clone_url)
            .field("remote", &self.remote)
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}

/// Result of normalizing a verified payload.
#[derive(Debug)]
pub enum Normalized {
    Deploy(DeployRequest),
    /// Not actionable (wrong event, action or state). Carries a short reason for logs.
    Ignored(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Github,
    Gitlab,
}

impl Provider {
    pub fn detect(headers: &WebhookHeaders) -> Option<Provider> {
        if headers.github_event.is_some() {
            Some(Provider::Github)
        } else if headers.gitlab_event.is_some() {
            Some(Provider::Gitlab)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Github => "GitHub",
            Provider::Gitlab => "GitLab",
        }
    }

    pub fn secret_variable(&self) -> &'static str {
        match self {
            Provider::Github => "GITHUB_WEBHOOK_SECRET",
            Provider::Gitlab => "GITLAB_WEBHOOK_SECRET",
        }
    }

    pub fn webhook_settings_hint(&self) -> &'static str {
        match self {
            Provider::Github => {
                "at https://github.com/{OWNERNAME}/{REPONAME}/settings/hooks (swap in the path to your repo)"
            }
            Provider::Gitlab => {
                "at https://gitlab.com/{OWNERNAME}/{REPONAME}/settings/integrations (swap in the path to your repo)"
            }
        }
    }

    pub fn credentials<'a>(&self, config: &'a Config) -> Option<&'a ProviderCredentials> {
        match self {
            Provider::Github => config.github.as_ref(),
            Provider::Gitlab => config.gitlab.as_ref(),
        }
    }

    /// Check the request came from this provider. `body` must be the raw bytes as received.
    pub fn verify(
        &self,
        credentials: &ProviderCredentials,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> Verdict {
        match self {
            Provider::Github => match headers.hub_signature_256.as_deref() {
                Some(signature) => verify_signature(
                    &credentials.secret,
                    body,
                    GITHUB_SIGNATURE_256_HEADER,
                    Some(signature),
                ),
                None => verify_signature(
                    &credentials.secret,
                    body,
                    GITHUB_SIGNATURE_HEADER,
                    headers.hub_signature.as_deref(),
                ),
            },
            Provider::Gitlab => verify_token(
                &credentials.secret,
                GITLAB_TOKEN_HEADER,
                headers.gitlab_token.as_deref(),
            ),
        }
    }

    /// Turn a verified payload into a deploy request, or decide it is not actionable.
    pub fn normalize(
        &self,
        credentials: &ProviderCredentials,
        headers: &WebhookHeaders,
        body: &[u8],
        config: &Config,
        http: &reqwest::Client,
    ) -> Result<Normalized, NormalizeError> {
        match self {
            Provider::Github => normalize_github(credentials, headers, body, config, http),
            Provider::Gitlab => normalize_gitlab(credentials, body, config, http),
        }
    }
}

fn normalize_github(
    credentials: &ProviderCredentials,
    headers: &WebhookHeaders,
    body: &[u8],
    config: &Config,
    http: &reqwest::Client,
) -> Result<Normalized, NormalizeError> {
    let event = headers.github_event.as_deref().unwrap_or_default();
    if event != "pull_request" {
        return Ok(Normalized::Ignored(format!("event {:?}", event)));
    }

    let probe: GithubActionProbe = serde_json::from_slice(body)?;
    let action = probe.action.unwrap_or_default();
    if !GITHUB_ACTIONS.contains(&action.as_str()) {
        return Ok(Normalized::Ignored(format!("action {:?}", action)));
    }

    let event: GithubPullRequestEvent = serde_json::from_slice(body)?;
    let head = event.pull_request.head;
    let head_repo = head
        .repo
        .ok_or(NormalizeError::MissingField("pull_request.head.repo"))?;
    validate_ref(&head.git_ref)?;
    validate_commit(&head.sha)?;

    let clone_url = CloneUrl::with_credentials(&head_repo.clone_url, &credentials.token, None)?;
    let remote = if head_repo.full_name == event.repository.full_name {
        DEFAULT_REMOTE.to_string()
    } else {
        remote_name(&head_repo.full_name)
    };
    let alias = alias_url(&event.repository.name, &head.git_ref, &config.alias_domain);

    let reporter: Arc<dyn StatusReporter> = match config.github_status_mode {
        GithubStatusMode::Deployment => Arc::new(GithubDeploymentReporter::new(
            http.clone(),
            &credentials.token,
            &event.repository.deployments_url,
            &head.sha,
        )),
        GithubStatusMode::Commit => Arc::new(GithubCommitStatusReporter::new(
            http.clone(),
            &credentials.token,
            &event.pull_request.statuses_url,
        )),
    };

    Ok(Normalized::Deploy(DeployRequest {
        source_repo_name: event.repository.full_name,
        git_ref: head.git_ref,
        commit: head.sha,
        clone_url,
        remote,
        alias,
        reporter,
    }))
}

fn normalize_gitlab(
    credentials: &ProviderCredentials,
    body: &[u8],
    config: &Config,
    http: &reqwest::Client,
) -> Result<Normalized, NormalizeError> {
    let probe: GitlabKindProbe = serde_json::from_slice(body)?;
    let kind = probe.object_kind.unwrap_or_default();
    if kind != "merge_request" {
        return Ok(Normalized::Ignored(format!("object_kind {:?}", kind)));
    }
    let state = probe
        .object_attributes
        .and_then(|a| a.state)
        .unwrap_or_default();
    if !GITLAB_STATES.contains(&state.as_str()) {
        return Ok(Normalized::Ignored(format!("state {:?}", state)));
    }

    let event: GitlabMergeRequestEvent = serde_json::from_slice(body)?;
    let mr = event.object_attributes;
    validate_ref(&mr.source_branch)?;
    validate_commit(&mr.last_commit.id)?;

    let statuses_url = gitlab_statuses_url(&mr.source.web_url, mr.target_project_id, &mr.last_commit.id)?;
    let clone_url = CloneUrl::with_credentials(
        &mr.source.http_url,
        GITLAB_CLONE_USER,
        Some(&credentials.token),
    )?;
    // Keyed like the working copy: the target project, even for merge requests from forks.
    let alias = alias_url(&mr.target.name, &mr.source_branch, &config.alias_domain);

    Ok(Normalized::Deploy(DeployRequest {
        source_repo_name: mr.target.path_with_namespace,
        git_ref: mr.source_branch,
        commit: mr.last_commit.id,
        clone_url,
        remote: DEFAULT_REMOTE.to_string(),
        alias,
        reporter: Arc::new(GitlabStatusReporter::new(
            http.clone(),
            &credentials.token,
            &statuses_url,
        )),
    }))
}

/// `<scheme>://<host>[:port]/api/v4/projects/<id>/statuses/<sha>`
fn gitlab_statuses_url(web_url: &str, project_id: u64, commit: &str) -> Result<String, NormalizeError> {
    let url = Url::parse(web_url).map_err(|source| NormalizeError::Url {
        url: web_url.to_string(),
        source,
    })?;
    Ok(format!(
        "{}/api/v4/projects/{}/statuses/{}",
        url.origin().ascii_serialization(),
        project_id,
        commit
    ))
}

fn remote_name(full_name: &str) -> String {
    let name = sanitize(full_name);
    if name.is_empty() {
        DEFAULT_REMOTE.to_string()
    } else {
        name
    }
}

/// Refs are handed to git as arguments, so reject anything that could read as an option.
fn validate_ref(git_ref: &str) -> Result<(), NormalizeError> {
    let bad = git_ref.is_empty()
        || git_ref.starts_with('-')
        || git_ref.contains("..")
        || git_ref.chars().any(|c| c.is_whitespace() || c.is_control());
    if bad {
        return Err(NormalizeError::Invalid {
            field: "ref",
            value: git_ref.to_string(),
        });
    }
    Ok(())
}

fn validate_commit(commit: &str) -> Result<(), NormalizeError> {
    if (4..=64).contains(&commit.len()) && commit.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(NormalizeError::Invalid {
            field: "commit",
            value: commit.to_string(),
        })
    }
}
