//! Error types for the staging pipeline

use thiserror::Error;

/// Startup configuration failures. Any of these aborts the process.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be defined in environment")]
    Missing(&'static str),

    #[error("{present} is set but {missing} is not; both must be defined")]
    Incomplete {
        present: &'static str,
        missing: &'static str,
    },

    #[error("GITHUB_TOKEN/GITHUB_WEBHOOK_SECRET and/or GITLAB_TOKEN/GITLAB_WEBHOOK_SECRET must be defined in environment")]
    NoProvider,

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Why an inbound webhook failed its authenticity check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("malformed signature header")]
    MalformedSignature,

    #[error("signature does not match payload")]
    SignatureMismatch,

    #[error("token does not match")]
    TokenMismatch,

    #[error("provider is not configured")]
    NotConfigured,
}

/// A verified payload that cannot be turned into a deploy request.
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("invalid url {url:?}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("cannot embed credentials in {0}")]
    Credentials(String),

    #[error("payload is missing {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {value:?}")]
    Invalid { field: &'static str, value: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("deployment queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("deployment queue is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} exited with {status}: {stderr}")]
    Failed {
        command: &'static str,
        status: String,
        stderr: String,
    },
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("failed to run deploy tool: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("alias failed: {0}")]
    AliasFailed(String),
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Failure of one deployment job after it left the queue.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("stage error: {0}")]
    Stage(#[from] StageError),
}
