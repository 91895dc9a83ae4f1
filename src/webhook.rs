use crate::AppState;
use crate::errors::{EnqueueError, RejectReason};
use crate::provider::{
    GITHUB_DELIVERY_HEADER, GITHUB_EVENT_HEADER, GITHUB_SIGNATURE_256_HEADER,
    GITHUB_SIGNATURE_HEADER, GITLAB_EVENT_HEADER, GITLAB_TOKEN_HEADER, Normalized, Provider,
    WebhookHeaders,
};
use crate::types::{ApiError, ServiceInfo};
use crate::verify::Verdict;
use rocket::{
    State,
    data::{Data, ToByteUnit},
    get,
    http::Status,
    post,
    request::{FromRequest, Outcome, Request},
    serde::json::Json,
};
use tracing::{info, warn};

pub type ErrorResponse = (Status, Json<ApiError>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for WebhookHeaders {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let header = |name: &str| request.headers().get_one(name).map(|s| s.to_string());

        Outcome::Success(WebhookHeaders {
            github_event: header(GITHUB_EVENT_HEADER),
            hub_signature: header(GITHUB_SIGNATURE_HEADER),
            hub_signature_256: header(GITHUB_SIGNATURE_256_HEADER),
            github_delivery: header(GITHUB_DELIVERY_HEADER),
            gitlab_event: header(GITLAB_EVENT_HEADER),
            gitlab_token: header(GITLAB_TOKEN_HEADER),
        })
    }
}

/// Handler for GET /
#[get("/")]
pub fn index(state: &State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        version: env!("CARGO_PKG_VERSION"),
        queue_state: state.queue.state(),
    })
}

/// Handler for POST /
///
/// Verifies and normalizes the event, queues it and answers immediately:
/// `200` when a deployment was queued, `204` when the event is not actionable.
#[post("/", data = "<data>")]
pub async fn receive(
    state: &State<AppState>,
    headers: WebhookHeaders,
    data: Data<'_>,
) -> Result<Status, ErrorResponse> {
    let Some(provider) = Provider::detect(&headers) else {
        return Err(invalid(
            "UNKNOWN_PROVIDER",
            format!(
                "Expected a {} or {} header",
                GITHUB_EVENT_HEADER, GITLAB_EVENT_HEADER
            ),
        ));
    };

    // Signatures cover the exact bytes received, so the body is kept raw.
    let body = match data.open(5.megabytes()).into_bytes().await {
        Ok(bytes) if bytes.is_complete() => bytes.into_inner(),
        Ok(_) => return Err(invalid("INVALID_PAYLOAD", "Request body is too large")),
        Err(_) => return Err(invalid("INVALID_PAYLOAD", "Failed to read request body")),
    };

    let Some(credentials) = provider.credentials(&state.config) else {
        warn!(
            provider = provider.name(),
            reason = %RejectReason::NotConfigured,
            "Rejected webhook"
        );
        return Err(unsafe_payload(provider));
    };

    if let Verdict::Rejected(reason) = provider.verify(credentials, &headers, &body) {
        warn!(provider = provider.name(), reason = %reason, "Rejected webhook");
        return Err(unsafe_payload(provider));
    }

    let normalized = provider
        .normalize(credentials, &headers, &body, &state.config, &state.http)
        .map_err(|e| {
            warn!(provider = provider.name(), error = %e, "Unusable webhook payload");
            invalid("INVALID_PAYLOAD", e.to_string())
        })?;

    let request = match normalized {
        Normalized::Deploy(request) => request,
        Normalized::Ignored(reason) => {
            info!(provider = provider.name(), reason = %reason, "Ignoring webhook");
            return Ok(Status::NoContent);
        }
    };

    info!(
        provider = provider.name(),
        delivery = headers.github_delivery.as_deref().unwrap_or("-"),
        repo = request.source_repo_name(),
        git_ref = request.git_ref(),
        commit = request.commit(),
        alias = request.alias(),
        "Queueing deployment"
    );

    match state.queue.enqueue(request) {
        Ok(()) => Ok(Status::Ok),
        Err(e) => {
            warn!(error = %e, "Deployment not queued");
            let name = match e {
                EnqueueError::QueueFull { .. } => "QUEUE_FULL",
                EnqueueError::Closed => "QUEUE_CLOSED",
            };
            Err((
                Status::ServiceUnavailable,
                Json(ApiError::new("transient", name, e.to_string())),
            ))
        }
    }
}

fn unsafe_payload(provider: Provider) -> ErrorResponse {
    let name = provider.name();
    (
        Status::InternalServerError,
        Json(ApiError::new(
            "fatal",
            "UNSAFE_WEBHOOK_PAYLOAD",
            format!(
                "We could not cryptographically verify the payload sent to the stage-ci webhook from {name}. \
                 Make sure your {var} environment variable matches the Secret field in your {name} webhook config {hint}.",
                name = name,
                var = provider.secret_variable(),
                hint = provider.webhook_settings_hint(),
            ),
        )),
    )
}

fn invalid(name: &str, message: impl Into<String>) -> ErrorResponse {
    (
        Status::BadRequest,
        Json(ApiError::new("invalid", name, message)),
    )
}
