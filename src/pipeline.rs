use crate::config::Config;
use crate::errors::PipelineError;
use crate::provider::DeployRequest;
use crate::queue::JobRunner;
use crate::stage::StagingRunner;
use crate::status::DeployState;
use crate::sync::RepositorySyncer;
use tracing::{Instrument, error, info, info_span, warn};

/// What the queue worker does with each request: report pending, sync, stage,
/// then report success or error. Nothing is retried.
pub struct Pipeline {
    syncer: RepositorySyncer,
    stager: StagingRunner,
}

impl Pipeline {
    pub fn new(syncer: RepositorySyncer, stager: StagingRunner) -> Self {
        Pipeline { syncer, stager }
    }

    pub fn from_config(config: &Config) -> Self {
        Pipeline::new(
            RepositorySyncer::new(&config.git_bin, &config.deploy_dir),
            StagingRunner::new(
                &config.deploy_bin,
                &config.deploy_token,
                config.deploy_envs.as_deref(),
            ),
        )
    }

    async fn deploy(&self, request: &DeployRequest) -> Result<String, PipelineError> {
        let dir = self.syncer.working_dir(request.source_repo_name());
        self.syncer
            .sync(
                request.clone_url(),
                request.remote(),
                &dir,
                request.git_ref(),
                request.commit(),
            )
            .await?;
        let alias = self.stager.stage(&dir, request.alias()).await?;
        Ok(alias)
    }
}

#[rocket::async_trait]
impl JobRunner for Pipeline {
    async fn run(&self, request: DeployRequest) {
        let span = info_span!(
            "deploy",
            repo = request.source_repo_name(),
            git_ref = request.git_ref(),
            commit = request.commit(),
        );

        async {
            let alias = request.alias().to_string();
            info!(alias = %alias, "Deploying");

            report(&request, DeployState::Pending, &format!("Staging at {}", alias), &alias).await;

            match self.deploy(&request).await {
                Ok(live) => {
                    report(&request, DeployState::Success, &format!("Staged at {}", live), &live)
                        .await;
                }
                Err(e) => {
                    error!(error = ?e, "Deployment failed: {}", e);
                    report(
                        &request,
                        DeployState::Error,
                        &format!("Could not stage {}", alias),
                        &alias,
                    )
                    .await;
                }
            }

            info!("Done");
        }
        .instrument(span)
        .await
    }
}

/// Status failures are logged and never escalate into the job.
async fn report(request: &DeployRequest, state: DeployState, description: &str, target_url: &str) {
    match request.report_status(state, description, target_url).await {
        Ok(()) => info!(state = state.as_str(), "Status reported"),
        Err(e) => warn!(state = state.as_str(), "Failed to report status: {}", e),
    }
}
