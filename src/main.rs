mod alias;
mod config;
mod errors;
mod logs;
mod pipeline;
mod provider;
mod queue;
mod stage;
mod status;
mod sync;
#[cfg(test)]
mod testutil;
mod types;
mod verify;
mod webhook;

use anyhow::Context;
use config::Config;
use pipeline::Pipeline;
use queue::DeploymentQueue;
use rocket::{Build, Rocket, routes};
use std::sync::Arc;
use tracing::info;

const USER_AGENT: &str = concat!("stage-ci/", env!("CARGO_PKG_VERSION"));

/// Shared, read-only state handed to every request.
pub struct AppState {
    pub config: Config,
    pub queue: DeploymentQueue,
    pub http: reqwest::Client,
}

pub fn build_rocket(state: AppState) -> Rocket<Build> {
    let port = state.config.port;
    let address = state.config.address;

    rocket::build()
        .manage(state)
        .mount("/", routes![webhook::index, webhook::receive])
        .configure(rocket::Config {
            port,
            address,
            ..rocket::Config::default()
        })
}

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    logs::init();

    let config = Config::from_env().context("invalid configuration")?;

    let mut providers = Vec::new();
    if config.github.is_some() {
        providers.push("GitHub");
    }
    if config.gitlab.is_some() {
        providers.push("GitLab");
    }
    info!(
        providers = %providers.join(", "),
        deploy_dir = %config.deploy_dir.display(),
        queue_capacity = config.queue_capacity,
        "Webhook server will start on {}:{}",
        config.address,
        config.port
    );

    let http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build HTTP client")?;

    let pipeline = Arc::new(Pipeline::from_config(&config));
    let queue = DeploymentQueue::start(config.queue_capacity, pipeline);

    let state = AppState {
        config,
        queue,
        http,
    };

    if let Err(e) = build_rocket(state).launch().await {
        anyhow::bail!("server error: {}", e);
    }
    Ok(())
}
