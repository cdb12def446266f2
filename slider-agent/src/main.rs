//! Slider Agent - host-resident agent for one Slider-managed component
//!
//! The agent represents a single managed component to the cluster manager:
//! - Registration handshake against the server's agent endpoint
//! - Periodic heartbeat exchanging command work and execution results
//! - Local lifecycle supervision (expected vs. actual component state)
//! - Autonomous restart/self-stop decisions relayed via process exit codes

mod config;
mod controller;
mod error;
mod heartbeat;
mod messages;
mod queue;
mod registration;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AgentConfig;
use crate::controller::{Controller, ControllerExit, AGENT_AUTO_RESTART_EXIT_CODE};
use crate::queue::CommandQueue;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AgentConfig::load()
        .await
        .context("failed to load agent configuration")?;
    info!(
        label = %config.agent.label,
        server = %config.base_url(),
        "slider agent starting"
    );

    // The command executor worker attaches to this queue out of band; the
    // controller only ever submits work and reads result snapshots.
    let queue = Arc::new(CommandQueue::new());
    let mut controller = Controller::new(config, queue);

    match controller.run().await {
        ControllerExit::Stopped => {
            info!("agent stopped");
            Ok(())
        }
        ControllerExit::Restart => {
            // The supervisor watches for this exit code and relaunches us.
            info!(code = AGENT_AUTO_RESTART_EXIT_CODE, "exiting for restart");
            std::process::exit(AGENT_AUTO_RESTART_EXIT_CODE);
        }
        ControllerExit::Failed => std::process::exit(1),
    }
}
