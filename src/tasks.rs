//! Background tasks for scheduled engine maintenance.
//!
//! - Hibernation sweeper: archives cold terminal workflows on the
//!   configured interval.
//! - Workflow discovery: picks up active workflows started by other
//!   replicas (or left over from a crash) and resumes their runners.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use crate::orchestrator::Engine;

/// How often a replica scans the index for workflows it is not yet
/// driving.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// Start the hibernation sweeper.
///
/// Every sweep interval, terminal workflows older than the threshold
/// are copied to blob storage and deleted from the event store.
pub async fn start_hibernation_sweeper(engine: Arc<Engine>) {
    let mut ticker = interval(engine_sweep_interval(&engine));

    loop {
        ticker.tick().await;

        match engine.sweep_hibernation().await {
            Ok(0) => {}
            Ok(moved) => info!("hibernated {moved} cold workflows"),
            Err(e) => error!("hibernation sweep error: {e}"),
        }
    }
}

fn engine_sweep_interval(engine: &Engine) -> Duration {
    engine.config().hibernate_sweep.max(Duration::from_millis(100))
}

/// Start the workflow discovery loop.
///
/// `Engine::recover` is idempotent per workflow, so running it on an
/// interval doubles as cross-replica discovery: any non-terminal
/// workflow in the index gets a local runner if it lacks one.
pub async fn start_workflow_discovery(engine: Arc<Engine>) {
    let mut ticker = interval(DISCOVERY_INTERVAL);

    loop {
        ticker.tick().await;

        if let Err(e) = engine.recover().await {
            error!("workflow discovery error: {e}");
        }
    }
}
