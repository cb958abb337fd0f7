//! Background sweep of overdue in-flight commands.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::CommandQueue;

/// Spawn a task that times out overdue in-flight commands every `interval`.
pub fn spawn_overdue_sweeper(
    queue: Arc<CommandQueue>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match queue.release_overdue().await {
                        Ok(released) if released > 0 => {
                            info!(released, "Overdue commands timed out");
                        }
                        Err(e) => {
                            warn!(error = %e, "Overdue command sweep failed");
                        }
                        _ => {}
                    }
                }
                _ = shutdown.changed() => {
                    info!("Command sweeper shutting down");
                    return;
                }
            }
        }
    })
}
