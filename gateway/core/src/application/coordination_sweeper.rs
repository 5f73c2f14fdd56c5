// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Coordination Sweeper - Background task for approval expiry and retention
//!
//! Periodically expires approval requests past their deadline, purges
//! operations that have been finished longer than the retention window and
//! releases resource locks that outlived their timeout.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Bounded memory and timely expiry for the coordinator

use std::sync::Weak;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::coordinator::CrossSessionCoordinator;

/// Coordination sweeper - background task owned by the coordinator
pub struct CoordinationSweeper {
    coordinator: Weak<CrossSessionCoordinator>,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl CoordinationSweeper {
    pub fn new(coordinator: Weak<CrossSessionCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the sweeper background task
    pub fn start(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the sweep loop until shutdown or until the coordinator is gone
    async fn run(&self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting coordination sweeper background task"
        );

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let Some(coordinator) = self.coordinator.upgrade() else {
                        debug!("Coordinator dropped, stopping coordination sweeper");
                        break;
                    };
                    debug!("Running coordination sweep cycle");
                    coordinator.sweep_once();
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping coordination sweeper");
                    break;
                }
            }
        }

        info!("Coordination sweeper background task stopped");
    }
}
