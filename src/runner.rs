//! Engine runner: the periodic driver behind the autonomous loop.
//!
//! Each cycle expires due sessions, ticks the DCA scheduler, submits due
//! copy executions, and sweeps timed-out execution records. Errors are
//! absorbed per cycle so one bad tick cannot halt the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::api::{ChainSubmitter, MarketDataSource};
use crate::copy_trading::CopyEngine;
use crate::dca::DcaScheduler;
use crate::execution::ExecutionStore;
use crate::session::SessionEnforcer;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Cycle interval in seconds.
    pub tick_interval_secs: u64,
    /// How long a record may stay non-terminal before the sweep fails it.
    pub execution_timeout_minutes: i64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            execution_timeout_minutes: 30,
        }
    }
}

pub struct Runner<M, C> {
    sessions: Arc<SessionEnforcer>,
    executions: Arc<ExecutionStore>,
    dca: DcaScheduler<M, C>,
    copy: CopyEngine<C>,
    config: RunnerConfig,
    shutdown: Arc<AtomicBool>,
}

impl<M: MarketDataSource, C: ChainSubmitter> Runner<M, C> {
    pub fn new(
        sessions: Arc<SessionEnforcer>,
        executions: Arc<ExecutionStore>,
        dca: DcaScheduler<M, C>,
        copy: CopyEngine<C>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            sessions,
            executions,
            dca,
            copy,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Main run loop. Returns after a shutdown signal.
    pub async fn run(&self) -> Result<()> {
        info!(
            interval = self.config.tick_interval_secs,
            timeout_minutes = self.config.execution_timeout_minutes,
            "Starting engine run loop"
        );

        let mut tick_interval = interval(Duration::from_secs(self.config.tick_interval_secs));

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            tick_interval.tick().await;

            if let Err(e) = self.tick().await {
                error!(error = %e, "Error in engine tick");
            }
        }

        info!("Engine run loop stopped");
        Ok(())
    }

    /// One cycle of the engine.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        debug!("Engine tick");

        // 1. Expire due sessions so downstream guards see fresh status.
        if let Err(e) = self.sessions.cleanup_expired(now).await {
            error!(error = %e, "Session cleanup failed");
        }

        // 2. Run due DCA strategies.
        match self.dca.tick(now).await {
            Ok(summary) if summary.selected > 0 => {
                info!(
                    selected = summary.selected,
                    submitted = summary.submitted,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "DCA cycle"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "DCA cycle failed"),
        }

        // 3. Submit copy executions whose delay has elapsed.
        match self.copy.execute_due(now).await {
            Ok(submitted) if submitted > 0 => {
                info!(submitted, "Copy executions submitted");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Copy submission cycle failed"),
        }

        // 4. Sweep executions stuck past the timeout bound.
        match self
            .executions
            .sweep_timeouts(
                now,
                chrono::Duration::minutes(self.config.execution_timeout_minutes),
            )
            .await
        {
            Ok(swept) if swept > 0 => info!(swept, "Timed-out executions failed"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Timeout sweep failed"),
        }

        Ok(())
    }
}
