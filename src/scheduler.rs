//! Periodic passes.
//!
//! A [`PassGate`] guarantees that at most one pass runs at a time. The loop in
//! [`run_periodic`] holds the gate for each pass it starts; an on-demand pass
//! (admin API) uses [`PassGate::try_run`] and is refused while another pass
//! is in flight. Ticks that fall due during a long pass are skipped, not
//! queued.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::orchestrator::{Orchestrator, PassReport};

/// Serializes passes over one orchestrator.
#[derive(Clone)]
pub struct PassGate {
    orchestrator: Arc<Orchestrator>,
    lock: Arc<Mutex<()>>,
}

impl PassGate {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Runs a pass, waiting for any pass in flight to finish first.
    pub async fn run(&self) -> PassReport {
        let _guard = self.lock.lock().await;
        self.orchestrator.run_pass().await
    }

    /// Runs a pass unless one is already in flight, in which case `None`.
    pub async fn try_run(&self) -> Option<PassReport> {
        let _guard = self.lock.try_lock().ok()?;
        Some(self.orchestrator.run_pass().await)
    }
}

/// Runs a pass immediately and then every `interval` until Ctrl-C.
///
/// Cancellation is only observed between passes.
pub async fn run_periodic(gate: PassGate, interval: Duration) -> anyhow::Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    run_until(gate, interval, shutdown).await
}

/// [`run_periodic`] with a caller-supplied stop signal.
pub async fn run_until<F>(gate: PassGate, interval: Duration, stop: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = std::io::Result<()>> + Unpin,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stop = stop;

    tracing::info!(interval_secs = interval.as_secs(), "scheduler started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = gate.run().await;
                tracing::info!(
                    uploaded = report.files_uploaded,
                    failed = report.files_failed,
                    "scheduled pass done"
                );
            }
            result = &mut stop => {
                result?;
                tracing::info!("shutdown requested, scheduler stopped");
                return Ok(());
            }
        }
    }
}
