//! Periodic retry sweep.
//!
//! The scheduler owns the timer and nothing else: every state change goes
//! through the [`RetryOrchestrator`], and delivery goes through a
//! [`Redeliverer`]. One sweep runs at a time per scheduler; a tick that finds
//! a sweep still in flight is skipped.
//!
//! Lifecycle:
//! 1. `start_auto_retry` spawns the loop.
//! 2. The loop waits out the warm-up delay, then probes the store. A failed
//!    probe disables the scheduler and the loop exits.
//! 3. Every `interval` a sweep is spawned. A store authentication failure
//!    during a sweep disables the scheduler and ends the loop.
//! 4. `stop_auto_retry` ends the loop; an in-flight sweep finishes on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use redeliver_core::{FailedEventRecord, FailedEventStatus};

use super::orchestrator::{OrchestratorError, RetryOrchestrator};
use super::redelivery::Redeliverer;
use super::store::FailedEventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Delay before the startup probe, giving the store connection time to come up.
    pub warmup_delay: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            warmup_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("a sweep is already in progress")]
    AlreadyRunning,
    #[error("automatic retries are disabled")]
    Disabled,
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Due records fetched for this sweep.
    pub candidates: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    /// Delivery failed and the attempt budget is spent.
    pub exhausted: usize,
    /// Could not be claimed (gone, terminal, or claimed elsewhere).
    pub skipped: usize,
    /// A record-level update was rejected; the record is left as stored.
    pub errors: usize,
}

struct RunningLoop {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

pub struct SweepScheduler<S, R> {
    orchestrator: Arc<RetryOrchestrator<S>>,
    redeliverer: R,
    config: SweepConfig,
    in_progress: AtomicBool,
    enabled: AtomicBool,
    running: Mutex<Option<RunningLoop>>,
}

impl<S, R> SweepScheduler<S, R>
where
    S: FailedEventStore + 'static,
    R: Redeliverer + 'static,
{
    pub fn new(orchestrator: Arc<RetryOrchestrator<S>>, redeliverer: R, config: SweepConfig) -> Self {
        Self {
            orchestrator,
            redeliverer,
            config,
            in_progress: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> SweepConfig {
        self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether a sweep is executing right now.
    pub fn is_processing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Whether the timer loop is alive.
    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Re-arm after a self-disable. Does not restart the timer.
    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!("failed-event retry scheduler re-enabled");
        }
    }

    /// Start the timer loop. Returns `false` if it is already running.
    pub fn start_auto_retry(self: &Arc<Self>) -> bool {
        let mut running = self.lock_running();
        if running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
        {
            debug!("retry scheduler already running");
            return false;
        }

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(Arc::clone(self).run_loop(Arc::clone(&shutdown)));
        *running = Some(RunningLoop { shutdown, handle });
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            warmup_ms = self.config.warmup_delay.as_millis() as u64,
            "failed-event retry scheduler started"
        );
        true
    }

    /// Stop the timer loop. A sweep already in flight runs to completion.
    ///
    /// Returns `false` if no loop was running.
    pub fn stop_auto_retry(&self) -> bool {
        let Some(running) = self.lock_running().take() else {
            return false;
        };
        running.shutdown.notify_one();
        info!("failed-event retry scheduler stopped");
        !running.handle.is_finished()
    }

    /// Stop the timer loop and wait for it to exit.
    pub async fn shutdown(&self) {
        let running = self.lock_running().take();
        if let Some(running) = running {
            running.shutdown.notify_one();
            if let Err(e) = running.handle.await {
                warn!(error = %e, "retry scheduler loop ended abnormally");
            }
            info!("failed-event retry scheduler shut down");
        }
    }

    /// Run one sweep now.
    ///
    /// Fails fast with `AlreadyRunning` while another sweep is in flight and
    /// with `Disabled` after a self-disable. Store failures abort the sweep;
    /// an authentication failure also disables the scheduler.
    pub async fn process_retries(&self) -> Result<SweepReport, SweepError> {
        if !self.is_enabled() {
            return Err(SweepError::Disabled);
        }
        let Some(_guard) = InProgressGuard::acquire(&self.in_progress) else {
            debug!("sweep skipped; previous sweep still running");
            return Err(SweepError::AlreadyRunning);
        };

        match self.sweep().await {
            Ok(report) => {
                if report.candidates > 0 {
                    info!(
                        candidates = report.candidates,
                        delivered = report.delivered,
                        rescheduled = report.rescheduled,
                        exhausted = report.exhausted,
                        skipped = report.skipped,
                        errors = report.errors,
                        "retry sweep finished"
                    );
                } else {
                    debug!("retry sweep found nothing due");
                }
                Ok(report)
            }
            Err(e) => {
                if e.is_authentication() {
                    self.enabled.store(false, Ordering::SeqCst);
                    error!(error = %e, "store rejected credentials; automatic retries disabled");
                } else {
                    error!(error = %e, "retry sweep aborted");
                }
                Err(e.into())
            }
        }
    }

    async fn sweep(&self) -> Result<SweepReport, OrchestratorError> {
        let due = self.orchestrator.get_due_for_retry().await?;
        let mut report = SweepReport {
            candidates: due.len(),
            ..SweepReport::default()
        };

        for candidate in due {
            match self.retry_one(&candidate).await {
                Ok(Outcome::Delivered) => report.delivered += 1,
                Ok(Outcome::Rescheduled) => report.rescheduled += 1,
                Ok(Outcome::Exhausted) => report.exhausted += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(e) if e.is_infrastructure() => return Err(e),
                Err(e) => {
                    error!(failed_event_id = %candidate.id, error = %e, "retry left record unchanged");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    async fn retry_one(&self, candidate: &FailedEventRecord) -> Result<Outcome, OrchestratorError> {
        let Some(claimed) = self.orchestrator.mark_retrying(candidate.id).await? else {
            return Ok(Outcome::Skipped);
        };

        match self.redeliverer.redeliver(&claimed).await {
            Ok(()) => {
                self.orchestrator.mark_retry_success(claimed.id, None).await?;
                Ok(Outcome::Delivered)
            }
            Err(delivery_err) => {
                debug!(failed_event_id = %claimed.id, error = %delivery_err, "redelivery failed");
                let updated = self
                    .orchestrator
                    .mark_retry_failure(claimed.id, delivery_err.failure_reason())
                    .await?;
                Ok(match updated.map(|r| r.status) {
                    Some(FailedEventStatus::Failed) => Outcome::Exhausted,
                    Some(FailedEventStatus::Pending) => Outcome::Rescheduled,
                    _ => Outcome::Skipped,
                })
            }
        }
    }

    async fn run_loop(self: Arc<Self>, shutdown: Arc<Notify>) {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("retry scheduler stopped during warm-up");
                return;
            }
            _ = tokio::time::sleep(self.config.warmup_delay) => {}
        }

        if let Err(e) = self.orchestrator.ping().await {
            self.enabled.store(false, Ordering::SeqCst);
            error!(error = %e, "failed-event store unreachable at startup; automatic retries disabled");
            return;
        }
        debug!("failed-event store reachable; sweeping");

        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = ticker.tick() => {
                    if !self.is_enabled() {
                        warn!("automatic retries disabled; retry scheduler exiting");
                        break;
                    }
                    if self.is_processing() {
                        debug!("previous sweep still running; tick skipped");
                        continue;
                    }
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        // Outcome is logged inside.
                        let _ = this.process_retries().await;
                    });
                }
            }
        }
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<RunningLoop>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Outcome {
    Delivered,
    Rescheduled,
    Exhausted,
    Skipped,
}

/// Holds the single-flight flag for the duration of a sweep.
struct InProgressGuard<'a>(&'a AtomicBool);

impl<'a> InProgressGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
