//! Background sweep that keeps every stored credential fresh.
//!
//! Each cycle enumerates the stored principals and runs them through
//! [`RefreshEngine::refresh_if_needed`] with a fixed horizon. Ticks that
//! arrive while a cycle is in flight are dropped. A panicking cycle is
//! caught, recorded, and followed by a cooldown before the loop resumes.

use crate::config::RefreshConfig;
use crate::credentials::{CredentialStore, Expiry, Principal};
use crate::refresh::{RefreshEngine, RefreshOutcome};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sweep timing.
#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    /// Pause between cycles
    pub interval: StdDuration,
    /// Credentials expiring within this horizon are refreshed
    pub horizon: Duration,
    /// Pause after a failed cycle
    pub cooldown: StdDuration,
}

impl SchedulerSettings {
    pub fn from_config(config: &RefreshConfig) -> Self {
        Self {
            interval: StdDuration::from_secs(config.sweep_interval_secs),
            horizon: Duration::hours(config.horizon_hours),
            cooldown: StdDuration::from_secs(config.cooldown_secs),
        }
    }
}

/// What a sweep did for one principal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PrincipalOutcome {
    Refreshed { expires_at: Expiry },
    NotNeeded,
    Failed { reason: String, attempt_count: u32 },
    /// Listed but no readable credential
    Unavailable,
}

impl From<&RefreshOutcome> for PrincipalOutcome {
    fn from(outcome: &RefreshOutcome) -> Self {
        match outcome {
            RefreshOutcome::Refreshed(credential) => PrincipalOutcome::Refreshed {
                expires_at: credential.expires_at,
            },
            RefreshOutcome::NotNeeded => PrincipalOutcome::NotNeeded,
            RefreshOutcome::Failed {
                reason,
                attempt_count,
            } => PrincipalOutcome::Failed {
                reason: reason.clone(),
                attempt_count: *attempt_count,
            },
        }
    }
}

/// Result of one completed sweep.
#[derive(Clone, Debug, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checked: usize,
    pub refreshed: usize,
    pub not_needed: usize,
    pub failed: usize,
    /// The stop signal arrived before every principal was checked
    pub stopped_early: bool,
    pub outcomes: BTreeMap<String, PrincipalOutcome>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Scheduler counters and the last sweep.
#[derive(Clone, Debug, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub ticks_suppressed: u64,
    pub last_sweep: Option<SweepReport>,
    pub last_error: Option<String>,
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        Self {
            state: SchedulerState::Idle,
            cycles_completed: 0,
            cycles_failed: 0,
            ticks_suppressed: 0,
            last_sweep: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CycleError {
    #[error("a sweep is already in flight")]
    AlreadyRunning,
    #[error("sweep panicked: {0}")]
    Panicked(String),
}

/// Clears the in-flight flag when a cycle ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Periodic refresh of all stored credentials.
pub struct Scheduler {
    store: Arc<CredentialStore>,
    engine: Arc<RefreshEngine>,
    settings: SchedulerSettings,
    running: AtomicBool,
    status: Mutex<SchedulerStatus>,
    shutdown: watch::Sender<bool>,
    last_outcomes: DashMap<Principal, PrincipalOutcome>,
}

impl Scheduler {
    pub fn new(
        store: Arc<CredentialStore>,
        engine: Arc<RefreshEngine>,
        settings: SchedulerSettings,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            engine,
            settings,
            running: AtomicBool::new(false),
            status: Mutex::new(SchedulerStatus::default()),
            shutdown,
            last_outcomes: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Spawns the sweep loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }

    /// Sweep loop: cycle, sleep, repeat until stopped.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        info!(
            interval_secs = self.settings.interval.as_secs(),
            horizon_hours = self.settings.horizon.num_hours(),
            "Token refresh scheduler started"
        );

        while !self.is_stopping() {
            let pause = match self.run_cycle().await {
                Ok(_) | Err(CycleError::AlreadyRunning) => self.settings.interval,
                Err(CycleError::Panicked(_)) => {
                    warn!(
                        cooldown_secs = self.settings.cooldown.as_secs_f64(),
                        "Cooling down after failed sweep"
                    );
                    self.settings.cooldown
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Token refresh scheduler stopped");
    }

    /// Forces a sweep now, outside the regular interval.
    pub async fn run_now(&self) -> Result<SweepReport, CycleError> {
        self.run_cycle().await
    }

    /// Runs one cycle unless another is in flight.
    pub async fn run_cycle(&self) -> Result<SweepReport, CycleError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.status.lock().await.ticks_suppressed += 1;
            debug!("Sweep already in flight, tick suppressed");
            return Err(CycleError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        self.status.lock().await.state = SchedulerState::Running;
        let result = AssertUnwindSafe(self.sweep()).catch_unwind().await;

        let mut status = self.status.lock().await;
        status.state = SchedulerState::Idle;
        match result {
            Ok(report) => {
                status.cycles_completed += 1;
                status.last_sweep = Some(report.clone());
                status.last_error = None;
                Ok(report)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                status.cycles_failed += 1;
                status.last_error = Some(message.clone());
                error!(error = %message, "Token sweep panicked");
                Err(CycleError::Panicked(message))
            }
        }
    }

    async fn sweep(&self) -> SweepReport {
        let started_at = Utc::now();
        let principals = self.store.list_principals();
        info!(count = principals.len(), "Starting token sweep");

        let mut report = SweepReport {
            started_at,
            finished_at: started_at,
            checked: 0,
            refreshed: 0,
            not_needed: 0,
            failed: 0,
            stopped_early: false,
            outcomes: BTreeMap::new(),
        };

        for principal in principals {
            if self.is_stopping() {
                info!("Stop requested, ending sweep early");
                report.stopped_early = true;
                break;
            }

            let outcome = match self.store.load(&principal) {
                Some(credential) => PrincipalOutcome::from(
                    &self
                        .engine
                        .refresh_if_needed(&credential, self.settings.horizon)
                        .await,
                ),
                None => {
                    warn!(principal = %principal, "Listed credential is unreadable");
                    PrincipalOutcome::Unavailable
                }
            };

            report.checked += 1;
            match &outcome {
                PrincipalOutcome::Refreshed { .. } => report.refreshed += 1,
                PrincipalOutcome::NotNeeded => report.not_needed += 1,
                PrincipalOutcome::Failed { .. } | PrincipalOutcome::Unavailable => {
                    report.failed += 1
                }
            }
            self.last_outcomes.insert(principal.clone(), outcome.clone());
            report.outcomes.insert(principal.key(), outcome);
        }

        report.finished_at = Utc::now();
        info!(
            checked = report.checked,
            refreshed = report.refreshed,
            failed = report.failed,
            "Token sweep finished"
        );
        report
    }

    /// Asks the loop (and any sweep in flight) to stop.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.status.lock().await.clone()
    }

    pub fn last_outcome(&self, principal: &Principal) -> Option<PrincipalOutcome> {
        self.last_outcomes.get(principal).map(|entry| entry.value().clone())
    }

    pub fn last_outcomes(&self) -> BTreeMap<String, PrincipalOutcome> {
        self.last_outcomes
            .iter()
            .map(|entry| (entry.key().key(), entry.value().clone()))
            .collect()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
