//! Per-check probe loop with rise/fall hysteresis
//!
//! A [`CheckRunner`] owns one check's [`CheckState`]. Probes start on an
//! interval measured from the start of the previous probe and never overlap:
//! a slow probe delays the next tick instead of queueing more work.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::announcer::SinkHandle;
use crate::error::Result;
use crate::manifest::CheckDef;
use crate::notify::{Event, EventKind, Notifications};
use crate::route::{Action, RouteStateMachine};
use crate::sickbay::probe::{Probe, ProbeError, ProbeOutcome, ProbeStatus};

/// Health of a check as seen by the hysteresis counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "UNKNOWN"),
            HealthState::Healthy => write!(f, "HEALTHY"),
            HealthState::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

/// A fired health transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
    pub at: SystemTime,
}

/// Hysteresis counters for one check
#[derive(Debug, Clone)]
pub struct CheckState {
    pub health: HealthState,
    pub successes: u32,
    pub failures: u32,
    pub last_transition: Option<SystemTime>,
    pub last_detail: Option<String>,
}

impl Default for CheckState {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckState {
    pub fn new() -> Self {
        Self {
            health: HealthState::Unknown,
            successes: 0,
            failures: 0,
            last_transition: None,
            last_detail: None,
        }
    }

    fn transition(&mut self, to: HealthState) -> Transition {
        let at = SystemTime::now();
        let from = self.health;
        self.health = to;
        self.last_transition = Some(at);
        Transition { from, to, at }
    }

    /// Feed one outcome; returns the transition it triggered, if any
    pub fn record(&mut self, outcome: &ProbeOutcome, rise: u32, fall: u32) -> Option<Transition> {
        self.last_detail = Some(outcome.detail.clone());

        match outcome.status {
            ProbeStatus::Passed => {
                self.successes = self.successes.saturating_add(1);
                self.failures = 0;
                if self.successes >= rise && self.health != HealthState::Healthy {
                    return Some(self.transition(HealthState::Healthy));
                }
            }
            ProbeStatus::Failed => {
                self.failures = self.failures.saturating_add(1);
                self.successes = 0;
                if self.failures >= fall && self.health != HealthState::Unhealthy {
                    return Some(self.transition(HealthState::Unhealthy));
                }
            }
            // drained: down now, regardless of fall
            ProbeStatus::Disabled => {
                self.failures = self.failures.saturating_add(1);
                self.successes = 0;
                if self.health != HealthState::Unhealthy {
                    return Some(self.transition(HealthState::Unhealthy));
                }
            }
        }
        None
    }
}

/// Aborts the probe task if the runner stops waiting for it
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one probe for `def`: drain file first, then the probe on its own
/// task, bounded by the check timeout. Never fails; errors become failed
/// outcomes.
pub async fn execute(def: &CheckDef, probe: &Arc<dyn Probe>) -> ProbeOutcome {
    if let Some(path) = &def.disable {
        if path.exists() {
            return ProbeOutcome::disabled(format!("disable file {} exists", path.display()));
        }
    }

    let started = Instant::now();
    let timeout = def.timeout_duration();
    let probe = Arc::clone(probe);
    let mut task = AbortOnDrop(tokio::spawn(async move { probe.probe().await }));

    let outcome = match tokio::time::timeout(timeout, &mut task.0).await {
        Ok(Ok(Ok(detail))) => ProbeOutcome::passed(detail),
        Ok(Ok(Err(e))) => ProbeOutcome::failed(e.to_string()),
        Ok(Err(e)) => ProbeOutcome::failed(ProbeError::Aborted(e.to_string()).to_string()),
        Err(_) => ProbeOutcome::failed(ProbeError::Timeout(timeout).to_string()),
    };
    outcome.with_duration(started.elapsed())
}

/// Probe loop for one check
pub struct CheckRunner {
    def: Arc<CheckDef>,
    probe: Arc<dyn Probe>,
    state: CheckState,
    routes: Arc<Mutex<RouteStateMachine>>,
    sink: SinkHandle,
    notifications: Notifications,
}

impl CheckRunner {
    pub fn new(
        def: Arc<CheckDef>,
        probe: Arc<dyn Probe>,
        routes: Arc<Mutex<RouteStateMachine>>,
        sink: SinkHandle,
        notifications: Notifications,
    ) -> Self {
        Self {
            def,
            probe,
            state: CheckState::new(),
            routes,
            sink,
            notifications,
        }
    }

    /// Probe until cancelled. Only a closed directive queue ends the loop
    /// with an error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.def.interval_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = execute(&self.def, &self.probe) => outcome,
            };

            self.observe(outcome)?;
        }

        debug!(check = %self.def.name, "Check runner cancelled");
        Ok(())
    }

    /// Apply one outcome: counters, then directives if a transition fired
    pub fn observe(&mut self, outcome: ProbeOutcome) -> Result<Option<Transition>> {
        let name = &self.def.name;
        debug!(check = %name, result = %outcome.summary(), "Probe finished");

        let Some(transition) = self.state.record(&outcome, self.def.rise, self.def.fall) else {
            return Ok(None);
        };

        match transition.to {
            HealthState::Healthy => info!(check = %name, from = %transition.from, "Check is HEALTHY"),
            _ => warn!(check = %name, from = %transition.from, detail = %outcome.detail, "Check is UNHEALTHY"),
        }

        // the lock is held across submit so a concurrent stop cannot reorder
        // this batch against its own withdraws
        let batch = {
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            let batch = match transition.to {
                HealthState::Healthy => routes.on_healthy(),
                HealthState::Unhealthy => routes.withdraw_all(),
                HealthState::Unknown => Vec::new(),
            };
            self.sink.submit(batch.clone())?;
            batch
        };

        self.notifications.emit(
            Event::new(
                EventKind::Transition,
                format!("{} is {}", name, transition.to),
                outcome.detail.clone(),
            )
            .check(name.as_str())
            .states(transition.from, transition.to),
        );
        if let Some(first) = batch.first() {
            let kind = match first.action {
                Action::Announce => EventKind::Announce,
                Action::Withdraw => EventKind::Withdraw,
            };
            let prefixes: Vec<String> = batch.iter().map(|d| d.prefix.to_string()).collect();
            self.notifications.emit(
                Event::new(
                    kind,
                    format!("{} {}", first.action, name),
                    format!("{} {}", first.action, prefixes.join(", ")),
                )
                .check(name.as_str())
                .states(transition.from, transition.to),
            );
        }

        Ok(Some(transition))
    }
}
