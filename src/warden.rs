//! The Warden - Check Supervisor
//!
//! Owns one worker task per check and implements a one-for-one restart
//! strategy:
//! - Withdraws a worker's routes whenever it stops or crashes
//! - Respawns crashed workers with capped exponential backoff
//! - Leaves a check failed once it crashes too often inside the crash window

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use ipnet::IpNet;
use rand::rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::announcer::SinkHandle;
use crate::error::{Error, Result};
use crate::manifest::{CheckDef, GlobalConfig};
use crate::notify::{Event, EventKind, Notifications};
use crate::reconcile::Plan;
use crate::route::RouteStateMachine;
use crate::sickbay::{CheckRunner, Probe, ProbeError};

// Kept in its own module so the macro expansion's `Result<_, _>` does not
// resolve to the crate's single-parameter `Result` alias.
mod worker_machine {
    use state_machines::state_machine;

    state_machine! {
        name: WorkerMachine,
        dynamic: true,
        initial: Running,
        states: [Running, Backoff, Stopping, Stopped, Failed],
        events {
            crash {
                transition: { from: Running, to: Backoff }
            }
            respawn {
                transition: { from: Backoff, to: Running }
            }
            fail {
                transition: { from: [Running, Backoff], to: Failed }
            }
            stop {
                transition: { from: [Running, Backoff, Failed], to: Stopping }
            }
            stopped {
                transition: { from: Stopping, to: Stopped }
            }
        }
    }
}

use worker_machine::*;

/// Worker lifecycle state, as reported by [`Warden::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Backoff,
    Stopping,
    Stopped,
    Failed,
}

impl WorkerState {
    fn from_machine(state: &str) -> Self {
        match state {
            "Running" => WorkerState::Running,
            "Backoff" => WorkerState::Backoff,
            "Stopping" => WorkerState::Stopping,
            "Failed" => WorkerState::Failed,
            _ => WorkerState::Stopped,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Running => "running",
            WorkerState::Backoff => "backoff",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60000
}

fn default_stability_window() -> u64 {
    60
}

fn default_crash_window() -> u64 {
    300
}

fn default_max_crashes() -> usize {
    5
}

/// Crash recovery settings (`[routewarden.respawn]`)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RespawnPolicy {
    /// Delay before the second respawn of a streak
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the respawn delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter factor applied to each delay (0.0-1.0)
    #[serde(default)]
    pub jitter: f64,

    /// Seconds of uptime that reset the crash streak
    #[serde(default = "default_stability_window")]
    pub stability_window: u64,

    /// Sliding window for the crash-rate limit, in seconds
    #[serde(default = "default_crash_window")]
    pub crash_window: u64,

    /// More crashes than this inside the window leaves the check failed
    #[serde(default = "default_max_crashes")]
    pub max_crashes: usize,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: 0.0,
            stability_window: default_stability_window(),
            crash_window: default_crash_window(),
            max_crashes: default_max_crashes(),
        }
    }
}

impl RespawnPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new()
            .base_delay_ms(self.base_delay_ms)
            .max_delay_ms(self.max_delay_ms)
            .multiplier(2.0)
            .max_attempts(u8::MAX)
            .jitter_factor(self.jitter)
    }

    /// Delay before respawning after crash number `streak` of the current streak
    pub fn delay_for(&self, streak: u32) -> Duration {
        if streak <= 1 {
            return Duration::ZERO;
        }
        let attempt = u8::try_from(streak - 1).unwrap_or(u8::MAX - 1).min(u8::MAX - 1);
        let mut rng = rng();
        let delay_ms = self
            .backoff()
            .delay(attempt, &mut rng)
            .unwrap_or(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    fn stability(&self) -> Duration {
        Duration::from_secs(self.stability_window)
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.crash_window)
    }
}

/// Builds the probe for a check
pub trait ProbeFactory: Send + Sync {
    fn build(&self, def: &CheckDef) -> std::result::Result<Arc<dyn Probe>, ProbeError>;
}

/// Builds probes from the configured method
pub struct MethodProbes;

impl ProbeFactory for MethodProbes {
    fn build(&self, def: &CheckDef) -> std::result::Result<Arc<dyn Probe>, ProbeError> {
        def.probe.build(def.timeout_duration())
    }
}

/// Supervisor view of one check
#[derive(Debug, Clone, PartialEq)]
pub struct CheckStatus {
    pub name: String,
    pub state: WorkerState,
    /// Crashes inside the current crash window
    pub crashes: usize,
    pub announced: Vec<IpNet>,
}

/// What happened while applying a plan
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl ApplyReport {
    /// Some actions failed while others went through
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Live execution unit bound to one check definition
struct Worker {
    def: Arc<CheckDef>,
    probe: Arc<dyn Probe>,
    handle: Option<JoinHandle<Result<()>>>,
    token: CancellationToken,
    routes: Arc<Mutex<RouteStateMachine>>,
    spawned_at: Instant,
    streak: u32,
    crashes: VecDeque<Instant>,
    respawn_at: Option<Instant>,
    machine: DynamicWorkerMachine<()>,
}

impl Worker {
    fn state(&self) -> WorkerState {
        WorkerState::from_machine(self.machine.current_state())
    }

    fn transition(&mut self, event: WorkerMachineEvent) {
        if let Err(e) = self.machine.handle(event) {
            debug!(check = %self.def.name, error = ?e, "Ignored worker lifecycle event");
        }
    }
}

/// The Warden supervises all checks
pub struct Warden {
    workers: BTreeMap<String, Worker>,
    sink: SinkHandle,
    notifications: Notifications,
    factory: Arc<dyn ProbeFactory>,
    policy: RespawnPolicy,
    grace: Duration,
    root: CancellationToken,
}

impl Warden {
    /// Create a Warden whose workers are children of `root`
    pub fn new(
        settings: &GlobalConfig,
        sink: SinkHandle,
        notifications: Notifications,
        root: CancellationToken,
    ) -> Self {
        Self {
            workers: BTreeMap::new(),
            sink,
            notifications,
            factory: Arc::new(MethodProbes),
            policy: settings.respawn.clone(),
            grace: settings.grace_duration(),
            root,
        }
    }

    /// Replace the probe factory
    pub fn with_factory(mut self, factory: Arc<dyn ProbeFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Pick up changed supervisor settings on reload
    pub fn update_settings(&mut self, settings: &GlobalConfig) {
        self.policy = settings.respawn.clone();
        self.grace = settings.grace_duration();
    }

    fn launch(
        &self,
        def: &Arc<CheckDef>,
        probe: &Arc<dyn Probe>,
    ) -> (JoinHandle<Result<()>>, CancellationToken, Arc<Mutex<RouteStateMachine>>) {
        let token = self.root.child_token();
        let routes = Arc::new(Mutex::new(RouteStateMachine::new(def)));
        let runner = CheckRunner::new(
            Arc::clone(def),
            Arc::clone(probe),
            Arc::clone(&routes),
            self.sink.clone(),
            self.notifications.clone(),
        );
        let handle = tokio::spawn(runner.run(token.clone()));
        (handle, token, routes)
    }

    /// Withdraw everything the worker announced
    fn withdraw(&self, worker: &Worker) {
        let mut routes = worker.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let batch = routes.withdraw_all();
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        if let Err(e) = self.sink.submit(batch) {
            warn!(check = %worker.def.name, error = %e, "Could not withdraw routes");
        } else {
            info!(check = %worker.def.name, prefixes = count, "Withdrew routes");
        }
    }

    fn worker_event(&self, name: &str, title: &str, message: String) {
        self.notifications
            .emit(Event::new(EventKind::Worker, format!("{} {}", name, title), message).check(name));
    }

    /// Start a worker for `def` with fresh health and route state
    pub fn start(&mut self, def: CheckDef) -> Result<()> {
        if self.workers.contains_key(&def.name) {
            return Err(Error::CheckAlreadyRunning(def.name));
        }
        let probe = self.factory.build(&def).map_err(|e| Error::ProbeSetup {
            check: def.name.clone(),
            message: e.to_string(),
        })?;

        let def = Arc::new(def);
        let (handle, token, routes) = self.launch(&def, &probe);
        info!(check = %def.name, method = def.probe.name(), "Started check");
        self.worker_event(&def.name, "started", format!("{} probe every {}s", def.probe.name(), def.interval));

        self.workers.insert(
            def.name.clone(),
            Worker {
                def,
                probe,
                handle: Some(handle),
                token,
                routes,
                spawned_at: Instant::now(),
                streak: 0,
                crashes: VecDeque::new(),
                respawn_at: None,
                machine: WorkerMachine::new(()).into_dynamic(),
            },
        );
        Ok(())
    }

    /// Cancel a worker, abort it after the grace period, withdraw its
    /// routes and deregister it
    pub async fn stop(&mut self, name: &str) -> Result<()> {
        let mut worker = self
            .workers
            .remove(name)
            .ok_or_else(|| Error::CheckNotFound(name.to_string()))?;

        worker.transition(WorkerMachineEvent::Stop);
        worker.token.cancel();

        if let Some(mut handle) = worker.handle.take() {
            if tokio::time::timeout(self.grace, &mut handle).await.is_err() {
                warn!(check = %name, grace = ?self.grace, "Worker did not exit in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }

        self.withdraw(&worker);
        worker.transition(WorkerMachineEvent::Stopped);
        info!(check = %name, "Stopped check");
        self.worker_event(name, "stopped", "worker stopped".to_string());
        Ok(())
    }

    /// Apply a reconciliation plan: stops (including the stop half of every
    /// restart) first, then starts. Failures are isolated per action.
    pub async fn apply(&mut self, plan: &Plan) -> ApplyReport {
        let mut report = ApplyReport::default();

        for name in &plan.stop {
            match self.stop(name).await {
                Ok(()) => report.stopped.push(name.clone()),
                Err(e) => report.failed.push((name.clone(), e)),
            }
        }

        let mut restarting = Vec::new();
        for def in &plan.restart {
            if !self.workers.contains_key(&def.name) {
                restarting.push(def);
                continue;
            }
            match self.stop(&def.name).await {
                Ok(()) => restarting.push(def),
                Err(e) => report.failed.push((def.name.clone(), e)),
            }
        }

        for def in &plan.start {
            match self.start(def.clone()) {
                Ok(()) => report.started.push(def.name.clone()),
                Err(e) => report.failed.push((def.name.clone(), e)),
            }
        }

        for def in restarting {
            match self.start(def.clone()) {
                Ok(()) => {
                    info!(check = %def.name, "Restarted check with new definition");
                    report.restarted.push(def.name.clone());
                }
                Err(e) => report.failed.push((def.name.clone(), e)),
            }
        }

        for (name, e) in &report.failed {
            error!(check = %name, error = %e, "Reconciliation action failed");
        }
        report
    }

    /// One monitoring sweep: reap finished workers, record crashes and
    /// respawn those whose backoff has elapsed
    pub async fn tick(&mut self) {
        let now = Instant::now();
        let names: Vec<String> = self.workers.keys().cloned().collect();

        for name in names {
            let Some(mut worker) = self.workers.remove(&name) else {
                continue;
            };

            if worker.state() == WorkerState::Running
                && worker.handle.as_ref().is_some_and(|h| h.is_finished())
            {
                self.record_crash(&mut worker, now).await;
            }

            if worker.state() == WorkerState::Backoff
                && worker.respawn_at.is_some_and(|at| at <= now)
            {
                self.respawn(&mut worker, now);
            }

            self.workers.insert(name, worker);
        }
    }

    async fn record_crash(&self, worker: &mut Worker, now: Instant) {
        let name = worker.def.name.clone();
        let reason = match worker.handle.take() {
            Some(handle) => match handle.await {
                Ok(Ok(())) => "runner exited".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            },
            None => "runner missing".to_string(),
        };

        // routes are no longer backed by a live check
        self.withdraw(worker);

        if now.duration_since(worker.spawned_at) >= self.policy.stability() {
            worker.streak = 0;
        }
        worker.streak = worker.streak.saturating_add(1);

        worker.crashes.push_back(now);
        let window = self.policy.window();
        while worker
            .crashes
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            worker.crashes.pop_front();
        }

        if worker.crashes.len() > self.policy.max_crashes {
            worker.transition(WorkerMachineEvent::Fail);
            error!(
                check = %name,
                crashes = worker.crashes.len(),
                reason = %reason,
                "Check crashed too often, leaving it stopped"
            );
            self.notifications.emit(
                Event::new(
                    EventKind::Error,
                    format!("{} failed", name),
                    format!("{} crashes within {}s: {}", worker.crashes.len(), self.policy.crash_window, reason),
                )
                .check(name.as_str()),
            );
            return;
        }

        let delay = self.policy.delay_for(worker.streak);
        worker.respawn_at = Some(now + delay);
        worker.transition(WorkerMachineEvent::Crash);
        warn!(
            check = %name,
            reason = %reason,
            attempt = worker.streak,
            delay = ?delay,
            "Worker crashed, respawning"
        );
    }

    fn respawn(&self, worker: &mut Worker, now: Instant) {
        let (handle, token, routes) = self.launch(&worker.def, &worker.probe);
        worker.handle = Some(handle);
        worker.token = token;
        worker.routes = routes;
        worker.spawned_at = now;
        worker.respawn_at = None;
        worker.transition(WorkerMachineEvent::Respawn);
        info!(check = %worker.def.name, attempt = worker.streak, "Respawned check");
        self.worker_event(&worker.def.name, "respawned", format!("attempt {}", worker.streak));
    }

    /// Earliest pending respawn, so the monitor can wake up for it
    pub fn next_deadline(&self) -> Option<Instant> {
        self.workers
            .values()
            .filter(|w| w.state() == WorkerState::Backoff)
            .filter_map(|w| w.respawn_at)
            .min()
    }

    /// Snapshot of every registered check
    pub fn status(&self) -> Vec<CheckStatus> {
        self.workers
            .values()
            .map(|w| CheckStatus {
                name: w.def.name.clone(),
                state: w.state(),
                crashes: w.crashes.len(),
                announced: w
                    .routes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .announced(),
            })
            .collect()
    }

    /// Definitions of every registered check, the reconciler's current set
    pub fn definitions(&self) -> Vec<CheckDef> {
        self.workers.values().map(|w| (*w.def).clone()).collect()
    }

    /// Stop every worker, withdrawing all routes
    pub async fn shutdown(&mut self) {
        info!(checks = self.workers.len(), "Warden shutting down");
        let names: Vec<String> = self.workers.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!(check = %name, error = %e, "Stop failed during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announcer::{self, AnnouncementSink};
    use crate::reconcile::reconcile;
    use crate::route::Action;
    use async_trait::async_trait;

    struct AlwaysUp;

    #[async_trait]
    impl Probe for AlwaysUp {
        async fn probe(&self) -> std::result::Result<String, ProbeError> {
            Ok("up".into())
        }
    }

    struct TestProbes;

    impl ProbeFactory for TestProbes {
        fn build(&self, def: &CheckDef) -> std::result::Result<Arc<dyn Probe>, ProbeError> {
            if def.name.starts_with("broken") {
                return Err(ProbeError::Mismatch("cannot build".into()));
            }
            Ok(Arc::new(AlwaysUp))
        }
    }

    fn def(name: &str, prefix: &str) -> CheckDef {
        let toml = format!(
            r#"
name = "{}"
interval = 3600
prefixes = ["{}"]

[probe]
method = "tcp"
host = "127.0.0.1"
port = 80
"#,
            name, prefix
        );
        toml::from_str(&toml).unwrap()
    }

    fn warden(policy: RespawnPolicy) -> (Warden, AnnouncementSink) {
        let (handle, sink) = announcer::channel();
        let settings = GlobalConfig {
            respawn: policy,
            stop_grace_period: 1,
            ..GlobalConfig::default()
        };
        let warden = Warden::new(&settings, handle, Notifications::default(), CancellationToken::new())
            .with_factory(Arc::new(TestProbes));
        (warden, sink)
    }

    fn policy() -> RespawnPolicy {
        RespawnPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 4000,
            jitter: 0.0,
            stability_window: 60,
            crash_window: 300,
            max_crashes: 5,
        }
    }

    /// Let spawned runners take their first probe
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn crash(warden: &mut Warden, name: &str) {
        let handle = warden.workers.get(name).unwrap().handle.as_ref().unwrap();
        handle.abort();
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
    }

    fn state_of(warden: &Warden, name: &str) -> WorkerState {
        warden.status().into_iter().find(|s| s.name == name).unwrap().state
    }

    #[test]
    fn test_backoff_curve() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::ZERO);
        assert_eq!(p.delay_for(2), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(2));
        assert_eq!(p.delay_for(4), Duration::from_secs(4));
        assert_eq!(p.delay_for(5), Duration::from_secs(4));
        assert_eq!(p.delay_for(60), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let p = RespawnPolicy { jitter: 0.5, ..policy() };
        for _ in 0..50 {
            let d = p.delay_for(2);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_worker_machine_lifecycle() {
        let mut machine = WorkerMachine::new(()).into_dynamic();
        assert_eq!(machine.current_state(), "Running");
        machine.handle(WorkerMachineEvent::Crash).unwrap();
        machine.handle(WorkerMachineEvent::Respawn).unwrap();
        machine.handle(WorkerMachineEvent::Fail).unwrap();
        assert!(machine.handle(WorkerMachineEvent::Respawn).is_err());
        machine.handle(WorkerMachineEvent::Stop).unwrap();
        machine.handle(WorkerMachineEvent::Stopped).unwrap();
        assert_eq!(machine.current_state(), "Stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_announces_and_stop_withdraws() {
        let (mut warden, mut sink) = warden(policy());
        warden.start(def("web", "192.0.2.10/32")).unwrap();
        assert!(matches!(
            warden.start(def("web", "192.0.2.10/32")),
            Err(Error::CheckAlreadyRunning(_))
        ));
        settle().await;

        let status = warden.status();
        assert_eq!(status[0].state, WorkerState::Running);
        assert_eq!(status[0].announced.len(), 1);

        warden.stop("web").await.unwrap();
        assert!(warden.status().is_empty());
        assert!(matches!(warden.stop("web").await, Err(Error::CheckNotFound(_))));

        let actions: Vec<Action> = sink.drain_pending().iter().map(|d| d.action).collect();
        assert_eq!(actions, vec![Action::Announce, Action::Withdraw]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_isolates_failures_and_keeps_unchanged() {
        let (mut warden, mut sink) = warden(policy());
        let current = vec![
            def("a", "192.0.2.1/32"),
            def("b", "192.0.2.2/32"),
            def("c", "192.0.2.3/32"),
        ];
        let report = warden.apply(&reconcile(&[], &current)).await;
        assert_eq!(report.started.len(), 3);
        settle().await;
        sink.drain_pending();

        let proposed = vec![
            def("a", "192.0.2.1/32"),
            def("c", "192.0.2.3/32"),
            def("broken", "192.0.2.9/32"),
        ];
        let plan = reconcile(&warden.definitions(), &proposed);
        let report = warden.apply(&plan).await;

        assert!(report.is_partial());
        assert_eq!(report.stopped, vec!["b"]);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, Error::ProbeSetup { .. }));

        // only b's route was withdrawn; a and c kept running untouched
        let directives = sink.drain_pending();
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].check, "b");
        assert_eq!(directives[0].action, Action::Withdraw);

        let names: Vec<String> = warden.status().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_withdraws_old_before_new_announce() {
        let (mut warden, mut sink) = warden(policy());
        warden.start(def("web", "192.0.2.10/32")).unwrap();
        settle().await;

        let plan = reconcile(&warden.definitions(), &[def("web", "192.0.2.20/32")]);
        assert_eq!(plan.restart.len(), 1);
        let report = warden.apply(&plan).await;
        assert_eq!(report.restarted, vec!["web"]);
        settle().await;

        let lines: Vec<String> = sink.drain_pending().iter().map(|d| d.to_command()).collect();
        assert_eq!(
            lines,
            vec![
                "announce route 192.0.2.10/32 next-hop self",
                "withdraw route 192.0.2.10/32 next-hop self",
                "announce route 192.0.2.20/32 next-hop self",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_respawn_backoff_then_failed() {
        let (mut warden, mut sink) = warden(policy());
        warden.start(def("web", "192.0.2.10/32")).unwrap();
        settle().await;

        // first crash: routes withdrawn, immediate respawn
        crash(&mut warden, "web").await;
        warden.tick().await;
        assert_eq!(state_of(&warden, "web"), WorkerState::Running);
        let actions: Vec<Action> = sink.drain_pending().iter().map(|d| d.action).collect();
        assert_eq!(actions, vec![Action::Announce, Action::Withdraw]);

        // later crashes wait 1s, 2s, 4s, 4s
        for expected in [1u64, 2, 4, 4] {
            crash(&mut warden, "web").await;
            warden.tick().await;
            assert_eq!(state_of(&warden, "web"), WorkerState::Backoff);
            let wait = warden.next_deadline().unwrap() - Instant::now();
            assert_eq!(wait, Duration::from_secs(expected));

            tokio::time::advance(wait).await;
            warden.tick().await;
            assert_eq!(state_of(&warden, "web"), WorkerState::Running);
        }

        // sixth crash inside the window exceeds max_crashes
        crash(&mut warden, "web").await;
        warden.tick().await;
        let status = warden.status();
        assert_eq!(status[0].state, WorkerState::Failed);
        assert_eq!(status[0].crashes, 6);
        assert!(warden.next_deadline().is_none());

        // failed checks stay registered but are never respawned
        tokio::time::advance(Duration::from_secs(600)).await;
        warden.tick().await;
        assert_eq!(state_of(&warden, "web"), WorkerState::Failed);

        // removal still deregisters them
        warden.stop("web").await.unwrap();
        assert!(warden.status().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_worker_resets_streak() {
        let (mut warden, _sink) = warden(policy());
        warden.start(def("web", "192.0.2.10/32")).unwrap();

        crash(&mut warden, "web").await;
        warden.tick().await;
        crash(&mut warden, "web").await;
        warden.tick().await;
        assert_eq!(state_of(&warden, "web"), WorkerState::Backoff);
        tokio::time::advance(Duration::from_secs(1)).await;
        warden.tick().await;

        // runs past the stability window, so the next crash respawns at once
        tokio::time::advance(Duration::from_secs(61)).await;
        crash(&mut warden, "web").await;
        warden.tick().await;
        assert_eq!(state_of(&warden, "web"), WorkerState::Running);
        assert_eq!(warden.workers["web"].streak, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_withdraws_everything() {
        let (mut warden, mut sink) = warden(policy());
        warden.start(def("a", "192.0.2.1/32")).unwrap();
        warden.start(def("b", "192.0.2.2/32")).unwrap();
        settle().await;
        sink.drain_pending();

        warden.shutdown().await;
        assert!(warden.status().is_empty());
        let directives = sink.drain_pending();
        assert_eq!(directives.len(), 2);
        assert!(directives.iter().all(|d| d.action == Action::Withdraw));
    }
}
