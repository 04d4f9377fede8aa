//! Bridge between the BGP speaker, the config file and the Warden
//!
//! Handles:
//! - Opening the control channel and running the announcement sink
//! - Starting every configured check
//! - Reloading on SIGHUP or config file changes, one reload at a time
//! - Ordered shutdown: workers are stopped (withdrawing their routes) before
//!   the control channel is closed

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::announcer::{self, ControlWriter};
use crate::error::{Error, Result};
use crate::manifest::{self, GlobalConfig, RoutewardenConfig};
use crate::notify::{Event, EventKind, Notifications};
use crate::reconcile::reconcile;
use crate::warden::{ApplyReport, Warden};

/// Running daemon
pub struct Bridge {
    config_path: PathBuf,
    settings: GlobalConfig,
    warden: Arc<Mutex<Warden>>,
    reload_gate: Arc<Mutex<()>>,
    root: CancellationToken,
    fatal: CancellationToken,
    notifications: Notifications,
    sink_task: JoinHandle<Result<u64>>,
    monitor_task: JoinHandle<()>,
    reloads: Vec<JoinHandle<()>>,
    last_modified: Option<SystemTime>,
}

impl Bridge {
    /// Open the configured control channel and start supervising
    pub async fn start(config_path: &Path, config: RoutewardenConfig) -> Result<Self> {
        let writer = announcer::open_control(config.control.path.as_deref()).await?;
        Self::with_writer(config_path, config, writer).await
    }

    /// Start supervising, writing route commands to `writer`
    pub async fn with_writer(
        config_path: &Path,
        config: RoutewardenConfig,
        writer: ControlWriter,
    ) -> Result<Self> {
        let (handle, sink) = announcer::channel();
        let fatal = CancellationToken::new();
        let sink_task = tokio::spawn(sink.run(writer, fatal.clone()));

        let root = CancellationToken::new();
        let notifications = Notifications::from_config(&config.notifications);
        let mut warden = Warden::new(&config.routewarden, handle, notifications.clone(), root.clone());

        let report = warden.apply(&reconcile(&[], &config.checks)).await;
        log_report(&report);

        let warden = Arc::new(Mutex::new(warden));
        let monitor_task = tokio::spawn(monitor(
            Arc::clone(&warden),
            config.routewarden.monitoring_duration(),
            root.clone(),
        ));

        info!(
            checks = report.started.len(),
            config = %config_path.display(),
            "routewarden started"
        );
        notifications.emit(Event::new(
            EventKind::Info,
            "routewarden started",
            format!("supervising {} checks", report.started.len()),
        ));

        Ok(Self {
            config_path: config_path.to_path_buf(),
            settings: config.routewarden,
            warden,
            reload_gate: Arc::new(Mutex::new(())),
            root,
            fatal,
            notifications,
            sink_task,
            monitor_task,
            reloads: Vec::new(),
            last_modified: manifest::modified_time(config_path),
        })
    }

    /// Event loop: signals, live reload polling and sink failure
    pub async fn run(mut self) -> Result<()> {
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let fatal = self.fatal.clone();

        let mut poll = tokio::time::interval(self.settings.monitoring_duration());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let live_reload = self.settings.live_reload;

        loop {
            tokio::select! {
                _ = terminate.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
                _ = interrupt.recv() => {
                    info!("SIGINT received, shutting down");
                    break;
                }
                _ = hangup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    self.spawn_reload();
                }
                _ = fatal.cancelled() => {
                    error!("Control channel lost, shutting down");
                    break;
                }
                _ = poll.tick(), if live_reload => self.poll_config(),
            }
        }

        self.shutdown().await
    }

    fn poll_config(&mut self) {
        let modified = manifest::modified_time(&self.config_path);
        if modified.is_some() && modified != self.last_modified {
            self.last_modified = modified;
            info!(config = %self.config_path.display(), "Configuration file changed, reloading");
            self.spawn_reload();
        }
    }

    /// Reload on a separate task so the event loop keeps serving signals
    pub fn spawn_reload(&mut self) {
        self.reloads.retain(|h| !h.is_finished());

        let warden = Arc::clone(&self.warden);
        let gate = Arc::clone(&self.reload_gate);
        let path = self.config_path.clone();
        let root = self.root.clone();

        self.reloads.push(tokio::spawn(async move {
            match reload(&warden, &gate, &path, &root).await {
                Ok(report) => log_report(&report),
                Err(e) if e.is_retryable() => warn!(error = %e, "Reload rejected"),
                Err(e) => error!(error = %e, "Reload failed, keeping the running configuration"),
            }
        }));
    }

    /// Reload now, on the caller's task
    pub async fn reload(&self) -> Result<ApplyReport> {
        reload(&self.warden, &self.reload_gate, &self.config_path, &self.root).await
    }

    /// Stop accepting reloads, stop every worker (withdrawing its routes),
    /// then let the sink drain and close the control channel
    pub async fn shutdown(self) -> Result<()> {
        self.root.cancel();
        let _ = self.monitor_task.await;
        for task in self.reloads {
            let _ = task.await;
        }

        self.warden.lock().await.shutdown().await;
        self.notifications
            .emit(Event::new(EventKind::Info, "routewarden stopped", "all routes withdrawn"));
        drop(self.warden);

        let drain = self.settings.grace_duration().max(Duration::from_secs(1));
        match tokio::time::timeout(drain, self.sink_task).await {
            Ok(Ok(Ok(lines))) => {
                info!(lines = lines, "routewarden stopped");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => Err(Error::Io(std::io::Error::other(e))),
            Err(_) => {
                warn!("Announcement sink did not drain in time");
                Ok(())
            }
        }
    }
}

/// Apply the config file to the Warden. A reload that arrives while another
/// one is running is rejected, not queued.
pub async fn reload(
    warden: &Mutex<Warden>,
    gate: &Mutex<()>,
    path: &Path,
    root: &CancellationToken,
) -> Result<ApplyReport> {
    let _guard = gate.try_lock().map_err(|_| Error::ReloadInProgress)?;
    let config = manifest::load(path)?;

    let mut warden = warden.lock().await;
    if root.is_cancelled() {
        return Ok(ApplyReport::default());
    }
    warden.update_settings(&config.routewarden);

    let plan = reconcile(&warden.definitions(), &config.checks);
    if plan.is_noop() {
        info!(checks = plan.keep.len(), "Configuration unchanged");
        return Ok(ApplyReport::default());
    }

    let report = warden.apply(&plan).await;
    for status in warden.status() {
        info!(
            check = %status.name,
            state = %status.state,
            announced = status.announced.len(),
            "Check status"
        );
    }
    Ok(report)
}

fn log_report(report: &ApplyReport) {
    if report.is_partial() {
        warn!(
            started = report.started.len(),
            stopped = report.stopped.len(),
            restarted = report.restarted.len(),
            failed = report.failed.len(),
            "Configuration partially applied"
        );
    } else {
        info!(
            started = report.started.len(),
            stopped = report.stopped.len(),
            restarted = report.restarted.len(),
            "Configuration applied"
        );
    }
}

/// Liveness sweeps; wakes early for pending respawns
async fn monitor(warden: Arc<Mutex<Warden>>, interval: Duration, cancel: CancellationToken) {
    loop {
        let wait = {
            let warden = warden.lock().await;
            warden
                .next_deadline()
                .map(|at| at.saturating_duration_since(Instant::now()).min(interval))
                .unwrap_or(interval)
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        warden.lock().await.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tokio::io::AsyncReadExt;

    fn write_config(path: &Path, marker: &Path, names: &[&str]) {
        let mut content = String::new();
        for (i, name) in names.iter().enumerate() {
            content.push_str(&format!(
                r#"
[[checks]]
name = "{}"
interval = 1
prefixes = ["192.0.2.{}/32"]

[checks.probe]
method = "file"
path = "{}"
"#,
                name,
                i + 1,
                marker.display()
            ));
        }
        fs::write(path, content).unwrap();
    }

    async fn wait_announced(bridge: &Bridge, count: usize) {
        for _ in 0..200 {
            let announced: usize = bridge
                .warden
                .lock()
                .await
                .status()
                .iter()
                .map(|s| s.announced.len())
                .sum();
            if announced == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("routes were not announced");
    }

    #[tokio::test]
    async fn test_bridge_reload_and_shutdown_withdraw_routes() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("up");
        fs::write(&marker, "").unwrap();
        let path = dir.path().join("routewarden.toml");
        write_config(&path, &marker, &["a", "b"]);

        let config = manifest::load(&path).unwrap();
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let bridge = Bridge::with_writer(&path, config, Box::pin(writer)).await.unwrap();
        wait_announced(&bridge, 2).await;

        write_config(&path, &marker, &["a"]);
        let report = bridge.reload().await.unwrap();
        assert_eq!(report.stopped, vec!["b"]);
        assert!(report.started.is_empty());

        bridge.shutdown().await.unwrap();

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[..2].contains(&"announce route 192.0.2.1/32 next-hop self"));
        assert!(lines[..2].contains(&"announce route 192.0.2.2/32 next-hop self"));
        assert_eq!(lines[2], "withdraw route 192.0.2.2/32 next-hop self");
        assert_eq!(lines[3], "withdraw route 192.0.2.1/32 next-hop self");
    }

    #[tokio::test]
    async fn test_concurrent_reload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routewarden.toml");
        fs::write(&path, "").unwrap();

        let (handle, _sink) = announcer::channel();
        let root = CancellationToken::new();
        let warden = Mutex::new(Warden::new(
            &GlobalConfig::default(),
            handle,
            Notifications::default(),
            root.clone(),
        ));
        let gate = Mutex::new(());

        let held = gate.lock().await;
        let result = reload(&warden, &gate, &path, &root).await;
        assert!(matches!(result, Err(Error::ReloadInProgress)));
        drop(held);

        assert!(reload(&warden, &gate, &path, &root).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_running_checks() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("up");
        fs::write(&marker, "").unwrap();
        let path = dir.path().join("routewarden.toml");
        write_config(&path, &marker, &["a"]);

        let config = manifest::load(&path).unwrap();
        let (writer, _reader) = tokio::io::duplex(64 * 1024);
        let bridge = Bridge::with_writer(&path, config, Box::pin(writer)).await.unwrap();

        fs::write(&path, "[[checks]]\nname = ").unwrap();
        assert!(matches!(bridge.reload().await, Err(Error::ConfigParse(_))));
        assert_eq!(bridge.warden.lock().await.status().len(), 1);

        bridge.shutdown().await.unwrap();
    }
}
