use crate::cm::asyncutil::TaskTracker;
use crate::cm::build_info;
use crate::cm::cgroup::CgroupReconciler;
use crate::cm::config::{Config, QuotaLimit};
use crate::cm::logging::{parse_level, Logger};
use crate::cm::metrics::{Collector, Probe, SystemMetrics};
use crate::cm::reloader::Reloader;
use crate::cm::state::{decide, Decision, EnforcementState};
use crate::cm::telemetry::{CgroupSample, HostSample, NullSink, Registry, Sink, UserSample};
use crate::cm::watcher;
use anyhow::Context as _;
use nix::unistd::geteuid;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::watch;

/// Hard ceiling on graceful shutdown before the process force-exits.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Drives one control cycle per polling interval: probe, publish, decide,
/// reconcile. The controller is the only writer of `EnforcementState`.
pub struct Controller {
    logger: Logger,
    tasks: TaskTracker,
    probe: Arc<dyn Probe>,
    reconciler: Arc<CgroupReconciler>,
    sink: Arc<dyn Sink>,
    reloader: Arc<Reloader>,
    enforcement: Arc<RwLock<EnforcementState>>,
    cfg_rx: watch::Receiver<Arc<Config>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logger: Logger,
        tasks: TaskTracker,
        probe: Arc<dyn Probe>,
        reconciler: Arc<CgroupReconciler>,
        sink: Arc<dyn Sink>,
        reloader: Arc<Reloader>,
        enforcement: Arc<RwLock<EnforcementState>>,
        cfg_rx: watch::Receiver<Arc<Config>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Controller {
        Controller {
            logger,
            tasks,
            probe,
            reconciler,
            sink,
            reloader,
            enforcement,
            cfg_rx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        let mut cfg = self.cfg_rx.borrow_and_update().clone();
        self.logger.info(
            "control",
            format!(
                "entering main control loop polling_interval={}s activate_pct={} release_pct={}",
                cfg.poll_interval_s, cfg.activate_pct, cfg.release_pct
            ),
        );

        // One cycle right away so an already-overloaded host is confined
        // before the first tick.
        self.run_cycle(&cfg).await;

        let mut ticker = tokio::time::interval(Duration::from_secs(cfg.poll_interval_s));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the interval's immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Reloads land between cycles, never inside one.
                    if self.cfg_rx.has_changed().unwrap_or(false) {
                        let new = self.cfg_rx.borrow_and_update().clone();
                        self.reloader.apply_components(&new);
                        if new.poll_interval_s != cfg.poll_interval_s {
                            ticker = tokio::time::interval(Duration::from_secs(new.poll_interval_s));
                            ticker.tick().await;
                        }
                        cfg = new;
                    }
                    self.run_cycle(&cfg).await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.logger
            .info("control", "shutting down main control loop");
        let report = self.reconciler.deactivate().await;
        if let Some(err) = report.first_error {
            self.logger
                .error("control", format!("cleanup deactivation error: {err}"));
        }
        self.enforcement
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .reset();
        self.logger.info("control", "shutdown completed");
    }

    pub async fn run_cycle(&self, cfg: &Arc<Config>) {
        let cycle_start = Instant::now();

        let probe = Arc::clone(&self.probe);
        let snapshot = match self.tasks.spawn_blocking(move || probe.sample()).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                self.logger
                    .error("control", format!("failed to collect system metrics: {e:#}"));
                self.sink.incr_error("metrics", "source_unavailable");
                return;
            }
            Err(e) => {
                self.logger
                    .error("control", format!("metrics sampling task failed: {e}"));
                self.sink.incr_error("metrics", "task_failed");
                return;
            }
        };
        self.sink
            .observe_collection_seconds(cycle_start.elapsed().as_secs_f64());

        // Telemetry reflects every cycle, whatever the decision turns out
        // to be.
        self.publish(&snapshot);

        let outcome = {
            let enforcement = self
                .enforcement
                .read()
                .unwrap_or_else(|p| p.into_inner());
            decide(cfg, &snapshot, &enforcement)
        };

        match outcome.decision {
            Decision::Activate => self.execute_activate(cfg, &snapshot).await,
            Decision::Deactivate => self.execute_deactivate().await,
            Decision::Maintain => self.execute_maintain(&snapshot).await,
        }

        self.sink.incr_cycles();
        let duration = cycle_start.elapsed();
        self.sink.observe_cycle_seconds(duration.as_secs_f64());
        self.sink.export();

        self.logger.info(
            "control",
            format!(
                "control cycle completed decision={} reason=\"{}\" user_cpu={:.1}% total_cpu={:.1}% active_users={} under_load={} duration_ms={}",
                outcome.decision.label(),
                outcome.rationale,
                snapshot.user_cpu_percent,
                snapshot.total_cpu_percent,
                snapshot.active_users.len(),
                snapshot.under_load,
                duration.as_millis()
            ),
        );
        if duration > Duration::from_secs(cfg.poll_interval_s) / 2 {
            self.logger.warn(
                "control",
                format!(
                    "control cycle took longer than expected duration_ms={} polling_interval_ms={}",
                    duration.as_millis(),
                    cfg.poll_interval_s * 1000
                ),
            );
        }
    }

    fn publish(&self, snapshot: &SystemMetrics) {
        let (limits_active, tracked): (bool, Vec<u32>) = {
            let enforcement = self
                .enforcement
                .read()
                .unwrap_or_else(|p| p.into_inner());
            (
                enforcement.limits_active,
                enforcement.tracked_users.keys().copied().collect(),
            )
        };

        self.sink.publish_host(&HostSample {
            total_cores: snapshot.total_cores,
            total_cpu_percent: snapshot.total_cpu_percent,
            user_cpu_percent: snapshot.user_cpu_percent,
            memory_used_mib: snapshot.memory_used_mib,
            load1: snapshot.load1,
            active_users_count: snapshot.active_users.len(),
            limited_users_count: tracked.len(),
            limits_active: u8::from(limits_active),
        });

        let users: Vec<UserSample> = snapshot
            .per_user
            .values()
            .map(|u| UserSample {
                uid: u.uid,
                username: u.username.clone(),
                cpu_percent: u.cpu_percent,
                rss_bytes: u.rss_bytes,
                process_count: u.process_count,
                limited: u8::from(tracked.contains(&u.uid)),
            })
            .collect();
        self.sink.publish_users(&users);

        let cgroups: Vec<CgroupSample> = tracked
            .iter()
            .filter_map(|uid| self.reconciler.stats_for(*uid))
            .map(|s| {
                let (quota_us, period_us) = match s.quota {
                    Some((QuotaLimit::Us(q), p)) => (Some(q), p),
                    Some((QuotaLimit::Max, p)) => (None, p),
                    None => (None, 0),
                };
                CgroupSample {
                    uid: s.uid,
                    path: s.path.display().to_string(),
                    quota_us,
                    period_us,
                    memory_current_bytes: s.memory_current,
                }
            })
            .collect();
        self.sink.publish_cgroups(&cgroups);
    }

    async fn execute_activate(&self, cfg: &Arc<Config>, snapshot: &SystemMetrics) {
        let users: Vec<u32> = snapshot.active_users.iter().copied().collect();
        match self
            .reconciler
            .activate(&users, snapshot.total_cores, cfg.min_system_cores)
            .await
        {
            Ok(report) => {
                if let Some(err) = &report.first_error {
                    self.logger.warn(
                        "control",
                        format!(
                            "activation finished with {} per-user errors, first: {err}",
                            report.error_count
                        ),
                    );
                    self.sink.incr_error("cgroup", "per_uid_failure");
                }

                // Recovered entries for users that are no longer active get
                // dropped right away (tracked_users ⊆ active_users).
                let departed: Vec<u32> = self
                    .reconciler
                    .tracked_uids()
                    .into_iter()
                    .filter(|uid| !snapshot.active_users.contains(uid))
                    .collect();
                if !departed.is_empty() {
                    self.reconciler.release_users(&departed).await;
                }

                let mut enforcement = self
                    .enforcement
                    .write()
                    .unwrap_or_else(|p| p.into_inner());
                enforcement.limits_active = true;
                enforcement.activated_at = Some(Instant::now());
                enforcement.shared_cgroup_path = Some(self.reconciler.shared_path());
                enforcement.tracked_users = self.reconciler.tracked_map();
                drop(enforcement);

                self.sink.incr_activations();
                self.logger.info(
                    "control",
                    format!(
                        "cpu limits activated users_limited={} shared_cgroup={}",
                        report.created.len(),
                        self.reconciler.shared_path().display()
                    ),
                );
            }
            Err(e) => {
                self.logger
                    .error("control", format!("failed to activate limits: {e:#}"));
                self.sink.incr_error("cgroup", "activate_failed");
            }
        }
    }

    async fn execute_deactivate(&self) {
        let report = self.reconciler.deactivate().await;
        self.enforcement
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .reset();
        self.sink.incr_deactivations();
        if let Some(err) = report.first_error {
            self.logger.warn(
                "control",
                format!(
                    "deactivation finished with {} errors, first: {err}",
                    report.error_count
                ),
            );
            self.sink.incr_error("cgroup", "per_uid_failure");
        }
    }

    async fn execute_maintain(&self, snapshot: &SystemMetrics) {
        let limits_active = self
            .enforcement
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .limits_active;
        if !limits_active {
            return;
        }

        // Users that went away yield their slot; nobody new is confined in
        // a MAINTAIN cycle.
        let departed: Vec<u32> = self
            .reconciler
            .tracked_uids()
            .into_iter()
            .filter(|uid| !snapshot.active_users.contains(uid))
            .collect();
        if !departed.is_empty() {
            let report = self.reconciler.release_users(&departed).await;
            if !report.removed.is_empty() {
                self.logger.info(
                    "control",
                    format!("untracked inactive users {:?}", report.removed),
                );
            }
            let mut enforcement = self
                .enforcement
                .write()
                .unwrap_or_else(|p| p.into_inner());
            enforcement.tracked_users = self.reconciler.tracked_map();
        }

        self.reconciler.sweep_stragglers();
    }
}

/// Full daemon assembly: logger, telemetry, probe, reconciler, watcher,
/// signal handling, control loop.
pub async fn run_daemon_async(cfg: Config, config_path: &Path) -> anyhow::Result<()> {
    if !geteuid().is_root() {
        anyhow::bail!("cpumaster is not running as root; please start it as root");
    }

    let tasks = TaskTracker::new();
    let logger = Logger::stderr_only(parse_level(&cfg.log_level));
    let log_sink = logger.attach_file(&tasks, cfg.log_file.clone(), cfg.log_max_size);
    logger.info("boot", build_info::banner());
    logger.info(
        "boot",
        format!(
            "starting cgroup_root={} base={} tracking_file={}",
            cfg.cgroup_root.display(),
            cfg.base_cgroup_name,
            cfg.tracking_file.display()
        ),
    );

    let registry: Option<Arc<Registry>> = if cfg.enable_prometheus {
        logger.info(
            "telemetry",
            format!(
                "telemetry export enabled file={} listener={}:{} (served externally)",
                cfg.prometheus_file.display(),
                cfg.prometheus_host,
                cfg.prometheus_port
            ),
        );
        Some(Arc::new(Registry::new(Some(cfg.prometheus_file.clone()))))
    } else {
        logger.info("telemetry", "telemetry export disabled by configuration");
        None
    };
    let sink: Arc<dyn Sink> = match &registry {
        Some(r) => Arc::clone(r) as Arc<dyn Sink>,
        None => Arc::new(NullSink),
    };

    let collector = Arc::new(Collector::new(&cfg, logger.clone()));
    let reconciler = Arc::new(CgroupReconciler::new(&cfg, logger.clone(), tasks.clone()));
    reconciler
        .prepare()
        .context("cgroup setup verification failed")?;

    let enforcement = Arc::new(RwLock::new(EnforcementState {
        // Tracked entries recovered from the tracking file; enforcement
        // itself restarts Inactive and re-activates on its own evidence.
        tracked_users: reconciler.tracked_map(),
        ..EnforcementState::default()
    }));

    let (cfg_tx, cfg_rx) = watch::channel(Arc::new(cfg.clone()));
    let reloader = Arc::new(Reloader::new(
        logger.clone(),
        Arc::clone(&collector),
        Arc::clone(&reconciler),
        registry.clone(),
        cfg_tx,
    ));

    let watcher_handle = match watcher::spawn(
        config_path.to_path_buf(),
        Arc::clone(&reloader),
        &tasks,
        logger.clone(),
        watcher::DEBOUNCE,
    ) {
        Ok(h) => Some(h),
        Err(e) => {
            logger.warn(
                "watcher",
                format!("failed to create config watcher, continuing without auto-reload: {e:#}"),
            );
            None
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(&tasks, logger.clone(), shutdown_tx, watcher_handle);

    let controller = Controller::new(
        logger.clone(),
        tasks.clone(),
        collector,
        reconciler,
        sink,
        reloader,
        enforcement,
        cfg_rx,
        shutdown_rx,
    );
    controller.run().await;

    // Drop the sender and wait for the writer to drain the last lines.
    logger.close_sink();
    let _ = log_sink.await;
    Ok(())
}

/// SIGHUP forces a reload through the debounce-skipping path; SIGINT and
/// SIGTERM start graceful shutdown with a forced-exit deadline.
fn spawn_signal_listener(
    tasks: &TaskTracker,
    logger: Logger,
    shutdown_tx: watch::Sender<bool>,
    watcher_handle: Option<watcher::WatcherHandle>,
) {
    let tracker = tasks.clone();
    tasks.spawn(async move {
        let mut term = match unix_signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                logger.error("signal", format!("SIGTERM handler failed: {e}"));
                return;
            }
        };
        let mut int = match unix_signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                logger.error("signal", format!("SIGINT handler failed: {e}"));
                return;
            }
        };
        let mut hup = match unix_signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                logger.error("signal", format!("SIGHUP handler failed: {e}"));
                return;
            }
        };

        loop {
            tokio::select! {
                _ = hup.recv() => {
                    logger.info("signal", "received SIGHUP, forcing configuration reload");
                    match &watcher_handle {
                        Some(h) => h.trigger_manual(),
                        None => logger.warn("signal", "config watcher not available for SIGHUP reload"),
                    }
                }
                _ = term.recv() => {
                    begin_shutdown(&logger, &tracker, &shutdown_tx, "SIGTERM");
                    break;
                }
                _ = int.recv() => {
                    begin_shutdown(&logger, &tracker, &shutdown_tx, "SIGINT");
                    break;
                }
            }
        }
    });
}

fn begin_shutdown(
    logger: &Logger,
    tasks: &TaskTracker,
    shutdown_tx: &watch::Sender<bool>,
    signal_name: &str,
) {
    logger.info(
        "signal",
        format!("received {signal_name}, initiating shutdown"),
    );
    tasks.cancel();
    let _ = shutdown_tx.send(true);

    // Detached deadline: if the clean path stalls the process goes anyway.
    let deadline_logger = logger.clone();
    tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        deadline_logger.warn("signal", "forced shutdown after timeout");
        std::process::exit(1);
    });
}
