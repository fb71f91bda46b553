use crate::cm::asyncutil::TaskTracker;
use crate::cm::config::Config;
use crate::cm::logging::Logger;
use crate::cm::reloader::Reloader;
use anyhow::Context as _;
use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher as _};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// Notifications arriving within this window coalesce into one reload.
pub const DEBOUNCE: Duration = Duration::from_secs(2);

/// How often the watcher loop wakes to observe cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(500);

/// External trigger for the debounce-skipping reload path (SIGHUP).
#[derive(Clone)]
pub struct WatcherHandle {
    manual_tx: mpsc::UnboundedSender<()>,
}

impl WatcherHandle {
    pub fn trigger_manual(&self) {
        let _ = self.manual_tx.send(());
    }
}

type StatSignature = (SystemTime, u64);

fn stat_signature(path: &Path) -> std::io::Result<StatSignature> {
    let md = fs::metadata(path)?;
    Ok((md.modified()?, md.len()))
}

/// Watch the config file for writes, creates, renames and removals. Events
/// are debounced; a reload only proceeds when the file's mtime or size
/// actually changed since the last applied config.
pub fn spawn(
    config_path: PathBuf,
    reloader: Arc<Reloader>,
    tasks: &TaskTracker,
    logger: Logger,
    debounce: Duration,
) -> anyhow::Result<WatcherHandle> {
    let initial = stat_signature(&config_path)
        .with_context(|| format!("cannot stat config file {}", config_path.display()))?;

    let canonical = fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone());
    let watch_dir = canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
    let (manual_tx, mut manual_rx) = mpsc::unbounded_channel::<()>();

    let target = canonical.clone();
    let cb_logger = logger.clone();
    let mut fs_watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let interesting = matches!(
                event.kind,
                EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
            );
            if interesting && event.paths.iter().any(|p| p == &target) {
                let _ = raw_tx.send(());
            }
        }
        Err(e) => {
            cb_logger.warn("watcher", format!("file watcher error: {e}"));
        }
    })
    .context("create file watcher")?;
    fs_watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch {}", watch_dir.display()))?;

    logger.info(
        "watcher",
        format!("configuration watcher started file={}", config_path.display()),
    );

    let loop_tasks = tasks.clone();
    tasks.spawn(async move {
        // The notify watcher must outlive the loop or events stop flowing.
        let _fs_watcher = fs_watcher;
        let mut last_stat: Option<StatSignature> = Some(initial);
        let mut pending: Option<tokio::time::Instant> = None;

        while !loop_tasks.is_cancelled() {
            let deadline = pending
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                ev = raw_rx.recv() => {
                    match ev {
                        None => break,
                        Some(()) => {
                            if pending.is_none() {
                                logger.debug(
                                    "watcher",
                                    "config change detected, waiting for debounce period",
                                );
                            }
                            pending = Some(tokio::time::Instant::now() + debounce);
                        }
                    }
                }
                ev = manual_rx.recv() => {
                    match ev {
                        None => break,
                        Some(()) => {
                            logger.info("watcher", "manual configuration reload triggered");
                            pending = None;
                            handle_change(&config_path, &reloader, &logger, &mut last_stat);
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                    pending = None;
                    handle_change(&config_path, &reloader, &logger, &mut last_stat);
                }
                _ = tokio::time::sleep(CANCEL_POLL) => {
                    // periodic wake so cancellation is observed without events
                }
            }
        }
        logger.debug("watcher", "configuration watcher stopped");
    });

    Ok(WatcherHandle { manual_tx })
}

/// Re-read, validate and stage the config file. The previous config stays in
/// force when the file is gone, unchanged, or invalid.
pub(crate) fn handle_change(
    config_path: &Path,
    reloader: &Reloader,
    logger: &Logger,
    last_stat: &mut Option<StatSignature>,
) {
    let sig = match stat_signature(config_path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            logger.error(
                "watcher",
                format!("configuration file removed: {}", config_path.display()),
            );
            return;
        }
        Err(e) => {
            logger.error("watcher", format!("cannot stat config file: {e}"));
            return;
        }
    };

    if last_stat.as_ref() == Some(&sig) {
        logger.debug(
            "watcher",
            "config file not actually changed (same mtime and size)",
        );
        return;
    }

    let new_cfg = match Config::load_and_validate(config_path) {
        Ok(c) => c,
        Err(e) => {
            logger.warn(
                "watcher",
                format!(
                    "failed to reload configuration, keeping previous: {e:#}"
                ),
            );
            return;
        }
    };

    match reloader.stage(new_cfg) {
        Ok(()) => {
            *last_stat = Some(sig);
            logger.info("watcher", "configuration reloaded successfully");
        }
        Err(e) => {
            logger.error("watcher", format!("failed to apply new configuration: {e:#}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::cgroup::CgroupReconciler;
    use crate::cm::logging::Level;
    use crate::cm::metrics::Collector;
    use std::io::Write as _;
    use tokio::sync::watch;

    fn test_reloader(cfg: Config) -> (Arc<Reloader>, watch::Receiver<Arc<Config>>) {
        let logger = Logger::stderr_only(Level::Error);
        let collector = Arc::new(Collector::new(&cfg, logger.clone()));
        let reconciler = Arc::new(CgroupReconciler::new(
            &cfg,
            logger.clone(),
            TaskTracker::new(),
        ));
        let (tx, rx) = watch::channel(Arc::new(cfg));
        (
            Arc::new(Reloader::new(logger, collector, reconciler, None, tx)),
            rx,
        )
    }

    fn write_file(path: &Path, contents: &str) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.sync_all().unwrap();
    }

    #[test]
    fn test_handle_change_stages_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu-manager.conf");
        write_file(&path, "CPU_THRESHOLD=90\n");
        let (reloader, mut rx) = test_reloader(Config::default());
        let logger = Logger::stderr_only(Level::Error);

        let mut last_stat = None;
        handle_change(&path, &reloader, &logger, &mut last_stat);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().activate_pct, 90);
        assert!(last_stat.is_some());
    }

    #[test]
    fn test_handle_change_keeps_old_config_on_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu-manager.conf");
        // Release above activation: fails validation.
        write_file(&path, "CPU_THRESHOLD=30\nCPU_RELEASE_THRESHOLD=60\n");
        let (reloader, rx) = test_reloader(Config::default());
        let logger = Logger::stderr_only(Level::Error);

        let mut last_stat = None;
        handle_change(&path, &reloader, &logger, &mut last_stat);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(rx.borrow().activate_pct, 75);
        // Stat not recorded, so the next event retries the parse.
        assert!(last_stat.is_none());
    }

    #[test]
    fn test_handle_change_skips_unchanged_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu-manager.conf");
        write_file(&path, "CPU_THRESHOLD=90\n");
        let (reloader, mut rx) = test_reloader(Config::default());
        let logger = Logger::stderr_only(Level::Error);

        let mut last_stat = None;
        handle_change(&path, &reloader, &logger, &mut last_stat);
        let _ = rx.borrow_and_update();

        handle_change(&path, &reloader, &logger, &mut last_stat);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_handle_change_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.conf");
        let (reloader, rx) = test_reloader(Config::default());
        let logger = Logger::stderr_only(Level::Error);

        let mut last_stat = None;
        handle_change(&path, &reloader, &logger, &mut last_stat);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_watcher_debounces_writes_to_one_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu-manager.conf");
        write_file(&path, "CPU_THRESHOLD=75\n");

        let (reloader, mut rx) = test_reloader(Config::default());
        let tasks = TaskTracker::new();
        let logger = Logger::stderr_only(Level::Error);
        let _handle = spawn(
            path.clone(),
            reloader,
            &tasks,
            logger,
            Duration::from_millis(200),
        )
        .unwrap();

        // Two quick rewrites land inside one debounce window.
        write_file(&path, "CPU_THRESHOLD=50\n");
        write_file(&path, "CPU_THRESHOLD=50\nCPU_RELEASE_THRESHOLD=20\n");

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("reload within timeout")
            .unwrap();
        let cfg = rx.borrow_and_update().clone();
        assert_eq!(cfg.activate_pct, 50);
        assert_eq!(cfg.release_pct, 20);

        // No second staged config arrives afterwards.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!rx.has_changed().unwrap());

        tasks.cancel();
    }

    #[tokio::test]
    async fn test_manual_trigger_skips_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu-manager.conf");
        write_file(&path, "CPU_THRESHOLD=75\n");

        let (reloader, mut rx) = test_reloader(Config::default());
        let tasks = TaskTracker::new();
        let logger = Logger::stderr_only(Level::Error);
        // An hour-long debounce: only the manual path can fire the reload.
        let handle = spawn(
            path.clone(),
            reloader,
            &tasks,
            logger,
            Duration::from_secs(3600),
        )
        .unwrap();

        write_file(&path, "CPU_THRESHOLD=60\n");
        handle.trigger_manual();

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("manual reload within timeout")
            .unwrap();
        assert_eq!(rx.borrow().activate_pct, 60);

        tasks.cancel();
    }
}
