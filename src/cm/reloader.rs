use crate::cm::cgroup::CgroupReconciler;
use crate::cm::config::Config;
use crate::cm::logging::{parse_level, Logger};
use crate::cm::metrics::Collector;
use crate::cm::telemetry::Registry;
use std::sync::Arc;
use tokio::sync::watch;

/// Applies a validated new configuration across the daemon. Staging pushes
/// the config onto the controller's watch channel; the controller calls
/// `apply_components` between cycles so no cycle ever runs on a half-applied
/// config.
pub struct Reloader {
    logger: Logger,
    collector: Arc<Collector>,
    reconciler: Arc<CgroupReconciler>,
    registry: Option<Arc<Registry>>,
    cfg_tx: watch::Sender<Arc<Config>>,
}

impl Reloader {
    pub fn new(
        logger: Logger,
        collector: Arc<Collector>,
        reconciler: Arc<CgroupReconciler>,
        registry: Option<Arc<Registry>>,
        cfg_tx: watch::Sender<Arc<Config>>,
    ) -> Reloader {
        Reloader {
            logger,
            collector,
            reconciler,
            registry,
            cfg_tx,
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.cfg_tx.borrow().clone()
    }

    /// Hand a freshly parsed config to the controller. Incompatible live
    /// changes are warned about here and deferred until a restart; they do
    /// not fail the reload.
    pub fn stage(&self, new: Config) -> anyhow::Result<()> {
        let old = self.cfg_tx.borrow().clone();

        if old.telemetry_restart_required(&new) {
            self.logger.warn(
                "reload",
                format!(
                    "telemetry listener change requires restart, keeping {}:{} (tls={} auth={})",
                    old.prometheus_host,
                    old.prometheus_port,
                    old.prometheus_tls_enabled,
                    old.prometheus_auth_type
                ),
            );
        }
        if old.poll_interval_s != new.poll_interval_s {
            self.logger.info(
                "reload",
                format!(
                    "polling interval changes {}s -> {}s from the next cycle",
                    old.poll_interval_s, new.poll_interval_s
                ),
            );
        }

        self.cfg_tx
            .send(Arc::new(new))
            .map_err(|_| anyhow::anyhow!("control loop is gone, reload dropped"))?;
        Ok(())
    }

    /// Reconfigure the long-lived components. Runs on the controller task at
    /// a cycle boundary.
    pub fn apply_components(&self, cfg: &Config) {
        self.logger.set_level(parse_level(&cfg.log_level));
        self.logger.reopen(cfg.log_file.clone(), cfg.log_max_size);

        self.collector.reconfigure(cfg);
        self.collector.clear_cache();
        self.reconciler.reconfigure(cfg);

        if let Some(registry) = &self.registry {
            if cfg.enable_prometheus {
                registry.set_export_path(Some(cfg.prometheus_file.clone()));
            }
            // A disable toggle was already flagged as restart-required; the
            // running exporter keeps its old behavior until then.
        }

        self.logger.info(
            "reload",
            format!(
                "configuration applied activate_pct={} release_pct={} poll_interval={}s uid_range={}..={} log_level={}",
                cfg.activate_pct,
                cfg.release_pct,
                cfg.poll_interval_s,
                cfg.uid_min,
                cfg.uid_max,
                cfg.log_level
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::asyncutil::TaskTracker;
    use crate::cm::logging::Level;

    fn test_reloader(cfg: Config) -> (Reloader, watch::Receiver<Arc<Config>>) {
        let logger = Logger::stderr_only(Level::Error);
        let collector = Arc::new(Collector::new(&cfg, logger.clone()));
        let reconciler = Arc::new(CgroupReconciler::new(
            &cfg,
            logger.clone(),
            TaskTracker::new(),
        ));
        let (tx, rx) = watch::channel(Arc::new(cfg));
        (
            Reloader::new(logger, collector, reconciler, None, tx),
            rx,
        )
    }

    #[test]
    fn test_stage_publishes_new_config() {
        let (reloader, rx) = test_reloader(Config::default());
        let mut new = Config::default();
        new.activate_pct = 50;
        reloader.stage(new).unwrap();
        assert_eq!(rx.borrow().activate_pct, 50);
    }

    #[test]
    fn test_stage_with_listener_change_still_succeeds() {
        let (reloader, rx) = test_reloader(Config::default());
        let mut new = Config::default();
        new.prometheus_port = 9999;
        new.release_pct = 30;
        // Deferred listener change must not block the threshold change.
        reloader.stage(new).unwrap();
        assert_eq!(rx.borrow().release_pct, 30);
    }

    #[test]
    fn test_apply_components_updates_logger_level() {
        let (reloader, _rx) = test_reloader(Config::default());
        let mut cfg = Config::default();
        cfg.log_level = "DEBUG".to_string();
        cfg.log_file = std::env::temp_dir().join("cpumaster-reload-test.log");
        reloader.apply_components(&cfg);
        assert_eq!(reloader.logger.level(), Level::Debug);
    }
}
