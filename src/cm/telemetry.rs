use anyhow::Context as _;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

/// Host-level quantities published once per control cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostSample {
    pub total_cores: u32,
    pub total_cpu_percent: f64,
    pub user_cpu_percent: f64,
    pub memory_used_mib: f64,
    pub load1: f64,
    pub active_users_count: usize,
    pub limited_users_count: usize,
    pub limits_active: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSample {
    pub uid: u32,
    pub username: String,
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub process_count: u32,
    pub limited: u8,
}

/// Readback of one tracked cgroup: cpu.max as (quota_us, period_us) with
/// `None` quota meaning "max", plus memory.current.
#[derive(Debug, Clone, Serialize)]
pub struct CgroupSample {
    pub uid: u32,
    pub path: String,
    pub quota_us: Option<u64>,
    pub period_us: u64,
    pub memory_current_bytes: Option<u64>,
}

/// Opaque observability sink the control loop publishes into. The bundled
/// implementation is the in-memory [`Registry`]; an HTTP exporter is just
/// another implementor living outside this daemon.
pub trait Sink: Send + Sync {
    fn publish_host(&self, host: &HostSample);
    fn publish_users(&self, users: &[UserSample]);
    fn publish_cgroups(&self, cgroups: &[CgroupSample]);
    fn incr_activations(&self);
    fn incr_deactivations(&self);
    fn incr_cycles(&self);
    fn incr_error(&self, component: &str, kind: &str);
    fn observe_cycle_seconds(&self, secs: f64);
    fn observe_collection_seconds(&self, secs: f64);
    /// Flush the current snapshot to wherever this sink exposes it.
    fn export(&self) {}
}

/// Sink used when telemetry is disabled.
#[derive(Debug, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn publish_host(&self, _host: &HostSample) {}
    fn publish_users(&self, _users: &[UserSample]) {}
    fn publish_cgroups(&self, _cgroups: &[CgroupSample]) {}
    fn incr_activations(&self) {}
    fn incr_deactivations(&self) {}
    fn incr_cycles(&self) {}
    fn incr_error(&self, _component: &str, _kind: &str) {}
    fn observe_cycle_seconds(&self, _secs: f64) {}
    fn observe_collection_seconds(&self, _secs: f64) {}
}

/// Duration histogram with fixed buckets (seconds).
#[derive(Debug, Clone, Serialize)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

impl Histogram {
    fn new() -> Histogram {
        Histogram {
            buckets: DURATION_BUCKETS.to_vec(),
            counts: vec![0; DURATION_BUCKETS.len() + 1],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        let idx = self
            .buckets
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.buckets.len());
        self.counts[idx] += 1;
        self.sum += value;
        self.count += 1;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub host: HostSample,
    pub users: Vec<UserSample>,
    pub cgroups: Vec<CgroupSample>,
    pub activations_total: u64,
    pub deactivations_total: u64,
    pub cycles_total: u64,
    pub errors_total: BTreeMap<String, u64>,
    pub cycle_duration_seconds: Histogram,
    pub collection_duration_seconds: Histogram,
}

#[derive(Debug)]
struct RegistryInner {
    host: HostSample,
    users: Vec<UserSample>,
    cgroups: Vec<CgroupSample>,
    activations: u64,
    deactivations: u64,
    cycles: u64,
    errors: BTreeMap<String, u64>,
    cycle_hist: Histogram,
    collection_hist: Histogram,
}

/// The in-memory metrics registry. Every cycle overwrites the gauges and
/// bumps the counters; `export` serializes the snapshot as JSON to the
/// configured file for an external exporter to serve.
pub struct Registry {
    inner: RwLock<RegistryInner>,
    export_path: Mutex<Option<PathBuf>>,
}

impl Registry {
    pub fn new(export_path: Option<PathBuf>) -> Registry {
        Registry {
            inner: RwLock::new(RegistryInner {
                host: HostSample::default(),
                users: Vec::new(),
                cgroups: Vec::new(),
                activations: 0,
                deactivations: 0,
                cycles: 0,
                errors: BTreeMap::new(),
                cycle_hist: Histogram::new(),
                collection_hist: Histogram::new(),
            }),
            export_path: Mutex::new(export_path),
        }
    }

    pub fn set_export_path(&self, path: Option<PathBuf>) {
        *self
            .export_path
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = path;
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        Snapshot {
            host: inner.host.clone(),
            users: inner.users.clone(),
            cgroups: inner.cgroups.clone(),
            activations_total: inner.activations,
            deactivations_total: inner.deactivations,
            cycles_total: inner.cycles,
            errors_total: inner.errors.clone(),
            cycle_duration_seconds: inner.cycle_hist.clone(),
            collection_duration_seconds: inner.collection_hist.clone(),
        }
    }

    fn try_export(&self) -> anyhow::Result<()> {
        let path = self
            .export_path
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let Some(path) = path else { return Ok(()) };
        let snap = self.snapshot();
        let body = serde_json::to_string_pretty(&snap).context("serialize telemetry snapshot")?;
        std::fs::write(&path, body).with_context(|| format!("write {}", path.display()))
    }
}

impl Sink for Registry {
    fn publish_host(&self, host: &HostSample) {
        self.inner.write().unwrap_or_else(|p| p.into_inner()).host = host.clone();
    }

    fn publish_users(&self, users: &[UserSample]) {
        self.inner.write().unwrap_or_else(|p| p.into_inner()).users = users.to_vec();
    }

    fn publish_cgroups(&self, cgroups: &[CgroupSample]) {
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .cgroups = cgroups.to_vec();
    }

    fn incr_activations(&self) {
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .activations += 1;
    }

    fn incr_deactivations(&self) {
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .deactivations += 1;
    }

    fn incr_cycles(&self) {
        self.inner.write().unwrap_or_else(|p| p.into_inner()).cycles += 1;
    }

    fn incr_error(&self, component: &str, kind: &str) {
        *self
            .inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .errors
            .entry(format!("{component}/{kind}"))
            .or_insert(0) += 1;
    }

    fn observe_cycle_seconds(&self, secs: f64) {
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .cycle_hist
            .observe(secs);
    }

    fn observe_collection_seconds(&self, secs: f64) {
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .collection_hist
            .observe(secs);
    }

    fn export(&self) {
        // Export trouble must never disturb the control loop.
        let _ = self.try_export();
    }
}
