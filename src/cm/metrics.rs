use crate::cm::config::Config;
use crate::cm::logging::Logger;
use anyhow::Context as _;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// Kernel USER_HZ; /proc/<pid>/stat utime/stime tick unit.
const USER_HZ: f64 = 100.0;

/// `under_load` gates release decisions, so it refreshes on its own short
/// clock regardless of the configured metrics TTL.
const UNDER_LOAD_TTL: Duration = Duration::from_secs(10);

const CORES_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq)]
pub struct UserMetrics {
    pub uid: u32,
    pub username: String,
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub process_count: u32,
}

/// One immutable per-cycle snapshot of everything the controller needs.
#[derive(Debug, Clone)]
pub struct SystemMetrics {
    pub timestamp: SystemTime,
    pub total_cores: u32,
    pub total_cpu_percent: f64,
    pub user_cpu_percent: f64,
    pub memory_used_mib: f64,
    pub load1: f64,
    pub under_load: bool,
    pub active_users: BTreeSet<u32>,
    pub per_user: BTreeMap<u32, UserMetrics>,
}

/// Capability the control loop depends on; tests substitute scripted fakes.
pub trait Probe: Send + Sync {
    fn sample(&self) -> anyhow::Result<SystemMetrics>;
}

struct Cached<T> {
    value: Option<(Instant, T)>,
}

impl<T: Clone> Cached<T> {
    fn empty() -> Self {
        Cached { value: None }
    }

    fn get(&self, ttl: Duration) -> Option<T> {
        match &self.value {
            Some((at, v)) if at.elapsed() < ttl => Some(v.clone()),
            _ => None,
        }
    }

    fn put(&mut self, v: T) {
        self.value = Some((Instant::now(), v));
    }

    fn clear(&mut self) {
        self.value = None;
    }
}

struct CollectorState {
    uid_min: u32,
    uid_max: u32,
    cache_ttl: Duration,

    cores: Cached<u32>,
    total_cpu: Cached<f64>,
    under_load: Cached<bool>,
    users: Cached<BTreeMap<u32, UserMetrics>>,

    // Previous per-PID cpu jiffies for the cross-sample delta.
    prev_jiffies: HashMap<i32, u64>,
    prev_scan_at: Option<Instant>,
}

/// Samples host and per-user CPU, memory and load from /proc. All reads are
/// blocking; the control loop runs `sample()` on the blocking pool.
pub struct Collector {
    logger: Logger,
    state: Mutex<CollectorState>,
}

impl Collector {
    pub fn new(cfg: &Config, logger: Logger) -> Collector {
        Collector {
            logger,
            state: Mutex::new(CollectorState {
                uid_min: cfg.uid_min,
                uid_max: cfg.uid_max,
                cache_ttl: Duration::from_secs(cfg.metrics_cache_ttl_s),
                cores: Cached::empty(),
                total_cpu: Cached::empty(),
                under_load: Cached::empty(),
                users: Cached::empty(),
                prev_jiffies: HashMap::new(),
                prev_scan_at: None,
            }),
        }
    }

    /// Apply a reloaded config: UID range and TTL. Callers clear the cache
    /// separately; the per-PID jiffies history survives so cpu% stays
    /// continuous across a reload.
    pub fn reconfigure(&self, cfg: &Config) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.uid_min = cfg.uid_min;
        st.uid_max = cfg.uid_max;
        st.cache_ttl = Duration::from_secs(cfg.metrics_cache_ttl_s);
    }

    pub fn clear_cache(&self) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.cores.clear();
        st.total_cpu.clear();
        st.under_load.clear();
        st.users.clear();
    }

    fn total_cores(&self) -> u32 {
        if let Some(v) = self
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .cores
            .get(CORES_TTL)
        {
            return v;
        }
        let cores = match std::thread::available_parallelism() {
            Ok(n) => n.get() as u32,
            Err(e) => {
                self.logger.warn(
                    "metrics",
                    format!("core_count_fallback reason={e}"),
                );
                fs::read_to_string("/proc/cpuinfo")
                    .map(|s| count_cpuinfo_processors(&s))
                    .unwrap_or(1)
                    .max(1)
            }
        };
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .cores
            .put(cores);
        cores
    }

    fn total_cpu_percent(&self) -> f64 {
        {
            let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(v) = st.total_cpu.get(st.cache_ttl) {
                return v;
            }
        }
        let usage = sample_stat_delta(Duration::from_secs(1)).unwrap_or_else(|e| {
            self.logger
                .warn("metrics", format!("cpu_sample_failed err={e}"));
            0.0
        });
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .total_cpu
            .put(usage);
        usage
    }

    fn is_under_load(&self, load1: f64, cores: u32) -> bool {
        if let Some(v) = self
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .under_load
            .get(UNDER_LOAD_TTL)
        {
            return v;
        }
        let under = load1 > f64::from(cores) * 0.7;
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .under_load
            .put(under);
        under
    }

    /// One pass over /proc accumulating cpu%, RSS and process count per
    /// non-system UID. PIDs that vanish mid-scan are skipped silently.
    fn scan_users(&self) -> anyhow::Result<BTreeMap<u32, UserMetrics>> {
        {
            let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(v) = st.users.get(st.cache_ttl) {
                return Ok(v);
            }
        }

        let entries = fs::read_dir("/proc").context("read /proc")?;
        let (uid_min, uid_max, prev, prev_at) = {
            let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            (
                st.uid_min,
                st.uid_max,
                st.prev_jiffies.clone(),
                st.prev_scan_at,
            )
        };
        let now = Instant::now();
        let elapsed = prev_at.map(|t| now.duration_since(t).as_secs_f64());

        let mut per_user: BTreeMap<u32, UserMetrics> = BTreeMap::new();
        let mut next_jiffies: HashMap<i32, u64> = HashMap::new();

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            let proc_dir = Path::new("/proc").join(name);

            // A PID can exit between read_dir and here; treat every
            // per-process read failure as "process gone".
            let Ok(status) = fs::read_to_string(proc_dir.join("status")) else {
                continue;
            };
            let Some(uid) = parse_uid_from_status(&status) else {
                continue;
            };
            if uid < uid_min || uid > uid_max {
                continue;
            }

            let jiffies = fs::read_to_string(proc_dir.join("stat"))
                .ok()
                .and_then(|s| parse_stat_jiffies(&s));
            let cpu_percent = match (jiffies, elapsed) {
                (Some(j), Some(secs)) if secs > 0.0 => {
                    next_jiffies.insert(pid, j);
                    match prev.get(&pid) {
                        Some(prev_j) if j >= *prev_j => {
                            (j - prev_j) as f64 / USER_HZ / secs * 100.0
                        }
                        // PID reuse or first sight: no delta yet.
                        _ => 0.0,
                    }
                }
                (Some(j), _) => {
                    next_jiffies.insert(pid, j);
                    0.0
                }
                _ => 0.0,
            };

            let rss = parse_vmrss_bytes(&status).unwrap_or(0);

            let um = per_user.entry(uid).or_insert_with(|| UserMetrics {
                uid,
                username: resolve_username(uid),
                cpu_percent: 0.0,
                rss_bytes: 0,
                process_count: 0,
            });
            um.cpu_percent += cpu_percent;
            um.rss_bytes += rss;
            um.process_count += 1;
        }

        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.prev_jiffies = next_jiffies;
        st.prev_scan_at = Some(now);
        st.users.put(per_user.clone());
        Ok(per_user)
    }
}

impl Probe for Collector {
    fn sample(&self) -> anyhow::Result<SystemMetrics> {
        // /proc itself being unreadable fails the whole sample; the control
        // loop skips the cycle on that.
        fs::metadata("/proc").context("stat /proc")?;

        let total_cores = self.total_cores();
        let total_cpu_percent = self.total_cpu_percent();
        let per_user = self.scan_users()?;
        let user_cpu_percent: f64 = per_user.values().map(|u| u.cpu_percent).sum();
        let active_users: BTreeSet<u32> = per_user.keys().copied().collect();

        let memory_used_mib = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo_used_mib(&s))
            .unwrap_or(0.0);

        let load1 = fs::read_to_string("/proc/loadavg")
            .context("read /proc/loadavg")
            .and_then(|s| parse_loadavg(&s).context("parse /proc/loadavg"))
            .unwrap_or_else(|e| {
                self.logger
                    .warn("metrics", format!("loadavg_failed err={e}"));
                0.0
            });

        let under_load = self.is_under_load(load1, total_cores);

        Ok(SystemMetrics {
            timestamp: SystemTime::now(),
            total_cores,
            total_cpu_percent,
            user_cpu_percent,
            memory_used_mib,
            load1,
            under_load,
            active_users,
            per_user,
        })
    }
}

fn resolve_username(uid: u32) -> String {
    users::get_user_by_uid(uid)
        .map(|u| u.name().to_string_lossy().into_owned())
        .unwrap_or_else(|| uid.to_string())
}

/// First numeric field after `Uid:` is the real UID.
pub(crate) fn parse_uid_from_status(status: &str) -> Option<u32> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            return rest.split_whitespace().next()?.parse().ok();
        }
    }
    None
}

/// `VmRSS:` is reported in kB.
pub(crate) fn parse_vmrss_bytes(status: &str) -> Option<u64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// utime + stime from /proc/<pid>/stat. The comm field may contain spaces
/// and parentheses, so fields are counted from the last ')'.
pub(crate) fn parse_stat_jiffies(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    // rest starts at field 3 (state); utime/stime are fields 14 and 15.
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

pub(crate) fn parse_loadavg(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse().ok()
}

pub(crate) fn count_cpuinfo_processors(contents: &str) -> u32 {
    contents
        .lines()
        .filter(|l| l.starts_with("processor"))
        .count() as u32
}

/// MemTotal - MemAvailable, in MiB.
pub(crate) fn parse_meminfo_used_mib(contents: &str) -> Option<f64> {
    let mut total_kb: Option<f64> = None;
    let mut avail_kb: Option<f64> = None;
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("MemTotal:") => total_kb = fields.next().and_then(|v| v.parse().ok()),
            Some("MemAvailable:") => avail_kb = fields.next().and_then(|v| v.parse().ok()),
            _ => {}
        }
    }
    let total = total_kb?;
    let avail = avail_kb.unwrap_or(0.0);
    Some((total - avail) / 1024.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

/// Aggregate `cpu ` line of /proc/stat.
pub(crate) fn parse_proc_stat_cpu(contents: &str) -> Option<CpuTimes> {
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 7 {
        return None;
    }
    let idle = fields[3];
    let total: u64 = fields.iter().take(8).sum();
    Some(CpuTimes { total, idle })
}

pub(crate) fn cpu_percent_from_delta(prev: CpuTimes, cur: CpuTimes) -> f64 {
    let total_delta = cur.total.saturating_sub(prev.total);
    if total_delta == 0 {
        return 0.0;
    }
    let idle_delta = cur.idle.saturating_sub(prev.idle);
    100.0 * (total_delta - idle_delta.min(total_delta)) as f64 / total_delta as f64
}

/// Blocking one-second delta sample of the aggregate /proc/stat cpu line.
fn sample_stat_delta(window: Duration) -> anyhow::Result<f64> {
    let first = fs::read_to_string("/proc/stat").context("read /proc/stat")?;
    let prev = parse_proc_stat_cpu(&first).context("parse /proc/stat")?;
    std::thread::sleep(window);
    let second = fs::read_to_string("/proc/stat").context("read /proc/stat")?;
    let cur = parse_proc_stat_cpu(&second).context("parse /proc/stat")?;
    Ok(cpu_percent_from_delta(prev, cur))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::logging::{Level, Logger};

    const STATUS: &str = "Name:\tbash\n\
Umask:\t0022\n\
State:\tS (sleeping)\n\
Uid:\t1001\t1001\t1001\t1001\n\
Gid:\t1001\t1001\t1001\t1001\n\
VmRSS:\t  5120 kB\n";

    #[test]
    fn test_parse_uid_from_status() {
        assert_eq!(parse_uid_from_status(STATUS), Some(1001));
        assert_eq!(parse_uid_from_status("Name: x\n"), None);
    }

    #[test]
    fn test_parse_vmrss_bytes() {
        assert_eq!(parse_vmrss_bytes(STATUS), Some(5120 * 1024));
        // Kernel threads have no VmRSS line.
        assert_eq!(parse_vmrss_bytes("Uid:\t0\t0\t0\t0\n"), None);
    }

    #[test]
    fn test_parse_stat_jiffies() {
        // comm containing spaces and a ')' must not shift the field count.
        let stat = "1234 (weird name)) S 1 1234 1234 0 -1 4194560 100 0 0 0 75 25 0 0 20 0 1 0 100 1000 200";
        assert_eq!(parse_stat_jiffies(stat), Some(100));
    }

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("1.52 0.80 0.40 2/300 12345\n"), Some(1.52));
        assert_eq!(parse_loadavg(""), None);
    }

    #[test]
    fn test_count_cpuinfo_processors() {
        let cpuinfo = "processor\t: 0\nmodel name: x\n\nprocessor\t: 1\n";
        assert_eq!(count_cpuinfo_processors(cpuinfo), 2);
    }

    #[test]
    fn test_parse_meminfo_used_mib() {
        let meminfo = "MemTotal:       2048000 kB\nMemFree:         100000 kB\nMemAvailable:   1024000 kB\n";
        assert_eq!(parse_meminfo_used_mib(meminfo), Some(1000.0));
    }

    #[test]
    fn test_parse_proc_stat_cpu() {
        let stat = "cpu  100 0 50 800 25 10 15 0 0 0\ncpu0 50 0 25 400 12 5 8 0 0 0\n";
        let t = parse_proc_stat_cpu(stat).unwrap();
        assert_eq!(t.idle, 800);
        assert_eq!(t.total, 1000);
    }

    #[test]
    fn test_cpu_percent_from_delta() {
        let prev = CpuTimes { total: 1000, idle: 800 };
        let cur = CpuTimes { total: 2000, idle: 1600 };
        assert!((cpu_percent_from_delta(prev, cur) - 20.0).abs() < 1e-9);
        // No progress between reads.
        assert_eq!(cpu_percent_from_delta(cur, cur), 0.0);
    }

    #[test]
    fn test_cached_ttl() {
        let mut c: Cached<u32> = Cached::empty();
        assert_eq!(c.get(Duration::from_secs(1)), None);
        c.put(5);
        assert_eq!(c.get(Duration::from_secs(60)), Some(5));
        assert_eq!(c.get(Duration::ZERO), None);
        c.clear();
        assert_eq!(c.get(Duration::from_secs(60)), None);
    }

    fn test_collector() -> Collector {
        let mut cfg = crate::cm::config::Config::default();
        cfg.uid_min = 0;
        cfg.uid_max = u32::MAX;
        cfg.metrics_cache_ttl_s = 15;
        Collector::new(&cfg, Logger::stderr_only(Level::Error))
    }

    #[test]
    fn test_total_cores_live() {
        let c = test_collector();
        assert!(c.total_cores() >= 1);
        // Second read is served from cache.
        assert!(c.total_cores() >= 1);
    }

    #[test]
    fn test_scan_users_live() {
        // With the full UID range every process on the host qualifies, so
        // the scan must find at least this one.
        let c = test_collector();
        let users = c.scan_users().unwrap();
        let total: u32 = users.values().map(|u| u.process_count).sum();
        assert!(total >= 1);
    }

    #[test]
    fn test_scan_users_excludes_out_of_range() {
        let mut cfg = crate::cm::config::Config::default();
        // An empty-by-construction range: no UID satisfies it.
        cfg.uid_min = u32::MAX;
        cfg.uid_max = u32::MAX;
        let c = Collector::new(&cfg, Logger::stderr_only(Level::Error));
        let users = c.scan_users().unwrap();
        assert!(users.values().all(|u| u.uid == u32::MAX));
    }
}
