use crate::cm::asyncutil::TaskTracker;
use crate::cm::config::{parse_cpu_quota, Config, QuotaLimit};
use crate::cm::logging::Logger;
use anyhow::Context as _;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// cpu.max period the daemon always uses for the shared subtree.
const QUOTA_PERIOD_US: u64 = 100_000;

/// Default proportional weight for every user child.
const DEFAULT_CPU_WEIGHT: u32 = 100;

/// Settle delay before bulk process placement into a fresh cgroup.
const PLACEMENT_DELAY: Duration = Duration::from_millis(400);

/// Back-off used for permission and non-empty-directory retries.
const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct ReconcilerPaths {
    cgroup_root: PathBuf,
    base_name: String,
    tracking_file: PathBuf,
    normal_quota: String,
}

/// Outcome of one reconciliation call. Per-UID failures never abort the
/// pass; the first one is carried here for the caller to log.
#[derive(Debug, Default)]
pub struct Report {
    pub created: Vec<u32>,
    pub removed: Vec<u32>,
    pub error_count: usize,
    pub first_error: Option<String>,
}

impl Report {
    fn record_error(&mut self, err: impl std::fmt::Display) {
        self.error_count += 1;
        if self.first_error.is_none() {
            self.first_error = Some(err.to_string());
        }
    }
}

/// Per-tracked-cgroup readings published to the observability sink.
#[derive(Debug, Clone)]
pub struct CgroupStats {
    pub uid: u32,
    pub path: PathBuf,
    pub quota: Option<(QuotaLimit, u64)>,
    pub memory_current: Option<u64>,
}

/// Owns every write under `<cgroup_root>/<base>`. One logical writer: the
/// async gate serializes activate/deactivate/release; the created-cgroup
/// map takes concurrent readers.
pub struct CgroupReconciler {
    logger: Logger,
    tasks: TaskTracker,
    paths: RwLock<ReconcilerPaths>,
    created: RwLock<BTreeMap<u32, PathBuf>>,
    gate: AsyncMutex<()>,
}

impl CgroupReconciler {
    pub fn new(cfg: &Config, logger: Logger, tasks: TaskTracker) -> CgroupReconciler {
        CgroupReconciler {
            logger,
            tasks,
            paths: RwLock::new(ReconcilerPaths {
                cgroup_root: cfg.cgroup_root.clone(),
                base_name: cfg.base_cgroup_name.clone(),
                tracking_file: cfg.tracking_file.clone(),
                normal_quota: cfg.normal_cpu_quota.clone(),
            }),
            created: RwLock::new(BTreeMap::new()),
            gate: AsyncMutex::new(()),
        }
    }

    /// Apply a reloaded config. Tracked entries keep their absolute paths,
    /// so teardown still targets the directories that were actually created.
    pub fn reconfigure(&self, cfg: &Config) {
        let mut p = self.paths.write().unwrap_or_else(|e| e.into_inner());
        p.cgroup_root = cfg.cgroup_root.clone();
        p.base_name = cfg.base_cgroup_name.clone();
        p.tracking_file = cfg.tracking_file.clone();
        p.normal_quota = cfg.normal_cpu_quota.clone();
    }

    fn paths(&self) -> ReconcilerPaths {
        self.paths.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn base_path(&self) -> PathBuf {
        let p = self.paths();
        p.cgroup_root.join(p.base_name.trim_start_matches('/'))
    }

    pub fn shared_path(&self) -> PathBuf {
        self.base_path().join("limited")
    }

    fn user_subdir(&self, uid: u32) -> PathBuf {
        self.shared_path().join(format!("user_{uid}"))
    }

    fn legacy_user_dir(&self, uid: u32) -> PathBuf {
        self.base_path().join(format!("user_{uid}"))
    }

    pub fn tracked_uids(&self) -> Vec<u32> {
        self.created
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.created.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn tracked_map(&self) -> BTreeMap<u32, PathBuf> {
        self.created
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Startup verification of the cgroup-v2 environment. Any failure here
    /// is fatal (the daemon cannot enforce anything without it).
    pub fn prepare(&self) -> anyhow::Result<()> {
        let p = self.paths();

        if !p.cgroup_root.exists() {
            anyhow::bail!("cgroup root does not exist: {}", p.cgroup_root.display());
        }

        let controllers_path = p.cgroup_root.join("cgroup.controllers");
        let controllers = fs::read_to_string(&controllers_path)
            .with_context(|| format!("read {}", controllers_path.display()))?;
        self.logger.info(
            "cgroup",
            format!("available_controllers {}", controllers.trim()),
        );
        if !controllers.split_whitespace().any(|c| c == "cpu") {
            anyhow::bail!("cpu controller not available in cgroup.controllers");
        }

        // Make sure the root delegates cpu and cpuset to children. The +cpu
        // write can legitimately fail on undelegated setups; that is fatal
        // by contract. +cpuset is tolerated.
        let root_subtree = p.cgroup_root.join("cgroup.subtree_control");
        let enabled = fs::read_to_string(&root_subtree)
            .with_context(|| format!("read {}", root_subtree.display()))?;
        let has = |name: &str| enabled.split_whitespace().any(|c| c == name);
        if !has("cpu") {
            fs::write(&root_subtree, "+cpu")
                .with_context(|| format!("enable cpu controller in {}", root_subtree.display()))?;
        }
        if !has("cpuset") {
            if let Err(e) = fs::write(&root_subtree, "+cpuset") {
                self.logger.warn(
                    "cgroup",
                    format!("cpuset_enable_failed path={} err={e}", root_subtree.display()),
                );
            }
        }

        let base = self.base_path();
        fs::create_dir_all(&base)
            .with_context(|| format!("create base cgroup {}", base.display()))?;
        let base_subtree = base.join("cgroup.subtree_control");
        write_controller_if_missing(&base_subtree, "cpu")
            .with_context(|| "enable cpu controller in base cgroup")?;
        write_controller_if_missing(&base_subtree, "cpuset")
            .with_context(|| "enable cpuset controller in base cgroup")?;

        self.recover_tracking(&p)?;

        self.logger.info(
            "cgroup",
            format!(
                "reconciler_ready root={} base={} tracked={}",
                p.cgroup_root.display(),
                base.display(),
                self.tracked_count()
            ),
        );
        Ok(())
    }

    /// Reload the tracking file, keeping only entries whose directory still
    /// exists, and rewrite it so stale lines do not survive a restart.
    fn recover_tracking(&self, p: &ReconcilerPaths) -> anyhow::Result<()> {
        let entries = load_tracking_file(&p.tracking_file)?;
        let mut kept: BTreeMap<u32, PathBuf> = BTreeMap::new();
        for (uid, path) in entries {
            if path.is_dir() {
                kept.insert(uid, path);
            } else {
                self.logger.debug(
                    "cgroup",
                    format!("tracking_stale_entry uid={uid} path={}", path.display()),
                );
            }
        }
        rewrite_tracking_file(&p.tracking_file, &kept)?;
        *self.created.write().unwrap_or_else(|e| e.into_inner()) = kept;
        Ok(())
    }

    /// The absolute quota for the shared subtree:
    /// `(total_cores - min_system_cores) * 100000`, floored at one core.
    pub fn shared_quota(total_cores: u32, min_system_cores: u32) -> String {
        let available = total_cores.saturating_sub(min_system_cores).max(1);
        format!("{} {QUOTA_PERIOD_US}", u64::from(available) * QUOTA_PERIOD_US)
    }

    /// Materialize the confinement for every active user in the snapshot.
    /// Fails only when the shared subtree itself cannot be set up; per-UID
    /// trouble lands in the report.
    pub async fn activate(
        &self,
        active_users: &[u32],
        total_cores: u32,
        min_system_cores: u32,
    ) -> anyhow::Result<Report> {
        let _gate = self.gate.lock().await;
        let mut report = Report::default();

        let shared = self.shared_path();
        tokio::fs::create_dir_all(&shared)
            .await
            .with_context(|| format!("create shared cgroup {}", shared.display()))?;
        if let Err(e) = write_controller_if_missing(&shared.join("cgroup.subtree_control"), "cpu") {
            self.logger.warn(
                "cgroup",
                format!("shared_subtree_control_failed err={e:#}"),
            );
        }

        let quota = Self::shared_quota(total_cores, min_system_cores);
        self.write_quota_if_changed(&shared.join("cpu.max"), &quota)
            .await
            .with_context(|| format!("apply shared quota to {}", shared.display()))?;

        let mut uids: Vec<u32> = active_users.to_vec();
        uids.sort_unstable();
        for uid in uids {
            if self
                .created
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&uid)
            {
                continue;
            }
            let user_dir = self.user_subdir(uid);
            if let Err(e) = fs::create_dir_all(&user_dir)
                .with_context(|| format!("create user cgroup {}", user_dir.display()))
            {
                self.logger
                    .error("cgroup", format!("user_cgroup_create_failed uid={uid} err={e:#}"));
                report.record_error(format!("uid {uid}: {e:#}"));
                continue;
            }
            self.write_weight(&user_dir, DEFAULT_CPU_WEIGHT);

            {
                let mut created = self.created.write().unwrap_or_else(|e| e.into_inner());
                created.insert(uid, user_dir.clone());
            }
            if let Err(e) = append_tracking_line(&self.paths().tracking_file, uid, &user_dir) {
                self.logger.warn(
                    "cgroup",
                    format!("tracking_append_failed uid={uid} err={e:#}"),
                );
            }

            self.spawn_placement(uid, user_dir);
            report.created.push(uid);
        }

        if !report.created.is_empty() {
            self.logger.info(
                "cgroup",
                format!(
                    "shared_cgroup_configured path={} quota=\"{quota}\" new_users={:?}",
                    shared.display(),
                    report.created
                ),
            );
        }
        Ok(report)
    }

    /// Background migration of one user's processes, after a settle delay.
    /// Idempotent: re-writing a PID already in the target cgroup is a no-op.
    fn spawn_placement(&self, uid: u32, user_dir: PathBuf) {
        let logger = self.logger.clone();
        let tasks = self.tasks.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(PLACEMENT_DELAY).await;
            if tasks.is_cancelled() {
                return;
            }
            let log2 = logger.clone();
            let dir2 = user_dir.clone();
            let res = tasks
                .spawn_blocking(move || move_all_user_processes(uid, &dir2, &log2))
                .await;
            match res {
                Ok(Ok(moved)) => {
                    // Weight is (re-)written once placement has been attempted.
                    write_weight_file(&user_dir, DEFAULT_CPU_WEIGHT, &logger);
                    if moved == 0 {
                        logger.debug("cgroup", format!("placement_empty uid={uid}"));
                    }
                }
                Ok(Err(e)) => {
                    logger.warn("cgroup", format!("placement_failed uid={uid} err={e:#}"));
                }
                Err(e) => {
                    logger.warn("cgroup", format!("placement_join_failed uid={uid} err={e}"));
                }
            }
        });
    }

    /// MAINTAIN-cycle straggler sweep: re-place processes of every tracked
    /// user without the settle delay. Best effort.
    pub fn sweep_stragglers(&self) {
        let tracked: Vec<(u32, PathBuf)> = self
            .created
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(uid, p)| (*uid, p.clone()))
            .collect();
        if tracked.is_empty() {
            return;
        }
        let logger = self.logger.clone();
        let tasks = self.tasks.clone();
        self.tasks.spawn_blocking(move || {
            for (uid, dir) in tracked {
                if tasks.is_cancelled() {
                    return;
                }
                if let Err(e) = move_all_user_processes(uid, &dir, &logger) {
                    logger.debug("cgroup", format!("sweep_failed uid={uid} err={e:#}"));
                }
            }
        });
    }

    /// Drop specific users from the shared subtree (used when a tracked user
    /// is no longer active). Never creates anything.
    pub async fn release_users(&self, uids: &[u32]) -> Report {
        let _gate = self.gate.lock().await;
        let mut report = Report::default();
        let mut uids: Vec<u32> = uids.to_vec();
        uids.sort_unstable();
        for uid in uids {
            let path = self
                .created
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&uid)
                .cloned();
            let Some(path) = path else { continue };
            match remove_cgroup_dir(&path).await {
                Ok(()) => {
                    self.created
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&uid);
                    report.removed.push(uid);
                    self.logger
                        .debug("cgroup", format!("user_released uid={uid}"));
                }
                Err(e) => {
                    self.logger.warn(
                        "cgroup",
                        format!("user_release_failed uid={uid} err={e:#}"),
                    );
                    report.record_error(format!("uid {uid}: {e:#}"));
                }
            }
        }
        if !report.removed.is_empty() {
            self.rewrite_tracking();
        }
        report
    }

    /// Tear the confinement down: restore the legacy per-user quota where a
    /// legacy cgroup still exists, remove every `user_<UID>/` child, then
    /// the `limited/` subtree. `<base>/` stays. Missing directories are
    /// non-errors; non-empty ones get one retry.
    pub async fn deactivate(&self) -> Report {
        let _gate = self.gate.lock().await;
        let mut report = Report::default();
        let p = self.paths();

        let tracked: Vec<u32> = self.tracked_uids();
        for uid in tracked {
            let legacy = self.legacy_user_dir(uid);
            if legacy.is_dir() {
                // Left over from the old one-cgroup-per-user mode: put its
                // quota back to the configured normal value.
                if let Err(e) =
                    write_with_permission_retry(&legacy.join("cpu.max"), &p.normal_quota)
                {
                    self.logger.warn(
                        "cgroup",
                        format!("legacy_quota_restore_failed uid={uid} err={e:#}"),
                    );
                }
            }

            let user_dir = self.user_subdir(uid);
            match remove_cgroup_dir(&user_dir).await {
                Ok(()) => {
                    report.removed.push(uid);
                }
                Err(e) => {
                    self.logger.error(
                        "cgroup",
                        format!("user_cgroup_remove_failed uid={uid} err={e:#}"),
                    );
                    report.record_error(format!("uid {uid}: {e:#}"));
                }
            }
        }

        let shared = self.shared_path();
        if let Err(e) = remove_cgroup_dir(&shared).await {
            self.logger.warn(
                "cgroup",
                format!("shared_cgroup_remove_failed path={} err={e:#}", shared.display()),
            );
            report.record_error(format!("shared: {e:#}"));
        }

        self.created
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.rewrite_tracking();

        self.logger.info(
            "cgroup",
            format!(
                "limits_deactivated users_freed={} errors={}",
                report.removed.len(),
                report.error_count
            ),
        );
        report
    }

    fn rewrite_tracking(&self) {
        let p = self.paths();
        let created = self
            .created
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Err(e) = rewrite_tracking_file(&p.tracking_file, &created) {
            self.logger.warn(
                "cgroup",
                format!(
                    "tracking_rewrite_failed file={} err={e:#}",
                    p.tracking_file.display()
                ),
            );
        }
    }

    /// Write a cpu.max payload only when the file does not already carry it;
    /// after writing, read back and re-write once on mismatch.
    async fn write_quota_if_changed(&self, path: &Path, quota: &str) -> anyhow::Result<()> {
        // Shape check happens before any write reaches the kernel.
        parse_cpu_quota(quota)?;

        if let Ok(current) = tokio::fs::read_to_string(path).await {
            if current.trim() == quota {
                return Ok(());
            }
        }
        if let Err(e) = tokio::fs::write(path, quota).await {
            if is_permission_error(&e) {
                let _ = fs::set_permissions(path, permissive_mode());
                tokio::time::sleep(RETRY_DELAY).await;
                tokio::fs::write(path, quota)
                    .await
                    .with_context(|| format!("write {}", path.display()))?;
            } else {
                return Err(e).with_context(|| format!("write {}", path.display()));
            }
        }

        // The kernel may normalize or reject the value; verify once.
        tokio::time::sleep(Duration::from_millis(50)).await;
        match tokio::fs::read_to_string(path).await {
            Ok(applied) if applied.trim() != quota => {
                self.logger.warn(
                    "cgroup",
                    format!(
                        "quota_verify_mismatch path={} requested=\"{quota}\" applied=\"{}\"",
                        path.display(),
                        applied.trim()
                    ),
                );
                let _ = tokio::fs::write(path, quota).await;
            }
            _ => {}
        }
        Ok(())
    }

    fn write_weight(&self, dir: &Path, weight: u32) {
        write_weight_file(dir, weight, &self.logger);
    }

    /// Read back cpu.max and memory.current for one tracked user.
    pub fn stats_for(&self, uid: u32) -> Option<CgroupStats> {
        let path = self
            .created
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&uid)
            .cloned()?;
        let quota = fs::read_to_string(path.join("cpu.max"))
            .ok()
            .and_then(|s| parse_cpu_quota(s.trim()).ok());
        let memory_current = fs::read_to_string(path.join("memory.current"))
            .ok()
            .and_then(|s| s.trim().parse().ok());
        Some(CgroupStats {
            uid,
            path,
            quota,
            memory_current,
        })
    }
}

fn permissive_mode() -> fs::Permissions {
    use std::os::unix::fs::PermissionsExt as _;
    fs::Permissions::from_mode(0o644)
}

fn is_permission_error(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EACCES) | Some(libc::EPERM))
        || e.kind() == io::ErrorKind::PermissionDenied
}

fn is_transient_error(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EBUSY))
}

/// Enable `+<name>` in a subtree_control file unless the token is already
/// present. Token comparison, not substring: "cpu" must not match "cpuset".
fn write_controller_if_missing(path: &Path, name: &str) -> anyhow::Result<()> {
    let current = match fs::read_to_string(path) {
        Ok(s) => s,
        // The kernel materializes this file with every cgroup; a missing one
        // means a non-cgroup filesystem, where writing simply creates it.
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    if current.split_whitespace().any(|c| c == name) {
        return Ok(());
    }
    fs::write(path, format!("+{name}"))
        .with_context(|| format!("write +{name} to {}", path.display()))
}

fn write_weight_file(dir: &Path, weight: u32, logger: &Logger) {
    let weight = weight.clamp(1, 10_000);
    let path = dir.join("cpu.weight");
    if let Err(e) = fs::write(&path, weight.to_string()) {
        logger.warn(
            "cgroup",
            format!("weight_write_failed path={} err={e}", path.display()),
        );
    }
}

/// Write with the one-retry permission fix the cgroupfs occasionally needs.
fn write_with_permission_retry(path: &Path, contents: &str) -> anyhow::Result<()> {
    match fs::write(path, contents) {
        Ok(()) => Ok(()),
        Err(e) if is_permission_error(&e) => {
            let _ = fs::set_permissions(path, permissive_mode());
            std::thread::sleep(RETRY_DELAY);
            fs::write(path, contents).with_context(|| format!("write {}", path.display()))
        }
        Err(e) => Err(e).with_context(|| format!("write {}", path.display())),
    }
}

/// Move a PID by writing it into the target cgroup.procs. EAGAIN/EBUSY and
/// vanished PIDs are expected races.
fn move_pid(procs_file: &Path, pid: i32) -> anyhow::Result<()> {
    match fs::write(procs_file, pid.to_string()) {
        Ok(()) => Ok(()),
        Err(e) if is_permission_error(&e) => {
            let _ = fs::set_permissions(procs_file, permissive_mode());
            std::thread::sleep(RETRY_DELAY);
            fs::write(procs_file, pid.to_string())
                .with_context(|| format!("move pid {pid} to {}", procs_file.display()))
        }
        Err(e) => Err(e).with_context(|| format!("move pid {pid} to {}", procs_file.display())),
    }
}

fn process_name(pid: i32) -> String {
    fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| format!("{}[{pid}]", s.trim()))
        .unwrap_or_else(|_| format!("PID-{pid}"))
}

/// Scan /proc and write every PID owned by `uid` into the user's
/// cgroup.procs, in the order the filesystem returns them. Returns the
/// number of processes moved.
fn move_all_user_processes(uid: u32, user_dir: &Path, logger: &Logger) -> anyhow::Result<usize> {
    let procs_file = user_dir.join("cgroup.procs");
    let entries = fs::read_dir("/proc").context("read /proc")?;

    let mut moved = 0usize;
    let mut found = 0usize;
    let mut names: Vec<String> = Vec::new();
    let mut first_error: Option<String> = None;
    let mut error_count = 0usize;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        let status = match fs::read_to_string(Path::new("/proc").join(&name).join("status")) {
            Ok(s) => s,
            Err(_) => continue,
        };
        if crate::cm::metrics::parse_uid_from_status(&status) != Some(uid) {
            continue;
        }
        found += 1;
        match move_pid(&procs_file, pid) {
            Ok(()) => {
                moved += 1;
                if names.len() < 10 {
                    names.push(process_name(pid));
                }
            }
            Err(e) => {
                error_count += 1;
                if first_error.is_none() {
                    first_error = Some(format!("{}: {e:#}", process_name(pid)));
                }
            }
        }
    }

    if moved > 0 {
        logger.info(
            "cgroup",
            format!(
                "user_processes_moved uid={uid} moved={moved} found={found} errors={error_count} sample={}",
                names.join(", ")
            ),
        );
    }
    if let Some(err) = first_error {
        logger.warn(
            "cgroup",
            format!("some_processes_not_moved uid={uid} errors={error_count} first={err}"),
        );
    }
    Ok(moved)
}

/// Remove a cgroup directory. Missing is fine; a busy directory gets one
/// retry after a short delay. Regular files inside are unlinked first —
/// a no-op on cgroupfs (control files refuse unlink, rmdir ignores them),
/// the equivalent cleanup on an ordinary filesystem.
async fn remove_cgroup_dir(path: &Path) -> anyhow::Result<()> {
    if let Ok(mut rd) = tokio::fs::read_dir(path).await {
        while let Ok(Some(entry)) = rd.next_entry().await {
            if entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false)
            {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
    match tokio::fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            let retryable = is_transient_error(&e)
                || e.kind() == io::ErrorKind::DirectoryNotEmpty
                || is_permission_error(&e);
            if !retryable {
                return Err(e).with_context(|| format!("remove {}", path.display()));
            }
            tokio::time::sleep(RETRY_DELAY).await;
            match tokio::fs::remove_dir(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
            }
        }
    }
}

fn load_tracking_file(path: &Path) -> anyhow::Result<Vec<(u32, PathBuf)>> {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((uid, p)) = line.split_once(':') else {
            continue;
        };
        let Ok(uid) = uid.parse::<u32>() else { continue };
        out.push((uid, PathBuf::from(p)));
    }
    Ok(out)
}

fn append_tracking_line(path: &Path, uid: u32, cgroup_path: &Path) -> anyhow::Result<()> {
    use std::io::Write as _;
    if let Some(dir) = path.parent() {
        let _ = fs::create_dir_all(dir);
    }
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(f, "{uid}:{}", cgroup_path.display())
        .with_context(|| format!("append to {}", path.display()))
}

fn rewrite_tracking_file(path: &Path, entries: &BTreeMap<u32, PathBuf>) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        let _ = fs::create_dir_all(dir);
    }
    let mut body = String::new();
    for (uid, p) in entries {
        body.push_str(&format!("{uid}:{}\n", p.display()));
    }
    fs::write(path, body).with_context(|| format!("rewrite {}", path.display()))
}
