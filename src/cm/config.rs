use anyhow::Context as _;
use std::fs;
use std::path::{Path, PathBuf};

/// Runtime configuration, populated from defaults, the KEY=VALUE config
/// file, and environment variables of the same KEY (in that order).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // Paths
    pub cgroup_root: PathBuf,
    pub base_cgroup_name: String,
    pub tracking_file: PathBuf,
    pub log_file: PathBuf,

    // Timing (seconds)
    pub poll_interval_s: u64,
    pub min_active_time_s: u64,
    pub metrics_cache_ttl_s: u64,

    // Thresholds (percent of aggregate user CPU)
    pub activate_pct: u32,
    pub release_pct: u32,

    // cgroup cpu.max payloads
    pub normal_cpu_quota: String,
    pub limited_cpu_quota: String,

    // System
    pub min_system_cores: u32,
    pub uid_min: u32,
    pub uid_max: u32,
    pub ignore_system_load: bool,

    // Logging
    pub log_level: String,
    pub log_max_size: u64,

    // Telemetry collaborator (exposition transport lives outside this daemon)
    pub enable_prometheus: bool,
    pub prometheus_file: PathBuf,
    pub prometheus_host: String,
    pub prometheus_port: u16,
    pub prometheus_tls_enabled: bool,
    pub prometheus_auth_type: String,
}

/// Keys recognized in the config file and as environment overrides.
const CONFIG_KEYS: &[&str] = &[
    "CGROUP_ROOT",
    "SCRIPT_CGROUP_BASE",
    "CREATED_CGROUPS_FILE",
    "LOG_FILE",
    "POLLING_INTERVAL",
    "MIN_ACTIVE_TIME",
    "METRICS_CACHE_TTL",
    "CPU_THRESHOLD",
    "CPU_RELEASE_THRESHOLD",
    "CPU_QUOTA_NORMAL",
    "CPU_QUOTA_LIMITED",
    "MIN_SYSTEM_CORES",
    "SYSTEM_UID_MIN",
    "SYSTEM_UID_MAX",
    "IGNORE_SYSTEM_LOAD",
    "LOG_LEVEL",
    "LOG_MAX_SIZE",
    "ENABLE_PROMETHEUS",
    "PROMETHEUS_FILE",
    "PROMETHEUS_HOST",
    "PROMETHEUS_PORT",
    "PROMETHEUS_TLS_ENABLED",
    "PROMETHEUS_AUTH_TYPE",
];

fn default_uid_max() -> u32 {
    // The historical default tracks the kernel's pid_max so freshly allocated
    // service accounts above the usual 60000 ceiling still count as users.
    fs::read_to_string("/proc/sys/kernel/pid_max")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(60_000)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            base_cgroup_name: "cpu_manager".to_string(),
            tracking_file: PathBuf::from("/var/run/cpu-manager-cgroups.txt"),
            log_file: PathBuf::from("/var/log/cpu-manager.log"),

            poll_interval_s: 30,
            min_active_time_s: 60,
            metrics_cache_ttl_s: 15,

            activate_pct: 75,
            release_pct: 40,

            normal_cpu_quota: "max 100000".to_string(),
            limited_cpu_quota: "50000 100000".to_string(),

            min_system_cores: 1,
            uid_min: 1000,
            uid_max: default_uid_max(),
            ignore_system_load: false,

            log_level: "INFO".to_string(),
            log_max_size: 10 * 1024 * 1024,

            enable_prometheus: false,
            prometheus_file: PathBuf::from("/var/run/cpu-manager-metrics.prom"),
            prometheus_host: "127.0.0.1".to_string(),
            prometheus_port: 9101,
            prometheus_tls_enabled: false,
            prometheus_auth_type: "none".to_string(),
        }
    }
}

impl Config {
    /// Load defaults, overlay the config file (a missing file is fine),
    /// overlay environment variables, then validate.
    pub fn load_and_validate(path: &Path) -> anyhow::Result<Config> {
        let mut cfg = Config::default();
        cfg.apply_file(path)
            .with_context(|| format!("loading config file {}", path.display()))?;
        cfg.apply_env();
        cfg.validate()
            .with_context(|| format!("validating config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn apply_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                anyhow::bail!("malformed config line {}: {line}", idx + 1);
            };
            let key = key.trim();
            let value = strip_quotes(value.trim());
            self.set(key, value);
        }
        Ok(())
    }

    pub fn apply_env(&mut self) {
        for key in CONFIG_KEYS {
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    self.set(key, &value);
                }
            }
        }
    }

    /// Apply a single KEY=VALUE pair. Unknown keys are ignored; values that
    /// fail to parse for a numeric key leave the previous value in place.
    fn set(&mut self, key: &str, value: &str) {
        match key {
            "CGROUP_ROOT" => self.cgroup_root = PathBuf::from(value),
            "SCRIPT_CGROUP_BASE" => self.base_cgroup_name = value.to_string(),
            "CREATED_CGROUPS_FILE" => self.tracking_file = PathBuf::from(value),
            "LOG_FILE" => self.log_file = PathBuf::from(value),

            "POLLING_INTERVAL" => {
                if let Ok(v) = value.parse() {
                    self.poll_interval_s = v;
                }
            }
            "MIN_ACTIVE_TIME" => {
                if let Ok(v) = value.parse() {
                    self.min_active_time_s = v;
                }
            }
            "METRICS_CACHE_TTL" => {
                if let Ok(v) = value.parse() {
                    self.metrics_cache_ttl_s = v;
                }
            }

            "CPU_THRESHOLD" => {
                if let Ok(v) = value.parse() {
                    self.activate_pct = v;
                }
            }
            "CPU_RELEASE_THRESHOLD" => {
                if let Ok(v) = value.parse() {
                    self.release_pct = v;
                }
            }

            "CPU_QUOTA_NORMAL" => self.normal_cpu_quota = value.to_string(),
            "CPU_QUOTA_LIMITED" => self.limited_cpu_quota = value.to_string(),

            "MIN_SYSTEM_CORES" => {
                if let Ok(v) = value.parse() {
                    self.min_system_cores = v;
                }
            }
            "SYSTEM_UID_MIN" => {
                if let Ok(v) = value.parse() {
                    self.uid_min = v;
                }
            }
            "SYSTEM_UID_MAX" => {
                if let Ok(v) = value.parse() {
                    self.uid_max = v;
                }
            }
            "IGNORE_SYSTEM_LOAD" => self.ignore_system_load = parse_boolish(value),

            "LOG_LEVEL" => self.log_level = value.to_ascii_uppercase(),
            "LOG_MAX_SIZE" => {
                if let Ok(v) = value.parse() {
                    self.log_max_size = v;
                }
            }

            "ENABLE_PROMETHEUS" => self.enable_prometheus = parse_boolish(value),
            "PROMETHEUS_FILE" => self.prometheus_file = PathBuf::from(value),
            "PROMETHEUS_HOST" => self.prometheus_host = value.to_string(),
            "PROMETHEUS_PORT" => {
                if let Ok(v) = value.parse() {
                    self.prometheus_port = v;
                }
            }
            "PROMETHEUS_TLS_ENABLED" => self.prometheus_tls_enabled = parse_boolish(value),
            "PROMETHEUS_AUTH_TYPE" => self.prometheus_auth_type = value.to_ascii_lowercase(),

            _ => {}
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.activate_pct < 1 || self.activate_pct > 100 {
            errors.push("CPU_THRESHOLD must be between 1 and 100".to_string());
        }
        if self.release_pct < 1 || self.release_pct > 100 {
            errors.push("CPU_RELEASE_THRESHOLD must be between 1 and 100".to_string());
        }
        if self.activate_pct <= self.release_pct {
            errors.push("CPU_THRESHOLD must be greater than CPU_RELEASE_THRESHOLD".to_string());
        }

        if self.poll_interval_s < 5 {
            errors.push("POLLING_INTERVAL must be at least 5 seconds".to_string());
        }

        if self.min_system_cores < 1 {
            errors.push("MIN_SYSTEM_CORES must be at least 1".to_string());
        }

        if let Err(e) = parse_cpu_quota(&self.normal_cpu_quota) {
            errors.push(format!("CPU_QUOTA_NORMAL: {e}"));
        }
        if let Err(e) = parse_cpu_quota(&self.limited_cpu_quota) {
            errors.push(format!("CPU_QUOTA_LIMITED: {e}"));
        }

        if !matches!(self.log_level.as_str(), "DEBUG" | "INFO" | "WARN" | "ERROR") {
            errors.push("LOG_LEVEL must be one of: DEBUG, INFO, WARN, ERROR".to_string());
        }

        if self.uid_max < self.uid_min {
            errors.push("SYSTEM_UID_MAX must be greater than or equal to SYSTEM_UID_MIN".to_string());
        }

        let name = self.base_cgroup_name.trim();
        if name.is_empty() {
            errors.push("SCRIPT_CGROUP_BASE must not be empty".to_string());
        } else if name.split('/').any(|seg| seg == "..") {
            errors.push("SCRIPT_CGROUP_BASE must not contain '..'".to_string());
        }

        if self.enable_prometheus && self.prometheus_port == 0 {
            errors.push("PROMETHEUS_PORT must be a valid TCP port".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("{}", errors.join("; "));
        }
        Ok(())
    }

    /// True when an already-running telemetry collaborator cannot pick up the
    /// change without a restart (listener address, TLS or auth mode).
    pub fn telemetry_restart_required(&self, new: &Config) -> bool {
        self.enable_prometheus != new.enable_prometheus
            || self.prometheus_host != new.prometheus_host
            || self.prometheus_port != new.prometheus_port
            || self.prometheus_tls_enabled != new.prometheus_tls_enabled
            || self.prometheus_auth_type != new.prometheus_auth_type
    }
}

fn strip_quotes(s: &str) -> &str {
    s.trim_matches(|c| c == '"' || c == '\'')
}

fn parse_boolish(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// The limit half of a cgroup v2 `cpu.max` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaLimit {
    Max,
    Us(u64),
}

/// Parse a `cpu.max` payload. The accepted shape is exactly
/// `(max|<quota>) <period>` with a single space, `<quota> >= 0` and
/// `<period> >= 1`; anything else is rejected.
pub fn parse_cpu_quota(s: &str) -> anyhow::Result<(QuotaLimit, u64)> {
    let Some((quota, period)) = s.split_once(' ') else {
        anyhow::bail!("cpu quota must be 'quota period' or 'max period', got {s:?}");
    };
    let limit = if quota == "max" {
        QuotaLimit::Max
    } else {
        QuotaLimit::Us(parse_decimal(quota).with_context(|| format!("invalid quota in {s:?}"))?)
    };
    let period = parse_decimal(period).with_context(|| format!("invalid period in {s:?}"))?;
    anyhow::ensure!(period >= 1, "cpu quota period must be >= 1, got {s:?}");
    Ok((limit, period))
}

fn parse_decimal(s: &str) -> anyhow::Result<u64> {
    anyhow::ensure!(
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()),
        "expected an unsigned integer, got {s:?}"
    );
    Ok(s.parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(cfg.base_cgroup_name, "cpu_manager");
        assert_eq!(cfg.poll_interval_s, 30);
        assert_eq!(cfg.activate_pct, 75);
        assert_eq!(cfg.release_pct, 40);
        assert_eq!(cfg.min_system_cores, 1);
        assert_eq!(cfg.uid_min, 1000);
        assert!(cfg.uid_max >= cfg.uid_min);
        assert_eq!(cfg.log_level, "INFO");
        assert!(!cfg.ignore_system_load);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_apply_file() {
        let f = write_config(
            "# comment line\n\
             \n\
             CPU_THRESHOLD=90\n\
             CPU_RELEASE_THRESHOLD = 50\n\
             SCRIPT_CGROUP_BASE=\"throttle\"\n\
             IGNORE_SYSTEM_LOAD='yes'\n\
             UNKNOWN_KEY=whatever\n\
             LOG_LEVEL=debug\n",
        );
        let mut cfg = Config::default();
        cfg.apply_file(f.path()).unwrap();
        assert_eq!(cfg.activate_pct, 90);
        assert_eq!(cfg.release_pct, 50);
        assert_eq!(cfg.base_cgroup_name, "throttle");
        assert!(cfg.ignore_system_load);
        assert_eq!(cfg.log_level, "DEBUG");
    }

    #[test]
    fn test_apply_file_missing_is_ok() {
        let mut cfg = Config::default();
        cfg.apply_file(Path::new("/nonexistent/cpu-manager.conf")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_apply_file_malformed_line() {
        let f = write_config("CPU_THRESHOLD=90\nthis is not a key value pair\n");
        let mut cfg = Config::default();
        let err = cfg.apply_file(f.path()).unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn test_unparseable_number_keeps_previous_value() {
        let f = write_config("POLLING_INTERVAL=fast\n");
        let mut cfg = Config::default();
        cfg.apply_file(f.path()).unwrap();
        assert_eq!(cfg.poll_interval_s, 30);
    }

    #[test]
    fn test_env_overrides_file() {
        let f = write_config("CPU_THRESHOLD=80\n");
        std::env::set_var("CPU_THRESHOLD", "95");
        let cfg = Config::load_and_validate(f.path()).unwrap();
        std::env::remove_var("CPU_THRESHOLD");
        assert_eq!(cfg.activate_pct, 95);
    }

    #[test]
    fn test_validate_threshold_ordering() {
        let mut cfg = Config::default();
        cfg.activate_pct = 40;
        cfg.release_pct = 40;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("CPU_THRESHOLD must be greater"));
    }

    #[test]
    fn test_validate_polling_floor() {
        let mut cfg = Config::default();
        cfg.poll_interval_s = 4;
        assert!(cfg.validate().is_err());
        cfg.poll_interval_s = 5;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_uid_range() {
        let mut cfg = Config::default();
        cfg.uid_min = 5000;
        cfg.uid_max = 4999;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_base_name() {
        let mut cfg = Config::default();
        cfg.base_cgroup_name = "a/../b".to_string();
        assert!(cfg.validate().is_err());
        cfg.base_cgroup_name = "".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_min_system_cores() {
        let mut cfg = Config::default();
        cfg.min_system_cores = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_quota_grammar_accepts() {
        assert_eq!(
            parse_cpu_quota("max 100000").unwrap(),
            (QuotaLimit::Max, 100_000)
        );
        assert_eq!(
            parse_cpu_quota("50000 100000").unwrap(),
            (QuotaLimit::Us(50_000), 100_000)
        );
        assert_eq!(parse_cpu_quota("0 1").unwrap(), (QuotaLimit::Us(0), 1));
    }

    #[test]
    fn test_quota_grammar_rejects() {
        for bad in [
            "",
            "max",
            "100000",
            "max  100000",
            " max 100000",
            "max 100000 ",
            "MAX 100000",
            "-1 100000",
            "+5 100000",
            "max 0",
            "max nan",
            "1.5 100000",
            "max 100000 extra",
        ] {
            assert!(parse_cpu_quota(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_telemetry_restart_required() {
        let cfg = Config::default();
        let mut new = cfg.clone();
        assert!(!cfg.telemetry_restart_required(&new));
        new.prometheus_port = 9102;
        assert!(cfg.telemetry_restart_required(&new));
        let mut new2 = cfg.clone();
        new2.prometheus_auth_type = "basic".to_string();
        assert!(cfg.telemetry_restart_required(&new2));
    }

    #[test]
    fn test_boolish() {
        for v in ["true", "1", "Yes", "ON"] {
            assert!(parse_boolish(v), "{v}");
        }
        for v in ["false", "0", "no", "off", "maybe", ""] {
            assert!(!parse_boolish(v), "{v}");
        }
    }
}
