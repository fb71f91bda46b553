use crate::cm::config::Config;
use crate::cm::metrics::SystemMetrics;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Activate,
    Deactivate,
    Maintain,
}

impl Decision {
    pub fn label(self) -> &'static str {
        match self {
            Decision::Activate => "ACTIVATE",
            Decision::Deactivate => "DEACTIVATE",
            Decision::Maintain => "MAINTAIN",
        }
    }
}

/// A decision plus the human-readable rationale that goes to the logs. The
/// rationale always cites the numeric threshold compared and the observed
/// value; operators debug the hysteresis from these lines.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub decision: Decision,
    pub rationale: String,
}

impl Outcome {
    fn new(decision: Decision, rationale: String) -> Outcome {
        Outcome {
            decision,
            rationale,
        }
    }
}

/// Process-wide enforcement bookkeeping. Mutated only by the control loop;
/// observers read through a shared lock.
#[derive(Debug, Default)]
pub struct EnforcementState {
    pub limits_active: bool,
    pub activated_at: Option<Instant>,
    pub tracked_users: BTreeMap<u32, PathBuf>,
    pub shared_cgroup_path: Option<PathBuf>,
}

impl EnforcementState {
    pub fn active_for(&self) -> Option<Duration> {
        self.activated_at.map(|t| t.elapsed())
    }

    pub fn reset(&mut self) {
        self.limits_active = false;
        self.activated_at = None;
        self.tracked_users.clear();
        self.shared_cgroup_path = None;
    }
}

/// The hysteretic controller. Checks run in a fixed order so the
/// min-active-time floor always wins over a release-worthy sample.
pub fn decide(cfg: &Config, snapshot: &SystemMetrics, enforcement: &EnforcementState) -> Outcome {
    let user = snapshot.user_cpu_percent;
    let activate = cfg.activate_pct;
    let release = cfg.release_pct;

    if enforcement.limits_active {
        if let Some(active_for) = enforcement.active_for() {
            if active_for < Duration::from_secs(cfg.min_active_time_s) {
                return Outcome::new(
                    Decision::Maintain,
                    format!(
                        "limits active for {}s, below the minimum active time of {}s",
                        active_for.as_secs(),
                        cfg.min_active_time_s
                    ),
                );
            }
        }

        if user < f64::from(release) {
            if cfg.ignore_system_load {
                return Outcome::new(
                    Decision::Deactivate,
                    format!(
                        "user cpu {user:.1}% below release threshold {release}%, system load ignored"
                    ),
                );
            }
            if !snapshot.under_load {
                return Outcome::new(
                    Decision::Deactivate,
                    format!(
                        "user cpu {user:.1}% below release threshold {release}% and system not under load"
                    ),
                );
            }
            return Outcome::new(
                Decision::Maintain,
                format!(
                    "user cpu {user:.1}% below release threshold {release}% but system under load (load1={:.2})",
                    snapshot.load1
                ),
            );
        }

        return Outcome::new(
            Decision::Maintain,
            format!("user cpu {user:.1}% still at or above release threshold {release}%"),
        );
    }

    if user >= f64::from(activate) {
        if snapshot.total_cores <= cfg.min_system_cores {
            return Outcome::new(
                Decision::Maintain,
                format!(
                    "user cpu {user:.1}% at or above activation threshold {activate}% but insufficient cores ({} <= {})",
                    snapshot.total_cores, cfg.min_system_cores
                ),
            );
        }
        if !cfg.ignore_system_load && snapshot.under_load {
            return Outcome::new(
                Decision::Maintain,
                format!(
                    "user cpu {user:.1}% at or above activation threshold {activate}% but system already under load (load1={:.2})",
                    snapshot.load1
                ),
            );
        }
        return Outcome::new(
            Decision::Activate,
            format!("user cpu {user:.1}% reached activation threshold {activate}%"),
        );
    }

    Outcome::new(
        Decision::Maintain,
        format!("user cpu {user:.1}% within normal range (activation threshold {activate}%)"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::SystemTime;

    fn snapshot(user_cpu: f64, cores: u32, under_load: bool, users: &[u32]) -> SystemMetrics {
        SystemMetrics {
            timestamp: SystemTime::now(),
            total_cores: cores,
            total_cpu_percent: user_cpu,
            user_cpu_percent: user_cpu,
            memory_used_mib: 512.0,
            load1: if under_load { f64::from(cores) } else { 0.1 },
            under_load,
            active_users: users.iter().copied().collect::<BTreeSet<u32>>(),
            per_user: BTreeMap::new(),
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.activate_pct = 75;
        cfg.release_pct = 40;
        cfg.min_active_time_s = 60;
        cfg.min_system_cores = 1;
        cfg.ignore_system_load = true;
        cfg
    }

    fn active_since(ago: Duration) -> EnforcementState {
        EnforcementState {
            limits_active: true,
            activated_at: Instant::now().checked_sub(ago),
            tracked_users: BTreeMap::new(),
            shared_cgroup_path: Some(PathBuf::from("/sys/fs/cgroup/cpu_manager/limited")),
        }
    }

    #[test]
    fn test_activation_over_threshold() {
        let cfg = test_config();
        let out = decide(
            &cfg,
            &snapshot(80.0, 4, false, &[1001, 1002]),
            &EnforcementState::default(),
        );
        assert_eq!(out.decision, Decision::Activate);
        assert!(out.rationale.contains("80.0%"), "{}", out.rationale);
        assert!(out.rationale.contains("75%"), "{}", out.rationale);
    }

    #[test]
    fn test_one_below_threshold_never_activates() {
        let cfg = test_config();
        let out = decide(
            &cfg,
            &snapshot(74.0, 4, false, &[1001]),
            &EnforcementState::default(),
        );
        assert_eq!(out.decision, Decision::Maintain);
    }

    #[test]
    fn test_below_threshold_emits_maintain() {
        let cfg = test_config();
        for user in [0.0, 10.0, 40.0, 74.9] {
            let out = decide(
                &cfg,
                &snapshot(user, 4, false, &[1001]),
                &EnforcementState::default(),
            );
            assert_eq!(out.decision, Decision::Maintain, "user={user}");
        }
    }

    #[test]
    fn test_release_blocked_by_min_active_time() {
        let cfg = test_config();
        let state = active_since(Duration::from_secs(30));
        let out = decide(&cfg, &snapshot(5.0, 4, false, &[]), &state);
        assert_eq!(out.decision, Decision::Maintain);
        assert!(out.rationale.contains("60s"), "{}", out.rationale);
    }

    #[test]
    fn test_min_active_time_holds_for_any_input() {
        let cfg = test_config();
        let state = active_since(Duration::from_secs(10));
        for user in [0.0, 39.9, 40.0, 99.0] {
            for under_load in [false, true] {
                let out = decide(&cfg, &snapshot(user, 4, under_load, &[1001]), &state);
                assert_ne!(out.decision, Decision::Deactivate, "user={user}");
            }
        }
    }

    #[test]
    fn test_release_permitted_after_min_active_time() {
        let mut cfg = test_config();
        cfg.ignore_system_load = false;
        let state = active_since(Duration::from_secs(120));
        let out = decide(&cfg, &snapshot(35.0, 4, false, &[]), &state);
        assert_eq!(out.decision, Decision::Deactivate);
        assert!(out.rationale.contains("35.0%"), "{}", out.rationale);
        assert!(out.rationale.contains("40%"), "{}", out.rationale);
    }

    #[test]
    fn test_release_held_while_under_load() {
        let mut cfg = test_config();
        cfg.ignore_system_load = false;
        let state = active_since(Duration::from_secs(120));
        let out = decide(&cfg, &snapshot(35.0, 4, true, &[]), &state);
        assert_eq!(out.decision, Decision::Maintain);
        assert!(out.rationale.contains("under load"), "{}", out.rationale);
    }

    #[test]
    fn test_ignore_system_load_bypasses_load_gate_entirely() {
        let cfg = test_config();
        // Activation despite load.
        let out = decide(
            &cfg,
            &snapshot(90.0, 4, true, &[1001]),
            &EnforcementState::default(),
        );
        assert_eq!(out.decision, Decision::Activate);
        // Release despite load.
        let state = active_since(Duration::from_secs(120));
        let out = decide(&cfg, &snapshot(10.0, 4, true, &[]), &state);
        assert_eq!(out.decision, Decision::Deactivate);
    }

    #[test]
    fn test_maintain_while_cpu_stays_high() {
        let cfg = test_config();
        let state = active_since(Duration::from_secs(120));
        let out = decide(&cfg, &snapshot(85.0, 4, false, &[1001]), &state);
        assert_eq!(out.decision, Decision::Maintain);
        assert!(out.rationale.contains("release threshold"), "{}", out.rationale);
    }

    #[test]
    fn test_activation_blocked_by_insufficient_cores() {
        let mut cfg = test_config();
        cfg.min_system_cores = 4;
        let out = decide(
            &cfg,
            &snapshot(90.0, 4, false, &[1001]),
            &EnforcementState::default(),
        );
        assert_eq!(out.decision, Decision::Maintain);
        assert!(out.rationale.contains("insufficient cores"), "{}", out.rationale);
    }

    #[test]
    fn test_enforcement_reset() {
        let mut state = active_since(Duration::from_secs(5));
        state.tracked_users.insert(1001, PathBuf::from("/x"));
        state.reset();
        assert!(!state.limits_active);
        assert!(state.activated_at.is_none());
        assert!(state.tracked_users.is_empty());
        assert!(state.shared_cgroup_path.is_none());
    }

    #[test]
    fn test_decision_labels() {
        assert_eq!(Decision::Activate.label(), "ACTIVATE");
        assert_eq!(Decision::Deactivate.label(), "DEACTIVATE");
        assert_eq!(Decision::Maintain.label(), "MAINTAIN");
    }
}
