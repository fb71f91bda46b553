use chrono::{DateTime, Utc};

pub fn build_host() -> &'static str {
    option_env!("CPUMASTER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_pretty() -> String {
    render_build_time(option_env!("CPUMASTER_BUILD_EPOCH"))
}

/// The build script embeds the build time as unix seconds; render it in UTC
/// so banners from different hosts compare cleanly.
fn render_build_time(epoch: Option<&str>) -> String {
    epoch
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Printed by `--version` and logged at boot so operators can tell which
/// build of the daemon is enforcing limits on a host.
pub fn banner() -> String {
    format!(
        "cpumaster {}, cgroup v2 CPU custodian (built {} on {})",
        env!("CARGO_PKG_VERSION"),
        build_time_pretty(),
        build_host()
    )
}
