use std::env;
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

fn build_epoch() -> u64 {
    // Reproducible builds pin the timestamp through SOURCE_DATE_EPOCH.
    if let Some(secs) = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.trim().parse().ok())
    {
        return secs;
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn build_host() -> String {
    let from_env = env::var("HOSTNAME")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    from_env
        .or_else(|| {
            fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rustc-env=CPUMASTER_BUILD_EPOCH={}", build_epoch());
    println!("cargo:rustc-env=CPUMASTER_BUILD_HOST={}", build_host());
}
