use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "cpumaster", about = "fair-share CPU custodian daemon")]
pub struct Args {
    /// Path to the KEY=VALUE configuration file
    #[arg(short = 'c', long = "config", default_value = "/etc/cpu-manager.conf")]
    pub config: PathBuf,

    /// Print the version banner and exit
    #[arg(long = "version")]
    pub version: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_path() {
        let args = Args::parse_from(["cpumaster"]);
        assert_eq!(args.config, PathBuf::from("/etc/cpu-manager.conf"));
        assert!(!args.version);
    }

    #[test]
    fn test_explicit_config_path() {
        let args = Args::parse_from(["cpumaster", "-c", "/tmp/test.conf"]);
        assert_eq!(args.config, PathBuf::from("/tmp/test.conf"));
    }

    #[test]
    fn test_version_flag() {
        let args = Args::parse_from(["cpumaster", "--version"]);
        assert!(args.version);
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(Args::try_parse_from(["cpumaster", "--bogus"]).is_err());
    }
}
