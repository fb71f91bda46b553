use clap::Parser;
use cpumaster::cm::{build_info, cli, config, control};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    if args.version {
        println!("{}", build_info::banner());
        return Ok(());
    }
    let cfg = config::Config::load_and_validate(&args.config)?;
    control::run_daemon_async(cfg, &args.config).await
}
