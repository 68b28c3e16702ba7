use clap::Parser;
use payments_service::config::Cli;
use payments_service::service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Cli::parse().resolve()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cfg.log_level.as_str())).init();
    service::run(cfg).await
}
