use clap::Parser;
use tracing_subscriber::EnvFilter;
use training::{run_train, TrainOptions};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let opts = TrainOptions::parse();
    run_train(opts)?;
    Ok(())
}
