mod cli;
mod context;
mod diagnostics;
mod profiles;
mod upload;

use clap::Parser;
use cli::{Cli, Commands, DiagnosticsCommand};
use context::AppContext;
use eyre::Result;
use tidal_core::config;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(dir) = &cli.config_dir {
        config::set_config_dir(dir);
    }
    let ctx = AppContext::load()?;

    match &cli.command {
        Commands::Upload(args) => upload::run_upload(&ctx, args).await?,
        Commands::Simulate(args) => upload::run_simulate(&ctx, args).await?,
        Commands::Profiles => profiles::run_profiles(&ctx)?,
        Commands::Diagnostics { command } => match command {
            DiagnosticsCommand::Perf(args) => diagnostics::run_diagnostics_perf(&ctx, args)?,
        },
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .init();
}
