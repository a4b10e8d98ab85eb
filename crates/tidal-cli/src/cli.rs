use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tidal")]
#[command(about = "Adaptive multipart uploads to S3-compatible object stores")]
#[command(after_help = "Run '<command> --help' for detailed options on each command.")]
pub struct Cli {
    /// Override the configuration directory for this invocation
    #[arg(long, global = true, value_name = "PATH")]
    pub config_dir: Option<PathBuf>,
    /// Log strategy decisions as they happen
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Upload a file through the signing service
    Upload(UploadArgs),
    /// Upload synthetic data over a simulated link
    Simulate(SimulateArgs),
    /// List the connection profiles with any configured overrides applied
    Profiles,
    /// Diagnostics and tooling commands
    Diagnostics {
        #[command(subcommand)]
        command: DiagnosticsCommand,
    },
}

#[derive(Subcommand)]
pub enum DiagnosticsCommand {
    /// Show recent transfer history captured locally
    Perf(PerfArgs),
}

#[derive(Args, Clone, Debug)]
pub struct PerfArgs {
    /// Number of recent records to display (0 = all)
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
    /// Remove the stored history file
    #[arg(long)]
    pub clear: bool,
}

/// Output switches shared by `upload` and `simulate`.
#[derive(Args, Clone, Debug)]
pub struct OutputArgs {
    /// Show a progress bar
    #[arg(long, short = 'p')]
    pub progress: bool,
    /// Print every transfer event as a JSON line on stdout
    #[arg(long, conflicts_with = "progress")]
    pub events_json: bool,
}

#[derive(Args, Clone, Debug)]
pub struct UploadArgs {
    /// File to upload
    pub file: PathBuf,
    /// Object key (default: file name with a timestamp suffix)
    #[arg(long)]
    pub key: Option<String>,
    /// Signing service base URL (overrides `endpoint` in config.toml)
    #[arg(long)]
    pub endpoint: Option<String>,
    /// Connection profile (dsl, cable, fiber, enterprise, gigabit, ultra)
    #[arg(long)]
    pub profile: Option<String>,
    /// Known uplink bandwidth, used to pick a profile
    #[arg(long, value_name = "MBPS")]
    pub bandwidth_mbps: Option<f64>,
    /// Known round-trip latency (default: measured against the endpoint)
    #[arg(long, value_name = "MS")]
    pub latency_ms: Option<f64>,
    /// Content type recorded on the object
    #[arg(long)]
    pub content_type: Option<String>,
    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Clone, Debug)]
pub struct SimulateArgs {
    /// Size of the synthetic object in MiB
    pub size_mib: u64,
    /// Shared link bandwidth
    #[arg(long, value_name = "MBPS")]
    pub link_mbps: f64,
    /// Ceiling for a single part transfer, like a latency-bound TCP stream
    #[arg(long, value_name = "MIB_PER_SEC")]
    pub per_stream_mib: Option<f64>,
    /// Round-trip latency added to every store request
    #[arg(long, value_name = "MS", default_value_t = 20)]
    pub latency_ms: u64,
    /// Connection profile (default: picked from the link bandwidth)
    #[arg(long)]
    pub profile: Option<String>,
    /// Fail the first attempt of this part with a transient error (repeatable)
    #[arg(long, value_name = "N")]
    pub fail_part: Vec<u32>,
    /// Stall the first attempt of this part so it turns into a zombie (repeatable)
    #[arg(long, value_name = "N")]
    pub stall_part: Vec<u32>,
    #[command(flatten)]
    pub output: OutputArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_simulate_with_repeated_faults() {
        let cli = Cli::parse_from([
            "tidal",
            "simulate",
            "64",
            "--link-mbps",
            "80",
            "--fail-part",
            "2",
            "--fail-part",
            "5",
            "--events-json",
        ]);
        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.size_mib, 64);
                assert_eq!(args.fail_part, vec![2, 5]);
                assert!(args.output.events_json);
                assert_eq!(args.latency_ms, 20);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn progress_and_json_are_exclusive() {
        let parsed = Cli::try_parse_from(["tidal", "upload", "a.bin", "--progress", "--events-json"]);
        assert!(parsed.is_err());
    }
}
