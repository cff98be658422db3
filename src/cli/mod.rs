use clap::{Parser, Subcommand};
use std::path::PathBuf;

// CLI Commands (cmd_ prefix)
mod cmd_compact;
mod cmd_count_resources;
mod cmd_download;
mod cmd_download_history;
mod cmd_evaluate_measure;
mod cmd_upload;

// Helper modules (no cmd_ prefix)
mod logger;
mod progress;
mod utils;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "blazectl")]
#[command(version = VERSION)]
#[command(about = "Control your FHIR® server from the command line")]
#[command(long_about = "blazectl is a command line tool to control your FHIR® server.\n\n\
    You can upload transaction bundles from a directory, download resources\n\
    in NDJSON format, count resources and evaluate measures.")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Print version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    #[command(flatten)]
    globals: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct GlobalArgs {
    /// Base URL of the FHIR server
    #[arg(long, global = true, value_name = "URL")]
    server: Option<String>,

    /// User for basic authentication
    #[arg(long, global = true)]
    user: Option<String>,

    /// Password for basic authentication
    #[arg(long, global = true)]
    password: Option<String>,

    /// Bearer token for authentication
    #[arg(long, global = true)]
    token: Option<String>,

    /// Skip verification of the server certificate
    #[arg(short = 'k', long, global = true)]
    insecure: bool,

    /// PEM file with the sole certificate authority to trust
    #[arg(long, global = true, value_name = "PATH")]
    certificate_authority: Option<PathBuf>,

    /// Suppress the progress bar
    #[arg(long, global = true)]
    no_progress: bool,

    /// Enable verbose output
    #[arg(long, global = true)]
    verbose: bool,

    /// Suppress informational output
    #[arg(long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    Upload(cmd_upload::UploadCommand),
    Download(cmd_download::DownloadCommand),
    DownloadHistory(cmd_download_history::DownloadHistoryCommand),
    CountResources(cmd_count_resources::CountResourcesCommand),
    EvaluateMeasure(cmd_evaluate_measure::EvaluateMeasureCommand),
    Compact(cmd_compact::CompactCommand),
}

fn main() {
    let cli = Cli::parse();

    logger::init_logger(cli.globals.verbose, cli.globals.quiet);

    let result = match cli.command {
        Commands::Upload(cmd) => cmd_upload::run(cmd, &cli.globals),
        Commands::Download(cmd) => cmd_download::run(cmd, &cli.globals),
        Commands::DownloadHistory(cmd) => cmd_download_history::run(cmd, &cli.globals),
        Commands::CountResources(cmd) => cmd_count_resources::run(cmd, &cli.globals),
        Commands::EvaluateMeasure(cmd) => cmd_evaluate_measure::run(cmd, &cli.globals),
        Commands::Compact(cmd) => cmd_compact::run(cmd, &cli.globals),
    };

    if let Err(err) = result {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}
