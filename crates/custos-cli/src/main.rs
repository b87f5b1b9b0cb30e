//! Custos CLI: container image trust policies from the command line.
//!
//! Validate policy files, evaluate images against them, and create or
//! check standalone simple signing signatures.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::EnvFilter;

/// Custos: decide which container images may run.
///
/// Evaluates container image signatures against a trust policy, in the
/// `policy.json` format used by container tools.
#[derive(Parser)]
#[command(name = "custos", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (repeat for more detail: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Output logs as JSON (for machine consumption).
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Decode and validate a policy file.
    CheckPolicy(commands::check_policy::CheckPolicyArgs),
    /// Evaluate an image and its signatures against a policy.
    Verify(commands::verify::VerifyArgs),
    /// Sign a manifest with an OpenPGP key (simple signing).
    StandaloneSign(commands::standalone_sign::StandaloneSignArgs),
    /// Verify a simple signing signature against a known signer.
    StandaloneVerify(commands::standalone_verify::StandaloneVerifyArgs),
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::CheckPolicy(args) => commands::check_policy::execute(&args),
        Commands::Verify(args) => commands::verify::execute(&args),
        Commands::StandaloneSign(args) => commands::standalone_sign::execute(&args),
        Commands::StandaloneVerify(args) => commands::standalone_verify::execute(&args),
    }
}
