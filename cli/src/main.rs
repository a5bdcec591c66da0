mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    init::InitCommand, ls::LsCommand, restore::RestoreCommand, snapshots::SnapshotsCommand, users::UsersCommand,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "sealsnap",
    version,
    about = "Encrypted deduplicating backups",
    long_about = "Sealsnap stores encrypted, deduplicated backups on local disks, SFTP servers and S3 buckets"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'R',
        long,
        global = true,
        env = "SEALSNAP_REPOSITORY",
        help = "Repository location (path, sftp://user@host/path or s3://bucket/prefix)"
    )]
    repository: Option<String>,

    #[arg(short, long, global = true, env = "SEALSNAP_USER", default_value = "default", help = "Repository user")]
    user: String,

    #[arg(long, global = true, env = "SEALSNAP_PASSWORD", hide_env_values = true, help = "Repository password")]
    password: Option<String>,

    #[arg(long, global = true, env = "SEALSNAP_SSH_PASSWORD", hide_env_values = true, help = "SSH password or key passphrase")]
    ssh_password: Option<String>,

    #[arg(long, global = true, env = "SEALSNAP_SSH_KEY", help = "SSH private key file")]
    ssh_key: Option<PathBuf>,

    #[arg(long, global = true, env = "SEALSNAP_SSH_FINGERPRINT", help = "Expected SHA-256 host key fingerprint")]
    ssh_fingerprint: Option<String>,

    #[arg(long, global = true, env = "SEALSNAP_S3_ENDPOINT", help = "Endpoint of an S3-compatible service")]
    s3_endpoint: Option<String>,

    #[arg(short = 'j', long, global = true, env = "SEALSNAP_THREADS", help = "Number of parallel transfers")]
    threads: Option<usize>,

    #[arg(long, global = true, help = "Disable the local existence cache")]
    no_cache: bool,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Only show warnings and errors")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a new repository")]
    Init(InitCommand),

    #[command(about = "List snapshots")]
    Snapshots(SnapshotsCommand),

    #[command(about = "Restore a snapshot, directory or file")]
    Restore(RestoreCommand),

    #[command(about = "List the content of a snapshot or directory")]
    Ls(LsCommand),

    #[command(subcommand, about = "Manage repository users")]
    Users(UsersCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);
    debug!("Starting sealsnap {}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Init(cmd) => cmd.run(&cli).await,
        Commands::Snapshots(cmd) => cmd.run(&cli).await,
        Commands::Restore(cmd) => cmd.run(&cli).await,
        Commands::Ls(cmd) => cmd.run(&cli).await,
        Commands::Users(cmd) => cmd.run(&cli).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "sealsnap={level},sealsnap_core={level},sealsnap_backends={level}"
        ))
    });
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to install log subscriber");
    }
}
