use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use holefs::modules::config::ensure_unprivileged;
use holefs::{CodecSpec, Config, FilesystemManager, Mode};
use log::{info, LevelFilter};
use nix::sys::stat::{umask, Mode as Permissions};
use std::path::PathBuf;
use tokio::runtime::Handle;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct MountArgs {
    /// Backing directory
    root: PathBuf,
    /// Mount point
    mountpoint: PathBuf,
    /// Mount options
    #[arg(short = 'o', value_name = "opt[,opt...]")]
    options: Vec<String>,
    /// JSON codec profile replacing the default gpg invocation
    #[arg(long, value_name = "FILE")]
    codec_config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a black hole: files written are encrypted into ROOT
    Ingest {
        #[command(flatten)]
        mount: MountArgs,
        /// Identity the codec encrypts to
        #[arg(short, long)]
        recipient: Option<String>,
    },
    /// Mount a white hole: files in ROOT are decrypted when read
    Egress {
        #[command(flatten)]
        mount: MountArgs,
    },
}

impl Commands {
    fn into_config(self) -> Result<Config> {
        let (mode, args, recipient) = match self {
            Commands::Ingest { mount, recipient } => (Mode::Ingest, mount, recipient),
            Commands::Egress { mount } => (Mode::Egress, mount, None),
        };

        let mut config = Config::new(mode, args.root, args.mountpoint);
        config.recipient = recipient;
        config.mount_options = args.options;
        if let Some(profile) = args.codec_config {
            config.codec = CodecSpec::from_file(&profile)?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger based on verbose flag
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    ensure_unprivileged()?;
    let config = cli.command.into_config()?;
    config.validate()?;

    // backing files get exactly the modes the kernel asks for
    umask(Permissions::empty());

    info!(
        "Starting hfs ({} mode, codec {})...",
        config.mode, config.codec.program
    );

    let manager = FilesystemManager::new(config);
    let workers = Handle::current();
    tokio::task::spawn_blocking(move || manager.mount(workers)).await??;

    info!("Shutdown complete");
    Ok(())
}
