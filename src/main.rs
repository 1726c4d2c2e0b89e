use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use sndbridge::commands;

#[derive(Parser)]
#[command(name = "sndbridge")]
#[command(
    author,
    version,
    about = "Bridge PCM audio between a host audio graph and raw ALSA or UAC gadget devices"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Bridge a device to the default system audio device
    Run(commands::run::RunArgs),
    /// Open a device, print its negotiated configuration, and close it
    Probe(commands::probe::ProbeArgs),
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    if cli.no_color {
        std::env::set_var("NO_COLOR", "1");
    }

    match cli.command {
        Some(Commands::Run(args)) => commands::run::execute(args),
        Some(Commands::Probe(args)) => commands::probe::execute(args),
        None => commands::run::execute(commands::run::RunArgs {
            device: "default".to_string(),
            direction: commands::run::Direction::Capture,
            block_size: 128,
            muted: false,
            no_stats: false,
        }),
    }
}
