mod config;
mod daemon;
mod error;
mod evdev_util;
mod hub;
mod input;
mod keys;
mod layout;
mod poll;
mod proc;
mod settings;
mod state;
mod udev;
mod usb;

use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tartarusd")]
#[command(author = "tartarusd contributors")]
#[command(version)]
#[command(about = "Per-program key remapping and backlight control for the Razer Tartarus", long_about = None)]
struct Cli {
    /// Config directory (default: ~/.config/tartarusd)
    #[arg(short, long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Print the parsed config and exit
    #[arg(long)]
    dump_config: bool,

    /// Install a udev rule giving GROUP access to the keypad, then exit
    #[arg(long, value_name = "GROUP", num_args = 0..=1, default_missing_value = udev::DEFAULT_GROUP)]
    authorize: Option<String>,

    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "tartarusd=info",
        1 => "tartarusd=debug",
        _ => "tartarusd=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(group) = cli.authorize {
        let path = udev::authorize(&group, Path::new(udev::RULES_PATH))?;
        println!("wrote {}; replug the keypad or run `udevadm trigger`", path.display());
        return Ok(());
    }

    let dir = settings::config_dir(cli.config_dir.as_deref());

    if cli.dump_config {
        let config = settings::load(&dir)?;
        print!("{}", config.dump());
        return Ok(());
    }

    if let Err(e) = daemon::run(dir) {
        error!("{e:#}");
        return Err(e);
    }
    Ok(())
}
