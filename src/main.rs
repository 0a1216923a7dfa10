//! Binary entry point: logging, settings, signal handling and the shell
//! loop. Protocol replies go to stdout; all logging goes to stderr.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;

use js110_daq::config::Settings;
use js110_daq::shell::{self, Shell};

#[derive(Parser, Debug)]
#[command(name = "js110-daq")]
#[command(about = "Joulescope JS110 energy trace driver", version)]
struct Args {
    /// Path to a TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Level from RUST_LOG, defaulting to info; env_logger writes to stderr
    // so the stdout line protocol stays clean.
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LevelFilter::Info);
    env_logger::Builder::new().filter_level(level).init();

    let settings = Settings::load(args.config.as_deref())?;
    log::info!("settings loaded: {settings:?}");

    println!("Joulescope JS110 energy trace driver");
    println!("Version : {}", env!("CARGO_PKG_VERSION"));

    let shell = Arc::new(Mutex::new(Shell::new(settings)));

    // INT/TERM take the same path as `exit`, once.
    let signal_shell = shell.clone();
    let signal_seen = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler(move || {
        if signal_seen.swap(true, Ordering::SeqCst) {
            return;
        }
        println!("e-[Caught signal]");
        signal_shell
            .lock()
            .expect("shell poisoned")
            .shutdown();
        println!("m-exit");
        std::process::exit(0);
    })?;

    let code = shell::run(&shell);
    std::process::exit(code);
}
