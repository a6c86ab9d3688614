//! MIDI to OPL3 serial bridge daemon.
//!
//! Connects a MIDI input (system port or virtual) to an OPL3 chip hanging
//! off a serial link, translating every MIDI event into register writes
//! through the `opl3-bridge` core. Runs until interrupted.

mod args;
mod bridge;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;

use args::Args;
use bridge::Bridge;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if args.list_midi {
        return bridge::list_midi_ports();
    }
    if args.list_serial {
        return bridge::list_serial_ports();
    }

    let bridge = Bridge::start(&args)?;
    info!("running in {:?} mode, press Ctrl+C to stop", args.mode);

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    bridge.shutdown();
    Ok(())
}
