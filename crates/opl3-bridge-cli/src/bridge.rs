//! Transport wiring and the flusher loop.
//!
//! Owns the serial port, the MIDI connections and the translation stack.
//! The stack sits behind one mutex shared by two parties: the MIDI input
//! callback (pushed by the transport at arbitrary rate) and the flusher
//! thread, which drains the hardware buffer to the wire once a
//! millisecond. Teardown closes the receiver first, then stops the
//! flusher, then drops the stack, which closes the serial port.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use midir::os::unix::{VirtualInput, VirtualOutput};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;

use opl3_bridge::{
    DirectMode, HardwareBuffer, MidiRouter, RoutingMode, ShadowState, VoiceAllocator,
};

use crate::args::{Args, MidiSource, Mode};

/// The chip-side firmware expects 9600 8-N-1, no flow control.
const BAUD_RATE: u32 = 9600;

/// Register writes reach the wire within a millisecond of being queued.
const FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Client name shown to the MIDI system.
const CLIENT_NAME: &str = "opl3-bridge";

/// A running bridge: transports connected, flusher ticking.
pub struct Bridge {
    router: Arc<Mutex<MidiRouter>>,
    midi_in: Option<MidiInputConnection<()>>,
    flusher: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl Bridge {
    /// Open the transports, build the translation stack and start the
    /// flusher thread.
    pub fn start(args: &Args) -> Result<Self> {
        let serial_path = args
            .serial
            .as_deref()
            .context("--serial is required (use --list-serial to enumerate ports)")?;

        let port = serialport::new(serial_path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .with_context(|| format!("opening serial port {serial_path}"))?;
        info!("serial port {serial_path} open at {BAUD_RATE} baud");

        // Stack, bottom-up: sink, buffer, shadow, direct mode, allocator
        let hw = HardwareBuffer::new(Box::new(port));
        let direct = DirectMode::new(ShadowState::new(hw), args.device_id);
        let mut allocator = VoiceAllocator::new(direct, args.device_id);

        // SysEx query responses go back out over MIDI
        let midi_out = open_midi_output(&args.midi)?;
        let midi_out = Arc::new(Mutex::new(midi_out));
        allocator
            .direct_mut()
            .set_midi_output(response_sink(Arc::clone(&midi_out)));
        allocator.set_midi_output(response_sink(midi_out));

        let mut router = MidiRouter::new(allocator);
        router.set_mode(match args.mode {
            Mode::Direct => RoutingMode::Direct,
            Mode::Bank => RoutingMode::Bank,
        });
        if router.mode() == RoutingMode::Direct {
            router.allocator_mut().direct_mut().init();
            router.flush().context("priming the chip")?;
        }
        let router = Arc::new(Mutex::new(router));

        let midi_in = connect_midi_input(&args.midi, Arc::clone(&router))?;

        let running = Arc::new(AtomicBool::new(true));
        let flusher = {
            let router = Arc::clone(&router);
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                while running.load(Ordering::Relaxed) {
                    std::thread::sleep(FLUSH_INTERVAL);
                    if let Err(e) = router.lock().flush() {
                        warn!("serial flush failed: {e}");
                    }
                }
            })
        };

        Ok(Self {
            router,
            midi_in: Some(midi_in),
            flusher: Some(flusher),
            running,
        })
    }

    /// Stop the bridge: receiver first so no callback can queue new
    /// writes, then the flusher; dropping the stack closes the serial
    /// port.
    pub fn shutdown(mut self) {
        if let Some(conn) = self.midi_in.take() {
            conn.close();
        }
        self.running.store(false, Ordering::Relaxed);
        if let Some(flusher) = self.flusher.take() {
            flusher
                .join()
                .expect("flusher thread panicked during shutdown");
        }
        // Whatever accumulated after the last flush is discarded with
        // the close, not half-sent
        self.router
            .lock()
            .allocator_mut()
            .direct_mut()
            .shadow_mut()
            .hardware_mut()
            .reset();
    }
}

/// Sink closure delivering SysEx responses to the MIDI output.
fn response_sink(
    conn: Arc<Mutex<MidiOutputConnection>>,
) -> Box<dyn FnMut(&[u8]) + Send> {
    Box::new(move |msg: &[u8]| {
        if let Err(e) = conn.lock().send(msg) {
            warn!("MIDI response dropped: {e}");
        }
    })
}

fn open_midi_output(source: &MidiSource) -> Result<MidiOutputConnection> {
    let midi_out =
        MidiOutput::new(CLIENT_NAME).map_err(|e| anyhow!("initialising MIDI output: {e}"))?;

    match source {
        MidiSource::Virtual => midi_out
            .create_virtual("opl3-bridge out")
            .map_err(|e| anyhow!("creating virtual MIDI output: {e}")),
        MidiSource::Port(n) => {
            let ports = midi_out.ports();
            match ports.get(*n) {
                Some(port) => midi_out
                    .connect(port, "opl3-bridge out")
                    .map_err(|e| anyhow!("connecting MIDI output port {n}: {e}")),
                // No matching output port: fall back to a virtual one so
                // query responses still have somewhere to go
                None => midi_out
                    .create_virtual("opl3-bridge out")
                    .map_err(|e| anyhow!("creating virtual MIDI output: {e}")),
            }
        }
    }
}

fn connect_midi_input(
    source: &MidiSource,
    router: Arc<Mutex<MidiRouter>>,
) -> Result<MidiInputConnection<()>> {
    let mut midi_in =
        MidiInput::new(CLIENT_NAME).map_err(|e| anyhow!("initialising MIDI input: {e}"))?;
    // SysEx must come through; timing and active sense stay filtered
    midi_in.ignore(Ignore::TimeAndActiveSense);

    let callback = move |_stamp: u64, message: &[u8], _: &mut ()| {
        if !router.lock().process(message) {
            debug!("bank mode: dropped {} byte MIDI message", message.len());
        }
    };

    match source {
        MidiSource::Virtual => {
            let conn = midi_in
                .create_virtual("opl3-bridge in", callback, ())
                .map_err(|e| anyhow!("creating virtual MIDI input: {e}"))?;
            info!("virtual MIDI input port open");
            Ok(conn)
        }
        MidiSource::Port(n) => {
            let ports = midi_in.ports();
            let port = ports
                .get(*n)
                .with_context(|| format!("MIDI input port {n} does not exist (use --list-midi)"))?;
            let name = midi_in.port_name(port).unwrap_or_default();
            let conn = midi_in
                .connect(port, "opl3-bridge in", callback, ())
                .map_err(|e| anyhow!("connecting MIDI input port {n}: {e}"))?;
            info!("MIDI input connected to '{name}'");
            Ok(conn)
        }
    }
}

/// Print the system's MIDI input ports.
pub fn list_midi_ports() -> Result<()> {
    let midi_in =
        MidiInput::new(CLIENT_NAME).map_err(|e| anyhow!("initialising MIDI input: {e}"))?;
    let ports = midi_in.ports();

    println!("Available MIDI input ports:");
    if ports.is_empty() {
        println!("  (none)");
    }
    for (i, port) in ports.iter().enumerate() {
        let name = midi_in
            .port_name(port)
            .unwrap_or_else(|_| "(unknown)".into());
        println!("  {i}: {name}");
    }
    Ok(())
}

/// Print the system's serial ports.
pub fn list_serial_ports() -> Result<()> {
    let ports = serialport::available_ports().context("enumerating serial ports")?;

    println!("Available serial ports:");
    if ports.is_empty() {
        println!("  (none)");
    }
    for port in ports {
        println!("  {}", port.port_name);
    }
    Ok(())
}
