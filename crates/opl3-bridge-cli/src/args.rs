//! Command-line argument parsing for the bridge daemon.

use clap::{Parser, ValueEnum};

/// How incoming MIDI is routed to the chip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Translate MIDI directly into OPL3 register writes.
    Direct,
    /// Leave playback to an external FM sequencer (messages are dropped
    /// by this build).
    Bank,
}

/// MIDI input source: a system port by index, or a virtual port other
/// applications can connect to.
#[derive(Clone, Debug)]
pub enum MidiSource {
    /// Open the numbered system MIDI input port.
    Port(usize),
    /// Create a virtual input port.
    Virtual,
}

fn parse_midi_source(value: &str) -> Result<MidiSource, String> {
    if value.eq_ignore_ascii_case("virtual") {
        return Ok(MidiSource::Virtual);
    }
    value
        .parse()
        .map(MidiSource::Port)
        .map_err(|_| format!("expected a port number or 'virtual', got '{value}'"))
}

fn parse_device_id(value: &str) -> Result<u8, String> {
    let id: u8 = value
        .parse()
        .map_err(|_| format!("invalid device id '{value}'"))?;
    if id > 0x7F {
        return Err(format!("device id {id} out of range 0-127"));
    }
    Ok(id)
}

/// MIDI to OPL3 serial bridge daemon.
#[derive(Debug, Parser)]
#[command(name = "opl3-bridge", version)]
pub struct Args {
    /// Serial port device (e.g. /dev/ttyUSB0)
    #[arg(short, long)]
    pub serial: Option<String>,

    /// MIDI input port number, or "virtual"
    #[arg(short, long, default_value = "virtual", value_parser = parse_midi_source)]
    pub midi: MidiSource,

    /// Routing mode
    #[arg(short = 'M', long, value_enum, default_value_t = Mode::Direct)]
    pub mode: Mode,

    /// SysEx device id filter (0-127; 127 accepts everything)
    #[arg(short, long, default_value_t = 0x7F, value_parser = parse_device_id)]
    pub device_id: u8,

    /// List available MIDI input ports and exit
    #[arg(long)]
    pub list_midi: bool,

    /// List available serial ports and exit
    #[arg(long)]
    pub list_serial: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midi_source_parsing() {
        assert!(matches!(parse_midi_source("virtual"), Ok(MidiSource::Virtual)));
        assert!(matches!(parse_midi_source("3"), Ok(MidiSource::Port(3))));
        assert!(parse_midi_source("nope").is_err());
    }

    #[test]
    fn test_device_id_range() {
        assert_eq!(parse_device_id("0"), Ok(0));
        assert_eq!(parse_device_id("127"), Ok(0x7F));
        assert!(parse_device_id("128").is_err());
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["opl3-bridge", "--serial", "/dev/ttyUSB0"]);
        assert!(matches!(args.midi, MidiSource::Virtual));
        assert_eq!(args.mode, Mode::Direct);
        assert_eq!(args.device_id, 0x7F);
    }
}
