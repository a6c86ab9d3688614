//! MIDI to OPL3 register translation for serial-attached FM hardware.
//!
//! This crate drives a physical OPL3 (YMF262) chip hanging off a serial
//! link. Incoming MIDI messages are translated deterministically into
//! register writes, buffered into command frames, and bit-packed into the
//! controller's wire framing. No audio is rendered in software; the chip
//! does the synthesis.
//!
//! # Layers
//!
//! - [`protocol`] packs raw command bytes into the chip-side serial framing
//! - [`HardwareBuffer`] accumulates register writes into command frames and
//!   flushes them to a byte sink
//! - [`ShadowState`] mirrors all 512 write-only OPL3 registers so bitfield
//!   operations can read-modify-write
//! - [`DirectMode`] maps MIDI channel-voice messages, an NRPN parameter
//!   tree, and a SysEx protocol onto OPL3 register semantics
//! - [`VoiceAllocator`] virtualises the 16 MIDI channels over the 18 OPL3
//!   channels with configurable pools, unison detuning, note stealing and
//!   percussion routing
//! - [`MidiRouter`] switches between direct translation and a bank-mode
//!   pass-through handled by the embedding application
//!
//! # Quick start
//!
//! ```
//! use opl3_bridge::{
//!     DirectMode, HardwareBuffer, MidiRouter, RoutingMode, ShadowState, VoiceAllocator,
//! };
//!
//! let hw = HardwareBuffer::new(Box::new(Vec::<u8>::new()));
//! let shadow = ShadowState::new(hw);
//! let direct = DirectMode::new(shadow, 0x7F);
//! let allocator = VoiceAllocator::new(direct, 0x7F);
//! let mut router = MidiRouter::new(allocator);
//! router.set_mode(RoutingMode::Direct);
//!
//! router.allocator_mut().direct_mut().init();
//! router.process(&[0x90, 60, 100]); // note on, middle C
//! router.flush().unwrap();
//! ```
//!
//! # Concurrency
//!
//! The stack is purely synchronous. Embedders share it between the MIDI
//! receive callback and a periodic flusher (1 kHz or faster) behind a
//! single mutex; see the `opl3-bridge-cli` crate for the reference wiring.

#![warn(missing_docs)]

mod allocator;
mod direct;
mod hardware;
pub mod protocol;
pub mod registers;
mod router;
mod shadow;

#[cfg(test)]
pub(crate) mod testing;

pub use allocator::{VoiceAllocator, VoiceConfig};
pub use direct::{
    CMD_BATCH_WRITE_7, CMD_BATCH_WRITE_8, CMD_HW_RESET, CMD_PATCH_DUMP, CMD_PATCH_LOAD,
    CMD_PERC_CONFIG, CMD_PERC_QUERY, CMD_REG_WRITE_7, CMD_REG_WRITE_8, CMD_RESET_ALL,
    CMD_VOICE_CONFIG, CMD_VOICE_QUERY, ChannelState, DirectMode, Drum, MANUFACTURER_ID,
    compute_attenuation,
};
pub use hardware::HardwareBuffer;
pub use router::{MidiRouter, RoutingMode};
pub use shadow::ShadowState;

/// Errors surfaced by the translation stack.
///
/// Nothing in the core panics at runtime; malformed MIDI input is dropped
/// silently and the only fallible operation is flushing to the byte sink.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    /// The byte sink refused a write.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else, carried as text.
    #[error("{0}")]
    Other(String),
}

impl From<String> for BridgeError {
    fn from(msg: String) -> Self {
        BridgeError::Other(msg)
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
