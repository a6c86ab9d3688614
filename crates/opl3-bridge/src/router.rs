//! Bank/direct routing switch.
//!
//! The bridge can either translate MIDI itself (direct mode) or leave
//! playback to an external FM sequencer driving the same hardware buffer
//! (bank mode). The router owns the whole translation stack top-down:
//! router, allocator, direct mode, shadow, hardware buffer, byte sink.

use crate::{Result, VoiceAllocator};

/// Which path handles incoming MIDI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    /// An external FM sequencer handles everything; [`MidiRouter::process`]
    /// reports messages as unhandled.
    #[default]
    Bank,
    /// The translation stack handles MIDI itself.
    Direct,
}

/// Routes incoming MIDI messages to the direct translation stack or back
/// to the caller.
pub struct MidiRouter {
    mode: RoutingMode,
    allocator: VoiceAllocator,
}

impl MidiRouter {
    /// Create a router over an allocator, starting in bank mode.
    pub fn new(allocator: VoiceAllocator) -> Self {
        Self {
            mode: RoutingMode::Bank,
            allocator,
        }
    }

    /// Switch between bank and direct routing.
    pub fn set_mode(&mut self, mode: RoutingMode) {
        self.mode = mode;
    }

    /// The active routing mode.
    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// Process one complete MIDI message.
    ///
    /// Returns `true` when the message was consumed by the translation
    /// stack; `false` means the caller should forward it to its bank-mode
    /// player.
    pub fn process(&mut self, msg: &[u8]) -> bool {
        if self.mode == RoutingMode::Bank || msg.is_empty() {
            return false;
        }
        self.allocator.process(msg);
        true
    }

    /// The voice allocator, e.g. for programmatic voice configuration.
    pub fn allocator(&self) -> &VoiceAllocator {
        &self.allocator
    }

    /// Mutable access to the voice allocator.
    pub fn allocator_mut(&mut self) -> &mut VoiceAllocator {
        &mut self.allocator
    }

    /// Flush queued register writes to the byte sink.
    pub fn flush(&mut self) -> Result<()> {
        self.allocator
            .direct_mut()
            .shadow_mut()
            .hardware_mut()
            .flush()
    }
}

impl std::fmt::Debug for MidiRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiRouter")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{KEY_ON_BIT, REG_OP_LEVEL, operator_reg};
    use crate::testing::{CaptureSink, allocator_fixture};
    use crate::{CMD_RESET_ALL, DirectMode, HardwareBuffer, ShadowState};

    fn router_fixture() -> (MidiRouter, CaptureSink) {
        let (allocator, sink) = allocator_fixture();
        let mut router = MidiRouter::new(allocator);
        router.set_mode(RoutingMode::Direct);
        (router, sink)
    }

    #[test]
    fn test_bank_mode_reports_unhandled() {
        let (allocator, _) = allocator_fixture();
        let mut router = MidiRouter::new(allocator);
        assert_eq!(router.mode(), RoutingMode::Bank);
        assert!(!router.process(&[0x90, 60, 100]));
        // Nothing reached the chip
        assert!(!key_on(&router, 0));
    }

    #[test]
    fn test_direct_mode_consumes_messages() {
        let (mut router, _) = router_fixture();
        assert!(router.process(&[0x90, 60, 100]));
        assert!(key_on(&router, 0));
    }

    #[test]
    fn test_empty_message_is_unhandled() {
        let (mut router, _) = router_fixture();
        assert!(!router.process(&[]));
    }

    #[test]
    fn test_mode_switch_takes_effect_immediately() {
        let (mut router, _) = router_fixture();
        router.set_mode(RoutingMode::Bank);
        assert!(!router.process(&[0x90, 60, 100]));
        router.set_mode(RoutingMode::Direct);
        assert!(router.process(&[0x90, 60, 100]));
    }

    fn key_on(router: &MidiRouter, opl3_ch: u8) -> bool {
        let b0 = router
            .allocator()
            .direct()
            .shadow()
            .read(crate::registers::channel_reg(opl3_ch, 0xB0));
        b0 & KEY_ON_BIT != 0
    }

    /// Reset followed by a single note, checked end to end against the
    /// shadow registers.
    #[test]
    fn test_reset_then_single_note() {
        let (mut router, _) = router_fixture();
        assert!(router.process(&[0xF0, 0x7D, 0x7F, CMD_RESET_ALL, 0xF7]));
        assert!(router.process(&[0x90, 0x3C, 0x64])); // note 60, velocity 100

        let shadow = router.allocator().direct().shadow();
        // Note 60 is f_num 690 (0x2B2), block 3, key-on set
        assert_eq!(shadow.read(0x0A0), 0xB2);
        assert_eq!(shadow.read(0x0B0), 0x2E);
        // Carrier level: attenuation(100, 127) = 3 plus (127-100)/2 = 13
        assert_eq!(shadow.read(operator_reg(0, 1, REG_OP_LEVEL)) & 0x3F, 16);
    }

    /// After a flush, the hardware buffer holds exactly the frame header
    /// again and the sink saw a packed frame.
    #[test]
    fn test_flush_drains_buffer_to_sink() {
        let (mut router, sink) = router_fixture();
        router.process(&[0x90, 60, 100]);
        router.flush().unwrap();

        let bytes = sink.bytes();
        assert!(!bytes.is_empty());
        assert_eq!(bytes[0], 0x00);
        assert_eq!(*bytes.last().unwrap(), 0x02);

        // A second flush with nothing queued stays off the wire
        let len = bytes.len();
        router.flush().unwrap();
        assert_eq!(sink.bytes().len(), len);
    }

    #[test]
    fn test_stack_construction_bottom_up() {
        // The documented ownership chain: sink, buffer, shadow, direct,
        // allocator, router.
        let hw = HardwareBuffer::new(Box::new(CaptureSink::new()));
        let shadow = ShadowState::new(hw);
        let direct = DirectMode::new(shadow, 0x10);
        let allocator = crate::VoiceAllocator::new(direct, 0x10);
        let mut router = MidiRouter::new(allocator);
        router.set_mode(RoutingMode::Direct);
        router.allocator_mut().direct_mut().init();
        assert!(router.process(&[0x90, 69, 127]));
        assert!(key_on(&router, 0));
    }
}
