//! Register write buffering and wire flushing.
//!
//! Register writes are not sent to the chip one at a time. They collect in
//! a command frame that a periodic flusher drains to the byte sink, so a
//! burst of writes from a single MIDI message travels as one packed frame.

use std::io::Write;

use crate::Result;
use crate::protocol;

/// Command frame header: begin command, SPI target select = OPL3.
const FRAME_HEADER: [u8; 2] = [0x42, 0x12];

/// Latch and strobe opcodes for the six-byte register write sequence.
const LATCH_ADDR: [u8; 2] = [0xE1, 0xE5];
const LATCH_DATA: [u8; 2] = [0xE3, 0xE7];
const STROBE: u8 = 0xFB;

/// Accumulates OPL3 register writes into command frames and flushes them
/// to a byte sink as packed serial frames.
///
/// The sink is the only dynamic-dispatch seam in the stack; anything
/// implementing [`std::io::Write`] works, from a serial port handle to a
/// `Vec<u8>` in tests. Callers are expected to serialise access
/// externally (one mutex around the whole translation stack).
pub struct HardwareBuffer {
    sink: Box<dyn Write + Send>,
    buf: Vec<u8>,
}

impl HardwareBuffer {
    /// Create a buffer over a byte sink, primed with the frame header.
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        let mut hw = Self {
            sink,
            buf: Vec::with_capacity(512),
        };
        hw.reset();
        hw
    }

    /// Discard queued writes and start a fresh command frame.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.buf.extend_from_slice(&FRAME_HEADER);
    }

    /// Queue one register write. Bit 8 of `addr` selects port 1.
    pub fn queue(&mut self, addr: u16, data: u8) {
        let port = usize::from(addr & 0x100 != 0);
        self.buf.push(LATCH_ADDR[port]);
        self.buf.push((addr & 0xFF) as u8);
        self.buf.push(LATCH_DATA[port]);
        self.buf.push(data);
        self.buf.push(STROBE);
        self.buf.push(data);
    }

    /// Number of register writes queued in the current frame.
    pub fn pending_writes(&self) -> usize {
        (self.buf.len() - FRAME_HEADER.len()) / 6
    }

    /// Pack the current frame, write it to the sink, and start a fresh
    /// frame.
    ///
    /// A frame holding only the header is reset without touching the
    /// wire; at flusher rates an idle stream of header frames would
    /// saturate a 9600 baud link. A sink error is returned to the caller,
    /// and the frame is still reset: shadow state was already updated at
    /// queue time and must not diverge from the retry stream.
    pub fn flush(&mut self) -> Result<()> {
        if self.buf.len() > FRAME_HEADER.len() {
            let packed = protocol::serial_pack(&self.buf);
            self.reset();
            self.sink.write_all(&packed)?;
        } else {
            self.reset();
        }
        Ok(())
    }
}

impl std::fmt::Debug for HardwareBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareBuffer")
            .field("pending_writes", &self.pending_writes())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CaptureSink;

    #[test]
    fn test_new_buffer_holds_header_only() {
        let hw = HardwareBuffer::new(Box::new(Vec::<u8>::new()));
        assert_eq!(hw.pending_writes(), 0);
        assert_eq!(hw.buf, FRAME_HEADER);
    }

    #[test]
    fn test_queue_port0_write() {
        let mut hw = HardwareBuffer::new(Box::new(Vec::<u8>::new()));
        hw.queue(0x0A0, 0x57);
        assert_eq!(&hw.buf[2..], &[0xE1, 0xA0, 0xE3, 0x57, 0xFB, 0x57]);
    }

    #[test]
    fn test_queue_port1_write() {
        let mut hw = HardwareBuffer::new(Box::new(Vec::<u8>::new()));
        hw.queue(0x1B3, 0x20);
        assert_eq!(&hw.buf[2..], &[0xE5, 0xB3, 0xE7, 0x20, 0xFB, 0x20]);
    }

    #[test]
    fn test_flush_resets_to_header() {
        let mut hw = HardwareBuffer::new(Box::new(Vec::<u8>::new()));
        hw.queue(0x040, 0x3F);
        hw.queue(0x140, 0x3F);
        assert_eq!(hw.pending_writes(), 2);
        hw.flush().unwrap();
        assert_eq!(hw.pending_writes(), 0);
        assert_eq!(hw.buf, FRAME_HEADER);
    }

    #[test]
    fn test_flush_writes_packed_frame() {
        let sink = CaptureSink::new();
        let mut hw = HardwareBuffer::new(Box::new(sink.clone()));
        hw.queue(0x0B0, 0x31);
        hw.flush().unwrap();

        let expected =
            protocol::serial_pack(&[0x42, 0x12, 0xE1, 0xB0, 0xE3, 0x31, 0xFB, 0x31]);
        assert_eq!(sink.bytes(), expected);
    }

    #[test]
    fn test_idle_flush_writes_nothing() {
        let sink = CaptureSink::new();
        let mut hw = HardwareBuffer::new(Box::new(sink.clone()));
        hw.flush().unwrap();
        hw.flush().unwrap();
        assert!(sink.bytes().is_empty());
        assert_eq!(hw.buf, FRAME_HEADER);
    }
}
