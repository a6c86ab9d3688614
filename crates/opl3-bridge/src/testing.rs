//! Shared helpers for the colocated test modules.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{DirectMode, HardwareBuffer, ShadowState, VoiceAllocator};

/// A byte sink that records everything written to it. Cloning shares the
/// underlying storage, so tests can keep a handle while the stack owns
/// the sink.
#[derive(Clone, Default)]
pub struct CaptureSink(Arc<Mutex<Vec<u8>>>);

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Captures MIDI output frames (SysEx responses) from the stack.
#[derive(Clone, Default)]
pub struct CaptureMidiOut(Arc<Mutex<Vec<Vec<u8>>>>);

impl CaptureMidiOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.0.lock().clone()
    }

    pub fn sink(&self) -> Box<dyn FnMut(&[u8]) + Send> {
        let inner = Arc::clone(&self.0);
        Box::new(move |msg: &[u8]| inner.lock().push(msg.to_vec()))
    }
}

/// An initialised [`DirectMode`] over a capturing sink.
pub fn direct_fixture() -> (DirectMode, CaptureSink) {
    let sink = CaptureSink::new();
    let hw = HardwareBuffer::new(Box::new(sink.clone()));
    let mut direct = DirectMode::new(ShadowState::new(hw), 0x7F);
    direct.init();
    (direct, sink)
}

/// An initialised [`VoiceAllocator`] over a capturing sink.
pub fn allocator_fixture() -> (VoiceAllocator, CaptureSink) {
    let (direct, sink) = direct_fixture();
    (VoiceAllocator::new(direct, 0x7F), sink)
}
