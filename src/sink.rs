//! Output sink: the write-only half of the core's contract.
//!
//! `emit` always writes a key edge immediately followed by a synchronization
//! marker, so downstream consumers observe a coalesced transactional edge.
//! The sink never inspects or remembers state; all de-duplication happens
//! in `core::Engine`.

use anyhow::Result;

/// Value half of a `(code, value)` edge. `0` = up, `1` = down, `2` =
/// held-repeat, matching the raw evdev convention the core consumes.
pub type KeyValue = u8;

/// Accepts synthetic edges from the core and forwards them to a virtual
/// output device (or, in tests, records them for assertion).
///
/// Any failure to write is fatal: implementations should return `Err`
/// and let the caller abort rather than attempt to continue with a
/// half-written transaction.
pub trait OutputSink {
    /// Emits a single `(code, value)` key edge followed by a sync marker.
    fn emit(&mut self, code: u16, value: KeyValue) -> Result<()>;
}

/// An `OutputSink` that records every emitted edge, for use in tests that
/// assert on the exact sequence the engine produces.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub edges: Vec<(u16, KeyValue)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputSink for RecordingSink {
    fn emit(&mut self, code: u16, value: KeyValue) -> Result<()> {
        self.edges.push((code, value));
        Ok(())
    }
}
