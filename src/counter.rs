//! Single-edge counters on SmartIo channels.

use crate::error::Result;
use crate::hal::Hal;
use crate::handle::{CounterHandle, HandleKind};
use crate::smartio::SmartIoMode;

/// Which edge a counter counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterEdge {
    Rising,
    Falling,
}

impl Hal {
    /// Allocates `channel` as a counter of `edge` transitions.
    pub fn initialize_counter(&self, channel: i32, edge: CounterEdge, origin: &str) -> Result<CounterHandle> {
        let mode = match edge {
            CounterEdge::Rising => SmartIoMode::SingleCounterRising,
            CounterEdge::Falling => SmartIoMode::SingleCounterFalling,
        };
        self.allocate_smart_io(channel, HandleKind::Counter, "Counter", mode, origin)
            .map(CounterHandle)
    }

    /// Frees a counter handle.
    pub fn free_counter(&self, handle: CounterHandle) {
        self.free_smart_io(handle.0, HandleKind::Counter);
    }

    /// Edges counted since the counter was initialized.
    pub fn get_counter(&self, handle: CounterHandle) -> Result<i32> {
        self.smart_io(handle.0, HandleKind::Counter)?.get_counter()
    }
}
