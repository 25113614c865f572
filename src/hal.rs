//! The process context: configuration, transport, clock and every registry.

use crate::addressable_led::LedBuffer;
use crate::clock::FpgaClock;
use crate::consts;
use crate::dma::Dma;
use crate::error::{handle_error, Result};
use crate::handle::{Handle, HandleKind};
use crate::interrupt::Interrupt;
use crate::registry::{HandleRegistry, PortRef};
use crate::relay::RelayPort;
use crate::smartio::{SmartIo, SmartIoMode};
use crate::transport::{PubSubOptions, ValueStore};
use log::{debug, info};
use std::time::Duration;

/// Configuration for a [`Hal`] instance.
#[derive(Debug, Clone, PartialEq)]
pub struct HalConfig {
    /// How long `free` waits for other threads to drop their port references.
    pub free_timeout: Duration,
    /// Options for every SmartIo publisher and subscriber.
    pub pubsub: PubSubOptions,
    /// Unread updates kept per subscriber.
    pub subscriber_queue_depth: usize,
}

impl Default for HalConfig {
    fn default() -> Self {
        HalConfig {
            free_timeout: consts::DEFAULT_FREE_TIMEOUT,
            pubsub: PubSubOptions::all_updates(),
            subscriber_queue_depth: consts::DEFAULT_SUBSCRIBER_QUEUE_DEPTH,
        }
    }
}

impl HalConfig {
    /// Same as default but with a short free timeout, for tests that
    /// deliberately leak a reference.
    pub fn fast_teardown() -> Self {
        HalConfig {
            free_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }
}

/// Owns all SmartIo state for one process (or one test).
///
/// Construct one at startup and share it by reference; dropping it releases
/// everything, so each test can start from a clean slate.
#[derive(Debug)]
pub struct Hal {
    config: HalConfig,
    clock: FpgaClock,
    store: ValueStore,
    pub(crate) smart_io: HandleRegistry<SmartIo>,
    pub(crate) relays: HandleRegistry<RelayPort>,
    pub(crate) interrupts: HandleRegistry<Interrupt>,
    pub(crate) dma: HandleRegistry<Dma>,
    pub(crate) led_buffer: LedBuffer,
}

impl Hal {
    /// Creates a context with its own transport and clock.
    pub fn new(config: HalConfig) -> Self {
        let clock = FpgaClock::new();
        let store = ValueStore::new(clock, config.subscriber_queue_depth);
        info!(
            "Initializing HAL: {} SmartIo channels, {} relays, free timeout {:?}",
            consts::NUM_SMART_IO,
            consts::NUM_RELAY_HEADERS,
            config.free_timeout
        );
        Hal {
            smart_io: HandleRegistry::new("SmartIo", consts::NUM_SMART_IO, config.free_timeout),
            relays: HandleRegistry::new(
                "Relay",
                consts::NUM_RELAY_HEADERS * 2,
                config.free_timeout,
            ),
            interrupts: HandleRegistry::new(
                "Interrupt",
                consts::NUM_INTERRUPTS,
                config.free_timeout,
            ),
            dma: HandleRegistry::new("DMA", consts::NUM_DMA, config.free_timeout),
            led_buffer: LedBuffer::new(&store, config.pubsub),
            config,
            clock,
            store,
        }
    }

    /// The configuration this context was built with.
    pub fn config(&self) -> &HalConfig {
        &self.config
    }

    /// The shared key/value transport.
    pub fn store(&self) -> &ValueStore {
        &self.store
    }

    /// The FPGA timestamp clock.
    pub fn clock(&self) -> FpgaClock {
        self.clock
    }

    /// Current FPGA time in microseconds.
    pub fn fpga_time_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// Allocates SmartIo `channel` as `kind` and places it into `mode`.
    pub(crate) fn allocate_smart_io(
        &self,
        channel: i32,
        kind: HandleKind,
        resource: &'static str,
        mode: SmartIoMode,
        origin: &str,
    ) -> Result<Handle> {
        let (handle, port) = self.smart_io.allocate(channel, kind, resource, origin, |ch| {
            SmartIo::new(ch, &self.store, self.config.pubsub)
        })?;
        if let Err(e) = port.initialize_mode(mode) {
            drop(port);
            self.smart_io.free(handle, kind);
            return Err(e);
        }
        debug!("{} {} ready ({:?})", resource, channel, mode);
        Ok(handle)
    }

    /// Resolves a SmartIo handle of `kind`.
    pub(crate) fn smart_io(&self, handle: Handle, kind: HandleKind) -> Result<PortRef<SmartIo>> {
        self.smart_io
            .get(handle, kind)
            .ok_or_else(|| handle_error(handle))
    }

    /// Frees a SmartIo handle, returning the channel to `Uninitialized`.
    pub(crate) fn free_smart_io(&self, handle: Handle, kind: HandleKind) {
        self.smart_io.free_with(handle, kind, SmartIo::reset);
    }
}

impl Default for Hal {
    fn default() -> Self {
        Hal::new(HalConfig::default())
    }
}
