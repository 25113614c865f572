//! Edge interrupts on digital channels.
//!
//! An interrupt watches the `valget` topic of one digital channel. Every level
//! change becomes a rising or falling edge stamped with the update's timestamp,
//! which is the FPGA time the transition happened. Waiters block on a condition
//! variable until an edge of an enabled polarity arrives, the timeout expires, or
//! [`Hal::release_waiting_interrupt`] kicks them loose.

use crate::consts::topic;
use crate::error::{handle_error, Result};
use crate::hal::Hal;
use crate::handle::{DigitalHandle, HandleKind, InterruptHandle};
use crate::registry::PortRef;
use crate::transport::{ListenerId, Value};
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Outcome of [`Hal::wait_for_interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Timeout,
    RisingEdge,
    FallingEdge,
    Both,
}

impl WaitResult {
    pub const RISING_MASK: u32 = 0x1;
    pub const FALLING_MASK: u32 = 0x100;

    /// Bitmask form: rising `0x1`, falling `0x100`, both `0x101`.
    pub fn bits(self) -> u32 {
        match self {
            WaitResult::Timeout => 0,
            WaitResult::RisingEdge => Self::RISING_MASK,
            WaitResult::FallingEdge => Self::FALLING_MASK,
            WaitResult::Both => Self::RISING_MASK | Self::FALLING_MASK,
        }
    }

    pub fn is_rising(self) -> bool {
        self.bits() & Self::RISING_MASK != 0
    }

    pub fn is_falling(self) -> bool {
        self.bits() & Self::FALLING_MASK != 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    rising: bool,
    time_us: u64,
}

#[derive(Debug)]
struct InterruptState {
    source: Option<(u8, ListenerId)>,
    rising_enabled: bool,
    falling_enabled: bool,
    level: bool,
    pending: VecDeque<Edge>,
    last_rising_us: u64,
    last_falling_us: u64,
    released: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<InterruptState>,
    edges: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, InterruptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Called on the publishing thread for every update of the source's valget.
    fn on_level(&self, level: bool, time_us: u64) {
        let mut state = self.lock();
        if level == state.level {
            return;
        }
        state.level = level;
        let enabled = if level {
            state.rising_enabled
        } else {
            state.falling_enabled
        };
        if enabled {
            state.pending.push_back(Edge {
                rising: level,
                time_us,
            });
            self.edges.notify_all();
        }
    }
}

/// One interrupt slot.
#[derive(Debug)]
pub(crate) struct Interrupt {
    shared: Arc<Shared>,
}

impl Interrupt {
    fn new() -> Self {
        Interrupt {
            shared: Arc::new(Shared {
                state: Mutex::new(InterruptState {
                    source: None,
                    rising_enabled: true,
                    falling_enabled: false,
                    level: false,
                    pending: VecDeque::new(),
                    last_rising_us: 0,
                    last_falling_us: 0,
                    released: false,
                }),
                edges: Condvar::new(),
            }),
        }
    }
}

impl Hal {
    fn interrupt(&self, irq: InterruptHandle) -> Result<PortRef<Interrupt>> {
        self.interrupts
            .get(irq.0, HandleKind::Interrupt)
            .ok_or_else(|| handle_error(irq))
    }

    fn detach_interrupt_source(&self, interrupt: &Interrupt) {
        let source = interrupt.shared.lock().source.take();
        if let Some((channel, listener)) = source {
            self.store().remove_listener(listener);
            trace!("Interrupt detached from DIO {}", channel);
        }
    }

    /// Allocates an interrupt slot. It fires on rising edges until reconfigured.
    pub fn initialize_interrupts(&self) -> Result<InterruptHandle> {
        let (handle, _) =
            self.interrupts
                .allocate_next(HandleKind::Interrupt, "", |_| Interrupt::new())?;
        debug!("Interrupt {} allocated", handle.index());
        Ok(InterruptHandle(handle))
    }

    /// Attaches the interrupt to a digital channel, replacing any previous source.
    ///
    /// The channel's current level is the baseline; only later changes are edges.
    pub fn request_interrupts(&self, irq: InterruptHandle, source: &DigitalHandle) -> Result<()> {
        let interrupt = self.interrupt(irq)?;
        let channel = self.get_dio_channel(*source)?;
        self.detach_interrupt_source(&interrupt);

        let valget = topic::io(channel, topic::VALUE_GET);
        let level = matches!(
            self.store().get_value(&valget).map(|v| v.value),
            Some(Value::Integer(v)) if v != 0
        );
        {
            let mut state = interrupt.shared.lock();
            state.level = level;
            state.pending.clear();
        }
        let shared = Arc::clone(&interrupt.shared);
        let listener = self.store().add_listener(&valget, move |_, value, time_us| {
            if let Value::Integer(v) = value {
                shared.on_level(*v != 0, time_us);
            }
        });
        interrupt.shared.lock().source = Some((channel, listener));
        debug!(
            "Interrupt {} attached to DIO {} (level {})",
            irq.0.index(),
            channel,
            level
        );
        Ok(())
    }

    /// Selects which edges fire the interrupt.
    pub fn set_interrupt_up_source_edge(&self, irq: InterruptHandle, rising: bool, falling: bool) -> Result<()> {
        let interrupt = self.interrupt(irq)?;
        let mut state = interrupt.shared.lock();
        state.rising_enabled = rising;
        state.falling_enabled = falling;
        debug!(
            "Interrupt {} edges: rising={}, falling={}",
            irq.0.index(),
            rising,
            falling
        );
        Ok(())
    }

    /// Blocks until an enabled edge arrives or `timeout` expires.
    ///
    /// Edges that arrived before the call are reported first unless
    /// `ignore_previous` is set, in which case they are discarded. A falling edge
    /// stamped identically to the rising edge before it is reported together
    /// with it as [`WaitResult::Both`].
    pub fn wait_for_interrupt(
        &self,
        irq: InterruptHandle,
        timeout: Duration,
        ignore_previous: bool,
    ) -> Result<WaitResult> {
        let interrupt = self.interrupt(irq)?;
        let shared = &interrupt.shared;
        let mut state = shared.lock();
        if ignore_previous {
            state.pending.clear();
        }
        state.released = false;
        let (mut state, _) = shared
            .edges
            .wait_timeout_while(state, timeout, |s| s.pending.is_empty() && !s.released)
            .unwrap_or_else(PoisonError::into_inner);
        if state.released {
            state.released = false;
            return Ok(WaitResult::Timeout);
        }
        let Some(edge) = state.pending.pop_front() else {
            return Ok(WaitResult::Timeout);
        };
        let paired = state
            .pending
            .front()
            .is_some_and(|next| next.rising != edge.rising && next.time_us == edge.time_us);
        let mut result = record_edge(&mut state, edge);
        if paired {
            if let Some(next) = state.pending.pop_front() {
                record_edge(&mut state, next);
                result = WaitResult::Both;
            }
        }
        trace!("Interrupt {} -> {:?}", irq.0.index(), result);
        Ok(result)
    }

    /// Timestamp (FPGA microseconds) of the last reported rising edge.
    pub fn read_interrupt_rising_timestamp(&self, irq: InterruptHandle) -> Result<u64> {
        Ok(self.interrupt(irq)?.shared.lock().last_rising_us)
    }

    /// Timestamp (FPGA microseconds) of the last reported falling edge.
    pub fn read_interrupt_falling_timestamp(&self, irq: InterruptHandle) -> Result<u64> {
        Ok(self.interrupt(irq)?.shared.lock().last_falling_us)
    }

    /// Wakes a thread blocked in [`Hal::wait_for_interrupt`]; it returns `Timeout`.
    pub fn release_waiting_interrupt(&self, irq: InterruptHandle) -> Result<()> {
        let interrupt = self.interrupt(irq)?;
        interrupt.shared.lock().released = true;
        interrupt.shared.edges.notify_all();
        Ok(())
    }

    /// Detaches and frees the interrupt. Stale handles are ignored.
    pub fn clean_interrupts(&self, irq: InterruptHandle) {
        if let Ok(interrupt) = self.interrupt(irq) {
            self.detach_interrupt_source(&interrupt);
            interrupt.shared.lock().released = true;
            interrupt.shared.edges.notify_all();
        }
        if self.interrupts.free(irq.0, HandleKind::Interrupt) {
            debug!("Interrupt {} freed", irq.0.index());
        }
    }
}

fn record_edge(state: &mut InterruptState, edge: Edge) -> WaitResult {
    if edge.rising {
        state.last_rising_us = edge.time_us;
        WaitResult::RisingEdge
    } else {
        state.last_falling_us = edge.time_us;
        WaitResult::FallingEdge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transport::PubSubOptions;
    use std::thread;
    use std::time::Instant;

    // Stands in for the firmware reporting a pin level.
    fn drive(hal: &Hal, channel: u8, level: bool, time_us: u64) {
        hal.store()
            .publish::<i64>(&topic::io(channel, topic::VALUE_GET), PubSubOptions::all_updates())
            .set_at(level as i64, time_us);
    }

    #[test]
    fn test_wait_result_bits() {
        assert_eq!(WaitResult::Timeout.bits(), 0);
        assert_eq!(WaitResult::RisingEdge.bits(), 0x1);
        assert_eq!(WaitResult::FallingEdge.bits(), 0x100);
        assert_eq!(WaitResult::Both.bits(), 0x101);
        assert!(WaitResult::Both.is_rising() && WaitResult::Both.is_falling());
    }

    #[test]
    fn test_edges_and_timestamps() {
        let hal = Hal::default();
        let input = hal.initialize_dio_port(3, true, "test").unwrap();
        let irq = hal.initialize_interrupts().unwrap();
        hal.request_interrupts(irq, &input).unwrap();
        hal.set_interrupt_up_source_edge(irq, true, true).unwrap();

        drive(&hal, 3, true, 1_000);
        drive(&hal, 3, true, 1_100);
        drive(&hal, 3, false, 2_500);

        let wait = Duration::from_millis(10);
        assert_eq!(hal.wait_for_interrupt(irq, wait, false).unwrap(), WaitResult::RisingEdge);
        assert_eq!(hal.read_interrupt_rising_timestamp(irq).unwrap(), 1_000);
        assert_eq!(hal.wait_for_interrupt(irq, wait, false).unwrap(), WaitResult::FallingEdge);
        assert_eq!(hal.read_interrupt_falling_timestamp(irq).unwrap(), 2_500);
        assert_eq!(hal.wait_for_interrupt(irq, wait, false).unwrap(), WaitResult::Timeout);
        hal.clean_interrupts(irq);
    }

    #[test]
    fn test_ignore_previous_and_disabled_edges() {
        let hal = Hal::default();
        let input = hal.initialize_dio_port(5, true, "test").unwrap();
        let irq = hal.initialize_interrupts().unwrap();
        hal.request_interrupts(irq, &input).unwrap();

        drive(&hal, 5, true, 10);
        drive(&hal, 5, false, 20);
        let wait = Duration::from_millis(10);
        assert_eq!(hal.wait_for_interrupt(irq, wait, true).unwrap(), WaitResult::Timeout);

        // Rising only by default: the falling edge is never queued.
        drive(&hal, 5, true, 30);
        drive(&hal, 5, false, 40);
        assert_eq!(hal.wait_for_interrupt(irq, wait, false).unwrap(), WaitResult::RisingEdge);
        assert_eq!(hal.wait_for_interrupt(irq, wait, false).unwrap(), WaitResult::Timeout);
    }

    #[test]
    fn test_release_wakes_waiter() {
        let hal = Hal::default();
        let input = hal.initialize_dio_port(0, true, "test").unwrap();
        let irq = hal.initialize_interrupts().unwrap();
        hal.request_interrupts(irq, &input).unwrap();

        let start = Instant::now();
        let result = thread::scope(|s| {
            let waiter = s.spawn(|| hal.wait_for_interrupt(irq, Duration::from_secs(10), true));
            // A release that lands before the waiter parks is cleared on entry.
            while !waiter.is_finished() {
                hal.release_waiting_interrupt(irq).unwrap();
                thread::sleep(Duration::from_millis(20));
            }
            waiter.join().unwrap()
        });
        assert_eq!(result.unwrap(), WaitResult::Timeout);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_pool_exhaustion_and_clean() {
        let hal = Hal::default();
        let irqs: Vec<_> = (0..crate::consts::NUM_INTERRUPTS)
            .map(|_| hal.initialize_interrupts().unwrap())
            .collect();
        assert!(matches!(
            hal.initialize_interrupts(),
            Err(Error::NoAvailableResources { .. })
        ));
        hal.clean_interrupts(irqs[2]);
        hal.clean_interrupts(irqs[2]);
        assert!(matches!(
            hal.wait_for_interrupt(irqs[2], Duration::ZERO, false),
            Err(Error::HandleError { .. })
        ));
        assert!(hal.initialize_interrupts().is_ok());
    }
}
