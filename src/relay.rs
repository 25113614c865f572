//! Relay outputs. Each relay header has a forward and a reverse half, allocated
//! separately and published on `/relay/n/fwd` and `/relay/n/rev`.

use crate::consts::{self, topic};
use crate::error::{handle_error, Error, Result};
use crate::hal::Hal;
use crate::handle::{HandleKind, RelayHandle};
use crate::transport::Publisher;
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};

/// One half of a relay header.
#[derive(Debug)]
pub(crate) struct RelayPort {
    channel: u8,
    forward: bool,
    publisher: Publisher<bool>,
    value: AtomicBool,
}

impl RelayPort {
    fn set(&self, on: bool) {
        self.value.store(on, Ordering::SeqCst);
        self.publisher.set(on);
    }
}

fn half_name(forward: bool) -> &'static str {
    if forward {
        "Relay forward"
    } else {
        "Relay reverse"
    }
}

fn slot(channel: i32, forward: bool) -> i32 {
    channel * 2 + if forward { 0 } else { 1 }
}

impl Hal {
    /// True if `channel` names a relay header.
    pub fn check_relay_channel(channel: i32) -> bool {
        (0..consts::NUM_RELAY_HEADERS as i32).contains(&channel)
    }

    /// Allocates the forward or reverse half of relay `channel`, initially off.
    pub fn initialize_relay_port(&self, channel: i32, forward: bool, origin: &str) -> Result<RelayHandle> {
        if !Hal::check_relay_channel(channel) {
            return Err(Error::ResourceOutOfRange {
                resource: "Relay",
                channel,
                min: 0,
                max: consts::NUM_RELAY_HEADERS as i32 - 1,
            });
        }
        let store = self.store();
        let options = self.config().pubsub;
        let (handle, port) = self.relays.allocate(
            slot(channel, forward),
            HandleKind::Relay,
            "Relay",
            origin,
            |_| RelayPort {
                channel: channel as u8,
                forward,
                publisher: store.publish(&topic::relay(channel as u8, forward), options),
                value: AtomicBool::new(false),
            },
        )
        .map_err(|e| match e {
            Error::ResourceIsAllocated {
                previous_allocation, ..
            } => Error::ResourceIsAllocated {
                resource: half_name(forward),
                channel,
                previous_allocation,
            },
            other => other,
        })?;
        port.set(false);
        debug!(
            "Relay {} {} ready",
            channel,
            if forward { "forward" } else { "reverse" }
        );
        Ok(RelayHandle(handle))
    }

    /// Turns the relay half off and frees it.
    pub fn free_relay_port(&self, handle: RelayHandle) {
        self.relays
            .free_with(handle.0, HandleKind::Relay, |port| port.set(false));
    }

    /// Switches the relay half on or off.
    pub fn set_relay(&self, handle: RelayHandle, on: bool) -> Result<()> {
        let port = self
            .relays
            .get(handle.0, HandleKind::Relay)
            .ok_or_else(|| handle_error(handle))?;
        trace!(
            "Relay {} {} <- {}",
            port.channel,
            if port.forward { "fwd" } else { "rev" },
            on
        );
        port.set(on);
        Ok(())
    }

    /// Last commanded state of the relay half.
    pub fn get_relay(&self, handle: RelayHandle) -> Result<bool> {
        self.relays
            .get(handle.0, HandleKind::Relay)
            .map(|port| port.value.load(Ordering::SeqCst))
            .ok_or_else(|| handle_error(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Value;

    #[test]
    fn test_halves_allocate_independently() {
        let hal = Hal::default();
        let fwd = hal.initialize_relay_port(1, true, "fwd").unwrap();
        let rev = hal.initialize_relay_port(1, false, "rev").unwrap();
        assert_ne!(fwd.handle(), rev.handle());
        assert!(matches!(
            hal.initialize_relay_port(1, true, "again"),
            Err(Error::ResourceIsAllocated { .. })
        ));

        hal.set_relay(fwd, true).unwrap();
        assert!(hal.get_relay(fwd).unwrap());
        assert!(!hal.get_relay(rev).unwrap());
        assert_eq!(
            hal.store().get_value("/relay/1/fwd").map(|v| v.value),
            Some(Value::Boolean(true))
        );

        hal.free_relay_port(fwd);
        assert_eq!(
            hal.store().get_value("/relay/1/fwd").map(|v| v.value),
            Some(Value::Boolean(false))
        );
        assert!(hal.set_relay(fwd, true).is_err());
    }

    #[test]
    fn test_conflict_names_relay_header() {
        let hal = Hal::default();
        hal.initialize_relay_port(1, true, "arm.rs:12").unwrap();
        hal.initialize_relay_port(1, false, "arm.rs:13").unwrap();
        match hal.initialize_relay_port(1, true, "claw.rs:4") {
            Err(Error::ResourceIsAllocated {
                resource,
                channel,
                previous_allocation,
            }) => {
                assert_eq!(channel, 1);
                assert_eq!(resource, "Relay forward");
                assert_eq!(previous_allocation, "arm.rs:12");
            }
            other => panic!("Expected ResourceIsAllocated, got {:?}", other),
        }
        match hal.initialize_relay_port(1, false, "claw.rs:5") {
            Err(Error::ResourceIsAllocated { resource, channel, .. }) => {
                assert_eq!((resource, channel), ("Relay reverse", 1));
            }
            other => panic!("Expected ResourceIsAllocated, got {:?}", other),
        }
    }

    #[test]
    fn test_relay_range() {
        let hal = Hal::default();
        for channel in [-1, consts::NUM_RELAY_HEADERS as i32] {
            assert!(matches!(
                hal.initialize_relay_port(channel, true, "x"),
                Err(Error::ResourceOutOfRange { resource: "Relay", .. })
            ));
        }
    }
}
