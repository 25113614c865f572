//! Fixed-size, type-checked handle registries with reference-counted teardown.
//!
//! A registry owns an array of slots. Allocation hands out a [`Handle`] bound to a
//! freshly constructed port; [`HandleRegistry::get`] resolves a handle back to a
//! [`PortRef`], a counted reference that keeps the port alive while in use.
//! [`HandleRegistry::free`] unpublishes the slot at once and then waits, on a
//! condition variable rather than by polling, until every outstanding `PortRef`
//! has been dropped before the slot may be allocated again.

use crate::error::{Error, Result};
use crate::handle::{Handle, HandleKind};
use log::{debug, trace, warn};
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A port plus the count of live [`PortRef`]s pointing at it.
#[derive(Debug)]
struct Tracked<T> {
    port: T,
    refs: Mutex<usize>,
    released: Condvar,
}

/// A counted reference to an allocated port.
///
/// Dropping the last reference wakes any `free` waiting on the port.
#[derive(Debug)]
pub struct PortRef<T> {
    inner: Arc<Tracked<T>>,
}

impl<T> PortRef<T> {
    fn acquire(inner: &Arc<Tracked<T>>) -> PortRef<T> {
        *lock(&inner.refs) += 1;
        PortRef {
            inner: Arc::clone(inner),
        }
    }
}

impl<T> Clone for PortRef<T> {
    fn clone(&self) -> Self {
        PortRef::acquire(&self.inner)
    }
}

impl<T> Deref for PortRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.port
    }
}

impl<T> Drop for PortRef<T> {
    fn drop(&mut self) {
        let mut refs = lock(&self.inner.refs);
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            self.inner.released.notify_all();
        }
    }
}

#[derive(Debug)]
struct Entry<T> {
    kind: HandleKind,
    version: u8,
    previous_allocation: String,
    port: Arc<Tracked<T>>,
}

#[derive(Debug)]
enum Slot<T> {
    Free { next_version: u8 },
    Live(Entry<T>),
    Freeing { next_version: u8 },
}

/// Registry of `N` slots indexed by channel (or by first-free position for
/// unindexed pools such as interrupts and DMA engines).
///
/// Overlapping peripheral types (DIO, PWM, analog input... on the same SmartIo
/// pin) share one registry, so a slot held by any kind blocks all others.
#[derive(Debug)]
pub struct HandleRegistry<T> {
    resource: &'static str,
    slots: Mutex<Vec<Slot<T>>>,
    free_timeout: Duration,
}

// Poisoning only happens if a panic unwound while a registry lock was held; the
// slot table is still structurally valid, so keep going.
fn lock<U>(mutex: &Mutex<U>) -> MutexGuard<'_, U> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn bump(version: u8) -> u8 {
    version.checked_add(1).unwrap_or(1)
}

impl<T> HandleRegistry<T> {
    /// Creates a registry with `size` slots.
    pub fn new(resource: &'static str, size: usize, free_timeout: Duration) -> Self {
        let slots = (0..size).map(|_| Slot::Free { next_version: 1 }).collect();
        HandleRegistry {
            resource,
            slots: Mutex::new(slots),
            free_timeout,
        }
    }

    /// Allocates slot `channel` for `kind`, building the port with `make`.
    ///
    /// `resource` names the requested peripheral in error messages; `origin` is
    /// recorded and reported to whoever later collides with this allocation.
    pub fn allocate(
        &self,
        channel: i32,
        kind: HandleKind,
        resource: &'static str,
        origin: &str,
        make: impl FnOnce(u8) -> T,
    ) -> Result<(Handle, PortRef<T>)> {
        let mut slots = lock(&self.slots);
        let max = slots.len() as i32 - 1;
        if channel < 0 || channel > max {
            return Err(Error::ResourceOutOfRange {
                resource,
                channel,
                min: 0,
                max,
            });
        }
        let index = channel as usize;
        let version = match &slots[index] {
            Slot::Free { next_version } => *next_version,
            Slot::Live(entry) => {
                debug!(
                    "{} {} requested but held as {:?}",
                    resource, channel, entry.kind
                );
                return Err(Error::ResourceIsAllocated {
                    resource,
                    channel,
                    previous_allocation: entry.previous_allocation.clone(),
                });
            }
            Slot::Freeing { .. } => {
                return Err(Error::ResourceIsAllocated {
                    resource,
                    channel,
                    previous_allocation: "(being freed)".to_string(),
                });
            }
        };
        Ok(self.fill(&mut slots, index, kind, version, origin, make))
    }

    /// Allocates the first free slot for `kind`.
    pub fn allocate_next(
        &self,
        kind: HandleKind,
        origin: &str,
        make: impl FnOnce(u8) -> T,
    ) -> Result<(Handle, PortRef<T>)> {
        let mut slots = lock(&self.slots);
        let found = slots.iter().enumerate().find_map(|(index, slot)| match slot {
            Slot::Free { next_version } => Some((index, *next_version)),
            _ => None,
        });
        match found {
            Some((index, version)) => Ok(self.fill(&mut slots, index, kind, version, origin, make)),
            None => Err(Error::NoAvailableResources {
                resource: self.resource,
            }),
        }
    }

    fn fill(
        &self,
        slots: &mut [Slot<T>],
        index: usize,
        kind: HandleKind,
        version: u8,
        origin: &str,
        make: impl FnOnce(u8) -> T,
    ) -> (Handle, PortRef<T>) {
        let tracked = Arc::new(Tracked {
            port: make(index as u8),
            refs: Mutex::new(0),
            released: Condvar::new(),
        });
        let port = PortRef::acquire(&tracked);
        slots[index] = Slot::Live(Entry {
            kind,
            version,
            previous_allocation: origin.to_string(),
            port: tracked,
        });
        let handle = Handle::new(index as u16, kind, version);
        debug!(
            "Allocated {} slot {} as {:?} (handle 0x{:08X})",
            self.resource,
            index,
            kind,
            handle.raw()
        );
        (handle, port)
    }

    /// Resolves `handle`, returning `None` if it is freed, stale or of another kind.
    pub fn get(&self, handle: Handle, kind: HandleKind) -> Option<PortRef<T>> {
        if handle.kind() != kind {
            trace!(
                "Handle 0x{:08X} is {:?}, expected {:?}",
                handle.raw(),
                handle.kind(),
                kind
            );
            return None;
        }
        let slots = lock(&self.slots);
        match slots.get(handle.index() as usize) {
            Some(Slot::Live(entry)) if entry.kind == kind && entry.version == handle.version() => {
                Some(PortRef::acquire(&entry.port))
            }
            _ => None,
        }
    }

    /// Frees `handle`. Freeing a stale, mismatched or invalid handle is a no-op.
    ///
    /// Returns `true` if a port was released.
    pub fn free(&self, handle: Handle, kind: HandleKind) -> bool {
        self.free_with(handle, kind, |_| {})
    }

    /// Frees `handle`, running `teardown` on the port once no other reference
    /// remains (or the free timeout expired) and before the slot is reusable.
    pub fn free_with(&self, handle: Handle, kind: HandleKind, teardown: impl FnOnce(&T)) -> bool {
        if handle.kind() != kind {
            return false;
        }
        let index = handle.index() as usize;
        let tracked = {
            let mut slots = lock(&self.slots);
            let matches = matches!(
                slots.get(index),
                Some(Slot::Live(entry)) if entry.kind == kind && entry.version == handle.version()
            );
            if !matches {
                trace!(
                    "Ignoring free of stale {} handle 0x{:08X}",
                    self.resource,
                    handle.raw()
                );
                return false;
            }
            let next_version = bump(handle.version());
            match std::mem::replace(&mut slots[index], Slot::Freeing { next_version }) {
                Slot::Live(entry) => entry.port,
                _ => return false,
            }
        };

        // Wait for no other thread to hold this port.
        {
            let refs = lock(&tracked.refs);
            let (refs, timeout) = tracked
                .released
                .wait_timeout_while(refs, self.free_timeout, |refs| *refs > 0)
                .unwrap_or_else(PoisonError::into_inner);
            if timeout.timed_out() {
                warn!(
                    "{} handle free timeout: {} reference(s) still held after {:?}",
                    self.resource, *refs, self.free_timeout
                );
            }
        }

        teardown(&tracked.port);

        let mut slots = lock(&self.slots);
        slots[index] = Slot::Free {
            next_version: bump(handle.version()),
        };
        debug!("Freed {} slot {}", self.resource, index);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn registry(size: usize) -> HandleRegistry<u8> {
        HandleRegistry::new("Test", size, Duration::from_millis(200))
    }

    #[test]
    fn test_allocate_and_get() {
        let reg = registry(4);
        let (handle, port) = reg.allocate(2, HandleKind::Dio, "DIO", "here", |ch| ch).unwrap();
        assert_eq!(*port, 2);
        assert_eq!(handle.index(), 2);
        assert_eq!(handle.kind(), HandleKind::Dio);
        assert_eq!(*reg.get(handle, HandleKind::Dio).unwrap(), 2);
        assert!(reg.get(handle, HandleKind::Pwm).is_none());
    }

    #[test]
    fn test_out_of_range_has_no_side_effect() {
        let reg = registry(4);
        for channel in [-1, 4, 100] {
            match reg.allocate(channel, HandleKind::Dio, "DIO", "x", |ch| ch) {
                Err(Error::ResourceOutOfRange {
                    channel: c, min, max, ..
                }) => {
                    assert_eq!(c, channel);
                    assert_eq!((min, max), (0, 3));
                }
                other => panic!("Expected ResourceOutOfRange, got {:?}", other),
            }
        }
        assert!((0..4).all(|ch| reg.allocate(ch, HandleKind::Dio, "DIO", "y", |c| c).is_ok()));
    }

    #[test]
    fn test_conflict_reports_previous_owner_across_kinds() {
        let reg = registry(4);
        reg.allocate(1, HandleKind::Dio, "DIO", "drive.rs:12", |ch| ch).unwrap();
        let err = reg
            .allocate(1, HandleKind::Pwm, "PWM", "arm.rs:40", |ch| ch)
            .unwrap_err();
        match &err {
            Error::ResourceIsAllocated {
                resource,
                channel,
                previous_allocation,
            } => {
                assert_eq!(*resource, "PWM");
                assert_eq!(*channel, 1);
                assert_eq!(previous_allocation, "drive.rs:12");
            }
            other => panic!("Expected ResourceIsAllocated, got {:?}", other),
        }
        assert!(err.to_string().contains("drive.rs:12"));
    }

    #[test]
    fn test_free_is_idempotent_and_versioned() {
        let reg = registry(2);
        let (first, port) = reg.allocate(0, HandleKind::Dio, "DIO", "a", |ch| ch).unwrap();
        drop(port);
        assert!(reg.free(first, HandleKind::Dio));
        assert!(!reg.free(first, HandleKind::Dio));
        assert!(!reg.free(Handle::INVALID, HandleKind::Dio));

        let (second, _port) = reg.allocate(0, HandleKind::Dio, "DIO", "b", |ch| ch).unwrap();
        assert_ne!(first, second);
        // The stale handle neither resolves nor frees the new port.
        assert!(reg.get(first, HandleKind::Dio).is_none());
        assert!(!reg.free(first, HandleKind::Dio));
        assert!(reg.get(second, HandleKind::Dio).is_some());
    }

    #[test]
    fn test_allocate_next_exhausts_pool() {
        let reg = registry(2);
        let (a, _pa) = reg.allocate_next(HandleKind::Interrupt, "", |i| i).unwrap();
        let (b, _pb) = reg.allocate_next(HandleKind::Interrupt, "", |i| i).unwrap();
        assert_ne!(a.index(), b.index());
        assert!(matches!(
            reg.allocate_next(HandleKind::Interrupt, "", |i| i),
            Err(Error::NoAvailableResources { .. })
        ));
    }

    #[test]
    fn test_free_waits_for_outstanding_reference() {
        let reg = Arc::new(HandleRegistry::<u8>::new("Test", 1, Duration::from_secs(2)));
        let (handle, port) = reg.allocate(0, HandleKind::Dio, "DIO", "a", |ch| ch).unwrap();
        drop(port);
        let held = reg.get(handle, HandleKind::Dio).unwrap();

        let start = Instant::now();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(held);
        });
        assert!(reg.free(handle, HandleKind::Dio));
        let waited = start.elapsed();
        releaser.join().unwrap();

        assert!(waited >= Duration::from_millis(40), "free returned after {:?}", waited);
        assert!(waited < Duration::from_secs(2), "free hit the timeout ({:?})", waited);
        assert!(reg.allocate(0, HandleKind::Dio, "DIO", "b", |ch| ch).is_ok());
    }

    #[test]
    fn test_free_times_out_with_leaked_reference() {
        let reg = registry(1);
        let (handle, port) = reg.allocate(0, HandleKind::Dio, "DIO", "a", |ch| ch).unwrap();
        let start = Instant::now();
        assert!(reg.free(handle, HandleKind::Dio));
        assert!(start.elapsed() >= Duration::from_millis(200));
        drop(port);
        assert!(reg.allocate(0, HandleKind::Dio, "DIO", "b", |ch| ch).is_ok());
    }
}
