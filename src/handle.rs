//! Opaque integer handles and their typed wrappers.

use crate::consts::handle::{INDEX_MASK, KIND_SHIFT, VERSION_MASK, VERSION_SHIFT};

/// Resource type encoded in the top byte of a [`Handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleKind {
    Undefined = 0,
    Dio = 1,
    Pwm = 2,
    DutyCycle = 3,
    AnalogInput = 4,
    Counter = 5,
    AddressableLed = 6,
    Relay = 7,
    Interrupt = 8,
    Dma = 9,
}

impl HandleKind {
    fn from_raw(raw: u8) -> HandleKind {
        match raw {
            1 => HandleKind::Dio,
            2 => HandleKind::Pwm,
            3 => HandleKind::DutyCycle,
            4 => HandleKind::AnalogInput,
            5 => HandleKind::Counter,
            6 => HandleKind::AddressableLed,
            7 => HandleKind::Relay,
            8 => HandleKind::Interrupt,
            9 => HandleKind::Dma,
            _ => HandleKind::Undefined,
        }
    }
}

/// An opaque resource handle: `[kind:8][version:8][index:16]`.
///
/// `Handle::INVALID` (0) never refers to a resource. The version byte changes on
/// every allocation of a slot, so a stale handle never resolves to a newer port
/// that happens to live at the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(i32);

impl Handle {
    /// The invalid handle.
    pub const INVALID: Handle = Handle(0);

    pub(crate) fn new(index: u16, kind: HandleKind, version: u8) -> Handle {
        Handle(
            ((kind as i32) << KIND_SHIFT)
                | (((version as i32) & VERSION_MASK) << VERSION_SHIFT)
                | (index as i32 & INDEX_MASK),
        )
    }

    /// Reconstructs a handle from its raw integer form.
    pub fn from_raw(raw: i32) -> Handle {
        Handle(raw)
    }

    /// Returns the raw integer form.
    #[inline]
    pub fn raw(&self) -> i32 {
        self.0
    }

    /// Returns the resource kind encoded in the handle.
    #[inline]
    pub fn kind(&self) -> HandleKind {
        HandleKind::from_raw(((self.0 as u32) >> KIND_SHIFT) as u8)
    }

    /// Returns the allocation version encoded in the handle.
    #[inline]
    pub fn version(&self) -> u8 {
        ((self.0 >> VERSION_SHIFT) & VERSION_MASK) as u8
    }

    /// Returns the slot index encoded in the handle.
    #[inline]
    pub fn index(&self) -> u16 {
        (self.0 & INDEX_MASK) as u16
    }

    /// True unless this is [`Handle::INVALID`] or carries no kind.
    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != Handle::INVALID && self.kind() != HandleKind::Undefined
    }
}

macro_rules! typed_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub(crate) Handle);

        impl $name {
            /// Returns the untyped handle.
            #[inline]
            pub fn handle(&self) -> Handle {
                self.0
            }

            /// True if the handle was returned by a successful allocation.
            #[inline]
            pub fn is_valid(&self) -> bool {
                self.0.is_valid()
            }
        }

        impl From<$name> for Handle {
            fn from(typed: $name) -> Handle {
                typed.0
            }
        }
    };
}

typed_handle!(
    /// Handle to a SmartIo channel in digital input or output mode.
    DigitalHandle
);
typed_handle!(
    /// Handle to a SmartIo channel in PWM output mode.
    PwmHandle
);
typed_handle!(
    /// Handle to a SmartIo channel in PWM input (duty cycle) mode.
    DutyCycleHandle
);
typed_handle!(
    /// Handle to a SmartIo channel in analog input mode.
    AnalogInputHandle
);
typed_handle!(
    /// Handle to a SmartIo channel in one of the single counter modes.
    CounterHandle
);
typed_handle!(
    /// Handle to a SmartIo channel driving an addressable LED strip.
    AddressableLedHandle
);
typed_handle!(
    /// Handle to one half (forward or reverse) of a relay.
    RelayHandle
);
typed_handle!(
    /// Handle to an interrupt slot.
    InterruptHandle
);
typed_handle!(
    /// Handle to a DMA engine.
    DmaHandle
);
