//! # smartio-hal
//!
//! Handle-based allocation of SmartIo channels, a per-channel mode state
//! machine, and interrupt/DMA timing measurement, all running over an
//! in-process publish/subscribe transport that stands in for the controller's
//! registers.
//!
//! Every SmartIo channel is a small set of topics (`/io/<n>/type`, `valset`,
//! `valget`, ...). The HAL publishes commands and reads back what the firmware
//! reports. In tests and simulation the firmware is a [`SimBackplane`], which
//! also models the cross-connect wiring harness.
//!
//! ## Features
//!
//! *   Explicit process context ([`Hal`]) owning every registry, the transport
//!     and the FPGA clock. Drop it (or build a new one) to reset all state.
//! *   Typed handles (`DigitalHandle`, `PwmHandle`, ...) packed as
//!     `[kind:8][version:8][index:16]`; stale handles never address a newer port.
//! *   Exclusive allocation shared across every SmartIo mode: a pin held as DIO
//!     cannot also be taken as PWM, analog input, counter or LED. Conflicts report
//!     the origin string recorded by the current owner.
//! *   Reference-counted teardown: `free` unpublishes the handle at once, then
//!     waits on a condition variable for in-flight users to finish.
//! *   Channel modes:
//!     *   Digital input/output with direction switching (`initialize_dio_port`, `set_dio`, `get_dio`).
//!     *   PWM output with clamped pulse width and 1x/2x/4x periods (`initialize_pwm_port`).
//!     *   PWM input measuring high time and period (`initialize_duty_cycle`).
//!     *   Analog input (`initialize_analog_input_port`, `get_analog_voltage`).
//!     *   Single-edge counters (`initialize_counter`).
//!     *   Addressable LED strips over one shared 1024-entry buffer.
//! *   Relay outputs with separately allocated forward/reverse halves.
//! *   Edge interrupts with hardware timestamps and DMA capture of digital sources.
//! *   [`timing::PwmTimingHarness`] validating PWM width and period via an
//!     interrupt collector thread or a DMA capture.
//! *   C-style status codes and a per-thread last-error message via [`status::call`].
//!
//! ## Basic Usage
//!
//! ```
//! use smartio_hal::{Hal, HalConfig, Result, SimBackplane};
//!
//! fn main() -> Result<()> {
//!     // Optional: Initialize logging
//!     // env_logger::init();
//!
//!     let hal = Hal::new(HalConfig::default());
//!     // Firmware stand-in wired like the cross-connect harness (DIO 0 <-> DIO 8, ...).
//!     let _backplane = SimBackplane::new(&hal);
//!
//!     let output = hal.initialize_dio_port(8, false, "main.rs:12")?;
//!     let input = hal.initialize_dio_port(0, true, "main.rs:13")?;
//!
//!     hal.set_dio(output, true)?;
//!     assert!(hal.get_dio(input)?);
//!
//!     // The pin is taken; the error names the owner.
//!     let err = hal.initialize_pwm_port(8, "arm.rs:40").unwrap_err();
//!     assert!(err.to_string().contains("main.rs:12"));
//!
//!     hal.free_dio_port(output);
//!     hal.free_dio_port(input);
//!     Ok(())
//! }
//! ```
//!
//! ## Timing Trials
//!
//! ```no_run
//! use smartio_hal::{fixture, timing::PwmTimingHarness, Hal, Result, SimBackplane};
//!
//! fn main() -> Result<()> {
//!     let hal = Hal::default();
//!     let _backplane = SimBackplane::new(&hal);
//!     let (pwm_channel, input_channel) = fixture::PWM_CROSS_CONNECTS[0];
//!     let pwm = hal.initialize_pwm_port(pwm_channel as i32, "timing")?;
//!     let input = hal.initialize_dio_port(input_channel as i32, true, "timing")?;
//!
//!     let harness = PwmTimingHarness::new(&hal, pwm, input);
//!     for period in fixture::PWM_TIMING_PERIODS {
//!         for width in fixture::PWM_TIMING_WIDTHS_US {
//!             let report = harness.run_interrupt_trial(width, period)?;
//!             println!("{:?}: widths {:?}", period, report.widths_us);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Channel Layout
//!
//! *   SmartIo channels 0-31 host every DIO/PWM/analog/counter/LED mode.
//! *   Relay headers 0-3, each with a forward and a reverse half.
//! *   8 interrupt slots and 2 DMA engines, allocated first-free.

mod consts;
mod error;
mod hal;
mod registry;

pub mod addressable_led;
pub mod analog;
pub mod clock;
pub mod counter;
pub mod dio;
pub mod dma;
pub mod fixture;
pub mod handle;
pub mod interrupt;
pub mod pwm;
pub mod relay;
pub mod sim;
pub mod smartio;
pub mod status;
pub mod timing;
pub mod transport;

pub use addressable_led::LedData;
pub use counter::CounterEdge;
pub use dio::DioDirection;
pub use dma::{DmaReadStatus, DmaSample};
pub use error::{Error, Result};
pub use hal::{Hal, HalConfig};
pub use handle::{
    AddressableLedHandle, AnalogInputHandle, CounterHandle, DigitalHandle, DmaHandle,
    DutyCycleHandle, Handle, HandleKind, InterruptHandle, PwmHandle, RelayHandle,
};
pub use interrupt::WaitResult;
pub use sim::SimBackplane;
pub use smartio::{PwmOutputPeriod, SmartIoMode};
pub use timing::{PwmTimingHarness, TimingConfig, TrialReport};
pub use transport::{PubSubOptions, ValueStore};
// Re-export only essential public constants
pub use consts::led::MAX_LENGTH as LED_MAX_LENGTH;
pub use consts::{NUM_DMA, NUM_INTERRUPTS, NUM_RELAY_HEADERS, NUM_SMART_IO};
