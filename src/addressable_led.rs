//! Addressable LED strips and the shared LED data buffer.
//!
//! All strips draw from one buffer of 1024 RGB entries published as a single raw
//! topic. A strip is a window `(start, length)` into that buffer; writing data
//! updates the buffer and republishes it whole.

use crate::consts::{self, topic};
use crate::error::{Error, Result};
use crate::hal::Hal;
use crate::handle::{AddressableLedHandle, HandleKind};
use crate::smartio::SmartIoMode;
use crate::transport::{PubSubOptions, Publisher, ValueStore};
use log::{debug, trace};
use std::sync::{Mutex, PoisonError};

/// One LED's colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedData {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl LedData {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        LedData { r, g, b }
    }
}

/// The shared buffer behind every strip.
#[derive(Debug)]
pub(crate) struct LedBuffer {
    data: Mutex<Vec<u8>>,
    publisher: Publisher<Vec<u8>>,
}

impl LedBuffer {
    pub(crate) fn new(store: &ValueStore, options: PubSubOptions) -> Self {
        LedBuffer {
            data: Mutex::new(vec![
                0;
                consts::led::MAX_LENGTH as usize * consts::led::BYTES_PER_LED
            ]),
            publisher: store.publish(topic::LED_DATA, options),
        }
    }

    fn write(&self, start: i32, leds: &[LedData]) -> Result<()> {
        check_data_range(start, leds.len())?;
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let offset = start as usize * consts::led::BYTES_PER_LED;
        for (chunk, led) in data[offset..]
            .chunks_exact_mut(consts::led::BYTES_PER_LED)
            .zip(leds)
        {
            chunk.copy_from_slice(&[led.r, led.g, led.b]);
        }
        trace!("LED buffer: {} entries written at {}", leds.len(), start);
        // Publish under the lock so concurrent writers are seen in order.
        self.publisher.set(data.clone());
        Ok(())
    }

    fn read(&self, start: i32, length: usize) -> Result<Vec<LedData>> {
        check_data_range(start, length)?;
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let offset = start as usize * consts::led::BYTES_PER_LED;
        Ok(data[offset..]
            .chunks_exact(consts::led::BYTES_PER_LED)
            .take(length)
            .map(|c| LedData::new(c[0], c[1], c[2]))
            .collect())
    }
}

fn check_data_range(start: i32, length: usize) -> Result<()> {
    let max = consts::led::MAX_LENGTH;
    if start < 0 || start >= max {
        return Err(Error::ParameterOutOfRange(format!(
            "LED data start must be 0-{} (got {})",
            max - 1,
            start
        )));
    }
    if length > (max - start) as usize {
        return Err(Error::ParameterOutOfRange(format!(
            "{} LEDs at {} overrun the buffer of {}",
            length, start, max
        )));
    }
    Ok(())
}

impl Hal {
    /// Allocates `channel` as an addressable LED output with an empty window at 0.
    pub fn initialize_addressable_led(&self, channel: i32, origin: &str) -> Result<AddressableLedHandle> {
        self.allocate_smart_io(
            channel,
            HandleKind::AddressableLed,
            "AddressableLED",
            SmartIoMode::AddressableLed,
            origin,
        )
        .map(AddressableLedHandle)
    }

    /// Frees an LED handle, waiting for other threads still using it.
    pub fn free_addressable_led(&self, handle: AddressableLedHandle) {
        self.free_smart_io(handle.0, HandleKind::AddressableLed);
    }

    /// Moves the strip's window to `start`.
    pub fn set_addressable_led_start(&self, handle: AddressableLedHandle, start: i32) -> Result<()> {
        debug!("LED 0x{:08X} start {}", handle.0.raw(), start);
        self.smart_io(handle.0, HandleKind::AddressableLed)?
            .set_led_start(start)
    }

    /// Sets the number of LEDs in the strip.
    pub fn set_addressable_led_length(&self, handle: AddressableLedHandle, length: i32) -> Result<()> {
        debug!("LED 0x{:08X} length {}", handle.0.raw(), length);
        self.smart_io(handle.0, HandleKind::AddressableLed)?
            .set_led_length(length)
    }

    /// Returns the strip's `(start, length)` window.
    pub fn get_addressable_led_range(&self, handle: AddressableLedHandle) -> Result<(i32, i32)> {
        self.smart_io(handle.0, HandleKind::AddressableLed)?
            .get_led_range()
    }

    /// Writes `data` into the shared buffer at `start` and republishes it.
    pub fn set_addressable_led_data(&self, start: i32, data: &[LedData]) -> Result<()> {
        self.led_buffer.write(start, data)
    }

    /// Reads `length` entries of the shared buffer starting at `start`.
    pub fn get_addressable_led_data(&self, start: i32, length: usize) -> Result<Vec<LedData>> {
        self.led_buffer.read(start, length)
    }
}
