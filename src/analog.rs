//! Analog input channels.

use crate::consts;
use crate::error::Result;
use crate::hal::Hal;
use crate::handle::{AnalogInputHandle, HandleKind};
use crate::smartio::SmartIoMode;

impl Hal {
    /// Allocates `channel` as an analog input.
    pub fn initialize_analog_input_port(&self, channel: i32, origin: &str) -> Result<AnalogInputHandle> {
        self.allocate_smart_io(
            channel,
            HandleKind::AnalogInput,
            "Analog Input",
            SmartIoMode::AnalogInput,
            origin,
        )
        .map(AnalogInputHandle)
    }

    /// Frees an analog input handle.
    pub fn free_analog_input_port(&self, handle: AnalogInputHandle) {
        self.free_smart_io(handle.0, HandleKind::AnalogInput);
    }

    /// Raw 12-bit reading.
    pub fn get_analog_value(&self, handle: AnalogInputHandle) -> Result<i32> {
        self.smart_io(handle.0, HandleKind::AnalogInput)?
            .get_analog_input()
    }

    /// Reading converted to volts.
    pub fn get_analog_voltage(&self, handle: AnalogInputHandle) -> Result<f64> {
        Ok(raw_to_volts(self.get_analog_value(handle)?))
    }
}

/// Converts a raw reading to volts, clamping to the converter's range.
pub fn raw_to_volts(raw: i32) -> f64 {
    let raw = (raw as i64).clamp(0, consts::analog::MAX_RAW);
    raw as f64 * consts::analog::FULL_SCALE_VOLTS / consts::analog::MAX_RAW as f64
}
