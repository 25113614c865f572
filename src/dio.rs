//! Digital input/output on SmartIo channels.

use crate::consts;
use crate::error::Result;
use crate::hal::Hal;
use crate::handle::{DigitalHandle, HandleKind};
use crate::smartio::SmartIoMode;
use log::{debug, trace};

/// Direction of a digital channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DioDirection {
    Input,
    Output,
}

impl Hal {
    /// True if `channel` is a valid DIO channel.
    pub fn check_dio_channel(channel: i32) -> bool {
        (0..consts::NUM_SMART_IO as i32).contains(&channel)
    }

    /// Allocates `channel` as a digital input (`input == true`) or output.
    ///
    /// `origin` identifies the caller and is reported if someone else later
    /// tries to take the same pin.
    pub fn initialize_dio_port(&self, channel: i32, input: bool, origin: &str) -> Result<DigitalHandle> {
        let mode = if input {
            SmartIoMode::DigitalInput
        } else {
            SmartIoMode::DigitalOutput
        };
        self.allocate_smart_io(channel, HandleKind::Dio, "DIO", mode, origin)
            .map(DigitalHandle)
    }

    /// Frees a DIO handle. Stale or invalid handles are ignored.
    pub fn free_dio_port(&self, handle: DigitalHandle) {
        self.free_smart_io(handle.0, HandleKind::Dio);
    }

    /// Drives a digital output.
    pub fn set_dio(&self, handle: DigitalHandle, value: bool) -> Result<()> {
        self.smart_io(handle.0, HandleKind::Dio)?
            .set_digital_output(value)
    }

    /// Reads the level of a digital channel.
    pub fn get_dio(&self, handle: DigitalHandle) -> Result<bool> {
        let value = self
            .smart_io(handle.0, HandleKind::Dio)?
            .get_digital_input()?;
        trace!("DIO 0x{:08X} reads {}", handle.0.raw(), value);
        Ok(value)
    }

    /// Switches a digital channel between input and output.
    pub fn set_dio_direction(&self, handle: DigitalHandle, direction: DioDirection) -> Result<()> {
        debug!("Setting DIO 0x{:08X} to {:?}", handle.0.raw(), direction);
        self.smart_io(handle.0, HandleKind::Dio)?
            .switch_dio_direction(direction == DioDirection::Input)
    }

    /// Returns the direction of a digital channel.
    pub fn get_dio_direction(&self, handle: DigitalHandle) -> Result<DioDirection> {
        Ok(
            match self.smart_io(handle.0, HandleKind::Dio)?.mode() {
                SmartIoMode::DigitalOutput => DioDirection::Output,
                _ => DioDirection::Input,
            },
        )
    }

    /// Channel index behind a DIO handle.
    pub fn get_dio_channel(&self, handle: DigitalHandle) -> Result<u8> {
        Ok(self.smart_io(handle.0, HandleKind::Dio)?.channel())
    }
}
