//! PWM (Pulse Width Modulation) output and PWM input (duty cycle) channels.

use crate::consts;
use crate::error::Result;
use crate::hal::Hal;
use crate::handle::{DutyCycleHandle, HandleKind, PwmHandle};
use crate::smartio::{PwmOutputPeriod, SmartIoMode};
use log::{debug, trace};

impl Hal {
    // --- PWM Output ---
    /// True if `channel` can host a PWM output.
    pub fn check_pwm_channel(channel: i32) -> bool {
        Hal::check_dio_channel(channel)
    }

    /// Allocates `channel` as a PWM output. The output starts disabled (0 us)
    /// at the 1x period.
    ///
    /// PWM shares its pin with DIO: allocating a channel already held as DIO
    /// (or anything else) fails with `ResourceIsAllocated`.
    pub fn initialize_pwm_port(&self, channel: i32, origin: &str) -> Result<PwmHandle> {
        self.allocate_smart_io(channel, HandleKind::Pwm, "PWM", SmartIoMode::PwmOutput, origin)
            .map(PwmHandle)
    }

    /// Frees a PWM handle. Stale or invalid handles are ignored.
    pub fn free_pwm_port(&self, handle: PwmHandle) {
        self.free_smart_io(handle.0, HandleKind::Pwm);
    }

    /// Sets the pulse width in microseconds. Values outside `[0, 4095]` are
    /// clamped rather than rejected.
    pub fn set_pwm_pulse_time_microseconds(&self, handle: PwmHandle, microseconds: i32) -> Result<()> {
        trace!(
            "PWM 0x{:08X} pulse {} us",
            handle.0.raw(),
            microseconds
        );
        self.smart_io(handle.0, HandleKind::Pwm)?
            .set_pwm_microseconds(microseconds)
    }

    /// Gets the commanded pulse width in microseconds.
    pub fn get_pwm_pulse_time_microseconds(&self, handle: PwmHandle) -> Result<i32> {
        self.smart_io(handle.0, HandleKind::Pwm)?
            .get_pwm_microseconds()
    }

    /// Turns the output off (0 us pulse).
    pub fn set_pwm_disabled(&self, handle: PwmHandle) -> Result<()> {
        debug!("Disabling PWM 0x{:08X}", handle.0.raw());
        self.set_pwm_pulse_time_microseconds(handle, consts::pwm::MIN_PULSE_US)
    }

    /// Selects the output period.
    pub fn set_pwm_output_period(&self, handle: PwmHandle, period: PwmOutputPeriod) -> Result<()> {
        self.smart_io(handle.0, HandleKind::Pwm)?
            .set_pwm_output_period(period)
    }

    /// Selects the output period from a raw selector (0, 1 or 2).
    /// Other values fail with `ParameterOutOfRange` and change nothing.
    pub fn set_pwm_output_period_raw(&self, handle: PwmHandle, selector: i32) -> Result<()> {
        let port = self.smart_io(handle.0, HandleKind::Pwm)?;
        let period = PwmOutputPeriod::from_raw(selector)?;
        port.set_pwm_output_period(period)
    }

    /// Returns the selected output period.
    pub fn get_pwm_output_period(&self, handle: PwmHandle) -> Result<PwmOutputPeriod> {
        self.smart_io(handle.0, HandleKind::Pwm)?
            .get_pwm_output_period()
    }

    // --- PWM Input (Duty Cycle) ---
    /// Allocates `channel` as a PWM input that measures high time and period.
    pub fn initialize_duty_cycle(&self, channel: i32, origin: &str) -> Result<DutyCycleHandle> {
        self.allocate_smart_io(
            channel,
            HandleKind::DutyCycle,
            "DutyCycle",
            SmartIoMode::PwmInput,
            origin,
        )
        .map(DutyCycleHandle)
    }

    /// Frees a duty cycle handle.
    pub fn free_duty_cycle(&self, handle: DutyCycleHandle) {
        self.free_smart_io(handle.0, HandleKind::DutyCycle);
    }

    /// Measured high time in microseconds (0 until a full cycle has been seen).
    pub fn get_duty_cycle_high_time_microseconds(&self, handle: DutyCycleHandle) -> Result<i32> {
        self.smart_io(handle.0, HandleKind::DutyCycle)?
            .get_pwm_input_microseconds()
    }

    /// Measured period in microseconds (0 until a full cycle has been seen).
    pub fn get_duty_cycle_period_microseconds(&self, handle: DutyCycleHandle) -> Result<i32> {
        self.smart_io(handle.0, HandleKind::DutyCycle)?
            .get_pwm_input_period_microseconds()
    }

    /// Measured duty cycle as a fraction in `[0, 1]`.
    pub fn get_duty_cycle_output(&self, handle: DutyCycleHandle) -> Result<f64> {
        let port = self.smart_io(handle.0, HandleKind::DutyCycle)?;
        let high = port.get_pwm_input_microseconds()?;
        let period = port.get_pwm_input_period_microseconds()?;
        Ok(duty_fraction(high, period))
    }
}

/// High time over period, clamped to `[0, 1]`; 0 when no period has been measured.
pub fn duty_fraction(high_us: i32, period_us: i32) -> f64 {
    if period_us <= 0 {
        return 0.0;
    }
    (high_us as f64 / period_us as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use approx::assert_relative_eq;

    #[test]
    fn test_duty_fraction() {
        assert_relative_eq!(duty_fraction(1500, 5050), 1500.0 / 5050.0);
        assert_relative_eq!(duty_fraction(100, 0), 0.0);
        assert_relative_eq!(duty_fraction(6000, 5000), 1.0);
        assert_relative_eq!(duty_fraction(-1, 5000), 0.0);
    }

    #[test]
    fn test_pwm_defaults_and_clamp() {
        let hal = Hal::default();
        let pwm = hal.initialize_pwm_port(9, "test").unwrap();
        assert_eq!(hal.get_pwm_pulse_time_microseconds(pwm).unwrap(), 0);
        assert_eq!(
            hal.get_pwm_output_period(pwm).unwrap(),
            PwmOutputPeriod::Multiplier1x
        );
        hal.set_pwm_pulse_time_microseconds(pwm, 10_000).unwrap();
        assert_eq!(hal.get_pwm_pulse_time_microseconds(pwm).unwrap(), 4095);
        hal.set_pwm_disabled(pwm).unwrap();
        assert_eq!(hal.get_pwm_pulse_time_microseconds(pwm).unwrap(), 0);
    }

    #[test]
    fn test_bad_period_selector_changes_nothing() {
        let hal = Hal::default();
        let pwm = hal.initialize_pwm_port(3, "test").unwrap();
        hal.set_pwm_output_period(pwm, PwmOutputPeriod::Multiplier2x)
            .unwrap();
        assert!(matches!(
            hal.set_pwm_output_period_raw(pwm, 7),
            Err(Error::ParameterOutOfRange(_))
        ));
        assert_eq!(
            hal.get_pwm_output_period(pwm).unwrap(),
            PwmOutputPeriod::Multiplier2x
        );
    }

    #[test]
    fn test_pwm_and_dio_share_pins() {
        let hal = Hal::default();
        let _dio = hal.initialize_dio_port(4, true, "dio owner").unwrap();
        match hal.initialize_pwm_port(4, "pwm caller") {
            Err(Error::ResourceIsAllocated {
                previous_allocation,
                ..
            }) => assert_eq!(previous_allocation, "dio owner"),
            other => panic!("Expected ResourceIsAllocated, got {:?}", other),
        }
    }

    #[test]
    fn test_duty_cycle_reads_zero_before_measurement() {
        let hal = Hal::default();
        let input = hal.initialize_duty_cycle(6, "test").unwrap();
        assert_eq!(hal.get_duty_cycle_high_time_microseconds(input).unwrap(), 0);
        assert_eq!(hal.get_duty_cycle_period_microseconds(input).unwrap(), 0);
        assert_relative_eq!(hal.get_duty_cycle_output(input).unwrap(), 0.0);
    }
}
