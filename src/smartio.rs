//! The per-channel mode state machine.
//!
//! A [`SmartIo`] port starts `Uninitialized` and is placed into exactly one mode
//! by [`SmartIo::initialize_mode`]. Only digital channels may change afterwards,
//! and only between input and output. Every value operation checks the current
//! mode first and fails with [`Error::IncompatibleState`] before touching the
//! transport.

use crate::consts::{self, topic};
use crate::error::{incompatible, Error, Result};
use crate::transport::{PubSubOptions, Publisher, Subscriber, ValueStore};
use log::{debug, trace};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Operating modes of a SmartIo channel. The discriminant is published on the
/// channel's `type` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmartIoMode {
    Uninitialized = 0,
    DigitalInput = 1,
    DigitalOutput = 2,
    PwmOutput = 3,
    PwmInput = 4,
    AnalogInput = 5,
    SingleCounterRising = 6,
    SingleCounterFalling = 7,
    AddressableLed = 8,
}

impl SmartIoMode {
    /// Decodes a published mode tag.
    pub fn from_tag(tag: i64) -> Option<SmartIoMode> {
        Some(match tag {
            0 => SmartIoMode::Uninitialized,
            1 => SmartIoMode::DigitalInput,
            2 => SmartIoMode::DigitalOutput,
            3 => SmartIoMode::PwmOutput,
            4 => SmartIoMode::PwmInput,
            5 => SmartIoMode::AnalogInput,
            6 => SmartIoMode::SingleCounterRising,
            7 => SmartIoMode::SingleCounterFalling,
            8 => SmartIoMode::AddressableLed,
            _ => return None,
        })
    }

    /// The tag published on the `type` topic.
    #[inline]
    pub fn tag(self) -> i64 {
        self as i64
    }
}

/// PWM output period selector. The period doubles with each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PwmOutputPeriod {
    /// 5.05 ms.
    Multiplier1x,
    /// 10.1 ms.
    Multiplier2x,
    /// 20.2 ms.
    Multiplier4x,
}

impl PwmOutputPeriod {
    /// All selectors, shortest period first.
    pub const ALL: [PwmOutputPeriod; 3] = [
        PwmOutputPeriod::Multiplier1x,
        PwmOutputPeriod::Multiplier2x,
        PwmOutputPeriod::Multiplier4x,
    ];

    /// Decodes a raw selector (0, 1 or 2).
    pub fn from_raw(raw: i32) -> Result<PwmOutputPeriod> {
        match raw {
            0 => Ok(PwmOutputPeriod::Multiplier1x),
            1 => Ok(PwmOutputPeriod::Multiplier2x),
            2 => Ok(PwmOutputPeriod::Multiplier4x),
            _ => Err(Error::ParameterOutOfRange(format!(
                "PWM output period selector must be 0-2 (got {})",
                raw
            ))),
        }
    }

    /// The raw selector published on the `periodset` topic.
    pub fn raw(self) -> i64 {
        match self {
            PwmOutputPeriod::Multiplier1x => 0,
            PwmOutputPeriod::Multiplier2x => 1,
            PwmOutputPeriod::Multiplier4x => 2,
        }
    }

    /// Period length in microseconds.
    pub fn period_us(self) -> u64 {
        consts::pwm::BASE_PERIOD_US << self.raw()
    }
}

#[derive(Debug)]
struct DigitalEndpoints {
    get: Subscriber<i64>,
    set: Publisher<i64>,
}

#[derive(Debug)]
struct PwmOutputEndpoints {
    set: Publisher<i64>,
    period_set: Publisher<i64>,
    commanded_us: i32,
    period: PwmOutputPeriod,
}

#[derive(Debug)]
struct PwmInputEndpoints {
    high_time: Subscriber<i64>,
    period: Subscriber<i64>,
}

#[derive(Debug)]
struct LedEndpoints {
    count: Publisher<i64>,
    offset: Publisher<i64>,
    start: i32,
    length: i32,
}

/// Mode plus the endpoints that mode needs. Nothing else is kept per mode.
#[derive(Debug)]
enum ModeState {
    Uninitialized,
    Digital {
        output: bool,
        endpoints: DigitalEndpoints,
    },
    PwmOutput(PwmOutputEndpoints),
    PwmInput(PwmInputEndpoints),
    AnalogInput(Subscriber<i64>),
    Counter {
        rising: bool,
        count: Subscriber<i64>,
    },
    AddressableLed(LedEndpoints),
}

impl ModeState {
    fn mode(&self) -> SmartIoMode {
        match self {
            ModeState::Uninitialized => SmartIoMode::Uninitialized,
            ModeState::Digital { output: false, .. } => SmartIoMode::DigitalInput,
            ModeState::Digital { output: true, .. } => SmartIoMode::DigitalOutput,
            ModeState::PwmOutput(_) => SmartIoMode::PwmOutput,
            ModeState::PwmInput(_) => SmartIoMode::PwmInput,
            ModeState::AnalogInput(_) => SmartIoMode::AnalogInput,
            ModeState::Counter { rising: true, .. } => SmartIoMode::SingleCounterRising,
            ModeState::Counter { rising: false, .. } => SmartIoMode::SingleCounterFalling,
            ModeState::AddressableLed(_) => SmartIoMode::AddressableLed,
        }
    }
}

/// State of one SmartIo channel.
#[derive(Debug)]
pub struct SmartIo {
    channel: u8,
    store: ValueStore,
    options: PubSubOptions,
    mode_publisher: Publisher<i64>,
    state: Mutex<ModeState>,
}

impl SmartIo {
    /// Creates an uninitialized port for `channel`. Nothing is published until a
    /// mode is chosen.
    pub fn new(channel: u8, store: &ValueStore, options: PubSubOptions) -> Self {
        SmartIo {
            channel,
            store: store.clone(),
            options,
            mode_publisher: store.publish(&topic::io(channel, topic::MODE), options),
            state: Mutex::new(ModeState::Uninitialized),
        }
    }

    fn state(&self) -> MutexGuard<'_, ModeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publisher(&self, entry: &str) -> Publisher<i64> {
        self.store.publish(&topic::io(self.channel, entry), self.options)
    }

    fn subscriber(&self, entry: &str) -> Subscriber<i64> {
        self.store
            .subscribe(&topic::io(self.channel, entry), 0, self.options)
    }

    /// Channel index.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Current mode.
    pub fn mode(&self) -> SmartIoMode {
        self.state().mode()
    }

    /// Places an uninitialized port into `mode`.
    ///
    /// Output-capable modes are driven to a safe value (0 / off, LED length and
    /// offset 0) before the mode tag is published.
    pub fn initialize_mode(&self, mode: SmartIoMode) -> Result<()> {
        let mut state = self.state();
        if !matches!(*state, ModeState::Uninitialized) {
            return Err(incompatible(self.channel, state.mode(), "initialize_mode"));
        }
        let next = match mode {
            SmartIoMode::Uninitialized => {
                return Err(incompatible(self.channel, state.mode(), "initialize_mode"));
            }
            SmartIoMode::DigitalInput | SmartIoMode::DigitalOutput => {
                let output = mode == SmartIoMode::DigitalOutput;
                let endpoints = DigitalEndpoints {
                    get: self.subscriber(topic::VALUE_GET),
                    set: self.publisher(topic::VALUE_SET),
                };
                if output {
                    endpoints.set.set(0);
                }
                ModeState::Digital { output, endpoints }
            }
            SmartIoMode::PwmOutput => {
                let endpoints = PwmOutputEndpoints {
                    set: self.publisher(topic::VALUE_SET),
                    period_set: self.publisher(topic::PERIOD_SET),
                    commanded_us: 0,
                    period: PwmOutputPeriod::Multiplier1x,
                };
                endpoints.set.set(0);
                endpoints.period_set.set(endpoints.period.raw());
                ModeState::PwmOutput(endpoints)
            }
            SmartIoMode::PwmInput => ModeState::PwmInput(PwmInputEndpoints {
                high_time: self.subscriber(topic::VALUE_GET),
                period: self.subscriber(topic::PERIOD_GET),
            }),
            SmartIoMode::AnalogInput => ModeState::AnalogInput(self.subscriber(topic::VALUE_GET)),
            SmartIoMode::SingleCounterRising | SmartIoMode::SingleCounterFalling => {
                ModeState::Counter {
                    rising: mode == SmartIoMode::SingleCounterRising,
                    count: self.subscriber(topic::VALUE_GET),
                }
            }
            SmartIoMode::AddressableLed => {
                let endpoints = LedEndpoints {
                    count: self.publisher(topic::LED_COUNT),
                    offset: self.publisher(topic::LED_OFFSET),
                    start: 0,
                    length: 0,
                };
                endpoints.count.set(0);
                endpoints.offset.set(0);
                ModeState::AddressableLed(endpoints)
            }
        };
        *state = next;
        self.mode_publisher.set(mode.tag());
        debug!("SmartIo {} initialized as {:?}", self.channel, mode);
        Ok(())
    }

    /// Flips a digital channel between input and output.
    pub fn switch_dio_direction(&self, to_input: bool) -> Result<()> {
        let mut state = self.state();
        let mode = state.mode();
        let ModeState::Digital { output, endpoints } = &mut *state else {
            return Err(incompatible(self.channel, mode, "switch_dio_direction"));
        };
        if *output == !to_input {
            trace!("SmartIo {} already {:?}", self.channel, mode);
            return Ok(());
        }
        if !to_input {
            endpoints.set.set(0);
        }
        *output = !to_input;
        let mode = state.mode();
        self.mode_publisher.set(mode.tag());
        debug!("SmartIo {} switched to {:?}", self.channel, mode);
        Ok(())
    }

    /// Drives a digital output.
    pub fn set_digital_output(&self, value: bool) -> Result<()> {
        let state = self.state();
        match &*state {
            ModeState::Digital {
                output: true,
                endpoints,
            } => {
                trace!("SmartIo {} set {}", self.channel, value);
                endpoints.set.set(value as i64);
                Ok(())
            }
            other => Err(incompatible(self.channel, other.mode(), "set_digital_output")),
        }
    }

    /// Reads the pin level of a digital channel (input or output).
    pub fn get_digital_input(&self) -> Result<bool> {
        match &*self.state() {
            ModeState::Digital { endpoints, .. } => Ok(endpoints.get.get() != 0),
            other => Err(incompatible(self.channel, other.mode(), "get_digital_input")),
        }
    }

    /// Sets the PWM pulse width, clamped to `[0, 4095]` microseconds.
    pub fn set_pwm_microseconds(&self, microseconds: i32) -> Result<()> {
        let mut state = self.state();
        match &mut *state {
            ModeState::PwmOutput(endpoints) => {
                let clamped =
                    microseconds.clamp(consts::pwm::MIN_PULSE_US, consts::pwm::MAX_PULSE_US);
                if clamped != microseconds {
                    trace!(
                        "SmartIo {} pulse {} us clamped to {} us",
                        self.channel,
                        microseconds,
                        clamped
                    );
                }
                endpoints.commanded_us = clamped;
                endpoints.set.set(clamped as i64);
                Ok(())
            }
            other => Err(incompatible(self.channel, other.mode(), "set_pwm_microseconds")),
        }
    }

    /// Returns the commanded PWM pulse width.
    pub fn get_pwm_microseconds(&self) -> Result<i32> {
        match &*self.state() {
            ModeState::PwmOutput(endpoints) => Ok(endpoints.commanded_us),
            other => Err(incompatible(self.channel, other.mode(), "get_pwm_microseconds")),
        }
    }

    /// Selects the PWM output period.
    pub fn set_pwm_output_period(&self, period: PwmOutputPeriod) -> Result<()> {
        let mut state = self.state();
        match &mut *state {
            ModeState::PwmOutput(endpoints) => {
                debug!("SmartIo {} output period {:?}", self.channel, period);
                endpoints.period = period;
                endpoints.period_set.set(period.raw());
                Ok(())
            }
            other => Err(incompatible(self.channel, other.mode(), "set_pwm_output_period")),
        }
    }

    /// Returns the selected PWM output period.
    pub fn get_pwm_output_period(&self) -> Result<PwmOutputPeriod> {
        match &*self.state() {
            ModeState::PwmOutput(endpoints) => Ok(endpoints.period),
            other => Err(incompatible(self.channel, other.mode(), "get_pwm_output_period")),
        }
    }

    /// Measured high time of a PWM input, in microseconds.
    pub fn get_pwm_input_microseconds(&self) -> Result<i32> {
        match &*self.state() {
            ModeState::PwmInput(endpoints) => Ok(endpoints.high_time.get() as i32),
            other => Err(incompatible(self.channel, other.mode(), "get_pwm_input_microseconds")),
        }
    }

    /// Measured period of a PWM input, in microseconds.
    pub fn get_pwm_input_period_microseconds(&self) -> Result<i32> {
        match &*self.state() {
            ModeState::PwmInput(endpoints) => Ok(endpoints.period.get() as i32),
            other => Err(incompatible(
                self.channel,
                other.mode(),
                "get_pwm_input_period_microseconds",
            )),
        }
    }

    /// Raw analog reading.
    pub fn get_analog_input(&self) -> Result<i32> {
        match &*self.state() {
            ModeState::AnalogInput(value) => Ok(value.get() as i32),
            other => Err(incompatible(self.channel, other.mode(), "get_analog_input")),
        }
    }

    /// Edge count of a counter channel.
    pub fn get_counter(&self) -> Result<i32> {
        match &*self.state() {
            ModeState::Counter { count, .. } => Ok(count.get() as i32),
            other => Err(incompatible(self.channel, other.mode(), "get_counter")),
        }
    }

    /// Sets the LED strip's offset into the shared buffer.
    pub fn set_led_start(&self, start: i32) -> Result<()> {
        let mut state = self.state();
        match &mut *state {
            ModeState::AddressableLed(endpoints) => {
                check_led_range(start, endpoints.length)?;
                endpoints.start = start;
                endpoints.offset.set(start as i64);
                Ok(())
            }
            other => Err(incompatible(self.channel, other.mode(), "set_led_start")),
        }
    }

    /// Sets the LED strip's length.
    pub fn set_led_length(&self, length: i32) -> Result<()> {
        let mut state = self.state();
        match &mut *state {
            ModeState::AddressableLed(endpoints) => {
                check_led_range(endpoints.start, length)?;
                endpoints.length = length;
                endpoints.count.set(length as i64);
                Ok(())
            }
            other => Err(incompatible(self.channel, other.mode(), "set_led_length")),
        }
    }

    /// Returns `(start, length)` of an LED strip.
    pub fn get_led_range(&self) -> Result<(i32, i32)> {
        match &*self.state() {
            ModeState::AddressableLed(endpoints) => Ok((endpoints.start, endpoints.length)),
            other => Err(incompatible(self.channel, other.mode(), "get_led_range")),
        }
    }

    /// Returns the port to `Uninitialized` and publishes the tag. Called on free.
    pub(crate) fn reset(&self) {
        let mut state = self.state();
        if matches!(*state, ModeState::Uninitialized) {
            return;
        }
        *state = ModeState::Uninitialized;
        self.mode_publisher.set(SmartIoMode::Uninitialized.tag());
        debug!("SmartIo {} reset", self.channel);
    }
}

/// Validates an LED start/length pair against the shared buffer.
pub(crate) fn check_led_range(start: i32, length: i32) -> Result<()> {
    let max = consts::led::MAX_LENGTH;
    if start < 0 || start >= max {
        return Err(Error::ParameterOutOfRange(format!(
            "LED start must be 0-{} (got {})",
            max - 1,
            start
        )));
    }
    if length < 0 || length >= max {
        return Err(Error::ParameterOutOfRange(format!(
            "LED length must be 0-{} (got {})",
            max - 1,
            length
        )));
    }
    if start + length >= max {
        return Err(Error::ParameterOutOfRange(format!(
            "LED start {} + length {} exceeds buffer of {}",
            start, length, max
        )));
    }
    Ok(())
}
