//! Simulated backplane: the firmware side of the SmartIo topics.
//!
//! A [`SimBackplane`] listens to every channel's `type`, `valset` and
//! `periodset` topics and to the relay topics, and answers on `valget` and
//! `periodget` the way the controller firmware would:
//!
//! * digital outputs drive their own `valget` and every input wired to them;
//! * PWM outputs are driven by a generator thread that stamps each edge with its
//!   exact FPGA time; width and period are latched at the start of each cycle;
//! * PWM inputs report high time (`valget`) and period (`periodget`);
//! * counters count their configured edge;
//! * relay halves drive the input wired to them;
//! * analog inputs report whatever [`SimBackplane::set_analog_input`] injected.
//!
//! Dropping the backplane stops and joins the generator threads and removes
//! every listener.

use crate::clock::FpgaClock;
use crate::consts::{self, topic};
use crate::fixture;
use crate::hal::Hal;
use crate::smartio::{PwmOutputPeriod, SmartIoMode};
use crate::transport::{ListenerId, PubSubOptions, Publisher, Value, ValueStore};
use log::{debug, trace, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often an idle PWM generator checks whether its channel became a PWM output.
const IDLE_POLL_US: u64 = 1_000;

/// What is wired to what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wiring {
    /// Unordered DIO-to-DIO wires.
    pub wires: Vec<(u8, u8)>,
    /// `(relay, forward input, reverse input)`.
    pub relays: Vec<(u8, u8, u8)>,
    /// Channels that get a PWM waveform generator.
    pub pwm_outputs: Vec<u8>,
}

impl Wiring {
    /// The cross-connect harness in [`crate::fixture`].
    pub fn harness() -> Self {
        Wiring {
            wires: fixture::HARNESS_WIRES.to_vec(),
            relays: fixture::RELAY_CROSS_CONNECTS.to_vec(),
            pwm_outputs: fixture::PWM_CROSS_CONNECTS
                .iter()
                .map(|&(output, _)| output)
                .collect(),
        }
    }
}

#[derive(Debug)]
struct ChannelSim {
    mode: SmartIoMode,
    valset: i64,
    period_select: i64,
    // Level this channel puts on its wires.
    driving: bool,
    // Level a relay puts on this channel.
    relay_level: bool,
    // Level this channel last observed on its wires.
    seen: bool,
    count: i64,
    last_rise_us: Option<u64>,
    analog: i64,
}

impl ChannelSim {
    fn new() -> Self {
        ChannelSim {
            mode: SmartIoMode::Uninitialized,
            valset: 0,
            period_select: 0,
            driving: false,
            relay_level: false,
            seen: false,
            count: 0,
            last_rise_us: None,
            analog: 0,
        }
    }

    fn period_us(&self) -> u64 {
        PwmOutputPeriod::from_raw(self.period_select as i32)
            .map(PwmOutputPeriod::period_us)
            .unwrap_or(consts::pwm::BASE_PERIOD_US)
    }
}

#[derive(Debug)]
enum Update {
    ValueGet(u8, i64, u64),
    PeriodGet(u8, i64, u64),
}

#[derive(Debug)]
struct Board {
    channels: Vec<ChannelSim>,
    peers: Vec<Vec<u8>>,
}

impl Board {
    fn wire_level(&self, channel: u8) -> bool {
        let index = channel as usize;
        self.channels[index].relay_level
            || self.peers[index]
                .iter()
                .any(|&peer| self.channels[peer as usize].driving)
    }

    fn set_driving(&mut self, channel: u8, level: bool, time_us: u64, out: &mut Vec<Update>) {
        let index = channel as usize;
        if self.channels[index].driving == level {
            return;
        }
        self.channels[index].driving = level;
        if self.channels[index].mode == SmartIoMode::DigitalOutput {
            out.push(Update::ValueGet(channel, level as i64, time_us));
        }
        for peer in self.peers[index].clone() {
            self.observe(peer, time_us, out);
        }
    }

    fn observe(&mut self, channel: u8, time_us: u64, out: &mut Vec<Update>) {
        let level = self.wire_level(channel);
        let sim = &mut self.channels[channel as usize];
        if sim.seen == level {
            return;
        }
        sim.seen = level;
        match sim.mode {
            SmartIoMode::DigitalInput => out.push(Update::ValueGet(channel, level as i64, time_us)),
            SmartIoMode::SingleCounterRising | SmartIoMode::SingleCounterFalling => {
                if level == (sim.mode == SmartIoMode::SingleCounterRising) {
                    sim.count += 1;
                    out.push(Update::ValueGet(channel, sim.count, time_us));
                }
            }
            SmartIoMode::PwmInput => match (level, sim.last_rise_us) {
                (true, previous) => {
                    if let Some(previous) = previous {
                        out.push(Update::PeriodGet(
                            channel,
                            time_us.saturating_sub(previous) as i64,
                            time_us,
                        ));
                    }
                    sim.last_rise_us = Some(time_us);
                }
                (false, Some(rise)) => {
                    out.push(Update::ValueGet(
                        channel,
                        time_us.saturating_sub(rise) as i64,
                        time_us,
                    ));
                }
                (false, None) => {}
            },
            _ => {}
        }
    }

    fn change_mode(&mut self, channel: u8, mode: SmartIoMode, time_us: u64, out: &mut Vec<Update>) {
        let index = channel as usize;
        self.channels[index].mode = mode;
        trace!("Backplane: channel {} now {:?}", channel, mode);
        match mode {
            SmartIoMode::DigitalOutput => {
                let level = self.channels[index].valset != 0;
                self.set_driving(channel, level, time_us, out);
                out.push(Update::ValueGet(channel, level as i64, time_us));
            }
            SmartIoMode::DigitalInput => {
                self.set_driving(channel, false, time_us, out);
                let level = self.wire_level(channel);
                self.channels[index].seen = level;
                out.push(Update::ValueGet(channel, level as i64, time_us));
            }
            SmartIoMode::SingleCounterRising | SmartIoMode::SingleCounterFalling => {
                self.set_driving(channel, false, time_us, out);
                let level = self.wire_level(channel);
                let sim = &mut self.channels[index];
                sim.seen = level;
                sim.count = 0;
                out.push(Update::ValueGet(channel, 0, time_us));
            }
            SmartIoMode::PwmInput => {
                self.set_driving(channel, false, time_us, out);
                let level = self.wire_level(channel);
                let sim = &mut self.channels[index];
                sim.seen = level;
                sim.last_rise_us = None;
                out.push(Update::ValueGet(channel, 0, time_us));
                out.push(Update::PeriodGet(channel, 0, time_us));
            }
            SmartIoMode::AnalogInput => {
                self.set_driving(channel, false, time_us, out);
                out.push(Update::ValueGet(channel, self.channels[index].analog, time_us));
            }
            SmartIoMode::PwmOutput | SmartIoMode::AddressableLed | SmartIoMode::Uninitialized => {
                self.set_driving(channel, false, time_us, out);
            }
        }
    }

    // The channel may have left PWM output mode since the cycle was latched.
    fn drive_pwm(&mut self, channel: u8, level: bool, time_us: u64, out: &mut Vec<Update>) {
        if self.channels[channel as usize].mode == SmartIoMode::PwmOutput {
            self.set_driving(channel, level, time_us, out);
        }
    }

    fn set_value(&mut self, channel: u8, value: i64, time_us: u64, out: &mut Vec<Update>) {
        let sim = &mut self.channels[channel as usize];
        sim.valset = value;
        if sim.mode == SmartIoMode::DigitalOutput {
            self.set_driving(channel, value != 0, time_us, out);
        }
    }
}

#[derive(Debug)]
struct Backplane {
    clock: FpgaClock,
    board: Mutex<Board>,
    value_get: Vec<Publisher<i64>>,
    period_get: Vec<Publisher<i64>>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Backplane {
    fn board(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Runs `f` under the board lock, then publishes what it produced.
    fn apply(&self, f: impl FnOnce(&mut Board, &mut Vec<Update>)) {
        let mut out = Vec::new();
        f(&mut self.board(), &mut out);
        for update in out {
            match update {
                Update::ValueGet(channel, value, time_us) => {
                    self.value_get[channel as usize].set_at(value, time_us)
                }
                Update::PeriodGet(channel, value, time_us) => {
                    self.period_get[channel as usize].set_at(value, time_us)
                }
            }
        }
    }

    // Returns false if the backplane stopped before `time_us`.
    fn sleep_until(&self, time_us: u64) -> bool {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *stopped {
                return false;
            }
            let now = self.clock.now_us();
            if now >= time_us {
                return true;
            }
            stopped = self
                .wake
                .wait_timeout(stopped, Duration::from_micros(time_us - now))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn generate_pwm(&self, channel: u8) {
        debug!("Backplane: PWM generator on channel {} started", channel);
        let mut next_rise = self.clock.now_us();
        while self.sleep_until(next_rise) {
            let cycle = {
                let board = self.board();
                let sim = &board.channels[channel as usize];
                (sim.mode == SmartIoMode::PwmOutput).then(|| {
                    let width = sim.valset.clamp(0, consts::pwm::MAX_PULSE_US as i64) as u64;
                    (width, sim.period_us())
                })
            };
            let Some((width, period)) = cycle else {
                next_rise = self.clock.now_us() + IDLE_POLL_US;
                continue;
            };
            if width > 0 {
                let rise = next_rise;
                self.apply(|board, out| board.drive_pwm(channel, true, rise, out));
                if !self.sleep_until(rise + width) {
                    break;
                }
                self.apply(|board, out| board.drive_pwm(channel, false, rise + width, out));
            }
            next_rise += period;
        }
        debug!("Backplane: PWM generator on channel {} stopped", channel);
    }
}

/// Simulated controller firmware attached to a [`Hal`]'s transport.
#[derive(Debug)]
pub struct SimBackplane {
    store: ValueStore,
    inner: Arc<Backplane>,
    listeners: Vec<ListenerId>,
    generators: Vec<JoinHandle<()>>,
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(v) => Some(*v),
        _ => None,
    }
}

impl SimBackplane {
    /// Attaches a backplane wired as the cross-connect harness.
    pub fn new(hal: &Hal) -> Self {
        SimBackplane::with_wiring(hal, Wiring::harness())
    }

    /// Attaches a backplane with custom wiring.
    pub fn with_wiring(hal: &Hal, wiring: Wiring) -> Self {
        let store = hal.store().clone();
        let options = PubSubOptions::all_updates();
        let count = consts::NUM_SMART_IO;

        let mut peers = vec![Vec::new(); count];
        for &(a, b) in &wiring.wires {
            if (a as usize) < count && (b as usize) < count {
                peers[a as usize].push(b);
                peers[b as usize].push(a);
            } else {
                warn!("Backplane: ignoring wire {}-{} outside the board", a, b);
            }
        }

        let inner = Arc::new(Backplane {
            clock: hal.clock(),
            board: Mutex::new(Board {
                channels: (0..count).map(|_| ChannelSim::new()).collect(),
                peers,
            }),
            value_get: (0..count as u8)
                .map(|ch| store.publish(&topic::io(ch, topic::VALUE_GET), options))
                .collect(),
            period_get: (0..count as u8)
                .map(|ch| store.publish(&topic::io(ch, topic::PERIOD_GET), options))
                .collect(),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });

        let mut listeners = Vec::new();
        for ch in 0..count as u8 {
            // Pick up ports configured before the backplane was attached.
            let now = inner.clock.now_us();
            let stored = |entry: &str| {
                store
                    .get_value(&topic::io(ch, entry))
                    .and_then(|v| as_integer(&v.value))
            };
            let valset = stored(topic::VALUE_SET);
            let period = stored(topic::PERIOD_SET);
            let mode = stored(topic::MODE).and_then(SmartIoMode::from_tag);
            inner.apply(|board, out| {
                let sim = &mut board.channels[ch as usize];
                sim.valset = valset.unwrap_or(0);
                sim.period_select = period.unwrap_or(0);
                if let Some(mode) = mode {
                    board.change_mode(ch, mode, now, out);
                }
            });

            let plane = Arc::clone(&inner);
            listeners.push(store.add_listener(&topic::io(ch, topic::MODE), move |_, value, time_us| {
                if let Some(mode) = as_integer(value).and_then(SmartIoMode::from_tag) {
                    plane.apply(|board, out| board.change_mode(ch, mode, time_us, out));
                }
            }));
            let plane = Arc::clone(&inner);
            listeners.push(store.add_listener(&topic::io(ch, topic::VALUE_SET), move |_, value, time_us| {
                if let Some(v) = as_integer(value) {
                    plane.apply(|board, out| board.set_value(ch, v, time_us, out));
                }
            }));
            let plane = Arc::clone(&inner);
            listeners.push(store.add_listener(&topic::io(ch, topic::PERIOD_SET), move |_, value, _| {
                if let Some(v) = as_integer(value) {
                    plane.board().channels[ch as usize].period_select = v;
                }
            }));
        }

        for &(relay, forward_input, reverse_input) in &wiring.relays {
            for (forward, input) in [(true, forward_input), (false, reverse_input)] {
                if input as usize >= count {
                    warn!("Backplane: relay {} input {} outside the board", relay, input);
                    continue;
                }
                let plane = Arc::clone(&inner);
                listeners.push(store.add_listener(&topic::relay(relay, forward), move |_, value, time_us| {
                    if let Value::Boolean(on) = value {
                        let on = *on;
                        plane.apply(|board, out| {
                            board.channels[input as usize].relay_level = on;
                            board.observe(input, time_us, out);
                        });
                    }
                }));
            }
        }

        let generators = wiring
            .pwm_outputs
            .iter()
            .filter(|&&ch| (ch as usize) < count)
            .map(|&ch| {
                let plane = Arc::clone(&inner);
                thread::spawn(move || plane.generate_pwm(ch))
            })
            .collect();

        debug!(
            "Backplane attached: {} wire(s), {} relay(s), {} PWM generator(s)",
            wiring.wires.len(),
            wiring.relays.len(),
            wiring.pwm_outputs.len()
        );
        SimBackplane {
            store,
            inner,
            listeners,
            generators,
        }
    }

    /// Sets the raw reading an analog input channel reports.
    pub fn set_analog_input(&self, channel: u8, raw: i64) {
        if channel as usize >= consts::NUM_SMART_IO {
            warn!("Backplane: analog channel {} outside the board", channel);
            return;
        }
        let now = self.inner.clock.now_us();
        self.inner.apply(|board, out| {
            let sim = &mut board.channels[channel as usize];
            sim.analog = raw;
            if sim.mode == SmartIoMode::AnalogInput {
                out.push(Update::ValueGet(channel, raw, now));
            }
        });
    }

    /// Level currently present on `channel`'s wires.
    pub fn wire_level(&self, channel: u8) -> bool {
        (channel as usize) < consts::NUM_SMART_IO && self.inner.board().wire_level(channel)
    }
}

impl Drop for SimBackplane {
    fn drop(&mut self) {
        *self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.inner.wake.notify_all();
        for generator in self.generators.drain(..) {
            if generator.join().is_err() {
                warn!("Backplane: PWM generator panicked");
            }
        }
        for listener in self.listeners.drain(..) {
            self.store.remove_listener(listener);
        }
        debug!("Backplane detached");
    }
}
