//! PWM timing validation through interrupts and DMA.
//!
//! A [`PwmTimingHarness`] drives a PWM output that is wired to a digital input
//! and checks that the edges seen on the input match the commanded waveform.
//!
//! The interrupt trial runs a collector thread that polls
//! [`Hal::wait_for_interrupt`] and appends edge timestamps under a mutex. The
//! foreground waits on a condition variable until enough edges have arrived or
//! the trial times out. The collector lives in a [`std::thread::scope`], so it
//! is always joined before the trial returns, and a drop guard clears its run
//! flag on every exit path.
//!
//! The DMA trial captures the same waveform with a DMA engine and checks the
//! alternating sample sequence instead.

use crate::consts;
use crate::dma::DmaReadStatus;
use crate::error::{Error, Result};
use crate::hal::Hal;
use crate::handle::{DigitalHandle, DmaHandle, InterruptHandle, PwmHandle};
use crate::interrupt::WaitResult;
use crate::smartio::PwmOutputPeriod;
use log::{debug, error, info, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Parameters of a timing trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingConfig {
    /// Rising and falling edges to collect per interrupt trial.
    pub target_edges: usize,
    /// Timeout of each `wait_for_interrupt` poll in the collector.
    pub poll_interval: Duration,
    /// Overall deadline of an interrupt trial.
    pub trial_timeout: Duration,
    /// Allowed deviation of widths and periods, in microseconds.
    pub tolerance_us: u64,
    /// Edges stamped before `width change + settle` are ignored.
    pub settle: Duration,
    /// Samples read per DMA trial.
    pub dma_samples: usize,
    /// Timeout of each DMA read.
    pub dma_read_timeout: Duration,
    /// DMA ring depth.
    pub dma_queue_depth: usize,
    /// Inclusive window in which the first high DMA sample must appear.
    pub dma_search: (usize, usize),
    /// Samples after the first high one that must alternate.
    pub dma_alternation_run: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            target_edges: consts::timing::TARGET_EDGES,
            poll_interval: consts::timing::POLL_INTERVAL,
            trial_timeout: consts::timing::TRIAL_TIMEOUT,
            tolerance_us: consts::timing::TOLERANCE_US,
            settle: consts::timing::SETTLE,
            dma_samples: consts::timing::DMA_SAMPLES,
            dma_read_timeout: consts::timing::DMA_READ_TIMEOUT,
            dma_queue_depth: consts::timing::DMA_QUEUE_DEPTH,
            dma_search: (
                consts::timing::DMA_SEARCH_START,
                consts::timing::DMA_SEARCH_END,
            ),
            dma_alternation_run: consts::timing::DMA_ALTERNATION_RUN,
        }
    }
}

/// Measurements of a passing trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialReport {
    pub width_us: i32,
    pub period: PwmOutputPeriod,
    /// Measured high times, one per edge pair.
    pub widths_us: Vec<i64>,
    /// Measured rising-to-rising intervals.
    pub periods_us: Vec<i64>,
}

#[derive(Debug, Default)]
struct Edges {
    rising: Vec<u64>,
    falling: Vec<u64>,
    accept_after: Option<u64>,
}

impl Edges {
    fn complete(&self, target: usize) -> bool {
        self.rising.len() >= target && self.falling.len() >= target
    }

    fn push(&mut self, rising: bool, time_us: u64) {
        match self.accept_after {
            Some(after) if time_us >= after => {}
            _ => return,
        }
        if rising {
            self.rising.push(time_us);
        } else if !self.rising.is_empty() {
            self.falling.push(time_us);
        }
    }
}

#[derive(Debug, Default)]
struct Collector {
    edges: Mutex<Edges>,
    done: Condvar,
}

impl Collector {
    fn lock(&self) -> MutexGuard<'_, Edges> {
        self.edges.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Clears the collector's run flag when the trial exits by any path.
struct StopOnDrop<'a>(&'a AtomicBool);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives `pwm` and measures the waveform on the wired `input`.
#[derive(Debug)]
pub struct PwmTimingHarness<'a> {
    hal: &'a Hal,
    pwm: PwmHandle,
    input: DigitalHandle,
    config: TimingConfig,
}

impl<'a> PwmTimingHarness<'a> {
    pub fn new(hal: &'a Hal, pwm: PwmHandle, input: DigitalHandle) -> Self {
        PwmTimingHarness::with_config(hal, pwm, input, TimingConfig::default())
    }

    pub fn with_config(hal: &'a Hal, pwm: PwmHandle, input: DigitalHandle, config: TimingConfig) -> Self {
        PwmTimingHarness {
            hal,
            pwm,
            input,
            config,
        }
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    /// Commands `width_us` at `period` and validates the edges seen by an interrupt.
    pub fn run_interrupt_trial(&self, width_us: i32, period: PwmOutputPeriod) -> Result<TrialReport> {
        let trial = format!("interrupt, {} us, {:?}", width_us, period);
        info!("Running timing trial ({})", trial);
        let irq = self.hal.initialize_interrupts()?;
        let result = self.interrupt_trial(irq, width_us, period, &trial);
        self.hal.clean_interrupts(irq);
        if let Err(e) = &result {
            error!("{}", e);
        }
        result
    }

    fn interrupt_trial(
        &self,
        irq: InterruptHandle,
        width_us: i32,
        period: PwmOutputPeriod,
        trial: &str,
    ) -> Result<TrialReport> {
        let hal = self.hal;
        hal.request_interrupts(irq, &self.input)?;
        hal.set_interrupt_up_source_edge(irq, true, true)?;
        hal.set_pwm_output_period(self.pwm, period)?;

        let target = self.config.target_edges;
        let poll = self.config.poll_interval;
        let collector = Collector::default();
        let run = AtomicBool::new(true);

        let edges = thread::scope(|s| -> Result<Edges> {
            let _stop = StopOnDrop(&run);
            s.spawn(|| collect_edges(hal, irq, poll, target, &run, &collector));

            hal.set_pwm_pulse_time_microseconds(self.pwm, width_us)?;
            let accept_after = hal.fpga_time_us() + self.config.settle.as_micros() as u64;
            collector.lock().accept_after = Some(accept_after);

            let (edges, wait) = collector
                .done
                .wait_timeout_while(collector.lock(), self.config.trial_timeout, |e| {
                    !e.complete(target)
                })
                .unwrap_or_else(PoisonError::into_inner);
            if wait.timed_out() && !edges.complete(target) {
                return Err(Error::TrialTimeout {
                    trial: trial.to_string(),
                    timeout_ms: self.config.trial_timeout.as_millis() as u64,
                    rising: edges.rising.len(),
                    falling: edges.falling.len(),
                });
            }
            // The collector may run past the target before it sees the stop flag.
            Ok(Edges {
                rising: edges.rising[..target].to_vec(),
                falling: edges.falling[..target].to_vec(),
                accept_after: edges.accept_after,
            })
        })?;

        validate_edges(
            trial,
            &edges.rising,
            &edges.falling,
            width_us,
            period,
            self.config.tolerance_us,
        )
    }

    /// Commands `width_us` at `period` and validates a DMA capture of the input.
    pub fn run_dma_trial(&self, width_us: i32, period: PwmOutputPeriod) -> Result<TrialReport> {
        let trial = format!("DMA, {} us, {:?}", width_us, period);
        info!("Running timing trial ({})", trial);
        let dma = self.hal.initialize_dma()?;
        let result = self.dma_trial(dma, width_us, period, &trial);
        self.hal.free_dma(dma);
        if let Err(e) = &result {
            error!("{}", e);
        }
        result
    }

    fn dma_trial(
        &self,
        dma: DmaHandle,
        width_us: i32,
        period: PwmOutputPeriod,
        trial: &str,
    ) -> Result<TrialReport> {
        let hal = self.hal;
        hal.set_pwm_output_period(self.pwm, period)?;
        hal.add_dma_digital_source(dma, &self.input)?;
        hal.start_dma(dma, self.config.dma_queue_depth)?;

        let mut stale = 0;
        while let (DmaReadStatus::Ok, Some(_), _) = hal.read_dma(dma, Duration::ZERO)? {
            stale += 1;
        }
        trace!("Drained {} stale DMA sample(s)", stale);

        hal.set_pwm_pulse_time_microseconds(self.pwm, width_us)?;
        let expected = self.config.dma_samples;
        let mut samples = Vec::with_capacity(expected);
        for index in 0..expected {
            match hal.read_dma(dma, self.config.dma_read_timeout)? {
                (DmaReadStatus::Ok, Some(sample), _) => {
                    samples.push((sample.time_us(), sample.digital_source(&self.input)?));
                }
                _ => {
                    return Err(Error::DmaTimeout {
                        timeout_ms: self.config.dma_read_timeout.as_millis() as u64,
                        index,
                        expected,
                    });
                }
            }
        }
        hal.stop_dma(dma)?;
        validate_dma_samples(trial, &samples, width_us, period, &self.config)
    }
}

fn collect_edges(
    hal: &Hal,
    irq: InterruptHandle,
    poll: Duration,
    target: usize,
    run: &AtomicBool,
    collector: &Collector,
) {
    while run.load(Ordering::SeqCst) {
        let result = match hal.wait_for_interrupt(irq, poll, false) {
            Ok(WaitResult::Timeout) => continue,
            Ok(result) => result,
            Err(e) => {
                error!("Interrupt collector stopped: {}", e);
                return;
            }
        };
        let rising_us = if result.is_rising() {
            hal.read_interrupt_rising_timestamp(irq).ok()
        } else {
            None
        };
        let falling_us = if result.is_falling() {
            hal.read_interrupt_falling_timestamp(irq).ok()
        } else {
            None
        };
        let mut edges = collector.lock();
        if let Some(time_us) = rising_us {
            edges.push(true, time_us);
        }
        if let Some(time_us) = falling_us {
            edges.push(false, time_us);
        }
        if edges.complete(target) {
            debug!(
                "Collected {} rising and {} falling edges",
                edges.rising.len(),
                edges.falling.len()
            );
            collector.done.notify_all();
            return;
        }
    }
}

fn check(trial: &str, what: &'static str, index: usize, expected: i64, observed: i64, tolerance_us: u64) -> Result<()> {
    if observed.abs_diff(expected) > tolerance_us {
        return Err(Error::TimingMismatch {
            trial: trial.to_string(),
            what,
            index,
            expected,
            observed,
        });
    }
    Ok(())
}

/// Validates paired rising/falling timestamps against the commanded waveform.
pub fn validate_edges(
    trial: &str,
    rising: &[u64],
    falling: &[u64],
    width_us: i32,
    period: PwmOutputPeriod,
    tolerance_us: u64,
) -> Result<TrialReport> {
    if rising.len() != falling.len() || rising.is_empty() || rising.len() % 2 != 0 {
        return Err(Error::TimingMismatch {
            trial: trial.to_string(),
            what: "edge count",
            index: 0,
            expected: rising.len() as i64,
            observed: falling.len() as i64,
        });
    }
    let mut widths_us = Vec::with_capacity(rising.len());
    for (i, (rise, fall)) in rising.iter().zip(falling).enumerate() {
        let width = *fall as i64 - *rise as i64;
        check(trial, "pulse width", i, width_us as i64, width, tolerance_us)?;
        widths_us.push(width);
    }
    let mut periods_us = Vec::with_capacity(rising.len().saturating_sub(1));
    for (i, pair) in rising.windows(2).enumerate() {
        let observed = pair[1] as i64 - pair[0] as i64;
        check(trial, "period", i, period.period_us() as i64, observed, tolerance_us)?;
        periods_us.push(observed);
    }
    Ok(TrialReport {
        width_us,
        period,
        widths_us,
        periods_us,
    })
}

/// Validates a DMA capture of `(timestamp, level)` samples.
///
/// The first high sample must fall inside `config.dma_search`; from there the
/// next `config.dma_alternation_run` samples must alternate high and low.
pub fn validate_dma_samples(
    trial: &str,
    samples: &[(u64, bool)],
    width_us: i32,
    period: PwmOutputPeriod,
    config: &TimingConfig,
) -> Result<TrialReport> {
    let (start, end) = config.dma_search;
    let first_high = (start..=end)
        .find(|&i| samples.get(i).is_some_and(|(_, high)| *high))
        .ok_or_else(|| Error::TimingMismatch {
            trial: trial.to_string(),
            what: "first high sample",
            index: start,
            expected: 1,
            observed: 0,
        })?;

    let run = config.dma_alternation_run;
    let window = samples.get(first_high..first_high + run).ok_or_else(|| Error::TimingMismatch {
        trial: trial.to_string(),
        what: "sample count",
        index: first_high,
        expected: (first_high + run) as i64,
        observed: samples.len() as i64,
    })?;
    for (k, (_, high)) in window.iter().enumerate() {
        if *high != (k % 2 == 0) {
            return Err(Error::TimingMismatch {
                trial: trial.to_string(),
                what: "level alternation",
                index: first_high + k,
                expected: (k % 2 == 0) as i64,
                observed: *high as i64,
            });
        }
    }

    let rising: Vec<u64> = window.iter().step_by(2).map(|(t, _)| *t).collect();
    let falling: Vec<u64> = window.iter().skip(1).step_by(2).map(|(t, _)| *t).collect();
    validate_edges(trial, &rising, &falling, width_us, period, config.tolerance_us)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waveform(start: u64, width: u64, period: u64, cycles: usize) -> (Vec<u64>, Vec<u64>) {
        let rising: Vec<u64> = (0..cycles as u64).map(|i| start + i * period).collect();
        let falling = rising.iter().map(|r| r + width).collect();
        (rising, falling)
    }

    #[test]
    fn test_validate_edges_accepts_tolerance() {
        let (rising, mut falling) = waveform(1_000, 1_500, 5_050, 4);
        falling[2] += 10;
        let report =
            validate_edges("t", &rising, &falling, 1_500, PwmOutputPeriod::Multiplier1x, 10).unwrap();
        assert_eq!(report.widths_us, vec![1_500, 1_500, 1_510, 1_500]);
        assert_eq!(report.periods_us, vec![5_050; 3]);
    }

    #[test]
    fn test_validate_edges_reports_mismatch() {
        let (rising, falling) = waveform(0, 1_000, 10_100, 4);
        match validate_edges("t", &rising, &falling, 1_000, PwmOutputPeriod::Multiplier1x, 10) {
            Err(Error::TimingMismatch {
                what: "period",
                expected: 5_050,
                observed: 10_100,
                ..
            }) => {}
            other => panic!("Expected period mismatch, got {:?}", other),
        }
        let (rising, falling) = waveform(0, 1_020, 5_050, 4);
        assert!(matches!(
            validate_edges("t", &rising, &falling, 1_000, PwmOutputPeriod::Multiplier1x, 10),
            Err(Error::TimingMismatch { what: "pulse width", index: 0, .. })
        ));
        assert!(matches!(
            validate_edges("t", &rising[..3], &falling, 1_000, PwmOutputPeriod::Multiplier1x, 10),
            Err(Error::TimingMismatch { what: "edge count", .. })
        ));
        assert!(validate_edges("t", &[], &[], 1_000, PwmOutputPeriod::Multiplier1x, 10).is_err());
    }

    #[test]
    fn test_validate_edges_rejects_odd_count() {
        let (rising, falling) = waveform(0, 1_500, 5_050, 3);
        assert!(matches!(
            validate_edges("t", &rising, &falling, 1_500, PwmOutputPeriod::Multiplier1x, 10),
            Err(Error::TimingMismatch { what: "edge count", expected: 3, observed: 3, .. })
        ));
        let (rising, falling) = waveform(0, 1_500, 5_050, 2);
        assert!(validate_edges("t", &rising, &falling, 1_500, PwmOutputPeriod::Multiplier1x, 10).is_ok());
    }

    fn dma_capture(first_level: bool, count: usize, width: u64, period: u64) -> Vec<(u64, bool)> {
        let mut samples = Vec::new();
        let mut t = 500;
        let mut high = first_level;
        for _ in 0..count {
            samples.push((t, high));
            t += if high { width } else { period - width };
            high = !high;
        }
        samples
    }

    #[test]
    fn test_validate_dma_window() {
        let config = TimingConfig::default();
        for first_level in [true, false] {
            let samples = dma_capture(first_level, 16, 2_000, 20_200);
            let report =
                validate_dma_samples("t", &samples, 2_000, PwmOutputPeriod::Multiplier4x, &config)
                    .unwrap();
            assert_eq!(report.widths_us.len(), 4);
            assert_eq!(report.periods_us.len(), 3);
        }
    }

    #[test]
    fn test_validate_dma_rejects_stuck_level() {
        let config = TimingConfig::default();
        let samples: Vec<(u64, bool)> = (0..16).map(|i| (i * 100, false)).collect();
        assert!(matches!(
            validate_dma_samples("t", &samples, 1_000, PwmOutputPeriod::Multiplier1x, &config),
            Err(Error::TimingMismatch { what: "first high sample", .. })
        ));
        let mut samples = dma_capture(true, 16, 1_000, 5_050);
        samples[7].1 = true;
        assert!(matches!(
            validate_dma_samples("t", &samples, 1_000, PwmOutputPeriod::Multiplier1x, &config),
            Err(Error::TimingMismatch { what: "level alternation", index: 7, .. })
        ));
    }

    #[test]
    fn test_stop_guard_clears_flag() {
        let run = AtomicBool::new(true);
        {
            let _stop = StopOnDrop(&run);
        }
        assert!(!run.load(Ordering::SeqCst));
    }
}
