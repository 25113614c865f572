//! DMA capture of digital sources.
//!
//! A started DMA engine takes a sample whenever one of its sources changes
//! level. Each sample holds the FPGA timestamp of the change and the level of
//! every source at that instant. Samples queue in a fixed-depth ring; when the
//! ring is full the oldest sample is dropped.

use crate::consts::topic;
use crate::error::{handle_error, Error, Result};
use crate::hal::Hal;
use crate::handle::{DigitalHandle, DmaHandle, HandleKind};
use crate::registry::PortRef;
use crate::transport::{ListenerId, Value};
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Status part of a [`Hal::read_dma`] result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaReadStatus {
    Ok,
    Timeout,
}

/// One captured sample.
#[derive(Debug, Clone, PartialEq)]
pub struct DmaSample {
    time_us: u64,
    levels: Vec<(DigitalHandle, bool)>,
}

impl DmaSample {
    /// FPGA time of the sample in microseconds.
    pub fn time_us(&self) -> u64 {
        self.time_us
    }

    /// Level of `source` in this sample.
    pub fn digital_source(&self, source: &DigitalHandle) -> Result<bool> {
        self.levels
            .iter()
            .find(|(handle, _)| handle == source)
            .map(|(_, level)| *level)
            .ok_or_else(|| handle_error(*source))
    }
}

#[derive(Debug)]
struct DmaState {
    sources: Vec<(DigitalHandle, u8)>,
    levels: Vec<bool>,
    listeners: Vec<ListenerId>,
    running: bool,
    depth: usize,
    ring: VecDeque<DmaSample>,
}

impl DmaState {
    fn state_name(&self) -> &'static str {
        if self.running {
            "running"
        } else {
            "stopped"
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<DmaState>,
    samples: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DmaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_level(&self, source: usize, level: bool, time_us: u64) {
        let mut state = self.lock();
        if !state.running {
            return;
        }
        match state.levels.get_mut(source) {
            Some(current) if *current != level => *current = level,
            _ => return,
        }
        let sample = DmaSample {
            time_us,
            levels: state
                .sources
                .iter()
                .zip(&state.levels)
                .map(|((handle, _), level)| (*handle, *level))
                .collect(),
        };
        if state.ring.len() >= state.depth {
            state.ring.pop_front();
            trace!("DMA ring full, dropped oldest sample");
        }
        state.ring.push_back(sample);
        self.samples.notify_all();
    }
}

/// One DMA engine.
#[derive(Debug)]
pub(crate) struct Dma {
    shared: Arc<Shared>,
}

impl Dma {
    fn new() -> Self {
        Dma {
            shared: Arc::new(Shared {
                state: Mutex::new(DmaState {
                    sources: Vec::new(),
                    levels: Vec::new(),
                    listeners: Vec::new(),
                    running: false,
                    depth: 0,
                    ring: VecDeque::new(),
                }),
                samples: Condvar::new(),
            }),
        }
    }
}

fn level_of(value: Option<Value>) -> bool {
    matches!(value, Some(Value::Integer(v)) if v != 0)
}

impl Hal {
    fn dma_engine(&self, dma: DmaHandle) -> Result<PortRef<Dma>> {
        self.dma
            .get(dma.0, HandleKind::Dma)
            .ok_or_else(|| handle_error(dma))
    }

    /// Allocates a DMA engine.
    pub fn initialize_dma(&self) -> Result<DmaHandle> {
        let (handle, _) = self
            .dma
            .allocate_next(HandleKind::Dma, "", |_| Dma::new())?;
        debug!("DMA {} allocated", handle.index());
        Ok(DmaHandle(handle))
    }

    /// Adds a digital channel to the engine's sample. Only allowed while stopped.
    pub fn add_dma_digital_source(&self, dma: DmaHandle, source: &DigitalHandle) -> Result<()> {
        let engine = self.dma_engine(dma)?;
        let channel = self.get_dio_channel(*source)?;
        let mut state = engine.shared.lock();
        if state.running {
            return Err(Error::DmaState {
                operation: "add a source",
                state: state.state_name(),
            });
        }
        if state.sources.iter().any(|(handle, _)| handle == source) {
            return Ok(());
        }
        state.sources.push((*source, channel));
        debug!("DMA {} samples DIO {}", dma.0.index(), channel);
        Ok(())
    }

    /// Starts capturing into a ring of `queue_depth` samples.
    ///
    /// Listeners are attached before the source levels are read, so a change
    /// published while starting is either in the initial levels or sampled.
    pub fn start_dma(&self, dma: DmaHandle, queue_depth: usize) -> Result<()> {
        let engine = self.dma_engine(dma)?;
        let sources = {
            let state = engine.shared.lock();
            if state.running {
                return Err(Error::DmaState {
                    operation: "start",
                    state: state.state_name(),
                });
            }
            if queue_depth == 0 {
                return Err(Error::ParameterOutOfRange(
                    "DMA queue depth must be at least 1".to_string(),
                ));
            }
            if state.sources.is_empty() {
                return Err(Error::ParameterOutOfRange(
                    "DMA has no sources to sample".to_string(),
                ));
            }
            state.sources.clone()
        };

        let listeners: Vec<ListenerId> = sources
            .iter()
            .enumerate()
            .map(|(index, (_, channel))| {
                let shared = Arc::clone(&engine.shared);
                self.store()
                    .add_listener(&topic::io(*channel, topic::VALUE_GET), move |_, value, time_us| {
                        if let Value::Integer(v) = value {
                            shared.on_level(index, *v != 0, time_us);
                        }
                    })
            })
            .collect();

        let mut state = engine.shared.lock();
        if state.running {
            // Another caller started the engine while the listeners were attached.
            drop(state);
            for listener in listeners {
                self.store().remove_listener(listener);
            }
            return Err(Error::DmaState {
                operation: "start",
                state: "running",
            });
        }
        state.levels = sources
            .iter()
            .map(|(_, ch)| {
                level_of(
                    self.store()
                        .get_value(&topic::io(*ch, topic::VALUE_GET))
                        .map(|v| v.value),
                )
            })
            .collect();
        state.depth = queue_depth;
        state.ring.clear();
        state.listeners = listeners;
        state.running = true;
        drop(state);
        debug!(
            "DMA {} started: {} source(s), depth {}",
            dma.0.index(),
            sources.len(),
            queue_depth
        );
        Ok(())
    }

    /// Takes the oldest sample, waiting up to `timeout` for one to arrive.
    ///
    /// Returns the status, the sample (if any) and the number still queued.
    pub fn read_dma(
        &self,
        dma: DmaHandle,
        timeout: Duration,
    ) -> Result<(DmaReadStatus, Option<DmaSample>, usize)> {
        let engine = self.dma_engine(dma)?;
        let shared = &engine.shared;
        let state = shared.lock();
        if !state.running {
            return Err(Error::DmaState {
                operation: "read",
                state: state.state_name(),
            });
        }
        let (mut state, _) = shared
            .samples
            .wait_timeout_while(state, timeout, |s| s.ring.is_empty() && s.running)
            .unwrap_or_else(PoisonError::into_inner);
        match state.ring.pop_front() {
            Some(sample) => Ok((DmaReadStatus::Ok, Some(sample), state.ring.len())),
            None => Ok((DmaReadStatus::Timeout, None, 0)),
        }
    }

    /// Stops capturing. Queued samples are discarded.
    pub fn stop_dma(&self, dma: DmaHandle) -> Result<()> {
        let engine = self.dma_engine(dma)?;
        self.halt_dma(&engine);
        debug!("DMA {} stopped", dma.0.index());
        Ok(())
    }

    fn halt_dma(&self, engine: &Dma) {
        let listeners = {
            let mut state = engine.shared.lock();
            state.running = false;
            state.ring.clear();
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners {
            self.store().remove_listener(listener);
        }
        engine.shared.samples.notify_all();
    }

    /// Stops and frees the engine. Stale handles are ignored.
    pub fn free_dma(&self, dma: DmaHandle) {
        if let Ok(engine) = self.dma_engine(dma) {
            self.halt_dma(&engine);
        }
        if self.dma.free(dma.0, HandleKind::Dma) {
            debug!("DMA {} freed", dma.0.index());
        }
    }
}
