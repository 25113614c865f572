use crate::handle::Handle;
use crate::smartio::SmartIoMode;
use crate::status;
use thiserror::Error;

/// Errors that can occur when allocating or operating SmartIo resources.
///
/// Every variant maps onto one of the integer HAL status codes through
/// [`Error::status_code`], so callers using the out-parameter convention in
/// [`crate::status`] see the same codes a C caller would.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Channel index outside the valid range for the resource type.
    #[error("Invalid index for {resource}: minimum {min}, maximum {max}, requested {channel}")]
    ResourceOutOfRange {
        /// Human-readable resource name (e.g. "DIO").
        resource: &'static str,
        /// The offending channel value.
        channel: i32,
        /// Lowest valid channel.
        min: i32,
        /// Highest valid channel.
        max: i32,
    },
    /// The channel (or a peripheral sharing its pin) is already owned.
    #[error(
        "{resource} {channel} previously allocated.\nLocation of the previous allocation:\n{previous_allocation}"
    )]
    ResourceIsAllocated {
        /// Resource the caller tried to allocate.
        resource: &'static str,
        /// Channel that is already in use.
        channel: i32,
        /// Origin string recorded by the current owner.
        previous_allocation: String,
    },
    /// Handle is invalid, freed, or of the wrong type.
    #[error("Invalid or freed handle 0x{:08X}", .handle.raw())]
    HandleError {
        /// The handle that failed to resolve.
        handle: Handle,
    },
    /// Operation is not valid in the channel's current mode.
    #[error("Channel {channel} is in mode {mode:?}; {operation} is not supported in this mode")]
    IncompatibleState {
        /// Channel the operation targeted.
        channel: u8,
        /// Mode the channel was in.
        mode: SmartIoMode,
        /// Name of the rejected operation.
        operation: &'static str,
    },
    /// Argument is outside the allowed domain.
    #[error("Parameter out of range: {0}")]
    ParameterOutOfRange(String),
    /// An unindexed pool (interrupts, DMA) has no free slot.
    #[error("No available resources to allocate {resource}")]
    NoAvailableResources {
        /// Pool that was exhausted.
        resource: &'static str,
    },
    /// DMA operation rejected because the engine is running (or stopped).
    #[error("Cannot {operation} while DMA is {state}")]
    DmaState {
        /// Name of the rejected operation.
        operation: &'static str,
        /// "running" or "stopped".
        state: &'static str,
    },
    /// A blocking DMA read did not produce a sample in time.
    #[error("DMA read timed out after {timeout_ms} ms (sample {index} of {expected})")]
    DmaTimeout {
        /// Timeout applied to the read.
        timeout_ms: u64,
        /// Index of the sample being read.
        index: usize,
        /// Number of samples the trial needed.
        expected: usize,
    },
    /// The timing harness did not observe enough edges before its deadline.
    #[error(
        "Timing trial ({trial}) timed out after {timeout_ms} ms: saw {rising} rising and {falling} falling edges"
    )]
    TrialTimeout {
        /// Description of the trial parameters.
        trial: String,
        /// Deadline applied to the trial.
        timeout_ms: u64,
        /// Rising edges collected before the deadline.
        rising: usize,
        /// Falling edges collected before the deadline.
        falling: usize,
    },
    /// A measured edge sequence did not match the commanded waveform.
    #[error("Timing trial ({trial}) failed: {what} at index {index}: expected {expected} us, observed {observed} us")]
    TimingMismatch {
        /// Description of the trial parameters.
        trial: String,
        /// Which measurement failed (pulse width, period, alternation...).
        what: &'static str,
        /// Index of the offending sample or edge pair.
        index: usize,
        /// Expected value in microseconds.
        expected: i64,
        /// Observed value in microseconds.
        observed: i64,
    },
}

/// Result type alias for SmartIo operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HAL status code reported through the out-parameter convention.
    pub fn status_code(&self) -> i32 {
        match self {
            Error::ResourceOutOfRange { .. } => status::RESOURCE_OUT_OF_RANGE,
            Error::ResourceIsAllocated { .. } => status::RESOURCE_IS_ALLOCATED,
            Error::HandleError { .. } => status::HAL_HANDLE_ERROR,
            Error::IncompatibleState { .. } | Error::DmaState { .. } => status::INCOMPATIBLE_STATE,
            Error::ParameterOutOfRange(_) => status::PARAMETER_OUT_OF_RANGE,
            Error::NoAvailableResources { .. } => status::NO_AVAILABLE_RESOURCES,
            Error::DmaTimeout { .. } | Error::TrialTimeout { .. } => status::HAL_TIMEOUT,
            Error::TimingMismatch { .. } => status::TIMING_VALIDATION_FAILED,
        }
    }
}

// Helpers for the errors raised from many call sites
pub(crate) fn handle_error(handle: impl Into<Handle>) -> Error {
    Error::HandleError {
        handle: handle.into(),
    }
}

pub(crate) fn incompatible(channel: u8, mode: SmartIoMode, operation: &'static str) -> Error {
    Error::IncompatibleState {
        channel,
        mode,
        operation,
    }
}
