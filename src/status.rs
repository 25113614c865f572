//! Integer status codes and the out-parameter calling convention.
//!
//! The Rust API returns [`Result`](crate::Result). Callers that need the C-style
//! convention (an `i32` status written by every fallible call, plus a per-thread
//! "last error" message) go through [`call`]:
//!
//! ```
//! use smartio_hal::{status, Hal, HalConfig};
//!
//! let hal = Hal::new(HalConfig::default());
//! let mut code = 0;
//! let handle = status::call(&mut code, || hal.initialize_dio_port(99, true, "robot.rs:10"));
//! assert_eq!(code, status::RESOURCE_OUT_OF_RANGE);
//! assert!(!handle.is_valid());
//! assert!(status::last_error().contains("requested 99"));
//! ```

use crate::error::Result;
use log::trace;
use std::cell::RefCell;

/// Success.
pub const OK: i32 = 0;
/// Unindexed pool exhausted.
pub const NO_AVAILABLE_RESOURCES: i32 = -104;
/// Argument outside the allowed domain.
pub const PARAMETER_OUT_OF_RANGE: i32 = -1028;
/// Channel already owned.
pub const RESOURCE_IS_ALLOCATED: i32 = -1029;
/// Channel index outside the resource's range.
pub const RESOURCE_OUT_OF_RANGE: i32 = -1030;
/// Invalid, freed or wrong-typed handle.
pub const HAL_HANDLE_ERROR: i32 = -1098;
/// Operation not valid in the current mode.
pub const INCOMPATIBLE_STATE: i32 = 1015;
/// A bounded wait expired.
pub const HAL_TIMEOUT: i32 = -1099;
/// A timing measurement was outside tolerance.
pub const TIMING_VALIDATION_FAILED: i32 = -1100;

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Runs `op`, writing its status into `status` and returning the value or `T::default()`.
///
/// On failure the formatted error is stored as this thread's last error. A success
/// leaves the previous message untouched, matching the HAL's side channel.
pub fn call<T: Default>(status: &mut i32, op: impl FnOnce() -> Result<T>) -> T {
    match op() {
        Ok(value) => {
            *status = OK;
            value
        }
        Err(e) => {
            *status = e.status_code();
            trace!("Status {} recorded: {}", *status, e);
            LAST_ERROR.with(|last| *last.borrow_mut() = e.to_string());
            T::default()
        }
    }
}

/// Returns the message of the last error reported on this thread.
pub fn last_error() -> String {
    LAST_ERROR.with(|last| last.borrow().clone())
}

/// Clears this thread's last-error message.
pub fn clear_last_error() {
    LAST_ERROR.with(|last| last.borrow_mut().clear());
}

/// Short name for a status code, for log lines and diagnostics.
pub fn name(status: i32) -> &'static str {
    match status {
        OK => "OK",
        NO_AVAILABLE_RESOURCES => "NO_AVAILABLE_RESOURCES",
        PARAMETER_OUT_OF_RANGE => "PARAMETER_OUT_OF_RANGE",
        RESOURCE_IS_ALLOCATED => "RESOURCE_IS_ALLOCATED",
        RESOURCE_OUT_OF_RANGE => "RESOURCE_OUT_OF_RANGE",
        HAL_HANDLE_ERROR => "HAL_HANDLE_ERROR",
        INCOMPATIBLE_STATE => "INCOMPATIBLE_STATE",
        HAL_TIMEOUT => "HAL_TIMEOUT",
        TIMING_VALIDATION_FAILED => "TIMING_VALIDATION_FAILED",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_call_success_clears_status() {
        let mut status = -1;
        let value = call(&mut status, || Ok(7));
        assert_eq!(status, OK);
        assert_eq!(value, 7);
    }

    #[test]
    fn test_call_failure_sets_last_error() {
        clear_last_error();
        let mut status = 0;
        let value: i64 = call(&mut status, || {
            Err(Error::ParameterOutOfRange("queue depth 0".to_string()))
        });
        assert_eq!(value, 0);
        assert_eq!(status, PARAMETER_OUT_OF_RANGE);
        assert_eq!(name(status), "PARAMETER_OUT_OF_RANGE");
        assert!(last_error().contains("queue depth 0"));

        // A later success keeps the message, like the HAL side channel.
        call(&mut status, || Ok(()));
        assert_eq!(status, OK);
        assert!(last_error().contains("queue depth 0"));
    }

    #[test]
    fn test_last_error_is_per_thread() {
        let mut status = 0;
        call::<()>(&mut status, || {
            Err(Error::NoAvailableResources { resource: "DMA" })
        });
        let other = std::thread::spawn(last_error).join().unwrap();
        assert!(other.is_empty());
        assert!(last_error().contains("DMA"));
    }
}
