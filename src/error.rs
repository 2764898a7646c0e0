// Catapult-Style FPGA Accelerator Host Driver
// SPDX-License-Identifier: MIT

//! Error types for accelerator operations.

use crate::driver::DriverStatus;
use thiserror::Error;

/// Errors that can occur while talking to the accelerator.
#[derive(Debug, Error)]
pub enum CatapultError {
    /// A native driver call returned a non-success, non-timeout status.
    ///
    /// Fatal to the job that triggered it, not to the session.
    #[error("driver call {call} failed: {status}: {message}")]
    Driver {
        call: &'static str,
        status: DriverStatus,
        message: String,
    },

    /// A bounded driver wait elapsed without the device responding.
    ///
    /// Retryable: the slot is still usable and the caller may resubmit.
    #[error("wait on slot {slot} timed out after {timeout_ms} ms")]
    WaitTimeout { slot: usize, timeout_ms: u32 },

    /// The session has been disposed; its handle is inert.
    #[error("session is closed")]
    SessionClosed,

    /// Capability discovery reported a geometry the host cannot use.
    #[error("device reported unusable geometry: {0}")]
    InvalidDevice(String),

    /// An output frame was too short to carry its header.
    #[error("malformed device response: {0}")]
    MalformedResponse(String),

    /// The vendor shell library could not be loaded or is missing symbols.
    #[error("failed to load device library: {0}")]
    Library(#[from] libloading::Error),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking driver call could not be joined (runtime shutdown).
    #[error("blocking driver call aborted: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

impl CatapultError {
    /// Returns true if the operation may be retried as-is.
    ///
    /// Only wait timeouts are retryable; every other error either poisons
    /// the job's input or indicates a broken session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WaitTimeout { .. })
    }
}

/// Result type alias for accelerator operations.
pub type CatapultResult<T> = Result<T, CatapultError>;
