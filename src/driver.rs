// Catapult-Style FPGA Accelerator Host Driver
// SPDX-License-Identifier: MIT

//! The native driver capability set.
//!
//! Everything the core consumes from the vendor shell library is modeled by
//! the [`Driver`] trait: register access, buffer topology queries, and the
//! send/wait/discard primitives that move bytes through a slot's DMA buffer
//! pair. The production implementation is [`crate::ffi::FpgaCoreLib`]; the
//! in-process software device is [`crate::sim::SimDriver`].
//!
//! All status-returning vendor calls surface their status through
//! [`DriverStatus`]; the human-readable error text is fetched separately via
//! [`Driver::last_error_text`] so that only failing calls pay for it.

use bitflags::bitflags;

/// Status codes returned by the native shell library.
///
/// The wait-timeout code is deliberately distinguished from the failure
/// codes: a timed-out wait is a retryable condition, everything else is
/// fatal to the job that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    /// Call completed successfully.
    Success,
    /// The device handle is invalid or already closed.
    InvalidHandle,
    /// The requested PCIe endpoint does not exist.
    IllegalEndpoint,
    /// Host-side buffer allocation or mapping failed.
    MemoryError,
    /// Register index out of range for this shell.
    IllegalRegister,
    /// Slot index out of range for this shell.
    IllegalSlot,
    /// A DMA transfer could not be started or was aborted.
    TransferError,
    /// A bounded wait elapsed before the device responded.
    WaitTimeout,
    /// The shell reported an internal hardware error.
    HardwareError,
    /// Status code not known to this binding.
    Unknown(u32),
}

impl DriverStatus {
    /// Decode a raw status word from the vendor library.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x00 => Self::Success,
            0x01 => Self::InvalidHandle,
            0x02 => Self::IllegalEndpoint,
            0x03 => Self::MemoryError,
            0x04 => Self::IllegalRegister,
            0x05 => Self::IllegalSlot,
            0x06 => Self::TransferError,
            0x07 => Self::WaitTimeout,
            0x08 => Self::HardwareError,
            other => Self::Unknown(other),
        }
    }

    /// Returns the raw status word.
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Success => 0x00,
            Self::InvalidHandle => 0x01,
            Self::IllegalEndpoint => 0x02,
            Self::MemoryError => 0x03,
            Self::IllegalRegister => 0x04,
            Self::IllegalSlot => 0x05,
            Self::TransferError => 0x06,
            Self::WaitTimeout => 0x07,
            Self::HardwareError => 0x08,
            Self::Unknown(raw) => raw,
        }
    }

    /// Returns a human-readable name for the status.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::InvalidHandle => "INVALID_HANDLE",
            Self::IllegalEndpoint => "ILLEGAL_ENDPOINT",
            Self::MemoryError => "MEMORY_ERROR",
            Self::IllegalRegister => "ILLEGAL_REGISTER",
            Self::IllegalSlot => "ILLEGAL_SLOT",
            Self::TransferError => "TRANSFER_ERROR",
            Self::WaitTimeout => "WAIT_TIMEOUT",
            Self::HardwareError => "HARDWARE_ERROR",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Convert into a `Result`, treating everything but `Success` as an
    /// error status.
    pub fn into_result(self) -> DriverResult<()> {
        match self {
            Self::Success => Ok(()),
            status => Err(status),
        }
    }

    /// Returns true if this status is the retryable wait-timeout code.
    #[inline]
    pub fn is_timeout(self) -> bool {
        matches!(self, Self::WaitTimeout)
    }
}

impl std::fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_raw())
    }
}

/// Result of a native driver call; the error side carries the non-success
/// status.
pub type DriverResult<T> = Result<T, DriverStatus>;

bitflags! {
    /// Mode flags for [`Driver::wait_output_buffer`].
    ///
    /// An empty set selects polled waiting, used for the short post-send
    /// acknowledgment wait. `INTERRUPT` selects interrupt-driven waiting,
    /// used for the long result wait whose duration depends on the
    /// workload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitFlags: u32 {
        /// Sleep on the device interrupt instead of polling.
        const INTERRUPT = 1 << 0;
    }
}

/// Capability set of an opened accelerator device.
///
/// Implementations must be safe to call from multiple threads; the vendor
/// library serializes per-slot operations internally, and the host core
/// additionally guarantees that at most one job drives a given slot at a
/// time. [`wait_output_buffer`](Self::wait_output_buffer) may block the
/// calling thread; the core only ever invokes it from a blocking-capable
/// thread.
pub trait Driver: Send + Sync {
    /// Number of 32-bit shell registers exposed by this shell.
    fn shell_register_count(&self) -> DriverResult<u32>;

    /// Read a 32-bit shell register.
    fn read_shell_register(&self, index: u32) -> DriverResult<u32>;

    /// Write a 32-bit shell register.
    fn write_shell_register(&self, index: u32, value: u32) -> DriverResult<()>;

    /// Read a 64-bit soft register of the loaded role.
    fn read_soft_register(&self, index: u32) -> DriverResult<u64>;

    /// Write a 64-bit soft register of the loaded role.
    fn write_soft_register(&self, index: u32, value: u64) -> DriverResult<()>;

    /// Number of physical input/output DMA buffer pairs.
    fn buffer_count(&self) -> DriverResult<u32>;

    /// Size in bytes of one DMA buffer.
    fn buffer_size(&self) -> DriverResult<u32>;

    /// Whether the slot's input buffer still holds an unconsumed frame.
    ///
    /// True is an expected transient: the device may not have drained the
    /// previous job's input yet even though the host-side task completed.
    fn input_buffer_full(&self, slot: usize) -> DriverResult<bool>;

    /// Copy a framed message into the slot's input DMA region.
    fn fill_input_buffer(&self, slot: usize, frame: &[u8]) -> DriverResult<()>;

    /// Hand the slot's input buffer to the device with the given byte
    /// length.
    fn send_input_buffer(&self, slot: usize, len: u32) -> DriverResult<()>;

    /// Wait until the slot's output buffer holds a message, returning its
    /// byte length.
    ///
    /// May block up to `timeout_ms`; a `WaitTimeout` status means the
    /// device did not respond in time, not that the call failed.
    fn wait_output_buffer(&self, slot: usize, timeout_ms: u32, flags: WaitFlags)
        -> DriverResult<u32>;

    /// Copy `len` bytes out of the slot's output DMA region.
    fn read_output_buffer(&self, slot: usize, len: usize) -> DriverResult<Vec<u8>>;

    /// Release the slot's output buffer back to the device.
    fn discard_output_buffer(&self, slot: usize) -> DriverResult<()>;

    /// Human-readable text for the most recent failure.
    fn last_error_text(&self) -> String;

    /// Close the device handle. Further calls return `InvalidHandle`.
    fn close(&self) -> DriverResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for raw in 0x00..=0x08u32 {
            assert_eq!(DriverStatus::from_raw(raw).as_raw(), raw);
        }
        assert_eq!(DriverStatus::from_raw(0xBEEF), DriverStatus::Unknown(0xBEEF));
        assert_eq!(DriverStatus::Unknown(0xBEEF).as_raw(), 0xBEEF);
    }

    #[test]
    fn test_timeout_is_distinguished() {
        assert!(DriverStatus::WaitTimeout.is_timeout());
        assert!(!DriverStatus::TransferError.is_timeout());
        assert!(DriverStatus::Success.into_result().is_ok());
        assert_eq!(
            DriverStatus::HardwareError.into_result(),
            Err(DriverStatus::HardwareError)
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(
            format!("{}", DriverStatus::WaitTimeout),
            "WAIT_TIMEOUT (0x07)"
        );
        assert_eq!(format!("{}", DriverStatus::Success), "SUCCESS (0x00)");
    }
}
