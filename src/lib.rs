// Catapult-Style FPGA Accelerator Host Driver
// SPDX-License-Identifier: MIT

//! # Catapult-style FPGA accelerator host driver
//!
//! This crate dispatches compute jobs to a slot-based FPGA accelerator
//! board (the PCIe shell architecture popularized by datacenter FPGA
//! deployments) over the vendor's native shell library. The board exposes
//! a fixed set of DMA buffer *slots*; each job's payload is framed, moved
//! into a slot's input buffer, executed by the hardware member it names,
//! and answered through the slot's output buffer together with the cycle
//! count the execution took.
//!
//! ## What the crate handles for you
//!
//! - **Round-robin scheduling** over all slots, with strict FIFO execution
//!   per slot and full concurrency across slots.
//! - **Slicing**: payloads larger than one slot's capacity are split into
//!   tagged slices, dispatched across the pool (batched when there are
//!   more slices than slots), and reassembled in logical order from the
//!   slice indices the device reports back.
//! - **Framing**: the fixed input/output headers, 64-byte DMA chunk
//!   padding, and the minimum-message rule, while the logical lengths in
//!   the headers always describe the unpadded payload.
//! - **Lifecycle**: PCIe reset on open, capability discovery with
//!   soft-register clamping, drain-before-teardown on close, and a `Drop`
//!   safety net so an abandoned session cannot leak the device handle.
//!
//! ## Example
//!
//! ```rust,no_run
//! use catapult_rust::{CatapultError, CatapultSession, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CatapultError> {
//!     let session = CatapultSession::open(&SessionConfig::default()).await?;
//!
//!     // Run hardware member 3 over an input payload.
//!     let input = vec![0u8; 130_000];
//!     let result = session.submit(3, &input).await?;
//!     println!(
//!         "{} output bytes in {} cycles",
//!         result.payload.len(),
//!         result.execution_time_cycles
//!     );
//!
//!     session.close().await
//! }
//! ```
//!
//! ## No hardware attached?
//!
//! [`sim::SimDriver`] implements the same driver capability set in
//! software, so the full submission pipeline (scheduling, slicing,
//! framing, reassembly) runs unmodified in tests, benchmarks and demos:
//!
//! ```rust
//! # use std::sync::Arc;
//! # use catapult_rust::sim::{SimDriver, SimOptions};
//! # use catapult_rust::CatapultSession;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), catapult_rust::CatapultError> {
//! let driver = Arc::new(SimDriver::new(SimOptions::default()));
//! let session = CatapultSession::with_driver(driver).await?;
//! let result = session.submit(1, b"hello, shell").await?;
//! assert_eq!(&result.payload[..12], b"hello, shell");
//! session.close().await
//! # }
//! ```

// Module declarations
pub mod driver;
pub mod error;
pub mod ffi;
pub mod frame;
pub mod regs;
mod scheduler;
pub mod session;
pub mod sim;
mod slice;
mod slot;

// Re-exports for convenient access
pub use driver::{Driver, DriverResult, DriverStatus, WaitFlags};
pub use error::{CatapultError, CatapultResult};
pub use ffi::FpgaCoreLib;
pub use session::{CatapultSession, ExecutionResult, SessionConfig};
