// Catapult-Style FPGA Accelerator Host Driver
// SPDX-License-Identifier: MIT

//! Device session lifecycle and the job submission API.
//!
//! A [`CatapultSession`] owns the device handle for its whole lifetime:
//! it resets and configures the shell on construction, discovers the slot
//! geometry, spawns one worker per slot, and exposes
//! [`submit`](CatapultSession::submit) as the sole way to run a hardware
//! member. Disposal drains every slot before tearing the handle down, and a
//! `Drop` safety net closes the handle if the owner forgets.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use scopeguard::ScopeGuard;
use tokio::sync::{mpsc, oneshot};

use crate::driver::{Driver, DriverStatus};
use crate::error::{CatapultError, CatapultResult};
use crate::ffi::FpgaCoreLib;
use crate::frame::{CHUNK_BYTES, INPUT_HEADER_BYTES};
use crate::regs::{
    ShellControl, SHELL_CONTROL_REGISTER, SOFT_ALLOWED_SLOTS, SOFT_BUFFER_PAYLOAD_SIZE,
};
use crate::scheduler::SlotScheduler;
use crate::slice;
use crate::slot::{Job, SlotWorker};

/// Configuration consumed once at session construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Path or name of the vendor shell library to load.
    pub library_path: PathBuf,
    /// PCIe endpoint number of the board to open.
    pub endpoint: u32,
    /// Optional version-definitions file handed to the vendor library.
    pub version_definitions: Option<PathBuf>,
    /// Optional version-manifest file handed to the vendor library.
    pub version_manifest: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            library_path: PathBuf::from("FPGACoreLib"),
            endpoint: 0,
            version_definitions: None,
            version_manifest: None,
        }
    }
}

/// Output of one completed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Device clock cycles the member spent executing.
    pub execution_time_cycles: u64,
    /// Logically ordered output bytes.
    pub payload: Vec<u8>,
}

impl ExecutionResult {
    /// Wall-clock execution time at the given device clock frequency.
    pub fn execution_time(&self, clock_hz: u64) -> Duration {
        if clock_hz == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(
            self.execution_time_cycles
                .saturating_mul(1_000_000_000)
                / clock_hz,
        )
    }
}

/// An open accelerator session.
///
/// Safe to share behind an `Arc` and to call from many tasks at once; each
/// `submit` independently round-robins over the slot pool.
pub struct CatapultSession {
    driver: Arc<dyn Driver>,
    scheduler: SlotScheduler,
    slot_count: usize,
    slot_payload_capacity: usize,
    shell_register_count: u32,
    closed: AtomicBool,
}

impl CatapultSession {
    /// Open a session against the vendor shell library named in `config`.
    pub async fn open(config: &SessionConfig) -> CatapultResult<Self> {
        let driver = Arc::new(FpgaCoreLib::load(config)?);
        Self::with_driver(driver).await
    }

    /// Open a session over any [`Driver`] implementation.
    ///
    /// The session takes over the handle's lifecycle: if construction fails
    /// partway, the handle is closed before the error is returned.
    pub async fn with_driver(driver: Arc<dyn Driver>) -> CatapultResult<Self> {
        // Until construction succeeds, this guard owns handle teardown.
        let guard = scopeguard::guard(Arc::clone(&driver), |driver| {
            if let Err(status) = driver.close() {
                warn!("closing device handle after failed setup: {status}");
            }
        });

        // Known-good reset: drop PCIe access, then re-enable it.
        let control = check(&*driver, "ReadShellRegister", driver.read_shell_register(SHELL_CONTROL_REGISTER))?;
        check(
            &*driver,
            "WriteShellRegister",
            driver.write_shell_register(
                SHELL_CONTROL_REGISTER,
                control & !ShellControl::PCIE_ENABLED.bits(),
            ),
        )?;
        check(
            &*driver,
            "WriteShellRegister",
            driver.write_shell_register(
                SHELL_CONTROL_REGISTER,
                control | ShellControl::PCIE_ENABLED.bits(),
            ),
        )?;

        let shell_register_count =
            check(&*driver, "GetNumberShellRegisters", driver.shell_register_count())?;
        let raw_count = check(&*driver, "GetNumberBuffers", driver.buffer_count())?;
        let raw_size = check(&*driver, "GetBufferSize", driver.buffer_size())?;
        let allowed_slots =
            check(&*driver, "ReadSoftRegister", driver.read_soft_register(SOFT_ALLOWED_SLOTS))?;
        let payload_size_reg = check(
            &*driver,
            "ReadSoftRegister",
            driver.read_soft_register(SOFT_BUFFER_PAYLOAD_SIZE),
        )?;

        let (slot_count, slot_payload_capacity) =
            effective_geometry(raw_count, raw_size, allowed_slots, payload_size_reg)?;

        let mut senders = Vec::with_capacity(slot_count);
        for index in 0..slot_count {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = SlotWorker::new(index, Arc::clone(&driver), rx);
            tokio::spawn(worker.run());
            senders.push(tx);
        }

        // Construction succeeded; the session owns teardown from here on.
        let driver = ScopeGuard::into_inner(guard);
        info!(
            "session open: {slot_count} slots x {slot_payload_capacity} byte payloads \
             ({raw_count} raw buffers of {raw_size} bytes, {shell_register_count} shell registers)",
        );

        Ok(Self {
            driver,
            scheduler: SlotScheduler::new(senders),
            slot_count,
            slot_payload_capacity,
            shell_register_count,
            closed: AtomicBool::new(false),
        })
    }

    /// Number of usable slots.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Maximum payload bytes one slot carries per frame.
    pub fn slot_payload_capacity(&self) -> usize {
        self.slot_payload_capacity
    }

    /// Number of 32-bit shell registers the shell reported.
    pub fn shell_register_count(&self) -> u32 {
        self.shell_register_count
    }

    /// Run the hardware member `member_id` over `payload`, returning the
    /// device's output and the execution time it reported.
    ///
    /// Payloads larger than one slot's capacity are transparently sliced
    /// across slots and the responses reassembled in logical order.
    pub async fn submit(&self, member_id: u32, payload: &[u8]) -> CatapultResult<ExecutionResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CatapultError::SessionClosed);
        }
        slice::submit(&self.scheduler, self.slot_payload_capacity, member_id, payload).await
    }

    /// Wait until every job queued on every slot has completed.
    pub async fn drain(&self) -> CatapultResult<()> {
        let mut pending = Vec::with_capacity(self.slot_count);
        for slot in 0..self.slot_count {
            let (done, rx) = oneshot::channel();
            self.scheduler.assign_to(slot, Job::Drain { done })?;
            pending.push(rx);
        }
        for rx in pending {
            rx.await.map_err(|_| CatapultError::SessionClosed)?;
        }
        Ok(())
    }

    /// Dispose of the session: drain all slots, disable PCIe access, and
    /// close the device handle.
    ///
    /// Idempotent; a second call is a no-op. Drain and PCIe-disable errors
    /// are swallowed (teardown is best-effort), but a failure to close the
    /// handle itself is surfaced.
    pub async fn close(&self) -> CatapultResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(err) = self.drain().await {
            warn!("drain during close failed: {err}");
        }
        for slot in 0..self.slot_count {
            let _ = self.scheduler.assign_to(slot, Job::Shutdown);
        }
        self.teardown_handle(true)
    }

    /// Disable PCIe access (best effort) and close the handle.
    fn teardown_handle(&self, surface_close_error: bool) -> CatapultResult<()> {
        match self.driver.read_shell_register(SHELL_CONTROL_REGISTER) {
            Ok(control) => {
                if let Err(status) = self.driver.write_shell_register(
                    SHELL_CONTROL_REGISTER,
                    control & !ShellControl::PCIE_ENABLED.bits(),
                ) {
                    warn!("disabling PCIe access failed: {status}");
                }
            }
            Err(status) => warn!("reading shell control register failed: {status}"),
        }
        match self.driver.close() {
            Ok(()) => Ok(()),
            Err(status) if surface_close_error => {
                Err(driver_error(&*self.driver, "CloseHandle", status))
            }
            Err(status) => {
                warn!("closing device handle failed: {status}");
                Ok(())
            }
        }
    }
}

impl Drop for CatapultSession {
    /// Safety net for owners that never called [`close`](Self::close):
    /// the handle is torn down best-effort so it cannot leak. Unlike a
    /// graceful close, no drain is possible here.
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("session dropped without close(); tearing down device handle");
        for slot in 0..self.slot_count {
            let _ = self.scheduler.assign_to(slot, Job::Shutdown);
        }
        let _ = self.teardown_handle(false);
    }
}

/// Clamp the raw device geometry by the soft-register limits.
///
/// The device may expose more physical capacity than should be used; the
/// soft registers only ever shrink the geometry, never grow it, and a zero
/// register means it was never programmed. The per-slot payload capacity is
/// the buffer size minus the input header, rounded down to the DMA chunk.
fn effective_geometry(
    raw_count: u32,
    raw_size: u32,
    allowed_slots: u64,
    payload_size_reg: u64,
) -> CatapultResult<(usize, usize)> {
    let mut slot_count = raw_count as usize;
    if allowed_slots != 0 {
        slot_count = slot_count.min(allowed_slots as usize);
    }
    if slot_count == 0 {
        return Err(CatapultError::InvalidDevice(
            "device reports zero usable buffer slots".to_string(),
        ));
    }

    let raw_size = raw_size as usize;
    if raw_size <= INPUT_HEADER_BYTES {
        return Err(CatapultError::InvalidDevice(format!(
            "buffer size of {raw_size} bytes cannot hold the {INPUT_HEADER_BYTES} byte header",
        )));
    }
    let mut capacity = raw_size - INPUT_HEADER_BYTES;
    if payload_size_reg != 0 {
        capacity = capacity.min(payload_size_reg as usize);
    }
    capacity -= capacity % CHUNK_BYTES;
    if capacity == 0 {
        return Err(CatapultError::InvalidDevice(format!(
            "effective payload capacity below one {CHUNK_BYTES} byte chunk",
        )));
    }
    Ok((slot_count, capacity))
}

fn check<T>(
    driver: &dyn Driver,
    call: &'static str,
    result: Result<T, DriverStatus>,
) -> CatapultResult<T> {
    result.map_err(|status| driver_error(driver, call, status))
}

fn driver_error(driver: &dyn Driver, call: &'static str, status: DriverStatus) -> CatapultError {
    CatapultError::Driver {
        call,
        status,
        message: driver.last_error_text(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{cell_count, CELL_BYTES};
    use crate::sim::{Fault, SimDriver, SimEvent, SimOptions};

    fn options(buffer_count: u32, buffer_size: u32) -> SimOptions {
        SimOptions {
            buffer_count,
            buffer_size,
            ..SimOptions::default()
        }
    }

    async fn session_over(options: SimOptions) -> (Arc<SimDriver>, CatapultSession) {
        let driver = Arc::new(SimDriver::new(options));
        let session = CatapultSession::with_driver(Arc::clone(&driver) as Arc<dyn Driver>)
            .await
            .unwrap();
        (driver, session)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_effective_geometry_clamps_down_only() {
        // Unprogrammed soft registers leave the raw geometry in place.
        let (slots, cap) = effective_geometry(8, 4096, 0, 0).unwrap();
        assert_eq!(slots, 8);
        assert_eq!(cap, (4096 - INPUT_HEADER_BYTES) / CHUNK_BYTES * CHUNK_BYTES);

        // Soft registers clamp downward.
        let (slots, cap) = effective_geometry(8, 65_536, 4, 64_000).unwrap();
        assert_eq!(slots, 4);
        assert_eq!(cap, 64_000);

        // ...but never upward.
        let (slots, cap) = effective_geometry(4, 4096, 64, 1 << 30).unwrap();
        assert_eq!(slots, 4);
        assert!(cap <= 4096 - INPUT_HEADER_BYTES);
    }

    #[test]
    fn test_effective_geometry_rejects_unusable_devices() {
        assert!(effective_geometry(0, 4096, 0, 0).is_err());
        assert!(effective_geometry(4, INPUT_HEADER_BYTES as u32, 0, 0).is_err());
        assert!(effective_geometry(4, 4096, 0, 16).is_err());
    }

    #[tokio::test]
    async fn test_open_performs_pcie_reset_sequence() {
        let (driver, session) = session_over(SimOptions::default()).await;
        let writes = driver.shell_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0, SHELL_CONTROL_REGISTER);
        assert_eq!(writes[0].1 & ShellControl::PCIE_ENABLED.bits(), 0);
        assert_ne!(writes[1].1 & ShellControl::PCIE_ENABLED.bits(), 0);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_frame_submit() {
        let (driver, session) = session_over(SimOptions::default()).await;
        let payload = patterned(512);
        let result = session.submit(3, &payload).await.unwrap();
        assert_eq!(result.payload, payload);
        // Exactly one frame crossed the wire.
        assert_eq!(
            driver
                .events()
                .iter()
                .filter(|e| matches!(e, SimEvent::Send { .. }))
                .count(),
            1
        );
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_round_robin_over_sequential_submits() {
        let (driver, session) = session_over(options(4, 4096)).await;
        for i in 0..8 {
            session.submit(1, &patterned(64 + i)).await.unwrap();
        }
        let slots: Vec<usize> = driver
            .events()
            .iter()
            .filter_map(|e| match e {
                SimEvent::Send { slot, .. } => Some(*slot),
                _ => None,
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 0, 1, 2, 3]);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sliced_submit_reassembles() {
        // 4 slots of 64 000 payload bytes; 130 000 bytes => 3 slices.
        let (driver, session) = session_over(options(4, 64_016)).await;
        assert_eq!(session.slot_payload_capacity(), 64_000);
        let payload = patterned(130_000);
        let result = session.submit(2, &payload).await.unwrap();
        assert_eq!(result.payload.len(), cell_count(130_000) as usize * CELL_BYTES);
        assert_eq!(result.payload, payload);
        assert_eq!(
            driver
                .events()
                .iter()
                .filter(|e| matches!(e, SimEvent::Send { .. }))
                .count(),
            3
        );
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_overflow_sends_before_collecting() {
        // 2 slots of 1024 payload bytes; 5 000 bytes => 5 slices > 2 slots.
        let (driver, session) = session_over(options(2, 1040)).await;
        assert_eq!(session.slot_payload_capacity(), 1024);
        let payload = patterned(5_000);
        let result = session.submit(1, &payload).await.unwrap();
        assert_eq!(result.payload, payload);

        let events = driver.events();
        let last_send = events
            .iter()
            .rposition(|e| matches!(e, SimEvent::Send { .. }))
            .unwrap();
        let first_collect = events
            .iter()
            .position(|e| matches!(e, SimEvent::Collect { .. }))
            .unwrap();
        assert!(
            last_send < first_collect,
            "all sends must complete before any response is collected"
        );
        // Never more blocked response waiters than slots.
        assert!(driver.max_concurrent_result_waiters() <= 2);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_on_one_slot_leaves_others_usable() {
        let (driver, session) = session_over(options(2, 4096)).await;
        driver.inject_fault(0, Fault::FailSend(DriverStatus::HardwareError));

        // First submit round-robins onto slot 0 and hits the fault.
        let err = session.submit(1, &patterned(64)).await.unwrap_err();
        assert!(matches!(
            err,
            CatapultError::Driver {
                status: DriverStatus::HardwareError,
                ..
            }
        ));

        // Subsequent submits, including one that lands on slot 0 again,
        // still succeed.
        for i in 0..4 {
            session.submit(1, &patterned(128 + i)).await.unwrap();
        }
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (driver, session) = session_over(SimOptions::default()).await;
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(driver.is_closed());
        assert!(matches!(
            session.submit(1, &[0u8; 4]).await,
            Err(CatapultError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_drop_without_close_tears_down_handle() {
        let driver = Arc::new(SimDriver::new(SimOptions::default()));
        {
            let session = CatapultSession::with_driver(Arc::clone(&driver) as Arc<dyn Driver>)
                .await
                .unwrap();
            session.submit(1, &[1u8; 64]).await.unwrap();
            // Dropped here without close().
        }
        assert!(driver.is_closed());
    }

    #[tokio::test]
    async fn test_failed_setup_closes_handle() {
        // Zero usable slots: construction must fail and close the handle.
        let driver = Arc::new(SimDriver::new(options(0, 4096)));
        let result = CatapultSession::with_driver(Arc::clone(&driver) as Arc<dyn Driver>).await;
        assert!(result.is_err());
        assert!(driver.is_closed());
    }

    #[test]
    fn test_execution_time_conversion() {
        let result = ExecutionResult {
            execution_time_cycles: 150_000_000,
            payload: Vec::new(),
        };
        assert_eq!(result.execution_time(150_000_000), Duration::from_secs(1));
        assert_eq!(result.execution_time(0), Duration::ZERO);
    }
}
