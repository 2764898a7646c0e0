// Catapult-Style FPGA Accelerator Host Driver
// SPDX-License-Identifier: MIT

//! Per-slot job execution.
//!
//! A slot is one physical input/output DMA buffer pair. Each slot is driven
//! by a dedicated worker task that drains a FIFO job queue, so jobs on one
//! slot execute strictly one at a time and in assignment order while
//! different slots run fully concurrently. The queue hand-off is the only
//! cross-task synchronization; all driver calls and buffer copies happen on
//! the worker, outside any lock.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::driver::{Driver, DriverStatus, WaitFlags};
use crate::error::{CatapultError, CatapultResult};
use crate::frame::{self, InputHeader, OutputFrame};

/// Poll interval while the slot's input buffer is still held by the device.
pub(crate) const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Bounded wait for the device to acknowledge receipt of a sent buffer.
pub(crate) const SEND_ACK_TIMEOUT_MS: u32 = 10_000;

/// Wait for the result of a member execution. Hardware execution time is
/// workload-dependent, so this is effectively unbounded and interrupt
/// driven.
pub(crate) const OUTPUT_WAIT_TIMEOUT_MS: u32 = u32::MAX;

/// One unit of work queued on a slot.
pub(crate) enum Job {
    /// Move one slice's frame to the device; optionally collect the result.
    Transfer(TransferJob),
    /// Collect one pending result left behind by a fire-and-forget
    /// transfer.
    Receive {
        reply: oneshot::Sender<CatapultResult<OutputFrame>>,
    },
    /// Barrier: completes once every job queued before it has finished.
    Drain { done: oneshot::Sender<()> },
    /// Stop the worker once every job queued before it has finished.
    Shutdown,
}

/// A single slice transfer.
pub(crate) struct TransferJob {
    pub member_id: u32,
    pub payload: Vec<u8>,
    pub slice_index: u32,
    pub slice_count: u32,
    pub total_cells: u32,
    /// When false the response is left in the slot's output buffer for a
    /// later [`Job::Receive`]; the reply then carries `None` once the send
    /// has been acknowledged.
    pub collect_response: bool,
    pub reply: oneshot::Sender<CatapultResult<Option<OutputFrame>>>,
}

/// Worker task state for one slot.
pub(crate) struct SlotWorker {
    index: usize,
    driver: Arc<dyn Driver>,
    rx: mpsc::UnboundedReceiver<Job>,
}

impl SlotWorker {
    pub(crate) fn new(index: usize, driver: Arc<dyn Driver>, rx: mpsc::UnboundedReceiver<Job>) -> Self {
        Self { index, driver, rx }
    }

    /// Drain the job queue until shutdown or until every sender is gone.
    pub(crate) async fn run(mut self) {
        trace!("slot {}: worker started", self.index);
        while let Some(job) = self.rx.recv().await {
            match job {
                Job::Transfer(transfer) => {
                    let TransferJob {
                        member_id,
                        payload,
                        slice_index,
                        slice_count,
                        total_cells,
                        collect_response,
                        reply,
                    } = transfer;
                    let header = InputHeader {
                        member_id,
                        total_cells,
                        slice_index,
                        slice_count,
                    };
                    let result = self.transfer(&header, &payload, collect_response).await;
                    // A dropped receiver means the caller gave up; the job
                    // itself already ran to completion.
                    let _ = reply.send(result);
                }
                Job::Receive { reply } => {
                    let result = self.receive().await;
                    let _ = reply.send(result);
                }
                Job::Drain { done } => {
                    let _ = done.send(());
                }
                Job::Shutdown => break,
            }
        }
        trace!("slot {}: worker stopped", self.index);
    }

    /// Wire I/O for one slice: frame, send, await the acknowledgment, and
    /// unless the job is fire-and-forget, collect the result.
    async fn transfer(
        &self,
        header: &InputHeader,
        payload: &[u8],
        collect_response: bool,
    ) -> CatapultResult<Option<OutputFrame>> {
        self.wait_input_ready().await?;

        let (frame, padded) = frame::build_frame(header, payload);
        if padded {
            debug!(
                "slot {}: payload of {} bytes zero-padded to {} on-wire bytes",
                self.index,
                payload.len(),
                frame.len() - frame::INPUT_HEADER_BYTES,
            );
        }

        self.check("FillInputBuffer", self.driver.fill_input_buffer(self.index, &frame))?;
        self.check(
            "SendInputBuffer",
            self.driver.send_input_buffer(self.index, frame.len() as u32),
        )?;
        trace!(
            "slot {}: sent member {} slice {}/{} ({} bytes)",
            self.index,
            header.member_id,
            header.slice_index,
            header.slice_count,
            frame.len(),
        );

        // The shell posts a small acknowledgment message after accepting a
        // send; it carries no data and is discarded so the output buffer is
        // free again for the next acknowledgment.
        self.wait_output(SEND_ACK_TIMEOUT_MS, WaitFlags::empty()).await?;
        self.check("DiscardOutputBuffer", self.driver.discard_output_buffer(self.index))?;

        if !collect_response {
            return Ok(None);
        }
        self.receive().await.map(Some)
    }

    /// Collect one result frame from the slot's output buffer.
    async fn receive(&self) -> CatapultResult<OutputFrame> {
        let available = self
            .wait_output(OUTPUT_WAIT_TIMEOUT_MS, WaitFlags::INTERRUPT)
            .await?;
        let bytes = self.check(
            "ReadOutputBuffer",
            self.driver.read_output_buffer(self.index, available as usize),
        )?;
        self.check("DiscardOutputBuffer", self.driver.discard_output_buffer(self.index))?;
        OutputFrame::decode(&bytes)
    }

    /// Poll until the device has drained the slot's input buffer.
    ///
    /// A full buffer is expected when the previous job's device-side
    /// processing lags behind its host-side completion.
    async fn wait_input_ready(&self) -> CatapultResult<()> {
        loop {
            let full = self.check("GetInputBufferFull", self.driver.input_buffer_full(self.index))?;
            if !full {
                return Ok(());
            }
            trace!("slot {}: input buffer still full, re-polling", self.index);
            tokio::time::sleep(INPUT_POLL_INTERVAL).await;
        }
    }

    /// Run the blocking output-buffer wait off the async threads.
    async fn wait_output(&self, timeout_ms: u32, flags: WaitFlags) -> CatapultResult<u32> {
        let driver = Arc::clone(&self.driver);
        let slot = self.index;
        let status =
            task::spawn_blocking(move || driver.wait_output_buffer(slot, timeout_ms, flags))
                .await?;
        match status {
            Ok(available) => Ok(available),
            Err(DriverStatus::WaitTimeout) => {
                warn!("slot {}: output wait timed out after {} ms", slot, timeout_ms);
                Err(CatapultError::WaitTimeout {
                    slot,
                    timeout_ms,
                })
            }
            Err(status) => Err(self.driver_error("WaitOutputBuffer", status)),
        }
    }

    /// Map a non-success driver status to a job error, attaching the
    /// driver's own error text.
    fn check<T>(&self, call: &'static str, result: Result<T, DriverStatus>) -> CatapultResult<T> {
        result.map_err(|status| self.driver_error(call, status))
    }

    fn driver_error(&self, call: &'static str, status: DriverStatus) -> CatapultError {
        CatapultError::Driver {
            call,
            status,
            message: self.driver.last_error_text(),
        }
    }
}
