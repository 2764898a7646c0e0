// Catapult-Style FPGA Accelerator Host Driver
// SPDX-License-Identifier: MIT

//! Software device simulator.
//!
//! [`SimDriver`] implements the full [`Driver`] capability set in process,
//! so the session, scheduler and slicer can run without an FPGA attached:
//! for development on machines without hardware, for the crate's own tests,
//! and for benchmarking the host-side protocol overhead in isolation.
//!
//! The simulated role is an echo member: every frame comes back with the
//! same payload and a deterministic execution time. A custom member
//! function can be installed with [`SimDriver::with_member_fn`].
//!
//! # Protocol model
//!
//! Each slot keeps an acknowledgment counter and a FIFO of result frames.
//! `send_input_buffer` processes the frame synchronously: it raises the
//! acknowledgment (consumed by the short polled wait and its discard) and
//! queues the result frame (consumed by the interrupt-mode wait, read, and
//! discard). Faults can be injected per slot to exercise the failure and
//! timeout paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::driver::{Driver, DriverResult, DriverStatus, WaitFlags};
use crate::frame::{self, InputHeader, OutputHeader, INPUT_HEADER_BYTES, OUTPUT_HEADER_BYTES};
use crate::regs::{ShellControl, SOFT_ALLOWED_SLOTS, SOFT_BUFFER_PAYLOAD_SIZE};

/// Geometry and behavior of the simulated device.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Number of physical buffer slots.
    pub buffer_count: u32,
    /// Size in bytes of one DMA buffer.
    pub buffer_size: u32,
    /// Number of 32-bit shell registers.
    pub shell_register_count: u32,
    /// Initial `AllowedSlots` soft register (0 = unprogrammed).
    pub allowed_slots: u64,
    /// Initial `BufferPayloadSize` soft register (0 = unprogrammed).
    pub buffer_payload_size: u64,
    /// Simulated execution cost per payload cell.
    pub cycles_per_cell: u64,
    /// Clamp every bounded wait to this many milliseconds. Keeps tests
    /// that exercise the timeout path from sleeping for real.
    pub max_wait_ms: Option<u32>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            buffer_count: 8,
            buffer_size: 4096,
            shell_register_count: 16,
            allowed_slots: 0,
            buffer_payload_size: 0,
            cycles_per_cell: 8,
            max_wait_ms: None,
        }
    }
}

/// A fault injected into one slot; consumed by the next matching call.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// The next send on the slot fails with the given status.
    FailSend(DriverStatus),
    /// The next send succeeds but its acknowledgment never arrives, so the
    /// post-send wait times out.
    DropAck,
}

/// Observable wire activity, recorded for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// A frame was handed to the device.
    Send { slot: usize, slice: u32 },
    /// A result frame was copied back to the host.
    Collect { slot: usize, slice: u32 },
}

/// Member behavior: maps `(member_id, slice payload)` to the output bytes.
pub type MemberFn = dyn Fn(u32, &[u8]) -> Vec<u8> + Send + Sync;

struct SlotSim {
    input: Vec<u8>,
    busy_polls: u32,
    pending_acks: usize,
    results: VecDeque<Vec<u8>>,
    sent_lengths: Vec<u32>,
    fault: Option<Fault>,
}

impl SlotSim {
    fn new() -> Self {
        Self {
            input: Vec::new(),
            busy_polls: 0,
            pending_acks: 0,
            results: VecDeque::new(),
            sent_lengths: Vec::new(),
            fault: None,
        }
    }
}

struct SimState {
    shell_registers: Vec<u32>,
    soft_registers: Vec<u64>,
    shell_writes: Vec<(u32, u32)>,
    slots: Vec<SlotSim>,
    events: Vec<SimEvent>,
    result_waiters: usize,
    max_result_waiters: usize,
}

/// In-process software implementation of the [`Driver`] capability set.
pub struct SimDriver {
    options: SimOptions,
    member_fn: Box<MemberFn>,
    state: Mutex<SimState>,
    output_posted: Condvar,
    closed: AtomicBool,
    last_error: Mutex<String>,
}

impl SimDriver {
    /// Create a simulator whose members echo their payload.
    pub fn new(options: SimOptions) -> Self {
        Self::with_member_fn(options, |_, payload| payload.to_vec())
    }

    /// Create a simulator with a custom member function.
    pub fn with_member_fn<F>(options: SimOptions, member_fn: F) -> Self
    where
        F: Fn(u32, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        let mut shell_registers = vec![0u32; options.shell_register_count.max(1) as usize];
        // Devices power up with PCIe access enabled.
        shell_registers[0] = ShellControl::PCIE_ENABLED.bits();
        let mut soft_registers = vec![0u64; 8];
        soft_registers[SOFT_ALLOWED_SLOTS as usize] = options.allowed_slots;
        soft_registers[SOFT_BUFFER_PAYLOAD_SIZE as usize] = options.buffer_payload_size;
        let slots = (0..options.buffer_count).map(|_| SlotSim::new()).collect();
        Self {
            options,
            member_fn: Box::new(member_fn),
            state: Mutex::new(SimState {
                shell_registers,
                soft_registers,
                shell_writes: Vec::new(),
                slots,
                events: Vec::new(),
                result_waiters: 0,
                max_result_waiters: 0,
            }),
            output_posted: Condvar::new(),
            closed: AtomicBool::new(false),
            last_error: Mutex::new(String::new()),
        }
    }

    // ------------------------------------------------------------------
    // Test-facing observation and fault injection
    // ------------------------------------------------------------------

    /// Whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shell register writes in the order they were issued.
    pub fn shell_writes(&self) -> Vec<(u32, u32)> {
        self.state().shell_writes.clone()
    }

    /// On-the-wire lengths of every frame sent on a slot.
    pub fn sent_lengths(&self, slot: usize) -> Vec<u32> {
        self.state().slots[slot].sent_lengths.clone()
    }

    /// Every send and collect, in global order.
    pub fn events(&self) -> Vec<SimEvent> {
        self.state().events.clone()
    }

    /// High-water mark of concurrently blocked interrupt-mode waiters.
    pub fn max_concurrent_result_waiters(&self) -> usize {
        self.state().max_result_waiters
    }

    /// Arm a one-shot fault on a slot.
    pub fn inject_fault(&self, slot: usize, fault: Fault) {
        self.state().slots[slot].fault = Some(fault);
    }

    /// Report the slot's input buffer as still full for the next `polls`
    /// queries.
    pub fn set_busy_polls(&self, slot: usize, polls: u32) {
        self.state().slots[slot].busy_polls = polls;
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, status: DriverStatus, message: impl Into<String>) -> DriverStatus {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = message.into();
        status
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.is_closed() {
            return Err(self.fail(DriverStatus::InvalidHandle, "device handle is closed"));
        }
        Ok(())
    }

    fn check_slot(&self, slot: usize) -> DriverResult<()> {
        if slot >= self.options.buffer_count as usize {
            return Err(self.fail(
                DriverStatus::IllegalSlot,
                format!("slot {slot} out of range"),
            ));
        }
        Ok(())
    }

    fn effective_timeout(&self, timeout_ms: u32) -> Duration {
        let clamped = match self.options.max_wait_ms {
            Some(max) => timeout_ms.min(max),
            None => timeout_ms,
        };
        Duration::from_millis(u64::from(clamped))
    }

    /// Build the response frame for one accepted input frame.
    fn process(&self, header: &InputHeader, payload: &[u8]) -> Vec<u8> {
        // A single-frame job's logical size is in its header; strip the
        // chunk padding before handing the payload to the member. Sliced
        // payloads are processed as received, the host clamps on
        // reassembly.
        let payload = if header.slice_count == 1 {
            let logical = header.total_cells as usize * frame::CELL_BYTES;
            &payload[..logical.min(payload.len())]
        } else {
            payload
        };
        let output = (self.member_fn)(header.member_id, payload);
        // A single-frame job reports the member's actual output size;
        // sliced jobs report the job-wide total in every slice, as the
        // hardware role does.
        let payload_cell_count = if header.slice_count == 1 {
            frame::cell_count(output.len())
        } else {
            header.total_cells
        };
        let response_header = OutputHeader {
            execution_time_cycles: self
                .options
                .cycles_per_cell
                .saturating_mul(u64::from(header.total_cells)),
            payload_cell_count,
            slice_index: header.slice_index,
        };
        let mut response = vec![0u8; frame::frame_len(output.len())];
        response_header.encode_into(&mut response);
        response[OUTPUT_HEADER_BYTES..OUTPUT_HEADER_BYTES + output.len()].copy_from_slice(&output);
        response
    }
}

impl Driver for SimDriver {
    fn shell_register_count(&self) -> DriverResult<u32> {
        self.ensure_open()?;
        Ok(self.options.shell_register_count)
    }

    fn read_shell_register(&self, index: u32) -> DriverResult<u32> {
        self.ensure_open()?;
        let state = self.state();
        state
            .shell_registers
            .get(index as usize)
            .copied()
            .ok_or_else(|| {
                self.fail(
                    DriverStatus::IllegalRegister,
                    format!("shell register {index} out of range"),
                )
            })
    }

    fn write_shell_register(&self, index: u32, value: u32) -> DriverResult<()> {
        self.ensure_open()?;
        let mut state = self.state();
        if index as usize >= state.shell_registers.len() {
            return Err(self.fail(
                DriverStatus::IllegalRegister,
                format!("shell register {index} out of range"),
            ));
        }
        state.shell_registers[index as usize] = value;
        state.shell_writes.push((index, value));
        Ok(())
    }

    fn read_soft_register(&self, index: u32) -> DriverResult<u64> {
        self.ensure_open()?;
        let state = self.state();
        state
            .soft_registers
            .get(index as usize)
            .copied()
            .ok_or_else(|| {
                self.fail(
                    DriverStatus::IllegalRegister,
                    format!("soft register {index} out of range"),
                )
            })
    }

    fn write_soft_register(&self, index: u32, value: u64) -> DriverResult<()> {
        self.ensure_open()?;
        let mut state = self.state();
        if index as usize >= state.soft_registers.len() {
            return Err(self.fail(
                DriverStatus::IllegalRegister,
                format!("soft register {index} out of range"),
            ));
        }
        state.soft_registers[index as usize] = value;
        Ok(())
    }

    fn buffer_count(&self) -> DriverResult<u32> {
        self.ensure_open()?;
        Ok(self.options.buffer_count)
    }

    fn buffer_size(&self) -> DriverResult<u32> {
        self.ensure_open()?;
        Ok(self.options.buffer_size)
    }

    fn input_buffer_full(&self, slot: usize) -> DriverResult<bool> {
        self.ensure_open()?;
        self.check_slot(slot)?;
        let mut state = self.state();
        let slot = &mut state.slots[slot];
        if slot.busy_polls > 0 {
            slot.busy_polls -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn fill_input_buffer(&self, slot: usize, frame: &[u8]) -> DriverResult<()> {
        self.ensure_open()?;
        self.check_slot(slot)?;
        if frame.len() > self.options.buffer_size as usize {
            return Err(self.fail(
                DriverStatus::MemoryError,
                format!(
                    "frame of {} bytes exceeds the {} byte buffer",
                    frame.len(),
                    self.options.buffer_size
                ),
            ));
        }
        self.state().slots[slot].input = frame.to_vec();
        Ok(())
    }

    fn send_input_buffer(&self, slot: usize, len: u32) -> DriverResult<()> {
        self.ensure_open()?;
        self.check_slot(slot)?;

        let mut state = self.state();
        let drop_ack = match state.slots[slot].fault.take() {
            Some(Fault::FailSend(status)) => {
                drop(state);
                return Err(self.fail(status, "simulated send failure"));
            }
            Some(Fault::DropAck) => true,
            None => false,
        };

        let input = state.slots[slot].input.clone();
        if (len as usize) > input.len() {
            drop(state);
            return Err(self.fail(
                DriverStatus::TransferError,
                "send length exceeds the filled input buffer",
            ));
        }
        let frame = &input[..len as usize];
        let Some(header) = InputHeader::decode(frame) else {
            drop(state);
            return Err(self.fail(
                DriverStatus::TransferError,
                "input frame shorter than its header",
            ));
        };
        let response = self.process(&header, &frame[INPUT_HEADER_BYTES..]);

        let slot_state = &mut state.slots[slot];
        slot_state.sent_lengths.push(len);
        slot_state.results.push_back(response);
        if !drop_ack {
            slot_state.pending_acks += 1;
        }
        state.events.push(SimEvent::Send {
            slot,
            slice: header.slice_index,
        });
        drop(state);
        self.output_posted.notify_all();
        Ok(())
    }

    fn wait_output_buffer(
        &self,
        slot: usize,
        timeout_ms: u32,
        flags: WaitFlags,
    ) -> DriverResult<u32> {
        self.ensure_open()?;
        self.check_slot(slot)?;
        let deadline = Instant::now() + self.effective_timeout(timeout_ms);
        let interrupt = flags.contains(WaitFlags::INTERRUPT);

        let mut state = self.state();
        if interrupt {
            state.result_waiters += 1;
            state.max_result_waiters = state.max_result_waiters.max(state.result_waiters);
        }
        let outcome = loop {
            let ready = if interrupt {
                state.slots[slot].results.front().map(|r| r.len() as u32)
            } else if state.slots[slot].pending_acks > 0 {
                Some(0)
            } else {
                None
            };
            if let Some(len) = ready {
                break Ok(len);
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(DriverStatus::WaitTimeout);
            }
            let (next, _) = self
                .output_posted
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        };
        if interrupt {
            state.result_waiters -= 1;
        }
        drop(state);
        outcome.map_err(|status| self.fail(status, "output wait timed out"))
    }

    fn read_output_buffer(&self, slot: usize, len: usize) -> DriverResult<Vec<u8>> {
        self.ensure_open()?;
        self.check_slot(slot)?;
        let mut state = self.state();
        let Some(front) = state.slots[slot].results.front() else {
            drop(state);
            return Err(self.fail(
                DriverStatus::TransferError,
                "no output message to read",
            ));
        };
        let bytes = front[..len.min(front.len())].to_vec();
        let slice = OutputHeader::decode(&bytes).map_or(0, |h| h.slice_index);
        state.events.push(SimEvent::Collect { slot, slice });
        Ok(bytes)
    }

    fn discard_output_buffer(&self, slot: usize) -> DriverResult<()> {
        self.ensure_open()?;
        self.check_slot(slot)?;
        let mut state = self.state();
        let slot_state = &mut state.slots[slot];
        if slot_state.pending_acks > 0 {
            slot_state.pending_acks -= 1;
            return Ok(());
        }
        if slot_state.results.pop_front().is_none() {
            drop(state);
            return Err(self.fail(
                DriverStatus::TransferError,
                "discard with no pending output message",
            ));
        }
        Ok(())
    }

    fn last_error_text(&self) -> String {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn close(&self) -> DriverResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(self.fail(DriverStatus::InvalidHandle, "device handle already closed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::build_frame;

    fn send_frame(driver: &SimDriver, slot: usize, header: &InputHeader, payload: &[u8]) {
        let (frame, _) = build_frame(header, payload);
        driver.fill_input_buffer(slot, &frame).unwrap();
        driver.send_input_buffer(slot, frame.len() as u32).unwrap();
    }

    fn header(payload_len: usize) -> InputHeader {
        InputHeader {
            member_id: 1,
            total_cells: frame::cell_count(payload_len),
            slice_index: 0,
            slice_count: 1,
        }
    }

    #[test]
    fn test_ack_then_result_protocol() {
        let driver = SimDriver::new(SimOptions::default());
        send_frame(&driver, 0, &header(32), &[0xABu8; 32]);

        // Polled wait sees the acknowledgment, carrying no data.
        assert_eq!(driver.wait_output_buffer(0, 100, WaitFlags::empty()), Ok(0));
        driver.discard_output_buffer(0).unwrap();

        // Interrupt wait sees the result frame.
        let len = driver.wait_output_buffer(0, 100, WaitFlags::INTERRUPT).unwrap();
        let bytes = driver.read_output_buffer(0, len as usize).unwrap();
        let decoded = OutputHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.payload_cell_count, frame::cell_count(32));
        assert_eq!(&bytes[OUTPUT_HEADER_BYTES..OUTPUT_HEADER_BYTES + 32], &[0xABu8; 32]);
        driver.discard_output_buffer(0).unwrap();

        // Nothing left to discard.
        assert!(driver.discard_output_buffer(0).is_err());
    }

    #[test]
    fn test_wait_times_out_when_idle() {
        let driver = SimDriver::new(SimOptions {
            max_wait_ms: Some(10),
            ..SimOptions::default()
        });
        assert_eq!(
            driver.wait_output_buffer(0, 10_000, WaitFlags::INTERRUPT),
            Err(DriverStatus::WaitTimeout)
        );
    }

    #[test]
    fn test_closed_handle_is_inert() {
        let driver = SimDriver::new(SimOptions::default());
        driver.close().unwrap();
        assert_eq!(driver.buffer_count(), Err(DriverStatus::InvalidHandle));
        assert_eq!(driver.close(), Err(DriverStatus::InvalidHandle));
    }

    #[test]
    fn test_custom_member_fn() {
        let driver = SimDriver::with_member_fn(SimOptions::default(), |member, payload| {
            assert_eq!(member, 9);
            payload.iter().rev().copied().collect()
        });
        let payload: Vec<u8> = (0..64).collect();
        let mut head = header(payload.len());
        head.member_id = 9;
        send_frame(&driver, 0, &head, &payload);
        driver.wait_output_buffer(0, 100, WaitFlags::empty()).unwrap();
        driver.discard_output_buffer(0).unwrap();
        let len = driver.wait_output_buffer(0, 100, WaitFlags::INTERRUPT).unwrap();
        let bytes = driver.read_output_buffer(0, len as usize).unwrap();
        let reversed: Vec<u8> = (0..64).rev().collect();
        assert_eq!(&bytes[OUTPUT_HEADER_BYTES..OUTPUT_HEADER_BYTES + 64], &reversed[..]);
    }
}
