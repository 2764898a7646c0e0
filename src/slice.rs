// Catapult-Style FPGA Accelerator Host Driver
// SPDX-License-Identifier: MIT

//! Payload slicing and response reassembly.
//!
//! Payloads larger than one slot's capacity are split into contiguous
//! slices, dispatched through the scheduler, and reassembled into a single
//! logically ordered output. The device tags every response with the slice
//! index it belongs to; reassembly trusts that tag and never the order in
//! which responses happen to arrive.
//!
//! When a payload needs more slices than there are physical slots, all
//! slices are first sent fire-and-forget and the results are then collected
//! in batches of at most one per slot, so the number of concurrently
//! blocked response waiters never exceeds the slot count.

use log::warn;
use tokio::sync::oneshot;

use crate::error::{CatapultError, CatapultResult};
use crate::frame::{cell_count, OutputFrame, CELL_BYTES};
use crate::scheduler::SlotScheduler;
use crate::session::ExecutionResult;
use crate::slot::{Job, TransferJob};

/// Number of slices a payload of `payload_len` bytes needs at the given
/// per-slot capacity. Every payload, including an empty one, needs at least
/// one frame.
pub(crate) fn slice_count(payload_len: usize, capacity: usize) -> usize {
    payload_len.div_ceil(capacity).max(1)
}

/// Submit one job, slicing and reassembling as the payload size demands.
pub(crate) async fn submit(
    scheduler: &SlotScheduler,
    capacity: usize,
    member_id: u32,
    payload: &[u8],
) -> CatapultResult<ExecutionResult> {
    let count = slice_count(payload.len(), capacity);
    if count == 1 {
        return submit_single(scheduler, member_id, payload).await;
    }

    let total_cells = cell_count(payload.len());
    let overflow = count > scheduler.slot_count();
    let responses = if overflow {
        dispatch_overflow(scheduler, capacity, member_id, payload, count, total_cells).await?
    } else {
        dispatch_inline(scheduler, capacity, member_id, payload, count, total_cells).await?
    };
    reassemble(&responses, capacity)
}

/// Fast path: the whole payload fits in one slot.
async fn submit_single(
    scheduler: &SlotScheduler,
    member_id: u32,
    payload: &[u8],
) -> CatapultResult<ExecutionResult> {
    let (reply, rx) = oneshot::channel();
    scheduler.assign(Job::Transfer(TransferJob {
        member_id,
        payload: payload.to_vec(),
        slice_index: 0,
        slice_count: 1,
        total_cells: cell_count(payload.len()),
        collect_response: true,
        reply,
    }))?;
    let frame = expect_frame(await_reply(rx).await?)?;

    // The device reports the logical output size; the wire bytes may carry
    // chunk padding beyond it.
    let logical = frame.header.payload_cell_count as usize * CELL_BYTES;
    let mut payload = frame.payload;
    payload.resize(logical, 0);
    Ok(ExecutionResult {
        execution_time_cycles: frame.header.execution_time_cycles,
        payload,
    })
}

/// `2 <= count <= slot_count`: every slice awaits its own response inline;
/// all slices are in flight concurrently.
async fn dispatch_inline(
    scheduler: &SlotScheduler,
    capacity: usize,
    member_id: u32,
    payload: &[u8],
    count: usize,
    total_cells: u32,
) -> CatapultResult<Vec<OutputFrame>> {
    let mut pending = Vec::with_capacity(count);
    for (index, chunk) in payload.chunks(capacity).enumerate() {
        let (reply, rx) = oneshot::channel();
        scheduler.assign(Job::Transfer(TransferJob {
            member_id,
            payload: chunk.to_vec(),
            slice_index: index as u32,
            slice_count: count as u32,
            total_cells,
            collect_response: true,
            reply,
        }))?;
        pending.push(rx);
    }

    let mut responses = Vec::with_capacity(count);
    for rx in pending {
        responses.push(expect_frame(await_reply(rx).await?)?);
    }
    Ok(responses)
}

/// `count > slot_count`: send everything first, then collect results in
/// batches no wider than the slot pool.
async fn dispatch_overflow(
    scheduler: &SlotScheduler,
    capacity: usize,
    member_id: u32,
    payload: &[u8],
    count: usize,
    total_cells: u32,
) -> CatapultResult<Vec<OutputFrame>> {
    let mut pending = Vec::with_capacity(count);
    let mut slots = Vec::with_capacity(count);
    for (index, chunk) in payload.chunks(capacity).enumerate() {
        let (reply, rx) = oneshot::channel();
        let slot = scheduler.assign(Job::Transfer(TransferJob {
            member_id,
            payload: chunk.to_vec(),
            slice_index: index as u32,
            slice_count: count as u32,
            total_cells,
            collect_response: false,
            reply,
        }))?;
        pending.push(rx);
        slots.push(slot);
    }
    // Every send must be acknowledged before the first result is collected.
    for rx in pending {
        await_reply(rx).await?;
    }

    let batch_width = scheduler.slot_count();
    let mut responses = Vec::with_capacity(count);
    for batch in slots.chunks(batch_width) {
        let mut pending = Vec::with_capacity(batch.len());
        for &slot in batch {
            let (reply, rx) = oneshot::channel();
            scheduler.assign_to(slot, Job::Receive { reply })?;
            pending.push(rx);
        }
        for rx in pending {
            responses.push(await_reply(rx).await?);
        }
    }
    Ok(responses)
}

/// Stitch slice responses into one ordered output buffer.
///
/// Every response carries the total logical output size, so the first one
/// sizes the result and supplies the execution time. Each response's
/// payload lands at the byte offset its device-reported slice index
/// selects; a response pointing outside the result is dropped rather than
/// faulting.
pub(crate) fn reassemble(
    responses: &[OutputFrame],
    capacity: usize,
) -> CatapultResult<ExecutionResult> {
    let first = responses.first().ok_or_else(|| {
        CatapultError::MalformedResponse("no slice responses to reassemble".to_string())
    })?;
    let total_len = first.header.payload_cell_count as usize * CELL_BYTES;
    let mut output = vec![0u8; total_len];

    for frame in responses {
        let offset = frame.header.slice_index as usize * capacity;
        if offset >= total_len {
            warn!(
                "dropping response for slice {}: offset {} outside the {} byte result",
                frame.header.slice_index, offset, total_len,
            );
            continue;
        }
        let len = frame.payload.len().min(total_len - offset);
        output[offset..offset + len].copy_from_slice(&frame.payload[..len]);
    }

    Ok(ExecutionResult {
        execution_time_cycles: first.header.execution_time_cycles,
        payload: output,
    })
}

async fn await_reply<T>(rx: oneshot::Receiver<CatapultResult<T>>) -> CatapultResult<T> {
    rx.await.map_err(|_| CatapultError::SessionClosed)?
}

fn expect_frame(frame: Option<OutputFrame>) -> CatapultResult<OutputFrame> {
    frame.ok_or_else(|| {
        CatapultError::MalformedResponse("transfer completed without a response frame".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OutputHeader;

    fn response(slice_index: u32, total_cells: u32, payload: Vec<u8>) -> OutputFrame {
        OutputFrame {
            header: OutputHeader {
                execution_time_cycles: 42,
                payload_cell_count: total_cells,
                slice_index,
            },
            payload,
        }
    }

    #[test]
    fn test_slice_count_math() {
        assert_eq!(slice_count(0, 64_000), 1);
        assert_eq!(slice_count(64_000, 64_000), 1);
        assert_eq!(slice_count(64_001, 64_000), 2);
        // The worked example: 130 000 bytes over 64 000-byte slots.
        assert_eq!(slice_count(130_000, 64_000), 3);
        let sizes: Vec<usize> = [0u8; 130_000]
            .chunks(64_000)
            .map(<[u8]>::len)
            .collect();
        assert_eq!(sizes, vec![64_000, 64_000, 2_000]);
    }

    #[test]
    fn test_reassembly_ignores_arrival_order() {
        let capacity = 64;
        let total = 3 * capacity;
        let expected: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let slices: Vec<OutputFrame> = (0..3)
            .map(|i| {
                response(
                    i as u32,
                    cell_count(total),
                    expected[i * capacity..(i + 1) * capacity].to_vec(),
                )
            })
            .collect();

        for order in [[0usize, 1, 2], [2, 1, 0], [1, 2, 0]] {
            let shuffled: Vec<OutputFrame> =
                order.iter().map(|&i| slices[i].clone()).collect();
            let result = reassemble(&shuffled, capacity).unwrap();
            assert_eq!(result.payload, expected);
            assert_eq!(result.execution_time_cycles, 42);
        }
    }

    #[test]
    fn test_out_of_bounds_slice_is_dropped() {
        let capacity = 64;
        let good = response(0, cell_count(capacity), vec![7u8; capacity]);
        let rogue = response(9, cell_count(capacity), vec![9u8; capacity]);
        let result = reassemble(&[good, rogue], capacity).unwrap();
        assert_eq!(result.payload, vec![7u8; capacity]);
    }

    #[test]
    fn test_trailing_slice_copy_is_clamped() {
        let capacity = 64;
        // Total logical size not a multiple of the capacity: the last
        // slice's padded payload must not write past the end.
        let total = capacity + 8;
        let head = response(0, cell_count(total), vec![1u8; capacity]);
        let tail = response(1, cell_count(total), vec![2u8; capacity]);
        let result = reassemble(&[head, tail], capacity).unwrap();
        assert_eq!(result.payload.len(), total);
        assert!(result.payload[..capacity].iter().all(|&b| b == 1));
        assert!(result.payload[capacity..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_reassembly_of_nothing_is_an_error() {
        assert!(reassemble(&[], 64).is_err());
    }
}
