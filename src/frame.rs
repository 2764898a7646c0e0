// Catapult-Style FPGA Accelerator Host Driver
// SPDX-License-Identifier: MIT

//! Wire format for slot messages.
//!
//! Every message moved through a slot's DMA buffer is a *frame*: a
//! fixed-size little-endian header followed by the payload. Logical lengths
//! in the headers count *cells* (the device's 4-byte memory word) and always
//! describe the unpadded payload; the bytes that actually cross the bus are
//! rounded up to the shell's 64-byte DMA chunk and to the minimum message
//! size the DMA engine accepts.
//!
//! # Layout
//!
//! | Input frame | Output frame |
//! |---|---|
//! | `member_id: u32` | `execution_time_cycles: u64` |
//! | `total_payload_cells: u32` | `payload_cell_count: u32` |
//! | `slice_index: u32` | `slice_index: u32` |
//! | `slice_count: u32` | |
//! | payload bytes | payload bytes |

use crate::error::{CatapultError, CatapultResult};

/// DMA transfer granularity in bytes; frames are padded to this boundary.
pub const CHUNK_BYTES: usize = 64;

/// The device's native memory word, the unit of logical length fields.
pub const CELL_BYTES: usize = 4;

/// Byte size of the input frame header.
pub const INPUT_HEADER_BYTES: usize = 16;

/// Byte size of the output frame header.
pub const OUTPUT_HEADER_BYTES: usize = 16;

/// Smallest transfer the shell's DMA engine accepts. Shorter frames are
/// zero-padded up to this size.
pub const MIN_FRAME_BYTES: usize = 3 * CHUNK_BYTES;

// Header layouts are baked into the shell; catch accidental edits early.
const _: () = assert!(INPUT_HEADER_BYTES % CELL_BYTES == 0);
const _: () = assert!(OUTPUT_HEADER_BYTES % CELL_BYTES == 0);
const _: () = assert!(MIN_FRAME_BYTES % CHUNK_BYTES == 0);
const _: () = assert!(CHUNK_BYTES % CELL_BYTES == 0);

/// Number of cells needed to hold `bytes` payload bytes.
#[inline]
pub fn cell_count(bytes: usize) -> u32 {
    bytes.div_ceil(CELL_BYTES) as u32
}

/// On-the-wire length of an input frame carrying `payload_len` payload
/// bytes: header plus payload, rounded up to the chunk boundary and to the
/// minimum message size.
#[inline]
pub fn frame_len(payload_len: usize) -> usize {
    let raw = INPUT_HEADER_BYTES + payload_len;
    raw.div_ceil(CHUNK_BYTES)
        .max(MIN_FRAME_BYTES / CHUNK_BYTES)
        * CHUNK_BYTES
}

/// Header of a host-to-device frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputHeader {
    /// Index of the hardware-implemented member to invoke.
    pub member_id: u32,
    /// Logical size of the *whole* job payload in cells, across all slices.
    pub total_cells: u32,
    /// Which slice of the job this frame carries.
    pub slice_index: u32,
    /// Total number of slices the job was split into.
    pub slice_count: u32,
}

impl InputHeader {
    /// Serialize into the first [`INPUT_HEADER_BYTES`] of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        // A short buffer is a framing bug, not a device condition.
        assert!(buf.len() >= INPUT_HEADER_BYTES, "frame buffer too short");
        buf[0..4].copy_from_slice(&self.member_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.total_cells.to_le_bytes());
        buf[8..12].copy_from_slice(&self.slice_index.to_le_bytes());
        buf[12..16].copy_from_slice(&self.slice_count.to_le_bytes());
    }

    /// Deserialize from the first [`INPUT_HEADER_BYTES`] of `bytes`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < INPUT_HEADER_BYTES {
            return None;
        }
        let word = |i: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[i..i + 4]);
            u32::from_le_bytes(raw)
        };
        Some(Self {
            member_id: word(0),
            total_cells: word(4),
            slice_index: word(8),
            slice_count: word(12),
        })
    }
}

/// Header of a device-to-host frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputHeader {
    /// Device clock cycles the member spent executing.
    pub execution_time_cycles: u64,
    /// Logical size of the *whole* job output in cells, across all slices.
    pub payload_cell_count: u32,
    /// Which slice of the job output this frame carries, as reported by
    /// the device. Reassembly keys off this field, never arrival order.
    pub slice_index: u32,
}

impl OutputHeader {
    /// Serialize into the first [`OUTPUT_HEADER_BYTES`] of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= OUTPUT_HEADER_BYTES, "frame buffer too short");
        buf[0..8].copy_from_slice(&self.execution_time_cycles.to_le_bytes());
        buf[8..12].copy_from_slice(&self.payload_cell_count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.slice_index.to_le_bytes());
    }

    /// Deserialize from the first [`OUTPUT_HEADER_BYTES`] of `bytes`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < OUTPUT_HEADER_BYTES {
            return None;
        }
        Some(Self {
            execution_time_cycles: u64::from_le_bytes(bytes[0..8].try_into().ok()?),
            payload_cell_count: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            slice_index: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
        })
    }
}

/// A decoded device-to-host frame.
#[derive(Debug, Clone)]
pub struct OutputFrame {
    pub header: OutputHeader,
    /// Raw payload bytes as they crossed the bus, padding included.
    pub payload: Vec<u8>,
}

impl OutputFrame {
    /// Split a raw output buffer into header and payload.
    pub fn decode(bytes: &[u8]) -> CatapultResult<Self> {
        let header = OutputHeader::decode(bytes).ok_or_else(|| {
            CatapultError::MalformedResponse(format!(
                "output frame of {} bytes is shorter than the {} byte header",
                bytes.len(),
                OUTPUT_HEADER_BYTES
            ))
        })?;
        Ok(Self {
            header,
            payload: bytes[OUTPUT_HEADER_BYTES..].to_vec(),
        })
    }
}

/// Build the on-the-wire input frame for one slice.
///
/// Returns the framed bytes and whether zero padding was appended. The
/// header's logical fields are never affected by padding.
pub fn build_frame(header: &InputHeader, payload: &[u8]) -> (Vec<u8>, bool) {
    let len = frame_len(payload.len());
    let mut frame = vec![0u8; len];
    header.encode_into(&mut frame);
    frame[INPUT_HEADER_BYTES..INPUT_HEADER_BYTES + payload.len()].copy_from_slice(payload);
    (frame, len > INPUT_HEADER_BYTES + payload.len())
}
