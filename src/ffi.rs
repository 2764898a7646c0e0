// Catapult-Style FPGA Accelerator Host Driver
// SPDX-License-Identifier: MIT

//! Binding to the vendor shell library.
//!
//! The vendor distributes the PCIe shell driver as a C shared library; its
//! path is part of the session configuration, so the binding loads it at
//! runtime with `libloading` and resolves every entry point once, up front.
//! All calls return a raw status word that is decoded through
//! [`DriverStatus::from_raw`].
//!
//! The input and output DMA regions are raw memory shared with the device.
//! Every access goes through [`DmaRegion`], an owned bounds-checked view
//! created fresh for each call; no pointer survives past the call that
//! fetched it.

use std::ffi::{c_char, c_void, CString};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use libloading::Library;

use crate::driver::{Driver, DriverResult, DriverStatus, WaitFlags};
use crate::error::{CatapultError, CatapultResult};
use crate::session::SessionConfig;

type FpgaHandle = *mut c_void;

type CreateHandleFn = unsafe extern "C" fn(
    endpoint: u32,
    flags: u32,
    version_definitions: *const c_char,
    version_manifest: *const c_char,
    handle: *mut FpgaHandle,
) -> u32;
type CloseHandleFn = unsafe extern "C" fn(FpgaHandle) -> u32;
type GetNumberShellRegistersFn = unsafe extern "C" fn(FpgaHandle, *mut u32) -> u32;
type ReadShellRegisterFn = unsafe extern "C" fn(FpgaHandle, u32, *mut u32) -> u32;
type WriteShellRegisterFn = unsafe extern "C" fn(FpgaHandle, u32, u32) -> u32;
type ReadSoftRegisterFn = unsafe extern "C" fn(FpgaHandle, u32, *mut u64) -> u32;
type WriteSoftRegisterFn = unsafe extern "C" fn(FpgaHandle, u32, u64) -> u32;
type GetNumberBuffersFn = unsafe extern "C" fn(FpgaHandle, *mut u32) -> u32;
type GetBufferSizeFn = unsafe extern "C" fn(FpgaHandle, *mut u32) -> u32;
type GetInputBufferFullFn = unsafe extern "C" fn(FpgaHandle, u32, *mut u8) -> u32;
type GetInputBufferPointerFn = unsafe extern "C" fn(FpgaHandle, u32, *mut *mut u8) -> u32;
type GetOutputBufferPointerFn = unsafe extern "C" fn(FpgaHandle, u32, *mut *mut u8) -> u32;
type SendInputBufferFn = unsafe extern "C" fn(FpgaHandle, u32, u32) -> u32;
type WaitOutputBufferFn =
    unsafe extern "C" fn(FpgaHandle, u32, *mut u32, u8, u32) -> u32;
type DiscardOutputBufferFn = unsafe extern "C" fn(FpgaHandle, u32) -> u32;
type GetLastErrorTextFn = unsafe extern "C" fn(*mut c_char, i32);

/// Entry points resolved from the shell library.
struct Api {
    create_handle: CreateHandleFn,
    close_handle: CloseHandleFn,
    get_number_shell_registers: GetNumberShellRegistersFn,
    read_shell_register: ReadShellRegisterFn,
    write_shell_register: WriteShellRegisterFn,
    read_soft_register: ReadSoftRegisterFn,
    write_soft_register: WriteSoftRegisterFn,
    get_number_buffers: GetNumberBuffersFn,
    get_buffer_size: GetBufferSizeFn,
    get_input_buffer_full: GetInputBufferFullFn,
    get_input_buffer_pointer: GetInputBufferPointerFn,
    get_output_buffer_pointer: GetOutputBufferPointerFn,
    send_input_buffer: SendInputBufferFn,
    wait_output_buffer: WaitOutputBufferFn,
    discard_output_buffer: DiscardOutputBufferFn,
    get_last_error_text: GetLastErrorTextFn,
}

macro_rules! resolve {
    ($lib:expr, $name:literal) => {
        *unsafe { $lib.get(concat!($name, "\0").as_bytes())? }
    };
}

impl Api {
    fn resolve(lib: &Library) -> Result<Self, libloading::Error> {
        Ok(Self {
            create_handle: resolve!(lib, "FPGA_CreateHandle"),
            close_handle: resolve!(lib, "FPGA_CloseHandle"),
            get_number_shell_registers: resolve!(lib, "FPGA_GetNumberShellRegisters"),
            read_shell_register: resolve!(lib, "FPGA_ReadShellRegister"),
            write_shell_register: resolve!(lib, "FPGA_WriteShellRegister"),
            read_soft_register: resolve!(lib, "FPGA_ReadSoftRegister"),
            write_soft_register: resolve!(lib, "FPGA_WriteSoftRegister"),
            get_number_buffers: resolve!(lib, "FPGA_GetNumberBuffers"),
            get_buffer_size: resolve!(lib, "FPGA_GetBufferSize"),
            get_input_buffer_full: resolve!(lib, "FPGA_GetInputBufferFull"),
            get_input_buffer_pointer: resolve!(lib, "FPGA_GetInputBufferPointer"),
            get_output_buffer_pointer: resolve!(lib, "FPGA_GetOutputBufferPointer"),
            send_input_buffer: resolve!(lib, "FPGA_SendInputBuffer"),
            wait_output_buffer: resolve!(lib, "FPGA_WaitOutputBuffer"),
            discard_output_buffer: resolve!(lib, "FPGA_DiscardOutputBuffer"),
            get_last_error_text: resolve!(lib, "FPGA_GetLastErrorText"),
        })
    }
}

/// Owned, bounds-checked view of one slot's DMA region.
///
/// Created fresh from the vendor-reported pointer for every call and
/// dropped before the call returns; never held across a suspension point.
struct DmaRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl DmaRegion {
    /// # Safety
    ///
    /// `ptr` must point to a live mapping of at least `len` bytes that
    /// stays valid while this view exists.
    unsafe fn new(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, len })
    }

    /// Copy `bytes` to the start of the region; false if it does not fit.
    fn write(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.len {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr(), bytes.len());
        }
        true
    }

    /// Copy `len` bytes out of the region; `None` if out of bounds.
    fn read(&self, len: usize) -> Option<Vec<u8>> {
        if len > self.len {
            return None;
        }
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), out.as_mut_ptr(), len);
        }
        Some(out)
    }
}

/// [`Driver`] implementation over the vendor shell library.
pub struct FpgaCoreLib {
    api: Api,
    handle: FpgaHandle,
    /// Cached so DMA bounds checks need no extra vendor call.
    buffer_bytes: usize,
    closed: AtomicBool,
    /// Host-side error text for failures the library never saw.
    host_error: Mutex<String>,
    _lib: Library,
}

// SAFETY: the handle is an opaque token the vendor library accepts from any
// thread; the library serializes device access internally, and the host
// core never lets two jobs drive the same slot concurrently.
unsafe impl Send for FpgaCoreLib {}
unsafe impl Sync for FpgaCoreLib {}

impl FpgaCoreLib {
    /// Load the shell library named in `config` and open a handle to the
    /// configured PCIe endpoint.
    pub fn load(config: &SessionConfig) -> CatapultResult<Self> {
        let lib = unsafe { Library::new(&config.library_path) }?;
        let api = Api::resolve(&lib).map_err(CatapultError::Library)?;

        let version_definitions = optional_path(config.version_definitions.as_deref())?;
        let version_manifest = optional_path(config.version_manifest.as_deref())?;
        let mut handle: FpgaHandle = std::ptr::null_mut();
        let status = unsafe {
            (api.create_handle)(
                config.endpoint,
                0,
                version_definitions
                    .as_ref()
                    .map_or(std::ptr::null(), |s| s.as_ptr()),
                version_manifest
                    .as_ref()
                    .map_or(std::ptr::null(), |s| s.as_ptr()),
                &mut handle,
            )
        };
        if let Err(status) = DriverStatus::from_raw(status).into_result() {
            return Err(CatapultError::Driver {
                call: "CreateHandle",
                status,
                message: library_error_text(&api),
            });
        }

        let mut buffer_bytes = 0u32;
        let status = unsafe { (api.get_buffer_size)(handle, &mut buffer_bytes) };
        if let Err(status) = DriverStatus::from_raw(status).into_result() {
            let message = library_error_text(&api);
            unsafe {
                let _ = (api.close_handle)(handle);
            }
            return Err(CatapultError::Driver {
                call: "GetBufferSize",
                status,
                message,
            });
        }

        Ok(Self {
            api,
            handle,
            buffer_bytes: buffer_bytes as usize,
            closed: AtomicBool::new(false),
            host_error: Mutex::new(String::new()),
            _lib: lib,
        })
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.host_fail(DriverStatus::InvalidHandle, "device handle is closed"));
        }
        Ok(())
    }

    fn host_fail(&self, status: DriverStatus, message: impl Into<String>) -> DriverStatus {
        *self
            .host_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = message.into();
        status
    }

    fn status(&self, raw: u32) -> DriverResult<()> {
        DriverStatus::from_raw(raw).into_result()
    }
}

impl Driver for FpgaCoreLib {
    fn shell_register_count(&self) -> DriverResult<u32> {
        self.ensure_open()?;
        let mut count = 0u32;
        self.status(unsafe { (self.api.get_number_shell_registers)(self.handle, &mut count) })?;
        Ok(count)
    }

    fn read_shell_register(&self, index: u32) -> DriverResult<u32> {
        self.ensure_open()?;
        let mut value = 0u32;
        self.status(unsafe { (self.api.read_shell_register)(self.handle, index, &mut value) })?;
        Ok(value)
    }

    fn write_shell_register(&self, index: u32, value: u32) -> DriverResult<()> {
        self.ensure_open()?;
        self.status(unsafe { (self.api.write_shell_register)(self.handle, index, value) })
    }

    fn read_soft_register(&self, index: u32) -> DriverResult<u64> {
        self.ensure_open()?;
        let mut value = 0u64;
        self.status(unsafe { (self.api.read_soft_register)(self.handle, index, &mut value) })?;
        Ok(value)
    }

    fn write_soft_register(&self, index: u32, value: u64) -> DriverResult<()> {
        self.ensure_open()?;
        self.status(unsafe { (self.api.write_soft_register)(self.handle, index, value) })
    }

    fn buffer_count(&self) -> DriverResult<u32> {
        self.ensure_open()?;
        let mut count = 0u32;
        self.status(unsafe { (self.api.get_number_buffers)(self.handle, &mut count) })?;
        Ok(count)
    }

    fn buffer_size(&self) -> DriverResult<u32> {
        self.ensure_open()?;
        Ok(self.buffer_bytes as u32)
    }

    fn input_buffer_full(&self, slot: usize) -> DriverResult<bool> {
        self.ensure_open()?;
        let mut full = 0u8;
        self.status(unsafe {
            (self.api.get_input_buffer_full)(self.handle, slot as u32, &mut full)
        })?;
        Ok(full != 0)
    }

    fn fill_input_buffer(&self, slot: usize, frame: &[u8]) -> DriverResult<()> {
        self.ensure_open()?;
        let mut ptr: *mut u8 = std::ptr::null_mut();
        self.status(unsafe {
            (self.api.get_input_buffer_pointer)(self.handle, slot as u32, &mut ptr)
        })?;
        // SAFETY: the vendor guarantees the pointer maps `buffer_bytes`
        // bytes for this slot until the buffer is sent.
        let Some(mut region) = (unsafe { DmaRegion::new(ptr, self.buffer_bytes) }) else {
            return Err(self.host_fail(
                DriverStatus::MemoryError,
                "library returned a null input buffer pointer",
            ));
        };
        if !region.write(frame) {
            return Err(self.host_fail(
                DriverStatus::MemoryError,
                format!(
                    "frame of {} bytes exceeds the {} byte DMA buffer",
                    frame.len(),
                    self.buffer_bytes
                ),
            ));
        }
        Ok(())
    }

    fn send_input_buffer(&self, slot: usize, len: u32) -> DriverResult<()> {
        self.ensure_open()?;
        self.status(unsafe { (self.api.send_input_buffer)(self.handle, slot as u32, len) })
    }

    fn wait_output_buffer(
        &self,
        slot: usize,
        timeout_ms: u32,
        flags: WaitFlags,
    ) -> DriverResult<u32> {
        self.ensure_open()?;
        let mut available = 0u32;
        let interrupt = u8::from(flags.contains(WaitFlags::INTERRUPT));
        self.status(unsafe {
            (self.api.wait_output_buffer)(
                self.handle,
                slot as u32,
                &mut available,
                interrupt,
                timeout_ms,
            )
        })?;
        Ok(available)
    }

    fn read_output_buffer(&self, slot: usize, len: usize) -> DriverResult<Vec<u8>> {
        self.ensure_open()?;
        let mut ptr: *mut u8 = std::ptr::null_mut();
        self.status(unsafe {
            (self.api.get_output_buffer_pointer)(self.handle, slot as u32, &mut ptr)
        })?;
        // SAFETY: the vendor guarantees the pointer maps `buffer_bytes`
        // bytes for this slot until the buffer is discarded.
        let Some(region) = (unsafe { DmaRegion::new(ptr, self.buffer_bytes) }) else {
            return Err(self.host_fail(
                DriverStatus::MemoryError,
                "library returned a null output buffer pointer",
            ));
        };
        region.read(len).ok_or_else(|| {
            self.host_fail(
                DriverStatus::MemoryError,
                format!(
                    "device reported {len} output bytes but the DMA buffer holds {}",
                    self.buffer_bytes
                ),
            )
        })
    }

    fn discard_output_buffer(&self, slot: usize) -> DriverResult<()> {
        self.ensure_open()?;
        self.status(unsafe { (self.api.discard_output_buffer)(self.handle, slot as u32) })
    }

    fn last_error_text(&self) -> String {
        let host = self
            .host_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if !host.is_empty() {
            return host;
        }
        library_error_text(&self.api)
    }

    fn close(&self) -> DriverResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(self.host_fail(DriverStatus::InvalidHandle, "device handle already closed"));
        }
        self.status(unsafe { (self.api.close_handle)(self.handle) })
    }
}

impl Drop for FpgaCoreLib {
    fn drop(&mut self) {
        // Session teardown normally closes first; this covers load()
        // succeeding but session construction failing before any owner
        // exists.
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe {
                let _ = (self.api.close_handle)(self.handle);
            }
        }
    }
}

fn optional_path(path: Option<&Path>) -> CatapultResult<Option<CString>> {
    match path {
        None => Ok(None),
        Some(path) => {
            let text = path.to_string_lossy();
            CString::new(text.as_bytes())
                .map(Some)
                .map_err(|_| CatapultError::InvalidDevice(format!(
                    "configured path {path:?} contains an interior NUL byte",
                )))
        }
    }
}

fn library_error_text(api: &Api) -> String {
    let mut buf = [0u8; 512];
    unsafe {
        (api.get_last_error_text)(buf.as_mut_ptr() as *mut c_char, buf.len() as i32);
    }
    // The library NUL-terminates; be defensive about a full buffer.
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dma_region_rejects_out_of_bounds() {
        let mut backing = vec![0u8; 64];
        let mut region = unsafe { DmaRegion::new(backing.as_mut_ptr(), backing.len()) }.unwrap();
        assert!(region.write(&[1u8; 64]));
        assert!(!region.write(&[1u8; 65]));
        assert_eq!(region.read(64).unwrap(), vec![1u8; 64]);
        assert!(region.read(65).is_none());
        drop(region);
        assert_eq!(backing[63], 1);
    }

    #[test]
    fn test_dma_region_rejects_null() {
        assert!(unsafe { DmaRegion::new(std::ptr::null_mut(), 64) }.is_none());
    }

    #[test]
    fn test_optional_path_handles_nul() {
        assert!(optional_path(None).unwrap().is_none());
        let ok = optional_path(Some(Path::new("/opt/shell/versions.ini"))).unwrap();
        assert!(ok.is_some());
    }
}
