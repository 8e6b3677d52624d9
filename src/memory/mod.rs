//! Device memory storage
//!
//! Two representations of a contiguous device-addressable region sit behind
//! one handle type:
//!
//! - **Buffer-backed**: a managed [`DeviceBuffer`] object shared by
//!   reference counting. The backing object lives as long as its longest
//!   holder, whether that is the caller or a handle wrapped for one
//!   operation.
//! - **UnifiedAddress-backed**: a raw device pointer in the unified address
//!   space. The handle records the address only and never owns the pointed-to
//!   memory; that lifetime belongs to the caller.
//!
//! Conflating the two ownership models is how use-after-free bugs happen,
//! which is why the asymmetry is encoded in the backing variants rather
//! than left to documentation alone.
//!
//! Byte offsets are stored on the handle and added at dereference time,
//! never baked into the backing object, so one backing object can be viewed
//! at many offsets and one kernel implementation can address either
//! representation through a single effective 64-bit address.

use std::sync::{Arc, Mutex, PoisonError};

use cudarc::driver::safe::{CudaContext, CudaStream};
use cudarc::driver::sys;

use crate::engine::{ComputeEngine, EngineKind};
use crate::error::{Error, Result};

// ============================================================================
// Internal Helpers
// ============================================================================

/// Check if the CUDA context on the current thread is valid.
///
/// # Safety
///
/// This function calls CUDA driver API directly. It is safe to call at any
/// time but the result is only valid for the current thread's context state.
#[inline]
unsafe fn is_cuda_context_valid() -> bool {
    let mut ctx: sys::CUcontext = std::ptr::null_mut();
    // SAFETY: cuCtxGetCurrent is safe to call at any time and writes to the
    // provided pointer.
    let result = unsafe { sys::cuCtxGetCurrent(&mut ctx) };
    result == sys::CUresult::CUDA_SUCCESS && !ctx.is_null()
}

/// Log a device memory operation failure.
///
/// Uses stderr with a consistent prefix for easy filtering. Reserved for
/// paths that cannot propagate a `Result` (deallocation).
#[cold]
#[inline(never)]
pub(crate) fn log_memory_error(operation: &str, ptr: u64, result: sys::CUresult) {
    eprintln!(
        "[accelr::memory] {} failed for ptr 0x{:x}: {:?}",
        operation, ptr, result
    );
}

/// Map an allocation failure to the crate error taxonomy.
fn alloc_error(size: usize, result: sys::CUresult) -> Error {
    if result == sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY {
        Error::OutOfMemory { size }
    } else {
        Error::Runtime(format!(
            "device allocation of {} bytes failed: {:?}",
            size, result
        ))
    }
}

// ============================================================================
// BackendKind
// ============================================================================

/// The two device-memory representations a handle can carry
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Opaque managed buffer object with shared ownership
    Buffer,
    /// Raw pointer in the unified device/host address space
    UnifiedAddress,
}

// ============================================================================
// DeviceBuffer
// ============================================================================

/// Managed device byte buffer, the backing object for Buffer-backed handles.
///
/// Allocation is stream-ordered on the owning context's default stream.
/// The buffer is untyped: element type is erased at this boundary so one
/// buffer is reusable for any numeric type.
///
/// Share it as `Arc<DeviceBuffer>`; the region is released when the last
/// holder drops.
pub struct DeviceBuffer {
    ptr: u64,
    size: usize,
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl DeviceBuffer {
    /// Allocate a zero-size-tolerant device buffer on an engine.
    ///
    /// A zero-byte request yields a null buffer, which wraps into a null
    /// handle (legal for optional kernel slots).
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] when the device is out of memory,
    /// [`Error::Unimplemented`] for host engines.
    pub fn alloc(engine: &ComputeEngine, size: usize) -> Result<Self> {
        let context = engine.context()?.clone();
        context.bind_to_thread()?;
        let stream = context.default_stream();

        if size == 0 {
            return Ok(Self {
                ptr: 0,
                size: 0,
                context,
                stream,
            });
        }

        let mut ptr: u64 = 0;
        // SAFETY: the context is bound to this thread and the stream belongs
        // to it; cuMemAllocAsync writes the new pointer on success.
        let result = unsafe { sys::cuMemAllocAsync(&mut ptr, size, stream.cu_stream()) };
        if result != sys::CUresult::CUDA_SUCCESS {
            return Err(alloc_error(size, result));
        }

        // Make the allocation visible to work on other streams of the same
        // context before the buffer escapes.
        stream.synchronize()?;

        Ok(Self {
            ptr,
            size,
            context,
            stream,
        })
    }

    /// Raw device pointer of this buffer (0 for the null buffer)
    #[inline]
    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }

    /// Size of the buffer in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy host data into the buffer at a byte offset.
    ///
    /// Blocks until the data is visible to the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the copy would run past the end
    /// of the buffer.
    pub fn upload<T: Copy>(&self, data: &[T], byte_offset: usize) -> Result<()> {
        let len_bytes = std::mem::size_of_val(data);
        if len_bytes == 0 {
            return Ok(());
        }
        self.check_extent("upload", byte_offset, len_bytes)?;
        self.context.bind_to_thread()?;

        // SAFETY: `data` is a live host slice reinterpreted as bytes; the
        // destination range was bounds-checked above.
        unsafe {
            let result = sys::cuMemcpyHtoDAsync_v2(
                self.ptr + byte_offset as u64,
                data.as_ptr() as *const std::ffi::c_void,
                len_bytes,
                self.stream.cu_stream(),
            );
            if result != sys::CUresult::CUDA_SUCCESS {
                return Err(Error::Runtime(format!(
                    "host-to-device copy of {} bytes failed: {:?}",
                    len_bytes, result
                )));
            }
        }
        self.stream.synchronize()?;
        Ok(())
    }

    /// Copy buffer contents at a byte offset back to host memory.
    ///
    /// Blocks until the data is visible on the host.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the copy would run past the end
    /// of the buffer.
    pub fn download<T: Copy>(&self, out: &mut [T], byte_offset: usize) -> Result<()> {
        let len_bytes = std::mem::size_of_val(out);
        if len_bytes == 0 {
            return Ok(());
        }
        self.check_extent("download", byte_offset, len_bytes)?;
        self.context.bind_to_thread()?;

        // SAFETY: `out` is a live host slice reinterpreted as bytes; the
        // source range was bounds-checked above.
        unsafe {
            let result = sys::cuMemcpyDtoHAsync_v2(
                out.as_mut_ptr() as *mut std::ffi::c_void,
                self.ptr + byte_offset as u64,
                len_bytes,
                self.stream.cu_stream(),
            );
            if result != sys::CUresult::CUDA_SUCCESS {
                return Err(Error::Runtime(format!(
                    "device-to-host copy of {} bytes failed: {:?}",
                    len_bytes, result
                )));
            }
        }
        self.stream.synchronize()?;
        Ok(())
    }

    fn check_extent(&self, arg: &'static str, byte_offset: usize, len_bytes: usize) -> Result<()> {
        match byte_offset.checked_add(len_bytes) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::invalid_argument(
                arg,
                format!(
                    "range starting at {} for {} bytes exceeds buffer size {}",
                    byte_offset, len_bytes, self.size
                ),
            )),
        }
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.ptr == 0 {
            return;
        }

        if self.context.bind_to_thread().is_err() {
            // Context is gone. The driver reclaims the memory on context
            // destruction.
            return;
        }

        // SAFETY: the pointer was produced by cuMemAllocAsync on this stream
        // and is freed exactly once.
        unsafe {
            if !is_cuda_context_valid() {
                return;
            }
            let result = sys::cuMemFreeAsync(self.ptr, self.stream.cu_stream());
            // Deallocation errors are typically benign (teardown order), but
            // they are worth a log line.
            if result != sys::CUresult::CUDA_SUCCESS
                && result != sys::CUresult::CUDA_ERROR_ILLEGAL_ADDRESS
            {
                log_memory_error("cuMemFreeAsync", self.ptr, result);
            }
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &format_args!("0x{:x}", self.ptr))
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// DeviceMemoryHandle
// ============================================================================

/// The active backing of a handle.
///
/// `Buffer` shares ownership of the backing object; `Unified` is a weak
/// reference in all but name, it records the address and nothing else.
enum Backing {
    Buffer(Arc<DeviceBuffer>),
    Unified(u64),
}

/// Polymorphic reference to a contiguous device-addressable region.
///
/// Exactly one backing kind is active for the lifetime of the handle. The
/// byte offset is applied when the effective address is computed, not at
/// construction of the backing object, and callers pass byte extents: the
/// handle never reinterprets element types.
pub struct DeviceMemoryHandle {
    backing: Backing,
    offset: usize,
    size: usize,
    mapped: Mutex<Option<Box<[u8]>>>,
}

impl DeviceMemoryHandle {
    /// Wrap a managed buffer object for one operation.
    ///
    /// The handle shares ownership of the backing object with the caller;
    /// the region lives as long as the longest holder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the engine's runtime
    /// configuration does not support device buffers (host engines) or the
    /// byte extent exceeds the backing object.
    pub fn wrap_buffer(
        engine: &ComputeEngine,
        size: usize,
        byte_offset: usize,
        buffer: &Arc<DeviceBuffer>,
    ) -> Result<Self> {
        check_engine_supports(engine, BackendKind::Buffer)?;
        if buffer.device_ptr() != 0 {
            match byte_offset.checked_add(size) {
                Some(end) if end <= buffer.size() => {}
                _ => {
                    return Err(Error::invalid_argument(
                        "byte_offset",
                        format!(
                            "view starting at {} for {} bytes exceeds backing object size {}",
                            byte_offset,
                            size,
                            buffer.size()
                        ),
                    ));
                }
            }
        }
        Ok(Self {
            backing: Backing::Buffer(Arc::clone(buffer)),
            offset: byte_offset,
            size,
            mapped: Mutex::new(None),
        })
    }

    /// Wrap a raw unified-address pointer for one operation.
    ///
    /// The handle does not own the pointed-to memory. Keeping the region
    /// alive while any handle references it is the caller's contract; a
    /// pointer of 0 produces a null handle (legal for optional kernel
    /// slots).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the engine's runtime
    /// configuration does not support unified addresses (host engines).
    pub fn wrap_unified(
        engine: &ComputeEngine,
        size: usize,
        byte_offset: usize,
        ptr: u64,
    ) -> Result<Self> {
        check_engine_supports(engine, BackendKind::UnifiedAddress)?;
        Ok(Self {
            backing: Backing::Unified(ptr),
            offset: byte_offset,
            size,
            mapped: Mutex::new(None),
        })
    }

    /// Which representation backs this handle
    #[inline]
    pub fn backend_kind(&self) -> BackendKind {
        match self.backing {
            Backing::Buffer(_) => BackendKind::Buffer,
            Backing::Unified(_) => BackendKind::UnifiedAddress,
        }
    }

    /// Byte extent of the view
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Byte offset added at dereference time
    #[inline]
    pub fn byte_offset(&self) -> usize {
        self.offset
    }

    /// True when the handle references no memory.
    ///
    /// Null handles bind as null kernel arguments instead of failing, so
    /// kernels may declare optional memory slots.
    #[inline]
    pub fn is_null(&self) -> bool {
        match &self.backing {
            Backing::Buffer(b) => b.device_ptr() == 0,
            Backing::Unified(p) => *p == 0,
        }
    }

    /// The managed backing object of a Buffer-backed handle.
    ///
    /// # Errors
    ///
    /// Calling this on a UnifiedAddress handle is a programming error and
    /// fails with [`Error::WrongBackendKind`].
    pub fn backing_buffer(&self) -> Result<&Arc<DeviceBuffer>> {
        match &self.backing {
            Backing::Buffer(b) => Ok(b),
            Backing::Unified(_) => Err(Error::WrongBackendKind {
                expected: BackendKind::Buffer,
                got: BackendKind::UnifiedAddress,
            }),
        }
    }

    /// Rebind the handle's backing object.
    ///
    /// The new object is adopted as an untyped byte view; whatever element
    /// type it was created for is erased at this boundary, so the handle is
    /// reusable for any numeric type.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::WrongBackendKind`] on UnifiedAddress handles.
    pub fn set_backing_buffer(&mut self, buffer: Arc<DeviceBuffer>) -> Result<()> {
        match &mut self.backing {
            Backing::Buffer(b) => {
                *b = buffer;
                Ok(())
            }
            Backing::Unified(_) => Err(Error::WrongBackendKind {
                expected: BackendKind::Buffer,
                got: BackendKind::UnifiedAddress,
            }),
        }
    }

    /// Base offset the runtime requires on top of the backing address.
    ///
    /// CUDA device byte addresses are absolute, so this is always 0 here.
    /// Runtimes whose unified addresses are relative to an opaque
    /// context-wide base report it through this hook; argument binding adds
    /// it unconditionally so the effective-address computation never
    /// branches per element type.
    #[inline]
    pub fn base_offset(&self) -> u64 {
        0
    }

    /// Effective device address: backing base + base offset + byte offset.
    ///
    /// Null handles resolve to the null address regardless of offset.
    #[inline]
    pub fn resolve_ptr(&self) -> u64 {
        let base = match &self.backing {
            Backing::Buffer(b) => b.device_ptr(),
            Backing::Unified(p) => *p,
        };
        if base == 0 {
            return 0;
        }
        base + self.base_offset() + self.offset as u64
    }

    /// Acquire host visibility of the region.
    ///
    /// Returns a host pointer to `size()` bytes that are coherent for host
    /// reads and writes until the matching [`unmap`](Self::unmap). The pair
    /// must be balanced: the layer does not release the mapping on scope
    /// exit, failing to unmap leaks the staging memory and loses writes.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] if the handle is null or
    /// already mapped.
    pub fn map_for_host(&self, stream: &crate::stream::ComputeStream) -> Result<*mut u8> {
        if self.is_null() {
            return Err(Error::invalid_argument("handle", "cannot map null memory"));
        }
        let mut guard = self.mapped.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Err(Error::invalid_argument("handle", "region is already mapped"));
        }

        let mut staging = vec![0u8; self.size].into_boxed_slice();
        // SAFETY: the staging slice is live host memory of exactly `size`
        // bytes and the effective address was validated at wrap time.
        unsafe {
            let result = sys::cuMemcpyDtoHAsync_v2(
                staging.as_mut_ptr() as *mut std::ffi::c_void,
                self.resolve_ptr(),
                self.size,
                stream.queue().cu_stream(),
            );
            if result != sys::CUresult::CUDA_SUCCESS {
                return Err(Error::Runtime(format!(
                    "map_for_host copy failed: {:?}",
                    result
                )));
            }
        }
        stream.wait()?;

        let ptr = staging.as_mut_ptr();
        *guard = Some(staging);
        Ok(ptr)
    }

    /// Release a host mapping and resynchronize the device-side view.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] if `ptr` is not the pointer
    /// returned by the matching [`map_for_host`](Self::map_for_host).
    pub fn unmap(&self, stream: &crate::stream::ComputeStream, ptr: *mut u8) -> Result<()> {
        let mut guard = self.mapped.lock().unwrap_or_else(PoisonError::into_inner);
        let staging = match guard.take() {
            Some(s) if s.as_ptr() as *mut u8 == ptr => s,
            Some(s) => {
                // Not ours; put the mapping back before failing.
                *guard = Some(s);
                return Err(Error::invalid_argument(
                    "ptr",
                    "pointer does not belong to this mapping",
                ));
            }
            None => {
                return Err(Error::invalid_argument("handle", "region is not mapped"));
            }
        };

        // SAFETY: staging holds `size` live host bytes; the device range was
        // validated at wrap time.
        unsafe {
            let result = sys::cuMemcpyHtoDAsync_v2(
                self.resolve_ptr(),
                staging.as_ptr() as *const std::ffi::c_void,
                self.size,
                stream.queue().cu_stream(),
            );
            if result != sys::CUresult::CUDA_SUCCESS {
                return Err(Error::Runtime(format!("unmap copy failed: {:?}", result)));
            }
        }
        stream.wait()
    }
}

impl std::fmt::Debug for DeviceMemoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemoryHandle")
            .field("kind", &self.backend_kind())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A handle can only be wrapped for an engine whose runtime configuration
/// has a device address space.
fn check_engine_supports(engine: &ComputeEngine, kind: BackendKind) -> Result<()> {
    if engine.kind() != EngineKind::Gpu {
        return Err(Error::invalid_argument(
            "engine",
            format!("{:?} memory is not supported on a host engine", kind),
        ));
    }
    Ok(())
}
