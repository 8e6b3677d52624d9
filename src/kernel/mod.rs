//! Generic kernel dispatch
//!
//! [`submit`] turns a precompiled kernel handle plus a typed argument list
//! into one asynchronous unit of work on a stream, returning a
//! [`CompletionToken`] for its completion.
//!
//! # Argument binding
//!
//! Argument order must exactly match the kernel's declared signature order.
//! Memory references resolve through the handle's backing kind to a single
//! effective 64-bit address; an absent reference binds a null pointer, so
//! kernels may declare optional memory slots. Scalars are dispatched on byte
//! width, and the protocol recognizes exactly the four canonical widths
//! (1, 2, 4, 8 bytes); anything else is rejected synchronously.
//!
//! # Failure visibility
//!
//! Submission never blocks. Host-side problems (bad scalar width) surface
//! synchronously from [`submit`]; device-side execution failures surface only
//! when the token or an enclosing stream `wait()` is observed.

use cudarc::driver::safe::{CudaFunction, LaunchConfig};
use cudarc::driver::PushKernelArg;

use crate::error::{Error, Result};
use crate::memory::DeviceMemoryHandle;
use crate::stream::{CompletionToken, ComputeStream};

/// Default workgroup width when the caller supplies no local range
pub const BLOCK_SIZE: u32 = 256;

// ============================================================================
// Arguments
// ============================================================================

/// A scalar kernel argument captured as raw bytes plus a width.
///
/// Width validation happens at bind time, not construction time, so an
/// argument list can be assembled without touching the device.
#[derive(Clone, Debug)]
pub struct ScalarArg {
    bytes: Vec<u8>,
}

impl ScalarArg {
    /// Capture any plain value by its in-memory bytes.
    pub fn new<T: Copy>(value: &T) -> Self {
        let size = std::mem::size_of::<T>();
        let mut bytes = vec![0u8; size];
        // SAFETY: `value` is a live `T` of exactly `size` bytes and the
        // destination was just allocated with the same length.
        unsafe {
            std::ptr::copy_nonoverlapping(value as *const T as *const u8, bytes.as_mut_ptr(), size);
        }
        Self { bytes }
    }

    /// Capture a raw byte blob.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// Width of the scalar in bytes
    #[inline]
    pub fn width(&self) -> usize {
        self.bytes.len()
    }
}

/// One entry of a kernel argument list
pub enum KernelArg<'a> {
    /// Device memory reference; `None` binds a null pointer (optional slot)
    Memory(Option<&'a DeviceMemoryHandle>),
    /// Scalar value dispatched on byte width
    Scalar(ScalarArg),
}

impl<'a> KernelArg<'a> {
    /// Shorthand for a bound memory reference
    pub fn memory(handle: &'a DeviceMemoryHandle) -> Self {
        Self::Memory(Some(handle))
    }

    /// Shorthand for a scalar argument
    pub fn scalar<T: Copy>(value: &T) -> Self {
        Self::Scalar(ScalarArg::new(value))
    }
}

/// Device-native representation of one bound argument slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BoundArg {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Ptr(u64),
}

/// Dispatch a scalar on its byte width.
///
/// The protocol recognizes 1, 2, 4 and 8 byte scalars; any other width is a
/// hard failure.
pub(crate) fn bind_scalar(arg: &ScalarArg) -> Result<BoundArg> {
    match arg.bytes.as_slice() {
        &[b0] => Ok(BoundArg::U8(b0)),
        &[b0, b1] => Ok(BoundArg::U16(u16::from_ne_bytes([b0, b1]))),
        &[b0, b1, b2, b3] => Ok(BoundArg::U32(u32::from_ne_bytes([b0, b1, b2, b3]))),
        &[b0, b1, b2, b3, b4, b5, b6, b7] => Ok(BoundArg::U64(u64::from_ne_bytes([
            b0, b1, b2, b3, b4, b5, b6, b7,
        ]))),
        other => Err(Error::UnsupportedArgumentWidth { width: other.len() }),
    }
}

fn bind_args(args: &[KernelArg<'_>]) -> Result<Vec<BoundArg>> {
    args.iter()
        .map(|arg| match arg {
            KernelArg::Memory(Some(handle)) => Ok(BoundArg::Ptr(handle.resolve_ptr())),
            KernelArg::Memory(None) => Ok(BoundArg::Ptr(0)),
            KernelArg::Scalar(scalar) => bind_scalar(scalar),
        })
        .collect()
}

// ============================================================================
// Launch geometry
// ============================================================================

/// Launch geometry: a global item range plus an optional local (workgroup)
/// range.
///
/// When a local range is present, the launch uses the combined
/// global+local form and the grid covers the global range rounded up to
/// whole workgroups. Without one, a default one-dimensional tiling of
/// [`BLOCK_SIZE`] is applied to the first axis. Kernels must bounds-check
/// against the true extents either way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NdRange {
    global: [u64; 3],
    local: Option<[u64; 3]>,
}

impl NdRange {
    /// One-dimensional range
    pub fn linear(x: u64) -> Self {
        Self {
            global: [x, 1, 1],
            local: None,
        }
    }

    /// Two-dimensional range
    pub fn two_d(x: u64, y: u64) -> Self {
        Self {
            global: [x, y, 1],
            local: None,
        }
    }

    /// Three-dimensional range
    pub fn three_d(x: u64, y: u64, z: u64) -> Self {
        Self {
            global: [x, y, z],
            local: None,
        }
    }

    /// Attach an explicit local (workgroup) range. Zero extents are lifted
    /// to 1.
    pub fn with_local(mut self, local: [u64; 3]) -> Self {
        self.local = Some(local.map(|d| d.max(1)));
        self
    }

    /// Global extents
    #[inline]
    pub fn global(&self) -> [u64; 3] {
        self.global
    }

    /// A zero-extent range is a legal no-op.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.global.iter().any(|&d| d == 0)
    }

    /// Map the range onto a device launch configuration.
    pub(crate) fn launch_config(&self) -> LaunchConfig {
        let (grid, block) = match self.local {
            Some(local) => {
                let grid = [
                    self.global[0].div_ceil(local[0]),
                    self.global[1].div_ceil(local[1]),
                    self.global[2].div_ceil(local[2]),
                ];
                (grid, local)
            }
            None => {
                let grid = [
                    self.global[0].div_ceil(BLOCK_SIZE as u64),
                    self.global[1],
                    self.global[2],
                ];
                (grid, [BLOCK_SIZE as u64, 1, 1])
            }
        };
        LaunchConfig {
            grid_dim: (grid[0] as u32, grid[1] as u32, grid[2] as u32),
            block_dim: (block[0] as u32, block[1] as u32, block[2] as u32),
            shared_mem_bytes: 0,
        }
    }
}

// ============================================================================
// Submission
// ============================================================================

/// Submit one asynchronous kernel invocation on a stream.
///
/// Enqueues the work and returns immediately with a token representing
/// future completion. Dependencies must be tokens produced on the same or an
/// upstream engine; they are waited by the device before the launch, not by
/// the host.
///
/// A zero-extent `range` short-circuits to an already-completed token
/// without touching the device.
///
/// # Errors
///
/// Fails synchronously on unsupported scalar widths and on driver launch
/// errors detected at submission time.
pub fn submit(
    stream: &ComputeStream,
    kernel: &CudaFunction,
    args: &[KernelArg<'_>],
    range: &NdRange,
    deps: &[&CompletionToken],
) -> Result<CompletionToken> {
    if range.is_zero() {
        return Ok(CompletionToken::completed());
    }

    // Resolve the whole argument list before touching the queue so binding
    // failures never leave a partial submission behind.
    let bound = bind_args(args)?;

    for dep in deps {
        if let Some(event) = dep.event() {
            stream.queue().wait(event)?;
        }
    }

    let config = range.launch_config();
    let mut builder = stream.queue().launch_builder(kernel);
    for arg in &bound {
        match arg {
            BoundArg::U8(v) => builder.arg(v),
            BoundArg::U16(v) => builder.arg(v),
            BoundArg::U32(v) => builder.arg(v),
            BoundArg::U64(v) => builder.arg(v),
            BoundArg::Ptr(v) => builder.arg(v),
        };
    }

    // SAFETY: argument count and types are the caller's contract with the
    // compiled kernel, mirrored one-to-one from `args`.
    unsafe { builder.launch(config) }
        .map_err(|e| Error::Runtime(format!("kernel launch failed: {:?}", e)))?;

    let event = stream.engine().context()?.new_event(None)?;
    event.record(stream.queue())?;
    Ok(CompletionToken::new(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_widths_bind() {
        assert_eq!(
            bind_scalar(&ScalarArg::new(&0xabu8)).unwrap(),
            BoundArg::U8(0xab)
        );
        assert_eq!(
            bind_scalar(&ScalarArg::new(&0x1234u16)).unwrap(),
            BoundArg::U16(0x1234)
        );
        assert_eq!(
            bind_scalar(&ScalarArg::new(&7i32)).unwrap(),
            BoundArg::U32(7)
        );
        assert_eq!(
            bind_scalar(&ScalarArg::new(&1.5f32)).unwrap(),
            BoundArg::U32(1.5f32.to_bits())
        );
        assert_eq!(
            bind_scalar(&ScalarArg::new(&u64::MAX)).unwrap(),
            BoundArg::U64(u64::MAX)
        );
    }

    #[test]
    fn test_unsupported_scalar_widths_fail() {
        for width in [0usize, 3, 5, 16] {
            let arg = ScalarArg::from_bytes(&vec![0u8; width]);
            match bind_scalar(&arg) {
                Err(Error::UnsupportedArgumentWidth { width: w }) => assert_eq!(w, width),
                other => panic!("width {} should fail, got {:?}", width, other),
            }
        }
    }

    #[test]
    fn test_null_memory_binds_null_pointer() {
        let bound = bind_args(&[KernelArg::Memory(None)]).unwrap();
        assert_eq!(bound, vec![BoundArg::Ptr(0)]);
    }

    #[test]
    fn test_zero_extent_detection() {
        assert!(NdRange::linear(0).is_zero());
        assert!(NdRange::two_d(4, 0).is_zero());
        assert!(!NdRange::three_d(1, 1, 1).is_zero());
    }

    #[test]
    fn test_default_tiling_rounds_up() {
        let cfg = NdRange::linear(BLOCK_SIZE as u64 + 1).launch_config();
        assert_eq!(cfg.grid_dim, (2, 1, 1));
        assert_eq!(cfg.block_dim, (BLOCK_SIZE, 1, 1));
        assert_eq!(cfg.shared_mem_bytes, 0);
    }

    #[test]
    fn test_explicit_local_range() {
        let cfg = NdRange::two_d(33, 17).with_local([16, 16, 1]).launch_config();
        assert_eq!(cfg.grid_dim, (3, 2, 1));
        assert_eq!(cfg.block_dim, (16, 16, 1));
    }
}
