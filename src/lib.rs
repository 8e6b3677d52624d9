//! # accelr
//!
//! **Device-memory abstraction and kernel-dispatch layer for GPU numerical kernels.**
//!
//! accelr lets a single logical tensor operation run against different
//! device-memory representations and dispatches it onto an accelerator
//! command queue with correct synchronization and no avoidable data copies.
//!
//! # Architecture
//!
//! ```text
//! ComputeEngine (device + execution context)
//! ├── ComputeStream (wraps the caller's native command queue)
//! ├── DeviceMemoryHandle (Buffer-backed or UnifiedAddress-backed)
//! ├── kernel::submit (generic argument binding + async launch)
//! └── gemm (end-to-end consumer: matrix multiply pipeline)
//! ```
//!
//! The caller owns the native queue; accelr only wraps it. Work submitted on
//! one stream executes in submission order. Cross-stream ordering exists only
//! when a [`stream::CompletionToken`] from one submission is passed as a
//! dependency to another.
//!
//! # Memory representations
//!
//! A [`memory::DeviceMemoryHandle`] is backed either by a managed,
//! reference-counted [`memory::DeviceBuffer`] (lifetime = longest holder) or
//! by a raw unified-address pointer the caller owns. The backing kind is
//! fixed when the handle is constructed and byte offsets are applied at
//! dereference time, so one kernel implementation addresses both
//! representations uniformly.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use accelr::prelude::*;
//!
//! let engine = ComputeEngine::new(EngineKind::Gpu, 0)?;
//! let queue = engine.context()?.new_stream()?;
//!
//! let a = engine.alloc_buffer(4 * 16)?;
//! let b = engine.alloc_buffer(4 * 16)?;
//! let c = engine.alloc_buffer(4 * 16)?;
//! a.upload(&identity, 0)?;
//! b.upload(&data, 0)?;
//!
//! accelr::gemm::gemm_f32(
//!     &queue, 'N', 'N', 4, 4, 4, 1.0, &a, 0, 4, &b, 0, 4, 0.0, &c, 0, 4,
//! )?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dtype;
pub mod engine;
pub mod error;
pub mod gemm;
pub mod kernel;
pub mod memory;
pub mod stream;

// The device substrate is part of the public surface: the caller creates and
// owns the native command queue through it.
pub use cudarc;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::dtype::ElementKind;
    pub use crate::engine::{ComputeEngine, EngineKind};
    pub use crate::error::{Error, Result};
    pub use crate::kernel::{KernelArg, NdRange, ScalarArg};
    pub use crate::memory::{BackendKind, DeviceBuffer, DeviceMemoryHandle};
    pub use crate::stream::{CompletionToken, ComputeStream};
}
