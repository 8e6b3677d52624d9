//! Compute engines
//!
//! A [`ComputeEngine`] represents one accelerator device together with its
//! execution context, and acts as the factory for streams and for memory of
//! either backing kind. Engines are created on demand from a device index or
//! from a caller-supplied queue and are not pooled; there is no process-wide
//! registry beyond what the device runtime itself maintains.

use std::sync::Arc;

use cudarc::driver::safe::{CudaContext, CudaStream};
use cudarc::driver::sys;

use crate::error::{Error, Result};
use crate::memory::{log_memory_error, DeviceBuffer};
use crate::stream::ComputeStream;

/// The kind of device an engine is bound to
///
/// The engine kind determines which kernel paths are legal. The GEMM path
/// requires a Gpu engine; host engines report
/// [`Error::Unimplemented`] instead of silently falling back.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// Host processor. Constructible, but execution paths are unimplemented
    /// in this layer.
    Cpu,
    /// Accelerator device with its own command queues.
    Gpu,
}

/// One device plus its execution context.
///
/// Exactly one context per engine instance. GPU engines hold the device's
/// primary context; host engines carry no execution context and exist so the
/// unsupported paths fail deliberately rather than by accident.
#[derive(Clone)]
pub struct ComputeEngine {
    kind: EngineKind,
    index: usize,
    context: Option<Arc<CudaContext>>,
}

impl ComputeEngine {
    /// Create an engine from a device kind and index.
    ///
    /// This is an explicit factory: no engine cache, no hidden enumeration
    /// state.
    ///
    /// # Errors
    ///
    /// For Gpu engines, fails when the device index is invalid or the
    /// driver cannot create the context.
    pub fn new(kind: EngineKind, index: usize) -> Result<Self> {
        let context = match kind {
            EngineKind::Cpu => None,
            EngineKind::Gpu => {
                let context = CudaContext::new(index)?;
                context.bind_to_thread()?;
                Some(context)
            }
        };
        Ok(Self {
            kind,
            index,
            context,
        })
    }

    /// Create an engine by inspecting the device behind a caller-owned
    /// queue.
    ///
    /// Native command queues always denote an accelerator device, so the
    /// resulting engine is Gpu-kind and shares the queue's context.
    pub fn from_queue(queue: &Arc<CudaStream>) -> Result<Self> {
        let context = queue.context().clone();
        let index = context.ordinal();
        Ok(Self {
            kind: EngineKind::Gpu,
            index,
            context: Some(context),
        })
    }

    /// The engine kind
    #[inline]
    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Device index this engine is bound to
    #[inline]
    pub fn ordinal(&self) -> usize {
        self.index
    }

    /// Human-readable name, e.g. `gpu:0`
    pub fn name(&self) -> String {
        match self.kind {
            EngineKind::Cpu => format!("cpu:{}", self.index),
            EngineKind::Gpu => format!("gpu:{}", self.index),
        }
    }

    /// The execution context of this engine.
    ///
    /// # Errors
    ///
    /// Host engines have no device execution context and fail with
    /// [`Error::Unimplemented`].
    pub fn context(&self) -> Result<&Arc<CudaContext>> {
        self.context
            .as_ref()
            .ok_or_else(|| Error::unimplemented("execution context on a host engine"))
    }

    /// Bind an existing native queue to a new stream on this engine.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] when the queue's context does
    /// not belong to the same device as this engine.
    pub fn create_stream(&self, queue: Arc<CudaStream>) -> Result<ComputeStream> {
        match &self.context {
            Some(context) => {
                let queue_ordinal = queue.context().ordinal();
                if queue_ordinal != context.ordinal() {
                    return Err(Error::invalid_argument(
                        "queue",
                        format!(
                            "queue belongs to device {} but the engine is bound to device {}",
                            queue_ordinal,
                            context.ordinal()
                        ),
                    ));
                }
                Ok(ComputeStream::new(self.clone(), queue))
            }
            None => Err(Error::invalid_argument(
                "queue",
                "a device queue cannot be bound to a host engine",
            )),
        }
    }

    /// Allocate a managed backing object on this engine.
    ///
    /// Convenience factory for the Buffer-backed memory representation.
    pub fn alloc_buffer(&self, size: usize) -> Result<Arc<DeviceBuffer>> {
        DeviceBuffer::alloc(self, size).map(Arc::new)
    }

    /// Allocate unified memory addressable from both host and device.
    ///
    /// Returns the raw address for use with the UnifiedAddress memory
    /// representation. The caller owns the region and releases it with
    /// [`free_unified`](Self::free_unified). A zero-byte request returns the
    /// null address.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::OutOfMemory`] when the device is out of memory
    /// and [`Error::Unimplemented`] on host engines.
    pub fn alloc_unified(&self, size: usize) -> Result<u64> {
        let context = self.context()?;
        context.bind_to_thread()?;
        if size == 0 {
            return Ok(0);
        }

        let mut ptr: u64 = 0;
        // SAFETY: the context is bound to this thread; cuMemAllocManaged
        // writes the new pointer on success.
        let result = unsafe {
            sys::cuMemAllocManaged(
                &mut ptr,
                size,
                sys::CUmemAttach_flags::CU_MEM_ATTACH_GLOBAL as u32,
            )
        };
        match result {
            sys::CUresult::CUDA_SUCCESS => Ok(ptr),
            sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY => Err(Error::OutOfMemory { size }),
            other => Err(Error::Runtime(format!(
                "unified allocation of {} bytes failed: {:?}",
                size, other
            ))),
        }
    }

    /// Release a unified-memory region obtained from
    /// [`alloc_unified`](Self::alloc_unified).
    ///
    /// Freeing the null address is a no-op. Failures cannot propagate from a
    /// release path and are logged instead.
    pub fn free_unified(&self, ptr: u64) {
        if ptr == 0 {
            return;
        }
        let Some(context) = &self.context else {
            return;
        };
        if context.bind_to_thread().is_err() {
            return;
        }
        // SAFETY: the pointer came from cuMemAllocManaged on this context
        // and is freed exactly once by contract.
        let result = unsafe { sys::cuMemFree_v2(ptr) };
        if result != sys::CUresult::CUDA_SUCCESS {
            log_memory_error("cuMemFree", ptr, result);
        }
    }
}

impl std::fmt::Debug for ComputeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeEngine")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
