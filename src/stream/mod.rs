//! Compute streams and completion tokens
//!
//! A [`ComputeStream`] binds one native command queue to its owning engine.
//! All kernels are submitted through a stream, and a stream is where ordering
//! and completion are observed: work on the same stream executes in
//! submission order, work on different streams is unordered unless a
//! [`CompletionToken`] is passed as an explicit dependency.

use std::sync::Arc;

use cudarc::driver::safe::{CudaEvent, CudaStream};

use crate::engine::ComputeEngine;
use crate::error::Result;

/// One native command queue bound to an engine.
///
/// The caller owns and supplies the queue; the layer never creates one on
/// its own. The binding is checked at creation time
/// ([`ComputeEngine::create_stream`]): the queue's context must belong to
/// the same device as the engine.
pub struct ComputeStream {
    engine: ComputeEngine,
    queue: Arc<CudaStream>,
}

impl ComputeStream {
    pub(crate) fn new(engine: ComputeEngine, queue: Arc<CudaStream>) -> Self {
        Self { engine, queue }
    }

    /// The engine this stream belongs to
    #[inline]
    pub fn engine(&self) -> &ComputeEngine {
        &self.engine
    }

    /// The underlying native queue
    #[inline]
    pub fn queue(&self) -> &Arc<CudaStream> {
        &self.queue
    }

    /// Block the calling thread until all work submitted on this stream
    /// (and its acknowledged dependencies) has completed.
    ///
    /// This is a barrier, not a teardown: the stream remains usable
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Surfaces the first error encountered among the completed work.
    pub fn wait(&self) -> Result<()> {
        self.queue.synchronize()?;
        Ok(())
    }
}

impl std::fmt::Debug for ComputeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeStream")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

/// Opaque handle for one asynchronous device submission.
///
/// A token is consumable exactly once via [`wait`](Self::wait). Dropping an
/// unconsumed token is safe and means fire-and-forget: no failure from that
/// invocation can be observed by the caller afterwards. That asymmetry is
/// part of the contract, not an oversight; callers that care about failures
/// must hold a wait point.
pub struct CompletionToken {
    event: Option<CudaEvent>,
}

impl CompletionToken {
    pub(crate) fn new(event: CudaEvent) -> Self {
        Self { event: Some(event) }
    }

    /// An already-completed token.
    ///
    /// Produced for zero-extent launches, which are legal no-ops that never
    /// touch the device.
    pub fn completed() -> Self {
        Self { event: None }
    }

    pub(crate) fn event(&self) -> Option<&CudaEvent> {
        self.event.as_ref()
    }

    /// Block until the submission this token represents has completed.
    ///
    /// # Errors
    ///
    /// Surfaces the execution failure of the submission, if any.
    pub fn wait(self) -> Result<()> {
        if let Some(event) = self.event {
            event.synchronize()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionToken")
            .field("pending", &self.event.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_token_waits_immediately() {
        let token = CompletionToken::completed();
        assert!(token.event().is_none());
        token.wait().unwrap();
    }
}
