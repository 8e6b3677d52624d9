//! Internal GEMM pipeline
//!
//! One column-major implementation drives both public calling conventions
//! and both memory representations. The pipeline wires the full execution
//! layer together: engine resolution, stream binding, operand wrapping,
//! primitive execution and the final blocking wait.

use std::sync::Arc;

use cudarc::driver::safe::CudaStream;

use crate::dtype::ElementKind;
use crate::engine::{ComputeEngine, EngineKind};
use crate::error::{Error, Result};
use crate::memory::{DeviceBuffer, DeviceMemoryHandle};

use super::desc::{
    check_gemm_input, gemm_memory_desc, GemmDesc, Transpose, OPERAND_A, OPERAND_B, OPERAND_C,
};
use super::primitive::{GemmOperands, MatmulPrimitiveDesc};

/// One caller-supplied operand in whichever representation the entry point
/// was written for.
pub(crate) enum OperandRef<'a> {
    /// Managed buffer object; the handle will share ownership
    Buffer(&'a Arc<DeviceBuffer>),
    /// Raw unified-address pointer; the caller keeps ownership
    Unified(u64),
}

fn wrap_operand(
    engine: &ComputeEngine,
    operand: &OperandRef<'_>,
    size: usize,
    offset_elems: i64,
    elem: ElementKind,
) -> Result<DeviceMemoryHandle> {
    if offset_elems < 0 {
        return Err(Error::invalid_argument(
            "offset",
            format!("element offset must be non-negative, got {}", offset_elems),
        ));
    }
    // Offsets are scaled to bytes exactly once, here; every later
    // dereference is plain pointer addition.
    let byte_offset = offset_elems as usize * elem.size_in_bytes();
    match operand {
        OperandRef::Buffer(buffer) => {
            DeviceMemoryHandle::wrap_buffer(engine, size, byte_offset, buffer)
        }
        OperandRef::Unified(ptr) => DeviceMemoryHandle::wrap_unified(engine, size, byte_offset, *ptr),
    }
}

/// Execute one column-major GEMM against a caller-owned queue.
///
/// The steps mirror the contract exactly: validate, resolve the engine,
/// refuse host devices, build descriptors, compile the primitive, wrap the
/// operands, execute and block on completion. Caller-owned memory is never
/// touched on a failure path that precedes device submission.
#[allow(clippy::too_many_arguments)]
pub(crate) fn execute_gemm(
    queue: &Arc<CudaStream>,
    transa: Transpose,
    transb: Transpose,
    m: i64,
    n: i64,
    k: i64,
    alpha: f32,
    a: OperandRef<'_>,
    offset_a: i64,
    lda: i64,
    b: OperandRef<'_>,
    offset_b: i64,
    ldb: i64,
    beta: f32,
    c: OperandRef<'_>,
    offset_c: i64,
    ldc: i64,
    elem: ElementKind,
) -> Result<()> {
    check_gemm_input(transa, transb, m, n, k, lda, ldb, ldc)?;

    let engine = ComputeEngine::from_queue(queue)?;
    if engine.kind() != EngineKind::Gpu {
        return Err(Error::unimplemented("matrix multiply on a host engine"));
    }

    let stream = engine.create_stream(queue.clone())?;

    let desc = GemmDesc {
        transa,
        transb,
        m,
        n,
        k,
        lda,
        ldb,
        ldc,
        alpha,
        beta,
        elem,
    };

    let a_desc = gemm_memory_desc(&desc, OPERAND_A)?;
    let b_desc = gemm_memory_desc(&desc, OPERAND_B)?;
    let c_desc = gemm_memory_desc(&desc, OPERAND_C)?;

    let pd = MatmulPrimitiveDesc::create(&engine, &desc)?;
    let primitive = pd.create_primitive()?;

    let a_mem = wrap_operand(&engine, &a, a_desc.size_bytes(), offset_a, elem)?;
    let b_mem = wrap_operand(&engine, &b, b_desc.size_bytes(), offset_b, elem)?;
    let c_mem = wrap_operand(&engine, &c, c_desc.size_bytes(), offset_c, elem)?;

    let operands = GemmOperands {
        a: &a_mem,
        b: &b_mem,
        c: &c_mem,
    };
    let token = primitive.execute(&stream, &operands, &[])?;
    drop(primitive);
    drop(token);

    stream.wait()
}
