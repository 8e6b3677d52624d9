//! Matrix multiply entry points
//!
//! `C = alpha * op(A) @ op(B) + beta * C`
//!
//! The public entry points use the row-major calling convention and come in
//! two memory-representation families times two element kinds, distinguished
//! at the call site rather than by a runtime tag:
//!
//! | | f32 | f16 |
//! |---|---|---|
//! | Buffer-backed | [`gemm_f32`] | [`gemm_f16`] |
//! | UnifiedAddress | [`gemm_usm_f32`] | [`gemm_usm_f16`] |
//!
//! All four take the caller's native queue; the layer never creates one.
//! Each call blocks until the multiply has completed on the device and
//! returns the first error encountered.
//!
//! Internally there is a single column-major implementation. The row-major
//! surface is reconciled by swapping A with B together with their transpose
//! flags and the m/n extents; this is a normalization, not a second
//! algorithm.

mod desc;
mod pipeline;
mod primitive;

pub use desc::{
    check_gemm_input, gemm_memory_desc, GemmDesc, MemoryDesc, Transpose, OPERAND_A, OPERAND_B,
    OPERAND_C,
};
pub use primitive::{GemmOperands, MatmulPrimitive, MatmulPrimitiveDesc};

use std::sync::Arc;

use cudarc::driver::safe::CudaStream;

use crate::dtype::ElementKind;
use crate::error::Result;
use crate::memory::DeviceBuffer;

use pipeline::{execute_gemm, OperandRef};

/// Row-major single-precision GEMM over managed buffer objects.
///
/// `offset_*` are element offsets into the backing objects, applied once at
/// handle construction. Blocks until completion.
///
/// # Errors
///
/// [`crate::error::Error::InvalidArgument`] for bad shapes, strides or
/// transpose flags; [`crate::error::Error::Unimplemented`] when the queue's
/// device is a host processor.
#[allow(clippy::too_many_arguments)]
pub fn gemm_f32(
    queue: &Arc<CudaStream>,
    transa: char,
    transb: char,
    m: i64,
    n: i64,
    k: i64,
    alpha: f32,
    a: &Arc<DeviceBuffer>,
    offset_a: i64,
    lda: i64,
    b: &Arc<DeviceBuffer>,
    offset_b: i64,
    ldb: i64,
    beta: f32,
    c: &Arc<DeviceBuffer>,
    offset_c: i64,
    ldc: i64,
) -> Result<()> {
    execute_gemm(
        queue,
        Transpose::from_char(transb)?,
        Transpose::from_char(transa)?,
        n,
        m,
        k,
        alpha,
        OperandRef::Buffer(b),
        offset_b,
        ldb,
        OperandRef::Buffer(a),
        offset_a,
        lda,
        beta,
        OperandRef::Buffer(c),
        offset_c,
        ldc,
        ElementKind::F32,
    )
}

/// Row-major half-precision GEMM over managed buffer objects.
///
/// Scale factors stay single-precision; accumulation happens in f32 on the
/// device. See [`gemm_f32`] for the shared contract.
///
/// # Errors
///
/// Same taxonomy as [`gemm_f32`].
#[allow(clippy::too_many_arguments)]
pub fn gemm_f16(
    queue: &Arc<CudaStream>,
    transa: char,
    transb: char,
    m: i64,
    n: i64,
    k: i64,
    alpha: f32,
    a: &Arc<DeviceBuffer>,
    offset_a: i64,
    lda: i64,
    b: &Arc<DeviceBuffer>,
    offset_b: i64,
    ldb: i64,
    beta: f32,
    c: &Arc<DeviceBuffer>,
    offset_c: i64,
    ldc: i64,
) -> Result<()> {
    execute_gemm(
        queue,
        Transpose::from_char(transb)?,
        Transpose::from_char(transa)?,
        n,
        m,
        k,
        alpha,
        OperandRef::Buffer(b),
        offset_b,
        ldb,
        OperandRef::Buffer(a),
        offset_a,
        lda,
        beta,
        OperandRef::Buffer(c),
        offset_c,
        ldc,
        ElementKind::F16,
    )
}

/// Row-major single-precision GEMM over unified-address pointers.
///
/// The pointers are raw device-visible addresses (for example from
/// [`crate::engine::ComputeEngine::alloc_unified`]); the caller owns the
/// regions and must keep them alive for the duration of the call. Blocks
/// until completion.
///
/// # Errors
///
/// Same taxonomy as [`gemm_f32`].
#[allow(clippy::too_many_arguments)]
pub fn gemm_usm_f32(
    queue: &Arc<CudaStream>,
    transa: char,
    transb: char,
    m: i64,
    n: i64,
    k: i64,
    alpha: f32,
    a: u64,
    lda: i64,
    b: u64,
    ldb: i64,
    beta: f32,
    c: u64,
    ldc: i64,
) -> Result<()> {
    execute_gemm(
        queue,
        Transpose::from_char(transb)?,
        Transpose::from_char(transa)?,
        n,
        m,
        k,
        alpha,
        OperandRef::Unified(b),
        0,
        ldb,
        OperandRef::Unified(a),
        0,
        lda,
        beta,
        OperandRef::Unified(c),
        0,
        ldc,
        ElementKind::F32,
    )
}

/// Row-major half-precision GEMM over unified-address pointers.
///
/// See [`gemm_usm_f32`] for the pointer contract and [`gemm_f16`] for the
/// precision behavior.
///
/// # Errors
///
/// Same taxonomy as [`gemm_f32`].
#[allow(clippy::too_many_arguments)]
pub fn gemm_usm_f16(
    queue: &Arc<CudaStream>,
    transa: char,
    transb: char,
    m: i64,
    n: i64,
    k: i64,
    alpha: f32,
    a: u64,
    lda: i64,
    b: u64,
    ldb: i64,
    beta: f32,
    c: u64,
    ldc: i64,
) -> Result<()> {
    execute_gemm(
        queue,
        Transpose::from_char(transb)?,
        Transpose::from_char(transa)?,
        n,
        m,
        k,
        alpha,
        OperandRef::Unified(b),
        0,
        ldb,
        OperandRef::Unified(a),
        0,
        lda,
        beta,
        OperandRef::Unified(c),
        0,
        ldc,
        ElementKind::F16,
    )
}
