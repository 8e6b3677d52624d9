//! Device-backed integration tests for the execution layer.
//!
//! Every test needs a CUDA device and skips cleanly when none is present,
//! so the suite passes on machines without a GPU while exercising the full
//! stack when one is available.

use std::sync::Arc;

use accelr::cudarc::driver::safe::{CudaFunction, CudaStream};
use accelr::cudarc::nvrtc::compile_ptx;
use accelr::engine::{ComputeEngine, EngineKind};
use accelr::gemm;
use accelr::kernel::{self, KernelArg, NdRange};
use accelr::memory::DeviceMemoryHandle;
use accelr::stream::ComputeStream;

// ============================================================================
// Harness
// ============================================================================

/// Engine plus a caller-owned queue, or `None` when no device is usable.
fn gpu_setup() -> Option<(ComputeEngine, Arc<CudaStream>)> {
    let engine = std::panic::catch_unwind(|| ComputeEngine::new(EngineKind::Gpu, 0))
        .ok()?
        .ok()?;
    let queue = engine.context().ok()?.new_stream().ok()?;
    Some((engine, queue))
}

macro_rules! require_gpu {
    () => {
        match gpu_setup() {
            Some(pair) => pair,
            None => {
                eprintln!("skipping: no CUDA device available");
                return;
            }
        }
    };
}

fn approx_eq(a: f32, b: f32, tol: f32) -> bool {
    (a - b).abs() < tol
}

/// Row-major host reference: C = alpha * op(A) @ op(B) + beta * C
#[allow(clippy::too_many_arguments)]
fn host_gemm(
    transa: char,
    transb: char,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) {
    let ta = transa == 't' || transa == 'T';
    let tb = transb == 't' || transb == 'T';
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                let av = if ta { a[p * lda + i] } else { a[i * lda + p] };
                let bv = if tb { b[j * ldb + p] } else { b[p * ldb + j] };
                acc += av * bv;
            }
            let dst = &mut c[i * ldc + j];
            *dst = alpha * acc + if beta != 0.0 { beta * *dst } else { 0.0 };
        }
    }
}

const TEST_KERNELS: &str = r#"
extern "C" __global__ void set_flag(float *out) {
    out[0] = 1.0f;
}

extern "C" __global__ void set_val(float *out, float v) {
    out[0] = v;
}

extern "C" __global__ void mul_val(float *out, float v) {
    out[0] *= v;
}

extern "C" __global__ void write_if_null(const float *in, float *out) {
    if (in == nullptr) {
        out[0] = 42.0f;
    } else {
        out[0] = in[0];
    }
}

extern "C" __global__ void sum_widths(
        float *out, unsigned char a, unsigned short b,
        unsigned int c, unsigned long long d) {
    out[0] = (float)a + (float)b + (float)c + (float)d;
}
"#;

fn load_test_kernel(engine: &ComputeEngine, name: &str) -> CudaFunction {
    let ptx = compile_ptx(TEST_KERNELS).expect("test kernels must compile");
    let module = engine
        .context()
        .unwrap()
        .load_module(ptx)
        .expect("test module must load");
    module.load_function(name).expect("kernel must exist")
}

fn bind(engine: &ComputeEngine, queue: &Arc<CudaStream>) -> ComputeStream {
    engine.create_stream(queue.clone()).unwrap()
}

// ============================================================================
// GEMM pipeline
// ============================================================================

#[test]
fn test_gemm_f32_identity_reproduces_input() {
    let (engine, queue) = require_gpu!();

    // A = I4 so C must come out byte-for-byte equal to X under
    // alpha=1, beta=0, with C starting from uninitialized device memory.
    let mut identity = [0.0f32; 16];
    for i in 0..4 {
        identity[i * 4 + i] = 1.0;
    }
    let x: Vec<f32> = (0..16).map(|v| v as f32 * 0.5 - 3.0).collect();

    let a = engine.alloc_buffer(16 * 4).unwrap();
    let b = engine.alloc_buffer(16 * 4).unwrap();
    let c = engine.alloc_buffer(16 * 4).unwrap();
    a.upload(&identity, 0).unwrap();
    b.upload(&x, 0).unwrap();

    gemm::gemm_f32(
        &queue, 'N', 'N', 4, 4, 4, 1.0, &a, 0, 4, &b, 0, 4, 0.0, &c, 0, 4,
    )
    .unwrap();

    let mut out = vec![0.0f32; 16];
    c.download(&mut out, 0).unwrap();
    assert_eq!(out, x);
}

#[test]
fn test_gemm_f32_matches_host_reference() {
    let (engine, queue) = require_gpu!();

    let (m, n, k) = (3usize, 5, 4);
    let a_data: Vec<f32> = (0..m * k).map(|v| (v % 7) as f32 - 2.0).collect();
    let b_data: Vec<f32> = (0..k * n).map(|v| (v % 5) as f32 * 0.25).collect();
    let c_init: Vec<f32> = (0..m * n).map(|v| v as f32).collect();

    let mut expected = c_init.clone();
    host_gemm(
        'N', 'T', m, n, k, 1.5, &a_data, k, &b_data, k, 0.5, &mut expected, n,
    );

    let a = engine.alloc_buffer(a_data.len() * 4).unwrap();
    let b = engine.alloc_buffer(b_data.len() * 4).unwrap();
    let c = engine.alloc_buffer(c_init.len() * 4).unwrap();
    a.upload(&a_data, 0).unwrap();
    b.upload(&b_data, 0).unwrap();
    c.upload(&c_init, 0).unwrap();

    gemm::gemm_f32(
        &queue,
        'N',
        'T',
        m as i64,
        n as i64,
        k as i64,
        1.5,
        &a,
        0,
        k as i64,
        &b,
        0,
        k as i64,
        0.5,
        &c,
        0,
        n as i64,
    )
    .unwrap();

    let mut out = vec![0.0f32; m * n];
    c.download(&mut out, 0).unwrap();
    for (got, want) in out.iter().zip(expected.iter()) {
        assert!(approx_eq(*got, *want, 1e-4), "got {} want {}", got, want);
    }
}

#[test]
fn test_gemm_f32_element_offsets() {
    let (engine, queue) = require_gpu!();

    // 2x2 multiply reading A and B at an element offset of 4 into their
    // backing objects.
    let a_data = [9.0f32, 9.0, 9.0, 9.0, 1.0, 2.0, 3.0, 4.0];
    let b_data = [7.0f32, 7.0, 7.0, 7.0, 5.0, 6.0, 7.0, 8.0];

    let mut expected = vec![0.0f32; 4];
    host_gemm(
        'N', 'N', 2, 2, 2, 1.0, &a_data[4..], 2, &b_data[4..], 2, 0.0, &mut expected, 2,
    );

    let a = engine.alloc_buffer(8 * 4).unwrap();
    let b = engine.alloc_buffer(8 * 4).unwrap();
    let c = engine.alloc_buffer(4 * 4).unwrap();
    a.upload(&a_data, 0).unwrap();
    b.upload(&b_data, 0).unwrap();

    gemm::gemm_f32(
        &queue, 'N', 'N', 2, 2, 2, 1.0, &a, 4, 2, &b, 4, 2, 0.0, &c, 0, 2,
    )
    .unwrap();

    let mut out = vec![0.0f32; 4];
    c.download(&mut out, 0).unwrap();
    assert_eq!(out, expected);
}

#[test]
fn test_gemm_f16_small_integers() {
    let (engine, queue) = require_gpu!();

    // Small integers are exact in f16, so the result is exact too.
    let a_data: Vec<half::f16> = [1.0f32, 2.0, 3.0, 4.0]
        .iter()
        .map(|&v| half::f16::from_f32(v))
        .collect();
    let b_data: Vec<half::f16> = [5.0f32, 6.0, 7.0, 8.0]
        .iter()
        .map(|&v| half::f16::from_f32(v))
        .collect();

    let a = engine.alloc_buffer(4 * 2).unwrap();
    let b = engine.alloc_buffer(4 * 2).unwrap();
    let c = engine.alloc_buffer(4 * 2).unwrap();
    a.upload(&a_data, 0).unwrap();
    b.upload(&b_data, 0).unwrap();

    gemm::gemm_f16(
        &queue, 'N', 'N', 2, 2, 2, 1.0, &a, 0, 2, &b, 0, 2, 0.0, &c, 0, 2,
    )
    .unwrap();

    let mut out = vec![half::f16::ZERO; 4];
    c.download(&mut out, 0).unwrap();
    let got: Vec<f32> = out.iter().map(|v| v.to_f32()).collect();
    // [[1,2],[3,4]] @ [[5,6],[7,8]] = [[19,22],[43,50]]
    assert_eq!(got, [19.0, 22.0, 43.0, 50.0]);
}

#[test]
fn test_gemm_usm_f32() {
    let (engine, queue) = require_gpu!();

    let bytes = 4 * 4;
    let a_ptr = engine.alloc_unified(bytes).unwrap();
    let b_ptr = engine.alloc_unified(bytes).unwrap();
    let c_ptr = engine.alloc_unified(bytes).unwrap();

    // Unified memory is host-visible; fill the operands in place.
    // SAFETY: each region is 4 f32s of live managed memory.
    unsafe {
        let a = std::slice::from_raw_parts_mut(a_ptr as *mut f32, 4);
        let b = std::slice::from_raw_parts_mut(b_ptr as *mut f32, 4);
        a.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        b.copy_from_slice(&[5.0, 6.0, 7.0, 8.0]);
    }

    gemm::gemm_usm_f32(&queue, 'N', 'N', 2, 2, 2, 1.0, a_ptr, 2, b_ptr, 2, 0.0, c_ptr, 2).unwrap();

    // SAFETY: the call above blocked on completion, so the region is
    // coherent for host reads.
    let got = unsafe { std::slice::from_raw_parts(c_ptr as *const f32, 4).to_vec() };
    assert_eq!(got, [19.0, 22.0, 43.0, 50.0]);

    engine.free_unified(a_ptr);
    engine.free_unified(b_ptr);
    engine.free_unified(c_ptr);
}

#[test]
fn test_gemm_usm_f16() {
    let (engine, queue) = require_gpu!();

    let bytes = 4 * 2;
    let a_ptr = engine.alloc_unified(bytes).unwrap();
    let b_ptr = engine.alloc_unified(bytes).unwrap();
    let c_ptr = engine.alloc_unified(bytes).unwrap();

    // SAFETY: each region is 4 f16s of live managed memory.
    unsafe {
        let a = std::slice::from_raw_parts_mut(a_ptr as *mut half::f16, 4);
        let b = std::slice::from_raw_parts_mut(b_ptr as *mut half::f16, 4);
        for (i, v) in [1.0f32, 2.0, 3.0, 4.0].iter().enumerate() {
            a[i] = half::f16::from_f32(*v);
        }
        for (i, v) in [5.0f32, 6.0, 7.0, 8.0].iter().enumerate() {
            b[i] = half::f16::from_f32(*v);
        }
    }

    gemm::gemm_usm_f16(&queue, 'N', 'N', 2, 2, 2, 1.0, a_ptr, 2, b_ptr, 2, 0.0, c_ptr, 2).unwrap();

    // SAFETY: the call above blocked on completion.
    let got: Vec<f32> = unsafe {
        std::slice::from_raw_parts(c_ptr as *const half::f16, 4)
            .iter()
            .map(|v| v.to_f32())
            .collect()
    };
    assert_eq!(got, [19.0, 22.0, 43.0, 50.0]);

    engine.free_unified(a_ptr);
    engine.free_unified(b_ptr);
    engine.free_unified(c_ptr);
}

// ============================================================================
// Memory handles
// ============================================================================

#[test]
fn test_buffer_backing_roundtrip() {
    let (engine, _queue) = require_gpu!();

    let data: Vec<u8> = (0..=255).collect();
    let buffer = engine.alloc_buffer(data.len()).unwrap();
    buffer.upload(&data, 0).unwrap();

    // Wrapping and unwrapping must hand back the same backing object with
    // byte-identical contents and no data movement.
    let handle = DeviceMemoryHandle::wrap_buffer(&engine, data.len(), 0, &buffer).unwrap();
    let backing = handle.backing_buffer().unwrap();
    assert!(Arc::ptr_eq(backing, &buffer));
    assert_eq!(backing.device_ptr(), buffer.device_ptr());

    let mut out = vec![0u8; data.len()];
    backing.download(&mut out, 0).unwrap();
    assert_eq!(out, data);
}

#[test]
fn test_map_unmap_roundtrip() {
    let (engine, queue) = require_gpu!();
    let stream = bind(&engine, &queue);

    let init: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
    let buffer = engine.alloc_buffer(16).unwrap();
    buffer.upload(&init, 0).unwrap();

    let handle = DeviceMemoryHandle::wrap_buffer(&engine, 16, 0, &buffer).unwrap();
    let ptr = handle.map_for_host(&stream).unwrap();

    // Mapping twice without an unmap is a contract violation.
    assert!(handle.map_for_host(&stream).is_err());

    // SAFETY: the mapping is 16 live host bytes until unmap.
    unsafe {
        let mapped = std::slice::from_raw_parts_mut(ptr as *mut f32, 4);
        assert_eq!(mapped, &init[..]);
        mapped[2] = 99.0;
    }
    handle.unmap(&stream, ptr).unwrap();

    let mut out = vec![0.0f32; 4];
    buffer.download(&mut out, 0).unwrap();
    assert_eq!(out, [1.0, 2.0, 99.0, 4.0]);
}

// ============================================================================
// Dispatch
// ============================================================================

#[test]
fn test_zero_extent_launch_is_a_noop() {
    let (engine, queue) = require_gpu!();
    let stream = bind(&engine, &queue);
    let kernel = load_test_kernel(&engine, "set_flag");

    let flag = engine.alloc_buffer(4).unwrap();
    flag.upload(&[0.0f32], 0).unwrap();
    let out = DeviceMemoryHandle::wrap_buffer(&engine, 4, 0, &flag).unwrap();

    let token = kernel::submit(
        &stream,
        &kernel,
        &[KernelArg::memory(&out)],
        &NdRange::linear(0),
        &[],
    )
    .unwrap();
    token.wait().unwrap();
    stream.wait().unwrap();

    let mut host = [1.0f32];
    flag.download(&mut host, 0).unwrap();
    assert_eq!(host[0], 0.0, "zero-extent launch must not touch the device");
}

#[test]
fn test_null_memory_slot_binds_null() {
    let (engine, queue) = require_gpu!();
    let stream = bind(&engine, &queue);
    let kernel = load_test_kernel(&engine, "write_if_null");

    let out_buf = engine.alloc_buffer(4).unwrap();
    let out = DeviceMemoryHandle::wrap_buffer(&engine, 4, 0, &out_buf).unwrap();

    let token = kernel::submit(
        &stream,
        &kernel,
        &[KernelArg::Memory(None), KernelArg::memory(&out)],
        &NdRange::linear(1),
        &[],
    )
    .unwrap();
    token.wait().unwrap();

    let mut host = [0.0f32];
    out_buf.download(&mut host, 0).unwrap();
    assert_eq!(host[0], 42.0);
}

#[test]
fn test_scalar_widths_reach_the_kernel() {
    let (engine, queue) = require_gpu!();
    let stream = bind(&engine, &queue);
    let kernel = load_test_kernel(&engine, "sum_widths");

    let out_buf = engine.alloc_buffer(4).unwrap();
    let out = DeviceMemoryHandle::wrap_buffer(&engine, 4, 0, &out_buf).unwrap();

    let token = kernel::submit(
        &stream,
        &kernel,
        &[
            KernelArg::memory(&out),
            KernelArg::scalar(&7u8),
            KernelArg::scalar(&300u16),
            KernelArg::scalar(&70_000u32),
            KernelArg::scalar(&11u64),
        ],
        &NdRange::linear(1),
        &[],
    )
    .unwrap();
    token.wait().unwrap();

    let mut host = [0.0f32];
    out_buf.download(&mut host, 0).unwrap();
    assert_eq!(host[0], 7.0 + 300.0 + 70_000.0 + 11.0);
}

#[test]
fn test_same_stream_preserves_submission_order() {
    let (engine, queue) = require_gpu!();
    let stream = bind(&engine, &queue);
    let set = load_test_kernel(&engine, "set_val");
    let mul = load_test_kernel(&engine, "mul_val");

    let buf = engine.alloc_buffer(4).unwrap();
    let out = DeviceMemoryHandle::wrap_buffer(&engine, 4, 0, &buf).unwrap();

    // No explicit dependency: same-stream submission order must hold.
    kernel::submit(
        &stream,
        &set,
        &[KernelArg::memory(&out), KernelArg::scalar(&5.0f32)],
        &NdRange::linear(1),
        &[],
    )
    .unwrap();
    kernel::submit(
        &stream,
        &mul,
        &[KernelArg::memory(&out), KernelArg::scalar(&2.0f32)],
        &NdRange::linear(1),
        &[],
    )
    .unwrap();
    stream.wait().unwrap();

    let mut host = [0.0f32];
    buf.download(&mut host, 0).unwrap();
    assert_eq!(host[0], 10.0);
}

#[test]
fn test_cross_stream_dependency_token() {
    let (engine, queue_a) = require_gpu!();
    let Some(queue_b) = engine.context().ok().and_then(|c| c.new_stream().ok()) else {
        eprintln!("skipping: cannot create a second queue");
        return;
    };
    let stream_a = bind(&engine, &queue_a);
    let stream_b = bind(&engine, &queue_b);
    let set = load_test_kernel(&engine, "set_val");
    let mul = load_test_kernel(&engine, "mul_val");

    let buf = engine.alloc_buffer(4).unwrap();
    let out = DeviceMemoryHandle::wrap_buffer(&engine, 4, 0, &buf).unwrap();

    let produced = kernel::submit(
        &stream_a,
        &set,
        &[KernelArg::memory(&out), KernelArg::scalar(&3.0f32)],
        &NdRange::linear(1),
        &[],
    )
    .unwrap();

    // The token is the only ordering edge between the two streams.
    let consumed = kernel::submit(
        &stream_b,
        &mul,
        &[KernelArg::memory(&out), KernelArg::scalar(&7.0f32)],
        &NdRange::linear(1),
        &[&produced],
    )
    .unwrap();
    consumed.wait().unwrap();

    let mut host = [0.0f32];
    buf.download(&mut host, 0).unwrap();
    assert_eq!(host[0], 21.0);
}

#[test]
fn test_independent_streams_converge_after_both_waited() {
    let (engine, queue_a) = require_gpu!();
    let Some(queue_b) = engine.context().ok().and_then(|c| c.new_stream().ok()) else {
        eprintln!("skipping: cannot create a second queue");
        return;
    };
    let stream_a = bind(&engine, &queue_a);
    let stream_b = bind(&engine, &queue_b);
    let set = load_test_kernel(&engine, "set_val");

    // Two disjoint slots written from two streams with no dependency: the
    // interleaving is unspecified, the final state is not.
    let buf = engine.alloc_buffer(8).unwrap();
    buf.upload(&[0.0f32, 0.0], 0).unwrap();
    let slot_a = DeviceMemoryHandle::wrap_buffer(&engine, 4, 0, &buf).unwrap();
    let slot_b = DeviceMemoryHandle::wrap_buffer(&engine, 4, 4, &buf).unwrap();

    kernel::submit(
        &stream_a,
        &set,
        &[KernelArg::memory(&slot_a), KernelArg::scalar(&1.0f32)],
        &NdRange::linear(1),
        &[],
    )
    .unwrap();
    kernel::submit(
        &stream_b,
        &set,
        &[KernelArg::memory(&slot_b), KernelArg::scalar(&2.0f32)],
        &NdRange::linear(1),
        &[],
    )
    .unwrap();

    stream_a.wait().unwrap();
    stream_b.wait().unwrap();

    let mut host = [0.0f32; 2];
    buf.download(&mut host, 0).unwrap();
    assert_eq!(host, [1.0, 2.0]);
}

// ============================================================================
// Engine/queue binding
// ============================================================================

#[test]
fn test_engine_from_queue_matches_device() {
    let (engine, queue) = require_gpu!();

    let derived = ComputeEngine::from_queue(&queue).unwrap();
    assert_eq!(derived.kind(), EngineKind::Gpu);
    assert_eq!(derived.ordinal(), engine.ordinal());
    // The derived engine accepts the queue it came from.
    derived.create_stream(queue.clone()).unwrap();
}
