//! Compiled matrix-multiply primitive
//!
//! Primitive-descriptor creation is the kernel-selection and compilation
//! step: the device kernel source is handed to the runtime compiler (NVRTC)
//! and the resulting module is cached per device. Execution then goes
//! through the generic argument-binding and submission protocol in
//! [`crate::kernel`], exactly like any other compiled kernel would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use cudarc::driver::safe::{CudaFunction, CudaModule};
use cudarc::nvrtc::compile_ptx;

use crate::engine::{ComputeEngine, EngineKind};
use crate::error::{Error, Result};
use crate::kernel::{self, KernelArg, NdRange};
use crate::memory::DeviceMemoryHandle;
use crate::stream::{CompletionToken, ComputeStream};

use super::desc::GemmDesc;

/// Workgroup edge for the 2-D GEMM launch
const TILE: u64 = 16;

/// Device kernel source for both element kinds.
///
/// Column-major with BLAS transpose semantics. Half-precision storage is
/// converted through explicit bit manipulation so the source compiles
/// without any runtime headers; accumulation is always in f32.
const GEMM_KERNEL_SOURCE: &str = r#"
union f32_bits {
    float f;
    unsigned int u;
};

__device__ float half_to_float(unsigned short h) {
    unsigned int sign = ((unsigned int)h & 0x8000u) << 16;
    unsigned int exp = ((unsigned int)h >> 10) & 0x1fu;
    unsigned int man = (unsigned int)h & 0x3ffu;
    union f32_bits v;
    if (exp == 0u) {
        if (man == 0u) {
            v.u = sign;
        } else {
            // subnormal half: renormalize into a f32 exponent
            exp = 113u;
            while ((man & 0x400u) == 0u) {
                man <<= 1;
                exp -= 1u;
            }
            man &= 0x3ffu;
            v.u = sign | (exp << 23) | (man << 13);
        }
    } else if (exp == 31u) {
        v.u = sign | 0x7f800000u | (man << 13);
    } else {
        v.u = sign | ((exp + 112u) << 23) | (man << 13);
    }
    return v.f;
}

__device__ unsigned short float_to_half(float f) {
    union f32_bits v;
    v.f = f;
    unsigned int bits = v.u;
    unsigned int sign = (bits >> 16) & 0x8000u;
    unsigned int exp8 = (bits >> 23) & 0xffu;
    unsigned int man = bits & 0x7fffffu;
    if (exp8 == 0xffu) {
        return (unsigned short)(sign | 0x7c00u | (man ? 0x200u : 0u));
    }
    int exp = (int)exp8 - 127 + 15;
    if (exp >= 31) {
        return (unsigned short)(sign | 0x7c00u);
    }
    if (exp <= 0) {
        if (exp < -10) {
            return (unsigned short)sign;
        }
        man |= 0x800000u;
        unsigned int shift = (unsigned int)(14 - exp);
        unsigned int half_man = (man >> shift) + ((man >> (shift - 1u)) & 1u);
        return (unsigned short)(sign | half_man);
    }
    unsigned int half_man = man >> 13;
    unsigned int round_bit = (man >> 12) & 1u;
    return (unsigned short)((sign | ((unsigned int)exp << 10) | half_man) + round_bit);
}

extern "C" __global__ void gemm_f32(
        const float *a, const float *b, float *c,
        int m, int n, int k, int lda, int ldb, int ldc,
        float alpha, float beta, int transa, int transb) {
    int row = (int)(blockIdx.x * blockDim.x + threadIdx.x);
    int col = (int)(blockIdx.y * blockDim.y + threadIdx.y);
    if (row >= m || col >= n) return;
    float acc = 0.0f;
    for (int p = 0; p < k; ++p) {
        float av = transa ? a[(long long)p + (long long)row * lda]
                          : a[(long long)row + (long long)p * lda];
        float bv = transb ? b[(long long)col + (long long)p * ldb]
                          : b[(long long)p + (long long)col * ldb];
        acc = fmaf(av, bv, acc);
    }
    long long idx = (long long)row + (long long)col * ldc;
    float out = alpha * acc;
    if (beta != 0.0f) out += beta * c[idx];
    c[idx] = out;
}

extern "C" __global__ void gemm_f16(
        const unsigned short *a, const unsigned short *b, unsigned short *c,
        int m, int n, int k, int lda, int ldb, int ldc,
        float alpha, float beta, int transa, int transb) {
    int row = (int)(blockIdx.x * blockDim.x + threadIdx.x);
    int col = (int)(blockIdx.y * blockDim.y + threadIdx.y);
    if (row >= m || col >= n) return;
    float acc = 0.0f;
    for (int p = 0; p < k; ++p) {
        float av = half_to_float(transa ? a[(long long)p + (long long)row * lda]
                                        : a[(long long)row + (long long)p * lda]);
        float bv = half_to_float(transb ? b[(long long)col + (long long)p * ldb]
                                        : b[(long long)p + (long long)col * ldb]);
        acc = fmaf(av, bv, acc);
    }
    long long idx = (long long)row + (long long)col * ldc;
    float out = alpha * acc;
    if (beta != 0.0f) out += beta * half_to_float(c[idx]);
    c[idx] = float_to_half(out);
}
"#;

// ============================================================================
// Module Cache
// ============================================================================

/// Compiled-module cache keyed by device index.
///
/// Compilation happens once per device; later primitive descriptors on the
/// same device reuse the module.
static MODULE_CACHE: OnceLock<Mutex<HashMap<usize, Arc<CudaModule>>>> = OnceLock::new();

fn get_or_compile_module(engine: &ComputeEngine) -> Result<Arc<CudaModule>> {
    let context = engine.context()?;
    let cache = MODULE_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);

    let key = engine.ordinal();
    if let Some(module) = guard.get(&key) {
        return Ok(module.clone());
    }

    let ptx = compile_ptx(GEMM_KERNEL_SOURCE)
        .map_err(|e| Error::Runtime(format!("GEMM kernel compilation failed: {:?}", e)))?;
    let module = context.load_module(ptx)?;
    guard.insert(key, module.clone());

    Ok(module)
}

// ============================================================================
// Primitive Descriptor
// ============================================================================

/// Kernel-selection result for one GEMM operation descriptor.
///
/// Creation performs the compilation step (or reuses the per-device cache);
/// [`create_primitive`](Self::create_primitive) instantiates an executable
/// primitive from it.
pub struct MatmulPrimitiveDesc {
    desc: GemmDesc,
    module: Arc<CudaModule>,
}

impl MatmulPrimitiveDesc {
    /// Select and compile the kernel for an operation descriptor.
    ///
    /// # Errors
    ///
    /// Host-engine GEMM is a documented limitation of this layer and fails
    /// with [`Error::Unimplemented`] before any memory handle exists.
    /// Dimensions beyond the device kernel's 32-bit index space fail with
    /// [`Error::InvalidArgument`].
    pub fn create(engine: &ComputeEngine, desc: &GemmDesc) -> Result<Self> {
        if engine.kind() != EngineKind::Gpu {
            return Err(Error::unimplemented("matrix multiply on a host engine"));
        }
        for (name, value) in [
            ("m", desc.m),
            ("n", desc.n),
            ("k", desc.k),
            ("lda", desc.lda),
            ("ldb", desc.ldb),
            ("ldc", desc.ldc),
        ] {
            if value > i32::MAX as i64 {
                return Err(Error::invalid_argument(
                    name,
                    format!("{} exceeds the device kernel index space", value),
                ));
            }
        }
        let module = get_or_compile_module(engine)?;
        Ok(Self {
            desc: desc.clone(),
            module,
        })
    }

    /// Instantiate an executable primitive.
    ///
    /// # Errors
    ///
    /// Fails when the selected kernel is missing from the compiled module.
    pub fn create_primitive(&self) -> Result<MatmulPrimitive> {
        let name = format!("gemm_{}", self.desc.elem.kernel_suffix());
        let func = self.module.load_function(&name).map_err(|e| {
            Error::Runtime(format!(
                "kernel '{}' missing from compiled module: {:?}",
                name, e
            ))
        })?;
        Ok(MatmulPrimitive {
            desc: self.desc.clone(),
            func,
        })
    }
}

impl std::fmt::Debug for MatmulPrimitiveDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatmulPrimitiveDesc")
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Primitive
// ============================================================================

/// The three memory operands of one GEMM execution
pub struct GemmOperands<'a> {
    /// Operand A
    pub a: &'a DeviceMemoryHandle,
    /// Operand B
    pub b: &'a DeviceMemoryHandle,
    /// Destination operand C
    pub c: &'a DeviceMemoryHandle,
}

/// An engine-bound, executable matrix multiply.
///
/// Transient per operation; dropping it releases its resources.
pub struct MatmulPrimitive {
    desc: GemmDesc,
    func: CudaFunction,
}

impl MatmulPrimitive {
    /// Execute the primitive against bound operands on a stream.
    ///
    /// `deps` are completion tokens of upstream submissions this execution
    /// must order after. Returns the completion token of this execution;
    /// dropping it is legal fire-and-forget.
    ///
    /// # Errors
    ///
    /// Surfaces synchronous submission failures; device-side failures
    /// appear at the token or a stream `wait()`.
    pub fn execute(
        &self,
        stream: &ComputeStream,
        operands: &GemmOperands<'_>,
        deps: &[&CompletionToken],
    ) -> Result<CompletionToken> {
        let d = &self.desc;
        let (m, n, k) = (d.m as i32, d.n as i32, d.k as i32);
        let (lda, ldb, ldc) = (d.lda as i32, d.ldb as i32, d.ldc as i32);
        let transa = d.transa.is_trans() as i32;
        let transb = d.transb.is_trans() as i32;

        // Order mirrors the kernel signature one-to-one.
        let args = [
            KernelArg::memory(operands.a),
            KernelArg::memory(operands.b),
            KernelArg::memory(operands.c),
            KernelArg::scalar(&m),
            KernelArg::scalar(&n),
            KernelArg::scalar(&k),
            KernelArg::scalar(&lda),
            KernelArg::scalar(&ldb),
            KernelArg::scalar(&ldc),
            KernelArg::scalar(&d.alpha),
            KernelArg::scalar(&d.beta),
            KernelArg::scalar(&transa),
            KernelArg::scalar(&transb),
        ];

        let range = NdRange::two_d(d.m as u64, d.n as u64).with_local([TILE, TILE, 1]);
        kernel::submit(stream, &self.func, &args, &range, deps)
    }
}

impl std::fmt::Debug for MatmulPrimitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatmulPrimitive")
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}
