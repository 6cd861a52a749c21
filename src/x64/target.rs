// This module implements the reference Target Machine for x86-64 with AVX2 and FMA. It owns the
// encoder every emitter writes into and an emitter registry filled at construction. The general
// purpose pool excludes the stack pointer and rax, which emitters use as scratch; the vector pool
// excludes ymm15 for the same reason. Brgemm operations are lowered to calls into externally
// provided microkernels: the caller hands a resolver through X64CompileParams, and the resolver maps
// the blocked shapes and leading dimensions of each brgemm to the address of a kernel taking
// (A, B, C, scratch).

//! x86-64 AVX2 Target Machine.

use crate::core::error::CompileResult;
use crate::core::register_file::{RegId, RegisterBanks};
use crate::generator::target::{EmitterRegistry, OpType, TargetMachine};
use crate::generator::CodePtr;
use crate::x64::emitters::{
    broadcast_load_factory, broadcast_move_factory, brgemm_factory, convert_factory, eltwise_factory,
    load_factory, loop_begin_factory, loop_end_factory, nop_factory, scalar_factory, store_factory,
};
use crate::x64::encoder::{X64Encoder, VECTOR_LANES};
use crate::x64::kernel::{kernel_factory, ARGS_REG, INDEXES_REG};

/// Data pointers a kernel keeps in registers; the rest of the pool is left to
/// loop counters and brgemm arguments.
const MAX_DATA_POINTERS: usize = 12;

/// Shape of one brgemm microkernel call. Leading dimensions are in elements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrgemmKernelDesc {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub beta: f32,
}

/// Maps a brgemm shape to the address of a microkernel.
pub type BrgemmResolver = Box<dyn Fn(&BrgemmKernelDesc) -> Option<u64>>;

/// Target-specific parameters passed to [`crate::generator::Generator::generate`].
#[derive(Default)]
pub struct X64CompileParams {
    brgemm_resolver: Option<BrgemmResolver>,
}

impl X64CompileParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_brgemm_resolver(mut self, resolver: impl Fn(&BrgemmKernelDesc) -> Option<u64> + 'static) -> Self {
        self.brgemm_resolver = Some(Box::new(resolver));
        self
    }

    pub fn resolve(&self, desc: &BrgemmKernelDesc) -> Option<u64> {
        self.brgemm_resolver.as_ref().and_then(|resolve| resolve(desc))
    }
}

fn host_supports_avx2() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("avx2") && std::arch::is_x86_feature_detected!("fma")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

fn build_registry() -> EmitterRegistry<X64Encoder> {
    let mut registry = EmitterRegistry::new();
    for op in [OpType::Parameter, OpType::Result, OpType::Buffer] {
        registry.register(op, nop_factory);
    }
    registry.register(OpType::Load, load_factory);
    registry.register(OpType::LoadReshape, load_factory);
    registry.register(OpType::BroadcastLoad, broadcast_load_factory);
    registry.register(OpType::Store, store_factory);
    registry.register(OpType::BroadcastMove, broadcast_move_factory);
    registry.register(OpType::Scalar, scalar_factory);
    registry.register(OpType::Convert, convert_factory);
    for op in [
        OpType::Add,
        OpType::Subtract,
        OpType::Multiply,
        OpType::Divide,
        OpType::Maximum,
        OpType::Minimum,
        OpType::Relu,
        OpType::Negative,
        OpType::Fma,
    ] {
        registry.register(op, eltwise_factory);
    }
    registry.register(OpType::Brgemm, brgemm_factory);
    registry.register(OpType::LoopBegin, loop_begin_factory);
    registry.register(OpType::LoopEnd, loop_end_factory);
    registry.register_kernel(kernel_factory);
    registry
}

/// AVX2 code generator for x86-64.
pub struct X64TargetMachine {
    encoder: X64Encoder,
    registry: EmitterRegistry<X64Encoder>,
    supported: bool,
}

impl X64TargetMachine {
    /// Target for the running machine; unsupported when it lacks AVX2 or FMA.
    pub fn new() -> CompileResult<Self> {
        Self::with_support(host_supports_avx2())
    }

    /// Target that emits AVX2 code regardless of the running machine, for
    /// code that is persisted or executed elsewhere.
    pub fn cross_compile() -> CompileResult<Self> {
        Self::with_support(true)
    }

    fn with_support(supported: bool) -> CompileResult<Self> {
        Ok(Self { encoder: X64Encoder::new()?, registry: build_registry(), supported })
    }
}

impl TargetMachine for X64TargetMachine {
    type Host = X64Encoder;

    fn is_supported(&self) -> bool {
        self.supported
    }

    fn get_lanes(&self) -> usize {
        VECTOR_LANES
    }

    fn registry(&self) -> &EmitterRegistry<X64Encoder> {
        &self.registry
    }

    fn register_banks(&self) -> RegisterBanks {
        // rax (0) is scratch and rsp (4) is the stack pointer.
        let gpr: Vec<RegId> = (0..16).filter(|&id| id != 0 && id != 4).collect();
        RegisterBanks { gpr, vec: (0..15).collect(), abi_params: vec![INDEXES_REG.id, ARGS_REG.id] }
    }

    fn max_data_pointers(&self) -> usize {
        MAX_DATA_POINTERS
    }

    fn host(&mut self) -> &mut X64Encoder {
        &mut self.encoder
    }

    fn get_snippet(&mut self) -> CompileResult<CodePtr> {
        let mut encoder = std::mem::replace(&mut self.encoder, X64Encoder::new()?);
        let bytes = encoder.finalize()?;
        Ok(CodePtr::new(bytes, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_covers_every_operation() {
        let target = X64TargetMachine::cross_compile().unwrap();
        assert!(target.is_supported());
        assert_eq!(target.get_lanes(), 8);
        for op in [OpType::Load, OpType::Store, OpType::Fma, OpType::Brgemm, OpType::LoopEnd, OpType::Kernel] {
            assert!(target.has(op), "missing emitter for {op}");
        }
    }

    #[test]
    fn test_register_banks_exclude_scratch() {
        let target = X64TargetMachine::cross_compile().unwrap();
        let banks = target.register_banks();
        assert_eq!(banks.gpr.len(), 14);
        assert!(!banks.gpr.contains(&0) && !banks.gpr.contains(&4));
        assert_eq!(banks.vec.len(), 15);
        assert!(!banks.vec.contains(&15));
        assert_eq!(banks.abi_params, vec![7, 6]);
    }

    #[test]
    fn test_compile_params_resolver() {
        let desc = BrgemmKernelDesc { m: 32, n: 64, k: 16, lda: 16, ldb: 64, ldc: 64, beta: 0.0 };
        assert_eq!(X64CompileParams::new().resolve(&desc), None);
        let params = X64CompileParams::new().with_brgemm_resolver(|d| (d.m == 32).then_some(0xdead));
        assert_eq!(params.resolve(&desc), Some(0xdead));
    }
}
