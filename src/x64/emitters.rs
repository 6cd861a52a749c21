// This module contains the AVX2 emitters of the x86-64 target, one per operation type of the Linear
// IR. Each factory inspects the lowered expression once (access counts, offsets, loop parameters,
// brgemm shapes) and captures what it needs in a small emitter value; emission itself then only
// consults the physical registers handed over by the driver. Parameters, results and buffers emit
// nothing: their data pointers are set up by the kernel prologue. Memory accesses of a full vector
// use unaligned moves, single elements use scalar moves, and partial vectors use masked moves whose
// lane masks live in constant tables placed after the code.

//! AVX2 emitters for Linear IR operations.

use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::{AsmReg, PhysRegInfo, RegClass};
use crate::generator::target::{Emitter, LoweringContext};
use crate::lowered::expression::OutputRef;
use crate::lowered::types::{ElementType, EltwiseKind, LoopEndData, MemoryAccess, OpKind, PortDescriptor};
use crate::x64::encoder::{
    imm32, EncodingError, JumpCondition, VecBinOp, X64Encoder, SCRATCH_GPR, SCRATCH_VEC, STACK_POINTER, VECTOR_LANES,
};
use crate::x64::target::{BrgemmKernelDesc, X64CompileParams};

pub type X64Emitter = Box<dyn Emitter<X64Encoder>>;

const RCX: AsmReg = AsmReg::gpr(1);
const RDX: AsmReg = AsmReg::gpr(2);
const RSI: AsmReg = AsmReg::gpr(6);
const RDI: AsmReg = AsmReg::gpr(7);
const YMM_BYTES: usize = 32;

fn operand(regs: &[AsmReg], index: usize, op: &str) -> CompileResult<AsmReg> {
    regs.get(index)
        .copied()
        .ok_or_else(|| CompileError::structural(format!("{op} has no physical register for operand {index}")))
}

fn unexpected(ctx: &LoweringContext<'_>) -> CompileError {
    CompileError::structural(format!("expression {} is a {}", ctx.id.0, ctx.expr.op_type()))
}

/// How many lanes one vector memory access touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VectorAccess {
    Full,
    Single,
    Masked(usize),
}

impl VectorAccess {
    fn of(access: &MemoryAccess, element_type: ElementType) -> CompileResult<Self> {
        if element_type.size() != 4 {
            return Err(CompileError::target(format!(
                "AVX2 emitters move 32-bit elements, got {}",
                element_type.name()
            )));
        }
        match access.count {
            VECTOR_LANES => Ok(Self::Full),
            1 => Ok(Self::Single),
            count if count > 1 && count < VECTOR_LANES => Ok(Self::Masked(count)),
            count => Err(CompileError::target(format!(
                "cannot move {count} elements with one {VECTOR_LANES}-lane access"
            ))),
        }
    }

    fn place_mask(self, host: &mut X64Encoder) -> CompileResult<()> {
        if let Self::Masked(count) = self {
            host.place_lane_mask(count)?;
        }
        Ok(())
    }
}

struct NopEmitter;

impl Emitter<X64Encoder> for NopEmitter {
    fn emit_code(&self, _host: &mut X64Encoder, _regs: &PhysRegInfo) -> CompileResult<()> {
        Ok(())
    }
}

pub fn nop_factory(_ctx: &LoweringContext<'_>) -> CompileResult<X64Emitter> {
    Ok(Box::new(NopEmitter))
}

struct LoadEmitter {
    access: VectorAccess,
    offset: i32,
}

impl Emitter<X64Encoder> for LoadEmitter {
    fn emit_code(&self, host: &mut X64Encoder, regs: &PhysRegInfo) -> CompileResult<()> {
        let ptr = operand(&regs.inputs, 0, "load")?;
        let dst = operand(&regs.outputs, 0, "load")?;
        match self.access {
            VectorAccess::Full => host.vmovups_load(dst, ptr, self.offset)?,
            VectorAccess::Single => host.vmovss_load(dst, ptr, self.offset)?,
            VectorAccess::Masked(count) => {
                host.load_lane_mask(SCRATCH_VEC, count)?;
                host.vmaskmovps_load(dst, SCRATCH_VEC, ptr, self.offset)?;
            }
        }
        Ok(())
    }

    fn emit_data(&self, host: &mut X64Encoder) -> CompileResult<()> {
        self.access.place_mask(host)
    }
}

/// Factory for `Load` and `LoadReshape`; the permuted walk of the latter is
/// already folded into its loop pointer increments.
pub fn load_factory(ctx: &LoweringContext<'_>) -> CompileResult<X64Emitter> {
    let access = match &ctx.expr.kind {
        OpKind::Load(access) | OpKind::LoadReshape { access, .. } => access,
        _ => return Err(unexpected(ctx)),
    };
    let element_type = ctx.expr.outputs.first().ok_or_else(|| unexpected(ctx))?.element_type;
    Ok(Box::new(LoadEmitter {
        access: VectorAccess::of(access, element_type)?,
        offset: imm32(access.offset as i64)?,
    }))
}

struct StoreEmitter {
    access: VectorAccess,
    offset: i32,
}

impl Emitter<X64Encoder> for StoreEmitter {
    fn emit_code(&self, host: &mut X64Encoder, regs: &PhysRegInfo) -> CompileResult<()> {
        let src = operand(&regs.inputs, 0, "store")?;
        let ptr = operand(&regs.outputs, 0, "store")?;
        match self.access {
            VectorAccess::Full => host.vmovups_store(ptr, self.offset, src)?,
            VectorAccess::Single => host.vmovss_store(ptr, self.offset, src)?,
            VectorAccess::Masked(count) => {
                host.load_lane_mask(SCRATCH_VEC, count)?;
                host.vmaskmovps_store(ptr, self.offset, SCRATCH_VEC, src)?;
            }
        }
        Ok(())
    }

    fn emit_data(&self, host: &mut X64Encoder) -> CompileResult<()> {
        self.access.place_mask(host)
    }
}

pub fn store_factory(ctx: &LoweringContext<'_>) -> CompileResult<X64Emitter> {
    let OpKind::Store(access) = &ctx.expr.kind else {
        return Err(unexpected(ctx));
    };
    let element_type = ctx.expr.inputs.first().ok_or_else(|| unexpected(ctx))?.desc.element_type;
    Ok(Box::new(StoreEmitter {
        access: VectorAccess::of(access, element_type)?,
        offset: imm32(access.offset as i64)?,
    }))
}

struct BroadcastLoadEmitter {
    offset: i32,
}

impl Emitter<X64Encoder> for BroadcastLoadEmitter {
    fn emit_code(&self, host: &mut X64Encoder, regs: &PhysRegInfo) -> CompileResult<()> {
        let ptr = operand(&regs.inputs, 0, "broadcast load")?;
        let dst = operand(&regs.outputs, 0, "broadcast load")?;
        host.vbroadcastss_mem(dst, ptr, self.offset)?;
        Ok(())
    }
}

pub fn broadcast_load_factory(ctx: &LoweringContext<'_>) -> CompileResult<X64Emitter> {
    let OpKind::BroadcastLoad(access) = &ctx.expr.kind else {
        return Err(unexpected(ctx));
    };
    let element_type = ctx.expr.outputs.first().ok_or_else(|| unexpected(ctx))?.element_type;
    if element_type.size() != 4 {
        return Err(CompileError::target(format!("cannot broadcast {} elements", element_type.name())));
    }
    Ok(Box::new(BroadcastLoadEmitter { offset: imm32(access.offset as i64)? }))
}

struct BroadcastMoveEmitter;

impl Emitter<X64Encoder> for BroadcastMoveEmitter {
    fn emit_code(&self, host: &mut X64Encoder, regs: &PhysRegInfo) -> CompileResult<()> {
        let src = operand(&regs.inputs, 0, "broadcast move")?;
        let dst = operand(&regs.outputs, 0, "broadcast move")?;
        host.vbroadcastss_reg(dst, src)?;
        Ok(())
    }
}

pub fn broadcast_move_factory(_ctx: &LoweringContext<'_>) -> CompileResult<X64Emitter> {
    Ok(Box::new(BroadcastMoveEmitter))
}

struct ScalarEmitter {
    bits: u32,
}

impl Emitter<X64Encoder> for ScalarEmitter {
    fn emit_code(&self, host: &mut X64Encoder, regs: &PhysRegInfo) -> CompileResult<()> {
        let dst = operand(&regs.outputs, 0, "scalar")?;
        host.mov32_reg_imm(SCRATCH_GPR, self.bits)?;
        host.vmovd_from_gp(dst, SCRATCH_GPR)?;
        host.vbroadcastss_reg(dst, dst)?;
        Ok(())
    }
}

pub fn scalar_factory(ctx: &LoweringContext<'_>) -> CompileResult<X64Emitter> {
    let OpKind::Scalar(value) = ctx.expr.kind else {
        return Err(unexpected(ctx));
    };
    Ok(Box::new(ScalarEmitter { bits: value.to_bits() }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Move,
    Truncate,
    ToFloat,
}

struct ConvertEmitter {
    conversion: Conversion,
}

impl Emitter<X64Encoder> for ConvertEmitter {
    fn emit_code(&self, host: &mut X64Encoder, regs: &PhysRegInfo) -> CompileResult<()> {
        let src = operand(&regs.inputs, 0, "convert")?;
        let dst = operand(&regs.outputs, 0, "convert")?;
        match self.conversion {
            Conversion::Move if src == dst => {}
            Conversion::Move => host.vmovaps(dst, src)?,
            Conversion::Truncate => host.vcvttps2dq(dst, src)?,
            Conversion::ToFloat => host.vcvtdq2ps(dst, src)?,
        }
        Ok(())
    }
}

pub fn convert_factory(ctx: &LoweringContext<'_>) -> CompileResult<X64Emitter> {
    let OpKind::Convert(to) = ctx.expr.kind else {
        return Err(unexpected(ctx));
    };
    let from = ctx.expr.inputs.first().ok_or_else(|| unexpected(ctx))?.desc.element_type;
    let conversion = match (from, to) {
        (a, b) if a == b => Conversion::Move,
        (ElementType::F32, ElementType::I32) => Conversion::Truncate,
        (ElementType::I32, ElementType::F32) => Conversion::ToFloat,
        (a, b) => {
            return Err(CompileError::target(format!("no AVX2 conversion from {} to {}", a.name(), b.name())));
        }
    };
    Ok(Box::new(ConvertEmitter { conversion }))
}

struct EltwiseEmitter {
    kind: EltwiseKind,
}

impl Emitter<X64Encoder> for EltwiseEmitter {
    fn emit_code(&self, host: &mut X64Encoder, regs: &PhysRegInfo) -> CompileResult<()> {
        let name = "elementwise operation";
        let dst = operand(&regs.outputs, 0, name)?;
        let a = operand(&regs.inputs, 0, name)?;
        let binary = |op| -> CompileResult<(VecBinOp, AsmReg)> { Ok((op, operand(&regs.inputs, 1, name)?)) };
        let (op, b) = match self.kind {
            EltwiseKind::Add => binary(VecBinOp::Add)?,
            EltwiseKind::Subtract => binary(VecBinOp::Sub)?,
            EltwiseKind::Multiply => binary(VecBinOp::Mul)?,
            EltwiseKind::Divide => binary(VecBinOp::Div)?,
            EltwiseKind::Maximum => binary(VecBinOp::Max)?,
            EltwiseKind::Minimum => binary(VecBinOp::Min)?,
            EltwiseKind::Relu => {
                host.vzero(SCRATCH_VEC)?;
                host.vec_binary(VecBinOp::Max, dst, a, SCRATCH_VEC)?;
                return Ok(());
            }
            EltwiseKind::Negative => {
                host.vzero(SCRATCH_VEC)?;
                host.vec_binary(VecBinOp::Sub, dst, SCRATCH_VEC, a)?;
                return Ok(());
            }
            EltwiseKind::Fma => {
                let b = operand(&regs.inputs, 1, name)?;
                let c = operand(&regs.inputs, 2, name)?;
                // dst is never one of the inputs, so the addend can be copied first.
                host.vmovaps(dst, c)?;
                host.vfmadd231ps(dst, a, b)?;
                return Ok(());
            }
        };
        host.vec_binary(op, dst, a, b)?;
        Ok(())
    }
}

pub fn eltwise_factory(ctx: &LoweringContext<'_>) -> CompileResult<X64Emitter> {
    let OpKind::Eltwise(kind) = ctx.expr.kind else {
        return Err(unexpected(ctx));
    };
    if ctx.expr.inputs.len() != kind.arity() {
        return Err(CompileError::structural(format!(
            "{} expects {} inputs, found {}",
            ctx.expr.op_type(),
            kind.arity(),
            ctx.expr.inputs.len()
        )));
    }
    if let Some(input) = ctx.expr.inputs.iter().find(|i| i.desc.element_type != ElementType::F32) {
        return Err(CompileError::target(format!(
            "AVX2 {} is f32 only, got {}",
            ctx.expr.op_type(),
            input.desc.element_type.name()
        )));
    }
    Ok(Box::new(EltwiseEmitter { kind }))
}

struct LoopBeginEmitter {
    loop_id: usize,
    work_amount: usize,
    evaluate_once: bool,
}

impl Emitter<X64Encoder> for LoopBeginEmitter {
    fn emit_code(&self, host: &mut X64Encoder, regs: &PhysRegInfo) -> CompileResult<()> {
        if self.evaluate_once {
            return Ok(());
        }
        let counter = operand(&regs.outputs, 0, "loop begin")?;
        host.mov_reg_imm(counter, self.work_amount as i64)?;
        host.place_label_for_loop(self.loop_id)?;
        Ok(())
    }
}

/// The LoopEnd is reached through the counter the LoopBegin produces.
pub fn loop_begin_factory(ctx: &LoweringContext<'_>) -> CompileResult<X64Emitter> {
    let OpKind::LoopBegin { loop_id } = ctx.expr.kind else {
        return Err(unexpected(ctx));
    };
    let end = ctx
        .ir
        .consumers(OutputRef::new(ctx.id, 0))
        .into_iter()
        .find_map(|(consumer, _)| match ctx.ir.get(consumer).map(|e| &e.kind) {
            Some(OpKind::LoopEnd(data)) if data.loop_id == loop_id => Some(data),
            _ => None,
        })
        .ok_or_else(|| CompileError::structural(format!("LoopBegin of loop {loop_id} has no LoopEnd")))?;
    Ok(Box::new(LoopBeginEmitter {
        loop_id,
        work_amount: end.work_amount,
        evaluate_once: end.evaluate_once,
    }))
}

struct LoopEndEmitter {
    data: LoopEndData,
}

impl LoopEndEmitter {
    fn byte_offset(elements: i64, scale: usize, data_size: usize) -> Result<i32, EncodingError> {
        imm32(elements * scale as i64 * data_size as i64)
    }
}

impl Emitter<X64Encoder> for LoopEndEmitter {
    fn emit_code(&self, host: &mut X64Encoder, regs: &PhysRegInfo) -> CompileResult<()> {
        let data = &self.data;
        let Some((&counter, ptrs)) = regs.inputs.split_last() else {
            return Err(CompileError::structural(format!("LoopEnd of loop {} has no counter", data.loop_id)));
        };
        let steps = data.ptr_increments.iter().zip(&data.finalization_offsets).zip(&data.data_sizes);
        if !data.evaluate_once {
            for (&ptr, ((&inc, _), &size)) in ptrs.iter().zip(steps.clone()) {
                let step = Self::byte_offset(inc, data.increment, size)?;
                if step != 0 {
                    host.add_reg_imm(ptr, step)?;
                }
            }
            let increment = imm32(data.increment as i64)?;
            host.sub_reg_imm(counter, increment)?;
            host.cmp_reg_imm(counter, increment)?;
            host.jmp_conditional_to_loop(JumpCondition::GreaterEqual, data.loop_id)?;
        }
        for (&ptr, ((_, &fin), &size)) in ptrs.iter().zip(steps) {
            let offset = Self::byte_offset(fin, 1, size)?;
            if offset != 0 {
                host.add_reg_imm(ptr, offset)?;
            }
        }
        Ok(())
    }
}

pub fn loop_end_factory(ctx: &LoweringContext<'_>) -> CompileResult<X64Emitter> {
    let OpKind::LoopEnd(data) = &ctx.expr.kind else {
        return Err(unexpected(ctx));
    };
    let ptrs = ctx.expr.inputs.len().saturating_sub(1);
    if data.ptr_increments.len() != ptrs
        || data.finalization_offsets.len() != ptrs
        || data.data_sizes.len() != ptrs
    {
        return Err(CompileError::structural(format!(
            "LoopEnd of loop {} has {ptrs} data pointers but {} increments",
            data.loop_id,
            data.ptr_increments.len()
        )));
    }
    if data.increment == 0 {
        return Err(CompileError::structural(format!("loop {} has a zero increment", data.loop_id)));
    }
    Ok(Box::new(LoopEndEmitter { data: data.clone() }))
}

struct BrgemmEmitter {
    kernel: u64,
    offsets: [i32; 3],
}

impl Emitter<X64Encoder> for BrgemmEmitter {
    fn emit_code(&self, host: &mut X64Encoder, regs: &PhysRegInfo) -> CompileResult<()> {
        let a = operand(&regs.inputs, 0, "brgemm")?;
        let b = operand(&regs.inputs, 1, "brgemm")?;
        let c = operand(&regs.outputs, 0, "brgemm")?;
        let gprs: Vec<AsmReg> = regs.live.iter().copied().filter(|r| r.class() == RegClass::Gpr).collect();
        let vecs: Vec<AsmReg> = regs.live.iter().copied().filter(|r| r.class() == RegClass::Vec).collect();

        for &reg in &gprs {
            host.push_reg(reg)?;
        }
        let vec_bytes = YMM_BYTES * vecs.len();
        if vec_bytes > 0 {
            host.sub_reg_imm(STACK_POINTER, imm32(vec_bytes as i64)?)?;
            for (i, &reg) in vecs.iter().enumerate() {
                host.vmovups_store(STACK_POINTER, imm32((i * YMM_BYTES) as i64)?, reg)?;
            }
        }
        // The prologue leaves the stack 16-byte aligned.
        let padding = (16 - (8 * gprs.len() + vec_bytes) % 16) % 16;
        if padding > 0 {
            host.sub_reg_imm(STACK_POINTER, padding as i32)?;
        }

        // Route through the stack: any of a, b, c may already sit in an argument register.
        host.push_reg(a)?;
        host.push_reg(b)?;
        host.push_reg(c)?;
        host.pop_reg(RDX)?;
        host.pop_reg(RSI)?;
        host.pop_reg(RDI)?;
        for (reg, offset) in [RDI, RSI, RDX].into_iter().zip(self.offsets) {
            if offset != 0 {
                host.add_reg_imm(reg, offset)?;
            }
        }
        host.xor32_reg_reg(RCX, RCX)?;
        host.mov_reg_imm(SCRATCH_GPR, self.kernel as i64)?;
        host.call_reg(SCRATCH_GPR)?;

        if padding > 0 {
            host.add_reg_imm(STACK_POINTER, padding as i32)?;
        }
        if vec_bytes > 0 {
            for (i, &reg) in vecs.iter().enumerate() {
                host.vmovups_load(reg, STACK_POINTER, imm32((i * YMM_BYTES) as i64)?)?;
            }
            host.add_reg_imm(STACK_POINTER, imm32(vec_bytes as i64)?)?;
        }
        for &reg in gprs.iter().rev() {
            host.pop_reg(reg)?;
        }
        Ok(())
    }
}

fn brgemm_operand<'a>(desc: Option<&'a PortDescriptor>, name: &str) -> CompileResult<&'a PortDescriptor> {
    let desc = desc.ok_or_else(|| CompileError::structural(format!("brgemm has no {name} operand")))?;
    if desc.rank() < 2 {
        return Err(CompileError::unsupported_shape(format!("brgemm {name} has rank {}", desc.rank())));
    }
    if desc.physical_dim(desc.rank() - 1) != desc.rank() - 1 {
        return Err(CompileError::unsupported_layout(format!(
            "brgemm {name} must keep its innermost dimension contiguous, layout {:?}",
            desc.layout
        )));
    }
    if desc.element_type != ElementType::F32 {
        return Err(CompileError::target(format!(
            "brgemm microkernels are f32 only, {name} is {}",
            desc.element_type.name()
        )));
    }
    Ok(desc)
}

/// Resolve the microkernel for the blocked shapes of this brgemm.
pub fn brgemm_factory(ctx: &LoweringContext<'_>) -> CompileResult<X64Emitter> {
    let OpKind::Brgemm(data) = &ctx.expr.kind else {
        return Err(unexpected(ctx));
    };
    let a = brgemm_operand(ctx.expr.inputs.first().map(|i| &i.desc), "A")?;
    let b = brgemm_operand(ctx.expr.inputs.get(1).map(|i| &i.desc), "B")?;
    let c = brgemm_operand(ctx.expr.outputs.first(), "C")?;
    let desc = BrgemmKernelDesc {
        m: a.block_dim(1),
        n: b.block_dim(0),
        k: a.block_dim(0),
        lda: a.stride(1),
        ldb: b.stride(1),
        ldc: c.stride(1),
        beta: data.beta,
    };
    let params = ctx
        .compile_params
        .and_then(|p| p.downcast_ref::<X64CompileParams>())
        .ok_or_else(|| CompileError::target("brgemm needs X64CompileParams with a microkernel resolver"))?;
    let kernel = params
        .resolve(&desc)
        .ok_or_else(|| CompileError::target(format!("no brgemm microkernel for {desc:?}")))?;
    log::trace!("brgemm {} uses microkernel {kernel:#x} for {desc:?}", ctx.id.0);
    Ok(Box::new(BrgemmEmitter {
        kernel,
        offsets: [
            imm32(data.a.offset as i64)?,
            imm32(data.b.offset as i64)?,
            imm32(data.c.offset as i64)?,
        ],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::lowered::expression::{ExprId, Expression, Input};
    use crate::lowered::linear_ir::LinearIR;

    fn context<'a>(ir: &'a LinearIR, id: ExprId, config: &'a Config) -> LoweringContext<'a> {
        LoweringContext { ir, id, expr: ir.expr(id).unwrap(), config, compile_params: None }
    }

    fn param(ir: &mut LinearIR, desc: &PortDescriptor) -> ExprId {
        ir.push(Expression::new(OpKind::Parameter { index: 0 }, vec![], vec![desc.clone()]))
    }

    #[test]
    fn test_vector_access_kinds() {
        let f32 = ElementType::F32;
        assert_eq!(VectorAccess::of(&MemoryAccess::new(8), f32).unwrap(), VectorAccess::Full);
        assert_eq!(VectorAccess::of(&MemoryAccess::new(1), f32).unwrap(), VectorAccess::Single);
        assert_eq!(VectorAccess::of(&MemoryAccess::new(5), f32).unwrap(), VectorAccess::Masked(5));
        assert!(VectorAccess::of(&MemoryAccess::new(16), f32).is_err());
        assert!(VectorAccess::of(&MemoryAccess::new(8), ElementType::BF16).is_err());
    }

    #[test]
    fn test_masked_load_places_table() {
        let mut host = X64Encoder::new().unwrap();
        let emitter = LoadEmitter { access: VectorAccess::Masked(3), offset: 16 };
        let regs = PhysRegInfo { inputs: vec![AsmReg::gpr(1)], outputs: vec![AsmReg::vec(0)], live: vec![] };

        emitter.emit_code(&mut host, &regs).unwrap();
        host.ret().unwrap();
        // Without the table the RIP-relative mask load has no target.
        emitter.emit_data(&mut host).unwrap();
        assert!(host.finalize().is_ok());
    }

    #[test]
    fn test_unsupported_conversion() {
        let config = Config::default();
        let mut ir = LinearIR::new(config.clone());
        let desc = PortDescriptor::new(vec![8], ElementType::F32);
        let p = param(&mut ir, &desc);
        let convert = ir.push(Expression::new(
            OpKind::Convert(ElementType::BF16),
            vec![Input { source: OutputRef::new(p, 0), desc }],
            vec![PortDescriptor::new(vec![8], ElementType::BF16)],
        ));

        let err = convert_factory(&context(&ir, convert, &config)).err().unwrap();
        assert!(matches!(err, CompileError::TargetCapability { .. }));
    }

    #[test]
    fn test_brgemm_requires_resolver() {
        let config = Config::default();
        let mut ir = LinearIR::new(config.clone());
        let a = PortDescriptor::new(vec![4, 8], ElementType::F32);
        let b = PortDescriptor::new(vec![8, 16], ElementType::F32);
        let pa = param(&mut ir, &a);
        let pb = param(&mut ir, &b);
        let brgemm = ir.push(Expression::new(
            OpKind::Brgemm(crate::lowered::types::BrgemmData {
                a: MemoryAccess::default(),
                b: MemoryAccess::default(),
                c: MemoryAccess::default(),
                beta: 0.0,
            }),
            vec![Input { source: OutputRef::new(pa, 0), desc: a }, Input { source: OutputRef::new(pb, 0), desc: b }],
            vec![PortDescriptor::new(vec![4, 16], ElementType::F32)],
        ));

        let err = brgemm_factory(&context(&ir, brgemm, &config)).err().unwrap();
        assert!(matches!(err, CompileError::TargetCapability { .. }));

        let params = X64CompileParams::new().with_brgemm_resolver(|desc: &BrgemmKernelDesc| {
            assert_eq!((desc.m, desc.n, desc.k), (4, 16, 8));
            assert_eq!((desc.lda, desc.ldb, desc.ldc), (8, 16, 16));
            Some(0x1000)
        });
        let ctx = LoweringContext {
            ir: &ir,
            id: brgemm,
            expr: ir.expr(brgemm).unwrap(),
            config: &config,
            compile_params: Some(&params),
        };
        assert!(brgemm_factory(&ctx).is_ok());
    }
}
