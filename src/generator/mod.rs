// This module implements the generation driver: it takes a blocked, buffer-allocated and
// register-assigned Linear IR and produces a Schedule through a Target Machine. The driver first
// splits loops into first-iteration, main-body and tail parts and optionally marks single-iteration
// loops, then maps abstract registers onto the target's physical pools: the kernel ABI registers
// are held back while the data pointers are mapped, released again, and the loop scopes are mapped
// recursively with the same shared pools. Every expression is then paired with an emitter from the
// target registry, the list is wrapped in the kernel emitter, code is emitted followed by constant
// data, and the target finalizes the code. The Schedule records the iteration space the caller has
// to drive: the master shape with the innermost tile dimensions collapsed to one.

//! Generation driver, Schedule and compiled code handle.

pub mod target;

use crate::core::assembler::ElfAssembler;
use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::{AsmReg, PhysRegInfo, Reg, RegClass, RegInfo, RegisterMapper};
use crate::core::session::CompilationSession;
use crate::lowered::expression::{ExprId, Expression};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::pass::{InsertSpecificIterations, OptimizeLoopSingleEvaluation, PassPipeline};
use crate::lowered::types::{OpKind, PortDescriptor};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use target::{
    Emitter, EmitterRegistry, ExprEmitterFactory, KernelEmitterFactory, KernelInfo, LoweringContext, OpType,
    RegType, TargetMachine,
};

/// Calling contract of a generated kernel.
///
/// The kernel is `extern "C" fn(indexes: *const u64, args: *const u64)`.
/// `args` holds the input pointers, then the output pointers, then the
/// scratchpad base of the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelAbi {
    pub num_inputs: usize,
    pub num_outputs: usize,
    /// Leading dimensions of the work size whose index the kernel reads.
    pub num_outer_dims: usize,
}

impl KernelAbi {
    /// Number of `args` entries, scratchpad base included.
    pub fn num_args(&self) -> usize {
        self.num_inputs + self.num_outputs + 1
    }
}

/// Handle to finalized machine code.
#[derive(Debug, Clone)]
pub struct CodePtr {
    bytes: Arc<[u8]>,
    entry: usize,
    scratchpad_size: usize,
    abi: KernelAbi,
}

impl CodePtr {
    pub fn new(bytes: Vec<u8>, entry: usize) -> Self {
        Self { bytes: bytes.into(), entry, scratchpad_size: 0, abi: KernelAbi::default() }
    }

    pub fn with_scratchpad_size(mut self, size: usize) -> Self {
        self.scratchpad_size = size;
        self
    }

    pub fn with_abi(mut self, abi: KernelAbi) -> Self {
        self.abi = abi;
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn entry_offset(&self) -> usize {
        self.entry
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Scratchpad bytes one kernel invocation needs. Callers running kernels on
    /// several threads allocate one such block per thread.
    pub fn scratchpad_size(&self) -> usize {
        self.scratchpad_size
    }

    pub fn abi(&self) -> KernelAbi {
        self.abi
    }

    /// Write the code as a relocatable ELF object exporting `symbol` at the entry.
    pub fn to_object(&self, symbol: &str) -> CompileResult<Vec<u8>> {
        let mut asm = ElfAssembler::new();
        let base = asm.append(&self.bytes);
        asm.define_function(symbol, base + self.entry as u64, (self.bytes.len() - self.entry) as u64)?;
        asm.build_object()
    }
}

/// Result of one snippet compile.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Iteration space the caller drives, one kernel call per index.
    pub work_size: Vec<usize>,
    /// At most one dimension of `work_size` exceeds one.
    pub is_flat: bool,
    pub code: CodePtr,
}

impl Schedule {
    pub fn new(master_shape: &[usize], tile_rank: usize, code: CodePtr) -> Self {
        let rank = master_shape.len();
        let work_size: Vec<usize> = master_shape
            .iter()
            .enumerate()
            .map(|(d, &dim)| if d + tile_rank >= rank { 1 } else { dim })
            .collect();
        let is_flat = work_size.iter().filter(|&&d| d > 1).count() <= 1;
        Self { work_size, is_flat, code }
    }

    /// Total number of kernel invocations.
    pub fn num_invocations(&self) -> usize {
        self.work_size.iter().product()
    }
}

/// Abstract data pointer registers of the kernel: inputs, outputs, then buffer ids.
struct DataPointers {
    regs: Vec<Reg>,
    io_descs: Vec<PortDescriptor>,
    num_inputs: usize,
    num_outputs: usize,
    num_buffer_ids: usize,
}

fn collect_data_pointers(ir: &LinearIR) -> CompileResult<DataPointers> {
    let single = |regs: &[Reg], what: &str, id: ExprId| {
        regs.first()
            .copied()
            .ok_or_else(|| CompileError::structural(format!("{what} {} has no data pointer register", id.0)))
    };

    let mut regs = Vec::new();
    let mut io_descs = Vec::new();
    let params = ir.parameters();
    for &param in &params {
        let expr = ir.expr(param)?;
        regs.push(single(&expr.reg_info.outputs, "parameter", param)?);
        io_descs.push(expr.outputs.first().cloned().ok_or_else(|| CompileError::structural("parameter without output"))?);
    }
    let results = ir.results();
    for &result in &results {
        let expr = ir.expr(result)?;
        regs.push(single(&expr.reg_info.inputs, "result", result)?);
        io_descs.push(expr.inputs.first().map(|i| i.desc.clone()).ok_or_else(|| CompileError::structural("result without input"))?);
    }
    let mut buffer_regs: BTreeMap<usize, Reg> = BTreeMap::new();
    for buffer in ir.buffers() {
        let expr = ir.expr(buffer)?;
        if let OpKind::Buffer(data) = &expr.kind {
            let reg = single(&expr.reg_info.outputs, "buffer", buffer)?;
            if let Some(&other) = buffer_regs.get(&data.id) {
                if other != reg {
                    return Err(CompileError::structural(format!(
                        "buffers with id {} use different data pointer registers",
                        data.id
                    )));
                }
            }
            buffer_regs.insert(data.id, reg);
        }
    }
    let num_buffer_ids = buffer_regs.len();
    regs.extend(buffer_regs.into_values());

    let mut distinct = regs.clone();
    distinct.sort_unstable();
    distinct.dedup();
    let expected = params.len() + results.len() + num_buffer_ids;
    if distinct.len() != expected || regs.iter().any(|r| r.class != RegClass::Gpr) {
        return Err(CompileError::structural(format!(
            "expected {expected} distinct data pointer registers, found {}",
            distinct.len()
        )));
    }
    Ok(DataPointers { regs, io_descs, num_inputs: params.len(), num_outputs: results.len(), num_buffer_ids })
}

/// Byte strides of the outer dimensions for one input or output.
///
/// Broadcast dimensions get a zero stride so every outer index reads the same data.
fn outer_offsets(desc: &PortDescriptor, master_shape: &[usize], outer_dims: usize) -> Vec<usize> {
    let rank = master_shape.len();
    (0..outer_dims)
        .map(|d| {
            let Some(j) = (d + desc.rank()).checked_sub(rank) else {
                return 0;
            };
            let dim_idx = desc.rank() - 1 - j;
            if desc.planar_dim(dim_idx) == 1 {
                0
            } else {
                desc.stride(dim_idx) * desc.element_type.size()
            }
        })
        .collect()
}

fn map_expr(mapper: &mut RegisterMapper, expr: &Expression) -> CompileResult<PhysRegInfo> {
    let RegInfo { inputs, outputs } = &expr.reg_info;
    Ok(PhysRegInfo {
        inputs: mapper.map_all(inputs)?,
        outputs: mapper.map_all(outputs)?,
        live: mapper.map_all(&expr.live_regs)?,
    })
}

/// Map positions `[begin, end)`, descending into every loop found on the way.
fn map_scope(
    ir: &LinearIR,
    mapper: &mut RegisterMapper,
    begin: usize,
    end: usize,
    phys: &mut Vec<PhysRegInfo>,
) -> CompileResult<()> {
    let mut pos = begin;
    while pos < end {
        let expr = ir.at(pos)?;
        phys.push(map_expr(mapper, expr)?);
        if let OpKind::LoopBegin { loop_id } = expr.kind {
            let (_, loop_end) = ir.get_loop_bounds(loop_id, true)?;
            map_scope(ir, mapper, pos + 1, loop_end, phys)?;
            pos = loop_end;
            continue;
        }
        pos += 1;
    }
    Ok(())
}

/// Generation driver bound to one target.
pub struct Generator<'t, T: TargetMachine> {
    target: &'t mut T,
}

impl<'t, T: TargetMachine> Generator<'t, T> {
    pub fn new(target: &'t mut T) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &T {
        self.target
    }

    /// Lower `ir` into a Schedule over `master_shape`.
    pub fn generate(
        &mut self,
        ir: &mut LinearIR,
        session: &CompilationSession<'_>,
        master_shape: &[usize],
        compile_params: Option<&dyn Any>,
    ) -> CompileResult<Schedule> {
        if !self.target.is_supported() {
            return Err(CompileError::target("the target instruction set is not supported on this machine"));
        }

        let mut pipeline = PassPipeline::new();
        pipeline.register(InsertSpecificIterations);
        pipeline.register(OptimizeLoopSingleEvaluation);
        pipeline.run(ir, session)?;

        let data_ptrs = collect_data_pointers(ir)?;
        let max = self.target.max_data_pointers();
        if data_ptrs.regs.len() > max {
            return Err(CompileError::ResourceExhaustion {
                resource: "data pointers",
                requested: data_ptrs.regs.len(),
                available: max,
            });
        }

        // Physical mapping: data pointers first, with the ABI registers held back.
        let banks = self.target.register_banks();
        let mut mapper = RegisterMapper::from_banks(&banks);
        let abi: Vec<AsmReg> = banks.abi_params.iter().map(|&id| AsmReg::gpr(id)).collect();
        for &reg in &abi {
            mapper.pool_mut(RegClass::Gpr).remove(reg)?;
        }
        let data_ptr_regs = mapper.map_all(&data_ptrs.regs)?;
        for &reg in &abi {
            mapper.pool_mut(RegClass::Gpr).release(reg)?;
        }
        let mut phys = Vec::with_capacity(ir.len());
        map_scope(ir, &mut mapper, 0, ir.len(), &mut phys)?;
        let gpr = mapper.mapped_count(RegClass::Gpr);
        let vec = mapper.mapped_count(RegClass::Vec);
        session.record_registers_mapped(gpr, vec);
        log::debug!("mapped {gpr} gpr and {vec} vec abstract registers");

        let config = ir.config().clone();
        let lowered: &LinearIR = ir;
        let mut body = Vec::with_capacity(lowered.len());
        for ((id, expr), regs) in lowered.iter().zip(phys) {
            let op_type = expr.op_type();
            let factory = self.target.get(op_type)?;
            let ctx = LoweringContext { ir: lowered, id, expr, config: &config, compile_params };
            let emitter = factory(&ctx)?;
            session.record_expression_lowered(op_type.name());
            body.push((emitter, regs));
        }

        let outer_dims = master_shape.len().saturating_sub(config.tile_rank);
        let info = KernelInfo {
            num_inputs: data_ptrs.num_inputs,
            num_outputs: data_ptrs.num_outputs,
            num_buffer_ids: data_ptrs.num_buffer_ids,
            scratchpad_size: ir.scratchpad_size(),
            data_ptr_regs,
            data_offsets: data_ptrs
                .io_descs
                .iter()
                .map(|desc| outer_offsets(desc, master_shape, outer_dims))
                .collect(),
            io_descs: data_ptrs.io_descs,
        };
        let kernel_factory = self.target.get_kernel()?;
        let kernel = kernel_factory(&info, body)?;

        let host = self.target.host();
        kernel.emit_code(host, &PhysRegInfo::default())?;
        kernel.emit_data(host)?;

        let abi = KernelAbi { num_inputs: info.num_inputs, num_outputs: info.num_outputs, num_outer_dims: outer_dims };
        let code = self.target.get_snippet()?.with_scratchpad_size(info.scratchpad_size).with_abi(abi);
        session.record_snippet_compiled(code.size());
        log::info!(
            "generated {} bytes of code for {}, scratchpad {} bytes",
            code.size(),
            session.current_snippet().as_deref().unwrap_or("<unnamed>"),
            code.scratchpad_size()
        );
        Ok(Schedule::new(master_shape, config.tile_rank, code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorCategory;
    use crate::core::test_utils::test::{RecordingTarget, TestContext};
    use crate::lowered::types::ElementType;
    use crate::subgraph::{BlockedShape, SubgraphBuilder};

    fn add_graph() -> crate::subgraph::Subgraph {
        let mut b = SubgraphBuilder::new();
        let x = b.parameter(ElementType::F32, vec![2, 4, 20]);
        let y = b.parameter(ElementType::F32, vec![2, 4, 20]);
        let sum = b.add(x, y).unwrap();
        b.result(sum).unwrap();
        b.build().unwrap()
    }

    fn shapes() -> (Vec<BlockedShape>, Vec<BlockedShape>) {
        let shape = BlockedShape::planar(vec![2, 4, 20], ElementType::F32);
        (vec![shape.clone()], vec![shape.clone(), shape])
    }

    #[test]
    fn test_generate_emits_kernel_listing() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut target = RecordingTarget::new(8);
        let (outputs, inputs) = shapes();
        let schedule = add_graph().generate(&outputs, &inputs, &mut target, &session, None).unwrap();

        assert_eq!(schedule.work_size, vec![2, 1, 1]);
        assert!(schedule.is_flat);
        assert_eq!(schedule.code.abi().num_outer_dims, 1);

        let listing = target.listing();
        assert_eq!(listing[0], "Kernel 2 in, 1 out, 0 buffers");
        // 20 = 2 * 8 + 4: a main body and a tail body.
        assert_eq!(listing.iter().filter(|l| l.starts_with("Add")).count(), 2);
        assert!(listing.iter().any(|l| l.starts_with("LoopEnd")));

        let stats = session.stats();
        assert_eq!(stats.snippets_compiled, 1);
        assert!(stats.expressions_lowered >= listing.len() - 1);
        assert!(stats.loops_split >= 1);
    }

    #[test]
    fn test_data_pointer_budget() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut target = RecordingTarget::new(8).with_max_data_pointers(2);
        let (outputs, inputs) = shapes();
        let err = add_graph().generate(&outputs, &inputs, &mut target, &session, None).unwrap_err();
        assert!(matches!(err, CompileError::ResourceExhaustion { resource: "data pointers", requested: 3, .. }));
    }

    #[test]
    fn test_abi_registers_are_not_data_pointers() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        // Two gprs are left once the argument registers are held back: too few for three pointers.
        let mut target = RecordingTarget::new(8).with_gpr_count(4);
        let (outputs, inputs) = shapes();
        let err = add_graph().generate(&outputs, &inputs, &mut target, &session, None).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
    }

    #[test]
    fn test_schedule_work_size() {
        let code = CodePtr::new(vec![0xc3], 0);
        let schedule = Schedule::new(&[2, 3, 4, 16], 2, code.clone());
        assert_eq!(schedule.work_size, vec![2, 3, 1, 1]);
        assert!(!schedule.is_flat);
        assert_eq!(schedule.num_invocations(), 6);

        let flat = Schedule::new(&[5, 4, 16], 2, code);
        assert_eq!(flat.work_size, vec![5, 1, 1]);
        assert!(flat.is_flat);
    }

    #[test]
    fn test_outer_offsets_skip_broadcast_dims() {
        let full = PortDescriptor::new(vec![2, 3, 4, 8], ElementType::F32);
        assert_eq!(outer_offsets(&full, &[2, 3, 4, 8], 2), vec![3 * 4 * 8 * 4, 4 * 8 * 4]);

        let broadcast = PortDescriptor::new(vec![1, 3, 4, 8], ElementType::F32);
        assert_eq!(outer_offsets(&broadcast, &[2, 3, 4, 8], 2), vec![0, 4 * 8 * 4]);

        let lower_rank = PortDescriptor::new(vec![4, 8], ElementType::F32);
        assert_eq!(outer_offsets(&lower_rank, &[2, 3, 4, 8], 2), vec![0, 0]);
    }

    #[test]
    fn test_code_ptr_object() {
        let code = CodePtr::new(vec![0x90, 0xc3], 0).with_scratchpad_size(64);
        assert_eq!(code.scratchpad_size(), 64);
        let bytes = code.to_object("snippet_kernel").unwrap();
        assert_eq!(&bytes[..4], b"\x7fELF");
    }
}
