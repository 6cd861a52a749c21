// This module defines the seam between the generation driver and a concrete code generator. A
// TargetMachine owns an emitter registry keyed by operation type tag and a host object the emitters
// write into (for the reference x86-64 target, an assembler). The driver asks the target for one
// emitter per lowered expression, then for the kernel emitter wrapping all of them, and finally for
// the finalized code. Factories are plain function pointers so a registry is just a table; targets
// build their registry when they are created and no state is global.

//! Target Machine and emitter interfaces.

use crate::core::config::Config;
use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::{AsmReg, PhysRegInfo, RegisterBanks};
use crate::generator::CodePtr;
use crate::lowered::expression::{ExprId, Expression};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::types::PortDescriptor;
use hashbrown::HashMap;
use std::any::Any;

pub use crate::lowered::types::{OpType, RegType};

/// Code emitter for one lowered operation.
pub trait Emitter<H> {
    /// Emit the instructions of the operation.
    fn emit_code(&self, host: &mut H, regs: &PhysRegInfo) -> CompileResult<()>;

    /// Emit constant data the code refers to. Runs after every `emit_code`.
    fn emit_data(&self, _host: &mut H) -> CompileResult<()> {
        Ok(())
    }
}

/// Everything an expression emitter factory may inspect.
pub struct LoweringContext<'a> {
    pub ir: &'a LinearIR,
    pub id: ExprId,
    pub expr: &'a Expression,
    pub config: &'a Config,
    /// Opaque target-specific compile parameters passed through by the caller.
    pub compile_params: Option<&'a dyn Any>,
}

/// Description of the top-level kernel handed to the kernel emitter factory.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelInfo {
    pub num_inputs: usize,
    pub num_outputs: usize,
    /// Number of distinct buffer ids; they all point at the scratchpad base.
    pub num_buffer_ids: usize,
    pub scratchpad_size: usize,
    /// Physical data pointer registers: inputs, then outputs, then buffer ids.
    pub data_ptr_regs: Vec<AsmReg>,
    /// Descriptors of the inputs and outputs, in the same order.
    pub io_descs: Vec<PortDescriptor>,
    /// Per input/output byte stride of every outer dimension driven by the caller.
    pub data_offsets: Vec<Vec<usize>>,
}

pub type ExprEmitterFactory<H> = fn(&LoweringContext<'_>) -> CompileResult<Box<dyn Emitter<H>>>;

pub type KernelEmitterFactory<H> =
    fn(&KernelInfo, Vec<(Box<dyn Emitter<H>>, PhysRegInfo)>) -> CompileResult<Box<dyn Emitter<H>>>;

/// Emitter factories of one target keyed by operation type.
pub struct EmitterRegistry<H> {
    factories: HashMap<OpType, ExprEmitterFactory<H>>,
    kernel: Option<KernelEmitterFactory<H>>,
}

impl<H> EmitterRegistry<H> {
    pub fn new() -> Self {
        Self { factories: HashMap::new(), kernel: None }
    }

    pub fn register(&mut self, op_type: OpType, factory: ExprEmitterFactory<H>) {
        self.factories.insert(op_type, factory);
    }

    pub fn register_kernel(&mut self, factory: KernelEmitterFactory<H>) {
        self.kernel = Some(factory);
    }

    pub fn has(&self, op_type: OpType) -> bool {
        if op_type == OpType::Kernel {
            return self.kernel.is_some();
        }
        self.factories.contains_key(&op_type)
    }

    pub fn get(&self, op_type: OpType) -> Option<ExprEmitterFactory<H>> {
        self.factories.get(&op_type).copied()
    }

    pub fn kernel(&self) -> Option<KernelEmitterFactory<H>> {
        self.kernel
    }

    pub fn len(&self) -> usize {
        self.factories.len() + usize::from(self.kernel.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H> Default for EmitterRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// A code generation target.
pub trait TargetMachine {
    /// Object the emitters write into.
    type Host;

    /// Whether the instruction set the target emits is available.
    fn is_supported(&self) -> bool;

    /// Vector lanes of one f32 register.
    fn get_lanes(&self) -> usize;

    fn registry(&self) -> &EmitterRegistry<Self::Host>;

    fn has(&self, op_type: OpType) -> bool {
        self.registry().has(op_type)
    }

    fn get(&self, op_type: OpType) -> CompileResult<ExprEmitterFactory<Self::Host>> {
        self.registry()
            .get(op_type)
            .ok_or_else(|| CompileError::target(format!("no emitter registered for {op_type}")))
    }

    fn get_kernel(&self) -> CompileResult<KernelEmitterFactory<Self::Host>> {
        self.registry()
            .kernel()
            .ok_or_else(|| CompileError::target("no kernel emitter registered"))
    }

    /// Physical registers available to generated kernels.
    fn register_banks(&self) -> RegisterBanks;

    /// Upper bound on data pointers a kernel may keep in registers.
    fn max_data_pointers(&self) -> usize;

    fn host(&mut self) -> &mut Self::Host;

    /// Finalize everything emitted so far into callable code.
    fn get_snippet(&mut self) -> CompileResult<CodePtr>;
}
