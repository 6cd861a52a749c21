// This module provides the pass infrastructure of the Linear IR together with every lowering pass.
// A Pass transforms a whole LinearIR and reports whether it changed it; a RangedPass transforms the
// expressions between two program positions and is used for the specific-iteration handlers of a
// split loop. PassPipeline runs passes in registration order, skips optional passes the
// configuration disables, logs each run and counts it in the compilation session.

//! Linear IR passes.
//!
//! The default lowering order is:
//!
//! 1. [`InsertBroadcastMove`] and the optional [`FuseLoadBroadcastMove`]
//! 2. [`MarkLoops`] and [`BrgemmBlocking`]
//! 3. [`InsertLoops`]
//! 4. [`BufferIdentification`] and [`AllocateBuffers`]
//! 5. [`AssignRegisters`]
//!
//! The generation driver then runs [`InsertSpecificIterations`] and
//! [`OptimizeLoopSingleEvaluation`] right before emission.

pub mod allocate_buffers;
pub mod assign_registers;
pub mod brgemm_blocking;
pub mod buffer_identification;
pub mod insert_broadcast_move;
pub mod insert_loops;
pub mod insert_specific_iterations;
pub mod iter_handler;
pub mod mark_loops;
pub mod optimize_single_evaluation;

pub use allocate_buffers::AllocateBuffers;
pub use assign_registers::AssignRegisters;
pub use brgemm_blocking::BrgemmBlocking;
pub use buffer_identification::BufferIdentification;
pub use insert_broadcast_move::{FuseLoadBroadcastMove, InsertBroadcastMove};
pub use insert_loops::InsertLoops;
pub use insert_specific_iterations::InsertSpecificIterations;
pub use iter_handler::IterationHandler;
pub use mark_loops::MarkLoops;
pub use optimize_single_evaluation::OptimizeLoopSingleEvaluation;

use crate::core::error::CompileResult;
use crate::core::session::CompilationSession;
use crate::lowered::linear_ir::LinearIR;

/// Identifier of every pass, graph level ones included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    MulAddToFma,
    InsertBroadcastMove,
    FuseLoadBroadcastMove,
    MarkLoops,
    BrgemmBlocking,
    InsertLoops,
    BufferIdentification,
    AllocateBuffers,
    AssignRegisters,
    InsertSpecificIterations,
    OptimizeLoopSingleEvaluation,
}

impl PassId {
    pub fn name(self) -> &'static str {
        match self {
            PassId::MulAddToFma => "MulAddToFma",
            PassId::InsertBroadcastMove => "InsertBroadcastMove",
            PassId::FuseLoadBroadcastMove => "FuseLoadBroadcastMove",
            PassId::MarkLoops => "MarkLoops",
            PassId::BrgemmBlocking => "BrgemmBlocking",
            PassId::InsertLoops => "InsertLoops",
            PassId::BufferIdentification => "BufferIdentification",
            PassId::AllocateBuffers => "AllocateBuffers",
            PassId::AssignRegisters => "AssignRegisters",
            PassId::InsertSpecificIterations => "InsertSpecificIterations",
            PassId::OptimizeLoopSingleEvaluation => "OptimizeLoopSingleEvaluation",
        }
    }

    /// Passes whose absence still yields correct code.
    pub fn is_optional(self) -> bool {
        matches!(
            self,
            PassId::MulAddToFma | PassId::FuseLoadBroadcastMove | PassId::OptimizeLoopSingleEvaluation
        )
    }
}

/// A transformation over the whole Linear IR.
pub trait Pass {
    fn id(&self) -> PassId;

    /// Run the pass. Returns whether the IR changed.
    fn run(&mut self, ir: &mut LinearIR, session: &CompilationSession<'_>) -> CompileResult<bool>;
}

/// A transformation over program positions `[begin, end)`.
pub trait RangedPass {
    fn name(&self) -> &'static str;

    fn run_on_range(&self, ir: &mut LinearIR, begin: usize, end: usize) -> CompileResult<bool>;
}

/// Ordered list of passes.
#[derive(Default)]
pub struct PassPipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl PassPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Pass + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn run(&mut self, ir: &mut LinearIR, session: &CompilationSession<'_>) -> CompileResult<()> {
        for pass in self.passes.iter_mut() {
            let id = pass.id();
            if !ir.config().is_pass_enabled(id) {
                log::debug!("skipping disabled pass {}", id.name());
                continue;
            }
            log::debug!("running pass {}", id.name());
            let modified = pass.run(ir, session)?;
            log::trace!("pass {} finished (modified: {modified})", id.name());
            session.record_pass_run(id.name(), modified);
        }
        Ok(())
    }
}

/// Run a handler pipeline over `[begin, end)`.
pub fn run_handlers(handlers: &[IterationHandler], ir: &mut LinearIR, begin: usize, end: usize) -> CompileResult<bool> {
    let mut modified = false;
    for handler in handlers {
        log::trace!("running handler {} over [{begin}, {end})", handler.name());
        modified |= handler.run_on_range(ir, begin, end)?;
    }
    Ok(modified)
}

/// Lowering pipeline from dialect form to a register-assigned Linear IR.
pub fn lowering_pipeline(lanes: usize) -> PassPipeline {
    let mut pipeline = PassPipeline::new();
    pipeline.register(InsertBroadcastMove);
    pipeline.register(FuseLoadBroadcastMove);
    pipeline.register(MarkLoops::new(lanes));
    pipeline.register(BrgemmBlocking);
    pipeline.register(InsertLoops);
    pipeline.register(BufferIdentification);
    pipeline.register(AllocateBuffers);
    pipeline.register(AssignRegisters);
    pipeline
}
