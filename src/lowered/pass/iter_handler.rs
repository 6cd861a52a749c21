//! Specific-iteration handlers.
//!
//! Handlers run over `[LoopBegin, LoopEnd)` of one part of a split loop and
//! patch the body for the iterations that part covers.

use crate::core::error::{CompileError, CompileResult};
use crate::lowered::expression::PortKind;
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::pass::RangedPass;
use crate::lowered::types::OpKind;

#[derive(Debug, Clone, PartialEq)]
pub enum IterationHandler {
    /// Set every memory access count above one to the given count.
    UpdateMemoryAccessCounts(usize),
    /// Set the subtensor of every incremented port of the loop to the given block.
    UpdateSubtensors(usize),
    /// Set the beta of every Brgemm in the range.
    SetBrgemmBeta(f32),
}

impl RangedPass for IterationHandler {
    fn name(&self) -> &'static str {
        match self {
            IterationHandler::UpdateMemoryAccessCounts(_) => "UpdateMemoryAccessCounts",
            IterationHandler::UpdateSubtensors(_) => "UpdateSubtensors",
            IterationHandler::SetBrgemmBeta(_) => "SetBrgemmBeta",
        }
    }

    fn run_on_range(&self, ir: &mut LinearIR, begin: usize, end: usize) -> CompileResult<bool> {
        match *self {
            IterationHandler::UpdateMemoryAccessCounts(count) => update_memory_access_counts(ir, begin, end, count),
            IterationHandler::UpdateSubtensors(block) => update_subtensors(ir, begin, end, block),
            IterationHandler::SetBrgemmBeta(beta) => set_brgemm_beta(ir, begin, end, beta),
        }
    }
}

fn update_memory_access_counts(ir: &mut LinearIR, begin: usize, end: usize, count: usize) -> CompileResult<bool> {
    let mut modified = false;
    let mut depth = 0usize;
    for pos in begin..end {
        let id = ir.id_at(pos)?;
        let expr = ir.expr_mut(id)?;
        match expr.kind {
            OpKind::LoopBegin { .. } if pos != begin => {
                depth += 1;
                continue;
            }
            OpKind::LoopEnd(_) => {
                depth = depth.saturating_sub(1);
                continue;
            }
            _ => {}
        }
        // Nested loops keep their own counts.
        if depth > 0 {
            continue;
        }
        for index in 0..expr.inputs.len() {
            if let Some(access) = expr.kind.input_access_mut(index) {
                if access.count > 1 {
                    access.count = count;
                    modified = true;
                }
            }
        }
        for index in 0..expr.outputs.len() {
            if let Some(access) = expr.kind.output_access_mut(index) {
                if access.count > 1 {
                    access.count = count;
                    modified = true;
                }
            }
        }
    }
    Ok(modified)
}

fn update_subtensors(ir: &mut LinearIR, begin: usize, end: usize, block: usize) -> CompileResult<bool> {
    let loop_id = match ir.at(begin)?.kind {
        OpKind::LoopBegin { loop_id } => loop_id,
        _ => {
            return Err(CompileError::structural(format!(
                "handler range starting at {begin} does not start with a LoopBegin"
            )))
        }
    };
    let ports: Vec<_> = ir
        .loop_manager()
        .get_loop_info(loop_id)?
        .ports()
        .filter(|p| p.is_incremented)
        .cloned()
        .collect();
    let mut modified = false;
    for loop_port in ports {
        let pos = ir.position(loop_port.port.expr)?;
        if pos < begin || pos >= end {
            continue;
        }
        let expr = ir.expr_mut(loop_port.port.expr)?;
        let Some(desc) = expr.port_desc_mut(&loop_port.port) else {
            return Err(CompileError::structural(format!(
                "loop {loop_id} references missing {} port {} of expression {}",
                if loop_port.port.kind == PortKind::Input { "input" } else { "output" },
                loop_port.port.index,
                loop_port.port.expr.0
            )));
        };
        if desc.planar_dim(loop_port.dim_idx) > 1 {
            desc.set_subtensor_dim(loop_port.dim_idx, block);
            modified = true;
        }
    }
    Ok(modified)
}

fn set_brgemm_beta(ir: &mut LinearIR, begin: usize, end: usize, beta: f32) -> CompileResult<bool> {
    let mut modified = false;
    for pos in begin..end {
        let id = ir.id_at(pos)?;
        if let OpKind::Brgemm(data) = &mut ir.expr_mut(id)?.kind {
            data.beta = beta;
            modified = true;
        }
    }
    Ok(modified)
}
