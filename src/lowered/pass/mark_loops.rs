//! Loop marking for elementwise runs.
//!
//! Every maximal run of expressions that can share a loop gets an inner loop
//! over the innermost planar dimension and, for two-dimensional tiles, an outer
//! loop over the next one.

use crate::core::error::CompileResult;
use crate::core::session::CompilationSession;
use crate::lowered::expression::{ExprId, ExprPort, PortKind};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::loop_manager::{LoopInfo, LoopPort, SpecificIteration};
use crate::lowered::pass::{IterationHandler, Pass, PassId};
use crate::lowered::types::OpKind;

pub struct MarkLoops {
    lanes: usize,
}

impl MarkLoops {
    pub fn new(lanes: usize) -> Self {
        Self { lanes: lanes.max(1) }
    }
}

fn is_loopable(kind: &OpKind) -> bool {
    !(kind.is_io() || kind.is_loop_marker() || matches!(kind, OpKind::Brgemm(_)))
}

/// Maximal runs of loopable expressions not yet inside a loop, as position ranges.
fn collect_runs(ir: &LinearIR) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = None;
    for (pos, (_, expr)) in ir.iter().enumerate() {
        let loopable = is_loopable(&expr.kind) && expr.loop_ids.is_empty();
        match (loopable, start) {
            (true, None) => start = Some(pos),
            (false, Some(s)) => {
                runs.push((s, pos));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, ir.len()));
    }
    runs
}

fn memory_ports(ir: &LinearIR, begin: usize, end: usize) -> CompileResult<(Vec<ExprPort>, Vec<ExprPort>)> {
    let mut entries = Vec::new();
    let mut exits = Vec::new();
    for pos in begin..end {
        let id: ExprId = ir.id_at(pos)?;
        let expr = ir.expr(id)?;
        for index in 0..expr.inputs.len() {
            if expr.kind.input_access(index).is_some() {
                entries.push(ExprPort::input(id, index));
            }
        }
        for index in 0..expr.outputs.len() {
            if expr.kind.output_access(index).is_some() {
                exits.push(ExprPort::output(id, index));
            }
        }
    }
    Ok((entries, exits))
}

impl Pass for MarkLoops {
    fn id(&self) -> PassId {
        PassId::MarkLoops
    }

    fn run(&mut self, ir: &mut LinearIR, _session: &CompilationSession<'_>) -> CompileResult<bool> {
        let tile_rank = ir.config().tile_rank;
        let mut modified = false;
        for (begin, end) in collect_runs(ir) {
            let (entries, exits) = memory_ports(ir, begin, end)?;
            if entries.is_empty() && exits.is_empty() {
                continue;
            }

            let mut inner_work = 1;
            let mut outer_work = 1;
            let mut has_reshape = false;
            for port in entries.iter().chain(exits.iter()) {
                let expr = ir.expr(port.expr)?;
                has_reshape |= matches!(expr.kind, OpKind::LoadReshape { .. });
                if let Some(desc) = expr.port_desc(port) {
                    inner_work = inner_work.max(desc.planar_dim(0));
                    outer_work = outer_work.max(desc.planar_dim(1));
                }
            }
            let increment = if has_reshape { 1 } else { self.lanes.min(inner_work) };

            let mut inner = LoopInfo::new(
                inner_work,
                increment,
                entries.iter().map(|p| LoopPort::new(*p, 0)).collect(),
                exits.iter().map(|p| LoopPort::new(*p, 0)).collect(),
            );
            let tail = inner_work % increment;
            if tail != 0 {
                inner.register_handler(SpecificIteration::LastIter, IterationHandler::UpdateMemoryAccessCounts(tail));
                inner.register_handler(SpecificIteration::LastIter, IterationHandler::UpdateSubtensors(tail));
            }
            let inner_id = ir.mark_loop(begin, end, inner)?;
            log::debug!(
                "marked inner loop {inner_id}: work {inner_work}, increment {increment}, tail {tail}"
            );

            for port in entries.iter().chain(exits.iter()) {
                let expr = ir.expr_mut(port.expr)?;
                let broadcast = expr.port_desc(port).map(|d| d.planar_dim(0) == 1).unwrap_or(true);
                let count = if broadcast { 1 } else { increment };
                let access = match port.kind {
                    PortKind::Input => expr.kind.input_access_mut(port.index),
                    PortKind::Output => expr.kind.output_access_mut(port.index),
                };
                if let Some(access) = access {
                    access.count = count;
                }
            }

            if tile_rank >= 2 && outer_work > 1 {
                let outer = LoopInfo::new(
                    outer_work,
                    1,
                    entries.iter().map(|p| LoopPort::new(*p, 1)).collect(),
                    exits.iter().map(|p| LoopPort::new(*p, 1)).collect(),
                );
                let outer_id = ir.mark_loop(begin, end, outer)?;
                log::debug!("marked outer loop {outer_id}: work {outer_work}");
            }
            modified = true;
        }
        Ok(modified)
    }
}
