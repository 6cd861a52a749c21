// This module splits loops into parts that each get their own specific-iteration handlers. Loops are
// visited in program order, which reaches an inner LoopEnd before the LoopEnd enclosing it, so an
// outer loop copies inner loops that are already split. For a loop with work amount W and increment
// I:
//
//   W == I        the body runs once; only the first-iteration handlers run, on the loop itself.
//   first-iter    a copy placed before the loop covers one increment and gets the first-iteration
//                 handlers.
//   tail != 0     the original loop shrinks to the tail and gets the last-iteration handlers. The
//                 iterations between the first part and the tail go to a main-body copy, unless the
//                 first part already covered them.
//   tail == 0     with a first-iteration copy the original gets the main-body handlers and W - I.
//
// Parts placed before the original keep advancing the data pointers and never rewind them: their
// finalization offsets are zero and they are marked as followed by another part. The original keeps
// its finalization offsets, which rewind the pointers over the whole work amount. A copied range
// gets fresh loop ids for the copied loop and every loop nested in it. Every loop enclosing the copy
// registers the copied ports next to the original ones.

//! Loop splitting into first-iteration, main-body and tail parts.

use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::lowered::expression::{ExprId, ExprPort};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::loop_manager::{LoopPort, SpecificIteration};
use crate::lowered::pass::{run_handlers, Pass, PassId};
use crate::lowered::types::OpKind;
use hashbrown::HashMap;

pub struct InsertSpecificIterations;

/// Work assigned to one part of a split loop.
#[derive(Debug, Clone, Copy)]
struct LoopPart {
    work_amount: usize,
    increment: usize,
    /// Whether another part of the same loop follows this one.
    followed_by_split: bool,
}

fn map_ports(ports: &[LoopPort], map: &HashMap<ExprId, ExprId>) -> Vec<LoopPort> {
    ports
        .iter()
        .map(|port| match map.get(&port.port.expr) {
            Some(&copy) => port.with_expr(copy),
            None => port.clone(),
        })
        .collect()
}

/// Copy loop `loop_id` with its markers right before its LoopBegin.
///
/// Returns the id of the copied loop and the number of inserted expressions.
fn copy_loop(ir: &mut LinearIR, loop_id: usize) -> CompileResult<(usize, usize)> {
    let (begin, end) = ir.get_loop_bounds(loop_id, true)?;
    let originals: Vec<ExprId> = ir.order()[begin..=end].to_vec();
    let outer = ir.expr(originals[0])?.loop_ids.clone();
    let nested: Vec<usize> = originals[1..originals.len() - 1]
        .iter()
        .filter_map(|&id| match ir.get(id).map(|e| &e.kind) {
            Some(OpKind::LoopBegin { loop_id }) => Some(*loop_id),
            _ => None,
        })
        .collect();

    let (copies, map) = ir.deep_copy_range(begin, end + 1)?;
    ir.insert_ids(begin, &copies)?;
    let count = copies.len();
    let copy_end = begin + count - 1;

    // Enclosing loops iterate over both copies of every port.
    for &old in &originals {
        let (inputs, outputs) = {
            let expr = ir.expr(old)?;
            (expr.inputs.len(), expr.outputs.len())
        };
        let new = map.get(&old).copied().ok_or_else(|| {
            CompileError::structural(format!("expression {} was not copied", old.0))
        })?;
        let ports = (0..inputs).map(|i| ExprPort::input(old, i)).chain((0..outputs).map(|i| ExprPort::output(old, i)));
        for port in ports {
            ir.loop_manager_mut().update_loops_port(&outer, port, &[port, port.with_expr(new)])?;
        }
    }

    for inner in nested {
        let info = ir.loop_manager().get_loop_info(inner)?.clone();
        let entries = map_ports(&info.entry_points, &map);
        let exits = map_ports(&info.exit_points, &map);
        let fresh =
            ir.replace_with_new_loop(begin, copy_end, info.work_amount, info.increment, entries, exits, inner)?;
        log::trace!("nested loop {inner} copied as loop {fresh}");
    }

    let info = ir.loop_manager().get_loop_info(loop_id)?.clone();
    let entries = map_ports(&info.entry_points, &map);
    let exits = map_ports(&info.exit_points, &map);
    let new_id = ir.replace_with_new_loop(begin, copy_end, info.work_amount, info.increment, entries, exits, loop_id)?;
    Ok((new_id, count))
}

/// Write `part` into the LoopInfo and the LoopEnd of `loop_id`.
fn apply_part(ir: &mut LinearIR, loop_id: usize, part: LoopPart) -> CompileResult<()> {
    let info = ir.loop_manager_mut().get_loop_info_mut(loop_id)?;
    info.work_amount = part.work_amount;
    info.increment = part.increment;

    let (_, end) = ir.get_loop_bounds(loop_id, true)?;
    let end_id = ir.id_at(end)?;
    let OpKind::LoopEnd(data) = &mut ir.expr_mut(end_id)?.kind else {
        return Err(CompileError::structural(format!("loop {loop_id} does not end with a LoopEnd")));
    };
    data.work_amount = part.work_amount;
    data.increment = part.increment;
    if part.followed_by_split {
        data.finalization_offsets.iter_mut().for_each(|offset| *offset = 0);
        data.followed_by_split = true;
    }
    Ok(())
}

/// Copy `loop_id` before itself, run `iter` handlers on the copy and give it `part`.
fn insert_part(ir: &mut LinearIR, loop_id: usize, iter: SpecificIteration, part: LoopPart) -> CompileResult<usize> {
    let handlers = ir.loop_manager().get_loop_info(loop_id)?.handlers(iter).to_vec();
    let (copy_id, count) = copy_loop(ir, loop_id)?;
    let (begin, end) = ir.get_loop_bounds(copy_id, true)?;
    run_handlers(&handlers, ir, begin, end)?;
    apply_part(ir, copy_id, part)?;
    log::debug!(
        "loop {loop_id}: {iter:?} part as loop {copy_id} (work {}, increment {})",
        part.work_amount,
        part.increment
    );
    Ok(count)
}

/// Split one loop. Returns the number of expressions inserted before it.
fn split_loop(ir: &mut LinearIR, loop_id: usize, session: &CompilationSession<'_>) -> CompileResult<usize> {
    let info = ir.loop_manager().get_loop_info(loop_id)?.clone();
    let (work, increment) = (info.work_amount, info.increment);
    if increment == 0 {
        return Err(CompileError::structural(format!("loop {loop_id} has a zero increment")));
    }

    if work == increment {
        let (begin, end) = ir.get_loop_bounds(loop_id, true)?;
        run_handlers(info.handlers(SpecificIteration::FirstIter), ir, begin, end)?;
        return Ok(0);
    }

    let mut inserted = 0;
    let mut clones = 0;
    let has_first_iter = !info.handlers(SpecificIteration::FirstIter).is_empty();
    let mut remaining = work;
    if has_first_iter {
        inserted += insert_part(
            ir,
            loop_id,
            SpecificIteration::FirstIter,
            LoopPart { work_amount: increment, increment, followed_by_split: true },
        )?;
        clones += 1;
        remaining = work.saturating_sub(increment);
    }

    let tail = remaining % increment;
    if tail != 0 {
        let main_work = remaining - tail;
        if main_work > 0 {
            inserted += insert_part(
                ir,
                loop_id,
                SpecificIteration::MainBody,
                LoopPart { work_amount: main_work, increment, followed_by_split: true },
            )?;
            clones += 1;
        }
        let (begin, end) = ir.get_loop_bounds(loop_id, true)?;
        run_handlers(info.handlers(SpecificIteration::LastIter), ir, begin, end)?;
        apply_part(ir, loop_id, LoopPart { work_amount: tail, increment: tail, followed_by_split: false })?;
        log::debug!("loop {loop_id}: tail of {tail} (work {work}, increment {increment})");
    } else if has_first_iter {
        let (begin, end) = ir.get_loop_bounds(loop_id, true)?;
        run_handlers(info.handlers(SpecificIteration::MainBody), ir, begin, end)?;
        apply_part(ir, loop_id, LoopPart { work_amount: remaining, increment, followed_by_split: false })?;
    }

    if clones > 0 {
        session.record_loop_split(clones);
    }
    Ok(inserted)
}

impl Pass for InsertSpecificIterations {
    fn id(&self) -> PassId {
        PassId::InsertSpecificIterations
    }

    fn run(&mut self, ir: &mut LinearIR, session: &CompilationSession<'_>) -> CompileResult<bool> {
        let mut modified = false;
        let mut pos = 0;
        while pos < ir.len() {
            let loop_id = match &ir.at(pos)?.kind {
                OpKind::LoopEnd(data) => data.loop_id,
                _ => {
                    pos += 1;
                    continue;
                }
            };
            let inserted = split_loop(ir, loop_id, session)?;
            modified |= inserted > 0;
            pos += inserted + 1;
        }
        ir.validate()?;
        Ok(modified)
    }
}
