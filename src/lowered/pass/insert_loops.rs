// This module materializes the loops registered by MarkLoops and BrgemmBlocking. For every loop
// port it computes the per-unit pointer increment (the element stride of the walked planar
// dimension, or zero for a broadcast dimension), the finalization offset rewinding the pointer once
// the loop is done, and the element size. Loops are then bracketed by LoopBegin/LoopEnd markers,
// innermost first, so an outer loop's body range includes the markers of the loops it contains.
// The LoopEnd consumes each distinct data pointer touched by the loop once, followed by the counter
// produced by its LoopBegin. Two ports reaching the same pointer with different strides cannot share
// it and reject the layout.

//! Loop initialization and marker insertion.

use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::lowered::expression::{Expression, Input, OutputRef, PortKind};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::loop_manager::LoopPort;
use crate::lowered::pass::{Pass, PassId};
use crate::lowered::types::{ElementType, LoopEndData, OpKind, PortDescriptor};

pub struct InsertLoops;

/// Fill pointer increments, finalization offsets and data sizes of `port`.
fn init_port(ir: &LinearIR, port: &mut LoopPort, work_amount: usize) -> CompileResult<()> {
    let expr = ir.expr(port.port.expr)?;
    let desc = expr.port_desc(&port.port).ok_or_else(|| {
        CompileError::structural(format!("loop port references missing port of expression {}", port.port.expr.0))
    })?;
    port.data_size = desc.element_type.size();
    port.ptr_increment = if !port.is_incremented || (desc.planar_dim(port.dim_idx) == 1 && work_amount != 1) {
        0
    } else {
        desc.stride(port.dim_idx) as i64
    };
    port.finalization_offset = -port.ptr_increment * work_amount as i64;
    Ok(())
}

/// Data pointer value behind a loop port.
pub(crate) fn port_connector(ir: &LinearIR, port: &LoopPort) -> CompileResult<OutputRef> {
    match port.port.kind {
        PortKind::Input => ir
            .expr(port.port.expr)?
            .inputs
            .get(port.port.index)
            .map(|input| input.source)
            .ok_or_else(|| {
                CompileError::structural(format!("expression {} has no input {}", port.port.expr.0, port.port.index))
            }),
        PortKind::Output => Ok(OutputRef::new(port.port.expr, port.port.index)),
    }
}

/// Loop nesting depth: the number of loops enclosing `loop_id`.
fn loop_depth(ir: &LinearIR, loop_id: usize) -> Option<usize> {
    ir.iter().find_map(|(_, e)| e.loop_ids.iter().position(|&id| id == loop_id))
}

impl Pass for InsertLoops {
    fn id(&self) -> PassId {
        PassId::InsertLoops
    }

    fn run(&mut self, ir: &mut LinearIR, _session: &CompilationSession<'_>) -> CompileResult<bool> {
        let mut loops: Vec<(usize, usize)> = ir
            .loop_manager()
            .loop_ids()
            .into_iter()
            .filter_map(|id| loop_depth(ir, id).map(|depth| (depth, id)))
            .collect();
        // Innermost first.
        loops.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for &(depth, loop_id) in &loops {
            let mut info = ir.loop_manager().get_loop_info(loop_id)?.clone();
            for port in info.entry_points.iter_mut().chain(info.exit_points.iter_mut()) {
                init_port(ir, port, info.work_amount)?;
            }
            info.has_outer_loop = depth > 0;

            let mut connectors: Vec<(OutputRef, PortDescriptor, &LoopPort)> = Vec::new();
            for port in info.ports() {
                let connector = port_connector(ir, port)?;
                if let Some((_, _, kept)) = connectors.iter().find(|(c, _, _)| *c == connector) {
                    // One data pointer advances by one step per iteration.
                    if kept.ptr_increment != port.ptr_increment {
                        return Err(CompileError::unsupported_layout(format!(
                            "loop {loop_id} walks one data pointer with strides {} and {}",
                            kept.ptr_increment, port.ptr_increment
                        )));
                    }
                    continue;
                }
                let desc = ir
                    .expr(port.port.expr)?
                    .port_desc(&port.port)
                    .cloned()
                    .ok_or_else(|| CompileError::structural("loop port without descriptor"))?;
                connectors.push((connector, desc, port));
            }

            let data = LoopEndData {
                loop_id,
                work_amount: info.work_amount,
                increment: info.increment,
                ptr_increments: connectors.iter().map(|(_, _, p)| p.ptr_increment).collect(),
                finalization_offsets: connectors.iter().map(|(_, _, p)| p.finalization_offset).collect(),
                data_sizes: connectors.iter().map(|(_, _, p)| p.data_size).collect(),
                evaluate_once: false,
                has_outer_loop: info.has_outer_loop,
                followed_by_split: false,
            };
            let mut inputs: Vec<Input> =
                connectors.into_iter().map(|(source, desc, _)| Input { source, desc }).collect();

            let (begin, end) = ir.get_loop_bounds(loop_id, false)?;
            let first = ir.id_at(begin)?;
            let outer = ir.get_outer_expr_loops(first, loop_id)?;

            let mut loop_begin = Expression::new(
                OpKind::LoopBegin { loop_id },
                vec![],
                vec![PortDescriptor::new(vec![1], ElementType::I32)],
            );
            loop_begin.loop_ids = outer.clone();
            let begin_id = ir.insert(begin, loop_begin)?;

            inputs.push(Input {
                source: OutputRef::new(begin_id, 0),
                desc: PortDescriptor::new(vec![1], ElementType::I32),
            });
            let mut loop_end = Expression::new(OpKind::LoopEnd(data), inputs, vec![]);
            loop_end.loop_ids = outer;
            // The body shifted by one after the LoopBegin insertion.
            ir.insert(end + 1, loop_end)?;

            *ir.loop_manager_mut().get_loop_info_mut(loop_id)? = info;
            log::debug!("inserted markers of loop {loop_id} (depth {depth}) around [{begin}, {end})");
        }
        Ok(!loops.is_empty())
    }
}
