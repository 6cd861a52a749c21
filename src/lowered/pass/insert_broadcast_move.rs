//! Explicit broadcasting along the innermost dimension.

use crate::core::error::CompileResult;
use crate::core::session::CompilationSession;
use crate::lowered::expression::{ExprId, Expression, Input, OutputRef};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::pass::{Pass, PassId};
use crate::lowered::types::{MemoryAccess, OpKind, PortDescriptor};

/// Inserts a BroadcastMove before every elementwise input whose innermost
/// dimension is 1 while the output's is not.
pub struct InsertBroadcastMove;

fn already_broadcasts(kind: &OpKind) -> bool {
    matches!(kind, OpKind::BroadcastLoad(_) | OpKind::Scalar(_) | OpKind::BroadcastMove)
}

fn broadcast_desc(input: &PortDescriptor, inner: usize) -> PortDescriptor {
    let mut desc = PortDescriptor::new(input.planar_shape(), input.element_type);
    if let Some(last) = desc.shape.last_mut() {
        *last = inner;
    }
    desc.subtensor = vec![crate::lowered::types::FULL_DIM; desc.rank()];
    desc
}

impl Pass for InsertBroadcastMove {
    fn id(&self) -> PassId {
        PassId::InsertBroadcastMove
    }

    fn run(&mut self, ir: &mut LinearIR, _session: &CompilationSession<'_>) -> CompileResult<bool> {
        let mut modified = false;
        let candidates: Vec<ExprId> = ir
            .iter()
            .filter(|(_, e)| matches!(e.kind, OpKind::Eltwise(_)))
            .map(|(id, _)| id)
            .collect();
        for id in candidates {
            let expr = ir.expr(id)?.clone();
            let Some(out) = expr.outputs.first() else { continue };
            let inner = out.planar_dim(0);
            if inner == 1 {
                continue;
            }
            for (index, input) in expr.inputs.iter().enumerate() {
                if input.desc.planar_dim(0) != 1 {
                    continue;
                }
                if already_broadcasts(&ir.expr(input.source.expr)?.kind) {
                    continue;
                }
                let desc = broadcast_desc(&input.desc, inner);
                let mut broadcast = Expression::new(
                    OpKind::BroadcastMove,
                    vec![input.clone()],
                    vec![desc.clone()],
                );
                broadcast.loop_ids = expr.loop_ids.clone();
                let new_id = ir.insert_before(id, broadcast)?;
                let consumer = ir.expr_mut(id)?;
                consumer.inputs[index] = Input { source: OutputRef::new(new_id, 0), desc };
                log::trace!("inserted BroadcastMove for input {index} of expression {}", id.0);
                modified = true;
            }
        }
        Ok(modified)
    }
}

/// Folds `Load -> BroadcastMove` into a single BroadcastLoad when the Load
/// has no other consumer.
pub struct FuseLoadBroadcastMove;

impl Pass for FuseLoadBroadcastMove {
    fn id(&self) -> PassId {
        PassId::FuseLoadBroadcastMove
    }

    fn run(&mut self, ir: &mut LinearIR, _session: &CompilationSession<'_>) -> CompileResult<bool> {
        let mut modified = false;
        let moves: Vec<ExprId> = ir
            .iter()
            .filter(|(_, e)| matches!(e.kind, OpKind::BroadcastMove))
            .map(|(id, _)| id)
            .collect();
        for move_id in moves {
            let broadcast = ir.expr(move_id)?.clone();
            let Some(source) = broadcast.inputs.first().map(|input| input.source) else { continue };
            let load = ir.expr(source.expr)?.clone();
            let OpKind::Load(access) = load.kind else { continue };
            if ir.consumers(source).len() != 1 {
                continue;
            }
            let mut fused = Expression::new(
                OpKind::BroadcastLoad(MemoryAccess { count: 1, offset: access.offset }),
                load.inputs.clone(),
                broadcast.outputs.clone(),
            );
            fused.loop_ids = load.loop_ids.clone();
            let fused_id = ir.insert_before(source.expr, fused)?;
            for (consumer, index) in ir.consumers(OutputRef::new(move_id, 0)) {
                ir.replace_input(consumer, index, OutputRef::new(fused_id, 0))?;
            }
            ir.erase(move_id)?;
            ir.erase(source.expr)?;
            log::trace!("fused Load {} and BroadcastMove {} into BroadcastLoad", source.expr.0, move_id.0);
            modified = true;
        }
        Ok(modified)
    }
}
