// This module provides the M/N/K blocking of brgemm expressions. A brgemm multiplies an A tile
// [M, K] by a B tile [K, N] into C [M, N] through an external microkernel, which processes at most
// one block per call. For each dimension that exceeds its configured block size the pass wraps the
// brgemm in a loop stepping by the block: the operands indexed by that dimension get incremented
// loop ports and the other operands stay in place. Blocking along K turns the brgemm into an
// accumulation, so the first K iteration gets a handler resetting beta to zero. Remainders get a
// last-iteration handler shrinking the port subtensors to the tail.

//! Brgemm blocking along M, N and K.

use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::lowered::expression::{ExprId, ExprPort};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::loop_manager::{LoopInfo, LoopPort, SpecificIteration};
use crate::lowered::pass::{IterationHandler, Pass, PassId};
use crate::lowered::types::OpKind;

pub struct BrgemmBlocking;

/// Brgemm dimensions resolved from its port descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrgemmDims {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl BrgemmDims {
    pub fn of(ir: &LinearIR, id: ExprId) -> CompileResult<Self> {
        let expr = ir.expr(id)?;
        let (Some(a), Some(b)) = (expr.inputs.first(), expr.inputs.get(1)) else {
            return Err(CompileError::structural(format!("brgemm {} needs two inputs", id.0)));
        };
        let k = a.desc.planar_dim(0);
        if b.desc.planar_dim(1) != k {
            return Err(CompileError::unsupported_shape(format!(
                "brgemm K mismatch: A has {k}, B has {}",
                b.desc.planar_dim(1)
            )));
        }
        Ok(Self { m: a.desc.planar_dim(1), n: b.desc.planar_dim(0), k })
    }
}

fn block_loop(
    ir: &mut LinearIR,
    pos: usize,
    work: usize,
    block: usize,
    entries: Vec<LoopPort>,
    exits: Vec<LoopPort>,
    first_iter: Option<IterationHandler>,
) -> CompileResult<usize> {
    let mut info = LoopInfo::new(work, block, entries, exits);
    if let Some(handler) = first_iter {
        info.register_handler(SpecificIteration::FirstIter, handler);
    }
    let tail = work % block;
    if tail != 0 {
        info.register_handler(SpecificIteration::LastIter, IterationHandler::UpdateSubtensors(tail));
    }
    ir.mark_loop(pos, pos + 1, info)
}

impl Pass for BrgemmBlocking {
    fn id(&self) -> PassId {
        PassId::BrgemmBlocking
    }

    fn run(&mut self, ir: &mut LinearIR, _session: &CompilationSession<'_>) -> CompileResult<bool> {
        let blocks = ir.config().brgemm_blocking;
        let brgemms: Vec<ExprId> = ir
            .iter()
            .filter(|(_, e)| matches!(e.kind, OpKind::Brgemm(_)))
            .map(|(id, _)| id)
            .collect();
        let mut modified = false;
        for id in brgemms {
            if !ir.expr(id)?.loop_ids.is_empty() {
                log::trace!("brgemm {} is already blocked", id.0);
                continue;
            }
            let dims = BrgemmDims::of(ir, id)?;
            let block_m = blocks.m.min(dims.m).max(1);
            let block_n = blocks.n.min(dims.n).max(1);
            let block_k = blocks.k.min(dims.k).max(1);

            let a = ExprPort::input(id, 0);
            let b = ExprPort::input(id, 1);
            let c = ExprPort::output(id, 0);

            {
                let expr = ir.expr_mut(id)?;
                expr.inputs[0].desc.set_subtensor_dim(1, block_m);
                expr.inputs[0].desc.set_subtensor_dim(0, block_k);
                expr.inputs[1].desc.set_subtensor_dim(1, block_k);
                expr.inputs[1].desc.set_subtensor_dim(0, block_n);
                if let Some(out) = expr.outputs.first_mut() {
                    out.set_subtensor_dim(1, block_m);
                    out.set_subtensor_dim(0, block_n);
                }
                if let OpKind::Brgemm(data) = &mut expr.kind {
                    data.beta = if dims.k > block_k { 1.0 } else { 0.0 };
                }
            }

            let pos = ir.position(id)?;
            if dims.k > block_k {
                let loop_id = block_loop(
                    ir,
                    pos,
                    dims.k,
                    block_k,
                    vec![LoopPort::new(a, 0), LoopPort::new(b, 1)],
                    vec![LoopPort::not_incremented(c, 0)],
                    Some(IterationHandler::SetBrgemmBeta(0.0)),
                )?;
                log::debug!("brgemm {}: K loop {loop_id} ({} by {block_k})", id.0, dims.k);
            }
            if dims.n > block_n {
                let loop_id = block_loop(
                    ir,
                    pos,
                    dims.n,
                    block_n,
                    vec![LoopPort::not_incremented(a, 0), LoopPort::new(b, 0)],
                    vec![LoopPort::new(c, 0)],
                    None,
                )?;
                log::debug!("brgemm {}: N loop {loop_id} ({} by {block_n})", id.0, dims.n);
            }
            if dims.m > block_m {
                let loop_id = block_loop(
                    ir,
                    pos,
                    dims.m,
                    block_m,
                    vec![LoopPort::new(a, 1), LoopPort::not_incremented(b, 1)],
                    vec![LoopPort::new(c, 1)],
                    None,
                )?;
                log::debug!("brgemm {}: M loop {loop_id} ({} by {block_m})", id.0, dims.m);
            }
            modified = true;
        }
        Ok(modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::test_utils::test::TestContext;
    use crate::lowered::expression::{Expression, Input, OutputRef};
    use crate::lowered::pass::{InsertLoops, InsertSpecificIterations};
    use crate::lowered::types::{BrgemmData, ElementType, LoopEndData, MemoryAccess, PortDescriptor};

    fn create_test_brgemm(ir: &mut LinearIR, m: usize, n: usize, k: usize) -> ExprId {
        let a = PortDescriptor::new(vec![m, k], ElementType::F32);
        let b = PortDescriptor::new(vec![k, n], ElementType::F32);
        let c = PortDescriptor::new(vec![m, n], ElementType::F32);
        let pa = ir.push(Expression::new(OpKind::Parameter { index: 0 }, vec![], vec![a.clone()]));
        let pb = ir.push(Expression::new(OpKind::Parameter { index: 1 }, vec![], vec![b.clone()]));
        let brgemm = ir.push(Expression::new(
            OpKind::Brgemm(BrgemmData {
                a: MemoryAccess::default(),
                b: MemoryAccess::default(),
                c: MemoryAccess::default(),
                beta: 0.0,
            }),
            vec![
                Input { source: OutputRef::new(pa, 0), desc: a },
                Input { source: OutputRef::new(pb, 0), desc: b },
            ],
            vec![c.clone()],
        ));
        ir.push(Expression::new(
            OpKind::Result { index: 0 },
            vec![Input { source: OutputRef::new(brgemm, 0), desc: c }],
            vec![],
        ));
        brgemm
    }

    #[test]
    fn test_block_m_only() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut ir = LinearIR::new(Config::default().with_brgemm_blocking(32, 64, 512));
        let brgemm = create_test_brgemm(&mut ir, 100, 64, 16);

        assert!(BrgemmBlocking.run(&mut ir, &session).unwrap());
        let expr = ir.expr(brgemm).unwrap();
        assert_eq!(expr.loop_ids.len(), 1);
        let info = ir.loop_manager().get_loop_info(expr.loop_ids[0]).unwrap();
        assert_eq!((info.work_amount, info.increment), (100, 32));
        assert_eq!(info.dim_idx, Some(1));
        assert_eq!(info.handlers(SpecificIteration::LastIter), &[IterationHandler::UpdateSubtensors(4)]);
        assert!(!info.entry_points[1].is_incremented);
        assert_eq!(expr.inputs[0].desc.subtensor_dim(1), 32);
        assert_eq!(expr.kind, OpKind::Brgemm(BrgemmData {
            a: MemoryAccess::default(),
            b: MemoryAccess::default(),
            c: MemoryAccess::default(),
            beta: 0.0,
        }));
    }

    #[test]
    fn test_m_tail_part_scales_pointer_steps() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut ir = LinearIR::new(Config::default().with_brgemm_blocking(32, 64, 512));
        create_test_brgemm(&mut ir, 100, 64, 16);

        BrgemmBlocking.run(&mut ir, &session).unwrap();
        InsertLoops.run(&mut ir, &session).unwrap();
        assert!(InsertSpecificIterations.run(&mut ir, &session).unwrap());

        let ends: Vec<LoopEndData> = ir
            .iter()
            .filter_map(|(_, e)| match &e.kind {
                OpKind::LoopEnd(data) => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ends.len(), 2);
        let (main, tail) = (&ends[0], &ends[1]);
        assert_eq!((main.work_amount, main.increment), (96, 32));
        assert_eq!((tail.work_amount, tail.increment), (4, 4));
        let iterations = main.work_amount / main.increment + tail.work_amount / tail.increment;
        assert_eq!(iterations, 4);

        // A advances by rows of K, B stays, C advances by rows of N.
        assert_eq!(main.ptr_increments, vec![16, 0, 64]);
        assert_eq!(tail.ptr_increments, vec![16, 0, 64]);
        let steps = |data: &LoopEndData| -> Vec<i64> {
            data.ptr_increments.iter().map(|p| p * data.increment as i64).collect()
        };
        assert_eq!(steps(main), vec![32 * 16, 0, 32 * 64]);
        assert_eq!(steps(tail), vec![4 * 16, 0, 4 * 64]);

        // The vector part leaves the pointers to the tail, which rewinds all 100 rows.
        assert!(main.followed_by_split);
        assert_eq!(main.finalization_offsets, vec![0, 0, 0]);
        assert_eq!(tail.finalization_offsets, vec![-100 * 16, 0, -100 * 64]);
    }

    #[test]
    fn test_block_all_dims_nests_k_innermost() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut ir = LinearIR::new(Config::default().with_brgemm_blocking(16, 16, 16));
        let brgemm = create_test_brgemm(&mut ir, 40, 48, 40);

        BrgemmBlocking.run(&mut ir, &session).unwrap();
        let expr = ir.expr(brgemm).unwrap();
        assert_eq!(expr.loop_ids.len(), 3);
        let manager = ir.loop_manager();
        let m = manager.get_loop_info(expr.loop_ids[0]).unwrap();
        let n = manager.get_loop_info(expr.loop_ids[1]).unwrap();
        let k = manager.get_loop_info(expr.loop_ids[2]).unwrap();
        assert_eq!(m.work_amount, 40);
        assert_eq!(n.work_amount, 48);
        assert!(n.handlers(SpecificIteration::LastIter).is_empty());
        assert_eq!(k.handlers(SpecificIteration::FirstIter), &[IterationHandler::SetBrgemmBeta(0.0)]);
        assert!(matches!(&expr.kind, OpKind::Brgemm(data) if data.beta == 1.0));
    }

    #[test]
    fn test_small_brgemm_is_not_blocked() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut ir = LinearIR::new(Config::default());
        let brgemm = create_test_brgemm(&mut ir, 8, 8, 8);

        BrgemmBlocking.run(&mut ir, &session).unwrap();
        assert!(ir.expr(brgemm).unwrap().loop_ids.is_empty());
        assert!(ir.loop_manager().is_empty());
    }
}
