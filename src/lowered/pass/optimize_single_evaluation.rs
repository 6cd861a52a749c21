//! Single-evaluation loop optimization.
//!
//! A loop whose work amount is below twice its increment runs its body at
//! most once, so its LoopEnd drops the counter and the back branch. The
//! pointer increments of that single iteration are then folded into the
//! finalization offsets whenever something still uses the pointers after the
//! loop: an enclosing loop, another part of the same split loop, or any later
//! loop sharing a buffer pointer. The collapsed loop no longer needs its
//! LoopInfo, which is dropped from the Loop Manager.

use crate::core::error::CompileResult;
use crate::core::session::CompilationSession;
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::pass::{Pass, PassId};
use crate::lowered::types::OpKind;

pub struct OptimizeLoopSingleEvaluation;

impl Pass for OptimizeLoopSingleEvaluation {
    fn id(&self) -> PassId {
        PassId::OptimizeLoopSingleEvaluation
    }

    fn run(&mut self, ir: &mut LinearIR, session: &CompilationSession<'_>) -> CompileResult<bool> {
        if !ir.config().enable_single_evaluation {
            return Ok(false);
        }
        // Buffer pointers are shared between loops and stay live after each of them.
        let shared_pointers = !ir.buffers().is_empty();

        let mut collapsed = Vec::new();
        for id in ir.order().to_vec() {
            let OpKind::LoopEnd(data) = &mut ir.expr_mut(id)?.kind else {
                continue;
            };
            if data.evaluate_once || data.work_amount >= 2 * data.increment {
                continue;
            }
            data.evaluate_once = true;
            if shared_pointers || data.followed_by_split || data.has_outer_loop {
                let increment = data.increment as i64;
                for (offset, ptr) in data.finalization_offsets.iter_mut().zip(data.ptr_increments.iter()) {
                    *offset += ptr * increment;
                }
            }
            log::debug!(
                "loop {} evaluates once (work {}, increment {})",
                data.loop_id,
                data.work_amount,
                data.increment
            );
            session.record_single_evaluation();
            collapsed.push(data.loop_id);
        }
        for &loop_id in &collapsed {
            ir.loop_manager_mut().remove_loop(loop_id)?;
        }
        Ok(!collapsed.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::test_utils::test::TestContext;
    use crate::lowered::expression::{Expression, Input, OutputRef};
    use crate::lowered::pass::{InsertLoops, InsertSpecificIterations, MarkLoops};
    use crate::lowered::types::{ElementType, EltwiseKind, LoopEndData, MemoryAccess, PortDescriptor};

    fn create_test_negative(ir: &mut LinearIR, shape: Vec<usize>) {
        let desc = PortDescriptor::new(shape, ElementType::F32);
        let param = ir.push(Expression::new(OpKind::Parameter { index: 0 }, vec![], vec![desc.clone()]));
        let load = ir.push(Expression::new(
            OpKind::Load(MemoryAccess::new(8)),
            vec![Input { source: OutputRef::new(param, 0), desc: desc.clone() }],
            vec![desc.clone()],
        ));
        let neg = ir.push(Expression::new(
            OpKind::Eltwise(EltwiseKind::Negative),
            vec![Input { source: OutputRef::new(load, 0), desc: desc.clone() }],
            vec![desc.clone()],
        ));
        let store = ir.push(Expression::new(
            OpKind::Store(MemoryAccess::new(8)),
            vec![Input { source: OutputRef::new(neg, 0), desc: desc.clone() }],
            vec![desc.clone()],
        ));
        ir.push(Expression::new(
            OpKind::Result { index: 0 },
            vec![Input { source: OutputRef::new(store, 0), desc }],
            vec![],
        ));
    }

    fn lower(ir: &mut LinearIR, session: &CompilationSession<'_>) {
        MarkLoops::new(8).run(ir, session).unwrap();
        InsertLoops.run(ir, session).unwrap();
        InsertSpecificIterations.run(ir, session).unwrap();
    }

    fn loop_ends(ir: &LinearIR) -> Vec<LoopEndData> {
        ir.iter()
            .filter_map(|(_, e)| match &e.kind {
                OpKind::LoopEnd(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_split_parts_fold_increments() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut ir = LinearIR::new(Config::default().with_tile_rank(1));
        create_test_negative(&mut ir, vec![1, 12]);
        lower(&mut ir, &session);

        assert!(OptimizeLoopSingleEvaluation.run(&mut ir, &session).unwrap());
        let ends = loop_ends(&ir);
        // Vector part: one iteration of 8, followed by the tail.
        assert!(ends[0].evaluate_once);
        assert_eq!(ends[0].finalization_offsets, vec![8, 8]);
        // Tail part: nothing follows, the pointers are dead.
        assert!(ends[1].evaluate_once);
        assert_eq!(ends[1].finalization_offsets, vec![-12, -12]);
        assert_eq!(session.stats().loops_evaluated_once, 2);
        assert!(ir.loop_manager().is_empty());
    }

    #[test]
    fn test_inner_loop_under_outer_loop() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut ir = LinearIR::new(Config::default());
        create_test_negative(&mut ir, vec![4, 8]);
        lower(&mut ir, &session);

        OptimizeLoopSingleEvaluation.run(&mut ir, &session).unwrap();
        let ends = loop_ends(&ir);
        assert!(ends[0].evaluate_once);
        assert_eq!(ends[0].finalization_offsets, vec![0, 0]);
        assert!(!ends[1].evaluate_once);
        // Only the outer loop still iterates.
        assert_eq!(ir.loop_manager().loop_ids(), vec![ends[1].loop_id]);
        ir.validate().unwrap();
    }

    #[test]
    fn test_disabled_by_config() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut ir = LinearIR::new(Config::default().with_single_evaluation(false));
        create_test_negative(&mut ir, vec![1, 8]);
        lower(&mut ir, &session);

        assert!(!OptimizeLoopSingleEvaluation.run(&mut ir, &session).unwrap());
        assert!(loop_ends(&ir).iter().all(|d| !d.evaluate_once));
    }
}
