// This module assigns abstract registers to every value of the Linear IR. Data pointers are fixed
// first: parameter i gets gpr i, result j gets gpr P+j and every buffer id b gets gpr P+R+b, where P
// and R are the parameter and result counts. These pointers stay live for the whole kernel. Every
// other value gets a live interval from its producer to its last consumer; a value used inside a
// loop it is not defined in stays live until that loop's LoopEnd, since the body reads it on every
// iteration. Intervals are coloured greedily per register class, releasing a register only after
// the expression holding its last use, so an expression never writes a register it still reads.
// Exceeding the configured budget is a resource exhaustion error. Each expression also records the
// abstract registers live across it, which the emitter of an external call has to preserve.

//! Abstract register assignment.

use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::{Reg, RegClass};
use crate::core::session::CompilationSession;
use crate::lowered::expression::{ExprId, OutputRef};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::pass::{Pass, PassId};
use crate::lowered::types::OpKind;
use hashbrown::HashMap;
use std::collections::BTreeSet;

pub struct AssignRegisters;

#[derive(Debug, Clone, Copy)]
struct Interval {
    value: OutputRef,
    class: RegClass,
    start: usize,
    end: usize,
}

/// Fixed data pointer registers: parameters, then results, then buffer ids.
fn fixed_registers(ir: &LinearIR) -> CompileResult<(HashMap<OutputRef, Reg>, usize)> {
    let params = ir.parameters();
    let results = ir.results();
    let mut fixed = HashMap::new();
    for (i, &param) in params.iter().enumerate() {
        fixed.insert(OutputRef::new(param, 0), Reg::gpr(i));
    }
    for (j, &result) in results.iter().enumerate() {
        let source = ir
            .expr(result)?
            .inputs
            .first()
            .map(|input| input.source)
            .ok_or_else(|| CompileError::structural(format!("result {} has no input", result.0)))?;
        fixed.insert(source, Reg::gpr(params.len() + j));
    }
    let mut buffer_ids = BTreeSet::new();
    for buffer in ir.buffers() {
        let expr = ir.expr(buffer)?;
        let OpKind::Buffer(data) = &expr.kind else { continue };
        buffer_ids.insert(data.id);
        let reg = Reg::gpr(params.len() + results.len() + data.id);
        fixed.insert(OutputRef::new(buffer, 0), reg);
        if let Some(input) = expr.inputs.first() {
            fixed.insert(input.source, reg);
        }
    }
    let max_buffer = buffer_ids.iter().next_back().map(|id| id + 1).unwrap_or(0);
    Ok((fixed, params.len() + results.len() + max_buffer))
}

fn live_intervals(ir: &LinearIR, fixed: &HashMap<OutputRef, Reg>) -> CompileResult<Vec<Interval>> {
    let positions: HashMap<ExprId, usize> = ir.order().iter().enumerate().map(|(pos, &id)| (id, pos)).collect();
    let loop_ends: HashMap<usize, usize> = ir
        .iter()
        .enumerate()
        .filter_map(|(pos, (_, e))| match &e.kind {
            OpKind::LoopEnd(data) => Some((data.loop_id, pos)),
            _ => None,
        })
        .collect();

    let mut intervals = Vec::new();
    for (start, (id, expr)) in ir.iter().enumerate() {
        let class = expr.kind.reg_type().output_class();
        for index in 0..expr.outputs.len() {
            let value = OutputRef::new(id, index);
            if fixed.contains_key(&value) {
                continue;
            }
            let mut end = start;
            for (consumer, _) in ir.consumers(value) {
                let consumer_expr = ir.expr(consumer)?;
                let mut use_pos = positions.get(&consumer).copied().unwrap_or(start);
                for loop_id in &consumer_expr.loop_ids {
                    if expr.loop_ids.contains(loop_id) {
                        continue;
                    }
                    let loop_end = loop_ends.get(loop_id).copied().ok_or_else(|| {
                        CompileError::structural(format!("loop {loop_id} has no LoopEnd"))
                    })?;
                    use_pos = use_pos.max(loop_end);
                }
                end = end.max(use_pos);
            }
            intervals.push(Interval { value, class, start, end });
        }
    }
    Ok(intervals)
}

/// Greedy interval colouring starting at `base`. Returns the mapping and the number of colours used.
fn colour(intervals: &[Interval], class: RegClass, base: usize) -> (HashMap<OutputRef, Reg>, usize) {
    let mut sorted: Vec<&Interval> = intervals.iter().filter(|i| i.class == class).collect();
    sorted.sort_by_key(|i| (i.start, i.end));

    let mut mapping = HashMap::new();
    let mut active: Vec<(usize, usize)> = Vec::new();
    let mut free: BTreeSet<usize> = BTreeSet::new();
    let mut next = base;
    for interval in sorted {
        active.retain(|&(end, reg)| {
            if end < interval.start {
                free.insert(reg);
                false
            } else {
                true
            }
        });
        let reg = match free.iter().next().copied() {
            Some(reg) => {
                free.remove(&reg);
                reg
            }
            None => {
                next += 1;
                next - 1
            }
        };
        active.push((interval.end, reg));
        mapping.insert(interval.value, Reg { class, index: reg });
    }
    (mapping, next)
}

impl Pass for AssignRegisters {
    fn id(&self) -> PassId {
        PassId::AssignRegisters
    }

    fn run(&mut self, ir: &mut LinearIR, _session: &CompilationSession<'_>) -> CompileResult<bool> {
        let (fixed, data_ptrs) = fixed_registers(ir)?;
        let intervals = live_intervals(ir, &fixed)?;
        let (gpr_map, gpr_count) = colour(&intervals, RegClass::Gpr, data_ptrs);
        let (vec_map, vec_count) = colour(&intervals, RegClass::Vec, 0);

        let config = ir.config();
        if gpr_count > config.gpr_reg_count {
            return Err(CompileError::ResourceExhaustion {
                resource: "general purpose registers",
                requested: gpr_count,
                available: config.gpr_reg_count,
            });
        }
        if vec_count > config.vec_reg_count {
            return Err(CompileError::ResourceExhaustion {
                resource: "vector registers",
                requested: vec_count,
                available: config.vec_reg_count,
            });
        }
        log::debug!("assigned {gpr_count} gpr ({data_ptrs} data pointers) and {vec_count} vec registers");

        let mut regs = fixed.clone();
        regs.extend(gpr_map);
        regs.extend(vec_map);
        let lookup = |value: &OutputRef| {
            regs.get(value)
                .copied()
                .ok_or_else(|| CompileError::structural(format!("value {}:{} has no register", value.expr.0, value.index)))
        };

        let fixed_regs: BTreeSet<Reg> = fixed.values().copied().collect();
        let order: Vec<ExprId> = ir.order().to_vec();
        for (pos, &id) in order.iter().enumerate() {
            let expr = ir.expr(id)?;
            let inputs = expr.inputs.iter().map(|input| lookup(&input.source)).collect::<CompileResult<Vec<_>>>()?;
            let mut outputs = Vec::with_capacity(expr.outputs.len());
            for index in 0..expr.outputs.len() {
                outputs.push(lookup(&OutputRef::new(id, index))?);
            }
            // A Result only names the pointer its producer writes through.
            if let OpKind::Result { .. } = expr.kind {
                outputs.clear();
            }

            let mut live: BTreeSet<Reg> = fixed_regs.clone();
            for interval in &intervals {
                if interval.start < pos && interval.end > pos {
                    live.insert(lookup(&interval.value)?);
                }
            }

            let expr = ir.expr_mut(id)?;
            expr.reg_info.inputs = inputs;
            expr.reg_info.outputs = outputs;
            expr.live_regs = live.into_iter().collect();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::test_utils::test::TestContext;
    use crate::lowered::expression::{Expression, Input};
    use crate::lowered::pass::{InsertLoops, MarkLoops};
    use crate::lowered::types::{ElementType, EltwiseKind, MemoryAccess, PortDescriptor};

    fn create_test_add(ir: &mut LinearIR, shape: Vec<usize>) -> Vec<ExprId> {
        let desc = PortDescriptor::new(shape, ElementType::F32);
        let p0 = ir.push(Expression::new(OpKind::Parameter { index: 0 }, vec![], vec![desc.clone()]));
        let p1 = ir.push(Expression::new(OpKind::Parameter { index: 1 }, vec![], vec![desc.clone()]));
        let l0 = ir.push(Expression::new(
            OpKind::Load(MemoryAccess::new(8)),
            vec![Input { source: OutputRef::new(p0, 0), desc: desc.clone() }],
            vec![desc.clone()],
        ));
        let l1 = ir.push(Expression::new(
            OpKind::Load(MemoryAccess::new(8)),
            vec![Input { source: OutputRef::new(p1, 0), desc: desc.clone() }],
            vec![desc.clone()],
        ));
        let add = ir.push(Expression::new(
            OpKind::Eltwise(EltwiseKind::Add),
            vec![
                Input { source: OutputRef::new(l0, 0), desc: desc.clone() },
                Input { source: OutputRef::new(l1, 0), desc: desc.clone() },
            ],
            vec![desc.clone()],
        ));
        let store = ir.push(Expression::new(
            OpKind::Store(MemoryAccess::new(8)),
            vec![Input { source: OutputRef::new(add, 0), desc: desc.clone() }],
            vec![desc.clone()],
        ));
        let result = ir.push(Expression::new(
            OpKind::Result { index: 0 },
            vec![Input { source: OutputRef::new(store, 0), desc }],
            vec![],
        ));
        vec![p0, p1, l0, l1, add, store, result]
    }

    #[test]
    fn test_data_pointers_and_reuse() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut ir = LinearIR::new(Config::default());
        let ids = create_test_add(&mut ir, vec![2, 16]);
        MarkLoops::new(8).run(&mut ir, &session).unwrap();
        InsertLoops.run(&mut ir, &session).unwrap();
        AssignRegisters.run(&mut ir, &session).unwrap();

        let reg_info = |id: ExprId| ir.expr(id).unwrap().reg_info.clone();
        assert_eq!(reg_info(ids[0]).outputs, vec![Reg::gpr(0)]);
        assert_eq!(reg_info(ids[1]).outputs, vec![Reg::gpr(1)]);
        assert_eq!(reg_info(ids[5]).outputs, vec![Reg::gpr(2)]);
        assert_eq!(reg_info(ids[6]).inputs, vec![Reg::gpr(2)]);

        // Both loads are live at the add, whose output reuses neither.
        let add = reg_info(ids[4]);
        assert_ne!(add.inputs[0], add.inputs[1]);
        assert!(!add.inputs.contains(&add.outputs[0]));
        // The store's input register is free again once the store ran.
        assert_eq!(reg_info(ids[2]).outputs[0].class, RegClass::Vec);

        // Loop counters come after the data pointers.
        let counters: Vec<Reg> = ir
            .iter()
            .filter(|(_, e)| matches!(e.kind, OpKind::LoopBegin { .. }))
            .map(|(_, e)| e.reg_info.outputs[0])
            .collect();
        assert_eq!(counters.len(), 2);
        assert!(counters.iter().all(|r| r.index >= 3));
        assert_ne!(counters[0], counters[1]);
    }

    #[test]
    fn test_register_budget_exhaustion() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut ir = LinearIR::new(Config::default().with_reg_counts(16, 2));
        create_test_add(&mut ir, vec![1, 16]);

        let err = AssignRegisters.run(&mut ir, &session).unwrap_err();
        assert_eq!(
            err,
            CompileError::ResourceExhaustion { resource: "vector registers", requested: 3, available: 2 }
        );
    }
}
