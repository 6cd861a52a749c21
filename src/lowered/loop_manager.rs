// This module provides the loop registry of the Linear IR. Every loop is described by a LoopInfo:
// its work amount and increment along one planar dimension, the entry and exit ports through which
// data pointers enter and leave the loop, and three handler pipelines applied to specific
// iterations when the loop is split into first-iteration, main-body and tail parts. LoopManager owns
// the LoopInfo table; the structural operations that need both the registry and the expression
// order (marking a range, locating loop bounds, re-homing a cloned range under a new loop id) are
// implemented on LinearIR in this module.

//! Loop registry and loop-structural Linear IR operations.

use crate::core::error::{CompileError, CompileResult};
use crate::lowered::expression::{ExprId, ExprPort, PortKind};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::pass::iter_handler::IterationHandler;
use crate::lowered::types::OpKind;
use std::collections::BTreeMap;

/// A data port through which a loop walks memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopPort {
    pub port: ExprPort,
    /// Whether the data pointer advances with the loop.
    pub is_incremented: bool,
    /// Planar dimension walked by this port, counted from the innermost.
    pub dim_idx: usize,
    pub ptr_increment: i64,
    pub finalization_offset: i64,
    pub data_size: usize,
}

impl LoopPort {
    pub fn new(port: ExprPort, dim_idx: usize) -> Self {
        Self { port, is_incremented: true, dim_idx, ptr_increment: 0, finalization_offset: 0, data_size: 0 }
    }

    pub fn not_incremented(port: ExprPort, dim_idx: usize) -> Self {
        Self { is_incremented: false, ..Self::new(port, dim_idx) }
    }

    pub fn with_expr(&self, expr: ExprId) -> Self {
        Self { port: self.port.with_expr(expr), ..self.clone() }
    }
}

/// Iterations that can get a dedicated handler pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecificIteration {
    FirstIter = 0,
    MainBody = 1,
    LastIter = 2,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopInfo {
    pub work_amount: usize,
    pub increment: usize,
    /// Planar dimension this loop iterates over, when all ports agree.
    pub dim_idx: Option<usize>,
    pub entry_points: Vec<LoopPort>,
    pub exit_points: Vec<LoopPort>,
    pub handlers: [Vec<IterationHandler>; 3],
    pub has_outer_loop: bool,
}

impl LoopInfo {
    pub fn new(work_amount: usize, increment: usize, entry_points: Vec<LoopPort>, exit_points: Vec<LoopPort>) -> Self {
        let mut dims = entry_points.iter().chain(exit_points.iter()).filter(|p| p.is_incremented).map(|p| p.dim_idx);
        let first = dims.next();
        let dim_idx = match first {
            Some(d) if dims.all(|other| other == d) => Some(d),
            _ => None,
        };
        Self {
            work_amount,
            increment,
            dim_idx,
            entry_points,
            exit_points,
            handlers: Default::default(),
            has_outer_loop: false,
        }
    }

    pub fn handlers(&self, iter: SpecificIteration) -> &[IterationHandler] {
        &self.handlers[iter as usize]
    }

    pub fn register_handler(&mut self, iter: SpecificIteration, handler: IterationHandler) {
        self.handlers[iter as usize].push(handler);
    }

    pub fn ports(&self) -> impl Iterator<Item = &LoopPort> + '_ {
        self.entry_points.iter().chain(self.exit_points.iter())
    }
}

/// Registry of every loop of one Linear IR.
#[derive(Debug, Clone, Default)]
pub struct LoopManager {
    loops: BTreeMap<usize, LoopInfo>,
    next_id: usize,
}

impl LoopManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_loop(&mut self, info: LoopInfo) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.loops.insert(id, info);
        id
    }

    pub fn get_loop_info(&self, loop_id: usize) -> CompileResult<&LoopInfo> {
        self.loops
            .get(&loop_id)
            .ok_or_else(|| CompileError::structural(format!("loop {loop_id} is not registered")))
    }

    pub fn get_loop_info_mut(&mut self, loop_id: usize) -> CompileResult<&mut LoopInfo> {
        self.loops
            .get_mut(&loop_id)
            .ok_or_else(|| CompileError::structural(format!("loop {loop_id} is not registered")))
    }

    pub fn remove_loop(&mut self, loop_id: usize) -> CompileResult<LoopInfo> {
        self.loops
            .remove(&loop_id)
            .ok_or_else(|| CompileError::structural(format!("loop {loop_id} is not registered")))
    }

    pub fn loop_ids(&self) -> Vec<usize> {
        self.loops.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Replace `old` in the ports of every loop in `loop_ids` by one copy per `new` port.
    pub fn update_loops_port(&mut self, loop_ids: &[usize], old: ExprPort, new: &[ExprPort]) -> CompileResult<()> {
        for &loop_id in loop_ids {
            let info = self.get_loop_info_mut(loop_id)?;
            let points = match old.kind {
                PortKind::Input => &mut info.entry_points,
                PortKind::Output => &mut info.exit_points,
            };
            let Some(pos) = points.iter().position(|p| p.port == old) else {
                continue;
            };
            let template = points.remove(pos);
            for (offset, port) in new.iter().enumerate() {
                points.insert(pos + offset, LoopPort { port: *port, ..template.clone() });
            }
        }
        Ok(())
    }
}

impl LinearIR {
    /// Register a loop over program positions `[begin, end)`.
    ///
    /// The new loop becomes the outermost loop of every expression in the
    /// range, so nested loops are marked innermost first.
    pub fn mark_loop(&mut self, begin: usize, end: usize, info: LoopInfo) -> CompileResult<usize> {
        if begin >= end || end > self.order.len() {
            return Err(CompileError::structural(format!("invalid loop range [{begin}, {end})")));
        }
        let loop_id = self.loop_manager.add_loop(info);
        for pos in begin..end {
            let id = self.order[pos];
            self.expr_mut(id)?.loop_ids.insert(0, loop_id);
        }
        log::trace!("marked loop {loop_id} over positions [{begin}, {end})");
        Ok(loop_id)
    }

    /// Bounds of loop `loop_id`.
    ///
    /// With markers the result is the positions of its LoopBegin and LoopEnd.
    /// Without markers it is the half-open range of expressions marked with it.
    pub fn get_loop_bounds(&self, loop_id: usize, with_markers: bool) -> CompileResult<(usize, usize)> {
        if with_markers {
            let mut begin = None;
            let mut end = None;
            for (pos, (_, expr)) in self.iter().enumerate() {
                match &expr.kind {
                    OpKind::LoopBegin { loop_id: id } if *id == loop_id => begin = Some(pos),
                    OpKind::LoopEnd(data) if data.loop_id == loop_id => end = Some(pos),
                    _ => {}
                }
            }
            return match (begin, end) {
                (Some(b), Some(e)) if b < e => Ok((b, e)),
                (None, None) => Err(CompileError::structural(format!("loop {loop_id} has no markers"))),
                _ => Err(CompileError::structural(format!(
                    "loop {loop_id} has a LoopBegin without a matching LoopEnd"
                ))),
            };
        }
        let positions: Vec<usize> = self
            .iter()
            .enumerate()
            .filter(|(_, (_, e))| e.loop_ids.contains(&loop_id))
            .map(|(pos, _)| pos)
            .collect();
        match (positions.first(), positions.last()) {
            (Some(&first), Some(&last)) if last - first + 1 == positions.len() => Ok((first, last + 1)),
            (Some(_), Some(_)) => Err(CompileError::structural(format!("loop {loop_id} is not contiguous"))),
            _ => Err(CompileError::structural(format!("loop {loop_id} marks no expressions"))),
        }
    }

    /// Loops of `expr` enclosing `loop_id`, outermost first.
    pub fn get_outer_expr_loops(&self, expr: ExprId, loop_id: usize) -> CompileResult<Vec<usize>> {
        let loop_ids = &self.expr(expr)?.loop_ids;
        let pos = loop_ids.iter().position(|&id| id == loop_id).ok_or_else(|| {
            CompileError::structural(format!("expression {} is not inside loop {loop_id}", expr.0))
        })?;
        Ok(loop_ids[..pos].to_vec())
    }

    /// Move the expressions at positions `[begin, end]` from `old_loop_id` to a new loop.
    ///
    /// The new loop copies the handlers and nesting flags of the old one.
    /// Loop markers of the old loop inside the range are renamed.
    pub fn replace_with_new_loop(
        &mut self,
        begin: usize,
        end: usize,
        work_amount: usize,
        increment: usize,
        entry_points: Vec<LoopPort>,
        exit_points: Vec<LoopPort>,
        old_loop_id: usize,
    ) -> CompileResult<usize> {
        let old = self.loop_manager.get_loop_info(old_loop_id)?;
        let mut info = LoopInfo::new(work_amount, increment, entry_points, exit_points);
        info.dim_idx = old.dim_idx;
        info.handlers = old.handlers.clone();
        info.has_outer_loop = old.has_outer_loop;
        let new_id = self.loop_manager.add_loop(info);
        if end >= self.order.len() {
            return Err(CompileError::structural(format!("loop range end {end} is out of range")));
        }
        for pos in begin..=end {
            let id = self.order[pos];
            let expr = self.expr_mut(id)?;
            for loop_id in expr.loop_ids.iter_mut() {
                if *loop_id == old_loop_id {
                    *loop_id = new_id;
                }
            }
            match &mut expr.kind {
                OpKind::LoopBegin { loop_id } if *loop_id == old_loop_id => *loop_id = new_id,
                OpKind::LoopEnd(data) if data.loop_id == old_loop_id => data.loop_id = new_id,
                _ => {}
            }
        }
        Ok(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::lowered::expression::{Expression, Input, OutputRef};
    use crate::lowered::types::{ElementType, EltwiseKind, MemoryAccess, PortDescriptor};

    fn create_test_ir() -> (LinearIR, Vec<ExprId>) {
        let mut ir = LinearIR::new(Config::default());
        let desc = PortDescriptor::new(vec![4, 16], ElementType::F32);
        let param = ir.push(Expression::new(OpKind::Parameter { index: 0 }, vec![], vec![desc.clone()]));
        let load = ir.push(Expression::new(
            OpKind::Load(MemoryAccess::new(8)),
            vec![Input { source: OutputRef::new(param, 0), desc: desc.clone() }],
            vec![desc.clone()],
        ));
        let relu = ir.push(Expression::new(
            OpKind::Eltwise(EltwiseKind::Relu),
            vec![Input { source: OutputRef::new(load, 0), desc: desc.clone() }],
            vec![desc.clone()],
        ));
        let store = ir.push(Expression::new(
            OpKind::Store(MemoryAccess::new(8)),
            vec![Input { source: OutputRef::new(relu, 0), desc: desc.clone() }],
            vec![desc.clone()],
        ));
        (ir, vec![param, load, relu, store])
    }

    #[test]
    fn test_mark_nested_loops() {
        let (mut ir, ids) = create_test_ir();
        let entries = vec![LoopPort::new(ExprPort::input(ids[1], 0), 0)];
        let exits = vec![LoopPort::new(ExprPort::output(ids[3], 0), 0)];
        let inner = ir.mark_loop(1, 4, LoopInfo::new(16, 8, entries.clone(), exits.clone())).unwrap();
        let outer = ir
            .mark_loop(
                1,
                4,
                LoopInfo::new(
                    4,
                    1,
                    vec![LoopPort::new(ExprPort::input(ids[1], 0), 1)],
                    vec![LoopPort::new(ExprPort::output(ids[3], 0), 1)],
                ),
            )
            .unwrap();

        assert_eq!(ir.expr(ids[2]).unwrap().loop_ids, vec![outer, inner]);
        assert_eq!(ir.get_loop_bounds(inner, false).unwrap(), (1, 4));
        assert_eq!(ir.get_outer_expr_loops(ids[2], inner).unwrap(), vec![outer]);
        assert_eq!(ir.loop_manager().get_loop_info(inner).unwrap().dim_idx, Some(0));
        assert!(ir.get_loop_bounds(inner, true).is_err());
    }

    #[test]
    fn test_update_loops_port_fans_out() {
        let (mut ir, ids) = create_test_ir();
        let entries = vec![LoopPort::new(ExprPort::input(ids[1], 0), 0)];
        let loop_id = ir.mark_loop(1, 4, LoopInfo::new(16, 8, entries, vec![])).unwrap();

        let copy = ExprId(100);
        ir.loop_manager_mut()
            .update_loops_port(&[loop_id], ExprPort::input(ids[1], 0), &[ExprPort::input(ids[1], 0), ExprPort::input(copy, 0)])
            .unwrap();
        let info = ir.loop_manager().get_loop_info(loop_id).unwrap();
        assert_eq!(info.entry_points.len(), 2);
        assert_eq!(info.entry_points[1].port.expr, copy);
        assert!(info.entry_points[1].is_incremented);
    }

    #[test]
    fn test_mixed_dims_have_no_loop_dim() {
        let info = LoopInfo::new(
            4,
            1,
            vec![LoopPort::new(ExprPort::input(ExprId(0), 0), 1)],
            vec![LoopPort::new(ExprPort::output(ExprId(1), 0), 0)],
        );
        assert_eq!(info.dim_idx, None);
    }
}
