// This module provides the Linear IR container: an arena of expressions addressed by stable
// ExprId handles plus a separate program order. Inputs reference producers by (expr, output index),
// so LoopBegin/LoopEnd pairs and their bodies hold no owning pointers to each other. Erasing an
// expression leaves a hole in the arena and ids are never reused, which keeps loop ports and
// expression maps built by earlier passes meaningful. The container also owns the loop manager and
// the configuration shared by every pass.

//! Linear IR container and structural mutation primitives.

use crate::core::config::Config;
use crate::core::error::{CompileError, CompileResult};
use crate::lowered::expression::{ExprId, Expression, OutputRef};
use crate::lowered::loop_manager::LoopManager;
use crate::lowered::types::OpKind;
use hashbrown::HashMap;

/// Ordered, loop-annotated expression sequence of one snippet.
#[derive(Debug, Clone)]
pub struct LinearIR {
    pub(super) exprs: Vec<Option<Expression>>,
    pub(super) order: Vec<ExprId>,
    pub(super) loop_manager: LoopManager,
    config: Config,
    /// Bytes of scratchpad needed by one kernel invocation.
    scratchpad_size: usize,
}

impl LinearIR {
    pub fn new(config: Config) -> Self {
        Self { exprs: Vec::new(), order: Vec::new(), loop_manager: LoopManager::new(), config, scratchpad_size: 0 }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scratchpad_size(&self) -> usize {
        self.scratchpad_size
    }

    pub fn set_scratchpad_size(&mut self, size: usize) {
        self.scratchpad_size = size;
    }

    pub fn loop_manager(&self) -> &LoopManager {
        &self.loop_manager
    }

    pub fn loop_manager_mut(&mut self) -> &mut LoopManager {
        &mut self.loop_manager
    }

    /// Program order.
    pub fn order(&self) -> &[ExprId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: ExprId) -> Option<&Expression> {
        self.exprs.get(id.0).and_then(|e| e.as_ref())
    }

    pub fn expr(&self, id: ExprId) -> CompileResult<&Expression> {
        self.get(id)
            .ok_or_else(|| CompileError::structural(format!("expression {} does not exist", id.0)))
    }

    pub fn expr_mut(&mut self, id: ExprId) -> CompileResult<&mut Expression> {
        self.exprs
            .get_mut(id.0)
            .and_then(|e| e.as_mut())
            .ok_or_else(|| CompileError::structural(format!("expression {} does not exist", id.0)))
    }

    /// Expression at program position `pos`.
    pub fn at(&self, pos: usize) -> CompileResult<&Expression> {
        let id = self.id_at(pos)?;
        self.expr(id)
    }

    pub fn id_at(&self, pos: usize) -> CompileResult<ExprId> {
        self.order
            .get(pos)
            .copied()
            .ok_or_else(|| CompileError::structural(format!("position {pos} is out of range")))
    }

    /// Expressions in program order.
    pub fn iter(&self) -> impl Iterator<Item = (ExprId, &Expression)> + '_ {
        self.order.iter().filter_map(move |&id| self.get(id).map(|e| (id, e)))
    }

    fn alloc(&mut self, expr: Expression) -> ExprId {
        let id = ExprId(self.exprs.len());
        self.exprs.push(Some(expr));
        id
    }

    /// Append an expression at the end of the program.
    pub fn push(&mut self, expr: Expression) -> ExprId {
        let id = self.alloc(expr);
        self.order.push(id);
        id
    }

    /// Insert an expression at program position `pos`.
    pub fn insert(&mut self, pos: usize, expr: Expression) -> CompileResult<ExprId> {
        if pos > self.order.len() {
            return Err(CompileError::structural(format!("insert position {pos} is out of range")));
        }
        let id = self.alloc(expr);
        self.order.insert(pos, id);
        Ok(id)
    }

    pub fn insert_before(&mut self, anchor: ExprId, expr: Expression) -> CompileResult<ExprId> {
        let pos = self.position(anchor)?;
        self.insert(pos, expr)
    }

    pub fn insert_after(&mut self, anchor: ExprId, expr: Expression) -> CompileResult<ExprId> {
        let pos = self.position(anchor)?;
        self.insert(pos + 1, expr)
    }

    /// Place already allocated (detached) expressions at `pos`.
    pub fn insert_ids(&mut self, pos: usize, ids: &[ExprId]) -> CompileResult<()> {
        if pos > self.order.len() {
            return Err(CompileError::structural(format!("insert position {pos} is out of range")));
        }
        for id in ids {
            self.expr(*id)?;
            if self.order.contains(id) {
                return Err(CompileError::structural(format!("expression {} is already placed", id.0)));
            }
        }
        self.order.splice(pos..pos, ids.iter().copied());
        Ok(())
    }

    /// Remove an expression. Fails while another expression still consumes it.
    pub fn erase(&mut self, id: ExprId) -> CompileResult<Expression> {
        let pos = self.position(id)?;
        if let Some((consumer, _)) = self.iter().find(|(_, e)| e.inputs.iter().any(|i| i.source.expr == id)) {
            return Err(CompileError::structural(format!(
                "cannot erase expression {} consumed by {}",
                id.0, consumer.0
            )));
        }
        self.order.remove(pos);
        self.exprs[id.0]
            .take()
            .ok_or_else(|| CompileError::structural(format!("expression {} does not exist", id.0)))
    }

    /// Move `id` directly before `anchor`.
    pub fn move_before(&mut self, id: ExprId, anchor: ExprId) -> CompileResult<()> {
        if id == anchor {
            return Ok(());
        }
        let from = self.position(id)?;
        self.order.remove(from);
        let to = self.position(anchor)?;
        self.order.insert(to, id);
        Ok(())
    }

    pub fn replace_input(&mut self, consumer: ExprId, index: usize, source: OutputRef) -> CompileResult<()> {
        self.expr(source.expr)?;
        let expr = self.expr_mut(consumer)?;
        let input = expr.inputs.get_mut(index).ok_or_else(|| {
            CompileError::structural(format!("expression {} has no input {index}", consumer.0))
        })?;
        input.source = source;
        Ok(())
    }

    pub fn position(&self, id: ExprId) -> CompileResult<usize> {
        self.order
            .iter()
            .position(|&e| e == id)
            .ok_or_else(|| CompileError::structural(format!("expression {} is not in the program", id.0)))
    }

    /// Consumers of an output as (expression, input index) pairs, in program order.
    pub fn consumers(&self, output: OutputRef) -> Vec<(ExprId, usize)> {
        let mut result = Vec::new();
        for (id, expr) in self.iter() {
            for (idx, input) in expr.inputs.iter().enumerate() {
                if input.source == output {
                    result.push((id, idx));
                }
            }
        }
        result
    }

    /// Deep-copy the expressions at positions `[begin, end)`.
    ///
    /// The copies are allocated but not placed; inputs produced inside the
    /// range are re-pointed to the copies. Returns the new ids in order and
    /// the old to new id map.
    pub fn deep_copy_range(
        &mut self,
        begin: usize,
        end: usize,
    ) -> CompileResult<(Vec<ExprId>, HashMap<ExprId, ExprId>)> {
        if begin > end || end > self.order.len() {
            return Err(CompileError::structural(format!("invalid copy range [{begin}, {end})")));
        }
        let originals: Vec<ExprId> = self.order[begin..end].to_vec();
        let mut map = HashMap::new();
        let mut new_ids = Vec::with_capacity(originals.len());
        for &old in &originals {
            let mut copy = self.expr(old)?.clone();
            for input in copy.inputs.iter_mut() {
                if let Some(&mapped) = map.get(&input.source.expr) {
                    input.source.expr = mapped;
                }
            }
            let new = self.alloc(copy);
            map.insert(old, new);
            new_ids.push(new);
        }
        Ok((new_ids, map))
    }

    pub fn parameters(&self) -> Vec<ExprId> {
        let mut params: Vec<(usize, ExprId)> = self
            .iter()
            .filter_map(|(id, e)| match e.kind {
                OpKind::Parameter { index } => Some((index, id)),
                _ => None,
            })
            .collect();
        params.sort_unstable();
        params.into_iter().map(|(_, id)| id).collect()
    }

    pub fn results(&self) -> Vec<ExprId> {
        let mut results: Vec<(usize, ExprId)> = self
            .iter()
            .filter_map(|(id, e)| match e.kind {
                OpKind::Result { index } => Some((index, id)),
                _ => None,
            })
            .collect();
        results.sort_unstable();
        results.into_iter().map(|(_, id)| id).collect()
    }

    pub fn buffers(&self) -> Vec<ExprId> {
        self.iter().filter(|(_, e)| matches!(e.kind, OpKind::Buffer(_))).map(|(id, _)| id).collect()
    }

    /// Check LoopBegin/LoopEnd pairing.
    ///
    /// Every LoopBegin output must have exactly one consumer, the LoopEnd of
    /// the same loop placed after it.
    pub fn validate(&self) -> CompileResult<()> {
        for (pos, (id, expr)) in self.iter().enumerate() {
            match &expr.kind {
                OpKind::LoopBegin { loop_id } => {
                    let consumers = self.consumers(OutputRef::new(id, 0));
                    let [(end_id, _)] = consumers.as_slice() else {
                        return Err(CompileError::structural(format!(
                            "LoopBegin of loop {loop_id} has {} consumers",
                            consumers.len()
                        )));
                    };
                    let end = self.expr(*end_id)?;
                    match &end.kind {
                        OpKind::LoopEnd(data) if data.loop_id == *loop_id => {}
                        _ => {
                            return Err(CompileError::structural(format!(
                                "LoopBegin of loop {loop_id} is not consumed by its LoopEnd"
                            )))
                        }
                    }
                    if self.position(*end_id)? <= pos {
                        return Err(CompileError::structural(format!(
                            "LoopEnd of loop {loop_id} precedes its LoopBegin"
                        )));
                    }
                }
                OpKind::LoopEnd(data) => {
                    let begin = expr
                        .inputs
                        .last()
                        .map(|input| self.expr(input.source.expr))
                        .transpose()?;
                    match begin.map(|b| &b.kind) {
                        Some(OpKind::LoopBegin { loop_id }) if *loop_id == data.loop_id => {}
                        _ => {
                            return Err(CompileError::structural(format!(
                                "LoopEnd of loop {} is not connected to its LoopBegin",
                                data.loop_id
                            )))
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowered::expression::Input;
    use crate::lowered::types::{ElementType, EltwiseKind, MemoryAccess, PortDescriptor};

    fn desc() -> PortDescriptor {
        PortDescriptor::new(vec![1, 16], ElementType::F32)
    }

    fn create_test_chain(ir: &mut LinearIR) -> (ExprId, ExprId, ExprId) {
        let param = ir.push(Expression::new(OpKind::Parameter { index: 0 }, vec![], vec![desc()]));
        let load = ir.push(Expression::new(
            OpKind::Load(MemoryAccess::new(8)),
            vec![Input { source: OutputRef::new(param, 0), desc: desc() }],
            vec![desc()],
        ));
        let relu = ir.push(Expression::new(
            OpKind::Eltwise(EltwiseKind::Relu),
            vec![Input { source: OutputRef::new(load, 0), desc: desc() }],
            vec![desc()],
        ));
        (param, load, relu)
    }

    #[test]
    fn test_insert_erase_and_consumers() {
        let mut ir = LinearIR::new(Config::default());
        let (param, load, relu) = create_test_chain(&mut ir);

        assert_eq!(ir.consumers(OutputRef::new(param, 0)), vec![(load, 0)]);
        assert!(ir.erase(load).is_err());

        let neg = ir
            .insert_before(
                relu,
                Expression::new(
                    OpKind::Eltwise(EltwiseKind::Negative),
                    vec![Input { source: OutputRef::new(load, 0), desc: desc() }],
                    vec![desc()],
                ),
            )
            .unwrap();
        ir.replace_input(relu, 0, OutputRef::new(neg, 0)).unwrap();
        assert_eq!(ir.order(), &[param, load, neg, relu]);

        ir.erase(relu).unwrap();
        assert_eq!(ir.len(), 3);
        assert!(ir.get(relu).is_none());
    }

    #[test]
    fn test_deep_copy_repoints_internal_inputs() {
        let mut ir = LinearIR::new(Config::default());
        let (param, load, relu) = create_test_chain(&mut ir);

        let (ids, map) = ir.deep_copy_range(1, 3).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], map[&load]);
        let relu_copy = ir.expr(map[&relu]).unwrap();
        assert_eq!(relu_copy.inputs[0].source, OutputRef::new(map[&load], 0));
        let load_copy = ir.expr(map[&load]).unwrap();
        assert_eq!(load_copy.inputs[0].source, OutputRef::new(param, 0));

        ir.insert_ids(1, &ids).unwrap();
        assert_eq!(ir.len(), 5);
        assert!(ir.insert_ids(0, &ids).is_err());
    }

    #[test]
    fn test_move_before() {
        let mut ir = LinearIR::new(Config::default());
        let (param, load, relu) = create_test_chain(&mut ir);
        ir.move_before(relu, load).unwrap();
        assert_eq!(ir.order(), &[param, relu, load]);
    }
}
