//! Buffer id assignment.
//!
//! Buffers sharing an id share one data pointer register, so two buffers may
//! only share an id when no loop and no expression touches both of them.
//! Ids are a greedy colouring of that adjacency relation in program order.

use crate::core::error::CompileResult;
use crate::core::session::CompilationSession;
use crate::lowered::expression::{ExprId, OutputRef};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::pass::insert_loops::port_connector;
use crate::lowered::pass::{Pass, PassId};
use crate::lowered::types::OpKind;
use std::collections::BTreeSet;

pub struct BufferIdentification;

/// Buffer behind a data pointer value: the Buffer producing it or the Buffer consuming it.
fn buffer_of(ir: &LinearIR, value: OutputRef) -> Option<ExprId> {
    if matches!(ir.get(value.expr)?.kind, OpKind::Buffer(_)) {
        return Some(value.expr);
    }
    ir.consumers(value)
        .into_iter()
        .map(|(consumer, _)| consumer)
        .find(|&consumer| matches!(ir.get(consumer).map(|e| &e.kind), Some(OpKind::Buffer(_))))
}

/// Pairs of buffer indices that must get different ids.
fn adjacency(ir: &LinearIR, buffers: &[ExprId]) -> CompileResult<Vec<Vec<bool>>> {
    let n = buffers.len();
    let mut adj = vec![vec![false; n]; n];
    let index_of = |id: ExprId| buffers.iter().position(|&b| b == id);
    let mut touch = |group: &BTreeSet<usize>| {
        for &i in group {
            for &j in group {
                if i != j {
                    adj[i][j] = true;
                }
            }
        }
    };

    for loop_id in ir.loop_manager().loop_ids() {
        let info = ir.loop_manager().get_loop_info(loop_id)?;
        let mut group = BTreeSet::new();
        for port in info.ports() {
            let connector = port_connector(ir, port)?;
            if let Some(idx) = buffer_of(ir, connector).and_then(index_of) {
                group.insert(idx);
            }
        }
        touch(&group);
    }

    for (id, expr) in ir.iter() {
        if expr.is_loop_marker() || matches!(expr.kind, OpKind::Buffer(_)) {
            continue;
        }
        let mut group = BTreeSet::new();
        for input in &expr.inputs {
            if let Some(idx) = buffer_of(ir, input.source).and_then(index_of) {
                group.insert(idx);
            }
        }
        for index in 0..expr.outputs.len() {
            if let Some(idx) = buffer_of(ir, OutputRef::new(id, index)).and_then(index_of) {
                group.insert(idx);
            }
        }
        touch(&group);
    }
    Ok(adj)
}

impl Pass for BufferIdentification {
    fn id(&self) -> PassId {
        PassId::BufferIdentification
    }

    fn run(&mut self, ir: &mut LinearIR, _session: &CompilationSession<'_>) -> CompileResult<bool> {
        let buffers = ir.buffers();
        if buffers.is_empty() {
            return Ok(false);
        }
        let adj = adjacency(ir, &buffers)?;
        let mut colors: Vec<usize> = Vec::with_capacity(buffers.len());
        for i in 0..buffers.len() {
            let used: BTreeSet<usize> = (0..i).filter(|&j| adj[i][j]).map(|j| colors[j]).collect();
            let color = (0..).find(|c| !used.contains(c)).unwrap_or(i);
            colors.push(color);
        }
        for (&id, &color) in buffers.iter().zip(colors.iter()) {
            if let OpKind::Buffer(data) = &mut ir.expr_mut(id)?.kind {
                data.id = color;
            }
            log::debug!("buffer {} gets id {color}", id.0);
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
    use crate::lowered::types::{BufferData, BufferKind, ElementType, EltwiseKind, MemoryAccess, PortDescriptor};

    fn buffer(ir: &mut LinearIR, source: Option<OutputRef>, desc: &PortDescriptor) -> ExprId {
        let inputs = source.map(|s| vec![Input { source: s, desc: desc.clone() }]).unwrap_or_default();
        let kind = if inputs.is_empty() { BufferKind::NewMemory } else { BufferKind::IntermediateMemory };
        ir.push(Expression::new(
            OpKind::Buffer(BufferData { kind, byte_size: desc.byte_size(), id: 0, offset: None }),
            inputs,
            vec![desc.clone()],
        ))
    }

    fn copy(ir: &mut LinearIR, source: ExprId, desc: &PortDescriptor) -> ExprId {
        let load = ir.push(Expression::new(
            OpKind::Load(MemoryAccess::new(8)),
            vec![Input { source: OutputRef::new(source, 0), desc: desc.clone() }],
            vec![desc.clone()],
        ));
        let relu = ir.push(Expression::new(
            OpKind::Eltwise(EltwiseKind::Relu),
            vec![Input { source: OutputRef::new(load, 0), desc: desc.clone() }],
            vec![desc.clone()],
        ));
        ir.push(Expression::new(
            OpKind::Store(MemoryAccess::new(8)),
            vec![Input { source: OutputRef::new(relu, 0), desc: desc.clone() }],
            vec![desc.clone()],
        ))
    }

    #[test]
    fn test_chain_alternates_ids() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut ir = LinearIR::new(Config::default());
        let desc = PortDescriptor::new(vec![1, 16], ElementType::F32);

        let b0 = buffer(&mut ir, None, &desc);
        let s1 = copy(&mut ir, b0, &desc);
        let b1 = buffer(&mut ir, Some(OutputRef::new(s1, 0)), &desc);
        let s2 = copy(&mut ir, b1, &desc);
        let b2 = buffer(&mut ir, Some(OutputRef::new(s2, 0)), &desc);
        // Each copy is one loop over its Load, Relu and Store.
        crate::lowered::pass::MarkLoops::new(8).run(&mut ir, &session).unwrap();

        assert!(BufferIdentification.run(&mut ir, &session).unwrap());
        let id = |e: ExprId| match &ir.expr(e).unwrap().kind {
            OpKind::Buffer(data) => data.id,
            _ => unreachable!(),
        };
        assert_eq!((id(b0), id(b1), id(b2)), (0, 1, 0));
    }
}
