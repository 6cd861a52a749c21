// This module converts a canonicalized Subgraph into the Linear IR dialect, making every memory
// movement explicit. Values are tracked in one of two forms: a data pointer (a parameter, a buffer or
// a brgemm output) or a vector register produced by an elementwise operation. Elementwise
// operations load each memory operand right before use; MatMul takes both operands from memory and
// writes its product to a buffer unless a single Result consumes it. A Transpose of a parameter that
// only feeds MatMuls is folded into the brgemm port layout; any other Transpose is a LoadReshape into
// an intermediate buffer. Parameters are emitted first and Results last, so that the elementwise
// expressions between two buffers form one contiguous run. A buffer or brgemm splits that run: any
// register value still needed afterwards is stored to a buffer before the split.

//! Subgraph to Linear IR dialect conversion.

use crate::core::error::{CompileError, CompileResult};
use crate::lowered::expression::{Expression, Input, OutputRef};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::types::{BrgemmData, BufferData, BufferKind, MemoryAccess, OpKind, PortDescriptor};
use crate::subgraph::{Node, NodeId, NodeKind, Subgraph};
use hashbrown::{HashMap, HashSet};

#[derive(Debug, Clone)]
enum Value {
    /// Data pointer.
    Memory { source: OutputRef, desc: PortDescriptor, from_brgemm: bool },
    /// Vector register.
    Register { source: OutputRef, desc: PortDescriptor },
}

struct Converter<'g> {
    graph: &'g Subgraph,
    ir: LinearIR,
    values: HashMap<NodeId, Value>,
    done: HashSet<NodeId>,
}

fn planar_desc(node: &Node) -> PortDescriptor {
    PortDescriptor::new(node.shape.clone(), node.element_type)
}

impl<'g> Converter<'g> {
    fn new(graph: &'g Subgraph) -> Self {
        Self { graph, ir: LinearIR::new(graph.config().clone()), values: HashMap::new(), done: HashSet::new() }
    }

    fn push(&mut self, kind: OpKind, inputs: Vec<(OutputRef, PortDescriptor)>, outputs: Vec<PortDescriptor>) -> OutputRef {
        let inputs = inputs.into_iter().map(|(source, desc)| Input { source, desc }).collect();
        OutputRef::new(self.ir.push(Expression::new(kind, inputs, outputs)), 0)
    }

    fn value(&self, id: NodeId) -> CompileResult<Value> {
        self.values
            .get(&id)
            .cloned()
            .ok_or_else(|| CompileError::structural(format!("node {} is used before it is defined", id.0)))
    }

    fn store(&mut self, source: OutputRef, desc: PortDescriptor) -> OutputRef {
        self.push(OpKind::Store(MemoryAccess::new(1)), vec![(source, desc.clone())], vec![desc])
    }

    fn buffer(&mut self, source: OutputRef, desc: PortDescriptor) -> OutputRef {
        let data = BufferData { kind: BufferKind::IntermediateMemory, byte_size: desc.byte_size(), id: 0, offset: None };
        self.push(OpKind::Buffer(data), vec![(source, desc.clone())], vec![desc])
    }

    /// Register form of a value, loading it when it lives in memory.
    fn register(&mut self, id: NodeId) -> CompileResult<(OutputRef, PortDescriptor)> {
        match self.value(id)? {
            Value::Register { source, desc } => Ok((source, desc)),
            Value::Memory { source, desc, .. } => {
                let loaded = PortDescriptor::new(desc.planar_shape(), desc.element_type);
                Ok((self.push(OpKind::Load(MemoryAccess::new(1)), vec![(source, desc)], vec![loaded.clone()]), loaded))
            }
        }
    }

    /// Memory form of a value, spilling registers when it lives in one.
    fn memory(&mut self, id: NodeId) -> CompileResult<(OutputRef, PortDescriptor)> {
        if matches!(self.value(id)?, Value::Register { .. }) {
            self.close_run(Vec::new())?;
        }
        match self.value(id)? {
            Value::Memory { source, desc, .. } => Ok((source, desc)),
            Value::Register { .. } => Err(CompileError::structural(format!("node {} could not be spilled", id.0))),
        }
    }

    fn has_pending_consumer(&self, id: NodeId) -> bool {
        self.graph.consumers(id).iter().any(|(consumer, _)| !self.done.contains(consumer))
    }

    /// Put buffers behind the `stores` just emitted and end the current
    /// elementwise run. Registers still needed later are stored first and
    /// continue as buffers.
    fn close_run(&mut self, stores: Vec<(OutputRef, PortDescriptor)>) -> CompileResult<Vec<OutputRef>> {
        let mut live: Vec<(NodeId, OutputRef, PortDescriptor)> = self
            .values
            .iter()
            .filter_map(|(&id, value)| match value {
                Value::Register { source, desc } => Some((id, *source, desc.clone())),
                Value::Memory { .. } => None,
            })
            .filter(|(id, _, _)| self.has_pending_consumer(*id))
            .collect();
        live.sort_by_key(|(id, _, _)| *id);

        let spills: Vec<(NodeId, OutputRef, PortDescriptor)> = live
            .into_iter()
            .map(|(id, source, desc)| (id, self.store(source, desc.clone()), desc))
            .collect();
        let buffers = stores.into_iter().map(|(store, desc)| self.buffer(store, desc)).collect();
        for (id, store, desc) in spills {
            let source = self.buffer(store, desc.clone());
            log::trace!("spilled node {} into a buffer", id.0);
            self.values.insert(id, Value::Memory { source, desc, from_brgemm: false });
        }
        Ok(buffers)
    }

    fn convert_node(&mut self, id: NodeId, node: &Node) -> CompileResult<()> {
        let value = match &node.kind {
            NodeKind::Parameter { .. } | NodeKind::Result { .. } => return Ok(()),
            NodeKind::Scalar(value) => {
                let desc = PortDescriptor::new(vec![1], node.element_type);
                Value::Register { source: self.push(OpKind::Scalar(*value), vec![], vec![desc.clone()]), desc }
            }
            NodeKind::Eltwise(op) => {
                let inputs = node.inputs.iter().map(|&i| self.register(i)).collect::<CompileResult<Vec<_>>>()?;
                let desc = planar_desc(node);
                Value::Register { source: self.push(OpKind::Eltwise(*op), inputs, vec![desc.clone()]), desc }
            }
            NodeKind::Convert(to) => {
                let source = self.single_input(id, node)?;
                let input = self.register(source)?;
                let desc = planar_desc(node);
                Value::Register { source: self.push(OpKind::Convert(*to), vec![input], vec![desc.clone()]), desc }
            }
            NodeKind::Transpose(order) => self.convert_transpose(id, node, order)?,
            NodeKind::MatMul => self.convert_matmul(id, node)?,
        };
        self.values.insert(id, value);
        Ok(())
    }

    fn single_input(&self, id: NodeId, node: &Node) -> CompileResult<NodeId> {
        node.inputs
            .first()
            .copied()
            .ok_or_else(|| CompileError::structural(format!("{} {} has no input", node.kind.name(), id.0)))
    }

    fn convert_transpose(&mut self, id: NodeId, node: &Node, order: &[usize]) -> CompileResult<Value> {
        let input = self.single_input(id, node)?;
        let rank = order.len();

        let feeds_matmuls_only = {
            let consumers = self.graph.consumers(id);
            !consumers.is_empty()
                && consumers
                    .iter()
                    .all(|(c, _)| self.graph.node(*c).is_ok_and(|n| n.kind == NodeKind::MatMul))
        };
        if let Value::Memory { source, desc, .. } = self.value(input)? {
            let is_param = matches!(self.ir.expr(source.expr)?.kind, OpKind::Parameter { .. });
            if is_param && desc.is_planar() && feeds_matmuls_only && order.last() == Some(&(rank - 1)) {
                log::debug!("folded transpose {order:?} into the brgemm input layout");
                return Ok(Value::Memory { source, desc: desc.with_layout(order.to_vec()), from_brgemm: false });
            }
        }

        let outer = rank.saturating_sub(self.graph.config().tile_rank);
        if order.iter().take(outer).enumerate().any(|(d, &o)| d != o) {
            return Err(CompileError::unsupported_layout(format!(
                "transpose {order:?} permutes dimensions outside the innermost {}",
                self.graph.config().tile_rank
            )));
        }
        let (source, desc) = self.memory(input)?;
        let reshape = OpKind::LoadReshape { access: MemoryAccess::new(1), order: order.to_vec() };
        let out_desc = planar_desc(node);
        let loaded = self.push(reshape, vec![(source, desc.with_layout(order.to_vec()))], vec![out_desc.clone()]);
        let store = self.store(loaded, out_desc.clone());
        let buffers = self.close_run(vec![(store, out_desc.clone())])?;
        let source = buffers
            .first()
            .copied()
            .ok_or_else(|| CompileError::structural("transpose buffer was not created"))?;
        Ok(Value::Memory { source, desc: out_desc, from_brgemm: false })
    }

    fn convert_matmul(&mut self, id: NodeId, node: &Node) -> CompileResult<Value> {
        let (Some(&a), Some(&b)) = (node.inputs.first(), node.inputs.get(1)) else {
            return Err(CompileError::structural(format!("MatMul {} needs two inputs", id.0)));
        };
        let a = self.memory(a)?;
        let b = self.memory(b)?;
        // The brgemm call ends the run even when both operands were in memory.
        self.close_run(Vec::new())?;

        let data = BrgemmData { a: MemoryAccess::default(), b: MemoryAccess::default(), c: MemoryAccess::default(), beta: 0.0 };
        let desc = planar_desc(node);
        let output = self.push(OpKind::Brgemm(data), vec![a, b], vec![desc.clone()]);

        let consumers = self.graph.consumers(id);
        let single_result = matches!(
            consumers.as_slice(),
            [(c, _)] if self.graph.node(*c).is_ok_and(|n| matches!(n.kind, NodeKind::Result { .. }))
        );
        if single_result {
            return Ok(Value::Memory { source: output, desc, from_brgemm: true });
        }
        let source = self.buffer(output, desc.clone());
        Ok(Value::Memory { source, desc, from_brgemm: false })
    }

    /// Data pointer a Result reads: the brgemm output itself or a Store.
    fn result_source(&mut self, id: NodeId) -> CompileResult<(OutputRef, PortDescriptor)> {
        let node = self.graph.node(id)?;
        let input = self.single_input(id, node)?;
        Ok(match self.value(input)? {
            Value::Memory { source, desc, from_brgemm: true } => (source, desc),
            Value::Register { source, desc } => (self.store(source, desc.clone()), desc),
            Value::Memory { .. } => {
                let (loaded, desc) = self.register(input)?;
                (self.store(loaded, desc.clone()), desc)
            }
        })
    }

    fn run(mut self) -> CompileResult<LinearIR> {
        let mut params: Vec<(usize, NodeId)> = Vec::new();
        let mut results: Vec<(usize, NodeId)> = Vec::new();
        for (id, node) in self.graph.iter() {
            match node.kind {
                NodeKind::Parameter { index } => params.push((index, id)),
                NodeKind::Result { index } => results.push((index, id)),
                _ => {}
            }
        }
        params.sort_unstable();
        results.sort_unstable();

        for &(index, id) in &params {
            let desc = planar_desc(self.graph.node(id)?);
            let source = self.push(OpKind::Parameter { index }, vec![], vec![desc.clone()]);
            self.values.insert(id, Value::Memory { source, desc, from_brgemm: false });
            self.done.insert(id);
        }
        let graph = self.graph;
        for (id, node) in graph.iter() {
            self.convert_node(id, node)?;
            self.done.insert(id);
        }
        // Stores first so they stay in the last run.
        let mut sources = Vec::with_capacity(results.len());
        for &(index, id) in &results {
            sources.push((index, self.result_source(id)?));
        }
        for (index, input) in sources {
            self.push(OpKind::Result { index }, vec![input], vec![]);
        }
        self.ir.validate()?;
        Ok(self.ir)
    }
}

/// Lower a canonicalized subgraph into an unscheduled Linear IR.
pub fn to_linear_ir(graph: &Subgraph) -> CompileResult<LinearIR> {
    let ir = Converter::new(graph).run()?;
    log::debug!("converted {} nodes into {} expressions", graph.len(), ir.len());
    Ok(ir)
}
