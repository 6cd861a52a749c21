// This module is the adapter between an external model graph and the Linear IR. A Subgraph is the
// small closed fragment a tokenizer decided to fuse: parameters, elementwise operations, scalars,
// conversions, matrix multiplications, transposes and results, kept in topological order with an
// inferred shape and element type per node. The fragment is built through SubgraphBuilder, which
// infers shapes as nodes are added and rejects incompatible operands right away. Compiling a
// fragment canonicalizes it against the blocked shapes the caller will actually pass, optionally
// fuses Multiply+Add into Fma, converts it into the Linear IR dialect with explicit memory
// movement, runs the lowering pipeline and hands the result to the generation driver.

//! External graph fragment adapter.
//!
//! # Key Components
//!
//! - [`SubgraphBuilder`] with shape inference
//! - [`Subgraph::canonicalize`] against caller provided [`BlockedShape`]s
//! - [`fuse::mul_add_to_fma`]
//! - [`convert::to_linear_ir`] dialect conversion
//! - [`Subgraph::generate`] end to end compile into a [`Schedule`]

pub mod canonicalize;
pub mod convert;
pub mod fuse;

use crate::core::config::Config;
use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::generator::{Generator, Schedule, TargetMachine};
use crate::lowered::pass::{lowering_pipeline, PassId};
use crate::lowered::types::{ElementType, EltwiseKind};
use std::any::Any;
use std::fmt;

pub use canonicalize::{broadcast_merge, BlockedShape};

/// Handle of a node inside a [`Subgraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Parameter { index: usize },
    Scalar(f32),
    Eltwise(EltwiseKind),
    Convert(ElementType),
    MatMul,
    /// Output dimension `p` is input dimension `order[p]`.
    Transpose(Vec<usize>),
    Result { index: usize },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Parameter { .. } => "Parameter",
            NodeKind::Scalar(_) => "Scalar",
            NodeKind::Eltwise(_) => "Eltwise",
            NodeKind::Convert(_) => "Convert",
            NodeKind::MatMul => "MatMul",
            NodeKind::Transpose(_) => "Transpose",
            NodeKind::Result { .. } => "Result",
        }
    }

    /// Operations whose inputs cannot be broadcast into one another.
    pub fn is_domain_sensitive(&self) -> bool {
        matches!(self, NodeKind::MatMul | NodeKind::Transpose(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub inputs: Vec<NodeId>,
    pub shape: Vec<usize>,
    pub element_type: ElementType,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} {}", self.kind.name(), self.shape, self.element_type.name())
    }
}

/// Output shape and element type of `kind` applied to `inputs`.
pub fn infer_node(kind: &NodeKind, inputs: &[&Node]) -> CompileResult<(Vec<usize>, ElementType)> {
    let first = |what: &str| {
        inputs
            .first()
            .copied()
            .ok_or_else(|| CompileError::structural(format!("{what} needs an input")))
    };
    match kind {
        NodeKind::Parameter { .. } | NodeKind::Scalar(_) => {
            Err(CompileError::structural(format!("{} shapes are not inferred", kind.name())))
        }
        NodeKind::Result { .. } => {
            let input = first("Result")?;
            Ok((input.shape.clone(), input.element_type))
        }
        NodeKind::Convert(to) => Ok((first("Convert")?.shape.clone(), *to)),
        NodeKind::Eltwise(op) => {
            if inputs.len() != op.arity() {
                return Err(CompileError::structural(format!(
                    "{op:?} takes {} inputs, got {}",
                    op.arity(),
                    inputs.len()
                )));
            }
            let element_type = first("Eltwise")?.element_type;
            let mut shape: Vec<usize> = Vec::new();
            for input in inputs {
                if input.element_type != element_type {
                    return Err(CompileError::structural(format!(
                        "{op:?} mixes {} and {} operands",
                        element_type.name(),
                        input.element_type.name()
                    )));
                }
                shape = broadcast_merge(&shape, &input.shape).ok_or_else(|| {
                    CompileError::unsupported_shape(format!(
                        "{op:?} operands {shape:?} and {:?} do not broadcast",
                        input.shape
                    ))
                })?;
            }
            Ok((shape, element_type))
        }
        NodeKind::MatMul => {
            let (Some(a), Some(b)) = (inputs.first(), inputs.get(1)) else {
                return Err(CompileError::structural("MatMul takes two inputs"));
            };
            if a.shape.len() < 2 || b.shape.len() < 2 {
                return Err(CompileError::unsupported_shape(format!(
                    "MatMul operands must have rank 2 or more, got {:?} and {:?}",
                    a.shape, b.shape
                )));
            }
            let (ra, rb) = (a.shape.len(), b.shape.len());
            let (m, k) = (a.shape[ra - 2], a.shape[ra - 1]);
            let (kb, n) = (b.shape[rb - 2], b.shape[rb - 1]);
            if k != kb {
                return Err(CompileError::unsupported_shape(format!("MatMul K mismatch: {k} vs {kb}")));
            }
            let mut shape = broadcast_merge(&a.shape[..ra - 2], &b.shape[..rb - 2]).ok_or_else(|| {
                CompileError::unsupported_shape(format!("MatMul batch dims {:?} and {:?} differ", a.shape, b.shape))
            })?;
            shape.extend([m, n]);
            Ok((shape, a.element_type))
        }
        NodeKind::Transpose(order) => {
            let input = first("Transpose")?;
            let mut seen = vec![false; order.len()];
            let valid = order.len() == input.shape.len()
                && order.iter().all(|&d| d < seen.len() && !std::mem::replace(&mut seen[d], true));
            if !valid {
                return Err(CompileError::unsupported_shape(format!(
                    "{order:?} is not a permutation of rank {}",
                    input.shape.len()
                )));
            }
            Ok((order.iter().map(|&d| input.shape[d]).collect(), input.element_type))
        }
    }
}

/// A closed fragment of the model graph selected for fusion.
#[derive(Debug, Clone)]
pub struct Subgraph {
    nodes: Vec<Option<Node>>,
    order: Vec<NodeId>,
    config: Config,
    name: String,
}

impl Subgraph {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name the compile is recorded under in the session.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn node(&self, id: NodeId) -> CompileResult<&Node> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| CompileError::structural(format!("node {} does not exist", id.0)))
    }

    pub fn node_mut(&mut self, id: NodeId) -> CompileResult<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| CompileError::structural(format!("node {} does not exist", id.0)))
    }

    /// Nodes in topological order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.order
            .iter()
            .filter_map(move |&id| self.nodes.get(id.0).and_then(Option::as_ref).map(|n| (id, n)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn parameters(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Parameter { .. }))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn results(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Result { .. }))
            .map(|(id, _)| id)
            .collect()
    }

    /// Consumers of `id` with the input slot they read it through.
    pub fn consumers(&self, id: NodeId) -> Vec<(NodeId, usize)> {
        let mut out = Vec::new();
        for (consumer, node) in self.iter() {
            for (index, &input) in node.inputs.iter().enumerate() {
                if input == id {
                    out.push((consumer, index));
                }
            }
        }
        out
    }

    pub fn has_domain_sensitive_ops(&self) -> bool {
        self.iter().any(|(_, n)| n.kind.is_domain_sensitive())
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(node));
        self.order.push(id);
        id
    }

    /// Insert `node` right before `anchor` in topological order.
    pub fn insert_before(&mut self, anchor: NodeId, node: Node) -> CompileResult<NodeId> {
        let pos = self.position(anchor)?;
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(node));
        self.order.insert(pos, id);
        Ok(id)
    }

    /// Insert `node` right after `anchor` in topological order.
    pub fn insert_after(&mut self, anchor: NodeId, node: Node) -> CompileResult<NodeId> {
        let pos = self.position(anchor)?;
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(node));
        self.order.insert(pos + 1, id);
        Ok(id)
    }

    pub fn remove(&mut self, id: NodeId) -> CompileResult<Node> {
        let pos = self.position(id)?;
        self.order.remove(pos);
        self.nodes
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| CompileError::structural(format!("node {} does not exist", id.0)))
    }

    fn position(&self, id: NodeId) -> CompileResult<usize> {
        self.order
            .iter()
            .position(|&n| n == id)
            .ok_or_else(|| CompileError::structural(format!("node {} is not in the subgraph", id.0)))
    }

    /// Re-run shape and element type inference over every derived node.
    pub fn infer_shapes(&mut self) -> CompileResult<()> {
        for id in self.order.clone() {
            let node = self.node(id)?;
            if matches!(node.kind, NodeKind::Parameter { .. } | NodeKind::Scalar(_)) {
                continue;
            }
            let inputs = node.inputs.iter().map(|&i| self.node(i)).collect::<CompileResult<Vec<_>>>()?;
            let (shape, element_type) = infer_node(&node.kind, &inputs)?;
            let node = self.node_mut(id)?;
            node.shape = shape;
            node.element_type = element_type;
        }
        Ok(())
    }

    /// Compile the fragment for the shapes the caller will pass at run time.
    ///
    /// Runs canonicalization, the optional Mul+Add fusion, dialect
    /// conversion, the lowering pipeline and the generation driver.
    pub fn generate<T: TargetMachine>(
        &mut self,
        output_shapes: &[BlockedShape],
        input_shapes: &[BlockedShape],
        target: &mut T,
        session: &CompilationSession<'_>,
        compile_params: Option<&dyn Any>,
    ) -> CompileResult<Schedule> {
        session.begin_snippet(&self.name);
        let master_shape = self.canonicalize(output_shapes, input_shapes)?;
        if self.config.is_pass_enabled(PassId::MulAddToFma) {
            let fused = fuse::mul_add_to_fma(self)?;
            session.record_pass_run(PassId::MulAddToFma.name(), fused > 0);
        }
        let mut ir = convert::to_linear_ir(self)?;
        log::debug!("dialect conversion produced {} expressions", ir.len());
        lowering_pipeline(target.get_lanes()).run(&mut ir, session)?;
        Generator::new(target).generate(&mut ir, session, &master_shape, compile_params)
    }
}

/// Incremental construction of a [`Subgraph`] with shape inference.
#[derive(Debug, Default)]
pub struct SubgraphBuilder {
    graph: Subgraph,
    num_params: usize,
    num_results: usize,
}

impl Default for Subgraph {
    fn default() -> Self {
        Self { nodes: Vec::new(), order: Vec::new(), config: Config::default(), name: "snippet".to_string() }
    }
}

impl SubgraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parameter(&mut self, element_type: ElementType, shape: Vec<usize>) -> NodeId {
        let index = self.num_params;
        self.num_params += 1;
        self.graph.push(Node { kind: NodeKind::Parameter { index }, inputs: vec![], shape, element_type })
    }

    pub fn scalar(&mut self, value: f32) -> NodeId {
        self.graph.push(Node { kind: NodeKind::Scalar(value), inputs: vec![], shape: vec![1], element_type: ElementType::F32 })
    }

    fn derived(&mut self, kind: NodeKind, inputs: Vec<NodeId>) -> CompileResult<NodeId> {
        let nodes = inputs.iter().map(|&i| self.graph.node(i)).collect::<CompileResult<Vec<_>>>()?;
        let (shape, element_type) = infer_node(&kind, &nodes)?;
        log::trace!("built {} with shape {shape:?}", kind.name());
        Ok(self.graph.push(Node { kind, inputs, shape, element_type }))
    }

    fn eltwise(&mut self, op: EltwiseKind, inputs: Vec<NodeId>) -> CompileResult<NodeId> {
        self.derived(NodeKind::Eltwise(op), inputs)
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> CompileResult<NodeId> {
        self.eltwise(EltwiseKind::Add, vec![a, b])
    }

    pub fn subtract(&mut self, a: NodeId, b: NodeId) -> CompileResult<NodeId> {
        self.eltwise(EltwiseKind::Subtract, vec![a, b])
    }

    pub fn multiply(&mut self, a: NodeId, b: NodeId) -> CompileResult<NodeId> {
        self.eltwise(EltwiseKind::Multiply, vec![a, b])
    }

    pub fn divide(&mut self, a: NodeId, b: NodeId) -> CompileResult<NodeId> {
        self.eltwise(EltwiseKind::Divide, vec![a, b])
    }

    pub fn maximum(&mut self, a: NodeId, b: NodeId) -> CompileResult<NodeId> {
        self.eltwise(EltwiseKind::Maximum, vec![a, b])
    }

    pub fn minimum(&mut self, a: NodeId, b: NodeId) -> CompileResult<NodeId> {
        self.eltwise(EltwiseKind::Minimum, vec![a, b])
    }

    pub fn fma(&mut self, a: NodeId, b: NodeId, c: NodeId) -> CompileResult<NodeId> {
        self.eltwise(EltwiseKind::Fma, vec![a, b, c])
    }

    pub fn relu(&mut self, a: NodeId) -> CompileResult<NodeId> {
        self.eltwise(EltwiseKind::Relu, vec![a])
    }

    pub fn negative(&mut self, a: NodeId) -> CompileResult<NodeId> {
        self.eltwise(EltwiseKind::Negative, vec![a])
    }

    pub fn convert(&mut self, a: NodeId, element_type: ElementType) -> CompileResult<NodeId> {
        self.derived(NodeKind::Convert(element_type), vec![a])
    }

    pub fn matmul(&mut self, a: NodeId, b: NodeId) -> CompileResult<NodeId> {
        self.derived(NodeKind::MatMul, vec![a, b])
    }

    pub fn transpose(&mut self, a: NodeId, order: Vec<usize>) -> CompileResult<NodeId> {
        self.derived(NodeKind::Transpose(order), vec![a])
    }

    pub fn result(&mut self, a: NodeId) -> CompileResult<NodeId> {
        let index = self.num_results;
        let id = self.derived(NodeKind::Result { index }, vec![a])?;
        self.num_results += 1;
        Ok(id)
    }

    pub fn build(self) -> CompileResult<Subgraph> {
        if self.num_params == 0 || self.num_results == 0 {
            return Err(CompileError::structural(format!(
                "a subgraph needs parameters and results, got {} and {}",
                self.num_params, self.num_results
            )));
        }
        Ok(self.graph)
    }
}
