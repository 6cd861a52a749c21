// This module fits a subgraph to the shapes the caller will actually pass. Every input and output
// comes with a blocked shape: its dimensions in memory order, the planar axis each memory dimension
// belongs to (a repeated axis marks a blocked layout such as a channel block), and its element type.
// The input of highest rank is the base. Lower-rank inputs are padded with leading ones (and a
// trailing one when the base is blocked) so every parameter has the base rank; inputs of equal rank
// must share the base layout. After re-inferring shapes, every result has to agree with the shape
// the caller expects up to leading and trailing ones, and all results must broadcast together:
// their common shape is the master shape the kernel is scheduled over. Finally precisions are
// aligned with converts at the body boundary.

//! Shape canonicalization and precision alignment.

use crate::core::error::{CompileError, CompileResult};
use crate::lowered::types::ElementType;
use crate::subgraph::{Node, NodeId, NodeKind, Subgraph};
use std::collections::BTreeSet;

/// Memory shape, axis order and element type of one subgraph input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedShape {
    pub shape: Vec<usize>,
    /// Planar axis of every memory dimension.
    pub order: Vec<usize>,
    pub element_type: ElementType,
}

impl BlockedShape {
    pub fn new(shape: Vec<usize>, order: Vec<usize>, element_type: ElementType) -> Self {
        Self { shape, order, element_type }
    }

    pub fn planar(shape: Vec<usize>, element_type: ElementType) -> Self {
        let order = (0..shape.len()).collect();
        Self { shape, order, element_type }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// A repeated axis means one planar dimension is split into blocks.
    pub fn is_blocked(&self) -> bool {
        self.order.iter().collect::<BTreeSet<_>>().len() != self.order.len()
    }
}

/// NumPy broadcast of two shapes: right aligned, each pair of dimensions
/// equal or one of them 1.
pub fn broadcast_merge(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut merged = vec![1; rank];
    for (i, dim) in merged.iter_mut().enumerate() {
        let x = (i + a.len()).checked_sub(rank).map_or(1, |j| a[j]);
        let y = (i + b.len()).checked_sub(rank).map_or(1, |j| b[j]);
        *dim = match (x, y) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(merged)
}

fn trim_ones(shape: &[usize]) -> &[usize] {
    let begin = shape.iter().position(|&d| d != 1).unwrap_or(shape.len());
    let end = shape.iter().rposition(|&d| d != 1).map_or(begin, |p| p + 1);
    &shape[begin..end]
}

impl Subgraph {
    /// Fit parameter shapes and precisions to the caller's blocked shapes.
    ///
    /// Returns the master shape: the broadcast of every result shape.
    pub fn canonicalize(
        &mut self,
        output_shapes: &[BlockedShape],
        input_shapes: &[BlockedShape],
    ) -> CompileResult<Vec<usize>> {
        let params = self.parameters();
        let results = self.results();
        if input_shapes.len() != params.len() {
            return Err(CompileError::structural(format!(
                "the subgraph has {} parameters but {} input shapes were passed",
                params.len(),
                input_shapes.len()
            )));
        }
        if output_shapes.len() != results.len() {
            return Err(CompileError::structural(format!(
                "the subgraph has {} results but {} output shapes were passed",
                results.len(),
                output_shapes.len()
            )));
        }

        // First input of maximum rank.
        let base = input_shapes
            .iter()
            .fold(None, |best: Option<&BlockedShape>, s| match best {
                Some(b) if b.rank() >= s.rank() => Some(b),
                _ => Some(s),
            })
            .ok_or_else(|| CompileError::structural("a subgraph needs at least one input"))?;
        let base_rank = base.rank();
        let base_blocked = base.is_blocked();
        let domain_sensitive = self.has_domain_sensitive_ops();

        for (&param, blocked) in params.iter().zip(input_shapes) {
            let mut shape = blocked.shape.clone();
            if blocked.rank() > base_rank {
                return Err(CompileError::unsupported_shape(format!(
                    "input rank {} exceeds the base rank {base_rank}",
                    blocked.rank()
                )));
            }
            if blocked.rank() < base_rank {
                if base_blocked {
                    if blocked.is_blocked() {
                        return Err(CompileError::unsupported_layout(
                            "blocked layouts of different ranks cannot be combined",
                        ));
                    }
                    shape.push(1);
                }
                shape = broadcast_merge(&vec![1; base_rank], &shape).ok_or_else(|| {
                    CompileError::unsupported_shape(format!("{:?} cannot be extended to rank {base_rank}", blocked.shape))
                })?;
            } else if blocked.order != base.order {
                return Err(CompileError::unsupported_layout(format!(
                    "inputs of equal rank use layouts {:?} and {:?}",
                    base.order, blocked.order
                )));
            }
            if !domain_sensitive && broadcast_merge(&base.shape, &shape).is_none() {
                return Err(CompileError::unsupported_shape(format!(
                    "input {shape:?} does not broadcast to {:?}",
                    base.shape
                )));
            }
            self.node_mut(param)?.shape = shape;
        }
        self.infer_shapes()?;

        let master_shape = self.master_shape(&results, output_shapes)?;
        self.align_element_types(output_shapes, input_shapes)?;
        log::debug!("canonicalized subgraph: master shape {master_shape:?}");
        Ok(master_shape)
    }

    fn master_shape(&self, results: &[NodeId], output_shapes: &[BlockedShape]) -> CompileResult<Vec<usize>> {
        // A transposed matmul result is scheduled over the matmul itself.
        if let [result] = results {
            let parent = self.node(self.result_input(*result)?)?;
            if let (NodeKind::Transpose(_), Some(&source)) = (&parent.kind, parent.inputs.first()) {
                let source = self.node(source)?;
                if source.kind == NodeKind::MatMul {
                    return Ok(source.shape.clone());
                }
            }
        }

        let mut master: Vec<usize> = Vec::new();
        for (&result, expected) in results.iter().zip(output_shapes) {
            let shape = &self.node(result)?.shape;
            if broadcast_merge(trim_ones(shape), trim_ones(&expected.shape)).is_none() {
                return Err(CompileError::unsupported_shape(format!(
                    "inferred result shape {shape:?} is incompatible with the expected {:?}",
                    expected.shape
                )));
            }
            master = broadcast_merge(&master, shape).ok_or_else(|| {
                CompileError::unsupported_shape(format!("result shapes {master:?} and {shape:?} do not broadcast"))
            })?;
        }
        Ok(master)
    }

    fn result_input(&self, result: NodeId) -> CompileResult<NodeId> {
        self.node(result)?
            .inputs
            .first()
            .copied()
            .ok_or_else(|| CompileError::structural(format!("result {} has no input", result.0)))
    }

    /// Insert converts where the body precision differs from the caller's.
    ///
    /// Results get a Convert to the requested type in front of them.
    /// Parameters are retyped to the requested type and followed by a
    /// Convert back to the type the body computes in.
    pub fn align_element_types(
        &mut self,
        output_shapes: &[BlockedShape],
        input_shapes: &[BlockedShape],
    ) -> CompileResult<()> {
        for (result, expected) in self.results().into_iter().zip(output_shapes) {
            let node = self.node(result)?;
            if node.element_type == expected.element_type {
                continue;
            }
            let source = self.result_input(result)?;
            let convert = Node {
                kind: NodeKind::Convert(expected.element_type),
                inputs: vec![source],
                shape: node.shape.clone(),
                element_type: expected.element_type,
            };
            let convert = self.insert_before(result, convert)?;
            let node = self.node_mut(result)?;
            node.inputs[0] = convert;
            node.element_type = expected.element_type;
            log::debug!("result {} converted to {}", result.0, expected.element_type.name());
        }

        for (param, expected) in self.parameters().into_iter().zip(input_shapes) {
            let node = self.node(param)?;
            let body_type = node.element_type;
            if body_type == expected.element_type {
                continue;
            }
            let shape = node.shape.clone();
            let consumers = self.consumers(param);
            self.node_mut(param)?.element_type = expected.element_type;
            let convert = Node { kind: NodeKind::Convert(body_type), inputs: vec![param], shape, element_type: body_type };
            let convert = self.insert_after(param, convert)?;
            for (consumer, index) in consumers {
                self.node_mut(consumer)?.inputs[index] = convert;
            }
            log::debug!("parameter {} retyped to {}", param.0, expected.element_type.name());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subgraph::SubgraphBuilder;

    fn f32_shape(shape: Vec<usize>) -> BlockedShape {
        BlockedShape::planar(shape, ElementType::F32)
    }

    #[test]
    fn test_broadcast_merge() {
        assert_eq!(broadcast_merge(&[2, 1, 16], &[3, 1]), Some(vec![2, 3, 16]));
        assert_eq!(broadcast_merge(&[], &[4]), Some(vec![4]));
        assert_eq!(broadcast_merge(&[4, 16], &[3, 16]), None);
        assert_eq!(trim_ones(&[1, 1, 8, 1]), &[8]);
        assert!(trim_ones(&[1, 1]).is_empty());
    }

    #[test]
    fn test_lower_rank_input_is_extended() {
        let mut b = SubgraphBuilder::new();
        let x = b.parameter(ElementType::F32, vec![2, 16]);
        let y = b.parameter(ElementType::F32, vec![16]);
        let sum = b.add(x, y).unwrap();
        b.result(sum).unwrap();
        let mut graph = b.build().unwrap();

        let master = graph
            .canonicalize(&[f32_shape(vec![2, 16])], &[f32_shape(vec![2, 16]), f32_shape(vec![16])])
            .unwrap();
        assert_eq!(master, vec![2, 16]);
        assert_eq!(graph.node(y).unwrap().shape, vec![1, 16]);
    }

    #[test]
    fn test_blocked_base_appends_trailing_one() {
        let mut b = SubgraphBuilder::new();
        let x = b.parameter(ElementType::F32, vec![1, 16, 4, 4]);
        let scale = b.parameter(ElementType::F32, vec![1, 16, 1, 1]);
        let prod = b.multiply(x, scale).unwrap();
        b.result(prod).unwrap();
        let mut graph = b.build().unwrap();

        let blocked = BlockedShape::new(vec![1, 2, 4, 4, 8], vec![0, 1, 2, 3, 1], ElementType::F32);
        let per_channel = f32_shape(vec![1, 2, 1, 1]);
        let master = graph.canonicalize(&[blocked.clone()], &[blocked, per_channel]).unwrap();
        assert_eq!(master, vec![1, 2, 4, 4, 8]);
        assert_eq!(graph.node(scale).unwrap().shape, vec![1, 2, 1, 1, 1]);
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let mut b = SubgraphBuilder::new();
        let x = b.parameter(ElementType::F32, vec![2, 3, 4]);
        let y = b.parameter(ElementType::F32, vec![2, 3, 4]);
        let sum = b.add(x, y).unwrap();
        b.result(sum).unwrap();
        let mut graph = b.build().unwrap();

        let permuted = BlockedShape::new(vec![2, 4, 3], vec![0, 2, 1], ElementType::F32);
        let err = graph.canonicalize(&[f32_shape(vec![2, 3, 4])], &[f32_shape(vec![2, 3, 4]), permuted]);
        assert!(matches!(err, Err(CompileError::UnsupportedLayout { .. })));

        let err = graph.canonicalize(&[f32_shape(vec![2, 3, 4])], &[f32_shape(vec![2, 3, 4])]);
        assert!(matches!(err, Err(CompileError::StructuralIr { .. })));
    }

    #[test]
    fn test_incompatible_output_shape() {
        let mut b = SubgraphBuilder::new();
        let x = b.parameter(ElementType::F32, vec![4, 16]);
        let r = b.relu(x).unwrap();
        b.result(r).unwrap();
        let mut graph = b.build().unwrap();

        let err = graph.canonicalize(&[f32_shape(vec![1, 4, 8, 1])], &[f32_shape(vec![4, 16])]);
        assert!(matches!(err, Err(CompileError::UnsupportedShape { .. })));
    }

    #[test]
    fn test_precision_alignment() {
        let mut b = SubgraphBuilder::new();
        let x = b.parameter(ElementType::F32, vec![8, 8]);
        let r = b.relu(x).unwrap();
        let out = b.result(r).unwrap();
        let mut graph = b.build().unwrap();

        let input = BlockedShape::planar(vec![8, 8], ElementType::I32);
        let output = BlockedShape::planar(vec![8, 8], ElementType::I32);
        graph.canonicalize(&[output], &[input]).unwrap();

        assert_eq!(graph.node(x).unwrap().element_type, ElementType::I32);
        let (convert_in, _) = graph.consumers(x)[0];
        assert_eq!(graph.node(convert_in).unwrap().kind, NodeKind::Convert(ElementType::F32));
        assert_eq!(graph.node(r).unwrap().inputs, vec![convert_in]);

        let convert_out = graph.node(out).unwrap().inputs[0];
        assert_eq!(graph.node(convert_out).unwrap().kind, NodeKind::Convert(ElementType::I32));
        assert_eq!(graph.node(out).unwrap().element_type, ElementType::I32);
    }
}
