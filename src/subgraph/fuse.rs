//! Multiply+Add fusion into Fma.
//!
//! `Add(Multiply(a, b), c)` becomes `Fma(a, b, c)` when the Add is the only
//! consumer of the Multiply. Either Add operand may be the product.

use crate::core::error::CompileResult;
use crate::lowered::types::EltwiseKind;
use crate::subgraph::{NodeId, NodeKind, Subgraph};

fn is_multiply(graph: &Subgraph, id: NodeId) -> bool {
    graph.node(id).is_ok_and(|n| n.kind == NodeKind::Eltwise(EltwiseKind::Multiply))
}

/// Returns the number of fused pairs.
pub fn mul_add_to_fma(graph: &mut Subgraph) -> CompileResult<usize> {
    let adds: Vec<NodeId> = graph
        .iter()
        .filter(|(_, node)| node.kind == NodeKind::Eltwise(EltwiseKind::Add))
        .map(|(id, _)| id)
        .collect();

    let mut fused = 0;
    for add in adds {
        let inputs = graph.node(add)?.inputs.clone();
        let Some(slot) = (0..inputs.len())
            .find(|&i| is_multiply(graph, inputs[i]) && graph.consumers(inputs[i]).len() == 1)
        else {
            continue;
        };
        let multiply = inputs[slot];
        let addend = inputs[1 - slot];
        let factors = graph.node(multiply)?.inputs.clone();

        let node = graph.node_mut(add)?;
        node.kind = NodeKind::Eltwise(EltwiseKind::Fma);
        node.inputs = factors.into_iter().chain([addend]).collect();
        graph.remove(multiply)?;
        fused += 1;
        log::trace!("fused multiply {} into fma {}", multiply.0, add.0);
    }
    if fused > 0 {
        log::debug!("MulAddToFma fused {fused} pairs");
    }
    Ok(fused)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowered::types::ElementType;
    use crate::subgraph::SubgraphBuilder;

    #[test]
    fn test_fuses_either_operand_order() {
        let mut b = SubgraphBuilder::new();
        let x = b.parameter(ElementType::F32, vec![4, 16]);
        let y = b.parameter(ElementType::F32, vec![4, 16]);
        let z = b.parameter(ElementType::F32, vec![4, 16]);
        let prod = b.multiply(x, y).unwrap();
        let sum = b.add(z, prod).unwrap();
        b.result(sum).unwrap();
        let mut graph = b.build().unwrap();

        assert_eq!(mul_add_to_fma(&mut graph).unwrap(), 1);
        let fma = graph.node(sum).unwrap();
        assert_eq!(fma.kind, NodeKind::Eltwise(EltwiseKind::Fma));
        assert_eq!(fma.inputs, vec![x, y, z]);
        assert!(graph.node(prod).is_err());
    }

    #[test]
    fn test_shared_product_is_kept() {
        let mut b = SubgraphBuilder::new();
        let x = b.parameter(ElementType::F32, vec![16]);
        let y = b.parameter(ElementType::F32, vec![16]);
        let prod = b.multiply(x, y).unwrap();
        let sum = b.add(prod, y).unwrap();
        b.result(sum).unwrap();
        b.result(prod).unwrap();
        let mut graph = b.build().unwrap();

        assert_eq!(mul_add_to_fma(&mut graph).unwrap(), 0);
        assert_eq!(graph.node(sum).unwrap().kind, NodeKind::Eltwise(EltwiseKind::Add));
    }
}
