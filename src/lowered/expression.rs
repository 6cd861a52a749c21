//! Linear IR expressions and port handles.

use crate::core::register_file::{Reg, RegInfo};
use crate::lowered::types::{OpKind, OpType, PortDescriptor};

/// Stable handle of an expression in the Linear IR arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub usize);

/// Output `index` of expression `expr`: the value an input consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    pub expr: ExprId,
    pub index: usize,
}

impl OutputRef {
    pub fn new(expr: ExprId, index: usize) -> Self {
        Self { expr, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortKind {
    Input,
    Output,
}

/// One input or output port of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprPort {
    pub expr: ExprId,
    pub kind: PortKind,
    pub index: usize,
}

impl ExprPort {
    pub fn input(expr: ExprId, index: usize) -> Self {
        Self { expr, kind: PortKind::Input, index }
    }

    pub fn output(expr: ExprId, index: usize) -> Self {
        Self { expr, kind: PortKind::Output, index }
    }

    pub fn with_expr(self, expr: ExprId) -> Self {
        Self { expr, ..self }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub source: OutputRef,
    pub desc: PortDescriptor,
}

/// One operation instance of the Linear IR.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub kind: OpKind,
    pub inputs: Vec<Input>,
    pub outputs: Vec<PortDescriptor>,
    /// Loops this expression is nested in, outermost first.
    pub loop_ids: Vec<usize>,
    pub reg_info: RegInfo,
    /// Abstract registers live across this expression.
    pub live_regs: Vec<Reg>,
}

impl Expression {
    pub fn new(kind: OpKind, inputs: Vec<Input>, outputs: Vec<PortDescriptor>) -> Self {
        Self {
            kind,
            inputs,
            outputs,
            loop_ids: Vec::new(),
            reg_info: RegInfo::default(),
            live_regs: Vec::new(),
        }
    }

    pub fn op_type(&self) -> OpType {
        self.kind.op_type()
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn port_desc(&self, port: &ExprPort) -> Option<&PortDescriptor> {
        match port.kind {
            PortKind::Input => self.inputs.get(port.index).map(|i| &i.desc),
            PortKind::Output => self.outputs.get(port.index),
        }
    }

    pub fn port_desc_mut(&mut self, port: &ExprPort) -> Option<&mut PortDescriptor> {
        match port.kind {
            PortKind::Input => self.inputs.get_mut(port.index).map(|i| &mut i.desc),
            PortKind::Output => self.outputs.get_mut(port.index),
        }
    }

    pub fn is_loop_marker(&self) -> bool {
        self.kind.is_loop_marker()
    }

    /// Innermost loop of this expression.
    pub fn innermost_loop(&self) -> Option<usize> {
        self.loop_ids.last().copied()
    }
}
