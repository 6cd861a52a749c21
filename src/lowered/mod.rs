// This module holds the Linear IR: the ordered, loop-annotated sequence of expressions a snippet is
// lowered through after dialect conversion. Expressions own their port descriptors, loop id lists and
// register info as first-class fields; the loop registry lives next to them in the Loop Manager.
// Every lowering step, from loop marking to the final specific-iteration split, is a pass over this
// one structure.

//! Linear IR, Loop Manager and lowering passes.
//!
//! # Key Components
//!
//! ## Types (`types`)
//! - Port descriptors with layout and subtensor
//! - The closed set of operation kinds and their emitter tags
//!
//! ## Linear IR (`linear_ir`, `expression`)
//! - Arena of expressions addressed by [`ExprId`] plus a separate program order
//! - Structural primitives: insert, move, erase, deep copy of a range
//!
//! ## Loop Manager (`loop_manager`)
//! - [`LoopInfo`] registry with entry/exit ports and specific-iteration handlers
//!
//! ## Passes (`pass`)
//! - Loop marking, brgemm blocking, loop insertion, buffer ids and offsets,
//!   register assignment and tail splitting

pub mod expression;
pub mod linear_ir;
pub mod loop_manager;
pub mod pass;
pub mod types;

pub use expression::{ExprId, ExprPort, Expression, Input, OutputRef, PortKind};
pub use linear_ir::LinearIR;
pub use loop_manager::{LoopInfo, LoopManager, LoopPort, SpecificIteration};
pub use types::{
    BrgemmData, BufferData, BufferKind, ElementType, EltwiseKind, LoopEndData, MemoryAccess, OpKind, OpType,
    PortDescriptor, RegType, FULL_DIM,
};
