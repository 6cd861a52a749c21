// This module defines the value-level vocabulary of the Linear IR: element types, port descriptors
// carrying the physical shape, planar-to-physical layout and per-dimension subtensor of every
// expression port, the memory access descriptors of load/store-like operations, and the closed set
// of operation kinds (OpKind) together with their stable emitter lookup tags (OpType) and register
// class transitions (RegType). Dimension indices used by loops count from the innermost planar
// dimension, so dim 0 is the last planar axis.

//! Operation kinds, port descriptors and register class transitions.

use std::fmt;

/// Subtensor sentinel: the whole dimension is processed per iteration.
pub const FULL_DIM: usize = usize::MAX;

/// Tensor element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32,
    I32,
    BF16,
    F16,
    I8,
    U8,
}

impl ElementType {
    /// Size in bytes.
    pub fn size(self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::BF16 | ElementType::F16 => 2,
            ElementType::I8 | ElementType::U8 => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::I32 => "i32",
            ElementType::BF16 => "bf16",
            ElementType::F16 => "f16",
            ElementType::I8 => "i8",
            ElementType::U8 => "u8",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape, layout and subtensor of one expression port.
///
/// `shape` is the physical (memory order) shape. `layout[p]` is the physical
/// dimension walked by planar dimension `p`; an empty layout is planar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub shape: Vec<usize>,
    pub layout: Vec<usize>,
    /// Block processed per iteration, per planar dimension.
    pub subtensor: Vec<usize>,
    pub element_type: ElementType,
}

impl PortDescriptor {
    pub fn new(shape: Vec<usize>, element_type: ElementType) -> Self {
        let subtensor = vec![FULL_DIM; shape.len()];
        Self { shape, layout: Vec::new(), subtensor, element_type }
    }

    pub fn with_layout(mut self, layout: Vec<usize>) -> Self {
        self.layout = if layout.iter().enumerate().all(|(i, &l)| i == l) { Vec::new() } else { layout };
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_planar(&self) -> bool {
        self.layout.is_empty()
    }

    /// Physical dimension walked by planar dimension `p`.
    pub fn physical_dim(&self, p: usize) -> usize {
        if self.layout.is_empty() {
            p
        } else {
            self.layout[p]
        }
    }

    /// Shape in logical (planar) order.
    pub fn planar_shape(&self) -> Vec<usize> {
        (0..self.rank()).map(|p| self.shape[self.physical_dim(p)]).collect()
    }

    /// Planar dimension `dim_idx` counted from the innermost one, 1 when out of rank.
    pub fn planar_dim(&self, dim_idx: usize) -> usize {
        if dim_idx >= self.rank() {
            return 1;
        }
        self.shape[self.physical_dim(self.rank() - 1 - dim_idx)]
    }

    /// Element stride of planar dimension `dim_idx` (counted from the innermost).
    pub fn stride(&self, dim_idx: usize) -> usize {
        if dim_idx >= self.rank() {
            return 0;
        }
        let phys = self.physical_dim(self.rank() - 1 - dim_idx);
        self.shape[phys + 1..].iter().product()
    }

    pub fn subtensor_dim(&self, dim_idx: usize) -> usize {
        if dim_idx >= self.subtensor.len() {
            return FULL_DIM;
        }
        self.subtensor[self.subtensor.len() - 1 - dim_idx]
    }

    /// Effective block along `dim_idx`: the subtensor clamped to the planar dimension.
    pub fn block_dim(&self, dim_idx: usize) -> usize {
        self.subtensor_dim(dim_idx).min(self.planar_dim(dim_idx))
    }

    pub fn set_subtensor_dim(&mut self, dim_idx: usize, value: usize) {
        if self.subtensor.len() != self.rank() {
            self.subtensor = vec![FULL_DIM; self.rank()];
        }
        if dim_idx < self.subtensor.len() {
            let pos = self.subtensor.len() - 1 - dim_idx;
            self.subtensor[pos] = value;
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.element_count() * self.element_type.size()
    }
}

/// Per-port memory access parameters: elements moved per access and byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryAccess {
    pub count: usize,
    pub offset: usize,
}

impl MemoryAccess {
    pub fn new(count: usize) -> Self {
        Self { count, offset: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EltwiseKind {
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    Relu,
    Negative,
    Fma,
}

impl EltwiseKind {
    pub fn arity(self) -> usize {
        match self {
            EltwiseKind::Relu | EltwiseKind::Negative => 1,
            EltwiseKind::Fma => 3,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Scratch memory with an explicit shape.
    NewMemory,
    /// Staging area between two non-fusible operations; exactly one producer.
    IntermediateMemory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferData {
    pub kind: BufferKind,
    pub byte_size: usize,
    /// Buffers sharing an id share one data pointer.
    pub id: usize,
    /// Scratchpad offset once allocated.
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrgemmData {
    pub a: MemoryAccess,
    pub b: MemoryAccess,
    pub c: MemoryAccess,
    /// Scale of the existing C contents: 0 overwrites, 1 accumulates.
    pub beta: f32,
}

/// Runtime parameters of a loop, carried by its LoopEnd marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopEndData {
    pub loop_id: usize,
    pub work_amount: usize,
    pub increment: usize,
    /// Element stride per loop unit, one per data pointer input.
    pub ptr_increments: Vec<i64>,
    /// Element offsets applied once after the loop exits.
    pub finalization_offsets: Vec<i64>,
    pub data_sizes: Vec<usize>,
    pub evaluate_once: bool,
    pub has_outer_loop: bool,
    /// Another part of the same split loop follows this one.
    pub followed_by_split: bool,
}

/// Closed set of Linear IR operations.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Parameter { index: usize },
    Result { index: usize },
    Buffer(BufferData),
    Load(MemoryAccess),
    /// Load walking the input through a permuted layout.
    LoadReshape { access: MemoryAccess, order: Vec<usize> },
    BroadcastLoad(MemoryAccess),
    Store(MemoryAccess),
    BroadcastMove,
    Scalar(f32),
    Convert(ElementType),
    Eltwise(EltwiseKind),
    Brgemm(BrgemmData),
    LoopBegin { loop_id: usize },
    LoopEnd(LoopEndData),
}

impl OpKind {
    pub fn op_type(&self) -> OpType {
        match self {
            OpKind::Parameter { .. } => OpType::Parameter,
            OpKind::Result { .. } => OpType::Result,
            OpKind::Buffer(_) => OpType::Buffer,
            OpKind::Load(_) => OpType::Load,
            OpKind::LoadReshape { .. } => OpType::LoadReshape,
            OpKind::BroadcastLoad(_) => OpType::BroadcastLoad,
            OpKind::Store(_) => OpType::Store,
            OpKind::BroadcastMove => OpType::BroadcastMove,
            OpKind::Scalar(_) => OpType::Scalar,
            OpKind::Convert(_) => OpType::Convert,
            OpKind::Eltwise(kind) => match kind {
                EltwiseKind::Add => OpType::Add,
                EltwiseKind::Subtract => OpType::Subtract,
                EltwiseKind::Multiply => OpType::Multiply,
                EltwiseKind::Divide => OpType::Divide,
                EltwiseKind::Maximum => OpType::Maximum,
                EltwiseKind::Minimum => OpType::Minimum,
                EltwiseKind::Relu => OpType::Relu,
                EltwiseKind::Negative => OpType::Negative,
                EltwiseKind::Fma => OpType::Fma,
            },
            OpKind::Brgemm(_) => OpType::Brgemm,
            OpKind::LoopBegin { .. } => OpType::LoopBegin,
            OpKind::LoopEnd(_) => OpType::LoopEnd,
        }
    }

    /// Register class transition of this operation.
    pub fn reg_type(&self) -> RegType {
        match self {
            OpKind::Parameter { .. }
            | OpKind::Result { .. }
            | OpKind::Buffer(_)
            | OpKind::LoopBegin { .. }
            | OpKind::LoopEnd(_)
            | OpKind::Brgemm(_) => RegType::Gpr2Gpr,
            OpKind::Load(_) | OpKind::LoadReshape { .. } | OpKind::BroadcastLoad(_) => RegType::Gpr2Vec,
            OpKind::Store(_) => RegType::Vec2Gpr,
            OpKind::BroadcastMove | OpKind::Scalar(_) | OpKind::Convert(_) | OpKind::Eltwise(_) => {
                RegType::Vec2Vec
            }
        }
    }

    pub fn is_loop_marker(&self) -> bool {
        matches!(self, OpKind::LoopBegin { .. } | OpKind::LoopEnd(_))
    }

    /// Operations that stay outside generated loops.
    pub fn is_io(&self) -> bool {
        matches!(self, OpKind::Parameter { .. } | OpKind::Result { .. } | OpKind::Buffer(_))
    }

    pub fn input_access(&self, index: usize) -> Option<&MemoryAccess> {
        match (self, index) {
            (OpKind::Load(access), 0)
            | (OpKind::LoadReshape { access, .. }, 0)
            | (OpKind::BroadcastLoad(access), 0) => Some(access),
            (OpKind::Brgemm(data), 0) => Some(&data.a),
            (OpKind::Brgemm(data), 1) => Some(&data.b),
            _ => None,
        }
    }

    pub fn input_access_mut(&mut self, index: usize) -> Option<&mut MemoryAccess> {
        match (self, index) {
            (OpKind::Load(access), 0)
            | (OpKind::LoadReshape { access, .. }, 0)
            | (OpKind::BroadcastLoad(access), 0) => Some(access),
            (OpKind::Brgemm(data), 0) => Some(&mut data.a),
            (OpKind::Brgemm(data), 1) => Some(&mut data.b),
            _ => None,
        }
    }

    pub fn output_access(&self, index: usize) -> Option<&MemoryAccess> {
        match (self, index) {
            (OpKind::Store(access), 0) => Some(access),
            (OpKind::Brgemm(data), 0) => Some(&data.c),
            _ => None,
        }
    }

    pub fn output_access_mut(&mut self, index: usize) -> Option<&mut MemoryAccess> {
        match (self, index) {
            (OpKind::Store(access), 0) => Some(access),
            (OpKind::Brgemm(data), 0) => Some(&mut data.c),
            _ => None,
        }
    }
}

/// Stable type tag used to look up emitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpType {
    Parameter,
    Result,
    Buffer,
    Load,
    LoadReshape,
    BroadcastLoad,
    Store,
    BroadcastMove,
    Scalar,
    Convert,
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    Relu,
    Negative,
    Fma,
    Brgemm,
    LoopBegin,
    LoopEnd,
    Kernel,
}

impl OpType {
    /// Every expression tag; [`OpType::Kernel`] is not one.
    pub const ALL: [OpType; 22] = [
        OpType::Parameter,
        OpType::Result,
        OpType::Buffer,
        OpType::Load,
        OpType::LoadReshape,
        OpType::BroadcastLoad,
        OpType::Store,
        OpType::BroadcastMove,
        OpType::Scalar,
        OpType::Convert,
        OpType::Add,
        OpType::Subtract,
        OpType::Multiply,
        OpType::Divide,
        OpType::Maximum,
        OpType::Minimum,
        OpType::Relu,
        OpType::Negative,
        OpType::Fma,
        OpType::Brgemm,
        OpType::LoopBegin,
        OpType::LoopEnd,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OpType::Parameter => "Parameter",
            OpType::Result => "Result",
            OpType::Buffer => "Buffer",
            OpType::Load => "Load",
            OpType::LoadReshape => "LoadReshape",
            OpType::BroadcastLoad => "BroadcastLoad",
            OpType::Store => "Store",
            OpType::BroadcastMove => "BroadcastMove",
            OpType::Scalar => "Scalar",
            OpType::Convert => "Convert",
            OpType::Add => "Add",
            OpType::Subtract => "Subtract",
            OpType::Multiply => "Multiply",
            OpType::Divide => "Divide",
            OpType::Maximum => "Maximum",
            OpType::Minimum => "Minimum",
            OpType::Relu => "Relu",
            OpType::Negative => "Negative",
            OpType::Fma => "Fma",
            OpType::Brgemm => "Brgemm",
            OpType::LoopBegin => "LoopBegin",
            OpType::LoopEnd => "LoopEnd",
            OpType::Kernel => "Kernel",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Register class transition of an operation (input class to output class).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegType {
    Gpr2Gpr,
    Gpr2Vec,
    Vec2Gpr,
    Vec2Vec,
}

impl RegType {
    pub fn input_class(self) -> crate::core::register_file::RegClass {
        use crate::core::register_file::RegClass;
        match self {
            RegType::Gpr2Gpr | RegType::Gpr2Vec => RegClass::Gpr,
            RegType::Vec2Gpr | RegType::Vec2Vec => RegClass::Vec,
        }
    }

    pub fn output_class(self) -> crate::core::register_file::RegClass {
        use crate::core::register_file::RegClass;
        match self {
            RegType::Gpr2Gpr | RegType::Vec2Gpr => RegClass::Gpr,
            RegType::Gpr2Vec | RegType::Vec2Vec => RegClass::Vec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planar_and_strides() {
        let desc = PortDescriptor::new(vec![2, 3, 4], ElementType::F32);
        assert_eq!(desc.planar_dim(0), 4);
        assert_eq!(desc.planar_dim(2), 2);
        assert_eq!(desc.planar_dim(5), 1);
        assert_eq!(desc.stride(0), 1);
        assert_eq!(desc.stride(1), 4);
        assert_eq!(desc.stride(2), 12);
        assert_eq!(desc.byte_size(), 96);
    }

    #[test]
    fn test_permuted_layout() {
        // Planar [2, 4, 3] viewed over a physical [2, 3, 4] tensor.
        let desc = PortDescriptor::new(vec![2, 3, 4], ElementType::F32).with_layout(vec![0, 2, 1]);
        assert_eq!(desc.planar_shape(), vec![2, 4, 3]);
        assert_eq!(desc.planar_dim(0), 3);
        assert_eq!(desc.stride(0), 4);
        assert_eq!(desc.stride(1), 1);

        let planar = PortDescriptor::new(vec![1, 2], ElementType::F32).with_layout(vec![0, 1]);
        assert!(planar.is_planar());
    }

    #[test]
    fn test_subtensor_blocks() {
        let mut desc = PortDescriptor::new(vec![100, 64], ElementType::F32);
        assert_eq!(desc.block_dim(1), 100);
        desc.set_subtensor_dim(1, 32);
        assert_eq!(desc.subtensor, vec![32, FULL_DIM]);
        assert_eq!(desc.block_dim(1), 32);
        assert_eq!(desc.block_dim(0), 64);
    }

    #[test]
    fn test_reg_types() {
        assert_eq!(OpKind::Load(MemoryAccess::new(8)).reg_type(), RegType::Gpr2Vec);
        assert_eq!(OpKind::Store(MemoryAccess::new(8)).reg_type(), RegType::Vec2Gpr);
        assert_eq!(OpKind::Eltwise(EltwiseKind::Add).reg_type(), RegType::Vec2Vec);
        assert_eq!(OpKind::LoopBegin { loop_id: 0 }.reg_type(), RegType::Gpr2Gpr);
        assert_eq!(OpKind::Eltwise(EltwiseKind::Fma).op_type(), OpType::Fma);
    }
}
