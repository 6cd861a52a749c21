// This module provides the x86-64 instruction encoding used by the snippet emitters, built on the
// iced-x86 code assembler. X64Encoder converts AsmReg register references into iced registers and
// exposes one method per instruction form the kernels need: 64-bit integer moves and arithmetic
// for data pointers and loop counters, AVX2 packed single precision arithmetic, full, scalar and
// masked vector memory accesses, broadcasts, conversions and FMA. Labels are keyed by loop id so a
// LoopBegin can place its label and the matching LoopEnd can branch back to it. Masked accesses
// read their lane mask from constant tables that are appended after the code, one table per
// distinct lane count. rax and ymm15 are reserved as scratch and never handed to the register
// allocator.

//! x86-64 instruction encoding using iced-x86.

use crate::core::error::CompileError;
use crate::core::register_file::AsmReg;
use iced_x86::code_asm::*;
use iced_x86::IcedError;
use std::collections::{HashMap, HashSet};

/// Lanes of one ymm register holding f32 or i32 values.
pub const VECTOR_LANES: usize = 8;

/// Scratch general purpose register (rax).
pub const SCRATCH_GPR: AsmReg = AsmReg::gpr(0);
/// Stack pointer (rsp).
pub const STACK_POINTER: AsmReg = AsmReg::gpr(4);
/// Scratch vector register (ymm15).
pub const SCRATCH_VEC: AsmReg = AsmReg::vec(15);

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    InvalidRegister,
    /// Unsupported instruction or operand combination.
    UnsupportedInstruction,
    /// Assembly error from iced-x86.
    AssemblyError(String),
    /// Immediate or displacement does not fit the instruction encoding.
    ImmediateOutOfRange(i64),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister => write!(f, "Invalid register for operation"),
            EncodingError::UnsupportedInstruction => {
                write!(f, "Unsupported instruction or operand combination")
            }
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::ImmediateOutOfRange(value) => {
                write!(f, "Immediate {value} does not fit in 32 bits")
            }
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for CompileError {
    fn from(err: EncodingError) -> Self {
        CompileError::target(err.to_string())
    }
}

fn assembly_error(e: IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

/// Narrow a displacement or immediate to the 32-bit form x86-64 encodes.
pub fn imm32(value: i64) -> Result<i32, EncodingError> {
    i32::try_from(value).map_err(|_| EncodingError::ImmediateOutOfRange(value))
}

/// Packed single precision binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

/// Jump conditions for conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    NotEqual,
    Greater,
    GreaterEqual,
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    /// Code assembler for generating instructions.
    assembler: CodeAssembler,
    /// Address the code is assembled at; everything emitted is position independent.
    position: u64,
    /// Back-branch targets keyed by loop id.
    loop_labels: HashMap<usize, CodeLabel>,
    /// Track which loop labels have been placed.
    placed_loops: HashSet<usize>,
    /// Lane mask tables keyed by active lane count.
    mask_labels: HashMap<usize, CodeLabel>,
    placed_masks: HashSet<usize>,
}

impl X64Encoder {
    /// Create a new x86-64 encoder.
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(assembly_error)?;

        Ok(Self {
            assembler,
            position: 0,
            loop_labels: HashMap::new(),
            placed_loops: HashSet::new(),
            mask_labels: HashMap::new(),
            placed_masks: HashSet::new(),
        })
    }

    /// Convert AsmReg to iced-x86 64-bit GP register.
    fn to_gp64_register(&self, reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
        if reg.bank != 0 {
            return Err(EncodingError::InvalidRegister);
        }

        const GP64_REGS: [AsmRegister64; 16] = [
            rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
            r8, r9, r10, r11, r12, r13, r14, r15,
        ];

        GP64_REGS.get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    /// Convert AsmReg to iced-x86 32-bit GP register.
    fn to_gp32_register(&self, reg: AsmReg) -> Result<AsmRegister32, EncodingError> {
        if reg.bank != 0 {
            return Err(EncodingError::InvalidRegister);
        }

        const GP32_REGS: [AsmRegister32; 16] = [
            eax, ecx, edx, ebx, esp, ebp, esi, edi,
            r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
        ];

        GP32_REGS.get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    /// Convert AsmReg to iced-x86 YMM register.
    fn to_ymm_register(&self, reg: AsmReg) -> Result<AsmRegisterYmm, EncodingError> {
        if reg.bank != 1 {
            return Err(EncodingError::InvalidRegister);
        }

        const YMM_REGS: [AsmRegisterYmm; 16] = [
            ymm0, ymm1, ymm2, ymm3, ymm4, ymm5, ymm6, ymm7,
            ymm8, ymm9, ymm10, ymm11, ymm12, ymm13, ymm14, ymm15,
        ];

        YMM_REGS.get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    /// Convert AsmReg to the XMM view of a vector register.
    fn to_xmm_register(&self, reg: AsmReg) -> Result<AsmRegisterXmm, EncodingError> {
        if reg.bank != 1 {
            return Err(EncodingError::InvalidRegister);
        }

        const XMM_REGS: [AsmRegisterXmm; 16] = [
            xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7,
            xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14, xmm15,
        ];

        XMM_REGS.get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    // ==== GENERAL PURPOSE INSTRUCTIONS ====

    /// Emit MOV instruction - register to register.
    pub fn mov_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp64_register(src)?;

        self.assembler.mov(dst_reg, src_reg).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit MOV instruction - immediate to register.
    pub fn mov_reg_imm(&mut self, dst: AsmReg, imm: i64) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;

        // iced-x86 mov with immediate requires i64 for 64-bit registers
        self.assembler.mov(dst_reg, imm).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit MOV instruction - 32-bit immediate, zero extended into the full register.
    pub fn mov32_reg_imm(&mut self, dst: AsmReg, imm: u32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp32_register(dst)?;

        self.assembler.mov(dst_reg, imm).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit MOV instruction - memory to register.
    pub fn mov_reg_mem(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let base_reg = self.to_gp64_register(base)?;

        self.assembler.mov(dst_reg, qword_ptr(base_reg + offset)).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit ADD instruction - register to register.
    pub fn add_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp64_register(src)?;

        self.assembler.add(dst_reg, src_reg).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit ADD instruction - immediate to register.
    pub fn add_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;

        self.assembler.add(dst_reg, imm).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit SUB instruction - immediate from register.
    pub fn sub_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;

        self.assembler.sub(dst_reg, imm).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit three operand IMUL: `dst = src * imm`.
    pub fn imul_reg_imm(&mut self, dst: AsmReg, src: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp64_register(src)?;

        self.assembler.imul_3(dst_reg, src_reg, imm).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit XOR instruction on the 32-bit views (clears the full register).
    pub fn xor32_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp32_register(dst)?;
        let src_reg = self.to_gp32_register(src)?;

        self.assembler.xor(dst_reg, src_reg).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit CMP instruction - register with immediate.
    pub fn cmp_reg_imm(&mut self, reg: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let reg_val = self.to_gp64_register(reg)?;

        self.assembler.cmp(reg_val, imm).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit PUSH instruction.
    pub fn push_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let reg_val = self.to_gp64_register(reg)?;

        self.assembler.push(reg_val).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit POP instruction.
    pub fn pop_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let reg_val = self.to_gp64_register(reg)?;

        self.assembler.pop(reg_val).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit CALL instruction - indirect through register.
    pub fn call_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let reg_val = self.to_gp64_register(reg)?;

        self.assembler.call(reg_val).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit RET instruction.
    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler.ret().map_err(assembly_error)?;
        Ok(())
    }

    // ==== VECTOR MEMORY ACCESS ====

    /// Emit VMOVUPS - full vector load.
    pub fn vmovups_load(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_ymm_register(dst)?;
        let base_reg = self.to_gp64_register(base)?;

        self.assembler.vmovups(dst_reg, ymmword_ptr(base_reg + offset)).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit VMOVUPS - full vector store.
    pub fn vmovups_store(&mut self, base: AsmReg, offset: i32, src: AsmReg) -> Result<(), EncodingError> {
        let base_reg = self.to_gp64_register(base)?;
        let src_reg = self.to_ymm_register(src)?;

        self.assembler.vmovups(ymmword_ptr(base_reg + offset), src_reg).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit VMOVSS - single element load, upper lanes zeroed.
    pub fn vmovss_load(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_xmm_register(dst)?;
        let base_reg = self.to_gp64_register(base)?;

        self.assembler.vmovss(dst_reg, dword_ptr(base_reg + offset)).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit VMOVSS - single element store.
    pub fn vmovss_store(&mut self, base: AsmReg, offset: i32, src: AsmReg) -> Result<(), EncodingError> {
        let base_reg = self.to_gp64_register(base)?;
        let src_reg = self.to_xmm_register(src)?;

        self.assembler.vmovss(dword_ptr(base_reg + offset), src_reg).map_err(assembly_error)?;
        Ok(())
    }

    /// Load the lane mask selecting the first `count` lanes into `dst`.
    pub fn load_lane_mask(&mut self, dst: AsmReg, count: usize) -> Result<(), EncodingError> {
        let dst_reg = self.to_ymm_register(dst)?;
        let label = self.mask_label(count);

        self.assembler.vmovups(dst_reg, ymmword_ptr(label)).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit VMASKMOVPS - masked load, inactive lanes zeroed.
    pub fn vmaskmovps_load(
        &mut self,
        dst: AsmReg,
        mask: AsmReg,
        base: AsmReg,
        offset: i32,
    ) -> Result<(), EncodingError> {
        let dst_reg = self.to_ymm_register(dst)?;
        let mask_reg = self.to_ymm_register(mask)?;
        let base_reg = self.to_gp64_register(base)?;

        self.assembler
            .vmaskmovps(dst_reg, mask_reg, ymmword_ptr(base_reg + offset))
            .map_err(assembly_error)?;
        Ok(())
    }

    /// Emit VMASKMOVPS - masked store, inactive lanes untouched.
    pub fn vmaskmovps_store(
        &mut self,
        base: AsmReg,
        offset: i32,
        mask: AsmReg,
        src: AsmReg,
    ) -> Result<(), EncodingError> {
        let base_reg = self.to_gp64_register(base)?;
        let mask_reg = self.to_ymm_register(mask)?;
        let src_reg = self.to_ymm_register(src)?;

        self.assembler
            .vmaskmovps(ymmword_ptr(base_reg + offset), mask_reg, src_reg)
            .map_err(assembly_error)?;
        Ok(())
    }

    /// Emit VBROADCASTSS - one element from memory into every lane.
    pub fn vbroadcastss_mem(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_ymm_register(dst)?;
        let base_reg = self.to_gp64_register(base)?;

        self.assembler.vbroadcastss(dst_reg, dword_ptr(base_reg + offset)).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit VBROADCASTSS - lane 0 of `src` into every lane of `dst`.
    pub fn vbroadcastss_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_ymm_register(dst)?;
        let src_reg = self.to_xmm_register(src)?;

        self.assembler.vbroadcastss(dst_reg, src_reg).map_err(assembly_error)?;
        Ok(())
    }

    // ==== VECTOR ARITHMETIC ====

    /// Emit VMOVD - low 32 bits of a GP register into lane 0.
    pub fn vmovd_from_gp(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_xmm_register(dst)?;
        let src_reg = self.to_gp32_register(src)?;

        self.assembler.vmovd(dst_reg, src_reg).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit VMOVAPS - register to register.
    pub fn vmovaps(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_ymm_register(dst)?;
        let src_reg = self.to_ymm_register(src)?;

        self.assembler.vmovaps(dst_reg, src_reg).map_err(assembly_error)?;
        Ok(())
    }

    /// Zero a vector register.
    pub fn vzero(&mut self, dst: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_ymm_register(dst)?;

        self.assembler.vxorps(dst_reg, dst_reg, dst_reg).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit a packed single precision binary operation `dst = lhs op rhs`.
    pub fn vec_binary(&mut self, op: VecBinOp, dst: AsmReg, lhs: AsmReg, rhs: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_ymm_register(dst)?;
        let lhs_reg = self.to_ymm_register(lhs)?;
        let rhs_reg = self.to_ymm_register(rhs)?;

        match op {
            VecBinOp::Add => self.assembler.vaddps(dst_reg, lhs_reg, rhs_reg),
            VecBinOp::Sub => self.assembler.vsubps(dst_reg, lhs_reg, rhs_reg),
            VecBinOp::Mul => self.assembler.vmulps(dst_reg, lhs_reg, rhs_reg),
            VecBinOp::Div => self.assembler.vdivps(dst_reg, lhs_reg, rhs_reg),
            VecBinOp::Max => self.assembler.vmaxps(dst_reg, lhs_reg, rhs_reg),
            VecBinOp::Min => self.assembler.vminps(dst_reg, lhs_reg, rhs_reg),
        }
        .map_err(assembly_error)?;
        Ok(())
    }

    /// Emit VFMADD231PS: `dst = a * b + dst`.
    pub fn vfmadd231ps(&mut self, dst: AsmReg, a: AsmReg, b: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_ymm_register(dst)?;
        let a_reg = self.to_ymm_register(a)?;
        let b_reg = self.to_ymm_register(b)?;

        self.assembler.vfmadd231ps(dst_reg, a_reg, b_reg).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit VCVTTPS2DQ - f32 to i32 with truncation.
    pub fn vcvttps2dq(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_ymm_register(dst)?;
        let src_reg = self.to_ymm_register(src)?;

        self.assembler.vcvttps2dq(dst_reg, src_reg).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit VCVTDQ2PS - i32 to f32.
    pub fn vcvtdq2ps(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_ymm_register(dst)?;
        let src_reg = self.to_ymm_register(src)?;

        self.assembler.vcvtdq2ps(dst_reg, src_reg).map_err(assembly_error)?;
        Ok(())
    }

    /// Emit VZEROUPPER.
    pub fn vzeroupper(&mut self) -> Result<(), EncodingError> {
        self.assembler.vzeroupper().map_err(assembly_error)?;
        Ok(())
    }

    // ==== LABEL MANAGEMENT FOR CONTROL FLOW ====

    /// Create or get the back-branch label of a loop.
    pub fn get_or_create_label_for_loop(&mut self, loop_id: usize) -> CodeLabel {
        if let Some(&label) = self.loop_labels.get(&loop_id) {
            label
        } else {
            let label = self.assembler.create_label();
            self.loop_labels.insert(loop_id, label);
            label
        }
    }

    /// Place the label of a loop at the current position.
    pub fn place_label_for_loop(&mut self, loop_id: usize) -> Result<(), EncodingError> {
        let mut label = self.get_or_create_label_for_loop(loop_id);
        self.assembler.set_label(&mut label).map_err(assembly_error)?;
        self.placed_loops.insert(loop_id);
        Ok(())
    }

    /// Check if a loop label has been placed.
    pub fn is_loop_placed(&self, loop_id: usize) -> bool {
        self.placed_loops.contains(&loop_id)
    }

    /// Emit conditional jump to the label of a loop.
    pub fn jmp_conditional_to_loop(&mut self, condition: JumpCondition, loop_id: usize) -> Result<(), EncodingError> {
        let label = self.get_or_create_label_for_loop(loop_id);

        match condition {
            JumpCondition::NotEqual => self.assembler.jne(label),
            JumpCondition::Greater => self.assembler.jg(label),
            JumpCondition::GreaterEqual => self.assembler.jge(label),
        }
        .map_err(assembly_error)?;
        Ok(())
    }

    // ==== CONSTANT DATA ====

    fn mask_label(&mut self, count: usize) -> CodeLabel {
        if let Some(&label) = self.mask_labels.get(&count) {
            label
        } else {
            let label = self.assembler.create_label();
            self.mask_labels.insert(count, label);
            label
        }
    }

    /// Append the lane mask table for `count` active lanes unless it is already placed.
    pub fn place_lane_mask(&mut self, count: usize) -> Result<(), EncodingError> {
        if count == 0 || count > VECTOR_LANES {
            return Err(EncodingError::UnsupportedInstruction);
        }
        if self.placed_masks.contains(&count) {
            return Ok(());
        }
        let mut label = self.mask_label(count);
        self.assembler.set_label(&mut label).map_err(assembly_error)?;
        let table: Vec<u32> = (0..VECTOR_LANES).map(|lane| if lane < count { u32::MAX } else { 0 }).collect();
        self.assembler.dd(&table).map_err(assembly_error)?;
        self.placed_masks.insert(count);
        Ok(())
    }

    /// Generate the final machine code bytes.
    pub fn finalize(&mut self) -> Result<Vec<u8>, EncodingError> {
        let unplaced_loops: Vec<usize> = self
            .loop_labels
            .keys()
            .filter(|&&loop_id| !self.placed_loops.contains(&loop_id))
            .copied()
            .collect();
        if let Some(loop_id) = unplaced_loops.first() {
            return Err(EncodingError::AssemblyError(format!("label of loop {loop_id} was never placed")));
        }
        let unplaced_masks = self.mask_labels.keys().any(|count| !self.placed_masks.contains(count));
        if unplaced_masks {
            return Err(EncodingError::AssemblyError("lane mask table was never placed".to_string()));
        }

        let result = self.assembler.assemble(self.position).map_err(assembly_error)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::{JumpCondition, VecBinOp, X64Encoder, SCRATCH_GPR, SCRATCH_VEC};
    use crate::core::register_file::AsmReg;

    #[test]
    fn test_basic_instructions() {
        let mut encoder = X64Encoder::new().unwrap();

        let rcx = AsmReg::gpr(1);
        let rdx = AsmReg::gpr(2);
        encoder.mov_reg_reg(rcx, rdx).unwrap();
        encoder.add_reg_imm(rcx, 32).unwrap();
        encoder.imul_reg_imm(SCRATCH_GPR, SCRATCH_GPR, 64).unwrap();
        encoder.ret().unwrap();

        let code = encoder.finalize().unwrap();
        assert!(!code.is_empty());
        assert_eq!(*code.last().unwrap(), 0xC3);
    }

    #[test]
    fn test_vector_instructions() {
        let mut encoder = X64Encoder::new().unwrap();
        let rsi = AsmReg::gpr(6);
        let (y0, y1, y2) = (AsmReg::vec(0), AsmReg::vec(1), AsmReg::vec(2));

        encoder.vmovups_load(y0, rsi, 0).unwrap();
        encoder.vmovups_load(y1, rsi, 32).unwrap();
        encoder.vec_binary(VecBinOp::Add, y2, y0, y1).unwrap();
        encoder.vfmadd231ps(y2, y0, y1).unwrap();
        encoder.vmovups_store(rsi, 64, y2).unwrap();
        encoder.vzeroupper().unwrap();

        let code = encoder.finalize().unwrap();
        // VEX prefixed instructions start with 0xC4 or 0xC5.
        assert!(code[0] == 0xC5 || code[0] == 0xC4);
    }

    #[test]
    fn test_register_bank_mismatch() {
        let mut encoder = X64Encoder::new().unwrap();
        assert!(encoder.vmovaps(AsmReg::gpr(0), AsmReg::vec(1)).is_err());
        assert!(encoder.push_reg(AsmReg::vec(3)).is_err());
    }

    #[test]
    fn test_loop_label_management() {
        let mut encoder = X64Encoder::new().unwrap();
        let counter = AsmReg::gpr(3);

        encoder.mov_reg_imm(counter, 16).unwrap();
        assert!(!encoder.is_loop_placed(7));
        encoder.place_label_for_loop(7).unwrap();
        assert!(encoder.is_loop_placed(7));
        encoder.sub_reg_imm(counter, 8).unwrap();
        encoder.cmp_reg_imm(counter, 8).unwrap();
        encoder.jmp_conditional_to_loop(JumpCondition::GreaterEqual, 7).unwrap();
        encoder.ret().unwrap();

        assert!(!encoder.finalize().unwrap().is_empty());
    }

    #[test]
    fn test_unplaced_loop_label_fails() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.jmp_conditional_to_loop(JumpCondition::NotEqual, 3).unwrap();
        assert!(encoder.finalize().is_err());
    }

    #[test]
    fn test_lane_mask_tables() {
        let mut encoder = X64Encoder::new().unwrap();
        let rdi = AsmReg::gpr(7);

        encoder.load_lane_mask(SCRATCH_VEC, 3).unwrap();
        encoder.vmaskmovps_load(AsmReg::vec(0), SCRATCH_VEC, rdi, 0).unwrap();
        encoder.ret().unwrap();
        encoder.place_lane_mask(3).unwrap();
        // Placing twice keeps a single table.
        encoder.place_lane_mask(3).unwrap();
        assert!(encoder.place_lane_mask(9).is_err());

        let code = encoder.finalize().unwrap();
        let table = &code[code.len() - 32..];
        assert_eq!(&table[..12], &[0xFF; 12]);
        assert_eq!(&table[12..], &[0; 20]);
    }
}
