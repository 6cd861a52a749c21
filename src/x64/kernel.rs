//! Kernel emitter: prologue, data pointer setup, body and epilogue.
//!
//! The generated function follows the System V convention:
//! `extern "C" fn(indexes: *const u64, args: *const u64)`. Every input and
//! output pointer is read from `args` and advanced by the outer indexes times
//! the byte stride of that dimension; buffer pointers all start at the
//! scratchpad base stored after the outputs.

use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::{AsmReg, PhysRegInfo};
use crate::generator::target::{Emitter, KernelInfo};
use crate::x64::emitters::X64Emitter;
use crate::x64::encoder::{imm32, X64Encoder, SCRATCH_GPR, STACK_POINTER};

/// Register holding the `indexes` argument on entry (rdi).
pub const INDEXES_REG: AsmReg = AsmReg::gpr(7);
/// Register holding the `args` argument on entry (rsi).
pub const ARGS_REG: AsmReg = AsmReg::gpr(6);

/// rbx, rbp, r12-r15.
const CALLEE_SAVED: [AsmReg; 6] = [
    AsmReg::gpr(3),
    AsmReg::gpr(5),
    AsmReg::gpr(12),
    AsmReg::gpr(13),
    AsmReg::gpr(14),
    AsmReg::gpr(15),
];

pub struct KernelEmitter {
    info: KernelInfo,
    body: Vec<(X64Emitter, PhysRegInfo)>,
}

impl KernelEmitter {
    fn emit_prologue(&self, host: &mut X64Encoder) -> CompileResult<()> {
        for &reg in &CALLEE_SAVED {
            host.push_reg(reg)?;
        }
        // Six pushes plus the return address: realign to 16 bytes.
        host.sub_reg_imm(STACK_POINTER, 8)?;
        Ok(())
    }

    fn emit_epilogue(&self, host: &mut X64Encoder) -> CompileResult<()> {
        host.add_reg_imm(STACK_POINTER, 8)?;
        for &reg in CALLEE_SAVED.iter().rev() {
            host.pop_reg(reg)?;
        }
        host.vzeroupper()?;
        host.ret()?;
        Ok(())
    }

    fn init_data_pointers(&self, host: &mut X64Encoder) -> CompileResult<()> {
        let info = &self.info;
        let num_io = info.num_inputs + info.num_outputs;
        for (i, &reg) in info.data_ptr_regs.iter().enumerate().take(num_io) {
            host.mov_reg_mem(reg, ARGS_REG, imm32(8 * i as i64)?)?;
            let strides = info.data_offsets.get(i).map(Vec::as_slice).unwrap_or_default();
            for (dim, &stride) in strides.iter().enumerate() {
                if stride == 0 {
                    continue;
                }
                host.mov_reg_mem(SCRATCH_GPR, INDEXES_REG, imm32(8 * dim as i64)?)?;
                host.imul_reg_imm(SCRATCH_GPR, SCRATCH_GPR, imm32(stride as i64)?)?;
                host.add_reg_reg(reg, SCRATCH_GPR)?;
            }
        }
        for &reg in info.data_ptr_regs.iter().skip(num_io) {
            host.mov_reg_mem(reg, ARGS_REG, imm32(8 * num_io as i64)?)?;
        }
        Ok(())
    }
}

impl Emitter<X64Encoder> for KernelEmitter {
    fn emit_code(&self, host: &mut X64Encoder, _regs: &PhysRegInfo) -> CompileResult<()> {
        self.emit_prologue(host)?;
        self.init_data_pointers(host)?;
        for (emitter, regs) in &self.body {
            emitter.emit_code(host, regs)?;
        }
        self.emit_epilogue(host)
    }

    fn emit_data(&self, host: &mut X64Encoder) -> CompileResult<()> {
        for (emitter, _) in &self.body {
            emitter.emit_data(host)?;
        }
        Ok(())
    }
}

pub fn kernel_factory(info: &KernelInfo, body: Vec<(X64Emitter, PhysRegInfo)>) -> CompileResult<X64Emitter> {
    let expected = info.num_inputs + info.num_outputs + info.num_buffer_ids;
    if info.data_ptr_regs.len() != expected {
        return Err(CompileError::structural(format!(
            "kernel expects {expected} data pointer registers, got {}",
            info.data_ptr_regs.len()
        )));
    }
    if info.data_ptr_regs.iter().any(|&reg| reg == INDEXES_REG || reg == ARGS_REG) {
        return Err(CompileError::structural("a data pointer was mapped onto a kernel argument register"));
    }
    log::debug!(
        "kernel: {} inputs, {} outputs, {} buffer ids, {} body emitters",
        info.num_inputs,
        info.num_outputs,
        info.num_buffer_ids,
        body.len()
    );
    Ok(Box::new(KernelEmitter { info: info.clone(), body }))
}
