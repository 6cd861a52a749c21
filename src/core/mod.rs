// This module serves as the hub for the shared infrastructure of the snippets backend: the pieces
// every stage uses regardless of which fragment is compiled or which target it is compiled for. It
// exports the compile error taxonomy, the configuration shared by adapter, passes and driver, the
// arena-based compilation session with its statistics, the register pools that turn abstract
// registers into physical ones, and the ELF writer used to persist generated kernels.

//! Core snippets infrastructure.
//!
//! # Key Components
//!
//! ## Errors (`error`)
//! - [`CompileError`] with one variant per failure kind and [`CompileResult`]
//!
//! ## Configuration (`config`)
//! - Tile rank, brgemm block sizes, register budgets and optional passes
//!
//! ## Session Management (`session`)
//! - Arena-based interning using `bumpalo`
//! - Compilation statistics and the lowered op trace
//!
//! ## Registers (`register_file`)
//! - Abstract registers and their class
//! - Physical register pools and the abstract to physical mapper
//!
//! ## ELF Assembly (`assembler`)
//! - Relocatable object output through the `object` crate

pub mod assembler;
pub mod config;
pub mod error;
pub mod register_file;
pub mod session;
pub mod test_utils;

pub use assembler::ElfAssembler;
pub use config::{BrgemmBlockSizes, Config};
pub use error::{CompileError, CompileResult, ErrorCategory};
pub use register_file::{
    AsmReg, PhysRegInfo, Reg, RegAllocError, RegBitSet, RegClass, RegInfo, RegisterBanks, RegisterMapper,
    RegisterPool,
};
pub use session::{CompilationSession, SessionStats};
