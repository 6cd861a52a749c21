//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Instruction encoding using iced-x86
//! - AVX2 emitters for every Linear IR operation
//! - The kernel emitter with the System V prologue and data pointer setup
//! - The Target Machine tying them together

pub mod emitters;
pub mod encoder;
pub mod kernel;
pub mod target;

pub use encoder::{EncodingError, X64Encoder, VECTOR_LANES};
pub use target::{BrgemmKernelDesc, BrgemmResolver, X64CompileParams, X64TargetMachine};
