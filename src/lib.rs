//! Snippets - a JIT backend for fused tensor kernels.
//!
//! A snippet is a small fragment of a neural network graph (elementwise
//! arithmetic, conversions, transposes and matrix multiplications) that a
//! tokenizer decided to fuse into one kernel. This crate lowers such a fragment
//! through a Linear IR of explicit loads, stores and loops into machine code,
//! and returns a [`Schedule`]: the kernel plus the iteration space the caller
//! drives it over.
//!
//! # Primary Usage
//!
//! ```ignore
//! use bumpalo::Bump;
//! use snippets::core::CompilationSession;
//! use snippets::lowered::ElementType;
//! use snippets::subgraph::{BlockedShape, SubgraphBuilder};
//! use snippets::x64::X64TargetMachine;
//!
//! let mut b = SubgraphBuilder::new();
//! let x = b.parameter(ElementType::F32, vec![8, 64]);
//! let y = b.parameter(ElementType::F32, vec![8, 64]);
//! let sum = b.add(x, y)?;
//! b.result(sum)?;
//! let mut graph = b.build()?;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let mut target = X64TargetMachine::new()?;
//! let shape = BlockedShape::planar(vec![8, 64], ElementType::F32);
//! let schedule = graph.generate(&[shape.clone()], &[shape.clone(), shape], &mut target, &session, None)?;
//! ```
//!
//! # Architecture
//!
//! - [`subgraph`] - Graph fragment, canonicalization and dialect conversion
//! - [`lowered`] - Linear IR, Loop Manager and the lowering passes
//! - [`generator`] - Generation driver, Target Machine interface and Schedule
//! - [`x64`] - x86-64 AVX2 target (encoder, emitters, kernel ABI)
//! - [`core`] - Errors, configuration, session and register pools

pub mod core;
pub mod generator;
pub mod lowered;
pub mod subgraph;
pub mod x64;

pub use crate::core::{CompilationSession, CompileError, CompileResult, Config, SessionStats};
pub use generator::{CodePtr, Generator, Schedule, TargetMachine};
pub use lowered::LinearIR;
pub use subgraph::{BlockedShape, Subgraph, SubgraphBuilder};
pub use x64::X64TargetMachine;
