// This module defines the error taxonomy of the snippets backend using the thiserror crate.
// CompileError has one family of variants per failure class a fused kernel compile can hit:
// unsupported shapes or layouts discovered while canonicalizing or blocking, structural Linear IR
// inconsistencies left behind by an upstream pass, exhaustion of a bounded resource such as a
// register pool or the data pointer budget, and missing target capabilities. Every pass returns
// CompileResult<T>, and the caller decides the fallback policy from the error category: the first
// three families mean "do not fuse this", a structural error means "internal bug".

//! Error types for the snippets backend.
//!
//! Using thiserror for idiomatic error handling.

use thiserror::Error;

/// Main error type for snippet compilation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Unsupported shape: {reason}")]
    UnsupportedShape {
        reason: String,
    },

    #[error("Unsupported layout: {reason}")]
    UnsupportedLayout {
        reason: String,
    },

    #[error("Structural IR error: {reason}")]
    StructuralIr {
        reason: String,
    },

    #[error("Resource exhausted: {resource} (requested {requested}, available {available})")]
    ResourceExhaustion {
        resource: &'static str,
        requested: usize,
        available: usize,
    },

    #[error("Target capability missing: {reason}")]
    TargetCapability {
        reason: String,
    },
}

/// Coarse classification of a [`CompileError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    UnsupportedShapeOrLayout,
    StructuralIr,
    ResourceExhaustion,
    TargetCapability,
}

impl CompileError {
    pub fn unsupported_shape(reason: impl Into<String>) -> Self {
        Self::UnsupportedShape { reason: reason.into() }
    }

    pub fn unsupported_layout(reason: impl Into<String>) -> Self {
        Self::UnsupportedLayout { reason: reason.into() }
    }

    pub fn structural(reason: impl Into<String>) -> Self {
        Self::StructuralIr { reason: reason.into() }
    }

    pub fn target(reason: impl Into<String>) -> Self {
        Self::TargetCapability { reason: reason.into() }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedShape { .. } | Self::UnsupportedLayout { .. } => {
                ErrorCategory::UnsupportedShapeOrLayout
            }
            Self::StructuralIr { .. } => ErrorCategory::StructuralIr,
            Self::ResourceExhaustion { .. } => ErrorCategory::ResourceExhaustion,
            Self::TargetCapability { .. } => ErrorCategory::TargetCapability,
        }
    }

    /// Whether the failure rejects this fusion decision rather than signalling a bug.
    ///
    /// A tokenizer seeing `true` should retry with a smaller subgraph; `false`
    /// means an upstream pass left the Linear IR inconsistent.
    pub fn is_fusion_rejection(&self) -> bool {
        self.category() != ErrorCategory::StructuralIr
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let shape = CompileError::unsupported_shape("rank mismatch");
        assert_eq!(shape.category(), ErrorCategory::UnsupportedShapeOrLayout);
        assert!(shape.is_fusion_rejection());

        let structural = CompileError::structural("LoopBegin without LoopEnd");
        assert_eq!(structural.category(), ErrorCategory::StructuralIr);
        assert!(!structural.is_fusion_rejection());

        let regs = CompileError::ResourceExhaustion { resource: "vector registers", requested: 17, available: 16 };
        assert!(regs.is_fusion_rejection());
        assert_eq!(
            regs.to_string(),
            "Resource exhausted: vector registers (requested 17, available 16)"
        );
    }
}
