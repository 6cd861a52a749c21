//! Compilation configuration.
//!
//! One [`Config`] is shared by the subgraph adapter, the Linear IR passes and
//! the generation driver. Defaults match the AVX2 reference target.

use crate::lowered::pass::PassId;

/// Block sizes used by brgemm blocking along M, N and K.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrgemmBlockSizes {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl Default for BrgemmBlockSizes {
    fn default() -> Self {
        Self { m: 32, n: 64, k: 512 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of innermost dimensions covered by generated loops.
    pub tile_rank: usize,
    pub brgemm_blocking: BrgemmBlockSizes,
    pub enable_single_evaluation: bool,
    /// Abstract register budget per class.
    pub vec_reg_count: usize,
    pub gpr_reg_count: usize,
    pub disabled_passes: Vec<PassId>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tile_rank: 2,
            brgemm_blocking: BrgemmBlockSizes::default(),
            enable_single_evaluation: true,
            vec_reg_count: 16,
            gpr_reg_count: 16,
            disabled_passes: Vec::new(),
        }
    }
}

impl Config {
    pub fn with_tile_rank(mut self, tile_rank: usize) -> Self {
        self.tile_rank = tile_rank;
        self
    }

    pub fn with_brgemm_blocking(mut self, m: usize, n: usize, k: usize) -> Self {
        self.brgemm_blocking = BrgemmBlockSizes { m, n, k };
        self
    }

    pub fn with_single_evaluation(mut self, enabled: bool) -> Self {
        self.enable_single_evaluation = enabled;
        self
    }

    pub fn with_reg_counts(mut self, gpr: usize, vec: usize) -> Self {
        self.gpr_reg_count = gpr;
        self.vec_reg_count = vec;
        self
    }

    /// Skip an optional pass. Mandatory passes ignore this.
    pub fn disable_pass(mut self, pass: PassId) -> Self {
        if !self.disabled_passes.contains(&pass) {
            self.disabled_passes.push(pass);
        }
        self
    }

    pub fn is_pass_enabled(&self, pass: PassId) -> bool {
        !(pass.is_optional() && self.disabled_passes.contains(&pass))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disable_only_affects_optional_passes() {
        let config = Config::default()
            .disable_pass(PassId::MulAddToFma)
            .disable_pass(PassId::AssignRegisters);

        assert!(!config.is_pass_enabled(PassId::MulAddToFma));
        assert!(config.is_pass_enabled(PassId::AssignRegisters));
        assert!(config.is_pass_enabled(PassId::OptimizeLoopSingleEvaluation));
    }
}
