// This module provides the physical register pools of the snippets backend and the mapping from
// abstract register indices onto them. RegBitSet tracks allocatable and used registers per bank with
// one 64-bit mask per bank (general purpose and vector), AsmReg names a physical register as a
// (bank, id) pair, and RegisterPool hands out free registers lowest id first. RegisterMapper shares
// one pool per class across every loop scope of a kernel, so a register released by an outer scope
// can be reused inside a nested one. Exhaustion surfaces as RegAllocError::NoRegistersAvailable and
// converts into CompileError::ResourceExhaustion, it never aliases two live values.

//! Register pools and abstract-to-physical register mapping.
//!
//! Register assignment happens in two steps. The `AssignRegisters` pass gives
//! every value an abstract register index per register class, reusing indices
//! once a live range ends. This module then maps those abstract indices onto a
//! bounded pool of physical registers: every abstract index seen for the first
//! time pops a free register from the pool of its class, and later references
//! reuse that register. Running out of registers is a hard error, two live
//! values are never aliased.

use crate::core::error::CompileError;
use hashbrown::HashMap;
use std::fmt;

/// Maximum number of register banks supported (GP, vector).
pub const MAX_REGISTER_BANKS: usize = 2;

/// Maximum number of registers per bank.
pub const MAX_REGISTERS_PER_BANK: usize = 64;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

pub const GPR_BANK: RegBank = 0;
pub const VEC_BANK: RegBank = 1;

/// Combined physical register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn gpr(id: RegId) -> Self {
        Self::new(GPR_BANK, id)
    }

    pub const fn vec(id: RegId) -> Self {
        Self::new(VEC_BANK, id)
    }

    pub fn class(&self) -> RegClass {
        if self.bank == GPR_BANK {
            RegClass::Gpr
        } else {
            RegClass::Vec
        }
    }
}

/// Register class of an abstract or physical register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegClass {
    Gpr,
    Vec,
}

impl RegClass {
    pub fn bank(self) -> RegBank {
        match self {
            RegClass::Gpr => GPR_BANK,
            RegClass::Vec => VEC_BANK,
        }
    }
}

/// Abstract register: an index unique per live range within one snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg {
    pub class: RegClass,
    pub index: usize,
}

impl Reg {
    pub const fn gpr(index: usize) -> Self {
        Self { class: RegClass::Gpr, index }
    }

    pub const fn vec(index: usize) -> Self {
        Self { class: RegClass::Vec, index }
    }
}

/// Abstract register info attached to an expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegInfo {
    pub inputs: Vec<Reg>,
    pub outputs: Vec<Reg>,
}

/// Physical registers of one lowered expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhysRegInfo {
    pub inputs: Vec<AsmReg>,
    pub outputs: Vec<AsmReg>,
    /// Registers live across the expression (saved around calls).
    pub live: Vec<AsmReg>,
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegBitSet {
    /// Bit mask for each register bank.
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    /// Create empty register set.
    pub fn new() -> Self {
        Self {
            banks: [0; MAX_REGISTER_BANKS],
        }
    }

    /// Create register set with all registers in bank marked.
    pub fn all_in_bank(bank: RegBank, count: u8) -> Self {
        let mut set = Self::new();
        if (bank as usize) < MAX_REGISTER_BANKS {
            set.banks[bank as usize] = if count >= 64 { u64::MAX } else { (1u64 << count) - 1 };
        }
        set
    }

    /// Check if register is set.
    pub fn contains(&self, reg: AsmReg) -> bool {
        if reg.bank as usize >= MAX_REGISTER_BANKS || reg.id >= 64 {
            return false;
        }
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    /// Set a register.
    pub fn set(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] |= 1u64 << reg.id;
        }
    }

    /// Clear a register.
    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] &= !(1u64 << reg.id);
        }
    }

    /// Count number of set registers in bank.
    pub fn count_in_bank(&self, bank: RegBank) -> u32 {
        if bank as usize >= MAX_REGISTER_BANKS {
            return 0;
        }
        self.banks[bank as usize].count_ones()
    }

    /// Registers of one bank in ascending id order.
    pub fn iter_bank(&self, bank: RegBank) -> impl Iterator<Item = AsmReg> + '_ {
        let mask = self.banks.get(bank as usize).copied().unwrap_or(0);
        (0..64u8).filter(move |id| mask & (1u64 << id) != 0).map(move |id| AsmReg::new(bank, id))
    }
}

impl Default for RegBitSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Error types for register pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegAllocError {
    /// No registers available in the requested bank.
    NoRegistersAvailable { bank: RegBank, capacity: usize },
    /// Register is not allocated.
    RegisterNotAllocated(AsmReg),
    /// Register does not belong to the pool.
    InvalidRegister(AsmReg),
}

impl fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegAllocError::NoRegistersAvailable { bank, capacity } => {
                write!(f, "not enough regs in the pool of bank {bank} ({capacity} total)")
            }
            RegAllocError::RegisterNotAllocated(reg) => write!(f, "register {reg:?} is not allocated"),
            RegAllocError::InvalidRegister(reg) => write!(f, "register {reg:?} is not in the pool"),
        }
    }
}

impl std::error::Error for RegAllocError {}

impl From<RegAllocError> for CompileError {
    fn from(err: RegAllocError) -> Self {
        match err {
            RegAllocError::NoRegistersAvailable { bank, capacity } => CompileError::ResourceExhaustion {
                resource: if bank == GPR_BANK { "general purpose registers" } else { "vector registers" },
                requested: capacity + 1,
                available: capacity,
            },
            other => CompileError::structural(other.to_string()),
        }
    }
}

/// Physical registers a target makes available to generated kernels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBanks {
    /// Allocatable general purpose register ids (stack pointer and scratch excluded).
    pub gpr: Vec<RegId>,
    /// Allocatable vector register ids.
    pub vec: Vec<RegId>,
    /// Registers carrying the kernel ABI parameters on entry.
    pub abi_params: Vec<RegId>,
}

/// A pool of free physical registers of one bank.
///
/// The free list is kept in descending id order and registers are popped
/// from the back, so the lowest free id is handed out first.
#[derive(Debug, Clone)]
pub struct RegisterPool {
    bank: RegBank,
    free: Vec<RegId>,
    allocatable: RegBitSet,
    used: RegBitSet,
}

impl RegisterPool {
    pub fn new(bank: RegBank, ids: &[RegId]) -> Self {
        let mut free: Vec<RegId> = ids.to_vec();
        free.sort_unstable_by(|a, b| b.cmp(a));
        free.dedup();
        let mut allocatable = RegBitSet::new();
        for &id in &free {
            allocatable.set(AsmReg::new(bank, id));
        }
        Self { bank, free, allocatable, used: RegBitSet::new() }
    }

    pub fn bank(&self) -> RegBank {
        self.bank
    }

    pub fn capacity(&self) -> usize {
        self.allocatable.count_in_bank(self.bank) as usize
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn pop(&mut self) -> Result<AsmReg, RegAllocError> {
        let id = self.free.pop().ok_or(RegAllocError::NoRegistersAvailable {
            bank: self.bank,
            capacity: self.capacity(),
        })?;
        let reg = AsmReg::new(self.bank, id);
        self.used.set(reg);
        Ok(reg)
    }

    /// Take a specific register out of the free list.
    pub fn remove(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        if !self.allocatable.contains(reg) {
            return Err(RegAllocError::InvalidRegister(reg));
        }
        let pos = self
            .free
            .iter()
            .position(|&id| id == reg.id)
            .ok_or(RegAllocError::RegisterNotAllocated(reg))?;
        self.free.remove(pos);
        self.used.set(reg);
        Ok(())
    }

    /// Return a register to the pool.
    pub fn release(&mut self, reg: AsmReg) -> Result<(), RegAllocError> {
        if !self.allocatable.contains(reg) {
            return Err(RegAllocError::InvalidRegister(reg));
        }
        if !self.used.contains(reg) {
            return Err(RegAllocError::RegisterNotAllocated(reg));
        }
        self.used.clear(reg);
        self.free.push(reg.id);
        self.free.sort_unstable_by(|a, b| b.cmp(a));
        Ok(())
    }

    pub fn is_allocated(&self, reg: AsmReg) -> bool {
        self.used.contains(reg)
    }
}

/// Maps abstract registers onto physical pools shared by every scope of a kernel.
#[derive(Debug, Clone)]
pub struct RegisterMapper {
    gpr_pool: RegisterPool,
    vec_pool: RegisterPool,
    mapping: HashMap<Reg, AsmReg>,
}

impl RegisterMapper {
    pub fn new(gpr_pool: RegisterPool, vec_pool: RegisterPool) -> Self {
        Self { gpr_pool, vec_pool, mapping: HashMap::new() }
    }

    pub fn from_banks(banks: &RegisterBanks) -> Self {
        Self::new(
            RegisterPool::new(GPR_BANK, &banks.gpr),
            RegisterPool::new(VEC_BANK, &banks.vec),
        )
    }

    pub fn pool_mut(&mut self, class: RegClass) -> &mut RegisterPool {
        match class {
            RegClass::Gpr => &mut self.gpr_pool,
            RegClass::Vec => &mut self.vec_pool,
        }
    }

    /// Physical register for `reg`, popping a fresh one on first sight.
    pub fn map(&mut self, reg: Reg) -> Result<AsmReg, RegAllocError> {
        if let Some(&phys) = self.mapping.get(&reg) {
            return Ok(phys);
        }
        let phys = self.pool_mut(reg.class).pop()?;
        log::trace!("mapped abstract {:?} {} -> {:?}", reg.class, reg.index, phys);
        self.mapping.insert(reg, phys);
        Ok(phys)
    }

    pub fn lookup(&self, reg: Reg) -> Option<AsmReg> {
        self.mapping.get(&reg).copied()
    }

    pub fn map_all(&mut self, regs: &[Reg]) -> Result<Vec<AsmReg>, RegAllocError> {
        regs.iter().map(|&reg| self.map(reg)).collect()
    }

    /// Number of distinct abstract registers mapped so far in `class`.
    pub fn mapped_count(&self, class: RegClass) -> usize {
        self.mapping.keys().filter(|reg| reg.class == class).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regbitset_operations() {
        let mut set = RegBitSet::new();
        let reg = AsmReg::new(0, 5);

        assert!(!set.contains(reg));
        set.set(reg);
        assert!(set.contains(reg));
        set.clear(reg);
        assert!(!set.contains(reg));
    }

    #[test]
    fn test_pool_hands_out_lowest_id_first() {
        let mut pool = RegisterPool::new(GPR_BANK, &[3, 1, 2]);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.pop().unwrap(), AsmReg::gpr(1));
        assert_eq!(pool.pop().unwrap(), AsmReg::gpr(2));

        pool.release(AsmReg::gpr(1)).unwrap();
        assert_eq!(pool.pop().unwrap(), AsmReg::gpr(1));
        assert_eq!(pool.pop().unwrap(), AsmReg::gpr(3));
        assert!(matches!(pool.pop(), Err(RegAllocError::NoRegistersAvailable { bank: 0, capacity: 3 })));
    }

    #[test]
    fn test_pool_remove_and_release_errors() {
        let mut pool = RegisterPool::new(VEC_BANK, &[0, 1]);
        pool.remove(AsmReg::vec(0)).unwrap();
        assert!(pool.is_allocated(AsmReg::vec(0)));
        assert_eq!(pool.available(), 1);

        assert_eq!(pool.remove(AsmReg::vec(7)), Err(RegAllocError::InvalidRegister(AsmReg::vec(7))));
        assert_eq!(
            pool.release(AsmReg::vec(1)),
            Err(RegAllocError::RegisterNotAllocated(AsmReg::vec(1)))
        );
    }

    #[test]
    fn test_mapper_reuses_mapping() {
        let mut mapper = RegisterMapper::new(
            RegisterPool::new(GPR_BANK, &[0, 1]),
            RegisterPool::new(VEC_BANK, &[0, 1, 2]),
        );
        let a = mapper.map(Reg::vec(7)).unwrap();
        let b = mapper.map(Reg::vec(3)).unwrap();
        assert_ne!(a, b);
        assert_eq!(mapper.map(Reg::vec(7)).unwrap(), a);
        assert_eq!(mapper.mapped_count(RegClass::Vec), 2);
        assert_eq!(mapper.lookup(Reg::gpr(0)), None);
    }

    #[test]
    fn test_exhaustion_is_resource_error() {
        let mut mapper = RegisterMapper::new(RegisterPool::new(GPR_BANK, &[0]), RegisterPool::new(VEC_BANK, &[]));
        let err: CompileError = mapper.map(Reg::vec(0)).unwrap_err().into();
        assert_eq!(
            err,
            CompileError::ResourceExhaustion { resource: "vector registers", requested: 1, available: 0 }
        );
    }
}
