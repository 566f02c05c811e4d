//! Physical locations (registers and stack slots) and sets of registers.
//!
//! A [PhyLocation] is a signed integer: non-negative values are registers, numbered in x64
//! hardware encoding order with the XMM registers following the general purpose registers;
//! negative values are stack slots, expressed as byte offsets from `RBP`.

use static_assertions::const_assert_eq;
use std::{
    fmt,
    ops::{BitAnd, BitOr, BitOrAssign, Sub},
};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhyLocation(i32);

pub const NUM_GP_REGS: i32 = 16;
pub const NUM_XMM_REGS: i32 = 16;
pub const XMM_REG_BASE: i32 = NUM_GP_REGS;
pub const NUM_REGS: i32 = NUM_GP_REGS + NUM_XMM_REGS;

const GP_NAMES: [&str; NUM_GP_REGS as usize] = [
    "RAX", "RCX", "RDX", "RBX", "RSP", "RBP", "RSI", "RDI", "R8", "R9", "R10", "R11", "R12", "R13",
    "R14", "R15",
];

const XMM_NAMES: [&str; NUM_XMM_REGS as usize] = [
    "XMM0", "XMM1", "XMM2", "XMM3", "XMM4", "XMM5", "XMM6", "XMM7", "XMM8", "XMM9", "XMM10",
    "XMM11", "XMM12", "XMM13", "XMM14", "XMM15",
];

impl PhyLocation {
    pub const RAX: PhyLocation = PhyLocation(0);
    pub const RCX: PhyLocation = PhyLocation(1);
    pub const RDX: PhyLocation = PhyLocation(2);
    pub const RBX: PhyLocation = PhyLocation(3);
    pub const RSP: PhyLocation = PhyLocation(4);
    pub const RBP: PhyLocation = PhyLocation(5);
    pub const RSI: PhyLocation = PhyLocation(6);
    pub const RDI: PhyLocation = PhyLocation(7);
    pub const R8: PhyLocation = PhyLocation(8);
    pub const R9: PhyLocation = PhyLocation(9);
    pub const R10: PhyLocation = PhyLocation(10);
    pub const R11: PhyLocation = PhyLocation(11);
    pub const R12: PhyLocation = PhyLocation(12);
    pub const R13: PhyLocation = PhyLocation(13);
    pub const R14: PhyLocation = PhyLocation(14);
    pub const R15: PhyLocation = PhyLocation(15);
    pub const XMM0: PhyLocation = PhyLocation(XMM_REG_BASE);
    pub const XMM1: PhyLocation = PhyLocation(XMM_REG_BASE + 1);
    pub const XMM2: PhyLocation = PhyLocation(XMM_REG_BASE + 2);
    pub const XMM3: PhyLocation = PhyLocation(XMM_REG_BASE + 3);
    pub const XMM4: PhyLocation = PhyLocation(XMM_REG_BASE + 4);
    pub const XMM5: PhyLocation = PhyLocation(XMM_REG_BASE + 5);
    pub const XMM6: PhyLocation = PhyLocation(XMM_REG_BASE + 6);
    pub const XMM7: PhyLocation = PhyLocation(XMM_REG_BASE + 7);
    pub const XMM8: PhyLocation = PhyLocation(XMM_REG_BASE + 8);
    pub const XMM9: PhyLocation = PhyLocation(XMM_REG_BASE + 9);
    pub const XMM10: PhyLocation = PhyLocation(XMM_REG_BASE + 10);
    pub const XMM11: PhyLocation = PhyLocation(XMM_REG_BASE + 11);
    pub const XMM12: PhyLocation = PhyLocation(XMM_REG_BASE + 12);
    pub const XMM13: PhyLocation = PhyLocation(XMM_REG_BASE + 13);
    pub const XMM14: PhyLocation = PhyLocation(XMM_REG_BASE + 14);
    pub const XMM15: PhyLocation = PhyLocation(XMM_REG_BASE + 15);
    /// The sentinel returned for unparseable register names.
    pub const REG_INVALID: PhyLocation = PhyLocation(-1);

    pub const fn new(loc: i32) -> Self {
        PhyLocation(loc)
    }

    /// A stack slot `off` bytes below `RBP`.
    ///
    /// # Panics
    ///
    /// If `off` is not positive.
    pub fn stack_slot(off: i32) -> Self {
        crate::jit_check!(off > 0, "stack slot offset {off} must be positive");
        PhyLocation(-off)
    }

    pub const fn loc(self) -> i32 {
        self.0
    }

    pub const fn is_memory(self) -> bool {
        self.0 < 0
    }

    pub const fn is_register(self) -> bool {
        self.0 >= 0
    }

    pub const fn is_gp_register(self) -> bool {
        self.0 >= 0 && self.0 < NUM_GP_REGS
    }

    pub const fn is_fp_register(self) -> bool {
        self.0 >= XMM_REG_BASE && self.0 < NUM_REGS
    }

    /// The 4-bit hardware encoding of this register, as used by `dynasm`'s `Rq(..)`/`Rx(..)`.
    ///
    /// # Panics
    ///
    /// If this is not a register.
    pub fn code(self) -> u8 {
        crate::jit_check!(self.is_register(), "{self} is not a register");
        // Cannot truncate: registers are in 0..32.
        (self.0 % NUM_GP_REGS) as u8
    }

    /// Map a register name (case insensitive) to its location. Returns [Self::REG_INVALID] for
    /// anything that isn't the name of a register.
    pub fn parse(name: &str) -> PhyLocation {
        let upper = name.to_ascii_uppercase();
        if let Some(i) = GP_NAMES.iter().position(|x| *x == upper) {
            return PhyLocation(i as i32);
        }
        if let Some(i) = XMM_NAMES.iter().position(|x| *x == upper) {
            return PhyLocation(XMM_REG_BASE + i as i32);
        }
        PhyLocation::REG_INVALID
    }
}

impl fmt::Display for PhyLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_gp_register() {
            write!(f, "{}", GP_NAMES[self.0 as usize])
        } else if self.is_fp_register() {
            write!(f, "{}", XMM_NAMES[(self.0 - XMM_REG_BASE) as usize])
        } else if self.is_memory() {
            write!(f, "[RBP - {}]", -self.0)
        } else {
            write!(f, "<invalid {}>", self.0)
        }
    }
}

/// A set of registers, stored as a bitmask indexed by [PhyLocation].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct PhyRegisterSet(u32);

const fn bit(reg: PhyLocation) -> u32 {
    1 << reg.0
}

const fn mask_of(regs: &[PhyLocation]) -> u32 {
    let mut m = 0;
    let mut i = 0;
    while i < regs.len() {
        m |= bit(regs[i]);
        i += 1;
    }
    m
}

impl PhyRegisterSet {
    pub const fn empty() -> Self {
        PhyRegisterSet(0)
    }

    pub const fn from_mask(mask: u32) -> Self {
        PhyRegisterSet(mask)
    }

    pub const fn of(regs: &[PhyLocation]) -> Self {
        PhyRegisterSet(mask_of(regs))
    }

    pub const fn mask(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// The lowest numbered register in the set.
    ///
    /// # Panics
    ///
    /// If the set is empty.
    pub fn first(self) -> PhyLocation {
        crate::jit_check!(!self.is_empty(), "first() of an empty register set");
        // trailing_zeros of a non-zero u32 is < 32.
        PhyLocation(self.0.trailing_zeros() as i32)
    }

    pub fn remove_first(&mut self) {
        self.0 &= self.0.wrapping_sub(1);
    }

    pub fn set(&mut self, reg: PhyLocation) {
        crate::jit_dcheck!(reg.is_register(), "{reg} is not a register");
        self.0 |= bit(reg);
    }

    pub fn reset(&mut self, reg: PhyLocation) {
        crate::jit_dcheck!(reg.is_register(), "{reg} is not a register");
        self.0 &= !bit(reg);
    }

    pub fn reset_all(&mut self) {
        self.0 = 0;
    }

    pub fn has(self, reg: PhyLocation) -> bool {
        reg.is_register() && self.0 & bit(reg) != 0
    }

    /// Iterate over the registers in the set, lowest numbered first.
    pub fn iter(self) -> impl Iterator<Item = PhyLocation> {
        let mut rest = self;
        std::iter::from_fn(move || {
            if rest.is_empty() {
                None
            } else {
                let r = rest.first();
                rest.remove_first();
                Some(r)
            }
        })
    }
}

impl BitOr for PhyRegisterSet {
    type Output = PhyRegisterSet;
    fn bitor(self, rhs: PhyRegisterSet) -> PhyRegisterSet {
        PhyRegisterSet(self.0 | rhs.0)
    }
}

impl BitOr<PhyLocation> for PhyRegisterSet {
    type Output = PhyRegisterSet;
    fn bitor(self, rhs: PhyLocation) -> PhyRegisterSet {
        let mut s = self;
        s.set(rhs);
        s
    }
}

impl BitOrAssign for PhyRegisterSet {
    fn bitor_assign(&mut self, rhs: PhyRegisterSet) {
        self.0 |= rhs.0;
    }
}

impl BitOrAssign<PhyLocation> for PhyRegisterSet {
    fn bitor_assign(&mut self, rhs: PhyLocation) {
        self.set(rhs);
    }
}

impl Sub for PhyRegisterSet {
    type Output = PhyRegisterSet;
    fn sub(self, rhs: PhyRegisterSet) -> PhyRegisterSet {
        PhyRegisterSet(self.0 & !rhs.0)
    }
}

impl Sub<PhyLocation> for PhyRegisterSet {
    type Output = PhyRegisterSet;
    fn sub(self, rhs: PhyLocation) -> PhyRegisterSet {
        let mut s = self;
        s.reset(rhs);
        s
    }
}

impl BitAnd for PhyRegisterSet {
    type Output = PhyRegisterSet;
    fn bitand(self, rhs: PhyRegisterSet) -> PhyRegisterSet {
        PhyRegisterSet(self.0 & rhs.0)
    }
}

impl BitAnd<PhyLocation> for PhyRegisterSet {
    type Output = PhyRegisterSet;
    fn bitand(self, rhs: PhyLocation) -> PhyRegisterSet {
        PhyRegisterSet(self.0 & bit(rhs))
    }
}

impl fmt::Display for PhyRegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.iter().map(|r| r.to_string()).collect::<Vec<_>>();
        write!(f, "{{{}}}", names.join(", "))
    }
}

pub const ALL_GP_REGISTERS: PhyRegisterSet = PhyRegisterSet((1 << NUM_GP_REGS) - 1);
pub const ALL_XMM_REGISTERS: PhyRegisterSet =
    PhyRegisterSet(((1u64 << NUM_REGS) - (1u64 << XMM_REG_BASE)) as u32);
pub const ALL_REGISTERS: PhyRegisterSet =
    PhyRegisterSet(ALL_GP_REGISTERS.0 | ALL_XMM_REGISTERS.0);
pub const STACK_REGISTERS: PhyRegisterSet =
    PhyRegisterSet::of(&[PhyLocation::RSP, PhyLocation::RBP]);
pub const INIT_REGISTERS: PhyRegisterSet =
    PhyRegisterSet(ALL_REGISTERS.0 & !STACK_REGISTERS.0);
pub const CALLER_SAVE_REGS: PhyRegisterSet = PhyRegisterSet(
    mask_of(&[
        PhyLocation::RAX,
        PhyLocation::RCX,
        PhyLocation::RDX,
        PhyLocation::RSI,
        PhyLocation::RDI,
        PhyLocation::R8,
        PhyLocation::R9,
        PhyLocation::R10,
        PhyLocation::R11,
    ]) | ALL_XMM_REGISTERS.0,
);
pub const CALLEE_SAVE_REGS: PhyRegisterSet =
    PhyRegisterSet(INIT_REGISTERS.0 & !CALLER_SAVE_REGS.0);

/// Integer argument registers, in System V argument order.
pub const ARGUMENT_REGS: [PhyLocation; 6] = [
    PhyLocation::RDI,
    PhyLocation::RSI,
    PhyLocation::RDX,
    PhyLocation::RCX,
    PhyLocation::R8,
    PhyLocation::R9,
];

/// Floating point argument registers, in System V argument order.
pub const FP_ARGUMENT_REGS: [PhyLocation; 8] = [
    PhyLocation::XMM0,
    PhyLocation::XMM1,
    PhyLocation::XMM2,
    PhyLocation::XMM3,
    PhyLocation::XMM4,
    PhyLocation::XMM5,
    PhyLocation::XMM6,
    PhyLocation::XMM7,
];

const_assert_eq!(ALL_REGISTERS.0, u32::MAX);
const_assert_eq!(ALL_GP_REGISTERS.0 & ALL_XMM_REGISTERS.0, 0);
const_assert_eq!(
    CALLEE_SAVE_REGS.0,
    mask_of(&[
        PhyLocation::RBX,
        PhyLocation::R12,
        PhyLocation::R13,
        PhyLocation::R14,
        PhyLocation::R15,
    ])
);
const_assert_eq!(CALLEE_SAVE_REGS.0 & CALLER_SAVE_REGS.0, 0);
const_assert_eq!(CALLEE_SAVE_REGS.0 | CALLER_SAVE_REGS.0, INIT_REGISTERS.0);
const_assert_eq!(mask_of(&ARGUMENT_REGS) & !CALLER_SAVE_REGS.0, 0);
const_assert_eq!(mask_of(&FP_ARGUMENT_REGS) & !ALL_XMM_REGISTERS.0, 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_sets() {
        assert_eq!(ALL_REGISTERS, ALL_GP_REGISTERS | ALL_XMM_REGISTERS);
        assert_eq!(
            CALLEE_SAVE_REGS,
            (ALL_REGISTERS - STACK_REGISTERS) - CALLER_SAVE_REGS
        );
        assert_eq!(ALL_GP_REGISTERS.count(), 16);
        assert_eq!(ALL_XMM_REGISTERS.count(), 16);
        assert_eq!(CALLEE_SAVE_REGS.count(), 5);
        assert!(!CALLEE_SAVE_REGS.has(PhyLocation::RBP));
        assert!(CALLER_SAVE_REGS.has(PhyLocation::XMM15));
    }

    #[test]
    fn set_algebra_per_register() {
        let sets = [
            PhyRegisterSet::empty(),
            ALL_REGISTERS,
            CALLEE_SAVE_REGS,
            PhyRegisterSet::of(&[PhyLocation::RAX, PhyLocation::XMM3]),
        ];
        for set in sets {
            for r in 0..NUM_REGS {
                let r = PhyLocation::new(r);
                assert!(!((set | r) & r).is_empty());
                assert!(((set - r) & r).is_empty());
            }
        }
    }

    #[test]
    fn first_and_remove_first() {
        let mut s = PhyRegisterSet::of(&[PhyLocation::R12, PhyLocation::RCX, PhyLocation::XMM1]);
        assert_eq!(s.count(), 3);
        assert_eq!(s.first(), PhyLocation::RCX);
        s.remove_first();
        assert_eq!(s.first(), PhyLocation::R12);
        s.remove_first();
        assert_eq!(s.first(), PhyLocation::XMM1);
        s.remove_first();
        assert!(s.is_empty());
        assert_eq!(
            CALLEE_SAVE_REGS.iter().collect::<Vec<_>>(),
            vec![
                PhyLocation::RBX,
                PhyLocation::R12,
                PhyLocation::R13,
                PhyLocation::R14,
                PhyLocation::R15
            ]
        );
    }

    #[test]
    fn locations() {
        assert!(PhyLocation::stack_slot(8).is_memory());
        assert!(!PhyLocation::stack_slot(8).is_register());
        assert!(PhyLocation::R15.is_gp_register());
        assert!(!PhyLocation::R15.is_fp_register());
        assert!(PhyLocation::XMM0.is_fp_register());
        assert_eq!(PhyLocation::XMM9.code(), 9);
        assert_eq!(PhyLocation::stack_slot(16).to_string(), "[RBP - 16]");
        assert_eq!(PhyLocation::R9.to_string(), "R9");
    }

    #[test]
    fn parse() {
        assert_eq!(PhyLocation::parse("rax"), PhyLocation::RAX);
        assert_eq!(PhyLocation::parse("R13"), PhyLocation::R13);
        assert_eq!(PhyLocation::parse("xmm12"), PhyLocation::XMM12);
        assert_eq!(PhyLocation::parse("xmm16"), PhyLocation::REG_INVALID);
        assert_eq!(PhyLocation::parse(""), PhyLocation::REG_INVALID);
        assert_eq!(PhyLocation::parse("eax"), PhyLocation::REG_INVALID);
    }
}
