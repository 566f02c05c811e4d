//! The LIR opcode catalog.
//!
//! Every opcode has exactly one entry in [OPCODE_PROPERTIES]: the allocator and the code
//! generator consult that table rather than special casing individual opcodes.

use strum::{Display, EnumCount, EnumIter, FromRepr};

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, EnumIter, Eq, FromRepr, Hash, PartialEq)]
pub enum Opcode {
    Bind,
    Nop,
    Call,
    VectorCall,
    Guard,
    Sext,
    Zext,
    Negate,
    Invert,
    Add,
    Sub,
    And,
    Xor,
    Div,
    DivUn,
    Mul,
    Or,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    LShift,
    RShift,
    RShiftUn,
    Test,
    Equal,
    NotEqual,
    GreaterThanSigned,
    LessThanSigned,
    GreaterThanEqualSigned,
    LessThanEqualSigned,
    GreaterThanUnsigned,
    LessThanUnsigned,
    GreaterThanEqualUnsigned,
    LessThanEqualUnsigned,
    Cmp,
    Lea,
    Exchange,
    Move,
    Push,
    Pop,
    Cdq,
    Cwd,
    Cqo,
    Branch,
    BranchNZ,
    BranchZ,
    BranchA,
    BranchB,
    BranchAE,
    BranchBE,
    BranchG,
    BranchL,
    BranchGE,
    BranchLE,
    BitTest,
    Inc,
    Dec,
    CondBranch,
    Phi,
    Return,
    MovZX,
    MovSX,
    MovSXD,
    Jz,
    Jnz,
    YieldInitial,
    YieldFrom,
    YieldFromSkipInitialSend,
    YieldValue,
}

/// How an instruction affects the condition flags.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlagEffect {
    /// The flags are left untouched.
    None,
    /// The flags are set to a value derived from the instruction's operands.
    Set,
    /// The flags are clobbered: nothing may rely on them afterwards.
    Invalidate,
}

/// How the width of an instruction's operands is derived.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperandSizeType {
    /// Every operand uses its own data type's size.
    Default,
    /// Every operand is treated as 64 bits wide.
    Always64,
    /// Every operand uses the output's size, or the first input's if there is no output.
    Out,
}

#[derive(Debug)]
pub struct OpcodeProperties {
    pub flag_effect: FlagEffect,
    pub size_type: OperandSizeType,
    /// Must the output be in a register?
    pub output_needs_reg: bool,
    /// For each input position, must the input be in a register? Positions beyond the end of
    /// this slice tolerate memory operands.
    pub inputs_need_reg: &'static [bool],
}

const fn props(
    flag_effect: FlagEffect,
    size_type: OperandSizeType,
    output_needs_reg: bool,
    inputs_need_reg: &'static [bool],
) -> OpcodeProperties {
    OpcodeProperties {
        flag_effect,
        size_type,
        output_needs_reg,
        inputs_need_reg,
    }
}

const PLAIN: OpcodeProperties = props(FlagEffect::None, OperandSizeType::Default, true, &[]);
const SETS: OpcodeProperties = props(FlagEffect::Set, OperandSizeType::Default, true, &[]);
const ARITH: OpcodeProperties = props(FlagEffect::Set, OperandSizeType::Out, true, &[true]);
const FLOAT: OpcodeProperties =
    props(FlagEffect::None, OperandSizeType::Always64, true, &[true, true]);
const COMPARE: OpcodeProperties =
    props(FlagEffect::Set, OperandSizeType::Default, true, &[true, true]);
const YIELD: OpcodeProperties =
    props(FlagEffect::Invalidate, OperandSizeType::Default, false, &[]);

/// The property table, indexed by `Opcode as usize`.
pub static OPCODE_PROPERTIES: [OpcodeProperties; Opcode::COUNT] = [
    PLAIN,                                                                   // Bind
    PLAIN,                                                                   // Nop
    props(FlagEffect::Invalidate, OperandSizeType::Always64, true, &[]),     // Call
    props(FlagEffect::Invalidate, OperandSizeType::Always64, true, &[true]), // VectorCall
    props(
        FlagEffect::Invalidate,
        OperandSizeType::Default,
        true,
        &[false, false, true],
    ), // Guard
    PLAIN,                                                                   // Sext
    PLAIN,                                                                   // Zext
    props(FlagEffect::Set, OperandSizeType::Out, true, &[]),                 // Negate
    props(FlagEffect::None, OperandSizeType::Out, true, &[]),                // Invert
    ARITH,                                                                   // Add
    ARITH,                                                                   // Sub
    ARITH,                                                                   // And
    ARITH,                                                                   // Xor
    props(FlagEffect::Set, OperandSizeType::Default, true, &[true]),         // Div
    props(FlagEffect::Set, OperandSizeType::Default, true, &[true]),         // DivUn
    ARITH,                                                                   // Mul
    ARITH,                                                                   // Or
    FLOAT,                                                                   // Fadd
    FLOAT,                                                                   // Fsub
    FLOAT,                                                                   // Fmul
    FLOAT,                                                                   // Fdiv
    SETS,                                                                    // LShift
    SETS,                                                                    // RShift
    SETS,                                                                    // RShiftUn
    props(FlagEffect::Set, OperandSizeType::Out, false, &[true, true]),      // Test
    COMPARE,                                                                 // Equal
    COMPARE,                                                                 // NotEqual
    COMPARE,                                                                 // GreaterThanSigned
    COMPARE,                                                                 // LessThanSigned
    // GreaterThanEqualSigned
    COMPARE,
    COMPARE,                                                                 // LessThanEqualSigned
    COMPARE,                                                                 // GreaterThanUnsigned
    COMPARE,                                                                 // LessThanUnsigned
    // GreaterThanEqualUnsigned
    COMPARE,
    // LessThanEqualUnsigned
    COMPARE,
    props(FlagEffect::Set, OperandSizeType::Out, true, &[true, true]),       // Cmp
    props(FlagEffect::None, OperandSizeType::Always64, true, &[true, true]), // Lea
    props(FlagEffect::None, OperandSizeType::Always64, true, &[true, true]), // Exchange
    props(FlagEffect::None, OperandSizeType::Out, true, &[]),                // Move
    PLAIN,                                                                   // Push
    props(FlagEffect::None, OperandSizeType::Default, false, &[]),           // Pop
    PLAIN,                                                                   // Cdq
    PLAIN,                                                                   // Cwd
    PLAIN,                                                                   // Cqo
    PLAIN,                                                                   // Branch
    PLAIN,                                                                   // BranchNZ
    PLAIN,                                                                   // BranchZ
    PLAIN,                                                                   // BranchA
    PLAIN,                                                                   // BranchB
    PLAIN,                                                                   // BranchAE
    PLAIN,                                                                   // BranchBE
    PLAIN,                                                                   // BranchG
    PLAIN,                                                                   // BranchL
    PLAIN,                                                                   // BranchGE
    PLAIN,                                                                   // BranchLE
    props(FlagEffect::Set, OperandSizeType::Default, true, &[true]),         // BitTest
    SETS,                                                                    // Inc
    SETS,                                                                    // Dec
    props(FlagEffect::Invalidate, OperandSizeType::Default, false, &[true]), // CondBranch
    PLAIN,                                                                   // Phi
    props(FlagEffect::Invalidate, OperandSizeType::Default, true, &[]),      // Return
    PLAIN,                                                                   // MovZX
    PLAIN,                                                                   // MovSX
    PLAIN,                                                                   // MovSXD
    PLAIN,                                                                   // Jz
    PLAIN,                                                                   // Jnz
    YIELD,                                                                   // YieldInitial
    YIELD,                                                                   // YieldFrom
    // YieldFromSkipInitialSend
    YIELD,
    YIELD,                                                                   // YieldValue
];

impl Opcode {
    pub fn properties(self) -> &'static OpcodeProperties {
        &OPCODE_PROPERTIES[self as usize]
    }

    pub fn flag_effect(self) -> FlagEffect {
        self.properties().flag_effect
    }

    pub fn size_type(self) -> OperandSizeType {
        self.properties().size_type
    }

    pub fn output_needs_reg(self) -> bool {
        self.properties().output_needs_reg
    }

    /// Must input `i` be in a register? Inputs beyond those the table mentions may be in memory.
    pub fn input_needs_reg(self, i: usize) -> bool {
        self.properties()
            .inputs_need_reg
            .get(i)
            .copied()
            .unwrap_or(false)
    }

    pub fn is_compare(self) -> bool {
        matches!(
            self,
            Opcode::Equal
                | Opcode::NotEqual
                | Opcode::GreaterThanSigned
                | Opcode::LessThanSigned
                | Opcode::GreaterThanEqualSigned
                | Opcode::LessThanEqualSigned
                | Opcode::GreaterThanUnsigned
                | Opcode::LessThanUnsigned
                | Opcode::GreaterThanEqualUnsigned
                | Opcode::LessThanEqualUnsigned
        )
    }

    pub fn is_branch_cc(self) -> bool {
        matches!(
            self,
            Opcode::BranchNZ
                | Opcode::BranchZ
                | Opcode::BranchA
                | Opcode::BranchB
                | Opcode::BranchAE
                | Opcode::BranchBE
                | Opcode::BranchG
                | Opcode::BranchL
                | Opcode::BranchGE
                | Opcode::BranchLE
        )
    }

    pub fn is_any_yield(self) -> bool {
        matches!(
            self,
            Opcode::YieldInitial
                | Opcode::YieldFrom
                | Opcode::YieldFromSkipInitialSend
                | Opcode::YieldValue
        )
    }

    /// Does this instruction end a basic block?
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Branch | Opcode::CondBranch | Opcode::Return) || self.is_branch_cc()
    }

    /// Does code for this opcode call out of the JITted function (and thus clobber every
    /// caller-saved register)?
    pub fn is_call(self) -> bool {
        matches!(self, Opcode::Call | Opcode::VectorCall)
    }
}

/// Invert the condition of a conditional branch, e.g. `BranchGE` becomes `BranchL`.
///
/// # Panics
///
/// If `op` is not a conditional branch.
pub fn negate_branch_cc(op: Opcode) -> Opcode {
    match op {
        Opcode::BranchZ => Opcode::BranchNZ,
        Opcode::BranchNZ => Opcode::BranchZ,
        Opcode::BranchA => Opcode::BranchBE,
        Opcode::BranchBE => Opcode::BranchA,
        Opcode::BranchB => Opcode::BranchAE,
        Opcode::BranchAE => Opcode::BranchB,
        Opcode::BranchL => Opcode::BranchGE,
        Opcode::BranchGE => Opcode::BranchL,
        Opcode::BranchG => Opcode::BranchLE,
        Opcode::BranchLE => Opcode::BranchG,
        _ => crate::jit_abort!("not a conditional branch: {op}"),
    }
}

/// Swap the operand order a conditional branch expects, e.g. `BranchA` (`a > b`) becomes
/// `BranchB` (`b < a`).
///
/// # Panics
///
/// If `op` is not an ordered conditional branch.
pub fn flip_branch_cc_direction(op: Opcode) -> Opcode {
    match op {
        Opcode::BranchA => Opcode::BranchB,
        Opcode::BranchB => Opcode::BranchA,
        Opcode::BranchAE => Opcode::BranchBE,
        Opcode::BranchBE => Opcode::BranchAE,
        Opcode::BranchL => Opcode::BranchG,
        Opcode::BranchG => Opcode::BranchL,
        Opcode::BranchLE => Opcode::BranchGE,
        Opcode::BranchGE => Opcode::BranchLE,
        _ => crate::jit_abort!("branch has no direction: {op}"),
    }
}

/// Swap the operand order of a comparison. Equality comparisons are symmetric and map to
/// themselves.
///
/// # Panics
///
/// If `op` is not a comparison.
pub fn flip_comparison_direction(op: Opcode) -> Opcode {
    match op {
        Opcode::Equal => Opcode::Equal,
        Opcode::NotEqual => Opcode::NotEqual,
        Opcode::GreaterThanEqualSigned => Opcode::LessThanEqualSigned,
        Opcode::LessThanEqualSigned => Opcode::GreaterThanEqualSigned,
        Opcode::GreaterThanEqualUnsigned => Opcode::LessThanEqualUnsigned,
        Opcode::LessThanEqualUnsigned => Opcode::GreaterThanEqualUnsigned,
        Opcode::GreaterThanSigned => Opcode::LessThanSigned,
        Opcode::LessThanSigned => Opcode::GreaterThanSigned,
        Opcode::GreaterThanUnsigned => Opcode::LessThanUnsigned,
        Opcode::LessThanUnsigned => Opcode::GreaterThanUnsigned,
        _ => crate::jit_abort!("not a comparison: {op}"),
    }
}

/// The conditional branch taken exactly when comparison `op` yields true.
///
/// # Panics
///
/// If `op` is not a comparison.
pub fn compare_to_branch_cc(op: Opcode) -> Opcode {
    match op {
        Opcode::Equal => Opcode::BranchZ,
        Opcode::NotEqual => Opcode::BranchNZ,
        Opcode::GreaterThanUnsigned => Opcode::BranchA,
        Opcode::LessThanUnsigned => Opcode::BranchB,
        Opcode::GreaterThanEqualUnsigned => Opcode::BranchAE,
        Opcode::LessThanEqualUnsigned => Opcode::BranchBE,
        Opcode::GreaterThanSigned => Opcode::BranchG,
        Opcode::LessThanSigned => Opcode::BranchL,
        Opcode::GreaterThanEqualSigned => Opcode::BranchGE,
        Opcode::LessThanEqualSigned => Opcode::BranchLE,
        _ => crate::jit_abort!("not a comparison: {op}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use strum::IntoEnumIterator;

    #[test]
    fn table_matches_enum() {
        for op in Opcode::iter() {
            assert_eq!(Opcode::from_repr(op as u8), Some(op));
            // Every opcode has exactly one entry: indexing must not panic.
            let _ = op.properties();
        }
    }

    #[test]
    fn properties() {
        assert_eq!(Opcode::Call.flag_effect(), FlagEffect::Invalidate);
        assert_eq!(Opcode::Call.size_type(), OperandSizeType::Always64);
        assert_eq!(Opcode::Add.flag_effect(), FlagEffect::Set);
        assert_eq!(Opcode::Add.size_type(), OperandSizeType::Out);
        // The destination is read and written in place; the source may be in memory.
        assert!(Opcode::Add.input_needs_reg(0));
        assert!(!Opcode::Add.input_needs_reg(1));
        assert!(!Opcode::Add.input_needs_reg(2));
        assert!(!Opcode::Guard.input_needs_reg(0));
        assert!(!Opcode::Guard.input_needs_reg(1));
        assert!(Opcode::Guard.input_needs_reg(2));
        assert!(!Opcode::Guard.input_needs_reg(3));
        assert!(!Opcode::Test.output_needs_reg());
        assert!(!Opcode::Pop.output_needs_reg());
        assert!(Opcode::Move.output_needs_reg());
        assert_eq!(Opcode::Move.flag_effect(), FlagEffect::None);
        assert_eq!(Opcode::Fadd.size_type(), OperandSizeType::Always64);
        assert!(Opcode::Fdiv.input_needs_reg(1));
        assert_eq!(Opcode::Inc.flag_effect(), FlagEffect::Set);
        assert_eq!(Opcode::YieldValue.flag_effect(), FlagEffect::Invalidate);
        assert_eq!(Opcode::Lea.size_type(), OperandSizeType::Always64);
    }

    #[test]
    fn negate_is_self_inverse() {
        let mut n = 0;
        for op in Opcode::iter().filter(|op| op.is_branch_cc()) {
            let neg = negate_branch_cc(op);
            assert!(neg.is_branch_cc());
            assert_ne!(neg, op);
            assert_eq!(negate_branch_cc(neg), op);
            n += 1;
        }
        assert_eq!(n, 10);
    }

    #[test]
    fn flip_branch_is_self_inverse() {
        for op in Opcode::iter()
            .filter(|op| op.is_branch_cc() && !matches!(op, Opcode::BranchZ | Opcode::BranchNZ))
        {
            assert_eq!(flip_branch_cc_direction(flip_branch_cc_direction(op)), op);
        }
        assert_eq!(flip_branch_cc_direction(Opcode::BranchGE), Opcode::BranchLE);
    }

    #[test]
    fn flip_comparison() {
        for op in Opcode::iter().filter(|op| op.is_compare()) {
            assert_eq!(flip_comparison_direction(flip_comparison_direction(op)), op);
        }
        assert_eq!(flip_comparison_direction(Opcode::Equal), Opcode::Equal);
        assert_eq!(
            flip_comparison_direction(Opcode::GreaterThanSigned),
            Opcode::LessThanSigned
        );
    }

    #[test]
    fn compare_to_branch_is_injective() {
        let mut seen = HashSet::new();
        let mut n = 0;
        for op in Opcode::iter().filter(|op| op.is_compare()) {
            let b = compare_to_branch_cc(op);
            assert!(b.is_branch_cc());
            assert!(seen.insert(b));
            n += 1;
        }
        assert_eq!(n, 10);
        // Flipping a comparison and then its branch gets back to the same branch.
        for op in Opcode::iter().filter(|op| op.is_compare()) {
            let b = compare_to_branch_cc(op);
            if matches!(op, Opcode::Equal | Opcode::NotEqual) {
                continue;
            }
            assert_eq!(
                compare_to_branch_cc(flip_comparison_direction(op)),
                flip_branch_cc_direction(b)
            );
        }
    }

    #[test]
    #[should_panic(expected = "not a conditional branch")]
    fn negate_outside_domain() {
        negate_branch_cc(Opcode::Add);
    }

    #[test]
    #[should_panic(expected = "branch has no direction")]
    fn flip_outside_domain() {
        flip_branch_cc_direction(Opcode::BranchZ);
    }

    #[test]
    #[should_panic(expected = "not a comparison")]
    fn compare_outside_domain() {
        compare_to_branch_cc(Opcode::BranchZ);
    }
}
