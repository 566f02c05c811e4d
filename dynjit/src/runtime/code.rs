//! Code objects: the unit of compilation and interpretation.
//!
//! Bytecode is "wordcode": every instruction is two bytes, an opcode followed by an 8-bit
//! argument. Offsets are in bytes.

use super::{exc::Exception, object::ObjRef};
use std::rc::Rc;
use strum::{Display, FromRepr};

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    PopTop = 1,
    RotTwo = 2,
    DupTop = 4,
    Nop = 9,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryInvert = 15,
    BinaryMultiply = 20,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    InplaceAdd = 55,
    InplaceSubtract = 56,
    InplaceMultiply = 57,
    StoreSubscr = 60,
    BinaryLshift = 62,
    BinaryRshift = 63,
    BinaryAnd = 64,
    BinaryXor = 65,
    BinaryOr = 66,
    GetIter = 68,
    InplaceXor = 78,
    ReturnValue = 83,
    PopBlock = 87,
    ForIter = 93,
    LoadConst = 100,
    BuildTuple = 102,
    BuildList = 103,
    LoadAttr = 106,
    CompareOp = 107,
    JumpForward = 110,
    JumpIfFalseOrPop = 111,
    JumpIfTrueOrPop = 112,
    JumpAbsolute = 113,
    PopJumpIfFalse = 114,
    PopJumpIfTrue = 115,
    LoadGlobal = 116,
    SetupFinally = 122,
    LoadFast = 124,
    StoreFast = 125,
    CallFunction = 131,
    LoadMethod = 160,
    CallMethod = 161,
}

impl Opcode {
    /// If this instruction (at `offset`, with argument `arg`) can jump, return the target offset.
    pub fn jump_target(self, offset: usize, arg: u8) -> Option<usize> {
        let arg = usize::from(arg);
        match self {
            Opcode::JumpAbsolute
            | Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop => Some(arg),
            Opcode::JumpForward | Opcode::ForIter | Opcode::SetupFinally => {
                Some(offset + CODE_UNIT + arg)
            }
            _ => None,
        }
    }

    /// Does control never fall through to the next instruction?
    pub fn is_unconditional_exit(self) -> bool {
        matches!(
            self,
            Opcode::ReturnValue | Opcode::JumpAbsolute | Opcode::JumpForward
        )
    }
}

/// The size in bytes of one instruction.
pub const CODE_UNIT: usize = 2;

/// `COMPARE_OP` arguments.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
pub enum CompareOp {
    LessThan = 0,
    LessThanEqual = 1,
    Equal = 2,
    NotEqual = 3,
    GreaterThan = 4,
    GreaterThanEqual = 5,
    Is = 8,
    IsNot = 9,
}

/// A decoded instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BcInstr {
    pub offset: usize,
    pub opcode: Opcode,
    pub arg: u8,
}

impl BcInstr {
    pub fn next_offset(&self) -> usize {
        self.offset + CODE_UNIT
    }

    pub fn jump_target(&self) -> Option<usize> {
        self.opcode.jump_target(self.offset, self.arg)
    }
}

#[derive(Debug)]
pub struct CodeObject {
    pub name: String,
    pub module: String,
    pub argcount: usize,
    /// Names of arguments followed by other locals.
    pub varnames: Vec<String>,
    /// Names referenced by `LOAD_GLOBAL`, `LOAD_ATTR` and `LOAD_METHOD`.
    pub names: Vec<String>,
    pub consts: Vec<ObjRef>,
    pub code: Vec<u8>,
}

impl CodeObject {
    /// The number of interpreter local slots.
    pub fn nlocalsplus(&self) -> usize {
        self.varnames.len()
    }

    pub fn fullname(&self) -> String {
        format!("{}:{}", self.module, self.name)
    }

    /// Decode the instruction at `offset`.
    pub fn instr_at(&self, offset: usize) -> Result<BcInstr, Exception> {
        match self.code.get(offset..offset + CODE_UNIT) {
            Some([op, arg]) => match Opcode::from_repr(*op) {
                Some(opcode) => Ok(BcInstr {
                    offset,
                    opcode,
                    arg: *arg,
                }),
                None => Err(Exception::new(
                    super::exc::ExceptionKind::SystemError,
                    format!("unknown opcode {op} at offset {offset}"),
                )),
            },
            _ => Err(Exception::new(
                super::exc::ExceptionKind::SystemError,
                format!("offset {offset} is out of bounds"),
            )),
        }
    }

    /// Decode every instruction.
    pub fn instrs(&self) -> Result<Vec<BcInstr>, Exception> {
        (0..self.code.len())
            .step_by(CODE_UNIT)
            .map(|off| self.instr_at(off))
            .collect()
    }
}

/// Assemble a [CodeObject] by hand.
pub struct CodeBuilder {
    name: String,
    module: String,
    argcount: usize,
    varnames: Vec<String>,
    names: Vec<String>,
    consts: Vec<ObjRef>,
    code: Vec<u8>,
}

impl CodeBuilder {
    pub fn new(name: &str) -> Self {
        CodeBuilder {
            name: name.to_owned(),
            module: "jittestmodule".to_owned(),
            argcount: 0,
            varnames: Vec::new(),
            names: Vec::new(),
            consts: Vec::new(),
            code: Vec::new(),
        }
    }

    pub fn module(mut self, module: &str) -> Self {
        self.module = module.to_owned();
        self
    }

    /// Add arguments. Must be called before [Self::locals].
    pub fn args(mut self, args: &[&str]) -> Self {
        crate::jit_check!(
            self.varnames.len() == self.argcount,
            "arguments must precede other locals"
        );
        self.argcount += args.len();
        self.varnames.extend(args.iter().map(|x| x.to_string()));
        self
    }

    pub fn locals(mut self, locals: &[&str]) -> Self {
        self.varnames.extend(locals.iter().map(|x| x.to_string()));
        self
    }

    pub fn names(mut self, names: &[&str]) -> Self {
        self.names.extend(names.iter().map(|x| x.to_string()));
        self
    }

    pub fn consts(mut self, consts: Vec<ObjRef>) -> Self {
        self.consts.extend(consts);
        self
    }

    pub fn op(mut self, opcode: Opcode, arg: u8) -> Self {
        self.code.push(opcode as u8);
        self.code.push(arg);
        self
    }

    /// The offset the next instruction will be placed at.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn build(self) -> Rc<CodeObject> {
        Rc::new(CodeObject {
            name: self.name,
            module: self.module,
            argcount: self.argcount,
            varnames: self.varnames,
            names: self.names,
            consts: self.consts,
            code: self.code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode() {
        let code = CodeBuilder::new("f")
            .args(&["x"])
            .op(Opcode::LoadFast, 0)
            .op(Opcode::JumpForward, 2)
            .op(Opcode::Nop, 0)
            .op(Opcode::ReturnValue, 0)
            .build();
        let instrs = code.instrs().unwrap();
        assert_eq!(instrs.len(), 4);
        assert_eq!(instrs[1].jump_target(), Some(6));
        assert_eq!(instrs[3].opcode, Opcode::ReturnValue);
        assert_eq!(code.fullname(), "jittestmodule:f");
        assert!(code.instr_at(8).is_err());
        assert_eq!(Opcode::LoadGlobal.to_string(), "LOAD_GLOBAL");
    }
}
