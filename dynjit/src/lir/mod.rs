//! The low-level IR (LIR).
//!
//! LIR is close to x64: instructions have at most one output and an ordered list of inputs, each
//! of which is an [Operand] that names a virtual register, a physical location, an immediate, or
//! a memory address. Virtual registers are in SSA form: a virtual register *is* the instruction
//! which defines it, and an input refers to it by that instruction's [InstrId]. The [Function]
//! arena keeps, for every definition, the list of instructions that use it.

use crate::{codegen::phyloc::PhyLocation, deopt::DeoptMetadata, hir};
use std::fmt::{self, Write};
use strum::Display;
use typed_index_collections::TiVec;

pub mod lower;
pub mod opcode;

pub use opcode::Opcode;
use opcode::OperandSizeType;

/// An instruction's stable index in its [Function]'s arena.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InstrId(u32);
index_type!(InstrId);

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlockId(u32);
index_type!(BlockId);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum DataType {
    #[strum(serialize = "8")]
    Bits8,
    #[strum(serialize = "16")]
    Bits16,
    #[strum(serialize = "32")]
    Bits32,
    #[strum(serialize = "64")]
    Bits64,
    Double,
    Object,
}

impl DataType {
    pub fn size_bits(self) -> u32 {
        match self {
            DataType::Bits8 => 8,
            DataType::Bits16 => 16,
            DataType::Bits32 => 32,
            DataType::Bits64 | DataType::Double | DataType::Object => 64,
        }
    }
}

/// The base or index register of a memory operand.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemReg {
    VReg(InstrId),
    Phy(PhyLocation),
}

impl fmt::Display for MemReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemReg::VReg(i) => write!(f, "{i}"),
            MemReg::Phy(r) => write!(f, "{r}"),
        }
    }
}

/// `[base + index * 2^scale + offset]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryIndirect {
    pub base: MemReg,
    pub index: Option<MemReg>,
    pub scale: u8,
    pub offset: i32,
}

impl MemoryIndirect {
    /// The offset as it is printed after the base and index: empty, ` + 0x..` or ` - 0x..`.
    fn fmt_offset(&self) -> String {
        match self.offset {
            0 => String::new(),
            o if o < 0 => format!(" - {:#x}", -i64::from(o)),
            o => format!(" + {o:#x}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OperandKind {
    /// An immediate. Doubles are stored as their bit pattern.
    Imm(u64),
    /// The output of the instruction which owns this operand.
    VReg,
    /// An input: the output of another instruction.
    Linked(InstrId),
    Reg(PhyLocation),
    Stack(PhyLocation),
    /// An absolute memory address.
    Addr(u64),
    Ind(MemoryIndirect),
    Label(BlockId),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Operand {
    pub kind: OperandKind,
    pub ty: DataType,
    /// Set by the register allocator if this is the last use of a virtual register.
    pub last_use: bool,
}

impl Operand {
    fn new(kind: OperandKind, ty: DataType) -> Self {
        Operand {
            kind,
            ty,
            last_use: false,
        }
    }

    pub fn imm(v: u64, ty: DataType) -> Self {
        Self::new(OperandKind::Imm(v), ty)
    }

    pub fn double(v: f64) -> Self {
        Self::new(OperandKind::Imm(v.to_bits()), DataType::Double)
    }

    pub fn linked(def: InstrId, ty: DataType) -> Self {
        Self::new(OperandKind::Linked(def), ty)
    }

    pub fn reg(r: PhyLocation, ty: DataType) -> Self {
        crate::jit_check!(r.is_register(), "{r} is not a register");
        Self::new(OperandKind::Reg(r), ty)
    }

    /// A register if `loc` is a register, otherwise a stack slot.
    pub fn phy_or_stack(loc: PhyLocation, ty: DataType) -> Self {
        if loc.is_register() {
            Self::new(OperandKind::Reg(loc), ty)
        } else {
            Self::new(OperandKind::Stack(loc), ty)
        }
    }

    pub fn addr(a: u64, ty: DataType) -> Self {
        Self::new(OperandKind::Addr(a), ty)
    }

    /// `[base + offset]`.
    pub fn ind(base: MemReg, offset: i32, ty: DataType) -> Self {
        Self::new(
            OperandKind::Ind(MemoryIndirect {
                base,
                index: None,
                scale: 0,
                offset,
            }),
            ty,
        )
    }

    pub fn label(b: BlockId) -> Self {
        Self::new(OperandKind::Label(b), DataType::Bits64)
    }

    pub fn size_bits(&self) -> u32 {
        self.ty.size_bits()
    }

    /// If this is a virtual register input, the instruction defining it.
    pub fn def(&self) -> Option<InstrId> {
        match self.kind {
            OperandKind::Linked(d) => Some(d),
            _ => None,
        }
    }

    /// Every virtual register this operand reads, including memory operand registers.
    pub fn vregs(&self) -> Vec<InstrId> {
        match self.kind {
            OperandKind::Linked(d) => vec![d],
            OperandKind::Ind(m) => [Some(m.base), m.index]
                .into_iter()
                .flatten()
                .filter_map(|r| match r {
                    MemReg::VReg(d) => Some(d),
                    MemReg::Phy(_) => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_imm(&self) -> bool {
        matches!(self.kind, OperandKind::Imm(_))
    }

    fn fmt_imm(v: u64) -> String {
        if v < 0x10000 {
            v.to_string()
        } else {
            format!("{v:#x}")
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OperandKind::Imm(v) if self.ty == DataType::Double => {
                write!(f, "{:?}", f64::from_bits(v))
            }
            OperandKind::Imm(v) => write!(f, "{}", Operand::fmt_imm(v)),
            OperandKind::VReg => write!(f, "<vreg>"),
            OperandKind::Linked(d) => write!(f, "{d}"),
            OperandKind::Reg(r) | OperandKind::Stack(r) => write!(f, "{r}"),
            OperandKind::Addr(a) => write!(f, "[{a:#x}]"),
            OperandKind::Ind(m) => {
                write!(f, "[{}", m.base)?;
                if let Some(i) = m.index {
                    write!(f, " + {i} * {}", 1 << m.scale)?;
                }
                write!(f, "{}]", m.fmt_offset())
            }
            OperandKind::Label(b) => write!(f, "BB{b}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Instr {
    pub id: InstrId,
    pub opcode: Opcode,
    pub output: Option<Operand>,
    pub inputs: Vec<Operand>,
    /// The HIR instruction this was lowered from.
    pub origin: Option<hir::InstrIdx>,
}

impl Instr {
    /// The width in bits that input `i` (or the output, if `i` is `None`) is used at.
    pub fn operand_size(&self, i: Option<usize>) -> u32 {
        let own = match i {
            Some(i) => self.inputs[i].size_bits(),
            None => self.output.map_or(64, |o| o.size_bits()),
        };
        match self.opcode.size_type() {
            OperandSizeType::Default => own,
            OperandSizeType::Always64 => 64,
            OperandSizeType::Out => self
                .output
                .or_else(|| self.inputs.first().copied())
                .map_or(own, |o| o.size_bits()),
        }
    }

    /// Does this instruction define a virtual register?
    pub fn defines_vreg(&self) -> bool {
        matches!(
            self.output,
            Some(Operand {
                kind: OperandKind::VReg,
                ..
            })
        )
    }

    /// For a phi, the value flowing in from `pred`.
    pub fn operand_by_predecessor(&self, pred: BlockId) -> Option<&Operand> {
        crate::jit_check!(self.opcode == Opcode::Phi, "{} is not a phi", self.opcode);
        self.inputs
            .chunks(2)
            .find(|c| c[0].kind == OperandKind::Label(pred))
            .map(|c| &c[1])
    }

    /// The blocks a terminator may transfer control to, in operand order.
    pub fn successors(&self) -> Vec<BlockId> {
        if !self.opcode.is_terminator() {
            return Vec::new();
        }
        self.inputs
            .iter()
            .filter_map(|o| match o.kind {
                OperandKind::Label(b) => Some(b),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct Block {
    pub instrs: Vec<InstrId>,
}

pub struct Function {
    pub name: String,
    pub instrs: TiVec<InstrId, Instr>,
    pub blocks: TiVec<BlockId, Block>,
    uses: TiVec<InstrId, Vec<InstrId>>,
    /// Stamped onto every instruction as it is created.
    pub origin: Option<hir::InstrIdx>,
    /// The deopt points of this function, referred to by index from `Guard` instructions.
    pub deopts: Vec<DeoptMetadata>,
}

impl Function {
    pub fn new(name: &str) -> Self {
        Function {
            name: name.to_owned(),
            instrs: TiVec::new(),
            blocks: TiVec::new(),
            uses: TiVec::new(),
            origin: None,
            deopts: Vec::new(),
        }
    }

    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push_and_get_key(Block::default())
    }

    /// Append an instruction to `b`. If `out` is `Some`, the instruction defines a virtual
    /// register of that type.
    pub fn push(
        &mut self,
        b: BlockId,
        opcode: Opcode,
        out: Option<DataType>,
        inputs: Vec<Operand>,
    ) -> InstrId {
        let output = out.map(|ty| Operand::new(OperandKind::VReg, ty));
        self.push_with_output(b, opcode, output, inputs)
    }

    /// Append an instruction whose output, if any, is given explicitly.
    pub fn push_with_output(
        &mut self,
        b: BlockId,
        opcode: Opcode,
        output: Option<Operand>,
        inputs: Vec<Operand>,
    ) -> InstrId {
        let id = InstrId::new(self.instrs.len());
        for def in inputs.iter().flat_map(|o| o.vregs()) {
            self.uses[def].push(id);
        }
        self.instrs.push(Instr {
            id,
            opcode,
            output,
            inputs,
            origin: self.origin,
        });
        self.uses.push(Vec::new());
        self.blocks[b].instrs.push(id);
        id
    }

    /// Append an input to an existing instruction, e.g. to fill in a phi.
    pub fn add_input(&mut self, id: InstrId, op: Operand) {
        for def in op.vregs() {
            self.uses[def].push(id);
        }
        self.instrs[id].inputs.push(op);
    }

    /// The instructions which use the virtual register defined by `def`.
    pub fn uses(&self, def: InstrId) -> &[InstrId] {
        &self.uses[def]
    }

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id]
    }

    /// The type of the virtual register defined by `def`.
    pub fn output_type(&self, def: InstrId) -> DataType {
        match self.instrs[def].output {
            Some(o) => o.ty,
            None => crate::jit_abort!("{def} has no output"),
        }
    }

    pub fn block_instrs(&self, b: BlockId) -> impl Iterator<Item = &Instr> + '_ {
        self.blocks[b].instrs.iter().map(move |i| &self.instrs[*i])
    }

    pub fn successors(&self, b: BlockId) -> Vec<BlockId> {
        self.blocks[b]
            .instrs
            .last()
            .map(|i| self.instrs[*i].successors())
            .unwrap_or_default()
    }

    /// The predecessors of each block, in increasing order.
    pub fn predecessors(&self) -> TiVec<BlockId, Vec<BlockId>> {
        let mut preds: TiVec<BlockId, Vec<BlockId>> =
            self.blocks.iter().map(|_| Vec::new()).collect();
        for b in self.blocks.keys() {
            for s in self.successors(b) {
                if !preds[s].contains(&b) {
                    preds[s].push(b);
                }
            }
        }
        for p in preds.iter_mut() {
            p.sort();
        }
        preds
    }

    /// Render this function. If `locs` is given, virtual registers are shown at their allocated
    /// locations.
    pub fn display<'a>(
        &'a self,
        locs: Option<&'a TiVec<InstrId, PhyLocation>>,
    ) -> DisplayFunction<'a> {
        DisplayFunction { func: self, locs }
    }
}

pub struct DisplayFunction<'a> {
    func: &'a Function,
    locs: Option<&'a TiVec<InstrId, PhyLocation>>,
}

impl DisplayFunction<'_> {
    /// Render a single instruction of the function.
    pub fn instr(&self, instr: &Instr) -> String {
        let mut s = match instr.output {
            Some(o) if o.kind == OperandKind::VReg => {
                format!("{}:{} = ", self.vreg(instr.id), o.ty)
            }
            Some(o) => format!("{o}:{} = ", o.ty),
            None => String::new(),
        };
        s.push_str(&instr.opcode.to_string());
        let ins = instr
            .inputs
            .iter()
            .map(|o| self.operand(o))
            .collect::<Vec<_>>();
        if !ins.is_empty() {
            s.push(' ');
            s.push_str(&ins.join(", "));
        }
        s
    }

    fn vreg(&self, id: InstrId) -> String {
        match self.locs {
            Some(locs) => locs[id].to_string(),
            None => id.to_string(),
        }
    }

    fn operand(&self, o: &Operand) -> String {
        match o.kind {
            OperandKind::Linked(d) => self.vreg(d),
            OperandKind::Ind(m) if self.locs.is_some() => {
                let r = |r: MemReg| match r {
                    MemReg::VReg(d) => self.vreg(d),
                    MemReg::Phy(p) => p.to_string(),
                };
                let mut s = format!("[{}", r(m.base));
                if let Some(i) = m.index {
                    s.push_str(&format!(" + {} * {}", r(i), 1 << m.scale));
                }
                s.push_str(&m.fmt_offset());
                s.push(']');
                s
            }
            _ => o.to_string(),
        }
    }
}

impl fmt::Display for DisplayFunction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let func = self.func;
        let preds = func.predecessors();
        let mut s = String::new();
        writeln!(s, "Function {}", func.name)?;
        for b in func.blocks.keys() {
            writeln!(s, "BB {b}")?;
            let ps = preds[b].iter().map(|p| p.to_string()).collect::<Vec<_>>();
            let ss = func
                .successors(b)
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>();
            let edges = format!("- preds: {} succs: {}", ps.join(" "), ss.join(" "));
            writeln!(s, "{}", edges.trim_end())?;
            for instr in func.block_instrs(b) {
                writeln!(s, "{}", self.instr(instr))?;
            }
        }
        f.write_str(s.trim_end())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn use_lists_and_phis() {
        let mut f = Function::new("t");
        let b0 = f.new_block();
        let b1 = f.new_block();
        let b2 = f.new_block();
        let x = f.push(
            b0,
            Opcode::Move,
            Some(DataType::Bits64),
            vec![Operand::imm(1, DataType::Bits64)],
        );
        f.push(b0, Opcode::Test, None, vec![Operand::linked(x, DataType::Bits64); 2]);
        f.push(b0, Opcode::BranchNZ, None, vec![Operand::label(b1), Operand::label(b2)]);
        let y = f.push(
            b1,
            Opcode::Add,
            Some(DataType::Bits64),
            vec![Operand::linked(x, DataType::Bits64), Operand::imm(2, DataType::Bits64)],
        );
        f.push(b1, Opcode::Branch, None, vec![Operand::label(b2)]);
        let phi = f.push(b2, Opcode::Phi, Some(DataType::Bits64), Vec::new());
        f.add_input(phi, Operand::label(b0));
        f.add_input(phi, Operand::linked(x, DataType::Bits64));
        f.add_input(phi, Operand::label(b1));
        f.add_input(phi, Operand::linked(y, DataType::Bits64));
        f.push(b2, Opcode::Return, None, vec![Operand::linked(phi, DataType::Bits64)]);

        assert_eq!(f.uses(x), &[InstrId::new(1), InstrId::new(1), y, phi]);
        assert_eq!(f.uses(y), &[phi]);
        assert_eq!(
            f.instr(phi).operand_by_predecessor(b1).and_then(|o| o.def()),
            Some(y)
        );
        assert!(f.instr(phi).operand_by_predecessor(b2).is_none());
        assert_eq!(f.predecessors()[b2], vec![b0, b1]);

        let expected = "Function t
BB %0
- preds:  succs: %1 %2
%0:64 = Move 1
Test %0, %0
BranchNZ BB%1, BB%2
BB %1
- preds: %0 succs: %2
%3:64 = Add %0, 2
Branch BB%2
BB %2
- preds: %0 %1 succs:
%5:64 = Phi BB%0, %0, BB%1, %3
Return %5";
        assert_eq!(f.to_string(), expected);
    }

    #[test]
    fn operand_sizes() {
        let mut f = Function::new("t");
        let b = f.new_block();
        let x = f.push(
            b,
            Opcode::Move,
            Some(DataType::Bits32),
            vec![Operand::imm(1, DataType::Bits8)],
        );
        let c = f.push(
            b,
            Opcode::Call,
            Some(DataType::Bits8),
            vec![Operand::imm(0x1000_0000, DataType::Bits64), Operand::linked(x, DataType::Bits32)],
        );
        let cmp = f.push(
            b,
            Opcode::Equal,
            Some(DataType::Bits8),
            vec![Operand::linked(x, DataType::Bits32), Operand::linked(c, DataType::Bits8)],
        );
        // `Out`: the input takes the output's size.
        assert_eq!(f.instr(x).operand_size(Some(0)), 32);
        // `Always64`.
        assert_eq!(f.instr(c).operand_size(Some(1)), 64);
        assert_eq!(f.instr(c).operand_size(None), 64);
        // `Default`.
        assert_eq!(f.instr(cmp).operand_size(Some(0)), 32);
        assert_eq!(f.instr(cmp).operand_size(Some(1)), 8);

        let ind = Operand::ind(MemReg::VReg(x), -16, DataType::Object);
        assert_eq!(ind.vregs(), vec![x]);
        assert_eq!(ind.to_string(), "[%0 - 0x10]");
        assert_eq!(
            Operand::phy_or_stack(PhyLocation::new(-24), DataType::Object).kind,
            OperandKind::Stack(PhyLocation::new(-24))
        );
        assert_eq!(Operand::double(1.5).to_string(), "1.5");
    }

    #[test]
    fn allocated_indirect_offsets() {
        let mut f = Function::new("t");
        let b = f.new_block();
        let x = f.push(
            b,
            Opcode::Move,
            Some(DataType::Object),
            vec![Operand::imm(0x1000, DataType::Object)],
        );
        let y = f.push(
            b,
            Opcode::Move,
            Some(DataType::Object),
            vec![Operand::ind(MemReg::VReg(x), -16, DataType::Object)],
        );
        let z = f.push(
            b,
            Opcode::Move,
            Some(DataType::Object),
            vec![Operand::ind(MemReg::VReg(x), 8, DataType::Object)],
        );
        f.push(b, Opcode::Return, None, vec![Operand::linked(z, DataType::Object)]);
        let mut locs: TiVec<InstrId, PhyLocation> = TiVec::new();
        for _ in 0..f.instrs.len() {
            locs.push(PhyLocation::RAX);
        }
        locs[y] = PhyLocation::RCX;
        let shown = f.display(Some(&locs)).to_string();
        assert!(shown.contains("RCX:Object = Move [RAX - 0x10]"), "{shown}");
        assert!(shown.contains("Move [RAX + 0x8]"), "{shown}");
        // Without locations the same sign convention is used.
        assert!(f.to_string().contains("Move [%0 - 0x10]"));
    }
}
