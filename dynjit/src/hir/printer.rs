//! Textual HIR.

use super::{Constant, DeoptData, FrameState, Function, Instr, InstrKind};
use crate::deopt::RefKind;
use std::fmt::{self, Write};

fn write_frame_state(s: &mut String, fs: &FrameState, indent: &str) -> fmt::Result {
    writeln!(s, "{indent}NextInstrOffset {}", fs.next_instr_offset)?;
    if !fs.locals.is_empty() {
        write!(s, "{indent}Locals<{}>", fs.locals.len())?;
        for l in &fs.locals {
            match l {
                Some(r) => write!(s, " {r}")?,
                None => write!(s, " <null>")?,
            }
        }
        writeln!(s)?;
    }
    if !fs.stack.is_empty() {
        write!(s, "{indent}Stack<{}>", fs.stack.len())?;
        for r in &fs.stack {
            write!(s, " {r}")?;
        }
        writeln!(s)?;
    }
    if !fs.block_stack.is_empty() {
        writeln!(s, "{indent}BlockStack {{")?;
        for b in &fs.block_stack {
            writeln!(
                s,
                "{indent}  Opcode {} HandlerOff {} StackLevel {}",
                b.opcode, b.handler_off, b.level
            )?;
        }
        writeln!(s, "{indent}}}")?;
    }
    Ok(())
}

fn write_deopt(s: &mut String, d: &DeoptData, indent: &str) -> fmt::Result {
    if !d.live_regs.is_empty() {
        write!(s, "{indent}LiveValues<{}>", d.live_regs.len())?;
        for rs in &d.live_regs {
            let k = match rs.ref_kind {
                RefKind::Owned => "o",
                RefKind::Borrowed => "b",
                RefKind::Uncounted => "u",
                RefKind::Signed => "s",
                RefKind::Unsigned => "us",
                RefKind::Bool => "bool",
                RefKind::Double => "d",
            };
            write!(s, " {k}:{}", rs.reg)?;
        }
        writeln!(s)?;
    }
    writeln!(s, "{indent}FrameState {{")?;
    write_frame_state(s, &d.frame_state, &format!("{indent}  "))?;
    writeln!(s, "{indent}}}")
}

impl InstrKind {
    pub fn name(&self) -> &'static str {
        match self {
            InstrKind::LoadArg { .. } => "LoadArg",
            InstrKind::LoadConst(_) => "LoadConst",
            InstrKind::LoadGlobal { .. } => "LoadGlobal",
            InstrKind::CheckVar { .. } => "CheckVar",
            InstrKind::Assign => "Assign",
            InstrKind::BinaryOp(_) => "BinaryOp",
            InstrKind::InPlaceOp(_) => "InPlaceOp",
            InstrKind::UnaryOp(_) => "UnaryOp",
            InstrKind::Compare(_) => "Compare",
            InstrKind::IsTruthy => "IsTruthy",
            InstrKind::CondBranch { .. } => "CondBranch",
            InstrKind::CondBranchIterNotDone { .. } => "CondBranchIterNotDone",
            InstrKind::Branch(_) => "Branch",
            InstrKind::Return => "Return",
            InstrKind::VectorCall { .. } => "VectorCall",
            InstrKind::LoadAttr { .. } => "LoadAttr",
            InstrKind::LoadMethod { .. } => "LoadMethod",
            InstrKind::CallMethod { .. } => "CallMethod",
            InstrKind::MakeListTuple { is_tuple: false, .. } => "MakeList",
            InstrKind::MakeListTuple { is_tuple: true, .. } => "MakeTuple",
            InstrKind::InitListTuple { is_tuple: false, .. } => "InitList",
            InstrKind::InitListTuple { is_tuple: true, .. } => "InitTuple",
            InstrKind::StoreSubscr => "StoreSubscr",
            InstrKind::GetIter => "GetIter",
            InstrKind::InvokeIterNext => "InvokeIterNext",
            InstrKind::Guard { .. } => "Guard",
            InstrKind::Deopt => "Deopt",
            InstrKind::Snapshot(_) => "Snapshot",
            InstrKind::Incref => "Incref",
            InstrKind::XIncref => "XIncref",
            InstrKind::Decref => "Decref",
            InstrKind::XDecref => "XDecref",
        }
    }

    /// The instruction's immediate parameters, printed between `<` and `>`.
    fn params(&self) -> Option<String> {
        Some(match self {
            InstrKind::LoadArg { idx, name }
            | InstrKind::LoadGlobal {
                name_idx: idx,
                name,
            }
            | InstrKind::CheckVar { idx, name }
            | InstrKind::LoadAttr {
                name_idx: idx,
                name,
            }
            | InstrKind::LoadMethod {
                name_idx: idx,
                name,
            } => format!("{idx}; \"{name}\""),
            InstrKind::LoadConst(Constant::Nullptr) => "Nullptr".to_owned(),
            InstrKind::LoadConst(Constant::Object(o)) => format!("{}[{o:?}]", o.type_name()),
            InstrKind::BinaryOp(k) | InstrKind::InPlaceOp(k) => k.to_string(),
            InstrKind::UnaryOp(k) => k.to_string(),
            InstrKind::Compare(op) => op.to_string(),
            InstrKind::CondBranch { t, f } | InstrKind::CondBranchIterNotDone { t, f } => {
                format!("{t}, {f}")
            }
            InstrKind::Branch(b) => b.to_string(),
            InstrKind::VectorCall { nargs } | InstrKind::CallMethod { nargs } => nargs.to_string(),
            InstrKind::MakeListTuple { n, .. } | InstrKind::InitListTuple { n, .. } => {
                n.to_string()
            }
            InstrKind::Guard {
                kind,
                target: Some(o),
            } => format!("{kind}; {o:?}"),
            InstrKind::Guard { kind, target: None } => kind.to_string(),
            _ => return None,
        })
    }
}

impl Instr {
    fn write(&self, s: &mut String, indent: &str) -> fmt::Result {
        write!(s, "{indent}")?;
        if let Some(out) = self.output {
            write!(s, "{out} = ")?;
        }
        write!(s, "{}", self.kind.name())?;
        if let Some(p) = self.kind.params() {
            write!(s, "<{p}>")?;
        }
        for op in &self.operands {
            write!(s, " {op}")?;
        }
        let inner = format!("{indent}  ");
        if let InstrKind::Snapshot(fs) = &self.kind {
            writeln!(s, " {{")?;
            write_frame_state(s, fs, &inner)?;
            writeln!(s, "{indent}}}")?;
        } else if let Some(d) = &self.deopt {
            writeln!(s, " {{")?;
            write_deopt(s, d, &inner)?;
            writeln!(s, "{indent}}}")?;
        } else {
            writeln!(s)?;
        }
        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preds = self.predecessors();
        let mut s = String::new();
        writeln!(s, "fun {} {{", self.fullname())?;
        for (i, b) in self.rpo().into_iter().enumerate() {
            if i > 0 {
                writeln!(s)?;
            }
            write!(s, "  bb {b}")?;
            if !preds[b].is_empty() {
                let ps = preds[b].iter().map(|p| p.to_string()).collect::<Vec<_>>();
                write!(s, " (preds {})", ps.join(", "))?;
            }
            writeln!(s, " {{")?;
            for (_, instr) in self.block_instrs(b) {
                instr.write(&mut s, "    ")?;
            }
            writeln!(s, "  }}")?;
        }
        write!(s, "}}")?;
        f.write_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        hir::builder::build,
        runtime::{
            code::{CodeBuilder, CompareOp, Opcode},
            object::Object,
            Globals,
        },
    };

    #[test]
    fn return_global() {
        let code = CodeBuilder::new("test")
            .names(&["foo"])
            .op(Opcode::LoadGlobal, 0)
            .op(Opcode::ReturnValue, 0)
            .build();
        let func = build(code, &Globals::new()).unwrap();
        let expected = r#"fun jittestmodule:test {
  bb 0 {
    Snapshot {
      NextInstrOffset 0
    }
    v0 = LoadGlobal<0; "foo"> {
      FrameState {
        NextInstrOffset 2
      }
    }
    Snapshot {
      NextInstrOffset 2
      Stack<1> v0
    }
    Return v0
  }
}"#;
        assert_eq!(func.to_string(), expected);
    }

    #[test]
    fn and_merges_stacks() {
        // def test(x, y): return x and y
        let code = CodeBuilder::new("test")
            .args(&["x", "y"])
            .op(Opcode::LoadFast, 0)
            .op(Opcode::JumpIfFalseOrPop, 6)
            .op(Opcode::LoadFast, 1)
            .op(Opcode::ReturnValue, 0)
            .build();
        let func = build(code, &Globals::new()).unwrap();
        let expected = r#"fun jittestmodule:test {
  bb 0 {
    v0 = LoadArg<0; "x">
    v1 = LoadArg<1; "y">
    Snapshot {
      NextInstrOffset 0
      Locals<2> v0 v1
    }
    v2 = IsTruthy v0 {
      FrameState {
        NextInstrOffset 4
        Locals<2> v0 v1
        Stack<1> v0
      }
    }
    CondBranch<3, 2> v2
  }

  bb 2 (preds 0) {
    v3 = Assign v0
    Branch<1>
  }

  bb 3 (preds 0) {
    Snapshot {
      NextInstrOffset 4
      Locals<2> v0 v1
    }
    v3 = Assign v1
    Branch<1>
  }

  bb 1 (preds 2, 3) {
    Snapshot {
      NextInstrOffset 6
      Locals<2> v0 v1
      Stack<1> v3
    }
    Return v3
  }
}"#;
        assert_eq!(func.to_string(), expected);
    }

    #[test]
    fn params_and_block_stack() {
        let code = CodeBuilder::new("test")
            .args(&["a"])
            .locals(&["b"])
            .names(&["g", "append"])
            .consts(vec![Object::int(3)])
            .op(Opcode::SetupFinally, 10)
            .op(Opcode::LoadFast, 1)
            .op(Opcode::LoadConst, 0)
            .op(Opcode::CompareOp, CompareOp::Is as u8)
            .op(Opcode::PopBlock, 0)
            .op(Opcode::ReturnValue, 0)
            .op(Opcode::ReturnValue, 0)
            .build();
        let globals = Globals::new();
        let s = build(code, &globals).unwrap().to_string();
        let expected = r#"fun jittestmodule:test {
  bb 0 {
    v0 = LoadArg<0; "a">
    v1 = LoadConst<Nullptr>
    Snapshot {
      NextInstrOffset 0
      Locals<2> v0 v1
    }
    Snapshot {
      NextInstrOffset 2
      Locals<2> v0 v1
      BlockStack {
        Opcode 122 HandlerOff 12 StackLevel 0
      }
    }
    v2 = CheckVar<1; "b"> v1 {
      FrameState {
        NextInstrOffset 4
        Locals<2> v0 v1
        BlockStack {
          Opcode 122 HandlerOff 12 StackLevel 0
        }
      }
    }
    v3 = LoadConst<int[3]>
    v4 = Compare<Is> v2 v3
    Snapshot {
      NextInstrOffset 10
      Locals<2> v0 v1
      Stack<1> v4
    }
    Return v4
  }
}"#;
        assert_eq!(s, expected);
    }
}
