//! Insert explicit reference counting operations.
//!
//! Afterwards every register that may hold an object owns exactly one reference to it: values
//! borrowed from elsewhere (arguments, constants, copies) are increfed when defined, and every
//! register is decrefed once it is no longer live. `Return` steals its operand's reference.
//! Deopt bases record which registers own references at that point, so that reification can
//! release them.

use super::{
    liveness::{is_live, uses, Liveness},
    Constant, Function, Instr, InstrKind, Reg, RegState, Type,
};
use crate::deopt::RefKind;

pub fn insert_refcount_ops(func: &mut Function) {
    let instrs = &func.instrs;
    for b in func.blocks.iter_mut() {
        b.instrs
            .retain(|idx| !matches!(instrs[*idx].kind, InstrKind::Snapshot(_)));
    }
    func.split_critical_edges();

    let types = func.reg_types();
    let is_obj = |r: Reg| types[r].could_be(Type::Object);
    let decref = |r: Reg| {
        let kind = if types[r].could_be(Type::Nullptr) {
            InstrKind::XDecref
        } else {
            InstrKind::Decref
        };
        Instr::new(kind, None, vec![r])
    };
    let liveness = Liveness::new(func);
    let preds = func.predecessors();

    for b in func.rpo() {
        let live_after = liveness.live_after(func, b);
        let old = func.blocks[b].instrs.clone();
        let mut new_instrs = Vec::with_capacity(old.len());

        // Values which die on the edge into this block.
        if let [p] = preds[b][..] {
            let mut dying = liveness.live_out[p]
                .iter_set_bits(..)
                .map(Reg::new)
                .collect::<Vec<_>>();
            if let Some(t) = func.terminator(p) {
                if !matches!(t.kind, InstrKind::Return) {
                    dying.extend(t.operands.iter().copied());
                }
            }
            dying.sort();
            dying.dedup();
            for r in dying {
                if is_obj(r) && !is_live(&liveness.live_in[b], r) {
                    new_instrs.push(func.instrs.push_and_get_key(decref(r)));
                }
            }
        }

        for (i, idx) in old.into_iter().enumerate() {
            new_instrs.push(idx);
            let live = &live_after[i];
            let instr = &func.instrs[idx];
            let output = instr.output;
            let mut extra = Vec::new();

            let live_regs = instr.deopt.as_ref().map(|d| {
                let mut regs = live
                    .iter_set_bits(..)
                    .map(Reg::new)
                    .filter(|r| Some(*r) != output && is_obj(*r))
                    .chain(instr.operands.iter().copied().filter(|r| is_obj(*r)))
                    .chain(d.frame_state.regs())
                    .collect::<Vec<_>>();
                regs.sort();
                regs.dedup();
                regs.into_iter()
                    .map(|reg| RegState {
                        reg,
                        ref_kind: if is_obj(reg) {
                            RefKind::Owned
                        } else {
                            RefKind::Uncounted
                        },
                    })
                    .collect::<Vec<_>>()
            });

            if !instr.is_terminator() {
                if let Some(out) = output.filter(|r| is_obj(*r)) {
                    let borrowed = matches!(
                        instr.kind,
                        InstrKind::LoadArg { .. }
                            | InstrKind::LoadConst(Constant::Object(_))
                            | InstrKind::Assign
                            | InstrKind::CheckVar { .. }
                    );
                    if !is_live(live, out) {
                        if !borrowed {
                            extra.push(decref(out));
                        }
                    } else if borrowed {
                        let kind = if types[out].could_be(Type::Nullptr) {
                            InstrKind::XIncref
                        } else {
                            InstrKind::Incref
                        };
                        extra.push(Instr::new(kind, None, vec![out]));
                    }
                }
                let mut used = uses(instr);
                used.sort();
                used.dedup();
                for r in used {
                    if Some(r) != output && is_obj(r) && !is_live(live, r) {
                        extra.push(decref(r));
                    }
                }
            }

            if let (Some(regs), Some(d)) = (live_regs, func.instrs[idx].deopt.as_mut()) {
                d.live_regs = regs;
            }
            for e in extra {
                new_instrs.push(func.instrs.push_and_get_key(e));
            }
        }
        func.blocks[b].instrs = new_instrs;
    }
}
