//! Backwards liveness analysis over HIR registers.
//!
//! A frame state keeps every register it mentions alive: if the instruction deoptimises, the
//! interpreter needs those values.

use super::{BlockId, Function, Instr, InstrKind, Reg};
use typed_index_collections::TiVec;
use vob::Vob;

/// Every register `instr` reads, including those in its frame state.
pub fn uses(instr: &Instr) -> Vec<Reg> {
    let mut out = instr.operands.clone();
    if let InstrKind::Snapshot(fs) = &instr.kind {
        out.extend(fs.regs());
    }
    if let Some(d) = &instr.deopt {
        out.extend(d.frame_state.regs());
    }
    out
}

pub struct Liveness {
    pub live_in: TiVec<BlockId, Vob>,
    pub live_out: TiVec<BlockId, Vob>,
}

impl Liveness {
    pub fn new(func: &Function) -> Self {
        let n = func.num_regs();
        let mut live_in: TiVec<BlockId, Vob> =
            func.blocks.iter().map(|_| Vob::from_elem(false, n)).collect();
        let mut live_out = live_in.clone();
        let mut order = func.rpo();
        order.reverse();
        loop {
            let mut changed = false;
            for b in &order {
                let mut out = Vob::from_elem(false, n);
                for s in func.successors(*b) {
                    out.or(&live_in[s]);
                }
                let mut live = out.clone();
                for (_, instr) in func.block_instrs(*b).collect::<Vec<_>>().into_iter().rev() {
                    transfer(&mut live, instr);
                }
                live_out[*b] = out;
                if live != live_in[*b] {
                    live_in[*b] = live;
                    changed = true;
                }
            }
            if !changed {
                return Liveness { live_in, live_out };
            }
        }
    }

    /// The registers live immediately after each instruction of `b`, in block order.
    pub fn live_after(&self, func: &Function, b: BlockId) -> Vec<Vob> {
        let instrs = func.block_instrs(b).collect::<Vec<_>>();
        let mut out = vec![Vob::new(); instrs.len()];
        let mut live = self.live_out[b].clone();
        for (i, (_, instr)) in instrs.into_iter().enumerate().rev() {
            out[i] = live.clone();
            transfer(&mut live, instr);
        }
        out
    }
}

/// Step `live` backwards over `instr`.
fn transfer(live: &mut Vob, instr: &Instr) {
    if let Some(out) = instr.output {
        live.set(out.index(), false);
    }
    for r in uses(instr) {
        live.set(r.index(), true);
    }
}

/// Is `r` set in `v`?
pub fn is_live(v: &Vob, r: Reg) -> bool {
    v.get(r.index()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hir::builder::build,
        runtime::{
            code::{CodeBuilder, Opcode},
            Globals,
        },
    };

    #[test]
    fn loop_keeps_locals_alive() {
        // while True: x = x
        let code = CodeBuilder::new("f")
            .args(&["x"])
            .op(Opcode::LoadFast, 0)
            .op(Opcode::StoreFast, 0)
            .op(Opcode::JumpAbsolute, 0)
            .build();
        let func = build(code, &Globals::new()).unwrap();
        let l = Liveness::new(&func);
        let x = Reg::new(0);
        for b in func.rpo() {
            if b != func.entry {
                assert!(is_live(&l.live_in[b], x));
            }
        }
        assert!(!is_live(&l.live_in[func.entry], x));
    }
}
