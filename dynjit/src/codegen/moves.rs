//! Sequentialise parallel moves.
//!
//! Phi edges and call arguments both require a set of values to be moved "simultaneously" into
//! their destinations. This module orders such a set so that no move overwrites a location that
//! a later move still needs to read, breaking cycles through a scratch register.

use super::phyloc::PhyLocation;
use std::fmt;

/// The register used to break move cycles. It is never allocated.
pub const CYCLE_SCRATCH: PhyLocation = PhyLocation::R10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MoveSrc {
    Loc(PhyLocation),
    Imm(u64),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Move {
    pub dst: PhyLocation,
    pub src: MoveSrc,
}

impl Move {
    pub fn new(dst: PhyLocation, src: MoveSrc) -> Self {
        Move { dst, src }
    }

    fn reads(&self, loc: PhyLocation) -> bool {
        self.src == MoveSrc::Loc(loc)
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.src {
            MoveSrc::Loc(l) => write!(f, "{} <- {l}", self.dst),
            MoveSrc::Imm(v) => write!(f, "{} <- {v:#x}", self.dst),
        }
    }
}

/// Order `moves`, which must have distinct destinations, so that executing them one after the
/// other has the same effect as executing them in parallel. The output may use [CYCLE_SCRATCH].
///
/// The result depends only on the order of `moves`.
pub fn sequentialise(moves: &[Move]) -> Vec<Move> {
    let mut pending = moves
        .iter()
        .filter(|m| m.src != MoveSrc::Loc(m.dst))
        .copied()
        .collect::<Vec<_>>();
    for (i, m) in pending.iter().enumerate() {
        crate::jit_check!(
            pending[i + 1..].iter().all(|n| n.dst != m.dst),
            "{} is the destination of more than one move",
            m.dst
        );
        crate::jit_check!(
            m.dst != CYCLE_SCRATCH && !m.reads(CYCLE_SCRATCH),
            "{m} uses the cycle scratch register"
        );
    }

    let mut ordered = Vec::with_capacity(pending.len() + 1);
    while !pending.is_empty() {
        // A move is ready if nothing still pending reads its destination.
        let ready = pending
            .iter()
            .position(|m| !pending.iter().any(|n| n.reads(m.dst)));
        match ready {
            Some(i) => ordered.push(pending.remove(i)),
            None => {
                // Everything left is part of a cycle (or reads from one). Free the first
                // destination by copying its current value aside.
                let d = pending[0].dst;
                ordered.push(Move::new(CYCLE_SCRATCH, MoveSrc::Loc(d)));
                for m in pending.iter_mut() {
                    if m.reads(d) {
                        m.src = MoveSrc::Loc(CYCLE_SCRATCH);
                    }
                }
            }
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l(p: PhyLocation) -> MoveSrc {
        MoveSrc::Loc(p)
    }

    /// Run `moves` over a fake machine state, returning the final value of each location in
    /// `check`.
    fn run(moves: &[Move], init: &[(PhyLocation, u64)], check: &[PhyLocation]) -> Vec<u64> {
        let mut state = init.to_vec();
        let get = |state: &Vec<(PhyLocation, u64)>, p: PhyLocation| {
            state.iter().find(|(q, _)| *q == p).map(|(_, v)| *v).unwrap_or(0)
        };
        for m in moves {
            let v = match m.src {
                MoveSrc::Loc(p) => get(&state, p),
                MoveSrc::Imm(v) => v,
            };
            state.retain(|(q, _)| *q != m.dst);
            state.push((m.dst, v));
        }
        check.iter().map(|p| get(&state, *p)).collect()
    }

    #[test]
    fn chain() {
        // rdi <- rax, rsi <- rdi: rsi must be written first.
        let moves = [
            Move::new(PhyLocation::RDI, l(PhyLocation::RAX)),
            Move::new(PhyLocation::RSI, l(PhyLocation::RDI)),
        ];
        let seq = sequentialise(&moves);
        assert_eq!(seq, vec![moves[1], moves[0]]);
    }

    #[test]
    fn swap() {
        let moves = [
            Move::new(PhyLocation::RDI, l(PhyLocation::RSI)),
            Move::new(PhyLocation::RSI, l(PhyLocation::RDI)),
        ];
        let seq = sequentialise(&moves);
        assert_eq!(seq.len(), 3);
        assert_eq!(seq[0], Move::new(CYCLE_SCRATCH, l(PhyLocation::RDI)));
        let init = [(PhyLocation::RDI, 1), (PhyLocation::RSI, 2)];
        assert_eq!(
            run(&seq, &init, &[PhyLocation::RDI, PhyLocation::RSI]),
            vec![2, 1]
        );
    }

    #[test]
    fn cycle_with_stack_slot_and_immediates() {
        let slot = PhyLocation::stack_slot(16);
        let moves = [
            Move::new(PhyLocation::RAX, l(slot)),
            Move::new(slot, l(PhyLocation::RCX)),
            Move::new(PhyLocation::RCX, l(PhyLocation::RAX)),
            Move::new(PhyLocation::RDX, MoveSrc::Imm(7)),
            Move::new(PhyLocation::RBX, l(PhyLocation::RBX)),
            Move::new(PhyLocation::R8, l(PhyLocation::RAX)),
        ];
        let seq = sequentialise(&moves);
        assert!(!seq.iter().any(|m| m.dst == PhyLocation::RBX));
        let init = [
            (PhyLocation::RAX, 1),
            (slot, 2),
            (PhyLocation::RCX, 3),
            (PhyLocation::RBX, 9),
        ];
        assert_eq!(
            run(
                &seq,
                &init,
                &[
                    PhyLocation::RAX,
                    slot,
                    PhyLocation::RCX,
                    PhyLocation::RDX,
                    PhyLocation::RBX,
                    PhyLocation::R8
                ]
            ),
            vec![2, 3, 1, 7, 9, 1]
        );
    }

    #[test]
    #[should_panic(expected = "destination of more than one move")]
    fn duplicate_destinations() {
        sequentialise(&[
            Move::new(PhyLocation::RAX, MoveSrc::Imm(1)),
            Move::new(PhyLocation::RAX, MoveSrc::Imm(2)),
        ]);
    }
}
