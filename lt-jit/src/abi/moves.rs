//! Sequencing of parallel moves between argument locations.
//!
//! A set of moves is given with parallel semantics: every source is read
//! before any destination is written. `schedule` orders them so they can be
//! executed one by one, breaking register cycles through a scratch register.

use crate::error::{JitError, JitResult};
use crate::operand::{AbiType, Fpr, Gpr, Reg};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveSrc {
    Gpr(Gpr),
    Fpr(Fpr),
    Imm(i64),
    FImm(f64),
    Mem { base: Gpr, offset: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDst {
    Gpr(Gpr),
    Fpr(Fpr),
    Mem { base: Gpr, offset: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Move {
    pub ty: AbiType,
    pub dst: MoveDst,
    pub src: MoveSrc,
}

impl Move {
    fn reads(&self) -> Option<Reg> {
        match self.src {
            MoveSrc::Gpr(reg) => Some(Reg::Gpr(reg)),
            MoveSrc::Fpr(reg) => Some(Reg::Fpr(reg)),
            MoveSrc::Mem { base, .. } => Some(Reg::Gpr(base)),
            MoveSrc::Imm(_) | MoveSrc::FImm(_) => None,
        }
    }

    fn writes(&self) -> Option<Reg> {
        match self.dst {
            MoveDst::Gpr(reg) => Some(Reg::Gpr(reg)),
            MoveDst::Fpr(reg) => Some(Reg::Fpr(reg)),
            MoveDst::Mem { .. } => None,
        }
    }

    fn is_noop(&self) -> bool {
        let same = match (self.dst, self.src) {
            (MoveDst::Gpr(dst), MoveSrc::Gpr(src)) => dst == src,
            (MoveDst::Fpr(dst), MoveSrc::Fpr(src)) => dst == src,
            _ => false,
        };
        same && !needs_extension(self.ty)
    }

    fn redirect(&mut self, from: Reg, to: Reg) {
        match (&mut self.src, from, to) {
            (MoveSrc::Gpr(reg), Reg::Gpr(old), Reg::Gpr(new)) if *reg == old => *reg = new,
            (MoveSrc::Fpr(reg), Reg::Fpr(old), Reg::Fpr(new)) if *reg == old => *reg = new,
            (MoveSrc::Mem { base, .. }, Reg::Gpr(old), Reg::Gpr(new)) if *base == old => {
                *base = new
            }
            _ => {}
        }
    }

    fn check_class(&self) -> JitResult<()> {
        let float_dst = matches!(self.dst, MoveDst::Fpr(_));
        let ok = match self.src {
            MoveSrc::Gpr(_) | MoveSrc::Imm(_) => !float_dst && !self.ty.is_float(),
            MoveSrc::Fpr(_) | MoveSrc::FImm(_) => {
                self.ty.is_float() && !matches!(self.dst, MoveDst::Gpr(_))
            }
            MoveSrc::Mem { .. } => true,
        };
        let dst_ok = match self.dst {
            MoveDst::Gpr(_) => !self.ty.is_float(),
            MoveDst::Fpr(_) => self.ty.is_float(),
            MoveDst::Mem { .. } => true,
        };
        if ok && dst_ok {
            Ok(())
        } else {
            Err(JitError::InvalidOperand(format!(
                "cannot move a {} value from {:?} to {:?}",
                self.ty, self.src, self.dst
            )))
        }
    }
}

/// Integer types narrower than a word are widened when they land in a
/// register.
pub fn needs_extension(ty: AbiType) -> bool {
    matches!(
        ty,
        AbiType::Int8
            | AbiType::Uint8
            | AbiType::Int16
            | AbiType::Uint16
            | AbiType::Int32
            | AbiType::Uint32
    )
}

/// Orders `moves` for sequential execution.
///
/// Stores to memory go first, while every register still holds its original
/// value. Register-to-register moves and memory loads follow, each one
/// emitted once no pending move still reads its destination. Immediates come
/// last since they read nothing.
pub fn schedule(moves: &[Move], scratch_gpr: Gpr, scratch_fpr: Fpr) -> JitResult<Vec<Move>> {
    let mut claimed: Vec<Reg> = Vec::new();
    for mv in moves {
        mv.check_class()?;
        if let Some(dst) = mv.writes() {
            if claimed.contains(&dst) {
                return Err(JitError::InvalidOperandAssignment(format!(
                    "register {dst:?} is the destination of more than one value"
                )));
            }
            if dst == Reg::Gpr(scratch_gpr) || dst == Reg::Fpr(scratch_fpr) {
                return Err(JitError::InvalidOperandAssignment(format!(
                    "register {dst:?} is reserved as scratch"
                )));
            }
            claimed.push(dst);
        }
    }

    let mut ordered = Vec::with_capacity(moves.len() + 1);
    let mut pending = Vec::new();
    let mut immediates = Vec::new();
    for mv in moves {
        match (mv.dst, mv.src) {
            (MoveDst::Mem { .. }, _) => ordered.push(*mv),
            _ if mv.is_noop() => {}
            (_, MoveSrc::Imm(_) | MoveSrc::FImm(_)) => immediates.push(*mv),
            _ => pending.push(*mv),
        }
    }

    while !pending.is_empty() {
        let ready = (0..pending.len()).find(|&index| {
            let dst = pending[index].writes();
            !pending
                .iter()
                .enumerate()
                .any(|(other, mv)| other != index && mv.reads() == dst)
        });
        if let Some(index) = ready {
            ordered.push(pending.remove(index));
            continue;
        }

        // Every destination is still needed: park one in scratch.
        let Some(blocked) = pending[0].writes() else {
            break;
        };
        let (save, scratch) = match blocked {
            Reg::Gpr(reg) => (
                Move {
                    ty: AbiType::IntMax,
                    dst: MoveDst::Gpr(scratch_gpr),
                    src: MoveSrc::Gpr(reg),
                },
                Reg::Gpr(scratch_gpr),
            ),
            Reg::Fpr(reg) => (
                Move {
                    ty: AbiType::Float64,
                    dst: MoveDst::Fpr(scratch_fpr),
                    src: MoveSrc::Fpr(reg),
                },
                Reg::Fpr(scratch_fpr),
            ),
        };
        ordered.push(save);
        for mv in pending.iter_mut().skip(1) {
            mv.redirect(blocked, scratch);
        }
    }

    ordered.extend(immediates);
    Ok(ordered)
}
