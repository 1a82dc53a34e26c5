//! The compilation session: operand checking, ABI lowering and label
//! resolution on top of a target encoder and an arena.

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::abi::moves::{self, Move, MoveDst, MoveSrc};
use crate::abi::{ArgLoc, ReturnLoc, align_up};
use crate::arena::{Arena, ExecutableCode, RawCode};
use crate::config::JitConfig;
use crate::error::{JitError, JitResult};
use crate::label::{Label, LabelTable, Reloc};
use crate::opcode::{AddrMode, Opcode, Signature};
use crate::operand::{AbiType, Arg, Fpr, Gpr, Location, Operand, Reg};
use crate::target::{Addr, Dest, Frame, Inst, Sink, Target};

/// Largest local area `enter_jit_abi` reserves.
pub const MAX_FRAME_BYTES: u32 = 1 << 20;

#[derive(Debug, Clone, Copy)]
enum Callee {
    Reg(Gpr),
    Abs(u64),
}

/// One open compilation. Emitting after [`JitState::end`] is impossible
/// because `end` consumes the session.
#[derive(Debug)]
pub struct JitState<T: Target> {
    target: T,
    arena: Arena,
    labels: LabelTable,
    poisoned: Option<JitError>,
    frame: Option<Frame>,
    /// Bytes between the entry stack pointer and the current one.
    sp_depth: u32,
}

impl<T: Target> JitState<T> {
    pub fn begin(target: T, arena: Arena) -> JitResult<Self> {
        if arena.capacity() == 0 {
            return Err(JitError::InvalidArena("capacity must be non-zero"));
        }
        if !arena.is_empty() {
            return Err(JitError::InvalidArena("arena already holds code"));
        }
        debug!(
            target = target.name(),
            capacity = arena.capacity(),
            growable = arena.is_growable(),
            "jit session opened"
        );
        Ok(Self {
            target,
            arena,
            labels: LabelTable::new(),
            poisoned: None,
            frame: None,
            sp_depth: 0,
        })
    }

    pub fn with_config(target: T, config: &JitConfig) -> JitResult<Self> {
        config.validate().map_err(|_| JitError::InvalidArena("invalid arena config"))?;
        Self::begin(target, Arena::from_config(config)?)
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Bytes emitted so far.
    pub fn offset(&self) -> usize {
        self.arena.offset()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Runs `f` unless the session is already poisoned; a failure poisons it.
    fn guard<R>(&mut self, f: impl FnOnce(&mut Self) -> JitResult<R>) -> JitResult<R> {
        if let Some(first) = &self.poisoned {
            warn!(first = %first, "call on abandoned jit session");
            return Err(JitError::Abandoned);
        }
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(error = %err, offset = self.arena.offset(), "jit session abandoned");
                self.poisoned = Some(err.clone());
                Err(err)
            }
        }
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.create()
    }

    pub fn bind(&mut self, label: Label) -> JitResult<()> {
        self.guard(|jit| jit.bind_inner(label))
    }

    /// A new label bound at the current offset, for backward branches.
    pub fn here(&mut self) -> JitResult<Label> {
        let label = self.labels.create();
        self.bind(label)?;
        Ok(label)
    }

    pub fn label_offset(&self, label: Label) -> JitResult<Option<usize>> {
        self.labels.offset(label)
    }

    fn bind_inner(&mut self, label: Label) -> JitResult<()> {
        let offset = self.arena.offset();
        let uses = self.labels.bind(label, offset)?;
        for reloc in uses {
            self.apply(reloc, offset as u64)?;
        }
        Ok(())
    }

    fn apply(&mut self, reloc: Reloc, value: u64) -> JitResult<()> {
        let mut field = self.arena.read(reloc.site, reloc.kind.len())?.to_vec();
        self.target
            .patch(reloc.kind, reloc.site, value, &mut field)?;
        self.arena.patch(reloc.site, &field)
    }

    fn dest(&self, label: Label) -> JitResult<Dest> {
        Ok(Dest {
            label,
            offset: self.labels.offset(label)?,
        })
    }

    /// Encodes `inst` at the cursor without operand checks.
    fn push(&mut self, inst: Inst) -> JitResult<()> {
        let op = inst.opcode();
        let max = self
            .target
            .max_bytes(op)
            .ok_or(JitError::UnsupportedOnTarget {
                opcode: op,
                target: self.target.name(),
            })?;
        self.arena.reserve(max)?;
        let start = self.arena.offset();
        let mut sink = Sink::new(start);
        self.target.encode(&inst, &mut sink)?;
        if sink.len() > max {
            return Err(JitError::EncodingOverflow {
                opcode: op,
                emitted: sink.len(),
                max,
            });
        }
        self.arena.write(sink.bytes())?;
        for reloc in sink.relocs() {
            self.labels.add_use(*reloc)?;
        }
        trace!(opcode = %op, offset = start, len = sink.len(), "emitted");
        Ok(())
    }

    /// Emits `op` with operands in mnemonic order: destination first,
    /// stores as `(address parts..., value)`.
    pub fn emit(&mut self, op: Opcode, args: &[Arg]) -> JitResult<()> {
        self.guard(|jit| jit.emit_inner(op, args))
    }

    fn emit_inner(&mut self, op: Opcode, args: &[Arg]) -> JitResult<()> {
        use Arg::{FImm, Gpr as G, Imm, Label as L};
        let inst = match (op.signature(), args) {
            (Signature::Gpr3, [G(dst), G(a), G(b)]) => Inst::Alu {
                op,
                dst: *dst,
                a: *a,
                b: *b,
            },
            (Signature::Gpr2Imm, [G(dst), G(a), Imm(imm)]) => {
                if matches!(op, Opcode::Lshi | Opcode::Rshi | Opcode::RshiU)
                    && !(0..64).contains(imm)
                {
                    return Err(JitError::InvalidOperand(format!(
                        "{op} shift count {imm} is not in 0..=63"
                    )));
                }
                Inst::AluImm {
                    op,
                    dst: *dst,
                    a: *a,
                    imm: *imm,
                }
            }
            (Signature::Gpr2, [G(dst), G(src)]) => Inst::Unary {
                op,
                dst: *dst,
                src: *src,
            },
            (Signature::GprImm, [G(dst), Imm(imm)]) => Inst::LoadImm {
                dst: *dst,
                imm: *imm,
            },
            (Signature::MovAddr, [G(dst), L(label)]) => Inst::MovAddr {
                dst: *dst,
                dest: self.dest(*label)?,
            },
            (Signature::Load(mode), [value, rest @ ..]) => Inst::Load {
                op,
                dst: value_reg(op, value)?,
                addr: load_addr(op, mode, rest)?,
            },
            (Signature::Store(mode), [rest @ .., value]) => Inst::Store {
                op,
                src: value_reg(op, value)?,
                addr: store_addr(op, mode, rest)?,
            },
            (Signature::Fpr3, [Arg::Fpr(dst), Arg::Fpr(a), Arg::Fpr(b)]) => Inst::FAlu {
                op,
                dst: *dst,
                a: *a,
                b: *b,
            },
            (Signature::Fpr2, [Arg::Fpr(dst), Arg::Fpr(src)]) => Inst::FUnary {
                op,
                dst: *dst,
                src: *src,
            },
            (Signature::FprImm, [Arg::Fpr(dst), FImm(value)]) => Inst::FLoadImm {
                op,
                dst: *dst,
                bits: if op.is_double() {
                    value.to_bits()
                } else {
                    u64::from((*value as f32).to_bits())
                },
            },
            (Signature::FprGpr, [Arg::Fpr(dst), G(src)]) => Inst::IntToFloat {
                op,
                dst: *dst,
                src: *src,
            },
            (Signature::GprFpr, [G(dst), Arg::Fpr(src)]) => Inst::FloatToInt {
                op,
                dst: *dst,
                src: *src,
            },
            (Signature::BranchR, [G(a), G(b), L(label)]) => Inst::Branch {
                op,
                a: *a,
                b: *b,
                dest: self.dest(*label)?,
            },
            (Signature::BranchI, [G(a), Imm(imm), L(label)]) => Inst::BranchImm {
                op,
                a: *a,
                imm: *imm,
                dest: self.dest(*label)?,
            },
            (Signature::FBranch, [Arg::Fpr(a), Arg::Fpr(b), L(label)]) => Inst::FBranch {
                op,
                a: *a,
                b: *b,
                dest: self.dest(*label)?,
            },
            (Signature::Jump, [L(label)]) => Inst::Jump {
                dest: self.dest(*label)?,
            },
            (Signature::IndirectR, [G(reg)]) => {
                if op == Opcode::Callr {
                    self.check_gpr(*reg)?;
                    return self.call(Callee::Reg(*reg), &[]);
                }
                Inst::Indirect { op, reg: *reg }
            }
            (Signature::IndirectI, [Imm(addr)]) => {
                if op == Opcode::Calli {
                    return self.call(Callee::Abs(*addr as u64), &[]);
                }
                Inst::IndirectAbs {
                    op,
                    addr: *addr as u64,
                }
            }
            (Signature::Ret, []) => return self.ret_inner(),
            (Signature::Internal, _) => {
                return Err(JitError::InvalidOperand(format!(
                    "{op} is emitted by the session, not by callers"
                )));
            }
            (signature, _) => {
                let kinds: Vec<&str> = args.iter().map(Arg::kind).collect();
                return Err(JitError::InvalidOperand(format!(
                    "{op} expects {signature:?} operands, got [{}]",
                    kinds.join(", ")
                )));
            }
        };
        self.check_inst(&inst)?;
        self.push(inst)
    }

    fn check_gpr(&self, reg: Gpr) -> JitResult<()> {
        let conv = self.target.conv();
        let saved = self
            .frame
            .as_ref()
            .is_some_and(|frame| frame.gprs.contains(&reg));
        if conv.caller_saved_gprs.contains(&reg) || saved {
            return Ok(());
        }
        let reason = if conv.is_callee_saved_gpr(reg) {
            "callee-saved register not saved by the current frame"
        } else {
            "register is reserved"
        };
        Err(JitError::InvalidOperand(format!("{reg:?}: {reason}")))
    }

    fn check_fpr(&self, reg: Fpr) -> JitResult<()> {
        let conv = self.target.conv();
        let saved = self
            .frame
            .as_ref()
            .is_some_and(|frame| frame.fprs.contains(&reg));
        if conv.caller_saved_fprs.contains(&reg) || saved {
            return Ok(());
        }
        let reason = if conv.is_callee_saved_fpr(reg) {
            "callee-saved register not saved by the current frame"
        } else {
            "register is reserved"
        };
        Err(JitError::InvalidOperand(format!("{reg:?}: {reason}")))
    }

    fn check_base(&self, reg: Gpr) -> JitResult<()> {
        if reg == self.target.conv().sp {
            return Ok(());
        }
        self.check_gpr(reg)
    }

    fn check_reg(&self, reg: Reg) -> JitResult<()> {
        match reg {
            Reg::Gpr(reg) => self.check_gpr(reg),
            Reg::Fpr(reg) => self.check_fpr(reg),
        }
    }

    fn check_addr(&self, addr: Addr) -> JitResult<()> {
        match addr {
            Addr::Base(base) | Addr::Offset(base, _) => self.check_base(base),
            Addr::Abs(_) => Ok(()),
            Addr::Index(base, index) => {
                self.check_base(base)?;
                self.check_gpr(index)
            }
        }
    }

    fn check_inst(&self, inst: &Inst) -> JitResult<()> {
        match inst {
            Inst::Alu { dst, a, b, .. } => {
                self.check_gpr(*dst)?;
                self.check_gpr(*a)?;
                self.check_gpr(*b)
            }
            Inst::AluImm { dst, a, .. } | Inst::Unary { dst, src: a, .. } => {
                self.check_gpr(*dst)?;
                self.check_gpr(*a)
            }
            Inst::LoadImm { dst, .. } | Inst::MovAddr { dst, .. } => self.check_gpr(*dst),
            Inst::Load { dst, addr, .. } => {
                self.check_reg(*dst)?;
                self.check_addr(*addr)
            }
            Inst::Store { src, addr, .. } => {
                self.check_reg(*src)?;
                self.check_addr(*addr)
            }
            Inst::FAlu { dst, a, b, .. } => {
                self.check_fpr(*dst)?;
                self.check_fpr(*a)?;
                self.check_fpr(*b)
            }
            Inst::FUnary { dst, src, .. } => {
                self.check_fpr(*dst)?;
                self.check_fpr(*src)
            }
            Inst::FLoadImm { dst, .. } => self.check_fpr(*dst),
            Inst::IntToFloat { dst, src, .. } => {
                self.check_fpr(*dst)?;
                self.check_gpr(*src)
            }
            Inst::FloatToInt { dst, src, .. } => {
                self.check_gpr(*dst)?;
                self.check_fpr(*src)
            }
            Inst::Branch { a, b, .. } => {
                self.check_gpr(*a)?;
                self.check_gpr(*b)
            }
            Inst::BranchImm { a, .. } | Inst::Indirect { reg: a, .. } => self.check_gpr(*a),
            Inst::FBranch { a, b, .. } => {
                self.check_fpr(*a)?;
                self.check_fpr(*b)
            }
            Inst::Jump { .. } | Inst::IndirectAbs { .. } | Inst::Ret => Ok(()),
            Inst::Prolog(_) | Inst::Epilog(_) | Inst::AdjustSp(_) => Err(
                JitError::InvalidOperand("frame instructions are internal".to_string()),
            ),
        }
    }

    fn check_operand(&self, operand: &Operand) -> JitResult<()> {
        operand.check_class().map_err(JitError::InvalidOperand)?;
        match operand.loc {
            Location::Gpr(reg) => self.check_gpr(reg),
            Location::Fpr(reg) => self.check_fpr(reg),
            Location::Mem { base, .. } => self.check_base(base),
            Location::Imm(_) | Location::FImm(_) | Location::StackArg(_) => Ok(()),
        }
    }

    /// Validates the destination of the `index`-th incoming argument.
    pub fn describe_argument(
        &mut self,
        index: usize,
        ty: AbiType,
        loc: Location,
    ) -> JitResult<Operand> {
        self.guard(|jit| {
            let limit = jit.target.conv().max_args;
            if index >= limit {
                return Err(JitError::UnknownArgumentSlot { index, limit });
            }
            let operand = Operand { ty, loc };
            if matches!(
                loc,
                Location::Imm(_) | Location::FImm(_) | Location::StackArg(_)
            ) {
                return Err(JitError::InvalidOperand(format!(
                    "argument {index} needs a register or memory destination"
                )));
            }
            jit.check_operand(&operand)?;
            Ok(operand)
        })
    }

    /// Moves the incoming arguments, in order, into `args`' locations.
    pub fn load_args(&mut self, args: &[Operand]) -> JitResult<()> {
        self.guard(|jit| jit.load_args_inner(args))
    }

    fn load_args_inner(&mut self, args: &[Operand]) -> JitResult<()> {
        let conv = self.target.conv().clone();
        let types: Vec<AbiType> = args.iter().map(|arg| arg.ty).collect();
        let layout = conv.assign_args(&types)?;
        let mut pending = Vec::with_capacity(args.len());
        for (arg, loc) in args.iter().zip(layout.locs) {
            self.check_operand(arg)?;
            let dst = match arg.loc {
                Location::Gpr(reg) => MoveDst::Gpr(reg),
                Location::Fpr(reg) => MoveDst::Fpr(reg),
                Location::Mem { base, offset } => MoveDst::Mem { base, offset },
                _ => {
                    return Err(JitError::InvalidOperand(format!(
                        "{:?} cannot receive an argument",
                        arg.loc
                    )));
                }
            };
            let src = match loc {
                ArgLoc::Gpr(reg) => MoveSrc::Gpr(reg),
                ArgLoc::Fpr(reg) => MoveSrc::Fpr(reg),
                ArgLoc::Stack { offset, .. } => MoveSrc::Mem {
                    base: conv.sp,
                    offset: self.incoming_offset(offset)?,
                },
            };
            pending.push(Move {
                ty: arg.ty,
                dst,
                src,
            });
        }
        self.run_moves(&pending)
    }

    /// Stack-pointer-relative offset of an incoming stack argument.
    fn incoming_offset(&self, offset: u32) -> JitResult<i32> {
        let conv = self.target.conv();
        i32::try_from(self.sp_depth + conv.stack_args_offset + offset)
            .map_err(|_| JitError::InvalidOperand("stack argument out of range".to_string()))
    }

    fn run_moves(&mut self, pending: &[Move]) -> JitResult<()> {
        let conv = self.target.conv();
        let ordered = moves::schedule(pending, conv.scratch_gpr, conv.scratch_fpr)?;
        for mv in ordered {
            self.lower_move(mv)?;
        }
        Ok(())
    }

    fn lower_move(&mut self, mv: Move) -> JitResult<()> {
        let conv = self.target.conv();
        let (scratch, scratch_fpr) = (conv.scratch_gpr, conv.scratch_fpr);
        let ty = mv.ty;
        match (mv.dst, mv.src) {
            (MoveDst::Gpr(dst), MoveSrc::Gpr(src)) => {
                if let Some(op) = extension_op(ty) {
                    self.push(Inst::Unary { op, dst, src })
                } else if dst != src {
                    self.push(Inst::Unary {
                        op: Opcode::Movr,
                        dst,
                        src,
                    })
                } else {
                    Ok(())
                }
            }
            (MoveDst::Gpr(dst), MoveSrc::Imm(value)) => self.push(Inst::LoadImm {
                dst,
                imm: ty.normalize(value),
            }),
            (MoveDst::Fpr(dst), MoveSrc::Fpr(src)) => {
                if dst == src {
                    return Ok(());
                }
                let op = if ty == AbiType::Float32 {
                    Opcode::MovrF
                } else {
                    Opcode::MovrD
                };
                self.push(Inst::FUnary { op, dst, src })
            }
            (MoveDst::Fpr(dst), MoveSrc::FImm(value)) => self.push(float_imm(ty, dst, value)),
            (MoveDst::Gpr(dst), MoveSrc::Mem { base, offset }) => self.push(Inst::Load {
                op: load_op(ty),
                dst: Reg::Gpr(dst),
                addr: Addr::Offset(base, i64::from(offset)),
            }),
            (MoveDst::Fpr(dst), MoveSrc::Mem { base, offset }) => self.push(Inst::Load {
                op: load_op(ty),
                dst: Reg::Fpr(dst),
                addr: Addr::Offset(base, i64::from(offset)),
            }),
            (MoveDst::Mem { base, offset }, src) => {
                let value = match src {
                    MoveSrc::Gpr(reg) => Reg::Gpr(reg),
                    MoveSrc::Fpr(reg) => Reg::Fpr(reg),
                    MoveSrc::Imm(value) => {
                        self.push(Inst::LoadImm {
                            dst: scratch,
                            imm: ty.normalize(value),
                        })?;
                        Reg::Gpr(scratch)
                    }
                    MoveSrc::FImm(value) => {
                        self.push(float_imm(ty, scratch_fpr, value))?;
                        Reg::Fpr(scratch_fpr)
                    }
                    MoveSrc::Mem {
                        base: src_base,
                        offset: src_offset,
                    } => {
                        let value = if ty.is_float() {
                            Reg::Fpr(scratch_fpr)
                        } else {
                            Reg::Gpr(scratch)
                        };
                        self.push(Inst::Load {
                            op: load_op(ty),
                            dst: value,
                            addr: Addr::Offset(src_base, i64::from(src_offset)),
                        })?;
                        value
                    }
                };
                self.push(Inst::Store {
                    op: store_op(ty, self.target.conv().word_bytes),
                    src: value,
                    addr: Addr::Offset(base, i64::from(offset)),
                })
            }
            (dst, src) => Err(JitError::InvalidOperand(format!(
                "cannot move a {ty} value from {src:?} to {dst:?}"
            ))),
        }
    }

    /// Emits the prologue: saves the first `v` callee-saved general and `vf`
    /// float registers and reserves `frame_size` bytes of locals at `sp`.
    pub fn enter_jit_abi(&mut self, v: usize, vf: usize, frame_size: u32) -> JitResult<()> {
        self.guard(|jit| {
            let conv = jit.target.conv();
            if jit.frame.is_some() {
                return Err(JitError::InvalidOperand(
                    "enter_jit_abi called twice".to_string(),
                ));
            }
            if v > conv.callee_saved_gprs.len() || vf > conv.callee_saved_fprs.len() {
                return Err(JitError::InvalidOperand(format!(
                    "{} saves at most {} general and {} float registers",
                    conv.name,
                    conv.callee_saved_gprs.len(),
                    conv.callee_saved_fprs.len()
                )));
            }
            if frame_size > MAX_FRAME_BYTES {
                return Err(JitError::InvalidOperand(format!(
                    "frame of {frame_size} bytes exceeds {MAX_FRAME_BYTES}"
                )));
            }
            let frame = Frame {
                gprs: conv.callee_saved_gprs[..v].to_vec(),
                fprs: conv.callee_saved_fprs[..vf].to_vec(),
                locals: align_up(frame_size, 16),
            };
            jit.push(Inst::Prolog(frame.clone()))?;
            jit.sp_depth = jit.target.frame_bytes(&frame);
            debug!(v, vf, locals = frame.locals, depth = jit.sp_depth, "entered jit abi");
            jit.frame = Some(frame);
            Ok(())
        })
    }

    /// Restores the registers saved by `enter_jit_abi` without returning.
    pub fn leave_jit_abi(&mut self) -> JitResult<()> {
        self.guard(|jit| {
            let frame = jit.frame.clone().ok_or_else(|| {
                JitError::InvalidOperand("leave_jit_abi without enter_jit_abi".to_string())
            })?;
            jit.push(Inst::Epilog(frame))
        })
    }

    fn ret_inner(&mut self) -> JitResult<()> {
        if let Some(frame) = self.frame.clone() {
            self.push(Inst::Epilog(frame))?;
        }
        self.push(Inst::Ret)
    }

    pub fn ret(&mut self) -> JitResult<()> {
        self.guard(|jit| jit.ret_inner())
    }

    /// Returns `src` as a value of type `ty`.
    pub fn retr_with(&mut self, ty: AbiType, src: Reg) -> JitResult<()> {
        self.guard(|jit| {
            let source = match src {
                Reg::Gpr(reg) => Operand::gpr(ty, reg),
                Reg::Fpr(reg) => Operand::fpr(ty, reg),
            };
            jit.check_operand(&source)?;
            let dst = match jit.target.conv().return_location(ty)? {
                ReturnLoc::Gpr(reg) => MoveDst::Gpr(reg),
                ReturnLoc::Fpr(reg) => MoveDst::Fpr(reg),
                ReturnLoc::Pair(..) => {
                    return Err(JitError::InvalidOperand(format!(
                        "{ty} returns need retr_pair"
                    )));
                }
            };
            let src = match src {
                Reg::Gpr(reg) => MoveSrc::Gpr(reg),
                Reg::Fpr(reg) => MoveSrc::Fpr(reg),
            };
            jit.lower_move(Move { ty, dst, src })?;
            jit.ret_inner()
        })
    }

    pub fn retr(&mut self, src: Gpr) -> JitResult<()> {
        self.retr_with(AbiType::IntMax, Reg::Gpr(src))
    }

    pub fn retr_f(&mut self, src: Fpr) -> JitResult<()> {
        self.retr_with(AbiType::Float32, Reg::Fpr(src))
    }

    pub fn retr_d(&mut self, src: Fpr) -> JitResult<()> {
        self.retr_with(AbiType::Float64, Reg::Fpr(src))
    }

    pub fn reti(&mut self, value: i64) -> JitResult<()> {
        self.guard(|jit| {
            let conv = jit.target.conv();
            let dst = conv.int_returns.first().copied().ok_or_else(|| {
                JitError::InvalidOperand(format!("{} has no return register", conv.name))
            })?;
            jit.push(Inst::LoadImm { dst, imm: value })?;
            jit.ret_inner()
        })
    }

    /// Returns a two-word value held in `lo` and `hi`.
    pub fn retr_pair(&mut self, lo: Gpr, hi: Gpr) -> JitResult<()> {
        self.guard(|jit| {
            jit.check_gpr(lo)?;
            jit.check_gpr(hi)?;
            let (ret_lo, ret_hi) = jit.target.conv().pair_return()?;
            let pending = [
                Move {
                    ty: AbiType::IntMax,
                    dst: MoveDst::Gpr(ret_lo),
                    src: MoveSrc::Gpr(lo),
                },
                Move {
                    ty: AbiType::IntMax,
                    dst: MoveDst::Gpr(ret_hi),
                    src: MoveSrc::Gpr(hi),
                },
            ];
            jit.run_moves(&pending)?;
            jit.ret_inner()
        })
    }

    /// Calls the function at `addr` with `args` lowered per the convention.
    pub fn calli(&mut self, addr: u64, args: &[Operand]) -> JitResult<()> {
        self.guard(|jit| jit.call(Callee::Abs(addr), args))
    }

    pub fn callr(&mut self, reg: Gpr, args: &[Operand]) -> JitResult<()> {
        self.guard(|jit| {
            jit.check_gpr(reg)?;
            jit.call(Callee::Reg(reg), args)
        })
    }

    fn call(&mut self, callee: Callee, args: &[Operand]) -> JitResult<()> {
        for arg in args {
            self.check_operand(arg)?;
        }
        let conv = self.target.conv().clone();
        let types: Vec<AbiType> = args.iter().map(|arg| arg.ty).collect();
        let layout = conv.assign_args(&types)?;
        let out = conv.call_area(self.sp_depth, layout.stack_bytes);
        let delta = i32::try_from(out)
            .map_err(|_| JitError::InvalidOperand("call area too large".to_string()))?;
        if out > 0 {
            self.push(Inst::AdjustSp(-delta))?;
        }
        let depth_before = self.sp_depth;
        self.sp_depth += out;

        let mut pending = Vec::with_capacity(args.len() + 1);
        for (arg, loc) in args.iter().zip(layout.locs) {
            let dst = match loc {
                ArgLoc::Gpr(reg) => MoveDst::Gpr(reg),
                ArgLoc::Fpr(reg) => MoveDst::Fpr(reg),
                ArgLoc::Stack { offset, .. } => MoveDst::Mem {
                    base: conv.sp,
                    offset: offset as i32,
                },
            };
            let src = match arg.loc {
                Location::Gpr(reg) => MoveSrc::Gpr(reg),
                Location::Fpr(reg) => MoveSrc::Fpr(reg),
                Location::Imm(value) => MoveSrc::Imm(value),
                Location::FImm(value) => MoveSrc::FImm(value),
                Location::Mem { base, offset } if base == conv.sp => MoveSrc::Mem {
                    base,
                    offset: offset + delta,
                },
                Location::Mem { base, offset } => MoveSrc::Mem { base, offset },
                Location::StackArg(offset) => MoveSrc::Mem {
                    base: conv.sp,
                    offset: self.incoming_offset(offset as u32)?,
                },
            };
            pending.push(Move {
                ty: arg.ty,
                dst,
                src,
            });
        }
        if let Callee::Reg(reg) = callee {
            pending.push(Move {
                ty: AbiType::Pointer,
                dst: MoveDst::Gpr(conv.call_target),
                src: MoveSrc::Gpr(reg),
            });
        }
        self.run_moves(&pending)?;
        match callee {
            Callee::Reg(_) => self.push(Inst::Indirect {
                op: Opcode::Callr,
                reg: conv.call_target,
            })?,
            Callee::Abs(addr) => self.push(Inst::IndirectAbs {
                op: Opcode::Calli,
                addr,
            })?,
        }
        if out > 0 {
            self.push(Inst::AdjustSp(delta))?;
        }
        self.sp_depth = depth_before;
        trace!(args = args.len(), stack = layout.stack_bytes, area = out, "lowered call");
        Ok(())
    }

    /// Fetches the integer result of the preceding call, extended per `ty`.
    pub fn retval_with(&mut self, ty: AbiType, dst: Reg) -> JitResult<()> {
        self.guard(|jit| {
            let target = match dst {
                Reg::Gpr(reg) => Operand::gpr(ty, reg),
                Reg::Fpr(reg) => Operand::fpr(ty, reg),
            };
            jit.check_operand(&target)?;
            let src = match jit.target.conv().return_location(ty)? {
                ReturnLoc::Gpr(reg) => MoveSrc::Gpr(reg),
                ReturnLoc::Fpr(reg) => MoveSrc::Fpr(reg),
                ReturnLoc::Pair(..) => {
                    return Err(JitError::InvalidOperand(format!(
                        "{ty} results occupy a register pair"
                    )));
                }
            };
            let dst = match dst {
                Reg::Gpr(reg) => MoveDst::Gpr(reg),
                Reg::Fpr(reg) => MoveDst::Fpr(reg),
            };
            jit.lower_move(Move { ty, dst, src })
        })
    }

    pub fn retval(&mut self, dst: Gpr) -> JitResult<()> {
        self.retval_with(AbiType::IntMax, Reg::Gpr(dst))
    }

    pub fn retval_f(&mut self, dst: Fpr) -> JitResult<()> {
        self.retval_with(AbiType::Float32, Reg::Fpr(dst))
    }

    pub fn retval_d(&mut self, dst: Fpr) -> JitResult<()> {
        self.retval_with(AbiType::Float64, Reg::Fpr(dst))
    }

    /// Checks that every label is bound, applies absolute fixups and makes
    /// the code executable.
    pub fn end(mut self) -> JitResult<CompiledCode> {
        if let Some(err) = self.poisoned.take() {
            warn!(error = %err, "ending abandoned jit session");
            return Err(err);
        }
        if let Some(label) = self.labels.first_unbound() {
            return Err(JitError::UnboundLabelAtFinalize(label));
        }
        let base = self.arena.base_address() as u64;
        for reloc in self.labels.take_absolute() {
            let offset = self
                .labels
                .offset(reloc.label)?
                .ok_or(JitError::UnboundLabelAtFinalize(reloc.label))?;
            self.apply(reloc, base + offset as u64)?;
        }
        let labels = self.labels.bound_offsets();
        let target = self.target.name();
        let code = self.arena.finalize()?;
        debug!(target, len = code.len(), labels = labels.len(), "jit session closed");
        Ok(CompiledCode {
            code,
            labels,
            target,
        })
    }
}

fn value_reg(op: Opcode, arg: &Arg) -> JitResult<Reg> {
    let float = op.mem_access().is_some_and(|access| access.float);
    match (arg, float) {
        (Arg::Gpr(reg), false) => Ok(Reg::Gpr(*reg)),
        (Arg::Fpr(reg), true) => Ok(Reg::Fpr(*reg)),
        _ => Err(JitError::InvalidOperand(format!(
            "{op} cannot transfer a {}",
            arg.kind()
        ))),
    }
}

fn addr_mismatch(op: Opcode, args: &[Arg]) -> JitError {
    let kinds: Vec<&str> = args.iter().map(Arg::kind).collect();
    JitError::InvalidOperand(format!("{op} got address operands [{}]", kinds.join(", ")))
}

/// `ldr (base)`, `ldi (imm)`, `ldxr (base, index)`, `ldxi (base, imm)`.
fn load_addr(op: Opcode, mode: AddrMode, args: &[Arg]) -> JitResult<Addr> {
    match (mode, args) {
        (AddrMode::Base, [Arg::Gpr(base)]) => Ok(Addr::Base(*base)),
        (AddrMode::Abs, [Arg::Imm(addr)]) => Ok(Addr::Abs(*addr as u64)),
        (AddrMode::Indexed, [Arg::Gpr(base), Arg::Gpr(index)]) => Ok(Addr::Index(*base, *index)),
        (AddrMode::Offset, [Arg::Gpr(base), Arg::Imm(offset)]) => {
            Ok(Addr::Offset(*base, *offset))
        }
        _ => Err(addr_mismatch(op, args)),
    }
}

/// `str (base)`, `sti (imm)`, `stxr (base, index)`, `stxi (imm, base)`.
fn store_addr(op: Opcode, mode: AddrMode, args: &[Arg]) -> JitResult<Addr> {
    match (mode, args) {
        (AddrMode::Base, [Arg::Gpr(base)]) => Ok(Addr::Base(*base)),
        (AddrMode::Abs, [Arg::Imm(addr)]) => Ok(Addr::Abs(*addr as u64)),
        (AddrMode::Indexed, [Arg::Gpr(base), Arg::Gpr(index)]) => Ok(Addr::Index(*base, *index)),
        (AddrMode::Offset, [Arg::Imm(offset), Arg::Gpr(base)]) => {
            Ok(Addr::Offset(*base, *offset))
        }
        _ => Err(addr_mismatch(op, args)),
    }
}

fn extension_op(ty: AbiType) -> Option<Opcode> {
    Some(match ty {
        AbiType::Int8 => Opcode::ExtrC,
        AbiType::Uint8 => Opcode::ExtrUc,
        AbiType::Int16 => Opcode::ExtrS,
        AbiType::Uint16 => Opcode::ExtrUs,
        AbiType::Int32 => Opcode::ExtrI,
        AbiType::Uint32 => Opcode::ExtrUi,
        _ => return None,
    })
}

fn load_op(ty: AbiType) -> Opcode {
    match ty {
        AbiType::Int8 => Opcode::LdxiC,
        AbiType::Uint8 => Opcode::LdxiUc,
        AbiType::Int16 => Opcode::LdxiS,
        AbiType::Uint16 => Opcode::LdxiUs,
        AbiType::Int32 => Opcode::LdxiI,
        AbiType::Uint32 => Opcode::LdxiUi,
        AbiType::Float32 => Opcode::LdxiF,
        AbiType::Float64 => Opcode::LdxiD,
        AbiType::Int64 | AbiType::Uint64 | AbiType::IntMax | AbiType::Pointer => Opcode::LdxiL,
    }
}

fn store_op(ty: AbiType, word_bytes: u8) -> Opcode {
    match (ty, ty.size(word_bytes)) {
        (AbiType::Float32, _) => Opcode::StxiF,
        (AbiType::Float64, _) => Opcode::StxiD,
        (_, 1) => Opcode::StxiC,
        (_, 2) => Opcode::StxiS,
        (_, 4) => Opcode::StxiI,
        _ => Opcode::StxiL,
    }
}

fn float_imm(ty: AbiType, dst: Fpr, value: f64) -> Inst {
    if ty == AbiType::Float32 {
        Inst::FLoadImm {
            op: Opcode::MoviF,
            dst,
            bits: u64::from((value as f32).to_bits()),
        }
    } else {
        Inst::FLoadImm {
            op: Opcode::MoviD,
            dst,
            bits: value.to_bits(),
        }
    }
}

macro_rules! typed_ops {
    (gpr3: $($g3:ident => $g3op:ident),* ;
     gpr2imm: $($gi:ident => $giop:ident),* ;
     gpr2: $($g2:ident => $g2op:ident),* ;
     fpr3: $($f3:ident => $f3op:ident),* ;
     fpr2: $($f2:ident => $f2op:ident),* ;
     branch_r: $($br:ident => $brop:ident),* ;
     branch_i: $($bi:ident => $biop:ident),* ;
     fbranch: $($fb:ident => $fbop:ident),* ;
     load: $($ld:ident => $ldop:ident),* ;
     store: $($st:ident => $stop:ident),* ;) => {
        impl<T: Target> JitState<T> {
            $(pub fn $g3(&mut self, dst: Gpr, a: Gpr, b: Gpr) -> JitResult<()> {
                self.emit(Opcode::$g3op, &[Arg::Gpr(dst), Arg::Gpr(a), Arg::Gpr(b)])
            })*
            $(pub fn $gi(&mut self, dst: Gpr, a: Gpr, imm: i64) -> JitResult<()> {
                self.emit(Opcode::$giop, &[Arg::Gpr(dst), Arg::Gpr(a), Arg::Imm(imm)])
            })*
            $(pub fn $g2(&mut self, dst: Gpr, src: Gpr) -> JitResult<()> {
                self.emit(Opcode::$g2op, &[Arg::Gpr(dst), Arg::Gpr(src)])
            })*
            $(pub fn $f3(&mut self, dst: Fpr, a: Fpr, b: Fpr) -> JitResult<()> {
                self.emit(Opcode::$f3op, &[Arg::Fpr(dst), Arg::Fpr(a), Arg::Fpr(b)])
            })*
            $(pub fn $f2(&mut self, dst: Fpr, src: Fpr) -> JitResult<()> {
                self.emit(Opcode::$f2op, &[Arg::Fpr(dst), Arg::Fpr(src)])
            })*
            $(pub fn $br(&mut self, a: Gpr, b: Gpr, label: Label) -> JitResult<()> {
                self.emit(Opcode::$brop, &[Arg::Gpr(a), Arg::Gpr(b), Arg::Label(label)])
            })*
            $(pub fn $bi(&mut self, a: Gpr, imm: i64, label: Label) -> JitResult<()> {
                self.emit(Opcode::$biop, &[Arg::Gpr(a), Arg::Imm(imm), Arg::Label(label)])
            })*
            $(pub fn $fb(&mut self, a: Fpr, b: Fpr, label: Label) -> JitResult<()> {
                self.emit(Opcode::$fbop, &[Arg::Fpr(a), Arg::Fpr(b), Arg::Label(label)])
            })*
            $(pub fn $ld(&mut self, dst: impl Into<Reg>, addr: Addr) -> JitResult<()> {
                self.emit_mem(Opcode::$ldop, dst.into(), addr)
            })*
            $(pub fn $st(&mut self, addr: Addr, src: impl Into<Reg>) -> JitResult<()> {
                self.emit_mem(Opcode::$stop, src.into(), addr)
            })*
        }
    };
}

typed_ops! {
    gpr3: addr => Addr, addcr => Addcr, addxr => Addxr, subr => Subr, subcr => Subcr,
        subxr => Subxr, mulr => Mulr, divr => Divr, divr_u => DivrU, remr => Remr,
        remr_u => RemrU, andr => Andr, orr => Orr, xorr => Xorr, lshr => Lshr, rshr => Rshr,
        rshr_u => RshrU, ltr => Ltr, ltr_u => LtrU, ler => Ler, ler_u => LerU, eqr => Eqr,
        ger => Ger, ger_u => GerU, gtr => Gtr, gtr_u => GtrU, ner => Ner;
    gpr2imm: addi => Addi, addci => Addci, addxi => Addxi, subi => Subi, subci => Subci,
        subxi => Subxi, rsbi => Rsbi, muli => Muli, divi => Divi, divi_u => DiviU,
        remi => Remi, remi_u => RemiU, andi => Andi, ori => Ori, xori => Xori, lshi => Lshi,
        rshi => Rshi, rshi_u => RshiU, lti => Lti, lti_u => LtiU, lei => Lei, lei_u => LeiU,
        eqi => Eqi, gei => Gei, gei_u => GeiU, gti => Gti, gti_u => GtiU, nei => Nei;
    gpr2: negr => Negr, comr => Comr, popcntr => Popcntr, movr => Movr, extr_c => ExtrC,
        extr_uc => ExtrUc, extr_s => ExtrS, extr_us => ExtrUs, extr_i => ExtrI,
        extr_ui => ExtrUi, bswapr_us => BswaprUs, bswapr_ui => BswaprUi,
        bswapr_ul => BswaprUl;
    fpr3: addr_f => AddrF, addr_d => AddrD, subr_f => SubrF, subr_d => SubrD,
        mulr_f => MulrF, mulr_d => MulrD, divr_f => DivrF, divr_d => DivrD;
    fpr2: negr_f => NegrF, negr_d => NegrD, absr_f => AbsrF, absr_d => AbsrD,
        sqrtr_f => SqrtrF, sqrtr_d => SqrtrD, movr_f => MovrF, movr_d => MovrD,
        extr_f_d => ExtrFD, extr_d_f => ExtrDF;
    branch_r: bltr => Bltr, bltr_u => BltrU, bler => Bler, bler_u => BlerU, beqr => Beqr,
        bger => Bger, bger_u => BgerU, bgtr => Bgtr, bgtr_u => BgtrU, bner => Bner,
        bmsr => Bmsr, bmcr => Bmcr, boaddr => Boaddr, boaddr_u => BoaddrU, bxaddr => Bxaddr,
        bxaddr_u => BxaddrU, bosubr => Bosubr, bosubr_u => BosubrU, bxsubr => Bxsubr,
        bxsubr_u => BxsubrU;
    branch_i: blti => Blti, blti_u => BltiU, blei => Blei, blei_u => BleiU, beqi => Beqi,
        bgei => Bgei, bgei_u => BgeiU, bgti => Bgti, bgti_u => BgtiU, bnei => Bnei,
        bmsi => Bmsi, bmci => Bmci, boaddi => Boaddi, boaddi_u => BoaddiU, bxaddi => Bxaddi,
        bxaddi_u => BxaddiU, bosubi => Bosubi, bosubi_u => BosubiU, bxsubi => Bxsubi,
        bxsubi_u => BxsubiU;
    fbranch: bltr_f => BltrF, bltr_d => BltrD, bler_f => BlerF, bler_d => BlerD,
        beqr_f => BeqrF, beqr_d => BeqrD, bger_f => BgerF, bger_d => BgerD, bgtr_f => BgtrF,
        bgtr_d => BgtrD, bner_f => BnerF, bner_d => BnerD, bunordr_f => BunordrF,
        bunordr_d => BunordrD, bordr_f => BordrF, bordr_d => BordrD;
    load: ld_c => LdrC, ld_uc => LdrUc, ld_s => LdrS, ld_us => LdrUs, ld_i => LdrI,
        ld_ui => LdrUi, ld_l => LdrL, ld_f => LdrF, ld_d => LdrD;
    store: st_c => StrC, st_s => StrS, st_i => StrI, st_l => StrL, st_f => StrF,
        st_d => StrD;
}

impl<T: Target> JitState<T> {
    /// Emits a load or store, choosing the `r`/`i`/`xr`/`xi` form of
    /// `base_op`'s family from the shape of `addr`.
    fn emit_mem(&mut self, base_op: Opcode, value: Reg, addr: Addr) -> JitResult<()> {
        self.guard(|jit| {
            let op = mem_variant(base_op, addr)?;
            let inst = if matches!(op.signature(), Signature::Load(_)) {
                Inst::Load {
                    op,
                    dst: value,
                    addr,
                }
            } else {
                Inst::Store {
                    op,
                    src: value,
                    addr,
                }
            };
            let float = op.mem_access().is_some_and(|access| access.float);
            if float != matches!(value, Reg::Fpr(_)) {
                return Err(JitError::InvalidOperand(format!(
                    "{op} cannot transfer {value:?}"
                )));
            }
            jit.check_inst(&inst)?;
            jit.push(inst)
        })
    }

    pub fn ldr_l(&mut self, dst: Gpr, base: Gpr) -> JitResult<()> {
        self.emit(Opcode::LdrL, &[Arg::Gpr(dst), Arg::Gpr(base)])
    }

    pub fn ldxr_l(&mut self, dst: Gpr, base: Gpr, index: Gpr) -> JitResult<()> {
        self.emit(Opcode::LdxrL, &[Arg::Gpr(dst), Arg::Gpr(base), Arg::Gpr(index)])
    }

    pub fn ldxr_us(&mut self, dst: Gpr, base: Gpr, index: Gpr) -> JitResult<()> {
        self.emit(Opcode::LdxrUs, &[Arg::Gpr(dst), Arg::Gpr(base), Arg::Gpr(index)])
    }

    pub fn ldxi_l(&mut self, dst: Gpr, base: Gpr, offset: i64) -> JitResult<()> {
        self.emit(Opcode::LdxiL, &[Arg::Gpr(dst), Arg::Gpr(base), Arg::Imm(offset)])
    }

    pub fn ldxi_d(&mut self, dst: Fpr, base: Gpr, offset: i64) -> JitResult<()> {
        self.emit(Opcode::LdxiD, &[Arg::Fpr(dst), Arg::Gpr(base), Arg::Imm(offset)])
    }

    pub fn str_l(&mut self, base: Gpr, src: Gpr) -> JitResult<()> {
        self.emit(Opcode::StrL, &[Arg::Gpr(base), Arg::Gpr(src)])
    }

    pub fn stxi_c(&mut self, offset: i64, base: Gpr, src: Gpr) -> JitResult<()> {
        self.emit(Opcode::StxiC, &[Arg::Imm(offset), Arg::Gpr(base), Arg::Gpr(src)])
    }

    pub fn stxi_l(&mut self, offset: i64, base: Gpr, src: Gpr) -> JitResult<()> {
        self.emit(Opcode::StxiL, &[Arg::Imm(offset), Arg::Gpr(base), Arg::Gpr(src)])
    }

    pub fn stxi_d(&mut self, offset: i64, base: Gpr, src: Fpr) -> JitResult<()> {
        self.emit(Opcode::StxiD, &[Arg::Imm(offset), Arg::Gpr(base), Arg::Fpr(src)])
    }

    pub fn movi(&mut self, dst: Gpr, imm: i64) -> JitResult<()> {
        self.emit(Opcode::Movi, &[Arg::Gpr(dst), Arg::Imm(imm)])
    }

    pub fn movi_f(&mut self, dst: Fpr, value: f32) -> JitResult<()> {
        self.emit(Opcode::MoviF, &[Arg::Fpr(dst), Arg::FImm(f64::from(value))])
    }

    pub fn movi_d(&mut self, dst: Fpr, value: f64) -> JitResult<()> {
        self.emit(Opcode::MoviD, &[Arg::Fpr(dst), Arg::FImm(value)])
    }

    pub fn mov_addr(&mut self, dst: Gpr, label: Label) -> JitResult<()> {
        self.emit(Opcode::MovAddr, &[Arg::Gpr(dst), Arg::Label(label)])
    }

    pub fn extr_f(&mut self, dst: Fpr, src: Gpr) -> JitResult<()> {
        self.emit(Opcode::ExtrF, &[Arg::Fpr(dst), Arg::Gpr(src)])
    }

    pub fn extr_d(&mut self, dst: Fpr, src: Gpr) -> JitResult<()> {
        self.emit(Opcode::ExtrD, &[Arg::Fpr(dst), Arg::Gpr(src)])
    }

    pub fn truncr_f_l(&mut self, dst: Gpr, src: Fpr) -> JitResult<()> {
        self.emit(Opcode::TruncrFL, &[Arg::Gpr(dst), Arg::Fpr(src)])
    }

    pub fn truncr_d_l(&mut self, dst: Gpr, src: Fpr) -> JitResult<()> {
        self.emit(Opcode::TruncrDL, &[Arg::Gpr(dst), Arg::Fpr(src)])
    }

    pub fn jmp(&mut self, label: Label) -> JitResult<()> {
        self.emit(Opcode::Jmp, &[Arg::Label(label)])
    }

    pub fn jmpr(&mut self, reg: Gpr) -> JitResult<()> {
        self.emit(Opcode::Jmpr, &[Arg::Gpr(reg)])
    }

    pub fn jmpi(&mut self, addr: u64) -> JitResult<()> {
        self.emit(Opcode::Jmpi, &[Arg::Imm(addr as i64)])
    }
}

/// Picks the member of a load/store family matching the address shape.
fn mem_variant(base_op: Opcode, addr: Addr) -> JitResult<Opcode> {
    let (load, access) = match base_op.signature() {
        Signature::Load(_) => (true, base_op.mem_access()),
        Signature::Store(_) => (false, base_op.mem_access()),
        _ => (false, None),
    };
    let access = access.ok_or_else(|| {
        JitError::InvalidOperand(format!("{base_op} is not a memory operation"))
    })?;
    let mode = match addr {
        Addr::Base(_) => AddrMode::Base,
        Addr::Abs(_) => AddrMode::Abs,
        Addr::Index(..) => AddrMode::Indexed,
        Addr::Offset(..) => AddrMode::Offset,
    };
    Opcode::ALL
        .iter()
        .copied()
        .find(|op| {
            let same_dir = matches!(
                (op.signature(), load),
                (Signature::Load(m), true) | (Signature::Store(m), false) if m == mode
            );
            same_dir && op.mem_access() == Some(access)
        })
        .ok_or_else(|| JitError::InvalidOperand(format!("no {mode:?} form of {base_op}")))
}

/// Finalized code plus the offsets of its labels.
pub struct CompiledCode {
    code: ExecutableCode,
    labels: Vec<(Label, usize)>,
    target: &'static str,
}

impl std::fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCode")
            .field("target", &self.target)
            .field("entry", &self.entry())
            .field("len", &self.len())
            .finish()
    }
}

impl CompiledCode {
    pub fn entry(&self) -> *const u8 {
        self.code.as_ptr()
    }

    /// Reinterprets the entry point as a function pointer.
    ///
    /// # Safety
    /// `F` must be an `extern "C"` function pointer type matching the
    /// signature the code was compiled for, and the code must have been
    /// compiled for the host target.
    pub unsafe fn entry_as<F: Copy>(&self) -> F {
        assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const u8>(),
            "entry_as needs a function pointer type"
        );
        let entry = self.entry();
        unsafe { std::mem::transmute_copy::<*const u8, F>(&entry) }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        self.code.bytes()
    }

    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels
            .iter()
            .find(|(bound, _)| *bound == label)
            .map(|(_, offset)| *offset)
    }

    pub fn labels(&self) -> &[(Label, usize)] {
        &self.labels
    }

    /// Address of `label` inside the executable region.
    pub fn label_address(&self, label: Label) -> Option<*const u8> {
        self.label_offset(label)
            .map(|offset| self.entry().wrapping_add(offset))
    }

    /// Gives up ownership of the region; the caller unmaps it through
    /// [`ExecutableCode::from_raw`].
    pub fn leak(self) -> RawCode {
        self.code.into_raw()
    }

    pub fn report(&self) -> CodeReport {
        CodeReport {
            target: self.target.to_string(),
            code_len: self.len(),
            labels: self
                .labels
                .iter()
                .map(|(label, offset)| LabelReport {
                    label: label.to_string(),
                    offset: *offset,
                })
                .collect(),
            bytes: hex(self.bytes()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelReport {
    pub label: String,
    pub offset: usize,
}

/// Serializable summary of a compiled function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeReport {
    pub target: String,
    pub code_len: usize,
    pub labels: Vec<LabelReport>,
    pub bytes: String,
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 3);
    for (index, byte) in bytes.iter().enumerate() {
        if index > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::aarch64::{self, Aarch64};
    use crate::target::x86_64::{self, X86_64};

    fn session<T: Target>(target: T) -> JitState<T> {
        JitState::begin(target, Arena::new(256).expect("arena")).expect("begin")
    }

    #[test]
    fn used_arena_is_rejected() {
        let mut arena = Arena::new(64).expect("arena");
        arena.reserve(1).expect("reserve");
        arena.write(&[0x90]).expect("write");
        assert!(matches!(
            JitState::begin(X86_64::sysv(), arena),
            Err(JitError::InvalidArena(_))
        ));
    }

    #[test]
    fn errors_poison_the_session() {
        let mut jit = session(X86_64::sysv());
        let err = jit
            .emit(Opcode::Addr, &[Arg::Gpr(x86_64::R0)])
            .expect_err("wrong arity");
        assert!(matches!(err, JitError::InvalidOperand(_)));
        assert_eq!(jit.movi(x86_64::R0, 1), Err(JitError::Abandoned));
        assert_eq!(jit.end().expect_err("poisoned"), err);
    }

    #[test]
    fn unsaved_callee_saved_registers_are_rejected() {
        let mut jit = session(X86_64::sysv());
        assert!(matches!(
            jit.movi(x86_64::V0, 1),
            Err(JitError::InvalidOperand(_))
        ));

        let mut jit = session(X86_64::sysv());
        jit.enter_jit_abi(1, 0, 0).expect("prolog");
        jit.movi(x86_64::V0, 1).expect("saved register");
        assert!(jit.movi(x86_64::V1, 1).is_err());
    }

    #[test]
    fn scratch_registers_are_reserved() {
        let mut jit = session(Aarch64::aapcs64());
        assert!(jit.movi(Gpr(16), 0).is_err());
        let mut jit = session(X86_64::sysv());
        assert!(jit.movi(x86_64::R11, 0).is_err());
    }

    #[test]
    fn stack_pointer_is_only_a_base() {
        let mut jit = session(X86_64::sysv());
        jit.ldxi_l(x86_64::R0, x86_64::RSP, 8).expect("sp base");
        let mut jit = session(X86_64::sysv());
        assert!(jit.addr(x86_64::RSP, x86_64::R0, x86_64::R1).is_err());
    }

    #[test]
    fn popcnt_without_extension_is_unsupported() {
        let mut jit = session(X86_64::sysv());
        assert!(matches!(
            jit.popcntr(x86_64::R0, x86_64::R1),
            Err(JitError::UnsupportedOnTarget { .. })
        ));
        let mut jit = session(X86_64::sysv().with_popcnt(true));
        jit.popcntr(x86_64::R0, x86_64::R1).expect("popcnt");
    }

    #[test]
    fn forward_branch_is_patched_on_bind() {
        let mut jit = session(X86_64::sysv());
        let out = jit.new_label();
        jit.jmp(out).expect("jmp");
        jit.movi(x86_64::R0, 7).expect("movi");
        jit.bind(out).expect("bind");
        jit.ret().expect("ret");
        let code = jit.end().expect("end");
        // jmp rel32 over the 5-byte mov
        assert_eq!(&code.bytes()[..5], &[0xE9, 5, 0, 0, 0]);
        assert_eq!(code.label_offset(out), Some(10));
    }

    #[test]
    fn unbound_labels_fail_end() {
        let mut jit = session(Aarch64::aapcs64());
        let label = jit.new_label();
        jit.jmp(label).expect("jmp");
        assert_eq!(
            jit.end().expect_err("unbound"),
            JitError::UnboundLabelAtFinalize(label)
        );
    }

    #[test]
    fn double_enter_is_rejected() {
        let mut jit = session(Aarch64::aapcs64());
        jit.enter_jit_abi(0, 0, 0).expect("prolog");
        assert!(jit.enter_jit_abi(0, 0, 0).is_err());
    }

    #[test]
    fn argument_slots_are_bounded() {
        let mut jit = session(X86_64::sysv());
        let limit = X86_64::sysv().conv().max_args;
        assert_eq!(
            jit.describe_argument(limit, AbiType::IntMax, Location::Gpr(x86_64::R0)),
            Err(JitError::UnknownArgumentSlot { index: limit, limit })
        );
    }

    #[test]
    fn duplicate_argument_registers_are_rejected() {
        let mut jit = session(Aarch64::aapcs64());
        let args = [
            Operand::gpr(AbiType::IntMax, aarch64::R0),
            Operand::gpr(AbiType::IntMax, aarch64::R0),
        ];
        assert!(matches!(
            jit.load_args(&args),
            Err(JitError::InvalidOperandAssignment(_))
        ));
    }

    #[test]
    fn memory_helpers_pick_the_addressing_form() {
        assert_eq!(
            mem_variant(Opcode::LdrUs, Addr::Index(Gpr(0), Gpr(1))),
            Ok(Opcode::LdxrUs)
        );
        assert_eq!(
            mem_variant(Opcode::StrC, Addr::Offset(Gpr(0), 4)),
            Ok(Opcode::StxiC)
        );
        assert_eq!(mem_variant(Opcode::LdrD, Addr::Abs(64)), Ok(Opcode::LdiD));
    }

    #[test]
    fn report_lists_labels_and_hex() {
        let mut jit = session(X86_64::sysv());
        let entry = jit.here().expect("label");
        jit.ret().expect("ret");
        let report = jit.end().expect("end").report();
        assert_eq!(report.code_len, 1);
        assert_eq!(report.bytes, "c3");
        assert_eq!(report.labels[0].label, entry.to_string());
        assert_eq!(report.target, "x86_64-sysv");
    }
}
