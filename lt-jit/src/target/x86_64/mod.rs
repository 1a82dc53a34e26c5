//! x86-64 backend for the System V and Microsoft x64 conventions.

mod emit;
mod sizes;

use crate::abi::CallConv;
use crate::error::{JitError, JitResult};
use crate::label::RelocKind;
use crate::opcode::Opcode;
use crate::operand::{Fpr, Gpr};
use crate::target::{Frame, Inst, Sink, Target};

pub const RAX: Gpr = Gpr(0);
pub const RCX: Gpr = Gpr(1);
pub const RDX: Gpr = Gpr(2);
pub const RBX: Gpr = Gpr(3);
pub const RSP: Gpr = Gpr(4);
pub const RBP: Gpr = Gpr(5);
pub const RSI: Gpr = Gpr(6);
pub const RDI: Gpr = Gpr(7);
pub const R8: Gpr = Gpr(8);
pub const R9: Gpr = Gpr(9);
pub const R10: Gpr = Gpr(10);
pub const R11: Gpr = Gpr(11);
pub const R12: Gpr = Gpr(12);
pub const R13: Gpr = Gpr(13);
pub const R14: Gpr = Gpr(14);
pub const R15: Gpr = Gpr(15);

pub const fn xmm(n: u8) -> Fpr {
    Fpr(n)
}

/// Caller-saved registers available under both conventions.
pub const R0: Gpr = RAX;
pub const R1: Gpr = RCX;
pub const R2: Gpr = RDX;
pub const R3: Gpr = R8;
/// Callee-saved registers, in the order `enter_jit_abi` saves them.
pub const V0: Gpr = RBX;
pub const V1: Gpr = R12;
pub const V2: Gpr = R13;
pub const V3: Gpr = R14;
pub const F0: Fpr = xmm(0);
pub const F1: Fpr = xmm(1);
pub const F2: Fpr = xmm(2);
pub const F3: Fpr = xmm(3);
pub const F4: Fpr = xmm(4);

static INT_RETURNS: [Gpr; 2] = [RAX, RDX];

static SYSV_INT_ARGS: [Gpr; 6] = [RDI, RSI, RDX, RCX, R8, R9];
static SYSV_FLOAT_ARGS: [Fpr; 8] = [
    xmm(0),
    xmm(1),
    xmm(2),
    xmm(3),
    xmm(4),
    xmm(5),
    xmm(6),
    xmm(7),
];
static SYSV_CALLER_SAVED: [Gpr; 8] = [RAX, RCX, RDX, RSI, RDI, R8, R9, R10];
static SYSV_CALLEE_SAVED: [Gpr; 5] = [RBX, R12, R13, R14, R15];
static SYSV_CALLER_SAVED_FPRS: [Fpr; 15] = [
    xmm(0),
    xmm(1),
    xmm(2),
    xmm(3),
    xmm(4),
    xmm(5),
    xmm(6),
    xmm(7),
    xmm(8),
    xmm(9),
    xmm(10),
    xmm(11),
    xmm(12),
    xmm(13),
    xmm(14),
];

static WIN64_INT_ARGS: [Gpr; 4] = [RCX, RDX, R8, R9];
static WIN64_FLOAT_ARGS: [Fpr; 4] = [xmm(0), xmm(1), xmm(2), xmm(3)];
static WIN64_CALLER_SAVED: [Gpr; 6] = [RAX, RCX, RDX, R8, R9, R10];
static WIN64_CALLEE_SAVED: [Gpr; 7] = [RBX, R12, R13, R14, R15, RSI, RDI];
static WIN64_CALLER_SAVED_FPRS: [Fpr; 5] = [xmm(0), xmm(1), xmm(2), xmm(3), xmm(4)];
static WIN64_CALLEE_SAVED_FPRS: [Fpr; 10] = [
    xmm(6),
    xmm(7),
    xmm(8),
    xmm(9),
    xmm(10),
    xmm(11),
    xmm(12),
    xmm(13),
    xmm(14),
    xmm(15),
];

static SYSV: CallConv = CallConv {
    name: "x86_64-sysv",
    word_bytes: 8,
    int_args: &SYSV_INT_ARGS,
    float_args: &SYSV_FLOAT_ARGS,
    shared_arg_positions: false,
    int_returns: &INT_RETURNS,
    float_return: xmm(0),
    caller_saved_gprs: &SYSV_CALLER_SAVED,
    callee_saved_gprs: &SYSV_CALLEE_SAVED,
    caller_saved_fprs: &SYSV_CALLER_SAVED_FPRS,
    callee_saved_fprs: &[],
    scratch_gpr: R11,
    scratch_fpr: xmm(15),
    call_target: RAX,
    sp: RSP,
    stack_align: 16,
    stack_args_offset: 8,
    shadow_space: 0,
    entry_misalignment: 8,
    packed_stack_args: false,
    max_args: 16,
};

static WIN64: CallConv = CallConv {
    name: "x86_64-win64",
    word_bytes: 8,
    int_args: &WIN64_INT_ARGS,
    float_args: &WIN64_FLOAT_ARGS,
    shared_arg_positions: true,
    int_returns: &INT_RETURNS,
    float_return: xmm(0),
    caller_saved_gprs: &WIN64_CALLER_SAVED,
    callee_saved_gprs: &WIN64_CALLEE_SAVED,
    caller_saved_fprs: &WIN64_CALLER_SAVED_FPRS,
    callee_saved_fprs: &WIN64_CALLEE_SAVED_FPRS,
    scratch_gpr: R11,
    scratch_fpr: xmm(5),
    call_target: RAX,
    sp: RSP,
    stack_align: 16,
    stack_args_offset: 8,
    shadow_space: 32,
    entry_misalignment: 8,
    packed_stack_args: false,
    max_args: 16,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86_64 {
    conv: &'static CallConv,
    popcnt: bool,
}

impl X86_64 {
    /// Baseline x86-64 with the System V convention.
    pub fn sysv() -> Self {
        Self {
            conv: &SYSV,
            popcnt: false,
        }
    }

    pub fn win64() -> Self {
        Self {
            conv: &WIN64,
            popcnt: false,
        }
    }

    /// The build host's convention with the running CPU's extensions.
    pub fn detect() -> Self {
        let base = if cfg!(windows) {
            Self::win64()
        } else {
            Self::sysv()
        };
        base.with_popcnt(cpu_has_popcnt())
    }

    pub fn with_popcnt(self, popcnt: bool) -> Self {
        Self { popcnt, ..self }
    }

    pub fn has_popcnt(&self) -> bool {
        self.popcnt
    }

    pub fn is_win64(&self) -> bool {
        self.conv.shadow_space > 0
    }
}

#[cfg(target_arch = "x86_64")]
fn cpu_has_popcnt() -> bool {
    std::arch::is_x86_feature_detected!("popcnt")
}

#[cfg(not(target_arch = "x86_64"))]
fn cpu_has_popcnt() -> bool {
    false
}

impl Target for X86_64 {
    fn name(&self) -> &'static str {
        self.conv.name
    }

    fn conv(&self) -> &CallConv {
        self.conv
    }

    fn max_bytes(&self, op: Opcode) -> Option<usize> {
        sizes::max_bytes(op, self.popcnt, self.is_win64())
    }

    fn encode(&self, inst: &Inst, sink: &mut Sink) -> JitResult<()> {
        emit::encode(self, inst, sink)
    }

    fn patch(
        &self,
        kind: RelocKind,
        site: usize,
        target: u64,
        field: &mut [u8],
    ) -> JitResult<()> {
        if field.len() != kind.len() {
            return Err(JitError::InvalidArena("relocation field has the wrong width"));
        }
        match kind {
            RelocKind::Rel32 => {
                let rel = (target as i64) - ((site + 4) as i64);
                let rel = i32::try_from(rel).map_err(|_| JitError::DisplacementOverflow {
                    site,
                    target: target as usize,
                })?;
                field.copy_from_slice(&rel.to_le_bytes());
                Ok(())
            }
            RelocKind::Abs64 => {
                field.copy_from_slice(&target.to_le_bytes());
                Ok(())
            }
            RelocKind::Branch26 | RelocKind::MovWide64 => Err(JitError::InvalidOperand(format!(
                "{kind:?} relocation on {}",
                self.name()
            ))),
        }
    }

    fn frame_bytes(&self, frame: &Frame) -> u32 {
        let layout = emit::FrameLayout::of(frame);
        8 + 8 * frame.gprs.len() as u32 + layout.adjust
    }
}
