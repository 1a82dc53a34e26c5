//! AArch64 backend for AAPCS64 and the Apple variant of it.

mod emit;
mod sizes;

use crate::abi::CallConv;
use crate::error::{JitError, JitResult};
use crate::label::RelocKind;
use crate::opcode::Opcode;
use crate::operand::{Fpr, Gpr};
use crate::target::{Frame, Inst, Sink, Target};

pub const fn x(n: u8) -> Gpr {
    Gpr(n)
}

pub const fn v(n: u8) -> Fpr {
    Fpr(n)
}

/// Base-register encoding of the stack pointer.
pub const SP: Gpr = Gpr(31);
pub const FP: Gpr = Gpr(29);
pub const LR: Gpr = Gpr(30);

pub const R0: Gpr = x(0);
pub const R1: Gpr = x(1);
pub const R2: Gpr = x(2);
pub const R3: Gpr = x(3);
pub const V0: Gpr = x(19);
pub const V1: Gpr = x(20);
pub const V2: Gpr = x(21);
pub const V3: Gpr = x(22);
pub const F0: Fpr = v(0);
pub const F1: Fpr = v(1);
pub const F2: Fpr = v(2);
pub const F3: Fpr = v(3);
pub const F4: Fpr = v(4);

static INT_ARGS: [Gpr; 8] = [x(0), x(1), x(2), x(3), x(4), x(5), x(6), x(7)];
static FLOAT_ARGS: [Fpr; 8] = [v(0), v(1), v(2), v(3), v(4), v(5), v(6), v(7)];
static INT_RETURNS: [Gpr; 2] = [x(0), x(1)];
static CALLER_SAVED: [Gpr; 16] = [
    x(0),
    x(1),
    x(2),
    x(3),
    x(4),
    x(5),
    x(6),
    x(7),
    x(8),
    x(9),
    x(10),
    x(11),
    x(12),
    x(13),
    x(14),
    x(15),
];
static CALLEE_SAVED: [Gpr; 10] = [
    x(19),
    x(20),
    x(21),
    x(22),
    x(23),
    x(24),
    x(25),
    x(26),
    x(27),
    x(28),
];
static CALLER_SAVED_FPRS: [Fpr; 23] = [
    v(0),
    v(1),
    v(2),
    v(3),
    v(4),
    v(5),
    v(6),
    v(7),
    v(16),
    v(17),
    v(18),
    v(19),
    v(20),
    v(21),
    v(22),
    v(23),
    v(24),
    v(25),
    v(26),
    v(27),
    v(28),
    v(29),
    v(30),
];
/// Only the low 64 bits are preserved across calls.
static CALLEE_SAVED_FPRS: [Fpr; 8] = [v(8), v(9), v(10), v(11), v(12), v(13), v(14), v(15)];

static AAPCS64: CallConv = CallConv {
    name: "aarch64-aapcs64",
    word_bytes: 8,
    int_args: &INT_ARGS,
    float_args: &FLOAT_ARGS,
    shared_arg_positions: false,
    int_returns: &INT_RETURNS,
    float_return: v(0),
    caller_saved_gprs: &CALLER_SAVED,
    callee_saved_gprs: &CALLEE_SAVED,
    caller_saved_fprs: &CALLER_SAVED_FPRS,
    callee_saved_fprs: &CALLEE_SAVED_FPRS,
    scratch_gpr: x(16),
    scratch_fpr: v(31),
    call_target: x(9),
    sp: SP,
    stack_align: 16,
    stack_args_offset: 0,
    shadow_space: 0,
    entry_misalignment: 0,
    packed_stack_args: false,
    max_args: 16,
};

static APPLE: CallConv = CallConv {
    name: "aarch64-apple",
    packed_stack_args: true,
    ..AAPCS64
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aarch64 {
    conv: &'static CallConv,
}

impl Aarch64 {
    pub fn aapcs64() -> Self {
        Self { conv: &AAPCS64 }
    }

    /// Darwin: stack arguments are packed to their natural size.
    pub fn apple() -> Self {
        Self { conv: &APPLE }
    }
}

impl Target for Aarch64 {
    fn name(&self) -> &'static str {
        self.conv.name
    }

    fn conv(&self) -> &CallConv {
        self.conv
    }

    fn max_bytes(&self, op: Opcode) -> Option<usize> {
        sizes::max_bytes(op)
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
            RelocKind::Branch26 => {
                let insn = read_word(field, 0);
                let rel = emit::branch26(site, target as usize)?;
                field.copy_from_slice(&((insn & 0xFC00_0000) | rel).to_le_bytes());
                Ok(())
            }
            RelocKind::MovWide64 => {
                for index in 0..4 {
                    let insn = read_word(field, index);
                    let half = ((target >> (16 * index)) & 0xFFFF) as u32;
                    let insn = (insn & !(0xFFFF << 5)) | (half << 5);
                    field[4 * index..4 * index + 4].copy_from_slice(&insn.to_le_bytes());
                }
                Ok(())
            }
            RelocKind::Rel32 | RelocKind::Abs64 => Err(JitError::InvalidOperand(format!(
                "{kind:?} relocation on {}",
                self.name()
            ))),
        }
    }

    fn frame_bytes(&self, frame: &Frame) -> u32 {
        let pairs = |n: usize| 16 * n.div_ceil(2) as u32;
        16 + pairs(frame.gprs.len()) + pairs(frame.fprs.len()) + frame.locals
    }
}

fn read_word(field: &[u8], index: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&field[4 * index..4 * index + 4]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::LabelTable;
    use crate::operand::Reg;
    use crate::target::{Addr, Dest, grid};

    fn words(inst: Inst) -> Vec<u32> {
        let mut sink = Sink::new(0);
        Aarch64::aapcs64().encode(&inst, &mut sink).expect("encode");
        sink.bytes()
            .chunks(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    #[test]
    fn every_encoding_fits_its_bound() {
        grid::check_bounds(&Aarch64::aapcs64());
        grid::check_bounds(&Aarch64::apple());
    }

    #[test]
    fn three_register_add() {
        let inst = Inst::Alu {
            op: Opcode::Addr,
            dst: x(0),
            a: x(1),
            b: x(2),
        };
        // add x0, x1, x2
        assert_eq!(words(inst), vec![0x8B02_0020]);
    }

    #[test]
    fn logical_immediates_fold_into_one_instruction() {
        let inst = Inst::AluImm {
            op: Opcode::Andi,
            dst: x(0),
            a: x(1),
            imm: 0xff,
        };
        assert_eq!(words(inst), vec![0x9240_1C20]);
    }

    #[test]
    fn wide_immediates_use_movz_and_movk() {
        let code = words(Inst::LoadImm {
            dst: x(3),
            imm: 0x1234_0000_5678,
        });
        // movz x3, #0x5678; movk x3, #0x1234, lsl #32
        assert_eq!(code, vec![0xD28A_CF03, 0xF2C2_4683]);
        // movn x3, #0
        assert_eq!(words(Inst::LoadImm { dst: x(3), imm: -1 }), vec![0x9280_0003]);
    }

    #[test]
    fn stack_pointer_offsets_scale() {
        let inst = Inst::Load {
            op: Opcode::LdxiL,
            dst: Reg::Gpr(x(0)),
            addr: Addr::Offset(SP, 16),
        };
        // ldr x0, [sp, #16]
        assert_eq!(words(inst), vec![0xF940_0BE0]);
        let inst = Inst::Store {
            op: Opcode::StxiI,
            src: Reg::Gpr(x(1)),
            addr: Addr::Offset(x(2), -4),
        };
        // stur w1, [x2, #-4]
        assert_eq!(words(inst), vec![0xB81F_C041]);
    }

    #[test]
    fn far_pending_branches_invert_around_a_b() {
        let mut labels = LabelTable::new();
        let label = labels.create();
        let mut sink = Sink::new(64);
        Aarch64::aapcs64()
            .encode(
                &Inst::Branch {
                    op: Opcode::Bltr,
                    a: x(0),
                    b: x(1),
                    dest: Dest {
                        label,
                        offset: None,
                    },
                },
                &mut sink,
            )
            .expect("encode");
        assert_eq!(sink.len(), 12);
        // b.ge +8
        assert_eq!(&sink.bytes()[4..8], &0x5400_004Au32.to_le_bytes());
        assert_eq!(sink.relocs()[0].site, 72);
        assert_eq!(sink.relocs()[0].kind, RelocKind::Branch26);
    }

    #[test]
    fn branch26_patch_rewrites_the_displacement() {
        let target = Aarch64::aapcs64();
        let mut field = 0x1400_0000u32.to_le_bytes();
        target
            .patch(RelocKind::Branch26, 8, 0, &mut field)
            .expect("patch");
        assert_eq!(u32::from_le_bytes(field), 0x17FF_FFFE);
        assert!(matches!(
            target.patch(RelocKind::Branch26, 0, 1 << 28, &mut field),
            Err(JitError::DisplacementOverflow { .. })
        ));
    }

    #[test]
    fn mov_wide_patch_fills_all_four_halves() {
        let target = Aarch64::aapcs64();
        let mut field = [0u8; 16];
        for (index, base) in [0xD280_0000u32, 0xF2A0_0000, 0xF2C0_0000, 0xF2E0_0000]
            .iter()
            .enumerate()
        {
            field[4 * index..4 * index + 4].copy_from_slice(&base.to_le_bytes());
        }
        target
            .patch(RelocKind::MovWide64, 0, 0x1111_2222_3333_4444, &mut field)
            .expect("patch");
        assert_eq!(read_word(&field, 0), 0xD280_0000 | (0x4444 << 5));
        assert_eq!(read_word(&field, 3), 0xF2E0_0000 | (0x1111 << 5));
    }

    #[test]
    fn frame_bytes_count_pairs() {
        let target = Aarch64::aapcs64();
        let frame = Frame {
            gprs: vec![V0, V1, V2],
            fprs: vec![v(8)],
            locals: 32,
        };
        assert_eq!(target.frame_bytes(&frame), 16 + 32 + 16 + 32);
        let mut sink = Sink::new(0);
        target.encode(&Inst::Prolog(frame), &mut sink).expect("encode");
        // stp x29, x30, [sp, #-16]!; mov x29, sp
        assert_eq!(&sink.bytes()[..8], &[0xFD, 0x7B, 0xBF, 0xA9, 0xFD, 0x03, 0x00, 0x91]);
    }

    #[test]
    fn apple_differs_only_in_stack_packing() {
        let apple = Aarch64::apple();
        let linux = Aarch64::aapcs64();
        assert!(apple.conv().packed_stack_args);
        assert!(!linux.conv().packed_stack_args);
        assert_eq!(apple.conv().int_args, linux.conv().int_args);
    }
}
