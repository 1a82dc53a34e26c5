use super::{Aarch64, FP, LR, SP};
use crate::error::{JitError, JitResult};
use crate::label::RelocKind;
use crate::opcode::{Cond, FCond, MemAccess, Opcode, OverflowBranch};
use crate::operand::{Fpr, Reg};
use crate::target::{Addr, Dest, Frame, Inst, Sink};

/// Move scratch; also the temporary for wide immediates.
const X16: u8 = 16;
/// Address temporary, never live across instructions.
const X17: u8 = 17;
const XZR: u8 = 31;
const V31: u8 = 31;

const EQ: u32 = 0;
const NE: u32 = 1;
const HS: u32 = 2;
const LO: u32 = 3;
const MI: u32 = 4;
const VS: u32 = 6;
const VC: u32 = 7;
const HI: u32 = 8;
const LS: u32 = 9;
const GE: u32 = 10;
const LT: u32 = 11;
const GT: u32 = 12;
const LE: u32 = 13;

fn emit_u32(s: &mut Sink, insn: u32) {
    s.put_u32(insn);
}

fn rrr(base: u32, rd: u8, rn: u8, rm: u8) -> u32 {
    base | (u32::from(rm) << 16) | (u32::from(rn) << 5) | u32::from(rd)
}

fn rr(base: u32, rd: u8, rn: u8) -> u32 {
    base | (u32::from(rn) << 5) | u32::from(rd)
}

fn mov_reg(s: &mut Sink, dst: u8, src: u8) {
    if dst != src {
        // orr dst, xzr, src
        emit_u32(s, rrr(0xAA00_0000, dst, XZR, src));
    }
}

/// movz/movn followed by movk for every remaining halfword.
fn mov_imm(s: &mut Sink, dst: u8, value: i64) {
    let value = value as u64;
    let parts: [u16; 4] = std::array::from_fn(|i| (value >> (16 * i)) as u16);
    let zeros = parts.iter().filter(|part| **part == 0).count();
    let ones = parts.iter().filter(|part| **part == 0xFFFF).count();
    let (skip, first_insn) = if ones > zeros {
        (0xFFFF, 0x9280_0000u32)
    } else {
        (0x0000, 0xD280_0000u32)
    };
    let first = parts.iter().position(|part| *part != skip).unwrap_or(0);
    let first_imm = if ones > zeros {
        !parts[first]
    } else {
        parts[first]
    };
    emit_u32(
        s,
        first_insn | ((first as u32) << 21) | (u32::from(first_imm) << 5) | u32::from(dst),
    );
    for (index, part) in parts.iter().enumerate() {
        if index == first || *part == skip {
            continue;
        }
        emit_u32(
            s,
            0xF280_0000 | ((index as u32) << 21) | (u32::from(*part) << 5) | u32::from(dst),
        );
    }
}

/// movz + three movk with empty fields, rewritten by a `MovWide64` patch.
fn mov_wide_placeholder(s: &mut Sink, dst: u8) {
    emit_u32(s, 0xD280_0000 | u32::from(dst));
    for hw in 1..4u32 {
        emit_u32(s, 0xF280_0000 | (hw << 21) | u32::from(dst));
    }
}

fn is_mask(value: u64) -> bool {
    value != 0 && (value.wrapping_add(1) & value) == 0
}

fn is_shifted_mask(value: u64) -> bool {
    value != 0 && is_mask((value - 1) | value)
}

/// `N:immr:imms` for a 64-bit bitmask immediate, or `None` when the value
/// has no such encoding.
pub(super) fn logical_imm(value: u64) -> Option<u32> {
    if value == 0 || value == u64::MAX {
        return None;
    }
    let mut size = 64u32;
    loop {
        let half = size / 2;
        let mask = (1u64 << half) - 1;
        if value & mask != (value >> half) & mask {
            break;
        }
        size = half;
        if size <= 2 {
            break;
        }
    }
    let mask = if size == 64 {
        u64::MAX
    } else {
        (1u64 << size) - 1
    };
    let mut elt = value & mask;
    let (rotation, ones) = if is_shifted_mask(elt) {
        let rotation = elt.trailing_zeros();
        (rotation, (elt >> rotation).trailing_ones())
    } else {
        elt |= !mask;
        if !is_shifted_mask(!elt) {
            return None;
        }
        let leading = elt.leading_ones();
        (64 - leading, leading + elt.trailing_ones() - (64 - size))
    };
    let immr = (size - rotation) & (size - 1);
    let nimms = ((!(u64::from(size) - 1)) << 1) | u64::from(ones - 1);
    let n = (((nimms >> 6) & 1) ^ 1) as u32;
    Some((n << 12) | (immr << 6) | (nimms & 0x3F) as u32)
}

/// `add`/`sub` immediate form; `shifted` applies `lsl #12`.
fn add_sub_imm(base: u32, rd: u8, rn: u8, imm12: u32, shifted: bool) -> u32 {
    base | (u32::from(shifted) << 22) | ((imm12 & 0xFFF) << 10) | (u32::from(rn) << 5) | u32::from(rd)
}

const ADD_IMM: u32 = 0x9100_0000;
const SUB_IMM: u32 = 0xD100_0000;
const ADDS_IMM: u32 = 0xB100_0000;
const SUBS_IMM: u32 = 0xF100_0000;

const ADD: u32 = 0x8B00_0000;
const ADDS: u32 = 0xAB00_0000;
const SUB: u32 = 0xCB00_0000;
const SUBS: u32 = 0xEB00_0000;
const ADCS: u32 = 0xBA00_0000;
const SBCS: u32 = 0xFA00_0000;
const AND: u32 = 0x8A00_0000;
const ORR: u32 = 0xAA00_0000;
const EOR: u32 = 0xCA00_0000;
const ANDS: u32 = 0xEA00_0000;
const MUL: u32 = 0x9B00_7C00;
const SDIV: u32 = 0x9AC0_0C00;
const UDIV: u32 = 0x9AC0_0800;
const LSLV: u32 = 0x9AC0_2000;
const LSRV: u32 = 0x9AC0_2400;
const ASRV: u32 = 0x9AC0_2800;

/// `rd = rn +/- imm` for immediates up to 24 bits, else through x16.
fn add_imm(s: &mut Sink, rd: u8, rn: u8, imm: i64) {
    if imm == 0 {
        mov_reg(s, rd, rn);
        return;
    }
    let (base, magnitude) = if imm > 0 {
        (ADD_IMM, imm.unsigned_abs())
    } else {
        (SUB_IMM, imm.unsigned_abs())
    };
    if magnitude < 1 << 12 {
        emit_u32(s, add_sub_imm(base, rd, rn, magnitude as u32, false));
    } else if magnitude < 1 << 24 {
        emit_u32(s, add_sub_imm(base, rd, rn, (magnitude >> 12) as u32, true));
        if magnitude & 0xFFF != 0 {
            emit_u32(s, add_sub_imm(base, rd, rd, (magnitude & 0xFFF) as u32, false));
        }
    } else {
        mov_imm(s, X16, imm);
        if rd == SP.0 || rn == SP.0 {
            // add rd, rn, x16, uxtx
            emit_u32(s, rrr(0x8B20_6000, rd, rn, X16));
        } else {
            emit_u32(s, rrr(ADD, rd, rn, X16));
        }
    }
}

fn cmp_imm(s: &mut Sink, rn: u8, imm: i64) {
    if (0..4096).contains(&imm) {
        emit_u32(s, add_sub_imm(SUBS_IMM, XZR, rn, imm as u32, false));
    } else if (-4095..0).contains(&imm) {
        // cmn
        emit_u32(s, add_sub_imm(ADDS_IMM, XZR, rn, (-imm) as u32, false));
    } else {
        mov_imm(s, X16, imm);
        emit_u32(s, rrr(SUBS, XZR, rn, X16));
    }
}

fn cond_code(cond: Cond) -> u32 {
    match cond {
        Cond::Lt => LT,
        Cond::Le => LE,
        Cond::Eq => EQ,
        Cond::Ge => GE,
        Cond::Gt => GT,
        Cond::Ne => NE,
        Cond::LtU => LO,
        Cond::LeU => LS,
        Cond::GeU => HS,
        Cond::GtU => HI,
    }
}

fn overflow_code(branch: OverflowBranch) -> u32 {
    let overflow = match (branch.sub, branch.unsigned) {
        (_, false) => VS,
        (false, true) => HS,
        // Borrow clears the carry flag.
        (true, true) => LO,
    };
    if branch.on_overflow {
        overflow
    } else {
        overflow ^ 1
    }
}

fn fcond_code(cond: FCond) -> u32 {
    match cond {
        FCond::Lt => MI,
        FCond::Le => LS,
        FCond::Eq => EQ,
        FCond::Ge => GE,
        FCond::Gt => GT,
        FCond::Ne => NE,
        FCond::Unord => VS,
        FCond::Ord => VC,
    }
}

/// Word displacement field of `b`/`bl` from `site` to `target`.
pub(super) fn branch26(site: usize, target: usize) -> JitResult<u32> {
    let rel = target as i64 - site as i64;
    if rel % 4 != 0 || !(-(1i64 << 27)..(1i64 << 27)).contains(&rel) {
        return Err(JitError::DisplacementOverflow { site, target });
    }
    Ok(((rel >> 2) as u32) & 0x03FF_FFFF)
}

fn imm19(site: usize, target: usize) -> Option<u32> {
    let rel = target as i64 - site as i64;
    (-(1i64 << 20)..(1i64 << 20))
        .contains(&rel)
        .then(|| ((rel >> 2) as u32) & 0x7_FFFF)
}

fn b(s: &mut Sink, dest: Dest) -> JitResult<()> {
    match dest.offset {
        Some(target) => {
            let rel = branch26(s.offset(), target)?;
            emit_u32(s, 0x1400_0000 | rel);
        }
        None => {
            s.reloc(dest.label, RelocKind::Branch26);
            emit_u32(s, 0x1400_0000);
        }
    }
    Ok(())
}

/// Emits `short` (a conditional branch with an imm19 field) when the
/// target is known and close, otherwise its inverse skipping over a `b`.
fn branch_with(s: &mut Sink, short: u32, inverse: u32, dest: Dest) -> JitResult<()> {
    if let Some(field) = dest.offset.and_then(|target| imm19(s.offset(), target)) {
        emit_u32(s, short | (field << 5));
        return Ok(());
    }
    emit_u32(s, inverse | (2 << 5));
    b(s, dest)
}

fn bcond(s: &mut Sink, cond: u32, dest: Dest) -> JitResult<()> {
    branch_with(s, 0x5400_0000 | cond, 0x5400_0000 | (cond ^ 1), dest)
}

fn invalid(op: Opcode, shape: &str) -> JitError {
    JitError::InvalidOperand(format!("{op} is not a {shape} operation"))
}

pub(super) fn encode(_target: &Aarch64, inst: &Inst, s: &mut Sink) -> JitResult<()> {
    match inst {
        Inst::Alu { op, dst, a, b } => alu(s, *op, dst.0, a.0, b.0),
        Inst::AluImm { op, dst, a, imm } => alu_imm(s, *op, dst.0, a.0, *imm),
        Inst::Unary { op, dst, src } => unary(s, *op, dst.0, src.0),
        Inst::LoadImm { dst, imm } => {
            mov_imm(s, dst.0, *imm);
            Ok(())
        }
        Inst::MovAddr { dst, dest } => {
            if let Some(target) = dest.offset {
                let rel = target as i64 - s.offset() as i64;
                if (-(1i64 << 20)..(1i64 << 20)).contains(&rel) {
                    // adr
                    let rel = rel as u32;
                    emit_u32(
                        s,
                        0x1000_0000 | ((rel & 3) << 29) | (((rel >> 2) & 0x7_FFFF) << 5) | u32::from(dst.0),
                    );
                    return Ok(());
                }
            }
            s.reloc(dest.label, RelocKind::MovWide64);
            mov_wide_placeholder(s, dst.0);
            Ok(())
        }
        Inst::Load { op, dst, addr } => memory(s, *op, true, *dst, *addr),
        Inst::Store { op, src, addr } => memory(s, *op, false, *src, *addr),
        Inst::FAlu { op, dst, a, b } => falu(s, *op, *dst, *a, *b),
        Inst::FUnary { op, dst, src } => funary(s, *op, *dst, *src),
        Inst::FLoadImm { op, dst, bits } => {
            fload_imm(s, op.is_double(), *dst, *bits);
            Ok(())
        }
        Inst::IntToFloat { op, dst, src } => {
            // scvtf
            let base = if op.is_double() { 0x9E62_0000 } else { 0x9E22_0000 };
            emit_u32(s, rr(base, dst.0, src.0));
            Ok(())
        }
        Inst::FloatToInt { op, dst, src } => {
            // fcvtzs
            let base = if op.is_double() { 0x9E78_0000 } else { 0x9E38_0000 };
            emit_u32(s, rr(base, dst.0, src.0));
            Ok(())
        }
        Inst::Branch { op, a, b, dest } => branch(s, *op, a.0, b.0, *dest),
        Inst::BranchImm { op, a, imm, dest } => branch_imm(s, *op, a.0, *imm, *dest),
        Inst::FBranch { op, a, b, dest } => {
            let (cond, double) = op.float_cond().ok_or_else(|| invalid(*op, "float branch"))?;
            // fcmp
            let base = if double { 0x1E60_2000 } else { 0x1E20_2000 };
            emit_u32(s, rrr(base, 0, a.0, b.0));
            bcond(s, fcond_code(cond), *dest)
        }
        Inst::Jump { dest } => b(s, *dest),
        Inst::Indirect { op, reg } => {
            let base = if *op == Opcode::Callr { 0xD63F_0000 } else { 0xD61F_0000 };
            emit_u32(s, rr(base, 0, reg.0));
            Ok(())
        }
        Inst::IndirectAbs { op, addr } => {
            mov_imm(s, X16, *addr as i64);
            let base = if *op == Opcode::Calli { 0xD63F_0000 } else { 0xD61F_0000 };
            emit_u32(s, rr(base, 0, X16));
            Ok(())
        }
        Inst::Ret => {
            emit_u32(s, 0xD65F_03C0);
            Ok(())
        }
        Inst::Prolog(frame) => {
            prolog(s, frame);
            Ok(())
        }
        Inst::Epilog(frame) => {
            epilog(s, frame);
            Ok(())
        }
        Inst::AdjustSp(delta) => {
            add_imm(s, SP.0, SP.0, i64::from(*delta));
            Ok(())
        }
    }
}

fn alu(s: &mut Sink, op: Opcode, rd: u8, rn: u8, rm: u8) -> JitResult<()> {
    use Opcode::*;
    let base = match op {
        Addr => ADD,
        Addcr => ADDS,
        Addxr => ADCS,
        Subr => SUB,
        Subcr => SUBS,
        Subxr => SBCS,
        Mulr => MUL,
        Divr => SDIV,
        DivrU => UDIV,
        Andr => AND,
        Orr => ORR,
        Xorr => EOR,
        Lshr => LSLV,
        Rshr => ASRV,
        RshrU => LSRV,
        Remr | RemrU => {
            remainder(s, op == Remr, rd, rn, rm);
            return Ok(());
        }
        _ => {
            let cond = op.compare_cond().ok_or_else(|| invalid(op, "three-register"))?;
            emit_u32(s, rrr(SUBS, XZR, rn, rm));
            cset(s, rd, cond_code(cond));
            return Ok(());
        }
    };
    emit_u32(s, rrr(base, rd, rn, rm));
    Ok(())
}

fn remainder(s: &mut Sink, signed: bool, rd: u8, rn: u8, rm: u8) {
    emit_u32(s, rrr(if signed { SDIV } else { UDIV }, X16, rn, rm));
    // msub rd, x16, rm, rn
    emit_u32(s, 0x9B00_8000 | (u32::from(rm) << 16) | (u32::from(rn) << 10) | (u32::from(X16) << 5) | u32::from(rd));
}

fn cset(s: &mut Sink, rd: u8, cond: u32) {
    // csinc rd, xzr, xzr, !cond
    emit_u32(s, 0x9A9F_07E0 | ((cond ^ 1) << 12) | u32::from(rd));
}

fn shift_count(op: Opcode, imm: i64) -> JitResult<u32> {
    u32::try_from(imm)
        .ok()
        .filter(|count| *count < 64)
        .ok_or_else(|| JitError::InvalidOperand(format!("{op} shift count {imm} is not in 0..=63")))
}

fn alu_imm(s: &mut Sink, op: Opcode, rd: u8, rn: u8, imm: i64) -> JitResult<()> {
    use Opcode::*;
    let via_x16 = |s: &mut Sink, base: u32| {
        mov_imm(s, X16, imm);
        emit_u32(s, rrr(base, rd, rn, X16));
    };
    match op {
        Addi => add_imm(s, rd, rn, imm),
        Subi => {
            if imm == i64::MIN {
                via_x16(s, SUB);
            } else {
                add_imm(s, rd, rn, -imm);
            }
        }
        Addci if (0..4096).contains(&imm) => {
            emit_u32(s, add_sub_imm(ADDS_IMM, rd, rn, imm as u32, false));
        }
        Subci if (0..4096).contains(&imm) => {
            emit_u32(s, add_sub_imm(SUBS_IMM, rd, rn, imm as u32, false));
        }
        Addci => via_x16(s, ADDS),
        Subci => via_x16(s, SUBS),
        Addxi => via_x16(s, ADCS),
        Subxi => via_x16(s, SBCS),
        Rsbi => {
            mov_imm(s, X16, imm);
            emit_u32(s, rrr(SUB, rd, X16, rn));
        }
        Muli => via_x16(s, MUL),
        Divi => via_x16(s, SDIV),
        DiviU => via_x16(s, UDIV),
        Remi | RemiU => {
            mov_imm(s, X17, imm);
            remainder(s, op == Remi, rd, rn, X17);
        }
        Andi | Ori | Xori => {
            let (reg_base, imm_base) = match op {
                Andi => (AND, 0x9200_0000),
                Ori => (ORR, 0xB200_0000),
                _ => (EOR, 0xD200_0000),
            };
            match logical_imm(imm as u64) {
                Some(field) => emit_u32(s, rr(imm_base | (field << 10), rd, rn)),
                None => via_x16(s, reg_base),
            }
        }
        Lshi | Rshi | RshiU => {
            let count = shift_count(op, imm)?;
            if count == 0 {
                mov_reg(s, rd, rn);
            } else {
                let insn = match op {
                    // ubfm rd, rn, #(64 - count), #(63 - count)
                    Lshi => 0xD340_0000 | (((64 - count) & 63) << 16) | ((63 - count) << 10),
                    // sbfm rd, rn, #count, #63
                    Rshi => 0x9340_FC00 | (count << 16),
                    // ubfm rd, rn, #count, #63
                    _ => 0xD340_FC00 | (count << 16),
                };
                emit_u32(s, rr(insn, rd, rn));
            }
        }
        _ => {
            let cond = op.compare_cond().ok_or_else(|| invalid(op, "register-immediate"))?;
            cmp_imm(s, rn, imm);
            cset(s, rd, cond_code(cond));
        }
    }
    Ok(())
}

fn unary(s: &mut Sink, op: Opcode, rd: u8, rn: u8) -> JitResult<()> {
    use Opcode::*;
    let insn = match op {
        Movr => {
            mov_reg(s, rd, rn);
            return Ok(());
        }
        // sub rd, xzr, rn
        Negr => rrr(SUB, rd, XZR, rn),
        // orn rd, xzr, rn
        Comr => rrr(0xAA20_0000, rd, XZR, rn),
        Popcntr => {
            // fmov d31, rn; cnt v31.8b; addv b31; fmov rd, d31
            emit_u32(s, rr(0x9E67_0000, V31, rn));
            emit_u32(s, rr(0x0E20_5800, V31, V31));
            emit_u32(s, rr(0x0E31_B800, V31, V31));
            emit_u32(s, rr(0x9E66_0000, rd, V31));
            return Ok(());
        }
        ExtrC => rr(0x9340_1C00, rd, rn),
        ExtrUc => rr(0xD340_1C00, rd, rn),
        ExtrS => rr(0x9340_3C00, rd, rn),
        ExtrUs => rr(0xD340_3C00, rd, rn),
        ExtrI => rr(0x9340_7C00, rd, rn),
        // mov wd, wn
        ExtrUi => rrr(0x2A00_0000, rd, XZR, rn),
        BswaprUl => rr(0xDAC0_0C00, rd, rn),
        BswaprUi => rr(0x5AC0_0800, rd, rn),
        BswaprUs => {
            // rev wd, wn; lsr wd, wd, #16
            emit_u32(s, rr(0x5AC0_0800, rd, rn));
            rr(0x5310_7C00, rd, rd)
        }
        _ => return Err(invalid(op, "two-register")),
    };
    emit_u32(s, insn);
    Ok(())
}

/// Unsigned-offset form of a load or store; bit 24 selects the scaled
/// immediate variant, which the other forms clear.
fn mem_base(access: MemAccess, load: bool) -> u32 {
    match (access.float, access.bytes, load, access.signed) {
        (false, 1, true, true) => 0x3980_0000,
        (false, 1, true, false) => 0x3940_0000,
        (false, 2, true, true) => 0x7980_0000,
        (false, 2, true, false) => 0x7940_0000,
        (false, 4, true, true) => 0xB980_0000,
        (false, 4, true, false) => 0xB940_0000,
        (false, _, true, _) => 0xF940_0000,
        (false, 1, false, _) => 0x3900_0000,
        (false, 2, false, _) => 0x7900_0000,
        (false, 4, false, _) => 0xB900_0000,
        (false, _, false, _) => 0xF900_0000,
        (true, 4, true, _) => 0xBD40_0000,
        (true, _, true, _) => 0xFD40_0000,
        (true, 4, false, _) => 0xBD00_0000,
        (true, _, false, _) => 0xFD00_0000,
    }
}

fn register_offset(base: u32, rt: u8, rn: u8, rm: u8) -> u32 {
    // [rn, rm, lsl #0]
    (base & !0x0100_0000) | 0x0020_6800 | (u32::from(rm) << 16) | (u32::from(rn) << 5) | u32::from(rt)
}

fn memory(s: &mut Sink, op: Opcode, load: bool, value: Reg, addr: Addr) -> JitResult<()> {
    let access = op
        .mem_access()
        .ok_or_else(|| invalid(op, if load { "load" } else { "store" }))?;
    let rt = match (value, access.float) {
        (Reg::Gpr(reg), false) => reg.0,
        (Reg::Fpr(reg), true) => reg.0,
        _ => {
            return Err(JitError::InvalidOperand(format!(
                "{op} cannot transfer {value:?}"
            )));
        }
    };
    let base = mem_base(access, load);
    let size = i64::from(access.bytes);
    match addr {
        Addr::Base(rn) => emit_u32(s, rr(base, rt, rn.0)),
        Addr::Abs(address) => {
            mov_imm(s, X17, address as i64);
            emit_u32(s, rr(base, rt, X17));
        }
        Addr::Index(rn, rm) => {
            if rm == SP {
                return Err(JitError::InvalidOperand(
                    "stack pointer cannot be used as an index".to_string(),
                ));
            }
            emit_u32(s, register_offset(base, rt, rn.0, rm.0));
        }
        Addr::Offset(rn, offset) => {
            if offset >= 0 && offset % size == 0 && offset / size < 4096 {
                emit_u32(s, rr(base | (((offset / size) as u32) << 10), rt, rn.0));
            } else if (-256..256).contains(&offset) {
                let unscaled = base & !0x0100_0000;
                emit_u32(s, rr(unscaled | (((offset as u32) & 0x1FF) << 12), rt, rn.0));
            } else {
                mov_imm(s, X17, offset);
                emit_u32(s, register_offset(base, rt, rn.0, X17));
            }
        }
    }
    Ok(())
}

fn falu(s: &mut Sink, op: Opcode, dst: Fpr, a: Fpr, b: Fpr) -> JitResult<()> {
    use Opcode::*;
    let base = match op {
        AddrF | AddrD => 0x1E20_2800,
        SubrF | SubrD => 0x1E20_3800,
        MulrF | MulrD => 0x1E20_0800,
        DivrF | DivrD => 0x1E20_1800,
        _ => return Err(invalid(op, "float three-register")),
    };
    let ftype = if op.is_double() { 0x0040_0000 } else { 0 };
    emit_u32(s, rrr(base | ftype, dst.0, a.0, b.0));
    Ok(())
}

fn funary(s: &mut Sink, op: Opcode, dst: Fpr, src: Fpr) -> JitResult<()> {
    use Opcode::*;
    let ftype = if op.is_double() { 0x0040_0000 } else { 0 };
    let insn = match op {
        NegrF | NegrD => 0x1E21_4000 | ftype,
        AbsrF | AbsrD => 0x1E20_C000 | ftype,
        SqrtrF | SqrtrD => 0x1E21_C000 | ftype,
        MovrF | MovrD => {
            if dst == src {
                return Ok(());
            }
            0x1E20_4000 | ftype
        }
        // fcvt d, s / fcvt s, d
        ExtrFD => 0x1E22_C000,
        ExtrDF => 0x1E62_4000,
        _ => return Err(invalid(op, "float two-register")),
    };
    emit_u32(s, rr(insn, dst.0, src.0));
    Ok(())
}

fn fload_imm(s: &mut Sink, double: bool, dst: Fpr, bits: u64) {
    let bits = if double { bits } else { bits & 0xFFFF_FFFF };
    let fmov = if double { 0x9E67_0000 } else { 0x1E27_0000 };
    if bits == 0 {
        emit_u32(s, rr(fmov, dst.0, XZR));
        return;
    }
    mov_imm(s, X16, bits as i64);
    emit_u32(s, rr(fmov, dst.0, X16));
}

fn branch(s: &mut Sink, op: Opcode, a: u8, b: u8, dest: Dest) -> JitResult<()> {
    if let Some(cond) = op.compare_cond() {
        emit_u32(s, rrr(SUBS, XZR, a, b));
        bcond(s, cond_code(cond), dest)
    } else if let Some(any_set) = op.mask_test() {
        emit_u32(s, rrr(ANDS, XZR, a, b));
        bcond(s, if any_set { NE } else { EQ }, dest)
    } else if let Some(overflow) = op.overflow_branch() {
        emit_u32(s, rrr(if overflow.sub { SUBS } else { ADDS }, a, a, b));
        bcond(s, overflow_code(overflow), dest)
    } else {
        Err(invalid(op, "register branch"))
    }
}

fn branch_imm(s: &mut Sink, op: Opcode, a: u8, imm: i64, dest: Dest) -> JitResult<()> {
    if let Some(cond) = op.compare_cond() {
        if imm == 0 && matches!(cond, Cond::Eq | Cond::Ne) {
            // cbz / cbnz
            let (short, inverse) = if cond == Cond::Eq {
                (0xB400_0000, 0xB500_0000)
            } else {
                (0xB500_0000, 0xB400_0000)
            };
            let rt = u32::from(a);
            return branch_with(s, short | rt, inverse | rt, dest);
        }
        cmp_imm(s, a, imm);
        bcond(s, cond_code(cond), dest)
    } else if let Some(any_set) = op.mask_test() {
        match logical_imm(imm as u64) {
            // tst a, #imm
            Some(field) => emit_u32(s, rr(0xF200_0000 | (field << 10), XZR, a)),
            None => {
                mov_imm(s, X16, imm);
                emit_u32(s, rrr(ANDS, XZR, a, X16));
            }
        }
        bcond(s, if any_set { NE } else { EQ }, dest)
    } else if let Some(overflow) = op.overflow_branch() {
        if (0..4096).contains(&imm) {
            let base = if overflow.sub { SUBS_IMM } else { ADDS_IMM };
            emit_u32(s, add_sub_imm(base, a, a, imm as u32, false));
        } else {
            mov_imm(s, X16, imm);
            emit_u32(s, rrr(if overflow.sub { SUBS } else { ADDS }, a, a, X16));
        }
        bcond(s, overflow_code(overflow), dest)
    } else {
        Err(invalid(op, "immediate branch"))
    }
}

const STP_X_PRE: u32 = 0xA980_0000;
const LDP_X_POST: u32 = 0xA8C0_0000;
const STR_X_PRE: u32 = 0xF800_0C00;
const LDR_X_POST: u32 = 0xF840_0400;
const STP_D_PRE: u32 = 0x6D80_0000;
const LDP_D_POST: u32 = 0x6CC0_0000;
const STR_D_PRE: u32 = 0xFC00_0C00;
const LDR_D_POST: u32 = 0xFC40_0400;

fn pair(base: u32, offset: i32, rt: u8, rt2: u8) -> u32 {
    let imm7 = ((offset / 8) as u32) & 0x7F;
    base | (imm7 << 15) | (u32::from(rt2) << 10) | (u32::from(SP.0) << 5) | u32::from(rt)
}

fn single(base: u32, offset: i32, rt: u8) -> u32 {
    base | (((offset as u32) & 0x1FF) << 12) | (u32::from(SP.0) << 5) | u32::from(rt)
}

fn push_regs(s: &mut Sink, regs: &[u8], stp: u32, str_pre: u32) {
    for chunk in regs.chunks(2) {
        match chunk {
            [a, b] => emit_u32(s, pair(stp, -16, *a, *b)),
            [a] => emit_u32(s, single(str_pre, -16, *a)),
            _ => {}
        }
    }
}

fn pop_regs(s: &mut Sink, regs: &[u8], ldp: u32, ldr_post: u32) {
    let chunks: Vec<&[u8]> = regs.chunks(2).collect();
    for chunk in chunks.into_iter().rev() {
        match chunk {
            [a, b] => emit_u32(s, pair(ldp, 16, *a, *b)),
            [a] => emit_u32(s, single(ldr_post, 16, *a)),
            _ => {}
        }
    }
}

fn prolog(s: &mut Sink, frame: &Frame) {
    emit_u32(s, pair(STP_X_PRE, -16, FP.0, LR.0));
    // mov x29, sp
    emit_u32(s, add_sub_imm(ADD_IMM, FP.0, SP.0, 0, false));
    let gprs: Vec<u8> = frame.gprs.iter().map(|reg| reg.0).collect();
    let fprs: Vec<u8> = frame.fprs.iter().map(|reg| reg.0).collect();
    push_regs(s, &gprs, STP_X_PRE, STR_X_PRE);
    push_regs(s, &fprs, STP_D_PRE, STR_D_PRE);
    add_imm(s, SP.0, SP.0, -i64::from(frame.locals));
}

fn epilog(s: &mut Sink, frame: &Frame) {
    add_imm(s, SP.0, SP.0, i64::from(frame.locals));
    let gprs: Vec<u8> = frame.gprs.iter().map(|reg| reg.0).collect();
    let fprs: Vec<u8> = frame.fprs.iter().map(|reg| reg.0).collect();
    pop_regs(s, &fprs, LDP_D_POST, LDR_D_POST);
    pop_regs(s, &gprs, LDP_X_POST, LDR_X_POST);
    emit_u32(s, pair(LDP_X_POST, 16, FP.0, LR.0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::LabelTable;
    use crate::operand::Gpr;

    fn words(sink: &Sink) -> Vec<u32> {
        sink.bytes()
            .chunks(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn encoded(inst: Inst) -> Vec<u32> {
        let mut sink = Sink::new(0);
        encode(&Aarch64::aapcs64(), &inst, &mut sink).expect("encode");
        words(&sink)
    }

    #[test]
    fn logical_immediate_patterns() {
        assert_eq!(logical_imm(0xFF), Some(0x1007));
        assert_eq!(logical_imm(0x5555_5555_5555_5555), Some(0x03C));
        assert_eq!(logical_imm(0xFFFF_FFFF_FFFF_FF00), Some(0x1E37));
        assert_eq!(logical_imm(0), None);
        assert_eq!(logical_imm(u64::MAX), None);
        assert_eq!(logical_imm(0x1234), None);
    }

    #[test]
    fn remainder_uses_msub() {
        let code = encoded(Inst::Alu {
            op: Opcode::Remr,
            dst: Gpr(0),
            a: Gpr(1),
            b: Gpr(2),
        });
        // sdiv x16, x1, x2; msub x0, x16, x2, x1
        assert_eq!(code, vec![0x9AC2_0C30, 0x9B02_8600]);
    }

    #[test]
    fn compare_set_uses_csinc() {
        let code = encoded(Inst::Alu {
            op: Opcode::Ltr,
            dst: Gpr(0),
            a: Gpr(1),
            b: Gpr(2),
        });
        // cmp x1, x2; cset x0, lt
        assert_eq!(code, vec![0xEB02_003F, 0x9A9F_A7E0]);
    }

    #[test]
    fn shifts_by_immediate() {
        let code = encoded(Inst::AluImm {
            op: Opcode::Lshi,
            dst: Gpr(0),
            a: Gpr(1),
            imm: 4,
        });
        // lsl x0, x1, #4
        assert_eq!(code, vec![0xD37C_EC20]);
        let code = encoded(Inst::AluImm {
            op: Opcode::RshiU,
            dst: Gpr(0),
            a: Gpr(1),
            imm: 4,
        });
        // lsr x0, x1, #4
        assert_eq!(code, vec![0xD344_FC20]);
    }

    #[test]
    fn near_bound_branches_use_one_instruction() {
        let mut labels = LabelTable::new();
        let label = labels.create();
        let mut sink = Sink::new(16);
        encode(
            &Aarch64::aapcs64(),
            &Inst::BranchImm {
                op: Opcode::Beqi,
                a: Gpr(3),
                imm: 0,
                dest: Dest {
                    label,
                    offset: Some(0),
                },
            },
            &mut sink,
        )
        .expect("encode");
        // cbz x3, -16
        assert_eq!(words(&sink), vec![0xB400_0000 | (0x7_FFFC << 5) | 3]);
    }

    #[test]
    fn unsigned_subtract_overflow_branches_on_borrow() {
        let branch = OverflowBranch {
            sub: true,
            unsigned: true,
            on_overflow: true,
        };
        assert_eq!(overflow_code(branch), LO);
        let no_overflow = OverflowBranch {
            on_overflow: false,
            ..branch
        };
        assert_eq!(overflow_code(no_overflow), HS);
    }

    #[test]
    fn odd_register_counts_use_single_pushes() {
        let frame = Frame {
            gprs: vec![Gpr(19)],
            fprs: vec![],
            locals: 0,
        };
        let code = encoded(Inst::Prolog(frame.clone()));
        // str x19, [sp, #-16]!
        assert_eq!(code[2], 0xF81F_0FF3);
        let code = encoded(Inst::Epilog(frame));
        // ldr x19, [sp], #16; ldp x29, x30, [sp], #16
        assert_eq!(code, vec![0xF841_07F3, 0xA8C1_7BFD]);
    }

    #[test]
    fn out_of_range_offsets_use_register_addressing() {
        let code = encoded(Inst::Load {
            op: Opcode::LdxiL,
            dst: Reg::Gpr(Gpr(0)),
            addr: Addr::Offset(Gpr(1), 1 << 20),
        });
        // movz x17, #0x10, lsl #16; ldr x0, [x1, x17]
        assert_eq!(code, vec![0xD2A0_0211, 0xF871_6820]);
    }
}
