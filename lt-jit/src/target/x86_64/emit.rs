use super::{R11, RAX, RCX, RDX, RSP, X86_64};
use crate::error::{JitError, JitResult};
use crate::label::RelocKind;
use crate::opcode::{Cond, FCond, Opcode, OverflowBranch};
use crate::operand::{Fpr, Gpr, Reg};
use crate::target::{Addr, Dest, Frame, Inst, Sink, Target};

const SCRATCH: Gpr = R11;

#[derive(Clone, Copy)]
enum Rm {
    Reg(u8),
    Mem {
        base: u8,
        index: Option<u8>,
        disp: i32,
    },
    Rip(i32),
    Abs32(i32),
}

fn mem(base: Gpr, disp: i32) -> Rm {
    Rm::Mem {
        base: base.0,
        index: None,
        disp,
    }
}

fn indexed(base: Gpr, index: Gpr) -> Rm {
    Rm::Mem {
        base: base.0,
        index: Some(index.0),
        disp: 0,
    }
}

fn gpr(reg: Gpr) -> Rm {
    Rm::Reg(reg.0)
}

fn xmm(reg: Fpr) -> Rm {
    Rm::Reg(reg.0)
}

/// `[prefix] [rex] opcode modrm [sib] [disp]`
fn rm_op(
    s: &mut Sink,
    prefix: Option<u8>,
    w: bool,
    force_rex: bool,
    opcode: &[u8],
    reg: u8,
    rm: Rm,
) {
    if let Some(prefix) = prefix {
        s.put_u8(prefix);
    }
    let r = (reg >> 3) & 1;
    let (x, b) = match rm {
        Rm::Reg(n) => (0, (n >> 3) & 1),
        Rm::Mem { base, index, .. } => (index.map_or(0, |index| (index >> 3) & 1), (base >> 3) & 1),
        Rm::Rip(_) | Rm::Abs32(_) => (0, 0),
    };
    let rex = 0x40 | (u8::from(w) << 3) | (r << 2) | (x << 1) | b;
    if rex != 0x40 || force_rex {
        s.put_u8(rex);
    }
    s.put(opcode);
    let reg3 = (reg & 7) << 3;
    match rm {
        Rm::Reg(n) => s.put_u8(0xC0 | reg3 | (n & 7)),
        Rm::Mem { base, index, disp } => {
            let (mode, disp_len) = if disp == 0 && base & 7 != 5 {
                (0x00, 0)
            } else if i8::try_from(disp).is_ok() {
                (0x40, 1)
            } else {
                (0x80, 4)
            };
            match index {
                Some(index) => {
                    s.put_u8(mode | reg3 | 0x04);
                    s.put_u8(((index & 7) << 3) | (base & 7));
                }
                None if base & 7 == 4 => {
                    s.put_u8(mode | reg3 | 0x04);
                    s.put_u8(0x24);
                }
                None => s.put_u8(mode | reg3 | (base & 7)),
            }
            match disp_len {
                1 => s.put_u8(disp as i8 as u8),
                4 => s.put_i32(disp),
                _ => {}
            }
        }
        Rm::Rip(disp) => {
            s.put_u8(reg3 | 0x05);
            s.put_i32(disp);
        }
        Rm::Abs32(addr) => {
            s.put_u8(reg3 | 0x04);
            s.put_u8(0x25);
            s.put_i32(addr);
        }
    }
}

#[derive(Clone, Copy)]
enum Alu {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

fn alu_rr(s: &mut Sink, alu: Alu, dst: Gpr, src: Gpr) {
    rm_op(s, None, true, false, &[((alu as u8) << 3) | 1], src.0, gpr(dst));
}

fn alu_ri(s: &mut Sink, alu: Alu, dst: Gpr, imm: i32) {
    if let Ok(imm) = i8::try_from(imm) {
        rm_op(s, None, true, false, &[0x83], alu as u8, gpr(dst));
        s.put_u8(imm as u8);
    } else {
        rm_op(s, None, true, false, &[0x81], alu as u8, gpr(dst));
        s.put_i32(imm);
    }
}

fn mov_rr(s: &mut Sink, dst: Gpr, src: Gpr) {
    if dst != src {
        rm_op(s, None, true, false, &[0x89], src.0, gpr(dst));
    }
}

/// 32-bit move; clears the upper half of `dst`.
fn mov_rr32(s: &mut Sink, dst: Gpr, src: Gpr) {
    rm_op(s, None, false, false, &[0x89], src.0, gpr(dst));
}

fn movabs(s: &mut Sink, dst: Gpr, imm: u64) {
    s.put_u8(0x48 | u8::from(dst.ext()));
    s.put_u8(0xB8 + dst.low3());
    s.put_u64(imm);
}

/// Flag-preserving immediate load.
fn mov_imm(s: &mut Sink, dst: Gpr, imm: i64) {
    if let Ok(value) = u32::try_from(imm) {
        if dst.ext() {
            s.put_u8(0x41);
        }
        s.put_u8(0xB8 + dst.low3());
        s.put_u32(value);
    } else if let Ok(value) = i32::try_from(imm) {
        rm_op(s, None, true, false, &[0xC7], 0, gpr(dst));
        s.put_i32(value);
    } else {
        movabs(s, dst, imm as u64);
    }
}

fn lea(s: &mut Sink, dst: Gpr, rm: Rm) {
    rm_op(s, None, true, false, &[0x8D], dst.0, rm);
}

fn imul_rr(s: &mut Sink, dst: Gpr, src: Gpr) {
    rm_op(s, None, true, false, &[0x0F, 0xAF], dst.0, gpr(src));
}

fn push(s: &mut Sink, reg: Gpr) {
    if reg.ext() {
        s.put_u8(0x41);
    }
    s.put_u8(0x50 + reg.low3());
}

fn pop(s: &mut Sink, reg: Gpr) {
    if reg.ext() {
        s.put_u8(0x41);
    }
    s.put_u8(0x58 + reg.low3());
}

fn is_byte_high(reg: Gpr) -> bool {
    (4..8).contains(&reg.0)
}

fn cond_code(cond: Cond) -> u8 {
    match cond {
        Cond::Lt => 0xC,
        Cond::Le => 0xE,
        Cond::Eq => 0x4,
        Cond::Ge => 0xD,
        Cond::Gt => 0xF,
        Cond::Ne => 0x5,
        Cond::LtU => 0x2,
        Cond::LeU => 0x6,
        Cond::GeU => 0x3,
        Cond::GtU => 0x7,
    }
}

fn overflow_code(branch: OverflowBranch) -> u8 {
    match (branch.unsigned, branch.on_overflow) {
        (false, true) => 0x0,
        (false, false) => 0x1,
        (true, true) => 0x2,
        (true, false) => 0x3,
    }
}

fn displacement(site: usize, end: usize, target: usize) -> JitResult<i32> {
    i32::try_from(target as i64 - end as i64)
        .map_err(|_| JitError::DisplacementOverflow { site, target })
}

fn jcc(s: &mut Sink, cc: u8, dest: Dest) -> JitResult<()> {
    let here = s.offset();
    match dest.offset {
        Some(target) => {
            if let Ok(rel) = i8::try_from(target as i64 - (here as i64 + 2)) {
                s.put(&[0x70 | cc, rel as u8]);
            } else {
                let rel = displacement(here, here + 6, target)?;
                s.put(&[0x0F, 0x80 | cc]);
                s.put_i32(rel);
            }
        }
        None => {
            s.put(&[0x0F, 0x80 | cc]);
            s.reloc(dest.label, RelocKind::Rel32);
            s.put_i32(0);
        }
    }
    Ok(())
}

fn jmp(s: &mut Sink, dest: Dest) -> JitResult<()> {
    let here = s.offset();
    match dest.offset {
        Some(target) => {
            if let Ok(rel) = i8::try_from(target as i64 - (here as i64 + 2)) {
                s.put(&[0xEB, rel as u8]);
            } else {
                let rel = displacement(here, here + 5, target)?;
                s.put_u8(0xE9);
                s.put_i32(rel);
            }
        }
        None => {
            s.put_u8(0xE9);
            s.reloc(dest.label, RelocKind::Rel32);
            s.put_i32(0);
        }
    }
    Ok(())
}

fn not_applicable(op: Opcode, shape: &str) -> JitError {
    JitError::InvalidOperand(format!("{op} is not a {shape} operation"))
}

pub(super) fn encode(target: &X86_64, inst: &Inst, s: &mut Sink) -> JitResult<()> {
    match inst {
        Inst::Alu { op, dst, a, b } => alu(s, *op, *dst, *a, *b),
        Inst::AluImm { op, dst, a, imm } => alu_imm(s, *op, *dst, *a, *imm),
        Inst::Unary { op, dst, src } => unary(target, s, *op, *dst, *src),
        Inst::LoadImm { dst, imm } => {
            mov_imm(s, *dst, *imm);
            Ok(())
        }
        Inst::MovAddr { dst, dest } => mov_addr(s, *dst, *dest),
        Inst::Load { op, dst, addr } => load(s, *op, *dst, *addr),
        Inst::Store { op, src, addr } => store(s, *op, *src, *addr),
        Inst::FAlu { op, dst, a, b } => falu(s, target.conv().scratch_fpr, *op, *dst, *a, *b),
        Inst::FUnary { op, dst, src } => funary(s, *op, *dst, *src),
        Inst::FLoadImm { op, dst, bits } => {
            fload_imm(s, *op, *dst, *bits);
            Ok(())
        }
        Inst::IntToFloat { op, dst, src } => {
            let prefix = if op.is_double() { 0xF2 } else { 0xF3 };
            // cvtsi2sd / cvtsi2ss
            rm_op(s, Some(prefix), true, false, &[0x0F, 0x2A], dst.0, gpr(*src));
            Ok(())
        }
        Inst::FloatToInt { op, dst, src } => {
            let prefix = if op.is_double() { 0xF2 } else { 0xF3 };
            // cvttsd2si / cvttss2si
            rm_op(s, Some(prefix), true, false, &[0x0F, 0x2C], dst.0, xmm(*src));
            Ok(())
        }
        Inst::Branch { op, a, b, dest } => branch(s, *op, *a, *b, *dest),
        Inst::BranchImm { op, a, imm, dest } => branch_imm(s, *op, *a, *imm, *dest),
        Inst::FBranch { op, a, b, dest } => fbranch(s, *op, *a, *b, *dest),
        Inst::Jump { dest } => jmp(s, *dest),
        Inst::Indirect { op, reg } => {
            let ext = if *op == Opcode::Callr { 2 } else { 4 };
            rm_op(s, None, false, false, &[0xFF], ext, gpr(*reg));
            Ok(())
        }
        Inst::IndirectAbs { op, addr } => {
            let ext = if *op == Opcode::Calli { 2 } else { 4 };
            movabs(s, SCRATCH, *addr);
            rm_op(s, None, false, false, &[0xFF], ext, gpr(SCRATCH));
            Ok(())
        }
        Inst::Ret => {
            s.put_u8(0xC3);
            Ok(())
        }
        Inst::Prolog(frame) => prolog(s, frame),
        Inst::Epilog(frame) => epilog(s, frame),
        Inst::AdjustSp(delta) => adjust_sp(s, i64::from(*delta)),
    }
}

fn commutative(s: &mut Sink, alu: Alu, dst: Gpr, a: Gpr, b: Gpr) {
    if dst == a {
        alu_rr(s, alu, dst, b);
    } else if dst == b {
        alu_rr(s, alu, dst, a);
    } else {
        mov_rr(s, dst, a);
        alu_rr(s, alu, dst, b);
    }
}

/// `dst = a op b` for operations whose flags must come from `op` itself.
fn ordered(s: &mut Sink, alu: Alu, dst: Gpr, a: Gpr, b: Gpr) {
    if dst == a {
        alu_rr(s, alu, dst, b);
    } else if dst == b {
        mov_rr(s, SCRATCH, b);
        mov_rr(s, dst, a);
        alu_rr(s, alu, dst, SCRATCH);
    } else {
        mov_rr(s, dst, a);
        alu_rr(s, alu, dst, b);
    }
}

fn alu(s: &mut Sink, op: Opcode, dst: Gpr, a: Gpr, b: Gpr) -> JitResult<()> {
    use Opcode::*;
    match op {
        Addr => {
            if dst == a {
                alu_rr(s, Alu::Add, dst, b);
            } else if dst == b {
                alu_rr(s, Alu::Add, dst, a);
            } else {
                lea(s, dst, indexed(a, b));
            }
        }
        Addcr => commutative(s, Alu::Add, dst, a, b),
        Addxr => commutative(s, Alu::Adc, dst, a, b),
        Subr => {
            if dst == a {
                alu_rr(s, Alu::Sub, dst, b);
            } else if dst == b {
                rm_op(s, None, true, false, &[0xF7], 3, gpr(dst));
                alu_rr(s, Alu::Add, dst, a);
            } else {
                mov_rr(s, dst, a);
                alu_rr(s, Alu::Sub, dst, b);
            }
        }
        Subcr => ordered(s, Alu::Sub, dst, a, b),
        Subxr => ordered(s, Alu::Sbb, dst, a, b),
        Mulr => {
            if dst == a {
                imul_rr(s, dst, b);
            } else if dst == b {
                imul_rr(s, dst, a);
            } else {
                mov_rr(s, dst, a);
                imul_rr(s, dst, b);
            }
        }
        Divr | DivrU | Remr | RemrU => {
            mov_rr(s, SCRATCH, b);
            divide(s, op, dst, a);
        }
        Andr => commutative(s, Alu::And, dst, a, b),
        Orr => commutative(s, Alu::Or, dst, a, b),
        Xorr => commutative(s, Alu::Xor, dst, a, b),
        Lshr => shift_reg(s, 4, dst, a, b),
        Rshr => shift_reg(s, 7, dst, a, b),
        RshrU => shift_reg(s, 5, dst, a, b),
        _ => {
            let cond = op
                .compare_cond()
                .ok_or_else(|| not_applicable(op, "three-register"))?;
            alu_rr(s, Alu::Cmp, a, b);
            set_cc(s, cond, dst);
        }
    }
    Ok(())
}

/// Divides `a` by the value already in the scratch register. `rax` and
/// `rdx` are preserved unless one of them is `dst`.
fn divide(s: &mut Sink, op: Opcode, dst: Gpr, a: Gpr) {
    let signed = matches!(op, Opcode::Divr | Opcode::Divi | Opcode::Remr | Opcode::Remi);
    let rem = matches!(
        op,
        Opcode::Remr | Opcode::Remi | Opcode::RemrU | Opcode::RemiU
    );
    if dst != RAX {
        push(s, RAX);
    }
    if dst != RDX {
        push(s, RDX);
    }
    mov_rr(s, RAX, a);
    if signed {
        s.put(&[0x48, 0x99]); // cqo
    } else {
        s.put(&[0x31, 0xD2]); // xor edx, edx
    }
    rm_op(s, None, true, false, &[0xF7], if signed { 7 } else { 6 }, gpr(SCRATCH));
    mov_rr(s, dst, if rem { RDX } else { RAX });
    if dst != RDX {
        pop(s, RDX);
    }
    if dst != RAX {
        pop(s, RAX);
    }
}

fn shift_reg(s: &mut Sink, ext: u8, dst: Gpr, a: Gpr, b: Gpr) {
    mov_rr(s, SCRATCH, a);
    if b != RCX {
        push(s, RCX);
        mov_rr(s, RCX, b);
    }
    rm_op(s, None, true, false, &[0xD3], ext, gpr(SCRATCH));
    if b != RCX {
        pop(s, RCX);
    }
    mov_rr(s, dst, SCRATCH);
}

fn set_cc(s: &mut Sink, cond: Cond, dst: Gpr) {
    // setcc r11b
    s.put(&[0x41, 0x0F, 0x90 | cond_code(cond), 0xC0 | SCRATCH.low3()]);
    // movzx dst32, r11b
    rm_op(s, None, false, false, &[0x0F, 0xB6], dst.0, gpr(SCRATCH));
}

fn add_imm(s: &mut Sink, dst: Gpr, a: Gpr, imm: i64) {
    if imm == 0 {
        mov_rr(s, dst, a);
    } else if let Ok(value) = i32::try_from(imm) {
        if dst == a {
            alu_ri(s, Alu::Add, dst, value);
        } else {
            lea(s, dst, mem(a, value));
        }
    } else {
        movabs(s, SCRATCH, imm as u64);
        if dst == a {
            alu_rr(s, Alu::Add, dst, SCRATCH);
        } else {
            lea(s, dst, indexed(a, SCRATCH));
        }
    }
}

fn imm_op(s: &mut Sink, alu: Alu, dst: Gpr, a: Gpr, imm: i64) {
    if let Ok(value) = i32::try_from(imm) {
        mov_rr(s, dst, a);
        alu_ri(s, alu, dst, value);
    } else {
        movabs(s, SCRATCH, imm as u64);
        mov_rr(s, dst, a);
        alu_rr(s, alu, dst, SCRATCH);
    }
}

fn cmp_imm(s: &mut Sink, a: Gpr, imm: i64) {
    if let Ok(value) = i32::try_from(imm) {
        alu_ri(s, Alu::Cmp, a, value);
    } else {
        movabs(s, SCRATCH, imm as u64);
        alu_rr(s, Alu::Cmp, a, SCRATCH);
    }
}

fn shift_count(op: Opcode, imm: i64) -> JitResult<u8> {
    u8::try_from(imm)
        .ok()
        .filter(|count| *count < 64)
        .ok_or_else(|| JitError::InvalidOperand(format!("{op} shift count {imm} is not in 0..=63")))
}

fn alu_imm(s: &mut Sink, op: Opcode, dst: Gpr, a: Gpr, imm: i64) -> JitResult<()> {
    use Opcode::*;
    match op {
        Addi => add_imm(s, dst, a, imm),
        Subi => {
            if imm == i64::MIN {
                movabs(s, SCRATCH, imm as u64);
                mov_rr(s, dst, a);
                alu_rr(s, Alu::Sub, dst, SCRATCH);
            } else {
                add_imm(s, dst, a, -imm);
            }
        }
        Addci => imm_op(s, Alu::Add, dst, a, imm),
        Addxi => imm_op(s, Alu::Adc, dst, a, imm),
        Subci => imm_op(s, Alu::Sub, dst, a, imm),
        Subxi => imm_op(s, Alu::Sbb, dst, a, imm),
        Rsbi => {
            if let Ok(value) = i32::try_from(imm) {
                if dst == a {
                    rm_op(s, None, true, false, &[0xF7], 3, gpr(dst));
                    alu_ri(s, Alu::Add, dst, value);
                } else {
                    mov_imm(s, dst, imm);
                    alu_rr(s, Alu::Sub, dst, a);
                }
            } else {
                movabs(s, SCRATCH, imm as u64);
                alu_rr(s, Alu::Sub, SCRATCH, a);
                mov_rr(s, dst, SCRATCH);
            }
        }
        Muli => {
            if let Ok(value) = i8::try_from(imm) {
                rm_op(s, None, true, false, &[0x6B], dst.0, gpr(a));
                s.put_u8(value as u8);
            } else if let Ok(value) = i32::try_from(imm) {
                rm_op(s, None, true, false, &[0x69], dst.0, gpr(a));
                s.put_i32(value);
            } else {
                movabs(s, SCRATCH, imm as u64);
                mov_rr(s, dst, a);
                imul_rr(s, dst, SCRATCH);
            }
        }
        Divi | DiviU | Remi | RemiU => {
            mov_imm(s, SCRATCH, imm);
            divide(s, op, dst, a);
        }
        Andi => imm_op(s, Alu::And, dst, a, imm),
        Ori => imm_op(s, Alu::Or, dst, a, imm),
        Xori => imm_op(s, Alu::Xor, dst, a, imm),
        Lshi | Rshi | RshiU => {
            let count = shift_count(op, imm)?;
            let ext = match op {
                Lshi => 4,
                Rshi => 7,
                _ => 5,
            };
            mov_rr(s, dst, a);
            if count != 0 {
                rm_op(s, None, true, false, &[0xC1], ext, gpr(dst));
                s.put_u8(count);
            }
        }
        _ => {
            let cond = op
                .compare_cond()
                .ok_or_else(|| not_applicable(op, "register-immediate"))?;
            cmp_imm(s, a, imm);
            set_cc(s, cond, dst);
        }
    }
    Ok(())
}

fn bswap(s: &mut Sink, w: bool, reg: Gpr) {
    let rex = 0x40 | (u8::from(w) << 3) | u8::from(reg.ext());
    if rex != 0x40 {
        s.put_u8(rex);
    }
    s.put(&[0x0F, 0xC8 + reg.low3()]);
}

fn unary(target: &X86_64, s: &mut Sink, op: Opcode, dst: Gpr, src: Gpr) -> JitResult<()> {
    use Opcode::*;
    match op {
        Negr | Comr => {
            mov_rr(s, dst, src);
            rm_op(s, None, true, false, &[0xF7], if op == Negr { 3 } else { 2 }, gpr(dst));
        }
        Popcntr => {
            if !target.has_popcnt() {
                return Err(JitError::UnsupportedOnTarget {
                    opcode: op,
                    target: target.name(),
                });
            }
            rm_op(s, Some(0xF3), true, false, &[0x0F, 0xB8], dst.0, gpr(src));
        }
        Movr => mov_rr(s, dst, src),
        ExtrC => rm_op(s, None, true, false, &[0x0F, 0xBE], dst.0, gpr(src)),
        ExtrUc => rm_op(s, None, false, is_byte_high(src), &[0x0F, 0xB6], dst.0, gpr(src)),
        ExtrS => rm_op(s, None, true, false, &[0x0F, 0xBF], dst.0, gpr(src)),
        ExtrUs => rm_op(s, None, false, false, &[0x0F, 0xB7], dst.0, gpr(src)),
        ExtrI => rm_op(s, None, true, false, &[0x63], dst.0, gpr(src)),
        ExtrUi => mov_rr32(s, dst, src),
        BswaprUl => {
            mov_rr(s, dst, src);
            bswap(s, true, dst);
        }
        BswaprUi => {
            if dst != src {
                mov_rr32(s, dst, src);
            }
            bswap(s, false, dst);
        }
        BswaprUs => {
            rm_op(s, None, false, false, &[0x0F, 0xB7], dst.0, gpr(src));
            // rol dst16, 8
            rm_op(s, Some(0x66), false, false, &[0xC1], 0, gpr(dst));
            s.put_u8(8);
        }
        _ => return Err(not_applicable(op, "two-register")),
    }
    Ok(())
}

fn mov_addr(s: &mut Sink, dst: Gpr, dest: Dest) -> JitResult<()> {
    match dest.offset {
        Some(target) => {
            let here = s.offset();
            let disp = displacement(here, here + 7, target)?;
            lea(s, dst, Rm::Rip(disp));
        }
        None => {
            s.put_u8(0x48 | u8::from(dst.ext()));
            s.put_u8(0xB8 + dst.low3());
            s.reloc(dest.label, RelocKind::Abs64);
            s.put_u64(0);
        }
    }
    Ok(())
}

/// Resolves `addr` to a ModRM operand, materializing out-of-range parts in
/// the scratch register first.
fn mem_operand(s: &mut Sink, addr: Addr) -> JitResult<Rm> {
    Ok(match addr {
        Addr::Base(base) => mem(base, 0),
        Addr::Abs(address) => match i32::try_from(address as i64) {
            Ok(value) => Rm::Abs32(value),
            Err(_) => {
                movabs(s, SCRATCH, address);
                mem(SCRATCH, 0)
            }
        },
        Addr::Index(base, index) => {
            if index == RSP && base == RSP {
                return Err(JitError::InvalidOperand(
                    "stack pointer cannot be used as an index".to_string(),
                ));
            }
            if index == RSP {
                indexed(index, base)
            } else {
                indexed(base, index)
            }
        }
        Addr::Offset(base, offset) => match i32::try_from(offset) {
            Ok(value) => mem(base, value),
            Err(_) => {
                movabs(s, SCRATCH, offset as u64);
                indexed(base, SCRATCH)
            }
        },
    })
}

fn load(s: &mut Sink, op: Opcode, dst: Reg, addr: Addr) -> JitResult<()> {
    let access = op.mem_access().ok_or_else(|| not_applicable(op, "load"))?;
    match (access.float, dst) {
        (false, Reg::Gpr(dst)) => {
            let rm = mem_operand(s, addr)?;
            let (w, opcode): (bool, &[u8]) = match (access.bytes, access.signed) {
                (1, true) => (true, &[0x0F, 0xBE]),
                (1, false) => (false, &[0x0F, 0xB6]),
                (2, true) => (true, &[0x0F, 0xBF]),
                (2, false) => (false, &[0x0F, 0xB7]),
                (4, true) => (true, &[0x63]),
                (4, false) => (false, &[0x8B]),
                _ => (true, &[0x8B]),
            };
            rm_op(s, None, w, false, opcode, dst.0, rm);
        }
        (true, Reg::Fpr(dst)) => {
            let rm = mem_operand(s, addr)?;
            let prefix = if access.bytes == 4 { 0xF3 } else { 0xF2 };
            rm_op(s, Some(prefix), false, false, &[0x0F, 0x10], dst.0, rm);
        }
        _ => {
            return Err(JitError::InvalidOperand(format!(
                "{op} cannot load into {dst:?}"
            )));
        }
    }
    Ok(())
}

fn store(s: &mut Sink, op: Opcode, src: Reg, addr: Addr) -> JitResult<()> {
    let access = op.mem_access().ok_or_else(|| not_applicable(op, "store"))?;
    match (access.float, src) {
        (false, Reg::Gpr(src)) => {
            let rm = mem_operand(s, addr)?;
            match access.bytes {
                1 => rm_op(s, None, false, is_byte_high(src), &[0x88], src.0, rm),
                2 => rm_op(s, Some(0x66), false, false, &[0x89], src.0, rm),
                4 => rm_op(s, None, false, false, &[0x89], src.0, rm),
                _ => rm_op(s, None, true, false, &[0x89], src.0, rm),
            }
        }
        (true, Reg::Fpr(src)) => {
            let rm = mem_operand(s, addr)?;
            let prefix = if access.bytes == 4 { 0xF3 } else { 0xF2 };
            rm_op(s, Some(prefix), false, false, &[0x0F, 0x11], src.0, rm);
        }
        _ => {
            return Err(JitError::InvalidOperand(format!(
                "{op} cannot store from {src:?}"
            )));
        }
    }
    Ok(())
}

fn sse(s: &mut Sink, prefix: u8, opcode: u8, dst: Fpr, src: Fpr) {
    rm_op(s, Some(prefix), false, false, &[0x0F, opcode], dst.0, xmm(src));
}

fn movaps(s: &mut Sink, dst: Fpr, src: Fpr) {
    if dst != src {
        rm_op(s, None, false, false, &[0x0F, 0x28], dst.0, xmm(src));
    }
}

fn falu(s: &mut Sink, scratch: Fpr, op: Opcode, dst: Fpr, a: Fpr, b: Fpr) -> JitResult<()> {
    use Opcode::*;
    let prefix = if op.is_double() { 0xF2 } else { 0xF3 };
    let (opcode, commutes) = match op {
        AddrF | AddrD => (0x58, true),
        MulrF | MulrD => (0x59, true),
        SubrF | SubrD => (0x5C, false),
        DivrF | DivrD => (0x5E, false),
        _ => return Err(not_applicable(op, "float three-register")),
    };
    if dst == a {
        sse(s, prefix, opcode, dst, b);
    } else if dst == b && commutes {
        sse(s, prefix, opcode, dst, a);
    } else if dst == b {
        movaps(s, scratch, b);
        movaps(s, dst, a);
        sse(s, prefix, opcode, dst, scratch);
    } else {
        movaps(s, dst, a);
        sse(s, prefix, opcode, dst, b);
    }
    Ok(())
}

fn funary(s: &mut Sink, op: Opcode, dst: Fpr, src: Fpr) -> JitResult<()> {
    use Opcode::*;
    let double = op.is_double();
    let prefix = if double { 0xF2 } else { 0xF3 };
    match op {
        NegrF | NegrD | AbsrF | AbsrD => {
            // movq r11, src; btc/btr r11, sign; movq dst, r11
            rm_op(s, Some(0x66), double, false, &[0x0F, 0x7E], src.0, gpr(SCRATCH));
            let ext = if matches!(op, NegrF | NegrD) { 7 } else { 6 };
            rm_op(s, None, double, false, &[0x0F, 0xBA], ext, gpr(SCRATCH));
            s.put_u8(if double { 63 } else { 31 });
            rm_op(s, Some(0x66), double, false, &[0x0F, 0x6E], dst.0, gpr(SCRATCH));
        }
        SqrtrF | SqrtrD => sse(s, prefix, 0x51, dst, src),
        MovrF | MovrD => movaps(s, dst, src),
        // cvtss2sd / cvtsd2ss
        ExtrFD => sse(s, 0xF3, 0x5A, dst, src),
        ExtrDF => sse(s, 0xF2, 0x5A, dst, src),
        _ => return Err(not_applicable(op, "float two-register")),
    }
    Ok(())
}

fn fload_imm(s: &mut Sink, op: Opcode, dst: Fpr, bits: u64) {
    let double = op.is_double();
    let bits = if double { bits } else { bits & 0xFFFF_FFFF };
    if bits == 0 {
        // xorps dst, dst
        rm_op(s, None, false, false, &[0x0F, 0x57], dst.0, xmm(dst));
        return;
    }
    if double {
        movabs(s, SCRATCH, bits);
    } else {
        mov_imm(s, SCRATCH, bits as i64);
    }
    rm_op(s, Some(0x66), double, false, &[0x0F, 0x6E], dst.0, gpr(SCRATCH));
}

fn branch(s: &mut Sink, op: Opcode, a: Gpr, b: Gpr, dest: Dest) -> JitResult<()> {
    if let Some(cond) = op.compare_cond() {
        alu_rr(s, Alu::Cmp, a, b);
        jcc(s, cond_code(cond), dest)
    } else if let Some(any_set) = op.mask_test() {
        // test a, b
        rm_op(s, None, true, false, &[0x85], b.0, gpr(a));
        jcc(s, if any_set { 0x5 } else { 0x4 }, dest)
    } else if let Some(overflow) = op.overflow_branch() {
        let alu = if overflow.sub { Alu::Sub } else { Alu::Add };
        alu_rr(s, alu, a, b);
        jcc(s, overflow_code(overflow), dest)
    } else {
        Err(not_applicable(op, "register branch"))
    }
}

fn branch_imm(s: &mut Sink, op: Opcode, a: Gpr, imm: i64, dest: Dest) -> JitResult<()> {
    if let Some(cond) = op.compare_cond() {
        cmp_imm(s, a, imm);
        jcc(s, cond_code(cond), dest)
    } else if let Some(any_set) = op.mask_test() {
        if let Ok(value) = i32::try_from(imm) {
            rm_op(s, None, true, false, &[0xF7], 0, gpr(a));
            s.put_i32(value);
        } else {
            movabs(s, SCRATCH, imm as u64);
            rm_op(s, None, true, false, &[0x85], SCRATCH.0, gpr(a));
        }
        jcc(s, if any_set { 0x5 } else { 0x4 }, dest)
    } else if let Some(overflow) = op.overflow_branch() {
        let alu = if overflow.sub { Alu::Sub } else { Alu::Add };
        if let Ok(value) = i32::try_from(imm) {
            alu_ri(s, alu, a, value);
        } else {
            movabs(s, SCRATCH, imm as u64);
            alu_rr(s, alu, a, SCRATCH);
        }
        jcc(s, overflow_code(overflow), dest)
    } else {
        Err(not_applicable(op, "immediate branch"))
    }
}

fn fbranch(s: &mut Sink, op: Opcode, a: Fpr, b: Fpr, dest: Dest) -> JitResult<()> {
    let (cond, double) = op
        .float_cond()
        .ok_or_else(|| not_applicable(op, "float branch"))?;
    let ucomis = |s: &mut Sink, x: Fpr, y: Fpr| {
        let prefix = if double { Some(0x66) } else { None };
        rm_op(s, prefix, false, false, &[0x0F, 0x2E], x.0, xmm(y));
    };
    match cond {
        FCond::Gt => {
            ucomis(s, a, b);
            jcc(s, 0x7, dest)
        }
        FCond::Ge => {
            ucomis(s, a, b);
            jcc(s, 0x3, dest)
        }
        FCond::Lt => {
            ucomis(s, b, a);
            jcc(s, 0x7, dest)
        }
        FCond::Le => {
            ucomis(s, b, a);
            jcc(s, 0x3, dest)
        }
        FCond::Eq => {
            ucomis(s, a, b);
            // jp over the je
            let mut je = Sink::new(s.offset() + 2);
            jcc(&mut je, 0x4, dest)?;
            s.put(&[0x7A, je.len() as u8]);
            s.append(je);
            Ok(())
        }
        FCond::Ne => {
            ucomis(s, a, b);
            jcc(s, 0xA, dest)?;
            jcc(s, 0x5, dest)
        }
        FCond::Unord => {
            ucomis(s, a, b);
            jcc(s, 0xA, dest)
        }
        FCond::Ord => {
            ucomis(s, a, b);
            jcc(s, 0xB, dest)
        }
    }
}

/// Stack layout below the saved registers: locals at `rsp`, then the
/// float save area, then alignment padding.
pub(super) struct FrameLayout {
    pub(super) adjust: u32,
    pub(super) fpr_base: u32,
}

impl FrameLayout {
    pub(super) fn of(frame: &Frame) -> Self {
        let pad = if frame.gprs.len() % 2 == 1 { 8 } else { 0 };
        Self {
            adjust: frame.locals + 16 * frame.fprs.len() as u32 + pad,
            fpr_base: frame.locals,
        }
    }
}

fn adjust_sp(s: &mut Sink, delta: i64) -> JitResult<()> {
    if delta == 0 {
        return Ok(());
    }
    let alu = if delta < 0 { Alu::Sub } else { Alu::Add };
    let amount = i32::try_from(delta.unsigned_abs())
        .map_err(|_| JitError::InvalidOperand(format!("stack adjustment {delta} is too large")))?;
    alu_ri(s, alu, RSP, amount);
    Ok(())
}

fn fpr_slot(layout: &FrameLayout, index: usize) -> JitResult<i32> {
    i32::try_from(layout.fpr_base as usize + 16 * index)
        .map_err(|_| JitError::InvalidOperand("frame is too large".to_string()))
}

fn prolog(s: &mut Sink, frame: &Frame) -> JitResult<()> {
    s.put_u8(0x55); // push rbp
    s.put(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
    for reg in &frame.gprs {
        push(s, *reg);
    }
    let layout = FrameLayout::of(frame);
    adjust_sp(s, -i64::from(layout.adjust))?;
    for (index, reg) in frame.fprs.iter().enumerate() {
        // movups [rsp + slot], xmm
        let slot = fpr_slot(&layout, index)?;
        rm_op(s, None, false, false, &[0x0F, 0x11], reg.0, mem(RSP, slot));
    }
    Ok(())
}

fn epilog(s: &mut Sink, frame: &Frame) -> JitResult<()> {
    let layout = FrameLayout::of(frame);
    for (index, reg) in frame.fprs.iter().enumerate() {
        let slot = fpr_slot(&layout, index)?;
        rm_op(s, None, false, false, &[0x0F, 0x10], reg.0, mem(RSP, slot));
    }
    adjust_sp(s, i64::from(layout.adjust))?;
    for reg in frame.gprs.iter().rev() {
        pop(s, *reg);
    }
    s.put_u8(0x5D); // pop rbp
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::LabelTable;
    use crate::target::x86_64::{R13, RBX, RSI};

    fn encoded(inst: Inst) -> Vec<u8> {
        let mut sink = Sink::new(0);
        encode(&X86_64::sysv(), &inst, &mut sink).expect("encode");
        sink.bytes().to_vec()
    }

    fn pending() -> Dest {
        let mut labels = LabelTable::new();
        Dest {
            label: labels.create(),
            offset: None,
        }
    }

    #[test]
    fn division_preserves_rax_and_rdx() {
        let code = encoded(Inst::Alu {
            op: Opcode::Divr,
            dst: RSI,
            a: RCX,
            b: RBX,
        });
        assert_eq!(
            code,
            vec![
                0x49, 0x89, 0xDB, // mov r11, rbx
                0x50, 0x52, // push rax; push rdx
                0x48, 0x89, 0xC8, // mov rax, rcx
                0x48, 0x99, // cqo
                0x49, 0xF7, 0xFB, // idiv r11
                0x48, 0x89, 0xC6, // mov rsi, rax
                0x5A, 0x58, // pop rdx; pop rax
            ]
        );
    }

    #[test]
    fn remainder_into_rax_skips_its_own_save() {
        let code = encoded(Inst::Alu {
            op: Opcode::RemrU,
            dst: RAX,
            a: RAX,
            b: RCX,
        });
        assert_eq!(code[..3], [0x49, 0x89, 0xCB]);
        assert_eq!(code[3], 0x52);
        assert_eq!(code[code.len() - 1], 0x5A);
        assert!(!code.contains(&0x50));
    }

    #[test]
    fn compare_sets_through_r11b() {
        let code = encoded(Inst::Alu {
            op: Opcode::Ltr,
            dst: RAX,
            a: RCX,
            b: RDX,
        });
        assert_eq!(
            code,
            vec![0x48, 0x39, 0xD1, 0x41, 0x0F, 0x9C, 0xC3, 0x41, 0x0F, 0xB6, 0xC3]
        );
    }

    #[test]
    fn byte_swaps() {
        assert_eq!(
            encoded(Inst::Unary {
                op: Opcode::BswaprUl,
                dst: RAX,
                src: RAX,
            }),
            vec![0x48, 0x0F, 0xC8]
        );
        assert_eq!(
            encoded(Inst::Unary {
                op: Opcode::BswaprUs,
                dst: RAX,
                src: RCX,
            }),
            vec![0x0F, 0xB7, 0xC1, 0x66, 0xC1, 0xC0, 0x08]
        );
    }

    #[test]
    fn far_offsets_go_through_the_scratch_register() {
        let code = encoded(Inst::Load {
            op: Opcode::LdxiL,
            dst: Reg::Gpr(RAX),
            addr: Addr::Offset(R13, 1 << 40),
        });
        assert_eq!(&code[..2], &[0x49, 0xBB]);
        // mov rax, [r13 + r11]
        assert_eq!(&code[10..], &[0x4B, 0x8B, 0x44, 0x1D, 0x00]);
    }

    #[test]
    fn float_equality_skips_unordered_results() {
        let mut sink = Sink::new(0);
        encode(
            &X86_64::sysv(),
            &Inst::FBranch {
                op: Opcode::BeqrD,
                a: Fpr(0),
                b: Fpr(1),
                dest: pending(),
            },
            &mut sink,
        )
        .expect("encode");
        assert_eq!(
            sink.bytes(),
            &[0x66, 0x0F, 0x2E, 0xC1, 0x7A, 0x06, 0x0F, 0x84, 0, 0, 0, 0]
        );
        assert_eq!(sink.relocs()[0].site, 8);
    }

    #[test]
    fn float_inequality_branches_twice() {
        let mut sink = Sink::new(0);
        encode(
            &X86_64::sysv(),
            &Inst::FBranch {
                op: Opcode::BnerF,
                a: Fpr(2),
                b: Fpr(3),
                dest: pending(),
            },
            &mut sink,
        )
        .expect("encode");
        assert_eq!(sink.relocs().len(), 2);
    }

    #[test]
    fn pending_mov_addr_is_absolute() {
        let mut sink = Sink::new(0);
        encode(
            &X86_64::sysv(),
            &Inst::MovAddr {
                dst: R13,
                dest: pending(),
            },
            &mut sink,
        )
        .expect("encode");
        assert_eq!(&sink.bytes()[..2], &[0x49, 0xBD]);
        assert_eq!(sink.relocs()[0].kind, RelocKind::Abs64);
        assert_eq!(sink.relocs()[0].site, 2);
    }

    #[test]
    fn shift_counts_are_range_checked() {
        let mut sink = Sink::new(0);
        let result = encode(
            &X86_64::sysv(),
            &Inst::AluImm {
                op: Opcode::Lshi,
                dst: RAX,
                a: RAX,
                imm: 64,
            },
            &mut sink,
        );
        assert!(matches!(result, Err(JitError::InvalidOperand(_))));
    }
}
