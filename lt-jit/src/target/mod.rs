//! Per-architecture encoders behind one `Target` trait.

pub mod aarch64;
pub mod x86_64;

use crate::abi::CallConv;
use crate::error::JitResult;
use crate::label::{Label, Reloc, RelocKind};
use crate::opcode::Opcode;
use crate::operand::{Fpr, Gpr, Reg};

/// An instruction set plus calling convention, selected once per session.
pub trait Target: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn name(&self) -> &'static str;

    fn conv(&self) -> &CallConv;

    /// Worst-case encoded length of `op`, or `None` when the target has no
    /// encoding for it.
    fn max_bytes(&self, op: Opcode) -> Option<usize>;

    fn max_instr_bytes(&self) -> usize {
        Opcode::ALL
            .iter()
            .filter_map(|op| self.max_bytes(*op))
            .max()
            .unwrap_or(0)
    }

    /// Appends the encoding of `inst` to `sink`. Never writes more than
    /// `max_bytes(inst.opcode())`.
    fn encode(&self, inst: &Inst, sink: &mut Sink) -> JitResult<()>;

    /// Rewrites the relocation field at `site` so it refers to `target`: a
    /// code offset for pc-relative kinds, an address for absolute ones.
    fn patch(&self, kind: RelocKind, site: usize, target: u64, field: &mut [u8])
    -> JitResult<()>;

    /// Bytes a prologue for `frame` moves the stack pointer by.
    fn frame_bytes(&self, frame: &Frame) -> u32;
}

/// Memory operand of a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addr {
    Base(Gpr),
    Abs(u64),
    Index(Gpr, Gpr),
    Offset(Gpr, i64),
}

/// Branch or address target: the label plus its offset once bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dest {
    pub label: Label,
    pub offset: Option<usize>,
}

/// Registers saved by a prologue and the local area it reserves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub gprs: Vec<Gpr>,
    pub fprs: Vec<Fpr>,
    /// Already rounded to 16 bytes.
    pub locals: u32,
}

/// A validated instruction with resolved operands.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Alu { op: Opcode, dst: Gpr, a: Gpr, b: Gpr },
    AluImm { op: Opcode, dst: Gpr, a: Gpr, imm: i64 },
    Unary { op: Opcode, dst: Gpr, src: Gpr },
    LoadImm { dst: Gpr, imm: i64 },
    MovAddr { dst: Gpr, dest: Dest },
    Load { op: Opcode, dst: Reg, addr: Addr },
    Store { op: Opcode, src: Reg, addr: Addr },
    FAlu { op: Opcode, dst: Fpr, a: Fpr, b: Fpr },
    FUnary { op: Opcode, dst: Fpr, src: Fpr },
    /// Raw IEEE bits; singles use the low 32.
    FLoadImm { op: Opcode, dst: Fpr, bits: u64 },
    IntToFloat { op: Opcode, dst: Fpr, src: Gpr },
    FloatToInt { op: Opcode, dst: Gpr, src: Fpr },
    Branch { op: Opcode, a: Gpr, b: Gpr, dest: Dest },
    BranchImm { op: Opcode, a: Gpr, imm: i64, dest: Dest },
    FBranch { op: Opcode, a: Fpr, b: Fpr, dest: Dest },
    Jump { dest: Dest },
    Indirect { op: Opcode, reg: Gpr },
    IndirectAbs { op: Opcode, addr: u64 },
    Ret,
    Prolog(Frame),
    Epilog(Frame),
    AdjustSp(i32),
}

impl Inst {
    pub fn opcode(&self) -> Opcode {
        match self {
            Inst::Alu { op, .. }
            | Inst::AluImm { op, .. }
            | Inst::Unary { op, .. }
            | Inst::Load { op, .. }
            | Inst::Store { op, .. }
            | Inst::FAlu { op, .. }
            | Inst::FUnary { op, .. }
            | Inst::FLoadImm { op, .. }
            | Inst::IntToFloat { op, .. }
            | Inst::FloatToInt { op, .. }
            | Inst::Branch { op, .. }
            | Inst::BranchImm { op, .. }
            | Inst::FBranch { op, .. }
            | Inst::Indirect { op, .. }
            | Inst::IndirectAbs { op, .. } => *op,
            Inst::LoadImm { .. } => Opcode::Movi,
            Inst::MovAddr { .. } => Opcode::MovAddr,
            Inst::Jump { .. } => Opcode::Jmp,
            Inst::Ret => Opcode::Ret,
            Inst::Prolog(_) => Opcode::Prolog,
            Inst::Epilog(_) => Opcode::Epilog,
            Inst::AdjustSp(_) => Opcode::AdjustSp,
        }
    }
}

/// Byte buffer for one instruction, positioned at its final arena offset.
#[derive(Debug)]
pub struct Sink {
    start: usize,
    bytes: Vec<u8>,
    relocs: Vec<Reloc>,
}

impl Sink {
    pub fn new(start: usize) -> Self {
        Self {
            start,
            bytes: Vec::with_capacity(32),
            relocs: Vec::new(),
        }
    }

    /// Arena offset of the next byte.
    pub fn offset(&self) -> usize {
        self.start + self.bytes.len()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Records that the field starting at the current offset refers to
    /// `label`.
    pub fn reloc(&mut self, label: Label, kind: RelocKind) {
        self.relocs.push(Reloc {
            site: self.offset(),
            label,
            kind,
        });
    }

    /// Moves the contents of a sink that was opened at `self.offset()`.
    pub fn append(&mut self, other: Sink) {
        self.bytes.extend_from_slice(&other.bytes);
        self.relocs.extend(other.relocs);
    }
}

#[cfg(target_arch = "x86_64")]
pub type HostTarget = x86_64::X86_64;
#[cfg(target_arch = "aarch64")]
pub type HostTarget = aarch64::Aarch64;

/// The target matching the machine this crate was built for.
#[cfg(target_arch = "x86_64")]
pub fn host() -> HostTarget {
    x86_64::X86_64::detect()
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
pub fn host() -> HostTarget {
    aarch64::Aarch64::apple()
}

#[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
pub fn host() -> HostTarget {
    aarch64::Aarch64::aapcs64()
}
