use crate::label::Label;
use crate::opcode::Opcode;

pub type JitResult<T> = Result<T, JitError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    InvalidArena(&'static str),
    InvalidOperand(String),
    InvalidOperandAssignment(String),
    UnknownArgumentSlot {
        index: usize,
        limit: usize,
    },
    OutOfSpace {
        requested: usize,
        available: usize,
    },
    UnboundLabelAtFinalize(Label),
    UnsupportedOnTarget {
        opcode: Opcode,
        target: &'static str,
    },
    UnknownLabel(Label),
    LabelAlreadyBound(Label),
    DisplacementOverflow {
        site: usize,
        target: usize,
    },
    EncodingOverflow {
        opcode: Opcode,
        emitted: usize,
        max: usize,
    },
    Memory(String),
    Abandoned,
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::InvalidArena(reason) => write!(f, "invalid arena: {reason}"),
            JitError::InvalidOperand(message) => write!(f, "invalid operand: {message}"),
            JitError::InvalidOperandAssignment(message) => {
                write!(f, "invalid operand assignment: {message}")
            }
            JitError::UnknownArgumentSlot { index, limit } => write!(
                f,
                "argument index {index} is outside the {limit} slots of the calling convention"
            ),
            JitError::OutOfSpace {
                requested,
                available,
            } => write!(
                f,
                "code arena out of space: need {requested} bytes, {available} available"
            ),
            JitError::UnboundLabelAtFinalize(label) => {
                write!(f, "label {label} is still unbound at end of compilation")
            }
            JitError::UnsupportedOnTarget { opcode, target } => {
                write!(f, "opcode {} has no encoding on {target}", opcode.name())
            }
            JitError::UnknownLabel(label) => write!(f, "unknown label {label}"),
            JitError::LabelAlreadyBound(label) => write!(f, "label {label} is already bound"),
            JitError::DisplacementOverflow { site, target } => write!(
                f,
                "branch at offset {site} cannot reach target offset {target}"
            ),
            JitError::EncodingOverflow {
                opcode,
                emitted,
                max,
            } => write!(
                f,
                "opcode {} emitted {emitted} bytes, above its {max}-byte bound",
                opcode.name()
            ),
            JitError::Memory(message) => write!(f, "executable memory error: {message}"),
            JitError::Abandoned => write!(f, "jit session abandoned after an earlier error"),
        }
    }
}

impl std::error::Error for JitError {}
