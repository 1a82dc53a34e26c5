pub mod abi;
pub mod arena;
pub mod asm;
pub mod config;
pub mod error;
mod jit;
pub mod label;
#[cfg(feature = "cli")]
pub mod logging;
pub mod opcode;
pub mod operand;
mod region;
pub mod target;

pub use abi::{ArgLayout, ArgLoc, CallConv, ReturnLoc};
pub use arena::{Arena, ExecutableCode, RawCode};
pub use asm::{AsmError, AssembleError, Assembler, Assembly, ReturnKind, assemble};
pub use config::JitConfig;
pub use error::{JitError, JitResult};
pub use jit::{CodeReport, CompiledCode, JitState, LabelReport, MAX_FRAME_BYTES};
pub use label::{Label, RelocKind};
pub use opcode::{AddrMode, Opcode, Signature};
pub use operand::{AbiType, Arg, Fpr, Gpr, Location, Operand, Reg};
pub use target::aarch64::Aarch64;
pub use target::x86_64::X86_64;
pub use target::{Addr, HostTarget, Target, host};
