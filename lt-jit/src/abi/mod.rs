//! Calling-convention descriptions and argument/return placement.

pub mod moves;

use crate::error::{JitError, JitResult};
use crate::operand::{AbiType, Fpr, Gpr};

/// Static description of a native calling convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConv {
    pub name: &'static str,
    pub word_bytes: u8,
    pub int_args: &'static [Gpr],
    pub float_args: &'static [Fpr],
    /// The n-th argument uses the n-th register of its class (Win64).
    pub shared_arg_positions: bool,
    /// Integer return registers; a value wider than a word uses two.
    pub int_returns: &'static [Gpr],
    pub float_return: Fpr,
    pub caller_saved_gprs: &'static [Gpr],
    /// In the order `enter_jit_abi` saves them.
    pub callee_saved_gprs: &'static [Gpr],
    pub caller_saved_fprs: &'static [Fpr],
    pub callee_saved_fprs: &'static [Fpr],
    pub scratch_gpr: Gpr,
    pub scratch_fpr: Fpr,
    /// Caller-saved, non-argument register holding indirect call targets.
    pub call_target: Gpr,
    pub sp: Gpr,
    pub stack_align: u32,
    /// Distance from the stack pointer at entry to the first stack argument.
    pub stack_args_offset: u32,
    /// Bytes the caller reserves for the callee below stack arguments.
    pub shadow_space: u32,
    /// Distance from the entry stack pointer down to an aligned boundary.
    pub entry_misalignment: u32,
    /// Stack arguments take their natural size instead of a full slot.
    pub packed_stack_args: bool,
    pub max_args: usize,
}

/// Where the convention places one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLoc {
    Gpr(Gpr),
    Fpr(Fpr),
    /// Byte offset within the outgoing argument area (shadow space included).
    Stack { offset: u32, size: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgLayout {
    pub locs: Vec<ArgLoc>,
    /// Size of the outgoing argument area, shadow space included.
    pub stack_bytes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnLoc {
    Gpr(Gpr),
    Fpr(Fpr),
    /// Low word first.
    Pair(Gpr, Gpr),
}

impl CallConv {
    pub fn assign_args(&self, types: &[AbiType]) -> JitResult<ArgLayout> {
        if types.len() > self.max_args {
            return Err(JitError::UnknownArgumentSlot {
                index: self.max_args,
                limit: self.max_args,
            });
        }
        let word = u32::from(self.word_bytes);
        let mut locs = Vec::with_capacity(types.len());
        let mut next_int = 0usize;
        let mut next_float = 0usize;
        let mut stack = self.shadow_space;
        for (index, ty) in types.iter().copied().enumerate() {
            let in_register = if self.shared_arg_positions {
                if ty.is_float() {
                    self.float_args.get(index).copied().map(ArgLoc::Fpr)
                } else {
                    self.int_args.get(index).copied().map(ArgLoc::Gpr)
                }
            } else if ty.is_float() {
                let reg = self.float_args.get(next_float).copied().map(ArgLoc::Fpr);
                next_float += usize::from(reg.is_some());
                reg
            } else {
                let reg = self.int_args.get(next_int).copied().map(ArgLoc::Gpr);
                next_int += usize::from(reg.is_some());
                reg
            };
            if let Some(loc) = in_register {
                locs.push(loc);
                continue;
            }
            let size = ty.size(self.word_bytes);
            if self.packed_stack_args {
                stack = align_up(stack, u32::from(size));
                locs.push(ArgLoc::Stack { offset: stack, size });
                stack += u32::from(size);
            } else {
                locs.push(ArgLoc::Stack { offset: stack, size });
                stack += word.max(u32::from(size));
            }
        }
        Ok(ArgLayout {
            locs,
            stack_bytes: align_up(stack, word),
        })
    }

    /// Location of the `index`-th incoming argument when `types` describes
    /// the full signature.
    pub fn arg_location(&self, types: &[AbiType], index: usize) -> JitResult<ArgLoc> {
        let layout = self.assign_args(types)?;
        layout
            .locs
            .get(index)
            .copied()
            .ok_or(JitError::UnknownArgumentSlot {
                index,
                limit: types.len(),
            })
    }

    pub fn return_location(&self, ty: AbiType) -> JitResult<ReturnLoc> {
        if ty.is_float() {
            return Ok(ReturnLoc::Fpr(self.float_return));
        }
        let lo = *self.int_returns.first().ok_or_else(|| {
            JitError::InvalidOperand(format!("{} has no integer return register", self.name))
        })?;
        if ty.size(self.word_bytes) <= self.word_bytes {
            return Ok(ReturnLoc::Gpr(lo));
        }
        let hi = *self.int_returns.get(1).ok_or_else(|| {
            JitError::InvalidOperand(format!(
                "{} cannot return a {ty} value in registers",
                self.name
            ))
        })?;
        Ok(ReturnLoc::Pair(lo, hi))
    }

    /// Low and high return registers for two-word results.
    pub fn pair_return(&self) -> JitResult<(Gpr, Gpr)> {
        match self.int_returns {
            [lo, hi, ..] => Ok((*lo, *hi)),
            _ => Err(JitError::InvalidOperand(format!(
                "{} has no register pair for two-word returns",
                self.name
            ))),
        }
    }

    /// Bytes to subtract from the stack pointer so a call made with
    /// `pushed` bytes already below the entry pointer and an argument area
    /// of `stack_bytes` lands on an aligned boundary.
    pub fn call_area(&self, pushed: u32, stack_bytes: u32) -> u32 {
        let depth = self.entry_misalignment + pushed + stack_bytes;
        stack_bytes + (align_up(depth, self.stack_align) - depth)
    }

    pub fn is_callee_saved_gpr(&self, reg: Gpr) -> bool {
        self.callee_saved_gprs.contains(&reg)
    }

    pub fn is_callee_saved_fpr(&self, reg: Fpr) -> bool {
        self.callee_saved_fprs.contains(&reg)
    }
}

pub(crate) fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::aarch64::Aarch64;
    use crate::target::x86_64::X86_64;
    use crate::target::Target;

    const G: AbiType = AbiType::IntMax;
    const D: AbiType = AbiType::Float64;

    #[test]
    fn sysv_counts_classes_independently() {
        let target = X86_64::sysv();
        let conv = target.conv();
        let layout = conv.assign_args(&[G, D, G, D]).expect("layout");
        assert_eq!(
            layout.locs,
            vec![
                ArgLoc::Gpr(conv.int_args[0]),
                ArgLoc::Fpr(conv.float_args[0]),
                ArgLoc::Gpr(conv.int_args[1]),
                ArgLoc::Fpr(conv.float_args[1]),
            ]
        );
        assert_eq!(layout.stack_bytes, 0);
    }

    #[test]
    fn sysv_spills_the_seventh_integer() {
        let target = X86_64::sysv();
        let layout = target.conv().assign_args(&[G; 8]).expect("layout");
        assert_eq!(layout.locs[6], ArgLoc::Stack { offset: 0, size: 8 });
        assert_eq!(layout.locs[7], ArgLoc::Stack { offset: 8, size: 8 });
        assert_eq!(layout.stack_bytes, 16);
    }

    #[test]
    fn win64_shares_positions_and_reserves_shadow_space() {
        let target = X86_64::win64();
        let conv = target.conv();
        let layout = conv.assign_args(&[G, D, G, D, G]).expect("layout");
        assert_eq!(layout.locs[1], ArgLoc::Fpr(conv.float_args[1]));
        assert_eq!(layout.locs[2], ArgLoc::Gpr(conv.int_args[2]));
        assert_eq!(layout.locs[4], ArgLoc::Stack { offset: 32, size: 8 });
        assert_eq!(layout.stack_bytes, 40);
        assert_eq!(conv.assign_args(&[]).expect("empty").stack_bytes, 32);
    }

    #[test]
    fn apple_packs_narrow_stack_arguments() {
        let target = Aarch64::apple();
        let mut types = vec![G; 8];
        types.extend([AbiType::Int8, AbiType::Int16, AbiType::Int32, G]);
        let layout = target.conv().assign_args(&types).expect("layout");
        assert_eq!(layout.locs[8], ArgLoc::Stack { offset: 0, size: 1 });
        assert_eq!(layout.locs[9], ArgLoc::Stack { offset: 2, size: 2 });
        assert_eq!(layout.locs[10], ArgLoc::Stack { offset: 4, size: 4 });
        assert_eq!(layout.locs[11], ArgLoc::Stack { offset: 8, size: 8 });
        assert_eq!(layout.stack_bytes, 16);

        let layout = Aarch64::aapcs64().conv().assign_args(&types).expect("layout");
        assert_eq!(layout.locs[9], ArgLoc::Stack { offset: 8, size: 2 });
        assert_eq!(layout.stack_bytes, 32);
    }

    #[test]
    fn too_many_arguments_is_an_unknown_slot() {
        let target = X86_64::sysv();
        let conv = target.conv();
        let types = vec![G; conv.max_args + 1];
        assert!(matches!(
            conv.assign_args(&types),
            Err(JitError::UnknownArgumentSlot { .. })
        ));
        assert!(matches!(
            conv.arg_location(&[G, G], 2),
            Err(JitError::UnknownArgumentSlot { index: 2, limit: 2 })
        ));
    }

    #[test]
    fn wide_returns_split_across_a_pair() {
        static INT_RETURNS: [Gpr; 2] = [Gpr(0), Gpr(2)];
        let conv = CallConv {
            name: "ilp32",
            word_bytes: 4,
            int_returns: &INT_RETURNS,
            ..X86_64::sysv().conv().clone()
        };
        assert_eq!(conv.return_location(AbiType::Int32), Ok(ReturnLoc::Gpr(Gpr(0))));
        assert_eq!(
            conv.return_location(AbiType::Int64),
            Ok(ReturnLoc::Pair(Gpr(0), Gpr(2)))
        );
        assert_eq!(conv.return_location(AbiType::Pointer), Ok(ReturnLoc::Gpr(Gpr(0))));
        assert_eq!(
            conv.return_location(AbiType::Float64),
            Ok(ReturnLoc::Fpr(conv.float_return))
        );
    }

    #[test]
    fn call_area_keeps_the_stack_aligned() {
        let sysv = X86_64::sysv();
        assert_eq!(sysv.conv().call_area(0, 0), 8);
        assert_eq!(sysv.conv().call_area(8, 0), 0);
        assert_eq!(sysv.conv().call_area(0, 16), 24);
        let arm = Aarch64::aapcs64();
        assert_eq!(arm.conv().call_area(0, 0), 0);
        assert_eq!(arm.conv().call_area(0, 8), 16);
    }
}
