//! Line-oriented assembly text that drives a [`JitState`].
//!
//! ```text
//! .arg pointer r0        # next incoming argument
//! .frame 1 0 32          # enter_jit_abi(v, vf, frame_size)
//! .label loop
//! addi r0, r0, 1
//! blti r0, 10, loop
//! retr r0
//! ```
//!
//! `r<n>` and `f<n>` name the n-th caller-saved general and float register
//! of the target's convention, `v<n>` and `vf<n>` the n-th callee-saved
//! ones. Operands follow the `emit` order of each opcode.

use std::collections::HashMap;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::abi::CallConv;
use crate::arena::Arena;
use crate::error::JitError;
use crate::jit::{CompiledCode, JitState};
use crate::label::Label;
use crate::opcode::{Opcode, Signature};
use crate::operand::{AbiType, Arg, Location, Operand, Reg};
use crate::target::Target;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for AsmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for AsmError {}

#[derive(Debug, Clone, PartialEq)]
pub enum AssembleError {
    Syntax(AsmError),
    Jit { line: usize, error: JitError },
}

impl AssembleError {
    pub fn line(&self) -> usize {
        match self {
            AssembleError::Syntax(err) => err.line,
            AssembleError::Jit { line, .. } => *line,
        }
    }
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssembleError::Syntax(err) => write!(f, "{err}"),
            AssembleError::Jit { line, error } => write!(f, "line {line}: {error}"),
        }
    }
}

impl std::error::Error for AssembleError {}

impl From<AsmError> for AssembleError {
    fn from(err: AsmError) -> Self {
        AssembleError::Syntax(err)
    }
}

fn syntax(line: usize, message: impl Into<String>) -> AssembleError {
    AssembleError::Syntax(AsmError {
        line,
        message: message.into(),
    })
}

fn jit_error(line: usize) -> impl FnOnce(JitError) -> AssembleError {
    move |error| AssembleError::Jit { line, error }
}

/// Class of the value the assembled function returns, taken from its last
/// `retr*`/`reti` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
    Int,
    Float32,
    Float64,
}

/// A finished assembly: the code plus what the text declared about it.
#[derive(Debug)]
pub struct Assembly {
    pub code: CompiledCode,
    pub labels: Vec<(String, usize)>,
    pub args: Vec<AbiType>,
    pub returns: Option<ReturnKind>,
}

struct Patterns {
    register: Regex,
    int: Regex,
    float: Regex,
    ident: Regex,
    mem: Regex,
}

impl Patterns {
    fn new() -> Result<Self, AsmError> {
        let compile = |source: &str| {
            Regex::new(source).map_err(|err| AsmError {
                line: 0,
                message: format!("operand pattern: {err}"),
            })
        };
        Ok(Self {
            register: compile(r"^(vf|r|v|f)(\d+)$")?,
            int: compile(r"^-?(0[xX][0-9a-fA-F]+|\d+)$")?,
            float: compile(r"^-?(\d+\.\d*|\.\d+)([eE][-+]?\d+)?$")?,
            ident: compile(r"^[A-Za-z_][A-Za-z0-9_.$]*$")?,
            mem: compile(r"^\[\s*([A-Za-z0-9_]+)\s*(?:([+-])\s*(0[xX][0-9a-fA-F]+|\d+))?\s*\]$")?,
        })
    }
}

/// Feeds statements to a session one line at a time.
pub struct Assembler<T: Target> {
    jit: JitState<T>,
    conv: CallConv,
    patterns: Patterns,
    labels: HashMap<String, Label>,
    label_order: Vec<String>,
    pending_args: Vec<(usize, Operand)>,
    args: Vec<AbiType>,
    args_loaded: bool,
    returns: Option<ReturnKind>,
    last_line: usize,
}

impl<T: Target> Assembler<T> {
    pub fn new(target: T, arena: Arena) -> Result<Self, AssembleError> {
        let conv = target.conv().clone();
        let jit = JitState::begin(target, arena).map_err(jit_error(0))?;
        Ok(Self {
            jit,
            conv,
            patterns: Patterns::new()?,
            labels: HashMap::new(),
            label_order: Vec::new(),
            pending_args: Vec::new(),
            args: Vec::new(),
            args_loaded: false,
            returns: None,
            last_line: 0,
        })
    }

    pub fn line(&mut self, line_no: usize, raw_line: &str) -> Result<(), AssembleError> {
        self.last_line = line_no;
        let line = strip_comments(raw_line).trim();
        if line.is_empty() {
            return Ok(());
        }
        if line.ends_with(':') {
            return Err(syntax(line_no, "label definitions must use '.label NAME'"));
        }
        if let Some(rest) = line.strip_prefix('.') {
            return self.directive(line_no, rest);
        }
        let (mnemonic, rest) = match line.split_once(char::is_whitespace) {
            Some((mnemonic, rest)) => (mnemonic, rest.trim()),
            None => (line, ""),
        };
        let operands: Vec<&str> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(',').map(str::trim).collect()
        };
        if operands.iter().any(|operand| operand.is_empty()) {
            return Err(syntax(line_no, "empty operand"));
        }
        self.flush_args(line_no)?;
        self.instruction(line_no, &mnemonic.to_ascii_lowercase(), &operands)
    }

    fn directive(&mut self, line_no: usize, rest: &str) -> Result<(), AssembleError> {
        let mut parts = rest.split_whitespace();
        let directive = parts.next().unwrap_or("").to_ascii_lowercase();
        match directive.as_str() {
            "arg" => {
                if self.args_loaded {
                    return Err(syntax(line_no, "'.arg' must precede the first instruction"));
                }
                let ty_name = next_token(&mut parts, line_no, "argument type")?;
                let ty = AbiType::parse(ty_name)
                    .ok_or_else(|| syntax(line_no, format!("unknown type '{ty_name}'")))?;
                let location = parts.collect::<Vec<_>>().join(" ");
                if location.is_empty() {
                    return Err(syntax(line_no, "missing argument location"));
                }
                let loc = self.location(line_no, &location)?;
                self.pending_args.push((line_no, Operand { ty, loc }));
                self.args.push(ty);
                return Ok(());
            }
            "frame" => {
                let v = parse_number(next_token(&mut parts, line_no, "saved register count")?, line_no)?;
                let vf = parse_number(next_token(&mut parts, line_no, "saved float count")?, line_no)?;
                let size = match parts.next() {
                    Some(token) => parse_number(token, line_no)?,
                    None => 0,
                };
                let size = u32::try_from(size)
                    .map_err(|_| syntax(line_no, format!("frame size {size} is too large")))?;
                self.jit
                    .enter_jit_abi(v, vf, size)
                    .map_err(jit_error(line_no))?;
            }
            "label" => {
                let name = next_token(&mut parts, line_no, "label name")?;
                if !self.patterns.ident.is_match(name) {
                    return Err(syntax(line_no, format!("invalid label name '{name}'")));
                }
                self.flush_args(line_no)?;
                let label = self.label(name);
                self.jit.bind(label).map_err(|error| match error {
                    JitError::LabelAlreadyBound(_) => {
                        syntax(line_no, format!("duplicate label '{name}'"))
                    }
                    error => AssembleError::Jit {
                        line: line_no,
                        error,
                    },
                })?;
            }
            other => return Err(syntax(line_no, format!("unknown directive '.{other}'"))),
        }
        if parts.next().is_some() {
            return Err(syntax(line_no, "unexpected extra tokens"));
        }
        Ok(())
    }

    /// Loads the `.arg` operands once the first instruction arrives, so a
    /// `.frame` between them still saves the registers they target.
    fn flush_args(&mut self, line_no: usize) -> Result<(), AssembleError> {
        if self.args_loaded {
            return Ok(());
        }
        self.args_loaded = true;
        if self.pending_args.is_empty() {
            return Ok(());
        }
        let mut operands = Vec::with_capacity(self.pending_args.len());
        for (index, (arg_line, operand)) in std::mem::take(&mut self.pending_args)
            .into_iter()
            .enumerate()
        {
            let operand = self
                .jit
                .describe_argument(index, operand.ty, operand.loc)
                .map_err(jit_error(arg_line))?;
            operands.push(operand);
        }
        self.jit.load_args(&operands).map_err(jit_error(line_no))
    }

    fn instruction(
        &mut self,
        line_no: usize,
        mnemonic: &str,
        operands: &[&str],
    ) -> Result<(), AssembleError> {
        let result = match mnemonic {
            "retr" | "retr_f" | "retr_d" | "retval" | "retval_f" | "retval_d" => {
                let [token] = operands else {
                    return Err(syntax(line_no, format!("{mnemonic} takes one register")));
                };
                let reg = self.register(line_no, token)?;
                let ty = match mnemonic {
                    "retr_f" | "retval_f" => AbiType::Float32,
                    "retr_d" | "retval_d" => AbiType::Float64,
                    _ => AbiType::IntMax,
                };
                if mnemonic.starts_with("retr") {
                    self.returns = Some(return_kind(ty));
                    self.jit.retr_with(ty, reg)
                } else {
                    self.jit.retval_with(ty, reg)
                }
            }
            "reti" => {
                let [token] = operands else {
                    return Err(syntax(line_no, "reti takes one immediate"));
                };
                let value = self.int(line_no, token)?;
                self.returns = Some(ReturnKind::Int);
                self.jit.reti(value)
            }
            _ => {
                let op = Opcode::from_name(mnemonic)
                    .ok_or_else(|| syntax(line_no, format!("unknown opcode '{mnemonic}'")))?;
                let mut args = Vec::with_capacity(operands.len());
                for token in operands {
                    args.push(self.arg(line_no, token)?);
                }
                if op.signature() == Signature::FprImm {
                    for arg in &mut args {
                        if let Arg::Imm(value) = *arg {
                            *arg = Arg::FImm(value as f64);
                        }
                    }
                }
                self.jit.emit(op, &args)
            }
        };
        result.map_err(jit_error(line_no))
    }

    fn label(&mut self, name: &str) -> Label {
        if let Some(label) = self.labels.get(name) {
            return *label;
        }
        let label = self.jit.new_label();
        self.labels.insert(name.to_string(), label);
        self.label_order.push(name.to_string());
        label
    }

    fn lookup_register(&self, token: &str) -> Option<Result<Reg, String>> {
        if token.eq_ignore_ascii_case("sp") {
            return Some(Ok(Reg::Gpr(self.conv.sp)));
        }
        let caps = self.patterns.register.captures(token)?;
        let index: usize = match caps[2].parse() {
            Ok(index) => index,
            Err(_) => return Some(Err(format!("invalid register '{token}'"))),
        };
        let conv = &self.conv;
        let found = match &caps[1] {
            "r" => conv.caller_saved_gprs.get(index).copied().map(Reg::Gpr),
            "v" => conv.callee_saved_gprs.get(index).copied().map(Reg::Gpr),
            "f" => conv.caller_saved_fprs.get(index).copied().map(Reg::Fpr),
            _ => conv.callee_saved_fprs.get(index).copied().map(Reg::Fpr),
        };
        Some(found.ok_or_else(|| format!("{} has no register '{token}'", conv.name)))
    }

    fn register(&self, line_no: usize, token: &str) -> Result<Reg, AssembleError> {
        match self.lookup_register(token) {
            Some(found) => found.map_err(|message| syntax(line_no, message)),
            None => Err(syntax(line_no, format!("expected a register, got '{token}'"))),
        }
    }

    fn int(&self, line_no: usize, token: &str) -> Result<i64, AssembleError> {
        if !self.patterns.int.is_match(token) {
            return Err(syntax(line_no, format!("expected an integer, got '{token}'")));
        }
        parse_int(token).ok_or_else(|| syntax(line_no, format!("integer '{token}' out of range")))
    }

    fn arg(&mut self, line_no: usize, token: &str) -> Result<Arg, AssembleError> {
        if let Some(found) = self.lookup_register(token) {
            return match found.map_err(|message| syntax(line_no, message))? {
                Reg::Gpr(reg) => Ok(Arg::Gpr(reg)),
                Reg::Fpr(reg) => Ok(Arg::Fpr(reg)),
            };
        }
        if self.patterns.int.is_match(token) {
            return self.int(line_no, token).map(Arg::Imm);
        }
        if self.patterns.float.is_match(token) {
            return token
                .parse::<f64>()
                .map(Arg::FImm)
                .map_err(|_| syntax(line_no, format!("invalid float '{token}'")));
        }
        if self.patterns.ident.is_match(token) {
            return Ok(Arg::Label(self.label(token)));
        }
        Err(syntax(line_no, format!("unrecognized operand '{token}'")))
    }

    fn location(&self, line_no: usize, token: &str) -> Result<Location, AssembleError> {
        if let Some(caps) = self.patterns.mem.captures(token) {
            let base = match self.register(line_no, &caps[1])? {
                Reg::Gpr(reg) => reg,
                Reg::Fpr(_) => {
                    return Err(syntax(line_no, "memory base must be a general register"));
                }
            };
            let mut offset = match caps.get(3) {
                Some(raw) => self.int(line_no, raw.as_str())?,
                None => 0,
            };
            if caps.get(2).is_some_and(|sign| sign.as_str() == "-") {
                offset = -offset;
            }
            let offset = i32::try_from(offset)
                .map_err(|_| syntax(line_no, format!("offset {offset} out of range")))?;
            return Ok(Location::Mem { base, offset });
        }
        match self.register(line_no, token)? {
            Reg::Gpr(reg) => Ok(Location::Gpr(reg)),
            Reg::Fpr(reg) => Ok(Location::Fpr(reg)),
        }
    }

    /// Closes the session; unbound labels are reported by name.
    pub fn finish(mut self) -> Result<Assembly, AssembleError> {
        let line_no = self.last_line;
        self.flush_args(line_no)?;
        let code = self.jit.end().map_err(|error| match error {
            JitError::UnboundLabelAtFinalize(label) => {
                let name = self
                    .labels
                    .iter()
                    .find(|(_, candidate)| **candidate == label)
                    .map(|(name, _)| name.clone())
                    .unwrap_or_else(|| label.to_string());
                syntax(line_no, format!("label '{name}' is never defined"))
            }
            error => AssembleError::Jit {
                line: line_no,
                error,
            },
        })?;
        let labels = self
            .label_order
            .iter()
            .filter_map(|name| {
                let label = self.labels.get(name)?;
                code.label_offset(*label).map(|offset| (name.clone(), offset))
            })
            .collect();
        debug!(len = code.len(), args = self.args.len(), "assembled");
        Ok(Assembly {
            code,
            labels,
            args: self.args,
            returns: self.returns,
        })
    }
}

/// Assembles `source` into a fresh session on `arena`.
pub fn assemble<T: Target>(
    target: T,
    arena: Arena,
    source: &str,
) -> Result<Assembly, AssembleError> {
    let mut assembler = Assembler::new(target, arena)?;
    for (line_idx, raw_line) in source.lines().enumerate() {
        assembler.line(line_idx + 1, raw_line)?;
    }
    assembler.finish()
}

fn return_kind(ty: AbiType) -> ReturnKind {
    match ty {
        AbiType::Float32 => ReturnKind::Float32,
        AbiType::Float64 => ReturnKind::Float64,
        _ => ReturnKind::Int,
    }
}

fn strip_comments(line: &str) -> &str {
    let hash_idx = line.find('#');
    let slash_idx = line.find("//");
    match (hash_idx, slash_idx) {
        (Some(h), Some(s)) => &line[..h.min(s)],
        (Some(h), None) => &line[..h],
        (None, Some(s)) => &line[..s],
        (None, None) => line,
    }
}

fn next_token<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    line_no: usize,
    what: &str,
) -> Result<&'a str, AssembleError> {
    parts
        .next()
        .ok_or_else(|| syntax(line_no, format!("missing {what}")))
}

fn parse_number(token: &str, line_no: usize) -> Result<usize, AssembleError> {
    token
        .parse::<usize>()
        .map_err(|_| syntax(line_no, format!("invalid number '{token}'")))
}

/// Decimal or `0x` hex; hex literals may use all 64 bits.
pub fn parse_int(token: &str) -> Option<i64> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u64>().ok()?,
    };
    if negative {
        if magnitude > i64::MIN.unsigned_abs() {
            return None;
        }
        Some((magnitude as i64).wrapping_neg())
    } else if digits.starts_with("0x") || digits.starts_with("0X") {
        Some(magnitude as i64)
    } else {
        i64::try_from(magnitude).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::aarch64::Aarch64;
    use crate::target::x86_64::{self, X86_64};

    fn arena() -> Arena {
        Arena::new(4096).expect("arena")
    }

    #[test]
    fn integers_accept_hex_and_sign() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("-0x10"), Some(-16));
        assert_eq!(parse_int("0xffffffffffffffff"), Some(-1));
        assert_eq!(parse_int("-9223372036854775808"), Some(i64::MIN));
        assert_eq!(parse_int("9223372036854775808"), None);
    }

    #[test]
    fn comments_are_stripped() {
        assert_eq!(strip_comments("addi r0, r0, 1 # bump"), "addi r0, r0, 1 ");
        assert_eq!(strip_comments("// whole line"), "");
    }

    #[test]
    fn registers_follow_the_convention() {
        let asm = Assembler::new(X86_64::sysv(), arena()).expect("assembler");
        assert_eq!(asm.register(1, "r0"), Ok(Reg::Gpr(x86_64::RAX)));
        assert_eq!(asm.register(1, "v0"), Ok(Reg::Gpr(x86_64::RBX)));
        assert_eq!(asm.register(1, "sp"), Ok(Reg::Gpr(x86_64::RSP)));
        assert!(asm.register(1, "vf0").is_err());
        assert!(asm.register(1, "r42").is_err());
    }

    #[test]
    fn loop_assembles_on_both_architectures() {
        let source = "\
            .arg intmax r0
            .label loop
            addi r0, r0, 1
            blti r0, 10, loop
            retr r0
        ";
        let x86 = assemble(X86_64::sysv(), arena(), source).expect("x86");
        assert_eq!(x86.labels[0].0, "loop");
        assert_eq!(x86.args, vec![AbiType::IntMax]);
        assert_eq!(x86.returns, Some(ReturnKind::Int));
        let arm = assemble(Aarch64::aapcs64(), arena(), source).expect("aarch64");
        assert_eq!(arm.code.len() % 4, 0);
    }

    #[test]
    fn undefined_labels_are_named() {
        let err = assemble(X86_64::sysv(), arena(), "jmp nowhere\nret").expect_err("unbound");
        assert_eq!(
            err,
            AssembleError::Syntax(AsmError {
                line: 2,
                message: "label 'nowhere' is never defined".to_string(),
            })
        );
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let err = assemble(X86_64::sysv(), arena(), ".label a\n.label a").expect_err("dup");
        assert_eq!(err.line(), 2);
        assert!(err.to_string().contains("duplicate label 'a'"));
    }

    #[test]
    fn colon_labels_point_at_the_directive() {
        let err = assemble(X86_64::sysv(), arena(), "top:").expect_err("colon");
        assert!(err.to_string().contains(".label NAME"));
    }

    #[test]
    fn operand_errors_carry_the_line() {
        let err = assemble(X86_64::sysv(), arena(), "ret\naddr r0, r1").expect_err("arity");
        assert!(matches!(
            err,
            AssembleError::Jit {
                line: 2,
                error: JitError::InvalidOperand(_)
            }
        ));
    }

    #[test]
    fn arguments_can_land_in_memory() {
        let source = "\
            .arg pointer r1
            .arg intmax [sp+0]
            .frame 0 0 16
            ret
        ";
        assemble(X86_64::sysv(), arena(), source).expect("memory argument");
        let late = ".arg pointer r0\nret\n.arg intmax r1";
        assert!(assemble(X86_64::sysv(), arena(), late).is_err());
    }

    #[test]
    fn float_immediates_accept_integers() {
        let source = "movi_d f0, 2\nmovi_f f1, 0.5\nretr_d f0";
        let assembly = assemble(X86_64::sysv(), arena(), source).expect("floats");
        assert_eq!(assembly.returns, Some(ReturnKind::Float64));
    }
}
