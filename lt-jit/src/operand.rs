use serde::Serialize;

/// Abstract value types understood by the calling-convention lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbiType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    IntMax,
    Pointer,
    Float32,
    Float64,
}

impl AbiType {
    pub fn is_float(self) -> bool {
        matches!(self, AbiType::Float32 | AbiType::Float64)
    }

    pub fn size(self, word_bytes: u8) -> u8 {
        match self {
            AbiType::Int8 | AbiType::Uint8 => 1,
            AbiType::Int16 | AbiType::Uint16 => 2,
            AbiType::Int32 | AbiType::Uint32 | AbiType::Float32 => 4,
            AbiType::Int64 | AbiType::Uint64 | AbiType::Float64 => 8,
            AbiType::IntMax | AbiType::Pointer => word_bytes,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            AbiType::Int8 | AbiType::Int16 | AbiType::Int32 | AbiType::Int64 | AbiType::IntMax
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            AbiType::Int8 => "int8",
            AbiType::Uint8 => "uint8",
            AbiType::Int16 => "int16",
            AbiType::Uint16 => "uint16",
            AbiType::Int32 => "int32",
            AbiType::Uint32 => "uint32",
            AbiType::Int64 => "int64",
            AbiType::Uint64 => "uint64",
            AbiType::IntMax => "intmax",
            AbiType::Pointer => "pointer",
            AbiType::Float32 => "float32",
            AbiType::Float64 => "float64",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "int8" | "i8" => AbiType::Int8,
            "uint8" | "u8" => AbiType::Uint8,
            "int16" | "i16" => AbiType::Int16,
            "uint16" | "u16" => AbiType::Uint16,
            "int32" | "i32" => AbiType::Int32,
            "uint32" | "u32" => AbiType::Uint32,
            "int64" | "i64" => AbiType::Int64,
            "uint64" | "u64" => AbiType::Uint64,
            "intmax" | "word" => AbiType::IntMax,
            "pointer" | "ptr" => AbiType::Pointer,
            "float32" | "f32" => AbiType::Float32,
            "float64" | "f64" => AbiType::Float64,
            _ => return None,
        })
    }

    /// Truncates `value` to this type and extends it back to a full word.
    pub fn normalize(self, value: i64) -> i64 {
        match self {
            AbiType::Int8 => value as i8 as i64,
            AbiType::Uint8 => value as u8 as i64,
            AbiType::Int16 => value as i16 as i64,
            AbiType::Uint16 => value as u16 as i64,
            AbiType::Int32 => value as i32 as i64,
            AbiType::Uint32 => value as u32 as i64,
            _ => value,
        }
    }
}

impl std::fmt::Display for AbiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Hardware general-purpose register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gpr(pub u8);

/// Hardware floating-point register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fpr(pub u8);

impl Gpr {
    pub fn num(self) -> u8 {
        self.0
    }

    pub(crate) fn low3(self) -> u8 {
        self.0 & 7
    }

    pub(crate) fn ext(self) -> bool {
        self.0 >= 8
    }
}

impl Fpr {
    pub fn num(self) -> u8 {
        self.0
    }

    pub(crate) fn low3(self) -> u8 {
        self.0 & 7
    }

    pub(crate) fn ext(self) -> bool {
        self.0 >= 8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Gpr(Gpr),
    Fpr(Fpr),
}

impl From<Gpr> for Reg {
    fn from(reg: Gpr) -> Self {
        Reg::Gpr(reg)
    }
}

impl From<Fpr> for Reg {
    fn from(reg: Fpr) -> Self {
        Reg::Fpr(reg)
    }
}

/// Where an abstract value lives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Location {
    Gpr(Gpr),
    Fpr(Fpr),
    Imm(i64),
    FImm(f64),
    Mem { base: Gpr, offset: i32 },
    /// Outgoing or incoming stack slot, as a byte offset from the
    /// argument area.
    StackArg(i32),
}

/// A typed value descriptor used for arguments, call operands and returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Operand {
    pub ty: AbiType,
    pub loc: Location,
}

impl Operand {
    pub fn gpr(ty: AbiType, reg: Gpr) -> Self {
        Self {
            ty,
            loc: Location::Gpr(reg),
        }
    }

    pub fn fpr(ty: AbiType, reg: Fpr) -> Self {
        Self {
            ty,
            loc: Location::Fpr(reg),
        }
    }

    pub fn imm(ty: AbiType, value: i64) -> Self {
        Self {
            ty,
            loc: Location::Imm(value),
        }
    }

    pub fn fimm(ty: AbiType, value: f64) -> Self {
        Self {
            ty,
            loc: Location::FImm(value),
        }
    }

    pub fn mem(ty: AbiType, base: Gpr, offset: i32) -> Self {
        Self {
            ty,
            loc: Location::Mem { base, offset },
        }
    }

    /// Checks that the location class agrees with the abstract type.
    pub fn check_class(&self) -> Result<(), String> {
        match (self.loc, self.ty.is_float()) {
            (Location::Gpr(_), true) => Err(format!("{} value in a general register", self.ty)),
            (Location::Fpr(_), false) => Err(format!("{} value in a float register", self.ty)),
            (Location::Imm(_), true) => {
                Err(format!("integer immediate for {} operand", self.ty))
            }
            (Location::FImm(_), false) => {
                Err(format!("float immediate for {} operand", self.ty))
            }
            _ => Ok(()),
        }
    }
}

/// One operand of a generic `emit` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    Gpr(Gpr),
    Fpr(Fpr),
    Imm(i64),
    FImm(f64),
    Label(crate::label::Label),
}

impl Arg {
    pub fn kind(&self) -> &'static str {
        match self {
            Arg::Gpr(_) => "general register",
            Arg::Fpr(_) => "float register",
            Arg::Imm(_) => "immediate",
            Arg::FImm(_) => "float immediate",
            Arg::Label(_) => "label",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_truncates_and_extends() {
        assert_eq!(AbiType::Int8.normalize(0xff), -1);
        assert_eq!(AbiType::Uint8.normalize(-1), 0xff);
        assert_eq!(AbiType::Uint16.normalize(0x1_2345), 0x2345);
        assert_eq!(AbiType::Int32.normalize(0x8000_0000), -0x8000_0000);
        assert_eq!(AbiType::IntMax.normalize(-5), -5);
    }

    #[test]
    fn class_mismatch_is_reported() {
        assert!(Operand::gpr(AbiType::Float64, Gpr(0)).check_class().is_err());
        assert!(Operand::fpr(AbiType::Int32, Fpr(0)).check_class().is_err());
        assert!(Operand::imm(AbiType::Float32, 1).check_class().is_err());
        assert!(Operand::mem(AbiType::Float32, Gpr(3), 8).check_class().is_ok());
        assert!(Operand::gpr(AbiType::Pointer, Gpr(1)).check_class().is_ok());
    }

    #[test]
    fn type_names_round_trip_through_parse() {
        for ty in [AbiType::Int8, AbiType::Uint32, AbiType::Pointer, AbiType::Float64] {
            assert_eq!(AbiType::parse(ty.name()), Some(ty));
        }
        assert_eq!(AbiType::parse("quad"), None);
    }
}
