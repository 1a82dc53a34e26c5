//! The architecture-neutral instruction vocabulary.

/// Operand shape an opcode expects from `JitState::emit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// `dst, a, b`
    Gpr3,
    /// `dst, a, imm`
    Gpr2Imm,
    /// `dst, src`
    Gpr2,
    /// `dst, imm`
    GprImm,
    Load(AddrMode),
    Store(AddrMode),
    Fpr3,
    Fpr2,
    /// `dst, float literal`
    FprImm,
    /// `fdst, gsrc`
    FprGpr,
    /// `gdst, fsrc`
    GprFpr,
    /// `a, b, label`
    BranchR,
    /// `a, imm, label`
    BranchI,
    /// `fa, fb, label`
    FBranch,
    Jump,
    IndirectR,
    IndirectI,
    /// `dst, label`
    MovAddr,
    Ret,
    Internal,
}

/// Addressing forms of the load/store families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    /// `[base]`
    Base,
    /// `[absolute address]`
    Abs,
    /// `[base + index]`
    Indexed,
    /// `[base + imm]`
    Offset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    pub bytes: u8,
    pub signed: bool,
    pub float: bool,
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
    Ne,
    LtU,
    LeU,
    GeU,
    GtU,
}

/// Float comparison predicates. Ordered ones are false on NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCond {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
    Ne,
    Unord,
    Ord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowBranch {
    pub sub: bool,
    pub unsigned: bool,
    /// `bo*` branches on overflow, `bx*` when there is none.
    pub on_overflow: bool,
}

macro_rules! opcodes {
    ($($variant:ident => $name:literal, $sig:expr;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }

            pub fn signature(self) -> Signature {
                use AddrMode::*;
                use Signature::*;
                match self {
                    $(Opcode::$variant => $sig,)*
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Opcode::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Addr => "addr", Gpr3;
    Addi => "addi", Gpr2Imm;
    Addcr => "addcr", Gpr3;
    Addci => "addci", Gpr2Imm;
    Addxr => "addxr", Gpr3;
    Addxi => "addxi", Gpr2Imm;
    Subr => "subr", Gpr3;
    Subi => "subi", Gpr2Imm;
    Subcr => "subcr", Gpr3;
    Subci => "subci", Gpr2Imm;
    Subxr => "subxr", Gpr3;
    Subxi => "subxi", Gpr2Imm;
    Rsbi => "rsbi", Gpr2Imm;
    Mulr => "mulr", Gpr3;
    Muli => "muli", Gpr2Imm;
    Divr => "divr", Gpr3;
    Divi => "divi", Gpr2Imm;
    DivrU => "divr_u", Gpr3;
    DiviU => "divi_u", Gpr2Imm;
    Remr => "remr", Gpr3;
    Remi => "remi", Gpr2Imm;
    RemrU => "remr_u", Gpr3;
    RemiU => "remi_u", Gpr2Imm;
    Andr => "andr", Gpr3;
    Andi => "andi", Gpr2Imm;
    Orr => "orr", Gpr3;
    Ori => "ori", Gpr2Imm;
    Xorr => "xorr", Gpr3;
    Xori => "xori", Gpr2Imm;
    Lshr => "lshr", Gpr3;
    Lshi => "lshi", Gpr2Imm;
    Rshr => "rshr", Gpr3;
    Rshi => "rshi", Gpr2Imm;
    RshrU => "rshr_u", Gpr3;
    RshiU => "rshi_u", Gpr2Imm;
    Negr => "negr", Gpr2;
    Comr => "comr", Gpr2;
    Popcntr => "popcntr", Gpr2;

    Ltr => "ltr", Gpr3;
    Lti => "lti", Gpr2Imm;
    LtrU => "ltr_u", Gpr3;
    LtiU => "lti_u", Gpr2Imm;
    Ler => "ler", Gpr3;
    Lei => "lei", Gpr2Imm;
    LerU => "ler_u", Gpr3;
    LeiU => "lei_u", Gpr2Imm;
    Eqr => "eqr", Gpr3;
    Eqi => "eqi", Gpr2Imm;
    Ger => "ger", Gpr3;
    Gei => "gei", Gpr2Imm;
    GerU => "ger_u", Gpr3;
    GeiU => "gei_u", Gpr2Imm;
    Gtr => "gtr", Gpr3;
    Gti => "gti", Gpr2Imm;
    GtrU => "gtr_u", Gpr3;
    GtiU => "gti_u", Gpr2Imm;
    Ner => "ner", Gpr3;
    Nei => "nei", Gpr2Imm;

    Movr => "movr", Gpr2;
    Movi => "movi", GprImm;
    MovAddr => "mov_addr", MovAddr;
    ExtrC => "extr_c", Gpr2;
    ExtrUc => "extr_uc", Gpr2;
    ExtrS => "extr_s", Gpr2;
    ExtrUs => "extr_us", Gpr2;
    ExtrI => "extr_i", Gpr2;
    ExtrUi => "extr_ui", Gpr2;
    BswaprUs => "bswapr_us", Gpr2;
    BswaprUi => "bswapr_ui", Gpr2;
    BswaprUl => "bswapr_ul", Gpr2;

    LdrC => "ldr_c", Load(Base);
    LdiC => "ldi_c", Load(Abs);
    LdxrC => "ldxr_c", Load(Indexed);
    LdxiC => "ldxi_c", Load(Offset);
    LdrUc => "ldr_uc", Load(Base);
    LdiUc => "ldi_uc", Load(Abs);
    LdxrUc => "ldxr_uc", Load(Indexed);
    LdxiUc => "ldxi_uc", Load(Offset);
    LdrS => "ldr_s", Load(Base);
    LdiS => "ldi_s", Load(Abs);
    LdxrS => "ldxr_s", Load(Indexed);
    LdxiS => "ldxi_s", Load(Offset);
    LdrUs => "ldr_us", Load(Base);
    LdiUs => "ldi_us", Load(Abs);
    LdxrUs => "ldxr_us", Load(Indexed);
    LdxiUs => "ldxi_us", Load(Offset);
    LdrI => "ldr_i", Load(Base);
    LdiI => "ldi_i", Load(Abs);
    LdxrI => "ldxr_i", Load(Indexed);
    LdxiI => "ldxi_i", Load(Offset);
    LdrUi => "ldr_ui", Load(Base);
    LdiUi => "ldi_ui", Load(Abs);
    LdxrUi => "ldxr_ui", Load(Indexed);
    LdxiUi => "ldxi_ui", Load(Offset);
    LdrL => "ldr_l", Load(Base);
    LdiL => "ldi_l", Load(Abs);
    LdxrL => "ldxr_l", Load(Indexed);
    LdxiL => "ldxi_l", Load(Offset);
    LdrF => "ldr_f", Load(Base);
    LdiF => "ldi_f", Load(Abs);
    LdxrF => "ldxr_f", Load(Indexed);
    LdxiF => "ldxi_f", Load(Offset);
    LdrD => "ldr_d", Load(Base);
    LdiD => "ldi_d", Load(Abs);
    LdxrD => "ldxr_d", Load(Indexed);
    LdxiD => "ldxi_d", Load(Offset);

    StrC => "str_c", Store(Base);
    StiC => "sti_c", Store(Abs);
    StxrC => "stxr_c", Store(Indexed);
    StxiC => "stxi_c", Store(Offset);
    StrS => "str_s", Store(Base);
    StiS => "sti_s", Store(Abs);
    StxrS => "stxr_s", Store(Indexed);
    StxiS => "stxi_s", Store(Offset);
    StrI => "str_i", Store(Base);
    StiI => "sti_i", Store(Abs);
    StxrI => "stxr_i", Store(Indexed);
    StxiI => "stxi_i", Store(Offset);
    StrL => "str_l", Store(Base);
    StiL => "sti_l", Store(Abs);
    StxrL => "stxr_l", Store(Indexed);
    StxiL => "stxi_l", Store(Offset);
    StrF => "str_f", Store(Base);
    StiF => "sti_f", Store(Abs);
    StxrF => "stxr_f", Store(Indexed);
    StxiF => "stxi_f", Store(Offset);
    StrD => "str_d", Store(Base);
    StiD => "sti_d", Store(Abs);
    StxrD => "stxr_d", Store(Indexed);
    StxiD => "stxi_d", Store(Offset);

    Bltr => "bltr", BranchR;
    Blti => "blti", BranchI;
    BltrU => "bltr_u", BranchR;
    BltiU => "blti_u", BranchI;
    Bler => "bler", BranchR;
    Blei => "blei", BranchI;
    BlerU => "bler_u", BranchR;
    BleiU => "blei_u", BranchI;
    Beqr => "beqr", BranchR;
    Beqi => "beqi", BranchI;
    Bger => "bger", BranchR;
    Bgei => "bgei", BranchI;
    BgerU => "bger_u", BranchR;
    BgeiU => "bgei_u", BranchI;
    Bgtr => "bgtr", BranchR;
    Bgti => "bgti", BranchI;
    BgtrU => "bgtr_u", BranchR;
    BgtiU => "bgti_u", BranchI;
    Bner => "bner", BranchR;
    Bnei => "bnei", BranchI;
    Bmsr => "bmsr", BranchR;
    Bmsi => "bmsi", BranchI;
    Bmcr => "bmcr", BranchR;
    Bmci => "bmci", BranchI;

    Boaddr => "boaddr", BranchR;
    Boaddi => "boaddi", BranchI;
    BoaddrU => "boaddr_u", BranchR;
    BoaddiU => "boaddi_u", BranchI;
    Bxaddr => "bxaddr", BranchR;
    Bxaddi => "bxaddi", BranchI;
    BxaddrU => "bxaddr_u", BranchR;
    BxaddiU => "bxaddi_u", BranchI;
    Bosubr => "bosubr", BranchR;
    Bosubi => "bosubi", BranchI;
    BosubrU => "bosubr_u", BranchR;
    BosubiU => "bosubi_u", BranchI;
    Bxsubr => "bxsubr", BranchR;
    Bxsubi => "bxsubi", BranchI;
    BxsubrU => "bxsubr_u", BranchR;
    BxsubiU => "bxsubi_u", BranchI;

    Jmp => "jmp", Jump;
    Jmpr => "jmpr", IndirectR;
    Jmpi => "jmpi", IndirectI;
    Callr => "callr", IndirectR;
    Calli => "calli", IndirectI;
    Ret => "ret", Ret;

    AddrF => "addr_f", Fpr3;
    AddrD => "addr_d", Fpr3;
    SubrF => "subr_f", Fpr3;
    SubrD => "subr_d", Fpr3;
    MulrF => "mulr_f", Fpr3;
    MulrD => "mulr_d", Fpr3;
    DivrF => "divr_f", Fpr3;
    DivrD => "divr_d", Fpr3;
    NegrF => "negr_f", Fpr2;
    NegrD => "negr_d", Fpr2;
    AbsrF => "absr_f", Fpr2;
    AbsrD => "absr_d", Fpr2;
    SqrtrF => "sqrtr_f", Fpr2;
    SqrtrD => "sqrtr_d", Fpr2;
    MovrF => "movr_f", Fpr2;
    MovrD => "movr_d", Fpr2;
    MoviF => "movi_f", FprImm;
    MoviD => "movi_d", FprImm;
    ExtrF => "extr_f", FprGpr;
    ExtrD => "extr_d", FprGpr;
    TruncrFL => "truncr_f_l", GprFpr;
    TruncrDL => "truncr_d_l", GprFpr;
    ExtrFD => "extr_f_d", Fpr2;
    ExtrDF => "extr_d_f", Fpr2;

    BltrF => "bltr_f", FBranch;
    BltrD => "bltr_d", FBranch;
    BlerF => "bler_f", FBranch;
    BlerD => "bler_d", FBranch;
    BeqrF => "beqr_f", FBranch;
    BeqrD => "beqr_d", FBranch;
    BgerF => "bger_f", FBranch;
    BgerD => "bger_d", FBranch;
    BgtrF => "bgtr_f", FBranch;
    BgtrD => "bgtr_d", FBranch;
    BnerF => "bner_f", FBranch;
    BnerD => "bner_d", FBranch;
    BunordrF => "bunordr_f", FBranch;
    BunordrD => "bunordr_d", FBranch;
    BordrF => "bordr_f", FBranch;
    BordrD => "bordr_d", FBranch;

    Prolog => "prolog", Internal;
    Epilog => "epilog", Internal;
    AdjustSp => "adjust_sp", Internal;
}

impl Opcode {
    pub fn mem_access(self) -> Option<MemAccess> {
        use Opcode::*;
        let (bytes, signed, float) = match self {
            LdrC | LdiC | LdxrC | LdxiC => (1, true, false),
            LdrUc | LdiUc | LdxrUc | LdxiUc => (1, false, false),
            LdrS | LdiS | LdxrS | LdxiS => (2, true, false),
            LdrUs | LdiUs | LdxrUs | LdxiUs => (2, false, false),
            LdrI | LdiI | LdxrI | LdxiI => (4, true, false),
            LdrUi | LdiUi | LdxrUi | LdxiUi => (4, false, false),
            LdrL | LdiL | LdxrL | LdxiL => (8, false, false),
            LdrF | LdiF | LdxrF | LdxiF => (4, false, true),
            LdrD | LdiD | LdxrD | LdxiD => (8, false, true),
            StrC | StiC | StxrC | StxiC => (1, false, false),
            StrS | StiS | StxrS | StxiS => (2, false, false),
            StrI | StiI | StxrI | StxiI => (4, false, false),
            StrL | StiL | StxrL | StxiL => (8, false, false),
            StrF | StiF | StxrF | StxiF => (4, false, true),
            StrD | StiD | StxrD | StxiD => (8, false, true),
            _ => return None,
        };
        Some(MemAccess {
            bytes,
            signed,
            float,
        })
    }

    /// Predicate of compare-and-set ops and register/immediate compare branches.
    pub fn compare_cond(self) -> Option<Cond> {
        use Opcode::*;
        Some(match self {
            Ltr | Lti | Bltr | Blti => Cond::Lt,
            LtrU | LtiU | BltrU | BltiU => Cond::LtU,
            Ler | Lei | Bler | Blei => Cond::Le,
            LerU | LeiU | BlerU | BleiU => Cond::LeU,
            Eqr | Eqi | Beqr | Beqi => Cond::Eq,
            Ger | Gei | Bger | Bgei => Cond::Ge,
            GerU | GeiU | BgerU | BgeiU => Cond::GeU,
            Gtr | Gti | Bgtr | Bgti => Cond::Gt,
            GtrU | GtiU | BgtrU | BgtiU => Cond::GtU,
            Ner | Nei | Bner | Bnei => Cond::Ne,
            _ => return None,
        })
    }

    /// `Some(true)` for branch-if-any-bit-set, `Some(false)` for all-clear.
    pub fn mask_test(self) -> Option<bool> {
        match self {
            Opcode::Bmsr | Opcode::Bmsi => Some(true),
            Opcode::Bmcr | Opcode::Bmci => Some(false),
            _ => None,
        }
    }

    pub fn overflow_branch(self) -> Option<OverflowBranch> {
        use Opcode::*;
        let (sub, unsigned, on_overflow) = match self {
            Boaddr | Boaddi => (false, false, true),
            BoaddrU | BoaddiU => (false, true, true),
            Bxaddr | Bxaddi => (false, false, false),
            BxaddrU | BxaddiU => (false, true, false),
            Bosubr | Bosubi => (true, false, true),
            BosubrU | BosubiU => (true, true, true),
            Bxsubr | Bxsubi => (true, false, false),
            BxsubrU | BxsubiU => (true, true, false),
            _ => return None,
        };
        Some(OverflowBranch {
            sub,
            unsigned,
            on_overflow,
        })
    }

    /// Predicate and precision (`true` = double) of float branches.
    pub fn float_cond(self) -> Option<(FCond, bool)> {
        use Opcode::*;
        Some(match self {
            BltrF => (FCond::Lt, false),
            BltrD => (FCond::Lt, true),
            BlerF => (FCond::Le, false),
            BlerD => (FCond::Le, true),
            BeqrF => (FCond::Eq, false),
            BeqrD => (FCond::Eq, true),
            BgerF => (FCond::Ge, false),
            BgerD => (FCond::Ge, true),
            BgtrF => (FCond::Gt, false),
            BgtrD => (FCond::Gt, true),
            BnerF => (FCond::Ne, false),
            BnerD => (FCond::Ne, true),
            BunordrF => (FCond::Unord, false),
            BunordrD => (FCond::Unord, true),
            BordrF => (FCond::Ord, false),
            BordrD => (FCond::Ord, true),
            _ => return None,
        })
    }

    /// Float ops operating on doubles rather than singles.
    pub fn is_double(self) -> bool {
        use Opcode::*;
        match self {
            AddrD | SubrD | MulrD | DivrD | NegrD | AbsrD | SqrtrD | MovrD | MoviD | ExtrD
            | TruncrDL | ExtrDF => true,
            _ => self.float_cond().is_some_and(|(_, double)| double),
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self.signature(),
            Signature::BranchR | Signature::BranchI | Signature::FBranch | Signature::Jump
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_and_parse_back() {
        let mut seen = std::collections::HashSet::new();
        for op in Opcode::ALL {
            assert!(seen.insert(op.name()), "duplicate name {}", op.name());
            assert_eq!(Opcode::from_name(op.name()), Some(*op));
        }
    }

    #[test]
    fn memory_ops_carry_width_and_sign() {
        let access = Opcode::LdxrUs.mem_access().expect("load");
        assert_eq!((access.bytes, access.signed, access.float), (2, false, false));
        let access = Opcode::LdxiC.mem_access().expect("load");
        assert!(access.signed);
        let access = Opcode::StxiD.mem_access().expect("store");
        assert_eq!((access.bytes, access.float), (8, true));
        assert!(Opcode::Addr.mem_access().is_none());
    }

    #[test]
    fn every_memory_op_has_an_access_width() {
        for op in Opcode::ALL {
            let is_mem = matches!(op.signature(), Signature::Load(_) | Signature::Store(_));
            assert_eq!(is_mem, op.mem_access().is_some(), "{}", op.name());
        }
    }

    #[test]
    fn every_branch_has_a_predicate() {
        for op in Opcode::ALL {
            match op.signature() {
                Signature::BranchR | Signature::BranchI => assert!(
                    op.compare_cond().is_some()
                        || op.mask_test().is_some()
                        || op.overflow_branch().is_some(),
                    "{}",
                    op.name()
                ),
                Signature::FBranch => assert!(op.float_cond().is_some(), "{}", op.name()),
                _ => {}
            }
        }
    }
}
