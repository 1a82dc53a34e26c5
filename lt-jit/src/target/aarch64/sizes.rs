use crate::opcode::{AddrMode, Opcode, Signature};

const INSN: usize = 4;

/// Worst-case byte length; every AArch64 opcode has an encoding.
pub(super) fn max_bytes(op: Opcode) -> Option<usize> {
    use Opcode::*;
    let insns = match op {
        Addi | Subi => 5,
        Addci | Addxi | Subci | Subxi | Rsbi | Muli | Divi | DiviU => 5,
        Remr | RemrU => 2,
        Remi | RemiU => 6,
        Andi | Ori | Xori => 5,
        Popcntr => 4,
        Ltr | LtrU | Ler | LerU | Eqr | Ger | GerU | Gtr | GtrU | Ner => 2,
        Lti | LtiU | Lei | LeiU | Eqi | Gei | GeiU | Gti | GtiU | Nei => 6,
        Movi | MovAddr => 4,
        BswaprUs => 2,
        Jmpi | Calli => 5,
        MoviF => 3,
        MoviD => 5,
        Prolog => 13,
        Epilog => 12,
        AdjustSp => 2,
        _ => match op.signature() {
            Signature::Load(AddrMode::Abs)
            | Signature::Store(AddrMode::Abs)
            | Signature::Load(AddrMode::Offset)
            | Signature::Store(AddrMode::Offset) => 5,
            Signature::BranchR => 3,
            Signature::BranchI => 7,
            Signature::FBranch => 3,
            _ => 1,
        },
    };
    Some(insns * INSN)
}
