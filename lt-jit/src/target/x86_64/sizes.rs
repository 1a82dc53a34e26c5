//! Worst-case encoded lengths, checked against the encoder by the grid tests.

use crate::opcode::{AddrMode, Opcode, Signature};

pub(super) fn max_bytes(op: Opcode, popcnt: bool, win64: bool) -> Option<usize> {
    use Opcode::*;
    let bytes = match op {
        Addr => 5,
        Addi => 15,
        Addcr | Addxr => 6,
        Addci | Addxi | Subci | Subxi => 16,
        Subr => 6,
        Subcr | Subxr => 9,
        Subi | Rsbi => 16,
        Mulr => 7,
        Muli => 17,
        Divr | DivrU | Remr | RemrU => 18,
        Divi | DiviU | Remi | RemiU => 25,
        Andr | Orr | Xorr => 6,
        Andi | Ori | Xori => 16,
        Lshr | Rshr | RshrU => 14,
        Lshi | Rshi | RshiU => 7,
        Negr | Comr => 6,
        Popcntr => return popcnt.then_some(5),
        Ltr | LtrU | Ler | LerU | Eqr | Ger | GerU | Gtr | GtrU | Ner => 11,
        Lti | LtiU | Lei | LeiU | Eqi | Gei | GeiU | Gti | GtiU | Nei => 21,
        Movr => 3,
        Movi | MovAddr => 10,
        ExtrC | ExtrUc | ExtrS | ExtrUs | ExtrI | ExtrUi => 4,
        BswaprUs => 9,
        BswaprUi | BswaprUl => 6,
        Jmp => 5,
        Jmpr | Callr => 3,
        Jmpi | Calli => 13,
        Ret => 1,
        AddrF | AddrD | MulrF | MulrD => 9,
        SubrF | SubrD | DivrF | DivrD => 13,
        NegrF | NegrD | AbsrF | AbsrD => 15,
        SqrtrF | SqrtrD => 5,
        MovrF | MovrD => 4,
        MoviF => 11,
        MoviD => 15,
        ExtrF | ExtrD | TruncrFL | TruncrDL | ExtrFD | ExtrDF => 5,
        BeqrF | BeqrD => 13,
        BnerF | BnerD => 17,
        Prolog => {
            if win64 {
                112
            } else {
                20
            }
        }
        Epilog => {
            if win64 {
                109
            } else {
                17
            }
        }
        AdjustSp => 7,
        _ => match op.signature() {
            Signature::Load(mode) | Signature::Store(mode) => {
                let float = op.mem_access().is_some_and(|access| access.float);
                memory(mode) + usize::from(float)
            }
            Signature::BranchR => 9,
            Signature::BranchI => 19,
            Signature::FBranch => 11,
            _ => return None,
        },
    };
    Some(bytes)
}

fn memory(mode: AddrMode) -> usize {
    match mode {
        AddrMode::Base => 5,
        AddrMode::Abs => 14,
        AddrMode::Indexed => 6,
        AddrMode::Offset => 16,
    }
}
