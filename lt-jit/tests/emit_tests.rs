#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

mod common;

use common::*;
use jit::Arg;

type Unary = fn(&mut JitState<HostTarget>, Gpr, Gpr) -> JitResult<()>;

fn unary_fn(op: Unary) -> CompiledCode {
    compile(|jit| {
        jit.load_args(&args_in_temps(&[AbiType::IntMax]))?;
        op(jit, r(0), r(0))?;
        jit.retr(r(0))
    })
}

#[test]
fn byte_swaps_reverse_every_width() {
    if !native_jit_supported() {
        return;
    }
    let ul = unary_fn(JitState::bswapr_ul);
    let ui = unary_fn(JitState::bswapr_ui);
    let us = unary_fn(JitState::bswapr_us);
    assert_eq!(fn1(&ul)(0x1234_5678) as u64, 0x7856_3412_0000_0000);
    assert_eq!(fn1(&ui)(0x1234_5678), 0x7856_3412);
    assert_eq!(fn1(&us)(0x1234), 0x3412);

    let value = 0x0102_0304_0506_0708;
    assert_eq!(fn1(&ul)(fn1(&ul)(value)), value);
    assert_eq!(fn1(&ul)(value), 0x0807_0605_0403_0201);
}

#[test]
fn indexed_word_loads_step_by_eight() {
    if !native_jit_supported() {
        return;
    }
    let code = compile(|jit| {
        jit.load_args(&args_in_temps(&[AbiType::Pointer, AbiType::IntMax]))?;
        jit.ldxr_l(r(0), r(0), r(1))?;
        jit.retr(r(0))
    });
    let words: [i64; 3] = [-1, 0, 0x42];
    let base = words.as_ptr() as i64;
    let load = fn2(&code);
    assert_eq!(load(base, 0), -1);
    assert_eq!(load(base, 8), 0);
    assert_eq!(load(base, 16), 0x42);
}

#[test]
fn indexed_halfword_loads_extend_by_signedness() {
    if !native_jit_supported() {
        return;
    }
    let unsigned = compile(|jit| {
        jit.load_args(&args_in_temps(&[AbiType::Pointer, AbiType::IntMax]))?;
        jit.ldxr_us(r(0), r(0), r(1))?;
        jit.retr(r(0))
    });
    let signed = compile(|jit| {
        jit.load_args(&args_in_temps(&[AbiType::Pointer, AbiType::IntMax]))?;
        jit.ld_s(r(0), Addr::Index(r(0), r(1)))?;
        jit.retr(r(0))
    });
    let halves: [u16; 3] = [0xffff, 0, 0x42];
    let base = halves.as_ptr() as i64;
    for (offset, expected_u, expected_s) in [(0, 0xffff, -1), (2, 0, 0), (4, 0x42, 0x42)] {
        assert_eq!(fn2(&unsigned)(base, offset), expected_u, "offset {offset}");
        assert_eq!(fn2(&signed)(base, offset), expected_s, "offset {offset}");
    }
}

#[test]
fn byte_store_touches_one_byte() {
    if !native_jit_supported() {
        return;
    }
    let code = compile(|jit| {
        jit.load_args(&args_in_temps(&[AbiType::Pointer, AbiType::IntMax]))?;
        jit.stxi_c(1, r(0), r(1))?;
        jit.ret()
    });
    let mut bytes = [0x11u8; 4];
    fn2(&code)(bytes.as_mut_ptr() as i64, 0x1ab);
    assert_eq!(bytes, [0x11, 0xab, 0x11, 0x11]);
}

#[test]
fn loads_extend_what_stores_truncate() {
    if !native_jit_supported() {
        return;
    }
    let cases = [
        (Opcode::StrC, Opcode::LdrC, 0x1ff80, -128),
        (Opcode::StrC, Opcode::LdrUc, 0x1ff80, 128),
        (Opcode::StrS, Opcode::LdrS, 0x18000, -32768),
        (Opcode::StrS, Opcode::LdrUs, 0x18000, 32768),
        (Opcode::StrI, Opcode::LdrI, 0x1_8000_0000, i64::from(i32::MIN)),
        (Opcode::StrI, Opcode::LdrUi, 0x1_8000_0000, 0x8000_0000),
        (Opcode::StrL, Opcode::LdrL, i64::MIN + 5, i64::MIN + 5),
    ];
    for (store, load, value, expected) in cases {
        let code = compile(|jit| {
            jit.load_args(&args_in_temps(&[AbiType::Pointer, AbiType::IntMax]))?;
            jit.emit(store, &[Arg::Gpr(r(0)), Arg::Gpr(r(1))])?;
            jit.emit(load, &[Arg::Gpr(r(0)), Arg::Gpr(r(0))])?;
            jit.retr(r(0))
        });
        let mut slot = [0u64; 2];
        let got = fn2(&code)(slot.as_mut_ptr() as i64, value);
        assert_eq!(got, expected, "{store} then {load}");
    }
}

#[test]
fn offset_forms_round_trip() {
    if !native_jit_supported() {
        return;
    }
    let cases = [
        (Opcode::StxiS, Opcode::LdxiS, 8, -2),
        (Opcode::StxiI, Opcode::LdxiUi, 12, 0xdead_beef),
        (Opcode::StxiL, Opcode::LdxiL, 4096, 0x0123_4567_89ab_cdef),
    ];
    for (store, load, offset, value) in cases {
        let code = compile(|jit| {
            jit.load_args(&args_in_temps(&[AbiType::Pointer, AbiType::IntMax]))?;
            jit.emit(store, &[Arg::Imm(offset), Arg::Gpr(r(0)), Arg::Gpr(r(1))])?;
            jit.emit(load, &[Arg::Gpr(r(0)), Arg::Gpr(r(0)), Arg::Imm(offset)])?;
            jit.retr(r(0))
        });
        let mut buffer = vec![0u8; 8192];
        let got = fn2(&code)(buffer.as_mut_ptr() as i64, value);
        assert_eq!(got, value, "{store}/{load} at {offset}");
    }
}

#[test]
fn absolute_loads_read_fixed_addresses() {
    if !native_jit_supported() {
        return;
    }
    let cell = Box::new(0x5a5a_i64);
    let address = &*cell as *const i64 as i64;
    let code = compile(|jit| {
        jit.emit(Opcode::LdiL, &[Arg::Gpr(r(0)), Arg::Imm(address)])?;
        jit.retr(r(0))
    });
    let call = unsafe { code.entry_as::<Fn0>() };
    assert_eq!(call(), 0x5a5a);
}

#[test]
fn doubles_store_and_return() {
    if !native_jit_supported() {
        return;
    }
    let code = compile(|jit| {
        jit.load_args(&args_in_temps(&[AbiType::Pointer]))?;
        jit.movi_d(f(0), 2.5)?;
        jit.stxi_d(8, r(0), f(0))?;
        jit.ldxi_d(f(1), r(0), 8)?;
        jit.addr_d(f(1), f(1), f(0))?;
        jit.retr_d(f(1))
    });
    let mut slots = [0f64; 2];
    let call = unsafe { code.entry_as::<extern "C" fn(*mut f64) -> f64>() };
    assert_eq!(call(slots.as_mut_ptr()), 5.0);
    assert_eq!(slots[1], 2.5);
}

#[test]
fn integer_division_through_doubles() {
    if !native_jit_supported() {
        return;
    }
    let code = compile(|jit| {
        jit.load_args(&args_in_temps(&[AbiType::IntMax, AbiType::IntMax]))?;
        jit.extr_d(f(0), r(0))?;
        jit.extr_d(f(1), r(1))?;
        jit.divr_d(f(0), f(0), f(1))?;
        jit.truncr_d_l(r(0), f(0))?;
        jit.retr(r(0))
    });
    assert_eq!(fn2(&code)(7, 2), 3);
    assert_eq!(fn2(&code)(-9, 2), -4);
}

/// `(pointer, pointer, intmax)`: the word at `a + offset` plus the word at `b`.
#[test]
fn pointer_offset_sum_matches_native() {
    if !native_jit_supported() {
        return;
    }
    let code = compile(|jit| {
        let args = [
            jit.describe_argument(0, AbiType::Pointer, Location::Gpr(r(0)))?,
            jit.describe_argument(1, AbiType::Pointer, Location::Gpr(r(1)))?,
            jit.describe_argument(2, AbiType::IntMax, Location::Gpr(r(2)))?,
        ];
        jit.load_args(&args)?;
        jit.ldxr_l(r(0), r(0), r(2))?;
        jit.ldr_l(r(1), r(1))?;
        jit.addr(r(0), r(0), r(1))?;
        jit.retr(r(0))
    });
    let native = |a: &[i64], b: &i64, offset: usize| a[offset / 8] + *b;
    let a = [10i64, 20, 30];
    let b = 5i64;
    let call = unsafe { code.entry_as::<extern "C" fn(*const i64, *const i64, i64) -> i64>() };
    for offset in [0usize, 8, 16] {
        assert_eq!(call(a.as_ptr(), &b, offset as i64), native(&a[..], &b, offset));
    }
}

#[test]
fn carries_chain_into_the_high_word() {
    if !native_jit_supported() {
        return;
    }
    let types = [AbiType::IntMax; 4];
    let add = compile(|jit| {
        jit.load_args(&args_in_temps(&types))?;
        jit.addcr(r(0), r(0), r(2))?;
        jit.addxr(r(1), r(1), r(3))?;
        jit.retr(r(1))
    });
    let sub = compile(|jit| {
        jit.load_args(&args_in_temps(&types))?;
        jit.subcr(r(0), r(0), r(2))?;
        jit.subxr(r(1), r(1), r(3))?;
        jit.retr(r(1))
    });
    type Fn4 = extern "C" fn(i64, i64, i64, i64) -> i64;
    let add = unsafe { add.entry_as::<Fn4>() };
    let sub = unsafe { sub.entry_as::<Fn4>() };
    assert_eq!(add(-1, 0, 1, 0), 1);
    assert_eq!(add(1, 7, 1, 0), 7);
    assert_eq!(sub(0, 1, 1, 0), 0);
    assert_eq!(sub(5, 1, 1, 0), 1);
}

#[test]
fn remainder_and_division_follow_rust() {
    if !native_jit_supported() {
        return;
    }
    let div = compile(|jit| {
        jit.load_args(&args_in_temps(&[AbiType::IntMax, AbiType::IntMax]))?;
        jit.divr(r(2), r(0), r(1))?;
        jit.remr(r(0), r(0), r(1))?;
        jit.muli(r(2), r(2), 1000)?;
        jit.addr(r(0), r(0), r(2))?;
        jit.retr(r(0))
    });
    for (a, b) in [(17i64, 5i64), (-17, 5), (17, -5), (100, 7)] {
        assert_eq!(fn2(&div)(a, b), (a / b) * 1000 + a % b, "{a} / {b}");
    }
}

const VALUES: [i64; 8] = [
    i64::MIN,
    -0x8000_0000,
    -1,
    0,
    1,
    0x7fff_ffff,
    0x8000_0000,
    i64::MAX,
];

fn taken(op: Opcode, a: i64, b: i64) -> bool {
    use Opcode::*;
    let (ua, ub) = (a as u64, b as u64);
    match op {
        Bltr | Blti => a < b,
        BltrU | BltiU => ua < ub,
        Bler | Blei => a <= b,
        BlerU | BleiU => ua <= ub,
        Beqr | Beqi => a == b,
        Bger | Bgei => a >= b,
        BgerU | BgeiU => ua >= ub,
        Bgtr | Bgti => a > b,
        BgtrU | BgtiU => ua > ub,
        Bner | Bnei => a != b,
        Bmsr | Bmsi => a & b != 0,
        Bmcr | Bmci => a & b == 0,
        Boaddr | Boaddi => a.checked_add(b).is_none(),
        BoaddrU | BoaddiU => ua.checked_add(ub).is_none(),
        Bxaddr | Bxaddi => a.checked_add(b).is_some(),
        BxaddrU | BxaddiU => ua.checked_add(ub).is_some(),
        Bosubr | Bosubi => a.checked_sub(b).is_none(),
        BosubrU | BosubiU => ua < ub,
        Bxsubr | Bxsubi => a.checked_sub(b).is_some(),
        BxsubrU | BxsubiU => ua >= ub,
        other => panic!("{other} is not an integer branch"),
    }
}

/// Returns 1 when the branch is taken. `backward` binds the target before
/// the branch is emitted.
fn branch_fn(backward: bool, emit: impl Fn(&mut JitState<HostTarget>, Label) -> JitResult<()>) -> CompiledCode {
    compile(|jit| {
        jit.load_args(&args_in_temps(&[AbiType::IntMax, AbiType::IntMax]))?;
        if backward {
            let start = jit.new_label();
            jit.jmp(start)?;
            let target = jit.here()?;
            jit.reti(1)?;
            jit.bind(start)?;
            emit(jit, target)?;
            jit.reti(0)
        } else {
            let target = jit.new_label();
            emit(jit, target)?;
            jit.reti(0)?;
            jit.bind(target)?;
            jit.reti(1)
        }
    })
}

fn branch_ops(signature: jit::Signature) -> Vec<Opcode> {
    Opcode::ALL
        .iter()
        .copied()
        .filter(|op| op.signature() == signature)
        .collect()
}

#[test]
fn register_branches_in_both_binding_orders() {
    if !native_jit_supported() {
        return;
    }
    for op in branch_ops(jit::Signature::BranchR) {
        for backward in [false, true] {
            let code = branch_fn(backward, |jit, target| {
                jit.emit(op, &[Arg::Gpr(r(0)), Arg::Gpr(r(1)), Arg::Label(target)])
            });
            for a in VALUES {
                for b in VALUES {
                    assert_eq!(
                        fn2(&code)(a, b) == 1,
                        taken(op, a, b),
                        "{op} {a} {b} backward={backward}"
                    );
                }
            }
        }
    }
}

#[test]
fn immediate_branches_in_both_binding_orders() {
    if !native_jit_supported() {
        return;
    }
    for op in branch_ops(jit::Signature::BranchI) {
        for backward in [false, true] {
            for b in VALUES {
                let code = branch_fn(backward, |jit, target| {
                    jit.emit(op, &[Arg::Gpr(r(0)), Arg::Imm(b), Arg::Label(target)])
                });
                for a in VALUES {
                    assert_eq!(
                        fn2(&code)(a, 0) == 1,
                        taken(op, a, b),
                        "{op} {a} {b} backward={backward}"
                    );
                }
            }
        }
    }
}

#[test]
fn branches_reach_across_short_form_limits() {
    if !native_jit_supported() {
        return;
    }
    for padding in [0usize, 20, 24, 25, 26, 31, 32, 33, 64, 300] {
        for backward in [false, true] {
            let pad = |jit: &mut JitState<HostTarget>| -> JitResult<()> {
                for _ in 0..padding {
                    jit.movi(r(2), 0x1234)?;
                }
                Ok(())
            };
            let code = branch_fn(backward, |jit, target| {
                if backward {
                    pad(jit)?;
                    jit.beqi(r(0), 3, target)
                } else {
                    jit.beqi(r(0), 3, target)?;
                    pad(jit)
                }
            });
            assert_eq!(fn2(&code)(3, 0), 1, "padding {padding} backward={backward}");
            assert_eq!(fn2(&code)(4, 0), 0, "padding {padding} backward={backward}");
        }
    }
}

#[test]
fn float_branches_see_unordered_operands() {
    if !native_jit_supported() {
        return;
    }
    let cases = [
        (Opcode::BltrD, 1.0, 2.0, true),
        (Opcode::BltrD, f64::NAN, 2.0, false),
        (Opcode::BeqrD, 2.0, 2.0, true),
        (Opcode::BeqrD, f64::NAN, f64::NAN, false),
        (Opcode::BnerD, f64::NAN, 1.0, true),
        (Opcode::BnerD, 1.0, 1.0, false),
        (Opcode::BunordrD, f64::NAN, 1.0, true),
        (Opcode::BunordrD, 1.0, 1.0, false),
        (Opcode::BordrD, 1.0, 3.0, true),
        (Opcode::BgerD, 3.0, 3.0, true),
    ];
    for (op, a, b, expected) in cases {
        let code = compile(|jit| {
            jit.load_args(&args_in_temps(&[AbiType::Float64, AbiType::Float64]))?;
            let target = jit.new_label();
            jit.emit(op, &[Arg::Fpr(f(0)), Arg::Fpr(f(1)), Arg::Label(target)])?;
            jit.reti(0)?;
            jit.bind(target)?;
            jit.reti(1)
        });
        let call = unsafe { code.entry_as::<extern "C" fn(f64, f64) -> i64>() };
        assert_eq!(call(a, b) == 1, expected, "{op} {a} {b}");
    }
}

#[test]
fn label_addresses_feed_indirect_jumps() {
    if !native_jit_supported() {
        return;
    }
    let forward = compile(|jit| {
        let target = jit.new_label();
        jit.mov_addr(r(0), target)?;
        jit.jmpr(r(0))?;
        jit.reti(0)?;
        jit.bind(target)?;
        jit.reti(7)
    });
    let call = unsafe { forward.entry_as::<Fn0>() };
    assert_eq!(call(), 7);

    let backward = compile(|jit| {
        let start = jit.new_label();
        jit.jmp(start)?;
        let target = jit.here()?;
        jit.reti(9)?;
        jit.bind(start)?;
        jit.mov_addr(r(0), target)?;
        jit.jmpr(r(0))
    });
    let call = unsafe { backward.entry_as::<Fn0>() };
    assert_eq!(call(), 9);
}

#[test]
fn compare_and_set_yields_zero_or_one() {
    if !native_jit_supported() {
        return;
    }
    let code = compile(|jit| {
        jit.load_args(&args_in_temps(&[AbiType::IntMax, AbiType::IntMax]))?;
        jit.ltr(r(2), r(0), r(1))?;
        jit.gei_u(r(0), r(0), 10)?;
        jit.lshi(r(0), r(0), 1)?;
        jit.orr(r(0), r(0), r(2))?;
        jit.retr(r(0))
    });
    assert_eq!(fn2(&code)(3, 4), 0b01);
    assert_eq!(fn2(&code)(11, 4), 0b10);
    assert_eq!(fn2(&code)(-1, 0), 0b11);
}
