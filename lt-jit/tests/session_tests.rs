#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

mod common;

use common::*;
use jit::{Aarch64, ExecutableCode, JitConfig, X86_64};

#[test]
fn fixed_arena_runs_out_and_poisons_the_session() {
    let mut jit = JitState::begin(host(), Arena::fixed(64).expect("arena")).expect("begin");
    let mut failure = None;
    for _ in 0..100_000 {
        if let Err(err) = jit.movi(r(0), 0x0123_4567_89ab_cdef) {
            failure = Some(err);
            break;
        }
    }
    let failure = failure.expect("a fixed arena fills up");
    assert!(matches!(failure, JitError::OutOfSpace { .. }), "{failure}");
    assert!(jit.is_poisoned());
    assert_eq!(jit.ret(), Err(JitError::Abandoned));
    assert_eq!(jit.end().map(|_| ()), Err(failure));
}

#[test]
fn growable_arena_keeps_code_valid_while_moving() {
    let config = JitConfig {
        arena_bytes: 64,
        ..JitConfig::default()
    };
    let mut jit = JitState::with_config(host(), &config).expect("begin");
    jit.load_args(&args_in_temps(&[AbiType::IntMax])).expect("args");
    let done = jit.new_label();
    // Early forward branch patched after several arena moves.
    jit.beqi(r(0), -1, done).expect("branch");
    for _ in 0..2000 {
        jit.addi(r(0), r(0), 1).expect("addi");
    }
    jit.bind(done).expect("bind");
    jit.retr(r(0)).expect("ret");
    let code = jit.end().expect("end");
    assert!(code.len() > 4096);
    if native_jit_supported() {
        assert_eq!(fn1(&code)(5), 2005);
        assert_eq!(fn1(&code)(-1), -1);
    }
}

#[test]
fn unbound_label_fails_finalization() {
    let mut jit = session();
    let missing = jit.new_label();
    jit.jmp(missing).expect("jmp");
    jit.ret().expect("ret");
    assert_eq!(
        jit.end().map(|_| ()),
        Err(JitError::UnboundLabelAtFinalize(missing))
    );
}

#[test]
fn binding_twice_is_an_error() {
    let mut jit = session();
    let label = jit.here().expect("here");
    assert_eq!(jit.bind(label), Err(JitError::LabelAlreadyBound(label)));
}

#[test]
fn popcnt_depends_on_the_cpu_feature() {
    let mut plain = JitState::begin(X86_64::sysv(), Arena::new(4096).expect("arena")).expect("begin");
    let err = plain.popcntr(jit::Gpr(0), jit::Gpr(1)).expect_err("no popcnt");
    assert!(
        matches!(err, JitError::UnsupportedOnTarget { opcode: Opcode::Popcntr, .. }),
        "{err}"
    );

    let mut extended = JitState::begin(
        X86_64::sysv().with_popcnt(true),
        Arena::new(4096).expect("arena"),
    )
    .expect("begin");
    extended.popcntr(jit::Gpr(0), jit::Gpr(1)).expect("popcnt");
    extended.ret().expect("ret");
    let code = extended.end().expect("end");
    // popcnt rax, rcx; ret
    assert_eq!(code.bytes(), &[0xF3, 0x48, 0x0F, 0xB8, 0xC1, 0xC3]);
}

#[test]
fn population_count_on_the_host() {
    if !native_jit_supported() {
        return;
    }
    let mut jit = session();
    jit.load_args(&args_in_temps(&[AbiType::IntMax])).expect("args");
    match jit.popcntr(r(0), r(0)) {
        Ok(()) => {}
        Err(JitError::UnsupportedOnTarget { .. }) => return,
        Err(err) => panic!("{err}"),
    }
    jit.retr(r(0)).expect("ret");
    let code = jit.end().expect("end");
    for value in [0i64, 1, 0xff, -1, 0x5555_0000_0000_0001] {
        assert_eq!(fn1(&code)(value), i64::from(value.count_ones()));
    }
}

#[test]
fn foreign_targets_compile_without_running() {
    let mut arm = JitState::begin(Aarch64::aapcs64(), Arena::new(4096).expect("arena")).expect("begin");
    let top = arm.here().expect("here");
    arm.subi(jit::Gpr(0), jit::Gpr(0), 1).expect("subi");
    arm.bnei(jit::Gpr(0), 0, top).expect("bnei");
    arm.ret().expect("ret");
    let code = arm.end().expect("end");
    assert_eq!(code.len() % 4, 0);
    assert_eq!(code.target(), "aarch64-aapcs64");
    assert_eq!(code.label_offset(top), Some(0));

    let mut win = JitState::begin(X86_64::win64(), Arena::new(4096).expect("arena")).expect("begin");
    win.enter_jit_abi(1, 1, 0).expect("enter");
    win.ret().expect("ret");
    let code = win.end().expect("end");
    assert_eq!(code.target(), "x86_64-win64");
    assert_eq!(code.bytes().last(), Some(&0xC3));
}

#[test]
fn sessions_compile_on_many_threads() {
    let handles: Vec<_> = (0..4i64)
        .map(|n| {
            std::thread::spawn(move || {
                compile(|jit| {
                    jit.load_args(&args_in_temps(&[AbiType::IntMax]))?;
                    jit.muli(r(0), r(0), n + 2)?;
                    jit.retr(r(0))
                })
            })
        })
        .collect();
    for (n, handle) in handles.into_iter().enumerate() {
        let code = handle.join().expect("thread");
        if native_jit_supported() {
            assert_eq!(fn1(&code)(10), 10 * (n as i64 + 2));
        }
    }
}

#[test]
fn leaked_code_outlives_its_owner() {
    let code = compile(|jit| jit.reti(17));
    let entry = code.entry();
    let raw = code.leak();
    assert_eq!(raw.ptr as *const u8, entry);
    if native_jit_supported() {
        let call: Fn0 = unsafe { std::mem::transmute::<*mut u8, Fn0>(raw.ptr) };
        assert_eq!(call(), 17);
    }
    let reclaimed = unsafe { ExecutableCode::from_raw(raw) };
    assert_eq!(reclaimed.len(), raw.len);
}

#[test]
fn label_addresses_follow_the_final_location() {
    let mut jit = session();
    let start = jit.here().expect("here");
    jit.movi(r(0), 1).expect("movi");
    let tail = jit.here().expect("here");
    jit.ret().expect("ret");
    let code = jit.end().expect("end");
    assert_eq!(code.label_address(start), Some(code.entry()));
    let offset = code.label_offset(tail).expect("bound");
    assert_eq!(code.label_address(tail), Some(code.entry().wrapping_add(offset)));
    assert_eq!(code.labels().len(), 2);
}

#[test]
fn reports_serialize_to_json() {
    let mut jit = session();
    jit.reti(0).expect("reti");
    let report = jit.end().expect("end").report();
    let json = serde_json::to_value(&report).expect("json");
    assert_eq!(json["target"], host().conv().name);
    assert!(json["code_len"].as_u64().expect("len") > 0);
    assert!(json["bytes"].as_str().expect("hex").len() >= 2);
}
