#![allow(dead_code, unused_imports)]

pub use jit::{
    AbiType, Addr, Arena, Assembly, CompiledCode, Fpr, Gpr, HostTarget, JitError, JitResult,
    JitState, Label, Location, Opcode, Operand, Target, assemble, host,
};

/// Generated code only runs where the build host is a shipped target.
pub fn native_jit_supported() -> bool {
    (cfg!(target_arch = "x86_64") && (cfg!(unix) || cfg!(windows)))
        || (cfg!(target_arch = "aarch64")
            && (cfg!(target_os = "linux") || cfg!(target_os = "macos")))
}

/// The n-th caller-saved general register of the host convention.
pub fn r(n: usize) -> Gpr {
    host().conv().caller_saved_gprs[n]
}

/// The n-th callee-saved general register of the host convention.
pub fn v(n: usize) -> Gpr {
    host().conv().callee_saved_gprs[n]
}

/// The n-th caller-saved float register of the host convention.
pub fn f(n: usize) -> Fpr {
    host().conv().caller_saved_fprs[n]
}

pub fn session() -> JitState<HostTarget> {
    JitState::begin(host(), Arena::new(4096).expect("arena")).expect("begin")
}

/// Builds and finalizes one host function.
pub fn compile(build: impl FnOnce(&mut JitState<HostTarget>) -> JitResult<()>) -> CompiledCode {
    let mut jit = session();
    build(&mut jit).expect("emit");
    jit.end().expect("end")
}

/// `ty` arguments arriving in `r0`, `r1`, ...
pub fn args_in_temps(types: &[AbiType]) -> Vec<Operand> {
    types
        .iter()
        .enumerate()
        .map(|(index, ty)| {
            if ty.is_float() {
                Operand::fpr(*ty, f(index))
            } else {
                Operand::gpr(*ty, r(index))
            }
        })
        .collect()
}

pub fn assemble_host(source: &str) -> Assembly {
    assemble(host(), Arena::new(4096).expect("arena"), source).expect("assemble")
}

pub type Fn0 = extern "C" fn() -> i64;
pub type Fn1 = extern "C" fn(i64) -> i64;
pub type Fn2 = extern "C" fn(i64, i64) -> i64;
pub type Fn3 = extern "C" fn(i64, i64, i64) -> i64;

pub fn fn1(code: &CompiledCode) -> Fn1 {
    unsafe { code.entry_as::<Fn1>() }
}

pub fn fn2(code: &CompiledCode) -> Fn2 {
    unsafe { code.entry_as::<Fn2>() }
}

pub fn fn3(code: &CompiledCode) -> Fn3 {
    unsafe { code.entry_as::<Fn3>() }
}
