//! Live stacked-hook repair test: a hand-installed "foreign" hook (one this
//! crate did not create) keeps working underneath an engine hook, including
//! its trampoline's resume jump into the overwritten prologue.

#![cfg(all(target_arch = "x86_64", unix))]

use std::sync::atomic::{AtomicUsize, Ordering};

use hookstack::code::{jmp_abs, jmp_rel32};
use hookstack::{BufferPool, CallingConvention, HookEngine, HookOptions, Patch};

/// Emits `f(a, b) = a + b` with an instruction boundary exactly five bytes
/// in, so a classic 5-byte detour can displace a clean window:
/// mov rax, rdi; push rax; pop rax; add rax, rsi; ret, then int3 padding.
fn emit_target(pool: &BufferPool) -> usize {
    let mut buffer = pool.allocate(emit_target as usize, 64).unwrap();
    buffer.align(16);
    let f = buffer.write(&[
        0x48, 0x89, 0xf8, // mov rax, rdi
        0x50, // push rax
        0x58, // pop rax
        0x48, 0x01, 0xf0, // add rax, rsi
        0xc3, // ret
    ]);
    buffer.write(&[0xcc; 16]);
    std::mem::forget(buffer);
    f
}

fn call2(f: usize, a: u64, b: u64) -> u64 {
    let f: extern "sysv64" fn(u64, u64) -> u64 = unsafe { std::mem::transmute(f) };
    f(a, b)
}

/// Builds a foreign-style hook by hand: a detour that calls its trampoline
/// and adds 7, and a trampoline holding the displaced 5 bytes plus a resume
/// jump back into the function. Returns (detour, activation patch).
fn build_foreign_hook(pool: &BufferPool, target: usize) -> (usize, Patch) {
    let mut buffer = pool.allocate(target, 128).unwrap();
    buffer.align(16);
    let detour = buffer.current();

    // the trampoline will sit 32 bytes in; call it directly
    let trampoline = detour + 32;
    // sub rsp, 8
    buffer.write(&[0x48, 0x83, 0xec, 0x08]);
    // call trampoline (rel32)
    let next = buffer.current() + 5;
    buffer.write(&[0xe8]);
    buffer.write(&((trampoline as i64 - next as i64) as i32).to_le_bytes());
    // add rsp, 8; add rax, 7; ret
    buffer.write(&[0x48, 0x83, 0xc4, 0x08]);
    buffer.write(&[0x48, 0x83, 0xc0, 0x07]);
    buffer.write(&[0xc3]);

    // nop padding up to the trampoline slot
    buffer.write(&[0x90; 14]);
    assert_eq!(buffer.current(), trampoline);
    // displaced window: mov rax, rdi; push rax; pop rax
    buffer.write(&[0x48, 0x89, 0xf8, 0x50, 0x58]);
    // resume into the live function past the displaced bytes
    let resume_jump = jmp_rel32(buffer.current(), target + 5).unwrap();
    buffer.write(&resume_jump);
    std::mem::forget(buffer);

    let activation = jmp_rel32(target, detour).unwrap().to_vec();
    (detour, Patch::new(target, activation))
}

static ORIGINAL: AtomicUsize = AtomicUsize::new(0);

extern "sysv64" fn detour(a: u64, b: u64) -> u64 {
    call2(ORIGINAL.load(Ordering::Relaxed), a, b) + 1000
}

#[test]
fn foreign_hook_survives_stacking() {
    let engine = HookEngine::new().unwrap();
    let target = emit_target(engine.pool());
    assert_eq!(call2(target, 2, 3), 5);

    // a third party hooks the function first
    let (foreign_detour, activation) = build_foreign_hook(engine.pool(), target);
    unsafe { activation.apply().unwrap() };
    assert_eq!(call2(target, 2, 3), 12);

    // force the wide jump so our window swallows the foreign resume point
    let options = HookOptions {
        prefer_relative_jump: false,
        ..Default::default()
    };
    let hook = engine
        .create_hook(
            detour as usize,
            target,
            &CallingConvention::host(),
            2,
            &options,
        )
        .unwrap();
    assert!(hook.is_stacked());
    ORIGINAL.store(hook.original(), Ordering::Relaxed);

    // the trampoline starts with the foreign detour frozen in absolute form
    let head = unsafe { std::slice::from_raw_parts(hook.trampoline() as *const u8, 14) };
    assert_eq!(head, &jmp_abs(foreign_detour));

    let active = unsafe { hook.activate().unwrap() };

    // both layers run: ((a + b) + 7 from the foreign hook) + 1000 from ours
    assert_eq!(call2(target, 2, 3), 1012);

    // disabled, the foreign hook alone is still intact
    unsafe { active.disable().unwrap() };
    assert_eq!(call2(target, 2, 3), 12);

    unsafe { active.enable().unwrap() };
    assert_eq!(call2(target, 2, 3), 1012);
}
