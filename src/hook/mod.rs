//! # The hook engine
//!
//! [`HookEngine`] owns the resources hooks are built from (the executable
//! buffer pool and a module snapshot) and turns a target address plus a
//! detour into an installable [`Hook`].
//!
//! Construction and installation are separate steps with separate types:
//! building a [`Hook`] writes only into engine-owned buffers and can fail
//! cleanly, while [`Hook::activate`] consumes the hook, performs the writes
//! into the target, and yields an [`ActiveHook`]. Enabling and disabling an
//! active hook never touches the target's code again; the entry stub jumps
//! through an 8-byte pointer cell and the toggles rewrite only that cell.
//!
//! A target that is already hooked by someone else is handled by the
//! function patcher: its live bytes are treated as the function to preserve,
//! and the foreign trampoline's resume jump is redirected into our relocated
//! copy. Hook stacking therefore composes in any order of installation.

use std::io;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use crate::alloc::{AllocError, BufferPool, CodeBuffer};
use crate::code;
use crate::mem::{LiveMemory, MemoryError, MemorySource};
use crate::modules::ModuleMap;
use crate::patch::Patch;
use crate::patcher::{FunctionPatcher, PatchError, PatcherOptions};
use crate::range::AddressRange;
use crate::relocate::{self, RelocateError};
use crate::wrapper::{self, CallingConvention, WrapperError};

pub mod asmhook;

pub use asmhook::AsmHookBehavior;

/// Bytes read from the target to find an instruction boundary for the hook
/// window. Generous: the longest jump plus a few maximum-length instructions.
pub(crate) const PROBE_LEN: usize = 32 + code::JMP_ABS_SIZE;

/// Per-hook options.
#[derive(Debug, Clone)]
pub struct HookOptions {
    /// Install a 5-byte relative jump when the entry stub is in rel32 range,
    /// falling back to the 14-byte absolute form otherwise
    pub prefer_relative_jump: bool,
    /// Overwrite at least this many bytes of the target, regardless of the
    /// jump form chosen. The window still ends on an instruction boundary.
    pub min_hook_length: Option<usize>,
    /// Forwarded to the function patcher's resume-jump search
    pub search_in_modules: bool,
    /// Forwarded to the function patcher's foreign-jump classification
    pub verify_jump_targets_module: bool,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            prefer_relative_jump: true,
            min_hook_length: None,
            search_in_modules: false,
            verify_jump_targets_module: true,
        }
    }
}

/// Errors raised while constructing or installing a hook
#[derive(Debug, Error)]
pub enum HookError {
    /// No executable buffer could be placed for the hook
    #[error("buffer allocation failed: {0}")]
    Alloc(#[from] AllocError),
    /// The target's prologue could not be decoded or re-encoded
    #[error("relocation failed: {0}")]
    Relocate(#[from] RelocateError),
    /// Prologue analysis or stacked-hook repair failed
    #[error("function patching failed: {0}")]
    Patcher(#[from] PatchError),
    /// Wrapper generation failed
    #[error("wrapper generation failed: {0}")]
    Wrapper(#[from] WrapperError),
    /// Custom assembly could not be encoded
    #[error("assembly failed: {0}")]
    Assemble(#[from] iced_x86::IcedError),
    /// A write to process memory failed
    #[error("memory write failed: {0}")]
    Memory(#[from] MemoryError),
    /// The module snapshot could not be taken
    #[error("module enumeration failed: {0}")]
    Modules(#[from] io::Error),
    /// The target address is not readable code
    #[error("target {address:#x} is not readable")]
    UnreadableTarget {
        /// The faulting target address
        address: usize,
    },
}

/// Builds hooks and owns the memory they execute from.
pub struct HookEngine {
    /// Near-address executable buffer pool
    pub(crate) pool: BufferPool,
    /// Module snapshot used to classify foreign jump targets
    pub(crate) modules: ModuleMap,
    /// Serializes hook construction; two concurrent builds against the same
    /// target would read each other's half-installed state
    pub(crate) build_lock: Mutex<()>,
}

impl HookEngine {
    /// Creates an engine with a fresh snapshot of the loaded modules.
    pub fn new() -> Result<Self, HookError> {
        Ok(Self::with_modules(ModuleMap::current()?))
    }

    /// Creates an engine over an explicit module set.
    pub fn with_modules(modules: ModuleMap) -> Self {
        Self {
            pool: BufferPool::new(),
            modules,
            build_lock: Mutex::new(()),
        }
    }

    /// The engine's buffer pool, for callers generating companion code that
    /// must live as long as the hooks.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Builds a hook redirecting `target` to `detour`.
    ///
    /// `convention` describes how `target`'s callers pass their `param_count`
    /// integer parameters. When it differs from the host convention the
    /// engine emits a reverse wrapper in front of the detour and a forward
    /// wrapper around the trampoline, so both the detour and the
    /// [`original`](ActiveHook::original) callable are plain host-convention
    /// functions. Nothing is written to the target until
    /// [`Hook::activate`].
    pub fn create_hook(
        &self,
        detour: usize,
        target: usize,
        convention: &CallingConvention,
        param_count: usize,
        options: &HookOptions,
    ) -> Result<Hook, HookError> {
        let _guard = self.build_lock.lock().unwrap_or_else(|e| e.into_inner());

        let probe = self.probe(target)?;
        let size = 0x100 + 2 * wrapper::size_bound(param_count);
        let mut buffer = self.allocate_near(target, size)?;

        // entry stub first: its address decides the jump form at the target
        let entry = buffer.write(&code::jmp_abs(0));
        let slot = entry + 6;
        let jump = code::encode_jump(target, entry, options.prefer_relative_jump);
        let min = jump.len().max(options.min_hook_length.unwrap_or(0));
        let hook_len = relocate::aligned_length(&probe, min)?;
        let window = &probe[..hook_len];
        log::debug!(
            "hooking {target:#x}: {hook_len} byte window, {} byte jump, entry {entry:#x}",
            jump.len()
        );

        let detour_entry =
            wrapper::emit_reverse_wrapper(&mut buffer, detour, convention, param_count)?;

        buffer.align(16);
        let trampoline = buffer.current();
        let function_patch =
            FunctionPatcher::new(&LiveMemory, &self.modules, self.patcher_options(options))
                .patch(window, target, trampoline, target + hook_len)?;
        buffer.write(&function_patch.relocated.bytes);
        let stacked = function_patch.is_stacked();
        if stacked {
            log::info!(
                "target {target:#x} is already hooked ({} foreign patch(es))",
                function_patch.foreign_patches.len()
            );
        }

        let original =
            wrapper::emit_forward_wrapper(&mut buffer, trampoline, convention, param_count)?;

        let mut activation = jump;
        activation.extend_from_slice(&code::nops(hook_len - activation.len()));

        Ok(Hook {
            target,
            activation: Patch::new(target, activation),
            foreign_patches: function_patch.foreign_patches,
            enable: Patch::new(slot, (detour_entry as u64).to_le_bytes().to_vec()),
            disable: Patch::new(slot, (trampoline as u64).to_le_bytes().to_vec()),
            trampoline,
            original,
            stacked,
            buffer,
        })
    }

    /// Reads the prologue probe window, shrinking it when the target sits at
    /// the end of a mapping.
    pub(crate) fn probe(&self, target: usize) -> Result<Vec<u8>, HookError> {
        LiveMemory
            .read(target, PROBE_LEN)
            .or_else(|| LiveMemory.read(target, code::JMP_ABS_SIZE + code::JMP_REL32_SIZE))
            .ok_or(HookError::UnreadableTarget { address: target })
    }

    /// Allocates a code buffer near `target`, falling back to anywhere in
    /// the address space when nothing is mappable in rel32 range.
    pub(crate) fn allocate_near(&self, target: usize, size: usize) -> Result<CodeBuffer, HookError> {
        match self.pool.allocate(target, size) {
            Ok(buffer) => Ok(buffer),
            Err(AllocError::OutOfRange) | Err(AllocError::OutOfMemory) => {
                log::debug!("no buffer in rel32 range of {target:#x}, allocating far");
                let anywhere = AddressRange::new(0x10000, 0x7fff_ffff_ffff);
                Ok(self.pool.allocate_in_range(size, anywhere, 1)?)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Patcher options derived from per-hook options.
    pub(crate) fn patcher_options(&self, options: &HookOptions) -> PatcherOptions {
        PatcherOptions {
            search_in_modules: options.search_in_modules,
            verify_jump_targets_module: options.verify_jump_targets_module,
        }
    }
}

/// A fully constructed hook that has not touched the target yet.
///
/// Dropping it abandons the stubs and returns the buffer to the pool;
/// nothing outside the engine references them until activation.
pub struct Hook {
    /// Address being hooked
    target: usize,
    /// The jump written over the target's prologue, nop padded
    activation: Patch,
    /// Repairs for any foreign hook's resume jumps
    foreign_patches: Vec<Patch>,
    /// Slot write that routes the entry stub to the detour
    enable: Patch,
    /// Slot write that routes the entry stub to the trampoline
    disable: Patch,
    /// Address of the relocated prologue
    trampoline: usize,
    /// Host-convention callable running the original function
    original: usize,
    /// Whether a foreign hook was found on the target
    stacked: bool,
    /// Backing storage for every stub above
    buffer: CodeBuffer,
}

impl Hook {
    /// The hooked address.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Address of the relocated prologue followed by a jump into the rest of
    /// the function. Calling it executes the original, under the target's
    /// own convention.
    pub fn trampoline(&self) -> usize {
        self.trampoline
    }

    /// Host-convention callable executing the original function.
    pub fn original(&self) -> usize {
        self.original
    }

    /// Whether the target already carried another hook.
    pub fn is_stacked(&self) -> bool {
        self.stacked
    }

    /// The patch that will be written over the target on activation.
    pub fn activation(&self) -> &Patch {
        &self.activation
    }

    /// Installs the hook, consuming it.
    ///
    /// Write order: the entry stub's pointer cell is initialized first, then
    /// the foreign repairs, then the jump over the target, so no thread can
    /// reach an uninitialized stub. The hook comes up enabled.
    ///
    /// # Safety
    ///
    /// The target must be the entry of a function matching the convention
    /// and parameter count the hook was built with, and rewriting its first
    /// bytes while other threads may execute them is inherently racy; the
    /// caller accepts that window.
    pub unsafe fn activate(self) -> Result<ActiveHook, HookError> {
        self.enable.apply()?;
        for patch in &self.foreign_patches {
            patch.apply()?;
        }
        self.activation.apply()?;
        log::info!("hook active at {:#x}", self.target);
        Ok(ActiveHook {
            target: self.target,
            enable: self.enable,
            disable: self.disable,
            enabled: AtomicBool::new(true),
            trampoline: self.trampoline,
            original: self.original,
            _buffer: ManuallyDrop::new(self.buffer),
        })
    }
}

/// An installed hook.
///
/// There is deliberately no removal: the jump over the target stays for the
/// process lifetime and the stubs are never reclaimed, because in-flight
/// calls (and other hooks stacked on top later) may reference them at any
/// time. Disabling routes every call straight to the trampoline instead of
/// the detour.
pub struct ActiveHook {
    /// Address being hooked
    target: usize,
    /// Slot write routing to the detour
    enable: Patch,
    /// Slot write routing to the trampoline
    disable: Patch,
    /// Current routing state
    enabled: AtomicBool,
    /// Address of the relocated prologue
    trampoline: usize,
    /// Host-convention callable executing the original function
    original: usize,
    /// Stub storage, intentionally never dropped
    _buffer: ManuallyDrop<CodeBuffer>,
}

impl ActiveHook {
    /// The hooked address.
    pub fn target(&self) -> usize {
        self.target
    }

    /// See [`Hook::trampoline`].
    pub fn trampoline(&self) -> usize {
        self.trampoline
    }

    /// See [`Hook::original`].
    pub fn original(&self) -> usize {
        self.original
    }

    /// Whether calls currently route to the detour.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Routes calls to the detour. Idempotent; rewrites only the pointer
    /// cell, never the target's code.
    ///
    /// # Safety
    ///
    /// The cell rewrite is not synchronized against threads mid-jump through
    /// the entry stub; both routes must remain valid, which they are unless
    /// the caller has unmapped the detour.
    pub unsafe fn enable(&self) -> Result<(), MemoryError> {
        self.enable.apply()?;
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Routes calls to the trampoline, making the hook transparent.
    ///
    /// # Safety
    ///
    /// Same considerations as [`enable`](Self::enable).
    pub unsafe fn disable(&self) -> Result<(), MemoryError> {
        self.disable.apply()?;
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes `bytes` as a function into engine-owned memory and returns its
    /// address.
    fn emit_function(engine: &HookEngine, bytes: &[u8]) -> usize {
        let mut buffer = engine.pool().allocate(emit_function as usize, 64).unwrap();
        let address = buffer.write(bytes);
        // keep the storage out of the pool for the rest of the test process
        std::mem::forget(buffer);
        address
    }

    /// mov rax, rdi; add rax, rsi; ret
    const ADD: &[u8] = &[0x48, 0x89, 0xf8, 0x48, 0x01, 0xf0, 0xc3];

    #[test]
    /// Construction never writes to the target
    fn test_create_leaves_target_untouched() {
        let engine = HookEngine::new().unwrap();
        let target = emit_function(&engine, ADD);
        let before = unsafe { crate::mem::read_bytes(target, ADD.len()) };

        let hook = engine
            .create_hook(
                0xdead_0000,
                target,
                &CallingConvention::host(),
                2,
                &HookOptions::default(),
            )
            .unwrap();
        let after = unsafe { crate::mem::read_bytes(target, ADD.len()) };
        assert_eq!(before, after);
        assert!(!hook.is_stacked());
    }

    #[test]
    /// The activation patch is exactly the hook window: a jump padded with
    /// nops to an instruction boundary
    fn test_activation_patch_shape() {
        let engine = HookEngine::new().unwrap();
        let target = emit_function(&engine, ADD);
        let hook = engine
            .create_hook(
                0xdead_0000,
                target,
                &CallingConvention::host(),
                2,
                &HookOptions::default(),
            )
            .unwrap();

        // entry stub sits in the same pool, so the relative form fits: the
        // 5-byte jump plus one nop reaches the boundary after two 3-byte movs
        assert_eq!(hook.activation().address(), target);
        assert_eq!(hook.activation().bytes().len(), 6);
        assert_eq!(hook.activation().bytes()[0], 0xe9);
        assert_eq!(hook.activation().bytes()[5], 0x90);
    }

    #[test]
    /// The trampoline starts with the stolen window and resumes after it
    fn test_trampoline_contents() {
        let engine = HookEngine::new().unwrap();
        let target = emit_function(&engine, ADD);
        let hook = engine
            .create_hook(
                0xdead_0000,
                target,
                &CallingConvention::host(),
                2,
                &HookOptions::default(),
            )
            .unwrap();

        let trampoline = unsafe { crate::mem::read_bytes(hook.trampoline(), 11) };
        // stolen bytes: both movs (position independent)
        assert_eq!(&trampoline[..6], &ADD[..6]);
        // resume jump to target+6
        assert_eq!(trampoline[6], 0xe9);
        let disp = i32::from_le_bytes(trampoline[7..11].try_into().unwrap());
        let resume = (hook.trampoline() + 6 + 5).wrapping_add(disp as usize);
        assert_eq!(resume, target + 6);
        // same-convention hook: original is the trampoline itself
        assert_eq!(hook.original(), hook.trampoline());
    }

    #[test]
    /// Forcing the absolute jump widens the window to cover 14 bytes
    fn test_absolute_jump_window() {
        let engine = HookEngine::new().unwrap();
        // fourteen one-byte instructions before the ret
        let mut long = vec![0x50u8, 0x58]; // push rax; pop rax
        long.extend_from_slice(&[0x90; 12]);
        long.push(0xc3);
        let target = emit_function(&engine, &long);

        let options = HookOptions {
            prefer_relative_jump: false,
            ..Default::default()
        };
        let hook = engine
            .create_hook(0xdead_0000, target, &CallingConvention::host(), 0, &options)
            .unwrap();
        assert_eq!(hook.activation().bytes().len(), 14);
        assert_eq!(&hook.activation().bytes()[..2], &[0xff, 0x25]);
    }

    #[test]
    /// A requested minimum widens the window past what the jump needs
    fn test_minimum_hook_length() {
        let engine = HookEngine::new().unwrap();
        // seven bytes of code, then int3 padding for the widened window
        let mut long = ADD.to_vec();
        long.extend_from_slice(&[0xcc; 16]);
        let target = emit_function(&engine, &long);

        let options = HookOptions {
            min_hook_length: Some(10),
            ..Default::default()
        };
        let hook = engine
            .create_hook(0xdead_0000, target, &CallingConvention::host(), 2, &options)
            .unwrap();
        // 5-byte jump padded out to the 10-byte boundary
        assert_eq!(hook.activation().bytes().len(), 10);
        assert_eq!(hook.activation().bytes()[0], 0xe9);
        assert!(hook.activation().bytes()[5..].iter().all(|&b| b == 0x90));
    }

    #[test]
    fn test_unreadable_target() {
        let engine = HookEngine::new().unwrap();
        let result = engine.create_hook(
            0x1000,
            0x10,
            &CallingConvention::host(),
            0,
            &HookOptions::default(),
        );
        assert!(matches!(result, Err(HookError::UnreadableTarget { .. })));
    }
}
