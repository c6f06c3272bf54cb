//! # Raw assembly hooks
//!
//! An assembly hook splices caller-supplied machine code into a function
//! without any calling-convention marshalling: the custom code runs with
//! whatever register state the hooked location has. Code is supplied either
//! as raw position-independent bytes or assembled through an iced
//! [`CodeAssembler`] closure at its final address.
//!
//! The hook reuses the engine's entry-stub routing. Two stub sequences are
//! generated, one with the custom code and one without (the relocated
//! original only), and enable/disable flip the entry stub's pointer cell
//! between them.

use iced_x86::code_asm::CodeAssembler;
use iced_x86::IcedError;

use crate::code;
use crate::mem::LiveMemory;
use crate::patch::Patch;
use crate::patcher::FunctionPatcher;
use crate::relocate;

use super::{Hook, HookEngine, HookError, HookOptions};

/// Where the custom code runs relative to the displaced instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmHookBehavior {
    /// Custom code first, then the displaced original instructions
    ExecuteFirst,
    /// Displaced original instructions first, then the custom code
    ExecuteAfter,
    /// Only the custom code; the displaced instructions never run while the
    /// hook is enabled
    DoNotExecuteOriginal,
}

/// The two ways callers hand over custom code.
enum CustomCode<'a> {
    /// Pre-encoded bytes; must be position independent
    Bytes(&'a [u8]),
    /// Instructions assembled at their final address
    Assembler(&'a mut CodeAssembler),
}

impl CustomCode<'_> {
    /// Encoded length. The assembler form is measured at `origin`, an
    /// address near where the code will finally land, so near branches get
    /// sized realistically.
    fn measure(&mut self, origin: usize) -> Result<usize, IcedError> {
        match self {
            CustomCode::Bytes(bytes) => Ok(bytes.len()),
            CustomCode::Assembler(assembler) => Ok(assembler.assemble(origin as u64)?.len()),
        }
    }

    /// Final encoding at `address`.
    fn render(&mut self, address: usize) -> Result<Vec<u8>, IcedError> {
        match self {
            CustomCode::Bytes(bytes) => Ok(bytes.to_vec()),
            CustomCode::Assembler(assembler) => assembler.assemble(address as u64),
        }
    }
}

impl HookEngine {
    /// Builds an assembly hook splicing `code` into `target`.
    ///
    /// `code` is written verbatim into the stub, so it must be position
    /// independent and must preserve any state the surrounding function
    /// needs. Use [`create_asm_hook_with`](Self::create_asm_hook_with) for
    /// code that needs to know its own address.
    pub fn create_asm_hook(
        &self,
        code: &[u8],
        target: usize,
        behavior: AsmHookBehavior,
        options: &HookOptions,
    ) -> Result<Hook, HookError> {
        self.build_asm_hook(CustomCode::Bytes(code), target, behavior, options)
    }

    /// Builds an assembly hook whose code is produced by `assemble` against
    /// a [`CodeAssembler`], encoded at the stub's final address.
    pub fn create_asm_hook_with<F>(
        &self,
        assemble: F,
        target: usize,
        behavior: AsmHookBehavior,
        options: &HookOptions,
    ) -> Result<Hook, HookError>
    where
        F: FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
    {
        let mut assembler = CodeAssembler::new(64)?;
        assemble(&mut assembler)?;
        self.build_asm_hook(CustomCode::Assembler(&mut assembler), target, behavior, options)
    }

    /// Shared construction for both code sources.
    fn build_asm_hook(
        &self,
        mut custom: CustomCode<'_>,
        target: usize,
        behavior: AsmHookBehavior,
        options: &HookOptions,
    ) -> Result<Hook, HookError> {
        let _guard = self.build_lock.lock().unwrap_or_else(|e| e.into_inner());

        let probe = self.probe(target)?;
        let custom_len = custom.measure(target)?;
        let size = 0x180 + custom_len + 32;
        let mut buffer = self.allocate_near(target, size)?;

        let entry = buffer.write(&code::jmp_abs(0));
        let slot = entry + 6;
        let jump = code::encode_jump(target, entry, options.prefer_relative_jump);
        let min = jump.len().max(options.min_hook_length.unwrap_or(0));
        let hook_len = relocate::aligned_length(&probe, min)?;
        let window = &probe[..hook_len];
        let resume = target + hook_len;

        let patcher =
            FunctionPatcher::new(&LiveMemory, &self.modules, self.patcher_options(options));

        // disabled sequence: the relocated original only. Foreign repairs
        // point here, so a stacked hook's resume path never runs the custom
        // code, mirroring how it bypasses a detour.
        buffer.align(16);
        let disabled = buffer.current();
        let function_patch = patcher.patch(window, target, disabled, resume)?;
        buffer.write(&function_patch.relocated.bytes);

        buffer.align(16);
        let enabled = buffer.current();
        match behavior {
            AsmHookBehavior::ExecuteFirst => {
                let bytes = custom.render(enabled)?;
                buffer.write(&bytes);
                let copy = patcher.patch(window, target, buffer.current(), resume)?;
                buffer.write(&copy.relocated.bytes);
            }
            AsmHookBehavior::ExecuteAfter => {
                // encode the displaced window so its trailing jump falls
                // through into the custom code; one sizing pass, then the
                // real one
                let sized = patcher.patch(window, target, enabled, enabled)?;
                let custom_at = enabled + sized.relocated.bytes.len();
                let copy = patcher.patch(window, target, enabled, custom_at)?;
                debug_assert_eq!(copy.relocated.bytes.len(), sized.relocated.bytes.len());
                buffer.write(&copy.relocated.bytes);
                let bytes = custom.render(buffer.current())?;
                buffer.write(&bytes);
                let back = code::encode_jump(buffer.current(), resume, true);
                buffer.write(&back);
            }
            AsmHookBehavior::DoNotExecuteOriginal => {
                let bytes = custom.render(enabled)?;
                buffer.write(&bytes);
                let back = code::encode_jump(buffer.current(), resume, true);
                buffer.write(&back);
            }
        }
        log::debug!(
            "asm hook at {target:#x}: enabled stub {enabled:#x}, disabled stub {disabled:#x}"
        );

        let mut activation = jump;
        activation.extend_from_slice(&code::nops(hook_len - activation.len()));

        let stacked = function_patch.is_stacked();
        Ok(Hook {
            target,
            activation: Patch::new(target, activation),
            foreign_patches: function_patch.foreign_patches,
            enable: Patch::new(slot, (enabled as u64).to_le_bytes().to_vec()),
            disable: Patch::new(slot, (disabled as u64).to_le_bytes().to_vec()),
            trampoline: disabled,
            original: disabled,
            stacked,
            buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::read_bytes;

    /// mov rax, rdi; add rax, rsi; ret
    const ADD: &[u8] = &[0x48, 0x89, 0xf8, 0x48, 0x01, 0xf0, 0xc3];

    /// inc rax
    const INC_RAX: &[u8] = &[0x48, 0xff, 0xc0];

    fn emit_function(engine: &HookEngine, bytes: &[u8]) -> usize {
        let mut buffer = engine.pool().allocate(emit_function as usize, 64).unwrap();
        let address = buffer.write(bytes);
        std::mem::forget(buffer);
        address
    }

    /// The stub address an enable/disable patch routes to.
    fn routed(patch: &Patch) -> usize {
        u64::from_le_bytes(patch.bytes().try_into().unwrap()) as usize
    }

    #[test]
    /// ExecuteFirst lays out custom code, then the displaced window
    fn test_execute_first_layout() {
        let engine = HookEngine::new().unwrap();
        let target = emit_function(&engine, ADD);
        let hook = engine
            .create_asm_hook(
                INC_RAX,
                target,
                AsmHookBehavior::ExecuteFirst,
                &HookOptions::default(),
            )
            .unwrap();

        let enabled = routed(&hook.enable);
        let stub = unsafe { read_bytes(enabled, INC_RAX.len() + 6) };
        assert_eq!(&stub[..3], INC_RAX);
        assert_eq!(&stub[3..9], &ADD[..6]);

        // disabled stub is the displaced window alone
        let disabled = routed(&hook.disable);
        assert_eq!(disabled, hook.trampoline());
        let plain = unsafe { read_bytes(disabled, 6) };
        assert_eq!(&plain, &ADD[..6]);
    }

    #[test]
    /// ExecuteAfter runs the window, falls through into the custom code and
    /// jumps back past the overwritten bytes
    fn test_execute_after_layout() {
        let engine = HookEngine::new().unwrap();
        let target = emit_function(&engine, ADD);
        let hook = engine
            .create_asm_hook(
                INC_RAX,
                target,
                AsmHookBehavior::ExecuteAfter,
                &HookOptions::default(),
            )
            .unwrap();

        let enabled = routed(&hook.enable);
        let stub = unsafe { read_bytes(enabled, 6 + 5 + 3 + 5) };
        // displaced window
        assert_eq!(&stub[..6], &ADD[..6]);
        // trailing jump of the window falls through to the custom code
        assert_eq!(stub[6], 0xe9);
        assert_eq!(&stub[7..11], &0i32.to_le_bytes());
        assert_eq!(&stub[11..14], INC_RAX);
        // custom code jumps back to target+6
        assert_eq!(stub[14], 0xe9);
        let disp = i32::from_le_bytes(stub[15..19].try_into().unwrap());
        assert_eq!((enabled + 19).wrapping_add(disp as usize), target + 6);
    }

    #[test]
    /// DoNotExecuteOriginal skips the displaced window entirely while
    /// enabled, but the disabled stub still carries it
    fn test_skip_original_layout() {
        let engine = HookEngine::new().unwrap();
        let target = emit_function(&engine, ADD);
        let hook = engine
            .create_asm_hook(
                INC_RAX,
                target,
                AsmHookBehavior::DoNotExecuteOriginal,
                &HookOptions::default(),
            )
            .unwrap();

        let enabled = routed(&hook.enable);
        let stub = unsafe { read_bytes(enabled, 8) };
        assert_eq!(&stub[..3], INC_RAX);
        assert_eq!(stub[3], 0xe9);

        let disabled = unsafe { read_bytes(routed(&hook.disable), 6) };
        assert_eq!(&disabled, &ADD[..6]);
    }

    #[test]
    /// Assembler-sourced code is encoded at its real address
    fn test_assembler_source() {
        let engine = HookEngine::new().unwrap();
        let target = emit_function(&engine, ADD);
        // some absolute address the custom code branches to; the encoded
        // displacement only comes out right if the code was assembled at
        // the stub's final address
        let helper = emit_function as usize as u64;

        let hook = engine
            .create_asm_hook_with(
                |asm| asm.call(helper),
                target,
                AsmHookBehavior::ExecuteFirst,
                &HookOptions::default(),
            )
            .unwrap();

        let enabled = routed(&hook.enable);
        let stub = unsafe { read_bytes(enabled, 16) };
        let decoded = iced_x86::Decoder::with_ip(
            64,
            &stub,
            enabled as u64,
            iced_x86::DecoderOptions::NONE,
        )
        .iter()
        .next()
        .unwrap();
        assert_eq!(decoded.near_branch_target(), helper);
    }
}
