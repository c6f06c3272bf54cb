//! # Function patching and stacked-hook repair
//!
//! When a target function is already hooked by a third party, its prologue
//! no longer contains the original instructions but a detour jump into
//! foreign code. Blindly treating those bytes as the function would tear the
//! foreign hook in half: its trampoline still jumps back into the middle of
//! the window we are about to overwrite.
//!
//! [`FunctionPatcher`] handles both halves of the problem. It classifies the
//! jumps found in the prologue window, rewrites foreign ones into
//! position-independent form for the trampoline, and locates the foreign
//! trampoline's resume jump so it can be redirected into our relocated copy
//! of the window.

use iced_x86::{Code, Encoder, FlowControl, Instruction, OpKind};
use thiserror::Error;

use crate::code;
use crate::mem::MemorySource;
use crate::modules::ModuleMap;
use crate::patch::Patch;
use crate::relocate::{self, RelocateError, Relocated, BITNESS};

/// Tuning knobs for prologue analysis and the resume-jump search.
#[derive(Debug, Clone, Copy)]
pub struct PatcherOptions {
    /// Widen the last search stage from one page to the whole module
    /// containing the foreign target. Slower, catches trampolines placed far
    /// from their detour.
    pub search_in_modules: bool,
    /// Treat a jump as foreign only when its target lies outside every
    /// loaded module. When disabled, any jump leaving the prologue window is
    /// treated as foreign.
    pub verify_jump_targets_module: bool,
}

impl Default for PatcherOptions {
    fn default() -> Self {
        Self {
            search_in_modules: false,
            verify_jump_targets_module: true,
        }
    }
}

/// Errors raised while analyzing or repairing a function prologue
#[derive(Debug, Error)]
pub enum PatchError {
    /// The prologue could not be decoded or re-encoded
    #[error(transparent)]
    Relocate(#[from] RelocateError),
    /// A foreign trampoline resumes at an address that is not an instruction
    /// boundary in our reading of the prologue
    #[error("no instruction boundary matches foreign resume target {target:#x}")]
    UnmappedResume {
        /// The resume address the foreign jump targets
        target: usize,
    },
    /// A resume jump could not be re-encoded in place at its original length.
    ///
    /// Like [`RelocateError::EncodingCapacity`] this is unrecoverable: the
    /// foreign hook cannot be repaired without moving code we do not own.
    #[error("repaired jump at {address:#x} does not fit its original encoding")]
    RepairEncoding {
        /// Address of the jump that could not be rewritten
        address: usize,
    },
}

/// The analysis result for one prologue window: everything the hook engine
/// needs to build a trampoline and keep existing hooks intact.
#[derive(Debug)]
pub struct FunctionPatch {
    /// Prologue re-encoded for the trampoline address, ending in a jump back
    /// to the live function
    pub relocated: Relocated,
    /// Targets of the foreign detour jumps found in the window
    pub foreign_targets: Vec<usize>,
    /// In-place rewrites redirecting foreign resume jumps into `relocated`
    pub foreign_patches: Vec<Patch>,
}

impl FunctionPatch {
    /// Whether the window contained a detour belonging to another hook.
    pub fn is_stacked(&self) -> bool {
        !self.foreign_targets.is_empty()
    }
}

/// Analyzes function prologues against a memory source and module snapshot.
pub struct FunctionPatcher<'a, M: MemorySource> {
    /// Address space being analyzed
    memory: &'a M,
    /// Module snapshot deciding which jump targets count as foreign
    modules: &'a ModuleMap,
    /// Analysis options
    options: PatcherOptions,
}

impl<'a, M: MemorySource> FunctionPatcher<'a, M> {
    /// Creates a patcher over `memory` using `modules` to classify targets.
    pub fn new(memory: &'a M, modules: &'a ModuleMap, options: PatcherOptions) -> Self {
        Self {
            memory,
            modules,
            options,
        }
    }

    /// Analyzes the prologue `window` read from `base`.
    ///
    /// Produces the window re-encoded for `relocated_base` with a trailing
    /// jump to `resume`, plus the in-place patches that redirect any foreign
    /// trampoline back into the re-encoded copy. Nothing is written; the
    /// caller applies the results under its own ordering.
    pub fn patch(
        &self,
        window: &[u8],
        base: usize,
        relocated_base: usize,
        resume: usize,
    ) -> Result<FunctionPatch, PatchError> {
        let mut instructions = Vec::new();
        let mut old_offsets = Vec::new();
        let mut foreign_targets = Vec::new();

        let mut offset = 0;
        while offset < window.len() {
            // an absolute jump with its pointer inline (the form this engine
            // installs) is one 14-byte unit; the pointer bytes are data and
            // must not be decoded as instructions
            if let Some(target) = code::inline_jump_target(&window[offset..]) {
                if self.is_foreign(target, base, window.len()) {
                    log::debug!(
                        "foreign detour at {:#x} targeting {target:#x}",
                        base + offset
                    );
                    foreign_targets.push(target);
                }
                instructions.push(
                    Instruction::with_declare_byte(&code::jmp_abs(target))
                        .map_err(RelocateError::EncodingCapacity)?,
                );
                old_offsets.push(offset);
                offset += code::JMP_ABS_SIZE;
                continue;
            }

            let instruction = decode_one(&window[offset..], base + offset)
                .ok_or(RelocateError::Decode { offset })?;
            let mut consumed = instruction.len();
            let next = decode_one(&window[offset + consumed..], base + offset + consumed);
            match self.classify(&instruction, next.as_ref(), base, window.len()) {
                Some(jump) => {
                    log::debug!(
                        "foreign detour at {:#x} targeting {:#x}",
                        instruction.ip(),
                        jump.target
                    );
                    foreign_targets.push(jump.target);
                    // position independent, so the block encoder passes it
                    // through untouched
                    let stub = code::jmp_abs(jump.target);
                    instructions.push(
                        Instruction::with_declare_byte(&stub)
                            .map_err(RelocateError::EncodingCapacity)?,
                    );
                    old_offsets.push(offset);
                    if jump.consumes_next {
                        consumed += next.map(|i| i.len()).unwrap_or(0);
                    }
                }
                None => {
                    instructions.push(instruction);
                    old_offsets.push(offset);
                }
            }
            offset += consumed;
        }

        instructions.push(
            Instruction::with_branch(Code::Jmp_rel32_64, resume as u64)
                .map_err(RelocateError::EncodingCapacity)?,
        );
        old_offsets.push(window.len());

        let relocated = relocate::encode_at(&instructions, &old_offsets, relocated_base)?;

        let mut foreign_patches: Vec<Patch> = Vec::new();
        for &target in &foreign_targets {
            for patch in
                self.find_resume_patches(target, base, window.len(), &relocated, relocated_base)?
            {
                if !foreign_patches.iter().any(|p| p.address() == patch.address()) {
                    foreign_patches.push(patch);
                }
            }
        }

        Ok(FunctionPatch {
            relocated,
            foreign_targets,
            foreign_patches,
        })
    }

    /// Classifies `instruction` as a foreign detour jump, resolving indirect
    /// forms through memory. Returns `None` for anything that should be
    /// relocated as-is.
    fn classify(
        &self,
        instruction: &Instruction,
        next: Option<&Instruction>,
        base: usize,
        len: usize,
    ) -> Option<ForeignJump> {
        let (target, consumes_next) = match instruction.flow_control() {
            // jmp rel8 / rel32
            FlowControl::UnconditionalBranch => {
                (near_branch_target(instruction)? as usize, false)
            }
            // jmp [rip+disp] through a pointer cell
            FlowControl::IndirectBranch if instruction.is_ip_rel_memory_operand() => {
                let cell = instruction.ip_rel_memory_address() as usize;
                (self.memory.read_ptr(cell)?, false)
            }
            // push imm32 / ret pair
            _ if instruction.code() == Code::Pushq_imm32
                && next.map(Instruction::code) == Some(Code::Retnq) =>
            {
                (instruction.immediate32to64() as usize, true)
            }
            _ => return None,
        };

        if !self.is_foreign(target, base, len) {
            return None;
        }
        Some(ForeignJump {
            target,
            consumes_next,
        })
    }

    /// Whether a jump to `target` belongs to another hook rather than the
    /// function's own logic.
    fn is_foreign(&self, target: usize, base: usize, len: usize) -> bool {
        // a branch staying inside the window is the function's own logic
        if target >= base && target < base + len {
            return false;
        }
        !(self.options.verify_jump_targets_module && self.modules.contains(target))
    }

    /// Finds the foreign trampoline's jump(s) back into the overwritten
    /// window and rewrites them to resume inside the relocated copy.
    ///
    /// Search stages run cheapest first, stopping at the first stage that
    /// yields a result: the aligned 16-byte frame holding the foreign target
    /// plus the next three frames, then the single aligned frame before it,
    /// then an unaligned window at the target itself, and finally the
    /// surrounding page (or the whole module when configured).
    fn find_resume_patches(
        &self,
        foreign_target: usize,
        base: usize,
        len: usize,
        relocated: &Relocated,
        relocated_base: usize,
    ) -> Result<Vec<Patch>, PatchError> {
        let aligned = foreign_target & !0xf;
        let page_size = region::page::size();
        let wide = match self.modules.module_at(foreign_target) {
            Some(module) if self.options.search_in_modules => (module.base, module.size),
            _ => (foreign_target & !(page_size - 1), page_size),
        };
        let stages = [
            (aligned, 4 * 16),
            (aligned.saturating_sub(16), 16),
            (foreign_target, 2 * 16),
            wide,
        ];

        for (start, window_len) in stages {
            let Some(bytes) = self.memory.read(start, window_len) else {
                continue;
            };
            let patches =
                self.scan_window(&bytes, start, base, len, relocated, relocated_base)?;
            if !patches.is_empty() {
                return Ok(patches);
            }
        }
        log::debug!(
            "no resume jump into {base:#x}..{:#x} found near {foreign_target:#x}",
            base + len
        );
        Ok(Vec::new())
    }

    /// Scans one window of bytes for branches into the interior of the
    /// overwritten prologue.
    fn scan_window(
        &self,
        bytes: &[u8],
        window_base: usize,
        base: usize,
        len: usize,
        relocated: &Relocated,
        relocated_base: usize,
    ) -> Result<Vec<Patch>, PatchError> {
        use iced_x86::{Decoder, DecoderOptions};

        let mut patches = Vec::new();
        let mut decoder = Decoder::with_ip(BITNESS, bytes, window_base as u64, DecoderOptions::NONE);
        while decoder.can_decode() {
            let instruction = decoder.decode();
            if instruction.is_invalid() {
                continue;
            }
            let address = instruction.ip() as usize;
            // bytes inside the prologue get overwritten anyway
            if address >= base && address < base + len {
                continue;
            }
            if !matches!(
                instruction.flow_control(),
                FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch
            ) {
                continue;
            }
            let Some(target) = near_branch_target(&instruction) else {
                continue;
            };
            let target = target as usize;
            // jumps to the very start of the function are chain entries, not
            // broken resumes; only interior targets need redirecting
            if target <= base || target >= base + len {
                continue;
            }
            let new_offset = relocated
                .new_offset(target - base)
                .ok_or(PatchError::UnmappedResume { target })?;
            let bytes = retarget(&instruction, relocated_base + new_offset)?;
            log::trace!(
                "redirecting resume jump at {address:#x} from {target:#x} to {:#x}",
                relocated_base + new_offset
            );
            patches.push(Patch::new(address, bytes));
        }
        Ok(patches)
    }
}

/// A detour jump owned by another hook.
struct ForeignJump {
    /// Resolved absolute target
    target: usize,
    /// The jump spans this instruction and the next (push/ret idiom)
    consumes_next: bool,
}

/// Decodes the first instruction of `bytes` at `ip`, `None` when the bytes
/// are empty or not a valid instruction.
fn decode_one(bytes: &[u8], ip: usize) -> Option<Instruction> {
    use iced_x86::{Decoder, DecoderOptions};

    let mut decoder = Decoder::with_ip(BITNESS, bytes, ip as u64, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let instruction = decoder.decode();
    (!instruction.is_invalid()).then_some(instruction)
}

/// The branch target of a near branch, `None` for other operand kinds.
fn near_branch_target(instruction: &Instruction) -> Option<u64> {
    match instruction.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Some(instruction.near_branch_target())
        }
        _ => None,
    }
}

/// Re-encodes a branch in place with a new target, keeping its length.
fn retarget(instruction: &Instruction, new_target: usize) -> Result<Vec<u8>, PatchError> {
    let address = instruction.ip() as usize;
    let mut patched = *instruction;
    patched.set_near_branch64(new_target as u64);
    let mut encoder = Encoder::new(BITNESS);
    let len = encoder
        .encode(&patched, patched.ip())
        .map_err(|_| PatchError::RepairEncoding { address })?;
    if len != instruction.len() {
        return Err(PatchError::RepairEncoding { address });
    }
    Ok(encoder.take_buffer())
}
