//! # Prologue relocation
//!
//! Re-encodes a short instruction sequence so that it behaves identically at
//! a new address: short and near branches, calls and RIP-relative operands
//! all get their displacements recomputed for the new location. Only the
//! small prologue windows a hook overwrites are ever relocated; this is not
//! a general code mover.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Decoder, DecoderOptions, IcedError, Instruction,
    InstructionBlock,
};
use thiserror::Error;

use crate::code;

/// Decoder bitness used throughout; the engine targets x86-64 code.
pub(crate) const BITNESS: u32 = 64;

/// Errors raised while relocating code
#[derive(Debug, Error)]
pub enum RelocateError {
    /// A byte sequence did not decode to a valid instruction
    #[error("invalid instruction at offset {offset:#x}")]
    Decode {
        /// Offset of the undecodable bytes
        offset: usize,
    },
    /// The byte window ended before covering the requested length
    #[error("instruction stream ends at {have:#x} bytes, {needed:#x} required")]
    Truncated {
        /// Bytes required to reach an instruction boundary past the minimum
        needed: usize,
        /// Bytes actually available
        have: usize,
    },
    /// An instruction's relative operand cannot be re-expressed at the new
    /// address.
    ///
    /// This is unrecoverable by design: when it surfaces mid-installation the
    /// process's executable memory may already be partially rewritten, and
    /// the only safe response is to abort rather than continue with corrupt
    /// control flow.
    #[error("cannot re-encode relative operand at new address: {0}")]
    EncodingCapacity(#[from] IcedError),
}

/// A relocated byte sequence plus the mapping from old instruction offsets to
/// new ones.
///
/// The offset map is what lets the function patcher redirect a foreign hook's
/// resume jump to the equivalent position inside the relocated copy.
#[derive(Debug, Clone)]
pub struct Relocated {
    /// The re-encoded bytes, valid at the address they were encoded for
    pub bytes: Vec<u8>,
    /// Pairs of (offset in the original window, offset in `bytes`)
    offsets: Vec<(usize, usize)>,
}

impl Relocated {
    /// Maps an instruction-start offset in the original window to the
    /// equivalent offset in the relocated bytes.
    pub fn new_offset(&self, old_offset: usize) -> Option<usize> {
        self.offsets
            .iter()
            .find(|(old, _)| *old == old_offset)
            .map(|(_, new)| *new)
    }
}

/// Decodes `bytes` as a full instruction sequence starting at `ip`.
pub(crate) fn decode_all(bytes: &[u8], ip: usize) -> Result<Vec<Instruction>, RelocateError> {
    let mut decoder = Decoder::with_ip(BITNESS, bytes, ip as u64, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    while decoder.can_decode() {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(RelocateError::Decode {
                offset: instruction.ip() as usize - ip,
            });
        }
        instructions.push(instruction);
    }
    Ok(instructions)
}

/// Returns the smallest instruction-aligned byte count that is at least
/// `min` bytes into `bytes`. Never splits an instruction.
///
/// An absolute jump with its pointer inline (the form [`code::jmp_abs`]
/// emits, found at the start of any target this engine already hooked) is
/// one 14-byte unit; its pointer bytes are data, not instructions.
pub fn aligned_length(bytes: &[u8], min: usize) -> Result<usize, RelocateError> {
    let mut length = 0usize;
    while length < min {
        if code::inline_jump_target(&bytes[length..]).is_some() {
            length += code::JMP_ABS_SIZE;
            continue;
        }
        let mut decoder = Decoder::new(BITNESS, &bytes[length..], DecoderOptions::NONE);
        if !decoder.can_decode() {
            return Err(RelocateError::Truncated {
                needed: min,
                have: length,
            });
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(RelocateError::Decode { offset: length });
        }
        length += instruction.len();
    }
    Ok(length)
}

/// Re-encodes already-decoded instructions for execution at `new_address`,
/// producing the offset map alongside the bytes. `old_offsets` carries the
/// instruction-start offsets in the original window, parallel to
/// `instructions`.
pub(crate) fn encode_at(
    instructions: &[Instruction],
    old_offsets: &[usize],
    new_address: usize,
) -> Result<Relocated, RelocateError> {
    debug_assert_eq!(instructions.len(), old_offsets.len());
    let block = InstructionBlock::new(instructions, new_address as u64);
    let result = BlockEncoder::encode(
        BITNESS,
        block,
        BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS,
    )?;
    let offsets = old_offsets
        .iter()
        .zip(result.new_instruction_offsets.iter())
        // u32::MAX marks instructions the encoder rewrote into a different
        // shape; those have no single equivalent offset
        .filter(|(_, new)| **new != u32::MAX)
        .map(|(old, new)| (*old, *new as usize))
        .collect();
    Ok(Relocated {
        bytes: result.code_buffer,
        offsets,
    })
}

/// Relocates `bytes`, decoded as if executing at `original_address`, so the
/// same semantics hold when executed at `new_address`.
pub fn relocate(
    bytes: &[u8],
    original_address: usize,
    new_address: usize,
) -> Result<Relocated, RelocateError> {
    let instructions = decode_all(bytes, original_address)?;
    let old_offsets: Vec<usize> = instructions
        .iter()
        .map(|i| i.ip() as usize - original_address)
        .collect();
    encode_at(&instructions, &old_offsets, new_address)
}

/// Relocates `bytes` to `new_address` and appends a jump to `resume`,
/// transferring control back into the live function just past the relocated
/// window.
pub fn relocate_with_return(
    bytes: &[u8],
    original_address: usize,
    new_address: usize,
    resume: usize,
) -> Result<Relocated, RelocateError> {
    let mut instructions = decode_all(bytes, original_address)?;
    let mut old_offsets: Vec<usize> = instructions
        .iter()
        .map(|i| i.ip() as usize - original_address)
        .collect();
    instructions.push(Instruction::with_branch(Code::Jmp_rel32_64, resume as u64)?);
    // the return jump corresponds to the first byte past the window
    old_offsets.push(bytes.len());
    encode_at(&instructions, &old_offsets, new_address)
}
