//! Hand-rolled x86-64 branch encodings
//!
//! The trampoline, entry stubs and foreign-jump rewrites only ever need a
//! handful of fixed instruction shapes, so these are emitted directly rather
//! than through the assembler.

/// Size of a short relative jump (`EB xx`)
pub const JMP_REL8_SIZE: usize = 2;
/// Size of a near relative jump (`E9 xx xx xx xx`)
pub const JMP_REL32_SIZE: usize = 5;
/// Size of an absolute indirect jump with an inline target
/// (`FF 25 00000000` followed by the 8-byte address)
pub const JMP_ABS_SIZE: usize = 14;

/// Signed displacement of a rel8 jump at `source` reaching `target`, if it
/// fits the encoding.
pub fn rel8_displacement(source: usize, target: usize) -> Option<i8> {
    let disp = (target as i128) - (source as i128 + JMP_REL8_SIZE as i128);
    i8::try_from(disp).ok()
}

/// Signed displacement of a rel32 jump at `source` reaching `target`, if it
/// fits the encoding.
pub fn rel32_displacement(source: usize, target: usize) -> Option<i32> {
    let disp = (target as i128) - (source as i128 + JMP_REL32_SIZE as i128);
    i32::try_from(disp).ok()
}

/// Encodes `jmp rel8` from `source` to `target`, if the displacement fits.
pub fn jmp_rel8(source: usize, target: usize) -> Option<[u8; JMP_REL8_SIZE]> {
    let disp = rel8_displacement(source, target)?;
    Some([0xeb, disp as u8])
}

/// Encodes `jmp rel32` from `source` to `target`, if the displacement fits.
pub fn jmp_rel32(source: usize, target: usize) -> Option<[u8; JMP_REL32_SIZE]> {
    let disp = rel32_displacement(source, target)?;
    let mut bytes = [0u8; JMP_REL32_SIZE];
    bytes[0] = 0xe9;
    bytes[1..].copy_from_slice(&disp.to_le_bytes());
    Some(bytes)
}

/// Encodes `jmp qword [rip+0]` with the 8-byte target inline after the
/// instruction. Reaches any address; position independent.
pub fn jmp_abs(target: usize) -> [u8; JMP_ABS_SIZE] {
    let mut bytes = [0u8; JMP_ABS_SIZE];
    bytes[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    bytes[6..].copy_from_slice(&(target as u64).to_le_bytes());
    bytes
}

/// `len` one-byte nops.
pub fn nops(len: usize) -> Vec<u8> {
    vec![0x90; len]
}

/// If `bytes` begins with the absolute indirect jump form emitted by
/// [`jmp_abs`] (`FF 25 00000000` with the 8-byte target inline), returns the
/// target. The inline pointer is data; callers stepping through code must
/// consume the whole 14-byte unit instead of decoding the pointer bytes.
pub fn inline_jump_target(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < JMP_ABS_SIZE || bytes[..6] != [0xff, 0x25, 0x00, 0x00, 0x00, 0x00] {
        return None;
    }
    let raw: [u8; 8] = bytes[6..JMP_ABS_SIZE].try_into().ok()?;
    Some(u64::from_le_bytes(raw) as usize)
}

/// Encodes a jump from `source` to `target`, preferring the short rel32 form
/// when it is in range and `prefer_relative` is set, falling back to the
/// absolute indirect form.
pub fn encode_jump(source: usize, target: usize, prefer_relative: bool) -> Vec<u8> {
    if prefer_relative {
        if let Some(rel) = jmp_rel32(source, target) {
            return rel.to_vec();
        }
    }
    jmp_abs(target).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rel32_forward() {
        let bytes = jmp_rel32(0x1000, 0x2000).unwrap();
        assert_eq!(bytes[0], 0xe9);
        assert_eq!(
            i32::from_le_bytes(bytes[1..].try_into().unwrap()),
            0x2000 - (0x1000 + 5)
        );
    }

    #[test]
    fn test_rel32_backward() {
        let bytes = jmp_rel32(0x2000, 0x1000).unwrap();
        assert_eq!(
            i32::from_le_bytes(bytes[1..].try_into().unwrap()),
            0x1000 - (0x2000 + 5)
        );
    }

    #[test]
    /// A displacement past the 2 GiB window has no rel32 encoding
    fn test_rel32_out_of_range() {
        assert!(jmp_rel32(0, usize::MAX / 2).is_none());
        assert!(jmp_rel32(0x1000, 0x1000 + i32::MAX as usize + 6).is_none());
        assert!(jmp_rel32(0x1000, 0x1000 + i32::MAX as usize + 5).is_some());
    }

    #[test]
    fn test_rel8() {
        // jmp to the next instruction: displacement zero
        assert_eq!(jmp_rel8(0x1000, 0x1002).unwrap(), [0xeb, 0x00]);
        assert_eq!(jmp_rel8(0x1000, 0x1000).unwrap(), [0xeb, 0xfe]);
        assert!(jmp_rel8(0x1000, 0x2000).is_none());
    }

    #[test]
    fn test_abs_layout() {
        let bytes = jmp_abs(0x1122_3344_5566_7788);
        assert_eq!(&bytes[..6], &[0xff, 0x25, 0, 0, 0, 0]);
        assert_eq!(
            u64::from_le_bytes(bytes[6..].try_into().unwrap()),
            0x1122_3344_5566_7788
        );
    }

    #[test]
    /// The inline-pointer form round-trips through the recognizer; anything
    /// else does not match
    fn test_inline_jump_target() {
        let target = 0x7f12_3456_7000usize;
        assert_eq!(inline_jump_target(&jmp_abs(target)), Some(target));
        // a plain rip-relative jump with a nonzero displacement is not the
        // inline form
        assert_eq!(
            inline_jump_target(&[0xff, 0x25, 0x10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            None
        );
        assert_eq!(inline_jump_target(&jmp_abs(target)[..13]), None);
    }

    #[test]
    fn test_encode_jump_fallback() {
        assert_eq!(encode_jump(0x1000, 0x2000, true).len(), JMP_REL32_SIZE);
        assert_eq!(encode_jump(0x1000, 0x2000, false).len(), JMP_ABS_SIZE);
        let far = 0x1000usize + i32::MAX as usize + 0x1000;
        assert_eq!(encode_jump(0x1000, far, true).len(), JMP_ABS_SIZE);
    }
}
