//! Machine code of the replacement `clock_gettime` and the jump that
//! redirects the vDSO entry point to it (x86_64 System V ABI).
//!
//! The replacement performs the real `clock_gettime` syscall, and when the
//! requested clock id's bit is set in `MASK` adds `SEC`/`NSEC` to the
//! result, renormalizing `tv_nsec` into `[0, 1e9)`.

pub(crate) const IMAGE_LEN: usize = 120;
/// Bytes that never change between injections.
pub(crate) const CODE_LEN: usize = 94;
pub(crate) const MASK_OFFSET: usize = 96;
pub(crate) const SEC_OFFSET: usize = 104;
pub(crate) const NSEC_OFFSET: usize = 112;
pub(crate) const JUMP_LEN: usize = 12;

#[rustfmt::skip]
pub(crate) const FAKE_CLOCK_GETTIME: [u8; IMAGE_LEN] = [
    0xb8, 0xe4, 0x00, 0x00, 0x00,             //  0: mov eax, 228 (clock_gettime)
    0x0f, 0x05,                               //  5: syscall
    0x48, 0x85, 0xc0,                         //  7: test rax, rax
    0x75, 0x51,                               // 10: jne ret
    0x83, 0xff, 0x3f,                         // 12: cmp edi, 63
    0x77, 0x4c,                               // 15: ja ret
    0x48, 0x8b, 0x15, 0x48, 0x00, 0x00, 0x00, // 17: mov rdx, [rip + MASK]
    0x48, 0x0f, 0xa3, 0xfa,                   // 24: bt rdx, rdi
    0x73, 0x3f,                               // 28: jnc ret
    0x48, 0x8b, 0x0e,                         // 30: mov rcx, [rsi]
    0x48, 0x8b, 0x56, 0x08,                   // 33: mov rdx, [rsi + 8]
    0x48, 0x03, 0x0d, 0x3c, 0x00, 0x00, 0x00, // 37: add rcx, [rip + SEC]
    0x48, 0x03, 0x15, 0x3d, 0x00, 0x00, 0x00, // 44: add rdx, [rip + NSEC]
    0x49, 0xc7, 0xc0, 0x00, 0xca, 0x9a, 0x3b, // 51: mov r8, 1000000000
    0x4c, 0x39, 0xc2,                         // 58: cmp rdx, r8
    0x7c, 0x08,                               // 61: jl 71
    0x4c, 0x29, 0xc2,                         // 63: sub rdx, r8
    0x48, 0xff, 0xc1,                         // 66: inc rcx
    0xeb, 0xf3,                               // 69: jmp 58
    0x48, 0x85, 0xd2,                         // 71: test rdx, rdx
    0x79, 0x08,                               // 74: jns 84
    0x4c, 0x01, 0xc2,                         // 76: add rdx, r8
    0x48, 0xff, 0xc9,                         // 79: dec rcx
    0xeb, 0xf3,                               // 82: jmp 71
    0x48, 0x89, 0x0e,                         // 84: mov [rsi], rcx
    0x48, 0x89, 0x56, 0x08,                   // 87: mov [rsi + 8], rdx
    0x31, 0xc0,                               // 91: xor eax, eax
    0xc3,                                     // 93: ret
    0xcc, 0xcc,                               // 94: padding
    0, 0, 0, 0, 0, 0, 0, 0,                   // 96: MASK
    0, 0, 0, 0, 0, 0, 0, 0,                   // 104: SEC
    0, 0, 0, 0, 0, 0, 0, 0,                   // 112: NSEC
];

/// Template with the three little-endian constants patched in.
pub(crate) fn render(mask: u64, sec_delta: i64, nsec_delta: i64) -> [u8; IMAGE_LEN] {
    let mut image = FAKE_CLOCK_GETTIME;
    image[MASK_OFFSET..MASK_OFFSET + 8].copy_from_slice(&mask.to_le_bytes());
    image[SEC_OFFSET..SEC_OFFSET + 8].copy_from_slice(&sec_delta.to_le_bytes());
    image[NSEC_OFFSET..NSEC_OFFSET + 8].copy_from_slice(&nsec_delta.to_le_bytes());
    image
}

/// `movabs rax, target; jmp rax`
pub(crate) fn jump_to(target: u64) -> [u8; JUMP_LEN] {
    let mut jump = [0_u8; JUMP_LEN];
    jump[0] = 0x48;
    jump[1] = 0xb8;
    jump[2..10].copy_from_slice(&target.to_le_bytes());
    jump[10] = 0xff;
    jump[11] = 0xe0;
    jump
}

pub(crate) fn is_jump(bytes: &[u8]) -> bool {
    bytes.len() >= JUMP_LEN && bytes[..2] == [0x48, 0xb8] && bytes[10..12] == [0xff, 0xe0]
}

pub(crate) fn has_image_prefix(bytes: &[u8]) -> bool {
    bytes.len() >= CODE_LEN && bytes[..CODE_LEN] == FAKE_CLOCK_GETTIME[..CODE_LEN]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rip_target(image: &[u8], disp_at: usize, next_insn: usize) -> usize {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(&image[disp_at..disp_at + 4]);
        let disp = i32::from_le_bytes(raw);
        match usize::try_from(i64::try_from(next_insn).unwrap_or(0) + i64::from(disp)) {
            Ok(target) => target,
            Err(_) => panic!("negative rip target"),
        }
    }

    fn short_jump_target(image: &[u8], opcode_at: usize) -> usize {
        let rel = i8::from_le_bytes([image[opcode_at + 1]]);
        match usize::try_from(i64::try_from(opcode_at + 2).unwrap_or(0) + i64::from(rel)) {
            Ok(target) => target,
            Err(_) => panic!("negative jump target"),
        }
    }

    #[test]
    fn rip_relative_loads_hit_constants() {
        let image = FAKE_CLOCK_GETTIME;
        assert_eq!(rip_target(&image, 20, 24), MASK_OFFSET);
        assert_eq!(rip_target(&image, 40, 44), SEC_OFFSET);
        assert_eq!(rip_target(&image, 47, 51), NSEC_OFFSET);
    }

    #[test]
    fn branches_land_on_instruction_boundaries() {
        let image = FAKE_CLOCK_GETTIME;
        let ret = CODE_LEN - 1;
        assert_eq!(image[ret], 0xc3);
        assert_eq!(short_jump_target(&image, 10), ret);
        assert_eq!(short_jump_target(&image, 15), ret);
        assert_eq!(short_jump_target(&image, 28), ret);
        assert_eq!(short_jump_target(&image, 61), 71);
        assert_eq!(short_jump_target(&image, 69), 58);
        assert_eq!(short_jump_target(&image, 74), 84);
        assert_eq!(short_jump_target(&image, 82), 71);
    }

    #[test]
    fn render_patches_only_constants() {
        let image = render(0b11, -10, 250_000_000);
        assert!(has_image_prefix(&image));
        assert_eq!(&image[MASK_OFFSET..MASK_OFFSET + 8], &3_u64.to_le_bytes());
        assert_eq!(&image[SEC_OFFSET..SEC_OFFSET + 8], &(-10_i64).to_le_bytes());
        assert_eq!(&image[NSEC_OFFSET..NSEC_OFFSET + 8], &250_000_000_i64.to_le_bytes());
        assert_eq!(image[..MASK_OFFSET], FAKE_CLOCK_GETTIME[..MASK_OFFSET]);
    }

    #[test]
    fn jump_encoding_is_recognised() {
        let jump = jump_to(0x7f00_dead_b000);
        assert!(is_jump(&jump));
        assert_eq!(&jump[2..10], &0x7f00_dead_b000_u64.to_le_bytes());
        assert!(!is_jump(&FAKE_CLOCK_GETTIME));
        assert!(!has_image_prefix(&jump));
    }
}
