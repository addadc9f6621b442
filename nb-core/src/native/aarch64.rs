use super::{
    BLOCK_SIZE, GPR_OFFSET, NativeBackend, RET_GPR_OFFSET, RET_VEC_OFFSET, STACK_LEN_OFFSET,
    STACK_PTR_OFFSET, TARGET_OFFSET, VEC_OFFSET,
};

const X16: u8 = 16;
const X19: u8 = 19;
const FP: u8 = 29;
const SP: u8 = 31;

pub(super) struct Aarch64Backend;

impl NativeBackend for Aarch64Backend {
    fn emit_invoker(forward_fp: bool) -> Vec<u8> {
        let mut code = Vec::with_capacity(160);
        emit_u32(&mut code, 0xA9BE7BFD); // stp x29, x30, [sp, #-32]!
        emit_u32(&mut code, 0x910003FD); // mov x29, sp
        emit_u32(&mut code, 0xF9000BF3); // str x19, [sp, #16]
        emit_mov_reg(&mut code, X19, 0);

        emit_ldr_x(&mut code, 9, X19, STACK_LEN_OFFSET);
        emit_u32(&mut code, 0xCB2963FF); // sub sp, sp, x9
        emit_ldr_x(&mut code, 10, X19, STACK_PTR_OFFSET);
        emit_u32(&mut code, 0x910003EB); // mov x11, sp
        let loop_start = code.len();
        let exit_branch = code.len();
        emit_u32(&mut code, 0xB4000009); // cbz x9, done
        emit_u32(&mut code, 0xF840854C); // ldr x12, [x10], #8
        emit_u32(&mut code, 0xF800856C); // str x12, [x11], #8
        emit_u32(&mut code, 0xD1002129); // sub x9, x9, #8
        let back = (loop_start as i64 - code.len() as i64) / 4;
        emit_u32(&mut code, 0x14000000 | ((back as u32) & 0x03FF_FFFF)); // b loop
        let done = code.len();
        patch_cbz_rel19(&mut code, exit_branch, done);

        if forward_fp {
            for reg in 0..8u8 {
                emit_ldr_d(&mut code, reg, X19, VEC_OFFSET + u32::from(reg) * 8);
            }
        }
        for reg in 0..9u8 {
            emit_ldr_x(&mut code, reg, X19, GPR_OFFSET + u32::from(reg) * 8);
        }
        emit_ldr_x(&mut code, X16, X19, TARGET_OFFSET);
        emit_u32(&mut code, 0xD63F0200); // blr x16
        emit_str_x(&mut code, 0, X19, RET_GPR_OFFSET);
        emit_str_x(&mut code, 1, X19, RET_GPR_OFFSET + 8);
        if forward_fp {
            for reg in 0..4u8 {
                emit_str_d(&mut code, reg, X19, RET_VEC_OFFSET + u32::from(reg) * 8);
            }
        }
        emit_u32(&mut code, 0x910003BF); // mov sp, x29
        emit_u32(&mut code, 0xF9400BF3); // ldr x19, [sp, #16]
        emit_u32(&mut code, 0xA8C27BFD); // ldp x29, x30, [sp], #32
        emit_u32(&mut code, 0xD65F03C0); // ret
        code
    }

    fn emit_thunk(forward_fp: bool, shared: u64, slot: u64, entry: u64) -> Vec<u8> {
        let mut code = Vec::with_capacity(220);
        emit_u32(&mut code, 0xA9BF7BFD); // stp x29, x30, [sp, #-16]!
        emit_u32(&mut code, 0x910003FD); // mov x29, sp
        emit_sub_imm(&mut code, SP, SP, BLOCK_SIZE as u16);
        emit_u32(&mut code, 0x910003E9); // mov x9, sp
        for reg in 0..9u8 {
            emit_str_x(&mut code, reg, 9, GPR_OFFSET + u32::from(reg) * 8);
        }
        if forward_fp {
            for reg in 0..8u8 {
                emit_str_d(&mut code, reg, 9, VEC_OFFSET + u32::from(reg) * 8);
            }
        }
        emit_add_imm(&mut code, 10, FP, 16);
        emit_str_x(&mut code, 10, 9, STACK_PTR_OFFSET);
        emit_mov_imm64(&mut code, 0, shared);
        emit_mov_imm64(&mut code, 1, slot);
        emit_mov_reg(&mut code, 2, 9);
        emit_mov_imm64(&mut code, X16, entry);
        emit_u32(&mut code, 0xD63F0200); // blr x16
        emit_u32(&mut code, 0x910003E9); // mov x9, sp
        emit_ldr_x(&mut code, 0, 9, RET_GPR_OFFSET);
        emit_ldr_x(&mut code, 1, 9, RET_GPR_OFFSET + 8);
        if forward_fp {
            for reg in 0..4u8 {
                emit_ldr_d(&mut code, reg, 9, RET_VEC_OFFSET + u32::from(reg) * 8);
            }
        }
        emit_u32(&mut code, 0x910003BF); // mov sp, x29
        emit_u32(&mut code, 0xA8C17BFD); // ldp x29, x30, [sp], #16
        emit_u32(&mut code, 0xD65F03C0); // ret
        code
    }
}

fn emit_u32(code: &mut Vec<u8>, insn: u32) {
    code.extend_from_slice(&insn.to_le_bytes());
}

fn emit_mov_reg(code: &mut Vec<u8>, dst: u8, src: u8) {
    let insn = 0xAA0003E0_u32 | ((src as u32) << 16) | (dst as u32);
    emit_u32(code, insn);
}

fn emit_mov_imm64(code: &mut Vec<u8>, dst: u8, value: u64) {
    let parts = [
        (value & 0xFFFF) as u16,
        ((value >> 16) & 0xFFFF) as u16,
        ((value >> 32) & 0xFFFF) as u16,
        ((value >> 48) & 0xFFFF) as u16,
    ];

    let Some(first_index) = parts.iter().position(|part| *part != 0) else {
        emit_u32(code, 0xD2800000_u32 | (dst as u32));
        return;
    };

    emit_u32(
        code,
        0xD2800000_u32
            | ((first_index as u32) << 21)
            | ((parts[first_index] as u32) << 5)
            | (dst as u32),
    );

    for (i, part) in parts.iter().enumerate() {
        if i == first_index || *part == 0 {
            continue;
        }
        emit_u32(
            code,
            0xF2800000_u32 | ((i as u32) << 21) | ((*part as u32) << 5) | (dst as u32),
        );
    }
}

fn emit_add_imm(code: &mut Vec<u8>, dst: u8, src: u8, imm12: u16) {
    let insn = 0x91000000_u32 | ((imm12 as u32) << 10) | ((src as u32) << 5) | (dst as u32);
    emit_u32(code, insn);
}

fn emit_sub_imm(code: &mut Vec<u8>, dst: u8, src: u8, imm12: u16) {
    let insn = 0xD1000000_u32 | ((imm12 as u32) << 10) | ((src as u32) << 5) | (dst as u32);
    emit_u32(code, insn);
}

/// ldr xt, [xn, #offset] with an 8-byte scaled offset.
fn emit_ldr_x(code: &mut Vec<u8>, rt: u8, rn: u8, offset: u32) {
    emit_u32(code, 0xF9400000 | ((offset / 8) << 10) | ((rn as u32) << 5) | rt as u32);
}

fn emit_str_x(code: &mut Vec<u8>, rt: u8, rn: u8, offset: u32) {
    emit_u32(code, 0xF9000000 | ((offset / 8) << 10) | ((rn as u32) << 5) | rt as u32);
}

fn emit_ldr_d(code: &mut Vec<u8>, rt: u8, rn: u8, offset: u32) {
    emit_u32(code, 0xFD400000 | ((offset / 8) << 10) | ((rn as u32) << 5) | rt as u32);
}

fn emit_str_d(code: &mut Vec<u8>, rt: u8, rn: u8, offset: u32) {
    emit_u32(code, 0xFD000000 | ((offset / 8) << 10) | ((rn as u32) << 5) | rt as u32);
}

fn patch_cbz_rel19(code: &mut [u8], at: usize, target: usize) {
    let delta = ((target as i64 - at as i64) / 4) as u32 & 0x7FFFF;
    let mut insn = u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]]);
    insn = (insn & !(0x7FFFF << 5)) | (delta << 5);
    code[at..at + 4].copy_from_slice(&insn.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    #[test]
    fn loads_and_stores_scale_offsets() {
        let mut code = Vec::new();
        emit_ldr_x(&mut code, 0, X19, 0);
        emit_ldr_x(&mut code, 8, X19, 64);
        emit_str_d(&mut code, 1, X19, 224);
        assert_eq!(words(&code), vec![0xF9400260, 0xF9402268, 0xFD007261]);
    }

    #[test]
    fn copy_loop_branches_are_patched() {
        let code = Aarch64Backend::emit_invoker(false);
        let insns = words(&code);
        let cbz = insns
            .iter()
            .position(|insn| insn & 0xFF00001F == 0xB4000009)
            .expect("cbz present");
        // cbz skips the four-instruction loop body including the back branch.
        assert_eq!((insns[cbz] >> 5) & 0x7FFFF, 5);
        assert_eq!(insns[cbz + 4], 0x17FFFFFC);
    }

    #[test]
    fn thunk_sets_up_dispatch_arguments() {
        let code = Aarch64Backend::emit_thunk(true, 0x1234, 5, 0xABCD);
        let insns = words(&code);
        assert!(insns.contains(&(0xD2800000 | (0x1234 << 5))));
        assert!(insns.contains(&(0xD2800000 | (5 << 5) | 1)));
        assert!(insns.contains(&0xAA0903E2));
        assert_eq!(insns.last(), Some(&0xD65F03C0));
    }

    #[test]
    fn fp_avoiding_variants_skip_vector_registers() {
        let insns = words(&Aarch64Backend::emit_thunk(false, 1, 2, 3));
        assert!(!insns.iter().any(|insn| insn & 0xFF000000 == 0xFD000000));
    }
}
