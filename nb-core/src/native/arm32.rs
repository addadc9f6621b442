use super::{
    BLOCK_SIZE, GPR_OFFSET, NativeBackend, RET_GPR_OFFSET, RET_VEC_OFFSET, STACK_LEN_OFFSET,
    STACK_PTR_OFFSET, TARGET_OFFSET, VEC_OFFSET,
};

const R4: u32 = 4;
const R12: u32 = 12;

pub(super) struct Arm32Backend;

impl NativeBackend for Arm32Backend {
    fn emit_invoker(forward_fp: bool) -> Vec<u8> {
        let mut code = Vec::with_capacity(160);
        emit_u32(&mut code, 0xE92D48F0); // push {r4-r7, fp, lr}
        emit_u32(&mut code, 0xE28DB010); // add fp, sp, #16
        emit_u32(&mut code, 0xE1A04000); // mov r4, r0

        emit_ldr(&mut code, 5, R4, STACK_LEN_OFFSET);
        emit_u32(&mut code, 0xE04DD005); // sub sp, sp, r5
        emit_ldr(&mut code, 6, R4, STACK_PTR_OFFSET);
        emit_u32(&mut code, 0xE1A0700D); // mov r7, sp
        let loop_start = code.len();
        emit_u32(&mut code, 0xE3550000); // cmp r5, #0
        let exit_branch = code.len();
        emit_u32(&mut code, 0x0A000000); // beq done
        emit_u32(&mut code, 0xE496C004); // ldr r12, [r6], #4
        emit_u32(&mut code, 0xE487C004); // str r12, [r7], #4
        emit_u32(&mut code, 0xE2455004); // sub r5, r5, #4
        let back = code.len();
        emit_u32(&mut code, 0xEA000000); // b loop
        patch_branch(&mut code, back, loop_start);
        let done = code.len();
        patch_branch(&mut code, exit_branch, done);

        if forward_fp {
            for reg in 0..8u32 {
                emit_vldr(&mut code, reg, R4, VEC_OFFSET + reg * 8);
            }
        }
        for reg in 0..4u32 {
            emit_ldr(&mut code, reg, R4, GPR_OFFSET + reg * 8);
        }
        emit_ldr(&mut code, R12, R4, TARGET_OFFSET);
        emit_u32(&mut code, 0xE12FFF3C); // blx r12
        emit_str(&mut code, 0, R4, RET_GPR_OFFSET);
        emit_str(&mut code, 1, R4, RET_GPR_OFFSET + 8);
        if forward_fp {
            for reg in 0..4u32 {
                emit_vstr(&mut code, reg, R4, RET_VEC_OFFSET + reg * 8);
            }
        }
        emit_u32(&mut code, 0xE24BD010); // sub sp, fp, #16
        emit_u32(&mut code, 0xE8BD88F0); // pop {r4-r7, fp, pc}
        code
    }

    /// Dispatch constants live in a literal pool after the return.
    fn emit_thunk(forward_fp: bool, shared: u64, slot: u64, entry: u64) -> Vec<u8> {
        let mut code = Vec::with_capacity(180);
        emit_u32(&mut code, 0xE92D4830); // push {r4, r5, fp, lr}
        emit_u32(&mut code, 0xE28DB008); // add fp, sp, #8
        debug_assert_eq!(BLOCK_SIZE, 288);
        emit_u32(&mut code, 0xE24DDF48); // sub sp, sp, #288
        emit_u32(&mut code, 0xE1A0400D); // mov r4, sp
        for reg in 0..4u32 {
            emit_str(&mut code, reg, R4, GPR_OFFSET + reg * 8);
        }
        if forward_fp {
            for reg in 0..8u32 {
                emit_vstr(&mut code, reg, R4, VEC_OFFSET + reg * 8);
            }
        }
        emit_u32(&mut code, 0xE28B5008); // add r5, fp, #8
        emit_str(&mut code, 5, R4, STACK_PTR_OFFSET);
        let literal_loads = [code.len(), code.len() + 4, code.len() + 8];
        emit_u32(&mut code, 0xE59F0000); // ldr r0, =shared
        emit_u32(&mut code, 0xE59F1000); // ldr r1, =slot
        emit_u32(&mut code, 0xE59FC000); // ldr r12, =entry
        emit_u32(&mut code, 0xE1A02004); // mov r2, r4
        emit_u32(&mut code, 0xE12FFF3C); // blx r12
        emit_ldr(&mut code, 0, R4, RET_GPR_OFFSET);
        emit_ldr(&mut code, 1, R4, RET_GPR_OFFSET + 8);
        if forward_fp {
            for reg in 0..4u32 {
                emit_vldr(&mut code, reg, R4, RET_VEC_OFFSET + reg * 8);
            }
        }
        emit_u32(&mut code, 0xE24BD008); // sub sp, fp, #8
        emit_u32(&mut code, 0xE8BD8830); // pop {r4, r5, fp, pc}

        for (load, value) in literal_loads.iter().zip([shared, slot, entry]) {
            let literal = code.len();
            emit_u32(&mut code, value as u32);
            patch_literal_load(&mut code, *load, literal);
        }
        code
    }
}

fn emit_u32(code: &mut Vec<u8>, insn: u32) {
    code.extend_from_slice(&insn.to_le_bytes());
}

/// ldr rt, [rn, #offset]
fn emit_ldr(code: &mut Vec<u8>, rt: u32, rn: u32, offset: u32) {
    emit_u32(code, 0xE5900000 | (rn << 16) | (rt << 12) | (offset & 0xFFF));
}

fn emit_str(code: &mut Vec<u8>, rt: u32, rn: u32, offset: u32) {
    emit_u32(code, 0xE5800000 | (rn << 16) | (rt << 12) | (offset & 0xFFF));
}

/// vldr d<reg>, [rn, #offset]
fn emit_vldr(code: &mut Vec<u8>, reg: u32, rn: u32, offset: u32) {
    emit_u32(code, 0xED900B00 | (rn << 16) | (reg << 12) | ((offset / 4) & 0xFF));
}

fn emit_vstr(code: &mut Vec<u8>, reg: u32, rn: u32, offset: u32) {
    emit_u32(code, 0xED800B00 | (rn << 16) | (reg << 12) | ((offset / 4) & 0xFF));
}

fn read_word(code: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
}

/// Branch offsets are relative to the instruction address plus 8.
fn patch_branch(code: &mut [u8], at: usize, target: usize) {
    let delta = ((target as i64 - (at as i64 + 8)) / 4) as u32 & 0x00FF_FFFF;
    let insn = (read_word(code, at) & 0xFF00_0000) | delta;
    code[at..at + 4].copy_from_slice(&insn.to_le_bytes());
}

fn patch_literal_load(code: &mut [u8], at: usize, literal: usize) {
    let delta = (literal - (at + 8)) as u32 & 0xFFF;
    let insn = (read_word(code, at) & !0xFFF) | delta;
    code[at..at + 4].copy_from_slice(&insn.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4).map(|chunk| read_word(chunk, 0)).collect()
    }

    #[test]
    fn vfp_transfers_encode_word_offsets() {
        let mut code = Vec::new();
        emit_vldr(&mut code, 1, R4, 80);
        emit_vstr(&mut code, 0, R4, 216);
        emit_ldr(&mut code, 3, R4, 24);
        assert_eq!(words(&code), vec![0xED941B14, 0xED840B36, 0xE5943018]);
    }

    #[test]
    fn copy_loop_branches_are_patched() {
        let insns = words(&Arm32Backend::emit_invoker(false));
        let cmp = insns
            .iter()
            .position(|insn| *insn == 0xE3550000)
            .expect("cmp present");
        assert_eq!(insns[cmp + 1], 0x0A000003);
        assert_eq!(insns[cmp + 5], 0xEAFFFFF9);
    }

    #[test]
    fn thunk_literal_pool_holds_dispatch_constants() {
        let code = Arm32Backend::emit_thunk(false, 0x1111_2222, 7, 0x3333_4444);
        let insns = words(&code);
        let pool = &insns[insns.len() - 3..];
        assert_eq!(pool, &[0x1111_2222, 7, 0x3333_4444]);
        let load = insns
            .iter()
            .position(|insn| insn & 0xFFFF_F000 == 0xE59F0000)
            .expect("literal load present");
        let literal = (load * 4 + 8 + (insns[load] & 0xFFF) as usize) / 4;
        assert_eq!(insns[literal], 0x1111_2222);
    }

    #[test]
    fn soft_float_variants_skip_vfp() {
        let insns = words(&Arm32Backend::emit_invoker(false));
        assert!(!insns.iter().any(|insn| insn & 0x0E00_0F00 == 0x0C00_0B00));
    }
}
