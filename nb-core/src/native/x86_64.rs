use super::{
    BLOCK_SIZE, GPR_OFFSET, NativeBackend, RET_GPR_OFFSET, RET_VEC_OFFSET, STACK_LEN_OFFSET,
    STACK_PTR_OFFSET, TARGET_OFFSET, VEC_OFFSET, VECTOR_HINT_OFFSET,
};

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R11: u8 = 11;

const SYSV_ARG_GPRS: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const WIN64_ARG_GPRS: [u8; 4] = [RCX, RDX, R8, R9];

pub(super) struct SysVBackend;
pub(super) struct Win64Backend;

impl NativeBackend for SysVBackend {
    fn emit_invoker(forward_fp: bool) -> Vec<u8> {
        let mut code = Vec::with_capacity(160);
        code.push(0x55); // push rbp
        code.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
        code.push(0x53); // push rbx
        code.extend_from_slice(&[0x41, 0x54]); // push r12
        code.extend_from_slice(&[0x48, 0x89, 0xFB]); // mov rbx, rdi
        emit_copy_stack_area(&mut code);
        if forward_fp {
            for xmm in 0..8u8 {
                emit_movq_xmm_load(&mut code, xmm, VEC_OFFSET + u32::from(xmm) * 8);
            }
        }
        for (index, reg) in SYSV_ARG_GPRS.iter().enumerate() {
            emit_load64(&mut code, *reg, GPR_OFFSET + index as u32 * 8);
        }
        emit_load64(&mut code, RAX, VECTOR_HINT_OFFSET);
        emit_load64(&mut code, R11, TARGET_OFFSET);
        code.extend_from_slice(&[0x41, 0xFF, 0xD3]); // call r11
        emit_store64(&mut code, RAX, RET_GPR_OFFSET);
        emit_store64(&mut code, RDX, RET_GPR_OFFSET + 8);
        if forward_fp {
            emit_movq_xmm_store(&mut code, 0, RET_VEC_OFFSET);
            emit_movq_xmm_store(&mut code, 1, RET_VEC_OFFSET + 8);
        }
        code.extend_from_slice(&[0x48, 0x8D, 0x65, 0xF0]); // lea rsp, [rbp-16]
        code.extend_from_slice(&[0x41, 0x5C]); // pop r12
        code.push(0x5B); // pop rbx
        code.push(0x5D); // pop rbp
        code.push(0xC3); // ret
        code
    }

    fn emit_thunk(forward_fp: bool, shared: u64, slot: u64, entry: u64) -> Vec<u8> {
        let mut code = Vec::with_capacity(200);
        code.push(0x55); // push rbp
        code.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
        code.push(0x53); // push rbx
        code.extend_from_slice(&[0x41, 0x54]); // push r12
        emit_sub_rsp(&mut code, BLOCK_SIZE);
        code.extend_from_slice(&[0x48, 0x89, 0xE3]); // mov rbx, rsp
        for (index, reg) in SYSV_ARG_GPRS.iter().enumerate() {
            emit_store64(&mut code, *reg, GPR_OFFSET + index as u32 * 8);
        }
        if forward_fp {
            for xmm in 0..8u8 {
                emit_movq_xmm_store(&mut code, xmm, VEC_OFFSET + u32::from(xmm) * 8);
            }
        }
        code.extend_from_slice(&[0x48, 0x8D, 0x45, 0x10]); // lea rax, [rbp+16]
        emit_store64(&mut code, RAX, STACK_PTR_OFFSET);
        emit_mov_imm64(&mut code, RDI, shared);
        emit_mov_imm64(&mut code, RSI, slot);
        code.extend_from_slice(&[0x48, 0x89, 0xDA]); // mov rdx, rbx
        emit_mov_imm64(&mut code, RAX, entry);
        code.extend_from_slice(&[0xFF, 0xD0]); // call rax
        emit_load64(&mut code, RAX, RET_GPR_OFFSET);
        emit_load64(&mut code, RDX, RET_GPR_OFFSET + 8);
        if forward_fp {
            emit_movq_xmm_load(&mut code, 0, RET_VEC_OFFSET);
            emit_movq_xmm_load(&mut code, 1, RET_VEC_OFFSET + 8);
        }
        code.extend_from_slice(&[0x48, 0x8D, 0x65, 0xF0]); // lea rsp, [rbp-16]
        code.extend_from_slice(&[0x41, 0x5C]); // pop r12
        code.push(0x5B); // pop rbx
        code.push(0x5D); // pop rbp
        code.push(0xC3); // ret
        code
    }
}

impl NativeBackend for Win64Backend {
    fn emit_invoker(forward_fp: bool) -> Vec<u8> {
        let mut code = Vec::with_capacity(140);
        code.push(0x55); // push rbp
        code.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
        code.push(0x53); // push rbx
        code.push(0x56); // push rsi
        code.push(0x57); // push rdi
        code.extend_from_slice(&[0x41, 0x54]); // push r12
        code.extend_from_slice(&[0x48, 0x89, 0xCB]); // mov rbx, rcx
        emit_copy_stack_area(&mut code);
        if forward_fp {
            for xmm in 0..4u8 {
                emit_movq_xmm_load(&mut code, xmm, VEC_OFFSET + u32::from(xmm) * 8);
            }
        }
        for (index, reg) in WIN64_ARG_GPRS.iter().enumerate() {
            emit_load64(&mut code, *reg, GPR_OFFSET + index as u32 * 8);
        }
        emit_load64(&mut code, R11, TARGET_OFFSET);
        code.extend_from_slice(&[0x41, 0xFF, 0xD3]); // call r11
        emit_store64(&mut code, RAX, RET_GPR_OFFSET);
        if forward_fp {
            emit_movq_xmm_store(&mut code, 0, RET_VEC_OFFSET);
        }
        code.extend_from_slice(&[0x48, 0x8D, 0x65, 0xE0]); // lea rsp, [rbp-32]
        code.extend_from_slice(&[0x41, 0x5C]); // pop r12
        code.push(0x5F); // pop rdi
        code.push(0x5E); // pop rsi
        code.push(0x5B); // pop rbx
        code.push(0x5D); // pop rbp
        code.push(0xC3); // ret
        code
    }

    fn emit_thunk(forward_fp: bool, shared: u64, slot: u64, entry: u64) -> Vec<u8> {
        let mut code = Vec::with_capacity(180);
        code.push(0x55); // push rbp
        code.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
        code.push(0x53); // push rbx
        code.extend_from_slice(&[0x41, 0x54]); // push r12
        // Register block above a 32-byte shadow area for the dispatch call.
        emit_sub_rsp(&mut code, BLOCK_SIZE + 32);
        code.extend_from_slice(&[0x48, 0x8D, 0x5C, 0x24, 0x20]); // lea rbx, [rsp+32]
        for (index, reg) in WIN64_ARG_GPRS.iter().enumerate() {
            emit_store64(&mut code, *reg, GPR_OFFSET + index as u32 * 8);
        }
        if forward_fp {
            for xmm in 0..4u8 {
                emit_movq_xmm_store(&mut code, xmm, VEC_OFFSET + u32::from(xmm) * 8);
            }
        }
        code.extend_from_slice(&[0x48, 0x8D, 0x45, 0x10]); // lea rax, [rbp+16]
        emit_store64(&mut code, RAX, STACK_PTR_OFFSET);
        emit_mov_imm64(&mut code, RCX, shared);
        emit_mov_imm64(&mut code, RDX, slot);
        code.extend_from_slice(&[0x49, 0x89, 0xD8]); // mov r8, rbx
        emit_mov_imm64(&mut code, RAX, entry);
        code.extend_from_slice(&[0xFF, 0xD0]); // call rax
        emit_load64(&mut code, RAX, RET_GPR_OFFSET);
        if forward_fp {
            emit_movq_xmm_load(&mut code, 0, RET_VEC_OFFSET);
        }
        code.extend_from_slice(&[0x48, 0x8D, 0x65, 0xF0]); // lea rsp, [rbp-16]
        code.extend_from_slice(&[0x41, 0x5C]); // pop r12
        code.push(0x5B); // pop rbx
        code.push(0x5D); // pop rbp
        code.push(0xC3); // ret
        code
    }
}

/// Reserve `stack_len` bytes below rsp and copy the staged stack area there.
fn emit_copy_stack_area(code: &mut Vec<u8>) {
    emit_load64(code, RCX, STACK_LEN_OFFSET);
    code.extend_from_slice(&[0x48, 0x29, 0xCC]); // sub rsp, rcx
    emit_load64(code, RSI, STACK_PTR_OFFSET);
    code.extend_from_slice(&[0x48, 0x89, 0xE7]); // mov rdi, rsp
    code.extend_from_slice(&[0xF3, 0xA4]); // rep movsb
}

fn rex(w: bool, reg: u8, base: u8) -> u8 {
    0x40 | (u8::from(w) << 3) | ((reg >> 3) << 2) | (base >> 3)
}

fn modrm_rbx_disp32(reg: u8) -> u8 {
    0x80 | ((reg & 7) << 3) | RBX
}

/// mov reg, [rbx+disp32]
fn emit_load64(code: &mut Vec<u8>, reg: u8, disp: u32) {
    code.extend_from_slice(&[rex(true, reg, RBX), 0x8B, modrm_rbx_disp32(reg)]);
    code.extend_from_slice(&disp.to_le_bytes());
}

/// mov [rbx+disp32], reg
fn emit_store64(code: &mut Vec<u8>, reg: u8, disp: u32) {
    code.extend_from_slice(&[rex(true, reg, RBX), 0x89, modrm_rbx_disp32(reg)]);
    code.extend_from_slice(&disp.to_le_bytes());
}

/// movq xmm, [rbx+disp32]
fn emit_movq_xmm_load(code: &mut Vec<u8>, xmm: u8, disp: u32) {
    code.push(0xF3);
    if xmm >= 8 {
        code.push(rex(false, xmm, RBX));
    }
    code.extend_from_slice(&[0x0F, 0x7E, modrm_rbx_disp32(xmm)]);
    code.extend_from_slice(&disp.to_le_bytes());
}

/// movq [rbx+disp32], xmm
fn emit_movq_xmm_store(code: &mut Vec<u8>, xmm: u8, disp: u32) {
    code.push(0x66);
    if xmm >= 8 {
        code.push(rex(false, xmm, RBX));
    }
    code.extend_from_slice(&[0x0F, 0xD6, modrm_rbx_disp32(xmm)]);
    code.extend_from_slice(&disp.to_le_bytes());
}

/// mov reg, imm64
fn emit_mov_imm64(code: &mut Vec<u8>, reg: u8, value: u64) {
    code.extend_from_slice(&[rex(true, 0, reg), 0xB8 | (reg & 7)]);
    code.extend_from_slice(&value.to_le_bytes());
}

/// sub rsp, imm32
fn emit_sub_rsp(code: &mut Vec<u8>, amount: u32) {
    code.extend_from_slice(&[0x48, 0x81, 0xEC]);
    code.extend_from_slice(&amount.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_store_encodings() {
        let mut code = Vec::new();
        emit_load64(&mut code, RDI, 0);
        assert_eq!(code, vec![0x48, 0x8B, 0xBB, 0, 0, 0, 0]);

        code.clear();
        emit_load64(&mut code, R9, 40);
        assert_eq!(code, vec![0x4C, 0x8B, 0x8B, 40, 0, 0, 0]);

        code.clear();
        emit_store64(&mut code, RDX, 208);
        assert_eq!(code, vec![0x48, 0x89, 0x93, 208, 0, 0, 0]);
    }

    #[test]
    fn xmm_moves_use_movq_forms() {
        let mut code = Vec::new();
        emit_movq_xmm_load(&mut code, 1, 80);
        assert_eq!(code, vec![0xF3, 0x0F, 0x7E, 0x8B, 80, 0, 0, 0]);

        code.clear();
        emit_movq_xmm_store(&mut code, 0, 216);
        assert_eq!(code, vec![0x66, 0x0F, 0xD6, 0x83, 216, 0, 0, 0]);
    }

    #[test]
    fn imm64_moves_encode_extended_registers() {
        let mut code = Vec::new();
        emit_mov_imm64(&mut code, RDI, 0x1122_3344_5566_7788);
        assert_eq!(&code[..2], &[0x48, 0xBF]);
        assert_eq!(&code[2..], &0x1122_3344_5566_7788u64.to_le_bytes());

        code.clear();
        emit_mov_imm64(&mut code, R8, 1);
        assert_eq!(&code[..2], &[0x49, 0xB8]);
    }

    #[test]
    fn fp_avoiding_invoker_has_no_sse() {
        let code = SysVBackend::emit_invoker(false);
        assert!(!code.windows(3).any(|w| w == [0xF3, 0x0F, 0x7E]));
        assert!(!code.windows(3).any(|w| w == [0x66, 0x0F, 0xD6]));
        assert_eq!(code.first(), Some(&0x55));
        assert_eq!(code.last(), Some(&0xC3));
    }

    #[test]
    fn thunk_embeds_dispatch_constants() {
        let code = SysVBackend::emit_thunk(true, 0xAAAA_BBBB_CCCC_DDDD, 7, 0x1234_5678);
        let shared = 0xAAAA_BBBB_CCCC_DDDDu64.to_le_bytes();
        assert!(code.windows(8).any(|w| w == shared));
        assert!(code.windows(10).any(|w| w[..2] == [0x48, 0xBE] && w[2] == 7));
    }
}
