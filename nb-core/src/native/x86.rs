use super::{
    BLOCK_SIZE, CALLEE_POP_OFFSET, GPR_OFFSET, NativeBackend, RET_GPR_OFFSET, RET_VEC_OFFSET,
    STACK_LEN_OFFSET, STACK_PTR_OFFSET, TARGET_OFFSET,
};

const EAX: u8 = 0;
const ECX: u8 = 1;
const EDX: u8 = 2;
const ESI: u8 = 6;

/// Outgoing argument bytes below the thunk's register block.
const THUNK_CALL_AREA: u32 = 16;

pub(super) struct X86Backend;

impl NativeBackend for X86Backend {
    /// With `forward_fp` the result is popped from ST0 into `ret_vec[0]`.
    fn emit_invoker(forward_fp: bool) -> Vec<u8> {
        let mut code = Vec::with_capacity(96);
        code.push(0x55); // push ebp
        code.extend_from_slice(&[0x89, 0xE5]); // mov ebp, esp
        code.push(0x53); // push ebx
        code.push(0x56); // push esi
        code.push(0x57); // push edi
        code.extend_from_slice(&[0x8B, 0x5D, 0x08]); // mov ebx, [ebp+8]
        emit_load32(&mut code, ECX, STACK_LEN_OFFSET);
        code.extend_from_slice(&[0x29, 0xCC]); // sub esp, ecx
        code.extend_from_slice(&[0x83, 0xE4, 0xF0]); // and esp, -16
        emit_load32(&mut code, ESI, STACK_PTR_OFFSET);
        code.extend_from_slice(&[0x89, 0xE7]); // mov edi, esp
        code.extend_from_slice(&[0xF3, 0xA4]); // rep movsb
        emit_load32(&mut code, ECX, GPR_OFFSET);
        emit_load32(&mut code, EDX, GPR_OFFSET + 8);
        emit_load32(&mut code, EAX, TARGET_OFFSET);
        code.extend_from_slice(&[0xFF, 0xD0]); // call eax
        emit_store32(&mut code, EAX, RET_GPR_OFFSET);
        emit_store32(&mut code, EDX, RET_GPR_OFFSET + 8);
        if forward_fp {
            code.extend_from_slice(&[0xDD, 0x9B]); // fstp qword [ebx+disp32]
            code.extend_from_slice(&RET_VEC_OFFSET.to_le_bytes());
        }
        code.extend_from_slice(&[0x8D, 0x65, 0xF4]); // lea esp, [ebp-12]
        code.push(0x5F); // pop edi
        code.push(0x5E); // pop esi
        code.push(0x5B); // pop ebx
        code.push(0x5D); // pop ebp
        code.push(0xC3); // ret
        code
    }

    /// The thunk removes `callee_pop` argument bytes by moving the return
    /// address and the saved frame pointer up before returning.
    fn emit_thunk(forward_fp: bool, shared: u64, slot: u64, entry: u64) -> Vec<u8> {
        let mut code = Vec::with_capacity(128);
        code.push(0x55); // push ebp
        code.extend_from_slice(&[0x89, 0xE5]); // mov ebp, esp
        code.push(0x53); // push ebx
        code.extend_from_slice(&[0x81, 0xEC]); // sub esp, imm32
        code.extend_from_slice(&(BLOCK_SIZE + THUNK_CALL_AREA + 20).to_le_bytes());
        code.extend_from_slice(&[0x8D, 0x5C, 0x24, THUNK_CALL_AREA as u8]); // lea ebx, [esp+16]
        emit_store32(&mut code, ECX, GPR_OFFSET);
        emit_store32(&mut code, EDX, GPR_OFFSET + 8);
        code.extend_from_slice(&[0x8D, 0x45, 0x08]); // lea eax, [ebp+8]
        emit_store32(&mut code, EAX, STACK_PTR_OFFSET);
        code.extend_from_slice(&[0x89, 0x5C, 0x24, 0x08]); // mov [esp+8], ebx
        code.extend_from_slice(&[0xC7, 0x44, 0x24, 0x04]); // mov dword [esp+4], imm32
        code.extend_from_slice(&(slot as u32).to_le_bytes());
        code.extend_from_slice(&[0xC7, 0x04, 0x24]); // mov dword [esp], imm32
        code.extend_from_slice(&(shared as u32).to_le_bytes());
        code.push(0xB8); // mov eax, imm32
        code.extend_from_slice(&(entry as u32).to_le_bytes());
        code.extend_from_slice(&[0xFF, 0xD0]); // call eax
        emit_load32(&mut code, EAX, RET_GPR_OFFSET);
        emit_load32(&mut code, EDX, RET_GPR_OFFSET + 8);
        if forward_fp {
            code.extend_from_slice(&[0xDD, 0x83]); // fld qword [ebx+disp32]
            code.extend_from_slice(&RET_VEC_OFFSET.to_le_bytes());
        }
        emit_load32(&mut code, ECX, CALLEE_POP_OFFSET);
        code.extend_from_slice(&[0x8B, 0x5D, 0xFC]); // mov ebx, [ebp-4]
        code.extend_from_slice(&[0xFF, 0x75, 0x04]); // push dword [ebp+4]
        code.extend_from_slice(&[0x8F, 0x44, 0x0D, 0x04]); // pop dword [ebp+ecx+4]
        code.extend_from_slice(&[0xFF, 0x75, 0x00]); // push dword [ebp]
        code.extend_from_slice(&[0x8F, 0x44, 0x0D, 0x00]); // pop dword [ebp+ecx]
        code.extend_from_slice(&[0x8D, 0x64, 0x0D, 0x00]); // lea esp, [ebp+ecx]
        code.push(0x5D); // pop ebp
        code.push(0xC3); // ret
        code
    }
}

/// mov reg, [ebx+disp32]
fn emit_load32(code: &mut Vec<u8>, reg: u8, disp: u32) {
    code.extend_from_slice(&[0x8B, 0x83 | (reg << 3)]);
    code.extend_from_slice(&disp.to_le_bytes());
}

/// mov [ebx+disp32], reg
fn emit_store32(code: &mut Vec<u8>, reg: u8, disp: u32) {
    code.extend_from_slice(&[0x89, 0x83 | (reg << 3)]);
    code.extend_from_slice(&disp.to_le_bytes());
}
