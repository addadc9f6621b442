use std::mem::offset_of;

use crate::abi::Abi;
use crate::error::{BridgeError, BridgeResult};

mod aarch64;
mod arm32;
mod memory;
mod riscv;
mod x86;
mod x86_64;

pub(crate) use memory::ExecutableMemory;

/// Register staging shared by the invoker stubs and the callback thunks.
///
/// The invoker loads `gpr`/`vec` into the argument registers, copies
/// `stack_len` bytes from `stack_ptr` to the outgoing stack area and calls
/// `target`. A thunk stores the incoming argument registers here, points
/// `stack_ptr` at the caller's stack arguments and reloads the return
/// registers from `ret_gpr`/`ret_vec` after dispatch.
#[repr(C)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterBlock {
    /// Argument registers; slot 8 is the AArch64 indirect result register.
    pub gpr: [u64; 9],
    pub vec: [u64; 16],
    pub ret_gpr: [u64; 2],
    /// Vector return registers; ST0 as a double on x86.
    pub ret_vec: [u64; 4],
    pub stack_ptr: u64,
    pub stack_len: u64,
    pub target: u64,
    /// SysV `%al` upper bound on vector registers used by a variadic call.
    pub vector_hint: u64,
    /// Bytes an x86 callback thunk pops on return.
    pub callee_pop: u64,
}

pub(crate) const GPR_OFFSET: u32 = offset_of!(RegisterBlock, gpr) as u32;
pub(crate) const VEC_OFFSET: u32 = offset_of!(RegisterBlock, vec) as u32;
pub(crate) const RET_GPR_OFFSET: u32 = offset_of!(RegisterBlock, ret_gpr) as u32;
pub(crate) const RET_VEC_OFFSET: u32 = offset_of!(RegisterBlock, ret_vec) as u32;
pub(crate) const STACK_PTR_OFFSET: u32 = offset_of!(RegisterBlock, stack_ptr) as u32;
pub(crate) const STACK_LEN_OFFSET: u32 = offset_of!(RegisterBlock, stack_len) as u32;
pub(crate) const TARGET_OFFSET: u32 = offset_of!(RegisterBlock, target) as u32;
pub(crate) const VECTOR_HINT_OFFSET: u32 = offset_of!(RegisterBlock, vector_hint) as u32;
pub(crate) const CALLEE_POP_OFFSET: u32 = offset_of!(RegisterBlock, callee_pop) as u32;
pub(crate) const BLOCK_SIZE: u32 = std::mem::size_of::<RegisterBlock>() as u32;

const _: () = assert!(BLOCK_SIZE % 16 == 0);
const _: () = assert!(VEC_OFFSET == 72 && RET_GPR_OFFSET == 200 && TARGET_OFFSET == 264);

/// Little-endian byte access into arrays of 64-bit registers.
pub(crate) fn write_register_bytes(words: &mut [u64], offset: usize, bytes: &[u8]) {
    for (position, byte) in bytes.iter().enumerate() {
        let at = offset + position;
        let Some(word) = words.get_mut(at / 8) else {
            return;
        };
        let shift = (at % 8) * 8;
        *word = (*word & !(0xffu64 << shift)) | (u64::from(*byte) << shift);
    }
}

pub(crate) fn read_register_bytes(words: &[u64], offset: usize, len: usize) -> Vec<u8> {
    (offset..offset + len)
        .map(|at| {
            words
                .get(at / 8)
                .map(|word| (word >> ((at % 8) * 8)) as u8)
                .unwrap_or(0)
        })
        .collect()
}

/// Machine code emitters for one architecture. Emission is pure, so every
/// backend is available on every host; only execution is host bound.
pub(crate) trait NativeBackend {
    /// `extern "C" fn(*mut RegisterBlock)` performing one native call.
    /// Without `forward_fp` no floating point register is touched.
    fn emit_invoker(forward_fp: bool) -> Vec<u8>;

    /// Callback entry that forwards to `entry(shared, slot, block)`.
    fn emit_thunk(forward_fp: bool, shared: u64, slot: u64, entry: u64) -> Vec<u8>;
}

pub fn emit_invoker(abi: Abi, forward_fp: bool) -> Vec<u8> {
    match abi {
        Abi::X86_64SysV => x86_64::SysVBackend::emit_invoker(forward_fp),
        Abi::Win64 => x86_64::Win64Backend::emit_invoker(forward_fp),
        Abi::X86 { .. } => x86::X86Backend::emit_invoker(forward_fp),
        Abi::Arm32 { .. } => arm32::Arm32Backend::emit_invoker(forward_fp),
        Abi::Arm64 { .. } => aarch64::Aarch64Backend::emit_invoker(forward_fp),
        Abi::RiscV32 => riscv::RiscV32Backend::emit_invoker(forward_fp),
        Abi::RiscV64 => riscv::RiscV64Backend::emit_invoker(forward_fp),
    }
}

pub fn emit_thunk(abi: Abi, forward_fp: bool, shared: u64, slot: u64, entry: u64) -> Vec<u8> {
    match abi {
        Abi::X86_64SysV => x86_64::SysVBackend::emit_thunk(forward_fp, shared, slot, entry),
        Abi::Win64 => x86_64::Win64Backend::emit_thunk(forward_fp, shared, slot, entry),
        Abi::X86 { .. } => x86::X86Backend::emit_thunk(forward_fp, shared, slot, entry),
        Abi::Arm32 { .. } => arm32::Arm32Backend::emit_thunk(forward_fp, shared, slot, entry),
        Abi::Arm64 { .. } => aarch64::Aarch64Backend::emit_thunk(forward_fp, shared, slot, entry),
        Abi::RiscV32 => riscv::RiscV32Backend::emit_thunk(forward_fp, shared, slot, entry),
        Abi::RiscV64 => riscv::RiscV64Backend::emit_thunk(forward_fp, shared, slot, entry),
    }
}

/// Hosts whose invoker and thunks are executed, not only emitted.
pub fn runtime_supported() -> bool {
    Abi::host().is_some() && cfg!(any(unix, windows))
}

type InvokerFn = unsafe extern "C" fn(*mut RegisterBlock);

/// Both invoker variants of the host ABI, finalized into executable memory.
pub(crate) struct Invoker {
    abi: Abi,
    with_fp: ExecutableMemory,
    without_fp: ExecutableMemory,
}

impl Invoker {
    pub(crate) fn new(abi: Abi) -> BridgeResult<Self> {
        if !abi.is_host() || !runtime_supported() {
            return Err(BridgeError::UnsupportedHost(format!(
                "cannot execute {abi} stubs on this host"
            )));
        }
        Ok(Self {
            abi,
            with_fp: ExecutableMemory::from_code(&emit_invoker(abi, true))?,
            without_fp: ExecutableMemory::from_code(&emit_invoker(abi, false))?,
        })
    }

    pub(crate) fn abi(&self) -> Abi {
        self.abi
    }

    /// Call `target` with the staged registers and stack bytes.
    ///
    /// # Safety
    /// `target` must be a function of the classified signature and
    /// `stack` must stay valid for the duration of the call.
    pub(crate) unsafe fn invoke(
        &self,
        forward_fp: bool,
        target: usize,
        stack: (usize, usize),
        block: &mut RegisterBlock,
    ) {
        block.target = target as u64;
        block.stack_ptr = stack.0 as u64;
        block.stack_len = stack.1 as u64;
        block.ret_gpr = [0; 2];
        block.ret_vec = [0; 4];
        let memory = if forward_fp {
            &self.with_fp
        } else {
            &self.without_fp
        };
        let entry: InvokerFn = unsafe { std::mem::transmute(memory.ptr()) };
        unsafe { entry(block as *mut RegisterBlock) };
    }
}
