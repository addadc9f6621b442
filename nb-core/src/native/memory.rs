use crate::error::{BridgeError, BridgeResult};

/// Page-backed region holding finalized machine code.
pub(crate) struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
}

impl ExecutableMemory {
    pub(crate) fn from_code(code: &[u8]) -> BridgeResult<Self> {
        let len = code.len();
        if len == 0 {
            return Err(BridgeError::Native(
                "cannot create executable region for empty code".to_string(),
            ));
        }
        let ptr = alloc_executable_region(len)?;
        let memory = Self { ptr, len };
        write_machine_code(ptr, code)?;
        finalize_executable_region(ptr, len)?;
        Ok(memory)
    }

    pub(crate) fn ptr(&self) -> *const u8 {
        self.ptr
    }

    pub(crate) fn addr_at(&self, offset: usize) -> usize {
        self.ptr as usize + offset
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        if let Err(err) = free_executable_region(self.ptr, self.len) {
            tracing::warn!(error = %err, "failed to release executable region");
        }
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
fn alloc_executable_region(len: usize) -> BridgeResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(BridgeError::Native(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "macos")]
fn alloc_executable_region(len: usize) -> BridgeResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(BridgeError::Native(format!(
            "mmap(MAP_JIT) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "windows")]
fn alloc_executable_region(len: usize) -> BridgeResult<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    if ptr.is_null() {
        return Err(BridgeError::Native(format!(
            "VirtualAlloc failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(not(any(unix, windows)))]
fn alloc_executable_region(_len: usize) -> BridgeResult<*mut u8> {
    Err(BridgeError::UnsupportedHost(
        "no executable memory support on this platform".to_string(),
    ))
}

fn write_machine_code(ptr: *mut u8, code: &[u8]) -> BridgeResult<()> {
    #[cfg(target_os = "macos")]
    unsafe {
        let use_write_protect = pthread_jit_write_protect_supported_np() != 0;
        if use_write_protect {
            pthread_jit_write_protect_np(0);
        }
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        sys_icache_invalidate(ptr as *mut libc::c_void, code.len());
        if use_write_protect {
            pthread_jit_write_protect_np(1);
        }
    }

    #[cfg(not(target_os = "macos"))]
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
    }

    #[cfg(all(
        target_os = "linux",
        any(target_arch = "aarch64", target_arch = "arm", target_arch = "riscv64", target_arch = "riscv32")
    ))]
    unsafe {
        __clear_cache(
            ptr as *mut libc::c_char,
            ptr.add(code.len()) as *mut libc::c_char,
        );
    }

    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn finalize_executable_region(ptr: *mut u8, len: usize) -> BridgeResult<()> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(BridgeError::Native(format!(
            "mprotect(PROT_READ|PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn finalize_executable_region(_ptr: *mut u8, _len: usize) -> BridgeResult<()> {
    Ok(())
}

#[cfg(target_os = "windows")]
fn finalize_executable_region(ptr: *mut u8, len: usize) -> BridgeResult<()> {
    use windows_sys::Win32::{
        Foundation::HANDLE,
        System::{
            Diagnostics::Debug::FlushInstructionCache,
            Memory::{PAGE_EXECUTE_READ, VirtualProtect},
            Threading::GetCurrentProcess,
        },
    };

    let mut old_protect = 0u32;
    let ok = unsafe { VirtualProtect(ptr as *mut _, len, PAGE_EXECUTE_READ, &mut old_protect) };
    if ok == 0 {
        return Err(BridgeError::Native(format!(
            "VirtualProtect(PAGE_EXECUTE_READ) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let process: HANDLE = unsafe { GetCurrentProcess() };
    let ok = unsafe { FlushInstructionCache(process, ptr as *const _, len) };
    if ok == 0 {
        return Err(BridgeError::Native(format!(
            "FlushInstructionCache failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn finalize_executable_region(_ptr: *mut u8, _len: usize) -> BridgeResult<()> {
    Ok(())
}

#[cfg(unix)]
fn free_executable_region(ptr: *mut u8, len: usize) -> BridgeResult<()> {
    if ptr.is_null() {
        return Ok(());
    }
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(BridgeError::Native(format!(
            "munmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn free_executable_region(ptr: *mut u8, _len: usize) -> BridgeResult<()> {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    if ptr.is_null() {
        return Ok(());
    }
    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(BridgeError::Native(format!(
            "VirtualFree failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn free_executable_region(_ptr: *mut u8, _len: usize) -> BridgeResult<()> {
    Ok(())
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "aarch64", target_arch = "arm", target_arch = "riscv64", target_arch = "riscv32")
))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}
