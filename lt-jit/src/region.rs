//! Page-granular memory mappings that start writable and end up executable.

use crate::error::{JitError, JitResult};

pub(crate) struct Region {
    ptr: *mut u8,
    len: usize,
}

// The mapping is owned exclusively by whoever holds the `Region`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub(crate) fn map(min_len: usize) -> JitResult<Self> {
        let len = round_to_page(min_len.max(1))?;
        let ptr = alloc_writable_region(len)?;
        Ok(Self { ptr, len })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub(crate) fn read(&self, at: usize, len: usize) -> &[u8] {
        debug_assert!(at + len <= self.len);
        unsafe { std::slice::from_raw_parts(self.ptr.add(at), len) }
    }

    pub(crate) fn copy_in(&mut self, at: usize, bytes: &[u8]) -> JitResult<()> {
        at.checked_add(bytes.len())
            .filter(|end| *end <= self.len)
            .ok_or(JitError::InvalidArena("write past the end of the mapping"))?;
        write_machine_code(unsafe { self.ptr.add(at) }, bytes);
        Ok(())
    }

    pub(crate) fn make_executable(&mut self, used: usize) -> JitResult<()> {
        finalize_executable_region(self.ptr, self.len)?;
        flush_icache(self.ptr, used);
        Ok(())
    }

    pub(crate) fn into_raw(self) -> (*mut u8, usize) {
        let raw = (self.ptr, self.len);
        std::mem::forget(self);
        raw
    }

    /// # Safety
    /// `ptr`/`len` must come from [`Region::into_raw`] and not be freed yet.
    pub(crate) unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let _ = free_region(self.ptr, self.len);
    }
}

fn round_to_page(len: usize) -> JitResult<usize> {
    let page = page_size();
    len.checked_add(page - 1)
        .map(|padded| padded / page * page)
        .ok_or(JitError::InvalidArena("capacity overflows the address space"))
}

#[cfg(unix)]
pub(crate) fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[cfg(target_os = "windows")]
pub(crate) fn page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    if info.dwPageSize == 0 {
        4096
    } else {
        info.dwPageSize as usize
    }
}

#[cfg(not(any(unix, target_os = "windows")))]
pub(crate) fn page_size() -> usize {
    4096
}

fn write_machine_code(ptr: *mut u8, code: &[u8]) {
    #[cfg(target_os = "macos")]
    unsafe {
        let use_write_protect = pthread_jit_write_protect_supported_np() != 0;
        if use_write_protect {
            pthread_jit_write_protect_np(0);
        }
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        if use_write_protect {
            pthread_jit_write_protect_np(1);
        }
    }

    #[cfg(not(target_os = "macos"))]
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
fn flush_icache(ptr: *mut u8, len: usize) {
    unsafe {
        __clear_cache(ptr as *mut libc::c_char, ptr.add(len) as *mut libc::c_char);
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
fn flush_icache(ptr: *mut u8, len: usize) {
    unsafe { sys_icache_invalidate(ptr as *mut libc::c_void, len) };
}

#[cfg(target_os = "windows")]
fn flush_icache(ptr: *mut u8, len: usize) {
    use windows_sys::Win32::System::{
        Diagnostics::Debug::FlushInstructionCache, Threading::GetCurrentProcess,
    };

    unsafe {
        FlushInstructionCache(GetCurrentProcess(), ptr as *const _, len);
    }
}

#[cfg(not(any(
    all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")),
    target_os = "windows"
)))]
fn flush_icache(_ptr: *mut u8, _len: usize) {}

#[cfg(target_os = "windows")]
fn finalize_executable_region(ptr: *mut u8, len: usize) -> JitResult<()> {
    use windows_sys::Win32::System::Memory::{PAGE_EXECUTE_READ, VirtualProtect};

    let mut old_protect = 0u32;
    let ok = unsafe { VirtualProtect(ptr as *mut _, len, PAGE_EXECUTE_READ, &mut old_protect) };
    if ok == 0 {
        return Err(JitError::Memory(format!(
            "VirtualProtect(PAGE_EXECUTE_READ) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn finalize_executable_region(ptr: *mut u8, len: usize) -> JitResult<()> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(JitError::Memory(format!(
            "mprotect(PROT_READ|PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

// MAP_JIT pages are already RWX; writes are gated per thread instead.
#[cfg(target_os = "macos")]
fn finalize_executable_region(_ptr: *mut u8, _len: usize) -> JitResult<()> {
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
fn finalize_executable_region(_ptr: *mut u8, _len: usize) -> JitResult<()> {
    Err(JitError::Memory(
        "executable memory is not implemented for this platform".to_string(),
    ))
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    #[cfg(target_arch = "aarch64")]
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(target_os = "windows")]
fn alloc_writable_region(len: usize) -> JitResult<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(JitError::Memory(format!(
            "VirtualAlloc failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr)
}

#[cfg(target_os = "windows")]
fn free_region(ptr: *mut u8, _len: usize) -> JitResult<()> {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    if ptr.is_null() {
        return Ok(());
    }
    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(JitError::Memory(format!(
            "VirtualFree failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn alloc_writable_region(len: usize) -> JitResult<*mut u8> {
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
        return Err(JitError::Memory(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "macos")]
fn alloc_writable_region(len: usize) -> JitResult<*mut u8> {
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
        return Err(JitError::Memory(format!(
            "mmap(MAP_JIT) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(unix)]
fn free_region(ptr: *mut u8, len: usize) -> JitResult<()> {
    if ptr.is_null() {
        return Ok(());
    }
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(JitError::Memory(format!(
            "munmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
fn alloc_writable_region(_len: usize) -> JitResult<*mut u8> {
    Err(JitError::Memory(
        "executable memory allocation not implemented for this platform".to_string(),
    ))
}

#[cfg(not(any(unix, target_os = "windows")))]
fn free_region(_ptr: *mut u8, _len: usize) -> JitResult<()> {
    Ok(())
}
