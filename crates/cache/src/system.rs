//! Total system memory query used to clamp the eager-cache budget.

const MB: u64 = 1024 * 1024;

#[cfg(target_os = "macos")]
pub fn physical_ram_bytes() -> Option<u64> {
    use std::ffi::CString;
    use std::mem::size_of;
    use std::ptr;

    let key = CString::new("hw.memsize").ok()?;
    let mut value: u64 = 0;
    let mut len = size_of::<u64>();
    let rc = unsafe {
        libc::sysctlbyname(
            key.as_ptr(),
            &mut value as *mut u64 as *mut libc::c_void,
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    if rc == 0 && len == size_of::<u64>() {
        Some(value)
    } else {
        None
    }
}

#[cfg(target_os = "linux")]
pub fn physical_ram_bytes() -> Option<u64> {
    let mut info = std::mem::MaybeUninit::<libc::sysinfo>::uninit();
    let rc = unsafe { libc::sysinfo(info.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let info = unsafe { info.assume_init() };
    Some((info.totalram as u64).saturating_mul(info.mem_unit as u64))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn physical_ram_bytes() -> Option<u64> {
    None
}

/// Total physical memory in megabytes, if the platform reports it.
pub fn total_system_memory_mb() -> Option<u64> {
    physical_ram_bytes().map(|bytes| bytes / MB)
}
