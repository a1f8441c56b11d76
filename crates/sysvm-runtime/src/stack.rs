//! Native stack limit for generated code
//!
//! Generated code compares its stack pointer against the limit published in
//! the VM context at every function entry. The limit is `max_native_stack`
//! below the stack at call start, but never closer to the end of the calling
//! thread's stack than one maximal frame plus room for host intrinsics.

/// Stack kept free below the limit for host intrinsics and runtime builtins
pub(crate) const HOST_STACK_RESERVE: usize = 128 * 1024;

/// Return address, saved registers and trampoline frame on top of a frame's body
const FRAME_OVERHEAD: usize = 4 * 1024;

/// Lowest stack pointer generated code may run at when entered at `top`
pub(crate) fn stack_limit(top: usize, max_native_stack: usize, max_frame_size: u32) -> usize {
    let configured = top.saturating_sub(max_native_stack);
    match stack_bottom() {
        Some(bottom) => {
            let floor = bottom
                .saturating_add(HOST_STACK_RESERVE)
                .saturating_add(FRAME_OVERHEAD)
                .saturating_add(max_frame_size as usize);
            configured.max(floor)
        }
        None => configured,
    }
}

/// Lowest usable address of the current thread's stack
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn stack_bottom() -> Option<usize> {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        (rc == 0 && !addr.is_null()).then_some(addr as usize)
    }
}

#[cfg(target_vendor = "apple")]
pub(crate) fn stack_bottom() -> Option<usize> {
    unsafe {
        let thread = libc::pthread_self();
        let top = libc::pthread_get_stackaddr_np(thread) as usize;
        top.checked_sub(libc::pthread_get_stacksize_np(thread))
    }
}

#[cfg(windows)]
pub(crate) fn stack_bottom() -> Option<usize> {
    use windows_sys::Win32::System::Threading::GetCurrentThreadStackLimits;

    let mut low = 0usize;
    let mut high = 0usize;
    unsafe { GetCurrentThreadStackLimits(&mut low, &mut high) };
    (low != 0).then_some(low)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    windows
)))]
pub(crate) fn stack_bottom() -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn here() -> usize {
        let marker = 0u8;
        std::ptr::addr_of!(marker) as usize
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "android", target_vendor = "apple", windows))]
    fn test_stack_bottom_is_below_current_frame() {
        let bottom = stack_bottom().unwrap();
        assert!(bottom < here());
    }

    #[test]
    fn test_limit_is_clamped_to_small_thread_stacks() {
        let limits = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(|| {
                let top = here();
                (top, stack_bottom(), stack_limit(top, 1024 * 1024, 8 * 1024))
            })
            .unwrap()
            .join()
            .unwrap();
        let (top, bottom, limit) = limits;
        match bottom {
            Some(bottom) => {
                assert!(limit >= bottom + HOST_STACK_RESERVE + 8 * 1024);
                assert!(limit > top - 1024 * 1024);
            }
            None => assert_eq!(limit, top.saturating_sub(1024 * 1024)),
        }
    }

    #[test]
    fn test_large_threads_keep_the_configured_limit() {
        let top = here();
        let limit = stack_limit(top, 64 * 1024, 0);
        if stack_bottom().is_some_and(|bottom| top - bottom > 1024 * 1024) {
            assert_eq!(limit, top - 64 * 1024);
        }
    }
}
