use std::ptr::NonNull;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    #[cfg(target_os = "linux")]
    pub const MAP_NORESERVE: i32 = 0x4000;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_NORESERVE: i32 = 0x40;

    pub const MADV_DONTNEED: i32 = 4;

    pub const MAP_FAILED: isize = -1;

    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;

        pub fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;
    }

    #[inline]
    pub unsafe fn anonymous_mmap(len: usize, prot: i32, extra: i32) -> *mut u8 {
        // SAFETY: fresh anonymous mapping, kernel picks the address
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                prot,
                MAP_PRIVATE | MAP_ANON | extra,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Maps `size` bytes of readable and writable memory.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: this is safe
    let ptr = unsafe {
        unix::anonymous_mmap(size, unix::PROT_READ | unix::PROT_WRITE, 0)
    };
    NonNull::new(ptr)
}

/// Reserves `size` bytes of address space without backing it.
/// Nothing in the range may be touched before it is committed.
#[must_use]
pub fn reserve_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: inaccessible mapping, nothing is read or written
    let ptr = unsafe {
        unix::anonymous_mmap(size, unix::PROT_NONE, unix::MAP_NORESERVE)
    };
    NonNull::new(ptr)
}

/// Makes `[ptr, ptr + size)` of a reservation readable and writable.
#[must_use]
pub fn commit_memory(ptr: NonNull<u8>, size: usize) -> bool {
    debug_assert!((ptr.as_ptr() as usize).is_multiple_of(OS_PAGE_SIZE));
    // SAFETY: caller passes a range inside a live reservation
    let res = unsafe {
        unix::mprotect(
            ptr.as_ptr().cast(),
            size,
            unix::PROT_READ | unix::PROT_WRITE,
        )
    };
    res == 0
}

/// Returns the pages of `[ptr, ptr + size)` to the OS and makes the range
/// inaccessible again. The address space stays reserved.
#[must_use]
pub fn uncommit_memory(ptr: NonNull<u8>, size: usize) -> bool {
    debug_assert!((ptr.as_ptr() as usize).is_multiple_of(OS_PAGE_SIZE));
    // SAFETY: caller passes a range inside a live reservation and promises
    // nothing reads it afterwards
    unsafe {
        if unix::madvise(ptr.as_ptr().cast(), size, unix::MADV_DONTNEED) != 0 {
            return false;
        }
        unix::mprotect(ptr.as_ptr().cast(), size, unix::PROT_NONE) == 0
    }
}

pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from mmap allocation
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_reservation_is_writable() {
        let size = OS_PAGE_SIZE * 4;
        let base = reserve_memory(size).expect("reserve address space");
        assert!(commit_memory(base, OS_PAGE_SIZE * 2));

        // SAFETY: first two pages are committed
        unsafe {
            base.as_ptr().write(0xAB);
            base.as_ptr().add(OS_PAGE_SIZE * 2 - 1).write(0xCD);
            assert_eq!(base.as_ptr().read(), 0xAB);
        }

        assert!(uncommit_memory(base, OS_PAGE_SIZE * 2));
        assert!(commit_memory(base, OS_PAGE_SIZE));
        // SAFETY: recommitted, linux zero fills dropped private pages
        #[cfg(target_os = "linux")]
        assert_eq!(unsafe { base.as_ptr().read() }, 0);
        unmap_memory(base, size);
    }
}
