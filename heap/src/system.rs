use std::ptr::NonNull;

pub const OS_PAGE_SIZE: usize = 4096;

#[cfg(unix)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;
    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(target_os = "linux")]
    pub const MAP_NORESERVE: i32 = 0x4000;
    #[cfg(not(target_os = "linux"))]
    pub const MAP_ANON: i32 = 0x1000;
    #[cfg(not(target_os = "linux"))]
    pub const MAP_NORESERVE: i32 = 0x0;

    pub const MAP_FAILED: isize = -1;

    // SAFETY: posix mmap / munmap signatures
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
    }
}

/// Reserve `size` bytes of zeroed, page-aligned memory for the heap.
#[cfg(unix)]
#[must_use]
pub fn reserve_heap(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous private mapping with no address hint
    let p = unsafe {
        unix::mmap(
            core::ptr::null_mut(),
            size,
            unix::PROT_READ | unix::PROT_WRITE,
            unix::MAP_PRIVATE | unix::MAP_ANON | unix::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if p as isize == unix::MAP_FAILED {
        return None;
    }
    NonNull::new(p.cast())
}

/// # Safety
/// `ptr` and `size` must come from a successful [`reserve_heap`].
#[cfg(unix)]
pub unsafe fn release_heap(ptr: NonNull<u8>, size: usize) {
    // SAFETY: caller contract
    let _ = unsafe { unix::munmap(ptr.as_ptr().cast(), size) };
}

#[cfg(not(unix))]
#[must_use]
pub fn reserve_heap(size: usize) -> Option<NonNull<u8>> {
    let layout = std::alloc::Layout::from_size_align(size, OS_PAGE_SIZE).ok()?;
    // SAFETY: layout has non-zero size, checked by HeapSettings::validate
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
}

/// # Safety
/// `ptr` and `size` must come from a successful [`reserve_heap`].
#[cfg(not(unix))]
pub unsafe fn release_heap(ptr: NonNull<u8>, size: usize) {
    if let Ok(layout) = std::alloc::Layout::from_size_align(size, OS_PAGE_SIZE) {
        // SAFETY: caller contract
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}
