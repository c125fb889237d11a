use core::ptr;

// Mapping is not wired up on Windows yet: every region request fails and the
// rack reports allocation failure instead of crashing.

pub unsafe fn map_anonymous(_size: usize) -> *mut u8 {
    ptr::null_mut() // TODO: VirtualAlloc(MEM_RESERVE | MEM_COMMIT)
}

pub unsafe fn unmap(_ptr: *mut u8, _size: usize) {}

pub unsafe fn advise_free(_ptr: *mut u8, _size: usize) {}

pub fn num_cpus() -> usize {
    1
}

#[inline]
pub fn thread_id() -> usize {
    0
}
