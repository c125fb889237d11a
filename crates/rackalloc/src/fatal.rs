//! Abort path for heap corruption.
//!
//! Nothing here allocates: the diagnostic is formatted into a stack buffer and
//! written straight to fd 2 before `abort()`.

/// The kinds of corruption the allocator refuses to continue past.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Corruption {
    DoubleFree,
    NotAllocated,
    ChecksumMismatch,
    BoundaryTagMismatch,
    OobOutOfRegion,
    FreeListHeadMismatch,
}

impl Corruption {
    pub const fn describe(self) -> &'static str {
        match self {
            Corruption::DoubleFree => "double free detected",
            Corruption::NotAllocated => "pointer being freed was not allocated",
            Corruption::ChecksumMismatch => "incorrect checksum for freed object",
            Corruption::BoundaryTagMismatch => "boundary tags disagree for block",
            Corruption::OobOutOfRegion => "out-of-band free entry references address outside its region",
            Corruption::FreeListHeadMismatch => "free list head does not match unlinked entry",
        }
    }
}

/// Abort with a diagnostic message to stderr.
#[cold]
#[inline(never)]
pub fn abort_with_message(msg: &str) -> ! {
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
}

/// Report `kind` at `address` and terminate the process.
#[cold]
#[inline(never)]
pub fn corruption(kind: Corruption, address: usize) -> ! {
    let mut buf = [0u8; 160];
    let len = format_diagnostic(&mut buf, kind, address);
    // Only ASCII is written into the buffer.
    let msg = unsafe { core::str::from_utf8_unchecked(&buf[..len]) };
    abort_with_message(msg)
}

fn format_diagnostic(buf: &mut [u8], kind: Corruption, address: usize) -> usize {
    let mut len = 0;
    for part in ["rackalloc: ", kind.describe(), " at 0x"] {
        for &b in part.as_bytes() {
            if len < buf.len() {
                buf[len] = b;
                len += 1;
            }
        }
    }
    let mut digits = [0u8; 16];
    let mut n = address;
    let mut count = 0;
    loop {
        digits[count] = b"0123456789abcdef"[n & 0xF];
        count += 1;
        n >>= 4;
        if n == 0 {
            break;
        }
    }
    while count > 0 && len < buf.len() {
        count -= 1;
        buf[len] = digits[count];
        len += 1;
    }
    if len < buf.len() {
        buf[len] = b'\n';
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_names_kind_and_address() {
        let mut buf = [0u8; 160];
        let len = format_diagnostic(&mut buf, Corruption::DoubleFree, 0x7f00_dead_0010);
        let s = core::str::from_utf8(&buf[..len]).unwrap();
        assert_eq!(s, "rackalloc: double free detected at 0x7f00dead0010\n");
    }

    #[test]
    fn zero_address_formats() {
        let mut buf = [0u8; 160];
        let len = format_diagnostic(&mut buf, Corruption::NotAllocated, 0);
        let s = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(s.ends_with("at 0x0\n"));
    }
}
