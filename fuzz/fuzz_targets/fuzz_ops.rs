#![no_main]

use libfuzzer_sys::fuzz_target;
use rackalloc::{Rack, RackConfig, SMALL, TINY};
use std::ptr::NonNull;

/// Fuzz target that interprets a byte slice as a sequence of rack operations.
///
/// The first byte picks the size class and configuration. Each operation is
/// then encoded as:
///   byte 0: opcode (0=allocate, 1=free, 2=grow in place, 3=shrink in place,
///           4=allocate zeroed, 5=batch free, 6=pressure relief, 7=check)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 64 live pointers. Each live block is filled with its slot
/// number so overlap between blocks shows up as a pattern mismatch.
const MAX_SLOTS: usize = 64;

fn verify(ptr: NonNull<u8>, size: usize, slot: usize) {
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size.min(256)) };
    assert!(
        bytes.iter().all(|&b| b == slot as u8),
        "block in slot {} overwritten",
        slot
    );
}

fuzz_target!(|data: &[u8]| {
    let Some((&setup, ops)) = data.split_first() else {
        return;
    };
    let params = if setup & 1 == 0 { TINY } else { SMALL };
    let config = RackConfig {
        magazine_count: 1 + (setup as usize >> 1) % 2,
        advise_on_free: setup & 8 != 0,
        randomize_region_start: setup & 16 != 0,
        depot_retained_regions: (setup as usize >> 5) % 3,
    };
    let Ok(rack) = Rack::new(params, config) else {
        return;
    };
    let max_bytes = rack.geometry().max_bytes();

    let mut slots: [Option<(NonNull<u8>, usize)>; MAX_SLOTS] = [None; MAX_SLOTS];
    let mut i = 0;
    while i + 4 <= ops.len() {
        let opcode = ops[i] & 0x07;
        let size = (u16::from_le_bytes([ops[i + 1], ops[i + 2]]) as usize) % (max_bytes + 1);
        let slot = (ops[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 | 4 => {
                if let Some((ptr, old)) = slots[slot].take() {
                    verify(ptr, old, slot);
                    unsafe { rack.deallocate(ptr, None, Some(old)) };
                }
                if let Some(ptr) = rack.allocate_bytes(size, opcode == 4) {
                    let usable = rack.size_of(ptr.as_ptr());
                    assert!(usable >= size.max(1));
                    if opcode == 4 {
                        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), usable.min(256)) };
                        assert!(bytes.iter().all(|&b| b == 0), "zeroed block not zero");
                    }
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), slot as u8, usable) };
                    slots[slot] = Some((ptr, usable));
                }
            }
            1 => {
                if let Some((ptr, old)) = slots[slot].take() {
                    verify(ptr, old, slot);
                    unsafe { rack.deallocate(ptr, None, None) };
                    assert_eq!(rack.size_of(ptr.as_ptr()), 0);
                }
            }
            2 => {
                if let Some((ptr, old)) = slots[slot] {
                    if unsafe { rack.try_realloc_in_place(ptr, old, size) } {
                        let usable = rack.size_of(ptr.as_ptr());
                        assert!(usable >= old.min(size));
                        verify(ptr, old.min(usable), slot);
                        unsafe { std::ptr::write_bytes(ptr.as_ptr(), slot as u8, usable) };
                        slots[slot] = Some((ptr, usable));
                    }
                }
            }
            3 => {
                if let Some((ptr, old)) = slots[slot] {
                    let same = unsafe { rack.try_shrink_in_place(ptr, old, size.min(old)) };
                    assert_eq!(same, ptr);
                    let usable = rack.size_of(ptr.as_ptr());
                    verify(ptr, usable, slot);
                    slots[slot] = Some((ptr, usable));
                }
            }
            5 => {
                let batch: Vec<*mut u8> = slots
                    .iter_mut()
                    .enumerate()
                    .filter(|(j, _)| j % 4 == slot % 4)
                    .filter_map(|(_, s)| s.take())
                    .map(|(ptr, _)| ptr.as_ptr())
                    .collect();
                unsafe { rack.batch_deallocate(&batch) };
            }
            6 => rack.relieve_pressure(),
            7 => assert!(rack.check_consistency(), "{:?}", rack.consistency_report()),
            _ => unreachable!(),
        }
    }

    for (slot, entry) in slots.iter_mut().enumerate() {
        if let Some((ptr, old)) = entry.take() {
            verify(ptr, old, slot);
            unsafe { rack.deallocate(ptr, None, None) };
        }
    }
    assert!(rack.check_consistency(), "{:?}", rack.consistency_report());
    assert!(rack.statistics().blocks_in_use <= rack.magazine_count());
});
