//! In-place shrink and grow.

use rackalloc::{Rack, RackConfig, TINY};
use std::ptr::NonNull;

fn tiny_rack() -> Rack {
    let config = RackConfig {
        magazine_count: 1,
        ..RackConfig::default()
    };
    Rack::new(TINY, config).expect("rack")
}

fn free(rack: &Rack, p: NonNull<u8>) {
    unsafe { rack.deallocate(p, None, None) };
}

fn fill(p: NonNull<u8>, len: usize) {
    for i in 0..len {
        unsafe { *p.as_ptr().add(i) = i as u8 };
    }
}

fn check_pattern(p: NonNull<u8>, len: usize) {
    for i in 0..len {
        assert_eq!(unsafe { *p.as_ptr().add(i) }, i as u8, "byte {i}");
    }
}

#[test]
fn shrink_frees_the_tail_for_reuse() {
    let rack = tiny_rack();
    let a = rack.allocate(10, false).unwrap();
    let _guard = rack.allocate(1, false).unwrap();
    fill(a, 160);
    let mapped = rack.statistics().regions_mapped;

    let same = unsafe { rack.try_shrink_in_place(a, 160, 64) };
    assert_eq!(same, a);
    assert_eq!(rack.size_of(a.as_ptr()), 64);
    check_pattern(a, 64);

    // The freed six quanta are handed out next.
    let rest = rack.allocate_bytes(96, false).unwrap();
    assert_eq!(rest.as_ptr() as usize, a.as_ptr() as usize + 64);
    assert_eq!(rack.statistics().regions_mapped, mapped);
    assert!(rack.check_consistency());
}

#[test]
fn shrink_within_a_quantum_is_a_no_op() {
    let rack = tiny_rack();
    let a = rack.allocate(10, false).unwrap();
    let same = unsafe { rack.try_shrink_in_place(a, 160, 150) };
    assert_eq!(same, a);
    assert_eq!(rack.size_of(a.as_ptr()), 160);
}

#[test]
fn grow_fails_against_a_live_neighbour() {
    let rack = tiny_rack();
    let a = rack.allocate(2, false).unwrap();
    let _b = rack.allocate(1, false).unwrap();
    fill(a, 32);
    assert!(!unsafe { rack.try_realloc_in_place(a, 32, 48) });
    assert_eq!(rack.size_of(a.as_ptr()), 32);
    check_pattern(a, 32);
}

#[test]
fn grow_absorbs_a_freed_neighbour() {
    let rack = tiny_rack();
    let a = rack.allocate(2, false).unwrap();
    let b = rack.allocate(4, false).unwrap();
    let _c = rack.allocate(1, false).unwrap();
    fill(a, 32);
    free(&rack, b);

    assert!(unsafe { rack.try_realloc_in_place(a, 32, 96) });
    assert_eq!(rack.size_of(a.as_ptr()), 96);
    check_pattern(a, 32);
    assert!(rack.check_consistency());
    assert_eq!(rack.statistics().blocks_in_use, 2);
}

#[test]
fn grow_splits_a_larger_neighbour() {
    let rack = tiny_rack();
    let a = rack.allocate(1, false).unwrap();
    let b = rack.allocate(8, false).unwrap();
    let _c = rack.allocate(1, false).unwrap();
    free(&rack, b);

    assert!(unsafe { rack.try_realloc_in_place(a, 16, 48) });
    assert_eq!(rack.size_of(a.as_ptr()), 48);
    assert!(rack.check_consistency());

    // Six quanta are left between the grown block and c.
    let d = rack.allocate(6, false).unwrap();
    assert_eq!(d.as_ptr() as usize, a.as_ptr() as usize + 48);
}

#[test]
fn grow_into_the_unclaimed_tail() {
    let rack = tiny_rack();
    let a = rack.allocate(1, false).unwrap();
    assert!(unsafe { rack.try_realloc_in_place(a, 16, 160) });
    assert_eq!(rack.size_of(a.as_ptr()), 160);
    let b = rack.allocate(1, false).unwrap();
    assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 160);
    assert!(rack.check_consistency());
}

#[test]
fn grow_over_two_freed_followers() {
    // a | b | c, 16 bytes each. Freeing b then c leaves c in the last-free
    // cache and b on a free list; growing a to 48 must see both.
    let rack = tiny_rack();
    let a = rack.allocate(1, false).unwrap();
    let b = rack.allocate(1, false).unwrap();
    let c = rack.allocate(1, false).unwrap();
    free(&rack, b);
    free(&rack, c);

    assert!(unsafe { rack.try_realloc_in_place(a, 16, 48) });
    assert_eq!(rack.size_of(a.as_ptr()), 48);
    assert!(rack.check_consistency());
}

#[test]
fn grow_past_the_class_limit_is_refused() {
    let rack = tiny_rack();
    let a = rack.allocate(1, false).unwrap();
    assert!(!unsafe { rack.try_realloc_in_place(a, 16, 1024) });
    // Not growing at all always succeeds.
    assert!(unsafe { rack.try_realloc_in_place(a, 16, 10) });
    assert_eq!(rack.size_of(a.as_ptr()), 16);
}

#[test]
fn huge_resize_requests_leave_the_block_alone() {
    let rack = tiny_rack();
    let a = rack.allocate(1, false).unwrap();
    assert!(!unsafe { rack.try_realloc_in_place(a, 16, usize::MAX - 3) });
    assert!(!unsafe { rack.try_realloc_in_place(a, 16, usize::MAX) });
    assert_eq!(rack.size_of(a.as_ptr()), 16);
    assert_eq!(unsafe { rack.try_shrink_in_place(a, 16, usize::MAX) }, a);
    assert_eq!(rack.size_of(a.as_ptr()), 16);
    assert!(rack.check_consistency());
}
