//! Region movement between magazines and the depot.

use rackalloc::introspect::{enumerate_region, LocalReader};
use rackalloc::util::DEPOT_INDEX;
use rackalloc::{Rack, RackConfig, TINY};
use std::collections::HashSet;
use std::ptr::NonNull;

/// Largest tiny block; ~220 fit in one region.
const BIG: usize = 63;
const COUNT: usize = 1000;

fn rack_with(config: RackConfig) -> Rack {
    Rack::new(TINY, config).expect("rack")
}

fn single_magazine() -> Rack {
    rack_with(RackConfig {
        magazine_count: 1,
        ..RackConfig::default()
    })
}

fn free(rack: &Rack, p: NonNull<u8>) {
    unsafe { rack.deallocate(p, None, None) };
}

fn fill_regions(rack: &Rack) -> Vec<NonNull<u8>> {
    (0..COUNT).map(|_| rack.allocate(BIG, false).unwrap()).collect()
}

#[test]
fn sparse_magazine_sends_regions_to_the_depot() {
    let rack = single_magazine();
    let blocks = fill_regions(&rack);
    let mapped = rack.statistics().regions_mapped;
    assert!(mapped >= 4, "expected several regions, got {mapped}");

    for p in blocks {
        free(&rack, p);
    }
    let stats = rack.statistics();
    assert!(stats.depot_transfers_in >= 1, "{stats:?}");
    assert!(rack.check_consistency());

    // Re-allocating must drain the depot before mapping anything new.
    let mut previous = rack.statistics();
    let mut again = Vec::new();
    for _ in 0..COUNT {
        again.push(rack.allocate(BIG, false).unwrap());
        let now = rack.statistics();
        if now.regions_mapped > previous.regions_mapped {
            assert_eq!(previous.depot_regions, 0, "mapped while the depot held regions");
        }
        previous = now;
    }
    assert!(previous.depot_transfers_out >= 1);
    for p in again {
        free(&rack, p);
    }
    assert!(rack.check_consistency());
}

#[test]
fn depot_regions_come_back_before_any_new_mapping() {
    let rack = single_magazine();
    let blocks = fill_regions(&rack);
    let base_of = |p: NonNull<u8>| rack.region_of(p.as_ptr()).expect("owned").base();

    // One survivor per region keeps every region mapped.
    let mut seen = HashSet::new();
    let mut survivors = Vec::new();
    for p in blocks {
        if seen.insert(base_of(p)) {
            survivors.push(p);
        } else {
            free(&rack, p);
        }
    }
    let depot_bases: HashSet<usize> = survivors
        .iter()
        .filter(|p| rack.owning_magazine(p.as_ptr()) == Some(DEPOT_INDEX))
        .map(|&p| base_of(p))
        .collect();
    let before = rack.statistics();
    assert!(!depot_bases.is_empty(), "{before:?}");
    assert_eq!(before.depot_regions, depot_bases.len());

    let mut pulled = HashSet::new();
    let mut previous = before;
    let mut again = Vec::new();
    while previous.depot_regions > 0 {
        assert!(again.len() < 2 * COUNT, "depot never drained: {previous:?}");
        let p = rack.allocate(BIG, false).unwrap();
        let now = rack.statistics();
        assert_eq!(now.regions_mapped, before.regions_mapped, "mapped while the depot held regions");
        if now.depot_transfers_out > previous.depot_transfers_out {
            // The block that forced the refill lives in the region just pulled.
            let base = base_of(p);
            assert!(depot_bases.contains(&base), "pulled {base:#x} was not in the depot");
            assert_ne!(rack.owning_magazine(p.as_ptr()), Some(DEPOT_INDEX));
            pulled.insert(base);
        }
        again.push(p);
        previous = now;
    }
    assert_eq!(pulled, depot_bases);

    for p in again.into_iter().chain(survivors) {
        free(&rack, p);
    }
    assert!(rack.check_consistency());
}

#[test]
fn pressure_relief_keeps_only_the_depot_reserve() {
    let rack = single_magazine();
    for p in fill_regions(&rack) {
        free(&rack, p);
    }
    rack.relieve_pressure();

    let stats = rack.statistics();
    let retained = RackConfig::default().depot_retained_regions;
    assert_eq!(stats.blocks_in_use, 0);
    assert_eq!(stats.depot_regions, retained);
    assert_eq!(stats.regions_mapped - stats.regions_unmapped, retained);
    let mut bases = Vec::new();
    rack.region_bases(&mut bases);
    assert_eq!(bases.len(), retained);
    assert!(rack.check_consistency());

    // The reserve is reused rather than mapping afresh.
    let p = rack.allocate(BIG, false).unwrap();
    let after = rack.statistics();
    assert_eq!(after.regions_mapped, stats.regions_mapped);
    assert_eq!(after.depot_transfers_out, stats.depot_transfers_out + 1);
    free(&rack, p);
}

#[test]
fn frees_into_depot_regions_unmap_surplus() {
    let rack = single_magazine();
    let blocks = fill_regions(&rack);
    let (keep, drop_now): (Vec<_>, Vec<_>) = blocks.into_iter().enumerate().partition(|(i, _)| i % 10 == 0);
    for (_, p) in drop_now {
        free(&rack, p);
    }
    rack.relieve_pressure();
    let moved = rack.statistics();
    assert_eq!(moved.bytes_in_use, keep.len() * BIG * 16);
    assert!(rack.check_consistency());

    // Every survivor now lives in a depot region; freeing them empties those
    // regions one by one.
    for (_, p) in keep {
        assert_eq!(rack.size_of(p.as_ptr()), BIG * 16);
        free(&rack, p);
    }
    let stats = rack.statistics();
    assert_eq!(stats.blocks_in_use, 0);
    assert_eq!(
        stats.regions_mapped - stats.regions_unmapped,
        RackConfig::default().depot_retained_regions
    );
    assert!(rack.check_consistency());
}

#[test]
fn advise_on_free_keeps_memory_usable() {
    let rack = rack_with(RackConfig {
        magazine_count: 1,
        advise_on_free: true,
        ..RackConfig::default()
    });
    let blocks: Vec<_> = (0..200).map(|_| rack.allocate(BIG, false).unwrap()).collect();
    for &p in &blocks {
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0xCD, BIG * 16) };
    }
    for p in blocks {
        free(&rack, p);
    }
    assert!(rack.check_consistency());

    for _ in 0..50 {
        let z = rack.allocate(BIG, true).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(z.as_ptr(), BIG * 16) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
    assert!(rack.check_consistency());
}

#[test]
fn randomized_region_start_finalizes_cleanly() {
    let rack = rack_with(RackConfig {
        magazine_count: 1,
        randomize_region_start: true,
        ..RackConfig::default()
    });
    let mut live = Vec::new();
    for i in 0..3000 {
        let p = rack.allocate(1 + i % BIG, false).unwrap();
        if i % 3 == 0 {
            free(&rack, p);
        } else {
            live.push(p);
        }
    }
    assert!(rack.check_consistency());
    rack.relieve_pressure();
    assert!(rack.check_consistency());

    // Live blocks in the enumeration match the live set.
    let mut bases = Vec::new();
    rack.region_bases(&mut bases);
    let reader = unsafe { LocalReader::new() };
    let mut in_use = 0;
    for base in bases {
        enumerate_region(&reader, base, TINY, |r| in_use += r.in_use as usize).unwrap();
    }
    assert_eq!(in_use, live.len());

    for p in live {
        free(&rack, p);
    }
    assert_eq!(rack.statistics().blocks_in_use, 0);
    assert!(rack.check_consistency());
}
