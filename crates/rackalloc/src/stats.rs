use core::sync::atomic::{AtomicUsize, Ordering};

/// Point-in-time counters for one rack.
///
/// Gathered by visiting each magazine under its own lock, so the totals are
/// not an atomic snapshot while other threads are allocating.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RackStats {
    /// Live blocks, including one parked in a last-free cache.
    pub blocks_in_use: usize,
    pub bytes_in_use: usize,
    /// Payload bytes of every region owned by a magazine or the depot.
    pub bytes_in_magazines: usize,
    /// Regions mapped from the OS since the rack was created.
    pub regions_mapped: usize,
    pub regions_unmapped: usize,
    /// Regions currently resident in the depot.
    pub depot_regions: usize,
    /// Regions moved from a magazine into the depot.
    pub depot_transfers_in: usize,
    /// Regions handed from the depot back to a magazine.
    pub depot_transfers_out: usize,
}

/// Counters bumped outside any magazine lock.
#[derive(Default)]
pub(crate) struct RackCounters {
    pub regions_mapped: AtomicUsize,
    pub regions_unmapped: AtomicUsize,
    pub depot_transfers_in: AtomicUsize,
    pub depot_transfers_out: AtomicUsize,
}

impl RackCounters {
    #[inline]
    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fill(&self, stats: &mut RackStats) {
        stats.regions_mapped = self.regions_mapped.load(Ordering::Relaxed);
        stats.regions_unmapped = self.regions_unmapped.load(Ordering::Relaxed);
        stats.depot_transfers_in = self.depot_transfers_in.load(Ordering::Relaxed);
        stats.depot_transfers_out = self.depot_transfers_out.load(Ordering::Relaxed);
    }
}
