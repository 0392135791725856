use std::sync::atomic::{AtomicUsize, Ordering};

/// Cumulative collector telemetry. Write-only from the collector's point of
/// view: nothing in the core reads these back to make decisions.
#[derive(Debug, Default)]
pub struct GcStats {
    scavenges: AtomicUsize,
    evacuation_failures: AtomicUsize,
    global_collections: AtomicUsize,
    regions_swept: AtomicUsize,
    regions_compacted: AtomicUsize,
    regions_freed: AtomicUsize,
    bytes_recovered: AtomicUsize,
    bytes_copied: AtomicUsize,
    bytes_tenured: AtomicUsize,
    concurrent_cycles: AtomicUsize,
    concurrent_halts: AtomicUsize,
    references_cleared: AtomicUsize,
    objects_finalizable: AtomicUsize,
}

/// Point-in-time copy of [`GcStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub scavenges: usize,
    pub evacuation_failures: usize,
    pub global_collections: usize,
    pub regions_swept: usize,
    pub regions_compacted: usize,
    pub regions_freed: usize,
    pub bytes_recovered: usize,
    pub bytes_copied: usize,
    pub bytes_tenured: usize,
    pub concurrent_cycles: usize,
    pub concurrent_halts: usize,
    pub references_cleared: usize,
    pub objects_finalizable: usize,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $name(&self, n: usize) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl GcStats {
    counter! {
        record_scavenge => scavenges,
        record_evacuation_failure => evacuation_failures,
        record_global_collection => global_collections,
        record_regions_swept => regions_swept,
        record_regions_compacted => regions_compacted,
        record_regions_freed => regions_freed,
        record_bytes_recovered => bytes_recovered,
        record_bytes_copied => bytes_copied,
        record_bytes_tenured => bytes_tenured,
        record_concurrent_cycle => concurrent_cycles,
        record_concurrent_halt => concurrent_halts,
        record_references_cleared => references_cleared,
        record_objects_finalizable => objects_finalizable,
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        StatsSnapshot {
            scavenges: load(&self.scavenges),
            evacuation_failures: load(&self.evacuation_failures),
            global_collections: load(&self.global_collections),
            regions_swept: load(&self.regions_swept),
            regions_compacted: load(&self.regions_compacted),
            regions_freed: load(&self.regions_freed),
            bytes_recovered: load(&self.bytes_recovered),
            bytes_copied: load(&self.bytes_copied),
            bytes_tenured: load(&self.bytes_tenured),
            concurrent_cycles: load(&self.concurrent_cycles),
            concurrent_halts: load(&self.concurrent_halts),
            references_cleared: load(&self.references_cleared),
            objects_finalizable: load(&self.objects_finalizable),
        }
    }
}
