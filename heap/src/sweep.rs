use std::sync::atomic::{AtomicUsize, Ordering};

use object::{ObjectCategory, ObjectRef, WORD_SIZE};

use crate::{Dispatcher, Heap, RegionDescriptor, RegionKind};

/// Totals of one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub regions_swept: usize,
    pub regions_freed: usize,
    pub live_bytes: usize,
    pub free_bytes: usize,
    pub dark_matter_bytes: usize,
}

impl SweepSummary {
    fn merge(mut self, other: SweepSummary) -> Self {
        self.regions_swept += other.regions_swept;
        self.regions_freed += other.regions_freed;
        self.live_bytes += other.live_bytes;
        self.free_bytes += other.free_bytes;
        self.dark_matter_bytes += other.dark_matter_bytes;
        self
    }
}

/// Sweeps every in-use region in parallel against a complete mark map.
pub fn sweep_heap(heap: &Heap, dispatcher: &Dispatcher) -> SweepSummary {
    let regions: Vec<usize> = heap
        .regions()
        .iter()
        .filter(|r| r.kind() != RegionKind::Free)
        .map(|r| r.index)
        .collect();
    let next = AtomicUsize::new(0);

    let summary = dispatcher
        .run(|_| {
            let mut summary = SweepSummary::default();
            loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(&index) = regions.get(i) else { break };
                summary = summary.merge(sweep_region(heap, heap.regions().get(index)));
            }
            summary
        })
        .into_iter()
        .fold(SweepSummary::default(), SweepSummary::merge);

    heap.stats().record_regions_swept(summary.regions_swept);
    heap.stats().record_regions_freed(summary.regions_freed);
    log::debug!(
        "swept {} regions: {} live, {} free, {} dark matter bytes, {} regions freed",
        summary.regions_swept,
        summary.live_bytes,
        summary.free_bytes,
        summary.dark_matter_bytes,
        summary.regions_freed
    );
    summary
}

/// Drops dead list entries, turns gaps between marked objects into fillers,
/// lowers the top over a trailing gap and refreshes the memory pool. A region
/// with nothing marked is released. Regions whose mark map does not describe
/// them are left alone.
pub fn sweep_region(heap: &Heap, region: &RegionDescriptor) -> SweepSummary {
    if !region.has_valid_mark_map() {
        log::trace!("region {} has no valid mark map, not sweeping", region.index);
        return SweepSummary::default();
    }
    let model = heap.model();
    let mark_map = heap.mark_map();
    let min_free = heap.settings().min_free_entry_size;

    // Dead objects are about to be overwritten; their links go first.
    for category in ObjectCategory::ALL {
        for list in region.ext.lists.slots(category) {
            list.retain(&model, |o| mark_map.is_bit_set(o.addr()));
        }
    }

    let mut live = 0;
    let mut free = 0;
    let mut dark = 0;
    let mut largest = 0;
    let mut cursor = region.start;
    let size_of = |addr: usize| ObjectRef::from_addr(addr).map_or(WORD_SIZE, |o| model.size_in_bytes(o));
    for addr in mark_map.marked_objects(region.start, region.top(), size_of) {
        let size = size_of(addr);
        if addr > cursor {
            let gap = addr - cursor;
            model.write_filler(cursor, gap / WORD_SIZE);
            if gap >= min_free {
                free += gap;
                largest = largest.max(gap);
            } else {
                dark += gap;
            }
        }
        live += size;
        cursor = addr + size;
    }

    let mut summary = SweepSummary {
        regions_swept: 1,
        ..SweepSummary::default()
    };

    if live == 0 && region.ext.critical_sections() == 0 {
        log::trace!("region {} has no live objects, releasing", region.index);
        mark_map.clear_range(region.start, region.end);
        heap.regions().release(heap.memory(), region.index);
        summary.regions_freed = 1;
        summary.free_bytes = region.size();
        return summary;
    }

    let tail = region.top() - cursor;
    if tail > 0 {
        heap.memory().fill(cursor, tail / WORD_SIZE, 0);
        region.set_top(cursor);
    }
    let tail = region.end - cursor;
    free += tail;
    largest = largest.max(tail);

    region.pool.update(free, dark, largest);
    region.ext.set_already_swept(true);
    if region.kind() == RegionKind::Tenure && free + dark > 0 {
        region.ext.set_defragmentation_target(true);
    }

    summary.live_bytes = live;
    summary.free_bytes = free;
    summary.dark_matter_bytes = dark;
    summary
}
