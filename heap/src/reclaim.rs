//! Chooses which regions a global collection sweeps and compacts.
//!
//! Every choice starts from a fresh atomic sweep, so the free and dark matter
//! byte counts the scores are built from describe the heap as it is now.

use crate::{
    CompactGroupCycle, CompactGroups, CompactSummary, Dispatcher, Heap, RegionDescriptor, RegionKind,
    SweepSummary, sweep::sweep_heap,
};

/// Capacity of the sorted candidate array.
pub const MAX_SCORED_REGIONS: usize = 1024;

/// Whether the collection reclaims the whole heap or works to a byte goal.
/// Partial collections leave regions with an inaccurate remembered set alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Full,
    Partial,
}

/// `100 * emptiness * (1 - potential wasted work)`.
///
/// Potential wasted work is the share of the bytes moved now that would have
/// died soon anyway: `(1 - weighted_survival_rate) * (1 - emptiness)`.
pub fn compact_score(free_bytes: usize, region_size: usize, weighted_survival_rate: f64) -> f64 {
    if region_size == 0 {
        return 0.0;
    }
    let emptiness = (free_bytes as f64 / region_size as f64).clamp(0.0, 1.0);
    let wasted = (1.0 - weighted_survival_rate) * (1.0 - emptiness);
    100.0 * emptiness * (1.0 - wasted)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredRegion {
    pub index: usize,
    pub score: f64,
}

/// The highest scoring regions, kept sorted by descending score.
#[derive(Debug)]
pub struct TopRegions {
    entries: Vec<ScoredRegion>,
    capacity: usize,
}

impl TopRegions {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Inserts by swapping down from the tail; evicts the lowest entry when
    /// full. Returns the evicted region, or the candidate itself if it did not
    /// make the cut.
    pub fn insert(&mut self, candidate: ScoredRegion) -> Option<ScoredRegion> {
        let evicted = if self.entries.len() < self.capacity {
            self.entries.push(candidate);
            None
        } else {
            match self.entries.last_mut() {
                Some(last) if last.score < candidate.score => Some(std::mem::replace(last, candidate)),
                _ => return Some(candidate),
            }
        };
        let mut i = self.entries.len() - 1;
        while i > 0 && self.entries[i - 1].score < self.entries[i].score {
            self.entries.swap(i - 1, i);
            i -= 1;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[ScoredRegion] {
        &self.entries
    }
}

/// Region selection for one global collection.
pub struct ReclaimDelegate<'h, 'g> {
    heap: &'h Heap,
    groups: &'g mut CompactGroups,
    max_scored: usize,
}

impl<'h, 'g> ReclaimDelegate<'h, 'g> {
    pub fn new(heap: &'h Heap, groups: &'g mut CompactGroups) -> Self {
        Self {
            heap,
            groups,
            max_scored: MAX_SCORED_REGIONS,
        }
    }

    fn group_of(&self, region: &RegionDescriptor) -> usize {
        region.compact_group(self.heap.settings().max_region_age)
    }

    fn live_bytes(region: &RegionDescriptor) -> usize {
        region.size().saturating_sub(region.pool.free_and_dark_matter_bytes())
    }

    /// Sweeps the whole heap against the current mark map and resets this
    /// cycle's group measurements from the result. Every region swept
    /// against a valid mark map is marked for reclaim.
    pub fn perform_atomic_sweep(&mut self, dispatcher: &Dispatcher) -> SweepSummary {
        for region in self.heap.regions().iter() {
            region.ext.set_already_swept(false);
        }
        let summary = sweep_heap(self.heap, dispatcher);

        self.groups.reset_cycle();
        for region in self.heap.regions().iter().filter(|r| r.kind() != RegionKind::Free) {
            if region.has_valid_mark_map() && region.ext.already_swept() {
                region.ext.set_should_reclaim(true);
            }
            let group = self.group_of(region);
            let cycle = self.groups.cycle_mut(group);
            cycle.regions += 1;
            cycle.free_bytes += region.pool.free_and_dark_matter_bytes();
            cycle.live_before_group += Self::live_bytes(region);
        }
        summary
    }

    /// Score of one region for this collection; 0 excludes it.
    pub fn derive_compact_score(&self, region: &RegionDescriptor) -> f64 {
        let ext = &region.ext;
        if region.kind() == RegionKind::Free
            || !region.has_valid_mark_map()
            || !ext.is_defragmentation_target()
            || !ext.remembered_set.is_accurate()
            || !ext.already_swept()
            || ext.critical_sections() > 0
            || ext.in_collection_set()
        {
            return 0.0;
        }
        compact_score(
            region.pool.free_and_dark_matter_bytes(),
            region.size(),
            self.groups.weighted_survival_rate(self.group_of(region)),
        )
    }

    /// Scores every region, keeps the best [`MAX_SCORED_REGIONS`] and prunes
    /// those that would not free another whole region in their group.
    ///
    /// Recoverable bytes count every positive scoring region, including
    /// those pushed out of the sorted list.
    pub fn score_regions(&mut self) -> TopRegions {
        let mut top = TopRegions::new(self.max_scored);
        for group in 0..self.groups.len() {
            self.groups.cycle_mut(group).recoverable_bytes = 0;
        }

        for region in self.heap.regions().iter() {
            let score = self.derive_compact_score(region);
            region.ext.set_compact_score(score);
            let group = self.group_of(region);
            let free = region.pool.free_and_dark_matter_bytes();
            if region.ext.in_collection_set() {
                // Its space comes back through the other algorithm.
                self.groups.cycle_mut(group).recoverable_bytes += free;
                continue;
            }
            if score <= 0.0 {
                continue;
            }
            self.groups.cycle_mut(group).recoverable_bytes += free;
            if let Some(evicted) = top.insert(ScoredRegion { index: region.index, score }) {
                self.heap.regions().get(evicted.index).ext.set_compact_score(0.0);
            }
        }

        self.prune(&mut top);
        log::debug!("{} regions scored for compaction", top.len());
        top
    }

    fn prune(&mut self, top: &mut TopRegions) {
        let region_size = self.heap.regions().region_size();
        let regions = self.heap.regions();
        let mut pruned = vec![false; top.entries.len()];
        for (i, entry) in top.entries.iter().enumerate().rev() {
            let region = regions.get(entry.index);
            let free = region.pool.free_and_dark_matter_bytes();
            let group = self.group_of(region);
            let cycle = self.groups.cycle_mut(group);
            let recoverable = cycle.recoverable_bytes;
            if recoverable / region_size == (recoverable - free) / region_size {
                cycle.recoverable_bytes -= free;
                region.ext.set_compact_score(0.0);
                pruned[i] = true;
            }
        }
        let mut i = 0;
        top.entries.retain(|_| {
            let keep = !pruned[i];
            i += 1;
            keep
        });
    }

    fn select(&mut self, region: &RegionDescriptor) {
        region.ext.set_should_reclaim(true);
        region.ext.set_should_compact(true);
        region.ext.set_defragmentation_target(false);
        let live = Self::live_bytes(region);
        let group = self.group_of(region);
        self.groups.cycle_mut(group).live_before_collected_set += live;
    }

    /// Every region marked for reclaim with reusable space compacts.
    pub fn tag_regions_before_compact(&mut self, kind: CollectionKind) -> usize {
        let heap = self.heap;
        let mut tagged = 0;
        for region in heap.regions().iter() {
            let ext = &region.ext;
            if region.kind() == RegionKind::Free
                || !region.has_valid_mark_map()
                || !ext.should_reclaim()
                || (kind == CollectionKind::Partial && !ext.remembered_set.is_accurate())
                || !ext.already_swept()
                || ext.critical_sections() > 0
                || ext.in_collection_set()
                || region.pool.free_and_dark_matter_bytes() == 0
            {
                continue;
            }
            self.select(region);
            tagged += 1;
        }
        log::debug!("tagged {tagged} regions for a {kind:?} compaction");
        tagged
    }

    /// Partial collection: takes regions in descending score order until
    /// the live bytes they would move exceed `work_goal`. The region that
    /// crosses the goal is included.
    pub fn tag_regions_before_compact_with_work_goal(&mut self, work_goal: usize) -> usize {
        let top = self.score_regions();
        let heap = self.heap;
        let mut planned = 0;
        let mut tagged = 0;
        for entry in top.as_slice() {
            let region = heap.regions().get(entry.index);
            let live = Self::live_bytes(region);
            let reached = planned + live > work_goal;
            planned += live;
            self.select(region);
            tagged += 1;
            if reached {
                break;
            }
        }
        log::debug!("tagged {tagged} regions moving {planned} bytes for a {work_goal} byte goal");
        tagged
    }

    /// Whole regions a compaction of the scored candidates would free.
    pub fn estimate_reclaimable_regions(&mut self) -> usize {
        self.score_regions();
        let region_size = self.heap.regions().region_size();
        (0..self.groups.len())
            .map(|g| self.groups.cycle(g).recoverable_bytes / region_size)
            .sum()
    }

    /// Folds compaction results into group history and clears per-cycle
    /// tags. `None` means compaction did not run.
    pub fn post_compact_cleanup(&mut self, summary: Option<&CompactSummary>) {
        if let Some(summary) = summary {
            for &(group, live) in &summary.live_after {
                self.groups.cycle_mut(group).live_after_collected_set += live;
            }
            let recovered: usize = (0..self.groups.len())
                .map(|g| {
                    let CompactGroupCycle {
                        live_before_collected_set: before,
                        live_after_collected_set: after,
                        ..
                    } = *self.groups.cycle(g);
                    before.saturating_sub(after)
                })
                .sum();
            self.heap
                .stats()
                .record_bytes_recovered(recovered + summary.regions_freed * self.heap.regions().region_size());
            self.groups.update_survival_rates();
        }
        for region in self.heap.regions().iter() {
            region.ext.set_should_compact(false);
            region.ext.set_should_reclaim(false);
            region.ext.set_in_collection_set(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{small_heap, small_settings};
    use object::ClassTable;

    fn region_with_free<'h>(heap: &'h Heap, free: usize) -> &'h RegionDescriptor {
        let region = heap.regions().acquire(RegionKind::Tenure).unwrap();
        region.set_top(region.end - free);
        region.pool.update(free, 0, free);
        region.set_valid_mark_map(true);
        region.ext.set_should_reclaim(true);
        region.ext.set_defragmentation_target(true);
        region
    }

    #[test]
    fn empty_region_scores_zero_and_free_region_scores_full() {
        assert_eq!(compact_score(0, 4096, 0.3), 0.0);
        assert_eq!(compact_score(4096, 4096, 0.0), 100.0);
    }

    #[test]
    fn score_of_a_quarter_full_region() {
        let score = compact_score(4096 - 1000, 4096, 0.5);
        assert!((score - 66.4).abs() < 0.05, "got {score}");
    }

    #[test]
    fn top_regions_stay_sorted_and_evict_the_lowest() {
        let mut top = TopRegions::new(3);
        for (index, score) in [(0, 5.0), (1, 9.0), (2, 1.0)] {
            assert_eq!(top.insert(ScoredRegion { index, score }), None);
        }
        let evicted = top.insert(ScoredRegion { index: 3, score: 7.0 });
        assert_eq!(evicted.map(|e| e.index), Some(2));
        let order: Vec<_> = top.as_slice().iter().map(|e| e.index).collect();
        assert_eq!(order, vec![1, 3, 0]);
        assert_eq!(top.insert(ScoredRegion { index: 4, score: 0.5 }).map(|e| e.index), Some(4));
    }

    #[test]
    fn ineligible_regions_score_zero() {
        let heap = small_heap(ClassTable::new(), small_settings());
        let mut groups = CompactGroups::new(heap.settings().compact_group_count());
        let size = heap.regions().region_size();

        let pinned = region_with_free(&heap, size / 2);
        pinned.ext.enter_critical();
        let unswept = region_with_free(&heap, size / 2);
        unswept.ext.set_already_swept(false);
        let rebuilding = region_with_free(&heap, size / 2);
        rebuilding.ext.remembered_set.begin_rebuild();
        let unmarked = region_with_free(&heap, size / 2);
        unmarked.set_valid_mark_map(false);
        let eligible = region_with_free(&heap, size / 2);

        let delegate = ReclaimDelegate::new(&heap, &mut groups);
        assert_eq!(delegate.derive_compact_score(pinned), 0.0);
        assert_eq!(delegate.derive_compact_score(unswept), 0.0);
        assert_eq!(
            delegate.derive_compact_score(rebuilding),
            0.0,
            "an inaccurate remembered set is never scored"
        );
        assert_eq!(delegate.derive_compact_score(unmarked), 0.0);
        assert!(delegate.derive_compact_score(eligible) > 0.0);
    }

    #[test]
    fn work_goal_takes_best_regions_until_the_goal_is_crossed() {
        let heap = small_heap(ClassTable::new(), small_settings());
        let mut groups = CompactGroups::new(heap.settings().compact_group_count());
        let kb = 1024;
        let regions: Vec<_> = [8 * kb, 12 * kb, 6 * kb, 10 * kb]
            .into_iter()
            .map(|free| region_with_free(&heap, free))
            .collect();

        let mut delegate = ReclaimDelegate::new(&heap, &mut groups);
        let tagged = delegate.tag_regions_before_compact_with_work_goal(9 * kb);
        assert_eq!(tagged, 2, "4KB then 6KB of live data crosses a 9KB goal");
        assert!(regions[1].ext.should_reclaim() && regions[3].ext.should_reclaim());
        assert!(regions[1].ext.should_compact() && regions[3].ext.should_compact());
        assert!(!regions[0].ext.should_compact() && !regions[2].ext.should_compact());
        assert!(!regions[1].ext.is_defragmentation_target(), "selection clears the target flag");
        assert!(regions[0].ext.is_defragmentation_target());
    }

    #[test]
    fn work_goal_boundary_is_exclusive() {
        let kb = 1024;
        let tagged_for = |goal: usize| {
            let heap = small_heap(ClassTable::new(), small_settings());
            let mut groups = CompactGroups::new(heap.settings().compact_group_count());
            for free in [8 * kb, 12 * kb, 6 * kb, 10 * kb] {
                region_with_free(&heap, free);
            }
            ReclaimDelegate::new(&heap, &mut groups).tag_regions_before_compact_with_work_goal(goal)
        };
        assert_eq!(tagged_for(0), 1, "the first region is always taken");
        assert_eq!(tagged_for(10 * kb), 3, "meeting the goal exactly keeps going");
        assert_eq!(tagged_for(usize::MAX), 4);
    }

    #[test]
    fn evicted_regions_still_count_as_recoverable() {
        let heap = small_heap(ClassTable::new(), small_settings());
        let mut groups = CompactGroups::new(heap.settings().compact_group_count());
        let kb = 1024;
        let best = region_with_free(&heap, 12 * kb);
        let second = region_with_free(&heap, 10 * kb);
        let evicted = region_with_free(&heap, 8 * kb);
        let group = best.compact_group(heap.settings().max_region_age);

        let mut delegate = ReclaimDelegate::new(&heap, &mut groups);
        delegate.max_scored = 2;
        let top = delegate.score_regions();
        let kept: Vec<_> = top.as_slice().iter().map(|e| e.index).collect();
        assert_eq!(kept, vec![best.index], "second region adds no whole region on top of 30KB");
        assert_eq!(second.ext.compact_score(), 0.0);
        assert_eq!(evicted.ext.compact_score(), 0.0);
        assert_eq!(delegate.groups.cycle(group).recoverable_bytes, 20 * kb);
    }

    #[test]
    fn pruning_drops_regions_that_free_no_whole_region() {
        let heap = small_heap(ClassTable::new(), small_settings());
        let mut groups = CompactGroups::new(heap.settings().compact_group_count());
        let size = heap.regions().region_size();
        let kb = 1024;
        let a = region_with_free(&heap, size - kb);
        let b = region_with_free(&heap, size - kb);
        let crumb = region_with_free(&heap, kb);

        let mut delegate = ReclaimDelegate::new(&heap, &mut groups);
        let top = delegate.score_regions();
        let kept: Vec<_> = top.as_slice().iter().map(|e| e.index).collect();
        assert_eq!(kept.len(), 2);
        assert!(kept.contains(&a.index) && kept.contains(&b.index));
        assert_eq!(crumb.ext.compact_score(), 0.0);
        assert_eq!(delegate.estimate_reclaimable_regions(), 1);
    }

    #[test]
    fn full_compaction_tags_every_region_with_space() {
        let heap = small_heap(ClassTable::new(), small_settings());
        let mut groups = CompactGroups::new(heap.settings().compact_group_count());
        let dense = region_with_free(&heap, 0);
        let sparse = region_with_free(&heap, 100);
        let claimed = region_with_free(&heap, 4096);
        claimed.ext.set_in_collection_set(true);
        let unreclaimed = region_with_free(&heap, 4096);
        unreclaimed.ext.set_should_reclaim(false);
        let stale = region_with_free(&heap, 4096);
        stale.set_valid_mark_map(false);

        let mut delegate = ReclaimDelegate::new(&heap, &mut groups);
        assert_eq!(delegate.tag_regions_before_compact(CollectionKind::Full), 1);
        assert!(sparse.ext.should_compact());
        assert!(!dense.ext.should_compact() && !claimed.ext.should_compact());
        assert!(!unreclaimed.ext.should_compact() && !stale.ext.should_compact());

        delegate.post_compact_cleanup(None);
        assert!(!sparse.ext.should_compact(), "cleanup clears tags");
        assert!(!sparse.ext.should_reclaim());
    }

    #[test]
    fn partial_tagging_skips_inaccurate_remembered_sets() {
        let heap = small_heap(ClassTable::new(), small_settings());
        let mut groups = CompactGroups::new(heap.settings().compact_group_count());
        let accurate = region_with_free(&heap, 4096);
        let rebuilding = region_with_free(&heap, 4096);
        rebuilding.ext.remembered_set.begin_rebuild();

        let mut delegate = ReclaimDelegate::new(&heap, &mut groups);
        assert_eq!(delegate.tag_regions_before_compact(CollectionKind::Partial), 1);
        assert!(accurate.ext.should_compact() && !rebuilding.ext.should_compact());
        assert_eq!(delegate.tag_regions_before_compact(CollectionKind::Full), 2);
    }

    #[test]
    fn atomic_sweep_marks_swept_regions_for_reclaim() {
        let heap = small_heap(ClassTable::new(), small_settings());
        let mut groups = CompactGroups::new(heap.settings().compact_group_count());
        let dispatcher = Dispatcher::new(1);
        let marked = heap.allocate_in_space(crate::Space::Tenure, 4).unwrap();
        heap.model().write_filler(marked.addr(), 4);
        heap.mark_map().set_bit(marked.addr());
        let region = heap.regions().region_of(marked.addr()).unwrap();
        region.set_valid_mark_map(true);

        let mut delegate = ReclaimDelegate::new(&heap, &mut groups);
        let summary = delegate.perform_atomic_sweep(&dispatcher);
        assert_eq!(summary.regions_swept, 1);
        assert!(region.ext.should_reclaim());
    }
}
