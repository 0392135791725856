//! Slide compaction of the regions tagged `should_compact`.
//!
//! Regions are compacted per compact group, in address order, so live data
//! only ever moves towards lower addresses within its own group. Because the
//! slide overwrites source headers, forwarding addresses live in a side table
//! per group rather than in the objects.

use object::{HeaderFlags, ObjectCategory, ObjectRef, Slot, WORD_SIZE};
use parking_lot::RwLock;

use crate::{
    CategoryBuffers, Dispatcher, GcError, GcResult, Heap, ObjectModel, ReferentPolicy, RegionKind,
    RootProvider, RootWalker,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactSummary {
    pub regions_compacted: usize,
    pub regions_freed: usize,
    pub objects_moved: usize,
    pub bytes_moved: usize,
    /// Live bytes left in each compact group's compacted regions.
    pub live_after: Vec<(usize, usize)>,
}

/// One compact group's regions and where its live objects go.
#[derive(Debug)]
struct GroupPlan {
    group: usize,
    regions: Vec<usize>,
    /// `(source, destination)` pairs sorted by source address.
    forwarding: Vec<(usize, usize)>,
    tops: Vec<usize>,
    live_bytes: usize,
}

impl GroupPlan {
    fn lookup(&self, addr: usize) -> Option<usize> {
        self.forwarding
            .binary_search_by_key(&addr, |&(src, _)| src)
            .ok()
            .map(|i| self.forwarding[i].1)
    }

    /// Checks every marked object and assigns destinations in address order.
    fn compute_destinations(&mut self, heap: &Heap) {
        let model = heap.model();
        let regions = heap.regions();
        let size_of = |addr: usize| ObjectRef::from_addr(addr).map_or(WORD_SIZE, |o| model.size_in_bytes(o));

        let mut dest = 0;
        let mut cursor = regions.get(self.regions[0]).start;
        for &index in &self.regions {
            let region = regions.get(index);
            for addr in heap.mark_map().marked_objects(region.start, region.top(), size_of) {
                let Some(object) = ObjectRef::from_addr(addr) else { continue };
                let header = model.header(object);
                assert!(
                    header.is_normal() && heap.classes().try_get(header.class_id()).is_some(),
                    "marked object {object:?} has a corrupt header {header:?}"
                );
                let size = model.size_for(header, object) * WORD_SIZE;
                let target = loop {
                    // A hashed object gains its hash slot only when it moves.
                    let needed = if cursor < addr {
                        model.copied_size_for(header, object) * WORD_SIZE
                    } else {
                        size
                    };
                    if cursor + needed <= regions.get(self.regions[dest]).end {
                        let target = cursor;
                        cursor += needed;
                        self.live_bytes += needed;
                        break target;
                    }
                    self.tops[dest] = cursor;
                    dest += 1;
                    cursor = regions.get(self.regions[dest]).start;
                };
                debug_assert!(target <= addr, "slide moved {object:?} up to {target:#x}");
                self.forwarding.push((addr, target));
            }
        }
        self.tops[dest] = cursor;
        for later in dest + 1..self.regions.len() {
            self.tops[later] = regions.get(self.regions[later]).start;
        }
    }

    /// Slides objects down in ascending order.
    fn move_objects(&self, heap: &Heap) -> usize {
        let model = heap.model();
        let memory = heap.memory();
        let mut moved = 0;
        for &(src, dst) in &self.forwarding {
            if src == dst {
                continue;
            }
            let (Some(source), Some(target)) = (ObjectRef::from_addr(src), ObjectRef::from_addr(dst)) else {
                continue;
            };
            let header = memory.header(source);
            let flags = header.flags();
            if flags.contains(HeaderFlags::HASHED) && !flags.contains(HeaderFlags::MOVED) {
                let (copied, _) = model.copy_object(source, target, header);
                memory.set_header(target, ObjectModel::settle_hash_state(copied));
            } else {
                memory.copy_words(src, dst, model.size_for(header, source));
            }
            moved += 1;
        }
        moved
    }
}

pub struct Compactor<'h> {
    heap: &'h Heap,
    roots: &'h dyn RootProvider,
    dispatcher: &'h Dispatcher,
}

impl<'h> Compactor<'h> {
    pub fn new(heap: &'h Heap, roots: &'h dyn RootProvider, dispatcher: &'h Dispatcher) -> Self {
        Self {
            heap,
            roots,
            dispatcher,
        }
    }

    /// Groups the tagged regions and reserves each group's forwarding table.
    fn plan(&self) -> GcResult<Vec<GroupPlan>> {
        let heap = self.heap;
        let max_age = heap.settings().max_region_age;
        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); heap.settings().compact_group_count()];
        for region in heap.regions().iter() {
            if region.kind() == RegionKind::Free || !region.ext.should_compact() {
                continue;
            }
            if !region.has_valid_mark_map() {
                log::debug!("region {} has no valid mark map, not compacting", region.index);
                region.ext.set_should_compact(false);
                continue;
            }
            if region.ext.critical_sections() > 0 {
                log::debug!("region {} pinned, not compacting", region.index);
                region.ext.set_should_compact(false);
                continue;
            }
            groups[region.compact_group(max_age)].push(region.index);
        }

        let model = heap.model();
        let size_of = |addr: usize| ObjectRef::from_addr(addr).map_or(WORD_SIZE, |o| model.size_in_bytes(o));
        let mut plans = Vec::new();
        for (group, regions) in groups.into_iter().enumerate() {
            if regions.is_empty() {
                continue;
            }
            let live_objects: usize = regions
                .iter()
                .map(|&i| {
                    let region = heap.regions().get(i);
                    heap.mark_map()
                        .marked_objects(region.start, region.top(), size_of)
                        .count()
                })
                .sum();
            let mut forwarding = Vec::new();
            forwarding
                .try_reserve_exact(live_objects)
                .map_err(|_| GcError::CompactSetup { group })?;
            plans.push(GroupPlan {
                group,
                tops: vec![0; regions.len()],
                regions,
                forwarding,
                live_bytes: 0,
            });
        }
        Ok(plans)
    }

    pub fn compact(&self) -> GcResult<CompactSummary> {
        let heap = self.heap;
        let plans = self.plan()?;
        if plans.is_empty() {
            return Ok(CompactSummary::default());
        }

        let mut plan_of = vec![None; heap.regions().len()];
        for (p, plan) in plans.iter().enumerate() {
            for &index in &plan.regions {
                plan_of[index] = Some(p);
                heap.regions().get(index).ext.lists.start_processing();
            }
        }
        let compacted: usize = plans.iter().map(|p| p.regions.len()).sum();
        log::debug!("compacting {compacted} regions in {} groups", plans.len());

        let plans: Vec<RwLock<GroupPlan>> = plans.into_iter().map(RwLock::new).collect();
        let uncompacted: Vec<usize> = heap
            .regions()
            .iter()
            .filter(|r| r.kind() != RegionKind::Free && plan_of[r.index].is_none())
            .map(|r| r.index)
            .collect();
        let root_slots = RootWalker::new(heap, self.roots).collect_slots();

        let results = self.dispatcher.run(|env| {
            let mine = env.partition(plans.len());
            for plan in &plans[mine.clone()] {
                plan.write().compute_destinations(heap);
            }
            env.synchronize_gc_threads();

            let mut moved = 0;
            for plan in &plans[mine.clone()] {
                moved += plan.read().move_objects(heap);
            }
            env.synchronize_gc_threads();

            {
                let tables: Vec<_> = plans.iter().map(|p| p.read()).collect();
                let mut fixup = Fixup {
                    heap,
                    tables: &tables,
                    plan_of: &plan_of,
                    buffers: CategoryBuffers::new(heap, env.id),
                    fields: Vec::new(),
                };
                for slot in &root_slots[env.partition(root_slots.len())] {
                    fixup.fix_slot(slot);
                }
                for &index in &uncompacted[env.partition(uncompacted.len())] {
                    let region = heap.regions().get(index);
                    for object in heap.model().objects_in(region.start, region.top()) {
                        fixup.fix_object(object);
                    }
                }
                for table in &tables[mine.clone()] {
                    for &(_, dst) in &table.forwarding {
                        if let Some(object) = ObjectRef::from_addr(dst) {
                            fixup.fix_object(object);
                            fixup.relist(object);
                        }
                    }
                }
                fixup.buffers.flush_all(heap);
            }
            env.synchronize_gc_threads();

            let mut freed = 0;
            for plan in &plans[mine] {
                freed += self.finish_group(&plan.read());
            }
            (moved, freed)
        });

        let plans: Vec<GroupPlan> = plans.into_iter().map(RwLock::into_inner).collect();
        let summary = CompactSummary {
            regions_compacted: compacted,
            regions_freed: results.iter().map(|r| r.1).sum(),
            objects_moved: results.iter().map(|r| r.0).sum(),
            bytes_moved: plans.iter().map(|p| p.live_bytes).sum(),
            live_after: plans.iter().map(|p| (p.group, p.live_bytes)).collect(),
        };
        heap.stats().record_regions_compacted(summary.regions_compacted);
        heap.stats().record_regions_freed(summary.regions_freed);
        log::info!(
            "compacted {} regions: moved {} objects, freed {} regions",
            summary.regions_compacted,
            summary.objects_moved,
            summary.regions_freed
        );
        Ok(summary)
    }

    /// Lowers tops, releases emptied regions and re-marks moved objects.
    fn finish_group(&self, plan: &GroupPlan) -> usize {
        let heap = self.heap;
        let memory = heap.memory();
        let mut freed = 0;
        for (&index, &top) in plan.regions.iter().zip(&plan.tops) {
            let region = heap.regions().get(index);
            heap.mark_map().clear_range(region.start, region.end);
            region.ext.set_should_compact(false);
            region.ext.set_compact_score(0.0);
            region.ext.set_defragmentation_target(false);
            if top == region.start && region.ext.critical_sections() == 0 {
                heap.regions().release(memory, index);
                freed += 1;
                continue;
            }
            if region.top() > top {
                memory.fill(top, (region.top() - top) / WORD_SIZE, 0);
            }
            region.set_top(top);
            let free = region.end - top;
            region.pool.update(free, 0, free);
        }
        for &(_, dst) in &plan.forwarding {
            heap.mark_map().set_bit(dst);
        }
        freed
    }
}

/// Phase three of compaction on one worker.
struct Fixup<'a, 'h> {
    heap: &'h Heap,
    tables: &'a [parking_lot::RwLockReadGuard<'a, GroupPlan>],
    plan_of: &'a [Option<usize>],
    buffers: CategoryBuffers,
    fields: Vec<usize>,
}

impl Fixup<'_, '_> {
    #[inline]
    fn forwarded(&self, target: ObjectRef) -> ObjectRef {
        let Some(plan) = self
            .heap
            .regions()
            .index_of(target.addr())
            .and_then(|index| self.plan_of[index])
        else {
            return target;
        };
        match self.tables[plan].lookup(target.addr()) {
            Some(dst) => ObjectRef::from_addr(dst).unwrap_or(target),
            None => panic!("{target:?} in a compacted region was not live"),
        }
    }

    fn fix_slot(&mut self, slot: &Slot) {
        if let Some(target) = slot.load() {
            let moved = self.forwarded(target);
            if moved != target {
                slot.store(Some(moved));
            }
        }
    }

    fn fix_object(&mut self, object: ObjectRef) {
        let model = self.heap.model();
        let memory = self.heap.memory();
        if model.is_filler(object) {
            return;
        }
        let mut fields = std::mem::take(&mut self.fields);
        fields.clear();
        model.for_each_reference_slot(object, ReferentPolicy::All, |addr| fields.push(addr));
        for &addr in &fields {
            if let Some(target) = memory.load_ref(addr) {
                let moved = self.forwarded(target);
                if moved != target {
                    memory.store_ref(addr, Some(moved));
                }
            }
        }
        self.fields = fields;
    }

    /// Puts a moved object back on its category list in its new region.
    fn relist(&mut self, object: ObjectRef) {
        let model = self.heap.model();
        let Some(category) = model.class_of(object).category() else {
            return;
        };
        if category == ObjectCategory::Finalizable
            && model.header(object).flags().contains(HeaderFlags::FINALIZED)
        {
            return;
        }
        if let Some(link) = model.list_link_addr(object) {
            self.heap.memory().store(link, 0);
            self.buffers.add(self.heap, category, object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{small_heap, small_settings};
    use crate::{RootKind, RootSet, Space};
    use object::{ClassBuilder, ClassTable};

    #[test]
    fn slide_keeps_order_and_fixes_references() {
        let mut classes = ClassTable::new();
        let node = classes.register(ClassBuilder::mixed("Node").references(1).data(1));
        let lock = classes.register(ClassBuilder::ownable_synchronizer("Lock"));
        let heap = small_heap(classes, small_settings());
        let words = heap.classes().get(node).instance_words();
        let roots = RootSet::new(1);
        let dispatcher = Dispatcher::new(2);

        let mut live = Vec::new();
        for i in 0..40u64 {
            let o = heap.allocate_in_space(Space::Tenure, words).unwrap();
            heap.model().initialize(o, node, 0, 0);
            heap.write_word(o, 2, i);
            if i % 3 == 0 {
                live.push(o);
            }
        }
        let l = heap.allocate_in_space(Space::Tenure, heap.classes().get(lock).instance_words()).unwrap();
        heap.model().initialize(l, lock, 0, 0);
        let region = heap.regions().region_of(l.addr()).unwrap();
        region.ext.lists.slot(ObjectCategory::OwnableSynchronizer, 0).push(&heap.model(), l);
        for pair in live.windows(2) {
            heap.write_reference(pair[0], 1, Some(pair[1]));
        }
        heap.identity_hash(live[1]);
        let hash = heap.identity_hash(live[1]);
        roots.slot(RootKind::Stack, 0).store(Some(live[0]));
        for &o in live.iter().chain([&l]) {
            heap.mark_map().set_bit(o.addr());
        }
        region.set_valid_mark_map(true);
        crate::sweep_region(&heap, region);
        region.ext.set_should_compact(true);

        let summary = Compactor::new(&heap, &roots, &dispatcher).compact().unwrap();
        assert_eq!(summary.regions_compacted, 1);

        let mut cursor = roots.slot(RootKind::Stack, 0).load();
        let mut values = Vec::new();
        let mut previous = 0;
        while let Some(o) = cursor {
            assert!(o.addr() > previous, "address order preserved");
            previous = o.addr();
            values.push(heap.read_word(o, 2));
            cursor = heap.read_reference(o, 1);
        }
        assert_eq!(values, (0..40u64).step_by(3).collect::<Vec<_>>());

        let moved_hashed = heap.read_reference(roots.slot(RootKind::Stack, 0).load().unwrap(), 1).unwrap();
        assert_eq!(heap.identity_hash(moved_hashed), hash, "hash slot appended on first move");
        assert!(heap.model().header(moved_hashed).flags().contains(HeaderFlags::MOVED | HeaderFlags::HASHED));

        let listed = region.ext.lists.entries(&heap.model(), ObjectCategory::OwnableSynchronizer);
        assert_eq!(listed.len(), 1, "moved synchronizer relisted once");
        let used = live.len() * words * WORD_SIZE + WORD_SIZE + heap.classes().get(lock).instance_words() * WORD_SIZE;
        assert_eq!(region.used_bytes(), used, "top lowered to the live data");
    }

    #[test]
    fn regions_without_a_valid_mark_map_are_not_compacted() {
        let mut classes = ClassTable::new();
        let node = classes.register(ClassBuilder::mixed("Node").references(1).data(1));
        let heap = small_heap(classes, small_settings());
        let roots = RootSet::new(1);
        let dispatcher = Dispatcher::new(1);
        let words = heap.classes().get(node).instance_words();
        let o = heap.allocate_in_space(Space::Tenure, words).unwrap();
        heap.model().initialize(o, node, 0, 0);
        heap.write_word(o, 2, 7);
        let region = heap.regions().region_of(o.addr()).unwrap();
        region.ext.set_should_compact(true);

        let summary = Compactor::new(&heap, &roots, &dispatcher).compact().unwrap();
        assert_eq!(summary.regions_compacted, 0);
        assert!(!region.ext.should_compact(), "tag dropped");
        assert_eq!(heap.read_word(o, 2), 7, "unmarked object left in place");
    }

    #[test]
    fn failed_scratch_reservation_is_a_setup_error() {
        assert_eq!(
            GcError::CompactSetup { group: 2 }.to_string(),
            "could not allocate compaction scratch space for compact group 2"
        );
    }
}
