//! The collector facade a GC driver talks to.
//!
//! Stop-the-world operations take the pause lock exclusively; concurrent
//! marking steps take it shared so any number of background threads can
//! help a cycle along between pauses.

use std::sync::Arc;

use object::{HeaderFlags, ObjectCategory, ObjectRef, ReferenceKind};
use parking_lot::{Mutex, RwLock};

use crate::{
    CardState, CategoryBuffers, CollectionKind, CompactGroups, CompactSummary, Compactor,
    ConcurrentCoordinator, ConcurrentPhase, Dispatcher, GcError, GcResult, Heap, MarkLiveness,
    Marker, ReclaimDelegate, ReferenceProcessor, ReferenceSummary, ReferentPolicy,
    RegionKind, RootProvider, RootWalker, SafepointCallback, ScavengeOutcome, Scavenger, Space,
    SweepSummary,
};

/// Totals of one global collection.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GlobalSummary {
    pub marked_bytes: usize,
    pub references: ReferenceSummary,
    pub sweep: SweepSummary,
    pub compact: Option<CompactSummary>,
    /// Set when compaction could not start; the heap is then swept only.
    pub compact_error: Option<GcError>,
}

/// How a global collection chooses regions to compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compaction {
    Full,
    WorkGoal(usize),
}

pub struct Collector {
    heap: Arc<Heap>,
    roots: Arc<dyn RootProvider + Send>,
    dispatcher: Dispatcher,
    groups: Mutex<CompactGroups>,
    concurrent: ConcurrentCoordinator,
    pause: RwLock<()>,
}

impl Collector {
    pub fn new(heap: Arc<Heap>, roots: Arc<dyn RootProvider + Send>) -> Self {
        let settings = heap.settings();
        Self {
            dispatcher: Dispatcher::new(settings.gc_threads),
            groups: Mutex::new(CompactGroups::new(settings.compact_group_count())),
            concurrent: ConcurrentCoordinator::new(),
            pause: RwLock::new(()),
            heap,
            roots,
        }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn concurrent(&self) -> &ConcurrentCoordinator {
        &self.concurrent
    }

    pub fn set_safepoint_callback(&self, callback: Arc<dyn SafepointCallback>) {
        self.concurrent.set_safepoint_callback(callback);
    }

    /// Weighted survival rate of a compact group, for telemetry.
    pub fn weighted_survival_rate(&self, group: usize) -> f64 {
        self.groups.lock().weighted_survival_rate(group)
    }

    fn roots(&self) -> &dyn RootProvider {
        &*self.roots
    }

    // ── Driver entry points ───────────────────────────────────────────

    /// Scavenges the young generation. A backed out scavenge is followed
    /// by a global collection before returning.
    pub fn run_scavenge(&self) -> ScavengeOutcome {
        let _pause = self.pause.write();
        self.concurrent.abort(&self.heap);
        let outcome = Scavenger::new(&self.heap, self.roots(), &self.dispatcher).scavenge();
        if outcome == ScavengeOutcome::BackedOut {
            log::warn!("scavenge backed out, falling back to a global collection");
            self.global_or_sweep_only(None, Compaction::Full);
        }
        outcome
    }

    /// Global collection that compacts regions until `work_goal` live bytes
    /// have been moved, or every eligible region when no goal is given.
    ///
    /// A compaction that cannot be set up is reported after the heap has
    /// been left in its swept state.
    pub fn run_compact(&self, work_goal: Option<usize>) -> GcResult<GlobalSummary> {
        let _pause = self.pause.write();
        self.concurrent.abort(&self.heap);
        let compaction = work_goal.map_or(Compaction::Full, Compaction::WorkGoal);
        let summary = self.global_collection(None, compaction);
        match summary.compact_error.clone() {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    /// Stop-the-world global collection with full compaction.
    pub fn run_global_collection(&self) -> GlobalSummary {
        let _pause = self.pause.write();
        self.concurrent.abort(&self.heap);
        self.global_or_sweep_only(None, Compaction::Full)
    }

    /// Starts a concurrent cycle or advances the active one by about
    /// `budget` traced bytes.
    pub fn run_concurrent_cycle_step(&self, budget: usize) -> ConcurrentPhase {
        let _shared = self.pause.read();
        if self.concurrent.phase() == ConcurrentPhase::Idle {
            self.concurrent.kickoff(&self.heap);
        }
        self.concurrent.step(&self.heap, self.roots(), budget)
    }

    /// Final pause of a concurrent cycle: finishes marking from where the
    /// cycle left off and continues as a global collection. Without an
    /// active cycle this is a plain global collection.
    pub fn complete_concurrent_cycle(&self) -> GlobalSummary {
        let _pause = self.pause.write();
        if !self.concurrent.is_active() {
            return self.global_or_sweep_only(None, Compaction::Full);
        }
        log::debug!(
            "final pause after {:?}, {} bytes traced concurrently",
            self.concurrent.phase(),
            self.concurrent.traced_bytes()
        );
        let remaining = self.concurrent.take_remaining_work(&self.heap);
        self.concurrent.reset(&self.heap);
        self.global_or_sweep_only(Some(remaining), Compaction::Full)
    }

    /// Rebuilds one category's Object Lists from a heap walk. Returns the
    /// number of objects listed.
    ///
    /// In a region with a valid mark map only marked objects are listed.
    pub fn rebuild_object_lists(&self, category: ObjectCategory) -> usize {
        let _pause = self.pause.write();
        let heap = &*self.heap;
        assert!(heap.is_walkable(), "object lists can only be rebuilt on a walkable heap");
        let model = heap.model();
        let mark_map = heap.mark_map();
        let regions: Vec<usize> = heap
            .regions()
            .iter()
            .filter(|r| r.kind() != RegionKind::Free)
            .map(|r| r.index)
            .collect();
        for &index in &regions {
            for list in heap.regions().get(index).ext.lists.slots(category) {
                list.reset();
            }
        }

        let listed = self.dispatcher.run(|env| {
            let mut buffers = CategoryBuffers::new(heap, env.id);
            let mut listed = 0;
            for &index in &regions[env.partition(regions.len())] {
                let marked_only = heap.regions().get(index).has_valid_mark_map();
                for object in heap.objects_in_region(index) {
                    if model.is_filler(object) || model.class_of(object).category() != Some(category) {
                        continue;
                    }
                    if marked_only && !mark_map.is_bit_set(object.addr()) {
                        continue;
                    }
                    if category == ObjectCategory::Finalizable
                        && model.header(object).flags().contains(HeaderFlags::FINALIZED)
                    {
                        continue;
                    }
                    if let Some(link) = model.list_link_addr(object) {
                        heap.memory().store(link, 0);
                        buffers.add(heap, category, object);
                        listed += 1;
                    }
                }
            }
            buffers.flush_all(heap);
            listed
        });
        let listed: usize = listed.into_iter().sum();
        log::debug!("rebuilt {category:?} lists with {listed} objects");
        listed
    }

    /// Checks roots, fields and Object Lists.
    pub fn verify_heap(&self) -> Result<crate::VerifySummary, crate::VerifyError> {
        let _pause = self.pause.write();
        crate::verify_heap(&self.heap, self.roots())
    }

    // ── Global collection ─────────────────────────────────────────────

    fn global_or_sweep_only(&self, resume: Option<Vec<ObjectRef>>, compaction: Compaction) -> GlobalSummary {
        let summary = self.global_collection(resume, compaction);
        if let Some(err) = &summary.compact_error {
            log::warn!("{err}; heap left swept without compaction");
        }
        summary
    }

    /// Marks from the roots (or resumes a concurrent mark), processes
    /// references and finalization, sweeps, compacts and rebuilds the
    /// remembered sets. The caller holds the pause lock.
    fn global_collection(&self, resume: Option<Vec<ObjectRef>>, compaction: Compaction) -> GlobalSummary {
        let heap = &*self.heap;
        heap.set_walkable(false);
        self.tenure_young_regions();

        let marked_bytes = self.mark(resume);
        let references = self.process_references();

        let mut groups = self.groups.lock();
        let mut delegate = ReclaimDelegate::new(heap, &mut groups);
        let sweep = delegate.perform_atomic_sweep(&self.dispatcher);

        match compaction {
            Compaction::Full => {
                delegate.tag_regions_before_compact(CollectionKind::Full);
            }
            Compaction::WorkGoal(goal) => {
                delegate.tag_regions_before_compact_with_work_goal(goal);
            }
        }
        let (compact, compact_error) = match Compactor::new(heap, self.roots(), &self.dispatcher).compact() {
            Ok(summary) => {
                delegate.post_compact_cleanup(Some(&summary));
                (Some(summary), None)
            }
            Err(err) => {
                delegate.post_compact_cleanup(None);
                (None, Some(err))
            }
        };
        drop(groups);

        self.age_tenure_regions();
        self.rebuild_remembered_sets();
        for space in [Space::Eden, Space::Survivor, Space::Tenure] {
            heap.reset_space(space);
        }
        heap.set_walkable(true);
        heap.stats().record_global_collection(1);

        let summary = GlobalSummary {
            marked_bytes,
            references,
            sweep,
            compact,
            compact_error,
        };
        log::info!(
            "global collection: {} bytes marked, {} regions freed by sweep, {} by compaction",
            summary.marked_bytes,
            summary.sweep.regions_freed,
            summary.compact.as_ref().map_or(0, |c| c.regions_freed)
        );
        summary
    }

    /// Young regions join the old generation for the rest of the
    /// collection.
    fn tenure_young_regions(&self) {
        let heap = &*self.heap;
        for region in heap.regions().iter() {
            if region.is_young() {
                heap.regions().retag(region.index, RegionKind::Tenure);
                region.set_age(0);
            }
            region.ext.set_evacuate(false);
        }
        for space in [Space::Eden, Space::Survivor, Space::Tenure] {
            heap.reset_space(space);
        }
    }

    fn mark(&self, resume: Option<Vec<ObjectRef>>) -> usize {
        let heap = &*self.heap;
        let marker = Marker::new(heap, self.dispatcher.threads());
        match resume {
            Some(objects) => marker.rescan(objects),
            None => {
                heap.mark_map().clear_all();
                for region in heap.regions().iter() {
                    region.set_valid_mark_map(false);
                }
            }
        }
        marker.mark_roots(RootWalker::new(heap, self.roots()).collect_targets());
        let marked: usize = self.dispatcher.run(|env| marker.drain(env)).into_iter().sum();
        for region in heap.regions().iter().filter(|r| r.kind() != RegionKind::Free) {
            region.set_valid_mark_map(true);
        }
        marked
    }

    fn process_references(&self) -> ReferenceSummary {
        let heap = &*self.heap;
        let model = heap.model();
        let mark_map = heap.mark_map();
        let marked_references = || -> Vec<ObjectRef> {
            heap.regions()
                .iter()
                .filter(|r| r.kind() != RegionKind::Free)
                .flat_map(|r| r.ext.lists.entries(&model, ObjectCategory::Reference))
                .filter(|o| mark_map.is_bit_set(o.addr()))
                .collect()
        };

        let mut liveness = MarkLiveness::new(heap);
        let mut processor = ReferenceProcessor::new(heap);
        let references = marked_references();
        processor.process_references(&mut liveness, &references, ReferenceKind::Soft);
        processor.process_references(&mut liveness, &references, ReferenceKind::Weak);

        for region in heap.regions().iter().filter(|r| r.kind() != RegionKind::Free) {
            for list in region.ext.lists.slots(ObjectCategory::Finalizable) {
                list.retain(&model, |object| {
                    if model.header(object).flags().contains(HeaderFlags::FINALIZED) {
                        return false;
                    }
                    if mark_map.is_bit_set(object.addr()) {
                        return true;
                    }
                    processor.rescue_finalizable(&mut liveness, object);
                    false
                });
            }
        }
        liveness.finish();

        let references = marked_references();
        processor.process_references(&mut liveness, &references, ReferenceKind::Phantom);
        liveness.finish();

        let summary = processor.summary();
        heap.stats().record_references_cleared(summary.cleared);
        heap.stats().record_objects_finalizable(summary.finalizable);
        summary
    }

    fn age_tenure_regions(&self) {
        let max_age = self.heap.settings().max_region_age;
        for region in self.heap.regions().iter().filter(|r| r.kind() == RegionKind::Tenure) {
            region.set_age(region.age().saturating_add(1).min(max_age));
        }
    }

    /// Recomputes every region's remembered-set card list from a heap walk.
    /// No young regions exist after a global collection, so REMEMBERED
    /// cards start out clean.
    fn rebuild_remembered_sets(&self) {
        let heap = &*self.heap;
        heap.cards().clear_all(CardState::REMEMBERED);
        let regions: Vec<usize> = heap
            .regions()
            .iter()
            .filter(|r| r.kind() != RegionKind::Free)
            .map(|r| r.index)
            .collect();
        for &index in &regions {
            heap.regions().get(index).ext.remembered_set.begin_rebuild();
        }
        self.dispatcher.run(|env| {
            let model = heap.model();
            let mut fields = Vec::new();
            for &index in &regions[env.partition(regions.len())] {
                for object in heap.objects_in_region(index) {
                    if model.is_filler(object) {
                        continue;
                    }
                    fields.clear();
                    model.for_each_reference_slot(object, ReferentPolicy::All, |addr| fields.push(addr));
                    for &addr in &fields {
                        if let Some(target) = heap.memory().load_ref(addr) {
                            heap.remember_edge(object, target);
                        }
                    }
                }
            }
        });
        for &index in &regions {
            heap.regions().get(index).ext.remembered_set.finish_rebuild();
        }
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("heap", &self.heap)
            .field("threads", &self.dispatcher.threads())
            .field("concurrent", &self.concurrent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::small_settings;
    use crate::{HeapSettings, RootKind, RootSet};
    use object::{ClassBuilder, ClassId, ClassTable, WORD_SIZE};

    struct Fixture {
        collector: Collector,
        roots: Arc<RootSet>,
        node: ClassId,
        weak: ClassId,
        finalizable: ClassId,
    }

    fn fixture(settings: HeapSettings) -> Fixture {
        let mut classes = ClassTable::new();
        let node = classes.register(ClassBuilder::mixed("Node").references(2).data(1));
        let weak = classes.register(ClassBuilder::reference("Weak", ReferenceKind::Weak));
        let finalizable = classes.register(ClassBuilder::mixed("Resource").data(1).finalizable());
        let heap = Arc::new(Heap::new(settings, classes).unwrap());
        let roots = Arc::new(RootSet::new(8));
        Fixture {
            collector: Collector::new(heap, roots.clone()),
            roots,
            node,
            weak,
            finalizable,
        }
    }

    fn chain(heap: &Heap, class: ClassId, len: usize) -> Vec<ObjectRef> {
        let objects: Vec<_> = (0..len).map(|_| heap.allocate(class, 0).unwrap()).collect();
        for (i, pair) in objects.windows(2).enumerate() {
            heap.write_reference(pair[0], 1, Some(pair[1]));
            heap.write_word(pair[0], 3, i as u64);
        }
        objects
    }

    fn chain_values(heap: &Heap, head: Option<ObjectRef>) -> Vec<u64> {
        let mut values = Vec::new();
        let mut cursor = head;
        while let Some(o) = cursor {
            cursor = heap.read_reference(o, 1);
            if cursor.is_some() {
                values.push(heap.read_word(o, 3));
            }
        }
        values
    }

    #[test]
    fn global_collection_reclaims_and_compacts() {
        let f = fixture(small_settings());
        let heap = f.collector.heap().clone();
        let live = chain(&heap, f.node, 50);
        f.roots.slot(RootKind::Stack, 0).store(Some(live[0]));
        for _ in 0..400 {
            heap.allocate(f.node, 0).unwrap();
        }

        let target = heap.allocate(f.node, 0).unwrap();
        let weak = heap.allocate(f.weak, 0).unwrap();
        heap.write_reference(weak, 1, Some(target));
        f.roots.slot(RootKind::Jni, 0).store(Some(weak));
        heap.allocate(f.finalizable, 0).unwrap();

        let summary = f.collector.run_compact(None).unwrap();
        assert_eq!(summary.references.cleared, 1);
        assert_eq!(summary.references.finalizable, 1);
        let weak = f.roots.slot(RootKind::Jni, 0).load().unwrap();
        assert_eq!(heap.read_reference(weak, 1), None, "weak referent cleared");
        assert_eq!(heap.take_pending_references(), vec![weak]);
        assert_eq!(heap.take_finalizable().len(), 1);

        assert_eq!(heap.regions().count(RegionKind::Eden), 0);
        assert_eq!(
            chain_values(&heap, f.roots.slot(RootKind::Stack, 0).load()),
            (0..49).collect::<Vec<u64>>()
        );
        assert!(summary.compact.is_some());
        f.collector.verify_heap().unwrap();
        assert_eq!(heap.stats().snapshot().global_collections, 1);
    }

    #[test]
    fn scavenge_then_global_collection_keeps_the_graph() {
        let f = fixture(small_settings());
        let heap = f.collector.heap().clone();
        let live = chain(&heap, f.node, 30);
        f.roots.slot(RootKind::Stack, 0).store(Some(live[0]));

        assert!(matches!(f.collector.run_scavenge(), ScavengeOutcome::Completed(_)));
        f.collector.verify_heap().unwrap();
        f.collector.run_global_collection();
        f.collector.verify_heap().unwrap();
        assert_eq!(
            chain_values(&heap, f.roots.slot(RootKind::Stack, 0).load()),
            (0..29).collect::<Vec<u64>>()
        );
        let head = f.roots.slot(RootKind::Stack, 0).load().unwrap();
        assert_eq!(
            heap.regions().region_of(head.addr()).unwrap().kind(),
            RegionKind::Tenure
        );
    }

    #[test]
    fn concurrent_cycle_finishes_in_a_global_collection() {
        let f = fixture(small_settings());
        let heap = f.collector.heap().clone();
        let live = chain(&heap, f.node, 40);
        f.roots.slot(RootKind::Jni, 0).store(Some(live[0]));
        for _ in 0..100 {
            heap.allocate(f.node, 0).unwrap();
        }

        assert_eq!(f.collector.run_concurrent_cycle_step(0), ConcurrentPhase::RootTracingJni);
        let extra = heap.allocate(f.node, 0).unwrap();
        heap.write_reference(live[39], 2, Some(extra));
        while !matches!(
            f.collector.run_concurrent_cycle_step(256),
            ConcurrentPhase::Complete | ConcurrentPhase::Halted
        ) {}

        let summary = f.collector.complete_concurrent_cycle();
        assert!(!f.collector.concurrent().is_active());
        assert!(!heap.concurrent_barrier_installed());
        assert!(summary.sweep.regions_swept > 0);
        let tail = {
            let mut cursor = f.roots.slot(RootKind::Jni, 0).load().unwrap();
            while let Some(next) = heap.read_reference(cursor, 1) {
                cursor = next;
            }
            cursor
        };
        assert!(heap.read_reference(tail, 2).is_some(), "object stored during the cycle survives");
        f.collector.verify_heap().unwrap();
    }

    #[test]
    fn scavenge_aborts_an_active_cycle() {
        let f = fixture(small_settings());
        f.collector.run_concurrent_cycle_step(0);
        assert!(f.collector.concurrent().is_active());
        f.collector.run_scavenge();
        assert_eq!(f.collector.concurrent().phase(), ConcurrentPhase::Idle);
        assert!(!f.collector.heap().concurrent_barrier_installed());
    }

    #[test]
    fn object_lists_rebuild_from_a_heap_walk() {
        let f = fixture(small_settings());
        let heap = f.collector.heap().clone();
        for _ in 0..5 {
            heap.allocate(f.finalizable, 0).unwrap();
        }
        for region in heap.regions().iter() {
            for list in region.ext.lists.slots(ObjectCategory::Finalizable) {
                list.reset();
            }
        }
        assert_eq!(f.collector.rebuild_object_lists(ObjectCategory::Finalizable), 5);
        f.collector.verify_heap().unwrap();
    }

    #[test]
    fn rebuilt_lists_skip_unmarked_objects_of_marked_regions() {
        let f = fixture(small_settings());
        let heap = f.collector.heap().clone();
        let words = heap.classes().get(f.finalizable).instance_words();
        let old: Vec<_> = (0..2)
            .map(|_| {
                let o = heap.allocate_in_space(Space::Tenure, words).unwrap();
                heap.model().initialize(o, f.finalizable, 0, 0);
                o
            })
            .collect();
        heap.mark_map().set_bit(old[0].addr());
        heap.regions().region_of(old[0].addr()).unwrap().set_valid_mark_map(true);
        let young = heap.allocate(f.finalizable, 0).unwrap();
        for region in heap.regions().iter() {
            for list in region.ext.lists.slots(ObjectCategory::Finalizable) {
                list.reset();
            }
        }

        assert_eq!(f.collector.rebuild_object_lists(ObjectCategory::Finalizable), 2);
        let listed: Vec<_> = heap
            .regions()
            .iter()
            .flat_map(|r| r.ext.lists.entries(&heap.model(), ObjectCategory::Finalizable))
            .collect();
        assert!(listed.contains(&old[0]) && listed.contains(&young));
        assert!(!listed.contains(&old[1]), "dead object not listed");
    }

    #[test]
    fn backed_out_scavenge_finalizes_every_dead_object_once() {
        let f = fixture(HeapSettings {
            survivor_regions: 1,
            ..small_settings()
        });
        let heap = f.collector.heap().clone();
        let region_words = heap.settings().region_size / WORD_SIZE;
        for _ in 0..1000 {
            heap.allocate(f.finalizable, 0).unwrap();
        }
        while heap.regions().free_count() > 1 {
            let block = heap.allocate_in_space(Space::Tenure, region_words).unwrap();
            heap.model().write_filler(block.addr(), region_words);
        }

        assert_eq!(f.collector.run_scavenge(), ScavengeOutcome::BackedOut);
        let stats = heap.stats().snapshot();
        assert_eq!(stats.evacuation_failures, 1);
        assert_eq!(stats.objects_finalizable, 1000);
        assert_eq!(heap.take_finalizable().len(), 1000);
        f.collector.verify_heap().unwrap();
    }
}
