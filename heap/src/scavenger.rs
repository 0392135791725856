//! Young-generation copying collection.
//!
//! Every eden and survivor region is evacuated into fresh survivor regions,
//! or into tenure once an object reaches the tenure age. Headers are claimed
//! through [`ForwardingSlot`] so concurrent workers agree on a single copy.
//! If neither destination can take an object the whole scavenge is backed
//! out and the caller falls back to a global collection.

use std::sync::atomic::{AtomicBool, Ordering};

use object::{
    HeaderFlags, HeaderWord, ObjectCategory, ObjectRef, ReferenceKind, Slot, WORD_SIZE,
};

use crate::{
    CardState, CategoryBuffers, ClaimOutcome, Dispatcher, ForwardingHeader, ForwardingSlot, Heap,
    Liveness, ObjectListIter, ObjectModel, ReferenceProcessor, ReferentPolicy, RegionKind, RootKind,
    RootProvider, RootWalker, Space, WorkPool,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScavengeSummary {
    pub objects_copied: usize,
    pub bytes_copied: usize,
    pub bytes_tenured: usize,
    pub regions_evacuated: usize,
    pub references_cleared: usize,
    pub objects_finalizable: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScavengeOutcome {
    Completed(ScavengeSummary),
    /// Evacuation failed and every move was reverted.
    BackedOut,
}

/// Region bookkeeping captured before anything moves.
struct ScavengeSetup {
    evacuate: Vec<usize>,
    in_use: Vec<bool>,
    remembered: Vec<ObjectRef>,
    finalizable_head: Option<ObjectRef>,
    pending_head: Option<ObjectRef>,
}

/// What reference processing overwrote outside the copies, so a backout can
/// put it back.
#[derive(Default)]
struct ReferenceJournal {
    words: Vec<(usize, u64)>,
    rescued: Vec<ObjectRef>,
}

#[derive(Default)]
struct WorkerResult {
    hashed: Vec<ObjectRef>,
    written: Vec<ObjectRef>,
    objects: usize,
    copied: usize,
    tenured: usize,
}

pub struct Scavenger<'h> {
    heap: &'h Heap,
    roots: &'h dyn RootProvider,
    dispatcher: &'h Dispatcher,
    failed: AtomicBool,
    pool: WorkPool<ObjectRef>,
}

impl<'h> Scavenger<'h> {
    pub fn new(heap: &'h Heap, roots: &'h dyn RootProvider, dispatcher: &'h Dispatcher) -> Self {
        Self {
            heap,
            roots,
            dispatcher,
            failed: AtomicBool::new(false),
            pool: WorkPool::new(dispatcher.threads()),
        }
    }

    #[inline(always)]
    fn in_evacuate(&self, addr: usize) -> bool {
        self.heap
            .regions()
            .region_of(addr)
            .is_some_and(|r| r.ext.is_evacuate())
    }

    pub fn scavenge(&self) -> ScavengeOutcome {
        let heap = self.heap;
        let setup = self.setup();
        log::debug!(
            "scavenge: evacuating {} regions, {} remembered objects",
            setup.evacuate.len(),
            setup.remembered.len()
        );

        let root_slots = RootWalker::new(heap, self.roots).collect_slots();
        let mut results = self.dispatcher.run(|env| {
            let mut worker = ScavengeWorker::new(self, env.id);
            let mut local = Vec::new();
            for slot in &root_slots[env.partition(root_slots.len())] {
                worker.fix_slot(slot, &mut local);
            }
            for &object in &setup.remembered[env.partition(setup.remembered.len())] {
                worker.scan_object(object, false, &mut local);
            }
            self.pool
                .drain(&mut local, |copy, local| worker.scan_object(copy, true, local));
            worker.finish()
        });

        let (main, references, journal) = self.process_references(&setup);
        results.push(main);

        if self.failed.load(Ordering::Acquire) {
            let written: Vec<ObjectRef> = results.into_iter().flat_map(|r| r.written).collect();
            self.backout(&setup, &written, &journal);
            return ScavengeOutcome::BackedOut;
        }

        let mut summary = ScavengeSummary {
            regions_evacuated: setup.evacuate.len(),
            references_cleared: references.cleared,
            objects_finalizable: references.finalizable,
            ..ScavengeSummary::default()
        };
        let memory = heap.memory();
        for result in &results {
            for &copy in &result.hashed {
                memory.set_header(copy, ObjectModel::settle_hash_state(memory.header(copy)));
            }
            summary.objects_copied += result.objects;
            summary.bytes_copied += result.copied;
            summary.bytes_tenured += result.tenured;
        }

        for &index in &setup.evacuate {
            heap.regions().get(index).ext.set_in_collection_set(false);
            heap.regions().release(memory, index);
        }
        // Copies are not marked.
        for region in heap.regions().iter().filter(|r| r.kind() != RegionKind::Free) {
            if !setup.in_use[region.index] || region.top() > region.ext.backout_top() {
                region.set_valid_mark_map(false);
            }
        }
        heap.reset_space(Space::Eden);

        let stats = heap.stats();
        stats.record_scavenge(1);
        stats.record_bytes_copied(summary.bytes_copied);
        stats.record_bytes_tenured(summary.bytes_tenured);
        stats.record_references_cleared(summary.references_cleared);
        stats.record_objects_finalizable(summary.objects_finalizable);
        log::info!(
            "scavenge copied {} objects ({} bytes, {} tenured), released {} regions",
            summary.objects_copied,
            summary.bytes_copied,
            summary.bytes_tenured,
            summary.regions_evacuated
        );
        ScavengeOutcome::Completed(summary)
    }

    fn setup(&self) -> ScavengeSetup {
        let heap = self.heap;
        let regions = heap.regions();
        let cards = heap.cards();
        let mut evacuate = Vec::new();
        let mut in_use = vec![false; regions.len()];
        let mut remembered = Vec::new();

        for region in regions.iter() {
            let kind = region.kind();
            if kind == RegionKind::Free {
                continue;
            }
            in_use[region.index] = true;
            region.ext.set_backout_top(region.top());
            if kind.is_young() {
                region.ext.set_evacuate(true);
                region.ext.set_in_collection_set(true);
                region.ext.lists.start_processing();
                evacuate.push(region.index);
                continue;
            }
            region.ext.lists.backup_lists();

            let dirty = cards.dirty_cards(region.start, region.end, CardState::REMEMBERED);
            if dirty.is_empty() {
                continue;
            }
            for &card in &dirty {
                cards.clear(card, CardState::REMEMBERED);
            }
            let model = heap.model();
            for object in model.objects_in(region.start, region.top()) {
                if model.is_filler(object) {
                    continue;
                }
                let first = cards.card_index(object.addr());
                let last = cards.card_index(object.addr() + model.size_in_bytes(object) - WORD_SIZE);
                let at = dirty.partition_point(|&c| c < first);
                if dirty.get(at).is_some_and(|&c| c <= last) {
                    remembered.push(object);
                }
            }
        }
        heap.reset_space(Space::Survivor);

        let queues = heap.queues();
        ScavengeSetup {
            evacuate,
            in_use,
            remembered,
            finalizable_head: queues.finalizable.load(),
            pending_head: queues.pending_references.load(),
        }
    }

    /// Reference clearing and finalization on the main thread, after every
    /// worker has drained.
    ///
    /// Keeping soft referents and finalizable objects alive can still run
    /// out of space, so the journal records every word and header changed
    /// outside the copies.
    fn process_references(
        &self,
        setup: &ScavengeSetup,
    ) -> (WorkerResult, crate::ReferenceSummary, ReferenceJournal) {
        let heap = self.heap;
        let model = heap.model();
        let memory = heap.memory();
        let mut main = ScavengeWorker::new(self, 0);
        let mut processor = ReferenceProcessor::new(heap);
        let mut journal = ReferenceJournal::default();

        let listed_references = || -> Vec<ObjectRef> {
            heap.regions()
                .iter()
                .filter(|r| r.kind() != RegionKind::Free && !r.ext.is_evacuate())
                .flat_map(|r| r.ext.lists.entries(&model, ObjectCategory::Reference))
                .collect()
        };

        // Liveness is only known once the closure completed.
        if self.failed.load(Ordering::Acquire) {
            return (main.finish(), processor.summary(), journal);
        }
        let references = listed_references();
        for &reference in &references {
            if let Some(layout) = model.class_of(reference).reference_layout() {
                for index in [layout.referent, layout.state, layout.queue_link] {
                    let addr = reference.word_addr(index);
                    journal.words.push((addr, memory.load(addr)));
                }
            }
        }
        processor.process_references(&mut main, &references, ReferenceKind::Soft);
        processor.process_references(&mut main, &references, ReferenceKind::Weak);

        // Finalizable objects left behind in evacuated regions are unreachable.
        let mut candidates = Vec::new();
        for &index in &setup.evacuate {
            let region = heap.regions().get(index);
            for list in region.ext.lists.slots(ObjectCategory::Finalizable) {
                candidates.extend(self.prior_chain(list.prior_head()));
            }
        }
        for object in candidates {
            if self.failed.load(Ordering::Acquire) {
                break;
            }
            let header = model.header(object);
            if header.is_normal()
                && !header.flags().contains(HeaderFlags::FINALIZED)
                && processor.rescue_finalizable(&mut main, object)
            {
                journal.rescued.push(object);
            }
        }
        main.buffers.flush_all(heap);

        if !self.failed.load(Ordering::Acquire) {
            let references = listed_references();
            processor.process_references(&mut main, &references, ReferenceKind::Phantom);
        }
        (main.finish(), processor.summary(), journal)
    }

    /// Entries of a processed list, following links through forwarded
    /// headers.
    fn prior_chain(&self, head: Option<ObjectRef>) -> Vec<ObjectRef> {
        let memory = self.heap.memory();
        let classes = self.heap.classes();
        ObjectListIter::new(head, |object| {
            let header = memory.header(object);
            let class = match header.forwarding_target() {
                Some(copy) => classes.get(memory.header(copy).class_id()),
                None => classes.get(header.class_id()),
            };
            class
                .list_link()
                .map_or(object.addr(), |link| memory.load(object.word_addr(link)) as usize)
        })
        .collect()
    }

    /// Reverts every move of this scavenge and leaves the heap as it was
    /// before it started.
    fn backout(&self, setup: &ScavengeSetup, written: &[ObjectRef], journal: &ReferenceJournal) {
        let heap = self.heap;
        let memory = heap.memory();
        let model = heap.model();
        log::warn!("evacuation failed, backing out scavenge");

        let mut restored = Vec::new();
        for &index in &setup.evacuate {
            let region = heap.regions().get(index);
            let mut cursor = region.start;
            let end = region.ext.backout_top();
            while cursor < end {
                let Some(object) = ObjectRef::from_addr(cursor) else { break };
                let forwarding = ForwardingHeader::read(memory, object);
                let words = match forwarding.forwarded_object() {
                    Some(copy) => {
                        let original = self.restore_original(&forwarding, copy);
                        memory.set_header(copy, HeaderWord::reverse_forwarded(object));
                        restored.push(object);
                        model.size_for(original, object)
                    }
                    None => model.size_in_words(object),
                };
                cursor += words * WORD_SIZE;
            }
        }

        let unforward = |target: ObjectRef| memory.header(target).reverse_target().unwrap_or(target);
        let fix_fields = |object: ObjectRef| {
            model.for_each_reference_slot(object, ReferentPolicy::All, |addr| {
                if let Some(target) = memory.load_ref(addr) {
                    let original = unforward(target);
                    if original != target {
                        memory.store_ref(addr, Some(original));
                    }
                }
            });
        };
        RootWalker::new(heap, self.roots).walk(&mut |slot: &Slot, _: RootKind| {
            if let Some(target) = slot.load() {
                slot.store(Some(unforward(target)));
            }
        });
        for &object in setup.remembered.iter().chain(&restored) {
            fix_fields(object);
        }
        for &object in written {
            fix_fields(unforward(object));
        }
        for &(addr, value) in &journal.words {
            memory.store(addr, value);
        }
        for &object in &journal.rescued {
            let header = memory.header(object);
            memory.set_header(object, header.with_flags(header.flags() - HeaderFlags::FINALIZED));
        }
        let queues = heap.queues();
        queues.finalizable.store(setup.finalizable_head);
        queues.pending_references.store(setup.pending_head);

        for region in heap.regions().iter() {
            let index = region.index;
            if setup.in_use[index] {
                region.ext.lists.backout_lists();
                region.ext.set_evacuate(false);
                region.ext.set_in_collection_set(false);
                let top = region.ext.backout_top();
                if region.top() > top {
                    memory.fill(top, (region.top() - top) / WORD_SIZE, 0);
                    region.set_top(top);
                }
            } else if region.kind() != RegionKind::Free {
                heap.regions().release(memory, index);
            }
        }
        heap.reset_space(Space::Survivor);
        heap.reset_space(Space::Tenure);

        for &object in &setup.remembered {
            heap.cards().dirty(object.addr(), CardState::REMEMBERED);
        }
        heap.stats().record_evacuation_failure(1);
        log::debug!("backout restored {} objects", restored.len());
    }

    /// Rebuilds the header an evacuated original had when it was claimed.
    /// The body of the original is never written during a scavenge, so only
    /// the header needs restoring.
    fn restore_original(&self, forwarding: &ForwardingHeader, copy: ObjectRef) -> HeaderWord {
        let memory = self.heap.memory();
        let object = forwarding.object();
        let copied = memory.header(copy);

        let mut flags = copied.flags();
        if flags.contains(HeaderFlags::MOVED) && !flags.contains(HeaderFlags::HASHED) {
            // The copy only gained its hash slot in this scavenge.
            flags = (flags - HeaderFlags::MOVED) | HeaderFlags::HASHED;
        }
        let overlap = forwarding.preserved_overlap(memory).unwrap_or_default();
        memory.set_header(
            object,
            HeaderWord::new(copied.class_id(), flags, forwarding.preserved_age(), 0),
        );
        forwarding.restore_destroyed_overlap(memory, overlap);
        memory.header(object)
    }
}

/// One collector thread's half of a scavenge.
struct ScavengeWorker<'s, 'h> {
    scavenger: &'s Scavenger<'h>,
    id: usize,
    buffers: CategoryBuffers,
    fields: Vec<usize>,
    pending: Vec<ObjectRef>,
    result: WorkerResult,
}

impl<'s, 'h> ScavengeWorker<'s, 'h> {
    fn new(scavenger: &'s Scavenger<'h>, id: usize) -> Self {
        Self {
            scavenger,
            id,
            buffers: CategoryBuffers::new(scavenger.heap, id),
            fields: Vec::new(),
            pending: Vec::new(),
            result: WorkerResult::default(),
        }
    }

    fn fix_slot(&mut self, slot: &Slot, local: &mut Vec<ObjectRef>) {
        if let Some(target) = slot.load()
            && self.scavenger.in_evacuate(target.addr())
        {
            slot.store(Some(self.forward(target, local)));
        }
    }

    /// Tenure copies land here when survivor space is exhausted, and the
    /// other way round, before the scavenge gives up.
    fn allocate_copy(&self, preferred: Space, words: usize) -> Option<(ObjectRef, Space)> {
        let heap = self.scavenger.heap;
        let fallback = match preferred {
            Space::Tenure => Space::Survivor,
            _ => Space::Tenure,
        };
        heap.allocate_in_space(preferred, words)
            .map(|copy| (copy, preferred))
            .or_else(|| heap.allocate_in_space(fallback, words).map(|copy| (copy, fallback)))
    }

    /// Returns the copy of `object`, moving it if no thread has yet. Returns
    /// `object` itself once evacuation has failed.
    fn forward(&mut self, object: ObjectRef, local: &mut Vec<ObjectRef>) -> ObjectRef {
        let heap = self.scavenger.heap;
        let model = heap.model();
        let slot = ForwardingSlot::new(heap.memory(), object);
        loop {
            let claim = match slot.try_claim(self.id) {
                ClaimOutcome::Forwarded(copy) => return copy,
                ClaimOutcome::Busy => {
                    std::hint::spin_loop();
                    continue;
                }
                ClaimOutcome::Claimed(claim) => claim,
            };
            if self.scavenger.failed.load(Ordering::Acquire) {
                slot.abandon(claim);
                return object;
            }

            let header = claim.original();
            let age = header.age().saturating_add(1);
            let preferred = if age >= heap.settings().tenure_age {
                Space::Tenure
            } else {
                Space::Survivor
            };
            let words = model.copied_size_for(header, object);
            let Some((copy, space)) = self.allocate_copy(preferred, words) else {
                slot.abandon(claim);
                if !self.scavenger.failed.swap(true, Ordering::AcqRel) {
                    log::warn!("no space to evacuate {object:?} ({words} words)");
                }
                return object;
            };

            let (copied, size) = model.copy_object(object, copy, header);
            heap.memory().set_header(copy, copied.with_age(age));
            if let Some(link) = model.list_link_addr(copy) {
                heap.memory().store(link, 0);
            }
            slot.publish(claim, copy);
            log::trace!("{object:?} -> {copy:?} ({space:?})");

            self.result.objects += 1;
            self.result.copied += size * WORD_SIZE;
            if space == Space::Tenure {
                self.result.tenured += size * WORD_SIZE;
            }
            local.push(copy);
            return copy;
        }
    }

    /// Forwards the evacuate-space referents of `object`. Copies also join
    /// the lists of their category.
    fn scan_object(&mut self, object: ObjectRef, copy: bool, local: &mut Vec<ObjectRef>) {
        let heap = self.scavenger.heap;
        let model = heap.model();
        let memory = heap.memory();
        if model.is_filler(object) {
            return;
        }
        if copy {
            let header = model.header(object);
            let flags = header.flags();
            if flags.contains(HeaderFlags::MOVED) && !flags.contains(HeaderFlags::HASHED) {
                self.result.hashed.push(object);
            }
            match model.class_of(object).category() {
                Some(ObjectCategory::Finalizable) if flags.contains(HeaderFlags::FINALIZED) => {}
                Some(category) => self.buffers.add(heap, category, object),
                None => {}
            }
        }

        let mut fields = std::mem::take(&mut self.fields);
        fields.clear();
        model.for_each_reference_slot(object, ReferentPolicy::Discover, |addr| fields.push(addr));
        for &addr in &fields {
            let Some(mut target) = memory.load_ref(addr) else { continue };
            if self.scavenger.in_evacuate(target.addr()) {
                let moved = self.forward(target, local);
                if moved != target {
                    memory.store_ref(addr, Some(moved));
                    target = moved;
                }
            }
            heap.remember_edge(object, target);
        }
        self.fields = fields;
    }

    fn finish(mut self) -> WorkerResult {
        self.buffers.flush_all(self.scavenger.heap);
        self.result
    }
}

impl Liveness for ScavengeWorker<'_, '_> {
    fn is_collected(&self, object: ObjectRef) -> bool {
        self.scavenger.in_evacuate(object.addr())
    }

    fn live_location(&self, object: ObjectRef) -> Option<ObjectRef> {
        self.scavenger.heap.memory().header(object).forwarding_target()
    }

    fn keep_alive(&mut self, object: ObjectRef) -> ObjectRef {
        if !self.is_collected(object) {
            return object;
        }
        let mut local = std::mem::take(&mut self.pending);
        let copy = self.forward(object, &mut local);
        while let Some(next) = local.pop() {
            self.scan_object(next, true, &mut local);
        }
        self.pending = local;
        copy
    }

    fn record_write(&mut self, object: ObjectRef, value: Option<ObjectRef>) {
        self.result.written.push(object);
        if let Some(value) = value {
            self.scavenger.heap.remember_edge(object, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{allocate_unlisted, small_heap, small_settings};
    use crate::{HeapSettings, RootSet};
    use object::{ClassBuilder, ClassTable, ReferenceState};

    fn classes() -> (ClassTable, object::ClassId, object::ClassId, object::ClassId, object::ClassId) {
        let mut classes = ClassTable::new();
        let node = classes.register(ClassBuilder::mixed("Node").references(2).data(1));
        let weak = classes.register(ClassBuilder::reference("Weak", ReferenceKind::Weak));
        let resource = classes.register(ClassBuilder::mixed("Resource").references(1).finalizable());
        let blob = classes.register(ClassBuilder::primitive_array("Blob"));
        (classes, node, weak, resource, blob)
    }

    #[test]
    fn live_objects_survive_and_dead_ones_go() {
        let (classes, node, weak, resource, _) = classes();
        let heap = small_heap(classes, small_settings());
        let roots = RootSet::new(4);
        let dispatcher = Dispatcher::new(2);

        let a = heap.allocate(node, 0).unwrap();
        let b = heap.allocate(node, 0).unwrap();
        heap.write_reference(a, 1, Some(b));
        heap.write_word(b, 3, 42);
        let hash = heap.identity_hash(b);
        let _garbage = heap.allocate(node, 0).unwrap();
        let w = heap.allocate(weak, 0).unwrap();
        let dead_target = heap.allocate(node, 0).unwrap();
        heap.write_reference(w, 1, Some(dead_target));
        heap.write_reference(a, 2, Some(w));
        let finalizable = heap.allocate(resource, 0).unwrap();
        roots.slot(RootKind::Stack, 0).store(Some(a));

        let outcome = Scavenger::new(&heap, &roots, &dispatcher).scavenge();
        let ScavengeOutcome::Completed(summary) = outcome else {
            panic!("scavenge backed out: {outcome:?}");
        };
        assert_eq!(summary.references_cleared, 1);
        assert_eq!(summary.objects_finalizable, 1);

        let a2 = roots.slot(RootKind::Stack, 0).load().unwrap();
        assert_ne!(a2, a, "root updated to the copy");
        let b2 = heap.read_reference(a2, 1).unwrap();
        assert_eq!(heap.read_word(b2, 3), 42);
        assert_eq!(heap.identity_hash(b2), hash, "hash survives the move");
        assert_eq!(
            heap.model().header(b2).flags() & (HeaderFlags::HASHED | HeaderFlags::MOVED),
            HeaderFlags::HASHED | HeaderFlags::MOVED,
            "transient hash state settled"
        );
        assert_eq!(heap.model().header(b2).age(), 1);

        let w2 = heap.read_reference(a2, 2).unwrap();
        assert_eq!(heap.read_reference(w2, 1), None, "weak referent cleared");
        assert_eq!(heap.read_word(w2, 3), ReferenceState::Enqueued as u64);
        assert_eq!(heap.take_pending_references(), vec![w2]);

        let queued = heap.take_finalizable();
        assert_eq!(queued.len(), 1);
        assert_ne!(queued[0], finalizable);
        assert!(heap.model().header(queued[0]).flags().contains(HeaderFlags::FINALIZED));
        assert_eq!(heap.regions().count(RegionKind::Eden), 0, "eden released");
    }

    #[test]
    fn objects_are_promoted_at_tenure_age() {
        let (classes, node, ..) = classes();
        let heap = small_heap(classes, HeapSettings { tenure_age: 2, ..small_settings() });
        let roots = RootSet::new(1);
        let dispatcher = Dispatcher::new(2);
        roots.slot(RootKind::Jni, 0).store(heap.allocate(node, 0));

        for expected in [RegionKind::Survivor, RegionKind::Tenure] {
            let outcome = Scavenger::new(&heap, &roots, &dispatcher).scavenge();
            assert!(matches!(outcome, ScavengeOutcome::Completed(_)));
            let object = roots.slot(RootKind::Jni, 0).load().unwrap();
            assert_eq!(heap.regions().region_of(object.addr()).unwrap().kind(), expected);
        }
    }

    #[test]
    fn regions_receiving_copies_lose_their_mark_map() {
        let (classes, node, ..) = classes();
        let heap = small_heap(classes, HeapSettings { tenure_age: 1, ..small_settings() });
        let roots = RootSet::new(1);
        let dispatcher = Dispatcher::new(1);

        let old = heap.allocate_in_space(Space::Tenure, heap.classes().get(node).instance_words()).unwrap();
        heap.model().initialize(old, node, 0, 0);
        heap.mark_map().set_bit(old.addr());
        let tenure = heap.regions().region_of(old.addr()).unwrap();
        tenure.set_valid_mark_map(true);
        roots.slot(RootKind::Stack, 0).store(heap.allocate(node, 0));

        let outcome = Scavenger::new(&heap, &roots, &dispatcher).scavenge();
        assert!(matches!(outcome, ScavengeOutcome::Completed(_)));
        let copy = roots.slot(RootKind::Stack, 0).load().unwrap();
        assert_eq!(heap.regions().index_of(copy.addr()), Some(tenure.index), "promoted next to old");
        assert!(!tenure.has_valid_mark_map());
    }

    #[test]
    fn old_to_young_edges_are_roots() {
        let (classes, node, ..) = classes();
        let heap = small_heap(classes, small_settings());
        let roots = RootSet::new(1);
        let dispatcher = Dispatcher::new(2);

        let old = heap.allocate_in_space(Space::Tenure, heap.classes().get(node).instance_words()).unwrap();
        heap.model().initialize(old, node, 0, 0);
        let young = heap.allocate(node, 0).unwrap();
        heap.write_reference(old, 1, Some(young));

        let outcome = Scavenger::new(&heap, &roots, &dispatcher).scavenge();
        assert!(matches!(outcome, ScavengeOutcome::Completed(_)));
        let copy = heap.read_reference(old, 1).unwrap();
        assert_ne!(copy, young);
        assert!(heap.is_young(copy.addr()));
        assert!(
            heap.cards().is_dirty(heap.cards().card_index(old.addr()), CardState::REMEMBERED),
            "card stays dirty while the edge is still old to young"
        );
    }

    #[test]
    fn backout_restores_every_forwarded_object() {
        let (classes, node, weak, resource, _) = classes();
        let settings = HeapSettings {
            survivor_regions: 1,
            tenure_age: 4,
            ..small_settings()
        };
        let heap = small_heap(classes, settings);
        let roots = RootSet::new(1);
        let dispatcher = Dispatcher::new(2);
        let region_words = heap.settings().region_size / WORD_SIZE;

        // A linked chain bigger than one survivor region.
        let head = heap.allocate(node, 0).unwrap();
        let mut objects = vec![head];
        let mut tail = head;
        while objects.len() * 4 * WORD_SIZE < 2 * heap.settings().region_size {
            let next = heap.allocate(node, 0).unwrap();
            heap.write_reference(tail, 1, Some(next));
            heap.write_word(next, 3, objects.len() as u64);
            objects.push(next);
            tail = next;
        }
        let w = heap.allocate(weak, 0).unwrap();
        heap.write_reference(w, 1, Some(objects[3]));
        heap.write_reference(objects[1], 2, Some(w));
        let f = allocate_unlisted(&heap, resource, 0);
        heap.write_reference(objects[2], 2, Some(f));
        heap.identity_hash(objects[5]);
        roots.slot(RootKind::Stack, 0).store(Some(head));

        while heap.regions().free_count() > 1 {
            heap.allocate_in_space(Space::Tenure, region_words).unwrap();
        }

        let before: Vec<_> = objects
            .iter()
            .map(|&o| (heap.model().header(o), heap.read_reference(o, 1), heap.read_word(o, 3)))
            .collect();
        let outcome = Scavenger::new(&heap, &roots, &dispatcher).scavenge();
        assert_eq!(outcome, ScavengeOutcome::BackedOut);

        assert_eq!(roots.slot(RootKind::Stack, 0).load(), Some(head), "root points at the original");
        for (&o, (header, next, data)) in objects.iter().zip(before) {
            let now = heap.model().header(o);
            assert_eq!(now.class_id(), header.class_id(), "{o:?} class restored");
            assert_eq!(now.flags(), header.flags(), "{o:?} flags restored");
            assert_eq!(now.age(), header.age(), "{o:?} age restored");
            assert_eq!(now.overlap(), header.overlap(), "{o:?} overlap restored");
            assert_eq!(heap.read_reference(o, 1), next);
            assert_eq!(heap.read_word(o, 3), data);
        }
        assert!(
            heap.model().header(objects[5]).flags().contains(HeaderFlags::HASHED)
                && !heap.model().header(objects[5]).flags().contains(HeaderFlags::MOVED),
            "hash transition is not a completed move"
        );
        assert_eq!(heap.read_reference(w, 1), Some(objects[3]), "live referent kept");
        assert_eq!(heap.read_reference(objects[2], 2), Some(f));
        assert_eq!(heap.regions().count(RegionKind::Survivor), 0, "acquired survivor released");
        assert_eq!(heap.stats().snapshot().evacuation_failures, 1);
        assert!(heap.regions().iter().all(|r| !r.ext.is_evacuate()));
    }

    #[test]
    fn backout_after_rescue_leaves_finalizers_and_references_untouched() {
        let (classes, node, weak, resource, _) = classes();
        let heap = small_heap(classes, HeapSettings { survivor_regions: 1, ..small_settings() });
        let roots = RootSet::new(1);
        let dispatcher = Dispatcher::new(2);
        let model = heap.model();
        let region_words = heap.settings().region_size / WORD_SIZE;

        // More dead finalizable objects than one free region can rescue.
        let resources: Vec<_> = (0..1000).map(|_| heap.allocate(resource, 0).unwrap()).collect();
        let dead = heap.allocate(node, 0).unwrap();
        let old_weak = heap
            .allocate_in_space(Space::Tenure, heap.classes().get(weak).instance_words())
            .unwrap();
        model.initialize(old_weak, weak, 0, 0);
        heap.write_reference(old_weak, 1, Some(dead));
        heap.regions()
            .region_of(old_weak.addr())
            .unwrap()
            .ext
            .lists
            .slot(ObjectCategory::Reference, 0)
            .push(&model, old_weak);

        while heap.regions().free_count() > 1 {
            let block = heap.allocate_in_space(Space::Tenure, region_words).unwrap();
            model.write_filler(block.addr(), region_words);
        }

        let before: Vec<_> = resources.iter().map(|&o| model.header(o)).collect();
        let outcome = Scavenger::new(&heap, &roots, &dispatcher).scavenge();
        assert_eq!(outcome, ScavengeOutcome::BackedOut);

        for (&o, header) in resources.iter().zip(before) {
            assert_eq!(model.header(o), header, "{o:?} header restored");
        }
        assert!(heap.queues().finalizable.load().is_none(), "finalizable queue unchanged");
        assert!(heap.queues().pending_references.load().is_none(), "pending queue unchanged");
        assert_eq!(heap.read_reference(old_weak, 1), Some(dead), "weak referent restored");
        assert_eq!(heap.read_word(old_weak, 3), ReferenceState::Initial as u64);

        let listed: usize = heap
            .regions()
            .iter()
            .flat_map(|r| r.ext.lists.entries(&model, ObjectCategory::Finalizable))
            .count();
        assert_eq!(listed, resources.len(), "every resource is still listed");
        assert!(heap.regions().iter().all(|r| !r.ext.in_collection_set()));

        let stats = heap.stats().snapshot();
        assert_eq!(stats.objects_finalizable, 0);
        assert_eq!(stats.references_cleared, 0);
        assert_eq!(stats.evacuation_failures, 1);
        crate::verify_heap(&heap, &roots).unwrap();
    }

    #[test]
    fn evacuated_regions_join_the_collection_set() {
        let (classes, node, ..) = classes();
        let heap = small_heap(classes, small_settings());
        let roots = RootSet::new(1);
        let dispatcher = Dispatcher::new(1);
        let object = heap.allocate(node, 0).unwrap();
        roots.slot(RootKind::Stack, 0).store(Some(object));
        let eden = heap.regions().index_of(object.addr()).unwrap();

        let scavenger = Scavenger::new(&heap, &roots, &dispatcher);
        let setup = scavenger.setup();
        assert_eq!(setup.evacuate, vec![eden]);
        assert!(heap.regions().get(eden).ext.in_collection_set());
        assert!(
            heap.regions()
                .iter()
                .filter(|r| r.index != eden)
                .all(|r| !r.ext.in_collection_set())
        );
        scavenger.backout(&setup, &[], &ReferenceJournal::default());
        assert!(!heap.regions().get(eden).ext.in_collection_set());

        let outcome = Scavenger::new(&heap, &roots, &dispatcher).scavenge();
        assert!(matches!(outcome, ScavengeOutcome::Completed(_)));
        assert!(heap.regions().iter().all(|r| !r.ext.in_collection_set()));
    }
}
