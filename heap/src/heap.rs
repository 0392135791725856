//! The shared heap context passed explicitly to every collector component.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use object::{
    ARRAY_DATA_INDEX, ARRAY_LENGTH_INDEX, ClassDescriptor, ClassId, ClassTable, HeaderFlags,
    HeaderWord, ObjectCategory, ObjectRef, Slot, WORD_SIZE,
};
use parking_lot::Mutex;

use crate::{
    CardState, CardTable, GcResult, GcStats, HeapMemory, HeapSettings, MarkMap, NO_REGION,
    ObjectListIter, ObjectModel, RegionKind, RegionTable,
};

/// Allocation spaces of the generational heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Space {
    Eden = 0,
    Survivor = 1,
    Tenure = 2,
}

impl Space {
    pub const COUNT: usize = 3;

    #[inline(always)]
    pub fn region_kind(self) -> RegionKind {
        match self {
            Space::Eden => RegionKind::Eden,
            Space::Survivor => RegionKind::Survivor,
            Space::Tenure => RegionKind::Tenure,
        }
    }
}

/// Collector-owned queue heads, walked as finalizable roots.
///
/// `finalizable` chains objects awaiting their finalizer through their
/// finalize link; `pending_references` chains cleared references through
/// their queue link.
#[derive(Debug, Default)]
pub struct FinalizeQueues {
    pub finalizable: Slot,
    pub pending_references: Slot,
}

impl FinalizeQueues {
    pub fn slots(&self) -> [&Slot; 2] {
        [&self.finalizable, &self.pending_references]
    }

    fn chain<'a>(
        head: &Slot,
        model: ObjectModel<'a>,
        link: impl Fn(&ClassDescriptor) -> Option<usize> + 'a,
    ) -> ObjectListIter<impl Fn(ObjectRef) -> usize + 'a> {
        ObjectListIter::new(head.load(), move |object| {
            let class = model.class_of(object);
            // A null link ends the chain; report it as the self link.
            match link(class).map(|i| model.memory().load(object.word_addr(i))) {
                Some(0) | None => object.addr(),
                Some(next) => next as usize,
            }
        })
    }

    pub fn finalizable_objects(&self, model: ObjectModel<'_>) -> Vec<ObjectRef> {
        Self::chain(&self.finalizable, model, ClassDescriptor::finalize_link).collect()
    }

    pub fn pending_reference_objects(&self, model: ObjectModel<'_>) -> Vec<ObjectRef> {
        Self::chain(&self.pending_references, model, |c| {
            c.reference_layout().map(|l| l.queue_link)
        })
        .collect()
    }

    /// Pushes `object` on the finalizable queue. Pause-only.
    pub(crate) fn enqueue_finalizable(&self, model: ObjectModel<'_>, object: ObjectRef) {
        if let Some(link) = model.class_of(object).finalize_link() {
            model.memory().store_ref(object.word_addr(link), self.finalizable.load());
            self.finalizable.store(Some(object));
        }
    }

    /// Pushes a cleared reference on the pending list. Pause-only.
    pub(crate) fn enqueue_reference(&self, model: ObjectModel<'_>, reference: ObjectRef) {
        if let Some(layout) = model.class_of(reference).reference_layout() {
            model
                .memory()
                .store_ref(reference.word_addr(layout.queue_link), self.pending_references.load());
            self.pending_references.store(Some(reference));
        }
    }
}

pub struct Heap {
    settings: HeapSettings,
    memory: HeapMemory,
    classes: ClassTable,
    regions: RegionTable,
    mark_map: MarkMap,
    cards: CardTable,
    stats: GcStats,
    queues: FinalizeQueues,
    cursors: [AtomicUsize; Space::COUNT],
    space_regions: [AtomicUsize; Space::COUNT],
    refill: [Mutex<()>; Space::COUNT],
    concurrent_barrier: AtomicBool,
    allocate_black: AtomicBool,
    walkable: AtomicBool,
}

impl Heap {
    pub fn new(settings: HeapSettings, classes: ClassTable) -> GcResult<Self> {
        settings.validate()?;
        let memory = HeapMemory::new(settings.heap_size)?;
        let base = memory.base();
        log::debug!(
            "heap reserved at {:#x}: {} regions of {} bytes",
            base,
            settings.region_count(),
            settings.region_size
        );
        Ok(Self {
            regions: RegionTable::new(base, &settings),
            mark_map: MarkMap::new(base, settings.heap_size),
            cards: CardTable::new(base, settings.heap_size, settings.card_size),
            stats: GcStats::default(),
            queues: FinalizeQueues::default(),
            cursors: std::array::from_fn(|_| AtomicUsize::new(NO_REGION)),
            space_regions: std::array::from_fn(|_| AtomicUsize::new(0)),
            refill: std::array::from_fn(|_| Mutex::new(())),
            concurrent_barrier: AtomicBool::new(false),
            allocate_black: AtomicBool::new(false),
            walkable: AtomicBool::new(true),
            settings,
            memory,
            classes,
        })
    }

    #[inline(always)]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline(always)]
    pub fn memory(&self) -> &HeapMemory {
        &self.memory
    }

    #[inline(always)]
    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    #[inline(always)]
    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    #[inline(always)]
    pub fn mark_map(&self) -> &MarkMap {
        &self.mark_map
    }

    #[inline(always)]
    pub fn cards(&self) -> &CardTable {
        &self.cards
    }

    #[inline(always)]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    #[inline(always)]
    pub fn queues(&self) -> &FinalizeQueues {
        &self.queues
    }

    #[inline(always)]
    pub fn model(&self) -> ObjectModel<'_> {
        ObjectModel::new(&self.memory, &self.classes)
    }

    // ── Allocation ────────────────────────────────────────────────────

    fn space_limit(&self, space: Space) -> Option<usize> {
        match space {
            Space::Eden => Some(self.settings.eden_regions),
            Space::Survivor => Some(self.settings.survivor_regions),
            Space::Tenure => None,
        }
    }

    /// Bump-allocates `words` zeroed words in `space`.
    ///
    /// Returns `None` when the space has reached its region limit or the
    /// heap has no free region left.
    pub fn allocate_in_space(&self, space: Space, words: usize) -> Option<ObjectRef> {
        if words * WORD_SIZE > self.settings.region_size {
            return None;
        }
        let cursor = &self.cursors[space as usize];
        loop {
            let current = cursor.load(Ordering::Acquire);
            if current != NO_REGION
                && let Some(addr) = self.regions.get(current).bump(words)
            {
                return ObjectRef::from_addr(addr);
            }

            let _refill = self.refill[space as usize].lock();
            if cursor.load(Ordering::Acquire) != current {
                continue;
            }
            let used = &self.space_regions[space as usize];
            if self.space_limit(space).is_some_and(|limit| used.load(Ordering::Acquire) >= limit) {
                return None;
            }
            let region = self.regions.acquire(space.region_kind())?;
            used.fetch_add(1, Ordering::AcqRel);
            log::trace!("{space:?} now allocating in region {}", region.index);
            cursor.store(region.index, Ordering::Release);
        }
    }

    /// Forgets the current region of `space` and its region count.
    pub fn reset_space(&self, space: Space) {
        let _refill = self.refill[space as usize].lock();
        self.cursors[space as usize].store(NO_REGION, Ordering::Release);
        self.space_regions[space as usize].store(0, Ordering::Release);
    }

    pub fn space_region_count(&self, space: Space) -> usize {
        self.space_regions[space as usize].load(Ordering::Acquire)
    }

    /// Adopts `count` existing regions into the accounting of `space`.
    pub(crate) fn adopt_space_regions(&self, space: Space, count: usize) {
        self.space_regions[space as usize].fetch_add(count, Ordering::AcqRel);
    }

    /// Allocates a mutator object in eden. Returns `None` when eden is full
    /// and a scavenge is due.
    pub fn allocate(&self, class: ClassId, length: usize) -> Option<ObjectRef> {
        self.allocate_object(class, length, true)
    }

    pub(crate) fn allocate_object(&self, class: ClassId, length: usize, register: bool) -> Option<ObjectRef> {
        let descriptor = self.classes.get(class);
        let words = if descriptor.is_indexable() {
            ARRAY_DATA_INDEX + length
        } else {
            descriptor.instance_words()
        };
        let object = self.allocate_in_space(Space::Eden, words)?;
        let seed = (object.addr() as u32).rotate_left(13) ^ 0x5bd1_e995;
        self.model().initialize(object, class, length, seed);

        // Black objects are never scanned, so marking cannot list them.
        let black = self.allocate_black.load(Ordering::Acquire);
        if black {
            self.mark_map.set_bit(object.addr());
        }
        if register
            && let Some(category) = descriptor.category()
            && (black || category != ObjectCategory::Reference)
            && let Some(region) = self.regions.region_of(object.addr())
        {
            let slot = (object.addr() / WORD_SIZE) % self.settings.object_list_count;
            region.ext.lists.slot(category, slot).push(&self.model(), object);
        }
        Some(object)
    }

    // ── Mutator access ────────────────────────────────────────────────

    #[inline]
    pub fn read_reference(&self, object: ObjectRef, index: usize) -> Option<ObjectRef> {
        self.memory.load_ref(object.word_addr(index))
    }

    /// Stores a reference field and runs the post-write barrier.
    #[inline]
    pub fn write_reference(&self, object: ObjectRef, index: usize, value: Option<ObjectRef>) {
        self.memory.store_ref(object.word_addr(index), value);
        self.post_write_barrier(object, value);
    }

    /// Stores element `i` of a pointer array.
    #[inline]
    pub fn write_element(&self, array: ObjectRef, i: usize, value: Option<ObjectRef>) {
        debug_assert!(i < self.memory.load(array.word_addr(ARRAY_LENGTH_INDEX)) as usize);
        self.write_reference(array, ARRAY_DATA_INDEX + i, value);
    }

    #[inline]
    pub fn read_element(&self, array: ObjectRef, i: usize) -> Option<ObjectRef> {
        self.read_reference(array, ARRAY_DATA_INDEX + i)
    }

    #[inline]
    pub fn read_word(&self, object: ObjectRef, index: usize) -> u64 {
        self.memory.load(object.word_addr(index))
    }

    #[inline]
    pub fn write_word(&self, object: ObjectRef, index: usize, value: u64) {
        self.memory.store(object.word_addr(index), value);
    }

    /// Cross-generation and cross-region bookkeeping for a reference store.
    #[inline]
    pub fn post_write_barrier(&self, object: ObjectRef, value: Option<ObjectRef>) {
        if self.concurrent_barrier.load(Ordering::Acquire) {
            self.cards.dirty(object.addr(), CardState::CONCURRENT);
        }
        let Some(target) = value else { return };
        self.remember_edge(object, target);
    }

    /// Records `object -> target` in the card table and remembered sets.
    #[inline]
    pub(crate) fn remember_edge(&self, object: ObjectRef, target: ObjectRef) {
        let (Some(source), Some(dest)) = (
            self.regions.region_of(object.addr()),
            self.regions.region_of(target.addr()),
        ) else {
            return;
        };
        if source.index == dest.index {
            return;
        }
        if dest.is_young() {
            if !source.is_young() {
                self.cards.dirty(object.addr(), CardState::REMEMBERED);
            }
        } else {
            dest.ext.remembered_set.add(self.cards.card_index(object.addr()));
        }
    }

    pub fn class_of(&self, object: ObjectRef) -> &ClassDescriptor {
        self.model().class_of(object)
    }

    /// Identity hash of `object`, stable across moves.
    pub fn identity_hash(&self, object: ObjectRef) -> u32 {
        let word = self.memory.word(object.addr());
        let mut current = HeaderWord::from_raw(word.load(Ordering::Acquire));
        while !current.flags().intersects(HeaderFlags::HASHED | HeaderFlags::MOVED) {
            let hashed = current.with_flags(current.flags() | HeaderFlags::HASHED);
            match word.compare_exchange_weak(current.raw(), hashed.raw(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = HeaderWord::from_raw(actual),
            }
        }
        self.model().identity_hash(object)
    }

    /// Pins the region holding `object` against compaction.
    pub fn enter_critical(&self, object: ObjectRef) {
        if let Some(region) = self.regions.region_of(object.addr()) {
            region.ext.enter_critical();
        }
    }

    pub fn exit_critical(&self, object: ObjectRef) {
        if let Some(region) = self.regions.region_of(object.addr()) {
            region.ext.exit_critical();
        }
    }

    #[inline]
    pub fn is_young(&self, addr: usize) -> bool {
        self.regions.region_of(addr).is_some_and(|r| r.is_young())
    }

    /// Objects of the finalizable queue, handing them to the runtime.
    pub fn take_finalizable(&self) -> Vec<ObjectRef> {
        let objects = self.queues.finalizable_objects(self.model());
        self.queues.finalizable.store(None);
        for &object in &objects {
            if let Some(link) = self.classes.get(self.model().header(object).class_id()).finalize_link() {
                self.memory.store_ref(object.word_addr(link), None);
            }
        }
        objects
    }

    /// Cleared references, handing them to the runtime.
    pub fn take_pending_references(&self) -> Vec<ObjectRef> {
        let references = self.queues.pending_reference_objects(self.model());
        self.queues.pending_references.store(None);
        for &reference in &references {
            if let Some(layout) = self.class_of(reference).reference_layout() {
                self.memory.store_ref(reference.word_addr(layout.queue_link), None);
            }
        }
        references
    }

    // ── Collector state ───────────────────────────────────────────────

    pub(crate) fn set_concurrent_barrier(&self, installed: bool) {
        self.concurrent_barrier.store(installed, Ordering::Release);
    }

    pub fn concurrent_barrier_installed(&self) -> bool {
        self.concurrent_barrier.load(Ordering::Acquire)
    }

    pub(crate) fn set_allocate_black(&self, black: bool) {
        self.allocate_black.store(black, Ordering::Release);
    }

    pub fn is_walkable(&self) -> bool {
        self.walkable.load(Ordering::Acquire)
    }

    pub(crate) fn set_walkable(&self, walkable: bool) {
        self.walkable.store(walkable, Ordering::Release);
    }

    /// Objects of a region from its start to its allocation top.
    pub fn objects_in_region(&self, index: usize) -> impl Iterator<Item = ObjectRef> + '_ {
        let region = self.regions.get(index);
        self.model().objects_in(region.start, region.top())
    }

    /// Bytes in use by objects across regions of `kind`.
    pub fn used_bytes(&self, kind: RegionKind) -> usize {
        self.regions
            .iter()
            .filter(|r| r.kind() == kind)
            .map(|r| r.used_bytes() - r.pool.free_and_dark_matter_bytes().min(r.used_bytes()))
            .sum()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("memory", &self.memory)
            .field("regions", &self.regions.len())
            .field("eden", &self.regions.count(RegionKind::Eden))
            .field("survivor", &self.regions.count(RegionKind::Survivor))
            .field("tenure", &self.regions.count(RegionKind::Tenure))
            .finish()
    }
}
