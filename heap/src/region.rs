use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use object::WORD_SIZE;

use crate::{CategoryLists, HeapMemory, HeapSettings, RememberedSetCardList};

pub const NO_REGION: usize = usize::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Free = 0,
    Eden = 1,
    Survivor = 2,
    Tenure = 3,
}

impl From<u8> for RegionKind {
    fn from(val: u8) -> Self {
        match val {
            1 => RegionKind::Eden,
            2 => RegionKind::Survivor,
            3 => RegionKind::Tenure,
            _ => RegionKind::Free,
        }
    }
}

impl RegionKind {
    #[inline(always)]
    pub fn is_young(self) -> bool {
        matches!(self, Self::Eden | Self::Survivor)
    }
}

/// Free and unusable bytes of a region as of its last sweep or compaction.
#[derive(Debug, Default)]
pub struct MemoryPool {
    free_bytes: AtomicUsize,
    dark_matter_bytes: AtomicUsize,
    largest_free_entry: AtomicUsize,
}

impl MemoryPool {
    pub fn update(&self, free: usize, dark_matter: usize, largest: usize) {
        self.free_bytes.store(free, Ordering::Relaxed);
        self.dark_matter_bytes.store(dark_matter, Ordering::Relaxed);
        self.largest_free_entry.store(largest, Ordering::Relaxed);
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes.load(Ordering::Relaxed)
    }

    pub fn dark_matter_bytes(&self) -> usize {
        self.dark_matter_bytes.load(Ordering::Relaxed)
    }

    pub fn largest_free_entry(&self) -> usize {
        self.largest_free_entry.load(Ordering::Relaxed)
    }

    /// Everything a compaction of the region could give back.
    pub fn free_and_dark_matter_bytes(&self) -> usize {
        self.free_bytes() + self.dark_matter_bytes()
    }
}

/// Collector bookkeeping attached to every managed region.
#[derive(Debug)]
pub struct RegionExtension {
    should_compact: AtomicBool,
    /// Swept against this cycle's mark map, or picked by the work-goal
    /// selection. Only such regions are tagged for compaction.
    should_reclaim: AtomicBool,
    already_swept: AtomicBool,
    defragmentation_target: AtomicBool,
    /// Being evacuated by a scavenge, so compaction leaves it alone.
    in_collection_set: AtomicBool,
    /// Young region being evacuated by the current scavenge.
    evacuate: AtomicBool,
    compact_score: AtomicU64,
    critical_sections: AtomicUsize,
    /// Allocation top before the current scavenge copied into the region.
    backout_top: AtomicUsize,
    pub remembered_set: RememberedSetCardList,
    pub lists: CategoryLists,
}

macro_rules! region_flag {
    ($get:ident, $set:ident, $field:ident) => {
        #[inline]
        pub fn $get(&self) -> bool {
            self.$field.load(Ordering::Acquire)
        }

        #[inline]
        pub fn $set(&self, value: bool) {
            self.$field.store(value, Ordering::Release);
        }
    };
}

impl RegionExtension {
    pub fn new(settings: &HeapSettings) -> Self {
        Self {
            should_compact: AtomicBool::new(false),
            should_reclaim: AtomicBool::new(false),
            already_swept: AtomicBool::new(true),
            defragmentation_target: AtomicBool::new(false),
            in_collection_set: AtomicBool::new(false),
            evacuate: AtomicBool::new(false),
            compact_score: AtomicU64::new(0f64.to_bits()),
            critical_sections: AtomicUsize::new(0),
            backout_top: AtomicUsize::new(0),
            remembered_set: RememberedSetCardList::new(settings.remembered_set_capacity),
            lists: CategoryLists::new(settings.object_list_count),
        }
    }

    region_flag!(should_compact, set_should_compact, should_compact);
    region_flag!(should_reclaim, set_should_reclaim, should_reclaim);
    region_flag!(already_swept, set_already_swept, already_swept);
    region_flag!(is_defragmentation_target, set_defragmentation_target, defragmentation_target);
    region_flag!(in_collection_set, set_in_collection_set, in_collection_set);
    region_flag!(is_evacuate, set_evacuate, evacuate);

    #[inline]
    pub fn compact_score(&self) -> f64 {
        f64::from_bits(self.compact_score.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_compact_score(&self, score: f64) {
        self.compact_score.store(score.to_bits(), Ordering::Relaxed);
    }

    pub fn critical_sections(&self) -> usize {
        self.critical_sections.load(Ordering::Acquire)
    }

    pub fn enter_critical(&self) {
        self.critical_sections.fetch_add(1, Ordering::AcqRel);
    }

    pub fn exit_critical(&self) {
        let prev = self.critical_sections.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unbalanced critical section exit");
    }

    pub fn backout_top(&self) -> usize {
        self.backout_top.load(Ordering::Relaxed)
    }

    pub fn set_backout_top(&self, top: usize) {
        self.backout_top.store(top, Ordering::Relaxed);
    }

    /// Returns the extension to the state of a freshly managed region.
    pub fn reset(&self) {
        self.set_should_compact(false);
        self.set_should_reclaim(false);
        self.set_already_swept(true);
        self.set_defragmentation_target(false);
        self.set_in_collection_set(false);
        self.set_evacuate(false);
        self.set_compact_score(0.0);
        self.remembered_set.clear();
        self.lists.reset();
    }
}

/// A fixed-size slice of the heap.
#[derive(Debug)]
pub struct RegionDescriptor {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    kind: AtomicU8,
    /// Objects occupy `[start, top)` contiguously.
    top: AtomicUsize,
    age: AtomicU8,
    /// The mark map describes every object in the region.
    valid_mark_map: AtomicBool,
    /// Intrusive link for the free-region stack.
    next: AtomicUsize,
    pub pool: MemoryPool,
    pub ext: RegionExtension,
}

impl RegionDescriptor {
    #[inline(always)]
    pub fn kind(&self) -> RegionKind {
        RegionKind::from(self.kind.load(Ordering::Acquire))
    }

    pub fn set_kind(&self, kind: RegionKind) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_young(&self) -> bool {
        self.kind().is_young()
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    pub fn set_top(&self, top: usize) {
        debug_assert!((self.start..=self.end).contains(&top));
        self.top.store(top, Ordering::Release);
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    #[inline(always)]
    pub fn used_bytes(&self) -> usize {
        self.top() - self.start
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }

    /// Bump-allocates `words` words at the top of the region.
    #[inline]
    pub fn bump(&self, words: usize) -> Option<usize> {
        let bytes = words * WORD_SIZE;
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            if top + bytes > self.end {
                return None;
            }
            match self.top.compare_exchange_weak(top, top + bytes, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Some(top),
                Err(current) => top = current,
            }
        }
    }

    pub fn age(&self) -> u8 {
        self.age.load(Ordering::Relaxed)
    }

    pub fn set_age(&self, age: u8) {
        self.age.store(age, Ordering::Relaxed);
    }

    /// Compact group: 0 for young regions, `1 + age` for tenure.
    #[inline]
    pub fn compact_group(&self, max_age: u8) -> usize {
        if self.is_young() {
            0
        } else {
            1 + self.age().min(max_age) as usize
        }
    }

    pub fn has_valid_mark_map(&self) -> bool {
        self.valid_mark_map.load(Ordering::Acquire)
    }

    pub fn set_valid_mark_map(&self, valid: bool) {
        self.valid_mark_map.store(valid, Ordering::Release);
    }
}

/// All regions of the heap plus the lock-free stack of free regions.
#[derive(Debug)]
pub struct RegionTable {
    region_size: usize,
    base: usize,
    regions: Box<[RegionDescriptor]>,
    free: AtomicUsize,
    fresh_cursor: AtomicUsize,
    kind_counts: [AtomicUsize; 4],
}

impl RegionTable {
    pub fn new(base: usize, settings: &HeapSettings) -> Self {
        let regions = (0..settings.region_count())
            .map(|index| {
                let start = base + index * settings.region_size;
                RegionDescriptor {
                    index,
                    start,
                    end: start + settings.region_size,
                    kind: AtomicU8::new(RegionKind::Free as u8),
                    top: AtomicUsize::new(start),
                    age: AtomicU8::new(0),
                    valid_mark_map: AtomicBool::new(false),
                    next: AtomicUsize::new(NO_REGION),
                    pool: MemoryPool::default(),
                    ext: RegionExtension::new(settings),
                }
            })
            .collect::<Box<[_]>>();
        for region in regions.iter() {
            region.pool.update(region.size(), 0, region.size());
        }
        Self {
            region_size: settings.region_size,
            base,
            regions,
            free: AtomicUsize::new(NO_REGION),
            fresh_cursor: AtomicUsize::new(0),
            kind_counts: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    #[inline(always)]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> &RegionDescriptor {
        &self.regions[index]
    }

    #[inline(always)]
    pub fn index_of(&self, addr: usize) -> Option<usize> {
        let index = addr.checked_sub(self.base)? / self.region_size;
        (index < self.regions.len()).then_some(index)
    }

    #[inline(always)]
    pub fn region_of(&self, addr: usize) -> Option<&RegionDescriptor> {
        self.index_of(addr).map(|i| &self.regions[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegionDescriptor> {
        self.regions.iter()
    }

    pub fn count(&self, kind: RegionKind) -> usize {
        self.kind_counts[kind as usize].load(Ordering::Acquire)
    }

    pub fn free_count(&self) -> usize {
        self.len() - self.count(RegionKind::Eden) - self.count(RegionKind::Survivor) - self.count(RegionKind::Tenure)
    }

    /// Hands out a free region as `kind`, preferring recycled regions.
    pub fn acquire(&self, kind: RegionKind) -> Option<&RegionDescriptor> {
        debug_assert_ne!(kind, RegionKind::Free);
        let index = self.pop_free().or_else(|| self.next_fresh())?;
        let region = &self.regions[index];
        region.set_top(region.start);
        region.set_age(0);
        region.set_valid_mark_map(false);
        region.ext.reset();
        region.pool.update(region.size(), 0, region.size());
        region.set_kind(kind);
        self.kind_counts[kind as usize].fetch_add(1, Ordering::AcqRel);
        Some(region)
    }

    /// Returns a region to the free stack, zeroing what was allocated in it.
    pub fn release(&self, memory: &HeapMemory, index: usize) {
        let region = &self.regions[index];
        let kind = region.kind();
        debug_assert_ne!(kind, RegionKind::Free, "region {index} released twice");
        memory.fill(region.start, region.used_bytes() / WORD_SIZE, 0);
        region.set_top(region.start);
        region.set_kind(RegionKind::Free);
        region.set_valid_mark_map(false);
        region.ext.reset();
        region.pool.update(region.size(), 0, region.size());
        self.kind_counts[kind as usize].fetch_sub(1, Ordering::AcqRel);
        self.push_free(index);
    }

    /// Changes the kind of an in-use region.
    pub fn retag(&self, index: usize, kind: RegionKind) {
        let region = &self.regions[index];
        let old = region.kind();
        if old == kind {
            return;
        }
        debug_assert!(old != RegionKind::Free && kind != RegionKind::Free);
        self.kind_counts[old as usize].fetch_sub(1, Ordering::AcqRel);
        self.kind_counts[kind as usize].fetch_add(1, Ordering::AcqRel);
        region.set_kind(kind);
    }

    fn next_fresh(&self) -> Option<usize> {
        let mut fresh = self.fresh_cursor.load(Ordering::Relaxed);
        loop {
            if fresh >= self.regions.len() {
                return None;
            }
            match self.fresh_cursor.compare_exchange(fresh, fresh + 1, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return Some(fresh),
                Err(updated) => fresh = updated,
            }
        }
    }

    fn push_free(&self, index: usize) {
        let mut head = self.free.load(Ordering::Relaxed);
        loop {
            self.regions[index].next.store(head, Ordering::Relaxed);
            match self.free.compare_exchange_weak(head, index, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(new_head) => head = new_head,
            }
        }
    }

    // Regions are only pushed during pauses, so a pop never races a push.
    fn pop_free(&self) -> Option<usize> {
        let mut head = self.free.load(Ordering::Acquire);
        loop {
            if head == NO_REGION {
                return None;
            }
            let next = self.regions[head].next.load(Ordering::Relaxed);
            match self.free.compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire) {
                Ok(_) => {
                    self.regions[head].next.store(NO_REGION, Ordering::Relaxed);
                    return Some(head);
                }
                Err(new_head) => head = new_head,
            }
        }
    }
}
