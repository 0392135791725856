use std::{
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicU64, Ordering},
};

use object::{HeaderWord, ObjectRef, WORD_SIZE};

use crate::{GcError, GcResult, system};

/// The reserved heap range, viewed as atomic words.
///
/// All heap access goes through [`AtomicU64`] so collector threads and
/// mutators can share the range without data races. Plain field traffic uses
/// `Relaxed`; publication of copies and forwarding pointers is ordered by the
/// header word (see [`crate::ForwardingSlot`]).
pub struct HeapMemory {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is only accessed through atomics
unsafe impl Send for HeapMemory {}
// SAFETY: the mapping is only accessed through atomics
unsafe impl Sync for HeapMemory {}

impl HeapMemory {
    pub fn new(size: usize) -> GcResult<Self> {
        let base = system::reserve_heap(size).ok_or(GcError::HeapReservation(size))?;
        let memory = Self { base, size };
        if memory.end() > HeaderWord::MAX_ADDRESS {
            return Err(GcError::HeapOutOfRange(memory.base()));
        }
        Ok(memory)
    }

    #[inline(always)]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.base() + self.size
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        (self.base()..self.end()).contains(&addr)
    }

    #[inline(always)]
    fn words(&self) -> &[AtomicU64] {
        // SAFETY: the mapping is word aligned, zero initialised, and lives
        // as long as self
        unsafe { slice::from_raw_parts(self.base.as_ptr().cast::<AtomicU64>(), self.size / WORD_SIZE) }
    }

    #[inline(always)]
    pub fn word(&self, addr: usize) -> &AtomicU64 {
        debug_assert!(self.contains(addr), "{addr:#x} outside heap");
        &self.words()[(addr - self.base()) / WORD_SIZE]
    }

    #[inline(always)]
    pub fn load(&self, addr: usize) -> u64 {
        self.word(addr).load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn store(&self, addr: usize, value: u64) {
        self.word(addr).store(value, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn load_ref(&self, addr: usize) -> Option<ObjectRef> {
        ObjectRef::decode(self.word(addr).load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn store_ref(&self, addr: usize, value: Option<ObjectRef>) {
        self.word(addr).store(ObjectRef::encode(value), Ordering::Release);
    }

    #[inline(always)]
    pub fn header(&self, object: ObjectRef) -> HeaderWord {
        HeaderWord::from_raw(self.word(object.addr()).load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn set_header(&self, object: ObjectRef, header: HeaderWord) {
        self.word(object.addr()).store(header.raw(), Ordering::Release);
    }

    /// Copy `words` words from `src` to `dst` in ascending order.
    ///
    /// Overlap is allowed only when `dst <= src`, which both copying
    /// evacuation (disjoint) and sliding compaction satisfy.
    pub fn copy_words(&self, src: usize, dst: usize, words: usize) {
        debug_assert!(dst <= src || dst >= src + words * WORD_SIZE, "backward overlapping copy");
        for i in 0..words {
            let v = self.load(src + i * WORD_SIZE);
            self.store(dst + i * WORD_SIZE, v);
        }
    }

    pub fn fill(&self, addr: usize, words: usize, value: u64) {
        for i in 0..words {
            self.store(addr + i * WORD_SIZE, value);
        }
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        // SAFETY: base and size come from reserve_heap
        unsafe { system::release_heap(self.base, self.size) };
    }
}

impl std::fmt::Debug for HeapMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeapMemory({:#x}..{:#x})", self.base(), self.end())
    }
}
