use std::{
    fmt,
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
};

/// Size of a heap word in bytes. Every object starts on a word boundary.
pub const WORD_SIZE: usize = 8;

/// A reference to a heap object: the address of its header word.
///
/// Reference-valued words store the address directly, with `0` meaning null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    #[inline(always)]
    pub fn from_addr(addr: usize) -> Option<Self> {
        debug_assert!(addr.is_multiple_of(WORD_SIZE), "unaligned object {addr:#x}");
        NonZeroUsize::new(addr).map(Self)
    }

    #[inline(always)]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    /// Address of the word `index` words past the header.
    #[inline(always)]
    pub const fn word_addr(self, index: usize) -> usize {
        self.0.get() + index * WORD_SIZE
    }

    #[inline(always)]
    pub fn encode(value: Option<Self>) -> u64 {
        value.map_or(0, |r| r.addr() as u64)
    }

    #[inline(always)]
    pub fn decode(raw: u64) -> Option<Self> {
        NonZeroUsize::new(raw as usize).map(Self)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

/// A reference slot that lives outside the heap: VM roots, class statics,
/// constant-pool entries, queue heads.
///
/// Collector threads rewrite slots in place when objects move, so the value
/// is atomic and shared by reference.
#[derive(Default)]
pub struct Slot(AtomicU64);

impl Slot {
    pub const fn null() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn new(value: Option<ObjectRef>) -> Self {
        Self(AtomicU64::new(ObjectRef::encode(value)))
    }

    #[inline(always)]
    pub fn load(&self) -> Option<ObjectRef> {
        ObjectRef::decode(self.0.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn store(&self, value: Option<ObjectRef>) {
        self.0.store(ObjectRef::encode(value), Ordering::Release);
    }

    /// Replace `current` with `new`; fails if the mutator changed the slot.
    #[inline(always)]
    pub fn compare_exchange(
        &self,
        current: Option<ObjectRef>,
        new: Option<ObjectRef>,
    ) -> Result<(), Option<ObjectRef>> {
        self.0
            .compare_exchange(
                ObjectRef::encode(current),
                ObjectRef::encode(new),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(ObjectRef::decode)
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_null_is_zero() {
        assert_eq!(ObjectRef::encode(None), 0);
        assert_eq!(ObjectRef::decode(0), None);
        let r = ObjectRef::from_addr(0x40).unwrap();
        assert_eq!(ObjectRef::decode(ObjectRef::encode(Some(r))), Some(r));
        assert_eq!(r.word_addr(2), 0x50);
    }

    #[test]
    fn slot_compare_exchange() {
        let a = ObjectRef::from_addr(0x80).unwrap();
        let b = ObjectRef::from_addr(0x88).unwrap();
        let slot = Slot::new(Some(a));
        assert_eq!(slot.compare_exchange(Some(b), None), Err(Some(a)));
        assert_eq!(slot.compare_exchange(Some(a), Some(b)), Ok(()));
        assert_eq!(slot.load(), Some(b));
    }
}
