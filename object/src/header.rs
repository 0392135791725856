use crate::{ClassId, ObjectRef};

bitflags::bitflags! {
    /// GC bookkeeping flags stored in bits 2..8 of a normal header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u8 {
        /// The identity hash has been observed.
        const HASHED = 1 << 0;
        /// The identity hash lives in a trailing slot. Without `HASHED` this
        /// marks a copy whose hash slot was appended by the collection in
        /// progress.
        const MOVED = 1 << 1;
        /// Already handed to the finalizable queue; never re-listed.
        const FINALIZED = 1 << 2;
    }
}

/// State encoded in the two low bits of every header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderTag {
    Normal = 0,
    Forwarded = 1,
    Busy = 2,
    ReverseForwarded = 3,
}

/// The first word of every heap object.
///
/// ```text
/// normal:            [tag:2 = 00] [flags:6] [age:8] [class:16] [overlap:32]
/// forwarded:         [tag:2 = 01] [copy address:46] [preserved age:8] [0:8]
/// busy:              [tag:2 = 10] [claiming worker:62]
/// reverse forwarded: [tag:2 = 11] [original address:46] [0:16]
/// ```
///
/// The overlap half of a normal header is destroyed while a forwarding
/// pointer is installed and must be restored from the copy on backout.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct HeaderWord(u64);

impl HeaderWord {
    const TAG_MASK: u64 = 0b11;
    const FLAGS_SHIFT: u32 = 2;
    const FLAGS_MASK: u64 = 0x3f;
    const AGE_SHIFT: u32 = 8;
    const CLASS_SHIFT: u32 = 16;
    const OVERLAP_SHIFT: u32 = 32;
    const ADDRESS_MASK: u64 = (1 << 48) - 1;
    const PRESERVED_AGE_SHIFT: u32 = 48;

    /// Highest address a forwarding word can carry.
    pub const MAX_ADDRESS: usize = Self::ADDRESS_MASK as usize;
    pub const MAX_AGE: u8 = u8::MAX;

    #[inline(always)]
    pub const fn new(class: ClassId, flags: HeaderFlags, age: u8, overlap: u32) -> Self {
        Self(
            ((flags.bits() as u64) << Self::FLAGS_SHIFT)
                | ((age as u64) << Self::AGE_SHIFT)
                | ((class.0 as u64) << Self::CLASS_SHIFT)
                | ((overlap as u64) << Self::OVERLAP_SHIFT),
        )
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn tag(self) -> HeaderTag {
        match self.0 & Self::TAG_MASK {
            0 => HeaderTag::Normal,
            1 => HeaderTag::Forwarded,
            2 => HeaderTag::Busy,
            _ => HeaderTag::ReverseForwarded,
        }
    }

    #[inline(always)]
    pub const fn is_normal(self) -> bool {
        self.0 & Self::TAG_MASK == HeaderTag::Normal as u64
    }

    #[inline(always)]
    pub const fn is_forwarded(self) -> bool {
        self.0 & Self::TAG_MASK == HeaderTag::Forwarded as u64
    }

    #[inline(always)]
    pub const fn is_busy(self) -> bool {
        self.0 & Self::TAG_MASK == HeaderTag::Busy as u64
    }

    #[inline(always)]
    pub const fn is_reverse_forwarded(self) -> bool {
        self.0 & Self::TAG_MASK == HeaderTag::ReverseForwarded as u64
    }

    // ── Normal header fields ──────────────────────────────────────────

    #[inline(always)]
    pub fn class_id(self) -> ClassId {
        debug_assert!(self.is_normal(), "class id read from {self:?}");
        ClassId((self.0 >> Self::CLASS_SHIFT) as u16)
    }

    #[inline(always)]
    pub fn flags(self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(((self.0 >> Self::FLAGS_SHIFT) & Self::FLAGS_MASK) as u8)
    }

    #[inline(always)]
    pub const fn age(self) -> u8 {
        (self.0 >> Self::AGE_SHIFT) as u8
    }

    #[inline(always)]
    pub const fn overlap(self) -> u32 {
        (self.0 >> Self::OVERLAP_SHIFT) as u32
    }

    #[must_use]
    pub fn with_flags(self, flags: HeaderFlags) -> Self {
        let cleared = self.0 & !(Self::FLAGS_MASK << Self::FLAGS_SHIFT);
        Self(cleared | ((flags.bits() as u64) << Self::FLAGS_SHIFT))
    }

    #[must_use]
    pub const fn with_age(self, age: u8) -> Self {
        Self((self.0 & !(0xff << Self::AGE_SHIFT)) | ((age as u64) << Self::AGE_SHIFT))
    }

    #[must_use]
    pub const fn with_overlap(self, overlap: u32) -> Self {
        Self((self.0 & 0xffff_ffff) | ((overlap as u64) << Self::OVERLAP_SHIFT))
    }

    // ── Forwarding states ─────────────────────────────────────────────

    /// Forwarding word pointing at `copy`, keeping the original age.
    #[inline(always)]
    pub fn forwarded(copy: ObjectRef, preserved_age: u8) -> Self {
        debug_assert!(copy.addr() <= Self::MAX_ADDRESS);
        Self(
            copy.addr() as u64
                | HeaderTag::Forwarded as u64
                | ((preserved_age as u64) << Self::PRESERVED_AGE_SHIFT),
        )
    }

    #[inline(always)]
    pub fn forwarding_target(self) -> Option<ObjectRef> {
        if !self.is_forwarded() {
            return None;
        }
        ObjectRef::from_addr((self.0 & Self::ADDRESS_MASK & !Self::TAG_MASK) as usize)
    }

    #[inline(always)]
    pub const fn preserved_age(self) -> u8 {
        (self.0 >> Self::PRESERVED_AGE_SHIFT) as u8
    }

    #[inline(always)]
    pub const fn busy(worker: usize) -> Self {
        Self(((worker as u64) << 2) | HeaderTag::Busy as u64)
    }

    #[inline(always)]
    pub fn reverse_forwarded(original: ObjectRef) -> Self {
        debug_assert!(original.addr() <= Self::MAX_ADDRESS);
        Self(original.addr() as u64 | HeaderTag::ReverseForwarded as u64)
    }

    #[inline(always)]
    pub fn reverse_target(self) -> Option<ObjectRef> {
        if !self.is_reverse_forwarded() {
            return None;
        }
        ObjectRef::from_addr((self.0 & Self::ADDRESS_MASK & !Self::TAG_MASK) as usize)
    }
}

impl std::fmt::Debug for HeaderWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tag() {
            HeaderTag::Normal => f
                .debug_struct("HeaderWord")
                .field("class", &self.class_id())
                .field("flags", &self.flags())
                .field("age", &self.age())
                .field("overlap", &self.overlap())
                .finish(),
            HeaderTag::Forwarded => write!(f, "Forwarded({:?})", self.forwarding_target()),
            HeaderTag::Busy => write!(f, "Busy(worker {})", self.0 >> 2),
            HeaderTag::ReverseForwarded => {
                write!(f, "ReverseForwarded({:?})", self.reverse_target())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_header_fields() {
        let flags = HeaderFlags::HASHED | HeaderFlags::FINALIZED;
        let h = HeaderWord::new(ClassId(513), flags, 7, 0xdead_beef);
        assert!(h.is_normal());
        assert_eq!(h.class_id(), ClassId(513));
        assert_eq!(h.flags(), flags);
        assert_eq!(h.age(), 7);
        assert_eq!(h.overlap(), 0xdead_beef);

        let h = h.with_age(9).with_flags(HeaderFlags::MOVED);
        assert_eq!(h.age(), 9);
        assert_eq!(h.flags(), HeaderFlags::MOVED);
        assert_eq!(h.class_id(), ClassId(513), "class survives field updates");
        assert_eq!(h.overlap(), 0xdead_beef, "overlap survives field updates");
    }

    #[test]
    fn forwarding_word_keeps_target_and_age() {
        let copy = ObjectRef::from_addr(0x7f12_3456_7890).unwrap();
        let h = HeaderWord::forwarded(copy, 3);
        assert_eq!(h.tag(), HeaderTag::Forwarded);
        assert_eq!(h.forwarding_target(), Some(copy));
        assert_eq!(h.preserved_age(), 3);
        assert_eq!(h.reverse_target(), None);
    }

    #[test]
    fn busy_and_reverse_words() {
        assert!(HeaderWord::busy(12).is_busy());
        let original = ObjectRef::from_addr(0x1000).unwrap();
        let h = HeaderWord::reverse_forwarded(original);
        assert!(h.is_reverse_forwarded());
        assert_eq!(h.reverse_target(), Some(original));
        assert_eq!(h.forwarding_target(), None);
    }
}
