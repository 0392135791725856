//! Typed access to objects laid out in [`HeapMemory`].

use object::{
    ARRAY_DATA_INDEX, ARRAY_LENGTH_INDEX, ClassDescriptor, ClassId, ClassTable, FILLER_SIZE_INDEX,
    HeaderFlags, HeaderWord, MIN_OBJECT_WORDS, ObjectRef, ReferenceKind, ScanType, WORD_SIZE,
};

use crate::HeapMemory;

/// Which referents a scan treats as strong edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentPolicy {
    /// Soft referents are strong, weak and phantom referents are discovered.
    Discover,
    /// Every referent is visited (fixup and verification).
    All,
}

#[derive(Clone, Copy)]
pub struct ObjectModel<'h> {
    memory: &'h HeapMemory,
    classes: &'h ClassTable,
}

impl<'h> ObjectModel<'h> {
    pub fn new(memory: &'h HeapMemory, classes: &'h ClassTable) -> Self {
        Self { memory, classes }
    }

    #[inline(always)]
    pub fn memory(&self) -> &'h HeapMemory {
        self.memory
    }

    #[inline(always)]
    pub fn classes(&self) -> &'h ClassTable {
        self.classes
    }

    #[inline(always)]
    pub fn header(&self, object: ObjectRef) -> HeaderWord {
        self.memory.header(object)
    }

    /// Class of an object whose header is normal.
    #[inline(always)]
    pub fn class_of(&self, object: ObjectRef) -> &'h ClassDescriptor {
        self.classes.get(self.header(object).class_id())
    }

    #[inline(always)]
    pub fn scan_type(&self, object: ObjectRef) -> ScanType {
        self.class_of(object).scan_type()
    }

    #[inline(always)]
    pub fn is_indexable(&self, object: ObjectRef) -> bool {
        self.class_of(object).is_indexable()
    }

    #[inline(always)]
    pub fn array_length(&self, object: ObjectRef) -> usize {
        self.memory.load(object.word_addr(ARRAY_LENGTH_INDEX)) as usize
    }

    /// Size of `object` as described by `header`, which may be a preserved
    /// copy of the real header.
    #[inline]
    pub fn size_for(&self, header: HeaderWord, object: ObjectRef) -> usize {
        let class = self.classes.get(header.class_id());
        let base = match class.scan_type() {
            ScanType::Filler => return self.memory.load(object.word_addr(FILLER_SIZE_INDEX)) as usize,
            ScanType::PointerArray | ScanType::PrimitiveArray => {
                ARRAY_DATA_INDEX + self.array_length(object)
            }
            _ => class.instance_words(),
        };
        if header.flags().contains(HeaderFlags::MOVED) {
            base + 1
        } else {
            base
        }
    }

    #[inline(always)]
    pub fn size_in_words(&self, object: ObjectRef) -> usize {
        self.size_for(self.header(object), object)
    }

    #[inline(always)]
    pub fn size_in_bytes(&self, object: ObjectRef) -> usize {
        self.size_in_words(object) * WORD_SIZE
    }

    /// Size a copy of `object` needs: one more word when the identity hash
    /// has been observed but not yet given its own slot.
    #[inline]
    pub fn copied_size_for(&self, header: HeaderWord, object: ObjectRef) -> usize {
        let size = self.size_for(header, object);
        if Self::needs_hash_slot(header) {
            size + 1
        } else {
            size
        }
    }

    #[inline(always)]
    fn needs_hash_slot(header: HeaderWord) -> bool {
        let flags = header.flags();
        flags.contains(HeaderFlags::HASHED) && !flags.contains(HeaderFlags::MOVED)
    }

    /// Hash derived from an address; stored once the object first moves.
    #[inline]
    pub fn address_hash(addr: usize, seed: u32) -> u32 {
        let mixed = (addr as u64 ^ seed as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        (mixed >> 32) as u32
    }

    pub fn identity_hash(&self, object: ObjectRef) -> u32 {
        let header = self.header(object);
        if header.flags().contains(HeaderFlags::MOVED) {
            let size = self.size_for(header, object);
            self.memory.load(object.word_addr(size - 1)) as u32
        } else {
            Self::address_hash(object.addr(), header.overlap())
        }
    }

    /// Copies the body of `src` (described by `header`) to `dst` and returns
    /// the header the copy should carry, with age unchanged.
    ///
    /// A hashed object that has never moved gets its hash slot appended and
    /// carries `MOVED` without `HASHED` until the collection finalises it.
    pub fn copy_object(&self, src: ObjectRef, dst: ObjectRef, header: HeaderWord) -> (HeaderWord, usize) {
        let size = self.size_for(header, src);
        self.memory
            .copy_words(src.word_addr(1), dst.word_addr(1), size - 1);
        if Self::needs_hash_slot(header) {
            let hash = Self::address_hash(src.addr(), header.overlap());
            self.memory.store(dst.word_addr(size), hash as u64);
            let flags = (header.flags() - HeaderFlags::HASHED) | HeaderFlags::MOVED;
            (header.with_flags(flags), size + 1)
        } else {
            (header, size)
        }
    }

    /// Turns a transient `MOVED`-only header into the settled hashed state.
    #[inline]
    pub fn settle_hash_state(header: HeaderWord) -> HeaderWord {
        let flags = header.flags();
        if flags.contains(HeaderFlags::MOVED) && !flags.contains(HeaderFlags::HASHED) {
            header.with_flags(flags | HeaderFlags::HASHED)
        } else {
            header
        }
    }

    /// Writes a normal header and clears the body of a fresh object.
    pub fn initialize(&self, object: ObjectRef, class: ClassId, length: usize, overlap: u32) -> usize {
        let descriptor = self.classes.get(class);
        let words = if descriptor.is_indexable() {
            ARRAY_DATA_INDEX + length
        } else {
            descriptor.instance_words()
        };
        self.memory.fill(object.word_addr(1), words - 1, 0);
        if descriptor.is_indexable() {
            self.memory.store(object.word_addr(ARRAY_LENGTH_INDEX), length as u64);
        }
        self.memory
            .set_header(object, HeaderWord::new(class, HeaderFlags::empty(), 0, overlap));
        words
    }

    /// Overwrites `[addr, addr + words)` with a filler object.
    pub fn write_filler(&self, addr: usize, words: usize) {
        debug_assert!(words >= MIN_OBJECT_WORDS, "hole of {words} words at {addr:#x}");
        self.memory.store(addr + FILLER_SIZE_INDEX * WORD_SIZE, words as u64);
        self.memory
            .store(addr, HeaderWord::new(ClassTable::FILLER, HeaderFlags::empty(), 0, 0).raw());
    }

    #[inline(always)]
    pub fn is_filler(&self, object: ObjectRef) -> bool {
        self.header(object).class_id() == ClassTable::FILLER
    }

    /// Calls `visit` with the address of every reference word of `object`.
    pub fn for_each_reference_slot(
        &self,
        object: ObjectRef,
        policy: ReferentPolicy,
        mut visit: impl FnMut(usize),
    ) {
        let class = self.class_of(object);
        match class.scan_type() {
            ScanType::PrimitiveArray | ScanType::Filler => {}
            ScanType::PointerArray => {
                for i in 0..self.array_length(object) {
                    visit(object.word_addr(ARRAY_DATA_INDEX + i));
                }
            }
            ScanType::Reference(kind) => {
                let strong = kind == ReferenceKind::Soft || policy == ReferentPolicy::All;
                if let (true, Some(layout)) = (strong, class.reference_layout()) {
                    visit(object.word_addr(layout.referent));
                }
                for &offset in class.reference_offsets() {
                    visit(object.word_addr(offset));
                }
            }
            ScanType::Mixed | ScanType::OwnableSynchronizer | ScanType::Continuation => {
                for &offset in class.reference_offsets() {
                    visit(object.word_addr(offset));
                }
            }
        }
    }

    /// Address of the list link word, if the object's class has one.
    #[inline]
    pub fn list_link_addr(&self, object: ObjectRef) -> Option<usize> {
        self.class_of(object).list_link().map(|i| object.word_addr(i))
    }

    /// Objects laid out contiguously in `[start, end)`.
    pub fn objects_in(&self, start: usize, end: usize) -> ObjectWalk<'h> {
        ObjectWalk {
            model: *self,
            cursor: start,
            end,
        }
    }
}

/// Linear walk over a walkable address range.
pub struct ObjectWalk<'h> {
    model: ObjectModel<'h>,
    cursor: usize,
    end: usize,
}

impl Iterator for ObjectWalk<'_> {
    type Item = ObjectRef;

    fn next(&mut self) -> Option<ObjectRef> {
        if self.cursor >= self.end {
            return None;
        }
        let object = ObjectRef::from_addr(self.cursor)?;
        let size = self.model.size_in_words(object);
        debug_assert!(size >= MIN_OBJECT_WORDS, "corrupt object at {object:?}");
        self.cursor += size.max(MIN_OBJECT_WORDS) * WORD_SIZE;
        Some(object)
    }
}
