use crate::Slot;

/// Every object, fillers included, spans at least this many words.
pub const MIN_OBJECT_WORDS: usize = 2;
/// Word index of the element count in indexable objects.
pub const ARRAY_LENGTH_INDEX: usize = 1;
/// Word index of the first element in indexable objects.
pub const ARRAY_DATA_INDEX: usize = 2;
/// Word index of the total size (in words) of a filler object.
pub const FILLER_SIZE_INDEX: usize = 1;

/// Index into the [`ClassTable`], stored in every normal header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Soft,
    Weak,
    Phantom,
}

/// How the collector enumerates the reference-valued words of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Mixed,
    PointerArray,
    PrimitiveArray,
    Reference(ReferenceKind),
    OwnableSynchronizer,
    Continuation,
    /// Dead space kept walkable; never reachable.
    Filler,
}

impl ScanType {
    #[inline]
    pub const fn is_indexable(self) -> bool {
        matches!(self, Self::PointerArray | Self::PrimitiveArray | Self::Filler)
    }
}

/// Auxiliary object categories tracked per region in Object Lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectCategory {
    Finalizable = 0,
    OwnableSynchronizer,
    Continuation,
    Reference,
}

impl ObjectCategory {
    pub const COUNT: usize = Self::Reference as usize + 1;
    pub const ALL: [Self; Self::COUNT] = [
        Self::Finalizable,
        Self::OwnableSynchronizer,
        Self::Continuation,
        Self::Reference,
    ];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Values of the state word of a reference object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ReferenceState {
    Initial = 0,
    Cleared = 1,
    Enqueued = 2,
}

impl ReferenceState {
    pub fn from_word(word: u64) -> Self {
        match word {
            1 => Self::Cleared,
            2 => Self::Enqueued,
            _ => Self::Initial,
        }
    }
}

/// Word indices of the special fields of a reference object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceLayout {
    pub kind: ReferenceKind,
    pub referent: usize,
    pub queue_link: usize,
    pub state: usize,
}

/// Shape of one class of heap objects plus its out-of-heap roots.
#[derive(Debug)]
pub struct ClassDescriptor {
    id: ClassId,
    name: String,
    scan_type: ScanType,
    instance_words: usize,
    reference_offsets: Vec<usize>,
    finalize_link: Option<usize>,
    list_link: Option<usize>,
    reference: Option<ReferenceLayout>,
    statics: Box<[Slot]>,
    constant_pool: Box<[Slot]>,
    class_object: Slot,
}

impl ClassDescriptor {
    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn scan_type(&self) -> ScanType {
        self.scan_type
    }

    #[inline(always)]
    pub fn is_indexable(&self) -> bool {
        self.scan_type.is_indexable()
    }

    /// Words of a non-indexable instance, header included. For indexable
    /// classes this is the fixed prefix before the elements.
    #[inline(always)]
    pub fn instance_words(&self) -> usize {
        self.instance_words
    }

    /// Strongly traced reference words of a non-indexable instance.
    pub fn reference_offsets(&self) -> &[usize] {
        &self.reference_offsets
    }

    pub fn finalize_link(&self) -> Option<usize> {
        self.finalize_link
    }

    /// Hidden word chaining an instance into its category's Object List.
    pub fn list_link(&self) -> Option<usize> {
        self.list_link
    }

    pub fn reference_layout(&self) -> Option<ReferenceLayout> {
        self.reference
    }

    pub fn is_finalizable(&self) -> bool {
        self.finalize_link.is_some()
    }

    pub fn category(&self) -> Option<ObjectCategory> {
        match self.scan_type {
            ScanType::Reference(_) => Some(ObjectCategory::Reference),
            ScanType::OwnableSynchronizer => Some(ObjectCategory::OwnableSynchronizer),
            ScanType::Continuation => Some(ObjectCategory::Continuation),
            _ if self.is_finalizable() => Some(ObjectCategory::Finalizable),
            _ => None,
        }
    }

    pub fn statics(&self) -> &[Slot] {
        &self.statics
    }

    pub fn constant_pool(&self) -> &[Slot] {
        &self.constant_pool
    }

    pub fn class_object(&self) -> &Slot {
        &self.class_object
    }
}

/// Builder for [`ClassDescriptor`]. Hidden words (finalize link, list link)
/// are laid out after the declared fields.
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    name: String,
    scan_type: ScanType,
    reference_fields: usize,
    data_fields: usize,
    finalizable: bool,
    statics: usize,
    constant_pool: usize,
}

impl ClassBuilder {
    fn with_scan_type(name: &str, scan_type: ScanType) -> Self {
        Self {
            name: name.to_owned(),
            scan_type,
            reference_fields: 0,
            data_fields: 0,
            finalizable: false,
            statics: 0,
            constant_pool: 0,
        }
    }

    pub fn mixed(name: &str) -> Self {
        Self::with_scan_type(name, ScanType::Mixed)
    }

    pub fn pointer_array(name: &str) -> Self {
        Self::with_scan_type(name, ScanType::PointerArray)
    }

    pub fn primitive_array(name: &str) -> Self {
        Self::with_scan_type(name, ScanType::PrimitiveArray)
    }

    /// Reference objects start with referent, queue link and state words.
    pub fn reference(name: &str, kind: ReferenceKind) -> Self {
        Self::with_scan_type(name, ScanType::Reference(kind))
    }

    pub fn ownable_synchronizer(name: &str) -> Self {
        Self::with_scan_type(name, ScanType::OwnableSynchronizer)
    }

    pub fn continuation(name: &str) -> Self {
        Self::with_scan_type(name, ScanType::Continuation)
    }

    pub fn references(mut self, count: usize) -> Self {
        self.reference_fields = count;
        self
    }

    pub fn data(mut self, count: usize) -> Self {
        self.data_fields = count;
        self
    }

    pub fn finalizable(mut self) -> Self {
        self.finalizable = true;
        self
    }

    pub fn statics(mut self, count: usize) -> Self {
        self.statics = count;
        self
    }

    pub fn constant_pool(mut self, count: usize) -> Self {
        self.constant_pool = count;
        self
    }

    fn build(self, id: ClassId) -> ClassDescriptor {
        assert!(
            !self.finalizable || self.scan_type == ScanType::Mixed,
            "only mixed classes can be finalizable: {}",
            self.name
        );

        let mut next = 1;
        let mut reference_offsets = Vec::new();
        let mut reference = None;
        let mut finalize_link = None;
        let mut list_link = None;

        let instance_words = if self.scan_type.is_indexable() {
            ARRAY_DATA_INDEX
        } else {
            if let ScanType::Reference(kind) = self.scan_type {
                let layout = ReferenceLayout {
                    kind,
                    referent: 1,
                    queue_link: 2,
                    state: 3,
                };
                reference_offsets.push(layout.queue_link);
                reference = Some(layout);
                next = 4;
            }
            reference_offsets.extend(next..next + self.reference_fields);
            next += self.reference_fields + self.data_fields;
            if self.finalizable {
                reference_offsets.push(next);
                finalize_link = Some(next);
                next += 1;
            }
            if self.finalizable
                || matches!(
                    self.scan_type,
                    ScanType::Reference(_) | ScanType::OwnableSynchronizer | ScanType::Continuation
                )
            {
                list_link = Some(next);
                next += 1;
            }
            next.max(MIN_OBJECT_WORDS)
        };

        ClassDescriptor {
            id,
            name: self.name,
            scan_type: self.scan_type,
            instance_words,
            reference_offsets,
            finalize_link,
            list_link,
            reference,
            statics: (0..self.statics).map(|_| Slot::null()).collect(),
            constant_pool: (0..self.constant_pool).map(|_| Slot::null()).collect(),
            class_object: Slot::null(),
        }
    }
}

/// All classes known to the heap, indexed by [`ClassId`].
///
/// Class 0 is the filler class used to keep swept regions walkable.
#[derive(Debug)]
pub struct ClassTable {
    classes: Vec<ClassDescriptor>,
    loaders: Vec<Slot>,
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassTable {
    pub const FILLER: ClassId = ClassId(0);

    pub fn new() -> Self {
        let filler = ClassBuilder::with_scan_type("<filler>", ScanType::Filler).build(Self::FILLER);
        Self {
            classes: vec![filler],
            loaders: Vec::new(),
        }
    }

    pub fn register(&mut self, builder: ClassBuilder) -> ClassId {
        assert!(self.classes.len() <= u16::MAX as usize, "class table full");
        let id = ClassId(self.classes.len() as u16);
        self.classes.push(builder.build(id));
        id
    }

    /// Adds a class-loader root slot and returns its index.
    pub fn add_class_loader(&mut self) -> usize {
        self.loaders.push(Slot::null());
        self.loaders.len() - 1
    }

    #[inline(always)]
    pub fn get(&self, id: ClassId) -> &ClassDescriptor {
        &self.classes[id.0 as usize]
    }

    pub fn try_get(&self, id: ClassId) -> Option<&ClassDescriptor> {
        self.classes.get(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.classes.iter()
    }

    pub fn class_loaders(&self) -> &[Slot] {
        &self.loaders
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_layout_places_hidden_words_last() {
        let mut table = ClassTable::new();
        let id = table.register(ClassBuilder::mixed("Node").references(2).data(1).finalizable());
        let class = table.get(id);
        assert_eq!(class.reference_offsets(), &[1, 2, 4]);
        assert_eq!(class.finalize_link(), Some(4));
        assert_eq!(class.list_link(), Some(5));
        assert_eq!(class.instance_words(), 6);
        assert_eq!(class.category(), Some(ObjectCategory::Finalizable));
    }

    #[test]
    fn reference_layout() {
        let mut table = ClassTable::new();
        let id = table.register(ClassBuilder::reference("Weak", ReferenceKind::Weak).references(1));
        let class = table.get(id);
        let layout = class.reference_layout().unwrap();
        assert_eq!((layout.referent, layout.queue_link, layout.state), (1, 2, 3));
        assert_eq!(class.reference_offsets(), &[2, 4], "referent is not strongly traced");
        assert_eq!(class.list_link(), Some(5));
        assert_eq!(class.category(), Some(ObjectCategory::Reference));
    }

    #[test]
    fn tiny_classes_are_padded() {
        let mut table = ClassTable::new();
        let id = table.register(ClassBuilder::mixed("Empty"));
        assert_eq!(table.get(id).instance_words(), MIN_OBJECT_WORDS);
        assert_eq!(table.get(id).category(), None);
        assert!(table.get(ClassTable::FILLER).is_indexable());
    }
}
