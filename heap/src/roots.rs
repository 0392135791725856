//! Root enumeration shared by marking, evacuation, fixup, backout and
//! verification. Each pass supplies a [`RootVisitor`]; the walk itself is
//! the same for all of them.

use object::{ClassDescriptor, ObjectRef, Slot};

use crate::Heap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    Jni,
    Class,
    Stack,
    StringTable,
    Finalizable,
}

impl RootKind {
    pub const COUNT: usize = 5;
    pub const ALL: [Self; Self::COUNT] = [
        Self::Jni,
        Self::Class,
        Self::Stack,
        Self::StringTable,
        Self::Finalizable,
    ];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Reference slots owned by the runtime outside the heap.
///
/// Class statics, constant pools, class objects, class loaders and the
/// collector's own queue heads are walked by [`RootWalker`] and need not be
/// reported here.
pub trait RootProvider: Sync {
    fn visit_roots<'a>(&'a self, kind: RootKind, visit: &mut dyn FnMut(&'a Slot));
}

/// What a root pass does with each slot. Class and loader visits default to
/// visiting the slots they own.
pub trait RootVisitor<'a> {
    fn visit_slot(&mut self, slot: &'a Slot, kind: RootKind);

    fn visit_class(&mut self, class: &'a ClassDescriptor) {
        for slot in class.statics().iter().chain(class.constant_pool()) {
            self.visit_slot(slot, RootKind::Class);
        }
        self.visit_slot(class.class_object(), RootKind::Class);
    }

    fn visit_class_loader(&mut self, loader: &'a Slot) {
        self.visit_slot(loader, RootKind::Class);
    }
}

impl<'a, F: FnMut(&'a Slot, RootKind)> RootVisitor<'a> for F {
    fn visit_slot(&mut self, slot: &'a Slot, kind: RootKind) {
        self(slot, kind)
    }
}

pub struct RootWalker<'a> {
    heap: &'a Heap,
    provider: &'a dyn RootProvider,
}

impl<'a> RootWalker<'a> {
    pub fn new(heap: &'a Heap, provider: &'a dyn RootProvider) -> Self {
        Self { heap, provider }
    }

    pub fn walk_kind(&self, kind: RootKind, visitor: &mut dyn RootVisitor<'a>) {
        match kind {
            RootKind::Class => {
                for class in self.heap.classes().iter() {
                    visitor.visit_class(class);
                }
                for loader in self.heap.classes().class_loaders() {
                    visitor.visit_class_loader(loader);
                }
            }
            RootKind::Finalizable => {
                for slot in self.heap.queues().slots() {
                    visitor.visit_slot(slot, kind);
                }
            }
            _ => {}
        }
        self.provider
            .visit_roots(kind, &mut |slot| visitor.visit_slot(slot, kind));
    }

    pub fn walk(&self, visitor: &mut dyn RootVisitor<'a>) {
        for kind in RootKind::ALL {
            self.walk_kind(kind, visitor);
        }
    }

    /// Every root slot, for passes that split roots across workers.
    pub fn collect_slots(&self) -> Vec<&'a Slot> {
        let mut slots = Vec::new();
        self.walk(&mut |slot: &'a Slot, _: RootKind| slots.push(slot));
        slots
    }

    /// Non-null root targets.
    pub fn collect_targets(&self) -> Vec<ObjectRef> {
        let mut targets = Vec::new();
        self.walk(&mut |slot: &'a Slot, _: RootKind| targets.extend(slot.load()));
        targets
    }
}

/// Fixed-capacity root table usable as a [`RootProvider`].
#[derive(Debug)]
pub struct RootSet {
    slots: [Box<[Slot]>; RootKind::COUNT],
}

impl RootSet {
    pub fn new(per_kind: usize) -> Self {
        Self {
            slots: std::array::from_fn(|_| (0..per_kind).map(|_| Slot::null()).collect()),
        }
    }

    #[inline]
    pub fn slot(&self, kind: RootKind, index: usize) -> &Slot {
        &self.slots[kind.index()][index]
    }

    pub fn capacity(&self) -> usize {
        self.slots[0].len()
    }

    pub fn clear(&self) {
        for slot in self.slots.iter().flat_map(|s| s.iter()) {
            slot.store(None);
        }
    }
}

impl RootProvider for RootSet {
    fn visit_roots<'a>(&'a self, kind: RootKind, visit: &mut dyn FnMut(&'a Slot)) {
        for slot in self.slots[kind.index()].iter() {
            visit(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{small_heap, small_settings};
    use object::{ClassBuilder, ClassTable};

    #[test]
    fn walker_reports_class_slots_and_queue_heads() {
        let mut classes = ClassTable::new();
        classes.register(ClassBuilder::mixed("Config").statics(2).constant_pool(1));
        classes.add_class_loader();
        let heap = small_heap(classes, small_settings());
        let roots = RootSet::new(3);

        let mut counts = [0usize; RootKind::COUNT];
        RootWalker::new(&heap, &roots).walk(&mut |_: &Slot, kind: RootKind| counts[kind.index()] += 1);

        let class_slots: usize = heap
            .classes()
            .iter()
            .map(|c| c.statics().len() + c.constant_pool().len() + 1)
            .sum::<usize>()
            + 1;
        assert_eq!(counts[RootKind::Class.index()], class_slots + 3, "class slots plus provided ones");
        assert_eq!(counts[RootKind::Finalizable.index()], 2 + 3, "queue heads come first");
        assert_eq!(counts[RootKind::Jni.index()], 3);
    }
}
