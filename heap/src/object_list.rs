//! Lock-free per-region lists of objects in one auxiliary category.
//!
//! The list node is the object itself: its hidden list-link word holds the
//! next object, its own address when it is the last entry, or `0` when it is
//! on no list. Insertion only prepends, through a CAS on the head.

use std::sync::atomic::{AtomicU64, Ordering};

use object::{ObjectCategory, ObjectRef};

use crate::ObjectModel;

#[inline]
fn link_addr(model: &ObjectModel<'_>, object: ObjectRef) -> usize {
    match model.list_link_addr(object) {
        Some(addr) => addr,
        None => panic!("{object:?} ({}) has no list link", model.class_of(object).name()),
    }
}

pub struct ObjectList {
    head: AtomicU64,
    /// Head saved by `start_processing` / `backup_list` for `backout_list`.
    prior_head: AtomicU64,
}

impl Default for ObjectList {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectList {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
            prior_head: AtomicU64::new(0),
        }
    }

    /// Prepends `object`, which must not be on any list.
    pub fn push(&self, model: &ObjectModel<'_>, object: ObjectRef) {
        let memory = model.memory();
        let link = link_addr(model, object);
        assert_eq!(memory.load(link), 0, "{object:?} is already linked");

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let next = if head == 0 { object.addr() as u64 } else { head };
            memory.store(link, next);
            match self.head.compare_exchange_weak(
                head,
                object.addr() as u64,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Prepends a chain already linked from `head` to `tail`, whose link
    /// must currently mark it as the end of the chain.
    pub fn add_all(&self, model: &ObjectModel<'_>, head: ObjectRef, tail: ObjectRef) {
        let memory = model.memory();
        let link = link_addr(model, tail);
        debug_assert_eq!(memory.load(link), tail.addr() as u64, "chain tail is not terminated");

        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let next = if current == 0 { tail.addr() as u64 } else { current };
            memory.store(link, next);
            match self.head.compare_exchange_weak(
                current,
                head.addr() as u64,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub fn head(&self) -> Option<ObjectRef> {
        ObjectRef::decode(self.head.load(Ordering::Acquire))
    }

    #[inline]
    pub fn prior_head(&self) -> Option<ObjectRef> {
        ObjectRef::decode(self.prior_head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_none()
    }

    /// Empties the list. Entries keep their stale links.
    pub fn reset(&self) {
        self.head.store(0, Ordering::Release);
    }

    /// Empties the list for a region entering collection, keeping the old
    /// chain reachable through [`ObjectList::prior_head`].
    pub fn start_processing(&self) {
        let head = self.head.swap(0, Ordering::AcqRel);
        self.prior_head.store(head, Ordering::Release);
    }

    /// Remembers the current chain of a region that is not being collected.
    pub fn backup_list(&self) {
        self.prior_head
            .store(self.head.load(Ordering::Acquire), Ordering::Release);
    }

    /// Reinstates the chain saved by `start_processing` or `backup_list`.
    pub fn backout_list(&self) {
        self.head
            .store(self.prior_head.load(Ordering::Acquire), Ordering::Release);
    }

    pub fn iter<'a>(&self, model: &'a ObjectModel<'a>) -> ObjectListIter<impl Fn(ObjectRef) -> usize + 'a> {
        let memory = model.memory();
        ObjectListIter::new(self.head(), move |object| {
            memory.load(link_addr(model, object)) as usize
        })
    }

    /// Entries as a vector; the list must not change meanwhile.
    pub fn entries(&self, model: &ObjectModel<'_>) -> Vec<ObjectRef> {
        self.iter(model).collect()
    }

    /// Rebuilds the chain from the entries `keep` accepts. Returns the number
    /// of entries dropped.
    pub fn retain(&self, model: &ObjectModel<'_>, mut keep: impl FnMut(ObjectRef) -> bool) -> usize {
        let entries = self.entries(model);
        self.reset();
        let mut dropped = 0;
        for object in entries {
            model.memory().store(link_addr(model, object), 0);
            if keep(object) {
                self.push(model, object);
            } else {
                dropped += 1;
            }
        }
        dropped
    }
}

impl std::fmt::Debug for ObjectList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectList")
            .field("head", &self.head())
            .field("prior_head", &self.prior_head())
            .finish()
    }
}

/// Follows list links from a head. `next_of` returns the raw link word.
pub struct ObjectListIter<F> {
    current: Option<ObjectRef>,
    next_of: F,
}

impl<F: Fn(ObjectRef) -> usize> ObjectListIter<F> {
    pub fn new(head: Option<ObjectRef>, next_of: F) -> Self {
        Self { current: head, next_of }
    }
}

impl<F: Fn(ObjectRef) -> usize> Iterator for ObjectListIter<F> {
    type Item = ObjectRef;

    fn next(&mut self) -> Option<ObjectRef> {
        let object = self.current?;
        let next = (self.next_of)(object);
        self.current = if next == object.addr() {
            None
        } else {
            ObjectRef::from_addr(next)
        };
        Some(object)
    }
}

/// The N list slots of every category for one region.
#[derive(Debug)]
pub struct CategoryLists {
    lists: [Box<[ObjectList]>; ObjectCategory::COUNT],
}

impl CategoryLists {
    pub fn new(slots: usize) -> Self {
        Self {
            lists: std::array::from_fn(|_| (0..slots).map(|_| ObjectList::new()).collect()),
        }
    }

    #[inline]
    pub fn slots(&self, category: ObjectCategory) -> &[ObjectList] {
        &self.lists[category.index()]
    }

    #[inline]
    pub fn slot(&self, category: ObjectCategory, index: usize) -> &ObjectList {
        let slots = self.slots(category);
        &slots[index % slots.len()]
    }

    fn all(&self) -> impl Iterator<Item = &ObjectList> {
        self.lists.iter().flat_map(|slots| slots.iter())
    }

    pub fn start_processing(&self) {
        self.all().for_each(ObjectList::start_processing);
    }

    pub fn backup_lists(&self) {
        self.all().for_each(ObjectList::backup_list);
    }

    pub fn backout_lists(&self) {
        self.all().for_each(ObjectList::backout_list);
    }

    pub fn reset(&self) {
        self.all().for_each(ObjectList::reset);
    }

    pub fn entries(&self, model: &ObjectModel<'_>, category: ObjectCategory) -> Vec<ObjectRef> {
        self.slots(category)
            .iter()
            .flat_map(|list| list.entries(model))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.all().all(ObjectList::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeapMemory;
    use object::{ClassBuilder, ClassId, ClassTable, WORD_SIZE};
    use std::collections::HashSet;

    fn setup() -> (HeapMemory, ClassTable, ClassId) {
        let memory = HeapMemory::new(256 * 1024).unwrap();
        let mut classes = ClassTable::new();
        let id = classes.register(ClassBuilder::ownable_synchronizer("Lock").data(1));
        (memory, classes, id)
    }

    fn make_objects(model: &ObjectModel<'_>, class: ClassId, count: usize) -> Vec<ObjectRef> {
        let words = model.classes().get(class).instance_words();
        (0..count)
            .map(|i| {
                let obj = ObjectRef::from_addr(model.memory().base() + i * words * WORD_SIZE).unwrap();
                model.initialize(obj, class, 0, 0);
                obj
            })
            .collect()
    }

    #[test]
    fn push_prepends_and_terminates_with_self() {
        let (memory, classes, class) = setup();
        let model = ObjectModel::new(&memory, &classes);
        let objects = make_objects(&model, class, 3);
        let list = ObjectList::new();
        for &o in &objects {
            list.push(&model, o);
        }
        let seen = list.entries(&model);
        assert_eq!(seen, vec![objects[2], objects[1], objects[0]]);
        let last_link = model.list_link_addr(objects[0]).unwrap();
        assert_eq!(memory.load(last_link), objects[0].addr() as u64);
    }

    #[test]
    fn concurrent_push_and_add_all_keep_every_object_once() {
        let (memory, classes, class) = setup();
        let model = ObjectModel::new(&memory, &classes);
        let objects = make_objects(&model, class, 800);
        let list = ObjectList::new();

        std::thread::scope(|s| {
            for chunk in objects.chunks(100) {
                let model = &model;
                let list = &list;
                s.spawn(move || {
                    let (singles, chained) = chunk.split_at(50);
                    for &o in singles {
                        list.push(model, o);
                    }
                    // Build a private chain the way an object buffer does.
                    let tail = chained[0];
                    let mut head = tail;
                    memory_link(model, tail, tail);
                    for &o in &chained[1..] {
                        memory_link(model, o, head);
                        head = o;
                    }
                    list.add_all(model, head, tail);
                });
            }
        });

        let seen = list.entries(&model);
        assert_eq!(seen.len(), objects.len(), "no lost updates");
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(unique.len(), objects.len(), "no duplicates");
        assert!(objects.iter().all(|o| unique.contains(o)));
    }

    fn memory_link(model: &ObjectModel<'_>, object: ObjectRef, next: ObjectRef) {
        model
            .memory()
            .store(model.list_link_addr(object).unwrap(), next.addr() as u64);
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn duplicate_push_is_an_assertion() {
        let (memory, classes, class) = setup();
        let model = ObjectModel::new(&memory, &classes);
        let objects = make_objects(&model, class, 1);
        let list = ObjectList::new();
        list.push(&model, objects[0]);
        list.push(&model, objects[0]);
    }

    #[test]
    fn start_processing_and_backout() {
        let (memory, classes, class) = setup();
        let model = ObjectModel::new(&memory, &classes);
        let objects = make_objects(&model, class, 4);
        let list = ObjectList::new();
        list.push(&model, objects[0]);
        list.push(&model, objects[1]);

        list.start_processing();
        assert!(list.is_empty());
        list.push(&model, objects[2]);
        list.backout_list();
        assert_eq!(list.entries(&model), vec![objects[1], objects[0]]);

        let dropped = list.retain(&model, |o| o != objects[1]);
        assert_eq!(dropped, 1);
        assert_eq!(list.entries(&model), vec![objects[0]]);
        assert_eq!(memory.load(model.list_link_addr(objects[1]).unwrap()), 0, "dropped entry is unlisted");
    }
}
