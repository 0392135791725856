use object::{ObjectCategory, ObjectRef};

use crate::{Heap, NO_REGION};

/// Worker-private staging chain for one category.
///
/// Objects are linked through their list-link words as they are added; a
/// flush publishes the whole chain to one list slot of the region with a
/// single CAS. Successive flushes rotate through the region's slots.
#[derive(Debug)]
pub struct ObjectBuffer {
    category: ObjectCategory,
    max: usize,
    head: Option<ObjectRef>,
    tail: Option<ObjectRef>,
    count: usize,
    region: usize,
    list_index: usize,
}

impl ObjectBuffer {
    pub fn new(category: ObjectCategory, max: usize, first_slot: usize) -> Self {
        assert!(max > 0, "object buffer needs capacity");
        Self {
            category,
            max,
            head: None,
            tail: None,
            count: 0,
            region: NO_REGION,
            list_index: first_slot,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add(&mut self, heap: &Heap, object: ObjectRef) {
        let region = match heap.regions().index_of(object.addr()) {
            Some(index) => index,
            None => panic!("{object:?} is outside the heap"),
        };
        if region != self.region {
            self.flush(heap);
            self.region = region;
        }

        let model = heap.model();
        let link = match model.list_link_addr(object) {
            Some(addr) => addr,
            None => panic!("{object:?} has no list link"),
        };
        assert_eq!(heap.memory().load(link), 0, "{object:?} is already linked");
        let next = self.head.unwrap_or(object);
        heap.memory().store(link, next.addr() as u64);
        self.head = Some(object);
        self.tail.get_or_insert(object);
        self.count += 1;

        if self.count == self.max {
            self.flush(heap);
        }
    }

    /// Publishes the chain (if any) and empties the buffer.
    pub fn flush(&mut self, heap: &Heap) {
        if let (Some(head), Some(tail)) = (self.head, self.tail) {
            let region = heap.regions().get(self.region);
            region
                .ext
                .lists
                .slot(self.category, self.list_index)
                .add_all(&heap.model(), head, tail);
            log::trace!(
                "flushed {} {:?} objects into region {} slot {}",
                self.count,
                self.category,
                self.region,
                self.list_index
            );
            self.list_index = (self.list_index + 1) % heap.settings().object_list_count;
        }
        self.reset();
    }

    /// Drops the chain without publishing it.
    pub fn reset(&mut self) {
        self.head = None;
        self.tail = None;
        self.count = 0;
        self.region = NO_REGION;
    }
}

/// One buffer per category, owned by a single collector thread.
#[derive(Debug)]
pub struct CategoryBuffers {
    buffers: [ObjectBuffer; ObjectCategory::COUNT],
}

impl CategoryBuffers {
    pub fn new(heap: &Heap, worker: usize) -> Self {
        let max = heap.settings().object_buffer_size;
        let first_slot = worker % heap.settings().object_list_count;
        Self {
            buffers: ObjectCategory::ALL.map(|category| ObjectBuffer::new(category, max, first_slot)),
        }
    }

    #[inline]
    pub fn add(&mut self, heap: &Heap, category: ObjectCategory, object: ObjectRef) {
        self.buffers[category.index()].add(heap, object);
    }

    pub fn flush_all(&mut self, heap: &Heap) {
        for buffer in &mut self.buffers {
            buffer.flush(heap);
        }
    }

    pub fn reset_all(&mut self) {
        for buffer in &mut self.buffers {
            buffer.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeapSettings;
    use crate::test_support::{allocate_unlisted, small_heap, small_settings};
    use object::{ClassBuilder, ClassTable};

    #[test]
    fn buffer_flushes_when_full_and_rotates_slots() {
        let mut classes = ClassTable::new();
        let lock = classes.register(ClassBuilder::ownable_synchronizer("Lock").data(1));
        let heap = small_heap(
            classes,
            HeapSettings {
                object_buffer_size: 3,
                object_list_count: 2,
                ..small_settings()
            },
        );

        let objects: Vec<_> = (0..7).map(|_| allocate_unlisted(&heap, lock, 0)).collect();
        let region = heap.regions().region_of(objects[0].addr()).unwrap();
        let model = heap.model();

        let mut buffer = ObjectBuffer::new(ObjectCategory::OwnableSynchronizer, 3, 0);
        for &o in &objects {
            buffer.add(&heap, o);
        }
        assert_eq!(buffer.len(), 1, "two full flushes happened");
        let lists = region.ext.lists.slots(ObjectCategory::OwnableSynchronizer);
        assert_eq!(lists[0].entries(&model).len(), 3);
        assert_eq!(lists[1].entries(&model).len(), 3);

        buffer.flush(&heap);
        assert!(buffer.is_empty());
        let total: usize = lists.iter().map(|l| l.entries(&model).len()).sum();
        assert_eq!(total, 7);
        assert_eq!(lists[0].entries(&model).len(), 4, "third flush wraps to slot 0");
    }
}
