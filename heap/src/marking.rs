//! Parallel tracing over the mark map.

use object::{ObjectCategory, ObjectRef};

use crate::{CategoryBuffers, Heap, Liveness, ReferentPolicy, WorkPool, WorkerEnv};

/// Shared state of one marking pass.
pub struct Marker<'h> {
    heap: &'h Heap,
    pool: WorkPool<ObjectRef>,
}

impl<'h> Marker<'h> {
    pub fn new(heap: &'h Heap, threads: usize) -> Self {
        Self {
            heap,
            pool: WorkPool::new(threads),
        }
    }

    /// Marks root targets and queues the newly marked ones for scanning.
    pub fn mark_roots(&self, targets: impl IntoIterator<Item = ObjectRef>) {
        let mark_map = self.heap.mark_map();
        self.pool
            .push_all(targets.into_iter().filter(|o| mark_map.set_bit(o.addr())));
    }

    /// Queues objects that are already marked but whose fields must be
    /// scanned again.
    pub fn rescan(&self, objects: impl IntoIterator<Item = ObjectRef>) {
        self.pool.push_all(objects);
    }

    /// Drains the pool on one worker. Returns the bytes this worker scanned.
    pub fn drain(&self, env: &WorkerEnv<'_>) -> usize {
        let mut worker = MarkWorker::new(self.heap, env.id);
        let mut local = Vec::new();
        self.pool
            .drain(&mut local, |object, local| worker.scan(object, local));
        worker.finish()
    }

    pub fn reset(&self, threads: usize) {
        self.pool.reset(threads);
    }
}

/// Thread-local half of marking.
pub struct MarkWorker<'h> {
    heap: &'h Heap,
    buffers: CategoryBuffers,
    fields: Vec<usize>,
    scanned_bytes: usize,
}

impl<'h> MarkWorker<'h> {
    pub fn new(heap: &'h Heap, worker: usize) -> Self {
        Self {
            heap,
            buffers: CategoryBuffers::new(heap, worker),
            fields: Vec::new(),
            scanned_bytes: 0,
        }
    }

    /// Scans a marked object, marking and queueing what it references.
    pub fn scan(&mut self, object: ObjectRef, local: &mut Vec<ObjectRef>) {
        let model = self.heap.model();
        let memory = self.heap.memory();
        if model.is_filler(object) {
            return;
        }
        self.list_if_unlisted(object);

        self.fields.clear();
        model.for_each_reference_slot(object, ReferentPolicy::Discover, |addr| self.fields.push(addr));
        for &addr in &self.fields {
            if let Some(target) = memory.load_ref(addr)
                && self.heap.mark_map().set_bit(target.addr())
            {
                local.push(target);
            }
        }
        self.scanned_bytes += model.size_in_bytes(object);
    }

    // Objects drop off their lists when found dead; one revived by
    // finalization is listed again here.
    fn list_if_unlisted(&mut self, object: ObjectRef) {
        let model = self.heap.model();
        let Some(category) = model.class_of(object).category() else {
            return;
        };
        if category == ObjectCategory::Finalizable {
            return;
        }
        if let Some(link) = model.list_link_addr(object)
            && self.heap.memory().load(link) == 0
        {
            self.buffers.add(self.heap, category, object);
        }
    }

    /// Publishes buffered list entries; returns the scanned byte count.
    pub fn finish(&mut self) -> usize {
        self.buffers.flush_all(self.heap);
        std::mem::take(&mut self.scanned_bytes)
    }
}

/// Liveness by mark bit, used for reference processing after marking.
pub struct MarkLiveness<'h> {
    heap: &'h Heap,
    worker: MarkWorker<'h>,
    local: Vec<ObjectRef>,
}

impl<'h> MarkLiveness<'h> {
    pub fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            worker: MarkWorker::new(heap, 0),
            local: Vec::new(),
        }
    }

    pub fn finish(&mut self) -> usize {
        self.worker.finish()
    }
}

impl Liveness for MarkLiveness<'_> {
    fn is_collected(&self, object: ObjectRef) -> bool {
        self.heap.mark_map().covers(object.addr())
    }

    fn live_location(&self, object: ObjectRef) -> Option<ObjectRef> {
        self.heap.mark_map().is_bit_set(object.addr()).then_some(object)
    }

    fn keep_alive(&mut self, object: ObjectRef) -> ObjectRef {
        if self.heap.mark_map().set_bit(object.addr()) {
            self.local.push(object);
            while let Some(next) = self.local.pop() {
                self.worker.scan(next, &mut self.local);
            }
        }
        object
    }

    fn record_write(&mut self, object: ObjectRef, value: Option<ObjectRef>) {
        if let Some(value) = value {
            self.heap.remember_edge(object, value);
        }
    }
}
