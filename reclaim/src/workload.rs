//! Synthetic mutator that churns the heap between collections.

use std::sync::Arc;

use heap::{Collector, GcError, GcResult, Heap, RootKind, RootSet, ScavengeOutcome};
use object::{ClassBuilder, ClassId, ClassTable, ObjectRef, ReferenceKind};

/// Root slots per root kind.
pub const ROOT_SLOTS: usize = 1024;

/// Chains stop growing at this depth so survivors stay bounded.
const MAX_CHAIN_DEPTH: u64 = 8;

#[derive(Debug, Clone, Copy)]
pub struct WorkloadClasses {
    pub node: ClassId,
    pub weak: ClassId,
    pub soft: ClassId,
    pub resource: ClassId,
    pub lock: ClassId,
    pub buffer: ClassId,
}

impl WorkloadClasses {
    pub fn register(table: &mut ClassTable) -> Self {
        Self {
            node: table.register(ClassBuilder::mixed("Node").references(2).data(1)),
            weak: table.register(ClassBuilder::reference("WeakRef", ReferenceKind::Weak)),
            soft: table.register(ClassBuilder::reference("SoftRef", ReferenceKind::Soft)),
            resource: table.register(ClassBuilder::mixed("Resource").data(2).finalizable()),
            lock: table.register(ClassBuilder::ownable_synchronizer("Lock")),
            buffer: table.register(ClassBuilder::primitive_array("Bytes")),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub allocated: usize,
    pub retained: usize,
    pub scavenges: usize,
    pub backouts: usize,
    pub finalized: usize,
    pub references_enqueued: usize,
}

pub struct Workload {
    heap: Arc<Heap>,
    roots: Arc<RootSet>,
    classes: WorkloadClasses,
    survival: f64,
    rng: u64,
}

impl Workload {
    pub fn new(heap: Arc<Heap>, roots: Arc<RootSet>, classes: WorkloadClasses, survival: f64) -> Self {
        Self {
            heap,
            roots,
            classes,
            survival,
            rng: 0x9e37_79b9_7f4a_7c15,
        }
    }

    // xorshift64*
    fn next(&mut self) -> u64 {
        self.rng ^= self.rng >> 12;
        self.rng ^= self.rng << 25;
        self.rng ^= self.rng >> 27;
        self.rng.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn chance(&mut self, p: f64) -> bool {
        (self.next() >> 11) as f64 / (1u64 << 53) as f64 <= p
    }

    /// Allocates `objects` objects, retaining a `survival` fraction of them.
    pub fn run_cycle(&mut self, collector: &Collector, objects: usize) -> GcResult<CycleReport> {
        let mut report = CycleReport::default();
        for i in 0..objects {
            let class = match i % 256 {
                0 => self.classes.lock,
                1 | 129 => self.classes.resource,
                64 => self.classes.weak,
                192 => self.classes.soft,
                n if n % 32 == 7 => self.classes.buffer,
                _ => self.classes.node,
            };
            let length = if class == self.classes.buffer {
                (self.next() % 64) as usize
            } else {
                0
            };
            let object = self.allocate(collector, class, length, &mut report)?;
            report.allocated += 1;

            if class == self.classes.weak || class == self.classes.soft {
                let index = self.slot();
                let target = self.roots.slot(RootKind::Stack, index).load();
                self.heap.write_reference(object, 1, target);
                let index = self.slot();
                self.roots.slot(RootKind::Jni, index).store(Some(object));
            } else if class == self.classes.node && self.chance(self.survival) {
                self.retain(object);
                report.retained += 1;
            } else if class == self.classes.lock && self.chance(self.survival) {
                let index = self.slot();
                self.roots.slot(RootKind::StringTable, index).store(Some(object));
                report.retained += 1;
            }
        }
        report.finalized = self.heap.take_finalizable().len();
        report.references_enqueued = self.heap.take_pending_references().len();
        log::debug!("{report:?}");
        Ok(report)
    }

    fn slot(&mut self) -> usize {
        (self.next() % ROOT_SLOTS as u64) as usize
    }

    /// Stores `object` in a stack slot, sometimes chaining the previous
    /// occupant behind it.
    fn retain(&mut self, object: ObjectRef) {
        let roots = Arc::clone(&self.roots);
        let index = self.slot();
        let slot = roots.slot(RootKind::Stack, index);
        if let Some(previous) = slot.load()
            && self.heap.class_of(previous).id() == self.classes.node
        {
            let depth = self.heap.read_word(previous, 3);
            if depth < MAX_CHAIN_DEPTH && self.chance(0.5) {
                self.heap.write_reference(object, 1, Some(previous));
                self.heap.write_word(object, 3, depth + 1);
            }
        }
        slot.store(Some(object));
    }

    /// Allocates in eden, scavenging when it is full and falling back to a
    /// global collection when the scavenge freed nothing usable.
    fn allocate(
        &mut self,
        collector: &Collector,
        class: ClassId,
        length: usize,
        report: &mut CycleReport,
    ) -> GcResult<ObjectRef> {
        if let Some(object) = self.heap.allocate(class, length) {
            return Ok(object);
        }
        report.scavenges += 1;
        if collector.run_scavenge() == ScavengeOutcome::BackedOut {
            report.backouts += 1;
        }
        if let Some(object) = self.heap.allocate(class, length) {
            return Ok(object);
        }
        collector.run_global_collection();
        self.heap
            .allocate(class, length)
            .ok_or(GcError::OutOfMemory(length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heap::HeapSettings;

    #[test]
    fn cycles_survive_collections() {
        let settings = HeapSettings {
            heap_size: 4 * 1024 * 1024,
            region_size: 64 * 1024,
            eden_regions: 8,
            survivor_regions: 4,
            gc_threads: 2,
            weak_memory_ordering: false,
            ..HeapSettings::default()
        };
        let mut table = ClassTable::new();
        let classes = WorkloadClasses::register(&mut table);
        let heap = Arc::new(Heap::new(settings, table).unwrap());
        let roots = Arc::new(RootSet::new(ROOT_SLOTS));
        let collector = Collector::new(heap.clone(), roots.clone());
        let mut workload = Workload::new(heap.clone(), roots, classes, 0.05);

        for _ in 0..3 {
            let report = workload.run_cycle(&collector, 40_000).unwrap();
            assert_eq!(report.allocated, 40_000);
            assert!(report.scavenges > 0, "eden must fill up");
            collector.run_global_collection();
            collector.verify_heap().unwrap();
        }
        assert!(heap.stats().snapshot().scavenges > 0);
    }
}
