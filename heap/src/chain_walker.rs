//! Diagnostic walk of the reference graph, reporting every edge once per
//! reachable object.
//!
//! The walker keeps its own mark map so it can run between collections
//! without disturbing collector state. Its work queue is bounded; an object
//! that does not fit is flagged with the overflow bit pair and picked up
//! again by a heap walk once the queue drains.

use object::{ObjectRef, WORD_SIZE};

use crate::{Heap, MarkMap, ReferentPolicy, RegionKind, RootKind, RootProvider, RootWalker};

/// Where an edge starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Referrer {
    Root(RootKind),
    Object { object: ObjectRef, field: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChainSummary {
    pub objects: usize,
    pub edges: usize,
    /// Objects that missed the queue and were found by a heap walk.
    pub overflowed: usize,
    pub heap_walks: usize,
}

pub struct ReferenceChainWalker<'h> {
    heap: &'h Heap,
    marks: MarkMap,
    queue: Vec<ObjectRef>,
    capacity: usize,
    summary: ChainSummary,
}

impl<'h> ReferenceChainWalker<'h> {
    pub fn new(heap: &'h Heap, queue_capacity: usize) -> Self {
        assert!(queue_capacity > 0, "chain walker needs a work queue");
        let memory = heap.memory();
        Self {
            heap,
            marks: MarkMap::new(memory.base(), memory.size()),
            queue: Vec::with_capacity(queue_capacity),
            capacity: queue_capacity,
            summary: ChainSummary::default(),
        }
    }

    /// Walks everything reachable from `roots`, calling `visit` for each
    /// edge. Targets are reported once per referrer; each object is scanned
    /// once.
    pub fn walk(
        mut self,
        roots: &dyn RootProvider,
        visit: &mut dyn FnMut(Referrer, ObjectRef),
    ) -> ChainSummary {
        assert!(self.heap.is_walkable(), "reference chains are walked on a walkable heap");
        for (kind, target) in self.root_edges(roots) {
            visit(Referrer::Root(kind), target);
            self.summary.edges += 1;
            self.reach(target);
        }

        loop {
            self.drain(visit);
            if !self.rescan_overflow() {
                break;
            }
        }
        log::debug!(
            "reference chains: {} objects, {} edges, {} overflowed",
            self.summary.objects,
            self.summary.edges,
            self.summary.overflowed
        );
        self.summary
    }

    fn root_edges(&self, roots: &dyn RootProvider) -> Vec<(RootKind, ObjectRef)> {
        let mut edges = Vec::new();
        RootWalker::new(self.heap, roots).walk(&mut |slot: &object::Slot, kind: RootKind| {
            if let Some(target) = slot.load() {
                edges.push((kind, target));
            }
        });
        edges
    }

    fn reach(&mut self, object: ObjectRef) {
        if !self.marks.set_bit(object.addr()) {
            return;
        }
        self.summary.objects += 1;
        if self.queue.len() < self.capacity {
            self.queue.push(object);
        } else {
            self.marks.set_overflow(object.addr());
            self.summary.overflowed += 1;
        }
    }

    fn drain(&mut self, visit: &mut dyn FnMut(Referrer, ObjectRef)) {
        let heap = self.heap;
        let memory = heap.memory();
        let mut fields = Vec::new();
        while let Some(object) = self.queue.pop() {
            fields.clear();
            heap.model()
                .for_each_reference_slot(object, ReferentPolicy::All, |addr| fields.push(addr));
            for &field in &fields {
                if let Some(target) = memory.load_ref(field) {
                    let index = (field - object.addr()) / WORD_SIZE;
                    visit(Referrer::Object { object, field: index }, target);
                    self.summary.edges += 1;
                    self.reach(target);
                }
            }
        }
    }

    /// Requeues overflowed objects found by a heap walk. Returns `false`
    /// when none were left.
    fn rescan_overflow(&mut self) -> bool {
        let heap = self.heap;
        let model = heap.model();
        self.summary.heap_walks += 1;
        let mut found = false;
        for region in heap.regions().iter().filter(|r| r.kind() != RegionKind::Free) {
            for object in heap.objects_in_region(region.index) {
                if model.is_filler(object) || !self.marks.is_overflow(object.addr()) {
                    continue;
                }
                if self.queue.len() == self.capacity {
                    // Stays flagged for the next walk.
                    return true;
                }
                self.marks.clear_overflow(object.addr());
                self.queue.push(object);
                found = true;
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RootSet;
    use crate::test_support::{small_heap, small_settings};
    use object::{ClassBuilder, ClassTable};

    #[test]
    fn every_edge_is_reported_despite_a_tiny_queue() {
        let mut classes = ClassTable::new();
        let node = classes.register(ClassBuilder::mixed("Node").references(2));
        let heap = small_heap(classes, small_settings());

        // Complete binary tree of 31 nodes plus one back edge to the root.
        let nodes: Vec<_> = (0..31).map(|_| heap.allocate(node, 0).unwrap()).collect();
        for i in 0..15 {
            heap.write_reference(nodes[i], 1, Some(nodes[2 * i + 1]));
            heap.write_reference(nodes[i], 2, Some(nodes[2 * i + 2]));
        }
        heap.write_reference(nodes[30], 1, Some(nodes[0]));
        for _ in 0..10 {
            heap.allocate(node, 0).unwrap();
        }
        let roots = RootSet::new(1);
        roots.slot(RootKind::Stack, 0).store(Some(nodes[0]));

        let mut seen = Vec::new();
        let summary = ReferenceChainWalker::new(&heap, 2).walk(&roots, &mut |from: Referrer, to: ObjectRef| seen.push((from, to)));

        assert_eq!(summary.objects, 31, "garbage is never reached");
        assert_eq!(summary.edges, 32, "root edge, tree edges and the back edge");
        assert_eq!(seen.len(), 32);
        assert!(summary.overflowed > 0, "a queue of two must overflow");
        assert!(summary.heap_walks > 1);
        assert!(seen.contains(&(Referrer::Object { object: nodes[30], field: 1 }, nodes[0])));
        assert_eq!(seen[0], (Referrer::Root(RootKind::Stack), nodes[0]));
        for &n in &nodes {
            assert!(!heap.mark_map().is_bit_set(n.addr()), "collector marks are untouched");
        }
    }
}
