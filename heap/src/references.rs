//! Reference clearing and finalization, shared by the scavenger and the
//! global collector. Each collector supplies its notion of liveness.

use object::{HeaderFlags, ObjectRef, ReferenceKind, ReferenceState, ScanType};

use crate::Heap;

pub trait Liveness {
    /// Whether this collection can reclaim `object` at all.
    fn is_collected(&self, object: ObjectRef) -> bool;

    /// Current location of a collected object that has been found live.
    fn live_location(&self, object: ObjectRef) -> Option<ObjectRef>;

    /// Makes `object` and everything it reaches live; returns its location.
    fn keep_alive(&mut self, object: ObjectRef) -> ObjectRef;

    /// Called after the collector wrote `value` into `object`.
    fn record_write(&mut self, object: ObjectRef, value: Option<ObjectRef>);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceSummary {
    pub cleared: usize,
    pub finalizable: usize,
}

pub struct ReferenceProcessor<'h> {
    heap: &'h Heap,
    summary: ReferenceSummary,
}

impl<'h> ReferenceProcessor<'h> {
    pub fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            summary: ReferenceSummary::default(),
        }
    }

    pub fn summary(&self) -> ReferenceSummary {
        self.summary
    }

    /// Clears or updates the referents of `references` of the given kind.
    ///
    /// Soft referents are traced strongly and only need their field brought
    /// up to date.
    pub fn process_references(
        &mut self,
        liveness: &mut impl Liveness,
        references: &[ObjectRef],
        kind: ReferenceKind,
    ) {
        let memory = self.heap.memory();
        let model = self.heap.model();
        for &reference in references {
            let class = model.class_of(reference);
            let (ScanType::Reference(actual), Some(layout)) = (class.scan_type(), class.reference_layout())
            else {
                continue;
            };
            if actual != kind {
                continue;
            }
            let state = ReferenceState::from_word(memory.load(reference.word_addr(layout.state)));
            if state != ReferenceState::Initial {
                continue;
            }
            let Some(referent) = memory.load_ref(reference.word_addr(layout.referent)) else {
                continue;
            };
            if !liveness.is_collected(referent) {
                continue;
            }
            match liveness.live_location(referent) {
                Some(location) => {
                    if location != referent {
                        memory.store_ref(reference.word_addr(layout.referent), Some(location));
                        liveness.record_write(reference, Some(location));
                    }
                }
                None if kind == ReferenceKind::Soft => {
                    let location = liveness.keep_alive(referent);
                    memory.store_ref(reference.word_addr(layout.referent), Some(location));
                    liveness.record_write(reference, Some(location));
                }
                None => {
                    log::trace!("clearing {kind:?} reference {reference:?} to {referent:?}");
                    memory.store_ref(reference.word_addr(layout.referent), None);
                    memory.store(reference.word_addr(layout.state), ReferenceState::Enqueued as u64);
                    let next = self.heap.queues().pending_references.load();
                    self.heap.queues().enqueue_reference(model, reference);
                    liveness.record_write(reference, next);
                    self.summary.cleared += 1;
                }
            }
        }
    }

    /// Rescues an unreachable finalizable object onto the finalizable
    /// queue. Returns `false` when the collector could not keep it alive.
    pub fn rescue_finalizable(&mut self, liveness: &mut impl Liveness, object: ObjectRef) -> bool {
        let memory = self.heap.memory();
        let header = memory.header(object);
        debug_assert!(!header.flags().contains(HeaderFlags::FINALIZED));
        memory.set_header(object, header.with_flags(header.flags() | HeaderFlags::FINALIZED));

        let location = liveness.keep_alive(object);
        if liveness.live_location(object).is_some() {
            let next = self.heap.queues().finalizable.load();
            self.heap.queues().enqueue_finalizable(self.heap.model(), location);
            liveness.record_write(location, next);
            self.summary.finalizable += 1;
            true
        } else {
            memory.set_header(object, header);
            false
        }
    }
}
