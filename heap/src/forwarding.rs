//! The claim-then-publish protocol used to move an object exactly once.
//!
//! Memory ordering:
//! - A claim is an `AcqRel` CAS from the normal header to a busy word. Losers
//!   observe busy (or forwarded) and never touch the body.
//! - The claimant copies the body with relaxed stores, then publishes the
//!   forwarding word with `Release`. Readers load headers with `Acquire`, so a
//!   visible forwarding word implies a fully written copy.
//! - Abandoning a claim stores the original header back with `Release`.

use std::sync::atomic::Ordering;

use object::{HeaderWord, ObjectRef};

use crate::HeapMemory;

/// Transient view of a possibly forwarded object's header.
#[derive(Debug, Clone, Copy)]
pub struct ForwardingHeader {
    object: ObjectRef,
    preserved: HeaderWord,
}

impl ForwardingHeader {
    #[inline]
    pub fn read(memory: &HeapMemory, object: ObjectRef) -> Self {
        Self {
            object,
            preserved: memory.header(object),
        }
    }

    #[inline(always)]
    pub fn object(&self) -> ObjectRef {
        self.object
    }

    #[inline(always)]
    pub fn preserved(&self) -> HeaderWord {
        self.preserved
    }

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        self.preserved.is_forwarded()
    }

    #[inline(always)]
    pub fn is_being_copied(&self) -> bool {
        self.preserved.is_busy()
    }

    #[inline(always)]
    pub fn forwarded_object(&self) -> Option<ObjectRef> {
        self.preserved.forwarding_target()
    }

    /// Age the object had before it was forwarded.
    #[inline(always)]
    pub fn preserved_age(&self) -> u8 {
        self.preserved.preserved_age()
    }

    /// Overlap bits of the original header, recovered from the copy since the
    /// forwarding word destroyed them.
    pub fn preserved_overlap(&self, memory: &HeapMemory) -> Option<u32> {
        let copy = self.forwarded_object()?;
        let copied = memory.header(copy);
        copied.is_normal().then(|| copied.overlap())
    }

    /// Writes the preserved overlap back into the current header of the
    /// original object.
    pub fn restore_destroyed_overlap(&self, memory: &HeapMemory, overlap: u32) {
        let current = memory.header(self.object);
        memory.set_header(self.object, current.with_overlap(overlap));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This thread owns the object until it publishes or abandons.
    Claimed(Claim),
    /// Another thread finished moving the object.
    Forwarded(ObjectRef),
    /// Another thread is moving the object right now.
    Busy,
}

/// Proof of ownership of an object's header during a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Claim {
    original: HeaderWord,
}

impl Claim {
    /// The normal header the object had when it was claimed.
    #[inline(always)]
    pub fn original(&self) -> HeaderWord {
        self.original
    }
}

/// The header word of one object, used as the linearisation point for moving
/// it. All header mutation during evacuation goes through this type.
pub struct ForwardingSlot<'m> {
    memory: &'m HeapMemory,
    object: ObjectRef,
}

impl<'m> ForwardingSlot<'m> {
    #[inline(always)]
    pub fn new(memory: &'m HeapMemory, object: ObjectRef) -> Self {
        Self { memory, object }
    }

    #[inline]
    pub fn try_claim(&self, worker: usize) -> ClaimOutcome {
        let word = self.memory.word(self.object.addr());
        loop {
            let current = HeaderWord::from_raw(word.load(Ordering::Acquire));
            if let Some(copy) = current.forwarding_target() {
                return ClaimOutcome::Forwarded(copy);
            }
            if current.is_busy() {
                return ClaimOutcome::Busy;
            }
            debug_assert!(current.is_normal(), "claiming {:?} in state {current:?}", self.object);
            match word.compare_exchange_weak(
                current.raw(),
                HeaderWord::busy(worker).raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ClaimOutcome::Claimed(Claim { original: current }),
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    /// Makes `copy` visible to every thread that later reads the header.
    #[inline]
    pub fn publish(&self, claim: Claim, copy: ObjectRef) {
        let forwarded = HeaderWord::forwarded(copy, claim.original.age());
        self.memory
            .word(self.object.addr())
            .store(forwarded.raw(), Ordering::Release);
    }

    /// Gives the object back untouched.
    #[inline]
    pub fn abandon(&self, claim: Claim) {
        self.memory
            .word(self.object.addr())
            .store(claim.original.raw(), Ordering::Release);
    }
}
