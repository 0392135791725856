//! Heap consistency checks for tests and the `--verify` driver flag.

use ahash::AHashSet;
use object::{HeaderFlags, ObjectCategory, ObjectRef, Slot};
use thiserror::Error;

use crate::{Heap, ReferentPolicy, RegionKind, RootKind, RootProvider, RootWalker};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("{kind:?} root points at {target:#x}, which is not an object")]
    BadRoot { kind: RootKind, target: usize },

    #[error("field {field:#x} of {object:#x} points at {target:#x}, which is not an object")]
    BadField { object: usize, field: usize, target: usize },

    #[error("{object:#x} is on more than one {category:?} list entry")]
    DuplicateListing { object: usize, category: ObjectCategory },

    #[error("{object:#x} is listed in region {listed} but is not an object there")]
    Mislisted { object: usize, listed: usize },

    #[error("finalized object {object:#x} is still listed as finalizable")]
    FinalizedListed { object: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VerifySummary {
    pub objects: usize,
    pub references: usize,
    pub listed: usize,
}

/// Walks every region and checks roots, fields and Object Lists.
///
/// The heap must be walkable.
pub fn verify_heap(heap: &Heap, roots: &dyn RootProvider) -> Result<VerifySummary, VerifyError> {
    assert!(heap.is_walkable(), "heap verification needs a walkable heap");
    let model = heap.model();
    let memory = heap.memory();

    let mut objects = AHashSet::new();
    for region in heap.regions().iter().filter(|r| r.kind() != RegionKind::Free) {
        objects.extend(
            heap.objects_in_region(region.index)
                .filter(|&o| !model.is_filler(o))
                .map(ObjectRef::addr),
        );
    }
    let mut summary = VerifySummary {
        objects: objects.len(),
        ..VerifySummary::default()
    };

    let mut bad_root = None;
    RootWalker::new(heap, roots).walk(&mut |slot: &Slot, kind: RootKind| {
        if let Some(target) = slot.load()
            && !objects.contains(&target.addr())
            && bad_root.is_none()
        {
            bad_root = Some(VerifyError::BadRoot {
                kind,
                target: target.addr(),
            });
        }
    });
    if let Some(err) = bad_root {
        return Err(err);
    }

    for &addr in &objects {
        let Some(object) = ObjectRef::from_addr(addr) else { continue };
        let mut bad = None;
        model.for_each_reference_slot(object, ReferentPolicy::All, |field| {
            if let Some(target) = memory.load_ref(field) {
                summary.references += 1;
                if bad.is_none() && !objects.contains(&target.addr()) {
                    bad = Some(VerifyError::BadField {
                        object: addr,
                        field,
                        target: target.addr(),
                    });
                }
            }
        });
        if let Some(err) = bad {
            return Err(err);
        }
    }

    let mut listed = AHashSet::new();
    for region in heap.regions().iter().filter(|r| r.kind() != RegionKind::Free) {
        for category in ObjectCategory::ALL {
            for object in region.ext.lists.entries(&model, category) {
                let addr = object.addr();
                if !region.contains(addr) || !objects.contains(&addr) {
                    return Err(VerifyError::Mislisted {
                        object: addr,
                        listed: region.index,
                    });
                }
                if !listed.insert(addr) {
                    return Err(VerifyError::DuplicateListing { object: addr, category });
                }
                if category == ObjectCategory::Finalizable
                    && model.header(object).flags().contains(HeaderFlags::FINALIZED)
                {
                    return Err(VerifyError::FinalizedListed { object: addr });
                }
            }
        }
    }
    summary.listed = listed.len();
    log::debug!(
        "verified {} objects, {} references, {} listed",
        summary.objects,
        summary.references,
        summary.listed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RootSet;
    use crate::test_support::{small_heap, small_settings};
    use object::{ClassBuilder, ClassTable};

    #[test]
    fn consistent_heap_passes() {
        let mut classes = ClassTable::new();
        let node = classes.register(ClassBuilder::mixed("Node").references(1));
        let lock = classes.register(ClassBuilder::ownable_synchronizer("Lock"));
        let heap = small_heap(classes, small_settings());
        let roots = RootSet::new(1);
        let a = heap.allocate(node, 0).unwrap();
        let b = heap.allocate(lock, 0).unwrap();
        heap.write_reference(a, 1, Some(b));
        roots.slot(RootKind::Stack, 0).store(Some(a));

        let summary = verify_heap(&heap, &roots).unwrap();
        assert_eq!(summary.objects, 2);
        assert_eq!(summary.references, 1);
        assert_eq!(summary.listed, 1);
    }

    #[test]
    fn dangling_field_and_double_listing_are_reported() {
        let mut classes = ClassTable::new();
        let node = classes.register(ClassBuilder::mixed("Node").references(1));
        let lock = classes.register(ClassBuilder::ownable_synchronizer("Lock"));
        let heap = small_heap(classes, small_settings());
        let roots = RootSet::new(1);
        let a = heap.allocate(node, 0).unwrap();
        let bogus = ObjectRef::from_addr(a.addr() + 8).unwrap();
        heap.write_reference(a, 1, Some(bogus));
        assert!(matches!(
            verify_heap(&heap, &roots),
            Err(VerifyError::BadField { object, .. }) if object == a.addr()
        ));
        heap.write_reference(a, 1, None);

        let b = heap.allocate(lock, 0).unwrap();
        let region = heap.regions().region_of(b.addr()).unwrap();
        let other = (0..heap.settings().object_list_count)
            .map(|i| region.ext.lists.slot(ObjectCategory::OwnableSynchronizer, i))
            .find(|list| list.is_empty())
            .unwrap();
        // A second list pointing at the same object.
        let link = heap.classes().get(lock).list_link().unwrap();
        heap.memory().store(b.word_addr(link), 0);
        other.push(&heap.model(), b);
        assert_eq!(
            verify_heap(&heap, &roots),
            Err(VerifyError::DuplicateListing {
                object: b.addr(),
                category: ObjectCategory::OwnableSynchronizer
            })
        );
    }
}
