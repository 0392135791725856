mod system;
mod barrier;
mod error;
mod settings;
mod memory;
mod mark_map;
mod model;
mod forwarding;
mod object_list;
mod object_buffer;
mod remembered;
mod region;
mod stats;
mod heap;
mod roots;
mod dispatcher;
mod references;
mod marking;
mod sweep;
mod scavenger;
mod compact_group;
mod compactor;
mod reclaim;
mod concurrent;
mod collector;
mod chain_walker;
mod verify;

pub use system::OS_PAGE_SIZE;
pub use barrier::SenseBarrier;
pub use error::{GcError, GcResult};
pub use settings::HeapSettings;
pub use memory::HeapMemory;
pub use mark_map::{MarkMap, MarkedObjects};
pub use model::{ObjectModel, ObjectWalk, ReferentPolicy};
pub use forwarding::{Claim, ClaimOutcome, ForwardingHeader, ForwardingSlot};
pub use object_list::{CategoryLists, ObjectList, ObjectListIter};
pub use object_buffer::{CategoryBuffers, ObjectBuffer};
pub use remembered::{CardState, CardTable, RememberedSetCardList};
pub use region::{MemoryPool, NO_REGION, RegionDescriptor, RegionExtension, RegionKind, RegionTable};
pub use stats::{GcStats, StatsSnapshot};
pub use heap::{FinalizeQueues, Heap, Space};
pub use roots::{RootKind, RootProvider, RootSet, RootVisitor, RootWalker};
pub use dispatcher::{Dispatcher, WorkPool, WorkerEnv, partition};
pub use references::{Liveness, ReferenceProcessor, ReferenceSummary};
pub use marking::{MarkLiveness, MarkWorker, Marker};
pub use sweep::{SweepSummary, sweep_heap, sweep_region};
pub use scavenger::{ScavengeOutcome, ScavengeSummary, Scavenger};
pub use compact_group::{CompactGroupCycle, CompactGroupHistory, CompactGroups};
pub use compactor::{CompactSummary, Compactor};
pub use reclaim::{CollectionKind, MAX_SCORED_REGIONS, ReclaimDelegate, ScoredRegion, TopRegions, compact_score};
pub use concurrent::{ConcurrentCoordinator, ConcurrentPhase, HaltReason, SafepointCallback, ScanClassesMode};
pub use collector::{Collector, GlobalSummary};
pub use chain_walker::{ChainSummary, ReferenceChainWalker, Referrer};
pub use verify::{VerifyError, VerifySummary, verify_heap};

#[cfg(test)]
pub(crate) mod test_support {
    use object::{ClassId, ClassTable, ObjectRef};

    use crate::{Heap, HeapSettings};

    /// A 1 MB heap of 16 KB regions with two collector threads.
    pub fn small_settings() -> HeapSettings {
        HeapSettings {
            heap_size: 1024 * 1024,
            region_size: 16 * 1024,
            eden_regions: 8,
            survivor_regions: 4,
            tenure_age: 2,
            max_region_age: 3,
            object_list_count: 2,
            object_buffer_size: 4,
            card_size: 512,
            min_free_entry_size: 64,
            remembered_set_capacity: 256,
            gc_threads: 2,
            dynamic_class_unloading: false,
            weak_memory_ordering: false,
            concurrent_trace_target_ratio: 0.8,
        }
    }

    pub fn small_heap(classes: ClassTable, settings: HeapSettings) -> Heap {
        Heap::new(settings, classes).unwrap()
    }

    /// Allocates in eden without registering the object on any list.
    pub fn allocate_unlisted(heap: &Heap, class: ClassId, length: usize) -> ObjectRef {
        heap.allocate_object(class, length, false).unwrap()
    }
}
