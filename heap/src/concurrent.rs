//! Concurrent marking: phase protocol, root tracing while mutators run,
//! card cleaning and the halt decision.
//!
//! Any number of threads may call [`ConcurrentCoordinator::step`]. Phase
//! changes are claimed by compare-and-swap on the phase word; the thread that
//! wins a transition into a root tracing phase runs that phase, everyone else
//! helps drain the shared work pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use object::{ObjectRef, Slot};
use parking_lot::Mutex;

use crate::{CardState, GcResult, Heap, MarkWorker, RegionKind, RootKind, RootProvider, RootWalker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConcurrentPhase {
    Idle = 0,
    Initializing,
    RootTracing,
    RootTracingJni,
    RootTracingClasses,
    RootTracingFinalizable,
    RootTracingStringTable,
    TraceOnly,
    Halted,
    Complete,
}

impl ConcurrentPhase {
    pub const COUNT: usize = Self::Complete as usize + 1;

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Initializing,
            2 => Self::RootTracing,
            3 => Self::RootTracingJni,
            4 => Self::RootTracingClasses,
            5 => Self::RootTracingFinalizable,
            6 => Self::RootTracingStringTable,
            7 => Self::TraceOnly,
            8 => Self::Halted,
            9 => Self::Complete,
            _ => unreachable!("invalid concurrent phase {value}"),
        }
    }

    pub fn is_root_tracing(self) -> bool {
        (Self::RootTracing..=Self::RootTracingStringTable).contains(&self)
    }

    /// Phase that follows a root tracing phase.
    pub fn next_tracing_phase(self) -> Self {
        match self {
            Self::RootTracing => Self::RootTracingJni,
            Self::RootTracingJni => Self::RootTracingClasses,
            Self::RootTracingClasses => Self::RootTracingFinalizable,
            Self::RootTracingFinalizable => Self::RootTracingStringTable,
            Self::RootTracingStringTable => Self::TraceOnly,
            other => unreachable!("{other:?} is not a root tracing phase"),
        }
    }
}

/// Progress of concurrent class scanning, independent of the phase word so
/// that it can span the root tracing and trace-only phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScanClassesMode {
    Disabled = 0,
    NeedToBeExecuted,
    CurrentlyActive,
    Complete,
}

impl ScanClassesMode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disabled,
            1 => Self::NeedToBeExecuted,
            2 => Self::CurrentlyActive,
            3 => Self::Complete,
            _ => unreachable!("invalid class scanning mode {value}"),
        }
    }
}

bitflags! {
    /// Why tracing stopped before the work ran out.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HaltReason: u8 {
        const TRACE_TARGET_REACHED = 1 << 0;
        const CARD_CLEANING_INCOMPLETE = 1 << 1;
        const CLASS_SCANNING_INCOMPLETE = 1 << 2;
        const EXTERNAL_REQUEST = 1 << 3;
    }
}

/// Runtime capability that brings every mutator thread to a point where its
/// earlier stores are visible to the collector.
pub trait SafepointCallback: Send + Sync {
    fn register_callback(&self, handler: Arc<dyn Fn() + Send + Sync>) -> GcResult<()>;
    fn request_callback(&self);
    fn cancel_callback(&self);
}

const TRACE_BATCH: usize = 32;

pub struct ConcurrentCoordinator {
    phase: AtomicU8,
    scan_classes: AtomicU8,
    halt_reason: AtomicU8,
    halt_requested: AtomicBool,
    work: Mutex<Vec<ObjectRef>>,
    traced_bytes: AtomicUsize,
    trace_target: AtomicUsize,
    phase_runs: [AtomicUsize; ConcurrentPhase::COUNT],
    safepoint: Mutex<Option<Arc<dyn SafepointCallback>>>,
    /// Set by the safepoint handler once mutators have acknowledged the
    /// barrier.
    barrier_visible: Arc<AtomicBool>,
    read_barrier_acceleration: AtomicBool,
}

impl Default for ConcurrentCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentCoordinator {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(ConcurrentPhase::Idle as u8),
            scan_classes: AtomicU8::new(ScanClassesMode::Disabled as u8),
            halt_reason: AtomicU8::new(0),
            halt_requested: AtomicBool::new(false),
            work: Mutex::new(Vec::new()),
            traced_bytes: AtomicUsize::new(0),
            trace_target: AtomicUsize::new(0),
            phase_runs: std::array::from_fn(|_| AtomicUsize::new(0)),
            safepoint: Mutex::new(None),
            barrier_visible: Arc::new(AtomicBool::new(false)),
            read_barrier_acceleration: AtomicBool::new(true),
        }
    }

    pub fn set_safepoint_callback(&self, callback: Arc<dyn SafepointCallback>) {
        *self.safepoint.lock() = Some(callback);
    }

    // ── State queries ─────────────────────────────────────────────────

    pub fn phase(&self) -> ConcurrentPhase {
        ConcurrentPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.phase() != ConcurrentPhase::Idle
    }

    pub fn halt_reason(&self) -> HaltReason {
        HaltReason::from_bits_truncate(self.halt_reason.load(Ordering::Acquire))
    }

    pub fn scan_classes_mode(&self) -> ScanClassesMode {
        ScanClassesMode::from_u8(self.scan_classes.load(Ordering::Acquire))
    }

    /// How often `phase` was entered in the current cycle.
    pub fn phase_runs(&self, phase: ConcurrentPhase) -> usize {
        self.phase_runs[phase as usize].load(Ordering::Acquire)
    }

    pub fn traced_bytes(&self) -> usize {
        self.traced_bytes.load(Ordering::Acquire)
    }

    pub fn trace_target(&self) -> usize {
        self.trace_target.load(Ordering::Acquire)
    }

    pub fn read_barrier_acceleration(&self) -> bool {
        self.read_barrier_acceleration.load(Ordering::Acquire)
    }

    fn transition(&self, from: ConcurrentPhase, to: ConcurrentPhase) -> bool {
        let won = self
            .phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.phase_runs[to as usize].fetch_add(1, Ordering::AcqRel);
            log::trace!("concurrent phase {from:?} -> {to:?}");
        }
        won
    }

    fn switch_scan_classes(&self, from: ScanClassesMode, to: ScanClassesMode) -> bool {
        self.scan_classes
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_scan_classes(&self, mode: ScanClassesMode) {
        self.scan_classes.store(mode as u8, Ordering::Release);
    }

    // ── Cycle lifecycle ───────────────────────────────────────────────

    /// Starts a cycle: installs the card barrier, turns on black allocation
    /// and clears the mark map. Returns `false` if a cycle is already active.
    pub fn kickoff(&self, heap: &Heap) -> bool {
        if !self.transition(ConcurrentPhase::Idle, ConcurrentPhase::Initializing) {
            return false;
        }
        for runs in &self.phase_runs {
            runs.store(0, Ordering::Relaxed);
        }
        self.phase_runs[ConcurrentPhase::Initializing as usize].store(1, Ordering::Relaxed);
        self.halt_reason.store(0, Ordering::Release);
        self.halt_requested.store(false, Ordering::Release);
        self.traced_bytes.store(0, Ordering::Release);
        self.work.lock().clear();
        self.set_scan_classes(ScanClassesMode::Disabled);
        self.barrier_visible.store(false, Ordering::Release);
        self.read_barrier_acceleration.store(true, Ordering::Release);

        heap.cards().clear_all(CardState::CONCURRENT);
        heap.set_concurrent_barrier(true);
        heap.mark_map().clear_all();
        for region in heap.regions().iter() {
            region.set_valid_mark_map(false);
        }
        heap.set_allocate_black(true);

        let live: usize = heap
            .regions()
            .iter()
            .filter(|r| r.kind() != RegionKind::Free)
            .map(|r| r.used_bytes())
            .sum();
        let target = ((live as f64) * heap.settings().concurrent_trace_target_ratio) as usize;
        self.trace_target.store(target.max(1), Ordering::Release);
        heap.stats().record_concurrent_cycle(1);
        log::debug!("concurrent cycle started, trace target {target} bytes");

        self.transition(ConcurrentPhase::Initializing, ConcurrentPhase::RootTracing);
        true
    }

    /// Asks tracing to stop at the next phase boundary.
    pub fn request_halt(&self) {
        self.halt_requested.store(true, Ordering::Release);
    }

    /// Runs one increment of concurrent work of about `budget` traced bytes
    /// and returns the phase afterwards.
    pub fn step(&self, heap: &Heap, roots: &dyn RootProvider, budget: usize) -> ConcurrentPhase {
        let phase = self.phase();
        match phase {
            ConcurrentPhase::Idle
            | ConcurrentPhase::Initializing
            | ConcurrentPhase::Halted
            | ConcurrentPhase::Complete => return phase,
            _ if self.halt_requested.load(Ordering::Acquire) => {
                self.halt(heap, phase, HaltReason::EXTERNAL_REQUEST);
            }
            p if p.is_root_tracing() => {
                let next = p.next_tracing_phase();
                if self.transition(p, next) {
                    match next {
                        ConcurrentPhase::TraceOnly => self.enter_trace_only(heap),
                        _ => self.collect_roots(heap, roots, next),
                    }
                }
                self.trace(heap, budget);
            }
            ConcurrentPhase::TraceOnly => self.trace_only_step(heap, roots, budget),
            _ => {}
        }
        self.phase()
    }

    fn collect_roots(&self, heap: &Heap, roots: &dyn RootProvider, phase: ConcurrentPhase) {
        let walker = RootWalker::new(heap, roots);
        match phase {
            ConcurrentPhase::RootTracingJni => self.mark_root_kind(heap, &walker, RootKind::Jni),
            ConcurrentPhase::RootTracingClasses => {
                if heap.settings().dynamic_class_unloading {
                    // Classes are traced from the trace-only phase instead.
                    self.set_scan_classes(ScanClassesMode::NeedToBeExecuted);
                } else {
                    self.mark_root_kind(heap, &walker, RootKind::Class);
                }
            }
            ConcurrentPhase::RootTracingFinalizable => {
                self.mark_root_kind(heap, &walker, RootKind::Finalizable)
            }
            ConcurrentPhase::RootTracingStringTable => {
                self.mark_root_kind(heap, &walker, RootKind::StringTable)
            }
            other => unreachable!("{other:?} collects no roots"),
        }
    }

    fn mark_root_kind(&self, heap: &Heap, walker: &RootWalker<'_>, kind: RootKind) {
        let mut marked = Vec::new();
        walker.walk_kind(kind, &mut |slot: &Slot, _: RootKind| {
            if let Some(target) = slot.load()
                && heap.mark_map().set_bit(target.addr())
            {
                marked.push(target);
            }
        });
        log::trace!("{kind:?} roots marked {} objects", marked.len());
        self.work.lock().extend(marked);
    }

    /// On weakly ordered hardware the barrier is only trusted once every
    /// mutator has passed a safepoint after it was installed.
    fn enter_trace_only(&self, heap: &Heap) {
        if !heap.settings().weak_memory_ordering {
            self.barrier_visible.store(true, Ordering::Release);
            return;
        }
        let callback = self.safepoint.lock().clone();
        let registered = match callback {
            Some(callback) => {
                let visible = Arc::clone(&self.barrier_visible);
                let handler: Arc<dyn Fn() + Send + Sync> = Arc::new(move || visible.store(true, Ordering::Release));
                callback.register_callback(handler).map(|()| callback.request_callback())
            }
            None => Err(crate::GcError::SafepointUnavailable("no callback provider")),
        };
        if let Err(err) = registered {
            log::warn!("{err}; continuing without read barrier acceleration");
            self.read_barrier_acceleration.store(false, Ordering::Release);
            self.barrier_visible.store(true, Ordering::Release);
        }
    }

    fn trace_only_step(&self, heap: &Heap, roots: &dyn RootProvider, budget: usize) {
        if self.switch_scan_classes(ScanClassesMode::NeedToBeExecuted, ScanClassesMode::CurrentlyActive) {
            self.mark_root_kind(heap, &RootWalker::new(heap, roots), RootKind::Class);
            self.set_scan_classes(ScanClassesMode::Complete);
        }

        let traced = self.trace(heap, budget);
        if self.traced_bytes() >= self.trace_target() {
            self.halt(heap, ConcurrentPhase::TraceOnly, HaltReason::TRACE_TARGET_REACHED);
            return;
        }
        if traced > 0 || !self.work.lock().is_empty() {
            return;
        }
        if !self.barrier_visible.load(Ordering::Acquire) {
            return;
        }

        // Out of work: clean cards, and finish once that finds nothing new.
        self.switch_scan_classes(ScanClassesMode::Complete, ScanClassesMode::NeedToBeExecuted);
        let cleaned = self.clean_cards(heap);
        let classes_pending = self.switch_scan_classes(ScanClassesMode::NeedToBeExecuted, ScanClassesMode::CurrentlyActive);
        if classes_pending {
            self.mark_root_kind(heap, &RootWalker::new(heap, roots), RootKind::Class);
            self.set_scan_classes(ScanClassesMode::Complete);
        }
        if cleaned == 0 && self.work.lock().is_empty() && self.transition(ConcurrentPhase::TraceOnly, ConcurrentPhase::Complete) {
            log::debug!("concurrent tracing complete after {} bytes", self.traced_bytes());
        }
    }

    fn halt(&self, heap: &Heap, from: ConcurrentPhase, reason: HaltReason) {
        let mut reason = reason;
        if heap.cards().count_dirty(CardState::CONCURRENT) > 0 || !self.work.lock().is_empty() {
            reason |= HaltReason::CARD_CLEANING_INCOMPLETE;
        }
        if matches!(
            self.scan_classes_mode(),
            ScanClassesMode::NeedToBeExecuted | ScanClassesMode::CurrentlyActive
        ) {
            reason |= HaltReason::CLASS_SCANNING_INCOMPLETE;
        }
        if self.transition(from, ConcurrentPhase::Halted) {
            self.halt_reason.store(reason.bits(), Ordering::Release);
            heap.stats().record_concurrent_halt(1);
            log::debug!("concurrent tracing halted: {reason:?}");
        }
    }

    /// Drains up to `budget` bytes from the shared pool. Returns the bytes
    /// this call scanned.
    fn trace(&self, heap: &Heap, budget: usize) -> usize {
        let mut worker = MarkWorker::new(heap, 0);
        let mut local = Vec::new();
        let mut batch = Vec::with_capacity(TRACE_BATCH);
        let mut scanned = 0;
        while scanned < budget {
            {
                let mut work = self.work.lock();
                let take = work.len().min(TRACE_BATCH);
                let from = work.len() - take;
                batch.extend(work.drain(from..));
            }
            if batch.is_empty() {
                break;
            }
            for object in batch.drain(..) {
                worker.scan(object, &mut local);
            }
            scanned += worker.finish();
            if !local.is_empty() {
                self.work.lock().append(&mut local);
            }
        }
        self.traced_bytes.fetch_add(scanned, Ordering::AcqRel);
        scanned
    }

    /// Clears dirty CONCURRENT cards and queues the marked objects on them
    /// for another scan. Returns the number of cards cleaned.
    fn clean_cards(&self, heap: &Heap) -> usize {
        let rescan = self.dirty_card_objects(heap);
        let cleaned = rescan.0;
        self.work.lock().extend(rescan.1);
        cleaned
    }

    fn dirty_card_objects(&self, heap: &Heap) -> (usize, Vec<ObjectRef>) {
        let cards = heap.cards();
        let model = heap.model();
        let card_size = cards.card_size();
        let size_of = |addr: usize| ObjectRef::from_addr(addr).map_or(object::WORD_SIZE, |o| model.size_in_bytes(o));
        let mut cleaned = 0;
        let mut objects = Vec::new();
        for region in heap.regions().iter().filter(|r| r.kind() != RegionKind::Free) {
            for card in cards.dirty_cards(region.start, region.top(), CardState::CONCURRENT) {
                if !cards.clear(card, CardState::CONCURRENT) {
                    continue;
                }
                cleaned += 1;
                let start = cards.card_start(card);
                let end = (start + card_size).min(region.top());
                for addr in heap.mark_map().marked_objects(region.start, end, size_of) {
                    if addr + size_of(addr) > start {
                        objects.extend(ObjectRef::from_addr(addr));
                    }
                }
            }
        }
        objects.dedup();
        (cleaned, objects)
    }

    /// Work the final pause must finish: the shared pool plus the marked
    /// objects on cards dirtied since they were last cleaned.
    pub fn take_remaining_work(&self, heap: &Heap) -> Vec<ObjectRef> {
        let (_, mut objects) = self.dirty_card_objects(heap);
        objects.append(&mut self.work.lock());
        objects
    }

    /// Ends the cycle, whether it completed, halted or is being abandoned.
    pub fn reset(&self, heap: &Heap) {
        heap.set_concurrent_barrier(false);
        heap.set_allocate_black(false);
        heap.cards().clear_all(CardState::CONCURRENT);
        self.work.lock().clear();
        if let Some(callback) = self.safepoint.lock().as_ref() {
            callback.cancel_callback();
        }
        if self.scan_classes_mode() != ScanClassesMode::Disabled {
            self.set_scan_classes(ScanClassesMode::Disabled);
        }
        self.phase.store(ConcurrentPhase::Idle as u8, Ordering::Release);
    }

    /// Abandons an active cycle because objects are about to move.
    pub fn abort(&self, heap: &Heap) {
        if self.is_active() {
            log::debug!("aborting concurrent cycle in {:?}", self.phase());
            self.reset(heap);
        }
    }
}

impl std::fmt::Debug for ConcurrentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentCoordinator")
            .field("phase", &self.phase())
            .field("scan_classes", &self.scan_classes_mode())
            .field("traced_bytes", &self.traced_bytes())
            .field("trace_target", &self.trace_target())
            .finish()
    }
}
