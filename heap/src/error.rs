use thiserror::Error;

/// Failures the collector reports to its driver.
///
/// Evacuation failure is not listed: it is recovered inside the scavenger by
/// backing out and falling back to a global collection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    #[error("invalid heap settings: {0}")]
    InvalidSettings(&'static str),

    #[error("could not reserve {0} bytes of heap memory")]
    HeapReservation(usize),

    #[error("heap mapped at {0:#x} exceeds the forwardable address range")]
    HeapOutOfRange(usize),

    #[error("out of memory allocating {0} words")]
    OutOfMemory(usize),

    #[error("could not allocate compaction scratch space for compact group {group}")]
    CompactSetup { group: usize },

    #[error("safepoint callback unavailable: {0}")]
    SafepointUnavailable(&'static str),
}

pub type GcResult<T> = Result<T, GcError>;
