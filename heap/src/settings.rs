use object::{MIN_OBJECT_WORDS, WORD_SIZE};

use crate::{GcError, GcResult, OS_PAGE_SIZE};

/// Configuration for the region heap and its collectors.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total size of the heap in bytes. Must be a multiple of `region_size`.
    pub heap_size: usize,
    /// Size of a region. Must be a multiple of the OS page size.
    pub region_size: usize,
    /// Regions the mutator may fill before a scavenge is required.
    pub eden_regions: usize,
    /// Regions the scavenger may copy survivors into.
    pub survivor_regions: usize,
    /// Objects at least this old are promoted to tenure on their next copy.
    pub tenure_age: u8,
    /// Oldest logical region age; also the oldest compact group.
    pub max_region_age: u8,
    /// Independent list slots per region and category.
    pub object_list_count: usize,
    /// Objects a worker stages before flushing into a region list.
    pub object_buffer_size: usize,
    /// Bytes covered by one card. Must divide `region_size`.
    pub card_size: usize,
    /// Free chunks smaller than this are accounted as dark matter.
    pub min_free_entry_size: usize,
    /// Cards a region's remembered-set card list holds before it overflows
    /// and becomes inaccurate.
    pub remembered_set_capacity: usize,
    /// Collector threads used during stop-the-world pauses.
    pub gc_threads: usize,
    /// Scan classes concurrently so unreachable classes can be unloaded.
    pub dynamic_class_unloading: bool,
    /// Hardware needs a safepoint handshake before tracing concurrently.
    pub weak_memory_ordering: bool,
    /// Fraction of occupied old-space bytes a concurrent cycle traces before
    /// it halts and asks for the final pause.
    pub concurrent_trace_target_ratio: f64,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 64 * 1024 * 1024, // 64 MB
            region_size: 256 * 1024,     // 256 KB
            eden_regions: 32,
            survivor_regions: 8,
            tenure_age: 3,
            max_region_age: 4,
            object_list_count: 4,
            object_buffer_size: 32,
            card_size: 512,
            min_free_entry_size: 128,
            remembered_set_capacity: 1024,
            gc_threads: 4,
            dynamic_class_unloading: true,
            weak_memory_ordering: cfg!(any(target_arch = "aarch64", target_arch = "powerpc64")),
            concurrent_trace_target_ratio: 0.8,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> GcResult<()> {
        let err = |msg| Err(GcError::InvalidSettings(msg));
        if self.heap_size == 0 || self.region_size == 0 || self.card_size == 0 {
            return err("sizes must be > 0");
        }
        if !self.region_size.is_multiple_of(OS_PAGE_SIZE) {
            return err("region_size must match OS page alignment");
        }
        if !self.heap_size.is_multiple_of(self.region_size) {
            return err("heap_size must be a multiple of region_size");
        }
        if !self.card_size.is_power_of_two() || self.card_size < WORD_SIZE {
            return err("card_size must be a power of two of at least one word");
        }
        if !self.region_size.is_multiple_of(self.card_size) {
            return err("card_size must divide region_size");
        }
        let regions = self.region_count();
        if self.eden_regions == 0 || self.survivor_regions == 0 {
            return err("eden and survivor need at least one region each");
        }
        if self.eden_regions + self.survivor_regions >= regions {
            return err("young regions must leave room for tenure");
        }
        if self.tenure_age == 0 || self.tenure_age == u8::MAX {
            return err("tenure_age must be in 1..255");
        }
        if self.object_list_count == 0 || self.object_buffer_size == 0 {
            return err("object lists and buffers need capacity");
        }
        if self.min_free_entry_size < MIN_OBJECT_WORDS * WORD_SIZE {
            return err("min_free_entry_size smaller than the smallest object");
        }
        if self.gc_threads == 0 {
            return err("gc_threads must be > 0");
        }
        if !(0.0..=1.0).contains(&self.concurrent_trace_target_ratio) {
            return err("concurrent_trace_target_ratio must be between 0.0 and 1.0");
        }
        Ok(())
    }

    #[inline]
    pub fn region_count(&self) -> usize {
        self.heap_size / self.region_size
    }

    /// Number of compact groups: the young group plus one per tenure age.
    #[inline]
    pub fn compact_group_count(&self) -> usize {
        self.max_region_age as usize + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        assert_eq!(HeapSettings::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_geometry() {
        let settings = HeapSettings {
            region_size: 5000,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err(), "region size must be page aligned");

        let settings = HeapSettings {
            eden_regions: 250,
            survivor_regions: 10,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err(), "young space cannot cover the heap");

        let settings = HeapSettings {
            card_size: 384,
            ..HeapSettings::default()
        };
        assert_eq!(
            settings.validate(),
            Err(GcError::InvalidSettings("card_size must be a power of two of at least one word"))
        );
    }
}
