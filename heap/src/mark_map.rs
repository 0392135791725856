use std::sync::atomic::{AtomicU64, Ordering};

use object::WORD_SIZE;

/// Liveness bitmap with one bit per heap word.
///
/// A pair of adjacent bits doubles as an overflow flag: a normal mark sets
/// only the bit of an object's header, and objects span at least two words,
/// so both bits of a pair are set only through [`MarkMap::set_overflow`].
///
/// Addresses outside the covered range read as marked and are never set,
/// so callers need not filter references into unmanaged memory.
pub struct MarkMap {
    base: usize,
    end: usize,
    bits: Box<[AtomicU64]>,
}

impl MarkMap {
    /// Address granularity of one bit.
    pub const UNIT: usize = WORD_SIZE;

    pub fn new(base: usize, size: usize) -> Self {
        let units = size / Self::UNIT;
        let words = units.div_ceil(64);
        Self {
            base,
            end: base + size,
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline(always)]
    pub fn covers(&self, addr: usize) -> bool {
        (self.base..self.end).contains(&addr)
    }

    #[inline(always)]
    fn locate(&self, addr: usize) -> Option<(usize, u64)> {
        if !self.covers(addr) {
            return None;
        }
        let unit = (addr - self.base) / Self::UNIT;
        Some((unit / 64, 1u64 << (unit % 64)))
    }

    /// Sets the bit for `addr`. Returns `true` if this call set it.
    #[inline(always)]
    pub fn set_bit(&self, addr: usize) -> bool {
        let Some((word, mask)) = self.locate(addr) else {
            return false;
        };
        if self.bits[word].load(Ordering::Relaxed) & mask != 0 {
            return false;
        }
        self.bits[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    #[inline(always)]
    pub fn clear_bit(&self, addr: usize) {
        if let Some((word, mask)) = self.locate(addr) {
            self.bits[word].fetch_and(!mask, Ordering::AcqRel);
        }
    }

    #[inline(always)]
    pub fn is_bit_set(&self, addr: usize) -> bool {
        match self.locate(addr) {
            Some((word, mask)) => self.bits[word].load(Ordering::Acquire) & mask != 0,
            None => true,
        }
    }

    /// Sets both bits of the pair starting at `addr`.
    pub fn set_overflow(&self, addr: usize) {
        self.set_bit(addr);
        self.set_bit(addr + Self::UNIT);
    }

    /// Both bits of the pair are set. A pair cut off by the end of the map
    /// is never an overflow.
    pub fn is_overflow(&self, addr: usize) -> bool {
        let second = addr + Self::UNIT;
        self.covers(addr) && self.covers(second) && self.is_bit_set(addr) && self.is_bit_set(second)
    }

    /// Drops the overflow half of a pair, leaving `addr` marked.
    pub fn clear_overflow(&self, addr: usize) {
        self.clear_bit(addr + Self::UNIT);
    }

    /// Clears every bit for addresses in `[start, end)`.
    pub fn clear_range(&self, start: usize, end: usize) {
        let mut addr = start.max(self.base);
        let end = end.min(self.end);
        while addr < end {
            let unit = (addr - self.base) / Self::UNIT;
            if unit % 64 == 0 && addr + 64 * Self::UNIT <= end {
                self.bits[unit / 64].store(0, Ordering::Relaxed);
                addr += 64 * Self::UNIT;
            } else {
                self.clear_bit(addr);
                addr += Self::UNIT;
            }
        }
    }

    pub fn clear_all(&self) {
        for word in self.bits.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// First marked address in `[from, to)`.
    pub fn next_marked(&self, from: usize, to: usize) -> Option<usize> {
        let from = from.max(self.base);
        let to = to.min(self.end);
        if from >= to {
            return None;
        }
        let first = (from - self.base) / Self::UNIT;
        let last = (to - self.base).div_ceil(Self::UNIT);
        let mut word = first / 64;
        let mut bits = self.bits[word].load(Ordering::Acquire) & (!0u64 << (first % 64));
        loop {
            if bits != 0 {
                let unit = word * 64 + bits.trailing_zeros() as usize;
                if unit >= last {
                    return None;
                }
                return Some(self.base + unit * Self::UNIT);
            }
            word += 1;
            if word * 64 >= last {
                return None;
            }
            bits = self.bits[word].load(Ordering::Acquire);
        }
    }

    /// Iterates marked addresses in `[from, to)`, stepping over each object
    /// with `size_of`, which maps a marked address to its size in bytes.
    pub fn marked_objects<F>(&self, from: usize, to: usize, size_of: F) -> MarkedObjects<'_, F>
    where
        F: FnMut(usize) -> usize,
    {
        MarkedObjects {
            map: self,
            cursor: from,
            to,
            size_of,
        }
    }
}

pub struct MarkedObjects<'m, F> {
    map: &'m MarkMap,
    cursor: usize,
    to: usize,
    size_of: F,
}

impl<F: FnMut(usize) -> usize> Iterator for MarkedObjects<'_, F> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let addr = self.map.next_marked(self.cursor, self.to)?;
        self.cursor = addr + (self.size_of)(addr).max(MarkMap::UNIT);
        Some(addr)
    }
}

impl std::fmt::Debug for MarkMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MarkMap({:#x}..{:#x})", self.base, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x10_0000;

    #[test]
    fn set_clear_and_query() {
        let map = MarkMap::new(BASE, 4096);
        assert!(map.set_bit(BASE + 64), "first set wins");
        assert!(!map.set_bit(BASE + 64), "second set reports already marked");
        assert!(map.is_bit_set(BASE + 64));
        assert!(!map.is_bit_set(BASE + 72));
        map.clear_bit(BASE + 64);
        assert!(!map.is_bit_set(BASE + 64));
    }

    #[test]
    fn outside_range_is_marked() {
        let map = MarkMap::new(BASE, 4096);
        assert!(map.is_bit_set(BASE - 8));
        assert!(map.is_bit_set(BASE + 4096));
        assert!(!map.set_bit(BASE + 4096));
    }

    #[test]
    fn overflow_needs_both_bits() {
        let map = MarkMap::new(BASE, 4096);
        let x = BASE + 128;
        map.set_bit(x);
        assert!(!map.is_overflow(x), "a single mark is not overflow");
        map.set_bit(x + MarkMap::UNIT);
        assert!(map.is_overflow(x));
        map.clear_bit(x);
        assert!(!map.is_overflow(x), "clearing either bit drops overflow");

        map.set_overflow(x);
        assert!(map.is_overflow(x));
        map.clear_overflow(x);
        assert!(map.is_bit_set(x) && !map.is_overflow(x));
    }

    #[test]
    fn last_unit_alone_is_not_overflow() {
        let map = MarkMap::new(BASE, 4096);
        let last = BASE + 4096 - MarkMap::UNIT;
        assert!(map.set_bit(last));
        assert!(!map.is_overflow(last), "the missing second bit reads as unset");
        map.set_overflow(last);
        assert!(!map.is_overflow(last));
    }

    #[test]
    fn next_marked_scans_across_words() {
        let map = MarkMap::new(BASE, 64 * 1024);
        map.set_bit(BASE + 8 * 700);
        map.set_bit(BASE + 8 * 3);
        assert_eq!(map.next_marked(BASE, BASE + 64 * 1024), Some(BASE + 24));
        assert_eq!(map.next_marked(BASE + 32, BASE + 64 * 1024), Some(BASE + 5600));
        assert_eq!(map.next_marked(BASE + 32, BASE + 5600), None, "range end is exclusive");

        let found: Vec<usize> = map.marked_objects(BASE, BASE + 64 * 1024, |_| 16).collect();
        assert_eq!(found, vec![BASE + 24, BASE + 5600]);

        map.clear_range(BASE, BASE + 64 * 1024);
        assert_eq!(map.next_marked(BASE, BASE + 64 * 1024), None);
    }
}
