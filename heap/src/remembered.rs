//! Card table and per-region remembered-set card lists.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use ahash::AHashSet;
use parking_lot::Mutex;

bitflags::bitflags! {
    /// Reasons a card is dirty. Each collector clears only its own bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CardState: u8 {
        /// An old object on this card may reference a young object.
        const REMEMBERED = 1 << 0;
        /// An object on this card was written during concurrent marking.
        const CONCURRENT = 1 << 1;
    }
}

pub struct CardTable {
    base: usize,
    card_shift: u32,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    pub fn new(base: usize, size: usize, card_size: usize) -> Self {
        debug_assert!(card_size.is_power_of_two(), "card size {card_size} not a power of two");
        let card_shift = card_size.trailing_zeros();
        Self {
            base,
            card_shift,
            cards: (0..size >> card_shift).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    #[inline(always)]
    pub fn card_size(&self) -> usize {
        1 << self.card_shift
    }

    #[inline(always)]
    pub fn card_index(&self, addr: usize) -> usize {
        (addr - self.base) >> self.card_shift
    }

    #[inline(always)]
    pub fn card_start(&self, index: usize) -> usize {
        self.base + (index << self.card_shift)
    }

    #[inline(always)]
    pub fn dirty(&self, addr: usize, state: CardState) {
        let card = &self.cards[self.card_index(addr)];
        if card.load(Ordering::Relaxed) & state.bits() == 0 {
            card.fetch_or(state.bits(), Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub fn is_dirty(&self, index: usize, state: CardState) -> bool {
        self.cards[index].load(Ordering::Acquire) & state.bits() != 0
    }

    /// Clears `state` on one card. Returns whether it was set.
    #[inline]
    pub fn clear(&self, index: usize, state: CardState) -> bool {
        self.cards[index].fetch_and(!state.bits(), Ordering::AcqRel) & state.bits() != 0
    }

    pub fn clear_all(&self, state: CardState) {
        for card in self.cards.iter() {
            card.fetch_and(!state.bits(), Ordering::Relaxed);
        }
    }

    /// Indices of cards in `[start, end)` dirty for `state`.
    pub fn dirty_cards(&self, start: usize, end: usize, state: CardState) -> Vec<usize> {
        (self.card_index(start)..self.card_index(end))
            .filter(|&i| self.is_dirty(i, state))
            .collect()
    }

    pub fn count_dirty(&self, state: CardState) -> usize {
        (0..self.cards.len()).filter(|&i| self.is_dirty(i, state)).count()
    }
}

/// Cards elsewhere in the heap that hold references into one region.
///
/// The list is accurate only while it has not overflowed and is not being
/// rebuilt; compaction of a region in a partial collection depends on it.
pub struct RememberedSetCardList {
    cards: Mutex<AHashSet<usize>>,
    capacity: usize,
    overflowed: AtomicBool,
    being_rebuilt: AtomicBool,
}

impl RememberedSetCardList {
    pub fn new(capacity: usize) -> Self {
        Self {
            cards: Mutex::new(AHashSet::new()),
            capacity,
            overflowed: AtomicBool::new(false),
            being_rebuilt: AtomicBool::new(false),
        }
    }

    pub fn add(&self, card: usize) {
        if self.overflowed.load(Ordering::Relaxed) {
            return;
        }
        let mut cards = self.cards.lock();
        if cards.len() >= self.capacity && !cards.contains(&card) {
            cards.clear();
            self.overflowed.store(true, Ordering::Release);
            log::debug!("remembered set overflowed at {} cards", self.capacity);
            return;
        }
        cards.insert(card);
    }

    pub fn contains(&self, card: usize) -> bool {
        self.cards.lock().contains(&card)
    }

    pub fn len(&self) -> usize {
        self.cards.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_accurate(&self) -> bool {
        !self.overflowed.load(Ordering::Acquire) && !self.being_rebuilt.load(Ordering::Acquire)
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Drops all cards and marks the list inaccurate until
    /// [`RememberedSetCardList::finish_rebuild`].
    pub fn begin_rebuild(&self) {
        self.being_rebuilt.store(true, Ordering::Release);
        self.cards.lock().clear();
        self.overflowed.store(false, Ordering::Release);
    }

    pub fn finish_rebuild(&self) {
        self.being_rebuilt.store(false, Ordering::Release);
    }

    pub fn clear(&self) {
        self.cards.lock().clear();
        self.overflowed.store(false, Ordering::Release);
        self.being_rebuilt.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for RememberedSetCardList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RememberedSetCardList")
            .field("cards", &self.len())
            .field("accurate", &self.is_accurate())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_states_are_independent() {
        let table = CardTable::new(0x1000, 8192, 512);
        table.dirty(0x1000 + 600, CardState::REMEMBERED);
        table.dirty(0x1000 + 700, CardState::CONCURRENT);
        assert!(table.is_dirty(1, CardState::REMEMBERED));
        assert!(table.is_dirty(1, CardState::CONCURRENT));
        assert!(table.clear(1, CardState::CONCURRENT));
        assert!(!table.clear(1, CardState::CONCURRENT), "already clean");
        assert_eq!(table.dirty_cards(0x1000, 0x1000 + 8192, CardState::REMEMBERED), vec![1]);
    }

    #[test]
    fn card_list_overflow_makes_it_inaccurate() {
        let list = RememberedSetCardList::new(2);
        list.add(1);
        list.add(2);
        list.add(2);
        assert!(list.is_accurate());
        list.add(3);
        assert!(!list.is_accurate(), "overflow loses precision");

        list.begin_rebuild();
        assert!(!list.is_accurate(), "inaccurate while rebuilding");
        list.add(7);
        list.finish_rebuild();
        assert!(list.is_accurate());
        assert!(list.contains(7));
    }
}
