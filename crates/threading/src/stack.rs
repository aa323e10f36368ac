//! Stack regions, the pre-allocated stack pool and GC root scanning

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Fill pattern for released slots in debug builds
pub const POISON_WORD: usize = usize::from_ne_bytes([0xA5; std::mem::size_of::<usize>()]);

const WORD: usize = std::mem::size_of::<usize>();

/// A word-addressed stack region that other threads may scan concurrently
#[derive(Debug, Clone)]
pub struct StackRegion {
    words: Arc<[AtomicUsize]>,
}

impl StackRegion {
    /// Allocate a zeroed region of at least `bytes` bytes
    pub fn with_bytes(bytes: usize) -> Self {
        let words = bytes.div_ceil(WORD);
        Self {
            words: (0..words).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * WORD
    }

    /// Store a word; returns `false` when `index` is past the end
    pub fn store(&self, index: usize, word: usize) -> bool {
        match self.words.get(index) {
            Some(slot) => {
                slot.store(word, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn load(&self, index: usize) -> Option<usize> {
        self.words.get(index).map(|w| w.load(Ordering::Acquire))
    }

    pub fn words(&self) -> &[AtomicUsize] {
        &self.words
    }

    fn fill(&self, word: usize) {
        for slot in self.words.iter() {
            slot.store(word, Ordering::Relaxed);
        }
    }

    fn is_filled_with(&self, word: usize) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Relaxed) == word)
    }
}

/// Receives candidate roots during a conservative scan
pub trait RootScanner {
    fn scan_word(&mut self, word: usize);

    /// Scan every word of a region
    fn scan_region(&mut self, region: &StackRegion) {
        for word in region.words() {
            self.scan_word(word.load(Ordering::Acquire));
        }
    }
}

impl<F: FnMut(usize)> RootScanner for F {
    fn scan_word(&mut self, word: usize) {
        self(word)
    }
}

struct StackSlot {
    region: StackRegion,
    used: bool,
}

/// Fixed set of equally sized stack regions allocated up front
pub struct StackPool {
    slots: Vec<StackSlot>,
    slot_bytes: usize,
}

impl StackPool {
    pub fn new(count: usize, slot_bytes: usize) -> Self {
        let slots = (0..count)
            .map(|_| StackSlot {
                region: StackRegion::with_bytes(slot_bytes),
                used: false,
            })
            .collect();
        Self { slots, slot_bytes }
    }

    /// Claim the first free slot
    pub fn acquire(&mut self) -> Option<(usize, StackRegion)> {
        let (index, slot) = self.slots.iter_mut().enumerate().find(|(_, s)| !s.used)?;
        slot.used = true;
        slot.region.fill(0);
        trace!("Allocating stack slot {}", index);
        Some((index, slot.region.clone()))
    }

    /// Return a slot to the pool
    pub fn release(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.used = false;
            if cfg!(debug_assertions) {
                slot.region.fill(POISON_WORD);
            }
        }
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.used).count()
    }

    /// Whether a free slot still carries the release poison (debug builds only)
    pub fn is_poisoned(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|s| !s.used && s.region.is_filled_with(POISON_WORD))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_rounds_up_to_words() {
        let region = StackRegion::with_bytes(WORD * 3 + 1);
        assert_eq!(region.len_words(), 4);
        assert!(region.store(3, 7));
        assert!(!region.store(4, 7));
        assert_eq!(region.load(3), Some(7));
        assert_eq!(region.load(4), None);
    }

    #[test]
    fn test_pool_exhaustion_and_reuse() {
        let mut pool = StackPool::new(2, 1024);
        let (a, _) = pool.acquire().unwrap();
        let (b, _) = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_use(), 2);

        pool.release(a);
        let (c, region) = pool.acquire().unwrap();
        assert_eq!(c, a);
        assert_eq!(region.load(0), Some(0));
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_released_slot_is_poisoned() {
        let mut pool = StackPool::new(1, 256);
        let (index, region) = pool.acquire().unwrap();
        region.store(0, 42);
        pool.release(index);
        assert!(pool.is_poisoned(index));
        assert_eq!(region.load(0), Some(POISON_WORD));
    }

    #[test]
    fn test_closure_scanner_sees_every_word() {
        let region = StackRegion::with_bytes(WORD * 4);
        region.store(1, 0xBEEF);
        let mut seen = Vec::new();
        let mut scanner = |w: usize| seen.push(w);
        scanner.scan_region(&region);
        assert_eq!(seen, vec![0, 0xBEEF, 0, 0]);
    }
}
