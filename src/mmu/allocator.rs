//! Physical page allocator
//!
//! A bitmap of handed-out page frames. Frames are picked uniformly at random
//! among the free ones; a fixed seed makes the sequence reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{BridgeError, Result};

/// Random probes before falling back to picking the n-th free frame
const RANDOM_PROBES: usize = 16;

pub struct PageAllocator {
    used: Vec<u64>,
    pages: u64,
    free: u64,
    rng: StdRng,
}

impl PageAllocator {
    pub fn new(pages: u64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        PageAllocator {
            used: vec![0; pages.div_ceil(64) as usize],
            pages,
            free: pages,
            rng,
        }
    }

    pub fn pages(&self) -> u64 {
        self.pages
    }

    pub fn free_pages(&self) -> u64 {
        self.free
    }

    pub fn is_allocated(&self, page: u64) -> bool {
        page < self.pages && self.used[(page / 64) as usize] & (1 << (page % 64)) != 0
    }

    fn mark(&mut self, page: u64) {
        self.used[(page / 64) as usize] |= 1 << (page % 64);
        self.free -= 1;
    }

    /// Keep a frame out of circulation (reserved regions)
    pub fn reserve(&mut self, page: u64) {
        if page < self.pages && !self.is_allocated(page) {
            self.mark(page);
        }
    }

    /// Hand out a frame that has never been handed out before
    pub fn allocate(&mut self) -> Result<u64> {
        if self.free == 0 {
            return Err(BridgeError::OutOfPhysicalPages);
        }
        for _ in 0..RANDOM_PROBES {
            let page = self.rng.gen_range(0..self.pages);
            if !self.is_allocated(page) {
                self.mark(page);
                return Ok(page);
            }
        }
        // dense bitmap: pick the n-th free frame, still uniform
        let mut nth = self.rng.gen_range(0..self.free);
        for (word_idx, &word) in self.used.iter().enumerate() {
            let base = word_idx as u64 * 64;
            let valid = (self.pages - base).min(64);
            let mask = if valid == 64 { u64::MAX } else { (1u64 << valid) - 1 };
            let free_here = (!word & mask).count_ones() as u64;
            if nth >= free_here {
                nth -= free_here;
                continue;
            }
            for bit in 0..valid {
                if word & (1 << bit) == 0 {
                    if nth == 0 {
                        let page = base + bit;
                        self.mark(page);
                        return Ok(page);
                    }
                    nth -= 1;
                }
            }
        }
        Err(BridgeError::OutOfPhysicalPages)
    }

    pub fn bitmap(&self) -> &[u64] {
        &self.used
    }

    /// Replace the bitmap wholesale (snapshot restore)
    pub fn restore_bitmap(&mut self, words: &[u64]) -> Result<()> {
        if words.len() != self.used.len() {
            return Err(BridgeError::Snapshot(format!(
                "allocator bitmap has {} words, expected {}",
                words.len(),
                self.used.len()
            )));
        }
        self.used.copy_from_slice(words);
        let used: u64 = self.used.iter().map(|w| w.count_ones() as u64).sum();
        self.free = self.pages.saturating_sub(used);
        Ok(())
    }

    /// Every frame currently marked in use
    pub fn allocated(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.pages).filter(move |&p| self.is_allocated(p))
    }
}
