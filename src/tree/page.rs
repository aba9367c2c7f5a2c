//! Dense base page for the tree's root band.
//!
//! Every node whose depth lies within the base band owns exactly one
//! fixed slot here. Slots are laid out depth-major, then quadrant-major
//! (NW, NE, SW, SE), so a node's slot is a pure function of its path from
//! the root and the page needs no auxiliary index:
//!
//! ```text
//! slot = level_offset(depth) + path_index
//! level_offset(d) = (4^d - 1) / 3
//! path_index(child) = 4 * path_index(parent) + quadrant
//! ```
//!
//! Occupancy is two atomic bitmaps. `claimed` is the writer-side bitmap:
//! a slot is won by a compare-and-swap on its bit, which establishes the
//! happens-before edge between competing writers. `ready` publishes the
//! record bytes to readers: it is set with release ordering only after
//! the bytes are fully written, so a reader that observes the bit with
//! acquire ordering observes the whole record. A slot is written exactly
//! once; after publication its bytes never change.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of slots in the band strictly above `depth`.
pub fn level_offset(depth: usize) -> usize {
    // Sum of 4^d for d in 0..depth.
    ((1usize << (2 * depth)) - 1) / 3
}

/// Total slot count of a page covering depths `0..base_depth`.
pub fn page_capacity(base_depth: usize) -> usize {
    level_offset(base_depth)
}

// ── BasePage ───────────────────────────────────────────────────────

pub struct BasePage {
    data: UnsafeCell<Box<[u8]>>,
    claimed: Vec<AtomicU64>,
    ready: Vec<AtomicU64>,
    stride: usize,
    slots: usize,
}

impl std::fmt::Debug for BasePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasePage")
            .field("stride", &self.stride)
            .field("slots", &self.slots)
            .finish()
    }
}

// SAFETY: slot bytes are only written by the thread that won the
// `claimed` CAS for that slot, and only read by others after the
// release-published `ready` bit is observed with acquire ordering.
// Distinct slots never alias.
unsafe impl Sync for BasePage {}
unsafe impl Send for BasePage {}

impl BasePage {
    /// Allocate an empty page for `base_depth` bands of `stride`-byte
    /// slots.
    pub fn new(stride: usize, base_depth: usize) -> Self {
        let slots = page_capacity(base_depth);
        let words = slots.div_ceil(64);
        Self {
            data: UnsafeCell::new(vec![0u8; slots * stride].into_boxed_slice()),
            claimed: (0..words).map(|_| AtomicU64::new(0)).collect(),
            ready: (0..words).map(|_| AtomicU64::new(0)).collect(),
            stride,
            slots,
        }
    }

    /// Rebuild a page from a serialized image.
    ///
    /// The image carries no occupancy map, so a slot counts as occupied
    /// iff its bytes are not all zero. An all-zero record is therefore
    /// indistinguishable from an empty slot after reload. Returns the
    /// page and the number of occupied slots.
    pub fn from_bytes(bytes: &[u8], stride: usize, base_depth: usize) -> (Self, u64) {
        let page = Self::new(stride, base_depth);
        debug_assert_eq!(bytes.len(), page.slots * stride);

        let mut occupied = 0u64;
        {
            // Sole owner during reconstruction; no concurrent access yet.
            let data = unsafe { &mut *page.data.get() };
            data.copy_from_slice(bytes);
            for slot in 0..page.slots {
                let rec = &data[slot * stride..(slot + 1) * stride];
                if rec.iter().any(|&b| b != 0) {
                    page.claimed[slot / 64].fetch_or(1 << (slot % 64), Ordering::Relaxed);
                    page.ready[slot / 64].fetch_or(1 << (slot % 64), Ordering::Relaxed);
                    occupied += 1;
                }
            }
        }
        (page, occupied)
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn slot_count(&self) -> usize {
        self.slots
    }

    /// Byte length of the page image.
    pub fn byte_len(&self) -> usize {
        self.slots * self.stride
    }

    /// Try to win the slot. Returns true exactly once per slot, for the
    /// caller that performed the winning CAS.
    pub fn try_claim(&self, slot: usize) -> bool {
        debug_assert!(slot < self.slots);
        let word = &self.claimed[slot / 64];
        let bit = 1u64 << (slot % 64);
        let mut current = word.load(Ordering::Acquire);
        loop {
            if current & bit != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                current,
                current | bit,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    /// Write the record into a slot previously won via `try_claim` and
    /// publish it to readers.
    pub fn commit(&self, slot: usize, record: &[u8]) {
        debug_assert!(slot < self.slots);
        debug_assert_eq!(record.len(), self.stride);

        // SAFETY: the claim CAS makes this thread the sole writer of the
        // slot, and the slot is not yet visible to readers.
        unsafe {
            let base = (*self.data.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(record.as_ptr(), base.add(slot * self.stride), self.stride);
        }
        self.ready[slot / 64].fetch_or(1 << (slot % 64), Ordering::Release);
    }

    /// Record bytes of a published slot, or None while empty or in
    /// flight.
    pub fn read(&self, slot: usize) -> Option<&[u8]> {
        debug_assert!(slot < self.slots);
        let bit = 1u64 << (slot % 64);
        if self.ready[slot / 64].load(Ordering::Acquire) & bit == 0 {
            return None;
        }
        // SAFETY: published slots are immutable; see type-level comment.
        unsafe {
            let base = (*self.data.get()).as_ptr();
            Some(std::slice::from_raw_parts(
                base.add(slot * self.stride),
                self.stride,
            ))
        }
    }

    /// Copy of the page image containing only published slots; unclaimed
    /// and in-flight slots come out zeroed.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.byte_len()];
        for slot in 0..self.slots {
            if let Some(rec) = self.read(slot) {
                out[slot * self.stride..(slot + 1) * self.stride].copy_from_slice(rec);
            }
        }
        out
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_offsets() {
        assert_eq!(level_offset(0), 0);
        assert_eq!(level_offset(1), 1);
        assert_eq!(level_offset(2), 5);
        assert_eq!(level_offset(3), 21);
        assert_eq!(level_offset(11), 1_398_101);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let page = BasePage::new(4, 2);
        assert!(page.try_claim(3));
        assert!(!page.try_claim(3));
        assert!(page.try_claim(4));
    }

    #[test]
    fn test_read_before_commit_is_none() {
        let page = BasePage::new(4, 2);
        assert!(page.try_claim(0));
        // Claimed but not yet published.
        assert!(page.read(0).is_none());
        page.commit(0, &[1, 2, 3, 4]);
        assert_eq!(page.read(0), Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let page = BasePage::new(2, 3);
        for slot in [0usize, 1, 5, 20] {
            assert!(page.try_claim(slot));
            page.commit(slot, &[slot as u8 + 1, 0xee]);
        }

        let image = page.snapshot();
        assert_eq!(image.len(), page_capacity(3) * 2);

        let (restored, occupied) = BasePage::from_bytes(&image, 2, 3);
        assert_eq!(occupied, 4);
        assert_eq!(restored.read(5), Some(&[6, 0xee][..]));
        assert!(restored.read(2).is_none());
        // A restored slot cannot be claimed again.
        assert!(!restored.try_claim(20));
        assert!(restored.try_claim(2));
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        use std::sync::Arc;

        let page = Arc::new(BasePage::new(8, 4));
        let winners: Vec<_> = (0..8)
            .map(|i| {
                let page = Arc::clone(&page);
                std::thread::spawn(move || {
                    if page.try_claim(17) {
                        page.commit(17, &[i as u8; 8]);
                        1usize
                    } else {
                        0
                    }
                })
            })
            .collect();

        let total: usize = winners.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
        let rec = page.read(17).unwrap();
        assert!(rec.iter().all(|&b| b == rec[0]), "record must not tear");
    }
}
