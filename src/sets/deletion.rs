//! The concurrent soft-deletion bitmap.
//!
//! Deletes in a live index are soft: a bit flips, neighbor sets are left
//! alone, and cleanup later rewrites the graph without the marked nodes.
//! Marking must be safe concurrently with inserts and searches, so the bits
//! live in atomically updated words inside lazily allocated pages.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;

/// Bits per page; matches the visited-set page geometry.
const PAGE_BITS: usize = 4096;
const PAGE_WORDS: usize = PAGE_BITS / 64;

type Page = Box<[AtomicU64; PAGE_WORDS]>;

/// A concurrent bitmap of soft-deleted ordinals.
///
/// `mark` and `contains` may race freely with each other and with readers;
/// the page map takes a write lock only when a page is first created. Reads
/// on the common path are a shared-lock map probe plus one atomic load.
pub struct DeletionSet {
    pages: RwLock<HashMap<u32, Page>>,
}

impl DeletionSet {
    pub fn new() -> Self {
        DeletionSet {
            pages: RwLock::new(HashMap::new()),
        }
    }

    fn split(ordinal: u32) -> (u32, usize) {
        (ordinal / PAGE_BITS as u32, (ordinal as usize) % PAGE_BITS)
    }

    fn fresh_page() -> Page {
        Box::new(std::array::from_fn(|_| AtomicU64::new(0)))
    }

    /// Marks an ordinal as deleted. Idempotent.
    pub fn mark(&self, ordinal: u32) {
        let (page, offset) = Self::split(ordinal);
        let mask = 1u64 << (offset % 64);

        {
            let pages = self.pages.read();
            if let Some(words) = pages.get(&page) {
                words[offset / 64].fetch_or(mask, Ordering::Relaxed);
                return;
            }
        }

        let mut pages = self.pages.write();
        let words = pages.entry(page).or_insert_with(Self::fresh_page);
        words[offset / 64].fetch_or(mask, Ordering::Relaxed);
    }

    /// Whether the ordinal is currently marked deleted.
    pub fn contains(&self, ordinal: u32) -> bool {
        let (page, offset) = Self::split(ordinal);
        let pages = self.pages.read();
        match pages.get(&page) {
            Some(words) => words[offset / 64].load(Ordering::Relaxed) & (1u64 << (offset % 64)) != 0,
            None => false,
        }
    }

    /// Collects every marked ordinal, ascending. Intended for cleanup, which
    /// runs with no concurrent mutation.
    pub fn snapshot(&self) -> Vec<u32> {
        let pages = self.pages.read();
        let mut page_ids: Vec<u32> = pages.keys().copied().collect();
        page_ids.sort_unstable();

        let mut out = Vec::new();
        for page in page_ids {
            let words = &pages[&page];
            for (w, word) in words.iter().enumerate() {
                let mut bits = word.load(Ordering::Relaxed);
                while bits != 0 {
                    let b = bits.trailing_zeros() as usize;
                    out.push(page * PAGE_BITS as u32 + (w * 64 + b) as u32);
                    bits &= bits - 1;
                }
            }
        }
        out
    }

    /// Drops every mark and releases the pages.
    pub fn clear(&self) {
        self.pages.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        let pages = self.pages.read();
        pages
            .values()
            .all(|words| words.iter().all(|w| w.load(Ordering::Relaxed) == 0))
    }
}

impl Default for DeletionSet {
    fn default() -> Self {
        DeletionSet::new()
    }
}
