use hashbrown::HashMap;
use memmap2::Mmap;
use tracing::{debug, warn};

use crate::disk::reader::{Layout, read_neighbors_raw, read_vector_raw};
use crate::disk::FeatureId;

/// Default BFS radius around the entry node preloaded at open.
pub const DEFAULT_CACHE_DEPTH: usize = 3;

/// Vectors above this dimension are considered too big to duplicate into
/// the cache; their nodes cache adjacency only.
const SMALL_PAYLOAD_DIM: usize = 1024;

/// One preloaded node: its adjacency, plus its vector when cheap to keep.
pub struct CachedNode {
    pub neighbors: Box<[u32]>,
    pub vector: Option<Box<[f32]>>,
}

/// In-memory copies of the nodes within BFS depth `D` of the entry node.
///
/// Every search touches the entry's neighborhood, so serving those records
/// from memory removes the hottest file reads. The cache is built once at
/// open and never mutated; lookups are wait-free map probes.
///
/// Construction is best-effort: a file that fails mid-BFS degrades to an
/// empty cache with a warning rather than failing the open: the view reads
/// everything from the file in that case, and the real corruption (if any)
/// surfaces through ordinary reads with a proper error.
pub struct HotCache {
    nodes: HashMap<u32, CachedNode>,
}

impl HotCache {
    /// A cache that holds nothing (used when caching is disabled).
    pub fn empty() -> Self {
        HotCache {
            nodes: HashMap::new(),
        }
    }

    pub(crate) fn build(mmap: &Mmap, layout: &Layout, depth: usize) -> Self {
        if depth == 0 {
            return HotCache::empty();
        }
        let Some(entry) = layout.entry else {
            return HotCache::empty();
        };

        match Self::try_build(mmap, layout, entry, depth) {
            Ok(cache) => {
                debug!(nodes = cache.len(), depth, "hot-node cache warmed");
                cache
            }
            Err(e) => {
                warn!(error = %e, "hot-node cache prefetch failed; continuing uncached");
                HotCache::empty()
            }
        }
    }

    fn try_build(
        mmap: &Mmap,
        layout: &Layout,
        entry: u32,
        depth: usize,
    ) -> crate::error::Result<Self> {
        let cache_vectors = layout.dimension <= SMALL_PAYLOAD_DIM
            && (layout.features.contains(FeatureId::InlineVectors)
                || layout.features.contains(FeatureId::SeparatedVectors));

        let mut nodes: HashMap<u32, CachedNode> = HashMap::new();
        let mut frontier = vec![entry];
        let mut neighbors = Vec::new();
        let mut vector = Vec::new();

        for _ in 0..=depth {
            let mut next = Vec::new();
            for &ordinal in &frontier {
                if nodes.contains_key(&ordinal) {
                    continue;
                }
                read_neighbors_raw(mmap, layout, ordinal, &mut neighbors)?;
                let cached_vector = if cache_vectors {
                    read_vector_raw(mmap, layout, ordinal, &mut vector)?;
                    Some(vector.clone().into_boxed_slice())
                } else {
                    None
                };
                next.extend(neighbors.iter().copied().filter(|n| !nodes.contains_key(n)));
                nodes.insert(
                    ordinal,
                    CachedNode {
                        neighbors: neighbors.clone().into_boxed_slice(),
                        vector: cached_vector,
                    },
                );
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }

        Ok(HotCache { nodes })
    }

    pub fn get(&self, ordinal: u32) -> Option<&CachedNode> {
        self.nodes.get(&ordinal)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
