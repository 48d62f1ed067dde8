use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use memmap2::Mmap;

use crate::disk::writer::RecordShape;
use crate::disk::{
    DEFAULT_CACHE_DEPTH, FORMAT_VERSION, FeatureId, FeatureSet, HotCache, LEGACY_VERSION, MAGIC,
};
use crate::error::{IndexError, Result};
use crate::graph::GraphView;
use crate::numerics::Similarity;
use crate::quantization::{CompressedVectors, ProductQuantizer, Subspace};
use crate::scoring::{
    ApproximateScorer, ExactScorer, FusedScorer, PqScorer, SearchScoreProvider,
};
use crate::search::{GraphSearcher, SearchParams, SearchResult};

/// Everything derivable from the header: offsets are computed, never stored.
pub(crate) struct Layout {
    pub version: u32,
    pub size: usize,
    pub dimension: usize,
    pub entry: Option<u32>,
    pub max_degree: usize,
    pub features: FeatureSet,
    pub quantizer: Option<Arc<ProductQuantizer>>,
    pub shape: RecordShape,
    pub records_base: usize,
    pub separated_vectors_base: Option<usize>,
}

/// Bounds-checked sequential reads over the mapped file.
struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.at + n > self.buf.len() {
            return Err(IndexError::format(format!(
                "file truncated: wanted {n} bytes at offset {}",
                self.at
            )));
        }
        let slice = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(BigEndian::read_f32(self.take(4)?))
    }
}

fn parse_pq_header(cur: &mut Cursor<'_>, dimension: usize) -> Result<Arc<ProductQuantizer>> {
    let subspace_count = cur.read_u32()? as usize;
    if subspace_count == 0 || subspace_count > dimension {
        return Err(IndexError::format(format!(
            "quantizer header claims {subspace_count} subspaces over {dimension} dimensions"
        )));
    }
    let mut subspaces = Vec::with_capacity(subspace_count);
    for _ in 0..subspace_count {
        let offset = cur.read_u32()? as usize;
        let len = cur.read_u32()? as usize;
        subspaces.push(Subspace { offset, len });
    }
    let clusters = cur.read_u32()? as usize;
    if clusters == 0 || clusters > 256 {
        return Err(IndexError::format(format!(
            "quantizer header claims {clusters} clusters per codebook"
        )));
    }
    let global_centroid = match cur.read_u32()? {
        0 => None,
        1 => {
            let mut gc = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                gc.push(cur.read_f32()?);
            }
            Some(gc)
        }
        other => {
            return Err(IndexError::format(format!(
                "global centroid flag must be 0 or 1, found {other}"
            )));
        }
    };
    let tensor_len: usize = subspaces.iter().map(|s| s.len * clusters).sum();
    let mut codebooks = Vec::with_capacity(tensor_len);
    for _ in 0..tensor_len {
        codebooks.push(cur.read_f32()?);
    }
    Ok(Arc::new(ProductQuantizer::from_parts(
        dimension,
        clusters,
        subspaces,
        codebooks,
        global_centroid,
    )?))
}

fn parse_layout(buf: &[u8]) -> Result<Layout> {
    let mut cur = Cursor::new(buf);

    let first = cur.read_u32()?;
    let (version, size, dimension, entry_raw, max_degree, features) = if first == MAGIC {
        let version = cur.read_u32()?;
        if version > FORMAT_VERSION {
            return Err(IndexError::format(format!(
                "version {version} (multi-layer era) is newer than this reader; \
                 only versions {LEGACY_VERSION} and {FORMAT_VERSION} are supported"
            )));
        }
        if version < FORMAT_VERSION {
            return Err(IndexError::format(format!(
                "version {version} files carry no magic; a magic header claiming \
                 version {version} is corrupt"
            )));
        }
        let size = cur.read_u32()? as usize;
        let dimension = cur.read_u32()? as usize;
        let entry_raw = cur.read_u32()?;
        let max_degree = cur.read_u32()? as usize;
        let features = FeatureSet::from_bits(cur.read_u32()?)?;
        (version, size, dimension, entry_raw, max_degree, features)
    } else {
        // legacy headerless layout: the integer just read was the node count
        let size = first as usize;
        let dimension = cur.read_u32()? as usize;
        let entry_raw = cur.read_u32()?;
        let max_degree = cur.read_u32()? as usize;
        let features = FeatureSet::empty().with(FeatureId::InlineVectors);
        (LEGACY_VERSION, size, dimension, entry_raw, max_degree, features)
    };

    if dimension == 0 {
        return Err(IndexError::format("header claims zero dimension"));
    }
    if max_degree == 0 {
        return Err(IndexError::format("header claims zero max degree"));
    }

    // per-feature headers, bitmap order; a PQ feature embeds its codebooks
    let mut quantizer: Option<Arc<ProductQuantizer>> = None;
    for feature in features.iter() {
        match feature {
            FeatureId::FusedAdc | FeatureId::InlinePq => {
                let pq = parse_pq_header(&mut cur, dimension)?;
                // both features store the same codebooks; keep the first
                quantizer.get_or_insert(pq);
            }
            _ => {}
        }
    }

    let shape = RecordShape {
        dimension,
        max_degree,
        subspaces: quantizer.as_ref().map(|q| q.subspace_count()).unwrap_or(0),
        features,
    };
    let records_base = cur.at;

    let records_len = size
        .checked_mul(shape.record_size())
        .ok_or_else(|| IndexError::format("node section size overflows"))?;
    let separated_vectors_base = features
        .contains(FeatureId::SeparatedVectors)
        .then_some(records_base + records_len);
    let separated_len = if features.contains(FeatureId::SeparatedVectors) {
        size * shape.separated_entry_size(FeatureId::SeparatedVectors)
    } else {
        0
    };

    let expected = records_base + records_len + separated_len;
    if buf.len() != expected {
        return Err(IndexError::format(format!(
            "file is {} bytes but the header implies {expected}",
            buf.len()
        )));
    }

    let entry = if size == 0 {
        None
    } else {
        if entry_raw as usize >= size {
            return Err(IndexError::format(format!(
                "entry ordinal {entry_raw} outside 0..{size}"
            )));
        }
        Some(entry_raw)
    };

    Ok(Layout {
        version,
        size,
        dimension,
        entry,
        max_degree,
        features,
        quantizer,
        shape,
        records_base,
        separated_vectors_base,
    })
}

/// Raw record access shared by views and the hot-cache builder.
pub(crate) fn record_slice<'a>(buf: &'a [u8], layout: &Layout, ordinal: u32) -> Result<&'a [u8]> {
    if (ordinal as usize) >= layout.size {
        return Err(IndexError::NotFound(ordinal));
    }
    let rs = layout.shape.record_size();
    let start = layout.records_base + ordinal as usize * rs;
    let record = &buf[start..start + rs];
    let sanity = BigEndian::read_u32(&record[..4]);
    if sanity != ordinal {
        return Err(IndexError::format(format!(
            "record {ordinal} starts with ordinal {sanity}; the file is misaligned"
        )));
    }
    Ok(record)
}

pub(crate) fn read_neighbors_raw(
    buf: &[u8],
    layout: &Layout,
    ordinal: u32,
    out: &mut Vec<u32>,
) -> Result<()> {
    let record = record_slice(buf, layout, ordinal)?;
    let at = layout.shape.neighbors_offset();
    let count = BigEndian::read_u32(&record[at..at + 4]) as usize;
    if count > layout.max_degree {
        return Err(IndexError::format(format!(
            "record {ordinal} claims {count} neighbors over the cap {}",
            layout.max_degree
        )));
    }
    out.clear();
    for e in 0..count {
        let n = BigEndian::read_i32(&record[at + 4 + e * 4..at + 8 + e * 4]);
        if n < 0 || n as usize >= layout.size {
            return Err(IndexError::format(format!(
                "record {ordinal} edge {e} points at invalid ordinal {n}"
            )));
        }
        out.push(n as u32);
    }
    Ok(())
}

pub(crate) fn read_vector_raw(
    buf: &[u8],
    layout: &Layout,
    ordinal: u32,
    out: &mut Vec<f32>,
) -> Result<()> {
    let source = if layout.features.contains(FeatureId::InlineVectors) {
        let record = record_slice(buf, layout, ordinal)?;
        let at = layout.shape.inline_offset(FeatureId::InlineVectors);
        &record[at..at + layout.dimension * 4]
    } else if let Some(base) = layout.separated_vectors_base {
        if (ordinal as usize) >= layout.size {
            return Err(IndexError::NotFound(ordinal));
        }
        let start = base + ordinal as usize * layout.dimension * 4;
        &buf[start..start + layout.dimension * 4]
    } else {
        return Err(IndexError::invalid(
            "this index stores no full-precision vectors",
        ));
    };

    out.clear();
    out.reserve(layout.dimension);
    for chunk in source.chunks_exact(4) {
        out.push(BigEndian::read_f32(chunk));
    }
    Ok(())
}

/// A loaded on-disk index: the mapped file, its parsed layout, the
/// in-memory copy of any inline PQ codes, and the hot-node cache.
///
/// Cloning is cheap (shared mappings); hand threads their own [`View`]s via
/// [`supplier`](Self::supplier).
#[derive(Clone)]
pub struct OnDiskGraph {
    mmap: Arc<Mmap>,
    layout: Arc<Layout>,
    codes: Option<Arc<CompressedVectors>>,
    cache: Arc<HotCache>,
}

impl OnDiskGraph {
    /// Maps and validates an index file, then warms the hot-node cache to
    /// the default BFS depth.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_cache_depth(path, DEFAULT_CACHE_DEPTH)
    }

    /// As [`load`](Self::load) with an explicit cache depth (`0` disables
    /// caching).
    pub fn load_with_cache_depth(path: impl AsRef<Path>, depth: usize) -> Result<Self> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and the file is ours to map; a
        // concurrent writer truncating it is outside the supported contract.
        let mmap = Arc::new(unsafe { Mmap::map(&file)? });
        let layout = Arc::new(parse_layout(&mmap)?);

        let codes = if layout.features.contains(FeatureId::InlinePq) {
            let quantizer = layout
                .quantizer
                .clone()
                .ok_or_else(|| IndexError::format("inline PQ set but no codebooks parsed"))?;
            let subspaces = quantizer.subspace_count();
            let at = layout.shape.inline_offset(FeatureId::InlinePq);
            let mut flat = Vec::with_capacity(layout.size * subspaces);
            for ordinal in 0..layout.size as u32 {
                let record = record_slice(&mmap, &layout, ordinal)?;
                flat.extend_from_slice(&record[at..at + subspaces]);
            }
            Some(Arc::new(CompressedVectors::from_codes(
                quantizer,
                flat,
                layout.size,
            )?))
        } else {
            None
        };

        let cache = Arc::new(HotCache::build(&mmap, &layout, depth));

        Ok(OnDiskGraph {
            mmap,
            layout,
            codes,
            cache,
        })
    }

    pub fn size(&self) -> usize {
        self.layout.size
    }

    pub fn dimension(&self) -> usize {
        self.layout.dimension
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.layout.entry
    }

    pub fn max_degree(&self) -> usize {
        self.layout.max_degree
    }

    pub fn version(&self) -> u32 {
        self.layout.version
    }

    pub fn features(&self) -> FeatureSet {
        self.layout.features
    }

    /// A fresh single-threaded view.
    pub fn view(&self) -> View {
        View {
            mmap: Arc::clone(&self.mmap),
            layout: Arc::clone(&self.layout),
            codes: self.codes.clone(),
            cache: Arc::clone(&self.cache),
        }
    }

    /// The per-thread view factory: clone the supplier anywhere, call
    /// [`get`](ReaderSupplier::get) on each thread.
    pub fn supplier(&self) -> ReaderSupplier {
        ReaderSupplier {
            graph: self.clone(),
        }
    }
}

/// Hands each searching thread its own [`View`].
#[derive(Clone)]
pub struct ReaderSupplier {
    graph: OnDiskGraph,
}

impl ReaderSupplier {
    pub fn get(&self) -> View {
        self.graph.view()
    }
}

/// A single-threaded window into an on-disk index.
///
/// Neighbor and vector reads go through the hot cache first and fall back
/// to the mapped file, landing in caller-provided buffers so a search loop
/// never allocates per node. Cloning a view (for a scorer, say) is a few
/// `Arc` bumps.
pub struct View {
    mmap: Arc<Mmap>,
    layout: Arc<Layout>,
    codes: Option<Arc<CompressedVectors>>,
    cache: Arc<HotCache>,
}

impl Clone for View {
    fn clone(&self) -> Self {
        View {
            mmap: Arc::clone(&self.mmap),
            layout: Arc::clone(&self.layout),
            codes: self.codes.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl View {
    pub fn size(&self) -> usize {
        self.layout.size
    }

    pub fn dimension(&self) -> usize {
        self.layout.dimension
    }

    pub fn max_degree(&self) -> usize {
        self.layout.max_degree
    }

    pub fn features(&self) -> FeatureSet {
        self.layout.features
    }

    pub fn quantizer(&self) -> Option<&Arc<ProductQuantizer>> {
        self.layout.quantizer.as_ref()
    }

    /// Copies `ordinal`'s out-neighbors into `out`.
    pub fn neighbors_into(&mut self, ordinal: u32, out: &mut Vec<u32>) -> Result<()> {
        if let Some(cached) = self.cache.get(ordinal) {
            out.clear();
            out.extend_from_slice(&cached.neighbors);
            return Ok(());
        }
        read_neighbors_raw(&self.mmap, &self.layout, ordinal, out)
    }

    /// Copies `ordinal`'s full-precision vector into `out`.
    ///
    /// # Errors
    /// `InvalidArgument` when the index stores no vector feature.
    pub fn vector_into(&mut self, ordinal: u32, out: &mut Vec<f32>) -> Result<()> {
        if let Some(cached) = self.cache.get(ordinal)
            && let Some(vector) = &cached.vector
        {
            out.clear();
            out.extend_from_slice(vector);
            return Ok(());
        }
        read_vector_raw(&self.mmap, &self.layout, ordinal, out)
    }

    /// Allocating variant of [`vector_into`](Self::vector_into).
    pub fn vector(&mut self, ordinal: u32) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        self.vector_into(ordinal, &mut out)?;
        Ok(out)
    }

    /// Zero-copy access to `ordinal`'s transposed neighbor-code block.
    pub fn fused_block(&self, ordinal: u32) -> Result<&[u8]> {
        if !self.layout.features.contains(FeatureId::FusedAdc) {
            return Err(IndexError::invalid("this index stores no fused-ADC blocks"));
        }
        let record = record_slice(&self.mmap, &self.layout, ordinal)?;
        let at = self.layout.shape.inline_offset(FeatureId::FusedAdc);
        let len = self.layout.shape.subspaces * self.layout.max_degree;
        Ok(&record[at..at + len])
    }

    fn has_vectors(&self) -> bool {
        self.layout.features.contains(FeatureId::InlineVectors)
            || self.layout.features.contains(FeatureId::SeparatedVectors)
    }

    /// Builds the (approximate, reranker) pair for one query, dispatching on
    /// the installed features:
    ///
    /// - fused ADC (dot/Euclidean) → fused approximate + exact reranker
    /// - inline PQ → scalar ADC approximate + exact reranker when vectors
    ///   are present
    /// - vectors only → exact scoring, no rerank stage
    pub fn score_provider(
        &self,
        query: &[f32],
        similarity: Similarity,
    ) -> Result<SearchScoreProvider> {
        if query.len() != self.layout.dimension {
            return Err(IndexError::invalid(format!(
                "query dimension {} != index dimension {}",
                query.len(),
                self.layout.dimension
            )));
        }

        let fused_usable = self.layout.features.contains(FeatureId::FusedAdc)
            && similarity != Similarity::Cosine
            && self.has_vectors();
        if fused_usable {
            let quantizer = self
                .layout
                .quantizer
                .as_ref()
                .ok_or_else(|| IndexError::format("fused ADC set but no codebooks parsed"))?;
            let quantized = quantizer.query_tables(query, similarity)?.quantized()?;
            let approx =
                ApproximateScorer::Fused(FusedScorer::new(quantized, self.clone(), query, similarity));
            let reranker = ExactScorer::over_view(query, similarity, self.clone());
            return Ok(SearchScoreProvider::new(approx, Some(reranker)));
        }

        if let Some(codes) = &self.codes {
            let tables = codes.quantizer().query_tables(query, similarity)?;
            let approx = ApproximateScorer::Pq(PqScorer::new(tables, Arc::clone(codes)));
            let reranker = self
                .has_vectors()
                .then(|| ExactScorer::over_view(query, similarity, self.clone()));
            return Ok(SearchScoreProvider::new(approx, reranker));
        }

        if self.has_vectors() {
            return Ok(SearchScoreProvider::exact_only(ExactScorer::over_view(
                query, similarity, self.clone(),
            )));
        }

        Err(IndexError::invalid(format!(
            "no installed feature can score {similarity:?} queries"
        )))
    }

    /// One-call search: builds the score provider and runs a fresh searcher.
    pub fn search(
        &mut self,
        query: &[f32],
        similarity: Similarity,
        params: &SearchParams,
    ) -> Result<SearchResult> {
        let mut provider = self.score_provider(query, similarity)?;
        let mut searcher = GraphSearcher::new();
        searcher.search(self, &mut provider, params, None)
    }
}

impl GraphView for View {
    fn size(&self) -> usize {
        self.layout.size
    }

    fn entry_point(&self) -> Option<u32> {
        self.layout.entry
    }

    fn neighbors_into(&mut self, ordinal: u32, out: &mut Vec<u32>) -> Result<()> {
        View::neighbors_into(self, ordinal, out)
    }

    fn is_live(&self, ordinal: u32) -> bool {
        // a written index holds only live nodes
        (ordinal as usize) < self.layout.size
    }
}
