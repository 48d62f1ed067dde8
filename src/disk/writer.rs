use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};
use tracing::info;

use crate::disk::{FORMAT_VERSION, FeatureId, FeatureSet, MAGIC, OrdinalMapper};
use crate::error::{IndexError, Result};
use crate::graph::OnHeapGraph;
use crate::quantization::ProductQuantizer;
use crate::scoring::VectorStore;
use crate::sets::visited::{DenseVisited, VisitorSet};

/// What to store per node when writing an index.
///
/// At least one of the vector features or a quantizer must be selected:
/// an index nobody can score is a format error waiting to happen.
#[derive(Default)]
pub struct FeatureBundle {
    /// Full-precision vector inside each node record.
    pub inline_vectors: bool,
    /// Full-precision vectors in a separated tail region.
    pub separated_vectors: bool,
    /// Transposed neighbor codes per record, for fused-ADC scoring.
    pub fused_adc: Option<Arc<ProductQuantizer>>,
    /// The node's own code per record, for scalar ADC scoring.
    pub inline_pq: Option<Arc<ProductQuantizer>>,
}

impl FeatureBundle {
    /// The most common bundle: just the vectors, inline.
    pub fn inline_vectors_only() -> Self {
        FeatureBundle {
            inline_vectors: true,
            ..FeatureBundle::default()
        }
    }

    pub fn feature_set(&self) -> FeatureSet {
        let mut set = FeatureSet::empty();
        if self.inline_vectors {
            set = set.with(FeatureId::InlineVectors);
        }
        if self.fused_adc.is_some() {
            set = set.with(FeatureId::FusedAdc);
        }
        if self.separated_vectors {
            set = set.with(FeatureId::SeparatedVectors);
        }
        if self.inline_pq.is_some() {
            set = set.with(FeatureId::InlinePq);
        }
        set
    }

    fn validate(&self, dimension: usize) -> Result<()> {
        if self.feature_set().is_empty() {
            return Err(IndexError::invalid("feature bundle selects nothing to store"));
        }
        for pq in [&self.fused_adc, &self.inline_pq].into_iter().flatten() {
            if pq.dimension() != dimension {
                return Err(IndexError::invalid(format!(
                    "quantizer dimension {} != vector dimension {dimension}",
                    pq.dimension()
                )));
            }
        }
        if let (Some(fused), Some(inline)) = (&self.fused_adc, &self.inline_pq)
            && !Arc::ptr_eq(fused, inline)
        {
            return Err(IndexError::invalid(
                "fused ADC and inline PQ must share one quantizer",
            ));
        }
        Ok(())
    }

    /// Any quantizer the bundle carries (fused takes precedence).
    fn quantizer(&self) -> Option<&Arc<ProductQuantizer>> {
        self.fused_adc.as_ref().or(self.inline_pq.as_ref())
    }
}

/// Counts and checksums everything written through it.
struct CrcWriter<W> {
    inner: W,
    hasher: crc32fast::Hasher,
    written: u64,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        CrcWriter {
            inner,
            hasher: crc32fast::Hasher::new(),
            written: 0,
        }
    }

    fn finalize(self) -> (u32, u64) {
        (self.hasher.finalize(), self.written)
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Sizes shared by the writer and reader; one place so they cannot drift.
pub(crate) struct RecordShape {
    pub dimension: usize,
    pub max_degree: usize,
    pub subspaces: usize,
    pub features: FeatureSet,
}

impl RecordShape {
    /// Byte offset of a feature's inline payload within a record, after the
    /// leading sanity ordinal.
    pub fn inline_offset(&self, feature: FeatureId) -> usize {
        let mut at = 4;
        for f in self.features.iter() {
            if f == feature {
                return at;
            }
            at += self.inline_payload_size(f);
        }
        at
    }

    fn inline_payload_size(&self, feature: FeatureId) -> usize {
        match feature {
            FeatureId::InlineVectors => self.dimension * 4,
            FeatureId::FusedAdc => self.subspaces * self.max_degree,
            FeatureId::InlinePq => self.subspaces,
            _ => 0,
        }
    }

    /// Offset of the neighbor-count integer within a record.
    pub fn neighbors_offset(&self) -> usize {
        4 + self
            .features
            .iter()
            .map(|f| self.inline_payload_size(f))
            .sum::<usize>()
    }

    /// Total record size: sanity ordinal, inline payloads, neighbor count,
    /// `max_degree` padded neighbor slots.
    pub fn record_size(&self) -> usize {
        self.neighbors_offset() + 4 + self.max_degree * 4
    }

    /// Per-node size of a separated feature's region entry.
    pub fn separated_entry_size(&self, feature: FeatureId) -> usize {
        match feature {
            FeatureId::SeparatedVectors => self.dimension * 4,
            _ => 0,
        }
    }
}

fn write_pq_header<W: Write>(out: &mut W, pq: &ProductQuantizer) -> Result<()> {
    out.write_u32::<BigEndian>(pq.subspace_count() as u32)?;
    for sub in pq.subspaces() {
        out.write_u32::<BigEndian>(sub.offset as u32)?;
        out.write_u32::<BigEndian>(sub.len as u32)?;
    }
    out.write_u32::<BigEndian>(pq.clusters() as u32)?;
    match pq.global_centroid() {
        Some(gc) => {
            out.write_u32::<BigEndian>(1)?;
            for &x in gc {
                out.write_f32::<BigEndian>(x)?;
            }
        }
        None => out.write_u32::<BigEndian>(0)?,
    }
    for &x in pq.codebook_tensor() {
        out.write_f32::<BigEndian>(x)?;
    }
    Ok(())
}

fn write_header<W: Write>(
    out: &mut W,
    size: u32,
    dimension: u32,
    entry: u32,
    max_degree: u32,
    bundle: &FeatureBundle,
) -> Result<()> {
    out.write_u32::<BigEndian>(MAGIC)?;
    out.write_u32::<BigEndian>(FORMAT_VERSION)?;
    out.write_u32::<BigEndian>(size)?;
    out.write_u32::<BigEndian>(dimension)?;
    out.write_u32::<BigEndian>(entry)?;
    out.write_u32::<BigEndian>(max_degree)?;
    out.write_u32::<BigEndian>(bundle.feature_set().bits())?;

    // per-feature headers, bitmap order
    for feature in bundle.feature_set().iter() {
        match feature {
            FeatureId::FusedAdc => {
                let pq = bundle.fused_adc.as_ref().expect("bitmap says fused adc");
                write_pq_header(out, pq)?;
            }
            FeatureId::InlinePq => {
                let pq = bundle.inline_pq.as_ref().expect("bitmap says inline pq");
                write_pq_header(out, pq)?;
            }
            // raw-vector features need nothing beyond the dimension
            _ => {}
        }
    }
    Ok(())
}

/// Serializes a completed graph.
///
/// Records land in new-ordinal order per `mapper`; neighbor lists are
/// renumbered through it too, so a freshly loaded index is contiguous even
/// when the build had deletion holes.
///
/// # Returns
/// The CRC32 of the written byte range (advisory; not embedded in the file).
pub fn write_graph<W: Write>(
    graph: &OnHeapGraph,
    store: &VectorStore,
    bundle: &FeatureBundle,
    mapper: &OrdinalMapper,
    out: &mut W,
) -> Result<u32> {
    let dimension = store.dimension();
    bundle.validate(dimension)?;

    let size = mapper.len();
    let max_degree = graph.max_degree();
    let features = bundle.feature_set();

    let entry_new = match graph.entry_point() {
        Some(e) => mapper.old_to_new(e)?,
        None if size == 0 => 0,
        None => {
            return Err(IndexError::invariant(
                "graph has nodes but no entry point; run cleanup first",
            ));
        }
    };

    // pre-encode every node once when any PQ feature is present
    let codes: Vec<Vec<u8>> = match bundle.quantizer() {
        Some(pq) => {
            let mut codes = Vec::with_capacity(size);
            for (_, old) in mapper.iter() {
                let vector = store
                    .get(old)
                    .ok_or_else(|| IndexError::invariant(format!("ordinal {old} has no vector")))?;
                codes.push(pq.encode(&vector)?);
            }
            codes
        }
        None => Vec::new(),
    };

    let mut out = CrcWriter::new(out);
    write_header(
        &mut out,
        size as u32,
        dimension as u32,
        entry_new,
        max_degree as u32,
        bundle,
    )?;

    let mut neighbor_buf: Vec<u32> = Vec::with_capacity(max_degree);
    let mut renumbered: Vec<u32> = Vec::with_capacity(max_degree);
    for (new, old) in mapper.iter() {
        out.write_u32::<BigEndian>(new)?;

        graph.neighbors_into(old, &mut neighbor_buf)?;
        renumbered.clear();
        for &n in &neighbor_buf {
            renumbered.push(mapper.old_to_new(n)?);
        }
        if renumbered.len() > max_degree {
            return Err(IndexError::invariant(format!(
                "node {old} has degree {} beyond the cap {max_degree}; run cleanup first",
                renumbered.len()
            )));
        }

        for feature in features.iter() {
            match feature {
                FeatureId::InlineVectors => {
                    let vector = store.get(old).ok_or_else(|| {
                        IndexError::invariant(format!("ordinal {old} has no vector"))
                    })?;
                    for &x in vector.iter() {
                        out.write_f32::<BigEndian>(x)?;
                    }
                }
                FeatureId::FusedAdc => {
                    // transposed: row s holds the subspace-s code byte of
                    // every out-edge, padded with zeros past the true degree
                    let subspaces = bundle
                        .fused_adc
                        .as_ref()
                        .map(|pq| pq.subspace_count())
                        .unwrap_or(0);
                    for s in 0..subspaces {
                        for e in 0..max_degree {
                            let byte = renumbered
                                .get(e)
                                .map(|&n| codes[n as usize][s])
                                .unwrap_or(0);
                            out.write_u8(byte)?;
                        }
                    }
                }
                FeatureId::InlinePq => {
                    out.write_all(&codes[new as usize])?;
                }
                _ => {}
            }
        }

        out.write_u32::<BigEndian>(renumbered.len() as u32)?;
        for e in 0..max_degree {
            match renumbered.get(e) {
                Some(&n) => out.write_i32::<BigEndian>(n as i32)?,
                None => out.write_i32::<BigEndian>(-1)?,
            }
        }
    }

    // separated regions, bitmap order, addressed base + ordinal * entry_size
    for feature in features.iter() {
        if feature == FeatureId::SeparatedVectors {
            for (_, old) in mapper.iter() {
                let vector = store
                    .get(old)
                    .ok_or_else(|| IndexError::invariant(format!("ordinal {old} has no vector")))?;
                for &x in vector.iter() {
                    out.write_f32::<BigEndian>(x)?;
                }
            }
        }
    }

    out.flush()?;
    let (crc, written) = out.finalize();
    info!(bytes = written, nodes = size, crc, "index written");
    Ok(crc)
}

impl OnHeapGraph {
    /// Method form of [`write_graph`], for callers holding the graph.
    pub fn write_to<W: Write>(
        &self,
        store: &VectorStore,
        bundle: &FeatureBundle,
        mapper: &OrdinalMapper,
        out: &mut W,
    ) -> Result<u32> {
        write_graph(self, store, bundle, mapper, out)
    }
}

/// Streaming writer for builds whose vectors do not all fit in memory at
/// once: inline payloads are written per node as they become available, and
/// a final pass lays down the adjacency.
///
/// Fused ADC is not available here: its blocks need every neighbor's code,
/// which only exists once the graph is final; use [`write_graph`] for that.
pub struct IncrementalWriter<F: Read + Write + Seek> {
    file: F,
    shape: RecordShape,
    size: usize,
    records_base: u64,
    inline_pq: Option<Arc<ProductQuantizer>>,
    written: DenseVisited,
}

impl<F: Read + Write + Seek> IncrementalWriter<F> {
    /// Writes the header (with a placeholder entry point) and prepares the
    /// record geometry. `size` must be the final node count.
    pub fn new(
        mut file: F,
        size: usize,
        dimension: usize,
        max_degree: usize,
        bundle: FeatureBundle,
    ) -> Result<Self> {
        bundle.validate(dimension)?;
        if bundle.fused_adc.is_some() {
            return Err(IndexError::invalid(
                "fused ADC requires the one-shot writer; neighbor codes do not exist yet",
            ));
        }

        write_header(
            &mut file,
            size as u32,
            dimension as u32,
            0,
            max_degree as u32,
            &bundle,
        )?;
        let records_base = file.stream_position()?;

        let shape = RecordShape {
            dimension,
            max_degree,
            subspaces: bundle
                .inline_pq
                .as_ref()
                .map(|pq| pq.subspace_count())
                .unwrap_or(0),
            features: bundle.feature_set(),
        };

        Ok(IncrementalWriter {
            file,
            shape,
            size,
            records_base,
            inline_pq: bundle.inline_pq,
            written: DenseVisited::new(size),
        })
    }

    fn record_offset(&self, new_ordinal: u32) -> u64 {
        self.records_base + new_ordinal as u64 * self.shape.record_size() as u64
    }

    /// Writes the inline payloads (and the sanity ordinal) of one node.
    /// Nodes may arrive in any order, each exactly once.
    pub fn put_vector(&mut self, new_ordinal: u32, vector: &[f32]) -> Result<()> {
        if (new_ordinal as usize) >= self.size {
            return Err(IndexError::invalid(format!(
                "ordinal {new_ordinal} outside 0..{}",
                self.size
            )));
        }
        if vector.len() != self.shape.dimension {
            return Err(IndexError::invalid("vector dimension mismatch"));
        }
        if self.written.contains(new_ordinal) {
            return Err(IndexError::invariant(format!(
                "ordinal {new_ordinal} was already written"
            )));
        }

        self.file.seek(SeekFrom::Start(self.record_offset(new_ordinal)))?;
        self.file.write_u32::<BigEndian>(new_ordinal)?;
        for feature in self.shape.features.iter() {
            match feature {
                FeatureId::InlineVectors => {
                    for &x in vector {
                        self.file.write_f32::<BigEndian>(x)?;
                    }
                }
                FeatureId::InlinePq => {
                    let pq = self.inline_pq.as_ref().expect("bitmap says inline pq");
                    self.file.write_all(&pq.encode(vector)?)?;
                }
                _ => {}
            }
        }

        if self.shape.features.contains(FeatureId::SeparatedVectors) {
            let entry = self.shape.separated_entry_size(FeatureId::SeparatedVectors) as u64;
            let base = self.records_base
                + self.size as u64 * self.shape.record_size() as u64
                + new_ordinal as u64 * entry;
            self.file.seek(SeekFrom::Start(base))?;
            for &x in vector {
                self.file.write_f32::<BigEndian>(x)?;
            }
        }

        self.written.insert(new_ordinal);
        Ok(())
    }

    /// Final pass: writes every node's adjacency, patches the entry point,
    /// and checksums the full range.
    ///
    /// # Returns
    /// The CRC32 of the complete written range.
    pub fn finish(
        mut self,
        graph: &OnHeapGraph,
        mapper: &OrdinalMapper,
    ) -> Result<u32> {
        if mapper.len() != self.size {
            return Err(IndexError::invariant(format!(
                "mapper covers {} ordinals, writer sized for {}",
                mapper.len(),
                self.size
            )));
        }
        for new in 0..self.size as u32 {
            if !self.written.contains(new) {
                return Err(IndexError::invariant(format!(
                    "ordinal {new} never received its vector"
                )));
            }
        }

        let max_degree = self.shape.max_degree;
        let mut neighbor_buf: Vec<u32> = Vec::with_capacity(max_degree);
        for (new, old) in mapper.iter() {
            graph.neighbors_into(old, &mut neighbor_buf)?;
            if neighbor_buf.len() > max_degree {
                return Err(IndexError::invariant(format!(
                    "node {old} has degree {} beyond the cap {max_degree}",
                    neighbor_buf.len()
                )));
            }
            let at = self.record_offset(new) + self.shape.neighbors_offset() as u64;
            self.file.seek(SeekFrom::Start(at))?;
            self.file.write_u32::<BigEndian>(neighbor_buf.len() as u32)?;
            for e in 0..max_degree {
                match neighbor_buf.get(e) {
                    Some(&n) => self.file.write_i32::<BigEndian>(mapper.old_to_new(n)? as i32)?,
                    None => self.file.write_i32::<BigEndian>(-1)?,
                }
            }
        }

        // patch the entry point (offset 16: magic, version, size, dimension)
        let entry_new = match graph.entry_point() {
            Some(e) => mapper.old_to_new(e)?,
            None => 0,
        };
        self.file.seek(SeekFrom::Start(16))?;
        self.file.write_u32::<BigEndian>(entry_new)?;

        // checksum the complete range by re-reading it
        self.file.flush()?;
        let end = self.file.seek(SeekFrom::End(0))?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = [0u8; 64 * 1024];
        let mut remaining = end;
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = self.file.read(&mut buf[..want])?;
            if n == 0 {
                return Err(IndexError::format("file shrank during checksum pass"));
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(hasher.finalize())
    }
}
