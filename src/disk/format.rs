use crate::error::{IndexError, Result};

/// First four bytes of a current-format index file. Files that do not start
/// with this are legacy headerless files whose first integer is the node
/// count.
pub const MAGIC: u32 = 0xFFFF_0D61;

/// The version this crate writes.
pub const FORMAT_VERSION: u32 = 3;

/// The legacy headerless version the reader still accepts.
pub const LEGACY_VERSION: u32 = 2;

/// Per-node payloads an index file may carry.
///
/// The discriminants are bit positions in the on-disk feature bitmap and are
/// frozen: append new features, never reorder. Inline features live inside
/// each node record (in this order); separated features occupy contiguous
/// regions after the adjacency section.
///
/// `NvqVectors`, `SeparatedNvq` and `Lvq` are recognized so their bits stay
/// reserved, but this crate does not read their payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FeatureId {
    /// Full-precision f32 vector inside each node record.
    InlineVectors = 0,
    /// Transposed PQ codes of each node's out-neighbors (fused ADC).
    FusedAdc = 1,
    /// NVQ-packed vector inline (reserved, unsupported).
    NvqVectors = 2,
    /// Full-precision f32 vectors in a separated tail region.
    SeparatedVectors = 3,
    /// NVQ-packed vectors in a separated region (reserved, unsupported).
    SeparatedNvq = 4,
    /// The node's own PQ code inside its record.
    InlinePq = 5,
    /// LVQ-packed vector inline (reserved, unsupported).
    Lvq = 6,
}

impl FeatureId {
    /// Every known feature, in bitmap order.
    pub const ALL: [FeatureId; 7] = [
        FeatureId::InlineVectors,
        FeatureId::FusedAdc,
        FeatureId::NvqVectors,
        FeatureId::SeparatedVectors,
        FeatureId::SeparatedNvq,
        FeatureId::InlinePq,
        FeatureId::Lvq,
    ];

    /// This feature's bit in the bitmap.
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Whether this crate can read the feature's payload.
    pub fn supported(self) -> bool {
        !matches!(
            self,
            FeatureId::NvqVectors | FeatureId::SeparatedNvq | FeatureId::Lvq
        )
    }
}

/// The set of features present in an index file, as a bitmap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet(u32);

impl FeatureSet {
    pub fn empty() -> Self {
        FeatureSet(0)
    }

    /// Adds a feature (builder style).
    pub fn with(self, feature: FeatureId) -> Self {
        FeatureSet(self.0 | feature.bit())
    }

    pub fn contains(self, feature: FeatureId) -> bool {
        self.0 & feature.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The raw bitmap, as written to disk.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Parses a bitmap read from disk.
    ///
    /// # Errors
    /// `Format` when a bit outside the known catalog is set, or when a set
    /// bit names a feature whose payload this crate cannot read.
    pub fn from_bits(bits: u32) -> Result<Self> {
        let known: u32 = FeatureId::ALL.iter().map(|f| f.bit()).sum();
        if bits & !known != 0 {
            return Err(IndexError::format(format!(
                "feature bitmap {bits:#x} has unknown bits {:#x}",
                bits & !known
            )));
        }
        let set = FeatureSet(bits);
        for f in FeatureId::ALL {
            if set.contains(f) && !f.supported() {
                return Err(IndexError::format(format!(
                    "feature {f:?} is recognized but not supported by this reader"
                )));
            }
        }
        Ok(set)
    }

    /// Present features, in bitmap (i.e. record layout) order.
    pub fn iter(self) -> impl Iterator<Item = FeatureId> {
        FeatureId::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}
