//! Block identifiers and block containers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The hash assigned to the "genesis predecessor" position, i.e. the state
/// of a pipeline that has not committed any block yet.
pub const GENESIS_PARENT_HASH: &str = "0x";

/// Identifies a block position in a chain.
///
/// The pair `(height = -1, hash = "0x")` is the genesis-predecessor
/// sentinel; every real block has `height >= 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashAndHeight {
    /// Block height, `-1` for the genesis predecessor.
    pub height: i64,
    /// Block hash, opaque to the pipeline.
    pub hash: String,
}

impl HashAndHeight {
    /// Creates a new [`HashAndHeight`].
    pub fn new(height: i64, hash: impl Into<String>) -> Self {
        Self { height, hash: hash.into() }
    }

    /// Returns the genesis-predecessor sentinel.
    pub fn genesis_parent() -> Self {
        Self { height: -1, hash: GENESIS_PARENT_HASH.to_string() }
    }
}

impl std::fmt::Display for HashAndHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = self.hash.strip_prefix("0x").unwrap_or(&self.hash);
        let short = &short[..short.len().min(8)];
        write!(f, "{}#{short}", self.height)
    }
}

/// Header of a decoded block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height.
    pub height: i64,
    /// Block hash.
    pub hash: String,
    /// Hash of the parent block.
    pub parent_hash: String,
}

impl BlockHeader {
    /// Creates a new [`BlockHeader`].
    pub fn new(height: i64, hash: impl Into<String>, parent_hash: impl Into<String>) -> Self {
        Self { height, hash: hash.into(), parent_hash: parent_hash.into() }
    }

    /// The position this header occupies in the chain.
    pub fn block_ref(&self) -> HashAndHeight {
        HashAndHeight { height: self.height, hash: self.hash.clone() }
    }

    /// The position of this header's parent.
    pub fn parent_ref(&self) -> HashAndHeight {
        HashAndHeight { height: self.height - 1, hash: self.parent_hash.clone() }
    }
}

/// A decoded block: a header plus an ordered sequence of opaque entities
/// produced by the chain-specific mapping layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block<I> {
    /// Block header.
    pub header: BlockHeader,
    /// Decoded entities, opaque to the pipeline core.
    pub items: Vec<I>,
}

impl<I> Block<I> {
    /// Creates a new [`Block`].
    pub const fn new(header: BlockHeader, items: Vec<I>) -> Self {
        Self { header, items }
    }
}

/// Chain continuity violation: a sequence of block positions does not form
/// a contiguous height run on top of its base.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("blocks must form a continuous chain: expected height {expected}, got {got}")]
pub struct ContinuityError {
    /// The height the chain required at this position.
    pub expected: i64,
    /// The height actually found.
    pub got: i64,
}

/// Asserts that `chain` is a contiguous run of heights starting right above
/// `base`. Hash linkage is checked separately where parent hashes are
/// available.
pub fn assert_chain_continuity<'a>(
    base: &HashAndHeight,
    chain: impl IntoIterator<Item = &'a HashAndHeight>,
) -> Result<(), ContinuityError> {
    let mut prev = base.height;
    for block in chain {
        if block.height != prev + 1 {
            return Err(ContinuityError { expected: prev + 1, got: block.height });
        }
        prev = block.height;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_shortens_hash() {
        let head = HashAndHeight::new(42, "0xdeadbeefcafe");
        assert_eq!(head.to_string(), "42#deadbeef");
        assert_eq!(HashAndHeight::genesis_parent().to_string(), "-1#");
    }

    #[test]
    fn header_refs() {
        let header = BlockHeader::new(7, "0xb", "0xa");
        assert_eq!(header.block_ref(), HashAndHeight::new(7, "0xb"));
        assert_eq!(header.parent_ref(), HashAndHeight::new(6, "0xa"));
    }

    #[test]
    fn continuity_detects_gaps() {
        let base = HashAndHeight::new(10, "0xa");
        let chain = [HashAndHeight::new(11, "0xb"), HashAndHeight::new(12, "0xc")];
        assert!(assert_chain_continuity(&base, &chain).is_ok());

        let gapped = [HashAndHeight::new(11, "0xb"), HashAndHeight::new(13, "0xd")];
        let err = assert_chain_continuity(&base, &gapped).unwrap_err();
        assert_eq!(err, ContinuityError { expected: 12, got: 13 });
    }
}
