//! Scan ranges.

use serde::{Deserialize, Serialize};

/// A half-open scan range: `to = None` means "follow the chain tip".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    /// First height of the range (inclusive).
    pub from: i64,
    /// Last height of the range (inclusive), unbounded when `None`.
    pub to: Option<i64>,
}

impl BlockRange {
    /// Creates a bounded range `[from, to]`.
    pub const fn new(from: i64, to: i64) -> Self {
        Self { from, to: Some(to) }
    }

    /// Creates an open-ended range `[from, ..]`.
    pub const fn open(from: i64) -> Self {
        Self { from, to: None }
    }

    /// The inclusive end of the range; `i64::MAX` stands in for "the chain
    /// tip, forever".
    pub const fn end(&self) -> i64 {
        match self.to {
            Some(to) => to,
            None => i64::MAX,
        }
    }

    /// Whether `height` falls within the range.
    pub const fn contains(&self, height: i64) -> bool {
        self.from <= height && height <= self.end()
    }
}

/// A fully scanned range `[from, to]`, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedRange {
    /// First scanned height.
    pub from: i64,
    /// Last scanned height.
    pub to: i64,
}

impl ClosedRange {
    /// Creates a new [`ClosedRange`].
    pub const fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }
}
