//! Core data model shared by every stage of the trawler pipeline: block
//! identifiers, block containers, scan ranges, and batch request/response
//! shapes.

mod block;
pub use block::{
    Block, BlockHeader, ContinuityError, GENESIS_PARENT_HASH, HashAndHeight,
    assert_chain_continuity,
};

mod range;
pub use range::{BlockRange, ClosedRange};

mod batch;
pub use batch::{BatchRequest, BatchResponse, apply_range_bound};
