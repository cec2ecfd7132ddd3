//! Online (progressive) aggregation over scrambles.
//!
//! - [`partial`]: mergeable per-group aggregate states and block coverage.
//! - [`subtree`]: decomposition of an eligible query into leaves,
//!   combiners and a fan-out node.
//! - [`estimate`]: scaling a partial into an estimate of the full answer.
//! - [`progress`]: intermediate estimates as leaves complete.

pub mod estimate;
pub mod partial;
pub mod progress;
pub mod subtree;

pub use estimate::{FinalizedAggregate, finalize};
pub use partial::{BlockRange, PartialSnapshot, PartialState};
pub use progress::{ProgressListener, ProgressTracker, ProgressUpdate};
pub use subtree::{
    AggregateCall, AggregateLayout, OutputColumn, OutputSource, ScrambleSource,
    build_async_subtree, plan_block_ranges,
};
