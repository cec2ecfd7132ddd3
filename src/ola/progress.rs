//! Progress reporting for async aggregation.
//!
//! Each fan-out node owns a [`ProgressTracker`]. Whenever a leaf or
//! combiner of its subtree completes, the tracker folds the new partial
//! into its frontier (dropping entries the newcomer already covers) and
//! hands the refreshed estimate to the caller's [`ProgressListener`].

use std::sync::Arc;

use parking_lot::Mutex;

use super::estimate::FinalizedAggregate;
use super::partial::PartialSnapshot;
use super::subtree::AggregateLayout;
use crate::error::AqpError;
use crate::plan::NodeId;

/// An intermediate (or final) estimate of one async aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// The fan-out node the estimate belongs to.
    pub node: NodeId,
    pub estimate: FinalizedAggregate,
}

impl ProgressUpdate {
    pub fn fraction(&self) -> f64 {
        self.estimate.fraction()
    }

    pub fn is_final(&self) -> bool {
        self.estimate.is_complete()
    }
}

/// Receives estimates as an async aggregate converges. Called from
/// executor threads.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressUpdate) + Send + Sync,
{
    fn on_progress(&self, update: &ProgressUpdate) {
        self(update)
    }
}

pub struct ProgressTracker {
    node: NodeId,
    layout: Arc<AggregateLayout>,
    z: f64,
    frontier: Mutex<Vec<Arc<PartialSnapshot>>>,
}

impl ProgressTracker {
    pub fn new(node: NodeId, layout: Arc<AggregateLayout>, z: f64) -> Self {
        ProgressTracker {
            node,
            layout,
            z,
            frontier: Mutex::new(Vec::new()),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Fold a completed partial into the frontier and return the estimate
    /// over everything seen so far.
    ///
    /// A combiner's output replaces the outputs of the inputs it merged.
    /// A snapshot that partly overlaps the frontier is rejected.
    pub fn record(&self, snapshot: Arc<PartialSnapshot>) -> Result<ProgressUpdate, AqpError> {
        let mut frontier = self.frontier.lock();
        if frontier.iter().any(|s| s.covers(&snapshot)) {
            return Err(AqpError::InternalError(format!(
                "{} reported blocks {:?} twice",
                self.node,
                snapshot.coverage()
            )));
        }
        frontier.retain(|s| !snapshot.covers(s));
        if frontier.iter().any(|s| s.overlaps(&snapshot)) {
            return Err(AqpError::InternalError(format!(
                "{} received overlapping partials",
                self.node
            )));
        }
        frontier.push(snapshot);
        let merged = PartialSnapshot::merged(frontier.iter().map(Arc::as_ref))?;
        drop(frontier);

        Ok(ProgressUpdate {
            node: self.node,
            estimate: self.layout.finalize(&merged, self.z),
        })
    }

    pub fn covered_blocks(&self) -> u32 {
        self.frontier.lock().iter().map(|s| s.covered_blocks()).sum()
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("node", &self.node)
            .field("covered_blocks", &self.covered_blocks())
            .finish()
    }
}
