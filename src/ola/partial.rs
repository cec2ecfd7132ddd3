//! Mergeable partial aggregates.
//!
//! Every supported aggregate decomposes into a small state that merges
//! associatively: counts add, sums add, min/max keep the extreme. A
//! [`PartialSnapshot`] holds one state vector per group together with the
//! block ranges of the scramble it has seen, so the fraction of data
//! processed is always known.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::subtree::AggregateLayout;
use crate::connection::{QueryResult, Value};
use crate::error::AqpError;
use crate::sql::AggFunc;

/// Half-open range `[start, end)` of aggregation-block ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u32,
    pub end: u32,
}

impl BlockRange {
    pub fn new(start: u32, end: u32) -> Self {
        BlockRange { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &BlockRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, other: &BlockRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Running state of one aggregate within one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartialState {
    Count { count: u64 },
    Sum { sum: f64, count: u64 },
    /// First and second moments, enough for avg, variance and stddev.
    Moments { sum: f64, sum_sq: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl PartialState {
    /// The identity state for `func`.
    pub fn empty(func: AggFunc) -> Self {
        match func {
            AggFunc::Count => PartialState::Count { count: 0 },
            AggFunc::Sum => PartialState::Sum { sum: 0.0, count: 0 },
            AggFunc::Avg | AggFunc::Variance | AggFunc::Stddev => PartialState::Moments {
                sum: 0.0,
                sum_sq: 0.0,
                count: 0,
            },
            AggFunc::Min => PartialState::Min(None),
            AggFunc::Max => PartialState::Max(None),
        }
    }

    /// Read a state from the partial columns a leaf query returns for
    /// `func`, in the order the leaf query lists them.
    pub fn from_cells(func: AggFunc, cells: &[Value]) -> Result<Self, AqpError> {
        if cells.len() != func.partial_width() {
            return Err(AqpError::InternalError(format!(
                "{} expects {} partial columns, got {}",
                func.as_str(),
                func.partial_width(),
                cells.len()
            )));
        }
        let num = |v: &Value| v.as_f64().unwrap_or(0.0);
        let cnt = |v: &Value| v.as_i64().map_or(0, |c| c.max(0) as u64);
        let extreme = |v: &Value| (!v.is_null()).then(|| v.clone());
        Ok(match func {
            AggFunc::Count => PartialState::Count { count: cnt(&cells[0]) },
            AggFunc::Sum => PartialState::Sum {
                sum: num(&cells[0]),
                count: cnt(&cells[1]),
            },
            AggFunc::Avg | AggFunc::Variance | AggFunc::Stddev => PartialState::Moments {
                sum: num(&cells[0]),
                sum_sq: num(&cells[1]),
                count: cnt(&cells[2]),
            },
            AggFunc::Min => PartialState::Min(extreme(&cells[0])),
            AggFunc::Max => PartialState::Max(extreme(&cells[0])),
        })
    }

    /// Fold `other` into `self`. Both must be states of the same aggregate.
    pub fn merge(&mut self, other: &PartialState) -> Result<(), AqpError> {
        match (self, other) {
            (PartialState::Count { count }, PartialState::Count { count: c }) => *count += c,
            (PartialState::Sum { sum, count }, PartialState::Sum { sum: s, count: c }) => {
                *sum += s;
                *count += c;
            }
            (
                PartialState::Moments { sum, sum_sq, count },
                PartialState::Moments {
                    sum: s,
                    sum_sq: q,
                    count: c,
                },
            ) => {
                *sum += s;
                *sum_sq += q;
                *count += c;
            }
            (PartialState::Min(a), PartialState::Min(b)) => {
                if let Some(b) = b
                    && a.as_ref().is_none_or(|a| b < a)
                {
                    *a = Some(b.clone());
                }
            }
            (PartialState::Max(a), PartialState::Max(b)) => {
                if let Some(b) = b
                    && a.as_ref().is_none_or(|a| b > a)
                {
                    *a = Some(b.clone());
                }
            }
            (a, b) => {
                return Err(AqpError::InternalError(format!(
                    "cannot merge partial states {a:?} and {b:?}"
                )));
            }
        }
        Ok(())
    }

    /// Number of non-null input rows seen, where the state tracks it.
    pub fn count(&self) -> Option<u64> {
        match self {
            PartialState::Count { count }
            | PartialState::Sum { count, .. }
            | PartialState::Moments { count, .. } => Some(*count),
            PartialState::Min(_) | PartialState::Max(_) => None,
        }
    }

    pub fn mean(&self) -> Option<f64> {
        match self {
            PartialState::Sum { sum, count } | PartialState::Moments { sum, count, .. }
                if *count > 0 =>
            {
                Some(sum / *count as f64)
            }
            _ => None,
        }
    }

    /// Sample variance, defined from two rows on.
    pub fn sample_variance(&self) -> Option<f64> {
        match self {
            PartialState::Moments { sum, sum_sq, count } if *count >= 2 => {
                let n = *count as f64;
                Some(((sum_sq - sum * sum / n) / (n - 1.0)).max(0.0))
            }
            _ => None,
        }
    }
}

/// Merged partial aggregate over a set of block ranges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialSnapshot {
    /// Disjoint, sorted and coalesced.
    coverage: Vec<BlockRange>,
    groups: BTreeMap<Vec<Value>, Vec<PartialState>>,
}

impl PartialSnapshot {
    /// An empty aggregate that has seen `blocks`.
    pub fn new(blocks: BlockRange) -> Self {
        let mut snapshot = PartialSnapshot::default();
        if !blocks.is_empty() {
            snapshot.coverage.push(blocks);
        }
        snapshot
    }

    /// Decode the rows a leaf query returned for `blocks`.
    ///
    /// Each row carries the group values first, then the partial columns of
    /// every aggregate in layout order.
    pub fn from_leaf_result(
        layout: &AggregateLayout,
        blocks: BlockRange,
        result: &QueryResult,
    ) -> Result<Self, AqpError> {
        let groups = layout.group_by.len();
        let width = groups + layout.partial_width();
        let mut snapshot = PartialSnapshot::new(blocks);
        for row in &result.rows {
            if row.len() != width {
                return Err(AqpError::Backend(format!(
                    "leaf query returned {} columns, expected {width}",
                    row.len()
                )));
            }
            let key = row[..groups].to_vec();
            let mut offset = groups;
            let mut states = Vec::with_capacity(layout.aggregates.len());
            for call in &layout.aggregates {
                let w = call.func.partial_width();
                states.push(PartialState::from_cells(call.func, &row[offset..offset + w])?);
                offset += w;
            }
            snapshot.insert(key, states)?;
        }
        Ok(snapshot)
    }

    pub fn coverage(&self) -> &[BlockRange] {
        &self.coverage
    }

    pub fn covered_blocks(&self) -> u32 {
        self.coverage.iter().map(BlockRange::len).sum()
    }

    pub fn groups(&self) -> &BTreeMap<Vec<Value>, Vec<PartialState>> {
        &self.groups
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Add the states of one group, merging with what is already there.
    pub fn insert(&mut self, key: Vec<Value>, states: Vec<PartialState>) -> Result<(), AqpError> {
        match self.groups.get_mut(&key) {
            Some(existing) => {
                if existing.len() != states.len() {
                    return Err(AqpError::InternalError(format!(
                        "group has {} aggregates, merging {}",
                        existing.len(),
                        states.len()
                    )));
                }
                for (a, b) in existing.iter_mut().zip(&states) {
                    a.merge(b)?;
                }
            }
            None => {
                self.groups.insert(key, states);
            }
        }
        Ok(())
    }

    /// Whether any block is covered by both snapshots.
    pub fn overlaps(&self, other: &PartialSnapshot) -> bool {
        self.coverage
            .iter()
            .any(|a| other.coverage.iter().any(|b| a.overlaps(b)))
    }

    /// Whether every block of `other` is covered by `self`.
    pub fn covers(&self, other: &PartialSnapshot) -> bool {
        other
            .coverage
            .iter()
            .all(|b| self.coverage.iter().any(|a| a.contains(b)))
    }

    /// Merge a snapshot over disjoint blocks into this one.
    pub fn merge(&mut self, other: &PartialSnapshot) -> Result<(), AqpError> {
        if self.overlaps(other) {
            return Err(AqpError::InternalError(format!(
                "partial aggregates overlap: {:?} and {:?}",
                self.coverage, other.coverage
            )));
        }
        for (key, states) in &other.groups {
            self.insert(key.clone(), states.clone())?;
        }
        self.coverage.extend(other.coverage.iter().copied());
        self.coverage.sort();
        let mut coalesced: Vec<BlockRange> = Vec::with_capacity(self.coverage.len());
        for r in self.coverage.drain(..) {
            match coalesced.last_mut() {
                Some(last) if last.end == r.start => last.end = r.end,
                _ => coalesced.push(r),
            }
        }
        self.coverage = coalesced;
        Ok(())
    }

    /// Merge any number of disjoint snapshots.
    pub fn merged<'a>(
        parts: impl IntoIterator<Item = &'a PartialSnapshot>,
    ) -> Result<PartialSnapshot, AqpError> {
        let mut acc = PartialSnapshot::default();
        for part in parts {
            acc.merge(part)?;
        }
        Ok(acc)
    }
}
