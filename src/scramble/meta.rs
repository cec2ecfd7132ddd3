//! Registry of built scrambles.
//!
//! The planner consults a [`ScrambleMetaSet`] to decide whether an
//! aggregate over a base table can be answered progressively from a
//! scramble. Entries serialize to JSON so callers can persist them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ScrambleMethod;
use crate::error::AqpError;

/// What a scramble table contains and how its rows are tagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrambleMeta {
    pub schema: String,
    pub table: String,
    pub original_schema: String,
    pub original_table: String,
    pub method: ScrambleMethod,
    pub block_column: String,
    pub block_count: u32,
    pub subsample_column: String,
    pub tier_column: String,
    /// Fraction of source rows kept.
    pub sample_ratio: f64,
    pub created_at: DateTime<Utc>,
}

impl ScrambleMeta {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    pub fn to_json(&self) -> Result<String, AqpError> {
        serde_json::to_string(self)
            .map_err(|e| AqpError::InternalError(format!("cannot encode scramble meta: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self, AqpError> {
        serde_json::from_str(json)
            .map_err(|e| AqpError::InvalidArgument(format!("invalid scramble meta JSON: {e}")))
    }
}

/// Scrambles known to the planner, keyed by original table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrambleMetaSet {
    metas: Vec<ScrambleMeta>,
}

impl ScrambleMetaSet {
    pub fn new() -> Self {
        ScrambleMetaSet::default()
    }

    /// Register a scramble, replacing any earlier one for the same
    /// original table.
    pub fn add(&mut self, meta: ScrambleMeta) {
        self.metas.retain(|m| {
            !(m.original_schema == meta.original_schema && m.original_table == meta.original_table)
        });
        self.metas.push(meta);
    }

    /// Find the scramble of an original table. With `schema = None` the
    /// table name alone must be unambiguous.
    pub fn lookup(&self, schema: Option<&str>, table: &str) -> Option<&ScrambleMeta> {
        let mut matches = self.metas.iter().filter(|m| {
            m.original_table == table && schema.is_none_or(|s| m.original_schema == s)
        });
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Whether `schema.table` is itself a scramble table.
    pub fn is_scramble(&self, schema: &str, table: &str) -> bool {
        self.metas
            .iter()
            .any(|m| m.schema == schema && m.table == table)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScrambleMeta> {
        self.metas.iter()
    }

    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    pub fn to_json(&self) -> Result<String, AqpError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| AqpError::InternalError(format!("cannot encode scramble set: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self, AqpError> {
        serde_json::from_str(json)
            .map_err(|e| AqpError::InvalidArgument(format!("invalid scramble set JSON: {e}")))
    }
}
