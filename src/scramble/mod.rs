//! Scrambled tables: sampled replicas of base tables.
//!
//! A scramble copies (a sample of) a source table and tags every row with
//! three generated columns: an aggregation-block id in `[0, block_count)`,
//! a subsample id in `[0, subsample_count)` and a tier (constant 1 on
//! initial construction). Progressive aggregation scans a scramble block
//! range by block range.
//!
//! - [`ScrambleSpec`] describes one scramble request and validates it
//!   before any DDL is issued.
//! - [`builder`] renders the CREATE TABLE AS SELECT and runs it.
//! - [`meta`] records what was built so the planner can find it.

pub mod builder;
pub mod meta;

use serde::{Deserialize, Serialize};

use crate::error::AqpError;

pub use builder::{CreateScrambleStatement, ScrambleBuilder, build_create_statement, compute_block_count};
pub use meta::{ScrambleMeta, ScrambleMetaSet};

/// Rows per aggregation block when the request does not say otherwise.
pub const DEFAULT_BLOCK_SIZE: i64 = 1_000_000;

/// How rows are assigned to aggregation blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrambleMethod {
    /// Uniformly random block per row.
    Uniform,
    /// Block chosen by hashing a column, so equal values share a block.
    Hash,
    /// Priority-ordered blocks for faster convergence.
    FastConverge,
}

impl ScrambleMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrambleMethod::Uniform => "uniform",
            ScrambleMethod::Hash => "hash",
            ScrambleMethod::FastConverge => "fastconverge",
        }
    }

    /// Parse a method name (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, AqpError> {
        match s.to_ascii_lowercase().as_str() {
            "uniform" => Ok(ScrambleMethod::Uniform),
            "hash" => Ok(ScrambleMethod::Hash),
            "fastconverge" => Ok(ScrambleMethod::FastConverge),
            _ => Err(AqpError::UnsupportedScrambleMethod(s.to_string())),
        }
    }
}

/// A scramble request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrambleSpec {
    pub new_schema: String,
    pub new_table: String,
    pub original_schema: String,
    pub original_table: String,
    /// Method name as requested; checked by [`ScrambleSpec::validate`].
    pub method: String,
    /// Fraction of source rows kept, in `(0, 1]`.
    pub size: f64,
    /// Target rows per block. Must be non-zero; the sign is ignored.
    pub block_size: i64,
    /// Column hashed by the `hash` method.
    pub hash_column: Option<String>,
}

impl ScrambleSpec {
    /// A full-size uniform scramble with the default block size.
    pub fn new(original_schema: &str, original_table: &str, new_schema: &str, new_table: &str) -> Self {
        ScrambleSpec {
            new_schema: new_schema.to_string(),
            new_table: new_table.to_string(),
            original_schema: original_schema.to_string(),
            original_table: original_table.to_string(),
            method: ScrambleMethod::Uniform.as_str().to_string(),
            size: 1.0,
            block_size: DEFAULT_BLOCK_SIZE,
            hash_column: None,
        }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    pub fn with_size(mut self, size: f64) -> Self {
        self.size = size;
        self
    }

    pub fn with_block_size(mut self, block_size: i64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_hash_column(mut self, column: &str) -> Self {
        self.hash_column = Some(column.to_string());
        self
    }

    /// Check the request and return its parsed method.
    ///
    /// Runs before any statement reaches the backend.
    pub fn validate(&self) -> Result<ScrambleMethod, AqpError> {
        let method = ScrambleMethod::from_str(&self.method)?;

        for (name, value) in [
            ("new schema", &self.new_schema),
            ("new table", &self.new_table),
            ("original schema", &self.original_schema),
            ("original table", &self.original_table),
        ] {
            if value.trim().is_empty() {
                return Err(AqpError::InvalidScramble(format!("{name} must not be empty")));
            }
        }

        if method == ScrambleMethod::Hash
            && self.hash_column.as_deref().is_none_or(|c| c.trim().is_empty())
        {
            return Err(AqpError::InvalidScramble(
                "hash scrambling requires a hash column".into(),
            ));
        }

        // NaN fails both comparisons and is rejected too.
        if !(self.size > 0.0 && self.size <= 1.0) {
            return Err(AqpError::InvalidScramble(format!(
                "size must be in (0, 1], got {}",
                self.size
            )));
        }

        if self.block_size == 0 {
            return Err(AqpError::InvalidScramble(
                "block size must not be zero".into(),
            ));
        }

        Ok(method)
    }
}
