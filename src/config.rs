//! Configuration settings for approxql.
//!
//! Settings are plain struct fields with serde defaults so they can be
//! loaded from a TOML document or built in code. Every field has a
//! documented default; [`AqpConfig::validate`] rejects out-of-range values
//! before any planning starts.

use serde::{Deserialize, Serialize};

use crate::error::AqpError;

/// How concurrently executing nodes share the backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionDiscipline {
    /// One connection guarded by a mutex; statements are issued one at a time.
    #[default]
    Serialized,
    /// Every executing node obtains its own clone via `copy()`.
    ClonePerBranch,
}

impl ConnectionDiscipline {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionDiscipline::Serialized => "serialized",
            ConnectionDiscipline::ClonePerBranch => "clone_per_branch",
        }
    }
}

/// Planner and executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AqpConfig {
    /// Schema in which intermediate temporary tables are created.
    pub scratch_schema: String,

    /// Name prefix of intermediate temporary tables.
    pub temp_table_prefix: String,

    /// Aggregation-block column added to scrambled tables.
    pub block_column: String,

    /// Subsample-id column added to scrambled tables.
    pub subsample_column: String,

    /// Tier column added to scrambled tables.
    pub tier_column: String,

    /// Number of distinct subsample ids, drawn uniformly from `[0, n)`.
    pub subsample_count: u32,

    /// Upper bound on leaf nodes of one async-aggregation subtree.
    ///
    /// Scramble blocks are grouped into at most this many contiguous,
    /// disjoint block ranges, one per leaf.
    pub max_async_leaves: usize,

    /// Number of inputs merged by one combiner node (k of the k-wise tree).
    pub combiner_fan_in: usize,

    /// How executing nodes share the backend connection.
    pub connection_discipline: ConnectionDiscipline,

    /// Drop temporary tables created by a plan once it finishes.
    pub drop_temp_tables: bool,

    /// z-score used for confidence interval half-widths (1.96 ≈ 95%).
    pub confidence_level_z: f64,

    /// Default `tracing` filter directive used by [`crate::logging`].
    pub log_filter: String,
}

impl Default for AqpConfig {
    fn default() -> Self {
        AqpConfig {
            scratch_schema: "aqp_temp".to_string(),
            temp_table_prefix: "aqptmp".to_string(),
            block_column: "aqp_block".to_string(),
            subsample_column: "aqp_subsample".to_string(),
            tier_column: "aqp_tier".to_string(),
            subsample_count: 100,
            max_async_leaves: 10,
            combiner_fan_in: 2,
            connection_discipline: ConnectionDiscipline::Serialized,
            drop_temp_tables: true,
            confidence_level_z: 1.96,
            log_filter: "approxql=info".to_string(),
        }
    }
}

impl AqpConfig {
    /// Parse settings from a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, AqpError> {
        let config: AqpConfig = toml::from_str(input)
            .map_err(|e| AqpError::InvalidConfig(format!("cannot parse TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every setting is within its allowed range.
    pub fn validate(&self) -> Result<(), AqpError> {
        for (name, value) in [
            ("scratch_schema", &self.scratch_schema),
            ("temp_table_prefix", &self.temp_table_prefix),
            ("block_column", &self.block_column),
            ("subsample_column", &self.subsample_column),
            ("tier_column", &self.tier_column),
        ] {
            if value.trim().is_empty() {
                return Err(AqpError::InvalidConfig(format!("{name} must not be empty")));
            }
        }
        if self.block_column == self.subsample_column
            || self.block_column == self.tier_column
            || self.subsample_column == self.tier_column
        {
            return Err(AqpError::InvalidConfig(
                "block, subsample and tier columns must have distinct names".into(),
            ));
        }
        if self.subsample_count == 0 {
            return Err(AqpError::InvalidConfig(
                "subsample_count must be at least 1".into(),
            ));
        }
        if self.max_async_leaves == 0 {
            return Err(AqpError::InvalidConfig(
                "max_async_leaves must be at least 1".into(),
            ));
        }
        if self.combiner_fan_in < 2 {
            return Err(AqpError::InvalidConfig(format!(
                "combiner_fan_in is {}; a combiner must merge at least 2 inputs",
                self.combiner_fan_in
            )));
        }
        if !(self.confidence_level_z.is_finite() && self.confidence_level_z > 0.0) {
            return Err(AqpError::InvalidConfig(format!(
                "confidence_level_z must be a positive number, got {}",
                self.confidence_level_z
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AqpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scratch_schema, "aqp_temp");
        assert_eq!(config.combiner_fan_in, 2);
        assert_eq!(config.connection_discipline, ConnectionDiscipline::Serialized);
    }

    #[test]
    fn test_from_toml_partial_document() {
        let config = AqpConfig::from_toml_str(
            r#"
            scratch_schema = "scratch"
            max_async_leaves = 4
            connection_discipline = "clone_per_branch"
            "#,
        )
        .unwrap();
        assert_eq!(config.scratch_schema, "scratch");
        assert_eq!(config.max_async_leaves, 4);
        assert_eq!(
            config.connection_discipline,
            ConnectionDiscipline::ClonePerBranch
        );
        // Untouched keys keep their defaults.
        assert_eq!(config.block_column, "aqp_block");
        assert!(config.drop_temp_tables);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        let err = AqpConfig::from_toml_str("scratch_schema = [").unwrap_err();
        assert!(matches!(err, AqpError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_rejects_small_fan_in() {
        let config = AqpConfig {
            combiner_fan_in: 1,
            ..AqpConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(AqpError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_column_names() {
        let config = AqpConfig {
            tier_column: "aqp_block".into(),
            ..AqpConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_leaves() {
        let config = AqpConfig {
            max_async_leaves: 0,
            ..AqpConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_discipline_as_str() {
        assert_eq!(ConnectionDiscipline::Serialized.as_str(), "serialized");
        assert_eq!(
            ConnectionDiscipline::ClonePerBranch.as_str(),
            "clone_per_branch"
        );
    }
}
