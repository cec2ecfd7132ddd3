//! Scaling partial aggregates into estimates.
//!
//! A snapshot over `k` of `n` blocks of a scramble that kept a fraction
//! `r` of the source rows scales additive aggregates (count, sum) by
//! `n / k / r`. Ratio aggregates (avg, variance, stddev) and extremes
//! (min, max) are reported as observed. Averages also carry a normal
//! approximation confidence half-width.

use super::partial::{PartialSnapshot, PartialState};
use super::subtree::{AggregateLayout, OutputSource};
use crate::connection::{Value, ValueKind};
use crate::sql::{AggFunc, BinaryOp, Expr, SelectItem, SelectQuery, SqlSyntax};

/// Estimated answer of an aggregate query at some point of progress.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedAggregate {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Confidence half-width per cell, where one is defined.
    pub half_widths: Vec<Vec<Option<f64>>>,
    /// Which output columns are numeric estimates.
    pub numeric: Vec<bool>,
    pub covered_blocks: u32,
    pub total_blocks: u32,
}

impl FinalizedAggregate {
    /// Fraction of the scramble's blocks processed, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total_blocks == 0 {
            return 1.0;
        }
        f64::from(self.covered_blocks.min(self.total_blocks)) / f64::from(self.total_blocks)
    }

    pub fn is_complete(&self) -> bool {
        self.covered_blocks >= self.total_blocks
    }

    /// A literal SELECT producing the estimate rows, suitable for a
    /// CREATE TABLE AS SELECT.
    ///
    /// Every cell is cast to its column's type so all rows of the UNION
    /// agree: numeric estimates to the dialect's float type, other columns
    /// to the type of their first non-null value (text when all are null).
    /// An empty estimate yields a typed query that returns no rows.
    pub fn to_select_sql(&self, syntax: &dyn SqlSyntax) -> String {
        let types: Vec<&'static str> = self
            .numeric
            .iter()
            .enumerate()
            .map(|(col, numeric)| {
                if *numeric {
                    return syntax.float_type();
                }
                let kind = self.rows.iter().find_map(|row| row.get(col).and_then(Value::kind));
                match kind {
                    Some(ValueKind::Int) => syntax.big_int_type(),
                    Some(ValueKind::Float) => syntax.float_type(),
                    Some(ValueKind::Bool) => syntax.bool_type(),
                    Some(ValueKind::Text) | None => syntax.text_type(),
                }
            })
            .collect();

        if self.rows.is_empty() {
            let select_list = self
                .columns
                .iter()
                .zip(&types)
                .map(|(name, ty)| SelectItem::aliased(Expr::cast(Value::Null.to_literal(), ty), name))
                .collect();
            return SelectQuery::new(select_list, vec![])
                .with_filter(Expr::binary(BinaryOp::Eq, Expr::int(1), Expr::int(0)))
                .to_sql(syntax);
        }

        self.rows
            .iter()
            .map(|row| {
                let select_list = row
                    .iter()
                    .zip(&self.columns)
                    .zip(&types)
                    .map(|((value, name), ty)| SelectItem::aliased(Expr::cast(value.to_literal(), ty), name))
                    .collect();
                SelectQuery::new(select_list, vec![]).to_sql(syntax)
            })
            .collect::<Vec<_>>()
            .join(" UNION ALL ")
    }
}

fn estimate(
    func: AggFunc,
    state: &PartialState,
    scale: Option<f64>,
    z: f64,
) -> (Value, Option<f64>) {
    let float = |v: Option<f64>| v.filter(|f| f.is_finite()).map_or(Value::Null, Value::Float);
    match (func, state) {
        (AggFunc::Count, PartialState::Count { count }) => {
            (float(scale.map(|s| *count as f64 * s)), None)
        }
        (AggFunc::Sum, PartialState::Sum { sum, count }) if *count > 0 => {
            (float(scale.map(|s| sum * s)), None)
        }
        (AggFunc::Avg, s) => {
            let half = match (s.sample_variance(), s.count()) {
                (Some(var), Some(n)) => Some(z * (var / n as f64).sqrt()),
                _ => None,
            };
            (float(s.mean()), half)
        }
        (AggFunc::Variance, s) => (float(s.sample_variance()), None),
        (AggFunc::Stddev, s) => (float(s.sample_variance().map(f64::sqrt)), None),
        (AggFunc::Min, PartialState::Min(v)) | (AggFunc::Max, PartialState::Max(v)) => {
            (v.clone().unwrap_or(Value::Null), None)
        }
        _ => (Value::Null, None),
    }
}

/// Scale `snapshot` into an estimate of the query `layout` describes.
///
/// A query without GROUP BY always yields one row, even before any group
/// was seen; grouped queries yield one row per group seen so far.
pub fn finalize(layout: &AggregateLayout, snapshot: &PartialSnapshot, z: f64) -> FinalizedAggregate {
    let total = layout.source.total_blocks;
    let covered = snapshot.covered_blocks();
    let scale = (covered > 0 && layout.source.sample_ratio > 0.0)
        .then(|| f64::from(total) / f64::from(covered) / layout.source.sample_ratio);

    let empty_global;
    let groups: Vec<(&Vec<Value>, &Vec<PartialState>)> =
        if layout.group_by.is_empty() && snapshot.groups().is_empty() {
            empty_global = (
                Vec::new(),
                layout
                    .aggregates
                    .iter()
                    .map(|a| PartialState::empty(a.func))
                    .collect::<Vec<_>>(),
            );
            vec![(&empty_global.0, &empty_global.1)]
        } else {
            snapshot.groups().iter().collect()
        };

    let mut rows = Vec::with_capacity(groups.len());
    let mut half_widths = Vec::with_capacity(groups.len());
    for (key, states) in groups {
        let mut row = Vec::with_capacity(layout.outputs.len());
        let mut halves = Vec::with_capacity(layout.outputs.len());
        for output in &layout.outputs {
            let (value, half) = match output.source {
                OutputSource::Group(g) => (key.get(g).cloned().unwrap_or(Value::Null), None),
                OutputSource::Aggregate(a) => match (layout.aggregates.get(a), states.get(a)) {
                    (Some(call), Some(state)) => estimate(call.func, state, scale, z),
                    _ => (Value::Null, None),
                },
            };
            row.push(value);
            halves.push(half);
        }
        rows.push(row);
        half_widths.push(halves);
    }

    let numeric = layout
        .outputs
        .iter()
        .map(|o| match o.source {
            OutputSource::Aggregate(a) => layout
                .aggregates
                .get(a)
                .is_some_and(|c| !matches!(c.func, AggFunc::Min | AggFunc::Max)),
            OutputSource::Group(_) => false,
        })
        .collect();

    FinalizedAggregate {
        columns: layout.outputs.iter().map(|o| o.name.clone()).collect(),
        rows,
        half_widths,
        numeric,
        covered_blocks: covered,
        total_blocks: total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ola::partial::BlockRange;
    use crate::ola::subtree::{AggregateCall, OutputColumn, ScrambleSource};
    use crate::sql::PostgresSyntax;

    fn layout(group: bool, funcs: &[AggFunc], ratio: f64) -> AggregateLayout {
        let mut outputs = Vec::new();
        if group {
            outputs.push(OutputColumn {
                name: "region".into(),
                source: OutputSource::Group(0),
            });
        }
        for (i, f) in funcs.iter().enumerate() {
            outputs.push(OutputColumn {
                name: f.as_str().into(),
                source: OutputSource::Aggregate(i),
            });
        }
        AggregateLayout {
            source: ScrambleSource {
                schema: "s".into(),
                table: "t_scr".into(),
                alias: "t".into(),
                block_column: "aqp_block".into(),
                total_blocks: 4,
                sample_ratio: ratio,
            },
            filter: None,
            group_by: if group { vec![Expr::bare_column("region")] } else { vec![] },
            aggregates: funcs
                .iter()
                .map(|f| AggregateCall {
                    func: *f,
                    arg: Some(Expr::bare_column("v")),
                })
                .collect(),
            outputs,
        }
    }

    #[test]
    fn test_count_and_sum_scale_by_coverage_and_ratio() {
        let l = layout(false, &[AggFunc::Count, AggFunc::Sum], 0.5);
        let mut s = PartialSnapshot::new(BlockRange::new(0, 1));
        s.insert(
            vec![],
            vec![
                PartialState::Count { count: 10 },
                PartialState::Sum { sum: 20.0, count: 10 },
            ],
        )
        .unwrap();
        let f = finalize(&l, &s, 1.96);
        // 1 of 4 blocks, half the rows kept: scale 8
        assert_eq!(f.rows, vec![vec![Value::Float(80.0), Value::Float(160.0)]]);
        assert_eq!(f.fraction(), 0.25);
        assert!(!f.is_complete());
    }

    #[test]
    fn test_avg_is_unscaled_with_half_width() {
        let l = layout(false, &[AggFunc::Avg], 1.0);
        let mut s = PartialSnapshot::new(BlockRange::new(0, 4));
        s.insert(
            vec![],
            vec![PartialState::Moments {
                sum: 10.0,
                sum_sq: 30.0,
                count: 4,
            }],
        )
        .unwrap();
        let f = finalize(&l, &s, 2.0);
        assert_eq!(f.rows[0][0], Value::Float(2.5));
        // var = (30 - 25) / 3, half = 2 * sqrt(var / 4)
        let expected = 2.0 * ((5.0 / 3.0) / 4.0_f64).sqrt();
        assert!((f.half_widths[0][0].unwrap() - expected).abs() < 1e-12);
        assert!(f.is_complete());
    }

    #[test]
    fn test_empty_global_aggregate_has_one_row() {
        let l = layout(false, &[AggFunc::Count, AggFunc::Avg], 1.0);
        let f = finalize(&l, &PartialSnapshot::default(), 1.96);
        assert_eq!(f.rows, vec![vec![Value::Null, Value::Null]]);

        let grouped = layout(true, &[AggFunc::Count], 1.0);
        assert!(finalize(&grouped, &PartialSnapshot::default(), 1.96).rows.is_empty());
    }

    #[test]
    fn test_select_sql_casts_numeric_columns() {
        let l = layout(true, &[AggFunc::Count], 1.0);
        let mut s = PartialSnapshot::new(BlockRange::new(0, 4));
        s.insert(vec![Value::Text("eu".into())], vec![PartialState::Count { count: 3 }])
            .unwrap();
        s.insert(vec![Value::Text("us".into())], vec![PartialState::Count { count: 5 }])
            .unwrap();
        let sql = finalize(&l, &s, 1.96).to_select_sql(&PostgresSyntax);
        assert_eq!(
            sql,
            "SELECT CAST('eu' AS text) AS \"region\", CAST(3.0 AS double precision) AS \"count\" \
             UNION ALL SELECT CAST('us' AS text) AS \"region\", CAST(5.0 AS double precision) AS \"count\""
        );
    }

    #[test]
    fn test_select_sql_keeps_text_keys_verbatim() {
        let l = layout(true, &[AggFunc::Count], 1.0);
        let mut s = PartialSnapshot::new(BlockRange::new(0, 4));
        for key in [Value::Text("007".into()), Value::Text("abc".into()), Value::Null] {
            s.insert(vec![key], vec![PartialState::Count { count: 1 }])
                .unwrap();
        }
        let sql = finalize(&l, &s, 1.96).to_select_sql(&PostgresSyntax);
        assert!(sql.contains("CAST('007' AS text) AS \"region\""), "{sql}");
        assert!(sql.contains("CAST('abc' AS text) AS \"region\""), "{sql}");
        assert!(sql.contains("CAST(NULL AS text) AS \"region\""), "{sql}");
        assert!(!sql.contains("SELECT 7 "), "{sql}");
    }

    #[test]
    fn test_select_sql_casts_integer_keys_uniformly() {
        let l = layout(true, &[AggFunc::Count], 1.0);
        let mut s = PartialSnapshot::new(BlockRange::new(0, 4));
        for key in [Value::Null, Value::Int(7)] {
            s.insert(vec![key], vec![PartialState::Count { count: 1 }])
                .unwrap();
        }
        let sql = finalize(&l, &s, 1.96).to_select_sql(&PostgresSyntax);
        assert!(sql.contains("CAST(NULL AS bigint) AS \"region\""), "{sql}");
        assert!(sql.contains("CAST(7 AS bigint) AS \"region\""), "{sql}");
    }

    #[test]
    fn test_select_sql_for_no_rows_is_typed_and_empty() {
        let l = layout(true, &[AggFunc::Sum], 1.0);
        let sql = finalize(&l, &PartialSnapshot::default(), 1.96).to_select_sql(&PostgresSyntax);
        assert_eq!(
            sql,
            "SELECT CAST(NULL AS text) AS \"region\", CAST(NULL AS double precision) AS \"sum\" WHERE 1 = 0"
        );
    }
}
