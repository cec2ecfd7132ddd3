//! Planner benchmarks.
//!
//! Everything here is in-process: plan construction, compression, SQL
//! rendering and partial-aggregate merging. Nothing touches a backend.
//!
//! Run with: `cargo bench --bench compress_bench`

use std::hint::black_box;

use approxql::connection::Value;
use approxql::ola::{BlockRange, PartialSnapshot, PartialState};
use approxql::plan::{PlanBuilder, compress};
use approxql::scramble::{ScrambleMeta, ScrambleMethod};
use approxql::sql::{AggFunc, BinaryOp, Expr, PostgresSyntax, Relation, SelectItem, SelectQuery};
use approxql::{AqpConfig, ScrambleMetaSet};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn source(alias: &str) -> Relation {
    Relation::base("sales", "orders", Some(alias))
}

/// `depth` derived tables stacked on `sales.orders`, topped by an average.
fn nested(depth: usize) -> SelectQuery {
    let mut query = SelectQuery::new(
        vec![SelectItem::new(Expr::column("o", "amount"))],
        vec![source("o")],
    );
    for level in 0..depth {
        let alias = format!("t{level}");
        query = SelectQuery::new(
            vec![SelectItem::new(Expr::column(&alias, "amount"))],
            vec![Relation::subquery(query, &alias)],
        )
        .with_filter(Expr::binary(
            BinaryOp::Gt,
            Expr::column(&alias, "amount"),
            Expr::int(level as i64),
        ));
    }
    SelectQuery::new(
        vec![SelectItem::aliased(
            Expr::agg(AggFunc::Avg, Expr::column("x", "amount")),
            "a",
        )],
        vec![Relation::subquery(query, "x")],
    )
}

fn scrambled(blocks: u32) -> ScrambleMetaSet {
    let mut set = ScrambleMetaSet::new();
    set.add(ScrambleMeta {
        schema: "sales_scr".into(),
        table: "orders".into(),
        original_schema: "sales".into(),
        original_table: "orders".into(),
        method: ScrambleMethod::Uniform,
        block_column: "aqp_block".into(),
        block_count: blocks,
        subsample_column: "aqp_subsample".into(),
        tier_column: "aqp_tier".into(),
        sample_ratio: 1.0,
        created_at: chrono::Utc::now(),
    });
    set
}

// ── Compression ────────────────────────────────────────────────────────────

fn bench_compress_chain(c: &mut Criterion) {
    let config = AqpConfig::default();
    let set = ScrambleMetaSet::new();
    let mut group = c.benchmark_group("compress_chain");
    for depth in [1, 4, 16, 64] {
        let plan = PlanBuilder::new(&set, &config).build(&nested(depth)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(depth), &plan, |b, plan| {
            b.iter(|| {
                let mut plan = plan.deep_copy();
                compress(black_box(&mut plan)).unwrap()
            });
        });
    }
    group.finish();
}

// ── Async subtree construction ─────────────────────────────────────────────

fn bench_build_async(c: &mut Criterion) {
    let query = SelectQuery::new(
        vec![SelectItem::aliased(
            Expr::agg(AggFunc::Sum, Expr::column("o", "amount")),
            "s",
        )],
        vec![source("o")],
    )
    .with_group_by(vec![Expr::column("o", "region")]);

    let mut group = c.benchmark_group("build_async");
    for leaves in [2, 10, 100] {
        let config = AqpConfig {
            max_async_leaves: leaves,
            combiner_fan_in: 4,
            ..AqpConfig::default()
        };
        let set = scrambled(1000);
        group.bench_with_input(BenchmarkId::from_parameter(leaves), &query, |b, query| {
            b.iter(|| PlanBuilder::new(&set, &config).build(black_box(query)).unwrap());
        });
    }
    group.finish();
}

// ── Rendering ──────────────────────────────────────────────────────────────

fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_sql");
    for depth in [1, 16, 64] {
        let query = nested(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &query, |b, query| {
            b.iter(|| black_box(query).to_sql(&PostgresSyntax));
        });
    }
    group.finish();
}

// ── Partial merging ────────────────────────────────────────────────────────

fn bench_merge_partials(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_partials");
    for groups in [1, 100, 10_000] {
        let parts: Vec<PartialSnapshot> = (0..8u32)
            .map(|block| {
                let mut s = PartialSnapshot::new(BlockRange::new(block, block + 1));
                for g in 0..groups {
                    s.insert(
                        vec![Value::Int(g)],
                        vec![PartialState::Moments {
                            sum: g as f64,
                            sum_sq: (g * g) as f64,
                            count: 1,
                        }],
                    )
                    .unwrap();
                }
                s
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(groups), &parts, |b, parts| {
            b.iter(|| PartialSnapshot::merged(black_box(parts).iter()).unwrap());
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_compress_chain,
    bench_build_async,
    bench_render,
    bench_merge_partials,
);
criterion_main!(benches);
