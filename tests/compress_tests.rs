//! Plan construction and compression scenarios.

mod common;

use approxql::plan::{NodeKind, PlanBuilder, QueryPlan, compress};
use approxql::sql::{AggFunc, BinaryOp, Expr, Relation, SelectItem, SelectQuery};
use approxql::{AqpConfig, ScrambleMetaSet};
use common::{avg_query, original_table, scrambles};

fn build(query: &SelectQuery, scrambles: &ScrambleMetaSet) -> QueryPlan {
    let config = AqpConfig::default();
    PlanBuilder::new(scrambles, &config).build(query).unwrap()
}

fn root_sql(plan: &QueryPlan) -> String {
    plan.node(plan.root())
        .unwrap()
        .query
        .as_ref()
        .unwrap()
        .to_string()
}

/// `select avg(t.value) from (select o.value from originalschema.originaltable
/// as o where o.value > 5) as t`
fn nested_avg_query() -> SelectQuery {
    let inner = SelectQuery::new(
        vec![SelectItem::new(Expr::column("o", "value"))],
        vec![original_table("o")],
    )
    .with_filter(Expr::binary(
        BinaryOp::Gt,
        Expr::column("o", "value"),
        Expr::int(5),
    ));
    SelectQuery::new(
        vec![SelectItem::new(Expr::agg(
            AggFunc::Avg,
            Expr::column("t", "value"),
        ))],
        vec![Relation::subquery(inner, "t")],
    )
}

#[test]
fn test_simple_aggregate_compresses_to_one_statement() {
    let mut plan = build(&avg_query(), &ScrambleMetaSet::new());
    assert_eq!(plan.len(), 2);
    compress(&mut plan).unwrap();

    assert_eq!(plan.len(), 1);
    assert!(plan.node(plan.root()).unwrap().dependencies.is_empty());
    assert_eq!(
        root_sql(&plan),
        "SELECT * FROM (SELECT avg(\"t\".\"value\") AS \"a\" \
         FROM \"originalschema\".\"originaltable\" AS \"t\") AS \"vt0\""
    );
}

#[test]
fn test_nested_subquery_compresses_into_nested_from() {
    let mut plan = build(&nested_avg_query(), &ScrambleMetaSet::new());
    assert_eq!(plan.len(), 3);
    compress(&mut plan).unwrap();

    assert_eq!(plan.len(), 1);
    assert_eq!(
        root_sql(&plan),
        "SELECT * FROM (SELECT avg(\"t\".\"value\") FROM (SELECT \"o\".\"value\" \
         FROM \"originalschema\".\"originaltable\" AS \"o\" WHERE \"o\".\"value\" > 5) \
         AS \"t\") AS \"vt0\""
    );
}

#[test]
fn test_compressed_from_list_matches_relation_tree() {
    for query in [avg_query(), nested_avg_query()] {
        let mut plan = build(&query, &ScrambleMetaSet::new());
        compress(&mut plan).unwrap();
        let root = plan.node(plan.root()).unwrap().query.clone().unwrap();
        assert_eq!(root.from_list, vec![Relation::subquery(query, "vt0")]);
    }
}

#[test]
fn test_filter_subquery_is_inlined_back() {
    let threshold = SelectQuery::new(
        vec![SelectItem::new(Expr::agg(AggFunc::Max, Expr::column("u", "value")))],
        vec![original_table("u")],
    );
    let query = SelectQuery::select_all_from(original_table("t")).with_filter(Expr::binary(
        BinaryOp::Lt,
        Expr::column("t", "value"),
        Expr::subquery(threshold),
    ));
    let mut plan = build(&query, &ScrambleMetaSet::new());
    assert_eq!(plan.len(), 3);
    compress(&mut plan).unwrap();
    assert_eq!(plan.len(), 1);
    assert!(root_sql(&plan).contains(
        "WHERE \"t\".\"value\" < (SELECT max(\"u\".\"value\") FROM \"originalschema\".\"originaltable\" AS \"u\")"
    ));
}

#[test]
fn test_async_subtree_survives_compression() {
    let set = scrambles(8);
    let mut plan = build(&avg_query(), &set);
    let before = plan.deep_copy();
    let root = plan.root();
    let fan_out = plan.node(root).unwrap().dependencies[0];
    assert!(matches!(
        plan.node(fan_out).unwrap().kind,
        NodeKind::AsyncAggregate { .. }
    ));

    let stats = compress(&mut plan).unwrap();
    assert!(stats.is_noop(), "{stats:?}");
    let deps = &plan.node(root).unwrap().dependencies;
    assert_eq!(deps.len(), 1);
    assert!(plan.subplan_eq(deps[0], &before, fan_out));
    assert_eq!(plan, before);
}

#[test]
fn test_async_subtree_under_derived_table() {
    // select * from (select avg(t.value) as a from <scrambled> as t) as x
    let query = SelectQuery::select_all_from(Relation::subquery(avg_query(), "x"));
    let mut plan = build(&query, &scrambles(4));
    let leaves_before = plan
        .node_ids()
        .into_iter()
        .filter(|id| matches!(plan.node(*id).unwrap().kind, NodeKind::AggregateLeaf { .. }))
        .count();
    compress(&mut plan).unwrap();

    let root = plan.node(plan.root()).unwrap();
    assert_eq!(root.dependencies.len(), 1);
    let fan_out = plan.node(root.dependencies[0]).unwrap();
    assert!(matches!(fan_out.kind, NodeKind::AsyncAggregate { .. }));
    let leaves_after = plan
        .node_ids()
        .into_iter()
        .filter(|id| matches!(plan.node(*id).unwrap().kind, NodeKind::AggregateLeaf { .. }))
        .count();
    assert_eq!(leaves_before, leaves_after);
    assert_eq!(leaves_after, 4);
}

#[test]
fn test_compression_is_idempotent_for_every_scenario() {
    let set = scrambles(6);
    let queries = [
        avg_query(),
        nested_avg_query(),
        SelectQuery::select_all_from(Relation::subquery(avg_query(), "x")),
    ];
    for query in queries {
        let mut plan = build(&query, &set);
        compress(&mut plan).unwrap();
        let once_sql = root_sql(&plan);
        let once_len = plan.len();
        compress(&mut plan).unwrap();
        assert_eq!(plan.len(), once_len);
        assert_eq!(root_sql(&plan), once_sql);
    }
}

#[test]
fn test_duplicate_subqueries_share_one_node() {
    let side = || {
        Relation::subquery(
            SelectQuery::new(
                vec![SelectItem::new(Expr::column("o", "value"))],
                vec![original_table("o")],
            ),
            "s",
        )
    };
    let join = Relation::Join {
        left: Box::new(side()),
        right: Box::new(side()),
        kind: approxql::sql::JoinKind::Cross,
        on: None,
    };
    let mut plan = build(&SelectQuery::select_all_from(join), &ScrambleMetaSet::new());
    let stats = compress(&mut plan).unwrap();
    assert_eq!(stats.merged, 1);

    // the join node itself is inlined into the root; the shared side is not
    assert_eq!(plan.len(), 2);
    let deps = &plan.node(plan.root()).unwrap().dependencies;
    assert_eq!(deps.len(), 2);
    assert_eq!(deps[0], deps[1]);
    assert_eq!(plan.node(deps[0]).unwrap().kind, NodeKind::CreateTable);
}
