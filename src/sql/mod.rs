//! Relation tree and SQL rendering.
//!
//! The planner works on an already-analyzed SELECT structure
//! ([`SelectQuery`]). Node templates are relation trees whose FROM items or
//! filter subqueries may be positional *placeholders*; a placeholder is
//! resolved at execution time from the token delivered by the matching
//! dependency, or inlined by compression.
//!
//! Rendering goes through a [`SqlSyntax`] dialect so the same tree can be
//! printed for PostgreSQL or Hive.

pub mod relation;
pub mod render;
pub mod syntax;

pub use relation::{
    AggFunc, BinaryOp, Expr, JoinKind, Literal, OrderItem, Relation, SelectItem, SelectQuery,
    SlotReplacement, UnaryOp,
};
pub use render::{PLACEHOLDER_SCHEMA, PLACEHOLDER_TABLE};
pub use syntax::{HiveSyntax, PostgresSyntax, SqlSyntax};
