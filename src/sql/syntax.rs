//! Backend SQL dialects.
//!
//! A [`SqlSyntax`] supplies the few rules that differ between backends:
//! identifier quoting, type names, the random and hash functions used by
//! scrambling, and the shape of CREATE TABLE AS SELECT.

use std::fmt;

use super::relation::Expr;

pub trait SqlSyntax: Send + Sync + fmt::Debug {
    /// Short dialect name for logs.
    fn name(&self) -> &'static str;

    fn quote_char(&self) -> char;

    fn quote_ident(&self, ident: &str) -> String {
        let q = self.quote_char();
        let doubled: String = [q, q].iter().collect();
        format!("{q}{}{q}", ident.replace(q, &doubled))
    }

    fn quote_string(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn qualified(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
    }

    /// Zero-argument function returning a uniform random double in `[0, 1)`.
    fn random_function(&self) -> &'static str;

    fn small_int_type(&self) -> &'static str {
        "smallint"
    }

    fn int_type(&self) -> &'static str;

    fn big_int_type(&self) -> &'static str {
        "bigint"
    }

    fn bool_type(&self) -> &'static str {
        "boolean"
    }

    fn float_type(&self) -> &'static str;

    fn text_type(&self) -> &'static str;

    /// Deterministic integer hash of `column`.
    fn hash_expr(&self, column: Expr) -> Expr;

    /// Whether CREATE TABLE AS SELECT can declare partition columns.
    fn supports_partitioning(&self) -> bool;

    fn create_schema_if_not_exists(&self, schema: &str) -> String {
        format!("CREATE SCHEMA IF NOT EXISTS {}", self.quote_ident(schema))
    }

    fn create_table_as(
        &self,
        schema: &str,
        table: &str,
        partition_columns: &[String],
        select_sql: &str,
    ) -> String;

    fn drop_table_if_exists(&self, schema: &str, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.qualified(schema, table))
    }
}

/// PostgreSQL dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresSyntax;

impl SqlSyntax for PostgresSyntax {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn quote_char(&self) -> char {
        '"'
    }

    fn random_function(&self) -> &'static str {
        "random"
    }

    fn int_type(&self) -> &'static str {
        "integer"
    }

    fn float_type(&self) -> &'static str {
        "double precision"
    }

    fn text_type(&self) -> &'static str {
        "text"
    }

    fn hash_expr(&self, column: Expr) -> Expr {
        Expr::func("hashtext", vec![Expr::cast(column, "text")])
    }

    // Declarative partitioning cannot be combined with AS SELECT.
    fn supports_partitioning(&self) -> bool {
        false
    }

    fn create_table_as(
        &self,
        schema: &str,
        table: &str,
        _partition_columns: &[String],
        select_sql: &str,
    ) -> String {
        format!(
            "CREATE TABLE {} AS {select_sql}",
            self.qualified(schema, table)
        )
    }
}

/// Apache Hive dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct HiveSyntax;

impl SqlSyntax for HiveSyntax {
    fn name(&self) -> &'static str {
        "hive"
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn random_function(&self) -> &'static str {
        "rand"
    }

    fn int_type(&self) -> &'static str {
        "int"
    }

    fn float_type(&self) -> &'static str {
        "double"
    }

    fn text_type(&self) -> &'static str {
        "string"
    }

    fn hash_expr(&self, column: Expr) -> Expr {
        Expr::func("hash", vec![column])
    }

    fn supports_partitioning(&self) -> bool {
        true
    }

    fn create_table_as(
        &self,
        schema: &str,
        table: &str,
        partition_columns: &[String],
        select_sql: &str,
    ) -> String {
        let target = self.qualified(schema, table);
        if partition_columns.is_empty() {
            return format!("CREATE TABLE {target} AS {select_sql}");
        }
        let cols = partition_columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {target} PARTITIONED BY ({cols}) AS {select_sql}")
    }
}
