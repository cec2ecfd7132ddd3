//! CREATE TABLE AS SELECT construction for scrambles.

use chrono::Utc;
use tracing::{debug, info};

use super::{ScrambleMeta, ScrambleMethod, ScrambleSpec};
use crate::config::AqpConfig;
use crate::connection::DbmsConnection;
use crate::error::AqpError;
use crate::sql::{BinaryOp, Expr, Relation, SelectItem, SelectQuery, SqlSyntax};

/// The statement that materializes a scramble.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateScrambleStatement {
    pub schema: String,
    pub table: String,
    /// Physical partition columns; only rendered by dialects that can
    /// partition a CREATE TABLE AS SELECT.
    pub partition_columns: Vec<String>,
    pub select: SelectQuery,
}

impl CreateScrambleStatement {
    pub fn to_sql(&self, syntax: &dyn SqlSyntax) -> String {
        let partitions: &[String] = if syntax.supports_partitioning() {
            &self.partition_columns
        } else {
            &[]
        };
        syntax.create_table_as(
            &self.schema,
            &self.table,
            partitions,
            &self.select.to_sql(syntax),
        )
    }
}

/// Number of aggregation blocks for a scramble of `rows` source rows.
///
/// `ceil(rows * size / |block_size|)`, at least 1.
pub fn compute_block_count(rows: u64, size: f64, block_size: i64) -> u32 {
    let per_block = block_size.unsigned_abs().max(1) as f64;
    let blocks = (rows as f64 * size / per_block).ceil();
    if blocks < 1.0 {
        1
    } else if blocks >= u32::MAX as f64 {
        u32::MAX
    } else {
        blocks as u32
    }
}

/// `CAST(floor(<random>() * n) AS <type>)`: uniform integer in `[0, n)`.
fn uniform_int(syntax: &dyn SqlSyntax, n: u64, type_name: &str) -> Expr {
    Expr::cast(
        Expr::func(
            "floor",
            vec![Expr::binary(
                BinaryOp::Multiply,
                Expr::func(syntax.random_function(), vec![]),
                Expr::int(n as i64),
            )],
        ),
        type_name,
    )
}

/// Build the CREATE TABLE AS SELECT for a validated request.
///
/// The select list is every source column followed by the block,
/// subsample and tier columns named in `config`.
pub fn build_create_statement(
    spec: &ScrambleSpec,
    block_count: u32,
    syntax: &dyn SqlSyntax,
    config: &AqpConfig,
) -> Result<CreateScrambleStatement, AqpError> {
    let method = spec.validate()?;
    if block_count == 0 {
        return Err(AqpError::InvalidScramble("block count must be at least 1".into()));
    }

    let block_type = if block_count > i16::MAX as u32 {
        syntax.int_type()
    } else {
        syntax.small_int_type()
    };

    let block_expr = match method {
        ScrambleMethod::Uniform => uniform_int(syntax, u64::from(block_count), block_type),
        ScrambleMethod::Hash => {
            let column = spec.hash_column.as_deref().ok_or_else(|| {
                AqpError::InvalidScramble("hash scrambling requires a hash column".into())
            })?;
            Expr::cast(
                Expr::binary(
                    BinaryOp::Modulo,
                    Expr::func("abs", vec![syntax.hash_expr(Expr::bare_column(column))]),
                    Expr::int(i64::from(block_count)),
                ),
                block_type,
            )
        }
        // Priority ordering needs per-table statistics this builder does
        // not collect; blocks are assigned uniformly until it does.
        ScrambleMethod::FastConverge => {
            debug!("fastconverge scramble falls back to uniform block assignment");
            uniform_int(syntax, u64::from(block_count), block_type)
        }
    };

    let select_list = vec![
        SelectItem::new(Expr::Asterisk { table: None }),
        SelectItem::aliased(block_expr, &config.block_column),
        SelectItem::aliased(
            uniform_int(syntax, u64::from(config.subsample_count), syntax.small_int_type()),
            &config.subsample_column,
        ),
        SelectItem::aliased(Expr::int(1), &config.tier_column),
    ];

    let mut select = SelectQuery::new(
        select_list,
        vec![Relation::base(&spec.original_schema, &spec.original_table, None)],
    );
    if spec.size < 1.0 {
        select = select.with_filter(Expr::binary(
            BinaryOp::Lt,
            Expr::func(syntax.random_function(), vec![]),
            Expr::number(&format!("{:?}", spec.size)),
        ));
    }

    Ok(CreateScrambleStatement {
        schema: spec.new_schema.clone(),
        table: spec.new_table.clone(),
        partition_columns: vec![config.block_column.clone()],
        select,
    })
}

/// Creates scramble tables on a live connection.
pub struct ScrambleBuilder<'a> {
    config: &'a AqpConfig,
}

impl<'a> ScrambleBuilder<'a> {
    pub fn new(config: &'a AqpConfig) -> Self {
        ScrambleBuilder { config }
    }

    /// Validate `spec`, size the blocks from the source row count, issue
    /// the DDL and describe the result.
    ///
    /// The metadata cache of `conn` is invalidated after the DDL.
    pub fn create(
        &self,
        conn: &mut dyn DbmsConnection,
        spec: &ScrambleSpec,
    ) -> Result<ScrambleMeta, AqpError> {
        let method = spec.validate()?;
        let syntax = conn.syntax();

        let count_sql = SelectQuery::new(
            vec![SelectItem::new(Expr::count_star())],
            vec![Relation::base(&spec.original_schema, &spec.original_table, None)],
        )
        .to_sql(syntax.as_ref());
        let rows = conn
            .execute(&count_sql)?
            .scalar()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| AqpError::Backend(format!("row count query returned no count: {count_sql}")))?;
        let rows = u64::try_from(rows).unwrap_or(0);

        let block_count = compute_block_count(rows, spec.size, spec.block_size);
        let statement = build_create_statement(spec, block_count, syntax.as_ref(), self.config)?;

        conn.execute_update(&syntax.create_schema_if_not_exists(&spec.new_schema))?;
        let ddl = statement.to_sql(syntax.as_ref());
        debug!(sql = %ddl, "creating scramble");
        conn.execute_update(&ddl)?;
        conn.invalidate_metadata();

        info!(
            scramble = %format!("{}.{}", spec.new_schema, spec.new_table),
            original = %format!("{}.{}", spec.original_schema, spec.original_table),
            method = method.as_str(),
            rows,
            block_count,
            "scramble created"
        );

        Ok(ScrambleMeta {
            schema: spec.new_schema.clone(),
            table: spec.new_table.clone(),
            original_schema: spec.original_schema.clone(),
            original_table: spec.original_table.clone(),
            method,
            block_column: self.config.block_column.clone(),
            block_count,
            subsample_column: self.config.subsample_column.clone(),
            tier_column: self.config.tier_column.clone(),
            sample_ratio: spec.size,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{HiveSyntax, PostgresSyntax};

    fn spec() -> ScrambleSpec {
        ScrambleSpec::new("originalschema", "originaltable", "newschema", "newtable")
    }

    #[test]
    fn test_block_count() {
        assert_eq!(compute_block_count(0, 1.0, 100), 1);
        assert_eq!(compute_block_count(1000, 1.0, 100), 10);
        assert_eq!(compute_block_count(1001, 1.0, 100), 11);
        assert_eq!(compute_block_count(1000, 0.1, 100), 1);
        assert_eq!(compute_block_count(1000, 1.0, -100), 10);
    }

    #[test]
    fn test_uniform_statement_postgres() {
        let config = AqpConfig::default();
        let stmt = build_create_statement(&spec(), 10, &PostgresSyntax, &config).unwrap();
        assert_eq!(stmt.partition_columns, vec!["aqp_block".to_string()]);
        assert_eq!(
            stmt.to_sql(&PostgresSyntax),
            "CREATE TABLE \"newschema\".\"newtable\" AS SELECT *, \
             CAST(floor(random() * 10) AS smallint) AS \"aqp_block\", \
             CAST(floor(random() * 100) AS smallint) AS \"aqp_subsample\", \
             1 AS \"aqp_tier\" FROM \"originalschema\".\"originaltable\""
        );
    }

    #[test]
    fn test_uniform_statement_hive_is_partitioned() {
        let config = AqpConfig::default();
        let stmt = build_create_statement(&spec(), 3, &HiveSyntax, &config).unwrap();
        let sql = stmt.to_sql(&HiveSyntax);
        assert!(
            sql.starts_with("CREATE TABLE `newschema`.`newtable` PARTITIONED BY (`aqp_block`) AS SELECT *"),
            "{sql}"
        );
        assert!(sql.contains("floor(rand() * 3)"), "{sql}");
    }

    #[test]
    fn test_sampled_scramble_filters_rows() {
        let config = AqpConfig::default();
        let stmt =
            build_create_statement(&spec().with_size(0.25), 4, &PostgresSyntax, &config).unwrap();
        assert_eq!(
            stmt.select.filter.as_ref().map(|f| f.to_sql(&PostgresSyntax)),
            Some("random() < 0.25".to_string())
        );
    }

    #[test]
    fn test_hash_statement_uses_dialect_hash() {
        let config = AqpConfig::default();
        let s = spec().with_method("hash").with_hash_column("customer_id");
        let stmt = build_create_statement(&s, 8, &PostgresSyntax, &config).unwrap();
        let sql = stmt.to_sql(&PostgresSyntax);
        assert!(
            sql.contains("CAST(abs(hashtext(CAST(\"customer_id\" AS text))) % 8 AS smallint)"),
            "{sql}"
        );
    }

    #[test]
    fn test_large_block_count_widens_type() {
        let config = AqpConfig::default();
        let stmt = build_create_statement(&spec(), 40_000, &PostgresSyntax, &config).unwrap();
        assert!(stmt.to_sql(&PostgresSyntax).contains("AS integer) AS \"aqp_block\""));
    }

    #[test]
    fn test_invalid_spec_never_builds() {
        let config = AqpConfig::default();
        let err = build_create_statement(&spec().with_block_size(0), 4, &PostgresSyntax, &config)
            .unwrap_err();
        assert!(err.is_value_error());
        let err = build_create_statement(&spec().with_method("random"), 4, &PostgresSyntax, &config)
            .unwrap_err();
        assert!(matches!(err, AqpError::UnsupportedScrambleMethod(_)));
    }
}
