//! Rendering of relation trees to SQL text.

use std::fmt;

use super::relation::{Expr, Literal, Relation, SelectItem, SelectQuery, UnaryOp};
use super::syntax::{PostgresSyntax, SqlSyntax};

/// Schema name printed for an unresolved placeholder table.
pub const PLACEHOLDER_SCHEMA: &str = "placeholderSchemaName";
/// Table name printed for an unresolved placeholder table.
pub const PLACEHOLDER_TABLE: &str = "placeholderTableName";

impl SelectQuery {
    /// Render the statement in the given dialect.
    pub fn to_sql(&self, syntax: &dyn SqlSyntax) -> String {
        let mut out = String::new();
        write_query(&mut out, self, syntax);
        out
    }
}

impl fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql(&PostgresSyntax))
    }
}

impl Expr {
    pub fn to_sql(&self, syntax: &dyn SqlSyntax) -> String {
        let mut out = String::new();
        write_expr(&mut out, self, syntax);
        out
    }
}

fn write_query(out: &mut String, q: &SelectQuery, syntax: &dyn SqlSyntax) {
    out.push_str("SELECT ");
    write_list(out, &q.select_list, |out, item| write_item(out, item, syntax));

    if !q.from_list.is_empty() {
        out.push_str(" FROM ");
        write_list(out, &q.from_list, |out, rel| write_relation(out, rel, syntax));
    }
    if let Some(filter) = &q.filter {
        out.push_str(" WHERE ");
        write_expr(out, filter, syntax);
    }
    if !q.group_by.is_empty() {
        out.push_str(" GROUP BY ");
        write_list(out, &q.group_by, |out, e| write_expr(out, e, syntax));
    }
    if !q.order_by.is_empty() {
        out.push_str(" ORDER BY ");
        write_list(out, &q.order_by, |out, o| {
            write_expr(out, &o.expr, syntax);
            if o.descending {
                out.push_str(" DESC");
            }
        });
    }
    if let Some(limit) = q.limit {
        out.push_str(&format!(" LIMIT {limit}"));
    }
}

fn write_list<T>(out: &mut String, items: &[T], mut each: impl FnMut(&mut String, &T)) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        each(out, item);
    }
}

fn write_item(out: &mut String, item: &SelectItem, syntax: &dyn SqlSyntax) {
    write_expr(out, &item.expr, syntax);
    if let Some(alias) = &item.alias {
        out.push_str(" AS ");
        out.push_str(&syntax.quote_ident(alias));
    }
}

fn write_alias(out: &mut String, alias: &str, syntax: &dyn SqlSyntax) {
    out.push_str(" AS ");
    out.push_str(&syntax.quote_ident(alias));
}

fn write_relation(out: &mut String, rel: &Relation, syntax: &dyn SqlSyntax) {
    match rel {
        Relation::Base {
            schema,
            table,
            alias,
        } => {
            match schema {
                Some(schema) => out.push_str(&syntax.qualified(schema, table)),
                None => out.push_str(&syntax.quote_ident(table)),
            }
            if let Some(alias) = alias {
                write_alias(out, alias, syntax);
            }
        }
        Relation::Subquery { query, alias } => {
            out.push('(');
            write_query(out, query, syntax);
            out.push(')');
            write_alias(out, alias, syntax);
        }
        Relation::Placeholder { alias, .. } => {
            out.push_str(&syntax.qualified(PLACEHOLDER_SCHEMA, PLACEHOLDER_TABLE));
            write_alias(out, alias, syntax);
        }
        Relation::Join {
            left,
            right,
            kind,
            on,
        } => {
            write_relation(out, left, syntax);
            out.push(' ');
            out.push_str(kind.as_str());
            out.push(' ');
            write_relation(out, right, syntax);
            if let Some(on) = on {
                out.push_str(" ON ");
                write_expr(out, on, syntax);
            }
        }
    }
}

fn write_literal(out: &mut String, lit: &Literal, syntax: &dyn SqlSyntax) {
    match lit {
        Literal::Null => out.push_str("NULL"),
        Literal::Number(text) => out.push_str(text),
        Literal::String(s) => out.push_str(&syntax.quote_string(s)),
        Literal::Bool(true) => out.push_str("TRUE"),
        Literal::Bool(false) => out.push_str("FALSE"),
    }
}

fn precedence(expr: &Expr) -> u8 {
    match expr {
        Expr::Binary { op, .. } => op.precedence(),
        Expr::Unary {
            op: UnaryOp::Not, ..
        } => 2,
        Expr::Unary {
            op: UnaryOp::IsNull | UnaryOp::IsNotNull,
            ..
        }
        | Expr::InList { .. } => 3,
        _ => u8::MAX,
    }
}

/// Write `child`, parenthesized when it binds looser than `parent_prec`.
fn write_operand(out: &mut String, child: &Expr, parent_prec: u8, syntax: &dyn SqlSyntax) {
    if precedence(child) < parent_prec {
        out.push('(');
        write_expr(out, child, syntax);
        out.push(')');
    } else {
        write_expr(out, child, syntax);
    }
}

fn write_expr(out: &mut String, expr: &Expr, syntax: &dyn SqlSyntax) {
    match expr {
        Expr::Column { table, name } => {
            if let Some(table) = table {
                out.push_str(&syntax.quote_ident(table));
                out.push('.');
            }
            out.push_str(&syntax.quote_ident(name));
        }
        Expr::Literal(lit) => write_literal(out, lit, syntax),
        Expr::Asterisk { table } => {
            if let Some(table) = table {
                out.push_str(&syntax.quote_ident(table));
                out.push('.');
            }
            out.push('*');
        }
        Expr::Func { name, args } => {
            out.push_str(name);
            out.push('(');
            write_list(out, args, |out, a| write_expr(out, a, syntax));
            out.push(')');
        }
        Expr::Aggregate {
            func,
            arg,
            distinct,
        } => {
            out.push_str(func.as_str());
            out.push('(');
            if *distinct {
                out.push_str("DISTINCT ");
            }
            match arg {
                Some(arg) => write_expr(out, arg, syntax),
                None => out.push('*'),
            }
            out.push(')');
        }
        Expr::Binary { op, left, right } => {
            let prec = op.precedence();
            write_operand(out, left, prec, syntax);
            out.push(' ');
            out.push_str(op.as_str());
            out.push(' ');
            // Right operands of equal precedence need parentheses for
            // non-associative operators such as `-` and `/`.
            write_operand(out, right, prec + 1, syntax);
        }
        Expr::Unary { op, expr } => match op {
            UnaryOp::Not => {
                out.push_str("NOT ");
                write_operand(out, expr, 3, syntax);
            }
            UnaryOp::Neg => {
                out.push('-');
                write_operand(out, expr, u8::MAX, syntax);
            }
            UnaryOp::IsNull => {
                write_operand(out, expr, 4, syntax);
                out.push_str(" IS NULL");
            }
            UnaryOp::IsNotNull => {
                write_operand(out, expr, 4, syntax);
                out.push_str(" IS NOT NULL");
            }
        },
        Expr::Cast { expr, type_name } => {
            out.push_str("CAST(");
            write_expr(out, expr, syntax);
            out.push_str(" AS ");
            out.push_str(type_name);
            out.push(')');
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            write_operand(out, expr, 4, syntax);
            out.push_str(if *negated { " NOT IN (" } else { " IN (" });
            match list.as_slice() {
                [Expr::Subquery(q)] => write_query(out, q, syntax),
                [Expr::PlaceholderSubquery { .. }] => write_placeholder_select(out, syntax),
                _ => write_list(out, list, |out, e| write_expr(out, e, syntax)),
            }
            out.push(')');
        }
        Expr::Subquery(query) => {
            out.push('(');
            write_query(out, query, syntax);
            out.push(')');
        }
        Expr::PlaceholderSubquery { .. } => {
            out.push('(');
            write_placeholder_select(out, syntax);
            out.push(')');
        }
    }
}

fn write_placeholder_select(out: &mut String, syntax: &dyn SqlSyntax) {
    out.push_str("SELECT * FROM ");
    out.push_str(&syntax.qualified(PLACEHOLDER_SCHEMA, PLACEHOLDER_TABLE));
}
