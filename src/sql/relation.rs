//! Relation tree types.
//!
//! Equality and hashing are derived field by field, so two trees compare
//! equal exactly when they would render to the same statement.

use serde::{Deserialize, Serialize};

/// A constant value inside an expression.
///
/// Numbers keep their textual form so the tree stays `Eq + Hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Number(String),
    String(String),
    Bool(bool),
}

/// Aggregate functions known to the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Variance,
    Stddev,
}

impl AggFunc {
    /// SQL function name, shared by the supported dialects.
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Variance => "var_samp",
            AggFunc::Stddev => "stddev_samp",
        }
    }

    /// Parse a function name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(AggFunc::Count),
            "sum" => Some(AggFunc::Sum),
            "avg" => Some(AggFunc::Avg),
            "min" => Some(AggFunc::Min),
            "max" => Some(AggFunc::Max),
            "variance" | "var_samp" => Some(AggFunc::Variance),
            "stddev" | "stddev_samp" => Some(AggFunc::Stddev),
            _ => None,
        }
    }

    /// Number of partial-aggregate columns a leaf emits for this function.
    pub fn partial_width(&self) -> usize {
        match self {
            AggFunc::Count | AggFunc::Min | AggFunc::Max => 1,
            AggFunc::Sum => 2,
            AggFunc::Avg | AggFunc::Variance | AggFunc::Stddev => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Like,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Like => "LIKE",
        }
    }

    /// Binding strength; higher binds tighter.
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Lt
            | BinaryOp::LtEq
            | BinaryOp::Gt
            | BinaryOp::GtEq
            | BinaryOp::Like => 3,
            BinaryOp::Plus | BinaryOp::Minus => 4,
            BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    IsNull,
    IsNotNull,
}

/// Scalar expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Literal),
    Asterisk {
        table: Option<String>,
    },
    Func {
        name: String,
        args: Vec<Expr>,
    },
    /// `func(arg)`; `arg = None` means `count(*)`.
    Aggregate {
        func: AggFunc,
        arg: Option<Box<Expr>>,
        distinct: bool,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        type_name: String,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    /// Scalar or IN-list subquery.
    Subquery(Box<SelectQuery>),
    /// Subquery whose result comes from dependency `slot`.
    PlaceholderSubquery {
        slot: usize,
    },
}

impl Expr {
    pub fn column(table: &str, name: &str) -> Self {
        Expr::Column {
            table: Some(table.to_string()),
            name: name.to_string(),
        }
    }

    pub fn bare_column(name: &str) -> Self {
        Expr::Column {
            table: None,
            name: name.to_string(),
        }
    }

    pub fn int(value: i64) -> Self {
        Expr::Literal(Literal::Number(value.to_string()))
    }

    pub fn number(text: &str) -> Self {
        Expr::Literal(Literal::Number(text.to_string()))
    }

    pub fn string(value: &str) -> Self {
        Expr::Literal(Literal::String(value.to_string()))
    }

    pub fn func(name: &str, args: Vec<Expr>) -> Self {
        Expr::Func {
            name: name.to_string(),
            args,
        }
    }

    pub fn agg(func: AggFunc, arg: Expr) -> Self {
        Expr::Aggregate {
            func,
            arg: Some(Box::new(arg)),
            distinct: false,
        }
    }

    pub fn count_star() -> Self {
        Expr::Aggregate {
            func: AggFunc::Count,
            arg: None,
            distinct: false,
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::And, left, right)
    }

    pub fn cast(expr: Expr, type_name: &str) -> Self {
        Expr::Cast {
            expr: Box::new(expr),
            type_name: type_name.to_string(),
        }
    }

    pub fn subquery(query: SelectQuery) -> Self {
        Expr::Subquery(Box::new(query))
    }

    /// Whether an aggregate call appears anywhere in this expression,
    /// not counting nested subqueries.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Column { .. }
            | Expr::Literal(_)
            | Expr::Asterisk { .. }
            | Expr::Subquery(_)
            | Expr::PlaceholderSubquery { .. } => false,
            Expr::Func { args, .. } => args.iter().any(Expr::contains_aggregate),
            Expr::Binary { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            Expr::Unary { expr, .. } | Expr::Cast { expr, .. } => expr.contains_aggregate(),
            Expr::InList { expr, list, .. } => {
                expr.contains_aggregate() || list.iter().any(Expr::contains_aggregate)
            }
        }
    }

    /// Whether a subquery (resolved or placeholder) appears in this expression.
    pub fn contains_subquery(&self) -> bool {
        match self {
            Expr::Subquery(_) | Expr::PlaceholderSubquery { .. } => true,
            Expr::Column { .. } | Expr::Literal(_) | Expr::Asterisk { .. } => false,
            Expr::Aggregate { arg, .. } => arg.as_ref().is_some_and(|a| a.contains_subquery()),
            Expr::Func { args, .. } => args.iter().any(Expr::contains_subquery),
            Expr::Binary { left, right, .. } => {
                left.contains_subquery() || right.contains_subquery()
            }
            Expr::Unary { expr, .. } | Expr::Cast { expr, .. } => expr.contains_subquery(),
            Expr::InList { expr, list, .. } => {
                expr.contains_subquery() || list.iter().any(Expr::contains_subquery)
            }
        }
    }
}

/// One entry of a select list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn new(expr: Expr) -> Self {
        SelectItem { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: &str) -> Self {
        SelectItem {
            expr,
            alias: Some(alias.to_string()),
        }
    }

    /// Column name this item produces; `position` is used for anonymous
    /// expressions.
    pub fn output_name(&self, position: usize) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        match &self.expr {
            Expr::Column { name, .. } => name.clone(),
            Expr::Aggregate { func, .. } => func.as_str().to_string(),
            Expr::Func { name, .. } => name.clone(),
            _ => format!("col{position}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl JoinKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL JOIN",
            JoinKind::Cross => "CROSS JOIN",
        }
    }
}

/// An item of a FROM list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relation {
    Base {
        schema: Option<String>,
        table: String,
        alias: Option<String>,
    },
    Subquery {
        query: Box<SelectQuery>,
        alias: String,
    },
    /// Table produced by dependency `slot`, not yet known by name.
    Placeholder {
        slot: usize,
        alias: String,
    },
    Join {
        left: Box<Relation>,
        right: Box<Relation>,
        kind: JoinKind,
        on: Option<Expr>,
    },
}

impl Relation {
    pub fn base(schema: &str, table: &str, alias: Option<&str>) -> Self {
        Relation::Base {
            schema: Some(schema.to_string()),
            table: table.to_string(),
            alias: alias.map(str::to_string),
        }
    }

    pub fn subquery(query: SelectQuery, alias: &str) -> Self {
        Relation::Subquery {
            query: Box::new(query),
            alias: alias.to_string(),
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match self {
            Relation::Base { alias, .. } => alias.as_deref(),
            Relation::Subquery { alias, .. } | Relation::Placeholder { alias, .. } => Some(alias),
            Relation::Join { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderItem {
    pub expr: Expr,
    pub descending: bool,
}

/// Aggregate-aware SELECT statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SelectQuery {
    pub select_list: Vec<SelectItem>,
    pub from_list: Vec<Relation>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
}

/// What a placeholder slot is rewritten to by [`SelectQuery::substitute_slots`].
#[derive(Debug, Clone, PartialEq)]
pub enum SlotReplacement {
    /// Keep it a placeholder, renumbered to the given slot.
    Slot(usize),
    /// A concrete table produced by the dependency.
    Table { schema: String, table: String },
    /// Inline the dependency's query as a nested subquery.
    Query(SelectQuery),
}

impl SelectQuery {
    pub fn new(select_list: Vec<SelectItem>, from_list: Vec<Relation>) -> Self {
        SelectQuery {
            select_list,
            from_list,
            ..SelectQuery::default()
        }
    }

    /// `SELECT * FROM <from>`.
    pub fn select_all_from(from: Relation) -> Self {
        SelectQuery::new(
            vec![SelectItem::new(Expr::Asterisk { table: None })],
            vec![from],
        )
    }

    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_group_by(mut self, group_by: Vec<Expr>) -> Self {
        self.group_by = group_by;
        self
    }

    pub fn with_order_by(mut self, order_by: Vec<OrderItem>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether this is an aggregate query (grouped, or with an aggregate
    /// in its select list).
    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty() || self.select_list.iter().any(|i| i.expr.contains_aggregate())
    }

    /// Placeholder slots referenced anywhere in the tree, in walk order.
    pub fn placeholder_slots(&self) -> Vec<usize> {
        let mut slots = Vec::new();
        collect_query_slots(self, &mut slots);
        slots
    }

    /// Number of placeholder occurrences in the tree.
    pub fn placeholder_count(&self) -> usize {
        self.placeholder_slots().len()
    }

    /// Rewrite every placeholder through `f`.
    ///
    /// Replacements are not walked again, so a substituted query may carry
    /// slots that were already renumbered by the caller.
    pub fn substitute_slots(&mut self, f: &mut dyn FnMut(usize) -> SlotReplacement) {
        substitute_in_query(self, f);
    }

    /// Renumber every placeholder slot through `f`.
    pub fn map_slots(&mut self, mut f: impl FnMut(usize) -> usize) {
        self.substitute_slots(&mut |slot| SlotReplacement::Slot(f(slot)));
    }
}

// ── Tree walks ─────────────────────────────────────────────────────────────

fn collect_query_slots(query: &SelectQuery, out: &mut Vec<usize>) {
    for item in &query.select_list {
        collect_expr_slots(&item.expr, out);
    }
    for rel in &query.from_list {
        collect_relation_slots(rel, out);
    }
    if let Some(filter) = &query.filter {
        collect_expr_slots(filter, out);
    }
    for expr in &query.group_by {
        collect_expr_slots(expr, out);
    }
    for item in &query.order_by {
        collect_expr_slots(&item.expr, out);
    }
}

fn collect_relation_slots(rel: &Relation, out: &mut Vec<usize>) {
    match rel {
        Relation::Base { .. } => {}
        Relation::Placeholder { slot, .. } => out.push(*slot),
        Relation::Subquery { query, .. } => collect_query_slots(query, out),
        Relation::Join {
            left, right, on, ..
        } => {
            collect_relation_slots(left, out);
            collect_relation_slots(right, out);
            if let Some(on) = on {
                collect_expr_slots(on, out);
            }
        }
    }
}

fn collect_expr_slots(expr: &Expr, out: &mut Vec<usize>) {
    match expr {
        Expr::PlaceholderSubquery { slot } => out.push(*slot),
        Expr::Subquery(query) => collect_query_slots(query, out),
        Expr::Column { .. } | Expr::Literal(_) | Expr::Asterisk { .. } => {}
        Expr::Aggregate { arg, .. } => {
            if let Some(arg) = arg {
                collect_expr_slots(arg, out);
            }
        }
        Expr::Func { args, .. } => args.iter().for_each(|a| collect_expr_slots(a, out)),
        Expr::Binary { left, right, .. } => {
            collect_expr_slots(left, out);
            collect_expr_slots(right, out);
        }
        Expr::Unary { expr, .. } | Expr::Cast { expr, .. } => collect_expr_slots(expr, out),
        Expr::InList { expr, list, .. } => {
            collect_expr_slots(expr, out);
            list.iter().for_each(|e| collect_expr_slots(e, out));
        }
    }
}

fn substitute_in_query(query: &mut SelectQuery, f: &mut dyn FnMut(usize) -> SlotReplacement) {
    for item in &mut query.select_list {
        substitute_in_expr(&mut item.expr, f);
    }
    for rel in &mut query.from_list {
        substitute_in_relation(rel, f);
    }
    if let Some(filter) = &mut query.filter {
        substitute_in_expr(filter, f);
    }
    for expr in &mut query.group_by {
        substitute_in_expr(expr, f);
    }
    for item in &mut query.order_by {
        substitute_in_expr(&mut item.expr, f);
    }
}

fn substitute_in_relation(rel: &mut Relation, f: &mut dyn FnMut(usize) -> SlotReplacement) {
    if let Relation::Placeholder { slot, alias } = rel {
        let replacement = match f(*slot) {
            SlotReplacement::Slot(slot) => Relation::Placeholder {
                slot,
                alias: alias.clone(),
            },
            SlotReplacement::Table { schema, table } => Relation::Base {
                schema: Some(schema),
                table,
                alias: Some(alias.clone()),
            },
            SlotReplacement::Query(query) => Relation::Subquery {
                query: Box::new(query),
                alias: alias.clone(),
            },
        };
        *rel = replacement;
        return;
    }
    match rel {
        Relation::Base { .. } | Relation::Placeholder { .. } => {}
        Relation::Subquery { query, .. } => substitute_in_query(query, f),
        Relation::Join {
            left, right, on, ..
        } => {
            substitute_in_relation(left, f);
            substitute_in_relation(right, f);
            if let Some(on) = on {
                substitute_in_expr(on, f);
            }
        }
    }
}

fn substitute_in_expr(expr: &mut Expr, f: &mut dyn FnMut(usize) -> SlotReplacement) {
    if let Expr::PlaceholderSubquery { slot } = expr {
        let replacement = match f(*slot) {
            SlotReplacement::Slot(slot) => Expr::PlaceholderSubquery { slot },
            SlotReplacement::Table { schema, table } => {
                Expr::subquery(SelectQuery::select_all_from(Relation::Base {
                    schema: Some(schema),
                    table,
                    alias: None,
                }))
            }
            SlotReplacement::Query(query) => Expr::subquery(query),
        };
        *expr = replacement;
        return;
    }
    match expr {
        Expr::Column { .. }
        | Expr::Literal(_)
        | Expr::Asterisk { .. }
        | Expr::PlaceholderSubquery { .. } => {}
        Expr::Subquery(query) => substitute_in_query(query, f),
        Expr::Aggregate { arg, .. } => {
            if let Some(arg) = arg {
                substitute_in_expr(arg, f);
            }
        }
        Expr::Func { args, .. } => args.iter_mut().for_each(|a| substitute_in_expr(a, f)),
        Expr::Binary { left, right, .. } => {
            substitute_in_expr(left, f);
            substitute_in_expr(right, f);
        }
        Expr::Unary { expr, .. } | Expr::Cast { expr, .. } => substitute_in_expr(expr, f),
        Expr::InList { expr, list, .. } => {
            substitute_in_expr(expr, f);
            list.iter_mut().for_each(|e| substitute_in_expr(e, f));
        }
    }
}
