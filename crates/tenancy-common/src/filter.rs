//! Filter query builder for list/count operations
//!
//! Every filter pushes its parameter and takes its `?N` placeholder in the
//! same step, so numbering cannot drift from argument order however the
//! optional filters combine.

use rusqlite::types::Value;

/// Comparison operator
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

impl Cmp {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Like => "LIKE",
        }
    }
}

/// Query over a single table or view with optional filters
#[derive(Debug, Clone)]
pub struct FilterQuery {
    from: &'static str,
    clauses: Vec<String>,
    params: Vec<Value>,
    order_by: Option<&'static str>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl FilterQuery {
    /// Start a query over `from`
    pub fn from(from: &'static str) -> Self {
        Self {
            from,
            clauses: Vec::new(),
            params: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
        }
    }

    /// Add `column <cmp> value`
    pub fn filter(mut self, column: &'static str, cmp: Cmp, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self.clauses
            .push(format!("{column} {} ?{}", cmp.as_sql(), self.params.len()));
        self
    }

    /// Add the filter only when `value` is present
    pub fn filter_opt<V: Into<Value>>(self, column: &'static str, cmp: Cmp, value: Option<V>) -> Self {
        match value {
            Some(v) => self.filter(column, cmp, v),
            None => self,
        }
    }

    /// Raw `ORDER BY` clause
    pub fn order_by(mut self, clause: &'static str) -> Self {
        self.order_by = Some(clause);
        self
    }

    /// `LIMIT`
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `OFFSET`; without a limit the page is unbounded
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Number of filters applied
    pub fn filter_count(&self) -> usize {
        self.clauses.len()
    }

    fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    /// `SELECT <columns> ...` with ordering and paging
    pub fn build_select(&self, columns: &str) -> (String, Vec<Value>) {
        let mut sql = format!("SELECT {columns} FROM {}{}", self.from, self.where_clause());
        let mut params = self.params.clone();

        if let Some(order) = self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        if self.limit.is_some() || self.offset.is_some() {
            params.push(Value::Integer(self.limit.unwrap_or(-1)));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
        }
        if let Some(offset) = self.offset {
            params.push(Value::Integer(offset));
            sql.push_str(&format!(" OFFSET ?{}", params.len()));
        }
        (sql, params)
    }

    /// `SELECT COUNT(*) ...` with the same filters, no paging
    pub fn build_count(&self) -> (String, Vec<Value>) {
        (
            format!("SELECT COUNT(*) FROM {}{}", self.from, self.where_clause()),
            self.params.clone(),
        )
    }
}
