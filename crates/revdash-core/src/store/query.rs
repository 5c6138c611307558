//! Predicate queries over record bodies.
//!
//! Filters are evaluated by SQLite against the JSON body with
//! `json_extract`/`json_each`. Field names and values are bound as
//! parameters, never spliced into SQL text.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field == value`
    Eq(&'static str, Value),
    /// `field < value`
    Lt(&'static str, Value),
    /// Array field has at least one element.
    NonEmpty(&'static str),
    /// Array field contains `value`.
    Contains(&'static str, Value),
}

/// A keys-only query over one record kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    kind: String,
    filters: Vec<Filter>,
}

impl Query {
    #[must_use]
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn eq(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field, value.into()));
        self
    }

    #[must_use]
    pub fn lt(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lt(field, value.into()));
        self
    }

    #[must_use]
    pub fn non_empty(mut self, field: &'static str) -> Self {
        self.filters.push(Filter::NonEmpty(field));
        self
    }

    #[must_use]
    pub fn contains(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Contains(field, value.into()));
        self
    }

    #[must_use]
    pub fn kind_name(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Build `SELECT <columns> FROM records WHERE ...` with bound values.
    pub(crate) fn to_sql(&self, columns: &str) -> (String, Vec<SqlValue>) {
        let mut sql = format!("SELECT {columns} FROM records WHERE kind = ?");
        let mut values = vec![SqlValue::Text(self.kind.clone())];

        for filter in &self.filters {
            match filter {
                Filter::Eq(field, value) => {
                    sql.push_str(" AND json_extract(body, ?) = ?");
                    values.push(json_path(field));
                    values.push(sql_value(value));
                }
                Filter::Lt(field, value) => {
                    sql.push_str(" AND json_extract(body, ?) < ?");
                    values.push(json_path(field));
                    values.push(sql_value(value));
                }
                Filter::NonEmpty(field) => {
                    sql.push_str(" AND IFNULL(json_array_length(body, ?), 0) > 0");
                    values.push(json_path(field));
                }
                Filter::Contains(field, value) => {
                    sql.push_str(
                        " AND EXISTS (SELECT 1 FROM json_each(records.body, ?) AS j WHERE j.value = ?)",
                    );
                    values.push(json_path(field));
                    values.push(sql_value(value));
                }
            }
        }
        (sql, values)
    }
}

fn json_path(field: &str) -> SqlValue {
    SqlValue::Text(format!("$.{field}"))
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
