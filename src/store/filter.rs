use rusqlite::types::Value;
use rusqlite::{Connection, Row, params_from_iter};

use crate::error::{Error, Result};
use crate::types::{ListQuery, MatchMode, Page};

/// Which list keys map to which SQL columns for one entity.
pub(crate) struct Fields {
    pub filters: &'static [(&'static str, &'static str)],
    pub orders: &'static [(&'static str, &'static str)],
    pub default_order: &'static str,
    /// Stable tie-breaker appended to every ORDER BY.
    pub tiebreak: &'static str,
    /// When set, rows in status 'deleted' are hidden unless the caller filters on status.
    pub status_column: Option<&'static str>,
}

fn lookup(pairs: &[(&'static str, &'static str)], key: &str) -> Option<&'static str> {
    pairs.iter().find(|(k, _)| *k == key).map(|(_, col)| *col)
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Default)]
pub(crate) struct Filter {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a clause with anonymous `?` placeholders, bound in order.
    pub fn push(&mut self, clause: impl Into<String>, params: impl IntoIterator<Item = Value>) {
        self.clauses.push(clause.into());
        self.params.extend(params);
    }

    pub fn apply(&mut self, query: &ListQuery, fields: &Fields) -> Result<()> {
        for cond in &query.conditions {
            let column = lookup(fields.filters, &cond.key)
                .ok_or_else(|| Error::validation(format!("unknown filter key '{}'", cond.key)))?;
            match cond.mode {
                MatchMode::Exact => {
                    self.push(format!("{column} = ?"), [Value::Text(cond.value.clone())]);
                }
                MatchMode::Fuzzy => {
                    self.push(
                        format!("{column} LIKE ? ESCAPE '\\'"),
                        [Value::Text(format!("%{}%", escape_like(&cond.value)))],
                    );
                }
            }
        }
        if let Some(status) = fields.status_column {
            if query.condition("status").is_none() {
                self.push(format!("{status} != 'deleted'"), []);
            }
        }
        Ok(())
    }

    pub fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

pub(crate) fn order_sql(query: &ListQuery, fields: &Fields) -> Result<String> {
    let column = match query.order_by.as_deref() {
        Some(field) => lookup(fields.orders, field)
            .ok_or_else(|| Error::validation(format!("cannot order by '{field}'")))?,
        None => fields.default_order,
    };
    let dir = if query.reverse { "DESC" } else { "ASC" };
    Ok(format!(" ORDER BY {column} {dir}, {} {dir}", fields.tiebreak))
}

/// Runs the count and page queries for a filtered list.
pub(crate) fn query_page<T, F>(
    conn: &Connection,
    select: &str,
    from: &str,
    filter: &Filter,
    order: &str,
    query: &ListQuery,
    map: F,
) -> Result<Page<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let where_sql = filter.where_sql();

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {from}{where_sql}"),
        params_from_iter(filter.params().iter()),
        |row| row.get(0),
    )?;

    let mut params = filter.params().to_vec();
    params.push(Value::Integer(i64::from(query.effective_limit())));
    params.push(Value::Integer(query.offset() as i64));

    let mut stmt =
        conn.prepare(&format!("SELECT {select} FROM {from}{where_sql}{order} LIMIT ? OFFSET ?"))?;
    let items = stmt
        .query_map(params_from_iter(params.iter()), map)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Page::new(items, total))
}
