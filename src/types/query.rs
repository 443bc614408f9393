use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_LIMIT: u32 = 10;
pub const DEFAULT_PAGE: u32 = 1;
pub const MAX_LIMIT: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// `key=value`
    Exact,
    /// `key~value`, substring match
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub key: String,
    pub value: String,
    pub mode: MatchMode,
}

impl Condition {
    pub fn exact(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            mode: MatchMode::Exact,
        }
    }

    pub fn fuzzy(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            mode: MatchMode::Fuzzy,
        }
    }
}

/// Filtering, paging and ordering for list operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub conditions: Vec<Condition>,
    pub limit: u32,
    pub page: u32,
    pub order_by: Option<String>,
    pub reverse: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            conditions: Vec::new(),
            limit: DEFAULT_LIMIT,
            page: DEFAULT_PAGE,
            order_by: None,
            reverse: false,
        }
    }
}

impl ListQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `key=value,key~value`. Empty input yields no conditions.
    pub fn parse_conditions(input: &str) -> Result<Vec<Condition>> {
        let mut conditions = Vec::new();
        for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (idx, mode) = match (part.find('='), part.find('~')) {
                (Some(eq), Some(tilde)) if tilde < eq => (tilde, MatchMode::Fuzzy),
                (Some(eq), _) => (eq, MatchMode::Exact),
                (None, Some(tilde)) => (tilde, MatchMode::Fuzzy),
                (None, None) => {
                    return Err(Error::validation(format!(
                        "condition '{part}' must be key=value or key~value"
                    )));
                }
            };
            let key = part[..idx].trim();
            let value = part[idx + 1..].trim();
            if key.is_empty() {
                return Err(Error::validation(format!("condition '{part}' has no key")));
            }
            conditions.push(Condition {
                key: key.to_string(),
                value: value.to_string(),
                mode,
            });
        }
        Ok(conditions)
    }

    /// Parses `limit=%d,page=%d`; missing fields keep their defaults.
    pub fn parse_paging(input: &str) -> Result<(u32, u32)> {
        let mut limit = DEFAULT_LIMIT;
        let mut page = DEFAULT_PAGE;
        for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::validation(format!("invalid paging '{part}'")))?;
            let n: u32 = value
                .trim()
                .parse()
                .map_err(|_| Error::validation(format!("invalid paging value '{value}'")))?;
            match key.trim() {
                "limit" => limit = n,
                "page" => page = n,
                other => {
                    return Err(Error::validation(format!("unknown paging key '{other}'")));
                }
            }
        }
        Ok((limit, page))
    }

    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    #[must_use]
    pub fn ordered_by(mut self, field: impl Into<String>, reverse: bool) -> Self {
        self.order_by = Some(field.into());
        self.reverse = reverse;
        self
    }

    /// Clamped page size.
    #[must_use]
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_LIMIT)
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.effective_limit())
    }

    pub fn condition(&self, key: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.key == key)
    }
}

/// A page of results together with the unpaged total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64) -> Self {
        Self { items, total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conditions() {
        let conds = ListQuery::parse_conditions("name~ngi, status=active").unwrap();
        assert_eq!(conds.len(), 2);
        assert_eq!(conds[0], Condition::fuzzy("name", "ngi"));
        assert_eq!(conds[1], Condition::exact("status", "active"));
    }

    #[test]
    fn test_tilde_before_equals_is_fuzzy() {
        let conds = ListQuery::parse_conditions("description~a=b").unwrap();
        assert_eq!(conds[0], Condition::fuzzy("description", "a=b"));
    }

    #[test]
    fn test_parse_conditions_rejects_garbage() {
        assert!(ListQuery::parse_conditions("name").is_err());
        assert!(ListQuery::parse_conditions("=x").is_err());
        assert!(ListQuery::parse_conditions("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_paging() {
        assert_eq!(ListQuery::parse_paging("limit=100,page=3").unwrap(), (100, 3));
        assert_eq!(ListQuery::parse_paging("").unwrap(), (10, 1));
        assert!(ListQuery::parse_paging("limit=x").is_err());
        assert!(ListQuery::parse_paging("size=1").is_err());
    }

    #[test]
    fn test_offset() {
        let q = ListQuery::new().with_limit(20).with_page(3);
        assert_eq!(q.offset(), 40);
        let q = ListQuery::new().with_limit(0).with_page(0);
        assert_eq!(q.effective_limit(), 1);
        assert_eq!(q.offset(), 0);
    }
}
