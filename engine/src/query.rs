//! Query predicates over entity payloads.
//!
//! A [`Query`] is a conjunction of equality and range filters on top-level
//! payload fields. Stores answer it from a secondary index when one of the
//! filters touches an indexed field, and fall back to a scan otherwise; the
//! result is the same either way because [`Query::matches`] is always applied.

use chrono::NaiveDate;
use std::ops::Bound;

/// An orderable, indexable scalar extracted from a payload.
///
/// Dates are stored as `YYYY-MM-DD` strings, so string ordering is date
/// ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKey {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl IndexKey {
    /// Extract a key from a JSON value. Objects, arrays, nulls and
    /// non-integral numbers are not indexable.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(IndexKey::Bool(*b)),
            serde_json::Value::Number(n) => n.as_i64().map(IndexKey::Int),
            serde_json::Value::String(s) => Some(IndexKey::Str(s.clone())),
            _ => None,
        }
    }
}

impl From<&str> for IndexKey {
    fn from(s: &str) -> Self {
        IndexKey::Str(s.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(s: String) -> Self {
        IndexKey::Str(s)
    }
}

impl From<&String> for IndexKey {
    fn from(s: &String) -> Self {
        IndexKey::Str(s.clone())
    }
}

impl From<i64> for IndexKey {
    fn from(n: i64) -> Self {
        IndexKey::Int(n)
    }
}

impl From<u32> for IndexKey {
    fn from(n: u32) -> Self {
        IndexKey::Int(n as i64)
    }
}

impl From<bool> for IndexKey {
    fn from(b: bool) -> Self {
        IndexKey::Bool(b)
    }
}

impl From<NaiveDate> for IndexKey {
    fn from(d: NaiveDate) -> Self {
        IndexKey::Str(d.format("%Y-%m-%d").to_string())
    }
}

/// A single predicate on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq {
        field: String,
        value: IndexKey,
    },
    Range {
        field: String,
        lower: Bound<IndexKey>,
        upper: Bound<IndexKey>,
    },
}

impl Filter {
    /// The field this filter constrains.
    pub fn field(&self) -> &str {
        match self {
            Filter::Eq { field, .. } | Filter::Range { field, .. } => field,
        }
    }

    /// Whether `key` satisfies this filter.
    pub fn accepts(&self, key: &IndexKey) -> bool {
        match self {
            Filter::Eq { value, .. } => key == value,
            Filter::Range { lower, upper, .. } => {
                let above = match lower {
                    Bound::Included(l) => key >= l,
                    Bound::Excluded(l) => key > l,
                    Bound::Unbounded => true,
                };
                let below = match upper {
                    Bound::Included(u) => key <= u,
                    Bound::Excluded(u) => key < u,
                    Bound::Unbounded => true,
                };
                above && below
            }
        }
    }

    /// Whether `payload` satisfies this filter. A missing or non-indexable
    /// field never matches.
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        payload
            .get(self.field())
            .and_then(IndexKey::from_value)
            .is_some_and(|key| self.accepts(&key))
    }
}

/// A conjunction of filters with an optional result limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    filters: Vec<Filter>,
    limit: Option<usize>,
}

impl Query {
    /// A query matching every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Require `field == value`.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<IndexKey>) -> Self {
        self.filters.push(Filter::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Require `lower <= field <= upper`.
    pub fn between(
        self,
        field: impl Into<String>,
        lower: impl Into<IndexKey>,
        upper: impl Into<IndexKey>,
    ) -> Self {
        self.range(
            field,
            Bound::Included(lower.into()),
            Bound::Included(upper.into()),
        )
    }

    /// Require `field >= lower`.
    pub fn since(self, field: impl Into<String>, lower: impl Into<IndexKey>) -> Self {
        self.range(field, Bound::Included(lower.into()), Bound::Unbounded)
    }

    /// Require `field < upper`.
    pub fn before(self, field: impl Into<String>, upper: impl Into<IndexKey>) -> Self {
        self.range(field, Bound::Unbounded, Bound::Excluded(upper.into()))
    }

    /// Require the field to fall within explicit bounds.
    pub fn range(
        mut self,
        field: impl Into<String>,
        lower: Bound<IndexKey>,
        upper: Bound<IndexKey>,
    ) -> Self {
        self.filters.push(Filter::Range {
            field: field.into(),
            lower,
            upper,
        });
        self
    }

    /// Return at most `n` records.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn max_results(&self) -> Option<usize> {
        self.limit
    }

    /// Whether a payload satisfies every filter.
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        self.filters.iter().all(|f| f.matches(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn index_key_extraction() {
        assert_eq!(IndexKey::from_value(&json!("7A")), Some(IndexKey::from("7A")));
        assert_eq!(IndexKey::from_value(&json!(5)), Some(IndexKey::Int(5)));
        assert_eq!(IndexKey::from_value(&json!(true)), Some(IndexKey::Bool(true)));
        assert_eq!(IndexKey::from_value(&json!(1.5)), None);
        assert_eq!(IndexKey::from_value(&json!(null)), None);
        assert_eq!(IndexKey::from_value(&json!({"a": 1})), None);
    }

    #[test]
    fn date_keys_order_chronologically() {
        let a: IndexKey = NaiveDate::from_ymd_opt(2024, 7, 9).unwrap().into();
        let b: IndexKey = NaiveDate::from_ymd_opt(2024, 7, 15).unwrap().into();
        assert!(a < b);
        assert_eq!(a, IndexKey::from("2024-07-09"));
    }

    #[test]
    fn equality_filter() {
        let q = Query::all().eq("className", "7A");
        assert!(q.matches(&json!({"className": "7A"})));
        assert!(!q.matches(&json!({"className": "7B"})));
        assert!(!q.matches(&json!({"name": "no class"})));
    }

    #[test]
    fn range_filters() {
        let q = Query::all().between("date", "2024-07-01", "2024-07-31");
        assert!(q.matches(&json!({"date": "2024-07-01"})));
        assert!(q.matches(&json!({"date": "2024-07-31"})));
        assert!(!q.matches(&json!({"date": "2024-08-01"})));

        let q = Query::all().before("minutesLate", 10i64);
        assert!(q.matches(&json!({"minutesLate": 9})));
        assert!(!q.matches(&json!({"minutesLate": 10})));

        let q = Query::all().since("minutesLate", 10i64);
        assert!(q.matches(&json!({"minutesLate": 10})));
        assert!(!q.matches(&json!({"minutesLate": 3})));
    }

    #[test]
    fn filters_are_conjunctive() {
        let q = Query::all()
            .eq("studentId", "S1")
            .since("date", "2024-07-10");
        assert!(q.matches(&json!({"studentId": "S1", "date": "2024-07-12"})));
        assert!(!q.matches(&json!({"studentId": "S2", "date": "2024-07-12"})));
        assert!(!q.matches(&json!({"studentId": "S1", "date": "2024-07-01"})));
    }

    #[test]
    fn empty_query_matches_everything() {
        let q = Query::all().limit(3);
        assert!(q.matches(&json!({})));
        assert_eq!(q.max_results(), Some(3));
        assert!(q.filters().is_empty());
    }
}
