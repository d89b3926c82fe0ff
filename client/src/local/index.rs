//! In-memory table with secondary indexes.

use rollcall_engine::{Filter, IndexKey, Query};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

/// Rows of one table plus an index per indexed field.
#[derive(Debug, Clone, Default)]
pub(crate) struct IndexedTable {
    rows: BTreeMap<String, serde_json::Value>,
    indexes: HashMap<String, BTreeMap<IndexKey, BTreeSet<String>>>,
}

impl IndexedTable {
    pub fn new(indexed_fields: Vec<String>) -> Self {
        Self {
            rows: BTreeMap::new(),
            indexes: indexed_fields
                .into_iter()
                .map(|f| (f, BTreeMap::new()))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&serde_json::Value> {
        self.rows.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.rows.iter()
    }

    /// Insert or replace a row, returning the previous value.
    pub fn insert(&mut self, id: String, value: serde_json::Value) -> Option<serde_json::Value> {
        let previous = self.remove(&id);
        for (field, index) in self.indexes.iter_mut() {
            if let Some(key) = value.get(field).and_then(IndexKey::from_value) {
                index.entry(key).or_default().insert(id.clone());
            }
        }
        self.rows.insert(id, value);
        previous
    }

    pub fn remove(&mut self, id: &str) -> Option<serde_json::Value> {
        let value = self.rows.remove(id)?;
        for (field, index) in self.indexes.iter_mut() {
            if let Some(key) = value.get(field).and_then(IndexKey::from_value) {
                if let Some(ids) = index.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }
        Some(value)
    }

    /// Answer a query, using an index when one of its filters is on an
    /// indexed field.
    pub fn query(&self, query: &Query) -> Vec<serde_json::Value> {
        let limit = query.max_results().unwrap_or(usize::MAX);

        let candidates: Option<BTreeSet<&String>> = query
            .filters()
            .iter()
            .find_map(|f| self.indexes.get(f.field()).map(|index| lookup(index, f)));

        match candidates {
            Some(ids) => ids
                .into_iter()
                .filter_map(|id| self.rows.get(id))
                .filter(|v| query.matches(v))
                .take(limit)
                .cloned()
                .collect(),
            None => self
                .rows
                .values()
                .filter(|v| query.matches(v))
                .take(limit)
                .cloned()
                .collect(),
        }
    }
}

fn lookup<'a>(
    index: &'a BTreeMap<IndexKey, BTreeSet<String>>,
    filter: &Filter,
) -> BTreeSet<&'a String> {
    match filter {
        Filter::Eq { value, .. } => index
            .get(value)
            .map(|ids| ids.iter().collect())
            .unwrap_or_default(),
        Filter::Range { lower, upper, .. } => {
            if !is_valid_range(lower, upper) {
                return BTreeSet::new();
            }
            index
                .range((lower.clone(), upper.clone()))
                .flat_map(|(_, ids)| ids.iter())
                .collect()
        }
    }
}

/// `BTreeMap::range` panics on inverted bounds and on equal excluded bounds.
fn is_valid_range(lower: &Bound<IndexKey>, upper: &Bound<IndexKey>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l <= u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l < u,
        _ => true,
    }
}
