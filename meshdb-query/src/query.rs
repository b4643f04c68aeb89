//! Query assembly and execution.

use crate::condition::{CompareOp, Condition};
use crate::eval;
use meshdb_core::value::{compare_values, lookup_path};
use meshdb_core::{Document, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

/// Pagination and ordering options. A `limit` of zero means unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub skip: usize,
    pub limit: usize,
    pub sort: Vec<SortSpec>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: 100,
            sort: Vec::new(),
        }
    }
}

/// A full query: target collection, optional predicate, options.
///
/// ```
/// use meshdb_query::{CompareOp, Condition, Query, SortDirection};
/// use serde_json::json;
///
/// let query = Query::new("users")
///     .filter(Condition::and(vec![
///         Condition::field("age", CompareOp::Gte, json!(25)),
///         Condition::field("age", CompareOp::Lte, json!(35)),
///     ]))
///     .sort("name", SortDirection::Asc)
///     .limit(10);
/// assert_eq!(query.collection, "users");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub options: QueryOptions,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            condition: None,
            options: QueryOptions::default(),
        }
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Shorthand for a single-leaf filter.
    pub fn where_field(self, field: impl Into<String>, op: CompareOp, value: Value) -> Self {
        self.filter(Condition::field(field, op, value))
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.options.sort.push(SortSpec {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.options.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.options.limit = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(condition) = &self.condition {
            condition.validate()?;
        }
        Ok(())
    }

    /// Run the query over a scan of its collection. `docs` must arrive in
    /// insertion order; the sort is stable, so ties keep that order.
    pub fn execute(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        self.validate()?;

        let mut results: Vec<Document> = docs
            .into_iter()
            .filter(|doc| match &self.condition {
                Some(condition) => eval::matches(&doc.data, condition),
                None => true,
            })
            .collect();

        if !self.options.sort.is_empty() {
            results.sort_by(|a, b| self.compare_docs(a, b));
        }

        let skipped = results.into_iter().skip(self.options.skip);
        let limited: Vec<Document> = if self.options.limit > 0 {
            skipped.take(self.options.limit).collect()
        } else {
            skipped.collect()
        };

        Ok(limited)
    }

    /// Multi-key comparison. Documents missing a sort key order after
    /// documents that have it, regardless of direction.
    fn compare_docs(&self, a: &Document, b: &Document) -> Ordering {
        for spec in &self.options.sort {
            let va = lookup_path(&a.data, &spec.field);
            let vb = lookup_path(&b.data, &spec.field);
            let ord = match (va, vb) {
                (Some(va), Some(vb)) => {
                    let ord = compare_values(va, vb);
                    match spec.direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}
