//! # meshdb Query Engine
//!
//! Composable boolean + comparison predicates over nested document fields,
//! with stable sorting and skip/limit pagination.
//!
//! A query is a condition tree evaluated by full scan over a collection:
//!
//! ```text
//!   Query ── Condition ──┬── Leaf(field, op, value)
//!            (optional)  ├── And([Condition])
//!                        ├── Or([Condition])
//!                        └── Not(Condition)
//! ```
//!
//! Field paths use dotted notation (`address.city`). A path that fails to
//! resolve is not an error: the field is "absent", which satisfies
//! `exists: false` and `nin`, and fails every other operator.

mod condition;
mod eval;
mod query;

pub use condition::{CompareOp, Condition, LogicalOp};
pub use query::{Query, QueryOptions, SortDirection, SortSpec};
