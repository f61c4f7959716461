//! Scan predicates: conjunctions of per-column range bounds.
//!
//! A predicate both prunes row groups from statistics and filters
//! decoded rows, so pruning can never change scan results, only skip
//! work. Bounds on columns absent from a file's schema are ignored for
//! pruning and filtering alike.

use crate::segment::format::{RowGroupMeta, Scalar, Schema};
use crate::segment::ColumnValue;
use std::cmp::Ordering;

/// Inclusive range bound on a single column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBound {
    pub column: String,
    pub min: Option<Scalar>,
    pub max: Option<Scalar>,
}

/// Conjunction of column bounds; the empty predicate matches all rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPredicate {
    bounds: Vec<ColumnBound>,
}

impl ScanPredicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bound(
        mut self,
        column: impl Into<String>,
        min: Option<Scalar>,
        max: Option<Scalar>,
    ) -> Self {
        self.bounds.push(ColumnBound {
            column: column.into(),
            min,
            max,
        });
        self
    }

    /// Bound on an Int64 column, inclusive on both ends.
    pub fn with_int_range(self, column: impl Into<String>, min: Option<i64>, max: Option<i64>) -> Self {
        self.with_bound(column, min.map(Scalar::Int), max.map(Scalar::Int))
    }

    /// Equality bound on a Utf8 column.
    pub fn with_str_eq(self, column: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        self.with_bound(column, Some(Scalar::Str(value.clone())), Some(Scalar::Str(value)))
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn bounds(&self) -> &[ColumnBound] {
        &self.bounds
    }

    /// Columns this predicate needs materialized to filter rows.
    pub fn columns(&self) -> Vec<&str> {
        self.bounds.iter().map(|b| b.column.as_str()).collect()
    }

    /// True when statistics prove no row in the group can match.
    ///
    /// Sound for conjunctions of range bounds: the group is excluded
    /// only when some bound is provably disjoint from the column's
    /// `[min, max]`, or when the column is entirely null (a range bound
    /// never matches null).
    pub fn excludes_group(&self, schema: &Schema, group: &RowGroupMeta) -> bool {
        for bound in &self.bounds {
            let Some(idx) = schema.iter().position(|c| c.name == bound.column) else {
                continue;
            };
            let stats = &group.columns[idx].stats;
            if (bound.min.is_some() || bound.max.is_some()) && stats.all_null() {
                return true;
            }
            if let (Some(bound_min), Some(stat_max)) = (&bound.min, &stats.max) {
                if stat_max.cmp_same(bound_min) == Some(Ordering::Less) {
                    return true;
                }
            }
            if let (Some(bound_max), Some(stat_min)) = (&bound.max, &stats.min) {
                if stat_min.cmp_same(bound_max) == Some(Ordering::Greater) {
                    return true;
                }
            }
        }
        false
    }

    /// Row-level evaluation over a decoded full-arity row.
    pub fn matches_row(&self, schema: &Schema, row: &[ColumnValue]) -> bool {
        for bound in &self.bounds {
            let Some(idx) = schema.iter().position(|c| c.name == bound.column) else {
                continue;
            };
            let Some(value) = row[idx].scalar() else {
                // Null (or unordered Json) never satisfies a range bound.
                return false;
            };
            if let Some(min) = &bound.min {
                match value.cmp_same(min) {
                    Some(Ordering::Less) | None => return false,
                    _ => {}
                }
            }
            if let Some(max) = &bound.max {
                match value.cmp_same(max) {
                    Some(Ordering::Greater) | None => return false,
                    _ => {}
                }
            }
        }
        true
    }
}
