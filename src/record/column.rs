//! Typed column values and the per-column merge strategies.
//!
//! A column's merged value is computed by [`Column::merged_value`], which
//! applies the column's [`MergeStrategy`]. Columns of different names,
//! strategies or kinds never merge with each other.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declared kind of a column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    String,
    Integer,
    Long,
    Double,
    Bytes,
}

impl ColumnKind {
    /// Returns the kind name as used in logs and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Long => "long",
            Self::Double => "double",
            Self::Bytes => "bytes",
        }
    }
}

/// A column value. The variant determines the column kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Integer(i32),
    Long(i64),
    Double(f64),
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns the kind of this value.
    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::String(_) => ColumnKind::String,
            Self::Integer(_) => ColumnKind::Integer,
            Self::Long(_) => ColumnKind::Long,
            Self::Double(_) => ColumnKind::Double,
            Self::Bytes(_) => ColumnKind::Bytes,
        }
    }

    /// Total order over values, used as the Cover tie-break.
    ///
    /// Values of different kinds order by kind. Doubles use IEEE 754
    /// `totalOrder` so NaN and signed zeros are still ordered.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Long(a), Self::Long(b)) => a.cmp(b),
            (Self::Double(a), Self::Double(b)) => a.total_cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            _ => self.kind().cmp(&other.kind()),
        }
    }

    /// Equality that treats doubles bitwise, so NaN == NaN for merge checks.
    fn same_as(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

/// Reduction rule attached to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Last (or only) write wins. Immutable identifiers, raw payloads.
    Replace,
    /// Newest write wins, decided by the owning record's update time.
    Cover,
    /// Numeric accumulation.
    Sum,
    /// Write-once. Merging two different values is a conflict.
    NonMergeable,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Cover => "cover",
            Self::Sum => "sum",
            Self::NonMergeable => "non_mergeable",
        }
    }
}

/// Errors raised when two records or columns cannot be merged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    #[error("record id mismatch: {left} vs {right}")]
    IdMismatch { left: String, right: String },

    #[error("record {id}: column layout mismatch at position {position}")]
    LayoutMismatch { id: String, position: usize },

    #[error("column {column}: strategy mismatch ({left} vs {right})")]
    StrategyMismatch {
        column: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("column {column}: kind mismatch ({left} vs {right})")]
    KindMismatch {
        column: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("column {column}: sum is not defined for {kind} values")]
    NotSummable { column: String, kind: &'static str },

    #[error("column {column}: conflicting values for non-mergeable column")]
    Conflict { column: String },
}

/// A named, typed value slot with an attached merge strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub strategy: MergeStrategy,
    pub value: Value,
}

impl Column {
    pub fn new(name: impl Into<String>, strategy: MergeStrategy, value: Value) -> Self {
        Self {
            name: name.into(),
            strategy,
            value,
        }
    }

    pub fn replace(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, MergeStrategy::Replace, value)
    }

    pub fn cover(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, MergeStrategy::Cover, value)
    }

    pub fn sum(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, MergeStrategy::Sum, value)
    }

    pub fn non_mergeable(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, MergeStrategy::NonMergeable, value)
    }

    /// Returns the declared kind of this column.
    pub fn kind(&self) -> ColumnKind {
        self.value.kind()
    }

    /// Computes the merged value of `self` and `other` without mutating.
    ///
    /// `other_is_newer` decides Cover columns: it is true when the record
    /// carrying `other` has the newer update time, and is `None` on a tie,
    /// in which case the greater value wins.
    pub fn merged_value(
        &self,
        other: &Column,
        other_is_newer: Option<bool>,
    ) -> Result<Value, MergeError> {
        if self.strategy != other.strategy {
            return Err(MergeError::StrategyMismatch {
                column: self.name.clone(),
                left: self.strategy.as_str(),
                right: other.strategy.as_str(),
            });
        }
        if self.kind() != other.kind() {
            return Err(MergeError::KindMismatch {
                column: self.name.clone(),
                left: self.kind().as_str(),
                right: other.kind().as_str(),
            });
        }

        match self.strategy {
            MergeStrategy::Replace => Ok(other.value.clone()),
            MergeStrategy::Cover => {
                let take_other = match other_is_newer {
                    Some(newer) => newer,
                    None => other.value.total_cmp(&self.value) == Ordering::Greater,
                };
                if take_other {
                    Ok(other.value.clone())
                } else {
                    Ok(self.value.clone())
                }
            }
            MergeStrategy::Sum => sum_values(&self.name, &self.value, &other.value),
            MergeStrategy::NonMergeable => {
                if self.value.same_as(&other.value) {
                    Ok(self.value.clone())
                } else {
                    Err(MergeError::Conflict {
                        column: self.name.clone(),
                    })
                }
            }
        }
    }
}

fn sum_values(column: &str, a: &Value, b: &Value) -> Result<Value, MergeError> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(Value::Integer(x.wrapping_add(*y))),
        (Value::Long(x), Value::Long(y)) => Ok(Value::Long(x.wrapping_add(*y))),
        (Value::Double(x), Value::Double(y)) => Ok(Value::Double(x + y)),
        _ => Err(MergeError::NotSummable {
            column: column.to_string(),
            kind: a.kind().as_str(),
        }),
    }
}
