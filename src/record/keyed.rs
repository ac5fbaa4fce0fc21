use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::worker::RoutingKey;

use super::column::{Column, MergeError, MergeStrategy, Value};

/// Builds the deterministic record id for an entity in a time bucket.
pub fn record_id(time_bucket: i64, entity_id: &str) -> String {
    format!("{time_bucket}_{entity_id}")
}

/// An aggregate entity in one time bucket, mergeable with any record that
/// shares its id.
///
/// The id is derived from `(time_bucket, entity_id)`, so two records for the
/// same logical fact in the same window always collide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedRecord {
    id: String,
    entity_id: String,
    time_bucket: i64,
    /// Milliseconds since the epoch of the newest contributing write.
    last_update: i64,
    columns: Vec<Column>,
}

impl KeyedRecord {
    /// Creates an empty record for `entity_id` in `time_bucket`.
    pub fn new(entity_id: impl Into<String>, time_bucket: i64) -> Self {
        let entity_id = entity_id.into();
        Self {
            id: record_id(time_bucket, &entity_id),
            entity_id,
            time_bucket,
            last_update: 0,
            columns: Vec::new(),
        }
    }

    pub fn with_last_update(mut self, last_update: i64) -> Self {
        self.last_update = last_update;
        self
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn time_bucket(&self) -> i64 {
        self.time_bucket
    }

    pub fn last_update(&self) -> i64 {
        self.last_update
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.column(name).map(|c| &c.value)
    }

    pub fn long(&self, name: &str) -> Option<i64> {
        match self.value(name)? {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i32> {
        match self.value(name)? {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn double(&self, name: &str) -> Option<f64> {
        match self.value(name)? {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.value(name)? {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        match self.value(name)? {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// True if any column accumulates with [`MergeStrategy::Sum`].
    ///
    /// Such records depend on stored state to stay correct across restarts
    /// and flush cycles, so persistence reads them before writing.
    pub fn has_sum_columns(&self) -> bool {
        self.columns
            .iter()
            .any(|c| c.strategy == MergeStrategy::Sum)
    }

    /// Merges `other` into `self` column by column.
    ///
    /// Either every column merges and `self` is replaced by the result, or
    /// an error is returned and `self` is left untouched.
    pub fn merge(&mut self, other: &KeyedRecord) -> Result<(), MergeError> {
        if self.id != other.id {
            return Err(MergeError::IdMismatch {
                left: self.id.clone(),
                right: other.id.clone(),
            });
        }
        if self.columns.len() != other.columns.len() {
            return Err(MergeError::LayoutMismatch {
                id: self.id.clone(),
                position: self.columns.len().min(other.columns.len()),
            });
        }

        let other_is_newer = self.other_is_newer(other);

        let mut merged = Vec::with_capacity(self.columns.len());
        for (position, (mine, theirs)) in self.columns.iter().zip(&other.columns).enumerate() {
            if mine.name != theirs.name {
                return Err(MergeError::LayoutMismatch {
                    id: self.id.clone(),
                    position,
                });
            }
            merged.push(mine.merged_value(theirs, other_is_newer)?);
        }

        for (column, value) in self.columns.iter_mut().zip(merged) {
            column.value = value;
        }
        self.last_update = self.last_update.max(other.last_update);

        Ok(())
    }

    /// Merges `other` into `self`, matching columns by name instead of
    /// position. Used when a stored record may predate a layout change.
    ///
    /// A column only `other` has is taken as is, so a summed column missing
    /// from `self` counts from zero. A column only `self` has is kept. The
    /// result follows `other`'s column order, then the columns only `self`
    /// has. Like [`merge`](Self::merge), it is all-or-nothing.
    pub fn merge_by_name(&mut self, other: &KeyedRecord) -> Result<(), MergeError> {
        if self.id != other.id {
            return Err(MergeError::IdMismatch {
                left: self.id.clone(),
                right: other.id.clone(),
            });
        }

        let other_is_newer = self.other_is_newer(other);

        let mut merged = Vec::with_capacity(self.columns.len().max(other.columns.len()));
        for theirs in &other.columns {
            let column = match self.column(&theirs.name) {
                Some(mine) => Column::new(
                    mine.name.clone(),
                    mine.strategy,
                    mine.merged_value(theirs, other_is_newer)?,
                ),
                None => theirs.clone(),
            };
            merged.push(column);
        }
        for mine in &self.columns {
            if other.column(&mine.name).is_none() {
                merged.push(mine.clone());
            }
        }

        self.columns = merged;
        self.last_update = self.last_update.max(other.last_update);

        Ok(())
    }

    fn other_is_newer(&self, other: &KeyedRecord) -> Option<bool> {
        match other.last_update.cmp(&self.last_update) {
            Ordering::Greater => Some(true),
            Ordering::Less => Some(false),
            Ordering::Equal => None,
        }
    }

    /// Returns a copy of this record moved to another time bucket, with the
    /// id recomputed.
    pub fn rebucket(&self, time_bucket: i64) -> Self {
        Self {
            id: record_id(time_bucket, &self.entity_id),
            entity_id: self.entity_id.clone(),
            time_bucket,
            last_update: self.last_update,
            columns: self.columns.clone(),
        }
    }
}

impl RoutingKey for KeyedRecord {
    fn routing_key(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calls(entity: &str, bucket: i64, n: i64) -> KeyedRecord {
        KeyedRecord::new(entity, bucket).with_column(Column::sum("calls", Value::Long(n)))
    }

    fn full(bucket: i64, ts: i64, calls: i64, status: i32, segment: &str) -> KeyedRecord {
        KeyedRecord::new("svcA", bucket)
            .with_last_update(ts)
            .with_column(Column::non_mergeable(
                "service",
                Value::String("svcA".into()),
            ))
            .with_column(Column::sum("calls", Value::Long(calls)))
            .with_column(Column::cover("status", Value::Integer(status)))
            .with_column(Column::replace(
                "segment",
                Value::String(segment.to_string()),
            ))
    }

    #[test]
    fn test_id_is_bucket_then_entity() {
        let r = KeyedRecord::new("svcA", 202401011230);
        assert_eq!(r.id(), "202401011230_svcA");
        assert_eq!(record_id(7, "x"), "7_x");
    }

    #[test]
    fn test_merge_sums_calls() {
        let mut a = calls("svcA", 1, 1);
        a.merge(&calls("svcA", 1, 1)).unwrap();
        assert_eq!(a.long("calls"), Some(2));
    }

    #[test]
    fn test_merge_rejects_other_id() {
        let mut a = calls("svcA", 1, 1);
        let err = a.merge(&calls("svcB", 1, 1)).unwrap_err();
        assert!(matches!(err, MergeError::IdMismatch { .. }));
        assert_eq!(a.long("calls"), Some(1));
    }

    #[test]
    fn test_merge_is_all_or_nothing() {
        let mut a = KeyedRecord::new("svcA", 1)
            .with_column(Column::sum("calls", Value::Long(1)))
            .with_column(Column::non_mergeable("name", Value::String("a".into())));
        let b = KeyedRecord::new("svcA", 1)
            .with_column(Column::sum("calls", Value::Long(5)))
            .with_column(Column::non_mergeable("name", Value::String("b".into())));
        assert!(matches!(a.merge(&b), Err(MergeError::Conflict { .. })));
        assert_eq!(a.long("calls"), Some(1));
    }

    #[test]
    fn test_merge_rejects_layout_mismatch() {
        let mut a = calls("svcA", 1, 1);
        let b = KeyedRecord::new("svcA", 1).with_column(Column::sum("errors", Value::Long(1)));
        assert!(matches!(
            a.merge(&b),
            Err(MergeError::LayoutMismatch { position: 0, .. })
        ));
    }

    #[test]
    fn test_merge_by_name_counts_new_sum_from_zero() {
        let mut stored = calls("svcA", 1, 100);
        let delta = KeyedRecord::new("svcA", 1)
            .with_column(Column::sum("calls", Value::Long(1)))
            .with_column(Column::sum("errors", Value::Long(1)));

        stored.merge_by_name(&delta).unwrap();

        assert_eq!(stored.long("calls"), Some(101));
        assert_eq!(stored.long("errors"), Some(1));
        assert_eq!(stored.columns()[1].name, "errors");
    }

    #[test]
    fn test_merge_by_name_keeps_dropped_columns() {
        let mut stored = KeyedRecord::new("svcA", 1)
            .with_column(Column::sum("legacy", Value::Long(7)))
            .with_column(Column::sum("calls", Value::Long(2)));

        stored.merge_by_name(&calls("svcA", 1, 3)).unwrap();

        assert_eq!(stored.long("calls"), Some(5));
        assert_eq!(stored.long("legacy"), Some(7));
        assert_eq!(stored.columns()[0].name, "calls");
    }

    #[test]
    fn test_merge_by_name_is_all_or_nothing() {
        let mut stored = KeyedRecord::new("svcA", 1)
            .with_column(Column::sum("calls", Value::Long(2)))
            .with_column(Column::sum("latency", Value::Double(1.5)));
        let before = stored.clone();
        let delta = KeyedRecord::new("svcA", 1)
            .with_column(Column::sum("calls", Value::Long(1)))
            .with_column(Column::sum("latency", Value::Long(3)));

        assert!(matches!(
            stored.merge_by_name(&delta),
            Err(MergeError::KindMismatch { .. })
        ));
        assert_eq!(stored, before);
    }

    #[test]
    fn test_merge_commutative() {
        let a = full(1, 10, 3, 1, "s1");
        let b = full(1, 20, 4, 2, "s1");

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();

        assert_eq!(ab, ba);
        assert_eq!(ab.long("calls"), Some(7));
        assert_eq!(ab.integer("status"), Some(2));
        assert_eq!(ab.last_update(), 20);
    }

    #[test]
    fn test_merge_associative() {
        let a = full(1, 10, 1, 5, "s1");
        let b = full(1, 30, 2, 1, "s1");
        let c = full(1, 30, 4, 3, "s1");

        let mut left = a.clone();
        left.merge(&b).unwrap();
        left.merge(&c).unwrap();

        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut right = a.clone();
        right.merge(&bc).unwrap();

        assert_eq!(left, right);
        assert_eq!(left.long("calls"), Some(7));
        assert_eq!(left.integer("status"), Some(3));
    }

    #[test]
    fn test_duplicate_delivery() {
        let a = full(1, 10, 1, 2, "s1");
        let mut twice = a.clone();
        twice.merge(&a).unwrap();

        // Sum doubles, Cover/Replace/NonMergeable stay put.
        assert_eq!(twice.long("calls"), Some(2));
        assert_eq!(twice.integer("status"), Some(2));
        assert_eq!(twice.string("segment"), Some("s1"));
        assert_eq!(twice.string("service"), Some("svcA"));
    }

    #[test]
    fn test_has_sum_columns() {
        assert!(calls("svcA", 1, 1).has_sum_columns());
        let only_cover =
            KeyedRecord::new("svcA", 1).with_column(Column::cover("status", Value::Integer(1)));
        assert!(!only_cover.has_sum_columns());
    }

    #[test]
    fn test_rebucket_recomputes_id() {
        let r = calls("svcA", 202401011230, 5).rebucket(2024010112);
        assert_eq!(r.id(), "2024010112_svcA");
        assert_eq!(r.time_bucket(), 2024010112);
        assert_eq!(r.long("calls"), Some(5));
    }
}
