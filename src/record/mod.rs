pub mod bucket;
pub mod codec;
pub mod column;
pub mod keyed;

pub use bucket::{downsample, time_bucket, BucketError, Step};
pub use column::{Column, ColumnKind, MergeError, MergeStrategy, Value};
pub use keyed::{record_id, KeyedRecord};
