//! Time bucket arithmetic.
//!
//! Buckets are decimal-packed UTC timestamps: `yyyyMMddHHmm` for minutes,
//! `yyyyMMddHH` for hours and `yyyyMMdd` for days. The packing keeps
//! buckets human-readable in storage and makes down-sampling a division.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of a time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Minute,
    Hour,
    Day,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Infers the step of a packed bucket from its digit count.
    pub fn of(bucket: i64) -> Result<Self, BucketError> {
        match digits(bucket) {
            12 => Ok(Self::Minute),
            10 => Ok(Self::Hour),
            8 => Ok(Self::Day),
            _ => Err(BucketError::Malformed { bucket }),
        }
    }

    /// Number of trailing decimal digits this step adds over a day bucket.
    fn extra_digits(self) -> u32 {
        match self {
            Self::Minute => 4,
            Self::Hour => 2,
            Self::Day => 0,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BucketError {
    #[error("timestamp {millis}ms is out of range")]
    OutOfRange { millis: i64 },

    #[error("malformed time bucket {bucket}")]
    Malformed { bucket: i64 },

    #[error("cannot down-sample {from} bucket to finer step {to}")]
    Finer {
        from: &'static str,
        to: &'static str,
    },
}

/// Computes the bucket containing `millis` (milliseconds since the epoch).
pub fn time_bucket(millis: i64, step: Step) -> Result<i64, BucketError> {
    let dt: DateTime<Utc> =
        DateTime::from_timestamp_millis(millis).ok_or(BucketError::OutOfRange { millis })?;

    let day = i64::from(dt.year()) * 10_000 + i64::from(dt.month()) * 100 + i64::from(dt.day());
    let bucket = match step {
        Step::Day => day,
        Step::Hour => day * 100 + i64::from(dt.hour()),
        Step::Minute => (day * 100 + i64::from(dt.hour())) * 100 + i64::from(dt.minute()),
    };

    Ok(bucket)
}

/// Converts `bucket` to the coarser step `to`.
pub fn downsample(bucket: i64, to: Step) -> Result<i64, BucketError> {
    let from = Step::of(bucket)?;
    if to < from {
        return Err(BucketError::Finer {
            from: from.as_str(),
            to: to.as_str(),
        });
    }
    let drop = from.extra_digits() - to.extra_digits();
    Ok(bucket / 10_i64.pow(drop))
}

fn digits(mut n: i64) -> u32 {
    if n <= 0 {
        return 0;
    }
    let mut count = 0;
    while n > 0 {
        n /= 10;
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-05T07:09:30Z
    const TS: i64 = 1_709_622_570_000;

    #[test]
    fn test_time_bucket_steps() {
        assert_eq!(time_bucket(TS, Step::Minute).unwrap(), 202403050709);
        assert_eq!(time_bucket(TS, Step::Hour).unwrap(), 2024030507);
        assert_eq!(time_bucket(TS, Step::Day).unwrap(), 20240305);
    }

    #[test]
    fn test_time_bucket_out_of_range() {
        assert!(matches!(
            time_bucket(i64::MAX, Step::Minute),
            Err(BucketError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_downsample() {
        assert_eq!(downsample(202403050709, Step::Hour).unwrap(), 2024030507);
        assert_eq!(downsample(202403050709, Step::Day).unwrap(), 20240305);
        assert_eq!(downsample(2024030507, Step::Day).unwrap(), 20240305);
        assert_eq!(downsample(20240305, Step::Day).unwrap(), 20240305);
    }

    #[test]
    fn test_downsample_rejects_finer() {
        assert!(matches!(
            downsample(20240305, Step::Minute),
            Err(BucketError::Finer { .. })
        ));
        assert!(matches!(
            downsample(123, Step::Day),
            Err(BucketError::Malformed { .. })
        ));
    }
}
