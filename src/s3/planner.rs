//! Splits a source file into the byte ranges uploaded as multipart parts.

use bytesize::{GIB, MB, MIB};
use derive_more::{AsRef, Display, Into};
use thiserror::Error;

use crate::types::PartSlice;

/// The minimum allowed part size for S3 multipart uploads, set to 5 MiB.
///
/// S3 rejects parts smaller than this, except for the last part of the upload.
pub const MIN_PART_SIZE: u64 = 5 * MIB;

/// The maximum allowed part size for S3 multipart uploads, set to 5 GiB.
pub const MAX_PART_SIZE: u64 = 5 * GIB;

/// The default part size, 10 MB.
pub const DEFAULT_PART_SIZE: u64 = 10 * MB;

/// S3 accepts at most 10,000 parts in a single multipart upload.
pub const MAX_PART_COUNT: u64 = 10_000;

/// Errors produced while planning the parts of an upload.
///
/// These are always local; nothing is sent over the network when they occur.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidInputError {
    #[error("Can not plan an upload of an empty source")]
    EmptySource,
    #[error("part_size must be greater than 0")]
    ZeroPartSize,
    #[error("An upload of {total_size} bytes in parts of {part_size} bytes needs {part_count} parts, at most {MAX_PART_COUNT} are allowed")]
    TooManyParts {
        total_size: u64,
        part_size: u64,
        part_count: u64,
    },
    #[error("{part_count} parts can not be numbered, part numbers are at most {}", i32::MAX)]
    PartNumberOverflow { part_count: u64 },
}

/// Errors that can occur when creating a [PartSize].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartSizeError {
    #[error("part_size must be at least {MIN_PART_SIZE} bytes. part_size was {0}")]
    TooSmall(u64),
    #[error("part_size must be at most {MAX_PART_SIZE} bytes, part_size was {0}")]
    TooLarge(u64),
}

/// Represents a valid part size for S3 multipart uploads.
///
/// The size must be at least 5 MiB and at most 5 GiB. The default is
/// 10 MB, which keeps the number of signing round trips low while still
/// giving useful progress granularity for files in the hundreds of megabytes.
#[derive(Debug, Display, Into, AsRef, Clone, Copy, PartialEq, Eq)]
#[into(owned, ref, ref_mut)]
pub struct PartSize(u64);

impl Default for PartSize {
    fn default() -> Self {
        Self(DEFAULT_PART_SIZE)
    }
}

/// Attempts to create a `PartSize` from a `u64` value.
///
/// # Errors
///
/// - Returns `PartSizeError::TooSmall` if the value is smaller than `MIN_PART_SIZE`.
/// - Returns `PartSizeError::TooLarge` if the value is larger than `MAX_PART_SIZE`.
impl TryFrom<u64> for PartSize {
    type Error = PartSizeError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value < MIN_PART_SIZE {
            Err(PartSizeError::TooSmall(value))
        } else if value > MAX_PART_SIZE {
            Err(PartSizeError::TooLarge(value))
        } else {
            Ok(PartSize(value))
        }
    }
}

/// Number of parts needed to upload `total_size` bytes in parts of `part_size` bytes.
///
/// The count is not checked against [MAX_PART_COUNT], only against the
/// largest part number which can be represented.
pub fn part_count(total_size: u64, part_size: u64) -> Result<u64, InvalidInputError> {
    if total_size == 0 {
        return Err(InvalidInputError::EmptySource);
    }
    if part_size == 0 {
        return Err(InvalidInputError::ZeroPartSize);
    }
    let part_count = total_size.div_ceil(part_size);
    if part_count > i32::MAX as u64 {
        return Err(InvalidInputError::PartNumberOverflow { part_count });
    }
    Ok(part_count)
}

/// Like [part_count], but also rejects counts above the S3 limit of
/// [MAX_PART_COUNT] parts per upload.
pub fn upload_part_count(total_size: u64, part_size: u64) -> Result<u64, InvalidInputError> {
    let part_count = part_count(total_size, part_size)?;
    if part_count > MAX_PART_COUNT {
        return Err(InvalidInputError::TooManyParts {
            total_size,
            part_size,
            part_count,
        });
    }
    Ok(part_count)
}

/// Computes the ordered, contiguous slices covering `[0, total_size)`.
///
/// Every slice is `part_size` bytes long except the last, which holds the
/// remainder. Part numbers start at 1.
///
/// ```
/// use cobalt_s3_upload::s3::plan;
///
/// let slices = plan(25_000_000, 10_000_000).unwrap();
/// let lengths: Vec<u64> = slices.iter().map(|s| s.byte_length).collect();
/// assert_eq!(lengths, vec![10_000_000, 10_000_000, 5_000_000]);
/// ```
pub fn plan(total_size: u64, part_size: u64) -> Result<Vec<PartSlice>, InvalidInputError> {
    let part_count = part_count(total_size, part_size)?;
    Ok((1..=part_count)
        .map(|part_number| {
            let byte_offset = (part_number - 1) * part_size;
            let byte_length = std::cmp::min(part_size, total_size - byte_offset);
            PartSlice {
                // part_count is at most i32::MAX so this never truncates
                part_number: part_number as i32,
                byte_offset,
                byte_length,
            }
        })
        .collect())
}

#[cfg(any(test, feature = "test-utils"))]
pub mod arbitrary {
    use proptest::prelude::*;

    use super::{PartSize, MAX_PART_SIZE, MIN_PART_SIZE};

    impl Arbitrary for PartSize {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            (MIN_PART_SIZE..=MAX_PART_SIZE)
                .prop_map(|size| PartSize::try_from(size).unwrap())
                .boxed()
        }
    }
}
