//! Multipart uploads of local files to [S3](https://docs.rs/aws-sdk-s3/latest/aws_sdk_s3/).
//!
//! A [MultipartFileUploader] splits a file into parts with [plan], uploads
//! each part to a URL signed by a [StorageProxy] through a [PartTransport],
//! and completes the upload once every part has been acknowledged.

/// Re-export of [aws_sdk_s3::client::Client](https://docs.rs/aws-sdk-s3/latest/aws_sdk_s3/client/struct.Client.html).
pub use aws_sdk_s3::Client;

pub mod maintenance;
mod part_upload;
mod planner;
mod progress;
mod proxy;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
mod transport;
mod uploader;

pub use part_upload::{sanitize_etag, PartUploadError, PartUploadTask};
pub use planner::{
    part_count, plan, upload_part_count, InvalidInputError, PartSize, PartSizeError,
    DEFAULT_PART_SIZE, MAX_PART_COUNT, MAX_PART_SIZE, MIN_PART_SIZE,
};
pub use progress::{ProgressObserver, ProgressSnapshot, ProgressTracker, UploadPhase};
pub use proxy::{ProxyError, S3Proxy, StorageProxy, DEFAULT_PRESIGNED_EXPIRY};
pub use transport::{HttpTransport, PartBody, PartResponse, PartTransport, TransferError, CHUNK_SIZE};
pub use uploader::{MultipartFileUploader, UploadError};

#[cfg(test)]
pub(crate) mod tests {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::hash::{DefaultHasher, Hash, Hasher};
    use std::io::Write;

    pub fn seeded_rng<H: Hash + ?Sized>(seed: &H) -> impl Rng {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        ChaCha8Rng::seed_from_u64(hasher.finish())
    }

    /// A temporary file holding `len` random bytes, and those bytes.
    pub fn random_file<R: Rng>(rng: &mut R, len: usize) -> (tempfile::NamedTempFile, Vec<u8>) {
        let mut data = vec![0_u8; len];
        rng.fill(&mut data[..]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        (file, data)
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let mut a = seeded_rng("seed");
        let mut b = seeded_rng("seed");
        assert_eq!(a.gen::<u64>(), b.gen::<u64>());
    }
}
