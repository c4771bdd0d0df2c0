//! The storage proxy: the service which owns the bucket credentials and hands out
//! pre-signed part URLs.

use std::error::Error as StdError;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::{PresigningConfig, PresigningConfigError};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use aws_types::SdkConfig;
use thiserror::Error;
use tracing::instrument;
use typed_builder::TypedBuilder;
use url::Url;

use crate::types::{CompletedPart, InitiatedUpload, MultipartUploadSummary, ObjectDescriptor};

/// Default lifetime of a pre-signed part URL.
pub const DEFAULT_PRESIGNED_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// Errors returned by a [StorageProxy].
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Missing multipart upload id")]
    MissingUploadId,
    #[error("No multipart upload {upload_id} exists for {key}")]
    NoSuchUpload { key: String, upload_id: String },
    #[error("Signed URL is not valid: {0}")]
    InvalidSignedUrl(#[from] url::ParseError),
    #[error(transparent)]
    Presigning(#[from] PresigningConfigError),
    #[error(transparent)]
    Service(Box<dyn StdError + Send + Sync>),
}

impl<E: StdError + Send + Sync + 'static> From<SdkError<E>> for ProxyError {
    fn from(value: SdkError<E>) -> Self {
        Self::Service(Box::new(value))
    }
}

/// The operations the uploader needs from the service that controls the bucket.
///
/// The proxy is trusted to produce valid signed URLs; the uploader never signs
/// anything itself.
#[async_trait]
pub trait StorageProxy: Send + Sync {
    /// Start a multipart upload for `key`.
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<InitiatedUpload, ProxyError>;

    /// Produce a URL which accepts a `PUT` of the bytes of one part.
    async fn sign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> Result<Url, ProxyError>;

    /// Finalize the upload. `parts` must be sorted by part number.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectDescriptor, ProxyError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), ProxyError>;

    async fn delete_object(&self, key: &str) -> Result<(), ProxyError>;

    /// All multipart uploads which are neither completed nor aborted.
    async fn list_multipart_uploads(&self) -> Result<Vec<MultipartUploadSummary>, ProxyError>;
}

/// A [StorageProxy] which talks to S3 directly and signs part uploads with the
/// credentials of its [Client].
///
/// # Example
///
/// ```no_run
/// use cobalt_s3_upload::config::load_from_env;
/// use cobalt_s3_upload::s3::S3Proxy;
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let proxy = S3Proxy::from_sdk_config(&shared_config, "my-bucket");
/// # })
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct S3Proxy {
    client: Client,
    #[builder(setter(into))]
    bucket: String,
    /// How long each pre-signed part URL stays valid.
    #[builder(default = DEFAULT_PRESIGNED_EXPIRY)]
    presigned_expiry: Duration,
}

impl S3Proxy {
    /// Create a proxy for `bucket` from a shared config.
    ///
    /// When the config carries a custom endpoint (e.g. MinIO or LocalStack)
    /// path style addressing is enabled, as those services rarely resolve
    /// virtual-hosted bucket names.
    pub fn from_sdk_config(shared_config: &SdkConfig, bucket: impl Into<String>) -> Self {
        let mut builder = aws_sdk_s3::config::Builder::from(shared_config);
        if shared_config.endpoint_url().is_some() {
            builder = builder.force_path_style(true);
        }
        S3Proxy::builder()
            .client(Client::from_conf(builder.build()))
            .bucket(bucket)
            .build()
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl StorageProxy for S3Proxy {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<InitiatedUpload, ProxyError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await?;
        let upload_id = output.upload_id().ok_or(ProxyError::MissingUploadId)?;
        Ok(InitiatedUpload {
            key: output.key().unwrap_or(key).to_owned(),
            upload_id: upload_id.to_owned(),
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn sign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> Result<Url, ProxyError> {
        let presigned = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(PresigningConfig::expires_in(self.presigned_expiry)?)
            .await?;
        Ok(Url::parse(presigned.uri())?)
    }

    #[instrument(skip(self, parts), fields(bucket = %self.bucket, parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectDescriptor, ProxyError> {
        let parts = parts
            .iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .e_tag(&part.etag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect();
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await?;
        Ok(ObjectDescriptor {
            key: output.key().unwrap_or(key).to_owned(),
            upload_id: upload_id.to_owned(),
            location: output.location().map(str::to_owned),
            etag: output.e_tag().map(str::to_owned),
            version_id: output.version_id().map(str::to_owned),
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), ProxyError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete_object(&self, key: &str) -> Result<(), ProxyError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list_multipart_uploads(&self) -> Result<Vec<MultipartUploadSummary>, ProxyError> {
        let mut uploads = vec![];
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;

        // ListMultipartUploads has no generated paginator, so follow the markers by hand.
        loop {
            let page = self
                .client
                .list_multipart_uploads()
                .bucket(&self.bucket)
                .set_key_marker(key_marker.take())
                .set_upload_id_marker(upload_id_marker.take())
                .send()
                .await?;

            uploads.extend(page.uploads().iter().filter_map(|upload| {
                Some(MultipartUploadSummary {
                    key: upload.key()?.to_owned(),
                    upload_id: upload.upload_id()?.to_owned(),
                    initiated: upload
                        .initiated()
                        .and_then(|at| SystemTime::try_from(*at).ok()),
                })
            }));

            if !page.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = page.next_key_marker().map(str::to_owned);
            upload_id_marker = page.next_upload_id_marker().map(str::to_owned);
            if key_marker.is_none() && upload_id_marker.is_none() {
                break;
            }
        }
        tracing::debug!(count = uploads.len(), "Listed multipart uploads");
        Ok(uploads)
    }
}
