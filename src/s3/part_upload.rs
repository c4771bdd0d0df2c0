//! Upload of a single part: sign, transfer, acknowledge.

use std::path::PathBuf;
use std::sync::Arc;

use http::header::ETAG;
use thiserror::Error;
use tracing::instrument;
use typed_builder::TypedBuilder;

use crate::queue::ProgressReporter;
use crate::s3::proxy::{ProxyError, StorageProxy};
use crate::s3::transport::{PartBody, PartTransport, TransferError};
use crate::types::{CompletedPart, PartProgress, PartSlice, UploadSession};

/// Errors raised while uploading one part.
#[derive(Debug, Error)]
pub enum PartUploadError {
    #[error("Failed to sign part {part_number}")]
    Signing {
        part_number: i32,
        #[source]
        source: ProxyError,
    },
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl PartUploadError {
    pub fn part_number(&self) -> i32 {
        match self {
            PartUploadError::Signing { part_number, .. } => *part_number,
            PartUploadError::Transfer(
                TransferError::Status { part_number, .. }
                | TransferError::MissingETag { part_number }
                | TransferError::Source { part_number, .. }
                | TransferError::Http { part_number, .. },
            ) => *part_number,
        }
    }
}

/// Strip everything but word characters from an ETag.
///
/// S3 returns ETags wrapped in double quotes.
///
/// ```
/// use cobalt_s3_upload::s3::sanitize_etag;
///
/// assert_eq!(sanitize_etag("\"abc123\""), "abc123");
/// ```
pub fn sanitize_etag(etag: &str) -> String {
    etag.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// The upload of one [PartSlice] of a session.
#[derive(TypedBuilder)]
pub struct PartUploadTask<'a> {
    proxy: &'a dyn StorageProxy,
    transport: &'a dyn PartTransport,
    session: &'a UploadSession,
    slice: PartSlice,
    source: Arc<PathBuf>,
}

impl PartUploadTask<'_> {
    /// Sign the part, stream its bytes and return the acknowledged part.
    ///
    /// Neither signing nor the transfer is retried.
    #[instrument(skip_all, fields(
        key = %self.session.object_key,
        upload_id = %self.session.upload_id,
        part_number = self.slice.part_number,
        bytes = self.slice.byte_length,
    ))]
    pub async fn execute(
        self,
        progress: ProgressReporter<PartProgress>,
    ) -> Result<CompletedPart, PartUploadError> {
        let part_number = self.slice.part_number;
        let url = self
            .proxy
            .sign_upload_part(
                &self.session.object_key,
                &self.session.upload_id,
                part_number,
            )
            .await
            .map_err(|source| PartUploadError::Signing {
                part_number,
                source,
            })?;

        let response = self
            .transport
            .put_part(&url, PartBody::new(self.source, self.slice), progress)
            .await?;
        if !response.status.is_success() {
            return Err(TransferError::Status {
                part_number,
                status: response.status,
            }
            .into());
        }

        let etag = response
            .headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(sanitize_etag)
            .filter(|etag| !etag.is_empty())
            .ok_or(TransferError::MissingETag { part_number })?;

        tracing::debug!(%etag, "Part uploaded");
        Ok(CompletedPart {
            part_number,
            etag,
            object_key: self.session.object_key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::test_utils::{MemoryProxy, MemoryTransport};
    use assert_matches::assert_matches;
    use http::StatusCode;
    use std::io::Write;

    fn session() -> UploadSession {
        UploadSession {
            object_key: "uploads/scan.dcm".into(),
            upload_id: "upload-1".into(),
            part_size: 4,
            total_size: 10,
            content_type: "application/dicom".into(),
        }
    }

    fn source() -> (tempfile::NamedTempFile, Arc<PathBuf>) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();
        let path = Arc::new(file.path().to_path_buf());
        (file, path)
    }

    const SLICE: PartSlice = PartSlice {
        part_number: 2,
        byte_offset: 4,
        byte_length: 4,
    };

    #[test]
    fn test_sanitize_etag() {
        assert_eq!(sanitize_etag("\"abc123\""), "abc123");
        assert_eq!(sanitize_etag("W/\"d41d8cd9-2\""), "Wd41d8cd92");
        assert_eq!(sanitize_etag("plain_tag"), "plain_tag");
    }

    #[tokio::test]
    async fn test_execute_returns_completed_part() {
        let (_file, path) = source();
        let proxy = MemoryProxy::default();
        let transport = MemoryTransport::default();
        let session = session();

        let part = PartUploadTask::builder()
            .proxy(&proxy)
            .transport(&transport)
            .session(&session)
            .slice(SLICE)
            .source(path)
            .build()
            .execute(ProgressReporter::detached())
            .await
            .unwrap();

        assert_eq!(
            part,
            CompletedPart {
                part_number: 2,
                etag: MemoryTransport::etag_for(b"4567"),
                object_key: "uploads/scan.dcm".into(),
            }
        );
        assert_eq!(transport.received(2), Some(b"4567".to_vec()));
        assert_eq!(proxy.signed_parts(), vec![2]);
    }

    #[tokio::test]
    async fn test_signing_failure_is_not_transferred() {
        let (_file, path) = source();
        let proxy = MemoryProxy::default().fail_signing(2);
        let transport = MemoryTransport::default();
        let session = session();

        let err = PartUploadTask::builder()
            .proxy(&proxy)
            .transport(&transport)
            .session(&session)
            .slice(SLICE)
            .source(path)
            .build()
            .execute(ProgressReporter::detached())
            .await
            .unwrap_err();

        assert_matches!(err, PartUploadError::Signing { part_number: 2, .. });
        assert_eq!(transport.received(2), None);
    }

    #[tokio::test]
    async fn test_error_status_is_a_transfer_error() {
        let (_file, path) = source();
        let proxy = MemoryProxy::default();
        let transport = MemoryTransport::default().fail_part(2, StatusCode::FORBIDDEN);
        let session = session();

        let err = PartUploadTask::builder()
            .proxy(&proxy)
            .transport(&transport)
            .session(&session)
            .slice(SLICE)
            .source(path)
            .build()
            .execute(ProgressReporter::detached())
            .await
            .unwrap_err();

        assert_matches!(
            err,
            PartUploadError::Transfer(TransferError::Status {
                part_number: 2,
                status,
            }) if status == StatusCode::FORBIDDEN
        );
        assert_eq!(err.part_number(), 2);
    }

    #[tokio::test]
    async fn test_missing_etag_is_a_transfer_error() {
        let (_file, path) = source();
        let proxy = MemoryProxy::default();
        let transport = MemoryTransport::default().omit_etag(2);
        let session = session();

        let err = PartUploadTask::builder()
            .proxy(&proxy)
            .transport(&transport)
            .session(&session)
            .slice(SLICE)
            .source(path)
            .build()
            .execute(ProgressReporter::detached())
            .await
            .unwrap_err();

        assert_matches!(
            err,
            PartUploadError::Transfer(TransferError::MissingETag { part_number: 2 })
        );
    }
}
