//! Moves the bytes of a part to its pre-signed URL.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, StatusCode};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::instrument;
use url::Url;

use crate::queue::ProgressReporter;
use crate::types::{PartProgress, PartSlice};

/// Size of the buffers read from the source file while streaming a part.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Errors raised while transferring a part.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Part {part_number} was rejected with status {status}")]
    Status {
        part_number: i32,
        status: StatusCode,
    },
    #[error("Part {part_number} response did not include an ETag")]
    MissingETag { part_number: i32 },
    #[error("Failed to read part {part_number} from the source file")]
    Source {
        part_number: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("Transport failure while uploading part {part_number}")]
    Http {
        part_number: i32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// The bytes of one part: a byte range of a file on disk.
#[derive(Debug, Clone)]
pub struct PartBody {
    path: Arc<PathBuf>,
    slice: PartSlice,
}

impl PartBody {
    pub fn new(path: Arc<PathBuf>, slice: PartSlice) -> Self {
        PartBody { path, slice }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slice(&self) -> &PartSlice {
        &self.slice
    }

    pub fn len(&self) -> u64 {
        self.slice.byte_length
    }

    pub fn is_empty(&self) -> bool {
        self.slice.byte_length == 0
    }

    /// Stream the part in chunks of at most [CHUNK_SIZE] bytes, reporting the
    /// cumulative number of bytes handed out after each chunk.
    ///
    /// Reading stops at the end of the slice. A file which is shorter than the
    /// slice produces an [std::io::ErrorKind::UnexpectedEof] error.
    pub async fn into_stream(
        self,
        progress: ProgressReporter<PartProgress>,
    ) -> Result<BoxStream<'static, std::io::Result<Bytes>>, std::io::Error> {
        let mut file = File::open(self.path.as_path()).await?;
        file.seek(SeekFrom::Start(self.slice.byte_offset)).await?;
        let bytes_total = self.slice.byte_length;

        Ok(stream::try_unfold(
            (file, 0_u64, progress),
            move |(mut file, bytes_loaded, progress)| async move {
                let remaining = bytes_total - bytes_loaded;
                if remaining == 0 {
                    return Ok(None);
                }
                let mut buffer = vec![0; std::cmp::min(remaining, CHUNK_SIZE as u64) as usize];
                file.read_exact(&mut buffer).await?;
                let bytes_loaded = bytes_loaded + buffer.len() as u64;
                progress.report(PartProgress {
                    bytes_loaded,
                    bytes_total,
                });
                Ok::<_, std::io::Error>(Some((
                    Bytes::from(buffer),
                    (file, bytes_loaded, progress),
                )))
            },
        )
        .boxed())
    }

    /// Read the whole part into memory.
    pub async fn read_all(self) -> Result<Vec<u8>, std::io::Error> {
        let chunks: Vec<Bytes> = self
            .into_stream(ProgressReporter::detached())
            .await?
            .try_collect()
            .await?;
        Ok(chunks.concat())
    }
}

/// The response to a part upload.
#[derive(Debug, Clone)]
pub struct PartResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Issues the `PUT` of one part to a pre-signed URL.
#[async_trait]
pub trait PartTransport: Send + Sync {
    /// Upload `body` to `url`, reporting progress as the bytes are sent.
    ///
    /// Any response the server returns is handed back, whatever its status;
    /// only failures to perform the request are errors.
    async fn put_part(
        &self,
        url: &Url,
        body: PartBody,
        progress: ProgressReporter<PartProgress>,
    ) -> Result<PartResponse, TransferError>;
}

/// A [PartTransport] built on [reqwest].
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        HttpTransport { client }
    }
}

#[async_trait]
impl PartTransport for HttpTransport {
    #[instrument(skip_all, fields(part_number = body.slice().part_number, bytes = body.len()))]
    async fn put_part(
        &self,
        url: &Url,
        body: PartBody,
        progress: ProgressReporter<PartProgress>,
    ) -> Result<PartResponse, TransferError> {
        let part_number = body.slice().part_number;
        let content_length = body.len();
        let stream = body
            .into_stream(progress)
            .await
            .map_err(|source| TransferError::Source {
                part_number,
                source,
            })?;

        // S3 does not accept chunked transfer encoding for pre-signed puts, so
        // the length has to be sent up front.
        let response = self
            .client
            .put(url.clone())
            .header(CONTENT_LENGTH, content_length)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| TransferError::Http {
                part_number,
                source: Box::new(e),
            })?;

        tracing::debug!(status = %response.status(), "Part upload responded");
        Ok(PartResponse {
            status: response.status(),
            headers: response.headers().clone(),
        })
    }
}
