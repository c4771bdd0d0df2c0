//! Uploads a local file to S3 as a multipart upload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;
use typed_builder::TypedBuilder;

use crate::config::UploaderConfig;
use crate::queue::{QueueError, QueueObserver, TaskProgress, TaskQueue};
use crate::s3::part_upload::{PartUploadError, PartUploadTask};
use crate::s3::planner::{plan, upload_part_count, InvalidInputError};
use crate::s3::progress::{ProgressObserver, ProgressTracker, UploadPhase};
use crate::s3::proxy::{ProxyError, StorageProxy};
use crate::s3::transport::PartTransport;
use crate::types::{CompletedPart, ObjectDescriptor, PartProgress, PartSlice, UploadSession};

/// Errors returned by [MultipartFileUploader].
///
/// Uploads are never aborted automatically. The errors raised after the
/// multipart upload was created carry its `upload_id`, which can be passed to
/// [StorageProxy::abort_multipart_upload] to discard the uploaded parts.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),
    #[error("Failed to read source file {}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to initiate multipart upload of {key}")]
    Initiation {
        key: String,
        #[source]
        source: ProxyError,
    },
    #[error("Failed to upload the parts of {key} (upload {upload_id})")]
    Parts {
        key: String,
        upload_id: String,
        #[source]
        source: QueueError<PartUploadError>,
    },
    #[error("Failed to complete multipart upload of {key} (upload {upload_id})")]
    Completion {
        key: String,
        upload_id: String,
        #[source]
        source: ProxyError,
    },
}

impl UploadError {
    /// The id of the multipart upload left behind by the failure, if any.
    pub fn upload_id(&self) -> Option<&str> {
        match self {
            UploadError::Parts { upload_id, .. } | UploadError::Completion { upload_id, .. } => {
                Some(upload_id)
            }
            _ => None,
        }
    }
}

/// Uploads files through a [StorageProxy] and a [PartTransport].
///
/// The file is split into parts of [UploaderConfig::part_size] bytes which
/// are uploaded at most [UploaderConfig::max_concurrent_uploads] at a time.
/// The object is only completed once every part has been acknowledged.
///
/// # Example
///
/// ```no_run
/// use cobalt_s3_upload::config::load_from_env;
/// use cobalt_s3_upload::s3::{HttpTransport, MultipartFileUploader, S3Proxy};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let uploader = MultipartFileUploader::builder()
///     .proxy(Arc::new(S3Proxy::from_sdk_config(&shared_config, "my-bucket")))
///     .transport(Arc::new(HttpTransport::default()))
///     .build();
/// let object = uploader.upload("scans/study.zip", "study.zip").await.unwrap();
/// println!("Uploaded {}", object.key);
/// # })
/// ```
#[derive(Clone, TypedBuilder)]
pub struct MultipartFileUploader {
    proxy: Arc<dyn StorageProxy>,
    transport: Arc<dyn PartTransport>,
    #[builder(default)]
    config: UploaderConfig,
}

impl std::fmt::Debug for MultipartFileUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartFileUploader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MultipartFileUploader {
    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Upload the file at `path` to `key` with the default content type.
    pub async fn upload(
        &self,
        key: &str,
        path: impl AsRef<Path>,
    ) -> Result<ObjectDescriptor, UploadError> {
        self.upload_with_observer(key, path, None, &mut ()).await
    }

    pub async fn upload_with_content_type(
        &self,
        key: &str,
        path: impl AsRef<Path>,
        content_type: &str,
    ) -> Result<ObjectDescriptor, UploadError> {
        self.upload_with_observer(key, path, Some(content_type), &mut ())
            .await
    }

    /// Upload the file at `path` to `key`, reporting every phase change and
    /// progress event to `observer`.
    ///
    /// The observer sees [UploadPhase::Idle] first and then either
    /// [UploadPhase::Done] or [UploadPhase::Failed] last.
    pub async fn upload_with_observer<O: ProgressObserver + ?Sized>(
        &self,
        key: &str,
        path: impl AsRef<Path>,
        content_type: Option<&str>,
        observer: &mut O,
    ) -> Result<ObjectDescriptor, UploadError> {
        let content_type = content_type.unwrap_or(self.config.default_content_type.as_str());
        observer.on_phase(&UploadPhase::Idle);
        let result = self
            .run(key, path.as_ref(), content_type, &mut *observer)
            .await;
        match &result {
            Ok(object) => {
                tracing::info!(key = %object.key, upload_id = %object.upload_id, "Upload complete");
                observer.on_phase(&UploadPhase::Done);
            }
            Err(e) => {
                tracing::warn!(error = %e, upload_id = e.upload_id(), "Upload failed");
                observer.on_phase(&UploadPhase::Failed(e.to_string()));
            }
        }
        result
    }

    #[instrument(skip(self, observer), fields(upload_id = tracing::field::Empty))]
    async fn run<O: ProgressObserver + ?Sized>(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
        observer: &mut O,
    ) -> Result<ObjectDescriptor, UploadError> {
        let total_size = tokio::fs::metadata(path)
            .await
            .map_err(|source| UploadError::Source {
                path: path.to_owned(),
                source,
            })?
            .len();
        let part_size = u64::from(self.config.part_size);
        // Planning is local, so bad input never creates an upload.
        upload_part_count(total_size, part_size)?;
        let slices = plan(total_size, part_size)?;

        observer.on_phase(&UploadPhase::Initiating);
        let initiated = self
            .proxy
            .create_multipart_upload(key, content_type)
            .await
            .map_err(|source| UploadError::Initiation {
                key: key.to_owned(),
                source,
            })?;
        tracing::Span::current().record("upload_id", initiated.upload_id.as_str());
        let session = UploadSession {
            object_key: initiated.key,
            upload_id: initiated.upload_id,
            part_size,
            total_size,
            content_type: content_type.to_owned(),
        };
        tracing::info!(
            key = %session.object_key,
            parts = slices.len(),
            total_size,
            "Initiated multipart upload"
        );

        observer.on_phase(&UploadPhase::UploadingParts);
        let source = Arc::new(path.to_owned());
        let tasks = slices.iter().map(|slice| {
            let task = PartUploadTask::builder()
                .proxy(self.proxy.as_ref())
                .transport(self.transport.as_ref())
                .session(&session)
                .slice(*slice)
                .source(source.clone())
                .build();
            move |progress| task.execute(progress)
        });
        let mut parts_observer = PartsObserver {
            tracker: ProgressTracker::new(total_size, slices.len()),
            slices: &slices,
            observer: &mut *observer,
        };
        let mut parts = TaskQueue::new(self.config.max_concurrent_uploads)
            .run(tasks, &mut parts_observer)
            .await
            .map_err(|source| UploadError::Parts {
                key: session.object_key.clone(),
                upload_id: session.upload_id.clone(),
                source,
            })?;
        parts.sort_by_key(|part| part.part_number);

        observer.on_phase(&UploadPhase::Completing);
        self.proxy
            .complete_multipart_upload(&session.object_key, &session.upload_id, &parts)
            .await
            .map_err(|source| UploadError::Completion {
                key: session.object_key.clone(),
                upload_id: session.upload_id.clone(),
                source,
            })
    }
}

/// Turns the events of the part queue into upload progress.
struct PartsObserver<'a, O: ?Sized> {
    tracker: ProgressTracker,
    slices: &'a [PartSlice],
    observer: &'a mut O,
}

impl<O: ProgressObserver + ?Sized> QueueObserver<CompletedPart, PartProgress>
    for PartsObserver<'_, O>
{
    fn after_each(&mut self, index: usize, part: &CompletedPart) {
        tracing::debug!(part_number = part.part_number, "Part acknowledged");
        // An acknowledged part counts in full, whatever the transport reported.
        if let Some(slice) = self.slices.get(index) {
            let snapshot = self.tracker.record(
                index,
                PartProgress {
                    bytes_loaded: slice.byte_length,
                    bytes_total: slice.byte_length,
                },
            );
            self.observer.on_progress(&snapshot);
        }
    }

    fn on_progress(&mut self, event: TaskProgress<PartProgress>) {
        let snapshot = self.tracker.record(event.index, event.progress);
        self.observer.on_progress(&snapshot);
    }
}
