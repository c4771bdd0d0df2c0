//! Cleanup of multipart uploads and objects left behind by failed uploads.

use tracing::instrument;

use crate::s3::proxy::{ProxyError, StorageProxy};
use crate::types::MultipartUploadSummary;

/// Abort every in-progress multipart upload for which `filter` returns `true`.
///
/// Returns the number of uploads which were aborted. Stops at the first
/// upload which can not be aborted.
///
/// # Example
///
/// ```no_run
/// use cobalt_s3_upload::config::load_from_env;
/// use cobalt_s3_upload::s3::{maintenance, S3Proxy};
/// use std::time::{Duration, SystemTime};
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let proxy = S3Proxy::from_sdk_config(&shared_config, "my-bucket");
/// let day_ago = SystemTime::now() - Duration::from_secs(24 * 60 * 60);
/// let aborted = maintenance::abort_multipart_uploads(&proxy, |upload| {
///     upload.initiated.is_some_and(|initiated| initiated < day_ago)
/// })
/// .await
/// .unwrap();
/// println!("Aborted {aborted} stale uploads");
/// # })
/// ```
#[instrument(skip_all)]
pub async fn abort_multipart_uploads<P, F>(proxy: &P, mut filter: F) -> Result<usize, ProxyError>
where
    P: StorageProxy + ?Sized,
    F: FnMut(&MultipartUploadSummary) -> bool,
{
    let mut aborted = 0;
    for upload in proxy.list_multipart_uploads().await? {
        if !filter(&upload) {
            continue;
        }
        proxy
            .abort_multipart_upload(&upload.key, &upload.upload_id)
            .await?;
        tracing::info!(key = %upload.key, upload_id = %upload.upload_id, "Aborted multipart upload");
        aborted += 1;
    }
    Ok(aborted)
}

/// Remove an uploaded object.
#[instrument(skip(proxy))]
pub async fn delete_object<P>(proxy: &P, key: &str) -> Result<(), ProxyError>
where
    P: StorageProxy + ?Sized,
{
    proxy.delete_object(key).await?;
    tracing::info!("Deleted object");
    Ok(())
}
