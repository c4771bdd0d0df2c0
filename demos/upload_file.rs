use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;

use cobalt_s3_upload::config::{load_from_env, UploaderConfig};
use cobalt_s3_upload::s3::{
    HttpTransport, MultipartFileUploader, ProgressSnapshot, S3Proxy, StorageProxy,
};

/// Upload a local file to S3 as a multipart upload.
///
/// Part size, concurrency and the default content type are read from
/// `UPLOAD_PART_SIZE`, `UPLOAD_CONCURRENCY` and `UPLOAD_DEFAULT_CONTENT_TYPE`.
#[derive(Debug, Parser)]
struct Args {
    /// Destination bucket.
    #[arg(long)]
    bucket: String,
    /// Destination key.
    #[arg(long)]
    key: String,
    #[arg(long)]
    content_type: Option<String>,
    /// Abort the multipart upload if any part fails.
    #[arg(long)]
    abort_on_failure: bool,
    /// The file to upload.
    path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let args = Args::parse();
    let shared_config = load_from_env().await?;
    let proxy = Arc::new(S3Proxy::from_sdk_config(&shared_config, &args.bucket));
    let uploader = MultipartFileUploader::builder()
        .proxy(proxy.clone())
        .transport(Arc::new(HttpTransport::default()))
        .config(UploaderConfig::from_env()?)
        .build();

    // Snapshots arrive for every chunk sent, so only log a sample of them.
    let (mut progress, mut snapshots) = watch::channel(ProgressSnapshot::default());
    let reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            match snapshots.has_changed() {
                Ok(true) => {
                    let snapshot = *snapshots.borrow_and_update();
                    tracing::info!(
                        loaded = snapshot.loaded,
                        total = snapshot.total,
                        percent = format_args!("{:.1}", snapshot.position * 100.0),
                        bytes_per_second = snapshot.speed.round(),
                        "Uploading"
                    );
                }
                Ok(false) => {}
                Err(_) => break,
            }
        }
    });

    let result = uploader
        .upload_with_observer(
            &args.key,
            &args.path,
            args.content_type.as_deref(),
            &mut progress,
        )
        .await;
    drop(progress);
    reporter.await?;

    match result {
        Ok(object) => {
            println!("{}", serde_json::to_string_pretty(&object)?);
            Ok(())
        }
        Err(e) => {
            if let (true, Some(upload_id)) = (args.abort_on_failure, e.upload_id()) {
                proxy
                    .abort_multipart_upload(&args.key, upload_id)
                    .await
                    .context("Failed to abort the multipart upload")?;
                tracing::info!(upload_id, "Aborted multipart upload");
            }
            Err(e).context(format!("Failed to upload {}", args.path.display()))
        }
    }
}
