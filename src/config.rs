//! Configuration of the uploader and of the shared [aws_types::SdkConfig](https://docs.rs/aws-types/latest/aws_types/sdk_config/struct.SdkConfig.html).

use std::env;
use std::ffi::OsString;
use std::iter::empty;
use std::num::NonZeroUsize;
use std::str::FromStr;

use anyhow::{Context, Result};
use aws_types::SdkConfig;
use clap::Parser;
use http::Uri;
use typed_builder::TypedBuilder;

use crate::s3::PartSize;

/// Number of parts uploaded at the same time unless configured otherwise.
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: NonZeroUsize = NonZeroUsize::MIN.saturating_add(3);

/// Content type used for uploads which do not specify one.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Settings of a [MultipartFileUploader](crate::s3::MultipartFileUploader).
///
/// # Example
///
/// ```
/// use cobalt_s3_upload::config::UploaderConfig;
/// use cobalt_s3_upload::s3::PartSize;
/// use std::num::NonZeroUsize;
///
/// let config = UploaderConfig::builder()
///     .part_size(PartSize::try_from(8 * 1024 * 1024_u64).unwrap())
///     .max_concurrent_uploads(NonZeroUsize::new(8).unwrap())
///     .build();
/// assert_eq!(config.default_content_type, "text/plain");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct UploaderConfig {
    /// Size of every part but the last.
    #[builder(default)]
    pub part_size: PartSize,
    /// Upper bound on the number of parts in flight.
    #[builder(default = DEFAULT_MAX_CONCURRENT_UPLOADS)]
    pub max_concurrent_uploads: NonZeroUsize,
    #[builder(default = DEFAULT_CONTENT_TYPE.to_owned(), setter(into))]
    pub default_content_type: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        UploaderConfig::builder().build()
    }
}

/// Uploader settings read from the environment.
#[derive(Debug, Parser)]
struct UploaderEnv {
    #[arg(env)]
    upload_part_size: Option<u64>,
    #[arg(env)]
    upload_concurrency: Option<NonZeroUsize>,
    #[arg(env)]
    upload_default_content_type: Option<String>,
}

impl UploaderConfig {
    /// Build a config from the `UPLOAD_PART_SIZE`, `UPLOAD_CONCURRENCY` and
    /// `UPLOAD_DEFAULT_CONTENT_TYPE` environment variables. Unset variables
    /// keep their defaults.
    ///
    /// ## Errors
    ///
    /// An error is returned if a variable can not be parsed, or if the part
    /// size is outside of the range S3 accepts.
    pub fn from_env() -> Result<Self> {
        // Only environment variables are considered, never the command line
        // of the host process.
        let env = UploaderEnv::try_parse_from(empty::<OsString>())
            .context("An error occurred while parsing environment variables for the uploader.")?;

        let mut config = UploaderConfig::default();
        if let Some(part_size) = env.upload_part_size {
            config.part_size =
                PartSize::try_from(part_size).context("Invalid UPLOAD_PART_SIZE")?;
        }
        if let Some(concurrency) = env.upload_concurrency {
            config.max_concurrent_uploads = concurrency;
        }
        if let Some(content_type) = env.upload_default_content_type {
            config.default_content_type = content_type;
        }
        tracing::debug!(?config, "Loaded uploader config");
        Ok(config)
    }
}

/// Read a custom S3 endpoint from `S3_ENDPOINT_URL`, if it is set.
fn get_endpoint_uri() -> Result<Option<Uri>> {
    match env::var("S3_ENDPOINT_URL") {
        Ok(uri) => {
            let uri =
                Uri::from_str(&uri).context(format!("Failed to parse S3 endpoint URI: {}", uri))?;
            Ok(Some(uri))
        }
        Err(_) => Ok(None),
    }
}

/// Create a shared `SdkConfig`, with support for S3-compatible services.
///
/// # Example
///
/// ```
/// use cobalt_s3_upload::config::load_from_env;
/// use cobalt_s3_upload::s3::S3Proxy;
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let proxy = S3Proxy::from_sdk_config(&shared_config, "my-bucket");
/// # })
/// ```
///
/// ## Custom endpoints
///
/// To talk to an S3-compatible service such as MinIO or LocalStack, set the
/// `S3_ENDPOINT_URL` environment variable:
///
/// ```shell
/// $ export S3_ENDPOINT_URL=http://localhost:9000
/// ```
///
/// Proxies created from this config then use path style addressing.
///
/// ## Errors
///
/// An error will be returned if `S3_ENDPOINT_URL` is set and is not a valid URI.
pub async fn load_from_env() -> Result<SdkConfig> {
    let mut shared_config = aws_config::from_env();
    if let Some(uri) = get_endpoint_uri()? {
        shared_config = shared_config.endpoint_url(uri.to_string());
    }
    Ok(shared_config.load().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serial_test::serial;

    const UPLOAD_VARS: [&str; 3] = [
        "UPLOAD_PART_SIZE",
        "UPLOAD_CONCURRENCY",
        "UPLOAD_DEFAULT_CONTENT_TYPE",
    ];

    fn clear_upload_vars() {
        for var in UPLOAD_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let config = UploaderConfig::default();
        assert_eq!(*config.part_size.as_ref(), 10_000_000);
        assert_eq!(config.max_concurrent_uploads.get(), 4);
        assert_eq!(config.default_content_type, "text/plain");
    }

    #[test]
    #[serial]
    fn test_from_env_without_variables() {
        clear_upload_vars();
        assert_eq!(UploaderConfig::from_env().unwrap(), UploaderConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_upload_vars();
        env::set_var("UPLOAD_PART_SIZE", "8388608");
        env::set_var("UPLOAD_CONCURRENCY", "2");
        env::set_var("UPLOAD_DEFAULT_CONTENT_TYPE", "application/octet-stream");

        let config = UploaderConfig::from_env().unwrap();
        clear_upload_vars();

        assert_eq!(*config.part_size.as_ref(), 8_388_608);
        assert_eq!(config.max_concurrent_uploads.get(), 2);
        assert_eq!(config.default_content_type, "application/octet-stream");
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_small_parts() {
        clear_upload_vars();
        env::set_var("UPLOAD_PART_SIZE", "1024");
        let result = UploaderConfig::from_env();
        clear_upload_vars();
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_zero_concurrency() {
        clear_upload_vars();
        env::set_var("UPLOAD_CONCURRENCY", "0");
        let result = UploaderConfig::from_env();
        clear_upload_vars();
        assert!(result.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn test_load_from_env_with_endpoint() {
        env::set_var("AWS_REGION", "ap-southeast-2");
        env::set_var("S3_ENDPOINT_URL", "http://localhost:9000");
        let shared_config = load_from_env().await;
        env::remove_var("S3_ENDPOINT_URL");

        let shared_config = shared_config.unwrap();
        assert_matches!(
            shared_config.endpoint_url(),
            Some(url) if url.starts_with("http://localhost:9000")
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_load_from_env_invalid_endpoint() {
        env::set_var("S3_ENDPOINT_URL", "not a uri");
        let result = load_from_env().await;
        env::remove_var("S3_ENDPOINT_URL");
        assert!(result.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn test_load_from_env_without_endpoint() {
        env::set_var("AWS_REGION", "ap-southeast-2");
        env::remove_var("S3_ENDPOINT_URL");
        let shared_config = load_from_env().await.unwrap();
        assert_eq!(shared_config.endpoint_url(), None);
    }
}
