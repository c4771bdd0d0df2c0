//! # The Cobalt S3 upload library
//!
//! This library uploads large local files to S3, or to S3-compatible
//! services, as [multipart uploads](https://docs.aws.amazon.com/AmazonS3/latest/userguide/mpuoverview.html).
//!
//! Files are split into parts which are uploaded concurrently to pre-signed
//! URLs, with aggregate progress reported as the parts are sent. The service
//! which signs the URLs is abstracted behind [s3::StorageProxy], so the bucket
//! credentials can stay on a server while the bytes travel from the client.
//!
//! ### About harrison.ai
//!
//! This crate is maintained by the Data Engineering team at [harrison.ai](https://harrison.ai).
//!
//! At [harrison.ai](https://harrison.ai) our mission is to create AI-as-a-medical-device solutions through
//! ventures and ultimately improve the standard of healthcare for 1 million lives every day.
//!

// Public modules

pub mod config;
pub mod queue;
pub mod s3;
pub mod types;
