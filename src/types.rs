//! Data types shared by the planner, the part uploads and the uploader.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// An initiated multipart upload for a single local file.
///
/// Created by the uploader once the storage proxy has confirmed the
/// multipart upload. It does not change for the rest of the upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// The key of the object being written, as returned by the proxy.
    pub object_key: String,
    /// The multipart upload id.
    pub upload_id: String,
    /// The nominal size, in bytes, of every part but the last.
    pub part_size: u64,
    /// The size, in bytes, of the whole source file.
    pub total_size: u64,
    /// The content type the object was created with.
    pub content_type: String,
}

/// A byte range of the source file which is uploaded as one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartSlice {
    /// 1-based part number.
    pub part_number: i32,
    /// Offset of the first byte of the part.
    pub byte_offset: u64,
    /// Number of bytes in the part.
    pub byte_length: u64,
}

impl PartSlice {
    /// The offset one past the last byte of the part.
    pub fn end(&self) -> u64 {
        self.byte_offset + self.byte_length
    }
}

/// A part which has been uploaded and acknowledged by the storage service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: i32,
    /// The part's ETag with the quotes (and any other non-word characters) removed.
    pub etag: String,
    pub object_key: String,
}

/// Result of [StorageProxy::create_multipart_upload](crate::s3::StorageProxy::create_multipart_upload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatedUpload {
    pub key: String,
    pub upload_id: String,
}

/// Describes the object produced by completing a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub key: String,
    pub upload_id: String,
    pub location: Option<String>,
    pub etag: Option<String>,
    pub version_id: Option<String>,
}

/// A multipart upload which has been initiated but neither completed nor aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUploadSummary {
    pub key: String,
    pub upload_id: String,
    pub initiated: Option<SystemTime>,
}

/// Cumulative transfer progress of a single part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartProgress {
    pub bytes_loaded: u64,
    pub bytes_total: u64,
}
