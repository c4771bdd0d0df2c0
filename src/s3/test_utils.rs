//! In-memory implementations of [StorageProxy] and [PartTransport] for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::TryStreamExt;
use http::header::ETAG;
use http::{HeaderMap, HeaderValue, StatusCode};
use url::Url;

use crate::queue::ProgressReporter;
use crate::s3::proxy::{ProxyError, StorageProxy};
use crate::s3::transport::{PartBody, PartResponse, PartTransport, TransferError};
use crate::types::{
    CompletedPart, InitiatedUpload, MultipartUploadSummary, ObjectDescriptor, PartProgress,
};

fn injected(what: &str) -> ProxyError {
    ProxyError::Service(format!("injected {what} failure").into())
}

/// A multipart upload completed through a [MemoryProxy].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Default)]
struct ProxyState {
    next_upload_id: usize,
    in_progress: BTreeMap<String, String>,
    created: Vec<(String, String)>,
    signed_parts: Vec<i32>,
    completed: Vec<Completion>,
    aborted: Vec<(String, String)>,
    deleted: Vec<String>,
}

/// A [StorageProxy] which keeps its uploads in memory and records every call.
#[derive(Debug, Default)]
pub struct MemoryProxy {
    state: Mutex<ProxyState>,
    fail_create: bool,
    fail_complete: bool,
    fail_signing: HashSet<i32>,
}

impl MemoryProxy {
    /// Seed an in-progress upload.
    pub fn with_upload(self, key: &str, upload_id: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .in_progress
            .insert(upload_id.to_owned(), key.to_owned());
        self
    }

    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn fail_complete(mut self) -> Self {
        self.fail_complete = true;
        self
    }

    pub fn fail_signing(mut self, part_number: i32) -> Self {
        self.fail_signing.insert(part_number);
        self
    }

    /// `(key, content_type)` of every upload created.
    pub fn created(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().created.clone()
    }

    /// Part numbers in the order they were signed.
    pub fn signed_parts(&self) -> Vec<i32> {
        self.state.lock().unwrap().signed_parts.clone()
    }

    pub fn completed(&self) -> Vec<Completion> {
        self.state.lock().unwrap().completed.clone()
    }

    /// `(key, upload_id)` of every aborted upload.
    pub fn aborted(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().aborted.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl StorageProxy for MemoryProxy {
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<InitiatedUpload, ProxyError> {
        if self.fail_create {
            return Err(injected("create"));
        }
        let mut state = self.state.lock().unwrap();
        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);
        state
            .in_progress
            .insert(upload_id.clone(), key.to_owned());
        state
            .created
            .push((key.to_owned(), content_type.to_owned()));
        Ok(InitiatedUpload {
            key: key.to_owned(),
            upload_id,
        })
    }

    async fn sign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> Result<Url, ProxyError> {
        if self.fail_signing.contains(&part_number) {
            return Err(injected("signing"));
        }
        self.state.lock().unwrap().signed_parts.push(part_number);
        Ok(Url::parse_with_params(
            &format!("memory://bucket/{key}"),
            &[
                ("uploadId", upload_id.to_owned()),
                ("partNumber", part_number.to_string()),
            ],
        )?)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectDescriptor, ProxyError> {
        if self.fail_complete {
            return Err(injected("complete"));
        }
        let mut state = self.state.lock().unwrap();
        if state.in_progress.remove(upload_id).is_none() {
            return Err(ProxyError::NoSuchUpload {
                key: key.to_owned(),
                upload_id: upload_id.to_owned(),
            });
        }
        state.completed.push(Completion {
            key: key.to_owned(),
            upload_id: upload_id.to_owned(),
            parts: parts.to_vec(),
        });
        Ok(ObjectDescriptor {
            key: key.to_owned(),
            upload_id: upload_id.to_owned(),
            location: Some(format!("memory://bucket/{key}")),
            etag: Some(format!("{}-{}", upload_id, parts.len())),
            version_id: None,
        })
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap();
        if state.in_progress.remove(upload_id).is_none() {
            return Err(ProxyError::NoSuchUpload {
                key: key.to_owned(),
                upload_id: upload_id.to_owned(),
            });
        }
        state.aborted.push((key.to_owned(), upload_id.to_owned()));
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), ProxyError> {
        self.state.lock().unwrap().deleted.push(key.to_owned());
        Ok(())
    }

    async fn list_multipart_uploads(&self) -> Result<Vec<MultipartUploadSummary>, ProxyError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .in_progress
            .iter()
            .map(|(upload_id, key)| MultipartUploadSummary {
                key: key.clone(),
                upload_id: upload_id.clone(),
                initiated: Some(SystemTime::UNIX_EPOCH),
            })
            .collect())
    }
}

/// A [PartTransport] which stores the bytes it is sent, keyed by part number.
///
/// Responses carry an ETag derived from the bytes of the part, see
/// [MemoryTransport::etag_for].
#[derive(Debug, Default)]
pub struct MemoryTransport {
    received: Mutex<BTreeMap<i32, Vec<u8>>>,
    completion_order: Mutex<Vec<i32>>,
    failures: HashMap<i32, StatusCode>,
    omit_etag: HashSet<i32>,
    delays: HashMap<i32, Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryTransport {
    /// The sanitized ETag returned for a part with these bytes.
    pub fn etag_for(bytes: &[u8]) -> String {
        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Respond to `part_number` with `status`, without reading its bytes.
    pub fn fail_part(mut self, part_number: i32, status: StatusCode) -> Self {
        self.failures.insert(part_number, status);
        self
    }

    pub fn omit_etag(mut self, part_number: i32) -> Self {
        self.omit_etag.insert(part_number);
        self
    }

    /// Hold the response to `part_number` back for `delay`.
    pub fn delay_part(mut self, part_number: i32, delay: Duration) -> Self {
        self.delays.insert(part_number, delay);
        self
    }

    pub fn received(&self, part_number: i32) -> Option<Vec<u8>> {
        self.received.lock().unwrap().get(&part_number).cloned()
    }

    /// Bytes of every received part, concatenated in part order.
    pub fn assembled(&self) -> Vec<u8> {
        self.received.lock().unwrap().values().flatten().copied().collect()
    }

    /// Part numbers in the order their responses were returned.
    pub fn completion_order(&self) -> Vec<i32> {
        self.completion_order.lock().unwrap().clone()
    }

    /// The largest number of parts which were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PartTransport for MemoryTransport {
    async fn put_part(
        &self,
        _url: &Url,
        body: PartBody,
        progress: ProgressReporter<PartProgress>,
    ) -> Result<PartResponse, TransferError> {
        let part_number = body.slice().part_number;
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let response = self.respond(part_number, body, progress).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completion_order.lock().unwrap().push(part_number);
        response
    }
}

impl MemoryTransport {
    async fn respond(
        &self,
        part_number: i32,
        body: PartBody,
        progress: ProgressReporter<PartProgress>,
    ) -> Result<PartResponse, TransferError> {
        if let Some(delay) = self.delays.get(&part_number) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(status) = self.failures.get(&part_number) {
            return Ok(PartResponse {
                status: *status,
                headers: HeaderMap::new(),
            });
        }

        let bytes: Vec<u8> = body
            .into_stream(progress)
            .await
            .map_err(|source| TransferError::Source {
                part_number,
                source,
            })?
            .map_ok(|chunk| chunk.to_vec())
            .try_concat()
            .await
            .map_err(|source| TransferError::Source {
                part_number,
                source,
            })?;

        let mut headers = HeaderMap::new();
        if !self.omit_etag.contains(&part_number) {
            let etag = format!("\"{}\"", Self::etag_for(&bytes));
            headers.insert(ETAG, HeaderValue::from_str(&etag).unwrap());
        }
        self.received.lock().unwrap().insert(part_number, bytes);
        Ok(PartResponse {
            status: StatusCode::OK,
            headers,
        })
    }
}
