//! Remote origin abstraction.
//!
//! The pipeline only ever talks to an origin through [`RemoteOrigin`]. The HTTP
//! implementation lives in [`super::http`]; [`MemoryOrigin`] serves files from
//! memory for tests and pre-seeded mirrors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};

use super::error::FetchError;

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Open response body.
pub struct RemoteBody {
    /// `Content-Length`, when the origin sent one.
    pub content_length: Option<u64>,
    pub stream: ByteStream,
}

impl std::fmt::Debug for RemoteBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Source of model files addressed by `(repository, revision, file)`.
#[async_trait]
pub trait RemoteOrigin: Send + Sync {
    /// Start streaming a file.
    async fn open(&self, repository: &str, revision: &str, file: &str) -> Result<RemoteBody, FetchError>;

    /// Lightweight existence check. `Ok(false)` means the file is absent.
    async fn probe(&self, repository: &str, revision: &str, file: &str) -> Result<bool, FetchError>;

    /// Short label for logs.
    fn name(&self) -> &str {
        "remote"
    }
}

/// Scripted misbehaviour for one file of a [`MemoryOrigin`].
#[derive(Debug, Clone)]
pub enum Fault {
    /// Always answer with this HTTP status.
    Status(u16),
    /// Answer 503 for the first `n` opens, then serve normally.
    FailTimes(u32),
    /// Advertise the full length but stop after this many bytes.
    Truncate(usize),
    /// Accept the request, then never send a byte.
    Stall,
}

type Key = (String, String);

/// In-process origin. Revisions are ignored.
pub struct MemoryOrigin {
    files: RwLock<HashMap<Key, Bytes>>,
    faults: Mutex<HashMap<Key, (Fault, u32)>>,
    log: Mutex<Vec<String>>,
    opens: AtomicU64,
    probes: AtomicU64,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
}

impl MemoryOrigin {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            opens: AtomicU64::new(0),
            probes: AtomicU64::new(0),
            chunk_size: 64 * 1024,
            chunk_delay: None,
        }
    }

    /// Split bodies into chunks of this size.
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    /// Sleep between chunks.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn insert(&self, repository: &str, file: &str, data: impl Into<Bytes>) {
        self.files
            .write()
            .insert((repository.to_string(), file.to_string()), data.into());
    }

    pub fn remove(&self, repository: &str, file: &str) {
        self.files.write().remove(&(repository.to_string(), file.to_string()));
    }

    pub fn set_fault(&self, repository: &str, file: &str, fault: Fault) {
        self.faults
            .lock()
            .insert((repository.to_string(), file.to_string()), (fault, 0));
    }

    pub fn clear_fault(&self, repository: &str, file: &str) {
        self.faults.lock().remove(&(repository.to_string(), file.to_string()));
    }

    /// Total number of opens and probes served.
    pub fn request_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst) + self.probes.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Files opened so far, as `repository/file`, in request order.
    pub fn opened(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn reset_counters(&self) {
        self.opens.store(0, Ordering::SeqCst);
        self.probes.store(0, Ordering::SeqCst);
        self.log.lock().clear();
    }

    /// Apply a scripted fault, if any. `Ok(Some)` carries a fault that shapes
    /// the body rather than the response.
    fn check_fault(&self, key: &Key) -> Result<Option<Fault>, FetchError> {
        let mut faults = self.faults.lock();
        let Some((fault, hits)) = faults.get_mut(key) else {
            return Ok(None);
        };
        *hits += 1;
        match fault {
            Fault::Status(code) => Err(FetchError::from_status(&key.1, *code)),
            Fault::FailTimes(n) if *hits <= *n => Err(FetchError::from_status(&key.1, 503)),
            Fault::FailTimes(_) => Ok(None),
            other => Ok(Some(other.clone())),
        }
    }

    fn chunked(&self, data: Bytes, limit: usize) -> ByteStream {
        let data = data.slice(..limit.min(data.len()));
        let chunks: Vec<Bytes> = (0..data.len())
            .step_by(self.chunk_size)
            .map(|start| data.slice(start..(start + self.chunk_size).min(data.len())))
            .collect();
        let delay = self.chunk_delay;
        stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                Ok(chunk)
            })
            .boxed()
    }
}

impl Default for MemoryOrigin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteOrigin for MemoryOrigin {
    async fn open(&self, repository: &str, _revision: &str, file: &str) -> Result<RemoteBody, FetchError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("{repository}/{file}"));

        let key = (repository.to_string(), file.to_string());
        let shaping = self.check_fault(&key)?;
        let data = self
            .files
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| FetchError::from_status(file, 404))?;
        let content_length = Some(data.len() as u64);

        let stream = match shaping {
            Some(Fault::Stall) => stream::pending().boxed(),
            Some(Fault::Truncate(n)) => self.chunked(data, n),
            _ => {
                let len = data.len();
                self.chunked(data, len)
            }
        };
        Ok(RemoteBody { content_length, stream })
    }

    async fn probe(&self, repository: &str, _revision: &str, file: &str) -> Result<bool, FetchError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let key = (repository.to_string(), file.to_string());
        if let Some((Fault::Status(code), _)) = self.faults.lock().get(&key) {
            return match code {
                404 | 410 => Ok(false),
                code => Err(FetchError::from_status(file, *code)),
            };
        }
        Ok(self.files.read().contains_key(&key))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Read a whole body into memory, refusing anything larger than `limit`.
pub(crate) async fn read_to_end(file: &str, body: RemoteBody, limit: usize) -> Result<Vec<u8>, FetchError> {
    if body.content_length.map_or(false, |len| len > limit as u64) {
        return Err(FetchError::corrupt(file, format!("larger than {limit} bytes")));
    }
    let mut out = Vec::with_capacity(body.content_length.unwrap_or(0) as usize);
    let mut stream = body.stream;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if out.len() + chunk.len() > limit {
            return Err(FetchError::corrupt(file, format!("larger than {limit} bytes")));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_serves_inserted_files_in_chunks() {
        let origin = MemoryOrigin::new().with_chunk_size(3);
        origin.insert("org/m", "config.json", &b"{\"a\":1}"[..]);
        let body = origin.open("org/m", "main", "config.json").await.unwrap();
        assert_eq!(body.content_length, Some(7));
        let chunks: Vec<_> = body.stream.collect().await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(origin.open_count(), 1);
        assert_eq!(origin.opened(), vec!["org/m/config.json".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let origin = MemoryOrigin::new();
        let err = origin.open("org/m", "main", "nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!origin.probe("org/m", "main", "nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_times_then_recovers() {
        let origin = MemoryOrigin::new();
        origin.insert("org/m", "f", &b"data"[..]);
        origin.set_fault("org/m", "f", Fault::FailTimes(2));
        assert!(origin.open("org/m", "main", "f").await.unwrap_err().is_transient());
        assert!(origin.open("org/m", "main", "f").await.unwrap_err().is_transient());
        assert!(origin.open("org/m", "main", "f").await.is_ok());
    }

    #[tokio::test]
    async fn test_read_to_end_enforces_limit() {
        let origin = MemoryOrigin::new().with_chunk_size(2);
        origin.insert("org/m", "big", vec![0u8; 10]);
        let body = origin.open("org/m", "main", "big").await.unwrap();
        let err = read_to_end("big", body, 4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
