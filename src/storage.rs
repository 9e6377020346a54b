//! Storage manager. Whole-file reads and writes on a mounted filesystem,
//! serialized through one worker thread.
//!
//! The filesystem itself is an external collaborator behind [`Filesystem`].
//! [`StdFs`] covers both the host and ESP-IDF, whose VFS layer exposes FAT
//! and SD card mounts through `std::fs`.
//!
//! A failed WRITE leaves the file in whatever state the filesystem left it.
//! Callers should treat it as unknown on-disk state and not trust earlier reads.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::NodeError;
use crate::model::ModelSource;
use crate::worker::{lock_or_recover, Correlated, RequestId, Response, WorkerQueue, WorkerSpec};

/// File extension of stored model blobs.
pub const MODEL_FILE_EXT: &str = "bin";

/// Mounted filesystem seen by the storage worker.
pub trait Filesystem: Send + 'static {
    type Reader: Read;
    type Writer: Write;

    /// Open `path` for reading. Returns the reader and the file size.
    fn open(&mut self, path: &str) -> io::Result<(Self::Reader, u64)>;

    /// Create `path`, truncating any existing file.
    fn create(&mut self, path: &str) -> io::Result<Self::Writer>;

    fn remove(&mut self, path: &str) -> io::Result<()>;

    /// Names of the entries in `dir`, sorted.
    fn list(&mut self, dir: &str) -> io::Result<Vec<String>>;
}

/// `std::fs` filesystem rooted at a base directory (`/data`, `/sdcard`,
/// or a host directory).
#[derive(Debug, Clone)]
pub struct StdFs {
    root: PathBuf,
}

impl StdFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl Filesystem for StdFs {
    type Reader = File;
    type Writer = File;

    fn open(&mut self, path: &str) -> io::Result<(File, u64)> {
        let file = File::open(self.resolve(path))?;
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    fn create(&mut self, path: &str) -> io::Result<File> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(full)
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }

    fn list(&mut self, dir: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.resolve(dir))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

// ── Messages ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    Read { path: String },
    /// Create or truncate `path` and write `data`.
    Write { path: String, data: Vec<u8> },
    Delete { path: String },
    List { dir: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRequest {
    pub id: RequestId,
    pub op: StorageOp,
}

impl Correlated for StorageRequest {
    fn request_id(&self) -> RequestId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageReply {
    /// Full contents of a READ.
    Data(Vec<u8>),
    /// Bytes persisted by a WRITE.
    Written(usize),
    Removed,
    Listing(Vec<String>),
}

pub type StorageResponse = Response<StorageReply>;

// ── Manager ──────────────────────────────────────────────────────────

pub struct StorageManager<F: Filesystem> {
    fs: Arc<Mutex<F>>,
    queue: WorkerQueue<StorageRequest, StorageResponse>,
}

impl<F: Filesystem> StorageManager<F> {
    pub fn start(fs: F, capacity: usize, stack_size: usize) -> Result<Self, NodeError> {
        let fs = Arc::new(Mutex::new(fs));
        let spec = WorkerSpec {
            name: "storage",
            capacity,
            stack_size,
        };
        let queue = WorkerQueue::spawn(spec, fs.clone(), handle_request::<F>)?;
        Ok(Self { fs, queue })
    }

    pub fn queue(&self) -> &WorkerQueue<StorageRequest, StorageResponse> {
        &self.queue
    }

    pub fn next_request_id(&self) -> RequestId {
        self.queue.next_request_id()
    }

    pub fn request_read(&self, path: &str, id: RequestId) -> Result<(), NodeError> {
        self.queue.submit(StorageRequest {
            id,
            op: StorageOp::Read { path: path.into() },
        })
    }

    /// Queue a write. Ownership of `data` moves to the worker.
    pub fn request_write(&self, path: &str, data: Vec<u8>, id: RequestId) -> Result<(), NodeError> {
        self.queue.submit(StorageRequest {
            id,
            op: StorageOp::Write {
                path: path.into(),
                data,
            },
        })
    }

    pub fn request_delete(&self, path: &str, id: RequestId) -> Result<(), NodeError> {
        self.queue.submit(StorageRequest {
            id,
            op: StorageOp::Delete { path: path.into() },
        })
    }

    pub fn request_list(&self, dir: &str, id: RequestId) -> Result<(), NodeError> {
        self.queue.submit(StorageRequest {
            id,
            op: StorageOp::List { dir: dir.into() },
        })
    }

    /// Next response from the worker; `None` on timeout.
    pub fn response(&self, timeout: Option<Duration>) -> Option<StorageResponse> {
        match timeout {
            Some(timeout) => self.queue.poll_timeout(timeout),
            None => self.queue.poll(),
        }
    }

    /// READ and wait for the result.
    pub fn read(&self, path: &str, timeout: Option<Duration>) -> Result<Vec<u8>, NodeError> {
        let request = StorageRequest {
            id: self.next_request_id(),
            op: StorageOp::Read { path: path.into() },
        };
        match self.queue.call(request, timeout)?.result? {
            StorageReply::Data(data) => Ok(data),
            other => Err(NodeError::Storage(format!("unexpected reply {:?}", other))),
        }
    }

    /// WRITE and wait for the result. Returns the bytes persisted.
    pub fn write(
        &self,
        path: &str,
        data: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<usize, NodeError> {
        let request = StorageRequest {
            id: self.next_request_id(),
            op: StorageOp::Write {
                path: path.into(),
                data,
            },
        };
        match self.queue.call(request, timeout)?.result? {
            StorageReply::Written(n) => Ok(n),
            other => Err(NodeError::Storage(format!("unexpected reply {:?}", other))),
        }
    }

    /// Model source reading `<dir>/<model_id>.bin` under the storage lock.
    pub fn models(&self, dir: &str) -> StoredModels<F> {
        StoredModels {
            fs: self.fs.clone(),
            dir: dir.into(),
        }
    }

    pub fn shutdown(self) {
        self.queue.shutdown();
    }
}

fn handle_request<F: Filesystem>(fs: &mut F, request: StorageRequest) -> StorageResponse {
    let result = match &request.op {
        StorageOp::Read { path } => read_file(fs, path).map(StorageReply::Data),
        StorageOp::Write { path, data } => write_file(fs, path, data).map(StorageReply::Written),
        StorageOp::Delete { path } => fs
            .remove(path)
            .map(|_| StorageReply::Removed)
            .map_err(|e| NodeError::Storage(format!("{path}: {e}"))),
        StorageOp::List { dir } => fs
            .list(dir)
            .map(StorageReply::Listing)
            .map_err(|e| NodeError::Storage(format!("{dir}: {e}"))),
    };

    if let Err(ref e) = result {
        log::warn!("storage request {} failed: {}", request.id, e);
    }

    Response {
        id: request.id,
        result,
    }
}

fn read_file<F: Filesystem>(fs: &mut F, path: &str) -> Result<Vec<u8>, NodeError> {
    let (reader, size) = fs.open(path).map_err(|e| {
        log::debug!("open {} for read: {}", path, e);
        NodeError::OpenFailed { path: path.into() }
    })?;

    let expected = usize::try_from(size)
        .map_err(|_| NodeError::Storage(format!("{path}: {size} bytes exceeds address space")))?;
    let mut data = Vec::new();
    data.try_reserve_exact(expected)
        .map_err(|_| NodeError::Storage(format!("{path}: cannot buffer {expected} bytes")))?;

    // On error, read_to_end keeps whatever it managed to read.
    if let Err(e) = reader.take(size).read_to_end(&mut data) {
        log::warn!("read {} stopped after {} bytes: {}", path, data.len(), e);
    }

    if data.len() < expected {
        return Err(NodeError::ShortRead {
            read: data.len(),
            expected,
        });
    }
    Ok(data)
}

fn write_file<F: Filesystem>(fs: &mut F, path: &str, data: &[u8]) -> Result<usize, NodeError> {
    let mut writer = fs.create(path).map_err(|e| {
        log::debug!("open {} for write: {}", path, e);
        NodeError::OpenFailed { path: path.into() }
    })?;

    let mut written = 0;
    while written < data.len() {
        match writer.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::warn!("write {} stopped after {} bytes: {}", path, written, e);
                break;
            }
        }
    }

    if let Err(e) = writer.flush() {
        return Err(NodeError::Storage(format!("{path}: flush failed: {e}")));
    }

    if written < data.len() {
        return Err(NodeError::ShortWrite {
            written,
            expected: data.len(),
        });
    }
    Ok(written)
}

// ── Model blobs ──────────────────────────────────────────────────────

/// Stored path of `model_id` under `dir`, or `None` for ids that would
/// escape the model directory.
pub fn model_path(dir: &str, model_id: &str) -> Option<String> {
    if model_id.is_empty()
        || model_id.contains('/')
        || model_id.contains('\\')
        || model_id.contains("..")
    {
        return None;
    }
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        Some(format!("{model_id}.{MODEL_FILE_EXT}"))
    } else {
        Some(format!("{dir}/{model_id}.{MODEL_FILE_EXT}"))
    }
}

/// Model blobs read through the storage manager's filesystem lock, so model
/// loads are serialized with storage requests.
pub struct StoredModels<F: Filesystem> {
    fs: Arc<Mutex<F>>,
    dir: String,
}

impl<F: Filesystem> ModelSource for StoredModels<F> {
    fn fetch(&mut self, model_id: &str) -> Result<Vec<u8>, NodeError> {
        let not_found = || NodeError::ModelNotFound(model_id.into());
        let path = model_path(&self.dir, model_id).ok_or_else(not_found)?;

        let mut fs = lock_or_recover(&self.fs, "storage");
        match read_file(&mut *fs, &path) {
            Err(NodeError::OpenFailed { .. }) => Err(not_found()),
            other => other,
        }
    }
}
