//! Object store backed by an opendal [`Operator`]: S3-compatible buckets,
//! plus opendal's filesystem and memory services.
//!
//! The engine's storage calls are synchronous. Each store owns a small tokio
//! runtime and blocks on it, so callers must not be async tasks themselves
//! (the HTTP layer already moves engine calls onto the blocking pool).

use std::future::Future;
use std::ops::Range;
use std::path::Path;

use opendal::{ErrorKind, Operator};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::debug;

use super::{ObjectStore, PutMode};
use crate::config::StorageConfig;
use crate::error::{Result, VexError};

#[derive(Debug)]
pub struct OpendalStore {
    op: Operator,
    /// `None` only while dropping.
    runtime: Option<Runtime>,
    /// Serializes `Create` writes issued by this process.
    create_lock: Mutex<()>,
}

impl OpendalStore {
    pub fn new(op: Operator) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("vectorlake-io")
            .enable_all()
            .build()?;
        Ok(Self {
            op,
            runtime: Some(runtime),
            create_lock: Mutex::new(()),
        })
    }

    /// In-process memory service.
    pub fn memory() -> Result<Self> {
        let op = Operator::new(opendal::services::Memory::default())
            .map_err(config_error)?
            .finish();
        Self::new(op)
    }

    /// Filesystem service rooted at `root`.
    pub fn fs(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
        let op = Operator::new(builder).map_err(config_error)?.finish();
        Self::new(op)
    }

    /// S3-compatible bucket described by `config`.
    pub fn s3(config: &StorageConfig) -> Result<Self> {
        let mut builder = opendal::services::S3::default()
            .bucket(&config.bucket)
            .region(&config.region);
        if !config.root.is_empty() {
            builder = builder.root(&config.root);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint(endpoint);
        }
        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            builder = builder.access_key_id(key).secret_access_key(secret);
        }
        if config.virtual_host_style {
            builder = builder.enable_virtual_host_style();
        }
        let op = Operator::new(builder).map_err(config_error)?.finish();
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "opened s3 store");
        Self::new(op)
    }

    fn block_on<F: Future>(&self, fut: F) -> Result<F::Output> {
        match &self.runtime {
            Some(runtime) => Ok(runtime.block_on(fut)),
            None => Err(VexError::Storage("object store is shut down".into())),
        }
    }

    fn write(&self, path: &str, bytes: &[u8], if_not_exists: bool) -> Result<opendal::Result<()>> {
        let data = bytes.to_vec();
        self.block_on(async {
            self.op
                .write_with(path, data)
                .if_not_exists(if_not_exists)
                .await
                .map(|_| ())
        })
    }
}

impl Drop for OpendalStore {
    fn drop(&mut self) {
        // Dropping a runtime from inside another one panics; this does not.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn config_error(e: opendal::Error) -> VexError {
    VexError::Config(format!("cannot build object store: {}", e))
}

/// Translate an opendal error into the engine's storage taxonomy.
pub(crate) fn map_error(path: &str, e: opendal::Error) -> VexError {
    match e.kind() {
        ErrorKind::NotFound => VexError::ObjectNotFound {
            path: path.to_string(),
        },
        ErrorKind::AlreadyExists | ErrorKind::ConditionNotMatch => VexError::AlreadyExists {
            path: path.to_string(),
        },
        ErrorKind::RateLimited => VexError::TransientStorage(format!("{}: {}", path, e)),
        _ if e.is_temporary() => VexError::TransientStorage(format!("{}: {}", path, e)),
        _ => VexError::Storage(format!("{}: {}", path, e)),
    }
}

/// Directory part of `prefix`, in the form opendal lists.
fn list_root(prefix: &str) -> &str {
    match prefix.rfind('/') {
        Some(i) => &prefix[..=i],
        None => "/",
    }
}

impl ObjectStore for OpendalStore {
    fn put_file(&self, path: &str, bytes: &[u8], mode: PutMode) -> Result<()> {
        match mode {
            PutMode::Overwrite => self.write(path, bytes, false)?.map_err(|e| map_error(path, e)),
            PutMode::Create => {
                let _guard = self.create_lock.lock();
                if self.head(path)?.is_some() {
                    return Err(VexError::AlreadyExists {
                        path: path.to_string(),
                    });
                }
                match self.write(path, bytes, true)? {
                    // Services without conditional writes rely on the check above.
                    Err(e) if e.kind() == ErrorKind::Unsupported => {
                        self.write(path, bytes, false)?.map_err(|e| map_error(path, e))
                    }
                    other => other.map_err(|e| map_error(path, e)),
                }
            }
        }
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.block_on(async { self.op.read(path).await })?
            .map(|buf| buf.to_vec())
            .map_err(|e| map_error(path, e))
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Vec<u8>> {
        if range.start > range.end {
            return Err(VexError::Storage(format!("empty range {:?} on {}", range, path)));
        }
        let wanted = range.end - range.start;
        let bytes = self
            .block_on(async { self.op.read_with(path).range(range.clone()).await })?
            .map(|buf| buf.to_vec())
            .map_err(|e| map_error(path, e))?;
        if bytes.len() as u64 != wanted {
            return Err(VexError::Storage(format!(
                "range {:?} outside object {} ({} bytes returned)",
                range,
                path,
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = list_root(prefix);
        let entries = match self.block_on(async { self.op.list_with(root).recursive(true).await })? {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_error(prefix, e)),
        };
        let mut out: Vec<String> = entries
            .into_iter()
            .filter(|entry| entry.metadata().mode().is_file())
            .map(|entry| entry.path().trim_start_matches('/').to_string())
            .filter(|path| path.starts_with(prefix))
            .collect();
        out.sort();
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<()> {
        match self.block_on(async { self.op.delete(path).await })? {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_error(path, e)),
        }
    }

    fn head(&self, path: &str) -> Result<Option<u64>> {
        match self.block_on(async { self.op.stat(path).await })? {
            Ok(meta) => Ok(Some(meta.content_length())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_error(path, e)),
        }
    }
}
