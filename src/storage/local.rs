//! Object store on a local directory.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use super::{ObjectStore, PutMode};
use crate::error::{Result, VexError};

/// Objects are files under `root`; path separators map to directories.
///
/// Writes go to a hidden temp file in the target directory first. `Create`
/// publishes with `hard_link`, which fails atomically if the target exists;
/// `Overwrite` publishes with `rename`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        let clean = !path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(VexError::InvalidArgument(format!(
                "invalid object path: {:?}",
                path
            )));
        }
        Ok(self.root.join(rel))
    }

    fn not_found(path: &str, e: std::io::Error) -> VexError {
        if e.kind() == ErrorKind::NotFound {
            VexError::ObjectNotFound {
                path: path.to_string(),
            }
        } else {
            VexError::Io(e)
        }
    }

    fn write_temp(target: &Path, bytes: &[u8]) -> Result<PathBuf> {
        let dir = target
            .parent()
            .ok_or_else(|| VexError::Storage("object path has no parent".into()))?;
        fs::create_dir_all(dir)?;
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4()));
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(tmp)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.walk(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(key.join("/"));
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalStore {
    fn put_file(&self, path: &str, bytes: &[u8], mode: PutMode) -> Result<()> {
        let target = self.resolve(path)?;
        let tmp = Self::write_temp(&target, bytes)?;
        let published = match mode {
            PutMode::Create => {
                let linked = fs::hard_link(&tmp, &target);
                let _ = fs::remove_file(&tmp);
                linked.map_err(|e| {
                    if e.kind() == ErrorKind::AlreadyExists {
                        VexError::AlreadyExists {
                            path: path.to_string(),
                        }
                    } else {
                        VexError::Io(e)
                    }
                })
            }
            PutMode::Overwrite => fs::rename(&tmp, &target).map_err(|e| {
                let _ = fs::remove_file(&tmp);
                VexError::Io(e)
            }),
        };
        if published.is_ok() {
            debug!(path, bytes = bytes.len(), "object written");
        }
        published
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        fs::read(&target).map_err(|e| Self::not_found(path, e))
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        let mut file = File::open(&target).map_err(|e| Self::not_found(path, e))?;
        let size = file.metadata()?.len();
        if range.start > range.end || range.end > size {
            return Err(VexError::Storage(format!(
                "range {:?} outside object {} of {} bytes",
                range, path, size
            )));
        }
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.seek(SeekFrom::Start(range.start))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.walk(&self.root, &mut out)?;
        out.retain(|p| p.starts_with(prefix));
        out.sort();
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn head(&self, path: &str) -> Result<Option<u64>> {
        let target = self.resolve(path)?;
        match fs::metadata(&target) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
