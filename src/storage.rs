//! Filesystem primitives consumed by the transfer handlers
//!
//! `Storage` is the seam between the HTTP handlers and whatever backs the
//! served tree (an SD card mount on a device, a plain directory here).

use crate::error::StorageError;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

/// An open file handle. Moved wholesale into the I/O worker for
/// asynchronous transfers.
pub trait StorageFile: Read + Write + Send {}

impl<T: Read + Write + Send> StorageFile for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub len: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

pub trait Storage: Send + Sync {
    /// Whether the backing medium is mounted and usable
    fn is_ready(&self) -> bool;

    /// Map a decoded, root-relative request path onto the backing tree.
    fn resolve(&self, rel: &str) -> Result<PathBuf, StorageError>;

    fn stat(&self, path: &Path) -> Result<Metadata, StorageError>;

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageFile>, StorageError>;

    /// Create a file that must not exist yet.
    fn create_new(&self, path: &Path) -> Result<Box<dyn StorageFile>, StorageError>;

    fn remove_file(&self, path: &Path) -> Result<(), StorageError>;

    fn create_dir(&self, path: &Path) -> Result<(), StorageError>;

    fn remove_dir(&self, path: &Path) -> Result<(), StorageError>;

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, StorageError>;
}

/// Directory-backed storage rooted at a canonical path
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: &Path) -> Result<Self, StorageError> {
        let root = fs::canonicalize(root).map_err(|e| StorageError::from_io(root, e))?;
        Ok(LocalStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Storage for LocalStorage {
    fn is_ready(&self) -> bool {
        self.root.is_dir()
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf, StorageError> {
        normalize_under_root(&self.root, rel)
    }

    fn stat(&self, path: &Path) -> Result<Metadata, StorageError> {
        let meta = fs::metadata(path).map_err(|e| StorageError::from_io(path, e))?;
        Ok(Metadata {
            len: meta.len(),
            is_dir: meta.is_dir(),
        })
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageFile>, StorageError> {
        let file = File::open(path).map_err(|e| StorageError::from_io(path, e))?;
        Ok(Box::new(file))
    }

    fn create_new(&self, path: &Path) -> Result<Box<dyn StorageFile>, StorageError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| StorageError::from_io(path, e))?;
        Ok(Box::new(file))
    }

    fn remove_file(&self, path: &Path) -> Result<(), StorageError> {
        fs::remove_file(path).map_err(|e| StorageError::from_io(path, e))
    }

    fn create_dir(&self, path: &Path) -> Result<(), StorageError> {
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o755);
        }
        builder
            .create(path)
            .map_err(|e| StorageError::from_io(path, e))
    }

    fn remove_dir(&self, path: &Path) -> Result<(), StorageError> {
        fs::remove_dir(path).map_err(|e| StorageError::from_io(path, e))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, StorageError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| StorageError::from_io(path, e))? {
            let entry = entry.map_err(|e| StorageError::from_io(path, e))?;
            // Entries that vanish or can't be stat'ed are skipped
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// Resolve a request path strictly under `root`.
///
/// Leading separators are ignored (request paths are always rooted at the
/// served tree). `..`, drive prefixes and NUL bytes are rejected, and the
/// deepest existing ancestor is canonicalized so symlinks cannot escape.
pub fn normalize_under_root(root: &Path, rel: &str) -> Result<PathBuf, StorageError> {
    if rel.contains('\0') {
        return Err(StorageError::InvalidPath("path contains NUL byte".into()));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(rel.trim_start_matches('/')).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(s) => safe.push(s),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidPath(format!(
                    "disallowed component {:?}",
                    component
                )));
            }
        }
    }

    let joined = root.join(&safe);
    let final_path = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| StorageError::from_io(&joined, e))?
    } else {
        match (joined.parent(), joined.file_name()) {
            (Some(parent), Some(name)) if parent.exists() => parent
                .canonicalize()
                .map_err(|e| StorageError::from_io(parent, e))?
                .join(name),
            _ => joined,
        }
    };

    if !final_path.starts_with(root) {
        return Err(StorageError::InvalidPath(format!(
            "{rel:?} escapes the served root"
        )));
    }
    Ok(final_path)
}
