//! # Virtual Filesystem
//!
//! The sole I/O collaborator of the storage core. Every persistent byte
//! moves through this layer: schema files, fragment metadata, attribute
//! tile files, lock files, and directory taxonomy checks.
//!
//! The shipped backend is posix (`file://` URIs and bare paths). The
//! contract also names bucket operations for object-store schemes; those
//! return `InvalidArgument` here since no object-store backend is compiled
//! in; callers probe support with [`Vfs::supports_uri`].
//!
//! ## Semantics
//!
//! - `read` is positional and exact: short reads are errors.
//! - `write` appends, creating the file if needed. Attribute tile files
//!   are written once and never rewritten, which is what makes
//!   `(uri, offset)` a stable tile cache key.
//! - `ls` returns children in lexicographic order so fragment enumeration
//!   is deterministic before the loader's timestamp sort.
//! - Errors: missing objects are `NotFound`; everything else surfaced from
//!   the OS is `IOError`. No retries at this layer.

pub mod filelock;

pub use filelock::{FileLock, LockMode};

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use tracing::debug;

use crate::config::Config;
use crate::error::StorageError;
use crate::uri::Uri;

/// Posix-backed virtual filesystem.
#[derive(Debug)]
pub struct Vfs {
    filelocks_enabled: bool,
}

impl Vfs {
    pub fn new(config: &Config) -> Self {
        let filelocks_enabled = config
            .get("vfs.file.enable_filelocks")
            .map(|v| v != "false")
            .unwrap_or(true);
        Self { filelocks_enabled }
    }

    pub fn supports_uri(&self, uri: &Uri) -> bool {
        uri.is_file()
    }

    /// Reads exactly `nbytes` at `offset` into `buffer` (resized to fit).
    pub fn read(&self, uri: &Uri, offset: u64, buffer: &mut Vec<u8>, nbytes: u64) -> Result<()> {
        let path = self.path_of(uri)?;
        let mut file = open_existing(&path)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(io_err(&path, "seek"))?;
        buffer.resize(nbytes as usize, 0);
        file.read_exact(buffer)
            .map_err(io_err(&path, "read_exact"))?;
        Ok(())
    }

    /// Appends `data`, creating the file if needed.
    pub fn write(&self, uri: &Uri, data: &[u8]) -> Result<()> {
        let path = self.path_of(uri)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path, "open for append"))?;
        file.write_all(data).map_err(io_err(&path, "write"))?;
        Ok(())
    }

    pub fn sync(&self, uri: &Uri) -> Result<()> {
        let path = self.path_of(uri)?;
        let file = open_existing(&path)?;
        file.sync_all().map_err(io_err(&path, "sync"))?;
        Ok(())
    }

    /// Flushes and closes any cached handle for `uri`. The posix backend
    /// opens per operation, so only the durability half applies.
    pub fn close_file(&self, uri: &Uri) -> Result<()> {
        if self.is_file(uri)? {
            self.sync(uri)?;
        }
        Ok(())
    }

    /// Children of a directory, lexicographically ordered.
    pub fn ls(&self, uri: &Uri) -> Result<Vec<Uri>> {
        let path = self.path_of(uri)?;
        if !path.is_dir() {
            eyre::bail!(StorageError::NotFound(format!(
                "cannot list '{uri}': not a directory"
            )));
        }
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(&path).map_err(io_err(&path, "read_dir"))? {
            let entry = entry.map_err(io_err(&path, "read_dir entry"))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort_unstable();
        Ok(names.iter().map(|n| uri.join(n)).collect())
    }

    pub fn is_dir(&self, uri: &Uri) -> Result<bool> {
        Ok(self.path_of(uri)?.is_dir())
    }

    pub fn is_file(&self, uri: &Uri) -> Result<bool> {
        Ok(self.path_of(uri)?.is_file())
    }

    pub fn file_size(&self, uri: &Uri) -> Result<u64> {
        let path = self.path_of(uri)?;
        let meta = fs::metadata(&path).map_err(|_| {
            eyre::eyre!(StorageError::NotFound(format!("no such file: '{uri}'")))
        })?;
        Ok(meta.len())
    }

    pub fn create_dir(&self, uri: &Uri) -> Result<()> {
        let path = self.path_of(uri)?;
        if path.exists() {
            eyre::bail!(StorageError::AlreadyExists(format!(
                "cannot create directory '{uri}'"
            )));
        }
        fs::create_dir_all(&path).map_err(io_err(&path, "create_dir"))?;
        debug!(uri = %uri, "created directory");
        Ok(())
    }

    pub fn touch(&self, uri: &Uri) -> Result<()> {
        let path = self.path_of(uri)?;
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err(&path, "touch"))?;
        Ok(())
    }

    /// Removes a file or an entire directory tree.
    pub fn remove(&self, uri: &Uri) -> Result<()> {
        let path = self.path_of(uri)?;
        if path.is_dir() {
            fs::remove_dir_all(&path).map_err(io_err(&path, "remove_dir_all"))?;
        } else if path.is_file() {
            fs::remove_file(&path).map_err(io_err(&path, "remove_file"))?;
        } else {
            eyre::bail!(StorageError::NotFound(format!("cannot remove '{uri}'")));
        }
        Ok(())
    }

    /// Renames `src` to `dst`, replacing `dst` if present.
    pub fn move_object(&self, src: &Uri, dst: &Uri) -> Result<()> {
        let src_path = self.path_of(src)?;
        let dst_path = self.path_of(dst)?;
        if !src_path.exists() {
            eyre::bail!(StorageError::NotFound(format!("cannot move '{src}'")));
        }
        fs::rename(&src_path, &dst_path)
            .map_err(io_err(&src_path, "rename"))
            .wrap_err_with(|| format!("moving '{src}' to '{dst}'"))?;
        Ok(())
    }

    /// Acquires an advisory lock, blocking until granted.
    pub fn filelock_lock(&self, uri: &Uri, mode: LockMode) -> Result<FileLock> {
        let path = self.path_of(uri)?;
        FileLock::acquire(&path, mode, self.filelocks_enabled)
    }

    pub fn filelock_unlock(&self, lock: FileLock) {
        lock.unlock();
    }

    pub fn is_bucket(&self, uri: &Uri) -> Result<bool> {
        eyre::bail!(StorageError::InvalidArgument(format!(
            "no object-store backend for scheme '{}'",
            uri.scheme()
        )))
    }

    pub fn create_bucket(&self, uri: &Uri) -> Result<()> {
        eyre::bail!(StorageError::InvalidArgument(format!(
            "no object-store backend for scheme '{}'",
            uri.scheme()
        )))
    }

    pub fn remove_bucket(&self, uri: &Uri) -> Result<()> {
        eyre::bail!(StorageError::InvalidArgument(format!(
            "no object-store backend for scheme '{}'",
            uri.scheme()
        )))
    }

    fn path_of(&self, uri: &Uri) -> Result<PathBuf> {
        uri.to_path().ok_or_else(|| {
            eyre::eyre!(StorageError::InvalidArgument(format!(
                "unsupported URI scheme '{}' in '{uri}'",
                uri.scheme()
            )))
        })
    }
}

fn open_existing(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            eyre::eyre!(StorageError::NotFound(format!(
                "no such file: '{}'",
                path.display()
            )))
        } else {
            eyre::eyre!(StorageError::IOError(format!(
                "cannot open '{}': {e}",
                path.display()
            )))
        }
    })
}

fn io_err<'a>(path: &'a Path, op: &'a str) -> impl Fn(std::io::Error) -> eyre::Report + 'a {
    move |e| {
        eyre::eyre!(StorageError::IOError(format!(
            "{op} failed on '{}': {e}",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_storage_error;

    fn vfs() -> Vfs {
        Vfs::new(&Config::new())
    }

    #[test]
    fn write_appends_and_read_is_positional() {
        let dir = tempfile::tempdir().unwrap();
        let uri = Uri::from(dir.path()).join("data.tsr");
        let vfs = vfs();

        vfs.write(&uri, b"hello ").unwrap();
        vfs.write(&uri, b"world").unwrap();

        let mut buf = Vec::new();
        vfs.read(&uri, 6, &mut buf, 5).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn short_read_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let uri = Uri::from(dir.path()).join("data.tsr");
        let vfs = vfs();
        vfs.write(&uri, b"abc").unwrap();

        let mut buf = Vec::new();
        assert!(vfs.read(&uri, 0, &mut buf, 10).is_err());
    }

    #[test]
    fn read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let uri = Uri::from(dir.path()).join("absent.tsr");
        let mut buf = Vec::new();
        let err = vfs().read(&uri, 0, &mut buf, 1).unwrap_err();
        assert!(is_storage_error(
            &err,
            &StorageError::NotFound(String::new())
        ));
    }

    #[test]
    fn ls_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = Uri::from(dir.path());
        let vfs = vfs();
        for name in ["b.tsr", "a.tsr", "c.tsr"] {
            vfs.touch(&root.join(name)).unwrap();
        }
        let names: Vec<String> = vfs
            .ls(&root)
            .unwrap()
            .iter()
            .map(|u| u.last_path_part().to_string())
            .collect();
        assert_eq!(names, vec!["a.tsr", "b.tsr", "c.tsr"]);
    }

    #[test]
    fn create_dir_twice_is_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let uri = Uri::from(dir.path()).join("sub");
        let vfs = vfs();
        vfs.create_dir(&uri).unwrap();
        let err = vfs.create_dir(&uri).unwrap_err();
        assert!(is_storage_error(
            &err,
            &StorageError::AlreadyExists(String::new())
        ));
    }

    #[test]
    fn move_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let root = Uri::from(dir.path());
        let vfs = vfs();
        let src = root.join("src.tsr");
        let dst = root.join("dst.tsr");
        vfs.write(&src, b"payload").unwrap();
        vfs.write(&dst, b"old").unwrap();

        vfs.move_object(&src, &dst).unwrap();
        assert!(!vfs.is_file(&src).unwrap());
        let mut buf = Vec::new();
        vfs.read(&dst, 0, &mut buf, 7).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn bucket_ops_unsupported_for_posix() {
        let err = vfs().is_bucket(&Uri::new("/tmp/x")).unwrap_err();
        assert!(is_storage_error(
            &err,
            &StorageError::InvalidArgument(String::new())
        ));
    }

    #[test]
    fn remove_file_and_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = Uri::from(dir.path());
        let vfs = vfs();
        let sub = root.join("sub");
        vfs.create_dir(&sub).unwrap();
        vfs.touch(&sub.join("f.tsr")).unwrap();

        vfs.remove(&sub).unwrap();
        assert!(!vfs.is_dir(&sub).unwrap());

        let err = vfs.remove(&sub).unwrap_err();
        assert!(is_storage_error(
            &err,
            &StorageError::NotFound(String::new())
        ));
    }
}
