//! Injectable filesystem abstraction.
//!
//! The object store talks to named blobs through this trait rather than to
//! `std::fs` directly, so a directory-backed implementation and an
//! in-memory fake can both serve as its backing store (the fake makes the
//! journal/branch/cache tests in this crate fast and independent of disk
//! state).

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::error::CoreResult;

/// A readable/writable/seekable byte stream handed back by the filesystem
/// abstraction.
pub trait FileLike: Read + Write + Seek {}
impl<T: Read + Write + Seek> FileLike for T {}

/// Minimal filesystem surface the object store depends on.
pub trait FileSystem {
    /// Creates `name`, truncating any existing content.
    fn create(&self, name: &str) -> CoreResult<Box<dyn FileLike + '_>>;
    /// Opens `name` for reading. Fails with `CoreError::UnknownName` if it
    /// does not exist.
    fn open(&self, name: &str) -> CoreResult<Box<dyn FileLike + '_>>;
    /// Opens `name` in append + create + synchronous-write mode, creating it
    /// if necessary.
    fn append(&self, name: &str) -> CoreResult<Box<dyn FileLike + '_>>;
    /// Returns whether `name` currently exists.
    fn exists(&self, name: &str) -> bool;
    /// Creates directory `name`, including parents, idempotently.
    fn mkdir(&self, name: &str) -> CoreResult<()>;
    /// Removes `name`. Idempotent: removing a missing file is not an error.
    fn remove(&self, name: &str) -> CoreResult<()>;
    /// Returns the current byte length of `name`.
    ///
    /// This is the one addition beyond the filesystem operations enumerated
    /// in spec.md §4.5 — needed so `Head::should_commit` can measure journal
    /// size without the object store separately tracking cumulative bytes
    /// written (which would risk drifting from the file's real contents).
    fn size(&self, name: &str) -> CoreResult<u64>;
}

/// Production filesystem: a real directory on disk.
#[derive(Debug)]
pub struct DirFileSystem {
    root: PathBuf,
}

impl DirFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl FileSystem for DirFileSystem {
    fn create(&self, name: &str) -> CoreResult<Box<dyn FileLike + '_>> {
        let path = self.full_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        Ok(Box::new(file))
    }

    fn open(&self, name: &str) -> CoreResult<Box<dyn FileLike + '_>> {
        let file = std::fs::File::open(self.full_path(name))?;
        Ok(Box::new(file))
    }

    fn append(&self, name: &str) -> CoreResult<Box<dyn FileLike + '_>> {
        let path = self.full_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Box::new(file))
    }

    fn exists(&self, name: &str) -> bool {
        self.full_path(name).exists()
    }

    fn mkdir(&self, name: &str) -> CoreResult<()> {
        std::fs::create_dir_all(self.full_path(name))?;
        Ok(())
    }

    fn remove(&self, name: &str) -> CoreResult<()> {
        match std::fs::remove_file(self.full_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn size(&self, name: &str) -> CoreResult<u64> {
        Ok(std::fs::metadata(self.full_path(name))?.len())
    }
}

/// In-memory fake used by tests. Durability/append semantics are emulated
/// with a plain `HashMap<String, Vec<u8>>` behind a `RefCell`, matching the
/// teacher-and-pack pattern of a buffer-backed fake filesystem (cf. the
/// original Go implementation's `FakeFileSys`).
#[derive(Debug, Default)]
pub struct MemFileSystem {
    contents: RefCell<HashMap<String, Vec<u8>>>,
}

impl MemFileSystem {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A `Cursor<Vec<u8>>` that writes itself back into the fake filesystem's
/// map on drop, so `create`/`append` handles behave like real file handles.
struct MemFile<'a> {
    name: String,
    cursor: Cursor<Vec<u8>>,
    append_offset: u64,
    backing: &'a RefCell<HashMap<String, Vec<u8>>>,
}

impl Read for MemFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Write for MemFile<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.cursor.flush()
    }
}

impl Seek for MemFile<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl Drop for MemFile<'_> {
    fn drop(&mut self) {
        let mut map = self.backing.borrow_mut();
        let data = self.cursor.get_ref().clone();
        if self.append_offset > 0 {
            let entry = map.entry(self.name.clone()).or_default();
            entry.truncate(self.append_offset as usize);
            entry.extend_from_slice(&data[self.append_offset as usize..]);
        } else {
            map.insert(self.name.clone(), data);
        }
    }
}

impl FileSystem for MemFileSystem {
    fn create(&self, name: &str) -> CoreResult<Box<dyn FileLike + '_>> {
        self.contents.borrow_mut().insert(name.to_string(), Vec::new());
        Ok(Box::new(MemFile {
            name: name.to_string(),
            cursor: Cursor::new(Vec::new()),
            append_offset: 0,
            backing: &self.contents,
        }))
    }

    fn open(&self, name: &str) -> CoreResult<Box<dyn FileLike + '_>> {
        let data = self
            .contents
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| crate::error::CoreError::UnknownName(name.to_string()))?;
        Ok(Box::new(MemFile {
            name: name.to_string(),
            cursor: Cursor::new(data),
            append_offset: 0,
            backing: &self.contents,
        }))
    }

    fn append(&self, name: &str) -> CoreResult<Box<dyn FileLike + '_>> {
        let existing = self.contents.borrow_mut().entry(name.to_string()).or_default().clone();
        let offset = existing.len() as u64;
        let mut cursor = Cursor::new(existing);
        cursor.seek(SeekFrom::End(0))?;
        Ok(Box::new(MemFile {
            name: name.to_string(),
            cursor,
            append_offset: offset,
            backing: &self.contents,
        }))
    }

    fn exists(&self, name: &str) -> bool {
        self.contents.borrow().contains_key(name)
    }

    fn mkdir(&self, _name: &str) -> CoreResult<()> {
        Ok(())
    }

    fn remove(&self, name: &str) -> CoreResult<()> {
        self.contents.borrow_mut().remove(name);
        Ok(())
    }

    fn size(&self, name: &str) -> CoreResult<u64> {
        Ok(self.contents.borrow().get(name).map(|v| v.len() as u64).unwrap_or(0))
    }
}

/// Joins path segments with `/`, independent of the host's native separator
/// — on-disk object names are always posix-style (`refs/master`,
/// `journals/master`).
pub fn join(a: &str, b: &str) -> String {
    format!("{a}/{b}")
}
