//! Lazy directory tree over a file-system adapter.

use crate::card::BlockRead;
use crate::error::{Error, Result};
use crate::fat32::{names_equal, DirEntry, Fat32Volume, Timestamp};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Capability set a volume exposes to the object model.
///
/// Small and stable on purpose: FAT32 is the first implementation, test
/// doubles are the second.
pub trait FileSystemAdapter: Send + Sync {
    /// Lists a directory by `/`-separated path from the root.
    fn list_path(&self, path: &str) -> Result<Vec<DirEntry>>;
    /// Lists an already-resolved directory entry.
    fn list_entry(&self, entry: &DirEntry) -> Result<Vec<DirEntry>>;
    /// Fetches the full content of a file entry.
    fn file_content(&self, entry: &DirEntry) -> Result<Vec<u8>>;
    /// Name equivalence under this file system's rules.
    fn names_equal(&self, a: &str, b: &str) -> bool;
}

impl<D: BlockRead + Send + Sync> FileSystemAdapter for Fat32Volume<D> {
    fn list_path(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.list_folder(path)
    }

    fn list_entry(&self, entry: &DirEntry) -> Result<Vec<DirEntry>> {
        self.list_entry(entry)
    }

    fn file_content(&self, entry: &DirEntry) -> Result<Vec<u8>> {
        self.file_content(entry)
    }

    fn names_equal(&self, a: &str, b: &str) -> bool {
        names_equal(a, b)
    }
}

/// Destination for downloaded bytes.
pub trait FileSink {
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
}

/// [`FileSink`] writing through `std::fs`.
#[derive(Debug, Default, Copy, Clone)]
pub struct LocalFileSink;

impl FileSink for LocalFileSink {
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }
}

/// A directory child: either a subdirectory or a file.
pub enum Node<A> {
    Directory(Directory<A>),
    File(File<A>),
}

impl<A> Node<A> {
    fn new(adapter: Arc<A>, parent_path: &str, entry: DirEntry) -> Node<A> {
        if entry.is_directory {
            Node::Directory(Directory {
                adapter,
                path: join_path(parent_path, &entry.name),
                entry: Some(entry),
                cache: Arc::new(Mutex::new(None)),
            })
        } else {
            Node::File(File { adapter, entry })
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Directory(dir) => dir.name(),
            Node::File(file) => file.name(),
        }
    }
}

impl<A> Clone for Node<A> {
    fn clone(&self) -> Self {
        match self {
            Node::Directory(dir) => Node::Directory(dir.clone()),
            Node::File(file) => Node::File(file.clone()),
        }
    }
}

/// Handle on one directory of a volume, with a cached child list.
pub struct Directory<A> {
    adapter: Arc<A>,
    path: String,
    /// `None` for the root, which has no entry of its own.
    entry: Option<DirEntry>,
    cache: Arc<Mutex<Option<Vec<Node<A>>>>>,
}

impl<A> Clone for Directory<A> {
    fn clone(&self) -> Self {
        Directory {
            adapter: Arc::clone(&self.adapter),
            path: self.path.clone(),
            entry: self.entry.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<A> Directory<A> {
    /// The root directory of `adapter`.
    pub fn root(adapter: Arc<A>) -> Directory<A> {
        Directory {
            adapter,
            path: String::from("/"),
            entry: None,
            cache: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        self.entry.as_ref().map_or("/", |entry| entry.name.as_str())
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<A: FileSystemAdapter> Directory<A> {
    /// Children of this directory, served from cache after the first listing.
    pub fn list(&self) -> Result<Vec<Node<A>>> {
        if let Some(cached) = &*self.cache.lock().unwrap() {
            return Ok(cached.clone());
        }
        self.refresh()
    }

    /// Relists from the volume and replaces the cache.
    pub fn refresh(&self) -> Result<Vec<Node<A>>> {
        let entries = match &self.entry {
            Some(entry) => self.adapter.list_entry(entry)?,
            None => self.adapter.list_path(&self.path)?,
        };
        let nodes: Vec<Node<A>> = entries
            .into_iter()
            .map(|entry| Node::new(Arc::clone(&self.adapter), &self.path, entry))
            .collect();
        *self.cache.lock().unwrap() = Some(nodes.clone());
        Ok(nodes)
    }

    /// Looks up a subdirectory by name.
    pub fn get_directory(&self, name: &str) -> Result<Directory<A>> {
        self.list()?
            .into_iter()
            .find_map(|node| match node {
                Node::Directory(dir) if self.adapter.names_equal(dir.name(), name) => Some(dir),
                _ => None,
            })
            .ok_or_else(|| Error::DirectoryNotFound(name.to_string()))
    }

    /// Looks up a file by name.
    pub fn get_file(&self, name: &str) -> Result<File<A>> {
        self.list()?
            .into_iter()
            .find_map(|node| match node {
                Node::File(file) if self.adapter.names_equal(file.name(), name) => Some(file),
                _ => None,
            })
            .ok_or_else(|| Error::FileNotFound(name.to_string()))
    }
}

/// Handle on one file of a volume.
pub struct File<A> {
    adapter: Arc<A>,
    entry: DirEntry,
}

impl<A> Clone for File<A> {
    fn clone(&self) -> Self {
        File {
            adapter: Arc::clone(&self.adapter),
            entry: self.entry.clone(),
        }
    }
}

impl<A> File<A> {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn size(&self) -> u32 {
        self.entry.size
    }

    pub fn created(&self) -> Timestamp {
        self.entry.created
    }

    pub fn modified(&self) -> Timestamp {
        self.entry.modified
    }

    pub fn entry(&self) -> &DirEntry {
        &self.entry
    }
}

impl<A: FileSystemAdapter> File<A> {
    /// Fetches the whole file off the card.
    pub fn read_content(&self) -> Result<Vec<u8>> {
        self.adapter.file_content(&self.entry)
    }

    /// Fetches the file and hands it to `sink` under `local_path`.
    /// Returns the number of bytes written.
    pub fn download(&self, sink: &dyn FileSink, local_path: impl AsRef<Path>) -> Result<usize> {
        let content = self.read_content()?;
        sink.write_file(local_path.as_ref(), &content)?;
        log::info!(
            "downloaded {} ({} bytes) to {}",
            self.entry.name,
            content.len(),
            local_path.as_ref().display()
        );
        Ok(content.len())
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}
