//! Files to put in an archive, and where their contents come from
//!
//! An archive entry is either a [`LocalFile`] read from disk,
//! or a [`GeneratedFile`] whose contents come from a caller-provided
//! sequence of chunks (a generator, a network stream, ...).
//! Both are wrapped in a [`FileEntry`] before being handed to a
//! [`ZipStream`] or [`AsyncZipStream`].
//!
//! Contents are read exactly once, front to back, while the archive streams.
//!
//! [`ZipStream`]: ../write/struct.ZipStream.html
//! [`AsyncZipStream`]: ../write/struct.AsyncZipStream.html

use std::fmt;
use std::fs;
use std::io::{self, prelude::*};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local, NaiveDateTime};

#[cfg(feature = "async")]
use std::pin::Pin;

#[cfg(feature = "async")]
use futures::stream::{Stream, StreamExt};
#[cfg(feature = "async")]
use tokio::io::AsyncReadExt;

use crate::compressor::CompressionMethod;
use crate::result::*;

/// How many bytes a [`LocalFile`] reads at a time, unless told otherwise
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Chunks of a file's contents, produced on the calling thread.
pub type BlockingChunks = Box<dyn Iterator<Item = io::Result<Vec<u8>>> + Send>;

/// Chunks of a file's contents, produced asynchronously.
#[cfg(feature = "async")]
pub type AsyncChunks = Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send>>;

pub(crate) enum Chunks {
    Blocking(BlockingChunks),
    #[cfg(feature = "async")]
    Async(AsyncChunks),
}

/// A file on disk
///
/// Its size and modification time are looked up whenever they're asked for,
/// not when it's created.
/// If the file changes while the archive is streaming, expect a mess.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: Utf8PathBuf,
    name: String,
    compression_method: CompressionMethod,
    chunk_size: usize,
    /// Overrides the file's own mtime, if set
    last_modified: Option<NaiveDateTime>,
}

impl LocalFile {
    /// Archives the file at the given path, using the path as its name.
    pub fn new<P: Into<Utf8PathBuf>>(path: P) -> Self {
        let path = path.into();
        let name = path.to_string();
        Self {
            path,
            name,
            compression_method: CompressionMethod::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            last_modified: None,
        }
    }

    /// Stores the file under a different name in the archive.
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_compression(mut self, compression_method: CompressionMethod) -> Self {
        self.compression_method = compression_method;
        self
    }

    /// Reads the file `chunk_size` bytes at a time.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Stores the file with the given modification time
    /// instead of looking up its own.
    pub fn with_last_modified(mut self, last_modified: NaiveDateTime) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    #[cfg(feature = "async")]
    pub(crate) fn set_last_modified(&mut self, last_modified: NaiveDateTime) {
        self.last_modified = Some(last_modified);
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// True if the modification time must be read from the filesystem
    #[cfg(feature = "async")]
    pub(crate) fn needs_lookup(&self) -> bool {
        self.last_modified.is_none()
    }

    fn metadata(&self) -> ZipResult<fs::Metadata> {
        fs::metadata(&self.path).map_err(|source| ZipError::ResourceAccess {
            path: self.path.clone(),
            source,
        })
    }

    pub fn size(&self) -> ZipResult<u64> {
        Ok(self.metadata()?.len())
    }

    pub fn last_modified(&self) -> ZipResult<NaiveDateTime> {
        if let Some(t) = self.last_modified {
            return Ok(t);
        }
        modification_time(&self.path, self.metadata()?)
    }
}

fn modification_time(path: &Utf8Path, metadata: fs::Metadata) -> ZipResult<NaiveDateTime> {
    let modified = metadata
        .modified()
        .map_err(|source| ZipError::ResourceAccess {
            path: path.to_owned(),
            source,
        })?;
    Ok(DateTime::<Local>::from(modified).naive_local())
}

/// Looks up a file's modification time without blocking the thread.
#[cfg(feature = "async")]
pub(crate) async fn last_modified_async(path: &Utf8Path) -> ZipResult<NaiveDateTime> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|source| ZipError::ResourceAccess {
            path: path.to_owned(),
            source,
        })?;
    modification_time(path, metadata)
}

/// A file whose contents are produced by the caller, one chunk at a time
///
/// Since we can't know how big it is without reading it,
/// provide [`with_size()`](Self::with_size) if you want to know the
/// archive's size before streaming it.
pub struct GeneratedFile {
    name: String,
    chunks: Chunks,
    size: Option<u64>,
    last_modified: NaiveDateTime,
    compression_method: CompressionMethod,
}

impl GeneratedFile {
    /// Makes a file from chunks produced on the calling thread.
    ///
    /// ```
    /// # use zipfly::entry::GeneratedFile;
    /// let lines = (0..10).map(|i| Ok(format!("line {i}\n").into_bytes()));
    /// let file = GeneratedFile::new("lines.txt", lines);
    /// ```
    pub fn new<S, I>(name: S, chunks: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = io::Result<Vec<u8>>>,
        I::IntoIter: Send + 'static,
    {
        Self::from_chunks(name.into(), Chunks::Blocking(Box::new(chunks.into_iter())))
    }

    /// Makes a file from chunks produced asynchronously.
    ///
    /// These can only be archived with an [`AsyncZipStream`].
    ///
    /// [`AsyncZipStream`]: ../write/struct.AsyncZipStream.html
    #[cfg(feature = "async")]
    pub fn from_stream<S, St>(name: S, chunks: St) -> Self
    where
        S: Into<String>,
        St: Stream<Item = io::Result<Vec<u8>>> + Send + 'static,
    {
        Self::from_chunks(name.into(), Chunks::Async(Box::pin(chunks)))
    }

    fn from_chunks(name: String, chunks: Chunks) -> Self {
        Self {
            name,
            chunks,
            size: None,
            last_modified: Local::now().naive_local(),
            compression_method: CompressionMethod::default(),
        }
    }

    /// Declares how many bytes the chunks add up to.
    ///
    /// This is only used to estimate the archive's size;
    /// what's actually written is whatever the chunks turn out to be.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Sets the modification time (which is otherwise when this was created).
    pub fn with_last_modified(mut self, last_modified: NaiveDateTime) -> Self {
        self.last_modified = last_modified;
        self
    }

    pub fn with_compression(mut self, compression_method: CompressionMethod) -> Self {
        self.compression_method = compression_method;
        self
    }
}

impl fmt::Debug for GeneratedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("last_modified", &self.last_modified)
            .field("compression_method", &self.compression_method)
            .finish_non_exhaustive()
    }
}

/// A file to put in the archive
#[derive(Debug)]
pub enum FileEntry {
    Local(LocalFile),
    Generated(GeneratedFile),
}

impl FileEntry {
    /// The name the file is stored under
    pub fn name(&self) -> &str {
        match self {
            FileEntry::Local(f) => &f.name,
            FileEntry::Generated(f) => &f.name,
        }
    }

    /// Renames the file. Only meaningful before the archive starts streaming.
    pub fn set_name<S: Into<String>>(&mut self, name: S) {
        let name = name.into();
        match self {
            FileEntry::Local(f) => f.name = name,
            FileEntry::Generated(f) => f.name = name,
        }
    }

    /// The size of the file's contents, if it can be known before streaming them.
    pub fn size(&self) -> ZipResult<u64> {
        match self {
            FileEntry::Local(f) => f.size(),
            FileEntry::Generated(f) => f
                .size
                .ok_or_else(|| ZipError::UnknownSize(f.name.clone())),
        }
    }

    pub fn last_modified(&self) -> ZipResult<NaiveDateTime> {
        match self {
            FileEntry::Local(f) => f.last_modified(),
            FileEntry::Generated(f) => Ok(f.last_modified),
        }
    }

    pub fn compression_method(&self) -> CompressionMethod {
        match self {
            FileEntry::Local(f) => f.compression_method,
            FileEntry::Generated(f) => f.compression_method,
        }
    }

    /// Gives up the entry's contents for streaming.
    pub(crate) fn into_source(self) -> PayloadSource {
        match self {
            FileEntry::Local(f) => PayloadSource::File {
                path: f.path,
                chunk_size: f.chunk_size,
            },
            FileEntry::Generated(f) => PayloadSource::Chunks {
                name: f.name,
                chunks: f.chunks,
            },
        }
    }
}

impl From<LocalFile> for FileEntry {
    fn from(f: LocalFile) -> Self {
        FileEntry::Local(f)
    }
}

impl From<GeneratedFile> for FileEntry {
    fn from(f: GeneratedFile) -> Self {
        FileEntry::Generated(f)
    }
}

/// Where an entry's contents come from, before they're opened.
pub(crate) enum PayloadSource {
    File {
        path: Utf8PathBuf,
        chunk_size: usize,
    },
    Chunks {
        name: String,
        chunks: Chunks,
    },
}

/// An entry's contents, opened for blocking reads.
///
/// Files are closed when this is dropped,
/// whether or not they were read to the end.
pub(crate) enum BlockingPayload {
    File {
        file: fs::File,
        path: Utf8PathBuf,
        chunk_size: usize,
    },
    Chunks(BlockingChunks),
}

impl BlockingPayload {
    pub fn open(source: PayloadSource) -> ZipResult<Self> {
        match source {
            PayloadSource::File { path, chunk_size } => {
                let file = fs::File::open(&path)
                    .map_err(|source| ZipError::ResourceAccess {
                        path: path.clone(),
                        source,
                    })?;
                Ok(BlockingPayload::File {
                    file,
                    path,
                    chunk_size,
                })
            }
            PayloadSource::Chunks {
                chunks: Chunks::Blocking(chunks),
                ..
            } => Ok(BlockingPayload::Chunks(chunks)),
            #[cfg(feature = "async")]
            PayloadSource::Chunks {
                name,
                chunks: Chunks::Async(_),
            } => Err(ZipError::AsyncSource(name)),
        }
    }

    /// Returns the next chunk of contents, or `None` once they're exhausted.
    pub fn next_chunk(&mut self) -> ZipResult<Option<Vec<u8>>> {
        match self {
            BlockingPayload::File {
                file,
                path,
                chunk_size,
            } => {
                let mut chunk = Vec::with_capacity(*chunk_size);
                Read::take(&mut *file, *chunk_size as u64)
                    .read_to_end(&mut chunk)
                    .map_err(|source| ZipError::ResourceAccess {
                        path: path.clone(),
                        source,
                    })?;
                Ok(if chunk.is_empty() { None } else { Some(chunk) })
            }
            BlockingPayload::Chunks(chunks) => Ok(chunks.next().transpose()?),
        }
    }
}

/// An entry's contents, opened for async reads.
///
/// Blocking chunk iterators are allowed here too,
/// but they block the task while they produce each chunk.
#[cfg(feature = "async")]
pub(crate) enum AsyncPayload {
    File {
        file: tokio::fs::File,
        path: Utf8PathBuf,
        chunk_size: usize,
    },
    Blocking(BlockingChunks),
    Async(AsyncChunks),
}

#[cfg(feature = "async")]
impl AsyncPayload {
    pub async fn open(source: PayloadSource) -> ZipResult<Self> {
        match source {
            PayloadSource::File { path, chunk_size } => {
                let file = tokio::fs::File::open(&path).await.map_err(|source| {
                    ZipError::ResourceAccess {
                        path: path.clone(),
                        source,
                    }
                })?;
                Ok(AsyncPayload::File {
                    file,
                    path,
                    chunk_size,
                })
            }
            PayloadSource::Chunks { chunks, .. } => Ok(match chunks {
                Chunks::Blocking(chunks) => AsyncPayload::Blocking(chunks),
                Chunks::Async(chunks) => AsyncPayload::Async(chunks),
            }),
        }
    }

    /// Returns the next chunk of contents, or `None` once they're exhausted.
    pub async fn next_chunk(&mut self) -> ZipResult<Option<Vec<u8>>> {
        match self {
            AsyncPayload::File {
                file,
                path,
                chunk_size,
            } => {
                let mut chunk = Vec::with_capacity(*chunk_size);
                (&mut *file)
                    .take(*chunk_size as u64)
                    .read_to_end(&mut chunk)
                    .await
                    .map_err(|source| ZipError::ResourceAccess {
                        path: path.clone(),
                        source,
                    })?;
                Ok(if chunk.is_empty() { None } else { Some(chunk) })
            }
            AsyncPayload::Blocking(chunks) => Ok(chunks.next().transpose()?),
            AsyncPayload::Async(chunks) => Ok(chunks.next().await.transpose()?),
        }
    }
}
