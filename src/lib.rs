//! zipfly streams ZIP archives as they're made, one chunk at a time:
//!
//! ```no_run
//! # use std::fs::File;
//! # use std::io::Write;
//! # use zipfly::*;
//! let entries: Vec<FileEntry> = vec![
//!     LocalFile::new("photos/cat.jpg").into(),
//!     LocalFile::new("notes/todo.txt")
//!         .with_compression(CompressionMethod::Deflate)
//!         .into(),
//!     // Files don't have to exist on disk.
//!     GeneratedFile::new("hello.txt", vec![Ok(b"Hello, world!\n".to_vec())]).into(),
//! ];
//!
//! let mut out = File::create("archive.zip")?;
//! for chunk in ZipStream::new(entries) {
//!     out.write_all(&chunk?)?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Nothing is buffered beyond the chunk at hand, and nothing is ever seeked
//! back to, so chunks can go straight out over the network as they're made.
//! This is great for serving a download of a bunch of files
//! that have never been zipped together before.
//! (If you're a web server, the [`AsyncZipStream`] plays nicely with Tokio.)
//!
//! To pull this off, every archive is a Zip64 archive:
//! each file's CRC and sizes follow its contents in a data descriptor,
//! and the central directory at the end of the archive holds 64-bit
//! sizes and offsets.
//! Any reasonably modern unzip tool can read the results.
//!
//! Since file sizes are known up front (unless the file is generated),
//! the size of the archive can be computed before streaming it:
//!
//! ```no_run
//! # use zipfly::*;
//! let stream = ZipStream::new(vec![LocalFile::new("photos/cat.jpg")]);
//! // Handy for a Content-Length header
//! let size = stream.archive_size()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! This is exact for archives that don't compress anything.
//! Deflated files are counted at their uncompressed size,
//! which is _not_ an upper bound: deflate makes incompressible data
//! slightly bigger, so only trust the estimate as a `Content-Length`
//! when everything is stored.

pub mod compressor;
pub mod entry;
pub mod names;
pub mod result;
pub mod write;

pub use compressor::CompressionMethod;
pub use entry::{FileEntry, GeneratedFile, LocalFile};
pub use write::archive_size;
#[cfg(feature = "async")]
pub use write::AsyncZipStream;
pub use write::ZipStream;

mod spec;
