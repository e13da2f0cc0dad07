//! Tools for writing a ZIP archive, one chunk at a time.
//!
//! To stream an archive, make a [`ZipStream`] (or an [`AsyncZipStream`])
//! from a list of [`FileEntry`]s and pull chunks out of it.
//! Write them, in order, to wherever the archive is going.
//!
//! Archives are written in a single forward pass:
//! each file gets a local header, its (possibly compressed) contents,
//! and a data descriptor with its CRC and sizes.
//! Then comes the central directory, pointing back at each local header,
//! and finally the Zip64 end of central directory structures.
//! Nothing is ever seeked back to and patched,
//! so the output can go straight into a socket.
//!
//! [`FileEntry`]: ../entry/enum.FileEntry.html

use std::collections::VecDeque;
use std::io;

#[cfg(feature = "async")]
use std::pin::Pin;
#[cfg(feature = "async")]
use std::task::{Context, Poll};

#[cfg(feature = "async")]
use futures::future::{BoxFuture, FutureExt};
#[cfg(feature = "async")]
use futures::stream::Stream;
use log::*;

use crate::compressor::{Compressor, EntryMetrics};
#[cfg(feature = "async")]
use crate::entry::{self, AsyncPayload};
use crate::entry::{BlockingPayload, FileEntry, PayloadSource};
use crate::result::*;
use crate::spec;

/// Computes how large the archive for the given entries will be,
/// without streaming it.
///
/// This assumes every file is stored, so it's exact for archives
/// that don't compress anything.
/// For deflated files it's only a guess: compressible contents come out
/// smaller, but incompressible ones (already-compressed media, random data)
/// come out a little _larger_ than they went in,
/// so the archive can exceed the estimate.
/// Don't send it as a `Content-Length` unless everything is stored.
///
/// Fails if any entry's size can't be known before streaming it.
/// Local files are stat'd on the calling thread.
pub fn archive_size<'a, I>(entries: I) -> ZipResult<u64>
where
    I: IntoIterator<Item = &'a FileEntry>,
{
    let mut total = (spec::Zip64EndOfCentralDirectory::size_in_file()
        + spec::Zip64EndOfCentralDirectoryLocator::size_in_file()
        + spec::EndOfCentralDirectory::size_in_file()) as u64;

    for entry in entries {
        let (path, _) = spec::encode_name(entry.name())?;
        let path_len = path.len() as u64;

        total += spec::LocalFileHeader::fixed_size_in_file() as u64 + path_len;
        total += entry.size()?;
        total += spec::DataDescriptor::size_in_file() as u64;
        total += spec::CentralDirectoryEntry::fixed_size_in_file() as u64
            + path_len
            + spec::Zip64ExtraField::size_in_file() as u64;
    }
    Ok(total)
}

/// What we know about an entry before streaming its contents
#[derive(Debug)]
struct EntryHeader {
    name: String,
    flags: u16,
    compression_method: u16,
    last_modified_time: u16,
    last_modified_date: u16,
}

impl EntryHeader {
    fn new(entry: &FileEntry) -> ZipResult<Self> {
        let (_, name_flags) = spec::encode_name(entry.name())?;
        let (last_modified_time, last_modified_date) =
            spec::msdos_timestamp(&entry.last_modified()?);
        Ok(Self {
            name: entry.name().to_owned(),
            flags: spec::DATA_DESCRIPTOR_FLAG | name_flags,
            compression_method: entry.compression_method().as_u16(),
            last_modified_time,
            last_modified_date,
        })
    }
}

/// An entry whose contents are streaming
struct CurrentEntry {
    header: EntryHeader,
    offset: u64,
    compressor: Compressor,
}

/// An entry that has been written, right through its data descriptor,
/// and is waiting for its central directory record.
#[derive(Debug)]
struct WrittenEntry {
    header: EntryHeader,
    offset: u64,
    metrics: EntryMetrics,
}

enum State {
    /// Starting the next file, or moving on to the central directory
    /// if there aren't any more
    Files,
    /// Streaming a file's contents
    Payload(CurrentEntry),
    CentralDirectory,
    EndStructures,
    Done,
}

/// What the stream driver should do next
pub(crate) enum Step {
    /// Hand this chunk to the caller.
    Emit(Vec<u8>),
    /// Open this entry's contents. They'll be asked for with `Pull`.
    Open(PayloadSource),
    /// Read the next chunk of the open entry, then `feed()` it
    /// (or call `end_of_payload()` if there's nothing left).
    Pull,
    Done,
}

/// Lays out the archive, one step at a time.
///
/// This does no I/O of its own: it tells its driver when it needs a file's
/// contents and which chunks to hand back out.
/// That way the blocking [`ZipStream`] and the [`AsyncZipStream`]
/// share all of the bookkeeping and can't disagree about the output.
pub(crate) struct Assembler {
    /// Files that haven't been started yet
    pending: VecDeque<FileEntry>,
    /// Files that have been written, in order
    written: VecDeque<WrittenEntry>,
    entry_count: u64,
    state: State,
    /// Chunks laid out but not yet handed to the driver
    output: VecDeque<Vec<u8>>,
    /// Bytes laid out so far
    offset: u64,
    central_directory_offset: u64,
    central_directory_size: u64,
}

impl Assembler {
    pub fn new(entries: Vec<FileEntry>) -> Self {
        let entry_count = entries.len() as u64;
        Self {
            pending: entries.into(),
            written: VecDeque::new(),
            entry_count,
            state: State::Files,
            output: VecDeque::new(),
            offset: 0,
            central_directory_offset: 0,
            central_directory_size: 0,
        }
    }

    /// Estimates the archive size. Only valid before anything has been laid out.
    pub fn archive_size(&self) -> ZipResult<u64> {
        if self.offset != 0 || !matches!(self.state, State::Files) {
            return Err(ZipError::AlreadyStreaming);
        }
        archive_size(&self.pending)
    }

    pub fn step(&mut self) -> ZipResult<Step> {
        loop {
            if let Some(chunk) = self.output.pop_front() {
                return Ok(Step::Emit(chunk));
            }
            match self.state {
                State::Files => match self.pending.pop_front() {
                    Some(entry) => return self.start_entry(entry).map(Step::Open),
                    None => {
                        self.central_directory_offset = self.offset;
                        debug!(
                            "Central directory starts at offset {}",
                            self.central_directory_offset
                        );
                        self.state = State::CentralDirectory;
                    }
                },
                State::Payload(_) => return Ok(Step::Pull),
                State::CentralDirectory => match self.written.pop_front() {
                    Some(entry) => self.write_central_directory_entry(entry),
                    None => self.state = State::EndStructures,
                },
                State::EndStructures => {
                    self.write_end_structures();
                    self.state = State::Done;
                }
                State::Done => return Ok(Step::Done),
            }
        }
    }

    /// The path of the next file to start, if its modification time
    /// still has to be read from disk.
    ///
    /// Drivers that can't block should look it up themselves
    /// and hand it over with [`resolve_pending()`](Self::resolve_pending)
    /// before the next `step()`.
    /// Otherwise `step()` stats the file on the calling thread.
    #[cfg(feature = "async")]
    pub fn pending_lookup(&self) -> Option<camino::Utf8PathBuf> {
        if !self.output.is_empty() || !matches!(self.state, State::Files) {
            return None;
        }
        match self.pending.front() {
            Some(FileEntry::Local(f)) if f.needs_lookup() => Some(f.path().to_owned()),
            _ => None,
        }
    }

    /// Sets the modification time of the next file to start.
    #[cfg(feature = "async")]
    pub fn resolve_pending(&mut self, last_modified: chrono::NaiveDateTime) {
        if let Some(FileEntry::Local(f)) = self.pending.front_mut() {
            f.set_last_modified(last_modified);
        }
    }

    /// Compresses a chunk of the current entry's contents.
    pub fn feed(&mut self, chunk: Vec<u8>) -> ZipResult<()> {
        let out = match &mut self.state {
            State::Payload(current) => current.compressor.process(chunk)?,
            _ => return Err(self.out_of_order()),
        };
        self.emit(out);
        Ok(())
    }

    /// Finishes the current entry once its contents run out,
    /// laying out the compressor's tail and the data descriptor.
    pub fn end_of_payload(&mut self) -> ZipResult<()> {
        let current = match std::mem::replace(&mut self.state, State::Files) {
            State::Payload(current) => current,
            other => {
                self.state = other;
                return Err(self.out_of_order());
            }
        };
        let CurrentEntry {
            header,
            offset,
            compressor,
        } = current;

        let (tail, metrics) = compressor.finish()?;
        self.emit(tail);

        let descriptor = spec::DataDescriptor {
            crc32: metrics.crc32,
            compressed_size: metrics.compressed_size,
            uncompressed_size: metrics.uncompressed_size,
        };
        trace!("{:?}", descriptor);
        let mut chunk = Vec::with_capacity(spec::DataDescriptor::size_in_file());
        descriptor.write(&mut chunk);
        self.emit(chunk);

        debug!(
            "Finished {}: {} bytes, {} compressed, CRC {:08x}",
            header.name, metrics.uncompressed_size, metrics.compressed_size, metrics.crc32
        );
        self.written.push_back(WrittenEntry {
            header,
            offset,
            metrics,
        });
        Ok(())
    }

    /// Name of the entry whose contents are streaming, if there is one
    pub fn current_name(&self) -> Option<&str> {
        match &self.state {
            State::Payload(current) => Some(&current.header.name),
            _ => None,
        }
    }

    fn out_of_order(&self) -> ZipError {
        let name = self
            .current_name()
            .or_else(|| self.written.back().map(|w| w.header.name.as_str()))
            .unwrap_or_default();
        ZipError::DescriptorNotWritten(name.to_owned())
    }

    /// Lays out a chunk, advancing the offset past it.
    fn emit(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.offset += chunk.len() as u64;
        self.output.push_back(chunk);
    }

    fn start_entry(&mut self, entry: FileEntry) -> ZipResult<PayloadSource> {
        let header = EntryHeader::new(&entry)?;
        let offset = self.offset;
        debug!("Starting {} at offset {}", header.name, offset);

        let local_header = spec::LocalFileHeader {
            flags: header.flags,
            compression_method: header.compression_method,
            last_modified_time: header.last_modified_time,
            last_modified_date: header.last_modified_date,
            path: header.name.as_bytes(),
        };
        trace!("{:?}", local_header);
        let mut chunk =
            Vec::with_capacity(spec::LocalFileHeader::fixed_size_in_file() + header.name.len());
        local_header.write(&mut chunk);
        self.emit(chunk);

        let compressor = Compressor::new(entry.compression_method());
        self.state = State::Payload(CurrentEntry {
            header,
            offset,
            compressor,
        });
        Ok(entry.into_source())
    }

    fn write_central_directory_entry(&mut self, entry: WrittenEntry) {
        let WrittenEntry {
            header,
            offset,
            metrics,
        } = entry;

        let record = spec::CentralDirectoryEntry {
            flags: header.flags,
            compression_method: header.compression_method,
            last_modified_time: header.last_modified_time,
            last_modified_date: header.last_modified_date,
            crc32: metrics.crc32,
            path: header.name.as_bytes(),
        };
        let extra = spec::Zip64ExtraField {
            uncompressed_size: metrics.uncompressed_size,
            compressed_size: metrics.compressed_size,
            header_offset: offset,
        };
        trace!("{:?}", record);
        trace!("{:?}", extra);

        let mut chunk = Vec::with_capacity(
            spec::CentralDirectoryEntry::fixed_size_in_file()
                + header.name.len()
                + spec::Zip64ExtraField::size_in_file(),
        );
        record.write(&mut chunk);
        extra.write(&mut chunk);
        self.central_directory_size += chunk.len() as u64;
        self.emit(chunk);
    }

    fn write_end_structures(&mut self) {
        let zip64_eocdr = spec::Zip64EndOfCentralDirectory {
            entries: self.entry_count,
            central_directory_size: self.central_directory_size,
            central_directory_offset: self.central_directory_offset,
        };
        trace!("{:?}", zip64_eocdr);
        let zip64_eocdr_offset = self.offset;
        let mut chunk = Vec::with_capacity(spec::Zip64EndOfCentralDirectory::size_in_file());
        zip64_eocdr.write(&mut chunk);
        self.emit(chunk);

        let locator = spec::Zip64EndOfCentralDirectoryLocator { zip64_eocdr_offset };
        trace!("{:?}", locator);
        let mut chunk = Vec::with_capacity(spec::Zip64EndOfCentralDirectoryLocator::size_in_file());
        locator.write(&mut chunk);
        self.emit(chunk);

        let eocdr = spec::EndOfCentralDirectory {
            entries: self.entry_count,
        };
        trace!("{:?}", eocdr);
        let mut chunk = Vec::with_capacity(spec::EndOfCentralDirectory::size_in_file());
        eocdr.write(&mut chunk);
        self.emit(chunk);

        debug!(
            "Archive of {} entries is {} bytes",
            self.entry_count, self.offset
        );
    }

    /// The error for a driver that says "pull" with nothing open
    fn missing_payload(&self) -> ZipError {
        ZipError::DescriptorNotWritten(self.current_name().unwrap_or_default().to_owned())
    }
}

/// A ZIP archive, streamed out as an iterator of byte chunks
///
/// ```no_run
/// # use std::fs::File;
/// # use std::io::Write;
/// # use zipfly::*;
/// let entries = vec![
///     FileEntry::from(LocalFile::new("hello/hi.txt")),
///     FileEntry::from(LocalFile::new("hello/sr71.txt").with_compression(CompressionMethod::Deflate)),
/// ];
/// let stream = ZipStream::new(entries);
/// println!("At most {} bytes", stream.archive_size()?);
///
/// let mut out = File::create("hello.zip")?;
/// for chunk in stream {
///     out.write_all(&chunk?)?;
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// File contents are read as they're needed, on the calling thread.
/// Once an error is returned, the stream ends;
/// what was already written isn't a valid archive.
pub struct ZipStream {
    assembler: Assembler,
    payload: Option<BlockingPayload>,
    finished: bool,
}

impl ZipStream {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<FileEntry>,
    {
        Self {
            assembler: Assembler::new(entries.into_iter().map(Into::into).collect()),
            payload: None,
            finished: false,
        }
    }

    /// Computes the archive's size without streaming it. See [`archive_size()`].
    ///
    /// Must be called before streaming starts.
    pub fn archive_size(&self) -> ZipResult<u64> {
        self.assembler.archive_size()
    }

    /// Streams the whole archive into the given writer,
    /// returning the number of bytes written.
    pub fn write_to<W: io::Write>(self, mut out: W) -> ZipResult<u64> {
        let mut written = 0;
        for chunk in self {
            let chunk = chunk?;
            out.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        out.flush()?;
        Ok(written)
    }

    fn next_chunk(&mut self) -> ZipResult<Option<Vec<u8>>> {
        loop {
            match self.assembler.step()? {
                Step::Emit(chunk) => return Ok(Some(chunk)),
                Step::Open(source) => self.payload = Some(BlockingPayload::open(source)?),
                Step::Pull => {
                    let payload = match self.payload.as_mut() {
                        Some(p) => p,
                        None => return Err(self.assembler.missing_payload()),
                    };
                    match payload.next_chunk()? {
                        Some(chunk) => self.assembler.feed(chunk)?,
                        None => {
                            // Close the file before moving on.
                            self.payload = None;
                            self.assembler.end_of_payload()?;
                        }
                    }
                }
                Step::Done => return Ok(None),
            }
        }
    }
}

impl Iterator for ZipStream {
    type Item = ZipResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                self.payload = None;
                Some(Err(e))
            }
        }
    }
}

#[cfg(feature = "async")]
struct AsyncDriver {
    assembler: Assembler,
    payload: Option<AsyncPayload>,
}

#[cfg(feature = "async")]
impl AsyncDriver {
    async fn next_chunk(&mut self) -> ZipResult<Option<Vec<u8>>> {
        loop {
            if let Some(path) = self.assembler.pending_lookup() {
                let last_modified = entry::last_modified_async(&path).await?;
                self.assembler.resolve_pending(last_modified);
            }
            match self.assembler.step()? {
                Step::Emit(chunk) => return Ok(Some(chunk)),
                Step::Open(source) => self.payload = Some(AsyncPayload::open(source).await?),
                Step::Pull => {
                    let payload = match self.payload.as_mut() {
                        Some(p) => p,
                        None => return Err(self.assembler.missing_payload()),
                    };
                    match payload.next_chunk().await? {
                        Some(chunk) => self.assembler.feed(chunk)?,
                        None => {
                            self.payload = None;
                            self.assembler.end_of_payload()?;
                        }
                    }
                }
                Step::Done => return Ok(None),
            }
        }
    }
}

#[cfg(feature = "async")]
type InFlight = BoxFuture<'static, (AsyncDriver, ZipResult<Option<Vec<u8>>>)>;

/// A ZIP archive, streamed out as a [`Stream`] of byte chunks
///
/// This lays out exactly the same bytes as a [`ZipStream`],
/// but reads (and stats) files with Tokio and can archive [`GeneratedFile`]s
/// made from async streams.
/// The exception is [`archive_size()`](Self::archive_size),
/// which stats local files on the calling thread.
///
/// ```no_run
/// # use futures::StreamExt;
/// # use tokio::io::AsyncWriteExt;
/// # use zipfly::*;
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut stream = AsyncZipStream::new(vec![LocalFile::new("hello/hi.txt")]);
/// let mut out = tokio::fs::File::create("hello.zip").await?;
/// while let Some(chunk) = stream.next().await {
///     out.write_all(&chunk?).await?;
/// }
/// # Ok(())
/// # }
/// ```
///
/// [`GeneratedFile`]: ../entry/struct.GeneratedFile.html
#[cfg(feature = "async")]
pub struct AsyncZipStream {
    /// `None` while a chunk is in flight or once the stream ends
    driver: Option<AsyncDriver>,
    in_flight: Option<InFlight>,
}

#[cfg(feature = "async")]
impl AsyncZipStream {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<FileEntry>,
    {
        Self {
            driver: Some(AsyncDriver {
                assembler: Assembler::new(entries.into_iter().map(Into::into).collect()),
                payload: None,
            }),
            in_flight: None,
        }
    }

    /// Computes the archive's size without streaming it. See [`archive_size()`].
    ///
    /// Must be called before streaming starts.
    pub fn archive_size(&self) -> ZipResult<u64> {
        match &self.driver {
            Some(driver) => driver.assembler.archive_size(),
            None => Err(ZipError::AlreadyStreaming),
        }
    }

    /// Streams the whole archive into the given writer,
    /// returning the number of bytes written.
    pub async fn write_to<W>(mut self, mut out: W) -> ZipResult<u64>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let mut written = 0;
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(written)
    }
}

#[cfg(feature = "async")]
impl Stream for AsyncZipStream {
    type Item = ZipResult<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.in_flight.is_none() {
            let mut driver = match this.driver.take() {
                Some(d) => d,
                None => return Poll::Ready(None),
            };
            this.in_flight = Some(
                async move {
                    let next = driver.next_chunk().await;
                    (driver, next)
                }
                .boxed(),
            );
        }

        let (driver, next) = match this.in_flight.as_mut() {
            Some(in_flight) => futures::ready!(in_flight.as_mut().poll(cx)),
            None => return Poll::Ready(None),
        };
        this.in_flight = None;
        match next {
            Ok(Some(chunk)) => {
                this.driver = Some(driver);
                Poll::Ready(Some(Ok(chunk)))
            }
            // Dropping the driver closes anything it had open,
            // and ends the stream.
            Ok(None) => Poll::Ready(None),
            Err(e) => Poll::Ready(Some(Err(e))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compressor::CompressionMethod;
    use crate::entry::{GeneratedFile, LocalFile};

    use std::fs;
    use std::sync::Arc;

    use camino::Utf8PathBuf;
    use chrono::NaiveDate;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    fn u16_at(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())
    }

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn u64_at(bytes: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    fn generated(name: &str, chunks: &[&str]) -> FileEntry {
        let chunks: Vec<io::Result<Vec<u8>>> =
            chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        let when = NaiveDate::from_ymd_opt(2024, 5, 6)
            .unwrap()
            .and_hms_opt(7, 8, 10)
            .unwrap();
        GeneratedFile::new(name, chunks)
            .with_last_modified(when)
            .into()
    }

    /// Streams the archive, checking that the assembler's offset
    /// agrees with what actually came out.
    fn stream_all(entries: Vec<FileEntry>) -> Vec<u8> {
        let mut stream = ZipStream::new(entries);
        let mut archive = Vec::new();
        for chunk in stream.by_ref() {
            let chunk = chunk.unwrap();
            assert!(!chunk.is_empty());
            archive.extend(chunk);
        }
        assert_eq!(stream.assembler.offset, archive.len() as u64);
        archive
    }

    #[test]
    fn test_empty_archive() {
        let archive = stream_all(vec![]);
        assert_eq!(archive.len(), 56 + 20 + 22);
        assert_eq!(archive_size(&[] as &[FileEntry]).unwrap(), 56 + 20 + 22);

        // The locator points at the Zip64 EOCDR, at the very start.
        assert_eq!(u64_at(&archive, 56 + 8), 0);
    }

    #[test]
    fn test_two_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        fs::write(root.join("empty"), b"").unwrap();
        fs::write(root.join("five"), b"hello").unwrap();

        let first = LocalFile::new(root.join("empty")).with_name("empty");
        let second = LocalFile::new(root.join("five")).with_name("five");
        let entries: Vec<FileEntry> = vec![first.into(), second.into()];
        let estimate = archive_size(&entries).unwrap();

        let archive = stream_all(entries);
        assert_eq!(estimate, archive.len() as u64);

        // First local header at the start, second one right after
        // the first's header and descriptor.
        assert_eq!(archive[..4], *b"PK\x03\x04");
        let second_offset = 30 + "empty".len() + 24;
        assert_eq!(archive[second_offset..second_offset + 4], *b"PK\x03\x04");

        // Its descriptor follows its five bytes of contents.
        let descriptor = second_offset + 30 + "five".len() + 5;
        assert_eq!(archive[descriptor..descriptor + 4], *b"PK\x07\x08");
        assert_eq!(u32_at(&archive, descriptor + 4), crc32fast::hash(b"hello"));
        assert_eq!(u64_at(&archive, descriptor + 8), 5);
        assert_eq!(u64_at(&archive, descriptor + 16), 5);

        // The legacy EOCDR is all placeholders...
        let eocdr = archive.len() - 22;
        assert_eq!(archive[eocdr..eocdr + 4], *b"PK\x05\x06");
        assert_eq!(u32_at(&archive, eocdr + 12), 0xFFFF_FFFF);
        assert_eq!(u32_at(&archive, eocdr + 16), 0xFFFF_FFFF);

        // ...and the Zip64 one knows where the central directory really is.
        let central_directory = descriptor + 24;
        let zip64_eocdr = eocdr - 20 - 56;
        assert_eq!(archive[zip64_eocdr..zip64_eocdr + 4], *b"PK\x06\x06");
        assert_eq!(
            u64_at(&archive, zip64_eocdr + 40),
            (zip64_eocdr - central_directory) as u64
        );
        assert_eq!(u64_at(&archive, zip64_eocdr + 48), central_directory as u64);
        assert_eq!(u64_at(&archive, eocdr - 20 + 8), zip64_eocdr as u64);

        // The second central directory record's extra field holds its offset.
        let second_record = central_directory + 46 + "empty".len() + 32;
        assert_eq!(archive[second_record..second_record + 4], *b"PK\x01\x02");
        let extra = second_record + 46 + "five".len();
        assert_eq!(u64_at(&archive, extra + 4), 5);
        assert_eq!(u64_at(&archive, extra + 12), 5);
        assert_eq!(u64_at(&archive, extra + 20), second_offset as u64);
    }

    #[test]
    fn test_declared_size_is_advisory() {
        let chunks = vec![Ok(vec![b'x'; 40]), Ok(vec![b'x'; 40])];
        let entry = GeneratedFile::new("short", chunks).with_size(100);
        let stream = ZipStream::new(vec![entry]);
        let estimate = stream.archive_size().unwrap();

        let archive: Vec<u8> = stream.map(Result::unwrap).flatten().collect();
        // We were told 100 bytes but only got 80.
        assert_eq!(estimate, archive.len() as u64 + 20);

        let descriptor = 30 + "short".len() + 80;
        assert_eq!(archive[descriptor..descriptor + 4], *b"PK\x07\x08");
        assert_eq!(u64_at(&archive, descriptor + 8), 80);
        assert_eq!(u64_at(&archive, descriptor + 16), 80);
    }

    #[test]
    fn test_estimate_overshoots_compressible_deflate() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("zeros")).unwrap();
        fs::write(&path, vec![0u8; 100_000]).unwrap();

        let entries = vec![FileEntry::from(
            LocalFile::new(path).with_compression(CompressionMethod::Deflate),
        )];
        let estimate = archive_size(&entries).unwrap();
        let archive = stream_all(entries);
        assert!((archive.len() as u64) < estimate);
    }

    #[test]
    fn test_estimate_undershoots_incompressible_deflate() {
        let mut noise = vec![0u8; 1_000_000];
        StdRng::seed_from_u64(0x5eed).fill_bytes(&mut noise);

        let chunks: Vec<io::Result<Vec<u8>>> =
            noise.chunks(4096).map(|c| Ok(c.to_vec())).collect();
        let entry = GeneratedFile::new("noise.bin", chunks)
            .with_size(noise.len() as u64)
            .with_compression(CompressionMethod::Deflate);
        let stream = ZipStream::new(vec![entry]);
        let estimate = stream.archive_size().unwrap();

        // Deflate can't shrink random bytes, and its block headers
        // push the archive past the estimate.
        let archive: Vec<u8> = stream.map(Result::unwrap).flatten().collect();
        assert!(
            archive.len() as u64 > estimate,
            "{} bytes written, {} estimated",
            archive.len(),
            estimate
        );

        let descriptor = archive.len() - 22 - 20 - 56 - (46 + 9 + 32) - 24;
        assert_eq!(archive[descriptor..descriptor + 4], *b"PK\x07\x08");
        assert_eq!(u64_at(&archive, descriptor + 16), noise.len() as u64);
        assert!(u64_at(&archive, descriptor + 8) > noise.len() as u64);
    }

    #[test]
    fn test_unknown_size() {
        let stream = ZipStream::new(vec![generated("mystery", &["?"])]);
        match stream.archive_size() {
            Err(ZipError::UnknownSize(name)) => assert_eq!(name, "mystery"),
            other => panic!("Expected UnknownSize, got {:?}", other),
        }
        // It still streams just fine.
        assert!(stream.map(Result::unwrap).count() > 0);
    }

    #[test]
    fn test_no_estimates_after_starting() {
        let mut stream = ZipStream::new(vec![generated("a", &["a"])]);
        stream.next().unwrap().unwrap();
        assert!(matches!(
            stream.archive_size(),
            Err(ZipError::AlreadyStreaming)
        ));
    }

    #[test]
    fn test_errors_end_the_stream() {
        let chunks = vec![
            Ok(b"some".to_vec()),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "source went away")),
            Ok(b"never".to_vec()),
        ];
        let entries = vec![
            FileEntry::from(GeneratedFile::new("flaky", chunks)),
            generated("after", &["unreached"]),
        ];
        let mut stream = ZipStream::new(entries);

        // Header, then "some"
        assert!(stream.next().unwrap().is_ok());
        assert_eq!(stream.next().unwrap().unwrap(), b"some");
        match stream.next() {
            Some(Err(ZipError::Io(e))) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("Expected an I/O error, got {:?}", other),
        }
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_missing_file_surfaces_mid_stream() {
        let entries = vec![
            generated("first", &["fine"]),
            FileEntry::from(LocalFile::new("no/such/file")),
        ];
        let results: Vec<_> = ZipStream::new(entries).collect();
        let (last, chunks) = results.split_last().unwrap();
        assert!(chunks.iter().all(Result::is_ok));
        assert!(matches!(last, Err(ZipError::ResourceAccess { .. })));
    }

    #[test]
    fn test_dropping_the_stream_releases_the_source() {
        let token = Arc::new(());
        let held = token.clone();
        let chunks = (0..100).map(move |_| {
            let _ = &held;
            Ok(vec![b'z'; 10])
        });
        let mut stream = ZipStream::new(vec![GeneratedFile::new("endless", chunks)]);

        stream.next().unwrap().unwrap();
        stream.next().unwrap().unwrap();
        assert_eq!(Arc::strong_count(&token), 2);
        drop(stream);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[cfg(feature = "async")]
    #[test]
    fn test_timestamps_can_be_looked_up_by_the_driver() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("stamped")).unwrap();
        fs::write(&path, b"tick").unwrap();
        let when = NaiveDate::from_ymd_opt(2001, 2, 3)
            .unwrap()
            .and_hms_opt(4, 5, 6)
            .unwrap();

        let mut assembler = Assembler::new(vec![
            LocalFile::new(path.clone()).into(),
            generated("gen", &["x"]),
        ]);
        assert_eq!(assembler.pending_lookup(), Some(path));
        assembler.resolve_pending(when);
        assert_eq!(assembler.pending_lookup(), None);

        assert!(matches!(assembler.step().unwrap(), Step::Open(_)));
        let header = match assembler.step().unwrap() {
            Step::Emit(chunk) => chunk,
            _ => panic!("Expected the local header"),
        };
        let (time, date) = spec::msdos_timestamp(&when);
        assert_eq!(u16_at(&header, 10), time);
        assert_eq!(u16_at(&header, 12), date);

        // Nothing to look up mid-file, or for generated files.
        assert!(matches!(assembler.step().unwrap(), Step::Pull));
        assert_eq!(assembler.pending_lookup(), None);
        assembler.feed(b"tick".to_vec()).unwrap();
        assembler.end_of_payload().unwrap();
        while let Step::Emit(_) = assembler.step().unwrap() {}
        assert_eq!(assembler.pending_lookup(), None);
    }

    #[test]
    fn test_feeding_out_of_order() {
        let mut assembler = Assembler::new(vec![]);
        assert!(matches!(
            assembler.feed(b"nope".to_vec()),
            Err(ZipError::DescriptorNotWritten(_))
        ));
        assert!(matches!(
            assembler.end_of_payload(),
            Err(ZipError::DescriptorNotWritten(_))
        ));
    }

    #[test]
    fn test_offsets_add_up() {
        let mut assembler = Assembler::new(vec![
            generated("one", &["1"]),
            generated("two", &["22", "22"]),
        ]);
        let mut emitted = 0u64;
        let mut header_offsets = Vec::new();
        let mut last_chunk_len = 0;
        loop {
            match assembler.step().unwrap() {
                Step::Emit(chunk) => {
                    if chunk.starts_with(b"PK\x03\x04") {
                        header_offsets.push(emitted);
                    }
                    emitted += chunk.len() as u64;
                    last_chunk_len = chunk.len();
                }
                Step::Open(_) => {}
                Step::Pull => match assembler.current_name().map(str::to_owned).as_deref() {
                    Some("one") if assembler.offset == 30 + 3 => {
                        assembler.feed(b"1".to_vec()).unwrap()
                    }
                    Some("two") if assembler.offset == 30 + 3 + 1 + 24 + 30 + 3 => {
                        assembler.feed(b"2222".to_vec()).unwrap()
                    }
                    _ => assembler.end_of_payload().unwrap(),
                },
                Step::Done => break,
            }
        }
        assert_eq!(header_offsets, vec![0, 30 + 3 + 1 + 24]);
        assert_eq!(emitted, assembler.offset);
        assert_eq!(last_chunk_len, 22);
        assert_eq!(assembler.central_directory_offset, 2 * (30 + 3 + 24) + 1 + 4);
        assert_eq!(assembler.central_directory_size, 2 * (46 + 3 + 32));
    }
}
