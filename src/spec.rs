//! Code specific to the ZIP file format specification.
//!
//! We try to keep the nitty gritty (the exact byte layout of each record) here,
//! and the bookkeeping of offsets and sizes in the [`write`] module.
//!
//! Everything we write is Zip64, always.
//! Since we don't know how big a file is until we've streamed it,
//! the 32-bit size and offset fields in the "legacy" records are saturated
//! placeholders, and the real 64-bit values live in trailing data descriptors
//! and Zip64 extra fields.
//!
//! Most comments quote the ZIP spec, [`APPNOTE.TXT`].
//!
//! [`write`]: ../write/index.html
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT

use chrono::{Datelike, NaiveDateTime, Timelike};
use log::*;

use crate::compressor::CompressionMethod;
use crate::result::*;

// Magic numbers denoting various sections of a ZIP archive

/// Local file header magic number
const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];
/// Data descriptor magic number
const DATA_DESCRIPTOR_MAGIC: [u8; 4] = [b'P', b'K', 7, 8];
/// Central directory magic number
const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Zip64 end of central directory magic number
const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Zip64 end of central directory locator magic number
const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];
/// End of central directory magic number
const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];

/// Header ID of the Zip64 extended information extra field
const ZIP64_EXTRA_FIELD_TAG: u16 = 0x0001;

/// Version 4.5: Zip64 format extensions.
/// The minimum version needed to extract anything we write.
pub const VERSION_NEEDED: u16 = 45;

/// The upper byte is zero (MS-DOS compatible attributes, which we leave blank),
/// and the lower byte is the spec version we follow.
pub const VERSION_MADE_BY: u16 = 45;

/// Bit 3: the CRC-32 and sizes are set to zero (or saturated, for us)
/// in the local header, and the correct values are put in the data descriptor
/// immediately following the compressed data.
pub const DATA_DESCRIPTOR_FLAG: u16 = 1 << 3;

/// Bit 11: Language encoding flag (EFS).  If this bit is set,
/// the filename and comment fields for this file
/// MUST be encoded using UTF-8.
pub const UTF8_FLAG: u16 = 1 << 11;

/// What we put in 32-bit fields to say "see the Zip64 record instead".
const ZIP64_PLACEHOLDER: u32 = u32::MAX;

impl CompressionMethod {
    pub(crate) fn as_u16(self) -> u16 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Deflate => 8,
        }
    }
}

/// Appends a little-endian u64 to the provided buffer.
fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Appends a little-endian u32 to the provided buffer.
fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Appends a little-endian u16 to the provided buffer.
fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Returns the bytes we store for a file name, along with any flags they need.
///
/// ASCII names are stored as-is.
/// Anything else is stored as UTF-8 and flagged as such,
/// since readers otherwise assume CP437.
pub fn encode_name(name: &str) -> ZipResult<(&[u8], u16)> {
    let bytes = name.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(ZipError::NameTooLong(name.to_owned(), bytes.len()));
    }
    let flags = if name.is_ascii() { 0 } else { UTF8_FLAG };
    Ok((bytes, flags))
}

/// Packs a timestamp into MS-DOS (time, date) fields.
///
/// MS-DOS can only represent 1980 through 2107 with 2-second precision,
/// so anything outside that range is clamped to the nearest end.
pub fn msdos_timestamp(datetime: &NaiveDateTime) -> (u16, u16) {
    let year = datetime.year();
    if year < 1980 {
        warn!("{datetime} predates MS-DOS timestamps; storing 1980-01-01 00:00:00");
        return (0, (1 << 5) | 1);
    }
    if year > 2107 {
        warn!("{datetime} is past the end of MS-DOS timestamps; storing 2107-12-31 23:59:58");
        return ((23 << 11) | (59 << 5) | 29, (127 << 9) | (12 << 5) | 31);
    }

    // MSDOS uses 2-second precision
    let time = (datetime.hour() << 11) | (datetime.minute() << 5) | (datetime.second() / 2);
    let date = (((year - 1980) as u32) << 9) | (datetime.month() << 5) | datetime.day();
    (time as u16, date as u16)
}

/// A local file header
///
/// Each file's contents are preceded by one of these.
/// Since we're streaming, we don't know the CRC or sizes yet,
/// so those are deferred to the data descriptor following the contents.
#[derive(Debug)]
pub struct LocalFileHeader<'a> {
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub path: &'a [u8],
}

impl LocalFileHeader<'_> {
    pub fn write(&self, out: &mut Vec<u8>) {
        // 4.3.7  Local file header:
        //
        // local file header signature     4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name (variable size)
        // extra field (variable size)
        out.extend_from_slice(&LOCAL_FILE_HEADER_MAGIC);
        write_u16(out, VERSION_NEEDED);
        write_u16(out, self.flags);
        write_u16(out, self.compression_method);
        write_u16(out, self.last_modified_time);
        write_u16(out, self.last_modified_date);
        write_u32(out, ZIP64_PLACEHOLDER);
        write_u32(out, ZIP64_PLACEHOLDER);
        write_u32(out, ZIP64_PLACEHOLDER);
        write_u16(out, self.path.len() as u16);
        write_u16(out, 0);
        out.extend_from_slice(self.path);
    }

    pub fn fixed_size_in_file() -> usize {
        30
    }
}

/// A Zip64 data descriptor, written after each file's contents
/// once we finally know its CRC and sizes.
#[derive(Debug)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl DataDescriptor {
    pub fn write(&self, out: &mut Vec<u8>) {
        // 4.3.9.1 This descriptor MUST exist if bit 3 of the general
        // purpose bit flag is set (see below).  It is byte aligned
        // and immediately follows the last byte of compressed data.
        //
        // 4.3.9.2 When compressing files, compressed and uncompressed sizes
        // SHOULD be stored in ZIP64 format (as 8 byte values) when a
        // file's size exceeds 0xFFFFFFFF.
        //
        //   [signature]                     4 bytes  (0x08074b50)
        //   crc-32                          4 bytes
        //   compressed size                 8 bytes
        //   uncompressed size               8 bytes
        out.extend_from_slice(&DATA_DESCRIPTOR_MAGIC);
        write_u32(out, self.crc32);
        write_u64(out, self.compressed_size);
        write_u64(out, self.uncompressed_size);
    }

    pub fn size_in_file() -> usize {
        24
    }
}

/// A central directory entry
///
/// Its sizes and header offset are placeholders;
/// the real values are in the [`Zip64ExtraField`] that follows it.
#[derive(Debug)]
pub struct CentralDirectoryEntry<'a> {
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub path: &'a [u8],
}

impl CentralDirectoryEntry<'_> {
    pub fn write(&self, out: &mut Vec<u8>) {
        // 4.3.12  Central directory structure:
        //
        //   central file header signature   4 bytes  (0x02014b50)
        //   version made by                 2 bytes
        //   version needed to extract       2 bytes
        //   general purpose bit flag        2 bytes
        //   compression method              2 bytes
        //   last mod file time              2 bytes
        //   last mod file date              2 bytes
        //   crc-32                          4 bytes
        //   compressed size                 4 bytes
        //   uncompressed size               4 bytes
        //   file name length                2 bytes
        //   extra field length              2 bytes
        //   file comment length             2 bytes
        //   disk number start               2 bytes
        //   internal file attributes        2 bytes
        //   external file attributes        4 bytes
        //   relative offset of local header 4 bytes
        //
        //   file name (variable size)
        //   extra field (variable size)
        //   file comment (variable size)
        out.extend_from_slice(&CENTRAL_DIRECTORY_MAGIC);
        write_u16(out, VERSION_MADE_BY);
        write_u16(out, VERSION_NEEDED);
        write_u16(out, self.flags);
        write_u16(out, self.compression_method);
        write_u16(out, self.last_modified_time);
        write_u16(out, self.last_modified_date);
        write_u32(out, self.crc32);
        write_u32(out, ZIP64_PLACEHOLDER);
        write_u32(out, ZIP64_PLACEHOLDER);
        write_u16(out, self.path.len() as u16);
        write_u16(out, Zip64ExtraField::size_in_file() as u16);
        write_u16(out, 0);
        write_u16(out, 0);
        write_u16(out, 0);
        write_u32(out, 0);
        write_u32(out, ZIP64_PLACEHOLDER);
        out.extend_from_slice(self.path);
    }

    pub fn fixed_size_in_file() -> usize {
        46
    }
}

/// The Zip64 extended information extra field,
/// appended to each central directory entry.
#[derive(Debug)]
pub struct Zip64ExtraField {
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub header_offset: u64,
}

impl Zip64ExtraField {
    pub fn write(&self, out: &mut Vec<u8>) {
        // 4.5.3 -Zip64 Extended Information Extra Field (0x0001):
        //
        //   Value      Size       Description
        //   -----      ----       -----------
        //   0x0001     2 bytes    Tag for this "extra" block type
        //   Size       2 bytes    Size of this "extra" block
        //   Original
        //   Size       8 bytes    Original uncompressed file size
        //   Compressed
        //   Size       8 bytes    Size of compressed data
        //   Relative Header
        //   Offset     8 bytes    Offset of local header record
        //   Disk Start
        //   Number     4 bytes    Number of the disk on which
        //                         this file starts
        //
        // The "Size" doesn't count the tag or itself.
        write_u16(out, ZIP64_EXTRA_FIELD_TAG);
        write_u16(out, (Self::size_in_file() - 4) as u16);
        write_u64(out, self.uncompressed_size);
        write_u64(out, self.compressed_size);
        write_u64(out, self.header_offset);
        write_u32(out, 0);
    }

    pub fn size_in_file() -> usize {
        32
    }
}

/// The Zip64 end of central directory record
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectory {
    pub entries: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
}

impl Zip64EndOfCentralDirectory {
    pub fn write(&self, out: &mut Vec<u8>) {
        // 4.3.14  Zip64 end of central directory record
        //
        // zip64 end of central dir
        // signature                       4 bytes  (0x06064b50)
        // size of zip64 end of central
        // directory record                8 bytes
        // version made by                 2 bytes
        // version needed to extract       2 bytes
        // number of this disk             4 bytes
        // number of the disk with the
        // start of the central directory  4 bytes
        // total number of entries in the
        // central directory on this disk  8 bytes
        // total number of entries in the
        // central directory               8 bytes
        // size of the central directory   8 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        8 bytes
        //
        // 4.3.14.1 The value stored into the "size of zip64 end of central
        // directory record" SHOULD be the size of the remaining
        // record and SHOULD NOT include the leading 12 bytes.
        out.extend_from_slice(&ZIP64_EOCDR_MAGIC);
        write_u64(out, (Self::size_in_file() - 12) as u64);
        write_u16(out, VERSION_MADE_BY);
        write_u16(out, VERSION_NEEDED);
        write_u32(out, 0);
        write_u32(out, 0);
        write_u64(out, self.entries);
        write_u64(out, self.entries);
        write_u64(out, self.central_directory_size);
        write_u64(out, self.central_directory_offset);
    }

    pub fn size_in_file() -> usize {
        56
    }
}

/// The Zip64 end of central directory locator,
/// pointing readers at the [`Zip64EndOfCentralDirectory`] right before it.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectoryLocator {
    pub zip64_eocdr_offset: u64,
}

impl Zip64EndOfCentralDirectoryLocator {
    pub fn write(&self, out: &mut Vec<u8>) {
        // 4.3.15 Zip64 end of central directory locator
        //
        // zip64 end of central dir locator
        // signature                       4 bytes  (0x07064b50)
        // number of the disk with the
        // start of the zip64 end of
        // central directory               4 bytes
        // relative offset of the zip64
        // end of central directory record 8 bytes
        // total number of disks           4 bytes
        out.extend_from_slice(&ZIP64_EOCDR_LOCATOR_MAGIC);
        write_u32(out, 0);
        write_u64(out, self.zip64_eocdr_offset);
        write_u32(out, 1);
    }

    pub fn size_in_file() -> usize {
        20
    }
}

/// The End of central directory record
///
/// We only write it because readers go looking for it first.
/// Everything interesting is in the Zip64 version.
#[derive(Debug)]
pub struct EndOfCentralDirectory {
    pub entries: u64,
}

impl EndOfCentralDirectory {
    pub fn write(&self, out: &mut Vec<u8>) {
        // 4.3.16  End of central directory record:
        //
        // end of central dir signature    4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // number of the disk with the
        // start of the central directory  2 bytes
        // total number of entries in
        // the central dir on this disk    2 bytes
        // total number of entries in
        // the central dir                 2 bytes
        // size of the central directory   4 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        4 bytes
        // zipfile comment length          2 bytes
        let entries = u16::try_from(self.entries).unwrap_or(u16::MAX);
        out.extend_from_slice(&EOCDR_MAGIC);
        write_u16(out, 0);
        write_u16(out, 0);
        write_u16(out, entries);
        write_u16(out, entries);
        write_u32(out, ZIP64_PLACEHOLDER);
        write_u32(out, ZIP64_PLACEHOLDER);
        write_u16(out, 0);
    }

    pub fn size_in_file() -> usize {
        22
    }
}
