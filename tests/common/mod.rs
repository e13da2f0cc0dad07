//! Just enough of a Zip64 reader to check what we wrote.
//!
//! Everything is found through the central directory,
//! the way a real unzip tool would,
//! then checked against the local headers and data descriptors.

#![allow(dead_code)]

use std::convert::TryInto;
use std::io::prelude::*;

use anyhow::{ensure, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use flate2::read::DeflateDecoder;

const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];
const DATA_DESCRIPTOR_MAGIC: [u8; 4] = [b'P', b'K', 7, 8];
const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];
const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];

const PLACEHOLDER: u32 = u32::MAX;

/// A file read back out of an archive
#[derive(Debug)]
pub struct Entry {
    pub name: String,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified: NaiveDateTime,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub header_offset: u64,
    pub contents: Vec<u8>,
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

fn parse_msdos(time: u16, date: u16) -> Result<NaiveDateTime> {
    let seconds = (time & 0b0000_0000_0001_1111) as u32 * 2;
    let minutes = ((time & 0b0000_0111_1110_0000) >> 5) as u32;
    let hours = ((time & 0b1111_1000_0000_0000) >> 11) as u32;
    let days = (date & 0b0000_0000_0001_1111) as u32;
    let months = ((date & 0b0000_0001_1110_0000) >> 5) as u32;
    let years = ((date & 0b1111_1110_0000_0000) >> 9) as i32 + 1980;
    NaiveDate::from_ymd_opt(years, months, days)
        .and_then(|d| d.and_hms_opt(hours, minutes, seconds))
        .with_context(|| format!("Invalid MS-DOS timestamp {:04x} {:04x}", time, date))
}

/// Reads every entry out of the archive, checking the records as we go.
pub fn read_archive(archive: &[u8]) -> Result<Vec<Entry>> {
    ensure!(archive.len() >= 22 + 20 + 56, "Archive is too short");

    // End of central directory record: all placeholders
    let eocdr = archive.len() - 22;
    ensure!(archive[eocdr..eocdr + 4] == EOCDR_MAGIC, "No EOCDR");
    let legacy_entries = read_u16(archive, eocdr + 10);
    ensure!(read_u32(archive, eocdr + 12) == PLACEHOLDER);
    ensure!(read_u32(archive, eocdr + 16) == PLACEHOLDER);
    ensure!(read_u16(archive, eocdr + 20) == 0, "Unexpected comment");

    // Zip64 locator, right before it
    let locator = eocdr - 20;
    ensure!(
        archive[locator..locator + 4] == ZIP64_EOCDR_LOCATOR_MAGIC,
        "No Zip64 EOCDR locator"
    );
    let zip64_eocdr = read_u64(archive, locator + 8) as usize;
    ensure!(read_u32(archive, locator + 16) == 1, "Expected one disk");
    ensure!(
        zip64_eocdr + 56 == locator,
        "Zip64 EOCDR isn't right before its locator"
    );

    // Zip64 end of central directory record
    ensure!(
        archive[zip64_eocdr..zip64_eocdr + 4] == ZIP64_EOCDR_MAGIC,
        "No Zip64 EOCDR"
    );
    ensure!(read_u64(archive, zip64_eocdr + 4) == 44);
    ensure!(read_u16(archive, zip64_eocdr + 14) == 45);
    let entry_count = read_u64(archive, zip64_eocdr + 32);
    ensure!(read_u64(archive, zip64_eocdr + 24) == entry_count);
    ensure!(legacy_entries as u64 == entry_count.min(0xFFFF));
    let central_directory_size = read_u64(archive, zip64_eocdr + 40) as usize;
    let central_directory_offset = read_u64(archive, zip64_eocdr + 48) as usize;
    ensure!(
        central_directory_offset + central_directory_size == zip64_eocdr,
        "Central directory doesn't end at the Zip64 EOCDR"
    );

    let mut entries = Vec::with_capacity(entry_count as usize);
    let mut at = central_directory_offset;
    for _ in 0..entry_count {
        let (entry, next) = read_central_directory_entry(archive, at)?;
        entries.push(entry);
        at = next;
    }
    ensure!(at == zip64_eocdr, "Leftover bytes in central directory");
    Ok(entries)
}

fn read_central_directory_entry(archive: &[u8], at: usize) -> Result<(Entry, usize)> {
    ensure!(
        archive[at..at + 4] == CENTRAL_DIRECTORY_MAGIC,
        "No central directory entry at {}",
        at
    );
    ensure!(read_u16(archive, at + 6) == 45, "Bad version needed");
    let flags = read_u16(archive, at + 8);
    let compression_method = read_u16(archive, at + 10);
    let time = read_u16(archive, at + 12);
    let date = read_u16(archive, at + 14);
    let crc32 = read_u32(archive, at + 16);
    ensure!(read_u32(archive, at + 20) == PLACEHOLDER);
    ensure!(read_u32(archive, at + 24) == PLACEHOLDER);
    let name_len = read_u16(archive, at + 28) as usize;
    let extra_len = read_u16(archive, at + 30) as usize;
    ensure!(extra_len == 32, "Expected a Zip64 extra field");
    ensure!(read_u16(archive, at + 32) == 0, "Unexpected comment");
    ensure!(read_u32(archive, at + 42) == PLACEHOLDER);

    let name_bytes = &archive[at + 46..at + 46 + name_len];
    let name = String::from_utf8(name_bytes.to_vec()).context("Name isn't UTF-8")?;

    let extra = at + 46 + name_len;
    ensure!(read_u16(archive, extra) == 0x0001, "Not a Zip64 extra field");
    ensure!(read_u16(archive, extra + 2) == 28);
    let uncompressed_size = read_u64(archive, extra + 4);
    let compressed_size = read_u64(archive, extra + 12);
    let header_offset = read_u64(archive, extra + 20);
    ensure!(read_u32(archive, extra + 28) == 0);

    // Local header
    let header = header_offset as usize;
    ensure!(
        archive[header..header + 4] == LOCAL_FILE_HEADER_MAGIC,
        "No local header for {} at {}",
        name,
        header
    );
    ensure!(read_u16(archive, header + 6) == flags);
    ensure!(read_u16(archive, header + 8) == compression_method);
    ensure!(read_u16(archive, header + 10) == time);
    ensure!(read_u16(archive, header + 12) == date);
    ensure!(read_u16(archive, header + 26) as usize == name_len);
    ensure!(read_u16(archive, header + 28) == 0);
    ensure!(&archive[header + 30..header + 30 + name_len] == name_bytes);

    // Contents, then the data descriptor
    let data = header + 30 + name_len;
    let compressed = &archive[data..data + compressed_size as usize];
    let descriptor = data + compressed_size as usize;
    ensure!(
        archive[descriptor..descriptor + 4] == DATA_DESCRIPTOR_MAGIC,
        "No data descriptor for {}",
        name
    );
    ensure!(read_u32(archive, descriptor + 4) == crc32);
    ensure!(read_u64(archive, descriptor + 8) == compressed_size);
    ensure!(read_u64(archive, descriptor + 16) == uncompressed_size);

    let contents = match compression_method {
        0 => compressed.to_vec(),
        8 => {
            let mut contents = Vec::new();
            DeflateDecoder::new(compressed)
                .read_to_end(&mut contents)
                .with_context(|| format!("Couldn't inflate {}", name))?;
            contents
        }
        other => anyhow::bail!("Unexpected compression method {}", other),
    };
    ensure!(contents.len() as u64 == uncompressed_size);
    ensure!(crc32fast::hash(&contents) == crc32, "CRC mismatch for {}", name);

    let entry = Entry {
        name,
        flags,
        compression_method,
        last_modified: parse_msdos(time, date)?,
        crc32,
        compressed_size,
        uncompressed_size,
        header_offset,
        contents,
    };
    Ok((entry, extra + extra_len))
}
