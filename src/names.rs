//! Making entry names unique before an archive is streamed
//!
//! Nothing stops a ZIP archive from holding two entries with the same name,
//! but extracting one usually clobbers the other.
//! [`ZipStream`] writes names as it's given them,
//! so callers that can't promise uniqueness should run [`deduplicate()`] first.
//!
//! [`ZipStream`]: ../write/struct.ZipStream.html

use std::collections::HashSet;

use log::*;

use crate::entry::FileEntry;

/// Renames entries so that no two share a name.
///
/// The first entry with a given name keeps it.
/// Each later one named `base.ext` becomes `base (n).ext`,
/// where `n` is the smallest positive number giving a name
/// that isn't used anywhere else in the list.
///
/// ```
/// # use zipfly::*;
/// let mut entries: Vec<FileEntry> = vec![
///     LocalFile::new("a/report.txt").with_name("report.txt").into(),
///     LocalFile::new("b/report.txt").with_name("report.txt").into(),
/// ];
/// zipfly::names::deduplicate(&mut entries);
/// assert_eq!(entries[1].name(), "report (1).txt");
/// ```
pub fn deduplicate(entries: &mut [FileEntry]) {
    let mut taken: HashSet<String> = entries.iter().map(|e| e.name().to_owned()).collect();
    let mut seen: HashSet<String> = HashSet::with_capacity(entries.len());

    for entry in entries.iter_mut() {
        if seen.insert(entry.name().to_owned()) {
            continue;
        }

        let (base, extension) = split_extension(entry.name());
        let mut n = 1u64;
        let renamed = loop {
            let candidate = match extension {
                Some(ext) => format!("{} ({}).{}", base, n, ext),
                None => format!("{} ({})", base, n),
            };
            if !taken.contains(&candidate) {
                break candidate;
            }
            n += 1;
        };

        debug!("Renaming duplicate {} to {}", entry.name(), renamed);
        taken.insert(renamed.clone());
        seen.insert(renamed.clone());
        entry.set_name(renamed);
    }
}

/// Splits a name at the last `.` of its final path component.
///
/// Dotfiles (`.bashrc`) have no extension.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    let file_start = name.rfind('/').map_or(0, |slash| slash + 1);
    match name[file_start..].rfind('.') {
        Some(0) | None => (name, None),
        Some(dot) => {
            let dot = file_start + dot;
            (&name[..dot], Some(&name[dot + 1..]))
        }
    }
}
