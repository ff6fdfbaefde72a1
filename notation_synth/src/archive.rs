// Owned, lazy reader over the regular-file entries of a tar archive.
//
// `tar::Archive::entries` borrows the archive mutably, so the entry iterator
// cannot outlive a stack frame on its own. `TarFragments` keeps the archive
// and its `tar::Entries` together in one `ouroboros` self-referencing struct,
// which makes the stream an owned value that a stored factory can return
// again and again. The `tar` crate does all block handling: header
// checksums, GNU long names, PAX `path` records, and skipping the unread
// payload of the previous entry. One `next()` call reads exactly one entry;
// nothing beyond the current entry's payload is ever buffered.
//
// Directories, links, and PAX globals are skipped, as are macOS resource
// forks (`._name`).
//
// Consumed by `corpus.rs`, which groups fragments into incipits.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use log::warn;
use ouroboros::self_referencing;

use crate::error::ArchiveError;

/// Payloads larger than this are skipped. PrIMuS files are a few kilobytes;
/// anything this large is not a symbolic record.
pub const MAX_FRAGMENT_SIZE: u64 = 100_000_000;

/// Compression wrapped around the tar stream, detected from the file name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TarCompression {
    None,
    Gzip,
    Bzip2,
}

impl TarCompression {
    /// Detect compression from the archive's extension (`.tgz`, `.tar.gz`,
    /// `.tbz2`, `.tar.bz2`; anything else is read uncompressed).
    pub fn from_extension(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            TarCompression::Gzip
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".tbz")
        {
            TarCompression::Bzip2
        } else {
            TarCompression::None
        }
    }
}

/// One regular file from the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    /// Entry name with any leading `./` removed.
    pub name: String,
    /// Raw file contents.
    pub data: Vec<u8>,
}

type TarReader = Box<dyn Read>;

/// Lazy iterator over the regular files of a tar stream.
#[self_referencing]
pub struct TarFragments {
    finished: bool,
    archive: tar::Archive<TarReader>,
    #[borrows(mut archive)]
    #[not_covariant]
    entries: tar::Entries<'this, TarReader>,
}

impl TarFragments {
    /// Open an archive file, choosing the decompressor from its extension.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path).map_err(|source| ArchiveError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);
        let reader: TarReader = match TarCompression::from_extension(path) {
            TarCompression::None => Box::new(reader),
            TarCompression::Gzip => Box::new(GzDecoder::new(reader)),
            TarCompression::Bzip2 => Box::new(BzDecoder::new(reader)),
        };
        Self::from_reader(reader)
    }

    /// Read fragments from an already-decompressed tar stream.
    pub fn from_reader<R: Read + 'static>(reader: R) -> Result<Self, ArchiveError> {
        let reader: TarReader = Box::new(reader);
        let fragments = TarFragments::try_new(false, tar::Archive::new(reader), |archive| {
            archive.entries()
        })?;
        Ok(fragments)
    }
}

/// Advance to the next regular file, or `None` at end of archive.
fn next_fragment<R: Read>(
    entries: &mut tar::Entries<'_, R>,
) -> Result<Option<Fragment>, ArchiveError> {
    for entry in entries {
        let mut entry = entry?;
        let name = normalize_name(&String::from_utf8_lossy(&entry.path_bytes()));
        if !entry.header().entry_type().is_file() || is_resource_fork(&name) {
            continue;
        }
        let size = entry.size();
        if size > MAX_FRAGMENT_SIZE {
            warn!("Skipping large archive entry: {name} ({size} bytes)");
            continue;
        }

        let mut data = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
        entry.read_to_end(&mut data)?;
        if (data.len() as u64) < size {
            return Err(ArchiveError::Truncated {
                name,
                expected: size,
                read: data.len() as u64,
            });
        }
        return Ok(Some(Fragment { name, data }));
    }
    Ok(None)
}

impl Iterator for TarFragments {
    type Item = Result<Fragment, ArchiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.with_mut(|fields| {
            if *fields.finished {
                return None;
            }
            match next_fragment(fields.entries) {
                Ok(Some(fragment)) => Some(Ok(fragment)),
                Ok(None) => {
                    *fields.finished = true;
                    None
                }
                Err(e) => {
                    // A broken stream cannot be resynchronized.
                    *fields.finished = true;
                    Some(Err(e))
                }
            }
        })
    }
}

fn normalize_name(name: &str) -> String {
    let mut name = name;
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    name.to_string()
}

fn is_resource_fork(name: &str) -> bool {
    name.rsplit('/').next().is_some_and(|leaf| leaf.starts_with("._"))
}
