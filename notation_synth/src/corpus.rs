// PrIMuS corpus access: reconciles archive fragments into complete incipits.
//
// The PrIMuS 2018 archive stores each incipit as a directory of sibling
// files, e.g.
//
//   Corpus/package_aa/000100134-1_1_1/000100134-1_1_1.agnostic
//   Corpus/package_aa/000100134-1_1_1/000100134-1_1_1.mei
//   Corpus/package_aa/000100134-1_1_1/000100134-1_1_1.png   (ignored)
//
// Entries are grouped by the first `RECORD_KEY_DEPTH` path segments. The
// `Reconciler` keeps a working set of partially assembled records keyed by
// that prefix; a record leaves the working set the moment it becomes complete
// (both payloads present, emitted unless filtered) or is seen to be empty
// after an entry (an entry that only touched the key, e.g. an image or a
// stray file, never leaves a dangling record behind). Output order is
// completion order, which for a well-formed archive is archive order.
//
// The working set is a `BTreeMap` so that nothing about the run depends on
// hash iteration order.
//
// See also: `archive.rs` for the fragment stream, `refiner.rs` for the next
// stage.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::debug;

use crate::archive::{Fragment, TarFragments};
use crate::error::{ArchiveError, CorpusError};
use crate::restartable::Restartable;

/// Number of leading path segments that identify one incipit.
pub const RECORD_KEY_DEPTH: usize = 3;

/// Number of incipits in the 2018 PrIMuS snapshot that survive
/// `SKIP_INCIPITS_CONTAINING`. Used as a progress estimate only; it is not
/// derived from the archive. `PrimusCorpus::count_records` recomputes it.
pub const PRIMUS_FILTERED_INCIPIT_COUNT: usize = 84_381;

/// Agnostic-encoding tokens that the handwritten renderer cannot draw.
/// Incipits containing any of them are dropped.
pub const SKIP_INCIPITS_CONTAINING: &[&str] = &[
    // Super-whole notes and rests break the measure structure.
    "rest.quadruple_whole-L3",
    "note.quadruple_whole-",
    "note.double_whole-",
    // No glyphs for 32nd notes and shorter.
    "rest.thirty_second-L3",
    "note.thirty_second-",
    "rest.sixty_fourth-L3",
];

/// The two payload files an incipit carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    /// Agnostic symbol sequence; the filter target.
    Agnostic,
    /// MEI score; what the pipeline renders.
    Mei,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 2] = [PayloadKind::Agnostic, PayloadKind::Mei];

    pub fn suffix(self) -> &'static str {
        match self {
            PayloadKind::Agnostic => "agnostic",
            PayloadKind::Mei => "mei",
        }
    }
}

/// One complete PrIMuS record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Incipit {
    /// Path prefix identifying the record, e.g. `Corpus/package_aa/000100134-1_1_1`.
    pub key: String,
    pub agnostic: String,
    pub mei: String,
}

impl Incipit {
    /// Last segment of the key; payload files are named after it.
    pub fn leaf(&self) -> &str {
        key_leaf(&self.key)
    }

    /// Measure count as seen by the agnostic encoding.
    pub fn measure_count(&self) -> usize {
        self.agnostic.matches("barline-L1").count() + 1
    }

    /// Whether the agnostic payload contains a token we cannot synthesize.
    pub fn should_be_skipped(&self) -> bool {
        SKIP_INCIPITS_CONTAINING
            .iter()
            .any(|pattern| self.agnostic.contains(pattern))
    }
}

/// A record in the working set, with whichever payloads have arrived.
#[derive(Debug, Default)]
struct PartialIncipit {
    agnostic: Option<String>,
    mei: Option<String>,
}

impl PartialIncipit {
    fn slot_mut(&mut self, kind: PayloadKind) -> &mut Option<String> {
        match kind {
            PayloadKind::Agnostic => &mut self.agnostic,
            PayloadKind::Mei => &mut self.mei,
        }
    }

    fn is_complete(&self) -> bool {
        self.agnostic.is_some() && self.mei.is_some()
    }

    fn is_empty(&self) -> bool {
        self.agnostic.is_none() && self.mei.is_none()
    }

    fn into_incipit(self, key: String) -> Option<Incipit> {
        Some(Incipit {
            key,
            agnostic: self.agnostic?,
            mei: self.mei?,
        })
    }
}

/// Truncate an entry name to its first `depth` `/`-separated segments.
pub fn record_key(name: &str, depth: usize) -> &str {
    match name.match_indices('/').nth(depth.saturating_sub(1)) {
        Some((idx, _)) if depth > 0 => &name[..idx],
        _ if depth == 0 => "",
        _ => name,
    }
}

fn key_leaf(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Conventional name of a record's payload file: `{key}/{leaf}.{suffix}`.
pub fn payload_file_name(key: &str, kind: PayloadKind) -> String {
    format!("{key}/{}.{}", key_leaf(key), kind.suffix())
}

/// Lazily turns a fragment stream into complete, filtered incipits.
pub struct Reconciler<I> {
    fragments: I,
    working_set: BTreeMap<String, PartialIncipit>,
    finished: bool,
    skipped: usize,
}

impl<I> Reconciler<I>
where
    I: Iterator<Item = Result<Fragment, ArchiveError>>,
{
    pub fn new(fragments: I) -> Self {
        Self {
            fragments,
            working_set: BTreeMap::new(),
            finished: false,
            skipped: 0,
        }
    }

    /// Records currently waiting for their remaining payload.
    pub fn pending(&self) -> usize {
        self.working_set.len()
    }

    /// Complete records dropped by the token filter so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Fold one fragment into the working set, returning a record if this
    /// fragment completed one that passes the filter.
    fn absorb(&mut self, fragment: Fragment) -> Result<Option<Incipit>, CorpusError> {
        let key = record_key(&fragment.name, RECORD_KEY_DEPTH).to_string();

        let payload = match PayloadKind::ALL
            .into_iter()
            .find(|kind| fragment.name == payload_file_name(&key, *kind))
        {
            Some(kind) => {
                let text = String::from_utf8(fragment.data).map_err(|_| {
                    CorpusError::InvalidUtf8 {
                        name: fragment.name.clone(),
                    }
                })?;
                Some((kind, text))
            }
            None => None,
        };

        let record = self.working_set.entry(key.clone()).or_default();
        if let Some((kind, text)) = payload {
            *record.slot_mut(kind) = Some(text);
        }
        let complete = record.is_complete();
        let empty = record.is_empty();

        if complete {
            let Some(incipit) = self
                .working_set
                .remove(&key)
                .and_then(|record| record.into_incipit(key))
            else {
                return Ok(None);
            };
            if incipit.should_be_skipped() {
                self.skipped += 1;
                debug!("Skipping unsynthesizable incipit {}", incipit.key);
                return Ok(None);
            }
            return Ok(Some(incipit));
        }
        if empty {
            self.working_set.remove(&key);
        }
        Ok(None)
    }
}

impl<I> Iterator for Reconciler<I>
where
    I: Iterator<Item = Result<Fragment, ArchiveError>>,
{
    type Item = Result<Incipit, CorpusError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.fragments.next() {
                Some(Ok(fragment)) => match self.absorb(fragment) {
                    Ok(Some(incipit)) => return Some(Ok(incipit)),
                    Ok(None) => continue,
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                },
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
                None => {
                    self.finished = true;
                    if !self.working_set.is_empty() {
                        debug!(
                            "Archive ended with {} incomplete record(s), first: {:?}",
                            self.working_set.len(),
                            self.working_set.keys().next()
                        );
                    }
                    return None;
                }
            }
        }
    }
}

/// Boxed incipit stream, so every pass over the corpus has one nameable type.
pub type IncipitStream = Box<dyn Iterator<Item = Result<Incipit, CorpusError>>>;

/// The PrIMuS archive on disk.
#[derive(Clone, Debug)]
pub struct PrimusCorpus {
    path: PathBuf,
}

impl PrimusCorpus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Progress estimate for one full pass (see `PRIMUS_FILTERED_INCIPIT_COUNT`).
    pub fn expected_len(&self) -> usize {
        PRIMUS_FILTERED_INCIPIT_COUNT
    }

    /// Start a new pass over the archive. Failure to open the archive is
    /// reported as the first item of the stream.
    pub fn records(&self) -> IncipitStream {
        match TarFragments::open(&self.path) {
            Ok(fragments) => Box::new(Reconciler::new(fragments)),
            Err(e) => Box::new(std::iter::once(Err(e.into()))),
        }
    }

    /// Wrap the corpus so it can be traversed any number of times.
    pub fn restartable(self) -> Restartable<impl Fn() -> IncipitStream> {
        Restartable::new(move || self.records())
    }

    /// Count the incipits that survive filtering with a full pass.
    pub fn count_records(&self) -> Result<usize, CorpusError> {
        self.records().try_fold(0, |n, record| record.map(|_| n + 1))
    }
}
