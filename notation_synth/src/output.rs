// The dataset tree.
//
//   {root}/{domain}/pages.csv
//   {root}/{domain}/staves.csv
//   {root}/{domain}/page/{bucket}/{identifier}.png|.krn
//   {root}/{domain}/staff/{bucket}/{identifier}_s{staff}.png|.krn
//   {root}/crashes/{identifier}.musicxml|.log
//
// Buckets only keep directory sizes manageable. A page and all of its staves
// share the bucket of the page identifier: CRC-32 of the identifier modulo
// the bucket count, zero-padded to the number of digits in the bucket count.
// CRC-32 is fixed by its definition, so bucket assignment never changes
// between runs, machines, or toolchains.
//
// CSV rows pair an image path with its label path, both relative to the
// output root and always `/`-separated.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbaImage};

use crate::error::OutputError;
use crate::page::PageContent;
use crate::staff::StaffRecord;

pub const CRASH_DIR: &str = "crashes";

/// Bucket directory name for an identifier.
pub fn bucket_for(identifier: &str, bucket_count: u32) -> String {
    let bucket_count = bucket_count.max(1);
    let width = bucket_count.to_string().len();
    let bucket = crc32fast::hash(identifier.as_bytes()) % bucket_count;
    format!("{bucket:0width$}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArtifactKind {
    Page,
    Staff,
}

impl ArtifactKind {
    fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::Page => "page",
            ArtifactKind::Staff => "staff",
        }
    }

    fn csv_name(self) -> &'static str {
        match self {
            ArtifactKind::Page => "pages.csv",
            ArtifactKind::Staff => "staves.csv",
        }
    }
}

/// Relative path (without extension) of a page or staff artifact.
pub fn artifact_stem(
    domain: &str,
    kind: ArtifactKind,
    identifier: &str,
    staff: Option<usize>,
    bucket_count: u32,
) -> String {
    let bucket = bucket_for(identifier, bucket_count);
    let suffix = staff.map(|s| format!("_s{s}")).unwrap_or_default();
    format!("{domain}/{}/{bucket}/{identifier}{suffix}", kind.dir_name())
}

/// Writes images, labels, and index rows under one output root.
pub struct DatasetWriter {
    root: PathBuf,
    bucket_count: u32,
    indexes: BTreeMap<(String, ArtifactKind), csv::Writer<File>>,
    pages: usize,
    staves: usize,
}

impl DatasetWriter {
    pub fn new(root: impl Into<PathBuf>, bucket_count: u32) -> Self {
        Self {
            root: root.into(),
            bucket_count: bucket_count.max(1),
            indexes: BTreeMap::new(),
            pages: 0,
            staves: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pages_written(&self) -> usize {
        self.pages
    }

    pub fn staves_written(&self) -> usize {
        self.staves
    }

    pub fn write_page(
        &mut self,
        page: &PageContent,
        image: &RgbaImage,
    ) -> Result<(), OutputError> {
        let stem = artifact_stem(
            page.domain(),
            ArtifactKind::Page,
            page.identifier(),
            None,
            self.bucket_count,
        );
        self.write_pair(page.domain(), ArtifactKind::Page, &stem, image, page.kern())?;
        self.pages += 1;
        Ok(())
    }

    pub fn write_staff(
        &mut self,
        page: &PageContent,
        staff: &StaffRecord,
    ) -> Result<(), OutputError> {
        let stem = artifact_stem(
            page.domain(),
            ArtifactKind::Staff,
            page.identifier(),
            Some(staff.staff_index),
            self.bucket_count,
        );
        self.write_pair(page.domain(), ArtifactKind::Staff, &stem, &staff.image, &staff.kern)?;
        self.staves += 1;
        Ok(())
    }

    /// Keep the input of a page that failed to render, with an error summary.
    pub fn write_crash(
        &self,
        identifier: &str,
        musicxml: &str,
        summary: &str,
    ) -> Result<PathBuf, OutputError> {
        let dir = self.root.join(CRASH_DIR);
        create_dir(&dir)?;
        write_file(&dir.join(format!("{identifier}.musicxml")), musicxml)?;
        let log = dir.join(format!("{identifier}.log"));
        write_file(&log, &format!("{summary}\n"))?;
        Ok(log)
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        for (key, writer) in &mut self.indexes {
            writer.flush().map_err(|source| OutputError::Io {
                path: self.root.join(&key.0).join(key.1.csv_name()),
                source,
            })?;
        }
        Ok(())
    }

    fn write_pair(
        &mut self,
        domain: &str,
        kind: ArtifactKind,
        stem: &str,
        image: &RgbaImage,
        label: &str,
    ) -> Result<(), OutputError> {
        let image_rel = format!("{stem}.png");
        let label_rel = format!("{stem}.krn");
        let image_path = self.root.join(&image_rel);
        if let Some(parent) = image_path.parent() {
            create_dir(parent)?;
        }
        image.save_with_format(&image_path, ImageFormat::Png)?;
        write_file(&self.root.join(&label_rel), &format!("{label}\n"))?;

        self.index(domain, kind)?
            .write_record([image_rel.as_str(), label_rel.as_str()])?;
        Ok(())
    }

    /// The CSV index for a domain and artifact kind, created (with its
    /// header) on first use.
    fn index(
        &mut self,
        domain: &str,
        kind: ArtifactKind,
    ) -> Result<&mut csv::Writer<File>, OutputError> {
        match self.indexes.entry((domain.to_string(), kind)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let dir = self.root.join(domain);
                create_dir(&dir)?;
                let mut writer = csv::Writer::from_path(dir.join(kind.csv_name()))?;
                writer.write_record(["image", "label"])?;
                Ok(entry.insert(writer))
            }
        }
    }
}

fn create_dir(dir: &Path) -> Result<(), OutputError> {
    fs::create_dir_all(dir).map_err(|source| OutputError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, contents: &str) -> Result<(), OutputError> {
    fs::write(path, contents).map_err(|source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_is_stable_and_padded() {
        let a = bucket_for("foo_bar_len2", 10);
        assert_eq!(a.len(), 2);
        assert!(a.starts_with('0'));
        for _ in 0..10 {
            assert_eq!(bucket_for("foo_bar_len2", 10), a);
        }
        // Fixed by CRC-32 itself.
        let expected = crc32fast::hash(b"foo_bar_len2") % 10;
        assert_eq!(a, format!("0{expected}"));
    }

    #[test]
    fn bucket_width_follows_count() {
        assert_eq!(bucket_for("x", 1), "0");
        assert_eq!(bucket_for("x", 7).len(), 1);
        assert_eq!(bucket_for("x", 100).len(), 3);
        assert_eq!(bucket_for("x", 0), "0");
    }

    #[test]
    fn buckets_spread_out() {
        let mut seen = std::collections::BTreeSet::new();
        for i in 0..200 {
            seen.insert(bucket_for(&format!("Corpus_p_{i}_len1"), 10));
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn artifact_paths() {
        let bucket = bucket_for("foo_len1", 10);
        assert_eq!(
            artifact_stem("M", ArtifactKind::Page, "foo_len1", None, 10),
            format!("M/page/{bucket}/foo_len1")
        );
        assert_eq!(
            artifact_stem("M", ArtifactKind::Staff, "foo_len1", Some(3), 10),
            format!("M/staff/{bucket}/foo_len1_s3")
        );
    }

    #[test]
    fn crash_files_are_written() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = DatasetWriter::new(tmp.path(), 10);
        let log = writer
            .write_crash("foo_len1", "<score-partwise/>", "renderer failed (exit status: 1)")
            .unwrap();
        assert_eq!(log, tmp.path().join("crashes/foo_len1.log"));
        assert_eq!(
            fs::read_to_string(tmp.path().join("crashes/foo_len1.musicxml")).unwrap(),
            "<score-partwise/>"
        );
        assert!(fs::read_to_string(log).unwrap().starts_with("renderer failed"));
    }
}
