// Batched external normalization of MEI incipits into MusicXML.
//
// Starting the normalizer (a MuseScore-style binary) costs far more than the
// conversion itself, so items are grouped into batches and every batch is
// handed to the tool as a single job descriptor:
//
//   [{"in": ".../<batch>_crude_0.mei", "out": ".../<batch>_refined_0.musicxml"}, ...]
//
// passed as `<program> -j <descriptor>`. Scratch files are named
// `{batch_id}_{role}_{index}.{ext}` with a fresh UUID per batch, so batches
// can never collide even when several runs share a scratch directory. A
// `ScratchBatch` guard removes every scratch file of the batch when it goes
// out of scope, on success and failure alike.
//
// Any failure here (tool exit status, missing output) is fatal for the run:
// a silently skipped item would leave the corpus with a gap nobody notices.
//
// See also: `tool.rs` for process handling, `page.rs` for the consumer.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, RefineError};
use crate::tool::{ToolStatus, run_captured};

/// One conversion instruction in a job descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionJob {
    #[serde(rename = "in")]
    pub input: PathBuf,
    #[serde(rename = "out")]
    pub output: PathBuf,
}

/// A scratch source and the destination the tool should write for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScratchEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// Runs one job descriptor through the external normalizer.
pub trait JobRunner {
    fn run(&mut self, descriptor: &Path) -> Result<ToolStatus, RefineError>;
}

impl<R: JobRunner + ?Sized> JobRunner for &mut R {
    fn run(&mut self, descriptor: &Path) -> Result<ToolStatus, RefineError> {
        (**self).run(descriptor)
    }
}

/// Spawns `<program> [extra_args..] -j <descriptor>`.
#[derive(Clone, Debug)]
pub struct CommandJobRunner {
    pub program: PathBuf,
    pub extra_args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl CommandJobRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            timeout: None,
        }
    }
}

impl JobRunner for CommandJobRunner {
    fn run(&mut self, descriptor: &Path) -> Result<ToolStatus, RefineError> {
        let mut command = Command::new(&self.program);
        command.args(&self.extra_args).arg("-j").arg(descriptor);
        run_captured(command, self.timeout).map_err(|source| RefineError::Launch {
            program: self.program.clone(),
            source,
        })
    }
}

/// Where scratch files go and which extensions they carry.
#[derive(Clone, Debug)]
pub struct RefineSettings {
    pub scratch_dir: PathBuf,
    pub source_extension: String,
    pub target_extension: String,
    /// Leave out instructions whose destination already exists.
    pub soft: bool,
}

impl RefineSettings {
    /// MEI in, MusicXML out.
    pub fn mei_to_musicxml(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            source_extension: "mei".to_string(),
            target_extension: "musicxml".to_string(),
            soft: false,
        }
    }
}

/// Owns the scratch files of one batch and deletes them on drop.
#[derive(Debug, Default)]
struct ScratchBatch {
    files: Vec<PathBuf>,
}

impl ScratchBatch {
    fn track(&mut self, path: PathBuf) {
        self.files.push(path);
    }
}

impl Drop for ScratchBatch {
    fn drop(&mut self) {
        for path in &self.files {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Cannot remove scratch file {}: {e}", path.display()),
            }
        }
    }
}

fn scratch_error(path: &Path) -> impl FnOnce(io::Error) -> RefineError + '_ {
    move |source| RefineError::Scratch {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `descriptor` and run it once. Returns the number of instructions
/// handed to the tool; in soft mode that may be zero, in which case the tool
/// is not started at all. The descriptor file is left for the caller to
/// clean up.
pub fn execute_conversions(
    entries: &[ScratchEntry],
    soft: bool,
    descriptor: &Path,
    runner: &mut dyn JobRunner,
) -> Result<usize, RefineError> {
    let jobs: Vec<ConversionJob> = entries
        .iter()
        .filter(|entry| !(soft && entry.destination.exists()))
        .map(|entry| ConversionJob {
            input: entry.source.clone(),
            output: entry.destination.clone(),
        })
        .collect();

    if jobs.is_empty() {
        debug!("All {} destination(s) already exist, nothing to run", entries.len());
        return Ok(0);
    }

    let json = serde_json::to_vec_pretty(&jobs)?;
    fs::write(descriptor, json).map_err(scratch_error(descriptor))?;

    let status = runner.run(descriptor)?;
    if !status.success {
        return Err(RefineError::ToolFailed {
            status: status.status,
            diagnostics: status.diagnostics,
        });
    }
    Ok(jobs.len())
}

/// Normalize one batch of payloads, returning outputs in input order.
pub fn refine_batch(
    payloads: &[String],
    settings: &RefineSettings,
    runner: &mut dyn JobRunner,
) -> Result<Vec<String>, RefineError> {
    if payloads.is_empty() {
        return Ok(Vec::new());
    }
    let dir = &settings.scratch_dir;
    fs::create_dir_all(dir).map_err(scratch_error(dir))?;

    let batch_id = Uuid::new_v4().simple().to_string();
    let mut scratch = ScratchBatch::default();

    let mut entries = Vec::with_capacity(payloads.len());
    for (i, payload) in payloads.iter().enumerate() {
        let entry = ScratchEntry {
            source: dir.join(format!("{batch_id}_crude_{i}.{}", settings.source_extension)),
            destination: dir.join(format!(
                "{batch_id}_refined_{i}.{}",
                settings.target_extension
            )),
        };
        scratch.track(entry.source.clone());
        scratch.track(entry.destination.clone());
        fs::write(&entry.source, payload).map_err(scratch_error(&entry.source))?;
        entries.push(entry);
    }

    let descriptor = dir.join(format!("{batch_id}_job_0.json"));
    scratch.track(descriptor.clone());

    debug!("Refining batch {batch_id} of {} item(s)", entries.len());
    execute_conversions(&entries, settings.soft, &descriptor, runner)?;

    let mut outputs = Vec::with_capacity(entries.len());
    let mut missing = Vec::new();
    for entry in &entries {
        match fs::read_to_string(&entry.destination) {
            Ok(text) => outputs.push(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                missing.push(entry.destination.clone())
            }
            Err(e) => {
                return Err(RefineError::Scratch {
                    path: entry.destination.clone(),
                    source: e,
                });
            }
        }
    }
    drop(scratch);

    if !missing.is_empty() {
        return Err(RefineError::MissingOutput { paths: missing });
    }
    Ok(outputs)
}

/// Lazily refines the payload half of `(tag, payload)` pairs in batches.
pub struct BatchRefiner<I, T, R> {
    source: I,
    runner: R,
    settings: RefineSettings,
    batch_size: usize,
    ready: VecDeque<(T, String)>,
    deferred_error: Option<PipelineError>,
    finished: bool,
    batches: usize,
}

impl<I, T, R> BatchRefiner<I, T, R>
where
    I: Iterator<Item = Result<(T, String), PipelineError>>,
    R: JobRunner,
{
    pub fn new(
        source: I,
        runner: R,
        settings: RefineSettings,
        batch_size: usize,
    ) -> Result<Self, RefineError> {
        if batch_size == 0 {
            return Err(RefineError::InvalidBatchSize);
        }
        Ok(Self {
            source,
            runner,
            settings,
            batch_size,
            ready: VecDeque::with_capacity(batch_size),
            deferred_error: None,
            finished: false,
            batches: 0,
        })
    }

    /// Batches that reached the external tool so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Pull up to one batch from upstream and refine it.
    fn fill(&mut self) -> Result<(), RefineError> {
        let mut tags = Vec::with_capacity(self.batch_size);
        let mut payloads = Vec::with_capacity(self.batch_size);
        while payloads.len() < self.batch_size {
            match self.source.next() {
                Some(Ok((tag, payload))) => {
                    tags.push(tag);
                    payloads.push(payload);
                }
                Some(Err(e)) => {
                    self.deferred_error = Some(e);
                    self.finished = true;
                    break;
                }
                None => {
                    self.finished = true;
                    break;
                }
            }
        }
        if payloads.is_empty() {
            return Ok(());
        }

        let refined = refine_batch(&payloads, &self.settings, &mut self.runner)?;
        self.batches += 1;
        self.ready.extend(tags.into_iter().zip(refined));
        Ok(())
    }
}

impl<I, T, R> Iterator for BatchRefiner<I, T, R>
where
    I: Iterator<Item = Result<(T, String), PipelineError>>,
    R: JobRunner,
{
    type Item = Result<(T, String), PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(Ok(item));
            }
            if let Some(e) = self.deferred_error.take() {
                return Some(Err(e));
            }
            if self.finished {
                return None;
            }
            if let Err(e) = self.fill() {
                self.finished = true;
                self.deferred_error = None;
                return Some(Err(e.into()));
            }
        }
    }
}
