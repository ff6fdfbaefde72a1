// Error types for every pipeline stage.
//
// The taxonomy follows how failures propagate through a run:
// - archive and reconciliation anomalies that only affect one record are
//   dropped inside `corpus.rs` and never become an error value here;
// - `RefineError` (the external normalizer failed or lost an output) and
//   `LayoutConsistencyError` (rendered measures do not form contiguous
//   staves) terminate the run;
// - `RenderError` is caught by the driving loop in `synth.rs` and recorded
//   in the crash folder for that one page.
//
// `PipelineError` is the umbrella type the lazy stages yield, so a single
// `?` carries any stage failure up to the driver.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while streaming entries out of a tar archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// IO error while reading or decompressing the archive
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The archive file could not be opened
    #[error("cannot open archive {path}: {source}")]
    Open {
        /// Archive path
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The stream ended inside an entry's payload
    #[error("archive truncated inside {name}: read {read} of {expected} bytes")]
    Truncated {
        /// Entry being read
        name: String,
        /// Size recorded in the entry header
        expected: u64,
        /// Bytes actually available
        read: u64,
    },
}

/// Errors raised while reconciling archive fragments into incipits.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The underlying archive could not be read
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// A payload file was not valid UTF-8
    #[error("payload {name} is not valid UTF-8")]
    InvalidUtf8 {
        /// Archive entry name of the payload
        name: String,
    },
}

/// Errors raised by the batched external normalizer.
#[derive(Error, Debug)]
pub enum RefineError {
    /// Batch size must be at least one
    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    /// Filesystem error on a scratch file
    #[error("scratch file {path}: {source}")]
    Scratch {
        /// Scratch path involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The job descriptor could not be serialized
    #[error("cannot encode job descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),

    /// The external tool could not be started
    #[error("cannot launch {program}: {source}")]
    Launch {
        /// Program that failed to start
        program: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The external tool exited unsuccessfully; `diagnostics` is its
    /// standard error output, verbatim
    #[error("normalizer did not terminate successfully ({status})\n{diagnostics}")]
    ToolFailed {
        /// Exit status description
        status: String,
        /// Tool diagnostics, verbatim
        diagnostics: String,
    },

    /// The tool reported success but some destinations were never written
    #[error("normalizer produced no output for {} file(s): {paths:?}", .paths.len())]
    MissingOutput {
        /// Destinations that did not exist at read-back
        paths: Vec<PathBuf>,
    },
}

/// Errors raised while parsing or rewriting symbolic scores.
#[derive(Error, Debug)]
pub enum ScoreError {
    /// MusicXML was not well-formed
    #[error("malformed MusicXML: {0}")]
    Xml(#[from] roxmltree::Error),

    /// MEI rewriting failed
    #[error("malformed MEI: {0}")]
    Mei(#[from] quick_xml::Error),

    /// The rewritten document was not valid UTF-8
    #[error("rewritten document is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),

    /// The document has no `<part>` with measures
    #[error("score has no part")]
    NoPart,

    /// Concatenation was asked to join zero scores
    #[error("cannot concatenate an empty list of scores")]
    Empty,
}

/// A single page failed to render. Recovered at page granularity.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Filesystem error while exchanging files with the renderer
    #[error("renderer IO on {path}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The renderer process failed
    #[error("renderer failed ({status})\n{diagnostics}")]
    ToolFailed {
        /// Exit status description
        status: String,
        /// Renderer diagnostics, verbatim
        diagnostics: String,
    },

    /// The rendered bitmap could not be decoded
    #[error("cannot decode rendered image: {0}")]
    Image(#[from] image::ImageError),

    /// The layout geometry file could not be decoded
    #[error("cannot decode page geometry: {0}")]
    Geometry(#[from] serde_json::Error),

    /// The renderer produced something other than exactly one page
    #[error("expected exactly one rendered page, got {0}")]
    PageCount(usize),
}

/// The rendered layout contradicts the page content. Always fatal: it means
/// the renderer broke its contract, and repairing it would corrupt labels.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LayoutConsistencyError {
    /// A measure was assigned to a staff index the geometry does not define
    #[error("measure {measure} assigned to unknown staff {staff}")]
    UnknownStaff {
        /// Measure index
        measure: usize,
        /// Staff index it claims
        staff: usize,
    },

    /// A staff has no measures at all
    #[error("staff {staff} holds no measures")]
    EmptyStaff {
        /// Staff index
        staff: usize,
    },

    /// A staff's measures are not one contiguous run
    #[error("staff {staff} holds non-contiguous measures {measures:?}")]
    Discontiguous {
        /// Staff index
        staff: usize,
        /// The measures found on that staff, ascending
        measures: Vec<usize>,
    },

    /// A staff does not start right after the previous one ended
    #[error("staff {staff} starts at measure {actual}, expected {expected}")]
    Gap {
        /// Staff index
        staff: usize,
        /// Measure the staff should start at
        expected: usize,
        /// Measure it actually starts at
        actual: usize,
    },

    /// Rendered measure count differs from the page content
    #[error("rendered {rendered} measures, page has {expected}")]
    MeasureCount {
        /// Measures in the geometry
        rendered: usize,
        /// Measures in the page score
        expected: usize,
    },
}

/// Errors raised while writing the dataset tree.
#[derive(Error, Debug)]
pub enum OutputError {
    /// Filesystem error on an output path
    #[error("cannot write {path}: {source}")]
    Io {
        /// Output path
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Image encoding failed
    #[error("cannot encode image: {0}")]
    Image(#[from] image::ImageError),

    /// CSV writing failed
    #[error("cannot write CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Errors raised while loading or checking the run configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("cannot read config {path}: {source}")]
    Io {
        /// Config path
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The config file is not valid JSON for `SynthConfig`
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Any fatal failure of the streaming pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error(transparent)]
    Refine(#[from] RefineError),

    #[error(transparent)]
    Score(#[from] ScoreError),

    #[error(transparent)]
    Layout(#[from] LayoutConsistencyError),

    #[error(transparent)]
    Output(#[from] OutputError),
}
