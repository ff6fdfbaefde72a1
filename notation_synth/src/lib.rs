// Notation Synth: synthetic handwritten-score pages for music recognition.
//
// Streams the PrIMuS incipit archive, normalizes every incipit through an
// external notation tool, packs incipits onto randomly laid out pages,
// renders those pages in a handwritten style with another external tool, and
// writes the page images, per-staff crops, and their **kern labels into a
// bucketed dataset tree.
//
// Architecture:
// - restartable.rs: Re-iterable wrapper over an iterator factory
// - archive.rs: Streaming tar(.gz/.bz2) reader yielding file fragments
// - corpus.rs: Reconciles fragments into incipit records, the PrIMuS corpus
// - mei.rs: MEI patching (multi-measure rests → measure rests)
// - tool.rs: Runs external programs with captured diagnostics and a timeout
// - refiner.rs: Batched normalization through the external tool's job mode
// - musicxml.rs: Measure-level MusicXML model (parse, splice, truncate, breaks)
// - kern.rs: MusicXML → **kern labels, measure slicing
// - layout.rs: Page layouts and their per-domain distributions
// - page.rs: Assembles page content from the normalized incipit stream
// - render.rs: External handwritten renderer and its geometry report
// - staff.rs: Layout consistency checks and randomized staff crops
// - output.rs: Dataset tree, buckets, CSV indexes, crash folder
// - config.rs: JSON run configuration
// - synth.rs: Pipeline wiring and the page loop
//
// A run is deterministic given its seed and archive: every random draw comes
// from one `SynthRng` in a fixed order.

pub mod archive;
pub mod config;
pub mod corpus;
pub mod error;
pub mod kern;
pub mod layout;
pub mod mei;
pub mod musicxml;
pub mod output;
pub mod page;
pub mod refiner;
pub mod render;
pub mod restartable;
pub mod staff;
pub mod synth;
pub mod tool;
