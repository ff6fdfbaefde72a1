// The synthesis driver.
//
// Wires the stages into one pull-based pipeline:
//
//   archive → reconcile → MEI patch → batched normalizer → page assembly
//     → renderer → staff crops → dataset writer
//
// and runs the page loop: pick a domain, sample its layout, pull a page,
// render it, cut it into staves, write everything. The loop ends when the
// corpus runs dry (page assembly returns `None`) or `max_pages` pages have
// been attempted.
//
// A page that fails to render costs only that page: the failure is logged,
// the page's MusicXML and the error go to the crash folder, and the loop
// moves on. Every other error ends the run.
//
// All randomness (domain choice, layout, renderer seed, crop margins) comes
// from one `SynthRng` seeded from the config, drawn in a fixed order per
// page, so a fixed seed over the same archive reproduces the same dataset.

use log::{info, warn};
use notation_synth_prng::SynthRng;

use crate::config::SynthConfig;
use crate::corpus::Incipit;
use crate::error::{CorpusError, PipelineError, RefineError};
use crate::kern::KernExporter;
use crate::layout::PageLayout;
use crate::mei::remove_multirests;
use crate::output::DatasetWriter;
use crate::page::{RefinedIncipit, pull_page};
use crate::refiner::{BatchRefiner, JobRunner, RefineSettings};
use crate::render::PageRenderer;
use crate::staff::extract_staves;

/// Turn a stream of incipits into a stream of normalized incipits: patch
/// the MEI, then run it through the normalizer in batches.
pub fn refined_incipits<S, R>(
    records: S,
    runner: R,
    settings: RefineSettings,
    batch_size: usize,
) -> Result<impl Iterator<Item = Result<RefinedIncipit, PipelineError>>, RefineError>
where
    S: Iterator<Item = Result<Incipit, CorpusError>>,
    R: JobRunner,
{
    let patched = records.map(|record| -> Result<(Incipit, String), PipelineError> {
        let incipit = record?;
        let mei = remove_multirests(&incipit.mei)?;
        Ok((incipit, mei))
    });
    let refiner = BatchRefiner::new(patched, runner, settings, batch_size)?;
    Ok(refiner.map(|item| item.map(|(incipit, musicxml)| RefinedIncipit { incipit, musicxml })))
}

/// Totals of one run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pages_attempted: usize,
    pub pages_written: usize,
    pub staves_written: usize,
    pub render_failures: usize,
    pub incipits_consumed: usize,
}

pub struct Synthesizer<'a, R> {
    config: &'a SynthConfig,
    rng: SynthRng,
    renderer: R,
    exporter: KernExporter,
    writer: DatasetWriter,
    expected_incipits: usize,
}

impl<'a, R: PageRenderer> Synthesizer<'a, R> {
    pub fn new(config: &'a SynthConfig, renderer: R) -> Self {
        Self {
            config,
            rng: SynthRng::new(config.seed),
            renderer,
            exporter: KernExporter,
            writer: DatasetWriter::new(&config.output_dir, config.bucket_count),
            expected_incipits: 0,
        }
    }

    /// Corpus size used for progress messages (0 = unknown).
    pub fn with_expected_incipits(mut self, expected: usize) -> Self {
        self.expected_incipits = expected;
        self
    }

    pub fn writer(&self) -> &DatasetWriter {
        &self.writer
    }

    /// Run the page loop until the upstream is exhausted or the page limit
    /// is reached.
    pub fn run<I>(&mut self, mut upstream: I) -> Result<RunSummary, PipelineError>
    where
        I: Iterator<Item = Result<RefinedIncipit, PipelineError>>,
    {
        let config = self.config;
        let weights = config.domain_weights();
        let mut summary = RunSummary::default();

        loop {
            if config.max_pages.is_some_and(|max| summary.pages_attempted >= max) {
                info!("Reached the limit of {} page(s)", summary.pages_attempted);
                break;
            }

            let Some(domain) = self
                .rng
                .choose_weighted(&weights)
                .and_then(|i| config.domains.get(i))
            else {
                break;
            };
            let layout = PageLayout::sample(&mut self.rng, &domain.layout);

            let Some(page) = pull_page(&mut upstream, layout, &domain.name, &self.exporter)?
            else {
                info!("Corpus exhausted");
                break;
            };
            summary.pages_attempted += 1;
            summary.incipits_consumed += page.incipits().len();

            match self.renderer.render(&page, &mut self.rng) {
                Ok(rendered) => {
                    let staves = extract_staves(&rendered, &page, &config.crop, &mut self.rng)?;
                    self.writer.write_page(&page, &rendered.image)?;
                    for staff in &staves {
                        self.writer.write_staff(&page, staff)?;
                    }
                    summary.pages_written += 1;
                    summary.staves_written += staves.len();
                }
                Err(e) => {
                    warn!("Rendering {} failed: {e}", page.identifier());
                    let report = format!(
                        "page: {}\ndomain: {}\nlayout: {:?}\nincipits: {}\nerror: {e}",
                        page.identifier(),
                        page.domain(),
                        page.layout().measures_per_staff,
                        page
                            .incipits()
                            .iter()
                            .map(|r| r.incipit.key.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                    );
                    self.writer
                        .write_crash(page.identifier(), page.musicxml(), &report)?;
                    summary.render_failures += 1;
                }
            }

            if summary.pages_attempted % config.progress_interval.max(1) == 0 {
                self.log_progress(&summary);
            }
        }

        self.writer.flush()?;
        info!(
            "Done: {} page(s), {} staves, {} render failure(s), {} incipit(s) consumed",
            summary.pages_written,
            summary.staves_written,
            summary.render_failures,
            summary.incipits_consumed
        );
        Ok(summary)
    }

    fn log_progress(&self, summary: &RunSummary) {
        if self.expected_incipits > 0 {
            let percent = 100.0 * summary.incipits_consumed as f64 / self.expected_incipits as f64;
            info!(
                "{} page(s) attempted, {}/{} incipits ({percent:.1}%)",
                summary.pages_attempted, summary.incipits_consumed, self.expected_incipits
            );
        } else {
            info!(
                "{} page(s) attempted, {} incipits",
                summary.pages_attempted, summary.incipits_consumed
            );
        }
    }
}
