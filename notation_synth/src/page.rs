// Page content assembly.
//
// `pull_page` takes refined incipits from the upstream one at a time until
// their combined measure count covers the sampled layout, then builds the
// page score: concatenate, cut to exactly `layout.total_measures()`, and mark
// the first measure of every staff after the first with a system break. The
// page label is exported from the final MusicXML so it describes exactly
// what gets rendered.
//
// Incipits are consumed whole. Measures cut off by truncation are lost, not
// carried into the next page; the next page starts with a fresh incipit.

use log::trace;

use crate::corpus::Incipit;
use crate::error::PipelineError;
use crate::kern::LabelExporter;
use crate::layout::PageLayout;
use crate::musicxml::Score;

/// An incipit together with its normalized MusicXML.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefinedIncipit {
    pub incipit: Incipit,
    pub musicxml: String,
}

/// Everything known about one synthetic page before rendering.
#[derive(Clone, Debug)]
pub struct PageContent {
    identifier: String,
    domain: String,
    layout: PageLayout,
    incipits: Vec<RefinedIncipit>,
    score: Score,
    musicxml: String,
    kern: String,
}

impl PageContent {
    /// Stable name of the page, used for every file derived from it.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn layout(&self) -> &PageLayout {
        &self.layout
    }

    /// The incipits consumed for this page, in order.
    pub fn incipits(&self) -> &[RefinedIncipit] {
        &self.incipits
    }

    pub fn score(&self) -> &Score {
        &self.score
    }

    pub fn measure_count(&self) -> usize {
        self.score.measure_count()
    }

    /// The page score as handed to the renderer.
    pub fn musicxml(&self) -> &str {
        &self.musicxml
    }

    /// Label text for the whole page.
    pub fn kern(&self) -> &str {
        &self.kern
    }
}

/// Derive a page identifier from the key of the first incipit on it.
///
/// `./Corpus/pkg/000100134-1_1_1` with 2 incipits becomes
/// `Corpus_pkg_000100134-1_1_1_len2`.
pub fn page_identifier(first_key: &str, incipit_count: usize) -> String {
    let key = first_key.strip_prefix("./").unwrap_or(first_key);
    let key = key.trim_matches('/');

    // Drop the extension of the last segment, if it has one.
    let last_segment_start = key.rfind('/').map_or(0, |i| i + 1);
    let key = match key[last_segment_start..].rfind('.') {
        Some(dot) if dot > 0 => &key[..last_segment_start + dot],
        _ => key,
    };

    let mut id: String = key.chars().filter(|c| *c != '.').collect();
    id = id.replace('/', "_");
    format!("{id}_len{incipit_count}")
}

/// Pull enough incipits from `upstream` to fill `layout` and build the page.
///
/// Returns `Ok(None)` once the upstream is exhausted without yielding a
/// single measure. A short final page (upstream ran out part way) is still
/// built from whatever was collected.
pub fn pull_page<I>(
    upstream: &mut I,
    layout: PageLayout,
    domain: &str,
    exporter: &dyn LabelExporter,
) -> Result<Option<PageContent>, PipelineError>
where
    I: Iterator<Item = Result<RefinedIncipit, PipelineError>> + ?Sized,
{
    let wanted = layout.total_measures();
    let mut incipits = Vec::new();
    let mut scores = Vec::new();
    let mut taken = 0;

    while taken < wanted {
        let Some(item) = upstream.next() else { break };
        let refined = item?;
        let mut score = Score::parse(&refined.musicxml)?;
        let graces = score.remove_grace_notes();
        if graces > 0 {
            trace!("Removed {graces} grace note(s) from {}", refined.incipit.key);
        }
        taken += score.measure_count();
        scores.push(score);
        incipits.push(refined);
    }

    if taken == 0 {
        return Ok(None);
    }

    let mut score = Score::concatenate(scores)?;
    score.truncate(wanted);
    score.insert_system_breaks(&layout);
    let musicxml = score.to_musicxml();
    let kern = exporter.export(&musicxml)?;

    let identifier = page_identifier(&incipits[0].incipit.key, incipits.len());
    Ok(Some(PageContent {
        identifier,
        domain: domain.to_string(),
        layout,
        incipits,
        score,
        musicxml,
        kern,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScoreError;
    use crate::kern::KernExporter;
    use crate::musicxml::tests::score_xml;

    fn refined(key: &str, measures: usize) -> Result<RefinedIncipit, PipelineError> {
        let whole = "<note><pitch><step>C</step><octave>4</octave></pitch><duration>4</duration><type>whole</type></note>";
        let bodies: Vec<&str> = vec![whole; measures];
        Ok(RefinedIncipit {
            incipit: Incipit {
                key: key.to_string(),
                agnostic: String::new(),
                mei: String::new(),
            },
            musicxml: score_xml(&bodies),
        })
    }

    fn upstream() -> Vec<Result<RefinedIncipit, PipelineError>> {
        vec![refined("C/p/K1", 2), refined("C/p/K2", 3), refined("C/p/K3", 4)]
    }

    #[test]
    fn test_identifier_rules() {
        assert_eq!(page_identifier("./foo/bar.mei", 2), "foo_bar_len2");
        assert_eq!(page_identifier("/foo/bar/", 1), "foo_bar_len1");
        assert_eq!(page_identifier("a.b/c.d.e", 3), "ab_cd_len3");
        assert_eq!(
            page_identifier("Corpus/package_aa/000100134-1_1_1", 2),
            "Corpus_package_aa_000100134-1_1_1_len2"
        );
    }

    #[test]
    fn test_exact_fit_consumes_two() {
        let mut items = upstream().into_iter();
        let page = pull_page(&mut items, PageLayout::new(vec![2, 3]), "M", &KernExporter)
            .unwrap()
            .unwrap();
        assert_eq!(page.incipits().len(), 2);
        assert_eq!(page.measure_count(), 5);
        assert_eq!(page.identifier(), "C_p_K1_len2");
        assert_eq!(page.domain(), "M");
        // K3 is still upstream.
        assert_eq!(items.next().unwrap().unwrap().incipit.key, "C/p/K3");
    }

    #[test]
    fn test_overshoot_is_truncated() {
        let mut items = upstream().into_iter();
        let page = pull_page(&mut items, PageLayout::new(vec![2, 2]), "M", &KernExporter)
            .unwrap()
            .unwrap();
        assert_eq!(page.incipits().len(), 2);
        assert_eq!(page.measure_count(), 4);
        let breaks: Vec<_> = page
            .score()
            .measures()
            .iter()
            .map(|m| m.system_break)
            .collect();
        assert_eq!(breaks, vec![false, false, true, false]);
        assert_eq!(page.musicxml().matches("new-system=\"yes\"").count(), 1);
        assert_eq!(page.kern().matches("\n=").count(), 3);
    }

    #[test]
    fn test_short_final_page_then_exhaustion() {
        let mut items = vec![refined("C/p/K1", 2)].into_iter();
        let page = pull_page(&mut items, PageLayout::new(vec![4, 4]), "C", &KernExporter)
            .unwrap()
            .unwrap();
        assert_eq!(page.measure_count(), 2);
        assert!(
            pull_page(&mut items, PageLayout::new(vec![4]), "C", &KernExporter)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_empty_upstream_is_exhaustion() {
        let mut items = std::iter::empty::<Result<RefinedIncipit, PipelineError>>();
        assert!(
            pull_page(&mut items, PageLayout::new(vec![3]), "M", &KernExporter)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_upstream_error_propagates() {
        let mut items = vec![
            refined("C/p/K1", 1),
            Err(PipelineError::Score(ScoreError::NoPart)),
        ]
        .into_iter();
        let result = pull_page(&mut items, PageLayout::new(vec![3]), "M", &KernExporter);
        assert!(matches!(result, Err(PipelineError::Score(ScoreError::NoPart))));
    }

    #[test]
    fn test_unparseable_musicxml_is_fatal() {
        let mut items = vec![Ok(RefinedIncipit {
            incipit: Incipit {
                key: "C/p/bad".into(),
                agnostic: String::new(),
                mei: String::new(),
            },
            musicxml: "<score-partwise><part>".into(),
        })]
        .into_iter();
        let result = pull_page(&mut items, PageLayout::new(vec![3]), "M", &KernExporter);
        assert!(matches!(result, Err(PipelineError::Score(ScoreError::Xml(_)))));
    }

    #[test]
    fn test_same_input_same_page() {
        let build = || {
            let mut items = upstream().into_iter();
            pull_page(&mut items, PageLayout::new(vec![3, 3]), "M", &KernExporter)
                .unwrap()
                .unwrap()
        };
        let (a, b) = (build(), build());
        assert_eq!(a.identifier(), b.identifier());
        assert_eq!(a.musicxml(), b.musicxml());
        assert_eq!(a.kern(), b.kern());
    }
}
