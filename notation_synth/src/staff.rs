// Per-staff crops of a rendered page.
//
// The renderer reports which staff every measure ended up on. Before
// anything is cut, that assignment is checked against the page: staff `k`
// must hold one contiguous, non-empty run of measures starting right after
// staff `k-1` ended, and together the staves must cover every measure of
// the page exactly once. A violation means the renderer did not lay the page
// out as its MusicXML asked; the labels would no longer match the pixels, so
// it is reported as a `LayoutConsistencyError` and never patched up.
//
// The crop box of a staff is the union of its staffline bounds and all of
// its glyph boxes, grown by a random margin and shifted vertically by a
// random bias. Both are measured in staff spaces and drawn once per staff,
// margin first, from the run's `SynthRng`. The box is clipped to the page
// and rounded outwards to whole pixels.

use std::ops::RangeInclusive;

use image::RgbaImage;
use image::imageops::crop_imm;
use notation_synth_prng::SynthRng;
use serde::{Deserialize, Serialize};

use crate::error::LayoutConsistencyError;
use crate::kern::slice_measures;
use crate::page::PageContent;
use crate::render::{PageGeometry, RenderedPage, StaffGeometry};

/// Crop randomization, in staff spaces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    /// Margin added on every side, drawn uniformly from
    /// `[margin_min, margin_max)`.
    pub margin_min: f64,
    pub margin_max: f64,
    /// Vertical shift drawn uniformly from `[-bias_up, bias_down)`; positive
    /// moves the box down.
    pub bias_up: f64,
    pub bias_down: f64,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            margin_min: 1.0,
            margin_max: 2.5,
            bias_up: 0.5,
            bias_down: 0.5,
        }
    }
}

impl CropConfig {
    pub fn is_valid(&self) -> bool {
        self.margin_min >= 0.0
            && self.margin_min <= self.margin_max
            && self.bias_up >= 0.0
            && self.bias_down >= 0.0
    }
}

/// Integer pixel box inside a page bitmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One staff cut out of a page, with its label.
#[derive(Clone, Debug)]
pub struct StaffRecord {
    pub staff_index: usize,
    /// Page measures on this staff, 0-based and inclusive.
    pub measures: RangeInclusive<usize>,
    pub crop: PixelRect,
    pub image: RgbaImage,
    pub kern: String,
}

/// Check the rendered measure-to-staff assignment and return the measure
/// range of every staff, in staff order.
pub fn staff_measure_ranges(
    geometry: &PageGeometry,
    total_measures: usize,
) -> Result<Vec<RangeInclusive<usize>>, LayoutConsistencyError> {
    if geometry.measure_staff.len() != total_measures {
        return Err(LayoutConsistencyError::MeasureCount {
            rendered: geometry.measure_staff.len(),
            expected: total_measures,
        });
    }

    let mut per_staff: Vec<Vec<usize>> = vec![Vec::new(); geometry.staves.len()];
    for (measure, &staff) in geometry.measure_staff.iter().enumerate() {
        per_staff
            .get_mut(staff)
            .ok_or(LayoutConsistencyError::UnknownStaff { measure, staff })?
            .push(measure);
    }

    let mut ranges = Vec::with_capacity(per_staff.len());
    let mut expected_start = 0;
    for (staff, measures) in per_staff.into_iter().enumerate() {
        let (Some(&first), Some(&last)) = (measures.first(), measures.last()) else {
            return Err(LayoutConsistencyError::EmptyStaff { staff });
        };
        if last - first + 1 != measures.len() {
            return Err(LayoutConsistencyError::Discontiguous { staff, measures });
        }
        if first != expected_start {
            return Err(LayoutConsistencyError::Gap {
                staff,
                expected: expected_start,
                actual: first,
            });
        }
        expected_start = last + 1;
        ranges.push(first..=last);
    }
    Ok(ranges)
}

/// Randomized crop box for one staff, clipped to a `page_width` x
/// `page_height` bitmap. Consumes exactly two draws from `rng`.
pub fn crop_box(
    staff: &StaffGeometry,
    config: &CropConfig,
    page_width: u32,
    page_height: u32,
    rng: &mut SynthRng,
) -> PixelRect {
    let content = staff
        .glyphs
        .iter()
        .fold(staff.bounds, |acc, glyph| acc.union(glyph));
    let margin = staff.staff_space * rng.range_f64(config.margin_min, config.margin_max);
    let bias = staff.staff_space * rng.range_f64(-config.bias_up, config.bias_down);

    let (w, h) = (f64::from(page_width), f64::from(page_height));
    let left = (content.x - margin).clamp(0.0, w);
    let right = (content.right() + margin).clamp(0.0, w);
    let top = (content.y - margin + bias).clamp(0.0, h);
    let bottom = (content.bottom() + margin + bias).clamp(0.0, h);

    let (x0, x1) = pixel_span(left, right, page_width);
    let (y0, y1) = pixel_span(top, bottom, page_height);
    PixelRect {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    }
}

/// Round a clipped span outwards to whole pixels, keeping at least one pixel
/// when the page has any.
fn pixel_span(low: f64, high: f64, limit: u32) -> (u32, u32) {
    let start = (low.floor() as u32).min(limit.saturating_sub(1));
    let end = (high.ceil() as u32).clamp(start.saturating_add(1).min(limit), limit);
    (start, end)
}

/// Cut every staff of a rendered page out, each with its slice of the page
/// label.
pub fn extract_staves(
    rendered: &RenderedPage,
    page: &PageContent,
    config: &CropConfig,
    rng: &mut SynthRng,
) -> Result<Vec<StaffRecord>, LayoutConsistencyError> {
    let ranges = staff_measure_ranges(&rendered.geometry, page.measure_count())?;
    let (width, height) = rendered.image.dimensions();

    let records = rendered
        .geometry
        .staves
        .iter()
        .zip(ranges)
        .enumerate()
        .map(|(staff_index, (staff, measures))| {
            let crop = crop_box(staff, config, width, height, rng);
            let image = crop_imm(&rendered.image, crop.x, crop.y, crop.width, crop.height).to_image();
            let kern = slice_measures(page.kern(), *measures.start(), *measures.end());
            StaffRecord {
                staff_index,
                measures,
                crop,
                image,
                kern,
            }
        })
        .collect();
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::Incipit;
    use crate::kern::KernExporter;
    use crate::layout::PageLayout;
    use crate::musicxml::tests::score_xml;
    use crate::page::{RefinedIncipit, pull_page};
    use crate::render::Rect;
    use image::Rgba;

    fn staff(y: f64) -> StaffGeometry {
        StaffGeometry {
            bounds: Rect::new(50.0, y, 400.0, 40.0),
            glyphs: vec![],
            staff_space: 10.0,
        }
    }

    fn geometry(measure_staff: Vec<usize>, staves: usize) -> PageGeometry {
        PageGeometry {
            staves: (0..staves).map(|i| staff(100.0 + 150.0 * i as f64)).collect(),
            measure_staff,
            page_count: 1,
        }
    }

    #[test]
    fn ranges_partition_the_page() {
        let ranges = staff_measure_ranges(&geometry(vec![0, 0, 0, 1, 1, 2, 2, 2, 2], 3), 9).unwrap();
        assert_eq!(ranges, vec![0..=2, 3..=4, 5..=8]);
    }

    #[test]
    fn measure_count_mismatch() {
        assert_eq!(
            staff_measure_ranges(&geometry(vec![0, 0, 1], 2), 4),
            Err(LayoutConsistencyError::MeasureCount {
                rendered: 3,
                expected: 4
            })
        );
    }

    #[test]
    fn unknown_staff() {
        assert_eq!(
            staff_measure_ranges(&geometry(vec![0, 2], 2), 2),
            Err(LayoutConsistencyError::UnknownStaff {
                measure: 1,
                staff: 2
            })
        );
    }

    #[test]
    fn empty_staff() {
        assert_eq!(
            staff_measure_ranges(&geometry(vec![0, 0, 2], 3), 3),
            Err(LayoutConsistencyError::EmptyStaff { staff: 1 })
        );
    }

    #[test]
    fn discontiguous_staff() {
        assert_eq!(
            staff_measure_ranges(&geometry(vec![0, 1, 0, 1], 2), 4),
            Err(LayoutConsistencyError::Discontiguous {
                staff: 0,
                measures: vec![0, 2]
            })
        );
    }

    #[test]
    fn out_of_order_staves() {
        assert_eq!(
            staff_measure_ranges(&geometry(vec![1, 1, 0, 0], 2), 4),
            Err(LayoutConsistencyError::Gap {
                staff: 0,
                expected: 0,
                actual: 2
            })
        );
    }

    #[test]
    fn crop_box_without_randomness() {
        let config = CropConfig {
            margin_min: 1.0,
            margin_max: 1.0,
            bias_up: 0.0,
            bias_down: 0.0,
        };
        let mut s = staff(100.0);
        s.glyphs.push(Rect::new(60.0, 80.5, 10.0, 30.0));
        let mut rng = SynthRng::new(1);
        let crop = crop_box(&s, &config, 1000, 1000, &mut rng);
        // Content spans x 50..450, y 80.5..140; margin 10 on every side.
        assert_eq!(
            crop,
            PixelRect {
                x: 40,
                y: 70,
                width: 420,
                height: 80
            }
        );
    }

    #[test]
    fn crop_box_is_clipped_to_page() {
        let config = CropConfig {
            margin_min: 5.0,
            margin_max: 5.0,
            bias_up: 0.0,
            bias_down: 0.0,
        };
        let mut rng = SynthRng::new(1);
        let crop = crop_box(&staff(10.0), &config, 300, 120, &mut rng);
        assert_eq!(
            crop,
            PixelRect {
                x: 0,
                y: 0,
                width: 300,
                height: 100
            }
        );
    }

    #[test]
    fn crop_box_stays_within_margin_and_bias() {
        let config = CropConfig::default();
        let mut rng = SynthRng::new(99);
        for _ in 0..200 {
            let crop = crop_box(&staff(400.0), &config, 2000, 2000, &mut rng);
            // margin in [10, 25) px, bias in [-5, 5) px
            assert!((25..=40).contains(&crop.x), "{crop:?}");
            assert!((370..=395).contains(&crop.y), "{crop:?}");
            assert!(crop.y + crop.height <= 470, "{crop:?}");
        }
    }

    /// A five-measure page (C D E F G, treble clef up front) laid out 2 + 3.
    fn five_measure_page() -> PageContent {
        let whole = |step: &str| {
            format!(
                "<note><pitch><step>{step}</step><octave>4</octave></pitch><duration>4</duration><type>whole</type></note>"
            )
        };
        let first = format!(
            "<attributes><divisions>1</divisions><clef><sign>G</sign><line>2</line></clef></attributes>{}",
            whole("C")
        );
        let rest: Vec<String> = ["D", "E", "F", "G"].into_iter().map(whole).collect();
        let mut bodies = vec![first.as_str()];
        bodies.extend(rest.iter().map(String::as_str));
        let refined = RefinedIncipit {
            incipit: Incipit {
                key: "Corpus/p/five".into(),
                agnostic: String::new(),
                mei: String::new(),
            },
            musicxml: score_xml(&bodies),
        };
        let mut upstream = std::iter::once(Ok(refined));
        pull_page(&mut upstream, PageLayout::new(vec![2, 3]), "M", &KernExporter)
            .unwrap()
            .unwrap()
    }

    /// A page bitmap whose pixels encode their own coordinates.
    fn rendered(measure_staff: Vec<usize>) -> RenderedPage {
        let image = RgbaImage::from_fn(500, 400, |x, y| Rgba([(x % 256) as u8, (y % 256) as u8, 0, 255]));
        RenderedPage {
            image,
            geometry: geometry(measure_staff, 2),
        }
    }

    #[test]
    fn extract_staves_cuts_and_labels_every_staff() {
        let page = five_measure_page();
        let rendered = rendered(vec![0, 0, 1, 1, 1]);
        let mut rng = SynthRng::new(17);
        let staves = extract_staves(&rendered, &page, &CropConfig::default(), &mut rng).unwrap();

        assert_eq!(staves.len(), 2);
        let ranges: Vec<_> = staves.iter().map(|s| s.measures.clone()).collect();
        assert_eq!(ranges, vec![0..=1, 2..=4]);
        let covered: usize = staves.iter().map(|s| s.measures.clone().count()).sum();
        assert_eq!(covered, page.measure_count());

        for (i, staff) in staves.iter().enumerate() {
            assert_eq!(staff.staff_index, i);
            assert_eq!(staff.image.dimensions(), (staff.crop.width, staff.crop.height));
            assert_eq!(
                staff.image.get_pixel(0, 0),
                rendered.image.get_pixel(staff.crop.x, staff.crop.y)
            );
            assert_eq!(
                staff.kern,
                slice_measures(page.kern(), *staff.measures.start(), *staff.measures.end())
            );
        }
        assert_eq!(staves[0].kern, "**kern\n*clefG2\n1c\n=\n1d");
        assert_eq!(staves[1].kern, "**kern\n*clefG2\n1e\n=\n1f\n=\n1g");
    }

    #[test]
    fn extract_staves_draws_two_values_per_staff() {
        let page = five_measure_page();
        let rendered = rendered(vec![0, 0, 1, 1, 1]);
        let mut rng = SynthRng::new(3);
        let mut reference = rng.clone();
        extract_staves(&rendered, &page, &CropConfig::default(), &mut rng).unwrap();
        for _ in 0..4 {
            reference.next_u64();
        }
        assert_eq!(rng.next_u64(), reference.next_u64());
    }

    #[test]
    fn extract_staves_rejects_interleaved_staves() {
        let page = five_measure_page();
        let rendered = rendered(vec![0, 1, 0, 1, 1]);
        let mut rng = SynthRng::new(3);
        let err = extract_staves(&rendered, &page, &CropConfig::default(), &mut rng).unwrap_err();
        assert_eq!(
            err,
            LayoutConsistencyError::Discontiguous {
                staff: 0,
                measures: vec![0, 2]
            }
        );
    }

    #[test]
    fn degenerate_page_still_yields_a_pixel() {
        let mut rng = SynthRng::new(5);
        let crop = crop_box(&staff(5000.0), &CropConfig::default(), 10, 10, &mut rng);
        assert!(crop.x + crop.width <= 10);
        assert!(crop.y + crop.height <= 10);
        assert!(crop.width >= 1 && crop.height >= 1);
    }
}
