// Page layouts: how many staves a page has and how many measures each holds.
//
// A layout is sampled per page from the distribution of the page's domain
// (see `config::DomainConfig`): first the staff count, then one
// measures-per-staff draw for every staff, all from the run's `SynthRng`.
// The page assembler pulls incipits until it has `total_measures()`, and
// system breaks are placed at the cumulative staff boundaries.

use notation_synth_prng::SynthRng;
use serde::{Deserialize, Serialize};

/// Inclusive ranges a layout is drawn from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutDistribution {
    /// Staves per page, `(min, max)` inclusive.
    pub staves: (usize, usize),
    /// Measures on each staff, `(min, max)` inclusive.
    pub measures_per_staff: (usize, usize),
}

impl LayoutDistribution {
    /// Handwritten single-voice pages: a few long-ish staves.
    pub fn domain_m() -> Self {
        Self {
            staves: (3, 4),
            measures_per_staff: (3, 5),
        }
    }

    /// Dense pages: many short staves.
    pub fn domain_c() -> Self {
        Self {
            staves: (8, 12),
            measures_per_staff: (2, 4),
        }
    }

    /// Both ranges non-empty and strictly positive.
    pub fn is_valid(&self) -> bool {
        let (s_min, s_max) = self.staves;
        let (m_min, m_max) = self.measures_per_staff;
        s_min >= 1 && s_min <= s_max && m_min >= 1 && m_min <= m_max
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLayout {
    /// One entry per staff, top to bottom; each at least 1.
    pub measures_per_staff: Vec<usize>,
}

impl PageLayout {
    pub fn new(measures_per_staff: Vec<usize>) -> Self {
        Self { measures_per_staff }
    }

    pub fn sample(rng: &mut SynthRng, distribution: &LayoutDistribution) -> Self {
        let (s_min, s_max) = distribution.staves;
        let (m_min, m_max) = distribution.measures_per_staff;
        let staves = rng.range_usize_inclusive(s_min, s_max);
        let measures_per_staff = (0..staves)
            .map(|_| rng.range_usize_inclusive(m_min, m_max))
            .collect();
        Self { measures_per_staff }
    }

    pub fn staff_count(&self) -> usize {
        self.measures_per_staff.len()
    }

    /// Measures the page needs.
    pub fn total_measures(&self) -> usize {
        self.measures_per_staff.iter().sum()
    }

    /// Cumulative measure counts at the end of each staff.
    pub fn staff_boundaries(&self) -> Vec<usize> {
        self.measures_per_staff
            .iter()
            .scan(0, |acc, &n| {
                *acc += n;
                Some(*acc)
            })
            .collect()
    }
}
