// Run configuration.
//
// Everything a synthesis run can be tuned with lives in `SynthConfig`,
// loaded from JSON. Every field has a default, so a config file only needs
// to name what it changes; `synthesize print-config` dumps the full default
// config as a starting point.
//
// Domains are an ordered list rather than a map: the domain draw picks an
// index by weight, and a fixed order keeps that draw reproducible for a
// given seed.
//
// See also: `synth.rs` which consumes the config, `layout.rs` for
// `LayoutDistribution`, `staff.rs` for `CropConfig`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::layout::LayoutDistribution;
use crate::refiner::{CommandJobRunner, RefineSettings};
use crate::render::CommandRenderer;
use crate::staff::CropConfig;

/// The external notation normalizer (MuseScore in job mode).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinerConfig {
    pub program: PathBuf,
    pub extra_args: Vec<String>,
    /// Incipits converted per tool invocation.
    pub batch_size: usize,
    /// Skip conversions whose output already exists.
    pub soft: bool,
    /// Kill the tool if one batch takes longer than this.
    pub timeout_secs: Option<u64>,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("mscore"),
            extra_args: Vec::new(),
            batch_size: 10,
            soft: false,
            timeout_secs: None,
        }
    }
}

impl RefinerConfig {
    pub fn runner(&self) -> CommandJobRunner {
        CommandJobRunner {
            program: self.program.clone(),
            extra_args: self.extra_args.clone(),
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }
}

/// The external handwritten-page renderer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub program: PathBuf,
    pub extra_args: Vec<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("render-handwritten-page"),
            extra_args: Vec::new(),
            timeout_secs: None,
        }
    }
}

/// A named page style with its sampling weight and layout distribution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    pub weight: f64,
    #[serde(flatten)]
    pub layout: LayoutDistribution,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Seed of the run's single random number generator.
    pub seed: u64,
    /// The PrIMuS archive (`.tgz`).
    pub archive: PathBuf,
    /// Root of the dataset tree.
    pub output_dir: PathBuf,
    /// Exchange files with external tools go here.
    pub scratch_dir: PathBuf,
    pub refiner: RefinerConfig,
    pub renderer: RendererConfig,
    pub domains: Vec<DomainConfig>,
    pub crop: CropConfig,
    pub bucket_count: u32,
    /// Stop after this many pages were attempted (`None` = whole corpus).
    pub max_pages: Option<usize>,
    /// Log progress every this many pages.
    pub progress_interval: usize,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            archive: PathBuf::from("data/primusCalvoRizoAppliedSciences2018.tgz"),
            output_dir: PathBuf::from("data/synthetic"),
            scratch_dir: PathBuf::from("data/tmp"),
            refiner: RefinerConfig::default(),
            renderer: RendererConfig::default(),
            domains: vec![
                DomainConfig {
                    name: "M".to_string(),
                    weight: 1.0,
                    layout: LayoutDistribution::domain_m(),
                },
                DomainConfig {
                    name: "C".to_string(),
                    weight: 1.0,
                    layout: LayoutDistribution::domain_c(),
                },
            ],
            crop: CropConfig::default(),
            bucket_count: 100,
            max_pages: None,
            progress_interval: 100,
        }
    }
}

impl SynthConfig {
    pub fn load(path: &Path) -> Result<SynthConfig, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SynthConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.domains.is_empty() {
            return invalid("at least one domain is required".into());
        }
        for domain in &self.domains {
            if domain.name.is_empty() || domain.name.contains(['/', '\\']) {
                return invalid(format!("domain name {:?} is not a directory name", domain.name));
            }
            if domain.weight.is_nan() || domain.weight <= 0.0 {
                return invalid(format!("domain {} needs a positive weight", domain.name));
            }
            if !domain.layout.is_valid() {
                return invalid(format!("domain {} has an empty layout range", domain.name));
            }
        }
        if self.refiner.batch_size == 0 {
            return invalid("refiner.batch_size must be at least 1".into());
        }
        if self.bucket_count == 0 {
            return invalid("bucket_count must be at least 1".into());
        }
        if self.progress_interval == 0 {
            return invalid("progress_interval must be at least 1".into());
        }
        if !self.crop.is_valid() {
            return invalid("crop margins and biases must be non-negative and ordered".into());
        }
        Ok(())
    }

    pub fn domain_weights(&self) -> Vec<f64> {
        self.domains.iter().map(|d| d.weight).collect()
    }

    pub fn refine_settings(&self) -> RefineSettings {
        RefineSettings {
            soft: self.refiner.soft,
            ..RefineSettings::mei_to_musicxml(&self.scratch_dir)
        }
    }

    pub fn renderer(&self) -> CommandRenderer {
        CommandRenderer {
            program: self.renderer.program.clone(),
            extra_args: self.renderer.extra_args.clone(),
            work_dir: self.scratch_dir.join("render"),
            timeout: self.renderer.timeout_secs.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_and_roundtrips() {
        let config = SynthConfig::default();
        config.validate().unwrap();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let restored: SynthConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let json = r#"{
            "seed": 7,
            "refiner": {"batch_size": 3},
            "domains": [
                {"name": "M", "weight": 2.0, "staves": [1, 1], "measures_per_staff": [2, 2]}
            ]
        }"#;
        let config: SynthConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.refiner.batch_size, 3);
        assert_eq!(config.refiner.program, PathBuf::from("mscore"));
        assert_eq!(config.domains.len(), 1);
        assert_eq!(config.domains[0].layout.staves, (1, 1));
        assert_eq!(config.bucket_count, 100);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = SynthConfig::default();
        config.refiner.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = SynthConfig::default();
        config.domains.clear();
        assert!(config.validate().is_err());

        let mut config = SynthConfig::default();
        config.domains[1].weight = 0.0;
        assert!(config.validate().is_err());

        let mut config = SynthConfig::default();
        config.domains[0].layout.measures_per_staff = (5, 3);
        assert!(config.validate().is_err());

        let mut config = SynthConfig::default();
        config.crop.margin_min = 3.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = SynthConfig::load(Path::new("/nonexistent/synth.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_validates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("synth.json");
        fs::write(&path, r#"{"bucket_count": 0}"#).unwrap();
        assert!(matches!(
            SynthConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
