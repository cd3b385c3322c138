//! Analysis configuration
//!
//! Every stage has its own option struct with `Default` and `validate()`.
//! `AnalysisConfig` bundles them into one JSON document describing a whole
//! pipeline run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::effects::MaxmargOptions;
use crate::error::QtlError;
use crate::genoprob::GenoprobOptions;
use crate::kinship::KinshipOptions;
use crate::map::PseudomarkerOptions;
use crate::peaks::PeakOptions;
use crate::perm::PermOptions;
use crate::scan::ScanOptions;

/// Build a rayon pool with `cores` threads (0 = all hardware threads).
pub fn thread_pool(cores: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(cores)
        .build()
        .context("Failed to build thread pool")
}

/// Full pipeline description for `qtlx run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// JSON control file of the cross
    pub cross: PathBuf,
    pub output_dir: PathBuf,
    /// Phenotype columns to analyse (all when absent)
    pub phenotypes: Option<Vec<String>>,
    /// Covariate columns used as additive covariates (none when absent)
    pub covariates: Option<Vec<String>>,
    pub pseudomarkers: PseudomarkerOptions,
    pub genoprob: GenoprobOptions,
    /// Kinship for a mixed-model scan; Haley-Knott when absent
    pub kinship: Option<KinshipOptions>,
    pub scan: ScanOptions,
    /// Permutation thresholds; `threshold` is used when absent
    pub perm: Option<PermOptions>,
    /// Covariate column whose levels restrict permutations
    pub strata: Option<String>,
    pub alpha: f64,
    pub threshold: f64,
    pub peaks: PeakOptions,
    pub maxmarg: MaxmargOptions,
    /// Overrides the thread count of every stage
    pub cores: Option<usize>,
    pub plots: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cross: PathBuf::new(),
            output_dir: PathBuf::from("qtlx_out"),
            phenotypes: None,
            covariates: None,
            pseudomarkers: PseudomarkerOptions::default(),
            genoprob: GenoprobOptions::default(),
            kinship: None,
            scan: ScanOptions::default(),
            perm: None,
            strata: None,
            alpha: 0.05,
            threshold: 3.0,
            peaks: PeakOptions::default(),
            maxmarg: MaxmargOptions::default(),
            cores: None,
            plots: true,
        }
    }
}

impl AnalysisConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut cfg: Self = serde_json::from_str(&text)
            .map_err(|e| QtlError::parse(path.display().to_string(), e.line(), e.to_string()))?;

        // Relative paths are taken from the config file's directory
        if let Some(dir) = path.parent() {
            if cfg.cross.is_relative() {
                cfg.cross = dir.join(&cfg.cross);
            }
        }
        Ok(cfg)
    }

    /// Push the global thread count into every stage.
    pub fn apply_cores(&mut self) {
        if let Some(cores) = self.cores {
            self.genoprob.cores = cores;
            self.scan.cores = cores;
            if let Some(k) = self.kinship.as_mut() {
                k.cores = cores;
            }
            if let Some(p) = self.perm.as_mut() {
                p.cores = cores;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cross.as_os_str().is_empty() {
            return Err(QtlError::config("config has no cross control file").into());
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(
                QtlError::config(format!("alpha must be in (0, 1), got {}", self.alpha)).into(),
            );
        }
        if !self.threshold.is_finite() {
            return Err(QtlError::config("threshold must be finite").into());
        }
        self.pseudomarkers.validate()?;
        self.genoprob.validate()?;
        self.scan.validate()?;
        if let Some(p) = &self.perm {
            p.validate()?;
        }
        if self.strata.is_some() && self.perm.is_none() {
            return Err(QtlError::config("strata given without permutations").into());
        }
        self.peaks.validate()?;
        self.maxmarg.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let cfg = AnalysisConfig {
            cross: PathBuf::from("cross.json"),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_file_resolves_cross_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"cross": "iron.json", "pseudomarkers": {{"step": 1.0}}, "perm": {{"n_perm": 50, "seed": 7}}}}"#
        )
        .unwrap();

        let cfg = AnalysisConfig::from_file(&path).unwrap();
        assert_eq!(cfg.cross, dir.path().join("iron.json"));
        assert_eq!(cfg.pseudomarkers.step, 1.0);
        assert_eq!(cfg.perm.as_ref().unwrap().n_perm, 50);
        assert!(cfg.kinship.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_bad_alpha_is_config_error() {
        let cfg = AnalysisConfig {
            cross: PathBuf::from("cross.json"),
            alpha: 1.5,
            ..Default::default()
        };
        assert!(QtlError::is_config(&cfg.validate().unwrap_err()));
    }

    #[test]
    fn test_thread_pool() {
        let pool = thread_pool(2).unwrap();
        assert_eq!(pool.current_num_threads(), 2);
    }
}
