//! Permutation thresholds for genome scans
//!
//! Each replicate shuffles the phenotype rows (together with their covariate
//! rows) against fixed genotype probabilities and kinship, reruns the scan
//! and records the genome-wide maximum LOD per phenotype. The (1 - alpha)
//! quantile of those maxima is the genome-wide significance threshold.
//!
//! Replicate i draws from `StdRng::seed_from_u64(seed + i)`, so results
//! depend only on the seed, not on the thread count.

use anyhow::Result;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};
use std::collections::{BTreeMap, HashMap};

use crate::config::thread_pool;
use crate::error::QtlError;
use crate::genoprob::Genoprobs;
use crate::model::{Alignment, EigenCache};
use crate::scan::{check_kinship, scan_aligned, ScanOptions};
use crate::types::{CovariateMatrix, Kinship, PhenotypeTable};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermOptions {
    pub n_perm: usize,
    pub seed: u64,
    /// Worker threads (0 = all available)
    pub cores: usize,
}

impl Default for PermOptions {
    fn default() -> Self {
        Self {
            n_perm: 1000,
            seed: 0,
            cores: 0,
        }
    }
}

impl PermOptions {
    pub fn validate(&self) -> Result<()> {
        if self.n_perm == 0 {
            return Err(QtlError::config("n_perm must be at least 1").into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PermutationResult {
    pub pheno_names: Vec<String>,
    /// replicates x phenotypes, genome-wide maximum LOD
    pub maxlod: Array2<f64>,
    pub seed: u64,
}

impl PermutationResult {
    pub fn n_perm(&self) -> usize {
        self.maxlod.nrows()
    }

    /// (1 - alpha) quantile of the maximum LOD, per phenotype.
    pub fn thresholds(&self, alpha: f64) -> Result<Vec<f64>> {
        check_alpha(alpha)?;
        Ok((0..self.maxlod.ncols())
            .map(|j| {
                let vals: Vec<f64> = self
                    .maxlod
                    .column(j)
                    .iter()
                    .copied()
                    .filter(|v| !v.is_nan())
                    .collect();
                if vals.is_empty() {
                    return f64::NAN;
                }
                Data::new(vals).quantile(1.0 - alpha)
            })
            .collect())
    }

    /// Thresholds at several levels: alphas x phenotypes.
    pub fn summary(&self, alphas: &[f64]) -> Result<Array2<f64>> {
        let mut out = Array2::<f64>::zeros((alphas.len(), self.maxlod.ncols()));
        for (a, &alpha) in alphas.iter().enumerate() {
            for (j, t) in self.thresholds(alpha)?.into_iter().enumerate() {
                out[(a, j)] = t;
            }
        }
        Ok(out)
    }
}

fn check_alpha(alpha: f64) -> Result<()> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(QtlError::config(format!("alpha must be in (0, 1), got {}", alpha)).into());
    }
    Ok(())
}

/// Permutation test for `scan1`.
///
/// `strata` maps individual ID to a stratum label; when given, phenotypes
/// are only shuffled among individuals of the same stratum.
pub fn scan1perm(
    probs: &Genoprobs,
    pheno: &PhenotypeTable,
    kinship: Option<&Kinship>,
    addcovar: Option<&CovariateMatrix>,
    scan_opts: &ScanOptions,
    opts: &PermOptions,
    strata: Option<&HashMap<String, String>>,
) -> Result<PermutationResult> {
    opts.validate()?;
    scan_opts.validate()?;
    check_kinship(probs, kinship)?;
    let align = Alignment::new(probs, pheno, addcovar, kinship)?;
    let groups = strata_groups(&align, strata)?;

    tracing::info!(
        "scan1perm: {} permutations, {} individuals, {} phenotypes, seed {}",
        opts.n_perm,
        align.len(),
        pheno.n_pheno(),
        opts.seed
    );

    let method = scan_opts.method();
    let pool = thread_pool(opts.cores)?;
    let cache = EigenCache::default();
    let rows: Vec<Vec<f64>> = pool.install(|| {
        (0..opts.n_perm)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(opts.seed.wrapping_add(i as u64));
                let order = permutation(&groups, align.len(), &mut rng);
                let permuted = align.permuted(&order);
                let scan = scan_aligned(probs, pheno, kinship, addcovar, &permuted, method, &cache)?;
                Ok(scan.max_lod())
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let n_pheno = pheno.n_pheno();
    let maxlod = Array2::from_shape_fn((opts.n_perm, n_pheno), |(i, j)| rows[i][j]);
    tracing::debug!("scan1perm: done");

    Ok(PermutationResult {
        pheno_names: pheno.names.clone(),
        maxlod,
        seed: opts.seed,
    })
}

/// Aligned indices grouped by stratum (one group without strata).
fn strata_groups(
    align: &Alignment,
    strata: Option<&HashMap<String, String>>,
) -> Result<Vec<Vec<usize>>> {
    let Some(strata) = strata else {
        return Ok(vec![(0..align.len()).collect()]);
    };
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (k, id) in align.ids.iter().enumerate() {
        let s = strata.get(id).ok_or_else(|| {
            anyhow::Error::from(QtlError::invalid_data(format!(
                "individual '{}' has no permutation stratum",
                id
            )))
        })?;
        groups.entry(s.as_str()).or_default().push(k);
    }
    Ok(groups.into_values().collect())
}

/// order[k] = aligned individual whose phenotype k receives.
fn permutation(groups: &[Vec<usize>], n: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    for g in groups {
        let mut shuffled = g.clone();
        shuffled.shuffle(rng);
        for (&slot, &src) in g.iter().zip(&shuffled) {
            order[slot] = src;
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cross::CrossType;
    use crate::genoprob::ChromosomeProbs;
    use ndarray::Array3;

    fn toy(n: usize) -> (Genoprobs, PhenotypeTable) {
        let probs = Array3::from_shape_fn((n, 2, 3), |(i, g, k)| {
            let geno = if k == 1 { i % 2 } else { (i / 2 + k) % 2 };
            if geno == g {
                0.9
            } else {
                0.1
            }
        });
        let ids: Vec<String> = (0..n).map(|i| format!("ind{}", i)).collect();
        let gp = Genoprobs {
            crosstype: CrossType::DH,
            ind_ids: ids.clone(),
            alleles: vec!["A".into(), "B".into()],
            states: vec!["AA".into(), "BB".into()],
            is_allele: false,
            chromosomes: vec![ChromosomeProbs {
                chr: "1".into(),
                names: vec!["a".into(), "b".into(), "c".into()],
                positions: vec![0.0, 10.0, 20.0],
                is_marker: vec![true; 3],
                probs,
            }],
        };
        let values = Array2::from_shape_fn((n, 1), |(i, _)| {
            (i % 2) as f64 + ((i * 13) % 7) as f64 / 7.0
        });
        let pheno = PhenotypeTable::new(ids, vec!["y".into()], values).unwrap();
        (gp, pheno)
    }

    fn opts(n_perm: usize, seed: u64) -> PermOptions {
        PermOptions {
            n_perm,
            seed,
            cores: 2,
        }
    }

    #[test]
    fn test_same_seed_same_result() {
        let (gp, pheno) = toy(24);
        let so = ScanOptions::default();
        let a = scan1perm(&gp, &pheno, None, None, &so, &opts(20, 11), None).unwrap();
        let b = scan1perm(&gp, &pheno, None, None, &so, &opts(20, 11), None).unwrap();
        let c = scan1perm(&gp, &pheno, None, None, &so, &opts(20, 12), None).unwrap();
        assert_eq!(a.maxlod, b.maxlod);
        assert_ne!(a.maxlod, c.maxlod);
        assert_eq!(a.n_perm(), 20);
    }

    #[test]
    fn test_thresholds_monotone() {
        let (gp, pheno) = toy(24);
        let perm =
            scan1perm(&gp, &pheno, None, None, &ScanOptions::default(), &opts(50, 3), None)
                .unwrap();
        let t10 = perm.thresholds(0.10).unwrap()[0];
        let t05 = perm.thresholds(0.05).unwrap()[0];
        let t01 = perm.thresholds(0.01).unwrap()[0];
        assert!(t10 <= t05 && t05 <= t01);
        let s = perm.summary(&[0.10, 0.05]).unwrap();
        assert_eq!(s.dim(), (2, 1));
        assert_eq!(s[(1, 0)], t05);
    }

    #[test]
    fn test_invalid_options() {
        let (gp, pheno) = toy(10);
        let err = scan1perm(&gp, &pheno, None, None, &ScanOptions::default(), &opts(0, 1), None)
            .unwrap_err();
        assert!(QtlError::is_config(&err));

        let perm = PermutationResult {
            pheno_names: vec!["y".into()],
            maxlod: Array2::zeros((5, 1)),
            seed: 0,
        };
        assert!(QtlError::is_config(&perm.thresholds(0.0).unwrap_err()));
        assert!(QtlError::is_config(&perm.thresholds(1.0).unwrap_err()));
    }

    #[test]
    fn test_strata_respected() {
        let mut rng = StdRng::seed_from_u64(5);
        let groups = vec![vec![0, 2, 4], vec![1, 3, 5]];
        for _ in 0..20 {
            let order = permutation(&groups, 6, &mut rng);
            for (k, &src) in order.iter().enumerate() {
                assert_eq!(k % 2, src % 2);
            }
        }
    }

    #[test]
    fn test_missing_stratum_is_error() {
        let (gp, pheno) = toy(6);
        let strata: HashMap<String, String> =
            [("ind0".to_string(), "a".to_string())].into_iter().collect();
        let err = scan1perm(
            &gp,
            &pheno,
            None,
            None,
            &ScanOptions::default(),
            &opts(2, 1),
            Some(&strata),
        )
        .unwrap_err();
        assert!(QtlError::is_invalid_data(&err));
    }
}
