//! Genome scan with a single-QTL model
//!
//! At every position the phenotype is regressed on the genotype
//! probabilities (Haley-Knott regression) plus additive covariates, and the
//! fit is compared to the null model of intercept plus covariates:
//!
//!   LOD = n/2 * log10(RSS0 / RSS1)
//!
//! With a kinship matrix the scan uses a linear mixed model. Heritability is
//! estimated once per phenotype under the null model (per chromosome with
//! LOCO kinship); with it fixed, both models are fitted by weighted least
//! squares on the eigen-rotated data.

use anyhow::Result;
use lmm_rs::{fit_rss, KinshipEigen, Method, DEFAULT_TOL};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::thread_pool;
use crate::error::QtlError;
use crate::genoprob::Genoprobs;
use crate::model::{
    column_data, kinship_rows, lod_score, Alignment, ColumnData, EigenCache, NullFit,
};
use crate::types::{CovariateMatrix, Kinship, PhenotypeTable};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Estimate heritability by REML (otherwise ML); LMM scans only
    pub reml: bool,
    /// Worker threads (0 = all available)
    pub cores: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            reml: true,
            cores: 0,
        }
    }
}

impl ScanOptions {
    pub fn method(&self) -> Method {
        if self.reml {
            Method::REML
        } else {
            Method::ML
        }
    }

    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// LOD scores along one chromosome.
#[derive(Debug, Clone)]
pub struct ChromosomeScan {
    pub chr: String,
    pub names: Vec<String>,
    pub positions: Vec<f64>,
    pub is_marker: Vec<bool>,
    /// positions x phenotypes
    pub lod: Array2<f64>,
}

/// Null-model heritability, one row per kinship matrix.
#[derive(Debug, Clone)]
pub struct HsqTable {
    /// "overall", or the chromosome each LOCO matrix was used for
    pub labels: Vec<String>,
    /// labels x phenotypes
    pub values: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub pheno_names: Vec<String>,
    /// Individuals used per phenotype
    pub n_ind: Vec<usize>,
    pub chromosomes: Vec<ChromosomeScan>,
    pub hsq: Option<HsqTable>,
}

impl ScanResult {
    pub fn n_pheno(&self) -> usize {
        self.pheno_names.len()
    }

    pub fn n_positions(&self) -> usize {
        self.chromosomes.iter().map(|c| c.positions.len()).sum()
    }

    pub fn chr(&self, chr: &str) -> Option<&ChromosomeScan> {
        self.chromosomes.iter().find(|c| c.chr == chr)
    }

    pub fn pheno_index(&self, name: &str) -> Option<usize> {
        self.pheno_names.iter().position(|p| p == name)
    }

    /// Genome-wide maximum LOD per phenotype (NaN if nothing was scanned).
    pub fn max_lod(&self) -> Vec<f64> {
        (0..self.n_pheno())
            .map(|j| {
                self.chromosomes
                    .iter()
                    .flat_map(|c| c.lod.column(j).to_vec())
                    .filter(|v| !v.is_nan())
                    .fold(f64::NAN, f64::max)
            })
            .collect()
    }

    /// (chromosome, position name, position, LOD) of the genome-wide maximum
    /// for one phenotype; the first position wins ties.
    pub fn max_position(&self, col: usize) -> Option<(&str, &str, f64, f64)> {
        let mut best: Option<(&str, &str, f64, f64)> = None;
        for c in &self.chromosomes {
            for (k, &lod) in c.lod.column(col).iter().enumerate() {
                if lod.is_nan() {
                    continue;
                }
                if best.map_or(true, |b| lod > b.3) {
                    best = Some((&c.chr, &c.names[k], c.positions[k], lod));
                }
            }
        }
        best
    }
}

/// Genome scan of every phenotype column.
///
/// With `kinship` the scan uses a linear mixed model (overall or LOCO
/// kinship); otherwise Haley-Knott regression.
pub fn scan1(
    probs: &Genoprobs,
    pheno: &PhenotypeTable,
    kinship: Option<&Kinship>,
    addcovar: Option<&CovariateMatrix>,
    opts: &ScanOptions,
) -> Result<ScanResult> {
    opts.validate()?;
    check_kinship(probs, kinship)?;
    let align = Alignment::new(probs, pheno, addcovar, kinship)?;

    tracing::info!(
        "scan1: {} individuals, {} phenotypes, {} positions, {}",
        align.len(),
        pheno.n_pheno(),
        probs.n_positions(),
        match kinship {
            Some(k) if k.is_loco() => "LMM (LOCO)",
            Some(_) => "LMM",
            None => "Haley-Knott",
        }
    );

    let pool = thread_pool(opts.cores)?;
    let cache = EigenCache::default();
    pool.install(|| {
        scan_aligned(probs, pheno, kinship, addcovar, &align, opts.method(), &cache)
    })
}

pub(crate) fn check_kinship(probs: &Genoprobs, kinship: Option<&Kinship>) -> Result<()> {
    match kinship {
        Some(Kinship::PerChromosome(_)) => Err(QtlError::config(
            "per-chromosome kinship cannot be used for a scan; use overall or LOCO",
        )
        .into()),
        Some(Kinship::Loco(_)) => {
            for c in &probs.chromosomes {
                if kinship.and_then(|k| k.for_chr(&c.chr)).is_none() {
                    return Err(QtlError::invalid_data(format!(
                        "no LOCO kinship matrix for chromosome {}",
                        c.chr
                    ))
                    .into());
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Null-model fits per kinship group and phenotype column.
pub(crate) struct NullModels {
    pub labels: Vec<String>,
    /// chromosome index -> group index
    pub group_of_chr: Vec<usize>,
    /// [group][column]; None when the column has fewer than 2 individuals
    pub fits: Vec<Vec<Option<NullFit>>>,
}

pub(crate) fn fit_null_models(
    probs: &Genoprobs,
    columns: &[ColumnData],
    kinship: Option<&Kinship>,
    align: &Alignment,
    method: Method,
    cache: &EigenCache,
) -> Result<NullModels> {
    let (labels, group_of_chr): (Vec<String>, Vec<usize>) = match kinship {
        Some(Kinship::Loco(_)) => (probs.chr_names(), (0..probs.chromosomes.len()).collect()),
        Some(_) => (vec!["overall".to_string()], vec![0; probs.chromosomes.len()]),
        None => (vec!["null".to_string()], vec![0; probs.chromosomes.len()]),
    };

    let units: Vec<(usize, usize)> = (0..labels.len())
        .flat_map(|g| (0..columns.len()).map(move |j| (g, j)))
        .collect();

    // Columns with the same individuals share one eigendecomposition per group
    let eigens: HashMap<(usize, usize), Arc<KinshipEigen>> = match kinship {
        None => HashMap::new(),
        Some(_) => {
            let mut first_of: HashMap<(usize, Vec<usize>), usize> = HashMap::new();
            let mut distinct: Vec<(usize, Vec<usize>)> = Vec::new();
            let mut unit_key = Vec::new();
            for &(g, j) in &units {
                if columns[j].n() < 2 {
                    continue;
                }
                let rows = kinship_rows(&columns[j], align)?;
                let next = distinct.len();
                let d = *first_of.entry((g, rows.clone())).or_insert(next);
                if d == next {
                    distinct.push((g, rows));
                }
                unit_key.push(((g, j), d));
            }
            let decomposed = distinct
                .par_iter()
                .map(|(g, rows)| {
                    let km = kinship.and_then(|k| k.for_chr(&labels[*g])).ok_or_else(|| {
                        anyhow::Error::from(QtlError::invalid_data(format!(
                            "no kinship matrix for {}",
                            labels[*g]
                        )))
                    })?;
                    cache.get_or_decompose(&labels[*g], km, rows)
                })
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(
                "null models: {} kinship decompositions for {} fits ({} cached)",
                decomposed.len(),
                unit_key.len(),
                cache.len()
            );
            unit_key
                .into_iter()
                .map(|(unit, d)| (unit, Arc::clone(&decomposed[d])))
                .collect()
        }
    };

    let flat = units
        .par_iter()
        .map(|&(g, j)| {
            let col = &columns[j];
            if col.n() < 2 {
                return Ok(None);
            }
            let fit = match eigens.get(&(g, j)) {
                None => NullFit::haley_knott(col)?,
                Some(eigen) => NullFit::mixed_with(col, Arc::clone(eigen), method)?,
            };
            Ok(Some(fit))
        })
        .collect::<Result<Vec<Option<NullFit>>>>()?;

    let mut fits: Vec<Vec<Option<NullFit>>> = Vec::with_capacity(labels.len());
    let mut it = flat.into_iter();
    for _ in 0..labels.len() {
        fits.push(it.by_ref().take(columns.len()).collect());
    }

    Ok(NullModels {
        labels,
        group_of_chr,
        fits,
    })
}

/// Scan on the current rayon pool with a fixed alignment.
pub(crate) fn scan_aligned(
    probs: &Genoprobs,
    pheno: &PhenotypeTable,
    kinship: Option<&Kinship>,
    addcovar: Option<&CovariateMatrix>,
    align: &Alignment,
    method: Method,
    cache: &EigenCache,
) -> Result<ScanResult> {
    let n_pheno = pheno.n_pheno();
    let columns: Vec<ColumnData> = (0..n_pheno)
        .map(|j| column_data(align, pheno, j, addcovar))
        .collect();
    for (j, c) in columns.iter().enumerate() {
        if c.n() < 2 {
            tracing::warn!(
                "phenotype '{}' has {} usable individuals; LOD set to NaN",
                pheno.names[j],
                c.n()
            );
        }
    }

    let nulls = fit_null_models(probs, &columns, kinship, align, method, cache)?;

    let units: Vec<(usize, usize, usize)> = probs
        .chromosomes
        .iter()
        .enumerate()
        .flat_map(|(ci, c)| {
            (0..c.n_positions()).flat_map(move |pi| (0..n_pheno).map(move |j| (ci, pi, j)))
        })
        .collect();

    let lods = units
        .par_iter()
        .map(|&(ci, pi, j)| {
            let Some(null) = &nulls.fits[nulls.group_of_chr[ci]][j] else {
                return Ok(f64::NAN);
            };
            let col = &columns[j];
            let x1 = null.transform(col.full_design(&probs.chromosomes[ci].at(pi), align));
            let rss1 = fit_rss(&x1, &null.y, DEFAULT_TOL)?.rss;
            Ok(lod_score(col.n(), null.rss0, rss1))
        })
        .collect::<Result<Vec<f64>>>()?;

    let mut offset = 0;
    let chromosomes = probs
        .chromosomes
        .iter()
        .map(|c| {
            let n_pos = c.n_positions();
            let lod = Array2::from_shape_fn((n_pos, n_pheno), |(pi, j)| {
                lods[offset + pi * n_pheno + j]
            });
            offset += n_pos * n_pheno;
            tracing::debug!("scan1: chromosome {} done ({} positions)", c.chr, n_pos);
            ChromosomeScan {
                chr: c.chr.clone(),
                names: c.names.clone(),
                positions: c.positions.clone(),
                is_marker: c.is_marker.clone(),
                lod,
            }
        })
        .collect();

    let hsq = kinship.map(|_| HsqTable {
        labels: nulls.labels.clone(),
        values: Array2::from_shape_fn((nulls.labels.len(), n_pheno), |(g, j)| {
            nulls.fits[g][j]
                .as_ref()
                .and_then(|f| f.hsq())
                .unwrap_or(f64::NAN)
        }),
    });

    Ok(ScanResult {
        pheno_names: pheno.names.clone(),
        n_ind: columns.iter().map(|c| c.n()).collect(),
        chromosomes,
        hsq,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cross::CrossType;
    use crate::genoprob::ChromosomeProbs;
    use crate::types::KinshipMatrix;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    /// Backcross probabilities: genotype i % 2 at position 1, a pattern
    /// unrelated to it elsewhere.
    fn toy_probs(n: usize, n_pos: usize) -> Genoprobs {
        let probs = Array3::from_shape_fn((n, 2, n_pos), |(i, g, k)| {
            let geno = if k == 1 { i % 2 } else { (i / 2 + k) % 2 };
            if geno == g {
                0.95
            } else {
                0.05
            }
        });
        Genoprobs {
            crosstype: CrossType::BC,
            ind_ids: (0..n).map(|i| format!("ind{}", i)).collect(),
            alleles: vec!["A".into(), "B".into()],
            states: vec!["AA".into(), "AB".into()],
            is_allele: false,
            chromosomes: vec![ChromosomeProbs {
                chr: "1".into(),
                names: (0..n_pos).map(|k| format!("m{}", k)).collect(),
                positions: (0..n_pos).map(|k| k as f64 * 10.0).collect(),
                is_marker: vec![true; n_pos],
                probs,
            }],
        }
    }

    fn toy_pheno(n: usize) -> PhenotypeTable {
        let values = Array2::from_shape_fn((n, 2), |(i, j)| {
            let noise = ((i * 7 + 3) % 11) as f64 / 11.0 - 0.5;
            if j == 0 {
                (i % 2) as f64 * 3.0 + noise
            } else {
                noise
            }
        });
        PhenotypeTable::new(
            (0..n).map(|i| format!("ind{}", i)).collect(),
            vec!["trait".into(), "noise".into()],
            values,
        )
        .unwrap()
    }

    #[test]
    fn test_hk_peak_at_causal_position() {
        let probs = toy_probs(40, 4);
        let pheno = toy_pheno(40);
        let out = scan1(&probs, &pheno, None, None, &ScanOptions::default()).unwrap();
        let (_, name, _, lod) = out.max_position(0).unwrap();
        assert_eq!(name, "m1");
        assert!(lod > 5.0);
        assert!(out.chromosomes[0].lod.iter().all(|&v| v >= 0.0));
        assert!(out.hsq.is_none());
        assert_eq!(out.n_ind, vec![40, 40]);
    }

    #[test]
    fn test_missing_phenotype_dropped_per_column() {
        let probs = toy_probs(20, 3);
        let mut pheno = toy_pheno(20);
        pheno.values[(0, 0)] = f64::NAN;
        pheno.values[(1, 0)] = f64::NAN;
        let out = scan1(&probs, &pheno, None, None, &ScanOptions::default()).unwrap();
        assert_eq!(out.n_ind, vec![18, 20]);
    }

    #[test]
    fn test_lmm_identity_kinship_matches_hk() {
        let n = 30;
        let probs = toy_probs(n, 3);
        let pheno = toy_pheno(n);
        let hk = scan1(&probs, &pheno, None, None, &ScanOptions::default()).unwrap();

        let kin = Kinship::Overall(KinshipMatrix {
            ind_ids: probs.ind_ids.clone(),
            matrix: Array2::eye(n),
        });
        let lmm = scan1(&probs, &pheno, Some(&kin), None, &ScanOptions::default()).unwrap();
        for (a, b) in hk.chromosomes[0].lod.iter().zip(lmm.chromosomes[0].lod.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-6);
        }
        assert!(lmm.hsq.is_some());
    }

    #[test]
    fn test_per_chromosome_kinship_rejected() {
        let probs = toy_probs(10, 2);
        let pheno = toy_pheno(10);
        let kin = Kinship::PerChromosome(vec![(
            "1".into(),
            KinshipMatrix {
                ind_ids: probs.ind_ids.clone(),
                matrix: Array2::eye(10),
            },
        )]);
        let err = scan1(&probs, &pheno, Some(&kin), None, &ScanOptions::default()).unwrap_err();
        assert!(QtlError::is_config(&err));
    }

    #[test]
    fn test_no_common_individuals() {
        let probs = toy_probs(10, 2);
        let pheno = PhenotypeTable::new(
            vec!["x".into(), "y".into()],
            vec!["trait".into()],
            Array2::zeros((2, 1)),
        )
        .unwrap();
        let err = scan1(&probs, &pheno, None, None, &ScanOptions::default()).unwrap_err();
        assert!(QtlError::is_invalid_data(&err));
    }

    fn relatedness(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, n), |(i, j)| {
            if i == j {
                1.0
            } else if i / 4 == j / 4 {
                0.5
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_kinship_decomposed_once_per_row_set() {
        let n = 20;
        let probs = toy_probs(n, 3);
        let mut pheno = toy_pheno(n);
        let kin = Kinship::Overall(KinshipMatrix {
            ind_ids: probs.ind_ids.clone(),
            matrix: relatedness(n),
        });
        let align = Alignment::new(&probs, &pheno, None, Some(&kin)).unwrap();
        let cache = EigenCache::default();
        let columns = |p: &PhenotypeTable| -> Vec<ColumnData> {
            (0..p.n_pheno()).map(|j| column_data(&align, p, j, None)).collect()
        };

        let nulls = fit_null_models(&probs, &columns(&pheno), Some(&kin), &align, Method::REML, &cache)
            .unwrap();
        assert_eq!(cache.len(), 1);
        let first = nulls.fits[0][0].as_ref().unwrap().lmm.as_ref().unwrap();
        let second = nulls.fits[0][1].as_ref().unwrap().lmm.as_ref().unwrap();
        assert!(Arc::ptr_eq(&first.eigen, &second.eigen));

        // Repeated fits on the same individuals reuse the decomposition
        fit_null_models(&probs, &columns(&pheno), Some(&kin), &align, Method::REML, &cache).unwrap();
        assert_eq!(cache.len(), 1);

        pheno.values[(3, 1)] = f64::NAN;
        let nulls = fit_null_models(&probs, &columns(&pheno), Some(&kin), &align, Method::REML, &cache)
            .unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(nulls.fits[0][1].as_ref().unwrap().lmm.as_ref().unwrap().eigen.n(), n - 1);
    }

    #[test]
    fn test_loco_decomposition_per_chromosome() {
        let n = 16;
        let mut probs = toy_probs(n, 3);
        let mut chr2 = probs.chromosomes[0].clone();
        chr2.chr = "2".into();
        probs.chromosomes.push(chr2);
        let pheno = toy_pheno(n);
        let kin = Kinship::Loco(
            ["1", "2"]
                .iter()
                .map(|c| {
                    (
                        c.to_string(),
                        KinshipMatrix {
                            ind_ids: probs.ind_ids.clone(),
                            matrix: relatedness(n),
                        },
                    )
                })
                .collect(),
        );
        let align = Alignment::new(&probs, &pheno, None, Some(&kin)).unwrap();
        let cache = EigenCache::default();
        let columns: Vec<ColumnData> = (0..2).map(|j| column_data(&align, &pheno, j, None)).collect();

        let nulls = fit_null_models(&probs, &columns, Some(&kin), &align, Method::ML, &cache).unwrap();
        assert_eq!(nulls.labels, vec!["1", "2"]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lmm_scan_with_missing_phenotype() {
        let n = 24;
        let probs = toy_probs(n, 3);
        let mut pheno = toy_pheno(n);
        pheno.values[(5, 0)] = f64::NAN;
        let kin = Kinship::Overall(KinshipMatrix {
            ind_ids: probs.ind_ids.clone(),
            matrix: relatedness(n),
        });
        let out = scan1(&probs, &pheno, Some(&kin), None, &ScanOptions::default()).unwrap();
        assert_eq!(out.n_ind, vec![n - 1, n]);
        assert_eq!(out.max_position(0).unwrap().1, "m1");
        assert!(out.hsq.unwrap().values.iter().all(|h| (0.0..=1.0).contains(h)));
    }
}
