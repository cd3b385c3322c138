//! Model plumbing shared by scans, permutations and effect estimation
//!
//! - individual alignment across genotype probabilities, phenotypes,
//!   covariates and kinship
//! - per-phenotype complete-case data
//! - null model fits (least squares, or mixed model with the data rotated
//!   and weighted so that any further fit is ordinary least squares)

use anyhow::Result;
use lmm_rs::{
    decomp_kinship, fit_hsq, fit_rss, variance_weights, weighted_design, KinshipEigen, Method,
    DEFAULT_TOL,
};
use nalgebra::{DMatrix, DVector};
use ndarray::ArrayView2;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::QtlError;
use crate::genoprob::Genoprobs;
use crate::types::{CovariateMatrix, Kinship, KinshipMatrix, PhenotypeTable};

/// Row indices of each input for the individuals common to all of them.
#[derive(Debug, Clone)]
pub(crate) struct Alignment {
    pub ids: Vec<String>,
    pub probs_idx: Vec<usize>,
    pub pheno_idx: Vec<usize>,
    pub covar_idx: Option<Vec<usize>>,
    pub kinship_idx: Option<Vec<usize>>,
}

fn index_of(ids: &[String]) -> HashMap<&str, usize> {
    ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect()
}

impl Alignment {
    /// Individuals present everywhere, in genotype-probability order.
    pub fn new(
        probs: &Genoprobs,
        pheno: &PhenotypeTable,
        covar: Option<&CovariateMatrix>,
        kinship: Option<&Kinship>,
    ) -> Result<Self> {
        let pheno_lookup = index_of(&pheno.ind_ids);
        let covar_lookup = covar.map(|c| index_of(&c.ind_ids));
        let kin_lookup = kinship.map(|k| index_of(k.ind_ids()));

        let mut out = Self {
            ids: Vec::new(),
            probs_idx: Vec::new(),
            pheno_idx: Vec::new(),
            covar_idx: covar.map(|_| Vec::new()),
            kinship_idx: kinship.map(|_| Vec::new()),
        };

        for (pi, id) in probs.ind_ids.iter().enumerate() {
            let Some(&ph) = pheno_lookup.get(id.as_str()) else {
                continue;
            };
            let cv = match &covar_lookup {
                Some(l) => match l.get(id.as_str()) {
                    Some(&i) => Some(i),
                    None => continue,
                },
                None => None,
            };
            let kn = match &kin_lookup {
                Some(l) => match l.get(id.as_str()) {
                    Some(&i) => Some(i),
                    None => continue,
                },
                None => None,
            };

            out.ids.push(id.clone());
            out.probs_idx.push(pi);
            out.pheno_idx.push(ph);
            if let (Some(v), Some(i)) = (out.covar_idx.as_mut(), cv) {
                v.push(i);
            }
            if let (Some(v), Some(i)) = (out.kinship_idx.as_mut(), kn) {
                v.push(i);
            }
        }

        if out.ids.is_empty() {
            return Err(QtlError::invalid_data(
                "no individuals in common between genotype probabilities and phenotypes",
            )
            .into());
        }
        if out.ids.len() < probs.n_ind() {
            tracing::debug!(
                "{} of {} genotyped individuals have phenotypes",
                out.ids.len(),
                probs.n_ind()
            );
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Reassign phenotype and covariate rows: aligned individual k takes the
    /// phenotype (and covariates) of aligned individual `order[k]`.
    pub fn permuted(&self, order: &[usize]) -> Self {
        Self {
            ids: self.ids.clone(),
            probs_idx: self.probs_idx.clone(),
            pheno_idx: order.iter().map(|&k| self.pheno_idx[k]).collect(),
            covar_idx: self
                .covar_idx
                .as_ref()
                .map(|c| order.iter().map(|&k| c[k]).collect()),
            kinship_idx: self.kinship_idx.clone(),
        }
    }
}

/// Complete-case data for one phenotype column.
#[derive(Debug, Clone)]
pub(crate) struct ColumnData {
    /// Aligned indices of the individuals used
    pub rows: Vec<usize>,
    pub y: DVector<f64>,
    /// Covariates without intercept, n x k
    pub covar: DMatrix<f64>,
}

impl ColumnData {
    pub fn n(&self) -> usize {
        self.rows.len()
    }

    /// Intercept plus covariates.
    pub fn null_design(&self) -> DMatrix<f64> {
        let n = self.n();
        let k = self.covar.ncols();
        DMatrix::from_fn(n, k + 1, |i, j| if j == 0 { 1.0 } else { self.covar[(i, j - 1)] })
    }

    /// Genotype probability columns plus covariates.
    pub fn full_design(&self, probs_at: &ArrayView2<f64>, align: &Alignment) -> DMatrix<f64> {
        let n = self.n();
        let s = probs_at.ncols();
        let k = self.covar.ncols();
        DMatrix::from_fn(n, s + k, |i, j| {
            if j < s {
                probs_at[(align.probs_idx[self.rows[i]], j)]
            } else {
                self.covar[(i, j - s)]
            }
        })
    }
}

/// Rows with a phenotype value and every covariate observed.
pub(crate) fn column_data(
    align: &Alignment,
    pheno: &PhenotypeTable,
    col: usize,
    covar: Option<&CovariateMatrix>,
) -> ColumnData {
    let n_cov = covar.map_or(0, |c| c.values.ncols());
    let rows: Vec<usize> = (0..align.len())
        .filter(|&k| {
            if !pheno.values[(align.pheno_idx[k], col)].is_finite() {
                return false;
            }
            match (covar, &align.covar_idx) {
                (Some(c), Some(idx)) => c.values.row(idx[k]).iter().all(|v| v.is_finite()),
                _ => true,
            }
        })
        .collect();

    let y = DVector::from_iterator(
        rows.len(),
        rows.iter().map(|&k| pheno.values[(align.pheno_idx[k], col)]),
    );
    let covar_mat = match (covar, &align.covar_idx) {
        (Some(c), Some(idx)) => {
            DMatrix::from_fn(rows.len(), n_cov, |i, j| c.values[(idx[rows[i]], j)])
        }
        _ => DMatrix::zeros(rows.len(), 0),
    };

    ColumnData {
        rows,
        y,
        covar: covar_mat,
    }
}

/// Mixed-model transformation of one phenotype column.
#[derive(Debug, Clone)]
pub(crate) struct LmmTransform {
    pub eigen: Arc<KinshipEigen>,
    pub weights: DVector<f64>,
    pub hsq: f64,
}

/// Entries kept by an [`EigenCache`]; later row sets are decomposed but not stored.
const EIGEN_CACHE_CAPACITY: usize = 64;

/// Eigendecompositions of kinship submatrices keyed on (kinship group,
/// kinship row indices), reused across phenotype columns and permutations.
#[derive(Debug, Default)]
pub(crate) struct EigenCache {
    entries: Mutex<HashMap<(String, Vec<usize>), Arc<KinshipEigen>>>,
}

impl EigenCache {
    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(String, Vec<usize>), Arc<KinshipEigen>>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("kinship eigendecomposition cache poisoned"))
    }

    pub fn get(&self, group: &str, rows: &[usize]) -> Result<Option<Arc<KinshipEigen>>> {
        Ok(self
            .lock()?
            .get(&(group.to_string(), rows.to_vec()))
            .cloned())
    }

    /// Cached decomposition of `kinship[rows, rows]`, computing it on a miss.
    pub fn get_or_decompose(
        &self,
        group: &str,
        kinship: &KinshipMatrix,
        rows: &[usize],
    ) -> Result<Arc<KinshipEigen>> {
        if let Some(eigen) = self.get(group, rows)? {
            return Ok(eigen);
        }
        let eigen = Arc::new(decompose_rows(kinship, rows)?);

        let mut entries = self.lock()?;
        if entries.len() < EIGEN_CACHE_CAPACITY {
            let kept = entries
                .entry((group.to_string(), rows.to_vec()))
                .or_insert(eigen);
            return Ok(Arc::clone(kept));
        }
        Ok(eigen)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |e| e.len())
    }
}

fn decompose_rows(kinship: &KinshipMatrix, rows: &[usize]) -> Result<KinshipEigen> {
    let n = rows.len();
    let k = DMatrix::from_fn(n, n, |i, j| kinship.matrix[(rows[i], rows[j])]);
    decomp_kinship(&k)
}

/// Kinship row of each individual used by `col`.
pub(crate) fn kinship_rows(col: &ColumnData, align: &Alignment) -> Result<Vec<usize>> {
    let kidx = align.kinship_idx.as_ref().ok_or_else(|| {
        anyhow::Error::from(QtlError::invalid_data("kinship individuals not aligned"))
    })?;
    Ok(col.rows.iter().map(|&k| kidx[k]).collect())
}

/// Null model fit for one phenotype column.
#[derive(Debug, Clone)]
pub(crate) struct NullFit {
    /// Phenotype on the scale used for fitting (rotated and weighted in LMM mode)
    pub y: DVector<f64>,
    pub rss0: f64,
    pub lmm: Option<LmmTransform>,
}

impl NullFit {
    pub fn haley_knott(col: &ColumnData) -> Result<Self> {
        let rss0 = fit_rss(&col.null_design(), &col.y, DEFAULT_TOL)?.rss;
        Ok(Self {
            y: col.y.clone(),
            rss0,
            lmm: None,
        })
    }

    /// Estimate hsq under the null model, decomposing the kinship submatrix.
    pub fn mixed(
        col: &ColumnData,
        kinship: &KinshipMatrix,
        align: &Alignment,
        method: Method,
    ) -> Result<Self> {
        let rows = kinship_rows(col, align)?;
        Self::mixed_with(col, Arc::new(decompose_rows(kinship, &rows)?), method)
    }

    /// Estimate hsq under the null model given the decomposed kinship
    /// submatrix of `col`'s individuals.
    pub fn mixed_with(col: &ColumnData, eigen: Arc<KinshipEigen>, method: Method) -> Result<Self> {
        if eigen.n() != col.n() {
            return Err(QtlError::invalid_data(format!(
                "kinship decomposition has {} individuals, phenotype column {}",
                eigen.n(),
                col.n()
            ))
            .into());
        }
        let y_rot = eigen.rotate_vector(&col.y);
        let x0_rot = eigen.rotate_matrix(&col.null_design());
        let fit = fit_hsq(&eigen.values, &y_rot, &x0_rot, method)?;

        let weights = variance_weights(&eigen.values, fit.hsq);
        let y = y_rot.component_mul(&weights);
        let x0 = weighted_design(&x0_rot, &weights);
        let rss0 = fit_rss(&x0, &y, DEFAULT_TOL)?.rss;

        Ok(Self {
            y,
            rss0,
            lmm: Some(LmmTransform {
                eigen,
                weights,
                hsq: fit.hsq,
            }),
        })
    }

    /// Put a design matrix on the fitting scale.
    pub fn transform(&self, x: DMatrix<f64>) -> DMatrix<f64> {
        match &self.lmm {
            Some(t) => weighted_design(&t.eigen.rotate_matrix(&x), &t.weights),
            None => x,
        }
    }

    pub fn hsq(&self) -> Option<f64> {
        self.lmm.as_ref().map(|t| t.hsq)
    }
}

/// LOD = n/2 log10(RSS0 / RSS1), clamped at 0.
pub(crate) fn lod_score(n: usize, rss0: f64, rss1: f64) -> f64 {
    let rss1 = rss1.max(f64::MIN_POSITIVE);
    let lod = n as f64 / 2.0 * (rss0 / rss1).log10();
    if lod.is_nan() {
        0.0
    } else {
        lod.max(0.0)
    }
}
