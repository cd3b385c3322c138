//! QTL effects and genotype inference
//!
//! - `fit1`: single-QTL fit at one position with coefficients, standard
//!   errors, LOD, fitted values and residuals
//! - `scan1coef`: coefficients along a chromosome
//! - `class_means`: probability-weighted phenotype mean per genotype class
//! - `maxmarg`: most probable genotype per individual and position

use anyhow::Result;
use lmm_rs::{fit_coef, DEFAULT_TOL};
use nalgebra::DMatrix;
use ndarray::{s, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::thread_pool;
use crate::error::QtlError;
use crate::genoprob::Genoprobs;
use crate::model::{column_data, lod_score, Alignment, ColumnData, NullFit};
use crate::scan::{check_kinship, ScanOptions};
use crate::types::{CovariateMatrix, Kinship, PhenotypeTable};

/// Single-QTL fit at one position.
#[derive(Debug, Clone)]
pub struct Fit1 {
    /// Genotype states followed by covariate names
    pub coef_names: Vec<String>,
    pub coef: Vec<f64>,
    pub se: Vec<f64>,
    pub lod: f64,
    /// Individuals used, in fit order
    pub ind_ids: Vec<String>,
    pub fitted: Vec<f64>,
    pub residuals: Vec<f64>,
    /// Null-model heritability (LMM only)
    pub hsq: Option<f64>,
}

/// Coefficients along one chromosome.
#[derive(Debug, Clone)]
pub struct ScanCoef {
    pub chr: String,
    pub pheno: String,
    pub names: Vec<String>,
    pub positions: Vec<f64>,
    pub coef_names: Vec<String>,
    /// positions x coefficients
    pub coef: Array2<f64>,
    /// positions x coefficients
    pub se: Array2<f64>,
    pub lod: Vec<f64>,
}

fn usable_column(
    probs: &Genoprobs,
    pheno: &PhenotypeTable,
    col: usize,
    kinship: Option<&Kinship>,
    addcovar: Option<&CovariateMatrix>,
) -> Result<(Alignment, ColumnData)> {
    if col >= pheno.n_pheno() {
        return Err(QtlError::config(format!(
            "phenotype column {} out of range ({} phenotypes)",
            col,
            pheno.n_pheno()
        ))
        .into());
    }
    check_kinship(probs, kinship)?;
    let align = Alignment::new(probs, pheno, addcovar, kinship)?;
    let data = column_data(&align, pheno, col, addcovar);
    if data.n() < 2 {
        return Err(QtlError::invalid_data(format!(
            "phenotype '{}' has {} usable individuals",
            pheno.names[col],
            data.n()
        ))
        .into());
    }
    Ok((align, data))
}

fn null_for_chr(
    data: &ColumnData,
    align: &Alignment,
    chr: &str,
    kinship: Option<&Kinship>,
    opts: &ScanOptions,
) -> Result<NullFit> {
    match kinship {
        None => NullFit::haley_knott(data),
        Some(k) => {
            let km = k.for_chr(chr).ok_or_else(|| {
                anyhow::Error::from(QtlError::invalid_data(format!(
                    "no kinship matrix for chromosome {}",
                    chr
                )))
            })?;
            NullFit::mixed(data, km, align, opts.method())
        }
    }
}

fn coef_names(probs: &Genoprobs, addcovar: Option<&CovariateMatrix>) -> Vec<String> {
    let mut names = probs.states.clone();
    if let Some(c) = addcovar {
        names.extend(c.names.iter().cloned());
    }
    names
}

/// Fit the single-QTL model at one named position.
#[allow(clippy::too_many_arguments)]
pub fn fit1(
    probs: &Genoprobs,
    pheno: &PhenotypeTable,
    col: usize,
    chr: &str,
    position: &str,
    kinship: Option<&Kinship>,
    addcovar: Option<&CovariateMatrix>,
    opts: &ScanOptions,
) -> Result<Fit1> {
    let (ci, pi) = probs.find_position(chr, position)?;
    let (align, data) = usable_column(probs, pheno, col, kinship, addcovar)?;
    let null = null_for_chr(&data, &align, chr, kinship, opts)?;

    let x1 = data.full_design(&probs.chromosomes[ci].at(pi), &align);
    let fit = fit_coef(&null.transform(x1.clone()), &null.y, DEFAULT_TOL)?;

    // Fitted values on the phenotype scale
    let fitted = &x1 * &fit.coef;
    let residuals = &data.y - &fitted;

    Ok(Fit1 {
        coef_names: coef_names(probs, addcovar),
        coef: fit.coef.iter().copied().collect(),
        se: fit.se.iter().copied().collect(),
        lod: lod_score(data.n(), null.rss0, fit.rss),
        ind_ids: data.rows.iter().map(|&k| align.ids[k].clone()).collect(),
        fitted: fitted.iter().copied().collect(),
        residuals: residuals.iter().copied().collect(),
        hsq: null.hsq(),
    })
}

/// Coefficients at every position of one chromosome.
///
/// With `zerosum`, genotype effects are centred on their mean and the mean
/// is reported as an extra `intercept` coefficient; standard errors refer
/// to the uncentred coefficients (NaN for the intercept).
#[allow(clippy::too_many_arguments)]
pub fn scan1coef(
    probs: &Genoprobs,
    pheno: &PhenotypeTable,
    col: usize,
    chr: &str,
    kinship: Option<&Kinship>,
    addcovar: Option<&CovariateMatrix>,
    opts: &ScanOptions,
    zerosum: bool,
) -> Result<ScanCoef> {
    let c = probs.chr(chr).ok_or_else(|| {
        anyhow::Error::from(QtlError::config(format!(
            "chromosome '{}' not in genotype probabilities",
            chr
        )))
    })?;
    let (align, data) = usable_column(probs, pheno, col, kinship, addcovar)?;
    let null = null_for_chr(&data, &align, chr, kinship, opts)?;

    tracing::info!(
        "scan1coef: phenotype '{}', chromosome {}, {} positions",
        pheno.names[col],
        chr,
        c.n_positions()
    );

    let pool = thread_pool(opts.cores)?;
    let fits = pool.install(|| {
        (0..c.n_positions())
            .into_par_iter()
            .map(|pi| {
                let x1: DMatrix<f64> = null.transform(data.full_design(&c.at(pi), &align));
                fit_coef(&x1, &null.y, DEFAULT_TOL)
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut names = coef_names(probs, addcovar);
    let n_states = probs.n_states();
    let n_coef = names.len();
    let width = if zerosum { n_coef + 1 } else { n_coef };
    let mut coef = Array2::<f64>::zeros((fits.len(), width));
    let mut se = Array2::<f64>::zeros((fits.len(), width));

    for (pi, fit) in fits.iter().enumerate() {
        for k in 0..n_coef {
            coef[(pi, k)] = fit.coef[k];
            se[(pi, k)] = fit.se[k];
        }
        if zerosum {
            let mean = (0..n_states).map(|g| fit.coef[g]).sum::<f64>() / n_states as f64;
            for g in 0..n_states {
                coef[(pi, g)] -= mean;
            }
            coef[(pi, n_coef)] = mean;
            se[(pi, n_coef)] = f64::NAN;
        }
    }
    if zerosum {
        names.push("intercept".to_string());
    }

    Ok(ScanCoef {
        chr: chr.to_string(),
        pheno: pheno.names[col].clone(),
        names: c.names.clone(),
        positions: c.positions.clone(),
        coef_names: names,
        coef,
        se,
        lod: fits
            .iter()
            .map(|f| lod_score(data.n(), null.rss0, f.rss))
            .collect(),
    })
}

/// Probability-weighted phenotype mean per genotype state at one position.
pub fn class_means(
    probs: &Genoprobs,
    pheno: &PhenotypeTable,
    col: usize,
    chr: &str,
    position: &str,
) -> Result<Vec<f64>> {
    let (ci, pi) = probs.find_position(chr, position)?;
    let (align, data) = usable_column(probs, pheno, col, None, None)?;
    let p = probs.chromosomes[ci].at(pi);

    Ok((0..probs.n_states())
        .map(|g| {
            let mut num = 0.0;
            let mut den = 0.0;
            for (r, &k) in data.rows.iter().enumerate() {
                let w = p[(align.probs_idx[k], g)];
                num += w * data.y[r];
                den += w;
            }
            if den > 0.0 {
                num / den
            } else {
                f64::NAN
            }
        })
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxmargOptions {
    /// Minimum probability for a call; lower maxima are reported as missing
    pub minprob: f64,
}

impl Default for MaxmargOptions {
    fn default() -> Self {
        Self { minprob: 0.95 }
    }
}

impl MaxmargOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.minprob > 0.0 && self.minprob <= 1.0) {
            return Err(QtlError::config(format!(
                "minprob must be in (0, 1], got {}",
                self.minprob
            ))
            .into());
        }
        Ok(())
    }
}

/// Index of the most probable state, lowest index on ties; None below `minprob`.
pub fn infer_state(p: ArrayView1<f64>, minprob: f64) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (g, &v) in p.iter().enumerate() {
        if best.map_or(true, |b| v > p[b]) {
            best = Some(g);
        }
    }
    best.filter(|&b| p[b] >= minprob)
}

/// Inferred states along one chromosome.
#[derive(Debug, Clone)]
pub struct ChromosomeCalls {
    pub chr: String,
    pub names: Vec<String>,
    pub positions: Vec<f64>,
    /// individuals x positions, state index or None
    pub calls: Array2<Option<usize>>,
}

#[derive(Debug, Clone)]
pub struct Maxmarg {
    pub ind_ids: Vec<String>,
    pub states: Vec<String>,
    pub chromosomes: Vec<ChromosomeCalls>,
}

/// Most probable genotype state at every individual and position.
pub fn maxmarg(probs: &Genoprobs, opts: &MaxmargOptions) -> Result<Maxmarg> {
    opts.validate()?;
    let chromosomes = probs
        .chromosomes
        .iter()
        .map(|c| {
            let (n_ind, _, n_pos) = c.probs.dim();
            let calls = Array2::from_shape_fn((n_ind, n_pos), |(i, k)| {
                infer_state(c.probs.slice(s![i, .., k]), opts.minprob)
            });
            ChromosomeCalls {
                chr: c.chr.clone(),
                names: c.names.clone(),
                positions: c.positions.clone(),
                calls,
            }
        })
        .collect();
    Ok(Maxmarg {
        ind_ids: probs.ind_ids.clone(),
        states: probs.states.clone(),
        chromosomes,
    })
}

/// Inferred states of every individual at one position.
pub fn maxmarg_position(
    probs: &Genoprobs,
    chr: &str,
    position: &str,
    opts: &MaxmargOptions,
) -> Result<Vec<Option<usize>>> {
    opts.validate()?;
    let (ci, pi) = probs.find_position(chr, position)?;
    let p = probs.chromosomes[ci].at(pi);
    Ok(p.outer_iter().map(|row| infer_state(row, opts.minprob)).collect())
}
