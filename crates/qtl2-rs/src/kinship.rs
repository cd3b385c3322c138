//! Kinship from genotype probabilities
//!
//! Kinship between individuals i and j is the expected proportion of shared
//! alleles, averaged over positions:
//!
//!   K[i,j] = (1 / N) * sum_pos sum_a p_i(a, pos) * p_j(a, pos)
//!
//! Per chromosome c the sum S_c = sum_pos P P' is accumulated over the N_c
//! positions on c. The overall matrix is sum_c S_c / sum_c N_c, the LOCO
//! matrix for c is (S - S_c) / (N - N_c), and the per-chromosome matrix is
//! S_c / N_c. Only the upper triangle is accumulated and then mirrored.

use anyhow::Result;
use ndarray::{Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::thread_pool;
use crate::error::QtlError;
use crate::genoprob::{genoprob_to_alleleprob, ChromosomeProbs, Genoprobs};
use crate::types::{Kinship, KinshipMatrix};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KinshipType {
    /// One matrix from all chromosomes
    #[default]
    Overall,
    /// Leave one chromosome out
    Loco,
    /// One matrix per chromosome
    Chr,
}

impl KinshipType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "overall" => Some(KinshipType::Overall),
            "loco" => Some(KinshipType::Loco),
            "chr" => Some(KinshipType::Chr),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KinshipType::Overall => "overall",
            KinshipType::Loco => "loco",
            KinshipType::Chr => "chr",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KinshipOptions {
    pub kind: KinshipType,
    /// Collapse genotype probabilities to allele probabilities first
    pub use_allele_probs: bool,
    pub cores: usize,
}

impl Default for KinshipOptions {
    fn default() -> Self {
        Self {
            kind: KinshipType::Overall,
            use_allele_probs: true,
            cores: 0,
        }
    }
}

/// Calculate a kinship matrix (or LOCO / per-chromosome set).
pub fn calc_kinship(probs: &Genoprobs, opts: &KinshipOptions) -> Result<Kinship> {
    let n_chr = probs.chromosomes.len();
    if n_chr == 0 {
        return Err(QtlError::invalid_data("no chromosomes in genotype probabilities").into());
    }
    if opts.kind == KinshipType::Loco && n_chr < 2 {
        return Err(QtlError::config("LOCO kinship needs at least two chromosomes").into());
    }

    let converted;
    let probs = if opts.use_allele_probs && !probs.is_allele {
        converted = genoprob_to_alleleprob(probs)?;
        &converted
    } else {
        probs
    };

    tracing::info!(
        "calc_kinship: {} individuals, {} chromosomes, type {}",
        probs.n_ind(),
        n_chr,
        opts.kind.as_str()
    );

    let pool = thread_pool(opts.cores)?;
    let per_chr: Vec<(Array2<f64>, usize)> = pool.install(|| {
        probs
            .chromosomes
            .par_iter()
            .map(|c| (shared_allele_sum(c), c.n_positions()))
            .collect()
    });

    let n = probs.n_ind();
    let mut total = Array2::<f64>::zeros((n, n));
    let mut total_pos = 0usize;
    for (s, n_pos) in &per_chr {
        total += s;
        total_pos += n_pos;
    }

    let labelled = |m: Array2<f64>| KinshipMatrix {
        ind_ids: probs.ind_ids.clone(),
        matrix: m,
    };

    match opts.kind {
        KinshipType::Overall => Ok(Kinship::Overall(labelled(scale_and_mirror(
            total, total_pos,
        )?))),
        KinshipType::Loco => {
            let mats = probs
                .chromosomes
                .iter()
                .zip(per_chr)
                .map(|(c, (s, n_pos))| {
                    let m = scale_and_mirror(&total - &s, total_pos - n_pos)?;
                    Ok((c.chr.clone(), labelled(m)))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Kinship::Loco(mats))
        }
        KinshipType::Chr => {
            let mats = probs
                .chromosomes
                .iter()
                .zip(per_chr)
                .map(|(c, (s, n_pos))| Ok((c.chr.clone(), labelled(scale_and_mirror(s, n_pos)?))))
                .collect::<Result<Vec<_>>>()?;
            Ok(Kinship::PerChromosome(mats))
        }
    }
}

/// Upper triangle of sum_pos P P' for one chromosome.
fn shared_allele_sum(c: &ChromosomeProbs) -> Array2<f64> {
    let (n_ind, n_states, n_pos) = c.probs.dim();
    // individuals x (states * positions)
    let flat = Array2::from_shape_fn((n_ind, n_states * n_pos), |(i, k)| {
        c.probs[(i, k / n_pos, k % n_pos)]
    });

    let mut s = Array2::<f64>::zeros((n_ind, n_ind));
    for i in 0..n_ind {
        let row_i = flat.index_axis(Axis(0), i);
        for j in i..n_ind {
            s[(i, j)] = row_i.dot(&flat.index_axis(Axis(0), j));
        }
    }
    s
}

fn scale_and_mirror(mut s: Array2<f64>, n_pos: usize) -> Result<Array2<f64>> {
    if n_pos == 0 {
        return Err(QtlError::invalid_data("no positions available for kinship").into());
    }
    let scale = 1.0 / n_pos as f64;
    let n = s.nrows();
    for i in 0..n {
        for j in i..n {
            let v = s[(i, j)] * scale;
            s[(i, j)] = v;
            s[(j, i)] = v;
        }
    }
    Ok(s)
}
