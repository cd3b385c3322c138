//! Genotype probabilities by hidden Markov model
//!
//! For each individual and chromosome, the hidden states are the genotypes at
//! each map position (markers and pseudomarkers), transitions come from the
//! inter-position recombination fraction and emissions from the observed
//! calls with a genotyping error rate. Conditional genotype probabilities
//! are computed by forward-backward in log space.
//!
//! Work units are (chromosome, individual) pairs run on a rayon pool.

use anyhow::{anyhow, Result};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::thread_pool;
use crate::cross::CrossType;
use crate::error::QtlError;
use crate::map::{MapFunction, PseudomarkerMap};
use crate::types::{Cross, IndividualId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenoprobOptions {
    /// Genotyping error probability, in [0, 1)
    pub error_prob: f64,
    pub map_function: MapFunction,
    /// Worker threads (0 = all available)
    pub cores: usize,
}

impl Default for GenoprobOptions {
    fn default() -> Self {
        Self {
            error_prob: 1e-4,
            map_function: MapFunction::Haldane,
            cores: 0,
        }
    }
}

impl GenoprobOptions {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.error_prob) {
            return Err(QtlError::config(format!(
                "error_prob must be in [0, 1), got {}",
                self.error_prob
            ))
            .into());
        }
        Ok(())
    }
}

/// Probabilities along one chromosome.
#[derive(Debug, Clone)]
pub struct ChromosomeProbs {
    pub chr: String,
    pub names: Vec<String>,
    pub positions: Vec<f64>,
    pub is_marker: Vec<bool>,
    /// individuals x states x positions
    pub probs: Array3<f64>,
}

impl ChromosomeProbs {
    pub fn n_positions(&self) -> usize {
        self.positions.len()
    }

    pub fn position_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// individuals x states at one position
    pub fn at(&self, pos: usize) -> ArrayView2<'_, f64> {
        self.probs.index_axis(Axis(2), pos)
    }
}

/// Genotype (or allele) probabilities for every chromosome.
#[derive(Debug, Clone)]
pub struct Genoprobs {
    pub crosstype: CrossType,
    pub ind_ids: Vec<IndividualId>,
    /// Founder allele labels
    pub alleles: Vec<String>,
    /// Genotype state names, or allele names when `is_allele`
    pub states: Vec<String>,
    pub is_allele: bool,
    pub chromosomes: Vec<ChromosomeProbs>,
}

impl Genoprobs {
    pub fn n_ind(&self) -> usize {
        self.ind_ids.len()
    }

    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    pub fn n_positions(&self) -> usize {
        self.chromosomes.iter().map(|c| c.n_positions()).sum()
    }

    pub fn chr_names(&self) -> Vec<String> {
        self.chromosomes.iter().map(|c| c.chr.clone()).collect()
    }

    pub fn chr(&self, chr: &str) -> Option<&ChromosomeProbs> {
        self.chromosomes.iter().find(|c| c.chr == chr)
    }

    /// (chromosome index, position index) of a named position.
    pub fn find_position(&self, chr: &str, name: &str) -> Result<(usize, usize)> {
        let ci = self
            .chromosomes
            .iter()
            .position(|c| c.chr == chr)
            .ok_or_else(|| anyhow!("Chromosome '{}' not in genotype probabilities", chr))?;
        let pi = self.chromosomes[ci]
            .position_index(name)
            .ok_or_else(|| anyhow!("Position '{}' not on chromosome {}", name, chr))?;
        Ok((ci, pi))
    }

    /// Largest |sum_g p - 1| over all individuals and positions.
    pub fn max_sum_deviation(&self) -> f64 {
        self.chromosomes
            .iter()
            .flat_map(|c| {
                c.probs
                    .sum_axis(Axis(1))
                    .iter()
                    .map(|s| (s - 1.0).abs())
                    .collect::<Vec<_>>()
            })
            .fold(0.0, f64::max)
    }

    /// Keep the named chromosomes, in the given order.
    pub fn subset_chr(&self, chrs: &[String]) -> Result<Self> {
        let chromosomes = chrs
            .iter()
            .map(|c| {
                self.chr(c)
                    .cloned()
                    .ok_or_else(|| anyhow!("Chromosome '{}' not in genotype probabilities", c))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            chromosomes,
            ..self.clone_header()
        })
    }

    /// Keep the named individuals, in the given order.
    pub fn subset_ind(&self, ids: &[String]) -> Result<Self> {
        let lookup: HashMap<&str, usize> = self
            .ind_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let idx: Vec<usize> = ids
            .iter()
            .map(|id| {
                lookup
                    .get(id.as_str())
                    .copied()
                    .ok_or_else(|| anyhow!("Individual '{}' not in genotype probabilities", id))
            })
            .collect::<Result<_>>()?;

        let chromosomes = self
            .chromosomes
            .iter()
            .map(|c| ChromosomeProbs {
                probs: c.probs.select(Axis(0), &idx),
                ..c.clone()
            })
            .collect();
        Ok(Self {
            ind_ids: ids.to_vec(),
            chromosomes,
            ..self.clone_header()
        })
    }

    fn clone_header(&self) -> Self {
        Self {
            crosstype: self.crosstype,
            ind_ids: self.ind_ids.clone(),
            alleles: self.alleles.clone(),
            states: self.states.clone(),
            is_allele: self.is_allele,
            chromosomes: Vec::new(),
        }
    }
}

/// Calculate conditional genotype probabilities at every map position.
pub fn calc_genoprob(
    cross: &Cross,
    map: &PseudomarkerMap,
    opts: &GenoprobOptions,
) -> Result<Genoprobs> {
    opts.validate()?;

    let ct = cross.crosstype;
    let n_ind = cross.n_ind();

    // chromosome index in the cross for each map chromosome
    let cross_chr: Vec<usize> = map
        .chromosomes
        .iter()
        .map(|g| {
            cross
                .gmap
                .chromosomes
                .iter()
                .position(|c| c.chr == g.chr)
                .ok_or_else(|| {
                    anyhow::Error::from(QtlError::invalid_data(format!(
                        "map chromosome {} not in cross",
                        g.chr
                    )))
                })
        })
        .collect::<Result<_>>()?;

    tracing::info!(
        "calc_genoprob: {} individuals, {} chromosomes, {} positions, crosstype {}",
        n_ind,
        map.chromosomes.len(),
        map.n_positions(),
        ct.as_str()
    );

    let prior_only: Vec<bool> = cross_chr
        .iter()
        .zip(&map.chromosomes)
        .map(|(&ci, grid)| {
            let typed = cross.geno[ci].n_typed_markers();
            if typed < 2 {
                tracing::warn!(
                    "chr {}: {} genotyped marker(s); using prior genotype probabilities",
                    grid.chr,
                    typed
                );
            }
            typed < 2
        })
        .collect();

    let units: Vec<(usize, usize)> = (0..map.chromosomes.len())
        .flat_map(|c| (0..n_ind).map(move |i| (c, i)))
        .collect();

    let pool = thread_pool(opts.cores)?;
    let posteriors: Vec<Array2<f64>> = pool.install(|| {
        units
            .par_iter()
            .map(|&(c, i)| {
                let grid = &map.chromosomes[c];
                if prior_only[c] {
                    return prior_probs(ct, grid.len());
                }
                let calls = &cross.geno[cross_chr[c]].calls;
                let obs: Vec<u8> = grid
                    .marker_index
                    .iter()
                    .map(|m| m.map_or(0, |j| calls[(i, j)]))
                    .collect();
                let rec: Vec<f64> = grid
                    .positions
                    .windows(2)
                    .map(|w| opts.map_function.rec_frac(w[1] - w[0]))
                    .collect();
                forward_backward(ct, &obs, &rec, opts.error_prob)
            })
            .collect()
    });

    let n_gen = ct.n_gen();
    let mut chromosomes: Vec<ChromosomeProbs> = map
        .chromosomes
        .iter()
        .map(|grid| ChromosomeProbs {
            chr: grid.chr.clone(),
            names: grid.names.clone(),
            positions: grid.positions.clone(),
            is_marker: grid.marker_index.iter().map(|m| m.is_some()).collect(),
            probs: Array3::zeros((n_ind, n_gen, grid.len())),
        })
        .collect();

    for (&(c, i), post) in units.iter().zip(posteriors) {
        chromosomes[c].probs.index_axis_mut(Axis(0), i).assign(&post);
    }

    for c in &chromosomes {
        tracing::debug!("chr {}: {} positions", c.chr, c.n_positions());
    }

    let alleles = if cross.alleles.len() >= 2 {
        cross.alleles[..2].to_vec()
    } else {
        vec!["A".to_string(), "B".to_string()]
    };

    Ok(Genoprobs {
        crosstype: ct,
        ind_ids: cross.ind_ids.clone(),
        states: ct.geno_names(&alleles),
        alleles,
        is_allele: false,
        chromosomes,
    })
}

/// Prior probabilities repeated at every position (states x positions).
fn prior_probs(ct: CrossType, n_pos: usize) -> Array2<f64> {
    Array2::from_shape_fn((ct.n_gen(), n_pos), |(g, _)| ct.init(g).exp())
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Posterior state probabilities (states x positions) for one individual.
///
/// `rec[k]` is the recombination fraction between positions k and k+1.
pub(crate) fn forward_backward(ct: CrossType, obs: &[u8], rec: &[f64], error_prob: f64) -> Array2<f64> {
    let n_gen = ct.n_gen();
    let n_pos = obs.len();
    let mut alpha = Array2::<f64>::zeros((n_gen, n_pos));
    let mut beta = Array2::<f64>::zeros((n_gen, n_pos));
    let mut terms = vec![0.0; n_gen];

    if n_pos == 0 {
        return alpha;
    }

    for g in 0..n_gen {
        alpha[(g, 0)] = ct.init(g) + ct.emit(obs[0], g, error_prob);
    }
    for k in 1..n_pos {
        for g in 0..n_gen {
            for (gp, t) in terms.iter_mut().enumerate() {
                *t = alpha[(gp, k - 1)] + ct.step(gp, g, rec[k - 1]);
            }
            alpha[(g, k)] = log_sum_exp(&terms) + ct.emit(obs[k], g, error_prob);
        }
    }

    // beta at the last position is log(1) = 0
    for k in (0..n_pos - 1).rev() {
        for g in 0..n_gen {
            for (gn, t) in terms.iter_mut().enumerate() {
                *t = beta[(gn, k + 1)] + ct.step(g, gn, rec[k]) + ct.emit(obs[k + 1], gn, error_prob);
            }
            beta[(g, k)] = log_sum_exp(&terms);
        }
    }

    let mut post = Array2::<f64>::zeros((n_gen, n_pos));
    for k in 0..n_pos {
        for g in 0..n_gen {
            terms[g] = alpha[(g, k)] + beta[(g, k)];
        }
        let total = log_sum_exp(&terms);
        for g in 0..n_gen {
            post[(g, k)] = if total.is_finite() {
                (terms[g] - total).exp()
            } else {
                1.0 / n_gen as f64
            };
        }
    }
    post
}

/// Collapse genotype probabilities to founder allele dosage probabilities.
pub fn genoprob_to_alleleprob(probs: &Genoprobs) -> Result<Genoprobs> {
    if probs.is_allele {
        return Ok(probs.clone());
    }
    let ct = probs.crosstype;

    let chromosomes = probs
        .chromosomes
        .iter()
        .map(|c| {
            let (n_ind, n_gen, n_pos) = c.probs.dim();
            let mut out = Array3::<f64>::zeros((n_ind, 2, n_pos));
            for g in 0..n_gen {
                let dose = ct.allele_dosage(g);
                for i in 0..n_ind {
                    for k in 0..n_pos {
                        let p = c.probs[(i, g, k)];
                        out[(i, 0, k)] += p * dose[0];
                        out[(i, 1, k)] += p * dose[1];
                    }
                }
            }
            ChromosomeProbs {
                probs: out,
                ..c.clone()
            }
        })
        .collect();

    Ok(Genoprobs {
        crosstype: ct,
        ind_ids: probs.ind_ids.clone(),
        alleles: probs.alleles.clone(),
        states: probs.alleles.clone(),
        is_allele: true,
        chromosomes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{insert_pseudomarkers, PseudomarkerOptions};
    use crate::types::{ChromosomeGenotypes, ChromosomeMap, GeneticMap, PhenotypeTable};
    use approx::assert_relative_eq;
    use ndarray::array;

    fn small_cross(ct: CrossType, calls: Array2<u8>, positions: Vec<f64>) -> Cross {
        let n_ind = calls.nrows();
        let markers: Vec<String> = (0..positions.len()).map(|j| format!("m{}", j + 1)).collect();
        let ids: Vec<String> = (0..n_ind).map(|i| format!("ind{}", i + 1)).collect();
        let gmap = GeneticMap::new(vec![ChromosomeMap::new("1", markers, positions).unwrap()]);
        let pheno = PhenotypeTable::new(
            ids.clone(),
            vec!["y".into()],
            Array2::zeros((n_ind, 1)),
        )
        .unwrap();
        Cross::new(
            ct,
            vec!["A".into(), "B".into()],
            ids,
            gmap,
            vec![ChromosomeGenotypes { chr: "1".into(), calls }],
            pheno,
        )
        .unwrap()
    }

    #[test]
    fn test_probs_sum_to_one() {
        let calls = array![[1, 2, 3, 0], [2, 0, 2, 2], [0, 0, 0, 0], [4, 5, 1, 3]];
        let cross = small_cross(CrossType::F2, calls, vec![0.0, 10.0, 20.0, 40.0]);
        let map = insert_pseudomarkers(
            &cross.gmap,
            &PseudomarkerOptions {
                step: 2.5,
                ..Default::default()
            },
        )
        .unwrap();
        let probs = calc_genoprob(&cross, &map, &GenoprobOptions::default()).unwrap();
        assert!(probs.max_sum_deviation() < 1e-6);
        assert_eq!(probs.states, vec!["AA", "AB", "BB"]);
        assert!(probs.chromosomes[0].probs.iter().all(|p| (0.0..=1.0 + 1e-12).contains(p)));
    }

    #[test]
    fn test_complete_data_recovers_genotypes() {
        let calls = array![[1, 1, 2], [3, 2, 2]];
        let cross = small_cross(CrossType::F2, calls.clone(), vec![0.0, 5.0, 10.0]);
        let map = PseudomarkerMap::from_map(&cross.gmap);
        let opts = GenoprobOptions {
            error_prob: 1e-8,
            ..Default::default()
        };
        let probs = calc_genoprob(&cross, &map, &opts).unwrap();
        let c = &probs.chromosomes[0];
        for i in 0..2 {
            for k in 0..3 {
                let g = calls[(i, k)] as usize - 1;
                assert_relative_eq!(c.probs[(i, g, k)], 1.0, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_midpoint_favours_flanking_genotype() {
        let calls = array![[1, 1], [2, 2]];
        let cross = small_cross(CrossType::BC, calls, vec![0.0, 20.0]);
        let map = insert_pseudomarkers(
            &cross.gmap,
            &PseudomarkerOptions {
                step: 10.0,
                ..Default::default()
            },
        )
        .unwrap();
        let probs = calc_genoprob(&cross, &map, &GenoprobOptions::default()).unwrap();
        let (_, mid) = probs.find_position("1", "c1.loc1").unwrap();
        let c = &probs.chromosomes[0];
        assert!(c.probs[(0, 0, mid)] > 0.9);
        assert!(c.probs[(1, 1, mid)] > 0.9);
    }

    #[test]
    fn test_missing_data_gives_prior() {
        let calls = array![[0, 0, 0], [1, 2, 1]];
        let cross = small_cross(CrossType::F2, calls, vec![0.0, 10.0, 20.0]);
        let map = PseudomarkerMap::from_map(&cross.gmap);
        let probs = calc_genoprob(&cross, &map, &GenoprobOptions::default()).unwrap();
        let c = &probs.chromosomes[0];
        assert_relative_eq!(c.probs[(0, 0, 1)], 0.25, epsilon = 1e-10);
        assert_relative_eq!(c.probs[(0, 1, 1)], 0.5, epsilon = 1e-10);
    }

    #[test]
    fn test_single_marker_prior_only() {
        let cross = small_cross(CrossType::RISelf, array![[1], [2]], vec![5.0]);
        let probs = calc_genoprob(
            &cross,
            &PseudomarkerMap::from_map(&cross.gmap),
            &GenoprobOptions::default(),
        )
        .unwrap();
        assert_relative_eq!(probs.chromosomes[0].probs[(0, 0, 0)], 0.5, epsilon = 1e-12);
        assert_relative_eq!(probs.chromosomes[0].probs[(1, 1, 0)], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_bad_error_prob() {
        let cross = small_cross(CrossType::BC, array![[1, 2]], vec![0.0, 10.0]);
        let opts = GenoprobOptions {
            error_prob: -0.1,
            ..Default::default()
        };
        let err = calc_genoprob(&cross, &PseudomarkerMap::from_map(&cross.gmap), &opts).unwrap_err();
        assert!(QtlError::is_config(&err));
    }

    #[test]
    fn test_alleleprob() {
        let calls = array![[1, 2, 3]];
        let cross = small_cross(CrossType::F2, calls, vec![0.0, 10.0, 20.0]);
        let probs = calc_genoprob(
            &cross,
            &PseudomarkerMap::from_map(&cross.gmap),
            &GenoprobOptions {
                error_prob: 1e-8,
                ..Default::default()
            },
        )
        .unwrap();
        let ap = genoprob_to_alleleprob(&probs).unwrap();
        assert!(ap.is_allele);
        assert_eq!(ap.states, vec!["A", "B"]);
        let c = &ap.chromosomes[0];
        assert_relative_eq!(c.probs[(0, 0, 0)], 1.0, epsilon = 1e-6);
        assert_relative_eq!(c.probs[(0, 0, 1)], 0.5, epsilon = 1e-6);
        assert_relative_eq!(c.probs[(0, 1, 2)], 1.0, epsilon = 1e-6);
        assert!(ap.max_sum_deviation() < 1e-6);
    }

    #[test]
    fn test_subset() {
        let cross = small_cross(CrossType::BC, array![[1, 2], [2, 2], [1, 1]], vec![0.0, 10.0]);
        let probs = calc_genoprob(
            &cross,
            &PseudomarkerMap::from_map(&cross.gmap),
            &GenoprobOptions::default(),
        )
        .unwrap();
        let sub = probs.subset_ind(&["ind3".to_string(), "ind1".to_string()]).unwrap();
        assert_eq!(sub.n_ind(), 2);
        assert_eq!(
            sub.chromosomes[0].probs.index_axis(Axis(0), 1),
            probs.chromosomes[0].probs.index_axis(Axis(0), 0)
        );
        assert!(probs.subset_chr(&["2".to_string()]).is_err());
    }
}
