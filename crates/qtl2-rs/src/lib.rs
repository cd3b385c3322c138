//! qtl2-rs: QTL mapping in experimental crosses
//!
//! A Rust take on the R/qtl2 workflow: load a cross, insert pseudomarkers,
//! calculate genotype probabilities by hidden Markov model, compute kinship,
//! run genome scans (Haley-Knott regression or a linear mixed model),
//! derive permutation thresholds, find peaks and estimate QTL effects.
//!
//! ## Module Organization
//! - `types`: Cross dataset, maps, phenotypes, covariates, kinship
//! - `cross`: Cross types and their HMM initial, transition and emission probabilities
//! - `io`: `read_cross2` and CSV writers/readers for every stage
//! - `map`: Map functions and `insert_pseudomarkers`
//! - `genoprob`: `calc_genoprob` and `genoprob_to_alleleprob`
//! - `kinship`: `calc_kinship` (overall, LOCO, per chromosome)
//! - `scan`: `scan1`
//! - `perm`: `scan1perm` and permutation thresholds
//! - `peaks`: `find_peaks`, `lod_int`, `bayes_int`
//! - `effects`: `fit1`, `scan1coef`, `class_means`, `maxmarg`
//! - `sdp`: Strain distribution patterns
//! - `config`: Thread pools and the JSON analysis configuration
//!
//! ## Example
//! ```ignore
//! use qtl2_rs::*;
//!
//! let cross = read_cross2("iron.json")?;
//! let map = insert_pseudomarkers(&cross.gmap, &PseudomarkerOptions { step: 1.0, ..Default::default() })?;
//! let probs = calc_genoprob(&cross, &map, &GenoprobOptions::default())?;
//! let kinship = calc_kinship(&probs, &KinshipOptions { kind: KinshipType::Loco, ..Default::default() })?;
//!
//! let scan = scan1(&probs, &cross.pheno, Some(&kinship), None, &ScanOptions::default())?;
//! let perm = scan1perm(&probs, &cross.pheno, Some(&kinship), None,
//!                      &ScanOptions::default(), &PermOptions::default(), None)?;
//! let peaks = find_peaks(&scan, &Threshold::PerPhenotype(perm.thresholds(0.05)?),
//!                        &PeakOptions { drop: Some(1.5), ..Default::default() })?;
//! ```

// Error types
pub mod error;

// Core types
pub mod types;

// Cross types and HMM probabilities
pub mod cross;

// Strain distribution patterns
pub mod sdp;

// Maps and pseudomarkers
pub mod map;

// Genotype probabilities
pub mod genoprob;

// Kinship matrices
pub mod kinship;

// Null models and design matrices shared by scan, perm and effects
mod model;

// Genome scan
pub mod scan;

// Permutation test
pub mod perm;

// Peak finding (find_peaks, lod_int, bayes_int)
pub mod peaks;

// Effects and genotype inference
pub mod effects;

// Configuration and thread pools
pub mod config;

// File input and output
pub mod io;

pub use config::{thread_pool, AnalysisConfig};
pub use cross::CrossType;
pub use effects::{
    class_means, fit1, infer_state, maxmarg, maxmarg_position, ChromosomeCalls, Fit1, Maxmarg,
    MaxmargOptions, ScanCoef, scan1coef,
};
pub use error::QtlError;
pub use genoprob::{
    calc_genoprob, genoprob_to_alleleprob, ChromosomeProbs, GenoprobOptions, Genoprobs,
};
pub use io::{
    load_kinship, output_path, read_cross2, read_perm, read_scan1, write_coef, write_genoprobs,
    write_kinship, write_maxmarg, write_peaks, write_perm, write_scan1, ControlFile,
};
pub use kinship::{calc_kinship, KinshipOptions, KinshipType};
pub use map::{
    insert_pseudomarkers, ChromosomeGrid, MapFunction, PseudomarkerMap, PseudomarkerOptions,
    Stepwidth,
};
pub use peaks::{
    bayes_int, find_peaks, lod_int, natural_chrom_cmp, Interval, Peak, PeakOptions, PeakSort,
    Threshold,
};
pub use perm::{scan1perm, PermOptions, PermutationResult};
pub use scan::{scan1, ChromosomeScan, HsqTable, ScanOptions, ScanResult};
pub use sdp::{calc_sdp, invert_sdp};
pub use types::{
    ChromosomeGenotypes, ChromosomeMap, CovariateMatrix, CovariateTable, Cross,
    FounderGenotypes, GeneticMap, IndividualId, Kinship, KinshipMatrix, MarkerId,
    PhenotypeTable,
};
