//! Peak detection in genome scan results
//!
//! Per chromosome and phenotype:
//! 1. Local maxima with LOD >= threshold are candidates (a plateau resolves
//!    to its leftmost position)
//! 2. Neighbouring candidates are merged unless the LOD between them drops
//!    by at least `peakdrop` below the lower of the two
//! 3. Optionally, retained peaks closer than `min_separation` cM are pruned,
//!    keeping the higher one
//! 4. Optionally, a LOD support interval or Bayes credible interval is
//!    computed within each peak's segment of the chromosome

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::QtlError;
use crate::scan::{ChromosomeScan, ScanResult};

/// LOD threshold for peak calling.
#[derive(Debug, Clone, PartialEq)]
pub enum Threshold {
    Single(f64),
    /// One value per phenotype column, e.g. from permutations
    PerPhenotype(Vec<f64>),
}

impl Threshold {
    fn for_column(&self, j: usize) -> f64 {
        match self {
            Threshold::Single(t) => *t,
            Threshold::PerPhenotype(ts) => ts[j],
        }
    }

    fn check(&self, n_pheno: usize) -> Result<()> {
        if let Threshold::PerPhenotype(ts) = self {
            if ts.len() != n_pheno {
                return Err(QtlError::config(format!(
                    "{} thresholds given for {} phenotypes",
                    ts.len(),
                    n_pheno
                ))
                .into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeakSort {
    /// Phenotype column, then chromosome and position
    #[default]
    Column,
    /// Chromosome and position, then phenotype column
    Position,
    /// LOD, highest first
    Lod,
}

impl PeakSort {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "column" | "lodcolumn" => Some(PeakSort::Column),
            "position" | "pos" => Some(PeakSort::Position),
            "lod" => Some(PeakSort::Lod),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakOptions {
    /// LOD drop required between two peaks on a chromosome (absent = one peak per chromosome)
    pub peakdrop: Option<f64>,
    /// LOD support interval drop
    pub drop: Option<f64>,
    /// Bayes credible interval coverage
    pub prob: Option<f64>,
    /// Widen intervals to the nearest real markers
    pub expand2markers: bool,
    /// Minimum distance (cM) between reported peaks on a chromosome
    pub min_separation: Option<f64>,
    pub sort_by: PeakSort,
}

impl PeakOptions {
    pub fn validate(&self) -> Result<()> {
        if self.drop.is_some() && self.prob.is_some() {
            return Err(QtlError::config("give either drop or prob, not both").into());
        }
        if let Some(d) = self.drop {
            if !(d >= 0.0) {
                return Err(QtlError::config(format!("drop must be >= 0, got {}", d)).into());
            }
        }
        if let Some(p) = self.prob {
            if !(p > 0.0 && p < 1.0) {
                return Err(QtlError::config(format!("prob must be in (0, 1), got {}", p)).into());
            }
        }
        if let Some(d) = self.peakdrop {
            if !(d >= 0.0) {
                return Err(QtlError::config(format!("peakdrop must be >= 0, got {}", d)).into());
            }
        }
        if let Some(s) = self.min_separation {
            if !(s >= 0.0) {
                return Err(
                    QtlError::config(format!("min_separation must be >= 0, got {}", s)).into(),
                );
            }
        }
        Ok(())
    }
}

/// A significant peak
#[derive(Debug, Clone, PartialEq)]
pub struct Peak {
    pub pheno: String,
    pub pheno_index: usize,
    pub chr: String,
    /// Marker or pseudomarker name at the peak
    pub marker: String,
    pub pos: f64,
    pub lod: f64,
    pub ci_lo: Option<f64>,
    pub ci_hi: Option<f64>,
}

/// Peak position with an interval around it.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub marker: String,
    pub pos: f64,
    pub lod: f64,
    pub ci_lo: f64,
    pub ci_hi: f64,
}

/// Find peaks for every phenotype and chromosome.
pub fn find_peaks(scan: &ScanResult, threshold: &Threshold, opts: &PeakOptions) -> Result<Vec<Peak>> {
    opts.validate()?;
    threshold.check(scan.n_pheno())?;

    let peakdrop = opts.peakdrop.unwrap_or(f64::INFINITY);
    let mut peaks = Vec::new();

    for (j, pheno) in scan.pheno_names.iter().enumerate() {
        let thr = threshold.for_column(j);
        for c in &scan.chromosomes {
            let lod: Vec<f64> = c.lod.column(j).to_vec();
            let mut found: Vec<(usize, Segment)> = chromosome_peaks(&lod, thr, peakdrop);

            if let Some(sep) = opts.min_separation {
                found = prune_by_separation(found, &lod, &c.positions, sep);
            }

            for (k, seg) in found {
                let (ci_lo, ci_hi) = match (opts.drop, opts.prob) {
                    (Some(d), _) => {
                        let (lo, hi) = drop_interval(&lod, k, seg, d);
                        interval_bounds(c, lo, hi, opts.expand2markers)
                    }
                    (None, Some(p)) => {
                        let (lo, hi) = credible_interval(&lod, &c.positions, k, seg, p);
                        interval_bounds(c, lo, hi, opts.expand2markers)
                    }
                    (None, None) => (None, None),
                };
                peaks.push(Peak {
                    pheno: pheno.clone(),
                    pheno_index: j,
                    chr: c.chr.clone(),
                    marker: c.names[k].clone(),
                    pos: c.positions[k],
                    lod: lod[k],
                    ci_lo,
                    ci_hi,
                });
            }
        }
    }

    sort_peaks(&mut peaks, opts.sort_by);
    tracing::info!("find_peaks: {} peaks", peaks.len());
    Ok(peaks)
}

/// LOD support interval around the maximum on one chromosome.
pub fn lod_int(
    scan: &ScanResult,
    chr: &str,
    pheno_col: usize,
    drop: f64,
    expand2markers: bool,
) -> Result<Interval> {
    if !(drop >= 0.0) {
        return Err(QtlError::config(format!("drop must be >= 0, got {}", drop)).into());
    }
    let (c, lod, k) = chromosome_max(scan, chr, pheno_col)?;
    let (lo, hi) = drop_interval(&lod, k, (0, lod.len() - 1), drop);
    finish_interval(c, &lod, k, lo, hi, expand2markers)
}

/// Bayes credible interval around the maximum on one chromosome.
pub fn bayes_int(
    scan: &ScanResult,
    chr: &str,
    pheno_col: usize,
    prob: f64,
    expand2markers: bool,
) -> Result<Interval> {
    if !(prob > 0.0 && prob < 1.0) {
        return Err(QtlError::config(format!("prob must be in (0, 1), got {}", prob)).into());
    }
    let (c, lod, k) = chromosome_max(scan, chr, pheno_col)?;
    let (lo, hi) = credible_interval(&lod, &c.positions, k, (0, lod.len() - 1), prob);
    finish_interval(c, &lod, k, lo, hi, expand2markers)
}

fn chromosome_max<'a>(
    scan: &'a ScanResult,
    chr: &str,
    pheno_col: usize,
) -> Result<(&'a ChromosomeScan, Vec<f64>, usize)> {
    let c = scan.chr(chr).ok_or_else(|| {
        anyhow::Error::from(QtlError::config(format!("chromosome '{}' not in scan", chr)))
    })?;
    if pheno_col >= scan.n_pheno() {
        return Err(QtlError::config(format!(
            "phenotype column {} out of range ({} phenotypes)",
            pheno_col,
            scan.n_pheno()
        ))
        .into());
    }
    let lod: Vec<f64> = c.lod.column(pheno_col).to_vec();
    let k = argmax(&lod).ok_or_else(|| {
        anyhow::Error::from(QtlError::invalid_data(format!(
            "no LOD scores on chromosome {}",
            chr
        )))
    })?;
    Ok((c, lod, k))
}

fn finish_interval(
    c: &ChromosomeScan,
    lod: &[f64],
    k: usize,
    lo: usize,
    hi: usize,
    expand2markers: bool,
) -> Result<Interval> {
    let (ci_lo, ci_hi) = interval_bounds(c, lo, hi, expand2markers);
    Ok(Interval {
        marker: c.names[k].clone(),
        pos: c.positions[k],
        lod: lod[k],
        ci_lo: ci_lo.unwrap_or(c.positions[lo]),
        ci_hi: ci_hi.unwrap_or(c.positions[hi]),
    })
}

/// Inclusive index range of the chromosome that belongs to one peak.
type Segment = (usize, usize);

fn value(lod: &[f64], k: usize) -> f64 {
    if lod[k].is_nan() {
        f64::NEG_INFINITY
    } else {
        lod[k]
    }
}

/// First index of the largest value, ignoring NaN.
fn argmax(lod: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for k in 0..lod.len() {
        if lod[k].is_nan() {
            continue;
        }
        if best.map_or(true, |b| lod[k] > lod[b]) {
            best = Some(k);
        }
    }
    best
}

/// Leftmost position of each local-maximum plateau at or above `thr`.
fn local_maxima(lod: &[f64], thr: f64) -> Vec<usize> {
    let n = lod.len();
    let mut out = Vec::new();
    let mut a = 0;
    while a < n {
        let mut b = a;
        while b + 1 < n && value(lod, b + 1) == value(lod, a) {
            b += 1;
        }
        let v = value(lod, a);
        let left_lower = a == 0 || value(lod, a - 1) < v;
        let right_lower = b == n - 1 || value(lod, b + 1) < v;
        if left_lower && right_lower && v >= thr && v.is_finite() {
            out.push(a);
        }
        a = b + 1;
    }
    out
}

fn min_between(lod: &[f64], a: usize, b: usize) -> (usize, f64) {
    let mut best = (a, value(lod, a));
    for k in a..=b {
        if value(lod, k) < best.1 {
            best = (k, value(lod, k));
        }
    }
    best
}

/// Peaks on one chromosome after the peakdrop merge, each with its segment.
fn chromosome_peaks(lod: &[f64], thr: f64, peakdrop: f64) -> Vec<(usize, Segment)> {
    let mut stack: Vec<usize> = Vec::new();
    for c in local_maxima(lod, thr) {
        let mut keep = true;
        while let Some(&p) = stack.last() {
            let (_, dip) = min_between(lod, p, c);
            let lower = value(lod, p).min(value(lod, c));
            if lower - dip >= peakdrop {
                break;
            }
            if value(lod, c) > value(lod, p) {
                stack.pop();
            } else {
                keep = false;
                break;
            }
        }
        if keep {
            stack.push(c);
        }
    }

    if stack.is_empty() {
        return Vec::new();
    }
    // Segments split at the lowest point between neighbouring peaks
    let mut bounds = vec![0];
    for w in stack.windows(2) {
        bounds.push(min_between(lod, w[0], w[1]).0);
    }
    bounds.push(lod.len() - 1);
    stack
        .iter()
        .enumerate()
        .map(|(i, &k)| (k, (bounds[i], bounds[i + 1])))
        .collect()
}

/// Keep the highest peaks that are at least `sep` cM from every kept peak.
fn prune_by_separation(
    mut found: Vec<(usize, Segment)>,
    lod: &[f64],
    positions: &[f64],
    sep: f64,
) -> Vec<(usize, Segment)> {
    found.sort_by(|a, b| {
        value(lod, b.0)
            .partial_cmp(&value(lod, a.0))
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    let mut retained: Vec<(usize, Segment)> = Vec::new();
    for f in found {
        let far_enough = retained
            .iter()
            .all(|r| (positions[f.0] - positions[r.0]).abs() >= sep);
        if far_enough {
            retained.push(f);
        }
    }
    retained.sort_by_key(|r| r.0);
    retained
}

/// Contiguous range around `k` within `seg` where LOD >= lod[k] - drop.
fn drop_interval(lod: &[f64], k: usize, seg: Segment, drop: f64) -> (usize, usize) {
    let cutoff = value(lod, k) - drop;
    let mut lo = k;
    while lo > seg.0 && value(lod, lo - 1) >= cutoff {
        lo -= 1;
    }
    let mut hi = k;
    while hi < seg.1 && value(lod, hi + 1) >= cutoff {
        hi += 1;
    }
    (lo, hi)
}

/// Highest-LOD positions in `seg` whose share of the area under 10^LOD
/// reaches `prob`. Each position stands for half the gap to either neighbour.
fn credible_interval(
    lod: &[f64],
    positions: &[f64],
    k: usize,
    seg: Segment,
    prob: f64,
) -> (usize, usize) {
    let top = value(lod, k);
    let width = |i: usize| {
        let left = positions[i.saturating_sub(1).max(seg.0)];
        let right = positions[(i + 1).min(seg.1)];
        (right - left) / 2.0
    };
    let flat = (seg.0..=seg.1).all(|i| width(i) <= 0.0);
    let mut area: Vec<(usize, f64, f64)> = (seg.0..=seg.1)
        .map(|i| {
            let d = 10f64.powf(value(lod, i) - top);
            (i, d, if flat { d } else { d * width(i) })
        })
        .collect();
    let total: f64 = area.iter().map(|a| a.2).sum();
    area.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });

    let (mut lo, mut hi) = (k, k);
    let mut mass = 0.0;
    for (i, _, a) in area {
        mass += a / total;
        if positions[i] < positions[lo] {
            lo = i;
        }
        if positions[i] > positions[hi] {
            hi = i;
        }
        if mass >= prob {
            break;
        }
    }
    (lo, hi)
}

/// Interval positions, widened to flanking real markers when requested.
fn interval_bounds(
    c: &ChromosomeScan,
    lo: usize,
    hi: usize,
    expand2markers: bool,
) -> (Option<f64>, Option<f64>) {
    if !expand2markers {
        return (Some(c.positions[lo]), Some(c.positions[hi]));
    }
    let lo = (0..=lo).rev().find(|&i| c.is_marker[i]).unwrap_or(lo);
    let hi = (hi..c.positions.len()).find(|&i| c.is_marker[i]).unwrap_or(hi);
    (Some(c.positions[lo]), Some(c.positions[hi]))
}

fn sort_peaks(peaks: &mut [Peak], by: PeakSort) {
    let by_pos = |a: &Peak, b: &Peak| {
        natural_chrom_cmp(&a.chr, &b.chr)
            .then_with(|| a.pos.partial_cmp(&b.pos).unwrap_or(Ordering::Equal))
    };
    match by {
        PeakSort::Column => {
            peaks.sort_by(|a, b| a.pheno_index.cmp(&b.pheno_index).then_with(|| by_pos(a, b)))
        }
        PeakSort::Position => {
            peaks.sort_by(|a, b| by_pos(a, b).then(a.pheno_index.cmp(&b.pheno_index)))
        }
        PeakSort::Lod => peaks.sort_by(|a, b| {
            b.lod
                .partial_cmp(&a.lod)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.pheno_index.cmp(&b.pheno_index))
                .then_with(|| by_pos(a, b))
        }),
    }
}

/// Chromosome order: numbered autosomes ascending, then X, Y and the
/// mitochondrion, then any other name alphabetically. A leading "chr" is
/// ignored in any case.
pub fn natural_chrom_cmp(a: &str, b: &str) -> Ordering {
    chrom_key(a).cmp(&chrom_key(b)).then_with(|| a.cmp(b))
}

fn chrom_key(name: &str) -> (u8, u64, String) {
    let lower = name.to_ascii_lowercase();
    let bare = lower.strip_prefix("chr").unwrap_or(&lower);
    if let Ok(n) = bare.parse::<u64>() {
        return (0, n, String::new());
    }
    let rank = match bare {
        "x" => 1,
        "y" => 2,
        "m" | "mt" => 3,
        _ => 4,
    };
    (rank, 0, bare.to_string())
}
