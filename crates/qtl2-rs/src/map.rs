//! Map functions and pseudomarker insertion
//!
//! `insert_pseudomarkers` densifies a genetic map so genotype probabilities
//! and scans can be evaluated between typed markers. The result records, for
//! each position, whether it is a real marker and which one.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::QtlError;
use crate::types::{ChromosomeMap, GeneticMap};

/// Map function converting cM distance to recombination fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapFunction {
    #[default]
    Haldane,
    Kosambi,
    Morgan,
}

impl MapFunction {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "haldane" => Some(MapFunction::Haldane),
            "kosambi" => Some(MapFunction::Kosambi),
            "morgan" => Some(MapFunction::Morgan),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MapFunction::Haldane => "haldane",
            MapFunction::Kosambi => "kosambi",
            MapFunction::Morgan => "morgan",
        }
    }

    /// Recombination fraction for a distance in cM.
    pub fn rec_frac(&self, d_cm: f64) -> f64 {
        let d = d_cm.abs() / 100.0;
        match self {
            MapFunction::Haldane => 0.5 * (1.0 - (-2.0 * d).exp()),
            MapFunction::Kosambi => 0.5 * (2.0 * d).tanh(),
            MapFunction::Morgan => d.min(0.5),
        }
    }
}

/// How pseudomarkers are spaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stepwidth {
    /// Regular grid at multiples of `step` from the left end
    #[default]
    Fixed,
    /// Fewest equally spaced points so that no gap exceeds `step`
    Max,
}

impl Stepwidth {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fixed" => Some(Stepwidth::Fixed),
            "max" => Some(Stepwidth::Max),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PseudomarkerOptions {
    /// Spacing in cM (0 = no pseudomarkers)
    pub step: f64,
    /// Distance to extend beyond the terminal markers
    pub off_end: f64,
    pub stepwidth: Stepwidth,
    /// Grid points closer than this to a marker are dropped
    pub tol: f64,
}

impl Default for PseudomarkerOptions {
    fn default() -> Self {
        Self {
            step: 0.0,
            off_end: 0.0,
            stepwidth: Stepwidth::Fixed,
            tol: 0.01,
        }
    }
}

impl PseudomarkerOptions {
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [("step", self.step), ("off_end", self.off_end), ("tol", self.tol)] {
            if !v.is_finite() || v < 0.0 {
                return Err(QtlError::config(format!("{} must be >= 0, got {}", name, v)).into());
            }
        }
        Ok(())
    }
}

/// Positions on one chromosome after pseudomarker insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct ChromosomeGrid {
    pub chr: String,
    pub names: Vec<String>,
    pub positions: Vec<f64>,
    /// Index of the marker in the original chromosome map, None for pseudomarkers
    pub marker_index: Vec<Option<usize>>,
}

impl ChromosomeGrid {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn is_marker(&self, i: usize) -> bool {
        self.marker_index[i].is_some()
    }

    pub fn position_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// Genetic map with pseudomarkers.
#[derive(Debug, Clone, PartialEq)]
pub struct PseudomarkerMap {
    pub chromosomes: Vec<ChromosomeGrid>,
}

impl PseudomarkerMap {
    /// The map itself, with no pseudomarkers.
    pub fn from_map(map: &GeneticMap) -> Self {
        Self {
            chromosomes: map
                .chromosomes
                .iter()
                .map(|c| ChromosomeGrid {
                    chr: c.chr.clone(),
                    names: c.markers.clone(),
                    positions: c.positions.clone(),
                    marker_index: (0..c.len()).map(Some).collect(),
                })
                .collect(),
        }
    }

    pub fn chr(&self, chr: &str) -> Option<&ChromosomeGrid> {
        self.chromosomes.iter().find(|c| c.chr == chr)
    }

    pub fn n_positions(&self) -> usize {
        self.chromosomes.iter().map(|c| c.len()).sum()
    }

    /// Position (cM) of a named marker or pseudomarker.
    pub fn find_position(&self, name: &str) -> Option<(&str, f64)> {
        self.chromosomes.iter().find_map(|c| {
            c.position_index(name)
                .map(|i| (c.chr.as_str(), c.positions[i]))
        })
    }

    /// Name of the position nearest `pos` on `chr`; with `markers_only`
    /// pseudomarkers are skipped.
    pub fn find_marker(&self, chr: &str, pos: f64, markers_only: bool) -> Option<&str> {
        let c = self.chr(chr)?;
        let mut best: Option<(usize, f64)> = None;
        for i in 0..c.len() {
            if markers_only && !c.is_marker(i) {
                continue;
            }
            let d = (c.positions[i] - pos).abs();
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((i, d));
            }
        }
        best.map(|(i, _)| c.names[i].as_str())
    }
}

/// Insert pseudomarkers into a genetic map.
pub fn insert_pseudomarkers(map: &GeneticMap, opts: &PseudomarkerOptions) -> Result<PseudomarkerMap> {
    opts.validate()?;

    if opts.step == 0.0 && opts.off_end == 0.0 {
        return Ok(PseudomarkerMap::from_map(map));
    }

    let chromosomes = map
        .chromosomes
        .iter()
        .map(|c| densify_chromosome(c, opts))
        .collect();

    let out = PseudomarkerMap { chromosomes };
    tracing::debug!(
        "inserted pseudomarkers: {} markers -> {} positions",
        map.n_markers(),
        out.n_positions()
    );
    Ok(out)
}

fn densify_chromosome(c: &ChromosomeMap, opts: &PseudomarkerOptions) -> ChromosomeGrid {
    if c.is_empty() {
        return ChromosomeGrid {
            chr: c.chr.clone(),
            names: Vec::new(),
            positions: Vec::new(),
            marker_index: Vec::new(),
        };
    }

    let left = c.positions[0] - opts.off_end;
    let right = c.positions[c.len() - 1] + opts.off_end;

    let pseudo: Vec<f64> = match opts.stepwidth {
        Stepwidth::Fixed => fixed_grid(left, right, opts.step)
            .into_iter()
            .filter(|p| c.positions.iter().all(|m| (p - m).abs() > opts.tol))
            .collect(),
        Stepwidth::Max => max_grid(&c.positions, left, right, opts.step),
    };

    // merge markers and pseudomarkers by position, markers first on ties
    let mut entries: Vec<(f64, Option<usize>)> = c
        .positions
        .iter()
        .enumerate()
        .map(|(i, &p)| (p, Some(i)))
        .chain(pseudo.into_iter().map(|p| (p, None)))
        .collect();
    entries.sort_by(|a, b| {
        a.0.total_cmp(&b.0)
            .then_with(|| b.1.is_some().cmp(&a.1.is_some()))
    });

    let mut k = 0;
    let names = entries
        .iter()
        .map(|(_, idx)| match idx {
            Some(i) => c.markers[*i].clone(),
            None => {
                k += 1;
                format!("c{}.loc{}", c.chr, k)
            }
        })
        .collect();

    ChromosomeGrid {
        chr: c.chr.clone(),
        names,
        positions: entries.iter().map(|e| e.0).collect(),
        marker_index: entries.iter().map(|e| e.1).collect(),
    }
}

/// left, left + step, ... up to right. With step = 0 only the end points.
fn fixed_grid(left: f64, right: f64, step: f64) -> Vec<f64> {
    if step == 0.0 {
        return if right > left { vec![left, right] } else { vec![left] };
    }
    let n = ((right - left) / step + 1e-8).floor() as usize;
    (0..=n).map(|k| left + k as f64 * step).collect()
}

/// Equally spaced points filling every gap wider than `step`, plus the
/// off-end points when they extend beyond the markers.
fn max_grid(markers: &[f64], left: f64, right: f64, step: f64) -> Vec<f64> {
    let first = markers[0];
    let last = markers[markers.len() - 1];

    let mut anchors = Vec::with_capacity(markers.len() + 2);
    let mut out = Vec::new();
    if left < first {
        anchors.push(left);
        out.push(left);
    }
    anchors.extend_from_slice(markers);
    if right > last {
        anchors.push(right);
        out.push(right);
    }

    if step > 0.0 {
        for w in anchors.windows(2) {
            let gap = w[1] - w[0];
            let n_int = ((gap / step) - 1e-8).ceil().max(1.0) as usize;
            for k in 1..n_int {
                out.push(w[0] + gap * k as f64 / n_int as f64);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn chr1() -> GeneticMap {
        GeneticMap::new(vec![ChromosomeMap::new(
            "1",
            vec!["m1".into(), "m2".into(), "m3".into()],
            vec![0.0, 10.0, 25.0],
        )
        .unwrap()])
    }

    #[test]
    fn test_map_functions() {
        assert_relative_eq!(MapFunction::Haldane.rec_frac(0.0), 0.0);
        assert_relative_eq!(MapFunction::Haldane.rec_frac(10.0), 0.5 * (1.0 - (-0.2f64).exp()), epsilon = 1e-12);
        assert_relative_eq!(MapFunction::Kosambi.rec_frac(10.0), 0.5 * 0.2f64.tanh(), epsilon = 1e-12);
        assert_relative_eq!(MapFunction::Morgan.rec_frac(80.0), 0.5);
        assert!(MapFunction::Haldane.rec_frac(500.0) < 0.5);
    }

    #[test]
    fn test_zero_step_is_identity() {
        let map = chr1();
        let dense = insert_pseudomarkers(&map, &PseudomarkerOptions::default()).unwrap();
        assert_eq!(dense, PseudomarkerMap::from_map(&map));
    }

    #[test]
    fn test_step_larger_than_span_round_trip() {
        let map = chr1();
        for stepwidth in [Stepwidth::Fixed, Stepwidth::Max] {
            let opts = PseudomarkerOptions {
                step: 30.0,
                stepwidth,
                ..Default::default()
            };
            let dense = insert_pseudomarkers(&map, &opts).unwrap();
            let c = &dense.chromosomes[0];
            assert_eq!(c.positions, vec![0.0, 10.0, 25.0]);
            assert!(c.marker_index.iter().all(|m| m.is_some()));
        }
    }

    #[test]
    fn test_fixed_grid() {
        let opts = PseudomarkerOptions {
            step: 5.0,
            ..Default::default()
        };
        let dense = insert_pseudomarkers(&chr1(), &opts).unwrap();
        let c = &dense.chromosomes[0];
        assert_eq!(c.positions, vec![0.0, 5.0, 10.0, 15.0, 20.0, 25.0]);
        assert_eq!(c.names[1], "c1.loc1");
        assert_eq!(c.names[3], "c1.loc2");
        assert!(c.is_marker(2));
        assert!(!c.is_marker(4));
        assert_eq!(c.marker_index[5], Some(2));
    }

    #[test]
    fn test_max_stepwidth() {
        let opts = PseudomarkerOptions {
            step: 4.0,
            stepwidth: Stepwidth::Max,
            ..Default::default()
        };
        let dense = insert_pseudomarkers(&chr1(), &opts).unwrap();
        let c = &dense.chromosomes[0];
        for w in c.positions.windows(2) {
            assert!(w[1] - w[0] <= 4.0 + 1e-9);
        }
        // 0-10 needs 2 extra points, 10-25 needs 3
        assert_eq!(c.len(), 3 + 2 + 3);
    }

    #[test]
    fn test_off_end() {
        let opts = PseudomarkerOptions {
            step: 5.0,
            off_end: 5.0,
            ..Default::default()
        };
        let dense = insert_pseudomarkers(&chr1(), &opts).unwrap();
        let c = &dense.chromosomes[0];
        assert_relative_eq!(c.positions[0], -5.0);
        assert_relative_eq!(*c.positions.last().unwrap(), 30.0);
        assert!(!c.is_marker(0));
    }

    #[test]
    fn test_negative_step_rejected() {
        let opts = PseudomarkerOptions {
            step: -1.0,
            ..Default::default()
        };
        let err = insert_pseudomarkers(&chr1(), &opts).unwrap_err();
        assert!(QtlError::is_config(&err));
    }

    #[test]
    fn test_find_marker_skips_pseudomarkers() {
        let opts = PseudomarkerOptions {
            step: 5.0,
            ..Default::default()
        };
        let dense = insert_pseudomarkers(&chr1(), &opts).unwrap();
        assert_eq!(dense.find_marker("1", 6.0, false), Some("c1.loc1"));
        assert_eq!(dense.find_marker("1", 6.0, true), Some("m2"));
        assert_eq!(dense.find_position("c1.loc2"), Some(("1", 15.0)));
    }
}
