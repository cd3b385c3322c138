//! Core data types for qtl2-rs
//!
//! These mirror the pieces of an R/qtl2 `cross2` object: genetic and physical
//! maps, genotype calls per chromosome, phenotypes, covariates and founder
//! genotypes.

use anyhow::{anyhow, Result};
use ndarray::{Array2, ArrayView1, Axis};
use std::collections::HashMap;

use crate::cross::CrossType;
use crate::error::QtlError;
use crate::sdp::calc_sdp;

pub type IndividualId = String;
pub type MarkerId = String;

/// Markers on one chromosome, ordered by position.
#[derive(Clone, Debug, PartialEq)]
pub struct ChromosomeMap {
    pub chr: String,
    pub markers: Vec<MarkerId>,
    /// Positions in cM (genetic map) or Mbp (physical map)
    pub positions: Vec<f64>,
}

impl ChromosomeMap {
    /// Build a chromosome map, sorting markers by position.
    ///
    /// Tied or non-finite positions are a data error.
    pub fn new(chr: impl Into<String>, markers: Vec<MarkerId>, positions: Vec<f64>) -> Result<Self> {
        let chr = chr.into();
        if markers.len() != positions.len() {
            return Err(QtlError::invalid_data(format!(
                "chr {}: {} markers but {} positions",
                chr,
                markers.len(),
                positions.len()
            ))
            .into());
        }
        if let Some(i) = positions.iter().position(|p| !p.is_finite()) {
            return Err(QtlError::invalid_data(format!(
                "chr {}: marker {} has a non-finite position",
                chr, markers[i]
            ))
            .into());
        }

        let mut order: Vec<usize> = (0..markers.len()).collect();
        order.sort_by(|&a, &b| positions[a].total_cmp(&positions[b]));

        let markers: Vec<MarkerId> = order.iter().map(|&i| markers[i].clone()).collect();
        let positions: Vec<f64> = order.iter().map(|&i| positions[i]).collect();

        for w in 0..positions.len().saturating_sub(1) {
            if positions[w + 1] <= positions[w] {
                return Err(QtlError::invalid_data(format!(
                    "chr {}: markers {} and {} share position {}",
                    chr,
                    markers[w],
                    markers[w + 1],
                    positions[w]
                ))
                .into());
            }
        }

        Ok(Self {
            chr,
            markers,
            positions,
        })
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Distance from the first to the last marker.
    pub fn span(&self) -> f64 {
        match (self.positions.first(), self.positions.last()) {
            (Some(a), Some(b)) => b - a,
            _ => 0.0,
        }
    }

    pub fn marker_index(&self, marker: &str) -> Option<usize> {
        self.markers.iter().position(|m| m == marker)
    }
}

/// Ordered collection of chromosome maps.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct GeneticMap {
    pub chromosomes: Vec<ChromosomeMap>,
}

impl GeneticMap {
    pub fn new(chromosomes: Vec<ChromosomeMap>) -> Self {
        Self { chromosomes }
    }

    pub fn chr(&self, chr: &str) -> Option<&ChromosomeMap> {
        self.chromosomes.iter().find(|c| c.chr == chr)
    }

    pub fn chr_names(&self) -> Vec<String> {
        self.chromosomes.iter().map(|c| c.chr.clone()).collect()
    }

    pub fn n_markers(&self) -> usize {
        self.chromosomes.iter().map(|c| c.len()).sum()
    }

    /// (chromosome, position) of a marker.
    pub fn find_position(&self, marker: &str) -> Option<(&str, f64)> {
        self.chromosomes.iter().find_map(|c| {
            c.marker_index(marker)
                .map(|i| (c.chr.as_str(), c.positions[i]))
        })
    }

    /// Marker nearest to `pos` on chromosome `chr` (leftmost on ties).
    pub fn find_marker(&self, chr: &str, pos: f64) -> Option<&str> {
        let c = self.chr(chr)?;
        let mut best: Option<(usize, f64)> = None;
        for (i, p) in c.positions.iter().enumerate() {
            let d = (p - pos).abs();
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((i, d));
            }
        }
        best.map(|(i, _)| c.markers[i].as_str())
    }
}

/// Genotype calls for one chromosome: individuals x markers (map order).
#[derive(Clone, Debug)]
pub struct ChromosomeGenotypes {
    pub chr: String,
    /// 0 = missing, otherwise a cross-type genotype code
    pub calls: Array2<u8>,
}

impl ChromosomeGenotypes {
    /// Number of markers with at least one non-missing call.
    pub fn n_typed_markers(&self) -> usize {
        self.calls
            .axis_iter(Axis(1))
            .filter(|col| col.iter().any(|&g| g != 0))
            .count()
    }
}

/// Phenotype table: individuals x phenotype columns, NaN = missing.
#[derive(Clone, Debug)]
pub struct PhenotypeTable {
    pub ind_ids: Vec<IndividualId>,
    pub names: Vec<String>,
    pub values: Array2<f64>,
}

impl PhenotypeTable {
    pub fn new(ind_ids: Vec<IndividualId>, names: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if values.nrows() != ind_ids.len() || values.ncols() != names.len() {
            return Err(QtlError::invalid_data(format!(
                "phenotype matrix is {}x{} but there are {} individuals and {} columns",
                values.nrows(),
                values.ncols(),
                ind_ids.len(),
                names.len()
            ))
            .into());
        }
        check_unique(&ind_ids, "phenotype individual")?;
        Ok(Self {
            ind_ids,
            names,
            values,
        })
    }

    pub fn n_pheno(&self) -> usize {
        self.names.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn column(&self, j: usize) -> ArrayView1<'_, f64> {
        self.values.column(j)
    }

    /// Keep only the named columns, in the given order.
    pub fn select(&self, columns: &[String]) -> Result<Self> {
        let idx: Vec<usize> = columns
            .iter()
            .map(|c| {
                self.column_index(c)
                    .ok_or_else(|| anyhow!("Phenotype '{}' not found", c))
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            ind_ids: self.ind_ids.clone(),
            names: columns.to_vec(),
            values: self.values.select(Axis(1), &idx),
        })
    }
}

/// Covariates as read from file: every column kept as text.
#[derive(Clone, Debug)]
pub struct CovariateTable {
    pub ind_ids: Vec<IndividualId>,
    pub names: Vec<String>,
    /// One entry per column, one value per individual; None = missing
    pub columns: Vec<Vec<Option<String>>>,
}

/// Numeric covariate matrix ready for a design matrix.
#[derive(Clone, Debug)]
pub struct CovariateMatrix {
    pub ind_ids: Vec<IndividualId>,
    pub names: Vec<String>,
    /// individuals x covariates, NaN = missing
    pub values: Array2<f64>,
}

impl CovariateTable {
    /// Convert to numbers. Numeric columns are used as is; a categorical
    /// column with k levels becomes k-1 indicator columns named
    /// `{column}{level}` (first level in sorted order is the baseline).
    pub fn to_matrix(&self, columns: Option<&[String]>) -> Result<CovariateMatrix> {
        let selected: Vec<usize> = match columns {
            Some(cols) => cols
                .iter()
                .map(|c| {
                    self.names
                        .iter()
                        .position(|n| n == c)
                        .ok_or_else(|| anyhow!("Covariate '{}' not found", c))
                })
                .collect::<Result<_>>()?,
            None => (0..self.names.len()).collect(),
        };

        let n = self.ind_ids.len();
        let mut names = Vec::new();
        let mut cols: Vec<Vec<f64>> = Vec::new();

        for &j in &selected {
            let raw = &self.columns[j];
            let parsed: Vec<Option<f64>> = raw
                .iter()
                .map(|v| v.as_ref().and_then(|s| s.parse::<f64>().ok()))
                .collect();
            let numeric = raw
                .iter()
                .zip(&parsed)
                .all(|(r, p)| r.is_none() || p.is_some());

            if numeric {
                names.push(self.names[j].clone());
                cols.push(parsed.iter().map(|p| p.unwrap_or(f64::NAN)).collect());
                continue;
            }

            let mut levels: Vec<&str> = raw.iter().flatten().map(String::as_str).collect();
            levels.sort_unstable();
            levels.dedup();
            for level in levels.iter().skip(1) {
                names.push(format!("{}{}", self.names[j], level));
                cols.push(
                    raw.iter()
                        .map(|v| match v {
                            Some(s) if s == level => 1.0,
                            Some(_) => 0.0,
                            None => f64::NAN,
                        })
                        .collect(),
                );
            }
        }

        let values = Array2::from_shape_fn((n, cols.len()), |(i, k)| cols[k][i]);
        Ok(CovariateMatrix {
            ind_ids: self.ind_ids.clone(),
            names,
            values,
        })
    }
}

/// Founder genotype calls, founders x markers per chromosome.
#[derive(Clone, Debug)]
pub struct FounderGenotypes {
    pub founder_ids: Vec<String>,
    pub chromosomes: Vec<ChromosomeGenotypes>,
}

/// Kinship matrix with individual labels.
#[derive(Clone, Debug)]
pub struct KinshipMatrix {
    pub ind_ids: Vec<IndividualId>,
    pub matrix: Array2<f64>,
}

/// Kinship for a scan: one overall matrix, or one matrix per chromosome.
#[derive(Clone, Debug)]
pub enum Kinship {
    Overall(KinshipMatrix),
    /// Leave-one-chromosome-out: entry c excludes chromosome c
    Loco(Vec<(String, KinshipMatrix)>),
    /// Kinship from each chromosome alone
    PerChromosome(Vec<(String, KinshipMatrix)>),
}

impl Kinship {
    /// Matrix to use when scanning chromosome `chr`.
    pub fn for_chr(&self, chr: &str) -> Option<&KinshipMatrix> {
        match self {
            Kinship::Overall(k) => Some(k),
            Kinship::Loco(ks) | Kinship::PerChromosome(ks) => {
                ks.iter().find(|(c, _)| c == chr).map(|(_, k)| k)
            }
        }
    }

    pub fn ind_ids(&self) -> &[IndividualId] {
        match self {
            Kinship::Overall(k) => &k.ind_ids,
            Kinship::Loco(ks) | Kinship::PerChromosome(ks) => {
                ks.first().map(|(_, k)| k.ind_ids.as_slice()).unwrap_or(&[])
            }
        }
    }

    pub fn is_loco(&self) -> bool {
        matches!(self, Kinship::Loco(_))
    }
}

/// An experimental cross.
#[derive(Clone, Debug)]
pub struct Cross {
    pub crosstype: CrossType,
    pub alleles: Vec<String>,
    pub ind_ids: Vec<IndividualId>,
    pub gmap: GeneticMap,
    pub pmap: Option<GeneticMap>,
    /// Same chromosome order and marker order as `gmap`
    pub geno: Vec<ChromosomeGenotypes>,
    pub pheno: PhenotypeTable,
    pub covar: Option<CovariateTable>,
    pub founder_geno: Option<FounderGenotypes>,
}

impl Cross {
    /// Assemble a cross, checking that genotypes match the map and the
    /// genotype codes are valid for the cross type.
    pub fn new(
        crosstype: CrossType,
        alleles: Vec<String>,
        ind_ids: Vec<IndividualId>,
        gmap: GeneticMap,
        geno: Vec<ChromosomeGenotypes>,
        pheno: PhenotypeTable,
    ) -> Result<Self> {
        check_unique(&ind_ids, "genotyped individual")?;

        if geno.len() != gmap.chromosomes.len() {
            return Err(QtlError::invalid_data(format!(
                "{} chromosomes of genotypes but {} in the genetic map",
                geno.len(),
                gmap.chromosomes.len()
            ))
            .into());
        }

        for (g, m) in geno.iter().zip(&gmap.chromosomes) {
            if g.chr != m.chr {
                return Err(QtlError::invalid_data(format!(
                    "genotype chromosome {} does not match map chromosome {}",
                    g.chr, m.chr
                ))
                .into());
            }
            if g.calls.nrows() != ind_ids.len() || g.calls.ncols() != m.len() {
                return Err(QtlError::invalid_data(format!(
                    "chr {}: genotypes are {}x{}, expected {}x{}",
                    g.chr,
                    g.calls.nrows(),
                    g.calls.ncols(),
                    ind_ids.len(),
                    m.len()
                ))
                .into());
            }
            if let Some(&bad) = g.calls.iter().find(|&&c| !crosstype.is_valid_code(c)) {
                return Err(QtlError::invalid_data(format!(
                    "chr {}: genotype code {} is not valid for a {} cross",
                    g.chr,
                    bad,
                    crosstype.as_str()
                ))
                .into());
            }
        }

        Ok(Self {
            crosstype,
            alleles,
            ind_ids,
            gmap,
            pmap: None,
            geno,
            pheno,
            covar: None,
            founder_geno: None,
        })
    }

    pub fn with_pmap(mut self, pmap: GeneticMap) -> Result<Self> {
        for c in &pmap.chromosomes {
            let g = self.gmap.chr(&c.chr).ok_or_else(|| {
                QtlError::invalid_data(format!("physical map chromosome {} not in genetic map", c.chr))
            })?;
            if c.len() != g.len() {
                return Err(QtlError::invalid_data(format!(
                    "chr {}: physical map has {} markers, genetic map has {}",
                    c.chr,
                    c.len(),
                    g.len()
                ))
                .into());
            }
            if let Some((p, m)) = c.markers.iter().zip(&g.markers).find(|(p, m)| p != m) {
                return Err(QtlError::invalid_data(format!(
                    "chr {}: physical map has marker {} where genetic map has {}",
                    c.chr, p, m
                ))
                .into());
            }
        }
        self.pmap = Some(pmap);
        Ok(self)
    }

    pub fn with_covar(mut self, covar: CovariateTable) -> Self {
        self.covar = Some(covar);
        self
    }

    pub fn with_founder_geno(mut self, founder_geno: FounderGenotypes) -> Self {
        self.founder_geno = Some(founder_geno);
        self
    }

    pub fn n_ind(&self) -> usize {
        self.ind_ids.len()
    }

    pub fn n_chr(&self) -> usize {
        self.gmap.chromosomes.len()
    }

    pub fn n_markers(&self) -> usize {
        self.gmap.n_markers()
    }

    /// Genotype code for one individual at one marker.
    pub fn genotype(&self, ind: &str, marker: &str) -> Option<u8> {
        let i = self.ind_ids.iter().position(|id| id == ind)?;
        self.gmap
            .chromosomes
            .iter()
            .zip(&self.geno)
            .find_map(|(m, g)| m.marker_index(marker).map(|j| g.calls[(i, j)]))
    }

    /// Strain distribution pattern of a marker from the founder genotypes.
    ///
    /// None when there are no founder genotypes or a founder call is missing
    /// or heterozygous.
    pub fn marker_sdp(&self, marker: &str) -> Option<u32> {
        let founders = self.founder_geno.as_ref()?;
        let (ci, j) = self
            .gmap
            .chromosomes
            .iter()
            .enumerate()
            .find_map(|(ci, m)| m.marker_index(marker).map(|j| (ci, j)))?;
        let chr = founders.chromosomes.get(ci)?;
        let homozygous_alt = self.crosstype.n_gen() as u8;
        let alleles: Option<Vec<u8>> = chr
            .calls
            .column(j)
            .iter()
            .map(|&c| match c {
                1 => Some(0),
                c if c == homozygous_alt => Some(1),
                _ => None,
            })
            .collect();
        calc_sdp(&alleles?).ok()
    }

    /// Keep the named chromosomes, in the given order.
    pub fn subset_chr(&self, chrs: &[String]) -> Result<Self> {
        let idx: Vec<usize> = chrs
            .iter()
            .map(|c| {
                self.gmap
                    .chromosomes
                    .iter()
                    .position(|m| &m.chr == c)
                    .ok_or_else(|| anyhow!("Chromosome '{}' not found", c))
            })
            .collect::<Result<_>>()?;

        let mut out = self.clone();
        out.gmap = GeneticMap::new(idx.iter().map(|&i| self.gmap.chromosomes[i].clone()).collect());
        out.geno = idx.iter().map(|&i| self.geno[i].clone()).collect();
        out.pmap = self.pmap.as_ref().map(|p| {
            GeneticMap::new(
                chrs.iter()
                    .filter_map(|c| p.chr(c).cloned())
                    .collect(),
            )
        });
        out.founder_geno = self.founder_geno.as_ref().map(|f| FounderGenotypes {
            founder_ids: f.founder_ids.clone(),
            chromosomes: idx
                .iter()
                .filter_map(|&i| f.chromosomes.get(i).cloned())
                .collect(),
        });
        Ok(out)
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
                    .ok_or_else(|| anyhow!("Individual '{}' not found", id))
            })
            .collect::<Result<_>>()?;

        let mut out = self.clone();
        out.ind_ids = ids.to_vec();
        out.geno = self
            .geno
            .iter()
            .map(|g| ChromosomeGenotypes {
                chr: g.chr.clone(),
                calls: g.calls.select(Axis(0), &idx),
            })
            .collect();
        Ok(out)
    }
}

pub(crate) fn check_unique(ids: &[String], what: &str) -> Result<()> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(id.as_str()) {
            return Err(QtlError::invalid_data(format!("duplicate {} ID '{}'", what, id)).into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn map3() -> GeneticMap {
        GeneticMap::new(vec![ChromosomeMap::new(
            "1",
            vec!["m2".into(), "m1".into(), "m3".into()],
            vec![10.0, 0.0, 25.0],
        )
        .unwrap()])
    }

    #[test]
    fn test_chromosome_map_sorted() {
        let m = map3();
        let c = m.chr("1").unwrap();
        assert_eq!(c.markers, vec!["m1", "m2", "m3"]);
        assert_eq!(c.positions, vec![0.0, 10.0, 25.0]);
        assert_eq!(c.span(), 25.0);
    }

    #[test]
    fn test_tied_positions_rejected() {
        let err = ChromosomeMap::new("1", vec!["a".into(), "b".into()], vec![5.0, 5.0]).unwrap_err();
        assert!(QtlError::is_invalid_data(&err));
    }

    #[test]
    fn test_find_marker_and_position() {
        let m = map3();
        assert_eq!(m.find_marker("1", 14.0), Some("m2"));
        assert_eq!(m.find_marker("1", 5.0), Some("m1"));
        assert_eq!(m.find_position("m3"), Some(("1", 25.0)));
        assert_eq!(m.find_position("nope"), None);
    }

    #[test]
    fn test_cross_rejects_bad_codes() {
        let gmap = map3();
        let pheno = PhenotypeTable::new(
            vec!["a".into()],
            vec!["y".into()],
            array![[1.0]],
        )
        .unwrap();
        let geno = vec![ChromosomeGenotypes {
            chr: "1".into(),
            calls: array![[1, 3, 2]],
        }];
        let res = Cross::new(
            CrossType::BC,
            vec!["A".into(), "B".into()],
            vec!["a".into()],
            gmap,
            geno,
            pheno,
        );
        assert!(res.is_err());
    }

    fn one_ind_cross() -> Cross {
        let pheno = PhenotypeTable::new(vec!["a".into()], vec!["y".into()], array![[1.0]]).unwrap();
        let geno = vec![ChromosomeGenotypes {
            chr: "1".into(),
            calls: array![[1, 2, 1]],
        }];
        Cross::new(
            CrossType::BC,
            vec!["A".into(), "B".into()],
            vec!["a".into()],
            map3(),
            geno,
            pheno,
        )
        .unwrap()
    }

    #[test]
    fn test_pmap_must_match_markers() {
        let pmap = |names: [&str; 3]| {
            GeneticMap::new(vec![ChromosomeMap::new(
                "1",
                names.iter().map(|n| n.to_string()).collect(),
                vec![1.0e6, 2.0e6, 3.0e6],
            )
            .unwrap()])
        };
        let cross = one_ind_cross().with_pmap(pmap(["m1", "m2", "m3"])).unwrap();
        assert!(cross.pmap.is_some());

        let err = one_ind_cross().with_pmap(pmap(["m1", "m3", "m2"])).unwrap_err();
        assert!(QtlError::is_invalid_data(&err));
        assert!(err.to_string().contains("m3"));

        let err = one_ind_cross().with_pmap(pmap(["m1", "m2", "m9"])).unwrap_err();
        assert!(QtlError::is_invalid_data(&err));
    }

    #[test]
    fn test_covariate_expansion() {
        let covar = CovariateTable {
            ind_ids: vec!["a".into(), "b".into(), "c".into()],
            names: vec!["sex".into(), "age".into()],
            columns: vec![
                vec![Some("f".into()), Some("m".into()), None],
                vec![Some("1.5".into()), Some("2".into()), Some("3".into())],
            ],
        };
        let m = covar.to_matrix(None).unwrap();
        assert_eq!(m.names, vec!["sexm", "age"]);
        assert_eq!(m.values[(0, 0)], 0.0);
        assert_eq!(m.values[(1, 0)], 1.0);
        assert!(m.values[(2, 0)].is_nan());
        assert_eq!(m.values[(0, 1)], 1.5);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let res = PhenotypeTable::new(
            vec!["a".into(), "a".into()],
            vec!["y".into()],
            array![[1.0], [2.0]],
        );
        assert!(res.is_err());
    }
}
