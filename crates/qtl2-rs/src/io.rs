//! File input and output
//!
//! `read_cross2` loads a cross from a JSON control file naming CSV component
//! files (geno, pheno, gmap, pmap, covar, founder_geno), any of which may be
//! gzip-compressed. Writers produce CSV (TSV for kinship) tables of each
//! pipeline stage, and readers load scan, permutation and kinship tables back.

use anyhow::{anyhow, Context, Result};
use flate2::read::MultiGzDecoder;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::cross::CrossType;
use crate::effects::{Maxmarg, ScanCoef};
use crate::error::QtlError;
use crate::genoprob::Genoprobs;
use crate::peaks::{natural_chrom_cmp, Peak};
use crate::perm::PermutationResult;
use crate::scan::{ChromosomeScan, ScanResult};
use crate::types::{
    ChromosomeGenotypes, ChromosomeMap, CovariateTable, Cross, FounderGenotypes, GeneticMap,
    KinshipMatrix, PhenotypeTable,
};

/// Open a text file, decompressing `.gz` files.
fn open_text(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let is_gz = path
        .extension()
        .map_or(false, |e| e.eq_ignore_ascii_case("gz"));
    if is_gz {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Detect delimiter (comma, tab, space) from the first line that is not a
/// `#` comment.
pub fn detect_delimiter<P: AsRef<Path>>(path: P) -> Result<u8> {
    let rdr = BufReader::new(open_text(path.as_ref())?);
    for line in rdr.lines() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        return Ok(if line.contains('\t') {
            b'\t'
        } else if line.contains(',') {
            b','
        } else {
            b' '
        });
    }
    Ok(b',')
}

/// Header plus records with their line numbers.
struct Table {
    file: String,
    header: Vec<String>,
    rows: Vec<(usize, Vec<String>)>,
}

impl Table {
    fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }
}

fn csv_error(file: &str, e: csv::Error) -> anyhow::Error {
    let line = e.position().map_or(0, |p| p.line() as usize);
    QtlError::parse(file, line, e.to_string()).into()
}

fn read_table(path: &Path, sep: Option<u8>, comment: Option<u8>) -> Result<Table> {
    let file = path.display().to_string();
    let delim = match sep {
        Some(d) => d,
        None => detect_delimiter(path)?,
    };
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delim)
        .comment(comment)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(open_text(path)?);

    let header: Vec<String> = rdr
        .headers()
        .map_err(|e| csv_error(&file, e))?
        .iter()
        .map(|s| s.to_string())
        .collect();
    if header.is_empty() {
        return Err(QtlError::parse(&file, 1, "empty file").into());
    }

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(|e| csv_error(&file, e))?;
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        let line = record.position().map_or(0, |p| p.line() as usize);
        rows.push((line, record.iter().map(|s| s.to_string()).collect()));
    }
    Ok(Table { file, header, rows })
}

/// R/qtl2-style control file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFile {
    pub crosstype: String,
    pub geno: String,
    pub pheno: Option<String>,
    pub gmap: String,
    pub pmap: Option<String>,
    pub founder_geno: Option<String>,
    pub covar: Option<String>,
    #[serde(default)]
    pub alleles: Vec<String>,
    /// Genotype symbol -> code; defaults to the cross type's table
    pub genotypes: Option<BTreeMap<String, u8>>,
    #[serde(rename = "na.strings", default = "default_na_strings")]
    pub na_strings: Vec<String>,
    pub sep: Option<String>,
    #[serde(rename = "comment.char", default = "default_comment")]
    pub comment_char: Option<String>,
    #[serde(default)]
    pub geno_transposed: bool,
    #[serde(default)]
    pub founder_geno_transposed: bool,
}

fn default_na_strings() -> Vec<String> {
    vec!["-".to_string(), "NA".to_string()]
}

fn default_comment() -> Option<String> {
    Some("#".to_string())
}

fn single_byte(value: &Option<String>, what: &str) -> Result<Option<u8>> {
    match value.as_deref() {
        None | Some("") => Ok(None),
        Some("\\t") => Ok(Some(b'\t')),
        Some(s) if s.len() == 1 => Ok(Some(s.as_bytes()[0])),
        Some(s) => Err(QtlError::config(format!("{} must be one character, got '{}'", what, s)).into()),
    }
}

/// Shared parsing settings from the control file.
struct Format {
    sep: Option<u8>,
    comment: Option<u8>,
    na: Vec<String>,
}

impl Format {
    fn is_na(&self, s: &str) -> bool {
        s.is_empty() || self.na.iter().any(|n| n == s)
    }
}

/// Load a cross from a JSON control file.
pub fn read_cross2<P: AsRef<Path>>(path: P) -> Result<Cross> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read control file {}", path.display()))?;
    let control: ControlFile = serde_json::from_str(&text)
        .map_err(|e| QtlError::parse(path.display().to_string(), e.line(), e.to_string()))?;
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let crosstype = CrossType::from_str(&control.crosstype).ok_or_else(|| {
        anyhow::Error::from(QtlError::config(format!(
            "unsupported cross type '{}'",
            control.crosstype
        )))
    })?;
    let alleles = if control.alleles.is_empty() {
        vec!["A".to_string(), "B".to_string()]
    } else {
        control.alleles.clone()
    };
    let codes: HashMap<String, u8> = match &control.genotypes {
        Some(g) => g.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        None => crosstype.default_genotype_codes(&alleles).into_iter().collect(),
    };
    if let Some((sym, code)) = codes
        .iter()
        .find(|(_, c)| **c == 0 || !crosstype.is_valid_code(**c))
    {
        return Err(QtlError::config(format!(
            "genotype '{}' has code {}, not valid for a {} cross",
            sym,
            code,
            crosstype.as_str()
        ))
        .into());
    }

    let fmt = Format {
        sep: single_byte(&control.sep, "sep")?,
        comment: single_byte(&control.comment_char, "comment.char")?,
        na: control.na_strings.clone(),
    };

    tracing::info!("read_cross2: {} cross from {}", crosstype.as_str(), path.display());

    let gmap = read_map(&dir.join(&control.gmap), &fmt)?;
    let (ind_ids, geno) = read_genotypes(
        &dir.join(&control.geno),
        &fmt,
        control.geno_transposed,
        &gmap,
        &codes,
    )?;

    let pheno = match &control.pheno {
        Some(p) => read_phenotypes(&dir.join(p), &fmt)?,
        None => PhenotypeTable::new(ind_ids.clone(), Vec::new(), Array2::zeros((ind_ids.len(), 0)))?,
    };

    let mut cross = Cross::new(crosstype, alleles, ind_ids, gmap, geno, pheno)?;

    if let Some(p) = &control.pmap {
        let pmap = read_map(&dir.join(p), &fmt)?;
        cross = cross.with_pmap(pmap)?;
    }
    if let Some(c) = &control.covar {
        cross = cross.with_covar(read_covariates(&dir.join(c), &fmt)?);
    }
    if let Some(f) = &control.founder_geno {
        let (founder_ids, chromosomes) = read_genotypes(
            &dir.join(f),
            &fmt,
            control.founder_geno_transposed,
            &cross.gmap,
            &codes,
        )?;
        cross = cross.with_founder_geno(FounderGenotypes {
            founder_ids,
            chromosomes,
        });
    }

    tracing::info!(
        "read_cross2: {} individuals, {} chromosomes, {} markers, {} phenotypes",
        cross.n_ind(),
        cross.n_chr(),
        cross.n_markers(),
        cross.pheno.n_pheno()
    );
    Ok(cross)
}

fn parse_f64(table: &Table, line: usize, s: &str, fmt: &Format) -> Result<f64> {
    if fmt.is_na(s) {
        return Ok(f64::NAN);
    }
    s.parse::<f64>().map_err(|_| {
        QtlError::parse(&table.file, line, format!("'{}' is not a number", s)).into()
    })
}

/// Map with marker, chr, pos columns (by name, else the first three).
fn read_map(path: &Path, fmt: &Format) -> Result<GeneticMap> {
    let table = read_table(path, fmt.sep, fmt.comment)?;
    if table.header.len() < 3 {
        return Err(QtlError::parse(&table.file, 1, "map needs marker, chr and pos columns").into());
    }
    let i_marker = table.column("marker").unwrap_or(0);
    let i_chr = table.column("chr").unwrap_or(1);
    let i_pos = table.column("pos").unwrap_or(2);

    let mut by_chr: BTreeMap<String, (Vec<String>, Vec<f64>)> = BTreeMap::new();
    let mut seen = std::collections::HashSet::new();
    for (line, row) in &table.rows {
        let get = |i: usize| row.get(i).map(String::as_str).unwrap_or("");
        let marker = get(i_marker).to_string();
        if !seen.insert(marker.clone()) {
            return Err(QtlError::parse(&table.file, *line, format!("duplicate marker '{}'", marker)).into());
        }
        let pos = parse_f64(&table, *line, get(i_pos), fmt)?;
        let entry = by_chr.entry(get(i_chr).to_string()).or_default();
        entry.0.push(marker);
        entry.1.push(pos);
    }

    let mut chrs: Vec<String> = by_chr.keys().cloned().collect();
    chrs.sort_by(|a, b| natural_chrom_cmp(a, b));
    let chromosomes = chrs
        .into_iter()
        .map(|c| {
            let (markers, positions) = by_chr.remove(&c).unwrap_or_default();
            ChromosomeMap::new(c, markers, positions)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(GeneticMap::new(chromosomes))
}

/// Genotype calls per chromosome in map order.
///
/// Markers absent from the file are kept with all calls missing; markers
/// absent from the map are an error. Symbols not in the code table become
/// missing with a warning.
fn read_genotypes(
    path: &Path,
    fmt: &Format,
    transposed: bool,
    gmap: &GeneticMap,
    codes: &HashMap<String, u8>,
) -> Result<(Vec<String>, Vec<ChromosomeGenotypes>)> {
    let table = read_table(path, fmt.sep, fmt.comment)?;

    // cells[marker] = one symbol per individual
    let (ids, cells): (Vec<String>, HashMap<String, Vec<String>>) = if transposed {
        let ids = table.header[1..].to_vec();
        let cells = table
            .rows
            .iter()
            .map(|(_, row)| (row[0].clone(), row[1..].to_vec()))
            .collect();
        (ids, cells)
    } else {
        let ids: Vec<String> = table.rows.iter().map(|(_, row)| row[0].clone()).collect();
        let cells = table.header[1..]
            .iter()
            .enumerate()
            .map(|(j, m)| {
                let col = table
                    .rows
                    .iter()
                    .map(|(_, row)| row.get(j + 1).cloned().unwrap_or_default())
                    .collect();
                (m.clone(), col)
            })
            .collect();
        (ids, cells)
    };

    if let Some(m) = cells.keys().find(|m| gmap.find_position(m).is_none()) {
        return Err(QtlError::invalid_data(format!(
            "{}: marker '{}' is not in the genetic map",
            table.file, m
        ))
        .into());
    }

    let n = ids.len();
    let mut unknown = 0usize;
    let chromosomes = gmap
        .chromosomes
        .iter()
        .map(|c| {
            let mut calls = Array2::<u8>::zeros((n, c.len()));
            for (j, m) in c.markers.iter().enumerate() {
                let Some(col) = cells.get(m) else { continue };
                for (i, s) in col.iter().enumerate().take(n) {
                    if fmt.is_na(s) {
                        continue;
                    }
                    match codes.get(s.as_str()) {
                        Some(&code) => calls[(i, j)] = code,
                        None => unknown += 1,
                    }
                }
            }
            ChromosomeGenotypes {
                chr: c.chr.clone(),
                calls,
            }
        })
        .collect();

    if unknown > 0 {
        tracing::warn!(
            "{}: {} genotype calls with unknown symbols treated as missing",
            table.file,
            unknown
        );
    }
    Ok((ids, chromosomes))
}

fn read_phenotypes(path: &Path, fmt: &Format) -> Result<PhenotypeTable> {
    let table = read_table(path, fmt.sep, fmt.comment)?;
    let names = table.header[1..].to_vec();
    let mut ids = Vec::with_capacity(table.rows.len());
    let mut values = Array2::<f64>::from_elem((table.rows.len(), names.len()), f64::NAN);
    for (i, (line, row)) in table.rows.iter().enumerate() {
        ids.push(row[0].clone());
        for j in 0..names.len() {
            let s = row.get(j + 1).map(String::as_str).unwrap_or("");
            values[(i, j)] = parse_f64(&table, *line, s, fmt)?;
        }
    }
    PhenotypeTable::new(ids, names, values)
}

fn read_covariates(path: &Path, fmt: &Format) -> Result<CovariateTable> {
    let table = read_table(path, fmt.sep, fmt.comment)?;
    let names = table.header[1..].to_vec();
    let ind_ids: Vec<String> = table.rows.iter().map(|(_, row)| row[0].clone()).collect();
    crate::types::check_unique(&ind_ids, "covariate individual")?;
    let columns = (0..names.len())
        .map(|j| {
            table
                .rows
                .iter()
                .map(|(_, row)| {
                    let s = row.get(j + 1).map(String::as_str).unwrap_or("");
                    if fmt.is_na(s) {
                        None
                    } else {
                        Some(s.to_string())
                    }
                })
                .collect()
        })
        .collect();
    Ok(CovariateTable {
        ind_ids,
        names,
        columns,
    })
}

fn fmt_value(v: f64) -> String {
    if v.is_nan() {
        "NA".to_string()
    } else {
        format!("{:.6}", v)
    }
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// LOD scores: marker, chr, pos, one column per phenotype.
pub fn write_scan1<P: AsRef<Path>>(path: P, scan: &ScanResult) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(create(path.as_ref())?);
    let mut header = vec!["marker".to_string(), "chr".to_string(), "pos".to_string()];
    header.extend(scan.pheno_names.iter().cloned());
    wtr.write_record(&header)?;

    for c in &scan.chromosomes {
        for (k, name) in c.names.iter().enumerate() {
            let mut row = vec![name.clone(), c.chr.clone(), fmt_value(c.positions[k])];
            row.extend(c.lod.row(k).iter().map(|&v| fmt_value(v)));
            wtr.write_record(&row)?;
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Read a table written by `write_scan1`.
///
/// Positions named `c{chr}.loc{k}` are taken to be pseudomarkers.
pub fn read_scan1<P: AsRef<Path>>(path: P) -> Result<ScanResult> {
    let table = read_table(path.as_ref(), Some(b','), None)?;
    if table.header.len() < 4 {
        return Err(QtlError::parse(&table.file, 1, "scan table needs marker, chr, pos and LOD columns").into());
    }
    let pheno_names = table.header[3..].to_vec();
    let n_pheno = pheno_names.len();

    let mut chromosomes: Vec<(String, Vec<String>, Vec<f64>, Vec<f64>)> = Vec::new();
    for (line, row) in &table.rows {
        let chr = row.get(1).cloned().unwrap_or_default();
        if chromosomes.last().map_or(true, |c| c.0 != chr) {
            chromosomes.push((chr.clone(), Vec::new(), Vec::new(), Vec::new()));
        }
        let entry = chromosomes.last_mut().ok_or_else(|| anyhow!("empty scan table"))?;
        entry.1.push(row[0].clone());
        entry.2.push(parse_number(&table, *line, row.get(2))?);
        for j in 0..n_pheno {
            entry.3.push(parse_number(&table, *line, row.get(j + 3))?);
        }
    }

    let chromosomes = chromosomes
        .into_iter()
        .map(|(chr, names, positions, lods)| {
            let prefix = format!("c{}.loc", chr);
            let is_marker = names.iter().map(|n| !n.starts_with(&prefix)).collect();
            let lod = Array2::from_shape_vec((names.len(), n_pheno), lods)?;
            Ok(ChromosomeScan {
                chr,
                names,
                positions,
                is_marker,
                lod,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ScanResult {
        n_ind: vec![0; n_pheno],
        pheno_names,
        chromosomes,
        hsq: None,
    })
}

fn parse_number(table: &Table, line: usize, s: Option<&String>) -> Result<f64> {
    match s.map(String::as_str) {
        None | Some("") | Some("NA") => Ok(f64::NAN),
        Some(v) => v.parse::<f64>().map_err(|_| {
            QtlError::parse(&table.file, line, format!("'{}' is not a number", v)).into()
        }),
    }
}

pub fn write_peaks<P: AsRef<Path>>(path: P, peaks: &[Peak]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(create(path.as_ref())?);
    wtr.write_record(["lodindex", "pheno", "chr", "marker", "pos", "lod", "ci_lo", "ci_hi"])?;
    for p in peaks {
        wtr.write_record(&[
            (p.pheno_index + 1).to_string(),
            p.pheno.clone(),
            p.chr.clone(),
            p.marker.clone(),
            fmt_value(p.pos),
            fmt_value(p.lod),
            p.ci_lo.map_or("NA".to_string(), fmt_value),
            p.ci_hi.map_or("NA".to_string(), fmt_value),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Permutation maxima with the seed on a leading `# seed=` line.
pub fn write_perm<P: AsRef<Path>>(path: P, perm: &PermutationResult) -> Result<()> {
    let mut out = create(path.as_ref())?;
    writeln!(out, "# seed={}", perm.seed)?;
    let mut wtr = csv::Writer::from_writer(out);
    let mut header = vec!["replicate".to_string()];
    header.extend(perm.pheno_names.iter().cloned());
    wtr.write_record(&header)?;
    for (i, row) in perm.maxlod.outer_iter().enumerate() {
        let mut rec = vec![(i + 1).to_string()];
        rec.extend(row.iter().map(|&v| fmt_value(v)));
        wtr.write_record(&rec)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn read_perm<P: AsRef<Path>>(path: P) -> Result<PermutationResult> {
    let path = path.as_ref();
    let mut first = String::new();
    BufReader::new(open_text(path)?).read_line(&mut first)?;
    let seed = first
        .trim()
        .strip_prefix("# seed=")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let table = read_table(path, Some(b','), Some(b'#'))?;
    let pheno_names = table.header[1..].to_vec();
    let n_pheno = pheno_names.len();
    let mut values = Vec::with_capacity(table.rows.len() * n_pheno);
    for (line, row) in &table.rows {
        for j in 0..n_pheno {
            values.push(parse_number(&table, *line, row.get(j + 1))?);
        }
    }
    let maxlod = Array2::from_shape_vec((table.rows.len(), n_pheno), values)?;
    Ok(PermutationResult {
        pheno_names,
        maxlod,
        seed,
    })
}

/// Genotype probabilities in long form: one row per individual and position.
pub fn write_genoprobs<P: AsRef<Path>>(path: P, probs: &Genoprobs) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(create(path.as_ref())?);
    let mut header = vec![
        "ind".to_string(),
        "chr".to_string(),
        "marker".to_string(),
        "pos".to_string(),
    ];
    header.extend(probs.states.iter().cloned());
    wtr.write_record(&header)?;

    for c in &probs.chromosomes {
        for (i, id) in probs.ind_ids.iter().enumerate() {
            for (k, name) in c.names.iter().enumerate() {
                let mut row = vec![id.clone(), c.chr.clone(), name.clone(), fmt_value(c.positions[k])];
                row.extend((0..probs.n_states()).map(|g| fmt_value(c.probs[(i, g, k)])));
                wtr.write_record(&row)?;
            }
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Kinship matrix as a tab-separated square table: id, then one column per individual.
pub fn write_kinship<P: AsRef<Path>>(path: P, kin: &KinshipMatrix) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(create(path.as_ref())?);
    let mut header = vec!["id".to_string()];
    header.extend(kin.ind_ids.iter().cloned());
    wtr.write_record(&header)?;

    for (id, row) in kin.ind_ids.iter().zip(kin.matrix.outer_iter()) {
        let mut rec = vec![id.clone()];
        rec.extend(row.iter().map(|&v| fmt_value(v)));
        wtr.write_record(&rec)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Load a kinship matrix written by `write_kinship`.
pub fn load_kinship<P: AsRef<Path>>(path: P) -> Result<KinshipMatrix> {
    let table = read_table(path.as_ref(), None, None)?;
    let col_ids: Vec<String> = table.header[1..].to_vec();
    let n = col_ids.len();
    if table.rows.len() != n {
        return Err(QtlError::invalid_data(format!(
            "Kinship matrix not square: {} rows, {} cols",
            table.rows.len(),
            n
        ))
        .into());
    }

    let mut matrix = Array2::<f64>::zeros((n, n));
    let mut row_ids = Vec::with_capacity(n);
    for (i, (line, row)) in table.rows.iter().enumerate() {
        row_ids.push(row[0].clone());
        for j in 0..n {
            matrix[(i, j)] = parse_number(&table, *line, row.get(j + 1))?;
        }
    }
    if row_ids != col_ids {
        return Err(QtlError::invalid_data("kinship row and column IDs differ").into());
    }
    Ok(KinshipMatrix {
        ind_ids: row_ids,
        matrix,
    })
}

/// Coefficients along a chromosome: marker, pos, then coefficient and SE columns.
pub fn write_coef<P: AsRef<Path>>(path: P, coef: &ScanCoef) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(create(path.as_ref())?);
    let mut header = vec!["marker".to_string(), "chr".to_string(), "pos".to_string()];
    header.extend(coef.coef_names.iter().cloned());
    header.extend(coef.coef_names.iter().map(|n| format!("{}_se", n)));
    header.push("lod".to_string());
    wtr.write_record(&header)?;

    for (k, name) in coef.names.iter().enumerate() {
        let mut row = vec![name.clone(), coef.chr.clone(), fmt_value(coef.positions[k])];
        row.extend(coef.coef.row(k).iter().map(|&v| fmt_value(v)));
        row.extend(coef.se.row(k).iter().map(|&v| fmt_value(v)));
        row.push(fmt_value(coef.lod[k]));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Inferred genotypes: one row per individual, one column per position.
pub fn write_maxmarg<P: AsRef<Path>>(path: P, mm: &Maxmarg) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(create(path.as_ref())?);
    let mut header = vec!["ind".to_string()];
    for c in &mm.chromosomes {
        header.extend(c.names.iter().cloned());
    }
    wtr.write_record(&header)?;

    for (i, id) in mm.ind_ids.iter().enumerate() {
        let mut row = vec![id.clone()];
        for c in &mm.chromosomes {
            row.extend(c.calls.row(i).iter().map(|call| match call {
                Some(g) => mm.states[*g].clone(),
                None => "NA".to_string(),
            }));
        }
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Output path `dir/name`, creating `dir` if needed.
pub fn output_path<P: AsRef<Path>>(dir: P, name: &str) -> Result<PathBuf> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    Ok(dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_detect_delimiter() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "# comment, with commas").unwrap();
        writeln!(f, "id\tm1\tm2").unwrap();
        assert_eq!(detect_delimiter(f.path()).unwrap(), b'\t');
    }

    fn write(dir: &Path, name: &str, text: &str) {
        std::fs::write(dir.join(name), text).unwrap();
    }

    fn toy_cross_dir() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "cross.json",
            r#"{"crosstype": "f2", "geno": "geno.csv", "pheno": "pheno.csv",
                "gmap": "gmap.csv", "covar": "covar.csv", "alleles": ["B", "D"],
                "genotypes": {"BB": 1, "BD": 2, "DD": 3, "notDD": 4}}"#,
        );
        write(
            dir.path(),
            "gmap.csv",
            "# genetic map\nmarker,chr,pos\nm2,1,10\nm1,1,0\nm3,10,5\nm4,2,0\nm5,1,20\n",
        );
        write(
            dir.path(),
            "geno.csv",
            "id,m1,m2,m3,m4\ni1,BB,BD,DD,-\ni2,DD,XX,BB,BD\ni3,notDD,BB,,DD\n",
        );
        write(dir.path(), "pheno.csv", "id,liver,spleen\ni1,10.5,NA\ni2,11,3\ni3,9.25,4\n");
        write(dir.path(), "covar.csv", "id,sex\ni1,f\ni2,m\ni3,NA\n");
        dir
    }

    #[test]
    fn test_read_cross2() {
        let dir = toy_cross_dir();
        let cross = read_cross2(dir.path().join("cross.json")).unwrap();
        assert_eq!(cross.crosstype, CrossType::F2);
        assert_eq!(cross.gmap.chr_names(), vec!["1", "2", "10"]);
        assert_eq!(cross.gmap.chr("1").unwrap().markers, vec!["m1", "m2", "m5"]);

        assert_eq!(cross.genotype("i1", "m1"), Some(1));
        assert_eq!(cross.genotype("i1", "m4"), Some(0));
        // unknown symbol and empty cell become missing
        assert_eq!(cross.genotype("i2", "m2"), Some(0));
        assert_eq!(cross.genotype("i3", "m3"), Some(0));
        assert_eq!(cross.genotype("i3", "m1"), Some(4));
        // map marker without genotype data
        assert_eq!(cross.genotype("i1", "m5"), Some(0));

        assert_eq!(cross.pheno.names, vec!["liver", "spleen"]);
        assert!(cross.pheno.values[(0, 1)].is_nan());
        assert_relative_eq!(cross.pheno.values[(2, 0)], 9.25);
        let covar = cross.covar.as_ref().unwrap();
        assert_eq!(covar.columns[0][2], None);
    }

    #[test]
    fn test_marker_not_in_map_is_error() {
        let dir = toy_cross_dir();
        write(dir.path(), "geno.csv", "id,m1,mX\ni1,BB,BB\n");
        let err = read_cross2(dir.path().join("cross.json")).unwrap_err();
        assert!(QtlError::is_invalid_data(&err));
    }

    #[test]
    fn test_gz_and_transposed_genotypes() {
        let dir = toy_cross_dir();
        write(
            dir.path(),
            "cross.json",
            r#"{"crosstype": "riself", "geno": "geno.csv.gz", "gmap": "gmap.csv",
                "geno_transposed": true}"#,
        );
        let file = File::create(dir.path().join("geno.csv.gz")).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(b"marker,a,b\nm1,AA,BB\nm2,BB,-\n").unwrap();
        enc.finish().unwrap();

        let cross = read_cross2(dir.path().join("cross.json")).unwrap();
        assert_eq!(cross.ind_ids, vec!["a", "b"]);
        assert_eq!(cross.genotype("b", "m1"), Some(2));
        assert_eq!(cross.genotype("b", "m2"), Some(0));
        assert_eq!(cross.pheno.n_pheno(), 0);
    }

    #[test]
    fn test_bad_phenotype_is_parse_error() {
        let dir = toy_cross_dir();
        write(dir.path(), "pheno.csv", "id,liver\ni1,10\ni2,abc\n");
        let err = read_cross2(dir.path().join("cross.json")).unwrap_err();
        match err.downcast_ref::<QtlError>() {
            Some(QtlError::Parse { line, .. }) => assert_eq!(*line, 3),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_scan_and_perm_tables() {
        let dir = tempdir().unwrap();
        let scan = ScanResult {
            pheno_names: vec!["y".into()],
            n_ind: vec![10],
            chromosomes: vec![ChromosomeScan {
                chr: "1".into(),
                names: vec!["m1".into(), "c1.loc1".into()],
                positions: vec![0.0, 1.0],
                is_marker: vec![true, false],
                lod: Array2::from_shape_vec((2, 1), vec![1.5, 2.25]).unwrap(),
            }],
            hsq: None,
        };
        let path = dir.path().join("scan.csv");
        write_scan1(&path, &scan).unwrap();
        let back = read_scan1(&path).unwrap();
        assert_eq!(back.chromosomes[0].names, scan.chromosomes[0].names);
        assert_eq!(back.chromosomes[0].is_marker, vec![true, false]);
        assert_relative_eq!(back.chromosomes[0].lod[(1, 0)], 2.25);

        let perm = PermutationResult {
            pheno_names: vec!["y".into()],
            maxlod: Array2::from_shape_vec((3, 1), vec![1.0, 2.0, 3.0]).unwrap(),
            seed: 42,
        };
        let path = dir.path().join("perm.csv");
        write_perm(&path, &perm).unwrap();
        let back = read_perm(&path).unwrap();
        assert_eq!(back.seed, 42);
        assert_eq!(back.maxlod, perm.maxlod);
    }

    #[test]
    fn test_kinship_table() {
        let dir = tempdir().unwrap();
        let kin = KinshipMatrix {
            ind_ids: vec!["a".into(), "b".into()],
            matrix: Array2::from_shape_vec((2, 2), vec![1.0, 0.25, 0.25, 1.0]).unwrap(),
        };
        let path = dir.path().join("kinship.tsv");
        write_kinship(&path, &kin).unwrap();
        let back = load_kinship(&path).unwrap();
        assert_eq!(back.ind_ids, kin.ind_ids);
        assert_eq!(back.matrix, kin.matrix);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next(), Some("id\ta\tb"));
        assert_eq!(text.lines().nth(1), Some("a\t1.000000\t0.250000"));
    }

    #[test]
    fn test_kinship_table_rounding_and_ids() {
        let dir = tempdir().unwrap();
        let kin = KinshipMatrix {
            ind_ids: vec!["x".into(), "y".into(), "z".into()],
            matrix: Array2::from_shape_fn((3, 3), |(i, j)| if i == j { 1.0 } else { 1.0 / 3.0 }),
        };
        let path = dir.path().join("k.tsv");
        write_kinship(&path, &kin).unwrap();
        let back = load_kinship(&path).unwrap();
        for (a, b) in back.matrix.iter().zip(kin.matrix.iter()) {
            assert!((a - b).abs() < 1e-6);
        }

        let text = std::fs::read_to_string(&path).unwrap().replacen("\nx\t", "\nw\t", 1);
        std::fs::write(&path, text).unwrap();
        let err = load_kinship(&path).unwrap_err();
        assert!(QtlError::is_invalid_data(&err));
    }
}
