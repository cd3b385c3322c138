//! Whole-pipeline run from an analysis config, plus helpers shared with the
//! single-stage subcommands.

use anyhow::{Context, Result};
use qtl2_rs::*;
use qtlx_plotting::{plot_pxg, plot_scan, PlotConfig};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Phenotype columns by name, or all of them.
pub fn select_phenotypes(cross: &Cross, names: Option<&[String]>) -> Result<PhenotypeTable> {
    let pheno = match names {
        Some(n) => cross.pheno.select(n)?,
        None => cross.pheno.clone(),
    };
    if pheno.n_pheno() == 0 {
        anyhow::bail!("No phenotypes to analyse");
    }
    Ok(pheno)
}

/// Additive covariate matrix from the cross's covariate file.
pub fn covariate_matrix(cross: &Cross, names: Option<&[String]>) -> Result<Option<CovariateMatrix>> {
    let Some(names) = names else {
        return Ok(None);
    };
    let covar = cross
        .covar
        .as_ref()
        .context("Covariates requested but the cross has no covariate file")?;
    Ok(Some(covar.to_matrix(Some(names))?))
}

/// Individual -> stratum from one covariate column; missing values are left out.
pub fn strata_map(cross: &Cross, column: &str) -> Result<HashMap<String, String>> {
    let covar = cross
        .covar
        .as_ref()
        .context("Strata requested but the cross has no covariate file")?;
    let j = covar
        .names
        .iter()
        .position(|n| n == column)
        .with_context(|| format!("Strata column '{}' not found in covariates", column))?;

    Ok(covar
        .ind_ids
        .iter()
        .zip(&covar.columns[j])
        .filter_map(|(id, v)| v.as_ref().map(|s| (id.clone(), s.clone())))
        .collect())
}

/// Write every matrix of a kinship set; returns the files written.
pub fn write_kinship_set(dir: &Path, kinship: &Kinship) -> Result<Vec<PathBuf>> {
    let (prefix, mats): (&str, Vec<(&str, &KinshipMatrix)>) = match kinship {
        Kinship::Overall(k) => {
            let path = output_path(dir, "kinship.tsv")?;
            write_kinship(&path, k)?;
            return Ok(vec![path]);
        }
        Kinship::Loco(ks) => ("kinship_loco", ks.iter().map(|(c, k)| (c.as_str(), k)).collect()),
        Kinship::PerChromosome(ks) => {
            ("kinship_chr", ks.iter().map(|(c, k)| (c.as_str(), k)).collect())
        }
    };

    let mut written = Vec::with_capacity(mats.len());
    for (chr, k) in mats {
        let path = output_path(dir, &format!("{}_{}.tsv", prefix, file_stem(chr)))?;
        write_kinship(&path, k)?;
        written.push(path);
    }
    Ok(written)
}

/// Phenotype and chromosome names made safe for file names.
pub fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

pub fn threshold_for(threshold: &Threshold, col: usize) -> f64 {
    match threshold {
        Threshold::Single(t) => *t,
        Threshold::PerPhenotype(ts) => ts.get(col).copied().unwrap_or(f64::NAN),
    }
}

/// Run every stage described by `cfg`, writing results to `cfg.output_dir`.
pub fn run(cfg: &AnalysisConfig, plot_config: &PlotConfig) -> Result<()> {
    cfg.validate()?;
    let start = Instant::now();
    let dir = cfg.output_dir.as_path();
    tracing::debug!("Effective config:\n{}", serde_json::to_string_pretty(cfg)?);

    let cross = read_cross2(&cfg.cross)?;
    let pheno = select_phenotypes(&cross, cfg.phenotypes.as_deref())?;
    let addcovar = covariate_matrix(&cross, cfg.covariates.as_deref())?;

    let map = insert_pseudomarkers(&cross.gmap, &cfg.pseudomarkers)?;
    let probs = calc_genoprob(&cross, &map, &cfg.genoprob)?;
    write_genoprobs(output_path(dir, "genoprobs.csv")?, &probs)?;

    let kinship = match &cfg.kinship {
        Some(opts) => {
            let kin = calc_kinship(&probs, opts)?;
            let files = write_kinship_set(dir, &kin)?;
            tracing::info!("Wrote {} kinship matrices", files.len());
            Some(kin)
        }
        None => None,
    };

    let scan = scan1(&probs, &pheno, kinship.as_ref(), addcovar.as_ref(), &cfg.scan)?;
    write_scan1(output_path(dir, "scan1.csv")?, &scan)?;

    let threshold = match &cfg.perm {
        Some(perm_opts) => {
            let strata = match &cfg.strata {
                Some(col) => Some(strata_map(&cross, col)?),
                None => None,
            };
            let perm = scan1perm(
                &probs,
                &pheno,
                kinship.as_ref(),
                addcovar.as_ref(),
                &cfg.scan,
                perm_opts,
                strata.as_ref(),
            )?;
            write_perm(output_path(dir, "scan1perm.csv")?, &perm)?;
            Threshold::PerPhenotype(perm.thresholds(cfg.alpha)?)
        }
        None => Threshold::Single(cfg.threshold),
    };

    let peaks = find_peaks(&scan, &threshold, &cfg.peaks)?;
    write_peaks(output_path(dir, "peaks.csv")?, &peaks)?;
    tracing::info!("{} peaks above threshold", peaks.len());

    // One coefficient table per phenotype and chromosome with a peak
    let mut done = HashSet::new();
    for peak in &peaks {
        if !done.insert((peak.pheno_index, peak.chr.clone())) {
            continue;
        }
        let coef = scan1coef(
            &probs,
            &pheno,
            peak.pheno_index,
            &peak.chr,
            kinship.as_ref(),
            addcovar.as_ref(),
            &cfg.scan,
            true,
        )?;
        let name = format!("coef_{}_{}.csv", file_stem(&peak.pheno), file_stem(&peak.chr));
        write_coef(output_path(dir, &name)?, &coef)?;
    }

    let mm = maxmarg(&probs, &cfg.maxmarg)?;
    write_maxmarg(output_path(dir, "maxmarg.csv")?, &mm)?;

    if cfg.plots {
        draw_plots(dir, &scan, &pheno, &probs, &peaks, &threshold, cfg, plot_config);
    }

    tracing::info!(
        "Pipeline finished in {:.1}s, results in {}",
        start.elapsed().as_secs_f64(),
        dir.display()
    );
    Ok(())
}

/// Plot failures are logged, not fatal: the numeric results are already on disk.
#[allow(clippy::too_many_arguments)]
fn draw_plots(
    dir: &Path,
    scan: &ScanResult,
    pheno: &PhenotypeTable,
    probs: &Genoprobs,
    peaks: &[Peak],
    threshold: &Threshold,
    cfg: &AnalysisConfig,
    plot_config: &PlotConfig,
) {
    for (j, name) in scan.pheno_names.iter().enumerate() {
        let result = output_path(dir, &format!("scan_{}.svg", file_stem(name))).and_then(|path| {
            plot_scan(scan, &[j], Some(threshold_for(threshold, j)), peaks, path, plot_config)
        });
        if let Err(e) = result {
            tracing::warn!("Scan plot for {} failed: {:#}", name, e);
        }
    }

    for peak in peaks {
        let result = maxmarg_position(probs, &peak.chr, &peak.marker, &cfg.maxmarg).and_then(|calls| {
            let path = output_path(
                dir,
                &format!("pxg_{}_{}.svg", file_stem(&peak.pheno), file_stem(&peak.marker)),
            )?;
            plot_pxg(
                pheno,
                peak.pheno_index,
                &probs.ind_ids,
                &calls,
                &probs.states,
                path,
                plot_config,
            )
        });
        if let Err(e) = result {
            tracing::warn!("Phenotype-by-genotype plot at {} failed: {:#}", peak.marker, e);
        }
    }
}
