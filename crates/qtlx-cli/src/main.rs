use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use qtl2_rs::*;
use qtlx_plotting::{plot_genoprob, plot_pxg, plot_scan, PlotConfig, Theme};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod pipeline;

/// qtlx: QTL mapping in experimental crosses
#[derive(Parser)]
#[command(
    name = "qtlx",
    version,
    about = "qtlx: QTL mapping in experimental crosses (genotype probabilities, kinship, genome scans, permutations, peaks)"
)]
struct Cli {
    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Worker threads (0 = all available)
    #[arg(long, global = true)]
    cores: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

/// Cross input and genotype probability settings shared by most subcommands
#[derive(Args, Debug, Clone)]
struct CrossArgs {
    /// JSON control file of the cross
    #[arg(long, help_heading = "Input/Output")]
    cross: PathBuf,

    /// Pseudomarker spacing in cM (0 = markers only)
    #[arg(long, default_value = "0", help_heading = "Genotype Probabilities")]
    step: f64,

    /// Extend the pseudomarker grid this far beyond the terminal markers
    #[arg(long, default_value = "0", help_heading = "Genotype Probabilities")]
    off_end: f64,

    /// Pseudomarker grid type
    #[arg(long, default_value = "fixed", value_parser = ["fixed", "max"], help_heading = "Genotype Probabilities")]
    stepwidth: String,

    /// Genotyping error probability
    #[arg(long, default_value = "0.0001", help_heading = "Genotype Probabilities")]
    error_prob: f64,

    /// Map function for recombination fractions
    #[arg(long, default_value = "haldane", value_parser = ["haldane", "kosambi", "morgan"], help_heading = "Genotype Probabilities")]
    map_function: String,
}

/// Phenotypes, covariates and kinship for scans
#[derive(Args, Debug, Clone)]
struct ModelArgs {
    /// Phenotypes to analyse (comma-separated; all when absent)
    #[arg(long, help_heading = "Model")]
    pheno: Option<String>,

    /// Additive covariates from the covariate file (comma-separated)
    #[arg(long, help_heading = "Model")]
    covar: Option<String>,

    /// Kinship for a linear mixed model scan (Haley-Knott when absent)
    #[arg(long, value_parser = ["overall", "loco"], help_heading = "Model")]
    kinship: Option<String>,

    /// Estimate heritability by maximum likelihood instead of REML
    #[arg(long, default_value_t = false, help_heading = "Model")]
    ml: bool,
}

/// Plot appearance
#[derive(Args, Debug, Clone)]
struct PlotArgs {
    /// Output file path (.svg, or .png with the png feature)
    #[arg(long, help_heading = "Input/Output")]
    output: PathBuf,

    /// Plot title
    #[arg(long, help_heading = "Appearance")]
    title: Option<String>,

    /// Color theme
    #[arg(long, default_value = "classic", value_parser = ["classic", "nature", "colorful", "dark", "high_contrast"], help_heading = "Appearance")]
    theme: String,

    /// Plot width in pixels
    #[arg(long, default_value = "1200", help_heading = "Appearance")]
    width: u32,

    /// Plot height in pixels
    #[arg(long, default_value = "600", help_heading = "Appearance")]
    height: u32,

    /// Filter to specific chromosomes (comma-separated)
    #[arg(long, help_heading = "Appearance")]
    chromosomes: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Calculate genotype probabilities (CSV: ind, chr, marker, pos, one column per genotype)
    Genoprob {
        #[command(flatten)]
        cross: CrossArgs,

        /// Collapse to allele probabilities
        #[arg(long, default_value_t = false)]
        alleleprob: bool,

        /// Output CSV
        #[arg(long, help_heading = "Input/Output")]
        out: PathBuf,
    },

    /// Calculate kinship matrices (TSV)
    Kinship {
        #[command(flatten)]
        cross: CrossArgs,

        /// overall, loco (leave one chromosome out) or chr (one per chromosome)
        #[arg(long, default_value = "overall", value_parser = ["overall", "loco", "chr"])]
        kind: String,

        /// Use genotype probabilities instead of allele probabilities
        #[arg(long, default_value_t = false)]
        genotype_probs: bool,

        /// Output directory
        #[arg(long, help_heading = "Input/Output")]
        out_dir: PathBuf,
    },

    /// Genome scan by Haley-Knott regression or linear mixed model
    #[command(after_help = "EXAMPLES:
    # Haley-Knott scan at 1 cM
    qtlx scan --cross iron.json --step 1 --out scan1.csv

    # LOCO mixed model with sex as a covariate
    qtlx scan --cross iron.json --step 1 --kinship loco --covar sex --out scan1_lmm.csv")]
    Scan {
        #[command(flatten)]
        cross: CrossArgs,

        #[command(flatten)]
        model: ModelArgs,

        /// Output CSV (marker, chr, pos, one LOD column per phenotype)
        #[arg(long, help_heading = "Input/Output")]
        out: PathBuf,
    },

    /// Permutation test for genome-wide LOD thresholds
    Perm {
        #[command(flatten)]
        cross: CrossArgs,

        #[command(flatten)]
        model: ModelArgs,

        /// Number of permutations
        #[arg(long, default_value = "1000", help_heading = "Permutation")]
        n_perm: usize,

        /// Random seed
        #[arg(long, default_value = "0", help_heading = "Permutation")]
        seed: u64,

        /// Covariate column defining strata; permute only within strata
        #[arg(long, help_heading = "Permutation")]
        strata: Option<String>,

        /// Significance levels to report (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "0.05", help_heading = "Permutation")]
        alpha: Vec<f64>,

        /// Output CSV of permutation maxima
        #[arg(long, help_heading = "Input/Output")]
        out: PathBuf,
    },

    /// Find LOD peaks in a scan table
    Peaks {
        /// Scan CSV written by `qtlx scan`
        #[arg(long, help_heading = "Input/Output")]
        scan: PathBuf,

        /// Single LOD threshold for every phenotype
        #[arg(long, help_heading = "Threshold")]
        threshold: Option<f64>,

        /// Permutation CSV written by `qtlx perm`; thresholds per phenotype
        #[arg(long, conflicts_with = "threshold", help_heading = "Threshold")]
        perm: Option<PathBuf>,

        /// Significance level for permutation thresholds
        #[arg(long, default_value = "0.05", help_heading = "Threshold")]
        alpha: f64,

        /// LOD drop between separate peaks on a chromosome
        #[arg(long, help_heading = "Peaks")]
        peakdrop: Option<f64>,

        /// LOD support interval drop
        #[arg(long, help_heading = "Peaks")]
        drop: Option<f64>,

        /// Bayes credible interval probability
        #[arg(long, conflicts_with = "drop", help_heading = "Peaks")]
        prob: Option<f64>,

        /// Expand intervals to the nearest markers
        #[arg(long, default_value_t = false, help_heading = "Peaks")]
        expand2markers: bool,

        /// Minimum distance (cM) between peaks on a chromosome
        #[arg(long, help_heading = "Peaks")]
        min_separation: Option<f64>,

        /// Sort order: column, position or lod
        #[arg(long, default_value = "column", value_parser = ["column", "position", "lod"], help_heading = "Peaks")]
        sort: String,

        /// Output CSV (printed when absent)
        #[arg(long, help_heading = "Input/Output")]
        out: Option<PathBuf>,
    },

    /// QTL effects along one chromosome for one phenotype
    Coef {
        #[command(flatten)]
        cross: CrossArgs,

        #[command(flatten)]
        model: ModelArgs,

        /// Chromosome to scan
        #[arg(long)]
        chr: String,

        /// Constrain genotype effects to sum to zero and report an intercept
        #[arg(long, default_value_t = false)]
        zerosum: bool,

        /// Output CSV
        #[arg(long, help_heading = "Input/Output")]
        out: PathBuf,
    },

    /// Most probable genotype at every position
    Maxmarg {
        #[command(flatten)]
        cross: CrossArgs,

        /// Minimum probability for a call
        #[arg(long, default_value = "0.95")]
        minprob: f64,

        /// Output CSV
        #[arg(long, help_heading = "Input/Output")]
        out: PathBuf,
    },

    /// Plot scans, genotype probabilities or phenotype by genotype
    Plot {
        #[command(subcommand)]
        kind: PlotCommands,
    },

    /// Run the whole pipeline from a JSON analysis config
    #[command(after_help = "EXAMPLE CONFIG:
    {
      \"cross\": \"iron.json\",
      \"output_dir\": \"iron_out\",
      \"pseudomarkers\": {\"step\": 1.0},
      \"kinship\": {\"kind\": \"loco\"},
      \"perm\": {\"n_perm\": 1000, \"seed\": 1},
      \"peaks\": {\"drop\": 1.5}
    }")]
    Run {
        /// Analysis config (JSON)
        #[arg(long)]
        config: PathBuf,

        /// Override the config's output directory
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Skip plots
        #[arg(long, default_value_t = false)]
        no_plots: bool,
    },
}

#[derive(Subcommand)]
enum PlotCommands {
    /// LOD curves from a scan table
    Scan {
        /// Scan CSV written by `qtlx scan`
        #[arg(long, help_heading = "Input/Output")]
        scan: PathBuf,

        /// Phenotypes to draw (comma-separated; first when absent)
        #[arg(long)]
        pheno: Option<String>,

        /// Threshold line, also used to mark peaks
        #[arg(long)]
        threshold: Option<f64>,

        #[command(flatten)]
        plot: PlotArgs,
    },

    /// Genotype probability heatmap for one individual
    Genoprob {
        #[command(flatten)]
        cross: CrossArgs,

        /// Individual ID
        #[arg(long)]
        ind: String,

        /// Chromosome
        #[arg(long)]
        chr: String,

        #[command(flatten)]
        plot: PlotArgs,
    },

    /// Phenotype by inferred genotype at one marker
    Pxg {
        #[command(flatten)]
        cross: CrossArgs,

        /// Phenotype
        #[arg(long)]
        pheno: String,

        /// Marker or pseudomarker
        #[arg(long)]
        marker: String,

        /// Minimum probability for a genotype call
        #[arg(long, default_value = "0.95")]
        minprob: f64,

        #[command(flatten)]
        plot: PlotArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let cores = cli.cores.unwrap_or(0);

    match cli.command {
        Commands::Genoprob { cross, alleleprob, out } => {
            let (_, probs) = cross.load(cores)?;
            let probs = if alleleprob {
                genoprob_to_alleleprob(&probs)?
            } else {
                probs
            };
            write_genoprobs(&out, &probs)?;
            eprintln!("Genotype probabilities written to {}", out.display());
        }
        Commands::Kinship { cross, kind, genotype_probs, out_dir } => {
            let opts = KinshipOptions {
                kind: KinshipType::from_str(&kind)
                    .with_context(|| format!("Unknown kinship type '{}'", kind))?,
                use_allele_probs: !genotype_probs,
                cores,
            };
            let (_, probs) = cross.load(cores)?;
            let kinship = calc_kinship(&probs, &opts)?;
            for path in pipeline::write_kinship_set(&out_dir, &kinship)? {
                eprintln!("Kinship written to {}", path.display());
            }
        }
        Commands::Scan { cross, model, out } => {
            let (data, probs) = cross.load(cores)?;
            let pheno = model.phenotypes(&data)?;
            let addcovar = model.covariates(&data)?;
            let kinship = model.kinship(&probs, cores)?;

            let scan = scan1(&probs, &pheno, kinship.as_ref(), addcovar.as_ref(), &model.scan_options(cores))?;
            write_scan1(&out, &scan)?;
            print_scan_summary(&scan);
            eprintln!("Scan written to {}", out.display());
        }
        Commands::Perm { cross, model, n_perm, seed, strata, alpha, out } => {
            let (data, probs) = cross.load(cores)?;
            let pheno = model.phenotypes(&data)?;
            let addcovar = model.covariates(&data)?;
            let kinship = model.kinship(&probs, cores)?;
            let strata = match &strata {
                Some(col) => Some(pipeline::strata_map(&data, col)?),
                None => None,
            };

            let perm = scan1perm(
                &probs,
                &pheno,
                kinship.as_ref(),
                addcovar.as_ref(),
                &model.scan_options(cores),
                &PermOptions { n_perm, seed, cores },
                strata.as_ref(),
            )?;
            write_perm(&out, &perm)?;

            let summary = perm.summary(&alpha)?;
            println!("alpha\t{}", perm.pheno_names.join("\t"));
            for (a, row) in alpha.iter().zip(summary.outer_iter()) {
                let cells: Vec<String> = row.iter().map(|t| format!("{:.3}", t)).collect();
                println!("{}\t{}", a, cells.join("\t"));
            }
            eprintln!("Permutation maxima written to {}", out.display());
        }
        Commands::Peaks {
            scan,
            threshold,
            perm,
            alpha,
            peakdrop,
            drop,
            prob,
            expand2markers,
            min_separation,
            sort,
            out,
        } => {
            let scan = read_scan1(&scan)?;
            let threshold = match (threshold, perm) {
                (Some(t), _) => Threshold::Single(t),
                (None, Some(path)) => perm_thresholds(&scan, &read_perm(&path)?, alpha)?,
                (None, None) => anyhow::bail!("Give --threshold or --perm"),
            };
            let opts = PeakOptions {
                peakdrop,
                drop,
                prob,
                expand2markers,
                min_separation,
                sort_by: PeakSort::from_str(&sort)
                    .with_context(|| format!("Unknown sort order '{}'", sort))?,
            };

            let peaks = find_peaks(&scan, &threshold, &opts)?;
            match out {
                Some(path) => {
                    write_peaks(&path, &peaks)?;
                    eprintln!("{} peaks written to {}", peaks.len(), path.display());
                }
                None => print_peaks(&peaks),
            }
        }
        Commands::Coef { cross, model, chr, zerosum, out } => {
            let (data, probs) = cross.load(cores)?;
            let pheno = model.phenotypes(&data)?;
            if pheno.n_pheno() != 1 {
                anyhow::bail!("coef takes exactly one phenotype (--pheno), got {}", pheno.n_pheno());
            }
            let addcovar = model.covariates(&data)?;
            let kinship = model.kinship(&probs, cores)?;

            let coef = scan1coef(
                &probs,
                &pheno,
                0,
                &chr,
                kinship.as_ref(),
                addcovar.as_ref(),
                &model.scan_options(cores),
                zerosum,
            )?;
            write_coef(&out, &coef)?;
            eprintln!("Coefficients written to {}", out.display());
        }
        Commands::Maxmarg { cross, minprob, out } => {
            let (_, probs) = cross.load(cores)?;
            let mm = maxmarg(&probs, &MaxmargOptions { minprob })?;
            write_maxmarg(&out, &mm)?;
            eprintln!("Genotype calls written to {}", out.display());
        }
        Commands::Plot { kind } => run_plot(kind, cores)?,
        Commands::Run { config, out_dir, no_plots } => {
            let mut cfg = AnalysisConfig::from_file(&config)?;
            if let Some(dir) = out_dir {
                cfg.output_dir = dir;
            }
            if cli.cores.is_some() {
                cfg.cores = cli.cores;
            }
            if no_plots {
                cfg.plots = false;
            }
            cfg.apply_cores();
            pipeline::run(&cfg, &PlotConfig::default())?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn parse_csv_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .collect()
}

impl CrossArgs {
    fn pseudomarker_options(&self) -> Result<PseudomarkerOptions> {
        Ok(PseudomarkerOptions {
            step: self.step,
            off_end: self.off_end,
            stepwidth: Stepwidth::from_str(&self.stepwidth)
                .with_context(|| format!("Unknown stepwidth '{}'", self.stepwidth))?,
            ..Default::default()
        })
    }

    fn genoprob_options(&self, cores: usize) -> Result<GenoprobOptions> {
        Ok(GenoprobOptions {
            error_prob: self.error_prob,
            map_function: MapFunction::from_str(&self.map_function)
                .with_context(|| format!("Unknown map function '{}'", self.map_function))?,
            cores,
        })
    }

    /// Read the cross, insert pseudomarkers and calculate genotype probabilities.
    fn load(&self, cores: usize) -> Result<(Cross, Genoprobs)> {
        let pm_opts = self.pseudomarker_options()?;
        let gp_opts = self.genoprob_options(cores)?;
        pm_opts.validate()?;
        gp_opts.validate()?;

        let cross = read_cross2(&self.cross)?;
        let map = insert_pseudomarkers(&cross.gmap, &pm_opts)?;
        let probs = calc_genoprob(&cross, &map, &gp_opts)?;
        Ok((cross, probs))
    }
}

impl ModelArgs {
    fn phenotypes(&self, cross: &Cross) -> Result<PhenotypeTable> {
        let names = self.pheno.as_deref().map(parse_csv_list);
        pipeline::select_phenotypes(cross, names.as_deref())
    }

    fn covariates(&self, cross: &Cross) -> Result<Option<CovariateMatrix>> {
        let names = self.covar.as_deref().map(parse_csv_list);
        pipeline::covariate_matrix(cross, names.as_deref())
    }

    fn kinship(&self, probs: &Genoprobs, cores: usize) -> Result<Option<Kinship>> {
        let Some(kind) = &self.kinship else {
            return Ok(None);
        };
        let opts = KinshipOptions {
            kind: KinshipType::from_str(kind)
                .with_context(|| format!("Unknown kinship type '{}'", kind))?,
            cores,
            ..Default::default()
        };
        Ok(Some(calc_kinship(probs, &opts)?))
    }

    fn scan_options(&self, cores: usize) -> ScanOptions {
        ScanOptions {
            reml: !self.ml,
            cores,
        }
    }
}

impl PlotArgs {
    fn config(&self) -> PlotConfig {
        let theme = Theme::from_str(&self.theme).unwrap_or_else(|| {
            tracing::warn!("Unknown theme '{}', using classic", self.theme);
            Theme::classic()
        });
        PlotConfig {
            width: self.width,
            height: self.height,
            title: self.title.clone(),
            theme,
            chromosomes: self.chromosomes.as_deref().map(parse_csv_list),
            ..Default::default()
        }
    }
}

/// Permutation thresholds matched to the scan's phenotypes by name.
fn perm_thresholds(scan: &ScanResult, perm: &PermutationResult, alpha: f64) -> Result<Threshold> {
    let all = perm.thresholds(alpha)?;
    let per = scan
        .pheno_names
        .iter()
        .map(|name| {
            perm.pheno_names
                .iter()
                .position(|p| p == name)
                .map(|j| all[j])
                .with_context(|| format!("Phenotype '{}' not in permutation results", name))
        })
        .collect::<Result<Vec<f64>>>()?;
    Ok(Threshold::PerPhenotype(per))
}

fn print_scan_summary(scan: &ScanResult) {
    println!("pheno\tchr\tmarker\tpos\tmax_lod");
    for (j, name) in scan.pheno_names.iter().enumerate() {
        if let Some((chr, marker, pos, lod)) = scan.max_position(j) {
            println!("{}\t{}\t{}\t{:.2}\t{:.3}", name, chr, marker, pos, lod);
        }
    }
    if let Some(hsq) = &scan.hsq {
        for (label, h) in hsq.labels.iter().zip(hsq.values.iter()) {
            tracing::info!("hsq[{}] = {:.3}", label, h);
        }
    }
}

fn print_peaks(peaks: &[Peak]) {
    println!("pheno\tchr\tmarker\tpos\tlod\tci_lo\tci_hi");
    let fmt = |v: Option<f64>| v.map_or("NA".to_string(), |x| format!("{:.2}", x));
    for p in peaks {
        println!(
            "{}\t{}\t{}\t{:.2}\t{:.3}\t{}\t{}",
            p.pheno,
            p.chr,
            p.marker,
            p.pos,
            p.lod,
            fmt(p.ci_lo),
            fmt(p.ci_hi)
        );
    }
}

fn run_plot(kind: PlotCommands, cores: usize) -> Result<()> {
    match kind {
        PlotCommands::Scan { scan, pheno, threshold, plot } => {
            let scan = read_scan1(&scan)?;
            let columns: Vec<usize> = match pheno.as_deref().map(parse_csv_list) {
                Some(names) => names
                    .iter()
                    .map(|n| {
                        scan.pheno_index(n)
                            .with_context(|| format!("Phenotype '{}' not in scan", n))
                    })
                    .collect::<Result<_>>()?,
                None => vec![0],
            };
            let peaks = match threshold {
                Some(t) => find_peaks(&scan, &Threshold::Single(t), &PeakOptions::default())?,
                None => Vec::new(),
            };
            plot_scan(&scan, &columns, threshold, &peaks, &plot.output, &plot.config())?;
            eprintln!("Plot saved to {}", plot.output.display());
        }
        PlotCommands::Genoprob { cross, ind, chr, plot } => {
            let (_, probs) = cross.load(cores)?;
            plot_genoprob(&probs, &ind, &chr, &plot.output, &plot.config())?;
            eprintln!("Plot saved to {}", plot.output.display());
        }
        PlotCommands::Pxg { cross, pheno, marker, minprob, plot } => {
            let (data, probs) = cross.load(cores)?;
            let col = data
                .pheno
                .column_index(&pheno)
                .with_context(|| format!("Phenotype '{}' not found", pheno))?;
            let chr = probs
                .chromosomes
                .iter()
                .find(|c| c.position_index(&marker).is_some())
                .map(|c| c.chr.clone())
                .with_context(|| format!("Marker '{}' not found", marker))?;
            let calls = maxmarg_position(&probs, &chr, &marker, &MaxmargOptions { minprob })?;
            plot_pxg(
                &data.pheno,
                col,
                &probs.ind_ids,
                &calls,
                &probs.states,
                &plot.output,
                &plot.config(),
            )?;
            eprintln!("Plot saved to {}", plot.output.display());
        }
    }
    Ok(())
}
