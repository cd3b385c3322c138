//! qtlx-plotting: QTL visualization for qtlx
//!
//! Renders genome scan results, genotype probabilities and
//! phenotype-by-genotype plots from `qtl2-rs` values.
//!
//! ## Features
//! - LOD curves over concatenated chromosomes with threshold line and peak markers
//! - Genotype probability heatmap for one individual on one chromosome
//! - Phenotype by inferred genotype, with group means
//! - SVG output (default)
//! - PNG output (optional, requires `png` feature)
//!
//! ## Example
//! ```ignore
//! use qtlx_plotting::{plot_scan, PlotConfig};
//!
//! let scan = qtl2_rs::read_scan1("scan.csv")?;
//! plot_scan(&scan, &[0], Some(3.5), &[], "scan.svg", &PlotConfig::default())?;
//! ```

pub mod genoprob;
pub mod pxg;
pub mod scan;
pub mod themes;

use anyhow::Result;
use std::path::Path;

/// Configuration for plot appearance
#[derive(Debug, Clone)]
pub struct PlotConfig {
    /// Plot width in pixels
    pub width: u32,
    /// Plot height in pixels
    pub height: u32,
    /// Plot title
    pub title: Option<String>,
    /// Color theme
    pub theme: themes::Theme,
    /// Point and marker size
    pub point_size: u32,
    /// Stroke width of LOD curves
    pub line_width: u32,
    /// Show chromosome labels on x-axis
    pub show_chrom_labels: bool,
    /// Filter to specific chromosomes (None = show all)
    pub chromosomes: Option<Vec<String>>,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 600,
            title: None,
            theme: themes::Theme::default(),
            point_size: 4,
            line_width: 2,
            show_chrom_labels: true,
            chromosomes: None,
        }
    }
}

/// Output format chosen from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Svg,
    #[cfg(feature = "png")]
    Png,
}

impl OutputFormat {
    pub(crate) fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("svg")
            .to_lowercase();

        match ext.as_str() {
            "svg" => Ok(OutputFormat::Svg),
            #[cfg(feature = "png")]
            "png" => Ok(OutputFormat::Png),
            _ => anyhow::bail!("Unsupported output format: {}", ext),
        }
    }
}

// Re-export main functions
pub use genoprob::plot_genoprob;
pub use pxg::plot_pxg;
pub use scan::plot_scan;
pub use themes::Theme;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format() {
        assert_eq!(OutputFormat::from_path(Path::new("a.svg")).unwrap(), OutputFormat::Svg);
        assert_eq!(OutputFormat::from_path(Path::new("a")).unwrap(), OutputFormat::Svg);
        assert!(OutputFormat::from_path(Path::new("a.pdf")).is_err());
    }
}
