//! LOD curve plots for genome scans

use crate::{OutputFormat, PlotConfig};
use anyhow::{Context, Result};
use plotters::prelude::*;
use qtl2_rs::{Peak, ScanResult};
use std::path::Path;

/// One phenotype's LOD curve on one chromosome, x already offset
struct Curve {
    series: usize,
    chrom: usize,
    points: Vec<(f64, f64)>,
}

/// Chromosome placement on the concatenated x axis
struct ChromSpan {
    name: String,
    /// Added to a position on this chromosome to get the plot x
    shift: f64,
    mid: f64,
}

/// Processed data ready for rendering
struct ScanData {
    curves: Vec<Curve>,
    chroms: Vec<ChromSpan>,
    /// (x, lod, series, label)
    peaks: Vec<(f64, f64, usize, String)>,
    labels: Vec<String>,
    max_x: f64,
    max_y: f64,
}

fn prepare_scan_data(
    scan: &ScanResult,
    columns: &[usize],
    peaks: &[Peak],
    chrom_filter: Option<&[String]>,
) -> ScanData {
    let selected: Vec<_> = scan
        .chromosomes
        .iter()
        .filter(|c| !c.positions.is_empty())
        .filter(|c| chrom_filter.map_or(true, |f| f.contains(&c.chr)))
        .collect();

    let span = |p: &[f64]| p[p.len() - 1] - p[0];
    let total: f64 = selected.iter().map(|c| span(&c.positions)).sum();
    let gap = (total * 0.02).max(1.0);

    let mut offset = 0.0;
    let mut curves = Vec::new();
    let mut chroms = Vec::new();
    let mut max_y = 0.0_f64;

    for (ci, c) in selected.iter().enumerate() {
        let width = span(&c.positions);
        let shift = offset - c.positions[0];
        chroms.push(ChromSpan {
            name: c.chr.clone(),
            shift,
            mid: offset + width / 2.0,
        });

        for (si, &col) in columns.iter().enumerate() {
            let points: Vec<(f64, f64)> = c
                .positions
                .iter()
                .enumerate()
                .map(|(k, &p)| (p + shift, c.lod[(k, col)]))
                .filter(|(_, lod)| lod.is_finite())
                .collect();
            max_y = points.iter().fold(max_y, |m, &(_, lod)| m.max(lod));
            curves.push(Curve {
                series: si,
                chrom: ci,
                points,
            });
        }

        offset += width + gap;
    }

    let mut peak_points = Vec::new();
    for peak in peaks {
        let series = columns.iter().position(|&c| c == peak.pheno_index);
        let chrom = chroms.iter().find(|c| c.name == peak.chr);
        if let (Some(series), Some(chrom)) = (series, chrom) {
            peak_points.push((peak.pos + chrom.shift, peak.lod, series, peak.marker.clone()));
            max_y = max_y.max(peak.lod);
        }
    }

    ScanData {
        curves,
        chroms,
        peaks: peak_points,
        labels: columns
            .iter()
            .map(|&c| scan.pheno_names[c].clone())
            .collect(),
        max_x: (offset - gap).max(1.0),
        max_y,
    }
}

/// Plot LOD curves for one or more phenotypes across the genome
///
/// Chromosomes are laid end to end in scan order. With a single phenotype
/// chromosomes alternate theme colors; with several, each phenotype gets its
/// own color and a legend. `threshold` draws a horizontal line and `peaks`
/// belonging to the plotted phenotypes are marked with triangles.
///
/// # Example
/// ```ignore
/// use qtlx_plotting::{plot_scan, PlotConfig};
///
/// plot_scan(&scan, &[0], Some(3.46), &peaks, "liver_scan.svg", &PlotConfig::default())?;
/// ```
pub fn plot_scan<P: AsRef<Path>>(
    scan: &ScanResult,
    columns: &[usize],
    threshold: Option<f64>,
    peaks: &[Peak],
    output_path: P,
    config: &PlotConfig,
) -> Result<()> {
    let output_path = output_path.as_ref();
    let format = OutputFormat::from_path(output_path)?;

    if columns.is_empty() {
        anyhow::bail!("No phenotypes selected for the scan plot");
    }
    if let Some(&bad) = columns.iter().find(|&&c| c >= scan.n_pheno()) {
        anyhow::bail!(
            "Phenotype column {} out of range ({} phenotypes in scan)",
            bad,
            scan.n_pheno()
        );
    }

    let data = prepare_scan_data(scan, columns, peaks, config.chromosomes.as_deref());
    if data.chroms.is_empty() {
        anyhow::bail!("No scan positions to plot after chromosome filtering");
    }

    let y_max = (data.max_y * 1.1).max(threshold.map_or(1.0, |t| t * 1.1)).max(1.0);
    tracing::debug!(
        "Scan plot: {} curves on {} chromosomes -> {}",
        data.curves.len(),
        data.chroms.len(),
        output_path.display()
    );

    match format {
        OutputFormat::Svg => {
            let root = SVGBackend::new(output_path, (config.width, config.height))
                .into_drawing_area();
            draw_scan_impl(&root, &data, threshold, config, y_max)
                .context("Failed to draw scan plot")?;
            root.present().context("Failed to write SVG")?;
        }
        #[cfg(feature = "png")]
        OutputFormat::Png => {
            let root = BitMapBackend::new(output_path, (config.width, config.height))
                .into_drawing_area();
            draw_scan_impl(&root, &data, threshold, config, y_max)
                .context("Failed to draw scan plot")?;
            root.present().context("Failed to write PNG")?;
        }
    }
    Ok(())
}

fn pick(colors: &[RGBColor], i: usize, fallback: RGBColor) -> RGBColor {
    if colors.is_empty() {
        fallback
    } else {
        colors[i % colors.len()]
    }
}

fn draw_scan_impl<DB: DrawingBackend>(
    root: &DrawingArea<DB, plotters::coord::Shift>,
    data: &ScanData,
    threshold: Option<f64>,
    config: &PlotConfig,
    y_max: f64,
) -> Result<(), DrawingAreaErrorKind<DB::ErrorType>> {
    let theme = &config.theme;
    root.fill(&theme.background)?;

    let title = config
        .title
        .clone()
        .unwrap_or_else(|| data.labels.join(", "));
    let has_multiple = data.labels.len() > 1;
    let right_margin = if has_multiple { 140 } else { 10 };

    // Room below zero for chromosome labels
    let y_min = if config.show_chrom_labels { -y_max * 0.08 } else { 0.0 };

    let mut chart = ChartBuilder::on(root)
        .caption(title, ("sans-serif", 24).into_font().color(&theme.text))
        .margin(10)
        .margin_right(right_margin)
        .x_label_area_size(10)
        .y_label_area_size(60)
        .build_cartesian_2d(0.0..data.max_x, y_min..y_max)?;

    chart
        .configure_mesh()
        .disable_mesh()
        .disable_x_axis()
        .y_desc("LOD score")
        .y_label_formatter(&|v: &f64| if *v < 0.0 { String::new() } else { format!("{:.1}", v) })
        .y_label_style(("sans-serif", 14).into_font().color(&theme.text))
        .axis_desc_style(("sans-serif", 18).into_font().color(&theme.text))
        .axis_style(&theme.axis)
        .draw()?;

    chart.draw_series(LineSeries::new(
        vec![(0.0, 0.0), (data.max_x, 0.0)],
        theme.axis.stroke_width(1),
    ))?;

    for curve in &data.curves {
        let color = if has_multiple {
            pick(&theme.series_colors, curve.series, theme.text)
        } else {
            pick(&theme.chromosome_colors, curve.chrom, theme.text)
        };
        chart.draw_series(LineSeries::new(
            curve.points.iter().copied(),
            color.stroke_width(config.line_width),
        ))?;
    }

    if let Some(t) = threshold {
        chart.draw_series(LineSeries::new(
            vec![(0.0, t), (data.max_x, t)],
            theme.threshold_line.stroke_width(1),
        ))?;
    }

    let size = config.point_size as i32;
    for (x, lod, _, marker) in &data.peaks {
        chart.draw_series(std::iter::once(TriangleMarker::new(
            (*x, *lod),
            size,
            theme.peak.filled(),
        )))?;
        chart.draw_series(std::iter::once(Text::new(
            marker.clone(),
            (*x, *lod + y_max * 0.05),
            ("sans-serif", 11).into_font().color(&theme.text),
        )))?;
    }

    if config.show_chrom_labels {
        for chrom in &data.chroms {
            chart.draw_series(std::iter::once(Text::new(
                chrom.name.clone(),
                (chrom.mid, y_min * 0.3),
                ("sans-serif", 14).into_font().color(&theme.text),
            )))?;
        }
    }

    if has_multiple {
        let legend_x = data.max_x * 1.02;
        let legend_spacing = y_max * 0.08;

        for (idx, label) in data.labels.iter().enumerate() {
            let y = y_max * 0.95 - idx as f64 * legend_spacing;
            let color = pick(&theme.series_colors, idx, theme.text);
            chart.draw_series(LineSeries::new(
                vec![(legend_x, y), (legend_x + data.max_x * 0.03, y)],
                color.stroke_width(config.line_width),
            ))?;
            chart.draw_series(std::iter::once(Text::new(
                label.clone(),
                (legend_x + data.max_x * 0.04, y),
                ("sans-serif", 10).into_font().color(&theme.text),
            )))?;
        }
    }

    Ok(())
}
