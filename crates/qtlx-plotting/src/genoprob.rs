//! Genotype probability heatmap for one individual along one chromosome

use crate::{OutputFormat, PlotConfig};
use anyhow::{Context, Result};
use plotters::prelude::*;
use qtl2_rs::Genoprobs;
use std::path::Path;

/// One heatmap cell: x extent, state row and probability
struct Cell {
    x0: f64,
    x1: f64,
    row: usize,
    prob: f64,
}

struct HeatmapData {
    cells: Vec<Cell>,
    states: Vec<String>,
    /// Marker (not pseudomarker) positions, for tick marks
    markers: Vec<f64>,
    x_min: f64,
    x_max: f64,
}

/// Cell boundaries are midpoints between neighbouring positions.
fn cell_edges(positions: &[f64]) -> Vec<(f64, f64)> {
    let n = positions.len();
    let half_end = if n > 1 {
        (positions[1] - positions[0]).min(positions[n - 1] - positions[n - 2]) / 2.0
    } else {
        0.5
    };
    (0..n)
        .map(|k| {
            let lo = if k == 0 {
                positions[0] - half_end
            } else {
                (positions[k - 1] + positions[k]) / 2.0
            };
            let hi = if k + 1 == n {
                positions[n - 1] + half_end
            } else {
                (positions[k] + positions[k + 1]) / 2.0
            };
            (lo, hi)
        })
        .collect()
}

fn prepare_heatmap_data(probs: &Genoprobs, ind: &str, chr: &str) -> Result<HeatmapData> {
    let i = probs
        .ind_ids
        .iter()
        .position(|id| id == ind)
        .with_context(|| format!("Individual {} not found in genotype probabilities", ind))?;
    let c = probs
        .chr(chr)
        .with_context(|| format!("Chromosome {} not found in genotype probabilities", chr))?;
    if c.positions.is_empty() {
        anyhow::bail!("Chromosome {} has no positions", chr);
    }

    let edges = cell_edges(&c.positions);
    let n_states = probs.n_states();
    let mut cells = Vec::with_capacity(edges.len() * n_states);
    for (k, &(x0, x1)) in edges.iter().enumerate() {
        for s in 0..n_states {
            cells.push(Cell {
                x0,
                x1,
                row: s,
                prob: c.probs[(i, s, k)],
            });
        }
    }

    Ok(HeatmapData {
        cells,
        states: probs.states.clone(),
        markers: c
            .positions
            .iter()
            .zip(&c.is_marker)
            .filter(|(_, m)| **m)
            .map(|(&p, _)| p)
            .collect(),
        x_min: edges[0].0,
        x_max: edges[edges.len() - 1].1,
    })
}

/// Plot one individual's genotype probabilities along a chromosome
///
/// Rows are genotype states (first state on top), columns are positions,
/// and cell shading runs from the background (0) to the theme's heat color (1).
/// Observed markers are ticked along the top edge.
pub fn plot_genoprob<P: AsRef<Path>>(
    probs: &Genoprobs,
    ind: &str,
    chr: &str,
    output_path: P,
    config: &PlotConfig,
) -> Result<()> {
    let output_path = output_path.as_ref();
    let format = OutputFormat::from_path(output_path)?;
    let data = prepare_heatmap_data(probs, ind, chr)?;
    let title = config
        .title
        .clone()
        .unwrap_or_else(|| format!("{}, chromosome {}", ind, chr));

    match format {
        OutputFormat::Svg => {
            let root = SVGBackend::new(output_path, (config.width, config.height))
                .into_drawing_area();
            draw_heatmap_impl(&root, &data, &title, config)
                .context("Failed to draw genotype probability plot")?;
            root.present().context("Failed to write SVG")?;
        }
        #[cfg(feature = "png")]
        OutputFormat::Png => {
            let root = BitMapBackend::new(output_path, (config.width, config.height))
                .into_drawing_area();
            draw_heatmap_impl(&root, &data, &title, config)
                .context("Failed to draw genotype probability plot")?;
            root.present().context("Failed to write PNG")?;
        }
    }
    Ok(())
}

fn draw_heatmap_impl<DB: DrawingBackend>(
    root: &DrawingArea<DB, plotters::coord::Shift>,
    data: &HeatmapData,
    title: &str,
    config: &PlotConfig,
) -> Result<(), DrawingAreaErrorKind<DB::ErrorType>> {
    let theme = &config.theme;
    root.fill(&theme.background)?;

    let n_rows = data.states.len() as f64;
    // State names sit in a band left of the first cell
    let label_band = (data.x_max - data.x_min) * 0.1;
    let x_lo = data.x_min - label_band;

    let mut chart = ChartBuilder::on(root)
        .caption(title, ("sans-serif", 24).into_font().color(&theme.text))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(10)
        .build_cartesian_2d(x_lo..data.x_max, 0.0..n_rows + 0.3)?;

    chart
        .configure_mesh()
        .disable_mesh()
        .disable_y_axis()
        .x_desc("Position (cM)")
        .x_label_style(("sans-serif", 14).into_font().color(&theme.text))
        .axis_desc_style(("sans-serif", 18).into_font().color(&theme.text))
        .axis_style(&theme.axis)
        .draw()?;

    chart.draw_series(data.cells.iter().map(|cell| {
        let top = n_rows - cell.row as f64;
        Rectangle::new(
            [(cell.x0, top - 1.0), (cell.x1, top)],
            theme.heat_color(cell.prob).filled(),
        )
    }))?;

    for (s, name) in data.states.iter().enumerate() {
        chart.draw_series(std::iter::once(Text::new(
            name.clone(),
            (x_lo + label_band * 0.1, n_rows - s as f64 - 0.4),
            ("sans-serif", 14).into_font().color(&theme.text),
        )))?;
    }

    for &m in &data.markers {
        chart.draw_series(LineSeries::new(
            vec![(m, n_rows), (m, n_rows + 0.2)],
            theme.axis.stroke_width(1),
        ))?;
    }

    Ok(())
}
