//! Phenotype by inferred genotype

use crate::{OutputFormat, PlotConfig};
use anyhow::{Context, Result};
use plotters::prelude::*;
use qtl2_rs::PhenotypeTable;
use std::collections::HashMap;
use std::path::Path;

struct PxgData {
    /// Phenotype values per genotype state
    groups: Vec<Vec<f64>>,
    states: Vec<String>,
    y_min: f64,
    y_max: f64,
}

fn prepare_pxg_data(
    pheno: &PhenotypeTable,
    column: usize,
    ind_ids: &[String],
    calls: &[Option<usize>],
    states: &[String],
) -> Result<PxgData> {
    if column >= pheno.n_pheno() {
        anyhow::bail!(
            "Phenotype column {} out of range ({} phenotypes)",
            column,
            pheno.n_pheno()
        );
    }
    if ind_ids.len() != calls.len() {
        anyhow::bail!(
            "{} individuals but {} genotype calls",
            ind_ids.len(),
            calls.len()
        );
    }

    let row_of: HashMap<&str, usize> = pheno
        .ind_ids
        .iter()
        .enumerate()
        .map(|(r, id)| (id.as_str(), r))
        .collect();
    let values = pheno.column(column);

    let mut groups = vec![Vec::new(); states.len()];
    for (id, call) in ind_ids.iter().zip(calls) {
        let (Some(s), Some(&r)) = (call, row_of.get(id.as_str())) else {
            continue;
        };
        let y = values[r];
        if y.is_finite() && *s < states.len() {
            groups[*s].push(y);
        }
    }

    let all = groups.iter().flatten();
    let (lo, hi) = all.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &y| {
        (lo.min(y), hi.max(y))
    });
    if !lo.is_finite() {
        anyhow::bail!("No phenotyped individuals with an inferred genotype");
    }
    let pad = ((hi - lo) * 0.1).max(1e-6);

    Ok(PxgData {
        groups,
        states: states.to_vec(),
        y_min: lo - pad,
        y_max: hi + pad,
    })
}

/// Deterministic horizontal jitter in [-0.2, 0.2]
fn jitter(j: usize) -> f64 {
    ((j * 37) % 41) as f64 / 40.0 * 0.4 - 0.2
}

/// Plot phenotype values grouped by inferred genotype at one position
///
/// `ind_ids` and `calls` are parallel (as returned by `maxmarg_position`
/// alongside `Genoprobs::ind_ids`). Individuals with no call or a missing
/// phenotype are left out; each group's mean is drawn as a bar.
#[allow(clippy::too_many_arguments)]
pub fn plot_pxg<P: AsRef<Path>>(
    pheno: &PhenotypeTable,
    column: usize,
    ind_ids: &[String],
    calls: &[Option<usize>],
    states: &[String],
    output_path: P,
    config: &PlotConfig,
) -> Result<()> {
    let output_path = output_path.as_ref();
    let format = OutputFormat::from_path(output_path)?;
    let data = prepare_pxg_data(pheno, column, ind_ids, calls, states)?;
    let title = config
        .title
        .clone()
        .unwrap_or_else(|| pheno.names[column].clone());

    match format {
        OutputFormat::Svg => {
            let root = SVGBackend::new(output_path, (config.width, config.height))
                .into_drawing_area();
            draw_pxg_impl(&root, &data, &title, config)
                .context("Failed to draw phenotype-by-genotype plot")?;
            root.present().context("Failed to write SVG")?;
        }
        #[cfg(feature = "png")]
        OutputFormat::Png => {
            let root = BitMapBackend::new(output_path, (config.width, config.height))
                .into_drawing_area();
            draw_pxg_impl(&root, &data, &title, config)
                .context("Failed to draw phenotype-by-genotype plot")?;
            root.present().context("Failed to write PNG")?;
        }
    }
    Ok(())
}

fn draw_pxg_impl<DB: DrawingBackend>(
    root: &DrawingArea<DB, plotters::coord::Shift>,
    data: &PxgData,
    title: &str,
    config: &PlotConfig,
) -> Result<(), DrawingAreaErrorKind<DB::ErrorType>> {
    let theme = &config.theme;
    root.fill(&theme.background)?;

    let n = data.states.len() as f64;
    // Genotype labels go in a band under the lowest value
    let band = (data.y_max - data.y_min) * 0.08;
    let y_lo = data.y_min - band;

    let mut chart = ChartBuilder::on(root)
        .caption(title, ("sans-serif", 24).into_font().color(&theme.text))
        .margin(10)
        .x_label_area_size(10)
        .y_label_area_size(60)
        .build_cartesian_2d(-0.5..n - 0.5, y_lo..data.y_max)?;

    let y_min = data.y_min;
    chart
        .configure_mesh()
        .disable_mesh()
        .disable_x_axis()
        .y_desc("Phenotype")
        .y_label_formatter(&|v: &f64| if *v < y_min { String::new() } else { format!("{:.2}", v) })
        .y_label_style(("sans-serif", 14).into_font().color(&theme.text))
        .axis_desc_style(("sans-serif", 18).into_font().color(&theme.text))
        .axis_style(&theme.axis)
        .draw()?;

    let size = config.point_size;
    for (s, values) in data.groups.iter().enumerate() {
        let x = s as f64;
        let color = if theme.series_colors.is_empty() {
            theme.text
        } else {
            theme.series_colors[s % theme.series_colors.len()]
        };

        chart.draw_series(
            values
                .iter()
                .enumerate()
                .map(|(j, &y)| Circle::new((x + jitter(j), y), size, color.filled())),
        )?;

        if !values.is_empty() {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            chart.draw_series(LineSeries::new(
                vec![(x - 0.3, mean), (x + 0.3, mean)],
                theme.text.stroke_width(3),
            ))?;
        }

        chart.draw_series(std::iter::once(Text::new(
            format!("{} (n={})", data.states[s], values.len()),
            (x - 0.15, y_lo + band * 0.8),
            ("sans-serif", 14).into_font().color(&theme.text),
        )))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn toy_pheno() -> PhenotypeTable {
        PhenotypeTable::new(
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
            vec!["wt".into()],
            array![[1.0], [2.0], [f64::NAN], [5.0]],
        )
        .unwrap()
    }

    #[test]
    fn test_groups_by_call() {
        let pheno = toy_pheno();
        // "e" has no phenotype row, "c" has NaN, "b" has no call
        let ids: Vec<String> = ["d", "c", "b", "a", "e"].iter().map(|s| s.to_string()).collect();
        let calls = vec![Some(1), Some(0), None, Some(0), Some(1)];
        let states = vec!["AA".to_string(), "AB".to_string()];

        let data = prepare_pxg_data(&pheno, 0, &ids, &calls, &states).unwrap();
        assert_eq!(data.groups, vec![vec![1.0], vec![5.0]]);
        assert!(data.y_min < 1.0 && data.y_max > 5.0);
    }

    #[test]
    fn test_rejects_mismatch_and_empty() {
        let pheno = toy_pheno();
        let states = vec!["AA".to_string(), "AB".to_string()];
        let ids = vec!["a".to_string(), "b".to_string()];

        assert!(prepare_pxg_data(&pheno, 0, &ids, &[Some(0)], &states).is_err());
        assert!(prepare_pxg_data(&pheno, 3, &ids, &[Some(0), None], &states).is_err());
        assert!(prepare_pxg_data(&pheno, 0, &ids, &[None, None], &states).is_err());
    }

    #[test]
    fn test_jitter_range() {
        assert!((0..200).map(jitter).all(|j| (-0.2..=0.2).contains(&j)));
    }
}
