//! Color themes for QTL plots

use plotters::style::RGBColor;

/// Color theme for plots
#[derive(Debug, Clone)]
pub struct Theme {
    /// Background color
    pub background: RGBColor,
    /// Text color
    pub text: RGBColor,
    /// Axis color
    pub axis: RGBColor,
    /// Permutation threshold line color
    pub threshold_line: RGBColor,
    /// Peak marker color
    pub peak: RGBColor,
    /// Alternating chromosome colors for single-phenotype LOD curves
    pub chromosome_colors: Vec<RGBColor>,
    /// One color per phenotype (multi-curve scans) or per genotype group
    pub series_colors: Vec<RGBColor>,
    /// Heatmap color at probability 1
    pub heat: RGBColor,
}

impl Default for Theme {
    fn default() -> Self {
        Self::classic()
    }
}

const SET1: [RGBColor; 8] = [
    RGBColor(228, 26, 28),
    RGBColor(55, 126, 184),
    RGBColor(77, 175, 74),
    RGBColor(152, 78, 163),
    RGBColor(255, 127, 0),
    RGBColor(166, 86, 40),
    RGBColor(247, 129, 191),
    RGBColor(153, 153, 153),
];

impl Theme {
    /// Look up a theme by name (classic, nature, colorful, dark, high_contrast)
    pub fn from_str(name: &str) -> Option<Self> {
        match name.to_lowercase().replace('-', "_").as_str() {
            "classic" => Some(Self::classic()),
            "nature" => Some(Self::nature()),
            "colorful" => Some(Self::colorful()),
            "dark" => Some(Self::dark()),
            "high_contrast" => Some(Self::high_contrast()),
            _ => None,
        }
    }

    /// Dark blue / light blue chromosomes, as in the R/qtl2 scan plot
    pub fn classic() -> Self {
        Self {
            background: RGBColor(255, 255, 255),
            text: RGBColor(0, 0, 0),
            axis: RGBColor(100, 100, 100),
            threshold_line: RGBColor(255, 0, 0),
            peak: RGBColor(200, 30, 30),
            chromosome_colors: vec![
                RGBColor(0, 0, 139),     // Dark blue
                RGBColor(100, 149, 237), // Cornflower
            ],
            series_colors: SET1.to_vec(),
            heat: RGBColor(8, 48, 107),
        }
    }

    /// Muted grays
    pub fn nature() -> Self {
        Self {
            background: RGBColor(255, 255, 255),
            text: RGBColor(50, 50, 50),
            axis: RGBColor(80, 80, 80),
            threshold_line: RGBColor(178, 34, 34), // Firebrick
            peak: RGBColor(178, 34, 34),
            chromosome_colors: vec![RGBColor(77, 77, 77), RGBColor(153, 153, 153)],
            series_colors: vec![
                RGBColor(77, 77, 77),
                RGBColor(178, 34, 34),
                RGBColor(70, 130, 180),
                RGBColor(153, 153, 153),
            ],
            heat: RGBColor(40, 40, 40),
        }
    }

    /// Distinct color for every chromosome
    pub fn colorful() -> Self {
        Self {
            background: RGBColor(255, 255, 255),
            text: RGBColor(0, 0, 0),
            axis: RGBColor(100, 100, 100),
            threshold_line: RGBColor(255, 0, 0),
            peak: RGBColor(0, 0, 0),
            chromosome_colors: SET1.to_vec(),
            series_colors: SET1.to_vec(),
            heat: RGBColor(165, 0, 38),
        }
    }

    /// Dark background for presentations
    pub fn dark() -> Self {
        Self {
            background: RGBColor(30, 30, 30),
            text: RGBColor(220, 220, 220),
            axis: RGBColor(150, 150, 150),
            threshold_line: RGBColor(255, 100, 100),
            peak: RGBColor(255, 215, 0),
            chromosome_colors: vec![
                RGBColor(102, 194, 165), // Teal
                RGBColor(252, 141, 98),  // Coral
            ],
            series_colors: vec![
                RGBColor(102, 194, 165),
                RGBColor(252, 141, 98),
                RGBColor(141, 160, 203),
                RGBColor(231, 138, 195),
            ],
            heat: RGBColor(102, 194, 165),
        }
    }

    /// Black and gray only
    pub fn high_contrast() -> Self {
        Self {
            background: RGBColor(255, 255, 255),
            text: RGBColor(0, 0, 0),
            axis: RGBColor(0, 0, 0),
            threshold_line: RGBColor(0, 0, 0),
            peak: RGBColor(0, 0, 0),
            chromosome_colors: vec![RGBColor(0, 0, 0), RGBColor(150, 150, 150)],
            series_colors: vec![RGBColor(0, 0, 0), RGBColor(150, 150, 150)],
            heat: RGBColor(0, 0, 0),
        }
    }

    /// Blend from the background toward `heat` by `p` in [0, 1].
    pub fn heat_color(&self, p: f64) -> RGBColor {
        let p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
        let mix = |bg: u8, fg: u8| (bg as f64 + (fg as f64 - bg as f64) * p).round() as u8;
        RGBColor(
            mix(self.background.0, self.heat.0),
            mix(self.background.1, self.heat.1),
            mix(self.background.2, self.heat.2),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str() {
        assert!(Theme::from_str("classic").is_some());
        assert!(Theme::from_str("High-Contrast").is_some());
        assert!(Theme::from_str("neon").is_none());
    }

    #[test]
    fn test_heat_color_endpoints() {
        let theme = Theme::classic();
        assert_eq!(theme.heat_color(0.0), theme.background);
        assert_eq!(theme.heat_color(1.0), theme.heat);
        assert_eq!(theme.heat_color(f64::NAN), theme.background);
    }
}
