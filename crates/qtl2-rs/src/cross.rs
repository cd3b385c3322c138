//! Cross types: genotype states and the HMM pieces that depend on them
//!
//! Each cross type defines, in log space:
//! - `init(g)`: prior probability of genotype state g
//! - `step(g_left, g_right, r)`: transition between adjacent positions at
//!   recombination fraction r
//! - `emit(obs, g, error_prob)`: probability of an observed genotype code
//!
//! Observed codes: 0 = missing, 1..=n_gen = genotype state (AA, AB, BB for
//! an F2), and for the F2 the partially informative codes 4 = not BB and
//! 5 = not AA.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossType {
    /// Backcross (AA, AB)
    BC,
    /// Intercross (AA, AB, BB)
    F2,
    /// Recombinant inbred lines by selfing (AA, BB)
    RISelf,
    /// Recombinant inbred lines by sib mating (AA, BB)
    RISib,
    /// Doubled haploids (AA, BB)
    DH,
}

/// Code for "not BB" in an intercross
pub const F2_NOT_BB: u8 = 4;
/// Code for "not AA" in an intercross
pub const F2_NOT_AA: u8 = 5;

impl CrossType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bc" => Some(CrossType::BC),
            "f2" => Some(CrossType::F2),
            "riself" => Some(CrossType::RISelf),
            "risib" => Some(CrossType::RISib),
            "dh" => Some(CrossType::DH),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrossType::BC => "bc",
            CrossType::F2 => "f2",
            CrossType::RISelf => "riself",
            CrossType::RISib => "risib",
            CrossType::DH => "dh",
        }
    }

    /// Number of genotype states.
    pub fn n_gen(&self) -> usize {
        match self {
            CrossType::F2 => 3,
            _ => 2,
        }
    }

    /// Largest valid observed genotype code.
    pub fn max_code(&self) -> u8 {
        match self {
            CrossType::F2 => F2_NOT_AA,
            _ => self.n_gen() as u8,
        }
    }

    pub fn is_valid_code(&self, code: u8) -> bool {
        code <= self.max_code()
    }

    /// Genotype state names built from the two allele labels.
    pub fn geno_names(&self, alleles: &[String]) -> Vec<String> {
        let a = alleles.first().map(String::as_str).unwrap_or("A");
        let b = alleles.get(1).map(String::as_str).unwrap_or("B");
        match self {
            CrossType::BC => vec![format!("{a}{a}"), format!("{a}{b}")],
            CrossType::F2 => vec![format!("{a}{a}"), format!("{a}{b}"), format!("{b}{b}")],
            _ => vec![format!("{a}{a}"), format!("{b}{b}")],
        }
    }

    /// Default genotype symbol table (symbol -> code) for the allele labels.
    pub fn default_genotype_codes(&self, alleles: &[String]) -> Vec<(String, u8)> {
        let mut codes: Vec<(String, u8)> = self
            .geno_names(alleles)
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, (i + 1) as u8))
            .collect();
        if *self == CrossType::F2 {
            let a = alleles.first().map(String::as_str).unwrap_or("A");
            let b = alleles.get(1).map(String::as_str).unwrap_or("B");
            codes.push((format!("not{b}{b}"), F2_NOT_BB));
            codes.push((format!("not{a}{a}"), F2_NOT_AA));
        }
        codes
    }

    /// Expected dosage of each of the two founder alleles for genotype state g.
    pub fn allele_dosage(&self, g: usize) -> [f64; 2] {
        match (self, g) {
            (CrossType::BC, 0) => [1.0, 0.0],
            (CrossType::BC, _) => [0.5, 0.5],
            (CrossType::F2, 0) => [1.0, 0.0],
            (CrossType::F2, 1) => [0.5, 0.5],
            (CrossType::F2, _) => [0.0, 1.0],
            (_, 0) => [1.0, 0.0],
            (_, _) => [0.0, 1.0],
        }
    }

    /// log Pr(g) at the first position.
    pub fn init(&self, g: usize) -> f64 {
        match self {
            CrossType::F2 => {
                if g == 1 {
                    -std::f64::consts::LN_2
                } else {
                    -2.0 * std::f64::consts::LN_2
                }
            }
            _ => -std::f64::consts::LN_2,
        }
    }

    /// Recombination fraction on the scale of the final generation.
    ///
    /// Recombinant inbred lines accumulate crossovers over several
    /// generations, which expands the map.
    pub fn adjust_rec_frac(&self, r: f64) -> f64 {
        match self {
            CrossType::RISelf => 2.0 * r / (1.0 + 2.0 * r),
            CrossType::RISib => 4.0 * r / (1.0 + 6.0 * r),
            _ => r,
        }
    }

    /// log Pr(g_right | g_left) at recombination fraction r.
    pub fn step(&self, g_left: usize, g_right: usize, r: f64) -> f64 {
        let r = self.adjust_rec_frac(r);
        match self {
            CrossType::F2 => {
                let p = match (g_left, g_right) {
                    (0, 0) | (2, 2) => (1.0 - r) * (1.0 - r),
                    (0, 1) | (2, 1) => 2.0 * r * (1.0 - r),
                    (0, 2) | (2, 0) => r * r,
                    (1, 1) => (1.0 - r) * (1.0 - r) + r * r,
                    _ => r * (1.0 - r),
                };
                p.ln()
            }
            _ => {
                if g_left == g_right {
                    (1.0 - r).ln()
                } else {
                    r.ln()
                }
            }
        }
    }

    /// log Pr(obs | g) with genotyping error probability `error_prob`.
    pub fn emit(&self, obs: u8, g: usize, error_prob: f64) -> f64 {
        if obs == 0 {
            return 0.0;
        }
        let n_gen = self.n_gen();

        if *self == CrossType::F2 && (obs == F2_NOT_BB || obs == F2_NOT_AA) {
            let compatible = if obs == F2_NOT_BB { g != 2 } else { g != 0 };
            return if compatible {
                (1.0 - error_prob / 2.0).ln()
            } else {
                error_prob.ln()
            };
        }

        if obs as usize > n_gen {
            // unknown code: no information
            return 0.0;
        }

        if obs as usize == g + 1 {
            (1.0 - error_prob).ln()
        } else {
            (error_prob / (n_gen - 1) as f64).ln()
        }
    }
}
