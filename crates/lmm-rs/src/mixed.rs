//! Linear mixed model with a single kinship random effect
//!
//! Model: y = X b + g + e, with g ~ N(0, sigma2 * hsq * K) and
//! e ~ N(0, sigma2 * (1 - hsq) * I).
//!
//! With K = U D U', rotating by U' turns the covariance into the diagonal
//! sigma2 * (hsq * d_i + 1 - hsq), so the likelihood for a given hsq is a
//! weighted least squares problem. hsq is estimated over [0, 1] by maximizing
//! the ML or REML log likelihood with Brent's method.
//!
//! The eigendecomposition follows the "eigen" spectral branch of rrBLUP's
//! mixed.solve: symmetric eigen, eigenvalues sorted in descending order,
//! rejection of matrices that are not positive semi-definite.

use anyhow::{anyhow, Result};
use argmin::core::{CostFunction, Error as ArgminError, Executor};
use argmin::solver::brent::BrentOpt;
use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::linreg::{fit_rss, DEFAULT_TOL};

/// Method for variance component estimation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// Maximum Likelihood
    ML,
    /// Restricted Maximum Likelihood (default)
    #[default]
    REML,
}

impl Method {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ml" => Some(Method::ML),
            "reml" => Some(Method::REML),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::ML => "ML",
            Method::REML => "REML",
        }
    }
}

/// Eigenvalues below this are treated as evidence K is not PSD.
const PSD_TOL: f64 = -1e-6;

/// Smallest residual variance weight; hsq = 1 with a null eigenvalue would
/// otherwise give a zero variance.
const MIN_VARIANCE: f64 = 1e-8;

const BRENT_MAX_ITERS: u64 = 100;

/// Eigendecomposition of a kinship matrix, K = U diag(values) U'.
#[derive(Debug, Clone)]
pub struct KinshipEigen {
    /// Eigenvalues in descending order, clamped at zero
    pub values: Vec<f64>,
    /// U' (rows are eigenvectors, same order as `values`)
    pub vectors_t: DMatrix<f64>,
}

impl KinshipEigen {
    pub fn n(&self) -> usize {
        self.values.len()
    }

    /// U' y
    pub fn rotate_vector(&self, y: &DVector<f64>) -> DVector<f64> {
        &self.vectors_t * y
    }

    /// U' X
    pub fn rotate_matrix(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        &self.vectors_t * x
    }
}

/// Result of heritability estimation.
#[derive(Debug, Clone, Copy)]
pub struct HsqFit {
    /// Proportion of residual variance explained by the kinship effect
    pub hsq: f64,
    /// Total variance sigma2
    pub sigma2: f64,
    /// Maximized log likelihood (ML or REML)
    pub loglik: f64,
}

/// Eigendecompose a kinship matrix.
///
/// Fails if K is not square or if its smallest eigenvalue is below -1e-6.
/// Small negative eigenvalues above that are set to zero.
pub fn decomp_kinship(k: &DMatrix<f64>) -> Result<KinshipEigen> {
    let n = k.nrows();
    if k.ncols() != n {
        return Err(anyhow!("Kinship matrix must be square, got {}x{}", n, k.ncols()));
    }
    if n == 0 {
        return Err(anyhow!("Kinship matrix is empty"));
    }

    let eig = SymmetricEigen::new(k.clone());

    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| {
        eig.eigenvalues[b]
            .partial_cmp(&eig.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let min_value = eig.eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
    if min_value < PSD_TOL {
        return Err(anyhow!(
            "Kinship matrix not positive semi-definite (min eigenvalue = {})",
            min_value
        ));
    }

    let values: Vec<f64> = indices
        .iter()
        .map(|&i| eig.eigenvalues[i].max(0.0))
        .collect();
    let vectors_t = DMatrix::from_fn(n, n, |i, j| eig.eigenvectors[(j, indices[i])]);

    Ok(KinshipEigen { values, vectors_t })
}

/// 1 / sqrt(hsq * d_i + 1 - hsq) for each eigenvalue.
pub fn variance_weights(values: &[f64], hsq: f64) -> DVector<f64> {
    DVector::from_iterator(
        values.len(),
        values
            .iter()
            .map(|d| 1.0 / (hsq * d + 1.0 - hsq).max(MIN_VARIANCE).sqrt()),
    )
}

/// Scale each row of X by its weight.
pub fn weighted_design(x: &DMatrix<f64>, weights: &DVector<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| x[(i, j)] * weights[i])
}

/// Log likelihood of the rotated data at a fixed hsq.
///
/// Returns the fit with sigma2 at its maximizing value for that hsq.
pub fn log_likelihood(
    values: &[f64],
    y_rot: &DVector<f64>,
    x_rot: &DMatrix<f64>,
    hsq: f64,
    method: Method,
) -> Result<HsqFit> {
    let n = values.len();
    if y_rot.len() != n || x_rot.nrows() != n {
        return Err(anyhow!(
            "Rotated data has {} rows but kinship has {} eigenvalues",
            y_rot.len(),
            n
        ));
    }

    let weights = variance_weights(values, hsq);
    let y_w = y_rot.component_mul(&weights);
    let x_w = weighted_design(x_rot, &weights);
    let fit = fit_rss(&x_w, &y_w, DEFAULT_TOL)?;

    // sum log V_i = -2 sum log w_i
    let log_det_v: f64 = -2.0 * weights.iter().map(|w| w.ln()).sum::<f64>();
    let two_pi = 2.0 * std::f64::consts::PI;

    let (df, sigma2) = match method {
        Method::ML => (n as f64, fit.rss / n as f64),
        Method::REML => {
            let df = n.saturating_sub(fit.rank) as f64;
            if df <= 0.0 {
                return Err(anyhow!("No residual degrees of freedom for REML"));
            }
            (df, fit.rss / df)
        }
    };

    let mut loglik = -0.5 * df * ((two_pi * sigma2).ln() + 1.0) - 0.5 * log_det_v;

    if method == Method::REML {
        let unweighted = fit_rss(x_rot, y_rot, DEFAULT_TOL)?;
        loglik += 0.5 * (unweighted.log_det_xtx - fit.log_det_xtx);
    }

    Ok(HsqFit {
        hsq,
        sigma2,
        loglik,
    })
}

struct NegLogLik<'a> {
    values: &'a [f64],
    y_rot: &'a DVector<f64>,
    x_rot: &'a DMatrix<f64>,
    method: Method,
}

impl CostFunction for NegLogLik<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, hsq: &Self::Param) -> Result<Self::Output, ArgminError> {
        let fit = log_likelihood(self.values, self.y_rot, self.x_rot, *hsq, self.method)
            .map_err(|e| ArgminError::msg(e.to_string()))?;
        Ok(-fit.loglik)
    }
}

/// Estimate hsq in [0, 1] by maximizing the log likelihood.
///
/// Brent's method searches the interior; the endpoints are checked
/// separately since the optimum is often on the boundary.
pub fn fit_hsq(
    values: &[f64],
    y_rot: &DVector<f64>,
    x_rot: &DMatrix<f64>,
    method: Method,
) -> Result<HsqFit> {
    let mut best = log_likelihood(values, y_rot, x_rot, 0.0, method)?;
    let upper = log_likelihood(values, y_rot, x_rot, 1.0, method)?;
    if upper.loglik > best.loglik {
        best = upper;
    }

    let problem = NegLogLik {
        values,
        y_rot,
        x_rot,
        method,
    };
    let solver = BrentOpt::new(0.0, 1.0);
    let res = Executor::new(problem, solver)
        .configure(|state| state.max_iters(BRENT_MAX_ITERS))
        .run();

    match res {
        Ok(r) => {
            if let Some(hsq) = r.state.best_param {
                let interior = log_likelihood(values, y_rot, x_rot, hsq.clamp(0.0, 1.0), method)?;
                if interior.loglik > best.loglik {
                    best = interior;
                }
            }
        }
        Err(e) => {
            tracing::warn!("hsq optimization failed, using boundary estimate: {}", e);
        }
    }

    tracing::debug!(
        "hsq = {:.4}, sigma2 = {:.4}, loglik = {:.4} ({})",
        best.hsq,
        best.sigma2,
        best.loglik,
        method.as_str()
    );

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn block_kinship(n_fam: usize, fam_size: usize) -> DMatrix<f64> {
        let n = n_fam * fam_size;
        DMatrix::from_fn(n, n, |i, j| {
            if i / fam_size == j / fam_size {
                1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_eigen_descending() {
        let k = DMatrix::from_row_slice(3, 3, &[2.0, 0.5, 0.0, 0.5, 1.0, 0.0, 0.0, 0.0, 3.0]);
        let eigen = decomp_kinship(&k).unwrap();
        assert_eq!(eigen.n(), 3);
        assert!(eigen.values[0] >= eigen.values[1]);
        assert!(eigen.values[1] >= eigen.values[2]);
        assert_relative_eq!(eigen.values[0], 3.0, epsilon = 1e-10);

        // U' K U = D
        let u = eigen.vectors_t.transpose();
        let d = &eigen.vectors_t * &k * &u;
        for i in 0..3 {
            assert_relative_eq!(d[(i, i)], eigen.values[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_not_psd_rejected() {
        let k = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(decomp_kinship(&k).is_err());
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let k = block_kinship(3, 2);
        let eigen = decomp_kinship(&k).unwrap();
        let y = DVector::from_vec(vec![1.0, -2.0, 0.5, 3.0, 1.5, -1.0]);
        let y_rot = eigen.rotate_vector(&y);
        assert_relative_eq!(y_rot.norm(), y.norm(), epsilon = 1e-10);
    }

    #[test]
    fn test_identity_kinship_flat_likelihood() {
        // With K = I every hsq gives V = I
        let n = 8;
        let eigen = decomp_kinship(&DMatrix::identity(n, n)).unwrap();
        let y = DVector::from_vec(vec![0.3, 1.2, -0.7, 2.1, 0.0, -1.1, 0.8, 0.4]);
        let x = DMatrix::from_element(n, 1, 1.0);
        let y_rot = eigen.rotate_vector(&y);
        let x_rot = eigen.rotate_matrix(&x);

        let ll0 = log_likelihood(&eigen.values, &y_rot, &x_rot, 0.0, Method::REML).unwrap();
        let ll1 = log_likelihood(&eigen.values, &y_rot, &x_rot, 0.7, Method::REML).unwrap();
        assert_relative_eq!(ll0.loglik, ll1.loglik, epsilon = 1e-8);
        assert_relative_eq!(ll0.sigma2, ll1.sigma2, epsilon = 1e-10);
    }

    #[test]
    fn test_family_structure_high_hsq() {
        let n_fam = 10;
        let fam_size = 5;
        let k = block_kinship(n_fam, fam_size);
        let n = n_fam * fam_size;

        // Large family effects, tiny within-family noise
        let y = DVector::from_fn(n, |i, _| {
            let fam = (i / fam_size) as f64;
            3.0 * (fam - 4.5) + 0.05 * ((i as f64) * 1.7).sin()
        });
        let x = DMatrix::from_element(n, 1, 1.0);

        let eigen = decomp_kinship(&k).unwrap();
        let y_rot = eigen.rotate_vector(&y);
        let x_rot = eigen.rotate_matrix(&x);

        for method in [Method::REML, Method::ML] {
            let fit = fit_hsq(&eigen.values, &y_rot, &x_rot, method).unwrap();
            assert!(fit.hsq > 0.8, "{} hsq = {}", method.as_str(), fit.hsq);
            assert!(fit.hsq <= 1.0);
        }
    }

    #[test]
    fn test_no_structure_low_hsq() {
        // Phenotype constant within families except for noise uncorrelated with K
        let n_fam = 10;
        let fam_size = 4;
        let k = block_kinship(n_fam, fam_size);
        let n = n_fam * fam_size;
        let y = DVector::from_fn(n, |i, _| if i % 2 == 0 { 1.0 } else { -1.0 });
        let x = DMatrix::from_element(n, 1, 1.0);

        let eigen = decomp_kinship(&k).unwrap();
        let y_rot = eigen.rotate_vector(&y);
        let x_rot = eigen.rotate_matrix(&x);
        let fit = fit_hsq(&eigen.values, &y_rot, &x_rot, Method::REML).unwrap();
        assert!(fit.hsq < 0.1, "hsq = {}", fit.hsq);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!(Method::from_str("reml"), Some(Method::REML));
        assert_eq!(Method::from_str("ML"), Some(Method::ML));
        assert_eq!(Method::from_str("bayes"), None);
        assert_eq!(Method::default(), Method::REML);
    }
}
