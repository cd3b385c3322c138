//! Rank-revealing least squares
//!
//! Genome scans regress a phenotype on genotype probability columns whose
//! rows sum to one, so designs are frequently rank deficient (an intercept
//! plus every genotype column, or a genotype class that nobody carries).
//! Fits are therefore computed from a thin SVD, dropping singular values
//! below `tol * s_max`, which gives the minimum-norm solution and the correct
//! residual sum of squares for any rank.

use anyhow::{anyhow, Result};
use faer::Mat as FaerMat;
use nalgebra::{DMatrix, DVector};

/// Relative tolerance for dropping singular values.
pub const DEFAULT_TOL: f64 = 1e-12;

/// Residual sum of squares of a least squares fit.
#[derive(Debug, Clone, Copy)]
pub struct RssFit {
    pub rss: f64,
    /// Numerical rank of X
    pub rank: usize,
    /// log det(X'X) restricted to the non-null singular values
    pub log_det_xtx: f64,
}

/// Full least squares fit with coefficients and standard errors.
#[derive(Debug, Clone)]
pub struct CoefFit {
    pub coef: DVector<f64>,
    /// Standard errors, sqrt(diag(sigma2 * (X'X)^+))
    pub se: DVector<f64>,
    /// Residual variance rss / (n - rank)
    pub sigma2: f64,
    pub rss: f64,
    pub rank: usize,
    pub fitted: DVector<f64>,
    pub residuals: DVector<f64>,
}

/// Thin SVD restricted to the singular values above the cutoff.
struct ReducedSvd {
    u: DMatrix<f64>,
    s: Vec<f64>,
    v: DMatrix<f64>,
}

fn reduced_svd(x: &DMatrix<f64>, tol: f64) -> ReducedSvd {
    let (n, p) = x.shape();
    if n == 0 || p == 0 {
        return ReducedSvd {
            u: DMatrix::zeros(n, 0),
            s: Vec::new(),
            v: DMatrix::zeros(p, 0),
        };
    }

    let svd = nalgebra_to_faer(x).thin_svd();
    let u = svd.u();
    let v = svd.v();
    let s = svd.s_diagonal();

    let n_sv = s.nrows();
    let s_max = (0..n_sv).map(|i| s.read(i)).fold(0.0_f64, f64::max);
    let cutoff = s_max * tol.max(f64::EPSILON * (n.max(p) as f64));

    let keep: Vec<usize> = (0..n_sv).filter(|&i| s.read(i) > cutoff).collect();
    let r = keep.len();

    ReducedSvd {
        u: DMatrix::from_fn(n, r, |i, j| u.read(i, keep[j])),
        s: keep.iter().map(|&j| s.read(j)).collect(),
        v: DMatrix::from_fn(p, r, |i, j| v.read(i, keep[j])),
    }
}

fn check_dims(x: &DMatrix<f64>, y: &DVector<f64>) -> Result<()> {
    if x.nrows() != y.len() {
        return Err(anyhow!(
            "nrow(X) = {} != length(y) = {}",
            x.nrows(),
            y.len()
        ));
    }
    if y.is_empty() {
        return Err(anyhow!("Cannot fit a linear model with no observations"));
    }
    Ok(())
}

/// Residual sum of squares of y on X.
pub fn fit_rss(x: &DMatrix<f64>, y: &DVector<f64>, tol: f64) -> Result<RssFit> {
    check_dims(x, y)?;
    let svd = reduced_svd(x, tol);

    // r = y - U U' y
    let proj = svd.u.transpose() * y;
    let residuals = y - &svd.u * &proj;
    let log_det_xtx = svd.s.iter().map(|s| 2.0 * s.ln()).sum();

    Ok(RssFit {
        rss: residuals.norm_squared(),
        rank: svd.s.len(),
        log_det_xtx,
    })
}

/// Least squares coefficients of y on X (minimum-norm when X is rank deficient).
pub fn fit_coef(x: &DMatrix<f64>, y: &DVector<f64>, tol: f64) -> Result<CoefFit> {
    check_dims(x, y)?;
    let n = y.len();
    let p = x.ncols();
    let svd = reduced_svd(x, tol);
    let rank = svd.s.len();

    // beta = V S^-1 U' y
    let uty = svd.u.transpose() * y;
    let scaled = DVector::from_fn(rank, |j, _| uty[j] / svd.s[j]);
    let coef = &svd.v * &scaled;

    let fitted = &svd.u * &uty;
    let residuals = y - &fitted;
    let rss = residuals.norm_squared();

    let sigma2 = if n > rank {
        rss / ((n - rank) as f64)
    } else {
        f64::NAN
    };

    // diag(V S^-2 V') * sigma2
    let se = DVector::from_fn(p, |i, _| {
        let var: f64 = (0..rank)
            .map(|j| svd.v[(i, j)] * svd.v[(i, j)] / (svd.s[j] * svd.s[j]))
            .sum();
        (sigma2 * var).sqrt()
    });

    Ok(CoefFit {
        coef,
        se,
        sigma2,
        rss,
        rank,
        fitted,
        residuals,
    })
}

fn nalgebra_to_faer(m: &DMatrix<f64>) -> FaerMat<f64> {
    FaerMat::from_fn(m.nrows(), m.ncols(), |i, j| m[(i, j)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_simple_regression() {
        // y = 1 + 2x exactly
        let x = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let y = DVector::from_vec(vec![1.0, 3.0, 5.0, 7.0]);

        let fit = fit_coef(&x, &y, DEFAULT_TOL).unwrap();
        assert_eq!(fit.rank, 2);
        assert_relative_eq!(fit.coef[0], 1.0, epsilon = 1e-10);
        assert_relative_eq!(fit.coef[1], 2.0, epsilon = 1e-10);
        assert!(fit.rss < 1e-20);
    }

    #[test]
    fn test_rss_matches_mean_model() {
        // Intercept-only RSS is the centred sum of squares
        let y = DVector::from_vec(vec![2.0, 4.0, 6.0, 8.0]);
        let x = DMatrix::from_element(4, 1, 1.0);
        let fit = fit_rss(&x, &y, DEFAULT_TOL).unwrap();
        assert_relative_eq!(fit.rss, 20.0, epsilon = 1e-10);
        assert_relative_eq!(fit.log_det_xtx, 4.0_f64.ln(), epsilon = 1e-10);
    }

    #[test]
    fn test_collinear_design_rank() {
        // Genotype-probability columns sum to one: intercept is redundant
        let x = DMatrix::from_row_slice(
            4,
            3,
            &[1.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.5, 0.5, 1.0, 1.0, 0.0],
        );
        let y = DVector::from_vec(vec![1.0, 2.0, 1.5, 1.1]);
        let fit = fit_rss(&x, &y, DEFAULT_TOL).unwrap();
        assert_eq!(fit.rank, 2);

        let reduced = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 0.0, 1.0, 0.5, 0.5, 1.0, 0.0]);
        let fit_reduced = fit_rss(&reduced, &y, DEFAULT_TOL).unwrap();
        assert_relative_eq!(fit.rss, fit_reduced.rss, epsilon = 1e-10);
    }

    #[test]
    fn test_dimension_mismatch() {
        let x = DMatrix::from_element(3, 1, 1.0);
        let y = DVector::from_vec(vec![1.0, 2.0]);
        assert!(fit_rss(&x, &y, DEFAULT_TOL).is_err());
    }

    #[test]
    fn test_standard_errors_positive() {
        let x = DMatrix::from_row_slice(
            5,
            2,
            &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0, 1.0, 4.0],
        );
        let y = DVector::from_vec(vec![0.9, 3.2, 4.8, 7.1, 9.0]);
        let fit = fit_coef(&x, &y, DEFAULT_TOL).unwrap();
        assert!(fit.se.iter().all(|s| *s > 0.0));
        assert_relative_eq!(fit.residuals.sum(), 0.0, epsilon = 1e-10);
    }
}
