//! lmm-rs: linear model kernels used by the qtlx genome scans
//!
//! This crate holds the numerical pieces that the scan, permutation and
//! effect-estimation stages share:
//!
//! - `linreg`: rank-revealing least squares via a thin SVD (residual sum of
//!   squares, coefficients, standard errors, log det of X'X)
//! - `mixed`: kinship eigendecomposition, rotation of the data into the
//!   kinship eigenbasis, and REML/ML estimation of the heritability of the
//!   polygenic random effect
//!
//! # Example
//!
//! ```ignore
//! use lmm_rs::{decomp_kinship, fit_hsq, Method};
//!
//! let eigen = decomp_kinship(&k)?;
//! let y_rot = eigen.rotate_vector(&y);
//! let x_rot = eigen.rotate_matrix(&x);
//! let fit = fit_hsq(&eigen.values, &y_rot, &x_rot, Method::REML)?;
//! println!("hsq = {:.3}, sigma2 = {:.3}", fit.hsq, fit.sigma2);
//! ```

// Least squares via SVD
pub mod linreg;

// Mixed model with a kinship random effect
pub mod mixed;

pub use linreg::{fit_coef, fit_rss, CoefFit, RssFit, DEFAULT_TOL};

pub use mixed::{
    decomp_kinship, fit_hsq, log_likelihood, variance_weights, weighted_design, HsqFit,
    KinshipEigen, Method,
};
