//! # IWLS for the Concomitant Model
//!
//! When concomitant variables are present the mixing probability is
//! `pi = logistic(X beta)`. Each EM M-step refits `beta` by regressing the current
//! posterior responsibilities on `X` with iteratively reweighted least squares:
//!
//! 1. `mu = logistic(eta)`, weights `w = mu (1 - mu)`, working response
//!    `z = eta + (y - mu) / w`
//! 2. solve `(X'WX) beta = X'Wz`
//! 3. repeat until the log-likelihood `sum(y ln mu + (1 - y) ln(1 - mu))` stops
//!    changing by more than the tolerance, or the cap is reached.
//!
//! The responses are probabilities, not 0/1 outcomes, which is fine for the
//! binomial quasi-likelihood being maximised. A nearly singular `X'WX` (collinear or
//! degenerate concomitants) is reported as an error instead of letting non-finite
//! coefficients leak into the EM loop.

use crate::convergence::{ConvergenceStatus, IterationControl};
use crate::family::{PROB_EPS, logistic_cdf};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Eigh, Solve, UPLO};
use thiserror::Error;

/// Smallest acceptable reciprocal condition number of `X'WX`.
const MIN_RCOND: f64 = 1e-12;
const MIN_WEIGHT: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum IwlsError {
    #[error(
        "The weighted design matrix X'WX is singular or nearly so (reciprocal condition number {rcond:.3e}). Check the concomitants for collinearity."
    )]
    SingularDesign { rcond: f64 },

    #[error("A linear system solve failed in the IWLS solver: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),

    #[error("The IWLS solver produced non-finite coefficients at iteration {iteration}.")]
    NonFiniteCoefficients { iteration: usize },

    #[error("The design matrix has {rows} rows but the response has {len} values.")]
    DimensionMismatch { rows: usize, len: usize },
}

/// Result of one IWLS solve.
#[derive(Clone, Debug)]
pub struct IwlsFit {
    pub beta: Array1<f64>,
    /// Fitted probabilities `logistic(X beta)`.
    pub fitted: Array1<f64>,
    pub loglik: f64,
    /// Number of coefficients.
    pub edf: usize,
    pub status: ConvergenceStatus,
    pub iterations: usize,
}

impl IwlsFit {
    pub fn converged(&self) -> bool {
        self.status == ConvergenceStatus::Converged
    }
}

/// Fits `logit(y) ~ X` by IWLS. `x` must already contain the intercept column.
/// `beta_start` warm-starts the solver, otherwise it starts from zero.
pub fn iwls_logit(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    beta_start: Option<ArrayView1<f64>>,
    control: &IterationControl,
) -> Result<IwlsFit, IwlsError> {
    if x.nrows() != y.len() {
        return Err(IwlsError::DimensionMismatch {
            rows: x.nrows(),
            len: y.len(),
        });
    }

    let mut beta = match beta_start {
        Some(start) => start.to_owned(),
        None => Array1::zeros(x.ncols()),
    };
    let eta = x.dot(&beta);
    let (mut mu, mut weights, mut z) = update_logit_vectors(y, &eta);
    let initial_loglik = logit_loglik(y, &mu);

    let outcome = control.run(initial_loglik, |iteration| {
        let beta_trial = solve_weighted_normal_equations(x, weights.view(), z.view())?;
        if !beta_trial.iter().all(|b| b.is_finite()) {
            log::error!("Non-finite IWLS coefficients at iteration {iteration}: {beta_trial:?}");
            return Err(IwlsError::NonFiniteCoefficients { iteration });
        }
        beta = beta_trial;
        let eta = x.dot(&beta);
        (mu, weights, z) = update_logit_vectors(y, &eta);
        let loglik = logit_loglik(y, &mu);
        log::trace!("IWLS iteration {iteration}: loglik {loglik:.10e}");
        Ok(loglik)
    })?;

    Ok(IwlsFit {
        edf: beta.len(),
        beta,
        fitted: mu,
        loglik: outcome.objective,
        status: outcome.status,
        iterations: outcome.iterations,
    })
}

/// `logistic(X beta)` for every row.
pub fn mixing_probabilities(x: ArrayView2<f64>, beta: ArrayView1<f64>) -> Array1<f64> {
    x.dot(&beta).mapv(logistic_cdf)
}

/// IWLS working quantities for the logit link: fitted probabilities, weights and
/// the working response.
fn update_logit_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    // Clamp eta to prevent overflow in exp
    let eta_clamped = eta.mapv(|e| e.clamp(-700.0, 700.0));
    let mut mu = eta_clamped.mapv(logistic_cdf);
    mu.mapv_inplace(|v| v.clamp(PROB_EPS, 1.0 - PROB_EPS));
    let weights = (&mu * &mu.mapv(|m| 1.0 - m)).mapv(|v| v.max(MIN_WEIGHT));
    let residual = &y - &mu;
    let z = &eta_clamped + &(&residual / &weights);
    (mu, weights, z)
}

fn logit_loglik(y: ArrayView1<f64>, mu: &Array1<f64>) -> f64 {
    ndarray::Zip::from(y)
        .and(mu)
        .fold(0.0, |acc, &yi, &mui| acc + yi * mui.ln() + (1.0 - yi) * (1.0 - mui).ln())
}

fn solve_weighted_normal_equations(
    x: ArrayView2<f64>,
    weights: ArrayView1<f64>,
    z: ArrayView1<f64>,
) -> Result<Array1<f64>, IwlsError> {
    let xw: Array2<f64> = &x * &weights.insert_axis(Axis(1));
    let xtwx = xw.t().dot(&x);
    let xtwz = xw.t().dot(&z);

    let (eigenvalues, _): (Array1<f64>, Array2<f64>) = xtwx
        .eigh(UPLO::Lower)
        .map_err(IwlsError::LinearSystemSolveFailed)?;
    let largest = eigenvalues.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
    let smallest = eigenvalues.iter().fold(f64::INFINITY, |acc, &v| acc.min(v));
    let rcond = if largest > 0.0 { smallest / largest } else { 0.0 };
    if !(rcond > MIN_RCOND) {
        return Err(IwlsError::SingularDesign { rcond });
    }

    xtwx.solve(&xtwz).map_err(IwlsError::LinearSystemSolveFailed)
}
