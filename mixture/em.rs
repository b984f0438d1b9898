//! # EM Engine
//!
//! Fits the two-component mixture on the rows selected for fitting. The state is
//! the component parameters, the mixing model (a constant probability, or logistic
//! coefficients when concomitants are present) and the posterior responsibilities.
//!
//! Start: a hard split of `y` at its mean. With `switch = false` the observations at
//! or above the mean start in the foehn component, with `switch = true` those at or
//! below it. Component 2 stays the foehn component for the whole fit.
//!
//! Each iteration runs the M-step (mixing model, then component parameters), the
//! E-step and evaluates the expected complete-data log-likelihood. The loop is the
//! shared `IterationControl` driver, so convergence and the iteration cap behave
//! the same as in the IWLS solver.

use crate::convergence::{ConvergenceStatus, IterationControl};
use crate::diagnostics::Diagnostics;
use crate::family::{ComponentParams, Family, FamilyError, LogLikelihood};
use crate::iwls::{IwlsError, IwlsFit, iwls_logit, mixing_probabilities};
use ndarray::{Array1, ArrayView1, ArrayView2};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmError {
    #[error(
        "The EM algorithm produced a non-finite log-likelihood at iteration {iteration}. Check the predictor for extreme values."
    )]
    NonFiniteLoglik { iteration: usize },

    #[error("The predictor has no observations to fit.")]
    EmptyPredictor,

    #[error("Component update failed: {0}")]
    Family(#[from] FamilyError),

    #[error("Concomitant model update failed: {0}")]
    Iwls(#[from] IwlsError),
}

/// Settings for one EM run.
#[derive(Debug, Clone, Copy)]
pub struct EmSettings {
    pub switch: bool,
    pub em: IterationControl,
    pub iwls: IterationControl,
}

/// The mixing probability model.
#[derive(Debug, Clone, PartialEq)]
pub enum Mixing {
    /// One probability for every observation.
    Constant(f64),
    /// Logistic coefficients, intercept first.
    Logit(Array1<f64>),
}

/// The frozen state of a finished EM run.
#[derive(Debug, Clone)]
pub struct EmFit {
    pub params: ComponentParams,
    pub mixing: Mixing,
    /// Posterior probability of the foehn component per fitted row.
    pub post: Array1<f64>,
    /// Mixing probability per fitted row.
    pub prob: Array1<f64>,
    pub loglik: LogLikelihood,
    pub status: ConvergenceStatus,
    pub iterations: usize,
    /// Status of the last IWLS solve, if there is a concomitant model.
    pub iwls_status: Option<ConvergenceStatus>,
    pub edf: usize,
}

impl EmFit {
    pub fn converged(&self) -> bool {
        self.status == ConvergenceStatus::Converged
    }
}

struct EmState {
    params: ComponentParams,
    mixing: Mixing,
    post: Array1<f64>,
    prob: Array1<f64>,
    loglik: LogLikelihood,
    iwls_status: Option<ConvergenceStatus>,
}

/// Runs EM on `y` (and the design `x`, intercept first, if given).
pub fn run_em(
    family: &Family,
    y: ArrayView1<f64>,
    x: Option<ArrayView2<f64>>,
    settings: &EmSettings,
    diagnostics: &mut Diagnostics,
) -> Result<EmFit, EmError> {
    let mut state = initialize(family, y, x, settings)?;
    log::debug!(
        "EM start: mu1={:.4} mu2={:.4} loglik={:.6}",
        state.params.mu1,
        state.params.mu2,
        state.loglik.full
    );

    let outcome = settings.em.run(state.loglik.full, |iteration| {
        let (mixing, prob, iwls_status) = update_mixing(y, x, &state, settings)?;
        let params = family.update_params(y, state.post.view(), &state.params)?;
        let post = family.posterior(y, prob.view(), &params);
        let loglik = family.loglik(y, post.view(), prob.view(), &params);
        if !loglik.full.is_finite() {
            return Err(EmError::NonFiniteLoglik { iteration });
        }
        log::debug!("EM iteration {iteration}: loglik {:.10}", loglik.full);

        state = EmState {
            params,
            mixing,
            post,
            prob,
            loglik,
            iwls_status,
        };
        Ok(loglik.full)
    })?;

    match outcome.status {
        ConvergenceStatus::Converged => diagnostics.info(format!(
            "EM algorithm converged after {} iterations (log-likelihood {:.4}).",
            outcome.iterations, state.loglik.full
        )),
        ConvergenceStatus::MaxIterationsReached => diagnostics.warn(format!(
            "EM algorithm stopped at the iteration limit ({}) without converging. Last change {:.3e}.",
            outcome.iterations, outcome.last_change
        )),
    }
    if state.iwls_status == Some(ConvergenceStatus::MaxIterationsReached) {
        diagnostics.warn("The last IWLS solve of the concomitant model reached its iteration limit.");
    }

    let edf = 2 * family.params_per_component()
        + match &state.mixing {
            Mixing::Constant(_) => 0,
            Mixing::Logit(beta) => beta.len(),
        };

    Ok(EmFit {
        params: state.params,
        mixing: state.mixing,
        post: state.post,
        prob: state.prob,
        loglik: state.loglik,
        status: outcome.status,
        iterations: outcome.iterations,
        iwls_status: state.iwls_status,
        edf,
    })
}

fn initialize(
    family: &Family,
    y: ArrayView1<f64>,
    x: Option<ArrayView2<f64>>,
    settings: &EmSettings,
) -> Result<EmState, EmError> {
    let mean = y.mean().ok_or(EmError::EmptyPredictor)?;
    let z0: Array1<f64> = y.mapv(|v| {
        let foehn = if settings.switch { v <= mean } else { v >= mean };
        if foehn { 1.0 } else { 0.0 }
    });

    let params = family.initial_params(y, z0.view())?;
    let (mixing, prob, iwls_status) = match x {
        Some(x) => {
            let fit = iwls_logit(x, z0.view(), None, &settings.iwls)?;
            let status = fit.status;
            let IwlsFit { beta, .. } = fit;
            let prob = mixing_probabilities(x, beta.view());
            (Mixing::Logit(beta), prob, Some(status))
        }
        None => {
            let pi = z0.mean().ok_or(EmError::EmptyPredictor)?;
            (Mixing::Constant(pi), Array1::from_elem(y.len(), pi), None)
        }
    };

    let post = family.posterior(y, prob.view(), &params);
    let loglik = family.loglik(y, post.view(), prob.view(), &params);
    if !loglik.full.is_finite() {
        return Err(EmError::NonFiniteLoglik { iteration: 0 });
    }

    Ok(EmState {
        params,
        mixing,
        post,
        prob,
        loglik,
        iwls_status,
    })
}

fn update_mixing(
    y: ArrayView1<f64>,
    x: Option<ArrayView2<f64>>,
    state: &EmState,
    settings: &EmSettings,
) -> Result<(Mixing, Array1<f64>, Option<ConvergenceStatus>), EmError> {
    match (x, &state.mixing) {
        (Some(x), Mixing::Logit(beta)) => {
            let fit = iwls_logit(x, state.post.view(), Some(beta.view()), &settings.iwls)?;
            if !fit.converged() {
                log::debug!("IWLS stopped after {} iterations without converging.", fit.iterations);
            }
            let prob = mixing_probabilities(x, fit.beta.view());
            Ok((Mixing::Logit(fit.beta), prob, Some(fit.status)))
        }
        _ => {
            let pi = state.post.mean().ok_or(EmError::EmptyPredictor)?;
            Ok((Mixing::Constant(pi), Array1::from_elem(y.len(), pi), None))
        }
    }
}
