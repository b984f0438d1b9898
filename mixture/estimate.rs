//! # Model Estimation
//!
//! Entry point for fitting: prepares the working dataset, runs EM on the fitted
//! rows (standardized if requested), maps the estimates back to data units and
//! assembles the probability tables and the optimizer record.

use crate::control::Control;
use crate::convergence::{ConvergenceStatus, IterationControl};
use crate::data::{DataError, TimeSeries};
use crate::diagnostics::Diagnostics;
use crate::em::{EmError, EmSettings, Mixing, run_em};
use crate::model::{Coefficient, FittedModel, INTERCEPT, OptimizerRecord, ProbTable, Theta};
use crate::prepare::{FitSpec, RowStatus, Scaling, WorkingData, prepare};
use ndarray::{Array1, Axis};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Em(#[from] EmError),

    #[error("The fitted parameters are not finite after mapping back to data units.")]
    NonFiniteParameters,
}

/// Fits the foehn mixture to `data`. The table is only read.
pub fn fit(data: &TimeSeries, spec: &FitSpec, control: &Control) -> Result<FittedModel, FitError> {
    let mut diagnostics = Diagnostics::new(control.verbose());
    let working = prepare(data, spec, control, &mut diagnostics)?;

    let y = working.fitted_predictor();
    let x = working.fitted_design();
    let predictor_scaling = working
        .standardization()
        .map(|s| s.predictor)
        .unwrap_or_else(Scaling::identity);
    let family = match working.standardization() {
        Some(s) => control.family().standardized(s.predictor.mean, s.predictor.sd),
        None => *control.family(),
    };

    diagnostics.info(format!(
        "Estimating {} mixture on {} observations{}.",
        family.name(),
        y.len(),
        if x.is_some() {
            format!(" with concomitants {:?}", spec.concomitant_names())
        } else {
            String::new()
        }
    ));

    let settings = EmSettings {
        switch: control.switch(),
        em: IterationControl::new(control.maxit_em(), control.tol_em()),
        iwls: IterationControl::new(control.maxit_iwls(), control.tol_iwls()),
    };
    let em = run_em(&family, y.view(), x.as_ref().map(|x| x.view()), &settings, &mut diagnostics)?;

    let params = em
        .params
        .unstandardize(predictor_scaling.mean, predictor_scaling.sd);
    if !params.is_finite() {
        return Err(FitError::NonFiniteParameters);
    }
    let (mixing_prob, coefficients) = match &em.mixing {
        Mixing::Constant(pi) => (Some(*pi), Vec::new()),
        Mixing::Logit(beta) => (None, internal::coefficients_in_data_units(beta, &working)),
    };

    // Posterior and mixing probabilities do not depend on the scaling, the
    // log-likelihood does.
    let fitted_rows = working.fitted_rows();
    let y_data = working.y().select(Axis(0), &fitted_rows);
    let loglik = control
        .family()
        .loglik(y_data.view(), em.post.view(), em.prob.view(), &params);
    if !loglik.full.is_finite() {
        return Err(EmError::NonFiniteLoglik {
            iteration: em.iterations,
        }
        .into());
    }

    let working_prob = internal::working_prob_table(&working, &em.post);
    let prob = internal::original_prob_table(data, &working, &working_prob);
    let nobs = working_prob.n_classified();
    let edf = em.edf;

    let optimizer = OptimizerRecord {
        converged: em.converged(),
        iter: em.iterations,
        loglik: loglik.full,
        loglik_component: loglik.component,
        loglik_concomitant: loglik.concomitant,
        edf,
        aic: -2.0 * loglik.full + 2.0 * edf as f64,
        bic: -2.0 * loglik.full + edf as f64 * (nobs as f64).ln(),
        nobs,
        iwls_converged: em
            .iwls_status
            .map(|s| s == ConvergenceStatus::Converged),
        theta: Theta {
            mu1: params.mu1,
            logsd1: params.logsd1,
            mu2: params.mu2,
            logsd2: params.logsd2,
            mixing_prob,
            coefficients,
        },
    };
    log::info!(
        "Fit finished: loglik {:.3}, AIC {:.3}, BIC {:.3}, {} iterations{}",
        optimizer.loglik,
        optimizer.aic,
        optimizer.bic,
        optimizer.iter,
        if optimizer.converged { "" } else { " (not converged)" }
    );

    Ok(FittedModel {
        spec: spec.clone(),
        control: control.clone(),
        working,
        prob,
        working_prob,
        optimizer,
        diagnostics,
    })
}

mod internal {
    use super::*;

    /// Coefficients estimated on z-scored concomitants, expressed for raw values:
    /// slopes `b_j / s_j`, intercept `b_0 - sum(b_j m_j / s_j)`.
    pub(super) fn coefficients_in_data_units(
        beta: &Array1<f64>,
        working: &WorkingData,
    ) -> Vec<Coefficient> {
        let scalings: Vec<Scaling> = match working.standardization() {
            Some(s) => s.concomitants.clone(),
            None => vec![Scaling::identity(); working.concomitant_names().len()],
        };
        let slopes: Vec<f64> = beta
            .iter()
            .skip(1)
            .zip(&scalings)
            .map(|(b, s)| b / s.sd)
            .collect();
        let intercept = beta[0]
            - slopes
                .iter()
                .zip(&scalings)
                .map(|(b, s)| b * s.mean)
                .sum::<f64>();

        std::iter::once(Coefficient {
            name: INTERCEPT.to_string(),
            value: intercept,
        })
        .chain(
            working
                .concomitant_names()
                .iter()
                .zip(slopes)
                .map(|(name, value)| Coefficient {
                    name: name.clone(),
                    value,
                }),
        )
        .collect()
    }

    pub(super) fn working_prob_table(working: &WorkingData, post: &Array1<f64>) -> ProbTable {
        let mut fitted = post.iter();
        let (prob, flag) = working
            .status()
            .iter()
            .map(|status| match status {
                RowStatus::Fitted => {
                    let z = fitted.next().copied().unwrap_or(f64::NAN);
                    (z, Some(u8::from(z >= 0.5)))
                }
                RowStatus::Filtered => (0.0, None),
                RowStatus::Missing => (f64::NAN, None),
            })
            .unzip();
        ProbTable {
            index: working.index().to_vec(),
            prob,
            flag,
        }
    }

    /// Aligns the working table to the caller's rows. Rows that were not on the
    /// inflated grid are unclassified.
    pub(super) fn original_prob_table(
        data: &TimeSeries,
        working: &WorkingData,
        working_prob: &ProbTable,
    ) -> ProbTable {
        let mut slot_of_row = vec![None; data.len()];
        for (slot, source) in working.source_rows().iter().enumerate() {
            if let Some(row) = source {
                slot_of_row[*row] = Some(slot);
            }
        }
        let (prob, flag) = slot_of_row
            .iter()
            .map(|slot| match slot {
                Some(s) => (working_prob.prob[*s], working_prob.flag[*s]),
                None => (f64::NAN, None),
            })
            .unzip();
        ProbTable {
            index: data.index().to_vec(),
            prob,
            flag,
        }
    }
}
