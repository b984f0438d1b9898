//! # Component Distribution Families
//!
//! The two mixture components share one parametric family. Each component is a
//! location-scale distribution parameterised by `(mu, logsd)`; the family supplies
//! log-densities, their gradients, and the weighted parameter update used by the
//! M-step of the EM algorithm.
//!
//! Families are a closed set. A name given by the user is resolved into a `Family`
//! once, when the `Control` is built, so the fitting loops only ever `match` on an
//! enum and never dispatch on strings.
//!
//! A family may be censored at a single finite bound. Observations at or beyond a
//! left bound contribute `ln F(left)` instead of the log-density, observations at or
//! beyond a right bound contribute `ln (1 - F(right))`. Censored families have no
//! closed-form M-step, so the update is a BFGS minimisation of the weighted negative
//! log-likelihood.

use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::f64::consts::{PI, SQRT_2};
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Names accepted when a family is given as a string.
pub const FAMILY_NAMES: [&str; 2] = ["gaussian", "logistic"];

/// Probabilities are kept away from 0 and 1 before taking logs.
pub const PROB_EPS: f64 = 1e-8;

/// Lower bound for a fitted component standard deviation (or logistic scale).
const MIN_SCALE: f64 = 1e-6;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Cap for the BFGS iterations of one censored M-step.
const CENSORED_MAX_ITERATIONS: usize = 200;
const CENSORED_TOLERANCE: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum FamilyError {
    #[error(
        "Component {component} received no posterior weight. The mixture collapsed onto a single component."
    )]
    CollapsedComponent { component: usize },

    #[error("The censored {family} M-step failed: {message}")]
    OptimizationFailed {
        family: &'static str,
        message: String,
    },
}

/// The distribution kinds available for the mixture components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyKind {
    Gaussian,
    Logistic,
}

impl FamilyKind {
    pub fn name(self) -> &'static str {
        match self {
            FamilyKind::Gaussian => "gaussian",
            FamilyKind::Logistic => "logistic",
        }
    }

    /// Case-insensitive lookup by name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gaussian" => Some(FamilyKind::Gaussian),
            "logistic" => Some(FamilyKind::Logistic),
            _ => None,
        }
    }
}

/// Which tail, if any, is censored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Censoring {
    None,
    Left(f64),
    Right(f64),
}

/// Location and log-scale of both mixture components.
///
/// Component 1 is the background regime, component 2 the foehn regime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentParams {
    pub mu1: f64,
    pub logsd1: f64,
    pub mu2: f64,
    pub logsd2: f64,
}

impl ComponentParams {
    /// Maps parameters estimated on `(y - center) / scale` back to the units of `y`.
    pub fn unstandardize(&self, center: f64, scale: f64) -> Self {
        let log_scale = scale.ln();
        Self {
            mu1: self.mu1 * scale + center,
            logsd1: self.logsd1 + log_scale,
            mu2: self.mu2 * scale + center,
            logsd2: self.logsd2 + log_scale,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.mu1.is_finite()
            && self.logsd1.is_finite()
            && self.mu2.is_finite()
            && self.logsd2.is_finite()
    }
}

/// The three parts of the expected complete-data log-likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogLikelihood {
    /// `sum(z * ln f2 + (1 - z) * ln f1)`
    pub component: f64,
    /// `sum(z * ln pi + (1 - z) * ln(1 - pi))`
    pub concomitant: f64,
    pub full: f64,
}

/// A resolved component family, optionally censored at one bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Family {
    kind: FamilyKind,
    left: f64,
    right: f64,
}

impl Family {
    pub fn new(kind: FamilyKind) -> Self {
        Self {
            kind,
            left: f64::NEG_INFINITY,
            right: f64::INFINITY,
        }
    }

    pub fn gaussian() -> Self {
        Self::new(FamilyKind::Gaussian)
    }

    pub fn logistic() -> Self {
        Self::new(FamilyKind::Logistic)
    }

    /// Returns a copy censored at the given bounds. At most one bound may be finite;
    /// `Control` enforces this before calling.
    pub fn with_bounds(self, left: f64, right: f64) -> Self {
        Self {
            kind: self.kind,
            left,
            right,
        }
    }

    pub fn kind(&self) -> FamilyKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn left(&self) -> f64 {
        self.left
    }

    pub fn right(&self) -> f64 {
        self.right
    }

    pub fn censoring(&self) -> Censoring {
        if self.left.is_finite() {
            Censoring::Left(self.left)
        } else if self.right.is_finite() {
            Censoring::Right(self.right)
        } else {
            Censoring::None
        }
    }

    /// Free parameters per component.
    pub fn params_per_component(&self) -> usize {
        2
    }

    /// The same family expressed on the scale `(y - center) / scale`.
    pub fn standardized(&self, center: f64, scale: f64) -> Self {
        Self {
            kind: self.kind,
            left: (self.left - center) / scale,
            right: (self.right - center) / scale,
        }
    }

    /// Log-density of one observation, honouring censoring.
    pub fn log_density(&self, y: f64, mu: f64, logsd: f64) -> f64 {
        let scale = logsd.exp();
        match self.censoring() {
            Censoring::Left(bound) if y <= bound => {
                self.log_cdf((bound - mu) / scale)
            }
            Censoring::Right(bound) if y >= bound => {
                self.log_survival((bound - mu) / scale)
            }
            _ => {
                let z = (y - mu) / scale;
                match self.kind {
                    FamilyKind::Gaussian => -LN_SQRT_2PI - logsd - 0.5 * z * z,
                    FamilyKind::Logistic => -z.abs() - logsd - 2.0 * (-z.abs()).exp().ln_1p(),
                }
            }
        }
    }

    /// Gradient of `log_density` with respect to `(mu, logsd)`.
    pub fn log_density_gradient(&self, y: f64, mu: f64, logsd: f64) -> (f64, f64) {
        let scale = logsd.exp();
        match self.censoring() {
            Censoring::Left(bound) if y <= bound => {
                let c = (bound - mu) / scale;
                // d/dc ln F(c)
                let slope = match self.kind {
                    FamilyKind::Gaussian => (log_normal_pdf(c) - self.log_cdf(c)).exp(),
                    FamilyKind::Logistic => 1.0 - logistic_cdf(c),
                };
                (-slope / scale, -slope * c)
            }
            Censoring::Right(bound) if y >= bound => {
                let c = (bound - mu) / scale;
                // -d/dc ln (1 - F(c))
                let slope = match self.kind {
                    FamilyKind::Gaussian => (log_normal_pdf(c) - self.log_survival(c)).exp(),
                    FamilyKind::Logistic => logistic_cdf(c),
                };
                (slope / scale, slope * c)
            }
            _ => {
                let z = (y - mu) / scale;
                match self.kind {
                    FamilyKind::Gaussian => (z / scale, z * z - 1.0),
                    FamilyKind::Logistic => {
                        let tilt = 2.0 * logistic_cdf(z) - 1.0;
                        (tilt / scale, z * tilt - 1.0)
                    }
                }
            }
        }
    }

    fn log_cdf(&self, c: f64) -> f64 {
        match self.kind {
            FamilyKind::Gaussian => log_normal_cdf(c),
            FamilyKind::Logistic => -softplus(-c),
        }
    }

    fn log_survival(&self, c: f64) -> f64 {
        match self.kind {
            FamilyKind::Gaussian => log_normal_cdf(-c),
            FamilyKind::Logistic => -softplus(c),
        }
    }

    /// Converts a weighted standard deviation into the family's scale parameter.
    fn scale_from_sd(&self, sd: f64) -> f64 {
        match self.kind {
            FamilyKind::Gaussian => sd,
            FamilyKind::Logistic => sd * 3.0_f64.sqrt() / PI,
        }
    }

    /// Starting parameters from a hard 0/1 split `z`: component means from the split,
    /// a pooled scale from the whole sample.
    pub fn initial_params(
        &self,
        y: ArrayView1<f64>,
        z: ArrayView1<f64>,
    ) -> Result<ComponentParams, FamilyError> {
        let background = z.mapv(|v| 1.0 - v);
        let (mu1, _) = weighted_moments(y, background.view(), 1)?;
        let (mu2, _) = weighted_moments(y, z, 2)?;
        let ones = Array1::ones(y.len());
        let (_, sd) = weighted_moments(y, ones.view(), 1)?;
        let logsd = self.scale_from_sd(sd).max(MIN_SCALE).ln();
        Ok(ComponentParams {
            mu1,
            logsd1: logsd,
            mu2,
            logsd2: logsd,
        })
    }

    /// M-step for the component parameters given the posterior `post`.
    ///
    /// Uncensored families use weighted moments. Censored families start from
    /// `previous` and minimise the weighted negative log-likelihood of each component.
    pub fn update_params(
        &self,
        y: ArrayView1<f64>,
        post: ArrayView1<f64>,
        previous: &ComponentParams,
    ) -> Result<ComponentParams, FamilyError> {
        let background = post.mapv(|v| 1.0 - v);
        match self.censoring() {
            Censoring::None => {
                let (mu1, sd1) = weighted_moments(y, background.view(), 1)?;
                let (mu2, sd2) = weighted_moments(y, post, 2)?;
                Ok(ComponentParams {
                    mu1,
                    logsd1: self.scale_from_sd(sd1).max(MIN_SCALE).ln(),
                    mu2,
                    logsd2: self.scale_from_sd(sd2).max(MIN_SCALE).ln(),
                })
            }
            Censoring::Left(_) | Censoring::Right(_) => {
                let (mu1, logsd1) =
                    self.censored_update(y, background, (previous.mu1, previous.logsd1), 1)?;
                let (mu2, logsd2) =
                    self.censored_update(y, post.to_owned(), (previous.mu2, previous.logsd2), 2)?;
                Ok(ComponentParams {
                    mu1,
                    logsd1,
                    mu2,
                    logsd2,
                })
            }
        }
    }

    fn censored_update(
        &self,
        y: ArrayView1<f64>,
        weights: Array1<f64>,
        start: (f64, f64),
        component: usize,
    ) -> Result<(f64, f64), FamilyError> {
        let total = weights.sum();
        if !(total > f64::EPSILON) {
            return Err(FamilyError::CollapsedComponent { component });
        }

        let family = *self;
        let y = y.to_owned();
        let cost_and_grad = move |params: &Array1<f64>| -> (f64, Array1<f64>) {
            let (mu, logsd) = (params[0], params[1].max(MIN_SCALE.ln()));
            let mut cost = 0.0;
            let mut grad = Array1::zeros(2);
            for (&yi, &wi) in y.iter().zip(weights.iter()) {
                if wi == 0.0 {
                    continue;
                }
                cost -= wi * family.log_density(yi, mu, logsd);
                let (d_mu, d_logsd) = family.log_density_gradient(yi, mu, logsd);
                grad[0] -= wi * d_mu;
                grad[1] -= wi * d_logsd;
            }
            cost /= total;
            grad /= total;
            if !cost.is_finite() || !grad.iter().all(|g| g.is_finite()) {
                log::warn!("Non-finite censored likelihood at mu={mu:.4}, logsd={logsd:.4}");
                return (1e10, Array1::zeros(2));
            }
            (cost, grad)
        };

        match Bfgs::new(Array1::from(vec![start.0, start.1]), cost_and_grad)
            .with_tolerance(CENSORED_TOLERANCE)
            .with_max_iterations(CENSORED_MAX_ITERATIONS)
            .run()
        {
            Ok(BfgsSolution { final_point, .. }) => {
                Ok((final_point[0], final_point[1].max(MIN_SCALE.ln())))
            }
            // a stalled line search keeps the previous estimate
            Err(e) if start.0.is_finite() && start.1.is_finite() => {
                log::debug!(
                    "Censored M-step for component {component} stopped early ({e:?}); keeping previous estimate."
                );
                Ok(start)
            }
            Err(e) => Err(FamilyError::OptimizationFailed {
                family: self.name(),
                message: format!("BFGS failed: {e:?}"),
            }),
        }
    }

    /// E-step: posterior probability of the foehn component for every observation.
    pub fn posterior(
        &self,
        y: ArrayView1<f64>,
        prob: ArrayView1<f64>,
        params: &ComponentParams,
    ) -> Array1<f64> {
        let family = *self;
        let params = *params;
        let mut post = Array1::zeros(y.len());
        Zip::from(&mut post)
            .and(y)
            .and(prob)
            .par_for_each(|z, &yi, &pi| *z = family.posterior_at(yi, pi, &params));
        post
    }

    /// Posterior of the foehn component for a single observation with mixing
    /// probability `pi`, computed on the log-odds scale.
    pub fn posterior_at(&self, y: f64, pi: f64, params: &ComponentParams) -> f64 {
        let pi = pi.clamp(PROB_EPS, 1.0 - PROB_EPS);
        let ld1 = self.log_density(y, params.mu1, params.logsd1);
        let ld2 = self.log_density(y, params.mu2, params.logsd2);
        logistic_cdf(pi.ln() + ld2 - (1.0 - pi).ln() - ld1)
    }

    /// Expected complete-data log-likelihood for the posterior `post` and mixing
    /// probabilities `prob`.
    pub fn loglik(
        &self,
        y: ArrayView1<f64>,
        post: ArrayView1<f64>,
        prob: ArrayView1<f64>,
        params: &ComponentParams,
    ) -> LogLikelihood {
        let family = *self;
        let params = *params;
        let mut component = Array1::zeros(y.len());
        let mut concomitant = Array1::zeros(y.len());
        Zip::from(&mut component)
            .and(&mut concomitant)
            .and(y)
            .and(post)
            .and(prob)
            .par_for_each(|comp, conc, &yi, &zi, &pi| {
                let pi = pi.clamp(PROB_EPS, 1.0 - PROB_EPS);
                *comp = zi * family.log_density(yi, params.mu2, params.logsd2)
                    + (1.0 - zi) * family.log_density(yi, params.mu1, params.logsd1);
                *conc = zi * pi.ln() + (1.0 - zi) * (1.0 - pi).ln();
            });
        let component = component.sum();
        let concomitant = concomitant.sum();
        LogLikelihood {
            component,
            concomitant,
            full: component + concomitant,
        }
    }
}

/// Weighted mean and (biased) weighted standard deviation.
fn weighted_moments(
    y: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    component: usize,
) -> Result<(f64, f64), FamilyError> {
    let total = weights.sum();
    if !(total > f64::EPSILON) {
        return Err(FamilyError::CollapsedComponent { component });
    }
    let mean = y.dot(&weights) / total;
    let variance = Zip::from(y)
        .and(weights)
        .fold(0.0, |acc, &yi, &wi| acc + wi * (yi - mean).powi(2))
        / total;
    Ok((mean, variance.sqrt()))
}

pub fn logistic_cdf(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `ln(1 + e^x)` without overflow.
fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn log_normal_pdf(x: f64) -> f64 {
    -LN_SQRT_2PI - 0.5 * x * x
}

fn log_normal_cdf(x: f64) -> f64 {
    (0.5 * erfc(-x / SQRT_2)).max(f64::MIN_POSITIVE).ln()
}
