//! # Fitted Models
//!
//! A finished fit is a `FittedModel`: the working dataset, the probability tables,
//! the optimizer record and the diagnostics of the run. Everything needed to
//! classify new observations (control, fit spec and optimizer record with theta in
//! data units) is also available as a `ModelArtifact`, which is saved to and loaded
//! from TOML.

use crate::control::{Control, ControlError};
use crate::data::TimeSeries;
use crate::diagnostics::Diagnostics;
use crate::family::{ComponentParams, Family, logistic_cdf};
use crate::prepare::{FitSpec, RowStatus, WorkingData};
use csv::WriterBuilder;
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const INTERCEPT: &str = "(Intercept)";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Failed to write probability table: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Column '{0}' required by the model is missing from the prediction data.")]
    MissingColumn(String),
    #[error(
        "The model has {found} concomitant coefficients but {expected} concomitants (plus intercept)."
    )]
    CoefficientMismatch { found: usize, expected: usize },
    #[error("Invalid control settings in model file: {0}")]
    InvalidControl(#[from] ControlError),
}

/// One logistic coefficient of the concomitant model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub name: String,
    pub value: f64,
}

/// Estimated parameters in data units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theta {
    pub mu1: f64,
    pub logsd1: f64,
    pub mu2: f64,
    pub logsd2: f64,
    /// Constant mixing probability of a model without concomitants.
    pub mixing_prob: Option<f64>,
    /// Concomitant coefficients, `(Intercept)` first. Empty without concomitants.
    #[serde(default)]
    pub coefficients: Vec<Coefficient>,
}

impl Theta {
    pub fn components(&self) -> ComponentParams {
        ComponentParams {
            mu1: self.mu1,
            logsd1: self.logsd1,
            mu2: self.mu2,
            logsd2: self.logsd2,
        }
    }

    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.coefficients
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value)
    }
}

/// Summary of the optimisation, frozen when the EM loop terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerRecord {
    pub converged: bool,
    pub iter: usize,
    pub loglik: f64,
    pub loglik_component: f64,
    pub loglik_concomitant: f64,
    pub edf: usize,
    pub aic: f64,
    pub bic: f64,
    /// Number of classified observations used for the BIC.
    pub nobs: usize,
    /// Whether the last IWLS solve converged; absent without concomitants.
    pub iwls_converged: Option<bool>,
    pub theta: Theta,
}

/// Foehn probability and flag per timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbTable {
    pub index: Vec<i64>,
    /// `NaN` where the row could not be classified, `0` where it was filtered out.
    pub prob: Vec<f64>,
    /// 1 foehn, 0 background, `None` where missing or filtered out.
    pub flag: Vec<Option<u8>>,
}

impl ProbTable {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Rows with a flag.
    pub fn n_classified(&self) -> usize {
        self.flag.iter().filter(|f| f.is_some()).count()
    }

    /// Share of classified rows flagged as foehn.
    pub fn occurrence(&self) -> f64 {
        let foehn = self.flag.iter().filter(|f| **f == Some(1)).count();
        foehn as f64 / self.n_classified() as f64
    }

    /// Mean probability over the classified rows.
    pub fn mean_prob(&self) -> f64 {
        let (sum, n) = self
            .prob
            .iter()
            .zip(&self.flag)
            .filter(|(_, f)| f.is_some())
            .fold((0.0, 0usize), |(s, n), (p, _)| (s + p, n + 1));
        sum / n as f64
    }

    /// Writes `time`, `prob`, `flag` as tab-separated text. Missing values are
    /// written as empty cells.
    pub fn write_tsv(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let mut writer = WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path.as_ref())?;
        writer.write_record(["time", "prob", "flag"])?;
        for ((t, p), f) in self.index.iter().zip(&self.prob).zip(&self.flag) {
            let prob = if p.is_nan() {
                String::new()
            } else {
                format!("{p:.6}")
            };
            let flag = f.map(|f| f.to_string()).unwrap_or_default();
            writer.write_record([t.to_string(), prob, flag])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// The result of `fit`.
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub(crate) spec: FitSpec,
    pub(crate) control: Control,
    pub(crate) working: WorkingData,
    pub(crate) prob: ProbTable,
    pub(crate) working_prob: ProbTable,
    pub(crate) optimizer: OptimizerRecord,
    pub(crate) diagnostics: Diagnostics,
}

impl FittedModel {
    pub fn spec(&self) -> &FitSpec {
        &self.spec
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn family(&self) -> &Family {
        self.control.family()
    }

    /// The inflated working dataset the model was fitted on.
    pub fn working_data(&self) -> &WorkingData {
        &self.working
    }

    /// Probabilities aligned to the caller's original index.
    pub fn prob(&self) -> &ProbTable {
        &self.prob
    }

    /// Probabilities on the inflated working grid.
    pub fn working_prob(&self) -> &ProbTable {
        &self.working_prob
    }

    pub fn optimizer(&self) -> &OptimizerRecord {
        &self.optimizer
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn inflated(&self) -> usize {
        self.working.inflated()
    }

    /// The serialisable part of the model.
    pub fn artifact(&self) -> ModelArtifact {
        ModelArtifact {
            spec: self.spec.clone(),
            control: self.control.clone(),
            optimizer: self.optimizer.clone(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        self.artifact().save(path)
    }

    /// Classifies the rows of new data with the fitted parameters.
    pub fn predict(&self, data: &TimeSeries) -> Result<ProbTable, ModelError> {
        internal::predict_rows(self.control.family(), &self.spec, &self.optimizer.theta, data)
    }

    /// A human-readable summary of the fit.
    pub fn summary(&self) -> String {
        let opt = &self.optimizer;
        let working = &self.working;
        let total = working.len();
        let missing = working
            .status()
            .iter()
            .filter(|s| **s == RowStatus::Missing)
            .count();
        let filtered = working
            .status()
            .iter()
            .filter(|s| **s == RowStatus::Filtered)
            .count();
        let formula = if self.spec.concomitant_names().is_empty() {
            self.spec.predictor().to_string()
        } else {
            format!(
                "{} ~ {}",
                self.spec.predictor(),
                self.spec.concomitant_names().iter().join(" + ")
            )
        };
        let maxit = match self.control.maxit_em() {
            0 => "inf".to_string(),
            m => m.to_string(),
        };

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Call: foehnix({formula}, family = {}, switch = {})",
            self.family().name(),
            self.control.switch()
        );
        let _ = writeln!(
            out,
            "Number of observations (total) {total} ({} original, {} due to inflation)",
            working.original_len(),
            working.inflated()
        );
        let _ = writeln!(
            out,
            "Removed due to missing values {missing} ({:.1} percent)",
            100.0 * missing as f64 / total as f64
        );
        let _ = writeln!(out, "Outside defined filter {filtered}");
        let _ = writeln!(
            out,
            "Climatological foehn occurrence {:.2} percent (on n = {})",
            100.0 * self.working_prob.occurrence(),
            opt.nobs
        );
        let _ = writeln!(
            out,
            "Mean foehn probability {:.2} percent (on n = {})",
            100.0 * self.working_prob.mean_prob(),
            opt.nobs
        );
        let _ = writeln!(
            out,
            "Log-likelihood: {:.1}, {} effective degrees of freedom",
            opt.loglik, opt.edf
        );
        let _ = writeln!(out, "Corresponding AIC = {:.1}, BIC = {:.1}", opt.aic, opt.bic);
        let _ = writeln!(
            out,
            "Number of EM iterations {}/{maxit} ({})",
            opt.iter,
            if opt.converged { "converged" } else { "not converged" }
        );
        let theta = &opt.theta;
        let _ = writeln!(
            out,
            "Components: mu1 = {:.3}, sd1 = {:.3}, mu2 = {:.3}, sd2 = {:.3}",
            theta.mu1,
            theta.logsd1.exp(),
            theta.mu2,
            theta.logsd2.exp()
        );
        if !theta.coefficients.is_empty() {
            let coefficients = theta
                .coefficients
                .iter()
                .map(|c| format!("{} = {:.4}", c.name, c.value))
                .join(", ");
            let _ = writeln!(out, "Concomitant coefficients: {coefficients}");
        }
        out
    }
}

/// What is saved to disk: enough to classify new data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub spec: FitSpec,
    pub control: Control,
    pub optimizer: OptimizerRecord,
}

impl ModelArtifact {
    /// Saves the artifact to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads an artifact from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let mut artifact: ModelArtifact = toml::from_str(&toml_string)?;
        artifact.control = artifact.control.validated()?;
        Ok(artifact)
    }

    pub fn predict(&self, data: &TimeSeries) -> Result<ProbTable, ModelError> {
        internal::predict_rows(self.control.family(), &self.spec, &self.optimizer.theta, data)
    }
}

mod internal {
    use super::*;

    pub(super) fn predict_rows(
        family: &Family,
        spec: &FitSpec,
        theta: &Theta,
        data: &TimeSeries,
    ) -> Result<ProbTable, ModelError> {
        let column = |name: &str| {
            data.column(name)
                .ok_or_else(|| ModelError::MissingColumn(name.to_string()))
        };
        let y = column(spec.predictor())?;
        let concomitants = spec
            .concomitant_names()
            .iter()
            .map(|name| column(name))
            .collect::<Result<Vec<_>, _>>()?;
        let filters = spec
            .filters()
            .iter()
            .map(|f| column(&f.column).map(|values| (f, values)))
            .collect::<Result<Vec<_>, _>>()?;

        let has_concomitants = !concomitants.is_empty();
        if has_concomitants && theta.coefficients.len() != concomitants.len() + 1 {
            return Err(ModelError::CoefficientMismatch {
                found: theta.coefficients.len(),
                expected: concomitants.len(),
            });
        }
        let constant_pi = theta.mixing_prob.unwrap_or(0.5);
        let params = theta.components();

        let rows: Vec<(f64, Option<u8>)> = (0..data.len())
            .into_par_iter()
            .map(|i| {
                let yi = y[i];
                if !yi.is_finite() || concomitants.iter().any(|c| !c[i].is_finite()) {
                    return (f64::NAN, None);
                }
                if !filters.iter().all(|(f, values)| f.accepts(values[i])) {
                    return (0.0, None);
                }
                let pi = if has_concomitants {
                    let eta = theta.coefficients[0].value
                        + theta.coefficients[1..]
                            .iter()
                            .zip(&concomitants)
                            .map(|(c, x)| c.value * x[i])
                            .sum::<f64>();
                    logistic_cdf(eta)
                } else {
                    constant_pi
                };
                let z = family.posterior_at(yi, pi, &params);
                (z, Some(u8::from(z >= 0.5)))
            })
            .collect();

        let (prob, flag) = rows.into_iter().unzip();
        Ok(ProbTable {
            index: data.index().to_vec(),
            prob,
            flag,
        })
    }
}
