//! # Data Preparation
//!
//! Turns a caller's `TimeSeries` into the working dataset a fit owns:
//!
//! - validates that the predictor, concomitant and filter columns exist,
//! - requires a strictly increasing time index,
//! - inflates the series onto a regular grid so that gaps become explicit missing
//!   rows (refused above a safety ratio unless forced),
//! - classifies every working row as fitted, filtered out or missing,
//! - rejects constant predictor/concomitant columns,
//! - and records the z-score transform used when standardization is enabled.
//!
//! The caller's table is only read. Everything here is derived into new buffers.

use crate::control::Control;
use crate::data::{DataError, RowFilter, TimeSeries};
use crate::diagnostics::Diagnostics;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// Largest accepted ratio of grid rows to original rows.
pub const INFLATION_SAFETY_RATIO: f64 = 2.0;

/// What to fit: the predictor column, optional concomitants and row filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSpec {
    predictor: String,
    #[serde(default)]
    concomitants: Vec<String>,
    #[serde(default)]
    filters: Vec<RowFilter>,
}

impl FitSpec {
    pub fn new(predictor: impl Into<String>) -> Self {
        Self {
            predictor: predictor.into(),
            concomitants: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn concomitant(mut self, name: impl Into<String>) -> Self {
        self.concomitants.push(name.into());
        self
    }

    pub fn concomitants<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.concomitants.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn predictor(&self) -> &str {
        &self.predictor
    }

    pub fn concomitant_names(&self) -> &[String] {
        &self.concomitants
    }

    pub fn filters(&self) -> &[RowFilter] {
        &self.filters
    }
}

/// A z-score transform `(v - mean) / sd`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    pub mean: f64,
    pub sd: f64,
}

impl Scaling {
    pub fn identity() -> Self {
        Self { mean: 0.0, sd: 1.0 }
    }

    /// Mean and sample standard deviation (denominator `n - 1`).
    pub fn fit(values: ArrayView1<f64>) -> Self {
        Self {
            mean: values.mean().unwrap_or(0.0),
            sd: values.std(1.0),
        }
    }

    pub fn apply(&self, value: f64) -> f64 {
        (value - self.mean) / self.sd
    }
}

/// Scalings of the predictor and of each concomitant column, in column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    pub predictor: Scaling,
    pub concomitants: Vec<Scaling>,
}

/// How a working row takes part in the fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    /// Complete data that passes every filter.
    Fitted,
    /// Complete data removed by a filter.
    Filtered,
    /// A missing predictor or concomitant value, or a row added by inflation.
    Missing,
}

/// The regular grid a series will be inflated onto.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InflationPlan {
    /// Grid spacing in seconds; 0 for series with fewer than two rows.
    pub step: i64,
    pub original_rows: usize,
    pub grid_rows: usize,
    pub ratio: f64,
    pub exceeded: bool,
}

impl InflationPlan {
    /// Rows the grid adds on top of the original ones.
    pub fn inflated(&self) -> usize {
        self.grid_rows.saturating_sub(self.original_rows)
    }
}

/// An inflated index with the original row behind each grid slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Inflation {
    pub index: Vec<i64>,
    pub source_rows: Vec<Option<usize>>,
    /// Original rows that do not fall on the grid.
    pub dropped: usize,
}

/// Plans the grid for a strictly increasing index. The step is the smallest
/// positive gap between consecutive timestamps.
pub fn plan_inflation(index: &[i64], max_ratio: f64) -> InflationPlan {
    let original_rows = index.len();
    let step = index
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|&gap| gap > 0)
        .min()
        .unwrap_or(0);

    let grid_rows = match (index.first(), index.last()) {
        (Some(&first), Some(&last)) if step > 0 => ((last - first) / step) as usize + 1,
        _ => original_rows,
    };
    let ratio = if original_rows == 0 {
        1.0
    } else {
        grid_rows as f64 / original_rows as f64
    };

    InflationPlan {
        step,
        original_rows,
        grid_rows,
        ratio,
        exceeded: ratio > max_ratio,
    }
}

/// Lays the original rows onto the grid described by `plan`.
pub fn inflate(index: &[i64], plan: &InflationPlan) -> Inflation {
    let Some(&first) = index.first() else {
        return Inflation {
            index: Vec::new(),
            source_rows: Vec::new(),
            dropped: 0,
        };
    };
    if plan.step <= 0 {
        return Inflation {
            index: index.to_vec(),
            source_rows: (0..index.len()).map(Some).collect(),
            dropped: 0,
        };
    }

    let grid: Vec<i64> = (0..plan.grid_rows as i64).map(|k| first + k * plan.step).collect();
    let mut source_rows = vec![None; plan.grid_rows];
    let mut dropped = 0;
    for (row, &t) in index.iter().enumerate() {
        let offset = t - first;
        let slot = (offset / plan.step) as usize;
        if offset % plan.step == 0 && slot < source_rows.len() {
            source_rows[slot] = Some(row);
        } else {
            dropped += 1;
        }
    }

    Inflation {
        index: grid,
        source_rows,
        dropped,
    }
}

/// The dataset a fit works on, in original units, on the inflated grid.
#[derive(Debug, Clone)]
pub struct WorkingData {
    index: Vec<i64>,
    source_rows: Vec<Option<usize>>,
    predictor: String,
    y: Array1<f64>,
    concomitant_names: Vec<String>,
    /// Shape: `[n_working, n_concomitants]`.
    concomitants: Array2<f64>,
    status: Vec<RowStatus>,
    original_len: usize,
    step: i64,
    inflated: usize,
    dropped: usize,
    standardization: Option<Standardization>,
}

impl WorkingData {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[i64] {
        &self.index
    }

    /// Original row behind each working row, `None` for rows added by inflation.
    pub fn source_rows(&self) -> &[Option<usize>] {
        &self.source_rows
    }

    pub fn predictor_name(&self) -> &str {
        &self.predictor
    }

    pub fn y(&self) -> ArrayView1<'_, f64> {
        self.y.view()
    }

    pub fn concomitant_names(&self) -> &[String] {
        &self.concomitant_names
    }

    pub fn concomitants(&self) -> &Array2<f64> {
        &self.concomitants
    }

    pub fn status(&self) -> &[RowStatus] {
        &self.status
    }

    pub fn original_len(&self) -> usize {
        self.original_len
    }

    pub fn step(&self) -> i64 {
        self.step
    }

    /// Grid rows minus original rows.
    pub fn inflated(&self) -> usize {
        self.inflated
    }

    /// Original rows that were not on the grid.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn standardization(&self) -> Option<&Standardization> {
        self.standardization.as_ref()
    }

    /// Working row numbers used for fitting, in time order.
    pub fn fitted_rows(&self) -> Vec<usize> {
        self.status
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == RowStatus::Fitted)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn n_fitted(&self) -> usize {
        self.status.iter().filter(|s| **s == RowStatus::Fitted).count()
    }

    /// Predictor values of the fitted rows, standardized if requested.
    pub fn fitted_predictor(&self) -> Array1<f64> {
        let y = self.y.select(Axis(0), &self.fitted_rows());
        match &self.standardization {
            Some(s) => y.mapv(|v| s.predictor.apply(v)),
            None => y,
        }
    }

    /// Design matrix of the fitted rows: an intercept column followed by the
    /// (standardized, if requested) concomitants. `None` without concomitants.
    pub fn fitted_design(&self) -> Option<Array2<f64>> {
        if self.concomitant_names.is_empty() {
            return None;
        }
        let rows = self.fitted_rows();
        let selected = self.concomitants.select(Axis(0), &rows);
        let k = selected.ncols();
        let mut design = Array2::ones((rows.len(), k + 1));
        for j in 0..k {
            let scaling = self
                .standardization
                .as_ref()
                .map(|s| s.concomitants[j])
                .unwrap_or_else(Scaling::identity);
            design
                .column_mut(j + 1)
                .assign(&selected.column(j).mapv(|v| scaling.apply(v)));
        }
        Some(design)
    }
}

/// Validates and derives the working dataset, recording what happened in
/// `diagnostics`.
pub fn prepare(
    data: &TimeSeries,
    spec: &FitSpec,
    control: &Control,
    diagnostics: &mut Diagnostics,
) -> Result<WorkingData, DataError> {
    if !data.has_column(spec.predictor()) {
        return Err(DataError::PredictorNotFound(spec.predictor().to_string()));
    }
    if let Some(missing) = spec.concomitant_names().iter().find(|c| !data.has_column(c)) {
        return Err(DataError::ConcomitantNotFound(missing.clone()));
    }
    if let Some(missing) = spec.filters().iter().find(|f| !data.has_column(&f.column)) {
        return Err(DataError::FilterColumnNotFound(missing.column.clone()));
    }
    if !data.is_monotonic_increasing() {
        return Err(DataError::IndexNotMonotonic);
    }

    let plan = plan_inflation(data.index(), INFLATION_SAFETY_RATIO);
    if plan.exceeded {
        let error = DataError::InflationTooLarge {
            original: plan.original_rows,
            inflated: plan.grid_rows,
            ratio: plan.ratio,
            step: plan.step,
        };
        diagnostics.critical(error.to_string());
        if !control.force_inflate() {
            return Err(error);
        }
        diagnostics.warn("force_inflate is set, continuing with the inflated time series.");
    }
    let inflation = inflate(data.index(), &plan);
    if inflation.dropped > 0 {
        diagnostics.warn(format!(
            "{} observations do not lie on the regular {} s grid and are ignored.",
            inflation.dropped, plan.step
        ));
    }
    if plan.inflated() > 0 {
        diagnostics.info(format!(
            "Time series inflated by {} rows onto a {} s grid.",
            plan.inflated(),
            plan.step
        ));
    }

    let on_grid = |name: &str| -> Array1<f64> {
        let column = data.column(name);
        inflation
            .source_rows
            .iter()
            .map(|src| match (src, &column) {
                (Some(row), Some(values)) => values[*row],
                _ => f64::NAN,
            })
            .collect()
    };

    let y = on_grid(spec.predictor());
    let n = y.len();
    let mut concomitants = Array2::from_elem((n, spec.concomitant_names().len()), f64::NAN);
    for (j, name) in spec.concomitant_names().iter().enumerate() {
        concomitants.column_mut(j).assign(&on_grid(name));
    }
    let filter_columns: Vec<Array1<f64>> =
        spec.filters().iter().map(|f| on_grid(&f.column)).collect();

    let status: Vec<RowStatus> = (0..n)
        .map(|i| {
            let complete = inflation.source_rows[i].is_some()
                && y[i].is_finite()
                && concomitants.row(i).iter().all(|v| v.is_finite());
            if !complete {
                RowStatus::Missing
            } else if spec
                .filters()
                .iter()
                .zip(&filter_columns)
                .all(|(filter, values)| filter.accepts(values[i]))
            {
                RowStatus::Fitted
            } else {
                RowStatus::Filtered
            }
        })
        .collect();

    let fitted: Vec<usize> = status
        .iter()
        .enumerate()
        .filter(|(_, s)| **s == RowStatus::Fitted)
        .map(|(i, _)| i)
        .collect();
    if fitted.is_empty() {
        return Err(DataError::NoDataAfterFiltering);
    }
    log::debug!(
        "{} of {} working rows are used for fitting.",
        fitted.len(),
        n
    );

    let fitted_y = y.select(Axis(0), &fitted);
    let fitted_x = concomitants.select(Axis(0), &fitted);
    let mut constant = Vec::new();
    if is_constant(fitted_y.view()) {
        constant.push(spec.predictor().to_string());
    }
    for (j, name) in spec.concomitant_names().iter().enumerate() {
        if is_constant(fitted_x.column(j)) {
            constant.push(name.clone());
        }
    }
    if !constant.is_empty() {
        return Err(DataError::ConstantColumns(constant));
    }

    match control.maxit_em() {
        0 => diagnostics.warn("Iteration limit for the EM algorithm is turned off!"),
        1 => diagnostics.warn("The EM algorithm stopped after one iteration!"),
        _ => {}
    }
    if control.maxit_iwls() == 0 {
        diagnostics.warn("Iteration limit for the IWLS solver is turned off!");
    }

    let standardization = control.standardize().then(|| Standardization {
        predictor: Scaling::fit(fitted_y.view()),
        concomitants: fitted_x.columns().into_iter().map(Scaling::fit).collect(),
    });

    Ok(WorkingData {
        index: inflation.index,
        source_rows: inflation.source_rows,
        predictor: spec.predictor().to_string(),
        y,
        concomitant_names: spec.concomitant_names().to_vec(),
        concomitants,
        status,
        original_len: data.len(),
        step: plan.step,
        inflated: plan.inflated(),
        dropped: inflation.dropped,
        standardization,
    })
}

fn is_constant(values: ArrayView1<f64>) -> bool {
    let mut iter = values.iter();
    match iter.next() {
        Some(&first) => iter.all(|&v| v == first),
        None => true,
    }
}
