//! # Time Series Tables
//!
//! The in-memory table every fit starts from: a time index in seconds and a set of
//! named `f64` columns where missing values are `NaN`. Tables are read from
//! tab-separated files with polars and are never mutated by a fit; the preparation
//! step derives its own working copy.

use ndarray::{Array2, ArrayView1, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("The time column '{0}' was not found in the input file. Please check spelling and case.")]
    TimeColumnNotFound(String),

    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },

    #[error("Missing values were found in the time column '{0}'.")]
    MissingTimestamps(String),

    #[error("Column '{name}' has {found} values but the time index has {expected}.")]
    LengthMismatch {
        name: String,
        found: usize,
        expected: usize,
    },

    #[error("Column '{0}' appears more than once.")]
    DuplicateColumn(String),

    #[error("Predictor variable not found in data (looked for '{0}').")]
    PredictorNotFound(String),

    #[error("Concomitant \"{0}\" not found in data")]
    ConcomitantNotFound(String),

    #[error("Filter variable \"{0}\" not found in data")]
    FilterColumnNotFound(String),

    #[error("Invalid filter '{0}'. Expected <column>=<lower>:<upper>.")]
    InvalidFilter(String),

    #[error("No data left after applying required filters.")]
    NoDataAfterFiltering,

    #[error("Columns with constant values in the data! ({})", .0.join(", "))]
    ConstantColumns(Vec<String>),

    #[error("DataFrame index is not monotonic increasing!")]
    IndexNotMonotonic,

    #[error(
        "foehnix tries to inflate the time series from {original} to {inflated} rows (ratio {ratio:.2}, step {step} s). Set force_inflate to proceed anyway."
    )]
    InflationTooLarge {
        original: usize,
        inflated: usize,
        ratio: f64,
        step: i64,
    },
}

/// A time-indexed table of numeric columns.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    index: Vec<i64>,
    names: Vec<String>,
    /// Shape: `[n_rows, n_columns]`.
    values: Array2<f64>,
}

impl TimeSeries {
    /// Builds a table from a time index (seconds) and named columns.
    pub fn new(index: Vec<i64>, columns: Vec<(String, Vec<f64>)>) -> Result<Self, DataError> {
        let n = index.len();
        let mut seen = HashSet::with_capacity(columns.len());
        let mut names = Vec::with_capacity(columns.len());
        let mut values = Array2::from_elem((n, columns.len()), f64::NAN);
        for (j, (name, column)) in columns.into_iter().enumerate() {
            if !seen.insert(name.clone()) {
                return Err(DataError::DuplicateColumn(name));
            }
            if column.len() != n {
                return Err(DataError::LengthMismatch {
                    name,
                    found: column.len(),
                    expected: n,
                });
            }
            values
                .column_mut(j)
                .iter_mut()
                .zip(column)
                .for_each(|(dst, v)| *dst = v);
            names.push(name);
        }
        Ok(Self {
            index,
            names,
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[i64] {
        &self.index
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.position(name).map(|j| self.values.column(j))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Strictly increasing, no duplicate timestamps.
    pub fn is_monotonic_increasing(&self) -> bool {
        self.index.windows(2).all(|w| w[0] < w[1])
    }

    /// A copy ordered by time. Rows with equal timestamps keep their relative order.
    pub fn sorted_by_index(&self) -> Self {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by_key(|&i| self.index[i]);
        Self {
            index: order.iter().map(|&i| self.index[i]).collect(),
            names: self.names.clone(),
            values: self.values.select(Axis(0), &order),
        }
    }

    /// Reads a tab-separated file with a header. `time_column` must hold integer
    /// (or integral float) seconds; every other column is read as `f64`, with empty
    /// cells and non-numeric entries mapped to `NaN`.
    pub fn load_tsv(path: impl AsRef<Path>, time_column: &str) -> Result<Self, DataError> {
        let path = path.as_ref();
        log::info!("Loading data from '{}'", path.display());

        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        let column_names: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        if !column_names.iter().any(|c| c == time_column) {
            return Err(DataError::TimeColumnNotFound(time_column.to_string()));
        }

        let index = internal::extract_time_column(&df, time_column)?;
        let mut columns = Vec::with_capacity(column_names.len().saturating_sub(1));
        for name in column_names.iter().filter(|c| c.as_str() != time_column) {
            columns.push((name.clone(), internal::extract_float_column(&df, name)?));
        }

        log::info!(
            "Loaded {} rows with {} value columns.",
            index.len(),
            columns.len()
        );
        Self::new(index, columns)
    }
}

/// Keeps rows whose `column` lies within `[lower, upper]`. If `lower > upper` the
/// range wraps around, which is how wind-direction sectors crossing north are
/// written (`dd=270:90`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub lower: f64,
    pub upper: f64,
}

impl RowFilter {
    pub fn new(column: impl Into<String>, lower: f64, upper: f64) -> Self {
        Self {
            column: column.into(),
            lower,
            upper,
        }
    }

    /// Missing values never pass.
    pub fn accepts(&self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        if self.lower <= self.upper {
            value >= self.lower && value <= self.upper
        } else {
            value >= self.lower || value <= self.upper
        }
    }
}

impl FromStr for RowFilter {
    type Err = DataError;

    /// Parses `dd=180:360`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DataError::InvalidFilter(s.to_string());
        let (column, range) = s.split_once('=').ok_or_else(invalid)?;
        let (lower, upper) = range.split_once(':').ok_or_else(invalid)?;
        let lower: f64 = lower.trim().parse().map_err(|_| invalid())?;
        let upper: f64 = upper.trim().parse().map_err(|_| invalid())?;
        let column = column.trim();
        if column.is_empty() || !lower.is_finite() || !upper.is_finite() {
            return Err(invalid());
        }
        Ok(RowFilter::new(column, lower, upper))
    }
}

mod internal {
    use super::*;

    pub(super) fn extract_float_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        let casted =
            series
                .cast(&DataType::Float64)
                .map_err(|_| DataError::ColumnWrongType {
                    column_name: column_name.to_string(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("{:?}", series.dtype()),
                })?;
        let chunked = casted.f64()?;
        Ok(chunked
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect())
    }

    pub(super) fn extract_time_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<i64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingTimestamps(column_name.to_string()));
        }
        let values = extract_float_column(df, column_name)?;
        values
            .into_iter()
            .map(|v| {
                if v.is_finite() && v.fract() == 0.0 {
                    Ok(v as i64)
                } else {
                    Err(DataError::ColumnWrongType {
                        column_name: column_name.to_string(),
                        expected_type: "integer seconds",
                        found_type: format!("{:?}", series.dtype()),
                    })
                }
            })
            .collect()
    }
}
