//! # Fit Configuration
//!
//! `Control` is built once, validated eagerly, and immutable afterwards. The family
//! and the switch direction are mandatory: there is no safe default for which
//! component represents foehn. Everything else has defaults:
//!
//! | option          | default | meaning                                            |
//! |-----------------|---------|----------------------------------------------------|
//! | `maxit`         | 100     | EM and IWLS iteration caps, 0 disables a cap       |
//! | `tol`           | 1e-8    | EM and IWLS absolute log-likelihood tolerances     |
//! | `standardize`   | true    | z-score predictor and concomitants before fitting  |
//! | `left`/`right`  | ∓inf    | censoring bound (at most one may be finite)        |
//! | `force_inflate` | false   | bypass the inflation safety ratio                  |
//! | `verbose`       | true    | true, false or "silent"                            |
//!
//! A `Control` can come from the builder, from string arguments (CLI), or from a
//! TOML file. All three paths share the same validation and error messages.

use crate::diagnostics::Verbosity;
use crate::family::{FAMILY_NAMES, Family, FamilyKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_MAXIT: usize = 100;
pub const DEFAULT_TOL: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Missing required argument '{0}'.")]
    MissingArgument(&'static str),

    #[error("switch is mandatory and either True or False.")]
    InvalidSwitch,

    #[error("family must be a foehnix-family object or one of {known} (got {given}).")]
    UnknownFamily { given: String, known: String },

    #[error("verbose must be one of true, false or \"silent\" (got {0}).")]
    InvalidVerbose(String),

    #[error("maxit must be single integer or list of len 2 (got {0}).")]
    InvalidMaxit(String),

    #[error("tol must be single float or list of length 2 (got {0}).")]
    InvalidTol(String),

    #[error("left must be smaller than right.")]
    InvalidBounds { left: f64, right: f64 },

    #[error(
        "Censoring on both sides (left = {left}, right = {right}) is not implemented. Provide at most one finite bound."
    )]
    TwoSidedBoundsNotImplemented { left: f64, right: f64 },

    #[error("Option '{option}' must be {expected} (got {found}).")]
    InvalidOption {
        option: String,
        expected: &'static str,
        found: String,
    },

    #[error("Unknown control option '{0}'.")]
    UnknownOption(String),

    #[error("Failed to parse TOML control file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to read control file: {0}")]
    IoError(#[from] std::io::Error),
}

/// A family given either by name or as an already constructed value.
#[derive(Debug, Clone, PartialEq)]
pub enum FamilyChoice {
    Name(String),
    Family(Family),
}

impl From<&str> for FamilyChoice {
    fn from(name: &str) -> Self {
        FamilyChoice::Name(name.to_string())
    }
}

impl From<String> for FamilyChoice {
    fn from(name: String) -> Self {
        FamilyChoice::Name(name)
    }
}

impl From<Family> for FamilyChoice {
    fn from(family: Family) -> Self {
        FamilyChoice::Family(family)
    }
}

impl From<FamilyKind> for FamilyChoice {
    fn from(kind: FamilyKind) -> Self {
        FamilyChoice::Family(Family::new(kind))
    }
}

impl FamilyChoice {
    fn resolve(self) -> Result<Family, ControlError> {
        match self {
            FamilyChoice::Family(family) => Ok(family),
            FamilyChoice::Name(name) => {
                FamilyKind::from_name(&name)
                    .map(Family::new)
                    .ok_or_else(|| ControlError::UnknownFamily {
                        given: format!("\"{name}\""),
                        known: FAMILY_NAMES.join(", "),
                    })
            }
        }
    }
}

/// The validated, immutable configuration of a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    family: Family,
    switch: bool,
    verbose: Verbosity,
    maxit_em: usize,
    maxit_iwls: usize,
    tol_em: f64,
    tol_iwls: f64,
    standardize: bool,
    force_inflate: bool,
}

impl Control {
    /// Starts a builder. `family` and `switch` are the only required settings.
    pub fn builder(family: impl Into<FamilyChoice>, switch: bool) -> ControlBuilder {
        ControlBuilder {
            family: family.into(),
            switch,
            verbose: Verbosity::default(),
            maxit: vec![DEFAULT_MAXIT],
            tol: vec![DEFAULT_TOL],
            standardize: true,
            left: None,
            right: None,
            force_inflate: false,
        }
    }

    /// A control with all defaults.
    pub fn new(family: impl Into<FamilyChoice>, switch: bool) -> Result<Self, ControlError> {
        Self::builder(family, switch).build()
    }

    pub fn family(&self) -> &Family {
        &self.family
    }

    pub fn switch(&self) -> bool {
        self.switch
    }

    pub fn verbose(&self) -> Verbosity {
        self.verbose
    }

    pub fn maxit_em(&self) -> usize {
        self.maxit_em
    }

    pub fn maxit_iwls(&self) -> usize {
        self.maxit_iwls
    }

    pub fn tol_em(&self) -> f64 {
        self.tol_em
    }

    pub fn tol_iwls(&self) -> f64 {
        self.tol_iwls
    }

    pub fn standardize(&self) -> bool {
        self.standardize
    }

    pub fn force_inflate(&self) -> bool {
        self.force_inflate
    }

    pub fn left(&self) -> f64 {
        self.family.left()
    }

    pub fn right(&self) -> f64 {
        self.family.right()
    }

    /// Runs a control that bypassed the builder, such as one read back from a
    /// model file, through the same checks as `build`.
    pub fn validated(self) -> Result<Self, ControlError> {
        let (left, right) = (self.family.left(), self.family.right());
        Control::builder(self.family, self.switch)
            .verbose(self.verbose)
            .maxit(&[self.maxit_em, self.maxit_iwls])
            .tol(&[self.tol_em, self.tol_iwls])
            .standardize(self.standardize)
            .force_inflate(self.force_inflate)
            .left(left)
            .right(right)
            .build()
    }

    /// Reads a TOML control file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ControlError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates a TOML control document such as
    ///
    /// ```toml
    /// family = "logistic"
    /// switch = false
    /// maxit = [200, 50]
    /// tol = 1e-7
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ControlError> {
        let table: toml::Table = text.parse()?;
        internal::from_table(&table)
    }
}

/// Builder for `Control`. Validation happens in `build`.
#[derive(Debug, Clone)]
pub struct ControlBuilder {
    family: FamilyChoice,
    switch: bool,
    verbose: Verbosity,
    maxit: Vec<usize>,
    tol: Vec<f64>,
    standardize: bool,
    left: Option<f64>,
    right: Option<f64>,
    force_inflate: bool,
}

impl ControlBuilder {
    pub fn verbose(mut self, verbose: impl Into<Verbosity>) -> Self {
        self.verbose = verbose.into();
        self
    }

    /// One cap for both loops, or `[em, iwls]`.
    pub fn maxit(mut self, maxit: &[usize]) -> Self {
        self.maxit = maxit.to_vec();
        self
    }

    /// One tolerance for both loops, or `[em, iwls]`.
    pub fn tol(mut self, tol: &[f64]) -> Self {
        self.tol = tol.to_vec();
        self
    }

    pub fn standardize(mut self, standardize: bool) -> Self {
        self.standardize = standardize;
        self
    }

    pub fn left(mut self, left: f64) -> Self {
        self.left = Some(left);
        self
    }

    pub fn right(mut self, right: f64) -> Self {
        self.right = Some(right);
        self
    }

    pub fn force_inflate(mut self, force_inflate: bool) -> Self {
        self.force_inflate = force_inflate;
        self
    }

    pub fn build(self) -> Result<Control, ControlError> {
        let family = self.family.resolve()?;

        let (maxit_em, maxit_iwls) = match self.maxit.as_slice() {
            [both] => (*both, *both),
            [em, iwls] => (*em, *iwls),
            other => return Err(ControlError::InvalidMaxit(format!("{other:?}"))),
        };

        let (tol_em, tol_iwls) = match self.tol.as_slice() {
            [both] => (*both, *both),
            [em, iwls] => (*em, *iwls),
            other => return Err(ControlError::InvalidTol(format!("{other:?}"))),
        };
        if ![tol_em, tol_iwls].iter().all(|t| t.is_finite() && *t > 0.0) {
            return Err(ControlError::InvalidTol(format!("{:?}", self.tol)));
        }

        // Bounds set on the builder take precedence over bounds carried by a Family value.
        let left = self.left.unwrap_or(family.left());
        let right = self.right.unwrap_or(family.right());
        if left.is_nan() || right.is_nan() || left >= right {
            return Err(ControlError::InvalidBounds { left, right });
        }
        if left.is_finite() && right.is_finite() {
            return Err(ControlError::TwoSidedBoundsNotImplemented { left, right });
        }

        Ok(Control {
            family: family.with_bounds(left, right),
            switch: self.switch,
            verbose: self.verbose,
            maxit_em,
            maxit_iwls,
            tol_em,
            tol_iwls,
            standardize: self.standardize,
            force_inflate: self.force_inflate,
        })
    }
}

/// Parses `true`/`false` (any case).
pub fn parse_switch(value: &str) -> Result<bool, ControlError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ControlError::InvalidSwitch),
    }
}

/// Parses `"100"` or `"100,50"`.
pub fn parse_maxit(value: &str) -> Result<Vec<usize>, ControlError> {
    let parsed: Result<Vec<usize>, _> = value.split(',').map(|v| v.trim().parse::<usize>()).collect();
    match parsed {
        Ok(list) if matches!(list.len(), 1 | 2) => Ok(list),
        _ => Err(ControlError::InvalidMaxit(format!("\"{value}\""))),
    }
}

/// Parses `"1e-8"` or `"1e-5,1e-6"`; every entry must be finite and positive.
pub fn parse_tol(value: &str) -> Result<Vec<f64>, ControlError> {
    let parsed: Result<Vec<f64>, _> = value.split(',').map(|v| v.trim().parse::<f64>()).collect();
    match parsed {
        Ok(list)
            if matches!(list.len(), 1 | 2) && list.iter().all(|t| t.is_finite() && *t > 0.0) =>
        {
            Ok(list)
        }
        _ => Err(ControlError::InvalidTol(format!("\"{value}\""))),
    }
}

mod internal {
    use super::*;
    use toml::Value;

    const KNOWN_KEYS: [&str; 9] = [
        "family",
        "switch",
        "verbose",
        "maxit",
        "tol",
        "standardize",
        "left",
        "right",
        "force_inflate",
    ];

    pub(super) fn from_table(table: &toml::Table) -> Result<Control, ControlError> {
        if let Some(unknown) = table.keys().find(|k| !KNOWN_KEYS.contains(&k.as_str())) {
            return Err(ControlError::UnknownOption(unknown.clone()));
        }

        let family_value = table.get("family").ok_or(ControlError::MissingArgument("family"))?;
        let switch_value = table.get("switch").ok_or(ControlError::MissingArgument("switch"))?;

        let switch = switch_value.as_bool().ok_or(ControlError::InvalidSwitch)?;
        let family = match family_value {
            Value::String(name) => FamilyChoice::Name(name.clone()),
            other => {
                return Err(ControlError::UnknownFamily {
                    given: other.to_string(),
                    known: FAMILY_NAMES.join(", "),
                });
            }
        };

        let mut builder = Control::builder(family, switch);

        if let Some(value) = table.get("verbose") {
            builder = builder.verbose(match value {
                Value::Boolean(flag) => Verbosity::from(*flag),
                Value::String(text) if text.eq_ignore_ascii_case("silent") => Verbosity::Silent,
                other => return Err(ControlError::InvalidVerbose(other.to_string())),
            });
        }
        if let Some(value) = table.get("maxit") {
            builder = builder.maxit(&maxit_list(value)?);
        }
        if let Some(value) = table.get("tol") {
            builder = builder.tol(&tol_list(value)?);
        }
        if let Some(value) = table.get("standardize") {
            builder = builder.standardize(flag("standardize", value)?);
        }
        if let Some(value) = table.get("force_inflate") {
            builder = builder.force_inflate(flag("force_inflate", value)?);
        }
        if let Some(value) = table.get("left") {
            builder = builder.left(number("left", value)?);
        }
        if let Some(value) = table.get("right") {
            builder = builder.right(number("right", value)?);
        }

        builder.build()
    }

    fn maxit_list(value: &Value) -> Result<Vec<usize>, ControlError> {
        let invalid = || ControlError::InvalidMaxit(value.to_string());
        let entry = |v: &Value| {
            v.as_integer()
                .and_then(|i| usize::try_from(i).ok())
                .ok_or_else(invalid)
        };
        match value {
            Value::Integer(_) => Ok(vec![entry(value)?]),
            Value::Array(items) if items.len() == 2 => items.iter().map(entry).collect(),
            _ => Err(invalid()),
        }
    }

    fn tol_list(value: &Value) -> Result<Vec<f64>, ControlError> {
        let invalid = || ControlError::InvalidTol(value.to_string());
        let entry = |v: &Value| match v {
            Value::Float(f) => Ok(*f),
            Value::Integer(i) => Ok(*i as f64),
            _ => Err(invalid()),
        };
        let list = match value {
            Value::Array(items) if items.len() == 2 => {
                items.iter().map(entry).collect::<Result<Vec<_>, _>>()?
            }
            Value::Float(_) | Value::Integer(_) => vec![entry(value)?],
            _ => return Err(invalid()),
        };
        if list.iter().all(|t| t.is_finite() && *t > 0.0) {
            Ok(list)
        } else {
            Err(invalid())
        }
    }

    fn flag(option: &str, value: &Value) -> Result<bool, ControlError> {
        value.as_bool().ok_or_else(|| ControlError::InvalidOption {
            option: option.to_string(),
            expected: "a boolean",
            found: value.to_string(),
        })
    }

    fn number(option: &str, value: &Value) -> Result<f64, ControlError> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Integer(i) => Ok(*i as f64),
            other => Err(ControlError::InvalidOption {
                option: option.to_string(),
                expected: "a number",
                found: other.to_string(),
            }),
        }
    }
}
