//! Structured record of the messages a fit emits.
//!
//! Every event is kept in order and returned with the fitted model, so callers and
//! tests can inspect what happened without a global logger. Events are also
//! forwarded to the `log` facade according to the configured verbosity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::control::ControlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// How much of the diagnostic stream reaches the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Progress, warnings and critical messages.
    Verbose,
    /// Warnings and critical messages only.
    Quiet,
    /// Nothing is logged. Events are still recorded.
    Silent,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Verbose
    }
}

impl From<bool> for Verbosity {
    fn from(verbose: bool) -> Self {
        if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Quiet
        }
    }
}

impl FromStr for Verbosity {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Verbosity::Verbose),
            "false" => Ok(Verbosity::Quiet),
            "silent" => Ok(Verbosity::Silent),
            _ => Err(ControlError::InvalidVerbose(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "[{tag}] {}", self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    verbosity: Verbosity,
    events: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            events: Vec::new(),
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(Severity::Info, message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(Severity::Warning, message.into());
    }

    pub fn critical(&mut self, message: impl Into<String>) {
        self.push(Severity::Critical, message.into());
    }

    fn push(&mut self, severity: Severity, message: String) {
        match (self.verbosity, severity) {
            (Verbosity::Silent, _) => {}
            (Verbosity::Verbose, Severity::Info) => log::info!("{message}"),
            (_, Severity::Info) => log::debug!("{message}"),
            (_, Severity::Warning) => log::warn!("{message}"),
            (_, Severity::Critical) => log::error!("{message}"),
        }
        self.events.push(Diagnostic { severity, message });
    }

    pub fn events(&self) -> &[Diagnostic] {
        &self.events
    }

    pub fn last(&self) -> Option<&Diagnostic> {
        self.events.last()
    }

    /// True if any recorded message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.events.iter().any(|e| e.message.contains(needle))
    }

    /// Events at or above the given severity.
    pub fn at_least(&self, severity: Severity) -> impl Iterator<Item = &Diagnostic> {
        self.events.iter().filter(move |e| e.severity >= severity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_recorded_in_order_even_when_silent() {
        let mut diagnostics = Diagnostics::new(Verbosity::Silent);
        diagnostics.info("starting");
        diagnostics.warn("iteration cap reached");
        diagnostics.critical("inflation refused");

        let messages: Vec<_> = diagnostics.events().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["starting", "iteration cap reached", "inflation refused"]);
        assert_eq!(diagnostics.last().map(|e| e.severity), Some(Severity::Critical));
        assert!(diagnostics.contains("cap"));
        assert_eq!(diagnostics.at_least(Severity::Warning).count(), 2);
    }

    #[test]
    fn verbosity_parses_flags_and_silent() {
        assert_eq!("true".parse::<Verbosity>().unwrap(), Verbosity::Verbose);
        assert_eq!("False".parse::<Verbosity>().unwrap(), Verbosity::Quiet);
        assert_eq!("silent".parse::<Verbosity>().unwrap(), Verbosity::Silent);
        let err = "aus".parse::<Verbosity>().unwrap_err();
        assert!(err.to_string().contains("verbose must be one of true, false or"));
    }

    #[test]
    fn display_tags_severity() {
        let event = Diagnostic {
            severity: Severity::Warning,
            message: "EM did not converge".to_string(),
        };
        assert_eq!(event.to_string(), "[WARNING] EM did not converge");
    }
}
