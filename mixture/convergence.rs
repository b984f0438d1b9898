//! The iteration driver shared by the EM and IWLS loops.
//!
//! A loop is a tolerance, an iteration cap (0 disables it) and a step function that
//! advances caller-owned state and returns the new objective. The driver stops
//! when the absolute objective change drops below the tolerance or the cap is hit.
//! Errors from the step abort the loop immediately.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceStatus {
    /// The objective change fell below the tolerance.
    Converged,
    /// The iteration cap was reached first.
    MaxIterationsReached,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IterationControl {
    /// 0 means uncapped.
    pub max_iterations: usize,
    pub tolerance: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoopOutcome {
    pub status: ConvergenceStatus,
    pub iterations: usize,
    pub objective: f64,
    pub last_change: f64,
}

impl LoopOutcome {
    pub fn converged(&self) -> bool {
        self.status == ConvergenceStatus::Converged
    }
}

impl IterationControl {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
        }
    }

    pub fn is_capped(&self) -> bool {
        self.max_iterations != 0
    }

    /// Runs `step(iteration)` (1-based) until convergence or the cap.
    pub fn run<E, F>(&self, initial_objective: f64, mut step: F) -> Result<LoopOutcome, E>
    where
        F: FnMut(usize) -> Result<f64, E>,
    {
        let mut previous = initial_objective;
        let mut iteration = 0;
        loop {
            iteration += 1;
            let objective = step(iteration)?;
            let change = (objective - previous).abs();
            previous = objective;

            if change < self.tolerance {
                return Ok(LoopOutcome {
                    status: ConvergenceStatus::Converged,
                    iterations: iteration,
                    objective,
                    last_change: change,
                });
            }
            if self.is_capped() && iteration >= self.max_iterations {
                return Ok(LoopOutcome {
                    status: ConvergenceStatus::MaxIterationsReached,
                    iterations: iteration,
                    objective,
                    last_change: change,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometric_sequence_converges() {
        let control = IterationControl::new(100, 1e-6);
        let mut value = 1.0;
        let outcome = control
            .run::<(), _>(0.0, |_| {
                value *= 0.5;
                Ok(value)
            })
            .unwrap();
        assert!(outcome.converged());
        assert!(outcome.last_change < 1e-6);
        // the change at step n is 0.5^n, first below 1e-6 at n = 20
        assert_eq!(outcome.iterations, 20);
    }

    #[test]
    fn cap_stops_a_slow_loop() {
        let control = IterationControl::new(5, 1e-12);
        let outcome = control.run::<(), _>(0.0, |i| Ok(i as f64)).unwrap();
        assert_eq!(outcome.status, ConvergenceStatus::MaxIterationsReached);
        assert_eq!(outcome.iterations, 5);
        assert_eq!(outcome.objective, 5.0);
    }

    #[test]
    fn zero_cap_runs_until_converged() {
        let control = IterationControl::new(0, 1e-3);
        let outcome = control
            .run::<(), _>(0.0, |i| Ok(if i < 500 { i as f64 } else { 499.0 }))
            .unwrap();
        assert!(outcome.converged());
        assert_eq!(outcome.iterations, 500);
    }

    #[test]
    fn step_errors_abort() {
        let control = IterationControl::new(10, 1e-8);
        let err = control
            .run(0.0, |i| if i == 3 { Err("diverged") } else { Ok(i as f64) })
            .unwrap_err();
        assert_eq!(err, "diverged");
    }
}
