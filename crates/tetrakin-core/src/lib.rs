//! # TETRAKIN Core
//!
//! Shared types and utilities for deterministic reaction-diffusion
//! simulation on tetrahedral meshes.
//!
//! ## Conventions
//!
//! | Quantity | Unit |
//! |----------|------|
//! | Time | s |
//! | Volume | m^3 |
//! | Area | m^2 |
//! | Length | m |
//! | Concentration | mol/L |
//! | Amounts in the state vector | molecule counts |
//! | Diffusion constant | m^2/s |
//!
//! All quantities are SI except concentration and reaction constants,
//! which follow the litres basis: a first-order volume rate constant is
//! expressed in s^-1, a second-order one in L mol^-1 s^-1, and so on.
//!
//! ## Design Philosophy
//!
//! 1. One error taxonomy shared by every crate in the workspace
//! 2. Molecule counts in the state vector, concentrations at the API
//! 3. No allocation on the derivative evaluation path

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Argument out of range: {0}")]
    ArgumentOutOfRange(String),

    #[error("Not defined here: {0}")]
    NotDefined(String),

    #[error("Name conflict: {0}")]
    NameConflict(String),

    #[error("Unresolved system: {0}")]
    UnresolvedSystem(String),

    #[error("Invalid stoichiometry: {0}")]
    InvalidStoichiometry(String),

    #[error("Invalid reaction: {0}")]
    InvalidReaction(String),

    #[error("Unsupported order {order} in '{reaction}' (maximum is 4)")]
    UnsupportedOrder { reaction: String, order: u32 },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid tolerance: {0}")]
    InvalidTolerance(String),

    #[error("Time regression: requested t = {requested} but t_now = {now}")]
    TimeRegression { now: f64, requested: f64 },

    #[error("Integration failure: {0}")]
    IntegrationFailure(String),

    #[error("Checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;

/// Simulated time (s)
pub type Time = f64;

/// Volume (m^3)
pub type Volume = f64;

/// Area (m^2)
pub type Area = f64;

/// Length (m)
pub type Length = f64;

/// Diffusion constant (m^2/s)
pub type Dcst = f64;

/// Reaction rate constant (litres-basis mass action units)
pub type Kcst = f64;

/// Concentration (mol/L)
pub type Conc = f64;

/// State vector for ODE systems (molecule counts)
pub type StateVector = Array1<f64>;

/// Avogadro's constant (1/mol)
pub const AVOGADRO: f64 = 6.022_140_76e23;

/// Maximum supported reaction order
pub const MAX_ORDER: u32 = 4;

/// Default absolute tolerance
pub const DEFAULT_ATOL: f64 = 1e-3;

/// Default relative tolerance
pub const DEFAULT_RTOL: f64 = 1e-3;

/// Default integrator step budget per run
pub const DEFAULT_MAX_STEPS: u32 = 10_000;

/// Molecule count in a volume to molar concentration.
///
/// 1 mol/L corresponds to 1000 * N_A molecules per m^3.
pub fn count_to_conc(count: f64, vol: Volume) -> Conc {
    count / (1.0e3 * vol * AVOGADRO)
}

/// Molar concentration in a volume to molecule count.
pub fn conc_to_count(conc: Conc, vol: Volume) -> f64 {
    conc * 1.0e3 * vol * AVOGADRO
}

/// ODE right-hand side: dy/dt = f(t, y).
///
/// The derivative is written into a caller-provided buffer so the hot
/// loop never allocates.
pub trait OdeRhs {
    /// System dimension
    fn dim(&self) -> usize;

    /// Evaluate derivatives into `dydt` (length `dim()`)
    fn eval(&self, t: Time, y: &[f64], dydt: &mut [f64]);
}

/// Time series data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
    /// Units
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
            units: None,
        }
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Last recorded value, if any
    pub fn last(&self) -> Option<(Time, f64)> {
        match (self.time.last(), self.values.last()) {
            (Some(&t), Some(&v)) => Some((t, v)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_conc_roundtrip() {
        let vol = 1.0e-18; // 1 um^3
        let count = 602.0;
        let conc = count_to_conc(count, vol);
        let back = conc_to_count(conc, vol);
        assert!((back - count).abs() < 1e-9);
    }

    #[test]
    fn test_one_molar_is_avogadro_per_litre() {
        // 1 mol/L in 1 L (1e-3 m^3) is N_A molecules
        let count = conc_to_count(1.0, 1.0e-3);
        assert!((count - AVOGADRO).abs() / AVOGADRO < 1e-12);
    }

    #[test]
    fn test_time_series() {
        let mut ts = TimeSeries::new("X");
        ts.push(0.0, 1000.0);
        ts.push(0.1, 990.0);
        assert_eq!(ts.len(), 2);
        assert_eq!(ts.last(), Some((0.1, 990.0)));
    }

    #[test]
    fn test_error_display() {
        let e = SimError::TimeRegression { now: 1.0, requested: 0.5 };
        assert!(e.to_string().contains("t_now = 1"));
    }
}
