//! Equation-of-state analysis.
//!
//! # Structure
//!
//! - [`eos`]: Birch–Murnaghan energy, pressure and fitting
//! - [`chart`]: Curve sampling, ASCII charts and CSV exchange

pub mod chart;
pub mod eos;

pub use chart::{render_two_panel, EosCurve, EosPoint};
pub use eos::{BirchMurnaghan, EosError};
