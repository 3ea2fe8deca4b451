//! Birch–Murnaghan Equation of State
//!
//! Third-order Birch–Murnaghan (BM3) energy and pressure curves, plus a
//! least-squares fit of BM3 parameters to energy/volume points.
//!
//! Units: volumes in Å³, energies in eV, bulk modulus in eV/Å³.
//!
//! ```text
//! E(V) = E0 + 9 V0 B0 / 16 · { (η−1)³ B0' + (η−1)² (6 − 4η) },   η = (V0/V)^(2/3)
//! ```
//!
//! The fit uses the fact that BM3 energy is a cubic polynomial in
//! `x = V^(-2/3)`. Exact BM3 data is therefore recovered to rounding error.

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 1 eV/Å³ in GPa.
pub const EV_PER_A3_TO_GPA: f64 = 160.21766208;

/// Minimum number of points for a BM3 fit.
pub const MIN_FIT_POINTS: usize = 4;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EosError {
    #[error("Got {volumes} volumes but {energies} energies")]
    LengthMismatch { volumes: usize, energies: usize },
    #[error("Need at least {required} points for a Birch-Murnaghan fit, got {found}")]
    TooFewPoints { found: usize, required: usize },
    #[error("Volume must be positive and finite (got {0})")]
    InvalidVolume(f64),
    #[error("Energy must be finite (got {0})")]
    InvalidEnergy(f64),
    #[error("All volumes are identical")]
    DegenerateVolumes,
    #[error("Least-squares system is singular")]
    SingularSystem,
    #[error("Fitted curve has no energy minimum within the sampled volumes")]
    NoMinimum,
    #[error("Cannot sample {points} points between {vmin} and {vmax} Å³")]
    InvalidRange { vmin: f64, vmax: f64, points: usize },
}

/// Third-order Birch–Murnaghan parameters.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BirchMurnaghan {
    /// Equilibrium volume (Å³)
    pub v0: f64,
    /// Equilibrium energy (eV)
    pub e0: f64,
    /// Bulk modulus (eV/Å³)
    pub b0: f64,
    /// Pressure derivative of the bulk modulus
    pub b1: f64,
}

impl BirchMurnaghan {
    pub fn new(v0: f64, e0: f64, b0: f64, b1: f64) -> Self {
        Self { v0, e0, b0, b1 }
    }

    /// Energy at volume `v`.
    ///
    /// Not defined for `v <= 0`; the result is then NaN or infinite.
    ///
    /// ```
    /// use lego_pipelines::analysis::BirchMurnaghan;
    ///
    /// let eos = BirchMurnaghan::new(40.0, -10.8, 0.6, 4.5);
    /// assert!((eos.energy(40.0) + 10.8).abs() < 1e-12);
    /// assert!(eos.energy(38.0) > eos.e0);
    /// ```
    pub fn energy(&self, v: f64) -> f64 {
        let eta = (self.v0 / v).powf(2.0 / 3.0);
        let d = eta - 1.0;
        self.e0
            + 9.0 * self.v0 * self.b0 / 16.0 * (d.powi(3) * self.b1 + d.powi(2) * (6.0 - 4.0 * eta))
    }

    pub fn energies(&self, volumes: &[f64]) -> Vec<f64> {
        volumes.iter().map(|&v| self.energy(v)).collect()
    }

    /// Pressure `-dE/dV` at volume `v` (eV/Å³).
    pub fn pressure(&self, v: f64) -> f64 {
        let r = self.v0 / v;
        let eta = r.powf(2.0 / 3.0);
        1.5 * self.b0
            * (r.powf(7.0 / 3.0) - r.powf(5.0 / 3.0))
            * (1.0 + 0.75 * (self.b1 - 4.0) * (eta - 1.0))
    }

    pub fn pressure_gpa(&self, v: f64) -> f64 {
        self.pressure(v) * EV_PER_A3_TO_GPA
    }

    pub fn bulk_modulus_gpa(&self) -> f64 {
        self.b0 * EV_PER_A3_TO_GPA
    }

    /// Root-mean-square deviation of the curve from the given points.
    pub fn rms_residual(&self, volumes: &[f64], energies: &[f64]) -> f64 {
        let n = volumes.len().min(energies.len());
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = volumes
            .iter()
            .zip(energies)
            .map(|(&v, &e)| (self.energy(v) - e).powi(2))
            .sum();
        (sum / n as f64).sqrt()
    }

    /// Fits BM3 parameters to energy/volume points.
    pub fn fit(volumes: &[f64], energies: &[f64]) -> Result<Self, EosError> {
        if volumes.len() != energies.len() {
            return Err(EosError::LengthMismatch {
                volumes: volumes.len(),
                energies: energies.len(),
            });
        }
        if volumes.len() < MIN_FIT_POINTS {
            return Err(EosError::TooFewPoints {
                found: volumes.len(),
                required: MIN_FIT_POINTS,
            });
        }
        if let Some(&v) = volumes.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
            return Err(EosError::InvalidVolume(v));
        }
        if let Some(&e) = energies.iter().find(|e| !e.is_finite()) {
            return Err(EosError::InvalidEnergy(e));
        }

        let xs: Vec<f64> = volumes.iter().map(|v| v.powf(-2.0 / 3.0)).collect();
        let x_mean = xs.iter().sum::<f64>() / xs.len() as f64;
        let x_scale = xs
            .iter()
            .map(|x| (x - x_mean).abs())
            .fold(0.0_f64, f64::max);
        if x_scale <= f64::EPSILON * x_mean.abs() {
            return Err(EosError::DegenerateVolumes);
        }

        let e_mean = energies.iter().sum::<f64>() / energies.len() as f64;
        let ts: Vec<f64> = xs.iter().map(|x| (x - x_mean) / x_scale).collect();
        let ys: Vec<f64> = energies.iter().map(|e| e - e_mean).collect();
        let c = fit_cubic(&ts, &ys)?;
        debug!("BM3 cubic coefficients (scaled): {:?}", c);

        // The minimum must lie within the sampled volumes.
        let t0 = cubic_minimum(&c)
            .filter(|t| t.abs() <= 1.0 + 1e-9)
            .ok_or(EosError::NoMinimum)?;
        let e_tt = 2.0 * c[2] + 6.0 * c[3] * t0;
        let e_ttt = 6.0 * c[3];

        let x0 = x_mean + x_scale * t0;
        if x0 <= 0.0 {
            return Err(EosError::NoMinimum);
        }
        let e_xx = e_tt / x_scale.powi(2);
        let e_xxx = e_ttt / x_scale.powi(3);

        let v0 = x0.powf(-1.5);
        let e0 = e_mean + c[0] + c[1] * t0 + c[2] * t0 * t0 + c[3] * t0.powi(3);
        let b0 = 4.0 / 9.0 * e_xx * v0.powf(-7.0 / 3.0);
        let b1 = 4.0 + 2.0 / 3.0 * x0 * e_xxx / e_xx;

        Ok(Self { v0, e0, b0, b1 })
    }
}

/// Least-squares cubic `c0 + c1 t + c2 t² + c3 t³` via the normal equations.
fn fit_cubic(ts: &[f64], ys: &[f64]) -> Result<[f64; 4], EosError> {
    let mut a = [[0.0_f64; 5]; 4];
    for (&t, &y) in ts.iter().zip(ys) {
        let powers = [1.0, t, t * t, t * t * t];
        for i in 0..4 {
            for j in 0..4 {
                a[i][j] += powers[i] * powers[j];
            }
            a[i][4] += powers[i] * y;
        }
    }

    // Gaussian elimination with partial pivoting
    for col in 0..4 {
        let pivot = (col..4)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(EosError::SingularSystem);
        }
        a.swap(col, pivot);
        for row in col + 1..4 {
            let factor = a[row][col] / a[col][col];
            for k in col..5 {
                a[row][k] -= factor * a[col][k];
            }
        }
    }

    let mut c = [0.0_f64; 4];
    for row in (0..4).rev() {
        let tail: f64 = (row + 1..4).map(|k| a[row][k] * c[k]).sum();
        c[row] = (a[row][4] - tail) / a[row][row];
    }
    Ok(c)
}

/// Stationary point of the cubic with positive curvature.
fn cubic_minimum(c: &[f64; 4]) -> Option<f64> {
    let (a, b, k) = (3.0 * c[3], 2.0 * c[2], c[1]);

    if a.abs() < 1e-14 * (b.abs() + k.abs()).max(1.0) {
        return (b > 0.0).then(|| -k / b);
    }

    let disc = b * b - 4.0 * a * k;
    if disc < 0.0 {
        return None;
    }
    let sqrt = disc.sqrt();
    [(-b + sqrt) / (2.0 * a), (-b - sqrt) / (2.0 * a)]
        .into_iter()
        .find(|&t| 2.0 * c[2] + 6.0 * c[3] * t > 0.0)
}
