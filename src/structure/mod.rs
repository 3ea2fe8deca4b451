//! Crystal Structures
//!
//! The periodic structure handed to every pipeline, plus readers and
//! writers for the plain-text lattice formats it is stored in.
//!
//! # Structure
//!
//! - [`Structure`]: lattice, species and fractional positions
//! - [`poscar`]: VASP POSCAR reader/writer

pub mod poscar;

use serde::{Deserialize, Serialize};

pub use poscar::{PoscarError, PoscarFile, StructureFile};

/// A periodic crystal structure.
///
/// Lattice vectors are stored as rows, in Ångström. Positions are
/// fractional coordinates, one per atom, aligned with `species`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Structure {
    /// Free-form title line
    pub comment: String,

    /// Lattice vectors a, b, c as rows (Å)
    pub lattice: [[f64; 3]; 3],

    /// Element symbol of each atom
    pub species: Vec<String>,

    /// Fractional coordinates of each atom
    pub positions: Vec<[f64; 3]>,

    /// Per-atom selective dynamics flags (true = free to move)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selective: Option<Vec<[bool; 3]>>,
}

impl Structure {
    /// Creates a structure from a lattice and per-atom species/positions.
    pub fn new(
        comment: impl Into<String>,
        lattice: [[f64; 3]; 3],
        species: Vec<String>,
        positions: Vec<[f64; 3]>,
    ) -> Self {
        Self {
            comment: comment.into(),
            lattice,
            species,
            positions,
            selective: None,
        }
    }

    /// Number of atoms in the cell.
    pub fn num_atoms(&self) -> usize {
        self.positions.len()
    }

    /// Cell volume in Å³.
    pub fn volume(&self) -> f64 {
        determinant(&self.lattice).abs()
    }

    /// Distinct elements in order of first appearance.
    pub fn elements(&self) -> Vec<String> {
        let mut elements: Vec<String> = Vec::new();
        for symbol in &self.species {
            if !elements.contains(symbol) {
                elements.push(symbol.clone());
            }
        }
        elements
    }

    /// Atom count per element, in order of first appearance.
    pub fn element_counts(&self) -> Vec<(String, usize)> {
        self.elements()
            .into_iter()
            .map(|element| {
                let count = self.species.iter().filter(|s| **s == element).count();
                (element, count)
            })
            .collect()
    }

    /// Chemical formula such as `Ni4O4` or `Si2`; unit counts are omitted.
    pub fn formula(&self) -> String {
        self.element_counts()
            .into_iter()
            .map(|(element, count)| {
                if count == 1 {
                    element
                } else {
                    format!("{}{}", element, count)
                }
            })
            .collect()
    }

    /// Returns a copy whose volume is multiplied by `factor`.
    ///
    /// The lattice is scaled isotropically, so fractional positions are unchanged.
    pub fn scaled_to_volume_factor(&self, factor: f64) -> Structure {
        let linear = factor.cbrt();
        let mut scaled = self.clone();
        for row in scaled.lattice.iter_mut() {
            for component in row.iter_mut() {
                *component *= linear;
            }
        }
        scaled
    }

    /// Cartesian coordinates (Å) of every atom.
    pub fn cartesian_positions(&self) -> Vec<[f64; 3]> {
        self.positions
            .iter()
            .map(|frac| fractional_to_cartesian(&self.lattice, frac))
            .collect()
    }
}

pub(crate) fn determinant(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Inverse of a 3x3 matrix, or `None` when it is singular.
pub(crate) fn inverse(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = determinant(m);
    if det.abs() < 1e-12 {
        return None;
    }

    let inv_det = 1.0 / det;
    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ])
}

/// Row vector times matrix: `v · m`.
pub(crate) fn row_times(v: &[f64; 3], m: &[[f64; 3]; 3]) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (j, slot) in out.iter_mut().enumerate() {
        *slot = v[0] * m[0][j] + v[1] * m[1][j] + v[2] * m[2][j];
    }
    out
}

fn fractional_to_cartesian(lattice: &[[f64; 3]; 3], frac: &[f64; 3]) -> [f64; 3] {
    row_times(frac, lattice)
}
