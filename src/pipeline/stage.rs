//! Stage Records
//!
//! A stage is one named unit of work inside a pipeline. The `type` tag
//! selects which engine brick handles it; the remaining keys are the
//! parameters that brick understands.
//!
//! # Example YAML Format
//!
//! ```yaml
//! stages:
//!   - name: relax
//!     type: vasp
//!     incar: { ENCUT: 520, ISIF: 3, IBRION: 2, NSW: 100 }
//!     retrieve: [CONTCAR, OUTCAR]
//!
//!   - name: dos
//!     type: dos
//!     structure_from: relax
//!     scf_incar: { ISMEAR: -5, LCHARG: true }
//!     dos_incar: { NEDOS: 3000, LORBIT: 11 }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use super::model::INPUT_STRUCTURE;

/// A single INCAR-style setting value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum IncarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<f64>),
}

impl fmt::Display for IncarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => write!(f, ".TRUE."),
            Self::Bool(false) => write!(f, ".FALSE."),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => write!(f, "{}", s),
            Self::List(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(" "))
            }
        }
    }
}

impl From<bool> for IncarValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for IncarValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for IncarValue {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for IncarValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for IncarValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for IncarValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<f64>> for IncarValue {
    fn from(value: Vec<f64>) -> Self {
        Self::List(value)
    }
}

/// INCAR-like key/value settings.
///
/// Keys are case-insensitive and stored upper-cased.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(
    from = "BTreeMap<String, IncarValue>",
    into = "BTreeMap<String, IncarValue>"
)]
pub struct Incar(BTreeMap<String, IncarValue>);

impl From<BTreeMap<String, IncarValue>> for Incar {
    fn from(map: BTreeMap<String, IncarValue>) -> Self {
        Self(
            map.into_iter()
                .map(|(k, v)| (k.trim().to_uppercase(), v))
                .collect(),
        )
    }
}

impl From<Incar> for BTreeMap<String, IncarValue> {
    fn from(incar: Incar) -> Self {
        incar.0
    }
}

impl Incar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a key, returning the updated settings.
    ///
    /// ```
    /// use lego_pipelines::pipeline::Incar;
    ///
    /// let incar = Incar::new().with("encut", 520).with("LREAL", "Auto");
    /// assert_eq!(incar.get("ENCUT").unwrap().to_string(), "520");
    /// ```
    pub fn with(mut self, key: &str, value: impl Into<IncarValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<IncarValue>) {
        self.0.insert(key.trim().to_uppercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&IncarValue> {
        self.0.get(&key.trim().to_uppercase())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Returns these settings with `overrides` applied on top.
    pub fn merged(&self, overrides: &Incar) -> Incar {
        let mut merged = self.clone();
        for (key, value) in &overrides.0 {
            merged.0.insert(key.clone(), value.clone());
        }
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &IncarValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Renders the settings as INCAR file text, one `KEY = value` per line.
    pub fn to_incar_string(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{} = {}\n", k, v))
            .collect()
    }
}

/// Quantum ESPRESSO input: namelist -> key -> value.
pub type QeParameters = BTreeMap<String, BTreeMap<String, IncarValue>>;

/// Largest number of points a single sweep may expand to.
pub const MAX_SWEEP_POINTS: usize = 10_000;

/// An inclusive parameter sweep `start, start + step, ..., <= stop`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SweepRange {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl SweepRange {
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// Finite bounds, `step > 0` and `start <= stop`.
    pub fn is_valid(&self) -> bool {
        self.start.is_finite()
            && self.stop.is_finite()
            && self.step.is_finite()
            && self.step > 0.0
            && self.start <= self.stop
    }

    /// Number of sweep points, or `None` when the range is invalid or has
    /// more than [`MAX_SWEEP_POINTS`] points.
    pub fn point_count(&self) -> Option<usize> {
        if !self.is_valid() {
            return None;
        }
        let intervals = ((self.stop - self.start) / self.step + 1e-9).floor();
        if !intervals.is_finite() || intervals >= MAX_SWEEP_POINTS as f64 {
            return None;
        }
        (intervals as usize).checked_add(1)
    }

    /// Sweep values; empty when [`point_count`](Self::point_count) is `None`.
    pub fn values(&self) -> Vec<f64> {
        let Some(count) = self.point_count() else {
            return Vec::new();
        };
        (0..count)
            .map(|i| self.start + i as f64 * self.step)
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct VaspParams {
    #[serde(default)]
    pub incar: Incar,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpoints_spacing: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_from: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retrieve: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct QeParams {
    #[serde(default)]
    pub parameters: QeParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpoints_spacing: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_from: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retrieve: Vec<String>,
}

/// Self-consistent run followed by a non-self-consistent DOS run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DosParams {
    pub structure_from: String,
    #[serde(default)]
    pub scf_incar: Incar,
    #[serde(default)]
    pub dos_incar: Incar,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpoints_spacing: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retrieve: Vec<String>,
}

fn default_threshold() -> f64 {
    1.0
}

/// Plane-wave cutoff and k-point spacing convergence scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConvergenceParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_from: Option<String>,
    #[serde(default)]
    pub incar: Incar,
    /// ENCUT sweep (eV)
    pub cutoff: SweepRange,
    /// k-point spacing sweep (1/Å)
    pub kpoints: SweepRange,
    /// Energy change below which a setting counts as converged
    #[serde(default = "default_threshold")]
    pub threshold_mev_per_atom: f64,
}

/// One member of a batch stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct BatchCalculation {
    /// Overrides applied on top of the batch's base INCAR
    #[serde(default)]
    pub incar: Incar,
    /// Isotropic volume scaling of the source structure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpoints_spacing: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct BatchParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_from: Option<String>,
    #[serde(default)]
    pub base_incar: Incar,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpoints_spacing: Option<f64>,
    #[serde(default)]
    pub calculations: BTreeMap<String, BatchCalculation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retrieve: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NebParams {
    pub images_from: String,
    #[serde(default)]
    pub incar: Incar,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpoints_spacing: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retrieve: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DimerParams {
    pub structure_from: String,
    #[serde(default)]
    pub incar: Incar,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpoints_spacing: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retrieve: Vec<String>,
}

fn default_ldaul() -> u8 {
    2
}

/// Linear-response perturbations of the on-site potential.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HubbardResponseParams {
    pub ground_state_from: String,
    pub target_species: String,
    /// Perturbing potentials (eV)
    pub potential_values: Vec<f64>,
    /// Angular momentum of the perturbed shell (2 = d, 3 = f)
    #[serde(default = "default_ldaul")]
    pub ldaul: u8,
    #[serde(default)]
    pub incar: Incar,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HubbardAnalysisParams {
    pub response_from: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BirchMurnaghanParams {
    pub batch_from: String,
}

fn default_max_index() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SurfaceEnumerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_from: Option<String>,
    #[serde(default = "default_max_index")]
    pub max_index: u32,
    #[serde(default = "default_true")]
    pub symmetric: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationMethod {
    #[default]
    Linear,
    Idpp,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenerateNebImagesParams {
    pub initial_from: String,
    pub final_from: String,
    pub n_images: usize,
    #[serde(default)]
    pub method: InterpolationMethod,
}

/// Stage type tag plus the parameters that type understands.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKind {
    Vasp(VaspParams),
    Qe(QeParams),
    Dos(DosParams),
    Convergence(ConvergenceParams),
    Batch(BatchParams),
    Neb(NebParams),
    Dimer(DimerParams),
    HubbardResponse(HubbardResponseParams),
    HubbardAnalysis(HubbardAnalysisParams),
    BirchMurnaghan(BirchMurnaghanParams),
    SurfaceEnumeration(SurfaceEnumerationParams),
    GenerateNebImages(GenerateNebImagesParams),
}

/// A reference from one stage to another (or to an input structure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRef {
    /// Parameter holding the reference, e.g. `structure_from`
    pub field: &'static str,
    /// Referenced stage or input structure name
    pub target: String,
}

impl StageKind {
    /// The `type` tag as written in pipeline files.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Vasp(_) => "vasp",
            Self::Qe(_) => "qe",
            Self::Dos(_) => "dos",
            Self::Convergence(_) => "convergence",
            Self::Batch(_) => "batch",
            Self::Neb(_) => "neb",
            Self::Dimer(_) => "dimer",
            Self::HubbardResponse(_) => "hubbard_response",
            Self::HubbardAnalysis(_) => "hubbard_analysis",
            Self::BirchMurnaghan(_) => "birch_murnaghan",
            Self::SurfaceEnumeration(_) => "surface_enumeration",
            Self::GenerateNebImages(_) => "generate_neb_images",
        }
    }

    /// Whether the stage leaves behind a single structure other stages can start from.
    pub fn produces_structure(&self) -> bool {
        matches!(self, Self::Vasp(_) | Self::Qe(_) | Self::Dimer(_))
    }

    pub fn is_qe(&self) -> bool {
        matches!(self, Self::Qe(_))
    }

    /// The stage's main INCAR, if it has one.
    pub fn incar(&self) -> Option<&Incar> {
        match self {
            Self::Vasp(p) => Some(&p.incar),
            Self::Dos(p) => Some(&p.scf_incar),
            Self::Convergence(p) => Some(&p.incar),
            Self::Batch(p) => Some(&p.base_incar),
            Self::Neb(p) => Some(&p.incar),
            Self::Dimer(p) => Some(&p.incar),
            Self::HubbardResponse(p) => Some(&p.incar),
            _ => None,
        }
    }

    /// Stage-level k-point spacing override, if any.
    pub fn kpoints_spacing(&self) -> Option<f64> {
        match self {
            Self::Vasp(p) => p.kpoints_spacing,
            Self::Qe(p) => p.kpoints_spacing,
            Self::Dos(p) => p.kpoints_spacing,
            Self::Batch(p) => p.kpoints_spacing,
            Self::Neb(p) => p.kpoints_spacing,
            Self::Dimer(p) => p.kpoints_spacing,
            _ => None,
        }
    }

    /// All stage/input references this stage makes.
    pub fn references(&self) -> Vec<StageRef> {
        fn push(refs: &mut Vec<StageRef>, field: &'static str, target: Option<&String>) {
            if let Some(target) = target {
                refs.push(StageRef {
                    field,
                    target: target.clone(),
                });
            }
        }

        let mut refs = Vec::new();
        match self {
            Self::Vasp(p) => {
                push(&mut refs, "structure_from", p.structure_from.as_ref());
                push(&mut refs, "restart", p.restart.as_ref());
            }
            Self::Qe(p) => {
                push(&mut refs, "structure_from", p.structure_from.as_ref());
                push(&mut refs, "restart", p.restart.as_ref());
            }
            Self::Dos(p) => push(&mut refs, "structure_from", Some(&p.structure_from)),
            Self::Convergence(p) => push(&mut refs, "structure_from", p.structure_from.as_ref()),
            Self::Batch(p) => push(&mut refs, "structure_from", p.structure_from.as_ref()),
            Self::Neb(p) => {
                push(&mut refs, "images_from", Some(&p.images_from));
                push(&mut refs, "restart", p.restart.as_ref());
            }
            Self::Dimer(p) => {
                push(&mut refs, "structure_from", Some(&p.structure_from));
                push(&mut refs, "restart", p.restart.as_ref());
            }
            Self::HubbardResponse(p) => {
                push(&mut refs, "ground_state_from", Some(&p.ground_state_from))
            }
            Self::HubbardAnalysis(p) => push(&mut refs, "response_from", Some(&p.response_from)),
            Self::BirchMurnaghan(p) => push(&mut refs, "batch_from", Some(&p.batch_from)),
            Self::SurfaceEnumeration(p) => {
                push(&mut refs, "structure_from", p.structure_from.as_ref())
            }
            Self::GenerateNebImages(p) => {
                push(&mut refs, "initial_from", Some(&p.initial_from));
                push(&mut refs, "final_from", Some(&p.final_from));
            }
        }
        refs
    }
}

/// A named stage within a pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Stage {
    /// Unique name within the pipeline; other stages refer to it by this
    pub name: String,

    #[serde(flatten)]
    pub kind: StageKind,
}

impl Stage {
    /// Creates a stage from a name and its typed parameters.
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into().trim().to_string(),
            kind,
        }
    }

    /// A plain VASP calculation.
    ///
    /// ```
    /// use lego_pipelines::pipeline::{Incar, Stage};
    ///
    /// let relax = Stage::vasp("relax", Incar::new().with("ISIF", 3))
    ///     .with_kpoints_spacing(0.03)
    ///     .with_retrieve(&["CONTCAR"]);
    /// let scf = Stage::vasp("scf", Incar::new().with("NSW", 0))
    ///     .with_structure_from("relax");
    ///
    /// assert_eq!(scf.references()[0].target, "relax");
    /// assert_eq!(relax.type_name(), "vasp");
    /// ```
    pub fn vasp(name: impl Into<String>, incar: Incar) -> Self {
        Self::new(
            name,
            StageKind::Vasp(VaspParams {
                incar,
                ..Default::default()
            }),
        )
    }

    pub fn qe(name: impl Into<String>, parameters: QeParameters) -> Self {
        Self::new(
            name,
            StageKind::Qe(QeParams {
                parameters,
                ..Default::default()
            }),
        )
    }

    pub fn dos(
        name: impl Into<String>,
        structure_from: impl Into<String>,
        scf_incar: Incar,
        dos_incar: Incar,
    ) -> Self {
        Self::new(
            name,
            StageKind::Dos(DosParams {
                structure_from: structure_from.into(),
                scf_incar,
                dos_incar,
                kpoints_spacing: None,
                retrieve: Vec::new(),
            }),
        )
    }

    pub fn convergence(
        name: impl Into<String>,
        incar: Incar,
        cutoff: SweepRange,
        kpoints: SweepRange,
    ) -> Self {
        Self::new(
            name,
            StageKind::Convergence(ConvergenceParams {
                structure_from: None,
                incar,
                cutoff,
                kpoints,
                threshold_mev_per_atom: default_threshold(),
            }),
        )
    }

    pub fn batch(name: impl Into<String>, base_incar: Incar) -> Self {
        Self::new(
            name,
            StageKind::Batch(BatchParams {
                base_incar,
                ..Default::default()
            }),
        )
    }

    pub fn neb(name: impl Into<String>, images_from: impl Into<String>, incar: Incar) -> Self {
        Self::new(
            name,
            StageKind::Neb(NebParams {
                images_from: images_from.into(),
                incar,
                kpoints_spacing: None,
                restart: None,
                retrieve: Vec::new(),
            }),
        )
    }

    pub fn dimer(name: impl Into<String>, structure_from: impl Into<String>, incar: Incar) -> Self {
        Self::new(
            name,
            StageKind::Dimer(DimerParams {
                structure_from: structure_from.into(),
                incar,
                kpoints_spacing: None,
                restart: None,
                retrieve: Vec::new(),
            }),
        )
    }

    pub fn hubbard_response(
        name: impl Into<String>,
        ground_state_from: impl Into<String>,
        target_species: impl Into<String>,
        potential_values: Vec<f64>,
    ) -> Self {
        Self::new(
            name,
            StageKind::HubbardResponse(HubbardResponseParams {
                ground_state_from: ground_state_from.into(),
                target_species: target_species.into(),
                potential_values,
                ldaul: default_ldaul(),
                incar: Incar::new(),
            }),
        )
    }

    pub fn hubbard_analysis(name: impl Into<String>, response_from: impl Into<String>) -> Self {
        Self::new(
            name,
            StageKind::HubbardAnalysis(HubbardAnalysisParams {
                response_from: response_from.into(),
            }),
        )
    }

    pub fn birch_murnaghan(name: impl Into<String>, batch_from: impl Into<String>) -> Self {
        Self::new(
            name,
            StageKind::BirchMurnaghan(BirchMurnaghanParams {
                batch_from: batch_from.into(),
            }),
        )
    }

    pub fn surface_enumeration(name: impl Into<String>, max_index: u32) -> Self {
        Self::new(
            name,
            StageKind::SurfaceEnumeration(SurfaceEnumerationParams {
                structure_from: None,
                max_index,
                symmetric: true,
            }),
        )
    }

    pub fn generate_neb_images(
        name: impl Into<String>,
        initial_from: impl Into<String>,
        final_from: impl Into<String>,
        n_images: usize,
    ) -> Self {
        Self::new(
            name,
            StageKind::GenerateNebImages(GenerateNebImagesParams {
                initial_from: initial_from.into(),
                final_from: final_from.into(),
                n_images,
                method: InterpolationMethod::default(),
            }),
        )
    }

    /// Restarts from a previous stage's outputs (vasp, qe, neb and dimer stages).
    pub fn with_restart(mut self, stage: impl Into<String>) -> Self {
        let stage = Some(stage.into());
        match &mut self.kind {
            StageKind::Vasp(p) => p.restart = stage,
            StageKind::Qe(p) => p.restart = stage,
            StageKind::Neb(p) => p.restart = stage,
            StageKind::Dimer(p) => p.restart = stage,
            other => debug!("restart ignored for {} stage '{}'", other.type_name(), self.name),
        }
        self
    }

    /// Starts from another stage's output structure (or a named input).
    pub fn with_structure_from(mut self, source: impl Into<String>) -> Self {
        let source = source.into();
        match &mut self.kind {
            StageKind::Vasp(p) => p.structure_from = Some(source),
            StageKind::Qe(p) => p.structure_from = Some(source),
            StageKind::Dos(p) => p.structure_from = source,
            StageKind::Convergence(p) => p.structure_from = Some(source),
            StageKind::Batch(p) => p.structure_from = Some(source),
            StageKind::Dimer(p) => p.structure_from = source,
            StageKind::SurfaceEnumeration(p) => p.structure_from = Some(source),
            other => debug!(
                "structure_from ignored for {} stage '{}'",
                other.type_name(),
                self.name
            ),
        }
        self
    }

    pub fn with_kpoints_spacing(mut self, spacing: f64) -> Self {
        let spacing = Some(spacing);
        match &mut self.kind {
            StageKind::Vasp(p) => p.kpoints_spacing = spacing,
            StageKind::Qe(p) => p.kpoints_spacing = spacing,
            StageKind::Dos(p) => p.kpoints_spacing = spacing,
            StageKind::Batch(p) => p.kpoints_spacing = spacing,
            StageKind::Neb(p) => p.kpoints_spacing = spacing,
            StageKind::Dimer(p) => p.kpoints_spacing = spacing,
            other => debug!(
                "kpoints_spacing ignored for {} stage '{}'",
                other.type_name(),
                self.name
            ),
        }
        self
    }

    /// Files the engine should keep from the calculation's working directory.
    pub fn with_retrieve(mut self, files: &[&str]) -> Self {
        let files: Vec<String> = files.iter().map(|f| f.to_string()).collect();
        match &mut self.kind {
            StageKind::Vasp(p) => p.retrieve = files,
            StageKind::Qe(p) => p.retrieve = files,
            StageKind::Dos(p) => p.retrieve = files,
            StageKind::Batch(p) => p.retrieve = files,
            StageKind::Neb(p) => p.retrieve = files,
            StageKind::Dimer(p) => p.retrieve = files,
            other => debug!("retrieve ignored for {} stage '{}'", other.type_name(), self.name),
        }
        self
    }

    /// Adds a member calculation to a batch stage.
    pub fn with_calculation(mut self, label: impl Into<String>, calc: BatchCalculation) -> Self {
        if let StageKind::Batch(p) = &mut self.kind {
            p.calculations.insert(label.into(), calc);
        } else {
            debug!("calculation ignored for non-batch stage '{}'", self.name);
        }
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn references(&self) -> Vec<StageRef> {
        self.kind.references()
    }

    /// References to other stages, excluding the implicit input structure.
    pub fn stage_dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = self
            .references()
            .into_iter()
            .map(|r| r.target)
            .filter(|t| t != INPUT_STRUCTURE)
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incar_keys_are_uppercased() {
        let incar = Incar::new().with("encut", 520).with(" ismear ", -5);
        assert!(incar.contains("ENCUT"));
        assert!(incar.contains("ismear"));
        assert_eq!(incar.len(), 2);
    }

    #[test]
    fn test_incar_rendering() {
        let incar = Incar::new()
            .with("LORBIT", 11)
            .with("LWAVE", false)
            .with("EDIFF", 1e-6)
            .with("MAGMOM", vec![5.0, -5.0])
            .with("ALGO", "Fast");
        let text = incar.to_incar_string();

        assert!(text.contains("LORBIT = 11\n"));
        assert!(text.contains("LWAVE = .FALSE.\n"));
        assert!(text.contains("MAGMOM = 5 -5\n"));
        assert!(text.contains("ALGO = Fast\n"));
        assert!(text.starts_with("ALGO"));
    }

    #[test]
    fn test_incar_merge_overrides() {
        let base = Incar::new().with("ENCUT", 520).with("ISIF", 2);
        let merged = base.merged(&Incar::new().with("isif", 3));

        assert_eq!(merged.get("ISIF"), Some(&IncarValue::Int(3)));
        assert_eq!(merged.get("ENCUT"), Some(&IncarValue::Int(520)));
    }

    #[test]
    fn test_incar_deserialize_normalizes_keys() {
        let incar: Incar = serde_yaml::from_str("encut: 400\nlreal: Auto\nldau: true").unwrap();
        assert_eq!(incar.get("ENCUT"), Some(&IncarValue::Int(400)));
        assert_eq!(incar.get("LREAL"), Some(&IncarValue::Text("Auto".to_string())));
        assert_eq!(incar.get("LDAU"), Some(&IncarValue::Bool(true)));
    }

    #[test]
    fn test_sweep_values_inclusive() {
        let sweep = SweepRange::new(400.0, 600.0, 50.0);
        assert_eq!(sweep.values(), vec![400.0, 450.0, 500.0, 550.0, 600.0]);
    }

    #[test]
    fn test_sweep_values_malformed() {
        assert!(SweepRange::new(600.0, 400.0, 50.0).values().is_empty());
        assert!(SweepRange::new(400.0, 600.0, 0.0).values().is_empty());
        assert!(!SweepRange::new(400.0, 600.0, f64::NAN).is_valid());
    }

    #[test]
    fn test_sweep_infinite_stop() {
        let sweep = SweepRange::new(0.0, f64::INFINITY, 1.0);
        assert!(!sweep.is_valid());
        assert_eq!(sweep.point_count(), None);
        assert!(sweep.values().is_empty());
    }

    #[test]
    fn test_sweep_huge_span_is_bounded() {
        let sweep = SweepRange::new(0.0, 1e30, 1.0);
        assert!(sweep.is_valid());
        assert_eq!(sweep.point_count(), None);
        assert!(sweep.values().is_empty());

        let edge = SweepRange::new(0.0, (MAX_SWEEP_POINTS - 1) as f64, 1.0);
        assert_eq!(edge.point_count(), Some(MAX_SWEEP_POINTS));
    }

    #[test]
    fn test_sweep_infinite_stop_from_yaml() {
        let sweep: SweepRange = serde_yaml::from_str("{start: 0, stop: .inf, step: 1}").unwrap();
        assert!(!sweep.is_valid());
    }

    #[test]
    fn test_stage_yaml_shape() {
        let yaml = r#"
name: relax
type: vasp
incar:
  ENCUT: 520
  ISIF: 3
kpoints_spacing: 0.03
retrieve: [CONTCAR]
"#;
        let stage: Stage = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(stage.name, "relax");
        match &stage.kind {
            StageKind::Vasp(p) => {
                assert_eq!(p.kpoints_spacing, Some(0.03));
                assert_eq!(p.retrieve, vec!["CONTCAR"]);
                assert!(p.restart.is_none());
            }
            other => panic!("expected vasp stage, got {:?}", other),
        }
    }

    #[test]
    fn test_stage_serializes_flat_with_type_tag() {
        let stage = Stage::hubbard_response("response", "ground_state", "Ni", vec![-0.2, 0.2]);
        let value = serde_json::to_value(&stage).unwrap();

        assert_eq!(value["name"], "response");
        assert_eq!(value["type"], "hubbard_response");
        assert_eq!(value["target_species"], "Ni");
        assert_eq!(value["ldaul"], 2);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<Stage, _> = serde_yaml::from_str("name: x\ntype: phonon\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_required_reference_rejected() {
        let result: Result<Stage, _> = serde_yaml::from_str("name: bm\ntype: birch_murnaghan\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_generate_neb_images_method_default() {
        let yaml = "name: images\ntype: generate_neb_images\ninitial_from: a\nfinal_from: b\nn_images: 5\n";
        let stage: Stage = serde_yaml::from_str(yaml).unwrap();
        match stage.kind {
            StageKind::GenerateNebImages(p) => {
                assert_eq!(p.method, InterpolationMethod::Linear);
                assert_eq!(p.n_images, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_references_collects_all_fields() {
        let neb = Stage::neb("neb", "images", Incar::new()).with_restart("neb_old");
        let refs = neb.references();

        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].field, "images_from");
        assert_eq!(refs[1].target, "neb_old");
    }

    #[test]
    fn test_stage_dependencies_skip_input() {
        let stage = Stage::vasp("relax", Incar::new()).with_structure_from(INPUT_STRUCTURE);
        assert!(stage.stage_dependencies().is_empty());

        let images = Stage::generate_neb_images("images", "ini", "fin", 3);
        assert_eq!(images.stage_dependencies(), vec!["fin", "ini"]);
    }

    #[test]
    fn test_builders_ignore_unsupported_fields() {
        let stage = Stage::hubbard_analysis("analysis", "response")
            .with_restart("x")
            .with_kpoints_spacing(0.02);
        assert_eq!(stage.references().len(), 1);
    }

    #[test]
    fn test_batch_with_calculations() {
        let batch = Stage::batch("volumes", Incar::new().with("ISIF", 2))
            .with_calculation(
                "v_0.96",
                BatchCalculation {
                    volume_scale: Some(0.96),
                    ..Default::default()
                },
            )
            .with_calculation(
                "v_1.04",
                BatchCalculation {
                    volume_scale: Some(1.04),
                    ..Default::default()
                },
            );

        match batch.kind {
            StageKind::Batch(p) => assert_eq!(p.calculations.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_produces_structure() {
        assert!(Stage::vasp("a", Incar::new()).kind.produces_structure());
        assert!(!Stage::batch("b", Incar::new()).kind.produces_structure());
        assert!(!Stage::birch_murnaghan("c", "b").kind.produces_structure());
    }
}
