//! Pipeline Files
//!
//! Loads and saves pipeline definitions in YAML. A pipeline file names its
//! input structure(s) by path, carries the run settings inline, and lists
//! the stages in execution order.
//!
//! ```yaml
//! name: si_relax_dos
//! structure: ../structures/si.vasp
//! code: vasp-6.4@cluster
//! potential_family: PBE.54
//! kpoints_spacing: 0.03
//! stages:
//!   - name: relax
//!     type: vasp
//!     incar: { ISIF: 3, NSW: 60 }
//! ```
//!
//! Structure paths are resolved relative to the pipeline file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::model::{Pipeline, RunSettings, INPUT_STRUCTURE};
use super::stage::Stage;
use super::validator::validate_pipeline;
use crate::error::{LegoError, Result};
use crate::structure::{PoscarFile, Structure, StructureFile};

/// How the stages of a file are submitted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    /// One structure flows through the stages in order
    #[default]
    Sequential,
    /// The single DOS stage is run once per labelled structure
    DosBatch,
}

/// On-disk form of a pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineDocument {
    pub name: String,

    #[serde(default)]
    pub workflow: WorkflowMode,

    /// Main input structure, referenced by stages as `input`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<PathBuf>,

    /// Extra named inputs (sequential) or the labelled batch (dos_batch)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub structures: BTreeMap<String, PathBuf>,

    #[serde(flatten)]
    pub settings: RunSettings,

    pub stages: Vec<Stage>,
}

impl PipelineDocument {
    /// Wraps an in-memory pipeline for saving alongside its structure path.
    pub fn from_pipeline(pipeline: &Pipeline, structure: impl Into<PathBuf>) -> Self {
        Self {
            name: pipeline.name.clone(),
            workflow: WorkflowMode::Sequential,
            structure: Some(structure.into()),
            structures: BTreeMap::new(),
            settings: pipeline.settings.clone(),
            stages: pipeline.stages.clone(),
        }
    }

    /// Builds the in-memory pipeline, declaring extra inputs for sequential files.
    pub fn to_pipeline(&self) -> Pipeline {
        let mut pipeline = Pipeline::from_stages(self.name.clone(), self.stages.clone())
            .with_settings(self.settings.clone());
        if self.workflow == WorkflowMode::Sequential {
            for label in self.structures.keys() {
                pipeline = pipeline.with_input(label.clone());
            }
        }
        pipeline
    }
}

/// A parsed pipeline file with its structures read from disk.
#[derive(Debug, Clone)]
pub struct LoadedPipeline {
    pub pipeline: Pipeline,
    pub mode: WorkflowMode,
    /// Structures keyed by input name (`input`, extra inputs or batch labels)
    pub structures: BTreeMap<String, Structure>,
    /// File the pipeline was read from
    pub source: PathBuf,
}

impl LoadedPipeline {
    /// The main input structure, if the file declared one.
    pub fn input_structure(&self) -> Option<&Structure> {
        self.structures.get(INPUT_STRUCTURE)
    }
}

/// Reads a POSCAR file, attaching the path to any error.
pub fn read_structure(path: &Path) -> Result<Structure> {
    PoscarFile::read_from_path(path).map_err(|source| LegoError::Structure {
        path: path.to_path_buf(),
        source,
    })
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Parses pipeline YAML without touching structure files.
pub fn parse_document(yaml: &str) -> Result<PipelineDocument> {
    let document: PipelineDocument = serde_yaml::from_str(yaml)?;
    debug!(
        "Parsed pipeline '{}' ({} stages, mode {:?})",
        document.name,
        document.stages.len(),
        document.workflow
    );
    Ok(document)
}

/// Loads a pipeline from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Reads every referenced structure, relative to the file
/// 3. Validates the pipeline structure
///
/// # Example
///
/// ```rust,no_run
/// use lego_pipelines::pipeline::load_pipeline;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let loaded = load_pipeline("demos/01_basics/si_relax_scf_dos.yaml")?;
///     println!("Loaded {} stages", loaded.pipeline.len());
///     Ok(())
/// }
/// ```
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<LoadedPipeline> {
    let path = path.as_ref();
    info!("Loading pipeline from: {}", path.display());

    let yaml = fs::read_to_string(path).map_err(|e| LegoError::io(path, e))?;
    let document = parse_document(&yaml)?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));

    let mut structures = BTreeMap::new();
    if let Some(main) = &document.structure {
        structures.insert(
            INPUT_STRUCTURE.to_string(),
            read_structure(&resolve(base, main))?,
        );
    }
    for (label, file) in &document.structures {
        structures.insert(label.clone(), read_structure(&resolve(base, file))?);
    }

    let pipeline = document.to_pipeline();
    validate_pipeline(&pipeline)?;

    info!(
        "Loaded pipeline '{}': {} stages, {} structures",
        pipeline.name,
        pipeline.len(),
        structures.len()
    );

    Ok(LoadedPipeline {
        pipeline,
        mode: document.workflow,
        structures,
        source: path.to_path_buf(),
    })
}

/// Saves a pipeline document to a YAML file.
pub fn save_pipeline(document: &PipelineDocument, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let yaml = serde_yaml::to_string(document)?;
    fs::write(path, yaml).map_err(|e| LegoError::io(path, e))?;
    info!("Pipeline saved to: {}", path.display());
    Ok(())
}
