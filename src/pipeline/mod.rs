//! Pipeline Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating multi-stage calculation pipelines.
//!
//! # Structure
//!
//! - [`stage`]: Stage records and INCAR settings
//! - [`model`]: Core data structures (Pipeline, RunSettings)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Validation rules and dependency waves
//! - [`presets`]: Canonical stage lists

pub mod model;
pub mod parser;
pub mod presets;
pub mod stage;
pub mod validator;

pub use model::{CodeFamily, Pipeline, Resources, RunSettings, INPUT_STRUCTURE};
pub use parser::{load_pipeline, save_pipeline, LoadedPipeline, PipelineDocument, WorkflowMode};
pub use presets::PresetKind;
pub use stage::{BatchCalculation, Incar, IncarValue, Stage, StageKind, SweepRange};
pub use validator::{dependency_waves, validate_pipeline, ValidationError};
