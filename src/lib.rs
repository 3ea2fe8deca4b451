//! Lego Pipelines - Multi-Stage DFT Pipeline Client
//!
//! Builds, validates and submits stage pipelines (relaxations, DOS runs,
//! convergence scans, NEB, dimer, Hubbard U, equation of state, surface
//! enumeration) to an external workflow engine. The engine runs the
//! calculations; this crate describes them and keeps track of what was
//! sent.
//!
//! # Architecture
//!
//! - [`pipeline`]: Stage and pipeline model, YAML files, presets and validation
//! - [`structure`]: Crystal structures and POSCAR I/O
//! - [`submission`]: `quick_*` entry points, backends and the tracking log
//! - [`analysis`]: Birch–Murnaghan equation of state and EOS charts
//! - [`catalog`]: Example catalog scanner and table
//! - [`profile`]: Engine profile configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use lego_pipelines::pipeline::presets;
//! use lego_pipelines::profile::Profile;
//! use lego_pipelines::submission::{quick_vasp_sequential, single_input, DryRunBackend};
//! use lego_pipelines::structure::{PoscarFile, StructureFile};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let profile = Profile::load()?;
//!     let structure = PoscarFile::read_from_path("Si.vasp")?;
//!
//!     let mut backend = DryRunBackend::new();
//!     let result = quick_vasp_sequential(
//!         &mut backend,
//!         &profile,
//!         &presets::relax_scf_dos(),
//!         &single_input(structure),
//!     )?;
//!     println!("{}", result);
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod catalog;
pub mod error;
pub mod pipeline;
pub mod profile;
pub mod structure;
pub mod submission;

// Re-export commonly used types
pub use error::{LegoError, Result};
pub use pipeline::{load_pipeline, Pipeline, Stage, StageKind};
pub use profile::Profile;
pub use structure::Structure;
pub use submission::{SubmissionResult, WorkflowBackend};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "lego";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "lego");
    }

    #[test]
    fn test_module_exports_pipeline() {
        let pipeline = Pipeline::new("empty");
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_module_exports_stage() {
        let stage = Stage::birch_murnaghan("fit", "volumes");
        assert_eq!(stage.name, "fit");
        assert_eq!(stage.type_name(), "birch_murnaghan");
    }
}
