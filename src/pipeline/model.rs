//! Pipeline Data Model
//!
//! A pipeline is an ordered list of stages plus the run settings the
//! engine needs to turn them into jobs (code label, k-point spacing,
//! potentials, scheduler resources, concurrency limit).

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::stage::Stage;
use crate::profile::Profile;

/// Name under which the pipeline's main input structure is referenced.
pub const INPUT_STRUCTURE: &str = "input";

/// DFT code family a pipeline targets.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodeFamily {
    Vasp,
    Qe,
}

impl fmt::Display for CodeFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vasp => write!(f, "VASP"),
            Self::Qe => write!(f, "Quantum ESPRESSO"),
        }
    }
}

fn default_machines() -> usize {
    1
}

fn default_walltime() -> u64 {
    3600
}

/// Scheduler resources requested for every job of a pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resources {
    #[serde(default = "default_machines")]
    pub num_machines: usize,
    #[serde(default = "default_machines")]
    pub num_mpiprocs_per_machine: usize,
    #[serde(default = "default_walltime")]
    pub max_wallclock_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            num_machines: default_machines(),
            num_mpiprocs_per_machine: default_machines(),
            max_wallclock_seconds: default_walltime(),
            queue: None,
            account: None,
        }
    }
}

/// Engine-facing settings shared by all stages of a pipeline.
///
/// Unset values are filled from the [`Profile`] before submission.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RunSettings {
    /// Code label known to the engine, e.g. `vasp-6.4@cluster`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Default k-point spacing (1/Å) for stages without their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpoints_spacing: Option<f64>,

    /// VASP potential family
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub potential_family: Option<String>,

    /// Element -> potential variant, e.g. `Ni: Ni_pv`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub potential_mapping: BTreeMap<String, String>,

    /// Quantum ESPRESSO pseudopotential family
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pseudo_family: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Resources>,

    /// Upper bound on jobs the engine may run at once for batch-like stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<usize>,
}

impl RunSettings {
    /// Fills every unset value from the profile; explicit values win.
    pub fn resolved(&self, profile: &Profile, family: CodeFamily) -> RunSettings {
        let mut resolved = self.clone();

        if resolved.code.is_none() {
            resolved.code = profile.code_for(family).map(String::from);
        }
        if resolved.kpoints_spacing.is_none() {
            resolved.kpoints_spacing = profile.kpoints_spacing;
        }
        match family {
            CodeFamily::Vasp => {
                if resolved.potential_family.is_none() {
                    resolved.potential_family = profile.potential_family.clone();
                }
                for (element, potential) in &profile.potential_mapping {
                    resolved
                        .potential_mapping
                        .entry(element.clone())
                        .or_insert_with(|| potential.clone());
                }
            }
            CodeFamily::Qe => {
                if resolved.pseudo_family.is_none() {
                    resolved.pseudo_family = profile.pseudo_family.clone();
                }
            }
        }
        if resolved.options.is_none() {
            resolved.options = Some(profile.options.clone());
        }
        if resolved.max_concurrent_jobs.is_none() {
            resolved.max_concurrent_jobs = Some(profile.concurrency_limit());
        }

        resolved
    }
}

/// An ordered, named list of stages with shared run settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Pipeline {
    /// Pipeline name, shown in tracking logs and engine labels
    pub name: String,

    /// Stages in execution order
    pub stages: Vec<Stage>,

    #[serde(default)]
    pub settings: RunSettings,

    /// Named input structures stages may reference (always includes `input`)
    #[serde(default = "default_inputs")]
    pub inputs: Vec<String>,
}

fn default_inputs() -> Vec<String> {
    vec![INPUT_STRUCTURE.to_string()]
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            stages: Vec::new(),
            settings: RunSettings::default(),
            inputs: default_inputs(),
        }
    }

    /// Creates a pipeline from a list of stages.
    pub fn from_stages(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        let mut pipeline = Self::new(name);
        pipeline.stages = stages;
        pipeline
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Declares an additional named input structure (e.g. a NEB end point).
    pub fn with_input(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.inputs.contains(&name) {
            self.inputs.push(name);
        }
        self
    }

    /// Appends a stage, rejecting duplicate names.
    pub fn add_stage(&mut self, stage: Stage) -> Result<(), String> {
        if self.stages.iter().any(|s| s.name == stage.name) {
            return Err(format!("Stage '{}' already exists", stage.name));
        }
        self.stages.push(stage);
        Ok(())
    }

    /// Removes a stage by name.
    pub fn remove_stage(&mut self, name: &str) -> Result<Stage, String> {
        let index = self
            .stages
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| format!("Stage '{}' not found", name))?;
        Ok(self.stages.remove(index))
    }

    pub fn get_stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Position of a stage in execution order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    /// Distinct stage types used, sorted.
    pub fn stage_types(&self) -> Vec<&'static str> {
        let set: HashSet<&'static str> = self.stages.iter().map(|s| s.type_name()).collect();
        let mut types: Vec<_> = set.into_iter().collect();
        types.sort();
        types
    }

    /// Qe when every stage is a Quantum ESPRESSO stage, otherwise Vasp.
    pub fn code_family(&self) -> CodeFamily {
        if !self.stages.is_empty() && self.stages.iter().all(|s| s.kind.is_qe()) {
            CodeFamily::Qe
        } else {
            CodeFamily::Vasp
        }
    }

    pub fn is_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|i| i == name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
