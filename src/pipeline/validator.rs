//! Pipeline Validation
//!
//! Checks a pipeline before it is handed to the engine:
//! - Stage name rules and uniqueness
//! - Reference integrity (targets exist, come earlier, have the right type)
//! - Type-specific parameter checks
//! - Code family consistency
//! - Dependency waves for display

use std::collections::{HashMap, HashSet};

use log::{debug, info};

use super::model::{CodeFamily, Pipeline, RunSettings, INPUT_STRUCTURE};
use super::stage::{Stage, StageKind, StageRef, SweepRange, MAX_SWEEP_POINTS};
use crate::error::{LegoError, Result};
use crate::structure::Structure;

/// Minimum number of volumes for a third-order Birch–Murnaghan fit.
pub const MIN_EOS_POINTS: usize = 4;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyPipeline,
    EmptyPipelineName,
    EmptyStageName,
    InvalidStageName(String),
    ReservedStageName(String),
    DuplicateStageName(String),
    UnknownReference {
        stage: String,
        field: &'static str,
        reference: String,
    },
    ForwardReference {
        stage: String,
        field: &'static str,
        reference: String,
    },
    SelfReference {
        stage: String,
        field: &'static str,
    },
    WrongReferenceType {
        stage: String,
        field: &'static str,
        reference: String,
        expected: &'static str,
        found: &'static str,
    },
    InvalidKpointsSpacing {
        stage: String,
        value: f64,
    },
    InvalidSweep {
        stage: String,
        field: &'static str,
    },
    SweepTooLarge {
        stage: String,
        field: &'static str,
    },
    EmptyBatch(String),
    InvalidVolumeScale {
        stage: String,
        label: String,
        value: f64,
    },
    InsufficientEosPoints {
        stage: String,
        batch: String,
        found: usize,
    },
    EmptyPerturbations(String),
    ZeroPerturbation(String),
    InvalidAngularMomentum {
        stage: String,
        value: u8,
    },
    UnknownSpecies {
        stage: String,
        species: String,
    },
    InvalidImageCount(String),
    InvalidMillerIndex(String),
    IncompatibleStage {
        stage: String,
        stage_type: &'static str,
        family: CodeFamily,
    },
    MissingSetting(&'static str),
    InvalidConcurrency,
    MissingStructure(String),
    NoStructures(String),
    NotDosTemplate {
        stage: String,
        found: &'static str,
    },
    DosBatchStageCount(usize),
    CyclicDependency,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPipeline => write!(f, "Pipeline has no stages"),
            Self::EmptyPipelineName => write!(f, "Pipeline has an empty name"),
            Self::EmptyStageName => write!(f, "Stage has empty or whitespace-only name"),
            Self::InvalidStageName(name) => write!(
                f,
                "Stage name '{}' must start with a letter or '_' and contain only letters, digits and '_'",
                name
            ),
            Self::ReservedStageName(name) => {
                write!(f, "Stage name '{}' is reserved for an input structure", name)
            }
            Self::DuplicateStageName(name) => write!(f, "Duplicate stage name: '{}'", name),
            Self::UnknownReference {
                stage,
                field,
                reference,
            } => write!(
                f,
                "Stage '{}': {} references unknown stage '{}'",
                stage, field, reference
            ),
            Self::ForwardReference {
                stage,
                field,
                reference,
            } => write!(
                f,
                "Stage '{}': {} references '{}', which runs later",
                stage, field, reference
            ),
            Self::SelfReference { stage, field } => {
                write!(f, "Stage '{}': {} references itself", stage, field)
            }
            Self::WrongReferenceType {
                stage,
                field,
                reference,
                expected,
                found,
            } => write!(
                f,
                "Stage '{}': {} must reference {}, but '{}' is a {} stage",
                stage, field, expected, reference, found
            ),
            Self::InvalidKpointsSpacing { stage, value } => write!(
                f,
                "Stage '{}': k-point spacing must be positive (got {})",
                stage, value
            ),
            Self::InvalidSweep { stage, field } => write!(
                f,
                "Stage '{}': {} sweep needs finite bounds, step > 0 and start <= stop",
                stage, field
            ),
            Self::SweepTooLarge { stage, field } => write!(
                f,
                "Stage '{}': {} sweep has more than {} points",
                stage, field, MAX_SWEEP_POINTS
            ),
            Self::EmptyBatch(stage) => write!(f, "Batch stage '{}' has no calculations", stage),
            Self::InvalidVolumeScale {
                stage,
                label,
                value,
            } => write!(
                f,
                "Stage '{}': calculation '{}' has non-positive volume_scale {}",
                stage, label, value
            ),
            Self::InsufficientEosPoints {
                stage,
                batch,
                found,
            } => write!(
                f,
                "Stage '{}': batch '{}' has {} volume points, at least {} are needed",
                stage, batch, found, MIN_EOS_POINTS
            ),
            Self::EmptyPerturbations(stage) => {
                write!(f, "Stage '{}': potential_values is empty", stage)
            }
            Self::ZeroPerturbation(stage) => write!(
                f,
                "Stage '{}': potential_values must not contain 0",
                stage
            ),
            Self::InvalidAngularMomentum { stage, value } => write!(
                f,
                "Stage '{}': ldaul must be 1 (p), 2 (d) or 3 (f), got {}",
                stage, value
            ),
            Self::UnknownSpecies { stage, species } => write!(
                f,
                "Stage '{}': species '{}' is not present in the input structure",
                stage, species
            ),
            Self::InvalidImageCount(stage) => {
                write!(f, "Stage '{}': n_images must be at least 1", stage)
            }
            Self::InvalidMillerIndex(stage) => {
                write!(f, "Stage '{}': max_index must be at least 1", stage)
            }
            Self::IncompatibleStage {
                stage,
                stage_type,
                family,
            } => write!(
                f,
                "Stage '{}' ({}) cannot run in a {} pipeline",
                stage, stage_type, family
            ),
            Self::MissingSetting(setting) => {
                write!(f, "Run setting '{}' is not set in the pipeline or profile", setting)
            }
            Self::InvalidConcurrency => write!(f, "max_concurrent_jobs must be at least 1"),
            Self::MissingStructure(name) => write!(f, "Input structure '{}' was not provided", name),
            Self::NoStructures(pipeline) => {
                write!(f, "Pipeline '{}' has no structures to run on", pipeline)
            }
            Self::NotDosTemplate { stage, found } => write!(
                f,
                "Stage '{}' must be a dos stage to drive a DOS batch, but is a {} stage",
                stage, found
            ),
            Self::DosBatchStageCount(count) => write!(
                f,
                "A dos_batch pipeline needs exactly one dos stage, found {} stages",
                count
            ),
            Self::CyclicDependency => write!(
                f,
                "Pipeline contains cyclic dependencies (stages depend on each other in a loop)"
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Stage names are identifiers: a letter or `_`, then letters, digits or `_`.
pub(crate) fn is_valid_stage_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_spacing(stage: &str, spacing: Option<f64>, errors: &mut Vec<ValidationError>) {
    if let Some(value) = spacing {
        if !(value > 0.0) {
            errors.push(ValidationError::InvalidKpointsSpacing {
                stage: stage.to_string(),
                value,
            });
        }
    }
}

fn check_sweep(
    stage: &str,
    field: &'static str,
    sweep: &SweepRange,
    errors: &mut Vec<ValidationError>,
) {
    if !sweep.is_valid() {
        errors.push(ValidationError::InvalidSweep {
            stage: stage.to_string(),
            field,
        });
    } else if sweep.point_count().is_none() {
        errors.push(ValidationError::SweepTooLarge {
            stage: stage.to_string(),
            field,
        });
    }
}

/// Validates a single stage's own parameters.
fn validate_stage(stage: &Stage) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let name = stage.name.as_str();

    if name.trim().is_empty() {
        errors.push(ValidationError::EmptyStageName);
        return errors;
    }

    if !is_valid_stage_name(name) {
        errors.push(ValidationError::InvalidStageName(name.to_string()));
    }

    if name == INPUT_STRUCTURE {
        errors.push(ValidationError::ReservedStageName(name.to_string()));
    }

    check_spacing(name, stage.kind.kpoints_spacing(), &mut errors);

    match &stage.kind {
        StageKind::Convergence(p) => {
            check_sweep(name, "cutoff", &p.cutoff, &mut errors);
            check_sweep(name, "kpoints", &p.kpoints, &mut errors);
        }
        StageKind::Batch(p) => {
            if p.calculations.is_empty() {
                errors.push(ValidationError::EmptyBatch(name.to_string()));
            }
            for (label, calc) in &p.calculations {
                if let Some(scale) = calc.volume_scale {
                    if !(scale > 0.0) {
                        errors.push(ValidationError::InvalidVolumeScale {
                            stage: name.to_string(),
                            label: label.clone(),
                            value: scale,
                        });
                    }
                }
                check_spacing(name, calc.kpoints_spacing, &mut errors);
            }
        }
        StageKind::HubbardResponse(p) => {
            if p.potential_values.is_empty() {
                errors.push(ValidationError::EmptyPerturbations(name.to_string()));
            } else if p.potential_values.iter().any(|v| *v == 0.0) {
                errors.push(ValidationError::ZeroPerturbation(name.to_string()));
            }
            if !(1..=3).contains(&p.ldaul) {
                errors.push(ValidationError::InvalidAngularMomentum {
                    stage: name.to_string(),
                    value: p.ldaul,
                });
            }
        }
        StageKind::GenerateNebImages(p) => {
            if p.n_images == 0 {
                errors.push(ValidationError::InvalidImageCount(name.to_string()));
            }
        }
        StageKind::SurfaceEnumeration(p) => {
            if p.max_index == 0 {
                errors.push(ValidationError::InvalidMillerIndex(name.to_string()));
            }
        }
        _ => {}
    }

    if stage.references().is_empty() {
        debug!("Stage '{}' starts from the input structure", name);
    }

    errors
}

/// What a reference field must point at.
enum Expect {
    /// A stage producing a structure, or an input structure
    Structure,
    /// A stage of exactly this type
    Type(&'static str),
    /// Same type as the referencing stage
    SameType,
}

fn expectation(field: &str) -> Expect {
    match field {
        "structure_from" | "initial_from" | "final_from" => Expect::Structure,
        "restart" => Expect::SameType,
        "images_from" => Expect::Type("generate_neb_images"),
        "batch_from" => Expect::Type("batch"),
        "response_from" => Expect::Type("hubbard_response"),
        "ground_state_from" => Expect::Type("vasp"),
        _ => Expect::Structure,
    }
}

fn check_reference(
    pipeline: &Pipeline,
    positions: &HashMap<&str, usize>,
    index: usize,
    stage: &Stage,
    reference: &StageRef,
) -> Option<ValidationError> {
    let target = reference.target.as_str();

    if target == stage.name {
        return Some(ValidationError::SelfReference {
            stage: stage.name.clone(),
            field: reference.field,
        });
    }

    let expect = expectation(reference.field);

    if pipeline.is_input(target) {
        return match expect {
            Expect::Structure => None,
            _ => Some(ValidationError::WrongReferenceType {
                stage: stage.name.clone(),
                field: reference.field,
                reference: target.to_string(),
                expected: expected_label(&expect, stage),
                found: "input structure",
            }),
        };
    }

    let Some(&target_index) = positions.get(target) else {
        return Some(ValidationError::UnknownReference {
            stage: stage.name.clone(),
            field: reference.field,
            reference: target.to_string(),
        });
    };

    if target_index > index {
        return Some(ValidationError::ForwardReference {
            stage: stage.name.clone(),
            field: reference.field,
            reference: target.to_string(),
        });
    }

    let target_kind = &pipeline.stages[target_index].kind;
    let type_ok = match expect {
        Expect::Structure => target_kind.produces_structure(),
        Expect::Type(t) => target_kind.type_name() == t,
        Expect::SameType => target_kind.type_name() == stage.type_name(),
    };

    if type_ok {
        None
    } else {
        Some(ValidationError::WrongReferenceType {
            stage: stage.name.clone(),
            field: reference.field,
            reference: target.to_string(),
            expected: expected_label(&expect, stage),
            found: target_kind.type_name(),
        })
    }
}

fn expected_label(expect: &Expect, stage: &Stage) -> &'static str {
    match expect {
        Expect::Structure => "a structure-producing stage (vasp, qe, dimer) or an input",
        Expect::Type(t) => t,
        Expect::SameType => stage.type_name(),
    }
}

/// Checks EOS stages against the batch they read volumes from.
fn check_eos_points(pipeline: &Pipeline, stage: &Stage) -> Option<ValidationError> {
    let StageKind::BirchMurnaghan(p) = &stage.kind else {
        return None;
    };
    let Some(StageKind::Batch(batch)) = pipeline.get_stage(&p.batch_from).map(|s| &s.kind) else {
        return None;
    };

    let volumes: HashSet<u64> = batch
        .calculations
        .values()
        .filter_map(|c| c.volume_scale)
        .map(f64::to_bits)
        .collect();

    if volumes.len() < MIN_EOS_POINTS {
        Some(ValidationError::InsufficientEosPoints {
            stage: stage.name.clone(),
            batch: p.batch_from.clone(),
            found: volumes.len(),
        })
    } else {
        None
    }
}

/// Collects every rule violation in a pipeline.
pub fn collect_errors(pipeline: &Pipeline) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if pipeline.name.trim().is_empty() {
        errors.push(ValidationError::EmptyPipelineName);
    }

    if pipeline.stages.is_empty() {
        errors.push(ValidationError::EmptyPipeline);
        return errors;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for stage in &pipeline.stages {
        if !seen.insert(stage.name.as_str()) {
            errors.push(ValidationError::DuplicateStageName(stage.name.clone()));
        }
        if stage.name != INPUT_STRUCTURE && pipeline.is_input(&stage.name) {
            errors.push(ValidationError::ReservedStageName(stage.name.clone()));
        }
    }

    // First occurrence wins for reference checks.
    let mut first_positions: HashMap<&str, usize> = HashMap::new();
    for (index, stage) in pipeline.stages.iter().enumerate() {
        first_positions.entry(stage.name.as_str()).or_insert(index);
    }

    for (index, stage) in pipeline.stages.iter().enumerate() {
        errors.extend(validate_stage(stage));

        for reference in stage.references() {
            if let Some(err) = check_reference(pipeline, &first_positions, index, stage, &reference)
            {
                errors.push(err);
            }
        }

        if let Some(err) = check_eos_points(pipeline, stage) {
            errors.push(err);
        }
    }

    check_spacing(
        "(pipeline default)",
        pipeline.settings.kpoints_spacing,
        &mut errors,
    );
    if pipeline.settings.max_concurrent_jobs == Some(0) {
        errors.push(ValidationError::InvalidConcurrency);
    }

    errors
}

/// Validates the pipeline structure.
///
/// Performs the following checks:
/// 1. Pipeline has a name and at least one stage
/// 2. Stage names are valid, unique and not reserved
/// 3. Every stage's own parameters are sane
/// 4. References point at earlier stages (or inputs) of the right type
/// 5. EOS fits have enough volume points
/// 6. Dependency waves can be formed (no cycles)
pub fn validate_pipeline(pipeline: &Pipeline) -> Result<()> {
    info!(
        "Validating pipeline '{}' with {} stages",
        pipeline.name,
        pipeline.stages.len()
    );

    let errors = collect_errors(pipeline);
    if !errors.is_empty() {
        return Err(LegoError::Validation(errors));
    }

    let waves = dependency_waves(pipeline)?;
    info!(
        "Pipeline validated: {} stages in {} dependency waves, types: {:?}",
        pipeline.stages.len(),
        waves.len(),
        pipeline.stage_types()
    );
    Ok(())
}

/// Rejects stages the target code family cannot run.
pub fn check_code_family(pipeline: &Pipeline, family: CodeFamily) -> Vec<ValidationError> {
    pipeline
        .stages
        .iter()
        .filter(|stage| match family {
            CodeFamily::Vasp => stage.kind.is_qe(),
            CodeFamily::Qe => !stage.kind.is_qe(),
        })
        .map(|stage| ValidationError::IncompatibleStage {
            stage: stage.name.clone(),
            stage_type: stage.type_name(),
            family,
        })
        .collect()
}

/// Checks that the engine-facing settings needed by a code family are present.
pub fn check_settings(settings: &RunSettings, family: CodeFamily) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if settings.code.as_deref().map_or(true, |c| c.trim().is_empty()) {
        errors.push(ValidationError::MissingSetting("code"));
    }
    match family {
        CodeFamily::Vasp if settings.potential_family.is_none() => {
            errors.push(ValidationError::MissingSetting("potential_family"));
        }
        CodeFamily::Qe if settings.pseudo_family.is_none() => {
            errors.push(ValidationError::MissingSetting("pseudo_family"));
        }
        _ => {}
    }
    if settings.max_concurrent_jobs == Some(0) {
        errors.push(ValidationError::InvalidConcurrency);
    }

    errors
}

/// Checks stage parameters that depend on the input structure itself.
pub fn check_structure_compatibility(
    pipeline: &Pipeline,
    structure: &Structure,
) -> Vec<ValidationError> {
    let elements = structure.elements();

    pipeline
        .stages
        .iter()
        .filter_map(|stage| match &stage.kind {
            StageKind::HubbardResponse(p) if !elements.contains(&p.target_species) => {
                Some(ValidationError::UnknownSpecies {
                    stage: stage.name.clone(),
                    species: p.target_species.clone(),
                })
            }
            _ => None,
        })
        .collect()
}

/// Groups stages into waves: each wave only depends on earlier waves.
///
/// Waves are informational; the engine decides how stages actually run.
pub fn dependency_waves(pipeline: &Pipeline) -> Result<Vec<Vec<String>>> {
    let mut remaining: HashMap<&str, HashSet<String>> = pipeline
        .stages
        .iter()
        .map(|s| {
            let deps = s
                .stage_dependencies()
                .into_iter()
                .filter(|d| !pipeline.is_input(d))
                .collect();
            (s.name.as_str(), deps)
        })
        .collect();

    let mut waves: Vec<Vec<String>> = Vec::new();
    let mut done: HashSet<String> = HashSet::new();

    while !remaining.is_empty() {
        let mut wave: Vec<String> = pipeline
            .stages
            .iter()
            .map(|s| s.name.as_str())
            .filter(|name| {
                remaining
                    .get(name)
                    .is_some_and(|deps| deps.iter().all(|d| done.contains(d)))
            })
            .map(String::from)
            .collect();

        if wave.is_empty() {
            return Err(ValidationError::CyclicDependency.into());
        }

        wave.dedup();
        for name in &wave {
            remaining.remove(name.as_str());
        }
        done.extend(wave.iter().cloned());
        waves.push(wave);
    }

    debug!("Dependency waves: {:?}", waves);
    Ok(waves)
}
