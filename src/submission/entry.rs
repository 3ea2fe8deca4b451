//! Submission entry points.
//!
//! Each `quick_*` function checks a pipeline against the rules for its
//! workflow kind, fills unset run settings from the profile and hands the
//! result to a [`WorkflowBackend`].

use std::collections::BTreeMap;
use std::fmt;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::backend::{SubmissionRequest, WorkflowBackend, WorkflowKind};
use crate::error::{LegoError, Result};
use crate::pipeline::model::{CodeFamily, Pipeline, RunSettings, INPUT_STRUCTURE};
use crate::pipeline::parser::{LoadedPipeline, WorkflowMode};
use crate::pipeline::stage::{IncarValue, QeParameters, Stage};
use crate::pipeline::validator::{
    check_code_family, check_settings, check_structure_compatibility, collect_errors,
    dependency_waves, is_valid_stage_name, ValidationError,
};
use crate::profile::Profile;
use crate::structure::Structure;

/// What the engine handed back for a submission.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmissionResult {
    pub pk: u64,
    pub name: String,
    pub stages: Vec<String>,
}

impl fmt::Display for SubmissionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PK {} ({}): {}", self.pk, self.name, self.stages.join(" -> "))
    }
}

/// Wraps one structure as the pipeline's main input.
pub fn single_input(structure: Structure) -> BTreeMap<String, Structure> {
    let mut inputs = BTreeMap::new();
    inputs.insert(INPUT_STRUCTURE.to_string(), structure);
    inputs
}

fn submit_request(
    backend: &mut dyn WorkflowBackend,
    request: SubmissionRequest,
) -> Result<SubmissionResult> {
    info!(
        "Submitting '{}' ({}) via {} backend",
        request.name,
        request.workflow.as_str(),
        backend.name()
    );
    let pk = backend.submit(&request)?;
    let result = SubmissionResult {
        pk,
        name: request.name.clone(),
        stages: request.stage_names(),
    };
    info!("Submitted {}", result);
    Ok(result)
}

fn submit_sequential(
    backend: &mut dyn WorkflowBackend,
    profile: &Profile,
    pipeline: &Pipeline,
    structures: &BTreeMap<String, Structure>,
    family: CodeFamily,
    kind: WorkflowKind,
) -> Result<SubmissionResult> {
    let settings = pipeline.settings.resolved(profile, family);

    let mut errors = collect_errors(pipeline);
    errors.extend(check_code_family(pipeline, family));
    errors.extend(check_settings(&settings, family));
    for input in &pipeline.inputs {
        if !structures.contains_key(input) {
            errors.push(ValidationError::MissingStructure(input.clone()));
        }
    }
    if let Some(structure) = structures.get(INPUT_STRUCTURE) {
        errors.extend(check_structure_compatibility(pipeline, structure));
    }
    if !errors.is_empty() {
        return Err(LegoError::Validation(errors));
    }
    dependency_waves(pipeline)?;

    let mut inputs = BTreeMap::new();
    for (name, structure) in structures {
        if pipeline.is_input(name) {
            inputs.insert(name.clone(), structure.clone());
        } else {
            warn!("Structure '{}' is not referenced by '{}'", name, pipeline.name);
        }
    }

    submit_request(
        backend,
        SubmissionRequest {
            name: pipeline.name.clone(),
            workflow: kind,
            structures: inputs,
            stages: pipeline.stages.clone(),
            settings,
        },
    )
}

/// Submits a VASP pipeline; every stage type except `qe` is accepted.
///
/// `structures` must hold the main `input` structure and every extra
/// input the pipeline declares.
pub fn quick_vasp_sequential(
    backend: &mut dyn WorkflowBackend,
    profile: &Profile,
    pipeline: &Pipeline,
    structures: &BTreeMap<String, Structure>,
) -> Result<SubmissionResult> {
    submit_sequential(
        backend,
        profile,
        pipeline,
        structures,
        CodeFamily::Vasp,
        WorkflowKind::VaspSequential,
    )
}

/// Submits a pipeline made only of `qe` stages.
pub fn quick_qe_sequential(
    backend: &mut dyn WorkflowBackend,
    profile: &Profile,
    pipeline: &Pipeline,
    structures: &BTreeMap<String, Structure>,
) -> Result<SubmissionResult> {
    submit_sequential(
        backend,
        profile,
        pipeline,
        structures,
        CodeFamily::Qe,
        WorkflowKind::QeSequential,
    )
}

/// Stage name for a single QE run: the `calculation` type, or `scf`.
fn qe_stage_name(parameters: &QeParameters) -> String {
    parameters
        .iter()
        .find(|(namelist, _)| namelist.eq_ignore_ascii_case("control"))
        .and_then(|(_, values)| {
            values
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case("calculation"))
        })
        .and_then(|(_, value)| match value {
            IncarValue::Text(calc) => Some(
                calc.chars()
                    .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                    .collect(),
            ),
            _ => None,
        })
        .unwrap_or_else(|| "scf".to_string())
}

/// Submits a single Quantum ESPRESSO calculation.
pub fn quick_qe(
    backend: &mut dyn WorkflowBackend,
    profile: &Profile,
    name: &str,
    structure: &Structure,
    parameters: QeParameters,
    settings: RunSettings,
) -> Result<SubmissionResult> {
    let stage = Stage::qe(qe_stage_name(&parameters), parameters);
    let pipeline = Pipeline::from_stages(name, vec![stage]).with_settings(settings);

    submit_sequential(
        backend,
        profile,
        &pipeline,
        &single_input(structure.clone()),
        CodeFamily::Qe,
        WorkflowKind::QeSingle,
    )
}

/// Runs one DOS calculation per labelled structure.
///
/// `template` is a `dos` stage whose `structure_from` is `input`; the
/// engine substitutes each structure in turn. The result lists the labels.
pub fn quick_dos_batch(
    backend: &mut dyn WorkflowBackend,
    profile: &Profile,
    name: &str,
    structures: &BTreeMap<String, Structure>,
    template: &Stage,
    settings: RunSettings,
) -> Result<SubmissionResult> {
    let pipeline = Pipeline::from_stages(name, vec![template.clone()]).with_settings(settings);
    let settings = pipeline.settings.resolved(profile, CodeFamily::Vasp);

    let mut errors = collect_errors(&pipeline);
    if template.type_name() != "dos" {
        errors.push(ValidationError::NotDosTemplate {
            stage: template.name.clone(),
            found: template.type_name(),
        });
    }
    if structures.is_empty() {
        errors.push(ValidationError::NoStructures(pipeline.name.clone()));
    }
    for label in structures.keys() {
        if !is_valid_stage_name(label) {
            errors.push(ValidationError::InvalidStageName(label.clone()));
        }
    }
    errors.extend(check_settings(&settings, CodeFamily::Vasp));
    if !errors.is_empty() {
        return Err(LegoError::Validation(errors));
    }

    submit_request(
        backend,
        SubmissionRequest {
            name: pipeline.name.clone(),
            workflow: WorkflowKind::DosBatch,
            structures: structures.clone(),
            stages: pipeline.stages,
            settings,
        },
    )
}

/// Submits a pipeline file through the entry point its contents call for.
pub fn submit_loaded(
    backend: &mut dyn WorkflowBackend,
    profile: &Profile,
    loaded: &LoadedPipeline,
) -> Result<SubmissionResult> {
    let pipeline = &loaded.pipeline;

    match loaded.mode {
        WorkflowMode::DosBatch => {
            if pipeline.len() != 1 {
                return Err(ValidationError::DosBatchStageCount(pipeline.len()).into());
            }
            let batch: BTreeMap<String, Structure> = loaded
                .structures
                .iter()
                .filter(|(label, _)| label.as_str() != INPUT_STRUCTURE)
                .map(|(label, s)| (label.clone(), s.clone()))
                .collect();
            quick_dos_batch(
                backend,
                profile,
                &pipeline.name,
                &batch,
                &pipeline.stages[0],
                pipeline.settings.clone(),
            )
        }
        WorkflowMode::Sequential => match pipeline.code_family() {
            CodeFamily::Qe => quick_qe_sequential(backend, profile, pipeline, &loaded.structures),
            CodeFamily::Vasp => {
                quick_vasp_sequential(backend, profile, pipeline, &loaded.structures)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::presets;
    use crate::pipeline::stage::Incar;
    use crate::submission::backend::DryRunBackend;

    fn silicon() -> Structure {
        Structure::new(
            "Si",
            [[0.0, 2.715, 2.715], [2.715, 0.0, 2.715], [2.715, 2.715, 0.0]],
            vec!["Si".to_string(), "Si".to_string()],
            vec![[0.0; 3], [0.25; 3]],
        )
    }

    fn vasp_profile() -> Profile {
        let mut profile = Profile::default();
        profile.vasp_code = Some("vasp@cluster".to_string());
        profile.qe_code = Some("pw@cluster".to_string());
        profile.potential_family = Some("PBE.54".to_string());
        profile.pseudo_family = Some("SSSP/1.3/PBE/efficiency".to_string());
        profile.max_concurrent_jobs = Some(2);
        profile
    }

    fn validation_errors(result: Result<SubmissionResult>) -> Vec<ValidationError> {
        match result {
            Err(LegoError::Validation(errors)) => errors,
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_quick_vasp_sequential() {
        let mut backend = DryRunBackend::new().quiet();
        let result = quick_vasp_sequential(
            &mut backend,
            &vasp_profile(),
            &presets::relax_scf_dos(),
            &single_input(silicon()),
        )
        .unwrap();

        assert_eq!(result.pk, 1);
        assert_eq!(result.stages, vec!["relax", "scf", "dos"]);

        let (_, request) = &backend.submitted()[0];
        assert_eq!(request.workflow, WorkflowKind::VaspSequential);
        assert_eq!(request.settings.code.as_deref(), Some("vasp@cluster"));
        assert_eq!(request.settings.max_concurrent_jobs, Some(2));
    }

    #[test]
    fn test_quick_vasp_rejects_qe_stage() {
        let mut backend = DryRunBackend::new().quiet();
        let mut pipeline = presets::relax_scf_dos();
        pipeline
            .add_stage(Stage::qe("qe_scf", Default::default()))
            .unwrap();

        let errors = validation_errors(quick_vasp_sequential(
            &mut backend,
            &vasp_profile(),
            &pipeline,
            &single_input(silicon()),
        ));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::IncompatibleStage { stage, .. } if stage == "qe_scf")));
        assert!(backend.submitted().is_empty());
    }

    #[test]
    fn test_missing_settings_without_profile() {
        let mut backend = DryRunBackend::new().quiet();
        let errors = validation_errors(quick_vasp_sequential(
            &mut backend,
            &Profile::default(),
            &presets::relax_scf_dos(),
            &single_input(silicon()),
        ));
        assert!(errors.contains(&ValidationError::MissingSetting("code")));
        assert!(errors.contains(&ValidationError::MissingSetting("potential_family")));
    }

    #[test]
    fn test_missing_extra_input() {
        let mut backend = DryRunBackend::new().quiet();
        let errors = validation_errors(quick_vasp_sequential(
            &mut backend,
            &vasp_profile(),
            &presets::neb(3),
            &single_input(silicon()),
        ));
        assert_eq!(errors, vec![ValidationError::MissingStructure("final".to_string())]);
    }

    #[test]
    fn test_unknown_hubbard_species() {
        let mut backend = DryRunBackend::new().quiet();
        let errors = validation_errors(quick_vasp_sequential(
            &mut backend,
            &vasp_profile(),
            &presets::hubbard_u("Ni", &[-0.1, 0.1]),
            &single_input(silicon()),
        ));
        assert!(matches!(&errors[0], ValidationError::UnknownSpecies { species, .. } if species == "Ni"));
    }

    #[test]
    fn test_quick_qe_sequential_only_qe() {
        let mut backend = DryRunBackend::new().quiet();
        let profile = vasp_profile();

        let result = quick_qe_sequential(
            &mut backend,
            &profile,
            &presets::qe_relax_scf(),
            &single_input(silicon()),
        )
        .unwrap();
        assert_eq!(result.stages, vec!["relax", "scf"]);
        assert_eq!(
            backend.submitted()[0].1.settings.pseudo_family.as_deref(),
            Some("SSSP/1.3/PBE/efficiency")
        );

        let errors = validation_errors(quick_qe_sequential(
            &mut backend,
            &profile,
            &presets::relax_scf_dos(),
            &single_input(silicon()),
        ));
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_quick_qe_names_stage_after_calculation() {
        let mut backend = DryRunBackend::new().quiet();
        let mut parameters = QeParameters::new();
        parameters.insert(
            "control".to_string(),
            [("calculation".to_string(), IncarValue::from("vc-relax"))]
                .into_iter()
                .collect(),
        );

        let result = quick_qe(
            &mut backend,
            &vasp_profile(),
            "si_vc",
            &silicon(),
            parameters,
            RunSettings::default(),
        )
        .unwrap();
        assert_eq!(result.stages, vec!["vc_relax"]);
        assert_eq!(backend.submitted()[0].1.workflow, WorkflowKind::QeSingle);

        let result = quick_qe(
            &mut backend,
            &vasp_profile(),
            "si_scf",
            &silicon(),
            QeParameters::new(),
            RunSettings::default(),
        )
        .unwrap();
        assert_eq!(result.pk, 2);
        assert_eq!(result.stages, vec!["scf"]);
    }

    #[test]
    fn test_quick_dos_batch_reports_labels() {
        let mut backend = DryRunBackend::new().quiet();
        let mut structures = BTreeMap::new();
        structures.insert("si_bulk".to_string(), silicon());
        structures.insert("si_strained".to_string(), silicon().scaled_to_volume_factor(1.03));

        let template = Stage::dos("dos", INPUT_STRUCTURE, Incar::new(), Incar::new().with("NEDOS", 2000));
        let result = quick_dos_batch(
            &mut backend,
            &vasp_profile(),
            "si_dos",
            &structures,
            &template,
            RunSettings::default(),
        )
        .unwrap();

        assert_eq!(result.stages, vec!["si_bulk", "si_strained"]);
        assert_eq!(backend.submitted()[0].1.workflow, WorkflowKind::DosBatch);
    }

    #[test]
    fn test_quick_dos_batch_checks() {
        let mut backend = DryRunBackend::new().quiet();
        let mut structures = BTreeMap::new();
        structures.insert("1bad".to_string(), silicon());

        let errors = validation_errors(quick_dos_batch(
            &mut backend,
            &vasp_profile(),
            "dos",
            &structures,
            &Stage::vasp("scf", Incar::new()),
            RunSettings::default(),
        ));
        assert!(errors.contains(&ValidationError::InvalidStageName("1bad".to_string())));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::NotDosTemplate { found, .. } if *found == "vasp")));

        let errors = validation_errors(quick_dos_batch(
            &mut backend,
            &vasp_profile(),
            "dos",
            &BTreeMap::new(),
            &Stage::dos("dos", INPUT_STRUCTURE, Incar::new(), Incar::new()),
            RunSettings::default(),
        ));
        assert_eq!(errors, vec![ValidationError::NoStructures("dos".to_string())]);
    }

    #[test]
    fn test_submission_result_display() {
        let result = SubmissionResult {
            pk: 7,
            name: "si".to_string(),
            stages: vec!["relax".to_string(), "scf".to_string()],
        };
        assert_eq!(result.to_string(), "PK 7 (si): relax -> scf");
    }
}
