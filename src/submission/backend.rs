//! Workflow Backends
//!
//! A backend takes a fully resolved submission and hands it to the
//! orchestration engine, returning the process identifier (PK) the engine
//! will know it by.
//!
//! - [`DryRunBackend`]: prints the plan, allocates PKs in memory
//! - [`SpoolBackend`]: writes one JSON manifest per submission into a
//!   spool directory that the engine picks up

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{LegoError, Result};
use crate::pipeline::model::{Pipeline, RunSettings};
use crate::pipeline::stage::Stage;
use crate::pipeline::validator::dependency_waves;
use crate::structure::Structure;

/// Which engine workflow a submission runs under.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    VaspSequential,
    QeSequential,
    QeSingle,
    DosBatch,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VaspSequential => "vasp_sequential",
            Self::QeSequential => "qe_sequential",
            Self::QeSingle => "qe_single",
            Self::DosBatch => "dos_batch",
        }
    }
}

/// Everything the engine needs to run a pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubmissionRequest {
    pub name: String,
    pub workflow: WorkflowKind,
    /// Structures by input name, or by batch label for DOS batches
    pub structures: BTreeMap<String, Structure>,
    pub stages: Vec<Stage>,
    /// Settings with profile defaults already applied
    pub settings: RunSettings,
}

impl SubmissionRequest {
    /// Names reported back to the operator.
    ///
    /// A DOS batch reports its structure labels, everything else its stages.
    pub fn stage_names(&self) -> Vec<String> {
        match self.workflow {
            WorkflowKind::DosBatch => self.structures.keys().cloned().collect(),
            _ => self.stages.iter().map(|s| s.name.clone()).collect(),
        }
    }

    fn as_pipeline(&self) -> Pipeline {
        let mut pipeline = Pipeline::from_stages(self.name.clone(), self.stages.clone());
        if self.workflow != WorkflowKind::DosBatch {
            for name in self.structures.keys() {
                pipeline = pipeline.with_input(name.clone());
            }
        }
        pipeline
    }
}

/// Hands submissions to an orchestration engine.
pub trait WorkflowBackend {
    /// Short label for log messages.
    fn name(&self) -> &str;

    /// Submits a request and returns the engine's process identifier.
    fn submit(&mut self, request: &SubmissionRequest) -> Result<u64>;
}

fn one_line_incar(stage: &Stage) -> Option<String> {
    let incar = stage.kind.incar()?;
    if incar.is_empty() {
        return None;
    }
    let parts: Vec<String> = incar.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    Some(parts.join(" "))
}

/// Human-readable plan of a submission.
pub fn render_plan(request: &SubmissionRequest) -> String {
    let mut out = String::new();
    let settings = &request.settings;

    let _ = writeln!(out, "[DRY RUN] Pipeline: {}", request.name);
    let _ = writeln!(out, "  Workflow: {}", request.workflow.as_str());
    let _ = writeln!(
        out,
        "  Code: {}",
        settings.code.as_deref().unwrap_or("(unset)")
    );
    if let Some(family) = settings.potential_family.as_deref() {
        let _ = writeln!(out, "  Potential family: {}", family);
    }
    if let Some(family) = settings.pseudo_family.as_deref() {
        let _ = writeln!(out, "  Pseudo family: {}", family);
    }
    if let Some(spacing) = settings.kpoints_spacing {
        let _ = writeln!(out, "  K-point spacing: {}", spacing);
    }
    if let Some(options) = &settings.options {
        let _ = writeln!(
            out,
            "  Resources: {} machine(s) x {} MPI procs, {} s",
            options.num_machines, options.num_mpiprocs_per_machine, options.max_wallclock_seconds
        );
    }
    if let Some(limit) = settings.max_concurrent_jobs {
        let _ = writeln!(out, "  Max concurrent jobs: {}", limit);
    }
    for (label, structure) in &request.structures {
        let _ = writeln!(
            out,
            "  Structure '{}': {} ({} atoms, {:.2} Å³)",
            label,
            structure.formula(),
            structure.num_atoms(),
            structure.volume()
        );
    }

    match dependency_waves(&request.as_pipeline()) {
        Ok(waves) => {
            for (i, wave) in waves.iter().enumerate() {
                let _ = writeln!(out, "  Wave {}: {}", i + 1, wave.join(", "));
            }
        }
        Err(e) => {
            let _ = writeln!(out, "  Waves unavailable: {}", e);
        }
    }

    for stage in &request.stages {
        let _ = writeln!(out, "[DRY RUN] Stage: {}", stage.name);
        let _ = writeln!(out, "  Type: {}", stage.type_name());
        for reference in stage.references() {
            let _ = writeln!(out, "  {}: {}", reference.field, reference.target);
        }
        if let Some(spacing) = stage.kind.kpoints_spacing() {
            let _ = writeln!(out, "  K-point spacing: {}", spacing);
        }
        if let Some(incar) = one_line_incar(stage) {
            let _ = writeln!(out, "  INCAR: {}", incar);
        }
    }

    out
}

/// Prints what would be submitted and allocates PKs 1, 2, ... in memory.
#[derive(Debug, Default)]
pub struct DryRunBackend {
    next_pk: u64,
    quiet: bool,
    submitted: Vec<(u64, SubmissionRequest)>,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self {
            next_pk: 1,
            quiet: false,
            submitted: Vec::new(),
        }
    }

    /// Suppresses the printed plan.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Requests seen so far, with their PKs.
    pub fn submitted(&self) -> &[(u64, SubmissionRequest)] {
        &self.submitted
    }
}

impl WorkflowBackend for DryRunBackend {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn submit(&mut self, request: &SubmissionRequest) -> Result<u64> {
        let pk = self.next_pk.max(1);
        self.next_pk = pk + 1;

        if !self.quiet {
            print!("{}", render_plan(request));
        }
        debug!("Dry run assigned PK {} to '{}'", pk, request.name);

        self.submitted.push((pk, request.clone()));
        Ok(pk)
    }
}

/// A submission as stored in the spool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SpoolManifest {
    pub pk: u64,
    pub submitted_at: DateTime<Utc>,
    pub request: SubmissionRequest,
}

/// Writes `<spool>/<pk:06>.json` manifests.
#[derive(Debug, Clone)]
pub struct SpoolBackend {
    dir: PathBuf,
}

impl SpoolBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self, pk: u64) -> PathBuf {
        self.dir.join(format!("{:06}.json", pk))
    }

    /// PKs of every manifest in the spool, ascending.
    pub fn list(&self) -> Result<Vec<u64>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| LegoError::io(&self.dir, e))?;
        let mut pks: Vec<u64> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    return None;
                }
                // Only names `manifest_path` produces, so `load` finds every listed PK.
                let stem = path.file_stem().and_then(|s| s.to_str())?;
                let pk = stem.parse::<u64>().ok()?;
                (stem == format!("{:06}", pk)).then_some(pk)
            })
            .collect();
        pks.sort_unstable();
        Ok(pks)
    }

    /// The PK the next submission will get.
    pub fn next_pk(&self) -> Result<u64> {
        match self.list()?.last() {
            None => Ok(1),
            Some(&last) => last.checked_add(1).ok_or_else(|| {
                LegoError::Backend(format!(
                    "PK space exhausted in {} (last PK {})",
                    self.dir.display(),
                    last
                ))
            }),
        }
    }

    /// Looks up a manifest by PK.
    pub fn load(&self, pk: u64) -> Result<SpoolManifest> {
        let path = self.manifest_path(pk);
        if !path.exists() {
            return Err(LegoError::NotFound(format!(
                "no submission with PK {} in {}",
                pk,
                self.dir.display()
            )));
        }

        let content = fs::read_to_string(&path).map_err(|e| LegoError::io(&path, e))?;
        let manifest: SpoolManifest = serde_json::from_str(&content)?;
        if manifest.pk != pk {
            warn!(
                "Manifest {} records PK {} (file name says {})",
                path.display(),
                manifest.pk,
                pk
            );
        }
        Ok(manifest)
    }
}

impl WorkflowBackend for SpoolBackend {
    fn name(&self) -> &str {
        "spool"
    }

    fn submit(&mut self, request: &SubmissionRequest) -> Result<u64> {
        fs::create_dir_all(&self.dir).map_err(|e| LegoError::io(&self.dir, e))?;

        let pk = self.next_pk()?;
        let manifest = SpoolManifest {
            pk,
            submitted_at: Utc::now(),
            request: request.clone(),
        };
        let json = serde_json::to_string_pretty(&manifest)?;

        let path = self.manifest_path(pk);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| LegoError::io(&path, e))?;
        file.write_all(json.as_bytes())
            .map_err(|e| LegoError::io(&path, e))?;

        info!("Spooled '{}' as PK {} ({})", request.name, pk, path.display());
        Ok(pk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::Incar;
    use tempfile::tempdir;

    fn silicon() -> Structure {
        Structure::new(
            "Si",
            [[0.0, 2.715, 2.715], [2.715, 0.0, 2.715], [2.715, 2.715, 0.0]],
            vec!["Si".to_string(), "Si".to_string()],
            vec![[0.0; 3], [0.25; 3]],
        )
    }

    fn request(name: &str) -> SubmissionRequest {
        let mut structures = BTreeMap::new();
        structures.insert("input".to_string(), silicon());
        SubmissionRequest {
            name: name.to_string(),
            workflow: WorkflowKind::VaspSequential,
            structures,
            stages: vec![
                Stage::vasp("relax", Incar::new().with("ISIF", 3)),
                Stage::vasp("scf", Incar::new().with("NSW", 0)).with_structure_from("relax"),
            ],
            settings: RunSettings {
                code: Some("vasp@localhost".to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_dry_run_allocates_sequential_pks() {
        let mut backend = DryRunBackend::new().quiet();
        assert_eq!(backend.submit(&request("a")).unwrap(), 1);
        assert_eq!(backend.submit(&request("b")).unwrap(), 2);
        assert_eq!(backend.submitted().len(), 2);
        assert_eq!(backend.submitted()[1].1.name, "b");
    }

    #[test]
    fn test_default_dry_run_starts_at_one() {
        let mut backend = DryRunBackend::default();
        backend.quiet = true;
        assert_eq!(backend.submit(&request("a")).unwrap(), 1);
    }

    #[test]
    fn test_render_plan() {
        let plan = render_plan(&request("si"));
        assert!(plan.contains("[DRY RUN] Pipeline: si"));
        assert!(plan.contains("Code: vasp@localhost"));
        assert!(plan.contains("Structure 'input': Si2 (2 atoms"));
        assert!(plan.contains("Wave 1: relax"));
        assert!(plan.contains("Wave 2: scf"));
        assert!(plan.contains("structure_from: relax"));
        assert!(plan.contains("INCAR: ISIF=3"));
    }

    #[test]
    fn test_dos_batch_reports_labels() {
        let mut req = request("dos");
        req.workflow = WorkflowKind::DosBatch;
        req.structures.insert("strained".to_string(), silicon());
        assert_eq!(req.stage_names(), vec!["input", "strained"]);
    }

    #[test]
    fn test_spool_pks_increase() {
        let temp_dir = tempdir().unwrap();
        let mut backend = SpoolBackend::new(temp_dir.path().join("spool"));

        assert!(backend.list().unwrap().is_empty());
        assert_eq!(backend.submit(&request("first")).unwrap(), 1);
        assert_eq!(backend.submit(&request("second")).unwrap(), 2);
        assert_eq!(backend.list().unwrap(), vec![1, 2]);
        assert!(temp_dir.path().join("spool/000002.json").exists());
    }

    #[test]
    fn test_spool_continues_after_gap() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("000041.json"), "{}").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();

        let mut backend = SpoolBackend::new(temp_dir.path());
        assert_eq!(backend.submit(&request("next")).unwrap(), 42);
    }

    #[test]
    fn test_spool_ignores_unpadded_names() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("1.json"), "{}").unwrap();
        fs::write(temp_dir.path().join("0000007.json"), "{}").unwrap();

        let backend = SpoolBackend::new(temp_dir.path());
        assert!(backend.list().unwrap().is_empty());
        assert_eq!(backend.next_pk().unwrap(), 1);
    }

    #[test]
    fn test_spool_pk_exhausted() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join(format!("{}.json", u64::MAX)), "{}").unwrap();

        let mut backend = SpoolBackend::new(temp_dir.path());
        assert_eq!(backend.list().unwrap(), vec![u64::MAX]);
        assert!(matches!(backend.next_pk(), Err(LegoError::Backend(_))));
        assert!(matches!(backend.submit(&request("late")), Err(LegoError::Backend(_))));
    }

    #[test]
    fn test_spool_lookup() {
        let temp_dir = tempdir().unwrap();
        let mut backend = SpoolBackend::new(temp_dir.path());
        let pk = backend.submit(&request("si")).unwrap();

        let manifest = backend.load(pk).unwrap();
        assert_eq!(manifest.pk, pk);
        assert_eq!(manifest.request, request("si"));

        assert!(matches!(backend.load(99), Err(LegoError::NotFound(_))));
    }
}
