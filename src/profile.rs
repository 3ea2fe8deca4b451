//! Engine Profile
//!
//! A profile tells the client which engine-side names to use (code labels,
//! potential and pseudopotential families), what scheduler resources to
//! request, and where submissions and the tracking log live.
//!
//! # Profile Resolution Priority
//!
//! The profile file is resolved in the following order:
//! 1. The path in the `LEGO_PROFILE` environment variable
//! 2. `lego_profile.json` in the current working directory
//!
//! Relative `spool_dir`/`tracking_file` paths are taken relative to the
//! directory the profile was loaded from.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{LegoError, Result};
use crate::pipeline::model::{CodeFamily, Resources};

/// Environment variable naming the profile file.
pub const PROFILE_ENV: &str = "LEGO_PROFILE";

/// Profile file name looked up in the current directory.
pub const PROFILE_FILE_NAME: &str = "lego_profile.json";

/// Lazily-resolved path to the active profile file.
pub static PROFILE_PATH: Lazy<PathBuf> = Lazy::new(|| {
    if let Ok(path) = std::env::var(PROFILE_ENV) {
        if !path.trim().is_empty() {
            info!("Using profile from {}: {}", PROFILE_ENV, path);
            return PathBuf::from(path);
        }
    }

    let cwd_path = PathBuf::from(PROFILE_FILE_NAME);
    debug!("Using CWD profile: {}", cwd_path.display());
    cwd_path
});

fn default_name() -> String {
    "default".to_string()
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from(".lego/spool")
}

fn default_tracking_file() -> PathBuf {
    PathBuf::from("lego_submissions.log")
}

/// Engine profile settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Profile {
    #[serde(default = "default_name")]
    pub name: String,

    /// Code label used for VASP pipelines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vasp_code: Option<String>,

    /// Code label used for Quantum ESPRESSO pipelines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qe_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpoints_spacing: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub potential_family: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub potential_mapping: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pseudo_family: Option<String>,

    #[serde(default)]
    pub options: Resources,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<usize>,

    /// Directory submission manifests are written to
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    /// Append-only submission log
    #[serde(default = "default_tracking_file")]
    pub tracking_file: PathBuf,

    /// Directory the profile was loaded from
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: default_name(),
            vasp_code: None,
            qe_code: None,
            kpoints_spacing: None,
            potential_family: None,
            potential_mapping: BTreeMap::new(),
            pseudo_family: None,
            options: Resources::default(),
            max_concurrent_jobs: None,
            spool_dir: default_spool_dir(),
            tracking_file: default_tracking_file(),
            base_dir: None,
        }
    }
}

impl Profile {
    /// Loads the profile from [`PROFILE_PATH`].
    pub fn load() -> Result<Self> {
        Self::load_from(PROFILE_PATH.as_path())
    }

    /// Loads a profile from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LegoError::Profile(format!(
                "no profile at '{}' (set {} or create {})",
                path.display(),
                PROFILE_ENV,
                PROFILE_FILE_NAME
            )));
        }

        let content = fs::read_to_string(path).map_err(|e| LegoError::io(path, e))?;
        let mut profile: Profile = serde_json::from_str(&content).map_err(|e| {
            LegoError::Profile(format!("invalid profile '{}': {}", path.display(), e))
        })?;
        profile.base_dir = path.parent().map(Path::to_path_buf);

        info!("Loaded profile '{}' from {}", profile.name, path.display());
        Ok(profile)
    }

    /// Saves the profile as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| LegoError::io(path, e))?;
        info!("Saved profile to {}", path.display());
        Ok(())
    }

    /// Code label for a code family, if configured.
    pub fn code_for(&self, family: CodeFamily) -> Option<&str> {
        match family {
            CodeFamily::Vasp => self.vasp_code.as_deref(),
            CodeFamily::Qe => self.qe_code.as_deref(),
        }
    }

    /// Concurrency limit, defaulting to the number of logical CPUs.
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrent_jobs.unwrap_or_else(num_cpus::get)
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.resolve(&self.spool_dir)
    }

    pub fn tracking_file(&self) -> PathBuf {
        self.resolve(&self.tracking_file)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() && !base.as_os_str().is_empty() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_profile() {
        let profile = Profile::default();
        assert_eq!(profile.name, "default");
        assert!(profile.code_for(CodeFamily::Vasp).is_none());
        assert_eq!(profile.spool_dir(), PathBuf::from(".lego/spool"));
        assert!(profile.concurrency_limit() >= 1);
    }

    #[test]
    fn test_load_missing_profile() {
        let result = Profile::load_from(Path::new("/nonexistent/lego_profile.json"));
        assert!(matches!(result, Err(LegoError::Profile(_))));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("lego_profile.json");
        fs::write(
            &path,
            r#"{
                "name": "cluster",
                "vasp_code": "vasp-6.4@cluster",
                "qe_code": "pw-7.2@cluster",
                "potential_family": "PBE.54",
                "potential_mapping": {"Ni": "Ni_pv"},
                "options": {"num_machines": 2, "num_mpiprocs_per_machine": 64},
                "max_concurrent_jobs": 4,
                "tracking_file": "submissions.log"
            }"#,
        )
        .unwrap();

        let profile = Profile::load_from(&path).unwrap();
        assert_eq!(profile.name, "cluster");
        assert_eq!(profile.code_for(CodeFamily::Qe), Some("pw-7.2@cluster"));
        assert_eq!(profile.options.num_machines, 2);
        assert_eq!(profile.options.max_wallclock_seconds, 3600);
        assert_eq!(profile.concurrency_limit(), 4);
        assert_eq!(profile.tracking_file(), temp_dir.path().join("submissions.log"));
        assert_eq!(profile.spool_dir(), temp_dir.path().join(".lego/spool"));
    }

    #[test]
    fn test_absolute_paths_untouched() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("p.json");
        fs::write(&path, r#"{"spool_dir": "/var/spool/lego"}"#).unwrap();

        let profile = Profile::load_from(&path).unwrap();
        assert_eq!(profile.spool_dir(), PathBuf::from("/var/spool/lego"));
    }

    #[test]
    fn test_invalid_profile_json() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("p.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(Profile::load_from(&path), Err(LegoError::Profile(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("p.json");

        let mut profile = Profile::default();
        profile.pseudo_family = Some("SSSP/1.3/PBE/efficiency".to_string());
        profile.save(&path).unwrap();

        let loaded = Profile::load_from(&path).unwrap();
        assert_eq!(loaded.pseudo_family, profile.pseudo_family);
    }
}
