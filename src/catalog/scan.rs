//! Example Catalog Scanner
//!
//! Walks numbered category directories (`01_basics/`, `02_dos/`, ...) and
//! reads the leading documentation block of every example file as text.
//!
//! ```yaml
//! # Relax bulk silicon, then run a static calculation.
//! #
//! # Description: Two-stage relax + SCF for bulk Si
//! # Difficulty: beginner
//! name: si_relax
//! ```
//!
//! Rust examples use `//!` lines instead of `#`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use log::{debug, warn};

use crate::error::{LegoError, Result};

/// File extensions treated as examples.
pub const EXAMPLE_EXTENSIONS: [&str; 3] = ["yaml", "yml", "rs"];

pub const DESCRIPTION_LABEL: &str = "Description:";
pub const DIFFICULTY_LABEL: &str = "Difficulty:";

/// Description used when the file could not be read.
pub const UNREADABLE: &str = "(unreadable)";
/// Description used when the doc block has no description.
pub const NO_DESCRIPTION: &str = "-";
/// Difficulty used when it is missing or unreadable.
pub const UNKNOWN_DIFFICULTY: &str = "?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
        }
    }

    /// Matches a free-form label by its first word, case-insensitively.
    pub fn matches_label(&self, label: &str) -> bool {
        label
            .split_whitespace()
            .next()
            .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()))
            .is_some_and(|word| word.eq_ignore_ascii_case(self.as_str()))
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One example file found in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Leading number of the category directory
    pub category_number: u32,
    /// Category directory name, e.g. `03_eos`
    pub category: String,
    /// Path relative to the catalog root
    pub path: PathBuf,
    pub description: String,
    pub difficulty: String,
}

impl CatalogEntry {
    /// Example name shown in listings: the path below the category directory.
    pub fn example_name(&self) -> String {
        let inner: PathBuf = self.path.components().skip(1).collect();
        inner.to_string_lossy().replace('\\', "/")
    }
}

/// Optional filters applied to scanned entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogFilter {
    pub category: Option<u32>,
    pub difficulty: Option<Difficulty>,
}

impl CatalogFilter {
    pub fn matches(&self, entry: &CatalogEntry) -> bool {
        self.category.map_or(true, |n| entry.category_number == n)
            && self
                .difficulty
                .map_or(true, |d| d.matches_label(&entry.difficulty))
    }

    pub fn apply(&self, entries: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
        entries.into_iter().filter(|e| self.matches(e)).collect()
    }
}

/// Leading number of a `NN_name` directory.
pub fn category_number(dir_name: &str) -> Option<u32> {
    let (digits, _) = dir_name.split_once('_')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Leading comment lines of a file, with the comment markers removed.
///
/// Blank lines before the block are skipped; the block ends at the first
/// line that is not a comment.
pub fn parse_doc_block(text: &str, extension: &str) -> Vec<String> {
    let marker = if extension == "rs" { "//!" } else { "#" };

    text.lines()
        .skip_while(|line| line.trim().is_empty())
        .map_while(|line| line.trim_start().strip_prefix(marker))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest).trim_end().to_string())
        .collect()
}

/// Value of the first `label` line in a doc block.
pub fn extract_label(lines: &[String], label: &str) -> Option<String> {
    lines
        .iter()
        .find_map(|line| line.trim_start().strip_prefix(label))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn is_example(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| EXAMPLE_EXTENSIONS.contains(&e))
}

fn sorted_children(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut children: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| LegoError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    children.sort();
    Ok(children)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for path in sorted_children(dir)? {
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if is_example(&path) {
            files.push(path);
        }
    }
    Ok(())
}

/// Reads one example's doc block, substituting placeholders on failure.
fn describe(path: &Path) -> (String, String) {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!("Could not read {}: {}", path.display(), e);
            return (UNREADABLE.to_string(), UNKNOWN_DIFFICULTY.to_string());
        }
    };

    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let block = parse_doc_block(&text, extension);
    (
        extract_label(&block, DESCRIPTION_LABEL).unwrap_or_else(|| NO_DESCRIPTION.to_string()),
        extract_label(&block, DIFFICULTY_LABEL).unwrap_or_else(|| UNKNOWN_DIFFICULTY.to_string()),
    )
}

/// Scans every numbered category under `root`, in sorted order.
pub fn scan_catalog(root: &Path) -> Result<Vec<CatalogEntry>> {
    let mut entries = Vec::new();

    for dir in sorted_children(root)? {
        if !dir.is_dir() {
            continue;
        }
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(number) = category_number(name) else {
            debug!("Skipping non-category directory {}", dir.display());
            continue;
        };

        let mut files = Vec::new();
        collect_files(&dir, &mut files)?;

        for file in files {
            let (description, difficulty) = describe(&file);
            let path = file.strip_prefix(root).unwrap_or(&file).to_path_buf();
            entries.push(CatalogEntry {
                category_number: number,
                category: name.to_string(),
                path,
                description,
                difficulty,
            });
        }
    }

    debug!("Scanned {} examples under {}", entries.len(), root.display());
    Ok(entries)
}
