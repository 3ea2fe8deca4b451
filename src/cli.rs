//! Command-Line Definitions
//!
//! clap derive types for the `lego` subcommands. The handlers live in `main.rs`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use lego_pipelines::catalog::Difficulty;
use lego_pipelines::pipeline::PresetKind;

#[derive(Parser, Debug)]
#[command(
    name = "lego",
    version,
    about = "Build, validate and submit multi-stage DFT pipelines"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Engine profile to use instead of $LEGO_PROFILE or ./lego_profile.json
    #[arg(long, global = true, value_name = "PATH")]
    pub profile: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the example pipelines in a catalog directory.
    List(ListArgs),
    /// Check a pipeline file without submitting it.
    Validate(ValidateArgs),
    /// Submit a pipeline file to the engine.
    Submit(SubmitArgs),
    /// Show a spooled submission by PK.
    Status(StatusArgs),
    /// Show recent tracked submissions.
    History(HistoryArgs),
    /// Evaluate or fit a Birch–Murnaghan equation of state and plot it.
    Eos(EosArgs),
    /// Write a preset pipeline file for a structure.
    Template(TemplateArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Catalog root containing NN_category directories
    #[arg(long, default_value = "demos", value_name = "DIR")]
    pub root: PathBuf,

    /// Only list this category number
    #[arg(short, long, value_name = "N")]
    pub category: Option<u32>,

    /// Only list examples at this level
    #[arg(short, long, value_enum)]
    pub difficulty: Option<Difficulty>,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Pipeline YAML file
    #[arg(value_name = "FILE")]
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Pipeline YAML file
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Print the submission plan instead of spooling it
    #[arg(long)]
    pub dry_run: bool,

    /// Do not append the submission to the tracking log
    #[arg(long)]
    pub no_track: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Process key returned by `submit`
    #[arg(value_name = "PK")]
    pub pk: u64,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Number of most recent entries to show
    #[arg(short = 'n', long, default_value_t = 20, value_name = "N")]
    pub tail: usize,
}

/// Either explicit parameters or a CSV of points to fit.
#[derive(Args, Debug)]
pub struct EosArgs {
    /// Equilibrium volume (Å³)
    #[arg(long, requires_all = ["e0", "b0", "b1"], conflicts_with = "data")]
    pub v0: Option<f64>,

    /// Equilibrium energy (eV)
    #[arg(long, allow_hyphen_values = true, requires = "v0")]
    pub e0: Option<f64>,

    /// Bulk modulus (eV/Å³)
    #[arg(long, requires = "v0")]
    pub b0: Option<f64>,

    /// Pressure derivative of the bulk modulus
    #[arg(long, requires = "v0")]
    pub b1: Option<f64>,

    /// CSV file with `volume,energy` rows to fit
    #[arg(long, value_name = "CSV")]
    pub data: Option<PathBuf>,

    /// Smallest volume plotted (Å³)
    #[arg(long, requires = "vmax")]
    pub vmin: Option<f64>,

    /// Largest volume plotted (Å³)
    #[arg(long, requires = "vmin")]
    pub vmax: Option<f64>,

    /// Number of curve samples
    #[arg(long, default_value_t = 60)]
    pub points: usize,

    /// Write the sampled curve to this CSV file
    #[arg(long, value_name = "OUT")]
    pub csv: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct TemplateArgs {
    /// Preset to write
    #[arg(value_enum, value_name = "KIND")]
    pub kind: PresetKind,

    /// Input structure (POSCAR)
    #[arg(short, long, value_name = "POSCAR")]
    pub structure: PathBuf,

    /// Final structure for NEB presets (POSCAR)
    #[arg(long = "final", value_name = "POSCAR")]
    pub final_structure: Option<PathBuf>,

    /// Pipeline file to write
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_list_rejects_unknown_difficulty() {
        let result = Cli::try_parse_from(["lego", "list", "--difficulty", "expert"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_list_filters() {
        let cli = Cli::try_parse_from(["lego", "list", "--category", "3", "--difficulty", "advanced"])
            .unwrap();
        match cli.command {
            Commands::List(args) => {
                assert_eq!(args.category, Some(3));
                assert_eq!(args.difficulty, Some(Difficulty::Advanced));
                assert_eq!(args.root, PathBuf::from("demos"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_eos_parameters_and_data_conflict() {
        assert!(Cli::try_parse_from([
            "lego", "eos", "--v0", "40", "--e0", "-10.8", "--b0", "0.6", "--b1", "4.5"
        ])
        .is_ok());
        assert!(Cli::try_parse_from(["lego", "eos", "--v0", "40"]).is_err());
        assert!(Cli::try_parse_from([
            "lego", "eos", "--v0", "40", "--e0", "-10.8", "--b0", "0.6", "--b1", "4.5", "--data",
            "points.csv"
        ])
        .is_err());
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["lego", "history", "-v", "--profile", "p.json"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.profile, Some(PathBuf::from("p.json")));
    }
}
