//! Lego CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Browse the example catalog
//! lego list --difficulty beginner
//!
//! # Check and preview a pipeline
//! lego validate demos/01_basics/si_relax_scf_dos.yaml
//! lego submit demos/01_basics/si_relax_scf_dos.yaml --dry-run
//!
//! # Submit for real (needs a profile) and look it up later
//! lego --profile ~/lego_profile.json submit pipeline.yaml
//! lego status 12
//! lego history --tail 5
//!
//! # Plot an equation of state
//! lego eos --v0 40.9 --e0 -10.84 --b0 0.55 --b1 4.3
//! lego eos --data volumes.csv --csv fitted.csv
//! ```

mod cli;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use log::{info, warn};

use lego_pipelines::analysis::chart::{self, EosCurve};
use lego_pipelines::analysis::BirchMurnaghan;
use lego_pipelines::catalog::{
    render_table, rows_from_entries, scan_catalog, CatalogFilter, NO_MATCHES,
};
use lego_pipelines::pipeline::parser::read_structure;
use lego_pipelines::pipeline::presets::NEB_FINAL_STRUCTURE;
use lego_pipelines::pipeline::{
    dependency_waves, load_pipeline, save_pipeline, PipelineDocument, PresetKind, WorkflowMode,
};
use lego_pipelines::profile::Profile;
use lego_pipelines::submission::{
    submit_loaded, DryRunBackend, SpoolBackend, TrackingLog, WorkflowBackend,
};
use lego_pipelines::{LegoError, APP_NAME, VERSION};

use cli::{
    Cli, Commands, EosArgs, HistoryArgs, ListArgs, StatusArgs, SubmitArgs, TemplateArgs,
    ValidateArgs,
};

/// Fraction of V0 plotted on each side when no range is given.
const DEFAULT_VOLUME_FRACTION: f64 = 0.1;

/// Chart panel size in characters.
const CHART_WIDTH: usize = 64;
const CHART_HEIGHT: usize = 14;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn load_profile(path: Option<&Path>) -> lego_pipelines::Result<Profile> {
    match path {
        Some(path) => Profile::load_from(path),
        None => Profile::load(),
    }
}

fn heading(text: &str) {
    println!();
    println!("{}", text.bold());
}

fn cmd_list(args: ListArgs) -> CliResult<ExitCode> {
    let filter = CatalogFilter {
        category: args.category,
        difficulty: args.difficulty,
    };
    let entries = filter.apply(scan_catalog(&args.root)?);

    if entries.is_empty() {
        println!("{}", NO_MATCHES);
        return Ok(ExitCode::FAILURE);
    }

    print!("{}", render_table(&rows_from_entries(&entries)));
    Ok(ExitCode::SUCCESS)
}

fn cmd_validate(args: ValidateArgs) -> CliResult<ExitCode> {
    let loaded = load_pipeline(&args.file)?;
    let pipeline = &loaded.pipeline;

    heading(&format!("Pipeline: {}", pipeline.name));
    println!("  Mode:   {:?}", loaded.mode);
    println!("  Code:   {}", pipeline.code_family());
    for (label, structure) in &loaded.structures {
        println!(
            "  Input:  {} = {} ({} atoms, {:.2} Å³)",
            label,
            structure.formula(),
            structure.num_atoms(),
            structure.volume()
        );
    }

    heading("Stages");
    for (i, stage) in pipeline.stages.iter().enumerate() {
        println!("  {:>2}. {:<20} {}", i + 1, stage.name, stage.type_name());
    }

    if loaded.mode == WorkflowMode::Sequential {
        heading("Dependency waves");
        for (i, wave) in dependency_waves(pipeline)?.iter().enumerate() {
            println!("  Wave {}: {}", i + 1, wave.join(", "));
        }
    }

    println!();
    println!("{} {}", "OK".green().bold(), args.file.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_submit(args: SubmitArgs, profile_path: Option<&Path>) -> CliResult<ExitCode> {
    let loaded = load_pipeline(&args.file)?;

    let profile = match load_profile(profile_path) {
        Ok(profile) => profile,
        Err(e) if args.dry_run => {
            warn!("{}; using built-in defaults for the dry run", e);
            Profile::default()
        }
        Err(e) => return Err(e.into()),
    };

    let mut backend: Box<dyn WorkflowBackend> = if args.dry_run {
        info!("Mode: DRY RUN (nothing will be spooled)");
        Box::new(DryRunBackend::new())
    } else {
        Box::new(SpoolBackend::new(profile.spool_dir()))
    };

    let result = submit_loaded(backend.as_mut(), &profile, &loaded)?;

    println!();
    println!("{} {}", "Submitted".green().bold(), result);

    if args.dry_run || args.no_track {
        return Ok(ExitCode::SUCCESS);
    }

    let log = TrackingLog::new(profile.tracking_file());
    let entry = log.record(&result)?;
    println!("Tracked in {} at {}", log.path().display(), entry.timestamp);
    Ok(ExitCode::SUCCESS)
}

fn cmd_status(args: StatusArgs, profile_path: Option<&Path>) -> CliResult<ExitCode> {
    let profile = load_profile(profile_path)?;
    let spool = SpoolBackend::new(profile.spool_dir());
    let manifest = spool.load(args.pk)?;
    let request = &manifest.request;

    heading(&format!("PK {}: {}", manifest.pk, request.name));
    println!("  Workflow:  {}", request.workflow.as_str());
    println!("  Submitted: {}", manifest.submitted_at);
    if let Some(code) = &request.settings.code {
        println!("  Code:      {}", code);
    }
    println!("  Stages:    {}", request.stage_names().join(" -> "));
    for (label, structure) in &request.structures {
        println!("  Structure: {} = {}", label, structure.formula());
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_history(args: HistoryArgs, profile_path: Option<&Path>) -> CliResult<ExitCode> {
    let tracking_file = match load_profile(profile_path) {
        Ok(profile) => profile.tracking_file(),
        Err(e) => {
            warn!("{}; reading the default tracking file", e);
            Profile::default().tracking_file()
        }
    };

    let log = TrackingLog::new(tracking_file);
    let entries = log.tail(args.tail)?;
    if entries.is_empty() {
        println!("No submissions recorded in {}", log.path().display());
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<22} {:>8}  {}", "Submitted", "PK", "Pipeline");
    for entry in entries {
        println!(
            "{:<22} {:>8}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry.pk,
            entry.name
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_eos(args: EosArgs) -> CliResult<ExitCode> {
    let (params, points) = match (&args.data, args.v0, args.e0, args.b0, args.b1) {
        (Some(path), ..) => {
            let points = chart::read_points(path)?;
            let (volumes, energies) = chart::unzip_points(&points);
            let params = BirchMurnaghan::fit(&volumes, &energies)?;
            info!(
                "Fit {} points, RMS residual {:.3e} eV",
                points.len(),
                params.rms_residual(&volumes, &energies)
            );
            (params, points)
        }
        (None, Some(v0), Some(e0), Some(b0), Some(b1)) => {
            (BirchMurnaghan::new(v0, e0, b0, b1), Vec::new())
        }
        _ => return Err("give either --v0/--e0/--b0/--b1 or --data".into()),
    };

    let curve = match (args.vmin, args.vmax) {
        (Some(vmin), Some(vmax)) => EosCurve::sample(params, vmin, vmax, args.points)?,
        _ if !points.is_empty() => {
            let (lo, hi) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.volume), hi.max(p.volume))
            });
            let margin = (hi - lo) * 0.05;
            EosCurve::sample(params, lo - margin, hi + margin, args.points)?
        }
        _ => EosCurve::around_equilibrium(params, DEFAULT_VOLUME_FRACTION, args.points)?,
    };

    println!();
    print!(
        "{}",
        chart::render_two_panel(&curve, &points, CHART_WIDTH, CHART_HEIGHT)
    );

    if let Some(out) = &args.csv {
        chart::write_csv(&curve, out)?;
        println!("Curve written to {}", out.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn absolute(path: &Path) -> CliResult<PathBuf> {
    fs::canonicalize(path).map_err(|e| LegoError::io(path, e).into())
}

fn cmd_template(args: TemplateArgs) -> CliResult<ExitCode> {
    let structure = read_structure(&args.structure)?;
    let pipeline = args.kind.build();

    let mut document = PipelineDocument::from_pipeline(&pipeline, absolute(&args.structure)?);
    if args.kind == PresetKind::Neb {
        let final_path = args
            .final_structure
            .as_deref()
            .ok_or("the neb template needs --final POSCAR")?;
        read_structure(final_path)?;
        document
            .structures
            .insert(NEB_FINAL_STRUCTURE.to_string(), absolute(final_path)?);
    } else if args.final_structure.is_some() {
        warn!("--final is only used by the neb template");
    }

    save_pipeline(&document, &args.output)?;
    println!(
        "{} {} pipeline for {} written to {}",
        "Created".green().bold(),
        pipeline.name,
        structure.formula(),
        args.output.display()
    );
    println!("Set `code` and the potential family (or use a profile) before submitting.");
    Ok(ExitCode::SUCCESS)
}

/// Main application entry point.
fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    log::debug!("{} v{}", APP_NAME, VERSION);

    let profile = cli.profile.as_deref();
    match cli.command {
        Commands::List(args) => cmd_list(args),
        Commands::Validate(args) => cmd_validate(args),
        Commands::Submit(args) => cmd_submit(args, profile),
        Commands::Status(args) => cmd_status(args, profile),
        Commands::History(args) => cmd_history(args, profile),
        Commands::Eos(args) => cmd_eos(args),
        Commands::Template(args) => cmd_template(args),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
