//! Canonical pipelines.
//!
//! Ready-made stage lists for the common calculation chains. They are the
//! starting point for `lego template` and for the demo pipeline files.

use std::collections::BTreeMap;

use clap::ValueEnum;

use super::model::{Pipeline, INPUT_STRUCTURE};
use super::stage::{
    BatchCalculation, Incar, IncarValue, QeParameters, Stage, StageKind, SweepRange,
};

/// Input name of the NEB end-point structure.
pub const NEB_FINAL_STRUCTURE: &str = "final";

/// Volume scalings used by [`eos_scan`] when none are given.
pub const DEFAULT_VOLUME_SCALES: [f64; 7] = [0.94, 0.96, 0.98, 1.00, 1.02, 1.04, 1.06];

/// Named presets, as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PresetKind {
    RelaxScfDos,
    Convergence,
    Eos,
    Neb,
    Dimer,
    HubbardU,
    Surfaces,
    QeRelaxScf,
}

impl PresetKind {
    /// Builds the preset with its default parameters.
    pub fn build(self) -> Pipeline {
        match self {
            Self::RelaxScfDos => relax_scf_dos(),
            Self::Convergence => convergence_scan(),
            Self::Eos => eos_scan(&DEFAULT_VOLUME_SCALES),
            Self::Neb => neb(5),
            Self::Dimer => dimer(),
            Self::HubbardU => hubbard_u("Ni", &[-0.2, -0.1, 0.1, 0.2]),
            Self::Surfaces => surfaces(1),
            Self::QeRelaxScf => qe_relax_scf(),
        }
    }
}

fn relax_incar() -> Incar {
    Incar::new()
        .with("ENCUT", 520)
        .with("EDIFF", 1e-6)
        .with("EDIFFG", -0.01)
        .with("IBRION", 2)
        .with("ISIF", 3)
        .with("NSW", 100)
        .with("ISMEAR", 0)
        .with("SIGMA", 0.05)
}

fn static_incar() -> Incar {
    Incar::new()
        .with("ENCUT", 520)
        .with("EDIFF", 1e-6)
        .with("NSW", 0)
        .with("ISMEAR", -5)
        .with("LCHARG", true)
}

/// Relaxation, static run and density of states.
pub fn relax_scf_dos() -> Pipeline {
    Pipeline::from_stages(
        "relax_scf_dos",
        vec![
            Stage::vasp("relax", relax_incar()).with_retrieve(&["CONTCAR", "OUTCAR"]),
            Stage::vasp("scf", static_incar()).with_structure_from("relax"),
            Stage::dos(
                "dos",
                "relax",
                static_incar(),
                Incar::new()
                    .with("ICHARG", 11)
                    .with("NEDOS", 3000)
                    .with("LORBIT", 11),
            )
            .with_retrieve(&["DOSCAR", "vasprun.xml"]),
        ],
    )
}

/// ENCUT and k-point spacing convergence scan.
pub fn convergence_scan() -> Pipeline {
    Pipeline::from_stages(
        "convergence",
        vec![Stage::convergence(
            "convergence",
            Incar::new().with("EDIFF", 1e-6).with("ISMEAR", 0).with("SIGMA", 0.05),
            SweepRange::new(300.0, 700.0, 50.0),
            SweepRange::new(0.02, 0.08, 0.01),
        )],
    )
}

/// Relaxation, fixed-shape volume scan and Birch–Murnaghan fit.
pub fn eos_scan(volume_scales: &[f64]) -> Pipeline {
    let batch = volume_scales.iter().fold(
        Stage::batch("volumes", static_incar().with("ISIF", 2).with("IBRION", 2).with("NSW", 40))
            .with_structure_from("relax"),
        |stage, scale| {
            stage.with_calculation(
                format!("v_{:.3}", scale),
                BatchCalculation {
                    volume_scale: Some(*scale),
                    ..Default::default()
                },
            )
        },
    );

    Pipeline::from_stages(
        "eos",
        vec![
            Stage::vasp("relax", relax_incar()),
            batch,
            Stage::birch_murnaghan("eos", "volumes"),
        ],
    )
}

/// Relaxed end points, interpolated images and a climbing-image NEB.
pub fn neb(n_images: usize) -> Pipeline {
    let endpoint = relax_incar().with("ISIF", 2);
    Pipeline::from_stages(
        "neb",
        vec![
            Stage::vasp("relax_initial", endpoint.clone()).with_structure_from(INPUT_STRUCTURE),
            Stage::vasp("relax_final", endpoint).with_structure_from(NEB_FINAL_STRUCTURE),
            Stage::generate_neb_images("images", "relax_initial", "relax_final", n_images),
            Stage::neb(
                "neb",
                "images",
                Incar::new()
                    .with("IMAGES", n_images as i64)
                    .with("SPRING", -5)
                    .with("LCLIMB", true)
                    .with("IBRION", 3)
                    .with("POTIM", 0.0)
                    .with("IOPT", 1)
                    .with("EDIFFG", -0.05),
            )
            .with_retrieve(&["OUTCAR", "CONTCAR"]),
        ],
    )
    .with_input(NEB_FINAL_STRUCTURE)
}

/// Relaxation followed by a dimer saddle-point search.
pub fn dimer() -> Pipeline {
    Pipeline::from_stages(
        "dimer",
        vec![
            Stage::vasp("relax", relax_incar().with("ISIF", 2)),
            Stage::dimer(
                "dimer",
                "relax",
                Incar::new()
                    .with("ICHAIN", 2)
                    .with("IBRION", 3)
                    .with("POTIM", 0.0)
                    .with("IOPT", 2)
                    .with("NSW", 200)
                    .with("EDIFFG", -0.03),
            )
            .with_retrieve(&["OUTCAR", "CONTCAR", "NEWMODECAR"]),
        ],
    )
}

/// Ground state, on-site linear response and U extraction.
pub fn hubbard_u(species: &str, potential_values: &[f64]) -> Pipeline {
    let mut response = Stage::hubbard_response(
        "response",
        "ground_state",
        species,
        potential_values.to_vec(),
    );
    if let StageKind::HubbardResponse(p) = &mut response.kind {
        p.incar = Incar::new().with("LMAXMIX", 4).with("LORBIT", 11);
    }

    Pipeline::from_stages(
        "hubbard_u",
        vec![
            Stage::vasp(
                "ground_state",
                static_incar().with("LORBIT", 11).with("LMAXMIX", 4).with("ISPIN", 2),
            )
            .with_retrieve(&["OUTCAR", "CHGCAR", "WAVECAR"]),
            response,
            Stage::hubbard_analysis("analysis", "response"),
        ],
    )
}

/// Bulk relaxation and Miller-index surface enumeration.
pub fn surfaces(max_index: u32) -> Pipeline {
    Pipeline::from_stages(
        "surfaces",
        vec![
            Stage::vasp("relax", relax_incar()),
            Stage::surface_enumeration("surfaces", max_index).with_structure_from("relax"),
        ],
    )
}

fn namelist(entries: &[(&str, IncarValue)]) -> BTreeMap<String, IncarValue> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Quantum ESPRESSO variable-cell relaxation and static run.
pub fn qe_relax_scf() -> Pipeline {
    let mut relax = QeParameters::new();
    relax.insert(
        "CONTROL".to_string(),
        namelist(&[("calculation", "vc-relax".into())]),
    );
    relax.insert(
        "SYSTEM".to_string(),
        namelist(&[("ecutwfc", 50.0_f64.into()), ("ecutrho", 400.0_f64.into())]),
    );

    let mut scf = relax.clone();
    scf.insert(
        "CONTROL".to_string(),
        namelist(&[("calculation", "scf".into())]),
    );

    Pipeline::from_stages(
        "qe_relax_scf",
        vec![
            Stage::qe("relax", relax),
            Stage::qe("scf", scf).with_structure_from("relax"),
        ],
    )
}
