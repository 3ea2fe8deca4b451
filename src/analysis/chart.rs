//! EOS Charts
//!
//! Samples a Birch–Murnaghan curve and draws it as two stacked ASCII
//! panels: energy vs. volume (with measured points overlaid) and
//! pressure vs. volume. Curves and points can be exchanged as CSV.

use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::eos::{BirchMurnaghan, EosError};
use crate::error::{LegoError, Result};

/// A measured energy/volume point (`volume,energy` CSV row).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct EosPoint {
    pub volume: f64,
    pub energy: f64,
}

#[derive(Serialize)]
struct CurveRow {
    volume: f64,
    energy: f64,
    pressure_gpa: f64,
}

/// Evenly spaced samples of an EOS curve.
#[derive(Debug, Clone, PartialEq)]
pub struct EosCurve {
    pub params: BirchMurnaghan,
    pub volumes: Vec<f64>,
    pub energies: Vec<f64>,
    /// Pressure at each volume (GPa)
    pub pressures: Vec<f64>,
}

impl EosCurve {
    /// Samples `points` volumes from `vmin` to `vmax` inclusive.
    pub fn sample(
        params: BirchMurnaghan,
        vmin: f64,
        vmax: f64,
        points: usize,
    ) -> std::result::Result<Self, EosError> {
        if points < 2 || !(vmin > 0.0) || !(vmax > vmin) || !vmax.is_finite() {
            return Err(EosError::InvalidRange { vmin, vmax, points });
        }

        let step = (vmax - vmin) / (points - 1) as f64;
        let volumes: Vec<f64> = (0..points).map(|i| vmin + i as f64 * step).collect();
        let energies = params.energies(&volumes);
        let pressures = volumes.iter().map(|&v| params.pressure_gpa(v)).collect();

        debug!("Sampled {} EOS points in [{}, {}]", points, vmin, vmax);
        Ok(Self {
            params,
            volumes,
            energies,
            pressures,
        })
    }

    /// Samples ±`fraction` around V0.
    pub fn around_equilibrium(
        params: BirchMurnaghan,
        fraction: f64,
        points: usize,
    ) -> std::result::Result<Self, EosError> {
        Self::sample(
            params,
            params.v0 * (1.0 - fraction),
            params.v0 * (1.0 + fraction),
            points,
        )
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

fn scale(value: f64, min: f64, max: f64, cells: usize) -> usize {
    (((value - min) / (max - min)) * (cells - 1) as f64).round() as usize
}

fn padded_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (min, max) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !min.is_finite() {
        (-1.0, 1.0)
    } else if (max - min).abs() < 1e-12 {
        (min - 1.0, max + 1.0)
    } else {
        (min, max)
    }
}

/// Draws one panel as text lines.
fn draw_panel(
    title: &str,
    xs: &[f64],
    ys: &[f64],
    overlay: &[(f64, f64)],
    x_range: (f64, f64),
    width: usize,
    height: usize,
) -> Vec<String> {
    let (xmin, xmax) = x_range;
    let (ymin, ymax) = padded_range(ys.iter().chain(overlay.iter().map(|(_, y)| y)).copied());
    let mut grid = vec![vec![' '; width]; height];

    let mut plot = |x: f64, y: f64, mark: char| {
        if !(x.is_finite() && y.is_finite()) || x < xmin || x > xmax {
            return;
        }
        let col = scale(x, xmin, xmax, width);
        let row = height - 1 - scale(y, ymin, ymax, height);
        grid[row][col] = mark;
    };

    if ymin < 0.0 && ymax > 0.0 {
        for col in 0..width {
            let x = xmin + (xmax - xmin) * col as f64 / (width - 1) as f64;
            plot(x, 0.0, '-');
        }
    }
    for (&x, &y) in xs.iter().zip(ys) {
        plot(x, y, '*');
    }
    for &(x, y) in overlay {
        plot(x, y, 'o');
    }

    let mut lines = vec![title.to_string()];
    for (i, row) in grid.into_iter().enumerate() {
        let label = if i == 0 {
            format!("{:>11.4}", ymax)
        } else if i == height - 1 {
            format!("{:>11.4}", ymin)
        } else {
            " ".repeat(11)
        };
        lines.push(format!("{} |{}", label, row.into_iter().collect::<String>()));
    }
    lines
}

/// Renders the energy and pressure panels, stacked.
///
/// `points` are drawn as `o` on the energy panel. `width` and `height`
/// are per panel, in characters.
pub fn render_two_panel(
    curve: &EosCurve,
    points: &[EosPoint],
    width: usize,
    height: usize,
) -> String {
    let width = width.max(10);
    let height = height.max(3);
    let x_range = padded_range(curve.volumes.iter().copied());
    let overlay: Vec<(f64, f64)> = points.iter().map(|p| (p.volume, p.energy)).collect();

    let mut lines = draw_panel(
        "E (eV) vs V (Å³)",
        &curve.volumes,
        &curve.energies,
        &overlay,
        x_range,
        width,
        height,
    );
    lines.push(String::new());
    lines.extend(draw_panel(
        "P (GPa) vs V (Å³)",
        &curve.volumes,
        &curve.pressures,
        &[],
        x_range,
        width,
        height,
    ));

    let left = format!("{:.2}", x_range.0);
    let right = format!("{:.2}", x_range.1);
    let gap = (width + 1).saturating_sub(left.chars().count() + right.chars().count());
    lines.push(format!("{} +{}", " ".repeat(11), "-".repeat(width)));
    lines.push(format!("{}  {}{}{}", " ".repeat(11), left, " ".repeat(gap), right));

    let p = &curve.params;
    lines.push(format!(
        "V0 = {:.4} Å³   E0 = {:.6} eV   B0 = {:.2} GPa   B0' = {:.3}",
        p.v0,
        p.e0,
        p.bulk_modulus_gpa(),
        p.b1
    ));

    let mut output = lines.join("\n");
    output.push('\n');
    output
}

/// Writes a sampled curve as `volume,energy,pressure_gpa` CSV.
pub fn write_csv(curve: &EosCurve, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for ((&volume, &energy), &pressure_gpa) in curve
        .volumes
        .iter()
        .zip(&curve.energies)
        .zip(&curve.pressures)
    {
        writer.serialize(CurveRow {
            volume,
            energy,
            pressure_gpa,
        })?;
    }
    writer.flush().map_err(|e| LegoError::io(path, e))?;
    info!("Wrote {} EOS samples to {}", curve.len(), path.display());
    Ok(())
}

/// Reads `volume,energy` points from a CSV file with a header row.
pub fn read_points(path: &Path) -> Result<Vec<EosPoint>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_path(path)?;

    let points = reader
        .deserialize::<EosPoint>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    info!("Read {} EOS points from {}", points.len(), path.display());
    Ok(points)
}

/// Splits points into separate volume and energy series.
pub fn unzip_points(points: &[EosPoint]) -> (Vec<f64>, Vec<f64>) {
    points.iter().map(|p| (p.volume, p.energy)).unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn params() -> BirchMurnaghan {
        BirchMurnaghan::new(40.0, -10.8, 0.6, 4.5)
    }

    #[test]
    fn test_sample_endpoints() {
        let curve = EosCurve::sample(params(), 36.0, 44.0, 5).unwrap();
        assert_eq!(curve.volumes, vec![36.0, 38.0, 40.0, 42.0, 44.0]);
        assert!((curve.energies[2] + 10.8).abs() < 1e-12);
        assert!(curve.pressures[2].abs() < 1e-9);
    }

    #[test]
    fn test_sample_rejects_bad_range() {
        assert!(EosCurve::sample(params(), 44.0, 36.0, 10).is_err());
        assert!(EosCurve::sample(params(), 0.0, 36.0, 10).is_err());
        assert!(EosCurve::sample(params(), 36.0, 44.0, 1).is_err());
    }

    #[test]
    fn test_around_equilibrium() {
        let curve = EosCurve::around_equilibrium(params(), 0.1, 3).unwrap();
        assert!((curve.volumes[0] - 36.0).abs() < 1e-12);
        assert!((curve.volumes[2] - 44.0).abs() < 1e-12);
    }

    #[test]
    fn test_render_two_panel_layout() {
        let curve = EosCurve::sample(params(), 36.0, 44.0, 40).unwrap();
        let points = [
            EosPoint {
                volume: 37.0,
                energy: params().energy(37.0),
            },
            EosPoint {
                volume: 43.0,
                energy: params().energy(43.0),
            },
        ];
        let chart = render_two_panel(&curve, &points, 40, 8);

        assert!(chart.contains("E (eV) vs V (Å³)"));
        assert!(chart.contains("P (GPa) vs V (Å³)"));
        assert!(chart.contains('o'));
        assert!(chart.contains("36.00"));
        assert!(chart.contains("44.00"));
        // Title + rows for each panel, blank separator, axis, labels, summary
        assert_eq!(chart.lines().count(), 2 * (1 + 8) + 1 + 3);
    }

    #[test]
    fn test_render_pressure_zero_line() {
        let curve = EosCurve::sample(params(), 36.0, 44.0, 20).unwrap();
        let chart = render_two_panel(&curve, &[], 30, 6);
        let pressure_panel: Vec<&str> = chart
            .lines()
            .skip_while(|l| !l.starts_with("P (GPa)"))
            .collect();
        assert!(pressure_panel.iter().any(|l| l.contains("--")));
    }

    #[test]
    fn test_csv_write_and_read_points() {
        let temp_dir = tempdir().unwrap();
        let out = temp_dir.path().join("curve.csv");
        let curve = EosCurve::sample(params(), 38.0, 42.0, 3).unwrap();
        write_csv(&curve, &out).unwrap();

        let text = fs::read_to_string(&out).unwrap();
        assert!(text.starts_with("volume,energy,pressure_gpa\n"));
        assert_eq!(text.lines().count(), 4);

        let points = read_points(&out).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[1].volume, 40.0);
    }

    #[test]
    fn test_read_points_with_comments() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("points.csv");
        fs::write(&path, "# Si volume scan\nvolume, energy\n38.0, -10.7\n40.0, -10.8\n").unwrap();

        let points = read_points(&path).unwrap();
        let (volumes, energies) = unzip_points(&points);
        assert_eq!(volumes, vec![38.0, 40.0]);
        assert_eq!(energies, vec![-10.7, -10.8]);
    }

    #[test]
    fn test_read_points_bad_value() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("points.csv");
        fs::write(&path, "volume,energy\nforty,-10.8\n").unwrap();
        assert!(matches!(read_points(&path), Err(LegoError::Csv(_))));
    }
}
