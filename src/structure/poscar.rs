//! POSCAR Reader/Writer
//!
//! Reads and writes the VASP lattice format used for pipeline input
//! structures.
//!
//! ```text
//! Si bulk                 <- comment (VASP 4: species names live here)
//!    1.0                  <- scale; negative means target volume (Å³)
//!    0.0  2.715  2.715    <- lattice vectors, one per line
//!    2.715  0.0  2.715
//!    2.715  2.715  0.0
//!    Si                   <- species (VASP 5 only)
//!    2                    <- counts
//! Selective dynamics      <- optional
//! Direct                  <- or Cartesian
//!   0.00 0.00 0.00 T T T
//!   0.25 0.25 0.25 T T T
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use log::debug;
use thiserror::Error;

use super::{inverse, row_times, Structure};

#[derive(Debug, Error)]
pub enum PoscarError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error on line {line}: {kind}")]
    Parse {
        line: usize,
        kind: PoscarParseErrorKind,
    },
    #[error("Inconsistent data: {0}")]
    Inconsistency(String),
    #[error("Unexpected end of file while reading {0}")]
    MissingRecord(String),
}

#[derive(Debug, Error)]
pub enum PoscarParseErrorKind {
    #[error("Invalid float (value: '{0}')")]
    InvalidFloat(String),
    #[error("Invalid atom count (value: '{0}')")]
    InvalidCount(String),
    #[error("Expected at least {expected} values, found {found}")]
    TooFewValues { expected: usize, found: usize },
    #[error("Unknown coordinate mode '{0}' (expected Direct or Cartesian)")]
    UnknownCoordinateMode(String),
    #[error("Invalid selective dynamics flag '{0}' (expected T or F)")]
    InvalidFlag(String),
}

/// Common interface for structure file formats.
pub trait StructureFile {
    /// The error type for I/O operations.
    type Error: std::error::Error + From<io::Error>;

    /// Reads a structure from a buffered reader.
    fn read_from(reader: &mut impl BufRead) -> Result<Structure, Self::Error>;

    /// Writes a structure to a writer.
    fn write_to(structure: &Structure, writer: &mut impl Write) -> Result<(), Self::Error>;

    /// Reads a structure from a file path.
    fn read_from_path<P: AsRef<Path>>(path: P) -> Result<Structure, Self::Error> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::read_from(&mut reader)
    }

    /// Writes a structure to a file path.
    fn write_to_path<P: AsRef<Path>>(structure: &Structure, path: P) -> Result<(), Self::Error> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        Self::write_to(structure, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

pub struct PoscarFile;

struct Lines {
    lines: Vec<String>,
    next: usize,
}

impl Lines {
    /// Returns the next line and its 1-based number.
    fn take(&mut self, what: &str) -> Result<(usize, &str), PoscarError> {
        let index = self.next;
        let line = self
            .lines
            .get(index)
            .ok_or_else(|| PoscarError::MissingRecord(what.to_string()))?;
        self.next += 1;
        Ok((index + 1, line.as_str()))
    }

    fn peek(&self) -> Option<&str> {
        self.lines.get(self.next).map(|s| s.as_str())
    }
}

fn parse_float(line: usize, token: &str) -> Result<f64, PoscarError> {
    token.parse::<f64>().map_err(|_| PoscarError::Parse {
        line,
        kind: PoscarParseErrorKind::InvalidFloat(token.to_string()),
    })
}

fn parse_triplet(line: usize, text: &str) -> Result<[f64; 3], PoscarError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() < 3 {
        return Err(PoscarError::Parse {
            line,
            kind: PoscarParseErrorKind::TooFewValues {
                expected: 3,
                found: tokens.len(),
            },
        });
    }
    Ok([
        parse_float(line, tokens[0])?,
        parse_float(line, tokens[1])?,
        parse_float(line, tokens[2])?,
    ])
}

fn parse_flag(line: usize, token: &str) -> Result<bool, PoscarError> {
    match token {
        "T" | "t" | ".TRUE." | ".true." => Ok(true),
        "F" | "f" | ".FALSE." | ".false." => Ok(false),
        other => Err(PoscarError::Parse {
            line,
            kind: PoscarParseErrorKind::InvalidFlag(other.to_string()),
        }),
    }
}

/// Strips POTCAR hash suffixes such as `Ni_pv/a1b2c3`.
fn clean_species(token: &str) -> String {
    token.split('/').next().unwrap_or(token).to_string()
}

fn parse_counts(line: usize, text: &str) -> Result<Vec<usize>, PoscarError> {
    text.split_whitespace()
        .map(|t| {
            t.parse::<usize>().map_err(|_| PoscarError::Parse {
                line,
                kind: PoscarParseErrorKind::InvalidCount(t.to_string()),
            })
        })
        .collect()
}

impl StructureFile for PoscarFile {
    type Error = PoscarError;

    fn read_from(reader: &mut impl BufRead) -> Result<Structure, Self::Error> {
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let mut cursor = Lines { lines, next: 0 };

        let (_, comment) = cursor.take("comment line")?;
        let comment = comment.trim().to_string();

        let (scale_line, scale_text) = cursor.take("scaling factor")?;
        let scale_token = scale_text.split_whitespace().next().unwrap_or("");
        let scale = parse_float(scale_line, scale_token)?;
        if scale == 0.0 {
            return Err(PoscarError::Inconsistency(
                "scaling factor must be non-zero".to_string(),
            ));
        }

        let mut lattice = [[0.0; 3]; 3];
        for row in lattice.iter_mut() {
            let (line, text) = cursor.take("lattice vectors")?;
            *row = parse_triplet(line, text)?;
        }

        // VASP 5 puts species names before the counts; VASP 4 only has counts.
        let (line, text) = cursor.take("atom counts")?;
        let first = text.split_whitespace().next().unwrap_or("");
        let (species_names, counts) = if first.parse::<usize>().is_ok() {
            let counts = parse_counts(line, text)?;
            let names: Vec<String> = comment
                .split_whitespace()
                .take(counts.len())
                .map(clean_species)
                .collect();
            if names.len() != counts.len() {
                return Err(PoscarError::Inconsistency(format!(
                    "no species line and the comment names {} of {} species",
                    names.len(),
                    counts.len()
                )));
            }
            debug!("VASP 4 POSCAR, species taken from comment: {:?}", names);
            (names, counts)
        } else {
            let names: Vec<String> = text.split_whitespace().map(clean_species).collect();
            let (count_line, count_text) = cursor.take("atom counts")?;
            (names, parse_counts(count_line, count_text)?)
        };

        if species_names.len() != counts.len() {
            return Err(PoscarError::Inconsistency(format!(
                "{} species names but {} counts",
                species_names.len(),
                counts.len()
            )));
        }

        let total = counts
            .iter()
            .try_fold(0usize, |acc, &n| acc.checked_add(n))
            .ok_or_else(|| PoscarError::Inconsistency("atom counts overflow".to_string()))?;
        if total == 0 {
            return Err(PoscarError::Inconsistency("structure has no atoms".to_string()));
        }

        let selective = matches!(cursor.peek(), Some(l) if l.trim_start().starts_with(&['S', 's'][..]));
        if selective {
            cursor.take("selective dynamics")?;
        }

        let (mode_line, mode_text) = cursor.take("coordinate mode")?;
        let cartesian = match mode_text.trim_start().chars().next() {
            Some('D' | 'd') => false,
            Some('C' | 'c' | 'K' | 'k') => true,
            _ => {
                return Err(PoscarError::Parse {
                    line: mode_line,
                    kind: PoscarParseErrorKind::UnknownCoordinateMode(
                        mode_text.trim().to_string(),
                    ),
                })
            }
        };

        let mut raw_positions = Vec::new();
        let mut flags = Vec::new();
        for _ in 0..total {
            let (line, text) = cursor.take("atomic positions")?;
            raw_positions.push(parse_triplet(line, text)?);

            if selective {
                let tokens: Vec<&str> = text.split_whitespace().collect();
                if tokens.len() < 6 {
                    return Err(PoscarError::Parse {
                        line,
                        kind: PoscarParseErrorKind::TooFewValues {
                            expected: 6,
                            found: tokens.len(),
                        },
                    });
                }
                flags.push([
                    parse_flag(line, tokens[3])?,
                    parse_flag(line, tokens[4])?,
                    parse_flag(line, tokens[5])?,
                ]);
            }
        }

        // A negative scale is the target cell volume.
        let factor = if scale < 0.0 {
            let raw_volume = super::determinant(&lattice).abs();
            if raw_volume < 1e-12 {
                return Err(PoscarError::Inconsistency(
                    "lattice vectors are degenerate".to_string(),
                ));
            }
            (scale.abs() / raw_volume).cbrt()
        } else {
            scale
        };

        for row in lattice.iter_mut() {
            for component in row.iter_mut() {
                *component *= factor;
            }
        }

        let positions = if cartesian {
            let inv = inverse(&lattice).ok_or_else(|| {
                PoscarError::Inconsistency("lattice vectors are degenerate".to_string())
            })?;
            raw_positions
                .iter()
                .map(|p| {
                    let scaled = [p[0] * factor, p[1] * factor, p[2] * factor];
                    row_times(&scaled, &inv)
                })
                .collect()
        } else {
            raw_positions
        };

        let species = species_names
            .iter()
            .zip(&counts)
            .flat_map(|(name, &count)| std::iter::repeat(name.clone()).take(count))
            .collect();

        Ok(Structure {
            comment,
            lattice,
            species,
            positions,
            selective: if selective { Some(flags) } else { None },
        })
    }

    fn write_to(structure: &Structure, writer: &mut impl Write) -> Result<(), Self::Error> {
        if structure.species.len() != structure.positions.len() {
            return Err(PoscarError::Inconsistency(format!(
                "{} species for {} positions",
                structure.species.len(),
                structure.positions.len()
            )));
        }

        let counts = structure.element_counts();

        writeln!(writer, "{}", structure.comment)?;
        writeln!(writer, "   1.0")?;
        for row in &structure.lattice {
            writeln!(writer, "  {:20.12} {:20.12} {:20.12}", row[0], row[1], row[2])?;
        }
        let names: Vec<&str> = counts.iter().map(|(name, _)| name.as_str()).collect();
        let numbers: Vec<String> = counts.iter().map(|(_, n)| n.to_string()).collect();
        writeln!(writer, "   {}", names.join("   "))?;
        writeln!(writer, "   {}", numbers.join("   "))?;

        if structure.selective.is_some() {
            writeln!(writer, "Selective dynamics")?;
        }
        writeln!(writer, "Direct")?;

        // POSCAR requires atoms grouped by species.
        for (element, _) in &counts {
            for (index, species) in structure.species.iter().enumerate() {
                if species != element {
                    continue;
                }
                let p = structure.positions[index];
                write!(writer, "  {:18.12} {:18.12} {:18.12}", p[0], p[1], p[2])?;
                if let Some(flags) = &structure.selective {
                    let f = flags.get(index).copied().unwrap_or([true; 3]);
                    let mark = |b: bool| if b { "T" } else { "F" };
                    write!(writer, "   {} {} {}", mark(f[0]), mark(f[1]), mark(f[2]))?;
                }
                writeln!(writer)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SI_VASP5: &str = "Si bulk
   1.0
     0.000000  2.715000  2.715000
     2.715000  0.000000  2.715000
     2.715000  2.715000  0.000000
   Si
   2
Direct
  0.00 0.00 0.00
  0.25 0.25 0.25
";

    fn read(text: &str) -> Result<Structure, PoscarError> {
        PoscarFile::read_from(&mut Cursor::new(text))
    }

    #[test]
    fn test_read_vasp5() {
        let s = read(SI_VASP5).unwrap();

        assert_eq!(s.comment, "Si bulk");
        assert_eq!(s.species, vec!["Si", "Si"]);
        assert_eq!(s.positions[1], [0.25, 0.25, 0.25]);
        assert!((s.volume() - 2.0 * 2.715f64.powi(3)).abs() < 1e-9);
        assert!(s.selective.is_none());
    }

    #[test]
    fn test_read_vasp4_species_from_comment() {
        let text = "Ni O
 4.17
 1 0 0
 0 1 0
 0 0 1
 1 1
Direct
 0 0 0
 0.5 0.5 0.5
";
        let s = read(text).unwrap();
        assert_eq!(s.species, vec!["Ni", "O"]);
        assert!((s.lattice[0][0] - 4.17).abs() < 1e-12);
    }

    #[test]
    fn test_read_vasp4_without_names_fails() {
        let text = "cell\n1.0\n1 0 0\n0 1 0\n0 0 1\n1 1\nDirect\n0 0 0\n0.5 0.5 0.5\n";
        assert!(matches!(read(text), Err(PoscarError::Inconsistency(_))));
    }

    #[test]
    fn test_negative_scale_sets_volume() {
        let text = "Cu\n-50.0\n1 0 0\n0 1 0\n0 0 1\nCu\n1\nDirect\n0 0 0\n";
        let s = read(text).unwrap();
        assert!((s.volume() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_cartesian_converted_to_fractional() {
        let text = "O2\n2.0\n5 0 0\n0 5 0\n0 0 5\nO\n2\nCartesian\n0 0 0\n1.25 2.5 0.0\n";
        let s = read(text).unwrap();

        // lattice = 10 Å cubic, cartesian scaled by 2 -> (2.5, 5, 0)
        assert!((s.positions[1][0] - 0.25).abs() < 1e-12);
        assert!((s.positions[1][1] - 0.5).abs() < 1e-12);
        assert!(s.positions[1][2].abs() < 1e-12);
    }

    #[test]
    fn test_selective_dynamics() {
        let text = "Pt slab
1.0
2.8 0 0
0 2.8 0
0 0 20
Pt
2
Selective dynamics
Direct
0 0 0.1 F F F
0.5 0.5 0.2 T T T
";
        let s = read(text).unwrap();
        let flags = s.selective.unwrap();
        assert_eq!(flags[0], [false, false, false]);
        assert_eq!(flags[1], [true, true, true]);
    }

    #[test]
    fn test_potcar_hash_suffix_is_stripped() {
        let text = SI_VASP5.replace("   Si\n", "   Si/6ce2d5\n");
        let s = read(&text).unwrap();
        assert_eq!(s.species[0], "Si");
    }

    #[test]
    fn test_bad_float_reports_line() {
        let text = SI_VASP5.replace("2.715000  0.000000", "2.7x5000  0.000000");
        match read(&text) {
            Err(PoscarError::Parse { line, .. }) => assert_eq!(line, 4),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_file() {
        let text = "Si\n1.0\n1 0 0\n0 1 0\n";
        assert!(matches!(read(text), Err(PoscarError::MissingRecord(_))));
    }

    #[test]
    fn test_count_beyond_file_length() {
        let text = "cell\n1.0\n1 0 0\n0 1 0\n0 0 1\nSi\n18446744073709551615\nDirect\n0 0 0\n";
        assert!(matches!(read(text), Err(PoscarError::MissingRecord(_))));
    }

    #[test]
    fn test_counts_overflow() {
        let text =
            "cell\n1.0\n1 0 0\n0 1 0\n0 0 1\nSi Ge\n18446744073709551615 1\nDirect\n0 0 0\n";
        match read(text) {
            Err(PoscarError::Inconsistency(msg)) => assert!(msg.contains("overflow")),
            other => panic!("expected inconsistency, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_coordinate_mode() {
        let text = SI_VASP5.replace("Direct", "Reciprocal");
        assert!(matches!(
            read(&text),
            Err(PoscarError::Parse {
                kind: PoscarParseErrorKind::UnknownCoordinateMode(_),
                ..
            })
        ));
    }

    #[test]
    fn test_write_then_read_groups_species() {
        let s = Structure::new(
            "mixed order",
            [[4.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 4.0]],
            vec!["O".to_string(), "Ni".to_string(), "O".to_string()],
            vec![[0.5, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.5, 0.0]],
        );

        let mut buffer = Vec::new();
        PoscarFile::write_to(&s, &mut buffer).unwrap();
        let back = read(std::str::from_utf8(&buffer).unwrap()).unwrap();

        assert_eq!(back.species, vec!["O", "O", "Ni"]);
        assert_eq!(back.formula(), "O2Ni");
        assert!((back.positions[1][1] - 0.5).abs() < 1e-10);
        assert!((back.volume() - 64.0).abs() < 1e-9);
    }

    #[test]
    fn test_write_to_path_and_read_back() {
        use tempfile::tempdir;

        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("POSCAR");

        let mut s = read(SI_VASP5).unwrap();
        s.selective = Some(vec![[true, true, true], [false, true, false]]);
        PoscarFile::write_to_path(&s, &path).unwrap();

        let back = PoscarFile::read_from_path(&path).unwrap();
        assert_eq!(back.selective, s.selective);
        assert_eq!(back.species, s.species);
    }
}
