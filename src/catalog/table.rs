//! Catalog Table
//!
//! Fixed-width text rendering of scanned examples, grouped by category.

use super::scan::CatalogEntry;

/// Printed when no example survives the filters.
pub const NO_MATCHES: &str = "No examples matched the given filters.";

const HEADERS: [&str; 4] = ["Category", "Example", "Level", "Description"];
const CATEGORY_WIDTH: usize = 18;
const EXAMPLE_WIDTH: usize = 32;
const LEVEL_WIDTH: usize = 12;
const DESCRIPTION_WIDTH: usize = 60;

/// One table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRow {
    pub category: String,
    pub example: String,
    pub level: String,
    pub description: String,
}

impl From<&CatalogEntry> for CatalogRow {
    fn from(entry: &CatalogEntry) -> Self {
        Self {
            category: entry.category.clone(),
            example: entry.example_name(),
            level: entry.difficulty.clone(),
            description: entry.description.clone(),
        }
    }
}

/// Pads or truncates `s` to exactly `width` characters.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        format!("{:width$}", s, width = width)
    } else {
        let kept: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn format_line(cells: [&str; 4]) -> String {
    let line = format!(
        "{} {} {} {}",
        truncate(cells[0], CATEGORY_WIDTH),
        truncate(cells[1], EXAMPLE_WIDTH),
        truncate(cells[2], LEVEL_WIDTH),
        truncate(cells[3], DESCRIPTION_WIDTH),
    );
    line.trim_end().to_string()
}

/// Renders the table with a header, a rule and an `N example(s)` footer.
///
/// The category cell is left blank when it repeats the previous row's.
pub fn render_table(rows: &[CatalogRow]) -> String {
    let mut output = String::new();
    output.push_str(&format_line(HEADERS));
    output.push('\n');
    output.push_str(&"-".repeat(CATEGORY_WIDTH + EXAMPLE_WIDTH + LEVEL_WIDTH + DESCRIPTION_WIDTH + 3));
    output.push('\n');

    let mut previous: Option<&str> = None;
    for row in rows {
        let category = if previous == Some(row.category.as_str()) {
            ""
        } else {
            row.category.as_str()
        };
        previous = Some(row.category.as_str());

        output.push_str(&format_line([
            category,
            &row.example,
            &row.level,
            &row.description,
        ]));
        output.push('\n');
    }

    output.push_str(&format!("\n{} example(s)\n", rows.len()));
    output
}

/// Converts entries to rows in scan order.
pub fn rows_from_entries(entries: &[CatalogEntry]) -> Vec<CatalogRow> {
    entries.iter().map(CatalogRow::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(category: &str, example: &str) -> CatalogRow {
        CatalogRow {
            category: category.to_string(),
            example: example.to_string(),
            level: "beginner".to_string(),
            description: format!("{} example", example),
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc  ");
        assert_eq!(truncate("abcdefgh", 6), "abc...");
        assert_eq!(truncate("ÅÅÅÅÅÅÅ", 5), "ÅÅ...");
    }

    #[test]
    fn test_repeated_category_blanked() {
        let rows = vec![
            row("01_basics", "si.yaml"),
            row("01_basics", "cu.yaml"),
            row("02_eos", "eos.yaml"),
        ];
        let table = render_table(&rows);
        let lines: Vec<&str> = table.lines().collect();

        assert!(lines[0].starts_with("Category"));
        assert!(lines[2].starts_with("01_basics"));
        assert!(lines[3].starts_with(' '));
        assert!(lines[3].contains("cu.yaml"));
        assert!(lines[4].starts_with("02_eos"));
    }

    #[test]
    fn test_footer_counts_rows() {
        let rows = vec![row("01_basics", "a.yaml"), row("02_eos", "b.yaml")];
        let table = render_table(&rows);
        assert_eq!(table.lines().last(), Some("2 example(s)"));

        let empty = render_table(&[]);
        assert_eq!(empty.lines().last(), Some("0 example(s)"));
    }

    #[test]
    fn test_long_description_truncated() {
        let mut long = row("01_basics", "a.yaml");
        long.description = "x".repeat(100);
        let table = render_table(&[long]);
        let data_line = table.lines().nth(2).unwrap();
        assert!(data_line.ends_with("..."));
        assert!(!data_line.contains(&"x".repeat(DESCRIPTION_WIDTH)));
    }
}
