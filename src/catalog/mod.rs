//! Example catalog: scanning demo pipelines and listing them as a table.

pub mod scan;
pub mod table;

pub use scan::{scan_catalog, CatalogEntry, CatalogFilter, Difficulty};
pub use table::{render_table, rows_from_entries, CatalogRow, NO_MATCHES};
