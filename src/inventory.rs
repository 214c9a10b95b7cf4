//! Inventory CSV parsing.
//!
//! The engine only cares about the reference-number column of the exported
//! inventory; every other column is carried for the operator's benefit and
//! ignored here.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

/// Read the ordered, distinct reference numbers from an exported inventory
/// CSV. `column` is the header name of the reference column.
pub fn read_references(csv_path: &Path, column: &str) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("opening inventory CSV {}", csv_path.display()))?;

    let headers = reader.headers().context("reading CSV headers")?.clone();
    let Some(column_index) = headers.iter().position(|h| h.trim() == column) else {
        bail!(
            "reference column {column:?} not found in {} (headers: {:?})",
            csv_path.display(),
            headers.iter().collect::<Vec<_>>()
        );
    };

    let mut references = Vec::new();
    let mut seen = HashSet::new();
    for record in reader.records() {
        let record = record.context("reading CSV record")?;
        let Some(raw) = record.get(column_index) else {
            continue;
        };
        let reference = raw.trim();
        if reference.is_empty() {
            continue;
        }
        if !seen.insert(reference.to_string()) {
            warn!(reference, "duplicate reference in inventory export, keeping first");
            continue;
        }
        references.push(reference.to_string());
    }

    info!(
        count = references.len(),
        path = %csv_path.display(),
        "extracted reference numbers from inventory"
    );
    Ok(references)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn extracts_reference_column() {
        let file = write_csv(
            "Reference Number,Year,Make\n165199,2021,Ford\n165200,2019,Toyota\n",
        );
        let refs = read_references(file.path(), "Reference Number").unwrap();
        assert_eq!(refs, vec!["165199", "165200"]);
    }

    #[test]
    fn skips_blank_and_duplicate_references() {
        let file = write_csv(
            "Reference Number,Year\n165199,2021\n,2020\n 165199 ,2021\n165201,2018\n",
        );
        let refs = read_references(file.path(), "Reference Number").unwrap();
        assert_eq!(refs, vec!["165199", "165201"]);
    }

    #[test]
    fn missing_column_is_an_error() {
        let file = write_csv("Stock,Year\n165199,2021\n");
        let err = read_references(file.path(), "Reference Number").unwrap_err();
        assert!(err.to_string().contains("Reference Number"));
    }
}
