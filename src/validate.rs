//! Post-run PDF validation.
//!
//! Second line of defense against popup misattribution: open every produced
//! PDF, pull the stock number out of its text, and compare it with the
//! filename stem. Text extraction shells out to `pdftotext`, limited to the
//! first two pages where the header block lives.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use console::style;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{ReferenceStatus, TrackingStore};

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("external tool not found: {0} (install poppler-utils)")]
    ToolNotFound(String),

    #[error("text extraction failed: {0}")]
    ExtractionFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome for one PDF on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileVerdict {
    /// Embedded reference equals the filename stem.
    Match,
    /// Embedded reference differs: the file holds another item's report.
    Mismatch { embedded: String },
    /// No reference found in the text (scan-only or malformed PDF).
    Unreadable,
}

/// Full validation result for a run directory.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub verdicts: BTreeMap<String, FileVerdict>,
    /// References tracked as downloaded with no PDF on disk.
    pub missing: Vec<String>,
    /// PDFs on disk that tracking does not know about.
    pub untracked: Vec<String>,
}

impl ValidationReport {
    pub fn mismatches(&self) -> usize {
        self.verdicts
            .values()
            .filter(|v| matches!(v, FileVerdict::Mismatch { .. }))
            .count()
    }

    pub fn is_clean(&self) -> bool {
        self.mismatches() == 0 && self.missing.is_empty()
    }

    pub fn print(&self) {
        let matched = self
            .verdicts
            .values()
            .filter(|v| matches!(v, FileVerdict::Match))
            .count();
        let unreadable = self
            .verdicts
            .values()
            .filter(|v| matches!(v, FileVerdict::Unreadable))
            .count();

        println!("\nValidation results");
        println!("  Checked    : {}", self.verdicts.len());
        println!("  Matched    : {}", style(matched).green());
        let mismatches = self.mismatches();
        println!(
            "  Mismatched : {}",
            if mismatches > 0 {
                style(mismatches).red().bold()
            } else {
                style(mismatches)
            }
        );
        println!("  Unreadable : {unreadable}");
        println!("  Missing    : {}", self.missing.len());
        println!("  Untracked  : {}", self.untracked.len());

        for (reference, verdict) in &self.verdicts {
            if let FileVerdict::Mismatch { embedded } = verdict {
                println!(
                    "  {} {reference}.pdf contains report for {embedded}",
                    style("MISMATCH").red()
                );
            }
        }
        for reference in &self.missing {
            println!("  {} {reference} tracked as downloaded, no PDF", style("MISSING").yellow());
        }
    }
}

/// Validate every PDF under `<run_dir>/pdfs` against the tracking document.
pub fn validate_run(run_dir: &Path) -> Result<ValidationReport> {
    let pdf_dir = run_dir.join("pdfs");
    let tracking_path = run_dir.join("run_data").join("tracking.json");

    let tracking = if tracking_path.exists() {
        TrackingStore::read_document(&tracking_path)?
    } else {
        warn!(path = %tracking_path.display(), "no tracking document; checking files only");
        BTreeMap::new()
    };

    let mut report = ValidationReport::default();

    for path in pdf_files(&pdf_dir)? {
        let reference = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let verdict = match extract_text(&path) {
            Ok(text) => match extract_reference_from_text(&text) {
                Some(embedded) if embedded == reference => FileVerdict::Match,
                Some(embedded) => FileVerdict::Mismatch { embedded },
                None => FileVerdict::Unreadable,
            },
            Err(ValidateError::ToolNotFound(tool)) => {
                return Err(ValidateError::ToolNotFound(tool).into());
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "extraction failed");
                FileVerdict::Unreadable
            }
        };
        if !tracking.is_empty() && !tracking.contains_key(&reference) {
            report.untracked.push(reference.clone());
        }
        report.verdicts.insert(reference, verdict);
    }

    for (reference, status) in &tracking {
        if *status == Some(ReferenceStatus::Downloaded)
            && !pdf_dir.join(format!("{reference}.pdf")).exists()
        {
            report.missing.push(reference.clone());
        }
    }

    Ok(report)
}

fn pdf_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "pdf") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Extract text from the first two pages of a PDF.
fn extract_text(pdf_path: &Path) -> Result<String, ValidateError> {
    let result = Command::new("pdftotext")
        .arg("-f")
        .arg("1")
        .arg("-l")
        .arg("2")
        .arg(pdf_path)
        .arg("-")
        .output();

    match result {
        Ok(output) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        }
        Ok(output) => Err(ValidateError::ExtractionFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ValidateError::ToolNotFound("pdftotext".to_string()))
        }
        Err(e) => Err(ValidateError::Io(e)),
    }
}

/// Pull the stock/reference number out of report text.
///
/// The report header labels it "Stock #"/"Stock Number"/"Reference"; values
/// are six digits with an optional trailing letter. A bare six-digit token
/// is the last resort.
pub fn extract_reference_from_text(text: &str) -> Option<String> {
    let labeled = [
        r"(?i)Stock\s*#?\s*:?\s*(\d{6}[A-Z]?)",
        r"(?i)Stock\s*Number\s*:?\s*(\d{6}[A-Z]?)",
        r"(?i)Reference\s*:?\s*(\d{6}[A-Z]?)",
        r"(?i)Ref\s*#?\s*:?\s*(\d{6}[A-Z]?)",
    ];
    for pattern in labeled {
        let re = Regex::new(pattern).expect("validator pattern");
        if let Some(captures) = re.captures(text) {
            return Some(captures[1].to_string());
        }
    }

    let fallback = Regex::new(r"\b(\d{6}[A-Z]?)\b").expect("validator pattern");
    fallback.captures(text).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_stock_number_wins() {
        let text = "2021 Ford F-150\nVIN 1FTEW1EP5MKE00000\nStock #: 165199\nOdometer 42000";
        assert_eq!(extract_reference_from_text(text).as_deref(), Some("165199"));
    }

    #[test]
    fn label_variants_are_recognized() {
        for text in [
            "Stock Number: 165200",
            "stock # 165200",
            "Reference: 165200",
            "Ref #: 165200",
        ] {
            assert_eq!(
                extract_reference_from_text(text).as_deref(),
                Some("165200"),
                "failed for {text:?}"
            );
        }
    }

    #[test]
    fn trailing_letter_suffix_is_kept() {
        let text = "Stock #: 165201A";
        assert_eq!(extract_reference_from_text(text).as_deref(), Some("165201A"));
    }

    #[test]
    fn bare_six_digit_token_is_last_resort() {
        let text = "Vehicle valuation report\n165202\nBase value $21,000";
        assert_eq!(extract_reference_from_text(text).as_deref(), Some("165202"));
    }

    #[test]
    fn no_reference_yields_none() {
        assert_eq!(extract_reference_from_text("empty scan page"), None);
    }

    #[test]
    fn report_counts_mismatches() {
        let mut report = ValidationReport::default();
        report.verdicts.insert("A".into(), FileVerdict::Match);
        report.verdicts.insert(
            "B".into(),
            FileVerdict::Mismatch {
                embedded: "C".into(),
            },
        );
        assert_eq!(report.mismatches(), 1);
        assert!(!report.is_clean());
    }
}
