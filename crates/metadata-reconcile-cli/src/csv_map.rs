//! Adds `<column>_value` label columns to exported CSV files.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use metadata_reconcile_core::LabelLookup;
use serde::Serialize;
use walkdir::WalkDir;

/// Files whose name contains this marker are treated as earlier output.
const MAPPED_MARKER: &str = "mapped";
const CSV_EXTENSION: &str = ".csv";
const GZIP_CSV_EXTENSION: &str = ".csv.gz";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MappedFile {
    pub input: PathBuf,
    pub output: PathBuf,
    pub rows: usize,
    pub added_columns: Vec<String>,
    pub missing_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailedFile {
    pub input: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MapSummary {
    pub mapped: Vec<MappedFile>,
    pub failed: Vec<FailedFile>,
}

/// Plain and gzipped CSV files under `input_dir`, sorted, excluding earlier
/// output.
#[must_use]
pub fn discover_inputs(input_dir: &Path) -> Vec<PathBuf> {
    let mut inputs = Vec::new();

    for entry in WalkDir::new(input_dir).sort_by_file_name().into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.contains(MAPPED_MARKER) {
            continue;
        }
        if name.ends_with(CSV_EXTENSION) || name.ends_with(GZIP_CSV_EXTENSION) {
            inputs.push(entry.path().to_path_buf());
        }
    }

    inputs
}

fn is_gzip(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name.to_string_lossy().ends_with(GZIP_CSV_EXTENSION))
}

/// `<stem><suffix>.csv` next to `input`; output is never compressed.
#[must_use]
pub fn output_path(input: &Path, suffix: &str) -> PathBuf {
    let name =
        input.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
    let stem = name
        .strip_suffix(GZIP_CSV_EXTENSION)
        .or_else(|| name.strip_suffix(CSV_EXTENSION))
        .unwrap_or(name.as_str());
    input.with_file_name(format!("{stem}{suffix}{CSV_EXTENSION}"))
}

fn open_input(input: &Path) -> Result<csv::Reader<Box<dyn Read>>> {
    let file = File::open(input).with_context(|| format!("failed to open {}", input.display()))?;
    let source: Box<dyn Read> =
        if is_gzip(input) { Box::new(GzDecoder::new(file)) } else { Box::new(file) };
    Ok(csv::ReaderBuilder::new().from_reader(source))
}

/// Map every CSV under `input_dir`. A failing file is logged and reported; the
/// remaining files are still processed.
#[must_use]
pub fn map_directory(
    input_dir: &Path,
    columns: &[String],
    suffix: &str,
    lookup: &LabelLookup,
) -> MapSummary {
    let mut summary = MapSummary::default();

    for input in discover_inputs(input_dir) {
        match map_file(&input, columns, suffix, lookup) {
            Ok(mapped) => summary.mapped.push(mapped),
            Err(err) => {
                let error = format!("{err:#}");
                tracing::error!(file = %input.display(), error = %error, "failed to map file");
                summary.failed.push(FailedFile { input, error });
            }
        }
    }

    tracing::info!(
        mapped = summary.mapped.len(),
        failed = summary.failed.len(),
        "identifier mapping completed"
    );
    summary
}

/// # Errors
/// Returns an error when the input cannot be read or the output written.
pub fn map_file(
    input: &Path,
    columns: &[String],
    suffix: &str,
    lookup: &LabelLookup,
) -> Result<MappedFile> {
    tracing::info!(file = %input.display(), "processing file");

    let mut reader = open_input(input)?;
    let headers = reader.headers().context("failed to read CSV header")?.clone();

    let mut selected = Vec::new();
    let mut missing_columns = Vec::new();
    for column in columns {
        match headers.iter().position(|header| header == column) {
            Some(index) => selected.push((index, format!("{column}_value"))),
            None => {
                tracing::warn!(
                    file = %input.display(),
                    column = %column,
                    "column not found; skipping"
                );
                missing_columns.push(column.clone());
            }
        }
    }

    let output = output_path(input, suffix);
    let mut writer = csv::Writer::from_path(&output)
        .with_context(|| format!("failed to create {}", output.display()))?;

    let mut header_out = headers.clone();
    for (_, name) in &selected {
        header_out.push_field(name);
    }
    writer.write_record(&header_out)?;

    let mut rows = 0;
    for record in reader.records() {
        let mut record = record.with_context(|| format!("malformed row in {}", input.display()))?;
        let mapped = selected
            .iter()
            .map(|(index, _)| lookup.map_cell(record.get(*index).unwrap_or_default()))
            .collect::<Vec<_>>();
        for cell in &mapped {
            record.push_field(cell);
        }
        writer.write_record(&record)?;
        rows += 1;
    }
    writer.flush().with_context(|| format!("failed to flush {}", output.display()))?;

    let added_columns = selected.into_iter().map(|(_, name)| name).collect::<Vec<_>>();
    for column in &added_columns {
        tracing::info!(file = %input.display(), column = %column, "added column");
    }
    tracing::info!(output = %output.display(), rows, "saved mapped CSV");

    Ok(MappedFile { input: input.to_path_buf(), output, rows, added_columns, missing_columns })
}
