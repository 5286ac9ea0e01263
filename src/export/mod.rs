// src/export/mod.rs

pub mod schema;

use anyhow::{Context, Result};
use arrow::csv::WriterBuilder;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rust_xlsxwriter::{Format, Workbook};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::info;

use crate::aggregate::ReportTable;
pub use schema::{report_schema, to_record_batch, REPORT_COLUMNS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ExportFormat {
    /// Excel workbook with a single sheet.
    #[default]
    Xlsx,
    /// Comma-separated values with a header row.
    Csv,
    /// Snappy-compressed Parquet.
    Parquet,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Xlsx => "xlsx",
            ExportFormat::Csv => "csv",
            ExportFormat::Parquet => "parquet",
        }
    }
}

/// `amplitude_data_<start>_<end>.<ext>`
pub fn file_name(start: NaiveDate, end: NaiveDate, format: ExportFormat) -> String {
    format!(
        "amplitude_data_{}_{}.{}",
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d"),
        format.extension()
    )
}

/// Serialize `table` in memory.
pub fn export_bytes(table: &ReportTable, format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Xlsx => workbook_bytes(table),
        ExportFormat::Csv => {
            let batch = to_record_batch(table).context("building report batch")?;
            let mut buffer = Vec::new();
            let mut writer = WriterBuilder::new().with_header(true).build(&mut buffer);
            writer.write(&batch).context("writing CSV")?;
            drop(writer);
            Ok(buffer)
        }
        ExportFormat::Parquet => {
            let batch = to_record_batch(table).context("building report batch")?;
            let mut buffer = Vec::new();
            let props = WriterProperties::builder()
                .set_compression(Compression::SNAPPY)
                .build();
            let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))
                .context("creating parquet writer")?;
            writer.write(&batch).context("writing parquet batch")?;
            writer.close().context("closing parquet writer")?;
            Ok(buffer)
        }
    }
}

fn workbook_bytes(table: &ReportTable) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    let header = Format::new().set_bold();

    for (col, column) in (0u16..).zip(REPORT_COLUMNS.iter()) {
        sheet
            .write_string_with_format(0, col, column.name, &header)
            .context("writing header")?;
    }
    for (i, row) in table.iter().enumerate() {
        let r = u32::try_from(i + 1).context("too many rows for a worksheet")?;
        sheet.write_string(r, 0, &row.payment_date)?;
        sheet.write_string(r, 1, &row.entity_id)?;
        sheet.write_number(r, 2, row.count)?;
        sheet.write_string(r, 3, &row.channel)?;
    }

    workbook.save_to_buffer().context("writing workbook")
}

/// Write the report under `dir`, named after the date range.
///
/// The bytes go to a dot-prefixed temp file first and are renamed over the
/// final name, so a reader never sees a half-written report.
pub fn write_report(
    table: &ReportTable,
    dir: impl AsRef<Path>,
    start: NaiveDate,
    end: NaiveDate,
    format: ExportFormat,
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let name = file_name(start, end, format);
    let path = dir.join(&name);
    let bytes = export_bytes(table, format)?;

    let tmp_path = dir.join(format!(".{}.tmp", name));
    let mut tmp = fs::File::create(&tmp_path)
        .map_err(|e| io::Error::new(e.kind(), format!("creating {:?}: {}", tmp_path, e)))?;
    tmp.write_all(&bytes)?;
    tmp.sync_all()?;

    fs::rename(&tmp_path, &path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("renaming {:?} -> {:?}: {}", tmp_path, path, e),
        )
    })?;

    info!(path = %path.display(), rows = table.len(), bytes = bytes.len(), "report written");
    Ok(path)
}
