// src/export/schema.rs

use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field as ArrowField, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

use crate::aggregate::ReportTable;

/// A single output column of the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: DataType,
}

/// Output columns, in file order.
///
/// - payment_date → Utf8 (the API's date bucket, verbatim)
/// - pnr          → Utf8 (entity identifier)
/// - transactions → Float64
/// - channel      → Utf8
pub const REPORT_COLUMNS: [Column; 4] = [
    Column {
        name: "payment_date",
        ty: DataType::Utf8,
    },
    Column {
        name: "pnr",
        ty: DataType::Utf8,
    },
    Column {
        name: "transactions",
        ty: DataType::Float64,
    },
    Column {
        name: "channel",
        ty: DataType::Utf8,
    },
];

pub fn report_schema() -> Arc<ArrowSchema> {
    let fields: Vec<ArrowField> = REPORT_COLUMNS
        .iter()
        .map(|col| ArrowField::new(col.name, col.ty.clone(), /* nullable = */ false))
        .collect();

    Arc::new(ArrowSchema::new(fields))
}

/// Convert the whole table into a single `RecordBatch`.
pub fn to_record_batch(table: &ReportTable) -> arrow::error::Result<RecordBatch> {
    let rows = table.rows();
    let columns: Vec<ArrayRef> = vec![
        string_column(rows.iter().map(|r| r.payment_date.as_str())),
        string_column(rows.iter().map(|r| r.entity_id.as_str())),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.count))),
        string_column(rows.iter().map(|r| r.channel.as_str())),
    ];

    RecordBatch::try_new(report_schema(), columns)
}

fn string_column<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(values))
}
