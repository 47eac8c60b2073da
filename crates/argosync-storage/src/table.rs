//! Per-float converted tables.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use argosync_core::{EntityTable, MeasurementRow};
use arrow_array::{ArrayRef, Float64Array, Int32Array, RecordBatch, StringArray, TimestampMicrosecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};

use crate::{encode_parquet, write_atomic};

pub fn entity_table_path(out_root: &Path, dac: &str, key: &str) -> PathBuf {
    out_root.join(dac).join(format!("{key}.parquet"))
}

fn float_column(rows: &[MeasurementRow], f: impl Fn(&MeasurementRow) -> Option<f64>) -> ArrayRef {
    Arc::new(Float64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
}

pub fn entity_table_batch(table: &EntityTable) -> anyhow::Result<RecordBatch> {
    let rows = &table.rows;
    let mut fields = vec![
        Field::new("float_id", DataType::Utf8, false),
        Field::new("cycle_number", DataType::Int32, true),
        Field::new(
            "date_time",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            true,
        ),
        Field::new("latitude", DataType::Float64, true),
        Field::new("longitude", DataType::Float64, true),
        Field::new("pressure_dbar", DataType::Float64, true),
        Field::new("depth_m", DataType::Float64, true),
        Field::new("temperature_c", DataType::Float64, true),
        Field::new("salinity_psu", DataType::Float64, true),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(vec![table.float_id.as_str(); rows.len()])),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.cycle_number).collect::<Vec<_>>(),
        )),
        Arc::new(
            TimestampMicrosecondArray::from(
                rows.iter()
                    .map(|r| r.time.map(|t| t.timestamp_micros()))
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
        float_column(rows, |r| r.latitude),
        float_column(rows, |r| r.longitude),
        float_column(rows, |r| r.pressure_dbar),
        float_column(rows, |r| r.depth_m),
        float_column(rows, |r| r.temperature_c),
        float_column(rows, |r| r.salinity_psu),
    ];

    for var in &table.bgc_vars {
        let idx = var.index();
        fields.push(Field::new(var.column_name(), DataType::Float64, true));
        columns.push(float_column(rows, move |r| r.bgc[idx]));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

/// Write the table for one float, atomically replacing any previous file.
/// Returns the number of bytes written.
pub async fn write_entity_table(path: &Path, table: &EntityTable) -> anyhow::Result<usize> {
    let batch = entity_table_batch(table)?;
    let bytes = encode_parquet(&batch)?;
    write_atomic(path, &bytes).await?;
    Ok(bytes.len())
}
