//! The metadata catalog: one summary row per float in a single Parquet file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use argosync_core::{CatalogRow, Fingerprint};
use arrow_array::{
    Array, Float64Array, RecordBatch, StringArray, TimestampMicrosecondArray, UInt32Array,
    UInt64Array,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::ledger::StoreError;
use crate::{decode_parquet, encode_parquet, typed_column, write_atomic};

pub const CATALOG_FILE_NAME: &str = "argo_meta.parquet";

const STAT_COLUMNS: [&str; 10] = [
    "lat_min", "lat_max", "lon_min", "lon_max", "temp_min", "temp_max", "sal_min", "sal_max",
    "depth_min", "depth_max",
];

#[derive(Debug)]
pub struct CatalogStore {
    path: PathBuf,
    rows: Mutex<BTreeMap<String, CatalogRow>>,
}

impl CatalogStore {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::empty(path));
            }
            Err(err) => {
                return Err(StoreError::Io(
                    anyhow::Error::new(err).context(format!("reading {}", path.display())),
                ))
            }
        };

        let corrupt = |detail: String| StoreError::Corruption {
            path: path.clone(),
            detail,
        };
        let batches = decode_parquet(Bytes::from(bytes)).map_err(|e| corrupt(format!("{e:#}")))?;
        let mut rows = BTreeMap::new();
        for batch in &batches {
            for row in batch_to_rows(batch).map_err(&corrupt)? {
                if rows.insert(row.float_id.clone(), row).is_some() {
                    return Err(corrupt("duplicate float_id rows".to_string()));
                }
            }
        }
        debug!(path = %path.display(), rows = rows.len(), "catalog loaded");
        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, float_id: &str) -> Option<CatalogRow> {
        self.rows.lock().await.get(float_id).cloned()
    }

    pub async fn rows(&self) -> Vec<CatalogRow> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn fingerprints(&self) -> BTreeMap<String, Fingerprint> {
        self.rows
            .lock()
            .await
            .iter()
            .map(|(k, r)| (k.clone(), r.fingerprint.clone()))
            .collect()
    }

    /// Replace (or insert) the row for `row.float_id` and rewrite the file.
    ///
    /// The lock is held across the rewrite so concurrent upserts serialize, and
    /// the in-memory table only changes once the file is safely replaced.
    pub async fn upsert(&self, row: CatalogRow) -> Result<Option<CatalogRow>, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut next = rows.clone();
        let previous = next.insert(row.float_id.clone(), row);

        let batch = rows_to_batch(next.values())?;
        let bytes = encode_parquet(&batch)?;
        write_atomic(&self.path, &bytes).await?;

        *rows = next;
        Ok(previous)
    }
}

fn ts_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

fn catalog_schema() -> Arc<Schema> {
    let mut fields = vec![
        Field::new("float_id", DataType::Utf8, false),
        Field::new("dac", DataType::Utf8, false),
        Field::new("fingerprint", DataType::Utf8, false),
        Field::new("num_profiles", DataType::UInt32, false),
        Field::new("num_rows", DataType::UInt64, false),
        Field::new("date_start", ts_type(), true),
        Field::new("date_end", ts_type(), true),
    ];
    fields.extend(
        STAT_COLUMNS
            .iter()
            .map(|name| Field::new(*name, DataType::Float64, true)),
    );
    fields.extend([
        Field::new("bgc_vars", DataType::Utf8, false),
        Field::new("platform_type", DataType::Utf8, true),
        Field::new("project_name", DataType::Utf8, true),
        Field::new("summary", DataType::Utf8, false),
    ]);
    Arc::new(Schema::new(fields))
}

fn stat_values(row: &CatalogRow) -> [Option<f64>; 10] {
    [
        row.lat_min,
        row.lat_max,
        row.lon_min,
        row.lon_max,
        row.temp_min,
        row.temp_max,
        row.sal_min,
        row.sal_max,
        row.depth_min,
        row.depth_max,
    ]
}

fn rows_to_batch<'a>(
    rows: impl Iterator<Item = &'a CatalogRow> + Clone,
) -> anyhow::Result<RecordBatch> {
    let strings = |f: &dyn Fn(&CatalogRow) -> Option<String>| {
        Arc::new(StringArray::from(rows.clone().map(f).collect::<Vec<_>>())) as Arc<dyn Array>
    };
    let timestamps = |f: &dyn Fn(&CatalogRow) -> Option<DateTime<Utc>>| {
        Arc::new(
            TimestampMicrosecondArray::from(
                rows.clone()
                    .map(|r| f(r).map(|t| t.timestamp_micros()))
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ) as Arc<dyn Array>
    };

    let mut columns = vec![
        strings(&|r: &CatalogRow| Some(r.float_id.clone())),
        strings(&|r: &CatalogRow| Some(r.dac.clone())),
        strings(&|r: &CatalogRow| Some(r.fingerprint.to_string())),
        Arc::new(UInt32Array::from(
            rows.clone().map(|r| r.num_profiles).collect::<Vec<_>>(),
        )) as Arc<dyn Array>,
        Arc::new(UInt64Array::from(
            rows.clone().map(|r| r.num_rows).collect::<Vec<_>>(),
        )) as Arc<dyn Array>,
        timestamps(&|r: &CatalogRow| r.date_start),
        timestamps(&|r: &CatalogRow| r.date_end),
    ];
    for idx in 0..STAT_COLUMNS.len() {
        columns.push(Arc::new(Float64Array::from(
            rows.clone().map(|r| stat_values(r)[idx]).collect::<Vec<_>>(),
        )));
    }
    columns.push(strings(&|r: &CatalogRow| Some(r.bgc_vars.join(", "))));
    columns.push(strings(&|r: &CatalogRow| r.platform_type.clone()));
    columns.push(strings(&|r: &CatalogRow| r.project_name.clone()));
    columns.push(strings(&|r: &CatalogRow| Some(r.summary.clone())));

    Ok(RecordBatch::try_new(catalog_schema(), columns)?)
}

fn opt_string(col: &StringArray, i: usize) -> Option<String> {
    (!col.is_null(i)).then(|| col.value(i).to_string())
}

fn opt_f64(col: &Float64Array, i: usize) -> Option<f64> {
    (!col.is_null(i)).then(|| col.value(i))
}

fn opt_ts(col: &TimestampMicrosecondArray, i: usize) -> Result<Option<DateTime<Utc>>, String> {
    if col.is_null(i) {
        return Ok(None);
    }
    DateTime::<Utc>::from_timestamp_micros(col.value(i))
        .map(Some)
        .ok_or_else(|| format!("row {i} has out-of-range timestamp"))
}

fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<CatalogRow>, String> {
    let float_ids = typed_column::<StringArray>(batch, "float_id")?;
    let dacs = typed_column::<StringArray>(batch, "dac")?;
    let fingerprints = typed_column::<StringArray>(batch, "fingerprint")?;
    let num_profiles = typed_column::<UInt32Array>(batch, "num_profiles")?;
    let num_rows = typed_column::<UInt64Array>(batch, "num_rows")?;
    let date_start = typed_column::<TimestampMicrosecondArray>(batch, "date_start")?;
    let date_end = typed_column::<TimestampMicrosecondArray>(batch, "date_end")?;
    let stats = STAT_COLUMNS
        .iter()
        .map(|name| typed_column::<Float64Array>(batch, name))
        .collect::<Result<Vec<_>, _>>()?;
    let bgc_vars = typed_column::<StringArray>(batch, "bgc_vars")?;
    let platform_types = typed_column::<StringArray>(batch, "platform_type")?;
    let project_names = typed_column::<StringArray>(batch, "project_name")?;
    let summaries = typed_column::<StringArray>(batch, "summary")?;

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        if float_ids.is_null(i) || fingerprints.is_null(i) {
            return Err(format!("row {i} is missing float_id or fingerprint"));
        }
        let stat = |idx: usize| opt_f64(stats[idx], i);
        out.push(CatalogRow {
            float_id: float_ids.value(i).to_string(),
            dac: opt_string(dacs, i).unwrap_or_default(),
            fingerprint: Fingerprint::from_hex(fingerprints.value(i)),
            num_profiles: num_profiles.value(i),
            num_rows: num_rows.value(i),
            date_start: opt_ts(date_start, i)?,
            date_end: opt_ts(date_end, i)?,
            lat_min: stat(0),
            lat_max: stat(1),
            lon_min: stat(2),
            lon_max: stat(3),
            temp_min: stat(4),
            temp_max: stat(5),
            sal_min: stat(6),
            sal_max: stat(7),
            depth_min: stat(8),
            depth_max: stat(9),
            bgc_vars: opt_string(bgc_vars, i)
                .map(|s| {
                    s.split(", ")
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            platform_type: opt_string(platform_types, i),
            project_name: opt_string(project_names, i),
            summary: opt_string(summaries, i).unwrap_or_default(),
        });
    }
    Ok(out)
}
