//! Payload decoding and per-float conversion into a table plus summary stats.
//!
//! Everything here is a pure function of the payload bytes so a float can be
//! re-converted at any time with identical output.

use std::collections::{BTreeSet, HashMap};

use argosync_core::{
    BgcVariable, CatalogRow, DecodeError, EntityTable, FileKind, Fingerprint, MeasurementRow,
};
use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

use crate::netcdf::NcFile;

/// Epoch of `JULD` when a file carries no `REFERENCE_DATE_TIME`.
pub const DEFAULT_REFERENCE_DATE: &str = "19500101000000";

/// The fetched files of one float.
#[derive(Debug, Clone)]
pub struct RawPayloads {
    pub meta: Bytes,
    pub profile: Bytes,
    pub extended: Option<Bytes>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FloatMetadata {
    pub platform_type: Option<String>,
    pub project_name: Option<String>,
    pub launch_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedProfiles {
    pub rows: Vec<MeasurementRow>,
    pub bgc_vars: Vec<BgcVariable>,
}

/// Turns raw payload bytes into typed records.
pub trait PayloadDecoder: Send + Sync {
    fn decode_metadata(&self, file: &str, bytes: &[u8]) -> Result<FloatMetadata, DecodeError>;

    /// Decode every profile level. With `with_bgc` the biogeochemical
    /// variables present in the file are extracted as well.
    fn decode_profiles(
        &self,
        file: &str,
        bytes: &[u8],
        with_bgc: bool,
    ) -> Result<DecodedProfiles, DecodeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetcdfDecoder;

pub fn parse_argo_date(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text.trim(), "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn open<'a>(file: &str, bytes: &'a [u8]) -> Result<NcFile<'a>, DecodeError> {
    NcFile::parse(bytes).map_err(|e| DecodeError::new(file, e.to_string()))
}

fn read_column(
    nc: &NcFile<'_>,
    file: &str,
    name: &str,
    expected_len: usize,
) -> Result<Vec<Option<f64>>, DecodeError> {
    let values = nc
        .read_f64(name)
        .map_err(|e| DecodeError::new(file, e.to_string()))?;
    if values.len() != expected_len {
        return Err(DecodeError::new(
            file,
            format!("{name} has {} values, expected {expected_len}", values.len()),
        ));
    }
    Ok(values)
}

fn first_text(nc: &NcFile<'_>, name: &str) -> Option<String> {
    nc.read_text(name)
        .ok()?
        .into_iter()
        .find(|s| !s.is_empty())
}

impl PayloadDecoder for NetcdfDecoder {
    fn decode_metadata(&self, file: &str, bytes: &[u8]) -> Result<FloatMetadata, DecodeError> {
        let nc = open(file, bytes)?;
        Ok(FloatMetadata {
            platform_type: first_text(&nc, "PLATFORM_TYPE"),
            project_name: first_text(&nc, "PROJECT_NAME"),
            launch_date: first_text(&nc, "LAUNCH_DATE").and_then(|s| parse_argo_date(&s)),
        })
    }

    fn decode_profiles(
        &self,
        file: &str,
        bytes: &[u8],
        with_bgc: bool,
    ) -> Result<DecodedProfiles, DecodeError> {
        let nc = open(file, bytes)?;
        let dim = |name: &str| {
            nc.dimension_len(name)
                .ok_or_else(|| DecodeError::new(file, format!("missing dimension {name}")))
        };
        let n_prof = dim("N_PROF")?;
        let n_levels = dim("N_LEVELS")?;
        let cells = n_prof
            .checked_mul(n_levels)
            .ok_or_else(|| DecodeError::new(file, "profile grid too large"))?;

        let cycles = read_column(&nc, file, "CYCLE_NUMBER", n_prof)?;
        let juld = read_column(&nc, file, "JULD", n_prof)?;
        let latitude = read_column(&nc, file, "LATITUDE", n_prof)?;
        let longitude = read_column(&nc, file, "LONGITUDE", n_prof)?;
        let pressure = read_column(&nc, file, "PRES", cells)?;
        let optional = |name: &str| -> Result<Vec<Option<f64>>, DecodeError> {
            if nc.has_variable(name) {
                read_column(&nc, file, name, cells)
            } else {
                Ok(vec![None; cells])
            }
        };
        let temperature = optional("TEMP")?;
        let salinity = optional("PSAL")?;

        let mut bgc_vars = Vec::new();
        let mut bgc_columns = Vec::new();
        if with_bgc {
            for var in BgcVariable::ALL {
                if nc.has_variable(var.variable_name()) {
                    bgc_columns.push((var, read_column(&nc, file, var.variable_name(), cells)?));
                    bgc_vars.push(var);
                }
            }
        }

        let reference = first_text(&nc, "REFERENCE_DATE_TIME")
            .and_then(|s| parse_argo_date(&s))
            .or_else(|| parse_argo_date(DEFAULT_REFERENCE_DATE));

        let mut rows = Vec::with_capacity(cells);
        for p in 0..n_prof {
            let time = match (reference, juld[p]) {
                (Some(reference), Some(days)) => reference
                    .checked_add_signed(Duration::microseconds((days * 86_400_000_000.0).round() as i64)),
                _ => None,
            };
            let lat = latitude[p];
            for l in 0..n_levels {
                let idx = p * n_levels + l;
                let pres = pressure[idx];
                let mut bgc = [None; 6];
                for (var, values) in &bgc_columns {
                    bgc[var.index()] = values[idx];
                }
                rows.push(MeasurementRow {
                    cycle_number: cycles[p].map(|c| c as i32),
                    time,
                    latitude: lat,
                    longitude: longitude[p],
                    pressure_dbar: pres,
                    depth_m: pres.zip(lat).map(|(p, lat)| depth_from_pressure(p, lat)),
                    temperature_c: temperature[idx],
                    salinity_psu: salinity[idx],
                    bgc,
                });
            }
        }

        Ok(DecodedProfiles { rows, bgc_vars })
    }
}

/// Depth in metres from sea pressure and latitude (UNESCO 1983, Fofonoff & Millard).
pub fn depth_from_pressure(pressure_dbar: f64, latitude: f64) -> f64 {
    let x = (latitude / 57.29578).sin().powi(2);
    let gravity = 9.780318 * (1.0 + (5.2788e-3 + 2.36e-5 * x) * x) + 1.092e-6 * pressure_dbar;
    (((-1.82e-15 * pressure_dbar + 2.279e-10) * pressure_dbar - 2.2512e-5) * pressure_dbar
        + 9.72659)
        * pressure_dbar
        / gravity
}

/// Drop levels missing two or more of pressure, temperature and salinity, and
/// levels with no position at all.
fn is_usable(row: &MeasurementRow) -> bool {
    let missing = [row.pressure_dbar, row.temperature_c, row.salinity_psu]
        .iter()
        .filter(|v| v.is_none())
        .count();
    missing < 2 && (row.latitude.is_some() || row.longitude.is_some())
}

type MergeKey = (Option<i32>, Option<i64>, Option<u64>, Option<u64>, Option<u64>);

fn merge_key(row: &MeasurementRow) -> MergeKey {
    (
        row.cycle_number,
        row.time.map(|t| t.timestamp_micros()),
        row.latitude.map(f64::to_bits),
        row.longitude.map(f64::to_bits),
        row.pressure_dbar.map(f64::to_bits),
    )
}

/// Keep the last row for each (cycle, time, position, pressure), preserving
/// the order of the surviving rows.
fn dedup_keep_last(rows: Vec<MeasurementRow>) -> Vec<MeasurementRow> {
    let mut last = HashMap::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        last.insert(merge_key(row), i);
    }
    rows.into_iter()
        .enumerate()
        .filter(|(i, row)| last.get(&merge_key(row)) == Some(i))
        .map(|(_, row)| row)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryStats {
    pub num_profiles: u32,
    pub num_rows: u64,
    pub date_start: Option<DateTime<Utc>>,
    pub date_end: Option<DateTime<Utc>>,
    pub lat_min: Option<f64>,
    pub lat_max: Option<f64>,
    pub lon_min: Option<f64>,
    pub lon_max: Option<f64>,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub sal_min: Option<f64>,
    pub sal_max: Option<f64>,
    pub depth_min: Option<f64>,
    pub depth_max: Option<f64>,
    pub bgc_vars: Vec<BgcVariable>,
    pub platform_type: Option<String>,
    pub project_name: Option<String>,
    pub summary: String,
}

impl SummaryStats {
    pub fn to_catalog_row(&self, float_id: &str, dac: &str, fingerprint: Fingerprint) -> CatalogRow {
        CatalogRow {
            float_id: float_id.to_string(),
            dac: dac.to_string(),
            fingerprint,
            num_profiles: self.num_profiles,
            num_rows: self.num_rows,
            date_start: self.date_start,
            date_end: self.date_end,
            lat_min: self.lat_min,
            lat_max: self.lat_max,
            lon_min: self.lon_min,
            lon_max: self.lon_max,
            temp_min: self.temp_min,
            temp_max: self.temp_max,
            sal_min: self.sal_min,
            sal_max: self.sal_max,
            depth_min: self.depth_min,
            depth_max: self.depth_max,
            bgc_vars: self
                .bgc_vars
                .iter()
                .map(|v| v.column_name().to_string())
                .collect(),
            platform_type: self.platform_type.clone(),
            project_name: self.project_name.clone(),
            summary: self.summary.clone(),
        }
    }
}

fn min_max(values: impl Iterator<Item = f64>) -> (Option<f64>, Option<f64>) {
    values.fold((None, None), |(lo, hi): (Option<f64>, Option<f64>), v| {
        (
            Some(lo.map_or(v, |lo| lo.min(v))),
            Some(hi.map_or(v, |hi| hi.max(v))),
        )
    })
}

fn bgc_label(var: BgcVariable) -> &'static str {
    match var {
        BgcVariable::Doxy => "dissolved oxygen",
        BgcVariable::PhInSituTotal => "pH",
        BgcVariable::Chla => "chlorophyll-a",
        BgcVariable::Bbp700 => "backscatter at 700 nm",
        BgcVariable::Nitrate => "nitrate",
        BgcVariable::DownwellingPar => "downwelling PAR",
    }
}

fn fmt_value(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.2}"))
        .unwrap_or_else(|| "n/a".to_string())
}

fn fmt_date(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "n/a".to_string())
}

fn summary_text(float_id: &str, stats: &SummaryStats) -> String {
    let mut variables = vec!["temperature", "salinity"];
    variables.extend(stats.bgc_vars.iter().map(|v| bgc_label(*v)));
    let tail = if stats.bgc_vars.is_empty() {
        "Core variables only."
    } else {
        "Includes BGC parameters."
    };
    format!(
        "Float {float_id} recorded {} cycles from {} to {}. \
         It covered latitudes from {}° to {}° and longitudes from {}° to {}°. \
         Measured variables include {}. \
         Temperature ranged from {}°C to {}°C, salinity from {} to {} psu, \
         depth from {} m to {} m. {tail}",
        stats.num_profiles,
        fmt_date(stats.date_start),
        fmt_date(stats.date_end),
        fmt_value(stats.lat_min),
        fmt_value(stats.lat_max),
        fmt_value(stats.lon_min),
        fmt_value(stats.lon_max),
        variables.join(", "),
        fmt_value(stats.temp_min),
        fmt_value(stats.temp_max),
        fmt_value(stats.sal_min),
        fmt_value(stats.sal_max),
        fmt_value(stats.depth_min),
        fmt_value(stats.depth_max),
    )
}

pub fn summarize(table: &EntityTable, meta: &FloatMetadata) -> SummaryStats {
    let rows = &table.rows;
    let range = |field: fn(&MeasurementRow) -> Option<f64>| min_max(rows.iter().filter_map(field));
    let (lat_min, lat_max) = range(|r| r.latitude);
    let (lon_min, lon_max) = range(|r| r.longitude);
    let (temp_min, temp_max) = range(|r| r.temperature_c);
    let (sal_min, sal_max) = range(|r| r.salinity_psu);
    let (depth_min, depth_max) = range(|r| r.depth_m);

    let mut stats = SummaryStats {
        num_profiles: rows
            .iter()
            .filter_map(|r| r.cycle_number)
            .collect::<BTreeSet<_>>()
            .len() as u32,
        num_rows: rows.len() as u64,
        date_start: rows.iter().filter_map(|r| r.time).min(),
        date_end: rows.iter().filter_map(|r| r.time).max(),
        lat_min,
        lat_max,
        lon_min,
        lon_max,
        temp_min,
        temp_max,
        sal_min,
        sal_max,
        depth_min,
        depth_max,
        bgc_vars: table.bgc_vars.clone(),
        platform_type: meta.platform_type.clone(),
        project_name: meta.project_name.clone(),
        summary: String::new(),
    };
    stats.summary = summary_text(&table.float_id, &stats);
    stats
}

/// Convert the payloads of float `key`. Extended-profile rows replace
/// profile rows observed at the same cycle, time, position and pressure.
pub fn convert(
    decoder: &dyn PayloadDecoder,
    key: &str,
    payloads: &RawPayloads,
) -> Result<(EntityTable, SummaryStats), DecodeError> {
    let meta = decoder.decode_metadata(&FileKind::Meta.file_name(key), &payloads.meta)?;
    let profile =
        decoder.decode_profiles(&FileKind::Profile.file_name(key), &payloads.profile, false)?;

    let mut rows = profile.rows.into_iter().filter(is_usable).collect::<Vec<_>>();
    let mut bgc_vars = Vec::new();
    if let Some(extended) = &payloads.extended {
        let decoded = decoder.decode_profiles(
            &FileKind::ExtendedProfile.file_name(key),
            extended,
            true,
        )?;
        rows.extend(decoded.rows.into_iter().filter(is_usable));
        rows = dedup_keep_last(rows);
        bgc_vars = decoded.bgc_vars;
    }

    let table = EntityTable {
        float_id: key.to_string(),
        bgc_vars,
        rows,
    };
    let stats = summarize(&table, &meta);
    Ok((table, stats))
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Argo-shaped NetCDF payloads for tests.

    use super::*;
    use crate::netcdf::testing::NcBuilder;
    use crate::netcdf::NcValues;

    pub(crate) const FILL: f32 = 99999.0;

    #[derive(Debug, Clone)]
    pub(crate) struct ProfileFixture {
        pub(crate) cycles: Vec<i32>,
        pub(crate) juld: Vec<f64>,
        pub(crate) latitude: Vec<f64>,
        pub(crate) longitude: Vec<f64>,
        pub(crate) levels: usize,
        pub(crate) pres: Vec<f32>,
        pub(crate) temp: Vec<f32>,
        pub(crate) psal: Vec<f32>,
        pub(crate) bgc: Vec<(BgcVariable, Vec<f32>)>,
    }

    impl ProfileFixture {
        /// Two profiles of three levels; `warming` shifts every temperature.
        pub(crate) fn core(warming: f32) -> Self {
            Self {
                cycles: vec![1, 2],
                juld: vec![27000.0, 27010.5],
                latitude: vec![-12.5, -12.0],
                longitude: vec![75.0, 75.5],
                levels: 3,
                pres: vec![5.0, 50.0, 100.0, 5.0, 50.0, 100.0],
                temp: [28.0, 24.0, 18.0, 27.5, 23.5, 17.5]
                    .iter()
                    .map(|t| t + warming)
                    .collect(),
                psal: vec![35.1, 35.2, 35.3, 35.0, 35.1, 35.2],
                bgc: Vec::new(),
            }
        }

        pub(crate) fn with_bgc(mut self, var: BgcVariable, values: Vec<f32>) -> Self {
            self.bgc.push((var, values));
            self
        }

        pub(crate) fn to_bytes(&self) -> Vec<u8> {
            let grid = ["N_PROF", "N_LEVELS"];
            let mut builder = NcBuilder::new()
                .dim("N_PROF", self.cycles.len())
                .dim("N_LEVELS", self.levels)
                .dim("DATE_TIME", 14)
                .text_var("REFERENCE_DATE_TIME", &["DATE_TIME"], &["19500101000000"])
                .var_with_fill(
                    "CYCLE_NUMBER",
                    &["N_PROF"],
                    NcValues::Int(self.cycles.clone()),
                    NcValues::Int(vec![99999]),
                )
                .var_with_fill(
                    "JULD",
                    &["N_PROF"],
                    NcValues::Double(self.juld.clone()),
                    NcValues::Double(vec![999999.0]),
                )
                .var_with_fill(
                    "LATITUDE",
                    &["N_PROF"],
                    NcValues::Double(self.latitude.clone()),
                    NcValues::Double(vec![99999.0]),
                )
                .var_with_fill(
                    "LONGITUDE",
                    &["N_PROF"],
                    NcValues::Double(self.longitude.clone()),
                    NcValues::Double(vec![99999.0]),
                );
            for (name, values) in [("PRES", &self.pres), ("TEMP", &self.temp), ("PSAL", &self.psal)] {
                builder = builder.var_with_fill(
                    name,
                    &grid,
                    NcValues::Float(values.clone()),
                    NcValues::Float(vec![FILL]),
                );
            }
            for (var, values) in &self.bgc {
                builder = builder.var_with_fill(
                    var.variable_name(),
                    &grid,
                    NcValues::Float(values.clone()),
                    NcValues::Float(vec![FILL]),
                );
            }
            builder.build()
        }
    }

    /// A metadata file; bumping `revision` changes its bytes and so its fingerprint.
    pub(crate) fn meta_bytes(platform_type: &str, revision: u32) -> Vec<u8> {
        NcBuilder::new()
            .dim("STRING32", 32)
            .dim("STRING64", 64)
            .dim("DATE_TIME", 14)
            .global_text("history", &format!("revision {revision}"))
            .text_var("PLATFORM_TYPE", &["STRING32"], &[platform_type])
            .text_var("PROJECT_NAME", &["STRING64"], &["Argo India"])
            .text_var("LAUNCH_DATE", &["DATE_TIME"], &["20190312054500"])
            .build()
    }

    pub(crate) fn payloads(profile: &ProfileFixture, extended: Option<&ProfileFixture>) -> RawPayloads {
        RawPayloads {
            meta: Bytes::from(meta_bytes("APEX", 1)),
            profile: Bytes::from(profile.to_bytes()),
            extended: extended.map(|e| Bytes::from(e.to_bytes())),
        }
    }
}
