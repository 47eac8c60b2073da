//! Core domain model for argosync: float entities, fingerprints, ledger records,
//! decoded measurement rows and catalog summaries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "argosync-core";

/// The three remote files published for every float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Meta,
    Profile,
    ExtendedProfile,
}

impl FileKind {
    pub const ALL: [FileKind; 3] = [FileKind::Meta, FileKind::Profile, FileKind::ExtendedProfile];

    pub fn suffix(self) -> &'static str {
        match self {
            FileKind::Meta => "meta",
            FileKind::Profile => "prof",
            FileKind::ExtendedProfile => "Sprof",
        }
    }

    pub fn file_name(self, key: &str) -> String {
        format!("{key}_{}.nc", self.suffix())
    }

    /// Only BGC floats publish an extended profile; its absence is not an error.
    pub fn is_optional(self) -> bool {
        matches!(self, FileKind::ExtendedProfile)
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Content fingerprint of an entity's core metadata file (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already-computed fingerprint, e.g. one read back from the ledger.
    pub fn from_hex(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Processed,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Processed => "processed",
            LedgerStatus::Failed => "failed",
        }
    }
}

impl FromStr for LedgerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LedgerStatus::Pending),
            "processed" => Ok(LedgerStatus::Processed),
            "failed" => Ok(LedgerStatus::Failed),
            other => Err(format!("unknown ledger status {other:?}")),
        }
    }
}

/// One row of the fingerprint ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub key: String,
    pub fingerprint: Option<Fingerprint>,
    pub status: LedgerStatus,
    pub last_processed: Option<DateTime<Utc>>,
}

impl LedgerRecord {
    pub fn pending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fingerprint: None,
            status: LedgerStatus::Pending,
            last_processed: None,
        }
    }
}

/// Biogeochemical variables carried by extended profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BgcVariable {
    Doxy,
    PhInSituTotal,
    Chla,
    Bbp700,
    Nitrate,
    DownwellingPar,
}

impl BgcVariable {
    pub const ALL: [BgcVariable; 6] = [
        BgcVariable::Doxy,
        BgcVariable::PhInSituTotal,
        BgcVariable::Chla,
        BgcVariable::Bbp700,
        BgcVariable::Nitrate,
        BgcVariable::DownwellingPar,
    ];

    /// Variable name inside the NetCDF file.
    pub fn variable_name(self) -> &'static str {
        match self {
            BgcVariable::Doxy => "DOXY",
            BgcVariable::PhInSituTotal => "PH_IN_SITU_TOTAL",
            BgcVariable::Chla => "CHLA",
            BgcVariable::Bbp700 => "BBP700",
            BgcVariable::Nitrate => "NITRATE",
            BgcVariable::DownwellingPar => "DOWNWELLING_PAR",
        }
    }

    /// Column name in the converted table.
    pub fn column_name(self) -> &'static str {
        match self {
            BgcVariable::Doxy => "dissolved_oxygen_umol_kg",
            BgcVariable::PhInSituTotal => "ph_value",
            BgcVariable::Chla => "chlorophyll_a_mg_m3",
            BgcVariable::Bbp700 => "backscatter_700nm_m_1",
            BgcVariable::Nitrate => "nitrate_umol_kg",
            BgcVariable::DownwellingPar => "downwelling_par_umol_m2_s",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A single decoded profile level.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeasurementRow {
    pub cycle_number: Option<i32>,
    pub time: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub pressure_dbar: Option<f64>,
    pub depth_m: Option<f64>,
    pub temperature_c: Option<f64>,
    pub salinity_psu: Option<f64>,
    pub bgc: [Option<f64>; 6],
}

/// The converted table for one float.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityTable {
    pub float_id: String,
    pub bgc_vars: Vec<BgcVariable>,
    pub rows: Vec<MeasurementRow>,
}

/// Per-float summary statistics; one row of the metadata catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub float_id: String,
    pub dac: String,
    pub fingerprint: Fingerprint,
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
    pub bgc_vars: Vec<String>,
    pub platform_type: Option<String>,
    pub project_name: Option<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    RetryableWithLongerBackoff,
    NonRetryable,
}

/// Failure talking to the remote archive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote busy (connection limit reached) for {path}: {detail}")]
    Busy { path: String, detail: String },
    #[error("remote unavailable for {path}: {detail}")]
    Unavailable { path: String, detail: String },
    #[error("remote file not found: {path}")]
    NotFound { path: String },
    #[error("remote protocol error for {path}: {detail}")]
    Protocol { path: String, detail: String },
}

impl RemoteError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            RemoteError::Busy { .. } => RetryDisposition::Retryable,
            RemoteError::Unavailable { .. } => RetryDisposition::RetryableWithLongerBackoff,
            RemoteError::NotFound { .. } | RemoteError::Protocol { .. } => {
                RetryDisposition::NonRetryable
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition() != RetryDisposition::NonRetryable
    }
}

/// Payload bytes did not match the expected format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot decode {file}: {message}")]
pub struct DecodeError {
    pub file: String,
    pub message: String,
}

impl DecodeError {
    pub fn new(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            message: message.into(),
        }
    }
}
