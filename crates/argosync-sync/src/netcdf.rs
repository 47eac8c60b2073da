//! Reader for NetCDF classic (CDF-1) and 64-bit offset (CDF-2) files, the
//! container Argo GDAC profile and metadata files are published in.
//!
//! Only what the converter needs is supported: header parsing, whole-variable
//! reads of fixed and record variables, and fill-value masking.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

const TAG_DIMENSION: u32 = 0x0A;
const TAG_VARIABLE: u32 = 0x0B;
const TAG_ATTRIBUTE: u32 = 0x0C;
const STREAMING_NUMRECS: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NetcdfError {
    #[error("not a netcdf classic file")]
    BadMagic,
    #[error("unsupported netcdf format version {0}")]
    UnsupportedVersion(u8),
    #[error("unexpected end of data at byte {0}")]
    Truncated(usize),
    #[error("malformed header: {0}")]
    Malformed(String),
    #[error("variable {0} not found")]
    MissingVariable(String),
    #[error("variable {name} has type {found:?}, expected {expected}")]
    TypeMismatch {
        name: String,
        found: NcType,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcType {
    Byte,
    Char,
    Short,
    Int,
    Float,
    Double,
}

impl NcType {
    fn from_code(code: u32) -> Result<Self, NetcdfError> {
        Ok(match code {
            1 => NcType::Byte,
            2 => NcType::Char,
            3 => NcType::Short,
            4 => NcType::Int,
            5 => NcType::Float,
            6 => NcType::Double,
            other => return Err(NetcdfError::Malformed(format!("unknown nc_type {other}"))),
        })
    }

    pub fn code(self) -> u32 {
        match self {
            NcType::Byte => 1,
            NcType::Char => 2,
            NcType::Short => 3,
            NcType::Int => 4,
            NcType::Float => 5,
            NcType::Double => 6,
        }
    }

    pub fn size(self) -> usize {
        match self {
            NcType::Byte | NcType::Char => 1,
            NcType::Short => 2,
            NcType::Int | NcType::Float => 4,
            NcType::Double => 8,
        }
    }

    /// Value the library writes for never-written elements when a variable
    /// declares no `_FillValue`.
    fn default_fill(self) -> Option<f64> {
        match self {
            NcType::Byte => Some(-127.0),
            NcType::Char => None,
            NcType::Short => Some(-32767.0),
            NcType::Int => Some(-2147483647.0),
            NcType::Float => Some(f64::from(9.969_21e36_f32)),
            NcType::Double => Some(9.969_209_968_386_869e36),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NcValues {
    Byte(Vec<i8>),
    Char(Vec<u8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl NcValues {
    pub fn nc_type(&self) -> NcType {
        match self {
            NcValues::Byte(_) => NcType::Byte,
            NcValues::Char(_) => NcType::Char,
            NcValues::Short(_) => NcType::Short,
            NcValues::Int(_) => NcType::Int,
            NcValues::Float(_) => NcType::Float,
            NcValues::Double(_) => NcType::Double,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            NcValues::Byte(v) => v.len(),
            NcValues::Char(v) => v.len(),
            NcValues::Short(v) => v.len(),
            NcValues::Int(v) => v.len(),
            NcValues::Float(v) => v.len(),
            NcValues::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode big-endian `raw` holding whole elements of `nc_type`.
    fn decode(nc_type: NcType, raw: &[u8]) -> Result<Self, NetcdfError> {
        let n = raw.len() / nc_type.size();
        let mut rdr = Cursor::new(raw);
        let short = |_: std::io::Error| NetcdfError::Truncated(raw.len());
        Ok(match nc_type {
            NcType::Byte => {
                let mut v = vec![0i8; n];
                rdr.read_i8_into(&mut v).map_err(short)?;
                NcValues::Byte(v)
            }
            NcType::Char => NcValues::Char(raw.to_vec()),
            NcType::Short => {
                let mut v = vec![0i16; n];
                rdr.read_i16_into::<BigEndian>(&mut v).map_err(short)?;
                NcValues::Short(v)
            }
            NcType::Int => {
                let mut v = vec![0i32; n];
                rdr.read_i32_into::<BigEndian>(&mut v).map_err(short)?;
                NcValues::Int(v)
            }
            NcType::Float => {
                let mut v = vec![0f32; n];
                rdr.read_f32_into::<BigEndian>(&mut v).map_err(short)?;
                NcValues::Float(v)
            }
            NcType::Double => {
                let mut v = vec![0f64; n];
                rdr.read_f64_into::<BigEndian>(&mut v).map_err(short)?;
                NcValues::Double(v)
            }
        })
    }

    /// Numeric values widened to f64. `None` for character data.
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        Some(match self {
            NcValues::Byte(v) => v.iter().map(|x| f64::from(*x)).collect(),
            NcValues::Char(_) => return None,
            NcValues::Short(v) => v.iter().map(|x| f64::from(*x)).collect(),
            NcValues::Int(v) => v.iter().map(|x| f64::from(*x)).collect(),
            NcValues::Float(v) => v.iter().map(|x| f64::from(*x)).collect(),
            NcValues::Double(v) => v.clone(),
        })
    }

    pub fn to_text(&self) -> Option<String> {
        match self {
            NcValues::Char(bytes) => Some(trim_text(bytes)),
            _ => None,
        }
    }
}

fn trim_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[derive(Debug, Clone, PartialEq)]
pub struct NcDimension {
    pub name: String,
    pub len: usize,
    pub unlimited: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NcAttribute {
    pub name: String,
    pub values: NcValues,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NcVariable {
    pub name: String,
    pub dim_ids: Vec<usize>,
    pub attributes: Vec<NcAttribute>,
    pub nc_type: NcType,
    begin: u64,
}

impl NcVariable {
    pub fn attribute(&self, name: &str) -> Option<&NcAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Header reader over the whole file; positions are absolute offsets.
struct HeaderReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> HeaderReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], NetcdfError> {
        let data: &'a [u8] = *self.cursor.get_ref();
        let start = self.position();
        let slice = start
            .checked_add(len)
            .and_then(|end| data.get(start..end))
            .ok_or(NetcdfError::Truncated(start))?;
        self.cursor.set_position((start + len) as u64);
        Ok(slice)
    }

    fn take_padded(&mut self, len: usize) -> Result<&'a [u8], NetcdfError> {
        let slice = self.take(len)?;
        self.take(padding(len))?;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, NetcdfError> {
        let at = self.position();
        self.cursor
            .read_u32::<BigEndian>()
            .map_err(|_| NetcdfError::Truncated(at))
    }

    fn u64(&mut self) -> Result<u64, NetcdfError> {
        let at = self.position();
        self.cursor
            .read_u64::<BigEndian>()
            .map_err(|_| NetcdfError::Truncated(at))
    }

    fn usize(&mut self) -> Result<usize, NetcdfError> {
        Ok(self.u32()? as usize)
    }

    fn name(&mut self) -> Result<String, NetcdfError> {
        let len = self.usize()?;
        let raw = self.take_padded(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| NetcdfError::Malformed("name is not utf-8".to_string()))
    }

    /// Element count of a list, or zero when the list is ABSENT.
    fn list_len(&mut self, tag: u32) -> Result<usize, NetcdfError> {
        let found = self.u32()?;
        let len = self.usize()?;
        match found {
            0 if len == 0 => Ok(0),
            t if t == tag => Ok(len),
            other => Err(NetcdfError::Malformed(format!(
                "expected list tag {tag:#x}, found {other:#x}"
            ))),
        }
    }

    fn attributes(&mut self) -> Result<Vec<NcAttribute>, NetcdfError> {
        let count = self.list_len(TAG_ATTRIBUTE)?;
        let mut attributes = Vec::new();
        for _ in 0..count {
            let name = self.name()?;
            let nc_type = NcType::from_code(self.u32()?)?;
            let nelems = self.usize()?;
            let len = nelems
                .checked_mul(nc_type.size())
                .ok_or_else(|| NetcdfError::Malformed(format!("attribute {name} too large")))?;
            let raw = self.take_padded(len)?;
            attributes.push(NcAttribute {
                name,
                values: NcValues::decode(nc_type, raw)?,
            });
        }
        Ok(attributes)
    }
}

/// A parsed file borrowing the underlying bytes.
#[derive(Debug)]
pub struct NcFile<'a> {
    data: &'a [u8],
    numrecs: usize,
    dimensions: Vec<NcDimension>,
    attributes: Vec<NcAttribute>,
    variables: Vec<NcVariable>,
    record_size: usize,
}

impl<'a> NcFile<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, NetcdfError> {
        let mut cur = HeaderReader::new(data);
        let magic = cur.take(4).map_err(|_| NetcdfError::BadMagic)?;
        if &magic[..3] != b"CDF" {
            return Err(NetcdfError::BadMagic);
        }
        let version = magic[3];
        if version != 1 && version != 2 {
            return Err(NetcdfError::UnsupportedVersion(version));
        }
        let numrecs_raw = cur.u32()?;

        let dim_count = cur.list_len(TAG_DIMENSION)?;
        let mut dimensions = Vec::new();
        for _ in 0..dim_count {
            let name = cur.name()?;
            let len = cur.usize()?;
            dimensions.push(NcDimension {
                name,
                len,
                unlimited: len == 0,
            });
        }
        if dimensions.iter().filter(|d| d.unlimited).count() > 1 {
            return Err(NetcdfError::Malformed(
                "more than one unlimited dimension".to_string(),
            ));
        }

        let attributes = cur.attributes()?;

        let var_count = cur.list_len(TAG_VARIABLE)?;
        let mut variables = Vec::new();
        for _ in 0..var_count {
            let name = cur.name()?;
            let ndims = cur.usize()?;
            let mut dim_ids = Vec::new();
            for position in 0..ndims {
                let id = cur.usize()?;
                let dim = dimensions.get(id).ok_or_else(|| {
                    NetcdfError::Malformed(format!("variable {name} uses unknown dimension {id}"))
                })?;
                if dim.unlimited && position != 0 {
                    return Err(NetcdfError::Malformed(format!(
                        "variable {name} uses the record dimension out of first position"
                    )));
                }
                dim_ids.push(id);
            }
            let var_attributes = cur.attributes()?;
            let nc_type = NcType::from_code(cur.u32()?)?;
            let _vsize = cur.u32()?;
            let begin = if version == 1 {
                u64::from(cur.u32()?)
            } else {
                cur.u64()?
            };
            variables.push(NcVariable {
                name,
                dim_ids,
                attributes: var_attributes,
                nc_type,
                begin,
            });
        }

        let mut file = Self {
            data,
            numrecs: 0,
            dimensions,
            attributes,
            variables,
            record_size: 0,
        };
        file.record_size = file.compute_record_size()?;
        file.numrecs = if numrecs_raw == STREAMING_NUMRECS {
            file.streaming_numrecs()
        } else {
            numrecs_raw as usize
        };
        for dim in file.dimensions.iter_mut().filter(|d| d.unlimited) {
            dim.len = file.numrecs;
        }
        Ok(file)
    }

    pub fn numrecs(&self) -> usize {
        self.numrecs
    }

    pub fn dimensions(&self) -> &[NcDimension] {
        &self.dimensions
    }

    pub fn dimension_len(&self, name: &str) -> Option<usize> {
        self.dimensions.iter().find(|d| d.name == name).map(|d| d.len)
    }

    pub fn attributes(&self) -> &[NcAttribute] {
        &self.attributes
    }

    pub fn global_text(&self, name: &str) -> Option<String> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.values.to_text())
    }

    pub fn variables(&self) -> &[NcVariable] {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&NcVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variable(name).is_some()
    }

    fn is_record(&self, var: &NcVariable) -> bool {
        var.dim_ids
            .first()
            .map(|id| self.dimensions[*id].unlimited)
            .unwrap_or(false)
    }

    pub fn shape(&self, var: &NcVariable) -> Vec<usize> {
        var.dim_ids
            .iter()
            .map(|id| {
                let dim = &self.dimensions[*id];
                if dim.unlimited {
                    self.numrecs
                } else {
                    dim.len
                }
            })
            .collect()
    }

    /// Bytes one variable occupies per record (record variables) or in total.
    fn slab_bytes(&self, var: &NcVariable) -> Result<usize, NetcdfError> {
        let skip = usize::from(self.is_record(var));
        var.dim_ids
            .iter()
            .skip(skip)
            .map(|id| self.dimensions[*id].len)
            .try_fold(var.nc_type.size(), |acc, len| acc.checked_mul(len))
            .ok_or_else(|| NetcdfError::Malformed(format!("variable {} too large", var.name)))
    }

    fn compute_record_size(&self) -> Result<usize, NetcdfError> {
        let record_vars = self
            .variables
            .iter()
            .filter(|v| self.is_record(v))
            .collect::<Vec<_>>();
        if let [only] = record_vars.as_slice() {
            return self.slab_bytes(only);
        }
        record_vars.iter().try_fold(0usize, |acc, var| {
            let slab = self.slab_bytes(var)?;
            Ok(acc + slab + padding(slab))
        })
    }

    fn streaming_numrecs(&self) -> usize {
        let first = self
            .variables
            .iter()
            .filter(|v| self.is_record(v))
            .map(|v| v.begin)
            .min();
        match (first, self.record_size) {
            (Some(begin), size) if size > 0 => {
                (self.data.len().saturating_sub(begin as usize)) / size
            }
            _ => 0,
        }
    }

    fn slice(&self, offset: u64, len: usize) -> Result<&'a [u8], NetcdfError> {
        let start = usize::try_from(offset).map_err(|_| NetcdfError::Truncated(usize::MAX))?;
        let end = start.checked_add(len).ok_or(NetcdfError::Truncated(start))?;
        self.data.get(start..end).ok_or(NetcdfError::Truncated(start))
    }

    /// Read every element of `name` in row-major order.
    pub fn read(&self, name: &str) -> Result<NcValues, NetcdfError> {
        let var = self
            .variable(name)
            .ok_or_else(|| NetcdfError::MissingVariable(name.to_string()))?;
        let slab = self.slab_bytes(var)?;
        if !self.is_record(var) {
            return NcValues::decode(var.nc_type, self.slice(var.begin, slab)?);
        }

        let mut raw = Vec::new();
        for record in 0..self.numrecs {
            let offset = (record as u64)
                .checked_mul(self.record_size as u64)
                .and_then(|o| o.checked_add(var.begin))
                .ok_or(NetcdfError::Truncated(usize::MAX))?;
            raw.extend_from_slice(self.slice(offset, slab)?);
        }
        NcValues::decode(var.nc_type, &raw)
    }

    /// Numeric values with `_FillValue` (or the type's default fill) and
    /// non-finite values mapped to `None`.
    pub fn read_f64(&self, name: &str) -> Result<Vec<Option<f64>>, NetcdfError> {
        let var = self
            .variable(name)
            .ok_or_else(|| NetcdfError::MissingVariable(name.to_string()))?;
        let values = self
            .read(name)?
            .to_f64()
            .ok_or_else(|| NetcdfError::TypeMismatch {
                name: name.to_string(),
                found: var.nc_type,
                expected: "numeric",
            })?;
        let fill = var
            .attribute("_FillValue")
            .and_then(|a| a.values.to_f64())
            .and_then(|v| v.first().copied())
            .or_else(|| var.nc_type.default_fill());

        Ok(values
            .into_iter()
            .map(|v| (v.is_finite() && Some(v) != fill).then_some(v))
            .collect())
    }

    /// Character variable split along its last dimension into trimmed strings.
    pub fn read_text(&self, name: &str) -> Result<Vec<String>, NetcdfError> {
        let var = self
            .variable(name)
            .ok_or_else(|| NetcdfError::MissingVariable(name.to_string()))?;
        let bytes = match self.read(name)? {
            NcValues::Char(bytes) => bytes,
            _ => {
                return Err(NetcdfError::TypeMismatch {
                    name: name.to_string(),
                    found: var.nc_type,
                    expected: "char",
                })
            }
        };
        let width = self.shape(var).last().copied().unwrap_or(1).max(1);
        Ok(bytes.chunks(width).map(trim_text).collect())
    }
}
