//! Convert JSON rows into Arrow columns while collecting column statistics.

use super::schema::{ColumnKind, EncodingPlan};
use crate::error::EncodingError;
use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Decimal128Array, Float64Array, Int64Array,
    StringArray,
};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde_json::Value;
use std::sync::Arc;

const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Days between 0001-01-01 and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Statistics gathered for one column of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnStats {
    pub null_count: i64,
    pub min_int: Option<i128>,
    pub max_int: Option<i128>,
    pub min_real: Option<f64>,
    pub max_real: Option<f64>,
    pub min_str: Option<Vec<u8>>,
    pub max_str: Option<Vec<u8>>,
    /// Longest value in bytes
    pub max_length: i64,
}

impl ColumnStats {
    fn observe_int(&mut self, value: i128) {
        self.min_int = Some(self.min_int.map_or(value, |m| m.min(value)));
        self.max_int = Some(self.max_int.map_or(value, |m| m.max(value)));
    }

    fn observe_real(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.min_real = Some(self.min_real.map_or(value, |m| m.min(value)));
        self.max_real = Some(self.max_real.map_or(value, |m| m.max(value)));
    }

    fn observe_bytes(&mut self, value: &[u8]) {
        self.max_length = self.max_length.max(value.len() as i64);
        if self.min_str.as_deref().map_or(true, |m| value < m) {
            self.min_str = Some(value.to_vec());
        }
        if self.max_str.as_deref().map_or(true, |m| value > m) {
            self.max_str = Some(value.to_vec());
        }
    }

    fn observe_length(&mut self, len: usize) {
        self.max_length = self.max_length.max(len as i64);
    }
}

/// Converts one column's input values into its Arrow representation.
#[derive(Debug, Clone)]
pub struct ColumnTransformer {
    name: String,
    ordinal: i32,
    kind: ColumnKind,
    nullable: bool,
    collation: Option<String>,
}

impl ColumnTransformer {
    pub(crate) fn new(
        name: String,
        ordinal: i32,
        kind: ColumnKind,
        nullable: bool,
        collation: Option<String>,
    ) -> Self {
        Self {
            name,
            ordinal,
            kind,
            nullable,
            collation,
        }
    }

    /// Column name as stored in the file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 1-based column ordinal.
    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    pub fn kind(&self) -> &ColumnKind {
        &self.kind
    }

    pub fn collation(&self) -> Option<&str> {
        self.collation.as_deref()
    }

    fn invalid(&self, message: impl Into<String>) -> EncodingError {
        EncodingError::InvalidValue {
            column: self.name.clone(),
            message: message.into(),
        }
    }

    fn collect<T, F>(
        &self,
        values: &[Option<&Value>],
        stats: &mut ColumnStats,
        mut convert: F,
    ) -> Result<Vec<Option<T>>, EncodingError>
    where
        F: FnMut(&Value, &mut ColumnStats) -> Result<T, String>,
    {
        values
            .iter()
            .map(|value| match value {
                None if !self.nullable => Err(EncodingError::NullValue(self.name.clone())),
                None => {
                    stats.null_count += 1;
                    Ok(None)
                }
                Some(v) => convert(v, stats).map(Some).map_err(|m| self.invalid(m)),
            })
            .collect()
    }

    /// Build the Arrow array for this column.
    pub fn build_array(
        &self,
        values: &[Option<&Value>],
    ) -> Result<(ArrayRef, ColumnStats), EncodingError> {
        let mut stats = ColumnStats::default();

        let array: ArrayRef = match &self.kind {
            ColumnKind::Fixed { precision, scale } => {
                let (precision, scale) = (*precision, *scale);
                let limit = 10i128.pow(u32::from(precision));
                let converted = self.collect(values, &mut stats, |v, s| {
                    let n = parse_fixed(v, scale as u32)?;
                    if n.abs() >= limit {
                        return Err(format!("value exceeds precision {}", precision));
                    }
                    s.observe_int(n);
                    Ok(n)
                })?;
                if scale == 0 && u32::from(precision) <= 18 {
                    let ints: Vec<Option<i64>> = converted
                        .into_iter()
                        .map(|v| v.map(|n| n as i64))
                        .collect();
                    Arc::new(Int64Array::from(ints))
                } else {
                    Arc::new(
                        Decimal128Array::from(converted)
                            .with_precision_and_scale(precision, scale)?,
                    )
                }
            }
            ColumnKind::Real => {
                let converted = self.collect(values, &mut stats, |v, s| {
                    let f = parse_real(v)?;
                    s.observe_real(f);
                    Ok(f)
                })?;
                Arc::new(Float64Array::from(converted))
            }
            ColumnKind::Text { max_length } => {
                let max_length = *max_length;
                let converted = self.collect(values, &mut stats, |v, s| {
                    let text = match v {
                        Value::String(text) => text.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        other => other.to_string(),
                    };
                    if let Some(limit) = max_length {
                        if text.chars().count() as i64 > limit {
                            return Err(format!("string longer than {} characters", limit));
                        }
                    }
                    s.observe_bytes(text.as_bytes());
                    Ok(text)
                })?;
                Arc::new(converted.into_iter().collect::<StringArray>())
            }
            ColumnKind::Binary { max_length } => {
                let max_length = *max_length;
                let converted = self.collect(values, &mut stats, |v, s| {
                    let bytes = match v {
                        Value::String(hex_str) => {
                            hex::decode(hex_str).map_err(|e| format!("invalid hex: {}", e))?
                        }
                        other => return Err(format!("expected hex string, got {}", other)),
                    };
                    if let Some(limit) = max_length {
                        if bytes.len() as i64 > limit {
                            return Err(format!("binary longer than {} bytes", limit));
                        }
                    }
                    s.observe_bytes(&bytes);
                    Ok(bytes)
                })?;
                Arc::new(converted.into_iter().collect::<BinaryArray>())
            }
            ColumnKind::Boolean => {
                let converted = self.collect(values, &mut stats, |v, s| {
                    let b = parse_bool(v)?;
                    s.observe_int(i128::from(b));
                    Ok(b)
                })?;
                Arc::new(BooleanArray::from(converted))
            }
            ColumnKind::Date => {
                let converted = self.collect(values, &mut stats, |v, s| {
                    let days = parse_date(v)?;
                    s.observe_int(i128::from(days));
                    Ok(days)
                })?;
                Arc::new(Date32Array::from(converted))
            }
            ColumnKind::Time { scale } => {
                let scale = *scale;
                let converted = self.collect(values, &mut stats, |v, s| {
                    let scaled = rescale_nanos(parse_time_nanos(v)?, scale)?;
                    s.observe_int(i128::from(scaled));
                    Ok(scaled)
                })?;
                Arc::new(Int64Array::from(converted))
            }
            ColumnKind::TimestampNtz { scale }
            | ColumnKind::TimestampLtz { scale }
            | ColumnKind::TimestampTz { scale } => {
                let scale = *scale;
                let converted = self.collect(values, &mut stats, |v, s| {
                    let scaled = rescale_nanos(parse_timestamp_nanos(v)?, scale)?;
                    s.observe_int(i128::from(scaled));
                    Ok(scaled)
                })?;
                Arc::new(Int64Array::from(converted))
            }
            ColumnKind::Variant | ColumnKind::Object | ColumnKind::Array => {
                let kind = self.kind.clone();
                let converted = self.collect(values, &mut stats, |v, s| {
                    match (&kind, v) {
                        (ColumnKind::Object, Value::Object(_))
                        | (ColumnKind::Array, Value::Array(_))
                        | (ColumnKind::Variant, _) => {}
                        (ColumnKind::Object, other) => {
                            return Err(format!("expected object, got {}", other))
                        }
                        (_, other) => return Err(format!("expected array, got {}", other)),
                    }
                    let json = v.to_string();
                    s.observe_length(json.len());
                    Ok(json)
                })?;
                Arc::new(converted.into_iter().collect::<StringArray>())
            }
        };

        Ok((array, stats))
    }
}

/// Rows converted to a record batch plus per-column statistics.
#[derive(Debug, Clone)]
pub struct TransformedRows {
    pub batch: RecordBatch,
    /// Statistics in schema order
    pub stats: Vec<ColumnStats>,
}

impl TransformedRows {
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }
}

/// Transform a batch of JSON object rows into column-oriented form.
///
/// Keys that match no column are ignored. A missing key or JSON null is a
/// null value. Any conversion error fails the whole batch.
pub fn transform_rows(rows: &[Value], plan: &EncodingPlan) -> Result<TransformedRows, EncodingError> {
    let width = plan.transformers.len();
    let mut columns: Vec<Vec<Option<&Value>>> =
        (0..width).map(|_| Vec::with_capacity(rows.len())).collect();

    for (row_idx, row) in rows.iter().enumerate() {
        let object = row.as_object().ok_or(EncodingError::NotAnObject(row_idx))?;
        let mut slots: Vec<Option<&Value>> = vec![None; width];
        for (key, value) in object {
            if let Some(idx) = plan.column_index(key) {
                slots[idx] = Some(value).filter(|v| !v.is_null());
            }
        }
        for (column, slot) in columns.iter_mut().zip(slots) {
            column.push(slot);
        }
    }

    let mut arrays = Vec::with_capacity(width);
    let mut stats = Vec::with_capacity(width);
    for (transformer, values) in plan.transformers.iter().zip(&columns) {
        let (array, column_stats) = transformer.build_array(values)?;
        arrays.push(array);
        stats.push(column_stats);
    }

    let batch = RecordBatch::try_new(plan.schema.clone(), arrays)?;
    Ok(TransformedRows { batch, stats })
}

fn parse_fixed(value: &Value, scale: u32) -> Result<i128, String> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => return Err(format!("expected number, got {}", other)),
    };
    parse_decimal(&text, scale).ok_or_else(|| format!("invalid number {:?}", text))
}

/// Parse a decimal literal into an integer scaled by 10^scale, rounding
/// half away from zero.
pub(crate) fn parse_decimal(text: &str, scale: u32) -> Option<i128> {
    let (mantissa_text, exponent) = match text.find(['e', 'E']) {
        Some(pos) => (&text[..pos], text[pos + 1..].parse::<i64>().ok()?),
        None => (text, 0),
    };
    let (negative, digits) = match mantissa_text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, mantissa_text.strip_prefix('+').unwrap_or(mantissa_text)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    let mut mantissa: i128 = 0;
    for b in int_part.bytes().chain(frac_part.bytes()) {
        if !b.is_ascii_digit() {
            return None;
        }
        mantissa = mantissa.checked_mul(10)?.checked_add(i128::from(b - b'0'))?;
    }

    let shift = exponent - frac_part.len() as i64 + i64::from(scale);
    let value = if shift >= 0 {
        mantissa.checked_mul(10i128.checked_pow(u32::try_from(shift).ok()?)?)?
    } else if shift < -38 {
        0
    } else {
        let divisor = 10i128.pow((-shift) as u32);
        let (quotient, remainder) = (mantissa / divisor, mantissa % divisor);
        // remainder * 2 overflows when divisor is 10^38
        if remainder >= divisor - remainder {
            quotient + 1
        } else {
            quotient
        }
    };
    Some(if negative { -value } else { value })
}

fn parse_real(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("invalid float {}", n)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid float {:?}: {}", s, e)),
        other => Err(format!("expected number, got {}", other)),
    }
}

fn parse_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "on" | "1" => Ok(true),
            "false" | "f" | "no" | "n" | "off" | "0" => Ok(false),
            _ => Err(format!("invalid boolean {:?}", s)),
        },
        other => Err(format!("expected boolean, got {}", other)),
    }
}

fn parse_date(value: &Value) -> Result<i32, String> {
    let date = match value {
        Value::String(s) => {
            let s = s.trim();
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .or_else(|_| DateTime::parse_from_rfc3339(s).map(|dt| dt.date_naive()))
                .map_err(|e| format!("invalid date {:?}: {}", s, e))?
        }
        Value::Number(n) => {
            let secs = n.as_i64().ok_or_else(|| format!("invalid epoch seconds {}", n))?;
            DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| format!("epoch seconds out of range {}", secs))?
                .date_naive()
        }
        other => return Err(format!("expected date, got {}", other)),
    };
    Ok(date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
}

fn parse_time_nanos(value: &Value) -> Result<i128, String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            let time = NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
                .map_err(|e| format!("invalid time {:?}: {}", s, e))?;
            Ok(i128::from(time.num_seconds_from_midnight()) * NANOS_PER_SECOND
                + i128::from(time.nanosecond()))
        }
        Value::Number(n) => {
            let secs = n.as_f64().ok_or_else(|| format!("invalid seconds {}", n))?;
            if !(0.0..86_400.0).contains(&secs) {
                return Err(format!("time of day out of range {}", secs));
            }
            Ok((secs * 1e9).round() as i128)
        }
        other => Err(format!("expected time, got {}", other)),
    }
}

fn parse_timestamp_nanos(value: &Value) -> Result<i128, String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(i128::from(dt.timestamp()) * NANOS_PER_SECOND
                    + i128::from(dt.timestamp_subsec_nanos()));
            }
            let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                .or_else(|_| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .map(|d| d.and_time(NaiveTime::default()))
                })
                .map_err(|e| format!("invalid timestamp {:?}: {}", s, e))?;
            let utc = naive.and_utc();
            Ok(i128::from(utc.timestamp()) * NANOS_PER_SECOND
                + i128::from(utc.timestamp_subsec_nanos()))
        }
        Value::Number(n) => match n.as_i64() {
            Some(secs) => Ok(i128::from(secs) * NANOS_PER_SECOND),
            None => {
                let secs = n.as_f64().ok_or_else(|| format!("invalid epoch {}", n))?;
                Ok((secs * 1e9).round() as i128)
            }
        },
        other => Err(format!("expected timestamp, got {}", other)),
    }
}

fn rescale_nanos(nanos: i128, scale: u32) -> Result<i64, String> {
    let divisor = 10i128.pow(9 - scale);
    i64::try_from(nanos.div_euclid(divisor)).map_err(|_| "timestamp out of range".to_string())
}
