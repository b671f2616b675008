//! Derive the file schema and column transformers from table columns.

use super::transform::ColumnTransformer;
use crate::control_plane::protocol::TableColumn;
use crate::error::EncodingError;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use parquet::arrow::PARQUET_FIELD_ID_META_KEY;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Metadata key for the file format version.
pub const SF_VERSION_KEY: &str = "sfVer";

/// Metadata key carrying the blob's base name.
pub const PRIMARY_FILE_ID_KEY: &str = "primaryFileId";

/// Default scale for time and timestamp columns (nanoseconds).
const DEFAULT_TIME_SCALE: i32 = 9;

/// Largest precision that fits an Int64 column.
const MAX_INT64_PRECISION: i32 = 18;

/// How values of a column are interpreted and stored.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    /// Integer or decimal number
    Fixed { precision: u8, scale: i8 },
    /// Double precision float
    Real,
    /// UTF-8 text with an optional character limit
    Text { max_length: Option<i64> },
    /// Raw bytes, hex-encoded in input rows
    Binary { max_length: Option<i64> },
    Boolean,
    /// Days since the epoch
    Date,
    /// Time of day in units of 10^-scale seconds
    Time { scale: u32 },
    /// Timestamp without time zone, units of 10^-scale seconds
    TimestampNtz { scale: u32 },
    /// Timestamp in the session time zone, normalised to UTC
    TimestampLtz { scale: u32 },
    /// Timestamp with offset, normalised to UTC
    TimestampTz { scale: u32 },
    /// Semi-structured value stored as JSON text
    Variant,
    Object,
    Array,
}

impl ColumnKind {
    /// Arrow type used in the encoded file.
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnKind::Fixed { precision, scale }
                if *scale == 0 && i32::from(*precision) <= MAX_INT64_PRECISION =>
            {
                DataType::Int64
            }
            ColumnKind::Fixed { precision, scale } => DataType::Decimal128(*precision, *scale),
            ColumnKind::Real => DataType::Float64,
            ColumnKind::Text { .. } => DataType::Utf8,
            ColumnKind::Binary { .. } => DataType::Binary,
            ColumnKind::Boolean => DataType::Boolean,
            ColumnKind::Date => DataType::Date32,
            ColumnKind::Time { .. }
            | ColumnKind::TimestampNtz { .. }
            | ColumnKind::TimestampLtz { .. }
            | ColumnKind::TimestampTz { .. } => DataType::Int64,
            ColumnKind::Variant | ColumnKind::Object | ColumnKind::Array => DataType::Utf8,
        }
    }
}

/// Everything needed to encode rows for one channel.
#[derive(Debug, Clone)]
pub struct EncodingPlan {
    /// Arrow schema of the encoded file
    pub schema: SchemaRef,
    /// One transformer per column, in schema order
    pub transformers: Vec<ColumnTransformer>,
    /// File metadata shared by every file of the channel
    pub metadata: BTreeMap<String, String>,
    lookup: HashMap<String, usize>,
}

impl EncodingPlan {
    /// Index of the column a record key refers to.
    pub fn column_index(&self, record_key: &str) -> Option<usize> {
        self.lookup.get(&normalize_record_key(record_key)).copied()
    }
}

/// Build the file schema, transformers and static metadata for a table.
pub fn build_schema(columns: &[TableColumn]) -> Result<EncodingPlan, EncodingError> {
    let mut fields = Vec::with_capacity(columns.len());
    let mut transformers = Vec::with_capacity(columns.len());
    let mut metadata = BTreeMap::new();
    let mut lookup = HashMap::with_capacity(columns.len());

    metadata.insert(SF_VERSION_KEY.to_string(), "1,1".to_string());

    for (idx, column) in columns.iter().enumerate() {
        let name = unquote_identifier(&column.name);
        let ordinal = column.ordinal.unwrap_or(idx as i32 + 1);
        let kind = column_kind(column, &name)?;

        let field = Field::new(&name, kind.data_type(), column.nullable).with_metadata(
            HashMap::from([(PARQUET_FIELD_ID_META_KEY.to_string(), ordinal.to_string())]),
        );
        fields.push(field);

        metadata.insert(
            ordinal.to_string(),
            format!(
                "{},{}",
                logical_type_ordinal(&column.logical_type),
                physical_type_ordinal(&column.physical_type)
            ),
        );

        if lookup.insert(name.clone(), idx).is_some() {
            return Err(EncodingError::InvalidValue {
                column: name,
                message: "duplicate column name".into(),
            });
        }
        transformers.push(ColumnTransformer::new(
            name,
            ordinal,
            kind,
            column.nullable,
            column.collation.clone(),
        ));
    }

    Ok(EncodingPlan {
        schema: Arc::new(Schema::new(fields)),
        transformers,
        metadata,
        lookup,
    })
}

fn column_kind(column: &TableColumn, name: &str) -> Result<ColumnKind, EncodingError> {
    let time_scale = || {
        let scale = column.scale.unwrap_or(DEFAULT_TIME_SCALE);
        if (0..=9).contains(&scale) {
            Ok(scale as u32)
        } else {
            Err(EncodingError::UnsupportedType {
                column: name.to_string(),
                column_type: column.column_type.clone(),
            })
        }
    };

    let kind = match column.logical_type.to_ascii_uppercase().as_str() {
        "FIXED" => {
            let precision = column.precision.unwrap_or(38);
            let scale = column.scale.unwrap_or(0);
            if !(1..=38).contains(&precision) || !(0..=precision).contains(&scale) {
                return Err(EncodingError::UnsupportedType {
                    column: name.to_string(),
                    column_type: column.column_type.clone(),
                });
            }
            ColumnKind::Fixed {
                precision: precision as u8,
                scale: scale as i8,
            }
        }
        "REAL" => ColumnKind::Real,
        "TEXT" | "CHAR" => ColumnKind::Text {
            max_length: column.length,
        },
        "BINARY" => ColumnKind::Binary {
            max_length: column.byte_length,
        },
        "BOOLEAN" => ColumnKind::Boolean,
        "DATE" => ColumnKind::Date,
        "TIME" => ColumnKind::Time {
            scale: time_scale()?,
        },
        "TIMESTAMP_NTZ" => ColumnKind::TimestampNtz {
            scale: time_scale()?,
        },
        "TIMESTAMP_LTZ" => ColumnKind::TimestampLtz {
            scale: time_scale()?,
        },
        "TIMESTAMP_TZ" => ColumnKind::TimestampTz {
            scale: time_scale()?,
        },
        "VARIANT" => ColumnKind::Variant,
        "OBJECT" => ColumnKind::Object,
        "ARRAY" => ColumnKind::Array,
        _ => {
            return Err(EncodingError::UnsupportedType {
                column: name.to_string(),
                column_type: column.column_type.clone(),
            })
        }
    };
    Ok(kind)
}

fn logical_type_ordinal(logical_type: &str) -> i32 {
    match logical_type.to_ascii_uppercase().as_str() {
        "BOOLEAN" => 1,
        "FIXED" => 2,
        "TIMESTAMP_LTZ" => 3,
        "TIMESTAMP_NTZ" => 4,
        "TIMESTAMP_TZ" => 5,
        "TIME" => 6,
        "DATE" => 7,
        "REAL" => 8,
        "TEXT" | "CHAR" => 9,
        "BINARY" => 10,
        "VARIANT" => 11,
        "ARRAY" => 13,
        "OBJECT" => 14,
        _ => 0,
    }
}

fn physical_type_ordinal(physical_type: &str) -> i32 {
    match physical_type.to_ascii_uppercase().as_str() {
        "SB1" => 1,
        "SB2" => 2,
        "SB4" => 3,
        "SB8" => 4,
        "SB16" => 5,
        "DOUBLE" => 7,
        "LOB" => 8,
        "ROWINDEX" => 9,
        "ROW" => 10,
        "BINARY" => 11,
        _ => 0,
    }
}

/// Strip identifier quotes from a column name reported by the table.
pub fn unquote_identifier(name: &str) -> String {
    if name.len() >= 2 && name.starts_with('"') && name.ends_with('"') {
        name[1..name.len() - 1].replace("\"\"", "\"")
    } else {
        name.to_string()
    }
}

/// Normalise a record key the way unquoted SQL identifiers are resolved.
///
/// Quoted keys keep their case, unquoted keys are upper-cased.
pub fn normalize_record_key(key: &str) -> String {
    if key.len() >= 2 && key.starts_with('"') && key.ends_with('"') {
        unquote_identifier(key)
    } else {
        key.to_uppercase()
    }
}
