//! Read statistics back out of an encoded file and build chunk statistics.

use super::transform::{ColumnStats, ColumnTransformer};
use crate::control_plane::protocol::{EpInfo, FileColumnProperties};
use crate::error::EncodingError;
use bytes::Bytes;
use parquet::file::reader::{FileReader, SerializedFileReader};
use std::collections::{BTreeMap, HashMap};

/// String statistics are truncated to this many bytes.
const MAX_STAT_BYTES: usize = 32;

/// Footer statistics of an encoded file.
#[derive(Debug, Clone, Default)]
pub struct FileStatistics {
    pub row_count: i64,
    /// Sum of uncompressed column chunk sizes
    pub total_uncompressed_size: i64,
    pub total_compressed_size: i64,
    pub columns: HashMap<String, ColumnChunkStatistics>,
    pub key_value_metadata: BTreeMap<String, String>,
}

/// Footer statistics of one column, summed over row groups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnChunkStatistics {
    pub uncompressed_size: i64,
    pub compressed_size: i64,
    pub null_count: Option<u64>,
}

/// Parse row count and per-column sizes from an encoded file.
pub fn read_file_statistics(data: Bytes) -> Result<FileStatistics, EncodingError> {
    let reader = SerializedFileReader::new(data)?;
    let parquet_meta = reader.metadata();
    let file_meta = parquet_meta.file_metadata();

    let mut stats = FileStatistics {
        row_count: file_meta.num_rows(),
        ..Default::default()
    };

    if let Some(kvs) = file_meta.key_value_metadata() {
        for kv in kvs {
            if let Some(value) = &kv.value {
                stats.key_value_metadata.insert(kv.key.clone(), value.clone());
            }
        }
    }

    for rg_idx in 0..parquet_meta.num_row_groups() {
        let row_group = parquet_meta.row_group(rg_idx);

        for col_idx in 0..row_group.num_columns() {
            let col_meta = row_group.column(col_idx);
            let null_count = col_meta
                .statistics()
                .and_then(|s| s.null_count_opt());

            stats.total_uncompressed_size += col_meta.uncompressed_size();
            stats.total_compressed_size += col_meta.compressed_size();

            let entry = stats
                .columns
                .entry(col_meta.column_path().string())
                .or_default();
            entry.uncompressed_size += col_meta.uncompressed_size();
            entry.compressed_size += col_meta.compressed_size();
            entry.null_count = match (entry.null_count, null_count) {
                (Some(a), Some(b)) => Some(a + b),
                (a, b) => a.or(b),
            };
        }
    }

    Ok(stats)
}

/// Build the chunk statistics reported when registering a blob.
pub fn ep_info(
    row_count: i64,
    transformers: &[ColumnTransformer],
    column_stats: &[ColumnStats],
) -> EpInfo {
    let columns = transformers
        .iter()
        .zip(column_stats)
        .map(|(t, s)| (t.name().to_string(), column_properties(t, s)))
        .collect();
    EpInfo {
        rows: row_count,
        columns,
    }
}

fn column_properties(transformer: &ColumnTransformer, stats: &ColumnStats) -> FileColumnProperties {
    let min_str = stats.min_str.as_deref().map(truncate_min);
    let max_str = stats.max_str.as_deref().map(truncate_max);
    FileColumnProperties {
        column_id: transformer.ordinal(),
        min_str_value: min_str.clone(),
        max_str_value: max_str.clone(),
        collation: transformer.collation().map(str::to_string),
        min_str_non_collated: min_str,
        max_str_non_collated: max_str,
        min_int_value: stats.min_int.unwrap_or(0),
        max_int_value: stats.max_int.unwrap_or(0),
        min_real_value: stats.min_real.unwrap_or(0.0),
        max_real_value: stats.max_real.unwrap_or(0.0),
        distinct_values: -1,
        null_count: stats.null_count,
        max_length: stats.max_length,
    }
}

fn truncate_min(value: &[u8]) -> String {
    hex::encode(&value[..value.len().min(MAX_STAT_BYTES)])
}

/// Truncate to the limit, rounding up so the result is still an upper bound.
fn truncate_max(value: &[u8]) -> String {
    if value.len() <= MAX_STAT_BYTES {
        return hex::encode(value);
    }
    let mut truncated = value[..MAX_STAT_BYTES].to_vec();
    while let Some(last) = truncated.last_mut() {
        if *last == u8::MAX {
            truncated.pop();
        } else {
            *last += 1;
            return hex::encode(truncated);
        }
    }
    // Every byte was 0xFF; no shorter upper bound exists.
    hex::encode(value)
}

#[cfg(test)]
mod tests {
    use super::super::schema::build_schema;
    use super::super::transform::transform_rows;
    use super::super::writer::write_file;
    use super::*;
    use crate::config::EncoderConfig;
    use crate::control_plane::protocol::TableColumn;
    use serde_json::json;

    fn int_column(name: &str) -> TableColumn {
        TableColumn {
            name: name.into(),
            column_type: "NUMBER(18,0)".into(),
            logical_type: "FIXED".into(),
            physical_type: "SB8".into(),
            precision: Some(18),
            scale: Some(0),
            byte_length: None,
            length: None,
            nullable: true,
            collation: None,
            ordinal: None,
        }
    }

    #[test]
    fn test_read_back_statistics() {
        let plan = build_schema(&[int_column("A"), int_column("B")]).unwrap();
        let rows = vec![
            json!({"a": 1, "b": 2}),
            json!({"a": 3}),
            json!({"a": 5, "b": 6}),
        ];
        let transformed = transform_rows(&rows, &plan).unwrap();

        let mut metadata = plan.metadata.clone();
        metadata.insert("primaryFileId".into(), "x.bdec".into());
        let mut buffer = Vec::new();
        write_file(
            &plan.schema,
            &transformed.batch,
            &metadata,
            &EncoderConfig::default(),
            &mut buffer,
        )
        .unwrap();

        let stats = read_file_statistics(Bytes::copy_from_slice(&buffer)).unwrap();
        assert_eq!(stats.row_count, 3);
        assert!(stats.total_uncompressed_size > 0);
        assert_eq!(stats.columns.len(), 2);
        assert_eq!(stats.columns["B"].null_count, Some(1));
        assert_eq!(
            stats.key_value_metadata.get("primaryFileId").map(String::as_str),
            Some("x.bdec")
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = read_file_statistics(Bytes::from_static(b"not a parquet file")).unwrap_err();
        assert!(matches!(err, EncodingError::Parquet(_)));
    }

    #[test]
    fn test_ep_info() {
        let plan = build_schema(&[int_column("A")]).unwrap();
        let transformed = transform_rows(&[json!({"a": 4}), json!({"a": null})], &plan).unwrap();
        let eps = ep_info(2, &plan.transformers, &transformed.stats);

        assert_eq!(eps.rows, 2);
        let a = &eps.columns["A"];
        assert_eq!(a.column_id, 1);
        assert_eq!(a.min_int_value, 4);
        assert_eq!(a.max_int_value, 4);
        assert_eq!(a.null_count, 1);
        assert_eq!(a.distinct_values, -1);
    }

    #[test]
    fn test_truncate_string_stats() {
        let long = vec![b'a'; 40];
        assert_eq!(truncate_min(&long), hex::encode(vec![b'a'; 32]));

        let mut expected = vec![b'a'; 31];
        expected.push(b'b');
        assert_eq!(truncate_max(&long), hex::encode(expected));

        let mut trailing_ff = vec![b'a'; 31];
        trailing_ff.extend(vec![0xFF; 9]);
        assert_eq!(truncate_max(&trailing_ff), hex::encode({
            let mut v = vec![b'a'; 30];
            v.push(b'b');
            v
        }));
        assert_eq!(truncate_max(b"short"), hex::encode(b"short"));
    }
}
