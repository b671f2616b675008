//! Parquet file writing.

use crate::config::{EncoderConfig, ParquetCompression};
use crate::error::EncodingError;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::collections::BTreeMap;

fn compression(codec: ParquetCompression) -> Compression {
    match codec {
        ParquetCompression::Zstd => Compression::ZSTD(Default::default()),
        ParquetCompression::Snappy => Compression::SNAPPY,
        ParquetCompression::Gzip => Compression::GZIP(Default::default()),
        ParquetCompression::None => Compression::UNCOMPRESSED,
    }
}

/// Encode a batch into `out`, replacing its previous contents.
///
/// `out` is a scratch buffer owned by the caller so its allocation is reused
/// across files.
pub fn write_file(
    schema: &SchemaRef,
    batch: &RecordBatch,
    metadata: &BTreeMap<String, String>,
    config: &EncoderConfig,
    out: &mut Vec<u8>,
) -> Result<(), EncodingError> {
    out.clear();

    let kv_metadata: Vec<KeyValue> = metadata
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect();

    let props = WriterProperties::builder()
        .set_compression(compression(config.compression))
        .set_max_row_group_size(config.max_row_group_size.max(1))
        .set_key_value_metadata(Some(kv_metadata))
        .set_created_by(format!("sluice version {}", env!("CARGO_PKG_VERSION")))
        .build();

    let mut writer = ArrowWriter::try_new(&mut *out, schema.clone(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    #[test]
    fn test_write_file_reuses_buffer() {
        let schema = Arc::new(Schema::new(vec![Field::new("A", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![1, 2, 3]))],
        )
        .unwrap();
        let metadata = BTreeMap::from([("sfVer".to_string(), "1,1".to_string())]);

        let mut buffer = Vec::new();
        write_file(&schema, &batch, &metadata, &EncoderConfig::default(), &mut buffer).unwrap();
        let first_len = buffer.len();
        assert!(first_len > 0);
        assert_eq!(&buffer[..4], b"PAR1");
        assert_eq!(&buffer[first_len - 4..], b"PAR1");

        write_file(&schema, &batch, &metadata, &EncoderConfig::default(), &mut buffer).unwrap();
        assert_eq!(buffer.len(), first_len);
    }

    #[test]
    fn test_zero_row_group_size_is_clamped() {
        let schema = Arc::new(Schema::new(vec![Field::new("A", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![1, 2]))],
        )
        .unwrap();
        let config = EncoderConfig {
            max_row_group_size: 0,
            ..EncoderConfig::default()
        };

        let mut buffer = Vec::new();
        write_file(&schema, &batch, &BTreeMap::new(), &config, &mut buffer).unwrap();
        assert_eq!(&buffer[..4], b"PAR1");
    }
}
