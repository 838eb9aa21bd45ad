//! Parquet encoding of source rowsets.
//!
//! Columns are typed when every non-null value shares one type. Columns with
//! mixed types are stored as JSON-encoded [`Value`]s so they decode exactly.
//! The column kind travels in the Arrow field metadata.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};
use crate::record::{SourceRecord, Value};

const KIND_KEY: &str = "order_sync.kind";
const ZSTD_LEVEL: i32 = 3;

/// Storage type of one archived column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Bool,
    Int,
    Float,
    Decimal,
    Text,
    Date,
    Timestamp,
    Mixed,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Bool => "bool",
            ColumnKind::Int => "int",
            ColumnKind::Float => "float",
            ColumnKind::Decimal => "decimal",
            ColumnKind::Text => "text",
            ColumnKind::Date => "date",
            ColumnKind::Timestamp => "timestamp",
            ColumnKind::Mixed => "mixed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "bool" => ColumnKind::Bool,
            "int" => ColumnKind::Int,
            "float" => ColumnKind::Float,
            "decimal" => ColumnKind::Decimal,
            "text" => ColumnKind::Text,
            "date" => ColumnKind::Date,
            "timestamp" => ColumnKind::Timestamp,
            "mixed" => ColumnKind::Mixed,
            _ => return None,
        })
    }

    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnKind::Bool),
            Value::Int(_) => Some(ColumnKind::Int),
            Value::Float(_) => Some(ColumnKind::Float),
            Value::Decimal(_) => Some(ColumnKind::Decimal),
            Value::Text(_) => Some(ColumnKind::Text),
            Value::Date(_) => Some(ColumnKind::Date),
            Value::Timestamp(_) => Some(ColumnKind::Timestamp),
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            ColumnKind::Bool => DataType::Boolean,
            ColumnKind::Int => DataType::Int64,
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Date => DataType::Date32,
            ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
            ColumnKind::Decimal | ColumnKind::Text | ColumnKind::Mixed => DataType::Utf8,
        }
    }
}

/// Encoded blob plus what the archive entry records about it.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub bytes: Bytes,
    pub columns: Vec<(String, ColumnKind)>,
    pub rows: usize,
    /// Uncompressed column data size reported by the writer.
    pub uncompressed_size: u64,
}

/// Sorted column layout of a rowset. All-null columns are text.
pub fn infer_columns(records: &[SourceRecord]) -> Vec<(String, ColumnKind)> {
    let mut kinds: BTreeMap<String, Option<ColumnKind>> = BTreeMap::new();
    for record in records {
        for (name, value) in record.columns() {
            let slot = kinds.entry(name.clone()).or_insert(None);
            match (*slot, ColumnKind::of(value)) {
                (_, None) => {}
                (None, Some(k)) => *slot = Some(k),
                (Some(a), Some(b)) if a != b => *slot = Some(ColumnKind::Mixed),
                _ => {}
            }
        }
    }
    kinds
        .into_iter()
        .map(|(name, kind)| (name, kind.unwrap_or(ColumnKind::Text)))
        .collect()
}

/// SHA-256 over the sorted `(column, type)` list.
pub fn schema_hash(columns: &[(String, ColumnKind)]) -> String {
    let mut hasher = Sha256::new();
    for (name, kind) in columns {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// SHA-256 over the canonical rendering of every row.
///
/// Each row renders all rowset columns in order; a missing column renders as
/// NULL, so a decoded rowset checksums the same as the original.
pub fn payload_checksum(records: &[SourceRecord]) -> String {
    let columns = infer_columns(records);
    let mut hasher = Sha256::new();
    for record in records {
        for (name, _) in &columns {
            let value = record.get(name).unwrap_or(&Value::Null);
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.canonical().as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"\x1e");
    }
    hex::encode(hasher.finalize())
}

/// SHA-256 of raw bytes.
pub fn blob_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn writer_properties() -> Result<WriterProperties> {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some(concat!("order-sync ", env!("CARGO_PKG_VERSION")).to_string()),
    };
    Ok(WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(ZSTD_LEVEL)?))
        .set_key_value_metadata(Some(vec![created_by]))
        .build())
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    (date - NaiveDate::default()).num_days() as i32
}

fn build_column(records: &[SourceRecord], name: &str, kind: ColumnKind) -> Result<ArrayRef> {
    let values = records.iter().map(|r| r.get(name).unwrap_or(&Value::Null));
    let mismatch = |v: &Value| {
        SyncError::Archive(format!(
            "column {} holds {} in a {} column",
            name,
            v.canonical(),
            kind.as_str()
        ))
    };

    let array: ArrayRef = match kind {
        ColumnKind::Bool => Arc::new(BooleanArray::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Bool(b) => Ok(Some(*b)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnKind::Int => Arc::new(Int64Array::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Int(i) => Ok(Some(*i)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnKind::Float => Arc::new(Float64Array::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Float(f) => Ok(Some(*f)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnKind::Date => Arc::new(Date32Array::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Date(d) => Ok(Some(days_since_epoch(*d))),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnKind::Timestamp => Arc::new(TimestampMicrosecondArray::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Timestamp(t) => Ok(Some(t.and_utc().timestamp_micros())),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnKind::Decimal | ColumnKind::Text => Arc::new(StringArray::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Decimal(d) => Ok(Some(d.to_string())),
                    Value::Text(s) => Ok(Some(s.clone())),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnKind::Mixed => Arc::new(StringArray::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    other => serde_json::to_string(other).map(Some).map_err(SyncError::from),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
    };
    Ok(array)
}

/// Encode a rowset as one ZSTD-compressed Parquet file.
pub fn encode(records: &[SourceRecord]) -> Result<Encoded> {
    let columns = infer_columns(records);
    if columns.is_empty() {
        return Err(SyncError::Archive("cannot archive a rowset without columns".into()));
    }

    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|(name, kind)| {
                Field::new(name, kind.data_type(), true).with_metadata(HashMap::from([(
                    KIND_KEY.to_string(),
                    kind.as_str().to_string(),
                )]))
            })
            .collect::<Vec<_>>(),
    ));
    let arrays = columns
        .iter()
        .map(|(name, kind)| build_column(records, name, *kind))
        .collect::<Result<Vec<_>>>()?;
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(writer_properties()?))?;
    writer.write(&batch)?;
    let metadata = writer.close()?;
    let uncompressed_size = metadata
        .row_groups
        .iter()
        .map(|rg| rg.total_byte_size.max(0) as u64)
        .sum();

    Ok(Encoded {
        bytes: Bytes::from(buffer),
        columns,
        rows: records.len(),
        uncompressed_size,
    })
}

fn column_kind(field: &Field) -> ColumnKind {
    if let Some(kind) = field.metadata().get(KIND_KEY).and_then(|k| ColumnKind::parse(k)) {
        return kind;
    }
    match field.data_type() {
        DataType::Boolean => ColumnKind::Bool,
        DataType::Int64 => ColumnKind::Int,
        DataType::Float64 => ColumnKind::Float,
        DataType::Date32 => ColumnKind::Date,
        DataType::Timestamp(_, _) => ColumnKind::Timestamp,
        _ => ColumnKind::Text,
    }
}

fn downcast<'a, T: 'static>(batch: &'a RecordBatch, idx: usize, name: &str) -> Result<&'a T> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| SyncError::Archive(format!("column {} has an unexpected layout", name)))
}

fn read_value(batch: &RecordBatch, idx: usize, row: usize, name: &str, kind: ColumnKind) -> Result<Value> {
    if batch.column(idx).is_null(row) {
        return Ok(Value::Null);
    }
    let bad = |what: &str| SyncError::Archive(format!("column {} row {}: {}", name, row, what));
    Ok(match kind {
        ColumnKind::Bool => Value::Bool(downcast::<BooleanArray>(batch, idx, name)?.value(row)),
        ColumnKind::Int => Value::Int(downcast::<Int64Array>(batch, idx, name)?.value(row)),
        ColumnKind::Float => Value::Float(downcast::<Float64Array>(batch, idx, name)?.value(row)),
        ColumnKind::Date => {
            let days = downcast::<Date32Array>(batch, idx, name)?.value(row);
            let date = NaiveDate::default()
                .checked_add_signed(chrono::Duration::days(days.into()))
                .ok_or_else(|| bad("date out of range"))?;
            Value::Date(date)
        }
        ColumnKind::Timestamp => {
            let micros = downcast::<TimestampMicrosecondArray>(batch, idx, name)?.value(row);
            let ts = DateTime::from_timestamp_micros(micros).ok_or_else(|| bad("timestamp out of range"))?;
            Value::Timestamp(ts.naive_utc())
        }
        ColumnKind::Decimal => {
            let raw = downcast::<StringArray>(batch, idx, name)?.value(row);
            Value::Decimal(raw.parse().map_err(|_| bad("invalid decimal"))?)
        }
        ColumnKind::Text => Value::Text(downcast::<StringArray>(batch, idx, name)?.value(row).to_string()),
        ColumnKind::Mixed => serde_json::from_str(downcast::<StringArray>(batch, idx, name)?.value(row))?,
    })
}

/// Decode a blob produced by [`encode`] back to records, in order.
pub fn decode(bytes: Bytes) -> Result<Vec<SourceRecord>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let schema = batch.schema();
        let layout: Vec<(String, ColumnKind)> = schema
            .fields()
            .iter()
            .map(|f| (f.name().clone(), column_kind(f)))
            .collect();
        for row in 0..batch.num_rows() {
            let mut record = SourceRecord::new();
            for (idx, (name, kind)) in layout.iter().enumerate() {
                record.set(name.clone(), read_value(&batch, idx, row, name, *kind)?);
            }
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn rows() -> Vec<SourceRecord> {
        let ship = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        vec![
            SourceRecord::new()
                .with("customer", "ACME")
                .with("qty", 12_i64)
                .with("price", Decimal::new(1250, 2))
                .with("ship_date", ship)
                .with("extracted_at", ship.and_hms_micro_opt(8, 30, 0, 123_456).unwrap())
                .with("weight", 1.5_f64)
                .with("flag", true)
                .with("odd", 7_i64),
            SourceRecord::new()
                .with("customer", "GLOBEX")
                .with("qty", Value::Null)
                .with("price", Decimal::new(5, 0))
                .with("ship_date", Value::Null)
                .with("weight", -0.25_f64)
                .with("flag", false)
                .with("odd", "seven"),
        ]
    }

    #[test]
    fn test_infer_columns() {
        let cols: BTreeMap<String, ColumnKind> = infer_columns(&rows()).into_iter().collect();
        assert_eq!(cols["qty"], ColumnKind::Int);
        assert_eq!(cols["price"], ColumnKind::Decimal);
        assert_eq!(cols["odd"], ColumnKind::Mixed);
        assert_eq!(cols["extracted_at"], ColumnKind::Timestamp);
    }

    #[test]
    fn test_decoded_rowset_has_same_payload_checksum() {
        let original = rows();
        let encoded = encode(&original).unwrap();
        assert_eq!(encoded.rows, 2);
        assert!(encoded.uncompressed_size > 0);

        let decoded = decode(encoded.bytes.clone()).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(payload_checksum(&decoded), payload_checksum(&original));
        assert_eq!(decoded[1].get("odd"), Some(&Value::Text("seven".into())));
        // Missing columns come back as NULL.
        assert_eq!(decoded[1].get("extracted_at"), Some(&Value::Null));
    }

    #[test]
    fn test_schema_hash_tracks_types() {
        let a = infer_columns(&rows());
        let mut b = a.clone();
        b[0].1 = ColumnKind::Text;
        assert_ne!(schema_hash(&a), schema_hash(&b));
        assert_eq!(schema_hash(&a), schema_hash(&infer_columns(&rows())));
    }

    #[test]
    fn test_empty_rowset_is_rejected() {
        assert!(encode(&[]).is_err());
    }
}
