//! Source table readers.
//!
//! - **PostgreSQL**: [`PgSourceReader`] reads the configured table
//! - **Memory**: [`MemorySource`] serves fixed rows (tests, dry runs)

use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::sync::RwLock;
use tokio_postgres::types::Type;
use tokio_postgres::Row;
use tracing::{debug, info};

use crate::db::{qualify, quote_ident};
use crate::error::{Result, SyncError};
use crate::record::{customer_matches, KeyColumns, SourceRecord, Value};

/// Reads the order lines to synchronize.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// All rows, or only those of one customer.
    async fn read(&self, customer_filter: Option<&str>) -> Result<Vec<SourceRecord>>;

    /// Name of the source table, used as the snapshot scope.
    fn table_name(&self) -> &str;
}

/// In-memory source with replaceable rows.
pub struct MemorySource {
    table: String,
    customer_column: String,
    rows: RwLock<Vec<SourceRecord>>,
}

impl MemorySource {
    pub fn new(table: impl Into<String>, rows: Vec<SourceRecord>) -> Self {
        Self {
            table: table.into(),
            customer_column: KeyColumns::default().customer,
            rows: RwLock::new(rows),
        }
    }

    pub fn with_key_columns(mut self, key_columns: &KeyColumns) -> Self {
        self.customer_column = key_columns.customer.clone();
        self
    }

    /// Replace the rows served by later reads.
    pub fn set_rows(&self, rows: Vec<SourceRecord>) -> Result<()> {
        let mut guard = self
            .rows
            .write()
            .map_err(|_| SyncError::Source("source lock poisoned".into()))?;
        *guard = rows;
        Ok(())
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn read(&self, customer_filter: Option<&str>) -> Result<Vec<SourceRecord>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| SyncError::Source("source lock poisoned".into()))?;
        Ok(match customer_filter {
            None => rows.clone(),
            Some(filter) => rows
                .iter()
                .filter(|r| {
                    r.get(&self.customer_column)
                        .and_then(Value::as_key_component)
                        .map(|c| customer_matches(&c, filter))
                        .unwrap_or(false)
                })
                .cloned()
                .collect(),
        })
    }

    fn table_name(&self) -> &str {
        &self.table
    }
}

/// Reads the source table from PostgreSQL.
pub struct PgSourceReader {
    pool: Pool,
    schema: String,
    table: String,
    customer_column: String,
}

impl PgSourceReader {
    pub fn new(pool: Pool, schema: impl Into<String>, table: impl Into<String>, key_columns: &KeyColumns) -> Self {
        Self {
            pool,
            schema: schema.into(),
            table: table.into(),
            customer_column: key_columns.customer.clone(),
        }
    }

    fn query(&self, filtered: bool) -> String {
        let mut sql = format!("SELECT * FROM {}", qualify(&self.schema, &self.table));
        if filtered {
            sql.push_str(&format!(
                " WHERE UPPER(TRIM({}::text)) = $1",
                quote_ident(&self.customer_column)
            ));
        }
        sql
    }
}

#[async_trait]
impl SourceReader for PgSourceReader {
    async fn read(&self, customer_filter: Option<&str>) -> Result<Vec<SourceRecord>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| SyncError::pool(e.to_string(), "reading source table"))?;

        let filter = customer_filter.map(|f| f.trim().to_uppercase());
        let sql = self.query(filter.is_some());
        debug!("source query: {}", sql);
        let rows = match &filter {
            Some(f) => client.query(sql.as_str(), &[f]).await?,
            None => client.query(sql.as_str(), &[]).await?,
        };

        let records = rows.iter().map(record_from_row).collect::<Result<Vec<_>>>()?;
        info!(
            "Read {} rows from {}.{}{}",
            records.len(),
            self.schema,
            self.table,
            filter.map(|f| format!(" for {}", f)).unwrap_or_default()
        );
        Ok(records)
    }

    fn table_name(&self) -> &str {
        &self.table
    }
}

fn record_from_row(row: &Row) -> Result<SourceRecord> {
    let mut record = SourceRecord::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = convert_value(row, idx, column.type_()).map_err(|e| {
            SyncError::Validation(format!("column {}: {}", column.name(), e))
        })?;
        record.set(column.name(), value);
    }
    Ok(record)
}

/// Decode one column into a [`Value`], keeping NULL distinct.
fn convert_value(
    row: &Row,
    idx: usize,
    ty: &Type,
) -> std::result::Result<Value, tokio_postgres::Error> {
    fn opt<T>(v: Option<T>, f: impl FnOnce(T) -> Value) -> Value {
        v.map(f).unwrap_or(Value::Null)
    }

    Ok(match *ty {
        Type::BOOL => opt(row.try_get::<_, Option<bool>>(idx)?, Value::Bool),
        Type::INT2 => opt(row.try_get::<_, Option<i16>>(idx)?, |v| Value::Int(v.into())),
        Type::INT4 => opt(row.try_get::<_, Option<i32>>(idx)?, |v| Value::Int(v.into())),
        Type::INT8 => opt(row.try_get::<_, Option<i64>>(idx)?, Value::Int),
        Type::FLOAT4 => opt(row.try_get::<_, Option<f32>>(idx)?, |v| Value::Float(v.into())),
        Type::FLOAT8 => opt(row.try_get::<_, Option<f64>>(idx)?, Value::Float),
        Type::NUMERIC => opt(
            row.try_get::<_, Option<rust_decimal::Decimal>>(idx)?,
            Value::Decimal,
        ),
        Type::DATE => opt(row.try_get::<_, Option<chrono::NaiveDate>>(idx)?, Value::Date),
        Type::TIMESTAMP => opt(
            row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)?,
            Value::Timestamp,
        ),
        Type::TIMESTAMPTZ => opt(
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?,
            |v| Value::Timestamp(v.naive_utc()),
        ),
        Type::UUID => opt(row.try_get::<_, Option<uuid::Uuid>>(idx)?, |v| {
            Value::Text(v.to_string())
        }),
        Type::JSON | Type::JSONB => opt(row.try_get::<_, Option<serde_json::Value>>(idx)?, |v| {
            Value::Text(v.to_string())
        }),
        _ => opt(row.try_get::<_, Option<String>>(idx)?, Value::Text),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(customer: &str, order: &str) -> SourceRecord {
        SourceRecord::new()
            .with("customer", customer)
            .with("order_number", order)
    }

    #[tokio::test]
    async fn test_memory_source_filters_by_customer() {
        let source = MemorySource::new(
            "orders",
            vec![row("ACME", "1"), row(" acme ", "2"), row("GLOBEX", "3")],
        );

        assert_eq!(source.read(None).await.unwrap().len(), 3);
        assert_eq!(source.read(Some("Acme")).await.unwrap().len(), 2);
        assert!(source.read(Some("INITECH")).await.unwrap().is_empty());
        assert_eq!(source.table_name(), "orders");
    }

    #[tokio::test]
    async fn test_memory_source_rows_can_be_replaced() {
        let source = MemorySource::new("orders", vec![row("ACME", "1")]);
        source.set_rows(vec![]).unwrap();
        assert!(source.read(None).await.unwrap().is_empty());
    }
}
