//! Source rows, typed column values and the composite business key.
//!
//! Values render to a canonical, type-tagged string form that is shared by
//! the [`Hasher`](crate::hasher::Hasher) and the archive payload checksum:
//!
//! - NULL renders as a bare tag, distinct from the text `"NULL"`
//! - Text normalizes CRLF to LF
//! - Floats use the shortest round-trip form, `-0.0` folds to `0`
//! - Decimals are normalized so `1.50` and `1.5` agree
//! - Dates and timestamps use ISO 8601

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A typed column value read from the source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Check if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical type-tagged rendering used for hashing and checksums.
    pub fn canonical(&self) -> String {
        match self {
            Value::Null => "~".to_string(),
            Value::Bool(v) => format!("b:{}", if *v { 1 } else { 0 }),
            Value::Int(v) => format!("i:{}", v),
            Value::Float(v) => {
                if v.is_nan() {
                    "f:NaN".to_string()
                } else if *v == 0.0 {
                    "f:0".to_string()
                } else {
                    format!("f:{}", v)
                }
            }
            Value::Decimal(v) => format!("d:{}", v.normalize()),
            Value::Text(v) => format!("t:{}", v.replace("\r\n", "\n")),
            Value::Date(v) => format!("D:{}", v.format("%Y-%m-%d")),
            Value::Timestamp(v) => format!("T:{}", v.format("%Y-%m-%dT%H:%M:%S%.6f")),
        }
    }

    /// Render as a trimmed, non-empty key component.
    ///
    /// Returns `None` for NULL, blank text and types that cannot identify a record.
    pub fn as_key_component(&self) -> Option<String> {
        match self {
            Value::Text(v) => {
                let trimmed = v.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Value::Int(v) => Some(v.to_string()),
            Value::Decimal(v) => Some(v.normalize().to_string()),
            _ => None,
        }
    }

    /// Interpret as a whole quantity (size breakdown columns).
    ///
    /// `Ok(None)` means "no quantity" (NULL or blank); `Err` carries the
    /// offending rendering.
    pub fn as_quantity(&self) -> std::result::Result<Option<i64>, String> {
        match self {
            Value::Null => Ok(None),
            Value::Int(v) => Ok(Some(*v)),
            Value::Float(v) if v.fract() == 0.0 && v.is_finite() => Ok(Some(*v as i64)),
            Value::Decimal(v) if v.fract().is_zero() => i64::try_from(v.trunc())
                .map(Some)
                .map_err(|_| v.to_string()),
            Value::Text(v) if v.trim().is_empty() => Ok(None),
            Value::Text(v) => v.trim().parse().map(Some).map_err(|_| v.clone()),
            other => Err(other.canonical()),
        }
    }

    /// Convert to JSON for staging payloads and platform column values.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(v) => serde_json::Value::Bool(*v),
            Value::Int(v) => serde_json::Value::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Decimal(v) => serde_json::Value::String(v.normalize().to_string()),
            Value::Text(v) => serde_json::Value::String(v.clone()),
            Value::Date(v) => serde_json::Value::String(v.format("%Y-%m-%d").to_string()),
            Value::Timestamp(v) => {
                serde_json::Value::String(v.format("%Y-%m-%dT%H:%M:%S").to_string())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

/// One row of the source table.
///
/// Columns are held by name, so storage order never leaks into hashing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    columns: BTreeMap<String, Value>,
}

impl SourceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.columns.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.get(name)
    }

    /// Columns in canonical (name) order.
    pub fn columns(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.columns.iter()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for SourceRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            columns: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Source column names that make up the business key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyColumns {
    #[serde(default = "default_customer_column")]
    pub customer: String,
    #[serde(default = "default_order_column")]
    pub order_number: String,
    #[serde(default = "default_style_column")]
    pub style: String,
    #[serde(default = "default_color_column")]
    pub color: String,
    #[serde(default = "default_po_column")]
    pub po_number: String,
}

impl Default for KeyColumns {
    fn default() -> Self {
        Self {
            customer: default_customer_column(),
            order_number: default_order_column(),
            style: default_style_column(),
            color: default_color_column(),
            po_number: default_po_column(),
        }
    }
}

impl KeyColumns {
    /// All key column names, in key order.
    pub fn names(&self) -> [&str; 5] {
        [
            self.customer.as_str(),
            self.order_number.as_str(),
            self.style.as_str(),
            self.color.as_str(),
            self.po_number.as_str(),
        ]
    }

    pub fn contains(&self, column: &str) -> bool {
        self.names().iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

/// Composite natural identifier of an order line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BusinessKey {
    pub customer: String,
    pub order_number: String,
    pub style: String,
    pub color: String,
    pub po_number: String,
}

impl BusinessKey {
    pub fn new(
        customer: impl Into<String>,
        order_number: impl Into<String>,
        style: impl Into<String>,
        color: impl Into<String>,
        po_number: impl Into<String>,
    ) -> Self {
        Self {
            customer: customer.into(),
            order_number: order_number.into(),
            style: style.into(),
            color: color.into(),
            po_number: po_number.into(),
        }
    }

    /// Resolve the key of a record.
    ///
    /// Fails with the names of the missing components when any component is
    /// NULL or blank. The customer is upper-cased: customers compare
    /// case-insensitively everywhere, in filters as well as per-customer
    /// batches and snapshot slices.
    pub fn from_record(
        record: &SourceRecord,
        columns: &KeyColumns,
    ) -> std::result::Result<Self, Vec<String>> {
        let component = |name: &str| record.get(name).and_then(Value::as_key_component);

        let parts: Vec<Option<String>> = columns.names().iter().map(|c| component(*c)).collect();
        let missing: Vec<String> = columns
            .names()
            .iter()
            .zip(&parts)
            .filter(|(_, v)| v.is_none())
            .map(|(name, _)| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }

        let mut parts = parts.into_iter().flatten();
        let mut next = || parts.next().unwrap_or_default();
        Ok(Self {
            customer: next().to_uppercase(),
            order_number: next(),
            style: next(),
            color: next(),
            po_number: next(),
        })
    }

    /// Whether this key belongs to the given customer filter.
    pub fn matches_customer(&self, filter: &str) -> bool {
        customer_matches(&self.customer, filter)
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.customer, self.order_number, self.style, self.color, self.po_number
        )
    }
}

/// Customer filters match case-insensitively, ignoring surrounding whitespace.
pub fn customer_matches(customer: &str, filter: &str) -> bool {
    customer.trim().eq_ignore_ascii_case(filter.trim())
}

fn default_customer_column() -> String {
    "customer".to_string()
}

fn default_order_column() -> String {
    "order_number".to_string()
}

fn default_style_column() -> String {
    "style".to_string()
}

fn default_color_column() -> String {
    "color".to_string()
}

fn default_po_column() -> String {
    "po_number".to_string()
}
