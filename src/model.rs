//! Core data model: nouns (entities), verbs (relationships), and the
//! dynamically-typed metadata value union.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hard invariant: every stored vector has exactly this many dimensions.
pub const VECTOR_DIM: usize = 384;

/// A dynamically-typed metadata value.
///
/// Mirrors the JSON-like union the spec requires: `null | bool | number |
/// string | array<value> | map<string,value>`. Kept as its own enum (rather
/// than reusing `serde_json::Value` directly in public signatures) so the
/// metadata index and filter evaluator can dispatch on it without a
/// dependency on `serde_json`'s number representation leaking everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absence of a value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Numeric value (integers and floats share one representation).
    Number(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Nested map, ordered by key for deterministic serialization.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Normalized, case-folded token used as an equality-index key.
    ///
    /// Strings are lowercased; numbers are canonicalized through their bit
    /// pattern; booleans and null get fixed tokens. Arrays/maps have no
    /// single token and must be indexed element-wise by the caller.
    pub fn equality_token(&self) -> Option<String> {
        match self {
            Value::Null => Some("null".to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(format!("{:.017e}", n)),
            Value::String(s) => Some(s.to_lowercase()),
            Value::Array(_) | Value::Map(_) => None,
        }
    }

    /// Ordering key for range-indexed (numeric/date) fields, if applicable.
    pub fn order_key(&self) -> Option<OrderedF64> {
        match self {
            Value::Number(n) => Some(OrderedF64(*n)),
            _ => None,
        }
    }

    /// True if this value satisfies a case-insensitive equality comparison
    /// against `other`.
    pub fn loosely_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
            _ => self == other,
        }
    }
}

/// Total-ordering wrapper over `f64` for use as a `BTreeMap` key.
///
/// NaN never enters the index (vectors and numeric metadata are validated
/// on write), so `partial_cmp` is safe to unwrap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderedF64(pub f64);

impl Eq for OrderedF64 {}
impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// Closed set of noun kinds, plus an escape hatch for user-defined types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NounType {
    Person,
    Organization,
    Place,
    Event,
    Document,
    Concept,
    Product,
    Project,
    Task,
    Process,
    Language,
    Message,
    Thing,
    /// User-defined extension tag.
    Other(String),
}

impl std::fmt::Display for NounType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NounType::Other(s) => write!(f, "{s}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Closed set of verb kinds, plus an escape hatch for user-defined types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerbType {
    WorksWith,
    Creates,
    Modifies,
    RelatedTo,
    DependsOn,
    Contains,
    MemberOf,
    References,
    WorksOn,
    Manages,
    Sponsors,
    Attends,
    /// User-defined extension tag.
    Other(String),
}

impl std::fmt::Display for VerbType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerbType::Other(s) => write!(f, "{s}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// An entity: embedding vector, type, and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Noun {
    pub id: String,
    pub r#type: NounType,
    pub vector: Vec<f32>,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
    pub service: Option<String>,
}

impl Noun {
    /// Validate the hard dimension/finiteness invariant (spec §3 invariant 1).
    pub fn validate_vector(vector: &[f32]) -> crate::error::Result<()> {
        if vector.len() != VECTOR_DIM {
            return Err(crate::error::DbError::DimensionMismatch {
                expected: VECTOR_DIM,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(crate::error::DbError::InvalidInput(
                "vector contains NaN or infinite components".to_string(),
            ));
        }
        Ok(())
    }
}

/// A typed directed edge between two nouns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verb {
    pub id: String,
    pub from: String,
    pub to: String,
    pub r#type: VerbType,
    pub weight: f64,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
