//! Filter evaluator (C11): interprets a predicate tree against a single
//! metadata record. Used both as the reference semantics for the metadata
//! index (C6) and as its fallback for predicates the index cannot
//! accelerate (regex).

use crate::model::Value;
use regex::Regex;
use std::collections::BTreeMap;

/// A predicate tree over metadata field paths.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Contains(String, Value),
    Regex(String, String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// True if this subtree (or any descendant) uses an operator the
    /// metadata index cannot accelerate.
    pub fn requires_fallback(&self) -> bool {
        match self {
            Predicate::Regex(_, _) => true,
            Predicate::And(items) | Predicate::Or(items) => {
                items.iter().any(Predicate::requires_fallback)
            }
            Predicate::Not(inner) => inner.requires_fallback(),
            _ => false,
        }
    }

    /// All field paths this predicate references, for cache invalidation
    /// and `explain` reporting.
    pub fn field_paths(&self) -> Vec<&str> {
        match self {
            Predicate::Eq(f, _)
            | Predicate::In(f, _)
            | Predicate::NotIn(f, _)
            | Predicate::Gt(f, _)
            | Predicate::Gte(f, _)
            | Predicate::Lt(f, _)
            | Predicate::Lte(f, _)
            | Predicate::Contains(f, _)
            | Predicate::Regex(f, _) => vec![f.as_str()],
            Predicate::And(items) | Predicate::Or(items) => {
                items.iter().flat_map(Predicate::field_paths).collect()
            }
            Predicate::Not(inner) => inner.field_paths(),
        }
    }
}

/// Look up a dot-separated field path in a metadata map. A missing
/// intermediate map, or a path that walks into a non-map value, yields
/// `None` (spec: "missing fields compare as not equal, not as an error").
pub fn get_path<'a>(metadata: &'a BTreeMap<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = metadata.get(first)?;
    for segment in segments {
        match current {
            Value::Map(m) => current = m.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a.order_key(), b.order_key()) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        _ => match (a, b) {
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

/// Evaluate `predicate` against a single record's metadata.
pub fn evaluate(predicate: &Predicate, metadata: &BTreeMap<String, Value>) -> bool {
    match predicate {
        Predicate::Eq(f, v) => get_path(metadata, f).map(|actual| actual.loosely_eq(v)).unwrap_or(false),
        Predicate::In(f, vs) => get_path(metadata, f)
            .map(|actual| vs.iter().any(|v| actual.loosely_eq(v)))
            .unwrap_or(false),
        Predicate::NotIn(f, vs) => !get_path(metadata, f)
            .map(|actual| vs.iter().any(|v| actual.loosely_eq(v)))
            .unwrap_or(false),
        Predicate::Gt(f, v) => get_path(metadata, f)
            .and_then(|actual| numeric_cmp(actual, v))
            .map(|o| o.is_gt())
            .unwrap_or(false),
        Predicate::Gte(f, v) => get_path(metadata, f)
            .and_then(|actual| numeric_cmp(actual, v))
            .map(|o| !o.is_lt())
            .unwrap_or(false),
        Predicate::Lt(f, v) => get_path(metadata, f)
            .and_then(|actual| numeric_cmp(actual, v))
            .map(|o| o.is_lt())
            .unwrap_or(false),
        Predicate::Lte(f, v) => get_path(metadata, f)
            .and_then(|actual| numeric_cmp(actual, v))
            .map(|o| !o.is_gt())
            .unwrap_or(false),
        Predicate::Contains(f, v) => match get_path(metadata, f) {
            Some(Value::Array(items)) => items.iter().any(|item| item.loosely_eq(v)),
            _ => false,
        },
        Predicate::Regex(f, pattern) => {
            let Ok(re) = Regex::new(pattern) else { return false };
            match get_path(metadata, f) {
                Some(Value::String(s)) => re.is_match(s),
                _ => false,
            }
        }
        Predicate::And(items) => items.iter().all(|p| evaluate(p, metadata)),
        Predicate::Or(items) => items.iter().any(|p| evaluate(p, metadata)),
        Predicate::Not(inner) => !evaluate(inner, metadata),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn equality_is_case_insensitive_for_strings() {
        let m = md(&[("role", Value::String("Developer".into()))]);
        assert!(evaluate(&Predicate::Eq("role".into(), Value::String("developer".into())), &m));
    }

    #[test]
    fn missing_field_is_not_equal_not_error() {
        let m = md(&[]);
        assert!(!evaluate(&Predicate::Eq("role".into(), Value::String("developer".into())), &m));
        assert!(evaluate(&Predicate::NotIn("role".into(), vec![Value::String("developer".into())]), &m));
    }

    #[test]
    fn range_operators() {
        let m = md(&[("price", Value::Number(999.0))]);
        assert!(evaluate(&Predicate::Gt("price".into(), Value::Number(500.0)), &m));
        assert!(!evaluate(&Predicate::Lt("price".into(), Value::Number(500.0)), &m));
        assert!(evaluate(&Predicate::Gte("price".into(), Value::Number(999.0)), &m));
    }

    #[test]
    fn contains_checks_array_membership() {
        let m = md(&[("tags", Value::Array(vec![Value::String("urgent".into())]))]);
        assert!(evaluate(&Predicate::Contains("tags".into(), Value::String("urgent".into())), &m));
        assert!(!evaluate(&Predicate::Contains("tags".into(), Value::String("other".into())), &m));
    }

    #[test]
    fn nested_path_traversal() {
        let mut nested = BTreeMap::new();
        nested.insert("city".to_string(), Value::String("Berlin".into()));
        let m = md(&[("address", Value::Map(nested))]);
        assert!(evaluate(&Predicate::Eq("address.city".into(), Value::String("berlin".into())), &m));
    }

    #[test]
    fn logical_composition() {
        let m = md(&[("status", Value::String("active".into())), ("priority", Value::Number(2.0))]);
        let pred = Predicate::Or(vec![
            Predicate::Eq("status".into(), Value::String("inactive".into())),
            Predicate::In("priority".into(), vec![Value::Number(1.0), Value::Number(2.0)]),
        ]);
        assert!(evaluate(&pred, &m));
        assert!(!evaluate(&Predicate::Not(Box::new(pred)), &m));
    }

    #[test]
    fn regex_needs_fallback_detection() {
        let pred = Predicate::And(vec![
            Predicate::Eq("a".into(), Value::Bool(true)),
            Predicate::Regex("b".into(), "^x".into()),
        ]);
        assert!(pred.requires_fallback());
    }
}
