//! Where predicates
//!
//! Predicates are evaluated against a materialized document with AND
//! semantics. Only `eq` and range operators can narrow an index scan; every
//! operator is also usable as a post-filter.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::path;
use crate::error::{DbError, DbResult};

static NULL: Value = Value::Null;

/// Prefix marking a value that refers to a field of the evaluated document
pub const SELF_REF_PREFIX: &str = "$.";

/// Predicate operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum WhereOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
    ContainsAll,
    ContainsAny,
    HasPrefix,
    HasSuffix,
    Regex,
}

impl WhereOp {
    /// Canonical operator name
    pub fn as_str(&self) -> &'static str {
        match self {
            WhereOp::Eq => "eq",
            WhereOp::Neq => "neq",
            WhereOp::Gt => "gt",
            WhereOp::Gte => "gte",
            WhereOp::Lt => "lt",
            WhereOp::Lte => "lte",
            WhereOp::In => "in",
            WhereOp::Contains => "contains",
            WhereOp::ContainsAll => "containsAll",
            WhereOp::ContainsAny => "containsAny",
            WhereOp::HasPrefix => "hasPrefix",
            WhereOp::HasSuffix => "hasSuffix",
            WhereOp::Regex => "regex",
        }
    }

    /// Range operators usable as a seek bound
    pub fn is_range(&self) -> bool {
        matches!(self, WhereOp::Gt | WhereOp::Gte | WhereOp::Lt | WhereOp::Lte)
    }
}

impl FromStr for WhereOp {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "eq" | "==" => WhereOp::Eq,
            "neq" | "!=" => WhereOp::Neq,
            "gt" | ">" => WhereOp::Gt,
            "gte" | ">=" => WhereOp::Gte,
            "lt" | "<" => WhereOp::Lt,
            "lte" | "<=" => WhereOp::Lte,
            "in" => WhereOp::In,
            "contains" => WhereOp::Contains,
            "containsAll" => WhereOp::ContainsAll,
            "containsAny" => WhereOp::ContainsAny,
            "hasPrefix" => WhereOp::HasPrefix,
            "hasSuffix" => WhereOp::HasSuffix,
            "regex" => WhereOp::Regex,
            other => return Err(DbError::InvalidOperator(other.to_string())),
        })
    }
}

impl TryFrom<String> for WhereOp {
    type Error = DbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WhereOp> for &'static str {
    fn from(op: WhereOp) -> Self {
        op.as_str()
    }
}

impl fmt::Display for WhereOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single predicate `{field, op, value}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Where {
    pub field: String,
    pub op: WhereOp,
    #[serde(default)]
    pub value: Value,
}

impl Where {
    pub fn new(field: impl Into<String>, op: WhereOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, WhereOp::Eq, value)
    }

    pub fn neq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, WhereOp::Neq, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, WhereOp::Gt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, WhereOp::Gte, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, WhereOp::Lt, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, WhereOp::Lte, value)
    }

    /// Whether `value` refers to a field of the evaluated document.
    pub fn is_self_ref(&self) -> bool {
        self.value
            .as_str()
            .is_some_and(|s| s.starts_with(SELF_REF_PREFIX))
    }

    /// Evaluates the predicate against a document value.
    pub fn evaluate(&self, doc: &Value) -> DbResult<bool> {
        let actual = path::get(doc, &self.field).unwrap_or(&NULL);
        let expected = resolve(&self.value, doc);

        Ok(match self.op {
            WhereOp::Eq => values_equal(actual, expected),
            WhereOp::Neq => !values_equal(actual, expected),
            WhereOp::Gt => compare_operands(actual, expected) == Some(Ordering::Greater),
            WhereOp::Gte => matches!(
                compare_operands(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            WhereOp::Lt => compare_operands(actual, expected) == Some(Ordering::Less),
            WhereOp::Lte => matches!(
                compare_operands(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            WhereOp::In => as_set(expected).iter().any(|v| values_equal(actual, v)),
            WhereOp::Contains => match (actual, expected) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
                _ => false,
            },
            WhereOp::ContainsAll => match actual {
                Value::Array(items) => as_set(expected)
                    .iter()
                    .all(|e| items.iter().any(|v| values_equal(v, e))),
                _ => false,
            },
            WhereOp::ContainsAny => match actual {
                Value::Array(items) => as_set(expected)
                    .iter()
                    .any(|e| items.iter().any(|v| values_equal(v, e))),
                _ => false,
            },
            WhereOp::HasPrefix => match (actual, expected) {
                (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            WhereOp::HasSuffix => match (actual, expected) {
                (Value::String(s), Value::String(suffix)) => s.ends_with(suffix.as_str()),
                _ => false,
            },
            WhereOp::Regex => match (actual, expected) {
                (Value::String(s), Value::String(pattern)) => Regex::new(pattern)?.is_match(s),
                (_, Value::String(pattern)) => {
                    // still surface a bad pattern even when the field is absent
                    Regex::new(pattern)?;
                    false
                }
                _ => {
                    return Err(DbError::validation(format!(
                        "regex predicate on '{}' needs a string pattern",
                        self.field
                    )))
                }
            },
        })
    }
}

impl fmt::Display for Where {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op, self.value)
    }
}

/// Evaluates every predicate, short-circuiting on the first failure.
pub fn matches_all(doc: &Value, predicates: &[Where]) -> DbResult<bool> {
    for predicate in predicates {
        if !predicate.evaluate(doc)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Replaces a `$.path` reference with the value from `doc`.
pub fn resolve<'a>(value: &'a Value, doc: &'a Value) -> &'a Value {
    match value.as_str().and_then(|s| s.strip_prefix(SELF_REF_PREFIX)) {
        Some(field) => path::get(doc, field).unwrap_or(&NULL),
        None => value,
    }
}

/// Equality with numeric coercion.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Best-effort float coercion used by range predicates and reducers.
pub fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Total ordering for sorting: null < bool < number < string < array/object.
///
/// Missing values sort first. Arrays and objects compare by their JSON text.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            let rank = |v: &Value| -> u8 {
                match v {
                    Value::Null => 0,
                    Value::Bool(_) => 1,
                    Value::Number(_) => 2,
                    Value::String(_) => 3,
                    Value::Array(_) | Value::Object(_) => 4,
                }
            };
            match rank(a).cmp(&rank(b)) {
                Ordering::Equal => {}
                other => return other,
            }
            match (a, b) {
                (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
                (Value::Number(x), Value::Number(y)) => {
                    let x = x.as_f64().unwrap_or(0.0);
                    let y = y.as_f64().unwrap_or(0.0);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
                (Value::String(x), Value::String(y)) => x.cmp(y),
                (Value::Null, Value::Null) => Ordering::Equal,
                _ => a.to_string().cmp(&b.to_string()),
            }
        }
    }
}

fn compare_operands(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Null, _) | (_, Value::Null) => None,
        _ => to_f64(actual)?.partial_cmp(&to_f64(expected)?),
    }
}

fn as_set(value: &Value) -> &[Value] {
    match value {
        Value::Array(items) => items,
        other => std::slice::from_ref(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "name": "Ada Lovelace",
            "age": 36,
            "score": "12.5",
            "tags": ["math", "poetry"],
            "contact": {"email": "ada@example.com"},
            "manager": "Ada Lovelace"
        })
    }

    #[test]
    fn test_equality_coerces_numbers() {
        assert!(Where::eq("age", 36.0).evaluate(&doc()).unwrap());
        assert!(Where::neq("age", 37).evaluate(&doc()).unwrap());
        assert!(!Where::eq("missing", "x").evaluate(&doc()).unwrap());
        assert!(Where::eq("missing", Value::Null).evaluate(&doc()).unwrap());
    }

    #[test]
    fn test_range_operators() {
        let d = doc();
        assert!(Where::gt("age", 30).evaluate(&d).unwrap());
        assert!(Where::gte("age", 36).evaluate(&d).unwrap());
        assert!(!Where::lt("age", 36).evaluate(&d).unwrap());
        assert!(Where::lte("score", 12.5).evaluate(&d).unwrap());
        assert!(Where::gt("name", "Ada").evaluate(&d).unwrap());
        assert!(!Where::lt("missing", 10).evaluate(&d).unwrap());
    }

    #[test]
    fn test_set_operators() {
        let d = doc();
        assert!(Where::new("age", WhereOp::In, json!([1, 36])).evaluate(&d).unwrap());
        assert!(Where::new("tags", WhereOp::Contains, "math").evaluate(&d).unwrap());
        assert!(Where::new("name", WhereOp::Contains, "Love").evaluate(&d).unwrap());
        assert!(Where::new("tags", WhereOp::ContainsAll, json!(["math", "poetry"]))
            .evaluate(&d)
            .unwrap());
        assert!(!Where::new("tags", WhereOp::ContainsAll, json!(["math", "chess"]))
            .evaluate(&d)
            .unwrap());
        assert!(Where::new("tags", WhereOp::ContainsAny, json!(["chess", "poetry"]))
            .evaluate(&d)
            .unwrap());
    }

    #[test]
    fn test_string_operators() {
        let d = doc();
        assert!(Where::new("contact.email", WhereOp::HasSuffix, "@example.com")
            .evaluate(&d)
            .unwrap());
        assert!(Where::new("name", WhereOp::HasPrefix, "Ada").evaluate(&d).unwrap());
        assert!(Where::new("name", WhereOp::Regex, "^Ada\\s+L").evaluate(&d).unwrap());
        let err = Where::new("name", WhereOp::Regex, "(").evaluate(&d).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_self_reference() {
        let predicate = Where::eq("manager", "$.name");
        assert!(predicate.is_self_ref());
        assert!(predicate.evaluate(&doc()).unwrap());
    }

    #[test]
    fn test_matches_all_short_circuits() {
        let d = doc();
        let preds = vec![Where::eq("age", 1), Where::new("name", WhereOp::Regex, "(")];
        // second predicate would error, but the first already fails
        assert!(!matches_all(&d, &preds).unwrap());
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!("containsAny".parse::<WhereOp>().unwrap(), WhereOp::ContainsAny);
        assert_eq!("==".parse::<WhereOp>().unwrap(), WhereOp::Eq);
        let err = "like".parse::<WhereOp>().unwrap_err();
        assert_eq!(err.code(), "INVALID_OPERATOR");

        let w: Where = serde_json::from_value(json!({"field": "a", "op": "hasPrefix", "value": "x"}))
            .unwrap();
        assert_eq!(w.op, WhereOp::HasPrefix);
        assert!(serde_json::from_value::<Where>(json!({"field": "a", "op": "like"})).is_err());
        assert_eq!(serde_json::to_value(WhereOp::ContainsAll).unwrap(), json!("containsAll"));
    }

    #[test]
    fn test_compare_values_type_rank() {
        use std::cmp::Ordering::*;
        assert_eq!(compare_values(None, Some(&json!(1))), Less);
        assert_eq!(compare_values(Some(&json!(true)), Some(&json!(0))), Less);
        assert_eq!(compare_values(Some(&json!(2)), Some(&json!(10))), Less);
        assert_eq!(compare_values(Some(&json!("b")), Some(&json!("a"))), Greater);
        assert_eq!(compare_values(Some(&json!("z")), Some(&json!([1]))), Less);
    }
}
