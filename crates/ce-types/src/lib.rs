#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ordering of the variants doubles as the cross-type sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Bool,
    Number,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl Value {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Number(_) => DType::Number,
            Self::Bool(_) => DType::Bool,
            Self::Text(_) => DType::Text,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Lenient numeric coercion: text that does not read as a number
    /// becomes NaN, blank text becomes zero.
    #[must_use]
    pub fn coerce_number(&self) -> f64 {
        match self {
            Self::Number(v) => *v,
            Self::Bool(v) => f64::from(u8::from(*v)),
            Self::Text(v) => coerce_text(v),
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Number(v) => Ok(*v),
            Self::Bool(v) => Ok(f64::from(u8::from(*v))),
            Self::Text(v) => Err(TypeError::NonNumericValue {
                value: v.clone(),
                dtype: DType::Text,
            }),
        }
    }

    /// Rendering used when values are joined into composite group keys.
    #[must_use]
    pub fn key_string(&self) -> String {
        match self {
            Self::Number(v) => format_number(*v),
            Self::Bool(v) => v.to_string(),
            Self::Text(v) => v.clone(),
        }
    }

    /// Total order used for ranking. Values of different dtypes order by
    /// dtype (`Bool < Number < Text`).
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            // Signed zeros compare equal; NaN still needs a total position.
            (Self::Number(a), Self::Number(b)) if a == b => Ordering::Equal,
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            _ => self.dtype().cmp(&other.dtype()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key_string())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Compare two possibly-missing field values; a missing value sorts first.
#[must_use]
pub fn cmp_missing_first(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(a), Some(b)) => a.total_cmp(b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Lenient reading of text as a number, as used by [`Value::coerce_number`].
#[must_use]
pub fn coerce_text(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    // `f64::from_str` also accepts "inf" and "nan" spellings.
    if trimmed
        .bytes()
        .any(|b| b.is_ascii_alphabetic() && b != b'e' && b != b'E')
    {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

fn format_number(value: f64) -> String {
    if value == 0.0 {
        "0".to_owned()
    } else if value == f64::INFINITY {
        "Infinity".to_owned()
    } else if value == f64::NEG_INFINITY {
        "-Infinity".to_owned()
    } else if value.abs() >= 1e21 || value.abs() < 1e-6 {
        // Exponent form with an explicit sign, e.g. "1e+21" and "1.5e-7".
        let formatted = format!("{value:e}");
        match formatted.split_once('e') {
            Some((mantissa, exponent)) if !exponent.starts_with('-') => {
                format!("{mantissa}e+{exponent}")
            }
            _ => formatted,
        }
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub u64);

impl From<u64> for RowId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Row {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id: RowId(id),
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("value {value:?} has non-numeric dtype {dtype:?}")]
    NonNumericValue { value: String, dtype: DType },
    #[error("row {row} has no value for field {field:?}")]
    MissingField { row: RowId, field: String },
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::{DType, Row, RowId, TypeError, Value, cmp_missing_first};

    #[test]
    fn lenient_coercion_follows_dynamic_number_rules() {
        assert_eq!(Value::from(true).coerce_number(), 1.0);
        assert_eq!(Value::from("  12.5 ").coerce_number(), 12.5);
        assert_eq!(Value::from("").coerce_number(), 0.0);
        assert_eq!(Value::from("-Infinity").coerce_number(), f64::NEG_INFINITY);
        assert!(Value::from("12abc").coerce_number().is_nan());
        assert!(Value::from("inf").coerce_number().is_nan());
    }

    #[test]
    fn strict_conversion_rejects_text() {
        let err = Value::from("7").to_f64().expect_err("text is not numeric");
        assert_eq!(
            err,
            TypeError::NonNumericValue {
                value: "7".to_owned(),
                dtype: DType::Text
            }
        );
        assert_eq!(Value::from(false).to_f64().expect("bool converts"), 0.0);
    }

    #[test]
    fn key_string_renders_integers_without_fraction() {
        assert_eq!(Value::from(1.0).key_string(), "1");
        assert_eq!(Value::from(1.5).key_string(), "1.5");
        assert_eq!(Value::from(-0.0).key_string(), "0");
        assert_eq!(Value::from(f64::INFINITY).key_string(), "Infinity");
        assert_eq!(Value::from(true).key_string(), "true");
    }

    #[test]
    fn key_string_switches_to_exponent_form_at_extremes() {
        assert_eq!(Value::from(1e21).key_string(), "1e+21");
        assert_eq!(Value::from(-2.5e22).key_string(), "-2.5e+22");
        assert_eq!(Value::from(1e20).key_string(), "100000000000000000000");
        assert_eq!(Value::from(1e-7).key_string(), "1e-7");
        assert_eq!(Value::from(1.5e-7).key_string(), "1.5e-7");
        assert_eq!(Value::from(0.000_001).key_string(), "0.000001");
    }

    #[test]
    fn signed_zeros_compare_equal() {
        assert_eq!(Value::from(0.0).total_cmp(&Value::from(-0.0)), Ordering::Equal);
        assert_eq!(Value::from(-0.0).total_cmp(&Value::from(0.0)), Ordering::Equal);
        assert_eq!(Value::from(-0.0).total_cmp(&Value::from(1.0)), Ordering::Less);
        assert_eq!(
            Value::from(f64::NAN).total_cmp(&Value::from(f64::NAN)),
            Ordering::Equal
        );
    }

    #[test]
    fn total_cmp_orders_across_dtypes() {
        assert_eq!(
            Value::from(2.0).total_cmp(&Value::from(10.0)),
            Ordering::Less
        );
        assert_eq!(
            Value::from("b").total_cmp(&Value::from("a")),
            Ordering::Greater
        );
        assert_eq!(
            Value::from(true).total_cmp(&Value::from(0.0)),
            Ordering::Less
        );
        assert_eq!(
            Value::from(99.0).total_cmp(&Value::from("1")),
            Ordering::Less
        );
    }

    #[test]
    fn missing_values_sort_first() {
        let present = Value::from(-5.0);
        assert_eq!(cmp_missing_first(None, Some(&present)), Ordering::Less);
        assert_eq!(cmp_missing_first(None, None), Ordering::Equal);
    }

    #[test]
    fn rows_deserialize_from_flat_objects() {
        let row: Row = serde_json::from_str(r#"{"id": 7, "g": "a", "value": 3, "flag": true}"#)
            .expect("row parses");
        assert_eq!(row.id, RowId(7));
        assert_eq!(row.get("g"), Some(&Value::Text("a".to_owned())));
        assert_eq!(row.get("value"), Some(&Value::Number(3.0)));
        assert_eq!(row.get("flag"), Some(&Value::Bool(true)));
        assert_eq!(row.get("missing"), None);
    }
}
