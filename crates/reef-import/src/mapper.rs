//! Column mapping: rename, default, transform, cast
//!
//! Mappings are compiled once per profile. Source lookup is case-insensitive;
//! with no mappings configured rows pass through unchanged.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::config::{ColumnMapping, TypeHint};
use crate::error::{ImportError, Result};
use crate::models::{Row, Value};

/// Canonical text form for `datetime` casts
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DATETIME_INPUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y%m%d%H%M%S",
];

const DATE_INPUTS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%d.%m.%Y"];

#[derive(Debug, Clone, PartialEq)]
enum Transform {
    Trim,
    Upper,
    Lower,
    Left(usize),
    Right(usize),
    Replace { from: String, to: String },
}

impl Transform {
    fn parse(step: &str) -> Result<Self> {
        let step = step.trim();
        let (name, arg) = match step.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (step, None),
        };

        let length = |arg: Option<&str>| -> Result<usize> {
            arg.and_then(|n| n.trim().parse().ok()).ok_or_else(|| {
                ImportError::config(format!("Transform '{}' needs a numeric length", step))
            })
        };

        match (name.to_ascii_lowercase().as_str(), arg) {
            ("trim", None) => Ok(Transform::Trim),
            ("upper", None) => Ok(Transform::Upper),
            ("lower", None) => Ok(Transform::Lower),
            ("left", arg) => Ok(Transform::Left(length(arg)?)),
            ("right", arg) => Ok(Transform::Right(length(arg)?)),
            ("replace", Some(arg)) => match arg.split_once(':') {
                Some((from, to)) if !from.is_empty() => Ok(Transform::Replace {
                    from: from.to_string(),
                    to: to.to_string(),
                }),
                _ => Err(ImportError::config(format!(
                    "Transform '{}' must be replace:FROM:TO",
                    step
                ))),
            },
            _ => Err(ImportError::config(format!("Unknown transform '{}'", step))),
        }
    }

    fn apply(&self, text: String) -> String {
        match self {
            Transform::Trim => text.trim().to_string(),
            Transform::Upper => text.to_uppercase(),
            Transform::Lower => text.to_lowercase(),
            Transform::Left(n) => text.chars().take(*n).collect(),
            Transform::Right(n) => {
                let count = text.chars().count();
                text.chars().skip(count.saturating_sub(*n)).collect()
            },
            Transform::Replace { from, to } => text.replace(from.as_str(), to),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledMapping {
    source: String,
    target: String,
    type_hint: Option<TypeHint>,
    default: Option<String>,
    transforms: Vec<Transform>,
    skip_on_null: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ColumnMapper {
    mappings: Vec<CompiledMapping>,
}

impl ColumnMapper {
    /// Compile mappings; unknown transforms are configuration errors
    pub fn new(mappings: &[ColumnMapping]) -> Result<Self> {
        let mappings = mappings
            .iter()
            .map(|m| {
                let transforms = match m.transform.as_deref() {
                    Some(chain) if !chain.trim().is_empty() => chain
                        .split('|')
                        .filter(|step| !step.trim().is_empty())
                        .map(Transform::parse)
                        .collect::<Result<Vec<_>>>()?,
                    _ => Vec::new(),
                };
                Ok(CompiledMapping {
                    source: m.source.clone(),
                    target: m.target_name().to_string(),
                    type_hint: m.type_hint,
                    default: m.default.clone(),
                    transforms,
                    skip_on_null: m.skip_on_null,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { mappings })
    }

    pub fn is_passthrough(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn map(&self, row: &Row) -> Row {
        if self.mappings.is_empty() {
            return row.clone();
        }

        let mut mapped = Row::with_capacity(self.mappings.len());
        for mapping in &self.mappings {
            let mut value = row
                .get_ci(&mapping.source)
                .filter(|v| !v.is_null())
                .cloned()
                .or_else(|| mapping.default.clone().map(Value::String))
                .unwrap_or(Value::Null);

            if let Value::String(text) = value {
                value = Value::String(
                    mapping
                        .transforms
                        .iter()
                        .fold(text, |acc, transform| transform.apply(acc)),
                );
            }

            if let Some(hint) = mapping.type_hint {
                value = cast(value, hint);
            }

            if value.is_null() && mapping.skip_on_null {
                continue;
            }
            mapped.insert(mapping.target.clone(), value);
        }
        mapped
    }
}

/// Convert by type hint; a value that does not convert is returned as-is
pub fn cast(value: Value, hint: TypeHint) -> Value {
    let converted = match (&value, hint) {
        (Value::Null, _) => None,
        (_, TypeHint::String) => value.to_text().map(Value::String),
        (Value::String(s), TypeHint::Int) => s.trim().parse::<i32>().ok().map(|i| Value::Integer(i64::from(i))),
        (Value::Integer(i), TypeHint::Int) => i32::try_from(*i).ok().map(|_| value.clone()),
        (Value::Float(f), TypeHint::Int) => whole(*f)
            .and_then(|i| i32::try_from(i).ok())
            .map(|i| Value::Integer(i64::from(i))),
        (Value::String(s), TypeHint::Long) => s.trim().parse::<i64>().ok().map(Value::Integer),
        (Value::Float(f), TypeHint::Long) => whole(*f).map(Value::Integer),
        (Value::String(s), TypeHint::Decimal) => s.trim().parse::<f64>().ok().map(Value::Float),
        (Value::Integer(i), TypeHint::Decimal) => Some(Value::Float(*i as f64)),
        (Value::String(s), TypeHint::Bool) => parse_bool(s).map(Value::Bool),
        (Value::Integer(0), TypeHint::Bool) => Some(Value::Bool(false)),
        (Value::Integer(1), TypeHint::Bool) => Some(Value::Bool(true)),
        (Value::String(s), TypeHint::Datetime) => parse_datetime(s)
            .map(|dt| Value::String(dt.format(DATETIME_FORMAT).to_string())),
        _ => None,
    };
    converted.unwrap_or(value)
}

fn whole(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64).then_some(f as i64)
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    DATETIME_INPUTS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            DATE_INPUTS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(source: &str, target: &str) -> ColumnMapping {
        ColumnMapping::new(source, target)
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_passthrough_without_mappings() {
        let mapper = ColumnMapper::new(&[]).unwrap();
        let input = row(&[("Id", Value::from("1"))]);
        assert!(mapper.is_passthrough());
        assert_eq!(mapper.map(&input), input);
    }

    #[test]
    fn test_rename_with_case_insensitive_source() {
        let mapper = ColumnMapper::new(&[mapping("customer_id", "CustomerId")]).unwrap();
        let mapped = mapper.map(&row(&[("CUSTOMER_ID", Value::from("42"))]));
        assert_eq!(mapped.get("CustomerId"), Some(&Value::from("42")));
    }

    #[test]
    fn test_default_for_missing_and_null() {
        let mut m = mapping("status", "status");
        m.default = Some("active".to_string());
        let mapper = ColumnMapper::new(&[m]).unwrap();

        assert_eq!(mapper.map(&Row::new()).get("status"), Some(&Value::from("active")));
        assert_eq!(
            mapper.map(&row(&[("status", Value::Null)])).get("status"),
            Some(&Value::from("active"))
        );
    }

    #[test]
    fn test_skip_on_null_omits_column() {
        let mut m = mapping("email", "email");
        m.skip_on_null = true;
        let mapper = ColumnMapper::new(&[m, mapping("id", "id")]).unwrap();

        let mapped = mapper.map(&row(&[("id", Value::from("1")), ("email", Value::Null)]));
        assert_eq!(mapped.columns().collect::<Vec<_>>(), vec!["id"]);
    }

    #[test]
    fn test_transform_chain_runs_before_cast() {
        let mut m = mapping("code", "code");
        m.transform = Some("trim|replace:-:|left:4".to_string());
        m.type_hint = Some(TypeHint::Int);
        let mapper = ColumnMapper::new(&[m]).unwrap();

        let mapped = mapper.map(&row(&[("code", Value::from("  12-34-56 "))]));
        assert_eq!(mapped.get("code"), Some(&Value::Integer(1234)));
    }

    #[test]
    fn test_text_transforms() {
        assert_eq!(Transform::Upper.apply("abc".into()), "ABC");
        assert_eq!(Transform::Right(3).apply("abcdef".into()), "def");
        assert_eq!(Transform::Left(10).apply("abc".into()), "abc");
    }

    #[test]
    fn test_unknown_transform_rejected() {
        let mut m = mapping("a", "a");
        m.transform = Some("trim|reverse".to_string());
        assert!(matches!(ColumnMapper::new(&[m]), Err(ImportError::Configuration(_))));
    }

    #[test]
    fn test_casts_fall_back_to_original() {
        assert_eq!(cast(Value::from("17"), TypeHint::Int), Value::Integer(17));
        assert_eq!(cast(Value::from("3000000000"), TypeHint::Int), Value::from("3000000000"));
        assert_eq!(cast(Value::from("3000000000"), TypeHint::Long), Value::Integer(3_000_000_000));
        assert_eq!(cast(Value::from("2.50"), TypeHint::Decimal), Value::Float(2.5));
        assert_eq!(cast(Value::from("Yes"), TypeHint::Bool), Value::Bool(true));
        assert_eq!(cast(Value::from("maybe"), TypeHint::Bool), Value::from("maybe"));
        assert_eq!(cast(Value::Integer(5), TypeHint::String), Value::from("5"));
        assert_eq!(cast(Value::Null, TypeHint::Int), Value::Null);
    }

    #[test]
    fn test_datetime_cast_normalizes() {
        assert_eq!(
            cast(Value::from("2026-01-18T09:30:00Z"), TypeHint::Datetime),
            Value::from("2026-01-18 09:30:00")
        );
        assert_eq!(
            cast(Value::from("2026/01/18"), TypeHint::Datetime),
            Value::from("2026-01-18 00:00:00")
        );
        assert_eq!(
            cast(Value::from("not a date"), TypeHint::Datetime),
            Value::from("not a date")
        );
    }
}
