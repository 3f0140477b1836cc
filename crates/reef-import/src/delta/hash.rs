//! Row hashing and natural-key normalisation

use reef_common::checksum::Digester;
use reef_common::types::ChecksumAlgorithm;

use crate::config::{DeltaSyncConfig, KeyNormalization, NullStrategy};
use crate::models::{Row, Value};

/// Hashed in place of a null under [`NullStrategy::Strict`]
pub const NULL_SENTINEL: &str = "\u{0}<null>\u{0}";

const FIELD_SEPARATOR: [u8; 1] = [0x1f];

/// Content hash over a mapped row
///
/// Fields are hashed as `name=value` pairs ordered by lower-cased column
/// name, so column order in the source never changes the hash.
#[derive(Debug, Clone)]
pub struct RowHasher {
    algorithm: ChecksumAlgorithm,
    null_strategy: NullStrategy,
    numeric_precision: Option<u32>,
    strip_non_printable: bool,
}

impl RowHasher {
    pub fn new(config: &DeltaSyncConfig) -> Self {
        Self {
            algorithm: config.hash_algorithm,
            null_strategy: config.null_strategy,
            numeric_precision: config.numeric_precision,
            strip_non_printable: config.strip_non_printable,
        }
    }

    pub fn hash(&self, row: &Row) -> String {
        let mut fields: Vec<(String, &Value)> = row.iter().map(|(name, value)| (name.to_lowercase(), value)).collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));

        let mut digester = Digester::new(self.algorithm);
        for (name, value) in fields {
            let Some(text) = self.canonical(value) else {
                continue;
            };
            digester.update(name.as_bytes());
            digester.update(b"=");
            digester.update(text.as_bytes());
            digester.update(FIELD_SEPARATOR);
        }
        digester.finalize_hex()
    }

    fn canonical(&self, value: &Value) -> Option<String> {
        match value {
            Value::Null => match self.null_strategy {
                NullStrategy::Strict => Some(NULL_SENTINEL.to_string()),
                NullStrategy::Skip => None,
                NullStrategy::Empty => Some(String::new()),
            },
            Value::Float(f) => Some(self.round(*f)),
            Value::String(s) => {
                let s = if self.strip_non_printable {
                    strip_non_printable(s)
                } else {
                    s.clone()
                };
                // Decimal text from untyped sources rounds like a float
                match self.numeric_precision {
                    Some(_) if s.contains('.') => match s.trim().parse::<f64>() {
                        Ok(f) if f.is_finite() => Some(self.round(f)),
                        _ => Some(s),
                    },
                    _ => Some(s),
                }
            },
            other => Some(other.to_string()),
        }
    }

    fn round(&self, value: f64) -> String {
        match self.numeric_precision {
            Some(precision) => {
                let factor = 10f64.powi(precision as i32);
                let mut rounded = (value * factor).round() / factor;
                if rounded == 0.0 {
                    rounded = 0.0;
                }
                format!("{:.*}", precision as usize, rounded)
            },
            None => value.to_string(),
        }
    }
}

fn strip_non_printable(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}'))
        .collect()
}

/// Apply the configured normalisation steps in order
pub fn normalize_key(raw: &str, steps: &[KeyNormalization]) -> String {
    steps.iter().fold(raw.to_string(), |key, step| match step {
        KeyNormalization::Trim => key.trim().to_string(),
        KeyNormalization::Lowercase => key.to_lowercase(),
        KeyNormalization::RemoveWhitespace => key.chars().filter(|c| !c.is_whitespace()).collect(),
    })
}

/// Fingerprint of a record shape: its sorted, lower-cased column names
pub fn schema_fingerprint(row: &Row) -> String {
    let mut columns: Vec<String> = row.columns().map(str::to_lowercase).collect();
    columns.sort();
    let mut digester = Digester::new(ChecksumAlgorithm::Sha256);
    for column in columns {
        digester.update(column.as_bytes());
        digester.update(FIELD_SEPARATOR);
    }
    digester.finalize_hex()
}
