//! JSON document and JSON-Lines parsers

use std::io::{BufRead, BufReader, Read};

use super::{FormatParser, RowIter};
use crate::models::{ParsedRow, Row, Value};

/// Column used when a record is a scalar or array instead of an object
pub const SCALAR_COLUMN: &str = "value";

/// Follow a dot path such as `$.data.items` (the `$` is optional)
///
/// Numeric segments index into arrays.
pub fn navigate<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let path = path.trim();
    let path = path.strip_prefix('$').unwrap_or(path);

    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            serde_json::Value::Object(map) => map.get(segment),
            serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn record_row(value: &serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect(),
        other => {
            let mut row = Row::new();
            row.insert(SCALAR_COLUMN, Value::from_json(other));
            row
        },
    }
}

// ============================================================================
// Document mode
// ============================================================================

/// One JSON document; an array yields a row per element, an object one row
pub struct JsonParser {
    root_path: Option<String>,
}

impl JsonParser {
    pub fn new(root_path: Option<String>) -> Self {
        Self { root_path }
    }
}

impl FormatParser for JsonParser {
    fn parse(&self, reader: Box<dyn Read + Send>) -> RowIter {
        let document: serde_json::Value = match serde_json::from_reader(BufReader::new(reader)) {
            Ok(document) => document,
            Err(e) => {
                return Box::new(std::iter::once(ParsedRow::failed(
                    e.line().max(1) as u64,
                    format!("JSON parse error: {}", e),
                )))
            },
        };

        let records = match &self.root_path {
            Some(path) if !path.trim().is_empty() && path.trim() != "$" => {
                match navigate(&document, path) {
                    Some(node) => node.clone(),
                    None => {
                        return Box::new(std::iter::once(ParsedRow::failed(
                            1,
                            format!("JSON root path '{}' not found", path),
                        )))
                    },
                }
            },
            _ => document,
        };

        match records {
            serde_json::Value::Array(items) => Box::new(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| ParsedRow::ok(i as u64 + 1, record_row(&item))),
            ),
            single => Box::new(std::iter::once(ParsedRow::ok(1, record_row(&single)))),
        }
    }
}

// ============================================================================
// Line-delimited mode
// ============================================================================

/// One JSON value per physical line; a bad line only fails itself
#[derive(Default)]
pub struct JsonLinesParser;

impl JsonLinesParser {
    pub fn new() -> Self {
        Self
    }
}

impl FormatParser for JsonLinesParser {
    fn parse(&self, reader: Box<dyn Read + Send>) -> RowIter {
        Box::new(JsonLines {
            reader: BufReader::new(reader),
            line: 0,
            done: false,
        })
    }
}

struct JsonLines {
    reader: BufReader<Box<dyn Read + Send>>,
    line: u64,
    done: bool,
}

impl Iterator for JsonLines {
    type Item = ParsedRow;

    fn next(&mut self) -> Option<ParsedRow> {
        let mut buf = Vec::new();
        while !self.done {
            buf.clear();
            match self.reader.read_until(b'\n', &mut buf) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    self.line += 1;
                    let text = match std::str::from_utf8(&buf) {
                        Ok(text) => text.trim(),
                        Err(e) => {
                            return Some(ParsedRow::failed(
                                self.line,
                                format!("Invalid UTF-8 on line {}: {}", self.line, e),
                            ))
                        },
                    };
                    if text.is_empty() {
                        continue;
                    }
                    return Some(match serde_json::from_str::<serde_json::Value>(text) {
                        Ok(value) => ParsedRow::ok(self.line, record_row(&value)),
                        Err(e) => ParsedRow::failed(
                            self.line,
                            format!("Invalid JSON on line {}: {}", self.line, e),
                        ),
                    });
                },
                Err(e) => {
                    self.done = true;
                    return Some(ParsedRow::failed(self.line + 1, format!("Read error: {}", e)));
                },
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn input(text: &str) -> Box<dyn Read + Send> {
        Box::new(Cursor::new(text.as_bytes().to_vec()))
    }

    #[test]
    fn test_array_with_root_path() {
        let rows: Vec<_> = JsonParser::new(Some("$.data.items".to_string()))
            .parse(input(r#"{"data":{"items":[{"id":1,"price":9.5},{"id":2,"tags":["a"]}]}}"#))
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].columns.get("id"), Some(&Value::Integer(1)));
        assert_eq!(rows[0].columns.get("price"), Some(&Value::Float(9.5)));
        assert_eq!(rows[1].columns.get("tags"), Some(&Value::String("[\"a\"]".to_string())));
        assert_eq!(rows[1].line, 2);
    }

    #[test]
    fn test_single_object_yields_one_row() {
        let rows: Vec<_> = JsonParser::new(None)
            .parse(input(r#"{"id": 5, "active": true, "note": null}"#))
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns.get("active"), Some(&Value::Bool(true)));
        assert_eq!(rows[0].columns.get("note"), Some(&Value::Null));
    }

    #[test]
    fn test_missing_root_path_and_bad_document() {
        let rows: Vec<_> = JsonParser::new(Some("records".to_string()))
            .parse(input(r#"{"items": []}"#))
            .collect();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_error());

        let rows: Vec<_> = JsonParser::new(None).parse(input("not json at all")).collect();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].error.as_deref().unwrap().contains("JSON parse error"));
    }

    #[test]
    fn test_json_lines_isolates_bad_line() {
        let rows: Vec<_> = JsonLinesParser::new()
            .parse(input("{\"id\":1}\nbad line\n{\"id\":3}"))
            .collect();
        assert_eq!(rows.len(), 3);
        assert!(!rows[0].is_error());
        assert!(rows[1].is_error());
        assert_eq!(rows[1].line, 2);
        assert!(!rows[2].is_error());
        assert_eq!(rows[2].columns.get("id"), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_json_lines_blank_lines_keep_physical_numbers() {
        let rows: Vec<_> = JsonLinesParser::new()
            .parse(input("{\"id\":1}\n\n   \n{\"id\":2}\n"))
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].line, 4);
    }

    #[test]
    fn test_navigate_array_index() {
        let doc: serde_json::Value = serde_json::from_str(r#"{"pages":[{"next":"abc"}]}"#).unwrap();
        assert_eq!(navigate(&doc, "pages.0.next").and_then(|v| v.as_str()), Some("abc"));
        assert!(navigate(&doc, "$.missing").is_none());
        assert_eq!(navigate(&doc, "$"), Some(&doc));
    }
}
