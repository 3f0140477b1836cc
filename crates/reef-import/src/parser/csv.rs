//! CSV/TSV parser built on the `csv` crate

use encoding_rs::{Encoding, UTF_8};
use std::io::{BufRead, BufReader, Cursor, Read};

use super::{FormatParser, RowIter};
use crate::config::FormatConfig;
use crate::error::{ImportError, Result};
use crate::models::{ParsedRow, Row, Value};

pub struct CsvParser {
    delimiter: u8,
    quote: u8,
    has_header: bool,
    trim: bool,
    null_value: Option<String>,
    skip_rows: usize,
    encoding: &'static Encoding,
}

impl CsvParser {
    pub fn new(config: &FormatConfig) -> Result<Self> {
        let encoding = Encoding::for_label(config.encoding.as_bytes()).ok_or_else(|| {
            ImportError::config(format!("Unknown encoding '{}'", config.encoding))
        })?;

        Ok(Self {
            delimiter: config.delimiter_byte()?,
            quote: config.quote_byte()?,
            has_header: config.has_header,
            trim: config.trim,
            null_value: config.null_value.clone(),
            skip_rows: config.skip_rows,
            encoding,
        })
    }

    /// Decode to UTF-8 if needed and drop the leading banner lines
    fn prepare(&self, reader: Box<dyn Read + Send>) -> std::io::Result<Box<dyn Read + Send>> {
        let mut buffered: Box<dyn BufRead + Send> = if self.encoding == UTF_8 {
            Box::new(BufReader::new(reader))
        } else {
            let mut raw = Vec::new();
            BufReader::new(reader).read_to_end(&mut raw)?;
            let (text, _, _) = self.encoding.decode(&raw);
            Box::new(Cursor::new(text.into_owned().into_bytes()))
        };

        let mut scratch = Vec::new();
        for _ in 0..self.skip_rows {
            scratch.clear();
            if buffered.read_until(b'\n', &mut scratch)? == 0 {
                break;
            }
        }

        Ok(Box::new(buffered))
    }
}

impl FormatParser for CsvParser {
    fn parse(&self, reader: Box<dyn Read + Send>) -> RowIter {
        let reader = match self.prepare(reader) {
            Ok(reader) => reader,
            Err(e) => {
                return Box::new(std::iter::once(ParsedRow::failed(
                    1,
                    format!("CSV read error: {}", e),
                )))
            },
        };

        let records = ::csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .quote(self.quote)
            .has_headers(false)
            .flexible(true)
            .trim(if self.trim {
                ::csv::Trim::All
            } else {
                ::csv::Trim::None
            })
            .from_reader(reader)
            .into_records();

        Box::new(CsvRows {
            records,
            headers: None,
            has_header: self.has_header,
            null_value: self.null_value.clone(),
            first_line: self.skip_rows as u64 + 1,
            ordinal: 0,
            done: false,
        })
    }
}

struct CsvRows {
    records: ::csv::StringRecordsIntoIter<Box<dyn Read + Send>>,
    headers: Option<Vec<String>>,
    has_header: bool,
    null_value: Option<String>,
    /// Physical line of the header, or of the first data row without one
    first_line: u64,
    ordinal: u64,
    done: bool,
}

impl CsvRows {
    fn next_line(&mut self) -> u64 {
        self.ordinal += 1;
        let header_lines = u64::from(self.has_header);
        self.first_line + header_lines + self.ordinal - 1
    }

    fn value(&self, field: &str) -> Value {
        match &self.null_value {
            Some(null) if null == field => Value::Null,
            _ => Value::String(field.to_string()),
        }
    }

    fn build_row(&self, record: &::csv::StringRecord) -> Row {
        let mut row = Row::with_capacity(record.len());
        match &self.headers {
            Some(headers) => {
                for (i, name) in headers.iter().enumerate() {
                    // Short rows are padded with empty strings, not nulls
                    let value = record
                        .get(i)
                        .map(|field| self.value(field))
                        .unwrap_or_else(|| Value::String(String::new()));
                    row.insert(name.clone(), value);
                }
                for i in headers.len()..record.len() {
                    row.insert(format!("Col{}", i + 1), self.value(&record[i]));
                }
            },
            None => {
                for (i, field) in record.iter().enumerate() {
                    row.insert(format!("Col{}", i + 1), self.value(field));
                }
            },
        }
        row
    }

    fn read_header(&mut self) -> Option<ParsedRow> {
        loop {
            match self.records.next() {
                None => {
                    self.done = true;
                    return None;
                },
                Some(Err(e)) => {
                    self.done = true;
                    return Some(ParsedRow::failed(
                        self.first_line,
                        format!("CSV header error: {}", e),
                    ));
                },
                Some(Ok(record)) if is_blank(&record) => continue,
                Some(Ok(record)) => {
                    let mut names: Vec<String> = Vec::with_capacity(record.len());
                    for (i, name) in record.iter().enumerate() {
                        let name = name.to_string();
                        if name.is_empty() || names.contains(&name) {
                            names.push(format!("Col{}", i + 1));
                        } else {
                            names.push(name);
                        }
                    }
                    self.headers = Some(names);
                    return None;
                },
            }
        }
    }
}

fn is_blank(record: &::csv::StringRecord) -> bool {
    record.len() == 1 && record[0].trim().is_empty()
}

impl Iterator for CsvRows {
    type Item = ParsedRow;

    fn next(&mut self) -> Option<ParsedRow> {
        if self.done {
            return None;
        }

        if self.has_header && self.headers.is_none() {
            if let Some(error_row) = self.read_header() {
                return Some(error_row);
            }
            if self.done {
                return None;
            }
        }

        loop {
            match self.records.next()? {
                Ok(record) if is_blank(&record) => continue,
                Ok(record) => {
                    let line = self.next_line();
                    return Some(ParsedRow::ok(line, self.build_row(&record)));
                },
                Err(e) => {
                    if matches!(e.kind(), ::csv::ErrorKind::Io(_)) {
                        self.done = true;
                    }
                    let line = self.next_line();
                    return Some(ParsedRow::failed(line, format!("CSV error: {}", e)));
                },
            }
        }
    }
}
