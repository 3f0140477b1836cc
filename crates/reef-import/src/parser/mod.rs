//! Streaming format parsers
//!
//! Every parser turns a byte stream into a lazy, single-pass sequence of
//! [`ParsedRow`]s. Structural failures collapse into one error row; failures
//! in line-oriented formats stay confined to the offending line.

pub mod csv;
pub mod json;
pub mod xml;
mod xpath;

use std::io::Read;
use tokio_util::sync::CancellationToken;

use crate::config::{FileFormat, FormatConfig};
use crate::error::{ImportError, Result};
use crate::models::ParsedRow;

pub use self::csv::CsvParser;
pub use self::json::{JsonLinesParser, JsonParser};
pub use self::xml::XmlParser;

pub type RowIter = Box<dyn Iterator<Item = ParsedRow> + Send>;

pub trait FormatParser: Send + Sync {
    /// Consume `reader`; re-parsing requires a fresh stream
    fn parse(&self, reader: Box<dyn Read + Send>) -> RowIter;
}

/// Select the parser for a profile's format section
pub fn for_format(config: &FormatConfig) -> Result<Box<dyn FormatParser>> {
    Ok(match config.format {
        FileFormat::Csv | FileFormat::Tsv => Box::new(CsvParser::new(config)?),
        FileFormat::Json if config.json_lines => Box::new(JsonLinesParser::new()),
        FileFormat::Json => Box::new(JsonParser::new(config.json_root_path.clone())),
        FileFormat::JsonLines => Box::new(JsonLinesParser::new()),
        FileFormat::Xml => Box::new(XmlParser::new(config.xml_record_xpath.clone())),
    })
}

/// Stop a row sequence once `token` is cancelled
///
/// Cancellation surfaces as `Err(ImportError::Cancelled)`, never as a parse
/// error row, and ends the sequence.
pub fn with_cancellation(
    rows: RowIter,
    token: CancellationToken,
) -> impl Iterator<Item = Result<ParsedRow>> + Send {
    let mut stopped = false;
    let mut rows = rows;
    std::iter::from_fn(move || {
        if stopped {
            return None;
        }
        if token.is_cancelled() {
            stopped = true;
            return Some(Err(ImportError::Cancelled));
        }
        rows.next().map(Ok)
    })
}
