//! XML parser: builds a small element tree with `quick-xml`, then selects
//! repeating records with an XPath subset

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::Read;

use super::json::SCALAR_COLUMN;
use super::xpath::XPath;
use super::{FormatParser, RowIter};
use crate::models::{ParsedRow, Row, Value};

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Element {
    /// Local name, namespace prefix dropped
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, String> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| e.to_string())?;
            let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
            let value = attribute.unescape_value().map_err(|e| e.to_string())?;
            attributes.push((key, value.into_owned()));
        }
        Ok(Self {
            name,
            attributes,
            children: Vec::new(),
        })
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Concatenated text of this element and all descendants
    pub fn text(&self) -> String {
        fn collect(element: &Element, out: &mut String) {
            for node in &element.children {
                match node {
                    Node::Text(text) => out.push_str(text),
                    Node::Element(child) => collect(child, out),
                }
            }
        }

        let mut out = String::new();
        collect(self, &mut out);
        out
    }
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<(), String> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_some() => return Err("multiple root elements".to_string()),
        None => *root = Some(element),
    }
    Ok(())
}

/// Parse a whole document into its root element
pub(crate) fn parse_document(text: &str) -> Result<Element, String> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("{} at position {}", e, reader.buffer_position()))?;

        match event {
            Event::Start(start) => stack.push(Element::from_start(&start)?),
            Event::Empty(start) => {
                let element = Element::from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            },
            Event::End(_) => {
                let element = stack.pop().ok_or("unexpected closing tag")?;
                attach(&mut stack, &mut root, element)?;
            },
            Event::Text(text) => {
                if let Some(parent) = stack.last_mut() {
                    let text = text.unescape().map_err(|e| e.to_string())?;
                    parent.children.push(Node::Text(text.into_owned()));
                }
            },
            Event::CData(data) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    parent.children.push(Node::Text(text));
                }
            },
            Event::Eof => break,
            _ => {},
        }
    }

    if let Some(open) = stack.last() {
        return Err(format!("unexpected end of document inside <{}>", open.name));
    }
    root.ok_or_else(|| "document has no root element".to_string())
}

fn record_row(record: &Element) -> Row {
    let mut row = Row::new();

    for (name, value) in &record.attributes {
        row.insert(format!("@{}", name), Value::String(value.clone()));
    }

    let mut has_children = false;
    for child in record.child_elements() {
        has_children = true;
        // First occurrence of a repeated child wins
        if row.get(&child.name).is_none() {
            row.insert(child.name.clone(), Value::String(child.text().trim().to_string()));
        }
    }

    if !has_children {
        let text = record.text();
        if !text.trim().is_empty() {
            row.insert(SCALAR_COLUMN, Value::String(text.trim().to_string()));
        }
    }

    row
}

pub struct XmlParser {
    record_xpath: Option<String>,
}

impl XmlParser {
    pub fn new(record_xpath: Option<String>) -> Self {
        Self { record_xpath }
    }
}

impl FormatParser for XmlParser {
    fn parse(&self, mut reader: Box<dyn Read + Send>) -> RowIter {
        let mut bytes = Vec::new();
        if let Err(e) = reader.read_to_end(&mut bytes) {
            return Box::new(std::iter::once(ParsedRow::failed(1, format!("XML parse error: {}", e))));
        }

        let root = match std::str::from_utf8(&bytes)
            .map_err(|e| e.to_string())
            .and_then(parse_document)
        {
            Ok(root) => root,
            Err(e) => {
                return Box::new(std::iter::once(ParsedRow::failed(1, format!("XML parse error: {}", e))))
            },
        };

        let rows: Vec<ParsedRow> = match self.record_xpath.as_deref().map(str::trim) {
            Some(expression) if !expression.is_empty() => match XPath::parse(expression) {
                Ok(xpath) => xpath
                    .select(&root)
                    .into_iter()
                    .enumerate()
                    .map(|(i, record)| ParsedRow::ok(i as u64 + 1, record_row(record)))
                    .collect(),
                Err(e) => vec![ParsedRow::failed(1, format!("XPath error: {}", e))],
            },
            _ => root
                .child_elements()
                .enumerate()
                .map(|(i, record)| ParsedRow::ok(i as u64 + 1, record_row(record)))
                .collect(),
        };

        Box::new(rows.into_iter())
    }
}
