//! The XPath subset used to select repeating XML records
//!
//! Supported: absolute (`/a/b`) and relative (`a/b`) child paths, the
//! descendant step `//b`, the `*` wildcard, and the predicates `[@attr]`,
//! `[@attr='value']` and `[n]`. Namespace prefixes are ignored.

use std::collections::HashSet;

use super::xml::Element;

#[derive(Debug, Clone, PartialEq)]
enum NameTest {
    Any,
    Local(String),
}

impl NameTest {
    fn matches(&self, element: &Element) -> bool {
        match self {
            NameTest::Any => true,
            NameTest::Local(name) => element.name == *name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    HasAttribute(String),
    AttributeEquals(String, String),
    /// 1-based
    Position(usize),
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    descendant: bool,
    test: NameTest,
    predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XPath {
    absolute: bool,
    steps: Vec<Step>,
}

#[derive(Clone, Copy)]
enum Context<'a> {
    Document(&'a Element),
    Node(&'a Element),
}

impl<'a> Context<'a> {
    fn children(self) -> Vec<&'a Element> {
        match self {
            Context::Document(root) => vec![root],
            Context::Node(element) => element.child_elements().collect(),
        }
    }

    fn descendants_or_self(self, out: &mut Vec<Context<'a>>) {
        fn walk<'a>(element: &'a Element, out: &mut Vec<Context<'a>>) {
            out.push(Context::Node(element));
            for child in element.child_elements() {
                walk(child, out);
            }
        }

        match self {
            Context::Document(root) => {
                out.push(self);
                walk(root, out);
            },
            Context::Node(element) => walk(element, out),
        }
    }
}

impl XPath {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err("empty expression".to_string());
        }

        let absolute = expression.starts_with('/');
        let mut rest = expression;
        let mut steps = Vec::new();

        while !rest.is_empty() {
            let descendant = if let Some(tail) = rest.strip_prefix("//") {
                rest = tail;
                true
            } else if let Some(tail) = rest.strip_prefix('/') {
                rest = tail;
                false
            } else if steps.is_empty() {
                false
            } else {
                return Err(format!("unexpected '{}'", rest));
            };

            let end = rest.find(['/', '[']).unwrap_or(rest.len());
            let name = rest[..end].trim();
            rest = &rest[end..];

            let test = parse_name_test(name)?;

            let mut predicates = Vec::new();
            while rest.starts_with('[') {
                let close = closing_bracket(rest)
                    .ok_or_else(|| format!("unterminated predicate in '{}'", expression))?;
                predicates.push(parse_predicate(rest[1..close].trim())?);
                rest = &rest[close + 1..];
            }

            steps.push(Step {
                descendant,
                test,
                predicates,
            });
        }

        if steps.is_empty() {
            return Err(format!("no location steps in '{}'", expression));
        }

        Ok(Self { absolute, steps })
    }

    /// Elements matched by this path, in document order
    pub fn select<'a>(&self, root: &'a Element) -> Vec<&'a Element> {
        let mut contexts = vec![if self.absolute {
            Context::Document(root)
        } else {
            Context::Node(root)
        }];

        for step in &self.steps {
            let mut seen: HashSet<*const Element> = HashSet::new();
            let mut next = Vec::new();

            for context in contexts {
                let mut bases = Vec::new();
                if step.descendant {
                    context.descendants_or_self(&mut bases);
                } else {
                    bases.push(context);
                }

                for base in bases {
                    let candidates: Vec<&Element> = base
                        .children()
                        .into_iter()
                        .filter(|e| step.test.matches(e))
                        .collect();

                    for element in apply_predicates(candidates, &step.predicates) {
                        if seen.insert(element as *const Element) {
                            next.push(Context::Node(element));
                        }
                    }
                }
            }

            contexts = next;
        }

        contexts
            .into_iter()
            .filter_map(|c| match c {
                Context::Node(element) => Some(element),
                Context::Document(_) => None,
            })
            .collect()
    }
}

fn apply_predicates<'a>(mut nodes: Vec<&'a Element>, predicates: &[Predicate]) -> Vec<&'a Element> {
    for predicate in predicates {
        nodes = match predicate {
            Predicate::HasAttribute(name) => nodes
                .into_iter()
                .filter(|e| e.attribute(name).is_some())
                .collect(),
            Predicate::AttributeEquals(name, value) => nodes
                .into_iter()
                .filter(|e| e.attribute(name) == Some(value.as_str()))
                .collect(),
            Predicate::Position(n) => nodes.get(n - 1).copied().into_iter().collect(),
        };
    }
    nodes
}

fn parse_name_test(name: &str) -> Result<NameTest, String> {
    if name == "*" {
        return Ok(NameTest::Any);
    }
    if name.is_empty() {
        return Err("empty location step".to_string());
    }
    let valid = name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
    if !valid {
        return Err(format!("invalid element name '{}'", name));
    }
    let local = name.rsplit(':').next().unwrap_or(name);
    Ok(NameTest::Local(local.to_string()))
}

fn parse_predicate(body: &str) -> Result<Predicate, String> {
    if let Some(attribute) = body.strip_prefix('@') {
        return match attribute.split_once('=') {
            Some((name, value)) => {
                let value = value.trim();
                let unquoted = value
                    .strip_prefix('\'')
                    .and_then(|v| v.strip_suffix('\''))
                    .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
                    .ok_or_else(|| format!("predicate value must be quoted: [{}]", body))?;
                Ok(Predicate::AttributeEquals(
                    local_name(name.trim()).to_string(),
                    unquoted.to_string(),
                ))
            },
            None if !attribute.trim().is_empty() => {
                Ok(Predicate::HasAttribute(local_name(attribute.trim()).to_string()))
            },
            None => Err("empty attribute predicate".to_string()),
        };
    }

    match body.parse::<usize>() {
        Ok(n) if n >= 1 => Ok(Predicate::Position(n)),
        _ => Err(format!("unsupported predicate [{}]", body)),
    }
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// Index of the `]` closing the predicate at the start of `s`, ignoring quoted text
fn closing_bracket(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices().skip(1) {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {},
            (None, '\'' | '"') => quote = Some(c),
            (None, ']') => return Some(i),
            (None, _) => {},
        }
    }
    None
}
