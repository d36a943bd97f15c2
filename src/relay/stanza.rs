//! Stanza tree parsing and serialization.
//!
//! A single socket read carries a run of sibling stanzas rather than one XML
//! document, so the chunk is wrapped in a synthetic root before it goes
//! through `quick-xml`. The root is discarded again and only its children are
//! returned. Serialization writes the sibling list back out with no prolog.

use quick_xml::escape::{escape, partial_escape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Name of the synthetic element wrapped around every chunk before parsing.
const FRAGMENT_ROOT: &str = "fragment";

#[derive(Error, Debug)]
pub enum StanzaError {
    #[error("malformed stanza XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("unbalanced stanza fragment")]
    Unbalanced,
}

/// A node of a parsed stanza tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
}

impl Node {
    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Node::Element(e) => Some(e),
            _ => None,
        }
    }
}

/// An XML element with its attributes in document order.
///
/// Names are kept as written (prefix included); namespace declarations are
/// ordinary attributes, which is enough to reproduce the stanza faithfully.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First direct child element with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children
            .iter()
            .filter_map(Node::as_element)
            .find(|e| e.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children
            .iter_mut()
            .filter_map(Node::as_element_mut)
            .find(|e| e.name == name)
    }

    /// Walk down a chain of first-matching child elements.
    pub fn descendant(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |el, name| el.child(name))
    }

    pub fn descendant_mut(&mut self, path: &[&str]) -> Option<&mut Element> {
        let mut current = self;
        for name in path {
            current = current.child_mut(name)?;
        }
        Some(current)
    }

    /// Remove the first direct child element with the given name.
    pub fn remove_child(&mut self, name: &str) -> Option<Element> {
        let index = self
            .children
            .iter()
            .position(|n| matches!(n, Node::Element(e) if e.name == name))?;
        match self.children.remove(index) {
            Node::Element(e) => Some(e),
            _ => None,
        }
    }

    /// Concatenated text and CDATA content of the direct children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) | Node::CData(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Replace all children with a single text node.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children = vec![Node::Text(text.into())];
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, StanzaError> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(|e| StanzaError::Xml(e.into()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn append(stack: &mut [Element], node: Node) -> Result<(), StanzaError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None => Err(StanzaError::Unbalanced),
    }
}

/// Parse a chunk of concatenated sibling elements.
///
/// Fails if the chunk is not well-formed on its own, including the case of a
/// stanza cut in half by the read boundary.
pub fn parse_fragment(chunk: &str) -> Result<Vec<Node>, StanzaError> {
    let wrapped = format!("<{FRAGMENT_ROOT}>{chunk}</{FRAGMENT_ROOT}>");
    let mut reader = Reader::from_str(&wrapped);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if root.is_some() {
                    return Err(StanzaError::Unbalanced);
                }
                stack.push(element_from_start(&e)?);
            }
            Event::Empty(e) => {
                let element = element_from_start(&e)?;
                append(&mut stack, Node::Element(element))?;
            }
            Event::End(_) => {
                let element = stack.pop().ok_or(StanzaError::Unbalanced)?;
                if stack.is_empty() {
                    root = Some(element);
                } else {
                    append(&mut stack, Node::Element(element))?;
                }
            }
            Event::Text(t) => {
                let text = t.unescape()?.into_owned();
                if stack.is_empty() {
                    if !text.trim().is_empty() {
                        return Err(StanzaError::Unbalanced);
                    }
                } else {
                    append(&mut stack, Node::Text(text))?;
                }
            }
            Event::CData(c) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                append(&mut stack, Node::CData(text))?;
            }
            // Comments, declarations and processing instructions are not forwarded
            Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }

    if !stack.is_empty() {
        return Err(StanzaError::Unbalanced);
    }
    root.map(|r| r.children).ok_or(StanzaError::Unbalanced)
}

/// Serialize a sibling sequence back to text, without an XML declaration.
pub fn serialize_fragment(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        write_node(&mut out, node);
    }
    out
}

/// Attribute values also need whitespace control characters as references,
/// or a conforming reader normalizes them to spaces.
fn push_attribute_value(out: &mut String, value: &str) {
    for c in escape(value).chars() {
        match c {
            '\t' => out.push_str("&#9;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            c => out.push(c),
        }
    }
}

fn write_node(out: &mut String, node: &Node) {
    match node {
        Node::Text(text) => out.push_str(&partial_escape(text.as_str())),
        Node::CData(text) => {
            out.push_str("<![CDATA[");
            out.push_str(text);
            out.push_str("]]>");
        }
        Node::Element(element) => {
            out.push('<');
            out.push_str(&element.name);
            for (key, value) in &element.attributes {
                out.push(' ');
                out.push_str(key);
                out.push_str("=\"");
                push_attribute_value(out, value);
                out.push('"');
            }
            if element.children.is_empty() {
                out.push_str("/>");
                return;
            }
            out.push('>');
            for child in &element.children {
                write_node(out, child);
            }
            out.push_str("</");
            out.push_str(&element.name);
            out.push('>');
        }
    }
}
