//! XML fragment handling for the chat wire protocol.
//!
//! Stanzas arrive over the wire without a single document root: one TCP
//! read may carry several sibling elements, or a fragment of one. This
//! module models that explicitly as "a sequence of sibling elements
//! scanned from a fragment" instead of a full document parse:
//!
//! - [`scan_fragment`] locates the byte span of every top-level element so
//!   untouched siblings can be forwarded byte-for-byte;
//! - [`parse_element`] builds a small mutable tree for one element so the
//!   rewriter can edit nested product blocks and re-serialize.
//!
//! Attribute values and text content are kept in their raw (still-escaped)
//! wire form throughout, so content that is not deliberately rewritten
//! round-trips without re-escaping surprises.

use std::fmt::Write as _;

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Errors from fragment scanning and element parsing.
///
/// Both cases are recoverable for the relay: the caller forwards the
/// original bytes unmodified and logs the failure.
#[derive(Debug, Error)]
pub enum XmlError {
    /// The fragment ends inside an element; the rest of the stanza is in a
    /// later read.
    #[error("fragment is incomplete")]
    Incomplete,

    /// The fragment is not well-formed XML.
    #[error("malformed fragment: {0}")]
    Malformed(String),
}

/// Byte span of one top-level element within a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopLevel {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

/// Scans a fragment for its top-level elements.
///
/// Text (typically whitespace) between elements is not reported; callers
/// reassembling a fragment copy the gaps between spans verbatim.
pub fn scan_fragment(input: &str) -> Result<Vec<TopLevel>, XmlError> {
    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut tops = Vec::new();
    let mut depth: u32 = 0;
    let mut start: usize = 0;
    let mut name = String::new();

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth == 0 {
                    start = pos;
                    name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                if depth == 0 {
                    tops.push(TopLevel {
                        name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                        start: pos,
                        end: reader.buffer_position() as usize,
                    });
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return Err(XmlError::Malformed("unbalanced closing tag".to_string()));
                }
                depth -= 1;
                if depth == 0 {
                    tops.push(TopLevel {
                        name: name.clone(),
                        start,
                        end: reader.buffer_position() as usize,
                    });
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => {}
            Ok(Event::Eof) => {
                if depth != 0 {
                    return Err(XmlError::Incomplete);
                }
                return Ok(tops);
            }
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => {
                return Err(XmlError::Incomplete);
            }
            Err(e) => return Err(XmlError::Malformed(e.to_string())),
        }
    }
}

/// One node of a parsed element tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    /// Raw (still-escaped) character data, exactly as it appeared on the
    /// wire.
    Text(String),
}

/// A mutable XML element with raw attribute values and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    /// Attribute name/value pairs; values are raw wire bytes.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
    self_closing: bool,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            self_closing: true,
        }
    }

    /// Raw value of the named attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First child element with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find_map(|node| match node {
            Node::Element(el) if el.name == name => Some(el),
            _ => None,
        })
    }

    /// Mutable access to the first child element with the given name.
    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|node| match node {
            Node::Element(el) if el.name == name => Some(el),
            _ => None,
        })
    }

    /// Removes every child element with the given name. Returns whether
    /// anything was removed.
    pub fn remove_child(&mut self, name: &str) -> bool {
        let before = self.children.len();
        self.children
            .retain(|node| !matches!(node, Node::Element(el) if el.name == name));
        self.children.len() != before
    }

    /// Concatenated raw text content of this element.
    pub fn text(&self) -> Option<String> {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Replaces the element's content with the given text.
    pub fn set_text(&mut self, value: &str) {
        self.children = vec![Node::Text(escape_text(value))];
    }

    /// Serializes the element back to its wire form.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            let _ = write!(out, " {}=\"{}\"", key, escape_attribute(value));
        }
        if self.children.is_empty() && self.self_closing {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(el) => el.write_into(out),
                Node::Text(text) => out.push_str(text),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Parses a single element (one span from [`scan_fragment`]) into a tree.
pub fn parse_element(span: &str) -> Result<Element, XmlError> {
    let mut reader = Reader::from_str(span);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                stack.push(element_from_start(&e, false)?);
            }
            Ok(Event::Empty(e)) => {
                let element = element_from_start(&e, true)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(element)),
                    None if root.is_none() => root = Some(element),
                    None => {
                        return Err(XmlError::Malformed(
                            "multiple root elements in span".to_string(),
                        ))
                    }
                }
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| XmlError::Malformed("unbalanced closing tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(element)),
                    None if root.is_none() => root = Some(element),
                    None => {
                        return Err(XmlError::Malformed(
                            "multiple root elements in span".to_string(),
                        ))
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(parent) = stack.last_mut() {
                    parent
                        .children
                        .push(Node::Text(String::from_utf8_lossy(&t).into_owned()));
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(parent) = stack.last_mut() {
                    let mut raw = String::from("<![CDATA[");
                    raw.push_str(&String::from_utf8_lossy(&t));
                    raw.push_str("]]>");
                    parent.children.push(Node::Text(raw));
                }
            }
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => {}
            Ok(Event::Eof) => {
                if !stack.is_empty() {
                    return Err(XmlError::Incomplete);
                }
                return root.ok_or(XmlError::Incomplete);
            }
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => {
                return Err(XmlError::Incomplete);
            }
            Err(e) => return Err(XmlError::Malformed(e.to_string())),
        }
    }
}

fn element_from_start(start: &BytesStart<'_>, self_closing: bool) -> Result<Element, XmlError> {
    let mut element = Element {
        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        attributes: Vec::new(),
        children: Vec::new(),
        self_closing,
    };
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| XmlError::Malformed(e.to_string()))?;
        element.attributes.push((
            String::from_utf8_lossy(attribute.key.as_ref()).into_owned(),
            String::from_utf8_lossy(&attribute.value).into_owned(),
        ));
    }
    Ok(element)
}

/// Escapes text for element content.
pub(crate) fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escapes a raw attribute value for double-quoted serialization. Existing
/// entities are left untouched; only the quote character needs care.
fn escape_attribute(raw: &str) -> String {
    if raw.contains('"') {
        raw.replace('"', "&quot;")
    } else {
        raw.to_string()
    }
}
