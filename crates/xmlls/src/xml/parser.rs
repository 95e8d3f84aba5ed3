//
// xml/parser.rs
//
// Strict and recovering tree builders on top of quick-xml events.
//
// The recovering builder mirrors what editors need from half-typed markup:
// mismatched end tags close the intervening elements, unclosed elements are
// closed at end of input, and a hard syntax error stops the parse while
// keeping whatever tree was built so far.
//

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;
use thiserror::Error;

use super::tree::{Attribute, ElementNode, NodeId, XmlDocument};
use super::{split_qname, ExpandedName, XML_NAMESPACE};

/// A well-formedness error with a 1-based source position.
///
/// The display form always ends in `: line L, column C`; diagnostics
/// recover the position from that suffix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}: line {line}, column {column}")]
pub struct XmlError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

/// Parse a well-formed document; any syntax error fails the parse.
pub fn parse(text: &str) -> Result<XmlDocument, XmlError> {
    TreeBuilder::new(text, false).run()
}

/// Parse as much of `text` as possible.
///
/// Fails only when not a single element could be recovered.
pub fn parse_recovering(text: &str) -> Result<XmlDocument, XmlError> {
    TreeBuilder::new(text, true).run()
}

struct OpenElement {
    id: NodeId,
    raw_name: String,
    /// Number of namespace declarations this element pushed onto the scope
    declared: usize,
}

struct TreeBuilder<'t> {
    text: &'t str,
    line_starts: Vec<usize>,
    recover: bool,
    nodes: Vec<ElementNode>,
    open: Vec<OpenElement>,
    scopes: Vec<(Option<String>, String)>,
    root: Option<NodeId>,
}

impl<'t> TreeBuilder<'t> {
    fn new(text: &'t str, recover: bool) -> Self {
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            text,
            line_starts,
            recover,
            nodes: Vec::new(),
            open: Vec::new(),
            scopes: Vec::new(),
            root: None,
        }
    }

    fn run(mut self) -> Result<XmlDocument, XmlError> {
        let mut reader = Reader::from_str(self.text);
        reader.config_mut().check_end_names = false;

        loop {
            let event_start = reader.buffer_position() as usize;
            let outcome = match reader.read_event() {
                Ok(Event::Start(e)) => self.start_tag(e, event_start, false),
                Ok(Event::Empty(e)) => self.start_tag(e, event_start, true),
                Ok(Event::End(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    self.close_element(&name, event_start)
                }
                Ok(Event::Text(t)) => self.text_content(&t, event_start),
                Ok(Event::Eof) => break,
                Ok(_) => Ok(()),
                Err(err) => Err(self.error(err.to_string(), reader.error_position() as usize)),
            };

            if let Err(err) = outcome {
                if !self.recover {
                    return Err(err);
                }
                log::trace!("Recovering parser stopped early: {}", err);
                break;
            }
        }

        self.finish()
    }

    /// In recovering mode a `<` inside a tag means the text before it was a
    /// half-typed tag: `<a<b/>` and `<<b/>` both yield `<b/>`, and `<\n</a>`
    /// still closes `a`.
    fn start_tag(&mut self, start: BytesStart<'_>, pos: usize, empty: bool) -> Result<(), XmlError> {
        let raw: &[u8] = &start;
        let Some(idx) = raw.iter().rposition(|b| *b == b'<') else {
            return self.open_element(&start, pos, empty);
        };
        let tag_pos = pos + idx + 1;
        if !self.recover {
            return Err(self.error("StartTag: invalid element name", tag_pos));
        }

        let rest = String::from_utf8_lossy(&raw[idx + 1..]).into_owned();
        log::trace!("Dropping half-typed tag before <{}", rest);

        if let Some(end) = rest.strip_prefix('/') {
            return self.close_element(end.trim(), tag_pos);
        }
        let name_len = rest
            .find(|c: char| c.is_ascii_whitespace())
            .unwrap_or(rest.len());
        if name_len == 0 {
            return Ok(());
        }
        self.open_element(&BytesStart::from_content(rest, name_len), tag_pos, empty)
    }

    fn open_element(
        &mut self,
        start: &BytesStart<'_>,
        pos: usize,
        empty: bool,
    ) -> Result<(), XmlError> {
        if self.open.is_empty() && self.root.is_some() && !self.recover {
            return Err(self.error("Extra content at the end of the document", pos));
        }

        let raw_name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut raw_attributes = Vec::new();
        let mut declarations = Vec::new();

        for attr in start.attributes().with_checks(false) {
            let attr = match attr {
                Ok(attr) => attr,
                Err(err) if self.recover => {
                    log::trace!("Skipping malformed attribute on <{}>: {}", raw_name, err);
                    continue;
                }
                Err(err) => return Err(self.error(err.to_string(), pos)),
            };
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(attr.value.as_ref()).into_owned());

            if key == "xmlns" {
                declarations.push((None, value));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                declarations.push((Some(prefix.to_string()), value));
            } else {
                raw_attributes.push((key, value));
            }
        }

        let declared = declarations.len();
        self.scopes.extend(declarations.iter().cloned());

        let (prefix, local) = split_qname(&raw_name);
        let namespace = self.resolve_prefix(prefix, true, pos)?;

        let mut attributes = Vec::with_capacity(raw_attributes.len());
        for (key, value) in raw_attributes {
            let (attr_prefix, attr_local) = split_qname(&key);
            let attr_namespace = self.resolve_prefix(attr_prefix, false, pos)?;
            attributes.push(Attribute {
                name: ExpandedName::new(attr_namespace.as_deref(), attr_local),
                prefix: attr_prefix.map(str::to_string),
                value,
            });
        }

        let id = self.nodes.len();
        let parent = self.open.last().map(|o| o.id);
        self.nodes.push(ElementNode {
            name: ExpandedName::new(namespace.as_deref(), local),
            prefix: prefix.map(str::to_string),
            attributes,
            children: Vec::new(),
            parent,
            line: self.line_of(pos),
            declarations,
        });

        match parent {
            Some(parent) => self.nodes[parent].children.push(id),
            None if self.root.is_none() => self.root = Some(id),
            None => log::trace!("Ignoring extra top-level element <{}>", raw_name),
        }

        if empty {
            self.pop_scopes(declared);
        } else {
            self.open.push(OpenElement {
                id,
                raw_name,
                declared,
            });
        }
        Ok(())
    }

    fn close_element(&mut self, name: &str, pos: usize) -> Result<(), XmlError> {
        match self.open.iter().rposition(|o| o.raw_name == name) {
            Some(idx) if idx + 1 == self.open.len() => {
                self.pop_open();
                Ok(())
            }
            Some(idx) if self.recover => {
                while self.open.len() > idx {
                    self.pop_open();
                }
                Ok(())
            }
            Some(_) => {
                let top = self.open.last().map(|o| o.raw_name.as_str()).unwrap_or_default();
                Err(self.error(
                    format!("Opening and ending tag mismatch: {} and {}", top, name),
                    pos,
                ))
            }
            None if self.recover => {
                log::trace!("Ignoring unmatched end tag </{}>", name);
                Ok(())
            }
            None => Err(self.error(format!("Unexpected end tag : {}", name), pos)),
        }
    }

    fn text_content(&mut self, text: &BytesText<'_>, pos: usize) -> Result<(), XmlError> {
        let significant = text.iter().any(|b| !b.is_ascii_whitespace());
        if significant && self.open.is_empty() && !self.recover {
            let message = if self.root.is_some() {
                "Extra content at the end of the document"
            } else {
                "Start tag expected, '<' not found"
            };
            return Err(self.error(message, pos));
        }
        Ok(())
    }

    fn finish(self) -> Result<XmlDocument, XmlError> {
        if let Some(open) = self.open.last() {
            if !self.recover {
                return Err(self.error(
                    format!("Premature end of data in tag {}", open.raw_name),
                    self.text.len(),
                ));
            }
        }

        match self.root {
            Some(root) => Ok(XmlDocument::from_parts(self.nodes, root)),
            None => Err(self.error("Document is empty", self.text.len())),
        }
    }

    fn pop_open(&mut self) {
        if let Some(open) = self.open.pop() {
            self.pop_scopes(open.declared);
        }
    }

    fn pop_scopes(&mut self, count: usize) {
        let keep = self.scopes.len().saturating_sub(count);
        self.scopes.truncate(keep);
    }

    /// Resolve a prefix against the in-scope declarations. Unprefixed
    /// attributes never take the default namespace.
    fn resolve_prefix(
        &self,
        prefix: Option<&str>,
        use_default: bool,
        pos: usize,
    ) -> Result<Option<String>, XmlError> {
        match prefix {
            Some("xml") => Ok(Some(XML_NAMESPACE.to_string())),
            Some(p) => {
                let found = self
                    .scopes
                    .iter()
                    .rev()
                    .find(|(declared, _)| declared.as_deref() == Some(p))
                    .map(|(_, uri)| uri.clone());
                match found {
                    Some(uri) => Ok(Some(uri).filter(|u| !u.is_empty())),
                    None if self.recover => Ok(None),
                    None => Err(self.error(format!("Namespace prefix {} is not defined", p), pos)),
                }
            }
            None if use_default => Ok(self
                .scopes
                .iter()
                .rev()
                .find(|(declared, _)| declared.is_none())
                .map(|(_, uri)| uri.clone())
                .filter(|u| !u.is_empty())),
            None => Ok(None),
        }
    }

    fn line_of(&self, pos: usize) -> usize {
        match self.line_starts.binary_search(&pos) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    fn error(&self, message: impl Into<String>, pos: usize) -> XmlError {
        let pos = pos.min(self.text.len());
        let line = self.line_of(pos);
        let line_start = self.line_starts[line - 1];
        let column = self
            .text
            .get(line_start..pos)
            .map(|s| s.chars().count())
            .unwrap_or(pos - line_start)
            + 1;
        XmlError {
            message: message.into(),
            line,
            column,
        }
    }
}
