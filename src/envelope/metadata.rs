//! Header metadata tree
//!
//! The envelope header is a small XML document: named elements carrying
//! parameters (XML attributes), text content and child elements. Parsing
//! and serialization go through quick-xml; `Metadata` is the tree the rest
//! of the crate works with.
//!
//! Leaf text is kept exactly as written. Whitespace-only text in an element
//! that also has children is layout and is dropped.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Error, Result};

/// Deepest element nesting accepted by the parser
const MAX_DEPTH: usize = 32;

/// One element of the header tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    name: String,
    content: String,
    params: Vec<(String, String)>,
    children: Vec<Metadata>,
}

impl Metadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: String::new(),
            params: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder: set text content
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_parameter(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.params.push((key.to_string(), value)),
        }
    }

    pub fn remove_parameter(&mut self, key: &str) -> bool {
        let before = self.params.len();
        self.params.retain(|(k, _)| k != key);
        before != self.params.len()
    }

    /// First child with the given name
    pub fn child(&self, name: &str) -> Option<&Metadata> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Metadata> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// All children with the given name, in document order
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Metadata> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn children(&self) -> &[Metadata] {
        &self.children
    }

    pub fn add_child(&mut self, child: Metadata) -> &mut Metadata {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Get the first child with `name`, appending an empty one if missing
    pub fn child_or_insert(&mut self, name: &str) -> &mut Metadata {
        match self.children.iter().position(|c| c.name == name) {
            Some(idx) => &mut self.children[idx],
            None => self.add_child(Metadata::new(name)),
        }
    }

    /// Remove every child with `name`. Returns the number removed.
    pub fn remove_children(&mut self, name: &str) -> usize {
        let before = self.children.len();
        self.children.retain(|c| c.name != name);
        before - self.children.len()
    }

    /// Serialize as a complete document. The output always ends with the
    /// root's explicit closing tag.
    pub fn to_raw(&self) -> Vec<u8> {
        let mut writer = Writer::new(Vec::new());
        // Writing into a Vec<u8> cannot fail
        let _ = writer
            .write_event(Event::Decl(BytesDecl::new("1.0", None, None)))
            .and_then(|_| self.write_element(&mut writer));
        writer.into_inner()
    }

    fn write_element(&self, writer: &mut Writer<Vec<u8>>) -> quick_xml::Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (k, v) in &self.params {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        writer.write_event(Event::Start(start))?;
        if !self.content.is_empty() {
            writer.write_event(Event::Text(BytesText::new(&self.content)))?;
        }
        for child in &self.children {
            child.write_element(writer)?;
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))
    }

    /// Parse a complete document
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::MalformedHeader("header is not valid UTF-8".into()))?;
        let mut reader = Reader::from_str(text);

        let mut stack: Vec<Metadata> = Vec::new();
        let mut root: Option<Metadata> = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                Error::MalformedHeader(format!("{} at offset {}", e, reader.buffer_position()))
            })?;

            match event {
                Event::Start(start) => {
                    if root.is_some() {
                        return Err(Error::MalformedHeader("trailing data after root element".into()));
                    }
                    if stack.len() >= MAX_DEPTH {
                        return Err(Error::MalformedHeader("elements nested too deeply".into()));
                    }
                    stack.push(element_from(&start)?);
                }
                Event::Empty(start) => {
                    let element = element_from(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None if root.is_none() => root = Some(element),
                        None => {
                            return Err(Error::MalformedHeader("trailing data after root element".into()))
                        }
                    }
                }
                Event::End(_) => {
                    let mut element = stack
                        .pop()
                        .ok_or_else(|| Error::MalformedHeader("unexpected closing tag".into()))?;
                    if !element.children.is_empty() && element.content.trim().is_empty() {
                        element.content.clear();
                    }
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| Error::MalformedHeader(format!("invalid text: {}", e)))?;
                    push_text(&mut stack, &text)?;
                }
                Event::CData(cdata) => {
                    let text = std::str::from_utf8(&cdata)
                        .map_err(|_| Error::MalformedHeader("CDATA is not valid UTF-8".into()))?;
                    push_text(&mut stack, text)?;
                }
                Event::Eof => break,
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(Error::MalformedHeader(format!("missing </{}>", open.name)));
        }
        root.ok_or_else(|| Error::MalformedHeader("no root element".into()))
    }
}

fn element_from(start: &BytesStart<'_>) -> Result<Metadata> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|_| Error::MalformedHeader("element name is not valid UTF-8".into()))?
        .to_string();
    let mut element = Metadata::new(name);

    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::MalformedHeader(format!("bad parameter: {}", e)))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|_| Error::MalformedHeader("parameter name is not valid UTF-8".into()))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::MalformedHeader(format!("bad parameter value: {}", e)))?;
        element.set_parameter(&key, value.into_owned());
    }
    Ok(element)
}

/// Append character data to the open element. Outside the root only
/// whitespace is allowed.
fn push_text(stack: &mut [Metadata], text: &str) -> Result<()> {
    match stack.last_mut() {
        Some(open) => {
            open.content.push_str(text);
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(Error::MalformedHeader("text outside the root element".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_and_parse() {
        let mut root = Metadata::new("Haggle");
        root.set_parameter("persistent", "yes");
        root.add_child(Metadata::new("Attr").with_content("a < b & c"))
            .set_parameter("name", "quote\"d");

        let raw = root.to_raw();
        assert!(raw.ends_with(b"</Haggle>"));

        let parsed = Metadata::from_raw(&raw).unwrap();
        assert_eq!(parsed, root);
        let attr = parsed.child("Attr").unwrap();
        assert_eq!(attr.content(), "a < b & c");
        assert_eq!(attr.parameter("name"), Some("quote\"d"));
    }

    #[test]
    fn test_parse_foreign_formatting() {
        let raw = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
            <Haggle persistent='no'>\n  <!-- comment -->\n  <Attr name=\"x\">&#65;</Attr>\n  <Empty/>\n</Haggle>\n";
        let root = Metadata::from_raw(raw).unwrap();
        assert_eq!(root.parameter("persistent"), Some("no"));
        assert_eq!(root.child("Attr").unwrap().content(), "A");
        assert!(root.child("Empty").is_some());
        assert_eq!(root.content(), "");
    }

    #[test]
    fn test_leaf_whitespace_preserved() {
        let mut root = Metadata::new("Haggle");
        root.add_child(Metadata::new("Attr").with_content("  "));
        root.add_child(Metadata::new("Attr").with_content(" padded\tvalue \n"));

        let parsed = Metadata::from_raw(&root.to_raw()).unwrap();
        let contents: Vec<&str> = parsed.children_named("Attr").map(|c| c.content()).collect();
        assert_eq!(contents, vec!["  ", " padded\tvalue \n"]);
        assert_eq!(parsed, root);
    }

    #[test]
    fn test_cdata_content() {
        let raw = b"<Haggle><Attr name=\"x\"><![CDATA[<raw> & text]]></Attr></Haggle>";
        let root = Metadata::from_raw(raw).unwrap();
        assert_eq!(root.child("Attr").unwrap().content(), "<raw> & text");
    }

    #[test]
    fn test_mismatched_tag_rejected() {
        assert!(matches!(
            Metadata::from_raw(b"<Haggle><Attr></Data></Haggle>"),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_unclosed_root_rejected() {
        assert!(matches!(
            Metadata::from_raw(b"<Haggle><Attr>x</Attr>"),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let mut raw = String::new();
        for _ in 0..40 {
            raw.push_str("<a>");
        }
        for _ in 0..40 {
            raw.push_str("</a>");
        }
        assert!(Metadata::from_raw(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_child_or_insert_reuses() {
        let mut root = Metadata::new("Haggle");
        root.child_or_insert("Data").set_parameter("data_len", "1");
        root.child_or_insert("Data").set_parameter("data_len", "2");
        assert_eq!(root.children_named("Data").count(), 1);
        assert_eq!(root.child("Data").unwrap().parameter("data_len"), Some("2"));
    }
}
