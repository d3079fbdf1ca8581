//! Minimal owned XML element tree used for definitions and state documents.
//!
//! Parsing and writing go through `quick-xml`; the tree itself is a plain
//! value type so definitions can be cloned, merged and compared freely.

use std::borrow::Cow;
use std::str::FromStr;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{SmError, SmResult};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: impl ToString) -> Self {
        self.set_attribute(key, value);
        self
    }

    #[must_use]
    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    /// Set an attribute, replacing any existing value for `key`.
    pub fn set_attribute(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        if let Some(slot) = self.attributes.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.attributes.push((key.to_owned(), value));
        }
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<String> {
        let index = self.attributes.iter().position(|(k, _)| k == key)?;
        Some(self.attributes.remove(index).1)
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Parse an attribute value, returning `None` when absent or unparsable.
    #[must_use]
    pub fn attribute_as<T: FromStr>(&self, key: &str) -> Option<T> {
        self.attribute(key).and_then(|v| v.trim().parse().ok())
    }

    /// Interpret `"1"`/`"true"` as true; anything else (or absence) as false.
    #[must_use]
    pub fn attribute_flag(&self, key: &str) -> bool {
        matches!(self.attribute(key).map(str::trim), Some("1" | "true"))
    }

    /// Append a child and return a mutable handle to it.
    pub fn add_child(&mut self, child: XmlElement) -> &mut XmlElement {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    #[must_use]
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut XmlElement> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First child whose `name` attribute equals `value`, whatever its tag.
    #[must_use]
    pub fn child_with_name_attribute(&self, value: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.attribute("name") == Some(value))
    }

    /// Visit this element and all descendants depth-first.
    pub fn walk_mut(&mut self, visit: &mut impl FnMut(&mut XmlElement)) {
        visit(self);
        for child in &mut self.children {
            child.walk_mut(visit);
        }
    }

    /// Parse a document and return its root element.
    ///
    /// # Errors
    ///
    /// Returns [`SmError::Xml`] for syntax errors and [`SmError::MalformedXml`]
    /// for unbalanced or empty documents.
    pub fn parse(text: &str) -> SmResult<Self> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => stack.push(element_from_start(&start)?),
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| SmError::MalformedXml("unbalanced end tag".into()))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&unescape(&text)?);
                    }
                }
                Event::CData(data) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(SmError::MalformedXml(format!("unclosed element <{}>", stack[stack.len() - 1].name)));
        }
        root.ok_or_else(|| SmError::MalformedXml("document has no root element".into()))
    }

    /// Serialize this element as an indented document with an XML declaration.
    ///
    /// # Errors
    ///
    /// Propagates writer failures.
    pub fn to_document(&self) -> SmResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        write_element(&mut writer, self)?;
        Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
    }

    /// Serialize this element without a declaration, on a single line.
    ///
    /// # Errors
    ///
    /// Propagates writer failures.
    pub fn to_fragment(&self) -> SmResult<String> {
        let mut writer = Writer::new(Vec::new());
        write_element(&mut writer, self)?;
        Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
    }
}

fn element_from_start(start: &BytesStart<'_>) -> SmResult<XmlElement> {
    let mut element = XmlElement::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attribute in start.attributes() {
        let attribute = attribute.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = unescape(&attribute.value)?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn unescape(raw: &[u8]) -> SmResult<Cow<'static, str>> {
    let text = String::from_utf8_lossy(raw);
    let unescaped =
        quick_xml::escape::unescape(&text).map_err(|e| SmError::MalformedXml(e.to_string()))?;
    Ok(Cow::Owned(unescaped.into_owned()))
}

fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) -> SmResult<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(SmError::MalformedXml("multiple root elements".into()));
    }
    *root = Some(element);
    Ok(())
}

fn write_element<W: std::io::Write>(writer: &mut Writer<W>, element: &XmlElement) -> SmResult<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() && element.text.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    if !element.text.is_empty() {
        writer.write_event(Event::Text(BytesText::new(&element.text)))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    Ok(())
}

#[cfg(test)]
#[path = "xml_test.rs"]
mod tests;
