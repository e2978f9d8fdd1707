//! Owned XML element tree
//!
//! A thin DOM built from quick-xml events. The mapping compiler works on
//! this tree so forward-referenced elements can be retried after later files
//! resolve their targets.

use indexmap::IndexMap;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Result};

/// A child of an element: nested element or text
#[derive(Debug, Clone)]
pub enum XmlChild {
    /// Nested element
    Element(XmlElement),
    /// Text or CDATA content
    Text(String),
}

/// One parsed element with attributes and children
#[derive(Debug, Clone)]
pub struct XmlElement {
    /// Element name
    pub name: String,
    /// Attributes in document order
    pub attrs: IndexMap<String, String>,
    /// Children in document order
    pub children: Vec<XmlChild>,
}

impl XmlElement {
    /// Parse a document and return its root element
    pub fn parse(xml: &str) -> Result<XmlElement> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    stack.push(element_from_start(&e)?);
                }
                Ok(Event::Empty(e)) => {
                    let element = element_from_start(&e)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| Error::malformed("unbalanced closing tag"))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(e)) => {
                    let text = e
                        .unescape()
                        .map_err(|e| Error::malformed(format!("bad text content: {e}")))?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlChild::Text(text.into_owned()));
                    }
                }
                Ok(Event::CData(e)) => {
                    let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlChild::Text(text));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::malformed(format!("bad markup: {e}"))),
            }
        }

        if !stack.is_empty() {
            return Err(Error::malformed("unclosed element at end of document"));
        }
        root.ok_or_else(|| Error::malformed("document has no root element"))
    }

    /// Attribute by name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Attribute that must be present
    pub fn required_attr(&self, name: &str) -> Result<&str> {
        self.attr(name).ok_or_else(|| {
            Error::malformed(format!(
                "element <{}> is missing required attribute '{name}'",
                self.name
            ))
        })
    }

    /// Attribute parsed as a boolean, with a default
    pub fn bool_attr(&self, name: &str, default: bool) -> Result<bool> {
        match self.attr(name) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(Error::malformed(format!(
                "attribute '{name}' of <{}> expects true/false, got '{other}'",
                self.name
            ))),
        }
    }

    /// Direct child elements in order
    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|c| match c {
            XmlChild::Element(e) => Some(e),
            XmlChild::Text(_) => None,
        })
    }

    /// Direct child elements with the given name
    pub fn elements<'e>(&'e self, name: &'e str) -> impl Iterator<Item = &'e XmlElement> + 'e {
        self.child_elements().filter(move |e| e.name == name)
    }

    /// First direct child element with the given name
    pub fn first<'e>(&'e self, name: &'e str) -> Option<&'e XmlElement> {
        self.elements(name).next()
    }

    /// Concatenated direct text content
    pub fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            if let XmlChild::Text(t) = child {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(t);
            }
        }
        out
    }
}

fn element_from_start(e: &quick_xml::events::BytesStart<'_>) -> Result<XmlElement> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = IndexMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::malformed(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::malformed(format!("bad attribute value: {e}")))?
            .into_owned();
        attrs.insert(key, value);
    }
    Ok(XmlElement {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(XmlChild::Element(element));
            Ok(())
        }
        None => {
            if root.is_some() {
                return Err(Error::malformed("multiple root elements"));
            }
            *root = Some(element);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_and_attributes() {
        let root = XmlElement::parse(
            r#"<mapper namespace="user">
                 <select id="findById" resultType="User">
                   SELECT id, name FROM users WHERE id = #{id}
                 </select>
               </mapper>"#,
        )
        .unwrap();

        assert_eq!(root.name, "mapper");
        assert_eq!(root.attr("namespace"), Some("user"));
        let select = root.first("select").unwrap();
        assert_eq!(select.attr("id"), Some("findById"));
        assert!(select.text().contains("WHERE id = #{id}"));
    }

    #[test]
    fn unescapes_entities() {
        let root = XmlElement::parse(r#"<s t="a&lt;b">x &gt;= y</s>"#).unwrap();
        assert_eq!(root.attr("t"), Some("a<b"));
        assert_eq!(root.text(), "x >= y");
    }

    #[test]
    fn handles_empty_elements() {
        let root = XmlElement::parse(r#"<m><cache readOnly="true"/></m>"#).unwrap();
        let cache = root.first("cache").unwrap();
        assert!(cache.bool_attr("readOnly", false).unwrap());
        assert!(cache.children.is_empty());
    }

    #[test]
    fn rejects_malformed_markup() {
        assert!(XmlElement::parse("<a><b></a>").is_err());
        assert!(XmlElement::parse("").is_err());
    }

    #[test]
    fn cdata_is_text() {
        let root = XmlElement::parse("<s><![CDATA[a < b]]></s>").unwrap();
        assert_eq!(root.text(), "a < b");
    }

    #[test]
    fn required_attrs_are_enforced() {
        let root = XmlElement::parse("<s/>").unwrap();
        let err = root.required_attr("id").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ConfigMalformed);
    }
}
