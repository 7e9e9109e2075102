//! Namespace-aware XML document model.
//!
//! SAML messages are read and mutated through this single abstraction:
//! elements are matched by local name plus namespace URI so that documents
//! using different prefixes (or a default namespace) behave identically.
//! Serialization writes the tree back exactly as held in memory, with no
//! whitespace injection and no attribute reordering, so a signature
//! computed over a serialized subtree stays verifiable.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{SpidError, SpidResult};

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// A parsed XML document: optional declaration plus the document element.
#[derive(Debug, Clone)]
pub struct XmlDocument {
    has_declaration: bool,
    root: XmlElement,
}

/// One node in the tree. Comments are preserved so that re-serialization
/// does not disturb signed content around them.
#[derive(Debug, Clone)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
    Comment(String),
}

/// An element with its attributes (in document order, values unescaped)
/// and child nodes.
#[derive(Debug, Clone)]
pub struct XmlElement {
    /// Qualified name as written, e.g. `samlp:AuthnRequest`.
    pub name: String,
    /// Local part of the name.
    pub local_name: String,
    /// Namespace URI the element resolved to, if any.
    pub namespace: Option<String>,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl XmlDocument {
    /// Parses a complete document. DOCTYPE declarations are rejected;
    /// SAML messages never carry one.
    pub fn parse(xml: &str) -> SpidResult<Self> {
        let mut reader = Reader::from_str(xml);
        // Preserve whitespace so serialized output stays signature-stable.
        reader.config_mut().trim_text(false);

        let mut has_declaration = false;
        let mut root: Option<XmlElement> = None;
        // Open elements paired with the namespace binding count they restore on close.
        let mut stack: Vec<(XmlElement, usize)> = Vec::new();
        let mut bindings: Vec<(Option<String>, Option<String>)> = Vec::new();

        loop {
            match reader
                .read_event()
                .map_err(|e| SpidError::Parse(format!("invalid XML: {e}")))?
            {
                Event::Decl(_) => has_declaration = true,
                Event::DocType(_) => {
                    return Err(SpidError::Parse("DOCTYPE is not allowed".into()));
                }
                Event::Start(start) => {
                    let mark = bindings.len();
                    let element = read_element(&start, &mut bindings)?;
                    if root.is_some() && stack.is_empty() {
                        return Err(SpidError::Parse("multiple root elements".into()));
                    }
                    stack.push((element, mark));
                }
                Event::Empty(start) => {
                    let mark = bindings.len();
                    let element = read_element(&start, &mut bindings)?;
                    bindings.truncate(mark);
                    if root.is_some() && stack.is_empty() {
                        return Err(SpidError::Parse("multiple root elements".into()));
                    }
                    attach(element, &mut stack, &mut root);
                }
                Event::End(_) => {
                    if let Some((element, mark)) = stack.pop() {
                        bindings.truncate(mark);
                        attach(element, &mut stack, &mut root);
                    }
                }
                Event::Text(text) => {
                    let value = text
                        .unescape()
                        .map_err(|e| SpidError::Parse(format!("invalid character data: {e}")))?;
                    if let Some((parent, _)) = stack.last_mut() {
                        parent.children.push(XmlNode::Text(value.into_owned()));
                    }
                }
                Event::CData(data) => {
                    let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    if let Some((parent, _)) = stack.last_mut() {
                        parent.children.push(XmlNode::Text(value));
                    }
                }
                Event::Comment(comment) => {
                    let value = String::from_utf8_lossy(comment.as_ref()).into_owned();
                    if let Some((parent, _)) = stack.last_mut() {
                        parent.children.push(XmlNode::Comment(value));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let root = root.ok_or_else(|| SpidError::Parse("document has no root element".into()))?;
        Ok(Self {
            has_declaration,
            root,
        })
    }

    pub fn root(&self) -> &XmlElement {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut XmlElement {
        &mut self.root
    }

    pub fn into_root(self) -> XmlElement {
        self.root
    }

    /// First element (document order, root included) with the given local
    /// name, optionally restricted to a namespace URI.
    pub fn find_first(&self, local_name: &str, namespace: Option<&str>) -> Option<&XmlElement> {
        self.root.find_first(local_name, namespace)
    }

    pub fn find_first_mut(
        &mut self,
        local_name: &str,
        namespace: Option<&str>,
    ) -> Option<&mut XmlElement> {
        self.root.find_first_mut(local_name, namespace)
    }

    pub fn find_all(&self, local_name: &str, namespace: Option<&str>) -> Vec<&XmlElement> {
        self.root.find_all(local_name, namespace)
    }

    /// Clone of the first matching element with the namespace declarations
    /// of its ancestors merged onto it, so the subtree can stand alone
    /// (exclusive canonicalization then prunes whatever is not used).
    pub fn detached_subtree(
        &self,
        local_name: &str,
        namespace: Option<&str>,
    ) -> Option<XmlElement> {
        let mut inherited: Vec<(String, String)> = Vec::new();
        detach(&self.root, local_name, namespace, &mut inherited)
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        if self.has_declaration {
            out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        }
        write_element(&self.root, &mut out);
        out
    }
}

impl XmlElement {
    /// New element for programmatic construction. `name` is the qualified
    /// name as it should be written; `namespace` the URI it belongs to.
    pub fn new(name: &str, namespace: Option<&str>) -> Self {
        let local_name = match name.split_once(':') {
            Some((_, local)) => local.to_string(),
            None => name.to_string(),
        };
        Self {
            name: name.to_string(),
            local_name,
            namespace: namespace.map(str::to_string),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.children.push(XmlNode::Text(text.to_string()));
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    #[must_use]
    pub fn matches(&self, local_name: &str, namespace: Option<&str>) -> bool {
        self.local_name == local_name
            && (namespace.is_none() || self.namespace.as_deref() == namespace)
    }

    /// Attribute value by qualified name as written (`Format`, `xml:lang`).
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.as_str() == name)
            .map(|(_, value)| value.as_str())
    }

    /// Sets an attribute, replacing in place when present so that
    /// serialization order stays stable.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self.attributes.iter_mut().find(|(key, _)| key.as_str() == name) {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.attributes.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let index = self
            .attributes
            .iter()
            .position(|(key, _)| key.as_str() == name)?;
        Some(self.attributes.remove(index).1)
    }

    /// Concatenated direct text content. Callers trim where the protocol
    /// treats surrounding whitespace as insignificant.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            if let XmlNode::Text(text) = child {
                out.push_str(text);
            }
        }
        out
    }

    pub fn find_first(&self, local_name: &str, namespace: Option<&str>) -> Option<&XmlElement> {
        if self.matches(local_name, namespace) {
            return Some(self);
        }
        self.child_elements()
            .find_map(|child| child.find_first(local_name, namespace))
    }

    pub fn find_first_mut(
        &mut self,
        local_name: &str,
        namespace: Option<&str>,
    ) -> Option<&mut XmlElement> {
        if self.matches(local_name, namespace) {
            return Some(self);
        }
        for child in &mut self.children {
            if let XmlNode::Element(element) = child {
                if let Some(found) = element.find_first_mut(local_name, namespace) {
                    return Some(found);
                }
            }
        }
        None
    }

    pub fn find_all(&self, local_name: &str, namespace: Option<&str>) -> Vec<&XmlElement> {
        let mut found = Vec::new();
        self.collect_all(local_name, namespace, &mut found);
        found
    }

    fn collect_all<'a>(
        &'a self,
        local_name: &str,
        namespace: Option<&str>,
        found: &mut Vec<&'a XmlElement>,
    ) {
        if self.matches(local_name, namespace) {
            found.push(self);
        }
        for child in self.child_elements() {
            child.collect_all(local_name, namespace, found);
        }
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(element) => Some(element),
            _ => None,
        })
    }

    /// First direct child element matching, without descending further.
    /// Structural response checks rely on this to reject elements smuggled
    /// into unexpected positions.
    pub fn child_first(&self, local_name: &str, namespace: Option<&str>) -> Option<&XmlElement> {
        self.child_elements()
            .find(|child| child.matches(local_name, namespace))
    }

    pub fn push_child(&mut self, child: XmlElement) {
        self.children.push(XmlNode::Element(child));
    }

    pub fn insert_child(&mut self, index: usize, child: XmlElement) {
        self.children.insert(index, XmlNode::Element(child));
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        write_element(self, &mut out);
        out
    }
}

fn read_element(
    start: &quick_xml::events::BytesStart<'_>,
    bindings: &mut Vec<(Option<String>, Option<String>)>,
) -> SpidResult<XmlElement> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| SpidError::Parse(format!("invalid attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| SpidError::Parse(format!("invalid attribute value: {e}")))?
            .into_owned();
        if key == "xmlns" {
            bindings.push((None, non_empty(&value)));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            bindings.push((Some(prefix.to_string()), non_empty(&value)));
        }
        attributes.push((key, value));
    }

    let (prefix, local_name) = match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, name.clone()),
    };
    let namespace = resolve(bindings, prefix.as_deref());

    Ok(XmlElement {
        name,
        local_name,
        namespace,
        attributes,
        children: Vec::new(),
    })
}

fn resolve(
    bindings: &[(Option<String>, Option<String>)],
    prefix: Option<&str>,
) -> Option<String> {
    if prefix == Some("xml") {
        return Some(XML_NAMESPACE.to_string());
    }
    bindings
        .iter()
        .rev()
        .find(|(bound, _)| bound.as_deref() == prefix)
        .and_then(|(_, uri)| uri.clone())
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn attach(
    element: XmlElement,
    stack: &mut Vec<(XmlElement, usize)>,
    root: &mut Option<XmlElement>,
) {
    match stack.last_mut() {
        Some((parent, _)) => parent.children.push(XmlNode::Element(element)),
        None => *root = Some(element),
    }
}

fn detach(
    element: &XmlElement,
    local_name: &str,
    namespace: Option<&str>,
    inherited: &mut Vec<(String, String)>,
) -> Option<XmlElement> {
    if element.matches(local_name, namespace) {
        let mut clone = element.clone();
        // Later declarations shadow earlier ones for the same prefix.
        let mut merged: Vec<(String, String)> = Vec::new();
        for (key, value) in inherited.iter() {
            match merged.iter_mut().find(|(k, _)| k == key) {
                Some((_, existing)) => *existing = value.clone(),
                None => merged.push((key.clone(), value.clone())),
            }
        }
        for (key, value) in merged {
            if clone.attr(&key).is_none() {
                clone.attributes.push((key, value));
            }
        }
        return Some(clone);
    }
    let mark = inherited.len();
    for (key, value) in &element.attributes {
        if key == "xmlns" || key.starts_with("xmlns:") {
            inherited.push((key.clone(), value.clone()));
        }
    }
    for child in element.child_elements() {
        if let Some(found) = detach(child, local_name, namespace, inherited) {
            return Some(found);
        }
    }
    inherited.truncate(mark);
    None
}

fn write_element(element: &XmlElement, out: &mut String) {
    out.push('<');
    out.push_str(&element.name);
    for (key, value) in &element.attributes {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&xml_escape(value));
        out.push('"');
    }
    if element.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &element.children {
        match child {
            XmlNode::Element(nested) => write_element(nested, out),
            XmlNode::Text(text) => out.push_str(&xml_escape(text)),
            XmlNode::Comment(comment) => {
                out.push_str("<!--");
                out.push_str(comment);
                out.push_str("-->");
            }
        }
    }
    out.push_str("</");
    out.push_str(&element.name);
    out.push('>');
}

/// Escapes text for XML element and attribute content.
pub(crate) fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?><samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_r1" Version="2.0"><saml:Issuer>https://idp.example.com</saml:Issuer><saml:Assertion ID="_a1"><saml:Issuer>https://idp.example.com</saml:Issuer></saml:Assertion></samlp:Response>"#;

    #[test]
    fn test_parse_resolves_namespaces() {
        let doc = XmlDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.root().local_name, "Response");
        assert_eq!(
            doc.root().namespace.as_deref(),
            Some("urn:oasis:names:tc:SAML:2.0:protocol")
        );
        let issuer = doc
            .find_first("Issuer", Some("urn:oasis:names:tc:SAML:2.0:assertion"))
            .unwrap();
        assert_eq!(issuer.text(), "https://idp.example.com");
    }

    #[test]
    fn test_prefix_choice_does_not_affect_matching() {
        let default_ns = r#"<Response xmlns="urn:oasis:names:tc:SAML:2.0:protocol" ID="_x"/>"#;
        let doc = XmlDocument::parse(default_ns).unwrap();
        assert!(doc
            .find_first("Response", Some("urn:oasis:names:tc:SAML:2.0:protocol"))
            .is_some());
        assert!(doc
            .find_first("Response", Some("urn:oasis:names:tc:SAML:2.0:assertion"))
            .is_none());
    }

    #[test]
    fn test_round_trip_preserves_text_and_attribute_order() {
        let xml = r#"<a z="1" b="two &amp; three"><c>text &lt;here&gt;</c><d/></a>"#;
        let doc = XmlDocument::parse(xml).unwrap();
        assert_eq!(doc.to_xml(), xml);
    }

    #[test]
    fn test_round_trip_preserves_whitespace_between_elements() {
        let xml = "<a>\n  <b>v</b>\n</a>";
        let doc = XmlDocument::parse(xml).unwrap();
        assert_eq!(doc.to_xml(), xml);
    }

    #[test]
    fn test_set_attr_replaces_in_place() {
        let mut doc = XmlDocument::parse(r#"<a one="1" two="2"/>"#).unwrap();
        doc.root_mut().set_attr("one", "uno");
        assert_eq!(doc.to_xml(), r#"<a one="uno" two="2"/>"#);
    }

    #[test]
    fn test_remove_attr() {
        let mut doc = XmlDocument::parse(r#"<a keep="y" drop="n"/>"#).unwrap();
        assert_eq!(doc.root_mut().remove_attr("drop").as_deref(), Some("n"));
        assert_eq!(doc.root_mut().remove_attr("drop"), None);
        assert_eq!(doc.to_xml(), r#"<a keep="y"/>"#);
    }

    #[test]
    fn test_child_first_does_not_descend() {
        let doc = XmlDocument::parse(SAMPLE).unwrap();
        let assertion = doc
            .root()
            .child_first("Assertion", Some("urn:oasis:names:tc:SAML:2.0:assertion"))
            .unwrap();
        assert_eq!(assertion.attr("ID"), Some("_a1"));
        // The nested Issuer is not a direct child of the Response.
        let response_issuer = doc.root().child_first("Issuer", None).unwrap();
        assert_eq!(response_issuer.text(), "https://idp.example.com");
        assert!(doc.root().child_first("NameID", None).is_none());
    }

    #[test]
    fn test_detached_subtree_inherits_namespace_declarations() {
        let doc = XmlDocument::parse(SAMPLE).unwrap();
        let assertion = doc
            .detached_subtree("Assertion", Some("urn:oasis:names:tc:SAML:2.0:assertion"))
            .unwrap();
        let standalone = assertion.to_xml();
        assert!(standalone.contains(r#"xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion""#));
        // The detached copy still parses on its own.
        XmlDocument::parse(&standalone).unwrap();
    }

    #[test]
    fn test_doctype_rejected() {
        let xml = "<!DOCTYPE a [<!ENTITY x \"y\">]><a>&x;</a>";
        assert!(matches!(
            XmlDocument::parse(xml),
            Err(SpidError::Parse(_))
        ));
    }

    #[test]
    fn test_malformed_xml_rejected() {
        assert!(XmlDocument::parse("<a><b></a>").is_err());
        assert!(XmlDocument::parse("no markup at all").is_err());
    }

    #[test]
    fn test_built_elements_serialize_with_escaping() {
        let element = XmlElement::new("md:ServiceName", Some("urn:oasis:names:tc:SAML:2.0:metadata"))
            .with_attr("xml:lang", "it")
            .with_text("Agenzia \"Entrate\" & co");
        assert_eq!(
            element.to_xml(),
            r#"<md:ServiceName xml:lang="it">Agenzia &quot;Entrate&quot; &amp; co</md:ServiceName>"#
        );
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b>&\"'"), "a&lt;b&gt;&amp;&quot;&apos;");
        assert_eq!(xml_escape("plain"), "plain");
    }
}
