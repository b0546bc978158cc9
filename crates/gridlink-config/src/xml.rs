//! Owned XML element tree and the value parsers the configuration schema
//! relies on.
//!
//! The tree is deliberately mutable: `${name default}` macro substitution
//! runs as a pre-pass over the parsed document before any component reads
//! its configuration, and service configuration injects flowed-down
//! elements with [`XmlElement::ensure_element`].

use quick_xml::{Reader, events::Event};

use crate::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XmlElement {
    name: String,
    value: String,
    attributes: Vec<(String, String)>,
    children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), ..Self::default() }
    }

    /// Parses a complete document into its root element.
    pub fn parse(text: &str) -> Result<Self> {
        let mut reader = Reader::from_str(text);
        let mut stack: Vec<Self> = Vec::new();
        let mut root: Option<Self> = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    stack.push(element_of(&start)?);
                }
                Event::Empty(start) => {
                    attach(&mut stack, &mut root, element_of(&start)?)?;
                }
                Event::Text(text) => {
                    if let Some(top) = stack.last_mut() {
                        let text = text.unescape().map_err(|err| {
                            Error::illegal_argument(format!("malformed text: {err}"))
                        })?;
                        top.value.push_str(text.trim());
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| Error::illegal_argument("unbalanced closing tag"))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(Error::illegal_argument("unterminated element"));
        }
        root.ok_or_else(|| Error::illegal_argument("empty XML document"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        self.value.trim()
    }

    pub fn set_text(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    /// No value and no children.
    pub fn is_empty(&self) -> bool {
        self.text().is_empty() && self.children.is_empty()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    pub fn children(&self) -> &[Self] {
        &self.children
    }

    pub fn add_element(&mut self, element: Self) {
        self.children.push(element);
    }

    /// First child with the given name.
    pub fn element(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn elements<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Self> {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Child with the given name, created empty when missing.
    pub fn ensure_element(&mut self, name: &str) -> &mut Self {
        match self.children.iter().position(|child| child.name == name) {
            Some(i) => &mut self.children[i],
            None => {
                self.children.push(Self::new(name));
                self.children.last_mut().unwrap()
            }
        }
    }

    // ----- typed child accessors ------------------------------------------

    pub fn string_of(&self, name: &str, default: &str) -> String {
        match self.element(name) {
            Some(child) if !child.text().is_empty() => child.text().to_string(),
            _ => default.to_string(),
        }
    }

    pub fn bool_of(&self, name: &str, default: bool) -> Result<bool> {
        match self.element(name) {
            Some(child) if !child.text().is_empty() => match child.text() {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(Error::illegal_argument(format!(
                    "the \"{name}\" element contains an invalid boolean \"{other}\""
                ))),
            },
            _ => Ok(default),
        }
    }

    pub fn i64_of(&self, name: &str, default: i64) -> Result<i64> {
        match self.element(name) {
            Some(child) if !child.text().is_empty() => child.text().parse().map_err(|_| {
                Error::illegal_argument(format!(
                    "the \"{name}\" element contains an invalid number \"{}\"",
                    child.text()
                ))
            }),
            _ => Ok(default),
        }
    }

    /// Duration child in milliseconds; accepts `ms`, `s`, `m`, `h` and `d`
    /// suffixes, bare values are milliseconds.
    pub fn millis_of(&self, name: &str, default: i64) -> Result<i64> {
        match self.element(name) {
            Some(child) if !child.text().is_empty() => parse_millis(child.text()),
            _ => Ok(default),
        }
    }

    /// Memory-size child in octets; accepts `k`, `m` and `g` suffixes.
    pub fn memory_of(&self, name: &str, default: i64) -> Result<i64> {
        match self.element(name) {
            Some(child) if !child.text().is_empty() => parse_memory(child.text()),
            _ => Ok(default),
        }
    }
}

fn element_of(start: &quick_xml::events::BytesStart<'_>) -> Result<XmlElement> {
    let mut element = XmlElement::new(decode(start.name().as_ref()));
    for attr in start.attributes() {
        let attr =
            attr.map_err(|err| Error::illegal_argument(format!("malformed attribute: {err}")))?;
        let value = attr
            .unescape_value()
            .map_err(|err| Error::illegal_argument(format!("malformed attribute value: {err}")))?;
        element.attributes.push((decode(attr.key.as_ref()), value.into_owned()));
    }
    Ok(element)
}

fn attach(stack: &mut Vec<XmlElement>, root: &mut Option<XmlElement>, el: XmlElement) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(el),
        None => {
            if root.is_some() {
                return Err(Error::illegal_argument("multiple root elements"));
            }
            *root = Some(el);
        }
    }
    Ok(())
}

fn decode(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

pub fn parse_millis(text: &str) -> Result<i64> {
    let text = text.trim();
    let (digits, factor) = if let Some(d) = text.strip_suffix("ms") {
        (d, 1)
    } else if let Some(d) = text.strip_suffix('s') {
        (d, 1_000)
    } else if let Some(d) = text.strip_suffix('m') {
        (d, 60_000)
    } else if let Some(d) = text.strip_suffix('h') {
        (d, 3_600_000)
    } else if let Some(d) = text.strip_suffix('d') {
        (d, 86_400_000)
    } else {
        (text, 1)
    };
    digits
        .trim()
        .parse::<i64>()
        .map(|n| n * factor)
        .map_err(|_| Error::illegal_argument(format!("invalid duration \"{text}\"")))
}

pub fn parse_memory(text: &str) -> Result<i64> {
    let text = text.trim();
    let (digits, factor) = match text.chars().last() {
        Some('k' | 'K') => (&text[..text.len() - 1], 1_024),
        Some('m' | 'M') => (&text[..text.len() - 1], 1_024 * 1_024),
        Some('g' | 'G') => (&text[..text.len() - 1], 1_024 * 1_024 * 1_024),
        _ => (text, 1),
    };
    digits
        .trim()
        .parse::<i64>()
        .map(|n| n * factor)
        .map_err(|_| Error::illegal_argument(format!("invalid memory size \"{text}\"")))
}

/// Rewrites `${name default}` tokens throughout the tree. `resolve` maps a
/// property name to its value; an unresolved name substitutes the supplied
/// default, or leaves the token untouched when there is none.
pub fn apply_macros(el: &mut XmlElement, resolve: &dyn Fn(&str) -> Option<String>) {
    el.value = substitute(&el.value, resolve);
    for (_, value) in &mut el.attributes {
        *value = substitute(value, resolve);
    }
    for child in &mut el.children {
        apply_macros(child, resolve);
    }
}

/// [`apply_macros`] against the process environment.
pub fn apply_env_macros(el: &mut XmlElement) {
    apply_macros(el, &|name| std::env::var(name).ok());
}

fn substitute(text: &str, resolve: &dyn Fn(&str) -> Option<String>) -> String {
    let Some(mut start) = text.find("${") else {
        return text.to_string();
    };

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let token = &after[..end];
        let (name, default) = match token.split_once(' ') {
            Some((name, default)) => (name, Some(default.trim())),
            None => (token, None),
        };
        match resolve(name) {
            Some(value) => out.push_str(&value),
            None => match default {
                Some(default) => out.push_str(default),
                None => out.push_str(&rest[start..=start + 2 + end]),
            },
        }
        rest = &after[end + 1..];
        match rest.find("${") {
            Some(next) => start = next,
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <tcp-initiator>
          <local-address>
            <address>127.0.0.1</address>
            <port>0</port>
            <reusable>true</reusable>
          </local-address>
          <remote-addresses>
            <socket-address>
              <address>cluster-a.example.com</address>
              <port>9099</port>
            </socket-address>
            <socket-address>
              <address>cluster-b.example.com</address>
              <port>9100</port>
            </socket-address>
          </remote-addresses>
          <keep-alive-enabled>true</keep-alive-enabled>
          <receive-buffer-size>64k</receive-buffer-size>
          <linger-timeout>2s</linger-timeout>
        </tcp-initiator>"#;

    #[test]
    fn parses_nested_elements_and_values() {
        let root = XmlElement::parse(SAMPLE).unwrap();
        assert_eq!(root.name(), "tcp-initiator");

        let local = root.element("local-address").unwrap();
        assert_eq!(local.string_of("address", ""), "127.0.0.1");
        assert!(local.bool_of("reusable", false).unwrap());

        let remotes = root.element("remote-addresses").unwrap();
        let ports: Vec<i64> = remotes
            .elements("socket-address")
            .map(|sa| sa.i64_of("port", 0).unwrap())
            .collect();
        assert_eq!(ports, vec![9099, 9100]);
    }

    #[test]
    fn typed_accessors_fall_back_to_defaults() {
        let root = XmlElement::parse(SAMPLE).unwrap();
        assert!(!root.bool_of("tcp-delay-enabled", false).unwrap());
        assert_eq!(root.millis_of("linger-timeout", 0).unwrap(), 2_000);
        assert_eq!(root.memory_of("receive-buffer-size", 0).unwrap(), 64 * 1024);
        assert_eq!(root.memory_of("send-buffer-size", 123).unwrap(), 123);
    }

    #[test]
    fn rejects_invalid_values() {
        let root = XmlElement::parse("<a><b>maybe</b></a>").unwrap();
        assert!(root.bool_of("b", false).is_err());
        assert!(root.i64_of("b", 0).is_err());
    }

    #[test]
    fn ensure_element_injects_missing_children() {
        let mut root = XmlElement::parse("<handler><thread-count>4</thread-count></handler>")
            .unwrap();
        assert_eq!(root.ensure_element("thread-count").text(), "4");
        root.ensure_element("request-timeout").set_text("30s");
        assert_eq!(root.millis_of("request-timeout", 0).unwrap(), 30_000);
    }

    #[test]
    fn duration_and_memory_suffixes() {
        assert_eq!(parse_millis("250").unwrap(), 250);
        assert_eq!(parse_millis("2s").unwrap(), 2_000);
        assert_eq!(parse_millis("5m").unwrap(), 300_000);
        assert!(parse_millis("fast").is_err());
        assert_eq!(parse_memory("512").unwrap(), 512);
        assert_eq!(parse_memory("2M").unwrap(), 2 * 1024 * 1024);
    }

    #[test]
    fn macros_substitute_with_defaults() {
        let mut root = XmlElement::parse(
            "<cfg><name>${svc.name Proxy}</name><port>${svc.port}</port></cfg>",
        )
        .unwrap();
        apply_macros(&mut root, &|name| {
            (name == "svc.port").then(|| "9099".to_string())
        });
        // resolved from the property source
        assert_eq!(root.string_of("port", ""), "9099");
        // unresolved, default applies
        assert_eq!(root.string_of("name", ""), "Proxy");
    }

    #[test]
    fn unresolved_macro_without_default_is_left_alone() {
        let mut root = XmlElement::parse("<cfg><v>${missing}</v></cfg>").unwrap();
        apply_macros(&mut root, &|_| None);
        assert_eq!(root.string_of("v", ""), "${missing}");
    }

    #[test]
    fn attributes_are_parsed_and_substituted() {
        let mut root =
            XmlElement::parse(r#"<providers><address-provider id="${ap primary}"/></providers>"#)
                .unwrap();
        apply_macros(&mut root, &|_| None);
        let provider = root.element("address-provider").unwrap();
        assert_eq!(provider.attribute("id"), Some("primary"));
    }
}
