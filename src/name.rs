//! Qualified names and namespace scope tracking.

use std::collections::HashMap;

use crate::errors::{Error, Position, Result};

/// The namespace the `xml` prefix is always bound to.
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";
/// The namespace reserved for the `xmlns` pseudo-prefix.
pub const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns/";

/// An expanded element or attribute name.
///
/// `uri` is the empty string when the name is in no namespace. Equality and
/// hashing use `(uri, local)` only; the raw name is carried for reporting
/// and end-tag matching.
#[derive(Clone, Debug, Default)]
pub struct QName {
    uri: String,
    local: String,
    raw: String,
}

impl QName {
    /// Builds an expanded name.
    pub fn new(uri: &str, local: &str, raw: &str) -> Self {
        Self {
            uri: uri.to_string(),
            local: local.to_string(),
            raw: raw.to_string(),
        }
    }

    /// A name in no namespace whose local part is the raw name.
    pub fn unqualified(raw: &str) -> Self {
        Self::new("", raw, raw)
    }

    /// The namespace URI; empty for "no namespace".
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The local part of the name.
    pub fn local_name(&self) -> &str {
        &self.local
    }

    /// The name as written, prefix included.
    pub fn raw_name(&self) -> &str {
        &self.raw
    }

    /// The prefix, if the raw name carries one.
    pub fn prefix(&self) -> Option<&str> {
        self.raw.find(':').map(|i| &self.raw[..i])
    }
}

impl PartialEq for QName {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri && self.local == other.local
    }
}

impl Eq for QName {}

impl ::std::hash::Hash for QName {
    fn hash<H: ::std::hash::Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
        self.local.hash(state);
    }
}

/// Splits a raw name into optional prefix and local part, enforcing the
/// QName shape: at most one colon, not at either end.
pub fn split_qname(raw: &str, position: Position) -> Result<(Option<&str>, &str)> {
    match raw.find(':') {
        None => Ok((None, raw)),
        Some(i) => {
            let (prefix, rest) = (&raw[..i], &raw[i + 1..]);
            if prefix.is_empty() || rest.is_empty() || rest.contains(':') {
                Err(Error::Syntax(
                    format!("'{}' is not a valid qualified name", raw),
                    position,
                ))
            } else {
                Ok((Some(prefix), rest))
            }
        }
    }
}

/// One recorded binding change, so popping a frame can restore what the
/// frame shadowed.
struct Undo {
    prefix: String,
    previous: Option<String>,
}

/// A stack of prefix-to-URI frames with a flat active map mirroring the
/// union of the stack for O(1) lookup.
///
/// A frame is pushed when an element opens and popped when it closes. The
/// `xml` and `xmlns` prefixes occupy the root frame and cannot be
/// re-bound. The default namespace is tracked under the empty prefix.
pub struct NamespaceResolver {
    frames: Vec<Vec<Undo>>,
    active: HashMap<String, String>,
}

impl Default for NamespaceResolver {
    fn default() -> Self {
        let mut active = HashMap::new();
        active.insert("xml".to_string(), XML_NAMESPACE.to_string());
        active.insert("xmlns".to_string(), XMLNS_NAMESPACE.to_string());
        Self {
            frames: Vec::new(),
            active,
        }
    }
}

impl NamespaceResolver {
    /// Opens a new scope for an element.
    pub fn push(&mut self) {
        self.frames.push(Vec::new());
    }

    /// Closes the innermost scope, restoring shadowed bindings.
    pub fn pop(&mut self) {
        if let Some(frame) = self.frames.pop() {
            for undo in frame.into_iter().rev() {
                match undo.previous {
                    Some(uri) => self.active.insert(undo.prefix, uri),
                    None => self.active.remove(&undo.prefix),
                };
            }
        }
    }

    /// Binds `prefix` (empty string for the default namespace) to `uri` in
    /// the innermost scope. An empty `uri` removes the binding.
    pub fn declare(&mut self, prefix: &str, uri: &str, position: Position) -> Result<()> {
        if prefix == "xmlns" || (prefix == "xml" && uri != XML_NAMESPACE) {
            return Err(Error::Syntax(
                format!("Namespace prefix '{}' is reserved", prefix),
                position,
            ));
        }
        if !prefix.is_empty() && prefix != "xml" && (uri == XML_NAMESPACE || uri == XMLNS_NAMESPACE)
        {
            return Err(Error::Syntax(
                format!("Namespace '{}' cannot be bound to another prefix", uri),
                position,
            ));
        }
        let previous = if uri.is_empty() {
            self.active.remove(prefix)
        } else {
            self.active.insert(prefix.to_string(), uri.to_string())
        };
        if let Some(frame) = self.frames.last_mut() {
            frame.push(Undo {
                prefix: prefix.to_string(),
                previous,
            });
        }
        Ok(())
    }

    /// Looks up a prefix in the active map. The empty prefix queries the
    /// default namespace.
    pub fn find(&self, prefix: &str) -> Option<&str> {
        self.active.get(prefix).map(|s| s.as_str())
    }

    /// Resolves an element name: the default namespace applies when no
    /// prefix is present.
    pub fn resolve_element(&self, raw: &str, position: Position) -> Result<QName> {
        let (prefix, local) = split_qname(raw, position)?;
        match prefix {
            None => {
                let uri = self.find("").unwrap_or("");
                Ok(QName::new(uri, local, raw))
            }
            Some(prefix) => match self.find(prefix) {
                Some(uri) => Ok(QName::new(uri, local, raw)),
                None => Err(Error::UnboundPrefix(prefix.to_string(), position)),
            },
        }
    }

    /// Resolves an attribute name: unprefixed attributes are in no
    /// namespace regardless of the default namespace.
    pub fn resolve_attribute(&self, raw: &str, position: Position) -> Result<QName> {
        let (prefix, local) = split_qname(raw, position)?;
        match prefix {
            None => Ok(QName::new("", local, raw)),
            Some(prefix) => match self.find(prefix) {
                Some(uri) => Ok(QName::new(uri, local, raw)),
                None => Err(Error::UnboundPrefix(prefix.to_string(), position)),
            },
        }
    }

    /// Returns the resolver to its fresh state, keeping the pre-bound
    /// prefixes.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.active.clear();
        self.active
            .insert("xml".to_string(), XML_NAMESPACE.to_string());
        self.active
            .insert("xmlns".to_string(), XMLNS_NAMESPACE.to_string());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pos() -> Position {
        Position::start()
    }

    #[test]
    fn qname_equality_ignores_prefix() {
        let a = QName::new("u", "n", "p:n");
        let b = QName::new("u", "n", "q:n");
        assert_eq!(a, b);
        assert_ne!(a, QName::new("v", "n", "p:n"));
    }

    #[test]
    fn split_validates_shape() {
        assert_eq!(split_qname("a", pos()).unwrap(), (None, "a"));
        assert_eq!(split_qname("p:a", pos()).unwrap(), (Some("p"), "a"));
        assert!(split_qname(":a", pos()).is_err());
        assert!(split_qname("a:", pos()).is_err());
        assert!(split_qname("a:b:c", pos()).is_err());
    }

    #[test]
    fn scopes_nest_and_restore() {
        let mut ns = NamespaceResolver::default();
        ns.push();
        ns.declare("p", "u1", pos()).unwrap();
        assert_eq!(ns.find("p"), Some("u1"));
        ns.push();
        ns.declare("p", "u2", pos()).unwrap();
        assert_eq!(ns.find("p"), Some("u2"));
        ns.pop();
        assert_eq!(ns.find("p"), Some("u1"));
        ns.pop();
        assert_eq!(ns.find("p"), None);
    }

    #[test]
    fn default_namespace_applies_to_elements_only() {
        let mut ns = NamespaceResolver::default();
        ns.push();
        ns.declare("", "d", pos()).unwrap();
        assert_eq!(ns.resolve_element("e", pos()).unwrap().uri(), "d");
        assert_eq!(ns.resolve_attribute("a", pos()).unwrap().uri(), "");
    }

    #[test]
    fn unbound_prefix_is_fatal() {
        let ns = NamespaceResolver::default();
        assert!(matches!(
            ns.resolve_element("p:a", pos()),
            Err(Error::UnboundPrefix(..))
        ));
    }

    #[test]
    fn xml_prefix_is_prebound() {
        let ns = NamespaceResolver::default();
        let q = ns.resolve_attribute("xml:space", pos()).unwrap();
        assert_eq!(q.uri(), XML_NAMESPACE);
    }

    #[test]
    fn reserved_prefixes_are_protected() {
        let mut ns = NamespaceResolver::default();
        ns.push();
        assert!(ns.declare("xmlns", "u", pos()).is_err());
        assert!(ns.declare("xml", "u", pos()).is_err());
        assert!(ns.declare("xml", XML_NAMESPACE, pos()).is_ok());
        assert!(ns.declare("other", XML_NAMESPACE, pos()).is_err());
    }

    #[test]
    fn undeclaring_restores_outer_binding_on_pop() {
        let mut ns = NamespaceResolver::default();
        ns.push();
        ns.declare("", "outer", pos()).unwrap();
        ns.push();
        ns.declare("", "", pos()).unwrap();
        assert_eq!(ns.find(""), None);
        ns.pop();
        assert_eq!(ns.find(""), Some("outer"));
    }
}
