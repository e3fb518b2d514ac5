//! The host-facing interfaces: the event sink the parser drives and the
//! entity-resolution hook it consults for external entities.

use std::io::Read;

use crate::errors::{Position, Result};
use crate::name::QName;

/// One attribute of a start tag, fully assembled: expanded name,
/// normalized value, declared type and whether it came from the document
/// or from an ATTLIST default.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    /// The expanded attribute name.
    pub name: QName,
    /// The normalized value.
    pub value: String,
    /// The declared type name (`CDATA` when undeclared).
    pub att_type: &'static str,
    /// False when the value was supplied by an ATTLIST default.
    pub specified: bool,
}

/// A read-only, indexed view of the attributes of one start tag.
///
/// The view is only valid for the duration of the
/// [`start_element`](EventSink::start_element) call; the parser reuses the
/// backing storage for the next element.
#[derive(Debug, Default)]
pub struct Attributes {
    items: Vec<Attribute>,
}

impl Attributes {
    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    pub(crate) fn push(&mut self, attribute: Attribute) {
        self.items.push(attribute);
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the tag carried no attributes.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The attribute at `index`, in document order.
    pub fn get(&self, index: usize) -> Option<&Attribute> {
        self.items.get(index)
    }

    /// Looks an attribute up by its raw (prefixed) name.
    pub fn get_raw(&self, raw: &str) -> Option<&Attribute> {
        self.items.iter().find(|a| a.name.raw_name() == raw)
    }

    /// Looks an attribute up by namespace URI and local name.
    pub fn get_ns(&self, uri: &str, local: &str) -> Option<&Attribute> {
        self.items
            .iter()
            .find(|a| a.name.uri() == uri && a.name.local_name() == local)
    }

    /// Iterates the attributes in document order.
    pub fn iter(&self) -> ::std::slice::Iter<Attribute> {
        self.items.iter()
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = &'a Attribute;
    type IntoIter = ::std::slice::Iter<'a, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// The event sink a parse drives.
///
/// Every operation has an empty default body, so a sink implements only
/// what it cares about. Events arrive in document order; element events
/// are strictly nested; attribute views and text slices are only valid
/// during the call.
///
/// [`error`](Self::error) reports a validity problem and may return `Err`
/// to abort the parse; the parser itself continues after validity errors.
/// [`fatal_error`](Self::fatal_error) is informational: the parser raises
/// the corresponding [`Error`](crate::errors::Error) and refuses further
/// input no matter what the sink does.
#[allow(unused_variables)]
pub trait EventSink {
    /// The first event of every parse.
    fn start_document(&mut self) {}
    /// The last event of every successful parse.
    fn end_document(&mut self) {}
    /// An element start tag (or the start half of an empty-element tag).
    fn start_element(&mut self, name: &QName, attributes: &Attributes) {}
    /// An element end tag, strictly LIFO with `start_element`.
    fn end_element(&mut self, name: &QName) {}
    /// Character data. Consecutive data is coalesced: at most one
    /// `characters` call between other events.
    fn characters(&mut self, text: &str) {}
    /// Whitespace inside an element declared with element content.
    fn ignorable_whitespace(&mut self, text: &str) {}
    /// A processing instruction.
    fn processing_instruction(&mut self, target: &str, data: &str) {}
    /// A comment.
    fn comment(&mut self, text: &str) {}
    /// Start of a CDATA section; its text arrives through `characters`.
    fn start_cdata_section(&mut self) {}
    /// End of a CDATA section.
    fn end_cdata_section(&mut self) {}
    /// A namespace binding coming into scope; delivered before the
    /// `start_element` that introduced it.
    fn start_prefix_mapping(&mut self, prefix: &str, uri: &str) {}
    /// A namespace binding going out of scope; delivered after the
    /// matching `end_element`.
    fn end_prefix_mapping(&mut self, prefix: &str) {}
    /// Entry into an entity expansion. Parameter entities are reported
    /// with a `%` prefix, the external subset as `[dtd]`.
    fn start_entity(&mut self, name: &str) {}
    /// Exit from an entity expansion.
    fn end_entity(&mut self, name: &str) {}
    /// A NOTATION declaration from the DTD.
    fn notation_declaration(
        &mut self,
        name: &str,
        public_id: Option<&str>,
        system_id: Option<&str>,
    ) {
    }
    /// An unparsed (NDATA) entity declaration from the DTD.
    fn unparsed_entity_declaration(
        &mut self,
        name: &str,
        public_id: Option<&str>,
        system_id: Option<&str>,
        notation: &str,
    ) {
    }
    /// An advisory condition (encoding fallback, ignored duplicate
    /// declaration, skipped external entity).
    fn warning(&mut self, message: &str, position: Position) {}
    /// A validity error. Return `Err` to abort the parse.
    fn error(&mut self, message: &str, position: Position) -> Result<()> {
        Ok(())
    }
    /// A well-formedness violation; the parse terminates after this call.
    fn fatal_error(&mut self, message: &str, position: Position) {}
}

/// A sink that discards everything; useful for well-formedness checking.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {}

/// Where the bytes of an external entity come from.
pub enum InputData {
    /// The whole entity, already in memory.
    Bytes(Vec<u8>),
    /// A byte stream the parser drains.
    Reader(Box<dyn Read>),
}

/// An external entity handed back by an [`EntityResolver`].
pub struct InputSource {
    /// The public identifier, if known.
    pub public_id: Option<String>,
    /// The (preferably absolute) system identifier.
    pub system_id: Option<String>,
    /// A charset hint that overrides the parser-level hint.
    pub encoding: Option<String>,
    /// The bytes.
    pub data: InputData,
}

impl InputSource {
    /// An input source over in-memory bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            public_id: None,
            system_id: None,
            encoding: None,
            data: InputData::Bytes(bytes),
        }
    }

    /// An input source draining a reader.
    pub fn from_reader<R: Read + 'static>(reader: R) -> Self {
        Self {
            public_id: None,
            system_id: None,
            encoding: None,
            data: InputData::Reader(Box::new(reader)),
        }
    }
}

/// Resolves references to external entities.
///
/// Returning `Ok(None)` requests default resolution; since the parser
/// performs no I/O of its own, the default is to skip the entity with a
/// warning.
pub trait EntityResolver {
    /// Resolve an external entity.
    ///
    /// `name` is the entity name (`None` for the external DTD subset),
    /// `base` the base URI the system identifier was resolved against.
    fn resolve(
        &mut self,
        name: Option<&str>,
        public_id: Option<&str>,
        system_id: &str,
        base: Option<&str>,
    ) -> Result<Option<InputSource>>;
}

/// Composes a possibly relative URI reference against a base URI,
/// following the merge rules of RFC 3986 §5. Covers the forms system
/// identifiers take; opaque corner cases fall back to the reference
/// itself.
pub fn resolve_uri(base: Option<&str>, reference: &str) -> String {
    let base = match base {
        Some(b) => b,
        None => return reference.to_string(),
    };
    // Absolute reference: has a scheme.
    if reference
        .split(|c: char| c == '/' || c == '?' || c == '#')
        .next()
        .map(|head| head.contains(':'))
        .unwrap_or(false)
    {
        return reference.to_string();
    }
    if reference.is_empty() {
        return base.to_string();
    }
    // Authority-relative: //host/path
    if let Some(rest) = reference.strip_prefix("//") {
        let scheme_end = base.find(':').map(|i| i + 1).unwrap_or(0);
        return format!("{}//{}", &base[..scheme_end], rest);
    }
    let (base_no_frag, _) = split_once(base, '#');
    let (base_no_query, _) = split_once(base_no_frag, '?');
    if reference.starts_with('?') || reference.starts_with('#') {
        return format!("{}{}", base_no_query, reference);
    }
    // Path reference: replace from the last segment.
    let dir_end = base_no_query.rfind('/').map(|i| i + 1).unwrap_or(0);
    let mut merged = base_no_query[..dir_end].to_string();
    if reference.starts_with('/') {
        // Keep scheme and authority only.
        let scheme_end = base.find("//").map(|i| i + 2).unwrap_or(0);
        let authority_end = base[scheme_end..]
            .find('/')
            .map(|i| scheme_end + i)
            .unwrap_or_else(|| base_no_query.len());
        merged = base[..authority_end].to_string();
    }
    merged.push_str(reference);
    remove_dot_segments(&merged)
}

fn split_once(s: &str, delim: char) -> (&str, Option<&str>) {
    match s.find(delim) {
        Some(i) => (&s[..i], Some(&s[i + 1..])),
        None => (s, None),
    }
}

fn remove_dot_segments(path: &str) -> String {
    let (head, tail) = match path.find("//") {
        // Leave scheme://authority untouched.
        Some(i) => {
            let after = &path[i + 2..];
            match after.find('/') {
                Some(j) => (&path[..i + 2 + j], &path[i + 2 + j..]),
                None => (path, ""),
            }
        }
        None => ("", path),
    };
    let mut segments: Vec<&str> = Vec::new();
    for segment in tail.split('/') {
        match segment {
            "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("{}{}", head, segments.join("/"))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn attribute_lookup() {
        let mut attrs = Attributes::default();
        attrs.push(Attribute {
            name: QName::new("u", "a", "p:a"),
            value: "1".to_string(),
            att_type: "CDATA",
            specified: true,
        });
        attrs.push(Attribute {
            name: QName::new("", "b", "b"),
            value: "2".to_string(),
            att_type: "ID",
            specified: false,
        });
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs.get_raw("p:a").unwrap().value, "1");
        assert_eq!(attrs.get_ns("u", "a").unwrap().value, "1");
        assert_eq!(attrs.get_ns("", "b").unwrap().att_type, "ID");
        assert!(attrs.get_raw("a").is_none());
    }

    #[test]
    fn uri_resolution() {
        assert_eq!(
            resolve_uri(Some("http://x/a/b.dtd"), "c.ent"),
            "http://x/a/c.ent"
        );
        assert_eq!(
            resolve_uri(Some("http://x/a/b.dtd"), "../c.ent"),
            "http://x/c.ent"
        );
        assert_eq!(
            resolve_uri(Some("http://x/a/b.dtd"), "http://y/d"),
            "http://y/d"
        );
        assert_eq!(resolve_uri(Some("http://x/a/b.dtd"), "/d"), "http://x/d");
        assert_eq!(resolve_uri(None, "c.ent"), "c.ent");
        assert_eq!(
            resolve_uri(Some("dir/file.dtd"), "other.ent"),
            "dir/other.ent"
        );
    }
}
