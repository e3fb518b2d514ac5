//! Document type declarations: the data the DTD parser collects and the
//! content parser and validators consume.

use std::collections::HashMap;

/// An external identifier: optional public identifier plus optional system
/// identifier.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalId {
    /// The public identifier, if declared.
    pub public_id: Option<String>,
    /// The system identifier, if declared.
    pub system_id: Option<String>,
}

/// One piece of an internal entity's replacement text.
///
/// Character references are resolved at declaration time but kept distinct
/// so attribute-value normalization can tell reference-derived whitespace
/// from literal whitespace. Entity references are bypassed: stored
/// unresolved and looked up at expansion time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValuePiece {
    /// Literal text.
    Text(String),
    /// A character resolved from a character reference.
    CharRef(char),
    /// An unresolved general entity reference.
    GeneralRef(String),
    /// An unresolved parameter entity reference.
    ParamRef(String),
}

/// How an entity is defined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntityDef {
    /// Internal entity with its replacement text as a piece sequence.
    Internal(Vec<ValuePiece>),
    /// External parsed entity.
    External(ExternalId),
    /// External unparsed entity with its notation name.
    Unparsed(ExternalId, String),
}

/// A general or parameter entity declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityDecl {
    /// The entity name, without `&`/`%` and `;`.
    pub name: String,
    /// True for parameter entities.
    pub parameter: bool,
    /// The definition.
    pub def: EntityDef,
    /// Base URI of the entity the declaration appeared in, for resolving
    /// a relative system identifier later.
    pub base_uri: Option<String>,
}

impl EntityDecl {
    /// True when the replacement text is plain text that cannot contain
    /// markup once re-parsed, so expansion can skip the nested tokenizer.
    pub fn is_simple_text(&self) -> bool {
        match &self.def {
            EntityDef::Internal(pieces) => pieces.iter().all(|p| match p {
                ValuePiece::Text(t) => !t.contains('<') && !t.contains('&'),
                ValuePiece::CharRef(c) => *c != '<' && *c != '&',
                _ => false,
            }),
            _ => false,
        }
    }
}

/// Repetition attached to a content-model node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Occurrence {
    /// Exactly once
    Once,
    /// `?`
    Optional,
    /// `*`
    ZeroOrMore,
    /// `+`
    OneOrMore,
}

/// A node of an element-content model tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentNode {
    /// What the node matches.
    pub kind: ContentNodeKind,
    /// How often it may repeat.
    pub occurrence: Occurrence,
    /// Children of a sequence or choice group.
    pub children: Vec<ContentNode>,
}

/// The kind of a content-model node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentNodeKind {
    /// A named child element.
    Element(String),
    /// An ordered group `(a, b, c)`.
    Sequence,
    /// An alternative group `(a | b | c)`.
    Choice,
}

/// The content specification of an element declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentSpec {
    /// `EMPTY`
    Empty,
    /// `ANY`
    Any,
    /// `(#PCDATA | a | b)*` with the permitted child names.
    Mixed(Vec<String>),
    /// Element content with its model tree.
    Children(ContentNode),
}

/// An `<!ELEMENT>` declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementDecl {
    /// The element name.
    pub name: String,
    /// The declared content.
    pub content: ContentSpec,
}

/// A declared attribute type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttType {
    Cdata,
    Id,
    Idref,
    Idrefs,
    Entity,
    Entities,
    Nmtoken,
    Nmtokens,
    /// `NOTATION (n1 | n2)`
    Notation(Vec<String>),
    /// `(v1 | v2)`
    Enumeration(Vec<String>),
}

impl AttType {
    /// The type name as reported through the attributes view; enumerations
    /// report `NMTOKEN` as SAX requires.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cdata => "CDATA",
            Self::Id => "ID",
            Self::Idref => "IDREF",
            Self::Idrefs => "IDREFS",
            Self::Entity => "ENTITY",
            Self::Entities => "ENTITIES",
            Self::Nmtoken => "NMTOKEN",
            Self::Nmtokens => "NMTOKENS",
            Self::Notation(_) => "NOTATION",
            Self::Enumeration(_) => "NMTOKEN",
        }
    }

    /// True when attribute-value normalization must collapse whitespace.
    pub fn is_tokenized(&self) -> bool {
        !matches!(self, Self::Cdata)
    }
}

/// The default declaration of an attribute definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DefaultDecl {
    /// `#REQUIRED`
    Required,
    /// `#IMPLIED`
    Implied,
    /// `#FIXED "value"`
    Fixed(Vec<ValuePiece>),
    /// A plain default value.
    Default(Vec<ValuePiece>),
}

/// One attribute definition from an `<!ATTLIST>` declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttDef {
    /// The attribute name.
    pub name: String,
    /// The declared type.
    pub att_type: AttType,
    /// The default declaration.
    pub default: DefaultDecl,
}

/// A `<!NOTATION>` declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotationDecl {
    /// The notation name.
    pub name: String,
    /// Its external or public identifier.
    pub id: ExternalId,
}

/// Everything collected from the document type declaration.
///
/// The first declaration of a name wins; callers surface a warning for
/// every ignored duplicate.
#[derive(Default)]
pub struct Dtd {
    /// The document type name from the DOCTYPE head.
    pub name: Option<String>,
    /// The external subset identifier, if any.
    pub external_id: Option<ExternalId>,
    general: HashMap<String, EntityDecl>,
    parameter: HashMap<String, EntityDecl>,
    elements: HashMap<String, ElementDecl>,
    attlists: HashMap<String, Vec<AttDef>>,
    notations: HashMap<String, NotationDecl>,
}

impl Dtd {
    /// Adds an entity declaration. Returns false when the name was already
    /// declared (the new declaration is ignored).
    pub fn add_entity(&mut self, decl: EntityDecl) -> bool {
        let map = if decl.parameter {
            &mut self.parameter
        } else {
            &mut self.general
        };
        if map.contains_key(&decl.name) {
            false
        } else {
            map.insert(decl.name.clone(), decl);
            true
        }
    }

    /// Looks up a general entity.
    pub fn general_entity(&self, name: &str) -> Option<&EntityDecl> {
        self.general.get(name)
    }

    /// Looks up a parameter entity.
    pub fn parameter_entity(&self, name: &str) -> Option<&EntityDecl> {
        self.parameter.get(name)
    }

    /// Adds an element declaration; false on duplicate.
    pub fn add_element(&mut self, decl: ElementDecl) -> bool {
        if self.elements.contains_key(&decl.name) {
            false
        } else {
            self.elements.insert(decl.name.clone(), decl);
            true
        }
    }

    /// Looks up an element declaration.
    pub fn element(&self, name: &str) -> Option<&ElementDecl> {
        self.elements.get(name)
    }

    /// Merges attribute definitions for an element. Definitions for an
    /// attribute name that is already defined are ignored (false is
    /// returned for the caller to warn).
    pub fn add_att_def(&mut self, element: &str, def: AttDef) -> bool {
        let defs = self
            .attlists
            .entry(element.to_string())
            .or_insert_with(Vec::new);
        if defs.iter().any(|d| d.name == def.name) {
            false
        } else {
            defs.push(def);
            true
        }
    }

    /// The attribute definitions declared for an element.
    pub fn att_defs(&self, element: &str) -> Option<&[AttDef]> {
        self.attlists.get(element).map(|v| v.as_slice())
    }

    /// Looks up a single attribute definition.
    pub fn att_def(&self, element: &str, attribute: &str) -> Option<&AttDef> {
        self.attlists
            .get(element)
            .and_then(|defs| defs.iter().find(|d| d.name == attribute))
    }

    /// True when the element already defines an ID-typed attribute.
    pub fn has_id_attribute(&self, element: &str) -> bool {
        self.attlists
            .get(element)
            .map(|defs| defs.iter().any(|d| d.att_type == AttType::Id))
            .unwrap_or(false)
    }

    /// Adds a notation declaration; false on duplicate.
    pub fn add_notation(&mut self, decl: NotationDecl) -> bool {
        if self.notations.contains_key(&decl.name) {
            false
        } else {
            self.notations.insert(decl.name.clone(), decl);
            true
        }
    }

    /// Looks up a notation declaration.
    pub fn notation(&self, name: &str) -> Option<&NotationDecl> {
        self.notations.get(name)
    }

    /// True when any doctype was seen.
    pub fn present(&self) -> bool {
        self.name.is_some()
    }

    /// Clears all declarations, keeping allocations where possible.
    pub fn reset(&mut self) {
        self.name = None;
        self.external_id = None;
        self.general.clear();
        self.parameter.clear();
        self.elements.clear();
        self.attlists.clear();
        self.notations.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entity(name: &str, text: &str) -> EntityDecl {
        EntityDecl {
            name: name.to_string(),
            parameter: false,
            def: EntityDef::Internal(vec![ValuePiece::Text(text.to_string())]),
            base_uri: None,
        }
    }

    #[test]
    fn first_declaration_wins() {
        let mut dtd = Dtd::default();
        assert!(dtd.add_entity(entity("e", "one")));
        assert!(!dtd.add_entity(entity("e", "two")));
        match &dtd.general_entity("e").unwrap().def {
            EntityDef::Internal(pieces) => {
                assert_eq!(pieces, &[ValuePiece::Text("one".to_string())])
            }
            other => panic!("unexpected definition {:?}", other),
        }
    }

    #[test]
    fn parameter_and_general_namespaces_are_separate() {
        let mut dtd = Dtd::default();
        assert!(dtd.add_entity(entity("e", "general")));
        let mut p = entity("e", "parameter");
        p.parameter = true;
        assert!(dtd.add_entity(p));
        assert!(dtd.general_entity("e").is_some());
        assert!(dtd.parameter_entity("e").is_some());
    }

    #[test]
    fn simple_text_detection() {
        assert!(entity("e", "plain text").is_simple_text());
        assert!(!entity("e", "a < b").is_simple_text());
        assert!(!entity("e", "a&#38;b").is_simple_text());
        let with_ref = EntityDecl {
            name: "e".to_string(),
            parameter: false,
            def: EntityDef::Internal(vec![ValuePiece::GeneralRef("other".to_string())]),
            base_uri: None,
        };
        assert!(!with_ref.is_simple_text());
    }

    #[test]
    fn duplicate_att_defs_are_ignored() {
        let mut dtd = Dtd::default();
        let def = AttDef {
            name: "a".to_string(),
            att_type: AttType::Cdata,
            default: DefaultDecl::Implied,
        };
        assert!(dtd.add_att_def("e", def.clone()));
        assert!(!dtd.add_att_def("e", def));
        assert_eq!(dtd.att_defs("e").unwrap().len(), 1);
    }
}
