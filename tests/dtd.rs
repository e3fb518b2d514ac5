//! DTD parsing, validation reports and external subset handling.

use pretty_assertions::assert_eq;
use quick_sax::sax::Attributes;
use quick_sax::{
    Error, EventSink, InputSource, EntityResolver, Parser, ParserBuilder, Position, QName,
};

#[derive(Default)]
struct Recorder {
    events: Vec<String>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl EventSink for Recorder {
    fn start_element(&mut self, name: &QName, attributes: &Attributes) {
        let mut s = format!("<{}", name.raw_name());
        for a in attributes {
            s.push_str(&format!(" {}={}", a.name.raw_name(), a.value));
        }
        s.push('>');
        self.events.push(s);
    }
    fn end_element(&mut self, name: &QName) {
        self.events.push(format!("</{}>", name.raw_name()));
    }
    fn characters(&mut self, text: &str) {
        self.events.push(format!("text({})", text));
    }
    fn ignorable_whitespace(&mut self, text: &str) {
        self.events.push(format!("iws({})", text));
    }
    fn start_entity(&mut self, name: &str) {
        self.events.push(format!("ent+({})", name));
    }
    fn end_entity(&mut self, name: &str) {
        self.events.push(format!("ent-({})", name));
    }
    fn warning(&mut self, message: &str, _position: Position) {
        self.warnings.push(message.to_string());
    }
    fn error(&mut self, message: &str, _position: Position) -> quick_sax::Result<()> {
        self.errors.push(message.to_string());
        Ok(())
    }
}

fn validate(doc: &[u8]) -> Recorder {
    let mut parser = ParserBuilder::new()
        .validation(true)
        .build(Recorder::default());
    parser.feed(doc).expect("feed");
    parser.finish().expect("finish");
    parser.into_sink()
}

fn parse_err(doc: &[u8]) -> Error {
    let mut parser = Parser::new(Recorder::default());
    if let Err(e) = parser.feed(doc) {
        return e;
    }
    match parser.finish() {
        Err(e) => e,
        Ok(()) => panic!("expected a fatal error"),
    }
}

#[test]
fn content_model_accepts_matching_children() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r (a,(b|c)*,d?)>\
                <!ELEMENT a EMPTY><!ELEMENT b EMPTY><!ELEMENT c EMPTY><!ELEMENT d EMPTY>]>\
                <r><a/><b/><c/><b/><d/></r>";
    let r = validate(doc);
    assert_eq!(r.errors, Vec::<String>::new());
}

#[test]
fn content_model_rejects_wrong_order() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r (a,b)><!ELEMENT a EMPTY><!ELEMENT b EMPTY>]>\
                <r><b/><a/></r>";
    let r = validate(doc);
    assert_eq!(
        r.errors,
        ["The content of element 'r' does not match its declaration"]
    );
}

#[test]
fn empty_element_with_text_is_invalid() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r EMPTY>]><r>boom</r>";
    let r = validate(doc);
    assert_eq!(r.errors, ["Element 'r' is declared EMPTY"]);
}

#[test]
fn whitespace_in_element_content_is_ignorable() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r (a)><!ELEMENT a EMPTY>]>\
                <r>\n  <a/>\n</r>";
    let r = validate(doc);
    assert_eq!(r.errors, Vec::<String>::new());
    assert_eq!(
        r.events,
        ["<r>", "iws(\n  )", "<a>", "</a>", "iws(\n)", "</r>"]
    );
}

#[test]
fn text_in_element_content_is_invalid() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r (a)><!ELEMENT a EMPTY>]><r>x<a/></r>";
    let r = validate(doc);
    assert_eq!(
        r.errors,
        ["The content of element 'r' does not match its declaration"]
    );
}

#[test]
fn mixed_content_restricts_children() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r (#PCDATA|a)*><!ELEMENT a EMPTY><!ELEMENT b EMPTY>]>\
                <r>t<a/>t<b/></r>";
    let r = validate(doc);
    assert_eq!(
        r.errors,
        ["Element 'b' is not allowed in the mixed content of 'r'"]
    );
}

#[test]
fn duplicate_name_in_choice_is_fatal() {
    let e = parse_err(b"<!DOCTYPE r [<!ELEMENT r (a|a)>]><r/>");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn mixing_separators_is_fatal() {
    let e = parse_err(b"<!DOCTYPE r [<!ELEMENT r (a,b|c)>]><r/>");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn trailing_separator_is_fatal() {
    let e = parse_err(b"<!DOCTYPE r [<!ELEMENT r (a,b,)>]><r/>");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn empty_group_is_fatal() {
    let e = parse_err(b"<!DOCTYPE r [<!ELEMENT r ()>]><r/>");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn occurrence_after_whitespace_is_fatal() {
    let e = parse_err(b"<!DOCTYPE r [<!ELEMENT r (a *)>]><r/>");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn doubled_occurrence_is_fatal() {
    let e = parse_err(b"<!DOCTYPE r [<!ELEMENT r (a**)>]><r/>");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn mixed_with_names_requires_star() {
    let e = parse_err(b"<!DOCTYPE r [<!ELEMENT r (#PCDATA|a)>]><r/>");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn pcdata_must_come_first() {
    let e = parse_err(b"<!DOCTYPE r [<!ELEMENT r (a|#PCDATA)*>]><r/>");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn miscased_keywords_are_fatal_with_the_expected_spelling() {
    let e = parse_err(b"<!DOCTYPE r [<!ELEMENT r empty>]><r/>");
    match e {
        Error::KeywordCase { expected, found, .. } => {
            assert_eq!(expected, "EMPTY");
            assert_eq!(found, "empty");
        }
        other => panic!("expected KeywordCase, got {}", other),
    }
    let e = parse_err(b"<!DOCTYPE r [<!ATTLIST r a cdata #IMPLIED>]><r/>");
    assert!(matches!(e, Error::KeywordCase { expected: "CDATA", .. }), "{}", e);
    let e = parse_err(b"<!DOCTYPE r system \"x\"><r/>");
    assert!(matches!(e, Error::KeywordCase { expected: "SYSTEM", .. }), "{}", e);
}

#[test]
fn required_attribute_missing_is_invalid() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r EMPTY><!ATTLIST r a CDATA #REQUIRED>]><r/>";
    let r = validate(doc);
    assert_eq!(r.errors, ["Required attribute 'a' of 'r' is missing"]);
}

#[test]
fn fixed_attribute_mismatch_is_invalid() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r EMPTY><!ATTLIST r a CDATA #FIXED \"v\">]>\
                <r a=\"other\"/>";
    let r = validate(doc);
    assert_eq!(
        r.errors,
        ["Attribute 'a' of 'r' must have the #FIXED value 'v'"]
    );
}

#[test]
fn undeclared_attribute_is_invalid() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r EMPTY>]><r a=\"v\"/>";
    let r = validate(doc);
    assert_eq!(r.errors, ["Attribute 'a' of 'r' is not declared"]);
}

#[test]
fn enumerated_attribute_value_must_be_listed() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r EMPTY><!ATTLIST r a (yes|no) \"yes\">]>\
                <r a=\"maybe\"/>";
    let r = validate(doc);
    assert_eq!(
        r.errors,
        ["Attribute 'a' of 'r': 'maybe' is not among the enumerated values"]
    );
}

#[test]
fn idref_must_resolve_by_end_of_document() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r ANY><!ELEMENT c EMPTY>\
                <!ATTLIST c id ID #IMPLIED ref IDREF #IMPLIED>]>\
                <r><c id=\"a\"/><c ref=\"missing\"/></r>";
    let r = validate(doc);
    assert_eq!(r.errors, ["IDREF 'missing' has no matching ID"]);
}

#[test]
fn second_id_attribute_on_an_element_is_invalid() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r EMPTY>\
                <!ATTLIST r a ID #IMPLIED b ID #IMPLIED>]><r/>";
    let r = validate(doc);
    assert_eq!(r.errors, ["Element 'r' already has an ID attribute"]);
}

#[test]
fn id_with_default_value_is_invalid() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r EMPTY><!ATTLIST r a ID \"x\">]><r/>";
    let r = validate(doc);
    assert_eq!(r.errors, ["ID attribute 'a' must be #IMPLIED or #REQUIRED"]);
}

#[test]
fn duplicate_declarations_warn_and_first_wins() {
    let doc = b"<!DOCTYPE r [<!ENTITY e \"one\"><!ENTITY e \"two\">\
                <!ELEMENT r ANY><!ELEMENT r EMPTY>]><r>&e;</r>";
    let mut parser = Parser::new(Recorder::default());
    parser.feed(doc).unwrap();
    parser.finish().unwrap();
    let r = parser.into_sink();
    assert_eq!(r.warnings.len(), 2);
    assert!(r.events.contains(&"text(one)".to_string()));
}

#[test]
fn parameter_entity_between_declarations() {
    let doc = b"<!DOCTYPE r [\
                <!ENTITY % decls \"<!ELEMENT r EMPTY>\">\
                %decls;\
                ]><r/>";
    let r = validate(doc);
    assert_eq!(r.errors, Vec::<String>::new());
    assert!(r.events.iter().any(|e| e == "ent+(%decls)"));
}

#[test]
fn parameter_entity_inside_internal_declaration_is_fatal() {
    let doc = b"<!DOCTYPE r [\
                <!ENTITY % spec \"EMPTY\">\
                <!ELEMENT r %spec;>\
                ]><r/>";
    let e = parse_err(doc);
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn notation_attribute_default_requires_declared_notation() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r EMPTY>\
                <!ATTLIST r f NOTATION (missing) #IMPLIED>]><r/>";
    let e = parse_err(doc);
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

/// Serves the external subset and external entities from memory.
struct MapResolver(Vec<(&'static str, &'static [u8])>);

impl EntityResolver for MapResolver {
    fn resolve(
        &mut self,
        _name: Option<&str>,
        _public_id: Option<&str>,
        system_id: &str,
        _base: Option<&str>,
    ) -> quick_sax::Result<Option<InputSource>> {
        for (id, bytes) in &self.0 {
            if system_id.ends_with(id) {
                return Ok(Some(InputSource::from_bytes(bytes.to_vec())));
            }
        }
        Ok(None)
    }
}

#[test]
fn external_subset_with_conditional_sections() {
    let subset: &[u8] = b"<![INCLUDE[<!ELEMENT r (a)><!ELEMENT a EMPTY>]]>\
                          <![IGNORE[<!ELEMENT r garbage here>]]>";
    let doc = b"<!DOCTYPE r SYSTEM \"sub.dtd\"><r><a/></r>";
    let mut parser = ParserBuilder::new()
        .validation(true)
        .external_parameter_entities(true)
        .entity_resolver(MapResolver(vec![("sub.dtd", subset)]))
        .build(Recorder::default());
    parser.feed(doc).unwrap();
    parser.finish().unwrap();
    let r = parser.into_sink();
    assert_eq!(r.errors, Vec::<String>::new());
    assert!(r.events.iter().any(|e| e == "ent+([dtd])"));
    assert!(r.events.iter().any(|e| e == "ent-([dtd])"));
}

#[test]
fn conditional_section_in_internal_subset_is_fatal() {
    let e = parse_err(b"<!DOCTYPE r [<![INCLUDE[<!ELEMENT r EMPTY>]]>]><r/>");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn external_general_entity_is_expanded_through_the_resolver() {
    let doc = b"<!DOCTYPE r [<!ENTITY ext SYSTEM \"frag.xml\">]><r>&ext;</r>";
    let mut parser = ParserBuilder::new()
        .external_general_entities(true)
        .entity_resolver(MapResolver(vec![("frag.xml", b"<x>deep</x>" as &[u8])]))
        .build(Recorder::default());
    parser.feed(doc).unwrap();
    parser.finish().unwrap();
    let r = parser.into_sink();
    assert_eq!(
        r.events,
        [
            "<r>",
            "ent+(ext)",
            "<x>",
            "text(deep)",
            "</x>",
            "ent-(ext)",
            "</r>"
        ]
    );
}

#[test]
fn external_entities_are_skipped_by_default() {
    let doc = b"<!DOCTYPE r [<!ENTITY ext SYSTEM \"frag.xml\">]><r>&ext;</r>";
    let mut parser = Parser::new(Recorder::default());
    parser.feed(doc).unwrap();
    parser.finish().unwrap();
    let r = parser.into_sink();
    assert_eq!(r.warnings, ["Skipping external entity '&ext;'"]);
}

#[test]
fn text_declaration_in_external_entity_is_consumed() {
    let doc = b"<!DOCTYPE r [<!ENTITY ext SYSTEM \"frag.xml\">]><r>&ext;</r>";
    let frag: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>inner";
    let mut parser = ParserBuilder::new()
        .external_general_entities(true)
        .entity_resolver(MapResolver(vec![("frag.xml", frag)]))
        .build(Recorder::default());
    parser.feed(doc).unwrap();
    parser.finish().unwrap();
    let r = parser.into_sink();
    assert!(r.events.contains(&"text(inner)".to_string()));
}
