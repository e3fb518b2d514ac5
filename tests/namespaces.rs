//! Namespace processing: scopes, prefix events and the well-formedness
//! rules around qualified names.

use pretty_assertions::assert_eq;
use quick_sax::sax::Attributes;
use quick_sax::{Error, EventSink, Parser, ParserBuilder, QName};

#[derive(Default)]
struct Recorder(Vec<String>);

impl EventSink for Recorder {
    fn start_element(&mut self, name: &QName, attributes: &Attributes) {
        let mut s = format!("<{}|{}|{}", name.uri(), name.local_name(), name.raw_name());
        for a in attributes {
            s.push_str(&format!(
                " {}|{}|{}={}",
                a.name.uri(),
                a.name.local_name(),
                a.name.raw_name(),
                a.value
            ));
        }
        s.push('>');
        self.0.push(s);
    }
    fn end_element(&mut self, name: &QName) {
        self.0
            .push(format!("</{}|{}>", name.uri(), name.raw_name()));
    }
    fn start_prefix_mapping(&mut self, prefix: &str, uri: &str) {
        self.0.push(format!("+{}={}", prefix, uri));
    }
    fn end_prefix_mapping(&mut self, prefix: &str) {
        self.0.push(format!("-{}", prefix));
    }
}

fn events(doc: &[u8]) -> Vec<String> {
    let mut parser = Parser::new(Recorder::default());
    parser.feed(doc).expect("feed");
    parser.finish().expect("finish");
    parser.into_sink().0
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
fn default_namespace_applies_to_elements_not_attributes() {
    assert_eq!(
        events(b"<r xmlns=\"u\" a=\"1\"><c/></r>"),
        [
            "+=u",
            "<u|r|r |xmlns|xmlns=u |a|a=1>",
            "<u|c|c>",
            "</u|c>",
            "</u|r>",
            "-",
        ]
    );
}

#[test]
fn prefixed_names_resolve_through_the_scope_stack() {
    assert_eq!(
        events(b"<p:r xmlns:p=\"u1\"><p:c xmlns:p=\"u2\"><p:d/></p:c><p:e/></p:r>"),
        [
            "+p=u1",
            "<u1|r|p:r |xmlns:p|xmlns:p=u1>",
            "+p=u2",
            "<u2|c|p:c |xmlns:p|xmlns:p=u2>",
            "<u2|d|p:d>",
            "</u2|p:d>",
            "</u2|p:c>",
            "-p",
            "<u1|e|p:e>",
            "</u1|p:e>",
            "</u1|p:r>",
            "-p",
        ]
    );
}

#[test]
fn unbound_prefix_is_fatal() {
    assert!(matches!(
        parse_err(b"<p:r/>"),
        Error::UnboundPrefix(..)
    ));
    assert!(matches!(
        parse_err(b"<r p:a=\"1\"/>"),
        Error::UnboundPrefix(..)
    ));
}

#[test]
fn multi_colon_name_is_fatal() {
    assert!(matches!(parse_err(b"<a:b:c xmlns:a=\"u\"/>"), Error::Syntax(..)));
}

#[test]
fn xmlns_is_not_an_element_name() {
    assert!(matches!(parse_err(b"<xmlns/>"), Error::Syntax(..)));
    assert!(matches!(parse_err(b"<xmlns:a xmlns:a='u'/>"), Error::Syntax(..)));
}

#[test]
fn duplicate_expanded_attribute_is_fatal() {
    let doc = b"<r xmlns:a=\"u\" xmlns:b=\"u\" a:x=\"1\" b:x=\"2\"/>";
    assert!(matches!(parse_err(doc), Error::DuplicateAttribute(..)));
}

#[test]
fn duplicate_raw_attribute_is_fatal() {
    assert!(matches!(
        parse_err(b"<r a=\"1\" a=\"2\"/>"),
        Error::DuplicateAttribute(..)
    ));
}

#[test]
fn xml_prefix_is_always_bound() {
    assert_eq!(
        events(b"<r xml:space=\"preserve\"/>"),
        [
            "<|r|r http://www.w3.org/XML/1998/namespace|space|xml:space=preserve>",
            "</|r>",
        ]
    );
}

#[test]
fn namespace_prefixes_can_be_hidden() {
    #[derive(Default)]
    struct Raw(Vec<String>);
    impl EventSink for Raw {
        fn start_element(&mut self, _name: &QName, attributes: &Attributes) {
            self.0
                .extend(attributes.iter().map(|a| a.name.raw_name().to_string()));
        }
    }
    let mut parser = ParserBuilder::new()
        .namespace_prefixes(false)
        .build(Raw::default());
    parser.feed(b"<r xmlns:p=\"u\" p:a=\"1\"/>").unwrap();
    parser.finish().unwrap();
    assert_eq!(parser.into_sink().0, ["p:a"]);
}

#[test]
fn namespace_processing_can_be_disabled() {
    #[derive(Default)]
    struct Raw(Vec<String>);
    impl EventSink for Raw {
        fn start_element(&mut self, name: &QName, _attributes: &Attributes) {
            self.0.push(format!("{}|{}", name.uri(), name.raw_name()));
        }
    }
    let mut parser = ParserBuilder::new()
        .namespaces(false)
        .build(Raw::default());
    parser.feed(b"<p:r><a:b:c/></p:r>").unwrap();
    parser.finish().unwrap();
    assert_eq!(parser.into_sink().0, ["|p:r", "|a:b:c"]);
}

#[test]
fn end_tag_must_match_prefix_for_prefix() {
    // Both prefixes bind the same namespace, but end tags compare raw.
    let doc = b"<r xmlns:a=\"u\" xmlns:b=\"u\"><a:x></b:x></r>";
    match parse_err(doc) {
        Error::EndEventMismatch {
            expected, found, ..
        } => {
            assert_eq!(expected, "a:x");
            assert_eq!(found, "b:x");
        }
        other => panic!("expected EndEventMismatch, got {}", other),
    }
}

#[test]
fn rebinding_the_xml_prefix_is_fatal() {
    assert!(matches!(
        parse_err(b"<r xmlns:xml=\"other\"/>"),
        Error::Syntax(..)
    ));
    assert!(matches!(
        parse_err(b"<r xmlns:xmlns=\"u\"/>"),
        Error::Syntax(..)
    ));
}
