//! End-to-end event sequences over complete documents.

use pretty_assertions::assert_eq;
use quick_sax::sax::Attributes;
use quick_sax::{Error, EventSink, Parser, ParserBuilder, Position, QName};

/// Records every event as a compact string.
#[derive(Default)]
struct Recorder {
    events: Vec<String>,
    errors: Vec<String>,
    warnings: Vec<String>,
    fatals: Vec<String>,
}

impl Recorder {
    fn element(name: &QName, attributes: Option<&Attributes>) -> String {
        let mut s = format!("{}|{}|{}", name.uri(), name.local_name(), name.raw_name());
        if let Some(attributes) = attributes {
            for a in attributes {
                s.push_str(&format!(" {}={}", a.name.raw_name(), a.value));
            }
        }
        s
    }
}

impl EventSink for Recorder {
    fn start_document(&mut self) {
        self.events.push("startdoc".to_string());
    }
    fn end_document(&mut self) {
        self.events.push("enddoc".to_string());
    }
    fn start_element(&mut self, name: &QName, attributes: &Attributes) {
        self.events
            .push(format!("<{}>", Recorder::element(name, Some(attributes))));
    }
    fn end_element(&mut self, name: &QName) {
        self.events
            .push(format!("</{}>", Recorder::element(name, None)));
    }
    fn characters(&mut self, text: &str) {
        self.events.push(format!("text({})", text));
    }
    fn ignorable_whitespace(&mut self, text: &str) {
        self.events.push(format!("iws({})", text));
    }
    fn processing_instruction(&mut self, target: &str, data: &str) {
        self.events.push(format!("pi({},{})", target, data));
    }
    fn comment(&mut self, text: &str) {
        self.events.push(format!("comment({})", text));
    }
    fn start_cdata_section(&mut self) {
        self.events.push("cdata+".to_string());
    }
    fn end_cdata_section(&mut self) {
        self.events.push("cdata-".to_string());
    }
    fn start_prefix_mapping(&mut self, prefix: &str, uri: &str) {
        self.events.push(format!("xmlns+({}={})", prefix, uri));
    }
    fn end_prefix_mapping(&mut self, prefix: &str) {
        self.events.push(format!("xmlns-({})", prefix));
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
    fn fatal_error(&mut self, message: &str, _position: Position) {
        self.fatals.push(message.to_string());
    }
}

fn parse(doc: &[u8]) -> Recorder {
    let mut parser = Parser::new(Recorder::default());
    parser.feed(doc).expect("feed");
    parser.finish().expect("finish");
    parser.into_sink()
}

fn parse_validating(doc: &[u8]) -> Recorder {
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
fn simple_document_with_attribute() {
    let r = parse(b"<?xml version=\"1.0\"?><r a=\"x\">hi</r>");
    assert_eq!(
        r.events,
        [
            "startdoc",
            "<|r|r a=x>",
            "text(hi)",
            "</|r|r>",
            "enddoc"
        ]
    );
}

#[test]
fn namespace_scopes_and_prefix_events() {
    let r = parse(b"<?xml version=\"1.0\"?><r xmlns:p=\"u\"><p:a/></r>");
    assert_eq!(
        r.events,
        [
            "startdoc",
            "xmlns+(p=u)",
            "<|r|r xmlns:p=u>",
            "<u|a|p:a>",
            "</u|a|p:a>",
            "</|r|r>",
            "xmlns-(p)",
            "enddoc"
        ]
    );
}

#[test]
fn duplicate_id_is_a_validity_error_and_parsing_continues() {
    let doc = b"<!DOCTYPE r [<!ELEMENT r ANY><!ELEMENT c (#PCDATA)>\
                <!ATTLIST c id ID #REQUIRED>]>\
                <r><c id=\"x\"/><c id=\"x\"/></r>";
    let r = parse_validating(doc);
    assert_eq!(r.errors, ["ID 'x' already declared"]);
    // Both elements were still delivered.
    let starts = r.events.iter().filter(|e| e.starts_with("<|c")).count();
    assert_eq!(starts, 2);
    assert_eq!(r.events.last().map(|s| s.as_str()), Some("enddoc"));
}

#[test]
fn recursive_entity_is_fatal() {
    let e = parse_err(b"<!DOCTYPE r [<!ENTITY e \"&e;\">]><r>&e;</r>");
    match &e {
        Error::RecursiveEntity(name, _) => assert_eq!(name, "e"),
        other => panic!("expected RecursiveEntity, got {}", other),
    }
    assert!(e
        .to_string()
        .starts_with("Circular entity reference detected: &e;"));
}

#[test]
fn utf8_bom_is_consumed_silently() {
    let r = parse(&[0xEF, 0xBB, 0xBF, 0x3C, 0x72, 0x2F, 0x3E]);
    assert_eq!(r.events, ["startdoc", "<|r|r>", "</|r|r>", "enddoc"]);
    assert!(r.warnings.is_empty());
}

#[test]
fn char_ref_ampersand_is_not_reinterpreted() {
    let r = parse(b"<?xml version=\"1.0\"?><r>&#x26;</r>");
    assert_eq!(
        r.events,
        ["startdoc", "<|r|r>", "text(&)", "</|r|r>", "enddoc"]
    );
}

#[test]
fn self_closing_equals_empty_pair() {
    let a = parse(b"<foo/>").events;
    let b = parse(b"<foo></foo>").events;
    assert_eq!(a, b);
}

#[test]
fn empty_document_is_fatal() {
    let e = parse_err(b"");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
    let e = parse_err(b"   \n  ");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn fatal_error_reaches_the_sink_and_sticks() {
    let mut parser = Parser::new(Recorder::default());
    let err = parser.feed(b"<r></mismatch>");
    assert!(matches!(err, Err(Error::EndEventMismatch { .. })));
    assert_eq!(parser.sink_ref().fatals.len(), 1);
    // Subsequent input is refused with the same condition.
    assert!(matches!(parser.feed(b"<more/>"), Err(Error::Aborted(_))));
    assert!(matches!(parser.finish(), Err(Error::Aborted(_))));
}

#[test]
fn predefined_entities_in_content_and_attributes() {
    let r = parse(b"<r a='&lt;&amp;&quot;'>&gt;&apos;</r>");
    assert_eq!(
        r.events,
        [
            "startdoc",
            "<|r|r a=<&\">",
            "text(>')",
            "</|r|r>",
            "enddoc"
        ]
    );
}

#[test]
fn internal_entity_with_markup_is_retokenized() {
    let doc = b"<!DOCTYPE r [<!ENTITY e \"<b>x</b>\">]><r>&e;</r>";
    let r = parse(doc);
    assert_eq!(
        r.events,
        [
            "startdoc",
            "<|r|r>",
            "ent+(e)",
            "<|b|b>",
            "text(x)",
            "</|b|b>",
            "ent-(e)",
            "</|r|r>",
            "enddoc"
        ]
    );
}

#[test]
fn entity_boundaries_are_reported_around_simple_text() {
    let doc = b"<!DOCTYPE r [<!ENTITY e \"v\">]><r>a&e;b</r>";
    let r = parse(doc);
    assert_eq!(
        r.events,
        [
            "startdoc",
            "<|r|r>",
            "text(a)",
            "ent+(e)",
            "text(v)",
            "ent-(e)",
            "text(b)",
            "</|r|r>",
            "enddoc"
        ]
    );
}

#[test]
fn element_crossing_entity_boundary_is_fatal() {
    let doc = b"<!DOCTYPE r [<!ENTITY e \"<b>\">]><r>&e;</b></r>";
    let e = parse_err(doc);
    assert!(matches!(e, Error::EntityBoundary(..)), "{}", e);
}

#[test]
fn cdata_sections_bracket_their_characters() {
    let r = parse(b"<r>a<![CDATA[<&>]]>b</r>");
    assert_eq!(
        r.events,
        [
            "startdoc",
            "<|r|r>",
            "text(a)",
            "cdata+",
            "text(<&>)",
            "cdata-",
            "text(b)",
            "</|r|r>",
            "enddoc"
        ]
    );
}

#[test]
fn comments_and_processing_instructions() {
    let r = parse(b"<?go fast?><!-- note --><r/><!--after-->");
    assert_eq!(
        r.events,
        [
            "startdoc",
            "pi(go,fast)",
            "comment( note )",
            "<|r|r>",
            "</|r|r>",
            "comment(after)",
            "enddoc"
        ]
    );
}

#[test]
fn reset_reproduces_a_fresh_parse() {
    let doc: &[u8] = b"<?xml version=\"1.0\"?><r a=\"1\">t</r>";
    let mut parser = Parser::new(Recorder::default());
    parser.feed(doc).unwrap();
    parser.finish().unwrap();
    let first = parser.sink_ref().events.clone();

    parser.reset();
    parser.sink_mut().events.clear();
    parser.feed(doc).unwrap();
    parser.finish().unwrap();
    assert_eq!(parser.sink_ref().events, first);
}

#[test]
fn content_after_root_is_fatal() {
    let e = parse_err(b"<r/>trailing");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
    let e = parse_err(b"<r/><r/>");
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn whitespace_and_misc_after_root_are_fine() {
    let r = parse(b"<r/> \n <!--ok--> <?pi ?> ");
    assert_eq!(r.events.last().map(|s| s.as_str()), Some("enddoc"));
}

#[test]
fn undeclared_entity_is_fatal() {
    let e = parse_err(b"<r>&nope;</r>");
    assert!(matches!(e, Error::UndeclaredEntity(..)), "{}", e);
}

#[test]
fn unparsed_entity_in_content_is_fatal() {
    let doc = b"<!DOCTYPE r [<!NOTATION gif SYSTEM \"gif\">\
                <!ENTITY pic SYSTEM \"p.gif\" NDATA gif>]>\
                <r>&pic;</r>";
    let e = parse_err(doc);
    assert!(matches!(e, Error::Syntax(..)), "{}", e);
}

#[test]
fn doctype_reports_notations_and_unparsed_entities() {
    let doc = b"<!DOCTYPE r [<!NOTATION gif PUBLIC \"gif-id\">\
                <!ENTITY pic SYSTEM \"p.gif\" NDATA gif>]><r/>";
    let mut parser = Parser::new(Recorder::default());
    #[derive(Default)]
    struct Decls {
        notations: Vec<String>,
        unparsed: Vec<String>,
    }
    // Recorder does not capture declaration events; use a dedicated sink.
    impl EventSink for Decls {
        fn notation_declaration(
            &mut self,
            name: &str,
            public_id: Option<&str>,
            system_id: Option<&str>,
        ) {
            self.notations
                .push(format!("{}:{:?}:{:?}", name, public_id, system_id));
        }
        fn unparsed_entity_declaration(
            &mut self,
            name: &str,
            _public_id: Option<&str>,
            system_id: Option<&str>,
            notation: &str,
        ) {
            self.unparsed
                .push(format!("{}:{:?}:{}", name, system_id, notation));
        }
    }
    let mut decls = Parser::new(Decls::default());
    decls.feed(doc).unwrap();
    decls.finish().unwrap();
    let sink = decls.into_sink();
    assert_eq!(sink.notations, ["gif:Some(\"gif-id\"):None"]);
    assert_eq!(sink.unparsed, ["pic:Some(\"p.gif\"):gif"]);
    // And the generic parse also succeeds.
    parser.feed(doc).unwrap();
    parser.finish().unwrap();
}

#[test]
fn attribute_defaulting_and_specified_flag() {
    #[derive(Default)]
    struct Defaults(Vec<(String, String, bool, String)>);
    impl EventSink for Defaults {
        fn start_element(&mut self, _name: &QName, attributes: &Attributes) {
            for a in attributes {
                self.0.push((
                    a.name.raw_name().to_string(),
                    a.value.clone(),
                    a.specified,
                    a.att_type.to_string(),
                ));
            }
        }
    }
    let doc = b"<!DOCTYPE r [<!ATTLIST r a CDATA \"fallback\" b NMTOKEN #IMPLIED>]>\
                <r b=\" tok \"/>";
    let mut parser = Parser::new(Defaults::default());
    parser.feed(doc).unwrap();
    parser.finish().unwrap();
    let attrs = parser.into_sink().0;
    assert_eq!(
        attrs,
        [
            (
                "b".to_string(),
                "tok".to_string(),
                true,
                "NMTOKEN".to_string()
            ),
            (
                "a".to_string(),
                "fallback".to_string(),
                false,
                "CDATA".to_string()
            ),
        ]
    );
}

#[test]
fn sink_can_abort_on_validity_error() {
    struct Strict;
    impl EventSink for Strict {
        fn error(&mut self, message: &str, _position: Position) -> quick_sax::Result<()> {
            Err(Error::Aborted(message.to_string()))
        }
    }
    let doc = b"<!DOCTYPE r [<!ELEMENT r EMPTY>]><r>text</r>";
    let mut parser = ParserBuilder::new().validation(true).build(Strict);
    let result = parser.feed(doc).and_then(|_| parser.finish());
    assert!(matches!(result, Err(Error::Aborted(_))));
}
