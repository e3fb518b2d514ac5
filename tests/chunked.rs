//! Feed-split invariance: any partition of the input byte stream must
//! produce the same event sequence as feeding it all at once.

use pretty_assertions::assert_eq;
use quick_sax::sax::Attributes;
use quick_sax::{EventSink, Parser, Position, QName};

#[derive(Default)]
struct Recorder(Vec<String>);

impl EventSink for Recorder {
    fn start_document(&mut self) {
        self.0.push("startdoc".to_string());
    }
    fn end_document(&mut self) {
        self.0.push("enddoc".to_string());
    }
    fn start_element(&mut self, name: &QName, attributes: &Attributes) {
        let mut s = format!("<{}", name.raw_name());
        for a in attributes {
            s.push_str(&format!(" {}={}", a.name.raw_name(), a.value));
        }
        s.push('>');
        self.0.push(s);
    }
    fn end_element(&mut self, name: &QName) {
        self.0.push(format!("</{}>", name.raw_name()));
    }
    fn characters(&mut self, text: &str) {
        self.0.push(format!("text({})", text));
    }
    fn ignorable_whitespace(&mut self, text: &str) {
        self.0.push(format!("iws({})", text));
    }
    fn processing_instruction(&mut self, target: &str, data: &str) {
        self.0.push(format!("pi({},{})", target, data));
    }
    fn comment(&mut self, text: &str) {
        self.0.push(format!("comment({})", text));
    }
    fn start_cdata_section(&mut self) {
        self.0.push("cdata+".to_string());
    }
    fn end_cdata_section(&mut self) {
        self.0.push("cdata-".to_string());
    }
    fn start_prefix_mapping(&mut self, prefix: &str, uri: &str) {
        self.0.push(format!("xmlns+({}={})", prefix, uri));
    }
    fn end_prefix_mapping(&mut self, prefix: &str) {
        self.0.push(format!("xmlns-({})", prefix));
    }
    fn start_entity(&mut self, name: &str) {
        self.0.push(format!("ent+({})", name));
    }
    fn end_entity(&mut self, name: &str) {
        self.0.push(format!("ent-({})", name));
    }
    fn warning(&mut self, _message: &str, _position: Position) {}
}

fn parse_chunked(doc: &[u8], chunk: usize) -> Vec<String> {
    let mut parser = Parser::new(Recorder::default());
    for piece in doc.chunks(chunk) {
        parser.feed(piece).expect("feed");
    }
    parser.finish().expect("finish");
    parser.into_sink().0
}

fn check(doc: &[u8]) {
    let whole = parse_chunked(doc, doc.len().max(1));
    for chunk in [1, 2, 3, 4, 5, 7, 11, 13, 17, 19, 23, 29] {
        assert_eq!(parse_chunked(doc, chunk), whole, "chunk size {}", chunk);
    }
}

#[test]
fn document_with_everything() {
    check(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <!DOCTYPE r [\
           <!ELEMENT r ANY>\
           <!ENTITY e \"v&#233;\">\
           <!ATTLIST r a CDATA #IMPLIED>\
         ]>\
         <!--préambule-->\
         <r a=\"x &amp; y\">\
           text épicé &e;\
           <![CDATA[raw ]] bits]]>\
           <?work hard ??>\
           <nested><deep/></nested>\
         </r> "
            .as_bytes(),
    );
}

#[test]
fn split_inside_bom() {
    check(&[0xEF, 0xBB, 0xBF, b'<', b'r', b'>', b'x', b'<', b'/', b'r', b'>']);
}

#[test]
fn split_inside_multibyte_sequence() {
    check("<r>ひらがな text</r>".as_bytes());
}

#[test]
fn split_inside_cdata_end_and_comment_delimiters() {
    check(b"<r><![CDATA[a]]>]--[<!--b--></r>");
}

#[test]
fn split_between_amp_and_name_and_semicolon() {
    check(b"<r a='&quot;q'>&amp;&#x41;</r>");
}

#[test]
fn split_between_lt_and_slash() {
    check(b"<r><a></a></r>");
}

#[test]
fn split_inside_utf16_document() {
    let mut bytes = vec![0xFF, 0xFE];
    for u in "<?xml version=\"1.0\" encoding=\"utf-16\"?><r>héllo</r>".encode_utf16() {
        bytes.extend_from_slice(&u.to_le_bytes());
    }
    check(&bytes);
}

#[test]
fn split_inside_doctype_keywords() {
    check(
        b"<!DOCTYPE r [<!ELEMENT r (a,b*)><!ELEMENT a EMPTY><!ELEMENT b EMPTY>\
          <!NOTATION n SYSTEM \"n\">]><r><a/><b/><b/></r>",
    );
}
