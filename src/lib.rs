//! Streaming, push-driven XML 1.0/1.1 parser with DTD support.
//!
//! quick-sax converts a sequence of byte chunks into a sequence of parse
//! events: the caller pushes bytes with [`Parser::feed`] as they arrive,
//! and the parser calls back into an [`EventSink`] as soon as complete
//! constructs are recognized. It never blocks on I/O and parses documents
//! of unbounded length in bounded memory.
//!
//! The core is a three-stage pipeline:
//!
//!  1. a **decoder** ([`encoding`]) that sniffs the byte order mark,
//!     parses the XML or text declaration straight from bytes, decodes
//!     the chosen charset incrementally and normalizes line endings;
//!  2. a **tokenizer** ([`tokenizer`]) — a deterministic two-level state
//!     machine over reduced character classes that emits a typed token
//!     stream with token-boundary resumption across chunk splits;
//!  3. a **syntax core** ([`parser`]) that assembles tokens into
//!     elements, attributes and DTD declarations, tracks namespace
//!     scopes, expands entities (spawning nested pipelines), and checks
//!     validity when asked to.
//!
//! # Examples
//!
//! ```
//! use quick_sax::{EventSink, Parser, QName};
//! use quick_sax::sax::Attributes;
//!
//! #[derive(Default)]
//! struct Names(Vec<String>);
//!
//! impl EventSink for Names {
//!     fn start_element(&mut self, name: &QName, _attributes: &Attributes) {
//!         self.0.push(name.local_name().to_string());
//!     }
//! }
//!
//! let mut parser = Parser::new(Names::default());
//! // Feed boundaries are arbitrary; here the document arrives in two
//! // pieces split in the middle of a tag.
//! parser.feed(b"<greeting><wo").unwrap();
//! parser.feed(b"rld/></greeting>").unwrap();
//! parser.finish().unwrap();
//! assert_eq!(parser.sink_ref().0, ["greeting", "world"]);
//! ```
//!
//! Well-formedness violations abort the parse with an [`Error`]; validity
//! problems (when validation is enabled through
//! [`ParserBuilder::validation`]) are reported through the sink and the
//! parse continues.

pub mod chars;
pub mod dtd;
pub mod encoding;
mod errors;
pub mod name;
pub mod parser;
pub mod sax;
pub mod tokenizer;
pub mod validate;

pub use crate::encoding::XmlVersion;
pub use crate::errors::{Error, Position, Result};
pub use crate::name::QName;
pub use crate::parser::{Parser, ParserBuilder};
pub use crate::sax::{Attribute, Attributes, EntityResolver, EventSink, InputSource, NullSink};
