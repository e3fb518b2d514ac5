//! The content parser: the third stage of the pipeline.
//!
//! Consumes the token stream, maintains the element, entity and namespace
//! stacks, assembles attributes, drives the DTD sub-parser and delivers
//! events to the sink. Entity expansion pushes a nested
//! decoder-plus-tokenizer pipeline whose tokens feed the same dispatch
//! loop, so expanded content appears inline at the point of the reference.

mod attributes;
mod builder;
mod dtd;

use std::io::Read;

use encoding_rs::Encoding;

use crate::dtd::{ContentSpec, DefaultDecl, Dtd, EntityDef, ValuePiece};
use crate::encoding::{EntityDecoder, XmlVersion};
use crate::errors::{Error, Position, Result};
use crate::name::{split_qname, NamespaceResolver, QName};
use crate::sax::{resolve_uri, Attribute, Attributes, EntityResolver, EventSink, InputData};
use crate::tokenizer::{State as LexState, Token, Tokenizer};
use crate::validate::{check_attribute, check_content, IdTracker};

use self::attributes::{normalize, normalize_default, AttrPiece, RawAttribute};
use self::dtd::{DtdAction, DtdParser};

pub use self::builder::ParserBuilder;

/// Feature flags of a parser instance.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Config {
    pub namespaces: bool,
    pub namespace_prefixes: bool,
    pub validation: bool,
    pub external_general_entities: bool,
    pub external_parameter_entities: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespaces: true,
            namespace_prefixes: true,
            validation: false,
            external_general_entities: false,
            external_parameter_entities: false,
        }
    }
}

/// What the parser is currently assembling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CoreState {
    /// Before the root element.
    Prolog,
    /// Inside the DOCTYPE declaration (including a loaded external subset).
    Dtd,
    /// Inside the root element.
    Content,
    /// Assembling a start tag.
    StartTag,
    /// Assembling an end tag.
    EndTag,
    /// Accumulating a comment.
    Comment,
    /// Accumulating a processing instruction.
    Pi,
    /// After the root element.
    Epilog,
}

/// One open element.
struct ElementFrame {
    name: QName,
    /// Pipeline depth when the element opened; it must close at the same
    /// depth.
    entity_depth: usize,
    /// Prefixes declared on this element, for the end events.
    ns_decls: Vec<String>,
    /// Raw names of child elements, for content-model validation.
    children: Vec<String>,
    had_text: bool,
    had_nonws_text: bool,
    /// The element is declared with element (children) content, which
    /// makes its whitespace ignorable.
    element_content: bool,
}

/// One entry of the entity stack; the bottom entry is the document entity.
struct EntityFrame {
    /// Entity name; `[document]` and `[dtd]` for the two subsets.
    name: String,
    parameter: bool,
    /// Resolved system identifier, for recursion checks and base URIs.
    system_id: Option<String>,
    /// Element stack depth on entry.
    element_depth: usize,
    /// DTD sub-state and group depth on entry, checked on exit.
    dtd_state_tag: u8,
    dtd_group_depth: usize,
    /// Whether start/end entity events surround this expansion.
    report: bool,
}

/// One decoder-plus-tokenizer pipeline; nested ones implement entity
/// expansion.
struct Pipeline {
    decoder: Option<EntityDecoder>,
    tokenizer: Tokenizer,
    frame: EntityFrame,
}

/// A streaming, push-driven XML parser.
///
/// Feed byte chunks with [`feed`](Self::feed), finish with
/// [`finish`](Self::finish); events are delivered synchronously to the
/// sink as complete constructs are recognized. Documents of unbounded
/// length parse in bounded memory.
///
/// # Examples
///
/// ```
/// use quick_sax::{EventSink, Parser, QName};
/// use quick_sax::sax::Attributes;
///
/// #[derive(Default)]
/// struct Counter {
///     elements: usize,
/// }
///
/// impl EventSink for Counter {
///     fn start_element(&mut self, _name: &QName, _attributes: &Attributes) {
///         self.elements += 1;
///     }
/// }
///
/// let mut parser = Parser::new(Counter::default());
/// parser.feed(b"<doc><a/><b>text</b></doc>").unwrap();
/// parser.finish().unwrap();
/// assert_eq!(parser.sink_ref().elements, 3);
/// ```
pub struct Parser<S: EventSink> {
    sink: S,
    config: Config,
    resolver: Option<Box<dyn EntityResolver>>,
    system_id: Option<String>,
    public_id: Option<String>,
    encoding_hint: Option<&'static Encoding>,

    pipelines: Vec<Pipeline>,
    state: CoreState,
    return_state: CoreState,
    elements: Vec<ElementFrame>,
    ns: NamespaceResolver,
    version: XmlVersion,

    started: bool,
    seen_root: bool,
    seen_doctype: bool,
    closed: bool,
    warned_fallback: bool,
    fatal: Option<String>,

    // Coalesced character data.
    text: String,
    text_has_nonws: bool,
    in_cdata: bool,

    // Comment and processing instruction accumulation.
    comment_buf: String,
    pi_target: Option<String>,
    pi_data: String,

    // Start/end tag assembly.
    tag_name: Option<String>,
    tag_position: Position,
    attrs_raw: Vec<RawAttribute>,
    cur_attr_name: Option<String>,
    cur_attr_position: Position,
    cur_pieces: Vec<AttrPiece>,
    in_value: bool,
    saw_eq: bool,
    ws_before: bool,
    end_name: Option<String>,

    // Reused attribute view.
    attrs: Attributes,

    dtd: Dtd,
    dtd_parser: DtdParser,
    dtd_actions: Vec<DtdAction>,
    ids: IdTracker,
}

impl<S: EventSink> Parser<S> {
    /// Creates a parser with the default configuration.
    pub fn new(sink: S) -> Self {
        ParserBuilder::new().build(sink)
    }

    pub(crate) fn with_config(
        sink: S,
        config: Config,
        system_id: Option<String>,
        public_id: Option<String>,
        encoding_hint: Option<&'static Encoding>,
        resolver: Option<Box<dyn EntityResolver>>,
    ) -> Self {
        let document = Pipeline {
            decoder: Some(EntityDecoder::document(encoding_hint)),
            tokenizer: Tokenizer::new(LexState::Prolog, XmlVersion::V1_0),
            frame: EntityFrame {
                name: "[document]".to_string(),
                parameter: false,
                system_id: system_id.clone(),
                element_depth: 0,
                dtd_state_tag: 0,
                dtd_group_depth: 0,
                report: false,
            },
        };
        Self {
            sink,
            config,
            resolver,
            system_id,
            public_id,
            encoding_hint,
            pipelines: vec![document],
            state: CoreState::Prolog,
            return_state: CoreState::Prolog,
            elements: Vec::new(),
            ns: NamespaceResolver::default(),
            version: XmlVersion::V1_0,
            started: false,
            seen_root: false,
            seen_doctype: false,
            closed: false,
            warned_fallback: false,
            fatal: None,
            text: String::new(),
            text_has_nonws: false,
            in_cdata: false,
            comment_buf: String::new(),
            pi_target: None,
            pi_data: String::new(),
            tag_name: None,
            tag_position: Position::start(),
            attrs_raw: Vec::new(),
            cur_attr_name: None,
            cur_attr_position: Position::start(),
            cur_pieces: Vec::new(),
            in_value: false,
            saw_eq: false,
            ws_before: false,
            end_name: None,
            attrs: Attributes::default(),
            dtd: Dtd::default(),
            dtd_parser: DtdParser::new(),
            dtd_actions: Vec::new(),
            ids: IdTracker::default(),
        }
    }

    /// Gets a reference to the event sink.
    pub fn sink_ref(&self) -> &S {
        &self.sink
    }

    /// Gets a mutable reference to the event sink.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Consumes the parser, returning the sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// The current position in the entity being parsed.
    pub fn position(&self) -> Position {
        match self.pipelines.last() {
            Some(p) => p.tokenizer.position(),
            None => Position::start(),
        }
    }

    /// The system identifier of the document entity.
    pub fn system_id(&self) -> Option<&str> {
        self.system_id.as_deref()
    }

    /// The public identifier of the document entity.
    pub fn public_id(&self) -> Option<&str> {
        self.public_id.as_deref()
    }

    /// Sets the system identifier used as the base for resolving relative
    /// external identifiers.
    pub fn set_system_id(&mut self, system_id: impl Into<String>) {
        let system_id = system_id.into();
        if let Some(p) = self.pipelines.first_mut() {
            p.frame.system_id = Some(system_id.clone());
        }
        self.system_id = Some(system_id);
    }

    /// Sets the public identifier of the document entity.
    pub fn set_public_id(&mut self, public_id: impl Into<String>) {
        self.public_id = Some(public_id.into());
    }

    /// Sets the resolver consulted for external entities.
    pub fn set_entity_resolver<R: EntityResolver + 'static>(&mut self, resolver: R) {
        self.resolver = Some(Box::new(resolver));
    }

    /// Sets the charset assumed when neither a byte order mark nor a
    /// declaration names one. Only effective before the charset has been
    /// decided; unknown labels are ignored.
    pub fn set_encoding_hint(&mut self, label: &str) {
        let hint = Encoding::for_label(label.as_bytes());
        self.encoding_hint = hint;
        if let Some(p) = self.pipelines.first_mut() {
            if let Some(decoder) = p.decoder.as_mut() {
                decoder.set_hint(hint);
            }
        }
    }

    /// Feeds the next chunk of document bytes.
    ///
    /// All events that become complete are delivered before the call
    /// returns. Unconsumed input (an incomplete token or byte sequence) is
    /// retained for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        self.guard()?;
        self.ensure_started();
        let result = self.feed_inner(bytes);
        self.seal(result)
    }

    /// Signals the end of the document.
    ///
    /// Verifies that the document is complete, runs the deferred IDREF
    /// check and delivers `end_document`.
    pub fn finish(&mut self) -> Result<()> {
        self.guard()?;
        self.ensure_started();
        let result = self.finish_inner();
        self.seal(result)
    }

    /// Returns the parser to its fresh state, preserving the sink, the
    /// configuration and allocations. Collected DTD declarations are
    /// dropped.
    pub fn reset(&mut self) {
        self.pipelines.truncate(1);
        if let Some(p) = self.pipelines.first_mut() {
            if let Some(decoder) = p.decoder.as_mut() {
                decoder.reset();
            }
            p.tokenizer.reset();
            p.frame.element_depth = 0;
        }
        self.state = CoreState::Prolog;
        self.return_state = CoreState::Prolog;
        self.elements.clear();
        self.ns.reset();
        self.version = XmlVersion::V1_0;
        self.started = false;
        self.seen_root = false;
        self.seen_doctype = false;
        self.closed = false;
        self.warned_fallback = false;
        self.fatal = None;
        self.text.clear();
        self.text_has_nonws = false;
        self.in_cdata = false;
        self.comment_buf.clear();
        self.pi_target = None;
        self.pi_data.clear();
        self.tag_name = None;
        self.attrs_raw.clear();
        self.cur_attr_name = None;
        self.cur_pieces.clear();
        self.in_value = false;
        self.saw_eq = false;
        self.ws_before = false;
        self.end_name = None;
        self.attrs.clear();
        self.dtd.reset();
        self.dtd_parser.reset();
        self.dtd_actions.clear();
        self.ids.reset();
    }

    fn guard(&self) -> Result<()> {
        if let Some(msg) = &self.fatal {
            return Err(Error::Aborted(msg.clone()));
        }
        if self.closed {
            return Err(Error::Aborted("document already closed".to_string()));
        }
        Ok(())
    }

    fn ensure_started(&mut self) {
        if !self.started {
            self.started = true;
            self.sink.start_document();
        }
    }

    /// Records a fatal outcome so later calls raise it again, and gives
    /// the sink its fatal-error notification.
    fn seal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            let position = e.position().unwrap_or_else(|| self.position());
            let message = e.to_string();
            if !matches!(e, Error::Aborted(_)) {
                self.sink.fatal_error(&message, position);
            }
            self.fatal = Some(message);
        }
        result
    }

    fn feed_inner(&mut self, bytes: &[u8]) -> Result<()> {
        {
            let p = match self.pipelines.first_mut() {
                Some(p) => p,
                None => return Ok(()),
            };
            let decoder = match p.decoder.as_mut() {
                Some(d) => d,
                None => return Ok(()),
            };
            decoder.feed(bytes, p.tokenizer.buffer_mut())?;
            let version = decoder.version();
            p.tokenizer.set_version(version);
            self.version = version;
            if decoder.used_fallback() && !self.warned_fallback {
                self.warned_fallback = true;
                let name = decoder.encoding_name();
                self.sink.warning(
                    &format!("No encoding declared; falling back to {}", name),
                    Position::start(),
                );
            }
        }
        self.pump()
    }

    fn finish_inner(&mut self) -> Result<()> {
        {
            let p = match self.pipelines.first_mut() {
                Some(p) => p,
                None => return Ok(()),
            };
            if let Some(decoder) = p.decoder.as_mut() {
                decoder.finish(p.tokenizer.buffer_mut())?;
                let version = decoder.version();
                p.tokenizer.set_version(version);
                self.version = version;
            }
            p.tokenizer.set_eof();
        }
        self.pump()?;
        if !self.seen_root {
            return Err(Error::Syntax(
                "No element found: the document entity is empty".to_string(),
                self.position(),
            ));
        }
        if let Some(frame) = self.elements.last() {
            return Err(Error::UnexpectedEof(format!("</{}>", frame.name.raw_name())));
        }
        if self.state == CoreState::Dtd {
            return Err(Error::UnexpectedEof("DOCTYPE".to_string()));
        }
        if self.config.validation {
            for (value, position) in self.ids.unresolved() {
                self.sink
                    .error(&format!("IDREF '{}' has no matching ID", value), position)?;
            }
        }
        self.closed = true;
        self.sink.end_document();
        Ok(())
    }

    /// Drains complete tokens from the top of the pipeline stack,
    /// dispatching each one; pops entity pipelines as they run dry.
    fn pump(&mut self) -> Result<()> {
        loop {
            let top = self.pipelines.len() - 1;
            let token = {
                let tokenizer = &mut self.pipelines[top].tokenizer;
                tokenizer.next_token()?
            };
            match token {
                Some(token) => {
                    let (text, position) = {
                        let t = &self.pipelines[top].tokenizer;
                        (token_text(t, token), t.token_position())
                    };
                    self.dispatch(token, text.as_deref(), position)?;
                }
                None => {
                    if self.pipelines[top].tokenizer.at_eof() {
                        if top == 0 {
                            return Ok(());
                        }
                        self.pop_pipeline()?;
                    } else {
                        self.pipelines[top].tokenizer.compact();
                        return Ok(());
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, token: Token, text: Option<&str>, position: Position) -> Result<()> {
        match self.state {
            CoreState::Prolog => self.in_prolog(token, position),
            CoreState::Content => self.in_content(token, text, position),
            CoreState::StartTag => self.in_start_tag(token, text, position),
            CoreState::EndTag => self.in_end_tag(token, text, position),
            CoreState::Comment => self.in_comment(token, text),
            CoreState::Pi => self.in_pi(token, text),
            CoreState::Dtd => self.in_dtd(token, text, position),
            CoreState::Epilog => self.in_epilog(token, text, position),
        }
    }

    fn in_prolog(&mut self, token: Token, position: Position) -> Result<()> {
        match token {
            Token::Whitespace(_) => Ok(()),
            Token::Lt => {
                self.begin_start_tag(position);
                Ok(())
            }
            Token::LtSlash => Err(Error::Syntax(
                "End tag before any element was opened".to_string(),
                position,
            )),
            Token::StartComment => {
                self.comment_buf.clear();
                self.return_state = CoreState::Prolog;
                self.state = CoreState::Comment;
                Ok(())
            }
            Token::StartPi => {
                self.pi_target = None;
                self.pi_data.clear();
                self.return_state = CoreState::Prolog;
                self.state = CoreState::Pi;
                Ok(())
            }
            Token::StartDoctype => {
                if self.seen_doctype {
                    return Err(Error::Syntax(
                        "Only one DOCTYPE declaration is allowed".to_string(),
                        position,
                    ));
                }
                self.seen_doctype = true;
                self.dtd_parser.reset();
                self.state = CoreState::Dtd;
                Ok(())
            }
            _ => Err(Error::Syntax(
                "Unexpected content in prolog".to_string(),
                position,
            )),
        }
    }

    fn in_content(&mut self, token: Token, text: Option<&str>, position: Position) -> Result<()> {
        match token {
            Token::Cdata(_) => {
                let text = text.unwrap_or("");
                self.append_text(text, position)
            }
            Token::CharRef(c) | Token::PredefRef(c) => {
                self.text.push(c);
                self.text_has_nonws = true;
                Ok(())
            }
            Token::GeneralRef(_) => {
                let name = text.unwrap_or("").to_string();
                self.expand_general(&name, position)
            }
            Token::Lt => {
                self.flush_text()?;
                self.begin_start_tag(position);
                Ok(())
            }
            Token::LtSlash => {
                self.end_name = None;
                self.state = CoreState::EndTag;
                Ok(())
            }
            Token::StartCdata => {
                self.flush_text()?;
                self.sink.start_cdata_section();
                self.in_cdata = true;
                Ok(())
            }
            Token::EndCdata => {
                self.flush_text()?;
                self.sink.end_cdata_section();
                self.in_cdata = false;
                Ok(())
            }
            Token::StartComment => {
                self.flush_text()?;
                self.comment_buf.clear();
                self.return_state = CoreState::Content;
                self.state = CoreState::Comment;
                Ok(())
            }
            Token::StartPi => {
                self.flush_text()?;
                self.pi_target = None;
                self.pi_data.clear();
                self.return_state = CoreState::Content;
                self.state = CoreState::Pi;
                Ok(())
            }
            _ => Err(Error::Syntax(
                "Unexpected token in element content".to_string(),
                position,
            )),
        }
    }

    fn append_text(&mut self, text: &str, _position: Position) -> Result<()> {
        self.text.push_str(text);
        if self.in_cdata || text.chars().any(|c| !crate::chars::is_whitespace(c)) {
            self.text_has_nonws = true;
        }
        Ok(())
    }

    /// Delivers the coalesced character data collected so far.
    fn flush_text(&mut self) -> Result<()> {
        if self.text.is_empty() {
            return Ok(());
        }
        let nonws = self.text_has_nonws;
        let element_content = self
            .elements
            .last()
            .map(|f| f.element_content)
            .unwrap_or(false);
        if let Some(frame) = self.elements.last_mut() {
            frame.had_text = true;
            if nonws {
                frame.had_nonws_text = true;
            }
        }
        if element_content && !nonws {
            let text = ::std::mem::replace(&mut self.text, String::new());
            self.sink.ignorable_whitespace(&text);
            self.text = text;
        } else {
            let text = ::std::mem::replace(&mut self.text, String::new());
            self.sink.characters(&text);
            self.text = text;
        }
        self.text.clear();
        self.text_has_nonws = false;
        Ok(())
    }

    fn begin_start_tag(&mut self, position: Position) {
        self.tag_name = None;
        self.tag_position = position;
        self.attrs_raw.clear();
        self.cur_attr_name = None;
        self.cur_pieces.clear();
        self.in_value = false;
        self.saw_eq = false;
        self.ws_before = false;
        self.state = CoreState::StartTag;
    }

    fn in_start_tag(&mut self, token: Token, text: Option<&str>, position: Position) -> Result<()> {
        match token {
            Token::Name(_) if !self.in_value => {
                let name = text.unwrap_or("").to_string();
                if self.tag_name.is_none() {
                    self.tag_name = Some(name);
                } else {
                    if self.cur_attr_name.is_some() {
                        return Err(Error::Syntax(
                            "Expected '=' after attribute name".to_string(),
                            position,
                        ));
                    }
                    if !self.ws_before {
                        return Err(Error::Syntax(
                            "Whitespace required between attributes".to_string(),
                            position,
                        ));
                    }
                    self.cur_attr_name = Some(name);
                    self.cur_attr_position = position;
                    self.saw_eq = false;
                }
                self.ws_before = false;
                Ok(())
            }
            Token::Whitespace(_) => {
                self.ws_before = true;
                Ok(())
            }
            Token::Eq => {
                if self.cur_attr_name.is_none() || self.saw_eq {
                    return Err(Error::Syntax("Unexpected '='".to_string(), position));
                }
                self.saw_eq = true;
                Ok(())
            }
            Token::BeginLiteral => {
                if self.cur_attr_name.is_none() || !self.saw_eq {
                    return Err(Error::Syntax(
                        "Attribute value must follow a name and '='".to_string(),
                        position,
                    ));
                }
                self.cur_pieces.clear();
                self.in_value = true;
                Ok(())
            }
            Token::Cdata(_) if self.in_value => {
                self.cur_pieces
                    .push(AttrPiece::Text(text.unwrap_or("").to_string()));
                Ok(())
            }
            Token::CharRef(c) | Token::PredefRef(c) if self.in_value => {
                self.cur_pieces.push(AttrPiece::CharRef(c));
                Ok(())
            }
            Token::GeneralRef(_) if self.in_value => {
                self.cur_pieces
                    .push(AttrPiece::Ref(text.unwrap_or("").to_string()));
                Ok(())
            }
            Token::EndLiteral => {
                let name = match self.cur_attr_name.take() {
                    Some(name) => name,
                    None => {
                        return Err(Error::Syntax(
                            "Attribute value without a name".to_string(),
                            position,
                        ))
                    }
                };
                self.attrs_raw.push(RawAttribute {
                    name,
                    pieces: ::std::mem::replace(&mut self.cur_pieces, Vec::new()),
                    position: self.cur_attr_position,
                });
                self.in_value = false;
                self.saw_eq = false;
                self.ws_before = false;
                Ok(())
            }
            Token::Gt => self.finish_start_tag(false, position),
            Token::SlashGt => self.finish_start_tag(true, position),
            _ => Err(Error::Syntax(
                "Unexpected token in start tag".to_string(),
                position,
            )),
        }
    }

    fn in_end_tag(&mut self, token: Token, text: Option<&str>, position: Position) -> Result<()> {
        match token {
            Token::Name(_) if self.end_name.is_none() => {
                self.end_name = Some(text.unwrap_or("").to_string());
                Ok(())
            }
            Token::Whitespace(_) => Ok(()),
            Token::Gt => self.finish_end_tag(position),
            _ => Err(Error::Syntax(
                "Malformed end tag".to_string(),
                position,
            )),
        }
    }

    fn in_comment(&mut self, token: Token, text: Option<&str>) -> Result<()> {
        match token {
            Token::Cdata(_) => {
                self.comment_buf.push_str(text.unwrap_or(""));
                Ok(())
            }
            Token::EndComment => {
                let buf = ::std::mem::replace(&mut self.comment_buf, String::new());
                self.sink.comment(&buf);
                self.comment_buf = buf;
                self.comment_buf.clear();
                self.state = self.return_state;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn in_pi(&mut self, token: Token, text: Option<&str>) -> Result<()> {
        match token {
            Token::Name(_) if self.pi_target.is_none() => {
                self.pi_target = Some(text.unwrap_or("").to_string());
                Ok(())
            }
            Token::Cdata(_) => {
                self.pi_data.push_str(text.unwrap_or(""));
                Ok(())
            }
            Token::EndPi => {
                let target = self.pi_target.take().unwrap_or_default();
                let data = ::std::mem::replace(&mut self.pi_data, String::new());
                self.sink.processing_instruction(&target, &data);
                self.pi_data = data;
                self.pi_data.clear();
                self.state = self.return_state;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn in_epilog(&mut self, token: Token, text: Option<&str>, position: Position) -> Result<()> {
        match token {
            Token::Whitespace(_) => Ok(()),
            Token::Cdata(_) => {
                let text = text.unwrap_or("");
                if text.chars().all(crate::chars::is_whitespace) {
                    Ok(())
                } else {
                    Err(Error::Syntax(
                        "Content is not allowed after the root element".to_string(),
                        position,
                    ))
                }
            }
            Token::StartComment => {
                self.comment_buf.clear();
                self.return_state = CoreState::Epilog;
                self.state = CoreState::Comment;
                Ok(())
            }
            Token::StartPi => {
                self.pi_target = None;
                self.pi_data.clear();
                self.return_state = CoreState::Epilog;
                self.state = CoreState::Pi;
                Ok(())
            }
            Token::Lt => Err(Error::Syntax(
                "Only one root element is allowed".to_string(),
                position,
            )),
            _ => Err(Error::Syntax(
                "Content is not allowed after the root element".to_string(),
                position,
            )),
        }
    }

    fn in_dtd(&mut self, token: Token, text: Option<&str>, position: Position) -> Result<()> {
        match token {
            Token::StartComment => {
                self.comment_buf.clear();
                self.return_state = CoreState::Dtd;
                self.state = CoreState::Comment;
                Ok(())
            }
            Token::StartPi => {
                self.pi_target = None;
                self.pi_data.clear();
                self.return_state = CoreState::Dtd;
                self.state = CoreState::Pi;
                Ok(())
            }
            _ => {
                let from_internal = self.pipelines.len() == 1;
                let base = self.current_base();
                let mut actions = ::std::mem::replace(&mut self.dtd_actions, Vec::new());
                actions.clear();
                let result = self.dtd_parser.handle(
                    token,
                    text,
                    position,
                    from_internal,
                    base.as_deref(),
                    &mut self.dtd,
                    &mut actions,
                );
                if let Err(e) = result {
                    self.dtd_actions = actions;
                    return Err(e);
                }
                let outcome = self.run_dtd_actions(&actions, position);
                self.dtd_actions = actions;
                outcome
            }
        }
    }

    fn run_dtd_actions(&mut self, actions: &[DtdAction], position: Position) -> Result<()> {
        for action in actions {
            match action {
                DtdAction::Warning(msg) => self.sink.warning(msg, position),
                DtdAction::Validity(msg) => self.report_validity(msg, position)?,
                DtdAction::SetLiteral(kind) => {
                    if let Some(p) = self.pipelines.last_mut() {
                        p.tokenizer.set_literal_kind(*kind);
                    }
                }
                DtdAction::ArmConditional(kind) => {
                    if let Some(p) = self.pipelines.last_mut() {
                        p.tokenizer.arm_conditional(*kind);
                    }
                }
                DtdAction::ExpandPe(name) => self.expand_parameter(name, position)?,
                DtdAction::Notation {
                    name,
                    public_id,
                    system_id,
                } => self.sink.notation_declaration(
                    name,
                    public_id.as_deref(),
                    system_id.as_deref(),
                ),
                DtdAction::UnparsedEntity {
                    name,
                    public_id,
                    system_id,
                    notation,
                } => self.sink.unparsed_entity_declaration(
                    name,
                    public_id.as_deref(),
                    system_id.as_deref(),
                    notation,
                ),
                DtdAction::DoctypeDone => self.doctype_finished(position)?,
            }
        }
        Ok(())
    }

    fn report_validity(&mut self, message: &str, position: Position) -> Result<()> {
        if self.config.validation {
            self.sink.error(message, position)?;
        }
        Ok(())
    }

    /// The `>` of the DOCTYPE declaration was consumed: load the external
    /// subset if there is one, otherwise wrap up the DTD.
    fn doctype_finished(&mut self, position: Position) -> Result<()> {
        let external = self
            .dtd
            .external_id
            .as_ref()
            .and_then(|id| id.system_id.clone());
        if let Some(system_id) = external {
            if self.config.external_parameter_entities {
                if self.load_external_subset(&system_id, position)? {
                    // The DTD completes once the subset pipeline drains.
                    return Ok(());
                }
            } else {
                self.sink.warning(
                    &format!("Skipping external DTD subset '{}'", system_id),
                    position,
                );
            }
        }
        self.complete_dtd(position)
    }

    fn complete_dtd(&mut self, position: Position) -> Result<()> {
        let (fatal, validity) = self.dtd_parser.finish_notation_checks(&self.dtd);
        if let Some(msg) = fatal.into_iter().next() {
            return Err(Error::Syntax(msg, position));
        }
        for msg in validity {
            self.report_validity(&msg, position)?;
        }
        self.state = CoreState::Prolog;
        Ok(())
    }

    /// Starts the external subset pipeline; true when it was loaded.
    fn load_external_subset(&mut self, system_id: &str, position: Position) -> Result<bool> {
        let public_id = self
            .dtd
            .external_id
            .as_ref()
            .and_then(|id| id.public_id.clone());
        let base = self.current_base();
        let resolved = resolve_uri(base.as_deref(), system_id);
        let source = match self.resolve_entity(None, public_id.as_deref(), &resolved, base.as_deref())? {
            Some(source) => source,
            None => {
                self.sink.warning(
                    &format!("Skipping external DTD subset '{}'", resolved),
                    position,
                );
                return Ok(false);
            }
        };
        let frame = EntityFrame {
            name: "[dtd]".to_string(),
            parameter: true,
            system_id: Some(resolved),
            element_depth: self.elements.len(),
            dtd_state_tag: self.dtd_parser.sub_state_tag(),
            dtd_group_depth: self.dtd_parser.group_depth(),
            report: true,
        };
        self.push_external_pipeline(source, frame, LexState::DoctypeInternal, position)?;
        Ok(true)
    }

    /// Expands a general entity reference in content.
    fn expand_general(&mut self, name: &str, position: Position) -> Result<()> {
        let decl = match self.dtd.general_entity(name) {
            Some(decl) => decl.clone(),
            None => return Err(Error::UndeclaredEntity(name.to_string(), position)),
        };
        if self
            .pipelines
            .iter()
            .any(|p| !p.frame.parameter && p.frame.name == name)
        {
            return Err(Error::RecursiveEntity(name.to_string(), position));
        }
        match &decl.def {
            EntityDef::Unparsed(..) => Err(Error::Syntax(
                format!("Unparsed entity '&{};' cannot be referenced in content", name),
                position,
            )),
            EntityDef::Internal(pieces) => {
                self.flush_text()?;
                self.sink.start_entity(name);
                if decl.is_simple_text() {
                    // Nothing in the replacement can be markup; skip the
                    // nested tokenizer.
                    for piece in pieces {
                        match piece {
                            ValuePiece::Text(t) => {
                                self.append_text(t, position)?;
                            }
                            ValuePiece::CharRef(c) => {
                                self.text.push(*c);
                                self.text_has_nonws = true;
                            }
                            _ => {}
                        }
                    }
                    self.flush_text()?;
                    self.sink.end_entity(name);
                    Ok(())
                } else {
                    let replacement = replacement_text(pieces);
                    let mut tokenizer = Tokenizer::new(LexState::Content, self.version);
                    tokenizer.push_str(&replacement);
                    tokenizer.set_eof();
                    self.pipelines.push(Pipeline {
                        decoder: None,
                        tokenizer,
                        frame: EntityFrame {
                            name: name.to_string(),
                            parameter: false,
                            system_id: None,
                            element_depth: self.elements.len(),
                            dtd_state_tag: 0,
                            dtd_group_depth: 0,
                            report: true,
                        },
                    });
                    Ok(())
                }
            }
            EntityDef::External(id) => {
                if !self.config.external_general_entities {
                    self.sink.warning(
                        &format!("Skipping external entity '&{};'", name),
                        position,
                    );
                    return Ok(());
                }
                let base = decl.base_uri.clone().or_else(|| self.current_base());
                let system_id = id.system_id.clone().unwrap_or_default();
                let resolved = resolve_uri(base.as_deref(), &system_id);
                if self
                    .pipelines
                    .iter()
                    .any(|p| p.frame.system_id.as_deref() == Some(resolved.as_str()))
                {
                    return Err(Error::RecursiveEntity(name.to_string(), position));
                }
                let source = match self.resolve_entity(
                    Some(name),
                    id.public_id.as_deref(),
                    &resolved,
                    base.as_deref(),
                )? {
                    Some(source) => source,
                    None => {
                        self.sink.warning(
                            &format!("Skipping external entity '&{};'", name),
                            position,
                        );
                        return Ok(());
                    }
                };
                self.flush_text()?;
                let frame = EntityFrame {
                    name: name.to_string(),
                    parameter: false,
                    system_id: Some(resolved),
                    element_depth: self.elements.len(),
                    dtd_state_tag: 0,
                    dtd_group_depth: 0,
                    report: true,
                };
                self.push_external_pipeline(source, frame, LexState::Content, position)
            }
        }
    }

    /// Expands a parameter entity reference in the DTD.
    fn expand_parameter(&mut self, name: &str, position: Position) -> Result<()> {
        let decl = match self.dtd.parameter_entity(name) {
            Some(decl) => decl.clone(),
            None => {
                if self.pipelines.len() == 1 {
                    return Err(Error::UndeclaredEntity(name.to_string(), position));
                }
                // Undeclared in the external subset: report and skip; the
                // original's buffer-and-replay recovery is not replicated.
                self.report_validity(
                    &format!("Parameter entity '%{};' is not declared", name),
                    position,
                )?;
                self.sink.warning(
                    &format!("Skipping undeclared parameter entity '%{};'", name),
                    position,
                );
                return Ok(());
            }
        };
        if self
            .pipelines
            .iter()
            .any(|p| p.frame.parameter && p.frame.name == name)
        {
            return Err(Error::RecursiveEntity(name.to_string(), position));
        }
        match &decl.def {
            EntityDef::Unparsed(..) => Err(Error::Syntax(
                format!("Parameter entity '%{};' cannot be unparsed", name),
                position,
            )),
            EntityDef::Internal(pieces) => {
                // Outside literals the replacement text grows a space on
                // each side.
                let mut replacement = String::from(" ");
                replacement.push_str(&replacement_text(pieces));
                replacement.push(' ');
                let mut tokenizer = Tokenizer::new(LexState::DoctypeInternal, self.version);
                tokenizer.push_str(&replacement);
                tokenizer.set_eof();
                self.sink.start_entity(&format!("%{}", name));
                self.pipelines.push(Pipeline {
                    decoder: None,
                    tokenizer,
                    frame: EntityFrame {
                        name: name.to_string(),
                        parameter: true,
                        system_id: None,
                        element_depth: self.elements.len(),
                        dtd_state_tag: self.dtd_parser.sub_state_tag(),
                        dtd_group_depth: self.dtd_parser.group_depth(),
                        report: true,
                    },
                });
                Ok(())
            }
            EntityDef::External(id) => {
                if !self.config.external_parameter_entities {
                    self.sink.warning(
                        &format!("Skipping external parameter entity '%{};'", name),
                        position,
                    );
                    return Ok(());
                }
                let base = decl.base_uri.clone().or_else(|| self.current_base());
                let system_id = id.system_id.clone().unwrap_or_default();
                let resolved = resolve_uri(base.as_deref(), &system_id);
                if self
                    .pipelines
                    .iter()
                    .any(|p| p.frame.system_id.as_deref() == Some(resolved.as_str()))
                {
                    return Err(Error::RecursiveEntity(name.to_string(), position));
                }
                let source = match self.resolve_entity(
                    Some(name),
                    id.public_id.as_deref(),
                    &resolved,
                    base.as_deref(),
                )? {
                    Some(source) => source,
                    None => {
                        self.sink.warning(
                            &format!("Skipping external parameter entity '%{};'", name),
                            position,
                        );
                        return Ok(());
                    }
                };
                let frame = EntityFrame {
                    name: name.to_string(),
                    parameter: true,
                    system_id: Some(resolved),
                    element_depth: self.elements.len(),
                    dtd_state_tag: self.dtd_parser.sub_state_tag(),
                    dtd_group_depth: self.dtd_parser.group_depth(),
                    report: true,
                };
                self.push_external_pipeline(source, frame, LexState::DoctypeInternal, position)
            }
        }
    }

    fn resolve_entity(
        &mut self,
        name: Option<&str>,
        public_id: Option<&str>,
        system_id: &str,
        base: Option<&str>,
    ) -> Result<Option<crate::sax::InputSource>> {
        match self.resolver.as_mut() {
            Some(resolver) => resolver.resolve(name, public_id, system_id, base),
            None => Ok(None),
        }
    }

    /// Spawns the nested decoder-plus-tokenizer pipeline for an external
    /// entity and decodes its whole input.
    fn push_external_pipeline(
        &mut self,
        source: crate::sax::InputSource,
        frame: EntityFrame,
        initial: LexState,
        _position: Position,
    ) -> Result<()> {
        let bytes = match source.data {
            InputData::Bytes(bytes) => bytes,
            InputData::Reader(mut reader) => {
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                bytes
            }
        };
        let hint = source
            .encoding
            .as_deref()
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .or(self.encoding_hint);
        let mut decoder = EntityDecoder::external_entity(hint, self.version);
        let mut tokenizer = Tokenizer::new(initial, self.version);
        decoder.feed(&bytes, tokenizer.buffer_mut())?;
        decoder.finish(tokenizer.buffer_mut())?;
        tokenizer.set_version(decoder.version());
        tokenizer.set_eof();
        let display = display_name(&frame);
        self.sink.start_entity(&display);
        self.pipelines.push(Pipeline {
            decoder: Some(decoder),
            tokenizer,
            frame,
        });
        Ok(())
    }

    /// An entity pipeline ran dry: verify the nesting constraints and
    /// deliver the end-entity event.
    fn pop_pipeline(&mut self) -> Result<()> {
        let p = match self.pipelines.pop() {
            Some(p) => p,
            None => return Ok(()),
        };
        let position = p.tokenizer.position();
        if !p.frame.parameter && self.elements.len() != p.frame.element_depth {
            let name = self
                .elements
                .last()
                .map(|f| f.name.raw_name().to_string())
                .unwrap_or_default();
            return Err(Error::EntityBoundary(name, position));
        }
        if p.frame.parameter && p.frame.name != "[dtd]" {
            if self.dtd_parser.sub_state_tag() != p.frame.dtd_state_tag
                || self.dtd_parser.group_depth() != p.frame.dtd_group_depth
            {
                return Err(Error::Syntax(
                    format!(
                        "Parameter entity '%{};' is not properly nested within markup declarations",
                        p.frame.name
                    ),
                    position,
                ));
            }
        }
        if p.frame.report {
            if !p.frame.parameter {
                self.flush_text()?;
            }
            self.sink.end_entity(&display_name(&p.frame));
        }
        if p.frame.name == "[dtd]" {
            self.complete_dtd(position)?;
        }
        Ok(())
    }

    fn current_base(&self) -> Option<String> {
        for p in self.pipelines.iter().rev() {
            if let Some(system_id) = &p.frame.system_id {
                return Some(system_id.clone());
            }
        }
        self.system_id.clone()
    }

    fn finish_start_tag(&mut self, self_closing: bool, position: Position) -> Result<()> {
        if self.cur_attr_name.is_some() || self.in_value {
            return Err(Error::Syntax(
                "Attribute without a value".to_string(),
                position,
            ));
        }
        let raw_name = match self.tag_name.take() {
            Some(name) => name,
            None => {
                return Err(Error::Syntax(
                    "Start tag without a name".to_string(),
                    position,
                ))
            }
        };
        // Duplicate detection on raw names catches `<e a="1" a="2"/>`.
        for (i, a) in self.attrs_raw.iter().enumerate() {
            if self.attrs_raw[..i].iter().any(|b| b.name == a.name) {
                return Err(Error::DuplicateAttribute(a.name.clone(), a.position));
            }
        }

        // Normalize every attribute value first; namespace declarations
        // take their values from the normalized form.
        let mut normalized: Vec<(String, String, Position)> = Vec::with_capacity(self.attrs_raw.len());
        for a in &self.attrs_raw {
            let tokenized = self
                .dtd
                .att_def(&raw_name, &a.name)
                .map(|d| d.att_type.is_tokenized())
                .unwrap_or(false);
            let value = normalize(&a.pieces, tokenized, &self.dtd, a.position)?;
            normalized.push((a.name.clone(), value, a.position));
        }

        // Attribute defaulting from the ATTLIST declarations.
        let defs: Vec<crate::dtd::AttDef> = self
            .dtd
            .att_defs(&raw_name)
            .map(|d| d.to_vec())
            .unwrap_or_default();
        if !defs.is_empty() {
            let mut defaulted: Vec<(String, String, Position)> = Vec::new();
            for def in &defs {
                let present = normalized.iter().find(|(n, _, _)| n == &def.name);
                match (&def.default, present) {
                    (DefaultDecl::Required, None) => {
                        let msg = format!(
                            "Required attribute '{}' of '{}' is missing",
                            def.name, raw_name
                        );
                        self.report_validity(&msg, position)?;
                    }
                    (DefaultDecl::Fixed(pieces), Some((_, value, at))) => {
                        let fixed =
                            normalize_default(pieces, def.att_type.is_tokenized(), &self.dtd, *at)?;
                        if value != &fixed {
                            let msg = format!(
                                "Attribute '{}' of '{}' must have the #FIXED value '{}'",
                                def.name, raw_name, fixed
                            );
                            self.report_validity(&msg, *at)?;
                        }
                    }
                    (DefaultDecl::Fixed(pieces), None) | (DefaultDecl::Default(pieces), None) => {
                        let value = normalize_default(
                            pieces,
                            def.att_type.is_tokenized(),
                            &self.dtd,
                            position,
                        )?;
                        defaulted.push((def.name.clone(), value, position));
                    }
                    _ => {}
                }
            }
            normalized.extend(defaulted);
        }

        // Open the namespace scope and apply the declarations.
        let specified_count = self.attrs_raw.len();
        if self.config.namespaces {
            self.ns.push();
        }
        let mut ns_decls: Vec<String> = Vec::new();
        if self.config.namespaces {
            for (name, value, at) in &normalized {
                if name == "xmlns" {
                    self.ns.declare("", value, *at)?;
                    ns_decls.push(String::new());
                    self.sink.start_prefix_mapping("", value);
                } else if let Some(prefix) = name.strip_prefix("xmlns:") {
                    if prefix.is_empty() || prefix.contains(':') {
                        return Err(Error::Syntax(
                            format!("'{}' is not a valid namespace declaration", name),
                            *at,
                        ));
                    }
                    self.ns.declare(prefix, value, *at)?;
                    ns_decls.push(prefix.to_string());
                    self.sink.start_prefix_mapping(prefix, value);
                }
            }
        }

        // Resolve the element name.
        let qname = if self.config.namespaces {
            if raw_name == "xmlns" || split_qname(&raw_name, position)?.0 == Some("xmlns") {
                return Err(Error::Syntax(
                    "'xmlns' is not a legal element name".to_string(),
                    position,
                ));
            }
            self.ns.resolve_element(&raw_name, self.tag_position)?
        } else {
            QName::unqualified(&raw_name)
        };

        // Build the attributes view with expanded-name duplicate
        // detection.
        self.attrs.clear();
        for (index, (name, value, at)) in normalized.iter().enumerate() {
            let is_ns_decl = name == "xmlns" || name.starts_with("xmlns:");
            if self.config.namespaces && is_ns_decl && !self.config.namespace_prefixes {
                continue;
            }
            let attr_qname = if self.config.namespaces && !is_ns_decl {
                if name == "xmlns" {
                    return Err(Error::Syntax(
                        "'xmlns' is not a legal attribute name".to_string(),
                        *at,
                    ));
                }
                self.ns.resolve_attribute(name, *at)?
            } else {
                QName::unqualified(name)
            };
            if !attr_qname.uri().is_empty() {
                let duplicate = self
                    .attrs
                    .iter()
                    .any(|existing| existing.name == attr_qname);
                if duplicate {
                    return Err(Error::DuplicateAttribute(name.clone(), *at));
                }
            }
            let att_type = self
                .dtd
                .att_def(&raw_name, name)
                .map(|d| d.att_type.as_str())
                .unwrap_or("CDATA");
            self.attrs.push(Attribute {
                name: attr_qname,
                value: value.clone(),
                att_type,
                specified: index < specified_count,
            });
        }

        // Validity checks against the declarations.
        if self.config.validation && self.dtd.present() {
            if self.dtd.element(&raw_name).is_none() {
                let msg = format!("No declaration for element '{}'", raw_name);
                self.report_validity(&msg, position)?;
            }
            let mut messages: Vec<String> = Vec::new();
            for (name, value, at) in &normalized {
                if name == "xmlns" || name.starts_with("xmlns:") {
                    continue;
                }
                match self.dtd.att_def(&raw_name, name) {
                    Some(def) => {
                        let errors = check_attribute(
                            &raw_name,
                            name,
                            value,
                            &def.att_type,
                            self.config.namespaces,
                            &self.dtd,
                            &mut self.ids,
                            *at,
                        );
                        messages.extend(errors);
                    }
                    None => messages.push(format!(
                        "Attribute '{}' of '{}' is not declared",
                        name, raw_name
                    )),
                }
            }
            for msg in messages {
                self.report_validity(&msg, position)?;
            }
        }

        // Record the child on the parent, deliver, and open the frame.
        if let Some(parent) = self.elements.last_mut() {
            parent.children.push(raw_name.clone());
        } else {
            self.seen_root = true;
        }
        let element_content = matches!(
            self.dtd.element(&raw_name).map(|d| &d.content),
            Some(ContentSpec::Children(_))
        );
        self.sink.start_element(&qname, &self.attrs);
        self.elements.push(ElementFrame {
            name: qname,
            entity_depth: self.pipelines.len(),
            ns_decls,
            children: Vec::new(),
            had_text: false,
            had_nonws_text: false,
            element_content,
        });
        self.state = CoreState::Content;
        if self_closing {
            self.close_element(position)?;
        }
        Ok(())
    }

    fn finish_end_tag(&mut self, position: Position) -> Result<()> {
        let name = match self.end_name.take() {
            Some(name) => name,
            None => {
                return Err(Error::Syntax(
                    "End tag without a name".to_string(),
                    position,
                ))
            }
        };
        let expected = match self.elements.last() {
            Some(frame) => frame.name.raw_name().to_string(),
            None => {
                return Err(Error::EndEventMismatch {
                    expected: String::new(),
                    found: name,
                    position,
                })
            }
        };
        if name != expected {
            return Err(Error::EndEventMismatch {
                expected,
                found: name,
                position,
            });
        }
        self.close_element(position)
    }

    /// Shared close path for end tags and self-closing tags.
    fn close_element(&mut self, position: Position) -> Result<()> {
        self.flush_text()?;
        let frame = match self.elements.last() {
            Some(_) => {
                let index = self.elements.len() - 1;
                if self.elements[index].entity_depth != self.pipelines.len() {
                    let name = self.elements[index].name.raw_name().to_string();
                    return Err(Error::EntityBoundary(name, position));
                }
                self.elements.remove(index)
            }
            None => return Ok(()),
        };
        if self.config.validation {
            if let Some(decl) = self.dtd.element(frame.name.raw_name()) {
                if let Some(msg) = check_content(
                    frame.name.raw_name(),
                    &decl.content,
                    &frame.children,
                    frame.had_text,
                    frame.had_nonws_text,
                ) {
                    self.report_validity(&msg, position)?;
                }
            }
        }
        self.sink.end_element(&frame.name);
        if self.config.namespaces {
            for prefix in frame.ns_decls.iter().rev() {
                self.sink.end_prefix_mapping(prefix);
            }
            self.ns.pop();
        }
        self.state = if self.elements.is_empty() {
            CoreState::Epilog
        } else {
            CoreState::Content
        };
        Ok(())
    }
}

/// Materializes the text a token's window refers to; the window is only
/// valid until the buffer is compacted.
fn token_text(tokenizer: &Tokenizer, token: Token) -> Option<String> {
    match token {
        Token::Name(span)
        | Token::Cdata(span)
        | Token::Whitespace(span)
        | Token::GeneralRef(span)
        | Token::ParamRef(span) => Some(tokenizer.text(span).to_string()),
        _ => None,
    }
}

/// Rebuilds the replacement text of an internal entity for re-parsing.
/// Bypassed references reappear in their reference form; resolved
/// character references contribute their character, which the fresh
/// tokenizer may re-interpret as markup exactly as the XML rules demand.
fn replacement_text(pieces: &[ValuePiece]) -> String {
    let mut out = String::new();
    for piece in pieces {
        match piece {
            ValuePiece::Text(text) => out.push_str(text),
            ValuePiece::CharRef(c) => out.push(*c),
            ValuePiece::GeneralRef(name) => {
                out.push('&');
                out.push_str(name);
                out.push(';');
            }
            ValuePiece::ParamRef(name) => {
                out.push('%');
                out.push_str(name);
                out.push(';');
            }
        }
    }
    out
}

fn display_name(frame: &EntityFrame) -> String {
    if frame.name == "[dtd]" {
        frame.name.clone()
    } else if frame.parameter {
        format!("%{}", frame.name)
    } else {
        frame.name.clone()
    }
}
