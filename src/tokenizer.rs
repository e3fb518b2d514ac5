//! The tokenizer: the second stage of the pipeline.
//!
//! A deterministic two-level state machine over the normalized character
//! stream. The coarse [`State`] selects what characters mean; the fine
//! `MiniState` tracks progress through the token in flight. Each step
//! classifies one character, moves to the next mini-state and emits zero,
//! one or two tokens. There is no backtracking: when the buffer runs dry in
//! the middle of a token, the position is rewound to the token start and
//! the next feed retries from scratch, while greedy accumulators flush the
//! partial text they hold.
//!
//! The tokenizer doubles as the locator: it tracks line, column and
//! character offset and remembers where the token in flight started.

use crate::chars::{self, CharClass};
use crate::encoding::XmlVersion;
use crate::errors::{Error, Position, Result};

/// A window into the tokenizer's character buffer.
///
/// Spans are only valid until the owning tokenizer is compacted; consumers
/// materialize the text they need before handing control back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    /// Byte offset of the window start in the active buffer.
    pub start: usize,
    /// Length of the window in bytes.
    pub len: usize,
}

impl Span {
    fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            len: end - start,
        }
    }
}

/// An atomic lexical unit produced by the tokenizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token {
    /// `<` opening a start tag
    Lt,
    /// `</` opening an end tag
    LtSlash,
    /// `>` closing a tag or a markup declaration
    Gt,
    /// `/>` closing an empty-element tag
    SlashGt,
    /// `=` between an attribute name and its value
    Eq,
    /// A name (element, attribute, target, or `#`-prefixed DTD name)
    Name(Span),
    /// A run of character data; greedy, may be split at buffer boundaries
    Cdata(Span),
    /// A run of whitespace between markup in tags and declarations
    Whitespace(Span),
    /// A resolved character reference (`&#10;`, `&#x2028;`)
    CharRef(char),
    /// A resolved predefined entity reference (`&lt;` and friends)
    PredefRef(char),
    /// A general entity reference; the span covers the name
    GeneralRef(Span),
    /// A parameter entity reference; the span covers the name
    ParamRef(Span),
    /// `%` marking a parameter entity declaration
    Percent,
    /// `<!--`
    StartComment,
    /// `-->`
    EndComment,
    /// `<![CDATA[`
    StartCdata,
    /// `]]>` closing a CDATA section
    EndCdata,
    /// `<?`
    StartPi,
    /// `?>`
    EndPi,
    /// `<!DOCTYPE`
    StartDoctype,
    /// `<!ELEMENT`
    StartElementDecl,
    /// `<!ATTLIST`
    StartAttlistDecl,
    /// `<!ENTITY`
    StartEntityDecl,
    /// `<!NOTATION`
    StartNotationDecl,
    /// `<![` in the DTD
    StartConditional,
    /// `]]>` closing a conditional section
    EndConditional,
    /// `[`
    OpenBracket,
    /// `]`
    CloseBracket,
    /// `(`
    OpenParen,
    /// `)`
    CloseParen,
    /// `*`
    Star,
    /// `+`
    Plus,
    /// `?` occurrence indicator
    Question,
    /// `,`
    Comma,
    /// `|`
    Pipe,
    /// Opening quote of an attribute value or DTD literal
    BeginLiteral,
    /// Closing quote of an attribute value or DTD literal
    EndLiteral,
}

/// The quote character delimiting the active literal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quote {
    /// `'`
    Apos,
    /// `"`
    Quot,
}

impl Quote {
    fn as_char(&self) -> char {
        match self {
            Self::Apos => '\'',
            Self::Quot => '"',
        }
    }
}

/// What the quoted literal being scanned contains. The DTD parser arms
/// this right after the `BeginLiteral` token, before any content is
/// scanned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiteralKind {
    /// System or public identifier: no references are recognized
    Raw,
    /// Entity value: character and parameter references are recognized,
    /// general references are left to be resolved later
    EntityValue,
    /// Attribute default value: behaves like an attribute value
    AttrDefault,
}

/// Which conditional section the armed keyword selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionalKind {
    /// `<![INCLUDE[`: contents are part of the DTD
    Include,
    /// `<![IGNORE[`: contents are skipped up to the matching `]]>`
    Ignore,
}

/// Coarse tokenizer state: the parse context that decides what character
/// classes mean and which transitions are legal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Before the root element, between DOCTYPE and root, or after the root
    Prolog,
    /// DOCTYPE head: name and external identifier
    Doctype,
    /// Internal subset between `[` and `]`, or an external subset
    DoctypeInternal,
    /// Quoted literal inside the DTD
    DoctypeQuoted(Quote),
    /// Inside a start or end tag
    Tag,
    /// Element content
    Content,
    /// Quoted attribute value inside a start tag
    AttrValue(Quote),
    /// `<!-- ... -->`
    Comment,
    /// `<![CDATA[ ... ]]>`
    CdataSection,
    /// Target name of a processing instruction
    PiTarget,
    /// Data of a processing instruction
    PiData,
    /// After `<![` in the DTD, before the keyword's `[`
    CondSectKeyword,
    /// Inside an IGNORE section
    CondSectIgnore,
    /// Terminal state after close
    Closed,
}

/// Fine state inside the token being recognized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MiniState {
    /// Between tokens.
    Ready,
    /// A `<` was seen, but nothing else.
    SeenLt,
    /// A `</` was seen, but nothing else.
    SeenLtSlash,
    /// A `<!` was seen. It is unable to understand right now what follows.
    SeenLtBang,
    /// A `<!-` was seen; only a comment can follow.
    SeenLtBangDash,
    /// A `<![` was seen: CDATA in content, a conditional section in the DTD.
    SeenLtBangBracket,
    /// Progress through `CDATA[` after `<![`; the payload counts matched chars.
    CdataKeyword(u8),
    /// Keyword letters after `<!` (DOCTYPE, ELEMENT, ATTLIST, ENTITY, NOTATION).
    AccBangName,
    /// A `&` was seen, but nothing else.
    SeenAmp,
    /// A `&#` was seen: a character reference begins.
    SeenAmpHash,
    /// A `&#x` was seen: a hexadecimal character reference begins.
    SeenAmpHashX,
    /// Digits of a decimal character reference.
    AccCharRefDec,
    /// Digits of a hexadecimal character reference.
    AccCharRefHex,
    /// `&l` seen on the predefined trie.
    AmpL,
    /// `&g` seen on the predefined trie.
    AmpG,
    /// `&a` seen on the predefined trie.
    AmpA,
    /// `&am` seen on the predefined trie.
    AmpAm,
    /// `&ap` seen on the predefined trie.
    AmpAp,
    /// `&apo` seen on the predefined trie.
    AmpApo,
    /// `&q` seen on the predefined trie.
    AmpQ,
    /// `&qu` seen on the predefined trie.
    AmpQu,
    /// `&quo` seen on the predefined trie.
    AmpQuo,
    /// A complete predefined entity name awaiting its `;`.
    SeenPredef(char),
    /// A `%` was seen, but nothing else.
    SeenPercent,
    /// Greedy character-data accumulation; delimiters depend on context.
    AccCdata,
    /// Greedy whitespace accumulation.
    AccWhitespace,
    /// Name accumulation after a name-start character.
    AccName,
    /// General entity name accumulation, awaiting `;`.
    AccEntityName,
    /// Parameter entity name accumulation, awaiting `;`.
    AccParamEntityName,
    /// `#`-prefixed DTD name accumulation.
    AccHashName,
    /// A `-` inside a comment.
    SeenDash,
    /// `--` inside a comment; only `>` may follow.
    SeenDashDash,
    /// A `?` inside processing instruction data.
    SeenQuery,
    /// A `]` that may start `]]>`.
    SeenCloseBracket,
    /// `]]` awaiting `>`.
    SeenCloseBracket2,
    /// A `/` inside a tag; only `>` may follow.
    SeenSlash,
}

/// The tokenizer over one parsed entity.
pub struct Tokenizer {
    buf: String,
    /// Byte index of the next unread character.
    pos: usize,
    /// Byte index where the text of the token in flight begins.
    token_start: usize,
    state: State,
    mini: MiniState,
    version: XmlVersion,
    at_eof: bool,
    initial: State,
    /// Coarse states this entity is allowed to end in.
    eof_states: &'static [State],

    line: u64,
    column: u64,
    offset: u64,
    token_line: u64,
    token_column: u64,
    token_offset: u64,
    /// Coordinates of the most recently consumed character.
    char_start: usize,
    char_line: u64,
    char_column: u64,
    char_offset: u64,

    /// Second token of a two-token emission.
    pending: Option<Token>,
    /// Where to go back to after a comment or processing instruction.
    return_state: State,
    /// Where to go back to after a DTD quoted literal.
    literal_return: State,
    literal_kind: LiteralKind,
    /// Conditional type selected by the keyword, armed by the DTD parser.
    cond_armed: Option<ConditionalKind>,
    /// Open INCLUDE sections.
    include_depth: usize,
    /// Nested `<![` inside an IGNORE section.
    ignore_depth: usize,

    /// Byte index of the pending delimiter suffix (`-`, `]`, `?`) that may
    /// yet turn out to be text.
    suffix_start: usize,
    suffix_line: u64,
    suffix_column: u64,
    suffix_offset: u64,
}

impl Tokenizer {
    /// Creates a tokenizer starting in the given coarse state.
    ///
    /// The document entity starts in [`State::Prolog`], a general entity
    /// expanded in content in [`State::Content`], a parameter entity or
    /// external subset in [`State::DoctypeInternal`].
    pub fn new(initial: State, version: XmlVersion) -> Self {
        let eof_states: &'static [State] = match initial {
            State::Prolog => &[State::Prolog, State::Content],
            State::Content => &[State::Content],
            _ => &[State::DoctypeInternal],
        };
        Self {
            buf: String::new(),
            pos: 0,
            token_start: 0,
            state: initial,
            mini: MiniState::Ready,
            version,
            at_eof: false,
            initial,
            eof_states,
            line: 1,
            column: 1,
            offset: 0,
            token_line: 1,
            token_column: 1,
            token_offset: 0,
            char_start: 0,
            char_line: 1,
            char_column: 1,
            char_offset: 0,
            pending: None,
            return_state: initial,
            literal_return: initial,
            literal_kind: LiteralKind::Raw,
            cond_armed: None,
            include_depth: 0,
            ignore_depth: 0,
            suffix_start: 0,
            suffix_line: 1,
            suffix_column: 1,
            suffix_offset: 0,
        }
    }

    /// The buffer new characters are appended into by the decoder.
    pub fn buffer_mut(&mut self) -> &mut String {
        &mut self.buf
    }

    /// Appends characters to the active buffer.
    pub fn push_str(&mut self, s: &str) {
        self.buf.push_str(s);
    }

    /// Marks the end of this entity's input.
    pub fn set_eof(&mut self) {
        self.at_eof = true;
    }

    /// True once the input end was signalled.
    pub fn at_eof(&self) -> bool {
        self.at_eof
    }

    /// Updates the character range rules; called once the decoder knows
    /// the effective version of the entity.
    pub fn set_version(&mut self, version: XmlVersion) {
        self.version = version;
    }

    /// The current coarse state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Materializes the text of a token window.
    pub fn text(&self, span: Span) -> &str {
        &self.buf[span.start..span.start + span.len]
    }

    /// The current position (end of the last consumed character).
    pub fn position(&self) -> Position {
        Position {
            line: self.line,
            column: self.column,
            offset: self.offset,
        }
    }

    /// The position the token in flight started at.
    pub fn token_position(&self) -> Position {
        Position {
            line: self.token_line,
            column: self.token_column,
            offset: self.token_offset,
        }
    }

    /// Selects what the conditional section opened by the last keyword
    /// contains. Called by the DTD parser once the keyword (possibly
    /// arriving through a parameter entity) is classified.
    pub fn arm_conditional(&mut self, kind: ConditionalKind) {
        self.cond_armed = Some(kind);
    }

    /// Declares what the literal opened by the last `BeginLiteral` holds.
    pub fn set_literal_kind(&mut self, kind: LiteralKind) {
        self.literal_kind = kind;
    }

    /// Drops consumed text from the buffer. Any span handed out earlier is
    /// invalidated; callers materialize token text before this runs.
    pub fn compact(&mut self) {
        let keep = self.token_start.min(self.pos);
        if keep > 0 {
            self.buf.drain(..keep);
            self.pos -= keep;
            self.token_start -= keep;
            if self.suffix_start >= keep {
                self.suffix_start -= keep;
            } else {
                self.suffix_start = 0;
            }
        }
    }

    /// Returns the tokenizer to its fresh state, preserving allocations.
    pub fn reset(&mut self) {
        let initial = self.initial;
        self.buf.clear();
        self.pos = 0;
        self.token_start = 0;
        self.state = initial;
        self.mini = MiniState::Ready;
        self.at_eof = false;
        self.line = 1;
        self.column = 1;
        self.offset = 0;
        self.token_line = 1;
        self.token_column = 1;
        self.token_offset = 0;
        self.pending = None;
        self.return_state = initial;
        self.literal_return = initial;
        self.literal_kind = LiteralKind::Raw;
        self.cond_armed = None;
        self.include_depth = 0;
        self.ignore_depth = 0;
        self.suffix_start = 0;
    }

    /// Produces the next complete token.
    ///
    /// `Ok(None)` means underflow: more characters are needed (or, once
    /// [`set_eof`](Self::set_eof) was called and the state is clean, the
    /// entity is exhausted).
    pub fn next_token(&mut self) -> Result<Option<Token>> {
        loop {
            if let Some(token) = self.pending.take() {
                return Ok(Some(token));
            }
            if self.state == State::Closed {
                return Ok(None);
            }
            match self.mini {
                MiniState::AccCdata => self.skip_text_run()?,
                MiniState::AccWhitespace => self.skip_ws_run(),
                _ => {}
            }
            let c = match self.buf[self.pos..].chars().next() {
                Some(c) => c,
                None => return self.exhausted(),
            };
            self.char_start = self.pos;
            self.char_line = self.line;
            self.char_column = self.column;
            self.char_offset = self.offset;
            self.consume(c);
            if let Some(token) = self.step(c)? {
                return Ok(Some(token));
            }
        }
    }

    #[inline]
    fn consume(&mut self, c: char) {
        self.pos += c.len_utf8();
        self.offset += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
    }

    /// Puts a just-consumed ASCII, non-newline character back.
    fn unread(&mut self, c: char) {
        debug_assert!(c.is_ascii() && c != '\n');
        self.pos -= 1;
        self.offset -= 1;
        self.column -= 1;
    }

    /// Marks the start of a new token at the most recently read character.
    fn start_token_at_current(&mut self, _c: char) {
        self.token_start = self.char_start;
        self.token_line = self.char_line;
        self.token_column = self.char_column;
        self.token_offset = self.char_offset;
    }

    /// Remembers where a delimiter suffix began so an underflow can rewind
    /// to it.
    fn mark_suffix(&mut self, _c: char) {
        self.suffix_start = self.char_start;
        self.suffix_line = self.char_line;
        self.suffix_column = self.char_column;
        self.suffix_offset = self.char_offset;
    }

    /// Greedy scan: advances over plain character data up to the next
    /// context delimiter, validating the character range on the way.
    fn skip_text_run(&mut self) -> Result<()> {
        let bytes = self.buf[self.pos..].as_bytes();
        let stop = match self.state {
            State::Content => memchr::memchr3(b'<', b'&', b']', bytes),
            State::AttrValue(q) => memchr::memchr3(quote_byte(q), b'&', b'<', bytes),
            State::DoctypeQuoted(q) => match self.literal_kind {
                LiteralKind::Raw => memchr::memchr(quote_byte(q), bytes),
                LiteralKind::EntityValue => memchr::memchr3(quote_byte(q), b'&', b'%', bytes),
                LiteralKind::AttrDefault => memchr::memchr3(quote_byte(q), b'&', b'<', bytes),
            },
            State::Comment => memchr::memchr(b'-', bytes),
            State::CdataSection => memchr::memchr(b']', bytes),
            State::PiData => memchr::memchr(b'?', bytes),
            State::CondSectIgnore => memchr::memchr2(b'<', b']', bytes),
            _ => Some(0),
        };
        let end = stop.unwrap_or(bytes.len());
        if end == 0 {
            return Ok(());
        }
        let mut line = self.line;
        let mut column = self.column;
        let mut offset = self.offset;
        let mut illegal = None;
        for c in self.buf[self.pos..self.pos + end].chars() {
            if !chars::is_xml_char(c, self.version) {
                illegal = Some((
                    c,
                    Position {
                        line,
                        column,
                        offset,
                    },
                ));
                break;
            }
            offset += 1;
            if c == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        if let Some((c, position)) = illegal {
            return Err(Error::IllegalChar(c, position));
        }
        self.pos += end;
        self.line = line;
        self.column = column;
        self.offset = offset;
        Ok(())
    }

    fn skip_ws_run(&mut self) {
        loop {
            let c = match self.buf[self.pos..].chars().next() {
                Some(c) if chars::is_whitespace(c) => c,
                _ => break,
            };
            self.consume(c);
        }
    }

    /// One transition of the state machine for the consumed character.
    fn step(&mut self, c: char) -> Result<Option<Token>> {
        use MiniState::*;
        match self.mini {
            Ready => self.ready(c),
            AccCdata => self.text_delimiter(c),
            AccWhitespace => self.end_whitespace(c),
            AccName => self.name_char(c),
            AccHashName => self.hash_name_char(c),
            AccEntityName => self.entity_name_char(c),
            AccParamEntityName => self.param_entity_name_char(c),
            AccBangName => self.bang_name_char(c),
            SeenLt => self.seen_lt(c),
            SeenLtSlash => self.seen_lt_slash(c),
            SeenLtBang => self.seen_lt_bang(c),
            SeenLtBangDash => match c {
                '-' => {
                    self.return_state = self.state;
                    self.state = State::Comment;
                    self.begin_text();
                    Ok(Some(Token::StartComment))
                }
                _ => Err(self.syntax("Invalid markup after '<!-'")),
            },
            SeenLtBangBracket => self.seen_lt_bang_bracket(c),
            CdataKeyword(n) => self.cdata_keyword(c, n),
            SeenAmp => self.seen_amp(c),
            SeenAmpHash => match c {
                'x' => self.move_to(SeenAmpHashX),
                '0'..='9' => self.move_to(AccCharRefDec),
                _ => Err(self.syntax("Invalid character reference")),
            },
            SeenAmpHashX => match c {
                '0'..='9' | 'a'..='f' | 'A'..='F' => self.move_to(AccCharRefHex),
                _ => Err(self.syntax("Invalid character reference")),
            },
            AccCharRefDec => match c {
                '0'..='9' => Ok(None),
                ';' => self.end_char_ref(10),
                _ => Err(self.syntax("Invalid character reference")),
            },
            AccCharRefHex => match c {
                '0'..='9' | 'a'..='f' | 'A'..='F' => Ok(None),
                ';' => self.end_char_ref(16),
                _ => Err(self.syntax("Invalid character reference")),
            },
            AmpL => self.trie(c, 't', SeenPredef('<')),
            AmpG => self.trie(c, 't', SeenPredef('>')),
            AmpA => match c {
                'm' => self.move_to(AmpAm),
                'p' => self.move_to(AmpAp),
                _ => self.trie_divert(c),
            },
            AmpAm => self.trie(c, 'p', SeenPredef('&')),
            AmpAp => self.trie(c, 'o', AmpApo),
            AmpApo => self.trie(c, 's', SeenPredef('\'')),
            AmpQ => self.trie(c, 'u', AmpQu),
            AmpQu => self.trie(c, 'o', AmpQuo),
            AmpQuo => self.trie(c, 't', SeenPredef('"')),
            SeenPredef(ch) => match c {
                ';' => {
                    self.resume_after_reference();
                    Ok(Some(Token::PredefRef(ch)))
                }
                c if chars::is_name_char(c) => self.move_to(AccEntityName),
                _ => Err(self.syntax("Invalid entity reference")),
            },
            SeenPercent => self.seen_percent(c),
            SeenDash => match c {
                '-' => self.move_to(SeenDashDash),
                c if chars::is_xml_char(c, self.version) => self.move_to(AccCdata),
                _ => Err(Error::IllegalChar(c, self.position())),
            },
            SeenDashDash => match c {
                '>' => {
                    let text = self.take_text(self.suffix_start);
                    self.state = self.return_state;
                    self.mini = Ready;
                    Ok(Some(self.with_pending(text, Token::EndComment)))
                }
                _ => Err(self.syntax("'--' is not allowed inside comments")),
            },
            SeenQuery => match c {
                '>' => {
                    let text = self.take_text(self.suffix_start);
                    self.state = self.return_state;
                    self.mini = Ready;
                    Ok(Some(self.with_pending(text, Token::EndPi)))
                }
                '?' => {
                    self.mark_suffix(c);
                    Ok(None)
                }
                c if chars::is_xml_char(c, self.version) => self.move_to(AccCdata),
                _ => Err(Error::IllegalChar(c, self.position())),
            },
            SeenCloseBracket => self.seen_close_bracket(c),
            SeenCloseBracket2 => self.seen_close_bracket2(c),
            SeenSlash => match c {
                '>' => {
                    self.state = State::Content;
                    self.mini = Ready;
                    Ok(Some(Token::SlashGt))
                }
                _ => Err(self.syntax("Expected '>' after '/' in tag")),
            },
        }
    }

    fn ready(&mut self, c: char) -> Result<Option<Token>> {
        self.start_token_at_current(c);
        match self.state {
            State::Prolog => match chars::classify(c, self.version) {
                CharClass::Whitespace => self.move_to(MiniState::AccWhitespace),
                CharClass::Lt => self.move_to(MiniState::SeenLt),
                CharClass::Illegal => Err(Error::IllegalChar(c, self.position())),
                _ => Err(self.syntax("Content is not allowed in prolog")),
            },
            State::Content => match c {
                '<' => self.move_to(MiniState::SeenLt),
                '&' => self.move_to(MiniState::SeenAmp),
                ']' => {
                    self.mark_suffix(c);
                    self.move_to(MiniState::SeenCloseBracket)
                }
                c if chars::is_xml_char(c, self.version) => self.move_to(MiniState::AccCdata),
                _ => Err(Error::IllegalChar(c, self.position())),
            },
            State::Tag => match chars::classify(c, self.version) {
                CharClass::Whitespace => self.move_to(MiniState::AccWhitespace),
                CharClass::NameStart => self.move_to(MiniState::AccName),
                CharClass::Gt => {
                    self.state = State::Content;
                    Ok(Some(Token::Gt))
                }
                CharClass::Slash => self.move_to(MiniState::SeenSlash),
                CharClass::Eq => Ok(Some(Token::Eq)),
                CharClass::Apos => self.begin_attr_value(Quote::Apos),
                CharClass::Quot => self.begin_attr_value(Quote::Quot),
                CharClass::Illegal => Err(Error::IllegalChar(c, self.position())),
                _ => Err(self.syntax("Unexpected character in tag")),
            },
            State::PiTarget => match chars::classify(c, self.version) {
                CharClass::NameStart => self.move_to(MiniState::AccName),
                _ => Err(self.syntax("Invalid processing instruction target")),
            },
            State::PiData => match c {
                '?' => {
                    self.mark_suffix(c);
                    self.move_to(MiniState::SeenQuery)
                }
                c if chars::is_xml_char(c, self.version) => self.move_to(MiniState::AccCdata),
                _ => Err(Error::IllegalChar(c, self.position())),
            },
            State::Doctype => match chars::classify(c, self.version) {
                CharClass::Whitespace => self.move_to(MiniState::AccWhitespace),
                CharClass::NameStart => self.move_to(MiniState::AccName),
                CharClass::Apos => self.begin_dtd_literal(Quote::Apos),
                CharClass::Quot => self.begin_dtd_literal(Quote::Quot),
                CharClass::OpenBracket => {
                    self.state = State::DoctypeInternal;
                    Ok(Some(Token::OpenBracket))
                }
                CharClass::Gt => {
                    self.state = State::Prolog;
                    Ok(Some(Token::Gt))
                }
                _ => Err(self.syntax("Unexpected character in DOCTYPE")),
            },
            State::DoctypeInternal => match chars::classify(c, self.version) {
                CharClass::Whitespace => self.move_to(MiniState::AccWhitespace),
                CharClass::Lt => self.move_to(MiniState::SeenLt),
                CharClass::Percent => self.move_to(MiniState::SeenPercent),
                CharClass::NameStart => self.move_to(MiniState::AccName),
                // Enumerated attribute values are Nmtokens, which may start
                // with characters that cannot start a Name.
                CharClass::Digit | CharClass::NameCont | CharClass::Dash => {
                    self.move_to(MiniState::AccName)
                }
                CharClass::Hash => self.move_to(MiniState::AccHashName),
                CharClass::CloseBracket => {
                    if self.include_depth > 0 {
                        self.mark_suffix(c);
                        self.move_to(MiniState::SeenCloseBracket)
                    } else {
                        self.state = State::Doctype;
                        Ok(Some(Token::CloseBracket))
                    }
                }
                CharClass::OpenParen => Ok(Some(Token::OpenParen)),
                CharClass::CloseParen => Ok(Some(Token::CloseParen)),
                CharClass::Star => Ok(Some(Token::Star)),
                CharClass::Plus => Ok(Some(Token::Plus)),
                CharClass::Query => Ok(Some(Token::Question)),
                CharClass::Comma => Ok(Some(Token::Comma)),
                CharClass::Pipe => Ok(Some(Token::Pipe)),
                CharClass::Gt => Ok(Some(Token::Gt)),
                CharClass::Apos => self.begin_dtd_literal(Quote::Apos),
                CharClass::Quot => self.begin_dtd_literal(Quote::Quot),
                CharClass::Illegal => Err(Error::IllegalChar(c, self.position())),
                _ => Err(self.syntax("Unexpected character in DTD")),
            },
            State::CondSectKeyword => match chars::classify(c, self.version) {
                CharClass::Whitespace => self.move_to(MiniState::AccWhitespace),
                CharClass::NameStart => self.move_to(MiniState::AccName),
                CharClass::Percent => self.move_to(MiniState::SeenPercent),
                CharClass::OpenBracket => match self.cond_armed.take() {
                    Some(ConditionalKind::Include) => {
                        self.include_depth += 1;
                        self.state = State::DoctypeInternal;
                        Ok(Some(Token::OpenBracket))
                    }
                    Some(ConditionalKind::Ignore) => {
                        self.ignore_depth = 0;
                        self.state = State::CondSectIgnore;
                        self.begin_text();
                        Ok(Some(Token::OpenBracket))
                    }
                    None => Err(self.syntax("Conditional section requires INCLUDE or IGNORE")),
                },
                _ => Err(self.syntax("Unexpected character in conditional section")),
            },
            // Reached after a token-boundary rewind inside the construct;
            // the character may itself be a delimiter, so it goes through
            // the same dispatch the greedy scan uses.
            State::CondSectIgnore
            | State::AttrValue(_)
            | State::DoctypeQuoted(_)
            | State::Comment
            | State::CdataSection => {
                if !chars::is_xml_char(c, self.version) && self.state != State::CondSectIgnore {
                    return Err(Error::IllegalChar(c, self.position()));
                }
                self.mini = MiniState::AccCdata;
                self.text_delimiter(c)
            }
            State::Closed => Ok(None),
        }
    }

    fn begin_attr_value(&mut self, q: Quote) -> Result<Option<Token>> {
        self.state = State::AttrValue(q);
        self.begin_text();
        Ok(Some(Token::BeginLiteral))
    }

    fn begin_dtd_literal(&mut self, q: Quote) -> Result<Option<Token>> {
        self.literal_return = self.state;
        self.literal_kind = LiteralKind::Raw;
        self.state = State::DoctypeQuoted(q);
        self.begin_text();
        Ok(Some(Token::BeginLiteral))
    }

    /// Starts accumulating text at the current position.
    fn begin_text(&mut self) {
        self.mini = MiniState::AccCdata;
        self.token_start = self.pos;
        self.token_line = self.line;
        self.token_column = self.column;
        self.token_offset = self.offset;
    }

    #[inline]
    fn move_to(&mut self, mini: MiniState) -> Result<Option<Token>> {
        self.mini = mini;
        Ok(None)
    }

    fn syntax(&self, msg: &str) -> Error {
        Error::Syntax(msg.to_string(), self.position())
    }

    /// Emits the accumulated text up to `end`, if any, and resets the text
    /// window. Returns `None` for an empty window.
    fn take_text(&mut self, end: usize) -> Option<Token> {
        let start = self.token_start;
        self.token_start = self.pos;
        if end <= start || self.state == State::CondSectIgnore {
            None
        } else {
            Some(Token::Cdata(Span::new(start, end)))
        }
    }

    /// Returns `first` with `second` queued, or just `second`.
    fn with_pending(&mut self, first: Option<Token>, second: Token) -> Token {
        match first {
            Some(token) => {
                self.pending = Some(second);
                token
            }
            None => second,
        }
    }

    /// Handles the delimiter a greedy text scan stopped at.
    fn text_delimiter(&mut self, c: char) -> Result<Option<Token>> {
        let end = self.pos - c.len_utf8();
        match self.state {
            State::Content => match c {
                '<' => {
                    let text = self.take_text(end);
                    self.mini = MiniState::SeenLt;
                    self.start_token_at_current(c);
                    Ok(text)
                }
                '&' => {
                    let text = self.take_text(end);
                    self.mini = MiniState::SeenAmp;
                    self.start_token_at_current(c);
                    Ok(text)
                }
                ']' => {
                    self.mark_suffix(c);
                    self.move_to(MiniState::SeenCloseBracket)
                }
                _ => Ok(None),
            },
            State::AttrValue(q) => match c {
                c if c == q.as_char() => {
                    let text = self.take_text(end);
                    self.state = State::Tag;
                    self.mini = MiniState::Ready;
                    Ok(Some(self.with_pending(text, Token::EndLiteral)))
                }
                '&' => {
                    let text = self.take_text(end);
                    self.mini = MiniState::SeenAmp;
                    self.start_token_at_current(c);
                    Ok(text)
                }
                '<' => Err(self.syntax("'<' is not allowed in attribute values")),
                _ => Ok(None),
            },
            State::DoctypeQuoted(q) => match c {
                c if c == q.as_char() => {
                    let text = self.take_text(end);
                    self.state = self.literal_return;
                    self.mini = MiniState::Ready;
                    Ok(Some(self.with_pending(text, Token::EndLiteral)))
                }
                '&' if self.literal_kind != LiteralKind::Raw => {
                    let text = self.take_text(end);
                    self.mini = MiniState::SeenAmp;
                    self.start_token_at_current(c);
                    Ok(text)
                }
                '%' if self.literal_kind == LiteralKind::EntityValue => {
                    let text = self.take_text(end);
                    self.mini = MiniState::SeenPercent;
                    self.start_token_at_current(c);
                    Ok(text)
                }
                '<' if self.literal_kind == LiteralKind::AttrDefault => {
                    Err(self.syntax("'<' is not allowed in attribute values"))
                }
                _ => Ok(None),
            },
            State::Comment => match c {
                '-' => {
                    self.mark_suffix(c);
                    self.move_to(MiniState::SeenDash)
                }
                _ => Ok(None),
            },
            State::CdataSection => match c {
                ']' => {
                    self.mark_suffix(c);
                    self.move_to(MiniState::SeenCloseBracket)
                }
                _ => Ok(None),
            },
            State::PiData => match c {
                '?' => {
                    self.mark_suffix(c);
                    self.move_to(MiniState::SeenQuery)
                }
                _ => Ok(None),
            },
            State::CondSectIgnore => match c {
                '<' => self.move_to(MiniState::SeenLt),
                ']' => {
                    self.mark_suffix(c);
                    self.move_to(MiniState::SeenCloseBracket)
                }
                _ => Ok(None),
            },
            _ => Err(self.syntax("Unexpected character")),
        }
    }

    fn end_whitespace(&mut self, c: char) -> Result<Option<Token>> {
        let end = self.pos - c.len_utf8();
        let span = Span::new(self.token_start, end);
        let token = match self.state {
            State::Tag | State::Doctype | State::DoctypeInternal | State::CondSectKeyword
                if span.len > 0 =>
            {
                Some(Token::Whitespace(span))
            }
            _ => None,
        };
        self.mini = MiniState::Ready;
        // The delimiting character itself belongs to the next token.
        let next = self.redispatch(c)?;
        debug_assert!(self.pending.is_none() || next.is_none());
        match token {
            Some(ws) => {
                if let Some(next) = next {
                    self.pending = Some(next);
                }
                Ok(Some(ws))
            }
            None => Ok(next),
        }
    }

    /// Re-dispatches an already consumed character through the `Ready`
    /// transitions.
    fn redispatch(&mut self, c: char) -> Result<Option<Token>> {
        self.ready(c)
    }

    fn seen_lt(&mut self, c: char) -> Result<Option<Token>> {
        if self.state == State::CondSectIgnore {
            return match c {
                '!' => self.move_to(MiniState::SeenLtBang),
                '<' => Ok(None),
                _ => self.move_to(MiniState::AccCdata),
            };
        }
        match c {
            '/' if self.state == State::Content || self.state == State::Prolog => {
                self.move_to(MiniState::SeenLtSlash)
            }
            '!' => self.move_to(MiniState::SeenLtBang),
            '?' => {
                self.return_state = self.state;
                self.state = State::PiTarget;
                self.mini = MiniState::Ready;
                Ok(Some(Token::StartPi))
            }
            c if chars::is_name_start(c)
                && (self.state == State::Content || self.state == State::Prolog) =>
            {
                self.state = State::Tag;
                self.mini = MiniState::AccName;
                self.start_token_at_current(c);
                Ok(Some(Token::Lt))
            }
            _ => Err(self.syntax("Invalid markup after '<'")),
        }
    }

    fn seen_lt_slash(&mut self, c: char) -> Result<Option<Token>> {
        if chars::is_name_start(c) {
            self.state = State::Tag;
            self.mini = MiniState::AccName;
            self.start_token_at_current(c);
            Ok(Some(Token::LtSlash))
        } else {
            Err(self.syntax("Invalid end tag"))
        }
    }

    fn seen_lt_bang(&mut self, c: char) -> Result<Option<Token>> {
        if self.state == State::CondSectIgnore {
            return match c {
                '[' => {
                    self.ignore_depth += 1;
                    self.move_to(MiniState::AccCdata)
                }
                '<' => self.move_to(MiniState::SeenLt),
                _ => self.move_to(MiniState::AccCdata),
            };
        }
        match c {
            '-' => self.move_to(MiniState::SeenLtBangDash),
            '[' if self.state == State::Content || self.state == State::DoctypeInternal => {
                self.move_to(MiniState::SeenLtBangBracket)
            }
            c if c.is_ascii_uppercase()
                && (self.state == State::Prolog || self.state == State::DoctypeInternal) =>
            {
                self.move_to(MiniState::AccBangName)
            }
            c if c.is_ascii_alphabetic() => {
                // Catch miscased keywords with a useful message.
                self.move_to(MiniState::AccBangName)
            }
            _ => Err(self.syntax("Invalid markup declaration")),
        }
    }

    fn seen_lt_bang_bracket(&mut self, c: char) -> Result<Option<Token>> {
        match self.state {
            State::Content => match c {
                'C' => self.move_to(MiniState::CdataKeyword(1)),
                _ => Err(self.syntax("Invalid CDATA section start")),
            },
            State::DoctypeInternal => {
                self.cond_armed = None;
                self.state = State::CondSectKeyword;
                self.mini = MiniState::Ready;
                let next = self.ready(c)?;
                debug_assert!(self.pending.is_none() || next.is_none());
                if next.is_some() {
                    self.pending = next;
                }
                Ok(Some(Token::StartConditional))
            }
            _ => Err(self.syntax("Invalid markup declaration")),
        }
    }

    fn cdata_keyword(&mut self, c: char, n: u8) -> Result<Option<Token>> {
        const KEYWORD: &[u8] = b"CDATA[";
        if c as u32 == KEYWORD[n as usize] as u32 {
            if n as usize + 1 == KEYWORD.len() {
                self.state = State::CdataSection;
                self.begin_text();
                Ok(Some(Token::StartCdata))
            } else {
                self.move_to(MiniState::CdataKeyword(n + 1))
            }
        } else {
            Err(self.syntax("Invalid CDATA section start"))
        }
    }

    fn bang_name_char(&mut self, c: char) -> Result<Option<Token>> {
        if c.is_ascii_alphabetic() {
            return Ok(None);
        }
        // The keyword spans from after `<!` up to this terminator.
        let name_start = self.token_start + 2;
        let name_end = self.pos - c.len_utf8();
        let (token, expected) = {
            let name = &self.buf[name_start..name_end];
            match name {
                "DOCTYPE" if self.state == State::Prolog => (Some(Token::StartDoctype), "DOCTYPE"),
                "ELEMENT" if self.state == State::DoctypeInternal => {
                    (Some(Token::StartElementDecl), "ELEMENT")
                }
                "ATTLIST" if self.state == State::DoctypeInternal => {
                    (Some(Token::StartAttlistDecl), "ATTLIST")
                }
                "ENTITY" if self.state == State::DoctypeInternal => {
                    (Some(Token::StartEntityDecl), "ENTITY")
                }
                "NOTATION" if self.state == State::DoctypeInternal => {
                    (Some(Token::StartNotationDecl), "NOTATION")
                }
                _ => {
                    let expected = ["DOCTYPE", "ELEMENT", "ATTLIST", "ENTITY", "NOTATION"]
                        .iter()
                        .find(|k| name.eq_ignore_ascii_case(k))
                        .copied();
                    match expected {
                        Some(expected) if !name.eq(expected) => (None, expected),
                        _ => {
                            return Err(self.syntax("Unknown markup declaration"));
                        }
                    }
                }
            }
        };
        let token = match token {
            Some(token) => token,
            None => {
                let found = self.buf[name_start..name_end].to_string();
                return Err(Error::KeywordCase {
                    expected,
                    found,
                    position: self.token_position(),
                });
            }
        };
        if !chars::is_whitespace(c) {
            return Err(self.syntax("Whitespace required after markup declaration keyword"));
        }
        if token == Token::StartDoctype {
            self.state = State::Doctype;
        }
        self.mini = MiniState::AccWhitespace;
        self.token_start = name_end;
        Ok(Some(token))
    }

    fn seen_amp(&mut self, c: char) -> Result<Option<Token>> {
        // Inside entity values the predefined names are bypassed like any
        // other general entity, so the trie is skipped.
        let in_entity_value = matches!(self.state, State::DoctypeQuoted(_))
            && self.literal_kind == LiteralKind::EntityValue;
        match c {
            '#' => self.move_to(MiniState::SeenAmpHash),
            c if in_entity_value && chars::is_name_start(c) => {
                self.move_to(MiniState::AccEntityName)
            }
            'l' => self.move_to(MiniState::AmpL),
            'g' => self.move_to(MiniState::AmpG),
            'a' => self.move_to(MiniState::AmpA),
            'q' => self.move_to(MiniState::AmpQ),
            c if chars::is_name_start(c) => self.move_to(MiniState::AccEntityName),
            _ => Err(self.syntax("Invalid entity reference")),
        }
    }

    /// One step on the predefined entity trie.
    fn trie(&mut self, c: char, expect: char, next: MiniState) -> Result<Option<Token>> {
        if c == expect {
            self.move_to(next)
        } else {
            self.trie_divert(c)
        }
    }

    /// Leaves the predefined trie: the name turned out to be an ordinary
    /// general entity name.
    fn trie_divert(&mut self, c: char) -> Result<Option<Token>> {
        match c {
            ';' => self.end_general_ref(),
            c if chars::is_name_char(c) => self.move_to(MiniState::AccEntityName),
            _ => Err(self.syntax("Invalid entity reference")),
        }
    }

    fn entity_name_char(&mut self, c: char) -> Result<Option<Token>> {
        match c {
            ';' => self.end_general_ref(),
            c if chars::is_name_char(c) => Ok(None),
            _ => Err(self.syntax("Entity reference must end with ';'")),
        }
    }

    fn end_general_ref(&mut self) -> Result<Option<Token>> {
        // Window between `&` and `;`.
        let span = Span::new(self.token_start + 1, self.pos - 1);
        self.resume_after_reference();
        Ok(Some(Token::GeneralRef(span)))
    }

    fn param_entity_name_char(&mut self, c: char) -> Result<Option<Token>> {
        match c {
            ';' => {
                let span = Span::new(self.token_start + 1, self.pos - 1);
                self.resume_after_reference();
                Ok(Some(Token::ParamRef(span)))
            }
            c if chars::is_name_char(c) => Ok(None),
            _ => Err(self.syntax("Parameter entity reference must end with ';'")),
        }
    }

    fn seen_percent(&mut self, c: char) -> Result<Option<Token>> {
        match self.state {
            State::DoctypeInternal | State::CondSectKeyword => match c {
                c if chars::is_name_start(c) => self.move_to(MiniState::AccParamEntityName),
                c if chars::is_whitespace(c) => {
                    // `<!ENTITY % name ...>`: a bare percent marks a
                    // parameter entity declaration.
                    self.mini = MiniState::AccWhitespace;
                    self.token_start = self.pos - c.len_utf8();
                    Ok(Some(Token::Percent))
                }
                _ => Err(self.syntax("Invalid parameter entity reference")),
            },
            _ => match c {
                c if chars::is_name_start(c) => self.move_to(MiniState::AccParamEntityName),
                _ => Err(self.syntax("Invalid parameter entity reference")),
            },
        }
    }

    /// The reference is complete; text accumulation continues behind it.
    fn resume_after_reference(&mut self) {
        match self.state {
            State::Content | State::AttrValue(_) | State::DoctypeQuoted(_) => {
                self.begin_text();
            }
            _ => {
                self.mini = MiniState::Ready;
                self.token_start = self.pos;
            }
        }
    }

    fn end_char_ref(&mut self, radix: u32) -> Result<Option<Token>> {
        let digits_start = self.token_start + if radix == 16 { 3 } else { 2 };
        let digits = &self.buf[digits_start..self.pos - 1];
        let mut value: u32 = 0;
        for d in digits.chars() {
            let digit = d.to_digit(radix).unwrap_or(0);
            value = match value.checked_mul(radix).and_then(|v| v.checked_add(digit)) {
                Some(v) if v <= 0x0010_FFFF => v,
                _ => {
                    return Err(Error::Syntax(
                        format!("Character reference out of range: {}", digits),
                        self.token_position(),
                    ))
                }
            };
        }
        if !chars::is_char_ref_value(value, self.version) {
            return Err(Error::Syntax(
                format!("Invalid character reference value: #{}", value),
                self.token_position(),
            ));
        }
        let c = match ::std::char::from_u32(value) {
            Some(c) => c,
            None => {
                return Err(Error::Syntax(
                    format!("Invalid character reference value: #{}", value),
                    self.token_position(),
                ))
            }
        };
        let in_attr = matches!(self.state, State::AttrValue(_))
            || (matches!(self.state, State::DoctypeQuoted(_))
                && self.literal_kind == LiteralKind::AttrDefault);
        if in_attr && c == '<' {
            return Err(Error::Syntax(
                "'<' is not allowed in attribute values, even by character reference".to_string(),
                self.token_position(),
            ));
        }
        self.resume_after_reference();
        Ok(Some(Token::CharRef(c)))
    }

    fn name_char(&mut self, c: char) -> Result<Option<Token>> {
        if chars::is_name_char(c) {
            return Ok(None);
        }
        let end = self.pos - c.len_utf8();
        let name = Token::Name(Span::new(self.token_start, end));
        match self.state {
            State::Tag => match c {
                c if chars::is_whitespace(c) => {
                    self.mini = MiniState::AccWhitespace;
                    self.token_start = end + 1;
                    Ok(Some(name))
                }
                '>' => {
                    self.state = State::Content;
                    self.mini = MiniState::Ready;
                    Ok(Some(self.with_pending(Some(name), Token::Gt)))
                }
                '/' => {
                    self.mini = MiniState::SeenSlash;
                    Ok(Some(name))
                }
                '=' => {
                    self.mini = MiniState::Ready;
                    Ok(Some(self.with_pending(Some(name), Token::Eq)))
                }
                '\'' => self.name_then_literal(name, Quote::Apos),
                '"' => self.name_then_literal(name, Quote::Quot),
                _ => Err(self.syntax("Unexpected character in tag")),
            },
            State::PiTarget => {
                {
                    let target = &self.buf[self.token_start..end];
                    if target.eq_ignore_ascii_case("xml") {
                        return Err(Error::Syntax(
                            "Processing instruction target 'xml' is reserved".to_string(),
                            self.token_position(),
                        ));
                    }
                }
                self.state = State::PiData;
                match c {
                    c if chars::is_whitespace(c) => {
                        self.mini = MiniState::AccWhitespace;
                        self.token_start = end + 1;
                        Ok(Some(name))
                    }
                    '?' => {
                        self.mark_suffix(c);
                        self.mini = MiniState::SeenQuery;
                        self.token_start = end + 1;
                        Ok(Some(name))
                    }
                    _ => Err(self.syntax("Invalid processing instruction target")),
                }
            }
            State::Doctype | State::DoctypeInternal | State::CondSectKeyword => {
                self.end_dtd_name(name, c)
            }
            _ => Err(self.syntax("Unexpected name")),
        }
    }

    fn name_then_literal(&mut self, name: Token, q: Quote) -> Result<Option<Token>> {
        self.state = State::AttrValue(q);
        self.begin_text();
        Ok(Some(self.with_pending(Some(name), Token::BeginLiteral)))
    }

    /// Terminates a name in DOCTYPE context. Keyword classification is
    /// performed by the DTD parser, which knows where keywords may occur.
    fn end_dtd_name(&mut self, name: Token, c: char) -> Result<Option<Token>> {
        let end = match name {
            Token::Name(span) => span.start + span.len,
            _ => self.pos,
        };
        match c {
            c if chars::is_whitespace(c) => {
                self.mini = MiniState::AccWhitespace;
                self.token_start = end + 1;
                Ok(Some(name))
            }
            '[' if self.state == State::CondSectKeyword => {
                // Keyword handled by the parser before the bracket decides
                // which section we enter.
                self.mini = MiniState::Ready;
                self.unread(c);
                Ok(Some(name))
            }
            '[' if self.state == State::Doctype => {
                self.state = State::DoctypeInternal;
                self.mini = MiniState::Ready;
                Ok(Some(self.with_pending(Some(name), Token::OpenBracket)))
            }
            '>' => {
                if self.state == State::Doctype {
                    self.state = State::Prolog;
                }
                self.mini = MiniState::Ready;
                Ok(Some(self.with_pending(Some(name), Token::Gt)))
            }
            '(' => self.name_then(name, Token::OpenParen),
            ')' => self.name_then(name, Token::CloseParen),
            '|' => self.name_then(name, Token::Pipe),
            ',' => self.name_then(name, Token::Comma),
            '*' => self.name_then(name, Token::Star),
            '+' => self.name_then(name, Token::Plus),
            '?' => self.name_then(name, Token::Question),
            ']' if self.state == State::DoctypeInternal && self.include_depth == 0 => {
                self.state = State::Doctype;
                self.mini = MiniState::Ready;
                Ok(Some(self.with_pending(Some(name), Token::CloseBracket)))
            }
            '%' => {
                self.mini = MiniState::SeenPercent;
                self.token_start = end;
                Ok(Some(name))
            }
            '\'' => {
                let lit = self.begin_dtd_literal(Quote::Apos)?;
                self.pending = lit;
                Ok(Some(name))
            }
            '"' => {
                let lit = self.begin_dtd_literal(Quote::Quot)?;
                self.pending = lit;
                Ok(Some(name))
            }
            _ => Err(self.syntax("Unexpected character in DTD")),
        }
    }

    fn name_then(&mut self, name: Token, token: Token) -> Result<Option<Token>> {
        self.mini = MiniState::Ready;
        Ok(Some(self.with_pending(Some(name), token)))
    }

    fn hash_name_char(&mut self, c: char) -> Result<Option<Token>> {
        if chars::is_name_char(c) {
            return Ok(None);
        }
        if self.pos - c.len_utf8() == self.token_start + 1 {
            return Err(self.syntax("Expected a name after '#'"));
        }
        let name = Token::Name(Span::new(self.token_start, self.pos - c.len_utf8()));
        self.end_dtd_name(name, c)
    }

    fn seen_close_bracket(&mut self, c: char) -> Result<Option<Token>> {
        match c {
            ']' => self.move_to(MiniState::SeenCloseBracket2),
            _ => match self.state {
                State::Content | State::CdataSection | State::CondSectIgnore
                    if chars::is_xml_char(c, self.version) =>
                {
                    self.move_to(MiniState::AccCdata)
                }
                State::Content | State::CdataSection | State::CondSectIgnore => {
                    Err(Error::IllegalChar(c, self.position()))
                }
                _ => Err(self.syntax("Expected ']]>'")),
            },
        }
    }

    fn seen_close_bracket2(&mut self, c: char) -> Result<Option<Token>> {
        match self.state {
            State::CdataSection => match c {
                '>' => {
                    let text = self.take_text(self.suffix_start);
                    self.state = State::Content;
                    self.mini = MiniState::Ready;
                    Ok(Some(self.with_pending(text, Token::EndCdata)))
                }
                ']' => {
                    // The leftmost bracket is ordinary data.
                    self.suffix_start += 1;
                    Ok(None)
                }
                c if chars::is_xml_char(c, self.version) => self.move_to(MiniState::AccCdata),
                _ => Err(Error::IllegalChar(c, self.position())),
            },
            State::Content => match c {
                '>' => Err(self.syntax("']]>' is not allowed in content")),
                ']' => {
                    self.suffix_start += 1;
                    Ok(None)
                }
                c if chars::is_xml_char(c, self.version) => self.move_to(MiniState::AccCdata),
                _ => Err(Error::IllegalChar(c, self.position())),
            },
            State::DoctypeInternal => match c {
                '>' => {
                    self.include_depth -= 1;
                    self.mini = MiniState::Ready;
                    Ok(Some(Token::EndConditional))
                }
                _ => Err(self.syntax("Expected ']]>'")),
            },
            State::CondSectIgnore => match c {
                '>' => {
                    if self.ignore_depth == 0 {
                        self.state = State::DoctypeInternal;
                        self.mini = MiniState::Ready;
                        Ok(Some(Token::EndConditional))
                    } else {
                        self.ignore_depth -= 1;
                        self.move_to(MiniState::AccCdata)
                    }
                }
                ']' => Ok(None),
                _ => self.move_to(MiniState::AccCdata),
            },
            _ => Err(self.syntax("Expected ']]>'")),
        }
    }

    /// The buffer ran dry. Greedy accumulators flush, suffix states rewind
    /// to the suffix, everything else rewinds to the token start so the
    /// next feed retries from scratch.
    fn exhausted(&mut self) -> Result<Option<Token>> {
        use MiniState::*;
        match self.mini {
            AccCdata => {
                if let Some(token) = self.take_text(self.pos) {
                    return Ok(Some(token));
                }
            }
            AccWhitespace => {
                let span = Span::new(self.token_start, self.pos);
                self.token_start = self.pos;
                if span.len > 0 {
                    match self.state {
                        State::Tag
                        | State::Doctype
                        | State::DoctypeInternal
                        | State::CondSectKeyword => return Ok(Some(Token::Whitespace(span))),
                        _ => {}
                    }
                }
            }
            SeenDash | SeenDashDash | SeenQuery | SeenCloseBracket | SeenCloseBracket2 => {
                if self.at_eof {
                    // No more input can complete the delimiter, so its
                    // characters are ordinary text.
                    let flushed = self.take_text(self.pos);
                    self.mini = AccCdata;
                    if let Some(token) = flushed {
                        return Ok(Some(token));
                    }
                } else {
                    // Flush text before the suffix, then re-scan the suffix
                    // on the next feed.
                    let flushed = self.take_text(self.suffix_start);
                    self.pos = self.suffix_start;
                    self.token_start = self.suffix_start;
                    self.line = self.suffix_line;
                    self.column = self.suffix_column;
                    self.offset = self.suffix_offset;
                    self.token_line = self.suffix_line;
                    self.token_column = self.suffix_column;
                    self.token_offset = self.suffix_offset;
                    self.mini = AccCdata;
                    if let Some(token) = flushed {
                        return Ok(Some(token));
                    }
                    return Ok(None);
                }
            }
            Ready => {}
            _ => {
                if !self.at_eof {
                    // Token-boundary resumption: rewind and retry on the
                    // next feed.
                    self.pos = self.token_start;
                    self.line = self.token_line;
                    self.column = self.token_column;
                    self.offset = self.token_offset;
                    self.mini = Ready;
                    return Ok(None);
                }
            }
        }
        if !self.at_eof {
            return Ok(None);
        }
        if self.mini != Ready && !matches!(self.mini, AccCdata | AccWhitespace) {
            return Err(self.eof_error());
        }
        if self.include_depth > 0 || !self.eof_states.contains(&self.state) {
            return Err(self.eof_error());
        }
        self.state = State::Closed;
        Ok(None)
    }

    fn eof_error(&self) -> Error {
        let construct = match self.state {
            State::Comment => "Comment",
            State::CdataSection => "CData",
            State::PiTarget | State::PiData => "ProcessingInstruction",
            State::Doctype
            | State::DoctypeInternal
            | State::DoctypeQuoted(_)
            | State::CondSectKeyword
            | State::CondSectIgnore => "DOCTYPE",
            State::Tag | State::AttrValue(_) => "Tag",
            State::Prolog => "Document",
            State::Content => "Content",
            State::Closed => "Document",
        };
        Error::UnexpectedEof(construct.to_string())
    }
}

fn quote_byte(q: Quote) -> u8 {
    match q {
        Quote::Apos => b'\'',
        Quote::Quot => b'"',
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Runs the tokenizer over the whole input, resolving spans to owned
    /// strings for comparison.
    fn tokenize(input: &str) -> Vec<String> {
        tokenize_chunked(input, input.len().max(1))
    }

    fn tokenize_chunked(input: &str, chunk: usize) -> Vec<String> {
        let mut t = Tokenizer::new(State::Prolog, XmlVersion::V1_0);
        let mut out = Vec::new();
        let bytes: Vec<char> = input.chars().collect();
        for piece in bytes.chunks(chunk) {
            let s: String = piece.iter().collect();
            t.push_str(&s);
            drain(&mut t, &mut out);
            t.compact();
        }
        t.set_eof();
        drain(&mut t, &mut out);
        merge_text(out)
    }

    /// Greedy accumulators may flush partial windows at chunk boundaries;
    /// adjacent text and whitespace entries compare as one.
    fn merge_text(tokens: Vec<String>) -> Vec<String> {
        let mut merged: Vec<String> = Vec::new();
        for token in tokens {
            match merged.last_mut() {
                Some(last) if last.starts_with("text:") && token.starts_with("text:") => {
                    last.push_str(&token["text:".len()..]);
                }
                Some(last) if last == "ws" && token == "ws" => {}
                _ => merged.push(token),
            }
        }
        merged
    }

    fn drain(t: &mut Tokenizer, out: &mut Vec<String>) {
        loop {
            match t.next_token() {
                Ok(Some(token)) => out.push(render(t, token)),
                Ok(None) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }

    fn render(t: &Tokenizer, token: Token) -> String {
        match token {
            Token::Name(s) => format!("name:{}", t.text(s)),
            Token::Cdata(s) => format!("text:{}", t.text(s)),
            Token::Whitespace(_) => "ws".to_string(),
            Token::GeneralRef(s) => format!("ref:{}", t.text(s)),
            Token::ParamRef(s) => format!("pref:{}", t.text(s)),
            Token::CharRef(c) => format!("char:{}", c),
            Token::PredefRef(c) => format!("predef:{}", c),
            other => format!("{:?}", other),
        }
    }

    fn expect_error(input: &str) -> Error {
        let mut t = Tokenizer::new(State::Prolog, XmlVersion::V1_0);
        t.push_str(input);
        t.set_eof();
        loop {
            match t.next_token() {
                Ok(Some(_)) => {}
                Ok(None) => panic!("expected an error tokenizing {:?}", input),
                Err(e) => return e,
            }
        }
    }

    #[test]
    fn simple_element() {
        assert_eq!(
            tokenize("<r>hi</r>"),
            [
                "Lt", "name:r", "Gt", "text:hi", "LtSlash", "name:r", "Gt"
            ]
        );
    }

    #[test]
    fn empty_element() {
        assert_eq!(tokenize("<r/>"), ["Lt", "name:r", "SlashGt"]);
    }

    #[test]
    fn attributes() {
        assert_eq!(
            tokenize("<r a='x' b=\"y\"/>"),
            [
                "Lt",
                "name:r",
                "ws",
                "name:a",
                "Eq",
                "BeginLiteral",
                "text:x",
                "EndLiteral",
                "ws",
                "name:b",
                "Eq",
                "BeginLiteral",
                "text:y",
                "EndLiteral",
                "SlashGt"
            ]
        );
    }

    #[test]
    fn quote_inside_other_quote_is_data() {
        assert_eq!(
            tokenize("<r a='\"'/>"),
            [
                "Lt",
                "name:r",
                "ws",
                "name:a",
                "Eq",
                "BeginLiteral",
                "text:\"",
                "EndLiteral",
                "SlashGt"
            ]
        );
    }

    #[test]
    fn predefined_entities() {
        assert_eq!(
            tokenize("<r>&lt;&gt;&amp;&apos;&quot;</r>"),
            [
                "Lt", "name:r", "Gt", "predef:<", "predef:>", "predef:&", "predef:'",
                "predef:\"", "LtSlash", "name:r", "Gt"
            ]
        );
    }

    #[test]
    fn general_entity_that_shares_a_trie_prefix() {
        assert_eq!(
            tokenize("<r>&ltx;&l;&a;</r>"),
            [
                "Lt", "name:r", "Gt", "ref:ltx", "ref:l", "ref:a", "LtSlash", "name:r", "Gt"
            ]
        );
    }

    #[test]
    fn character_references() {
        assert_eq!(
            tokenize("<r>&#x26;&#65;</r>"),
            [
                "Lt", "name:r", "Gt", "char:&", "char:A", "LtSlash", "name:r", "Gt"
            ]
        );
    }

    #[test]
    fn supplementary_character_reference() {
        assert_eq!(
            tokenize("<r>&#x1F600;</r>"),
            [
                "Lt",
                "name:r",
                "Gt",
                "char:\u{1F600}",
                "LtSlash",
                "name:r",
                "Gt"
            ]
        );
    }

    #[test]
    fn char_ref_to_lt_in_attribute_is_fatal() {
        let e = expect_error("<r a='&#60;'/>");
        assert!(matches!(e, Error::Syntax(..)), "{}", e);
    }

    #[test]
    fn char_ref_to_lt_in_content_is_fine() {
        assert_eq!(
            tokenize("<r>&#60;</r>"),
            ["Lt", "name:r", "Gt", "char:<", "LtSlash", "name:r", "Gt"]
        );
    }

    #[test]
    fn bad_char_ref_value() {
        let e = expect_error("<r>&#x0;</r>");
        assert!(matches!(e, Error::Syntax(..)), "{}", e);
    }

    #[test]
    fn comment() {
        assert_eq!(
            tokenize("<r><!-- a - b --></r>"),
            [
                "Lt",
                "name:r",
                "Gt",
                "StartComment",
                "text: a - b ",
                "EndComment",
                "LtSlash",
                "name:r",
                "Gt"
            ]
        );
    }

    #[test]
    fn empty_comment() {
        assert_eq!(
            tokenize("<!----><r/>"),
            ["StartComment", "EndComment", "Lt", "name:r", "SlashGt"]
        );
    }

    #[test]
    fn double_dash_in_comment_is_fatal() {
        let e = expect_error("<!-- a -- b -->");
        assert!(matches!(e, Error::Syntax(..)), "{}", e);
    }

    #[test]
    fn cdata_section() {
        assert_eq!(
            tokenize("<r><![CDATA[x <&> y]]></r>"),
            [
                "Lt",
                "name:r",
                "Gt",
                "StartCdata",
                "text:x <&> y",
                "EndCdata",
                "LtSlash",
                "name:r",
                "Gt"
            ]
        );
    }

    #[test]
    fn cdata_with_bracket_run() {
        assert_eq!(
            tokenize("<r><![CDATA[a]]]></r>"),
            [
                "Lt", "name:r", "Gt", "StartCdata", "text:a]", "EndCdata", "LtSlash", "name:r",
                "Gt"
            ]
        );
    }

    #[test]
    fn cdata_end_in_content_is_fatal() {
        let e = expect_error("<r>a]]>b</r>");
        assert!(matches!(e, Error::Syntax(..)), "{}", e);
    }

    #[test]
    fn processing_instruction() {
        assert_eq!(
            tokenize("<?go there? >now?><r/>"),
            [
                "StartPi",
                "name:go",
                "text:there? >now",
                "EndPi",
                "Lt",
                "name:r",
                "SlashGt"
            ]
        );
    }

    #[test]
    fn pi_without_data() {
        assert_eq!(
            tokenize("<?go?><r/>"),
            ["StartPi", "name:go", "EndPi", "Lt", "name:r", "SlashGt"]
        );
    }

    #[test]
    fn reserved_pi_target_is_fatal() {
        let e = expect_error("<r><?xMl data?></r>");
        assert!(matches!(e, Error::Syntax(..)), "{}", e);
    }

    #[test]
    fn doctype_with_internal_subset() {
        assert_eq!(
            tokenize("<!DOCTYPE r [<!ELEMENT r EMPTY>]><r/>"),
            [
                "StartDoctype",
                "ws",
                "name:r",
                "ws",
                "OpenBracket",
                "StartElementDecl",
                "ws",
                "name:r",
                "ws",
                "name:EMPTY",
                "Gt",
                "CloseBracket",
                "Gt",
                "Lt",
                "name:r",
                "SlashGt"
            ]
        );
    }

    #[test]
    fn miscased_doctype_keyword() {
        let e = expect_error("<!doctype r><r/>");
        match e {
            Error::KeywordCase {
                expected, found, ..
            } => {
                assert_eq!(expected, "DOCTYPE");
                assert_eq!(found, "doctype");
            }
            other => panic!("expected KeywordCase, got {}", other),
        }
    }

    #[test]
    fn miscased_element_decl_keyword() {
        let e = expect_error("<!DOCTYPE r [<!Element r EMPTY>]><r/>");
        assert!(matches!(e, Error::KeywordCase { expected: "ELEMENT", .. }), "{}", e);
    }

    #[test]
    fn entity_declaration_value_pieces() {
        let mut t = Tokenizer::new(State::Prolog, XmlVersion::V1_0);
        t.push_str("<!DOCTYPE r [<!ENTITY e 'a&b;&#9;c'>]><r/>");
        t.set_eof();
        let mut out = Vec::new();
        loop {
            match t.next_token() {
                Ok(Some(Token::BeginLiteral)) => {
                    out.push("BeginLiteral".to_string());
                    t.set_literal_kind(LiteralKind::EntityValue);
                }
                Ok(Some(token)) => out.push(render(&t, token)),
                Ok(None) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(
            out,
            [
                "StartDoctype",
                "ws",
                "name:r",
                "ws",
                "OpenBracket",
                "StartEntityDecl",
                "ws",
                "name:e",
                "ws",
                "BeginLiteral",
                "text:a",
                "ref:b",
                "char:\t",
                "text:c",
                "EndLiteral",
                "Gt",
                "CloseBracket",
                "Gt",
                "Lt",
                "name:r",
                "SlashGt"
            ]
        );
    }

    #[test]
    fn predefined_ref_in_entity_value_is_bypassed() {
        let mut t = Tokenizer::new(State::Prolog, XmlVersion::V1_0);
        t.push_str("<!DOCTYPE r [<!ENTITY e '&lt;'>]><r/>");
        t.set_eof();
        let mut saw_bypassed = false;
        loop {
            match t.next_token() {
                Ok(Some(Token::BeginLiteral)) => t.set_literal_kind(LiteralKind::EntityValue),
                Ok(Some(Token::GeneralRef(s))) => {
                    assert_eq!(t.text(s), "lt");
                    saw_bypassed = true;
                }
                Ok(Some(Token::PredefRef(_))) => panic!("predefined ref must be bypassed"),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(saw_bypassed);
    }

    #[test]
    fn parameter_entity_tokens() {
        assert_eq!(
            tokenize("<!DOCTYPE r [<!ENTITY % p 'x'>%p;]><r/>"),
            [
                "StartDoctype",
                "ws",
                "name:r",
                "ws",
                "OpenBracket",
                "StartEntityDecl",
                "ws",
                "Percent",
                "ws",
                "name:p",
                "ws",
                "BeginLiteral",
                "text:x",
                "EndLiteral",
                "Gt",
                "pref:p",
                "CloseBracket",
                "Gt",
                "Lt",
                "name:r",
                "SlashGt"
            ]
        );
    }

    #[test]
    fn whitespace_in_content_is_text() {
        assert_eq!(
            tokenize("<r> \n </r>"),
            ["Lt", "name:r", "Gt", "text: \n ", "LtSlash", "name:r", "Gt"]
        );
    }

    #[test]
    fn prolog_whitespace_is_dropped() {
        assert_eq!(tokenize("  <r/>  "), ["Lt", "name:r", "SlashGt"]);
    }

    #[test]
    fn text_in_prolog_is_fatal() {
        let e = expect_error("boom <r/>");
        assert!(matches!(e, Error::Syntax(..)), "{}", e);
    }

    #[test]
    fn illegal_character_is_fatal() {
        let e = expect_error("<r>\u{0}</r>");
        assert!(matches!(e, Error::IllegalChar('\u{0}', _)), "{}", e);
    }

    #[test]
    fn unclosed_comment_at_eof() {
        let e = expect_error("<r><!-- nope");
        assert!(matches!(e, Error::UnexpectedEof(s) if s == "Comment"));
    }

    #[test]
    fn unclosed_tag_at_eof() {
        let e = expect_error("<r a='x'");
        assert!(matches!(e, Error::UnexpectedEof(s) if s == "Tag"));
    }

    #[test]
    fn positions_track_lines_and_columns() {
        let mut t = Tokenizer::new(State::Prolog, XmlVersion::V1_0);
        t.push_str("<a>\n</a>");
        t.set_eof();
        while let Ok(Some(_)) = t.next_token() {}
        assert_eq!(t.position().line, 2);
        assert_eq!(t.position().column, 5);
    }

    /// Feed-split invariance: any chunking of the input produces the same
    /// token sequence.
    #[test]
    fn chunked_feeding_is_equivalent() {
        let doc = "<?pi data?><!DOCTYPE r [<!ELEMENT r (#PCDATA)><!ENTITY e 'v&#38;'>]>\
                   <r a='1' b=\"&amp;x\"><![CDATA[a]]b]]><!--c-->&e;\ntail</r>";
        let whole = tokenize(doc);
        for chunk in [1, 2, 3, 5, 7, 11, 13] {
            assert_eq!(tokenize_chunked(doc, chunk), whole, "chunk size {}", chunk);
        }
    }

    #[test]
    fn conditional_sections() {
        let mut t = Tokenizer::new(State::DoctypeInternal, XmlVersion::V1_0);
        t.push_str("<![INCLUDE[<!ELEMENT a EMPTY>]]><![IGNORE[<![[nested]]> junk ]]>");
        t.set_eof();
        let mut out = Vec::new();
        loop {
            match t.next_token() {
                Ok(Some(Token::Name(s))) => {
                    let text = t.text(s).to_string();
                    if text == "INCLUDE" {
                        t.arm_conditional(ConditionalKind::Include);
                    } else if text == "IGNORE" {
                        t.arm_conditional(ConditionalKind::Ignore);
                    }
                    out.push(format!("name:{}", text));
                }
                Ok(Some(token)) => out.push(render(&t, token)),
                Ok(None) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(
            out,
            [
                "StartConditional",
                "name:INCLUDE",
                "OpenBracket",
                "StartElementDecl",
                "ws",
                "name:a",
                "ws",
                "name:EMPTY",
                "Gt",
                "EndConditional",
                "StartConditional",
                "name:IGNORE",
                "OpenBracket",
                "EndConditional"
            ]
        );
    }
}
