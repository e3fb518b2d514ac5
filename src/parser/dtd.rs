//! Token-driven parsing of markup declarations.
//!
//! The content parser hands every token seen between `<!DOCTYPE` and the
//! closing `>` to [`DtdParser::handle`]. Each declaration kind is a small
//! state machine; side effects go into the [`Dtd`] store, and everything
//! that needs the event sink or the tokenizer (warnings, validity reports,
//! parameter entity expansion, literal arming) is returned as a
//! [`DtdAction`] for the content parser to carry out.

use crate::dtd::{
    AttDef, AttType, ContentNode, ContentNodeKind, ContentSpec, DefaultDecl, Dtd, ElementDecl,
    EntityDecl, EntityDef, ExternalId, NotationDecl, Occurrence, ValuePiece,
};
use crate::errors::{Error, Position, Result};
use crate::tokenizer::{ConditionalKind, LiteralKind, Token};

/// Work the content parser performs on behalf of the DTD parser.
#[derive(Debug)]
pub(crate) enum DtdAction {
    /// Advisory report (duplicate declaration and the like).
    Warning(String),
    /// Validity error to route through the sink's error hook.
    Validity(String),
    /// Declare the literal kind of the literal just opened.
    SetLiteral(LiteralKind),
    /// Arm the tokenizer with the selected conditional section kind.
    ArmConditional(ConditionalKind),
    /// Expand a parameter entity into the token stream.
    ExpandPe(String),
    /// Report a notation declaration to the sink.
    Notation {
        name: String,
        public_id: Option<String>,
        system_id: Option<String>,
    },
    /// Report an unparsed entity declaration to the sink.
    UnparsedEntity {
        name: String,
        public_id: Option<String>,
        system_id: Option<String>,
        notation: String,
    },
    /// The `>` closing the DOCTYPE declaration was consumed.
    DoctypeDone,
}

/// Keywords recognized inside markup declarations, for the miscasing
/// check: a name that matches one of these case-insensitively but not
/// exactly is fatal wherever the keyword would be legal.
const KEYWORDS: &[&str] = &[
    "SYSTEM", "PUBLIC", "NDATA", "EMPTY", "ANY", "CDATA", "ID", "IDREF", "IDREFS", "ENTITY",
    "ENTITIES", "NMTOKEN", "NMTOKENS", "NOTATION", "INCLUDE", "IGNORE", "#PCDATA", "#REQUIRED",
    "#IMPLIED", "#FIXED",
];

/// Classifies a name at a position where one of `expected` may appear.
/// Exact match wins; a case-insensitive match of any keyword is fatal;
/// anything else is handed back for ordinary name handling.
fn keyword(
    name: &str,
    expected: &'static [&'static str],
    position: Position,
) -> Result<Option<&'static str>> {
    for k in expected {
        if name == *k {
            return Ok(Some(k));
        }
    }
    for k in KEYWORDS {
        if name.eq_ignore_ascii_case(k) && name != *k {
            return Err(Error::KeywordCase {
                expected: k,
                found: name.to_string(),
                position,
            });
        }
    }
    Ok(None)
}

fn syntax(msg: impl Into<String>, position: Position) -> Error {
    Error::Syntax(msg.into(), position)
}

/// Collects an ExternalID: `SYSTEM S SystemLiteral` or
/// `PUBLIC S PubidLiteral S SystemLiteral`, with the system literal
/// optional for notations.
#[derive(Debug)]
struct IdCollect {
    is_public: bool,
    system_optional: bool,
    /// SYSTEM or PUBLIC was consumed.
    keyword_seen: bool,
    public_id: Option<String>,
    system_id: Option<String>,
    stage: IdStage,
    buf: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum IdStage {
    /// Waiting for the opening quote of the next literal.
    BeforeLiteral,
    /// Inside the public identifier literal.
    InPublic,
    /// Between the public and the (possibly optional) system literal.
    AfterPublic,
    /// Inside the system identifier literal.
    InSystem,
    /// Complete.
    Done,
}

enum Offer {
    Taken,
    /// The token does not belong to the external identifier; the caller
    /// decides what it means.
    NotMine,
}

impl IdCollect {
    fn new(is_public: bool, system_optional: bool) -> Self {
        Self {
            is_public,
            system_optional,
            keyword_seen: false,
            public_id: None,
            system_id: None,
            stage: IdStage::BeforeLiteral,
            buf: String::new(),
        }
    }

    fn offer(
        &mut self,
        token: Token,
        text: Option<&str>,
        ws: bool,
        position: Position,
        actions: &mut Vec<DtdAction>,
    ) -> Result<Offer> {
        match (self.stage, token) {
            (IdStage::BeforeLiteral, Token::BeginLiteral)
            | (IdStage::AfterPublic, Token::BeginLiteral) => {
                if !ws {
                    return Err(syntax("Whitespace required before identifier literal", position));
                }
                actions.push(DtdAction::SetLiteral(LiteralKind::Raw));
                self.buf.clear();
                self.stage = if self.is_public && self.public_id.is_none() {
                    IdStage::InPublic
                } else {
                    IdStage::InSystem
                };
                Ok(Offer::Taken)
            }
            (IdStage::InPublic, Token::Cdata(_)) | (IdStage::InSystem, Token::Cdata(_)) => {
                // Raw literal: the tokenizer delivers plain text only.
                if let Some(text) = text {
                    self.buf.push_str(text);
                }
                Ok(Offer::Taken)
            }
            (IdStage::InPublic, Token::EndLiteral) => {
                for c in self.buf.chars() {
                    if !crate::chars::is_pubid_char(c) {
                        return Err(syntax(
                            format!("Character '{}' is not allowed in a public identifier", c),
                            position,
                        ));
                    }
                }
                self.public_id = Some(::std::mem::replace(&mut self.buf, String::new()));
                self.stage = IdStage::AfterPublic;
                Ok(Offer::Taken)
            }
            (IdStage::InSystem, Token::EndLiteral) => {
                if self.buf.contains('#') {
                    return Err(syntax(
                        "System identifier must not contain a fragment identifier",
                        position,
                    ));
                }
                self.system_id = Some(::std::mem::replace(&mut self.buf, String::new()));
                self.stage = IdStage::Done;
                Ok(Offer::Taken)
            }
            (IdStage::Done, _) => Ok(Offer::NotMine),
            (IdStage::AfterPublic, _) if self.system_optional => Ok(Offer::NotMine),
            _ => Err(syntax("Malformed external identifier", position)),
        }
    }

    fn finish(&mut self, position: Position) -> Result<ExternalId> {
        match self.stage {
            IdStage::Done => {}
            IdStage::AfterPublic if self.system_optional => {}
            _ => return Err(syntax("Incomplete external identifier", position)),
        }
        Ok(ExternalId {
            public_id: self.public_id.take(),
            system_id: self.system_id.take(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Sep {
    Seq,
    Alt,
}

/// Builder for one `<!ELEMENT>` declaration.
#[derive(Debug, Default)]
struct ElementDeclParser {
    name: Option<String>,
    groups: Vec<GroupFrame>,
    mixed: bool,
    mixed_names: Vec<String>,
    root: Option<ContentNode>,
    content: Option<ContentSpec>,
    /// Last token completed an item, so an occurrence indicator may attach.
    after_item: bool,
    /// Root-level occurrence was already attached.
    root_closed: bool,
}

#[derive(Debug, Default)]
struct GroupFrame {
    sep: Option<Sep>,
    items: Vec<ContentNode>,
    expect_item: bool,
}

/// Builder for one `<!ATTLIST>` declaration.
#[derive(Debug, Default)]
struct AttlistParser {
    element: Option<String>,
    stage: AttStage,
    att_name: Option<String>,
    att_type: Option<AttType>,
    tokens: Vec<String>,
    fixed: bool,
    value: Vec<ValuePiece>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AttStage {
    ElementName,
    AttName,
    Type,
    NotationParen,
    NotationName,
    NotationSep,
    EnumValue,
    EnumSep,
    Default,
    FixedValue,
    Value,
}

impl Default for AttStage {
    fn default() -> Self {
        AttStage::ElementName
    }
}

/// Builder for one `<!ENTITY>` declaration.
#[derive(Debug)]
struct EntityParser {
    stage: EntStage,
    parameter: bool,
    name: Option<String>,
    pieces: Vec<ValuePiece>,
    id: Option<IdCollect>,
    ndata: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EntStage {
    NameOrPercent,
    Def,
    Value,
    ExtId,
    NdataName,
    End,
}

/// Builder for one `<!NOTATION>` declaration.
#[derive(Debug)]
struct NotationParser {
    name: Option<String>,
    id: Option<IdCollect>,
}

#[derive(Debug)]
enum DtdState {
    /// Expecting the document type name.
    DoctypeName,
    /// DOCTYPE head after the name: external identifier, `[` or `>`.
    AfterName(IdCollect),
    /// Between markup declarations.
    Subset,
    /// After `<![`, before the section's `[`.
    CondKeyword,
    Element(ElementDeclParser),
    Attlist(AttlistParser),
    Entity(EntityParser),
    Notation(NotationParser),
}

/// The DTD parser: a sibling consumer of the token stream, entered at
/// `<!DOCTYPE` and fed until the matching `>` (and, after that, the whole
/// external subset).
pub(crate) struct DtdParser {
    state: DtdState,
    /// Whether the previous token was whitespace.
    ws: bool,
    /// Notation names referenced before their declaration could be seen;
    /// resolved once the whole DTD is in. The flag marks references that
    /// are fatal rather than validity errors.
    notation_refs: Vec<(String, Position, bool)>,
}

impl DtdParser {
    pub(crate) fn new() -> Self {
        Self {
            state: DtdState::DoctypeName,
            ws: false,
            notation_refs: Vec::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = DtdState::DoctypeName;
        self.ws = false;
        self.notation_refs.clear();
    }

    /// Open parenthesis depth of the content model in progress; captured
    /// when a parameter entity is entered so the nesting constraint can be
    /// checked on exit.
    pub(crate) fn group_depth(&self) -> usize {
        match &self.state {
            DtdState::Element(p) => p.groups.len(),
            _ => 0,
        }
    }

    /// An opaque tag for the current declaration sub-state, captured and
    /// compared around parameter entity expansion.
    pub(crate) fn sub_state_tag(&self) -> u8 {
        match &self.state {
            DtdState::DoctypeName => 0,
            DtdState::AfterName(_) => 1,
            DtdState::Subset => 2,
            DtdState::CondKeyword => 3,
            DtdState::Element(_) => 4,
            DtdState::Attlist(_) => 5,
            DtdState::Entity(_) => 6,
            DtdState::Notation(_) => 7,
        }
    }

    /// Deferred notation checks, run by the content parser once the DTD is
    /// complete. Returns `(fatal, validity)` message lists.
    pub(crate) fn finish_notation_checks(&mut self, dtd: &Dtd) -> (Vec<String>, Vec<String>) {
        let mut fatal = Vec::new();
        let mut validity = Vec::new();
        for (name, _pos, is_fatal) in self.notation_refs.drain(..) {
            if dtd.notation(&name).is_none() {
                let msg = format!("Notation '{}' is not declared", name);
                if is_fatal {
                    fatal.push(msg);
                } else {
                    validity.push(msg);
                }
            }
        }
        (fatal, validity)
    }

    /// Processes one token. `from_internal` is true when the token came
    /// from the internal subset of the document entity (where the XML
    /// rules restrict parameter entity references), `base_uri` is the base
    /// of the entity the token came from.
    pub(crate) fn handle(
        &mut self,
        token: Token,
        text: Option<&str>,
        position: Position,
        from_internal: bool,
        base_uri: Option<&str>,
        dtd: &mut Dtd,
        actions: &mut Vec<DtdAction>,
    ) -> Result<()> {
        let ws = self.ws;
        self.ws = matches!(token, Token::Whitespace(_));
        match &mut self.state {
            DtdState::DoctypeName => match token {
                Token::Whitespace(_) => Ok(()),
                Token::Name(_) => {
                    dtd.name = Some(text.unwrap_or("").to_string());
                    self.state = DtdState::AfterName(IdCollect::new(false, false));
                    Ok(())
                }
                _ => Err(syntax("Expected a document type name", position)),
            },
            DtdState::AfterName(id) => match token {
                Token::Whitespace(_) => Ok(()),
                Token::Name(_) if !id.keyword_seen => {
                    let name = text.unwrap_or("");
                    match keyword(name, &["SYSTEM", "PUBLIC"], position)? {
                        Some("PUBLIC") => {
                            id.is_public = true;
                            id.keyword_seen = true;
                            Ok(())
                        }
                        Some(_) => {
                            id.keyword_seen = true;
                            Ok(())
                        }
                        None => Err(syntax(
                            format!("Expected SYSTEM or PUBLIC, found '{}'", name),
                            position,
                        )),
                    }
                }
                Token::OpenBracket => {
                    dtd.external_id = self.take_head_id(position)?;
                    self.state = DtdState::Subset;
                    Ok(())
                }
                Token::Gt => {
                    dtd.external_id = self.take_head_id(position)?;
                    self.state = DtdState::Subset;
                    actions.push(DtdAction::DoctypeDone);
                    Ok(())
                }
                _ => match id.offer(token, text, ws, position, actions)? {
                    Offer::Taken => Ok(()),
                    Offer::NotMine => Err(syntax("Malformed DOCTYPE declaration", position)),
                },
            },
            DtdState::Subset => match token {
                Token::Whitespace(_) => Ok(()),
                Token::StartElementDecl => {
                    self.state = DtdState::Element(ElementDeclParser::default());
                    Ok(())
                }
                Token::StartAttlistDecl => {
                    self.state = DtdState::Attlist(AttlistParser::default());
                    Ok(())
                }
                Token::StartEntityDecl => {
                    self.state = DtdState::Entity(EntityParser {
                        stage: EntStage::NameOrPercent,
                        parameter: false,
                        name: None,
                        pieces: Vec::new(),
                        id: None,
                        ndata: None,
                    });
                    Ok(())
                }
                Token::StartNotationDecl => {
                    self.state = DtdState::Notation(NotationParser { name: None, id: None });
                    Ok(())
                }
                Token::StartConditional => {
                    if from_internal {
                        Err(syntax(
                            "Conditional sections are only allowed in the external subset",
                            position,
                        ))
                    } else {
                        self.state = DtdState::CondKeyword;
                        Ok(())
                    }
                }
                Token::EndConditional => Ok(()),
                Token::ParamRef(_) => {
                    actions.push(DtdAction::ExpandPe(text.unwrap_or("").to_string()));
                    Ok(())
                }
                // The internal subset terminator; only the document entity
                // may close the DOCTYPE declaration.
                Token::CloseBracket if from_internal => Ok(()),
                Token::Gt if from_internal => {
                    actions.push(DtdAction::DoctypeDone);
                    Ok(())
                }
                _ => Err(syntax("Unexpected token in DTD", position)),
            },
            DtdState::CondKeyword => match token {
                Token::Whitespace(_) => Ok(()),
                Token::Name(_) => {
                    let name = text.unwrap_or("");
                    match keyword(name, &["INCLUDE", "IGNORE"], position)? {
                        Some("INCLUDE") => {
                            actions.push(DtdAction::ArmConditional(ConditionalKind::Include));
                            Ok(())
                        }
                        Some(_) => {
                            actions.push(DtdAction::ArmConditional(ConditionalKind::Ignore));
                            Ok(())
                        }
                        None => Err(syntax(
                            format!("Expected INCLUDE or IGNORE, found '{}'", name),
                            position,
                        )),
                    }
                }
                Token::ParamRef(_) => {
                    actions.push(DtdAction::ExpandPe(text.unwrap_or("").to_string()));
                    Ok(())
                }
                Token::OpenBracket => {
                    self.state = DtdState::Subset;
                    Ok(())
                }
                _ => Err(syntax("Malformed conditional section", position)),
            },
            DtdState::Element(_) => {
                self.handle_element(token, text, ws, position, from_internal, dtd, actions)
            }
            DtdState::Attlist(_) => {
                self.handle_attlist(token, text, position, from_internal, dtd, actions)
            }
            DtdState::Entity(_) => {
                self.handle_entity(token, text, ws, position, from_internal, base_uri, dtd, actions)
            }
            DtdState::Notation(_) => {
                self.handle_notation(token, text, ws, position, from_internal, dtd, actions)
            }
        }
    }

    fn take_head_id(&mut self, position: Position) -> Result<Option<ExternalId>> {
        if let DtdState::AfterName(id) = &mut self.state {
            if !id.keyword_seen {
                return Ok(None);
            }
            return id.finish(position).map(Some);
        }
        Ok(None)
    }

    fn handle_element(
        &mut self,
        token: Token,
        text: Option<&str>,
        ws: bool,
        position: Position,
        from_internal: bool,
        dtd: &mut Dtd,
        actions: &mut Vec<DtdAction>,
    ) -> Result<()> {
        let p = match &mut self.state {
            DtdState::Element(p) => p,
            _ => return Ok(()),
        };
        if let Token::ParamRef(_) = token {
            if from_internal {
                return Err(syntax(
                    "Parameter entity references are not allowed inside markup declarations in the internal subset",
                    position,
                ));
            }
            actions.push(DtdAction::ExpandPe(text.unwrap_or("").to_string()));
            return Ok(());
        }
        if p.name.is_none() {
            return match token {
                Token::Whitespace(_) => Ok(()),
                Token::Name(_) => {
                    p.name = Some(text.unwrap_or("").to_string());
                    Ok(())
                }
                _ => Err(syntax("Expected an element name", position)),
            };
        }
        // Content specification.
        if p.content.is_none() && p.groups.is_empty() && p.root.is_none() && !p.mixed {
            return match token {
                Token::Whitespace(_) => Ok(()),
                Token::Name(_) => {
                    let name = text.unwrap_or("");
                    match keyword(name, &["EMPTY", "ANY"], position)? {
                        Some("EMPTY") => {
                            p.content = Some(ContentSpec::Empty);
                            Ok(())
                        }
                        Some(_) => {
                            p.content = Some(ContentSpec::Any);
                            Ok(())
                        }
                        None => Err(syntax(
                            format!("Expected EMPTY, ANY or a group, found '{}'", name),
                            position,
                        )),
                    }
                }
                Token::OpenParen => {
                    p.groups.push(GroupFrame {
                        sep: None,
                        items: Vec::new(),
                        expect_item: true,
                    });
                    Ok(())
                }
                _ => Err(syntax("Expected a content specification", position)),
            };
        }
        if !p.groups.is_empty() {
            return Self::model_token(p, token, text, position, actions);
        }
        // After the model or keyword: optional root occurrence, then `>`.
        match token {
            Token::Whitespace(_) => Ok(()),
            Token::Star | Token::Plus | Token::Question
                if (p.root.is_some() || p.mixed) && !p.root_closed =>
            {
                if ws {
                    return Err(syntax(
                        "Occurrence indicator must directly follow its group",
                        position,
                    ));
                }
                if p.mixed {
                    if token != Token::Star {
                        return Err(syntax("Mixed content requires '*' on the group", position));
                    }
                    p.root_closed = true;
                    return Ok(());
                }
                let root = match p.root.as_mut() {
                    Some(root) => root,
                    None => return Err(syntax("Malformed content model", position)),
                };
                if root.occurrence != Occurrence::Once {
                    return Err(syntax("Doubled occurrence indicator", position));
                }
                root.occurrence = match token {
                    Token::Star => Occurrence::ZeroOrMore,
                    Token::Plus => Occurrence::OneOrMore,
                    _ => Occurrence::Optional,
                };
                p.root_closed = true;
                Ok(())
            }
            Token::Gt => {
                let p = match ::std::mem::replace(&mut self.state, DtdState::Subset) {
                    DtdState::Element(p) => p,
                    _ => return Ok(()),
                };
                let name = p.name.unwrap_or_default();
                let content = if p.mixed {
                    if !p.mixed_names.is_empty() && !p.root_closed {
                        return Err(syntax(
                            "Mixed content with element names requires a trailing '*'",
                            position,
                        ));
                    }
                    ContentSpec::Mixed(p.mixed_names)
                } else if let Some(root) = p.root {
                    ContentSpec::Children(root)
                } else if let Some(content) = p.content {
                    content
                } else {
                    return Err(syntax("Missing content specification", position));
                };
                if !dtd.add_element(ElementDecl {
                    name: name.clone(),
                    content,
                }) {
                    actions.push(DtdAction::Warning(format!(
                        "Element '{}' was already declared; ignoring the duplicate",
                        name
                    )));
                }
                Ok(())
            }
            _ => Err(syntax("Malformed element declaration", position)),
        }
    }

    /// One token inside the parenthesized content model.
    fn model_token(
        p: &mut ElementDeclParser,
        token: Token,
        text: Option<&str>,
        position: Position,
        actions: &mut Vec<DtdAction>,
    ) -> Result<()> {
        match token {
            Token::Whitespace(_) => {
                p.after_item = false;
                Ok(())
            }
            Token::Name(_) => {
                let name = text.unwrap_or("");
                let groups_len = p.groups.len();
                let mixed = p.mixed;
                let frame = match p.groups.last_mut() {
                    Some(f) => f,
                    None => return Err(syntax("Malformed content model", position)),
                };
                if !frame.expect_item {
                    return Err(syntax("Expected ',' or '|' between names", position));
                }
                if name == "#PCDATA" || name.eq_ignore_ascii_case("#PCDATA") {
                    keyword(name, &["#PCDATA"], position)?;
                    if groups_len != 1 || !frame.items.is_empty() || mixed {
                        return Err(syntax(
                            "#PCDATA must come first in a non-nested group",
                            position,
                        ));
                    }
                    p.mixed = true;
                } else if name.starts_with('#') {
                    return Err(syntax(format!("Unexpected '{}'", name), position));
                } else if p.mixed {
                    if p.mixed_names.iter().any(|n| n == name) {
                        actions.push(DtdAction::Validity(format!(
                            "Element '{}' appears more than once in mixed content",
                            name
                        )));
                    } else {
                        p.mixed_names.push(name.to_string());
                    }
                } else {
                    frame.items.push(ContentNode {
                        kind: ContentNodeKind::Element(name.to_string()),
                        occurrence: Occurrence::Once,
                        children: Vec::new(),
                    });
                }
                frame.expect_item = false;
                p.after_item = !p.mixed;
                Ok(())
            }
            Token::Comma | Token::Pipe => {
                let sep = if token == Token::Comma { Sep::Seq } else { Sep::Alt };
                if p.mixed && sep == Sep::Seq {
                    return Err(syntax("Mixed content uses '|' separators", position));
                }
                let frame = match p.groups.last_mut() {
                    Some(f) => f,
                    None => return Err(syntax("Malformed content model", position)),
                };
                if frame.expect_item {
                    return Err(syntax("Consecutive separators in content model", position));
                }
                match frame.sep {
                    None => frame.sep = Some(sep),
                    Some(existing) if existing != sep => {
                        return Err(syntax(
                            "',' and '|' cannot be mixed at one level",
                            position,
                        ))
                    }
                    Some(_) => {}
                }
                frame.expect_item = true;
                p.after_item = false;
                Ok(())
            }
            Token::Star | Token::Plus | Token::Question => {
                if p.mixed {
                    return Err(syntax(
                        "Occurrence indicators are not allowed on names in mixed content",
                        position,
                    ));
                }
                if !p.after_item {
                    return Err(syntax(
                        "Occurrence indicator must directly follow a name or group",
                        position,
                    ));
                }
                let frame = match p.groups.last_mut() {
                    Some(f) => f,
                    None => return Err(syntax("Malformed content model", position)),
                };
                let item = match frame.items.last_mut() {
                    Some(item) => item,
                    None => return Err(syntax("Malformed content model", position)),
                };
                if item.occurrence != Occurrence::Once {
                    return Err(syntax("Doubled occurrence indicator", position));
                }
                item.occurrence = match token {
                    Token::Star => Occurrence::ZeroOrMore,
                    Token::Plus => Occurrence::OneOrMore,
                    _ => Occurrence::Optional,
                };
                p.after_item = false;
                Ok(())
            }
            Token::OpenParen => {
                if p.mixed {
                    return Err(syntax("Groups cannot nest in mixed content", position));
                }
                let frame = match p.groups.last_mut() {
                    Some(f) => f,
                    None => return Err(syntax("Malformed content model", position)),
                };
                if !frame.expect_item {
                    return Err(syntax("Expected ',' or '|' before a group", position));
                }
                frame.expect_item = false;
                p.groups.push(GroupFrame {
                    sep: None,
                    items: Vec::new(),
                    expect_item: true,
                });
                p.after_item = false;
                Ok(())
            }
            Token::CloseParen => {
                let frame = match p.groups.pop() {
                    Some(f) => f,
                    None => return Err(syntax("Malformed content model", position)),
                };
                if p.mixed {
                    if !p.groups.is_empty() {
                        return Err(syntax("Groups cannot nest in mixed content", position));
                    }
                    p.root_closed = false;
                    p.after_item = false;
                    return Ok(());
                }
                if frame.items.is_empty() {
                    return Err(syntax("Empty group in content model", position));
                }
                if frame.expect_item {
                    return Err(syntax("Trailing separator in content model", position));
                }
                let node = if frame.items.len() == 1 && frame.sep.is_none() {
                    frame.items.into_iter().next().unwrap_or(ContentNode {
                        kind: ContentNodeKind::Sequence,
                        occurrence: Occurrence::Once,
                        children: Vec::new(),
                    })
                } else {
                    let kind = match frame.sep {
                        Some(Sep::Alt) => ContentNodeKind::Choice,
                        _ => ContentNodeKind::Sequence,
                    };
                    if kind == ContentNodeKind::Choice {
                        // Determinism: the same name twice in one choice
                        // can never be told apart.
                        let mut seen: Vec<&str> = Vec::new();
                        for item in &frame.items {
                            if let ContentNodeKind::Element(n) = &item.kind {
                                if seen.contains(&n.as_str()) {
                                    return Err(syntax(
                                        format!("Element '{}' appears twice in one choice", n),
                                        position,
                                    ));
                                }
                                seen.push(n);
                            }
                        }
                    }
                    ContentNode {
                        kind,
                        occurrence: Occurrence::Once,
                        children: frame.items,
                    }
                };
                if let Some(parent) = p.groups.last_mut() {
                    parent.items.push(node);
                    p.after_item = true;
                } else {
                    p.root = Some(node);
                    p.after_item = false;
                }
                Ok(())
            }
            _ => Err(syntax("Unexpected token in content model", position)),
        }
    }

    fn handle_attlist(
        &mut self,
        token: Token,
        text: Option<&str>,
        position: Position,
        from_internal: bool,
        dtd: &mut Dtd,
        actions: &mut Vec<DtdAction>,
    ) -> Result<()> {
        let p = match &mut self.state {
            DtdState::Attlist(p) => p,
            _ => return Ok(()),
        };
        if let Token::ParamRef(_) = token {
            if from_internal {
                return Err(syntax(
                    "Parameter entity references are not allowed inside markup declarations in the internal subset",
                    position,
                ));
            }
            actions.push(DtdAction::ExpandPe(text.unwrap_or("").to_string()));
            return Ok(());
        }
        if let Token::Whitespace(_) = token {
            return Ok(());
        }
        match p.stage {
            AttStage::ElementName => match token {
                Token::Name(_) => {
                    p.element = Some(text.unwrap_or("").to_string());
                    p.stage = AttStage::AttName;
                    Ok(())
                }
                _ => Err(syntax("Expected an element name", position)),
            },
            AttStage::AttName => match token {
                Token::Name(_) => {
                    p.att_name = Some(text.unwrap_or("").to_string());
                    p.stage = AttStage::Type;
                    Ok(())
                }
                Token::Gt => {
                    self.state = DtdState::Subset;
                    Ok(())
                }
                _ => Err(syntax("Expected an attribute name or '>'", position)),
            },
            AttStage::Type => match token {
                Token::Name(_) => {
                    let name = text.unwrap_or("");
                    let kw = keyword(
                        name,
                        &[
                            "CDATA", "ID", "IDREF", "IDREFS", "ENTITY", "ENTITIES", "NMTOKEN",
                            "NMTOKENS", "NOTATION",
                        ],
                        position,
                    )?;
                    match kw {
                        Some("CDATA") => p.att_type = Some(AttType::Cdata),
                        Some("ID") => p.att_type = Some(AttType::Id),
                        Some("IDREF") => p.att_type = Some(AttType::Idref),
                        Some("IDREFS") => p.att_type = Some(AttType::Idrefs),
                        Some("ENTITY") => p.att_type = Some(AttType::Entity),
                        Some("ENTITIES") => p.att_type = Some(AttType::Entities),
                        Some("NMTOKEN") => p.att_type = Some(AttType::Nmtoken),
                        Some("NMTOKENS") => p.att_type = Some(AttType::Nmtokens),
                        Some("NOTATION") => {
                            p.stage = AttStage::NotationParen;
                            return Ok(());
                        }
                        _ => {
                            return Err(syntax(
                                format!("'{}' is not an attribute type", name),
                                position,
                            ))
                        }
                    }
                    p.stage = AttStage::Default;
                    Ok(())
                }
                Token::OpenParen => {
                    p.tokens.clear();
                    p.stage = AttStage::EnumValue;
                    Ok(())
                }
                _ => Err(syntax("Expected an attribute type", position)),
            },
            AttStage::NotationParen => match token {
                Token::OpenParen => {
                    p.tokens.clear();
                    p.stage = AttStage::NotationName;
                    Ok(())
                }
                _ => Err(syntax("Expected '(' after NOTATION", position)),
            },
            AttStage::NotationName | AttStage::EnumValue => match token {
                Token::Name(_) => {
                    let value = text.unwrap_or("").to_string();
                    if p.tokens.contains(&value) {
                        actions.push(DtdAction::Validity(format!(
                            "'{}' appears more than once in the enumeration",
                            value
                        )));
                    } else {
                        p.tokens.push(value);
                    }
                    p.stage = if p.stage == AttStage::NotationName {
                        AttStage::NotationSep
                    } else {
                        AttStage::EnumSep
                    };
                    Ok(())
                }
                _ => Err(syntax("Expected a name in the enumeration", position)),
            },
            AttStage::NotationSep | AttStage::EnumSep => match token {
                Token::Pipe => {
                    p.stage = if p.stage == AttStage::NotationSep {
                        AttStage::NotationName
                    } else {
                        AttStage::EnumValue
                    };
                    Ok(())
                }
                Token::CloseParen => {
                    if p.tokens.is_empty() {
                        return Err(syntax("Empty enumeration", position));
                    }
                    let values = ::std::mem::replace(&mut p.tokens, Vec::new());
                    if p.stage == AttStage::NotationSep {
                        for value in &values {
                            self.notation_refs.push((value.clone(), position, true));
                        }
                        if let DtdState::Attlist(p) = &mut self.state {
                            p.att_type = Some(AttType::Notation(values));
                            p.stage = AttStage::Default;
                        }
                    } else {
                        p.att_type = Some(AttType::Enumeration(values));
                        p.stage = AttStage::Default;
                    }
                    Ok(())
                }
                _ => Err(syntax("Expected '|' or ')'", position)),
            },
            AttStage::Default => match token {
                Token::Name(_) => {
                    let name = text.unwrap_or("");
                    match keyword(name, &["#REQUIRED", "#IMPLIED", "#FIXED"], position)? {
                        Some("#REQUIRED") => {
                            Self::finish_att_def(p, DefaultDecl::Required, dtd, actions, position)
                        }
                        Some("#IMPLIED") => {
                            Self::finish_att_def(p, DefaultDecl::Implied, dtd, actions, position)
                        }
                        Some(_) => {
                            p.fixed = true;
                            p.stage = AttStage::FixedValue;
                            Ok(())
                        }
                        None => Err(syntax(
                            format!("Expected a default declaration, found '{}'", name),
                            position,
                        )),
                    }
                }
                Token::BeginLiteral => {
                    actions.push(DtdAction::SetLiteral(LiteralKind::AttrDefault));
                    p.value.clear();
                    p.stage = AttStage::Value;
                    Ok(())
                }
                _ => Err(syntax("Expected a default declaration", position)),
            },
            AttStage::FixedValue => match token {
                Token::BeginLiteral => {
                    actions.push(DtdAction::SetLiteral(LiteralKind::AttrDefault));
                    p.value.clear();
                    p.stage = AttStage::Value;
                    Ok(())
                }
                _ => Err(syntax("Expected a value after #FIXED", position)),
            },
            AttStage::Value => match token {
                Token::Cdata(_) => {
                    p.value
                        .push(ValuePiece::Text(text.unwrap_or("").to_string()));
                    Ok(())
                }
                Token::CharRef(c) | Token::PredefRef(c) => {
                    p.value.push(ValuePiece::CharRef(c));
                    Ok(())
                }
                Token::GeneralRef(_) => {
                    p.value
                        .push(ValuePiece::GeneralRef(text.unwrap_or("").to_string()));
                    Ok(())
                }
                Token::EndLiteral => {
                    let pieces = ::std::mem::replace(&mut p.value, Vec::new());
                    let default = if p.fixed {
                        DefaultDecl::Fixed(pieces)
                    } else {
                        DefaultDecl::Default(pieces)
                    };
                    p.fixed = false;
                    Self::finish_att_def(p, default, dtd, actions, position)
                }
                _ => Err(syntax("Malformed attribute default value", position)),
            },
        }
    }

    fn finish_att_def(
        p: &mut AttlistParser,
        default: DefaultDecl,
        dtd: &mut Dtd,
        actions: &mut Vec<DtdAction>,
        position: Position,
    ) -> Result<()> {
        let element = p.element.clone().unwrap_or_default();
        let name = match p.att_name.take() {
            Some(name) => name,
            None => return Err(syntax("Attribute definition without a name", position)),
        };
        let att_type = match p.att_type.take() {
            Some(t) => t,
            None => return Err(syntax("Attribute definition without a type", position)),
        };
        if att_type == AttType::Id {
            if !matches!(default, DefaultDecl::Required | DefaultDecl::Implied) {
                actions.push(DtdAction::Validity(format!(
                    "ID attribute '{}' must be #IMPLIED or #REQUIRED",
                    name
                )));
            }
            if dtd.has_id_attribute(&element) {
                actions.push(DtdAction::Validity(format!(
                    "Element '{}' already has an ID attribute",
                    element
                )));
            }
        }
        if !dtd.add_att_def(
            &element,
            AttDef {
                name: name.clone(),
                att_type,
                default,
            },
        ) {
            actions.push(DtdAction::Warning(format!(
                "Attribute '{}' of '{}' was already declared; ignoring the duplicate",
                name, element
            )));
        }
        p.stage = AttStage::AttName;
        Ok(())
    }

    fn handle_entity(
        &mut self,
        token: Token,
        text: Option<&str>,
        ws: bool,
        position: Position,
        from_internal: bool,
        base_uri: Option<&str>,
        dtd: &mut Dtd,
        actions: &mut Vec<DtdAction>,
    ) -> Result<()> {
        let p = match &mut self.state {
            DtdState::Entity(p) => p,
            _ => return Ok(()),
        };
        if let Token::ParamRef(_) = token {
            if p.stage != EntStage::Value {
                if from_internal {
                    return Err(syntax(
                        "Parameter entity references are not allowed inside markup declarations in the internal subset",
                        position,
                    ));
                }
                actions.push(DtdAction::ExpandPe(text.unwrap_or("").to_string()));
                return Ok(());
            }
        }
        match p.stage {
            EntStage::NameOrPercent => match token {
                Token::Whitespace(_) => Ok(()),
                Token::Percent => {
                    p.parameter = true;
                    Ok(())
                }
                Token::Name(_) => {
                    p.name = Some(text.unwrap_or("").to_string());
                    p.stage = EntStage::Def;
                    Ok(())
                }
                _ => Err(syntax("Expected an entity name", position)),
            },
            EntStage::Def => match token {
                Token::Whitespace(_) => Ok(()),
                Token::BeginLiteral => {
                    actions.push(DtdAction::SetLiteral(LiteralKind::EntityValue));
                    p.pieces.clear();
                    p.stage = EntStage::Value;
                    Ok(())
                }
                Token::Name(_) => {
                    let name = text.unwrap_or("");
                    match keyword(name, &["SYSTEM", "PUBLIC"], position)? {
                        Some(kw) => {
                            p.id = Some(IdCollect::new(kw == "PUBLIC", false));
                            p.stage = EntStage::ExtId;
                            Ok(())
                        }
                        None => Err(syntax(
                            format!("Expected SYSTEM, PUBLIC or a value, found '{}'", name),
                            position,
                        )),
                    }
                }
                _ => Err(syntax("Malformed entity declaration", position)),
            },
            EntStage::Value => match token {
                Token::Cdata(_) => {
                    p.pieces
                        .push(ValuePiece::Text(text.unwrap_or("").to_string()));
                    Ok(())
                }
                Token::CharRef(c) => {
                    p.pieces.push(ValuePiece::CharRef(c));
                    Ok(())
                }
                Token::GeneralRef(_) => {
                    p.pieces
                        .push(ValuePiece::GeneralRef(text.unwrap_or("").to_string()));
                    Ok(())
                }
                Token::ParamRef(_) => {
                    if from_internal {
                        return Err(syntax(
                            "Parameter entity references are not allowed inside markup declarations in the internal subset",
                            position,
                        ));
                    }
                    p.pieces
                        .push(ValuePiece::ParamRef(text.unwrap_or("").to_string()));
                    Ok(())
                }
                Token::EndLiteral => {
                    p.stage = EntStage::End;
                    Ok(())
                }
                _ => Err(syntax("Malformed entity value", position)),
            },
            EntStage::ExtId => {
                if let Token::Whitespace(_) = token {
                    return Ok(());
                }
                let id = match p.id.as_mut() {
                    Some(id) => id,
                    None => return Err(syntax("Malformed entity declaration", position)),
                };
                match id.offer(token, text, ws, position, actions)? {
                    Offer::Taken => {
                        if id.stage == IdStage::Done {
                            p.stage = EntStage::NdataName;
                        }
                        Ok(())
                    }
                    Offer::NotMine => Err(syntax("Malformed entity declaration", position)),
                }
            }
            EntStage::NdataName => match token {
                Token::Whitespace(_) => Ok(()),
                Token::Name(_) => {
                    let name = text.unwrap_or("");
                    match keyword(name, &["NDATA"], position)? {
                        Some(_) => {
                            if !ws {
                                return Err(syntax("Whitespace required before NDATA", position));
                            }
                            if p.parameter {
                                return Err(syntax(
                                    "Parameter entities cannot be unparsed",
                                    position,
                                ));
                            }
                            p.stage = EntStage::End;
                            p.ndata = Some(String::new());
                            Ok(())
                        }
                        None => Err(syntax(
                            format!("Expected NDATA or '>', found '{}'", name),
                            position,
                        )),
                    }
                }
                Token::Gt => Self::finish_entity(self, base_uri, dtd, actions, position),
                _ => Err(syntax("Malformed entity declaration", position)),
            },
            EntStage::End => match token {
                Token::Whitespace(_) => Ok(()),
                Token::Name(_) if p.ndata.as_ref().map(|n| n.is_empty()).unwrap_or(false) => {
                    p.ndata = Some(text.unwrap_or("").to_string());
                    Ok(())
                }
                Token::Gt => Self::finish_entity(self, base_uri, dtd, actions, position),
                _ => Err(syntax("Malformed entity declaration", position)),
            },
        }
    }

    fn finish_entity(
        &mut self,
        base_uri: Option<&str>,
        dtd: &mut Dtd,
        actions: &mut Vec<DtdAction>,
        position: Position,
    ) -> Result<()> {
        let p = match ::std::mem::replace(&mut self.state, DtdState::Subset) {
            DtdState::Entity(p) => p,
            _ => return Ok(()),
        };
        let name = match p.name {
            Some(name) => name,
            None => return Err(syntax("Entity declaration without a name", position)),
        };
        let def = match (p.id, p.ndata) {
            (Some(mut id), ndata) => {
                let id = id.finish(position)?;
                match ndata {
                    Some(notation) if !notation.is_empty() => {
                        self.notation_refs.push((notation.clone(), position, false));
                        actions.push(DtdAction::UnparsedEntity {
                            name: name.clone(),
                            public_id: id.public_id.clone(),
                            system_id: id.system_id.clone(),
                            notation: notation.clone(),
                        });
                        EntityDef::Unparsed(id, notation)
                    }
                    Some(_) => return Err(syntax("NDATA requires a notation name", position)),
                    None => EntityDef::External(id),
                }
            }
            (None, _) => EntityDef::Internal(p.pieces),
        };
        if !dtd.add_entity(EntityDecl {
            name: name.clone(),
            parameter: p.parameter,
            def,
            base_uri: base_uri.map(|s| s.to_string()),
        }) {
            let prefix = if p.parameter { "%" } else { "&" };
            actions.push(DtdAction::Warning(format!(
                "Entity '{}{};' was already declared; ignoring the duplicate",
                prefix, name
            )));
        }
        Ok(())
    }

    fn handle_notation(
        &mut self,
        token: Token,
        text: Option<&str>,
        ws: bool,
        position: Position,
        from_internal: bool,
        dtd: &mut Dtd,
        actions: &mut Vec<DtdAction>,
    ) -> Result<()> {
        let p = match &mut self.state {
            DtdState::Notation(p) => p,
            _ => return Ok(()),
        };
        if let Token::ParamRef(_) = token {
            if from_internal {
                return Err(syntax(
                    "Parameter entity references are not allowed inside markup declarations in the internal subset",
                    position,
                ));
            }
            actions.push(DtdAction::ExpandPe(text.unwrap_or("").to_string()));
            return Ok(());
        }
        if let Token::Whitespace(_) = token {
            return Ok(());
        }
        if p.name.is_none() {
            return match token {
                Token::Name(_) => {
                    p.name = Some(text.unwrap_or("").to_string());
                    Ok(())
                }
                _ => Err(syntax("Expected a notation name", position)),
            };
        }
        if p.id.is_none() {
            return match token {
                Token::Name(_) => {
                    let name = text.unwrap_or("");
                    match keyword(name, &["SYSTEM", "PUBLIC"], position)? {
                        Some(kw) => {
                            p.id = Some(IdCollect::new(kw == "PUBLIC", true));
                            Ok(())
                        }
                        None => Err(syntax(
                            format!("Expected SYSTEM or PUBLIC, found '{}'", name),
                            position,
                        )),
                    }
                }
                _ => Err(syntax("Expected SYSTEM or PUBLIC", position)),
            };
        }
        let id = match p.id.as_mut() {
            Some(id) => id,
            None => return Err(syntax("Malformed notation declaration", position)),
        };
        match token {
            Token::Gt => {
                let p = match ::std::mem::replace(&mut self.state, DtdState::Subset) {
                    DtdState::Notation(p) => p,
                    _ => return Ok(()),
                };
                let name = p.name.unwrap_or_default();
                let id = match p.id {
                    Some(mut id) => id.finish(position)?,
                    None => ExternalId::default(),
                };
                actions.push(DtdAction::Notation {
                    name: name.clone(),
                    public_id: id.public_id.clone(),
                    system_id: id.system_id.clone(),
                });
                if !dtd.add_notation(NotationDecl {
                    name: name.clone(),
                    id,
                }) {
                    actions.push(DtdAction::Warning(format!(
                        "Notation '{}' was already declared; ignoring the duplicate",
                        name
                    )));
                }
                Ok(())
            }
            _ => match id.offer(token, text, ws, position, actions)? {
                Offer::Taken => Ok(()),
                Offer::NotMine => Err(syntax("Malformed notation declaration", position)),
            },
        }
    }
}
