//! The external-entity decoder: the first stage of the pipeline.
//!
//! Turns an ordered stream of byte chunks into normalized characters. The
//! decoder sniffs a byte order mark, parses the XML or text declaration
//! directly from bytes (before any charset object exists), selects and
//! validates the charset, then decodes incrementally and applies XML
//! line-ending normalization in a single pass.

use encoding_rs::{DecoderResult, Encoding, UTF_16BE, UTF_16LE, UTF_8};

use crate::errors::{Error, Result};

/// XML version of an entity.
///
/// The version governs the character range, the line-ending normalization
/// rules and which characters a character reference may designate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum XmlVersion {
    /// XML 1.0 (any edition; names follow the 5th edition productions)
    V1_0,
    /// XML 1.1
    V1_1,
}

impl XmlVersion {
    /// The version string as it appears in a declaration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1_0 => "1.0",
            Self::V1_1 => "1.1",
        }
    }
}

impl Default for XmlVersion {
    fn default() -> Self {
        Self::V1_0
    }
}

/// A detected byte order mark.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bom {
    /// No byte order mark was present
    None,
    /// `EF BB BF`
    Utf8,
    /// `FF FE`
    Utf16Le,
    /// `FE FF`
    Utf16Be,
}

impl Bom {
    /// Bytes an ASCII character occupies under the framing this mark implies.
    pub fn bytes_per_ascii_char(&self) -> usize {
        match self {
            Self::None | Self::Utf8 => 1,
            Self::Utf16Le | Self::Utf16Be => 2,
        }
    }

    /// The charset this mark implies when no encoding is declared.
    pub fn encoding(&self) -> &'static Encoding {
        match self {
            Self::None | Self::Utf8 => UTF_8,
            Self::Utf16Le => UTF_16LE,
            Self::Utf16Be => UTF_16BE,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Utf8 => 3,
            Self::Utf16Le | Self::Utf16Be => 2,
        }
    }
}

/// A parsed XML or text declaration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XmlDecl {
    /// Declared version, if any. Mandatory for the document entity.
    pub version: Option<XmlVersion>,
    /// Declared encoding name, verbatim.
    pub encoding: Option<String>,
    /// Declared standalone status. Document entity only.
    pub standalone: Option<bool>,
}

#[derive(Clone, Copy, PartialEq)]
enum DecoderState {
    Init,
    SeenBom,
    Content,
    Closed,
}

/// Decoder for one external entity (the document entity or an external
/// parsed entity).
///
/// Feed byte chunks with [`feed`](Self::feed); normalized characters are
/// appended to the output. A chunk may end anywhere, including inside the
/// byte order mark, the declaration or a multi-byte sequence; unconsumed
/// bytes are kept and resumed on the next call.
pub struct EntityDecoder {
    state: DecoderState,
    /// Document entity or external parsed entity (text declaration rules).
    document: bool,
    bom: Bom,
    decl: Option<XmlDecl>,
    hint: Option<&'static Encoding>,
    /// Version ceiling inherited from the including document.
    parent_version: XmlVersion,
    /// Effective version of this entity.
    version: XmlVersion,
    decoder: Option<encoding_rs::Decoder>,
    encoding: &'static Encoding,
    /// True when neither BOM nor declaration named the charset.
    fallback: bool,
    pending: Vec<u8>,
    scratch: String,
    last_was_cr: bool,
    bytes_consumed: usize,
}

impl EntityDecoder {
    /// Creates a decoder for the document entity.
    pub fn document(hint: Option<&'static Encoding>) -> Self {
        Self::new(true, hint, XmlVersion::V1_0)
    }

    /// Creates a decoder for an external parsed entity included from an
    /// entity of the given version.
    pub fn external_entity(hint: Option<&'static Encoding>, parent_version: XmlVersion) -> Self {
        Self::new(false, hint, parent_version)
    }

    fn new(document: bool, hint: Option<&'static Encoding>, parent_version: XmlVersion) -> Self {
        Self {
            state: DecoderState::Init,
            document,
            bom: Bom::None,
            decl: None,
            hint,
            parent_version,
            version: parent_version,
            decoder: None,
            encoding: UTF_8,
            fallback: false,
            pending: Vec::new(),
            scratch: String::new(),
            last_was_cr: false,
            bytes_consumed: 0,
        }
    }

    /// The parsed declaration, once the prolog has been decoded.
    pub fn decl(&self) -> Option<&XmlDecl> {
        self.decl.as_ref()
    }

    /// Effective XML version of this entity.
    pub fn version(&self) -> XmlVersion {
        self.version
    }

    /// Name of the active charset.
    pub fn encoding_name(&self) -> &'static str {
        self.encoding.name()
    }

    /// True when the charset was neither implied by a BOM nor declared and
    /// the decoder fell back to the caller hint or UTF-8.
    pub fn used_fallback(&self) -> bool {
        self.fallback
    }

    /// Replaces the fallback charset hint. Takes effect only while the
    /// charset has not been chosen yet.
    pub fn set_hint(&mut self, hint: Option<&'static Encoding>) {
        self.hint = hint;
    }

    /// Returns the decoder to its fresh state, keeping allocations.
    pub fn reset(&mut self) {
        self.state = DecoderState::Init;
        self.bom = Bom::None;
        self.decl = None;
        self.version = self.parent_version;
        self.decoder = None;
        self.encoding = UTF_8;
        self.fallback = false;
        self.pending.clear();
        self.scratch.clear();
        self.last_was_cr = false;
        self.bytes_consumed = 0;
    }

    /// Feeds a chunk of bytes, appending normalized characters to `out`.
    ///
    /// Returns without consuming when more bytes are needed to finish the
    /// BOM probe, the declaration or a multi-byte sequence.
    pub fn feed(&mut self, bytes: &[u8], out: &mut String) -> Result<()> {
        if self.state == DecoderState::Closed {
            return Err(Error::UnexpectedEof("Entity already closed".to_string()));
        }
        self.pending.extend_from_slice(bytes);
        self.advance(out, false)
    }

    /// Signals end of input, flushing any buffered state.
    ///
    /// An incomplete trailing byte sequence is fatal.
    pub fn finish(&mut self, out: &mut String) -> Result<()> {
        if self.state == DecoderState::Closed {
            return Ok(());
        }
        self.advance(out, true)?;
        self.state = DecoderState::Closed;
        Ok(())
    }

    fn advance(&mut self, out: &mut String, last: bool) -> Result<()> {
        if self.state == DecoderState::Init {
            match self.probe_bom(last) {
                Some(bom) => {
                    let skip = bom.len();
                    self.pending.drain(..skip);
                    self.bytes_consumed += skip;
                    self.bom = bom;
                    self.state = DecoderState::SeenBom;
                }
                None => return Ok(()),
            }
        }
        if self.state == DecoderState::SeenBom {
            match self.parse_decl(last)? {
                DeclOutcome::NeedData => return Ok(()),
                DeclOutcome::NoDecl => self.setup_charset(None)?,
                DeclOutcome::Decl { decl, consumed } => {
                    self.pending.drain(..consumed);
                    self.bytes_consumed += consumed;
                    self.apply_versions(&decl)?;
                    let declared = decl.encoding.clone();
                    self.decl = Some(decl);
                    self.setup_charset(declared)?;
                }
            }
            self.state = DecoderState::Content;
        }
        self.decode_pending(out, last)
    }

    /// Reads up to three leading bytes looking for a byte order mark.
    /// `None` means underflow: fewer than two bytes available and the
    /// prefix is still ambiguous.
    fn probe_bom(&self, last: bool) -> Option<Bom> {
        let p = &self.pending;
        match p.first() {
            Some(0xEF) => {
                if p.len() >= 3 {
                    if p[1] == 0xBB && p[2] == 0xBF {
                        Some(Bom::Utf8)
                    } else {
                        Some(Bom::None)
                    }
                } else if last {
                    Some(Bom::None)
                } else {
                    None
                }
            }
            Some(0xFE) => {
                if p.len() >= 2 {
                    if p[1] == 0xFF {
                        Some(Bom::Utf16Be)
                    } else {
                        Some(Bom::None)
                    }
                } else if last {
                    Some(Bom::None)
                } else {
                    None
                }
            }
            Some(0xFF) => {
                if p.len() >= 2 {
                    if p[1] == 0xFE {
                        Some(Bom::Utf16Le)
                    } else {
                        Some(Bom::None)
                    }
                } else if last {
                    Some(Bom::None)
                } else {
                    None
                }
            }
            Some(_) => Some(Bom::None),
            None => {
                if last {
                    Some(Bom::None)
                } else {
                    None
                }
            }
        }
    }

    /// Detects the framing for declaration parsing when no BOM is present,
    /// following the recommended algorithm of appendix F: a leading
    /// `00 3C` or `3C 00` betrays a 16-bit encoding even without a mark.
    fn framing(&self) -> (usize, bool) {
        match self.bom {
            Bom::Utf16Le => (2, false),
            Bom::Utf16Be => (2, true),
            Bom::Utf8 => (1, false),
            Bom::None => match (self.pending.first(), self.pending.get(1)) {
                (Some(0x00), Some(0x3C)) => (2, true),
                (Some(0x3C), Some(0x00)) => (2, false),
                _ => (1, false),
            },
        }
    }

    fn parse_decl(&mut self, last: bool) -> Result<DeclOutcome> {
        let (width, be) = self.framing();
        let mut cur = AsciiCursor {
            bytes: &self.pending,
            pos: 0,
            width,
            be,
        };
        // Commit only after `<?xml` followed by whitespace; `<?xml-stylesheet`
        // and friends are ordinary processing instructions.
        for expect in "<?xml".chars() {
            match cur.next() {
                Ascii::Byte(b) if b as char == expect => {}
                Ascii::Byte(_) | Ascii::NonAscii => return Ok(DeclOutcome::NoDecl),
                Ascii::Underflow => {
                    return if last {
                        Ok(DeclOutcome::NoDecl)
                    } else {
                        Ok(DeclOutcome::NeedData)
                    }
                }
            }
        }
        match cur.next() {
            Ascii::Byte(b) if is_ascii_ws(b) => {}
            Ascii::Byte(_) | Ascii::NonAscii => return Ok(DeclOutcome::NoDecl),
            Ascii::Underflow => {
                return if last {
                    Ok(DeclOutcome::NoDecl)
                } else {
                    Ok(DeclOutcome::NeedData)
                }
            }
        }

        let mut decl = XmlDecl::default();
        loop {
            cur.skip_ws();
            match cur.peek() {
                Ascii::Underflow => {
                    return if last {
                        Ok(DeclOutcome::NoDecl)
                    } else {
                        Ok(DeclOutcome::NeedData)
                    }
                }
                Ascii::NonAscii => {
                    return Err(Error::Syntax(
                        "Non-ASCII character in XML declaration".to_string(),
                        self.decl_position(&cur),
                    ))
                }
                Ascii::Byte(b'?') => {
                    cur.next();
                    match cur.next() {
                        Ascii::Byte(b'>') => {
                            self.check_decl(&decl)?;
                            return Ok(DeclOutcome::Decl {
                                decl,
                                consumed: cur.pos,
                            });
                        }
                        Ascii::Underflow if !last => return Ok(DeclOutcome::NeedData),
                        _ => return Ok(DeclOutcome::NoDecl),
                    }
                }
                Ascii::Byte(_) => {}
            }
            let name = match cur.read_name() {
                Ok(Some(name)) => name,
                Ok(None) => {
                    return if last {
                        Ok(DeclOutcome::NoDecl)
                    } else {
                        Ok(DeclOutcome::NeedData)
                    }
                }
                Err(()) => {
                    return Err(Error::Syntax(
                        "Non-ASCII character in XML declaration".to_string(),
                        self.decl_position(&cur),
                    ))
                }
            };
            let value = match cur.read_eq_and_value() {
                Ok(Some(value)) => value,
                Ok(None) => {
                    return if last {
                        Ok(DeclOutcome::NoDecl)
                    } else {
                        Ok(DeclOutcome::NeedData)
                    }
                }
                Err(CursorError::NonAscii) => {
                    return Err(Error::Syntax(
                        "Non-ASCII character in XML declaration".to_string(),
                        self.decl_position(&cur),
                    ))
                }
                Err(CursorError::Malformed) => return Ok(DeclOutcome::NoDecl),
            };
            self.apply_pseudo_attr(&mut decl, &name, &value, &cur)?;
        }
    }

    fn decl_position(&self, cur: &AsciiCursor) -> crate::errors::Position {
        crate::errors::Position {
            line: 1,
            column: (cur.pos / cur.width) as u64 + 1,
            offset: (cur.pos / cur.width) as u64,
        }
    }

    fn apply_pseudo_attr(
        &self,
        decl: &mut XmlDecl,
        name: &str,
        value: &str,
        cur: &AsciiCursor,
    ) -> Result<()> {
        let pos = self.decl_position(cur);
        match name {
            "version" if decl.version.is_none() && decl.encoding.is_none() => {
                decl.version = Some(parse_version(value, pos)?);
            }
            "encoding" if decl.encoding.is_none() && decl.standalone.is_none() => {
                if !is_encoding_name(value) {
                    return Err(Error::UnknownEncoding(value.to_string()));
                }
                decl.encoding = Some(value.to_string());
            }
            "standalone" if self.document && decl.standalone.is_none() => {
                decl.standalone = Some(match value {
                    "yes" => true,
                    "no" => false,
                    _ => {
                        return Err(Error::Syntax(
                            format!("standalone must be 'yes' or 'no', got '{}'", value),
                            pos,
                        ))
                    }
                });
            }
            _ => {
                return Err(Error::Syntax(
                    format!("Unexpected '{}' in XML declaration", name),
                    pos,
                ))
            }
        }
        Ok(())
    }

    fn check_decl(&self, decl: &XmlDecl) -> Result<()> {
        let pos = crate::errors::Position::start();
        if self.document && decl.version.is_none() {
            return Err(Error::Syntax(
                "XML declaration must declare a version".to_string(),
                pos,
            ));
        }
        Ok(())
    }

    fn apply_versions(&mut self, decl: &XmlDecl) -> Result<()> {
        if let Some(version) = decl.version {
            if self.document {
                self.version = version;
            } else {
                // An XML 1.0 document must not include an XML 1.1 entity;
                // the effective version is the lower of the two.
                if self.parent_version == XmlVersion::V1_0 && version == XmlVersion::V1_1 {
                    return Err(Error::Syntax(
                        "XML 1.1 entity included from an XML 1.0 document".to_string(),
                        crate::errors::Position::start(),
                    ));
                }
                self.version = self.parent_version.min(version);
            }
        }
        Ok(())
    }

    fn setup_charset(&mut self, declared: Option<String>) -> Result<()> {
        let encoding = match declared {
            Some(label) => {
                let declared_enc = Encoding::for_label(label.as_bytes())
                    .ok_or_else(|| Error::UnknownEncoding(label.clone()))?;
                match self.bom {
                    Bom::Utf16Le | Bom::Utf16Be => {
                        if declared_enc != UTF_16LE && declared_enc != UTF_16BE {
                            return Err(Error::EncodingMismatch {
                                declared: label,
                                detected: self.bom.encoding().name(),
                            });
                        }
                        if label.eq_ignore_ascii_case("utf-16") {
                            // Generic label defers to the mark for endianness
                            self.bom.encoding()
                        } else if declared_enc != self.bom.encoding() {
                            return Err(Error::EncodingMismatch {
                                declared: label,
                                detected: self.bom.encoding().name(),
                            });
                        } else {
                            declared_enc
                        }
                    }
                    Bom::Utf8 => {
                        if declared_enc == UTF_16LE || declared_enc == UTF_16BE {
                            return Err(Error::EncodingMismatch {
                                declared: label,
                                detected: "UTF-8",
                            });
                        }
                        declared_enc
                    }
                    Bom::None => declared_enc,
                }
            }
            None => match self.bom {
                Bom::None => {
                    self.fallback = true;
                    self.hint.unwrap_or(UTF_8)
                }
                bom => bom.encoding(),
            },
        };
        self.encoding = encoding;
        self.decoder = Some(encoding.new_decoder_without_bom_handling());
        Ok(())
    }

    fn decode_pending(&mut self, out: &mut String, last: bool) -> Result<()> {
        let decoder = match self.decoder.as_mut() {
            Some(d) => d,
            None => return Ok(()),
        };
        let mut consumed = 0;
        loop {
            self.scratch.clear();
            if self.scratch.capacity() < 8192 {
                self.scratch.reserve(8192);
            }
            let (result, read) = decoder.decode_to_string_without_replacement(
                &self.pending[consumed..],
                &mut self.scratch,
                last,
            );
            consumed += read;
            normalize_line_endings(&self.scratch, self.version, &mut self.last_was_cr, out);
            match result {
                DecoderResult::InputEmpty => break,
                DecoderResult::OutputFull => continue,
                DecoderResult::Malformed(_, _) => {
                    return Err(Error::NonDecodable {
                        encoding: self.encoding.name(),
                        offset: self.bytes_consumed + consumed,
                    });
                }
            }
        }
        self.pending.drain(..consumed);
        self.bytes_consumed += consumed;
        Ok(())
    }
}

enum DeclOutcome {
    /// More bytes needed; the byte position is preserved.
    NeedData,
    /// No declaration present; every byte belongs to the content.
    NoDecl,
    /// Declaration recognized; `consumed` bytes covered it.
    Decl { decl: XmlDecl, consumed: usize },
}

/// XML line-ending normalization over one decoded slice.
///
/// CR and CR+LF collapse to a single LF; a CR at a chunk boundary is
/// remembered in the `last_was_cr` latch so the following chunk's LF (or,
/// in 1.1, NEL) is swallowed. XML 1.1 additionally folds NEL and LS.
fn normalize_line_endings(
    input: &str,
    version: XmlVersion,
    last_was_cr: &mut bool,
    out: &mut String,
) {
    for c in input.chars() {
        match c {
            '\r' => {
                out.push('\n');
                *last_was_cr = true;
            }
            '\n' => {
                if !*last_was_cr {
                    out.push('\n');
                }
                *last_was_cr = false;
            }
            '\u{85}' if version == XmlVersion::V1_1 => {
                if !*last_was_cr {
                    out.push('\n');
                }
                *last_was_cr = false;
            }
            '\u{2028}' if version == XmlVersion::V1_1 => {
                out.push('\n');
                *last_was_cr = false;
            }
            _ => {
                out.push(c);
                *last_was_cr = false;
            }
        }
    }
}

fn is_ascii_ws(b: u8) -> bool {
    match b {
        b' ' | b'\t' | b'\r' | b'\n' => true,
        _ => false,
    }
}

fn parse_version(value: &str, pos: crate::errors::Position) -> Result<XmlVersion> {
    let valid = match value.find('.') {
        Some(dot) => {
            let (major, minor) = (&value[..dot], &value[dot + 1..]);
            !major.is_empty()
                && !minor.is_empty()
                && major.bytes().all(|b| b.is_ascii_digit())
                && minor.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    };
    if !valid || !value.starts_with("1.") {
        return Err(Error::Syntax(
            format!("Unsupported XML version '{}'", value),
            pos,
        ));
    }
    Ok(if value == "1.1" {
        XmlVersion::V1_1
    } else {
        XmlVersion::V1_0
    })
}

fn is_encoding_name(s: &str) -> bool {
    let mut bytes = s.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

/// ASCII-at-width cursor over undecoded declaration bytes.
struct AsciiCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    width: usize,
    be: bool,
}

enum Ascii {
    Underflow,
    NonAscii,
    Byte(u8),
}

enum CursorError {
    NonAscii,
    Malformed,
}

impl<'a> AsciiCursor<'a> {
    fn peek(&self) -> Ascii {
        if self.pos + self.width > self.bytes.len() {
            return Ascii::Underflow;
        }
        if self.width == 1 {
            let b = self.bytes[self.pos];
            if b < 0x80 {
                Ascii::Byte(b)
            } else {
                Ascii::NonAscii
            }
        } else {
            let (hi, lo) = if self.be {
                (self.bytes[self.pos], self.bytes[self.pos + 1])
            } else {
                (self.bytes[self.pos + 1], self.bytes[self.pos])
            };
            if hi == 0 && lo < 0x80 {
                Ascii::Byte(lo)
            } else {
                Ascii::NonAscii
            }
        }
    }

    fn next(&mut self) -> Ascii {
        let result = self.peek();
        if let Ascii::Byte(_) | Ascii::NonAscii = result {
            self.pos += self.width;
        }
        result
    }

    fn skip_ws(&mut self) {
        while let Ascii::Byte(b) = self.peek() {
            if is_ascii_ws(b) {
                self.pos += self.width;
            } else {
                break;
            }
        }
    }

    /// Reads a pseudo-attribute name. `Ok(None)` is underflow, `Err` a
    /// non-ASCII character.
    fn read_name(&mut self) -> ::std::result::Result<Option<String>, ()> {
        let mut name = String::new();
        loop {
            match self.peek() {
                Ascii::Byte(b) if b.is_ascii_alphabetic() => {
                    name.push(b as char);
                    self.pos += self.width;
                }
                Ascii::Byte(_) => return Ok(Some(name)),
                Ascii::NonAscii => return Err(()),
                Ascii::Underflow => return Ok(None),
            }
        }
    }

    /// Reads `= "value"` (either quote, optional surrounding whitespace).
    fn read_eq_and_value(&mut self) -> ::std::result::Result<Option<String>, CursorError> {
        self.skip_ws();
        match self.next() {
            Ascii::Byte(b'=') => {}
            Ascii::Underflow => return Ok(None),
            Ascii::NonAscii => return Err(CursorError::NonAscii),
            Ascii::Byte(_) => return Err(CursorError::Malformed),
        }
        self.skip_ws();
        let quote = match self.next() {
            Ascii::Byte(b @ b'"') | Ascii::Byte(b @ b'\'') => b,
            Ascii::Underflow => return Ok(None),
            Ascii::NonAscii => return Err(CursorError::NonAscii),
            Ascii::Byte(_) => return Err(CursorError::Malformed),
        };
        let mut value = String::new();
        loop {
            match self.next() {
                Ascii::Byte(b) if b == quote => return Ok(Some(value)),
                Ascii::Byte(b) => value.push(b as char),
                Ascii::Underflow => return Ok(None),
                Ascii::NonAscii => return Err(CursorError::NonAscii),
            }
        }
    }
}
