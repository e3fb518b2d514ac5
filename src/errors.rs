//! Error management module

use std::fmt;
use std::str::Utf8Error;

/// A position inside a parsed entity, as tracked by the tokenizer.
///
/// `line` and `column` are 1-based and counted in characters after
/// line-ending normalization. `offset` is the number of characters consumed
/// from the start of the entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Position {
    /// 1-based line number. Lines are delimited by normalized line feeds.
    pub line: u64,
    /// 1-based column number within the current line.
    pub column: u64,
    /// Characters consumed since the start of the entity.
    pub offset: u64,
}

impl Position {
    /// The position of the first character of an entity.
    pub fn start() -> Self {
        Self {
            line: 1,
            column: 1,
            offset: 0,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// The error type used by this crate.
///
/// Only non-recoverable conditions are represented here: I/O problems,
/// decoding failures and well-formedness violations. Validity problems are
/// reported through [`EventSink::error`](crate::sax::EventSink::error) and
/// do not abort the parse.
#[derive(Debug)]
pub enum Error {
    /// IO error while pulling bytes from an external entity source
    Io(::std::io::Error),
    /// Input could not be decoded with the active character encoding
    NonDecodable {
        /// Name of the encoding that rejected the input
        encoding: &'static str,
        /// Byte offset of the offending sequence within the entity
        offset: usize,
    },
    /// The declared encoding name is not a known charset label
    UnknownEncoding(String),
    /// The declared encoding contradicts the detected byte order mark
    EncodingMismatch {
        /// Encoding named by the XML or text declaration
        declared: String,
        /// Name of the encoding implied by the byte order mark
        detected: &'static str,
    },
    /// A character outside the XML character range for the active version
    IllegalChar(char, Position),
    /// End of input inside the named construct
    UnexpectedEof(String),
    /// Well-formedness violation; the message names the violated production
    Syntax(String, Position),
    /// End tag name does not match the open element
    EndEventMismatch {
        /// Name of the element that is open
        expected: String,
        /// Name found in the end tag
        found: String,
        /// Where the end tag was found
        position: Position,
    },
    /// Entity expansion references an entity already being expanded
    RecursiveEntity(String, Position),
    /// Reference to a general entity with no declaration
    UndeclaredEntity(String, Position),
    /// A DTD keyword written with the wrong case
    KeywordCase {
        /// The keyword as it must be written
        expected: &'static str,
        /// The keyword as it was found
        found: String,
        /// Where the keyword was found
        position: Position,
    },
    /// Element or attribute name uses a prefix with no namespace binding
    UnboundPrefix(String, Position),
    /// The same attribute appears twice in one start tag
    DuplicateAttribute(String, Position),
    /// An element opened inside an entity was not closed inside it
    EntityBoundary(String, Position),
    /// The parse was aborted by the event sink
    Aborted(String),
}

impl Error {
    /// The position the error was raised at, when one is known.
    pub fn position(&self) -> Option<Position> {
        match self {
            Self::IllegalChar(_, p)
            | Self::Syntax(_, p)
            | Self::EndEventMismatch { position: p, .. }
            | Self::RecursiveEntity(_, p)
            | Self::UndeclaredEntity(_, p)
            | Self::KeywordCase { position: p, .. }
            | Self::UnboundPrefix(_, p)
            | Self::DuplicateAttribute(_, p)
            | Self::EntityBoundary(_, p) => Some(*p),
            _ => None,
        }
    }
}

impl From<::std::io::Error> for Error {
    /// Creates a new `Error::Io` from the given error
    #[inline]
    fn from(error: ::std::io::Error) -> Error {
        Error::Io(error)
    }
}

impl From<Utf8Error> for Error {
    /// Creates a new `Error::NonDecodable` from the given error
    #[inline]
    fn from(error: Utf8Error) -> Error {
        Error::NonDecodable {
            encoding: "UTF-8",
            offset: error.valid_up_to(),
        }
    }
}

/// A specialized `Result` type where the error is hard-wired to [`Error`].
pub type Result<T> = ::std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::NonDecodable { encoding, offset } => write!(
                f,
                "Malformed input for encoding {} at byte {}",
                encoding, offset
            ),
            Error::UnknownEncoding(name) => write!(f, "Unknown encoding '{}'", name),
            Error::EncodingMismatch { declared, detected } => write!(
                f,
                "Declared encoding '{}' conflicts with detected {}",
                declared, detected
            ),
            Error::IllegalChar(c, p) => {
                write!(f, "Character U+{:04X} is not allowed at {}", *c as u32, p)
            }
            Error::UnexpectedEof(e) => write!(f, "Unexpected EOF during reading {}", e),
            Error::Syntax(msg, p) => write!(f, "{} at {}", msg, p),
            Error::EndEventMismatch {
                expected,
                found,
                position,
            } => write!(
                f,
                "Expecting </{}> found </{}> at {}",
                expected, found, position
            ),
            Error::RecursiveEntity(name, p) => write!(
                f,
                "Circular entity reference detected: &{}; at {}",
                name, p
            ),
            Error::UndeclaredEntity(name, p) => {
                write!(f, "Reference to undeclared entity &{}; at {}", name, p)
            }
            Error::KeywordCase {
                expected,
                found,
                position,
            } => write!(
                f,
                "DTD keyword '{}' must be written '{}' at {}",
                found, expected, position
            ),
            Error::UnboundPrefix(prefix, p) => {
                write!(f, "Namespace prefix '{}' is not bound at {}", prefix, p)
            }
            Error::DuplicateAttribute(name, p) => {
                write!(f, "Duplicate attribute '{}' at {}", name, p)
            }
            Error::EntityBoundary(name, p) => write!(
                f,
                "Element '{}' must end within the entity it started in, at {}",
                name, p
            ),
            Error::Aborted(msg) => write!(f, "Parse aborted by handler: {}", msg),
        }
    }
}

impl ::std::error::Error for Error {
    fn source(&self) -> Option<&(dyn (::std::error::Error) + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn position_display() {
        let p = Position {
            line: 3,
            column: 14,
            offset: 70,
        };
        assert_eq!(p.to_string(), "3:14");
    }

    #[test]
    fn recursive_entity_message() {
        let e = Error::RecursiveEntity("e".to_string(), Position::start());
        assert_eq!(
            e.to_string(),
            "Circular entity reference detected: &e; at 1:1"
        );
    }

    #[test]
    fn end_mismatch_message() {
        let e = Error::EndEventMismatch {
            expected: "a".to_string(),
            found: "b".to_string(),
            position: Position {
                line: 1,
                column: 5,
                offset: 4,
            },
        };
        assert_eq!(e.to_string(), "Expecting </a> found </b> at 1:5");
    }
}
