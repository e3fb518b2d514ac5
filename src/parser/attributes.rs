//! Attribute value assembly and normalization.
//!
//! The tokenizer delivers an attribute value as a sequence of pieces
//! (text runs, resolved character references, unresolved general entity
//! references). Normalization follows the XML rules: literal whitespace
//! becomes a space, references contribute their characters untouched,
//! entity references expand recursively with a cycle check, and values of
//! tokenized (non-CDATA) types have their spaces collapsed.

use crate::dtd::{Dtd, EntityDef, ValuePiece};
use crate::errors::{Error, Position, Result};

/// One piece of a raw attribute value as collected from the token stream.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum AttrPiece {
    /// A literal text run.
    Text(String),
    /// A character or predefined entity reference, already resolved.
    CharRef(char),
    /// A general entity reference, expanded during normalization.
    Ref(String),
}

/// An attribute as written in the start tag, before normalization.
#[derive(Debug)]
pub(crate) struct RawAttribute {
    pub name: String,
    pub pieces: Vec<AttrPiece>,
    pub position: Position,
}

/// Normalizes a collected attribute value. `tokenized` selects the
/// additional space collapsing of non-CDATA declared types.
pub(crate) fn normalize(
    pieces: &[AttrPiece],
    tokenized: bool,
    dtd: &Dtd,
    position: Position,
) -> Result<String> {
    let mut out = String::new();
    for piece in pieces {
        match piece {
            AttrPiece::Text(text) => push_literal(text, &mut out),
            AttrPiece::CharRef(c) => out.push(*c),
            AttrPiece::Ref(name) => {
                let mut active: Vec<String> = Vec::new();
                expand_entity(name, dtd, &mut active, &mut out, position)?;
            }
        }
    }
    if tokenized {
        Ok(collapse_spaces(&out))
    } else {
        Ok(out)
    }
}

/// Expands the value pieces of an ATTLIST default the same way a
/// document-supplied value is expanded.
pub(crate) fn normalize_default(
    pieces: &[ValuePiece],
    tokenized: bool,
    dtd: &Dtd,
    position: Position,
) -> Result<String> {
    let mut out = String::new();
    let mut active: Vec<String> = Vec::new();
    expand_pieces(pieces, dtd, &mut active, &mut out, position)?;
    if tokenized {
        Ok(collapse_spaces(&out))
    } else {
        Ok(out)
    }
}

/// Literal text contributes its characters with whitespace mapped to
/// space. The decoder already folded CR and CRLF into LF.
fn push_literal(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '\t' | '\n' | '\r' => out.push(' '),
            c => out.push(c),
        }
    }
}

fn expand_entity(
    name: &str,
    dtd: &Dtd,
    active: &mut Vec<String>,
    out: &mut String,
    position: Position,
) -> Result<()> {
    if active.iter().any(|n| n == name) {
        return Err(Error::RecursiveEntity(name.to_string(), position));
    }
    let decl = match dtd.general_entity(name) {
        Some(decl) => decl,
        None => return Err(Error::UndeclaredEntity(name.to_string(), position)),
    };
    let pieces = match &decl.def {
        EntityDef::Internal(pieces) => pieces,
        EntityDef::External(_) => {
            return Err(Error::Syntax(
                format!("External entity '&{};' is not allowed in attribute values", name),
                position,
            ))
        }
        EntityDef::Unparsed(..) => {
            return Err(Error::Syntax(
                format!("Unparsed entity '&{};' is not allowed in attribute values", name),
                position,
            ))
        }
    };
    active.push(name.to_string());
    expand_pieces(pieces, dtd, active, out, position)?;
    active.pop();
    Ok(())
}

fn expand_pieces(
    pieces: &[ValuePiece],
    dtd: &Dtd,
    active: &mut Vec<String>,
    out: &mut String,
    position: Position,
) -> Result<()> {
    for piece in pieces {
        match piece {
            ValuePiece::Text(text) => {
                if text.contains('<') {
                    return Err(Error::Syntax(
                        "'<' is not allowed in attribute values, even through entities"
                            .to_string(),
                        position,
                    ));
                }
                push_literal(text, out);
            }
            ValuePiece::CharRef(c) => out.push(*c),
            ValuePiece::GeneralRef(name) => expand_entity(name, dtd, active, out, position)?,
            ValuePiece::ParamRef(name) => {
                // Parameter entity text spliced into an entity value; it
                // follows the same rules once it lands in an attribute.
                let key = format!("%{}", name);
                if active.iter().any(|n| n == &key) {
                    return Err(Error::RecursiveEntity(name.to_string(), position));
                }
                let decl = match dtd.parameter_entity(name) {
                    Some(decl) => decl,
                    None => {
                        return Err(Error::UndeclaredEntity(name.to_string(), position))
                    }
                };
                let nested = match &decl.def {
                    EntityDef::Internal(pieces) => pieces,
                    _ => {
                        return Err(Error::Syntax(
                            format!(
                                "External parameter entity '%{};' cannot contribute to an attribute value",
                                name
                            ),
                            position,
                        ))
                    }
                };
                active.push(key);
                expand_pieces(nested, dtd, active, out, position)?;
                active.pop();
            }
        }
    }
    Ok(())
}

/// Collapses runs of spaces and strips leading and trailing spaces, the
/// final step for tokenized attribute types.
fn collapse_spaces(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_space = false;
    for c in value.chars() {
        if c == ' ' {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dtd::EntityDecl;
    use pretty_assertions::assert_eq;

    fn pos() -> Position {
        Position::start()
    }

    fn internal(name: &str, pieces: Vec<ValuePiece>) -> EntityDecl {
        EntityDecl {
            name: name.to_string(),
            parameter: false,
            def: EntityDef::Internal(pieces),
            base_uri: None,
        }
    }

    #[test]
    fn literal_whitespace_becomes_space() {
        let dtd = Dtd::default();
        let pieces = [AttrPiece::Text("a\tb\nc".to_string())];
        assert_eq!(normalize(&pieces, false, &dtd, pos()).unwrap(), "a b c");
    }

    #[test]
    fn char_ref_whitespace_is_preserved() {
        let dtd = Dtd::default();
        let pieces = [
            AttrPiece::Text("a".to_string()),
            AttrPiece::CharRef('\t'),
            AttrPiece::Text("b".to_string()),
        ];
        assert_eq!(normalize(&pieces, false, &dtd, pos()).unwrap(), "a\tb");
    }

    #[test]
    fn tokenized_values_collapse() {
        let dtd = Dtd::default();
        let pieces = [AttrPiece::Text("  a   b  ".to_string())];
        assert_eq!(normalize(&pieces, true, &dtd, pos()).unwrap(), "a b");
        assert_eq!(normalize(&pieces, false, &dtd, pos()).unwrap(), "  a   b  ");
    }

    #[test]
    fn entity_expansion() {
        let mut dtd = Dtd::default();
        dtd.add_entity(internal(
            "e",
            vec![ValuePiece::Text("x".to_string()), ValuePiece::CharRef('&')],
        ));
        let pieces = [
            AttrPiece::Text("a".to_string()),
            AttrPiece::Ref("e".to_string()),
        ];
        assert_eq!(normalize(&pieces, false, &dtd, pos()).unwrap(), "ax&");
    }

    #[test]
    fn nested_entities_expand() {
        let mut dtd = Dtd::default();
        dtd.add_entity(internal(
            "outer",
            vec![
                ValuePiece::Text("[".to_string()),
                ValuePiece::GeneralRef("inner".to_string()),
                ValuePiece::Text("]".to_string()),
            ],
        ));
        dtd.add_entity(internal("inner", vec![ValuePiece::Text("x".to_string())]));
        let pieces = [AttrPiece::Ref("outer".to_string())];
        assert_eq!(normalize(&pieces, false, &dtd, pos()).unwrap(), "[x]");
    }

    #[test]
    fn recursive_entity_is_fatal() {
        let mut dtd = Dtd::default();
        dtd.add_entity(internal(
            "a",
            vec![ValuePiece::GeneralRef("b".to_string())],
        ));
        dtd.add_entity(internal(
            "b",
            vec![ValuePiece::GeneralRef("a".to_string())],
        ));
        let pieces = [AttrPiece::Ref("a".to_string())];
        assert!(matches!(
            normalize(&pieces, false, &dtd, pos()),
            Err(Error::RecursiveEntity(..))
        ));
    }

    #[test]
    fn undeclared_entity_is_fatal() {
        let dtd = Dtd::default();
        let pieces = [AttrPiece::Ref("nope".to_string())];
        assert!(matches!(
            normalize(&pieces, false, &dtd, pos()),
            Err(Error::UndeclaredEntity(..))
        ));
    }

    #[test]
    fn lt_through_entity_is_fatal() {
        let mut dtd = Dtd::default();
        dtd.add_entity(internal("e", vec![ValuePiece::Text("a<b".to_string())]));
        let pieces = [AttrPiece::Ref("e".to_string())];
        assert!(normalize(&pieces, false, &dtd, pos()).is_err());
    }

    #[test]
    fn external_entity_in_value_is_fatal() {
        let mut dtd = Dtd::default();
        dtd.add_entity(EntityDecl {
            name: "ext".to_string(),
            parameter: false,
            def: EntityDef::External(Default::default()),
            base_uri: None,
        });
        let pieces = [AttrPiece::Ref("ext".to_string())];
        assert!(normalize(&pieces, false, &dtd, pos()).is_err());
    }

    #[test]
    fn default_value_expansion() {
        let mut dtd = Dtd::default();
        dtd.add_entity(internal("e", vec![ValuePiece::Text("v".to_string())]));
        let pieces = vec![
            ValuePiece::Text("a ".to_string()),
            ValuePiece::GeneralRef("e".to_string()),
        ];
        assert_eq!(normalize_default(&pieces, false, &dtd, pos()).unwrap(), "a v");
    }
}
