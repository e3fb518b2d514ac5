//! Validity checking: content models, attribute types, ID/IDREF tracking.
//!
//! Everything here reports through plain strings; the parser routes them
//! to the sink's error hook and continues, so validation never changes the
//! event sequence.

use std::collections::HashSet;

use crate::chars;
use crate::dtd::{AttType, ContentNode, ContentNodeKind, ContentSpec, Dtd, EntityDef, Occurrence};
use crate::errors::Position;

/// Matches the recorded children of a closing element against its
/// declared content. `had_text` covers any character data,
/// `had_nonws_text` character data beyond whitespace.
pub fn check_content(
    element: &str,
    spec: &ContentSpec,
    children: &[String],
    had_text: bool,
    had_nonws_text: bool,
) -> Option<String> {
    match spec {
        ContentSpec::Any => None,
        ContentSpec::Empty => {
            if !children.is_empty() || had_text {
                Some(format!("Element '{}' is declared EMPTY", element))
            } else {
                None
            }
        }
        ContentSpec::Mixed(names) => {
            for child in children {
                if !names.contains(child) {
                    return Some(format!(
                        "Element '{}' is not allowed in the mixed content of '{}'",
                        child, element
                    ));
                }
            }
            None
        }
        ContentSpec::Children(model) => {
            if had_nonws_text {
                return Some(format!(
                    "Character data is not allowed in the element content of '{}'",
                    element
                ));
            }
            let mut index = 0;
            let matched = match_with_occurrence(model, children, &mut index);
            if matched && index == children.len() {
                None
            } else {
                Some(format!(
                    "The content of element '{}' does not match its declaration",
                    element
                ))
            }
        }
    }
}

/// Matches one node with its occurrence indicator, advancing `index` over
/// consumed children. The matcher is greedy; XML requires content models
/// to be deterministic, so greed never changes the answer for a
/// conforming declaration.
fn match_with_occurrence(node: &ContentNode, children: &[String], index: &mut usize) -> bool {
    match node.occurrence {
        Occurrence::Once => match_node(node, children, index),
        Occurrence::Optional => {
            let mark = *index;
            if !match_node(node, children, index) {
                *index = mark;
            }
            true
        }
        Occurrence::ZeroOrMore => {
            loop {
                let mark = *index;
                if !match_node(node, children, index) || *index == mark {
                    *index = mark;
                    break;
                }
            }
            true
        }
        Occurrence::OneOrMore => {
            if !match_node(node, children, index) {
                return false;
            }
            loop {
                let mark = *index;
                if !match_node(node, children, index) || *index == mark {
                    *index = mark;
                    break;
                }
            }
            true
        }
    }
}

fn match_node(node: &ContentNode, children: &[String], index: &mut usize) -> bool {
    match &node.kind {
        ContentNodeKind::Element(name) => {
            if children.get(*index).map(|c| c == name).unwrap_or(false) {
                *index += 1;
                true
            } else {
                false
            }
        }
        ContentNodeKind::Sequence => {
            let mark = *index;
            for child in &node.children {
                if !match_with_occurrence(child, children, index) {
                    *index = mark;
                    return false;
                }
            }
            true
        }
        ContentNodeKind::Choice => {
            for child in &node.children {
                let mark = *index;
                if match_with_occurrence(child, children, index) && *index > mark {
                    return true;
                }
                *index = mark;
            }
            // An alternative that consumes nothing still satisfies the
            // choice when every branch is optional.
            node.children.iter().any(is_nullable)
        }
    }
}

fn is_nullable(node: &ContentNode) -> bool {
    match node.occurrence {
        Occurrence::Optional | Occurrence::ZeroOrMore => true,
        _ => match &node.kind {
            ContentNodeKind::Element(_) => false,
            ContentNodeKind::Sequence => node.children.iter().all(is_nullable),
            ContentNodeKind::Choice => node.children.iter().any(is_nullable),
        },
    }
}

/// Document-wide ID and IDREF bookkeeping.
#[derive(Default)]
pub struct IdTracker {
    ids: HashSet<String>,
    pending: Vec<(String, Position)>,
}

impl IdTracker {
    /// Records an ID value; reports a duplicate.
    pub fn declare(&mut self, value: &str) -> Option<String> {
        if self.ids.insert(value.to_string()) {
            None
        } else {
            Some(format!("ID '{}' already declared", value))
        }
    }

    /// Records an IDREF value for the end-of-document check.
    pub fn reference(&mut self, value: &str, position: Position) {
        self.pending.push((value.to_string(), position));
    }

    /// The end-of-document sweep: every IDREF must name a declared ID.
    pub fn unresolved(&mut self) -> Vec<(String, Position)> {
        let ids = &self.ids;
        self.pending
            .drain(..)
            .filter(|(value, _)| !ids.contains(value))
            .collect()
    }

    /// Clears all recorded state.
    pub fn reset(&mut self) {
        self.ids.clear();
        self.pending.clear();
    }
}

/// Validates one normalized attribute value against its declared type.
/// Structural problems are returned as messages; ID/IDREF values are also
/// recorded on the tracker.
pub fn check_attribute(
    element: &str,
    attribute: &str,
    value: &str,
    att_type: &AttType,
    namespaces: bool,
    dtd: &Dtd,
    ids: &mut IdTracker,
    position: Position,
) -> Vec<String> {
    let mut errors = Vec::new();
    let label = |msg: String| format!("Attribute '{}' of '{}': {}", attribute, element, msg);
    match att_type {
        AttType::Cdata => {}
        AttType::Nmtoken => {
            if !chars::is_nmtoken(value) {
                errors.push(label(format!("'{}' is not a name token", value)));
            }
        }
        AttType::Nmtokens => {
            if value.is_empty() {
                errors.push(label("at least one name token is required".to_string()));
            }
            for token in value.split(' ') {
                if !chars::is_nmtoken(token) {
                    errors.push(label(format!("'{}' is not a name token", token)));
                }
            }
        }
        AttType::Id => {
            if !is_valid_name(value, namespaces) {
                errors.push(label(format!("'{}' is not a valid ID name", value)));
            } else if let Some(msg) = ids.declare(value) {
                errors.push(msg);
            }
        }
        AttType::Idref => {
            if !is_valid_name(value, namespaces) {
                errors.push(label(format!("'{}' is not a valid IDREF name", value)));
            } else {
                ids.reference(value, position);
            }
        }
        AttType::Idrefs => {
            if value.is_empty() {
                errors.push(label("at least one IDREF is required".to_string()));
            }
            for token in value.split(' ') {
                if !is_valid_name(token, namespaces) {
                    errors.push(label(format!("'{}' is not a valid IDREF name", token)));
                } else {
                    ids.reference(token, position);
                }
            }
        }
        AttType::Entity => {
            check_entity_name(value, dtd, &label, &mut errors);
        }
        AttType::Entities => {
            if value.is_empty() {
                errors.push(label("at least one entity name is required".to_string()));
            }
            for token in value.split(' ') {
                check_entity_name(token, dtd, &label, &mut errors);
            }
        }
        AttType::Notation(allowed) => {
            if !allowed.iter().any(|n| n == value) {
                errors.push(label(format!(
                    "'{}' is not among the declared notations",
                    value
                )));
            } else if dtd.notation(value).is_none() {
                errors.push(label(format!("notation '{}' is not declared", value)));
            }
        }
        AttType::Enumeration(allowed) => {
            if !allowed.iter().any(|v| v == value) {
                errors.push(label(format!("'{}' is not among the enumerated values", value)));
            }
        }
    }
    errors
}

fn check_entity_name(
    value: &str,
    dtd: &Dtd,
    label: &dyn Fn(String) -> String,
    errors: &mut Vec<String>,
) {
    match dtd.general_entity(value) {
        Some(decl) => {
            if !matches!(decl.def, EntityDef::Unparsed(..)) {
                errors.push(label(format!("entity '{}' is not unparsed", value)));
            }
        }
        None => errors.push(label(format!("entity '{}' is not declared", value))),
    }
}

fn is_valid_name(value: &str, namespaces: bool) -> bool {
    chars::is_name(value) && !(namespaces && value.contains(':'))
}
