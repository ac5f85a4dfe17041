//! Managed identifier validation (class and method names).

use crate::tables::{MAX_CLASS_NAME_LEN, MAX_METHOD_NAME_LEN, METACHARACTERS};
use crate::GateViolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    /// Binary class name: dot-separated segments (`com.example.Main`).
    Class,
    /// Single segment (`main`).
    Method,
}

impl IdentifierKind {
    fn what(self) -> &'static str {
        match self {
            IdentifierKind::Class => "class name",
            IdentifierKind::Method => "method name",
        }
    }

    /// Default bound, matching the payload buffers.
    pub fn max_len(self) -> usize {
        match self {
            IdentifierKind::Class => MAX_CLASS_NAME_LEN,
            IdentifierKind::Method => MAX_METHOD_NAME_LEN,
        }
    }
}

/// Validate a class or method name against the managed identifier grammar.
///
/// A segment starts with a letter, `_` or a currency symbol and continues
/// with letters, digits, `_` or currency symbols.
pub fn validate_identifier(
    name: &str,
    kind: IdentifierKind,
    max_len: usize,
) -> Result<(), GateViolation> {
    let what = kind.what();
    if name.is_empty() {
        return Err(GateViolation::Empty { what });
    }
    if name.encode_utf16().count() > max_len {
        return Err(GateViolation::TooLong { what, max: max_len });
    }
    if let Some(ch) = name
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || METACHARACTERS.contains(c))
    {
        return Err(GateViolation::ForbiddenChar { what, ch });
    }

    match kind {
        IdentifierKind::Method => check_segment(name, what),
        IdentifierKind::Class => name.split('.').try_for_each(|segment| check_segment(segment, what)),
    }
}

fn check_segment(segment: &str, what: &'static str) -> Result<(), GateViolation> {
    let mut chars = segment.chars();
    match chars.next() {
        None => Err(GateViolation::Malformed {
            what,
            reason: "empty segment",
        }),
        Some(first) if !is_identifier_start(first) => Err(GateViolation::Malformed {
            what,
            reason: "segment must start with a letter, '_' or a currency symbol",
        }),
        Some(_) => match chars.find(|c| !is_identifier_part(*c)) {
            Some('.') => Err(GateViolation::Malformed {
                what,
                reason: "method names are a single segment",
            }),
            Some(_) => Err(GateViolation::Malformed {
                what,
                reason: "segment contains a character outside the identifier grammar",
            }),
            None => Ok(()),
        },
    }
}

fn is_currency(c: char) -> bool {
    matches!(c, '$' | '\u{a2}' | '\u{a3}' | '\u{a4}' | '\u{a5}' | '\u{20ac}')
}

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || is_currency(c)
}

fn is_identifier_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || is_currency(c)
}
