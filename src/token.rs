use std::sync::atomic::{AtomicU32, Ordering};

use crate::location::Location;

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

/// Identity of a single token object.
///
/// Cloning a token keeps its id, so an argument token spliced into several
/// places still names the same hide-set entry.  Freshly built tokens, such
/// as the products of a macro expansion, get a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(u32);

impl TokenId {
    fn fresh() -> Self {
        TokenId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    If,
    Ifdef,
    Ifndef,
    Elif,
    Else,
    Endif,
    Include,
    IncludeNext,
    Define,
    Undef,
    Line,
    Error,
    Pragma,
    Asm,
    Endasm,
    NullDirective,
    UnknownDirective,
    TextLine,
    PpToken,
    Identifier,
    Punct,
    SysHeaderName,
    UsrHeaderName,
    NewLine,
    Extra,
}

/// Coarse classification attached to pp-tokens for later phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeHint {
    Keyword,
    Identifier,
    Constant,
    StringLiteral,
    NullConstant,
    Punctuator,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub id: TokenId,
    pub kind: TokenKind,
    pub value: String,
    pub location: Location,
    pub type_hint: Option<TypeHint>,
    pub replaced: bool,
    pub no_more_replacement: bool,
}

impl Token {
    pub fn new(kind: TokenKind, value: impl Into<String>, location: Location) -> Self {
        Self {
            id: TokenId::fresh(),
            kind,
            value: value.into(),
            location,
            type_hint: None,
            replaced: false,
            no_more_replacement: false,
        }
    }

    pub fn with_hint(
        kind: TokenKind,
        value: impl Into<String>,
        location: Location,
        hint: TypeHint,
    ) -> Self {
        let mut tok = Self::new(kind, value, location);
        tok.type_hint = Some(hint);
        tok
    }

    /// Builds a product of macro replacement from an existing token.
    pub fn replaced_from(tok: &Token, location: Location, no_more_replacement: bool) -> Self {
        Self {
            id: TokenId::fresh(),
            kind: tok.kind,
            value: tok.value.clone(),
            location,
            type_hint: tok.type_hint,
            replaced: true,
            no_more_replacement,
        }
    }
}
