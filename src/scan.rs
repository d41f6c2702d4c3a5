use std::path::PathBuf;
use std::rc::Rc;

use crate::location::Location;
use crate::token::{Token, TokenKind, TypeHint};

pub const KEYWORDS: [&str; 38] = [
    "sizeof",
    "typedef",
    "extern",
    "static",
    "auto",
    "register",
    "inline",
    "restrict",
    "char",
    "short",
    "int",
    "long",
    "signed",
    "unsigned",
    "float",
    "double",
    "const",
    "volatile",
    "void",
    "_Bool",
    "_Complex",
    "_Imaginary",
    "struct",
    "union",
    "enum",
    "case",
    "default",
    "if",
    "else",
    "switch",
    "while",
    "do",
    "for",
    "goto",
    "continue",
    "break",
    "return",
    "__typeof__",
];

// Longest match first.
const PUNCTUATORS: [&str; 49] = [
    "<<=", ">>=", "...", "->*", "::", "||", "|=", "&&", "&=", "^=", "==", "!=", "<=", "<<", ">=",
    ">>", "+=", "++", "->", "-=", "--", "*=", "/=", "%=", ".*", "{", "}", "(", ")", "[", "]", ";",
    ",", ":", "?", "|", "&", "^", "=", "!", "<", ">", "+", "-", "*", "/", "%", ".", "~",
];

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Character-level scanner over normalized source text.
///
/// Tracks both the raw column and the appearance column, with each tab
/// counted as `tab_width` appearance columns.
#[derive(Clone)]
pub struct Cursor {
    text: Rc<str>,
    pos: usize,
    fpath: Rc<PathBuf>,
    line_no: u32,
    col_no: u32,
    app_col_no: u32,
    tab_width: u32,
}

impl Cursor {
    pub fn new(text: Rc<str>, fpath: Rc<PathBuf>, tab_width: u32) -> Self {
        Self::at(text, fpath, 1, 1, tab_width)
    }

    pub fn at(text: Rc<str>, fpath: Rc<PathBuf>, line_no: u32, col_no: u32, tab_width: u32) -> Self {
        Self {
            text,
            pos: 0,
            fpath,
            line_no,
            col_no,
            app_col_no: col_no,
            tab_width,
        }
    }

    pub fn location(&self) -> Location {
        Location::new(
            Rc::clone(&self.fpath),
            self.line_no,
            self.col_no,
            self.app_col_no,
        )
    }

    pub fn fpath(&self) -> &Rc<PathBuf> {
        &self.fpath
    }

    pub fn tab_width(&self) -> u32 {
        self.tab_width
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.text.len()
    }

    pub fn rest(&self) -> &str {
        &self.text[self.pos..]
    }

    fn advance(&mut self, byte_len: usize) -> String {
        let consumed = self.text[self.pos..self.pos + byte_len].to_owned();
        for c in consumed.chars() {
            if c == '\n' {
                self.line_no += 1;
                self.col_no = 1;
                self.app_col_no = 1;
            } else if c == '\t' {
                self.col_no += 1;
                self.app_col_no += self.tab_width;
            } else {
                self.col_no += 1;
                self.app_col_no += 1;
            }
        }
        self.pos += byte_len;
        consumed
    }

    /// Consumes up to `n` characters.
    pub fn eat_chars(&mut self, n: usize) -> String {
        let byte_len = self
            .rest()
            .char_indices()
            .nth(n)
            .map_or(self.rest().len(), |(i, _)| i);
        self.advance(byte_len)
    }

    pub fn eat_char(&mut self) -> Option<char> {
        let c = self.rest().chars().next()?;
        self.advance(c.len_utf8());
        Some(c)
    }

    pub fn eat_str(&mut self, s: &str) -> Option<String> {
        if self.rest().starts_with(s) {
            Some(self.advance(s.len()))
        } else {
            None
        }
    }

    /// Consumes `[ \t]*` and returns how much was eaten.
    fn eat_blanks(&mut self) -> String {
        let len = self
            .rest()
            .bytes()
            .take_while(|b| *b == b' ' || *b == b'\t')
            .count();
        self.advance(len)
    }

    /// True when the rest matches `[ \t]*#`.
    pub fn check_directive_start(&self) -> bool {
        let trimmed = self.rest().trim_start_matches([' ', '\t']);
        trimmed.starts_with('#')
    }

    /// Scans `[ \t]*#[ \t]*<name>\b`, e.g. the opening of `#include`.
    pub fn scan_directive(&mut self, name: &str) -> Option<String> {
        let mut probe = self.clone();
        let mut val = probe.eat_blanks();
        val.push_str(&probe.eat_str("#")?);
        val.push_str(&probe.eat_blanks());
        val.push_str(&probe.eat_str(name)?);
        if probe.rest().chars().next().is_some_and(is_word_char) {
            return None;
        }
        *self = probe;
        Some(val)
    }

    /// Scans `[ \t]*#[ \t]\n`, the null directive.
    pub fn scan_null_directive(&mut self) -> Option<String> {
        let mut probe = self.clone();
        let mut val = probe.eat_blanks();
        val.push_str(&probe.eat_str("#")?);
        let ws = probe.eat_char().filter(|c| *c == ' ' || *c == '\t')?;
        val.push(ws);
        let nl = probe.eat_char().filter(|c| *c == '\n')?;
        val.push(nl);
        *self = probe;
        Some(val)
    }

    /// Scans `[ \t]*#`, the opening of an unknown directive.
    pub fn scan_hash(&mut self) -> Option<String> {
        let mut probe = self.clone();
        let mut val = probe.eat_blanks();
        val.push_str(&probe.eat_str("#")?);
        *self = probe;
        Some(val)
    }

    pub fn scan_newline(&mut self) -> Option<String> {
        self.eat_str("\n")
    }

    /// Scans `\\\n` or `\\[ \t]+\n`.  Returns the eaten text and whether
    /// blanks sat between the backslash and the newline.
    pub fn scan_escaped_newline(&mut self) -> Option<(String, bool)> {
        let mut probe = self.clone();
        let mut val = probe.eat_str("\\")?;
        let blanks = probe.eat_blanks();
        let illformed = !blanks.is_empty();
        val.push_str(&blanks);
        val.push_str(&probe.eat_str("\n")?);
        *self = probe;
        Some((val, illformed))
    }

    /// Scans a `//` comment up to (not including) the line terminator.
    pub fn scan_line_comment(&mut self) -> Option<String> {
        if !self.rest().starts_with("//") {
            return None;
        }
        let len = self.rest().find('\n').unwrap_or(self.rest().len());
        Some(self.advance(len))
    }

    /// Scans a `/* ... */` comment, honoring the nesting extension.  Returns
    /// `None` when not at a comment, `Err` with the comment's start location
    /// when the comment never terminates.
    pub fn scan_block_comment(&mut self) -> Option<Result<(String, Vec<Location>), Location>> {
        if !self.rest().starts_with("/*") {
            return None;
        }
        let start_loc = self.location();
        let mut comment = self.advance(2);
        let mut nested_at = Vec::new();
        while !self.is_empty() {
            let loc = self.location();
            if self.rest().starts_with("/*/") {
                comment.push_str(&self.advance(1));
            } else if self.rest().starts_with("/*") {
                comment.push_str(&self.advance(2));
                nested_at.push(loc);
            } else if self.rest().starts_with("*/") {
                comment.push_str(&self.advance(2));
                return Some(Ok((comment, nested_at)));
            } else {
                match self.rest().find(|c| c == '/' || c == '*') {
                    Some(0) => comment.push_str(&self.advance(1)),
                    Some(i) => comment.push_str(&self.advance(i)),
                    None => return Some(Err(start_loc)),
                }
            }
        }
        Some(Err(start_loc))
    }
}

/// Directives that open, split, or close a group, as spotted by `skip_group`.
pub fn group_directive_name(rest: &str) -> Option<&'static str> {
    let t = rest.trim_start_matches([' ', '\t']);
    let t = t.strip_prefix('#')?;
    let t = t.trim_start_matches([' ', '\t']);
    for name in ["ifdef", "ifndef", "if", "asm", "else", "elif", "endif", "endasm"] {
        if let Some(after) = t.strip_prefix(name) {
            if !after.chars().next().is_some_and(is_word_char) {
                return Some(name);
            }
        }
    }
    None
}

impl Cursor {
    /// Consumes text up to the next line-anchored group directive, `/*`,
    /// or `//`.  Everything else in the skipped group is discarded.
    pub fn scan_to_group_boundary(&mut self) {
        let rest = self.rest();
        let bytes = rest.as_bytes();
        let mut at_line_start = self.col_no == 1;
        let mut i = 0;
        while i < bytes.len() {
            let r = &rest[i..];
            if r.starts_with("/*") || r.starts_with("//") {
                break;
            }
            if at_line_start && group_directive_name(r).is_some() {
                break;
            }
            at_line_start = bytes[i] == b'\n';
            i += 1;
            while i < bytes.len() && (bytes[i] & 0xc0) == 0x80 {
                i += 1;
            }
        }
        self.advance(i);
    }

    /// Consumes through the next newline, or to the end of the content.
    pub fn scan_through_newline(&mut self) {
        let len = self
            .rest()
            .find('\n')
            .map_or(self.rest().len(), |i| i + 1);
        self.advance(len);
    }
}

fn peek_word(rest: &str) -> Option<&str> {
    let first = rest.chars().next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let len = rest.bytes().take_while(|b| is_word_char(*b as char)).count();
    Some(&rest[..len])
}

pub fn scan_keyword(cur: &mut Cursor) -> Option<String> {
    let word = peek_word(cur.rest())?;
    if KEYWORDS.contains(&word) || word == "__alignof__" {
        let len = word.len();
        Some(cur.eat_chars(len))
    } else {
        None
    }
}

/// The only preprocessing keyword is the `defined` operator.
pub fn scan_pp_keyword(cur: &mut Cursor) -> Option<String> {
    let word = peek_word(cur.rest())?;
    if word == "defined" {
        Some(cur.eat_chars(7))
    } else {
        None
    }
}

pub fn scan_null_constant(cur: &mut Cursor) -> Option<String> {
    let word = peek_word(cur.rest())?;
    if word == "NULL" {
        Some(cur.eat_chars(4))
    } else {
        None
    }
}

pub fn scan_identifier(cur: &mut Cursor) -> Option<String> {
    let word = peek_word(cur.rest())?;
    let len = word.chars().count();
    Some(cur.eat_chars(len))
}

pub fn scan_integer_constant(cur: &mut Cursor) -> Option<String> {
    let bytes = cur.rest().as_bytes();
    let radix_prefix = if bytes.len() > 2 && bytes[0] == b'0' {
        match bytes[1] {
            b'x' | b'X' if bytes[2].is_ascii_hexdigit() => Some(16),
            b'b' | b'B' if bytes[2] == b'0' || bytes[2] == b'1' => Some(2),
            _ => None,
        }
    } else {
        None
    };
    let mut len = match radix_prefix {
        Some(16) => 2 + bytes[2..].iter().take_while(|b| b.is_ascii_hexdigit()).count(),
        Some(_) => 2 + bytes[2..].iter().take_while(|b| **b == b'0' || **b == b'1').count(),
        None => bytes.iter().take_while(|b| b.is_ascii_digit()).count(),
    };
    if len == 0 {
        return None;
    }
    len += bytes[len..]
        .iter()
        .take_while(|b| matches!(**b, b'u' | b'U' | b'l' | b'L'))
        .count();
    Some(cur.eat_chars(len))
}

fn match_exponent(bytes: &[u8], mut i: usize) -> Option<usize> {
    match bytes.get(i) {
        Some(b'e') | Some(b'E') => i += 1,
        _ => return None,
    }
    if let Some(b'+') | Some(b'-') = bytes.get(i) {
        i += 1;
    }
    let digits = bytes[i..].iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        None
    } else {
        Some(i + digits)
    }
}

fn match_float(bytes: &[u8]) -> Option<usize> {
    let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    // [0-9]*\.[0-9]*E[+-]?[0-9]+
    let with_dot_exp = if bytes.get(digits) == Some(&b'.') {
        let frac = bytes[digits + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        match_exponent(bytes, digits + 1 + frac)
    } else {
        None
    };
    // [0-9]+\.?E[+-]?[0-9]+
    let no_dot_exp = if digits > 0 {
        let mut i = digits;
        if bytes.get(i) == Some(&b'.') {
            i += 1;
        }
        match_exponent(bytes, i)
    } else {
        None
    };
    // [0-9]*\.[0-9]+ | [0-9]+\.
    let plain = if bytes.get(digits) == Some(&b'.') {
        let frac = bytes[digits + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if frac > 0 {
            Some(digits + 1 + frac)
        } else if digits > 0 {
            Some(digits + 1)
        } else {
            None
        }
    } else {
        None
    };
    with_dot_exp.or(no_dot_exp).or(plain)
}

pub fn scan_floating_constant(cur: &mut Cursor) -> Option<String> {
    let bytes = cur.rest().as_bytes();
    let mut len = match_float(bytes)?;
    len += bytes[len..]
        .iter()
        .take_while(|b| matches!(**b, b'f' | b'F' | b'l' | b'L'))
        .count();
    Some(cur.eat_chars(len))
}

fn scan_quoted(cur: &mut Cursor, quote: char) -> Option<String> {
    let rest = cur.rest();
    let mut scanned = if rest.starts_with(quote) {
        cur.eat_chars(1)
    } else if (rest.starts_with('L') || rest.starts_with('l'))
        && rest[1..].starts_with(quote)
    {
        cur.eat_chars(2)
    } else {
        return None;
    };
    while !cur.is_empty() {
        match cur.rest().find(|c| c == '\\' || c == quote) {
            Some(i) => scanned.push_str(&cur.advance(i)),
            None => {
                // Unterminated literal runs to the end of the content.
                let len = cur.rest().len();
                scanned.push_str(&cur.advance(len));
                break;
            }
        }
        if cur.scan_escaped_newline().is_some() {
            continue;
        }
        if cur.rest().starts_with('\\') {
            scanned.push_str(&cur.eat_chars(2));
        } else if cur.rest().starts_with(quote) {
            scanned.push_str(&cur.eat_chars(1));
            break;
        }
    }
    Some(scanned)
}

pub fn scan_char_constant(cur: &mut Cursor) -> Option<String> {
    scan_quoted(cur, '\'')
}

pub fn scan_string_literal(cur: &mut Cursor) -> Option<String> {
    scan_quoted(cur, '"')
}

pub fn scan_punctuator(cur: &mut Cursor) -> Option<String> {
    for punct in PUNCTUATORS {
        if cur.rest().starts_with(punct) {
            return Some(cur.eat_chars(punct.chars().count()));
        }
    }
    if cur.rest().starts_with("##") {
        Some(cur.eat_chars(2))
    } else if cur.rest().starts_with('#') {
        Some(cur.eat_chars(1))
    } else {
        None
    }
}

pub fn scan_system_header_name(cur: &mut Cursor) -> Option<String> {
    let rest = cur.rest();
    if !rest.starts_with('<') {
        return None;
    }
    let end = rest.find(|c| c == '>' || c == '\n')?;
    if rest.as_bytes()[end] != b'>' {
        return None;
    }
    Some(cur.advance(end + 1))
}

pub fn scan_user_header_name(cur: &mut Cursor) -> Option<String> {
    let rest = cur.rest();
    if !rest.starts_with('"') {
        return None;
    }
    let end = rest[1..].find(|c| c == '"' || c == '\n').map(|i| i + 1)?;
    if rest.as_bytes()[end] != b'"' {
        return None;
    }
    Some(cur.advance(end + 1))
}

/// Scans one pp-token in a directive line.
pub fn scan_pp_token(cur: &mut Cursor) -> Option<Token> {
    let loc = cur.location();
    if let Some(val) = scan_keyword(cur).or_else(|| scan_pp_keyword(cur)) {
        return Some(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::Keyword));
    }
    if let Some(val) = scan_char_constant(cur)
        .or_else(|| scan_floating_constant(cur))
        .or_else(|| scan_integer_constant(cur))
    {
        return Some(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::Constant));
    }
    if let Some(val) = scan_string_literal(cur) {
        return Some(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::StringLiteral));
    }
    if let Some(val) = scan_null_constant(cur) {
        return Some(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::NullConstant));
    }
    if let Some(val) = scan_identifier(cur) {
        return Some(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::Identifier));
    }
    if let Some(val) = scan_punctuator(cur) {
        return Some(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::Punctuator));
    }
    None
}

/// Re-lexes a string into pp-tokens, used for text lines and for the
/// products of the `##` operator.  Constants are not recognized right
/// after an identifier so that pasted names like `x1` stay identifiers.
pub fn relex(
    text: &str,
    fpath: Rc<PathBuf>,
    line_no: u32,
    col_no: u32,
    tab_width: u32,
) -> Vec<Token> {
    let mut cur = Cursor::at(Rc::from(text), fpath, line_no, col_no, tab_width);
    let mut toks = Vec::new();
    let mut last_was_identifier = false;
    while !cur.is_empty() {
        let loc = cur.location();
        if let Some(val) = scan_keyword(&mut cur).or_else(|| scan_pp_keyword(&mut cur)) {
            toks.push(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::Keyword));
            last_was_identifier = false;
            continue;
        }
        if !last_was_identifier {
            if let Some(val) = scan_char_constant(&mut cur)
                .or_else(|| scan_floating_constant(&mut cur))
                .or_else(|| scan_integer_constant(&mut cur))
            {
                toks.push(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::Constant));
                continue;
            }
        }
        if let Some(val) = scan_string_literal(&mut cur) {
            toks.push(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::StringLiteral));
            continue;
        }
        if let Some(val) = scan_null_constant(&mut cur) {
            toks.push(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::NullConstant));
            last_was_identifier = false;
            continue;
        }
        if let Some(val) = scan_identifier(&mut cur) {
            toks.push(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::Identifier));
            last_was_identifier = true;
            continue;
        }
        if let Some(val) = scan_punctuator(&mut cur) {
            toks.push(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::Punctuator));
            last_was_identifier = false;
            continue;
        }
        if cur.rest().starts_with('\\') {
            let val = cur.eat_chars(1);
            toks.push(Token::with_hint(TokenKind::PpToken, val, loc, TypeHint::Punctuator));
            last_was_identifier = false;
            continue;
        }
        if let Some(val) = cur.scan_newline() {
            toks.push(Token::new(TokenKind::NewLine, val, loc));
            break;
        }
        cur.eat_chars(1);
        last_was_identifier = false;
    }
    toks
}
