use std::collections::VecDeque;
use std::rc::Rc;

use crate::diag::{Event, SharedSink};
use crate::error::{KrillError, Result};
use crate::scan::{self, Cursor};
use crate::source::Source;
use crate::token::{Token, TokenKind, TypeHint};

/// Lexer mode, switched by the directive that opened the current line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Between lines: directives and text lines.
    Initial,
    /// `#if`, `#elif`, `#line`, `#error`, `#pragma`: pp-tokens to newline.
    InIf,
    /// `#ifdef`, `#ifndef`: one identifier, then extras.
    InIfdef,
    /// `#else`, `#endif`, `#asm`, `#endasm`: only extras may follow.
    InNoArg,
    /// `#include`, `#include_next`: header name first, then pp-tokens.
    InInclude,
    /// `#define`, `#undef`: the whole line is pre-tokenized into a queue.
    InDefine,
}

const DIRECTIVES: [(&str, TokenKind); 15] = [
    ("if", TokenKind::If),
    ("ifdef", TokenKind::Ifdef),
    ("ifndef", TokenKind::Ifndef),
    ("elif", TokenKind::Elif),
    ("else", TokenKind::Else),
    ("endif", TokenKind::Endif),
    ("include", TokenKind::Include),
    ("include_next", TokenKind::IncludeNext),
    ("define", TokenKind::Define),
    ("undef", TokenKind::Undef),
    ("line", TokenKind::Line),
    ("error", TokenKind::Error),
    ("pragma", TokenKind::Pragma),
    ("asm", TokenKind::Asm),
    ("endasm", TokenKind::Endasm),
];

fn state_for(kind: TokenKind) -> State {
    match kind {
        TokenKind::If
        | TokenKind::Elif
        | TokenKind::Line
        | TokenKind::Error
        | TokenKind::Pragma => State::InIf,
        TokenKind::Ifdef | TokenKind::Ifndef => State::InIfdef,
        TokenKind::Else | TokenKind::Endif | TokenKind::Asm | TokenKind::Endasm => State::InNoArg,
        TokenKind::Include | TokenKind::IncludeNext => State::InInclude,
        TokenKind::Define | TokenKind::Undef => State::InDefine,
        _ => State::Initial,
    }
}

fn at_escaped_newline(rest: &str) -> bool {
    match rest.strip_prefix('\\') {
        Some(r) => r.trim_start_matches([' ', '\t']).starts_with('\n'),
        None => false,
    }
}

fn at_literal_start(rest: &str, quote: char) -> bool {
    if rest.starts_with(quote) {
        return true;
    }
    let mut chars = rest.chars();
    matches!(chars.next(), Some('L') | Some('l')) && chars.next() == Some(quote)
}

/// Directive-aware lexer for one source file.
pub struct Lexer {
    cur: Cursor,
    state: State,
    queue: VecDeque<Token>,
    top: Option<Token>,
    sink: SharedSink,
}

impl Lexer {
    pub fn new(src: Rc<Source>, tab_width: u32, sink: SharedSink) -> Self {
        let cur = Cursor::new(Rc::clone(&src.content), Rc::clone(&src.fpath), tab_width);
        Self {
            cur,
            state: State::Initial,
            queue: VecDeque::new(),
            top: None,
            sink,
        }
    }

    pub fn next_token(&mut self) -> Result<Option<Token>> {
        if let Some(tok) = self.top.take() {
            return Ok(Some(tok));
        }
        self.lex()
    }

    pub fn peek(&mut self) -> Result<Option<&Token>> {
        if self.top.is_none() {
            self.top = self.lex()?;
        }
        Ok(self.top.as_ref())
    }

    fn lex(&mut self) -> Result<Option<Token>> {
        match self.state {
            State::Initial => self.lex_initial(),
            State::InDefine => self.lex_define(),
            _ => self.lex_directive_tail(),
        }
    }

    /// Skips the controlled lines of a failed group.  Returns false when
    /// the end of the file was reached before a closing directive.
    pub fn skip_group(&mut self) -> Result<bool> {
        let mut depth = 1u32;
        while !self.cur.is_empty() {
            self.cur.scan_to_group_boundary();
            let rest = self.cur.rest();
            if rest.starts_with("/*") || rest.starts_with("//") {
                self.discard_heading_comments()?;
                continue;
            }
            match scan::group_directive_name(rest) {
                Some("if") | Some("ifdef") | Some("ifndef") | Some("asm") => {
                    depth += 1;
                    self.cur.scan_through_newline();
                }
                Some("else") | Some("elif") => {
                    if depth == 1 {
                        return Ok(true);
                    }
                    self.cur.scan_through_newline();
                }
                Some("endif") | Some("endasm") => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(true);
                    }
                    self.cur.scan_through_newline();
                }
                _ => {
                    // No further group boundary in this file.
                    self.cur.scan_through_newline();
                }
            }
        }
        Ok(false)
    }

    fn discard_heading_comments(&mut self) -> Result<bool> {
        let loc = self.cur.location();
        if let Some(res) = self.cur.scan_block_comment() {
            let (value, nested) = res.map_err(KrillError::UnterminatedBlockComment)?;
            for loc in nested {
                self.sink.notify(Event::NestedBlockComment { loc });
            }
            self.sink.notify(Event::CommentFound { value, loc });
            return Ok(true);
        }
        if let Some(value) = self.cur.scan_line_comment() {
            self.sink.notify(Event::CommentFound { value, loc });
            return Ok(true);
        }
        Ok(false)
    }

    fn discard_escaped_newline(&mut self) -> bool {
        let loc = self.cur.location();
        match self.cur.scan_escaped_newline() {
            Some((_, true)) => {
                self.sink.notify(Event::IllformedNewlineEscape { loc });
                true
            }
            Some((_, false)) => true,
            None => false,
        }
    }

    fn lex_initial(&mut self) -> Result<Option<Token>> {
        // An escaped newline or a comment may sit right above a directive.
        loop {
            if !self.discard_heading_comments()? && !self.discard_escaped_newline() {
                break;
            }
        }
        if self.cur.is_empty() {
            return Ok(None);
        }
        if self.cur.check_directive_start() {
            for (name, kind) in DIRECTIVES {
                let loc = self.cur.location();
                if let Some(val) = self.cur.scan_directive(name) {
                    self.state = state_for(kind);
                    return Ok(Some(Token::new(kind, val, loc)));
                }
            }
            let loc = self.cur.location();
            if let Some(val) = self.cur.scan_null_directive() {
                return Ok(Some(Token::new(TokenKind::NullDirective, val, loc)));
            }
            return Ok(Some(self.lex_unknown_directive()?));
        }
        self.lex_text_line()
    }

    fn lex_unknown_directive(&mut self) -> Result<Token> {
        let loc = self.cur.location();
        let mut val = self.cur.scan_hash().unwrap_or_default();
        while !self.cur.is_empty() {
            if self.discard_heading_comments()? || self.discard_escaped_newline() {
                continue;
            }
            match self.cur.eat_char() {
                Some('\n') => {
                    val.push('\n');
                    break;
                }
                Some(c) => val.push(c),
                None => break,
            }
        }
        Ok(Token::new(TokenKind::UnknownDirective, val, loc))
    }

    fn lex_text_line(&mut self) -> Result<Option<Token>> {
        let loc = self.cur.location();
        let mut val = String::new();
        while !self.cur.is_empty() {
            val.push_str(&self.scan_text_chunk());
            if let Some(nl) = self.cur.scan_newline() {
                val.push_str(&nl);
                break;
            }
            if self.discard_escaped_newline() {
                continue;
            }
            let rest = self.cur.rest();
            if rest.starts_with("/*") || rest.starts_with("//") {
                self.discard_heading_comments()?;
            } else if at_literal_start(rest, '"') {
                if let Some(lit) = scan::scan_string_literal(&mut self.cur) {
                    val.push_str(&lit);
                }
            } else if at_literal_start(rest, '\'') {
                if let Some(lit) = scan::scan_char_constant(&mut self.cur) {
                    val.push_str(&lit);
                }
            }
        }
        if val.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Token::new(TokenKind::TextLine, val, loc)))
        }
    }

    /// Raw text up to the next comment, escaped newline, literal, or
    /// line terminator.
    fn scan_text_chunk(&mut self) -> String {
        let mut len = 0usize;
        loop {
            let r = &self.cur.rest()[len..];
            if r.is_empty()
                || r.starts_with('\n')
                || r.starts_with("/*")
                || r.starts_with("//")
                || at_escaped_newline(r)
                || at_literal_start(r, '"')
                || at_literal_start(r, '\'')
            {
                break;
            }
            len += r.chars().next().map_or(1, char::len_utf8);
        }
        self.cur.eat_chars(self.cur.rest()[..len].chars().count())
    }

    fn lex_directive_tail(&mut self) -> Result<Option<Token>> {
        let mut tok = None;
        while !self.cur.is_empty() {
            if self.discard_heading_comments()? || self.discard_escaped_newline() {
                continue;
            }
            tok = match self.state {
                State::InIf => scan::scan_pp_token(&mut self.cur)
                    .or_else(|| self.scan_new_line())
                    .or_else(|| self.scan_extra_token()),
                State::InIfdef => self
                    .scan_identifier_token()
                    .or_else(|| self.scan_new_line())
                    .or_else(|| self.scan_extra_token()),
                State::InNoArg => self.scan_new_line().or_else(|| self.scan_extra_token()),
                State::InInclude => self
                    .scan_header_name()
                    .or_else(|| scan::scan_pp_token(&mut self.cur))
                    .or_else(|| self.scan_new_line())
                    .or_else(|| self.scan_extra_token()),
                State::Initial | State::InDefine => unreachable!(),
            };
            if tok.is_some() {
                break;
            }
            self.cur.eat_chars(1);
        }
        let tok = match tok {
            Some(tok) => tok,
            None => {
                let tok = Token::new(TokenKind::NewLine, "\n", self.cur.location());
                self.sink.notify(Event::EofNewlineNotFound {
                    loc: tok.location.clone(),
                });
                tok
            }
        };
        if tok.kind == TokenKind::NewLine {
            self.state = State::Initial;
        }
        Ok(Some(tok))
    }

    fn scan_new_line(&mut self) -> Option<Token> {
        let loc = self.cur.location();
        self.cur
            .scan_newline()
            .map(|val| Token::new(TokenKind::NewLine, val, loc))
    }

    fn scan_identifier_token(&mut self) -> Option<Token> {
        let loc = self.cur.location();
        scan::scan_identifier(&mut self.cur).map(|val| Token::new(TokenKind::Identifier, val, loc))
    }

    fn scan_header_name(&mut self) -> Option<Token> {
        let loc = self.cur.location();
        if let Some(val) = scan::scan_system_header_name(&mut self.cur) {
            return Some(Token::new(TokenKind::SysHeaderName, val, loc));
        }
        scan::scan_user_header_name(&mut self.cur)
            .map(|val| Token::new(TokenKind::UsrHeaderName, val, loc))
    }

    fn scan_extra_token(&mut self) -> Option<Token> {
        scan::scan_pp_token(&mut self.cur)
            .map(|tok| Token::new(TokenKind::Extra, tok.value, tok.location))
    }

    fn lex_define(&mut self) -> Result<Option<Token>> {
        if self.queue.is_empty() {
            self.queue_macro_name()?;
            self.queue_pp_tokens()?;
        }
        let tok = self.queue.pop_front();
        if self.queue.is_empty() {
            self.state = State::Initial;
        }
        Ok(tok)
    }

    fn queue_macro_name(&mut self) -> Result<()> {
        while !self.cur.is_empty() {
            if self.discard_heading_comments()? || self.discard_escaped_newline() {
                continue;
            }
            if let Some(tok) = self.scan_identifier_token() {
                self.queue.push_back(tok);
                break;
            }
            self.cur.eat_chars(1);
        }

        // A parameter list only exists when the paren hugs the name.
        if !self.cur.rest().starts_with('(') {
            return Ok(());
        }

        let mut paren_depth = 0i32;
        while !self.cur.is_empty() {
            if self.discard_heading_comments()? || self.discard_escaped_newline() {
                continue;
            }
            if let Some(tok) = self.scan_identifier_token() {
                self.queue.push_back(tok);
                continue;
            }
            let loc = self.cur.location();
            if let Some(val) = scan::scan_punctuator(&mut self.cur) {
                let closing = val == ")";
                let opening = val == "(";
                self.queue.push_back(Token::new(TokenKind::Punct, val, loc));
                if opening {
                    paren_depth += 1;
                } else if closing {
                    paren_depth -= 1;
                    if paren_depth == 0 {
                        break;
                    }
                }
                continue;
            }
            if let Some(tok) = self.scan_new_line() {
                self.queue.push_back(tok);
                break;
            }
            self.cur.eat_chars(1);
        }
        Ok(())
    }

    fn queue_pp_tokens(&mut self) -> Result<()> {
        while !self.cur.is_empty() {
            if self.discard_heading_comments()? || self.discard_escaped_newline() {
                continue;
            }
            if let Some(tok) = scan::scan_pp_token(&mut self.cur) {
                self.queue.push_back(tok);
                continue;
            }
            if let Some(tok) = self.scan_new_line() {
                self.queue.push_back(tok);
                break;
            }
            let loc = self.cur.location();
            if let Some(c) = self.cur.eat_char() {
                if !c.is_whitespace() {
                    self.sink.notify(Event::UnlexableCharFound {
                        ch: c.to_string(),
                        loc,
                    });
                }
            }
        }
        if !matches!(self.queue.back(), Some(t) if t.kind == TokenKind::NewLine) {
            let tok = Token::new(TokenKind::NewLine, "\n", self.cur.location());
            self.sink.notify(Event::EofNewlineNotFound {
                loc: tok.location.clone(),
            });
            self.queue.push_back(tok);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::NullSink;
    use pretty_assertions::assert_eq;

    fn lexer(text: &str) -> Lexer {
        let sink: SharedSink = Rc::new(NullSink);
        let src = Rc::new(Source::inline("t.c", text, &sink));
        Lexer::new(src, 8, sink)
    }

    fn drain(mut lx: Lexer) -> Vec<Token> {
        let mut toks = Vec::new();
        while let Some(tok) = lx.next_token().unwrap() {
            toks.push(tok);
        }
        toks
    }

    fn kinds(toks: &[Token]) -> Vec<TokenKind> {
        toks.iter().map(|t| t.kind).collect()
    }

    fn values(toks: &[Token]) -> Vec<&str> {
        toks.iter().map(|t| t.value.as_str()).collect()
    }

    #[test]
    fn text_lines_come_out_whole() {
        let toks = drain(lexer("int a;\nint b;\n"));
        assert_eq!(kinds(&toks), [TokenKind::TextLine, TokenKind::TextLine]);
        assert_eq!(values(&toks), ["int a;\n", "int b;\n"]);
    }

    #[test]
    fn comment_before_hash_still_makes_a_directive() {
        let toks = drain(lexer("/* c */ #if X\n#endif\n"));
        assert_eq!(toks[0].kind, TokenKind::If);
    }

    #[test]
    fn if_directive_lexes_condition_as_pp_tokens() {
        let toks = drain(lexer("#if defined(A) && 1\n"));
        assert_eq!(
            kinds(&toks),
            [
                TokenKind::If,
                TokenKind::PpToken,
                TokenKind::PpToken,
                TokenKind::PpToken,
                TokenKind::PpToken,
                TokenKind::PpToken,
                TokenKind::PpToken,
                TokenKind::NewLine,
            ]
        );
        assert_eq!(toks[1].value, "defined");
        assert_eq!(toks[1].type_hint, Some(TypeHint::Keyword));
    }

    #[test]
    fn ifdef_takes_one_identifier() {
        let toks = drain(lexer("#ifdef FOO\n#endif\n"));
        assert_eq!(toks[1].kind, TokenKind::Identifier);
        assert_eq!(toks[1].value, "FOO");
    }

    #[test]
    fn extra_tokens_after_endif_are_marked() {
        let toks = drain(lexer("#if 1\n#endif junk\n"));
        assert!(toks.iter().any(|t| t.kind == TokenKind::Extra && t.value == "junk"));
    }

    #[test]
    fn include_lexes_header_names() {
        let toks = drain(lexer("#include <stdio.h>\n#include \"mine.h\"\n"));
        assert_eq!(toks[1].kind, TokenKind::SysHeaderName);
        assert_eq!(toks[1].value, "<stdio.h>");
        assert_eq!(toks[4].kind, TokenKind::UsrHeaderName);
        assert_eq!(toks[4].value, "\"mine.h\"");
    }

    #[test]
    fn define_splits_params_only_when_paren_hugs_name() {
        let toks = drain(lexer("#define MAX(a, b) ((a) > (b) ? (a) : (b))\n"));
        assert_eq!(toks[1].kind, TokenKind::Identifier);
        assert_eq!(toks[2].kind, TokenKind::Punct);
        assert_eq!(toks[2].value, "(");

        let toks = drain(lexer("#define ANSWER (42)\n"));
        assert_eq!(toks[1].kind, TokenKind::Identifier);
        assert_eq!(toks[2].kind, TokenKind::PpToken);
    }

    #[test]
    fn null_directive_needs_exactly_one_blank() {
        let toks = drain(lexer("# \nint a;\n"));
        assert_eq!(toks[0].kind, TokenKind::NullDirective);

        let toks = drain(lexer("#\nint a;\n"));
        assert_eq!(toks[0].kind, TokenKind::UnknownDirective);
    }

    #[test]
    fn escaped_newline_splices_text_lines() {
        let toks = drain(lexer("int a\\\n = 1;\n"));
        assert_eq!(values(&toks), ["int a = 1;\n"]);
    }

    #[test]
    fn missing_newline_at_eof_is_synthesized_in_directives() {
        let sink: SharedSink = Rc::new(NullSink);
        let src = Rc::new(Source::inline("t.c", "#define X 1", &sink));
        let toks = drain(Lexer::new(src, 8, sink));
        assert_eq!(toks.last().unwrap().kind, TokenKind::NewLine);
    }

    #[test]
    fn skip_group_stops_at_matching_else() {
        let mut lx = lexer("#if 0\nskipped\n#else\nkept\n#endif\n");
        let tok = lx.next_token().unwrap().unwrap();
        assert_eq!(tok.kind, TokenKind::If);
        while lx.next_token().unwrap().unwrap().kind != TokenKind::NewLine {}
        assert!(lx.skip_group().unwrap());
        let tok = lx.next_token().unwrap().unwrap();
        assert_eq!(tok.kind, TokenKind::Else);
    }

    #[test]
    fn skip_group_tracks_nested_conditionals() {
        let mut lx = lexer("#if 0\n#if 1\n#endif\n#endif\nrest\n");
        lx.next_token().unwrap();
        while lx.next_token().unwrap().unwrap().kind != TokenKind::NewLine {}
        assert!(lx.skip_group().unwrap());
        let tok = lx.next_token().unwrap().unwrap();
        assert_eq!(tok.kind, TokenKind::Endif);
    }

    #[test]
    fn skip_group_at_eof_reports_false() {
        let mut lx = lexer("#if 0\nnever closed\n");
        lx.next_token().unwrap();
        while lx.next_token().unwrap().unwrap().kind != TokenKind::NewLine {}
        assert!(!lx.skip_group().unwrap());
    }
}
