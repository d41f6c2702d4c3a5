use std::path::PathBuf;
use std::rc::Rc;

use crate::diag::SharedSink;
use crate::preproc::subst::{inline_assembly_substitutions, CodeSubstitution};
use crate::token::{Token, TokenKind};
use crate::traits::Traits;

/// The token stream produced by preprocessing, re-emittable as text with
/// the layout of the original code preserved.
#[derive(Debug)]
pub struct PreprocessedSource {
    root_fpath: Rc<PathBuf>,
    tokens: Vec<Token>,
}

impl PreprocessedSource {
    pub fn new(root_fpath: Rc<PathBuf>) -> Self {
        Self {
            root_fpath,
            tokens: Vec::new(),
        }
    }

    pub fn root_fpath(&self) -> &Rc<PathBuf> {
        &self.root_fpath
    }

    pub fn add_token(&mut self, tok: Token) {
        self.tokens.push(tok);
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn pp_tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens
            .iter()
            .filter(|tok| tok.kind == TokenKind::PpToken)
    }

    /// Applies configured and built-in token substitutions to the stream.
    /// Extension substitutions run first so arbitrary ones see their
    /// output, and the inline assembly patterns run last.
    pub fn substitute_code_blocks(&mut self, traits: &Traits, sink: &SharedSink) {
        for sub_traits in &traits.compiler.extension_substitutions {
            let sub = CodeSubstitution::from_traits(sub_traits, Some(Rc::clone(sink)));
            self.tokens = sub.execute(std::mem::take(&mut self.tokens));
        }
        for sub_traits in &traits.compiler.arbitrary_substitutions {
            let sub = CodeSubstitution::from_traits(sub_traits, None);
            self.tokens = sub.execute(std::mem::take(&mut self.tokens));
        }
        for sub in inline_assembly_substitutions(sink) {
            self.tokens = sub.execute(std::mem::take(&mut self.tokens));
        }
    }

    pub fn to_text(&self) -> String {
        let mut emitter = Emitter::new();
        for tok in &self.tokens {
            emitter.print(tok);
        }
        emitter.out
    }
}

/// Re-emits tokens at their recorded appearance columns.  Lines removed by
/// the preprocessor leave blank lines behind, and jumps of more than three
/// lines or into another file produce a line marker.
struct Emitter<'a> {
    out: String,
    lst_fpath: Option<&'a Rc<PathBuf>>,
    lst_line_no: u32,
    lst_col_no: u32,
    lst_value: Option<&'a str>,
}

impl<'a> Emitter<'a> {
    fn new() -> Self {
        Self {
            out: String::new(),
            lst_fpath: None,
            lst_line_no: 0,
            lst_col_no: 1,
            lst_value: None,
        }
    }

    fn print(&mut self, tok: &'a Token) {
        if self.lst_col_no == 1 && tok.kind == TokenKind::NewLine {
            return;
        }

        if self.lst_fpath != Some(&tok.location.fpath) {
            self.insert_line_marker(tok);
        }
        if !(self.lst_col_no == 1 && tok.kind == TokenKind::NewLine) {
            if self.lst_line_no < tok.location.line_no {
                let vsp = tok.location.line_no - self.lst_line_no;
                if vsp > 3 {
                    self.insert_line_marker(tok);
                } else {
                    for _ in 0..vsp {
                        self.out.push('\n');
                    }
                }
            }
            let app_col = tok.location.appearance_col_no;
            if app_col > self.lst_col_no {
                for _ in 0..app_col - self.lst_col_no {
                    self.out.push(' ');
                }
            } else if self.need_hspace(tok) {
                self.out.push(' ');
            }
            if tok.kind == TokenKind::NewLine {
                self.out.push('\n');
                self.lst_line_no = tok.location.line_no + 1;
                self.lst_col_no = 1;
            } else {
                self.out.push_str(&tok.value);
                self.lst_line_no = tok.location.line_no;
                self.lst_col_no = app_col + tok.value.chars().count() as u32;
            }
        }

        self.lst_value = Some(&tok.value);
    }

    fn need_hspace(&self, tok: &Token) -> bool {
        let Some(lst) = self.lst_value else {
            return false;
        };
        ends_with_word_char(lst) && starts_with_word_char(&tok.value)
    }

    fn insert_line_marker(&mut self, tok: &'a Token) {
        if self.lst_col_no > 1 {
            self.out.push('\n');
        }
        self.out.push_str(&format!(
            "# {} \"{}\"\n",
            tok.location.line_no,
            tok.location.fpath.display()
        ));
        self.lst_fpath = Some(&tok.location.fpath);
        self.lst_line_no = tok.location.line_no;
        self.lst_col_no = 1;
    }
}

fn starts_with_word_char(value: &str) -> bool {
    value
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn ends_with_word_char(value: &str) -> bool {
    value
        .chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Location;
    use crate::token::TypeHint;
    use pretty_assertions::assert_eq;

    fn fpath(name: &str) -> Rc<PathBuf> {
        Rc::new(PathBuf::from(name))
    }

    fn pp(value: &str, fpath: &Rc<PathBuf>, line: u32, col: u32) -> Token {
        Token::with_hint(
            TokenKind::PpToken,
            value,
            Location::new(Rc::clone(fpath), line, col, col),
            TypeHint::Identifier,
        )
    }

    fn nl(fpath: &Rc<PathBuf>, line: u32, col: u32) -> Token {
        Token::new(
            TokenKind::NewLine,
            "\n",
            Location::new(Rc::clone(fpath), line, col, col),
        )
    }

    #[test]
    fn tokens_keep_their_columns() {
        let f = fpath("t.c");
        let mut src = PreprocessedSource::new(Rc::clone(&f));
        src.add_token(pp("int", &f, 1, 1));
        src.add_token(pp("a", &f, 1, 5));
        src.add_token(pp(";", &f, 1, 6));
        src.add_token(nl(&f, 1, 7));
        assert_eq!(src.to_text(), "# 1 \"t.c\"\nint a;\n");
    }

    #[test]
    fn small_line_gaps_become_blank_lines() {
        let f = fpath("t.c");
        let mut src = PreprocessedSource::new(Rc::clone(&f));
        src.add_token(pp("a", &f, 1, 1));
        src.add_token(nl(&f, 1, 2));
        src.add_token(pp("b", &f, 4, 1));
        src.add_token(nl(&f, 4, 2));
        assert_eq!(src.to_text(), "# 1 \"t.c\"\na\n\n\nb\n");
    }

    #[test]
    fn large_line_gaps_become_line_markers() {
        let f = fpath("t.c");
        let mut src = PreprocessedSource::new(Rc::clone(&f));
        src.add_token(pp("a", &f, 1, 1));
        src.add_token(nl(&f, 1, 2));
        src.add_token(pp("b", &f, 10, 1));
        src.add_token(nl(&f, 10, 2));
        assert_eq!(src.to_text(), "# 1 \"t.c\"\na\n# 10 \"t.c\"\nb\n");
    }

    #[test]
    fn file_change_emits_line_marker() {
        let f = fpath("t.c");
        let g = fpath("h.h");
        let mut src = PreprocessedSource::new(Rc::clone(&f));
        src.add_token(pp("a", &f, 1, 1));
        src.add_token(nl(&f, 1, 2));
        src.add_token(pp("x", &g, 1, 1));
        src.add_token(nl(&g, 1, 2));
        src.add_token(pp("b", &f, 2, 1));
        src.add_token(nl(&f, 2, 2));
        assert_eq!(
            src.to_text(),
            "# 1 \"t.c\"\na\n# 1 \"h.h\"\nx\n# 2 \"t.c\"\nb\n"
        );
    }

    #[test]
    fn adjacent_words_get_a_separating_space() {
        let f = fpath("t.c");
        let mut src = PreprocessedSource::new(Rc::clone(&f));
        // Expansion can leave several tokens at the same column.
        src.add_token(pp("unsigned", &f, 1, 1));
        src.add_token(pp("int", &f, 1, 1));
        src.add_token(pp("x", &f, 1, 1));
        src.add_token(nl(&f, 1, 2));
        assert_eq!(src.to_text(), "# 1 \"t.c\"\nunsigned int x\n");
    }
}
