use std::path::PathBuf;
use std::rc::Rc;

use crate::diag::{Event, SharedSink};
use crate::scan;
use crate::token::{Token, TokenKind};
use crate::traits::CodeSubstitutionTraits;

/// Wildcard in a substitution pattern, standing for any balanced token
/// sequence.
pub const ANY_TOKENS: &str = "__krill__any";

/// Replaces every occurrence of a token pattern in the preprocessed token
/// stream.  Patterns match across line boundaries.
pub struct CodeSubstitution {
    name: String,
    pattern: Vec<Token>,
    replacement: Vec<Token>,
    sink: Option<SharedSink>,
}

impl CodeSubstitution {
    pub fn new(name: &str, pattern: &str, replacement: &str, sink: Option<SharedSink>) -> Self {
        Self {
            name: name.to_owned(),
            pattern: lex_fragment(pattern),
            replacement: lex_fragment(replacement),
            sink,
        }
    }

    pub fn from_traits(traits: &CodeSubstitutionTraits, sink: Option<SharedSink>) -> Self {
        Self::new(
            &traits.name,
            &traits.pattern.join(" "),
            &traits.replacement,
            sink,
        )
    }

    pub fn execute(&self, toks: Vec<Token>) -> Vec<Token> {
        if self.pattern.is_empty() {
            return toks;
        }
        let mut rslt = Vec::with_capacity(toks.len());
        let mut idx = 0;
        while idx < toks.len() {
            let mut matcher = Matcher::new(&self.pattern);
            let matched_len = matcher.match_at(&toks, idx);
            if matcher.accepted() || idx + matched_len == toks.len() {
                let first_loc = &toks[idx].location;
                if matched_len > 0 {
                    if let Some(sink) = &self.sink {
                        sink.notify(Event::CodeBlockSubstituted {
                            name: self.name.clone(),
                            loc: first_loc.clone(),
                        });
                    }
                }
                for repl in &self.replacement {
                    let mut tok = Token::new(repl.kind, repl.value.clone(), first_loc.clone());
                    tok.type_hint = repl.type_hint;
                    rslt.push(tok);
                }
                idx += matched_len;
            } else {
                rslt.push(toks[idx].clone());
                idx += 1;
            }
        }
        rslt
    }
}

/// Built-in patterns for inline assembly blocks left in the output.  They
/// are erased so later phases see plain C.
pub fn inline_assembly_substitutions(sink: &SharedSink) -> Vec<CodeSubstitution> {
    [
        "asm(__krill__any);",
        "__asm(__krill__any);",
        "asm { __krill__any }",
        "__asm { __krill__any }",
        "__asm__(__krill__any);",
        "__asm__ volatile (__krill__any);",
        "__asm__ __volatile__ (__krill__any);",
        "asm volatile (__krill__any);",
        "asm __volatile__ (__krill__any);",
    ]
    .iter()
    .map(|ptn| CodeSubstitution::new("inline assembly", ptn, "", Some(Rc::clone(sink))))
    .collect()
}

fn lex_fragment(text: &str) -> Vec<Token> {
    let fpath = Rc::new(PathBuf::from("<substitution>"));
    scan::relex(text, fpath, 1, 1, 8)
        .into_iter()
        .filter(|tok| tok.kind != TokenKind::NewLine)
        .collect()
}

struct PatternCursor<'a> {
    toks: &'a [Token],
    idx: usize,
}

impl<'a> PatternCursor<'a> {
    fn next(&mut self) -> Option<&'a Token> {
        let tok = self.toks.get(self.idx);
        if tok.is_some() {
            self.idx += 1;
        }
        tok
    }

    fn sentry(&self) -> Option<&'a Token> {
        self.toks.get(self.idx)
    }
}

fn is_open(value: &str) -> bool {
    matches!(value, "(" | "[" | "{")
}

fn is_close(value: &str) -> bool {
    matches!(value, ")" | "]" | "}")
}

enum State {
    OuterToken,
    OuterAny,
    InnerToken { prev: Box<State> },
    InnerAny { prev: Box<State>, depth: i32 },
    Accepted,
    Rejected,
}

impl State {
    fn matching(&self) -> bool {
        !matches!(self, State::Accepted | State::Rejected)
    }

    fn process(self, tok: &Token, cur: &mut PatternCursor<'_>) -> State {
        match self {
            State::OuterToken => {
                let Some(ptn) = cur.next() else {
                    return State::Accepted;
                };
                if tok.value == ptn.value {
                    if is_open(&tok.value) {
                        State::InnerToken {
                            prev: Box::new(State::OuterToken),
                        }
                    } else {
                        State::OuterToken
                    }
                } else if ptn.value == ANY_TOKENS {
                    if cur.sentry().is_some_and(|s| s.value == tok.value) {
                        if is_open(&tok.value) {
                            State::InnerToken {
                                prev: Box::new(State::OuterToken),
                            }
                            .process(tok, cur)
                        } else {
                            State::OuterToken
                        }
                    } else {
                        State::OuterAny
                    }
                } else {
                    State::Rejected
                }
            }
            State::OuterAny => {
                if cur.sentry().is_some_and(|s| s.value == tok.value) {
                    State::OuterToken.process(tok, cur)
                } else {
                    State::OuterAny
                }
            }
            State::InnerToken { prev } => {
                let Some(ptn) = cur.next() else {
                    return State::Accepted;
                };
                if tok.value == ptn.value {
                    if is_open(&tok.value) {
                        State::InnerToken {
                            prev: Box::new(State::InnerToken { prev }),
                        }
                    } else if is_close(&tok.value) {
                        *prev
                    } else {
                        State::InnerToken { prev }
                    }
                } else if ptn.value == ANY_TOKENS {
                    if is_open(&tok.value) {
                        State::InnerAny {
                            prev: Box::new(State::InnerToken { prev }),
                            depth: 1,
                        }
                    } else if is_close(&tok.value) {
                        // The closing token belongs to the enclosing level,
                        // hand it back instead of discarding it.
                        prev.process(tok, cur)
                    } else {
                        State::InnerAny {
                            prev: Box::new(State::InnerToken { prev }),
                            depth: 0,
                        }
                    }
                } else {
                    State::Rejected
                }
            }
            State::InnerAny { prev, mut depth } => {
                if is_open(&tok.value) {
                    depth += 1;
                } else if is_close(&tok.value) {
                    depth -= 1;
                }
                if depth < 0 && cur.sentry().is_some_and(|s| s.value == tok.value) {
                    prev.process(tok, cur)
                } else {
                    State::InnerAny { prev, depth }
                }
            }
            done => done,
        }
    }
}

struct Matcher<'a> {
    cur: PatternCursor<'a>,
    state: State,
}

impl<'a> Matcher<'a> {
    fn new(pattern: &'a [Token]) -> Self {
        Self {
            cur: PatternCursor { toks: pattern, idx: 0 },
            state: State::OuterToken,
        }
    }

    /// Tries the pattern against `toks` starting at `idx` and returns the
    /// number of tokens covered.  The token that drives the matcher past
    /// the end of the pattern is not part of the match.
    fn match_at(&mut self, toks: &[Token], mut idx: usize) -> usize {
        if toks.get(idx).is_some_and(|t| t.kind == TokenKind::NewLine) {
            return 0;
        }
        let mut match_len = 0;
        while let Some(tok) = toks.get(idx) {
            if tok.kind != TokenKind::NewLine {
                let state = std::mem::replace(&mut self.state, State::Rejected);
                self.state = state.process(tok, &mut self.cur);
                if !self.state.matching() {
                    break;
                }
            }
            match_len += 1;
            idx += 1;
        }
        match_len
    }

    fn accepted(&self) -> bool {
        matches!(self.state, State::Accepted)
    }
}
