use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use chrono::Local;

use crate::diag::{Event, SharedSink};
use crate::location::Location;
use crate::scan;
use crate::token::{Token, TokenId, TokenKind, TypeHint};

/// Macros whose replacement list depends on the point of use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    File,
    Line,
}

#[derive(Debug, Clone)]
pub enum MacroDef {
    Object {
        replacement: Vec<Token>,
    },
    Function {
        params: Vec<String>,
        variadic: bool,
        replacement: Vec<Token>,
    },
    Special(SpecialKind),
}

#[derive(Debug, Clone)]
pub struct Macro {
    pub name: Token,
    pub def: MacroDef,
}

impl Macro {
    pub fn object(name: Token, replacement: Vec<Token>) -> Self {
        Self {
            name,
            def: MacroDef::Object { replacement },
        }
    }

    pub fn function(name: Token, params: Vec<String>, variadic: bool, replacement: Vec<Token>) -> Self {
        Self {
            name,
            def: MacroDef::Function {
                params,
                variadic,
                replacement,
            },
        }
    }

    pub fn name_str(&self) -> &str {
        &self.name.value
    }

    pub fn location(&self) -> &Location {
        &self.name.location
    }

    pub fn is_function_like(&self) -> bool {
        matches!(self.def, MacroDef::Function { .. })
    }

    /// How many leading tokens of `toks` a replacement would consume, or 0
    /// when this macro is not invocable there.  `NULL` stays a null pointer
    /// constant even when an object-like macro of that name is defined.
    pub fn replaceable_size(&self, toks: &[Token]) -> usize {
        let Some(first) = toks.first() else { return 0 };
        if self.name.value != first.value {
            return 0;
        }
        match &self.def {
            MacroDef::Object { .. } | MacroDef::Special(_) => {
                if first.value == "NULL" {
                    0
                } else {
                    1
                }
            }
            MacroDef::Function { params, variadic, .. } => {
                let (args, idx) = parse_arguments(toks, 1);
                match args {
                    Some(args)
                        if params.is_empty() || *variadic || params.len() >= args.len() =>
                    {
                        idx + 1
                    }
                    _ => 0,
                }
            }
        }
    }

    fn expand(
        &self,
        toks: &[Token],
        table: &MacroTable,
        ctx: &mut ReplacementContext,
    ) -> Vec<Token> {
        let loc = toks[0].location.clone();
        match &self.def {
            MacroDef::Object { replacement } => {
                let res: Vec<Token> = replacement
                    .iter()
                    .map(|t| Token::replaced_from(t, loc.clone(), false))
                    .collect();
                table.notify(Event::ObjectMacroReplaced {
                    name: self.name.value.clone(),
                    loc,
                });
                res
            }
            MacroDef::Special(kind) => {
                let tok = match kind {
                    SpecialKind::File => Token::with_hint(
                        TokenKind::PpToken,
                        format!("\"{}\"", loc.fpath.display()),
                        loc.clone(),
                        TypeHint::StringLiteral,
                    ),
                    SpecialKind::Line => Token::with_hint(
                        TokenKind::PpToken,
                        loc.line_no.to_string(),
                        loc.clone(),
                        TypeHint::Constant,
                    ),
                };
                let mut tok = tok;
                tok.replaced = true;
                table.notify(Event::ObjectMacroReplaced {
                    name: self.name.value.clone(),
                    loc,
                });
                vec![tok]
            }
            MacroDef::Function {
                params,
                variadic,
                replacement,
            } => {
                let (parsed, _) = parse_arguments(toks, 1);
                let mut arg_list = parsed.unwrap_or_default();
                if params.is_empty() && !*variadic {
                    arg_list.clear();
                }
                let mut args: HashMap<String, Vec<Token>> = HashMap::new();
                for (i, param) in params.iter().enumerate() {
                    if let Some(arg) = arg_list.get(i) {
                        args.insert(param.clone(), arg.clone());
                    }
                }
                if *variadic {
                    let mut rest = Vec::new();
                    for (i, arg) in arg_list.iter().enumerate().skip(params.len()) {
                        if i > params.len() {
                            rest.push(Token::with_hint(
                                TokenKind::PpToken,
                                ",",
                                loc.clone(),
                                TypeHint::Punctuator,
                            ));
                        }
                        rest.extend(arg.iter().cloned());
                    }
                    args.insert("__VA_ARGS__".to_owned(), rest);
                }
                let res = self.expand_replacement_list(replacement, &mut args, &loc, table, ctx);
                table.notify(Event::FunctionMacroReplaced {
                    name: self.name.value.clone(),
                    loc,
                });
                res
            }
        }
    }

    fn expand_replacement_list(
        &self,
        replacement: &[Token],
        args: &mut HashMap<String, Vec<Token>>,
        loc: &Location,
        table: &MacroTable,
        ctx: &mut ReplacementContext,
    ) -> Vec<Token> {
        let mut res = Vec::new();
        let mut idx = 0usize;
        while let Some(cur) = replacement.get(idx) {
            let nxt = replacement.get(idx + 1);
            if let Some(arg) = args.get_mut(&cur.value) {
                let paste_follows = nxt.is_some_and(|t| t.value == "##");
                if paste_follows {
                    // Raw tokens: the operand of ## is not prescanned.
                    res.extend(arg.iter().map(|t| Token::replaced_from(t, loc.clone(), false)));
                } else {
                    table.replace_with(arg, ctx);
                    res.extend(arg.iter().map(|t| Token::replaced_from(t, loc.clone(), true)));
                }
            } else if cur.value == "#" {
                if let Some(nxt) = nxt {
                    let arg = args.get(&nxt.value).map(Vec::as_slice);
                    res.push(stringize_argument(arg, loc, table));
                    idx += 1;
                }
            } else if cur.value == "##" && nxt.is_some_and(|t| t.value == "#") {
                if let Some(nxt_nxt) = replacement.get(idx + 2) {
                    let arg = args.get(&nxt_nxt.value).map(Vec::as_slice);
                    let tok = stringize_argument(arg, loc, table);
                    concat_with_last(&[tok], loc, &mut res, table);
                    idx += 2;
                }
            } else if cur.value == "##" {
                match nxt {
                    Some(nxt_tok) => match args.get(&nxt_tok.value) {
                        Some(arg) => {
                            let arg = arg.clone();
                            concat_with_last(&arg, loc, &mut res, table);
                        }
                        None => {
                            concat_with_last(std::slice::from_ref(nxt_tok), loc, &mut res, table)
                        }
                    },
                    None => concat_with_last(&[], loc, &mut res, table),
                }
                idx += 1;
            } else {
                res.push(Token::replaced_from(cur, loc.clone(), false));
            }
            idx += 1;
        }
        res
    }
}

/// Scans a function-like invocation starting right after the macro name.
/// Returns the arguments and the index of the closing paren, or `None`
/// when no complete invocation is present.
fn parse_arguments(toks: &[Token], mut idx: usize) -> (Option<Vec<Vec<Token>>>, usize) {
    loop {
        match toks.get(idx) {
            Some(t) if t.kind == TokenKind::NewLine => idx += 1,
            Some(t) if t.value == "(" => {
                idx += 1;
                break;
            }
            _ => return (None, idx),
        }
    }
    let mut args = Vec::new();
    loop {
        let (arg, new_idx, last) = parse_one_argument(toks, idx);
        idx = new_idx;
        args.push(arg);
        if last {
            break;
        }
    }
    (Some(args), idx)
}

fn parse_one_argument(toks: &[Token], mut idx: usize) -> (Vec<Token>, usize, bool) {
    let mut arg = Vec::new();
    let mut paren_depth = 0i32;
    while let Some(tok) = toks.get(idx) {
        match tok.value.as_str() {
            "(" => {
                arg.push(tok.clone());
                paren_depth += 1;
            }
            ")" => {
                paren_depth -= 1;
                if paren_depth >= 0 {
                    arg.push(tok.clone());
                } else {
                    return (arg, idx, true);
                }
            }
            "," => {
                if paren_depth > 0 {
                    arg.push(tok.clone());
                } else {
                    return (arg, idx + 1, false);
                }
            }
            "\n" => {}
            _ => arg.push(tok.clone()),
        }
        idx += 1;
    }
    (arg, idx, true)
}

/// Spells an argument as a single string literal.  Whitespace between
/// argument tokens collapses to one space, and an unpaired trailing
/// backslash is dropped so the literal stays well formed.
fn stringize_argument(arg: Option<&[Token]>, loc: &Location, table: &MacroTable) -> Token {
    let arg = arg.unwrap_or(&[]);
    let mut spelled = arg
        .iter()
        .map(|t| t.value.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let trailing_backslashes = spelled.chars().rev().take_while(|c| *c == '\\').count();
    if trailing_backslashes % 2 == 1 {
        spelled.pop();
        if let Some(last) = arg.last() {
            table.notify(Event::LastBackslashIgnored {
                loc: last.location.clone(),
            });
        }
    }
    let mut quoted = String::with_capacity(spelled.len() + 2);
    quoted.push('"');
    for c in spelled.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    let mut tok = Token::with_hint(TokenKind::PpToken, quoted, loc.clone(), TypeHint::StringLiteral);
    tok.replaced = true;
    tok
}

/// Pastes the last result token with the head of `arg_toks`, re-lexing the
/// joined spelling in case it splits back into several tokens.
fn concat_with_last(arg_toks: &[Token], loc: &Location, res: &mut Vec<Token>, table: &MacroTable) {
    let Some(lhs) = res.pop() else { return };
    if let Some(rhs) = arg_toks.first() {
        let joined = format!("{}{}", lhs.value, rhs.value);
        let lexed = scan::relex(&joined, Rc::clone(&loc.fpath), loc.line_no, loc.col_no, 8);
        let new_toks: Vec<Token> = lexed
            .iter()
            .filter(|t| t.kind != TokenKind::NewLine)
            .map(|t| Token::replaced_from(t, loc.clone(), false))
            .collect();
        table.notify(Event::SharpSharpEvaled {
            lhs: lhs.value.clone(),
            rhs: Some(rhs.value.clone()),
            result: new_toks.iter().map(|t| t.value.clone()).collect(),
        });
        res.extend(new_toks);
        res.extend(
            arg_toks[1..]
                .iter()
                .map(|t| Token::replaced_from(t, loc.clone(), false)),
        );
    } else {
        let tok = Token::replaced_from(&lhs, loc.clone(), false);
        table.notify(Event::SharpSharpEvaled {
            lhs: lhs.value.clone(),
            rhs: None,
            result: vec![tok.value.clone()],
        });
        res.push(tok);
    }
}

/// Hide sets for one top-level replacement, keyed by token identity.
/// A token carrying its own macro's name in the hide set is never
/// replaced by that macro again.
#[derive(Default)]
pub struct ReplacementContext {
    hide_sets: HashMap<TokenId, HashSet<String>>,
}

impl ReplacementContext {
    pub fn add_to_hide_set(&mut self, org: TokenId, new_toks: &[Token], macro_name: &str) {
        let mut base = self.hide_sets.get(&org).cloned().unwrap_or_default();
        base.insert(macro_name.to_owned());
        for tok in new_toks {
            self.hide_sets
                .entry(tok.id)
                .or_default()
                .extend(base.iter().cloned());
        }
    }

    pub fn hidden(&self, tok: &Token, macro_name: &str) -> bool {
        self.hide_sets
            .get(&tok.id)
            .is_some_and(|set| set.contains(macro_name))
    }
}

pub struct MacroTable {
    macros: HashMap<String, Macro>,
    sink: SharedSink,
}

impl MacroTable {
    pub fn new(sink: SharedSink) -> Self {
        let mut table = Self {
            macros: HashMap::new(),
            sink,
        };
        table.predefine_special_macros();
        table
    }

    fn notify(&self, event: Event) {
        self.sink.notify(event);
    }

    pub fn define(&mut self, mac: Macro) -> Option<Macro> {
        self.macros.insert(mac.name.value.clone(), mac)
    }

    pub fn undef(&mut self, name: &str) -> Option<Macro> {
        self.macros.remove(name)
    }

    pub fn lookup(&self, name: &str) -> Option<&Macro> {
        self.macros.get(name)
    }

    pub fn replace(&self, toks: &mut Vec<Token>) -> bool {
        let mut ctx = ReplacementContext::default();
        self.replace_with(toks, &mut ctx)
    }

    /// One scan over `toks`, replacing every invocation found.  Operands
    /// of the `defined` operator are left alone so conditional expressions
    /// can still see them.
    pub fn replace_with(&self, toks: &mut Vec<Token>, ctx: &mut ReplacementContext) -> bool {
        let mut replaced = false;
        let mut in_defined = false;
        let mut idx = 0usize;
        while idx < toks.len() {
            match toks[idx].value.as_str() {
                "defined" => in_defined = true,
                "(" | ")" => {}
                _ => {
                    if in_defined {
                        in_defined = false;
                    } else if let Some(next) = self.do_replace(toks, idx, ctx) {
                        replaced = true;
                        idx = next;
                        continue;
                    }
                }
            }
            idx += 1;
        }
        replaced
    }

    fn do_replace(
        &self,
        toks: &mut Vec<Token>,
        idx: usize,
        ctx: &mut ReplacementContext,
    ) -> Option<usize> {
        let mac = self.lookup(&toks[idx].value)?;
        if ctx.hidden(&toks[idx], mac.name_str()) {
            return None;
        }
        let size = mac.replaceable_size(&toks[idx..]);
        if size == 0 || toks[idx..idx + size].iter().all(|t| t.no_more_replacement) {
            return None;
        }
        let mut expanded = mac.expand(&toks[idx..idx + size], self, ctx);
        ctx.add_to_hide_set(toks[idx].id, &expanded, mac.name_str());
        while self.replace_with(&mut expanded, ctx) {}
        let new_len = expanded.len();
        toks.splice(idx..idx + size, expanded);
        Some(idx + new_len)
    }

    fn predefine_special_macros(&mut self) {
        let now = Local::now();
        self.predefine_object(
            "__DATE__",
            &format!("\"{}\"", now.format("%h %d %Y")),
            TypeHint::StringLiteral,
        );
        self.predefine_object(
            "__TIME__",
            &format!("\"{}\"", now.format("%H:%M:%S")),
            TypeHint::StringLiteral,
        );
        self.define(Macro {
            name: builtin_name("__FILE__"),
            def: MacroDef::Special(SpecialKind::File),
        });
        self.define(Macro {
            name: builtin_name("__LINE__"),
            def: MacroDef::Special(SpecialKind::Line),
        });
        self.predefine_object("__STDC__", "1", TypeHint::Constant);
        self.predefine_object("__STDC_HOSTED__", "1", TypeHint::Constant);
        self.predefine_object("__STDC_MB_MIGHT_NEQ_WC__", "1", TypeHint::Constant);
        self.predefine_object("__STDC_VERSION__", "199901L", TypeHint::Constant);
        self.predefine_object("__STDC_IEC_559__", "0", TypeHint::Constant);
        self.predefine_object("__STDC_IEC_559_COMPLEX__", "0", TypeHint::Constant);
        self.predefine_object("__STDC_ISO_10646__", "199712L", TypeHint::Constant);
        // The operator form of #pragma: swallow the invocation entirely.
        self.define(Macro::function(
            builtin_name("_Pragma"),
            vec!["str".to_owned()],
            false,
            Vec::new(),
        ));
        for name in ["lint", "__lint", "__lint__", "__LINT__"] {
            self.predefine_object(name, "1", TypeHint::Constant);
        }
        for name in ["krill", "__krill", "__krill__", "__KRILL__"] {
            self.predefine_object(name, "1", TypeHint::Constant);
        }
    }

    fn predefine_object(&mut self, name: &str, value: &str, hint: TypeHint) {
        let loc = Location::builtin();
        self.define(Macro::object(
            builtin_name(name),
            vec![Token::with_hint(TokenKind::PpToken, value, loc, hint)],
        ));
    }
}

fn builtin_name(name: &str) -> Token {
    Token::new(TokenKind::Identifier, name, Location::builtin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::NullSink;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn table() -> MacroTable {
        MacroTable::new(Rc::new(NullSink))
    }

    fn toks(text: &str) -> Vec<Token> {
        scan::relex(text, Rc::new(PathBuf::from("t.c")), 1, 1, 8)
    }

    fn values(toks: &[Token]) -> Vec<&str> {
        toks.iter().map(|t| t.value.as_str()).collect()
    }

    fn define(table: &mut MacroTable, name: &str, replacement: &str) {
        let name_tok = toks(name).remove(0);
        table.define(Macro::object(name_tok, toks(replacement)));
    }

    fn define_fn(table: &mut MacroTable, name: &str, params: &[&str], replacement: &str) {
        let name_tok = toks(name).remove(0);
        table.define(Macro::function(
            name_tok,
            params.iter().map(|p| (*p).to_owned()).collect(),
            false,
            toks(replacement),
        ));
    }

    #[test]
    fn object_macro_is_replaced() {
        let mut tbl = table();
        define(&mut tbl, "ANSWER", "42");
        let mut t = toks("ANSWER ;");
        assert!(tbl.replace(&mut t));
        assert_eq!(values(&t), ["42", ";"]);
        assert!(t[0].replaced);
    }

    #[test]
    fn self_reference_terminates() {
        let mut tbl = table();
        define(&mut tbl, "FOO", "FOO");
        let mut t = toks("FOO");
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["FOO"]);
    }

    #[test]
    fn mutual_recursion_terminates() {
        let mut tbl = table();
        define(&mut tbl, "A", "B");
        define(&mut tbl, "B", "A");
        let mut t = toks("A");
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["A"]);
    }

    #[test]
    fn function_macro_without_parens_stays() {
        let mut tbl = table();
        define_fn(&mut tbl, "MAX", &["a", "b"], "((a) > (b) ? (a) : (b))");
        let mut t = toks("MAX + 1");
        assert!(!tbl.replace(&mut t));
        assert_eq!(values(&t), ["MAX", "+", "1"]);
    }

    #[test]
    fn function_macro_substitutes_arguments() {
        let mut tbl = table();
        define_fn(&mut tbl, "MAX", &["a", "b"], "((a) > (b) ? (a) : (b))");
        let mut t = toks("MAX(1, 2)");
        assert!(tbl.replace(&mut t));
        assert_eq!(
            values(&t).concat(),
            "((1)>(2)?(1):(2))"
        );
    }

    #[test]
    fn arguments_are_prescanned() {
        let mut tbl = table();
        define(&mut tbl, "FOO", "42");
        define_fn(&mut tbl, "ID", &["x"], "x");
        let mut t = toks("ID(FOO)");
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["42"]);
        assert!(t[0].no_more_replacement);
    }

    #[test]
    fn stringize_joins_with_single_spaces() {
        let mut tbl = table();
        define_fn(&mut tbl, "STR", &["x"], "# x");
        let mut t = toks("STR(a + b)");
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["\"a + b\""]);
        assert_eq!(t[0].type_hint, Some(TypeHint::StringLiteral));
    }

    #[test]
    fn stringize_escapes_quotes_and_backslashes() {
        let mut tbl = table();
        define_fn(&mut tbl, "STR", &["x"], "# x");
        let mut t = toks("STR(\"hi\")");
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["\"\\\"hi\\\"\""]);
    }

    #[test]
    fn paste_forms_a_single_identifier() {
        let mut tbl = table();
        define_fn(&mut tbl, "CAT", &["a", "b"], "a ## b");
        let mut t = toks("CAT(x, 1)");
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["x1"]);
        assert_eq!(t[0].type_hint, Some(TypeHint::Identifier));
    }

    #[test]
    fn paste_result_is_available_for_further_replacement() {
        let mut tbl = table();
        define(&mut tbl, "AB", "ok");
        define_fn(&mut tbl, "CAT", &["a", "b"], "a ## b");
        let mut t = toks("CAT(A, B)");
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["ok"]);
    }

    #[test]
    fn defined_operand_is_not_replaced() {
        let mut tbl = table();
        define(&mut tbl, "FOO", "1");
        let mut t = toks("defined FOO");
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["defined", "FOO"]);

        let mut t = toks("defined ( FOO )");
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["defined", "(", "FOO", ")"]);
    }

    #[test]
    fn null_is_never_replaced() {
        let mut tbl = table();
        define(&mut tbl, "NULL", "((void *)0)");
        let mut t = toks("NULL");
        assert!(!tbl.replace(&mut t));
        assert_eq!(values(&t), ["NULL"]);
    }

    #[test]
    fn function_like_null_macro_still_expands() {
        let mut tbl = table();
        define_fn(&mut tbl, "NULL", &["x"], "x");
        let mut t = toks("NULL(7)");
        assert!(tbl.replace(&mut t));
        assert_eq!(values(&t), ["7"]);
    }

    #[test]
    fn variadic_arguments_join_into_va_args() {
        let mut tbl = table();
        let name_tok = toks("EPRINTF").remove(0);
        tbl.define(Macro::function(
            name_tok,
            vec!["fmt".to_owned()],
            true,
            toks("fprintf(stderr, fmt, __VA_ARGS__)"),
        ));
        let mut t = toks("EPRINTF(\"%d:%d\", a, b)");
        tbl.replace(&mut t);
        assert_eq!(
            values(&t).concat(),
            "fprintf(stderr,\"%d:%d\",a,b)"
        );
    }

    #[test]
    fn line_macro_reports_point_of_use() {
        let tbl = table();
        let mut t = scan::relex("__LINE__", Rc::new(PathBuf::from("t.c")), 7, 1, 8);
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["7"]);
    }

    #[test]
    fn file_macro_quotes_the_path() {
        let tbl = table();
        let mut t = toks("__FILE__");
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["\"t.c\""]);
    }

    #[test]
    fn pragma_operator_vanishes() {
        let tbl = table();
        let mut t = toks("_Pragma(\"pack(1)\") int x;");
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["int", "x", ";"]);
    }

    #[test]
    fn stdc_version_is_c99() {
        let tbl = table();
        let mut t = toks("__STDC_VERSION__");
        tbl.replace(&mut t);
        assert_eq!(values(&t), ["199901L"]);
    }
}
