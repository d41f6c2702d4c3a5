use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::info;

use crate::diag::{Event, SharedSink};
use crate::error::{KrillError, Result};
use crate::preproc::ast::{ControlLine, Group, GroupPart, IfSection, PreprocessingFile};
use crate::preproc::constexpr;
use crate::preproc::lexer::Lexer;
use crate::preproc::macros::{Macro, MacroDef, MacroTable};
use crate::preproc::output::PreprocessedSource;
use crate::scan;
use crate::source::{Source, SourceKind};
use crate::token::{Token, TokenKind};
use crate::traits::Traits;

/// Mutable state of one preprocessing run: the stack of lexers opened by
/// `#include`, the conditional branch stack, the macro table and the
/// output token stream.
pub struct PreprocessContext {
    lexers: Vec<Lexer>,
    branches: Vec<bool>,
    pub once_set: HashSet<PathBuf>,
    deferred_text_lines: Vec<Token>,
    pub macro_table: MacroTable,
    pub output: PreprocessedSource,
    tab_width: u32,
}

impl PreprocessContext {
    pub fn new(root_fpath: Rc<PathBuf>, tab_width: u32, sink: SharedSink) -> Self {
        Self {
            lexers: Vec::new(),
            branches: Vec::new(),
            once_set: HashSet::new(),
            deferred_text_lines: Vec::new(),
            macro_table: MacroTable::new(sink),
            output: PreprocessedSource::new(root_fpath),
            tab_width,
        }
    }

    pub fn tab_width(&self) -> u32 {
        self.tab_width
    }

    pub fn include_depth(&self) -> usize {
        self.lexers.len()
    }

    fn push_lexer(&mut self, lexer: Lexer) {
        self.lexers.push(lexer);
    }

    /// The next unconsumed token, popping lexers that ran dry.
    fn top_token(&mut self) -> Result<Option<Token>> {
        loop {
            let peeked = match self.lexers.last_mut() {
                None => return Ok(None),
                Some(lexer) => lexer.peek()?.cloned(),
            };
            match peeked {
                Some(tok) => return Ok(Some(tok)),
                None => {
                    self.lexers.pop();
                }
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        if self.top_token()?.is_none() {
            return Ok(None);
        }
        match self.lexers.last_mut() {
            Some(lexer) => lexer.next_token(),
            None => Ok(None),
        }
    }

    /// Skips to the next conditional boundary, crossing the ends of
    /// included files when a group is left open there.
    fn skip_group(&mut self) -> Result<()> {
        loop {
            let Some(lexer) = self.lexers.last_mut() else {
                return Ok(());
            };
            if lexer.skip_group()? {
                return Ok(());
            }
            self.lexers.pop();
        }
    }

    fn push_branch(&mut self) {
        self.branches.push(false);
    }

    fn pop_branch(&mut self) {
        self.branches.pop();
    }

    fn set_branch_evaluated(&mut self) {
        if let Some(evaluated) = self.branches.last_mut() {
            *evaluated = true;
        }
    }

    fn branch_evaluated(&self) -> bool {
        self.branches.last().copied().unwrap_or(false)
    }
}

/// Recursive descent evaluator of the preprocessing language.  Parsing
/// and evaluation happen in one pass over the directive tokens.
pub struct Preprocessor {
    traits: Rc<Traits>,
    sink: SharedSink,
}

impl Preprocessor {
    pub fn new(traits: Rc<Traits>, sink: SharedSink) -> Self {
        Self { traits, sink }
    }

    pub fn preprocess(
        &self,
        ctx: &mut PreprocessContext,
        src: Rc<Source>,
    ) -> Result<PreprocessingFile> {
        let fpath = Rc::clone(&src.fpath);
        let lexer = Lexer::new(src, ctx.tab_width, Rc::clone(&self.sink));
        ctx.push_lexer(lexer);
        let group = self.group(ctx)?;
        self.flush_deferred_text_lines(ctx)?;
        Ok(PreprocessingFile::new(fpath, group))
    }

    fn group(&self, ctx: &mut PreprocessContext) -> Result<Group> {
        let mut group = Group::default();
        while let Some(part) = self.group_part(ctx)? {
            group.push(part);
        }
        Ok(group)
    }

    /// Parses one group part and returns its node.  A consumed but
    /// ill-formed directive line yields no node; parsing goes on with
    /// the next line.
    fn group_part(&self, ctx: &mut PreprocessContext) -> Result<Option<GroupPart>> {
        loop {
            let Some(top) = ctx.top_token()? else {
                return Ok(None);
            };
            let part = match top.kind {
                TokenKind::If | TokenKind::Ifdef | TokenKind::Ifndef => {
                    self.if_section(ctx)?.map(GroupPart::IfSection)
                }
                TokenKind::Include => self.include_line(ctx, false)?.map(GroupPart::ControlLine),
                TokenKind::IncludeNext => {
                    self.include_line(ctx, true)?.map(GroupPart::ControlLine)
                }
                TokenKind::Define => self.define_line(ctx)?.map(GroupPart::ControlLine),
                TokenKind::Undef => self.undef_line(ctx)?.map(GroupPart::ControlLine),
                TokenKind::Line => self.line_line(ctx)?.map(GroupPart::ControlLine),
                TokenKind::Error => self.error_line(ctx)?.map(GroupPart::ControlLine),
                TokenKind::Pragma => self.pragma_line(ctx)?.map(GroupPart::ControlLine),
                TokenKind::Asm => self.asm_section(ctx)?.map(GroupPart::AsmSection),
                TokenKind::NullDirective => ctx.next_token()?.map(|tok| {
                    self.sink.notify(Event::NullDirective {
                        loc: tok.location.clone(),
                    });
                    GroupPart::NullDirective(tok)
                }),
                TokenKind::UnknownDirective => ctx.next_token()?.map(|tok| {
                    self.sink.notify(Event::UnknownDirective {
                        value: tok.value.clone(),
                        loc: tok.location.clone(),
                    });
                    GroupPart::UnknownDirective(tok)
                }),
                TokenKind::TextLine => {
                    let Some(text_line) = ctx.next_token()? else {
                        return Ok(None);
                    };
                    let node = GroupPart::TextLine(text_line.clone());
                    match self.normalize_text_line(ctx, &text_line) {
                        Some(toks) => {
                            ctx.deferred_text_lines.clear();
                            for tok in toks {
                                ctx.output.add_token(tok);
                            }
                        }
                        None => ctx.deferred_text_lines.push(text_line),
                    }
                    Some(node)
                }
                _ => return Ok(None),
            };
            if let Some(part) = part {
                return Ok(Some(part));
            }
        }
    }

    fn if_section(&self, ctx: &mut PreprocessContext) -> Result<Option<IfSection>> {
        let Some(opening) = ctx.top_token()? else {
            return Ok(None);
        };
        ctx.push_branch();
        let result = self.if_section_body(ctx);
        ctx.pop_branch();
        match result {
            Ok((true, taken)) => Ok(Some(IfSection {
                keyword: opening,
                taken,
            })),
            Ok((false, _)) => Err(KrillError::UnterminatedIfSection(opening.location)),
            Err(e) => Err(e),
        }
    }

    /// Returns whether the matching `#endif` was seen, together with the
    /// group of the branch that was entered.
    fn if_section_body(&self, ctx: &mut PreprocessContext) -> Result<(bool, Option<Group>)> {
        let mut taken = self.if_group(ctx)?;
        while let Some(top) = ctx.top_token()? {
            match top.kind {
                TokenKind::Elif => taken = self.elif_groups(ctx)?.or(taken),
                TokenKind::Else => taken = self.else_group(ctx)?.or(taken),
                TokenKind::Endif => {
                    self.endif_line(ctx)?;
                    return Ok((true, taken));
                }
                _ => break,
            }
        }
        Ok((false, taken))
    }

    fn if_group(&self, ctx: &mut PreprocessContext) -> Result<Option<Group>> {
        let Some(keyword) = ctx.top_token()? else {
            return Ok(None);
        };
        match keyword.kind {
            TokenKind::If => self.if_statement(ctx),
            TokenKind::Ifdef => self.ifdef_statement(ctx, true),
            TokenKind::Ifndef => self.ifdef_statement(ctx, false),
            _ => Ok(None),
        }
    }

    fn if_statement(&self, ctx: &mut PreprocessContext) -> Result<Option<Group>> {
        ctx.next_token()?;
        let pp_toks = self.pp_tokens(ctx)?;
        self.discard_extra_tokens(ctx)?;
        let value = match pp_toks {
            Some(mut toks) => {
                ctx.macro_table.replace(&mut toks);
                constexpr::evaluate(&toks, &ctx.macro_table, &self.sink)
            }
            None => 0,
        };
        if value == 0 {
            ctx.skip_group()?;
            Ok(None)
        } else {
            let group = self.group(ctx)?;
            ctx.set_branch_evaluated();
            Ok(Some(group))
        }
    }

    fn ifdef_statement(
        &self,
        ctx: &mut PreprocessContext,
        want_defined: bool,
    ) -> Result<Option<Group>> {
        ctx.next_token()?;
        let defined = match ctx.next_token()? {
            Some(id) if id.kind == TokenKind::Identifier => {
                self.discard_extra_tokens(ctx)?;
                ctx.macro_table.lookup(&id.value).is_some()
            }
            Some(tok) if tok.kind == TokenKind::NewLine => false,
            Some(_) => {
                self.discard_extra_tokens(ctx)?;
                false
            }
            None => false,
        };
        if defined == want_defined {
            let group = self.group(ctx)?;
            ctx.set_branch_evaluated();
            Ok(Some(group))
        } else {
            ctx.skip_group()?;
            Ok(None)
        }
    }

    fn elif_groups(&self, ctx: &mut PreprocessContext) -> Result<Option<Group>> {
        let mut taken = None;
        while ctx
            .top_token()?
            .is_some_and(|t| t.kind == TokenKind::Elif)
        {
            taken = self.elif_group(ctx)?.or(taken);
        }
        Ok(taken)
    }

    fn elif_group(&self, ctx: &mut PreprocessContext) -> Result<Option<Group>> {
        ctx.next_token()?;
        let pp_toks = self.pp_tokens(ctx)?;
        self.discard_extra_tokens(ctx)?;
        let value = match pp_toks {
            Some(mut toks) => {
                ctx.macro_table.replace(&mut toks);
                constexpr::evaluate(&toks, &ctx.macro_table, &self.sink)
            }
            None => 0,
        };
        if ctx.branch_evaluated() || value == 0 {
            ctx.skip_group()?;
            Ok(None)
        } else {
            let group = self.group(ctx)?;
            ctx.set_branch_evaluated();
            Ok(Some(group))
        }
    }

    fn else_group(&self, ctx: &mut PreprocessContext) -> Result<Option<Group>> {
        ctx.next_token()?;
        self.discard_extra_tokens(ctx)?;
        if ctx.branch_evaluated() {
            ctx.skip_group()?;
            Ok(None)
        } else {
            let group = self.group(ctx)?;
            ctx.set_branch_evaluated();
            Ok(Some(group))
        }
    }

    fn endif_line(&self, ctx: &mut PreprocessContext) -> Result<()> {
        ctx.next_token()?;
        self.discard_extra_tokens(ctx)
    }

    fn include_line(
        &self,
        ctx: &mut PreprocessContext,
        next: bool,
    ) -> Result<Option<ControlLine>> {
        let Some(keyword) = ctx.next_token()? else {
            return Ok(None);
        };
        let Some(header) = ctx.top_token()? else {
            return Ok(None);
        };
        match header.kind {
            TokenKind::UsrHeaderName => {
                ctx.next_token()?;
                self.discard_extra_tokens(ctx)?;
                self.include_user_header(ctx, &keyword, &header.value, next)?;
            }
            TokenKind::SysHeaderName => {
                ctx.next_token()?;
                self.discard_extra_tokens(ctx)?;
                self.include_system_header(ctx, &keyword, &header.value, next)?;
            }
            _ => self.macro_include_line(ctx, &keyword, next)?,
        }
        Ok(Some(ControlLine::Include { keyword, next }))
    }

    /// 6.10.2p4 form of the directive: the operand pp-tokens are macro
    /// replaced and the result has to read as a header name.
    fn macro_include_line(
        &self,
        ctx: &mut PreprocessContext,
        keyword: &Token,
        next: bool,
    ) -> Result<()> {
        let Some(mut toks) = self.pp_tokens(ctx)? else {
            return Ok(());
        };
        self.discard_extra_tokens(ctx)?;
        ctx.macro_table.replace(&mut toks);
        if !toks.is_empty() {
            let param: String = toks.iter().map(|t| t.value.as_str()).collect();
            if param.len() >= 2 && param.starts_with('"') && param.ends_with('"') {
                return self.include_user_header(ctx, keyword, &param, next);
            }
            if param.len() >= 2 && param.starts_with('<') && param.ends_with('>') {
                return self.include_system_header(ctx, keyword, &param, next);
            }
        }
        if next {
            Ok(())
        } else {
            Err(KrillError::IllformedInclude(keyword.location.clone()))
        }
    }

    fn include_user_header(
        &self,
        ctx: &mut PreprocessContext,
        keyword: &Token,
        header_name: &str,
        next: bool,
    ) -> Result<()> {
        let basename = header_name.trim_matches('"');
        let cur_dir = keyword
            .location
            .fpath
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut search_paths = vec![cur_dir];
        search_paths.extend(self.traits.project.file_search_paths.iter().cloned());
        search_paths.extend(self.traits.compiler.file_search_paths.iter().cloned());
        let resolved = resolve_headers(basename, &search_paths, if next { 2 } else { 1 });
        let fpath = if next {
            resolved.last()
        } else {
            resolved.first()
        };
        match fpath {
            Some(fpath) => self.open_header(ctx, &fpath.clone(), SourceKind::UserHeader, keyword),
            None => Err(KrillError::UserHeaderNotFound(
                keyword.location.clone(),
                basename.to_owned(),
            )),
        }
    }

    fn include_system_header(
        &self,
        ctx: &mut PreprocessContext,
        keyword: &Token,
        header_name: &str,
        next: bool,
    ) -> Result<()> {
        let basename = header_name.trim_matches(|c| c == '<' || c == '>');
        let mut search_paths = self.traits.project.file_search_paths.clone();
        search_paths.extend(self.traits.compiler.file_search_paths.iter().cloned());
        let resolved = resolve_headers(basename, &search_paths, if next { 2 } else { 1 });
        let fpath = if next {
            resolved.last()
        } else {
            resolved.first()
        };
        match fpath {
            Some(fpath) => self.open_header(ctx, &fpath.clone(), SourceKind::SystemHeader, keyword),
            None => Err(KrillError::SystemHeaderNotFound(
                keyword.location.clone(),
                basename.to_owned(),
            )),
        }
    }

    fn open_header(
        &self,
        ctx: &mut PreprocessContext,
        fpath: &Path,
        kind: SourceKind,
        keyword: &Token,
    ) -> Result<()> {
        if ctx.once_set.contains(fpath) {
            return Ok(());
        }
        info!("including {} at {}", fpath.display(), keyword.location);
        let src = Rc::new(Source::open(
            fpath,
            kind,
            Some(keyword.location.clone()),
            &self.sink,
        )?);
        let lexer = Lexer::new(src, ctx.tab_width, Rc::clone(&self.sink));
        ctx.push_lexer(lexer);
        let event = match kind {
            SourceKind::SystemHeader => Event::SystemHeaderIncluded {
                fpath: fpath.to_path_buf(),
                loc: keyword.location.clone(),
            },
            _ => Event::UserHeaderIncluded {
                fpath: fpath.to_path_buf(),
                loc: keyword.location.clone(),
            },
        };
        self.sink.notify(event);
        Ok(())
    }

    fn define_line(&self, ctx: &mut PreprocessContext) -> Result<Option<ControlLine>> {
        ctx.next_token()?;
        let id = match ctx.next_token()? {
            Some(id) if id.kind == TokenKind::Identifier => id,
            Some(tok) if tok.kind == TokenKind::NewLine => return Ok(None),
            _ => {
                self.discard_extra_tokens(ctx)?;
                return Ok(None);
            }
        };

        let function_like = ctx
            .top_token()?
            .is_some_and(|t| t.kind == TokenKind::Punct && t.value == "(");
        let mac = if function_like {
            ctx.next_token()?;
            let params = self.identifier_list(ctx)?;
            let Some(close) = ctx.next_token()? else {
                return Ok(None);
            };
            let variadic = match close.value.as_str() {
                "..." => {
                    if ctx
                        .top_token()?
                        .is_some_and(|t| t.kind == TokenKind::Punct && t.value == ")")
                    {
                        ctx.next_token()?;
                        true
                    } else {
                        self.discard_extra_tokens(ctx)?;
                        return Ok(None);
                    }
                }
                ")" => false,
                _ => {
                    self.discard_extra_tokens(ctx)?;
                    return Ok(None);
                }
            };
            let replacement = self.pp_tokens(ctx)?.unwrap_or_default();
            self.discard_extra_tokens(ctx)?;
            Macro::function(id, params, variadic, replacement)
        } else {
            let replacement = self.pp_tokens(ctx)?.unwrap_or_default();
            self.discard_extra_tokens(ctx)?;
            Macro::object(id, replacement)
        };

        let node = match &mac.def {
            MacroDef::Function { variadic, .. } => ControlLine::FunctionDefine {
                name: mac.name.clone(),
                variadic: *variadic,
            },
            _ => ControlLine::ObjectDefine {
                name: mac.name.clone(),
            },
        };
        let name = mac.name_str().to_owned();
        let loc = mac.location().clone();
        self.sink.notify(Event::MacroDefined {
            name: name.clone(),
            loc: loc.clone(),
        });
        if let Some(prev) = ctx.macro_table.define(mac) {
            self.sink.notify(Event::MacroRedefined {
                name,
                loc,
                prev_loc: prev.location().clone(),
            });
        }
        Ok(Some(node))
    }

    fn identifier_list(&self, ctx: &mut PreprocessContext) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !ctx
            .top_token()?
            .is_some_and(|t| t.kind == TokenKind::Identifier)
        {
            return Ok(ids);
        }
        while let Some(tok) = ctx.next_token()? {
            if tok.kind == TokenKind::Identifier {
                ids.push(tok.value);
            }
            if ctx
                .top_token()?
                .is_some_and(|t| t.kind == TokenKind::Punct && t.value == ",")
            {
                ctx.next_token()?;
            } else {
                break;
            }
            if !ctx
                .top_token()?
                .is_some_and(|t| t.kind == TokenKind::Identifier)
            {
                break;
            }
        }
        Ok(ids)
    }

    fn undef_line(&self, ctx: &mut PreprocessContext) -> Result<Option<ControlLine>> {
        ctx.next_token()?;
        let id = match ctx.next_token()? {
            Some(id) if id.kind == TokenKind::Identifier => id,
            Some(tok) if tok.kind == TokenKind::NewLine => return Ok(None),
            _ => {
                self.discard_extra_tokens(ctx)?;
                return Ok(None);
            }
        };
        self.discard_extra_tokens(ctx)?;
        self.sink.notify(Event::MacroUndefined {
            name: id.value.clone(),
            loc: id.location.clone(),
        });
        ctx.macro_table.undef(&id.value);
        Ok(Some(ControlLine::Undef { name: id }))
    }

    /// 6.10.4p5: the operand tokens are macro-replaced like normal text.
    /// Line numbering of the analyzed code is left untouched on purpose,
    /// diagnostics should point at physical lines.
    fn line_line(&self, ctx: &mut PreprocessContext) -> Result<Option<ControlLine>> {
        let Some(keyword) = ctx.next_token()? else {
            return Ok(None);
        };
        let pp_toks = self.pp_tokens(ctx)?;
        self.discard_extra_tokens(ctx)?;
        if let Some(mut toks) = pp_toks {
            ctx.macro_table.replace(&mut toks);
        }
        self.sink.notify(Event::LineDirective {
            loc: keyword.location.clone(),
        });
        Ok(Some(ControlLine::Line { keyword }))
    }

    fn error_line(&self, ctx: &mut PreprocessContext) -> Result<Option<ControlLine>> {
        let Some(keyword) = ctx.next_token()? else {
            return Ok(None);
        };
        let pp_toks = self.pp_tokens(ctx)?.unwrap_or_default();
        self.discard_extra_tokens(ctx)?;
        let message = pp_toks
            .iter()
            .map(|t| t.value.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        self.sink.notify(Event::ErrorDirective {
            message,
            loc: keyword.location.clone(),
        });
        Ok(Some(ControlLine::Error { keyword }))
    }

    fn pragma_line(&self, ctx: &mut PreprocessContext) -> Result<Option<ControlLine>> {
        let Some(keyword) = ctx.next_token()? else {
            return Ok(None);
        };
        let pp_toks = self.pp_tokens(ctx)?;
        self.discard_extra_tokens(ctx)?;
        match &pp_toks {
            Some(toks) if toks.len() == 1 && toks[0].value == "once" => {
                ctx.once_set
                    .insert(keyword.location.fpath.as_ref().clone());
            }
            _ => {
                let value = pp_toks
                    .unwrap_or_default()
                    .iter()
                    .map(|t| t.value.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.sink.notify(Event::UnknownPragma {
                    value,
                    loc: keyword.location.clone(),
                });
            }
        }
        Ok(Some(ControlLine::Pragma { keyword }))
    }

    fn asm_section(&self, ctx: &mut PreprocessContext) -> Result<Option<Token>> {
        let Some(keyword) = ctx.next_token()? else {
            return Ok(None);
        };
        self.discard_extra_tokens(ctx)?;
        ctx.skip_group()?;
        if let Some(tok) = ctx.next_token()? {
            if tok.kind == TokenKind::Endasm {
                self.discard_extra_tokens(ctx)?;
            }
        }
        self.sink.notify(Event::AsmSectionEvaled {
            loc: keyword.location.clone(),
        });
        Ok(Some(keyword))
    }

    fn pp_tokens(&self, ctx: &mut PreprocessContext) -> Result<Option<Vec<Token>>> {
        if !ctx
            .top_token()?
            .is_some_and(|t| t.kind == TokenKind::PpToken)
        {
            return Ok(None);
        }
        let mut toks = Vec::new();
        while ctx
            .top_token()?
            .is_some_and(|t| t.kind == TokenKind::PpToken)
        {
            if let Some(tok) = ctx.next_token()? {
                toks.push(tok);
            }
        }
        Ok(Some(toks))
    }

    fn discard_extra_tokens(&self, ctx: &mut PreprocessContext) -> Result<()> {
        let mut first_extra = None;
        while let Some(tok) = ctx.next_token()? {
            if tok.kind == TokenKind::NewLine {
                break;
            }
            first_extra.get_or_insert(tok.location);
        }
        if let Some(loc) = first_extra {
            self.sink.notify(Event::ExtraTokensIgnored { loc });
        }
        Ok(())
    }

    /// Re-lexes a text line together with any deferred ones and replaces
    /// macros in it.  Returns `None` when a function-like macro reference
    /// is still waiting for the rest of its arguments on a later line.
    fn normalize_text_line(
        &self,
        ctx: &mut PreprocessContext,
        text_line: &Token,
    ) -> Option<Vec<Token>> {
        let mut pp_toks = Vec::new();
        for deferred in &ctx.deferred_text_lines {
            pp_toks.extend(relex_text_line(deferred, ctx.tab_width));
        }
        pp_toks.extend(relex_text_line(text_line, ctx.tab_width));

        let fun_like_referred = pp_toks.iter().any(|tok| {
            ctx.macro_table
                .lookup(&tok.value)
                .is_some_and(Macro::is_function_like)
        });
        if fun_like_referred && !complete_macro_reference(&pp_toks, &ctx.macro_table) {
            return None;
        }

        ctx.macro_table.replace(&mut pp_toks);
        Some(pp_toks)
    }

    /// Text lines deferred for a macro call that never completed are
    /// emitted as-is at end of input instead of being dropped.
    fn flush_deferred_text_lines(&self, ctx: &mut PreprocessContext) -> Result<()> {
        if ctx.deferred_text_lines.is_empty() {
            return Ok(());
        }
        let mut pp_toks = Vec::new();
        for deferred in &ctx.deferred_text_lines {
            pp_toks.extend(relex_text_line(deferred, ctx.tab_width));
        }
        ctx.deferred_text_lines.clear();
        ctx.macro_table.replace(&mut pp_toks);
        for tok in pp_toks {
            ctx.output.add_token(tok);
        }
        Ok(())
    }
}

fn relex_text_line(text_line: &Token, tab_width: u32) -> Vec<Token> {
    scan::relex(
        &text_line.value,
        Rc::clone(&text_line.location.fpath),
        text_line.location.line_no,
        text_line.location.col_no,
        tab_width,
    )
}

fn resolve_headers(basename: &str, search_paths: &[PathBuf], max_num: usize) -> Vec<PathBuf> {
    let base = PathBuf::from(basename);
    if base.is_absolute() && base.is_file() {
        return vec![base];
    }
    let mut resolved = Vec::new();
    for dpath in search_paths {
        let joined = dpath.join(&base);
        let fpath = PathBuf::from(joined.to_string_lossy().replace('\\', "/"));
        if fpath.is_file() {
            resolved.push(fpath);
            if resolved.len() == max_num {
                break;
            }
        }
    }
    resolved
}

/// Checks that every function-like macro reference in the line has its
/// parentheses closed, so replacement will see the whole argument list.
fn complete_macro_reference(pp_toks: &[Token], table: &MacroTable) -> bool {
    let mut idx = 0;
    while let Some(tok) = pp_toks.get(idx) {
        idx += 1;
        match table.lookup(&tok.value) {
            Some(mac) if mac.is_function_like() => {
                if not_calling_function_like_macro(pp_toks, idx) {
                    continue;
                }
            }
            _ => continue,
        }

        if !pp_toks[idx..].iter().any(|t| t.value == "(") {
            return false;
        }

        let mut paren_cnt = 0i32;
        while let Some(tok) = pp_toks.get(idx) {
            match tok.value.as_str() {
                "(" => paren_cnt += 1,
                ")" => {
                    paren_cnt -= 1;
                    if paren_cnt == 0 {
                        break;
                    }
                }
                _ => {}
            }
            idx += 1;
        }
        if paren_cnt > 0 {
            return false;
        }
    }
    true
}

fn not_calling_function_like_macro(pp_toks: &[Token], mut idx: usize) -> bool {
    while let Some(tok) = pp_toks.get(idx) {
        if tok.value == "(" {
            return false;
        }
        if tok.kind == TokenKind::NewLine {
            idx += 1;
        } else {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::CollectingSink;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn run(text: &str) -> (PreprocessContext, Vec<Event>) {
        run_with_traits(text, Traits::default())
    }

    fn run_with_traits(text: &str, traits: Traits) -> (PreprocessContext, Vec<Event>) {
        let events = Rc::new(CollectingSink::new());
        let sink: SharedSink = events.clone();
        let src = Rc::new(Source::inline("t.c", text, &sink));
        let mut ctx = PreprocessContext::new(Rc::clone(&src.fpath), 8, Rc::clone(&sink));
        let pp = Preprocessor::new(Rc::new(traits), sink);
        pp.preprocess(&mut ctx, src).unwrap();
        (ctx, events.take())
    }

    fn run_tree(text: &str) -> PreprocessingFile {
        let sink: SharedSink = Rc::new(CollectingSink::new());
        let src = Rc::new(Source::inline("t.c", text, &sink));
        let mut ctx = PreprocessContext::new(Rc::clone(&src.fpath), 8, Rc::clone(&sink));
        let pp = Preprocessor::new(Rc::new(Traits::default()), sink);
        pp.preprocess(&mut ctx, src).unwrap()
    }

    fn run_err(text: &str) -> KrillError {
        let events = Rc::new(CollectingSink::new());
        let sink: SharedSink = events.clone();
        let src = Rc::new(Source::inline("t.c", text, &sink));
        let mut ctx = PreprocessContext::new(Rc::clone(&src.fpath), 8, Rc::clone(&sink));
        let pp = Preprocessor::new(Rc::new(Traits::default()), sink);
        pp.preprocess(&mut ctx, src).unwrap_err()
    }

    fn values(ctx: &PreprocessContext) -> Vec<&str> {
        ctx.output
            .tokens()
            .iter()
            .filter(|t| t.kind != TokenKind::NewLine)
            .map(|t| t.value.as_str())
            .collect()
    }

    #[test]
    fn object_macro_flows_into_text_lines() {
        let (ctx, _) = run("#define N 10\nint a[N];\n");
        assert_eq!(values(&ctx), ["int", "a", "[", "10", "]", ";"]);
    }

    #[test]
    fn function_macro_expands_with_arguments() {
        let (ctx, _) = run("#define MAX(a, b) ((a) > (b) ? (a) : (b))\nx = MAX(1, 2);\n");
        assert_eq!(
            values(&ctx),
            ["x", "=", "(", "(", "1", ")", ">", "(", "2", ")", "?", "(", "1", ")", ":", "(", "2", ")", ")", ";"]
        );
    }

    #[test]
    fn exactly_one_conditional_branch_survives() {
        let text = "#define SEL 2\n\
                    #if SEL == 1\none\n#elif SEL == 2\ntwo\n#elif SEL == 2\nalso\n\
                    #else\nother\n#endif\n";
        let (ctx, _) = run(text);
        assert_eq!(values(&ctx), ["two"]);
    }

    #[test]
    fn else_branch_taken_when_nothing_evaluated() {
        let (ctx, _) = run("#if 0\na\n#elif 0\nb\n#else\nc\n#endif\n");
        assert_eq!(values(&ctx), ["c"]);
    }

    #[test]
    fn ifdef_and_ifndef_react_to_definitions() {
        let (ctx, _) = run("#define FOO\n#ifdef FOO\nyes\n#endif\n#ifndef FOO\nno\n#endif\n");
        assert_eq!(values(&ctx), ["yes"]);
    }

    #[test]
    fn undef_removes_the_definition() {
        let (ctx, events) = run("#define X 1\n#undef X\n#ifdef X\ngone\n#endif\nX\n");
        assert_eq!(values(&ctx), ["X"]);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::MacroUndefined { name, .. } if name == "X")));
    }

    #[test]
    fn missing_endif_is_fatal_at_the_opening_directive() {
        match run_err("#if 1\nint a;\n") {
            KrillError::UnterminatedIfSection(loc) => assert_eq!(loc.line_no, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn nested_conditionals_skip_as_a_unit() {
        let text = "#if 0\n#if 1\nhidden\n#endif\nstill hidden\n#else\nshown\n#endif\n";
        let (ctx, _) = run(text);
        assert_eq!(values(&ctx), ["shown"]);
    }

    #[test]
    fn split_macro_invocation_is_deferred_until_complete() {
        let text = "#define ADD(a, b) a + b\nx = ADD(1,\n2);\n";
        let (ctx, _) = run(text);
        assert_eq!(values(&ctx), ["x", "=", "1", "+", "2", ";"]);
    }

    #[test]
    fn incomplete_invocation_is_flushed_at_eof() {
        let text = "#define ADD(a, b) a + b\nx = ADD(1,\n";
        let (ctx, _) = run(text);
        assert_eq!(values(&ctx), ["x", "=", "ADD", "(", "1", ","]);
    }

    #[test]
    fn error_directive_is_reported() {
        let (_, events) = run("#if 0\n#error should not fire\n#endif\n#error bad config\n");
        let messages: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::ErrorDirective { message, .. } => Some(message.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(messages, ["bad config"]);
    }

    #[test]
    fn unknown_pragma_is_reported() {
        let (_, events) = run("#pragma pack(1)\n");
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::UnknownPragma { value, .. } if value == "pack ( 1 )")));
    }

    #[test]
    fn asm_section_is_skipped_and_reported() {
        let (ctx, events) = run("before;\n#asm\nmov eax, 1\n#endasm\nafter;\n");
        assert_eq!(values(&ctx), ["before", ";", "after", ";"]);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::AsmSectionEvaled { .. })));
    }

    #[test]
    fn extra_tokens_after_directive_are_reported() {
        let (ctx, events) = run("#define ONE 1\n#ifdef ONE junk\nbody\n#endif\n");
        assert_eq!(values(&ctx), ["body"]);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ExtraTokensIgnored { .. })));
    }

    #[test]
    fn user_header_is_included_and_positions_survive() {
        let dir = tempfile::tempdir().unwrap();
        let hpath = dir.path().join("config.h");
        fs::write(&hpath, "#define SIZE 4\n").unwrap();
        let traits = Traits {
            project: crate::traits::ProjectTraits {
                file_search_paths: vec![dir.path().to_path_buf()],
                ..Default::default()
            },
            ..Default::default()
        };
        let (ctx, events) = run_with_traits("#include \"config.h\"\nchar b[SIZE];\n", traits);
        assert_eq!(values(&ctx), ["char", "b", "[", "4", "]", ";"]);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::UserHeaderIncluded { .. })));
    }

    #[test]
    fn missing_user_header_is_fatal() {
        match run_err("#include \"no_such.h\"\n") {
            KrillError::UserHeaderNotFound(_, name) => assert_eq!(name, "no_such.h"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn macro_derived_include_operand_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("gen.h"), "int gen;\n").unwrap();
        let traits = Traits {
            project: crate::traits::ProjectTraits {
                file_search_paths: vec![dir.path().to_path_buf()],
                ..Default::default()
            },
            ..Default::default()
        };
        let (ctx, _) = run_with_traits("#define HDR \"gen.h\"\n#include HDR\n", traits);
        assert_eq!(values(&ctx), ["int", "gen"]);
    }

    #[test]
    fn illformed_include_is_fatal() {
        match run_err("#include foo bar\n") {
            KrillError::IllformedInclude(loc) => assert_eq!(loc.line_no, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn pragma_once_blocks_reinclusion() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("once.h"), "#pragma once\nint once_var;\n").unwrap();
        let traits = Traits {
            project: crate::traits::ProjectTraits {
                file_search_paths: vec![dir.path().to_path_buf()],
                ..Default::default()
            },
            ..Default::default()
        };
        let (ctx, _) = run_with_traits(
            "#include \"once.h\"\n#include \"once.h\"\n",
            traits,
        );
        assert_eq!(values(&ctx), ["int", "once_var", ";"]);
    }

    #[test]
    fn include_next_picks_the_second_match() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(first.path().join("deep.h"), "int shallow;\n").unwrap();
        fs::write(second.path().join("deep.h"), "int deep;\n").unwrap();
        let traits = Traits {
            project: crate::traits::ProjectTraits {
                file_search_paths: vec![first.path().to_path_buf(), second.path().to_path_buf()],
                ..Default::default()
            },
            ..Default::default()
        };
        let (ctx, _) = run_with_traits("#include_next \"deep.h\"\n", traits);
        assert_eq!(values(&ctx), ["int", "deep", ";"]);
    }

    #[test]
    fn conditional_spanning_include_boundary_keeps_skipping() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("open.h"), "#if 0\nnever\n").unwrap();
        let traits = Traits {
            project: crate::traits::ProjectTraits {
                file_search_paths: vec![dir.path().to_path_buf()],
                ..Default::default()
            },
            ..Default::default()
        };
        let (ctx, _) = run_with_traits(
            "#include \"open.h\"\nstill skipped\n#endif\nvisible;\n",
            traits,
        );
        assert_eq!(values(&ctx), ["visible", ";"]);
    }

    #[test]
    fn line_directive_is_macro_replaced_and_noted() {
        let (ctx, events) = run("#define L 42\n#line L \"other.c\"\nint x;\n");
        assert_eq!(values(&ctx), ["int", "x", ";"]);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::LineDirective { .. })));
    }

    #[test]
    fn predefined_macros_answer_in_conditions() {
        let (ctx, _) = run("#if __STDC_VERSION__ == 199901L\nc99\n#endif\n");
        assert_eq!(values(&ctx), ["c99"]);
    }

    #[test]
    fn defined_operator_sees_table_changes() {
        let text = "#define A 1\n#if defined A && !defined(B)\nok\n#endif\n";
        let (ctx, _) = run(text);
        assert_eq!(values(&ctx), ["ok"]);
    }

    #[test]
    fn group_parts_mirror_the_source_structure() {
        let tree = run_tree(
            "#define N 10\n#define MAX(a, b) a\n#if 1\nint a[N];\n#endif\n#pragma pack(1)\n",
        );
        assert_eq!(tree.fpath().as_path(), Path::new("t.c"));
        let parts = tree.group().parts();
        assert_eq!(parts.len(), 4);
        assert!(matches!(
            &parts[0],
            GroupPart::ControlLine(ControlLine::ObjectDefine { name }) if name.value == "N"
        ));
        assert!(matches!(
            &parts[1],
            GroupPart::ControlLine(ControlLine::FunctionDefine { name, variadic: false })
                if name.value == "MAX"
        ));
        match &parts[2] {
            GroupPart::IfSection(sect) => {
                assert_eq!(sect.keyword.kind, TokenKind::If);
                let taken = sect.taken.as_ref().unwrap();
                assert!(matches!(taken.parts(), [GroupPart::TextLine(_)]));
            }
            other => panic!("unexpected group part: {other:?}"),
        }
        assert!(matches!(
            &parts[3],
            GroupPart::ControlLine(ControlLine::Pragma { .. })
        ));
    }

    #[test]
    fn skipped_branches_leave_no_children_in_the_tree() {
        let tree = run_tree("#if 0\nhidden\n#elif 0\nstill\n#else\nshown\n#endif\n");
        match &tree.group().parts()[0] {
            GroupPart::IfSection(sect) => {
                let taken = sect.taken.as_ref().unwrap();
                assert!(matches!(
                    taken.parts(),
                    [GroupPart::TextLine(tok)] if tok.value.contains("shown")
                ));
            }
            other => panic!("unexpected group part: {other:?}"),
        }

        let tree = run_tree("#ifdef NOT_DEFINED\nhidden\n#endif\n");
        match &tree.group().parts()[0] {
            GroupPart::IfSection(sect) => assert!(sect.taken.is_none()),
            other => panic!("unexpected group part: {other:?}"),
        }
    }

    #[test]
    fn file_and_line_specials_expand_in_text() {
        let (ctx, _) = run("const char *f = __FILE__;\nint l = __LINE__;\n");
        let vals = values(&ctx);
        assert!(vals.contains(&"\"t.c\""));
        assert!(vals.contains(&"2"));
    }
}
