//! Structure of one preprocessed translation unit.
//!
//! Directive evaluation happens while parsing, so the tree records what
//! was actually parsed: skipped conditional branches leave no children.

use std::path::PathBuf;
use std::rc::Rc;

use crate::token::Token;

/// Root node for a translation unit.
#[derive(Debug)]
pub struct PreprocessingFile {
    fpath: Rc<PathBuf>,
    group: Group,
}

impl PreprocessingFile {
    pub fn new(fpath: Rc<PathBuf>, group: Group) -> Self {
        Self { fpath, group }
    }

    pub fn fpath(&self) -> &Rc<PathBuf> {
        &self.fpath
    }

    pub fn group(&self) -> &Group {
        &self.group
    }
}

/// A run of group parts at one nesting level.
#[derive(Debug, Default)]
pub struct Group {
    parts: Vec<GroupPart>,
}

impl Group {
    pub fn push(&mut self, part: GroupPart) {
        self.parts.push(part);
    }

    pub fn parts(&self) -> &[GroupPart] {
        &self.parts
    }
}

/// One directive line, text line or conditional section.
#[derive(Debug)]
pub enum GroupPart {
    IfSection(IfSection),
    ControlLine(ControlLine),
    TextLine(Token),
    AsmSection(Token),
    NullDirective(Token),
    UnknownDirective(Token),
}

/// A `#if`-family section.  `taken` holds the group of the branch whose
/// condition held, if any branch was entered at all.
#[derive(Debug)]
pub struct IfSection {
    pub keyword: Token,
    pub taken: Option<Group>,
}

/// The non-conditional directive lines.
#[derive(Debug)]
pub enum ControlLine {
    Include { keyword: Token, next: bool },
    ObjectDefine { name: Token },
    FunctionDefine { name: Token, variadic: bool },
    Undef { name: Token },
    Line { keyword: Token },
    Error { keyword: Token },
    Pragma { keyword: Token },
}
