use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use log::{debug, warn};

use crate::location::Location;

/// Notable things observed while preprocessing.  None of these stop the
/// run; fatal conditions are reported through `KrillError` instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    EofNewlineNotFound {
        loc: Location,
    },
    UnlexableCharFound {
        ch: String,
        loc: Location,
    },
    IllformedNewlineEscape {
        loc: Location,
    },
    NestedBlockComment {
        loc: Location,
    },
    CommentFound {
        value: String,
        loc: Location,
    },
    CrAtEndOfLine {
        fpath: PathBuf,
    },
    EofMarkFound {
        fpath: PathBuf,
    },
    MissingFinalNewline {
        fpath: PathBuf,
    },
    EmptySource {
        fpath: PathBuf,
    },
    MacroDefined {
        name: String,
        loc: Location,
    },
    MacroRedefined {
        name: String,
        loc: Location,
        prev_loc: Location,
    },
    MacroUndefined {
        name: String,
        loc: Location,
    },
    ObjectMacroReplaced {
        name: String,
        loc: Location,
    },
    FunctionMacroReplaced {
        name: String,
        loc: Location,
    },
    SharpSharpEvaled {
        lhs: String,
        rhs: Option<String>,
        result: Vec<String>,
    },
    LastBackslashIgnored {
        loc: Location,
    },
    UserHeaderIncluded {
        fpath: PathBuf,
        loc: Location,
    },
    SystemHeaderIncluded {
        fpath: PathBuf,
        loc: Location,
    },
    UnknownPragma {
        value: String,
        loc: Location,
    },
    UnknownDirective {
        value: String,
        loc: Location,
    },
    NullDirective {
        loc: Location,
    },
    ExtraTokensIgnored {
        loc: Location,
    },
    AsmSectionEvaled {
        loc: Location,
    },
    ErrorDirective {
        message: String,
        loc: Location,
    },
    LineDirective {
        loc: Location,
    },
    UndefinedMacroInExpr {
        name: String,
        loc: Location,
    },
    IllformedDefinedOp {
        loc: Location,
    },
    DivisionByZeroInExpr {
        loc: Location,
    },
    CodeBlockSubstituted {
        name: String,
        loc: Location,
    },
}

pub trait EventSink {
    fn notify(&self, event: Event);
}

pub type SharedSink = Rc<dyn EventSink>;

/// Forwards every event to the `log` facade.
#[derive(Default)]
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn notify(&self, event: Event) {
        match &event {
            Event::EofNewlineNotFound { loc } => warn!("{loc}: no newline at end of file"),
            Event::UnlexableCharFound { ch, loc } => warn!("{loc}: unlexable character `{ch}`"),
            Event::IllformedNewlineEscape { loc } => {
                warn!("{loc}: whitespace between backslash and newline")
            }
            Event::NestedBlockComment { loc } => warn!("{loc}: `/*` inside a block comment"),
            Event::CrAtEndOfLine { fpath } => {
                warn!("{}: carriage return at end of line", fpath.display())
            }
            Event::EofMarkFound { fpath } => {
                warn!("{}: control-Z before end of file", fpath.display())
            }
            Event::MissingFinalNewline { fpath } => {
                warn!("{}: file does not end with a newline", fpath.display())
            }
            Event::EmptySource { fpath } => warn!("{}: empty source file", fpath.display()),
            Event::MacroRedefined { name, loc, prev_loc } => {
                warn!("{loc}: macro `{name}` redefined, first defined at {prev_loc}")
            }
            Event::UnknownPragma { value, loc } => warn!("{loc}: unknown pragma `{value}`"),
            Event::UnknownDirective { value, loc } => {
                warn!("{loc}: unknown directive `{}`", value.trim_end())
            }
            Event::ExtraTokensIgnored { loc } => warn!("{loc}: extra tokens after directive"),
            Event::ErrorDirective { message, loc } => warn!("{loc}: #error {message}"),
            Event::LastBackslashIgnored { loc } => {
                warn!("{loc}: trailing backslash of a stringized argument ignored")
            }
            Event::UndefinedMacroInExpr { name, loc } => {
                debug!("{loc}: `{name}` is not defined, treated as 0")
            }
            Event::IllformedDefinedOp { loc } => warn!("{loc}: ill-formed defined operator"),
            Event::DivisionByZeroInExpr { loc } => warn!("{loc}: division by zero in #if"),
            other => debug!("{other:?}"),
        }
    }
}

/// Records events for inspection.  Used by the analyzer to build the run
/// report and by tests to assert on what was observed.
#[derive(Default)]
pub struct CollectingSink {
    events: RefCell<Vec<Event>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Event> {
        self.events.take()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }
}

impl EventSink for CollectingSink {
    fn notify(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

/// Discards everything.
#[derive(Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _event: Event) {}
}
