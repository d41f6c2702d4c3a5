use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::diag::{Event, SharedSink};
use crate::location::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Target,
    UserHeader,
    SystemHeader,
    InitialHeader,
}

/// A source file with its content normalized for lexing.
pub struct Source {
    pub fpath: Rc<PathBuf>,
    pub content: Rc<str>,
    pub kind: SourceKind,
    pub included_at: Option<Location>,
}

impl Source {
    pub fn open(
        fpath: &Path,
        kind: SourceKind,
        included_at: Option<Location>,
        sink: &SharedSink,
    ) -> std::io::Result<Self> {
        let bytes = fs::read(fpath)?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(Self::from_text(fpath.to_path_buf(), text, kind, included_at, sink))
    }

    /// Builds a source from an in-memory string, applying the same
    /// normalization as `open`.
    pub fn inline(fpath: impl Into<PathBuf>, text: &str, sink: &SharedSink) -> Self {
        Self::from_text(fpath.into(), text.to_owned(), SourceKind::Target, None, sink)
    }

    /// A stand-in run through the pipeline when no initial header is
    /// configured, so every run starts from the same state.
    pub fn empty(kind: SourceKind) -> Self {
        Self {
            fpath: Rc::new(PathBuf::new()),
            content: Rc::from("\n"),
            kind,
            included_at: None,
        }
    }

    fn from_text(
        fpath: PathBuf,
        text: String,
        kind: SourceKind,
        included_at: Option<Location>,
        sink: &SharedSink,
    ) -> Self {
        let content = normalize(&fpath, text, sink);
        Self {
            fpath: Rc::new(fpath),
            content: content.into(),
            kind,
            included_at,
        }
    }
}

/// Strips a BOM, folds line terminators to LF, drops a trailing ^Z and
/// guarantees the content ends with a newline so the lexer never has to
/// deal with an unterminated last line.
fn normalize(fpath: &Path, text: String, sink: &SharedSink) -> String {
    let mut text = text;
    if let Some(stripped) = text.strip_prefix('\u{feff}') {
        text = stripped.to_owned();
    }
    if text.contains('\r') {
        sink.notify(Event::CrAtEndOfLine {
            fpath: fpath.to_path_buf(),
        });
        text = text.replace("\r\n", "\n").replace('\r', "\n");
    }
    if text.ends_with('\u{1a}') {
        sink.notify(Event::EofMarkFound {
            fpath: fpath.to_path_buf(),
        });
        while text.ends_with('\u{1a}') {
            text.pop();
        }
    }
    if text.is_empty() {
        sink.notify(Event::EmptySource {
            fpath: fpath.to_path_buf(),
        });
        return "\n".to_owned();
    }
    if !text.ends_with('\n') {
        sink.notify(Event::MissingFinalNewline {
            fpath: fpath.to_path_buf(),
        });
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::{CollectingSink, SharedSink};
    use pretty_assertions::assert_eq;

    fn sink() -> (Rc<CollectingSink>, SharedSink) {
        let collecting = Rc::new(CollectingSink::new());
        (collecting.clone(), collecting as SharedSink)
    }

    #[test]
    fn folds_crlf_and_strips_bom() {
        let (events, sink) = sink();
        let src = Source::inline("t.c", "\u{feff}int a;\r\nint b;\n", &sink);
        assert_eq!(&*src.content, "int a;\nint b;\n");
        assert!(events
            .events()
            .iter()
            .any(|e| matches!(e, Event::CrAtEndOfLine { .. })));
    }

    #[test]
    fn trailing_eof_mark_is_dropped_and_reported() {
        let (events, sink) = sink();
        let src = Source::inline("t.c", "int a;\n\u{1a}", &sink);
        assert_eq!(&*src.content, "int a;\n");
        assert!(events
            .events()
            .iter()
            .any(|e| matches!(e, Event::EofMarkFound { .. })));
    }

    #[test]
    fn empty_source_becomes_single_newline() {
        let (events, sink) = sink();
        let src = Source::inline("t.c", "", &sink);
        assert_eq!(&*src.content, "\n");
        assert!(events
            .events()
            .iter()
            .any(|e| matches!(e, Event::EmptySource { .. })));
    }

    #[test]
    fn missing_final_newline_is_reported_and_fixed() {
        let (events, sink) = sink();
        let src = Source::inline("t.c", "int a;", &sink);
        assert_eq!(&*src.content, "int a;\n");
        assert!(events
            .events()
            .iter()
            .any(|e| matches!(e, Event::MissingFinalNewline { .. })));
    }
}
