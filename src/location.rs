use std::fmt::{self, Display};
use std::path::PathBuf;
use std::rc::Rc;

/// Position of a token in a translation unit.
///
/// `col_no` counts characters, `appearance_col_no` counts display columns
/// with tabs expanded to the configured tab width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub fpath: Rc<PathBuf>,
    pub line_no: u32,
    pub col_no: u32,
    pub appearance_col_no: u32,
}

impl Location {
    pub fn new(fpath: Rc<PathBuf>, line_no: u32, col_no: u32, appearance_col_no: u32) -> Self {
        Self {
            fpath,
            line_no,
            col_no,
            appearance_col_no,
        }
    }

    /// Location for tokens that have no source of their own, such as the
    /// replacement lists of predefined macros.
    pub fn builtin() -> Self {
        Self::new(Rc::new(PathBuf::from("<builtin>")), 0, 1, 1)
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.fpath.display(),
            self.line_no,
            self.col_no
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_path_line_and_column() {
        let loc = Location::new(Rc::new(PathBuf::from("t.c")), 3, 7, 7);
        assert_eq!(loc.to_string(), "t.c:3:7");
    }
}
