use std::path::PathBuf;

use thiserror::Error;

use crate::location::Location;

/// Conditions that abort preprocessing of the current translation unit.
#[derive(Debug, Error)]
pub enum KrillError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}: unterminated block comment")]
    UnterminatedBlockComment(Location),

    #[error("{0}: cannot find user header \"{1}\"")]
    UserHeaderNotFound(Location, String),

    #[error("{0}: cannot find system header <{1}>")]
    SystemHeaderNotFound(Location, String),

    #[error("{0}: ill-formed #include directive")]
    IllformedInclude(Location),

    #[error("{0}: unterminated conditional directive")]
    UnterminatedIfSection(Location),

    #[error("{}: broken traits file: {1}", .0.display())]
    BadTraits(PathBuf, String),
}

pub type Result<T> = std::result::Result<T, KrillError>;
