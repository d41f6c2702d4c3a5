use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Debug, Parser)]
#[command(name = "krill", version, about = "C99 preprocessing front end for static analysis")]
pub struct Cli {
    /// Traits file with the project and compiler settings.
    #[arg(short, long, value_name = "FILE", default_value = "krill-traits.yml")]
    pub traits: PathBuf,

    /// Extra directory to search for user headers, before the traits
    /// file's search paths.  May be given more than once.
    #[arg(short = 'I', value_name = "DIR", action = ArgAction::Append)]
    pub include_dirs: Vec<PathBuf>,

    /// Write preprocessed output next to each input file with this
    /// extension instead of printing to standard output.
    #[arg(short, long, value_name = "EXT")]
    pub output_ext: Option<String>,

    /// Increase log verbosity.  Repeat for more detail.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// C source files to preprocess.
    #[arg(required = true, value_name = "FILE")]
    pub files: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_files_and_flags() {
        let cli = Cli::parse_from(["krill", "-t", "my.yml", "-vv", "-Iinc", "a.c", "b.c"]);
        assert_eq!(cli.traits, PathBuf::from("my.yml"));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.include_dirs, vec![PathBuf::from("inc")]);
        assert_eq!(cli.files, vec![PathBuf::from("a.c"), PathBuf::from("b.c")]);
    }

    #[test]
    fn requires_at_least_one_file() {
        assert!(Cli::try_parse_from(["krill"]).is_err());
    }
}
