mod analyzer;
mod cli;
mod diag;
mod error;
mod location;
mod preproc;
mod scan;
mod source;
mod token;
mod traits;

use std::fs;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use log::{debug, error, LevelFilter};

use crate::analyzer::Analyzer;
use crate::cli::Cli;
use crate::diag::{LoggingSink, SharedSink};
use crate::traits::Traits;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let mut traits = if cli.traits.is_file() {
        match Traits::load(&cli.traits) {
            Ok(traits) => traits,
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        debug!("no traits file at {}, using defaults", cli.traits.display());
        Traits::default()
    };

    let search_paths = &mut traits.project.file_search_paths;
    search_paths.splice(0..0, cli.include_dirs.iter().cloned());

    let sink: SharedSink = Rc::new(LoggingSink);
    let analyzer = Analyzer::new(Rc::new(traits), sink);

    let mut failed = false;
    for fpath in &cli.files {
        match analyzer.run_file(fpath) {
            Ok(output) => {
                let text = output.to_text();
                match &cli.output_ext {
                    Some(ext) => {
                        let out_fpath = fpath.with_extension(ext);
                        if let Err(e) = fs::write(&out_fpath, text) {
                            error!("{}: {e}", out_fpath.display());
                            failed = true;
                        }
                    }
                    None => print!("{text}"),
                }
            }
            Err(e) => {
                error!("{}: {e}", fpath.display());
                failed = true;
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
