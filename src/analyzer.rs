use std::path::Path;
use std::rc::Rc;

use log::{debug, info};

use crate::diag::SharedSink;
use crate::error::Result;
use crate::preproc::output::PreprocessedSource;
use crate::preproc::preprocessor::{PreprocessContext, Preprocessor};
use crate::source::{Source, SourceKind};
use crate::traits::Traits;

/// Runs the preprocessing phases over translation units, one independent
/// run per target file.  A fatal condition aborts only the unit that hit
/// it.
pub struct Analyzer {
    traits: Rc<Traits>,
    sink: SharedSink,
}

impl Analyzer {
    pub fn new(traits: Rc<Traits>, sink: SharedSink) -> Self {
        Self { traits, sink }
    }

    /// Preprocesses one translation unit and returns its token stream
    /// with code block substitutions already applied.
    pub fn run_file(&self, fpath: &Path) -> Result<PreprocessedSource> {
        info!("preprocessing {}", fpath.display());
        let root_fpath = Rc::new(fpath.to_path_buf());
        let mut ctx = PreprocessContext::new(
            Rc::clone(&root_fpath),
            self.traits.project.tab_width,
            Rc::clone(&self.sink),
        );
        let pp = Preprocessor::new(Rc::clone(&self.traits), Rc::clone(&self.sink));

        self.preprocess_initial_header(&pp, &mut ctx, self.traits.compiler.initial_header.as_deref())?;
        self.preprocess_initial_header(&pp, &mut ctx, self.traits.project.initial_header.as_deref())?;

        let target = Rc::new(Source::open(fpath, SourceKind::Target, None, &self.sink)?);
        let tree = pp.preprocess(&mut ctx, target)?;
        debug!(
            "{}: {} top-level group parts",
            tree.fpath().display(),
            tree.group().parts().len()
        );

        let mut output = ctx.output;
        output.substitute_code_blocks(&self.traits, &self.sink);
        Ok(output)
    }

    fn preprocess_initial_header(
        &self,
        pp: &Preprocessor,
        ctx: &mut PreprocessContext,
        header: Option<&Path>,
    ) -> Result<()> {
        let src = match header {
            Some(header) => Source::open(header, SourceKind::InitialHeader, None, &self.sink)?,
            None => Source::empty(SourceKind::InitialHeader),
        };
        pp.preprocess(ctx, Rc::new(src))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::CollectingSink;
    use crate::error::KrillError;
    use crate::traits::ProjectTraits;
    use std::fs;

    fn analyzer(traits: Traits) -> Analyzer {
        let sink: SharedSink = Rc::new(CollectingSink::new());
        Analyzer::new(Rc::new(traits), sink)
    }

    #[test]
    fn initial_header_macros_reach_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("init.h");
        fs::write(&header, "#define BOARD 7\n").unwrap();
        let target = dir.path().join("t.c");
        fs::write(&target, "int b = BOARD;\n").unwrap();

        let traits = Traits {
            project: ProjectTraits {
                initial_header: Some(header),
                ..Default::default()
            },
            ..Default::default()
        };
        let output = analyzer(traits).run_file(&target).unwrap();
        let values: Vec<_> = output.pp_tokens().map(|t| t.value.as_str()).collect();
        assert_eq!(values, ["int", "b", "=", "7", ";"]);
    }

    #[test]
    fn failing_unit_leaves_the_analyzer_usable() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.c");
        fs::write(&bad, "#if 1\nno endif\n").unwrap();
        let good = dir.path().join("good.c");
        fs::write(&good, "int ok;\n").unwrap();

        let analyzer = analyzer(Traits::default());
        let err = analyzer.run_file(&bad).unwrap_err();
        assert!(matches!(err, KrillError::UnterminatedIfSection(_)));
        let output = analyzer.run_file(&good).unwrap();
        let values: Vec<_> = output.pp_tokens().map(|t| t.value.as_str()).collect();
        assert_eq!(values, ["int", "ok", ";"]);
    }

    #[test]
    fn inline_assembly_is_erased_from_the_output() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t.c");
        fs::write(&target, "int f(void) { __asm__ volatile (\"nop\"); return 0; }\n").unwrap();

        let output = analyzer(Traits::default()).run_file(&target).unwrap();
        let values: Vec<_> = output.pp_tokens().map(|t| t.value.as_str()).collect();
        assert_eq!(
            values,
            ["int", "f", "(", "void", ")", "{", "return", "0", ";", "}"]
        );
    }
}
