use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{KrillError, Result};

/// Analysis settings loaded from a YAML traits file.
///
/// The project section describes the code under analysis, the compiler
/// section describes the toolchain being imitated.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Traits {
    #[serde(default)]
    pub project: ProjectTraits,
    #[serde(default)]
    pub compiler: CompilerTraits,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectTraits {
    #[serde(default)]
    pub file_search_paths: Vec<PathBuf>,
    #[serde(default)]
    pub initial_header: Option<PathBuf>,
    #[serde(default = "default_tab_width")]
    pub tab_width: u32,
}

impl Default for ProjectTraits {
    fn default() -> Self {
        Self {
            file_search_paths: Vec::new(),
            initial_header: None,
            tab_width: default_tab_width(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompilerTraits {
    #[serde(default)]
    pub file_search_paths: Vec<PathBuf>,
    #[serde(default)]
    pub initial_header: Option<PathBuf>,
    #[serde(default)]
    pub extension_substitutions: Vec<CodeSubstitutionTraits>,
    #[serde(default)]
    pub arbitrary_substitutions: Vec<CodeSubstitutionTraits>,
}

/// One token pattern to replace in the preprocessed output, with `__krill__any`
/// acting as a wildcard for any balanced token sequence.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeSubstitutionTraits {
    pub name: String,
    pub pattern: Vec<String>,
    pub replacement: String,
}

fn default_tab_width() -> u32 {
    8
}

impl Traits {
    pub fn load(fpath: &Path) -> Result<Self> {
        let text = fs::read_to_string(fpath)?;
        serde_yaml::from_str(&text)
            .map_err(|e| KrillError::BadTraits(fpath.to_path_buf(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_sane() {
        let traits: Traits = serde_yaml::from_str("{}").unwrap();
        assert_eq!(traits.project.tab_width, 8);
        assert!(traits.project.file_search_paths.is_empty());
        assert!(traits.compiler.extension_substitutions.is_empty());
    }

    #[test]
    fn parses_search_paths_and_substitutions() {
        let yaml = r#"
project:
  file_search_paths: ["include", "src"]
  tab_width: 4
compiler:
  file_search_paths: ["/usr/include"]
  extension_substitutions:
    - name: "__extension__"
      pattern: ["__extension__"]
      replacement: ""
"#;
        let traits: Traits = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(traits.project.tab_width, 4);
        assert_eq!(traits.project.file_search_paths.len(), 2);
        assert_eq!(traits.compiler.extension_substitutions[0].pattern.len(), 1);
    }
}
