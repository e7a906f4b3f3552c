//! Definition loader and library environment
//!
//! Operator definitions live in YAML or JSON files. An [`Environ`]
//! resolves dot-separated operator ids against an ordered list of
//! library roots: the working directory first, then every path from the
//! `WEFT_LIB` environment variable. A leading `.` in an operator id
//! forces resolution relative to the importing file. Circular imports
//! are detected by absolute path.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::runtime::builder::build_and_compile;
use crate::runtime::def::OperatorDef;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::operator::Operator;
use crate::runtime::registry::BuiltinCatalog;
use crate::runtime::typedef::Generics;
use crate::runtime::value::Properties;

/// Environment variable holding additional library roots
pub const LIB_ENV_VAR: &str = "WEFT_LIB";

// Tried in order; the first existing file wins.
const FILE_ENDINGS: &[&str] = &["yaml", "yml", "json"];

/// Ordered library roots for definition lookup
pub struct Environ {
    paths: Vec<PathBuf>,
}

impl Environ {
    /// Create an environment rooted at `working_dir`, extended by the
    /// paths in `WEFT_LIB`.
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let mut paths = vec![working_dir.into()];

        let separator = if cfg!(windows) { ';' } else { ':' };
        if let Ok(libs) = env::var(LIB_ENV_VAR) {
            paths.extend(
                libs.split(separator)
                    .filter(|path| !path.is_empty())
                    .map(PathBuf::from),
            );
        }

        Environ { paths }
    }

    /// The primary root, searched first.
    pub fn working_dir(&self) -> &Path {
        &self.paths[0]
    }

    fn file_with_ending(base: &Path) -> Option<PathBuf> {
        for ending in FILE_ENDINGS {
            let candidate = base.with_extension(ending);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    fn definition_file_path(
        &self,
        relative: &Path,
        enforced: Option<&Path>,
    ) -> Option<PathBuf> {
        if let Some(root) = enforced {
            return Self::file_with_ending(&root.join(relative));
        }
        self.paths
            .iter()
            .find_map(|root| Self::file_with_ending(&root.join(relative)))
    }

    /// Read, parse, and validate a definition file, recursively
    /// resolving child operators. `paths_read` carries the chain of
    /// files currently being imported for recursion detection.
    pub fn read_operator_def(
        &self,
        def_file: &Path,
        paths_read: &mut Vec<PathBuf>,
    ) -> Result<OperatorDef> {
        let absolute = def_file.canonicalize()?;
        if paths_read.contains(&absolute) {
            return Err(RuntimeError::RecursiveImport(absolute));
        }
        paths_read.push(absolute.clone());

        let text = std::fs::read_to_string(&absolute)?;
        let mut def: OperatorDef = match absolute.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)?,
            Some("json") => serde_json::from_str(&text)?,
            _ => {
                paths_read.pop();
                return Err(RuntimeError::UnknownOperator(format!(
                    "unsupported file ending: {}",
                    absolute.display()
                )));
            }
        };
        def.validate()?;

        let current_dir = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let catalog = BuiltinCatalog::global();
        for instance in &mut def.instances {
            if catalog.is_registered(&instance.operator) || instance.operator_def.is_some() {
                continue;
            }
            let child_file = self
                .operator_file_path(&instance.operator, &current_dir)
                .ok_or_else(|| RuntimeError::UnknownOperator(instance.operator.clone()))?;
            tracing::debug!(
                operator = %instance.operator,
                file = %child_file.display(),
                "resolved child definition"
            );
            instance.operator_def = Some(self.read_operator_def(&child_file, paths_read)?);
        }

        paths_read.pop();
        Ok(def)
    }

    fn operator_file_path(&self, operator: &str, current_dir: &Path) -> Option<PathBuf> {
        let (id, enforced) = match operator.strip_prefix('.') {
            Some(local) => (local, Some(current_dir)),
            None => (operator, None),
        };
        let relative: PathBuf = id.split('.').collect();
        self.definition_file_path(&relative, enforced)
    }

    /// Resolve a dot-separated operator id against the library roots
    /// and read its definition.
    pub fn read_operator_id(&self, operator: &str) -> Result<OperatorDef> {
        let def_file = self
            .operator_file_path(operator, self.working_dir())
            .ok_or_else(|| RuntimeError::UnknownOperator(operator.to_string()))?;
        self.read_operator_def(&def_file, &mut Vec::new())
    }

    /// Read a definition file and run the full build pipeline on it.
    pub fn build_and_compile_file(
        &self,
        def_file: &Path,
        generics: &Generics,
        properties: &Properties,
    ) -> Result<Arc<Operator>> {
        let mut path = if def_file.is_absolute() {
            def_file.to_path_buf()
        } else {
            self.working_dir().join(def_file)
        };
        if path.extension().is_none() {
            path = Self::file_with_ending(&path)
                .ok_or_else(|| RuntimeError::UnknownOperator(def_file.display().to_string()))?;
        }

        let def = self.read_operator_def(&path, &mut Vec::new())?;
        build_and_compile(def, generics, properties)
    }
}
