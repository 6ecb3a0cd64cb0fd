use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::workflow::workflow_node::SharedResourcePath;
use crate::error::{Error, Result};

/// Per-resource table `namespace -> uuid -> absolute path`, read from one
/// administrator-supplied file per namespace.
#[derive(Debug, Clone, Default)]
pub struct TranslationTable {
    namespaces: HashMap<String, HashMap<String, PathBuf>>,
}

impl TranslationTable {
    /// Loads every translation file. A file that cannot be read is logged and
    /// leaves its namespace untranslated.
    pub fn load(files: &HashMap<String, PathBuf>) -> Self {
        let mut table = TranslationTable::default();
        for (namespace, path) in files {
            match fs::read_to_string(path) {
                Ok(content) => table.add_namespace(namespace, &content),
                Err(e) => log::warn!("Translation file '{}' for namespace '{}' not loaded: {}", path.display(), namespace, e),
            }
        }
        table
    }

    /// Parses lines of the form `uuid<whitespace>absolute-path`. Blank and
    /// malformed lines are skipped.
    pub fn add_namespace(&mut self, namespace: &str, content: &str) {
        let entries = self.namespaces.entry(namespace.to_string()).or_default();
        for line in content.lines() {
            let line = line.trim();
            let Some((uuid, path)) = line.split_once(char::is_whitespace) else {
                if !line.is_empty() {
                    log::debug!("Ignoring malformed translation line in '{}': {}", namespace, line);
                }
                continue;
            };
            let path = path.trim();
            if path.is_empty() {
                continue;
            }
            entries.insert(uuid.to_string(), PathBuf::from(path));
        }
        log::info!("Namespace '{}': {} translation(s) loaded", namespace, entries.len());
    }

    pub fn resolve(&self, shared: &SharedResourcePath) -> Result<PathBuf> {
        let base = self
            .namespaces
            .get(&shared.namespace)
            .and_then(|entries| entries.get(&shared.uuid))
            .ok_or_else(|| Error::ValidationError(format!("no translation for '{}' on this resource", shared)))?;

        Ok(join(base, &shared.relative_path))
    }
}

fn join(base: &Path, relative_path: &str) -> PathBuf {
    if relative_path.is_empty() { base.to_path_buf() } else { base.join(relative_path.trim_start_matches('/')) }
}
