use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A verified ingredient-to-catalog mapping. The curated set is a trust
/// anchor: lookups use only conservative key variants, never probabilistic
/// matching.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MappingEntry {
    pub fdc_id: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub notes: String,
}

/// Curated mappings loaded once from JSON; read-only at runtime. The keys are
/// lowercased, trimmed ingredient names.
pub struct MappingStore {
    path: PathBuf,
    mappings: HashMap<String, MappingEntry>,
}

impl MappingStore {
    pub fn load(path: &Path) -> Self {
        let mappings = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, MappingEntry>>(&content) {
                Ok(mappings) => {
                    println!(
                        "Loaded {} curated ingredient mappings from {:?}",
                        mappings.len(),
                        path
                    );
                    mappings
                }
                Err(e) => {
                    eprintln!("Warning: Could not load mappings from {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(_) => {
                println!("Note: No curated mapping file found. Will use search for all ingredients.");
                HashMap::new()
            }
        };

        Self {
            path: path.to_path_buf(),
            mappings,
        }
    }

    /// Look up an ingredient, tolerating plural/singular and separator
    /// variants of the key.
    pub fn lookup(&self, ingredient: &str) -> Option<&MappingEntry> {
        self.fuzzy_key(ingredient)
            .and_then(|key| self.mappings.get(&key))
    }

    fn fuzzy_key(&self, ingredient: &str) -> Option<String> {
        let normalized = ingredient.to_lowercase().trim().to_string();

        if self.mappings.contains_key(&normalized) {
            return Some(normalized);
        }

        // Plural/singular adjustments.
        if let Some(stem) = normalized.strip_suffix('s') {
            if self.mappings.contains_key(stem) {
                return Some(stem.to_string());
            }
        } else {
            let plural = format!("{}s", normalized);
            if self.mappings.contains_key(&plural) {
                return Some(plural);
            }
            let plural_es = format!("{}es", normalized);
            if self.mappings.contains_key(&plural_es) {
                return Some(plural_es);
            }
        }
        if let Some(stem) = normalized.strip_suffix("ies") {
            let singular = format!("{}y", stem);
            if self.mappings.contains_key(&singular) {
                return Some(singular);
            }
        }
        if let Some(stem) = normalized.strip_suffix('y') {
            let plural = format!("{}ies", stem);
            if self.mappings.contains_key(&plural) {
                return Some(plural);
            }
        }

        // Separator equivalences: space <-> underscore <-> hyphen.
        let variations = [
            normalized.replace(' ', "_"),
            normalized.replace('_', " "),
            normalized.replace('-', " "),
            normalized.replace(' ', "-"),
        ];
        variations
            .into_iter()
            .find(|v| self.mappings.contains_key(v))
    }

    /// Single-writer path used by curation tooling: insert one entry and
    /// rewrite the whole file.
    pub fn save(&mut self, ingredient: &str, entry: MappingEntry) -> Result<()> {
        let key = ingredient.to_lowercase().trim().to_string();
        self.mappings.insert(key, entry);
        let json = serde_json::to_string_pretty(&self.mappings)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write mappings to {:?}", self.path))
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
