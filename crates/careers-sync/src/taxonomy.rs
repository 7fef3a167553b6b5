//! Ordered allow-list of taxonomy classes and the category each maps to.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use careers_core::Category;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("reading taxonomy file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing taxonomy file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("taxonomy allow-list is empty")]
    Empty,
    #[error("`{0}` is not a Wikidata class id (expected Q followed by digits)")]
    InvalidClassId(String),
    #[error("class {0} is listed more than once")]
    DuplicateClass(String),
    #[error("unsupported taxonomy file version {found} (expected {})", TAXONOMY_VERSION)]
    UnsupportedVersion { found: u32 },
    #[error("serializing taxonomy: {0}")]
    Serialize(#[source] serde_yaml::Error),
    #[error("writing taxonomy file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// File format version this build reads and writes.
pub const TAXONOMY_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    pub class_id: String,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaxonomyFile {
    version: u32,
    classes: Vec<TaxonomyEntry>,
}

/// Result of a successful classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification<'a> {
    pub category: Category,
    pub class_id: &'a str,
    /// Position in the allow-list; 0 is the highest priority.
    pub priority: usize,
}

/// Allow-list in priority order. When an entity declares several listed
/// classes, the one listed first decides its category.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    entries: Vec<TaxonomyEntry>,
    priority: HashMap<String, usize>,
}

impl Taxonomy {
    pub fn new(entries: Vec<TaxonomyEntry>) -> Result<Self, TaxonomyError> {
        if entries.is_empty() {
            return Err(TaxonomyError::Empty);
        }
        let mut priority = HashMap::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            if !is_class_id(&entry.class_id) {
                return Err(TaxonomyError::InvalidClassId(entry.class_id.clone()));
            }
            if priority.insert(entry.class_id.clone(), idx).is_some() {
                return Err(TaxonomyError::DuplicateClass(entry.class_id.clone()));
            }
        }
        Ok(Self { entries, priority })
    }

    /// The base occupation classes: profession, occupation, job, position.
    pub fn builtin() -> Self {
        let entries = [
            ("Q28640", Category::Profession, "profession"),
            ("Q12737077", Category::Occupation, "occupation"),
            ("Q192581", Category::Job, "job"),
            ("Q4164871", Category::Position, "position"),
            ("Q136649946", Category::Position, "position (office)"),
        ]
        .into_iter()
        .map(|(class_id, category, label)| TaxonomyEntry {
            class_id: class_id.to_string(),
            category,
            label: Some(label.to_string()),
        })
        .collect::<Vec<_>>();
        let priority = entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.class_id.clone(), idx))
            .collect();
        Self { entries, priority }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, TaxonomyError> {
        let file: TaxonomyFile = serde_yaml::from_str(text)?;
        if file.version != TAXONOMY_VERSION {
            return Err(TaxonomyError::UnsupportedVersion {
                found: file.version,
            });
        }
        Self::new(file.classes)
    }

    pub fn to_yaml_string(&self) -> Result<String, TaxonomyError> {
        serde_yaml::to_string(&TaxonomyFile {
            version: TAXONOMY_VERSION,
            classes: self.entries.clone(),
        })
        .map_err(TaxonomyError::Serialize)
    }

    /// Write the allow-list in priority order, replacing `path`.
    pub fn write(&self, path: &Path) -> Result<(), TaxonomyError> {
        let text = self.to_yaml_string()?;
        std::fs::write(path, text).map_err(|source| TaxonomyError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, TaxonomyError> {
        let text = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Load `path` when it exists, otherwise fall back to [`Taxonomy::builtin`].
    pub fn load_or_builtin(path: &Path) -> Result<Self, TaxonomyError> {
        if path.exists() {
            Self::load(path)
        } else {
            warn!(
                path = %path.display(),
                "taxonomy file not found; using built-in base classes"
            );
            Ok(Self::builtin())
        }
    }

    pub fn entries(&self) -> &[TaxonomyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Class ids in priority order.
    pub fn class_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.class_id.clone()).collect()
    }

    pub fn classify<'t, I, S>(&'t self, declared_types: I) -> Option<Classification<'t>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        declared_types
            .into_iter()
            .filter_map(|t| self.priority.get(t.as_ref()).copied())
            .min()
            .map(|idx| {
                let entry = &self.entries[idx];
                Classification {
                    category: entry.category,
                    class_id: entry.class_id.as_str(),
                    priority: idx,
                }
            })
    }
}

pub fn is_class_id(candidate: &str) -> bool {
    candidate
        .strip_prefix('Q')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}
