//! Regenerate the allow-list by walking the class hierarchy under the base
//! occupation classes.

use std::collections::HashSet;

use careers_core::qid_sort_key;
use careers_sources::{ClassHierarchy, DiscoveryError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::taxonomy::{is_class_id, Taxonomy, TaxonomyEntry, TaxonomyError};

/// Branches that reach the occupation classes through noisy P279 paths:
/// automobile manufacturer and city.
pub const EXCLUDED_BRANCHES: [&str; 2] = ["Q786820", "Q515"];

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Query(#[from] DiscoveryError),
    #[error(transparent)]
    Taxonomy(#[from] TaxonomyError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshStats {
    pub base_classes: usize,
    pub generated: usize,
    /// Subclasses reachable from more than one base; kept under the first.
    pub shared: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone)]
pub struct RefreshedTaxonomy {
    pub taxonomy: Taxonomy,
    pub stats: RefreshStats,
}

/// Base classes keep their order at the top. Generated classes follow,
/// grouped by the base they were found under (in base priority order) and
/// sorted by numeric id within a group, so they inherit that base's category.
pub async fn refresh_taxonomy(
    hierarchy: &dyn ClassHierarchy,
    base: &Taxonomy,
    excluded: &[String],
) -> Result<RefreshedTaxonomy, RefreshError> {
    let mut entries = base.entries().to_vec();
    let mut seen = entries
        .iter()
        .map(|e| e.class_id.clone())
        .collect::<HashSet<_>>();
    let mut stats = RefreshStats {
        base_classes: entries.len(),
        ..RefreshStats::default()
    };

    for parent in base.entries() {
        let mut found = hierarchy
            .subclasses_with_articles(&parent.class_id, excluded)
            .await?;
        let before = found.len();
        found.retain(|id| is_class_id(id));
        if found.len() < before {
            warn!(
                base = %parent.class_id,
                dropped = before - found.len(),
                "ignoring non-class ids in hierarchy results"
            );
            stats.malformed += before - found.len();
        }
        found.sort_by(|a, b| qid_sort_key(a).cmp(&qid_sort_key(b)));
        found.dedup();

        for class_id in found {
            if seen.contains(&class_id) {
                if !base.entries().iter().any(|e| e.class_id == class_id) {
                    stats.shared += 1;
                }
                continue;
            }
            seen.insert(class_id.clone());
            entries.push(TaxonomyEntry {
                class_id,
                category: parent.category,
                label: None,
            });
            stats.generated += 1;
        }
    }

    info!(
        base_classes = stats.base_classes,
        generated = stats.generated,
        shared = stats.shared,
        "taxonomy refreshed"
    );
    Ok(RefreshedTaxonomy {
        taxonomy: Taxonomy::new(entries)?,
        stats,
    })
}

pub fn default_exclusions() -> Vec<String> {
    EXCLUDED_BRANCHES.iter().map(|id| id.to_string()).collect()
}
