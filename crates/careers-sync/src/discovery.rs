//! Turn flat graph-query tuples into classified careers.

use std::collections::{BTreeMap, BTreeSet};

use careers_core::{qid_sort_key, DiscoveredCareer};
use careers_sources::{CandidateRow, DiscoveryError, OccupationGraph};
use serde::Serialize;
use tracing::{debug, info};

use crate::taxonomy::{is_class_id, Taxonomy};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryStats {
    pub candidate_rows: usize,
    pub candidate_entities: usize,
    pub accepted: usize,
    pub rejected_unlisted: usize,
    pub skipped_unlabeled: usize,
    pub truncated: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Accepted careers in numeric id order (Q2 before Q10).
    pub careers: Vec<DiscoveredCareer>,
    pub stats: DiscoveryStats,
}

#[derive(Debug, Default)]
struct EntityGroup {
    label: String,
    article_url: String,
    types: BTreeSet<String>,
}

/// Query the graph for every allow-listed class and reconcile the result.
pub async fn discover(
    graph: &dyn OccupationGraph,
    taxonomy: &Taxonomy,
    limit: Option<usize>,
) -> Result<Discovery, DiscoveryError> {
    let rows = graph.occupation_candidates(&taxonomy.class_ids()).await?;
    let discovery = reconcile_candidates(rows, taxonomy, limit);
    info!(
        rows = discovery.stats.candidate_rows,
        entities = discovery.stats.candidate_entities,
        accepted = discovery.stats.accepted,
        rejected = discovery.stats.rejected_unlisted,
        unlabeled = discovery.stats.skipped_unlabeled,
        "discovery reconciled"
    );
    Ok(discovery)
}

/// Group rows by entity, drop entities without a human-readable label,
/// classify by the highest-priority declared type and apply `limit` in
/// numeric id order.
pub fn reconcile_candidates(
    rows: Vec<CandidateRow>,
    taxonomy: &Taxonomy,
    limit: Option<usize>,
) -> Discovery {
    let mut stats = DiscoveryStats {
        candidate_rows: rows.len(),
        ..Default::default()
    };

    let mut groups: BTreeMap<String, EntityGroup> = BTreeMap::new();
    for row in rows {
        let group = groups.entry(row.entity_id).or_default();
        if group.label.is_empty() {
            group.label = row.label.trim().to_string();
        }
        if group.article_url.is_empty() {
            group.article_url = row.article_url;
        }
        group.types.insert(row.type_id);
    }
    stats.candidate_entities = groups.len();

    let mut careers = Vec::new();
    for (id, group) in groups {
        if group.label.is_empty() || is_class_id(&group.label) || group.article_url.is_empty() {
            debug!(%id, "skipping entity without label or article");
            stats.skipped_unlabeled += 1;
            continue;
        }
        let Some(classification) = taxonomy.classify(&group.types) else {
            stats.rejected_unlisted += 1;
            continue;
        };
        careers.push(DiscoveredCareer {
            id,
            name: group.label,
            category: classification.category,
            source_url: group.article_url,
        });
    }

    careers.sort_by(|a, b| qid_sort_key(&a.id).cmp(&qid_sort_key(&b.id)));
    if let Some(limit) = limit {
        stats.truncated = careers.len().saturating_sub(limit);
        careers.truncate(limit);
    }
    stats.accepted = careers.len();

    Discovery { careers, stats }
}
