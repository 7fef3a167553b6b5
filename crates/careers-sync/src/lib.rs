//! Pipeline orchestration: discovery, taxonomy filtering, ledger updates and
//! pageview enrichment.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use careers_core::PageviewWindow;
use careers_sources::{OccupationGraph, PageviewSource, WikidataGraph, WikimediaPageviews};
use careers_storage::{CareerStore, HttpFetcher, UpsertOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod discovery;
mod enrichment;
mod export;
mod refresh;
mod taxonomy;

pub use config::PipelineConfig;
pub use discovery::{discover, reconcile_candidates, Discovery, DiscoveryStats};
pub use enrichment::{
    enrich_career, enrich_claimed, Enriched, EnrichmentError, EnrichmentReport, EnrichmentSettings,
};
pub use export::{export_snapshot, ExportSummary, SnapshotFile, SnapshotManifest};
pub use refresh::{
    default_exclusions, refresh_taxonomy, RefreshError, RefreshStats, RefreshedTaxonomy,
    EXCLUDED_BRANCHES,
};
pub use taxonomy::{
    is_class_id, Classification, Taxonomy, TaxonomyEntry, TaxonomyError, TAXONOMY_VERSION,
};

pub const CRATE_NAME: &str = "careers-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DiscoverAndEnrich,
    Resume,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stale_reset: u64,
    pub requeued: u64,
    pub discovery: Option<DiscoveryStats>,
    /// Set when discovery failed; the run still enriched pending rows.
    pub discovery_error: Option<String>,
    pub upsert: UpsertOutcome,
    pub enrichment: EnrichmentReport,
}

impl RunSummary {
    fn begin(run_id: Uuid, mode: RunMode) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            mode,
            started_at: now,
            finished_at: now,
            stale_reset: 0,
            requeued: 0,
            discovery: None,
            discovery_error: None,
            upsert: UpsertOutcome::default(),
            enrichment: EnrichmentReport::default(),
        }
    }
}

pub struct CareerPipeline {
    config: PipelineConfig,
    run_id: Uuid,
    store: CareerStore,
    taxonomy: Taxonomy,
    graph: Arc<dyn OccupationGraph>,
    pageviews: Arc<dyn PageviewSource>,
    window: Option<PageviewWindow>,
}

impl CareerPipeline {
    /// Open the store, load the allow-list and build the live Wikidata and
    /// Wikimedia sources around one HTTP client for this run.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let taxonomy = Taxonomy::load_or_builtin(&config.taxonomy_path)
            .with_context(|| format!("loading taxonomy {}", config.taxonomy_path.display()))?;
        let store = CareerStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening career store {}", config.database_url))?;

        let run_id = Uuid::new_v4();
        let http = Arc::new(HttpFetcher::for_run(run_id, config.http_client_config())?);
        let graph = Arc::new(WikidataGraph::new(Arc::clone(&http), config.wikidata_config()));
        let pageviews = Arc::new(WikimediaPageviews::new(http, config.wikimedia_config()));

        Ok(Self {
            config,
            run_id,
            store,
            taxonomy,
            graph,
            pageviews,
            window: None,
        })
    }

    pub fn with_sources(
        config: PipelineConfig,
        store: CareerStore,
        taxonomy: Taxonomy,
        graph: Arc<dyn OccupationGraph>,
        pageviews: Arc<dyn PageviewSource>,
    ) -> Self {
        Self {
            config,
            run_id: Uuid::new_v4(),
            store,
            taxonomy,
            graph,
            pageviews,
            window: None,
        }
    }

    /// Pin the pageview window instead of deriving it from today's date.
    pub fn with_window(mut self, window: PageviewWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn store(&self) -> &CareerStore {
        &self.store
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    fn window(&self) -> Result<PageviewWindow> {
        match self.window {
            Some(window) => Ok(window),
            None => PageviewWindow::trailing_months(
                Utc::now().date_naive(),
                self.config.pageview_months,
            )
            .context("computing pageview window"),
        }
    }

    /// Discover, upsert, then enrich pending careers. A failed discovery is
    /// logged and leaves the ledger untouched; enrichment still runs.
    pub async fn discover_and_enrich(&self, limit: Option<usize>) -> Result<RunSummary> {
        let span = info_span!("discover_and_enrich", run_id = %self.run_id);
        self.discover_and_enrich_inner(limit).instrument(span).await
    }

    /// Retry everything not yet complete: stale in_progress and failed rows
    /// go back to pending and are enriched again.
    pub async fn resume(&self) -> Result<RunSummary> {
        let span = info_span!("resume", run_id = %self.run_id);
        self.resume_inner().instrument(span).await
    }

    async fn discover_and_enrich_inner(&self, limit: Option<usize>) -> Result<RunSummary> {
        let mut summary = RunSummary::begin(self.run_id, RunMode::DiscoverAndEnrich);
        summary.stale_reset = self.store.reset_stale_in_progress().await?;

        match discover(self.graph.as_ref(), &self.taxonomy, limit).await {
            Ok(found) => {
                summary.upsert = self
                    .store
                    .upsert_careers(&found.careers)
                    .await
                    .context("persisting discovered careers")?;
                summary.discovery = Some(found.stats);
                info!(
                    inserted = summary.upsert.inserted,
                    updated = summary.upsert.updated,
                    unchanged = summary.upsert.unchanged,
                    "careers upserted"
                );
            }
            Err(err) => {
                warn!(error = %err, "discovery failed; enriching existing pending careers");
                summary.discovery_error = Some(err.to_string());
            }
        }

        summary.enrichment = self.enrich_pending(limit).await?;
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    async fn resume_inner(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::begin(self.run_id, RunMode::Resume);
        summary.stale_reset = self.store.reset_stale_in_progress().await?;
        summary.requeued = self.store.requeue_failed().await?;
        info!(stale = summary.stale_reset, requeued = summary.requeued, "resuming");
        summary.enrichment = self.enrich_pending(None).await?;
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    async fn enrich_pending(&self, limit: Option<usize>) -> Result<EnrichmentReport> {
        let settings = EnrichmentSettings {
            concurrency: self.config.concurrency,
            window: self.window()?,
            progress_every: self.config.progress_every,
        };
        let claimed = self
            .store
            .claim_pending(limit)
            .await
            .context("claiming pending careers")?;
        info!(
            claimed = claimed.len(),
            start = %settings.window.start,
            end = %settings.window.end,
            "enriching pageviews"
        );
        enrich_claimed(&self.store, Arc::clone(&self.pageviews), claimed, &settings).await
    }
}

pub async fn run_discover_and_enrich_from_env(limit: Option<usize>) -> Result<RunSummary> {
    let pipeline = CareerPipeline::from_config(PipelineConfig::from_env()?).await?;
    pipeline.discover_and_enrich(limit).await
}

pub async fn run_resume_from_env() -> Result<RunSummary> {
    let pipeline = CareerPipeline::from_config(PipelineConfig::from_env()?).await?;
    pipeline.resume().await
}

#[derive(Debug, Clone, Serialize)]
pub struct TaxonomyRefreshSummary {
    pub path: PathBuf,
    pub classes: usize,
    pub stats: RefreshStats,
}

/// Regenerate the allow-list from the live class hierarchy under the
/// built-in base classes and write it to `out`. The file is only replaced
/// once every base class query succeeded.
pub async fn refresh_taxonomy_file(
    config: &PipelineConfig,
    out: &Path,
) -> Result<TaxonomyRefreshSummary> {
    let run_id = Uuid::new_v4();
    let span = info_span!("refresh_taxonomy", run_id = %run_id);
    refresh_taxonomy_file_inner(run_id, config, out)
        .instrument(span)
        .await
}

async fn refresh_taxonomy_file_inner(
    run_id: Uuid,
    config: &PipelineConfig,
    out: &Path,
) -> Result<TaxonomyRefreshSummary> {
    let http = Arc::new(HttpFetcher::for_run(run_id, config.http_client_config())?);
    let graph = WikidataGraph::new(http, config.wikidata_config());
    let refreshed = refresh_taxonomy(&graph, &Taxonomy::builtin(), &default_exclusions())
        .await
        .context("querying the class hierarchy")?;
    refreshed.taxonomy.write(out)?;
    info!(
        path = %out.display(),
        classes = refreshed.taxonomy.len(),
        "taxonomy written"
    );
    Ok(TaxonomyRefreshSummary {
        path: out.to_path_buf(),
        classes: refreshed.taxonomy.len(),
        stats: refreshed.stats,
    })
}
