//! Bounded-concurrency pageview enrichment of claimed careers.

use std::sync::Arc;

use anyhow::{Context, Result};
use careers_core::{summarize_pageviews, Career, PageviewSummary, PageviewWindow};
use careers_sources::{article_title_from_url, PageviewSource};
use careers_storage::{CareerStore, FetchError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("no article title in reference url {0}")]
    MissingTitle(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone, Copy)]
pub struct EnrichmentSettings {
    pub concurrency: usize,
    pub window: PageviewWindow,
    pub progress_every: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub redirected: usize,
    /// Tasks that died before reporting; their rows stay in_progress until the next run.
    pub abandoned: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enriched {
    pub requested_title: String,
    pub resolved_title: String,
    pub summary: PageviewSummary,
}

impl Enriched {
    pub fn redirected(&self) -> bool {
        self.requested_title != self.resolved_title
    }
}

/// Resolve the article title through at most one redirect and sum the
/// canonical title's pageviews over `window`.
pub async fn enrich_career(
    source: &dyn PageviewSource,
    career: &Career,
    window: &PageviewWindow,
) -> Result<Enriched, EnrichmentError> {
    let requested_title = article_title_from_url(&career.source_url)
        .ok_or_else(|| EnrichmentError::MissingTitle(career.source_url.clone()))?;
    let resolved_title = source.resolve_title(&requested_title).await?;
    let periods = source.monthly_views(&resolved_title, window).await?;
    Ok(Enriched {
        summary: summarize_pageviews(window, &periods),
        requested_title,
        resolved_title,
    })
}

type TaskOutput = (String, Result<Enriched, EnrichmentError>);

/// Enrich every claimed career with at most `settings.concurrency` in flight.
/// Results are written to the store by this task alone, as they arrive.
pub async fn enrich_claimed(
    store: &CareerStore,
    source: Arc<dyn PageviewSource>,
    claimed: Vec<Career>,
    settings: &EnrichmentSettings,
) -> Result<EnrichmentReport> {
    let mut report = EnrichmentReport {
        claimed: claimed.len(),
        ..Default::default()
    };
    if claimed.is_empty() {
        return Ok(report);
    }

    let limit = Arc::new(Semaphore::new(settings.concurrency.max(1)));
    let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
    let window = settings.window;

    for career in claimed {
        let permit = match Arc::clone(&limit).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                if let Some(joined) = tasks.join_next().await {
                    persist(store, joined, &mut report, settings.progress_every).await?;
                }
                Arc::clone(&limit)
                    .acquire_owned()
                    .await
                    .context("enrichment limiter closed")?
            }
        };
        let source = Arc::clone(&source);
        tasks.spawn(async move {
            let _permit = permit;
            let outcome = enrich_career(source.as_ref(), &career, &window).await;
            (career.id, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        persist(store, joined, &mut report, settings.progress_every).await?;
    }

    info!(
        claimed = report.claimed,
        completed = report.completed,
        failed = report.failed,
        redirected = report.redirected,
        "enrichment finished"
    );
    Ok(report)
}

async fn persist(
    store: &CareerStore,
    joined: Result<TaskOutput, JoinError>,
    report: &mut EnrichmentReport,
    progress_every: usize,
) -> Result<()> {
    let (id, outcome) = match joined {
        Ok(output) => output,
        Err(err) => {
            error!(error = %err, "enrichment task died; its career stays in_progress");
            report.abandoned += 1;
            return Ok(());
        }
    };

    match outcome {
        Ok(enriched) => {
            let written = store
                .record_pageviews(&id, &enriched.resolved_title, &enriched.summary)
                .await
                .with_context(|| format!("recording pageviews for {id}"))?;
            if written {
                report.completed += 1;
                if enriched.redirected() {
                    report.redirected += 1;
                }
                debug!(
                    %id,
                    title = %enriched.resolved_title,
                    avg = enriched.summary.daily_avg,
                    "enriched"
                );
            } else {
                warn!(%id, "career left in_progress before its pageviews were recorded");
            }
        }
        Err(err) => {
            warn!(%id, error = %err, "pageview enrichment failed");
            store
                .record_failure(&id, &err.to_string())
                .await
                .with_context(|| format!("recording failure for {id}"))?;
            report.failed += 1;
        }
    }

    let done = report.completed + report.failed;
    if progress_every > 0 && done % progress_every == 0 {
        info!(done, total = report.claimed, "enrichment progress");
    }
    Ok(())
}
