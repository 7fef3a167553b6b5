use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use careers_core::{Category, EnrichmentStatus, PageviewWindow, PeriodCount, ReviewStatus};
use careers_sources::{CandidateRow, DiscoveryError, OccupationGraph, PageviewSource};
use careers_storage::{CareerStore, FetchError};
use careers_sync::{CareerPipeline, PipelineConfig, Taxonomy};
use chrono::NaiveDate;

struct FixedGraph {
    rows: Vec<CandidateRow>,
}

#[async_trait]
impl OccupationGraph for FixedGraph {
    async fn occupation_candidates(
        &self,
        _class_ids: &[String],
    ) -> Result<Vec<CandidateRow>, DiscoveryError> {
        Ok(self.rows.clone())
    }
}

/// Pageview source with one redirect and a set of titles that fail until cleared.
struct ScriptedViews {
    redirects: HashMap<String, String>,
    monthly: HashMap<String, Vec<PeriodCount>>,
    failing: Mutex<HashSet<String>>,
}

impl ScriptedViews {
    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }
}

#[async_trait]
impl PageviewSource for ScriptedViews {
    async fn resolve_title(&self, title: &str) -> Result<String, FetchError> {
        Ok(self
            .redirects
            .get(title)
            .cloned()
            .unwrap_or_else(|| title.to_string()))
    }

    async fn monthly_views(
        &self,
        title: &str,
        _window: &PageviewWindow,
    ) -> Result<Vec<PeriodCount>, FetchError> {
        if self.failing.lock().unwrap().contains(title) {
            return Err(FetchError::HttpStatus {
                status: 503,
                url: format!("https://wikimedia.test/{title}"),
            });
        }
        Ok(self.monthly.get(title).cloned().unwrap_or_default())
    }
}

fn row(entity: &str, label: &str, type_id: &str, article: &str) -> CandidateRow {
    CandidateRow {
        entity_id: entity.to_string(),
        label: label.to_string(),
        type_id: type_id.to_string(),
        article_url: format!("https://en.wikipedia.org/wiki/{article}"),
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn window() -> PageviewWindow {
    PageviewWindow {
        start: date(2024, 1, 1),
        end: date(2024, 12, 31),
    }
}

fn candidates() -> Vec<CandidateRow> {
    vec![
        row("Q100", "registered nurse", "Q12737077", "Registered_nurse"),
        row("Q100", "registered nurse", "Q28640", "Registered_nurse"),
        row("Q200", "plumber", "Q192581", "Plumber"),
        row("Q300", "Eiffel Tower", "Q12518", "Eiffel_Tower"),
    ]
}

fn period(start: NaiveDate, views: u64) -> PeriodCount {
    PeriodCount {
        period_start: start,
        views,
    }
}

fn scripted_views() -> ScriptedViews {
    ScriptedViews {
        redirects: HashMap::from([("Registered nurse".to_string(), "Nurse".to_string())]),
        monthly: HashMap::from([
            (
                "Nurse".to_string(),
                vec![
                    period(date(2024, 11, 1), 3050),
                    period(date(2024, 12, 1), 3050),
                ],
            ),
            (
                "Registered nurse".to_string(),
                vec![period(date(2024, 1, 1), 1)],
            ),
            (
                "Plumber".to_string(),
                vec![period(date(2024, 1, 1), 36_600)],
            ),
        ]),
        failing: Mutex::new(HashSet::from(["Plumber".to_string()])),
    }
}

fn pipeline_with(store: CareerStore, views: Arc<ScriptedViews>) -> CareerPipeline {
    CareerPipeline::with_sources(
        PipelineConfig {
            concurrency: 2,
            ..Default::default()
        },
        store,
        Taxonomy::builtin(),
        Arc::new(FixedGraph { rows: candidates() }),
        views,
    )
    .with_window(window())
}

#[tokio::test]
async fn failure_then_resume_completes_every_career_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = CareerStore::open(dir.path().join("careers.db")).await.unwrap();
    let views = Arc::new(scripted_views());
    let pipeline = pipeline_with(store, Arc::clone(&views));

    let first = pipeline.discover_and_enrich(None).await.unwrap();
    let discovery = first.discovery.unwrap();
    assert_eq!(discovery.candidate_entities, 3);
    assert_eq!(discovery.accepted, 2);
    assert_eq!(discovery.rejected_unlisted, 1);
    assert_eq!(first.upsert.inserted, 2);
    assert_eq!(first.enrichment.completed, 1);
    assert_eq!(first.enrichment.failed, 1);
    assert_eq!(first.enrichment.redirected, 1);

    let store = pipeline.store();
    let nurse = store.get("Q100").await.unwrap().unwrap();
    assert_eq!(nurse.category, Category::Profession);
    assert_eq!(nurse.enrichment_status, EnrichmentStatus::Complete);
    assert_eq!(nurse.resolved_title.as_deref(), Some("Nurse"));
    assert_eq!(nurse.pageview_total, Some(6100));
    assert_eq!(nurse.pageview_days, Some(61));
    assert_eq!(nurse.pageview_daily_avg, Some(100.0));

    let plumber = store.get("Q200").await.unwrap().unwrap();
    assert_eq!(plumber.category, Category::Job);
    assert_eq!(plumber.enrichment_status, EnrichmentStatus::Failed);
    assert!(plumber.last_error.as_deref().unwrap().contains("503"));
    assert!(store.get("Q300").await.unwrap().is_none());

    views.heal();
    let resumed = pipeline.resume().await.unwrap();
    assert_eq!(resumed.requeued, 1);
    assert_eq!(resumed.enrichment.claimed, 1);
    assert_eq!(resumed.enrichment.completed, 1);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_careers, 2);
    assert_eq!(stats.count_for(EnrichmentStatus::Complete), 2);
    assert_eq!(stats.count_for(EnrichmentStatus::InProgress), 0);
    assert_eq!(stats.resumable(), 0);

    let plumber = store.get("Q200").await.unwrap().unwrap();
    assert_eq!(plumber.enrichment_attempts, 2);
    assert_eq!(plumber.last_error, None);
    assert_eq!(plumber.pageview_daily_avg, Some(100.0));

    let nurse_after = store.get("Q100").await.unwrap().unwrap();
    assert_eq!(nurse_after, nurse);

    let ranked = store.top(20).await.unwrap();
    let names = ranked.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["plumber", "registered nurse"]);
}

#[tokio::test]
async fn repeated_discovery_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = CareerStore::open(dir.path().join("careers.db")).await.unwrap();
    let views = Arc::new(scripted_views());
    let pipeline = pipeline_with(store, Arc::clone(&views));

    pipeline.discover_and_enrich(None).await.unwrap();
    let before = pipeline.store().all_ranked().await.unwrap();
    pipeline
        .store()
        .update_review("Q100", ReviewStatus::Resolved, Some("reviewer"), Some("looks fine"))
        .await
        .unwrap();

    let second = pipeline.discover_and_enrich(None).await.unwrap();
    assert_eq!(second.upsert.inserted, 0);
    assert_eq!(second.upsert.unchanged, 2);
    assert_eq!(second.enrichment.claimed, 0);

    let after = pipeline.store().all_ranked().await.unwrap();
    assert_eq!(after.len(), before.len());
    for (b, a) in before.iter().zip(&after) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.enrichment_status, b.enrichment_status);
    }
    let nurse = pipeline.store().get("Q100").await.unwrap().unwrap();
    assert_eq!(nurse.review_status, ReviewStatus::Resolved);
    assert_eq!(nurse.notes.as_deref(), Some("looks fine"));
}

#[tokio::test]
async fn interrupted_run_is_picked_up_by_the_next_one() {
    let dir = tempfile::tempdir().unwrap();
    let store = CareerStore::open(dir.path().join("careers.db")).await.unwrap();
    let views = Arc::new(scripted_views());
    views.heal();
    let pipeline = pipeline_with(store, Arc::clone(&views));

    let graph = FixedGraph { rows: candidates() };
    let discovered = careers_sync::discover(&graph, &Taxonomy::builtin(), None)
        .await
        .unwrap();
    pipeline.store().upsert_careers(&discovered.careers).await.unwrap();
    let stranded = pipeline.store().claim_pending(None).await.unwrap();
    assert_eq!(stranded.len(), 2);

    let resumed = pipeline.resume().await.unwrap();
    assert_eq!(resumed.stale_reset, 2);
    assert_eq!(resumed.enrichment.completed, 2);
    assert_eq!(
        pipeline.store().stats().await.unwrap().count_for(EnrichmentStatus::Complete),
        2
    );
}
