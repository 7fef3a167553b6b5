//! Upstream service contracts: occupation discovery from the graph endpoint and
//! readership metrics from the pageview API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use careers_core::{PageviewWindow, PeriodCount};
use careers_storage::{FetchError, HttpFetcher};
use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "careers-sources";

pub const WIKIDATA_HOST: &str = "wikidata-sparql";
pub const MEDIAWIKI_HOST: &str = "mediawiki-action";
pub const METRICS_HOST: &str = "wikimedia-metrics";

const WIKIDATA_ENTITY_PREFIX: &str = "http://www.wikidata.org/entity/";

/// One flat tuple of the discovery query: an entity, its label, one declared
/// type and its reference article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRow {
    pub entity_id: String,
    pub label: String,
    pub type_id: String,
    pub article_url: String,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("graph query timed out after {after:?}")]
    QueryTimeout { after: Duration },
    #[error("graph query failed: {0}")]
    QueryError(String),
}

#[async_trait]
pub trait OccupationGraph: Send + Sync {
    /// Entities used as an occupation by some other entity, directly typed as
    /// one of `class_ids`, with an article in the configured language edition.
    async fn occupation_candidates(
        &self,
        class_ids: &[String],
    ) -> Result<Vec<CandidateRow>, DiscoveryError>;
}

#[async_trait]
pub trait ClassHierarchy: Send + Sync {
    /// Transitive subclasses of `base` (including `base` itself) that have at
    /// least one direct instance with an article in the configured language
    /// edition. Classes under any of `excluded` are left out.
    async fn subclasses_with_articles(
        &self,
        base: &str,
        excluded: &[String],
    ) -> Result<Vec<String>, DiscoveryError>;
}

#[async_trait]
pub trait PageviewSource: Send + Sync {
    /// Follow at most one redirect hop and return the canonical title.
    async fn resolve_title(&self, title: &str) -> Result<String, FetchError>;

    /// Monthly user pageviews for `title` inside `window`. Periods the API
    /// has no data for are simply absent.
    async fn monthly_views(
        &self,
        title: &str,
        window: &PageviewWindow,
    ) -> Result<Vec<PeriodCount>, FetchError>;
}

/// Article title from a reference URL: the decoded segment after `/wiki/`,
/// underscores shown as spaces.
pub fn article_title_from_url(url: &str) -> Option<String> {
    let (_, raw) = url.split_once("/wiki/")?;
    let raw = raw.split(['?', '#']).next().unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(raw).ok()?;
    Some(decoded.replace('_', " "))
}

#[derive(Debug, Clone)]
pub struct WikidataConfig {
    pub endpoint: String,
    /// Host of the language edition articles must exist in, e.g. `en.wikipedia.org`.
    pub wiki_project: String,
    pub query_timeout: Duration,
    pub class_batch_size: usize,
}

impl Default for WikidataConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://query.wikidata.org/sparql".to_string(),
            wiki_project: "en.wikipedia.org".to_string(),
            query_timeout: Duration::from_secs(120),
            class_batch_size: 50,
        }
    }
}

impl WikidataConfig {
    pub fn label_language(&self) -> &str {
        self.wiki_project.split('.').next().unwrap_or("en")
    }
}

pub struct WikidataGraph {
    http: Arc<HttpFetcher>,
    config: WikidataConfig,
}

impl WikidataGraph {
    pub fn new(http: Arc<HttpFetcher>, config: WikidataConfig) -> Self {
        Self { http, config }
    }

    /// POST one SPARQL query. `query_timeout` bounds the whole call,
    /// retries and backoff included.
    async fn run_query(&self, query: &str) -> Result<Vec<u8>, DiscoveryError> {
        let after = self.config.query_timeout;
        let form = [("query", query)];
        let request = self.http.post_form(
            WIKIDATA_HOST,
            &self.config.endpoint,
            &form,
            "application/sparql-results+json",
            Some(after),
        );
        let response = match tokio::time::timeout(after, request).await {
            Err(_) => return Err(DiscoveryError::QueryTimeout { after }),
            Ok(Err(err)) if err.is_timeout() => return Err(DiscoveryError::QueryTimeout { after }),
            Ok(Err(err)) => return Err(DiscoveryError::QueryError(err.to_string())),
            Ok(Ok(response)) => response,
        };
        Ok(response.body)
    }
}

#[async_trait]
impl OccupationGraph for WikidataGraph {
    async fn occupation_candidates(
        &self,
        class_ids: &[String],
    ) -> Result<Vec<CandidateRow>, DiscoveryError> {
        let batch_size = self.config.class_batch_size.max(1);
        let total_batches = class_ids.len().div_ceil(batch_size);
        let mut rows = Vec::new();

        for (idx, batch) in class_ids.chunks(batch_size).enumerate() {
            info!(
                batch = idx + 1,
                total_batches,
                classes = batch.len(),
                "querying occupation candidates"
            );
            let query = build_occupation_query(
                batch,
                &self.config.wiki_project,
                self.config.label_language(),
            );
            let batch_rows = parse_sparql_candidates(&self.run_query(&query).await?)?;
            debug!(rows = batch_rows.len(), "batch returned");
            rows.extend(batch_rows);
        }

        Ok(rows)
    }
}

#[async_trait]
impl ClassHierarchy for WikidataGraph {
    async fn subclasses_with_articles(
        &self,
        base: &str,
        excluded: &[String],
    ) -> Result<Vec<String>, DiscoveryError> {
        info!(base, "querying subclass hierarchy");
        let query = build_subclass_query(base, excluded, &self.config.wiki_project);
        let classes = parse_sparql_classes(&self.run_query(&query).await?)?;
        debug!(base, classes = classes.len(), "subclasses returned");
        Ok(classes)
    }
}

/// Inverted discovery query: start from P106 (occupation) usage instead of
/// walking the P279 subclass tree, then keep direct P31 members of the batch.
pub fn build_occupation_query(class_ids: &[String], wiki_project: &str, language: &str) -> String {
    let values = class_ids
        .iter()
        .map(|qid| format!("wd:{qid}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        r#"SELECT DISTINCT ?item ?itemLabel ?class ?article WHERE {{
  VALUES ?class {{ {values} }}
  ?item wdt:P31 ?class .
  FILTER EXISTS {{ ?holder wdt:P106 ?item . }}
  ?article schema:about ?item ;
           schema:isPartOf <https://{wiki_project}/> .
  SERVICE wikibase:label {{
    bd:serviceParam wikibase:language "{language}".
    ?item rdfs:label ?itemLabel .
  }}
}}"#
    )
}

/// Walk P279 from one base class, dropping noisy branches and classes with
/// no instance that has an article.
pub fn build_subclass_query(base: &str, excluded: &[String], wiki_project: &str) -> String {
    let exclusions = excluded
        .iter()
        .map(|qid| format!("  FILTER NOT EXISTS {{ ?class wdt:P279* wd:{qid} . }}\n"))
        .collect::<String>();
    format!(
        r#"SELECT DISTINCT ?class WHERE {{
  ?class wdt:P279* wd:{base} .
{exclusions}  FILTER EXISTS {{
    ?item wdt:P31 ?class .
    ?article schema:about ?item ;
             schema:isPartOf <https://{wiki_project}/> .
  }}
}}"#
    )
}

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    bindings: Vec<HashMap<String, SparqlTerm>>,
}

#[derive(Debug, Deserialize)]
struct SparqlTerm {
    value: String,
}

pub fn parse_sparql_candidates(body: &[u8]) -> Result<Vec<CandidateRow>, DiscoveryError> {
    let response: SparqlResponse = serde_json::from_slice(body)
        .map_err(|err| DiscoveryError::QueryError(format!("malformed SPARQL response: {err}")))?;

    let mut rows = Vec::with_capacity(response.results.bindings.len());
    for binding in response.results.bindings {
        let (Some(item), Some(class), Some(article)) = (
            term(&binding, "item"),
            term(&binding, "class"),
            term(&binding, "article"),
        ) else {
            warn!("skipping SPARQL row without item, class or article");
            continue;
        };
        rows.push(CandidateRow {
            entity_id: entity_id_from_uri(item),
            label: term(&binding, "itemLabel").unwrap_or_default().to_string(),
            type_id: entity_id_from_uri(class),
            article_url: article.to_string(),
        });
    }
    Ok(rows)
}

/// Class ids from the `?class` column, in response order.
pub fn parse_sparql_classes(body: &[u8]) -> Result<Vec<String>, DiscoveryError> {
    let response: SparqlResponse = serde_json::from_slice(body)
        .map_err(|err| DiscoveryError::QueryError(format!("malformed SPARQL response: {err}")))?;
    Ok(response
        .results
        .bindings
        .iter()
        .filter_map(|binding| term(binding, "class"))
        .map(entity_id_from_uri)
        .collect())
}

fn term<'a>(binding: &'a HashMap<String, SparqlTerm>, key: &str) -> Option<&'a str> {
    binding.get(key).map(|t| t.value.as_str())
}

fn entity_id_from_uri(uri: &str) -> String {
    uri.strip_prefix(WIKIDATA_ENTITY_PREFIX)
        .or_else(|| uri.rsplit('/').next())
        .unwrap_or(uri)
        .to_string()
}

#[derive(Debug, Clone)]
pub struct WikimediaConfig {
    pub wiki_project: String,
    pub metrics_base: String,
}

impl Default for WikimediaConfig {
    fn default() -> Self {
        Self {
            wiki_project: "en.wikipedia.org".to_string(),
            metrics_base: "https://wikimedia.org/api/rest_v1/metrics/pageviews".to_string(),
        }
    }
}

impl WikimediaConfig {
    pub fn action_api(&self) -> String {
        format!("https://{}/w/api.php", self.wiki_project)
    }

    /// The metrics API names projects without the TLD, e.g. `en.wikipedia`.
    pub fn metrics_project(&self) -> &str {
        self.wiki_project
            .strip_suffix(".org")
            .unwrap_or(&self.wiki_project)
    }

    pub fn monthly_url(&self, title: &str, window: &PageviewWindow) -> String {
        let encoded = urlencoding::encode(&title.replace(' ', "_")).into_owned();
        format!(
            "{}/per-article/{}/all-access/user/{}/monthly/{}00/{}00",
            self.metrics_base.trim_end_matches('/'),
            self.metrics_project(),
            encoded,
            window.start.format("%Y%m%d"),
            window.end.format("%Y%m%d"),
        )
    }
}

pub struct WikimediaPageviews {
    http: Arc<HttpFetcher>,
    config: WikimediaConfig,
}

impl WikimediaPageviews {
    pub fn new(http: Arc<HttpFetcher>, config: WikimediaConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl PageviewSource for WikimediaPageviews {
    async fn resolve_title(&self, title: &str) -> Result<String, FetchError> {
        let response = self
            .http
            .get(
                MEDIAWIKI_HOST,
                &self.config.action_api(),
                &[
                    ("action", "query"),
                    ("titles", title),
                    ("redirects", "1"),
                    ("format", "json"),
                ],
            )
            .await?;
        let parsed: ActionQueryResponse = response.json()?;
        Ok(resolve_one_hop(title, &parsed))
    }

    async fn monthly_views(
        &self,
        title: &str,
        window: &PageviewWindow,
    ) -> Result<Vec<PeriodCount>, FetchError> {
        let url = self.config.monthly_url(title, window);
        match self.http.get(METRICS_HOST, &url, &[]).await {
            Ok(response) => {
                let parsed: MetricsResponse = response.json()?;
                Ok(periods_from_metrics(&parsed))
            }
            // The metrics API answers 404 for articles without any recorded views.
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionQueryResponse {
    #[serde(default)]
    pub query: Option<ActionQuery>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionQuery {
    #[serde(default)]
    pub normalized: Vec<TitleMapping>,
    #[serde(default)]
    pub redirects: Vec<TitleMapping>,
}

#[derive(Debug, Deserialize)]
pub struct TitleMapping {
    pub from: String,
    pub to: String,
}

/// Apply title normalization, then exactly one redirect hop from the
/// normalized title. Chained redirects beyond the first hop are ignored.
pub fn resolve_one_hop(requested: &str, response: &ActionQueryResponse) -> String {
    let Some(query) = &response.query else {
        return requested.to_string();
    };
    let normalized = query
        .normalized
        .iter()
        .find(|m| m.from == requested)
        .map(|m| m.to.as_str())
        .unwrap_or(requested);
    query
        .redirects
        .iter()
        .find(|m| m.from == normalized)
        .map(|m| m.to.clone())
        .unwrap_or_else(|| normalized.to_string())
}

#[derive(Debug, Deserialize)]
pub struct MetricsResponse {
    #[serde(default)]
    pub items: Vec<MetricsItem>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsItem {
    pub timestamp: String,
    pub views: u64,
}

pub fn periods_from_metrics(response: &MetricsResponse) -> Vec<PeriodCount> {
    response
        .items
        .iter()
        .filter_map(|item| {
            let day = item.timestamp.get(..8)?;
            match NaiveDate::parse_from_str(day, "%Y%m%d") {
                Ok(period_start) => Some(PeriodCount {
                    period_start,
                    views: item.views,
                }),
                Err(_) => {
                    warn!(
                        timestamp = %item.timestamp,
                        "skipping metrics item with bad timestamp"
                    );
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn title_is_decoded_from_article_url() {
        assert_eq!(
            article_title_from_url("https://en.wikipedia.org/wiki/Software_engineer").as_deref(),
            Some("Software engineer")
        );
        assert_eq!(
            article_title_from_url("https://en.wikipedia.org/wiki/Caf%C3%A9_owner#History")
                .as_deref(),
            Some("Café owner")
        );
        assert_eq!(article_title_from_url("https://en.wikipedia.org/"), None);
    }

    #[test]
    fn sparql_bindings_become_flat_candidate_rows() {
        let body = br#"{
          "head": {"vars": ["item", "itemLabel", "class", "article"]},
          "results": {"bindings": [
            {"item": {"type": "uri", "value": "http://www.wikidata.org/entity/Q186360"},
             "itemLabel": {"type": "literal", "value": "nurse"},
             "class": {"type": "uri", "value": "http://www.wikidata.org/entity/Q28640"},
             "article": {"type": "uri", "value": "https://en.wikipedia.org/wiki/Nurse"}},
            {"item": {"type": "uri", "value": "http://www.wikidata.org/entity/Q42"},
             "itemLabel": {"type": "literal", "value": "no article"}}
          ]}
        }"#;
        let rows = parse_sparql_candidates(body).unwrap();
        assert_eq!(
            rows,
            vec![CandidateRow {
                entity_id: "Q186360".into(),
                label: "nurse".into(),
                type_id: "Q28640".into(),
                article_url: "https://en.wikipedia.org/wiki/Nurse".into(),
            }]
        );
    }

    #[test]
    fn malformed_sparql_is_a_query_error() {
        let err = parse_sparql_candidates(b"<html>busy</html>").unwrap_err();
        assert!(matches!(err, DiscoveryError::QueryError(_)));
        let err = parse_sparql_candidates(br#"{"head": {}}"#).unwrap_err();
        assert!(matches!(err, DiscoveryError::QueryError(_)));
    }

    #[test]
    fn occupation_query_inverts_the_relation() {
        let query = build_occupation_query(
            &["Q28640".into(), "Q192581".into()],
            "en.wikipedia.org",
            "en",
        );
        assert!(query.contains("VALUES ?class { wd:Q28640 wd:Q192581 }"));
        assert!(query.contains("?holder wdt:P106 ?item"));
        assert!(query.contains("<https://en.wikipedia.org/>"));
        assert!(!query.contains("P279"));
    }

    #[test]
    fn subclass_query_walks_p279_and_drops_excluded_branches() {
        let query = build_subclass_query(
            "Q28640",
            &["Q786820".into(), "Q515".into()],
            "en.wikipedia.org",
        );
        assert!(query.contains("?class wdt:P279* wd:Q28640 ."));
        assert!(query.contains("FILTER NOT EXISTS { ?class wdt:P279* wd:Q786820 . }"));
        assert!(query.contains("FILTER NOT EXISTS { ?class wdt:P279* wd:Q515 . }"));
        assert!(query.contains("?item wdt:P31 ?class"));
        assert!(query.contains("<https://en.wikipedia.org/>"));
    }

    #[test]
    fn class_bindings_become_entity_ids() {
        let body = br#"{"results": {"bindings": [
            {"class": {"type": "uri", "value": "http://www.wikidata.org/entity/Q28640"}},
            {"class": {"type": "uri", "value": "http://www.wikidata.org/entity/Q39631"}},
            {"other": {"type": "literal", "value": "ignored"}}
        ]}}"#;
        assert_eq!(parse_sparql_classes(body).unwrap(), vec!["Q28640", "Q39631"]);
        assert!(matches!(
            parse_sparql_classes(b"timeout"),
            Err(DiscoveryError::QueryError(_))
        ));
    }

    #[test]
    fn redirect_resolution_follows_exactly_one_hop() {
        let response: ActionQueryResponse = serde_json::from_str(
            r#"{"query": {
                "normalized": [{"from": "registered_nurse", "to": "Registered nurse"}],
                "redirects": [
                    {"from": "Registered nurse", "to": "Nurse"},
                    {"from": "Nurse", "to": "Nursing"}
                ]
            }}"#,
        )
        .unwrap();
        assert_eq!(resolve_one_hop("registered_nurse", &response), "Nurse");
        assert_eq!(resolve_one_hop("Plumber", &ActionQueryResponse::default()), "Plumber");
    }

    #[test]
    fn metrics_items_map_to_periods() {
        let response: MetricsResponse = serde_json::from_str(
            r#"{"items": [
                {"project": "en.wikipedia", "article": "Nurse", "granularity": "monthly",
                 "timestamp": "2025010100", "access": "all-access", "agent": "user", "views": 310},
                {"timestamp": "garbage", "views": 5}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            periods_from_metrics(&response),
            vec![PeriodCount {
                period_start: d(2025, 1, 1),
                views: 310,
            }]
        );
    }

    #[test]
    fn monthly_url_encodes_the_canonical_title() {
        let config = WikimediaConfig::default();
        let window = PageviewWindow {
            start: d(2025, 10, 1),
            end: d(2026, 9, 30),
        };
        assert_eq!(
            config.monthly_url("AC/DC roadie (music)", &window),
            concat!(
                "https://wikimedia.org/api/rest_v1/metrics/pageviews/per-article/",
                "en.wikipedia/all-access/user/AC%2FDC_roadie_%28music%29/monthly/",
                "2025100100/2026093000"
            )
        );
        assert_eq!(config.action_api(), "https://en.wikipedia.org/w/api.php");
    }
}
