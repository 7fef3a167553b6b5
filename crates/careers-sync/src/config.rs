use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use careers_sources::{WikidataConfig, WikimediaConfig};
use careers_storage::{HttpClientConfig, TokenBucketConfig};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub taxonomy_path: PathBuf,
    pub sparql_endpoint: String,
    pub wiki_project: String,
    pub metrics_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub concurrency: usize,
    pub class_batch_size: usize,
    pub pageview_months: u32,
    pub progress_every: usize,
    /// Request budget shared by all upstream calls of a run. Unset means
    /// only the concurrency caps apply.
    pub rate_limit_burst: Option<u32>,
    pub rate_limit_refill_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://careers.db".to_string(),
            taxonomy_path: PathBuf::from("taxonomy.yaml"),
            sparql_endpoint: "https://query.wikidata.org/sparql".to_string(),
            wiki_project: "en.wikipedia.org".to_string(),
            metrics_base: "https://wikimedia.org/api/rest_v1/metrics/pageviews".to_string(),
            user_agent: "careers-pipeline/0.1".to_string(),
            http_timeout_secs: 30,
            query_timeout_secs: 120,
            concurrency: 32,
            class_batch_size: 50,
            pageview_months: 12,
            progress_every: 100,
            rate_limit_burst: None,
            rate_limit_refill_ms: 100,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by environment variables. Numeric variables that
    /// are set but unparsable are configuration errors.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            database_url: env_string("DATABASE_URL", defaults.database_url),
            taxonomy_path: std::env::var("CAREERS_TAXONOMY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.taxonomy_path),
            sparql_endpoint: env_string("CAREERS_SPARQL_ENDPOINT", defaults.sparql_endpoint),
            wiki_project: env_string("CAREERS_WIKI_PROJECT", defaults.wiki_project),
            metrics_base: env_string("CAREERS_METRICS_BASE", defaults.metrics_base),
            user_agent: env_string("CAREERS_USER_AGENT", defaults.user_agent),
            http_timeout_secs: env_parse(
                "CAREERS_HTTP_TIMEOUT_SECS",
                defaults.http_timeout_secs,
            )?,
            query_timeout_secs: env_parse(
                "CAREERS_QUERY_TIMEOUT_SECS",
                defaults.query_timeout_secs,
            )?,
            concurrency: env_parse("CAREERS_CONCURRENCY", defaults.concurrency)?,
            class_batch_size: env_parse("CAREERS_CLASS_BATCH_SIZE", defaults.class_batch_size)?,
            pageview_months: env_parse("CAREERS_PAGEVIEW_MONTHS", defaults.pageview_months)?,
            progress_every: env_parse("CAREERS_PROGRESS_EVERY", defaults.progress_every)?,
            rate_limit_burst: env_parse_opt("CAREERS_RATE_LIMIT_BURST")?,
            rate_limit_refill_ms: env_parse(
                "CAREERS_RATE_LIMIT_REFILL_MS",
                defaults.rate_limit_refill_ms,
            )?,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let concurrency = self.concurrency.max(1);
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: concurrency,
            per_host_concurrency: concurrency,
            token_bucket: self
                .rate_limit_burst
                .filter(|burst| *burst > 0)
                .map(|capacity| TokenBucketConfig {
                    capacity,
                    refill_every: Duration::from_millis(self.rate_limit_refill_ms.max(1)),
                }),
            ..Default::default()
        }
    }

    pub fn wikidata_config(&self) -> WikidataConfig {
        WikidataConfig {
            endpoint: self.sparql_endpoint.clone(),
            wiki_project: self.wiki_project.clone(),
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            class_batch_size: self.class_batch_size.max(1),
        }
    }

    pub fn wikimedia_config(&self) -> WikimediaConfig {
        WikimediaConfig {
            wiki_project: self.wiki_project.clone(),
            metrics_base: self.metrics_base.clone(),
        }
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(env_parse_opt(key)?.unwrap_or(default))
}

fn env_parse_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{key} must be a number, got `{raw}`")),
        _ => Ok(None),
    }
}
